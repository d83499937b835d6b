// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signing, verification and orchestration settings.

use {
    crate::{
        canonical_hash::HashAlgorithm,
        error::ClickOnceCodesignError,
        signing_key::ManifestSigningKey,
        trust::{CrlFetcher, RevocationMode},
    },
    bitflags::bitflags,
    chrono::{DateTime, Utc},
    reqwest::{IntoUrl, Url},
    std::path::{Path, PathBuf},
    x509_certificate::CapturedX509Certificate,
};

/// Which certificates are embedded in a license signature.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChainInclusion {
    /// Only the signing certificate.
    EndCertOnly,
    /// The signing certificate and every chain certificate.
    WholeChain,
    /// The signing certificate and chain certificates other than self-issued roots.
    ExcludeRoot,
}

impl Default for ChainInclusion {
    fn default() -> Self {
        Self::ExcludeRoot
    }
}

/// Settings for signing a single manifest.
///
/// An instance is bound to one signing operation.
#[derive(Clone)]
pub struct SigningSettings<'key> {
    signing_key: Option<&'key dyn ManifestSigningKey>,
    signing_certificate: Option<CapturedX509Certificate>,
    certificates: Vec<CapturedX509Certificate>,
    hash_algorithm: HashAlgorithm,
    chain_inclusion: ChainInclusion,
    description: Option<String>,
    description_url: Option<String>,
    replace_public_key_token: bool,
    time_stamp_url: Option<Url>,
}

impl<'key> Default for SigningSettings<'key> {
    fn default() -> Self {
        Self {
            signing_key: None,
            signing_certificate: None,
            certificates: vec![],
            hash_algorithm: HashAlgorithm::default(),
            chain_inclusion: ChainInclusion::default(),
            description: None,
            description_url: None,
            replace_public_key_token: true,
            time_stamp_url: None,
        }
    }
}

impl<'key> SigningSettings<'key> {
    /// Obtain the signing key.
    pub fn signing_key(&self) -> Option<&'key dyn ManifestSigningKey> {
        self.signing_key
    }

    /// Set the key producing the strong name signature.
    pub fn set_signing_key(&mut self, private: &'key dyn ManifestSigningKey) {
        self.signing_key = Some(private);
    }

    /// Obtain the publisher certificate.
    pub fn signing_certificate(&self) -> Option<&CapturedX509Certificate> {
        self.signing_certificate.as_ref()
    }

    /// Set the publisher certificate.
    ///
    /// When a certificate is present, signing adds a publisher identity and an
    /// Authenticode signed license. Without one only a strong name signature
    /// is produced.
    pub fn set_signing_certificate(&mut self, cert: CapturedX509Certificate) {
        self.signing_certificate = Some(cert);
    }

    /// Obtain the certificate chain.
    pub fn certificate_chain(&self) -> &[CapturedX509Certificate] {
        &self.certificates
    }

    /// Add a parsed certificate to the signing certificate chain.
    pub fn chain_certificate(&mut self, cert: CapturedX509Certificate) {
        self.certificates.push(cert);
    }

    /// Add a PEM encoded X.509 certificate to the signing certificate chain.
    pub fn chain_certificate_pem(
        &mut self,
        data: impl AsRef<[u8]>,
    ) -> Result<(), ClickOnceCodesignError> {
        self.chain_certificate(CapturedX509Certificate::from_pem(data.as_ref())?);

        Ok(())
    }

    pub fn hash_algorithm(&self) -> HashAlgorithm {
        self.hash_algorithm
    }

    /// Set the hash algorithm used for every digest and signature.
    ///
    /// The default is SHA-256. SHA-1 produces manifests readable by old runtimes.
    pub fn set_hash_algorithm(&mut self, algorithm: HashAlgorithm) {
        self.hash_algorithm = algorithm;
    }

    pub fn chain_inclusion(&self) -> ChainInclusion {
        self.chain_inclusion
    }

    pub fn set_chain_inclusion(&mut self, inclusion: ChainInclusion) {
        self.chain_inclusion = inclusion;
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn set_description(&mut self, value: impl ToString) {
        self.description = Some(value.to_string());
    }

    pub fn description_url(&self) -> Option<&str> {
        self.description_url.as_deref()
    }

    pub fn set_description_url(&mut self, value: impl ToString) {
        self.description_url = Some(value.to_string());
    }

    /// Whether `publicKeyToken` is rewritten to match the signing key.
    pub fn replace_public_key_token(&self) -> bool {
        self.replace_public_key_token
    }

    pub fn set_replace_public_key_token(&mut self, value: bool) {
        self.replace_public_key_token = value;
    }

    /// Obtain the Time-Stamp Protocol server URL.
    pub fn time_stamp_url(&self) -> Option<&Url> {
        self.time_stamp_url.as_ref()
    }

    /// Set the Time-Stamp Protocol server URL used to time-stamp license signatures.
    pub fn set_time_stamp_url(&mut self, url: impl IntoUrl) -> Result<(), ClickOnceCodesignError> {
        self.time_stamp_url = Some(url.into_url()?);

        Ok(())
    }

    /// Certificates to embed in a license signature, signing certificate first.
    pub fn license_certificates(&self) -> Vec<&CapturedX509Certificate> {
        let mut certs = vec![];

        if let Some(cert) = &self.signing_certificate {
            certs.push(cert);

            match self.chain_inclusion {
                ChainInclusion::EndCertOnly => {}
                ChainInclusion::WholeChain => certs.extend(self.certificates.iter()),
                ChainInclusion::ExcludeRoot => certs.extend(
                    self.certificates
                        .iter()
                        .filter(|c| !c.subject_is_issuer()),
                ),
            }
        }

        certs
    }
}

bitflags! {
    /// Flags controlling manifest verification.
    pub struct VerifyFlags: u32 {
        /// Do not check certificate revocation.
        const REVOCATION_NO_CHECK = 0x0001;
        /// Check revocation of the signing certificate only.
        const REVOCATION_END_CERT_ONLY = 0x0002;
        /// Check revocation of every certificate in the chain.
        const REVOCATION_ENTIRE_CHAIN = 0x0004;
        /// Treat every signature as lifetime signed, ignoring time-stamps.
        const LIFETIME_SIGNING = 0x0008;
        /// Only verify the strong name signature.
        const STRONG_NAME_ONLY = 0x0010;
    }
}

impl Default for VerifyFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Settings for verifying a manifest.
#[derive(Clone, Default)]
pub struct VerificationSettings<'a> {
    flags: VerifyFlags,
    trust_anchors: Vec<CapturedX509Certificate>,
    trusted_publishers: Vec<CapturedX509Certificate>,
    disallowed: Vec<CapturedX509Certificate>,
    verification_time: Option<DateTime<Utc>>,
    crl_fetcher: Option<&'a dyn CrlFetcher>,
}

impl<'a> VerificationSettings<'a> {
    pub fn flags(&self) -> VerifyFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: VerifyFlags) {
        self.flags = flags;
    }

    /// Revocation mode derived from the flags.
    ///
    /// Without a revocation flag the entire chain is checked.
    pub fn revocation_mode(&self) -> RevocationMode {
        if self.flags.contains(VerifyFlags::REVOCATION_NO_CHECK) {
            RevocationMode::NoCheck
        } else if self.flags.contains(VerifyFlags::REVOCATION_END_CERT_ONLY) {
            RevocationMode::EndCertOnly
        } else {
            RevocationMode::EntireChain
        }
    }

    pub fn trust_anchors(&self) -> &[CapturedX509Certificate] {
        &self.trust_anchors
    }

    /// Trust a root certificate.
    pub fn add_trust_anchor(&mut self, cert: CapturedX509Certificate) {
        self.trust_anchors.push(cert);
    }

    pub fn trusted_publishers(&self) -> &[CapturedX509Certificate] {
        &self.trusted_publishers
    }

    /// Trust license signatures made with a publisher certificate.
    pub fn add_trusted_publisher(&mut self, cert: CapturedX509Certificate) {
        self.trusted_publishers.push(cert);
    }

    pub fn disallowed(&self) -> &[CapturedX509Certificate] {
        &self.disallowed
    }

    /// Explicitly distrust a certificate.
    pub fn add_disallowed(&mut self, cert: CapturedX509Certificate) {
        self.disallowed.push(cert);
    }

    /// Time certificate validity is evaluated at, absent a time-stamp.
    ///
    /// Defaults to the current time.
    pub fn verification_time(&self) -> DateTime<Utc> {
        self.verification_time.unwrap_or_else(Utc::now)
    }

    pub fn set_verification_time(&mut self, time: DateTime<Utc>) {
        self.verification_time = Some(time);
    }

    pub fn crl_fetcher(&self) -> Option<&'a dyn CrlFetcher> {
        self.crl_fetcher
    }

    pub fn set_crl_fetcher(&mut self, fetcher: &'a dyn CrlFetcher) {
        self.crl_fetcher = Some(fetcher);
    }
}

/// Settings for signing a whole deployment.
#[derive(Clone, Debug)]
pub struct OrchestratorSettings {
    publisher: Option<String>,
    support_url: Option<String>,
    no_sign_dependencies: bool,
    no_update_manifest: bool,
    time_stamp_retries: u32,
    update_tool_path: PathBuf,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            publisher: None,
            support_url: None,
            no_sign_dependencies: false,
            no_update_manifest: false,
            time_stamp_retries: 3,
            update_tool_path: PathBuf::from("mage"),
        }
    }
}

impl OrchestratorSettings {
    /// Publisher name given to the update tool.
    pub fn publisher(&self) -> Option<&str> {
        self.publisher.as_deref()
    }

    pub fn set_publisher(&mut self, value: impl ToString) {
        self.publisher = Some(value.to_string());
    }

    /// URL given to the update tool as `-SupportURL`.
    pub fn support_url(&self) -> Option<&str> {
        self.support_url.as_deref()
    }

    pub fn set_support_url(&mut self, value: impl ToString) {
        self.support_url = Some(value.to_string());
    }

    /// Whether payload files and the application manifest are left unsigned.
    pub fn no_sign_dependencies(&self) -> bool {
        self.no_sign_dependencies
    }

    pub fn set_no_sign_dependencies(&mut self, value: bool) {
        self.no_sign_dependencies = value;
    }

    /// Whether manifests are signed without discovering payload or updating metadata.
    pub fn no_update_manifest(&self) -> bool {
        self.no_update_manifest
    }

    pub fn set_no_update_manifest(&mut self, value: bool) {
        self.no_update_manifest = value;
    }

    /// Attempts made for a signing step failing with a time-stamp error.
    pub fn time_stamp_retries(&self) -> u32 {
        self.time_stamp_retries
    }

    pub fn set_time_stamp_retries(&mut self, value: u32) {
        self.time_stamp_retries = value;
    }

    pub fn update_tool_path(&self) -> &Path {
        &self.update_tool_path
    }

    pub fn set_update_tool_path(&mut self, path: impl AsRef<Path>) {
        self.update_tool_path = path.as_ref().to_path_buf();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const CA_PEM: &str = include_str!("testdata/ca.pem");
    const SIGNER_PEM: &str = include_str!("testdata/signer.pem");

    #[test]
    fn license_certificate_inclusion() -> Result<(), ClickOnceCodesignError> {
        let mut settings = SigningSettings::default();
        assert!(settings.replace_public_key_token());
        assert_eq!(settings.hash_algorithm(), HashAlgorithm::Sha256);
        assert!(settings.license_certificates().is_empty());

        settings.set_signing_certificate(CapturedX509Certificate::from_pem(SIGNER_PEM)?);
        settings.chain_certificate_pem(CA_PEM)?;

        assert_eq!(settings.license_certificates().len(), 1);

        settings.set_chain_inclusion(ChainInclusion::WholeChain);
        assert_eq!(settings.license_certificates().len(), 2);

        settings.set_chain_inclusion(ChainInclusion::EndCertOnly);
        assert_eq!(settings.license_certificates().len(), 1);

        Ok(())
    }

    #[test]
    fn revocation_mode_from_flags() {
        let mut settings = VerificationSettings::default();
        assert_eq!(settings.revocation_mode(), RevocationMode::EntireChain);

        settings.set_flags(VerifyFlags::REVOCATION_END_CERT_ONLY | VerifyFlags::LIFETIME_SIGNING);
        assert_eq!(settings.revocation_mode(), RevocationMode::EndCertOnly);

        settings.set_flags(VerifyFlags::REVOCATION_NO_CHECK | VerifyFlags::REVOCATION_ENTIRE_CHAIN);
        assert_eq!(settings.revocation_mode(), RevocationMode::NoCheck);
    }

    #[test]
    fn time_stamp_url_validated() {
        let mut settings = SigningSettings::default();
        assert!(settings.set_time_stamp_url("not a url").is_err());
        settings
            .set_time_stamp_url("http://timestamp.example.test")
            .unwrap();
        assert_eq!(
            settings.time_stamp_url().map(|u| u.as_str()),
            Some("http://timestamp.example.test/")
        );
    }
}
