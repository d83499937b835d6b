// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Verification of signed manifests.

[ManifestVerifier] checks a manifest's strong name signature and, unless
[VerifyFlags::STRONG_NAME_ONLY] is set, the publisher license embedded in
it. Every failure is reported as a [ClickOnceCodesignError::Verification]
carrying a [VerificationFailure] reason. There is no partial success.
*/

use {
    crate::{
        canonical_hash::{match_manifest_hash, HashAlgorithm, HashFormat},
        canonicalization::{canonicalize_document, canonicalize_element},
        document::Document,
        error::{ClickOnceCodesignError, VerificationFailure},
        license::{identity_attributes, publisher_subject_name, ParsedLicense},
        manifest::{assembly_identity, ASM_V2_NAMESPACE},
        manifest_signing::{STRONG_NAME_KEY_INFO_ID, STRONG_NAME_SIGNATURE_ID},
        signature::{ParsedSignature, DEFAULT_ID_ATTRIBUTES, DSIG_NAMESPACE},
        signing_settings::{VerificationSettings, VerifyFlags},
        strong_name::{PortableStrongNamePrimitives, StrongNamePrimitives},
        time_stamp::{verify_time_stamp_token, VerifiedTimeStamp},
        trust::{
            build_chain, check_chain_revocation, check_validity, has_lifetime_signing_eku,
            has_time_stamping_eku, same_certificate, CrlFetcher, HttpCrlFetcher, RevocationMode,
        },
    },
    log::{debug, info, warn},
    rsa::RsaPublicKey,
    std::path::Path,
    x509_certificate::CapturedX509Certificate,
};

fn failure(reason: VerificationFailure, message: impl ToString) -> ClickOnceCodesignError {
    ClickOnceCodesignError::verification(reason, message)
}

/// Result of verifying a publisher license.
#[derive(Clone, Debug)]
pub struct PublisherVerification {
    /// Certificate that signed the license.
    pub certificate: CapturedX509Certificate,
    /// Chain from the signing certificate to its trust anchor.
    pub chain: Vec<CapturedX509Certificate>,
    /// Publisher subject declared by the license.
    pub subject: String,
    /// Normalization under which the manifest hash matched.
    pub hash_format: HashFormat,
    pub time_stamp: Option<VerifiedTimeStamp>,
}

/// A successfully verified manifest.
#[derive(Clone, Debug)]
pub struct VerificationOutcome {
    pub algorithm: HashAlgorithm,
    /// Whether the strong name signature uses the older two-reference form.
    pub legacy_signature_form: bool,
    pub public_key_token: String,
    /// Present unless only the strong name was verified.
    pub publisher: Option<PublisherVerification>,
}

/// Verifies manifest signatures according to [VerificationSettings].
pub struct ManifestVerifier<'a> {
    settings: &'a VerificationSettings<'a>,
    primitives: &'a dyn StrongNamePrimitives,
    id_attributes: Vec<String>,
}

impl<'a> ManifestVerifier<'a> {
    pub fn new(settings: &'a VerificationSettings<'a>) -> Self {
        Self {
            settings,
            primitives: &PortableStrongNamePrimitives,
            id_attributes: DEFAULT_ID_ATTRIBUTES.iter().map(|x| x.to_string()).collect(),
        }
    }

    pub fn with_primitives(mut self, primitives: &'a dyn StrongNamePrimitives) -> Self {
        self.primitives = primitives;
        self
    }

    /// Set the attribute names recognized as signature IDs.
    pub fn with_id_attributes(mut self, attributes: &[&str]) -> Self {
        self.id_attributes = attributes.iter().map(|x| x.to_string()).collect();
        self
    }

    fn id_attributes(&self) -> Vec<&str> {
        self.id_attributes.iter().map(|x| x.as_str()).collect()
    }

    /// Verify a manifest file.
    pub fn verify_path(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<VerificationOutcome, ClickOnceCodesignError> {
        info!("verifying {}", path.as_ref().display());
        self.verify_document(&Document::from_path(path)?)
    }

    /// Verify a parsed manifest.
    pub fn verify_document(
        &self,
        document: &Document,
    ) -> Result<VerificationOutcome, ClickOnceCodesignError> {
        let id_attributes = self.id_attributes();

        let element = document
            .root
            .child(&[DSIG_NAMESPACE], "Signature")
            .ok_or_else(|| failure(VerificationFailure::NoSignature, "manifest is not signed"))?;
        let signature = ParsedSignature::from_element(element, &id_attributes)?;

        let (algorithm, legacy_signature_form) = self.check_form(&signature)?;
        if legacy_signature_form {
            warn!("manifest uses the legacy strong name signature form");
        }

        let public_key = signature.public_key()?;
        self.verify_strong_name(document, &signature, algorithm, &public_key)?;

        let publisher = if self.settings.flags().contains(VerifyFlags::STRONG_NAME_ONLY) {
            None
        } else {
            let license = signature
                .key_info
                .as_ref()
                .map(|key_info| ParsedLicense::from_key_info(key_info, &id_attributes))
                .transpose()?
                .flatten()
                .ok_or_else(|| {
                    failure(
                        VerificationFailure::NoSignature,
                        "manifest has no publisher license",
                    )
                })?;

            Some(self.verify_license(document, &license)?)
        };

        let public_key_token = self.primitives.public_key_token(&public_key)?;
        let declared = assembly_identity(&document.root)?
            .attribute("publicKeyToken")
            .unwrap_or_default();
        if !declared.eq_ignore_ascii_case(&public_key_token) {
            return Err(failure(
                VerificationFailure::Fail,
                format!(
                    "publicKeyToken {} does not match signing key token {}",
                    declared, public_key_token
                ),
            ));
        }

        info!("manifest signature is valid");

        Ok(VerificationOutcome {
            algorithm,
            legacy_signature_form,
            public_key_token,
            publisher,
        })
    }

    /// Validate the shape of the strong name signature.
    ///
    /// Returns the algorithm and whether the legacy form is used.
    fn check_form(
        &self,
        signature: &ParsedSignature,
    ) -> Result<(HashAlgorithm, bool), ClickOnceCodesignError> {
        let form_error = |message: &str| failure(VerificationFailure::SubjectFormUnknown, message);

        if signature.id.as_deref() != Some(STRONG_NAME_SIGNATURE_ID) {
            return Err(form_error("signature is not a strong name signature"));
        }

        let algorithm = signature.algorithm()?;

        let mut document_references = 0;
        let mut legacy = false;

        for reference in &signature.references {
            match reference.uri.as_deref() {
                Some("") if reference.is_enveloped_c14n() => document_references += 1,
                Some(uri)
                    if uri.strip_prefix('#') == Some(STRONG_NAME_KEY_INFO_ID)
                        && !legacy =>
                {
                    legacy = true
                }
                _ => return Err(form_error("unexpected strong name signature reference")),
            }
        }

        if document_references != 1 {
            return Err(form_error(
                "strong name signature must reference the manifest exactly once",
            ));
        }

        Ok((algorithm, legacy))
    }

    fn verify_strong_name(
        &self,
        document: &Document,
        signature: &ParsedSignature,
        algorithm: HashAlgorithm,
        public_key: &RsaPublicKey,
    ) -> Result<(), ClickOnceCodesignError> {
        let mut content = document.clone();
        content.root.remove_children(&[DSIG_NAMESPACE], "Signature");

        let reference = signature
            .document_reference()
            .ok_or_else(|| failure(VerificationFailure::SubjectFormUnknown, "no document reference"))?;

        let normalized = content.reparsed()?;
        if reference
            .verify_digest(algorithm, &canonicalize_document(&normalized))
            .is_err()
        {
            debug!("manifest digest does not match normalized form; trying document as given");
            reference.verify_digest(algorithm, &canonicalize_document(&content))?;
            warn!("manifest digest matched only the legacy normalization");
        }

        for reference in signature
            .references
            .iter()
            .filter(|r| r.uri.as_deref() != Some(""))
        {
            let key_info = signature
                .key_info
                .as_ref()
                .filter(|ki| {
                    self.id_attributes()
                        .iter()
                        .any(|name| ki.attribute(name) == Some(STRONG_NAME_KEY_INFO_ID))
                })
                .ok_or_else(|| {
                    failure(
                        VerificationFailure::SubjectFormUnknown,
                        "referenced KeyInfo not found",
                    )
                })?;

            reference.verify_digest(algorithm, &canonicalize_element(key_info))?;
        }

        signature.verify_signed_info(algorithm, public_key)
    }

    /// Establish trust in the authority that issued a time-stamp.
    ///
    /// The authority's certificate must chain to a trust anchor, carry the
    /// time-stamping extended key usage and be valid at the asserted time.
    fn check_time_stamp_authority(
        &self,
        time_stamp: &VerifiedTimeStamp,
    ) -> Result<(), ClickOnceCodesignError> {
        let chain = build_chain(
            &time_stamp.signer,
            &time_stamp.certificates,
            self.settings.trust_anchors(),
            &[],
        )?;

        if !has_time_stamping_eku(&time_stamp.signer)? {
            return Err(failure(
                VerificationFailure::SubjectNotTrusted,
                "time-stamp signer is not a time-stamping certificate",
            ));
        }

        check_validity(&chain, time_stamp.time)
    }

    fn verify_license(
        &self,
        document: &Document,
        license: &ParsedLicense,
    ) -> Result<PublisherVerification, ClickOnceCodesignError> {
        let settings = self.settings;

        if license.identity != identity_attributes(assembly_identity(&document.root)?) {
            return Err(failure(
                VerificationFailure::Fail,
                "license identity does not match the manifest identity",
            ));
        }

        let certificate = license.verify_signature()?.clone();

        if settings
            .disallowed()
            .iter()
            .any(|c| same_certificate(c, &certificate))
        {
            return Err(failure(
                VerificationFailure::ExplicitlyDistrusted,
                "publisher certificate is explicitly distrusted",
            ));
        }

        if !settings
            .trusted_publishers()
            .iter()
            .any(|c| same_certificate(c, &certificate))
        {
            return Err(failure(
                VerificationFailure::SubjectNotTrusted,
                "publisher certificate is not a trusted publisher",
            ));
        }

        let subject = publisher_subject_name(&certificate)?;
        if license.publisher_subject.as_deref() != Some(subject.as_str()) {
            return Err(failure(
                VerificationFailure::SubjectNotTrusted,
                format!(
                    "license publisher {} does not match certificate subject {}",
                    license.publisher_subject.as_deref().unwrap_or_default(),
                    subject
                ),
            ));
        }

        if let Some(publisher) = document
            .root
            .child(&[ASM_V2_NAMESPACE], "publisherIdentity")
        {
            if publisher.attribute("name") != Some(subject.as_str()) {
                return Err(failure(
                    VerificationFailure::Fail,
                    "publisherIdentity does not match the license publisher",
                ));
            }
        }

        let chain = build_chain(
            &certificate,
            &license.certificates,
            settings.trust_anchors(),
            settings.trusted_publishers(),
        )?;

        let time_stamp = license
            .time_stamp_token
            .as_ref()
            .map(|token| verify_time_stamp_token(token, license.signature_value()))
            .transpose()?
            .and_then(|time_stamp| match self.check_time_stamp_authority(&time_stamp) {
                Ok(()) => Some(time_stamp),
                Err(e) => {
                    warn!("ignoring time-stamp: {}", e);
                    None
                }
            });

        let lifetime_signing = settings.flags().contains(VerifyFlags::LIFETIME_SIGNING)
            || has_lifetime_signing_eku(&certificate)?;

        let validity_time = match &time_stamp {
            Some(time_stamp) if !lifetime_signing => {
                debug!("evaluating certificate validity at time-stamp {}", time_stamp.time);
                time_stamp.time
            }
            _ => settings.verification_time(),
        };
        check_validity(&chain, validity_time)?;

        let mode = settings.revocation_mode();
        if mode != RevocationMode::NoCheck {
            let http_fetcher;
            let fetcher: &dyn CrlFetcher = match settings.crl_fetcher() {
                Some(fetcher) => fetcher,
                None => {
                    http_fetcher = HttpCrlFetcher::new()?;
                    &http_fetcher
                }
            };
            check_chain_revocation(&chain, mode, fetcher)?;
        }

        let algorithm = license.signature.algorithm()?;
        let hash_format =
            match_manifest_hash(document, algorithm, &license.hash)?.ok_or_else(|| {
                failure(
                    VerificationFailure::BadDigest,
                    "manifest hash does not match the license",
                )
            })?;
        if hash_format == HashFormat::Legacy {
            warn!("manifest hash matched only the legacy normalization");
        }

        Ok(PublisherVerification {
            certificate,
            chain,
            subject,
            hash_format,
            time_stamp,
        })
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{
            document::Element,
            manifest::test::{APPLICATION, DEPLOYMENT},
            manifest_signing::ManifestSigner,
            signature::{rsa_key_value, XmlSigner},
            signing_key::{ManifestSigningKey, RsaSigningKey, SigningProvider},
            signing_settings::SigningSettings,
            time_stamp::{test::issue_token, TimeStampClient},
            trust::test::{
                crl_fetcher, CA_PEM, EMPTY_CRL, REVOKED_CRL, SELF_SIGNED_PEM, SIGNER_PEM,
                TSA_PEM,
            },
        },
        chrono::{DateTime, TimeZone, Utc},
        reqwest::Url,
    };

    const SIGNER_PKCS8_DER: &[u8] = include_bytes!("testdata/signer.pk8");

    fn key() -> RsaSigningKey {
        RsaSigningKey::from_pkcs8_der(SIGNER_PKCS8_DER).unwrap()
    }

    fn sign(
        source: &str,
        settings: &SigningSettings,
    ) -> Result<Document, ClickOnceCodesignError> {
        let mut document = Document::parse(source.as_bytes())?;
        ManifestSigner::new(settings).sign_document(&mut document)?;

        document.reparsed()
    }

    fn verification_settings<'a>() -> VerificationSettings<'a> {
        let mut settings = VerificationSettings::default();
        settings.set_verification_time(Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap());
        settings
    }

    /// Issues tokens for a fixed time under a fixed certificate.
    struct IssuingTimeStampClient {
        time: DateTime<Utc>,
        tsa_pem: &'static str,
    }

    impl TimeStampClient for IssuingTimeStampClient {
        fn time_stamp(
            &self,
            message: &[u8],
            _url: &Url,
            _algorithm: HashAlgorithm,
        ) -> Result<Vec<u8>, ClickOnceCodesignError> {
            Ok(issue_token(message, self.time, self.tsa_pem))
        }
    }

    /// Sign the deployment manifest under the CA issued publisher, time-stamped in 2030.
    fn sign_time_stamped(tsa_pem: &'static str) -> Result<Document, ClickOnceCodesignError> {
        let key = key();
        let mut signing = SigningSettings::default();
        signing.set_signing_key(&key);
        signing.set_signing_certificate(CapturedX509Certificate::from_pem(SIGNER_PEM)?);
        signing.chain_certificate(CapturedX509Certificate::from_pem(CA_PEM)?);
        signing.set_time_stamp_url("http://timestamp.clickonce.test")?;

        let client = IssuingTimeStampClient {
            time: Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap(),
            tsa_pem,
        };

        let mut document = Document::parse(DEPLOYMENT.as_bytes())?;
        ManifestSigner::new(&signing)
            .with_time_stamp_client(&client)
            .sign_document(&mut document)?;

        document.reparsed()
    }

    /// Trusts the publisher chain, checking at 2040 after the publisher expired.
    fn after_expiry_settings<'a>() -> Result<VerificationSettings<'a>, ClickOnceCodesignError> {
        let mut settings = verification_settings();
        settings.add_trust_anchor(CapturedX509Certificate::from_pem(CA_PEM)?);
        settings.add_trusted_publisher(CapturedX509Certificate::from_pem(SIGNER_PEM)?);
        settings.set_flags(VerifyFlags::REVOCATION_NO_CHECK);
        settings.set_verification_time(Utc.with_ymd_and_hms(2040, 1, 1, 0, 0, 0).unwrap());

        Ok(settings)
    }

    fn reason(result: Result<VerificationOutcome, ClickOnceCodesignError>) -> VerificationFailure {
        result
            .unwrap_err()
            .verification_failure()
            .expect("verification failure")
    }

    #[test]
    fn strong_name_round_trip() -> Result<(), ClickOnceCodesignError> {
        let key = key();

        for algorithm in [HashAlgorithm::Sha1, HashAlgorithm::Sha256] {
            let mut signing = SigningSettings::default();
            signing.set_signing_key(&key);
            signing.set_hash_algorithm(algorithm);

            for source in [APPLICATION, DEPLOYMENT] {
                let document = sign(source, &signing)?;

                let mut settings = verification_settings();
                settings.set_flags(VerifyFlags::STRONG_NAME_ONLY);
                let outcome = ManifestVerifier::new(&settings).verify_document(&document)?;

                assert_eq!(outcome.algorithm, algorithm);
                assert!(!outcome.legacy_signature_form);
                assert!(outcome.publisher.is_none());
                assert_eq!(
                    outcome.public_key_token,
                    crate::strong_name::public_key_token(&key.rsa_public_key()?)?
                );

                // A license is required without STRONG_NAME_ONLY.
                let settings = verification_settings();
                assert_eq!(
                    reason(ManifestVerifier::new(&settings).verify_document(&document)),
                    VerificationFailure::NoSignature
                );
            }
        }

        Ok(())
    }

    #[test]
    fn self_signed_publisher() -> Result<(), ClickOnceCodesignError> {
        let key = key();
        let cert = CapturedX509Certificate::from_pem(SELF_SIGNED_PEM)?;
        let mut signing = SigningSettings::default();
        signing.set_signing_key(&key);
        signing.set_signing_certificate(cert.clone());

        let document = sign(APPLICATION, &signing)?;

        let mut settings = verification_settings();
        settings.add_trusted_publisher(cert.clone());
        let outcome = ManifestVerifier::new(&settings).verify_document(&document)?;

        let publisher = outcome.publisher.expect("publisher verified");
        assert!(same_certificate(&publisher.certificate, &cert));
        assert_eq!(publisher.chain.len(), 1);
        assert_eq!(publisher.hash_format, HashFormat::Current);
        assert!(publisher.time_stamp.is_none());
        assert_eq!(publisher.subject, "CN=Contoso Self Signed");

        // Not on the trust list.
        let settings = verification_settings();
        assert_eq!(
            reason(ManifestVerifier::new(&settings).verify_document(&document)),
            VerificationFailure::SubjectNotTrusted
        );

        // Disallowed wins over trusted.
        let mut settings = verification_settings();
        settings.add_trusted_publisher(cert.clone());
        settings.add_disallowed(cert);
        assert_eq!(
            reason(ManifestVerifier::new(&settings).verify_document(&document)),
            VerificationFailure::ExplicitlyDistrusted
        );

        Ok(())
    }

    #[test]
    fn chained_publisher_and_revocation() -> Result<(), ClickOnceCodesignError> {
        let key = key();
        let cert = CapturedX509Certificate::from_pem(SIGNER_PEM)?;
        let ca = CapturedX509Certificate::from_pem(CA_PEM)?;

        let mut signing = SigningSettings::default();
        signing.set_signing_key(&key);
        signing.set_signing_certificate(cert.clone());
        signing.chain_certificate(ca.clone());
        let document = sign(DEPLOYMENT, &signing)?;

        let empty = crl_fetcher(EMPTY_CRL);
        let mut settings = verification_settings();
        settings.add_trust_anchor(ca.clone());
        settings.add_trusted_publisher(cert.clone());
        settings.set_crl_fetcher(&empty);
        let outcome = ManifestVerifier::new(&settings).verify_document(&document)?;
        assert_eq!(outcome.publisher.expect("publisher").chain.len(), 2);

        let revoked = crl_fetcher(REVOKED_CRL);
        let mut settings = verification_settings();
        settings.add_trust_anchor(ca.clone());
        settings.add_trusted_publisher(cert.clone());
        settings.set_crl_fetcher(&revoked);
        assert_eq!(
            reason(ManifestVerifier::new(&settings).verify_document(&document)),
            VerificationFailure::ExplicitlyDistrusted
        );

        settings.set_flags(VerifyFlags::REVOCATION_NO_CHECK);
        ManifestVerifier::new(&settings).verify_document(&document)?;

        // Without the root anchor the chain is untrusted.
        let mut settings = verification_settings();
        settings.add_trusted_publisher(cert.clone());
        settings.set_flags(VerifyFlags::REVOCATION_NO_CHECK);
        assert_eq!(
            reason(ManifestVerifier::new(&settings).verify_document(&document)),
            VerificationFailure::SubjectNotTrusted
        );

        // Expired at verification time.
        let mut settings = verification_settings();
        settings.add_trust_anchor(ca);
        settings.add_trusted_publisher(cert);
        settings.set_flags(VerifyFlags::REVOCATION_NO_CHECK);
        settings.set_verification_time(Utc.with_ymd_and_hms(2040, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(
            reason(ManifestVerifier::new(&settings).verify_document(&document)),
            VerificationFailure::SubjectNotTrusted
        );

        Ok(())
    }

    #[test]
    fn missing_signature() -> Result<(), ClickOnceCodesignError> {
        let document = Document::parse(APPLICATION.as_bytes())?;
        let settings = verification_settings();

        assert_eq!(
            reason(ManifestVerifier::new(&settings).verify_document(&document)),
            VerificationFailure::NoSignature
        );

        Ok(())
    }

    #[test]
    fn tampered_body_is_bad_digest() -> Result<(), ClickOnceCodesignError> {
        let key = key();
        let cert = CapturedX509Certificate::from_pem(SELF_SIGNED_PEM)?;
        let mut signing = SigningSettings::default();
        signing.set_signing_key(&key);
        signing.set_signing_certificate(cert.clone());

        let document = sign(APPLICATION, &signing)?;
        let xml = String::from_utf8(document.to_xml().unwrap()).unwrap();
        let tampered = Document::parse(
            xml.replace("parameters=\"\"", "parameters=\"-x\"").as_bytes(),
        )?;

        let mut settings = verification_settings();
        settings.add_trusted_publisher(cert);
        assert_eq!(
            reason(ManifestVerifier::new(&settings).verify_document(&tampered)),
            VerificationFailure::BadDigest
        );

        Ok(())
    }

    #[test]
    fn stale_token_fails() -> Result<(), ClickOnceCodesignError> {
        let key = key();
        let mut signing = SigningSettings::default();
        signing.set_signing_key(&key);
        signing.set_replace_public_key_token(false);

        let document = sign(APPLICATION, &signing)?;
        let mut settings = verification_settings();
        settings.set_flags(VerifyFlags::STRONG_NAME_ONLY);

        assert_eq!(
            reason(ManifestVerifier::new(&settings).verify_document(&document)),
            VerificationFailure::Fail
        );

        Ok(())
    }

    #[test]
    fn unexpected_signature_id() -> Result<(), ClickOnceCodesignError> {
        let key = key();
        let mut signing = SigningSettings::default();
        signing.set_signing_key(&key);

        let mut document = sign(APPLICATION, &signing)?;
        document
            .root
            .child_mut(&[DSIG_NAMESPACE], "Signature")
            .unwrap()
            .set_attribute("Id", "OtherSignature");

        let mut settings = verification_settings();
        settings.set_flags(VerifyFlags::STRONG_NAME_ONLY);
        assert_eq!(
            reason(ManifestVerifier::new(&settings).verify_document(&document)),
            VerificationFailure::SubjectFormUnknown
        );

        Ok(())
    }

    #[test]
    fn legacy_key_info_reference() -> Result<(), ClickOnceCodesignError> {
        let key = key();
        let mut signing = SigningSettings::default();
        signing.set_signing_key(&key);
        signing.set_hash_algorithm(HashAlgorithm::Sha1);

        // Sign normally for the token, then replace the signature with the
        // two-reference form.
        let mut document = sign(APPLICATION, &signing)?;
        document.root.remove_children(&[DSIG_NAMESPACE], "Signature");

        let provider = SigningProvider::for_algorithm(&key, HashAlgorithm::Sha1)?;
        let signer = XmlSigner::new(HashAlgorithm::Sha1);
        let key_info = Element::new_ns(None, "KeyInfo", DSIG_NAMESPACE)
            .with_namespace_declaration(None, DSIG_NAMESPACE)
            .with_attribute("Id", STRONG_NAME_KEY_INFO_ID)
            .with_child(rsa_key_value(&key.rsa_public_key()?));
        let references = [
            signer.enveloped_reference(&canonicalize_document(&document)),
            signer.element_reference(STRONG_NAME_KEY_INFO_ID, &key_info),
        ];
        let signature = signer.sign(&provider, STRONG_NAME_SIGNATURE_ID, &references, key_info)?;
        document.root.push(signature);
        let document = document.reparsed()?;

        let mut settings = verification_settings();
        settings.set_flags(VerifyFlags::STRONG_NAME_ONLY);
        let outcome = ManifestVerifier::new(&settings).verify_document(&document)?;
        assert!(outcome.legacy_signature_form);

        Ok(())
    }

    #[test]
    fn trusted_time_stamp_extends_validity() -> Result<(), ClickOnceCodesignError> {
        let document = sign_time_stamped(TSA_PEM)?;

        let mut settings = after_expiry_settings()?;
        settings.add_trust_anchor(CapturedX509Certificate::from_pem(TSA_PEM)?);
        let outcome = ManifestVerifier::new(&settings).verify_document(&document)?;
        let time_stamp = outcome
            .publisher
            .expect("publisher")
            .time_stamp
            .expect("time-stamp");
        assert_eq!(time_stamp.time, Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap());

        // The authority must be trusted for its time to count.
        let settings = after_expiry_settings()?;
        assert_eq!(
            reason(ManifestVerifier::new(&settings).verify_document(&document)),
            VerificationFailure::SubjectNotTrusted
        );

        Ok(())
    }

    #[test]
    fn time_stamp_from_non_authority_ignored() -> Result<(), ClickOnceCodesignError> {
        // Signed with the publisher's own key under a certificate without the
        // time-stamping usage, backdated to before the publisher expired.
        let document = sign_time_stamped(SELF_SIGNED_PEM)?;

        let mut settings = after_expiry_settings()?;
        settings.add_trust_anchor(CapturedX509Certificate::from_pem(SELF_SIGNED_PEM)?);
        assert_eq!(
            reason(ManifestVerifier::new(&settings).verify_document(&document)),
            VerificationFailure::SubjectNotTrusted
        );

        // While the publisher is valid the signature holds but the time is not reported.
        let mut settings = verification_settings();
        settings.add_trust_anchor(CapturedX509Certificate::from_pem(CA_PEM)?);
        settings.add_trusted_publisher(CapturedX509Certificate::from_pem(SIGNER_PEM)?);
        settings.set_flags(VerifyFlags::REVOCATION_NO_CHECK);
        let outcome = ManifestVerifier::new(&settings).verify_document(&document)?;
        assert!(outcome.publisher.expect("publisher").time_stamp.is_none());

        Ok(())
    }

    fn self_signed_document() -> Result<(Document, VerificationSettings<'static>), ClickOnceCodesignError>
    {
        let key = key();
        let cert = CapturedX509Certificate::from_pem(SELF_SIGNED_PEM)?;
        let mut signing = SigningSettings::default();
        signing.set_signing_key(&key);
        signing.set_signing_certificate(cert.clone());

        let document = sign(APPLICATION, &signing)?;

        let mut settings = verification_settings();
        settings.add_trusted_publisher(cert);

        Ok((document, settings))
    }

    #[test]
    fn tampered_element_text_is_bad_digest() -> Result<(), ClickOnceCodesignError> {
        let (document, settings) = self_signed_document()?;
        let xml = String::from_utf8(document.to_xml()?).unwrap();
        assert!(xml.contains(">AAAA</dsig:DigestValue>"));

        let tampered = Document::parse(
            xml.replace(">AAAA</dsig:DigestValue>", ">AAAB</dsig:DigestValue>")
                .as_bytes(),
        )?;
        assert_eq!(
            reason(ManifestVerifier::new(&settings).verify_document(&tampered)),
            VerificationFailure::BadDigest
        );

        Ok(())
    }

    #[test]
    fn tampered_whitespace_is_bad_digest() -> Result<(), ClickOnceCodesignError> {
        let (document, settings) = self_signed_document()?;
        let xml = String::from_utf8(document.to_xml()?).unwrap();
        assert!(xml.contains("\n  <application />"));

        let tampered =
            Document::parse(xml.replace("\n  <application />", "\n    <application />").as_bytes())?;
        assert_eq!(
            reason(ManifestVerifier::new(&settings).verify_document(&tampered)),
            VerificationFailure::BadDigest
        );

        Ok(())
    }

    #[test]
    fn crlf_manifest_signs_and_verifies() -> Result<(), ClickOnceCodesignError> {
        let key = key();
        let cert = CapturedX509Certificate::from_pem(SELF_SIGNED_PEM)?;
        let mut signing = SigningSettings::default();
        signing.set_signing_key(&key);
        signing.set_signing_certificate(cert.clone());

        let mut settings = verification_settings();
        settings.add_trusted_publisher(cert);
        let verifier = ManifestVerifier::new(&settings);

        // Files written by mage on Windows use CRLF line endings.
        let document = sign(&APPLICATION.replace('\n', "\r\n"), &signing)?;
        let outcome = verifier.verify_document(&document)?;
        assert_eq!(
            outcome.publisher.expect("publisher").hash_format,
            HashFormat::Current
        );

        // Converting line endings after signing does not invalidate the signature.
        let xml = String::from_utf8(sign(APPLICATION, &signing)?.to_xml()?).unwrap();
        let converted = Document::parse(xml.replace('\n', "\r\n").as_bytes())?;
        verifier.verify_document(&converted)?;

        Ok(())
    }
}
