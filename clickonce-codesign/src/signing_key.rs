// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Signing keys for manifest signatures.

Manifest signatures are RSA PKCS#1 v1.5 signatures over SHA-1 or SHA-256
digests. Not every key provider can produce both: the `ring` backed
[InMemorySigningKeyPair] only signs with SHA-256. [SigningProvider]
transparently substitutes an equivalent provider capable of the requested
algorithm when the key material can be exported.
*/

use {
    crate::{canonical_hash::HashAlgorithm, error::ClickOnceCodesignError},
    log::warn,
    rsa::{
        pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey},
        pkcs8::DecodePrivateKey,
        Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey,
    },
    x509_certificate::{
        CapturedX509Certificate, InMemorySigningKeyPair, KeyAlgorithm, Sign, SignatureAlgorithm,
        Signer,
    },
};

/// A private key capable of producing manifest signatures.
pub trait ManifestSigningKey {
    /// The RSA public key corresponding to this key.
    fn rsa_public_key(&self) -> Result<RsaPublicKey, ClickOnceCodesignError>;

    /// Whether this key can natively sign with the given algorithm.
    fn supports_algorithm(&self, algorithm: HashAlgorithm) -> bool;

    /// Sign a message, hashing it with `algorithm` first.
    fn sign_message(
        &self,
        algorithm: HashAlgorithm,
        message: &[u8],
    ) -> Result<Vec<u8>, ClickOnceCodesignError>;

    /// Export the key to a provider supporting every algorithm.
    fn to_rsa_signing_key(&self) -> Result<RsaSigningKey, ClickOnceCodesignError>;
}

/// An RSA private key held in memory, able to sign with any [HashAlgorithm].
#[derive(Clone, Debug)]
pub struct RsaSigningKey {
    key: RsaPrivateKey,
}

impl From<RsaPrivateKey> for RsaSigningKey {
    fn from(key: RsaPrivateKey) -> Self {
        Self { key }
    }
}

impl RsaSigningKey {
    /// Construct an instance from PKCS#8 DER data.
    pub fn from_pkcs8_der(data: &[u8]) -> Result<Self, ClickOnceCodesignError> {
        let key = RsaPrivateKey::from_pkcs8_der(data)
            .map_err(|e| ClickOnceCodesignError::SigningKey(format!("bad PKCS#8 key: {}", e)))?;

        Ok(Self { key })
    }

    /// Construct an instance from PKCS#1 `RSAPrivateKey` DER data.
    pub fn from_pkcs1_der(data: &[u8]) -> Result<Self, ClickOnceCodesignError> {
        let key = RsaPrivateKey::from_pkcs1_der(data)
            .map_err(|e| ClickOnceCodesignError::SigningKey(format!("bad PKCS#1 key: {}", e)))?;

        Ok(Self { key })
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.key
    }
}

impl ManifestSigningKey for RsaSigningKey {
    fn rsa_public_key(&self) -> Result<RsaPublicKey, ClickOnceCodesignError> {
        Ok(self.key.to_public_key())
    }

    fn supports_algorithm(&self, _algorithm: HashAlgorithm) -> bool {
        true
    }

    fn sign_message(
        &self,
        algorithm: HashAlgorithm,
        message: &[u8],
    ) -> Result<Vec<u8>, ClickOnceCodesignError> {
        let digest = algorithm.digest(message);

        Ok(self.key.sign(pkcs1v15_scheme(algorithm), &digest)?)
    }

    fn to_rsa_signing_key(&self) -> Result<RsaSigningKey, ClickOnceCodesignError> {
        Ok(self.clone())
    }
}

impl ManifestSigningKey for InMemorySigningKeyPair {
    fn rsa_public_key(&self) -> Result<RsaPublicKey, ClickOnceCodesignError> {
        if !matches!(self.key_algorithm(), Some(KeyAlgorithm::Rsa)) {
            return Err(ClickOnceCodesignError::SigningKey(
                "manifest signing requires an RSA key".into(),
            ));
        }

        RsaPublicKey::from_pkcs1_der(self.public_key_data().as_ref())
            .map_err(|e| ClickOnceCodesignError::SigningKey(format!("bad RSA public key: {}", e)))
    }

    fn supports_algorithm(&self, algorithm: HashAlgorithm) -> bool {
        matches!(
            (self.signature_algorithm(), algorithm),
            (Ok(SignatureAlgorithm::RsaSha256), HashAlgorithm::Sha256)
        )
    }

    fn sign_message(
        &self,
        algorithm: HashAlgorithm,
        message: &[u8],
    ) -> Result<Vec<u8>, ClickOnceCodesignError> {
        if !self.supports_algorithm(algorithm) {
            return Err(ClickOnceCodesignError::SigningKey(format!(
                "key cannot sign with {}",
                algorithm
            )));
        }

        let signature: x509_certificate::Signature = Signer::try_sign(self, message)
            .map_err(|e| ClickOnceCodesignError::SigningKey(format!("signing failed: {}", e)))?;

        Ok(signature.into())
    }

    fn to_rsa_signing_key(&self) -> Result<RsaSigningKey, ClickOnceCodesignError> {
        let data = self.private_key_data().ok_or_else(|| {
            ClickOnceCodesignError::SigningKey("private key material is not exportable".into())
        })?;

        RsaSigningKey::from_pkcs1_der(data.as_ref())
    }
}

fn pkcs1v15_scheme(algorithm: HashAlgorithm) -> Pkcs1v15Sign {
    match algorithm {
        HashAlgorithm::Sha1 => Pkcs1v15Sign::new::<sha1::Sha1>(),
        HashAlgorithm::Sha256 => Pkcs1v15Sign::new::<sha2::Sha256>(),
    }
}

/// Verify an RSA PKCS#1 v1.5 signature over a message.
pub fn verify_rsa_signature(
    key: &RsaPublicKey,
    algorithm: HashAlgorithm,
    message: &[u8],
    signature: &[u8],
) -> bool {
    let digest = algorithm.digest(message);

    key.verify(pkcs1v15_scheme(algorithm), &digest, signature).is_ok()
}

/// A key able to sign with a specific algorithm.
///
/// Obtain instances via [SigningProvider::for_algorithm].
pub enum SigningProvider<'key> {
    /// The original key supports the algorithm.
    Native(&'key dyn ManifestSigningKey),
    /// The key was exported to a provider supporting the algorithm.
    Upgraded(RsaSigningKey),
}

impl<'key> SigningProvider<'key> {
    /// Resolve a provider able to sign with `algorithm`, upgrading the key if needed.
    pub fn for_algorithm(
        key: &'key dyn ManifestSigningKey,
        algorithm: HashAlgorithm,
    ) -> Result<Self, ClickOnceCodesignError> {
        if key.supports_algorithm(algorithm) {
            Ok(Self::Native(key))
        } else {
            warn!(
                "signing key does not support {}; using equivalent in-memory RSA provider",
                algorithm
            );
            Ok(Self::Upgraded(key.to_rsa_signing_key()?))
        }
    }

    fn key(&self) -> &dyn ManifestSigningKey {
        match self {
            Self::Native(key) => *key,
            Self::Upgraded(key) => key,
        }
    }

    pub fn is_upgraded(&self) -> bool {
        matches!(self, Self::Upgraded(_))
    }

    pub fn rsa_public_key(&self) -> Result<RsaPublicKey, ClickOnceCodesignError> {
        self.key().rsa_public_key()
    }

    pub fn sign_message(
        &self,
        algorithm: HashAlgorithm,
        message: &[u8],
    ) -> Result<Vec<u8>, ClickOnceCodesignError> {
        self.key().sign_message(algorithm, message)
    }
}

/// Obtain the RSA public key of a certificate.
pub fn certificate_rsa_public_key(
    cert: &CapturedX509Certificate,
) -> Result<RsaPublicKey, ClickOnceCodesignError> {
    RsaPublicKey::from_pkcs1_der(cert.public_key_data().as_ref()).map_err(|e| {
        ClickOnceCodesignError::SigningKey(format!("certificate does not hold an RSA key: {}", e))
    })
}

fn bmp_string(s: &str) -> Vec<u8> {
    let utf16: Vec<u16> = s.encode_utf16().collect();

    let mut bytes = Vec::with_capacity(utf16.len() * 2 + 2);
    for c in utf16 {
        bytes.push((c / 256) as u8);
        bytes.push((c % 256) as u8);
    }
    bytes.push(0x00);
    bytes.push(0x00);

    bytes
}

/// Parse PFX data into a key pair and its certificates.
///
/// PFX data is commonly encountered in `.pfx` / `.p12` files, as produced by
/// Windows certificate export.
///
/// The first certificate whose public key matches the private key is the
/// signing certificate. Remaining certificates are returned as the chain.
pub fn parse_pfx_data(
    data: &[u8],
    password: &str,
) -> Result<
    (
        RsaSigningKey,
        CapturedX509Certificate,
        Vec<CapturedX509Certificate>,
    ),
    ClickOnceCodesignError,
> {
    let pfx = p12::PFX::parse(data).map_err(|e| {
        ClickOnceCodesignError::PfxParseError(format!("data does not appear to be PFX: {:?}", e))
    })?;

    if !pfx.verify_mac(password) {
        return Err(ClickOnceCodesignError::PfxBadPassword);
    }

    let data = match pfx.auth_safe {
        p12::ContentInfo::Data(data) => data,
        _ => {
            return Err(ClickOnceCodesignError::PfxParseError(
                "unexpected PFX content info".to_string(),
            ));
        }
    };

    let content_infos = yasna::parse_der(&data, |reader| {
        reader.collect_sequence_of(p12::ContentInfo::parse)
    })
    .map_err(|e| {
        ClickOnceCodesignError::PfxParseError(format!("failed parsing inner ContentInfo: {:?}", e))
    })?;

    let bmp_password = bmp_string(password);

    let mut certificates = vec![];
    let mut signing_key = None;

    for content in content_infos {
        let bags_data = match content {
            p12::ContentInfo::Data(inner) => inner,
            p12::ContentInfo::EncryptedData(encrypted) => {
                encrypted.data(&bmp_password).ok_or_else(|| {
                    ClickOnceCodesignError::PfxParseError(
                        "failed decrypting inner EncryptedData".to_string(),
                    )
                })?
            }
            p12::ContentInfo::OtherContext(_) => {
                return Err(ClickOnceCodesignError::PfxParseError(
                    "unexpected OtherContent content in inner PFX data".to_string(),
                ));
            }
        };

        let bags = yasna::parse_ber(&bags_data, |reader| {
            reader.collect_sequence_of(p12::SafeBag::parse)
        })
        .map_err(|e| {
            ClickOnceCodesignError::PfxParseError(format!(
                "failed parsing SafeBag within inner Data: {:?}",
                e
            ))
        })?;

        for bag in bags {
            match bag.bag {
                p12::SafeBagKind::CertBag(p12::CertBag::X509(cert_data)) => {
                    certificates.push(CapturedX509Certificate::from_der(cert_data)?);
                }
                p12::SafeBagKind::CertBag(p12::CertBag::SDSI(_)) => {
                    return Err(ClickOnceCodesignError::PfxParseError(
                        "unexpected SDSI certificate data".to_string(),
                    ));
                }
                p12::SafeBagKind::Pkcs8ShroudedKeyBag(key_bag) => {
                    let decrypted = key_bag.decrypt(&bmp_password).ok_or_else(|| {
                        ClickOnceCodesignError::PfxParseError(
                            "error decrypting PKCS8 shrouded key bag; is the password correct?"
                                .to_string(),
                        )
                    })?;

                    signing_key = Some(RsaSigningKey::from_pkcs8_der(&decrypted)?);
                }
                p12::SafeBagKind::OtherBagKind(_) => {
                    return Err(ClickOnceCodesignError::PfxParseError(
                        "unexpected bag type in inner PFX content".to_string(),
                    ));
                }
            }
        }
    }

    let signing_key = signing_key.ok_or_else(|| {
        ClickOnceCodesignError::PfxParseError("failed to find signing key in PFX data".to_string())
    })?;

    split_signing_certificate(&signing_key, certificates).ok_or_else(|| {
        ClickOnceCodesignError::PfxParseError(
            "failed to find x509 certificate for signing key in PFX data".to_string(),
        )
    })
}

/// Parse PEM data holding a `PRIVATE KEY` and one or more `CERTIFICATE` entries.
pub fn parse_pem_data(
    data: &[u8],
) -> Result<
    (
        RsaSigningKey,
        CapturedX509Certificate,
        Vec<CapturedX509Certificate>,
    ),
    ClickOnceCodesignError,
> {
    let mut certificates = vec![];
    let mut signing_key = None;

    for pem in pem::parse_many(data).map_err(ClickOnceCodesignError::CertificatePem)? {
        match pem.tag.as_str() {
            "CERTIFICATE" => {
                certificates.push(CapturedX509Certificate::from_der(pem.contents)?);
            }
            "PRIVATE KEY" => {
                signing_key = Some(RsaSigningKey::from_pkcs8_der(&pem.contents)?);
            }
            "RSA PRIVATE KEY" => {
                signing_key = Some(RsaSigningKey::from_pkcs1_der(&pem.contents)?);
            }
            tag => warn!("(unhandled PEM tag {}; ignoring)", tag),
        }
    }

    let signing_key = signing_key.ok_or_else(|| {
        ClickOnceCodesignError::SigningKey("no private key found in PEM data".into())
    })?;

    split_signing_certificate(&signing_key, certificates).ok_or_else(|| {
        ClickOnceCodesignError::SigningKey(
            "no certificate matching the private key found in PEM data".into(),
        )
    })
}

fn split_signing_certificate(
    key: &RsaSigningKey,
    mut certificates: Vec<CapturedX509Certificate>,
) -> Option<(
    RsaSigningKey,
    CapturedX509Certificate,
    Vec<CapturedX509Certificate>,
)> {
    let public_key = key.key.to_public_key();

    let index = certificates.iter().position(|cert| {
        certificate_rsa_public_key(cert)
            .map(|k| k == public_key)
            .unwrap_or(false)
    })?;

    let cert = certificates.remove(index);

    Some((key.clone(), cert, certificates))
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    pub(crate) const SIGNER_PKCS8_DER: &[u8] = include_bytes!("testdata/signer.pk8");
    const SIGNER_PEM: &str = include_str!("testdata/signer.pem");
    const CA_PEM: &str = include_str!("testdata/ca.pem");

    #[test]
    fn rsa_key_signs_both_algorithms() -> Result<(), ClickOnceCodesignError> {
        let key = RsaSigningKey::from_pkcs8_der(SIGNER_PKCS8_DER)?;
        let public_key = key.rsa_public_key()?;

        for alg in [HashAlgorithm::Sha1, HashAlgorithm::Sha256] {
            assert!(key.supports_algorithm(alg));
            let signature = key.sign_message(alg, b"hello")?;
            assert!(verify_rsa_signature(&public_key, alg, b"hello", &signature));
            assert!(!verify_rsa_signature(&public_key, alg, b"hellO", &signature));
        }

        Ok(())
    }

    #[test]
    fn ring_key_upgraded_for_sha1() -> Result<(), ClickOnceCodesignError> {
        let key = InMemorySigningKeyPair::from_pkcs8_der(SIGNER_PKCS8_DER)?;
        let public_key = ManifestSigningKey::rsa_public_key(&key)?;

        assert!(key.supports_algorithm(HashAlgorithm::Sha256));
        assert!(!key.supports_algorithm(HashAlgorithm::Sha1));
        assert!(key.sign_message(HashAlgorithm::Sha1, b"data").is_err());

        let native = SigningProvider::for_algorithm(&key, HashAlgorithm::Sha256)?;
        assert!(!native.is_upgraded());
        let signature = native.sign_message(HashAlgorithm::Sha256, b"data")?;
        assert!(verify_rsa_signature(
            &public_key,
            HashAlgorithm::Sha256,
            b"data",
            &signature
        ));

        let upgraded = SigningProvider::for_algorithm(&key, HashAlgorithm::Sha1)?;
        assert!(upgraded.is_upgraded());
        assert_eq!(upgraded.rsa_public_key()?, public_key);
        let signature = upgraded.sign_message(HashAlgorithm::Sha1, b"data")?;
        assert!(verify_rsa_signature(
            &public_key,
            HashAlgorithm::Sha1,
            b"data",
            &signature
        ));

        Ok(())
    }

    #[test]
    fn certificate_public_key_matches() -> Result<(), ClickOnceCodesignError> {
        let key = RsaSigningKey::from_pkcs8_der(SIGNER_PKCS8_DER)?;
        let cert = CapturedX509Certificate::from_pem(SIGNER_PEM)?;

        assert_eq!(certificate_rsa_public_key(&cert)?, key.rsa_public_key()?);

        Ok(())
    }

    #[test]
    fn pem_bundle() -> Result<(), ClickOnceCodesignError> {
        let key_pem = pem::encode(&pem::Pem {
            tag: "PRIVATE KEY".to_string(),
            contents: SIGNER_PKCS8_DER.to_vec(),
        });
        let bundle = format!("{}{}{}", CA_PEM, key_pem, SIGNER_PEM);

        let (_, cert, chain) = parse_pem_data(bundle.as_bytes())?;
        assert_eq!(
            cert.subject_common_name().as_deref(),
            Some("Contoso Publisher")
        );
        assert_eq!(chain.len(), 1);
        assert_eq!(
            chain[0].subject_common_name().as_deref(),
            Some("ClickOnce Test Root CA")
        );

        assert!(parse_pem_data(CA_PEM.as_bytes()).is_err());

        Ok(())
    }

    #[test]
    fn pfx_round_trip() -> Result<(), ClickOnceCodesignError> {
        let cert = CapturedX509Certificate::from_pem(SIGNER_PEM)?;
        let ca = CapturedX509Certificate::from_pem(CA_PEM)?;
        let cert_der = cert.encode_der()?;
        let ca_der = ca.encode_der()?;

        let pfx = p12::PFX::new(
            &cert_der,
            SIGNER_PKCS8_DER,
            Some(&ca_der),
            "password123",
            "signer",
        )
        .unwrap();
        let data = pfx.to_der();

        let err = parse_pfx_data(&data, "bad-password").unwrap_err();
        assert!(matches!(err, ClickOnceCodesignError::PfxBadPassword));

        let (key, parsed, chain) = parse_pfx_data(&data, "password123")?;
        assert_eq!(parsed.encode_der()?, cert_der);
        assert_eq!(key.rsa_public_key()?, certificate_rsa_public_key(&cert)?);
        assert_eq!(chain.len(), 1);

        Ok(())
    }
}
