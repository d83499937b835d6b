// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Manifest licenses and their Authenticode signatures.

A license is a small XrML document binding a manifest's identity and
content hash to an Authenticode publisher. It carries its own enveloped
XML signature (in `r:issuer`), made with the publisher certificate's key
and optionally time-stamped. The signed license is wrapped in a
`msrel:RelData` element and embedded in the `KeyInfo` of the manifest's
strong name signature.
*/

use {
    crate::{
        canonical_hash::HashAlgorithm,
        canonicalization::canonicalize_element,
        document::Element,
        error::{ClickOnceCodesignError, VerificationFailure},
        signature::{
            decode_base64_text, rsa_key_value, ParsedSignature, XmlSigner, DSIG_NAMESPACE,
        },
        signing_key::{certificate_rsa_public_key, SigningProvider},
        time_stamp::TimeStampClient,
    },
    log::{debug, info},
    reqwest::Url,
    std::collections::BTreeMap,
    x509_certificate::CapturedX509Certificate,
};

/// XrML license namespace.
pub const LICENSE_NAMESPACE: &str = "urn:mpeg:mpeg21:2003:01-REL-R-NS";

/// Authenticode license extensions namespace.
pub const AUTHENTICODE_NAMESPACE: &str = "http://schemas.microsoft.com/windows/pki/2005/Authenticode";

/// Namespace of the `RelData` carrier embedding a license in `KeyInfo`.
pub const RELDATA_NAMESPACE: &str = "http://schemas.microsoft.com/windows/rel/2005/reldata";

/// ID of the Authenticode signature inside a license.
pub const AUTHENTICODE_SIGNATURE_ID: &str = "AuthenticodeSignature";

fn r(local_name: &str) -> Element {
    Element::new_ns(Some("r"), local_name, LICENSE_NAMESPACE)
}

fn auth(local_name: &str) -> Element {
    Element::new_ns(Some("as"), local_name, AUTHENTICODE_NAMESPACE)
}

fn ds(local_name: &str) -> Element {
    Element::new_ns(None, local_name, DSIG_NAMESPACE)
}

/// Encode a manifest hash as recorded in a license.
///
/// Bytes are written in reverse order, as hex.
pub fn encode_license_hash(digest: &[u8]) -> String {
    hex::encode(digest.iter().rev().copied().collect::<Vec<_>>())
}

/// Decode a license `Hash` attribute into digest bytes.
pub fn decode_license_hash(value: &str) -> Result<Vec<u8>, ClickOnceCodesignError> {
    let mut digest = hex::decode(value.trim())?;
    digest.reverse();

    Ok(digest)
}

/// Attributes of an `assemblyIdentity` element, keyed by name.
pub fn identity_attributes(identity: &Element) -> BTreeMap<String, String> {
    identity
        .attributes
        .iter()
        .filter(|a| a.namespace.is_none())
        .map(|a| (a.local_name.clone(), a.value.clone()))
        .collect()
}

/// Inputs to a license.
#[derive(Clone, Debug)]
pub struct LicenseBuilder<'a> {
    identity: &'a Element,
    manifest_hash: &'a [u8],
    publisher_subject: String,
    description: Option<String>,
    url: Option<String>,
}

impl<'a> LicenseBuilder<'a> {
    /// Start a license for a manifest identity and content hash.
    pub fn new(identity: &'a Element, manifest_hash: &'a [u8], publisher_subject: &str) -> Self {
        Self {
            identity,
            manifest_hash,
            publisher_subject: publisher_subject.to_string(),
            description: None,
            url: None,
        }
    }

    pub fn description(mut self, description: Option<&str>) -> Self {
        self.description = description.map(|x| x.to_string());
        self
    }

    pub fn url(mut self, url: Option<&str>) -> Self {
        self.url = url.map(|x| x.to_string());
        self
    }

    /// Build the unsigned `r:license` element.
    pub fn build(&self) -> Element {
        let mut identity = auth("assemblyIdentity");
        for (name, value) in identity_attributes(self.identity) {
            identity.set_attribute(&name, value);
        }

        let information = auth("ManifestInformation")
            .with_attribute("Hash", encode_license_hash(self.manifest_hash))
            .with_attribute("Description", self.description.as_deref().unwrap_or_default())
            .with_attribute("Url", self.url.as_deref().unwrap_or_default())
            .with_child(identity);

        r("license")
            .with_namespace_declaration(Some("r"), LICENSE_NAMESPACE)
            .with_namespace_declaration(Some("as"), AUTHENTICODE_NAMESPACE)
            .with_child(
                r("grant")
                    .with_child(information)
                    .with_child(auth("SignedBy"))
                    .with_child(auth("AuthenticodePublisher").with_child(
                        auth("X509SubjectName").with_text(&self.publisher_subject),
                    )),
            )
            .with_child(r("issuer"))
    }

    /// Build the license and sign it with the publisher's key.
    ///
    /// `certificates` are embedded as `X509Data`, signing certificate first.
    /// When `time_stamp` is given, the signature value is time-stamped.
    pub fn build_and_sign(
        &self,
        signer: &XmlSigner,
        provider: &SigningProvider,
        certificates: &[&CapturedX509Certificate],
        time_stamp: Option<(&dyn TimeStampClient, &Url)>,
    ) -> Result<Element, ClickOnceCodesignError> {
        let mut license = self.build();

        sign_license(&mut license, signer, provider, certificates)?;

        if let Some((client, url)) = time_stamp {
            time_stamp_license(&mut license, client, url, signer.algorithm())?;
        }

        Ok(license)
    }
}

/// Sign an `r:license` element, placing the signature in `r:issuer`.
pub fn sign_license(
    license: &mut Element,
    signer: &XmlSigner,
    provider: &SigningProvider,
    certificates: &[&CapturedX509Certificate],
) -> Result<(), ClickOnceCodesignError> {
    let issuer = license
        .child_mut(&[LICENSE_NAMESPACE], "issuer")
        .ok_or_else(|| ClickOnceCodesignError::ManifestMalformed("license has no issuer".into()))?;
    issuer.remove_children(&[DSIG_NAMESPACE], "Signature");

    let reference = signer.enveloped_reference(&canonicalize_element(license));

    let mut x509_data = ds("X509Data");
    for cert in certificates {
        x509_data.push(
            ds("X509Certificate").with_text(&base64::encode(cert.constructed_data())),
        );
    }

    let key_info = ds("KeyInfo")
        .with_child(rsa_key_value(&provider.rsa_public_key()?))
        .with_child(x509_data);

    let signature = signer.sign(provider, AUTHENTICODE_SIGNATURE_ID, &[reference], key_info)?;

    license
        .child_mut(&[LICENSE_NAMESPACE], "issuer")
        .ok_or_else(|| ClickOnceCodesignError::ManifestMalformed("license has no issuer".into()))?
        .push(signature);

    Ok(())
}

/// Time-stamp the Authenticode signature of a signed license.
///
/// The token covers the signature value and is stored in an `Object`
/// element of the signature.
pub fn time_stamp_license(
    license: &mut Element,
    client: &dyn TimeStampClient,
    url: &Url,
    algorithm: HashAlgorithm,
) -> Result<(), ClickOnceCodesignError> {
    let signature = license
        .child_mut(&[LICENSE_NAMESPACE], "issuer")
        .and_then(|issuer| issuer.child_mut(&[DSIG_NAMESPACE], "Signature"))
        .ok_or_else(|| {
            ClickOnceCodesignError::ManifestMalformed("license is not signed".into())
        })?;

    let signature_value = signature
        .child(&[DSIG_NAMESPACE], "SignatureValue")
        .map(|e| e.text())
        .ok_or_else(|| {
            ClickOnceCodesignError::ManifestMalformed("license signature has no value".into())
        })?;
    let signature_value = decode_base64_text(&signature_value)?;

    let token = client.time_stamp(&signature_value, url, algorithm)?;
    info!("obtained {} byte time-stamp token", token.len());

    signature.remove_children(&[DSIG_NAMESPACE], "Object");
    signature.push(
        ds("Object").with_child(auth("Timestamp").with_text(&base64::encode(&token))),
    );

    Ok(())
}

/// Subject name of a publisher certificate as recorded in licenses.
pub fn publisher_subject_name(
    cert: &CapturedX509Certificate,
) -> Result<String, ClickOnceCodesignError> {
    cert.subject_name().user_friendly_str().map_err(|_| {
        ClickOnceCodesignError::X509Parse("certificate subject name is not decodable".into())
    })
}

/// Wrap a license in the `msrel:RelData` carrier.
pub fn wrap_license(license: Element) -> Element {
    Element::new_ns(Some("msrel"), "RelData", RELDATA_NAMESPACE)
        .with_namespace_declaration(Some("msrel"), RELDATA_NAMESPACE)
        .with_child(license)
}

fn license_error(message: impl ToString) -> ClickOnceCodesignError {
    ClickOnceCodesignError::verification(VerificationFailure::SubjectFormUnknown, message)
}

/// A license read from a signed manifest.
#[derive(Clone, Debug)]
pub struct ParsedLicense {
    pub element: Element,
    /// Attributes of the licensed `assemblyIdentity`.
    pub identity: BTreeMap<String, String>,
    pub hash: Vec<u8>,
    pub description: Option<String>,
    pub url: Option<String>,
    /// Publisher subject name declared by the license.
    pub publisher_subject: Option<String>,
    pub signature: ParsedSignature,
    /// Certificates embedded in the Authenticode signature.
    pub certificates: Vec<CapturedX509Certificate>,
    /// DER time-stamp token, if the signature was time-stamped.
    pub time_stamp_token: Option<Vec<u8>>,
}

impl ParsedLicense {
    /// Find and parse a license in the `KeyInfo` of a strong name signature.
    pub fn from_key_info(
        key_info: &Element,
        id_attributes: &[&str],
    ) -> Result<Option<Self>, ClickOnceCodesignError> {
        let license = match key_info
            .child(&[RELDATA_NAMESPACE], "RelData")
            .and_then(|rel| rel.child(&[LICENSE_NAMESPACE], "license"))
        {
            Some(license) => license,
            None => return Ok(None),
        };

        Self::from_element(license, id_attributes).map(Some)
    }

    /// Parse an `r:license` element.
    pub fn from_element(
        license: &Element,
        id_attributes: &[&str],
    ) -> Result<Self, ClickOnceCodesignError> {
        let grant = license
            .child(&[LICENSE_NAMESPACE], "grant")
            .ok_or_else(|| license_error("license has no grant"))?;

        let information = grant
            .child(&[AUTHENTICODE_NAMESPACE], "ManifestInformation")
            .ok_or_else(|| license_error("license has no ManifestInformation"))?;

        let identity = information
            .child(&[AUTHENTICODE_NAMESPACE], "assemblyIdentity")
            .ok_or_else(|| license_error("license has no assemblyIdentity"))?;

        let hash = information
            .attribute("Hash")
            .ok_or_else(|| license_error("license has no manifest hash"))?;
        let hash = decode_license_hash(hash).map_err(|_| license_error("license hash is not hex"))?;

        let publisher_subject = grant
            .child(&[AUTHENTICODE_NAMESPACE], "AuthenticodePublisher")
            .and_then(|p| p.child(&[AUTHENTICODE_NAMESPACE], "X509SubjectName"))
            .map(|e| e.text());

        let signature_element = license
            .child(&[LICENSE_NAMESPACE], "issuer")
            .and_then(|issuer| issuer.child(&[DSIG_NAMESPACE], "Signature"))
            .ok_or_else(|| {
                ClickOnceCodesignError::verification(
                    VerificationFailure::NoSignature,
                    "license is not signed",
                )
            })?;
        let signature = ParsedSignature::from_element(signature_element, id_attributes)?;

        let mut certificates = vec![];
        if let Some(x509_data) = signature
            .key_info
            .as_ref()
            .and_then(|ki| ki.child(&[DSIG_NAMESPACE], "X509Data"))
        {
            for cert in x509_data.children_named(&[DSIG_NAMESPACE], "X509Certificate") {
                certificates.push(CapturedX509Certificate::from_der(decode_base64_text(
                    &cert.text(),
                )?)?);
            }
        }

        let time_stamp_token = signature
            .objects
            .iter()
            .find_map(|o| o.child(&[AUTHENTICODE_NAMESPACE], "Timestamp"))
            .map(|t| decode_base64_text(&t.text()))
            .transpose()?;

        let non_empty = |value: Option<&str>| value.filter(|x| !x.is_empty()).map(|x| x.to_string());

        Ok(Self {
            element: license.clone(),
            identity: identity_attributes(identity),
            hash,
            description: non_empty(information.attribute("Description")),
            url: non_empty(information.attribute("Url")),
            publisher_subject,
            signature,
            certificates,
            time_stamp_token,
        })
    }

    /// Verify the Authenticode signature over the license.
    ///
    /// Returns the certificate whose key made the signature.
    pub fn verify_signature(&self) -> Result<&CapturedX509Certificate, ClickOnceCodesignError> {
        let algorithm = self.signature.algorithm()?;

        let reference = self
            .signature
            .document_reference()
            .filter(|r| r.is_enveloped_c14n() && self.signature.references.len() == 1)
            .ok_or_else(|| license_error("license signature has unexpected references"))?;

        let mut content = self.element.clone();
        if let Some(issuer) = content.child_mut(&[LICENSE_NAMESPACE], "issuer") {
            issuer.remove_children(&[DSIG_NAMESPACE], "Signature");
        }
        reference.verify_digest(algorithm, &canonicalize_element(&content))?;

        let key = self.signature.public_key()?;
        self.signature.verify_signed_info(algorithm, &key)?;

        let signer = self
            .certificates
            .iter()
            .find(|cert| {
                certificate_rsa_public_key(cert)
                    .map(|k| k == key)
                    .unwrap_or(false)
            })
            .ok_or_else(|| {
                ClickOnceCodesignError::verification(
                    VerificationFailure::CertSignatureInvalid,
                    "license signing key does not match an embedded certificate",
                )
            })?;

        debug!(
            "license signed by {}",
            signer.subject_common_name().unwrap_or_default()
        );

        Ok(signer)
    }

    /// The `SignatureValue` bytes covered by a time-stamp.
    pub fn signature_value(&self) -> &[u8] {
        &self.signature.signature_value
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{
            document::Document,
            signing_key::{ManifestSigningKey, RsaSigningKey},
        },
        std::cell::RefCell,
    };

    const SIGNER_PKCS8_DER: &[u8] = include_bytes!("testdata/signer.pk8");
    const SIGNER_PEM: &str = include_str!("testdata/signer.pem");
    const CA_PEM: &str = include_str!("testdata/ca.pem");

    struct RecordingTimeStampClient {
        messages: RefCell<Vec<(Vec<u8>, HashAlgorithm)>>,
        fail: bool,
    }

    impl TimeStampClient for RecordingTimeStampClient {
        fn time_stamp(
            &self,
            message: &[u8],
            _url: &Url,
            algorithm: HashAlgorithm,
        ) -> Result<Vec<u8>, ClickOnceCodesignError> {
            if self.fail {
                return Err(ClickOnceCodesignError::TimestampFailure("offline".into()));
            }

            self.messages
                .borrow_mut()
                .push((message.to_vec(), algorithm));
            Ok(b"token".to_vec())
        }
    }

    fn identity() -> Element {
        Element::new_ns(None, "assemblyIdentity", "urn:schemas-microsoft-com:asm.v1")
            .with_attribute("name", "App.exe")
            .with_attribute("version", "1.0.0.0")
            .with_attribute("publicKeyToken", "0123456789abcdef")
    }

    #[test]
    fn hash_is_reversed_hex() -> Result<(), ClickOnceCodesignError> {
        assert_eq!(encode_license_hash(&[0x01, 0x02, 0xab]), "ab0201");
        assert_eq!(decode_license_hash("ab0201")?, vec![0x01, 0x02, 0xab]);
        assert!(decode_license_hash("xyz").is_err());

        Ok(())
    }

    #[test]
    fn build_sign_parse_verify() -> Result<(), ClickOnceCodesignError> {
        let key = RsaSigningKey::from_pkcs8_der(SIGNER_PKCS8_DER)?;
        let cert = CapturedX509Certificate::from_pem(SIGNER_PEM)?;
        let ca = CapturedX509Certificate::from_pem(CA_PEM)?;
        let provider = SigningProvider::for_algorithm(&key, HashAlgorithm::Sha256)?;
        let signer = XmlSigner::new(HashAlgorithm::Sha256);

        let identity = identity();
        let hash = HashAlgorithm::Sha256.digest(b"manifest");
        let client = RecordingTimeStampClient {
            messages: RefCell::new(vec![]),
            fail: false,
        };
        let url = Url::parse("http://timestamp.example.test").unwrap();

        let license = LicenseBuilder::new(&identity, &hash, "CN=Contoso Publisher")
            .description(Some("Contoso App"))
            .url(Some("https://contoso.example"))
            .build_and_sign(
                &signer,
                &provider,
                &[&cert, &ca],
                Some((&client as &dyn TimeStampClient, &url)),
            )?;

        let wrapped = wrap_license(license);
        let key_info = ds("KeyInfo").with_child(wrapped);

        // Round trip through serialization, as consumers see it.
        let doc = Document::from_root(key_info).reparsed()?;
        let parsed = ParsedLicense::from_key_info(&doc.root, &["Id"])?.expect("license present");

        assert_eq!(parsed.hash, hash);
        assert_eq!(parsed.identity, identity_attributes(&identity));
        assert_eq!(parsed.description.as_deref(), Some("Contoso App"));
        assert_eq!(parsed.url.as_deref(), Some("https://contoso.example"));
        assert_eq!(parsed.publisher_subject.as_deref(), Some("CN=Contoso Publisher"));
        assert_eq!(parsed.certificates.len(), 2);
        assert_eq!(parsed.time_stamp_token.as_deref(), Some(&b"token"[..]));

        let messages = client.messages.borrow();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, parsed.signature_value());
        assert_eq!(messages[0].1, HashAlgorithm::Sha256);

        let signer_cert = parsed.verify_signature()?;
        assert_eq!(signer_cert.constructed_data(), cert.constructed_data());
        assert_eq!(
            certificate_rsa_public_key(signer_cert)?,
            key.rsa_public_key()?
        );

        Ok(())
    }

    #[test]
    fn tampered_license_fails() -> Result<(), ClickOnceCodesignError> {
        let key = RsaSigningKey::from_pkcs8_der(SIGNER_PKCS8_DER)?;
        let cert = CapturedX509Certificate::from_pem(SIGNER_PEM)?;
        let provider = SigningProvider::for_algorithm(&key, HashAlgorithm::Sha1)?;
        let signer = XmlSigner::new(HashAlgorithm::Sha1);

        let identity = identity();
        let hash = HashAlgorithm::Sha1.digest(b"manifest");
        let mut license = LicenseBuilder::new(&identity, &hash, "CN=Contoso Publisher")
            .build_and_sign(&signer, &provider, &[&cert], None)?;

        license
            .child_mut(&[LICENSE_NAMESPACE], "grant")
            .and_then(|g| g.child_mut(&[AUTHENTICODE_NAMESPACE], "ManifestInformation"))
            .expect("information present")
            .set_attribute("Description", "tampered");

        let parsed = ParsedLicense::from_element(&license, &["Id"])?;
        assert_eq!(parsed.time_stamp_token, None);
        let err = parsed.verify_signature().unwrap_err();
        assert_eq!(err.verification_failure(), Some(VerificationFailure::BadDigest));

        Ok(())
    }

    #[test]
    fn time_stamp_failure_is_retryable() -> Result<(), ClickOnceCodesignError> {
        let key = RsaSigningKey::from_pkcs8_der(SIGNER_PKCS8_DER)?;
        let cert = CapturedX509Certificate::from_pem(SIGNER_PEM)?;
        let provider = SigningProvider::for_algorithm(&key, HashAlgorithm::Sha256)?;
        let signer = XmlSigner::new(HashAlgorithm::Sha256);
        let client = RecordingTimeStampClient {
            messages: RefCell::new(vec![]),
            fail: true,
        };
        let url = Url::parse("http://timestamp.example.test").unwrap();

        let identity = identity();
        let err = LicenseBuilder::new(&identity, &[1, 2, 3], "CN=Contoso Publisher")
            .build_and_sign(
                &signer,
                &provider,
                &[&cert],
                Some((&client as &dyn TimeStampClient, &url)),
            )
            .unwrap_err();
        assert!(err.is_retryable());

        Ok(())
    }
}
