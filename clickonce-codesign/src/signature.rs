// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! XML digital signature elements.

Both signatures found in manifests (the strong name signature on the
manifest root and the Authenticode signature inside the license) are
XML-DSig enveloped signatures with a single `SignedInfo` canonicalized with
exclusive C14N. This module constructs and parses those `Signature`
elements. It is configured explicitly through [XmlSigner] rather than a
global algorithm registry.
*/

use {
    crate::{
        canonical_hash::HashAlgorithm,
        canonicalization::{canonicalize_element, EXC_C14N_ALGORITHM},
        document::Element,
        error::{ClickOnceCodesignError, VerificationFailure},
        signing_key::{verify_rsa_signature, SigningProvider},
    },
    log::debug,
    rsa::{traits::PublicKeyParts, BigUint, RsaPublicKey},
};

/// XML namespace of XML-DSig elements.
pub const DSIG_NAMESPACE: &str = "http://www.w3.org/2000/09/xmldsig#";

/// Transform removing the enclosing signature from the signed content.
pub const ENVELOPED_SIGNATURE_ALGORITHM: &str =
    "http://www.w3.org/2000/09/xmldsig#enveloped-signature";

/// Attribute names treated as element IDs when resolving `#id` references.
pub const DEFAULT_ID_ATTRIBUTES: &[&str] = &["Id", "id", "ID"];

fn ds(local_name: &str) -> Element {
    Element::new_ns(None, local_name, DSIG_NAMESPACE)
}

fn form_error(message: impl ToString) -> ClickOnceCodesignError {
    ClickOnceCodesignError::verification(VerificationFailure::SubjectFormUnknown, message)
}

/// A reference to be placed in a `SignedInfo`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SignatureReference {
    pub uri: String,
    pub transforms: Vec<String>,
    pub digest: Vec<u8>,
}

/// Produces XML-DSig signatures with a fixed hash algorithm and ID policy.
#[derive(Clone, Debug)]
pub struct XmlSigner {
    algorithm: HashAlgorithm,
    id_attributes: Vec<String>,
}

impl XmlSigner {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self {
            algorithm,
            id_attributes: DEFAULT_ID_ATTRIBUTES
                .iter()
                .map(|x| x.to_string())
                .collect(),
        }
    }

    /// Replace the attribute names recognized as element IDs.
    pub fn with_id_attributes(mut self, attributes: &[&str]) -> Self {
        self.id_attributes = attributes.iter().map(|x| x.to_string()).collect();
        self
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn id_attributes(&self) -> Vec<&str> {
        self.id_attributes.iter().map(|x| x.as_str()).collect()
    }

    /// A same-document reference (`URI=""`) over already canonicalized content.
    ///
    /// The content must exclude the signature being produced, as the
    /// enveloped signature transform removes it before digesting.
    /// Transforms are listed enveloped signature first, then exclusive c14n,
    /// the order .NET emits and expects.
    pub fn enveloped_reference(&self, canonical_content: &[u8]) -> SignatureReference {
        SignatureReference {
            uri: "".to_string(),
            transforms: vec![
                ENVELOPED_SIGNATURE_ALGORITHM.to_string(),
                EXC_C14N_ALGORITHM.to_string(),
            ],
            digest: self.algorithm.digest(canonical_content),
        }
    }

    /// A reference to an element identified by an ID attribute.
    pub fn element_reference(&self, id: &str, element: &Element) -> SignatureReference {
        SignatureReference {
            uri: format!("#{}", id),
            transforms: vec![EXC_C14N_ALGORITHM.to_string()],
            digest: self.algorithm.digest(&canonicalize_element(element)),
        }
    }

    /// Build the `SignedInfo` element for a set of references.
    pub fn signed_info(&self, references: &[SignatureReference]) -> Element {
        let mut signed_info = ds("SignedInfo")
            .with_child(
                ds("CanonicalizationMethod").with_attribute("Algorithm", EXC_C14N_ALGORITHM),
            )
            .with_child(
                ds("SignatureMethod")
                    .with_attribute("Algorithm", self.algorithm.signature_method_uri()),
            );

        for reference in references {
            let mut transforms = ds("Transforms");
            for transform in &reference.transforms {
                transforms.push(ds("Transform").with_attribute("Algorithm", transform));
            }

            signed_info.push(
                ds("Reference")
                    .with_attribute("URI", &reference.uri)
                    .with_child(transforms)
                    .with_child(
                        ds("DigestMethod")
                            .with_attribute("Algorithm", self.algorithm.digest_method_uri()),
                    )
                    .with_child(ds("DigestValue").with_text(&base64::encode(&reference.digest))),
            );
        }

        signed_info
    }

    /// Produce a complete `Signature` element.
    ///
    /// `key_info` becomes the trailing `KeyInfo` child.
    pub fn sign(
        &self,
        provider: &SigningProvider,
        id: &str,
        references: &[SignatureReference],
        key_info: Element,
    ) -> Result<Element, ClickOnceCodesignError> {
        let signed_info = self.signed_info(references);
        let signature_value =
            provider.sign_message(self.algorithm, &canonicalize_element(&signed_info))?;

        debug!(
            "produced {} signature {} ({} bytes)",
            self.algorithm,
            id,
            signature_value.len()
        );

        Ok(ds("Signature")
            .with_namespace_declaration(None, DSIG_NAMESPACE)
            .with_attribute("Id", id)
            .with_child(signed_info)
            .with_child(ds("SignatureValue").with_text(&base64::encode(&signature_value)))
            .with_child(key_info))
    }
}

/// Build a `KeyValue` element holding an RSA public key.
pub fn rsa_key_value(key: &RsaPublicKey) -> Element {
    ds("KeyValue").with_child(
        ds("RSAKeyValue")
            .with_child(ds("Modulus").with_text(&base64::encode(key.n().to_bytes_be())))
            .with_child(ds("Exponent").with_text(&base64::encode(key.e().to_bytes_be()))),
    )
}

/// Base64 decode element text, tolerating embedded whitespace.
pub fn decode_base64_text(text: &str) -> Result<Vec<u8>, ClickOnceCodesignError> {
    let compact = text
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect::<String>();

    Ok(base64::decode(compact)?)
}

/// Recover the RSA public key from a `KeyInfo` element's `KeyValue`.
pub fn parse_rsa_key_value(key_info: &Element) -> Result<RsaPublicKey, ClickOnceCodesignError> {
    let bad_key = |message: &str| {
        ClickOnceCodesignError::verification(VerificationFailure::BadKey, message.to_string())
    };

    let rsa = key_info
        .child(&[DSIG_NAMESPACE], "KeyValue")
        .and_then(|kv| kv.child(&[DSIG_NAMESPACE], "RSAKeyValue"))
        .ok_or_else(|| bad_key("signature does not carry an RSA key value"))?;

    let modulus = rsa
        .child(&[DSIG_NAMESPACE], "Modulus")
        .ok_or_else(|| bad_key("RSA key value has no modulus"))?;
    let exponent = rsa
        .child(&[DSIG_NAMESPACE], "Exponent")
        .ok_or_else(|| bad_key("RSA key value has no exponent"))?;

    let n = decode_base64_text(&modulus.text()).map_err(|_| bad_key("invalid modulus"))?;
    let e = decode_base64_text(&exponent.text()).map_err(|_| bad_key("invalid exponent"))?;

    RsaPublicKey::new(BigUint::from_bytes_be(&n), BigUint::from_bytes_be(&e))
        .map_err(|e| bad_key(&format!("invalid RSA key: {}", e)))
}

/// A parsed `Reference` of a `SignedInfo`.
#[derive(Clone, Debug)]
pub struct ParsedReference {
    pub uri: Option<String>,
    pub transforms: Vec<String>,
    pub digest_method: String,
    pub digest_value: Vec<u8>,
}

impl ParsedReference {
    /// Whether this reference carries exactly the enveloped and exclusive C14N transforms.
    pub fn is_enveloped_c14n(&self) -> bool {
        self.transforms.len() == 2
            && self
                .transforms
                .iter()
                .any(|t| t == ENVELOPED_SIGNATURE_ALGORITHM)
            && self.transforms.iter().any(|t| t == EXC_C14N_ALGORITHM)
    }

    /// Compare the recorded digest against canonicalized content.
    pub fn verify_digest(
        &self,
        algorithm: HashAlgorithm,
        canonical_content: &[u8],
    ) -> Result<(), ClickOnceCodesignError> {
        if algorithm.digest(canonical_content) == self.digest_value {
            Ok(())
        } else {
            Err(ClickOnceCodesignError::verification(
                VerificationFailure::BadDigest,
                format!(
                    "digest of reference \"{}\" does not match",
                    self.uri.as_deref().unwrap_or_default()
                ),
            ))
        }
    }
}

/// A parsed XML-DSig `Signature` element.
#[derive(Clone, Debug)]
pub struct ParsedSignature {
    pub id: Option<String>,
    pub signed_info: Element,
    pub canonicalization_method: String,
    pub signature_method: String,
    pub references: Vec<ParsedReference>,
    pub signature_value: Vec<u8>,
    pub key_info: Option<Element>,
    /// `Object` children following `KeyInfo`.
    pub objects: Vec<Element>,
}

impl ParsedSignature {
    /// Parse a `Signature` element.
    ///
    /// Structural problems are reported as [VerificationFailure::SubjectFormUnknown].
    pub fn from_element(
        signature: &Element,
        id_attributes: &[&str],
    ) -> Result<Self, ClickOnceCodesignError> {
        if !signature.is(&[DSIG_NAMESPACE], "Signature") {
            return Err(form_error("element is not an XML-DSig signature"));
        }

        let signed_info = signature
            .child(&[DSIG_NAMESPACE], "SignedInfo")
            .ok_or_else(|| form_error("signature has no SignedInfo"))?;

        let algorithm_of = |name: &str| -> Result<String, ClickOnceCodesignError> {
            signed_info
                .child(&[DSIG_NAMESPACE], name)
                .and_then(|e| e.attribute("Algorithm"))
                .map(|x| x.to_string())
                .ok_or_else(|| form_error(format!("SignedInfo has no {}", name)))
        };

        let canonicalization_method = algorithm_of("CanonicalizationMethod")?;
        let signature_method = algorithm_of("SignatureMethod")?;

        let mut references = vec![];
        for reference in signed_info.children_named(&[DSIG_NAMESPACE], "Reference") {
            let transforms = reference
                .child(&[DSIG_NAMESPACE], "Transforms")
                .map(|t| {
                    t.children_named(&[DSIG_NAMESPACE], "Transform")
                        .filter_map(|x| x.attribute("Algorithm"))
                        .map(|x| x.to_string())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();

            let digest_method = reference
                .child(&[DSIG_NAMESPACE], "DigestMethod")
                .and_then(|e| e.attribute("Algorithm"))
                .ok_or_else(|| form_error("reference has no DigestMethod"))?
                .to_string();

            let digest_value = reference
                .child(&[DSIG_NAMESPACE], "DigestValue")
                .ok_or_else(|| form_error("reference has no DigestValue"))?;

            references.push(ParsedReference {
                uri: reference.attribute("URI").map(|x| x.to_string()),
                transforms,
                digest_method,
                digest_value: decode_base64_text(&digest_value.text())
                    .map_err(|_| form_error("reference digest is not base64"))?,
            });
        }

        if references.is_empty() {
            return Err(form_error("SignedInfo has no references"));
        }

        let signature_value = signature
            .child(&[DSIG_NAMESPACE], "SignatureValue")
            .ok_or_else(|| form_error("signature has no SignatureValue"))?;

        Ok(Self {
            id: id_attributes
                .iter()
                .find_map(|name| signature.attribute(name))
                .map(|x| x.to_string()),
            signed_info: signed_info.clone(),
            canonicalization_method,
            signature_method,
            references,
            signature_value: decode_base64_text(&signature_value.text())
                .map_err(|_| form_error("signature value is not base64"))?,
            key_info: signature.child(&[DSIG_NAMESPACE], "KeyInfo").cloned(),
            objects: signature
                .children_named(&[DSIG_NAMESPACE], "Object")
                .cloned()
                .collect(),
        })
    }

    /// Resolve the hash algorithm from the declared method URIs.
    ///
    /// Every digest method must agree with the signature method.
    pub fn algorithm(&self) -> Result<HashAlgorithm, ClickOnceCodesignError> {
        if self.canonicalization_method != EXC_C14N_ALGORITHM {
            return Err(form_error(format!(
                "unsupported canonicalization method {}",
                self.canonicalization_method
            )));
        }

        let algorithm = HashAlgorithm::from_signature_method_uri(&self.signature_method)
            .ok_or_else(|| {
                form_error(format!(
                    "unsupported signature method {}",
                    self.signature_method
                ))
            })?;

        for reference in &self.references {
            if HashAlgorithm::from_digest_method_uri(&reference.digest_method) != Some(algorithm) {
                return Err(form_error(format!(
                    "digest method {} does not match signature method {}",
                    reference.digest_method, self.signature_method
                )));
            }
        }

        Ok(algorithm)
    }

    /// The reference covering the whole enclosing document.
    pub fn document_reference(&self) -> Option<&ParsedReference> {
        self.references
            .iter()
            .find(|r| r.uri.as_deref() == Some(""))
    }

    /// Verify the cryptographic signature over `SignedInfo`.
    pub fn verify_signed_info(
        &self,
        algorithm: HashAlgorithm,
        key: &RsaPublicKey,
    ) -> Result<(), ClickOnceCodesignError> {
        let canonical = canonicalize_element(&self.signed_info);

        if verify_rsa_signature(key, algorithm, &canonical, &self.signature_value) {
            Ok(())
        } else {
            Err(ClickOnceCodesignError::verification(
                VerificationFailure::BadDigest,
                "signature value does not verify against SignedInfo",
            ))
        }
    }

    /// The public key in `KeyInfo/KeyValue`.
    pub fn public_key(&self) -> Result<RsaPublicKey, ClickOnceCodesignError> {
        let key_info = self.key_info.as_ref().ok_or_else(|| {
            ClickOnceCodesignError::verification(
                VerificationFailure::BadKey,
                "signature has no KeyInfo",
            )
        })?;

        parse_rsa_key_value(key_info)
    }
}
