// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Content hashes of manifest documents.

use {
    crate::{
        canonicalization::canonicalize_document,
        document::Document,
        error::{ClickOnceCodesignError, VerificationFailure},
        signature::DSIG_NAMESPACE,
    },
    digest::Digest,
    log::debug,
    std::str::FromStr,
};

/// Hash algorithm used for signatures and manifest digests.
///
/// A single value is threaded through every step of a signing operation so
/// the digest and signature method URIs always agree.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum HashAlgorithm {
    /// SHA-1 with the `rsa-sha1` signature method.
    Sha1,
    /// SHA-256 with the `rsa-sha256` signature method.
    Sha256,
}

impl Default for HashAlgorithm {
    fn default() -> Self {
        Self::Sha256
    }
}

impl std::fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
        })
    }
}

impl FromStr for HashAlgorithm {
    type Err = ClickOnceCodesignError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha1" | "sha-1" => Ok(Self::Sha1),
            "sha256" | "sha-256" => Ok(Self::Sha256),
            _ => Err(ClickOnceCodesignError::CliGeneralError(format!(
                "unknown hash algorithm: {}",
                s
            ))),
        }
    }
}

impl HashAlgorithm {
    /// Digest content with this algorithm.
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha1 => sha1::Sha1::digest(data).to_vec(),
            Self::Sha256 => sha2::Sha256::digest(data).to_vec(),
        }
    }

    /// XML-DSig `DigestMethod` algorithm URI.
    pub fn digest_method_uri(&self) -> &'static str {
        match self {
            Self::Sha1 => "http://www.w3.org/2000/09/xmldsig#sha1",
            Self::Sha256 => "http://www.w3.org/2001/04/xmlenc#sha256",
        }
    }

    /// XML-DSig `SignatureMethod` algorithm URI.
    pub fn signature_method_uri(&self) -> &'static str {
        match self {
            Self::Sha1 => "http://www.w3.org/2000/09/xmldsig#rsa-sha1",
            Self::Sha256 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256",
        }
    }

    pub fn from_digest_method_uri(uri: &str) -> Option<Self> {
        [Self::Sha1, Self::Sha256]
            .into_iter()
            .find(|alg| alg.digest_method_uri() == uri)
    }

    pub fn from_signature_method_uri(uri: &str) -> Option<Self> {
        [Self::Sha1, Self::Sha256]
            .into_iter()
            .find(|alg| alg.signature_method_uri() == uri)
    }

    /// Name of the algorithm as accepted by `mage -a`.
    pub fn mage_name(&self) -> &'static str {
        match self {
            Self::Sha1 => "sha1RSA",
            Self::Sha256 => "sha256RSA",
        }
    }

    pub fn digest_algorithm(&self) -> x509_certificate::DigestAlgorithm {
        match self {
            Self::Sha1 => x509_certificate::DigestAlgorithm::Sha1,
            Self::Sha256 => x509_certificate::DigestAlgorithm::Sha256,
        }
    }
}

/// Which normalization produced a manifest hash.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HashFormat {
    /// The serialized document was re-parsed with whitespace preserved before canonicalization.
    Current,
    /// The in-memory document was canonicalized as given.
    Legacy,
}

/// Computes the content hash of a manifest.
///
/// The hash covers the canonical form of the document with any signature on
/// the root element removed, mirroring the enveloped signature transform.
pub fn compute_manifest_hash(
    document: &Document,
    algorithm: HashAlgorithm,
    legacy_format: bool,
) -> Result<Vec<u8>, ClickOnceCodesignError> {
    let mut working = document.clone();
    working.root.remove_children(&[DSIG_NAMESPACE], "Signature");

    let canonical = if legacy_format {
        canonicalize_document(&working)
    } else {
        let normalized = working.reparsed()?;
        canonicalize_document(&normalized)
    };

    let digest = algorithm.digest(&canonical);

    if digest.is_empty() {
        return Err(ClickOnceCodesignError::verification(
            VerificationFailure::BadDigest,
            "manifest hash is empty",
        ));
    }

    debug!(
        "{} manifest {} hash: {}",
        if legacy_format { "legacy" } else { "current" },
        algorithm,
        hex::encode(&digest)
    );

    Ok(digest)
}

/// Compare a recorded manifest hash against the current then the legacy normalization.
pub fn match_manifest_hash(
    document: &Document,
    algorithm: HashAlgorithm,
    recorded: &[u8],
) -> Result<Option<HashFormat>, ClickOnceCodesignError> {
    if compute_manifest_hash(document, algorithm, false)? == recorded {
        return Ok(Some(HashFormat::Current));
    }

    if compute_manifest_hash(document, algorithm, true)? == recorded {
        return Ok(Some(HashFormat::Legacy));
    }

    Ok(None)
}
