// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Strong name primitives.

A strong name binds an assembly identity to an RSA key through the public
key token: the trailing 8 bytes of the SHA-1 digest of the key's strong name
blob, in reverse order. The blob is a `PUBLICKEYBLOB` prefixed by the
signature and hash algorithm identifiers.

These primitives sit behind [StrongNamePrimitives] so platform crypto
implementations can be substituted.
*/

use {
    crate::{
        canonical_hash::{compute_manifest_hash, HashAlgorithm},
        document::Document,
        error::{ClickOnceCodesignError, VerificationFailure},
    },
    digest::Digest,
    rsa::{traits::PublicKeyParts, RsaPublicKey},
    x509_certificate::CapturedX509Certificate,
};

/// `CALG_RSA_SIGN`
const CALG_RSA_SIGN: u32 = 0x0000_2400;
/// `CALG_SHA1`
const CALG_SHA1: u32 = 0x0000_8004;
const PUBLICKEYBLOB: u8 = 0x06;
const CUR_BLOB_VERSION: u8 = 0x02;
/// `RSA1` in little-endian.
const RSA1_MAGIC: u32 = 0x3141_5352;

/// Serialize an RSA public key as a strong name public key blob.
pub fn strong_name_key_blob(key: &RsaPublicKey) -> Result<Vec<u8>, ClickOnceCodesignError> {
    let exponent = key.e().to_bytes_le();
    if exponent.len() > 4 {
        return Err(ClickOnceCodesignError::verification(
            VerificationFailure::BadKey,
            "RSA public exponent does not fit in 32 bits",
        ));
    }

    let modulus_len = key.size();
    let mut modulus = key.n().to_bytes_le();
    modulus.resize(modulus_len, 0);

    let mut exponent_bytes = [0u8; 4];
    exponent_bytes[..exponent.len()].copy_from_slice(&exponent);

    let mut public_key_blob = Vec::with_capacity(20 + modulus_len);
    public_key_blob.push(PUBLICKEYBLOB);
    public_key_blob.push(CUR_BLOB_VERSION);
    public_key_blob.extend_from_slice(&0u16.to_le_bytes());
    public_key_blob.extend_from_slice(&CALG_RSA_SIGN.to_le_bytes());
    public_key_blob.extend_from_slice(&RSA1_MAGIC.to_le_bytes());
    public_key_blob.extend_from_slice(&((modulus_len * 8) as u32).to_le_bytes());
    public_key_blob.extend_from_slice(&exponent_bytes);
    public_key_blob.extend_from_slice(&modulus);

    let mut blob = Vec::with_capacity(12 + public_key_blob.len());
    blob.extend_from_slice(&CALG_RSA_SIGN.to_le_bytes());
    blob.extend_from_slice(&CALG_SHA1.to_le_bytes());
    blob.extend_from_slice(&(public_key_blob.len() as u32).to_le_bytes());
    blob.extend_from_slice(&public_key_blob);

    Ok(blob)
}

/// Compute the public key token of an RSA key, as 16 lowercase hex characters.
pub fn public_key_token(key: &RsaPublicKey) -> Result<String, ClickOnceCodesignError> {
    let digest = sha1::Sha1::digest(strong_name_key_blob(key)?);

    let token = digest.iter().rev().take(8).copied().collect::<Vec<_>>();

    Ok(hex::encode(token))
}

/// Hex SHA-1 of a certificate's public key, as recorded in `issuerKeyHash`.
pub fn public_key_hash(cert: &CapturedX509Certificate) -> String {
    hex::encode(sha1::Sha1::digest(cert.public_key_data()))
}

/// Find the `issuerKeyHash` of a certificate given candidate issuers.
///
/// A self-issued certificate is its own issuer.
pub fn issuer_key_hash(
    cert: &CapturedX509Certificate,
    chain: &[CapturedX509Certificate],
) -> Result<String, ClickOnceCodesignError> {
    if cert.subject_is_issuer() {
        return Ok(public_key_hash(cert));
    }

    chain
        .iter()
        .find(|candidate| {
            candidate.subject_name() == cert.issuer_name()
                && cert.verify_signed_by_certificate(candidate).is_ok()
        })
        .map(public_key_hash)
        .ok_or_else(|| {
            ClickOnceCodesignError::verification(
                VerificationFailure::BadKey,
                format!(
                    "issuer of {} not found in certificate chain",
                    cert.subject_common_name().unwrap_or_default()
                ),
            )
        })
}

/// Primitives for public key tokens and manifest hashes.
pub trait StrongNamePrimitives {
    /// Public key token of an RSA key.
    fn public_key_token(&self, key: &RsaPublicKey) -> Result<String, ClickOnceCodesignError>;

    /// Content hash of a manifest document.
    fn manifest_hash(
        &self,
        document: &Document,
        algorithm: HashAlgorithm,
        legacy_format: bool,
    ) -> Result<Vec<u8>, ClickOnceCodesignError>;
}

/// [StrongNamePrimitives] implemented with pure Rust cryptography.
#[derive(Clone, Copy, Debug, Default)]
pub struct PortableStrongNamePrimitives;

impl StrongNamePrimitives for PortableStrongNamePrimitives {
    fn public_key_token(&self, key: &RsaPublicKey) -> Result<String, ClickOnceCodesignError> {
        public_key_token(key)
    }

    fn manifest_hash(
        &self,
        document: &Document,
        algorithm: HashAlgorithm,
        legacy_format: bool,
    ) -> Result<Vec<u8>, ClickOnceCodesignError> {
        compute_manifest_hash(document, algorithm, legacy_format)
    }
}
