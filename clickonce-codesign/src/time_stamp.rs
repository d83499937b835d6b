// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! RFC 3161 time-stamp tokens for license signatures.

use {
    crate::{
        canonical_hash::HashAlgorithm,
        error::{ClickOnceCodesignError, VerificationFailure},
    },
    bcder::{decode::Constructed, encode::Values, Mode},
    chrono::{DateTime, Utc},
    cryptographic_message_syntax::{
        asn1::rfc3161::TstInfo, time_stamp_message_http, SignedData,
    },
    log::{info, warn},
    reqwest::Url,
    x509_certificate::CapturedX509Certificate,
};

/// Obtains time-stamp tokens from a time-stamp authority.
pub trait TimeStampClient {
    /// Time-stamp a message.
    ///
    /// Returns the DER encoded `ContentInfo` of the time-stamp token.
    /// Failures must be reported as [ClickOnceCodesignError::TimestampFailure].
    fn time_stamp(
        &self,
        message: &[u8],
        url: &Url,
        algorithm: HashAlgorithm,
    ) -> Result<Vec<u8>, ClickOnceCodesignError>;
}

/// [TimeStampClient] speaking the Time-Stamp Protocol over HTTP.
#[derive(Clone, Copy, Debug, Default)]
pub struct HttpTimeStampClient;

impl TimeStampClient for HttpTimeStampClient {
    fn time_stamp(
        &self,
        message: &[u8],
        url: &Url,
        algorithm: HashAlgorithm,
    ) -> Result<Vec<u8>, ClickOnceCodesignError> {
        info!("requesting time-stamp token from {}", url);

        let response =
            time_stamp_message_http(url.clone(), message, algorithm.digest_algorithm())?;

        if !response.is_success() {
            return Err(ClickOnceCodesignError::TimestampFailure(format!(
                "{} did not grant the time-stamp request",
                url
            )));
        }

        let token = response.time_stamp_token.as_ref().ok_or_else(|| {
            ClickOnceCodesignError::TimestampFailure(format!(
                "{} returned no time-stamp token",
                url
            ))
        })?;

        let mut der = vec![];
        token.write_encoded(Mode::Der, &mut der)?;

        Ok(der)
    }
}

/// A verified time-stamp.
#[derive(Clone, Debug)]
pub struct VerifiedTimeStamp {
    /// Time asserted by the time-stamp authority.
    pub time: DateTime<Utc>,
    /// Certificate of the time-stamp authority that signed the token.
    pub signer: CapturedX509Certificate,
    /// Certificates embedded in the token.
    pub certificates: Vec<CapturedX509Certificate>,
}

fn bad_token(message: impl ToString) -> ClickOnceCodesignError {
    ClickOnceCodesignError::verification(VerificationFailure::BadDigest, message)
}

/// Whether a message imprint covers `message`.
///
/// The imprint algorithm is inferred from the digest length.
fn imprint_matches(hashed_message: &[u8], message: &[u8]) -> bool {
    [HashAlgorithm::Sha1, HashAlgorithm::Sha256]
        .into_iter()
        .any(|alg| alg.digest(message) == hashed_message)
}

/// Verify a time-stamp token over `message` and extract its time.
///
/// Signer signatures and message digests of the token are verified, as is
/// the message imprint. Trust in the time-stamp authority itself is not
/// evaluated here: callers must establish it from [VerifiedTimeStamp::signer]
/// before relying on the asserted time.
pub fn verify_time_stamp_token(
    token: &[u8],
    message: &[u8],
) -> Result<VerifiedTimeStamp, ClickOnceCodesignError> {
    let signed_data = SignedData::parse_ber(token)
        .map_err(|e| bad_token(format!("time-stamp token is not SignedData: {}", e)))?;

    let mut tsa_certificate = None;
    for signer in signed_data.signers() {
        signer
            .verify_signature_with_signed_data(&signed_data)
            .map_err(|e| bad_token(format!("time-stamp token signature invalid: {}", e)))?;
        signer
            .verify_message_digest_with_signed_data(&signed_data)
            .map_err(|e| bad_token(format!("time-stamp token digest invalid: {}", e)))?;

        if tsa_certificate.is_none() {
            let (issuer, serial) = signer
                .certificate_issuer_and_serial()
                .ok_or_else(|| bad_token("time-stamp signer is not identified by issuer"))?;

            tsa_certificate = Some(
                signed_data
                    .certificates()
                    .find(|c| c.issuer_name() == issuer && c.serial_number_asn1() == serial)
                    .cloned()
                    .ok_or_else(|| {
                        bad_token("time-stamp token does not carry its signing certificate")
                    })?,
            );
        }
    }

    let signer = tsa_certificate.ok_or_else(|| bad_token("time-stamp token has no signers"))?;

    let content = signed_data
        .signed_content()
        .ok_or_else(|| bad_token("time-stamp token has no content"))?;

    let tst_info = Constructed::decode(content, Mode::Der, TstInfo::take_from)
        .map_err(|e| bad_token(format!("invalid TSTInfo: {}", e)))?;

    if !imprint_matches(tst_info.message_imprint.hashed_message.to_bytes().as_ref(), message) {
        warn!("time-stamp token message imprint does not match the signature");
        return Err(bad_token(
            "time-stamp token does not cover the signature value",
        ));
    }

    Ok(VerifiedTimeStamp {
        time: tst_info.gen_time.into(),
        signer,
        certificates: signed_data.certificates().cloned().collect(),
    })
}

#[cfg(test)]
pub(crate) mod test {
    use {
        super::*,
        crate::trust::test::{SELF_SIGNED_PEM, TSA_PEM},
        bytes::Bytes,
        chrono::TimeZone,
        cryptographic_message_syntax::{
            asn1::rfc3161::OID_CONTENT_TYPE_TST_INFO, SignedDataBuilder, SignerBuilder,
        },
        x509_certificate::InMemorySigningKeyPair,
    };

    const SIGNER_PKCS8_DER: &[u8] = include_bytes!("testdata/signer.pk8");

    /// Issue a time-stamp token over `message` asserting `time`, signed under `tsa_pem`.
    ///
    /// All test certificates share the signer key, so any of them can act as
    /// the authority.
    pub(crate) fn issue_token(message: &[u8], time: DateTime<Utc>, tsa_pem: &str) -> Vec<u8> {
        let digest = HashAlgorithm::Sha256.digest(message);
        let gen_time = time.format("%Y%m%d%H%M%SZ").to_string();

        let tst_info = yasna::construct_der(|w| {
            w.write_sequence(|w| {
                w.next().write_u8(1);
                w.next()
                    .write_oid(&yasna::models::ObjectIdentifier::from_slice(&[1, 2, 3, 4, 1]));
                w.next().write_sequence(|w| {
                    w.next().write_sequence(|w| {
                        w.next().write_oid(&yasna::models::ObjectIdentifier::from_slice(&[
                            2, 16, 840, 1, 101, 3, 4, 2, 1,
                        ]));
                        w.next().write_null();
                    });
                    w.next().write_bytes(&digest);
                });
                w.next().write_u8(42);
                let mut generalized = vec![0x18, gen_time.len() as u8];
                generalized.extend_from_slice(gen_time.as_bytes());
                w.next().write_der(&generalized);
            })
        });

        let key = InMemorySigningKeyPair::from_pkcs8_der(SIGNER_PKCS8_DER).unwrap();
        let cert = CapturedX509Certificate::from_pem(tsa_pem).unwrap();
        let content_type = bcder::Oid(Bytes::copy_from_slice(OID_CONTENT_TYPE_TST_INFO.as_ref()));

        SignedDataBuilder::default()
            .content_inline(tst_info)
            .content_type(content_type.clone())
            .certificate(cert.clone())
            .signer(SignerBuilder::new(&key, cert).content_type(content_type))
            .build_der()
            .unwrap()
    }

    #[test]
    fn issued_token_verifies() -> Result<(), ClickOnceCodesignError> {
        let time = Utc.with_ymd_and_hms(2030, 6, 1, 12, 0, 0).unwrap();
        let token = issue_token(b"signature value", time, TSA_PEM);

        let verified = verify_time_stamp_token(&token, b"signature value")?;
        assert_eq!(verified.time, time);
        assert_eq!(
            verified.signer,
            CapturedX509Certificate::from_pem(TSA_PEM)?
        );

        let err = verify_time_stamp_token(&token, b"other value").unwrap_err();
        assert_eq!(err.verification_failure(), Some(VerificationFailure::BadDigest));

        let forged = issue_token(b"signature value", time, SELF_SIGNED_PEM);
        assert_eq!(
            verify_time_stamp_token(&forged, b"signature value")?.signer,
            CapturedX509Certificate::from_pem(SELF_SIGNED_PEM)?
        );

        Ok(())
    }

    #[test]
    fn imprint_algorithms() {
        let message = b"signature value";

        assert!(imprint_matches(&HashAlgorithm::Sha1.digest(message), message));
        assert!(imprint_matches(&HashAlgorithm::Sha256.digest(message), message));
        assert!(!imprint_matches(&HashAlgorithm::Sha256.digest(b"other"), message));
        assert!(!imprint_matches(&[], message));
    }

    #[test]
    fn garbage_token_rejected() {
        let err = verify_time_stamp_token(&[0x30, 0x03, 0x02, 0x01, 0x01], b"message").unwrap_err();
        assert_eq!(err.verification_failure(), Some(VerificationFailure::BadDigest));
    }
}
