// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Certificate trust evaluation for license signatures.

Chains are built from the signing certificate through the certificates
embedded in the license and the locally configured trust anchors. Each
link is cryptographically verified. Revocation is checked against CRLs
named by the certificates' CRL distribution points.
*/

use {
    crate::error::{ClickOnceCodesignError, VerificationFailure},
    chrono::{DateTime, Utc},
    log::{debug, warn},
    std::time::Duration,
    x509_certificate::CapturedX509Certificate,
    x509_parser::prelude::{DistributionPointName, GeneralName, ParsedExtension},
};

/// Extended key usage marking certificates whose signatures expire with them.
pub const LIFETIME_SIGNING_EKU_OID: &str = "1.3.6.1.4.1.311.10.3.13";

/// Extended key usage required of time-stamp authority certificates.
pub const TIME_STAMPING_EKU_OID: &str = "1.3.6.1.5.5.7.3.8";

/// Timeout applied to CRL retrieval.
pub const CRL_RETRIEVAL_TIMEOUT: Duration = Duration::from_secs(15);

const MAX_CHAIN_DEPTH: usize = 16;

/// Which certificates of a chain are checked for revocation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RevocationMode {
    NoCheck,
    EndCertOnly,
    EntireChain,
}

/// Retrieves certificate revocation lists.
pub trait CrlFetcher {
    /// Fetch the DER encoded CRL at a URL.
    fn fetch_crl(&self, url: &str) -> Result<Vec<u8>, ClickOnceCodesignError>;
}

/// [CrlFetcher] downloading CRLs over HTTP.
#[derive(Clone, Debug)]
pub struct HttpCrlFetcher {
    client: reqwest::blocking::Client,
}

impl HttpCrlFetcher {
    pub fn new() -> Result<Self, ClickOnceCodesignError> {
        Ok(Self {
            client: reqwest::blocking::Client::builder()
                .timeout(CRL_RETRIEVAL_TIMEOUT)
                .build()?,
        })
    }
}

impl CrlFetcher for HttpCrlFetcher {
    fn fetch_crl(&self, url: &str) -> Result<Vec<u8>, ClickOnceCodesignError> {
        debug!("fetching CRL {}", url);
        let response = self.client.get(url).send()?.error_for_status()?;

        Ok(response.bytes()?.to_vec())
    }
}

fn not_trusted(message: impl ToString) -> ClickOnceCodesignError {
    ClickOnceCodesignError::verification(VerificationFailure::SubjectNotTrusted, message)
}

fn parse_error(e: impl std::fmt::Display) -> ClickOnceCodesignError {
    ClickOnceCodesignError::X509Parse(e.to_string())
}

fn display_name(cert: &CapturedX509Certificate) -> String {
    cert.subject_name()
        .user_friendly_str()
        .unwrap_or_else(|_| "<unknown subject>".to_string())
}

/// Whether two certificates are the same encoded certificate.
pub fn same_certificate(a: &CapturedX509Certificate, b: &CapturedX509Certificate) -> bool {
    a.constructed_data() == b.constructed_data()
}

/// Extended key usage OIDs of a certificate, or `None` if the extension is absent.
pub fn extended_key_usages(
    cert: &CapturedX509Certificate,
) -> Result<Option<Vec<String>>, ClickOnceCodesignError> {
    let (_, parsed) =
        x509_parser::parse_x509_certificate(cert.constructed_data()).map_err(parse_error)?;

    let eku = match parsed.extended_key_usage().map_err(parse_error)? {
        Some(eku) => eku.value,
        None => return Ok(None),
    };

    let mut oids = eku.other.iter().map(|o| o.to_id_string()).collect::<Vec<_>>();
    if eku.code_signing {
        oids.push("1.3.6.1.5.5.7.3.3".to_string());
    }
    if eku.time_stamping {
        oids.push(TIME_STAMPING_EKU_OID.to_string());
    }
    if eku.any {
        oids.push("2.5.29.37.0".to_string());
    }

    Ok(Some(oids))
}

/// Whether a certificate carries the lifetime signing extended key usage.
pub fn has_lifetime_signing_eku(
    cert: &CapturedX509Certificate,
) -> Result<bool, ClickOnceCodesignError> {
    Ok(extended_key_usages(cert)?
        .map(|oids| oids.iter().any(|o| o == LIFETIME_SIGNING_EKU_OID))
        .unwrap_or(false))
}

/// Whether a certificate may issue time-stamps.
pub fn has_time_stamping_eku(
    cert: &CapturedX509Certificate,
) -> Result<bool, ClickOnceCodesignError> {
    Ok(extended_key_usages(cert)?
        .map(|oids| oids.iter().any(|o| o == TIME_STAMPING_EKU_OID))
        .unwrap_or(false))
}

/// URIs of a certificate's CRL distribution points.
pub fn crl_distribution_points(
    cert: &CapturedX509Certificate,
) -> Result<Vec<String>, ClickOnceCodesignError> {
    let (_, parsed) =
        x509_parser::parse_x509_certificate(cert.constructed_data()).map_err(parse_error)?;

    let mut urls = vec![];
    for extension in parsed.extensions() {
        if let ParsedExtension::CRLDistributionPoints(points) = extension.parsed_extension() {
            for point in points.iter() {
                if let Some(DistributionPointName::FullName(names)) = &point.distribution_point {
                    for name in names {
                        if let GeneralName::URI(uri) = name {
                            urls.push(uri.to_string());
                        }
                    }
                }
            }
        }
    }

    Ok(urls)
}

/// Build a chain from `leaf` to a trusted self-issued certificate.
///
/// Issuers are searched in `intermediates` then `anchors`. The chain is
/// trusted if it ends in a certificate in `anchors`, or if `leaf` is a
/// self-issued certificate in `trusted_publishers`.
pub fn build_chain(
    leaf: &CapturedX509Certificate,
    intermediates: &[CapturedX509Certificate],
    anchors: &[CapturedX509Certificate],
    trusted_publishers: &[CapturedX509Certificate],
) -> Result<Vec<CapturedX509Certificate>, ClickOnceCodesignError> {
    let mut chain = vec![leaf.clone()];

    loop {
        let current = chain.last().cloned().ok_or_else(|| not_trusted("empty chain"))?;

        if current.subject_is_issuer() {
            current.verify_signed_by_certificate(&current).map_err(|e| {
                ClickOnceCodesignError::verification(
                    VerificationFailure::CertSignatureInvalid,
                    format!("self-signature of {} invalid: {}", display_name(&current), e),
                )
            })?;

            let anchored = anchors.iter().any(|a| same_certificate(a, &current))
                || (chain.len() == 1
                    && trusted_publishers.iter().any(|p| same_certificate(p, &current)));

            return if anchored {
                Ok(chain)
            } else {
                Err(not_trusted(format!(
                    "chain ends in untrusted root {}",
                    display_name(&current)
                )))
            };
        }

        if chain.len() >= MAX_CHAIN_DEPTH {
            return Err(not_trusted("certificate chain too long"));
        }

        let mut candidates = intermediates
            .iter()
            .chain(anchors.iter())
            .filter(|c| c.subject_name() == current.issuer_name())
            .peekable();

        if candidates.peek().is_none() {
            return Err(not_trusted(format!(
                "issuer of {} not found",
                display_name(&current)
            )));
        }

        let issuer = candidates
            .find(|c| current.verify_signed_by_certificate(c).is_ok())
            .ok_or_else(|| {
                ClickOnceCodesignError::verification(
                    VerificationFailure::CertSignatureInvalid,
                    format!("signature on {} does not verify", display_name(&current)),
                )
            })?;

        if chain.iter().any(|c| same_certificate(c, issuer)) {
            return Err(not_trusted("certificate chain contains a loop"));
        }

        chain.push(issuer.clone());
    }
}

/// Check every certificate of a chain is valid at a time.
pub fn check_validity(
    chain: &[CapturedX509Certificate],
    time: DateTime<Utc>,
) -> Result<(), ClickOnceCodesignError> {
    for cert in chain {
        if !cert.time_constraints_valid(Some(time)) {
            return Err(not_trusted(format!(
                "{} is not valid at {} (valid {} to {})",
                display_name(cert),
                time,
                cert.validity_not_before(),
                cert.validity_not_after()
            )));
        }
    }

    Ok(())
}

/// Check `cert` against the CRLs it names, verified with `issuer`'s key.
pub fn check_revocation(
    cert: &CapturedX509Certificate,
    issuer: &CapturedX509Certificate,
    fetcher: &dyn CrlFetcher,
) -> Result<(), ClickOnceCodesignError> {
    let urls = crl_distribution_points(cert)?;

    if urls.is_empty() {
        warn!(
            "{} has no CRL distribution points; revocation not checked",
            display_name(cert)
        );
        return Ok(());
    }

    let (_, parsed_cert) =
        x509_parser::parse_x509_certificate(cert.constructed_data()).map_err(parse_error)?;
    let (_, parsed_issuer) =
        x509_parser::parse_x509_certificate(issuer.constructed_data()).map_err(parse_error)?;

    let mut last_error = None;

    for url in urls {
        let data = match fetcher.fetch_crl(&url) {
            Ok(data) => data,
            Err(e) => {
                warn!("unable to retrieve CRL {}: {}", url, e);
                last_error = Some(e);
                continue;
            }
        };

        let (_, crl) = x509_parser::parse_x509_crl(&data)
            .map_err(|e| not_trusted(format!("CRL {} is malformed: {}", url, e)))?;

        crl.verify_signature(parsed_issuer.public_key())
            .map_err(|_| not_trusted(format!("CRL {} is not signed by the issuer", url)))?;

        if crl
            .iter_revoked_certificates()
            .any(|revoked| revoked.raw_serial() == parsed_cert.raw_serial())
        {
            return Err(ClickOnceCodesignError::verification(
                VerificationFailure::ExplicitlyDistrusted,
                format!("{} has been revoked", display_name(cert)),
            ));
        }

        debug!("{} not revoked per {}", display_name(cert), url);
        return Ok(());
    }

    Err(not_trusted(format!(
        "revocation status of {} unknown: {}",
        display_name(cert),
        last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no CRL retrieved".to_string())
    )))
}

/// Check revocation of chain members according to a mode.
pub fn check_chain_revocation(
    chain: &[CapturedX509Certificate],
    mode: RevocationMode,
    fetcher: &dyn CrlFetcher,
) -> Result<(), ClickOnceCodesignError> {
    let checked = match mode {
        RevocationMode::NoCheck => 0,
        RevocationMode::EndCertOnly => 1,
        RevocationMode::EntireChain => chain.len(),
    };

    for pair in chain.windows(2).take(checked) {
        check_revocation(&pair[0], &pair[1], fetcher)?;
    }

    Ok(())
}
