// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    cryptographic_message_syntax::{CmsError, TimeStampError},
    std::path::PathBuf,
    thiserror::Error,
    x509_certificate::X509CertificateError,
};

/// Reason a manifest signature failed verification.
///
/// The names mirror the trust provider result codes that Windows reports for
/// manifests, so they can be surfaced to users familiar with those tools.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VerificationFailure {
    /// The manifest does not carry a signature.
    NoSignature,
    /// The signature or its references have an unexpected shape.
    SubjectFormUnknown,
    /// A digest or cryptographic signature did not match.
    BadDigest,
    /// The signature over a certificate did not verify.
    CertSignatureInvalid,
    /// The signing certificate is not trusted.
    SubjectNotTrusted,
    /// The signing certificate is explicitly distrusted or revoked.
    ExplicitlyDistrusted,
    /// Key material could not be imported or exported.
    BadKey,
    /// A generic identity binding failure.
    Fail,
}

impl std::fmt::Display for VerificationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::NoSignature => "no signature",
            Self::SubjectFormUnknown => "subject form unknown",
            Self::BadDigest => "bad digest",
            Self::CertSignatureInvalid => "certificate signature invalid",
            Self::SubjectNotTrusted => "subject not trusted",
            Self::ExplicitlyDistrusted => "explicitly distrusted",
            Self::BadKey => "bad key",
            Self::Fail => "failure",
        })
    }
}

/// Unified error type for ClickOnce code signing.
#[derive(Debug, Error)]
pub enum ClickOnceCodesignError {
    #[error("unknown command")]
    CliUnknownCommand,

    #[error("bad argument")]
    CliBadArgument,

    #[error("{0}")]
    CliGeneralError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("directory walk error: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("{failure}: {message}")]
    Verification {
        failure: VerificationFailure,
        message: String,
    },

    #[error("time-stamp authority request failed: {0}")]
    TimestampFailure(String),

    #[error("could not find {}; {hint}", path.display())]
    ResolutionFailure { path: PathBuf, hint: String },

    #[error("{program} exited with {status}: {stderr}")]
    ToolInvocationFailure {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("error parsing XML: {0}")]
    XmlParse(#[from] xml::reader::Error),

    #[error("error writing XML: {0}")]
    XmlWrite(#[from] xml::writer::Error),

    #[error("malformed manifest: {0}")]
    ManifestMalformed(String),

    #[error("X.509 certificate handler error: {0}")]
    X509(#[from] X509CertificateError),

    #[error("X.509 certificate parsing error: {0}")]
    X509Parse(String),

    #[error("CMS error: {0}")]
    Cms(#[from] CmsError),

    #[error("RSA error: {0}")]
    Rsa(#[from] rsa::Error),

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("PEM error: {0}")]
    CertificatePem(pem::PemError),

    #[error("HTTP error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("PFX data is not valid: {0}")]
    PfxParseError(String),

    #[error("bad PFX password")]
    PfxBadPassword,

    #[error("signing key could not be used: {0}")]
    SigningKey(String),

    #[error("signing step {step} failed for {}: {source}", path.display())]
    SigningStep {
        step: &'static str,
        path: PathBuf,
        #[source]
        source: Box<ClickOnceCodesignError>,
    },
}

impl ClickOnceCodesignError {
    /// Construct a verification error with a reason code.
    pub fn verification(failure: VerificationFailure, message: impl ToString) -> Self {
        Self::Verification {
            failure,
            message: message.to_string(),
        }
    }

    /// The verification reason code, looking through wrapping step errors.
    pub fn verification_failure(&self) -> Option<VerificationFailure> {
        match self {
            Self::Verification { failure, .. } => Some(*failure),
            Self::SigningStep { source, .. } => source.verification_failure(),
            _ => None,
        }
    }

    /// Whether the operation producing this error may succeed if tried again.
    ///
    /// Only time-stamp authority failures are retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TimestampFailure(_) => true,
            Self::SigningStep { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Wrap this error with the orchestration step that produced it.
    pub fn in_step(self, step: &'static str, path: impl Into<PathBuf>) -> Self {
        Self::SigningStep {
            step,
            path: path.into(),
            source: Box::new(self),
        }
    }
}

impl From<TimeStampError> for ClickOnceCodesignError {
    fn from(e: TimeStampError) -> Self {
        Self::TimestampFailure(e.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn retryable_through_step() {
        let err = ClickOnceCodesignError::TimestampFailure("offline".into())
            .in_step("sign deployment manifest", "app.application");
        assert!(err.is_retryable());

        let err = ClickOnceCodesignError::verification(VerificationFailure::BadDigest, "digest")
            .in_step("sign application manifest", "app.exe.manifest");
        assert!(!err.is_retryable());
        assert_eq!(
            err.verification_failure(),
            Some(VerificationFailure::BadDigest)
        );
    }

    #[test]
    fn resolution_failure_message() {
        let err = ClickOnceCodesignError::ResolutionFailure {
            path: PathBuf::from("Application Files/App_1_0_0_0/App.exe.manifest"),
            hint: "use --no-update-manifest to sign without updating manifests".into(),
        };

        let message = err.to_string();
        assert!(message.contains("Application Files/App_1_0_0_0/App.exe.manifest"));
        assert!(message.contains("--no-update-manifest"));
    }
}
