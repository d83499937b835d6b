// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signing and verification of ClickOnce deployment manifests.
//!
//! ClickOnce deployments consist of a deployment manifest (`.application`)
//! referencing an application manifest (`.manifest`), which in turn references
//! the payload files of the application. Each manifest carries up to two XML
//! signatures:
//!
//! * A *strong name* signature, an enveloped XML-DSig signature made with
//!   the publisher's RSA key and embedding that key.
//! * A *publisher* (Authenticode) signature, embedded inside the strong name
//!   signature as a signed license binding the manifest hash to an X.509
//!   certificate, optionally counter-signed by a time-stamp authority.
//!
//! This crate implements both without a dependency on Windows.
//!
//! # Features and Capabilities
//!
//! This crate can:
//!
//! * Parse manifests into a namespace-aware tree and canonicalize it with
//!   Exclusive XML Canonicalization. (See [Document] and
//!   [canonicalize_document].)
//! * Compute the canonical hash of a manifest with the strong name signature
//!   excluded. (See [compute_manifest_hash].)
//! * Sign manifests with SHA-1 or SHA-256 strong names, publisher licenses and
//!   RFC 3161 time-stamps. (See [ManifestSigner].)
//! * Verify signed manifests, including certificate chain building, trust
//!   decisions and CRL based revocation checking. (See [ManifestVerifier].)
//! * Resolve a deployment into its manifests and payload files, refresh the
//!   sizes and hashes the manifests record, and sign everything in the right
//!   order. (See [DeploymentResolver] and [DeploymentOrchestrator].)
//!
//! Things this crate does not do:
//!
//! * Hardware backed keys or OS certificate stores. Keys are loaded from
//!   PFX or PEM data.
//! * Online certificate status (OCSP). Revocation relies on CRLs only.
//! * Payload signing beyond nested manifests. Other payload files are handed
//!   to an [AggregatingSigner], which callers may implement.

mod canonical_hash;
pub use canonical_hash::*;
mod canonicalization;
pub use canonicalization::*;
pub mod deployment;
pub use deployment::*;
mod document;
pub use document::*;
mod error;
pub use error::*;
mod license;
pub use license::*;
pub mod mage;
pub use mage::*;
pub mod manifest;
pub use manifest::*;
mod manifest_signing;
pub use manifest_signing::*;
mod orchestrator;
pub use orchestrator::*;
mod signature;
pub use signature::*;
mod signing_key;
pub use signing_key::*;
mod signing_settings;
pub use signing_settings::*;
mod strong_name;
pub use strong_name::*;
mod time_stamp;
pub use time_stamp::*;
mod trust;
pub use trust::*;
mod verify;
pub use verify::*;
