// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Signing of individual manifests.

Signing a manifest produces a strong name signature on the manifest root.
When a publisher certificate is configured, the strong name signature's
`KeyInfo` also carries a license signed with the certificate's key
(Authenticode), optionally time-stamped.

Signing proceeds in a fixed order, as later steps cover the output of
earlier ones:

1. Any existing signature on the manifest root is removed.
2. The public key token of the `assemblyIdentity` is replaced.
3. A `publisherIdentity` element records the certificate subject.
4. The license is built over the manifest hash, then signed.
5. The strong name signature is computed over the whole manifest.
*/

use {
    crate::{
        canonicalization::canonicalize_document,
        document::{Document, Element},
        error::ClickOnceCodesignError,
        license::{publisher_subject_name, wrap_license, LicenseBuilder},
        manifest::{assembly_identity, assembly_identity_mut, declared_prefix, ASM_V2_NAMESPACE},
        signature::{rsa_key_value, XmlSigner, DSIG_NAMESPACE},
        signing_key::{certificate_rsa_public_key, SigningProvider},
        signing_settings::SigningSettings,
        strong_name::{issuer_key_hash, PortableStrongNamePrimitives, StrongNamePrimitives},
        time_stamp::{HttpTimeStampClient, TimeStampClient},
    },
    log::{info, warn},
    std::path::Path,
};

/// ID of the strong name signature on a manifest root.
pub const STRONG_NAME_SIGNATURE_ID: &str = "StrongNameSignature";

/// ID of the `KeyInfo` of the strong name signature.
pub const STRONG_NAME_KEY_INFO_ID: &str = "StrongNameKeyInfo";

/// Signs manifests according to [SigningSettings].
pub struct ManifestSigner<'a> {
    settings: &'a SigningSettings<'a>,
    time_stamp_client: &'a dyn TimeStampClient,
    primitives: &'a dyn StrongNamePrimitives,
}

impl<'a> ManifestSigner<'a> {
    /// Construct a signer using HTTP time-stamping and portable primitives.
    pub fn new(settings: &'a SigningSettings<'a>) -> Self {
        Self {
            settings,
            time_stamp_client: &HttpTimeStampClient,
            primitives: &PortableStrongNamePrimitives,
        }
    }

    pub fn with_time_stamp_client(mut self, client: &'a dyn TimeStampClient) -> Self {
        self.time_stamp_client = client;
        self
    }

    pub fn with_primitives(mut self, primitives: &'a dyn StrongNamePrimitives) -> Self {
        self.primitives = primitives;
        self
    }

    pub fn settings(&self) -> &SigningSettings<'a> {
        self.settings
    }

    /// Sign a manifest file, writing the result to `output_path`.
    ///
    /// Input and output may be the same path.
    pub fn sign_path(
        &self,
        input_path: impl AsRef<Path>,
        output_path: impl AsRef<Path>,
    ) -> Result<(), ClickOnceCodesignError> {
        let input_path = input_path.as_ref();
        let output_path = output_path.as_ref();

        info!("signing {}", input_path.display());
        let mut document = Document::from_path(input_path)?;
        self.sign_document(&mut document)?;

        info!("writing signed manifest to {}", output_path.display());
        document.write_to_path(output_path)
    }

    /// Sign a parsed manifest in place.
    pub fn sign_document(&self, document: &mut Document) -> Result<(), ClickOnceCodesignError> {
        let settings = self.settings;
        let key = settings.signing_key().ok_or_else(|| {
            ClickOnceCodesignError::SigningKey("no signing key configured".into())
        })?;
        let algorithm = settings.hash_algorithm();
        let provider = SigningProvider::for_algorithm(key, algorithm)?;
        let public_key = provider.rsa_public_key()?;
        let signer = XmlSigner::new(algorithm);

        let signature_position = document
            .root
            .child_position(&[DSIG_NAMESPACE], "Signature");
        if document.root.remove_children(&[DSIG_NAMESPACE], "Signature") > 0 {
            warn!("replacing existing manifest signature");
        }

        if settings.replace_public_key_token() {
            let token = self.primitives.public_key_token(&public_key)?;
            assembly_identity_mut(&mut document.root)?.set_attribute("publicKeyToken", token);
        } else {
            assembly_identity(&document.root)?;
        }

        let license = if let Some(cert) = settings.signing_certificate() {
            if certificate_rsa_public_key(cert)? != public_key {
                return Err(ClickOnceCodesignError::SigningKey(
                    "signing certificate does not match the signing key".into(),
                ));
            }

            let subject = publisher_subject_name(cert)?;
            set_publisher_identity(
                &mut document.root,
                &subject,
                &issuer_key_hash(cert, settings.certificate_chain())?,
                signature_position,
            );

            let manifest_hash = self.primitives.manifest_hash(document, algorithm, false)?;
            let identity = assembly_identity(&document.root)?.clone();

            let time_stamp = settings
                .time_stamp_url()
                .map(|url| (self.time_stamp_client, url));

            let license = LicenseBuilder::new(&identity, &manifest_hash, &subject)
                .description(settings.description())
                .url(settings.description_url())
                .build_and_sign(
                    &signer,
                    &provider,
                    &settings.license_certificates(),
                    time_stamp,
                )?;

            Some(license)
        } else {
            None
        };

        let normalized = document.reparsed()?;
        let reference = signer.enveloped_reference(&canonicalize_document(&normalized));

        let mut key_info = Element::new_ns(None, "KeyInfo", DSIG_NAMESPACE)
            .with_attribute("Id", STRONG_NAME_KEY_INFO_ID)
            .with_child(rsa_key_value(&public_key));
        if let Some(license) = license {
            key_info.push(wrap_license(license));
        }

        let signature = signer.sign(&provider, STRONG_NAME_SIGNATURE_ID, &[reference], key_info)?;
        document.root.push(signature);

        Ok(())
    }
}

/// Record the publisher on a manifest root.
///
/// An existing `publisherIdentity` is updated in place. Otherwise one is
/// inserted where the previous signature was, or appended.
fn set_publisher_identity(
    root: &mut Element,
    subject: &str,
    issuer_key_hash: &str,
    position: Option<usize>,
) {
    if let Some(existing) = root.child_mut(&[ASM_V2_NAMESPACE], "publisherIdentity") {
        existing.set_attribute("name", subject);
        existing.set_attribute("issuerKeyHash", issuer_key_hash);
        return;
    }

    let prefix = declared_prefix(root, ASM_V2_NAMESPACE);
    let element = Element::new_ns(prefix.as_deref(), "publisherIdentity", ASM_V2_NAMESPACE)
        .with_attribute("name", subject)
        .with_attribute("issuerKeyHash", issuer_key_hash);

    match position {
        Some(position) if position <= root.children.len() => {
            root.children.insert(position, element.into())
        }
        _ => root.push(element),
    }
}
