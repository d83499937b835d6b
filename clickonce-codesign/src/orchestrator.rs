// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Signing of whole ClickOnce deployments.

[DeploymentOrchestrator] resolves each input into a deployment, refreshes
its manifests, has payload files signed, then signs the application
manifest followed by the deployment manifest. All work happens on a staged
copy which is committed only after every step succeeded.

External parties are reached through the collaborator traits in this
module: [KeyProvider], [CertificateProvider], [ManifestUpdateTool] and
[AggregatingSigner].
*/

use {
    crate::{
        deployment::{DeploySuffixGuard, DeploymentResolver, ResolvedDeployment, StagedDeployment},
        error::ClickOnceCodesignError,
        license::publisher_subject_name,
        mage::{MageTool, ManifestUpdate},
        manifest::{ApplicationManifest, DeploymentManifest, PayloadFile},
        manifest_signing::ManifestSigner,
        signing_key::{parse_pem_data, parse_pfx_data, ManifestSigningKey, RsaSigningKey},
        signing_settings::{OrchestratorSettings, SigningSettings},
        time_stamp::{HttpTimeStampClient, TimeStampClient},
    },
    log::{info, warn},
    std::{
        collections::BTreeSet,
        path::{Path, PathBuf},
    },
    x509_certificate::CapturedX509Certificate,
};

/// Supplies the private key manifests are signed with.
///
/// Providers may be shared by concurrently signed deployments.
pub trait KeyProvider: Send + Sync {
    fn signing_key(&self) -> Result<&dyn ManifestSigningKey, ClickOnceCodesignError>;
}

/// Supplies the publisher certificate, if any.
pub trait CertificateProvider: Send + Sync {
    /// The publisher certificate. Without one, only strong names are produced.
    fn signing_certificate(&self) -> Result<Option<CapturedX509Certificate>, ClickOnceCodesignError>;

    /// Additional certificates of the publisher certificate's chain.
    fn certificate_chain(&self) -> Result<Vec<CapturedX509Certificate>, ClickOnceCodesignError> {
        Ok(vec![])
    }
}

/// Refreshes the metadata of a manifest in place.
pub trait ManifestUpdateTool {
    fn update_manifest(&self, update: &ManifestUpdate) -> Result<(), ClickOnceCodesignError>;
}

/// Signs payload files of a deployment.
pub trait AggregatingSigner {
    /// Sign files in place. Called once per deployment.
    fn sign_files(
        &self,
        files: &[PathBuf],
        settings: &SigningSettings,
    ) -> Result<(), ClickOnceCodesignError>;
}

/// A key with optional certificates, loaded from PFX or PEM data.
#[derive(Clone, Debug)]
pub struct SigningIdentity {
    key: RsaSigningKey,
    certificate: Option<CapturedX509Certificate>,
    chain: Vec<CapturedX509Certificate>,
}

impl SigningIdentity {
    /// An identity producing strong name signatures only.
    pub fn from_key(key: RsaSigningKey) -> Self {
        Self {
            key,
            certificate: None,
            chain: vec![],
        }
    }

    pub fn from_pfx_data(data: &[u8], password: &str) -> Result<Self, ClickOnceCodesignError> {
        let (key, certificate, chain) = parse_pfx_data(data, password)?;

        Ok(Self {
            key,
            certificate: Some(certificate),
            chain,
        })
    }

    pub fn from_pem_data(data: &[u8]) -> Result<Self, ClickOnceCodesignError> {
        let (key, certificate, chain) = parse_pem_data(data)?;

        Ok(Self {
            key,
            certificate: Some(certificate),
            chain,
        })
    }

    pub fn key(&self) -> &RsaSigningKey {
        &self.key
    }

    pub fn certificate(&self) -> Option<&CapturedX509Certificate> {
        self.certificate.as_ref()
    }
}

impl KeyProvider for SigningIdentity {
    fn signing_key(&self) -> Result<&dyn ManifestSigningKey, ClickOnceCodesignError> {
        Ok(&self.key)
    }
}

impl CertificateProvider for SigningIdentity {
    fn signing_certificate(&self) -> Result<Option<CapturedX509Certificate>, ClickOnceCodesignError> {
        Ok(self.certificate.clone())
    }

    fn certificate_chain(&self) -> Result<Vec<CapturedX509Certificate>, ClickOnceCodesignError> {
        Ok(self.chain.clone())
    }
}

/// [AggregatingSigner] signing nested manifests among payload files.
///
/// Other payload files are left untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct ManifestPayloadSigner;

impl AggregatingSigner for ManifestPayloadSigner {
    fn sign_files(
        &self,
        files: &[PathBuf],
        settings: &SigningSettings,
    ) -> Result<(), ClickOnceCodesignError> {
        let signer = ManifestSigner::new(settings);

        for path in files {
            let is_manifest = path
                .extension()
                .map(|x| x.eq_ignore_ascii_case("manifest"))
                .unwrap_or(false);

            if is_manifest {
                signer.sign_path(path, path)?;
            } else {
                warn!(
                    "{} is not a manifest; no signer configured for it",
                    path.display()
                );
            }
        }

        Ok(())
    }
}

/// Signs ClickOnce deployments.
pub struct DeploymentOrchestrator<'a> {
    settings: &'a OrchestratorSettings,
    signing: SigningSettings<'a>,
    key_provider: &'a dyn KeyProvider,
    certificate_provider: &'a dyn CertificateProvider,
    update_tool: Option<&'a dyn ManifestUpdateTool>,
    default_update_tool: MageTool,
    aggregating_signer: &'a dyn AggregatingSigner,
    time_stamp_client: &'a dyn TimeStampClient,
}

impl<'a> DeploymentOrchestrator<'a> {
    /// Construct an orchestrator.
    ///
    /// `signing` provides the hash algorithm, time-stamp URL and license
    /// description. The key and certificates come from the providers.
    pub fn new(
        settings: &'a OrchestratorSettings,
        signing: SigningSettings<'a>,
        key_provider: &'a dyn KeyProvider,
        certificate_provider: &'a dyn CertificateProvider,
    ) -> Self {
        Self {
            settings,
            signing,
            key_provider,
            certificate_provider,
            update_tool: None,
            default_update_tool: MageTool::new(settings.update_tool_path()),
            aggregating_signer: &ManifestPayloadSigner,
            time_stamp_client: &HttpTimeStampClient,
        }
    }

    pub fn with_update_tool(mut self, tool: &'a dyn ManifestUpdateTool) -> Self {
        self.update_tool = Some(tool);
        self
    }

    pub fn with_aggregating_signer(mut self, signer: &'a dyn AggregatingSigner) -> Self {
        self.aggregating_signer = signer;
        self
    }

    pub fn with_time_stamp_client(mut self, client: &'a dyn TimeStampClient) -> Self {
        self.time_stamp_client = client;
        self
    }

    fn update_tool(&self) -> &dyn ManifestUpdateTool {
        match self.update_tool {
            Some(tool) => tool,
            None => &self.default_update_tool,
        }
    }

    /// Sign every distinct deployment among `inputs`.
    ///
    /// An application manifest already reached through a deployment
    /// manifest in `inputs` is not signed a second time.
    pub fn sign(&self, inputs: &[PathBuf]) -> Result<(), ClickOnceCodesignError> {
        let signing = self.signing_settings()?;

        let mut ordered = inputs.to_vec();
        ordered.sort_by_key(|p| {
            !p.extension()
                .map(|x| x.eq_ignore_ascii_case("application"))
                .unwrap_or(false)
        });

        let mut seen = BTreeSet::new();

        for input in ordered {
            let key = std::fs::canonicalize(&input).unwrap_or_else(|_| input.clone());
            if !seen.insert(key) {
                info!("{} already signed as part of a deployment", input.display());
                continue;
            }

            for covered in self.sign_deployment(&input, &signing)? {
                seen.insert(std::fs::canonicalize(&covered).unwrap_or(covered));
            }
        }

        Ok(())
    }

    /// Assemble signing settings from the template and the providers.
    fn signing_settings(&self) -> Result<SigningSettings<'a>, ClickOnceCodesignError> {
        let mut signing = self.signing.clone();
        let key_provider: &'a dyn KeyProvider = self.key_provider;
        signing.set_signing_key(key_provider.signing_key()?);

        if let Some(cert) = self.certificate_provider.signing_certificate()? {
            signing.set_signing_certificate(cert);
            for cert in self.certificate_provider.certificate_chain()? {
                signing.chain_certificate(cert);
            }
        }

        Ok(signing)
    }

    /// Publisher name given to the update tool.
    fn publisher(&self, signing: &SigningSettings) -> Result<Option<String>, ClickOnceCodesignError> {
        if let Some(publisher) = self.settings.publisher() {
            return Ok(Some(publisher.to_string()));
        }

        signing
            .signing_certificate()
            .map(|cert| publisher_subject_name(cert).map(|name| name.replace('"', "")))
            .transpose()
    }

    /// Run `f`, retrying time-stamp failures.
    fn with_time_stamp_retries(
        &self,
        mut f: impl FnMut() -> Result<(), ClickOnceCodesignError>,
    ) -> Result<(), ClickOnceCodesignError> {
        let mut attempt = 0;

        loop {
            match f() {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.settings.time_stamp_retries() => {
                    attempt += 1;
                    warn!(
                        "{}; retrying ({} of {})",
                        e,
                        attempt,
                        self.settings.time_stamp_retries()
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Sign a single deployment. Returns the original paths of the signed manifests.
    fn sign_deployment(
        &self,
        input: &Path,
        signing: &SigningSettings,
    ) -> Result<Vec<PathBuf>, ClickOnceCodesignError> {
        let root = input.parent().unwrap_or_else(|| Path::new("."));
        let root = if root.as_os_str().is_empty() {
            Path::new(".")
        } else {
            root
        };

        let input = root.join(input.file_name().unwrap_or_default());

        let resolved = DeploymentResolver::default()
            .with_payload_discovery(!self.settings.no_update_manifest())
            .resolve(&input)?;
        let (staged, resolved) = StagedDeployment::stage_deployment(root, &resolved)?;

        self.process(&staged, &resolved, signing)?;

        let signed = resolved
            .deployment_manifest
            .iter()
            .chain(resolved.application_manifest.iter())
            .map(|p| staged.original_path(p))
            .collect::<Vec<_>>();

        staged.commit()?;

        for path in &signed {
            info!("signed {}", path.display());
        }

        Ok(signed)
    }

    fn process(
        &self,
        staged: &StagedDeployment,
        resolved: &ResolvedDeployment,
        signing: &SigningSettings,
    ) -> Result<(), ClickOnceCodesignError> {
        let settings = self.settings;
        let signer = ManifestSigner::new(signing).with_time_stamp_client(self.time_stamp_client);

        if let Some(app_path) = &resolved.application_manifest {
            let original = staged.original_path(app_path);

            if !settings.no_update_manifest() {
                self.update_application(app_path, &resolved.payload, signing)
                    .map_err(|e| e.in_step("update application manifest", &original))?;
            }

            if resolved.deployment_manifest.is_none() || !settings.no_sign_dependencies() {
                info!("signing application manifest {}", original.display());
                self.with_time_stamp_retries(|| signer.sign_path(app_path, app_path))
                    .map_err(|e| e.in_step("sign application manifest", &original))?;
            } else {
                warn!(
                    "not signing application manifest {}: dependency signing disabled",
                    original.display()
                );
            }
        }

        if let Some(deployment_path) = &resolved.deployment_manifest {
            let original = staged.original_path(deployment_path);

            if let Some(app_path) = &resolved.application_manifest {
                self.update_deployment(deployment_path, app_path, signing)
                    .map_err(|e| e.in_step("update deployment manifest", &original))?;
            }

            info!("signing deployment manifest {}", original.display());
            self.with_time_stamp_retries(|| signer.sign_path(deployment_path, deployment_path))
                .map_err(|e| e.in_step("sign deployment manifest", &original))?;
        }

        Ok(())
    }

    /// Refresh the deployment manifest's reference to the application manifest.
    fn update_deployment(
        &self,
        deployment_path: &Path,
        app_path: &Path,
        signing: &SigningSettings,
    ) -> Result<(), ClickOnceCodesignError> {
        let algorithm = signing.hash_algorithm();
        let publisher = self.publisher(signing)?;

        let mut deployment = DeploymentManifest::from_path(deployment_path)?;
        let application = ApplicationManifest::from_path(app_path)?;
        deployment.update_application_reference(&application, algorithm)?;
        deployment.save()?;

        self.update_tool().update_manifest(&ManifestUpdate::deployment(
            deployment_path,
            algorithm,
            publisher.as_deref(),
            app_path,
            self.settings.support_url(),
        ))
    }

    /// Sign payload and refresh the application manifest.
    ///
    /// Payload files carry their manifest-declared names for the duration.
    fn update_application(
        &self,
        app_path: &Path,
        payload: &[PayloadFile],
        signing: &SigningSettings,
    ) -> Result<(), ClickOnceCodesignError> {
        let guard = DeploySuffixGuard::strip(payload)?;

        let plain = payload
            .iter()
            .map(|file| PayloadFile {
                target: file.target.clone(),
                path: file.unsuffixed_path(),
                deploy_suffixed: false,
            })
            .collect::<Vec<_>>();

        if !self.settings.no_sign_dependencies() && !plain.is_empty() {
            let files = plain.iter().map(|f| f.path.clone()).collect::<Vec<_>>();
            info!("signing {} payload files", files.len());
            self.aggregating_signer.sign_files(&files, signing)?;
        }

        let mut application = ApplicationManifest::from_path(app_path)?;
        let updated = application.update_file_hashes(&plain, signing.hash_algorithm())?;
        application.save()?;
        info!("recorded {} payload files in application manifest", updated);

        self.update_tool()
            .update_manifest(&ManifestUpdate::application(app_path, signing.hash_algorithm()))?;

        guard.restore()
    }
}
