// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Discovery and staging of ClickOnce deployments.

A deployment is resolved from a manifest path into its deployment manifest,
application manifest and payload files. Work happens on staged copies of
exactly those files so a failed signing operation leaves the original
untouched.
*/

use {
    crate::{
        document::Document,
        error::ClickOnceCodesignError,
        manifest::{
            ApplicationManifest, DeploymentManifest, FileReference, ManifestKind, PayloadFile,
            DEPLOY_SUFFIX,
        },
    },
    log::{debug, info, warn},
    std::path::{Path, PathBuf},
    tempfile::TempDir,
};

const NO_UPDATE_HINT: &str =
    "pass --no-update-manifest to sign the deployment manifest without updating it";

/// Append the `.deploy` suffix to a path.
pub fn deploy_suffixed(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(DEPLOY_SUFFIX);

    PathBuf::from(name)
}

/// A resolved deployment.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ResolvedDeployment {
    /// Absent when the input is a standalone application manifest.
    pub deployment_manifest: Option<PathBuf>,
    /// Absent when payload discovery was disabled for a deployment manifest.
    pub application_manifest: Option<PathBuf>,
    pub payload: Vec<PayloadFile>,
}

impl ResolvedDeployment {
    /// Every file taking part in signing the deployment.
    pub fn files(&self) -> Vec<PathBuf> {
        self.deployment_manifest
            .iter()
            .chain(self.application_manifest.iter())
            .cloned()
            .chain(self.payload.iter().map(|f| f.path.clone()))
            .collect()
    }

    /// Rewrite every path of this deployment.
    pub fn map_paths(
        &self,
        f: impl Fn(&Path) -> Result<PathBuf, ClickOnceCodesignError>,
    ) -> Result<Self, ClickOnceCodesignError> {
        Ok(Self {
            deployment_manifest: self.deployment_manifest.as_deref().map(&f).transpose()?,
            application_manifest: self.application_manifest.as_deref().map(&f).transpose()?,
            payload: self
                .payload
                .iter()
                .map(|file| {
                    Ok(PayloadFile {
                        target: file.target.clone(),
                        path: f(&file.path)?,
                        deploy_suffixed: file.deploy_suffixed,
                    })
                })
                .collect::<Result<Vec<_>, ClickOnceCodesignError>>()?,
        })
    }
}

/// Resolves manifest paths into deployments.
#[derive(Clone, Debug)]
pub struct DeploymentResolver {
    discover_payload: bool,
}

impl Default for DeploymentResolver {
    fn default() -> Self {
        Self {
            discover_payload: true,
        }
    }
}

impl DeploymentResolver {
    /// Whether to follow a deployment manifest to its application manifest and payload.
    pub fn with_payload_discovery(mut self, value: bool) -> Self {
        self.discover_payload = value;
        self
    }

    pub fn resolve(&self, input: &Path) -> Result<ResolvedDeployment, ClickOnceCodesignError> {
        let document = Document::from_path(input)?;

        match ManifestKind::detect(&document, input)? {
            ManifestKind::Application => {
                debug!("{} is a standalone application manifest", input.display());
                Ok(ResolvedDeployment {
                    deployment_manifest: None,
                    application_manifest: Some(input.to_path_buf()),
                    payload: vec![],
                })
            }
            ManifestKind::Deployment if !self.discover_payload => {
                info!("skipping application manifest discovery for {}", input.display());
                Ok(ResolvedDeployment {
                    deployment_manifest: Some(input.to_path_buf()),
                    application_manifest: None,
                    payload: vec![],
                })
            }
            ManifestKind::Deployment => {
                let deployment = DeploymentManifest::new(input, document);
                let reference = deployment.application_reference()?;
                let application_path = deployment.application_manifest_path()?;

                if !application_path.is_file() {
                    return Err(ClickOnceCodesignError::ResolutionFailure {
                        path: reference.relative_path()?,
                        hint: format!(
                            "the application manifest referenced by {} was not found; {}",
                            input.display(),
                            NO_UPDATE_HINT
                        ),
                    });
                }

                info!("found application manifest {}", application_path.display());
                let application = ApplicationManifest::from_path(&application_path)?;
                let deployment_dir = input.parent().unwrap_or_else(|| Path::new(""));
                let map_extensions = deployment.maps_file_extensions();

                let payload = application
                    .file_references()
                    .iter()
                    .map(|reference| {
                        resolve_payload_file(
                            reference,
                            &application_path,
                            deployment_dir,
                            map_extensions,
                        )
                    })
                    .collect::<Result<Vec<_>, _>>()?;

                Ok(ResolvedDeployment {
                    deployment_manifest: Some(input.to_path_buf()),
                    application_manifest: Some(application_path),
                    payload,
                })
            }
        }
    }
}

/// Locate a payload file on disk.
///
/// Files are searched next to the application manifest, then relative to the
/// deployment manifest. In each place the `.deploy` suffixed name is tried
/// first when the deployment maps file extensions, last otherwise.
fn resolve_payload_file(
    reference: &FileReference,
    application_manifest: &Path,
    deployment_dir: &Path,
    map_extensions: bool,
) -> Result<PayloadFile, ClickOnceCodesignError> {
    let relative = reference.relative_path()?;
    let application_dir = application_manifest.parent().unwrap_or_else(|| Path::new(""));

    for base in [application_dir, deployment_dir] {
        let literal = base.join(&relative);
        let candidates = if map_extensions {
            [(deploy_suffixed(&literal), true), (literal, false)]
        } else {
            [(literal.clone(), false), (deploy_suffixed(&literal), true)]
        };

        for (path, suffixed) in candidates {
            if path.is_file() {
                if suffixed != map_extensions {
                    warn!(
                        "{} does not follow the deployment's mapFileExtensions setting",
                        path.display()
                    );
                }

                return Ok(PayloadFile {
                    target: reference.target.clone(),
                    path,
                    deploy_suffixed: suffixed,
                });
            }
        }
    }

    Err(ClickOnceCodesignError::ResolutionFailure {
        path: application_dir.join(&relative),
        hint: format!(
            "payload file is referenced by {}; {}",
            application_manifest.display(),
            NO_UPDATE_HINT
        ),
    })
}

/// Renames `.deploy` payload files to their manifest-declared names.
///
/// The original names are restored by [Self::restore] or when the guard is
/// dropped.
#[derive(Debug, Default)]
pub struct DeploySuffixGuard {
    /// (suffixed, unsuffixed) pairs currently renamed.
    renamed: Vec<(PathBuf, PathBuf)>,
}

impl DeploySuffixGuard {
    pub fn strip(payload: &[PayloadFile]) -> Result<Self, ClickOnceCodesignError> {
        let mut guard = Self::default();

        for file in payload.iter().filter(|f| f.deploy_suffixed) {
            let plain = file.unsuffixed_path();
            debug!("renaming {} to {}", file.path.display(), plain.display());
            std::fs::rename(&file.path, &plain)?;
            guard.renamed.push((file.path.clone(), plain));
        }

        Ok(guard)
    }

    /// Number of files currently renamed.
    pub fn len(&self) -> usize {
        self.renamed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.renamed.is_empty()
    }

    /// Restore the `.deploy` names, reporting the first failure.
    pub fn restore(mut self) -> Result<(), ClickOnceCodesignError> {
        self.restore_all()
    }

    fn restore_all(&mut self) -> Result<(), ClickOnceCodesignError> {
        let mut first_error = None;

        while let Some((suffixed, plain)) = self.renamed.pop() {
            debug!("restoring {}", suffixed.display());
            if let Err(e) = std::fs::rename(&plain, &suffixed) {
                warn!("unable to restore {}: {}", suffixed.display(), e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

impl Drop for DeploySuffixGuard {
    fn drop(&mut self) {
        if !self.renamed.is_empty() {
            // Errors are logged by restore_all().
            let _ = self.restore_all();
        }
    }
}

/// Copies of deployment files to operate on.
///
/// Files keep their location relative to the source root. Changes reach the
/// original directory only through [Self::commit]. Dropping an uncommitted
/// staging area discards it.
#[derive(Debug)]
pub struct StagedDeployment {
    source_root: PathBuf,
    temp_dir: TempDir,
}

impl StagedDeployment {
    /// Copy `files`, each located under `root`, into a temporary directory.
    pub fn stage(root: impl AsRef<Path>, files: &[PathBuf]) -> Result<Self, ClickOnceCodesignError> {
        let staged = Self {
            source_root: root.as_ref().to_path_buf(),
            temp_dir: tempfile::Builder::new()
                .prefix("clickonce-codesign-")
                .tempdir()?,
        };

        for source in files {
            let dest = staged.staged_path(source)?;
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(source, &dest)?;
        }

        info!(
            "staged {} files from {} in {}",
            files.len(),
            staged.source_root.display(),
            staged.staged_root().display()
        );

        Ok(staged)
    }

    /// Stage the files of a resolved deployment.
    ///
    /// Returns the staging area and the deployment resolved to staged paths.
    pub fn stage_deployment(
        root: impl AsRef<Path>,
        resolved: &ResolvedDeployment,
    ) -> Result<(Self, ResolvedDeployment), ClickOnceCodesignError> {
        let staged = Self::stage(root, &resolved.files())?;
        let staged_resolved = resolved.map_paths(|path| staged.staged_path(path))?;

        Ok((staged, staged_resolved))
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    pub fn staged_root(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Map a path under the source root to its staged copy.
    pub fn staged_path(&self, original: &Path) -> Result<PathBuf, ClickOnceCodesignError> {
        let relative = original.strip_prefix(&self.source_root).map_err(|_| {
            ClickOnceCodesignError::ResolutionFailure {
                path: original.to_path_buf(),
                hint: format!("path is not within {}", self.source_root.display()),
            }
        })?;

        Ok(self.staged_root().join(relative))
    }

    /// Map a staged path back to the source root.
    pub fn original_path(&self, staged: &Path) -> PathBuf {
        staged
            .strip_prefix(self.staged_root())
            .map(|relative| self.source_root.join(relative))
            .unwrap_or_else(|_| staged.to_path_buf())
    }

    /// Copy changed files back to the source directory.
    ///
    /// Returns the paths written.
    pub fn commit(self) -> Result<Vec<PathBuf>, ClickOnceCodesignError> {
        let mut written = vec![];

        for (relative, staged) in relative_files(self.staged_root())? {
            let dest = self.source_root.join(&relative);
            let data = std::fs::read(&staged)?;

            if dest.is_file() && std::fs::read(&dest)? == data {
                continue;
            }

            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            debug!("writing {}", dest.display());
            std::fs::write(&dest, &data)?;
            written.push(dest);
        }

        info!("committed {} changed files", written.len());

        Ok(written)
    }
}

/// Files under a directory as (relative path, absolute path) pairs.
fn relative_files(root: &Path) -> Result<Vec<(PathBuf, PathBuf)>, ClickOnceCodesignError> {
    let mut files = vec![];

    for entry in walkdir::WalkDir::new(root).sort_by(|a, b| a.file_name().cmp(b.file_name())) {
        let entry = entry?;

        if entry.file_type().is_file() {
            if let Ok(relative) = entry.path().strip_prefix(root) {
                files.push((relative.to_path_buf(), entry.path().to_path_buf()));
            }
        }
    }

    Ok(files)
}
