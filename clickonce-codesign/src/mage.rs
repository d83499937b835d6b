// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driver for the `mage` manifest generation and editing tool.

use {
    crate::{
        canonical_hash::HashAlgorithm, error::ClickOnceCodesignError,
        orchestrator::ManifestUpdateTool,
    },
    log::{error, info},
    std::path::{Path, PathBuf},
};

/// A request to update the metadata of a manifest.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ManifestUpdate {
    /// Manifest to update in place.
    pub manifest: PathBuf,
    pub algorithm: HashAlgorithm,
    /// Application name recorded in the manifest.
    pub name: String,
    /// Publisher name. Deployment manifests only.
    pub publisher: Option<String>,
    /// Application manifest referenced by a deployment manifest.
    pub application_manifest: Option<PathBuf>,
    /// Support URL. Deployment manifests only.
    pub support_url: Option<String>,
}

impl ManifestUpdate {
    /// An update of an application manifest.
    pub fn application(manifest: impl AsRef<Path>, algorithm: HashAlgorithm) -> Self {
        let manifest = manifest.as_ref().to_path_buf();

        Self {
            name: manifest_stem(&manifest),
            manifest,
            algorithm,
            publisher: None,
            application_manifest: None,
            support_url: None,
        }
    }

    /// An update of a deployment manifest referencing an application manifest.
    pub fn deployment(
        manifest: impl AsRef<Path>,
        algorithm: HashAlgorithm,
        publisher: Option<&str>,
        application_manifest: impl AsRef<Path>,
        support_url: Option<&str>,
    ) -> Self {
        let manifest = manifest.as_ref().to_path_buf();

        Self {
            name: manifest_stem(&manifest),
            manifest,
            algorithm,
            publisher: publisher.map(|x| x.to_string()),
            application_manifest: Some(application_manifest.as_ref().to_path_buf()),
            support_url: support_url.map(|x| x.to_string()),
        }
    }

    /// Command line arguments expressing this update.
    pub fn arguments(&self) -> Vec<String> {
        let mut args = vec![
            "-update".to_string(),
            self.manifest.display().to_string(),
            "-a".to_string(),
            self.algorithm.mage_name().to_string(),
            "-n".to_string(),
            self.name.clone(),
        ];

        if let Some(publisher) = &self.publisher {
            args.push("-pub".to_string());
            args.push(publisher.clone());
        }

        if let Some(path) = &self.application_manifest {
            args.push("-appm".to_string());
            args.push(path.display().to_string());
        }

        if let Some(url) = &self.support_url {
            args.push("-SupportURL".to_string());
            args.push(url.clone());
        }

        args
    }
}

/// File name of a manifest without its final extension.
fn manifest_stem(path: &Path) -> String {
    path.file_stem()
        .map(|x| x.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// [ManifestUpdateTool] running an external `mage` executable.
#[derive(Clone, Debug)]
pub struct MageTool {
    program: PathBuf,
}

impl Default for MageTool {
    fn default() -> Self {
        Self::new("mage")
    }
}

impl MageTool {
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl ManifestUpdateTool for MageTool {
    fn update_manifest(&self, update: &ManifestUpdate) -> Result<(), ClickOnceCodesignError> {
        let args = update.arguments();
        info!("invoking {} with args: {:?}", self.program.display(), args);

        // Bare program names are looked up on PATH. duct treats path types
        // as relative to the working directory.
        let output = duct::cmd(self.program.as_os_str(), &args)
            .stderr_to_stdout()
            .stdout_capture()
            .unchecked()
            .run()?;

        let text = String::from_utf8_lossy(&output.stdout);

        if output.status.success() {
            for line in text.lines() {
                info!("mage> {}", line);
            }

            Ok(())
        } else {
            for line in text.lines() {
                error!("mage> {}", line);
            }

            Err(ClickOnceCodesignError::ToolInvocationFailure {
                program: self.program.display().to_string(),
                status: output.status.to_string(),
                stderr: text.trim().to_string(),
            })
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn application_arguments() {
        let update = ManifestUpdate::application(
            Path::new("App_1_0_0_0").join("App.exe.manifest"),
            HashAlgorithm::Sha256,
        );

        assert_eq!(update.name, "App.exe");
        assert_eq!(
            update.arguments(),
            vec![
                "-update".to_string(),
                Path::new("App_1_0_0_0")
                    .join("App.exe.manifest")
                    .display()
                    .to_string(),
                "-a".to_string(),
                HashAlgorithm::Sha256.mage_name().to_string(),
                "-n".to_string(),
                "App.exe".to_string(),
            ]
        );
    }

    #[test]
    fn deployment_arguments() {
        let update = ManifestUpdate::deployment(
            "App.application",
            HashAlgorithm::Sha1,
            Some("Contoso"),
            "App.exe.manifest",
            Some("https://contoso.example/support"),
        );

        assert_eq!(
            update.arguments(),
            vec![
                "-update",
                "App.application",
                "-a",
                HashAlgorithm::Sha1.mage_name(),
                "-n",
                "App",
                "-pub",
                "Contoso",
                "-appm",
                "App.exe.manifest",
                "-SupportURL",
                "https://contoso.example/support",
            ]
        );

        let update = ManifestUpdate::deployment(
            "App.application",
            HashAlgorithm::Sha1,
            None,
            "App.exe.manifest",
            None,
        );
        let args = update.arguments();
        assert!(!args.contains(&"-SupportURL".to_string()));
        assert!(!args.contains(&"-pub".to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn exit_status_reported() {
        let update = ManifestUpdate::application("App.exe.manifest", HashAlgorithm::Sha256);

        MageTool::new("true").update_manifest(&update).unwrap();

        let err = MageTool::new("false").update_manifest(&update).unwrap_err();
        assert!(matches!(
            err,
            ClickOnceCodesignError::ToolInvocationFailure { .. }
        ));
    }

    #[cfg(unix)]
    #[test]
    fn bare_program_found_on_path() {
        let update = ManifestUpdate::application("App.exe.manifest", HashAlgorithm::Sha256);
        let tool = MageTool::new("echo");

        assert_eq!(tool.program(), Path::new("echo"));
        tool.update_manifest(&update).unwrap();
    }

    #[test]
    fn missing_program_is_io_error() {
        let update = ManifestUpdate::application("App.exe.manifest", HashAlgorithm::Sha256);

        assert!(matches!(
            MageTool::new("clickonce-codesign-no-such-mage").update_manifest(&update),
            Err(ClickOnceCodesignError::Io(_))
        ));
    }
}
