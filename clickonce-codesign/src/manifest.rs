// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Deployment and application manifests.

A ClickOnce deployment consists of a deployment manifest (`.application`)
referencing an application manifest (`.manifest`) by relative path. The
application manifest lists the payload files of the application along with
their sizes and digests.

This module provides typed views over the two manifest roles and the update
pass recording payload sizes and digests back into them.
*/

use {
    crate::{
        canonical_hash::HashAlgorithm,
        document::{Document, Element},
        error::ClickOnceCodesignError,
        signature::DSIG_NAMESPACE,
    },
    log::{debug, warn},
    std::path::{Path, PathBuf},
};

/// Assembly manifest namespace.
pub const ASM_V1_NAMESPACE: &str = "urn:schemas-microsoft-com:asm.v1";

/// Assembly manifest extensions namespace. Also home of `publisherIdentity`.
pub const ASM_V2_NAMESPACE: &str = "urn:schemas-microsoft-com:asm.v2";

/// Namespaces manifest elements may appear in.
pub const ASSEMBLY_NAMESPACES: &[&str] = &[ASM_V1_NAMESPACE, ASM_V2_NAMESPACE];

/// Hash transform recorded for payload digests.
pub const IDENTITY_HASH_TRANSFORM: &str = "urn:schemas-microsoft-com:HashTransforms.Identity";

/// Suffix appended to payload file names when extensions are mapped.
pub const DEPLOY_SUFFIX: &str = ".deploy";

fn malformed(message: impl ToString) -> ClickOnceCodesignError {
    ClickOnceCodesignError::ManifestMalformed(message.to_string())
}

/// Obtain the `assemblyIdentity` of a manifest root.
pub fn assembly_identity(root: &Element) -> Result<&Element, ClickOnceCodesignError> {
    root.child(ASSEMBLY_NAMESPACES, "assemblyIdentity")
        .ok_or_else(|| malformed("manifest has no assemblyIdentity"))
}

pub fn assembly_identity_mut(root: &mut Element) -> Result<&mut Element, ClickOnceCodesignError> {
    root.child_mut(ASSEMBLY_NAMESPACES, "assemblyIdentity")
        .ok_or_else(|| malformed("manifest has no assemblyIdentity"))
}

/// The prefix a root element binds to a namespace, if any.
pub fn declared_prefix(root: &Element, namespace: &str) -> Option<String> {
    root.namespace_declarations
        .iter()
        .find(|(prefix, uri)| prefix.is_some() && uri == namespace)
        .and_then(|(prefix, _)| prefix.clone())
}

/// Role of a manifest in a deployment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ManifestKind {
    Deployment,
    Application,
}

impl ManifestKind {
    /// Determine the role of a manifest from its content, then its file extension.
    pub fn detect(document: &Document, path: &Path) -> Result<Self, ClickOnceCodesignError> {
        let root = &document.root;

        if root.child(ASSEMBLY_NAMESPACES, "deployment").is_some() {
            return Ok(Self::Deployment);
        }
        if root.child(ASSEMBLY_NAMESPACES, "entryPoint").is_some()
            || root.child(ASSEMBLY_NAMESPACES, "application").is_some()
        {
            return Ok(Self::Application);
        }

        match path
            .extension()
            .and_then(|x| x.to_str())
            .map(|x| x.to_ascii_lowercase())
            .as_deref()
        {
            Some("application") => Ok(Self::Deployment),
            Some("manifest") => Ok(Self::Application),
            _ => Err(ClickOnceCodesignError::ResolutionFailure {
                path: path.to_path_buf(),
                hint: "expected a deployment (.application) or application (.manifest) manifest"
                    .to_string(),
            }),
        }
    }
}

/// Convert a manifest codebase into a relative filesystem path.
///
/// Manifests use `\` separators. Directory structure is preserved. A codebase
/// must stay within the directory it is resolved against: rooted paths, drive
/// or scheme prefixes and `..` components are rejected.
pub fn codebase_to_path(codebase: &str) -> Result<PathBuf, ClickOnceCodesignError> {
    let outside = |reason: &str| ClickOnceCodesignError::ResolutionFailure {
        path: PathBuf::from(codebase),
        hint: format!(
            "codebase {}; manifests may only reference files within the deployment",
            reason
        ),
    };

    if codebase.starts_with(|c| c == '\\' || c == '/') {
        return Err(outside("is rooted"));
    }

    let mut path = PathBuf::new();
    for component in codebase.split(|c| c == '\\' || c == '/') {
        match component {
            "" | "." => {}
            ".." => return Err(outside("refers to a parent directory")),
            c if c.contains(':') => return Err(outside("has a drive or scheme prefix")),
            c => path.push(c),
        }
    }

    if path.as_os_str().is_empty() {
        return Err(outside("is empty"));
    }

    Ok(path)
}

/// Kind of a payload reference in an application manifest.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileReferenceKind {
    /// A `file` element.
    File,
    /// A `dependentAssembly` installed with the application.
    DependentAssembly,
}

/// A reference to a file declared by a manifest.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileReference {
    pub kind: FileReferenceKind,
    /// Target path as written in the manifest.
    pub target: String,
    /// Declared size, if any.
    pub size: Option<u64>,
}

impl FileReference {
    /// Relative filesystem path of the target.
    pub fn relative_path(&self) -> Result<PathBuf, ClickOnceCodesignError> {
        codebase_to_path(&self.target)
    }
}

/// A payload file resolved on disk.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PayloadFile {
    /// Target path as declared in the manifest.
    pub target: String,
    /// Path of the file on disk.
    pub path: PathBuf,
    /// Whether the on-disk name carries the `.deploy` suffix.
    pub deploy_suffixed: bool,
}

impl PayloadFile {
    /// Path of the file under its manifest-declared name.
    pub fn unsuffixed_path(&self) -> PathBuf {
        let stripped = self
            .path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_suffix(DEPLOY_SUFFIX));

        match stripped {
            Some(name) if self.deploy_suffixed => self.path.with_file_name(name),
            _ => self.path.clone(),
        }
    }
}

/// Size and digest of a file.
fn file_size_and_digest(
    path: &Path,
    algorithm: HashAlgorithm,
) -> Result<(u64, Vec<u8>), ClickOnceCodesignError> {
    let data = std::fs::read(path)?;

    Ok((data.len() as u64, algorithm.digest(&data)))
}

/// Record a size and digest on a `file` or `dependentAssembly` element.
fn set_size_and_hash(element: &mut Element, size: u64, digest: &[u8], algorithm: HashAlgorithm) {
    element.set_attribute("size", size);

    if element.child(ASSEMBLY_NAMESPACES, "hash").is_none() {
        let prefix = if element.namespace.as_deref() == Some(ASM_V2_NAMESPACE) {
            element.prefix.clone()
        } else {
            Some("asmv2".to_string())
        };
        element.push(Element::new_ns(prefix.as_deref(), "hash", ASM_V2_NAMESPACE));
    }

    let hash = match element.child_mut(ASSEMBLY_NAMESPACES, "hash") {
        Some(hash) => hash,
        None => return,
    };

    let dsig_prefix = hash
        .child_elements()
        .find(|e| e.namespace.as_deref() == Some(DSIG_NAMESPACE))
        .map(|e| e.prefix.clone())
        .unwrap_or_else(|| Some("dsig".to_string()));
    let dsig = |name: &str| Element::new_ns(dsig_prefix.as_deref(), name, DSIG_NAMESPACE);

    hash.children.clear();
    hash.push(
        dsig("Transforms")
            .with_child(dsig("Transform").with_attribute("Algorithm", IDENTITY_HASH_TRANSFORM)),
    );
    hash.push(dsig("DigestMethod").with_attribute("Algorithm", algorithm.digest_method_uri()));
    hash.push(dsig("DigestValue").with_text(&base64::encode(digest)));
}

/// Recorded digest of a `file` or `dependentAssembly` element.
pub fn recorded_hash(element: &Element) -> Option<(HashAlgorithm, Vec<u8>)> {
    let hash = element.child(ASSEMBLY_NAMESPACES, "hash")?;
    let algorithm = hash
        .child(&[DSIG_NAMESPACE], "DigestMethod")
        .and_then(|e| e.attribute("Algorithm"))
        .and_then(HashAlgorithm::from_digest_method_uri)?;
    let value = hash.child(&[DSIG_NAMESPACE], "DigestValue")?;

    crate::signature::decode_base64_text(&value.text())
        .ok()
        .map(|digest| (algorithm, digest))
}

fn is_install_dependency(element: &Element) -> bool {
    element.is(ASSEMBLY_NAMESPACES, "dependentAssembly")
        && element.attribute("dependencyType") == Some("install")
        && element.attribute("codebase").is_some()
}

/// Iterate `dependency/dependentAssembly` elements installed with a manifest.
fn install_dependencies(root: &Element) -> impl Iterator<Item = &Element> {
    root.children_named(ASSEMBLY_NAMESPACES, "dependency")
        .flat_map(|d| d.child_elements())
        .filter(|e| is_install_dependency(e))
}

fn install_dependencies_mut(root: &mut Element) -> Vec<&mut Element> {
    root.child_elements_mut()
        .filter(|e| e.is(ASSEMBLY_NAMESPACES, "dependency"))
        .flat_map(|d| d.child_elements_mut())
        .filter(|e| is_install_dependency(e))
        .collect()
}

/// A deployment manifest.
#[derive(Clone, Debug)]
pub struct DeploymentManifest {
    path: PathBuf,
    document: Document,
}

impl DeploymentManifest {
    pub fn new(path: impl AsRef<Path>, document: Document) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            document,
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ClickOnceCodesignError> {
        Ok(Self::new(path.as_ref(), Document::from_path(path.as_ref())?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    /// Whether payload files are stored with the `.deploy` suffix.
    pub fn maps_file_extensions(&self) -> bool {
        self.document
            .root
            .child(ASSEMBLY_NAMESPACES, "deployment")
            .and_then(|d| d.attribute("mapFileExtensions"))
            .map(|v| v == "true")
            .unwrap_or(false)
    }

    /// The reference to the application manifest.
    pub fn application_reference(&self) -> Result<FileReference, ClickOnceCodesignError> {
        let dependency = install_dependencies(&self.document.root)
            .next()
            .ok_or_else(|| {
                malformed(format!(
                    "{} does not reference an application manifest",
                    self.path.display()
                ))
            })?;

        Ok(FileReference {
            kind: FileReferenceKind::DependentAssembly,
            target: dependency.attribute("codebase").unwrap_or_default().to_string(),
            size: dependency.attribute("size").and_then(|s| s.parse().ok()),
        })
    }

    /// Expected path of the application manifest.
    pub fn application_manifest_path(&self) -> Result<PathBuf, ClickOnceCodesignError> {
        let base = self.path.parent().unwrap_or_else(|| Path::new(""));

        Ok(base.join(self.application_reference()?.relative_path()?))
    }

    /// Record the application manifest's identity, size and digest.
    pub fn update_application_reference(
        &mut self,
        application: &ApplicationManifest,
        algorithm: HashAlgorithm,
    ) -> Result<(), ClickOnceCodesignError> {
        let (size, digest) = file_size_and_digest(application.path(), algorithm)?;
        let identity = assembly_identity(&application.document().root)?.clone();

        let path = self.path.clone();
        let dependency = install_dependencies_mut(&mut self.document.root)
            .into_iter()
            .next()
            .ok_or_else(|| {
                malformed(format!(
                    "{} does not reference an application manifest",
                    path.display()
                ))
            })?;

        if let Some(reference_identity) = dependency.child_mut(ASSEMBLY_NAMESPACES, "assemblyIdentity")
        {
            for attr in identity.attributes.iter().filter(|a| a.namespace.is_none()) {
                reference_identity.set_attribute(&attr.local_name, &attr.value);
            }
        }

        set_size_and_hash(dependency, size, &digest, algorithm);
        debug!(
            "recorded application manifest {} ({} bytes)",
            application.path().display(),
            size
        );

        Ok(())
    }

    pub fn save(&self) -> Result<(), ClickOnceCodesignError> {
        self.document.write_to_path(&self.path)
    }
}

/// An application manifest.
#[derive(Clone, Debug)]
pub struct ApplicationManifest {
    path: PathBuf,
    document: Document,
}

impl ApplicationManifest {
    pub fn new(path: impl AsRef<Path>, document: Document) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            document,
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ClickOnceCodesignError> {
        Ok(Self::new(path.as_ref(), Document::from_path(path.as_ref())?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    /// Name of the manifest as given to the update tool.
    pub fn name(&self) -> Result<String, ClickOnceCodesignError> {
        assembly_identity(&self.document.root)?
            .attribute("name")
            .map(|x| x.to_string())
            .ok_or_else(|| malformed("assemblyIdentity has no name"))
    }

    /// Payload files referenced by this manifest.
    pub fn file_references(&self) -> Vec<FileReference> {
        let root = &self.document.root;

        let dependencies = install_dependencies(root).map(|e| FileReference {
            kind: FileReferenceKind::DependentAssembly,
            target: e.attribute("codebase").unwrap_or_default().to_string(),
            size: e.attribute("size").and_then(|s| s.parse().ok()),
        });

        let files = root
            .children_named(ASSEMBLY_NAMESPACES, "file")
            .filter_map(|e| {
                e.attribute("name").map(|name| FileReference {
                    kind: FileReferenceKind::File,
                    target: name.to_string(),
                    size: e.attribute("size").and_then(|s| s.parse().ok()),
                })
            });

        dependencies.chain(files).collect()
    }

    /// Record sizes and digests of resolved payload files.
    ///
    /// Files are read under their manifest-declared names. Returns the number
    /// of references updated.
    pub fn update_file_hashes(
        &mut self,
        payload: &[PayloadFile],
        algorithm: HashAlgorithm,
    ) -> Result<usize, ClickOnceCodesignError> {
        let mut updated = 0;

        for element in self.document.root.child_elements_mut() {
            let targets = if element.is(ASSEMBLY_NAMESPACES, "file") {
                vec![element]
            } else if element.is(ASSEMBLY_NAMESPACES, "dependency") {
                element
                    .child_elements_mut()
                    .filter(|e| is_install_dependency(e))
                    .collect()
            } else {
                continue;
            };

            for target in targets {
                let declared = if target.is(ASSEMBLY_NAMESPACES, "file") {
                    target.attribute("name")
                } else {
                    target.attribute("codebase")
                }
                .map(codebase_to_path)
                .transpose()?;

                let file = match declared.and_then(|declared| {
                    payload
                        .iter()
                        .find(|p| codebase_to_path(&p.target).ok().as_ref() == Some(&declared))
                }) {
                    Some(file) => file,
                    None => {
                        warn!("no payload file resolved for manifest entry; leaving it unchanged");
                        continue;
                    }
                };

                let (size, digest) = file_size_and_digest(&file.path, algorithm)?;
                set_size_and_hash(target, size, &digest, algorithm);
                updated += 1;
            }
        }

        Ok(updated)
    }

    pub fn save(&self) -> Result<(), ClickOnceCodesignError> {
        self.document.write_to_path(&self.path)
    }
}
