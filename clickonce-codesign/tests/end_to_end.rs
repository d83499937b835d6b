// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    chrono::{TimeZone, Utc},
    clickonce_codesign::{
        AggregatingSigner, ApplicationManifest, ClickOnceCodesignError, DeploymentManifest,
        DeploymentOrchestrator, HashAlgorithm, ManifestUpdate, ManifestUpdateTool,
        ManifestVerifier, OrchestratorSettings, SigningIdentity, SigningSettings,
        VerificationFailure, VerificationSettings, VerifyFlags,
    },
    indoc::indoc,
    std::{
        path::{Path, PathBuf},
        sync::Mutex,
    },
    x509_certificate::CapturedX509Certificate,
};

const SELF_SIGNED_PEM: &str = include_str!("../src/testdata/self-signed.pem");
const SIGNER_PKCS8_DER: &[u8] = include_bytes!("../src/testdata/signer.pk8");

const DEPLOYMENT: &str = indoc! {r#"
    <?xml version="1.0" encoding="utf-8"?>
    <asmv1:assembly xsi:schemaLocation="urn:schemas-microsoft-com:asm.v1 assembly.adaptive.xsd" manifestVersion="1.0" xmlns:asmv1="urn:schemas-microsoft-com:asm.v1" xmlns="urn:schemas-microsoft-com:asm.v2" xmlns:asmv2="urn:schemas-microsoft-com:asm.v2" xmlns:dsig="http://www.w3.org/2000/09/xmldsig#" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
      <assemblyIdentity name="Contoso.application" version="1.0.0.0" publicKeyToken="0000000000000000" language="neutral" processorArchitecture="msil" xmlns="urn:schemas-microsoft-com:asm.v1" />
      <description asmv2:publisher="Contoso" asmv2:product="Contoso" xmlns="urn:schemas-microsoft-com:asm.v1" />
      <deployment install="true" mapFileExtensions="true" />
      <dependency>
        <dependentAssembly dependencyType="install" codebase="Application Files\Contoso_1_0_0_0\Contoso.exe.manifest" size="1">
          <assemblyIdentity name="Contoso.exe" version="1.0.0.0" publicKeyToken="0000000000000000" language="neutral" processorArchitecture="msil" type="win32" />
        </dependentAssembly>
      </dependency>
    </asmv1:assembly>"#};

const APPLICATION: &str = indoc! {r#"
    <?xml version="1.0" encoding="utf-8"?>
    <asmv1:assembly manifestVersion="1.0" xmlns:asmv1="urn:schemas-microsoft-com:asm.v1" xmlns="urn:schemas-microsoft-com:asm.v2" xmlns:dsig="http://www.w3.org/2000/09/xmldsig#">
      <asmv1:assemblyIdentity name="Contoso.exe" version="1.0.0.0" publicKeyToken="0000000000000000" language="neutral" processorArchitecture="msil" type="win32" />
      <application />
      <entryPoint>
        <assemblyIdentity name="Contoso" version="1.0.0.0" language="neutral" processorArchitecture="msil" />
        <commandLine file="Contoso.exe" parameters="" />
      </entryPoint>
      <dependency>
        <dependentAssembly dependencyType="install" allowDelayedBinding="true" codebase="Contoso.exe" size="0">
          <assemblyIdentity name="Contoso" version="1.0.0.0" language="neutral" processorArchitecture="msil" />
        </dependentAssembly>
      </dependency>
    </asmv1:assembly>"#};

#[derive(Default)]
struct RecordingUpdateTool {
    updates: Mutex<Vec<ManifestUpdate>>,
}

impl ManifestUpdateTool for RecordingUpdateTool {
    fn update_manifest(&self, update: &ManifestUpdate) -> Result<(), ClickOnceCodesignError> {
        self.updates.lock().unwrap().push(update.clone());
        Ok(())
    }
}

#[derive(Default)]
struct RecordingSigner {
    calls: Mutex<Vec<Vec<PathBuf>>>,
}

impl AggregatingSigner for RecordingSigner {
    fn sign_files(
        &self,
        files: &[PathBuf],
        _settings: &SigningSettings,
    ) -> Result<(), ClickOnceCodesignError> {
        self.calls.lock().unwrap().push(files.to_vec());
        Ok(())
    }
}

struct Deployment {
    _temp: tempfile::TempDir,
    deployment_manifest: PathBuf,
    application_manifest: PathBuf,
    payload: PathBuf,
}

fn write_deployment() -> Result<Deployment, ClickOnceCodesignError> {
    let temp = tempfile::Builder::new()
        .prefix("clickonce-e2e-")
        .tempdir()?;

    let app_dir = temp
        .path()
        .join("Application Files")
        .join("Contoso_1_0_0_0");
    std::fs::create_dir_all(&app_dir)?;

    let application_manifest = app_dir.join("Contoso.exe.manifest");
    std::fs::write(&application_manifest, APPLICATION)?;
    let payload = app_dir.join("Contoso.exe.deploy");
    std::fs::write(&payload, b"MZ\x90\x00")?;

    let deployment_manifest = temp.path().join("Contoso.application");
    std::fs::write(&deployment_manifest, DEPLOYMENT)?;

    Ok(Deployment {
        _temp: temp,
        deployment_manifest,
        application_manifest,
        payload,
    })
}

fn identity() -> Result<SigningIdentity, ClickOnceCodesignError> {
    let pem_data = format!(
        "{}\n{}",
        SELF_SIGNED_PEM,
        pem::encode(&pem::Pem {
            tag: "PRIVATE KEY".into(),
            contents: SIGNER_PKCS8_DER.to_vec(),
        })
    );

    SigningIdentity::from_pem_data(pem_data.as_bytes())
}

fn trusting_self_signed() -> Result<VerificationSettings<'static>, ClickOnceCodesignError> {
    let mut settings = VerificationSettings::default();
    settings.set_flags(VerifyFlags::REVOCATION_NO_CHECK);
    settings.add_trusted_publisher(CapturedX509Certificate::from_pem(SELF_SIGNED_PEM)?);
    settings.set_verification_time(Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap());

    Ok(settings)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|x| x.to_string_lossy().to_string())
        .unwrap_or_default()
}

#[test]
fn sign_full_deployment() -> Result<(), ClickOnceCodesignError> {
    let deployment = write_deployment()?;
    let identity = identity()?;

    let update_tool = RecordingUpdateTool::default();
    let payload_signer = RecordingSigner::default();
    let settings = OrchestratorSettings::default();

    DeploymentOrchestrator::new(&settings, SigningSettings::default(), &identity, &identity)
        .with_update_tool(&update_tool)
        .with_aggregating_signer(&payload_signer)
        .sign(&[deployment.deployment_manifest.clone()])?;

    // Payload was signed once under its declared name, then renamed back.
    let calls = payload_signer.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(
        calls[0].iter().map(|p| file_name(p)).collect::<Vec<_>>(),
        vec!["Contoso.exe".to_string()]
    );
    assert!(deployment.payload.is_file());
    assert!(!deployment.payload.with_file_name("Contoso.exe").exists());

    // One update per manifest, application first.
    let updates = update_tool.updates.lock().unwrap();
    assert_eq!(
        updates
            .iter()
            .map(|u| file_name(&u.manifest))
            .collect::<Vec<_>>(),
        vec![
            "Contoso.exe.manifest".to_string(),
            "Contoso.application".to_string()
        ]
    );
    assert_eq!(
        updates[1].publisher.as_deref(),
        Some("CN=Contoso Self Signed")
    );

    // Recorded sizes and hashes describe the final files.
    let application = ApplicationManifest::from_path(&deployment.application_manifest)?;
    assert_eq!(application.file_references()[0].size, Some(4));

    let application_data = std::fs::read(&deployment.application_manifest)?;
    let deployment_text = std::fs::read_to_string(&deployment.deployment_manifest)?;
    let reference = DeploymentManifest::from_path(&deployment.deployment_manifest)?
        .application_reference()?;
    assert_eq!(reference.size, Some(application_data.len() as u64));
    assert!(deployment_text.contains(&base64::encode(
        HashAlgorithm::Sha256.digest(&application_data)
    )));

    // Both manifests carry valid, trusted signatures.
    let verification = trusting_self_signed()?;
    let verifier = ManifestVerifier::new(&verification);

    for path in [&deployment.application_manifest, &deployment.deployment_manifest] {
        let outcome = verifier.verify_path(path)?;
        assert_eq!(outcome.algorithm, HashAlgorithm::Sha256);

        let publisher = outcome
            .publisher
            .expect("publisher signature should be verified");
        assert_eq!(publisher.subject, "CN=Contoso Self Signed");
        assert!(publisher.time_stamp.is_none());
    }

    // Without trust in the publisher, verification fails.
    let mut untrusted = VerificationSettings::default();
    untrusted.set_flags(VerifyFlags::REVOCATION_NO_CHECK);
    untrusted.set_verification_time(Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap());
    let err = ManifestVerifier::new(&untrusted)
        .verify_path(&deployment.deployment_manifest)
        .unwrap_err();
    assert_eq!(
        err.verification_failure(),
        Some(VerificationFailure::SubjectNotTrusted)
    );

    Ok(())
}

#[test]
fn sign_deployment_without_update() -> Result<(), ClickOnceCodesignError> {
    let deployment = write_deployment()?;
    let identity = identity()?;

    let update_tool = RecordingUpdateTool::default();
    let payload_signer = RecordingSigner::default();
    let mut settings = OrchestratorSettings::default();
    settings.set_no_update_manifest(true);

    // Without updates the application manifest is only signed when listed.
    DeploymentOrchestrator::new(&settings, SigningSettings::default(), &identity, &identity)
        .with_update_tool(&update_tool)
        .with_aggregating_signer(&payload_signer)
        .sign(&[
            deployment.application_manifest.clone(),
            deployment.deployment_manifest.clone(),
        ])?;

    assert!(update_tool.updates.lock().unwrap().is_empty());
    assert!(payload_signer.calls.lock().unwrap().is_empty());

    let verification = trusting_self_signed()?;
    let verifier = ManifestVerifier::new(&verification);
    verifier.verify_path(&deployment.deployment_manifest)?;
    verifier.verify_path(&deployment.application_manifest)?;

    Ok(())
}

#[test]
fn strong_name_only_deployment() -> Result<(), ClickOnceCodesignError> {
    let deployment = write_deployment()?;
    let identity = SigningIdentity::from_key(clickonce_codesign::RsaSigningKey::from_pkcs8_der(
        SIGNER_PKCS8_DER,
    )?);

    let settings = OrchestratorSettings::default();
    let mut signing = SigningSettings::default();
    signing.set_hash_algorithm(HashAlgorithm::Sha1);

    DeploymentOrchestrator::new(&settings, signing, &identity, &identity)
        .with_update_tool(&RecordingUpdateTool::default())
        .with_aggregating_signer(&RecordingSigner::default())
        .sign(&[deployment.deployment_manifest.clone()])?;

    let mut verification = VerificationSettings::default();
    verification.set_flags(VerifyFlags::STRONG_NAME_ONLY | VerifyFlags::REVOCATION_NO_CHECK);
    let verifier = ManifestVerifier::new(&verification);

    for path in [&deployment.application_manifest, &deployment.deployment_manifest] {
        let outcome = verifier.verify_path(path)?;
        assert_eq!(outcome.algorithm, HashAlgorithm::Sha1);
        assert!(outcome.publisher.is_none());
    }

    let mut verification = VerificationSettings::default();
    verification.set_flags(VerifyFlags::REVOCATION_NO_CHECK);
    assert_eq!(
        ManifestVerifier::new(&verification)
            .verify_path(&deployment.deployment_manifest)
            .unwrap_err()
            .verification_failure(),
        Some(VerificationFailure::NoSignature)
    );

    Ok(())
}
