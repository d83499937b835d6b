// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    clap::{Arg, ArgMatches, Command},
    clickonce_codesign::{
        certificate_rsa_public_key, public_key_token, ClickOnceCodesignError,
        DeploymentOrchestrator, HashAlgorithm, ManifestVerifier, OrchestratorSettings,
        RsaSigningKey, SigningIdentity, SigningSettings, VerificationSettings, VerifyFlags,
    },
    log::{info, warn, LevelFilter},
    std::path::PathBuf,
    x509_certificate::CapturedX509Certificate,
};

const SIGN_ABOUT: &str = "\
Sign ClickOnce manifests.

Each path is a deployment manifest (.application) or an application
manifest (.manifest). For a deployment manifest, the referenced
application manifest and its payload files are located, payload files
are signed, sizes and hashes recorded in both manifests are refreshed,
then the application manifest and the deployment manifest are signed.

Files are only modified after every step succeeded.

The signing key is loaded from a PFX file (--pfx) or from PEM files
(--pem-source). A PEM source without a certificate produces strong name
signatures only.
";

const VERIFY_ABOUT: &str = "\
Verify the signatures of a ClickOnce manifest.

The strong name signature is always verified. Unless --strong-name-only
is given, the publisher signature must be present and its certificate
must be trusted: either it is one of the --trusted-publisher certificates
or it chains to a --trust-anchor.
";

fn read_certificates(
    args: &ArgMatches,
    name: &str,
) -> Result<Vec<CapturedX509Certificate>, ClickOnceCodesignError> {
    let mut certs = vec![];

    if let Some(values) = args.values_of(name) {
        for path in values {
            let data = std::fs::read(path)?;

            for pem in pem::parse_many(&data).map_err(ClickOnceCodesignError::CertificatePem)? {
                match pem.tag.as_str() {
                    "CERTIFICATE" => certs.push(CapturedX509Certificate::from_der(pem.contents)?),
                    tag => warn!("(unhandled PEM tag {} in {}; ignoring)", tag, path),
                }
            }
        }
    }

    Ok(certs)
}

fn read_pem_sources(args: &ArgMatches) -> Result<Vec<u8>, ClickOnceCodesignError> {
    let mut data = vec![];

    if let Some(values) = args.values_of("pem_source") {
        for path in values {
            warn!("reading PEM data from {}", path);
            data.extend(std::fs::read(path)?);
            data.push(b'\n');
        }
    }

    Ok(data)
}

fn load_signing_identity(args: &ArgMatches) -> Result<SigningIdentity, ClickOnceCodesignError> {
    if let Some(path) = args.value_of("pfx_path") {
        let password = args.value_of("pfx_password").unwrap_or_default();
        warn!("reading PFX data from {}", path);
        let data = std::fs::read(path)?;

        return SigningIdentity::from_pfx_data(&data, password);
    }

    let data = read_pem_sources(args)?;
    if data.is_empty() {
        return Err(ClickOnceCodesignError::CliGeneralError(
            "no signing key specified; use --pfx or --pem-source".into(),
        ));
    }

    let entries = pem::parse_many(&data).map_err(ClickOnceCodesignError::CertificatePem)?;

    if entries.iter().any(|pem| pem.tag == "CERTIFICATE") {
        SigningIdentity::from_pem_data(&data)
    } else {
        let key = entries
            .into_iter()
            .find(|pem| pem.tag == "PRIVATE KEY")
            .ok_or_else(|| {
                ClickOnceCodesignError::CliGeneralError("no PRIVATE KEY found in PEM sources".into())
            })?;

        warn!("no certificate given; only strong name signatures will be produced");
        Ok(SigningIdentity::from_key(RsaSigningKey::from_pkcs8_der(
            &key.contents,
        )?))
    }
}

fn command_public_key_token(args: &ArgMatches) -> Result<(), ClickOnceCodesignError> {
    let data = read_pem_sources(args)?;

    for pem in pem::parse_many(&data).map_err(ClickOnceCodesignError::CertificatePem)? {
        let key = match pem.tag.as_str() {
            "CERTIFICATE" => {
                certificate_rsa_public_key(&CapturedX509Certificate::from_der(pem.contents)?)?
            }
            "PRIVATE KEY" => RsaSigningKey::from_pkcs8_der(&pem.contents)?
                .private_key()
                .to_public_key(),
            tag => {
                warn!("(unhandled PEM tag {}; ignoring)", tag);
                continue;
            }
        };

        println!("{}", public_key_token(&key)?);
        return Ok(());
    }

    Err(ClickOnceCodesignError::CliGeneralError(
        "no certificate or private key found in PEM sources".into(),
    ))
}

fn command_sign(args: &ArgMatches) -> Result<(), ClickOnceCodesignError> {
    let inputs = args
        .values_of("path")
        .ok_or(ClickOnceCodesignError::CliBadArgument)?
        .map(PathBuf::from)
        .collect::<Vec<_>>();

    let identity = load_signing_identity(args)?;

    let mut signing = SigningSettings::default();
    if let Some(digest) = args.value_of("digest") {
        signing.set_hash_algorithm(digest.parse::<HashAlgorithm>()?);
    }
    if let Some(url) = args.value_of("timestamp_url") {
        signing.set_time_stamp_url(url)?;
    }
    if let Some(description) = args.value_of("description") {
        signing.set_description(description);
    }
    if let Some(url) = args.value_of("description_url") {
        signing.set_description_url(url);
    }

    let mut settings = OrchestratorSettings::default();
    if let Some(publisher) = args.value_of("publisher") {
        settings.set_publisher(publisher);
    }
    if let Some(url) = args.value_of("support_url") {
        settings.set_support_url(url);
    }
    if let Some(path) = args.value_of("mage") {
        settings.set_update_tool_path(path);
    }
    settings.set_no_sign_dependencies(args.is_present("no_sign_dependencies"));
    settings.set_no_update_manifest(args.is_present("no_update_manifest"));
    if let Some(retries) = args.value_of("timestamp_retries") {
        settings.set_time_stamp_retries(retries.parse::<u32>().map_err(|_| {
            ClickOnceCodesignError::CliGeneralError(format!(
                "invalid --timestamp-retries value: {}",
                retries
            ))
        })?);
    }

    DeploymentOrchestrator::new(&settings, signing, &identity, &identity).sign(&inputs)
}

fn command_verify(args: &ArgMatches) -> Result<(), ClickOnceCodesignError> {
    let path = args
        .value_of("path")
        .ok_or(ClickOnceCodesignError::CliBadArgument)?;

    let mut flags = VerifyFlags::default();
    match args.value_of("revocation") {
        Some("no-check") => flags |= VerifyFlags::REVOCATION_NO_CHECK,
        Some("end-cert") => flags |= VerifyFlags::REVOCATION_END_CERT_ONLY,
        _ => flags |= VerifyFlags::REVOCATION_ENTIRE_CHAIN,
    }
    if args.is_present("strong_name_only") {
        flags |= VerifyFlags::STRONG_NAME_ONLY;
    }
    if args.is_present("lifetime_signing") {
        flags |= VerifyFlags::LIFETIME_SIGNING;
    }

    let mut settings = VerificationSettings::default();
    settings.set_flags(flags);
    for cert in read_certificates(args, "trust_anchor")? {
        settings.add_trust_anchor(cert);
    }
    for cert in read_certificates(args, "trusted_publisher")? {
        settings.add_trusted_publisher(cert);
    }
    for cert in read_certificates(args, "disallowed")? {
        settings.add_disallowed(cert);
    }

    let outcome = ManifestVerifier::new(&settings).verify_path(path)?;

    println!("strong name: valid ({})", outcome.algorithm);
    println!("public key token: {}", outcome.public_key_token);
    if outcome.legacy_signature_form {
        println!("signature form: legacy");
    }

    match &outcome.publisher {
        Some(publisher) => {
            println!("publisher: {}", publisher.subject);
            println!("chain length: {}", publisher.chain.len());
            match &publisher.time_stamp {
                Some(time_stamp) => println!("time-stamp: {}", time_stamp.time.to_rfc3339()),
                None => println!("time-stamp: none"),
            }
        }
        None => info!("publisher signature not verified"),
    }

    Ok(())
}

fn main_impl() -> Result<(), ClickOnceCodesignError> {
    let app = Command::new("ClickOnce manifest signing in pure Rust")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Gregory Szorc <gregory.szorc@gmail.com>")
        .about("Sign and verify ClickOnce deployments")
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .multiple_occurrences(true)
                .help("Increase logging verbosity. Can be specified multiple times."),
        );

    let pem_source = Arg::new("pem_source")
        .long("pem-source")
        .takes_value(true)
        .multiple_occurrences(true)
        .multiple_values(true)
        .help("Path to file containing PEM encoded certificate/key data");

    let app = app.subcommand(
        Command::new("public-key-token")
            .about("Print the public key token of a key or certificate")
            .arg(pem_source.clone().required(true)),
    );

    let app = app.subcommand(
        Command::new("sign")
            .about("Sign ClickOnce deployment and application manifests")
            .long_about(SIGN_ABOUT)
            .arg(
                Arg::new("path")
                    .required(true)
                    .multiple_values(true)
                    .help("Manifests to sign"),
            )
            .arg(
                Arg::new("pfx_path")
                    .long("pfx")
                    .alias("p12-file")
                    .takes_value(true)
                    .conflicts_with("pem_source")
                    .help("Path to a .pfx/.p12 file containing a certificate key pair"),
            )
            .arg(
                Arg::new("pfx_password")
                    .long("pfx-password")
                    .takes_value(true)
                    .requires("pfx_path")
                    .help("The password to use to open the --pfx file"),
            )
            .arg(pem_source)
            .arg(
                Arg::new("digest")
                    .long("digest")
                    .takes_value(true)
                    .possible_values(&["sha1", "sha256"])
                    .default_value("sha256")
                    .help("Digest algorithm of signatures and recorded hashes"),
            )
            .arg(
                Arg::new("timestamp_url")
                    .long("timestamp-url")
                    .takes_value(true)
                    .help("URL of an RFC 3161 time-stamp server"),
            )
            .arg(
                Arg::new("timestamp_retries")
                    .long("timestamp-retries")
                    .takes_value(true)
                    .help("Number of times a failed time-stamp request is retried"),
            )
            .arg(
                Arg::new("description")
                    .long("description")
                    .takes_value(true)
                    .help("Description recorded in the publisher license"),
            )
            .arg(
                Arg::new("description_url")
                    .long("description-url")
                    .takes_value(true)
                    .help("URL recorded in the publisher license"),
            )
            .arg(
                Arg::new("publisher")
                    .long("publisher")
                    .takes_value(true)
                    .help("Publisher name recorded in the deployment manifest"),
            )
            .arg(
                Arg::new("support_url")
                    .long("support-url")
                    .takes_value(true)
                    .help("Support URL recorded in the deployment manifest"),
            )
            .arg(
                Arg::new("no_sign_dependencies")
                    .long("no-sign-dependencies")
                    .help("Do not sign payload files or the application manifest of a deployment"),
            )
            .arg(
                Arg::new("no_update_manifest")
                    .long("no-update-manifest")
                    .help("Sign manifests as they are without refreshing recorded hashes"),
            )
            .arg(
                Arg::new("mage")
                    .long("mage")
                    .takes_value(true)
                    .help("Path to the mage executable used to update manifests"),
            ),
    );

    let certificate_list = |name: &'static str, long: &'static str, help: &'static str| {
        Arg::new(name)
            .long(long)
            .takes_value(true)
            .multiple_occurrences(true)
            .help(help)
    };

    let app = app.subcommand(
        Command::new("verify")
            .about("Verify the signatures of a ClickOnce manifest")
            .long_about(VERIFY_ABOUT)
            .arg(
                Arg::new("path")
                    .required(true)
                    .help("Manifest to verify"),
            )
            .arg(certificate_list(
                "trust_anchor",
                "trust-anchor",
                "PEM file of a trusted root certificate",
            ))
            .arg(certificate_list(
                "trusted_publisher",
                "trusted-publisher",
                "PEM file of a trusted publisher certificate",
            ))
            .arg(certificate_list(
                "disallowed",
                "disallowed",
                "PEM file of an explicitly distrusted certificate",
            ))
            .arg(
                Arg::new("revocation")
                    .long("revocation")
                    .takes_value(true)
                    .possible_values(&["no-check", "end-cert", "chain"])
                    .default_value("chain")
                    .help("Which certificates to check for revocation"),
            )
            .arg(
                Arg::new("strong_name_only")
                    .long("strong-name-only")
                    .help("Only verify the strong name signature"),
            )
            .arg(
                Arg::new("lifetime_signing")
                    .long("lifetime-signing")
                    .help("Ignore time-stamps and validate certificates at the current time"),
            ),
    );

    let matches = app.get_matches();

    let log_level = match matches.occurrences_of("verbose") {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_level.as_str()),
    );

    // Disable log context except at higher log levels.
    if log_level <= LevelFilter::Info {
        builder
            .format_timestamp(None)
            .format_level(false)
            .format_target(false);
    }

    if log_level == LevelFilter::Info {
        builder.filter_module("rustls", LevelFilter::Error);
        builder.filter_module("reqwest", LevelFilter::Warn);
    }

    builder.init();

    match matches.subcommand() {
        Some(("public-key-token", args)) => command_public_key_token(args),
        Some(("sign", args)) => command_sign(args),
        Some(("verify", args)) => command_verify(args),
        _ => Err(ClickOnceCodesignError::CliUnknownCommand),
    }
}

fn main() {
    let exit_code = match main_impl() {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("Error: {}", err);
            1
        }
    };

    std::process::exit(exit_code)
}
