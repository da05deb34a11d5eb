mod cli;
mod config;
mod rpc;

use std::{path::Path, sync::Arc};

use clap::Parser;
use color_eyre::Result;
use kms_plugin::{DriverRegistry, KmsService};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::{Command, ConfigCommand, DecryptArgs, EncryptArgs, ServeArgs};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = cli::Cli::parse();
    let config_path = match cli.config {
        Some(path) => path,
        None => config::default_path()?,
    };
    let config = config::load_from_path(&config_path)?;

    match cli.command.unwrap_or_else(|| Command::Serve(ServeArgs::from_env())) {
        Command::Encrypt(args) => run_encrypt(&build_service(&config), args).await?,
        Command::Decrypt(args) => run_decrypt(&build_service(&config), args).await?,
        Command::Serve(args) => run_serve(Arc::new(build_service(&config)), args).await?,
        Command::Version => println!("sftpgo-plugin-kms {}", version_string()),
        Command::Config(ConfigCommand::Init) => init_config(&config, &config_path)?,
    }

    Ok(())
}

fn init_tracing() {
    // stdout carries responses; logs go to stderr.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

/// `<version>[-<commit>][-<date>]`, with commit and date injected at build time.
fn version_string() -> String {
    format_version(
        env!("CARGO_PKG_VERSION"),
        option_env!("SFTPGO_PLUGIN_KMS_COMMIT"),
        option_env!("SFTPGO_PLUGIN_KMS_BUILD_DATE"),
    )
}

fn format_version(version: &str, commit: Option<&str>, date: Option<&str>) -> String {
    [Some(version), commit, date]
        .into_iter()
        .flatten()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

fn build_service(config: &config::Config) -> KmsService {
    let registry = DriverRegistry::with_defaults(config.oci_endpoint.clone());
    let span = tracing::info_span!("kms", version = %version_string());
    KmsService::new(Arc::new(registry), span).with_timeout(config.timeout())
}

async fn run_encrypt(service: &KmsService, args: EncryptArgs) -> Result<()> {
    let sealed = service
        .encrypt(&args.payload, &args.additional_data, &args.url, &args.master_key)
        .await?;
    println!("{}", serde_json::to_string(&sealed)?);
    Ok(())
}

async fn run_decrypt(service: &KmsService, args: DecryptArgs) -> Result<()> {
    let plaintext = service
        .decrypt(
            &args.ciphertext,
            &args.key,
            &args.additional_data,
            args.mode,
            &args.url,
            &args.master_key,
        )
        .await?;
    println!("{plaintext}");
    Ok(())
}

async fn run_serve(service: Arc<KmsService>, args: ServeArgs) -> Result<()> {
    info!(version = %version_string(), "starting sftpgo-plugin-kms");
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    rpc::serve(service, &args.master_key, stdin, tokio::io::stdout())
        .await
        .map_err(|e| color_eyre::eyre::eyre!(e))
}

fn init_config(config: &config::Config, path: &Path) -> Result<()> {
    let path = config::write_default_if_missing(config, path)?;
    println!("Config initialized at {}", path.display());
    Ok(())
}
