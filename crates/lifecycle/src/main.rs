//! Certwarden - main entry point
//!
//! Command-line front end over [`CertificateService`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use certwarden::{CertificateService, Domain, FileRecordStore, Material};
use certwarden_common::{CertificateId, DomainName, ProviderKind};
use certwarden_config::{validate, Config, LogFormat};

/// Certwarden - TLS certificate lifecycle manager
#[derive(Parser, Debug)]
#[command(name = "certwarden")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "CERTWARDEN_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Issue a certificate for a domain
    Issue {
        #[arg(long)]
        domain: String,

        /// Owner recorded with the certificate
        #[arg(long)]
        owner: String,

        /// ca, ca-staging, self-signed or custom
        #[arg(long, default_value = "self-signed")]
        provider: ProviderKind,

        /// Certificate PEM for custom uploads
        #[arg(long, requires = "key")]
        cert: Option<PathBuf>,

        /// Private key PEM for custom uploads
        #[arg(long, requires = "cert")]
        key: Option<PathBuf>,

        /// Intermediate chain PEM for custom uploads
        #[arg(long, requires = "cert")]
        chain: Option<PathBuf>,
    },
    /// Renew a certificate now
    Renew {
        #[arg(long)]
        id: CertificateId,
    },
    /// Revoke a certificate and remove its material
    Revoke {
        #[arg(long)]
        id: CertificateId,
    },
    /// Delete a certificate record and its installed files
    Delete {
        #[arg(long)]
        id: CertificateId,
    },
    /// Print certificate details as JSON
    Show {
        #[arg(long)]
        id: CertificateId,
    },
    /// List certificates
    List {
        #[arg(long)]
        domain: Option<DomainName>,
    },
    /// Run one renewal sweep and print the report as JSON
    Sweep {
        /// Renewal window, defaults to the configured one
        #[arg(long = "window-days")]
        window_days: Option<u32>,
    },
    /// Run the renewal scheduler until interrupted
    Run,
    /// Validate configuration file and exit
    Test,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    if let Commands::Test = cli.command {
        init_logging(&config, cli.verbose);
        return test_config(&config, cli.config.as_deref()).await;
    }

    config.validate().context("Configuration validation failed")?;
    init_logging(&config, cli.verbose);

    let store = FileRecordStore::open(&config.storage)
        .await
        .with_context(|| format!("Failed to open record store in {}", config.storage.display()))?;
    let service = CertificateService::from_config(&config, Arc::new(store))?;

    match cli.command {
        Commands::Issue {
            domain,
            owner,
            provider,
            cert,
            key,
            chain,
        } => {
            let domain = Domain::parse(&domain, owner)?;
            let upload = match (cert, key) {
                (Some(cert), Some(key)) => Some(read_upload(&cert, &key, chain.as_deref()).await?),
                _ => None,
            };
            let summary = service.issue_certificate(domain, provider, upload).await?;
            print_json(&summary)?;
        }
        Commands::Renew { id } => {
            let summary = service.renew_certificate(id).await?;
            print_json(&summary)?;
        }
        Commands::Revoke { id } => {
            service.revoke_certificate(id).await?;
            println!("certwarden: certificate {} revoked", id);
        }
        Commands::Delete { id } => {
            service.delete_certificate(id).await?;
            println!("certwarden: certificate {} deleted", id);
        }
        Commands::Show { id } => {
            print_json(&service.get_certificate_details(id).await?)?;
        }
        Commands::List { domain } => {
            print_json(&service.list_certificates(domain).await?)?;
        }
        Commands::Sweep { window_days } => {
            let window = match window_days {
                Some(days) => Duration::from_secs(u64::from(days) * 86_400),
                None => service.renewal_window(),
            };
            let report = service.run_renewal_sweep(window).await?;
            print_json(&report)?;
            if !report.is_clean() {
                finish(&service).await;
                anyhow::bail!("{} renewal(s) failed", report.failed.len());
            }
        }
        Commands::Run => {
            info!("Starting certwarden renewal daemon");
            service
                .scheduler()
                .run_until(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        warn!(error = %e, "Failed to listen for shutdown signal");
                    }
                })
                .await;
            info!("Certwarden stopped");
        }
        Commands::Test => unreachable!("handled above"),
    }

    finish(&service).await;
    Ok(())
}

/// Let reload notifications started by this command run to completion
async fn finish(service: &CertificateService) {
    let failed = service.drain_hooks().await;
    if failed > 0 {
        warn!(failed, "Reload hook failed; installed material may not be served yet");
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path),
        None => Ok(Config::default()),
    }
}

fn init_logging(config: &Config, verbose: bool) {
    let level = if verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match config.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.with_target(false).init(),
    }
}

/// Validate configuration and environment, then exit
async fn test_config(config: &Config, path: Option<&Path>) -> Result<()> {
    let source = path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults)".to_string());
    info!("Testing configuration: {}", source);

    config.validate().context("Configuration validation failed")?;

    let result = validate::validate_environment(config).await;
    for warning in &result.warnings {
        warn!("{}", warning.message);
    }
    if !result.is_ok() {
        for error in &result.errors {
            eprintln!("certwarden: {}", error);
        }
        anyhow::bail!("{} environment check(s) failed", result.errors.len());
    }

    info!("Configuration test successful:");
    info!("  - storage: {}", config.storage.display());
    info!("  - webroot: {}", config.webroot);
    info!("  - acme: {}", if config.acme.is_some() { "configured" } else { "disabled" });

    println!("certwarden: configuration {} test is successful", source);
    Ok(())
}

async fn read_upload(cert: &Path, key: &Path, chain: Option<&Path>) -> Result<Material> {
    let certificate = read_pem(cert).await?;
    let private_key = read_pem(key).await?;
    let chain = match chain {
        Some(path) => Some(read_pem(path).await?),
        None => None,
    };
    Ok(Material::new(certificate, private_key, chain)?)
}

async fn read_pem(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
