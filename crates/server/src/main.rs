//! SSL Cert Server - command line entry point
//!
//! Loads the configuration and exercises the certificate core: `test`
//! validates a configuration file, `inspect` resolves a host to its managed
//! certificate through the same cache the handshake path uses.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use ssl_cert_config::{Config, HostPolicy, CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH};
use ssl_cert_server::{
    ocsp_key_name, open_blob_store, DisabledFetcher, ManagedCertManager, OcspManager,
    StorageManager,
};

/// SSL Cert Server - on-demand TLS certificates
#[derive(Parser, Debug)]
#[command(name = "ssl-cert-server")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = CONFIG_PATH_ENV, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long = "json-logs", global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate configuration file and exit
    Test,
    /// Resolve a host to its managed certificate and print a summary
    Inspect {
        /// Hostname as it would appear in SNI
        host: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);

    match cli.command {
        Commands::Test => test_config(&cli.config),
        Commands::Inspect { host } => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(inspect_host(&cli.config, &host))
        }
    }
}

fn init_logging(verbose: bool, json: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_target(false)
            .with_env_filter(filter)
            .init();
    }
}

/// Load, validate and compile everything the configuration describes
fn load_config(path: &str) -> Result<Config> {
    info!("Loading configuration from: {}", path);
    let config = Config::from_file(path).context("Failed to load configuration file")?;
    config
        .validate()
        .context("Configuration validation failed")?;
    Ok(config)
}

/// Test configuration file and exit
fn test_config(path: &str) -> Result<()> {
    let config = load_config(path)?;

    let policy = config
        .host_policy()
        .context("Failed to build host policy")?;
    let managed = config
        .managed_domains()
        .context("Failed to compile managed domains")?;

    info!("Configuration test successful:");
    info!("  - storage: {:?}", config.storage.kind);
    info!("  - {} managed certificate(s)", managed.len());
    info!(
        "  - {} issuance domain(s), {} pattern(s)",
        config.lets_encrypt.domains.len(),
        config.lets_encrypt.re_patterns.len()
    );
    info!("  - ACME directory: {}", config.lets_encrypt.directory_url());

    if policy.allows_all() {
        warn!("No lets_encrypt domains or patterns configured, issuance is allowed for any host");
    }

    println!("ssl-cert-server: configuration file {} test is successful", path);
    Ok(())
}

/// Resolve `host` through the managed certificate cache
async fn inspect_host(path: &str, host: &str) -> Result<()> {
    let config = load_config(path)?;
    let policy = config
        .host_policy()
        .context("Failed to build host policy")?;
    let managed = config
        .managed_domains()
        .context("Failed to compile managed domains")?;

    let store = open_blob_store(&config.storage)
        .await
        .context("Failed to open blob store")?;
    let storage = Arc::new(StorageManager::new(store, &managed));
    let ocsp = OcspManager::with_interval(
        Arc::new(DisabledFetcher),
        config.ocsp.refresh_interval(),
    );
    let cache = ManagedCertManager::new(storage, Arc::new(ocsp.clone()))
        .with_reload_interval(config.cache.reload_interval())
        .with_reload_timeout(config.cache.reload_timeout());

    println!("host: {}", host);

    match managed.cert_key_for(host) {
        Some(cert_key) => {
            let cert = cache
                .get(cert_key)
                .await
                .with_context(|| format!("Failed to load managed certificate {}", cert_key))?;

            let cert = ocsp.stapled(&ocsp_key_name(cert_key), &cert);

            println!("managed certificate: {}", cert_key);
            println!("  chain length: {}", cert.cert.len());
            match &cert.ocsp {
                Some(staple) => println!("  ocsp staple: {} bytes", staple.len()),
                None => println!("  ocsp staple: none"),
            }
            if let Some(not_after) = cache.not_after(cert_key) {
                println!("  expires: {}", not_after.to_rfc3339());
            }
        }
        None => println!("managed certificate: none"),
    }

    match policy.check(host) {
        Ok(()) => println!("acme issuance: allowed"),
        Err(e) => println!("acme issuance: denied ({})", e),
    }

    Ok(())
}
