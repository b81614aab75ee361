//! SAML Bridge
//!
//! Service that fronts SAML2 IdP integrations for a host application:
//! per-tenant SP clients built from cached IdP metadata, login and ACS
//! endpoints, identity reconciliation with auto-provisioning, and bearer
//! token handoff via single-use auth codes.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use saml_bridge::authcode::{spawn_sweep_task, AuthCodeStore, DEFAULT_SWEEP_INTERVAL_SECS};
use saml_bridge::config::{ConfigStore, ServiceConfig};
use saml_bridge::directory::DirectoryStore;
use saml_bridge::http::{router, AppState};
use saml_bridge::sp::{SigningKeypair, SpClientFactory, SpSettings};
use saml_bridge::token::{JwtTokenService, TokenService};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "saml-bridge")]
#[command(about = "SAML2 federated-login bridge")]
struct Args {
    /// Listen address
    #[arg(long, default_value = "0.0.0.0:8080", env = "LISTEN_ADDR")]
    listen: String,

    /// Path to the JSON service configuration file
    #[arg(long, env = "CONFIG_FILE")]
    config: PathBuf,

    /// Directory for the embedded databases
    #[arg(long, default_value = "/var/lib/saml-bridge", env = "DATA_DIR")]
    data_dir: PathBuf,

    /// External base URL of this service; also the SP entity ID
    #[arg(long, env = "EXTERNAL_URL")]
    external_url: String,

    /// PEM private key for signing authentication requests
    #[arg(long, env = "SAML_KEY_FILE")]
    saml_key_file: Option<PathBuf>,

    /// PEM certificate matching the signing key
    #[arg(long, env = "SAML_CERT_FILE")]
    saml_cert_file: Option<PathBuf>,

    /// Secret for bearer token signing (HS256)
    #[arg(long, env = "TOKEN_SECRET")]
    token_secret: String,

    /// Bearer token lifetime in seconds
    #[arg(long, default_value_t = saml_bridge::token::DEFAULT_TOKEN_TTL_SECS, env = "TOKEN_TTL_SECS")]
    token_ttl_secs: u64,

    /// Auth code lifetime in seconds
    #[arg(long, default_value_t = saml_bridge::authcode::DEFAULT_CODE_TTL_SECS, env = "AUTH_CODE_TTL_SECS")]
    code_ttl_secs: u64,

    /// Enable verbose logging
    #[arg(short, long, env = "BRIDGE_VERBOSE")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("{}={}", env!("CARGO_CRATE_NAME"), log_level))
        .json()
        .init();

    info!("Starting SAML bridge");

    let raw = std::fs::read_to_string(&args.config)
        .with_context(|| format!("Failed to read config file: {:?}", args.config))?;
    let service_config: ServiceConfig =
        serde_json::from_str(&raw).context("Failed to parse service configuration")?;

    let configs = Arc::new(ConfigStore::open(args.data_dir.join("configs.redb"))?);
    for tenant in &service_config.tenants {
        configs.upsert(tenant.clone())?;
    }
    info!(tenants = configs.slugs()?.len(), "Tenant configs loaded");

    let signing = match (&args.saml_key_file, &args.saml_cert_file) {
        (Some(key), Some(cert)) => {
            let keypair = SigningKeypair::from_pem_files(key, cert)?;
            info!(key = ?key, cert = ?cert, "Request signing enabled");
            Some(Arc::new(keypair))
        }
        (None, None) => None,
        _ => bail!("SAML_KEY_FILE and SAML_CERT_FILE must be set together"),
    };

    let settings = SpSettings {
        sp_entity_id: args.external_url.clone(),
        acs_base_url: args.external_url.clone(),
        signing,
    };

    let directory = DirectoryStore::open(args.data_dir.join("directory.redb"))?;
    let codes = Arc::new(AuthCodeStore::open(
        args.data_dir.join("codes.redb"),
        args.code_ttl_secs,
    )?);
    let _sweep_handle = spawn_sweep_task(Arc::clone(&codes), DEFAULT_SWEEP_INTERVAL_SECS);

    let tokens: Arc<dyn TokenService> = Arc::new(JwtTokenService::new(
        args.token_secret.as_bytes(),
        args.external_url.clone(),
        args.token_ttl_secs,
    ));

    let state = Arc::new(AppState {
        factory: SpClientFactory::new(configs, settings),
        directory,
        codes,
        tokens,
        host_app: service_config.host_app,
        on_invalid_link_code: service_config.on_invalid_link_code,
        external_base_url: args.external_url,
    });

    let listener = tokio::net::TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("Failed to bind {}", args.listen))?;
    info!(listen = %args.listen, "Listening");

    axum::serve(listener, router(state))
        .await
        .context("Server error")?;

    Ok(())
}
