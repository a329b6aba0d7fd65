//! Ferry server binary.

use anyhow::{Context, Result};
use clap::Parser;
use ferry_core::config::{AppConfig, PrivateKeyConfig, SigningConfig};
use ferry_metadata::CollaboratorAuthorizer;
use ferry_mirror::{Coordinator, MirrorContext};
use ferry_registry::RegistryClient;
use ferry_server::{AppState, create_router};
use ferry_signer::{ArchiveSigner, Signer};
use ferry_storage::StorageSet;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often finished export tasks are reaped.
const EXPORT_WATCHDOG_INTERVAL: Duration = Duration::from_secs(10);

/// Ferry - mirrors model artefacts between governance instances
#[derive(Parser, Debug)]
#[command(name = "ferryd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "FERRY_CONFIG", default_value = "config/server.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Ferry v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config)?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    if config.auth.principals.is_empty() {
        tracing::warn!("No principals configured, every authenticated endpoint will reject");
    }

    if config.server.metrics_enabled {
        ferry_server::metrics::register_metrics();
        tracing::info!("Prometheus metrics registered");
    }

    let storage = StorageSet::from_config(&config.storage)
        .await
        .context("failed to initialize storage")?;
    storage
        .health_check()
        .await
        .context("storage health check failed")?;
    tracing::info!("Storage backends initialized and reachable");

    let records = ferry_metadata::from_config(&config.records)
        .await
        .context("failed to initialize record store")?;
    records
        .health_check()
        .await
        .context("record store health check failed")?;
    tracing::info!("Record store initialized");

    let registry = RegistryClient::from_config(&config.registry)
        .context("failed to initialize registry client")?;
    if let Err(e) = registry.ping().await {
        // Image exports and imports fail until the registry is reachable;
        // file mirroring does not need it.
        tracing::warn!(url = %config.registry.url, error = %e, "Registry not reachable at startup");
    }

    let signer = match &config.signing {
        Some(signing_config) => Some(Arc::new(load_signer(signing_config).await?)),
        None => {
            tracing::warn!("No signing key configured, exports will be unsigned");
            None
        }
    };

    let mut ctx = MirrorContext::new(
        records,
        Arc::new(CollaboratorAuthorizer),
        storage,
        Arc::new(registry),
        config.mirror.clone(),
    )
    .with_registry_domain(config.registry.effective_domain());
    if let Some(signer) = &signer {
        ctx = ctx.with_signer(signer.clone() as Arc<dyn Signer>);
    }

    let state = AppState::new(config.clone(), Coordinator::new(ctx), signer);
    let _watchdog = state.exports.clone().spawn_watchdog(EXPORT_WATCHDOG_INTERVAL);

    let app = create_router(state);

    let addr: SocketAddr = config.server.bind.parse().context("invalid bind address")?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// Merge the optional TOML file with `FERRY_` environment variables.
fn load_config(path: &str) -> Result<AppConfig> {
    let config_path = std::path::Path::new(path);
    let mut figment = Figment::new();
    let has_config_file = config_path.exists();

    if has_config_file {
        tracing::info!(config_path = %path, "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!("No config file found at {}", path);
    }

    let has_env_config =
        std::env::vars().any(|(key, _)| key.starts_with("FERRY_") && key != "FERRY_CONFIG");

    if !has_config_file && !has_env_config {
        anyhow::bail!(
            "No configuration provided.\n\n\
             Provide configuration via one of:\n  \
             1. Config file: ferryd --config /path/to/config.toml\n  \
             2. Environment variables: FERRY_SERVER__BIND=0.0.0.0:8080 \
             FERRY_REGISTRY__URL=https://registry.example.com ferryd\n\n\
             Set FERRY_CONFIG to specify a default config file path."
        );
    }

    figment
        .merge(Env::prefixed("FERRY_").split("__"))
        .extract()
        .context("failed to load configuration")
}

/// Load the archive signer from configuration.
async fn load_signer(config: &SigningConfig) -> Result<ArchiveSigner> {
    let signer = match &config.private_key {
        PrivateKeyConfig::File { path } => {
            let key_data = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read key file: {}", path.display()))?;
            ArchiveSigner::from_secret_key(key_data.trim())
                .context("failed to parse signing key")?
        }
        PrivateKeyConfig::Env { var } => {
            let key_data = std::env::var(var)
                .with_context(|| format!("signing key env var not set: {var}"))?;
            ArchiveSigner::from_secret_key(key_data.trim())
                .context("failed to parse signing key")?
        }
        PrivateKeyConfig::Value { key } => {
            tracing::warn!("Using inline signing key (not recommended for production)");
            ArchiveSigner::from_secret_key(key.trim()).context("failed to parse signing key")?
        }
        PrivateKeyConfig::Generate => {
            tracing::warn!("Generating ephemeral signing key (not suitable for production)");
            let signer = ArchiveSigner::generate(&config.key_name);
            tracing::info!("Public key: {}", signer.public_key_string());
            signer
        }
    };

    if signer.key_name() != config.key_name {
        tracing::warn!(
            configured = %config.key_name,
            loaded = %signer.key_name(),
            "Signing key name differs from signing.key_name, using the key's own name"
        );
    }
    tracing::info!("Loaded signing key: {}", signer.key_name());
    Ok(signer)
}
