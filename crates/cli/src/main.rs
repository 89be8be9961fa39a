//! AgentMesh CLI — serve the gateway, mint API keys.
//!
//! `serve` wires the composition root: key store from the keys file,
//! adapter registry, event buses, context store, and the WebSocket
//! gateway. `keygen` mints a tenant API key into the keys file and
//! prints the secret exactly once.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use agentmesh_adapters::AdapterRegistry;
use agentmesh_config::AppConfig;
use agentmesh_context::InMemoryContextStore;
use agentmesh_core::context::ContextStore;
use agentmesh_core::tenant::{ApiKey, KeyStore, KeyType};
use agentmesh_events::{AdapterEventBus, SystemEventBus};
use agentmesh_security::{InMemoryKeyStore, generate_key};

#[derive(Parser)]
#[command(name = "agentmesh", version, about = "Multi-tenant agent coordination gateway")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the gateway server
    Serve {
        /// Path to agentmesh.toml (defaults apply when absent)
        #[arg(long, env = "AGENTMESH_CONFIG")]
        config: Option<PathBuf>,

        /// Path to the API-key records file
        #[arg(long, default_value = "agentmesh-keys.json")]
        keys: PathBuf,
    },

    /// Mint an API key into the keys file and print it once
    Keygen {
        /// Tenant the key belongs to
        #[arg(long)]
        tenant: String,

        /// Key class: admin, agent, or service
        #[arg(long, default_value = "agent")]
        key_type: String,

        /// Requests allowed per window
        #[arg(long, default_value_t = 60)]
        rate: u32,

        /// Rate window in seconds
        #[arg(long, default_value_t = 60)]
        window: u64,

        /// Expiry in days (never expires when absent)
        #[arg(long)]
        expires_days: Option<i64>,

        /// Path to the API-key records file
        #[arg(long, default_value = "agentmesh-keys.json")]
        keys: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    match Cli::parse().command {
        Command::Serve { config, keys } => serve(config, keys).await,
        Command::Keygen {
            tenant,
            key_type,
            rate,
            window,
            expires_days,
            keys,
        } => keygen(&tenant, &key_type, rate, window, expires_days, keys),
    }
}

async fn serve(config_path: Option<PathBuf>, keys_path: PathBuf) -> anyhow::Result<()> {
    let config = match &config_path {
        Some(path) => AppConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => AppConfig::from_env().context("building config from environment")?,
    };

    let key_store = Arc::new(InMemoryKeyStore::new());
    for record in load_key_records(&keys_path)? {
        key_store.insert(record).await.map_err(anyhow::Error::new)?;
    }

    // Adapters are registered here as deployments provide them; the
    // registry starts empty and factories can be added before serving.
    let adapters = Arc::new(AdapterRegistry::new());

    let adapter_bus = AdapterEventBus::new();
    let system_bus = Arc::new(SystemEventBus::default());
    let context_store: Arc<dyn ContextStore> = Arc::new(InMemoryContextStore::new());

    let state = agentmesh_gateway::build_state(
        &config,
        key_store,
        adapters,
        context_store,
        &adapter_bus,
        system_bus,
    );

    info!(
        host = %config.gateway.host,
        port = config.gateway.port,
        adapters = config.adapters.len(),
        "AgentMesh starting"
    );
    agentmesh_gateway::start(state, &config.gateway.host, config.gateway.port)
        .await
        .context("gateway server failed")?;
    Ok(())
}

fn keygen(
    tenant: &str,
    key_type: &str,
    rate: u32,
    window: u64,
    expires_days: Option<i64>,
    keys_path: PathBuf,
) -> anyhow::Result<()> {
    let key_type = match key_type {
        "admin" => KeyType::Admin,
        "agent" => KeyType::Agent,
        "service" => KeyType::Service,
        other => anyhow::bail!("unknown key type '{other}' (admin|agent|service)"),
    };
    let expires_at = expires_days.map(|days| chrono::Utc::now() + chrono::Duration::days(days));

    let (record, full_key) = generate_key(tenant, key_type, vec![], rate, window, expires_at);

    let mut records = load_key_records(&keys_path)?;
    let prefix = record.key_prefix.clone();
    records.push(record);
    std::fs::write(&keys_path, serde_json::to_string_pretty(&records)?)
        .with_context(|| format!("writing {}", keys_path.display()))?;

    println!("key prefix: {prefix}");
    println!("API key (shown once, store it now): {full_key}");
    Ok(())
}

fn load_key_records(path: &PathBuf) -> anyhow::Result<Vec<ApiKey>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}
