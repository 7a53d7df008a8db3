//! Relay oracle daemon.
//!
//! Watches every configured route for finalized locks, obtains a credential
//! for each lock owner from the identity agent, and submits the unlock on the
//! target chain. Relay state lives in a sled database, so a restart resumes
//! every relay from its last persisted step.
//!
//! Run with:
//!   cargo run --bin oracle -- --config ./config.toml
//!   cargo run --bin oracle -- --config ./config.toml --recover-only

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use relay_oracle::adapters::agent_client::AgentClient;
use relay_oracle::adapters::ethereum::EthereumChainAdapter;
use relay_oracle::adapters::sled_store::SledProofStore;
use relay_oracle::bridge::BridgeSettings;
use relay_oracle::config::{ConfigError, OracleConfig};
use relay_oracle::coordinator::{CoordinatorError, CoordinatorSettings, RelayCoordinator};
use relay_oracle::ports::chain::ChainError;
use relay_oracle::ports::identity::IdentityError;
use relay_oracle::ports::store::StoreError;
use relay_oracle::server::{start_server, ServerError};

#[derive(clap::Parser)]
#[command(name = "oracle", about = "Cross-chain lock/relay/unlock oracle")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "./config.toml")]
    config: PathBuf,

    /// Drive pending relays once from the store and exit, without watching chains.
    #[arg(long)]
    recover_only: bool,
}

#[derive(Debug, thiserror::Error)]
enum OracleError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("chain adapter error: {0}")]
    Chain(#[from] ChainError),

    #[error("identity agent error: {0}")]
    Agent(#[from] IdentityError),

    #[error("server error: {0}")]
    Server(#[from] ServerError),

    #[error("coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run(Args::parse()).await {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), OracleError> {
    let config = OracleConfig::load(&args.config)?;
    info!(config = %args.config.display(), chains = config.chains.len(), routes = config.routes.len(), "config loaded");

    let store = SledProofStore::open(&config.relay.store_path)?;
    info!(path = %config.relay.store_path.display(), "proof store opened");

    let mut chains = Vec::with_capacity(config.chains.len());
    for chain in &config.chains {
        let adapter = EthereumChainAdapter::connect(chain, &config.relay)?;
        info!(
            chain = %chain.id,
            bridge = %chain.bridge_address,
            capability = ?chain.capability,
            "chain adapter ready"
        );
        chains.push(adapter);
    }

    let agent = AgentClient::new(
        config.agent.url.clone(),
        config.agent.request_timeout,
        config.agent.poll_interval,
    )?;

    let coordinator = Arc::new(RelayCoordinator::new(
        chains,
        config.routes.clone(),
        store,
        agent,
        BridgeSettings::from(&config.agent),
        CoordinatorSettings::from(&config.relay),
    ));

    if args.recover_only {
        let resumed = coordinator.recover().await?;
        let finished = resumed.iter().filter(|r| r.is_terminal()).count();
        info!(resumed = resumed.len(), finished, "recovery pass complete");
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let (server, bound_addr) =
        start_server(Arc::clone(&coordinator), config.server.listen, shutdown.clone()).await?;
    let relay = tokio::spawn(Arc::clone(&coordinator).run(shutdown.clone()));
    info!(%bound_addr, "ready");

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    shutdown.cancel();

    if let Err(e) = relay.await {
        error!("relay task panicked: {e}");
    }
    if let Err(e) = server.await {
        error!("server task panicked: {e}");
    }
    Ok(())
}
