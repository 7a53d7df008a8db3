//! In-process demo of the relay pipeline.
//!
//! Runs the coordinator against mock chains and a mock identity agent, with
//! the operator API on a random loopback port. Three locks are relayed: one
//! cleanly, one through a transient broadcast failure, and one whose unlock
//! reverts and stays failed.
//!
//! Run with:
//!   cargo run --bin demo

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, B256, U256};
use tokio_util::sync::CancellationToken;
use tracing::info;

use relay_oracle::adapters::memory_store::InMemoryProofStore;
use relay_oracle::adapters::mock_agent::MockIdentityAgent;
use relay_oracle::adapters::mock_chain::MockChainPort;
use relay_oracle::bridge::BridgeSettings;
use relay_oracle::config::RouteConfig;
use relay_oracle::coordinator::{CoordinatorSettings, RelayCoordinator};
use relay_oracle::domain::lock::{format_amount, ChainId, LockEvent, LockId};
use relay_oracle::domain::relay::RelayRecord;
use relay_oracle::ports::{ChainCapability, Finality};
use relay_oracle::server::{start_server, ServerError};

#[derive(Debug, thiserror::Error)]
enum DemoError {
    #[error("server error: {0}")]
    Server(#[from] ServerError),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("relays did not settle within {0:?}")]
    Timeout(Duration),
}

const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

fn lock(source: &ChainId, target: &str, seed: u8, block: u64) -> LockEvent {
    let tx_hash = B256::repeat_byte(seed);
    LockEvent {
        lock_id: LockId::derive(source, tx_hash, 0),
        source_chain_id: source.clone(),
        target_chain_id: ChainId::from(target),
        owner_address: Address::repeat_byte(seed),
        asset_identifier: Address::ZERO,
        amount: U256::from(seed as u64) * U256::from(10u64).pow(U256::from(17u64)),
        observed_at_block: block,
        tx_hash,
        log_index: 0,
    }
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

    if let Err(e) = run().await {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), DemoError> {
    let chain_a = ChainId::from("chain-a");
    let source = MockChainPort::new("chain-a", ChainCapability::Lock);
    let target_b = MockChainPort::new("chain-b", ChainCapability::Both);
    let target_c = MockChainPort::new("chain-c", ChainCapability::Unlock);

    // The first broadcast on chain-b fails once; the unlock on chain-c reverts.
    target_b.fail_next_submissions(1).await;
    target_c.push_finality(Finality::Reverted).await;

    let coordinator = Arc::new(RelayCoordinator::new(
        vec![source.clone(), target_b.clone(), target_c.clone()],
        vec![
            RouteConfig {
                source: chain_a.clone(),
                target: ChainId::from("chain-b"),
            },
            RouteConfig {
                source: chain_a.clone(),
                target: ChainId::from("chain-c"),
            },
        ],
        InMemoryProofStore::new(),
        MockIdentityAgent::new(),
        BridgeSettings::default(),
        CoordinatorSettings {
            finality_confirmations: 1,
            poll_interval: Duration::from_millis(50),
            backoff_base: Duration::from_millis(20),
            backoff_max: Duration::from_millis(200),
            ..CoordinatorSettings::default()
        },
    ));

    let shutdown = CancellationToken::new();
    let listen = SocketAddr::from(([127, 0, 0, 1], 0));
    let (server, addr) = start_server(Arc::clone(&coordinator), listen, shutdown.clone()).await?;
    let relay = tokio::spawn(Arc::clone(&coordinator).run(shutdown.clone()));

    // ── Lock on chain-a ──
    let locks = [
        lock(&chain_a, "chain-b", 0x11, 10),
        lock(&chain_a, "chain-b", 0x22, 11),
        lock(&chain_a, "chain-c", 0x33, 12),
    ];
    for event in &locks {
        info!(
            lock_id = %event.lock_id,
            target = %event.target_chain_id,
            amount = %format_amount(event.amount),
            "locking"
        );
        source.push_lock(event.clone()).await;
    }

    // ── Wait for every relay to settle, via the operator API ──
    let client = reqwest::Client::new();
    let base_url = format!("http://{addr}");
    let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
    let settled = loop {
        let pending: Vec<RelayRecord> = client
            .get(format!("{base_url}/relays"))
            .send()
            .await?
            .json()
            .await?;
        let confirmed: Vec<RelayRecord> = client
            .get(format!("{base_url}/relays?state=unlock_confirmed"))
            .send()
            .await?
            .json()
            .await?;
        let failed: Vec<RelayRecord> = client
            .get(format!("{base_url}/relays?state=failed"))
            .send()
            .await?
            .json()
            .await?;

        if pending.is_empty() && confirmed.len() + failed.len() == locks.len() {
            break confirmed.into_iter().chain(failed).collect::<Vec<_>>();
        }
        if tokio::time::Instant::now() > deadline {
            shutdown.cancel();
            return Err(DemoError::Timeout(SETTLE_TIMEOUT));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    };

    for record in &settled {
        info!(
            lock_id = %record.lock_id,
            state = %record.state,
            tx_hash = ?record.unlock_tx_hash,
            last_error = ?record.last_error,
            "relay settled"
        );
    }
    info!(
        chain_b_unlocks = target_b.submission_count().await,
        chain_c_unlocks = target_c.submission_count().await,
        "demo complete"
    );

    shutdown.cancel();
    relay.await.ok();
    server.await.ok();
    Ok(())
}
