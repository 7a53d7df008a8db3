use std::collections::HashSet;
use std::fmt::Display;
use std::future::IntoFuture;
use std::time::Duration;

use alloy::{
    eips::eip2718::Encodable2718,
    network::{EthereumWallet, TransactionBuilder},
    primitives::{keccak256, Address, Bytes, B256, U256},
    providers::{DynProvider, Provider, ProviderBuilder},
    rpc::types::{Filter, Log, TransactionReceipt},
    signers::local::PrivateKeySigner,
    sol_types::SolEvent,
};
use tokio::sync::{Mutex, OnceCell};
use tokio::time::Instant;

use super::abi::ILockBridge;
use crate::config::{ChainConfig, RelayConfig};
use crate::domain::credential::Credential;
use crate::domain::lock::{format_amount, ChainId, LockEvent, LockId};
use crate::ports::chain::{ChainError, ChainPort};
use crate::ports::{ChainCapability, Finality, LockBatch, SignedUnlock, TxReceipt};

/// Maximum block range per log query (avoids RPC limits).
const BATCH_SIZE: u64 = 500;

/// Next nonce for the operator account, `None` until fetched from the node.
#[derive(Debug, Default)]
struct NonceManager {
    next: Option<u64>,
}

/// How a node refused `eth_sendRawTransaction`.
#[derive(Debug, PartialEq, Eq)]
enum SendRejection {
    /// The transaction is already in the pool.
    Known,
    /// The nonce is used; either this transaction was mined or another one was.
    NonceTooLow,
    Other,
}

impl SendRejection {
    fn classify(message: &str) -> Self {
        let message = message.to_ascii_lowercase();
        if message.contains("already known") || message.contains("known transaction") {
            SendRejection::Known
        } else if message.contains("nonce too low") {
            SendRejection::NonceTooLow
        } else {
            SendRejection::Other
        }
    }
}

/// `ChainPort` over JSON-RPC for one EVM chain running the lock bridge.
///
/// Unlocks are signed locally, so the transaction hash exists before the node
/// sees the transaction. Nonce allocation and signing go through the
/// `NonceManager` mutex. Every RPC call is bounded by `rpc_timeout`.
pub struct EthereumChainAdapter {
    chain_id: ChainId,
    capability: ChainCapability,
    provider: DynProvider,
    wallet: EthereumWallet,
    bridge: Address,
    operator: Address,
    deployment_block: u64,
    gas_limit: u64,
    confirmations: u64,
    poll_interval: Duration,
    rpc_timeout: Duration,
    nonces: Mutex<NonceManager>,
    evm_chain: OnceCell<u64>,
}

impl EthereumChainAdapter {
    pub fn connect(chain: &ChainConfig, relay: &RelayConfig) -> Result<Self, ChainError> {
        let signer: PrivateKeySigner = chain
            .operator_key
            .parse()
            .map_err(|e| ChainError::Rpc(format!("Invalid private key: {}", e)))?;
        let operator = signer.address();
        let provider = DynProvider::new(
            ProviderBuilder::new().connect_http(
                chain
                    .rpc_url
                    .parse()
                    .map_err(|e| ChainError::Rpc(format!("Invalid RPC URL: {}", e)))?,
            ),
        );

        Ok(Self {
            chain_id: chain.id.clone(),
            capability: chain.capability,
            provider,
            wallet: EthereumWallet::from(signer),
            bridge: chain.bridge_address,
            operator,
            deployment_block: chain.deployment_block,
            gas_limit: chain.gas_limit,
            confirmations: relay.finality_confirmations.max(1),
            poll_interval: relay.poll_interval,
            rpc_timeout: relay.rpc_timeout,
            nonces: Mutex::new(NonceManager::default()),
            evm_chain: OnceCell::new(),
        })
    }

    pub fn operator_address(&self) -> Address {
        self.operator
    }

    fn convert_receipt(receipt: &TransactionReceipt) -> TxReceipt {
        TxReceipt {
            tx_hash: receipt.transaction_hash,
            block_number: receipt.block_number,
            success: receipt.status(),
        }
    }

    /// Await one RPC call under the adapter's deadline.
    async fn rpc<F, T, E>(&self, operation: &'static str, call: F) -> Result<T, ChainError>
    where
        F: IntoFuture<Output = Result<T, E>>,
        E: Display,
    {
        match tokio::time::timeout(self.rpc_timeout, call).await {
            Ok(result) => result.map_err(|e| ChainError::Rpc(format!("{operation}: {e}"))),
            Err(_) => Err(ChainError::Timeout {
                operation,
                after: self.rpc_timeout,
            }),
        }
    }

    fn ensure_unlock(&self) -> Result<(), ChainError> {
        if self.capability.can_unlock() {
            Ok(())
        } else {
            Err(ChainError::Unsupported {
                chain: self.chain_id.clone(),
                operation: "submit_unlock",
            })
        }
    }

    fn decode_lock(&self, log: &Log) -> Result<Option<LockEvent>, ChainError> {
        if log.removed {
            return Ok(None);
        }
        let decoded = log
            .log_decode::<ILockBridge::AssetLocked>()
            .map_err(|e| ChainError::Decode(e.to_string()))?;
        let data = decoded.inner.data;

        let tx_hash = log
            .transaction_hash
            .ok_or_else(|| ChainError::Decode("log without transaction hash".into()))?;
        let log_index = log
            .log_index
            .ok_or_else(|| ChainError::Decode("log without index".into()))?;
        let block = log
            .block_number
            .ok_or_else(|| ChainError::Decode("log without block number".into()))?;

        Ok(Some(LockEvent {
            lock_id: LockId::derive(&self.chain_id, tx_hash, log_index),
            source_chain_id: self.chain_id.clone(),
            target_chain_id: ChainId::new(data.targetChain),
            owner_address: data.owner,
            asset_identifier: data.asset,
            amount: data.amount,
            observed_at_block: block,
            tx_hash,
            log_index,
        }))
    }

    async fn evm_chain_id(&self) -> Result<u64, ChainError> {
        self.evm_chain
            .get_or_try_init(|| self.rpc("eth_chainId", self.provider.get_chain_id()))
            .await
            .copied()
    }

    async fn next_nonce(&self, nonces: &mut NonceManager) -> Result<u64, ChainError> {
        if let Some(nonce) = nonces.next {
            return Ok(nonce);
        }
        let nonce = self
            .rpc(
                "eth_getTransactionCount",
                self.provider.get_transaction_count(self.operator).pending(),
            )
            .await?;
        nonces.next = Some(nonce);
        Ok(nonce)
    }
}

impl ChainPort for EthereumChainAdapter {
    fn chain_id(&self) -> &ChainId {
        &self.chain_id
    }

    fn capability(&self) -> ChainCapability {
        self.capability
    }

    /// Scans at most one `BATCH_SIZE` window per call; callers keep polling
    /// from `next_block` until the finalized head is reached.
    async fn watch_locks(&self, from_block: u64) -> Result<LockBatch, ChainError> {
        if !self.capability.can_lock() {
            return Err(ChainError::Unsupported {
                chain: self.chain_id.clone(),
                operation: "watch_locks",
            });
        }

        let from_block = from_block.max(self.deployment_block);
        let head = self
            .rpc("eth_blockNumber", self.provider.get_block_number())
            .await?;
        let finalized = head.saturating_sub(self.confirmations - 1);
        if from_block > finalized {
            return Ok(LockBatch {
                events: Vec::new(),
                next_block: from_block,
            });
        }

        let to_block = finalized.min(from_block + BATCH_SIZE - 1);
        let filter = Filter::new()
            .address(self.bridge)
            .event_signature(ILockBridge::AssetLocked::SIGNATURE_HASH)
            .from_block(from_block)
            .to_block(to_block);
        let logs = self.rpc("eth_getLogs", self.provider.get_logs(&filter)).await?;

        let mut seen = HashSet::new();
        let mut events = Vec::new();
        for log in &logs {
            if let Some(event) = self.decode_lock(log)? {
                if seen.insert(event.log_key()) {
                    events.push(event);
                }
            }
        }
        events.sort_by_key(|e| (e.observed_at_block, e.log_index));

        tracing::debug!(
            chain = %self.chain_id,
            from_block,
            to_block,
            finalized,
            count = events.len(),
            "scanned lock events"
        );

        Ok(LockBatch {
            events,
            next_block: to_block + 1,
        })
    }

    async fn sign_unlock(
        &self,
        event: &LockEvent,
        credential: &Credential,
    ) -> Result<SignedUnlock, ChainError> {
        self.ensure_unlock()?;
        let evm_chain_id = self.evm_chain_id().await?;
        let mut nonces = self.nonces.lock().await;

        let gas_price = self.rpc("eth_gasPrice", self.provider.get_gas_price()).await?;
        let balance = self
            .rpc("eth_getBalance", self.provider.get_balance(self.operator))
            .await?;
        let required = U256::from(self.gas_limit) * U256::from(gas_price);
        if balance < required {
            return Err(ChainError::InsufficientFunds {
                required,
                available: balance,
            });
        }

        let nonce = self.next_nonce(&mut nonces).await?;
        let request = ILockBridge::new(self.bridge, &self.provider)
            .unlock(
                event.lock_id.lock_key(),
                event.owner_address,
                event.asset_identifier,
                event.amount,
                credential.digest(),
            )
            .from(self.operator)
            .nonce(nonce)
            .gas(self.gas_limit)
            .gas_price(gas_price)
            .into_transaction_request()
            .with_chain_id(evm_chain_id);
        let envelope = request
            .build(&self.wallet)
            .await
            .map_err(|e| ChainError::Submission(format!("signing failed: {e}")))?;
        nonces.next = Some(nonce + 1);

        let raw = Bytes::from(envelope.encoded_2718());
        let tx_hash = keccak256(&raw);
        tracing::info!(
            chain = %self.chain_id,
            lock_id = %event.lock_id,
            nonce,
            amount = %format_amount(event.amount),
            %tx_hash,
            "unlock signed"
        );
        Ok(SignedUnlock { tx_hash, raw })
    }

    async fn broadcast_unlock(&self, signed: &SignedUnlock) -> Result<(), ChainError> {
        self.ensure_unlock()?;
        let tx_hash = signed.tx_hash;
        let sent = tokio::time::timeout(
            self.rpc_timeout,
            self.provider.send_raw_transaction(&signed.raw),
        )
        .await
        .map_err(|_| ChainError::Timeout {
            operation: "eth_sendRawTransaction",
            after: self.rpc_timeout,
        })?;

        let err = match sent {
            Ok(_) => {
                tracing::info!(chain = %self.chain_id, %tx_hash, "unlock broadcast");
                return Ok(());
            }
            Err(e) => e.to_string(),
        };

        match SendRejection::classify(&err) {
            SendRejection::Known => {
                tracing::debug!(chain = %self.chain_id, %tx_hash, "unlock already in pool");
                Ok(())
            }
            SendRejection::NonceTooLow => {
                let receipt = self
                    .rpc(
                        "eth_getTransactionReceipt",
                        self.provider.get_transaction_receipt(tx_hash),
                    )
                    .await?;
                if receipt.is_some() {
                    return Ok(());
                }
                self.nonces.lock().await.next = None;
                Err(ChainError::NonceConsumed(tx_hash))
            }
            SendRejection::Other => {
                // The node may have seen a different nonce; refetch next time.
                self.nonces.lock().await.next = None;
                Err(ChainError::Submission(err))
            }
        }
    }

    async fn wait_for_finality(
        &self,
        tx_hash: B256,
        confirmations: u64,
        timeout: Duration,
    ) -> Result<Finality, ChainError> {
        let deadline = Instant::now() + timeout;
        let confirmations = confirmations.max(1);

        loop {
            let receipt = self
                .rpc(
                    "eth_getTransactionReceipt",
                    self.provider.get_transaction_receipt(tx_hash),
                )
                .await?
                .map(|r| Self::convert_receipt(&r));

            if let Some(receipt) = receipt {
                if !receipt.success {
                    return Ok(Finality::Reverted);
                }
                if let Some(block) = receipt.block_number {
                    let head = self
                        .rpc("eth_blockNumber", self.provider.get_block_number())
                        .await?;
                    if head + 1 >= block + confirmations {
                        return Ok(Finality::Confirmed { block });
                    }
                }
            }

            if Instant::now() + self.poll_interval > deadline {
                return Ok(Finality::Timeout);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn find_unlock(&self, lock_id: &LockId) -> Result<Option<B256>, ChainError> {
        let lock_key = lock_id.lock_key();
        let bridge = ILockBridge::new(self.bridge, &self.provider);
        if !self.rpc("unlocked", bridge.unlocked(lock_key).call()).await? {
            return Ok(None);
        }

        let filter = Filter::new()
            .address(self.bridge)
            .event_signature(ILockBridge::AssetUnlocked::SIGNATURE_HASH)
            .topic1(lock_key)
            .from_block(self.deployment_block);
        let logs = self.rpc("eth_getLogs", self.provider.get_logs(&filter)).await?;

        logs.iter()
            .filter(|log| !log.removed)
            .find_map(|log| log.transaction_hash)
            .map(Some)
            .ok_or_else(|| {
                ChainError::Rpc(format!(
                    "bridge reports {lock_id} unlocked but no AssetUnlocked log was found"
                ))
            })
    }
}
