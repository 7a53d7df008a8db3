use std::future::Future;
use std::time::Duration;

use alloy::primitives::{B256, U256};

use super::{ChainCapability, Finality, LockBatch, SignedUnlock};
use crate::domain::credential::Credential;
use crate::domain::lock::{ChainId, LockEvent, LockId};

/// Port for interacting with one ledger (one instance per chain).
///
/// Implementations:
/// - `EthereumChainAdapter` (alloy, JSON-RPC over HTTP)
/// - `MockChainPort` for tests and the demo
pub trait ChainPort: Send + Sync {
    /// Chain this adapter is bound to.
    fn chain_id(&self) -> &ChainId;

    /// Lock/unlock capability of this chain.
    fn capability(&self) -> ChainCapability;

    /// Finalized lock events from `from_block` up to the finalized head,
    /// de-duplicated by `(tx_hash, log_index)`.
    fn watch_locks(
        &self,
        from_block: u64,
    ) -> impl Future<Output = Result<LockBatch, ChainError>> + Send;

    /// Allocate a nonce and sign the unlock for `event`, authorized by
    /// `credential`. Nothing is sent to the node.
    fn sign_unlock(
        &self,
        event: &LockEvent,
        credential: &Credential,
    ) -> impl Future<Output = Result<SignedUnlock, ChainError>> + Send;

    /// Send a signed unlock. Re-sending a transaction the node already knows,
    /// or one already mined, succeeds. `NonceConsumed` means the transaction
    /// can never be mined.
    fn broadcast_unlock(
        &self,
        signed: &SignedUnlock,
    ) -> impl Future<Output = Result<(), ChainError>> + Send;

    /// Sign and broadcast in one go. Returns the transaction hash.
    fn submit_unlock(
        &self,
        event: &LockEvent,
        credential: &Credential,
    ) -> impl Future<Output = Result<B256, ChainError>> + Send {
        async move {
            let signed = self.sign_unlock(event, credential).await?;
            self.broadcast_unlock(&signed).await?;
            Ok(signed.tx_hash)
        }
    }

    /// Block until `tx_hash` has `confirmations` confirmations, reverted, or
    /// `timeout` elapsed.
    fn wait_for_finality(
        &self,
        tx_hash: B256,
        confirmations: u64,
        timeout: Duration,
    ) -> impl Future<Output = Result<Finality, ChainError>> + Send;

    /// Look up an unlock already executed on this chain for `lock_id`.
    fn find_unlock(
        &self,
        lock_id: &LockId,
    ) -> impl Future<Output = Result<Option<B256>, ChainError>> + Send;
}

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("submission failed: {0}")]
    Submission(String),

    #[error("insufficient funds: required {required} wei, available {available} wei")]
    InsufficientFunds { required: U256, available: U256 },

    #[error("chain {chain} does not support {operation}")]
    Unsupported {
        chain: ChainId,
        operation: &'static str,
    },

    #[error("failed to decode event: {0}")]
    Decode(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("nonce of unlock transaction {0} was used by another transaction")]
    NonceConsumed(B256),
}

impl ChainError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChainError::Rpc(_)
                | ChainError::Submission(_)
                | ChainError::InsufficientFunds { .. }
                | ChainError::Timeout { .. }
                | ChainError::NonceConsumed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ChainError::Rpc("connection reset".into()).is_transient());
        assert!(ChainError::InsufficientFunds {
            required: U256::from(10),
            available: U256::from(1),
        }
        .is_transient());
        assert!(!ChainError::Unsupported {
            chain: ChainId::from("A"),
            operation: "unlock",
        }
        .is_transient());
        assert!(!ChainError::Decode("bad log".into()).is_transient());
        assert!(ChainError::Timeout {
            operation: "find_unlock",
            after: Duration::from_secs(30),
        }
        .is_transient());
    }

    #[test]
    fn test_timeout_display() {
        let err = ChainError::Timeout {
            operation: "get_logs",
            after: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "get_logs timed out after 1.5s");
    }

    #[test]
    fn test_insufficient_funds_display() {
        let err = ChainError::InsufficientFunds {
            required: U256::from(100_000),
            available: U256::from(50_000),
        };
        assert_eq!(
            err.to_string(),
            "insufficient funds: required 100000 wei, available 50000 wei"
        );
    }
}
