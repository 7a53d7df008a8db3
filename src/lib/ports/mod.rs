pub mod chain;
pub mod identity;
pub mod store;

use alloy::primitives::{Bytes, B256};

use crate::domain::lock::LockEvent;

/// What a chain adapter is allowed to do on its chain.
///
/// Watching requires `Lock`, submitting unlocks requires `Unlock`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainCapability {
    Lock,
    Unlock,
    #[default]
    Both,
}

impl ChainCapability {
    pub fn can_lock(self) -> bool {
        matches!(self, ChainCapability::Lock | ChainCapability::Both)
    }

    pub fn can_unlock(self) -> bool {
        matches!(self, ChainCapability::Unlock | ChainCapability::Both)
    }
}

/// One poll's worth of finalized lock events.
///
/// Events are ordered by `(block, log_index)`. The next poll should start at
/// `next_block`; an empty batch with `next_block == from_block` means the
/// finalized head has not advanced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockBatch {
    pub events: Vec<LockEvent>,
    pub next_block: u64,
}

impl IntoIterator for LockBatch {
    type Item = LockEvent;
    type IntoIter = std::vec::IntoIter<LockEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.into_iter()
    }
}

/// Result of waiting for an unlock transaction to finalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Finality {
    Confirmed { block: u64 },
    Reverted,
    Timeout,
}

/// An unlock transaction signed locally but not necessarily broadcast.
///
/// `tx_hash` is known before the node sees the transaction, so it can be
/// persisted first and `raw` re-sent any number of times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedUnlock {
    pub tx_hash: B256,
    pub raw: Bytes,
}

/// Minimal receipt view used by adapters when mapping node responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: B256,
    pub block_number: Option<u64>,
    pub success: bool,
}
