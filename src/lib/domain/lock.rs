use std::fmt;

use alloy::primitives::utils::format_units;
use alloy::primitives::{keccak256, Address, B256, U256};

/// Identifier of a configured chain (e.g. `"besu-a"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ChainId(pub String);

impl ChainId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChainId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Globally unique identifier of a lock.
///
/// Chain adapters derive it as `{source_chain}:{tx_hash}:{log_index}`, which is
/// unique across chains because the source chain id is part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct LockId(pub String);

impl LockId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the lock id for a log observed on `chain`.
    pub fn derive(chain: &ChainId, tx_hash: B256, log_index: u64) -> Self {
        Self(format!("{chain}:{tx_hash:#x}:{log_index}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// On-chain reference to this lock: `keccak256(lock_id)`.
    pub fn lock_key(&self) -> B256 {
        keccak256(self.0.as_bytes())
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LockId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A lock observed on a source chain after it reached finality.
///
/// Immutable once recorded in the proof store.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LockEvent {
    pub lock_id: LockId,
    pub source_chain_id: ChainId,
    pub target_chain_id: ChainId,
    pub owner_address: Address,
    /// Token contract, or the zero address for the native asset
    pub asset_identifier: Address,
    /// Amount in the asset's smallest unit
    pub amount: U256,
    pub observed_at_block: u64,
    pub tx_hash: B256,
    pub log_index: u64,
}

impl LockEvent {
    /// Schema validation applied before a lock is recorded or credentialed.
    pub fn validate(&self) -> Result<(), LockValidationError> {
        if self.lock_id.0.trim().is_empty() {
            return Err(LockValidationError::EmptyLockId);
        }
        if self.source_chain_id.0.is_empty() || self.target_chain_id.0.is_empty() {
            return Err(LockValidationError::EmptyChainId);
        }
        if self.source_chain_id == self.target_chain_id {
            return Err(LockValidationError::SameChain(self.source_chain_id.clone()));
        }
        if self.amount.is_zero() {
            return Err(LockValidationError::ZeroAmount);
        }
        if self.owner_address == Address::ZERO {
            return Err(LockValidationError::ZeroOwner);
        }
        if self.tx_hash == B256::ZERO {
            return Err(LockValidationError::ZeroTxHash);
        }
        Ok(())
    }

    /// De-duplication key used by chain adapters.
    pub fn log_key(&self) -> (B256, u64) {
        (self.tx_hash, self.log_index)
    }
}

/// Render a base-unit amount as an 18-decimal string for logs and responses.
pub fn format_amount(amount: U256) -> String {
    format_units(amount, 18u8).unwrap_or_else(|_| amount.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockValidationError {
    #[error("lock_id is empty")]
    EmptyLockId,

    #[error("source and target chain ids must be non-empty")]
    EmptyChainId,

    #[error("source and target chain are both {0}")]
    SameChain(ChainId),

    #[error("lock amount is zero")]
    ZeroAmount,

    #[error("owner address is zero")]
    ZeroOwner,

    #[error("tx hash is zero")]
    ZeroTxHash,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_lock(lock_id: &str) -> LockEvent {
        LockEvent {
            lock_id: LockId::from(lock_id),
            source_chain_id: ChainId::from("A"),
            target_chain_id: ChainId::from("B"),
            owner_address: Address::repeat_byte(0xAA),
            asset_identifier: Address::ZERO,
            amount: U256::from(100),
            observed_at_block: 42,
            tx_hash: B256::repeat_byte(0x11),
            log_index: 0,
        }
    }

    #[test]
    fn test_format_amount() {
        let one_and_a_half = U256::from(1_500_000_000_000_000_000u128);
        assert_eq!(format_amount(one_and_a_half), "1.500000000000000000");
    }

    #[test]
    fn test_lock_id_derivation_includes_chain() {
        let tx = B256::repeat_byte(0x01);
        let a = LockId::derive(&ChainId::from("A"), tx, 3);
        let b = LockId::derive(&ChainId::from("B"), tx, 3);
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("A:0x0101"));
        assert!(a.as_str().ends_with(":3"));
    }

    #[test]
    fn test_lock_key_deterministic() {
        let id = LockId::from("L1");
        assert_eq!(id.lock_key(), LockId::from("L1").lock_key());
        assert_ne!(id.lock_key(), LockId::from("L2").lock_key());
    }

    #[test]
    fn test_valid_lock_passes() {
        assert!(sample_lock("L1").validate().is_ok());
    }

    #[test]
    fn test_same_chain_rejected() {
        let mut lock = sample_lock("L1");
        lock.target_chain_id = ChainId::from("A");
        assert!(matches!(lock.validate(), Err(LockValidationError::SameChain(_))));
    }

    #[test]
    fn test_zero_amount_rejected() {
        let mut lock = sample_lock("L1");
        lock.amount = U256::ZERO;
        assert_eq!(lock.validate(), Err(LockValidationError::ZeroAmount));
    }

    #[test]
    fn test_blank_lock_id_rejected() {
        let mut lock = sample_lock("  ");
        lock.lock_id = LockId::from("  ");
        assert_eq!(lock.validate(), Err(LockValidationError::EmptyLockId));
    }

    #[test]
    fn test_zero_owner_rejected() {
        let mut lock = sample_lock("L1");
        lock.owner_address = Address::ZERO;
        assert_eq!(lock.validate(), Err(LockValidationError::ZeroOwner));
    }
}
