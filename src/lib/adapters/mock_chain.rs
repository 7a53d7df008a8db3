use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{keccak256, Bytes, B256};
use tokio::sync::Mutex;

use crate::domain::credential::Credential;
use crate::domain::lock::{ChainId, LockEvent, LockId};
use crate::ports::chain::{ChainError, ChainPort};
use crate::ports::{ChainCapability, Finality, LockBatch, SignedUnlock};

#[derive(Default)]
struct MockChainState {
    head: u64,
    locks: Vec<LockEvent>,
    /// Outcomes handed out when a pending unlock is mined, front first. Empty
    /// means `Confirmed` at the current head.
    finality: VecDeque<Finality>,
    next_nonce: u64,
    /// tx hash -> lock id for every signed unlock
    signed: HashMap<B256, LockId>,
    /// Accepted by the node, mined or not
    broadcast: HashSet<B256>,
    /// Mined and successful; what the bridge's `unlocked` view and
    /// `AssetUnlocked` logs expose
    unlocked: HashMap<LockId, B256>,
    reverted: HashSet<B256>,
    /// Signed transactions whose nonce another transaction took
    nonce_taken: HashSet<B256>,
    take_nonces: u32,
    submissions: Vec<LockId>,
    fail_broadcasts: u32,
    lose_broadcast_responses: u32,
    fail_watches: u32,
    stalled: bool,
}

/// In-memory `ChainPort` for coordinator tests and the demo.
///
/// Broadcast unlocks stay pending until `wait_for_finality` mines them. A
/// second unlock for an already unlocked lock reverts, as on the bridge.
/// Clones share state, so a test can keep a handle for injecting locks and
/// inspecting submissions while the coordinator owns another.
#[derive(Clone)]
pub struct MockChainPort {
    chain_id: ChainId,
    capability: ChainCapability,
    state: Arc<Mutex<MockChainState>>,
}

impl MockChainPort {
    pub fn new(chain_id: impl Into<String>, capability: ChainCapability) -> Self {
        Self {
            chain_id: ChainId::new(chain_id),
            capability,
            state: Arc::new(Mutex::new(MockChainState::default())),
        }
    }

    /// Simulate a finalized `AssetLocked` log; the head advances to its block.
    pub async fn push_lock(&self, event: LockEvent) {
        let mut state = self.state.lock().await;
        state.head = state.head.max(event.observed_at_block);
        state.locks.push(event);
    }

    /// Queue the outcome of the next mined unlock.
    pub async fn push_finality(&self, outcome: Finality) {
        self.state.lock().await.finality.push_back(outcome);
    }

    /// Make the next `n` broadcasts fail with a transient error. The node
    /// does not see the transaction.
    pub async fn fail_next_submissions(&self, n: u32) {
        self.state.lock().await.fail_broadcasts = n;
    }

    /// Make the next `n` broadcasts reach the node but fail on the way back,
    /// leaving the transaction pending.
    pub async fn lose_next_broadcast_responses(&self, n: u32) {
        self.state.lock().await.lose_broadcast_responses = n;
    }

    /// Make the next `n` polls fail with an RPC error.
    pub async fn fail_next_watches(&self, n: u32) {
        self.state.lock().await.fail_watches = n;
    }

    /// Let another transaction take the nonce of the next `n` signed unlocks,
    /// so they can never be mined.
    pub async fn take_next_nonces(&self, n: u32) {
        self.state.lock().await.take_nonces = n;
    }

    /// While stalled, every chain call hangs like an unresponsive node.
    pub async fn set_stalled(&self, stalled: bool) {
        self.state.lock().await.stalled = stalled;
    }

    /// Lock ids of every distinct unlock transaction the node accepted, in order.
    pub async fn submissions(&self) -> Vec<LockId> {
        self.state.lock().await.submissions.clone()
    }

    pub async fn submission_count(&self) -> usize {
        self.state.lock().await.submissions.len()
    }

    async fn stall_point(&self) {
        let stalled = self.state.lock().await.stalled;
        if stalled {
            std::future::pending::<()>().await;
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
}

impl ChainPort for MockChainPort {
    fn chain_id(&self) -> &ChainId {
        &self.chain_id
    }

    fn capability(&self) -> ChainCapability {
        self.capability
    }

    async fn watch_locks(&self, from_block: u64) -> Result<LockBatch, ChainError> {
        if !self.capability.can_lock() {
            return Err(ChainError::Unsupported {
                chain: self.chain_id.clone(),
                operation: "watch_locks",
            });
        }
        self.stall_point().await;

        let mut state = self.state.lock().await;
        if state.fail_watches > 0 {
            state.fail_watches -= 1;
            return Err(ChainError::Rpc("mock: watch failure".into()));
        }
        if from_block > state.head {
            return Ok(LockBatch {
                events: Vec::new(),
                next_block: from_block,
            });
        }

        let mut seen = HashSet::new();
        let mut events: Vec<LockEvent> = state
            .locks
            .iter()
            .filter(|e| e.observed_at_block >= from_block && e.observed_at_block <= state.head)
            .filter(|e| seen.insert(e.log_key()))
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.observed_at_block, e.log_index));

        Ok(LockBatch {
            events,
            next_block: state.head + 1,
        })
    }

    async fn sign_unlock(
        &self,
        event: &LockEvent,
        credential: &Credential,
    ) -> Result<SignedUnlock, ChainError> {
        self.ensure_unlock()?;
        self.stall_point().await;

        let mut state = self.state.lock().await;
        let nonce = state.next_nonce;
        state.next_nonce += 1;
        let raw = Bytes::from(
            format!("{}:unlock:{}:{nonce}:{}", self.chain_id, event.lock_id, credential.digest())
                .into_bytes(),
        );
        let tx_hash = keccak256(&raw);
        state.signed.insert(tx_hash, event.lock_id.clone());
        if state.take_nonces > 0 {
            state.take_nonces -= 1;
            state.nonce_taken.insert(tx_hash);
        }
        Ok(SignedUnlock { tx_hash, raw })
    }

    async fn broadcast_unlock(&self, signed: &SignedUnlock) -> Result<(), ChainError> {
        self.ensure_unlock()?;
        self.stall_point().await;

        let mut state = self.state.lock().await;
        let Some(lock_id) = state.signed.get(&signed.tx_hash).cloned() else {
            return Err(ChainError::Submission(format!(
                "mock: unknown transaction {}",
                signed.tx_hash
            )));
        };
        if state.broadcast.contains(&signed.tx_hash) {
            return Ok(());
        }
        if state.nonce_taken.contains(&signed.tx_hash) {
            return Err(ChainError::NonceConsumed(signed.tx_hash));
        }
        if state.fail_broadcasts > 0 {
            state.fail_broadcasts -= 1;
            return Err(ChainError::Submission("mock: broadcast failed".into()));
        }

        state.broadcast.insert(signed.tx_hash);
        state.submissions.push(lock_id);
        if state.lose_broadcast_responses > 0 {
            state.lose_broadcast_responses -= 1;
            return Err(ChainError::Rpc("mock: connection reset after send".into()));
        }
        Ok(())
    }

    async fn wait_for_finality(
        &self,
        tx_hash: B256,
        _confirmations: u64,
        _timeout: Duration,
    ) -> Result<Finality, ChainError> {
        self.stall_point().await;

        let mut state = self.state.lock().await;
        let lock_id = state
            .signed
            .get(&tx_hash)
            .cloned()
            .ok_or_else(|| ChainError::Rpc(format!("mock: unknown transaction {tx_hash}")))?;
        let head = state.head;

        if state.reverted.contains(&tx_hash) {
            return Ok(Finality::Reverted);
        }
        if state.unlocked.get(&lock_id) == Some(&tx_hash) {
            return Ok(Finality::Confirmed { block: head });
        }
        if !state.broadcast.contains(&tx_hash) {
            return Ok(Finality::Timeout);
        }

        // Mine the pending transaction.
        let outcome = match state.finality.pop_front() {
            Some(Finality::Timeout) => return Ok(Finality::Timeout),
            Some(Finality::Reverted) => Finality::Reverted,
            _ if state.unlocked.contains_key(&lock_id) => Finality::Reverted,
            _ => Finality::Confirmed { block: head },
        };
        match outcome {
            Finality::Reverted => {
                state.reverted.insert(tx_hash);
            }
            _ => {
                state.unlocked.insert(lock_id, tx_hash);
            }
        }
        Ok(outcome)
    }

    async fn find_unlock(&self, lock_id: &LockId) -> Result<Option<B256>, ChainError> {
        self.stall_point().await;
        Ok(self.state.lock().await.unlocked.get(lock_id).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::lock::tests::sample_lock;

    fn credential() -> Credential {
        Credential {
            credential_id: "cred-1".into(),
            lock_id: LockId::from("L1"),
            subject_identity: "did:ethr:0xaa".into(),
            issued_at: 0,
            expires_at: u64::MAX,
            consumed: false,
        }
    }

    #[tokio::test]
    async fn test_watch_returns_ordered_deduplicated_batch() {
        let chain = MockChainPort::new("A", ChainCapability::Both);
        let mut second = sample_lock("L2");
        second.observed_at_block = 50;
        second.tx_hash = B256::repeat_byte(0x22);
        let first = sample_lock("L1");

        chain.push_lock(second.clone()).await;
        chain.push_lock(first.clone()).await;
        chain.push_lock(first.clone()).await;

        let batch = chain.watch_locks(0).await.unwrap();
        assert_eq!(batch.events, vec![first, second]);
        assert_eq!(batch.next_block, 51);

        let empty = chain.watch_locks(51).await.unwrap();
        assert!(empty.events.is_empty());
        assert_eq!(empty.next_block, 51);
    }

    #[tokio::test]
    async fn test_capability_is_enforced() {
        let lock_only = MockChainPort::new("A", ChainCapability::Lock);
        let result = lock_only.submit_unlock(&sample_lock("L1"), &credential()).await;
        assert!(matches!(result, Err(ChainError::Unsupported { .. })));

        let unlock_only = MockChainPort::new("B", ChainCapability::Unlock);
        assert!(matches!(
            unlock_only.watch_locks(0).await,
            Err(ChainError::Unsupported { .. })
        ));
    }

    #[tokio::test]
    async fn test_pending_unlock_is_found_only_once_mined() {
        let chain = MockChainPort::new("B", ChainCapability::Both);
        let lock = sample_lock("L1");

        let tx = chain.submit_unlock(&lock, &credential()).await.unwrap();
        assert_eq!(chain.find_unlock(&lock.lock_id).await.unwrap(), None);

        let outcome = chain.wait_for_finality(tx, 1, Duration::from_secs(1)).await.unwrap();
        assert!(matches!(outcome, Finality::Confirmed { .. }));
        assert_eq!(chain.find_unlock(&lock.lock_id).await.unwrap(), Some(tx));
    }

    #[tokio::test]
    async fn test_reverted_unlock_is_not_found() {
        let chain = MockChainPort::new("B", ChainCapability::Both);
        let lock = sample_lock("L1");
        chain.push_finality(Finality::Reverted).await;

        let tx = chain.submit_unlock(&lock, &credential()).await.unwrap();
        let outcome = chain.wait_for_finality(tx, 1, Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome, Finality::Reverted);
        assert_eq!(chain.find_unlock(&lock.lock_id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_second_unlock_of_same_lock_reverts() {
        let chain = MockChainPort::new("B", ChainCapability::Both);
        let lock = sample_lock("L1");

        let first = chain.submit_unlock(&lock, &credential()).await.unwrap();
        let second = chain.submit_unlock(&lock, &credential()).await.unwrap();
        assert_ne!(first, second);

        let timeout = Duration::from_secs(1);
        assert!(matches!(
            chain.wait_for_finality(first, 1, timeout).await.unwrap(),
            Finality::Confirmed { .. }
        ));
        assert_eq!(
            chain.wait_for_finality(second, 1, timeout).await.unwrap(),
            Finality::Reverted
        );
    }

    #[tokio::test]
    async fn test_rebroadcast_of_known_transaction_is_accepted() {
        let chain = MockChainPort::new("B", ChainCapability::Both);
        chain.lose_next_broadcast_responses(1).await;
        let signed = chain.sign_unlock(&sample_lock("L1"), &credential()).await.unwrap();

        assert!(chain.broadcast_unlock(&signed).await.unwrap_err().is_transient());
        chain.broadcast_unlock(&signed).await.unwrap();
        assert_eq!(chain.submission_count().await, 1);
    }

    #[tokio::test]
    async fn test_injected_submission_failure_is_transient() {
        let chain = MockChainPort::new("B", ChainCapability::Both);
        chain.fail_next_submissions(1).await;

        let err = chain
            .submit_unlock(&sample_lock("L1"), &credential())
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(chain.submission_count().await, 0);
        assert!(chain.submit_unlock(&sample_lock("L1"), &credential()).await.is_ok());
        assert_eq!(chain.submission_count().await, 1);
    }

    #[tokio::test]
    async fn test_stalled_chain_hangs() {
        let chain = MockChainPort::new("B", ChainCapability::Both);
        chain.set_stalled(true).await;
        let lock_id = LockId::from("L1");
        let lookup = chain.find_unlock(&lock_id);
        assert!(tokio::time::timeout(Duration::from_millis(20), lookup).await.is_err());
    }
}
