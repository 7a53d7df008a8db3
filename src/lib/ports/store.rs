use std::future::Future;

use crate::domain::credential::Credential;
use crate::domain::lock::{LockEvent, LockId};
use crate::domain::relay::{RelayPatch, RelayRecord, RelayState};

/// Outcome of recording a lock event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    /// The same lock was already recorded with byte-identical contents.
    AlreadyPresent,
}

/// Port for durable storage of lock events, relay records, and credentials.
///
/// Every relay transition goes through `update_relay_record` (or
/// `consume_and_update`), which only succeeds if the persisted state still
/// equals `expected`. That optimistic check is what keeps a single writer per
/// lock and lets the coordinator resume from persisted state after a crash.
///
/// Implementations:
/// - `SledProofStore` (file-backed)
/// - `InMemoryProofStore` (for testing)
pub trait ProofStore: Send + Sync {
    /// Record a lock event. Re-recording identical bytes is a no-op;
    /// different bytes under the same lock id fail with `Duplicate`.
    fn put_lock_event(
        &self,
        event: &LockEvent,
    ) -> impl Future<Output = Result<PutOutcome, StoreError>> + Send;

    fn get_lock_event(
        &self,
        lock_id: &LockId,
    ) -> impl Future<Output = Result<Option<LockEvent>, StoreError>> + Send;

    /// Return the relay record for `lock_id`, creating it in `Observed` if
    /// absent. Concurrent callers all observe the same record.
    fn get_or_create_relay_record(
        &self,
        lock_id: &LockId,
    ) -> impl Future<Output = Result<RelayRecord, StoreError>> + Send;

    fn get_relay_record(
        &self,
        lock_id: &LockId,
    ) -> impl Future<Output = Result<Option<RelayRecord>, StoreError>> + Send;

    /// Compare-and-set the record's state, applying `patch`.
    fn update_relay_record(
        &self,
        lock_id: &LockId,
        expected: &RelayState,
        new_state: RelayState,
        patch: RelayPatch,
    ) -> impl Future<Output = Result<RelayRecord, StoreError>> + Send;

    /// Non-terminal records, optionally restricted to one state.
    fn list_pending(
        &self,
        state: Option<&RelayState>,
    ) -> impl Future<Output = Result<Vec<RelayRecord>, StoreError>> + Send;

    /// All records in terminal or non-terminal states whose label matches.
    fn list_by_label(
        &self,
        label: &str,
    ) -> impl Future<Output = Result<Vec<RelayRecord>, StoreError>> + Send;

    /// Store an issued credential. A credential that is already consumed is
    /// never overwritten; that case fails with `AlreadyConsumed`.
    fn put_credential(
        &self,
        credential: &Credential,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn get_credential(
        &self,
        credential_id: &str,
    ) -> impl Future<Output = Result<Option<Credential>, StoreError>> + Send;

    /// Mark the credential consumed and transition the relay record in one
    /// atomic step.
    fn consume_and_update(
        &self,
        lock_id: &LockId,
        credential_id: &str,
        expected: &RelayState,
        new_state: RelayState,
        patch: RelayPatch,
    ) -> impl Future<Output = Result<RelayRecord, StoreError>> + Send;

    /// Last block scanned by the watch loop for `route`.
    fn get_cursor(
        &self,
        route: &str,
    ) -> impl Future<Output = Result<Option<u64>, StoreError>> + Send;

    fn set_cursor(
        &self,
        route: &str,
        block: u64,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("lock {0} already recorded with different contents")]
    Duplicate(LockId),

    #[error("stale state for {lock_id}: expected {expected}, found {found}")]
    StaleState {
        lock_id: LockId,
        expected: RelayState,
        found: RelayState,
    },

    #[error("no lock event recorded for {0}")]
    LockNotFound(LockId),

    #[error("no relay record for {0}")]
    RecordNotFound(LockId),

    #[error("credential not found: {0}")]
    CredentialNotFound(String),

    #[error("credential {0} already consumed")]
    AlreadyConsumed(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal store error: {0}")]
    Internal(String),
}
