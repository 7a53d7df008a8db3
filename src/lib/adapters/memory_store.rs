use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::domain::credential::Credential;
use crate::domain::lock::{LockEvent, LockId};
use crate::domain::relay::{RelayPatch, RelayRecord, RelayState};
use crate::ports::store::{ProofStore, PutOutcome, StoreError};

#[derive(Default)]
struct StoreState {
    /// lock_id → serialized event (kept as bytes for identical-payload checks)
    locks: HashMap<LockId, Vec<u8>>,
    records: HashMap<LockId, RelayRecord>,
    credentials: HashMap<String, Credential>,
    cursors: HashMap<String, u64>,
}

/// In-memory implementation of `ProofStore` for testing and the demo.
///
/// A single mutex guards all maps, so every operation (including
/// `consume_and_update`) is atomic. Clones share the same state, which lets a
/// test hand one clone to a coordinator and inspect the other.
#[derive(Clone, Default)]
pub struct InMemoryProofStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryProofStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn check_state(record: &RelayRecord, expected: &RelayState) -> Result<(), StoreError> {
    if record.state != *expected {
        return Err(StoreError::StaleState {
            lock_id: record.lock_id.clone(),
            expected: expected.clone(),
            found: record.state.clone(),
        });
    }
    Ok(())
}

impl ProofStore for InMemoryProofStore {
    async fn put_lock_event(&self, event: &LockEvent) -> Result<PutOutcome, StoreError> {
        let bytes = serde_json::to_vec(event)?;
        let mut state = self.state.lock().await;

        match state.locks.get(&event.lock_id) {
            Some(existing) if *existing == bytes => Ok(PutOutcome::AlreadyPresent),
            Some(_) => Err(StoreError::Duplicate(event.lock_id.clone())),
            None => {
                state.locks.insert(event.lock_id.clone(), bytes);
                Ok(PutOutcome::Inserted)
            }
        }
    }

    async fn get_lock_event(&self, lock_id: &LockId) -> Result<Option<LockEvent>, StoreError> {
        let state = self.state.lock().await;
        state
            .locks
            .get(lock_id)
            .map(|bytes| serde_json::from_slice(bytes))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn get_or_create_relay_record(&self, lock_id: &LockId) -> Result<RelayRecord, StoreError> {
        let mut state = self.state.lock().await;
        if !state.locks.contains_key(lock_id) {
            return Err(StoreError::LockNotFound(lock_id.clone()));
        }
        Ok(state
            .records
            .entry(lock_id.clone())
            .or_insert_with(|| RelayRecord::new(lock_id.clone()))
            .clone())
    }

    async fn get_relay_record(&self, lock_id: &LockId) -> Result<Option<RelayRecord>, StoreError> {
        Ok(self.state.lock().await.records.get(lock_id).cloned())
    }

    async fn update_relay_record(
        &self,
        lock_id: &LockId,
        expected: &RelayState,
        new_state: RelayState,
        patch: RelayPatch,
    ) -> Result<RelayRecord, StoreError> {
        let mut state = self.state.lock().await;
        let record = state
            .records
            .get_mut(lock_id)
            .ok_or_else(|| StoreError::RecordNotFound(lock_id.clone()))?;
        check_state(record, expected)?;
        record.apply(new_state, &patch);
        Ok(record.clone())
    }

    async fn list_pending(&self, filter: Option<&RelayState>) -> Result<Vec<RelayRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut records: Vec<RelayRecord> = state
            .records
            .values()
            .filter(|r| !r.is_terminal())
            .filter(|r| filter.map_or(true, |s| r.state == *s))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.lock_id.cmp(&b.lock_id));
        Ok(records)
    }

    async fn list_by_label(&self, label: &str) -> Result<Vec<RelayRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut records: Vec<RelayRecord> = state
            .records
            .values()
            .filter(|r| r.state.matches_label(label))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.lock_id.cmp(&b.lock_id));
        Ok(records)
    }

    async fn put_credential(&self, credential: &Credential) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state
            .credentials
            .get(&credential.credential_id)
            .is_some_and(|existing| existing.consumed)
        {
            return Err(StoreError::AlreadyConsumed(credential.credential_id.clone()));
        }
        state
            .credentials
            .insert(credential.credential_id.clone(), credential.clone());
        Ok(())
    }

    async fn get_credential(&self, credential_id: &str) -> Result<Option<Credential>, StoreError> {
        Ok(self.state.lock().await.credentials.get(credential_id).cloned())
    }

    async fn consume_and_update(
        &self,
        lock_id: &LockId,
        credential_id: &str,
        expected: &RelayState,
        new_state: RelayState,
        patch: RelayPatch,
    ) -> Result<RelayRecord, StoreError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let record = state
            .records
            .get_mut(lock_id)
            .ok_or_else(|| StoreError::RecordNotFound(lock_id.clone()))?;
        check_state(record, expected)?;

        let credential = state
            .credentials
            .get_mut(credential_id)
            .ok_or_else(|| StoreError::CredentialNotFound(credential_id.to_string()))?;
        if credential.consumed {
            return Err(StoreError::AlreadyConsumed(credential_id.to_string()));
        }

        credential.consumed = true;
        record.apply(new_state, &patch);
        Ok(record.clone())
    }

    async fn get_cursor(&self, route: &str) -> Result<Option<u64>, StoreError> {
        Ok(self.state.lock().await.cursors.get(route).copied())
    }

    async fn set_cursor(&self, route: &str, block: u64) -> Result<(), StoreError> {
        self.state.lock().await.cursors.insert(route.to_string(), block);
        Ok(())
    }
}
