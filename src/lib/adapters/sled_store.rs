use std::path::Path;

use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};

use crate::domain::credential::Credential;
use crate::domain::lock::{LockEvent, LockId};
use crate::domain::relay::{RelayPatch, RelayRecord, RelayState};
use crate::ports::store::{ProofStore, PutOutcome, StoreError};

const TREE_LOCKS: &str = "locks";
const TREE_RECORDS: &str = "relay_records";
const TREE_CREDENTIALS: &str = "credentials";
const TREE_CURSORS: &str = "cursors";

/// File-backed `ProofStore` on top of sled.
///
/// Lock events are inserted with compare-and-swap against an empty slot;
/// relay updates run as sled transactions that re-read the record and check
/// the expected state before writing. Every write is flushed before the call
/// returns, so a record acknowledged to the coordinator survives a crash.
#[derive(Clone)]
pub struct SledProofStore {
    db: Db,
    locks: Tree,
    records: Tree,
    credentials: Tree,
    cursors: Tree,
}

impl SledProofStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Internal(format!("cannot create {}: {e}", parent.display()))
                })?;
            }
        }
        let db = sled::open(path).map_err(storage)?;
        Self::from_db(db)
    }

    /// Temporary store removed on drop (for testing).
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open().map_err(storage)?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self, StoreError> {
        Ok(Self {
            locks: db.open_tree(TREE_LOCKS).map_err(storage)?,
            records: db.open_tree(TREE_RECORDS).map_err(storage)?,
            credentials: db.open_tree(TREE_CREDENTIALS).map_err(storage)?,
            cursors: db.open_tree(TREE_CURSORS).map_err(storage)?,
            db,
        })
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(storage)?;
        Ok(())
    }

    fn scan_records(&self) -> Result<Vec<RelayRecord>, StoreError> {
        self.records
            .iter()
            .values()
            .map(|value| {
                let bytes = value.map_err(storage)?;
                Ok(serde_json::from_slice(&bytes)?)
            })
            .collect()
    }
}

fn storage(e: sled::Error) -> StoreError {
    StoreError::Internal(e.to_string())
}

fn from_tx(e: TransactionError<StoreError>) -> StoreError {
    match e {
        TransactionError::Abort(inner) => inner,
        TransactionError::Storage(inner) => storage(inner),
    }
}

fn abort(e: impl Into<StoreError>) -> ConflictableTransactionError<StoreError> {
    ConflictableTransactionError::Abort(e.into())
}

impl ProofStore for SledProofStore {
    async fn put_lock_event(&self, event: &LockEvent) -> Result<PutOutcome, StoreError> {
        let bytes = serde_json::to_vec(event)?;
        let key = event.lock_id.as_str().as_bytes();

        let outcome = match self
            .locks
            .compare_and_swap(key, None::<&[u8]>, Some(bytes.clone()))
            .map_err(storage)?
        {
            Ok(()) => PutOutcome::Inserted,
            Err(conflict) => match conflict.current {
                Some(current) if current.as_ref() == bytes.as_slice() => PutOutcome::AlreadyPresent,
                _ => return Err(StoreError::Duplicate(event.lock_id.clone())),
            },
        };

        self.flush()?;
        Ok(outcome)
    }

    async fn get_lock_event(&self, lock_id: &LockId) -> Result<Option<LockEvent>, StoreError> {
        match self.locks.get(lock_id.as_str()).map_err(storage)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn get_or_create_relay_record(&self, lock_id: &LockId) -> Result<RelayRecord, StoreError> {
        if !self.locks.contains_key(lock_id.as_str()).map_err(storage)? {
            return Err(StoreError::LockNotFound(lock_id.clone()));
        }

        let fresh = RelayRecord::new(lock_id.clone());
        let bytes = serde_json::to_vec(&fresh)?;

        match self
            .records
            .compare_and_swap(lock_id.as_str(), None::<&[u8]>, Some(bytes))
            .map_err(storage)?
        {
            Ok(()) => {
                self.flush()?;
                Ok(fresh)
            }
            Err(conflict) => {
                let current = conflict
                    .current
                    .ok_or_else(|| StoreError::Internal("record vanished during create".into()))?;
                Ok(serde_json::from_slice(&current)?)
            }
        }
    }

    async fn get_relay_record(&self, lock_id: &LockId) -> Result<Option<RelayRecord>, StoreError> {
        match self.records.get(lock_id.as_str()).map_err(storage)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn update_relay_record(
        &self,
        lock_id: &LockId,
        expected: &RelayState,
        new_state: RelayState,
        patch: RelayPatch,
    ) -> Result<RelayRecord, StoreError> {
        let key = lock_id.as_str().as_bytes();

        let updated = self
            .records
            .transaction(|records| {
                let raw = records
                    .get(key)?
                    .ok_or_else(|| abort(StoreError::RecordNotFound(lock_id.clone())))?;
                let mut record: RelayRecord = serde_json::from_slice(&raw).map_err(abort)?;
                if record.state != *expected {
                    return Err(abort(StoreError::StaleState {
                        lock_id: lock_id.clone(),
                        expected: expected.clone(),
                        found: record.state.clone(),
                    }));
                }
                record.apply(new_state.clone(), &patch);
                records.insert(key, serde_json::to_vec(&record).map_err(abort)?)?;
                Ok(record)
            })
            .map_err(from_tx)?;

        self.flush()?;
        Ok(updated)
    }

    async fn list_pending(&self, filter: Option<&RelayState>) -> Result<Vec<RelayRecord>, StoreError> {
        Ok(self
            .scan_records()?
            .into_iter()
            .filter(|r| !r.is_terminal())
            .filter(|r| filter.map_or(true, |s| r.state == *s))
            .collect())
    }

    async fn list_by_label(&self, label: &str) -> Result<Vec<RelayRecord>, StoreError> {
        Ok(self
            .scan_records()?
            .into_iter()
            .filter(|r| r.state.matches_label(label))
            .collect())
    }

    async fn put_credential(&self, credential: &Credential) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(credential)?;
        let key = credential.credential_id.as_bytes();

        self.credentials
            .transaction(|credentials| {
                if let Some(raw) = credentials.get(key)? {
                    let existing: Credential = serde_json::from_slice(&raw).map_err(abort)?;
                    if existing.consumed {
                        return Err(abort(StoreError::AlreadyConsumed(
                            credential.credential_id.clone(),
                        )));
                    }
                }
                credentials.insert(key, bytes.as_slice())?;
                Ok(())
            })
            .map_err(from_tx)?;
        self.flush()
    }

    async fn get_credential(&self, credential_id: &str) -> Result<Option<Credential>, StoreError> {
        match self.credentials.get(credential_id).map_err(storage)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn consume_and_update(
        &self,
        lock_id: &LockId,
        credential_id: &str,
        expected: &RelayState,
        new_state: RelayState,
        patch: RelayPatch,
    ) -> Result<RelayRecord, StoreError> {
        let record_key = lock_id.as_str().as_bytes();
        let credential_key = credential_id.as_bytes();

        let updated = (&self.records, &self.credentials)
            .transaction(|(records, credentials)| {
                let raw = records
                    .get(record_key)?
                    .ok_or_else(|| abort(StoreError::RecordNotFound(lock_id.clone())))?;
                let mut record: RelayRecord = serde_json::from_slice(&raw).map_err(abort)?;
                if record.state != *expected {
                    return Err(abort(StoreError::StaleState {
                        lock_id: lock_id.clone(),
                        expected: expected.clone(),
                        found: record.state.clone(),
                    }));
                }

                let raw = credentials.get(credential_key)?.ok_or_else(|| {
                    abort(StoreError::CredentialNotFound(credential_id.to_string()))
                })?;
                let mut credential: Credential = serde_json::from_slice(&raw).map_err(abort)?;
                if credential.consumed {
                    return Err(abort(StoreError::AlreadyConsumed(credential_id.to_string())));
                }

                credential.consumed = true;
                record.apply(new_state.clone(), &patch);
                credentials.insert(credential_key, serde_json::to_vec(&credential).map_err(abort)?)?;
                records.insert(record_key, serde_json::to_vec(&record).map_err(abort)?)?;
                Ok(record)
            })
            .map_err(from_tx)?;

        self.flush()?;
        Ok(updated)
    }

    async fn get_cursor(&self, route: &str) -> Result<Option<u64>, StoreError> {
        match self.cursors.get(route).map_err(storage)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| StoreError::Internal(format!("corrupt cursor for {route}")))?;
                Ok(Some(u64::from_be_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    async fn set_cursor(&self, route: &str, block: u64) -> Result<(), StoreError> {
        self.cursors
            .insert(route, &block.to_be_bytes()[..])
            .map_err(storage)?;
        self.flush()
    }
}
