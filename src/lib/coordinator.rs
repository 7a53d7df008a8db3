use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use alloy::primitives::B256;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::bridge::{BridgeSettings, CredentialBridge, IssuanceError};
use crate::config::{RelayConfig, RouteConfig};
use crate::domain::credential::{Credential, Verification};
use crate::domain::lock::{format_amount, ChainId, LockEvent, LockId, LockValidationError};
use crate::domain::relay::{FailureReason, RelayPatch, RelayRecord, RelayState, RelayStep};
use crate::domain::unix_now;
use crate::ports::chain::{ChainError, ChainPort};
use crate::ports::identity::IdentityAgent;
use crate::ports::store::{ProofStore, PutOutcome, StoreError};
use crate::ports::{Finality, LockBatch, SignedUnlock};

/// Consecutive optimistic-update conflicts tolerated before `drive` gives up.
const MAX_CONFLICT_RETRIES: u32 = 16;

/// How the coordinator reacts to a failed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retry the step with backoff.
    TransientNetwork,
    /// Malformed input; fail without retry.
    Validation,
    /// Credential refused or unusable; fail and surface to the operator.
    Credential,
    /// Unlock reverted; terminal.
    ChainFinality,
    /// Another writer moved the record; re-read and re-run the step.
    ConcurrencyConflict,
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("invalid lock event: {0}")]
    InvalidLock(#[from] LockValidationError),

    #[error("no chain configured for {0}")]
    UnknownChain(ChainId),

    #[error("no route from {source_chain} to {target_chain}")]
    NoRoute {
        source_chain: ChainId,
        target_chain: ChainId,
    },

    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("credential issuance failed: {0}")]
    Issuance(#[from] IssuanceError),

    #[error("credential rejected: {0:?}")]
    CredentialRejected(Verification),

    #[error("unlock transaction {0} reverted")]
    Reverted(B256),

    #[error("unlock transaction {0} not final before timeout")]
    FinalityTimeout(B256),

    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: RelayState, to: RelayState },

    #[error("no relay record for {0}")]
    NotFound(LockId),

    #[error("relay {lock_id} cannot be retried from {state}")]
    NotRetryable { lock_id: LockId, state: RelayState },

    #[error("relay {lock_id} is not awaiting a credential (state {state})")]
    NotAwaitingCredential { lock_id: LockId, state: RelayState },

    #[error("relay {0} is being processed")]
    Busy(LockId),
}

fn store_kind(e: &StoreError) -> ErrorKind {
    match e {
        StoreError::StaleState { .. } => ErrorKind::ConcurrencyConflict,
        StoreError::Internal(_) => ErrorKind::TransientNetwork,
        StoreError::CredentialNotFound(_) | StoreError::AlreadyConsumed(_) => ErrorKind::Credential,
        _ => ErrorKind::Validation,
    }
}

impl CoordinatorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoordinatorError::Chain(e) if e.is_transient() => ErrorKind::TransientNetwork,
            CoordinatorError::Store(e) | CoordinatorError::Issuance(IssuanceError::Store(e)) => {
                store_kind(e)
            }
            CoordinatorError::Issuance(IssuanceError::InvalidLock(_)) => ErrorKind::Validation,
            CoordinatorError::Issuance(e) if e.is_retryable() => ErrorKind::TransientNetwork,
            CoordinatorError::Issuance(_) | CoordinatorError::CredentialRejected(_) => {
                ErrorKind::Credential
            }
            CoordinatorError::Reverted(_) => ErrorKind::ChainFinality,
            CoordinatorError::FinalityTimeout(_) => ErrorKind::TransientNetwork,
            CoordinatorError::Busy(_) => ErrorKind::ConcurrencyConflict,
            _ => ErrorKind::Validation,
        }
    }

    /// Reason recorded when this error fails a relay.
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            CoordinatorError::UnknownChain(_)
            | CoordinatorError::NoRoute { .. }
            | CoordinatorError::Chain(ChainError::Unsupported { .. }) => FailureReason::Unroutable,
            CoordinatorError::CredentialRejected(outcome) => FailureReason::CredentialRejected {
                outcome: *outcome,
            },
            CoordinatorError::Store(StoreError::AlreadyConsumed(_))
            | CoordinatorError::Issuance(IssuanceError::Store(StoreError::AlreadyConsumed(_))) => {
                FailureReason::CredentialRejected {
                    outcome: Verification::AlreadyConsumed,
                }
            }
            other => match other.kind() {
                ErrorKind::Credential => FailureReason::CredentialRejected {
                    outcome: Verification::Invalid,
                },
                ErrorKind::ChainFinality => FailureReason::Reverted,
                ErrorKind::TransientNetwork => FailureReason::RetriesExhausted,
                ErrorKind::Validation | ErrorKind::ConcurrencyConflict => FailureReason::Invalid,
            },
        }
    }
}

/// Relay pipeline tuning, usually built from `RelayConfig`.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub finality_confirmations: u64,
    pub max_retry_attempts: u32,
    pub worker_pool_size: usize,
    pub poll_interval: Duration,
    pub finality_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Deadline for each chain call other than the finality wait.
    pub rpc_timeout: Duration,
    pub sweep_interval: Duration,
    pub auto_present: bool,
}

impl From<&RelayConfig> for CoordinatorSettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            finality_confirmations: config.finality_confirmations,
            max_retry_attempts: config.max_retry_attempts,
            worker_pool_size: config.worker_pool_size,
            poll_interval: config.poll_interval,
            finality_timeout: config.finality_timeout,
            backoff_base: config.backoff_base,
            backoff_max: config.backoff_max,
            rpc_timeout: config.rpc_timeout,
            sweep_interval: config.sweep_interval,
            auto_present: config.auto_present,
        }
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

/// Outcome of one `advance` call that did not fail.
enum Progress {
    /// The record moved; read it again and continue.
    Advanced,
    /// No step left to run in this state.
    Stopped,
}

/// Lock ids currently driven by a task of this process.
#[derive(Default)]
struct InFlight(Mutex<HashSet<LockId>>);

impl InFlight {
    fn set(&self) -> MutexGuard<'_, HashSet<LockId>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn contains(&self, lock_id: &LockId) -> bool {
        self.set().contains(lock_id)
    }

    fn claim(&self, lock_id: &LockId) -> Option<Claim<'_>> {
        self.set().insert(lock_id.clone()).then(|| Claim {
            owner: self,
            lock_id: lock_id.clone(),
        })
    }
}

struct Claim<'a> {
    owner: &'a InFlight,
    lock_id: LockId,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.owner.set().remove(&self.lock_id);
    }
}

/// Drives every lock through
/// `Observed -> CredentialRequested -> CredentialIssued -> CredentialVerified
/// -> UnlockSubmitted -> UnlockConfirmed`.
///
/// Generic over `ChainPort` (one adapter per chain), `ProofStore` (durable
/// state) and `IdentityAgent` (credential issuance). Every transition is a
/// compare-and-set on the persisted record, so the coordinator holds no relay
/// state in memory and can resume anything after a restart.
pub struct RelayCoordinator<C: ChainPort, S: ProofStore, A: IdentityAgent> {
    /// chain_id → chain port
    chains: HashMap<ChainId, C>,
    routes: Vec<RouteConfig>,
    store: Arc<S>,
    bridge: CredentialBridge<A, S>,
    settings: CoordinatorSettings,
    in_flight: InFlight,
    workers: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl<C: ChainPort, S: ProofStore, A: IdentityAgent> RelayCoordinator<C, S, A> {
    pub fn new(
        chains: Vec<C>,
        routes: Vec<RouteConfig>,
        store: S,
        agent: A,
        bridge: BridgeSettings,
        settings: CoordinatorSettings,
    ) -> Self {
        let store = Arc::new(store);
        Self {
            chains: chains
                .into_iter()
                .map(|chain| (chain.chain_id().clone(), chain))
                .collect(),
            routes,
            bridge: CredentialBridge::new(agent, Arc::clone(&store), bridge),
            store,
            workers: Arc::new(Semaphore::new(settings.worker_pool_size.max(1))),
            settings,
            in_flight: InFlight::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    /// Persist a lock event and its relay record without driving it.
    pub async fn record_lock(&self, event: &LockEvent) -> Result<RelayRecord, CoordinatorError> {
        if event.lock_id.as_str().trim().is_empty() {
            return Err(LockValidationError::EmptyLockId.into());
        }

        match self.store.put_lock_event(event).await? {
            PutOutcome::Inserted => tracing::info!(
                lock_id = %event.lock_id,
                source = %event.source_chain_id,
                target = %event.target_chain_id,
                amount = %format_amount(event.amount),
                block = event.observed_at_block,
                "lock observed"
            ),
            PutOutcome::AlreadyPresent => {
                tracing::debug!(lock_id = %event.lock_id, "lock already recorded")
            }
        }

        Ok(self.store.get_or_create_relay_record(&event.lock_id).await?)
    }

    /// Record `event` and drive its relay as far as it can go.
    ///
    /// Replaying a lock whose relay already finished returns the finished
    /// record without touching it.
    pub async fn handle_lock(&self, event: &LockEvent) -> Result<RelayRecord, CoordinatorError> {
        let record = self.record_lock(event).await?;
        if record.is_terminal() {
            tracing::debug!(lock_id = %event.lock_id, state = %record.state, "replay of finished relay");
            return Ok(record);
        }
        self.drive(&event.lock_id).await
    }

    /// Run steps for `lock_id` until the relay is terminal, parked waiting for
    /// a credential presentation, or shutdown is requested. Shutdown abandons
    /// the running step; its persisted state is resumed later.
    ///
    /// If another task of this process is already driving the lock, returns
    /// the current record immediately.
    pub async fn drive(&self, lock_id: &LockId) -> Result<RelayRecord, CoordinatorError> {
        let Some(_claim) = self.in_flight.claim(lock_id) else {
            tracing::debug!(%lock_id, "relay already in flight");
            return self.load_record(lock_id).await;
        };

        let mut conflicts = 0;
        loop {
            let record = self.load_record(lock_id).await?;
            if record.is_terminal() || self.is_parked(&record) || self.cancel.is_cancelled() {
                return Ok(record);
            }

            let step = tokio::select! {
                outcome = self.advance(&record) => outcome,
                _ = self.cancel.cancelled() => return self.load_record(lock_id).await,
            };
            let err = match step {
                Ok(Progress::Advanced) => {
                    conflicts = 0;
                    continue;
                }
                Ok(Progress::Stopped) => return self.load_record(lock_id).await,
                Err(err) => err,
            };

            let outcome = if err.kind() == ErrorKind::ConcurrencyConflict {
                Err(err)
            } else {
                self.record_failure(&record, &err).await
            };

            match outcome {
                Ok(Some(delay)) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => return self.load_record(lock_id).await,
                    }
                }
                Ok(None) => {}
                Err(e) if e.kind() == ErrorKind::ConcurrencyConflict => {
                    conflicts += 1;
                    if conflicts > MAX_CONFLICT_RETRIES {
                        return Err(e);
                    }
                    tracing::debug!(%lock_id, error = %e, "record changed underneath, re-reading");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Holder presentation for relays parked in `CredentialIssued`.
    ///
    /// A valid presentation moves the relay to `CredentialVerified`; the
    /// caller is expected to `drive` it afterwards. A presentation that does
    /// not match the stored credential is refused without touching the relay,
    /// while an expired or consumed stored credential fails it.
    pub async fn present_credential(
        &self,
        credential: &Credential,
    ) -> Result<RelayRecord, CoordinatorError> {
        let lock_id = &credential.lock_id;
        let Some(_claim) = self.in_flight.claim(lock_id) else {
            return Err(CoordinatorError::Busy(lock_id.clone()));
        };

        let record = self.load_record(lock_id).await?;
        if record.state.active_step() != Some(RelayStep::CredentialIssued) {
            return Err(CoordinatorError::NotAwaitingCredential {
                lock_id: lock_id.clone(),
                state: record.state,
            });
        }

        let verdict = self.check_credential(&record, credential).await?;
        match verdict {
            Verification::Valid => {
                self.transition(
                    &record,
                    RelayState::CredentialVerified,
                    RelayPatch::none().attempts(0).clear_error(),
                )
                .await
            }
            Verification::Expired | Verification::AlreadyConsumed => {
                let err = CoordinatorError::CredentialRejected(verdict);
                self.record_failure(&record, &err).await?;
                Err(err)
            }
            Verification::SubjectMismatch | Verification::Invalid => {
                tracing::warn!(%lock_id, ?verdict, "credential presentation refused");
                Err(CoordinatorError::CredentialRejected(verdict))
            }
        }
    }

    /// Operator retry of a failed relay. Relays whose unlock reverted are
    /// never retried; rejected credentials restart from issuance.
    pub async fn retry_failed(&self, lock_id: &LockId) -> Result<RelayRecord, CoordinatorError> {
        let record = self.load_record(lock_id).await?;
        let resume = match &record.state {
            RelayState::Failed { reason, .. } if *reason == FailureReason::Reverted => None,
            RelayState::Failed {
                reason: FailureReason::CredentialRejected { .. },
                ..
            } => Some(RelayStep::Observed),
            RelayState::Failed { step, .. } => Some(*step),
            _ => None,
        };
        let Some(step) = resume else {
            return Err(CoordinatorError::NotRetryable {
                lock_id: lock_id.clone(),
                state: record.state,
            });
        };

        let updated = self
            .transition(
                &record,
                RelayState::Retrying { step },
                RelayPatch::none().attempts(0).clear_error(),
            )
            .await?;
        tracing::info!(%lock_id, resume = ?step, "operator retry");
        Ok(updated)
    }

    /// Resume every non-terminal relay from its persisted state, one at a time.
    pub async fn recover(&self) -> Result<Vec<RelayRecord>, CoordinatorError> {
        let pending = self.store.list_pending(None).await?;
        tracing::info!(count = pending.len(), "resuming pending relays");

        let mut resumed = Vec::with_capacity(pending.len());
        for record in pending {
            match self.drive(&record.lock_id).await {
                Ok(record) => resumed.push(record),
                Err(e) => tracing::error!(lock_id = %record.lock_id, error = %e, "recovery failed"),
            }
        }
        Ok(resumed)
    }

    // ── Steps ──

    async fn advance(&self, record: &RelayRecord) -> Result<Progress, CoordinatorError> {
        let Some(step) = record.state.active_step() else {
            return Ok(Progress::Stopped);
        };
        let event = self.load_event(&record.lock_id).await?;

        match step {
            RelayStep::Observed => self.accept_lock(record, &event).await?,
            RelayStep::CredentialRequested => self.request_credential(record, &event).await?,
            RelayStep::CredentialIssued => {
                let credential = self.stored_credential(record).await?;
                self.accept_presentation(record, &credential).await?;
            }
            RelayStep::CredentialVerified => self.authorize_unlock(record, &event).await?,
            RelayStep::UnlockSubmitted => return self.settle_unlock(record, &event).await,
            RelayStep::UnlockConfirmed => return Ok(Progress::Stopped),
        }
        Ok(Progress::Advanced)
    }

    /// Observed: validate and persist the intent to request a credential.
    async fn accept_lock(&self, record: &RelayRecord, event: &LockEvent) -> Result<(), CoordinatorError> {
        event.validate()?;
        self.target_chain(event)?;
        self.transition(
            record,
            RelayState::CredentialRequested,
            RelayPatch::none().attempts(0).clear_error(),
        )
        .await?;
        Ok(())
    }

    /// CredentialRequested: obtain and store the credential.
    async fn request_credential(
        &self,
        record: &RelayRecord,
        event: &LockEvent,
    ) -> Result<(), CoordinatorError> {
        let credential = self.bridge.issue_credential(event).await?;
        self.transition(
            record,
            RelayState::CredentialIssued,
            RelayPatch::none()
                .credential(credential.credential_id)
                .attempts(0)
                .clear_error(),
        )
        .await?;
        Ok(())
    }

    /// CredentialIssued: verify the presented credential.
    async fn accept_presentation(
        &self,
        record: &RelayRecord,
        presented: &Credential,
    ) -> Result<(), CoordinatorError> {
        let verdict = self.check_credential(record, presented).await?;
        if !verdict.is_valid() {
            return Err(CoordinatorError::CredentialRejected(verdict));
        }
        self.transition(
            record,
            RelayState::CredentialVerified,
            RelayPatch::none().attempts(0).clear_error(),
        )
        .await?;
        Ok(())
    }

    /// CredentialVerified: re-check and consume the credential together with
    /// the move to `UnlockSubmitted`.
    async fn authorize_unlock(
        &self,
        record: &RelayRecord,
        event: &LockEvent,
    ) -> Result<(), CoordinatorError> {
        self.target_chain(event)?;
        let credential = self.stored_credential(record).await?;
        let verdict = self.check_credential(record, &credential).await?;
        if !verdict.is_valid() {
            return Err(CoordinatorError::CredentialRejected(verdict));
        }

        let next = RelayState::UnlockSubmitted;
        ensure_transition(record, &next)?;
        self.store
            .consume_and_update(
                &record.lock_id,
                &credential.credential_id,
                &record.state,
                next,
                RelayPatch::none().attempts(0).clear_error(),
            )
            .await?;
        tracing::info!(
            lock_id = %record.lock_id,
            credential_id = %credential.credential_id,
            "credential consumed"
        );
        Ok(())
    }

    /// UnlockSubmitted: adopt an unlock already on chain or sign one, then
    /// (re-)broadcast the recorded transaction and wait for finality. The
    /// recorded transaction is only replaced when its nonce was taken by
    /// another transaction.
    async fn settle_unlock(
        &self,
        record: &RelayRecord,
        event: &LockEvent,
    ) -> Result<Progress, CoordinatorError> {
        let chain = self.target_chain(event)?;
        let Some(tx_hash) = record.unlock_tx_hash else {
            return self.prepare_unlock(chain, record, event).await;
        };

        if let Some(raw) = &record.unlock_tx_raw {
            let signed = SignedUnlock {
                tx_hash,
                raw: raw.clone(),
            };
            let sent = self
                .on_chain("broadcast_unlock", self.settings.rpc_timeout, chain.broadcast_unlock(&signed))
                .await;
            match sent {
                Ok(()) => {}
                Err(CoordinatorError::Chain(ChainError::NonceConsumed(_))) => {
                    tracing::warn!(
                        lock_id = %record.lock_id,
                        %tx_hash,
                        "unlock transaction can no longer be mined, signing again"
                    );
                    self.transition(record, RelayState::UnlockSubmitted, RelayPatch::none().discard_tx())
                        .await?;
                    return Ok(Progress::Advanced);
                }
                Err(e) => return Err(e),
            }
        }

        let finality = self
            .on_chain(
                "wait_for_finality",
                self.settings.finality_timeout + self.settings.rpc_timeout,
                chain.wait_for_finality(
                    tx_hash,
                    self.settings.finality_confirmations,
                    self.settings.finality_timeout,
                ),
            )
            .await?;

        match finality {
            Finality::Confirmed { block } => {
                self.transition(record, RelayState::UnlockConfirmed, RelayPatch::none().clear_error())
                    .await?;
                tracing::info!(
                    lock_id = %record.lock_id,
                    %tx_hash,
                    block,
                    amount = %format_amount(event.amount),
                    "unlock confirmed"
                );
                Ok(Progress::Advanced)
            }
            Finality::Reverted => Err(CoordinatorError::Reverted(tx_hash)),
            Finality::Timeout => Err(CoordinatorError::FinalityTimeout(tx_hash)),
        }
    }

    /// No transaction recorded yet. The signed transaction is persisted
    /// before anything is broadcast.
    async fn prepare_unlock(
        &self,
        chain: &C,
        record: &RelayRecord,
        event: &LockEvent,
    ) -> Result<Progress, CoordinatorError> {
        let rpc_timeout = self.settings.rpc_timeout;
        let existing = self
            .on_chain("find_unlock", rpc_timeout, chain.find_unlock(&record.lock_id))
            .await?;
        let patch = match existing {
            Some(tx_hash) => {
                tracing::warn!(lock_id = %record.lock_id, %tx_hash, "unlock already on chain");
                RelayPatch::none().tx_hash(tx_hash)
            }
            None => {
                let credential = self.stored_credential(record).await?;
                let signed = self
                    .on_chain("sign_unlock", rpc_timeout, chain.sign_unlock(event, &credential))
                    .await?;
                RelayPatch::none().signed_tx(signed.tx_hash, signed.raw)
            }
        };
        self.transition(
            record,
            RelayState::UnlockSubmitted,
            patch.attempts(0).clear_error(),
        )
        .await?;
        Ok(Progress::Advanced)
    }

    // ── Helpers ──

    /// Persist a failed step: `Retrying` with a backoff for transient errors
    /// under the attempt bound, `Failed` otherwise.
    async fn record_failure(
        &self,
        record: &RelayRecord,
        err: &CoordinatorError,
    ) -> Result<Option<Duration>, CoordinatorError> {
        let step = record.state.active_step().unwrap_or(RelayStep::Observed);
        let attempts = record.attempt_count.saturating_add(1);
        let patch = RelayPatch::none().attempts(attempts).error(err.to_string());

        if err.kind() == ErrorKind::TransientNetwork && attempts < self.settings.max_retry_attempts {
            let delay = self.backoff(attempts);
            tracing::warn!(
                lock_id = %record.lock_id,
                ?step,
                attempt = attempts,
                ?delay,
                error = %err,
                "step failed, retrying"
            );
            self.transition(record, RelayState::Retrying { step }, patch).await?;
            return Ok(Some(delay));
        }

        let reason = err.failure_reason();
        tracing::error!(
            lock_id = %record.lock_id,
            ?step,
            attempt = attempts,
            %reason,
            error = %err,
            "relay failed"
        );
        self.transition(record, RelayState::Failed { step, reason }, patch).await?;
        Ok(None)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.settings
            .backoff_base
            .saturating_mul(factor)
            .min(self.settings.backoff_max)
    }

    /// Await a chain call under `limit`; expiry is a transient chain error.
    async fn on_chain<T>(
        &self,
        operation: &'static str,
        limit: Duration,
        call: impl Future<Output = Result<T, ChainError>>,
    ) -> Result<T, CoordinatorError> {
        match tokio::time::timeout(limit, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ChainError::Timeout {
                operation,
                after: limit,
            }
            .into()),
        }
    }

    fn is_parked(&self, record: &RelayRecord) -> bool {
        !self.settings.auto_present && record.state.active_step() == Some(RelayStep::CredentialIssued)
    }

    async fn transition(
        &self,
        record: &RelayRecord,
        next: RelayState,
        patch: RelayPatch,
    ) -> Result<RelayRecord, CoordinatorError> {
        ensure_transition(record, &next)?;
        let updated = self
            .store
            .update_relay_record(&record.lock_id, &record.state, next, patch)
            .await?;
        tracing::debug!(
            lock_id = %updated.lock_id,
            from = %record.state,
            to = %updated.state,
            "relay transition"
        );
        Ok(updated)
    }

    async fn check_credential(
        &self,
        record: &RelayRecord,
        presented: &Credential,
    ) -> Result<Verification, CoordinatorError> {
        if record.credential_id.as_deref() != Some(presented.credential_id.as_str()) {
            return Ok(Verification::Invalid);
        }
        Ok(self
            .bridge
            .verify_credential(presented, &record.lock_id, unix_now())
            .await?)
    }

    async fn stored_credential(&self, record: &RelayRecord) -> Result<Credential, CoordinatorError> {
        let id = record
            .credential_id
            .as_deref()
            .ok_or(CoordinatorError::CredentialRejected(Verification::Invalid))?;
        self.store
            .get_credential(id)
            .await?
            .ok_or(CoordinatorError::CredentialRejected(Verification::Invalid))
    }

    async fn load_record(&self, lock_id: &LockId) -> Result<RelayRecord, CoordinatorError> {
        self.store
            .get_relay_record(lock_id)
            .await?
            .ok_or_else(|| CoordinatorError::NotFound(lock_id.clone()))
    }

    async fn load_event(&self, lock_id: &LockId) -> Result<LockEvent, CoordinatorError> {
        self.store
            .get_lock_event(lock_id)
            .await?
            .ok_or_else(|| StoreError::LockNotFound(lock_id.clone()).into())
    }

    /// Chain that executes the unlock for `event`, if the pair is routed.
    fn target_chain(&self, event: &LockEvent) -> Result<&C, CoordinatorError> {
        if !self.has_route(&event.source_chain_id, &event.target_chain_id) {
            return Err(CoordinatorError::NoRoute {
                source_chain: event.source_chain_id.clone(),
                target_chain: event.target_chain_id.clone(),
            });
        }
        let chain = self
            .chains
            .get(&event.target_chain_id)
            .ok_or_else(|| CoordinatorError::UnknownChain(event.target_chain_id.clone()))?;
        if !chain.capability().can_unlock() {
            return Err(ChainError::Unsupported {
                chain: chain.chain_id().clone(),
                operation: "submit_unlock",
            }
            .into());
        }
        Ok(chain)
    }

    fn has_route(&self, source: &ChainId, target: &ChainId) -> bool {
        self.routes
            .iter()
            .any(|r| &r.source == source && &r.target == target)
    }

    /// Whether the watch loop of `route` is responsible for `event`. Locks
    /// toward a chain with no route are taken by the first route of their
    /// source chain, so they end up `Failed(Unroutable)` instead of unseen.
    fn routes_event(&self, route: &RouteConfig, event: &LockEvent) -> bool {
        if event.target_chain_id == route.target {
            return true;
        }
        !self.has_route(&event.source_chain_id, &event.target_chain_id)
            && self.routes.iter().find(|r| r.source == route.source) == Some(route)
    }
}

fn ensure_transition(record: &RelayRecord, next: &RelayState) -> Result<(), CoordinatorError> {
    if record.state.can_transition_to(next) {
        Ok(())
    } else {
        Err(CoordinatorError::IllegalTransition {
            from: record.state.clone(),
            to: next.clone(),
        })
    }
}

impl<C, S, A> RelayCoordinator<C, S, A>
where
    C: ChainPort + 'static,
    S: ProofStore + 'static,
    A: IdentityAgent + 'static,
{
    /// Run one watch loop per route plus a sweep of pending relays until
    /// `shutdown` fires, then wait for in-flight relays to stop.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!(
            routes = self.routes.len(),
            workers = self.settings.worker_pool_size,
            "relay coordinator started"
        );

        let mut loops = JoinSet::new();
        {
            let this = Arc::clone(&self);
            let token = shutdown.clone();
            loops.spawn(async move { this.sweep_loop(token).await });
        }
        for route in self.routes.clone() {
            let this = Arc::clone(&self);
            let token = shutdown.clone();
            loops.spawn(async move { this.watch_route(route, token).await });
        }

        shutdown.cancelled().await;
        tracing::info!("shutting down relay coordinator");
        self.cancel.cancel();
        while loops.join_next().await.is_some() {}

        // Every dispatched relay holds a permit until it returns.
        let permits = u32::try_from(self.settings.worker_pool_size.max(1)).unwrap_or(u32::MAX);
        let _ = self.workers.acquire_many(permits).await;
        tracing::info!("relay coordinator stopped");
    }

    /// Drive `lock_id` on the worker pool in the background.
    pub fn dispatch(self: &Arc<Self>, lock_id: LockId) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let Ok(permit) = Arc::clone(&this.workers).acquire_owned().await else {
                return;
            };
            this.drive_with_permit(lock_id, permit).await;
        });
    }

    async fn drive_with_permit(&self, lock_id: LockId, _permit: OwnedSemaphorePermit) {
        match self.drive(&lock_id).await {
            Ok(record) => tracing::debug!(%lock_id, state = %record.state, "relay worker done"),
            Err(e) => tracing::error!(%lock_id, error = %e, "relay worker aborted"),
        }
    }

    async fn acquire_worker(&self, shutdown: &CancellationToken) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            permit = Arc::clone(&self.workers).acquire_owned() => permit.ok(),
            _ = shutdown.cancelled() => None,
        }
    }

    /// Resume pending relays at startup, then keep picking up relays whose
    /// worker gave up.
    async fn sweep_loop(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            if !self.sweep_pending(&shutdown).await {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.settings.sweep_interval) => {}
                _ = shutdown.cancelled() => return,
            }
        }
    }

    /// Dispatch every non-terminal relay that no task of this process is
    /// driving, one worker permit at a time. Returns `false` on shutdown.
    async fn sweep_pending(self: &Arc<Self>, shutdown: &CancellationToken) -> bool {
        let pending = match self.store.list_pending(None).await {
            Ok(pending) => pending,
            Err(e) => {
                tracing::error!(error = %e, "cannot list pending relays");
                return true;
            }
        };

        let mut dispatched = 0usize;
        for record in pending {
            if self.is_parked(&record) || self.in_flight.contains(&record.lock_id) {
                continue;
            }
            let Some(permit) = self.acquire_worker(shutdown).await else {
                return false;
            };
            dispatched += 1;
            let this = Arc::clone(self);
            tokio::spawn(async move { this.drive_with_permit(record.lock_id, permit).await });
        }
        if dispatched > 0 {
            tracing::info!(count = dispatched, "resuming pending relays");
        }
        true
    }

    async fn watch_route(self: Arc<Self>, route: RouteConfig, shutdown: CancellationToken) {
        let name = route.name();
        let Some(chain) = self.chains.get(&route.source) else {
            tracing::error!(route = %name, "source chain not configured");
            return;
        };
        let mut cursor = match self.store.get_cursor(&name).await {
            Ok(cursor) => cursor.unwrap_or(0),
            Err(e) => {
                tracing::error!(route = %name, error = %e, "cannot read scan cursor");
                return;
            }
        };
        tracing::info!(route = %name, from_block = cursor, "watching route");

        loop {
            let scan = tokio::select! {
                scan = self.on_chain("watch_locks", self.settings.rpc_timeout, chain.watch_locks(cursor)) => scan,
                _ = shutdown.cancelled() => return,
            };

            let mut advanced = false;
            match scan {
                Ok(batch) => {
                    let next_block = batch.next_block;
                    match self.accept_batch(&route, batch, &shutdown).await {
                        Ok(true) if next_block != cursor => {
                            match self.store.set_cursor(&name, next_block).await {
                                Ok(()) => {
                                    cursor = next_block;
                                    advanced = true;
                                }
                                Err(e) => tracing::warn!(route = %name, error = %e, "cannot persist scan cursor"),
                            }
                        }
                        Ok(true) => {}
                        Ok(false) => return,
                        Err(e) => {
                            tracing::warn!(route = %name, error = %e, "batch not fully recorded, rescanning")
                        }
                    }
                }
                Err(e) => tracing::warn!(route = %name, error = %e, "lock scan failed"),
            }

            // Keep scanning without a pause while catching up to the head.
            if advanced {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                _ = shutdown.cancelled() => return,
            }
        }
    }

    /// Record every event of the batch that belongs to `route` and dispatch
    /// its relay, waiting for a free worker when the pool is saturated.
    /// Returns `Ok(false)` if shutdown interrupted the batch.
    async fn accept_batch(
        self: &Arc<Self>,
        route: &RouteConfig,
        batch: LockBatch,
        shutdown: &CancellationToken,
    ) -> Result<bool, CoordinatorError> {
        for event in batch {
            if !self.routes_event(route, &event) {
                continue;
            }
            let record = match self.record_lock(&event).await {
                Ok(record) => record,
                Err(e) if e.kind() == ErrorKind::TransientNetwork => return Err(e),
                Err(e) => {
                    tracing::error!(lock_id = %event.lock_id, error = %e, "lock rejected");
                    continue;
                }
            };
            if record.is_terminal() {
                continue;
            }

            let Some(permit) = self.acquire_worker(shutdown).await else {
                return Ok(false);
            };
            let this = Arc::clone(self);
            tokio::spawn(async move { this.drive_with_permit(event.lock_id, permit).await });
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory_store::InMemoryProofStore;
    use crate::adapters::mock_agent::MockIdentityAgent;
    use crate::adapters::mock_chain::MockChainPort;
    use crate::domain::lock::tests::sample_lock;
    use crate::ports::ChainCapability;

    type TestCoordinator = RelayCoordinator<MockChainPort, InMemoryProofStore, MockIdentityAgent>;

    struct Fixture {
        coordinator: TestCoordinator,
        source: MockChainPort,
        target: MockChainPort,
        store: InMemoryProofStore,
        agent: MockIdentityAgent,
    }

    fn settings() -> CoordinatorSettings {
        CoordinatorSettings {
            finality_confirmations: 1,
            max_retry_attempts: 3,
            worker_pool_size: 4,
            poll_interval: Duration::from_millis(5),
            finality_timeout: Duration::from_secs(1),
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(4),
            rpc_timeout: Duration::from_secs(1),
            sweep_interval: Duration::from_millis(10),
            auto_present: true,
        }
    }

    fn fixture_with(settings: CoordinatorSettings) -> Fixture {
        let source = MockChainPort::new("A", ChainCapability::Lock);
        let target = MockChainPort::new("B", ChainCapability::Both);
        let store = InMemoryProofStore::new();
        let agent = MockIdentityAgent::new();
        let coordinator = RelayCoordinator::new(
            vec![source.clone(), target.clone()],
            vec![RouteConfig {
                source: ChainId::from("A"),
                target: ChainId::from("B"),
            }],
            store.clone(),
            agent.clone(),
            BridgeSettings::default(),
            settings,
        );
        Fixture {
            coordinator,
            source,
            target,
            store,
            agent,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(settings())
    }

    #[tokio::test]
    async fn test_happy_path_reaches_unlock_confirmed() {
        let f = fixture();
        let lock = sample_lock("L1");

        let record = f.coordinator.handle_lock(&lock).await.unwrap();

        assert_eq!(record.state, RelayState::UnlockConfirmed);
        assert!(record.unlock_tx_hash.is_some());
        assert_eq!(record.attempt_count, 0);
        assert_eq!(record.last_error, None);
        assert_eq!(f.target.submissions().await, vec![lock.lock_id.clone()]);

        let credential_id = record.credential_id.unwrap();
        assert!(f.store.get_credential(&credential_id).await.unwrap().unwrap().consumed);
    }

    #[tokio::test]
    async fn test_replay_of_finished_relay_is_noop() {
        let f = fixture();
        let lock = sample_lock("L1");
        f.coordinator.handle_lock(&lock).await.unwrap();

        let again = f.coordinator.handle_lock(&lock).await.unwrap();
        assert_eq!(again.state, RelayState::UnlockConfirmed);
        assert_eq!(f.target.submission_count().await, 1);
        assert_eq!(f.agent.issue_calls().await, 1);
    }

    #[tokio::test]
    async fn test_invalid_lock_fails_without_retry() {
        let f = fixture();
        let mut lock = sample_lock("L1");
        lock.amount = alloy::primitives::U256::ZERO;

        let record = f.coordinator.handle_lock(&lock).await.unwrap();
        assert_eq!(
            record.state,
            RelayState::Failed {
                step: RelayStep::Observed,
                reason: FailureReason::Invalid,
            }
        );
        assert_eq!(record.attempt_count, 1);
        assert!(record.last_error.unwrap().contains("amount is zero"));
        assert_eq!(f.agent.issue_calls().await, 0);
    }

    #[tokio::test]
    async fn test_unrouted_target_is_unroutable() {
        let f = fixture();
        let mut lock = sample_lock("L1");
        lock.target_chain_id = ChainId::from("C");

        let record = f.coordinator.handle_lock(&lock).await.unwrap();
        assert!(matches!(
            record.state,
            RelayState::Failed {
                reason: FailureReason::Unroutable,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_transient_issuance_failure_retries() {
        let f = fixture();
        f.agent.fail_next(2).await;

        let record = f.coordinator.handle_lock(&sample_lock("L1")).await.unwrap();
        assert_eq!(record.state, RelayState::UnlockConfirmed);
        assert_eq!(f.agent.issue_calls().await, 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted_after_max_attempts() {
        let f = fixture();
        f.agent.fail_next(10).await;

        let record = f.coordinator.handle_lock(&sample_lock("L1")).await.unwrap();
        assert_eq!(
            record.state,
            RelayState::Failed {
                step: RelayStep::CredentialRequested,
                reason: FailureReason::RetriesExhausted,
            }
        );
        assert_eq!(record.attempt_count, 3);
        assert_eq!(f.agent.issue_calls().await, 3);
        assert!(record.last_error.is_some());
    }

    #[tokio::test]
    async fn test_agent_rejection_fails_with_credential_rejected() {
        let f = fixture();
        f.agent.reject_next(1).await;

        let record = f.coordinator.handle_lock(&sample_lock("L1")).await.unwrap();
        assert_eq!(
            record.state,
            RelayState::Failed {
                step: RelayStep::CredentialRequested,
                reason: FailureReason::CredentialRejected {
                    outcome: Verification::Invalid,
                },
            }
        );
    }

    #[tokio::test]
    async fn test_reverted_unlock_is_terminal_and_not_retryable() {
        let f = fixture();
        f.target.push_finality(Finality::Reverted).await;
        let lock = sample_lock("L1");

        let record = f.coordinator.handle_lock(&lock).await.unwrap();
        assert_eq!(
            record.state,
            RelayState::Failed {
                step: RelayStep::UnlockSubmitted,
                reason: FailureReason::Reverted,
            }
        );
        assert_eq!(f.target.submission_count().await, 1);

        let retry = f.coordinator.retry_failed(&lock.lock_id).await;
        assert!(matches!(retry, Err(CoordinatorError::NotRetryable { .. })));
        f.coordinator.drive(&lock.lock_id).await.unwrap();
        assert_eq!(f.target.submission_count().await, 1);
    }

    #[tokio::test]
    async fn test_finality_timeout_requeries_without_resubmitting() {
        let f = fixture();
        f.target.push_finality(Finality::Timeout).await;
        f.target.push_finality(Finality::Timeout).await;

        let record = f.coordinator.handle_lock(&sample_lock("L1")).await.unwrap();
        assert_eq!(record.state, RelayState::UnlockConfirmed);
        assert_eq!(f.target.submission_count().await, 1);
    }

    #[tokio::test]
    async fn test_submission_failure_retries_then_succeeds() {
        let f = fixture();
        f.target.fail_next_submissions(1).await;

        let record = f.coordinator.handle_lock(&sample_lock("L1")).await.unwrap();
        assert_eq!(record.state, RelayState::UnlockConfirmed);
        assert_eq!(f.target.submission_count().await, 1);
    }

    #[tokio::test]
    async fn test_operator_retry_resumes_exhausted_relay() {
        let f = fixture();
        f.target.fail_next_submissions(3).await;
        let lock = sample_lock("L1");

        let failed = f.coordinator.handle_lock(&lock).await.unwrap();
        assert_eq!(
            failed.state,
            RelayState::Failed {
                step: RelayStep::UnlockSubmitted,
                reason: FailureReason::RetriesExhausted,
            }
        );

        let retried = f.coordinator.retry_failed(&lock.lock_id).await.unwrap();
        assert_eq!(
            retried.state,
            RelayState::Retrying {
                step: RelayStep::UnlockSubmitted
            }
        );
        assert_eq!(retried.attempt_count, 0);

        let done = f.coordinator.drive(&lock.lock_id).await.unwrap();
        assert_eq!(done.state, RelayState::UnlockConfirmed);
        assert_eq!(f.target.submission_count().await, 1);
    }

    #[tokio::test]
    async fn test_manual_presentation_parks_until_presented() {
        let f = fixture_with(CoordinatorSettings {
            auto_present: false,
            ..settings()
        });
        let lock = sample_lock("L1");

        let parked = f.coordinator.handle_lock(&lock).await.unwrap();
        assert_eq!(parked.state, RelayState::CredentialIssued);
        let credential = f
            .store
            .get_credential(parked.credential_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();

        let mut forged = credential.clone();
        forged.subject_identity = "did:ethr:0xbb".into();
        let refused = f.coordinator.present_credential(&forged).await;
        assert!(matches!(
            refused,
            Err(CoordinatorError::CredentialRejected(Verification::SubjectMismatch))
        ));
        assert_eq!(
            f.store.get_relay_record(&lock.lock_id).await.unwrap().unwrap().state,
            RelayState::CredentialIssued
        );

        let verified = f.coordinator.present_credential(&credential).await.unwrap();
        assert_eq!(verified.state, RelayState::CredentialVerified);

        let done = f.coordinator.drive(&lock.lock_id).await.unwrap();
        assert_eq!(done.state, RelayState::UnlockConfirmed);
    }

    #[tokio::test]
    async fn test_presentation_outside_credential_issued_is_refused() {
        let f = fixture();
        let lock = sample_lock("L1");
        let record = f.coordinator.handle_lock(&lock).await.unwrap();
        let credential = f
            .store
            .get_credential(record.credential_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();

        let result = f.coordinator.present_credential(&credential).await;
        assert!(matches!(
            result,
            Err(CoordinatorError::NotAwaitingCredential { .. })
        ));
    }

    /// Walk a recorded lock to `UnlockSubmitted` with `credential`, as a run
    /// that stopped right after consuming it would leave it.
    async fn park_in_unlock_submitted(f: &Fixture, lock: &LockEvent, credential: &Credential) {
        f.coordinator.record_lock(lock).await.unwrap();
        f.store.put_credential(credential).await.unwrap();
        for (from, to) in [
            (RelayState::Observed, RelayState::CredentialRequested),
            (RelayState::CredentialRequested, RelayState::CredentialIssued),
            (RelayState::CredentialIssued, RelayState::CredentialVerified),
            (RelayState::CredentialVerified, RelayState::UnlockSubmitted),
        ] {
            f.store
                .update_relay_record(
                    &lock.lock_id,
                    &from,
                    to,
                    RelayPatch::none().credential(credential.credential_id.clone()),
                )
                .await
                .unwrap();
        }
    }

    fn consumed_credential(lock: &LockEvent) -> Credential {
        Credential {
            credential_id: "cred-x".into(),
            lock_id: lock.lock_id.clone(),
            subject_identity: "did:ethr:0xaa".into(),
            issued_at: 0,
            expires_at: u64::MAX,
            consumed: true,
        }
    }

    #[tokio::test]
    async fn test_crash_window_adopts_existing_unlock() {
        let f = fixture();
        let lock = sample_lock("L1");
        let credential = consumed_credential(&lock);
        park_in_unlock_submitted(&f, &lock, &credential).await;

        // The unlock was mined but its hash never recorded.
        let tx_hash = f.target.submit_unlock(&lock, &credential).await.unwrap();
        f.target
            .wait_for_finality(tx_hash, 1, Duration::from_secs(1))
            .await
            .unwrap();

        let record = f.coordinator.recover().await.unwrap().pop().unwrap();
        assert_eq!(record.state, RelayState::UnlockConfirmed);
        assert_eq!(record.unlock_tx_hash, Some(tx_hash));
        assert_eq!(record.unlock_tx_raw, None);
        assert_eq!(f.target.submission_count().await, 1);
    }

    #[tokio::test]
    async fn test_pending_unlock_is_rebroadcast_not_resigned() {
        let f = fixture();
        let lock = sample_lock("L1");
        let credential = consumed_credential(&lock);
        park_in_unlock_submitted(&f, &lock, &credential).await;

        // Signed, recorded and broadcast, then the process died while the
        // transaction was still in the pool.
        let signed = f.target.sign_unlock(&lock, &credential).await.unwrap();
        f.store
            .update_relay_record(
                &lock.lock_id,
                &RelayState::UnlockSubmitted,
                RelayState::UnlockSubmitted,
                RelayPatch::none().signed_tx(signed.tx_hash, signed.raw.clone()),
            )
            .await
            .unwrap();
        f.target.broadcast_unlock(&signed).await.unwrap();
        assert_eq!(f.target.find_unlock(&lock.lock_id).await.unwrap(), None);

        let record = f.coordinator.recover().await.unwrap().pop().unwrap();
        assert_eq!(record.state, RelayState::UnlockConfirmed);
        assert_eq!(record.unlock_tx_hash, Some(signed.tx_hash));
        assert_eq!(f.target.submission_count().await, 1);
    }

    #[tokio::test]
    async fn test_lost_broadcast_response_resends_same_transaction() {
        let f = fixture();
        f.target.lose_next_broadcast_responses(1).await;
        let lock = sample_lock("L1");

        let record = f.coordinator.handle_lock(&lock).await.unwrap();
        assert_eq!(record.state, RelayState::UnlockConfirmed);
        assert_eq!(f.target.submissions().await, vec![lock.lock_id.clone()]);
        assert_eq!(
            f.target.find_unlock(&lock.lock_id).await.unwrap(),
            record.unlock_tx_hash
        );
    }

    #[tokio::test]
    async fn test_signed_transaction_with_taken_nonce_is_replaced() {
        let f = fixture();
        f.target.take_next_nonces(1).await;
        let lock = sample_lock("L1");

        let record = f.coordinator.handle_lock(&lock).await.unwrap();
        assert_eq!(record.state, RelayState::UnlockConfirmed);
        assert_eq!(record.attempt_count, 0);
        assert_eq!(f.target.submission_count().await, 1);
        assert_eq!(
            f.target.find_unlock(&lock.lock_id).await.unwrap(),
            record.unlock_tx_hash
        );
    }

    #[tokio::test]
    async fn test_stalled_chain_call_times_out_and_retries() {
        let f = fixture_with(CoordinatorSettings {
            rpc_timeout: Duration::from_millis(20),
            ..settings()
        });
        f.target.set_stalled(true).await;

        let record = f.coordinator.handle_lock(&sample_lock("L1")).await.unwrap();
        assert_eq!(
            record.state,
            RelayState::Failed {
                step: RelayStep::UnlockSubmitted,
                reason: FailureReason::RetriesExhausted,
            }
        );
        assert_eq!(record.attempt_count, 3);
        assert!(record.last_error.unwrap().contains("find_unlock timed out"));
        assert_eq!(f.target.submission_count().await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_stalled_chain_call() {
        let f = fixture_with(CoordinatorSettings {
            rpc_timeout: Duration::from_secs(60),
            ..settings()
        });
        f.target.set_stalled(true).await;
        let coordinator = Arc::new(f.coordinator);
        f.source.push_lock(sample_lock("L1")).await;

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&coordinator).run(shutdown.clone()));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while f.store.list_by_label("unlock_submitted").await.unwrap().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "relay did not reach the unlock step");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .expect("run did not return after shutdown")
            .unwrap();
        let record = f
            .store
            .get_relay_record(&sample_lock("L1").lock_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state, RelayState::UnlockSubmitted);
    }

    #[tokio::test]
    async fn test_sweep_picks_up_relays_nobody_is_driving() {
        let f = fixture();
        let coordinator = Arc::new(f.coordinator);

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&coordinator).run(shutdown.clone()));

        // Recorded after startup and never dispatched by a watch loop.
        let lock = sample_lock("L1");
        tokio::time::sleep(Duration::from_millis(20)).await;
        coordinator.record_lock(&lock).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while f.store.list_by_label("unlock_confirmed").await.unwrap().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "orphaned relay was not resumed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown.cancel();
        handle.await.unwrap();
        assert_eq!(f.target.submission_count().await, 1);
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let f = fixture_with(CoordinatorSettings {
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(10),
            ..settings()
        });
        assert_eq!(f.coordinator.backoff(1), Duration::from_secs(1));
        assert_eq!(f.coordinator.backoff(2), Duration::from_secs(2));
        assert_eq!(f.coordinator.backoff(4), Duration::from_secs(8));
        assert_eq!(f.coordinator.backoff(5), Duration::from_secs(10));
        assert_eq!(f.coordinator.backoff(40), Duration::from_secs(10));
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(
            CoordinatorError::Chain(ChainError::Rpc("reset".into())).kind(),
            ErrorKind::TransientNetwork
        );
        assert_eq!(
            CoordinatorError::Store(StoreError::StaleState {
                lock_id: LockId::from("L1"),
                expected: RelayState::Observed,
                found: RelayState::CredentialRequested,
            })
            .kind(),
            ErrorKind::ConcurrencyConflict
        );
        assert_eq!(
            CoordinatorError::Reverted(B256::ZERO).failure_reason(),
            FailureReason::Reverted
        );
        assert_eq!(
            CoordinatorError::Store(StoreError::AlreadyConsumed("c".into())).failure_reason(),
            FailureReason::CredentialRejected {
                outcome: Verification::AlreadyConsumed
            }
        );
        assert_eq!(
            CoordinatorError::UnknownChain(ChainId::from("C")).failure_reason(),
            FailureReason::Unroutable
        );
    }

    #[tokio::test]
    async fn test_run_relays_watched_locks_and_stops_on_shutdown() {
        let f = fixture();
        let coordinator = Arc::new(f.coordinator);
        f.source.push_lock(sample_lock("L1")).await;
        let mut second = sample_lock("L2");
        second.tx_hash = alloy::primitives::B256::repeat_byte(0x22);
        f.source.push_lock(second).await;

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&coordinator).run(shutdown.clone()));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let done = f.store.list_by_label("unlock_confirmed").await.unwrap();
            if done.len() == 2 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "relays did not complete");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown.cancel();
        handle.await.unwrap();
        assert_eq!(f.target.submission_count().await, 2);
        assert_eq!(f.store.get_cursor("A->B").await.unwrap(), Some(43));
    }
}
