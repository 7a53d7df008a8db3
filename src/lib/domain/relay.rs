use std::fmt;

use alloy::primitives::{Bytes, B256};

use super::credential::Verification;
use super::lock::LockId;
use super::unix_now;

/// Progress steps of a relay, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayStep {
    Observed,
    CredentialRequested,
    CredentialIssued,
    CredentialVerified,
    UnlockSubmitted,
    UnlockConfirmed,
}

impl RelayStep {
    pub fn next(self) -> Option<RelayStep> {
        match self {
            RelayStep::Observed => Some(RelayStep::CredentialRequested),
            RelayStep::CredentialRequested => Some(RelayStep::CredentialIssued),
            RelayStep::CredentialIssued => Some(RelayStep::CredentialVerified),
            RelayStep::CredentialVerified => Some(RelayStep::UnlockSubmitted),
            RelayStep::UnlockSubmitted => Some(RelayStep::UnlockConfirmed),
            RelayStep::UnlockConfirmed => None,
        }
    }
}

/// Why a relay ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// Lock event or agent response failed validation.
    Invalid,
    /// Credential verification returned something other than `Valid`.
    CredentialRejected { outcome: Verification },
    /// Unlock transaction reverted. Never retried.
    Reverted,
    /// Transient failures exceeded the configured attempt bound.
    RetriesExhausted,
    /// No chain adapter can unlock on the lock's target chain.
    Unroutable,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Invalid => f.write_str("invalid"),
            FailureReason::CredentialRejected { outcome } => {
                write!(f, "credential rejected ({outcome:?})")
            }
            FailureReason::Reverted => f.write_str("reverted"),
            FailureReason::RetriesExhausted => f.write_str("retries exhausted"),
            FailureReason::Unroutable => f.write_str("unroutable"),
        }
    }
}

/// State of a relay record.
///
/// Progress states move forward one step at a time. `Retrying` re-enters the
/// step that failed; `Failed` is terminal unless an operator retries it.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RelayState {
    Observed,
    CredentialRequested,
    CredentialIssued,
    CredentialVerified,
    UnlockSubmitted,
    UnlockConfirmed,
    Retrying { step: RelayStep },
    Failed { step: RelayStep, reason: FailureReason },
}

impl RelayState {
    /// The progress step this state sits on (`None` for `Retrying`/`Failed`).
    pub fn step(&self) -> Option<RelayStep> {
        match self {
            RelayState::Observed => Some(RelayStep::Observed),
            RelayState::CredentialRequested => Some(RelayStep::CredentialRequested),
            RelayState::CredentialIssued => Some(RelayStep::CredentialIssued),
            RelayState::CredentialVerified => Some(RelayStep::CredentialVerified),
            RelayState::UnlockSubmitted => Some(RelayStep::UnlockSubmitted),
            RelayState::UnlockConfirmed => Some(RelayStep::UnlockConfirmed),
            RelayState::Retrying { .. } | RelayState::Failed { .. } => None,
        }
    }

    /// The step whose work is pending in this state, including `Retrying`.
    pub fn active_step(&self) -> Option<RelayStep> {
        match self {
            RelayState::Retrying { step } => Some(*step),
            other => other.step(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RelayState::UnlockConfirmed | RelayState::Failed { .. })
    }

    /// Transition guard. A state may always be rewritten to itself (field-only update).
    pub fn can_transition_to(&self, next: &RelayState) -> bool {
        use RelayState::*;

        match (self, next) {
            (Failed { reason, .. }, Retrying { .. }) => *reason != FailureReason::Reverted,
            (Failed { .. }, _) | (UnlockConfirmed, _) => false,
            (_, Failed { .. }) => true,
            (Retrying { step }, Retrying { step: again }) => step == again,
            (Retrying { step }, target) => target
                .step()
                .is_some_and(|t| t == *step || Some(t) == step.next()),
            (current, Retrying { step }) => current.step() == Some(*step),
            (current, target) => match (current.step(), target.step()) {
                (Some(from), Some(to)) => to == from || Some(to) == from.next(),
                _ => false,
            },
        }
    }

    /// Label used in logs and the `?state=` query filter.
    pub fn label(&self) -> &'static str {
        match self {
            RelayState::Observed => "observed",
            RelayState::CredentialRequested => "credential_requested",
            RelayState::CredentialIssued => "credential_issued",
            RelayState::CredentialVerified => "credential_verified",
            RelayState::UnlockSubmitted => "unlock_submitted",
            RelayState::UnlockConfirmed => "unlock_confirmed",
            RelayState::Retrying { .. } => "retrying",
            RelayState::Failed { .. } => "failed",
        }
    }

    /// Whether this state matches a filter label (`Retrying`/`Failed` match by kind).
    pub fn matches_label(&self, label: &str) -> bool {
        self.label() == label
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayState::Retrying { step } => write!(f, "retrying({step:?})"),
            RelayState::Failed { step, reason } => write!(f, "failed({step:?}: {reason})"),
            other => f.write_str(other.label()),
        }
    }
}

/// Relay lifecycle of one lock event (1:1 with `LockEvent`).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RelayRecord {
    pub lock_id: LockId,
    pub state: RelayState,
    pub credential_id: Option<String>,
    pub unlock_tx_hash: Option<B256>,
    /// Signed unlock transaction, persisted before its first broadcast so the
    /// same bytes are re-sent after a restart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unlock_tx_raw: Option<Bytes>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub updated_at: u64,
}

impl RelayRecord {
    pub fn new(lock_id: LockId) -> Self {
        Self {
            lock_id,
            state: RelayState::Observed,
            credential_id: None,
            unlock_tx_hash: None,
            unlock_tx_raw: None,
            attempt_count: 0,
            last_error: None,
            updated_at: unix_now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Move to `state` and apply `patch`. The caller is responsible for the
    /// optimistic state check.
    pub fn apply(&mut self, state: RelayState, patch: &RelayPatch) {
        self.state = state;
        if let Some(id) = &patch.credential_id {
            self.credential_id = Some(id.clone());
        }
        if let Some(hash) = patch.unlock_tx_hash {
            self.unlock_tx_hash = hash;
        }
        if let Some(raw) = &patch.unlock_tx_raw {
            self.unlock_tx_raw = raw.clone();
        }
        if let Some(count) = patch.attempt_count {
            self.attempt_count = count;
        }
        if let Some(err) = &patch.last_error {
            self.last_error = err.clone();
        }
        self.updated_at = unix_now();
    }
}

/// Field updates applied together with a state transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayPatch {
    pub credential_id: Option<String>,
    /// `Some(None)` clears the recorded transaction.
    pub unlock_tx_hash: Option<Option<B256>>,
    pub unlock_tx_raw: Option<Option<Bytes>>,
    pub attempt_count: Option<u32>,
    /// `Some(None)` clears the last error.
    pub last_error: Option<Option<String>>,
}

impl RelayPatch {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn credential(mut self, id: impl Into<String>) -> Self {
        self.credential_id = Some(id.into());
        self
    }

    /// Adopt a transaction found on chain; no raw bytes are kept for it.
    pub fn tx_hash(mut self, hash: B256) -> Self {
        self.unlock_tx_hash = Some(Some(hash));
        self.unlock_tx_raw = Some(None);
        self
    }

    pub fn signed_tx(mut self, hash: B256, raw: Bytes) -> Self {
        self.unlock_tx_hash = Some(Some(hash));
        self.unlock_tx_raw = Some(Some(raw));
        self
    }

    pub fn discard_tx(mut self) -> Self {
        self.unlock_tx_hash = Some(None);
        self.unlock_tx_raw = Some(None);
        self
    }

    pub fn attempts(mut self, count: u32) -> Self {
        self.attempt_count = Some(count);
        self
    }

    pub fn error(mut self, err: impl Into<String>) -> Self {
        self.last_error = Some(Some(err.into()));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.last_error = Some(None);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_by_one_step_only() {
        assert!(RelayState::Observed.can_transition_to(&RelayState::CredentialRequested));
        assert!(!RelayState::Observed.can_transition_to(&RelayState::CredentialIssued));
        assert!(!RelayState::CredentialIssued.can_transition_to(&RelayState::Observed));
    }

    #[test]
    fn test_same_state_rewrite_allowed() {
        assert!(RelayState::UnlockSubmitted.can_transition_to(&RelayState::UnlockSubmitted));
    }

    #[test]
    fn test_retrying_reenters_failed_step() {
        let retrying = RelayState::Retrying { step: RelayStep::UnlockSubmitted };
        assert!(RelayState::UnlockSubmitted.can_transition_to(&retrying));
        assert!(retrying.can_transition_to(&retrying));
        assert!(retrying.can_transition_to(&RelayState::UnlockSubmitted));
        assert!(retrying.can_transition_to(&RelayState::UnlockConfirmed));
        assert!(!retrying.can_transition_to(&RelayState::CredentialVerified));
        assert!(!RelayState::Observed.can_transition_to(&retrying));
    }

    #[test]
    fn test_failed_reachable_from_any_non_terminal() {
        let failed = RelayState::Failed {
            step: RelayStep::CredentialRequested,
            reason: FailureReason::RetriesExhausted,
        };
        assert!(RelayState::Observed.can_transition_to(&failed));
        assert!(RelayState::Retrying { step: RelayStep::Observed }.can_transition_to(&failed));
        assert!(!RelayState::UnlockConfirmed.can_transition_to(&failed));
    }

    #[test]
    fn test_reverted_is_never_retried() {
        let reverted = RelayState::Failed {
            step: RelayStep::UnlockSubmitted,
            reason: FailureReason::Reverted,
        };
        let retry = RelayState::Retrying { step: RelayStep::UnlockSubmitted };
        assert!(!reverted.can_transition_to(&retry));
        assert!(!reverted.can_transition_to(&RelayState::UnlockSubmitted));
    }

    #[test]
    fn test_explicit_retry_from_failure() {
        let failed = RelayState::Failed {
            step: RelayStep::CredentialRequested,
            reason: FailureReason::RetriesExhausted,
        };
        assert!(failed.can_transition_to(&RelayState::Retrying { step: RelayStep::CredentialRequested }));
        assert!(!failed.can_transition_to(&RelayState::CredentialIssued));
    }

    #[test]
    fn test_terminal_states() {
        assert!(RelayState::UnlockConfirmed.is_terminal());
        assert!(RelayState::Failed { step: RelayStep::Observed, reason: FailureReason::Invalid }.is_terminal());
        assert!(!RelayState::Retrying { step: RelayStep::Observed }.is_terminal());
    }

    #[test]
    fn test_patch_applies_fields() {
        let mut record = RelayRecord::new(LockId::from("L1"));
        record.apply(
            RelayState::CredentialIssued,
            &RelayPatch::none().credential("cred-1").attempts(2).error("boom"),
        );
        assert_eq!(record.credential_id.as_deref(), Some("cred-1"));
        assert_eq!(record.attempt_count, 2);
        assert_eq!(record.last_error.as_deref(), Some("boom"));

        record.apply(RelayState::CredentialIssued, &RelayPatch::none().clear_error());
        assert!(record.last_error.is_none());
        assert_eq!(record.credential_id.as_deref(), Some("cred-1"));
    }

    #[test]
    fn test_patch_records_and_discards_signed_tx() {
        let mut record = RelayRecord::new(LockId::from("L1"));
        let raw = Bytes::from_static(&[0x02, 0xf8, 0x6b]);
        record.apply(
            RelayState::UnlockSubmitted,
            &RelayPatch::none().signed_tx(B256::repeat_byte(1), raw.clone()),
        );
        assert_eq!(record.unlock_tx_hash, Some(B256::repeat_byte(1)));
        assert_eq!(record.unlock_tx_raw, Some(raw));

        record.apply(RelayState::UnlockSubmitted, &RelayPatch::none().attempts(1));
        assert!(record.unlock_tx_raw.is_some());

        record.apply(RelayState::UnlockSubmitted, &RelayPatch::none().discard_tx());
        assert_eq!(record.unlock_tx_hash, None);
        assert_eq!(record.unlock_tx_raw, None);
    }

    #[test]
    fn test_record_without_raw_tx_deserializes() {
        let mut json = serde_json::to_value(RelayRecord::new(LockId::from("L1"))).unwrap();
        assert!(json.get("unlock_tx_raw").is_none());
        json["unlock_tx_hash"] = serde_json::json!(B256::repeat_byte(7));
        let record: RelayRecord = serde_json::from_value(json).unwrap();
        assert_eq!(record.unlock_tx_hash, Some(B256::repeat_byte(7)));
        assert_eq!(record.unlock_tx_raw, None);
    }

    #[test]
    fn test_state_serializes_tagged() {
        let state = RelayState::Retrying { step: RelayStep::CredentialRequested };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["state"], "retrying");
        assert_eq!(json["step"], "credential_requested");
        let back: RelayState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }
}
