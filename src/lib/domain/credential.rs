use alloy::primitives::{keccak256, Address, B256};

use super::lock::{ChainId, LockEvent, LockId};

/// A verifiable credential binding one lock to its owner's identity.
///
/// Consumable once: `consumed` flips to `true` in the same store transaction
/// that moves the relay to `UnlockSubmitted`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Credential {
    pub credential_id: String,
    pub lock_id: LockId,
    /// DID of the lock owner
    pub subject_identity: String,
    /// Unix seconds
    pub issued_at: u64,
    /// Unix seconds; the credential is expired once `now > expires_at`
    pub expires_at: u64,
    #[serde(default)]
    pub consumed: bool,
}

impl Credential {
    pub fn is_expired(&self, now: u64) -> bool {
        now > self.expires_at
    }

    /// Commitment to the credential passed on-chain with the unlock.
    pub fn digest(&self) -> B256 {
        keccak256(
            format!(
                "{}|{}|{}|{}|{}",
                self.credential_id, self.lock_id, self.subject_identity, self.issued_at, self.expires_at
            )
            .as_bytes(),
        )
    }
}

/// Outcome of verifying a presented credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verification {
    Valid,
    Expired,
    AlreadyConsumed,
    SubjectMismatch,
    Invalid,
}

impl Verification {
    pub fn is_valid(self) -> bool {
        self == Verification::Valid
    }
}

/// DID under which a lock owner is credentialed, e.g. `did:ethr:0xabc…`.
pub fn subject_for(did_method: &str, owner: Address) -> String {
    format!("{did_method}:{owner:#x}")
}

/// Verify a presented credential against the stored copy.
///
/// Pure: reads nothing beyond its arguments and mutates nothing. Checks run in
/// order: identity of the credential (`Invalid`), consumption, expiry, subject.
pub fn verify_credential(
    presented: &Credential,
    stored: Option<&Credential>,
    expected_lock_id: &LockId,
    expected_subject: &str,
    now: u64,
) -> Verification {
    let Some(stored) = stored else {
        return Verification::Invalid;
    };

    if presented.credential_id != stored.credential_id
        || presented.lock_id != *expected_lock_id
        || stored.lock_id != *expected_lock_id
        || presented.issued_at != stored.issued_at
        || presented.expires_at != stored.expires_at
    {
        return Verification::Invalid;
    }

    if stored.consumed {
        return Verification::AlreadyConsumed;
    }

    if stored.is_expired(now) {
        return Verification::Expired;
    }

    if presented.subject_identity != stored.subject_identity
        || stored.subject_identity != expected_subject
    {
        return Verification::SubjectMismatch;
    }

    Verification::Valid
}

/// Claims attested by a lock credential.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LockClaims {
    pub source_chain_id: ChainId,
    pub target_chain_id: ChainId,
    pub asset_identifier: Address,
    /// Decimal string of the smallest-unit amount
    pub amount: String,
    pub tx_hash: B256,
}

/// Request sent to the identity agent to issue a lock credential.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename = "lock_credential_request")]
pub struct CredentialRequest {
    /// Also used as the exchange thread id, so a re-request after a crash can
    /// find the exchange already in progress.
    pub lock_id: LockId,
    pub connection_id: String,
    pub subject_identity: String,
    pub claims: LockClaims,
    pub ttl_secs: u64,
}

impl CredentialRequest {
    pub fn for_lock(event: &LockEvent, connection_id: &str, subject: String, ttl_secs: u64) -> Self {
        Self {
            lock_id: event.lock_id.clone(),
            connection_id: connection_id.to_string(),
            subject_identity: subject,
            claims: LockClaims {
                source_chain_id: event.source_chain_id.clone(),
                target_chain_id: event.target_chain_id.clone(),
                asset_identifier: event.asset_identifier,
                amount: event.amount.to_string(),
                tx_hash: event.tx_hash,
            },
            ttl_secs,
        }
    }
}

/// Identity agent's answer once a credential has been issued.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename = "lock_credential_response")]
pub struct CredentialResponse {
    pub credential_id: String,
    pub lock_id: LockId,
    pub subject_identity: String,
    pub issued_at: u64,
    pub expires_at: u64,
}

impl CredentialResponse {
    /// Validate the response against the request it answers and convert it
    /// into an unconsumed credential.
    pub fn into_credential(
        self,
        request: &CredentialRequest,
    ) -> Result<Credential, ResponseValidationError> {
        if self.credential_id.trim().is_empty() {
            return Err(ResponseValidationError::MissingCredentialId);
        }
        if self.lock_id != request.lock_id {
            return Err(ResponseValidationError::LockMismatch {
                expected: request.lock_id.clone(),
                got: self.lock_id,
            });
        }
        if self.subject_identity != request.subject_identity {
            return Err(ResponseValidationError::SubjectMismatch {
                expected: request.subject_identity.clone(),
                got: self.subject_identity,
            });
        }
        if self.expires_at <= self.issued_at {
            return Err(ResponseValidationError::EmptyValidity {
                issued_at: self.issued_at,
                expires_at: self.expires_at,
            });
        }

        Ok(Credential {
            credential_id: self.credential_id,
            lock_id: self.lock_id,
            subject_identity: self.subject_identity,
            issued_at: self.issued_at,
            expires_at: self.expires_at,
            consumed: false,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResponseValidationError {
    #[error("credential_id missing from agent response")]
    MissingCredentialId,

    #[error("agent answered for lock {got}, expected {expected}")]
    LockMismatch { expected: LockId, got: LockId },

    #[error("agent issued to subject {got}, expected {expected}")]
    SubjectMismatch { expected: String, got: String },

    #[error("credential validity window is empty: issued_at={issued_at}, expires_at={expires_at}")]
    EmptyValidity { issued_at: u64, expires_at: u64 },
}
