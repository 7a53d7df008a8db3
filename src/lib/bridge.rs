use std::sync::Arc;
use std::time::Duration;

use crate::config::AgentConfig;
use crate::domain::credential::{
    self, subject_for, Credential, CredentialRequest, ResponseValidationError, Verification,
};
use crate::domain::lock::{LockEvent, LockId, LockValidationError};
use crate::ports::identity::{IdentityAgent, IdentityError};
use crate::ports::store::{ProofStore, StoreError};

/// Issuance parameters shared by every request.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub connection_id: String,
    pub did_method: String,
    pub credential_ttl: Duration,
    /// Upper bound on one `issue` call to the agent, polling included.
    pub request_timeout: Duration,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            connection_id: "local".into(),
            did_method: "did:ethr".into(),
            credential_ttl: Duration::from_secs(3600),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&AgentConfig> for BridgeSettings {
    fn from(config: &AgentConfig) -> Self {
        Self {
            connection_id: config.connection_id.clone(),
            did_method: config.did_method.clone(),
            credential_ttl: config.credential_ttl,
            request_timeout: config.request_timeout,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IssuanceError {
    #[error("invalid lock event: {0}")]
    InvalidLock(#[from] LockValidationError),

    #[error("identity agent failed: {0}")]
    Upstream(#[from] IdentityError),

    #[error("identity agent did not answer within {0:?}")]
    Timeout(Duration),

    #[error("invalid agent response: {0}")]
    InvalidResponse(#[from] ResponseValidationError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl IssuanceError {
    /// Whether asking the agent again may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            IssuanceError::Upstream(e) => e.is_transient(),
            IssuanceError::Timeout(_) => true,
            IssuanceError::Store(StoreError::Internal(_)) => true,
            _ => false,
        }
    }
}

/// Obtains credentials from the identity agent and verifies presented ones
/// against the proof store.
///
/// Consumption is not done here: the coordinator consumes a credential in the
/// same store transaction that records the unlock submission.
pub struct CredentialBridge<A: IdentityAgent, S: ProofStore> {
    agent: A,
    store: Arc<S>,
    settings: BridgeSettings,
}

impl<A: IdentityAgent, S: ProofStore> CredentialBridge<A, S> {
    pub fn new(agent: A, store: Arc<S>, settings: BridgeSettings) -> Self {
        Self {
            agent,
            store,
            settings,
        }
    }

    /// DID the owner of `event` is credentialed under.
    pub fn subject_of(&self, event: &LockEvent) -> String {
        subject_for(&self.settings.did_method, event.owner_address)
    }

    /// Request a credential for the owner of `event` and persist it.
    pub async fn issue_credential(&self, event: &LockEvent) -> Result<Credential, IssuanceError> {
        event.validate()?;

        let request = CredentialRequest::for_lock(
            event,
            &self.settings.connection_id,
            self.subject_of(event),
            self.settings.credential_ttl.as_secs(),
        );

        let response = tokio::time::timeout(self.settings.request_timeout, self.agent.issue(&request))
            .await
            .map_err(|_| IssuanceError::Timeout(self.settings.request_timeout))??;
        let credential = response.into_credential(&request)?;

        self.store.put_credential(&credential).await?;
        tracing::info!(
            lock_id = %credential.lock_id,
            credential_id = %credential.credential_id,
            expires_at = credential.expires_at,
            "credential issued"
        );
        Ok(credential)
    }

    /// Check `presented` against the stored credential and the lock owner.
    /// Reads only; never marks anything consumed.
    pub async fn verify_credential(
        &self,
        presented: &Credential,
        expected_lock_id: &LockId,
        now: u64,
    ) -> Result<Verification, StoreError> {
        let Some(event) = self.store.get_lock_event(expected_lock_id).await? else {
            return Ok(Verification::Invalid);
        };
        let stored = self.store.get_credential(&presented.credential_id).await?;

        Ok(credential::verify_credential(
            presented,
            stored.as_ref(),
            expected_lock_id,
            &self.subject_of(&event),
            now,
        ))
    }
}
