use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::domain::credential::{CredentialRequest, CredentialResponse};
use crate::domain::lock::LockId;
use crate::domain::unix_now;
use crate::ports::identity::{IdentityAgent, IdentityError};

#[derive(Default)]
struct MockAgentState {
    /// lock id -> credential issued for it (re-requests return the same one)
    issued: HashMap<LockId, CredentialResponse>,
    issue_calls: usize,
    fail_next: u32,
    reject_next: u32,
    delay: Option<Duration>,
}

/// Identity agent that issues credentials in-process.
///
/// Mirrors the thread-id idempotency of the real agent: asking twice for the
/// same lock returns the credential issued the first time, until it expires.
/// Clones share state.
#[derive(Clone, Default)]
pub struct MockIdentityAgent {
    state: Arc<Mutex<MockAgentState>>,
}

impl MockIdentityAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `issue` calls received, including failed ones.
    pub async fn issue_calls(&self) -> usize {
        self.state.lock().await.issue_calls
    }

    /// Number of locks holding an issued credential.
    pub async fn issued_count(&self) -> usize {
        self.state.lock().await.issued.len()
    }

    /// Fail the next `n` calls with a transport error.
    pub async fn fail_next(&self, n: u32) {
        self.state.lock().await.fail_next = n;
    }

    /// Answer the next `n` calls with a 400, as an agent refusing the claims would.
    pub async fn reject_next(&self, n: u32) {
        self.state.lock().await.reject_next = n;
    }

    /// Delay every answer, to exercise request deadlines.
    pub async fn set_delay(&self, delay: Duration) {
        self.state.lock().await.delay = Some(delay);
    }
}

impl IdentityAgent for MockIdentityAgent {
    async fn issue(&self, request: &CredentialRequest) -> Result<CredentialResponse, IdentityError> {
        let delay = {
            let mut state = self.state.lock().await;
            state.issue_calls += 1;
            if state.fail_next > 0 {
                state.fail_next -= 1;
                return Err(IdentityError::Transport("mock: agent unreachable".into()));
            }
            if state.reject_next > 0 {
                state.reject_next -= 1;
                return Err(IdentityError::Status {
                    status: 400,
                    body: "claims rejected".into(),
                });
            }
            state.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let now = unix_now();
        let mut state = self.state.lock().await;
        if let Some(existing) = state.issued.get(&request.lock_id) {
            if existing.expires_at >= now {
                return Ok(existing.clone());
            }
        }

        let response = CredentialResponse {
            credential_id: format!("cred-{}", state.issue_calls),
            lock_id: request.lock_id.clone(),
            subject_identity: request.subject_identity.clone(),
            issued_at: now,
            expires_at: now + request.ttl_secs.max(1),
        };
        state.issued.insert(request.lock_id.clone(), response.clone());
        Ok(response)
    }
}
