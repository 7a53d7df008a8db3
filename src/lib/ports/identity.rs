use std::future::Future;

use crate::domain::credential::{CredentialRequest, CredentialResponse};

/// Port for the external identity agent that issues lock credentials.
///
/// Implementations:
/// - `AgentClient` (HTTP, `{admin_url}/issue-credential/*`)
/// - `MockIdentityAgent` for tests and the demo
pub trait IdentityAgent: Send + Sync {
    /// Run the offer/issue lifecycle for `request` and return the issued
    /// credential. Re-issuing for a `lock_id` whose exchange already exists
    /// should resume that exchange rather than start a new one.
    fn issue(
        &self,
        request: &CredentialRequest,
    ) -> impl Future<Output = Result<CredentialResponse, IdentityError>> + Send;
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("identity agent unreachable: {0}")]
    Transport(String),

    #[error("identity agent returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("credential exchange {exchange_id} ended in state {state}")]
    ExchangeFailed { exchange_id: String, state: String },

    #[error("malformed agent response: {0}")]
    Malformed(String),
}

impl IdentityError {
    /// Server-side failures and transport errors are worth retrying;
    /// malformed payloads and 4xx answers are not.
    pub fn is_transient(&self) -> bool {
        match self {
            IdentityError::Transport(_) | IdentityError::ExchangeFailed { .. } => true,
            IdentityError::Status { status, .. } => *status >= 500 || *status == 429,
            IdentityError::Malformed(_) => false,
        }
    }
}
