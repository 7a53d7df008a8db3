use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::domain::credential::{CredentialRequest, CredentialResponse};
use crate::domain::unix_now;
use crate::ports::identity::{IdentityAgent, IdentityError};

/// One credential exchange as reported by the agent's admin API.
#[derive(Debug, Clone, Deserialize)]
struct ExchangeRecord {
    credential_exchange_id: String,
    #[serde(default)]
    thread_id: Option<String>,
    state: String,
    #[serde(default)]
    credential: Option<CredentialResponse>,
}

impl ExchangeRecord {
    fn is_complete(&self) -> bool {
        matches!(self.state.as_str(), "credential_acked" | "done")
    }

    fn is_failed(&self) -> bool {
        matches!(self.state.as_str(), "abandoned" | "deleted")
    }

    /// Whether a later request for the same thread may reuse this exchange.
    fn is_reusable(&self, now: u64) -> bool {
        !self.is_failed() && self.credential.as_ref().map_or(true, |c| c.expires_at >= now)
    }
}

#[derive(Debug, Deserialize)]
struct ExchangeList {
    results: Vec<ExchangeRecord>,
}

/// HTTP client for the identity agent's `issue-credential` admin API.
///
/// The lock id doubles as the exchange thread id, so a retry after a crash
/// picks up the exchange already in flight instead of offering twice.
#[derive(Clone)]
pub struct AgentClient {
    http: reqwest::Client,
    base_url: String,
    poll_interval: Duration,
}

impl AgentClient {
    pub fn new(
        base_url: impl Into<String>,
        request_timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Self, IdentityError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| IdentityError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            poll_interval,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/issue-credential/{path}", self.base_url)
    }

    async fn find_exchange(&self, thread_id: &str) -> Result<Option<ExchangeRecord>, IdentityError> {
        let response = self
            .http
            .get(self.url("records"))
            .query(&[("thread_id", thread_id)])
            .send()
            .await
            .map_err(transport)?;
        let list: ExchangeList = read_json(response).await?;

        Ok(list
            .results
            .into_iter()
            .filter(|r| r.thread_id.as_deref() == Some(thread_id))
            .find(|r| r.is_reusable(unix_now())))
    }

    async fn send_offer(&self, request: &CredentialRequest) -> Result<ExchangeRecord, IdentityError> {
        let response = self
            .http
            .post(self.url("send"))
            .json(request)
            .send()
            .await
            .map_err(transport)?;
        read_json(response).await
    }

    async fn fetch_exchange(&self, exchange_id: &str) -> Result<ExchangeRecord, IdentityError> {
        let response = self
            .http
            .get(self.url(&format!("records/{exchange_id}")))
            .send()
            .await
            .map_err(transport)?;
        read_json(response).await
    }
}

fn transport(e: reqwest::Error) -> IdentityError {
    IdentityError::Transport(e.to_string())
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, IdentityError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(IdentityError::Status {
            status: status.as_u16(),
            body,
        });
    }
    let bytes = response.bytes().await.map_err(transport)?;
    serde_json::from_slice(&bytes).map_err(|e| IdentityError::Malformed(e.to_string()))
}

impl IdentityAgent for AgentClient {
    async fn issue(&self, request: &CredentialRequest) -> Result<CredentialResponse, IdentityError> {
        let thread_id = request.lock_id.as_str();
        let mut record = match self.find_exchange(thread_id).await? {
            Some(existing) => {
                tracing::debug!(
                    lock_id = %request.lock_id,
                    exchange_id = %existing.credential_exchange_id,
                    state = %existing.state,
                    "resuming credential exchange"
                );
                existing
            }
            None => self.send_offer(request).await?,
        };

        loop {
            if record.is_complete() {
                return record.credential.ok_or_else(|| {
                    IdentityError::Malformed(format!(
                        "exchange {} completed without a credential",
                        record.credential_exchange_id
                    ))
                });
            }
            if record.is_failed() {
                return Err(IdentityError::ExchangeFailed {
                    exchange_id: record.credential_exchange_id,
                    state: record.state,
                });
            }

            tokio::time::sleep(self.poll_interval).await;
            record = self.fetch_exchange(&record.credential_exchange_id).await?;
        }
    }
}
