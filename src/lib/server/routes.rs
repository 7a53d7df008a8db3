use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;

use crate::coordinator::{CoordinatorError, RelayCoordinator};
use crate::domain::credential::Credential;
use crate::domain::lock::{LockEvent, LockId};
use crate::domain::relay::RelayRecord;
use crate::ports::chain::ChainPort;
use crate::ports::identity::IdentityAgent;
use crate::ports::store::{ProofStore, StoreError};

/// Labels accepted by `GET /relays?state=`.
const STATE_LABELS: [&str; 8] = [
    "observed",
    "credential_requested",
    "credential_issued",
    "credential_verified",
    "unlock_submitted",
    "unlock_confirmed",
    "retrying",
    "failed",
];

/// Shared application state for axum route handlers.
pub struct AppState<C: ChainPort, S: ProofStore, A: IdentityAgent> {
    pub coordinator: Arc<RelayCoordinator<C, S, A>>,
}

impl<C: ChainPort, S: ProofStore, A: IdentityAgent> Clone for AppState<C, S, A> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
        }
    }
}

// ── Response types ──

#[derive(serde::Serialize, serde::Deserialize)]
pub struct Health {
    pub status: String,
}

#[derive(serde::Deserialize)]
pub struct ListQuery {
    pub state: Option<String>,
}

/// Response for GET /relays/{lock_id}: the relay record with its lock event.
#[derive(serde::Serialize, serde::Deserialize)]
pub struct RelayDetail {
    #[serde(flatten)]
    pub record: RelayRecord,
    pub lock: Option<LockEvent>,
}

// ── Route handlers ──

/// GET /health
pub async fn health_handler() -> Json<Health> {
    Json(Health {
        status: "ok".into(),
    })
}

/// GET /relays?state= lists records with the given state label, or every
/// non-terminal record without a filter.
pub async fn list_handler<C, S, A>(
    State(state): State<AppState<C, S, A>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<RelayRecord>>, AppError>
where
    C: ChainPort,
    S: ProofStore,
    A: IdentityAgent,
{
    let store = state.coordinator.store();
    let records = match query.state.as_deref() {
        Some(label) if STATE_LABELS.contains(&label) => store.list_by_label(label).await,
        Some(label) => return Err(AppError::BadRequest(format!("unknown state {label:?}"))),
        None => store.list_pending(None).await,
    }
    .map_err(CoordinatorError::from)?;
    Ok(Json(records))
}

/// GET /relays/{lock_id}
pub async fn relay_handler<C, S, A>(
    State(state): State<AppState<C, S, A>>,
    Path(lock_id): Path<String>,
) -> Result<Json<RelayDetail>, AppError>
where
    C: ChainPort,
    S: ProofStore,
    A: IdentityAgent,
{
    let lock_id = LockId::new(lock_id);
    let store = state.coordinator.store();
    let record = store
        .get_relay_record(&lock_id)
        .await
        .map_err(CoordinatorError::from)?
        .ok_or_else(|| AppError::NotFound(format!("no relay for lock {lock_id}")))?;
    let lock = store
        .get_lock_event(&lock_id)
        .await
        .map_err(CoordinatorError::from)?;

    Ok(Json(RelayDetail { record, lock }))
}

/// POST /relays/{lock_id}/retry requeues a failed relay and drives it in
/// the background.
pub async fn retry_handler<C, S, A>(
    State(state): State<AppState<C, S, A>>,
    Path(lock_id): Path<String>,
) -> Result<(StatusCode, Json<RelayRecord>), AppError>
where
    C: ChainPort + 'static,
    S: ProofStore + 'static,
    A: IdentityAgent + 'static,
{
    let lock_id = LockId::new(lock_id);
    let record = state.coordinator.retry_failed(&lock_id).await?;
    state.coordinator.dispatch(lock_id);
    Ok((StatusCode::ACCEPTED, Json(record)))
}

/// POST /credentials/present accepts a holder presentation for a relay
/// waiting in `credential_issued`.
pub async fn present_handler<C, S, A>(
    State(state): State<AppState<C, S, A>>,
    Json(credential): Json<Credential>,
) -> Result<(StatusCode, Json<RelayRecord>), AppError>
where
    C: ChainPort + 'static,
    S: ProofStore + 'static,
    A: IdentityAgent + 'static,
{
    let record = state.coordinator.present_credential(&credential).await?;
    state.coordinator.dispatch(record.lock_id.clone());
    Ok((StatusCode::ACCEPTED, Json(record)))
}

// ── Error handling ──

/// Application error type that maps to HTTP status codes.
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl From<CoordinatorError> for AppError {
    fn from(e: CoordinatorError) -> Self {
        match &e {
            CoordinatorError::NotFound(_)
            | CoordinatorError::Store(StoreError::RecordNotFound(_) | StoreError::LockNotFound(_)) => {
                AppError::NotFound(e.to_string())
            }
            CoordinatorError::NotRetryable { .. }
            | CoordinatorError::NotAwaitingCredential { .. }
            | CoordinatorError::Busy(_)
            | CoordinatorError::IllegalTransition { .. }
            | CoordinatorError::Store(StoreError::StaleState { .. }) => AppError::Conflict(e.to_string()),
            CoordinatorError::CredentialRejected(_) | CoordinatorError::InvalidLock(_) => {
                AppError::BadRequest(e.to_string())
            }
            _ => AppError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, msg) = match self {
            AppError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            AppError::Conflict(m) => (StatusCode::CONFLICT, m),
            AppError::Internal(m) => {
                tracing::error!(error = %m, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, m)
            }
        };
        (status, Json(serde_json::json!({ "error": msg }))).into_response()
    }
}
