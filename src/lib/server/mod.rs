pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::coordinator::RelayCoordinator;
use crate::ports::chain::ChainPort;
use crate::ports::identity::IdentityAgent;
use crate::ports::store::ProofStore;

use self::routes::{
    health_handler, list_handler, present_handler, relay_handler, retry_handler, AppState,
};

/// Operator API over the relay coordinator.
pub fn router<C, S, A>(coordinator: Arc<RelayCoordinator<C, S, A>>) -> Router
where
    C: ChainPort + 'static,
    S: ProofStore + 'static,
    A: IdentityAgent + 'static,
{
    let state = AppState { coordinator };
    Router::new()
        .route("/health", get(health_handler))
        .route("/relays", get(list_handler::<C, S, A>))
        .route("/relays/{lock_id}", get(relay_handler::<C, S, A>))
        .route("/relays/{lock_id}/retry", post(retry_handler::<C, S, A>))
        .route("/credentials/present", post(present_handler::<C, S, A>))
        .with_state(state)
}

/// Bind `addr` and serve the operator API until `shutdown` fires.
///
/// Returns the server task and the bound address (useful with port 0).
pub async fn start_server<C, S, A>(
    coordinator: Arc<RelayCoordinator<C, S, A>>,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(JoinHandle<()>, SocketAddr), ServerError>
where
    C: ChainPort + 'static,
    S: ProofStore + 'static,
    A: IdentityAgent + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    let bound_addr = listener.local_addr().map_err(|source| ServerError::Bind { addr, source })?;
    let app = router(coordinator);

    let handle = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "HTTP server stopped");
        }
    });

    tracing::info!(%bound_addr, "HTTP server listening");
    Ok((handle, bound_addr))
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    use super::routes::RelayDetail;
    use super::*;
    use crate::adapters::memory_store::InMemoryProofStore;
    use crate::adapters::mock_agent::MockIdentityAgent;
    use crate::adapters::mock_chain::MockChainPort;
    use crate::bridge::BridgeSettings;
    use crate::config::RouteConfig;
    use crate::coordinator::CoordinatorSettings;
    use crate::domain::lock::tests::sample_lock;
    use crate::domain::lock::{ChainId, LockId};
    use crate::domain::relay::{RelayRecord, RelayState};
    use crate::ports::{ChainCapability, Finality};

    type TestCoordinator = RelayCoordinator<MockChainPort, InMemoryProofStore, MockIdentityAgent>;

    fn coordinator(auto_present: bool) -> (Arc<TestCoordinator>, MockChainPort, InMemoryProofStore) {
        let target = MockChainPort::new("B", ChainCapability::Both);
        let store = InMemoryProofStore::new();
        let coordinator = RelayCoordinator::new(
            vec![MockChainPort::new("A", ChainCapability::Lock), target.clone()],
            vec![RouteConfig {
                source: ChainId::from("A"),
                target: ChainId::from("B"),
            }],
            store.clone(),
            MockIdentityAgent::new(),
            BridgeSettings::default(),
            CoordinatorSettings {
                finality_confirmations: 1,
                max_retry_attempts: 2,
                backoff_base: Duration::from_millis(1),
                backoff_max: Duration::from_millis(2),
                auto_present,
                ..CoordinatorSettings::default()
            },
        );
        (Arc::new(coordinator), target, store)
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: &Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn wait_for_state(store: &InMemoryProofStore, lock: &str, state: RelayState) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let record = store.get_relay_record(&LockId::from(lock)).await.unwrap();
            if record.is_some_and(|r| r.state == state) {
                return;
            }
            assert!(tokio::time::Instant::now() < deadline, "relay never reached {state}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_health() {
        let (coordinator, _, _) = coordinator(true);
        let (status, body) = send(router(coordinator), get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_relay_detail_and_not_found() {
        let (coordinator, _, _) = coordinator(true);
        coordinator.handle_lock(&sample_lock("L1")).await.unwrap();
        let app = router(coordinator);

        let (status, body) = send(app.clone(), get("/relays/L1")).await;
        assert_eq!(status, StatusCode::OK);
        let detail: RelayDetail = serde_json::from_value(body).unwrap();
        assert_eq!(detail.record.state, RelayState::UnlockConfirmed);
        assert_eq!(detail.lock.unwrap().lock_id, LockId::from("L1"));

        let (status, body) = send(app, get("/relays/missing")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("missing"));
    }

    #[tokio::test]
    async fn test_list_filters_by_state_label() {
        let (coordinator, _, _) = coordinator(true);
        coordinator.handle_lock(&sample_lock("L1")).await.unwrap();
        coordinator.record_lock(&sample_lock("L2")).await.unwrap();
        let app = router(coordinator);

        let (status, body) = send(app.clone(), get("/relays")).await;
        assert_eq!(status, StatusCode::OK);
        let pending: Vec<RelayRecord> = serde_json::from_value(body).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].lock_id, LockId::from("L2"));

        let (_, body) = send(app.clone(), get("/relays?state=unlock_confirmed")).await;
        let done: Vec<RelayRecord> = serde_json::from_value(body).unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].lock_id, LockId::from("L1"));

        let (status, _) = send(app, get("/relays?state=bogus")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_retry_endpoint() {
        let (coordinator, target, store) = coordinator(true);
        target.fail_next_submissions(2).await;
        let failed = coordinator.handle_lock(&sample_lock("L1")).await.unwrap();
        assert!(matches!(failed.state, RelayState::Failed { .. }));
        let app = router(coordinator);

        let (status, body) = send(app.clone(), post_json("/relays/L1/retry", &Value::Null)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["state"]["state"], "retrying");
        wait_for_state(&store, "L1", RelayState::UnlockConfirmed).await;

        let (status, _) = send(app, post_json("/relays/L1/retry", &Value::Null)).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_reverted_relay_cannot_be_retried() {
        let (coordinator, target, _) = coordinator(true);
        target.push_finality(Finality::Reverted).await;
        coordinator.handle_lock(&sample_lock("L1")).await.unwrap();

        let (status, body) = send(router(coordinator), post_json("/relays/L1/retry", &Value::Null)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("cannot be retried"));
    }

    #[tokio::test]
    async fn test_present_credential_endpoint() {
        let (coordinator, _, store) = coordinator(false);
        let parked = coordinator.handle_lock(&sample_lock("L1")).await.unwrap();
        assert_eq!(parked.state, RelayState::CredentialIssued);
        let credential = store
            .get_credential(parked.credential_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        let app = router(coordinator);

        let mut forged = serde_json::to_value(&credential).unwrap();
        forged["subject_identity"] = "did:ethr:0xbb".into();
        let (status, body) = send(app.clone(), post_json("/credentials/present", &forged)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("SubjectMismatch"));

        let presented = serde_json::to_value(&credential).unwrap();
        let (status, body) = send(app, post_json("/credentials/present", &presented)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["state"]["state"], "credential_verified");
        wait_for_state(&store, "L1", RelayState::UnlockConfirmed).await;
    }

    #[tokio::test]
    async fn test_served_over_tcp_until_shutdown() {
        let (coordinator, _, _) = coordinator(true);
        let shutdown = CancellationToken::new();
        let (handle, addr) = start_server(coordinator, "127.0.0.1:0".parse().unwrap(), shutdown.clone())
            .await
            .unwrap();

        let body: Value = reqwest::get(format!("http://{addr}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");

        shutdown.cancel();
        handle.await.unwrap();
    }
}
