use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use wayfarer_core::config::SyncConfig;
use wayfarer_core::interfaces::status_channel;
use wayfarer_db::mock::MockConversationStore;
use wayfarer_db::{ConversationStore, Utterance};
use wayfarer_sync::{
    HttpRemoteStore, InMemoryRemoteStore, RemoteError, RemoteStore, SyncCoordinator, SyncOutcome,
    UpsertOutcome,
};

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[derive(Deserialize)]
struct UpsertBody {
    base_version: u64,
    utterance: Utterance,
}

fn outcome_response(outcome: UpsertOutcome) -> Response {
    match outcome {
        UpsertOutcome::Ack { version } => Json(json!({ "version": version })).into_response(),
        UpsertOutcome::Conflict { remote_version } => {
            (StatusCode::CONFLICT, Json(json!({ "version": remote_version }))).into_response()
        }
    }
}

/// Document store server backed by the in-memory remote.
fn document_server(backend: Arc<InMemoryRemoteStore>) -> Router {
    async fn upsert(
        State(backend): State<Arc<InMemoryRemoteStore>>,
        Path((cid, uid)): Path<(String, String)>,
        Json(body): Json<UpsertBody>,
    ) -> Response {
        match backend.upsert(&cid, &uid, &body.utterance, body.base_version).await {
            Ok(outcome) => outcome_response(outcome),
            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        }
    }

    async fn delete(
        State(backend): State<Arc<InMemoryRemoteStore>>,
        Path((cid, uid)): Path<(String, String)>,
        Query(params): Query<HashMap<String, u64>>,
    ) -> Response {
        let base = params.get("base_version").copied().unwrap_or_default();
        match backend.delete(&cid, &uid, base).await {
            Ok(outcome) => outcome_response(outcome),
            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        }
    }

    async fn fetch(
        State(backend): State<Arc<InMemoryRemoteStore>>,
        Path(cid): Path<String>,
        Query(params): Query<HashMap<String, u64>>,
    ) -> Response {
        let since = params.get("since").copied().unwrap_or_default();
        match backend.fetch(&cid, since).await {
            Ok(delta) => Json(delta).into_response(),
            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        }
    }

    Router::new()
        .route("/conversations/:cid/utterances/:uid", put(upsert).delete(delete))
        .route("/conversations/:cid/utterances", get(fetch))
        .with_state(backend)
}

#[tokio::test]
async fn coordinator_syncs_through_http() {
    let backend = Arc::new(InMemoryRemoteStore::new());
    let base = serve(document_server(backend.clone())).await;

    let store = Arc::new(MockConversationStore::new());
    let mine = Utterance::user("trip", "Where can I buy a SIM card?");
    store.append("trip", mine.clone()).await.unwrap();
    let theirs = Utterance::user("trip", "Sent from the laptop");
    backend.insert_remote(theirs.clone());

    let remote = Arc::new(HttpRemoteStore::new(&base).unwrap());
    let (tx, _rx) = status_channel(16);
    let coordinator = SyncCoordinator::new(&SyncConfig::default(), store.clone(), remote, tx);

    let outcome = coordinator.sync_now("trip").await.unwrap();
    assert!(matches!(outcome, SyncOutcome::Synced { pushed: 1, pulled: 1, .. }), "{outcome:?}");

    let conversation = store.read("trip").await.unwrap();
    assert!(conversation.contains(&mine.id));
    assert!(conversation.contains(&theirs.id));
    assert!(!conversation.dirty);
    assert_eq!(backend.utterances("trip").len(), 2);

    store.delete_utterance("trip", &mine.id).await.unwrap();
    coordinator.sync_now("trip").await.unwrap();
    assert_eq!(backend.utterances("trip"), vec![theirs]);
}

#[tokio::test]
async fn conflict_status_carries_remote_version() {
    let app = Router::new().route(
        "/conversations/:cid/utterances/:uid",
        put(|| async { (StatusCode::CONFLICT, Json(json!({"version": 7}))) }),
    );
    let remote = HttpRemoteStore::new(&serve(app).await).unwrap();
    let u = Utterance::user("trip", "hi");
    let outcome = remote.upsert("trip", &u.id, &u, 3).await.unwrap();
    assert_eq!(outcome, UpsertOutcome::Conflict { remote_version: 7 });
}

#[tokio::test]
async fn server_errors_are_transient_and_client_errors_permanent() {
    let app = Router::new()
        .route(
            "/conversations/busy/utterances/:uid",
            put(|| async { (StatusCode::SERVICE_UNAVAILABLE, "maintenance") }),
        )
        .route(
            "/conversations/huge/utterances/:uid",
            put(|| async { (StatusCode::PAYLOAD_TOO_LARGE, "too big") }),
        );
    let remote = HttpRemoteStore::new(&serve(app).await).unwrap();

    let u = Utterance::user("busy", "hi");
    let err = remote.upsert("busy", &u.id, &u, 0).await.unwrap_err();
    assert!(err.is_retriable());
    assert!(err.to_string().contains("maintenance"));

    let u = Utterance::user("huge", "hi");
    let err = remote.upsert("huge", &u.id, &u, 0).await.unwrap_err();
    assert!(matches!(err, RemoteError::Rejected(ref m) if m.contains("413")));
}

#[tokio::test]
async fn malformed_body_is_invalid_response() {
    let app = Router::new().route(
        "/conversations/:cid/utterances",
        get(|| async { "definitely not json" }),
    );
    let remote = HttpRemoteStore::new(&serve(app).await).unwrap();
    assert!(matches!(
        remote.fetch("trip", 0).await,
        Err(RemoteError::InvalidResponse(_))
    ));
}

#[tokio::test]
async fn missing_remote_conversation_is_empty_delta() {
    let remote = HttpRemoteStore::new(&serve(Router::new()).await).unwrap();
    let delta = remote.fetch("nobody", 0).await.unwrap();
    assert_eq!(delta.version, 0);
    assert!(delta.utterances.is_empty());
}

#[tokio::test]
async fn unreachable_remote_is_retriable() {
    let remote = HttpRemoteStore::new("http://127.0.0.1:9").unwrap();
    let err = tokio::time::timeout(Duration::from_secs(5), remote.fetch("trip", 0))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, RemoteError::Unavailable(_)));
}
