//! Sync API endpoints
//!
//! Every endpoint acts on behalf of the caller named in `X-User-Id`.

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    routing::{get, post},
    Json, Router,
};

use crate::auth::Identity;
use crate::error::Result;
use crate::state::AppState;
use crate::sync::{
    BatchQuery, BatchRequest, BatchResponse, BatchSession, ConflictRecord, ConflictsQuery,
    FullSyncRequest, FullSyncResponse, PullQuery, PullResponse, PushRequest, PushResponse,
    ResolveRequest, ResolveResponse, StatusQuery, SyncStatus,
};

type JsonBody<T> = std::result::Result<Json<T>, JsonRejection>;
type QueryParams<T> = std::result::Result<Query<T>, QueryRejection>;

/// Create the sync router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/push", post(push_changes))
        .route("/pull", get(pull_changes))
        .route("/sync", post(full_sync))
        .route("/status", get(sync_status))
        .route("/resolve", post(resolve_conflict))
        .route("/batch", post(push_batch).get(get_batch))
        .route("/conflicts", get(list_conflicts))
}

/// Push local changes to server
async fn push_changes(
    State(state): State<AppState>,
    identity: Identity,
    body: JsonBody<PushRequest>,
) -> Result<Json<PushResponse>> {
    let Json(req) = body?;
    let response = state
        .sync()
        .push(&identity.user_id, &req.device_id, req.entities)
        .await?;
    Ok(Json(response))
}

/// Pull changes since the client's cursor
async fn pull_changes(
    State(state): State<AppState>,
    identity: Identity,
    query: QueryParams<PullQuery>,
) -> Result<Json<PullResponse>> {
    let Query(query) = query?;
    let response = state.sync().pull(&identity.user_id, &query).await?;
    Ok(Json(response))
}

/// Push then pull in one round trip
async fn full_sync(
    State(state): State<AppState>,
    identity: Identity,
    body: JsonBody<FullSyncRequest>,
) -> Result<Json<FullSyncResponse>> {
    let Json(req) = body?;
    let response = state.sync().full_sync(&identity.user_id, req).await?;
    Ok(Json(response))
}

/// Sync status for one device
async fn sync_status(
    State(state): State<AppState>,
    identity: Identity,
    query: QueryParams<StatusQuery>,
) -> Result<Json<SyncStatus>> {
    let Query(query) = query?;
    let status = state
        .sync()
        .status(&identity.user_id, &query.device_id)
        .await?;
    Ok(Json(status))
}

/// Settle a queued conflict
async fn resolve_conflict(
    State(state): State<AppState>,
    identity: Identity,
    body: JsonBody<ResolveRequest>,
) -> Result<Json<ResolveResponse>> {
    let Json(req) = body?;
    let response = state.sync().resolve(&identity.user_id, req).await?;
    Ok(Json(response))
}

/// Accept one chunk of a batched transfer
async fn push_batch(
    State(state): State<AppState>,
    identity: Identity,
    body: JsonBody<BatchRequest>,
) -> Result<Json<BatchResponse>> {
    let Json(req) = body?;
    let response = state.sync().accept_batch(&identity.user_id, req).await?;
    Ok(Json(response))
}

/// Stored progress of a batched transfer
async fn get_batch(
    State(state): State<AppState>,
    identity: Identity,
    query: QueryParams<BatchQuery>,
) -> Result<Json<BatchSession>> {
    let Query(query) = query?;
    let session = state
        .sync()
        .batch_session(&identity.user_id, &query.batch_id)
        .await?;
    Ok(Json(session))
}

/// Unresolved conflicts of the caller
async fn list_conflicts(
    State(state): State<AppState>,
    identity: Identity,
    query: QueryParams<ConflictsQuery>,
) -> Result<Json<Vec<ConflictRecord>>> {
    let Query(query) = query?;
    let conflicts = state
        .sync()
        .conflicts(&identity.user_id, query.device_id.as_deref())
        .await?;
    Ok(Json(conflicts))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{header, Method, Request, StatusCode},
        Router,
    };
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Value};
    use sqlx::SqlitePool;
    use tower::ServiceExt;

    use crate::auth::{StaticTenantResolver, USER_ID_HEADER};
    use crate::clock::ManualClock;
    use crate::config::Config;
    use crate::db::create_memory_pool;
    use crate::routes;
    use crate::state::AppState;
    use crate::sync::SyncCoordinator;

    async fn test_app() -> Router {
        test_app_with_pool().await.0
    }

    async fn test_app_with_pool() -> (Router, SqlitePool) {
        let config = Config::default();
        let pool = create_memory_pool().await.unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 4, 1, 8, 0, 0).unwrap(),
        ));
        let tenants = Arc::new(
            StaticTenantResolver::new()
                .with_member("alice", "acme")
                .with_member("bob", "acme"),
        );
        let sync = SyncCoordinator::new(pool.clone(), clock, tenants, config.sync);
        (routes::app(AppState::new(pool.clone(), sync)), pool)
    }

    async fn send(
        app: &Router,
        method: Method,
        uri: &str,
        user: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            request = request.header(USER_ID_HEADER, user);
        }
        let request = match body {
            Some(body) => request
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn create_task(client_id: &str, title: &str) -> Value {
        json!({
            "type": "task",
            "operation": "create",
            "client_id": client_id,
            "data": { "titolo": title }
        })
    }

    #[tokio::test]
    async fn test_health() {
        let app = test_app().await;

        for uri in ["/health", "/api/v1/health"] {
            let (status, body) = send(&app, Method::GET, uri, None, None).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["status"], "healthy");
            assert_eq!(body["database"], "ok");
        }
    }

    #[tokio::test]
    async fn test_health_reports_unreachable_database() {
        let (app, pool) = test_app_with_pool().await;
        pool.close().await;

        let (status, body) = send(&app, Method::GET, "/health", None, None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["database"], "unavailable");
    }

    #[tokio::test]
    async fn test_missing_identity_is_unauthorized() {
        let app = test_app().await;

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/v1/sync/push",
            None,
            Some(json!({ "device_id": "phone", "entities": [] })),
        )
        .await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("X-User-Id"));
    }

    #[tokio::test]
    async fn test_malformed_push_is_bad_request() {
        let app = test_app().await;

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/v1/sync/push",
            Some("alice"),
            Some(json!({ "device_id": "phone", "entities": [{ "type": "folder" }] })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (status, _) = send(
            &app,
            Method::POST,
            "/api/v1/sync/push",
            Some("alice"),
            Some(json!({
                "device_id": "phone",
                "entities": [{
                    "type": "task",
                    "operation": "create",
                    "client_id": "c1",
                    "data": { "titolo": "x", "colore": "rosso" }
                }]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_push_then_pull() {
        let app = test_app().await;

        let (status, pushed) = send(
            &app,
            Method::POST,
            "/api/v1/sync/push",
            Some("alice"),
            Some(json!({
                "device_id": "phone",
                "entities": [create_task("c1", "Draft report")]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let result = &pushed["results"][0];
        assert_eq!(result["status"], "success");
        assert_eq!(result["client_id"], "c1");
        assert_eq!(result["version"], 1);
        let server_id = result["server_id"].as_str().unwrap().to_string();

        let (status, pulled) = send(
            &app,
            Method::GET,
            "/api/v1/sync/pull?last_sync=null&device_id=laptop",
            Some("bob"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(pulled["has_more"], false);
        assert!(pulled["timestamp"].is_string());
        let task = &pulled["data"]["tasks"][0];
        assert_eq!(task["server_id"], server_id.as_str());
        assert_eq!(task["version"], 1);
        assert_eq!(task["type"], "task");
        assert_eq!(task["titolo"], "Draft report");
        assert_eq!(pulled["data"]["eventi"], json!([]));
        assert_eq!(pulled["data"]["documenti"], json!([]));
    }

    #[tokio::test]
    async fn test_pull_rejects_bad_cursor() {
        let app = test_app().await;

        let (status, body) = send(
            &app,
            Method::GET,
            "/api/v1/sync/pull?last_sync=yesterday",
            Some("alice"),
            None,
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_conflict_resolution_flow() {
        let app = test_app().await;

        let (_, created) = send(
            &app,
            Method::POST,
            "/api/v1/sync/push",
            Some("alice"),
            Some(json!({ "device_id": "phone", "entities": [create_task("c1", "v1")] })),
        )
        .await;
        let server_id = created["results"][0]["server_id"].as_str().unwrap().to_string();

        let update = |version: i64, title: &str| {
            json!({
                "type": "task",
                "operation": "update",
                "client_id": "c1",
                "server_id": server_id,
                "version": version,
                "data": { "titolo": title }
            })
        };

        send(
            &app,
            Method::POST,
            "/api/v1/sync/push",
            Some("alice"),
            Some(json!({ "device_id": "phone", "entities": [update(1, "v2")] })),
        )
        .await;

        let (status, pushed) = send(
            &app,
            Method::POST,
            "/api/v1/sync/push",
            Some("bob"),
            Some(json!({ "device_id": "laptop", "entities": [update(1, "bob's edit")] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let conflict = &pushed["conflicts"][0];
        assert_eq!(conflict["status"], "conflict");
        assert_eq!(conflict["server_version"], 2);
        assert_eq!(conflict["client_version"], 1);
        assert_eq!(conflict["type"], "task");
        let conflict_id = conflict["conflict_id"].as_str().unwrap().to_string();

        let (status, listed) = send(
            &app,
            Method::GET,
            "/api/v1/sync/conflicts?device_id=laptop",
            Some("bob"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let (status, status_body) = send(
            &app,
            Method::GET,
            "/api/v1/sync/status?device_id=laptop",
            Some("bob"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(status_body["pending_items"], 1);
        assert_eq!(status_body["stats_by_type"]["task"]["conflict"], 1);

        let resolve = json!({ "conflict_id": conflict_id, "resolution": "client_wins" });
        let (status, resolved) = send(
            &app,
            Method::POST,
            "/api/v1/sync/resolve",
            Some("bob"),
            Some(resolve.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(resolved["resolved"], true);
        assert_eq!(resolved["final_data"]["titolo"], "bob's edit");
        assert_eq!(resolved["version"], 3);

        let (status, again) = send(
            &app,
            Method::POST,
            "/api/v1/sync/resolve",
            Some("bob"),
            Some(resolve),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(again["success"], false);
    }

    #[tokio::test]
    async fn test_resolve_unknown_conflict() {
        let app = test_app().await;

        let (status, _) = send(
            &app,
            Method::POST,
            "/api/v1/sync/resolve",
            Some("alice"),
            Some(json!({ "conflict_id": "missing", "resolution": "server_wins" })),
        )
        .await;

        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_status_requires_device() {
        let app = test_app().await;

        let (status, _) = send(&app, Method::GET, "/api/v1/sync/status", Some("alice"), None).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_batch_endpoints() {
        let app = test_app().await;

        let chunk = |number: i64| {
            json!({
                "batch_id": "import-1",
                "batch_number": number,
                "total_batches": 2,
                "device_id": "phone",
                "entities": [create_task(&format!("c{}", number), "imported")]
            })
        };

        let (status, first) = send(
            &app,
            Method::POST,
            "/api/v1/sync/batch",
            Some("alice"),
            Some(chunk(1)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["processed"], 1);
        assert_eq!(first["is_complete"], false);

        let (_, last) = send(
            &app,
            Method::POST,
            "/api/v1/sync/batch",
            Some("alice"),
            Some(chunk(2)),
        )
        .await;
        assert_eq!(last["is_complete"], true);

        let (status, session) = send(
            &app,
            Method::GET,
            "/api/v1/sync/batch?batch_id=import-1",
            Some("alice"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(session["entities_count"], 2);
        assert_eq!(session["status"], "completed");

        let (status, _) = send(
            &app,
            Method::GET,
            "/api/v1/sync/batch?batch_id=import-1",
            Some("bob"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
