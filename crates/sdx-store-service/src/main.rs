use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use clap::Parser;
use sdx_store_api::{StoreApi, StoreConfig};
use sdx_store_core::{SearchParams, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Clone)]
struct ServiceState {
    api: Arc<StoreApi>,
}

#[derive(Debug)]
struct ServiceError {
    status: StatusCode,
    message: String,
}

impl ServiceError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, message: message.into() }
    }

    fn not_found() -> Self {
        Self { status: StatusCode::NOT_FOUND, message: "not found".to_owned() }
    }

    fn server(message: impl Into<String>) -> Self {
        Self { status: StatusCode::INTERNAL_SERVER_ERROR, message: message.into() }
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        if err.is_client_error() {
            Self::bad_request(err.to_string())
        } else {
            Self::server(err.to_string())
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let body = json!({
            "status": self.status.as_u16(),
            "message": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

#[derive(Debug, Clone, Serialize)]
struct SaveResult {
    result: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
struct QueueRequest {
    id: String,
}

#[derive(Debug, Parser)]
#[command(name = "sdx-store-service")]
#[command(about = "HTTP service persisting survey submissions")]
struct Args {
    /// Database path; overrides SDX_STORE_DB when given.
    #[arg(long)]
    db: Option<PathBuf>,
    #[arg(long, default_value = "127.0.0.1:5000")]
    bind: SocketAddr,
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/responses", post(save_response).get(search_responses))
        .route("/responses/old", delete(delete_old_responses))
        .route("/responses/:tx_id", get(get_response))
        .route("/invalid-responses", get(get_invalid_responses))
        .route("/queue", post(requeue))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = StoreConfig::from_env()?;
    if let Some(db) = args.db {
        config.db_path = db;
    }

    let api = StoreApi::new(&config);
    api.ensure_schema()?;
    tracing::info!(db = %config.db_path.display(), bind = %args.bind, "starting server");

    let state = ServiceState { api: Arc::new(api) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthcheck(State(state): State<ServiceState>) -> Result<Json<Value>, ServiceError> {
    state.api.health_check()?;
    Ok(Json(json!({"status": "OK"})))
}

async fn save_response(
    State(state): State<ServiceState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<SaveResult>, ServiceError> {
    let Json(payload) =
        payload.map_err(|err| ServiceError::bad_request(format!("invalid request body: {err}")))?;

    let outcome = state.api.save_response(payload)?;
    if outcome.notified == Some(false) {
        return Err(ServiceError::server("unable to queue notification"));
    }
    if outcome.valid == Some(false) {
        return Ok(Json(SaveResult { result: "false" }));
    }
    Ok(Json(SaveResult { result: "ok" }))
}

async fn get_response(
    State(state): State<ServiceState>,
    Path(tx_id): Path<String>,
) -> Result<Json<sdx_store_core::SurveyResponse>, ServiceError> {
    match state.api.get_response(&tx_id)? {
        Some(row) => Ok(Json(row)),
        None => Err(ServiceError::not_found()),
    }
}

async fn search_responses(
    State(state): State<ServiceState>,
    params: Result<Query<SearchParams>, QueryRejection>,
) -> Result<Json<sdx_store_api::SearchResultPage>, ServiceError> {
    let Query(params) = params
        .map_err(|err| ServiceError::bad_request(format!("invalid query parameters: {err}")))?;
    Ok(Json(state.api.search(params)?))
}

async fn get_invalid_responses(
    State(state): State<ServiceState>,
) -> Result<Json<Vec<sdx_store_core::SurveyResponse>>, ServiceError> {
    Ok(Json(state.api.filter_by_validity(Some(false))?))
}

async fn requeue(
    State(state): State<ServiceState>,
    request: Result<Json<QueueRequest>, JsonRejection>,
) -> Result<Json<SaveResult>, ServiceError> {
    let Json(request) =
        request.map_err(|err| ServiceError::bad_request(format!("invalid request body: {err}")))?;

    match state.api.requeue(&request.id)? {
        Some(true) => Ok(Json(SaveResult { result: "ok" })),
        Some(false) => Err(ServiceError::server("unable to queue notification")),
        None => Err(ServiceError::not_found()),
    }
}

async fn delete_old_responses(
    State(state): State<ServiceState>,
) -> Result<Json<Value>, ServiceError> {
    let deleted = state.api.delete_old_responses()?;
    Ok(Json(json!({"deleted": deleted})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use http::Request;
    use sdx_store_core::TxId;
    use sdx_store_notify::Publisher;
    use tower::ServiceExt;

    const TX_A: &str = "9bca1e45-310b-4677-bb86-255da5c7eb34";
    const TX_B: &str = "e7d45533-71a9-44fe-8077-621d1ab423cd";

    struct StubPublisher {
        accept: bool,
    }

    impl Publisher for StubPublisher {
        fn publish(&self, _queue: &str, _message: &str, _tx_id: &TxId) -> bool {
            self.accept
        }
    }

    fn temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("sdx-store-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn test_router(accept_notifications: bool) -> (Router, PathBuf) {
        let path = temp_db_path();
        let config = StoreConfig::new(&path);
        let api = StoreApi::with_publisher(
            &config,
            Box::new(StubPublisher { accept: accept_notifications }),
        );
        match api.ensure_schema() {
            Ok(()) => {}
            Err(err) => panic!("schema creation failed: {err}"),
        }
        (app(ServiceState { api: Arc::new(api) }), path)
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .method("GET")
            .body(Body::empty())
            .unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    fn post_json(uri: &str, body: String) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    async fn send(router: Router, request: Request<Body>) -> Response {
        match router.oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    async fn response_json(response: Response) -> Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}"),
        }
    }

    fn survey(tx_id: &str, survey_id: &str) -> Value {
        json!({
            "type": "uk.gov.ons.edc.eq:surveyresponse",
            "tx_id": tx_id,
            "survey_id": survey_id,
            "collection": {"period": "0616"},
            "metadata": {"user_id": "789473423", "ru_ref": "1234570071A"},
            "data": {"1": "2", "2": "4"}
        })
    }

    #[tokio::test]
    async fn healthcheck_reports_ok() {
        let (router, path) = test_router(true);
        let response = send(router, get_request("/healthcheck")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(value, json!({"status": "OK"}));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn stored_submission_reads_back_by_id() {
        let (router, path) = test_router(true);
        let payload = survey(TX_A, "194825");

        let response =
            send(router.clone(), post_json("/responses", payload.to_string())).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_json(response).await, json!({"result": "ok"}));

        let response = send(router, get_request(&format!("/responses/{TX_A}"))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(value.get("tx_id"), Some(&json!(TX_A)));
        assert_eq!(value.get("valid"), Some(&Value::Null));
        assert_eq!(value.get("data"), Some(&payload));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn invalid_flagged_submission_returns_false_and_lists() {
        let (router, path) = test_router(true);
        let mut payload = survey(TX_A, "194825");
        payload["invalid"] = json!(true);

        let response =
            send(router.clone(), post_json("/responses", payload.to_string())).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_json(response).await, json!({"result": "false"}));

        let response = send(router, get_request("/invalid-responses")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        let rows = match value.as_array() {
            Some(rows) => rows,
            None => panic!("expected a JSON array, got {value}"),
        };
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("tx_id"), Some(&json!(TX_A)));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn malformed_bodies_and_ids_are_client_errors() {
        let (router, path) = test_router(true);

        let response =
            send(router.clone(), post_json("/responses", "not json".to_owned())).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let missing_id = json!({"survey_id": "194825"});
        let response =
            send(router.clone(), post_json("/responses", missing_id.to_string())).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = send(router.clone(), get_request("/responses/x")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = send(router, get_request(&format!("/responses/{TX_B}"))).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn search_validates_parameters_and_pages() {
        let (router, path) = test_router(true);
        for (tx_id, survey_id) in [(TX_A, "194825"), (TX_B, "194826")] {
            let response = send(
                router.clone(),
                post_json("/responses", survey(tx_id, survey_id).to_string()),
            )
            .await;
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = send(router.clone(), get_request("/responses?survey_id=194825")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(value.get("total_hits"), Some(&json!(1)));

        let response = send(router.clone(), get_request("/responses?per_page=1")).await;
        let value = response_json(response).await;
        assert_eq!(value.get("total_hits"), Some(&json!(2)));
        assert_eq!(
            value.get("results").and_then(Value::as_array).map(Vec::len),
            Some(1)
        );

        for uri in [
            "/responses?per_page=0",
            "/responses?per_page=101",
            "/responses?page=0",
            "/responses?testing=123",
            "/responses?survey_id=1&testing=123",
            "/responses?survey_id=1&period=0616",
        ] {
            let response = send(router.clone(), get_request(uri)).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "uri: {uri}");
        }

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn lost_notification_fails_the_request() {
        let (router, path) = test_router(false);
        let response =
            send(router.clone(), post_json("/responses", survey(TX_A, "194825").to_string()))
                .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        // The insert itself committed; the document is retrievable.
        let response = send(router, get_request(&format!("/responses/{TX_A}"))).await;
        assert_eq!(response.status(), StatusCode::OK);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn queue_endpoint_republishes_known_documents() {
        let (router, path) = test_router(true);
        let response =
            send(router.clone(), post_json("/responses", survey(TX_A, "194825").to_string()))
                .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response =
            send(router.clone(), post_json("/queue", json!({"id": TX_A}).to_string())).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_json(response).await, json!({"result": "ok"}));

        let response =
            send(router.clone(), post_json("/queue", json!({"id": TX_B}).to_string())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response =
            send(router, post_json("/queue", json!({"id": "junk"}).to_string())).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn retention_without_configuration_is_a_server_error() {
        let (router, path) = test_router(true);
        let request = Request::builder()
            .uri("/responses/old")
            .method("DELETE")
            .body(Body::empty())
            .unwrap_or_else(|err| panic!("failed to build request: {err}"));
        let response = send(router, request).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let value = response_json(response).await;
        assert_eq!(value.get("message"), Some(&json!("retention window is not configured")));
        let _ = std::fs::remove_file(&path);
    }
}
