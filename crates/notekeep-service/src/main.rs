use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use notekeep_api::{
    ApiError, CreateCollectionRequest, CreateNoteRequest, NotekeepApi, UpdateCollectionRequest,
    UpdateNoteRequest,
};
use notekeep_auth::{password_matches, Claims, TokenService};
use notekeep_core::{Collection, Note, NoteSummary};
use notekeep_store_sqlite::StoreError;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Clone)]
struct ServiceState {
    api: NotekeepApi,
    tokens: TokenService,
    password: String,
}

#[derive(Debug, Parser)]
#[command(name = "notekeep-service")]
#[command(about = "HTTP backend for the Notekeep note store")]
struct Args {
    #[arg(long, default_value = "./notekeep.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:3000")]
    bind: SocketAddr,
    /// Shared login credential.
    #[arg(long, env = "NOTEKEEP_PASSWORD")]
    password: String,
    /// Hex-encoded token signing secret; a random one is generated when
    /// absent, which invalidates all tokens across restarts.
    #[arg(long, env = "NOTEKEEP_TOKEN_SECRET")]
    token_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct AuthorizeRequest {
    #[serde(default)]
    password: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct AuthorizeResponse {
    status: &'static str,
    msg: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct TokenResponse {
    token: String,
}

#[derive(Debug, Clone, Serialize)]
struct CreatedResponse {
    id: i64,
}

#[derive(Debug, Clone, Serialize)]
struct ChangedResponse {
    changed: usize,
}

#[derive(Debug, Clone, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct CollectionListQuery {
    parent: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct NoteListQuery {
    collection: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct SearchQuery {
    q: String,
}

struct ServiceError(ApiError);

impl From<ApiError> for ServiceError {
    fn from(err: ApiError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let (status, message) = match self.0 {
            ApiError::Validation(err) => (StatusCode::BAD_REQUEST, err.to_string()),
            ApiError::Store(err @ StoreError::Integrity(_)) => {
                (StatusCode::CONFLICT, err.to_string())
            }
            ApiError::Store(err @ StoreError::NotFound { .. }) => {
                (StatusCode::NOT_FOUND, err.to_string())
            }
            ApiError::Store(err) => {
                tracing::error!(error = %err, "content store failure");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

/// Checks the `Authorization: Bearer <token>` header. All failure causes
/// collapse into a bare 401 so a caller cannot distinguish a missing header
/// from a forged or expired token; the cause is only logged.
fn bearer_claims(headers: &HeaderMap, tokens: &TokenService) -> Result<Claims, StatusCode> {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        tracing::debug!("missing Authorization header");
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Ok(value) = value.to_str() else {
        tracing::debug!("Authorization header is not valid UTF-8");
        return Err(StatusCode::UNAUTHORIZED);
    };

    let mut parts = value.split(' ');
    let (Some("Bearer"), Some(token), None) = (parts.next(), parts.next(), parts.next()) else {
        tracing::debug!("Authorization header is not a Bearer credential");
        return Err(StatusCode::UNAUTHORIZED);
    };

    tokens.verify(token).map_err(|err| {
        tracing::debug!(error = %err, "bearer token rejected");
        StatusCode::UNAUTHORIZED
    })
}

async fn require_bearer(
    State(state): State<ServiceState>,
    request: Request,
    next: Next,
) -> Response {
    match bearer_claims(request.headers(), &state.tokens) {
        Ok(_) => next.run(request).await,
        Err(status) => status.into_response(),
    }
}

fn app(state: ServiceState) -> Router {
    let protected = Router::new()
        .route("/api/collection", post(create_collection))
        .route(
            "/api/collection/:id",
            get(read_collection).put(update_collection).delete(delete_collection),
        )
        .route("/api/collections", get(list_collections))
        .route("/api/collections/search", get(search_collections))
        .route("/api/note", post(create_note))
        .route("/api/note/:id", get(read_note).put(update_note).delete(delete_note))
        .route("/api/notes", get(list_notes))
        .route("/api/notes/search", get(search_notes))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer));

    Router::new().route("/api/authorize", post(authorize).put(refresh)).merge(protected).with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("notekeep_service=info")),
        )
        .init();

    let args = Args::parse();
    let tokens = match args.token_secret.as_deref() {
        Some(raw) => {
            let secret = hex::decode(raw).context("token secret must be hex-encoded")?;
            TokenService::new(&secret).context("token secret cannot seed the MAC")?
        }
        None => {
            tracing::warn!("no token secret supplied; tokens will not survive a restart");
            TokenService::generate()
        }
    };

    let state = ServiceState { api: NotekeepApi::new(args.db), tokens, password: args.password };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(addr = %args.bind, "notekeep service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn authorize(
    State(state): State<ServiceState>,
    Json(request): Json<AuthorizeRequest>,
) -> Json<AuthorizeResponse> {
    let submitted = request.password.unwrap_or_default();
    if password_matches(&submitted, &state.password) {
        Json(AuthorizeResponse {
            status: "ok",
            msg: "authorized",
            token: Some(state.tokens.issue()),
        })
    } else {
        tracing::debug!("login attempt with wrong credential");
        Json(AuthorizeResponse { status: "error", msg: "wrong password", token: None })
    }
}

async fn refresh(State(state): State<ServiceState>, headers: HeaderMap) -> Response {
    match bearer_claims(&headers, &state.tokens) {
        Ok(_) => Json(TokenResponse { token: state.tokens.issue() }).into_response(),
        Err(status) => status.into_response(),
    }
}

async fn create_collection(
    State(state): State<ServiceState>,
    Json(request): Json<CreateCollectionRequest>,
) -> Result<Json<CreatedResponse>, ServiceError> {
    let id = state.api.create_collection(request)?;
    Ok(Json(CreatedResponse { id: id.get() }))
}

async fn read_collection(
    State(state): State<ServiceState>,
    Path(id): Path<i64>,
) -> Result<Json<Collection>, ServiceError> {
    Ok(Json(state.api.read_collection(id)?))
}

async fn list_collections(
    State(state): State<ServiceState>,
    Query(query): Query<CollectionListQuery>,
) -> Result<Json<Vec<Collection>>, ServiceError> {
    Ok(Json(state.api.list_collections(query.parent)?))
}

async fn search_collections(
    State(state): State<ServiceState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<Collection>>, ServiceError> {
    Ok(Json(state.api.search_collections(&query.q)?))
}

async fn update_collection(
    State(state): State<ServiceState>,
    Path(id): Path<i64>,
    Json(request): Json<UpdateCollectionRequest>,
) -> Result<Json<ChangedResponse>, ServiceError> {
    let changed = state.api.update_collection(id, request)?;
    Ok(Json(ChangedResponse { changed }))
}

async fn delete_collection(
    State(state): State<ServiceState>,
    Path(id): Path<i64>,
) -> Result<Json<ChangedResponse>, ServiceError> {
    let changed = state.api.delete_collection(id)?;
    Ok(Json(ChangedResponse { changed }))
}

async fn create_note(
    State(state): State<ServiceState>,
    Json(request): Json<CreateNoteRequest>,
) -> Result<Json<CreatedResponse>, ServiceError> {
    let id = state.api.create_note(request)?;
    Ok(Json(CreatedResponse { id: id.get() }))
}

async fn read_note(
    State(state): State<ServiceState>,
    Path(id): Path<i64>,
) -> Result<Json<Note>, ServiceError> {
    Ok(Json(state.api.read_note(id)?))
}

async fn list_notes(
    State(state): State<ServiceState>,
    Query(query): Query<NoteListQuery>,
) -> Result<Json<Vec<NoteSummary>>, ServiceError> {
    Ok(Json(state.api.list_notes(query.collection)?))
}

async fn search_notes(
    State(state): State<ServiceState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<NoteSummary>>, ServiceError> {
    Ok(Json(state.api.search_notes(&query.q)?))
}

async fn update_note(
    State(state): State<ServiceState>,
    Path(id): Path<i64>,
    Json(request): Json<UpdateNoteRequest>,
) -> Result<Json<ChangedResponse>, ServiceError> {
    let changed = state.api.update_note(id, request)?;
    Ok(Json(ChangedResponse { changed }))
}

async fn delete_note(
    State(state): State<ServiceState>,
    Path(id): Path<i64>,
) -> Result<Json<ChangedResponse>, ServiceError> {
    let changed = state.api.delete_note(id)?;
    Ok(Json(ChangedResponse { changed }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use http::Request;
    use tower::ServiceExt;

    fn test_state() -> (ServiceState, tempfile::TempDir) {
        let dir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(err) => panic!("failed to create temp dir: {err}"),
        };
        let state = ServiceState {
            api: NotekeepApi::new(dir.path().join("notekeep.sqlite3")),
            tokens: TokenService::generate(),
            password: "114514".to_string(),
        };
        (state, dir)
    }

    async fn send(router: &Router, request: Request<Body>) -> Response {
        match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    fn request(method: &str, uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri).method(method);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        match builder.body(Body::empty()) {
            Ok(request) => request,
            Err(err) => panic!("failed to build request: {err}"),
        }
    }

    fn json_request(
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: &serde_json::Value,
    ) -> Request<Body> {
        let mut builder =
            Request::builder().uri(uri).method(method).header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        match builder.body(Body::from(body.to_string())) {
            Ok(request) => request,
            Err(err) => panic!("failed to build request: {err}"),
        }
    }

    async fn login(router: &Router) -> String {
        let response = send(
            router,
            json_request(
                "POST",
                "/api/authorize",
                None,
                &serde_json::json!({ "password": "114514" }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(value.get("status").and_then(serde_json::Value::as_str), Some("ok"));
        match value.get("token").and_then(serde_json::Value::as_str) {
            Some(token) => token.to_string(),
            None => panic!("login response is missing a token: {value}"),
        }
    }

    #[tokio::test]
    async fn wrong_password_yields_error_payload_without_token() {
        let (state, _dir) = test_state();
        let router = app(state);

        for body in [serde_json::json!({}), serde_json::json!({ "password": "123456" })] {
            let response = send(&router, json_request("POST", "/api/authorize", None, &body)).await;
            assert_eq!(response.status(), StatusCode::OK);

            let value = response_json(response).await;
            assert_eq!(value.get("status").and_then(serde_json::Value::as_str), Some("error"));
            assert!(value.get("token").is_none());
        }
    }

    #[tokio::test]
    async fn login_issues_verifiable_token() {
        let (state, _dir) = test_state();
        let router = app(state.clone());

        let token = login(&router).await;
        assert!(state.tokens.verify(&token).is_ok());
    }

    #[tokio::test]
    async fn refresh_requires_token_and_reissues() {
        let (state, _dir) = test_state();
        let router = app(state.clone());

        let response = send(&router, request("PUT", "/api/authorize", None)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let token = login(&router).await;
        let response = send(&router, request("PUT", "/api/authorize", Some(&token))).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        let fresh = match value.get("token").and_then(serde_json::Value::as_str) {
            Some(token) => token.to_string(),
            None => panic!("refresh response is missing a token: {value}"),
        };
        assert!(state.tokens.verify(&fresh).is_ok());
        // Stateless tokens: the old one stays valid until its own expiry.
        assert!(state.tokens.verify(&token).is_ok());
    }

    #[tokio::test]
    async fn requests_without_credentials_never_reach_the_store() {
        let (state, _dir) = test_state();
        let router = app(state);

        let response = send(
            &router,
            json_request("POST", "/api/collection", None, &serde_json::json!({ "name": "Work" })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // The rejected create must have left no side effects behind.
        let token = login(&router).await;
        let response = send(&router, request("GET", "/api/collections", Some(&token))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_json(response).await, serde_json::json!([]));
    }

    #[tokio::test]
    async fn tampered_and_malformed_credentials_are_rejected() {
        let (state, _dir) = test_state();
        let router = app(state);
        let token = login(&router).await;

        let mut tampered = token.clone();
        let last = if tampered.pop() == Some('0') { '1' } else { '0' };
        tampered.push(last);

        for credential in [
            format!("Bearer {tampered}"),
            format!("Token {token}"),
            "Bearer".to_string(),
            format!("Bearer {token} extra"),
        ] {
            let built = Request::builder()
                .uri("/api/collections")
                .method("GET")
                .header("authorization", credential.clone());
            let response = match built.body(Body::empty()) {
                Ok(request) => send(&router, request).await,
                Err(err) => panic!("failed to build request for {credential}: {err}"),
            };
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "credential: {credential}");
        }
    }

    #[tokio::test]
    async fn collection_note_lifecycle_round_trip() {
        let (state, _dir) = test_state();
        let router = app(state);
        let token = login(&router).await;

        let response = send(
            &router,
            json_request(
                "POST",
                "/api/collection",
                Some(&token),
                &serde_json::json!({ "name": "Work" }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_json(response).await, serde_json::json!({ "id": 1 }));

        let response = send(
            &router,
            json_request(
                "POST",
                "/api/note",
                Some(&token),
                &serde_json::json!({ "title": "Plan", "contents": "# Plan", "collection_id": 1 }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_json(response).await, serde_json::json!({ "id": 1 }));

        let response =
            send(&router, request("GET", "/api/notes?collection=1", Some(&token))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response_json(response).await,
            serde_json::json!([{ "id": 1, "title": "Plan" }])
        );

        // Still referenced by the note.
        let response = send(&router, request("DELETE", "/api/collection/1", Some(&token))).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = send(&router, request("DELETE", "/api/note/1", Some(&token))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let response = send(&router, request("DELETE", "/api/collection/1", Some(&token))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_json(response).await, serde_json::json!({ "changed": 1 }));
    }

    #[tokio::test]
    async fn search_is_case_insensitive_substring() {
        let (state, _dir) = test_state();
        let router = app(state);
        let token = login(&router).await;

        let response = send(
            &router,
            json_request(
                "POST",
                "/api/collection",
                Some(&token),
                &serde_json::json!({ "name": "Work" }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response =
            send(&router, request("GET", "/api/collections/search?q=wor", Some(&token))).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        let names: Vec<&str> = value
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.get("name").and_then(serde_json::Value::as_str))
                    .collect()
            })
            .unwrap_or_default();
        assert_eq!(names, ["Work"]);
    }

    #[tokio::test]
    async fn error_taxonomy_maps_to_status_codes() {
        let (state, _dir) = test_state();
        let router = app(state);
        let token = login(&router).await;

        // Validation: empty name never reaches the store.
        let response = send(
            &router,
            json_request(
                "POST",
                "/api/collection",
                Some(&token),
                &serde_json::json!({ "name": "" }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // Not found: absent ids are typed, not silent.
        let response = send(&router, request("GET", "/api/collection/5", Some(&token))).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = send(&router, request("GET", "/api/note/5", Some(&token))).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // Integrity: a reparent that would create a cycle.
        for name in ["A", "B"] {
            let response = send(
                &router,
                json_request(
                    "POST",
                    "/api/collection",
                    Some(&token),
                    &serde_json::json!({ "name": name, "parent_id": if name == "B" { 1 } else { 0 } }),
                ),
            )
            .await;
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = send(
            &router,
            json_request(
                "PUT",
                "/api/collection/1",
                Some(&token),
                &serde_json::json!({ "parent_id": 2 }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let value = response_json(response).await;
        let message = value.get("error").and_then(serde_json::Value::as_str).unwrap_or_default();
        assert!(message.contains("integrity error"), "unexpected message: {message}");
    }

    #[tokio::test]
    async fn update_note_refreshes_modify_at() {
        let (state, _dir) = test_state();
        let router = app(state);
        let token = login(&router).await;

        let response = send(
            &router,
            json_request(
                "POST",
                "/api/note",
                Some(&token),
                &serde_json::json!({ "title": "Plan", "contents": "# Plan" }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(&router, request("GET", "/api/note/1", Some(&token))).await;
        let before = response_json(response).await;

        let response = send(
            &router,
            json_request("PUT", "/api/note/1", Some(&token), &serde_json::json!({})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_json(response).await, serde_json::json!({ "changed": 1 }));

        let response = send(&router, request("GET", "/api/note/1", Some(&token))).await;
        let after = response_json(response).await;

        let stamp = |value: &serde_json::Value| {
            let raw = value
                .get("modify_at")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default();
            match time::OffsetDateTime::parse(
                raw,
                &time::format_description::well_known::Rfc3339,
            ) {
                Ok(parsed) => parsed,
                Err(err) => panic!("modify_at is not RFC3339: {raw}: {err}"),
            }
        };
        assert!(stamp(&after) >= stamp(&before));
        assert_eq!(after.get("title"), before.get("title"));
    }
}
