//! HTTP request handlers for alyx-api

use crate::middleware::{auth_configured, AuthStatus};
use crate::webhooks::shaped_to_response;
use crate::AppState;
use alyx_core::signed_url::Operation;
use alyx_core::types::TriggerType;
use alyx_core::webhook::shape_output;
use alyx_core::Error;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::io::ReaderStream;

/// Error response format
#[derive(Serialize)]
pub(crate) struct ErrorResponse {
    pub error: String,
}

/// Convert a core error into its HTTP encoding. Internal failures are
/// logged server-side and returned as a generic message so file paths and
/// backend errors never leak to clients.
pub(crate) fn error_response(err: Error) -> Response {
    let status = match &err {
        e if e.is_not_found() => StatusCode::NOT_FOUND,
        Error::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
        Error::InvalidSignature(_) | Error::ExpiredToken => StatusCode::UNAUTHORIZED,
        Error::AccessDenied(_) => StatusCode::FORBIDDEN,
        Error::OffsetMismatch { .. } => StatusCode::CONFLICT,
        Error::Validation(_) | Error::Manifest { .. } => StatusCode::BAD_REQUEST,
        Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("Internal error: {}", err);
        "Internal server error".to_string()
    } else {
        err.to_string()
    };
    (status, Json(ErrorResponse { error: message })).into_response()
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}

/// Whether this request may use invocation-level endpoints. Everything is
/// open until an admin token is configured.
fn can_invoke(state: &AppState, auth_status: AuthStatus) -> bool {
    !auth_configured(state) || auth_status.can_invoke()
}

fn is_admin(state: &AppState, auth_status: AuthStatus) -> bool {
    !auth_configured(state) || auth_status == AuthStatus::Admin
}

// === Handlers ===

/// GET /health - Health check
pub async fn health() -> Response {
    #[derive(Serialize)]
    struct HealthResponse {
        status: &'static str,
    }

    Json(HealthResponse { status: "ok" }).into_response()
}

/// Summary of one catalog entry
#[derive(Serialize)]
struct FunctionSummary {
    name: String,
    runtime: &'static str,
    entrypoint: String,
    timeout_sec: u64,
    memory_mb: u64,
    routes: Vec<String>,
    schedules: Vec<String>,
    has_build: bool,
}

/// GET /api/v1/functions - List the function catalog
pub async fn list_functions(
    State(state): State<Arc<AppState>>,
    Extension(auth_status): Extension<AuthStatus>,
) -> Response {
    if !can_invoke(&state, auth_status) {
        return unauthorized("Authentication required");
    }

    let functions: Vec<FunctionSummary> = state
        .alyx
        .registry()
        .list()
        .await
        .iter()
        .map(|f| FunctionSummary {
            name: f.name.clone(),
            runtime: f.runtime.as_str(),
            entrypoint: f.entrypoint.clone(),
            timeout_sec: f.timeout_sec,
            memory_mb: f.memory_mb,
            routes: f.routes.iter().map(|r| r.path.clone()).collect(),
            schedules: f.schedules.iter().map(|s| s.name.clone()).collect(),
            has_build: f.build.is_some(),
        })
        .collect();

    #[derive(Serialize)]
    struct FunctionsResponse {
        functions: Vec<FunctionSummary>,
        total: usize,
    }

    let total = functions.len();
    Json(FunctionsResponse { functions, total }).into_response()
}

/// POST /api/v1/functions/{name}/invoke - Invoke a function synchronously
pub async fn invoke_function(
    State(state): State<Arc<AppState>>,
    Extension(auth_status): Extension<AuthStatus>,
    Path(name): Path<String>,
    body: Option<Json<serde_json::Value>>,
) -> Response {
    if !can_invoke(&state, auth_status) {
        return unauthorized("Authentication required to invoke functions");
    }

    let input = body.map(|Json(v)| v).unwrap_or(serde_json::Value::Null);
    match state
        .alyx
        .service()
        .invoke(&name, input, None, TriggerType::Http, None)
        .await
    {
        Ok(response) => Json(response).into_response(),
        Err(e) => error_response(e),
    }
}

/// ANY /fn/{*path} - Routes declared in function manifests.
///
/// Route binding is dynamic: the catalog is consulted per request, so a
/// registry reload changes the routed surface without a server restart.
pub async fn function_route(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    request: axum::extract::Request,
) -> Response {
    let route_path = format!("/{}", path);
    let method = request.method().as_str().to_ascii_uppercase();

    // Resolve which function declared this (path, method)
    let mut target = None;
    let mut path_known = false;
    for function in state.alyx.registry().list().await {
        for route in &function.routes {
            if route.path != route_path {
                continue;
            }
            path_known = true;
            if route.methods.iter().any(|m| m.eq_ignore_ascii_case(&method)) {
                target = Some(function.clone());
            }
        }
    }
    let Some(function) = target else {
        return if path_known {
            error_response(Error::MethodNotAllowed(format!("{} {}", method, route_path)))
        } else {
            error_response(Error::FunctionNotFound(route_path))
        };
    };

    let headers = header_map_to_hashmap(request.headers());
    let body = match axum::body::to_bytes(request.into_body(), 10 * 1024 * 1024).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(ErrorResponse {
                    error: "Request body too large".to_string(),
                }),
            )
                .into_response();
        }
    };

    // JSON bodies pass through structured; anything else arrives as text
    let body_value: serde_json::Value = serde_json::from_slice(&body)
        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(&body).into_owned()));

    let input = serde_json::json!({
        "method": method,
        "path": route_path,
        "headers": headers,
        "query": query,
        "body": body_value,
    });

    match state
        .alyx
        .service()
        .invoke(
            &function.name,
            input,
            None,
            TriggerType::Http,
            Some(&route_path),
        )
        .await
    {
        Ok(response) if response.success => shaped_to_response(shape_output(response.output)),
        Ok(response) => {
            let message = response
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| "function failed".to_string());
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse { error: message }),
            )
                .into_response()
        }
        Err(e) => error_response(e),
    }
}

/// Query parameters for the execution list
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionsQuery {
    pub function: Option<String>,
    pub limit: Option<i64>,
}

/// GET /api/v1/executions - Recent execution records (admin only)
pub async fn list_executions(
    State(state): State<Arc<AppState>>,
    Extension(auth_status): Extension<AuthStatus>,
    Query(query): Query<ExecutionsQuery>,
) -> Response {
    if !is_admin(&state, auth_status) {
        return unauthorized("Authentication required to list executions");
    }

    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    match state
        .alyx
        .store()
        .list_executions(query.function.as_deref(), limit)
        .await
    {
        Ok(executions) => {
            #[derive(Serialize)]
            struct ExecutionsResponse {
                executions: Vec<alyx_core::types::Execution>,
                total: usize,
            }
            let total = executions.len();
            Json(ExecutionsResponse { executions, total }).into_response()
        }
        Err(e) => error_response(e),
    }
}

/// Query parameters for signed downloads
#[derive(Debug, Clone, Deserialize)]
pub struct DownloadQuery {
    pub token: String,
}

/// GET /api/v1/storage/{bucket}/files/{file_id}?token=... - Signed download.
///
/// The file lookup runs before token validation so a deleted file is a
/// 404 regardless of the token, never a 403.
pub async fn download_file(
    State(state): State<Arc<AppState>>,
    Path((bucket, file_id)): Path<(String, String)>,
    Query(query): Query<DownloadQuery>,
) -> Response {
    let file = match state.alyx.store().get_file(&bucket, &file_id).await {
        Ok(Some(file)) => file,
        Ok(None) => return error_response(Error::FileNotFound(file_id)),
        Err(e) => return error_response(e),
    };

    let claims = match state
        .alyx
        .signed_urls()
        .validate(&query.token, &file_id, &bucket)
    {
        Ok(claims) => claims,
        Err(e) => return error_response(e),
    };

    let handle = match state.alyx.objects().bucket(&bucket) {
        Ok(handle) => handle.clone(),
        Err(e) => return error_response(e),
    };
    let reader = match handle.backend.get(&bucket, &file.path).await {
        Ok(reader) => reader,
        Err(e) => return error_response(e),
    };

    let disposition = match claims.operation {
        Operation::Download => format!("attachment; filename=\"{}\"", file.name),
        Operation::View => "inline".to_string(),
    };

    let mut response =
        axum::body::Body::from_stream(ReaderStream::new(reader)).into_response();
    let headers = response.headers_mut();
    if let Ok(value) = file.mime_type.parse() {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = disposition.parse() {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    if let Ok(value) = "private, no-store".parse() {
        headers.insert(header::CACHE_CONTROL, value);
    }
    response
}

/// Body for minting signed URLs
#[derive(Debug, Clone, Deserialize)]
pub struct SignRequest {
    pub operation: String,
    pub expiry: Option<String>,
    pub user_id: Option<String>,
}

/// POST /api/v1/storage/{bucket}/files/{file_id}/sign - Mint a signed URL
/// (admin only)
pub async fn sign_file(
    State(state): State<Arc<AppState>>,
    Extension(auth_status): Extension<AuthStatus>,
    Path((bucket, file_id)): Path<(String, String)>,
    Json(request): Json<SignRequest>,
) -> Response {
    if !is_admin(&state, auth_status) {
        return unauthorized("Authentication required to sign URLs");
    }

    // The file must exist before a capability for it is minted
    match state.alyx.store().get_file(&bucket, &file_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return error_response(Error::FileNotFound(file_id)),
        Err(e) => return error_response(e),
    }

    let operation: Operation = match request.operation.parse() {
        Ok(operation) => operation,
        Err(e) => return error_response(Error::Validation(e)),
    };
    let ttl = match request.expiry.as_deref() {
        Some(expiry) => match humantime::parse_duration(expiry) {
            Ok(ttl) => Some(ttl),
            Err(e) => {
                return error_response(Error::Validation(format!("invalid expiry: {}", e)))
            }
        },
        None => None,
    };

    let (token, expires_at) = state.alyx.signed_urls().generate(
        &file_id,
        &bucket,
        operation,
        ttl,
        request.user_id.as_deref(),
    );

    #[derive(Serialize)]
    struct SignResponse {
        token: String,
        url: String,
        expires_at: chrono::DateTime<chrono::Utc>,
    }

    Json(SignResponse {
        url: format!(
            "/api/v1/storage/{}/files/{}?token={}",
            bucket, file_id, token
        ),
        token,
        expires_at,
    })
    .into_response()
}

/// Collapse a HeaderMap into a string map, skipping non-UTF-8 values.
pub(crate) fn header_map_to_hashmap(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}
