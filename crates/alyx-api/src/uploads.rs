//! Resumable upload endpoints (tus 1.0.0 core protocol).
//!
//! POST creates an upload, HEAD reports the offset, PATCH appends a chunk
//! (finalizing when the offset reaches the declared length), DELETE
//! abandons the upload. Every response carries `Tus-Resumable`.

use crate::handlers::{error_response, ErrorResponse};
use crate::AppState;
use alyx_core::upload::TUS_VERSION;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;

const OFFSET_CONTENT_TYPE: &str = "application/offset+octet-stream";

fn tus_headers(response: &mut Response) {
    let headers = response.headers_mut();
    headers.insert("Tus-Resumable", TUS_VERSION.parse().expect("static header"));
    headers.insert("Tus-Version", TUS_VERSION.parse().expect("static header"));
}

fn bad_request(message: impl Into<String>) -> Response {
    let mut response = (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response();
    tus_headers(&mut response);
    response
}

/// OPTIONS /api/v1/storage/{bucket}/tus - Protocol discovery
pub async fn options_upload() -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    tus_headers(&mut response);
    response
        .headers_mut()
        .insert("Tus-Extension", "creation".parse().expect("static header"));
    response
}

/// POST /api/v1/storage/{bucket}/tus - Create an upload
pub async fn create_upload(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
    headers: HeaderMap,
) -> Response {
    let Some(length) = headers
        .get("Upload-Length")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.parse::<i64>().ok())
    else {
        return bad_request("Upload-Length header is required");
    };
    let metadata = headers
        .get("Upload-Metadata")
        .and_then(|h| h.to_str().ok());

    match state.alyx.uploads().create(&bucket, length, metadata).await {
        Ok(upload) => {
            let mut response = StatusCode::CREATED.into_response();
            tus_headers(&mut response);
            let location = format!("/api/v1/storage/{}/tus/{}", bucket, upload.id);
            if let Ok(value) = location.parse() {
                response.headers_mut().insert("Location", value);
            }
            response
        }
        Err(e) => {
            let mut response = error_response(e);
            tus_headers(&mut response);
            response
        }
    }
}

/// HEAD | PATCH | DELETE /api/v1/storage/{bucket}/tus/{upload_id}
pub async fn upload_resource(
    State(state): State<Arc<AppState>>,
    Path((_bucket, upload_id)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
    body: axum::body::Body,
) -> Response {
    let mut response = match method {
        Method::HEAD => head_upload(&state, &upload_id).await,
        Method::PATCH => patch_upload(&state, &upload_id, &headers, body).await,
        Method::DELETE => delete_upload(&state, &upload_id).await,
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    };
    tus_headers(&mut response);
    response
}

async fn head_upload(state: &AppState, upload_id: &str) -> Response {
    match state.alyx.uploads().head(upload_id).await {
        Ok(upload) => {
            let mut response = StatusCode::OK.into_response();
            let headers = response.headers_mut();
            if let Ok(value) = upload.offset.to_string().parse() {
                headers.insert("Upload-Offset", value);
            }
            if let Ok(value) = upload.size.to_string().parse() {
                headers.insert("Upload-Length", value);
            }
            if let Ok(value) = "no-store".parse() {
                headers.insert("Cache-Control", value);
            }
            response
        }
        Err(e) => error_response(e),
    }
}

async fn patch_upload(
    state: &AppState,
    upload_id: &str,
    headers: &HeaderMap,
    body: axum::body::Body,
) -> Response {
    let content_type = headers
        .get("Content-Type")
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();
    if !content_type.eq_ignore_ascii_case(OFFSET_CONTENT_TYPE) {
        return (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Json(ErrorResponse {
                error: format!("Content-Type must be {}", OFFSET_CONTENT_TYPE),
            }),
        )
            .into_response();
    }
    let Some(offset) = headers
        .get("Upload-Offset")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.parse::<i64>().ok())
    else {
        return bad_request("Upload-Offset header is required");
    };

    let chunk = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => return bad_request(format!("failed to read body: {}", e)),
    };

    match state.alyx.uploads().patch(upload_id, offset, &chunk).await {
        Ok(outcome) => {
            let mut response = StatusCode::NO_CONTENT.into_response();
            if let Ok(value) = outcome.new_offset.to_string().parse() {
                response.headers_mut().insert("Upload-Offset", value);
            }
            response
        }
        Err(e) => error_response(e),
    }
}

async fn delete_upload(state: &AppState, upload_id: &str) -> Response {
    match state.alyx.uploads().delete(upload_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}
