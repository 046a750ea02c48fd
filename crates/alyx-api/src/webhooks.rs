//! Webhook gateway HTTP surface.
//!
//! Thin shim over the core gateway: reads the bounded raw body, hands it
//! to [`alyx_core::webhook::WebhookGateway`], and writes the shaped
//! response back out.

use crate::handlers::{error_response, header_map_to_hashmap, ErrorResponse};
use crate::AppState;
use alyx_core::webhook::ShapedResponse;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::collections::HashMap;
use std::sync::Arc;

/// ANY /webhooks/{*path}
pub async fn gateway_handler(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    request: axum::extract::Request,
) -> Response {
    let endpoint_path = format!("/webhooks/{}", path);
    let method = request.method().as_str().to_string();
    let headers = header_map_to_hashmap(request.headers());

    let max_body = state.config().webhooks.max_body_bytes;
    let body = match axum::body::to_bytes(request.into_body(), max_body).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(ErrorResponse {
                    error: format!("Request body exceeds {} bytes", max_body),
                }),
            )
                .into_response();
        }
    };

    match state
        .alyx
        .gateway()
        .handle(&method, &endpoint_path, &headers, &query, &body)
        .await
    {
        Ok(shaped) => shaped_to_response(shaped),
        Err(e) => error_response(e),
    }
}

/// Write a core [`ShapedResponse`] as an axum response.
pub(crate) fn shaped_to_response(shaped: ShapedResponse) -> Response {
    let status = StatusCode::from_u16(shaped.status).unwrap_or(StatusCode::OK);
    let mut response = (status, shaped.body).into_response();
    let headers = response.headers_mut();
    if let Some(content_type) = shaped.content_type {
        if let Ok(value) = content_type.parse::<HeaderValue>() {
            headers.insert(header::CONTENT_TYPE, value);
        }
    }
    for (name, value) in shaped.headers {
        let Ok(name) = name.parse::<HeaderName>() else {
            continue;
        };
        let Ok(value) = value.parse::<HeaderValue>() else {
            continue;
        };
        headers.insert(name, value);
    }
    response
}
