//! Inbound webhook gateway.
//!
//! Registered endpoints map request paths to functions. On each request
//! the gateway verifies the signature over the raw body (when configured),
//! invokes the function with the assembled payload, and shapes the
//! function's output into an HTTP response. The endpoint catalog is
//! persisted and mirrored in memory for lookups.

use crate::error::{Error, Result};
use crate::manifest::{Function, HookKind};
use crate::registry::Registrar;
use crate::service::FunctionService;
use crate::store::Store;
use crate::types::{SignatureKind, TriggerType, WebhookEndpoint, WebhookVerification};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;

/// An HTTP response shaped from a function's output.
#[derive(Debug, Clone, PartialEq)]
pub struct ShapedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Content type applied when the function did not set one
    pub content_type: Option<String>,
}

impl ShapedResponse {
    fn json(status: u16, value: &serde_json::Value) -> Self {
        Self {
            status,
            headers: vec![],
            body: value.to_string().into_bytes(),
            content_type: Some("application/json".to_string()),
        }
    }
}

pub struct WebhookGateway {
    store: Store,
    service: Arc<FunctionService>,
    endpoints: RwLock<HashMap<String, WebhookEndpoint>>,
}

impl WebhookGateway {
    pub fn new(store: Store, service: Arc<FunctionService>) -> Self {
        Self {
            store,
            service,
            endpoints: RwLock::new(HashMap::new()),
        }
    }

    /// Reload the in-memory endpoint catalog from the store.
    pub async fn sync(&self) -> Result<()> {
        let rows = self.store.list_endpoints().await?;
        let mut endpoints = self.endpoints.write().await;
        *endpoints = rows.into_iter().map(|e| (e.path.clone(), e)).collect();
        Ok(())
    }

    pub async fn lookup(&self, path: &str) -> Option<WebhookEndpoint> {
        self.endpoints.read().await.get(path).cloned()
    }

    /// Handle one inbound webhook request. The body is the raw bytes as
    /// received; signature verification runs over exactly these bytes.
    pub async fn handle(
        &self,
        method: &str,
        path: &str,
        headers: &HashMap<String, String>,
        query: &HashMap<String, String>,
        body: &[u8],
    ) -> Result<ShapedResponse> {
        let endpoint = self
            .lookup(path)
            .await
            .ok_or_else(|| Error::EndpointNotFound(path.to_string()))?;
        if !endpoint.enabled {
            return Err(Error::EndpointNotFound(path.to_string()));
        }
        if !endpoint
            .methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method))
        {
            return Err(Error::MethodNotAllowed(format!("{} {}", method, path)));
        }

        let mut verified = false;
        let mut verification_error = None;
        if let Some(verification) = &endpoint.verification {
            match verify_signature(verification, headers, body) {
                Ok(()) => verified = true,
                Err(reason) => {
                    if !verification.skip_invalid {
                        return Err(Error::InvalidSignature(reason));
                    }
                    verification_error = Some(reason);
                }
            }
        }

        let mut payload = serde_json::json!({
            "method": method.to_ascii_uppercase(),
            "path": path,
            "headers": headers,
            "query": query,
            "body": String::from_utf8_lossy(body),
            "verified": verified,
            "webhook_id": endpoint.id,
        });
        if let Some(reason) = verification_error {
            payload["verification_error"] = serde_json::Value::String(reason);
        }

        let response = self
            .service
            .invoke(
                &endpoint.function_name,
                payload,
                None,
                TriggerType::Webhook,
                Some(&endpoint.id),
            )
            .await?;

        if !response.success {
            let message = response
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| "function failed".to_string());
            return Ok(ShapedResponse::json(
                500,
                &serde_json::json!({ "error": message }),
            ));
        }

        Ok(shape_output(response.output))
    }
}

/// Shape a successful function output into an HTTP response.
///
/// A map carrying `status`, `headers`, or `body` is honored; anything else
/// is JSON-encoded with status 200.
pub fn shape_output(output: Option<serde_json::Value>) -> ShapedResponse {
    let Some(output) = output else {
        return ShapedResponse::json(200, &serde_json::Value::Null);
    };

    let is_shaped = output.as_object().is_some_and(|map| {
        map.contains_key("status") || map.contains_key("headers") || map.contains_key("body")
    });
    if !is_shaped {
        return ShapedResponse::json(200, &output);
    }
    let map = output.as_object().expect("checked above");

    let status = map
        .get("status")
        .and_then(|s| s.as_u64())
        .and_then(|s| u16::try_from(s).ok())
        .unwrap_or(200);

    let headers = map
        .get("headers")
        .and_then(|h| h.as_object())
        .map(|h| {
            h.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default();

    let (body, content_type) = match map.get("body") {
        // A string body passes through untouched
        Some(serde_json::Value::String(s)) => (s.clone().into_bytes(), None),
        // A structured body is JSON-encoded
        Some(other) => (
            other.to_string().into_bytes(),
            Some("application/json".to_string()),
        ),
        None => (Vec::new(), None),
    };

    ShapedResponse {
        status,
        headers,
        body,
        content_type,
    }
}

/// Compute the expected HMAC of `body` as lowercase hex.
pub fn compute_signature(kind: SignatureKind, secret: &str, body: &[u8]) -> String {
    match kind {
        SignatureKind::HmacSha1 => {
            let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes())
                .expect("hmac accepts any key length");
            mac.update(body);
            hex::encode(mac.finalize().into_bytes())
        }
        SignatureKind::HmacSha256 => {
            let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
                .expect("hmac accepts any key length");
            mac.update(body);
            hex::encode(mac.finalize().into_bytes())
        }
    }
}

/// Verify a signed request body. The header is matched case-insensitively;
/// its value may be bare hex or `<alg>=<hex>`. Comparison is constant-time.
fn verify_signature(
    verification: &WebhookVerification,
    headers: &HashMap<String, String>,
    body: &[u8],
) -> std::result::Result<(), String> {
    let provided = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(&verification.header))
        .map(|(_, value)| value.as_str())
        .ok_or_else(|| format!("missing signature header {}", verification.header))?;

    // Accept "<alg>=<hex>" by taking everything after the first '='
    let provided = match provided.split_once('=') {
        Some((_alg, hex)) => hex,
        None => provided,
    };
    let provided = provided.trim().to_ascii_lowercase();

    let expected = compute_signature(verification.kind, &verification.secret, body);

    // Hash both sides so the comparison is constant-time regardless of the
    // provided value's length.
    let provided_hash = Sha256::digest(provided.as_bytes());
    let expected_hash = Sha256::digest(expected.as_bytes());
    if provided_hash.ct_eq(&expected_hash).into() {
        Ok(())
    } else {
        Err("signature mismatch".to_string())
    }
}

/// Binds each function's declared webhook hooks as gateway endpoints,
/// replacing whatever the function registered before.
pub struct WebhookRegistrar {
    store: Store,
    gateway: Arc<WebhookGateway>,
}

impl WebhookRegistrar {
    pub fn new(store: Store, gateway: Arc<WebhookGateway>) -> Self {
        Self { store, gateway }
    }
}

#[async_trait]
impl Registrar for WebhookRegistrar {
    async fn register(&self, function: &Function) -> Result<()> {
        self.store
            .delete_endpoints_for_function(&function.name)
            .await?;
        for hook in &function.hooks {
            if hook.kind != HookKind::Webhook {
                continue;
            }
            // Validation guarantees config.path and verification exist
            let Some(path) = hook.config.get("path") else {
                continue;
            };
            let methods: Vec<String> = hook
                .config
                .get("methods")
                .map(|m| {
                    m.split(',')
                        .map(|s| s.trim().to_ascii_uppercase())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_else(|| vec!["POST".to_string()]);
            self.store
                .upsert_endpoint(path, &function.name, &methods, hook.verification.as_ref(), true)
                .await?;
        }
        self.gateway.sync().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verification(kind: SignatureKind, skip_invalid: bool) -> WebhookVerification {
        WebhookVerification {
            kind,
            header: "X-Signature".to_string(),
            secret: "s3cr3t".to_string(),
            skip_invalid,
        }
    }

    #[test]
    fn test_signature_accepts_bare_hex_and_prefixed() {
        let v = verification(SignatureKind::HmacSha256, false);
        let body = br#"{"event":"x"}"#;
        let sig = compute_signature(SignatureKind::HmacSha256, "s3cr3t", body);

        let bare = HashMap::from([("X-Signature".to_string(), sig.clone())]);
        assert!(verify_signature(&v, &bare, body).is_ok());

        let prefixed = HashMap::from([("X-Signature".to_string(), format!("sha256={}", sig))]);
        assert!(verify_signature(&v, &prefixed, body).is_ok());
    }

    #[test]
    fn test_signature_header_is_case_insensitive() {
        let v = verification(SignatureKind::HmacSha256, false);
        let body = b"payload";
        let sig = compute_signature(SignatureKind::HmacSha256, "s3cr3t", body);
        let headers = HashMap::from([("x-signature".to_string(), sig)]);
        assert!(verify_signature(&v, &headers, body).is_ok());
    }

    #[test]
    fn test_signature_rejects_tampered_body() {
        let v = verification(SignatureKind::HmacSha256, false);
        let sig = compute_signature(SignatureKind::HmacSha256, "s3cr3t", b"original");
        let headers = HashMap::from([("X-Signature".to_string(), sig)]);
        assert!(verify_signature(&v, &headers, b"tampered").is_err());
    }

    #[test]
    fn test_signature_rejects_missing_header() {
        let v = verification(SignatureKind::HmacSha256, false);
        assert!(verify_signature(&v, &HashMap::new(), b"body").is_err());
    }

    #[test]
    fn test_sha1_signatures_verify() {
        let v = verification(SignatureKind::HmacSha1, false);
        let body = b"legacy payload";
        let sig = compute_signature(SignatureKind::HmacSha1, "s3cr3t", body);
        let headers = HashMap::from([("X-Signature".to_string(), format!("sha1={}", sig))]);
        assert!(verify_signature(&v, &headers, body).is_ok());
    }

    #[test]
    fn test_shape_plain_output_is_json_200() {
        let shaped = shape_output(Some(serde_json::json!({"greeting": "hi"})));
        assert_eq!(shaped.status, 200);
        assert_eq!(shaped.content_type.as_deref(), Some("application/json"));
        assert_eq!(shaped.body, br#"{"greeting":"hi"}"#);
    }

    #[test]
    fn test_shape_none_output_is_null() {
        let shaped = shape_output(None);
        assert_eq!(shaped.status, 200);
        assert_eq!(shaped.body, b"null");
    }

    #[test]
    fn test_shape_honors_status_headers_body() {
        let shaped = shape_output(Some(serde_json::json!({
            "status": 202,
            "headers": {"X-Custom": "yes"},
            "body": "accepted"
        })));
        assert_eq!(shaped.status, 202);
        assert_eq!(
            shaped.headers,
            vec![("X-Custom".to_string(), "yes".to_string())]
        );
        assert_eq!(shaped.body, b"accepted");
        assert!(shaped.content_type.is_none());
    }

    #[test]
    fn test_shape_json_body_map() {
        let shaped = shape_output(Some(serde_json::json!({
            "status": 200,
            "body": {"nested": true}
        })));
        assert_eq!(shaped.body, br#"{"nested":true}"#);
        assert_eq!(shaped.content_type.as_deref(), Some("application/json"));
    }
}
