//! Domain types for alyx

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// === Wire types (serialized across the subprocess boundary) ===

/// Request handed to a function subprocess on stdin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionRequest {
    pub request_id: String,
    pub function: String,
    pub input: serde_json::Value,
    pub context: FunctionContext,
}

/// Execution context embedded in every function request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionContext {
    pub auth: Option<serde_json::Value>,
    pub env: HashMap<String, String>,
    pub alyx_url: String,
    pub internal_token: String,
}

/// Response read from a function subprocess stdout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub request_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FunctionError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<Vec<FunctionLog>>,
    #[serde(default)]
    pub duration_ms: i64,
}

/// Error reported by the function itself
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// One log line emitted by a function during execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionLog {
    pub level: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

// === Persisted types ===

/// A stored file's metadata row
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct FileRecord {
    pub id: String,
    pub bucket: String,
    pub name: String,
    pub path: String,
    pub mime_type: String,
    pub size: i64,
    pub checksum: String,
    pub compressed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_size: Option<i64>,
    #[sqlx(json)]
    pub metadata: HashMap<String, String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An in-progress resumable upload
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Upload {
    pub id: String,
    pub bucket: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub size: i64,
    pub offset: i64,
    #[sqlx(json)]
    pub metadata: HashMap<String, String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Signature verification settings for a webhook endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookVerification {
    #[serde(rename = "type")]
    pub kind: SignatureKind,
    pub header: String,
    pub secret: String,
    #[serde(default)]
    pub skip_invalid: bool,
}

/// Supported webhook signature algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureKind {
    #[serde(rename = "hmac-sha1")]
    HmacSha1,
    #[serde(rename = "hmac-sha256")]
    HmacSha256,
}

/// A registered inbound webhook endpoint
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WebhookEndpoint {
    pub id: String,
    pub path: String,
    pub function_name: String,
    #[sqlx(json)]
    pub methods: Vec<String>,
    #[sqlx(json(nullable))]
    pub verification: Option<WebhookVerification>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// Delivery state of a queued outbound webhook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Retrying,
    Failed,
    Succeeded,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Retrying => "retrying",
            QueueStatus::Failed => "failed",
            QueueStatus::Succeeded => "succeeded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(QueueStatus::Pending),
            "retrying" => Some(QueueStatus::Retrying),
            "failed" => Some(QueueStatus::Failed),
            "succeeded" => Some(QueueStatus::Succeeded),
            _ => None,
        }
    }
}

/// A durable outbound webhook delivery row
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct QueuedWebhook {
    pub id: String,
    pub webhook_id: String,
    pub endpoint_url: String,
    pub payload: String,
    #[sqlx(json)]
    pub headers: HashMap<String, String>,
    pub attempt: i64,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A webhook delivery that exhausted its retry budget
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DeadLetter {
    pub id: String,
    pub webhook_id: String,
    pub endpoint_url: String,
    pub payload: String,
    #[sqlx(json)]
    pub headers: HashMap<String, String>,
    pub attempts: i64,
    pub last_error: String,
    pub created_at: DateTime<Utc>,
}

/// What caused a function to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Http,
    Webhook,
    Schedule,
    Hook,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Http => "http",
            TriggerType::Webhook => "webhook",
            TriggerType::Schedule => "schedule",
            TriggerType::Hook => "hook",
        }
    }
}

/// Terminal and transient states of an execution record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
        }
    }
}

/// One persisted function invocation and its outcome
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Execution {
    pub id: String,
    pub function: String,
    pub request_id: String,
    pub trigger_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_id: Option<String>,
    pub status: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    pub input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_response_round_trip() {
        let json = r#"{
            "request_id": "abc-123",
            "success": true,
            "output": {"greeting": "hello"},
            "logs": [{"level": "info", "message": "started", "timestamp": "2025-01-15T00:00:00Z"}],
            "duration_ms": 42
        }"#;
        let resp: FunctionResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.request_id, "abc-123");
        assert!(resp.success);
        assert_eq!(resp.duration_ms, 42);
        assert_eq!(resp.logs.as_ref().unwrap().len(), 1);

        let out = serde_json::to_string(&resp).unwrap();
        assert!(out.contains("\"greeting\":\"hello\""));
        // None fields are omitted entirely
        assert!(!out.contains("\"error\""));
    }

    #[test]
    fn test_function_response_error_shape() {
        let json = r#"{
            "request_id": "abc-123",
            "success": false,
            "error": {"code": "BAD_INPUT", "message": "missing field", "details": {"field": "name"}}
        }"#;
        let resp: FunctionResponse = serde_json::from_str(json).unwrap();
        assert!(!resp.success);
        let err = resp.error.unwrap();
        assert_eq!(err.code, "BAD_INPUT");
        assert_eq!(err.details.unwrap()["field"], "name");
        // duration_ms defaults to 0 when absent
        assert_eq!(resp.duration_ms, 0);
    }

    #[test]
    fn test_signature_kind_serde_names() {
        let v: WebhookVerification = serde_json::from_str(
            r#"{"type": "hmac-sha256", "header": "X-Sig", "secret": "s3cr3t"}"#,
        )
        .unwrap();
        assert_eq!(v.kind, SignatureKind::HmacSha256);
        assert!(!v.skip_invalid);

        let v: WebhookVerification = serde_json::from_str(
            r#"{"type": "hmac-sha1", "header": "X-Sig", "secret": "s3cr3t", "skip_invalid": true}"#,
        )
        .unwrap();
        assert_eq!(v.kind, SignatureKind::HmacSha1);
        assert!(v.skip_invalid);
    }

    #[test]
    fn test_queue_status_parse_round_trip() {
        for status in [
            QueueStatus::Pending,
            QueueStatus::Retrying,
            QueueStatus::Failed,
            QueueStatus::Succeeded,
        ] {
            assert_eq!(QueueStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(QueueStatus::parse("bogus"), None);
    }

    #[test]
    fn test_trigger_type_str() {
        assert_eq!(TriggerType::Http.as_str(), "http");
        assert_eq!(TriggerType::Webhook.as_str(), "webhook");
        assert_eq!(TriggerType::Schedule.as_str(), "schedule");
        assert_eq!(TriggerType::Hook.as_str(), "hook");
    }
}
