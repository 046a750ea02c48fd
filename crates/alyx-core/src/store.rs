//! Metadata store: files, uploads, webhook queue, DLQ, endpoints, executions.
//!
//! Every persisted row from the data model lives behind this type. The
//! webhook queue and the executions table double as durable work queues:
//! "claiming" is a plain `SELECT ... ORDER BY created_at LIMIT n` under a
//! read-mostly workload, and the upload offset update is a compare-and-set
//! so concurrent PATCHes on one upload serialize through the database.

use crate::db::Database;
use crate::error::{Error, Result};
use crate::types::{
    DeadLetter, Execution, ExecutionStatus, FileRecord, QueueStatus, QueuedWebhook, TriggerType,
    Upload, WebhookEndpoint, WebhookVerification,
};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::collections::HashMap;
use uuid::Uuid;

/// Repository over the alyx metadata tables.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl From<&Database> for Store {
    fn from(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// The underlying pool, for custom queries.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // === Files ===

    /// Insert a file row. `(bucket, path)` is unique; a conflict bumps the
    /// version and replaces the row's content fields.
    pub async fn insert_file(&self, file: &FileRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO _alyx_files
                (id, bucket, name, path, mime_type, size, checksum, compressed,
                 compression_type, original_size, metadata, version, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (bucket, path) DO UPDATE SET
                mime_type = excluded.mime_type,
                size = excluded.size,
                checksum = excluded.checksum,
                compressed = excluded.compressed,
                compression_type = excluded.compression_type,
                original_size = excluded.original_size,
                metadata = excluded.metadata,
                version = _alyx_files.version + 1,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&file.id)
        .bind(&file.bucket)
        .bind(&file.name)
        .bind(&file.path)
        .bind(&file.mime_type)
        .bind(file.size)
        .bind(&file.checksum)
        .bind(file.compressed)
        .bind(&file.compression_type)
        .bind(file.original_size)
        .bind(serde_json::to_string(&file.metadata)?)
        .bind(file.version)
        .bind(file.created_at)
        .bind(file.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_file(&self, bucket: &str, id: &str) -> Result<Option<FileRecord>> {
        let row = sqlx::query_as::<_, FileRecord>(
            "SELECT * FROM _alyx_files WHERE bucket = ? AND id = ?",
        )
        .bind(bucket)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_file_by_path(&self, bucket: &str, path: &str) -> Result<Option<FileRecord>> {
        let row = sqlx::query_as::<_, FileRecord>(
            "SELECT * FROM _alyx_files WHERE bucket = ? AND path = ?",
        )
        .bind(bucket)
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn delete_file(&self, bucket: &str, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM _alyx_files WHERE bucket = ? AND id = ?")
            .bind(bucket)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_files(&self, bucket: &str, limit: i64) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query_as::<_, FileRecord>(
            "SELECT * FROM _alyx_files WHERE bucket = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(bucket)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // === Uploads ===

    pub async fn insert_upload(&self, upload: &Upload) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO _alyx_uploads
                (id, bucket, filename, size, "offset", metadata, expires_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&upload.id)
        .bind(&upload.bucket)
        .bind(&upload.filename)
        .bind(upload.size)
        .bind(upload.offset)
        .bind(serde_json::to_string(&upload.metadata)?)
        .bind(upload.expires_at)
        .bind(upload.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_upload(&self, id: &str) -> Result<Option<Upload>> {
        let row = sqlx::query_as::<_, Upload>("SELECT * FROM _alyx_uploads WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Compare-and-set the upload offset. Returns false when the stored
    /// offset no longer equals `expected` (a concurrent PATCH won).
    pub async fn advance_upload_offset(
        &self,
        id: &str,
        expected: i64,
        new_offset: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"UPDATE _alyx_uploads SET "offset" = ? WHERE id = ? AND "offset" = ?"#,
        )
        .bind(new_offset)
        .bind(id)
        .bind(expected)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn delete_upload(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM _alyx_uploads WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Uploads whose `expires_at` is in the past, oldest first.
    pub async fn expired_uploads(&self, now: DateTime<Utc>) -> Result<Vec<Upload>> {
        let rows = sqlx::query_as::<_, Upload>(
            "SELECT * FROM _alyx_uploads WHERE expires_at < ? ORDER BY expires_at ASC",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // === Webhook queue ===

    /// Insert a fresh delivery row: attempt 0, pending, no retry time.
    pub async fn enqueue_webhook(
        &self,
        webhook_id: &str,
        endpoint_url: &str,
        payload: &str,
        headers: &HashMap<String, String>,
    ) -> Result<QueuedWebhook> {
        let now = Utc::now();
        let row = QueuedWebhook {
            id: Uuid::new_v4().to_string(),
            webhook_id: webhook_id.to_string(),
            endpoint_url: endpoint_url.to_string(),
            payload: payload.to_string(),
            headers: headers.clone(),
            attempt: 0,
            next_retry_at: None,
            status: QueueStatus::Pending.as_str().to_string(),
            created_at: now,
            updated_at: now,
        };
        sqlx::query(
            r#"
            INSERT INTO _alyx_webhook_queue
                (id, webhook_id, endpoint_url, payload, headers, attempt,
                 next_retry_at, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.id)
        .bind(&row.webhook_id)
        .bind(&row.endpoint_url)
        .bind(&row.payload)
        .bind(serde_json::to_string(&row.headers)?)
        .bind(row.attempt)
        .bind(row.next_retry_at)
        .bind(&row.status)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(row)
    }

    /// Rows due for delivery: pending or retrying, retry time unset or
    /// elapsed, oldest first.
    pub async fn due_webhooks(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<QueuedWebhook>> {
        let rows = sqlx::query_as::<_, QueuedWebhook>(
            r#"
            SELECT * FROM _alyx_webhook_queue
            WHERE status IN ('pending', 'retrying')
              AND (next_retry_at IS NULL OR next_retry_at <= ?)
            ORDER BY created_at ASC
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn mark_webhook_succeeded(&self, id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE _alyx_webhook_queue SET status = 'succeeded', updated_at = ? WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a failed attempt and schedule the next one.
    pub async fn schedule_webhook_retry(
        &self,
        id: &str,
        attempt: i64,
        next_retry_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE _alyx_webhook_queue
            SET attempt = ?, next_retry_at = ?, status = 'retrying', updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(attempt)
        .bind(next_retry_at)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Move an exhausted delivery to the DLQ and mark the queue row failed,
    /// atomically.
    pub async fn move_webhook_to_dlq(
        &self,
        row: &QueuedWebhook,
        attempts: i64,
        last_error: &str,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO _alyx_webhook_dlq
                (id, webhook_id, endpoint_url, payload, headers, attempts, last_error, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&row.webhook_id)
        .bind(&row.endpoint_url)
        .bind(&row.payload)
        .bind(serde_json::to_string(&row.headers)?)
        .bind(attempts)
        .bind(last_error)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE _alyx_webhook_queue SET status = 'failed', attempt = ?, updated_at = ? WHERE id = ?",
        )
        .bind(attempts)
        .bind(Utc::now())
        .bind(&row.id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn list_dead_letters(&self, limit: i64) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query_as::<_, DeadLetter>(
            "SELECT * FROM _alyx_webhook_dlq ORDER BY created_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // === Webhook endpoints ===

    /// Insert or replace the endpoint at `path`. Registration is
    /// declarative: a reload re-registers everything a function declares.
    pub async fn upsert_endpoint(
        &self,
        path: &str,
        function_name: &str,
        methods: &[String],
        verification: Option<&WebhookVerification>,
        enabled: bool,
    ) -> Result<WebhookEndpoint> {
        let endpoint = WebhookEndpoint {
            id: Uuid::new_v4().to_string(),
            path: path.to_string(),
            function_name: function_name.to_string(),
            methods: methods.to_vec(),
            verification: verification.cloned(),
            enabled,
            created_at: Utc::now(),
        };
        sqlx::query(
            r#"
            INSERT INTO webhook_endpoints (id, path, function_name, methods, verification, enabled, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (path) DO UPDATE SET
                function_name = excluded.function_name,
                methods = excluded.methods,
                verification = excluded.verification,
                enabled = excluded.enabled
            "#,
        )
        .bind(&endpoint.id)
        .bind(&endpoint.path)
        .bind(&endpoint.function_name)
        .bind(serde_json::to_string(&endpoint.methods)?)
        .bind(match &endpoint.verification {
            Some(v) => Some(serde_json::to_string(v)?),
            None => None,
        })
        .bind(endpoint.enabled)
        .bind(endpoint.created_at)
        .execute(&self.pool)
        .await?;
        Ok(endpoint)
    }

    pub async fn delete_endpoints_for_function(&self, function_name: &str) -> Result<()> {
        sqlx::query("DELETE FROM webhook_endpoints WHERE function_name = ?")
            .bind(function_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_endpoint_by_path(&self, path: &str) -> Result<Option<WebhookEndpoint>> {
        let row =
            sqlx::query_as::<_, WebhookEndpoint>("SELECT * FROM webhook_endpoints WHERE path = ?")
                .bind(path)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row)
    }

    pub async fn list_endpoints(&self) -> Result<Vec<WebhookEndpoint>> {
        let rows = sqlx::query_as::<_, WebhookEndpoint>(
            "SELECT * FROM webhook_endpoints ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // === Executions ===

    /// Insert an execution row in `pending` state.
    pub async fn insert_execution(
        &self,
        function: &str,
        request_id: &str,
        trigger_type: TriggerType,
        trigger_id: Option<&str>,
        input: &str,
    ) -> Result<Execution> {
        let execution = Execution {
            id: Uuid::new_v4().to_string(),
            function: function.to_string(),
            request_id: request_id.to_string(),
            trigger_type: trigger_type.as_str().to_string(),
            trigger_id: trigger_id.map(String::from),
            status: ExecutionStatus::Pending.as_str().to_string(),
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            input: input.to_string(),
            output: None,
            error: None,
            logs: None,
        };
        sqlx::query(
            r#"
            INSERT INTO executions
                (id, function, request_id, trigger_type, trigger_id, status, started_at, input)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&execution.id)
        .bind(&execution.function)
        .bind(&execution.request_id)
        .bind(&execution.trigger_type)
        .bind(&execution.trigger_id)
        .bind(&execution.status)
        .bind(execution.started_at)
        .bind(&execution.input)
        .execute(&self.pool)
        .await?;
        Ok(execution)
    }

    /// Move an execution to a terminal state with its outcome.
    #[allow(clippy::too_many_arguments)]
    pub async fn complete_execution(
        &self,
        id: &str,
        status: ExecutionStatus,
        duration_ms: i64,
        output: Option<&str>,
        error: Option<&str>,
        logs: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE executions
            SET status = ?, completed_at = ?, duration_ms = ?, output = ?, error = ?, logs = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(duration_ms)
        .bind(output)
        .bind(error)
        .bind(logs)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_execution(&self, id: &str) -> Result<Execution> {
        sqlx::query_as::<_, Execution>("SELECT * FROM executions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::Validation(format!("execution not found: {}", id)))
    }

    /// Recent executions, newest first, optionally filtered by function.
    pub async fn list_executions(
        &self,
        function: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Execution>> {
        let rows = match function {
            Some(name) => {
                sqlx::query_as::<_, Execution>(
                    "SELECT * FROM executions WHERE function = ? ORDER BY started_at DESC LIMIT ?",
                )
                .bind(name)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, Execution>(
                    "SELECT * FROM executions ORDER BY started_at DESC LIMIT ?",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows)
    }
}
