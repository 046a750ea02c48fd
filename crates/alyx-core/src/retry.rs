//! Durable webhook delivery with exponential backoff.
//!
//! Deliveries are ordinary rows in `_alyx_webhook_queue`. The worker polls
//! for due rows (pending or retrying, retry time unset or elapsed), POSTs
//! each payload, and either marks the row succeeded, schedules the next
//! attempt, or moves it to the dead-letter queue once the attempt budget
//! is spent. Delivery is at-least-once: a 2xx lost in flight retries, so
//! consumers must be idempotent. Rows are claimed oldest-first but
//! delivered concurrently; senders that need strict per-endpoint ordering
//! must serialize on their side.

use crate::error::Result;
use crate::security::is_safe_ip;
use crate::store::Store;
use crate::types::QueuedWebhook;
use chrono::{Duration as ChronoDuration, Utc};
use std::net::ToSocketAddrs;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Rows claimed per poll.
const CLAIM_BATCH: i64 = 100;

/// Per-attempt HTTP timeout.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Cap on the backoff exponent: base_delay * 2^30 at most.
const MAX_BACKOFF_EXPONENT: u32 = 30;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub poll_interval: Duration,
    /// Deliver to private/internal addresses (development only).
    pub allow_private_endpoints: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            poll_interval: Duration::from_secs(5),
            allow_private_endpoints: false,
        }
    }
}

struct WorkerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// The delivery half of the worker, cheap to clone into the poll task.
#[derive(Clone)]
struct Deliverer {
    store: Store,
    config: RetryConfig,
}

impl Deliverer {
    /// Claim and deliver one batch of due rows.
    async fn process_batch(&self) -> Result<usize> {
        let due = self.store.due_webhooks(Utc::now(), CLAIM_BATCH).await?;
        let count = due.len();
        let deliveries = due.into_iter().map(|row| self.deliver(row));
        futures_util::future::join_all(deliveries).await;
        Ok(count)
    }

    /// Attempt one delivery and update the row accordingly.
    async fn deliver(&self, row: QueuedWebhook) {
        let outcome = self.post(&row).await;
        match outcome {
            Ok(()) => {
                if let Err(e) = self.store.mark_webhook_succeeded(&row.id).await {
                    tracing::error!("Failed to mark webhook {} succeeded: {}", row.id, e);
                }
            }
            Err(reason) => {
                let attempt = row.attempt + 1;
                if attempt >= i64::from(self.config.max_attempts) {
                    tracing::warn!(
                        "Webhook {} to {} exhausted after {} attempts: {}",
                        row.webhook_id,
                        row.endpoint_url,
                        attempt,
                        reason
                    );
                    if let Err(e) = self.store.move_webhook_to_dlq(&row, attempt, &reason).await {
                        tracing::error!("Failed to move webhook {} to DLQ: {}", row.id, e);
                    }
                } else {
                    let exponent = u32::try_from(attempt)
                        .unwrap_or(MAX_BACKOFF_EXPONENT)
                        .min(MAX_BACKOFF_EXPONENT);
                    let delay = self.config.base_delay * 2u32.pow(exponent);
                    let next_retry_at = Utc::now()
                        + ChronoDuration::from_std(delay)
                            .unwrap_or_else(|_| ChronoDuration::seconds(i64::from(u32::MAX)));
                    tracing::debug!(
                        "Webhook {} attempt {} failed ({}), next retry at {}",
                        row.webhook_id,
                        attempt,
                        reason,
                        next_retry_at
                    );
                    if let Err(e) = self
                        .store
                        .schedule_webhook_retry(&row.id, attempt, next_retry_at)
                        .await
                    {
                        tracing::error!("Failed to schedule retry for webhook {}: {}", row.id, e);
                    }
                }
            }
        }
    }

    /// POST the payload. Any non-2xx status or transport failure is a
    /// delivery failure described by the returned string.
    async fn post(&self, row: &QueuedWebhook) -> std::result::Result<(), String> {
        let client = self.client_for(&row.endpoint_url)?;
        let mut request = client
            .post(&row.endpoint_url)
            .timeout(DELIVERY_TIMEOUT)
            .body(row.payload.clone());
        for (name, value) in &row.headers {
            request = request.header(name, value);
        }
        match request.send().await {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => Err(format!("endpoint returned {}", response.status())),
            Err(e) => Err(format!("request failed: {}", e)),
        }
    }

    /// Build a client for the endpoint. Unless private endpoints are
    /// allowed, DNS is resolved once, every address is screened, and the
    /// connection is pinned to a validated address so the target cannot
    /// move between validation and connect.
    fn client_for(&self, url: &str) -> std::result::Result<reqwest::Client, String> {
        let parsed = reqwest::Url::parse(url).map_err(|e| format!("invalid URL: {}", e))?;
        let scheme = parsed.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(format!("unsupported scheme: {}", scheme));
        }

        let mut builder = reqwest::Client::builder().redirect(reqwest::redirect::Policy::none());

        if !self.config.allow_private_endpoints {
            let host = parsed
                .host_str()
                .ok_or_else(|| "missing host".to_string())?
                .to_string();
            let port = parsed.port_or_known_default().unwrap_or(443);
            let addrs: Vec<std::net::SocketAddr> = format!("{}:{}", host, port)
                .to_socket_addrs()
                .map_err(|e| format!("DNS resolution failed: {}", e))?
                .collect();
            let safe_addr = addrs
                .into_iter()
                .find(|a| is_safe_ip(&a.ip()))
                .ok_or_else(|| "all resolved addresses are private/internal".to_string())?;
            builder = builder.resolve(&host, safe_addr);
        }

        builder
            .build()
            .map_err(|e| format!("client build failed: {}", e))
    }
}

pub struct RetryWorker {
    deliverer: Deliverer,
    handle: Mutex<Option<WorkerHandle>>,
}

impl RetryWorker {
    pub fn new(store: Store, config: RetryConfig) -> Self {
        Self {
            deliverer: Deliverer { store, config },
            handle: Mutex::new(None),
        }
    }

    /// Start the poll loop. Idempotent.
    pub fn start(&self) {
        let mut handle = self.handle.lock().expect("worker lock poisoned");
        if handle.is_some() {
            return;
        }
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let deliverer = self.deliverer.clone();
        let poll_interval = deliverer.config.poll_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = deliverer.process_batch().await {
                            tracing::error!("Webhook retry poll failed: {}", e);
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
            }
        });
        *handle = Some(WorkerHandle { stop: stop_tx, task });
    }

    /// Stop the worker and wait for the loop to exit. Idempotent.
    pub async fn stop(&self) {
        let handle = self.handle.lock().expect("worker lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.stop.send(true);
            let _ = handle.task.await;
        }
    }

    /// Claim and deliver one batch of due rows. Exposed so tests and
    /// embedders can drive the worker without the poll loop.
    pub async fn process_batch(&self) -> Result<usize> {
        self.deliverer.process_batch().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal HTTP server answering every request with the given status.
    /// Returns its URL and a counter of requests served.
    async fn stub_server(status: u16) -> (String, Arc<std::sync::atomic::AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                hits_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {} X\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                    status
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        (format!("http://{}/hook", addr), hits)
    }

    async fn worker(config: RetryConfig) -> (RetryWorker, Store) {
        let db = Database::connect_in_memory().await.unwrap();
        let store = Store::from(&db);
        (RetryWorker::new(store.clone(), config), store)
    }

    fn test_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(10),
            poll_interval: Duration::from_millis(50),
            allow_private_endpoints: true,
        }
    }

    #[tokio::test]
    async fn test_successful_delivery_marks_succeeded() {
        let (worker, store) = worker(test_config(3)).await;
        let (url, hits) = stub_server(200).await;
        store
            .enqueue_webhook("wh-1", &url, r#"{"event":"x"}"#, &HashMap::new())
            .await
            .unwrap();

        let processed = worker.process_batch().await.unwrap();
        assert_eq!(processed, 1);
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
        // Row is terminal: nothing due anymore
        assert_eq!(worker.process_batch().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failure_schedules_backoff() {
        let (worker, store) = worker(test_config(3)).await;
        let (url, _) = stub_server(500).await;
        let row = store
            .enqueue_webhook("wh-2", &url, "{}", &HashMap::new())
            .await
            .unwrap();

        worker.process_batch().await.unwrap();

        // Attempt 1 recorded; retry scheduled in the future
        let due_now = store.due_webhooks(Utc::now(), 100).await.unwrap();
        assert!(due_now.is_empty());
        let due_later = store
            .due_webhooks(Utc::now() + ChronoDuration::seconds(60), 100)
            .await
            .unwrap();
        assert_eq!(due_later.len(), 1);
        assert_eq!(due_later[0].id, row.id);
        assert_eq!(due_later[0].attempt, 1);
        assert_eq!(due_later[0].status, "retrying");
    }

    #[tokio::test]
    async fn test_exhaustion_moves_to_dlq() {
        let (worker, store) = worker(test_config(3)).await;
        let (url, _) = stub_server(500).await;
        store
            .enqueue_webhook("wh-3", &url, "{}", &HashMap::new())
            .await
            .unwrap();

        // Drive three delivery cycles, skipping past each backoff by
        // rescheduling the row as immediately due.
        for _ in 0..3 {
            let due = store
                .due_webhooks(Utc::now() + ChronoDuration::days(1), 100)
                .await
                .unwrap();
            if let Some(row) = due.first() {
                store
                    .schedule_webhook_retry(
                        &row.id,
                        row.attempt,
                        Utc::now() - ChronoDuration::seconds(1),
                    )
                    .await
                    .unwrap();
            }
            worker.process_batch().await.unwrap();
        }

        let dlq = store.list_dead_letters(10).await.unwrap();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].attempts, 3);
        assert!(!dlq[0].last_error.is_empty());
        assert_eq!(dlq[0].webhook_id, "wh-3");

        // Queue row is terminal
        assert!(store
            .due_webhooks(Utc::now() + ChronoDuration::days(1), 100)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_private_endpoint_rejected_when_screening() {
        let config = RetryConfig {
            allow_private_endpoints: false,
            ..test_config(3)
        };
        let (worker, store) = worker(config).await;
        store
            .enqueue_webhook("wh-4", "http://127.0.0.1:9/hook", "{}", &HashMap::new())
            .await
            .unwrap();

        worker.process_batch().await.unwrap();

        // The delivery failed the screen and counted as an attempt
        let due = store
            .due_webhooks(Utc::now() + ChronoDuration::days(1), 100)
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].attempt, 1);
    }

    #[tokio::test]
    async fn test_worker_start_stop_idempotent() {
        let (worker, _) = worker(test_config(3)).await;
        worker.start();
        worker.start();
        worker.stop().await;
        worker.stop().await;
    }

    #[tokio::test]
    async fn test_loop_drains_queue_to_success() {
        let (worker, store) = worker(test_config(3)).await;
        let (url, _) = stub_server(204).await;
        store
            .enqueue_webhook("wh-5", &url, "{}", &HashMap::new())
            .await
            .unwrap();

        worker.start();
        tokio::time::sleep(Duration::from_millis(300)).await;
        worker.stop().await;

        assert!(store.due_webhooks(Utc::now(), 100).await.unwrap().is_empty());
        assert!(store.list_dead_letters(10).await.unwrap().is_empty());
    }
}
