//! # alyx-core
//!
//! Core library for alyx - a single-node Backend-as-a-Service built around
//! function execution.
//!
//! This crate provides the domain logic for alyx without any HTTP or CLI
//! concerns. It can be embedded in other Rust applications or used
//! standalone.
//!
//! ## Features
//!
//! - **Function Registry**: Discover functions from declarative YAML
//!   manifests and serve them from an in-memory catalog with atomic reload
//! - **Subprocess Runtime**: One invocation, one process, with a JSON
//!   stdin/stdout protocol, timeouts, and cancellation
//! - **Triggers**: Synchronous HTTP invocation, verified inbound webhooks
//!   with durable retry and a dead-letter queue, and time-based schedules
//! - **Storage**: Resumable uploads finalizing into filesystem or
//!   S3-compatible backends, with transparent streaming compression
//! - **Observability**: Every invocation wrapped in a persisted execution
//!   record
//!
//! ## Quick Start
//!
//! ```ignore
//! use alyx_core::{Alyx, resolve_config};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = resolve_config(None)?;
//!     let alyx = Alyx::from_config(config).await?;
//!     alyx.start_workers().await?;
//!
//!     let response = alyx
//!         .service()
//!         .invoke(
//!             "hello",
//!             serde_json::json!({"name": "world"}),
//!             None,
//!             alyx_core::types::TriggerType::Http,
//!             None,
//!         )
//!         .await?;
//!     println!("{:?}", response.output);
//!
//!     alyx.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Function Layout
//!
//! alyx expects functions in this structure:
//!
//! ```text
//! functions/
//! ├── hello/
//! │   ├── manifest.yaml
//! │   └── index.js
//! └── billing/
//!     ├── manifest.yaml
//!     ├── handler.py
//!     └── src/...
//! ```

mod config;
mod db;
mod error;
pub mod execution;
pub mod manifest;
pub mod registry;
pub mod retry;
pub mod runtime;
mod security;
pub mod service;
pub mod signed_url;
pub mod storage;
mod store;
pub mod token;
pub mod types;
pub mod upload;
pub mod watcher;
pub mod webhook;

pub use config::{
    AlyxConfig, AuthConfig, BackendConfig, BucketConfig, CompressionType, Config, ConfigValue,
    DatabaseConfig, FunctionsConfig, ServerConfig, StorageConfig, WebhooksConfig, resolve_config,
};
pub use db::Database;
pub use error::{Error, Result};
pub use store::Store;

use execution::ExecutionLogger;
use registry::FunctionRegistry;
use retry::{RetryConfig, RetryWorker};
use runtime::SubprocessRuntime;
use service::FunctionService;
use signed_url::SignedUrlService;
use std::sync::Arc;
use std::time::Duration;
use storage::ObjectStore;
use token::InternalTokenStore;
use upload::UploadService;
use watcher::BuildWatcher;
use webhook::{WebhookGateway, WebhookRegistrar};

/// Main entry point for alyx functionality.
///
/// `Alyx` wires the function registry, subprocess runtime, webhook gateway
/// and retry worker, upload service, and execution logging over one
/// embedded SQLite store, and owns the background workers' lifecycles.
pub struct Alyx {
    config: AlyxConfig,
    db: Database,
    store: Store,
    objects: Arc<ObjectStore>,
    registry: Arc<FunctionRegistry>,
    runtime: Arc<SubprocessRuntime>,
    tokens: Arc<InternalTokenStore>,
    service: Arc<FunctionService>,
    gateway: Arc<WebhookGateway>,
    uploads: Arc<UploadService>,
    signed_urls: Arc<SignedUrlService>,
    retry: Arc<RetryWorker>,
    watcher: Arc<BuildWatcher>,
}

impl Alyx {
    /// Build the full system from configuration: open the store, run
    /// migrations, construct every subsystem, and load the function
    /// catalog (which also binds declared webhook endpoints).
    pub async fn from_config(config: AlyxConfig) -> Result<Self> {
        let db = Database::connect(&config.database.path).await?;
        let store = Store::from(&db);
        let objects = Arc::new(ObjectStore::from_config(&config.storage).await?);

        let registry = Arc::new(FunctionRegistry::new(&config.functions.dir));
        let runtime = Arc::new(SubprocessRuntime::new());
        let tokens = Arc::new(InternalTokenStore::new());

        let server = config.server.clone().unwrap_or_default();
        let alyx_url = config
            .functions
            .alyx_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", server.host, server.port));

        let service = Arc::new(FunctionService::new(
            Arc::clone(&registry),
            Arc::clone(&runtime),
            Arc::clone(&tokens),
            ExecutionLogger::new(store.clone()),
            config.functions.env.clone(),
            alyx_url,
        ));

        let gateway = Arc::new(WebhookGateway::new(store.clone(), Arc::clone(&service)));
        registry
            .add_registrar(Arc::new(WebhookRegistrar::new(
                store.clone(),
                Arc::clone(&gateway),
            )))
            .await;
        registry.load().await?;
        // Endpoints registered by previous runs are served even when the
        // catalog is empty
        gateway.sync().await?;

        let uploads = Arc::new(UploadService::new(
            store.clone(),
            Arc::clone(&objects),
            &config.storage.spool_dir,
        ));

        let signing_secret = match config.auth.as_ref().and_then(|a| a.url_signing_secret.as_ref())
        {
            Some(secret) => secret.resolve()?,
            None => {
                tracing::warn!(
                    "No url_signing_secret configured; using an ephemeral secret. \
                     Signed URLs will not survive a restart."
                );
                use rand::RngCore;
                let mut bytes = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut bytes);
                hex::encode(bytes)
            }
        };
        let signed_urls = Arc::new(SignedUrlService::new(signing_secret));

        let retry = Arc::new(RetryWorker::new(
            store.clone(),
            RetryConfig {
                max_attempts: config.webhooks.max_attempts,
                base_delay: Duration::from_millis(config.webhooks.base_delay_ms),
                poll_interval: Duration::from_millis(config.webhooks.poll_interval_ms),
                allow_private_endpoints: config.webhooks.allow_private_endpoints,
            },
        ));

        let watcher = Arc::new(BuildWatcher::new(
            Arc::clone(&registry),
            Arc::clone(&runtime),
        ));

        Ok(Self {
            config,
            db,
            store,
            objects,
            registry,
            runtime,
            tokens,
            service,
            gateway,
            uploads,
            signed_urls,
            retry,
            watcher,
        })
    }

    /// Start the background workers: source/artifact watcher, webhook
    /// retry worker, internal-token sweeper, upload expiry sweeper.
    pub async fn start_workers(&self) -> Result<()> {
        self.watcher.start().await?;
        self.retry.start();
        self.tokens.start_sweeper();
        self.uploads.start_sweeper();
        Ok(())
    }

    /// Stop workers in reverse start order and close the store.
    pub async fn shutdown(&self) {
        self.uploads.stop().await;
        self.tokens.stop().await;
        self.retry.stop().await;
        self.watcher.stop().await;
        self.db.close().await;
    }

    /// Reload the function catalog from disk and re-arm the watcher.
    pub async fn reload(&self) -> Result<()> {
        self.registry.reload().await?;
        self.watcher.start().await
    }

    pub fn config(&self) -> &AlyxConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn objects(&self) -> &Arc<ObjectStore> {
        &self.objects
    }

    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    pub fn runtime(&self) -> &Arc<SubprocessRuntime> {
        &self.runtime
    }

    pub fn tokens(&self) -> &Arc<InternalTokenStore> {
        &self.tokens
    }

    pub fn service(&self) -> &Arc<FunctionService> {
        &self.service
    }

    pub fn gateway(&self) -> &Arc<WebhookGateway> {
        &self.gateway
    }

    pub fn uploads(&self) -> &Arc<UploadService> {
        &self.uploads
    }

    pub fn signed_urls(&self) -> &Arc<SignedUrlService> {
        &self.signed_urls
    }

    pub fn retry_worker(&self) -> &Arc<RetryWorker> {
        &self.retry
    }
}
