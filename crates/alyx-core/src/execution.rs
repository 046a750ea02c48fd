//! Execution logging.
//!
//! Wraps each invocation in a persisted record: a `pending` row goes in
//! before the call, and the terminal status, output, error, and duration
//! are written after. Logging is best-effort; a persistence failure never
//! masks the invocation's own result.

use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::{ExecutionStatus, FunctionResponse, TriggerType};
use std::future::Future;
use std::time::Instant;

pub struct ExecutionLogger {
    store: Store,
}

impl ExecutionLogger {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Run `call` inside an execution record.
    pub async fn wrap_execution<F, Fut>(
        &self,
        function: &str,
        request_id: &str,
        trigger_type: TriggerType,
        trigger_id: Option<&str>,
        input: &serde_json::Value,
        call: F,
    ) -> Result<FunctionResponse>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<FunctionResponse>>,
    {
        let input_json = input.to_string();
        let execution = match self
            .store
            .insert_execution(function, request_id, trigger_type, trigger_id, &input_json)
            .await
        {
            Ok(execution) => Some(execution),
            Err(e) => {
                tracing::error!("Failed to record execution for {}: {}", function, e);
                None
            }
        };

        let started = Instant::now();
        let result = call().await;
        let duration_ms = started.elapsed().as_millis() as i64;

        if let Some(execution) = execution {
            let (status, output, error, logs) = summarize(&result);
            if let Err(e) = self
                .store
                .complete_execution(
                    &execution.id,
                    status,
                    duration_ms,
                    output.as_deref(),
                    error.as_deref(),
                    logs.as_deref(),
                )
                .await
            {
                tracing::error!("Failed to complete execution record for {}: {}", function, e);
            }
        }

        result
    }
}

/// Map an invocation result onto the execution row's terminal fields.
fn summarize(
    result: &Result<FunctionResponse>,
) -> (
    ExecutionStatus,
    Option<String>,
    Option<String>,
    Option<String>,
) {
    match result {
        Ok(response) => {
            let logs = response
                .logs
                .as_ref()
                .and_then(|logs| serde_json::to_string(logs).ok());
            let output = response.output.as_ref().map(|o| o.to_string());
            if response.success {
                (ExecutionStatus::Succeeded, output, None, logs)
            } else {
                // The function-reported code and message are preserved verbatim
                let error = response
                    .error
                    .as_ref()
                    .and_then(|e| serde_json::to_string(e).ok())
                    .unwrap_or_else(|| "\"unspecified function error\"".to_string());
                (ExecutionStatus::Failed, output, Some(error), logs)
            }
        }
        Err(e @ Error::Timeout { .. }) => (ExecutionStatus::Timeout, None, Some(e.to_string()), None),
        Err(e) => (ExecutionStatus::Failed, None, Some(e.to_string()), None),
    }
}
