//! Function invocation dispatch.
//!
//! The service resolves the named function, assembles the execution
//! context (layered environment, a fresh internal token, the host URL),
//! scopes the call to the function's timeout, and hands it to the
//! subprocess runtime — all wrapped in an execution record.

use crate::error::{Error, Result};
use crate::execution::ExecutionLogger;
use crate::registry::FunctionRegistry;
use crate::runtime::SubprocessRuntime;
use crate::token::InternalTokenStore;
use crate::types::{FunctionContext, FunctionRequest, FunctionResponse, TriggerType};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub struct FunctionService {
    registry: Arc<FunctionRegistry>,
    runtime: Arc<SubprocessRuntime>,
    tokens: Arc<InternalTokenStore>,
    logger: ExecutionLogger,
    global_env: HashMap<String, String>,
    alyx_url: String,
}

impl FunctionService {
    pub fn new(
        registry: Arc<FunctionRegistry>,
        runtime: Arc<SubprocessRuntime>,
        tokens: Arc<InternalTokenStore>,
        logger: ExecutionLogger,
        global_env: HashMap<String, String>,
        alyx_url: String,
    ) -> Self {
        Self {
            registry,
            runtime,
            tokens,
            logger,
            global_env,
            alyx_url,
        }
    }

    /// Invoke `name` with `input`. The returned response is exactly what
    /// the function produced; infrastructure failures surface as errors.
    pub async fn invoke(
        &self,
        name: &str,
        input: serde_json::Value,
        auth: Option<serde_json::Value>,
        trigger_type: TriggerType,
        trigger_id: Option<&str>,
    ) -> Result<FunctionResponse> {
        let function = self
            .registry
            .get(name)
            .await
            .ok_or_else(|| Error::FunctionNotFound(name.to_string()))?;

        // Global env first, function env wins on conflict
        let mut env = self.global_env.clone();
        env.extend(function.env.clone());

        let request = FunctionRequest {
            request_id: Uuid::new_v4().to_string(),
            function: function.name.clone(),
            input: input.clone(),
            context: FunctionContext {
                auth,
                env,
                alyx_url: self.alyx_url.clone(),
                internal_token: self.tokens.generate(),
            },
        };
        let timeout = Duration::from_secs(function.timeout_sec);

        let runtime = Arc::clone(&self.runtime);
        let function_for_call = Arc::clone(&function);
        let request_for_call = request.clone();
        self.logger
            .wrap_execution(
                &function.name,
                &request.request_id,
                trigger_type,
                trigger_id,
                &input,
                move || async move {
                    runtime
                        .call(&function_for_call, &request_for_call, timeout)
                        .await
                },
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::store::Store;
    use std::fs;
    use tempfile::TempDir;

    /// Write a `binary`-runtime function whose entrypoint is a shell
    /// script; the script echoes back the request id it reads on stdin.
    fn write_script_function(root: &std::path::Path, name: &str, script: &str) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        let entry = dir.join("main");
        fs::write(&entry, format!("#!/bin/sh\n{}\n", script)).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&entry, fs::Permissions::from_mode(0o755)).unwrap();
        }
        fs::write(
            dir.join("manifest.yaml"),
            format!("name: {}\nruntime: binary\ntimeout: 5s\n", name),
        )
        .unwrap();
    }

    async fn service_with(
        temp: &TempDir,
        global_env: HashMap<String, String>,
    ) -> (FunctionService, Store) {
        let registry = Arc::new(FunctionRegistry::new(temp.path()));
        registry.load().await.unwrap();
        let db = Database::connect_in_memory().await.unwrap();
        let store = Store::from(&db);
        let service = FunctionService::new(
            registry,
            Arc::new(SubprocessRuntime::new()),
            Arc::new(InternalTokenStore::new()),
            ExecutionLogger::new(store.clone()),
            global_env,
            "http://127.0.0.1:8090".to_string(),
        );
        (service, store)
    }

    const ECHO_SCRIPT: &str = r#"read line
id=$(printf '%s' "$line" | sed -n 's/.*"request_id":"\([^"]*\)".*/\1/p')
printf '{"request_id":"%s","success":true,"output":{"ok":true},"duration_ms":1}' "$id""#;

    #[cfg(unix)]
    #[tokio::test]
    async fn test_invoke_happy_path_logs_execution() {
        let temp = TempDir::new().unwrap();
        write_script_function(temp.path(), "echoer", ECHO_SCRIPT);
        let (service, store) = service_with(&temp, HashMap::new()).await;

        let response = service
            .invoke(
                "echoer",
                serde_json::json!({"n": 1}),
                None,
                TriggerType::Http,
                None,
            )
            .await
            .unwrap();
        assert!(response.success);

        let rows = store.list_executions(Some("echoer"), 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "succeeded");
        assert_eq!(rows[0].request_id, response.request_id);
    }

    #[tokio::test]
    async fn test_invoke_unknown_function_is_not_found() {
        let temp = TempDir::new().unwrap();
        let (service, store) = service_with(&temp, HashMap::new()).await;

        let err = service
            .invoke(
                "ghost",
                serde_json::json!({}),
                None,
                TriggerType::Http,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FunctionNotFound(_)));
        // No execution row for a function that does not exist
        assert!(store.list_executions(None, 10).await.unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_function_env_wins_over_global() {
        let temp = TempDir::new().unwrap();
        // The script prints the env it received from the request context
        let script = r#"read line
id=$(printf '%s' "$line" | sed -n 's/.*"request_id":"\([^"]*\)".*/\1/p')
stage=$(printf '%s' "$line" | sed -n 's/.*"STAGE":"\([^"]*\)".*/\1/p')
printf '{"request_id":"%s","success":true,"output":{"stage":"%s"}}' "$id" "$stage""#;
        let dir = temp.path().join("envy");
        fs::create_dir_all(&dir).unwrap();
        let entry = dir.join("main");
        fs::write(&entry, format!("#!/bin/sh\n{}\n", script)).unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&entry, fs::Permissions::from_mode(0o755)).unwrap();
        }
        fs::write(
            dir.join("manifest.yaml"),
            "name: envy\nruntime: binary\nenv:\n  STAGE: function-wins\n",
        )
        .unwrap();

        let global = HashMap::from([("STAGE".to_string(), "global".to_string())]);
        let (service, _store) = service_with(&temp, global).await;

        let response = service
            .invoke("envy", serde_json::json!({}), None, TriggerType::Http, None)
            .await
            .unwrap();
        assert_eq!(response.output.unwrap()["stage"], "function-wins");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_marks_execution_timeout() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("sleeper");
        fs::create_dir_all(&dir).unwrap();
        let entry = dir.join("main");
        fs::write(&entry, "#!/bin/sh\nsleep 30\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&entry, fs::Permissions::from_mode(0o755)).unwrap();
        }
        fs::write(
            dir.join("manifest.yaml"),
            "name: sleeper\nruntime: binary\ntimeout: 1s\n",
        )
        .unwrap();

        let (service, store) = service_with(&temp, HashMap::new()).await;
        let err = service
            .invoke(
                "sleeper",
                serde_json::json!({}),
                None,
                TriggerType::Schedule,
                Some("nightly"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));

        let rows = store.list_executions(Some("sleeper"), 10).await.unwrap();
        assert_eq!(rows[0].status, "timeout");
        assert_eq!(rows[0].trigger_id.as_deref(), Some("nightly"));
    }
}
