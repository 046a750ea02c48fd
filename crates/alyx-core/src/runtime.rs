//! Subprocess runtime: one invocation, one process.
//!
//! Each call spawns a fresh interpreter (or the entrypoint itself for the
//! `binary` runtime) with the function directory as its working directory,
//! writes the request JSON to stdin, and parses a single JSON response
//! from stdout. Stderr is captured for diagnostics. The invocation timeout
//! kills the process. There is no pooling and no cross-call state; the
//! host OS enforces the resource limits the manifest advertises.

use crate::error::{Error, Result};
use crate::manifest::{Function, Runtime};
use crate::types::{FunctionRequest, FunctionResponse};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

/// Cap on captured stderr, matching what ends up in error messages.
const MAX_STDERR_BYTES: u64 = 64 * 1024;

/// Tail of stderr included in structured errors.
const STDERR_TAIL_CHARS: usize = 512;

/// An open handle to a function's build artifact.
///
/// The handle is held (not just the path) so a reload can close the old
/// artifact before binding the new one.
struct Artifact {
    path: PathBuf,
    _file: std::fs::File,
}

pub struct SubprocessRuntime {
    /// Current artifact binding per function. `None` means the last reload
    /// failed: calls fail fast until a good artifact appears.
    artifacts: Mutex<HashMap<String, Option<Artifact>>>,
}

impl Default for SubprocessRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl SubprocessRuntime {
    pub fn new() -> Self {
        Self {
            artifacts: Mutex::new(HashMap::new()),
        }
    }

    /// Swap in a new artifact for `name`: close any live handle, open the
    /// new file, make it the current binding. On failure the binding is
    /// left empty so subsequent calls fail fast.
    pub fn reload_artifact(&self, name: &str, path: &Path) -> Result<()> {
        let mut artifacts = self.artifacts.lock().expect("artifact lock poisoned");
        // Drop the old handle before opening the new one
        artifacts.insert(name.to_string(), None);
        match std::fs::File::open(path) {
            Ok(file) => {
                artifacts.insert(
                    name.to_string(),
                    Some(Artifact {
                        path: path.to_path_buf(),
                        _file: file,
                    }),
                );
                Ok(())
            }
            Err(e) => Err(Error::Runtime {
                function: name.to_string(),
                message: format!("failed to open artifact {}: {}", path.display(), e),
            }),
        }
    }

    pub fn clear_artifact(&self, name: &str) {
        self.artifacts
            .lock()
            .expect("artifact lock poisoned")
            .remove(name);
    }

    fn artifact_path(&self, name: &str) -> Result<PathBuf> {
        let artifacts = self.artifacts.lock().expect("artifact lock poisoned");
        match artifacts.get(name) {
            Some(Some(artifact)) => Ok(artifact.path.clone()),
            _ => Err(Error::Runtime {
                function: name.to_string(),
                message: "artifact is not loaded".to_string(),
            }),
        }
    }

    /// Build the command for a function. The runtime owns the fixed
    /// runtime-to-interpreter mapping; `binary` executes the entrypoint
    /// directly after an executable-bit check.
    fn command_for(&self, function: &Function) -> Result<Command> {
        let entrypoint = match (&function.output_path, function.runtime) {
            // A built function runs its current artifact binding
            (Some(_), _) => self.artifact_path(&function.name)?,
            (None, _) => function.path.join(&function.entrypoint),
        };

        let mut command = match function.runtime {
            Runtime::Node => {
                let mut c = Command::new("node");
                c.arg(&entrypoint);
                c
            }
            Runtime::Deno => {
                let mut c = Command::new("deno");
                c.arg("run").arg("--allow-all").arg(&entrypoint);
                c
            }
            Runtime::Bun => {
                let mut c = Command::new("bun");
                c.arg("run").arg(&entrypoint);
                c
            }
            Runtime::Python => {
                let mut c = Command::new("python3");
                c.arg(&entrypoint);
                c
            }
            Runtime::Go => {
                let mut c = Command::new("go");
                c.arg("run").arg(&entrypoint);
                c
            }
            Runtime::Binary => {
                ensure_executable(&function.name, &entrypoint)?;
                Command::new(&entrypoint)
            }
        };
        command.current_dir(&function.path);
        Ok(command)
    }

    /// Execute one invocation. The process is killed when `timeout` fires.
    pub async fn call(
        &self,
        function: &Function,
        request: &FunctionRequest,
        timeout: Duration,
    ) -> Result<FunctionResponse> {
        let mut command = self.command_for(function)?;
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Runtime {
                function: function.name.clone(),
                message: format!("failed to spawn {} process: {}", function.runtime.as_str(), e),
            })?;

        let mut stdin = child.stdin.take().ok_or_else(|| Error::Runtime {
            function: function.name.clone(),
            message: "failed to open stdin pipe".to_string(),
        })?;
        let payload = serde_json::to_vec(request)?;
        let stdin_task = tokio::spawn(async move {
            // Broken pipe is expected when the child exits without reading
            let _ = stdin.write_all(&payload).await;
            let _ = stdin.shutdown().await;
        });

        let stderr = child.stderr.take().ok_or_else(|| Error::Runtime {
            function: function.name.clone(),
            message: "failed to open stderr pipe".to_string(),
        })?;
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let mut limited = stderr.take(MAX_STDERR_BYTES);
            let _ = limited.read_to_string(&mut buf).await;
            buf
        });

        let mut stdout = child.stdout.take().ok_or_else(|| Error::Runtime {
            function: function.name.clone(),
            message: "failed to open stdout pipe".to_string(),
        })?;

        let waited = tokio::time::timeout(timeout, async {
            let mut out = Vec::new();
            stdout.read_to_end(&mut out).await?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((out, status))
        })
        .await;

        let (stdout_bytes, status) = match waited {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                stdin_task.abort();
                return Err(Error::Runtime {
                    function: function.name.clone(),
                    message: format!("process I/O failed: {}", e),
                });
            }
            Err(_elapsed) => {
                let _ = child.kill().await;
                stdin_task.abort();
                return Err(Error::Timeout {
                    function: function.name.clone(),
                    timeout_secs: timeout.as_secs(),
                });
            }
        };

        let _ = stdin_task.await;
        let stderr_output = stderr_task.await.unwrap_or_default();
        if !stderr_output.is_empty() {
            tracing::debug!("Function {} stderr: {}", function.name, stderr_output.trim_end());
        }

        let response: FunctionResponse = match serde_json::from_slice(&stdout_bytes) {
            Ok(response) => response,
            Err(parse_err) => {
                if !status.success() {
                    return Err(Error::FunctionExit {
                        function: function.name.clone(),
                        code: status.code(),
                        stderr: stderr_tail(&stderr_output),
                    });
                }
                return Err(Error::Runtime {
                    function: function.name.clone(),
                    message: format!(
                        "invalid response on stdout: {} (stderr: {})",
                        parse_err,
                        stderr_tail(&stderr_output)
                    ),
                });
            }
        };

        if response.request_id != request.request_id {
            return Err(Error::Runtime {
                function: function.name.clone(),
                message: format!(
                    "response request_id {} does not match request {}",
                    response.request_id, request.request_id
                ),
            });
        }

        Ok(response)
    }
}

fn stderr_tail(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.chars().count() <= STDERR_TAIL_CHARS {
        return trimmed.to_string();
    }
    let skip = trimmed.chars().count() - STDERR_TAIL_CHARS;
    trimmed.chars().skip(skip).collect()
}

#[cfg(unix)]
fn ensure_executable(function: &str, path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let metadata = std::fs::metadata(path).map_err(|e| Error::Runtime {
        function: function.to_string(),
        message: format!("cannot stat entrypoint {}: {}", path.display(), e),
    })?;
    if metadata.permissions().mode() & 0o111 == 0 {
        return Err(Error::Runtime {
            function: function.to_string(),
            message: format!("entrypoint {} is not executable", path.display()),
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn ensure_executable(_function: &str, _path: &Path) -> Result<()> {
    Ok(())
}
