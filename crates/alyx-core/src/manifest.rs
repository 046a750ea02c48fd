//! Function manifest parsing and validation.
//!
//! Each function directory carries a `manifest.yaml` describing the
//! function and its triggers. Parsing is strict (unknown keys are
//! rejected); validation turns a raw [`Manifest`] into a [`Function`]
//! with durations, memory, and schedules resolved.

use crate::error::{Error, Result};
use crate::types::WebhookVerification;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Runtimes a function may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    Node,
    Deno,
    Bun,
    Python,
    Go,
    Binary,
}

impl Runtime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Runtime::Node => "node",
            Runtime::Deno => "deno",
            Runtime::Bun => "bun",
            Runtime::Python => "python",
            Runtime::Go => "go",
            Runtime::Binary => "binary",
        }
    }

    /// Conventional entrypoint used when the manifest does not name one.
    pub fn default_entrypoint(&self) -> &'static str {
        match self {
            Runtime::Node | Runtime::Deno | Runtime::Bun => "index.js",
            Runtime::Python => "main.py",
            Runtime::Go => "main.go",
            Runtime::Binary => "main",
        }
    }
}

impl FromStr for Runtime {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "node" => Ok(Runtime::Node),
            "deno" => Ok(Runtime::Deno),
            "bun" => Ok(Runtime::Bun),
            "python" => Ok(Runtime::Python),
            "go" => Ok(Runtime::Go),
            "binary" => Ok(Runtime::Binary),
            other => Err(format!("unknown runtime: {}", other)),
        }
    }
}

/// Raw manifest as written in `manifest.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    pub name: String,
    pub runtime: Runtime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout: String,
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<HookSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub schedules: Vec<ScheduleSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildSpec>,
}

fn default_timeout() -> String {
    "30s".to_string()
}

fn default_memory() -> String {
    "128mb".to_string()
}

/// An HTTP route a function binds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteSpec {
    pub path: String,
    pub methods: Vec<String>,
}

/// A database/auth/webhook event subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HookSpec {
    #[serde(rename = "type")]
    pub kind: HookKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<HookMode>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub config: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<WebhookVerification>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookKind {
    Database,
    Auth,
    Webhook,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookMode {
    Sync,
    Async,
}

/// A time-based trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ScheduleKind,
    pub expression: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub config: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Cron,
    Interval,
    OneTime,
}

/// Optional build step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildSpec {
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub watch: Vec<String>,
    pub output: String,
}

/// A validated function, ready for the registry catalog.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub runtime: Runtime,
    /// Absolute path of the function directory
    pub path: PathBuf,
    /// Entrypoint file, relative to `path`
    pub entrypoint: String,
    /// Build output path relative to `path`, when a build is declared
    pub output_path: Option<String>,
    pub build: Option<BuildSpec>,
    pub timeout_sec: u64,
    pub memory_mb: u64,
    pub env: HashMap<String, String>,
    pub hooks: Vec<HookSpec>,
    pub schedules: Vec<ScheduleSpec>,
    pub routes: Vec<RouteSpec>,
}

impl Manifest {
    pub fn from_yaml(content: &str) -> std::result::Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }

    /// Validate the manifest against the function directory and resolve it
    /// into a [`Function`]. `dir` must be the directory the manifest was
    /// loaded from; its basename must match the manifest name.
    pub fn validate(self, dir: &Path) -> Result<Function> {
        let manifest_err = |message: String| Error::Manifest {
            path: dir.join("manifest.yaml"),
            message,
        };

        if !is_valid_name(&self.name) {
            return Err(manifest_err(format!("invalid function name: {}", self.name)));
        }
        let dir_name = dir.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if dir_name != self.name {
            return Err(manifest_err(format!(
                "manifest name {} does not match directory {}",
                self.name, dir_name
            )));
        }

        let timeout_sec = parse_duration_secs(&self.timeout)
            .map_err(|e| manifest_err(format!("invalid timeout: {}", e)))?;
        if timeout_sec == 0 {
            return Err(manifest_err("timeout must be greater than zero".to_string()));
        }
        let memory_mb = parse_memory_mb(&self.memory)
            .map_err(|e| manifest_err(format!("invalid memory: {}", e)))?;

        for route in &self.routes {
            if !route.path.starts_with('/') {
                return Err(manifest_err(format!(
                    "route path must start with '/': {}",
                    route.path
                )));
            }
            if route.methods.is_empty() {
                return Err(manifest_err(format!(
                    "route {} declares no methods",
                    route.path
                )));
            }
            for method in &route.methods {
                if !is_standard_method(method) {
                    return Err(manifest_err(format!("invalid HTTP method: {}", method)));
                }
            }
        }

        for hook in &self.hooks {
            if hook.kind == HookKind::Webhook {
                if hook.verification.is_none() {
                    return Err(manifest_err(
                        "webhook hooks require verification".to_string(),
                    ));
                }
                if !hook.config.contains_key("path") {
                    return Err(manifest_err(
                        "webhook hooks require config.path".to_string(),
                    ));
                }
            }
        }

        for schedule in &self.schedules {
            validate_schedule(schedule).map_err(manifest_err)?;
        }

        let mut output_path = None;
        if let Some(build) = &self.build {
            if build.command.trim().is_empty() {
                return Err(manifest_err("build.command must not be empty".to_string()));
            }
            if build.output.trim().is_empty() {
                return Err(manifest_err("build.output must not be empty".to_string()));
            }
            if Path::new(&build.output).is_absolute() {
                return Err(manifest_err(format!(
                    "build.output must be relative to the function directory: {}",
                    build.output
                )));
            }
            output_path = Some(build.output.clone());
        }

        let entrypoint = self
            .entrypoint
            .clone()
            .unwrap_or_else(|| self.runtime.default_entrypoint().to_string());
        if !dir.join(&entrypoint).is_file() {
            return Err(manifest_err(format!(
                "entrypoint {} does not exist",
                entrypoint
            )));
        }

        Ok(Function {
            name: self.name,
            runtime: self.runtime,
            path: dir.to_path_buf(),
            entrypoint,
            output_path,
            build: self.build,
            timeout_sec,
            memory_mb,
            env: self.env,
            hooks: self.hooks,
            schedules: self.schedules,
            routes: self.routes,
        })
    }
}

/// Function names: `^[a-z][a-z0-9_-]*$`
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

fn is_standard_method(method: &str) -> bool {
    matches!(
        method.to_ascii_uppercase().as_str(),
        "GET" | "POST" | "PUT" | "DELETE" | "PATCH" | "HEAD" | "OPTIONS"
    )
}

/// Parse `N` (seconds), `Ns`, or `Nm`.
pub fn parse_duration_secs(value: &str) -> std::result::Result<u64, String> {
    let value = value.trim();
    let (digits, multiplier) = if let Some(rest) = value.strip_suffix('s') {
        (rest, 1)
    } else if let Some(rest) = value.strip_suffix('m') {
        (rest, 60)
    } else {
        (value, 1)
    };
    let n: u64 = digits
        .parse()
        .map_err(|_| format!("not a duration: {}", value))?;
    Ok(n * multiplier)
}

/// Parse `N` (MB), `Nmb`, or `Ngb` (case-insensitive).
pub fn parse_memory_mb(value: &str) -> std::result::Result<u64, String> {
    let value = value.trim().to_ascii_lowercase();
    let (digits, multiplier) = if let Some(rest) = value.strip_suffix("mb") {
        (rest, 1)
    } else if let Some(rest) = value.strip_suffix("gb") {
        (rest, 1024)
    } else {
        (value.as_str(), 1)
    };
    let n: u64 = digits
        .parse()
        .map_err(|_| format!("not a memory size: {}", value))?;
    Ok(n * multiplier)
}

fn validate_schedule(schedule: &ScheduleSpec) -> std::result::Result<(), String> {
    match schedule.kind {
        ScheduleKind::Cron => {
            // Full parsing belongs to the scheduler; here only the shape is
            // checked: a @macro or five/six whitespace-separated fields.
            let expr = schedule.expression.trim();
            if expr.starts_with('@') {
                if expr.len() < 2 {
                    return Err(format!("invalid cron expression: {}", expr));
                }
            } else {
                let fields = expr.split_whitespace().count();
                if !(5..=6).contains(&fields) {
                    return Err(format!(
                        "cron expression must have 5 or 6 fields: {}",
                        expr
                    ));
                }
            }
        }
        ScheduleKind::Interval => {
            humantime::parse_duration(schedule.expression.trim())
                .map_err(|e| format!("invalid interval: {}", e))?;
        }
        ScheduleKind::OneTime => {
            chrono::DateTime::parse_from_rfc3339(schedule.expression.trim())
                .map_err(|e| format!("invalid one_time instant: {}", e))?;
        }
    }
    if let Some(tz) = &schedule.timezone {
        tz.parse::<chrono_tz::Tz>()
            .map_err(|_| format!("unknown timezone: {}", tz))?;
    }
    Ok(())
}
