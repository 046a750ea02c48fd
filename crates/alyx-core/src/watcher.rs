//! Source watching, debounced builds, and artifact hot reload.
//!
//! For every function that declares a build, the watcher subscribes to the
//! directories implied by `build.watch` (each glob's longest wildcard-free
//! prefix), filters events through the compiled glob set, and collapses
//! bursts with a per-function debounce so only the last burst's build
//! runs. A sibling artifact watcher observes each function's build output
//! and rebinds the runtime's artifact handle after a longer debounce to
//! ride out partial writes. Build failures are logged; the function stays
//! loaded and the watcher keeps running.

use crate::error::{Error, Result};
use crate::manifest::BuildSpec;
use crate::registry::FunctionRegistry;
use crate::runtime::SubprocessRuntime;
use globset::{Glob, GlobSet, GlobSetBuilder};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Debounce for source changes before a build runs.
pub const BUILD_DEBOUNCE: Duration = Duration::from_millis(100);

/// Debounce for artifact changes before the runtime rebinds.
pub const ARTIFACT_DEBOUNCE: Duration = Duration::from_millis(200);

/// Ceiling on a single build.
const BUILD_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// One function's watch state, captured at scan time.
struct WatchedFunction {
    name: String,
    dir: PathBuf,
    /// `None` when `build.watch` is empty: any event rooted at the
    /// function directory triggers a build.
    globs: Option<GlobSet>,
    build: BuildSpec,
    /// Absolute path of the build output, watched for hot reload.
    artifact: PathBuf,
}

type TimerMap = Arc<Mutex<HashMap<String, JoinHandle<()>>>>;

/// The debounce/scheduling half of the watcher, cheap to clone into the
/// event dispatch task.
#[derive(Clone)]
struct Scheduler {
    runtime: Arc<SubprocessRuntime>,
    build_debounce: Duration,
    artifact_debounce: Duration,
    /// Pending build timers per function; replacing a timer cancels it.
    build_timers: TimerMap,
    /// Pending artifact reload timers per function.
    reload_timers: TimerMap,
}

impl Scheduler {
    async fn dispatch(
        self,
        watched: Vec<WatchedFunction>,
        mut rx: mpsc::UnboundedReceiver<notify::Event>,
    ) {
        while let Some(event) = rx.recv().await {
            for path in &event.paths {
                for function in &watched {
                    if *path == function.artifact {
                        self.schedule_reload(function.name.clone(), function.artifact.clone());
                        continue;
                    }
                    let Ok(relative) = path.strip_prefix(&function.dir) else {
                        continue;
                    };
                    let matches = match &function.globs {
                        Some(globs) => globs.is_match(relative),
                        None => true,
                    };
                    if matches {
                        self.schedule_build(function);
                    }
                }
            }
        }
    }

    /// (Re)arm the debounce timer for a function's build. A new event
    /// while the timer is pending resets it, so a burst runs one build.
    fn schedule_build(&self, function: &WatchedFunction) {
        let name = function.name.clone();
        let dir = function.dir.clone();
        let build = function.build.clone();
        let debounce = self.build_debounce;

        let timers_for_task = Arc::clone(&self.build_timers);
        let name_for_task = name.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            // Leave the timer map before the build starts: later events
            // must queue a new build, not cancel a running one.
            timers_for_task
                .lock()
                .expect("timer lock poisoned")
                .remove(&name_for_task);
            run_build(&name_for_task, &dir, &build).await;
        });

        let mut timers = self.build_timers.lock().expect("timer lock poisoned");
        if let Some(previous) = timers.insert(name, task) {
            previous.abort();
        }
    }

    /// (Re)arm the artifact reload timer.
    fn schedule_reload(&self, name: String, artifact: PathBuf) {
        let debounce = self.artifact_debounce;
        let runtime = Arc::clone(&self.runtime);

        let timers_for_task = Arc::clone(&self.reload_timers);
        let name_for_task = name.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            timers_for_task
                .lock()
                .expect("timer lock poisoned")
                .remove(&name_for_task);
            match runtime.reload_artifact(&name_for_task, &artifact) {
                Ok(()) => tracing::info!("Reloaded artifact for {}", name_for_task),
                Err(e) => tracing::error!("Artifact reload for {} failed: {}", name_for_task, e),
            }
        });

        let mut timers = self.reload_timers.lock().expect("timer lock poisoned");
        if let Some(previous) = timers.insert(name, task) {
            previous.abort();
        }
    }
}

pub struct BuildWatcher {
    registry: Arc<FunctionRegistry>,
    scheduler: Scheduler,
    watcher: Mutex<Option<RecommendedWatcher>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl BuildWatcher {
    pub fn new(registry: Arc<FunctionRegistry>, runtime: Arc<SubprocessRuntime>) -> Self {
        Self::with_debounce(registry, runtime, BUILD_DEBOUNCE, ARTIFACT_DEBOUNCE)
    }

    pub fn with_debounce(
        registry: Arc<FunctionRegistry>,
        runtime: Arc<SubprocessRuntime>,
        build_debounce: Duration,
        artifact_debounce: Duration,
    ) -> Self {
        Self {
            registry,
            scheduler: Scheduler {
                runtime,
                build_debounce,
                artifact_debounce,
                build_timers: Arc::new(Mutex::new(HashMap::new())),
                reload_timers: Arc::new(Mutex::new(HashMap::new())),
            },
            watcher: Mutex::new(None),
            dispatcher: Mutex::new(None),
        }
    }

    /// Subscribe to the current catalog's watch paths and start
    /// dispatching events. Re-invoking after a registry reload replaces
    /// the subscriptions.
    pub async fn start(&self) -> Result<()> {
        self.stop().await;

        let mut watched = Vec::new();
        for function in self.registry.list().await {
            let Some(build) = function.build.clone() else {
                continue;
            };
            let Some(output) = function.output_path.clone() else {
                continue;
            };
            let globs = if build.watch.is_empty() {
                None
            } else {
                let mut builder = GlobSetBuilder::new();
                for pattern in &build.watch {
                    let glob = Glob::new(pattern).map_err(|e| {
                        Error::Validation(format!(
                            "invalid watch glob {} for {}: {}",
                            pattern, function.name, e
                        ))
                    })?;
                    builder.add(glob);
                }
                Some(builder.build().map_err(|e| {
                    Error::Validation(format!("glob set for {}: {}", function.name, e))
                })?)
            };
            let artifact = function.path.join(&output);
            watched.push(WatchedFunction {
                name: function.name.clone(),
                dir: function.path.clone(),
                globs,
                build,
                artifact: artifact.clone(),
            });

            // Bind the artifact if it already exists so calls work before
            // the first rebuild.
            if artifact.is_file() {
                if let Err(e) = self
                    .scheduler
                    .runtime
                    .reload_artifact(&function.name, &artifact)
                {
                    tracing::warn!("Initial artifact bind for {} failed: {}", function.name, e);
                }
            }
        }

        if watched.is_empty() {
            tracing::debug!("No functions declare builds; watcher idle");
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher =
            notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
                if let Ok(event) = event {
                    let _ = tx.send(event);
                }
            })
            .map_err(|e| Error::Storage(format!("failed to create watcher: {}", e)))?;

        for function in &watched {
            for root in watch_roots(&function.dir, &function.build.watch) {
                if let Err(e) = watcher.watch(&root, RecursiveMode::Recursive) {
                    tracing::warn!(
                        "Cannot watch {} for {}: {}",
                        root.display(),
                        function.name,
                        e
                    );
                }
            }
            // The artifact may live outside every watch root
            if let Some(parent) = function.artifact.parent() {
                if parent.is_dir() {
                    if let Err(e) = watcher.watch(parent, RecursiveMode::NonRecursive) {
                        tracing::warn!(
                            "Cannot watch artifact dir {} for {}: {}",
                            parent.display(),
                            function.name,
                            e
                        );
                    }
                }
            }
        }

        *self.watcher.lock().expect("watcher lock poisoned") = Some(watcher);
        let dispatcher = tokio::spawn(self.scheduler.clone().dispatch(watched, rx));
        *self.dispatcher.lock().expect("dispatcher lock poisoned") = Some(dispatcher);
        Ok(())
    }

    /// Drop subscriptions and cancel pending timers.
    pub async fn stop(&self) {
        *self.watcher.lock().expect("watcher lock poisoned") = None;
        let dispatcher = self
            .dispatcher
            .lock()
            .expect("dispatcher lock poisoned")
            .take();
        if let Some(dispatcher) = dispatcher {
            dispatcher.abort();
            let _ = dispatcher.await;
        }
        for timers in [&self.scheduler.build_timers, &self.scheduler.reload_timers] {
            let mut timers = timers.lock().expect("timer lock poisoned");
            for (_, handle) in timers.drain() {
                handle.abort();
            }
        }
    }
}

/// Run one build with the function directory as cwd, bounded at five
/// minutes, capturing combined output. Failure is logged and swallowed:
/// the watcher keeps running and the function stays loaded.
async fn run_build(name: &str, dir: &Path, build: &BuildSpec) {
    tracing::info!("Building {} ({} {})", name, build.command, build.args.join(" "));
    let child = tokio::process::Command::new(&build.command)
        .args(&build.args)
        .current_dir(dir)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn();
    let child = match child {
        Ok(child) => child,
        Err(e) => {
            tracing::error!("Build for {} failed to start: {}", name, e);
            return;
        }
    };

    match tokio::time::timeout(BUILD_TIMEOUT, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            if output.status.success() {
                tracing::info!("Build for {} succeeded", name);
                if !combined.trim().is_empty() {
                    tracing::debug!("Build output for {}: {}", name, combined.trim_end());
                }
            } else {
                tracing::error!(
                    "Build for {} exited with {:?}: {}",
                    name,
                    output.status.code(),
                    combined.trim_end()
                );
            }
        }
        Ok(Err(e)) => tracing::error!("Build for {} failed: {}", name, e),
        Err(_elapsed) => {
            tracing::error!(
                "Build for {} timed out after {}s",
                name,
                BUILD_TIMEOUT.as_secs()
            );
        }
    }
}

/// Directories to subscribe for a set of watch globs: each glob's longest
/// prefix with no wildcard, resolved under the function directory. Globs
/// with a leading wildcard (and an empty watch list) fall back to the
/// function directory itself.
fn watch_roots(dir: &Path, watch: &[String]) -> Vec<PathBuf> {
    if watch.is_empty() {
        return vec![dir.to_path_buf()];
    }
    let mut roots: Vec<PathBuf> = Vec::new();
    for pattern in watch {
        let mut prefix = PathBuf::new();
        for segment in pattern.split('/') {
            if segment.contains(['*', '?', '[', '{']) {
                break;
            }
            prefix.push(segment);
        }
        let root = if prefix.as_os_str().is_empty() {
            dir.to_path_buf()
        } else {
            let joined = dir.join(&prefix);
            // A file prefix (e.g. "src/app.js") is watched via its parent
            if joined.is_dir() {
                joined
            } else {
                joined.parent().map(Path::to_path_buf).unwrap_or(joined)
            }
        };
        if !roots.contains(&root) {
            roots.push(root);
        }
    }
    roots
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_watch_roots_strip_wildcard_suffix() {
        let dir = Path::new("/fns/hello");
        let roots = watch_roots(dir, &["src/**/*.js".to_string()]);
        assert_eq!(roots, vec![PathBuf::from("/fns/hello/src")]);

        let roots = watch_roots(dir, &["**/*.go".to_string()]);
        assert_eq!(roots, vec![PathBuf::from("/fns/hello")]);

        let roots = watch_roots(
            dir,
            &["src/**/*.js".to_string(), "assets/*.css".to_string()],
        );
        assert_eq!(
            roots,
            vec![
                PathBuf::from("/fns/hello/src"),
                PathBuf::from("/fns/hello/assets")
            ]
        );
    }

    #[test]
    fn test_watch_roots_empty_watch_is_function_dir() {
        let dir = Path::new("/fns/hello");
        assert_eq!(watch_roots(dir, &[]), vec![PathBuf::from("/fns/hello")]);
    }

    #[test]
    fn test_glob_matching_relative_paths() {
        let mut builder = GlobSetBuilder::new();
        builder.add(Glob::new("src/**/*.js").unwrap());
        let globs = builder.build().unwrap();

        assert!(globs.is_match("src/a.js"));
        assert!(globs.is_match("src/deep/nested/b.js"));
        assert!(!globs.is_match("src/a.ts"));
        assert!(!globs.is_match("other/a.js"));
    }

    fn write_buildable_function(root: &Path, name: &str) -> PathBuf {
        let dir = root.join(name);
        fs::create_dir_all(dir.join("src")).unwrap();
        fs::write(dir.join("index.js"), "// entry").unwrap();
        fs::write(dir.join("src/a.js"), "// source").unwrap();
        // The "build" appends a line to a log so invocations are countable
        fs::write(
            dir.join("manifest.yaml"),
            format!(
                r#"name: {name}
runtime: node
build:
  command: /bin/sh
  args: ["-c", "echo built >> build.log; cp src/a.js plugin.out"]
  watch: ["src/**/*.js"]
  output: plugin.out
"#
            ),
        )
        .unwrap();
        dir
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_burst_of_changes_runs_one_build() {
        let temp = TempDir::new().unwrap();
        let dir = write_buildable_function(temp.path(), "hello");

        let registry = Arc::new(FunctionRegistry::new(temp.path()));
        registry.load().await.unwrap();
        let runtime = Arc::new(SubprocessRuntime::new());
        let watcher = Arc::new(BuildWatcher::with_debounce(
            registry,
            runtime.clone(),
            Duration::from_millis(100),
            Duration::from_millis(200),
        ));
        watcher.start().await.unwrap();

        // Ten touches inside 50ms collapse into one build
        for i in 0..10 {
            fs::write(dir.join("src/a.js"), format!("// rev {}", i)).unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // 100ms source debounce + build + 200ms artifact debounce
        tokio::time::sleep(Duration::from_millis(900)).await;
        watcher.stop().await;

        let log = fs::read_to_string(dir.join("build.log")).unwrap_or_default();
        assert_eq!(log.lines().count(), 1, "expected one build, log: {:?}", log);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_matching_files_do_not_build() {
        let temp = TempDir::new().unwrap();
        let dir = write_buildable_function(temp.path(), "hello");

        let registry = Arc::new(FunctionRegistry::new(temp.path()));
        registry.load().await.unwrap();
        let watcher = Arc::new(BuildWatcher::with_debounce(
            registry,
            Arc::new(SubprocessRuntime::new()),
            Duration::from_millis(50),
            Duration::from_millis(100),
        ));
        watcher.start().await.unwrap();

        // A .ts file does not match src/**/*.js
        fs::write(dir.join("src/ignored.ts"), "// nope").unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        watcher.stop().await;

        assert!(!dir.join("build.log").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_build_failure_keeps_watcher_alive() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("breaks");
        fs::create_dir_all(dir.join("src")).unwrap();
        fs::write(dir.join("index.js"), "// entry").unwrap();
        fs::write(dir.join("src/a.js"), "// source").unwrap();
        fs::write(
            dir.join("manifest.yaml"),
            r#"name: breaks
runtime: node
build:
  command: /bin/sh
  args: ["-c", "echo attempt >> build.log; exit 1"]
  watch: ["src/**/*.js"]
  output: never-made.out
"#,
        )
        .unwrap();

        let registry = Arc::new(FunctionRegistry::new(temp.path()));
        registry.load().await.unwrap();
        let watcher = Arc::new(BuildWatcher::with_debounce(
            registry.clone(),
            Arc::new(SubprocessRuntime::new()),
            Duration::from_millis(50),
            Duration::from_millis(100),
        ));
        watcher.start().await.unwrap();

        fs::write(dir.join("src/a.js"), "// rev 1").unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        // The failed build did not unload the function or kill the watcher
        assert!(registry.get("breaks").await.is_some());
        fs::write(dir.join("src/a.js"), "// rev 2").unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        watcher.stop().await;

        let log = fs::read_to_string(dir.join("build.log")).unwrap_or_default();
        assert_eq!(log.lines().count(), 2);
    }
}
