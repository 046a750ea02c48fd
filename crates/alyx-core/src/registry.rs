//! Function registry: discovery, catalog, reload.
//!
//! `load()` scans the functions directory; each subdirectory whose name is
//! a valid function identifier and which contains a `manifest.yaml` becomes
//! a catalog entry. Invalid manifests are skipped with a warning and the
//! scan continues. `reload()` builds a complete new catalog and swaps it
//! under the write lock, then replays every registrar so trigger bindings
//! stay declarative.

use crate::error::{Error, Result};
use crate::manifest::{is_valid_name, Function, Manifest, Runtime};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Rebinds a function's declarative triggers (routes, hooks, schedules,
/// webhook endpoints) after a catalog load. Registration replaces whatever
/// the function registered before.
#[async_trait]
pub trait Registrar: Send + Sync {
    async fn register(&self, function: &Function) -> Result<()>;
}

pub struct FunctionRegistry {
    functions_dir: PathBuf,
    catalog: RwLock<HashMap<String, Arc<Function>>>,
    registrars: Mutex<Vec<Arc<dyn Registrar>>>,
}

impl FunctionRegistry {
    pub fn new(functions_dir: impl AsRef<Path>) -> Self {
        Self {
            functions_dir: functions_dir.as_ref().to_path_buf(),
            catalog: RwLock::new(HashMap::new()),
            registrars: Mutex::new(Vec::new()),
        }
    }

    /// Attach a registrar. It is replayed on every subsequent load/reload.
    pub async fn add_registrar(&self, registrar: Arc<dyn Registrar>) {
        self.registrars.lock().await.push(registrar);
    }

    /// Scan the functions directory and populate the catalog.
    pub async fn load(&self) -> Result<()> {
        self.reload().await
    }

    /// Build a fresh catalog from disk and atomically replace the current
    /// one, then replay registrars for every function.
    pub async fn reload(&self) -> Result<()> {
        let dir = self.functions_dir.clone();
        let catalog = tokio::task::spawn_blocking(move || load_catalog(&dir))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))??;

        let functions: Vec<Arc<Function>> = catalog.values().cloned().collect();
        {
            let mut current = self.catalog.write().await;
            *current = catalog;
        }

        let registrars = self.registrars.lock().await.clone();
        for registrar in &registrars {
            for function in &functions {
                if let Err(e) = registrar.register(function).await {
                    tracing::error!(
                        "Failed to register triggers for function {}: {}",
                        function.name,
                        e
                    );
                }
            }
        }

        tracing::info!("Loaded {} functions from {}", functions.len(), self.functions_dir.display());
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Function>> {
        self.catalog.read().await.get(name).cloned()
    }

    /// All functions, sorted by name for stable output.
    pub async fn list(&self) -> Vec<Arc<Function>> {
        let mut functions: Vec<_> = self.catalog.read().await.values().cloned().collect();
        functions.sort_by(|a, b| a.name.cmp(&b.name));
        functions
    }

    pub async fn list_by_runtime(&self, runtime: Runtime) -> Vec<Arc<Function>> {
        let mut functions: Vec<_> = self
            .catalog
            .read()
            .await
            .values()
            .filter(|f| f.runtime == runtime)
            .cloned()
            .collect();
        functions.sort_by(|a, b| a.name.cmp(&b.name));
        functions
    }

    pub async fn len(&self) -> usize {
        self.catalog.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.catalog.read().await.is_empty()
    }

    pub fn functions_dir(&self) -> &Path {
        &self.functions_dir
    }
}

/// Blocking scan of the functions directory.
fn load_catalog(dir: &Path) -> Result<HashMap<String, Arc<Function>>> {
    let mut catalog = HashMap::new();
    if !dir.is_dir() {
        tracing::warn!("Functions directory {} does not exist", dir.display());
        return Ok(catalog);
    }

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !is_valid_name(name) {
            continue;
        }
        let manifest_path = path.join("manifest.yaml");
        if !manifest_path.is_file() {
            continue;
        }

        let function = std::fs::read_to_string(&manifest_path)
            .map_err(Error::Io)
            .and_then(|content| {
                Manifest::from_yaml(&content).map_err(|e| Error::Manifest {
                    path: manifest_path.clone(),
                    message: e.to_string(),
                })
            })
            .and_then(|manifest| manifest.validate(&path));

        match function {
            Ok(function) => {
                catalog.insert(function.name.clone(), Arc::new(function));
            }
            Err(e) => {
                tracing::warn!("Skipping function at {}: {}", path.display(), e);
            }
        }
    }
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn write_function(root: &Path, name: &str, yaml_extra: &str) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("index.js"), "// entry").unwrap();
        fs::write(
            dir.join("manifest.yaml"),
            format!("name: {}\nruntime: node\n{}", name, yaml_extra),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_load_scans_valid_functions() {
        let temp = TempDir::new().unwrap();
        write_function(temp.path(), "hello", "");
        write_function(temp.path(), "goodbye", "");
        // Invalid identifier: skipped without a manifest read
        fs::create_dir_all(temp.path().join("Not-Valid")).unwrap();
        // Directory without a manifest: skipped
        fs::create_dir_all(temp.path().join("empty")).unwrap();

        let registry = FunctionRegistry::new(temp.path());
        registry.load().await.unwrap();

        assert_eq!(registry.len().await, 2);
        assert!(registry.get("hello").await.is_some());
        assert!(registry.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_manifest_is_skipped() {
        let temp = TempDir::new().unwrap();
        write_function(temp.path(), "good", "");

        let bad = temp.path().join("bad");
        fs::create_dir_all(&bad).unwrap();
        fs::write(bad.join("manifest.yaml"), "name: bad\nruntime: cobol\n").unwrap();

        let registry = FunctionRegistry::new(temp.path());
        registry.load().await.unwrap();

        assert_eq!(registry.len().await, 1);
        assert!(registry.get("bad").await.is_none());
    }

    #[tokio::test]
    async fn test_reload_replaces_catalog() {
        let temp = TempDir::new().unwrap();
        write_function(temp.path(), "first", "");

        let registry = FunctionRegistry::new(temp.path());
        registry.load().await.unwrap();
        assert_eq!(registry.len().await, 1);

        fs::remove_dir_all(temp.path().join("first")).unwrap();
        write_function(temp.path(), "second", "");
        registry.reload().await.unwrap();

        assert!(registry.get("first").await.is_none());
        assert!(registry.get("second").await.is_some());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_list_by_runtime() {
        let temp = TempDir::new().unwrap();
        write_function(temp.path(), "a-node", "");
        let dir = temp.path().join("b-python");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("main.py"), "# entry").unwrap();
        fs::write(dir.join("manifest.yaml"), "name: b-python\nruntime: python\n").unwrap();

        let registry = FunctionRegistry::new(temp.path());
        registry.load().await.unwrap();

        let node = registry.list_by_runtime(Runtime::Node).await;
        assert_eq!(node.len(), 1);
        assert_eq!(node[0].name, "a-node");
        assert_eq!(registry.list_by_runtime(Runtime::Go).await.len(), 0);
        assert_eq!(registry.list().await.len(), 2);
    }

    struct CountingRegistrar {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Registrar for CountingRegistrar {
        async fn register(&self, _function: &Function) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_registrars_replayed_on_reload() {
        let temp = TempDir::new().unwrap();
        write_function(temp.path(), "hello", "");

        let registry = FunctionRegistry::new(temp.path());
        let registrar = Arc::new(CountingRegistrar {
            calls: AtomicUsize::new(0),
        });
        registry.add_registrar(registrar.clone()).await;

        registry.load().await.unwrap();
        assert_eq!(registrar.calls.load(Ordering::SeqCst), 1);

        registry.reload().await.unwrap();
        assert_eq!(registrar.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_missing_directory_loads_empty() {
        let registry = FunctionRegistry::new("/nonexistent/alyx-functions");
        registry.load().await.unwrap();
        assert!(registry.is_empty().await);
    }
}
