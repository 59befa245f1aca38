//! Kubeconfig sync engine
//!
//! ```text
//! roots ──scan + watch──► WatchEvent ──► per-path worker ──► diff ──► ClusterStore
//! ```
//!
//! Work for one path is serialized and a newer event for the same path
//! supersedes an older one that has not been applied yet. Different paths are
//! processed independently.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kubedesk_cluster::ClusterRegistry;
use kubedesk_k8s::kubeconfig;
use kubedesk_types::{ClusterId, ClusterModel};

use crate::diff::{ContextDiff, ContextSet, diff};
use crate::watch::{IgnoreRules, SourceWatch, WatchEvent, scan};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to watch {path}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error("invalid ignore pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error(transparent)]
    Kubeconfig(#[from] kubeconfig::KubeconfigError),
}

/// Where synced clusters go
pub trait ClusterStore: Send + Sync + 'static {
    /// Create or update the cluster for `model`
    fn acquire(&self, model: ClusterModel) -> bool;

    /// Disconnect and delete a cluster
    fn release(&self, id: &ClusterId) -> bool;
}

impl ClusterStore for ClusterRegistry {
    fn acquire(&self, model: ClusterModel) -> bool {
        ClusterRegistry::acquire(self, model)
    }

    fn release(&self, id: &ClusterId) -> bool {
        ClusterRegistry::release(self, id)
    }
}

#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Files or directories holding kubeconfigs
    pub roots: Vec<PathBuf>,

    /// Directory levels below a root that are scanned and watched
    pub max_depth: usize,

    /// File name patterns to skip
    pub ignore: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            max_depth: 1,
            ignore: vec![r"^\.".to_string(), r"~$".to_string(), r"\.swp$".to_string()],
        }
    }
}

/// What one file last contributed
#[derive(Default)]
struct Source {
    contexts: ContextSet,
    digest: Option<Vec<u8>>,
}

#[derive(Default)]
struct PathSlot {
    lock: Arc<tokio::sync::Mutex<()>>,
    generation: u64,
}

pub struct SyncEngine {
    store: Arc<dyn ClusterStore>,
    config: SyncConfig,
    ignore: IgnoreRules,
    sources: Mutex<HashMap<PathBuf, Source>>,
    slots: Mutex<HashMap<PathBuf, PathSlot>>,
    watches: Mutex<Vec<SourceWatch>>,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn ClusterStore>, config: SyncConfig) -> Result<Arc<Self>, SyncError> {
        let ignore = IgnoreRules::new(&config.ignore)?;
        Ok(Arc::new(Self {
            store,
            config,
            ignore,
            sources: Mutex::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
            watches: Mutex::new(Vec::new()),
        }))
    }

    /// Scan and watch every root until `shutdown` is cancelled
    ///
    /// Roots that cannot be watched are logged and skipped.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();

        for root in &self.config.roots {
            for path in scan(root, self.config.max_depth, &self.ignore) {
                let _ = tx.send(WatchEvent::Changed(path));
            }
            match SourceWatch::start(root, self.config.max_depth, self.ignore.clone(), tx.clone()) {
                Ok(watch) => self.watches.lock().push(watch),
                Err(source) => {
                    let e = SyncError::Watch {
                        path: root.clone(),
                        source,
                    };
                    warn!(error = %e, "Not watching kubeconfig source");
                }
            }
        }
        drop(tx);

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(event) => {
                            tokio::spawn(Arc::clone(&engine).dispatch(event));
                        }
                        None => break,
                    },
                    _ = shutdown.cancelled() => break,
                }
            }
            engine.stop();
        })
    }

    /// Release every watch handle; idempotent
    pub fn stop(&self) {
        let watches = std::mem::take(&mut *self.watches.lock());
        if !watches.is_empty() {
            info!(count = watches.len(), "Stopping kubeconfig watches");
        }
        for watch in &watches {
            watch.stop();
        }
    }

    pub fn watch_count(&self) -> usize {
        self.watches.lock().len()
    }

    /// Cluster ids currently contributed by `path`
    pub fn clusters_from(&self, path: &Path) -> Vec<ClusterId> {
        self.sources
            .lock()
            .get(path)
            .map(|source| source.contexts.values().map(|m| m.id.clone()).collect())
            .unwrap_or_default()
    }

    async fn dispatch(self: Arc<Self>, event: WatchEvent) {
        let path = event.path().to_path_buf();
        let (lock, generation) = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(path.clone()).or_default();
            slot.generation += 1;
            (Arc::clone(&slot.lock), slot.generation)
        };
        let _serialized = lock.lock().await;

        if self.is_superseded(&path, generation) {
            debug!(path = %path.display(), "Skipping superseded event");
            return;
        }

        match event {
            WatchEvent::Changed(_) => {
                let contents = match read(&path).await {
                    Ok(contents) => contents,
                    Err(e) => {
                        warn!(error = %e, "Discarding unreadable kubeconfig");
                        return;
                    }
                };
                if self.is_superseded(&path, generation) {
                    debug!(path = %path.display(), "Discarding superseded read");
                    return;
                }
                match contents {
                    Some(bytes) => {
                        self.apply(&path, &bytes);
                    }
                    None => self.remove(&path),
                }
            }
            WatchEvent::Removed(_) => self.remove(&path),
        }
    }

    fn is_superseded(&self, path: &Path, generation: u64) -> bool {
        self.slots
            .lock()
            .get(path)
            .is_some_and(|slot| slot.generation != generation)
    }

    /// Read `path` and reconcile its contexts
    pub async fn sync_file(&self, path: &Path) -> Result<ContextDiff, SyncError> {
        match read(path).await? {
            Some(bytes) => Ok(self.apply(path, &bytes)),
            None => {
                let removed = self.clusters_from(path);
                self.remove(path);
                Ok(ContextDiff {
                    removed,
                    ..Default::default()
                })
            }
        }
    }

    /// Reconcile `path` against freshly read contents
    pub fn apply(&self, path: &Path, bytes: &[u8]) -> ContextDiff {
        let digest = Sha256::digest(bytes).to_vec();
        let unchanged = self
            .sources
            .lock()
            .get(path)
            .is_some_and(|source| source.digest.as_deref() == Some(digest.as_slice()));
        if unchanged {
            debug!(path = %path.display(), "Kubeconfig content unchanged");
            return ContextDiff::default();
        }

        let contexts = match self.load_contexts(path, bytes) {
            Ok(contexts) => contexts,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to parse kubeconfig");
                let removed = self.clusters_from(path);
                self.clear(path);
                return ContextDiff {
                    removed,
                    ..Default::default()
                };
            }
        };

        let mut sources = self.sources.lock();
        let source = sources.entry(path.to_path_buf()).or_default();
        let changes = diff(&source.contexts, &contexts);

        for id in &changes.removed {
            self.store.release(id);
        }
        for model in changes.updated.iter().chain(&changes.added) {
            self.store.acquire(model.clone());
        }
        source.contexts = contexts;
        source.digest = Some(digest);

        if !changes.is_empty() {
            info!(
                path = %path.display(),
                added = changes.added.len(),
                updated = changes.updated.len(),
                removed = changes.removed.len(),
                "Synced kubeconfig"
            );
        }
        changes
    }

    fn load_contexts(&self, path: &Path, bytes: &[u8]) -> Result<ContextSet, SyncError> {
        let text = String::from_utf8_lossy(bytes);
        let config = kubeconfig::parse(&text)?;

        let mut contexts = ContextSet::new();
        for result in kubeconfig::split(&config) {
            let model = result.and_then(|single| single.to_model(path));
            match model {
                Ok(model) => {
                    contexts.insert(model.context_name.clone(), model);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping invalid context");
                }
            }
        }
        Ok(contexts)
    }

    /// Drop everything `path` (or anything below it) contributed
    fn remove(&self, path: &Path) {
        let owned: Vec<PathBuf> = self
            .sources
            .lock()
            .keys()
            .filter(|source| source.starts_with(path))
            .cloned()
            .collect();
        for source in owned {
            self.clear(&source);
        }
    }

    fn clear(&self, path: &Path) {
        let Some(source) = self.sources.lock().remove(path) else {
            return;
        };
        for model in source.contexts.values() {
            self.store.release(&model.id);
        }
        if !source.contexts.is_empty() {
            info!(path = %path.display(), removed = source.contexts.len(), "Cleared kubeconfig source");
        }
    }
}

/// Read a whole file; `None` when it no longer exists
async fn read(path: &Path) -> Result<Option<Vec<u8>>, SyncError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(SyncError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}
