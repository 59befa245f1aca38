//! Per-cluster connection lifecycle
//!
//! ```text
//! Uninitialized ──init()──► Initialized ──ensure_server()──► Ready
//!                                ▲                            │
//!                                └──────── stop_server() ◄────┘
//! ```
//!
//! `ensure_server()` is memoized: every caller that arrives while a start is
//! in flight awaits the same future, so there is at most one port allocation
//! and one process per start. `stop_server()` bumps a generation counter; a
//! start that completes under an old generation stops what it launched.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{OnceCell, broadcast};
use tracing::{debug, info, warn};

use kubedesk_k8s::{
    ContextDetails, EphemeralKubeconfig, KubeconfigMaterializer, ProxyKubeconfig, kubeconfig,
};
use kubedesk_types::{ClusterId, ClusterModel, ProxyEvent};

use crate::auth_proxy::{AuthProxy, AuthProxyConfig, AuthProxyLaunch, ProxyProcessError};
use crate::port::allocate_port;
use crate::process::ProcessLauncher;

/// Round-trip deadline for ordinary API requests
pub const API_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Handler failures, cloneable so a memoized outcome can be shared
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("failed to load kubeconfig: {0}")]
    Kubeconfig(String),

    #[error("failed to allocate port: {0}")]
    Port(String),

    #[error("{0}")]
    Proxy(String),

    #[error("failed to write proxy kubeconfig: {0}")]
    Materialize(String),

    #[error("server was stopped")]
    Stopped,
}

/// Settings shared by every context handler
#[derive(Clone, Debug)]
pub struct HandlerConfig {
    /// Host the router is reachable under; cluster URLs are subdomains of it
    pub app_host: String,

    /// Router port
    pub app_port: u16,

    pub auth_proxy: AuthProxyConfig,
    pub materializer: KubeconfigMaterializer,
}

/// Where to send a request for this cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyTarget {
    pub addr: SocketAddr,

    /// Round-trip deadline, `None` for streaming requests
    pub timeout: Option<Duration>,
}

impl ProxyTarget {
    /// `Host` header value for requests sent to this target
    pub fn host(&self) -> String {
        self.addr.to_string()
    }
}

/// Result of `init()`
#[derive(Clone, Debug)]
pub struct HandlerInit {
    pub details: ContextDetails,
    /// Externally visible cluster URL
    pub url: String,
}

type PendingStart = Shared<BoxFuture<'static, Result<u16, ContextError>>>;

#[derive(Default)]
struct ServerState {
    generation: u64,
    pending: Option<PendingStart>,
    port: Option<u16>,
    proxy: Option<Arc<AuthProxy>>,
    kubeconfig: Option<EphemeralKubeconfig>,
    last_error: Option<String>,
}

pub struct ContextHandler {
    id: ClusterId,
    model: RwLock<ClusterModel>,
    config: HandlerConfig,
    launcher: Arc<dyn ProcessLauncher>,
    events: broadcast::Sender<ProxyEvent>,
    url: String,
    /// Replaced whenever the model changes so the next `init()` reloads
    init: Mutex<Arc<OnceCell<HandlerInit>>>,
    initialized: AtomicBool,
    init_runs: AtomicUsize,
    state: Mutex<ServerState>,
}

impl ContextHandler {
    pub fn new(
        model: ClusterModel,
        config: HandlerConfig,
        launcher: Arc<dyn ProcessLauncher>,
        events: broadcast::Sender<ProxyEvent>,
    ) -> Arc<Self> {
        let url = format!("http://{}.{}:{}/", model.id, config.app_host, config.app_port);
        Arc::new(Self {
            id: model.id.clone(),
            model: RwLock::new(model),
            config,
            launcher,
            events,
            url,
            init: Mutex::new(Arc::new(OnceCell::new())),
            initialized: AtomicBool::new(false),
            init_runs: AtomicUsize::new(0),
            state: Mutex::new(ServerState::default()),
        })
    }

    pub fn id(&self) -> &ClusterId {
        &self.id
    }

    /// Replace the source-derived model
    ///
    /// Connection details are reloaded on the next `init()`; a running
    /// process keeps its arguments until it is restarted.
    pub fn update_model(&self, model: ClusterModel) {
        *self.model.write() = model;
        *self.init.lock() = Arc::new(OnceCell::new());
    }

    /// Externally visible URL, once initialised
    pub fn url(&self) -> Option<String> {
        self.initialized
            .load(Ordering::SeqCst)
            .then(|| self.url.clone())
    }

    /// Number of times the kubeconfig was actually loaded
    pub fn init_runs(&self) -> usize {
        self.init_runs.load(Ordering::SeqCst)
    }

    /// Authenticating proxy port, assigned on the first start and kept after
    pub fn port(&self) -> Option<u16> {
        self.state.lock().port
    }

    pub fn is_running(&self) -> bool {
        self.state
            .lock()
            .proxy
            .as_ref()
            .is_some_and(|proxy| proxy.is_running())
    }

    /// Last start failure or process error
    pub fn last_error(&self) -> Option<String> {
        let state = self.state.lock();
        state
            .proxy
            .as_ref()
            .and_then(|proxy| proxy.last_error())
            .or_else(|| state.last_error.clone())
    }

    /// Path of the generated kubeconfig for local tooling, while running
    pub fn kubeconfig_path(&self) -> Option<std::path::PathBuf> {
        self.state
            .lock()
            .kubeconfig
            .as_ref()
            .and_then(|file| file.path().ok().map(|p| p.to_path_buf()))
    }

    /// Load connection details from the real kubeconfig, once per model
    ///
    /// Concurrent callers wait for the same load. A failed load is not cached.
    pub async fn init(&self) -> Result<HandlerInit, ContextError> {
        let cell = Arc::clone(&self.init.lock());
        let init = cell
            .get_or_try_init(|| async {
                self.init_runs.fetch_add(1, Ordering::SeqCst);
                let (path, context_name) = {
                    let model = self.model.read();
                    (model.kubeconfig_path.clone(), model.context_name.clone())
                };

                let text = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| ContextError::Kubeconfig(format!("{}: {}", path.display(), e)))?;
                let config =
                    kubeconfig::parse(&text).map_err(|e| ContextError::Kubeconfig(e.to_string()))?;
                let details = kubeconfig::context_details(&config, &context_name)
                    .map_err(|e| ContextError::Kubeconfig(e.to_string()))?;

                debug!(cluster = %self.id, url = %self.url, "Initialised context handler");
                Ok::<_, ContextError>(HandlerInit {
                    details,
                    url: self.url.clone(),
                })
            })
            .await?;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(init.clone())
    }

    /// Make sure the authenticating proxy is running and return its port
    pub async fn ensure_server(self: &Arc<Self>) -> Result<u16, ContextError> {
        let pending = {
            let mut state = self.state.lock();
            if let Some(proxy) = state.proxy.as_ref().filter(|p| p.is_running()) {
                return Ok(proxy.port());
            }
            match &state.pending {
                Some(pending) => pending.clone(),
                None => {
                    let this = Arc::clone(self);
                    let generation = state.generation;
                    let start = async move { this.start_server(generation).await }
                        .boxed()
                        .shared();
                    state.pending = Some(start.clone());
                    start
                }
            }
        };
        pending.await
    }

    async fn start_server(self: Arc<Self>, generation: u64) -> Result<u16, ContextError> {
        let result = self.try_start_server(generation).await;

        let mut state = self.state.lock();
        if state.generation == generation {
            state.pending = None;
            if let Err(e) = &result {
                state.last_error = Some(e.to_string());
            }
        }
        drop(state);

        if let Err(e) = &result {
            warn!(cluster = %self.id, error = %e, "Failed to start cluster server");
        }
        result
    }

    async fn try_start_server(&self, generation: u64) -> Result<u16, ContextError> {
        self.init().await?;

        let existing = self.state.lock().port;
        let port = match existing {
            Some(port) => port,
            None => {
                let port = allocate_port()
                    .await
                    .map_err(|e| ContextError::Port(e.to_string()))?;
                let mut state = self.state.lock();
                if state.generation != generation {
                    return Err(ContextError::Stopped);
                }
                *state.port.get_or_insert(port)
            }
        };

        let proxy = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return Err(ContextError::Stopped);
            }
            let proxy = match &state.proxy {
                Some(proxy) => Arc::clone(proxy),
                None => {
                    let proxy = Arc::new(self.build_proxy(port));
                    state.proxy = Some(Arc::clone(&proxy));
                    proxy
                }
            };
            state.last_error = None;
            proxy
        };

        let run = proxy.run().await;

        {
            let mut state = self.state.lock();
            if state.generation != generation {
                drop(state);
                proxy.exit();
                return Err(ContextError::Stopped);
            }
            if let Err(e) = run {
                // The port may belong to someone else now; the next start
                // allocates a fresh one
                if matches!(e, ProxyProcessError::Exited(_) | ProxyProcessError::Timeout { .. }) {
                    state.port = None;
                    state.proxy = None;
                }
                return Err(ContextError::Proxy(e.to_string()));
            }
        }

        let needs_kubeconfig = self.state.lock().kubeconfig.is_none();
        if needs_kubeconfig {
            let file = match self.write_kubeconfig() {
                Ok(file) => file,
                Err(e) => {
                    proxy.exit();
                    return Err(e);
                }
            };
            let mut state = self.state.lock();
            if state.generation != generation {
                drop(state);
                proxy.exit();
                return Err(ContextError::Stopped);
            }
            state.kubeconfig.get_or_insert(file);
        }

        info!(cluster = %self.id, port, "Cluster server ready");
        Ok(port)
    }

    fn build_proxy(&self, port: u16) -> AuthProxy {
        let model = self.model.read();
        AuthProxy::new(
            AuthProxyLaunch {
                cluster_id: self.id.clone(),
                port,
                kubeconfig: model.kubeconfig_path.clone(),
                context: model.context_name.clone(),
                https_proxy: model.preferences.https_proxy.clone(),
            },
            self.config.auth_proxy.clone(),
            Arc::clone(&self.launcher),
            self.events.clone(),
        )
    }

    fn write_kubeconfig(&self) -> Result<EphemeralKubeconfig, ContextError> {
        let model = self.model.read();
        self.config
            .materializer
            .write(&ProxyKubeconfig {
                cluster_id: &self.id,
                context_name: &model.context_name,
                proxy_port: self.config.app_port,
                namespace: model.namespace.as_deref(),
            })
            .map_err(|e| ContextError::Materialize(e.to_string()))
    }

    /// Target for ordinary HTTP requests
    pub async fn get_api_target(
        self: &Arc<Self>,
        streaming: bool,
    ) -> Result<ProxyTarget, ContextError> {
        let port = self.ensure_server().await?;
        Ok(ProxyTarget {
            addr: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            timeout: (!streaming).then_some(API_REQUEST_TIMEOUT),
        })
    }

    /// Raw socket target for upgraded connections
    pub async fn get_proxy_target(self: &Arc<Self>) -> Result<ProxyTarget, ContextError> {
        let port = self.ensure_server().await?;
        Ok(ProxyTarget {
            addr: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            timeout: None,
        })
    }

    /// Stop the process, delete the generated kubeconfig and forget any
    /// in-flight start; safe to call at any time
    pub fn stop_server(&self) {
        let (proxy, kubeconfig) = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.pending = None;
            (state.proxy.take(), state.kubeconfig.take())
        };

        if let Some(proxy) = proxy {
            debug!(cluster = %self.id, "Stopping cluster server");
            proxy.exit();
        }
        if let Some(mut file) = kubeconfig
            && let Err(e) = file.delete()
        {
            warn!(cluster = %self.id, error = %e, "Failed to delete proxy kubeconfig");
        }
    }
}

impl Drop for ContextHandler {
    fn drop(&mut self) {
        self.stop_server();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth_proxy::tests::FakeLauncher;
    use std::io::Write;
    use std::path::Path;

    pub(crate) const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: ctx1
clusters:
- name: c1
  cluster:
    server: https://c1.example.com
    certificate-authority-data: Y2E=
users:
- name: u1
  user:
    token: secret
contexts:
- name: ctx1
  context:
    cluster: c1
    user: u1
    namespace: default
"#;

    pub(crate) fn write_kubeconfig(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("a.yml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(KUBECONFIG.as_bytes()).unwrap();
        path
    }

    pub(crate) fn handler_config(dir: &Path) -> HandlerConfig {
        HandlerConfig {
            app_host: "localhost".to_string(),
            app_port: 4000,
            auth_proxy: AuthProxyConfig {
                ready_timeout: Duration::from_millis(500),
                poll_interval: Duration::from_millis(10),
                ..Default::default()
            },
            materializer: KubeconfigMaterializer::new(dir.join("tmp")),
        }
    }

    fn handler(dir: &Path, launcher: Arc<FakeLauncher>) -> Arc<ContextHandler> {
        let path = write_kubeconfig(dir);
        let model = ClusterModel::new(path, "ctx1".to_string(), "https://c1.example.com".to_string());
        let (events, _) = broadcast::channel(16);
        ContextHandler::new(model, handler_config(dir), launcher, events)
    }

    #[tokio::test]
    async fn test_init_reads_details_and_builds_url() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(dir.path(), Arc::new(FakeLauncher::new()));

        let init = handler.init().await.unwrap();
        assert_eq!(init.details.ca_data.as_deref(), Some("Y2E="));
        assert_eq!(init.details.namespace.as_deref(), Some("default"));
        assert_eq!(init.url, format!("http://{}.localhost:4000/", handler.id()));

        handler.init().await.unwrap();
        assert_eq!(handler.init_runs(), 1);
    }

    #[tokio::test]
    async fn test_init_failure_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let model = ClusterModel::new(
            dir.path().join("missing.yml"),
            "ctx1".to_string(),
            "https://c1.example.com".to_string(),
        );
        let (events, _) = broadcast::channel(16);
        let handler = ContextHandler::new(
            model,
            handler_config(dir.path()),
            Arc::new(FakeLauncher::new()),
            events,
        );

        assert!(matches!(handler.init().await, Err(ContextError::Kubeconfig(_))));
        assert!(handler.init().await.is_err());
        assert_eq!(handler.init_runs(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_ensure_server_spawns_once() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::new());
        let handler = handler(dir.path(), launcher.clone());

        let calls = (0..8).map(|_| {
            let handler = Arc::clone(&handler);
            async move { handler.ensure_server().await }
        });
        let ports: Vec<u16> = futures::future::join_all(calls)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();

        assert!(ports.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(launcher.launch_count(), 1);
        assert_eq!(handler.port(), Some(ports[0]));
        assert!(handler.is_running());

        // Later calls take the fast path
        handler.ensure_server().await.unwrap();
        assert_eq!(launcher.launch_count(), 1);
    }

    #[tokio::test]
    async fn test_ready_server_has_proxy_kubeconfig() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(dir.path(), Arc::new(FakeLauncher::new()));
        handler.ensure_server().await.unwrap();

        let path = handler.kubeconfig_path().unwrap();
        let parsed = kubeconfig::load(&path).unwrap();
        let server = parsed.clusters[0].cluster.as_ref().unwrap().server.clone();
        assert_eq!(server, Some(format!("http://127.0.0.1:4000/{}", handler.id())));

        handler.stop_server();
        assert!(!path.exists());
        assert!(handler.kubeconfig_path().is_none());
    }

    #[tokio::test]
    async fn test_stop_before_start_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::new());
        let handler = handler(dir.path(), launcher.clone());

        handler.stop_server();
        handler.stop_server();
        assert_eq!(launcher.launch_count(), 0);
        assert!(!handler.is_running());
    }

    #[tokio::test]
    async fn test_stop_wins_over_pending_start() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::new());
        let handler = handler(dir.path(), launcher.clone());

        let start = {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move { handler.ensure_server().await })
        };
        while handler.state.lock().pending.is_none() {
            tokio::task::yield_now().await;
        }
        handler.stop_server();

        assert_eq!(start.await.unwrap(), Err(ContextError::Stopped));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handler.is_running());
        assert_eq!(launcher.launch_count(), launcher.kill_count());
    }

    #[tokio::test]
    async fn test_stop_while_process_is_coming_up() {
        let dir = tempfile::tempdir().unwrap();
        let mut fake = FakeLauncher::new();
        fake.listen = false;
        let launcher = Arc::new(fake);
        let handler = handler(dir.path(), launcher.clone());

        let start = {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move { handler.ensure_server().await })
        };
        // The process exists but its port is not listening yet
        while launcher.launch_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handler.stop_server();

        assert_eq!(start.await.unwrap(), Err(ContextError::Stopped));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handler.is_running());
        assert_eq!(launcher.launch_count(), 1);
        assert_eq!(launcher.kill_count(), 1);
        assert!(handler.kubeconfig_path().is_none());
    }

    #[tokio::test]
    async fn test_kubeconfig_write_failure_stops_process() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::new());
        let path = write_kubeconfig(dir.path());
        let model = ClusterModel::new(path, "ctx1".to_string(), "https://c1.example.com".to_string());

        // A regular file where the output directory should be
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "").unwrap();
        let mut config = handler_config(dir.path());
        config.materializer = KubeconfigMaterializer::new(blocker.join("tmp"));

        let (events, _) = broadcast::channel(16);
        let handler = ContextHandler::new(model, config, launcher.clone(), events);

        let err = handler.ensure_server().await.unwrap_err();
        assert!(matches!(err, ContextError::Materialize(_)));
        assert!(!handler.is_running());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(launcher.kill_count(), 1);
        launcher.live.lock().clear();

        // No fast path to a half-started server
        let err = handler.ensure_server().await.unwrap_err();
        assert!(matches!(err, ContextError::Materialize(_)));
        assert_eq!(launcher.launch_count(), 2);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(launcher.kill_count(), 2);
    }

    #[tokio::test]
    async fn test_port_is_dropped_when_process_never_listens() {
        let dir = tempfile::tempdir().unwrap();
        let mut fake = FakeLauncher::new();
        fake.listen = false;
        let launcher = Arc::new(fake);
        let handler = handler(dir.path(), launcher.clone());

        let err = handler.ensure_server().await.unwrap_err();
        assert!(matches!(err, ContextError::Proxy(_)));
        assert_eq!(handler.port(), None);
        assert!(handler.last_error().unwrap().contains("did not listen"));
    }

    #[tokio::test]
    async fn test_model_update_reloads_details() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(dir.path(), Arc::new(FakeLauncher::new()));
        let first = handler.init().await.unwrap();
        assert_eq!(first.details.namespace.as_deref(), Some("default"));

        let path = dir.path().join("a.yml");
        std::fs::write(&path, KUBECONFIG.replace("namespace: default", "namespace: team-b")).unwrap();
        handler.init().await.unwrap();
        assert_eq!(handler.init_runs(), 1);

        handler.update_model(
            ClusterModel::new(path, "ctx1".to_string(), "https://c1.example.com".to_string())
                .with_namespace(Some("team-b".to_string())),
        );
        let second = handler.init().await.unwrap();
        assert_eq!(second.details.namespace.as_deref(), Some("team-b"));
        assert_eq!(handler.init_runs(), 2);
        assert_eq!(handler.url(), Some(second.url));
    }

    #[tokio::test]
    async fn test_port_is_kept_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::new());
        let handler = handler(dir.path(), launcher.clone());

        let first = handler.ensure_server().await.unwrap();
        handler.stop_server();
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Release the fake's listener so the port can be reused
        launcher.live.lock().clear();

        let second = handler.ensure_server().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(launcher.launch_count(), 2);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let mut fake = FakeLauncher::new();
        fake.fail = true;
        let handler = handler(dir.path(), Arc::new(fake));

        let err = handler.ensure_server().await.unwrap_err();
        assert!(matches!(err, ContextError::Proxy(_)));
        assert!(handler.last_error().unwrap().contains("no such binary"));
        assert!(!handler.is_running());
    }

    #[tokio::test]
    async fn test_targets() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(dir.path(), Arc::new(FakeLauncher::new()));

        let api = handler.get_api_target(false).await.unwrap();
        assert_eq!(api.timeout, Some(API_REQUEST_TIMEOUT));
        assert_eq!(api.addr.port(), handler.port().unwrap());

        let watch = handler.get_api_target(true).await.unwrap();
        assert_eq!(watch.timeout, None);

        let raw = handler.get_proxy_target().await.unwrap();
        assert_eq!(raw.host(), format!("127.0.0.1:{}", handler.port().unwrap()));
    }
}
