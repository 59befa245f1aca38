//! Supervisor for the external authenticating proxy
//!
//! The proxy binary (`kubectl proxy` or a compatible tool) performs the
//! cluster's real credential exchange and serves an already-authenticated
//! HTTP endpoint on a loopback port.
//!
//! Lifecycle:
//! ```text
//! Idle ──run()──► Starting ──port listening──► Running
//!   ▲                │                            │
//!   └──── exit() / process exited / timeout ◄─────┘
//! ```
//! Nothing here returns errors for process trouble after spawn: stderr lines,
//! abnormal exits and spawn failures become `ProxyEvent`s and `last_error`.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use parking_lot::Mutex;
use regex::Regex;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use kubedesk_types::{ClusterId, ProxyEvent, ProxyEventKind};

use crate::process::{LaunchSpec, ProcessEvent, ProcessLauncher};

/// Readiness line printed by `kubectl proxy`
static READY_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Starting to serve on (\S+)").expect("valid regex"));

/// Settings shared by every authenticating proxy
#[derive(Clone, Debug)]
pub struct AuthProxyConfig {
    /// Proxy binary, resolved through `PATH` when relative
    pub binary: PathBuf,

    /// How long `run()` waits for the port to accept connections
    pub ready_timeout: Duration,

    pub poll_interval: Duration,
}

impl Default for AuthProxyConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("kubectl"),
            ready_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Everything needed to start one cluster's proxy
#[derive(Clone, Debug)]
pub struct AuthProxyLaunch {
    pub cluster_id: ClusterId,
    pub port: u16,
    /// The user's real kubeconfig
    pub kubeconfig: PathBuf,
    pub context: String,
    pub https_proxy: Option<String>,
}

impl AuthProxyLaunch {
    fn to_spec(&self, config: &AuthProxyConfig) -> LaunchSpec {
        let args = [
            "proxy",
            "-p",
            &self.port.to_string(),
            "--kubeconfig",
            &self.kubeconfig.to_string_lossy(),
            "--context",
            &self.context,
            "--accept-hosts",
            ".*",
            "--reject-paths",
            "^[^/]",
        ]
        .into_iter()
        .map(str::to_string)
        .collect();

        let env = self
            .https_proxy
            .iter()
            .map(|proxy| ("HTTPS_PROXY".to_string(), proxy.clone()))
            .collect();

        LaunchSpec {
            program: config.binary.clone(),
            args,
            env,
            port: self.port,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProxyProcessError {
    #[error("failed to start authenticating proxy: {0}")]
    Spawn(String),

    #[error("authenticating proxy exited: {0}")]
    Exited(String),

    #[error("authenticating proxy did not listen on port {port} within {timeout:?}")]
    Timeout { port: u16, timeout: Duration },

    #[error("authenticating proxy was stopped")]
    Stopped,
}

#[derive(Default)]
struct ProxyState {
    /// Bumped on every launch so a stale pump cannot clobber a newer process
    epoch: u64,
    running: bool,
    exiting: bool,
    kill: Option<oneshot::Sender<()>>,
    last_error: Option<String>,
}

/// One cluster's authenticating proxy process
pub struct AuthProxy {
    launch: AuthProxyLaunch,
    spec: LaunchSpec,
    config: AuthProxyConfig,
    launcher: Arc<dyn ProcessLauncher>,
    events: broadcast::Sender<ProxyEvent>,
    state: Arc<Mutex<ProxyState>>,
}

impl AuthProxy {
    pub fn new(
        launch: AuthProxyLaunch,
        config: AuthProxyConfig,
        launcher: Arc<dyn ProcessLauncher>,
        events: broadcast::Sender<ProxyEvent>,
    ) -> Self {
        let spec = launch.to_spec(&config);
        Self {
            launch,
            spec,
            config,
            launcher,
            events,
            state: Arc::new(Mutex::new(ProxyState::default())),
        }
    }

    pub fn port(&self) -> u16 {
        self.launch.port
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.lock().last_error.clone()
    }

    /// Start the process and wait until its port accepts connections
    ///
    /// Does nothing if the process is already running.
    pub async fn run(&self) -> Result<(), ProxyProcessError> {
        let epoch = {
            let mut state = self.state.lock();
            if state.running {
                return Ok(());
            }

            let launched = match self.launcher.launch(&self.spec) {
                Ok(launched) => launched,
                Err(e) => {
                    let message = e.to_string();
                    state.last_error = Some(message.clone());
                    drop(state);
                    warn!(cluster = %self.launch.cluster_id, error = %message, "Failed to spawn authenticating proxy");
                    self.emit(ProxyEventKind::Error(message.clone()));
                    return Err(ProxyProcessError::Spawn(message));
                }
            };

            state.epoch += 1;
            state.running = true;
            state.exiting = false;
            state.last_error = None;
            state.kill = Some(launched.kill);

            info!(
                cluster = %self.launch.cluster_id,
                port = self.launch.port,
                pid = ?launched.pid,
                "Started authenticating proxy"
            );

            tokio::spawn(pump_events(
                launched.events,
                Arc::clone(&self.state),
                state.epoch,
                self.launch.cluster_id.clone(),
                self.events.clone(),
            ));
            state.epoch
        };

        self.wait_until_listening(epoch).await
    }

    async fn wait_until_listening(&self, epoch: u64) -> Result<(), ProxyProcessError> {
        let deadline = Instant::now() + self.config.ready_timeout;
        loop {
            {
                let state = self.state.lock();
                if state.epoch != epoch || !state.running {
                    if state.exiting {
                        return Err(ProxyProcessError::Stopped);
                    }
                    let reason = state
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "exited before listening".to_string());
                    return Err(ProxyProcessError::Exited(reason));
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let connect = TcpStream::connect((Ipv4Addr::LOCALHOST, self.launch.port));
            if let Ok(Ok(_)) = tokio::time::timeout(remaining, connect).await {
                debug!(cluster = %self.launch.cluster_id, port = self.launch.port, "Authenticating proxy is listening");
                return Ok(());
            }

            if Instant::now() >= deadline {
                let err = ProxyProcessError::Timeout {
                    port: self.launch.port,
                    timeout: self.config.ready_timeout,
                };
                self.state.lock().last_error = Some(err.to_string());
                self.emit(ProxyEventKind::Error(err.to_string()));
                self.exit();
                return Err(err);
            }

            tokio::time::sleep(self.config.poll_interval.min(remaining)).await;
        }
    }

    /// Stop the process; safe to call at any time and any number of times
    pub fn exit(&self) {
        let mut state = self.state.lock();
        state.exiting = true;
        state.running = false;
        if let Some(kill) = state.kill.take() {
            debug!(cluster = %self.launch.cluster_id, "Stopping authenticating proxy");
            let _ = kill.send(());
        }
    }

    fn emit(&self, kind: ProxyEventKind) {
        let _ = self
            .events
            .send(ProxyEvent::new(self.launch.cluster_id.clone(), kind));
    }
}

impl Drop for AuthProxy {
    fn drop(&mut self) {
        self.exit();
    }
}

async fn pump_events(
    mut events: mpsc::UnboundedReceiver<ProcessEvent>,
    state: Arc<Mutex<ProxyState>>,
    epoch: u64,
    cluster_id: ClusterId,
    sink: broadcast::Sender<ProxyEvent>,
) {
    let emit = |kind| {
        let _ = sink.send(ProxyEvent::new(cluster_id.clone(), kind));
    };

    while let Some(event) = events.recv().await {
        match event {
            ProcessEvent::StdoutLine(line) => {
                debug!(cluster = %cluster_id, "{}", line);
                if READY_MARKER.is_match(&line) {
                    emit(ProxyEventKind::Ready);
                } else {
                    emit(ProxyEventKind::Info(line));
                }
            }
            ProcessEvent::StderrLine(line) => {
                warn!(cluster = %cluster_id, "{}", line);
                let error = parse_error(&line);
                {
                    let mut state = state.lock();
                    if state.epoch == epoch {
                        state.last_error = Some(error.clone());
                    }
                }
                emit(ProxyEventKind::Error(error));
            }
            ProcessEvent::Exited(code) => {
                let mut state = state.lock();
                if state.epoch != epoch {
                    break;
                }
                let expected = state.exiting;
                state.running = false;
                state.kill = None;

                if expected || code == Some(0) {
                    info!(cluster = %cluster_id, ?code, "Authenticating proxy exited");
                    break;
                }

                let reason = state
                    .last_error
                    .get_or_insert_with(|| match code {
                        Some(code) => format!("exited with code {}", code),
                        None => "terminated by signal".to_string(),
                    })
                    .clone();
                drop(state);
                warn!(cluster = %cluster_id, ?code, reason = %reason, "Authenticating proxy exited unexpectedly");
                emit(ProxyEventKind::Error(reason));
                break;
            }
        }
    }
}

/// Extract a human-readable error from a stderr line
///
/// Auth failures are printed as `http: proxy error: ... Response: {json}`;
/// the JSON's `error_description` or `error` is the useful part.
pub fn parse_error(line: &str) -> String {
    let message = match line.split_once("http: proxy error:") {
        Some((_, rest)) => rest.trim(),
        None => line.trim(),
    };

    let Some((_, json)) = message.split_once("Response: ") else {
        return message.to_string();
    };
    let json = json.trim();

    match serde_json::from_str::<serde_json::Value>(json) {
        Ok(value) => ["error_description", "error"]
            .iter()
            .find_map(|key| value.get(*key).and_then(|v| v.as_str()))
            .unwrap_or(json)
            .to_string(),
        Err(_) => json.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::process::LaunchedProcess;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted launcher: binds the requested port (when asked to) and hands
    /// the test a sender to play process output.
    pub(crate) struct FakeLauncher {
        pub launches: AtomicUsize,
        pub listen: bool,
        pub fail: bool,
        pub script: Mutex<Vec<ProcessEvent>>,
        pub live: Mutex<Vec<(mpsc::UnboundedSender<ProcessEvent>, std::net::TcpListener)>>,
        pub kills: Arc<AtomicUsize>,
    }

    impl FakeLauncher {
        pub(crate) fn new() -> Self {
            Self {
                launches: AtomicUsize::new(0),
                listen: true,
                fail: false,
                script: Mutex::new(vec![ProcessEvent::StdoutLine(
                    "Starting to serve on 127.0.0.1:0".to_string(),
                )]),
                live: Mutex::new(Vec::new()),
                kills: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub(crate) fn launch_count(&self) -> usize {
            self.launches.load(Ordering::SeqCst)
        }

        pub(crate) fn kill_count(&self) -> usize {
            self.kills.load(Ordering::SeqCst)
        }

        /// Play an event into the most recent process
        pub(crate) fn send(&self, event: ProcessEvent) {
            if let Some((tx, _)) = self.live.lock().last() {
                let _ = tx.send(event);
            }
        }
    }

    impl ProcessLauncher for FakeLauncher {
        fn launch(&self, spec: &LaunchSpec) -> std::io::Result<LaunchedProcess> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no such binary",
                ));
            }

            let (tx, events) = mpsc::unbounded_channel();
            let (kill, kill_rx) = oneshot::channel::<()>();
            for event in self.script.lock().iter().cloned() {
                let _ = tx.send(event);
            }

            let exit_tx = tx.clone();
            let kills = Arc::clone(&self.kills);
            tokio::spawn(async move {
                if kill_rx.await.is_ok() {
                    kills.fetch_add(1, Ordering::SeqCst);
                }
                let _ = exit_tx.send(ProcessEvent::Exited(None));
            });

            if self.listen {
                let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, spec.port))?;
                self.live.lock().push((tx, listener));
            } else {
                let placeholder = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
                self.live.lock().push((tx, placeholder));
            }

            Ok(LaunchedProcess {
                pid: Some(4242),
                events,
                kill,
            })
        }
    }

    fn cluster_id() -> ClusterId {
        ClusterId::derive(Path::new("a.yml"), "ctx1")
    }

    fn proxy_on(launcher: Arc<FakeLauncher>, port: u16) -> (AuthProxy, broadcast::Receiver<ProxyEvent>) {
        let (tx, rx) = broadcast::channel(64);
        let proxy = AuthProxy::new(
            AuthProxyLaunch {
                cluster_id: cluster_id(),
                port,
                kubeconfig: PathBuf::from("/home/me/.kube/config"),
                context: "ctx1".to_string(),
                https_proxy: Some("http://corp-proxy:3128".to_string()),
            },
            AuthProxyConfig {
                ready_timeout: Duration::from_millis(500),
                poll_interval: Duration::from_millis(20),
                ..Default::default()
            },
            launcher,
            tx,
        );
        (proxy, rx)
    }

    async fn free_port() -> u16 {
        crate::port::allocate_port().await.unwrap()
    }

    #[test]
    fn test_parse_error_extracts_oauth_error() {
        let line = r#"E0101 12:00:00 proxy_server.go:147] Error while proxying request: getting credentials: Response: {"error":"invalid_grant"}"#;
        assert_eq!(parse_error(line), "invalid_grant");
    }

    #[test]
    fn test_parse_error_prefers_description() {
        let line = r#"http: proxy error: oidc refresh failed Response: {"error":"invalid_grant","error_description":"Token has expired"}"#;
        assert_eq!(parse_error(line), "Token has expired");
    }

    #[test]
    fn test_parse_error_plain_lines() {
        assert_eq!(
            parse_error("http: proxy error: dial tcp 10.0.0.1:443: i/o timeout"),
            "dial tcp 10.0.0.1:443: i/o timeout"
        );
        assert_eq!(parse_error("  something broke  "), "something broke");
        assert_eq!(parse_error("bad Response: not json"), "not json");
    }

    #[test]
    fn test_launch_spec_arguments() {
        let launch = AuthProxyLaunch {
            cluster_id: cluster_id(),
            port: 9000,
            kubeconfig: PathBuf::from("/cfg"),
            context: "ctx1".to_string(),
            https_proxy: None,
        };
        let spec = launch.to_spec(&AuthProxyConfig::default());
        assert_eq!(spec.program, PathBuf::from("kubectl"));
        assert_eq!(
            spec.args,
            vec![
                "proxy", "-p", "9000", "--kubeconfig", "/cfg", "--context", "ctx1",
                "--accept-hosts", ".*", "--reject-paths", "^[^/]",
            ]
        );
        assert!(spec.env.is_empty());
    }

    #[tokio::test]
    async fn test_run_waits_for_port_and_emits_ready() {
        let launcher = Arc::new(FakeLauncher::new());
        let (proxy, mut events) = proxy_on(launcher.clone(), free_port().await);

        proxy.run().await.unwrap();
        assert!(proxy.is_running());

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, ProxyEventKind::Ready);
        assert_eq!(event.cluster_id, cluster_id());

        // Second run is a no-op
        proxy.run().await.unwrap();
        assert_eq!(launcher.launch_count(), 1);
    }

    #[tokio::test]
    async fn test_run_times_out_when_port_never_listens() {
        let mut fake = FakeLauncher::new();
        fake.listen = false;
        let launcher = Arc::new(fake);
        let (proxy, _events) = proxy_on(launcher.clone(), free_port().await);

        let err = proxy.run().await.unwrap_err();
        assert!(matches!(err, ProxyProcessError::Timeout { .. }));
        assert!(!proxy.is_running());
        assert!(proxy.last_error().is_some());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(launcher.kill_count(), 1);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_recorded() {
        let mut fake = FakeLauncher::new();
        fake.fail = true;
        let (proxy, mut events) = proxy_on(Arc::new(fake), free_port().await);

        let err = proxy.run().await.unwrap_err();
        assert!(matches!(err, ProxyProcessError::Spawn(_)));
        assert_eq!(proxy.last_error().as_deref(), Some("no such binary"));
        assert!(events.recv().await.unwrap().is_error());
    }

    #[tokio::test]
    async fn test_stderr_sets_last_error() {
        let launcher = Arc::new(FakeLauncher::new());
        let (proxy, mut events) = proxy_on(launcher.clone(), free_port().await);
        proxy.run().await.unwrap();

        launcher.send(ProcessEvent::StderrLine(
            r#"error: Response: {"error":"invalid_grant"}"#.to_string(),
        ));

        loop {
            let event = events.recv().await.unwrap();
            if let ProxyEventKind::Error(message) = event.kind {
                assert_eq!(message, "invalid_grant");
                break;
            }
        }
        assert_eq!(proxy.last_error().as_deref(), Some("invalid_grant"));
    }

    #[tokio::test]
    async fn test_unexpected_exit_is_an_error_event() {
        let launcher = Arc::new(FakeLauncher::new());
        let (proxy, mut events) = proxy_on(launcher.clone(), free_port().await);
        proxy.run().await.unwrap();

        launcher.send(ProcessEvent::Exited(Some(1)));

        loop {
            let event = events.recv().await.unwrap();
            if let ProxyEventKind::Error(message) = event.kind {
                assert_eq!(message, "exited with code 1");
                break;
            }
        }
        assert!(!proxy.is_running());
    }

    #[tokio::test]
    async fn test_exit_is_idempotent() {
        let launcher = Arc::new(FakeLauncher::new());
        let (proxy, _events) = proxy_on(launcher.clone(), free_port().await);

        proxy.exit();
        proxy.exit();

        proxy.run().await.unwrap();
        proxy.exit();
        proxy.exit();
        assert!(!proxy.is_running());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(launcher.kill_count(), 1);
    }
}
