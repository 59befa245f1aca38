//! Cluster registry
//!
//! Single source of truth for which clusters exist. Creation and removal are
//! check-then-act under one lock (`acquire`/`release`); every live cluster id
//! has at most one context handler.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use kubedesk_types::{
    ClusterId, ClusterModel, ClusterSnapshot, ClusterStatus, ProxyEvent, ProxyEventKind,
};

use crate::handler::{ContextError, ContextHandler, HandlerConfig};
use crate::probe::{ClusterProbe, ProbeOutcome};
use crate::process::ProcessLauncher;
use crate::sink::{CatalogEvent, CatalogSink, PreferencesStore};

const PROXY_EVENT_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("cluster {0} not found")]
    NotFound(ClusterId),

    #[error("cluster {0} is not connected")]
    NotActive(ClusterId),

    #[error(transparent)]
    Context(#[from] ContextError),
}

/// A known cluster
pub struct Cluster {
    id: ClusterId,
    model: RwLock<ClusterModel>,
    status: RwLock<ClusterStatus>,
    handler: Mutex<Option<Arc<ContextHandler>>>,
}

impl Cluster {
    fn new(model: ClusterModel) -> Self {
        Self {
            id: model.id.clone(),
            model: RwLock::new(model),
            status: RwLock::new(ClusterStatus::default()),
            handler: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &ClusterId {
        &self.id
    }

    pub fn model(&self) -> ClusterModel {
        self.model.read().clone()
    }

    pub fn status(&self) -> ClusterStatus {
        self.status.read().clone()
    }

    /// The current context handler, if one was created
    pub fn handler(&self) -> Option<Arc<ContextHandler>> {
        self.handler.lock().clone()
    }

    pub fn snapshot(&self) -> ClusterSnapshot {
        let handler = self.handler();
        ClusterSnapshot {
            model: self.model(),
            status: self.status(),
            proxy_port: handler.as_ref().and_then(|h| h.port()),
            url: handler.as_ref().and_then(|h| h.url()),
        }
    }
}

/// A cluster matched from an inbound request
#[derive(Clone)]
pub struct RequestMatch {
    pub cluster: Arc<Cluster>,

    /// Request path with the cluster id segment removed (path-prefix form)
    pub path: String,

    /// The cluster was addressed by a leading path segment on a loopback host
    pub path_prefixed: bool,
}

pub struct ClusterRegistry {
    clusters: Mutex<HashMap<ClusterId, Arc<Cluster>>>,
    handler_config: HandlerConfig,
    launcher: Arc<dyn ProcessLauncher>,
    probe: Arc<dyn ClusterProbe>,
    sink: Arc<dyn CatalogSink>,
    preferences: Arc<dyn PreferencesStore>,
    proxy_events: broadcast::Sender<ProxyEvent>,
}

impl ClusterRegistry {
    pub fn new(
        handler_config: HandlerConfig,
        launcher: Arc<dyn ProcessLauncher>,
        probe: Arc<dyn ClusterProbe>,
        sink: Arc<dyn CatalogSink>,
        preferences: Arc<dyn PreferencesStore>,
    ) -> Arc<Self> {
        let (proxy_events, _) = broadcast::channel(PROXY_EVENT_CAPACITY);
        Arc::new(Self {
            clusters: Mutex::new(HashMap::new()),
            handler_config,
            launcher,
            probe,
            sink,
            preferences,
            proxy_events,
        })
    }

    pub fn subscribe_proxy_events(&self) -> broadcast::Receiver<ProxyEvent> {
        self.proxy_events.subscribe()
    }

    pub fn get(&self, id: &ClusterId) -> Option<Arc<Cluster>> {
        self.clusters.lock().get(id).cloned()
    }

    pub fn contains(&self, id: &ClusterId) -> bool {
        self.clusters.lock().contains_key(id)
    }

    pub fn ids(&self) -> Vec<ClusterId> {
        let mut ids: Vec<_> = self.clusters.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn snapshots(&self) -> Vec<ClusterSnapshot> {
        let clusters: Vec<_> = self.clusters.lock().values().cloned().collect();
        let mut snapshots: Vec<_> = clusters.iter().map(|c| c.snapshot()).collect();
        snapshots.sort_by(|a, b| a.model.id.cmp(&b.model.id));
        snapshots
    }

    /// Create the cluster for `model`, or update the existing one in place
    ///
    /// Returns `true` when a cluster was created.
    pub fn acquire(&self, mut model: ClusterModel) -> bool {
        model.preferences = self.preferences.preferences(&model.id);

        let (cluster, added) = {
            let mut clusters = self.clusters.lock();
            match clusters.get(&model.id) {
                Some(existing) => {
                    let existing = Arc::clone(existing);
                    *existing.model.write() = model.clone();
                    if let Some(handler) = existing.handler() {
                        handler.update_model(model);
                    }
                    (existing, false)
                }
                None => {
                    let cluster = Arc::new(Cluster::new(model));
                    clusters.insert(cluster.id.clone(), Arc::clone(&cluster));
                    (cluster, true)
                }
            }
        };

        let snapshot = cluster.snapshot();
        if added {
            self.sink.publish(CatalogEvent::Added(snapshot));
        } else {
            self.sink.publish(CatalogEvent::Updated(snapshot));
        }
        added
    }

    /// Disconnect and delete a cluster; returns `false` if it did not exist
    pub fn release(&self, id: &ClusterId) -> bool {
        let Some(cluster) = self.clusters.lock().remove(id) else {
            return false;
        };
        if let Some(handler) = cluster.handler.lock().take() {
            handler.stop_server();
        }
        cluster.status.write().mark_disconnected();
        self.sink.publish(CatalogEvent::Removed(id.clone()));
        true
    }

    /// The cluster's context handler, created on first use
    pub fn handler_for(&self, cluster: &Cluster) -> Arc<ContextHandler> {
        let mut slot = cluster.handler.lock();
        match slot.as_ref() {
            Some(handler) => Arc::clone(handler),
            None => {
                debug!(cluster = %cluster.id, "Creating context handler");
                let handler = ContextHandler::new(
                    cluster.model(),
                    self.handler_config.clone(),
                    Arc::clone(&self.launcher),
                    self.proxy_events.clone(),
                );
                *slot = Some(Arc::clone(&handler));
                handler
            }
        }
    }

    /// Find the cluster a request is addressed to
    ///
    /// Loopback hosts carry the id as the first path segment
    /// (`127.0.0.1:<port>/<id>/...`), every other host as the first hostname
    /// label (`<id>.localhost:<port>/...`).
    pub fn cluster_for_request(&self, host: &str, path: &str) -> Option<RequestMatch> {
        let hostname = strip_port(host);

        if is_loopback(hostname) {
            let rest = path.strip_prefix('/').unwrap_or(path);
            let (segment, remainder) = match rest.find(['/', '?']) {
                Some(at) => rest.split_at(at),
                None => (rest, ""),
            };
            let id = ClusterId::parse(segment)?;
            let cluster = self.get(&id)?;
            let path = if remainder.starts_with('/') {
                remainder.to_string()
            } else {
                format!("/{}", remainder)
            };
            return Some(RequestMatch {
                cluster,
                path,
                path_prefixed: true,
            });
        }

        let (label, _) = hostname.split_once('.')?;
        let id = ClusterId::parse(label)?;
        let cluster = self.get(&id)?;
        Some(RequestMatch {
            cluster,
            path: path.to_string(),
            path_prefixed: false,
        })
    }

    /// Connect a cluster and refresh its metadata
    ///
    /// A non-forced activation of a ready cluster only republishes it; a
    /// forced one refreshes metadata over the running server. Either way the
    /// server is only (re)started when the cluster is disconnected or
    /// inaccessible.
    pub async fn activate(
        &self,
        id: &ClusterId,
        force: bool,
    ) -> Result<ClusterSnapshot, RegistryError> {
        let cluster = self
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;

        if !force && cluster.status.read().is_ready() {
            debug!(cluster = %id, "Cluster already active");
            let snapshot = cluster.snapshot();
            self.sink.publish(CatalogEvent::Updated(snapshot.clone()));
            return Ok(snapshot);
        }

        let handler = self.handler_for(&cluster);
        if let Err(e) = handler.init().await {
            self.fail(&cluster, e.to_string());
            return Err(e.into());
        }

        let reconnect = {
            let status = cluster.status.read();
            status.disconnected || !status.accessible
        };
        if reconnect {
            info!(cluster = %id, force, "Connecting cluster");
            if let Err(e) = handler.ensure_server().await {
                self.fail(&cluster, e.to_string());
                return Err(e.into());
            }
            cluster.status.write().disconnected = false;
        }

        self.refresh_metadata(&cluster, &handler).await?;
        Ok(cluster.snapshot())
    }

    /// Re-query an active cluster's metadata without reconnecting
    pub async fn refresh(&self, id: &ClusterId) -> Result<ClusterSnapshot, RegistryError> {
        let cluster = self
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        let handler = cluster
            .handler()
            .filter(|h| h.is_running())
            .ok_or_else(|| RegistryError::NotActive(id.clone()))?;

        self.refresh_metadata(&cluster, &handler).await?;
        Ok(cluster.snapshot())
    }

    /// Tear down the cluster's handler and mark it offline; idempotent
    pub fn disconnect(&self, id: &ClusterId) -> Result<(), RegistryError> {
        let cluster = self
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;

        if let Some(handler) = cluster.handler.lock().take() {
            info!(cluster = %id, "Disconnecting cluster");
            handler.stop_server();
        }
        cluster.status.write().mark_disconnected();
        self.sink.publish(CatalogEvent::Updated(cluster.snapshot()));
        Ok(())
    }

    /// Disconnect every cluster
    pub fn disconnect_all(&self) {
        for id in self.ids() {
            let _ = self.disconnect(&id);
        }
    }

    async fn refresh_metadata(
        &self,
        cluster: &Cluster,
        handler: &Arc<ContextHandler>,
    ) -> Result<(), RegistryError> {
        let target = match handler.get_api_target(false).await {
            Ok(target) => target,
            Err(e) => {
                self.fail(cluster, e.to_string());
                return Err(e.into());
            }
        };

        let outcome = self.probe.probe(target.addr).await;
        {
            let mut status = cluster.status.write();
            match outcome {
                ProbeOutcome::Online(version) => {
                    debug!(cluster = %cluster.id, version = %version, "Cluster online");
                    status.mark_online(version);
                }
                ProbeOutcome::Inaccessible(reason) => {
                    warn!(cluster = %cluster.id, reason = %reason, "Cluster refused credentials");
                    status.mark_inaccessible(reason);
                }
                ProbeOutcome::Offline(reason) => {
                    warn!(cluster = %cluster.id, reason = %reason, "Cluster unreachable");
                    status.mark_offline(Some(reason));
                }
            }
        }
        self.sink.publish(CatalogEvent::Updated(cluster.snapshot()));
        Ok(())
    }

    fn fail(&self, cluster: &Cluster, reason: String) {
        warn!(cluster = %cluster.id, reason = %reason, "Cluster activation failed");
        cluster.status.write().mark_offline(Some(reason));
        self.sink.publish(CatalogEvent::Updated(cluster.snapshot()));
    }

    fn on_proxy_event(&self, event: ProxyEvent) {
        let ProxyEventKind::Error(reason) = event.kind else {
            return;
        };
        let Some(cluster) = self.get(&event.cluster_id) else {
            return;
        };

        let running = cluster.handler().is_some_and(|h| h.is_running());
        {
            let mut status = cluster.status.write();
            if running {
                status.failure_reason = Some(reason);
            } else {
                status.mark_offline(Some(reason));
            }
        }
        self.sink.publish(CatalogEvent::Updated(cluster.snapshot()));
    }

    /// Record authenticating proxy errors on the owning clusters
    ///
    /// The task ends when the registry is dropped.
    pub fn spawn_event_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let mut rx = self.subscribe_proxy_events();
        let registry: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let Some(registry) = registry.upgrade() else {
                            break;
                        };
                        registry.on_proxy_event(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Dropped authenticating proxy events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split_once(']').map_or(rest, |(ip, _)| ip);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

fn is_loopback(hostname: &str) -> bool {
    hostname.eq_ignore_ascii_case("localhost")
        || hostname.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}
