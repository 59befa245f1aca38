//! Shared types for kubedesk
//!
//! This crate contains data structures used across multiple kubedesk crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};

// ============================================================================
// Cluster Identity
// ============================================================================

/// Number of hex characters kept from the digest. Ids double as hostname
/// labels, which are capped at 63 bytes.
const CLUSTER_ID_LEN: usize = 32;

/// Stable cluster identifier
///
/// Derived from the kubeconfig source path and context name, so reopening the
/// same source always yields the same id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(String);

impl ClusterId {
    /// Derive the id for a context declared in a kubeconfig file
    pub fn derive(source: &Path, context_name: &str) -> Self {
        let source = source.to_string_lossy();
        let mut hasher = Sha256::new();
        // Length prefix keeps (path, context) pairs unambiguous; both may
        // contain any separator (EKS context names are ARNs)
        hasher.update((source.len() as u64).to_be_bytes());
        hasher.update(source.as_bytes());
        hasher.update(context_name.as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        Self(digest[..CLUSTER_ID_LEN].to_string())
    }

    /// Parse an id received from the outside (hostname label, path segment)
    ///
    /// Only lowercase hex of the derived length is accepted.
    pub fn parse(raw: &str) -> Option<Self> {
        let valid = raw.len() == CLUSTER_ID_LEN
            && raw
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Kubernetes Context Types
// ============================================================================

/// Kubernetes context information
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextInfo {
    pub name: String,
    pub cluster: String,
    pub user: String,
    pub namespace: Option<String>,
}

impl ContextInfo {
    pub fn new(
        name: String,
        cluster: String,
        user: String,
        namespace: Option<String>,
    ) -> Self {
        Self {
            name,
            cluster,
            user,
            namespace,
        }
    }
}

// ============================================================================
// Cluster Model
// ============================================================================

/// Per-cluster overrides supplied by the preferences store
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterPreferences {
    /// Display name shown instead of the context name
    pub name: Option<String>,

    /// Proxy handed to the authenticating proxy process as `HTTPS_PROXY`
    pub https_proxy: Option<String>,
}

/// Source-derived description of a cluster
///
/// Owned by the sync engine: it is replaced wholesale when the kubeconfig
/// changes, while the cluster identity stays the same.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterModel {
    pub id: ClusterId,

    /// Kubeconfig file the context was read from
    pub kubeconfig_path: PathBuf,

    /// Context name inside that kubeconfig
    pub context_name: String,

    /// API server URL declared by the context's cluster entry
    pub server: String,

    /// Default namespace declared by the context
    pub namespace: Option<String>,

    pub preferences: ClusterPreferences,
}

impl ClusterModel {
    pub fn new(kubeconfig_path: PathBuf, context_name: String, server: String) -> Self {
        Self {
            id: ClusterId::derive(&kubeconfig_path, &context_name),
            kubeconfig_path,
            context_name,
            server,
            namespace: None,
            preferences: ClusterPreferences::default(),
        }
    }

    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace;
        self
    }

    /// Name to show for this cluster
    pub fn display_name(&self) -> &str {
        self.preferences
            .name
            .as_deref()
            .unwrap_or(&self.context_name)
    }
}

// ============================================================================
// Runtime Status
// ============================================================================

/// Connection status of a cluster
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStatus {
    /// The API server answered through the authenticating proxy
    pub online: bool,

    /// The API server accepted our credentials
    pub accessible: bool,

    /// No authenticating proxy is running for this cluster
    pub disconnected: bool,

    /// Last failure reason, shown next to the reconnect affordance
    pub failure_reason: Option<String>,

    /// Server version reported by the last successful refresh
    pub version: Option<String>,

    pub last_seen: Option<DateTime<Utc>>,
}

impl Default for ClusterStatus {
    fn default() -> Self {
        Self {
            online: false,
            accessible: false,
            disconnected: true,
            failure_reason: None,
            version: None,
            last_seen: None,
        }
    }
}

impl ClusterStatus {
    /// Record a successful round trip to the API server
    pub fn mark_online(&mut self, version: String) {
        self.online = true;
        self.accessible = true;
        self.disconnected = false;
        self.failure_reason = None;
        self.version = Some(version);
        self.last_seen = Some(Utc::now());
    }

    /// The server answered but refused our credentials
    pub fn mark_inaccessible(&mut self, reason: String) {
        self.online = true;
        self.accessible = false;
        self.failure_reason = Some(reason);
        self.last_seen = Some(Utc::now());
    }

    pub fn mark_offline(&mut self, reason: Option<String>) {
        self.online = false;
        self.accessible = false;
        if reason.is_some() {
            self.failure_reason = reason;
        }
    }

    pub fn mark_disconnected(&mut self) {
        self.online = false;
        self.accessible = false;
        self.disconnected = true;
    }

    /// Whether an activation has completed and nothing has failed since
    pub fn is_ready(&self) -> bool {
        !self.disconnected && self.online && self.accessible
    }
}

/// Point-in-time view of a cluster, published to the catalog sink
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ClusterSnapshot {
    pub model: ClusterModel,
    pub status: ClusterStatus,

    /// Local port assigned on first activation
    pub proxy_port: Option<u16>,

    /// Externally visible URL, known once the handler has initialised
    pub url: Option<String>,
}

// ============================================================================
// Authenticating Proxy Events
// ============================================================================

/// Event emitted by an authenticating proxy process
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyEvent {
    pub cluster_id: ClusterId,
    pub kind: ProxyEventKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProxyEventKind {
    /// The readiness marker was printed
    Ready,

    /// Informational output passed through as-is
    Info(String),

    /// Spawn failure, stderr output or abnormal exit
    Error(String),
}

impl ProxyEvent {
    pub fn new(cluster_id: ClusterId, kind: ProxyEventKind) -> Self {
        Self { cluster_id, kind }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.kind, ProxyEventKind::Error(_))
    }
}
