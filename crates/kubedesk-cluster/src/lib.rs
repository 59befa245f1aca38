//! Cluster connectivity for kubedesk
//!
//! Owns everything between "a cluster exists" and "a request can be sent to
//! it": local ports, the authenticating proxy process, generated kubeconfigs
//! and the registry of known clusters.

pub mod auth_proxy;
pub mod handler;
pub mod port;
pub mod probe;
pub mod process;
pub mod registry;
pub mod sink;

pub use auth_proxy::{AuthProxy, AuthProxyConfig, AuthProxyLaunch, ProxyProcessError, parse_error};
pub use handler::{ContextError, ContextHandler, HandlerConfig, ProxyTarget};
pub use port::{PortError, allocate_port};
pub use probe::{ClusterProbe, KubeVersionProbe, ProbeOutcome};
pub use process::{LaunchSpec, LaunchedProcess, ProcessEvent, ProcessLauncher, TokioLauncher};
pub use registry::{Cluster, ClusterRegistry, RegistryError, RequestMatch};
pub use sink::{BroadcastSink, CatalogEvent, CatalogSink, PreferencesStore, StaticPreferences};
