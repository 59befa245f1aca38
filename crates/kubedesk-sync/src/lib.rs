//! Kubeconfig synchronization for kubedesk
//!
//! Watches kubeconfig files and directories and keeps the cluster registry in
//! step with the contexts they declare.

pub mod diff;
mod engine;
pub mod watch;

pub use diff::{ContextDiff, ContextSet, diff};
pub use engine::{ClusterStore, SyncConfig, SyncEngine, SyncError};
pub use watch::{IgnoreRules, SourceWatch, WatchEvent};
