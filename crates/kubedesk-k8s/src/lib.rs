//! Kubeconfig handling for kubedesk
//!
//! This crate reads user kubeconfigs, splits them into single-context configs
//! and writes the credential-free kubeconfigs handed to local tooling.

mod ephemeral;
pub mod kubeconfig;

pub use ephemeral::{
    EphemeralKubeconfig, KubeconfigMaterializer, MaterializeError, PROXY_USER, ProxyKubeconfig,
};
pub use kubeconfig::{ContextDetails, KubeconfigError, SingleContext, SplitResult};

// Re-export types that are used in our public API
pub use kube::config::Kubeconfig;
pub use kubedesk_types::{ClusterId, ClusterModel, ContextInfo};
