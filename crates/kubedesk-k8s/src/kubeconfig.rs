//! Kubeconfig parsing, splitting and validation

use std::path::{Path, PathBuf};

use kube::config::{Kubeconfig, NamedAuthInfo, NamedCluster, NamedContext};
use tracing::debug;

use kubedesk_types::{ClusterModel, ContextInfo};

/// Auth-provider config key carrying the identity provider's CA bundle
const IDP_CA_DATA_KEY: &str = "idp-certificate-authority-data";

/// Errors from reading or interpreting a kubeconfig
#[derive(Debug, thiserror::Error)]
pub enum KubeconfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse kubeconfig: {0}")]
    Parse(#[from] kube::config::KubeconfigError),

    #[error("context '{0}' not found")]
    ContextNotFound(String),

    #[error("context '{context}' is invalid: {reason}")]
    InvalidContext { context: String, reason: String },
}

/// Parse kubeconfig text (single or multi-document)
pub fn parse(text: &str) -> Result<Kubeconfig, KubeconfigError> {
    Ok(Kubeconfig::from_yaml(text)?)
}

/// Read and parse a kubeconfig file
pub fn load(path: &Path) -> Result<Kubeconfig, KubeconfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| KubeconfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&text)
}

/// A kubeconfig reduced to exactly one context with its cluster and user
#[derive(Clone, Debug)]
pub struct SingleContext {
    pub info: ContextInfo,
    pub config: Kubeconfig,
}

impl SingleContext {
    /// API server URL of the context's cluster
    pub fn server(&self) -> Option<&str> {
        self.config
            .clusters
            .first()
            .and_then(|c| c.cluster.as_ref())
            .and_then(|c| c.server.as_deref())
    }

    /// Build the registry model for this context as found in `source`
    pub fn to_model(&self, source: &Path) -> Result<ClusterModel, KubeconfigError> {
        let server = self
            .server()
            .ok_or_else(|| KubeconfigError::InvalidContext {
                context: self.info.name.clone(),
                reason: "cluster has no server".to_string(),
            })?;

        Ok(ClusterModel::new(
            source.to_path_buf(),
            self.info.name.clone(),
            server.to_string(),
        )
        .with_namespace(self.info.namespace.clone()))
    }
}

/// Outcome of splitting one context out of a kubeconfig
pub type SplitResult = Result<SingleContext, KubeconfigError>;

/// Split a kubeconfig into one single-context config per context
///
/// Invalid contexts are returned as errors alongside the valid ones so the
/// caller can log and skip them without losing the rest.
pub fn split(kubeconfig: &Kubeconfig) -> Vec<SplitResult> {
    kubeconfig
        .contexts
        .iter()
        .map(|ctx| split_one(kubeconfig, ctx))
        .collect()
}

fn split_one(kubeconfig: &Kubeconfig, named: &NamedContext) -> SplitResult {
    let invalid = |reason: String| KubeconfigError::InvalidContext {
        context: named.name.clone(),
        reason,
    };

    let context = named
        .context
        .as_ref()
        .ok_or_else(|| invalid("context has no body".to_string()))?;

    let cluster = find_cluster(kubeconfig, &context.cluster)
        .ok_or_else(|| invalid(format!("no cluster named '{}'", context.cluster)))?;

    let user_name = context
        .user
        .clone()
        .ok_or_else(|| invalid("context has no user".to_string()))?;
    let user = find_user(kubeconfig, &user_name)
        .ok_or_else(|| invalid(format!("no user named '{}'", user_name)))?;

    let config = Kubeconfig {
        clusters: vec![cluster.clone()],
        auth_infos: vec![user.clone()],
        contexts: vec![named.clone()],
        current_context: Some(named.name.clone()),
        ..Default::default()
    };

    let info = ContextInfo::new(
        named.name.clone(),
        context.cluster.clone(),
        user_name,
        context.namespace.clone(),
    );

    debug!(context = %info.name, cluster = %info.cluster, user = %info.user, "Split context");

    validate(&config, &info.name)?;
    Ok(SingleContext { info, config })
}

/// Check that a single-context config has a context, a cluster and a user
pub fn validate(config: &Kubeconfig, context_name: &str) -> Result<(), KubeconfigError> {
    let invalid = |reason: &str| KubeconfigError::InvalidContext {
        context: context_name.to_string(),
        reason: reason.to_string(),
    };

    if config.contexts.is_empty() {
        return Err(invalid("no contexts"));
    }
    if config.clusters.is_empty() {
        return Err(invalid("no clusters"));
    }
    if config.auth_infos.is_empty() {
        return Err(invalid("no users"));
    }
    Ok(())
}

fn find_cluster<'a>(kubeconfig: &'a Kubeconfig, name: &str) -> Option<&'a NamedCluster> {
    kubeconfig.clusters.iter().find(|c| c.name == name)
}

fn find_user<'a>(kubeconfig: &'a Kubeconfig, name: &str) -> Option<&'a NamedAuthInfo> {
    kubeconfig.auth_infos.iter().find(|a| a.name == name)
}

/// Connection details a context handler needs from the real kubeconfig
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContextDetails {
    pub server: String,

    /// Base64 CA bundle of the API server
    pub ca_data: Option<String>,

    /// Path to a CA file, when the bundle is not inlined
    pub ca_file: Option<String>,

    /// CA bundle of the auth provider's identity provider (OIDC)
    pub auth_provider_ca: Option<String>,

    pub namespace: Option<String>,
}

/// Extract the connection details of `context_name`
pub fn context_details(
    kubeconfig: &Kubeconfig,
    context_name: &str,
) -> Result<ContextDetails, KubeconfigError> {
    let named = kubeconfig
        .contexts
        .iter()
        .find(|c| c.name == context_name)
        .ok_or_else(|| KubeconfigError::ContextNotFound(context_name.to_string()))?;

    let single = split_one(kubeconfig, named)?;
    let cluster = single
        .config
        .clusters
        .first()
        .and_then(|c| c.cluster.as_ref());
    let auth_provider = single
        .config
        .auth_infos
        .first()
        .and_then(|a| a.auth_info.as_ref())
        .and_then(|a| a.auth_provider.as_ref());

    Ok(ContextDetails {
        server: single.server().unwrap_or_default().to_string(),
        ca_data: cluster.and_then(|c| c.certificate_authority_data.clone()),
        ca_file: cluster.and_then(|c| c.certificate_authority.clone()),
        auth_provider_ca: auth_provider.and_then(|p| p.config.get(IDP_CA_DATA_KEY).cloned()),
        namespace: single.info.namespace,
    })
}
