//! Ephemeral, credential-free kubeconfigs pointing at the local proxy
//!
//! Local tooling is handed one of these instead of the user's real
//! kubeconfig. Its only server is `http://127.0.0.1:<port>/<cluster id>`, so
//! every request goes through the router and the authenticating proxy.

use std::io::Write;
use std::path::{Path, PathBuf};

use kube::config::{
    AuthInfo, Cluster, Context, Kubeconfig, NamedAuthInfo, NamedCluster, NamedContext,
};
use tracing::debug;

use kubedesk_types::ClusterId;

/// User entry name in generated kubeconfigs
pub const PROXY_USER: &str = "proxy";

#[derive(Debug, thiserror::Error)]
pub enum MaterializeError {
    #[error("failed to write kubeconfig: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize kubeconfig: {0}")]
    Serialize(#[from] serde_yaml::Error),

    #[error("kubeconfig was already unlinked")]
    AlreadyUnlinked,
}

/// What goes into a generated kubeconfig
#[derive(Clone, Debug)]
pub struct ProxyKubeconfig<'a> {
    pub cluster_id: &'a ClusterId,
    pub context_name: &'a str,
    /// Router port reachable on loopback
    pub proxy_port: u16,
    pub namespace: Option<&'a str>,
}

impl ProxyKubeconfig<'_> {
    /// Server URL of the single cluster entry
    pub fn server(&self) -> String {
        format!("http://127.0.0.1:{}/{}", self.proxy_port, self.cluster_id)
    }

    /// Build the kubeconfig document
    pub fn build(&self) -> Kubeconfig {
        let name = self.context_name.to_string();
        Kubeconfig {
            clusters: vec![NamedCluster {
                name: name.clone(),
                cluster: Some(Cluster {
                    server: Some(self.server()),
                    ..Default::default()
                }),
            }],
            auth_infos: vec![NamedAuthInfo {
                name: PROXY_USER.to_string(),
                auth_info: Some(AuthInfo::default()),
            }],
            contexts: vec![NamedContext {
                name: name.clone(),
                context: Some(Context {
                    cluster: name.clone(),
                    user: Some(PROXY_USER.to_string()),
                    namespace: self.namespace.map(str::to_string),
                    ..Default::default()
                }),
            }],
            current_context: Some(name),
            ..Default::default()
        }
    }
}

/// Writes generated kubeconfigs into a directory
#[derive(Clone, Debug)]
pub struct KubeconfigMaterializer {
    dir: PathBuf,
}

impl KubeconfigMaterializer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Materializer writing into `<system temp>/kubedesk`
    pub fn in_temp_dir() -> Self {
        Self::new(std::env::temp_dir().join("kubedesk"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write a kubeconfig to a fresh, collision-free path
    pub fn write(
        &self,
        request: &ProxyKubeconfig<'_>,
    ) -> Result<EphemeralKubeconfig, MaterializeError> {
        std::fs::create_dir_all(&self.dir)?;
        let yaml = serde_yaml::to_string(&request.build())?;

        let mut file = tempfile::Builder::new()
            .prefix(&format!("kubeconfig-{}-", request.cluster_id))
            .suffix(".yaml")
            .tempfile_in(&self.dir)?;
        file.write_all(yaml.as_bytes())?;
        file.flush()?;
        let (_, path) = file.keep().map_err(|e| MaterializeError::Io(e.error))?;

        debug!(cluster = %request.cluster_id, path = %path.display(), "Wrote proxy kubeconfig");
        Ok(EphemeralKubeconfig { path: Some(path) })
    }
}

/// A generated kubeconfig on disk
///
/// Deleted on `delete()` or drop. After deletion `path()` reports
/// `AlreadyUnlinked` instead of handing out a stale path.
#[derive(Debug)]
pub struct EphemeralKubeconfig {
    path: Option<PathBuf>,
}

impl EphemeralKubeconfig {
    pub fn path(&self) -> Result<&Path, MaterializeError> {
        self.path.as_deref().ok_or(MaterializeError::AlreadyUnlinked)
    }

    pub fn is_unlinked(&self) -> bool {
        self.path.is_none()
    }

    /// Remove the file; a file that is already gone is not an error
    pub fn delete(&mut self) -> Result<(), MaterializeError> {
        let Some(path) = self.path.take() else {
            return Ok(());
        };
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "Deleted proxy kubeconfig");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for EphemeralKubeconfig {
    fn drop(&mut self) {
        let _ = self.delete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kubeconfig;

    fn cluster_id() -> ClusterId {
        ClusterId::derive(Path::new("a.yml"), "ctx1")
    }

    #[test]
    fn test_write_points_at_local_proxy() {
        let dir = tempfile::tempdir().unwrap();
        let materializer = KubeconfigMaterializer::new(dir.path());
        let id = cluster_id();

        let file = materializer
            .write(&ProxyKubeconfig {
                cluster_id: &id,
                context_name: "ctx1",
                proxy_port: 9191,
                namespace: Some("team-a"),
            })
            .unwrap();

        let parsed = kubeconfig::load(file.path().unwrap()).unwrap();
        let server = parsed.clusters[0].cluster.as_ref().unwrap().server.clone();
        assert_eq!(server, Some(format!("http://127.0.0.1:9191/{}", id)));
        assert_eq!(parsed.auth_infos[0].name, PROXY_USER);

        let user = parsed.auth_infos[0].auth_info.as_ref();
        assert!(user.is_none_or(|u| u.token.is_none() && u.auth_provider.is_none()));

        let details = kubeconfig::context_details(&parsed, "ctx1").unwrap();
        assert_eq!(details.namespace.as_deref(), Some("team-a"));
    }

    #[test]
    fn test_paths_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let materializer = KubeconfigMaterializer::new(dir.path());
        let id = cluster_id();
        let request = ProxyKubeconfig {
            cluster_id: &id,
            context_name: "ctx1",
            proxy_port: 1,
            namespace: None,
        };

        let a = materializer.write(&request).unwrap();
        let b = materializer.write(&request).unwrap();
        assert_ne!(a.path().unwrap(), b.path().unwrap());
    }

    #[test]
    fn test_delete_is_idempotent_and_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let materializer = KubeconfigMaterializer::new(dir.path());
        let id = cluster_id();
        let mut file = materializer
            .write(&ProxyKubeconfig {
                cluster_id: &id,
                context_name: "ctx1",
                proxy_port: 1,
                namespace: None,
            })
            .unwrap();

        let path = file.path().unwrap().to_path_buf();
        std::fs::remove_file(&path).unwrap();

        file.delete().unwrap();
        file.delete().unwrap();
        assert!(matches!(file.path(), Err(MaterializeError::AlreadyUnlinked)));
        assert!(file.is_unlinked());
    }

    #[test]
    fn test_drop_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let materializer = KubeconfigMaterializer::new(dir.path());
        let id = cluster_id();
        let path = {
            let file = materializer
                .write(&ProxyKubeconfig {
                    cluster_id: &id,
                    context_name: "ctx1",
                    proxy_port: 1,
                    namespace: None,
                })
                .unwrap();
            file.path().unwrap().to_path_buf()
        };
        assert!(!path.exists());
    }
}
