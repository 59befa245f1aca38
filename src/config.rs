//! `kubedesk.toml` settings
//!
//! Every section is optional; a missing file yields the defaults.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use kubedesk_types::{ClusterId, ClusterPreferences};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth_proxy: AuthProxySection,
    pub sync: SyncSection,

    /// Per-cluster preferences keyed by cluster id
    pub clusters: HashMap<String, ClusterSection>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// 0 lets the OS pick
    pub port: u16,

    /// Host cluster subdomains hang off
    pub host: String,

    pub api_prefix: String,
    pub app_api_prefix: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 0,
            host: "localhost".to_string(),
            api_prefix: "/api-kube".to_string(),
            app_api_prefix: "/api".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AuthProxySection {
    pub binary: PathBuf,
    pub ready_timeout_secs: u64,

    /// Where generated kubeconfigs go; defaults to `<tmp>/kubedesk`
    pub temp_dir: Option<PathBuf>,
}

impl Default for AuthProxySection {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("kubectl"),
            ready_timeout_secs: 10,
            temp_dir: None,
        }
    }
}

impl AuthProxySection {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    pub paths: Vec<PathBuf>,
    pub max_depth: usize,
    pub ignore: Vec<String>,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            paths: vec![PathBuf::from("~/.kube/config")],
            max_depth: 1,
            ignore: vec![r"^\.".to_string(), r"~$".to_string(), r"\.swp$".to_string()],
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    pub name: Option<String>,
    pub https_proxy: Option<String>,
}

impl Config {
    /// Read `path`; a missing file is not an error
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        Self::parse(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Cluster preferences with unknown ids dropped
    pub fn preferences(&self) -> HashMap<ClusterId, ClusterPreferences> {
        self.clusters
            .iter()
            .filter_map(|(raw, section)| {
                let Some(id) = ClusterId::parse(raw) else {
                    tracing::warn!(id = %raw, "Ignoring preferences for malformed cluster id");
                    return None;
                };
                Some((
                    id,
                    ClusterPreferences {
                        name: section.name.clone(),
                        https_proxy: section.https_proxy.clone(),
                    },
                ))
            })
            .collect()
    }

    /// Sync roots with a leading `~` expanded
    pub fn sync_roots(&self) -> Vec<PathBuf> {
        let home = std::env::var_os("HOME").map(PathBuf::from);
        self.sync
            .paths
            .iter()
            .map(|path| expand_home(path, home.as_deref()))
            .collect()
    }
}

fn expand_home(path: &Path, home: Option<&Path>) -> PathBuf {
    match (path.strip_prefix("~"), home) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}
