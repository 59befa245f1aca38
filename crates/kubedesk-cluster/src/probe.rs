//! Cluster metadata refresh through the authenticating proxy

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use kube::Client;
use tracing::debug;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// What a metadata refresh found out about a cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Server answered; carries its version
    Online(String),

    /// Server refused our credentials
    Inaccessible(String),

    /// Server could not be reached
    Offline(String),
}

#[async_trait]
pub trait ClusterProbe: Send + Sync + 'static {
    /// Query the cluster behind an authenticating proxy listening on `addr`
    async fn probe(&self, addr: SocketAddr) -> ProbeOutcome;
}

/// Asks the API server for its version with a `kube::Client`
#[derive(Clone, Copy, Debug, Default)]
pub struct KubeVersionProbe;

#[async_trait]
impl ClusterProbe for KubeVersionProbe {
    async fn probe(&self, addr: SocketAddr) -> ProbeOutcome {
        let uri = match format!("http://{}", addr).parse::<http::Uri>() {
            Ok(uri) => uri,
            Err(e) => return ProbeOutcome::Offline(e.to_string()),
        };

        let mut config = kube::Config::new(uri);
        config.connect_timeout = Some(PROBE_TIMEOUT);
        config.read_timeout = Some(PROBE_TIMEOUT);

        let client = match Client::try_from(config) {
            Ok(client) => client,
            Err(e) => return ProbeOutcome::Offline(e.to_string()),
        };

        match client.apiserver_version().await {
            Ok(info) => {
                debug!(%addr, version = %info.git_version, "Probed API server");
                ProbeOutcome::Online(info.git_version)
            }
            Err(e) => classify(e),
        }
    }
}

fn classify(error: kube::Error) -> ProbeOutcome {
    match error {
        kube::Error::Api(response) if matches!(response.code, 401 | 403) => {
            ProbeOutcome::Inaccessible(response.message)
        }
        other => ProbeOutcome::Offline(other.to_string()),
    }
}
