//! Raw bridging of upgraded connections (watch, exec, attach, port-forward)
//!
//! The upgrade handshake is replayed against the authenticating proxy and,
//! once it answers `101`, both upgraded connections are bridged byte for byte
//! without parsing frames.

use std::time::Duration;

use bytes::Bytes;
use http_body_util::Empty;
use hyper::body::Incoming;
use hyper::header::{self, HeaderValue};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use kubedesk_cluster::ProxyTarget;

use crate::body::{RouterBody, empty, incoming};
use crate::error::RouterError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Whether the request asks for a protocol upgrade
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let connection_upgrade = req
        .headers()
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.split(',').any(|token| token.trim().eq_ignore_ascii_case("upgrade")));
    connection_upgrade && req.headers().contains_key(header::UPGRADE)
}

/// Forward an upgrade request to `target` and bridge the connections
///
/// Original headers are kept, including `Authorization`; `Host` is
/// re-derived from the target.
pub async fn bridge(
    mut req: Request<Incoming>,
    target: &ProxyTarget,
    path: &str,
) -> Result<Response<RouterBody>, RouterError> {
    let client_upgrade = hyper::upgrade::on(&mut req);

    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(target.addr))
        .await
        .map_err(|_| RouterError::Timeout(CONNECT_TIMEOUT))??;
    let (mut sender, connection) =
        hyper::client::conn::http1::handshake::<_, Empty<Bytes>>(TokioIo::new(stream))
            .await
            .map_err(|e| RouterError::Upgrade(e.to_string()))?;
    tokio::spawn(async move {
        if let Err(e) = connection.with_upgrades().await {
            debug!(error = %e, "Upstream upgrade connection closed");
        }
    });

    let mut builder = Request::builder().method(req.method().clone()).uri(path);
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in req.headers() {
            if name != header::HOST {
                headers.append(name.clone(), value.clone());
            }
        }
        let host = HeaderValue::from_str(&target.host())
            .map_err(|e| RouterError::Upgrade(e.to_string()))?;
        headers.insert(header::HOST, host);
    }
    let upstream_req = builder.body(Empty::new())?;

    let mut upstream_res = sender
        .send_request(upstream_req)
        .await
        .map_err(|e| RouterError::Upgrade(e.to_string()))?;

    if upstream_res.status() != StatusCode::SWITCHING_PROTOCOLS {
        debug!(status = %upstream_res.status(), path, "Upstream declined upgrade");
        return Ok(upstream_res.map(incoming));
    }

    let upstream_upgrade = hyper::upgrade::on(&mut upstream_res);
    let path = path.to_string();
    tokio::spawn(async move {
        let (client, upstream) = match tokio::try_join!(client_upgrade, upstream_upgrade) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, path = %path, "Failed to complete upgrade");
                return;
            }
        };
        let mut client = TokioIo::new(client);
        let mut upstream = TokioIo::new(upstream);
        match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
            Ok((from_client, from_upstream)) => {
                info!(from_client, from_upstream, path = %path, "Upgraded session ended");
            }
            Err(e) => debug!(error = %e, path = %path, "Upgraded session closed"),
        }
    });

    let mut response = Response::new(empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    *response.headers_mut() = upstream_res.headers().clone();
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upgrade_detection() {
        let req = Request::builder()
            .header(header::CONNECTION, "keep-alive, Upgrade")
            .header(header::UPGRADE, "websocket")
            .body(())
            .unwrap();
        assert!(is_upgrade_request(&req));

        let missing_upgrade = Request::builder()
            .header(header::CONNECTION, "upgrade")
            .body(())
            .unwrap();
        assert!(!is_upgrade_request(&missing_upgrade));

        let plain = Request::builder()
            .header(header::CONNECTION, "keep-alive")
            .header(header::UPGRADE, "websocket")
            .body(())
            .unwrap();
        assert!(!is_upgrade_request(&plain));
    }
}
