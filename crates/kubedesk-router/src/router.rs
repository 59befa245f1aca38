//! Request dispatch
//!
//! ```text
//! request ──► cluster_for_request(host, path)
//!               │ none ──────────────────────────► local routes
//!               ▼
//!           upgrade? ── app API prefix ──────────► local routes
//!               │ yes ───────────────────────────► raw bridge to auth proxy
//!               ▼
//!           API prefix? ── no ───────────────────► local routes
//!               │ yes
//!               ▼
//!           forward (GETs retried with linear backoff)
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use hyper::body::Incoming;
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::{Method, Request, Response, Version};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, warn};

use kubedesk_cluster::{ClusterRegistry, ContextHandler, ProxyTarget};

use crate::body::{RouterBody, empty, incoming};
use crate::error::RouterError;
use crate::retry::{RetryCounter, RetryPolicy};
use crate::upgrade::{self, is_upgrade_request};

/// Handles whatever is not addressed to a cluster's API
#[async_trait]
pub trait LocalRoutes: Send + Sync + 'static {
    async fn handle(&self, req: Request<Incoming>) -> Response<RouterBody>;
}

#[derive(Clone, Debug)]
pub struct RouterConfig {
    /// Path prefix of requests forwarded to a cluster's API server
    pub api_prefix: String,

    /// Path prefix of the app's own API, never forwarded
    pub app_api_prefix: String,

    pub retry: RetryPolicy,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            api_prefix: "/api-kube".to_string(),
            app_api_prefix: "/api".to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

pub struct Router {
    registry: Arc<ClusterRegistry>,
    local: Arc<dyn LocalRoutes>,
    config: RouterConfig,
    client: Client<HttpConnector, RouterBody>,
    retries: RetryCounter,
}

/// Why an attempt did not produce a response worth returning
enum Failure {
    Status(Response<RouterBody>),
    Error(RouterError),
}

impl Failure {
    fn into_response(self) -> Response<RouterBody> {
        match self {
            Failure::Status(response) => response,
            Failure::Error(e) => e.into_response(),
        }
    }
}

impl Router {
    pub fn new(
        registry: Arc<ClusterRegistry>,
        local: Arc<dyn LocalRoutes>,
        config: RouterConfig,
    ) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        let retries = RetryCounter::new(config.retry.clone());
        Self {
            registry,
            local,
            config,
            client,
            retries,
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Number of requests currently being retried
    pub fn pending_retries(&self) -> usize {
        self.retries.len()
    }

    /// Handle one request; failures become error responses
    pub async fn handle(&self, req: Request<Incoming>) -> Response<RouterBody> {
        let host = request_host(&req).unwrap_or_default();
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        debug!(method = %req.method(), host = %host, path = %path_and_query, "Request");

        let Some(matched) = self.registry.cluster_for_request(&host, &path_and_query) else {
            return self.local.handle(req).await;
        };

        let path = if matched.path_prefixed && self.strip_api_prefix(&matched.path).is_none() {
            format!("{}{}", self.config.api_prefix, matched.path)
        } else {
            matched.path
        };
        let api_path = self.strip_api_prefix(&path);

        if is_upgrade_request(&req) {
            if api_path.is_none()
                && strip_segment_prefix(&path, &self.config.app_api_prefix).is_some()
            {
                return self.local.handle(req).await;
            }

            let handler = self.registry.handler_for(&matched.cluster);
            let upstream_path = api_path.unwrap_or(path);
            debug!(cluster = %matched.cluster.id(), path = %upstream_path, "Bridging upgrade");
            return match handler.get_proxy_target().await {
                Ok(target) => upgrade::bridge(req, &target, &upstream_path)
                    .await
                    .unwrap_or_else(RouterError::into_response),
                Err(e) => RouterError::from(e).into_response(),
            };
        }

        let Some(api_path) = api_path else {
            return self.local.handle(req).await;
        };

        let handler = self.registry.handler_for(&matched.cluster);
        let key = format!("{}{}", host, path_and_query);
        self.forward(&handler, req, &api_path, &key).await
    }

    fn strip_api_prefix(&self, path: &str) -> Option<String> {
        strip_segment_prefix(path, &self.config.api_prefix)
    }

    async fn forward(
        &self,
        handler: &Arc<ContextHandler>,
        req: Request<Incoming>,
        path: &str,
        key: &str,
    ) -> Response<RouterBody> {
        let streaming = is_streaming(path);
        let (parts, body) = req.into_parts();
        let retriable = parts.method == Method::GET;
        let mut body = Some(incoming(body));

        loop {
            let target = match handler.get_api_target(streaming).await {
                Ok(target) => target,
                Err(e) => return RouterError::from(e).into_response(),
            };

            let attempt_body = body.take().unwrap_or_else(empty);
            let failure = match self.send(&target, &parts, path, attempt_body).await {
                Ok(response) if !(retriable && response.status().is_server_error()) => {
                    self.retries.reset(key);
                    return response;
                }
                Ok(response) => Failure::Status(response),
                Err(e) => Failure::Error(e),
            };

            if !retriable {
                return failure.into_response();
            }

            match self.retries.next_delay(key) {
                Some(delay) => {
                    warn!(
                        cluster = %handler.id(),
                        path,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying failed request"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    warn!(cluster = %handler.id(), path, "Giving up on request");
                    return failure.into_response();
                }
            }
        }
    }

    async fn send(
        &self,
        target: &ProxyTarget,
        parts: &http::request::Parts,
        path: &str,
        body: RouterBody,
    ) -> Result<Response<RouterBody>, RouterError> {
        let uri = format!("http://{}{}", target.addr, path);
        let mut builder = Request::builder()
            .method(parts.method.clone())
            .uri(uri)
            .version(Version::HTTP_11);

        if let Some(headers) = builder.headers_mut() {
            for (name, value) in &parts.headers {
                if is_hop_by_hop(name) || name == header::HOST || name == header::AUTHORIZATION {
                    continue;
                }
                headers.append(name.clone(), value.clone());
            }
            let host = HeaderValue::from_str(&target.host())
                .map_err(|e| RouterError::Upstream(e.to_string()))?;
            headers.insert(header::HOST, host);
        }
        let request = builder.body(body)?;

        let pending = self.client.request(request);
        let result = match target.timeout {
            Some(limit) => tokio::time::timeout(limit, pending)
                .await
                .map_err(|_| RouterError::Timeout(limit))?,
            None => pending.await,
        };
        let response = result.map_err(|e| RouterError::Upstream(e.to_string()))?;

        let (mut parts, body) = response.into_parts();
        remove_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, incoming(body)))
    }
}

fn request_host<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
}

/// Strip `prefix` from `path` when it ends on a segment boundary
pub(crate) fn strip_segment_prefix(path: &str, prefix: &str) -> Option<String> {
    let rest = path.strip_prefix(prefix)?;
    match rest.chars().next() {
        None => Some("/".to_string()),
        Some('/') => Some(rest.to_string()),
        Some('?') => Some(format!("/{}", rest)),
        Some(_) => None,
    }
}

/// Watches and log follows stream indefinitely
fn is_streaming(path_and_query: &str) -> bool {
    let Some((_, query)) = path_and_query.split_once('?') else {
        return false;
    };
    query.split('&').any(|pair| {
        matches!(
            pair.split_once('='),
            Some(("watch", "true" | "1")) | Some(("follow", "true"))
        )
    })
}

static HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(name)
}

fn remove_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
}
