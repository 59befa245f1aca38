//! The app's own API: cluster listing and lifecycle actions
//!
//! ```text
//! GET  <prefix>/clusters
//! GET  <prefix>/clusters/<id>
//! POST <prefix>/clusters/<id>/activate[?force=true]
//! POST <prefix>/clusters/<id>/refresh
//! POST <prefix>/clusters/<id>/disconnect
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use hyper::body::Incoming;
use hyper::header::{self, HeaderValue};
use hyper::{Method, Request, Response, StatusCode};
use serde::Serialize;

use kubedesk_cluster::{ClusterRegistry, RegistryError};
use kubedesk_types::ClusterId;

use crate::body::{RouterBody, full};
use crate::error::RouterError;
use crate::router::{LocalRoutes, strip_segment_prefix};

pub struct AppApi {
    registry: Arc<ClusterRegistry>,
    prefix: String,
}

impl AppApi {
    pub fn new(registry: Arc<ClusterRegistry>, prefix: impl Into<String>) -> Self {
        Self {
            registry,
            prefix: prefix.into(),
        }
    }

    async fn route(&self, req: &Request<Incoming>) -> Result<Response<RouterBody>, RouterError> {
        let not_found = || RouterError::NotFound(format!("no route for {}", req.uri().path()));

        let rest = strip_segment_prefix(req.uri().path(), &self.prefix).ok_or_else(not_found)?;
        let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();

        match (req.method(), segments.as_slice()) {
            (&Method::GET, ["clusters"]) => json(&self.registry.snapshots()),
            (&Method::GET, ["clusters", id]) => {
                let id = parse_id(id)?;
                let cluster = self
                    .registry
                    .get(&id)
                    .ok_or(RegistryError::NotFound(id))?;
                json(&cluster.snapshot())
            }
            (&Method::POST, ["clusters", id, "activate"]) => {
                let force = req
                    .uri()
                    .query()
                    .is_some_and(|q| q.split('&').any(|pair| pair == "force=true"));
                let snapshot = self.registry.activate(&parse_id(id)?, force).await?;
                json(&snapshot)
            }
            (&Method::POST, ["clusters", id, "refresh"]) => {
                json(&self.registry.refresh(&parse_id(id)?).await?)
            }
            (&Method::POST, ["clusters", id, "disconnect"]) => {
                let id = parse_id(id)?;
                self.registry.disconnect(&id)?;
                let cluster = self
                    .registry
                    .get(&id)
                    .ok_or(RegistryError::NotFound(id))?;
                json(&cluster.snapshot())
            }
            _ => Err(not_found()),
        }
    }
}

#[async_trait]
impl LocalRoutes for AppApi {
    async fn handle(&self, req: Request<Incoming>) -> Response<RouterBody> {
        self.route(&req)
            .await
            .unwrap_or_else(RouterError::into_response)
    }
}

fn parse_id(raw: &str) -> Result<ClusterId, RouterError> {
    ClusterId::parse(raw).ok_or_else(|| RouterError::BadRequest(format!("invalid cluster id '{}'", raw)))
}

fn json<T: Serialize>(value: &T) -> Result<Response<RouterBody>, RouterError> {
    let body = serde_json::to_vec(value)?;
    let mut response = Response::new(full(body));
    *response.status_mut() = StatusCode::OK;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    Ok(response)
}
