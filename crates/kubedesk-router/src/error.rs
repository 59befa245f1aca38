//! Router errors and Kubernetes-style error responses

use std::time::Duration;

use hyper::{Response, StatusCode, header};

use kubedesk_cluster::{ContextError, RegistryError};

use crate::body::{RouterBody, full};

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("upstream did not answer within {0:?}")]
    Timeout(Duration),

    #[error("invalid upstream request: {0}")]
    Request(#[from] http::Error),

    #[error("upgrade failed: {0}")]
    Upgrade(String),

    #[error("upstream connection failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode response: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),
}

impl RouterError {
    pub fn status(&self) -> StatusCode {
        match self {
            RouterError::Registry(RegistryError::NotFound(_)) | RouterError::NotFound(_) => {
                StatusCode::NOT_FOUND
            }
            RouterError::Registry(RegistryError::NotActive(_)) => StatusCode::CONFLICT,
            RouterError::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn into_response(self) -> Response<RouterBody> {
        status_response(self.status(), &self.to_string())
    }
}

/// Response with a Kubernetes `Status` body, understood by kubectl and
/// client libraries
pub fn status_response(status: StatusCode, message: &str) -> Response<RouterBody> {
    let body = serde_json::json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": message,
        "code": status.as_u16(),
    });

    let mut response = Response::new(full(body.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
}
