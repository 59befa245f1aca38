//! Reverse proxy in front of kubedesk clusters
//!
//! Every cluster is reachable under the router's own origin, either as
//! `http://<id>.<host>:<port>/...` or `http://127.0.0.1:<port>/<id>/...`.
//! API requests go to the cluster's authenticating proxy; everything else is
//! served by the app's local routes.

pub mod app;
pub mod body;
pub mod error;
pub mod retry;
pub mod router;
pub mod server;
pub mod upgrade;

pub use app::AppApi;
pub use body::RouterBody;
pub use error::{RouterError, status_response};
pub use retry::{RetryCounter, RetryPolicy};
pub use router::{LocalRoutes, Router, RouterConfig};
pub use server::serve;
