use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type for everything the router sends or returns
pub type RouterBody = BoxBody<Bytes, BoxError>;

pub fn full(bytes: impl Into<Bytes>) -> RouterBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

pub fn empty() -> RouterBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Stream an incoming body through without buffering
pub fn incoming(body: Incoming) -> RouterBody {
    body.map_err(|e| Box::new(e) as BoxError).boxed()
}
