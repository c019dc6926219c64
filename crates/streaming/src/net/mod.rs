//! Networking layer: scheme plugins, retrying dispatch and cancellable
//! request handles.

mod engine;
mod http;
mod registry;
mod request;

pub use engine::NetworkingEngine;
pub use http::HttpPlugin;
pub use registry::{SchemePlugin, SchemeRegistry};
pub use request::{
    PendingRequest, Request, RequestContext, RequestProgress, RequestType, Response,
    StreamDataCallback,
};
