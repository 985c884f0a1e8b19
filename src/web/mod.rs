//! HTTP signaling server
//!
//! Exposes connection negotiation over plain request/response HTTP, plus a
//! health endpoint.

pub mod auth;
pub use auth::{Authorizer, BasicAuthorizer, Rejection};

pub mod shared;
pub use shared::SharedState;

pub mod http_server;
pub use http_server::{router, run_http_server};
