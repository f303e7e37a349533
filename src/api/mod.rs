//! HTTP API - request types, handlers and routing

pub mod extract;
pub mod handlers;
pub mod routes;
pub mod types;
