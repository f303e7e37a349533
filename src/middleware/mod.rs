//! HTTP middleware

pub mod timing;
