//! Data source implementations

pub mod failover;
pub mod http;

pub use failover::FailoverSource;
pub use http::HttpJsonSource;
