pub mod cache;
pub mod config;
pub mod domain;
pub mod errors;
pub mod logging;
pub mod maps_client;
pub mod mcp;
pub mod rate_limiter;
pub mod retry;

pub use mcp::server::Server;
