pub mod api;
pub mod auth;
pub mod config;
pub mod endpoint;
pub mod event;
pub mod keys;
pub mod prometheus;
pub mod redis;
pub mod router;
pub mod server;
pub mod sink;
pub mod sinks;
pub mod time;
pub mod validation;
