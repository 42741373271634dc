pub mod config;
pub mod consumer;
pub mod dedup;
pub mod error;
pub mod store;
