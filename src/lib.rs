pub mod api;
pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod intercept;
pub mod server;
pub mod source;
