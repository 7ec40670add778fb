pub mod app_context;
pub mod config;
pub mod database;
pub mod derivation;
pub mod errors;
pub mod poll;
pub mod services;
pub mod storage;
pub mod transforms;

#[cfg(feature = "server")]
pub mod server;
