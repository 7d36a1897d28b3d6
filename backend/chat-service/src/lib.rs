pub mod config;
pub mod cursor;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod outbox;
pub mod repositories;
pub mod services;
pub mod store;
pub mod types;
pub mod websocket;
