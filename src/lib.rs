// ===============================
// src/lib.rs
// ===============================
pub mod auth;
pub mod broadcast;
pub mod config;
pub mod correlator;
pub mod domain;
pub mod error;
pub mod gateway;
pub mod market_data;
pub mod metrics;
pub mod orders;
pub mod protocol;
pub mod router;
pub mod server;
pub mod transport;

pub use error::{GatewayError, Result};
pub use gateway::{Gateway, GatewayConfig};
