//! Hyperfeed
//!
//! A resilient WebSocket session manager for the Hyperliquid streaming
//! endpoint: one supervised connection, reconnection with exponential
//! backoff, zombie-socket detection, and best-effort continuous delivery
//! into an application callback.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
