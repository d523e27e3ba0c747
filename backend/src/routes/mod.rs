//! HTTP and WebSocket endpoints.

pub mod eval;
pub mod generate;
pub mod health;
