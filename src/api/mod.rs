//! HTTP API surface.

pub mod routes;
pub mod types;

pub use routes::{serve, AppState};
