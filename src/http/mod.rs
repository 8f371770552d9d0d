//! HTTP surface: the axum router over pipelines, projects, threads,
//! automations, and the WebSocket upgrade.

pub mod api;
pub mod server;

pub use api::AppState;
pub use server::{ServerConfig, start_server};
