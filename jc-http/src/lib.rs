//! Axum HTTP surface for the job controller: route table, request/response
//! shapes, error mapping, and the shutdown coordinator.

pub mod app;
pub mod error;
pub mod rest;
pub mod state;

pub use app::build_router;
pub use error::ApiError;
pub use state::AppState;
