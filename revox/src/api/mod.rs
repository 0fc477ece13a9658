//! HTTP control surface: a thin REST layer over the orchestrator.

pub mod error;
pub mod models;
pub mod routes;
pub mod server;

pub use error::{ApiError, ApiResult};
pub use server::{AppState, serve};
