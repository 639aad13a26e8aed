//! Health, metrics and status endpoints
//!
//! Served on the health probe address: `/healthz`, `/readyz`, `/metrics`
//! and a read-only listing of every managed resource.

mod dto;
mod handlers;
mod server;

pub use dto::{ErrorResponse, HealthResponse, ResourceListResponse, ResourceSummary};
pub use server::{router, run_server};
