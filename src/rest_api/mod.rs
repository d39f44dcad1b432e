//! REST API module for external integrations
//!
//! Exposes the rolling-update control surface over HTTP.

mod dto;
mod handlers;
mod server;

pub use dto::{
    ClusterListResponse, ErrorResponse, HealthResponse, MessageResponse, SingleNodeRequest,
    SingleNodeResponse, StartRollingRequest, StatusResponse,
};
pub use server::{router, run_server};
