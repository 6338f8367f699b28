//! HTTP API: event registry, settlement and health/metrics endpoints.
//!
//! Authenticated calls carry the caller's identity in the `x-identity` header.

pub mod handlers;
pub mod routes;

pub use handlers::{ApiError, AppState, Caller, IDENTITY_HEADER};
pub use routes::create_router;
