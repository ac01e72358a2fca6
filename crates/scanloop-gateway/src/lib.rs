//! # Scanloop Gateway
//!
//! Thin HTTP surface over the automation engine: task CRUD and triggering,
//! scheduler heartbeat endpoints, and webhook subscription management.
//! Request validation and authentication live in front of this service.

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, serve};
