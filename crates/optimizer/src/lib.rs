//! Resource Optimizer service
//!
//! Configuration loading and the HTTP API of the `resource-optimizer`
//! controller binary.

pub mod api;
pub mod config;
