//! vizbroker-api: REST API server for vizbroker
//!
//! This crate exposes the broker over HTTP:
//! - Allocation and release
//! - Resource and node queries
//! - Broker status

pub mod rest;

pub use rest::create_router;
