//! vizbroker-core: Core types for the vizbroker resource broker
//!
//! This crate provides the types shared by every part of the broker:
//! - The resource capability model (identity, sharing, matching, weights)
//! - Node descriptions
//! - Request and grant shapes
//! - Configuration schema
//! - Error handling

pub mod config;
pub mod error;
pub mod node;
pub mod request;
pub mod resource;

pub use config::*;
pub use error::*;
pub use node::*;
pub use request::*;
pub use resource::*;
