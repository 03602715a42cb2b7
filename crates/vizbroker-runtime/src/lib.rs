//! vizbroker-runtime: Execution backends
//!
//! Backends own a set of hosts and turn a granted host set into a launcher
//! handle that can run commands there:
//! - Local backend for the broker's own host
//! - SSH backend for hosts reachable with passwordless SSH

pub mod local;
pub mod reservation;
pub mod ssh;
pub mod traits;

pub use local::LocalBackend;
pub use ssh::SshBackend;
pub use traits::{Backend, Launcher};

use std::sync::Arc;
use vizbroker_core::{BackendConfig, BackendKind};

/// Build the backend described by a configuration entry
pub fn backend_from_config(config: &BackendConfig) -> Arc<dyn Backend> {
    match config.kind {
        BackendKind::Local => Arc::new(LocalBackend::from_config(config)),
        BackendKind::Ssh => Arc::new(SshBackend::from_config(config)),
    }
}
