//! vizbroker-scheduler: Resource allocation for vizbroker
//!
//! This crate turns client requests into conflict free grants:
//! - Resource registry built from the node inventory
//! - Request expansion and classification by degrees of freedom
//! - Phased, snapshot isolated matching
//! - Allocation ledger and the broker that ties them together

pub mod broker;
pub mod expander;
pub mod ledger;
pub mod planner;
pub mod registry;

pub use broker::{Broker, BrokerStatus};
pub use expander::{ExpandedGroup, ExpandedRequest, RequestExpander};
pub use ledger::{Allocation, AllocationLedger};
pub use planner::{PhasedAllocator, Plan};
pub use registry::Registry;
