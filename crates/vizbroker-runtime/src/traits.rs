//! Backend and launcher trait definitions

use async_trait::async_trait;
use std::sync::Arc;
use tokio::process::Child;
use uuid::Uuid;
use vizbroker_core::{BrokerResult, GroupId, UserId};

/// An execution backend managing a disjoint set of hosts
#[async_trait]
pub trait Backend: Send + Sync {
    /// Hosts owned by this backend
    fn node_names(&self) -> Vec<String>;

    /// Hosts that are currently down or drained
    async fn unusable_nodes(&self) -> Vec<String>;

    /// Obtain a launcher bound to `hosts` on behalf of a user
    async fn allocate(
        &self,
        user: UserId,
        group: GroupId,
        hosts: &[String],
    ) -> BrokerResult<Arc<dyn Launcher>>;

    /// Get the backend name
    fn name(&self) -> &'static str;
}

/// Session handle returned by a backend
#[async_trait]
pub trait Launcher: Send + Sync + std::fmt::Debug {
    fn id(&self) -> Uuid;

    /// Name of the backend that created this handle
    fn backend(&self) -> &'static str;

    /// Hosts this launcher may run on
    fn hosts(&self) -> &[String];

    /// True for non-owning copies; releasing them does nothing
    fn is_reference(&self) -> bool;

    /// Non-owning copy of this handle
    fn reference(&self) -> Arc<dyn Launcher>;

    /// Tear down the backend session. Idempotent.
    async fn release(&self) -> BrokerResult<()>;

    /// Run a command on one of the launcher's hosts
    async fn run(&self, host: &str, args: &[String]) -> BrokerResult<Child>;
}
