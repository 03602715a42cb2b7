//! Outstanding grants

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;
use vizbroker_core::{AllocatedItem, GroupId, Resource, UserId};
use vizbroker_runtime::Launcher;

/// A grant: the chosen resources in request shape plus the backend handles
#[derive(Debug, Clone)]
pub struct Allocation {
    pub id: Uuid,
    pub user: UserId,
    pub group: GroupId,
    pub items: Vec<AllocatedItem>,
    pub launchers: Vec<Arc<dyn Launcher>>,
    pub created_at: DateTime<Utc>,
}

impl Allocation {
    pub fn new(
        user: UserId,
        group: GroupId,
        items: Vec<AllocatedItem>,
        launchers: Vec<Arc<dyn Launcher>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user,
            group,
            items,
            launchers,
            created_at: Utc::now(),
        }
    }

    /// Every granted resource, flattened
    pub fn resources(&self) -> Vec<&Resource> {
        self.items.iter().flat_map(|item| item.resources()).collect()
    }

    /// Hosts touched by this grant
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .resources()
            .into_iter()
            .filter_map(|r| r.host_name.clone())
            .collect();
        hosts.sort();
        hosts.dedup();
        hosts
    }

    /// Launcher bound to `host`, if a schedulable resource was granted there
    pub fn launcher_for(&self, host: &str) -> Option<&Arc<dyn Launcher>> {
        self.launchers
            .iter()
            .find(|l| l.hosts().iter().any(|h| h == host))
    }

    /// A cleared grant has already been released
    pub fn is_released(&self) -> bool {
        self.items.is_empty() && self.launchers.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.launchers.clear();
    }

    /// Copy for callers; its launchers never tear down a backend session
    pub fn detached(&self) -> Self {
        Self {
            launchers: self.launchers.iter().map(|l| l.reference()).collect(),
            ..self.clone()
        }
    }
}

/// Live grants by id
#[derive(Debug, Default)]
pub struct AllocationLedger {
    allocations: HashMap<Uuid, Allocation>,
}

impl AllocationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, allocation: Allocation) {
        self.allocations.insert(allocation.id, allocation);
    }

    pub fn remove(&mut self, id: &Uuid) -> Option<Allocation> {
        self.allocations.remove(id)
    }

    pub fn get(&self, id: &Uuid) -> Option<&Allocation> {
        self.allocations.get(id)
    }

    /// All grants, oldest first
    pub fn list(&self) -> Vec<&Allocation> {
        let mut list: Vec<&Allocation> = self.allocations.values().collect();
        list.sort_by_key(|a| (a.created_at, a.id));
        list
    }

    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vizbroker_runtime::{Backend, LocalBackend};

    fn grant() -> Vec<AllocatedItem> {
        vec![
            AllocatedItem::Resource(Resource::gpu().with_index(0).on_host("viz2")),
            AllocatedItem::CoLocated(vec![
                Resource::server().with_index(1).on_host("viz1"),
                Resource::gpu().with_index(0).on_host("viz1"),
            ]),
        ]
    }

    #[test]
    fn test_allocation_resources_and_hosts() {
        let allocation = Allocation::new(1000, 100, grant(), Vec::new());
        assert_eq!(allocation.resources().len(), 3);
        assert_eq!(allocation.hosts(), vec!["viz1".to_string(), "viz2".to_string()]);
        assert!(!allocation.is_released());
    }

    #[test]
    fn test_clear_marks_released() {
        let mut allocation = Allocation::new(1000, 100, grant(), Vec::new());
        allocation.clear();
        assert!(allocation.is_released());
        assert!(allocation.resources().is_empty());
    }

    #[tokio::test]
    async fn test_detached_launchers_are_references() {
        let backend = LocalBackend::new(vec!["viz1".to_string()]);
        let launcher = backend.allocate(1000, 100, &["viz1".to_string()]).await.unwrap();
        let allocation = Allocation::new(1000, 100, grant(), vec![launcher]);

        assert!(allocation.launcher_for("viz1").is_some());
        assert!(allocation.launcher_for("viz2").is_none());

        let copy = allocation.detached();
        assert_eq!(copy.id, allocation.id);
        assert!(copy.launchers[0].is_reference());
        copy.launchers[0].release().await.unwrap();
        assert_eq!(backend.reservation_count().await, 1);
    }

    #[test]
    fn test_ledger_insert_remove() {
        let mut ledger = AllocationLedger::new();
        let allocation = Allocation::new(1000, 100, grant(), Vec::new());
        let id = allocation.id;
        ledger.insert(allocation);
        assert!(ledger.get(&id).is_some());
        assert_eq!(ledger.list().len(), 1);
        assert!(ledger.remove(&id).is_some());
        assert!(ledger.remove(&id).is_none());
        assert!(ledger.is_empty());
    }
}
