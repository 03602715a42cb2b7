//! The broker: allocation, release and queries over one registry

use futures::future::join_all;
use serde::Serialize;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vizbroker_core::{
    AllocatedItem, BrokerConfig, BrokerError, BrokerResult, GroupId, Node, NodeGrant,
    RequestItem, Resource, ResourceGroup, ResourceKey, UserId,
};
use vizbroker_runtime::{backend_from_config, Backend, Launcher};

use crate::expander::{ExpandedRequest, RequestExpander, Slot};
use crate::ledger::{Allocation, AllocationLedger};
use crate::planner::{PhasedAllocator, Plan};
use crate::registry::Registry;

/// Summary of the broker's state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokerStatus {
    pub nodes: usize,
    pub resources: usize,
    pub free_resources: usize,
    pub allocations: usize,
    pub unusable_nodes: Vec<String>,
    pub backends: Vec<String>,
}

/// Single authority over a resource registry
pub struct Broker {
    registry: RwLock<Registry>,
    ledger: RwLock<AllocationLedger>,
    backends: Vec<Arc<dyn Backend>>,
    /// Serializes every operation that mutates the registry
    commit_lock: Mutex<()>,
}

impl Broker {
    pub fn new(registry: Registry, backends: Vec<Arc<dyn Backend>>) -> Self {
        info!(
            resources = registry.len(),
            backends = backends.len(),
            "Broker initialized"
        );
        Self {
            registry: RwLock::new(registry),
            ledger: RwLock::new(AllocationLedger::new()),
            backends,
            commit_lock: Mutex::new(()),
        }
    }

    /// Build the registry and backends described by `config`
    pub fn from_config(config: &BrokerConfig) -> BrokerResult<Self> {
        let registry = Registry::from_config(config)?;
        let backends = config.backends.iter().map(backend_from_config).collect();
        Ok(Self::new(registry, backends))
    }

    /// Hosts that any backend reports as down or drained
    pub async fn unusable_nodes(&self) -> Vec<String> {
        let mut hosts = BTreeSet::new();
        for backend in &self.backends {
            hosts.extend(backend.unusable_nodes().await);
        }
        hosts.into_iter().collect()
    }

    /// Allocate `request` for a user, all or nothing
    ///
    /// An empty `include_nodes` puts no restriction on the hosts used.
    pub async fn allocate(
        &self,
        request: &[RequestItem],
        include_nodes: &[String],
        user: UserId,
        group: GroupId,
    ) -> BrokerResult<Allocation> {
        let _guard = self.commit_lock.lock().await;
        debug!(user = user, group = group, items = request.len(), "Allocation requested");

        let unusable = self.unusable_nodes().await;
        let (expanded, plan) = {
            let registry = self.registry.read().await;
            let planned = RequestExpander::new(registry.resource_groups())
                .expand(request)
                .and_then(|expanded| {
                    PhasedAllocator::new(&registry, &unusable, include_nodes)
                        .plan(&expanded, user)
                        .map(|plan| (expanded, plan))
                });
            match planned {
                Ok(planned) => planned,
                Err(e) => {
                    if e.is_internal() {
                        error!(user = user, error = %e, "Allocation failed");
                    } else {
                        info!(user = user, error = %e, "Allocation rejected");
                    }
                    return Err(e);
                }
            }
        };

        let (applied, granted) = self.commit(&plan, user).await?;

        let items = match reassemble(&expanded, &plan, granted.clone()) {
            Ok(items) => items,
            Err(e) => {
                error!(user = user, error = %e, "Could not rebuild the grant");
                self.rollback(&applied, user).await;
                return Err(e);
            }
        };

        let launchers = match self.bind_backends(&granted, user, group).await {
            Ok(launchers) => launchers,
            Err(e) => {
                warn!(user = user, error = %e, "Backend failed, rolling back allocation");
                self.rollback(&applied, user).await;
                return Err(e);
            }
        };

        let allocation = Allocation::new(user, group, items, launchers);
        info!(
            allocation_id = %allocation.id,
            user = user,
            hosts = ?allocation.hosts(),
            "Allocation granted"
        );
        let copy = allocation.detached();
        self.ledger.write().await.insert(allocation);
        Ok(copy)
    }

    /// Write a plan through to the live registry
    async fn commit(
        &self,
        plan: &Plan,
        user: UserId,
    ) -> BrokerResult<(Vec<ResourceKey>, Vec<Vec<Resource>>)> {
        let mut registry = self.registry.write().await;
        let mut applied = Vec::new();
        let mut granted = Vec::with_capacity(plan.groups.len());

        for group in &plan.groups {
            let mut copies = Vec::with_capacity(group.len());
            for res in group {
                match commit_one(&mut registry, res, user) {
                    Ok((key, copy)) => {
                        applied.push(key);
                        copies.push(copy);
                    }
                    Err(e) => {
                        error!(user = user, error = %e, "Commit failed, restoring registry");
                        release_keys(&mut registry, &applied, user);
                        return Err(e);
                    }
                }
            }
            granted.push(copies);
        }
        Ok((applied, granted))
    }

    async fn rollback(&self, applied: &[ResourceKey], user: UserId) {
        let mut registry = self.registry.write().await;
        release_keys(&mut registry, applied, user);
    }

    /// Obtain a launcher from every backend owning a granted schedulable host
    async fn bind_backends(
        &self,
        granted: &[Vec<Resource>],
        user: UserId,
        group: GroupId,
    ) -> BrokerResult<Vec<Arc<dyn Launcher>>> {
        let hosts: BTreeSet<String> = granted
            .iter()
            .flatten()
            .filter(|r| r.class().is_schedulable())
            .filter_map(|r| r.host_name.clone())
            .collect();

        let mut launchers: Vec<Arc<dyn Launcher>> = Vec::new();
        let mut bound = BTreeSet::new();
        for backend in &self.backends {
            let owned = backend.node_names();
            let subset: Vec<String> = hosts
                .iter()
                .filter(|h| owned.contains(h))
                .cloned()
                .collect();
            if subset.is_empty() {
                continue;
            }
            match backend.allocate(user, group, &subset).await {
                Ok(launcher) => {
                    debug!(
                        backend = backend.name(),
                        launcher = %launcher.id(),
                        hosts = ?subset,
                        "Launcher acquired"
                    );
                    bound.extend(subset);
                    launchers.push(launcher);
                }
                Err(e) => {
                    release_all(&launchers).await;
                    return Err(match e {
                        BrokerError::Backend(_) => e,
                        other => BrokerError::Backend(other.to_string()),
                    });
                }
            }
        }

        for host in hosts.difference(&bound) {
            debug!(host = %host, "No backend manages host");
        }
        Ok(launchers)
    }

    /// Release a grant held by the caller
    ///
    /// A grant that was already released is left alone.
    pub async fn deallocate(&self, allocation: &mut Allocation) -> BrokerResult<()> {
        if allocation.is_released() {
            debug!(allocation_id = %allocation.id, "Allocation already released");
            return Ok(());
        }
        self.release(allocation.id).await?;
        allocation.clear();
        Ok(())
    }

    /// Release a grant by id
    pub async fn deallocate_by_id(&self, id: Uuid) -> BrokerResult<()> {
        self.release(id).await
    }

    /// Release a grant, all or nothing
    ///
    /// The registry is only written and the ledger entry only dropped once
    /// every resource of the grant has been released on a scratch copy.
    async fn release(&self, id: Uuid) -> BrokerResult<()> {
        let _guard = self.commit_lock.lock().await;
        let grant = self
            .ledger
            .read()
            .await
            .get(&id)
            .map(Allocation::detached)
            .ok_or(BrokerError::AllocationNotFound(id))?;

        {
            let mut registry = self.registry.write().await;
            let released = release_resources(&registry, &grant).map_err(|e| {
                warn!(allocation_id = %id, error = %e, "Could not release allocation");
                e
            })?;
            for (key, res) in released {
                if let Some(live) = registry.get_mut(&key) {
                    *live = res;
                }
            }
        }

        let mut owned = self
            .ledger
            .write()
            .await
            .remove(&id)
            .ok_or(BrokerError::AllocationNotFound(id))?;
        release_all(&owned.launchers).await;
        owned.clear();
        info!(allocation_id = %id, user = owned.user, "Allocation released");
        Ok(())
    }

    /// Copies of every registry entry
    pub async fn resources(&self) -> Vec<Resource> {
        let registry = self.registry.read().await;
        registry.iter().map(|(_, r)| r.clone()).collect()
    }

    /// Copies of the entries matching `template`
    pub async fn search(&self, template: &Resource) -> Vec<Resource> {
        let registry = self.registry.read().await;
        registry
            .iter()
            .filter(|(_, r)| r.type_search_match(template))
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub async fn nodes(&self) -> Vec<Node> {
        let registry = self.registry.read().await;
        registry.nodes().cloned().collect()
    }

    pub async fn allocations(&self) -> Vec<Allocation> {
        let ledger = self.ledger.read().await;
        ledger.list().into_iter().map(Allocation::detached).collect()
    }

    pub async fn allocation(&self, id: Uuid) -> BrokerResult<Allocation> {
        let ledger = self.ledger.read().await;
        ledger
            .get(&id)
            .map(Allocation::detached)
            .ok_or(BrokerError::AllocationNotFound(id))
    }

    pub async fn status(&self) -> BrokerStatus {
        let unusable_nodes = self.unusable_nodes().await;
        let registry = self.registry.read().await;
        let ledger = self.ledger.read().await;
        BrokerStatus {
            nodes: registry.nodes().count(),
            resources: registry.len(),
            free_resources: registry.free_count(),
            allocations: ledger.len(),
            unusable_nodes,
            backends: self.backends.iter().map(|b| b.name().to_string()).collect(),
        }
    }

    /// Full copy of the registry
    pub async fn registry_snapshot(&self) -> Registry {
        self.registry.read().await.clone()
    }
}

fn commit_one(
    registry: &mut Registry,
    res: &Resource,
    user: UserId,
) -> BrokerResult<(ResourceKey, Resource)> {
    let key = res.key().ok_or_else(|| {
        BrokerError::Internal(format!("planned {} is not completely resolvable", res))
    })?;
    let live = registry
        .get_mut(&key)
        .ok_or_else(|| BrokerError::ResourceUnknown(format!("{} is not managed by this broker", key)))?;
    if let Err(e) = live.do_allocate(res, user) {
        return Err(BrokerError::Internal(format!(
            "planned {} could not be committed: {}",
            key, e
        )));
    }
    Ok((key, live.clone()))
}

/// Drop the grant's ownership from copies of the entries it touches
fn release_resources(
    registry: &Registry,
    grant: &Allocation,
) -> BrokerResult<BTreeMap<ResourceKey, Resource>> {
    let mut scratch: BTreeMap<ResourceKey, Resource> = BTreeMap::new();
    for res in grant.resources() {
        let key = res.key().ok_or_else(|| {
            BrokerError::Internal(format!("{} in a grant is not resolvable", res))
        })?;
        let live = match scratch.entry(key) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let current = registry
                    .get(entry.key())
                    .cloned()
                    .ok_or_else(|| BrokerError::ResourceUnknown(entry.key().to_string()))?;
                entry.insert(current)
            }
        };
        live.deallocate(grant.user)?;
    }
    Ok(scratch)
}

fn release_keys(registry: &mut Registry, keys: &[ResourceKey], user: UserId) {
    for key in keys.iter().rev() {
        let outcome = registry
            .get_mut(key)
            .ok_or_else(|| BrokerError::ResourceUnknown(key.to_string()))
            .and_then(|live| live.deallocate(user));
        if let Err(e) = outcome {
            error!(resource = %key, error = %e, "Rollback could not release resource");
        }
    }
}

async fn release_all(launchers: &[Arc<dyn Launcher>]) {
    let results = join_all(launchers.iter().map(|l| l.release())).await;
    for (launcher, result) in launchers.iter().zip(results) {
        match result {
            Ok(()) => debug!(launcher = %launcher.id(), "Launcher released"),
            Err(e) => warn!(launcher = %launcher.id(), error = %e, "Launcher release failed"),
        }
    }
}

fn take_group(granted: &mut [Option<Vec<Resource>>], g: usize) -> BrokerResult<Vec<Resource>> {
    granted
        .get_mut(g)
        .and_then(Option::take)
        .ok_or_else(|| BrokerError::Internal(format!("group {} is missing from the grant", g)))
}

/// Put granted resources back into the shape of the request
fn reassemble(
    expanded: &ExpandedRequest,
    plan: &Plan,
    granted: Vec<Vec<Resource>>,
) -> BrokerResult<Vec<AllocatedItem>> {
    let mut granted: Vec<Option<Vec<Resource>>> = granted.into_iter().map(Some).collect();
    let mut items = Vec::with_capacity(expanded.slots.len());

    for slot in &expanded.slots {
        let item = match slot {
            Slot::Resource(g) => {
                let mut list = take_group(&mut granted, *g)?;
                match (list.pop(), list.is_empty()) {
                    (Some(res), true) => AllocatedItem::Resource(res),
                    _ => {
                        return Err(BrokerError::Internal(format!(
                            "group {} should hold exactly one resource",
                            g
                        )))
                    }
                }
            }
            Slot::CoLocated(g) => AllocatedItem::CoLocated(take_group(&mut granted, *g)?),
            Slot::Group { template, groups } => {
                let layout = groups
                    .clone()
                    .map(|g| take_group(&mut granted, g))
                    .collect::<BrokerResult<Vec<_>>>()?;
                AllocatedItem::Group(ResourceGroup {
                    layout,
                    ..template.clone()
                })
            }
            Slot::Node(g) => {
                let host_name = plan.node_hosts.get(g).cloned().ok_or_else(|| {
                    BrokerError::Internal(format!("no host recorded for node group {}", g))
                })?;
                AllocatedItem::Node(NodeGrant {
                    host_name,
                    resources: take_group(&mut granted, *g)?,
                })
            }
        };
        items.push(item);
    }
    Ok(items)
}
