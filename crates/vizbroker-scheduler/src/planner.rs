//! Phased matching
//!
//! Planning never touches the registry. It runs against per-host pools of
//! copied free resources and, bucket by bucket, binds every open requirement
//! to a concrete resource. The broker commits the resulting [`Plan`] only if
//! every bucket succeeded.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error};
use vizbroker_core::{
    BrokerError, BrokerResult, GpuAttributes, Resource, ResourceClass, ResourceKind,
    SliAttributes, UserId,
};

use crate::expander::{ExpandedGroup, ExpandedRequest};
use crate::registry::Registry;

/// Free resources of one host
type Pool = Vec<Resource>;

/// A complete assignment for an expanded request
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    /// Resolved resources per expanded group, in member order
    pub groups: Vec<Vec<Resource>>,
    /// Host handed out for each whole-node group
    pub node_hosts: BTreeMap<usize, String>,
}

/// The matcher
pub struct PhasedAllocator<'a> {
    registry: &'a Registry,
    unusable: BTreeSet<String>,
    include: BTreeSet<String>,
}

impl<'a> PhasedAllocator<'a> {
    /// `include` restricts matching to those hosts unless it is empty
    pub fn new(registry: &'a Registry, unusable: &[String], include: &[String]) -> Self {
        Self {
            registry,
            unusable: unusable.iter().cloned().collect(),
            include: include.iter().cloned().collect(),
        }
    }

    fn is_usable(&self, host: &str) -> bool {
        !self.unusable.contains(host)
    }

    fn is_included(&self, host: &str) -> bool {
        self.include.is_empty() || self.include.contains(host)
    }

    /// Check every fully resolved reference against the live registry
    pub fn validate_fixed(&self, request: &ExpandedRequest) -> BrokerResult<()> {
        for (key, usage) in &request.fixed {
            let live = self.registry.get(key).ok_or_else(|| {
                BrokerError::ResourceUnknown(format!("{} is not managed by this broker", key))
            })?;
            if !self.is_usable(&key.host_name) {
                return Err(BrokerError::ResourceUnavailable(format!(
                    "{} is not available at this time",
                    key
                )));
            }
            if !live.is_free() {
                return Err(BrokerError::ResourceBusy(format!("{} is already in use", key)));
            }
            if !live.type_search_match(&usage.template) {
                return Err(BrokerError::MalformedRequest(format!(
                    "{} does not match the requested {}",
                    live, usage.template
                )));
            }
            if !self.is_included(&key.host_name) {
                return Err(BrokerError::ResourceUnavailable(format!(
                    "{} is not on an included node",
                    key
                )));
            }
            if usage.template.is_exclusive() && live.is_shared() {
                return Err(BrokerError::ResourceBusy(format!(
                    "{} is allocated for shared access and cannot be taken exclusively",
                    key
                )));
            }
            if usage.template.is_shared() && !live.is_sharable() {
                return Err(BrokerError::ResourceBusy(format!("{} is not sharable", key)));
            }
        }
        Ok(())
    }

    /// Copies of the free resources on every usable, included host
    fn snapshot(&self) -> BTreeMap<String, Pool> {
        let mut pools: BTreeMap<String, Pool> = BTreeMap::new();
        for (key, res) in self.registry.iter() {
            if !self.is_usable(&key.host_name) || !self.is_included(&key.host_name) {
                continue;
            }
            let pool = pools.entry(key.host_name.clone()).or_default();
            if res.is_free() {
                pool.push(res.clone());
            }
        }
        pools
    }

    /// Produce a plan for `request` on behalf of `user`
    pub fn plan(&self, request: &ExpandedRequest, user: UserId) -> BrokerResult<Plan> {
        self.validate_fixed(request)?;

        let mut pools = self.snapshot();
        let mut chosen: Vec<Option<Vec<Resource>>> = vec![None; request.groups.len()];
        let mut node_hosts = BTreeMap::new();

        self.consume_fixed(request, &mut pools, user)?;
        for &g in &request.buckets[0] {
            chosen[g] = Some(members(request, g)?.to_vec());
        }

        self.match_index_bound(request, &mut pools, &mut chosen, user)?;
        self.match_host_bound(request, &mut pools, &mut chosen, user)?;
        self.match_unbound(request, &mut pools, &mut chosen, &mut node_hosts, user)?;

        let groups = chosen
            .into_iter()
            .enumerate()
            .map(|(g, c)| {
                c.ok_or_else(|| BrokerError::Internal(format!("group {} was never matched", g)))
            })
            .collect::<BrokerResult<Vec<_>>>()?;

        Ok(Plan { groups, node_hosts })
    }

    /// Take every fully resolved member out of the pools
    fn consume_fixed(
        &self,
        request: &ExpandedRequest,
        pools: &mut BTreeMap<String, Pool>,
        user: UserId,
    ) -> BrokerResult<()> {
        for group in &request.groups {
            let ExpandedGroup::Resources(list) = group else {
                continue;
            };
            for res in list {
                let Some(key) = res.key() else { continue };
                let pool = pools.get_mut(&key.host_name).ok_or_else(|| {
                    BrokerError::ResourceUnavailable(format!("{} is not available", key))
                })?;
                let pos = pool
                    .iter()
                    .position(|r| r.key().as_ref() == Some(&key))
                    .ok_or_else(|| {
                        BrokerError::ResourceBusy(format!(
                            "{} has no capacity left for this request",
                            key
                        ))
                    })?;
                pool[pos].do_allocate(res, user)?;
                if !pool[pos].is_free() {
                    pool.remove(pos);
                }
            }
        }
        Ok(())
    }

    /// Bucket 1: index bound, host open
    fn match_index_bound(
        &self,
        request: &ExpandedRequest,
        pools: &mut BTreeMap<String, Pool>,
        chosen: &mut [Option<Vec<Resource>>],
        user: UserId,
    ) -> BrokerResult<()> {
        let mut order = request.buckets[1].clone();
        sort_largest_first(&mut order, request);

        // host-bound requirements that bucket 1 must not starve
        let mut pending: BTreeMap<String, Vec<Resource>> = BTreeMap::new();
        for &g in &request.buckets[2] {
            for res in members(request, g)? {
                if let (2, Some(host)) = (res.allocation_dof(), &res.host_name) {
                    pending.entry(host.clone()).or_default().push(res.clone());
                }
            }
        }

        for g in order {
            let list = members(request, g)?;
            let open = unresolved(list);

            let mut placed = None;
            for host in self.sorted_hosts(pools) {
                let pool = &pools[&host];
                let Some((matched, remaining)) = match_exact(&with_host(&open, &host), pool, user)
                else {
                    continue;
                };
                if let Some(reserved) = pending.get(&host) {
                    if match_by_class(reserved, &remaining, user).is_none() {
                        debug!(group = g, host = %host, "Skipping host reserved for host-bound groups");
                        continue;
                    }
                }
                placed = Some((host, matched, remaining));
                break;
            }

            let (host, matched, remaining) = placed.ok_or_else(|| {
                BrokerError::Unsatisfiable(format!(
                    "not enough resources to satisfy {}",
                    describe(list)
                ))
            })?;
            debug!(group = g, host = %host, "Placed index-bound group");
            pools.insert(host, remaining);
            chosen[g] = Some(fill(list, &open, matched));
        }
        Ok(())
    }

    /// Bucket 2: host bound, index open
    fn match_host_bound(
        &self,
        request: &ExpandedRequest,
        pools: &mut BTreeMap<String, Pool>,
        chosen: &mut [Option<Vec<Resource>>],
        user: UserId,
    ) -> BrokerResult<()> {
        let mut order = request.buckets[2].clone();
        sort_largest_first(&mut order, request);
        self.check_host_capacity(request, &order, pools, user)?;

        for g in order {
            let list = members(request, g)?;
            let open = unresolved(list);
            let host = open
                .first()
                .and_then(|(_, r)| r.host_name.clone())
                .ok_or_else(|| {
                    BrokerError::Internal(format!("group {} has no host-bound members", g))
                })?;
            let pool = pools.get_mut(&host).ok_or_else(|| {
                BrokerError::Internal(format!("no pool for checked node '{}'", host))
            })?;
            pool.sort_by_key(Resource::allocation_weight);

            let wanted: Vec<Resource> = open.iter().map(|(_, r)| r.clone()).collect();
            let (matched, remaining) = match_by_class(&wanted, pool, user).ok_or_else(|| {
                error!(group = g, host = %host, "Host-bound group failed after capacity check");
                BrokerError::Internal(format!(
                    "could not match {} on '{}' although enough resources were counted",
                    describe(list),
                    host
                ))
            })?;
            debug!(group = g, host = %host, "Placed host-bound group");
            *pool = remaining;
            chosen[g] = Some(fill(list, &open, matched));
        }
        Ok(())
    }

    /// Make sure bucket 2 can be met before matching it
    ///
    /// Every host-bound group is matched against a copy of the pools, in the
    /// same order and with the same filters as the real pass, so any
    /// shortfall is reported as the caller's problem.
    fn check_host_capacity(
        &self,
        request: &ExpandedRequest,
        order: &[usize],
        pools: &BTreeMap<String, Pool>,
        user: UserId,
    ) -> BrokerResult<()> {
        for &g in order {
            for (_, res) in unresolved(members(request, g)?) {
                let host = res.host_name.clone().ok_or_else(|| {
                    BrokerError::Internal(format!("{} has no host in a host-bound group", res))
                })?;
                let Some(pool) = pools.get(&host) else {
                    return Err(self.missing_host_error(&host));
                };
                if !pool.iter().any(|c| c.type_search_match(&res)) {
                    return Err(BrokerError::Unsatisfiable(format!(
                        "node '{}' has no free resource matching {}",
                        host, res
                    )));
                }
            }
        }

        let mut trial = pools.clone();
        for &g in order {
            let list = members(request, g)?;
            let wanted: Vec<Resource> = unresolved(list).into_iter().map(|(_, r)| r).collect();
            let Some(host) = wanted.first().and_then(|r| r.host_name.clone()) else {
                continue;
            };
            let Some(pool) = trial.get_mut(&host) else {
                return Err(self.missing_host_error(&host));
            };
            pool.sort_by_key(Resource::allocation_weight);
            let (_, remaining) = match_by_class(&wanted, pool, user).ok_or_else(|| {
                BrokerError::Unsatisfiable(format!(
                    "node '{}' has too few free resources for {}",
                    host,
                    describe(list)
                ))
            })?;
            *pool = remaining;
        }
        Ok(())
    }

    fn missing_host_error(&self, host: &str) -> BrokerError {
        if self.registry.node(host).is_none() {
            BrokerError::ResourceUnknown(format!("node '{}' is not managed by this broker", host))
        } else if !self.is_usable(host) || !self.is_included(host) {
            BrokerError::ResourceUnavailable(format!(
                "node '{}' is not available for allocation",
                host
            ))
        } else {
            BrokerError::Unsatisfiable(format!("node '{}' has no resources", host))
        }
    }

    /// Bucket 3: ordinary groups first, then whole nodes
    fn match_unbound(
        &self,
        request: &ExpandedRequest,
        pools: &mut BTreeMap<String, Pool>,
        chosen: &mut [Option<Vec<Resource>>],
        node_hosts: &mut BTreeMap<usize, String>,
        user: UserId,
    ) -> BrokerResult<()> {
        let (mut ordinary, whole): (Vec<usize>, Vec<usize>) = request.buckets[3]
            .iter()
            .partition(|&&g| matches!(request.groups[g], ExpandedGroup::Resources(_)));
        sort_largest_first(&mut ordinary, request);

        for g in ordinary {
            let list = members(request, g)?;
            let open = unresolved(list);

            let mut placed = None;
            for host in self.sorted_hosts(pools) {
                if let Some(found) = match_by_class(&with_host(&open, &host), &pools[&host], user) {
                    placed = Some((host, found));
                    break;
                }
            }
            let (host, (matched, remaining)) = placed.ok_or_else(|| {
                BrokerError::Unsatisfiable(format!(
                    "not enough resources to satisfy {}",
                    describe(list)
                ))
            })?;
            debug!(group = g, host = %host, "Placed unbound group");
            pools.insert(host, remaining);
            chosen[g] = Some(fill(list, &open, matched));
        }

        for g in whole {
            let ExpandedGroup::Node(node) = &request.groups[g] else {
                return Err(BrokerError::Internal(format!("group {} is not a node", g)));
            };
            if let Some(wanted) = &node.host_name {
                if self.registry.node(wanted).is_none() {
                    return Err(BrokerError::ResourceUnknown(format!(
                        "node '{}' is not managed by this broker",
                        wanted
                    )));
                }
            }

            let host = self
                .sorted_hosts(pools)
                .into_iter()
                .filter(|h| node.host_name.as_ref().map_or(true, |w| w == h))
                .find(|h| {
                    let pool = &pools[h];
                    self.is_untouched(h, pool) && filters_match(&node.filters, pool)
                })
                .ok_or_else(|| {
                    BrokerError::Unsatisfiable(
                        "no untouched node satisfies the node request".to_string(),
                    )
                })?;

            debug!(group = g, host = %host, "Placed whole node");
            let granted = pools
                .get_mut(&host)
                .map(std::mem::take)
                .unwrap_or_default();
            chosen[g] = Some(granted.iter().map(claim_template).collect());
            node_hosts.insert(g, host);
        }
        Ok(())
    }

    /// Nothing on the host is allocated, not even a zero-weight resource
    fn is_untouched(&self, host: &str, pool: &[Resource]) -> bool {
        let weight: i64 = pool.iter().map(Resource::allocation_weight).sum();
        weight == self.registry.weight_when_free(host)
            && pool.len() == self.registry.resource_count(host)
            && pool.iter().all(|r| r.owners.is_empty())
    }

    /// Sort every pool by weight and return hosts, least loaded first
    fn sorted_hosts(&self, pools: &mut BTreeMap<String, Pool>) -> Vec<String> {
        let mut keyed: Vec<((i64, i64, u32), String)> = pools
            .iter_mut()
            .map(|(host, pool)| {
                pool.sort_by_key(Resource::allocation_weight);
                let load: i64 = pool.iter().map(Resource::allocation_weight).sum();
                let (weight, index) = self
                    .registry
                    .node(host)
                    .map(|n| (n.allocation_weight(), n.index))
                    .unwrap_or((0, u32::MAX));
                ((weight, load, index), host.clone())
            })
            .collect();
        keyed.sort();
        keyed.into_iter().map(|(_, host)| host).collect()
    }
}

fn members(request: &ExpandedRequest, g: usize) -> BrokerResult<&[Resource]> {
    match request.groups.get(g) {
        Some(ExpandedGroup::Resources(list)) => Ok(list),
        _ => Err(BrokerError::Internal(format!(
            "group {} is not a resource list",
            g
        ))),
    }
}

fn sort_largest_first(order: &mut [usize], request: &ExpandedRequest) {
    order.sort_by_key(|&g| Reverse(request.groups[g].len()));
}

/// Members still needing a match, with their position in the group
fn unresolved(list: &[Resource]) -> Vec<(usize, Resource)> {
    list.iter()
        .enumerate()
        .filter(|(_, r)| r.allocation_dof() != 0)
        .map(|(i, r)| (i, r.clone()))
        .collect()
}

fn with_host(open: &[(usize, Resource)], host: &str) -> Vec<Resource> {
    open.iter()
        .map(|(_, r)| {
            let mut r = r.clone();
            r.host_name = Some(host.to_string());
            r
        })
        .collect()
}

/// Put matched resources back into their group positions
fn fill(list: &[Resource], open: &[(usize, Resource)], matched: Vec<Resource>) -> Vec<Resource> {
    let mut out = list.to_vec();
    for ((pos, _), res) in open.iter().zip(matched) {
        out[*pos] = res;
    }
    out
}

fn describe(list: &[Resource]) -> String {
    let parts: Vec<String> = list.iter().map(|r| r.to_string()).collect();
    format!("[{}]", parts.join(", "))
}

/// Resolve `res` onto `avail` and record the use there
fn claim(avail: &mut Resource, req: &Resource, user: UserId) -> Option<Resource> {
    avail.do_allocate(req, user).ok()?;
    let mut resolved = req.clone();
    resolved.index = avail.index;
    resolved.host_name = avail.host_name.clone();
    Some(resolved)
}

/// Match fully resolved requests by identity
fn match_exact(requests: &[Resource], pool: &[Resource], user: UserId) -> Option<(Vec<Resource>, Pool)> {
    let mut remaining = pool.to_vec();
    let mut matched = Vec::with_capacity(requests.len());
    for req in requests {
        let pos = remaining
            .iter()
            .position(|a| matches!(a.refers_to_same(req, true), Ok(true)) && a.can_allocate(req))?;
        matched.push(claim(&mut remaining[pos], req, user)?);
        if !remaining[pos].is_free() {
            remaining.remove(pos);
        }
    }
    Some((matched, remaining))
}

/// Match host-bound requests: resolved ones by identity, the rest by class
///
/// Candidates are taken in pool order, so a weight-sorted pool hands out the
/// cheapest resource first.
fn match_by_class(
    requests: &[Resource],
    pool: &[Resource],
    user: UserId,
) -> Option<(Vec<Resource>, Pool)> {
    let fixed: Vec<Resource> = requests
        .iter()
        .filter(|r| r.allocation_dof() == 0)
        .cloned()
        .collect();
    let (fixed_matched, remaining) = match_exact(&fixed, pool, user)?;

    let mut by_class: BTreeMap<ResourceClass, Vec<Resource>> = BTreeMap::new();
    for res in remaining {
        by_class.entry(res.class()).or_default().push(res);
    }

    let mut fixed_matched = fixed_matched.into_iter();
    let mut result = Vec::with_capacity(requests.len());
    for req in requests {
        if req.allocation_dof() == 0 {
            result.push(fixed_matched.next()?);
            continue;
        }
        let candidates = by_class.get_mut(&req.class())?;
        let pos = candidates.iter().position(|c| c.can_allocate(req))?;
        result.push(claim(&mut candidates[pos], req, user)?);
        if !candidates[pos].is_free() {
            candidates.remove(pos);
        }
    }

    let remaining = by_class.into_values().flatten().collect();
    Some((result, remaining))
}

/// Match each filter once, by type only
fn filters_match(filters: &[Resource], pool: &[Resource]) -> bool {
    let mut unmatched: Vec<&Resource> = pool.iter().collect();
    filters.iter().all(|filter| {
        match unmatched.iter().position(|c| c.type_search_match(filter)) {
            Some(pos) => {
                unmatched.remove(pos);
                true
            }
            None => false,
        }
    })
}

/// Exclusive request for exactly `res`, free of inventory-only attributes
fn claim_template(res: &Resource) -> Resource {
    let kind = match &res.kind {
        ResourceKind::Gpu(_) => ResourceKind::Gpu(GpuAttributes::default()),
        ResourceKind::Sli(_) => ResourceKind::Sli(SliAttributes::default()),
        other => other.clone(),
    };
    let mut template = Resource::new(kind);
    template.index = res.index;
    template.host_name = res.host_name.clone();
    template.res_type = res.res_type.clone();
    template
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expander::RequestExpander;
    use vizbroker_core::{Node, NodeRequest, RequestItem};

    fn registry(nodes: Vec<Node>, resources: Vec<Resource>) -> Registry {
        Registry::new(nodes, resources).unwrap()
    }

    fn two_hosts() -> Registry {
        registry(
            vec![Node::new("a", 0), Node::new("b", 1)],
            vec![
                Resource::gpu().with_index(0).on_host("a"),
                Resource::gpu().with_index(1).on_host("a"),
                Resource::server().with_index(0).on_host("a"),
                Resource::gpu().with_index(0).on_host("b"),
                Resource::gpu().with_index(1).on_host("b"),
                Resource::server().with_index(0).on_host("b"),
            ],
        )
    }

    fn plan_for(registry: &Registry, request: &[RequestItem]) -> BrokerResult<Plan> {
        let expanded = RequestExpander::new(registry.resource_groups()).expand(request)?;
        PhasedAllocator::new(registry, &[], &[]).plan(&expanded, 1000)
    }

    fn hosts_of(plan: &Plan) -> Vec<String> {
        plan.groups
            .iter()
            .flatten()
            .map(|r| r.host_name.clone().unwrap_or_default())
            .collect()
    }

    #[test]
    fn test_fixed_resource_validation() {
        let registry = two_hosts();
        let unknown = plan_for(
            &registry,
            &[RequestItem::resource(Resource::gpu().with_index(7).on_host("a"))],
        );
        assert!(matches!(unknown, Err(BrokerError::ResourceUnknown(_))));

        let wrong_type = plan_for(
            &registry,
            &[RequestItem::resource(
                Resource::gpu().with_index(0).on_host("a").with_type("Quadro FX 5800"),
            )],
        );
        assert!(matches!(wrong_type, Err(BrokerError::MalformedRequest(_))));

        let expanded = RequestExpander::new(registry.resource_groups())
            .expand(&[RequestItem::resource(Resource::gpu().with_index(0).on_host("a"))])
            .unwrap();
        let drained = PhasedAllocator::new(&registry, &["a".to_string()], &[]).plan(&expanded, 1);
        assert!(matches!(drained, Err(BrokerError::ResourceUnavailable(_))));
        let excluded = PhasedAllocator::new(&registry, &[], &["b".to_string()]).plan(&expanded, 1);
        assert!(matches!(excluded, Err(BrokerError::ResourceUnavailable(_))));
    }

    #[test]
    fn test_busy_fixed_resource() {
        let mut registry = two_hosts();
        let key = Resource::gpu().with_index(0).on_host("a").key().unwrap();
        registry
            .get_mut(&key)
            .unwrap()
            .do_allocate(&Resource::gpu(), 7)
            .unwrap();
        let result = plan_for(
            &registry,
            &[RequestItem::resource(Resource::gpu().with_index(0).on_host("a"))],
        );
        assert!(matches!(result, Err(BrokerError::ResourceBusy(_))));
    }

    #[test]
    fn test_fixed_resources_are_not_reoffered() {
        let registry = two_hosts();
        let plan = plan_for(
            &registry,
            &[
                RequestItem::resource(Resource::gpu().with_index(0).on_host("a")),
                RequestItem::co_located(vec![Resource::gpu().on_host("a"), Resource::gpu().on_host("a")]),
            ],
        );
        // host a only has two GPUs; one is taken by the fixed request
        assert!(matches!(plan, Err(BrokerError::Unsatisfiable(_))));
    }

    #[test]
    fn test_index_bound_prefers_lowest_node() {
        let registry = two_hosts();
        let plan = plan_for(&registry, &[RequestItem::resource(Resource::gpu().with_index(1))]).unwrap();
        assert_eq!(plan.groups[0][0].host_name.as_deref(), Some("a"));
        assert_eq!(plan.groups[0][0].index, Some(1));
    }

    #[test]
    fn test_index_bound_lookahead() {
        let registry = two_hosts();
        let plan = plan_for(
            &registry,
            &[
                RequestItem::resource(Resource::gpu().with_index(0)),
                RequestItem::co_located(vec![Resource::gpu().on_host("a"), Resource::gpu().on_host("a")]),
            ],
        )
        .unwrap();
        // host a is needed in full by the host-bound group
        assert_eq!(plan.groups[0][0].host_name.as_deref(), Some("b"));
        assert_eq!(hosts_of(&plan)[1..], ["a".to_string(), "a".to_string()]);
    }

    #[test]
    fn test_host_bound_picks_cheapest() {
        let registry = two_hosts();
        let plan = plan_for(
            &registry,
            &[RequestItem::co_located(vec![Resource::server().on_host("b"), Resource::gpu()])],
        )
        .unwrap();
        let group = &plan.groups[0];
        assert_eq!(group[0].index, Some(0));
        assert_eq!(group[1].index, Some(0));
        assert!(group.iter().all(|r| r.host_name.as_deref() == Some("b")));
    }

    #[test]
    fn test_host_bound_counting_pass() {
        let registry = two_hosts();
        let too_many = plan_for(
            &registry,
            &[RequestItem::co_located(vec![
                Resource::gpu().on_host("a"),
                Resource::gpu().on_host("a"),
                Resource::gpu().on_host("a"),
            ])],
        );
        assert!(matches!(too_many, Err(BrokerError::Unsatisfiable(_))));

        let no_match = plan_for(
            &registry,
            &[RequestItem::resource(Resource::keyboard().on_host("a"))],
        );
        assert!(matches!(no_match, Err(BrokerError::Unsatisfiable(_))));

        let unknown = plan_for(&registry, &[RequestItem::resource(Resource::gpu().on_host("z"))]);
        assert!(matches!(unknown, Err(BrokerError::ResourceUnknown(_))));

        let expanded = RequestExpander::new(registry.resource_groups())
            .expand(&[RequestItem::resource(Resource::gpu().on_host("a"))])
            .unwrap();
        let drained = PhasedAllocator::new(&registry, &["a".to_string()], &[]).plan(&expanded, 1);
        assert!(matches!(drained, Err(BrokerError::ResourceUnavailable(_))));
    }

    #[test]
    fn test_host_bound_shortfall_by_type() {
        let registry = registry(
            vec![Node::new("a", 0)],
            vec![
                Resource::gpu().with_index(0).on_host("a").with_type("X"),
                Resource::gpu().with_index(1).on_host("a").with_type("Y"),
            ],
        );
        let result = plan_for(
            &registry,
            &[RequestItem::co_located(vec![
                Resource::gpu().on_host("a").with_type("X"),
                Resource::gpu().on_host("a").with_type("X"),
            ])],
        );
        assert!(matches!(result, Err(BrokerError::Unsatisfiable(_))));

        let plan = plan_for(
            &registry,
            &[RequestItem::co_located(vec![
                Resource::gpu().on_host("a").with_type("Y"),
                Resource::gpu().on_host("a").with_type("X"),
            ])],
        )
        .unwrap();
        assert_eq!(plan.groups[0][0].index, Some(1));
        assert_eq!(plan.groups[0][1].index, Some(0));
    }

    #[test]
    fn test_host_bound_shared_and_exclusive_mix() {
        let registry = registry(
            vec![Node::new("a", 0)],
            vec![
                Resource::gpu().with_index(0).on_host("a").with_share_limit(2),
                Resource::gpu().with_index(1).on_host("a").with_share_limit(2),
            ],
        );
        let result = plan_for(
            &registry,
            &[RequestItem::co_located(vec![
                Resource::gpu().on_host("a").shared(),
                Resource::gpu().on_host("a"),
                Resource::gpu().on_host("a"),
            ])],
        );
        assert!(matches!(result, Err(BrokerError::Unsatisfiable(_))));

        let plan = plan_for(
            &registry,
            &[RequestItem::co_located(vec![
                Resource::gpu().on_host("a").shared(),
                Resource::gpu().on_host("a").shared(),
                Resource::gpu().on_host("a"),
            ])],
        )
        .unwrap();
        assert_eq!(plan.groups[0].len(), 3);
        assert_eq!(plan.groups[0][0].index, plan.groups[0][1].index);
        assert_ne!(plan.groups[0][2].index, plan.groups[0][0].index);
    }

    #[test]
    fn test_node_comparator() {
        let mut heavy = Node::new("a", 0);
        heavy.weight = 5;
        let registry = registry(
            vec![heavy, Node::new("b", 1)],
            vec![
                Resource::gpu().with_index(0).on_host("a"),
                Resource::gpu().with_index(0).on_host("b"),
            ],
        );
        let plan = plan_for(&registry, &[RequestItem::resource(Resource::gpu())]).unwrap();
        assert_eq!(hosts_of(&plan), vec!["b".to_string()]);

        // equal node weights: the host with less free weight goes first
        let registry = registry_with_load();
        let plan = plan_for(&registry, &[RequestItem::resource(Resource::gpu())]).unwrap();
        assert_eq!(hosts_of(&plan), vec!["b".to_string()]);
    }

    fn registry_with_load() -> Registry {
        registry(
            vec![Node::new("a", 0), Node::new("b", 1)],
            vec![
                Resource::gpu().with_index(0).on_host("a"),
                Resource::gpu().with_index(1).on_host("a"),
                Resource::gpu().with_index(0).on_host("b"),
            ],
        )
    }

    #[test]
    fn test_largest_group_first() {
        let registry = registry(
            vec![Node::new("a", 0), Node::new("b", 1)],
            vec![
                Resource::gpu().with_index(0).on_host("a"),
                Resource::gpu().with_index(0).on_host("b"),
                Resource::gpu().with_index(1).on_host("b"),
            ],
        );
        // the pair can only fit on b; it must be placed before the single
        let plan = plan_for(
            &registry,
            &[
                RequestItem::resource(Resource::gpu()),
                RequestItem::co_located(vec![Resource::gpu(), Resource::gpu()]),
            ],
        )
        .unwrap();
        assert_eq!(plan.groups[0][0].host_name.as_deref(), Some("a"));
        assert!(plan.groups[1].iter().all(|r| r.host_name.as_deref() == Some("b")));
    }

    #[test]
    fn test_whole_node_filters() {
        let registry = two_hosts();
        let node = NodeRequest {
            host_name: None,
            filters: vec![Resource::gpu(), Resource::gpu(), Resource::server()],
        };
        let plan = plan_for(&registry, &[RequestItem::node(node)]).unwrap();
        assert_eq!(plan.groups[0].len(), 3);
        assert_eq!(plan.node_hosts.get(&0).map(String::as_str), Some("a"));

        let greedy = NodeRequest {
            host_name: None,
            filters: vec![Resource::gpu(), Resource::gpu(), Resource::gpu()],
        };
        assert!(matches!(
            plan_for(&registry, &[RequestItem::node(greedy)]),
            Err(BrokerError::Unsatisfiable(_))
        ));
    }

    #[test]
    fn test_whole_node_by_name() {
        let registry = two_hosts();
        let node = NodeRequest {
            host_name: Some("b".to_string()),
            filters: Vec::new(),
        };
        let plan = plan_for(&registry, &[RequestItem::node(node)]).unwrap();
        assert_eq!(plan.node_hosts.get(&0).map(String::as_str), Some("b"));

        let unknown = NodeRequest {
            host_name: Some("z".to_string()),
            filters: Vec::new(),
        };
        assert!(matches!(
            plan_for(&registry, &[RequestItem::node(unknown)]),
            Err(BrokerError::ResourceUnknown(_))
        ));
    }

    #[test]
    fn test_whole_node_rejects_zero_weight_use() {
        let mut registry = two_hosts();
        // shared GPU-0 is still free but the node is no longer untouched
        let key = Resource::gpu().with_index(0).on_host("a").key().unwrap();
        let gpu = registry.get_mut(&key).unwrap();
        gpu.max_share_count = 2;
        gpu.do_allocate(&Resource::gpu().shared(), 7).unwrap();

        let expanded = RequestExpander::new(registry.resource_groups())
            .expand(&[RequestItem::node(NodeRequest::default())])
            .unwrap();
        let plan = PhasedAllocator::new(&registry, &[], &["a".to_string()]).plan(&expanded, 1);
        assert!(matches!(plan, Err(BrokerError::Unsatisfiable(_))));
    }

    #[test]
    fn test_planning_is_deterministic() {
        let registry = two_hosts();
        let request = [
            RequestItem::resource(Resource::gpu()),
            RequestItem::co_located(vec![Resource::gpu(), Resource::server()]),
            RequestItem::resource(Resource::gpu().with_index(1)),
        ];
        let first = plan_for(&registry, &request).unwrap();
        for _ in 0..5 {
            assert_eq!(plan_for(&registry, &request).unwrap(), first);
        }
    }

    #[test]
    fn test_claim_template_matches_scanout_gpu() {
        let mut gpu = Resource::gpu().with_index(0).on_host("a");
        if let ResourceKind::Gpu(attrs) = &mut gpu.kind {
            attrs.use_scan_out = Some(true);
        }
        // no scanout caps: the inventory entry does not match itself
        assert!(!gpu.can_allocate(&gpu.clone()));
        assert!(gpu.can_allocate(&claim_template(&gpu)));
    }
}
