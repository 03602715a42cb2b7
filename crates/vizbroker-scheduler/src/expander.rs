//! Request normalization
//!
//! Flattens a client request into a list of co-location groups, remembers how
//! to put the grant back into the request's shape, and classifies each group
//! by its degrees of freedom.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use vizbroker_core::{
    BrokerError, BrokerResult, NodeRequest, RequestEntry, RequestItem, Resource, ResourceGroup,
    ResourceKey,
};

/// One unit of matching work
#[derive(Debug, Clone, PartialEq)]
pub enum ExpandedGroup {
    /// Resources that must end up on the same host
    Resources(Vec<Resource>),
    /// A whole, untouched node
    Node(NodeRequest),
}

impl ExpandedGroup {
    /// Number of members, used for largest-first ordering
    pub fn len(&self) -> usize {
        match self {
            ExpandedGroup::Resources(members) => members.len(),
            ExpandedGroup::Node(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Highest DOF among the members; whole nodes always report 3
    pub fn max_dof(&self) -> u8 {
        match self {
            ExpandedGroup::Resources(members) => members
                .iter()
                .map(Resource::allocation_dof)
                .max()
                .unwrap_or(0),
            ExpandedGroup::Node(_) => 3,
        }
    }
}

/// Where the groups of one request item went
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    Resource(usize),
    CoLocated(usize),
    /// Aggregate; `template` carries the group's metadata without a layout
    Group {
        template: ResourceGroup,
        groups: Range<usize>,
    },
    Node(usize),
}

/// How often a fully resolved resource is referenced in one request
#[derive(Debug, Clone, PartialEq)]
pub struct FixedUsage {
    /// First reference, used for type and mode checks
    pub template: Resource,
    pub count: usize,
    pub shared_count: usize,
}

/// Output of [`RequestExpander::expand`]
#[derive(Debug, Clone, PartialEq)]
pub struct ExpandedRequest {
    pub groups: Vec<ExpandedGroup>,
    pub slots: Vec<Slot>,
    /// Group indices by maximum DOF
    pub buckets: [Vec<usize>; 4],
    pub fixed: BTreeMap<ResourceKey, FixedUsage>,
}

/// Turns request items into [`ExpandedRequest`]s
pub struct RequestExpander<'a> {
    named_groups: &'a BTreeMap<String, ResourceGroup>,
}

impl<'a> RequestExpander<'a> {
    /// `named_groups` resolves aggregates that are requested by name only
    pub fn new(named_groups: &'a BTreeMap<String, ResourceGroup>) -> Self {
        Self { named_groups }
    }

    pub fn expand(&self, request: &[RequestItem]) -> BrokerResult<ExpandedRequest> {
        if request.is_empty() {
            return Err(BrokerError::MalformedRequest(
                "nothing to allocate".to_string(),
            ));
        }

        let mut groups = Vec::new();
        let mut slots = Vec::with_capacity(request.len());

        for item in request {
            let slot = match item {
                RequestItem::One(entry) => self.push_entry(entry, &mut groups)?,
                RequestItem::CoLocated(entries) => match entries.as_slice() {
                    [] => {
                        return Err(BrokerError::MalformedRequest(
                            "empty co-location list".to_string(),
                        ))
                    }
                    [single @ (RequestEntry::Group(_) | RequestEntry::Node(_))] => {
                        self.push_entry(single, &mut groups)?
                    }
                    _ => {
                        let mut members = Vec::with_capacity(entries.len());
                        for entry in entries {
                            match entry {
                                RequestEntry::Resource(res) => {
                                    check_template(res)?;
                                    members.push(res.clone());
                                }
                                _ => {
                                    return Err(BrokerError::MalformedRequest(
                                        "a resource group or node must appear alone in its slot"
                                            .to_string(),
                                    ))
                                }
                            }
                        }
                        groups.push(ExpandedGroup::Resources(members));
                        Slot::CoLocated(groups.len() - 1)
                    }
                },
            };
            slots.push(slot);
        }

        let mut buckets: [Vec<usize>; 4] = Default::default();
        let mut fixed: BTreeMap<ResourceKey, FixedUsage> = BTreeMap::new();

        for (index, group) in groups.iter_mut().enumerate() {
            if let ExpandedGroup::Resources(members) = group {
                propagate_host(members)?;
                for res in members.iter() {
                    let Some(key) = res.key() else { continue };
                    let usage = fixed.entry(key).or_insert_with(|| FixedUsage {
                        template: res.clone(),
                        count: 0,
                        shared_count: 0,
                    });
                    usage.count += 1;
                    if res.is_shared() {
                        usage.shared_count += 1;
                    }
                }
            }
            buckets[usize::from(group.max_dof())].push(index);
        }

        let conflicts: Vec<String> = fixed
            .iter()
            .filter(|(_, u)| u.count > 1 && u.count != u.shared_count)
            .map(|(key, u)| format!("{} used {} times, {} shared", key, u.count, u.shared_count))
            .collect();
        if !conflicts.is_empty() {
            return Err(BrokerError::MalformedRequest(format!(
                "resources requested more than once or both shared and unshared: {}",
                conflicts.join(", ")
            )));
        }

        Ok(ExpandedRequest {
            groups,
            slots,
            buckets,
            fixed,
        })
    }

    fn push_entry(&self, entry: &RequestEntry, groups: &mut Vec<ExpandedGroup>) -> BrokerResult<Slot> {
        match entry {
            RequestEntry::Resource(res) => {
                check_template(res)?;
                groups.push(ExpandedGroup::Resources(vec![res.clone()]));
                Ok(Slot::Resource(groups.len() - 1))
            }
            RequestEntry::Group(group) => {
                let template = self.resolve_group(group)?;
                let start = groups.len();
                for inner in &template.layout {
                    if inner.is_empty() {
                        return Err(BrokerError::MalformedRequest(format!(
                            "resource group {} has an empty layout entry",
                            group_label(&template)
                        )));
                    }
                    for res in inner {
                        check_template(res)?;
                    }
                    groups.push(ExpandedGroup::Resources(inner.clone()));
                }
                Ok(Slot::Group {
                    template: ResourceGroup {
                        layout: Vec::new(),
                        ..template
                    },
                    groups: start..groups.len(),
                })
            }
            RequestEntry::Node(node) => {
                for filter in &node.filters {
                    check_template(filter)?;
                }
                groups.push(ExpandedGroup::Node(node.clone()));
                Ok(Slot::Node(groups.len() - 1))
            }
        }
    }

    /// Fill in a group requested by name from the configured layouts
    fn resolve_group(&self, group: &ResourceGroup) -> BrokerResult<ResourceGroup> {
        let mut resolved = group.clone();
        if resolved.layout.is_empty() {
            let name = group.name.as_deref().ok_or_else(|| {
                BrokerError::MalformedRequest("resource group has neither name nor layout".to_string())
            })?;
            let known = self.named_groups.get(name).ok_or_else(|| {
                BrokerError::ResourceUnknown(format!("no resource group named '{}'", name))
            })?;
            resolved.layout = known.layout.clone();
            if resolved.handler.is_none() {
                resolved.handler = known.handler.clone();
            }
            if resolved.description.is_none() {
                resolved.description = known.description.clone();
            }
        }
        if resolved.layout.is_empty() {
            return Err(BrokerError::MalformedRequest(format!(
                "resource group {} has an empty layout",
                group_label(&resolved)
            )));
        }
        Ok(resolved)
    }
}

fn group_label(group: &ResourceGroup) -> String {
    match &group.name {
        Some(name) => format!("'{}'", name),
        None => "<unnamed>".to_string(),
    }
}

/// Request templates describe what is wanted, never who holds it
fn check_template(res: &Resource) -> BrokerResult<()> {
    if !res.owners.is_empty() {
        return Err(BrokerError::MalformedRequest(format!(
            "{} must not list owners",
            res
        )));
    }
    Ok(())
}

/// Paste a group's single host name onto every member
fn propagate_host(members: &mut [Resource]) -> BrokerResult<()> {
    let hosts: BTreeSet<&str> = members
        .iter()
        .filter_map(|r| r.host_name.as_deref())
        .collect();

    if hosts.len() > 1 {
        if members.iter().any(|r| r.allocation_dof() != 0) {
            return Err(BrokerError::MalformedRequest(
                "resources in a multi-host group must all be fully resolved".to_string(),
            ));
        }
        return Ok(());
    }

    let single = hosts.into_iter().next().map(str::to_string);
    if let Some(host) = single {
        for res in members.iter_mut() {
            res.host_name = Some(host.clone());
        }
    }
    Ok(())
}
