//! Resource capability model
//!
//! Every allocatable unit (GPU, X server, keyboard, mouse, SLI bridge) is a
//! [`Resource`]. The same type is used for inventory entries held by the
//! registry and for the partially specified templates that clients send in a
//! request: any of `index`, `host_name` and `type` may be left out, and the
//! allocator fills them in.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{BrokerError, BrokerResult};

/// Numeric user id of a resource owner
pub type UserId = u32;

/// Numeric group id of the requesting user
pub type GroupId = u32;

/// Kinds of resources the broker knows how to match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceClass {
    Gpu,
    Server,
    Keyboard,
    Mouse,
    Sli,
}

impl ResourceClass {
    /// All classes, in the order the class matcher walks them
    pub const ALL: [ResourceClass; 5] = [
        ResourceClass::Gpu,
        ResourceClass::Server,
        ResourceClass::Keyboard,
        ResourceClass::Mouse,
        ResourceClass::Sli,
    ];

    /// Whether work can be launched on a resource of this class
    pub fn is_schedulable(self) -> bool {
        matches!(self, ResourceClass::Gpu)
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceClass::Gpu => write!(f, "GPU"),
            ResourceClass::Server => write!(f, "Server"),
            ResourceClass::Keyboard => write!(f, "Keyboard"),
            ResourceClass::Mouse => write!(f, "Mouse"),
            ResourceClass::Sli => write!(f, "SLI"),
        }
    }
}

/// Identity of a completely resolvable resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub class: ResourceClass,
    pub index: u32,
    pub host_name: String,
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{} at host {}", self.class, self.index, self.host_name)
    }
}

/// GPU specific attributes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuAttributes {
    /// PCI bus id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bus_id: Option<String>,
    /// On inventory: whether scanout is enabled. On a request: `Some(true)`
    /// wants a scanout capable GPU, `Some(false)` wants one without scanout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_scan_out: Option<bool>,
    /// Scanout ports the GPU model provides
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scanout_caps: Vec<String>,
    /// Scanout ports with a display device configured
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scanouts: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_stereo: Option<bool>,
}

/// SLI bridge attributes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu0: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu1: Option<u32>,
}

/// Per-class part of a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "lowercase")]
pub enum ResourceKind {
    Gpu(GpuAttributes),
    Server,
    Keyboard,
    Mouse,
    Sli(SliAttributes),
}

impl ResourceKind {
    pub fn class(&self) -> ResourceClass {
        match self {
            ResourceKind::Gpu(_) => ResourceClass::Gpu,
            ResourceKind::Server => ResourceClass::Server,
            ResourceKind::Keyboard => ResourceClass::Keyboard,
            ResourceKind::Mouse => ResourceClass::Mouse,
            ResourceKind::Sli(_) => ResourceClass::Sli,
        }
    }
}

/// Server type for a regular X server
pub const NORMAL_SERVER: &str = "normal";
/// Server type for a virtual (GPU-less framebuffer) X server
pub const VIRTUAL_SERVER: &str = "virtual";
/// Valid SLI bridge types
pub const SLI_TYPES: [&str; 2] = ["discrete", "quadroplex"];

fn default_share_limit() -> u32 {
    1
}

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

/// A resource, either an inventory entry or a request template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(flatten)]
    pub kind: ResourceKind,
    /// Position within the host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_name: Option<String>,
    /// Model or flavour, e.g. "Quadro FX 5800" or "virtual"
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub res_type: Option<String>,
    /// Current owners; one entry per share
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owners: Vec<UserId>,
    #[serde(default = "default_share_limit", rename = "share_limit")]
    pub max_share_count: u32,
    /// On inventory: allocated for shared access. On a request: wants shared access.
    #[serde(default, skip_serializing_if = "is_false")]
    pub shared: bool,
    #[serde(default, rename = "bias", skip_serializing_if = "is_zero")]
    pub allocation_bias: i64,
}

impl Resource {
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            index: None,
            host_name: None,
            res_type: None,
            owners: Vec::new(),
            max_share_count: 1,
            shared: false,
            allocation_bias: 0,
        }
    }

    pub fn gpu() -> Self {
        Self::new(ResourceKind::Gpu(GpuAttributes::default()))
    }

    pub fn server() -> Self {
        Self::new(ResourceKind::Server)
    }

    pub fn keyboard() -> Self {
        Self::new(ResourceKind::Keyboard)
    }

    pub fn mouse() -> Self {
        Self::new(ResourceKind::Mouse)
    }

    pub fn sli() -> Self {
        Self::new(ResourceKind::Sli(SliAttributes::default()))
    }

    pub fn with_index(mut self, index: u32) -> Self {
        self.index = Some(index);
        self
    }

    pub fn on_host(mut self, host_name: impl Into<String>) -> Self {
        self.host_name = Some(host_name.into());
        self
    }

    pub fn with_type(mut self, res_type: impl Into<String>) -> Self {
        self.res_type = Some(res_type.into());
        self
    }

    pub fn with_share_limit(mut self, limit: u32) -> Self {
        self.max_share_count = limit;
        self
    }

    pub fn with_bias(mut self, bias: i64) -> Self {
        self.allocation_bias = bias;
        self
    }

    /// Mark a request template as asking for shared access
    pub fn shared(mut self) -> Self {
        self.shared = true;
        self
    }

    pub fn class(&self) -> ResourceClass {
        self.kind.class()
    }

    pub fn gpu_attributes(&self) -> Option<&GpuAttributes> {
        match &self.kind {
            ResourceKind::Gpu(attrs) => Some(attrs),
            _ => None,
        }
    }

    /// Both index and host name are known
    pub fn is_completely_resolvable(&self) -> bool {
        self.index.is_some() && self.host_name.is_some()
    }

    /// Identity key; only defined for completely resolvable resources
    pub fn key(&self) -> Option<ResourceKey> {
        match (self.index, &self.host_name) {
            (Some(index), Some(host_name)) => Some(ResourceKey {
                class: self.class(),
                index,
                host_name: host_name.clone(),
            }),
            _ => None,
        }
    }

    /// Degrees of freedom left to the allocator
    ///
    /// 0 if both host name and index are bound, 1 if only the index is bound,
    /// 2 if only the host name is bound, 3 if neither is.
    pub fn allocation_dof(&self) -> u8 {
        match (self.index.is_some(), self.host_name.is_some()) {
            (true, true) => 0,
            (true, false) => 1,
            (false, true) => 2,
            (false, false) => 3,
        }
    }

    pub fn is_sharable(&self) -> bool {
        self.max_share_count > 1
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn is_exclusive(&self) -> bool {
        !self.shared
    }

    /// Number of owners this resource can hold in its current mode
    pub fn capacity(&self) -> u32 {
        if self.shared {
            self.max_share_count
        } else {
            1
        }
    }

    pub fn is_free(&self) -> bool {
        (self.owners.len() as u32) < self.capacity()
    }

    /// Structural search match: every field `other` specifies must equal ours
    pub fn type_search_match(&self, other: &Resource) -> bool {
        if other.class() != self.class() {
            return false;
        }
        if other.index.is_some() && other.index != self.index {
            return false;
        }
        if other.res_type.is_some() && other.res_type != self.res_type {
            return false;
        }
        if other.host_name.is_some() && other.host_name != self.host_name {
            return false;
        }
        if other.shared && !self.is_sharable() {
            return false;
        }

        if let (ResourceKind::Gpu(mine), ResourceKind::Gpu(wanted)) = (&self.kind, &other.kind) {
            let scanout_capable = !mine.scanout_caps.is_empty();
            match wanted.use_scan_out {
                Some(true) => return scanout_capable && mine.use_scan_out == Some(true),
                Some(false) => return !scanout_capable || mine.use_scan_out == Some(false),
                None => {}
            }
            if mine.allow_stereo == Some(false) && wanted.allow_stereo == Some(true) {
                return false;
            }
        }

        true
    }

    /// Whether `request` can be carved out of this resource right now
    pub fn can_allocate(&self, request: &Resource) -> bool {
        self.type_search_match(request)
            && self.is_free()
            && !(request.shared && !self.is_sharable())
            && !(self.shared && !request.shared)
    }

    /// Record `user` as an owner for `request`
    pub fn do_allocate(&mut self, request: &Resource, user: UserId) -> BrokerResult<()> {
        if !self.can_allocate(request) {
            return Err(BrokerError::ResourceBusy(format!(
                "{} cannot be allocated for {}",
                self, request
            )));
        }
        self.owners.push(user);
        if request.shared && self.max_share_count > 1 {
            self.shared = true;
        }
        Ok(())
    }

    /// Drop one ownership entry of `user`
    pub fn deallocate(&mut self, user: UserId) -> BrokerResult<()> {
        let pos = self.owners.iter().position(|o| *o == user).ok_or_else(|| {
            BrokerError::AccessDenied(format!("user {} does not own {}", user, self))
        })?;
        self.owners.remove(pos);
        if self.owners.is_empty() {
            self.shared = false;
        }
        Ok(())
    }

    /// Identity comparison on (class, index, host name)
    ///
    /// Comparing resources of different classes is an error unless
    /// `allow_cross_class` is set, in which case they simply differ.
    pub fn refers_to_same(&self, other: &Resource, allow_cross_class: bool) -> BrokerResult<bool> {
        if other.class() != self.class() {
            if allow_cross_class {
                return Ok(false);
            }
            return Err(BrokerError::Internal(format!(
                "cannot compare {} with {}",
                self.class(),
                other.class()
            )));
        }
        Ok(self.index == other.index && self.host_name == other.host_name)
    }

    /// Tie-break weight; lower weights are consumed first
    pub fn allocation_weight(&self) -> i64 {
        let mut weight = self.allocation_bias + self.index.map(i64::from).unwrap_or(0);
        match &self.kind {
            ResourceKind::Gpu(attrs) => {
                if attrs.use_scan_out == Some(true) {
                    weight += 100 * attrs.scanout_caps.len() as i64;
                    weight += 100 * attrs.scanouts.len() as i64;
                }
                if self.shared {
                    weight -= i64::from(self.max_share_count) - self.owners.len() as i64;
                }
            }
            ResourceKind::Server => {
                // keeps the node's primary server free as long as possible
                if self.index == Some(0) {
                    weight += 10000;
                }
            }
            _ => {}
        }
        weight
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}-", self.class())?;
        match self.index {
            Some(index) => write!(f, "{}", index)?,
            None => write!(f, "?")?,
        }
        match &self.host_name {
            Some(host) => write!(f, " at host {}", host)?,
            None => write!(f, " at host ?")?,
        }
        if let Some(res_type) = &self.res_type {
            write!(f, " type {}", res_type)?;
        }
        if self.shared {
            write!(f, " shared")?;
        }
        write!(f, ">")
    }
}
