//! Observed state and request bodies exchanged with the control plane.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::spec::{DiskTemplate, Hypervisor};

/// NIC parameters keyed by their RAPI name (`mode`, `link`, `mac`...).
pub type NicParams = BTreeMap<String, String>;

/// Why an instance is down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Admin,
    Error,
}

/// Power state of an existing instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceStatus {
    Running,
    Stopped(StopReason),
    /// Any other Ganeti status (`ERROR_up`, `ERROR_nodedown`, `USER_down`...).
    Transitional(String),
}

impl InstanceStatus {
    pub fn is_stopped(&self) -> bool {
        matches!(self, InstanceStatus::Stopped(_))
    }
}

impl From<&str> for InstanceStatus {
    fn from(s: &str) -> Self {
        match s {
            "running" => InstanceStatus::Running,
            "ADMIN_down" => InstanceStatus::Stopped(StopReason::Admin),
            "ERROR_down" => InstanceStatus::Stopped(StopReason::Error),
            other => InstanceStatus::Transitional(other.to_string()),
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceStatus::Running => f.write_str("running"),
            InstanceStatus::Stopped(StopReason::Admin) => f.write_str("ADMIN_down"),
            InstanceStatus::Stopped(StopReason::Error) => f.write_str("ERROR_down"),
            InstanceStatus::Transitional(s) => f.write_str(s),
        }
    }
}

/// Backend sizing as currently applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservedBeParams {
    pub vcpus: Option<u32>,
    pub minmem: Option<u64>,
    pub maxmem: Option<u64>,
}

/// An instance as reported by the cluster.
#[derive(Debug, Clone)]
pub struct ObservedInstance {
    pub name: String,
    pub status: InstanceStatus,
    pub beparams: ObservedBeParams,
    /// Disk sizes in MB, by position. Position is the only disk identity.
    pub disk_sizes: Vec<u64>,
    /// Custom NIC parameters, by position.
    pub nics: Vec<NicParams>,
    pub tags: Vec<String>,
    pub pnode: String,
    pub snodes: Vec<String>,
}

/// Node group and its member nodes.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupInfo {
    pub name: String,
    #[serde(default)]
    pub node_list: Vec<String>,
}

/// Backend parameters in a request; unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BeParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vcpus: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minmem: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maxmem: Option<u64>,
}

impl BeParams {
    /// Pin memory, minmem and maxmem to the same value.
    pub fn set_memory(&mut self, mb: u64) {
        self.memory = Some(mb);
        self.minmem = Some(mb);
        self.maxmem = Some(mb);
    }

    pub fn is_empty(&self) -> bool {
        *self == BeParams::default()
    }
}

/// Parameters of one disk in a create or add request.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiskParams {
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Body of `POST /2/instances`.
#[derive(Debug, Clone, Serialize)]
pub struct CreateInstanceRequest {
    #[serde(rename = "__version__")]
    pub version: u32,
    pub mode: String,
    pub name: String,
    #[serde(skip_serializing_if = "BeParams::is_empty")]
    pub beparams: BeParams,
    pub disk_template: DiskTemplate,
    pub hypervisor: Hypervisor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iallocator: Option<String>,
    pub os_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pnode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snode: Option<String>,
    pub conflicts_check: bool,
    pub ip_check: bool,
    pub name_check: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_install: Option<bool>,
    pub wait_for_sync: bool,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<DiskParams>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub nics: Vec<NicParams>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub osparams: BTreeMap<String, Value>,
}

/// Kind of a positional NIC or disk modification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModOp {
    Add,
    Modify,
    Remove,
}

/// Body of `PUT /2/instances/{name}/modify`.
///
/// NIC and disk changes serialize as `[op, index, params]` triples.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ModifyInstanceRequest {
    #[serde(skip_serializing_if = "BeParams::is_empty")]
    pub beparams: BeParams,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub nics: Vec<(ModOp, usize, NicParams)>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<(ModOp, usize, DiskParams)>,
    pub conflicts_check: bool,
    pub wait_for_sync: bool,
}

impl ModifyInstanceRequest {
    /// True when the request would not change anything.
    pub fn is_noop(&self) -> bool {
        self.beparams.is_empty() && self.nics.is_empty() && self.disks.is_empty()
    }
}

/// Body of `PUT /2/instances/{name}/rename`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenameInstanceRequest {
    pub new_name: String,
    pub ip_check: bool,
    pub name_check: bool,
}

/// Body of `POST /2/instances/{name}/disk/{index}/grow`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GrowDiskRequest {
    #[serde(skip)]
    pub index: usize,
    /// MB to add to the current size.
    pub amount: u64,
    pub absolute: bool,
    pub wait_for_sync: bool,
}
