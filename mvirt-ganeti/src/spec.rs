//! Desired-state document for a Ganeti instance.
//!
//! Disks and NICs are ordered lists: Ganeti addresses them by position only,
//! so the index of an entry here is matched against the same index on the
//! cluster. Reordering entries is therefore a change of every moved entry,
//! not a no-op.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::clients::{DiskParams, NicParams};
use crate::error::{Error, Result};

/// MAC value asking Ganeti to generate an address.
pub const MAC_GENERATE: &str = "generate";

/// OS used when the document does not name one.
pub const DEFAULT_OS_TYPE: &str = "debootstrap+default";

const NIC_KEYS: [&str; 8] = [
    "bridge", "name", "ip", "vlan", "mac", "link", "mode", "network",
];

/// Lifecycle state the instance should end up in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    #[default]
    Present,
    Absent,
    Started,
    Stopped,
    Restarted,
    Migrated,
}

impl fmt::Display for DesiredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DesiredState::Present => "present",
            DesiredState::Absent => "absent",
            DesiredState::Started => "started",
            DesiredState::Stopped => "stopped",
            DesiredState::Restarted => "restarted",
            DesiredState::Migrated => "migrated",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskTemplate {
    Sharedfile,
    Diskless,
    #[default]
    Plain,
    Gluster,
    Blockdev,
    Drbd,
    Ext,
    File,
    Rbd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Hypervisor {
    Chroot,
    XenPvm,
    #[default]
    Kvm,
    XenHvm,
    Lxc,
    Fake,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NicMode {
    Routed,
    Bridged,
    Openvswitch,
}

impl NicMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NicMode::Routed => "routed",
            NicMode::Bridged => "bridged",
            NicMode::Openvswitch => "openvswitch",
        }
    }
}

impl FromStr for NicMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "routed" => Ok(NicMode::Routed),
            "bridged" => Ok(NicMode::Bridged),
            "openvswitch" => Ok(NicMode::Openvswitch),
            other => Err(format!("Invalid mode for nic {}", other)),
        }
    }
}

/// Disk size in megabytes.
///
/// Accepts a plain integer (megabytes) or a string with an `M`, `G` or `T`
/// suffix such as `"10G"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct DiskSize(pub u64);

impl FromStr for DiskSize {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        let (digits, factor) = match s.char_indices().last() {
            Some((i, 'M' | 'm')) => (&s[..i], 1),
            Some((i, 'G' | 'g')) => (&s[..i], 1024),
            Some((i, 'T' | 't')) => (&s[..i], 1024 * 1024),
            _ => (s, 1),
        };
        digits
            .trim()
            .parse::<u64>()
            .ok()
            .and_then(|value| value.checked_mul(factor))
            .map(DiskSize)
            .ok_or_else(|| format!("invalid disk size: {}", s))
    }
}

impl<'de> Deserialize<'de> for DiskSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Int(mb) => Ok(DiskSize(mb)),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Accept `vlan: 100` as well as `vlan: "100"`.
fn string_or_int<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Text(String),
    }

    Ok(Option::<Raw>::deserialize(deserializer)?.map(|raw| match raw {
        Raw::Int(i) => i.to_string(),
        Raw::Text(s) => s,
    }))
}

/// One desired disk, matched by position.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiskSpec {
    pub size: Option<DiskSize>,
    pub mode: Option<String>,
    pub name: Option<String>,
    pub provider: Option<String>,
    /// ExtStorage parameters; only legal with the `ext` disk template.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl DiskSpec {
    pub fn with_size(mb: u64) -> Self {
        Self {
            size: Some(DiskSize(mb)),
            ..Default::default()
        }
    }

    /// Size in MB. Only meaningful after [`InstanceSpec::validate`].
    pub fn size_mb(&self) -> u64 {
        self.size.map(|s| s.0).unwrap_or(0)
    }

    pub fn to_params(&self) -> DiskParams {
        DiskParams {
            size: self.size_mb(),
            mode: self.mode.clone(),
            name: self.name.clone(),
            provider: self.provider.clone(),
            extra: self.extra.clone(),
        }
    }
}

/// One desired NIC, matched by position.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NicSpec {
    pub mode: Option<String>,
    pub bridge: Option<String>,
    pub name: Option<String>,
    pub ip: Option<String>,
    #[serde(default, deserialize_with = "string_or_int")]
    pub vlan: Option<String>,
    pub mac: Option<String>,
    pub link: Option<String>,
    pub network: Option<String>,
    /// Anything else; rejected by validation.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl NicSpec {
    pub fn new(mode: NicMode) -> Self {
        Self {
            mode: Some(mode.as_str().to_string()),
            ..Default::default()
        }
    }

    pub fn with_link(mut self, link: &str) -> Self {
        self.link = Some(link.to_string());
        self
    }

    /// Parameters as sent to Ganeti, keyed by RAPI name.
    pub fn to_params(&self) -> NicParams {
        let fields = [
            ("bridge", &self.bridge),
            ("name", &self.name),
            ("ip", &self.ip),
            ("vlan", &self.vlan),
            ("mac", &self.mac),
            ("link", &self.link),
            ("mode", &self.mode),
            ("network", &self.network),
        ];
        fields
            .into_iter()
            .filter_map(|(key, value)| value.as_ref().map(|v| (key.to_string(), v.clone())))
            .collect()
    }
}

fn default_true() -> bool {
    true
}

fn default_iallocator() -> Option<String> {
    Some("hail".to_string())
}

/// Desired configuration of one instance.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceSpec {
    #[serde(alias = "instance_name")]
    pub name: String,
    #[serde(default)]
    pub state: DesiredState,
    pub new_name: Option<String>,

    /// Memory in MB; sets memory, minmem and maxmem alike.
    pub memory: Option<u64>,
    pub vcpus: Option<u32>,

    #[serde(default)]
    pub disk_template: DiskTemplate,
    /// `None` leaves the disk family unmanaged.
    pub disks: Option<Vec<DiskSpec>>,
    /// `None` leaves the NIC family unmanaged.
    pub nics: Option<Vec<NicSpec>>,

    #[serde(default)]
    pub hypervisor: Hypervisor,
    #[serde(default = "default_iallocator")]
    pub iallocator: Option<String>,
    pub os_type: Option<String>,
    #[serde(default)]
    pub osparams: BTreeMap<String, Value>,
    pub pnode: Option<String>,
    pub snode: Option<String>,

    #[serde(default = "default_true")]
    pub conflicts_check: bool,
    #[serde(default = "default_true")]
    pub ip_check: bool,
    #[serde(default = "default_true")]
    pub name_check: bool,
    pub no_install: Option<bool>,
    #[serde(default = "default_true")]
    pub wait_for_sync: bool,

    /// Always managed: an omitted list removes every tag on the instance.
    #[serde(default)]
    pub tags: Vec<String>,
    pub group_name: Option<String>,
}

impl InstanceSpec {
    /// Minimal document for `name` with every default applied.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: DesiredState::default(),
            new_name: None,
            memory: None,
            vcpus: None,
            disk_template: DiskTemplate::default(),
            disks: None,
            nics: None,
            hypervisor: Hypervisor::default(),
            iallocator: default_iallocator(),
            os_type: None,
            osparams: BTreeMap::new(),
            pnode: None,
            snode: None,
            conflicts_check: true,
            ip_check: true,
            name_check: true,
            no_install: None,
            wait_for_sync: true,
            tags: Vec::new(),
            group_name: None,
        }
    }

    /// Check everything that can be checked without the cluster.
    pub fn validate(&self) -> Result<()> {
        let name = self.name.as_str();
        if name.trim().is_empty() {
            return Err(Error::configuration(name, "instance name must not be empty"));
        }
        if let Some(new_name) = &self.new_name {
            if new_name.trim().is_empty() {
                return Err(Error::configuration(name, "new_name must not be empty"));
            }
        }
        if self.memory == Some(0) {
            return Err(Error::configuration(name, "memory must be a positive number of MB"));
        }
        if self.vcpus == Some(0) {
            return Err(Error::configuration(name, "vcpus must be positive"));
        }
        if self.snode.is_some() && self.pnode.is_none() {
            return Err(Error::configuration(name, "snode requires pnode to be set"));
        }

        for (i, disk) in self.disks.iter().flatten().enumerate() {
            if disk.size.is_none() {
                return Err(Error::configuration(
                    name,
                    format!("No \"size\" given for disk {}", i),
                ));
            }
            if self.disk_template != DiskTemplate::Ext {
                if let Some(key) = disk.extra.keys().next() {
                    return Err(Error::configuration(
                        name,
                        format!("Invalid disk parameter for disk {}: {} is not a valid key", i, key),
                    ));
                }
            }
        }

        for (i, nic) in self.nics.iter().flatten().enumerate() {
            if let Some(key) = nic.extra.keys().next() {
                return Err(Error::configuration(
                    name,
                    format!(
                        "Invalid nic parameter for nic {}: {} is not a valid key (expected one of {})",
                        i,
                        key,
                        NIC_KEYS.join(", ")
                    ),
                ));
            }
            match nic.mode.as_deref() {
                None => {
                    return Err(Error::configuration(name, format!("No \"mode\" given for nic {}", i)));
                }
                Some(mode) => {
                    mode.parse::<NicMode>().map_err(|e| Error::configuration(name, e))?;
                }
            }
        }

        self.flat_osparams()?;
        Ok(())
    }

    /// osparams as flat scalar pairs; Ganeti rejects nested values.
    pub fn flat_osparams(&self) -> Result<BTreeMap<String, Value>> {
        for (key, value) in &self.osparams {
            if value.is_object() || value.is_array() {
                return Err(Error::configuration(
                    &self.name,
                    format!("Got complex type for osparams key {}", key),
                ));
            }
        }
        Ok(self.osparams.clone())
    }

    pub fn os_type_or_default(&self) -> &str {
        self.os_type.as_deref().unwrap_or(DEFAULT_OS_TYPE)
    }
}
