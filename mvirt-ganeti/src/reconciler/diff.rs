//! Desired vs. observed comparison, one attribute family at a time.
//!
//! Everything here is pure. Disks and NICs are compared by position because
//! Ganeti returns no stable identity for them; entry `i` of the document is
//! always compared with entry `i` on the cluster.

use std::collections::BTreeSet;
use std::fmt;

use crate::clients::{DiskParams, NicParams, ObservedInstance};
use crate::spec::{DiskSpec, InstanceSpec, NicSpec, MAC_GENERATE};

/// Sizing fields that differ. Never hot-applicable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SizingDelta {
    pub vcpus: Option<u32>,
    pub memory_mb: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DiskChange {
    /// New trailing disk.
    Add { index: usize, params: DiskParams },
    /// Disk must grow from `current_mb` to `target_mb`.
    Grow {
        index: usize,
        current_mb: u64,
        target_mb: u64,
    },
    /// Desired size is below the current one; Ganeti cannot shrink disks.
    Unsupported {
        index: usize,
        current_mb: u64,
        target_mb: u64,
    },
}

impl DiskChange {
    pub fn index(&self) -> usize {
        match self {
            DiskChange::Add { index, .. }
            | DiskChange::Grow { index, .. }
            | DiskChange::Unsupported { index, .. } => *index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NicChange {
    Add { index: usize, params: NicParams },
    /// Only the keys that differ.
    Modify { index: usize, params: NicParams },
    Remove { index: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagDelta {
    pub to_add: BTreeSet<String>,
    pub to_remove: BTreeSet<String>,
}

impl TagDelta {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Node group(s) that list the primary node as a member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupMembership {
    Member(String),
    Unassigned,
    Ambiguous(Vec<String>),
}

impl GroupMembership {
    pub fn from_groups(groups: Vec<String>) -> Self {
        match groups.len() {
            0 => GroupMembership::Unassigned,
            1 => GroupMembership::Member(groups.into_iter().next().unwrap_or_default()),
            _ => GroupMembership::Ambiguous(groups),
        }
    }
}

/// A difference that cannot be applied through RAPI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    DiskShrink {
        index: usize,
        current_mb: u64,
        target_mb: u64,
    },
    DiskRemoval { desired: usize, observed: usize },
    NicRemoval { count: usize },
    GroupMismatch {
        instance: String,
        desired: String,
        actual: String,
    },
    GroupUnresolved {
        node: String,
        membership: GroupMembership,
    },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::DiskShrink {
                index,
                current_mb,
                target_mb,
            } => write!(
                f,
                "Reducing a disks size is not supported (disk {}: {} MB -> {} MB)",
                index, current_mb, target_mb
            ),
            Violation::DiskRemoval { desired, observed } => write!(
                f,
                "Removing disks is not implemented ({} disks present, {} requested)",
                observed, desired
            ),
            Violation::NicRemoval { count } => write!(
                f,
                "Ganeti is not able to remove more than 1 NIC at a time ({} requested)",
                count
            ),
            Violation::GroupMismatch {
                instance,
                desired,
                actual,
            } => write!(
                f,
                "Modifying the node group is not supported by the ganeti RAPI (current group {}). \
                 Run `gnt-instance change-group --to={} {}` and retry",
                actual, desired, instance
            ),
            Violation::GroupUnresolved { node, membership } => match membership {
                GroupMembership::Ambiguous(groups) => write!(
                    f,
                    "primary node {} is listed in several node groups: {}",
                    node,
                    groups.join(", ")
                ),
                _ => write!(f, "primary node {} is not a member of any node group", node),
            },
        }
    }
}

/// Everything that differs between the document and the cluster.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceDelta {
    pub sizing: Option<SizingDelta>,
    pub disks: Vec<DiskChange>,
    pub nics: Vec<NicChange>,
    pub tags: TagDelta,
    pub violations: Vec<Violation>,
}

impl InstanceDelta {
    pub fn is_empty(&self) -> bool {
        self.sizing.is_none()
            && self.disks.is_empty()
            && self.nics.is_empty()
            && self.tags.is_empty()
            && self.violations.is_empty()
    }

    /// Sizing and disk changes only take effect after a restart.
    pub fn reboot_required(&self) -> bool {
        self.sizing.is_some()
            || self
                .disks
                .iter()
                .any(|d| matches!(d, DiskChange::Add { .. } | DiskChange::Grow { .. }))
    }
}

pub fn diff_sizing(desired: &InstanceSpec, observed: &ObservedInstance) -> Option<SizingDelta> {
    let vcpus = desired
        .vcpus
        .filter(|v| observed.beparams.vcpus != Some(*v));
    let memory_mb = desired
        .memory
        .filter(|m| observed.beparams.maxmem != Some(*m));

    if vcpus.is_none() && memory_mb.is_none() {
        None
    } else {
        Some(SizingDelta { vcpus, memory_mb })
    }
}

pub fn diff_disks(desired: &[DiskSpec], observed: &[u64]) -> (Vec<DiskChange>, Vec<Violation>) {
    let mut changes = Vec::new();
    let mut violations = Vec::new();

    if desired.len() < observed.len() {
        violations.push(Violation::DiskRemoval {
            desired: desired.len(),
            observed: observed.len(),
        });
    }

    for (index, disk) in desired.iter().enumerate() {
        let target_mb = disk.size_mb();
        let Some(&current_mb) = observed.get(index) else {
            changes.push(DiskChange::Add {
                index,
                params: disk.to_params(),
            });
            continue;
        };

        if target_mb > current_mb {
            changes.push(DiskChange::Grow {
                index,
                current_mb,
                target_mb,
            });
        } else if target_mb < current_mb {
            changes.push(DiskChange::Unsupported {
                index,
                current_mb,
                target_mb,
            });
            violations.push(Violation::DiskShrink {
                index,
                current_mb,
                target_mb,
            });
        }
    }

    (changes, violations)
}

/// Keys of `desired` whose value differs from `observed`.
///
/// A MAC of "generate" never counts: the cluster already generated one.
fn changed_nic_params(desired: &NicParams, observed: &NicParams) -> NicParams {
    desired
        .iter()
        .filter(|(key, value)| !(key.as_str() == "mac" && value.as_str() == MAC_GENERATE))
        .filter(|(key, value)| observed.get(key.as_str()) != Some(*value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Positional NIC diff.
///
/// Surplus NICs on the cluster are assumed to be the trailing ones: only the
/// count is compared, not which entries disappeared from the document.
pub fn diff_nics(desired: &[NicSpec], observed: &[NicParams]) -> (Vec<NicChange>, Option<Violation>) {
    let mut changes = Vec::new();

    for (index, nic) in desired.iter().enumerate() {
        let params = nic.to_params();
        match observed.get(index) {
            None => changes.push(NicChange::Add { index, params }),
            Some(current) => {
                let changed = changed_nic_params(&params, current);
                if !changed.is_empty() {
                    changes.push(NicChange::Modify {
                        index,
                        params: changed,
                    });
                }
            }
        }
    }

    let surplus = observed.len().saturating_sub(desired.len());
    let violation = match surplus {
        0 => None,
        1 => {
            changes.push(NicChange::Remove {
                index: observed.len() - 1,
            });
            None
        }
        count => Some(Violation::NicRemoval { count }),
    };

    (changes, violation)
}

pub fn diff_tags(desired: &[String], observed: &[String]) -> TagDelta {
    let desired: BTreeSet<String> = desired.iter().cloned().collect();
    let observed: BTreeSet<String> = observed.iter().cloned().collect();
    TagDelta {
        to_add: desired.difference(&observed).cloned().collect(),
        to_remove: observed.difference(&desired).cloned().collect(),
    }
}

/// Group changes are never applied; a mismatch is always a violation.
pub fn diff_group(
    instance: &str,
    desired: Option<&str>,
    node: &str,
    membership: Option<&GroupMembership>,
) -> Option<Violation> {
    let desired = desired?;
    match membership {
        Some(GroupMembership::Member(actual)) if actual == desired => None,
        Some(GroupMembership::Member(actual)) => Some(Violation::GroupMismatch {
            instance: instance.to_string(),
            desired: desired.to_string(),
            actual: actual.clone(),
        }),
        Some(other) => Some(Violation::GroupUnresolved {
            node: node.to_string(),
            membership: other.clone(),
        }),
        None => Some(Violation::GroupUnresolved {
            node: node.to_string(),
            membership: GroupMembership::Unassigned,
        }),
    }
}

/// Compare every managed family. Families the document leaves unset
/// (`disks`, `nics`, `tags` = None) are skipped.
pub fn diff(
    desired: &InstanceSpec,
    observed: &ObservedInstance,
    membership: Option<&GroupMembership>,
) -> InstanceDelta {
    let mut delta = InstanceDelta {
        sizing: diff_sizing(desired, observed),
        ..Default::default()
    };

    if let Some(disks) = &desired.disks {
        let (changes, violations) = diff_disks(disks, &observed.disk_sizes);
        delta.disks = changes;
        delta.violations.extend(violations);
    }

    if let Some(nics) = &desired.nics {
        let (changes, violation) = diff_nics(nics, &observed.nics);
        delta.nics = changes;
        delta.violations.extend(violation);
    }

    delta.tags = diff_tags(&desired.tags, &observed.tags);

    delta.violations.extend(diff_group(
        &desired.name,
        desired.group_name.as_deref(),
        &observed.pnode,
        membership,
    ));

    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{InstanceStatus, ObservedBeParams};
    use crate::spec::NicMode;

    fn observed() -> ObservedInstance {
        ObservedInstance {
            name: "vm1".to_string(),
            status: InstanceStatus::Running,
            beparams: ObservedBeParams {
                vcpus: Some(1),
                minmem: Some(512),
                maxmem: Some(512),
            },
            disk_sizes: vec![10240],
            nics: vec![nic_params(&[("mode", "bridged"), ("link", "br0")])],
            tags: vec![],
            pnode: "node1".to_string(),
            snodes: vec![],
        }
    }

    fn nic_params(pairs: &[(&str, &str)]) -> NicParams {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn disks(sizes: &[u64]) -> Vec<DiskSpec> {
        sizes.iter().map(|s| DiskSpec::with_size(*s)).collect()
    }

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_sizing_unchanged() {
        let mut spec = InstanceSpec::new("vm1");
        spec.memory = Some(512);
        spec.vcpus = Some(1);
        assert_eq!(diff_sizing(&spec, &observed()), None);
    }

    #[test]
    fn test_sizing_memory_compared_to_maxmem() {
        let mut spec = InstanceSpec::new("vm1");
        spec.memory = Some(1024);
        spec.vcpus = Some(1);
        let delta = diff_sizing(&spec, &observed()).unwrap();
        assert_eq!(delta.memory_mb, Some(1024));
        assert_eq!(delta.vcpus, None);
    }

    #[test]
    fn test_sizing_unset_fields_ignored() {
        let spec = InstanceSpec::new("vm1");
        assert_eq!(diff_sizing(&spec, &observed()), None);
    }

    #[test]
    fn test_disks_equal_sizes_no_ops() {
        let (changes, violations) = diff_disks(&disks(&[10240, 2048]), &[10240, 2048]);
        assert!(changes.is_empty());
        assert!(violations.is_empty());
    }

    #[test]
    fn test_disks_grow_and_add() {
        let (changes, violations) = diff_disks(&disks(&[20480, 2048, 4096]), &[10240, 2048]);
        assert!(violations.is_empty());
        assert_eq!(changes.len(), 2);
        assert_eq!(
            changes[0],
            DiskChange::Grow {
                index: 0,
                current_mb: 10240,
                target_mb: 20480
            }
        );
        assert!(matches!(&changes[1], DiskChange::Add { index: 2, params } if params.size == 4096));
    }

    #[test]
    fn test_disks_one_op_per_differing_index() {
        let observed = [100, 200, 300, 400];
        let desired = [100, 250, 300, 500, 600, 700];
        let (changes, violations) = diff_disks(&disks(&desired), &observed);
        assert!(violations.is_empty());
        let indexes: Vec<usize> = changes.iter().map(|c| c.index()).collect();
        assert_eq!(indexes, vec![1, 3, 4, 5]);
    }

    #[test]
    fn test_disk_shrink_is_violation() {
        let (changes, violations) = diff_disks(&disks(&[10240, 1024]), &[10240, 2048]);
        assert!(matches!(changes[0], DiskChange::Unsupported { index: 1, .. }));
        assert_eq!(
            violations,
            vec![Violation::DiskShrink {
                index: 1,
                current_mb: 2048,
                target_mb: 1024
            }]
        );
    }

    #[test]
    fn test_disk_removal_is_violation() {
        let (_, violations) = diff_disks(&disks(&[10240]), &[10240, 2048]);
        assert_eq!(
            violations,
            vec![Violation::DiskRemoval {
                desired: 1,
                observed: 2
            }]
        );
    }

    #[test]
    fn test_nic_unchanged() {
        let desired = vec![NicSpec::new(NicMode::Bridged).with_link("br0")];
        let (changes, violation) = diff_nics(&desired, &observed().nics);
        assert!(changes.is_empty());
        assert!(violation.is_none());
    }

    #[test]
    fn test_nic_generate_mac_is_not_a_change() {
        let mut nic = NicSpec::new(NicMode::Bridged).with_link("br0");
        nic.mac = Some(MAC_GENERATE.to_string());
        let current = vec![nic_params(&[
            ("mode", "bridged"),
            ("link", "br0"),
            ("mac", "aa:00:00:12:34:56"),
        ])];
        let (changes, _) = diff_nics(&[nic], &current);
        assert!(changes.is_empty());
    }

    #[test]
    fn test_nic_explicit_mac_is_compared() {
        let mut nic = NicSpec::new(NicMode::Bridged).with_link("br0");
        nic.mac = Some("aa:00:00:00:00:01".to_string());
        let current = vec![nic_params(&[
            ("mode", "bridged"),
            ("link", "br0"),
            ("mac", "aa:00:00:12:34:56"),
        ])];
        let (changes, _) = diff_nics(&[nic], &current);
        assert_eq!(
            changes,
            vec![NicChange::Modify {
                index: 0,
                params: nic_params(&[("mac", "aa:00:00:00:00:01")])
            }]
        );
    }

    #[test]
    fn test_nic_modify_carries_only_changed_keys() {
        let desired = vec![NicSpec::new(NicMode::Bridged).with_link("br1")];
        let (changes, _) = diff_nics(&desired, &observed().nics);
        assert_eq!(
            changes,
            vec![NicChange::Modify {
                index: 0,
                params: nic_params(&[("link", "br1")])
            }]
        );
    }

    #[test]
    fn test_nic_add_trailing() {
        let desired = vec![
            NicSpec::new(NicMode::Bridged).with_link("br0"),
            NicSpec::new(NicMode::Routed),
        ];
        let (changes, _) = diff_nics(&desired, &observed().nics);
        assert_eq!(
            changes,
            vec![NicChange::Add {
                index: 1,
                params: nic_params(&[("mode", "routed")])
            }]
        );
    }

    #[test]
    fn test_nic_remove_single_trailing() {
        let current = vec![
            nic_params(&[("mode", "bridged"), ("link", "br0")]),
            nic_params(&[("mode", "routed")]),
        ];
        let desired = vec![NicSpec::new(NicMode::Bridged).with_link("br0")];
        let (changes, violation) = diff_nics(&desired, &current);
        assert!(violation.is_none());
        assert_eq!(changes, vec![NicChange::Remove { index: 1 }]);
    }

    #[test]
    fn test_nic_remove_two_is_violation() {
        let current = vec![
            nic_params(&[("mode", "bridged")]),
            nic_params(&[("mode", "routed")]),
            nic_params(&[("mode", "routed")]),
        ];
        let desired = vec![NicSpec::new(NicMode::Bridged)];
        let (changes, violation) = diff_nics(&desired, &current);
        assert!(changes.is_empty());
        assert_eq!(violation, Some(Violation::NicRemoval { count: 2 }));
    }

    #[test]
    fn test_tag_delta() {
        let delta = diff_tags(&tags(&["a", "b"]), &tags(&["b", "c"]));
        assert_eq!(delta.to_add, ["a".to_string()].into_iter().collect());
        assert_eq!(delta.to_remove, ["c".to_string()].into_iter().collect());
    }

    #[test]
    fn test_group_checks() {
        let member = GroupMembership::Member("default".to_string());
        assert_eq!(diff_group("vm1", None, "node1", None), None);
        assert_eq!(diff_group("vm1", Some("default"), "node1", Some(&member)), None);
        assert!(matches!(
            diff_group("vm1", Some("fast"), "node1", Some(&member)),
            Some(Violation::GroupMismatch { .. })
        ));
        let ambiguous = GroupMembership::from_groups(tags(&["a", "b"]));
        assert!(matches!(
            diff_group("vm1", Some("a"), "node1", Some(&ambiguous)),
            Some(Violation::GroupUnresolved { .. })
        ));
        assert_eq!(GroupMembership::from_groups(vec![]), GroupMembership::Unassigned);
    }

    #[test]
    fn test_unmanaged_families_skipped() {
        let spec = InstanceSpec::new("vm1");
        let delta = diff(&spec, &observed(), None);
        assert!(delta.is_empty());
        assert!(!delta.reboot_required());
    }

    #[test]
    fn test_omitted_tags_remove_observed() {
        let mut observed = observed();
        observed.tags = tags(&["old"]);
        let delta = diff(&InstanceSpec::new("vm1"), &observed, None);
        assert!(delta.tags.to_add.is_empty());
        assert_eq!(delta.tags.to_remove, BTreeSet::from(["old".to_string()]));
    }

    #[test]
    fn test_reboot_required_families() {
        let mut spec = InstanceSpec::new("vm1");
        spec.disks = Some(disks(&[10240, 1024]));
        let delta = diff(&spec, &observed(), None);
        assert!(delta.reboot_required());

        let mut spec = InstanceSpec::new("vm1");
        spec.nics = Some(vec![NicSpec::new(NicMode::Bridged).with_link("br1")]);
        spec.tags = tags(&["web"]);
        let delta = diff(&spec, &observed(), None);
        assert!(!delta.is_empty());
        assert!(!delta.reboot_required());
    }
}
