//! Turns an [`InstanceDelta`] into an ordered list of control-plane calls.

use super::diff::{DiskChange, InstanceDelta, NicChange};
use crate::clients::{BeParams, GrowDiskRequest, ModOp, ModifyInstanceRequest, NicParams};
use crate::error::{Error, Result};
use crate::spec::InstanceSpec;

/// One control-plane call of a modify pass.
#[derive(Debug, Clone)]
pub enum PlannedOp {
    GrowDisk(GrowDiskRequest),
    /// Sizing, NIC changes and disk additions in one request.
    Modify(ModifyInstanceRequest),
    AddTags(Vec<String>),
    RemoveTags(Vec<String>),
}

impl PlannedOp {
    /// Name used in job messages.
    pub fn action(&self) -> &'static str {
        match self {
            PlannedOp::GrowDisk(_) => "disk grow",
            PlannedOp::Modify(_) => "modify",
            PlannedOp::AddTags(_) => "add tags",
            PlannedOp::RemoveTags(_) => "remove tags",
        }
    }
}

/// Ordered calls for one modify pass.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub ops: Vec<PlannedOp>,
    pub reboot_required: bool,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Build the call list.
///
/// Any violation aborts planning before a single call exists, so an illegal
/// delta is never partially applied. Order: disk grows by index, the batched
/// modify, tag additions, tag removals.
pub fn plan(desired: &InstanceSpec, delta: &InstanceDelta) -> Result<Plan> {
    if !delta.violations.is_empty() {
        let message = delta
            .violations
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        return Err(Error::configuration(&desired.name, message));
    }

    let mut ops = Vec::new();
    let mut modify = ModifyInstanceRequest {
        conflicts_check: desired.conflicts_check,
        wait_for_sync: desired.wait_for_sync,
        ..Default::default()
    };

    if let Some(sizing) = &delta.sizing {
        let mut beparams = BeParams {
            vcpus: sizing.vcpus,
            ..Default::default()
        };
        if let Some(mb) = sizing.memory_mb {
            beparams.set_memory(mb);
        }
        modify.beparams = beparams;
    }

    for change in &delta.disks {
        match change {
            DiskChange::Add { index, params } => {
                modify.disks.push((ModOp::Add, *index, params.clone()));
            }
            DiskChange::Grow {
                index,
                current_mb,
                target_mb,
            } => ops.push(PlannedOp::GrowDisk(GrowDiskRequest {
                index: *index,
                amount: target_mb - current_mb,
                absolute: false,
                wait_for_sync: desired.wait_for_sync,
            })),
            DiskChange::Unsupported { index, .. } => {
                return Err(Error::configuration(
                    &desired.name,
                    format!("Reducing a disks size is not supported (disk {})", index),
                ));
            }
        }
    }

    for change in &delta.nics {
        let entry = match change {
            NicChange::Add { index, params } => (ModOp::Add, *index, params.clone()),
            NicChange::Modify { index, params } => (ModOp::Modify, *index, params.clone()),
            NicChange::Remove { index } => (ModOp::Remove, *index, NicParams::new()),
        };
        modify.nics.push(entry);
    }

    if !modify.is_noop() {
        ops.push(PlannedOp::Modify(modify));
    }
    if !delta.tags.to_add.is_empty() {
        ops.push(PlannedOp::AddTags(delta.tags.to_add.iter().cloned().collect()));
    }
    if !delta.tags.to_remove.is_empty() {
        ops.push(PlannedOp::RemoveTags(
            delta.tags.to_remove.iter().cloned().collect(),
        ));
    }

    Ok(Plan {
        ops,
        reboot_required: delta.reboot_required(),
    })
}
