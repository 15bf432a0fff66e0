//! Instance reconciler - drives one instance towards its desired state.

use std::future::Future;
use std::sync::Arc;

use tracing::{error, info, warn};

use super::diff::{self, GroupMembership};
use super::plan::{self, PlannedOp};
use super::{ReconcileOutcome, NOT_MODIFIED};
use crate::clients::{
    BeParams, ClientError, ControlPlane, CreateInstanceRequest, InstanceStatus, JobId,
    ObservedInstance, RenameInstanceRequest,
};
use crate::config::ReconcileConfig;
use crate::error::{Error, Result};
use crate::job::{ActionReport, JobTracker, WaitPolicy};
use crate::spec::{DesiredState, InstanceSpec};

/// Assemble the creation request for `spec`.
pub fn build_create_request(spec: &InstanceSpec) -> Result<CreateInstanceRequest> {
    let mut beparams = BeParams {
        vcpus: spec.vcpus,
        ..Default::default()
    };
    if let Some(mb) = spec.memory {
        beparams.set_memory(mb);
    }

    Ok(CreateInstanceRequest {
        version: 1,
        mode: "create".to_string(),
        name: spec.name.clone(),
        beparams,
        disk_template: spec.disk_template,
        hypervisor: spec.hypervisor,
        // An explicit primary node overrides the allocator.
        iallocator: if spec.pnode.is_some() {
            None
        } else {
            spec.iallocator.clone()
        },
        os_type: spec.os_type_or_default().to_string(),
        pnode: spec.pnode.clone(),
        snode: spec.snode.clone(),
        conflicts_check: spec.conflicts_check,
        ip_check: spec.ip_check,
        name_check: spec.name_check,
        no_install: spec.no_install,
        wait_for_sync: spec.wait_for_sync,
        tags: spec.tags.clone(),
        group_name: spec.group_name.clone(),
        disks: spec.disks.iter().flatten().map(|d| d.to_params()).collect(),
        nics: spec.nics.iter().flatten().map(|n| n.to_params()).collect(),
        osparams: spec.flat_osparams()?,
    })
}

/// Reconciles Ganeti instances through an injected control plane.
pub struct InstanceReconciler {
    client: Arc<dyn ControlPlane>,
    config: ReconcileConfig,
}

impl InstanceReconciler {
    pub fn new(client: Arc<dyn ControlPlane>, config: ReconcileConfig) -> Self {
        Self { client, config }
    }

    fn policy(&self) -> WaitPolicy {
        if self.config.wait {
            WaitPolicy::Wait {
                poll_period: self.config.poll_period,
                max_retries: self.config.job_retries,
            }
        } else {
            WaitPolicy::FireAndForget
        }
    }

    fn tag_policy(&self) -> WaitPolicy {
        WaitPolicy::Wait {
            poll_period: self.config.poll_period,
            max_retries: self.config.tag_job_retries,
        }
    }

    /// Run one reconciliation pass for `spec`.
    pub async fn reconcile(&self, spec: &InstanceSpec) -> Result<ReconcileOutcome> {
        spec.validate()?;
        info!("Reconciling instance {} (state {})", spec.name, spec.state);

        if let Some(instance) = self.probe(&spec.name).await? {
            return self.reconcile_present(spec, instance).await;
        }

        // A previous pass may already have performed the rename.
        if let Some(new_name) = &spec.new_name {
            if let Some(instance) = self.probe(new_name).await? {
                info!("Instance {} already renamed to {}", spec.name, new_name);
                let mut renamed = spec.clone();
                renamed.name = new_name.clone();
                renamed.new_name = None;
                return self.reconcile_present(&renamed, instance).await;
            }
        }

        self.reconcile_absent(spec).await
    }

    /// Existence probe. Not-found means absent; anything else is fatal.
    async fn probe(&self, name: &str) -> Result<Option<ObservedInstance>> {
        match self.client.get_instance(name).await {
            Ok(instance) => Ok(Some(instance)),
            Err(ClientError::NotFound(_)) => Ok(None),
            Err(e) => {
                error!("Failed to fetch instance {}: {}", name, e);
                Err(e.into())
            }
        }
    }

    async fn reconcile_absent(&self, spec: &InstanceSpec) -> Result<ReconcileOutcome> {
        match spec.state {
            DesiredState::Present => self.create(spec).await,
            DesiredState::Absent => Ok(ReconcileOutcome::unchanged("No instance found")),
            state => Err(Error::precondition(
                &spec.name,
                format!(
                    "Instance {} is not present, can't set to {}",
                    spec.name, state
                ),
            )),
        }
    }

    async fn reconcile_present(
        &self,
        spec: &InstanceSpec,
        instance: ObservedInstance,
    ) -> Result<ReconcileOutcome> {
        let name = spec.name.as_str();
        let status = &instance.status;

        if let Some(new_name) = &spec.new_name {
            if !status.is_stopped() {
                info!("Not renaming {}: instance is {}", name, status);
                return Ok(ReconcileOutcome::unchanged(format!(
                    "Instance needs to be halted to be renamed, status {}",
                    status
                )));
            }
            let request = RenameInstanceRequest {
                new_name: new_name.clone(),
                ip_check: spec.ip_check,
                name_check: spec.name_check,
            };
            info!("Renaming instance {} to {}", name, new_name);
            let job = self.client.rename_instance(name, &request).await?;
            return self.single_action(name, job, "rename").await;
        }

        match (spec.state, status) {
            (DesiredState::Present, _) => self.modify(spec, &instance).await,
            (DesiredState::Absent, _) => {
                info!("Deleting instance {}", name);
                let job = self.client.delete_instance(name).await?;
                self.single_action(name, job, "delete").await
            }
            (DesiredState::Stopped, InstanceStatus::Stopped(_)) => Ok(ReconcileOutcome::unchanged(
                format!("Instance already stopped, status {}", status),
            )),
            (DesiredState::Stopped, _) => {
                info!("Shutting down instance {} (status {})", name, status);
                let job = self.client.shutdown_instance(name).await?;
                self.single_action(name, job, "shutdown").await
            }
            (DesiredState::Started, InstanceStatus::Running) => {
                Ok(ReconcileOutcome::unchanged("Instance already running"))
            }
            (DesiredState::Started, _) | (DesiredState::Restarted, InstanceStatus::Stopped(_)) => {
                self.startup(name, status).await
            }
            (DesiredState::Restarted, InstanceStatus::Running) => {
                info!("Rebooting instance {}", name);
                let job = self.client.reboot_instance(name).await?;
                self.single_action(name, job, "restart").await
            }
            (DesiredState::Restarted, InstanceStatus::Transitional(_)) => {
                self.startup(name, status).await
            }
            (DesiredState::Migrated, InstanceStatus::Running) => {
                info!("Migrating instance {}", name);
                let job = self.client.migrate_instance(name).await?;
                self.single_action(name, job, "migrate").await
            }
            (DesiredState::Migrated, InstanceStatus::Stopped(_)) => Err(Error::precondition(
                name,
                format!("Instance {} cannot be migrated while stopped, status {}", name, status),
            )),
            (DesiredState::Migrated, _) => {
                warn!("Not migrating {}: instance is {}", name, status);
                Ok(ReconcileOutcome::unchanged(format!(
                    "Instance is not running, status {}; migration skipped",
                    status
                )))
            }
        }
    }

    async fn startup(&self, name: &str, status: &InstanceStatus) -> Result<ReconcileOutcome> {
        info!("Starting instance {} (status {})", name, status);
        let job = self.client.startup_instance(name).await?;
        self.single_action(name, job, "startup").await
    }

    async fn single_action(
        &self,
        name: &str,
        job: JobId,
        action: &str,
    ) -> Result<ReconcileOutcome> {
        let tracker = JobTracker::new(Arc::clone(&self.client), name);
        let report = tracker.track(job, action, self.policy()).await?;
        Ok(ReconcileOutcome::from_actions(vec![report], false))
    }

    async fn create(&self, spec: &InstanceSpec) -> Result<ReconcileOutcome> {
        let request = build_create_request(spec)?;
        info!(
            "Creating instance {} ({} disks, {} nics)",
            spec.name,
            request.disks.len(),
            request.nics.len()
        );
        let job = self.client.create_instance(&request).await?;
        self.single_action(&spec.name, job, "create").await
    }

    /// Find the node group(s) containing `node`.
    async fn resolve_group(&self, node: &str) -> Result<GroupMembership> {
        let mut member_of = Vec::new();
        for group in self.client.get_groups().await? {
            let info = self.client.get_group(&group).await?;
            if info.node_list.iter().any(|n| n == node) {
                member_of.push(group);
            }
        }
        Ok(GroupMembership::from_groups(member_of))
    }

    async fn modify(
        &self,
        spec: &InstanceSpec,
        instance: &ObservedInstance,
    ) -> Result<ReconcileOutcome> {
        let name = spec.name.as_str();

        let membership = match spec.group_name {
            Some(_) => Some(self.resolve_group(&instance.pnode).await?),
            None => None,
        };
        let delta = diff::diff(spec, instance, membership.as_ref());
        let plan = plan::plan(spec, &delta)?;

        if plan.is_empty() {
            info!("Instance {} is up to date", name);
            return Ok(ReconcileOutcome::unchanged(NOT_MODIFIED));
        }

        info!(
            "Modifying instance {}: {} operations, reboot required: {}",
            name,
            plan.ops.len(),
            plan.reboot_required
        );

        let tracker = JobTracker::new(Arc::clone(&self.client), name);
        let total = plan.ops.len();
        let mut actions: Vec<ActionReport> = Vec::with_capacity(total);

        for op in &plan.ops {
            let action = op.action();
            let result = match op {
                PlannedOp::GrowDisk(request) => {
                    info!(
                        "Growing disk {} of {} by {} MB",
                        request.index, name, request.amount
                    );
                    self.submit_and_track(
                        &tracker,
                        action,
                        self.policy(),
                        self.client.grow_instance_disk(name, request),
                    )
                    .await
                }
                PlannedOp::Modify(request) => {
                    self.submit_and_track(
                        &tracker,
                        action,
                        self.policy(),
                        self.client.modify_instance(name, request),
                    )
                    .await
                }
                PlannedOp::AddTags(tags) => {
                    info!("Adding tags {:?} to {}", tags, name);
                    self.submit_and_track(
                        &tracker,
                        action,
                        self.tag_policy(),
                        self.client.add_instance_tags(name, tags),
                    )
                    .await
                }
                PlannedOp::RemoveTags(tags) => {
                    info!("Removing tags {:?} from {}", tags, name);
                    self.submit_and_track(
                        &tracker,
                        action,
                        self.tag_policy(),
                        self.client.delete_instance_tags(name, tags),
                    )
                    .await
                }
            };

            match result {
                Ok(report) => actions.push(report),
                Err(e) => {
                    // Earlier operations stay applied; there is no rollback.
                    error!(
                        "Modify of {} aborted at {} after {} of {} operations: {}",
                        name,
                        action,
                        actions.len(),
                        total,
                        e
                    );
                    return Err(e);
                }
            }
        }

        Ok(ReconcileOutcome::from_actions(actions, plan.reboot_required))
    }

    async fn submit_and_track(
        &self,
        tracker: &JobTracker,
        action: &str,
        policy: WaitPolicy,
        submit: impl Future<Output = std::result::Result<JobId, ClientError>>,
    ) -> Result<ActionReport> {
        let job = submit.await?;
        tracker.track(job, action, policy).await
    }
}
