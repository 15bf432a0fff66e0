//! Shared test utilities for mvirt-ganeti integration tests.
//!
//! [`FakeControlPlane`] keeps instances in memory, records every call and
//! applies mutations as soon as they are submitted, so a second pass sees
//! the result of the first.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mvirt_ganeti::clients::{
    ClientError, ControlPlane, CreateInstanceRequest, GroupInfo, GrowDiskRequest, InstanceStatus,
    JobId, JobStatus, ModOp, ModifyInstanceRequest, NicParams, ObservedBeParams, ObservedInstance,
    RenameInstanceRequest, StopReason,
};
use mvirt_ganeti::spec::MAC_GENERATE;
use mvirt_ganeti::{InstanceReconciler, ReconcileConfig};

/// A recorded control-plane call.
#[derive(Debug, Clone)]
pub enum Call {
    GetInstance(String),
    Create(CreateInstanceRequest),
    Modify(String, ModifyInstanceRequest),
    Delete(String),
    Startup(String),
    Shutdown(String),
    Reboot(String),
    Migrate(String),
    Rename(String, RenameInstanceRequest),
    AddTags(String, Vec<String>),
    DeleteTags(String, Vec<String>),
    GrowDisk(String, GrowDiskRequest),
    GetGroups,
    GetGroup(String),
    JobStatus(JobId),
}

impl Call {
    /// True for calls that submit a job.
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            Call::GetInstance(_) | Call::GetGroups | Call::GetGroup(_) | Call::JobStatus(_)
        )
    }
}

#[derive(Default)]
struct FakeState {
    instances: BTreeMap<String, ObservedInstance>,
    groups: BTreeMap<String, Vec<String>>,
    calls: Vec<Call>,
    next_job: u64,
    jobs: HashMap<JobId, JobStatus>,
    /// Final status for the next submitted jobs, in order; default success.
    scripted: VecDeque<JobStatus>,
    unreachable: bool,
    job_status_fails: bool,
}

/// In-memory control plane.
#[derive(Default)]
pub struct FakeControlPlane {
    state: Mutex<FakeState>,
}

impl FakeControlPlane {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_instance(instance: ObservedInstance) -> Arc<Self> {
        let fake = Self::new();
        fake.insert(instance);
        fake
    }

    pub fn insert(&self, instance: ObservedInstance) {
        let mut state = self.state.lock().unwrap();
        state.instances.insert(instance.name.clone(), instance);
    }

    pub fn add_group(&self, name: &str, nodes: &[&str]) {
        let mut state = self.state.lock().unwrap();
        state
            .groups
            .insert(name.to_string(), nodes.iter().map(|n| n.to_string()).collect());
    }

    /// Give the next submitted jobs these final statuses.
    pub fn script_jobs(&self, statuses: &[JobStatus]) {
        let mut state = self.state.lock().unwrap();
        state.scripted.extend(statuses.iter().copied());
    }

    pub fn set_unreachable(&self) {
        self.state.lock().unwrap().unreachable = true;
    }

    pub fn fail_job_status(&self) {
        self.state.lock().unwrap().job_status_fails = true;
    }

    pub fn instance(&self, name: &str) -> Option<ObservedInstance> {
        self.state.lock().unwrap().instances.get(name).cloned()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn mutations(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_mutation).collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    fn record(&self, call: Call) -> Result<(), ClientError> {
        let mut state = self.state.lock().unwrap();
        if state.unreachable {
            return Err(ClientError::Unreachable {
                address: "ganeti.test".to_string(),
                message: "connection refused".to_string(),
            });
        }
        state.calls.push(call);
        Ok(())
    }

    /// Record a mutation, apply it, and hand out a job id.
    fn submit(
        &self,
        call: Call,
        apply: impl FnOnce(&mut BTreeMap<String, ObservedInstance>),
    ) -> Result<JobId, ClientError> {
        self.record(call)?;
        let mut state = self.state.lock().unwrap();
        apply(&mut state.instances);
        state.next_job += 1;
        let job = JobId(state.next_job.to_string());
        let status = state.scripted.pop_front().unwrap_or(JobStatus::Success);
        state.jobs.insert(job.clone(), status);
        Ok(job)
    }
}

/// A NIC the way the cluster reports it back: Ganeti always assigns a MAC,
/// generating one when none (or "generate") was requested.
fn as_reported(instance: &str, index: usize, mut params: NicParams) -> NicParams {
    let needs_mac = params.get("mac").map_or(true, |mac| mac == MAC_GENERATE);
    if needs_mac {
        let seed = instance.bytes().fold(0u8, |acc, b| acc.wrapping_add(b));
        params.insert(
            "mac".to_string(),
            format!("aa:00:00:00:{:02x}:{:02x}", seed, index),
        );
    }
    params
}

fn set_status(instances: &mut BTreeMap<String, ObservedInstance>, name: &str, status: InstanceStatus) {
    if let Some(instance) = instances.get_mut(name) {
        instance.status = status;
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn get_instance(&self, name: &str) -> Result<ObservedInstance, ClientError> {
        self.record(Call::GetInstance(name.to_string()))?;
        self.instance(name)
            .ok_or_else(|| ClientError::NotFound(format!("instance {}", name)))
    }

    async fn create_instance(&self, request: &CreateInstanceRequest) -> Result<JobId, ClientError> {
        let created = ObservedInstance {
            name: request.name.clone(),
            status: InstanceStatus::Running,
            beparams: ObservedBeParams {
                vcpus: request.beparams.vcpus.or(Some(1)),
                minmem: request.beparams.minmem.or(Some(128)),
                maxmem: request.beparams.maxmem.or(Some(128)),
            },
            disk_sizes: request.disks.iter().map(|d| d.size).collect(),
            nics: request
                .nics
                .iter()
                .enumerate()
                .map(|(index, nic)| as_reported(&request.name, index, nic.clone()))
                .collect(),
            tags: request.tags.clone(),
            pnode: request.pnode.clone().unwrap_or_else(|| "node1".to_string()),
            snodes: request.snode.clone().into_iter().collect(),
        };
        self.submit(Call::Create(request.clone()), move |instances| {
            instances.insert(created.name.clone(), created);
        })
    }

    async fn modify_instance(
        &self,
        name: &str,
        request: &ModifyInstanceRequest,
    ) -> Result<JobId, ClientError> {
        let req = request.clone();
        self.submit(Call::Modify(name.to_string(), request.clone()), |instances| {
            let Some(instance) = instances.get_mut(name) else {
                return;
            };
            if let Some(vcpus) = req.beparams.vcpus {
                instance.beparams.vcpus = Some(vcpus);
            }
            if let Some(maxmem) = req.beparams.maxmem {
                instance.beparams.maxmem = Some(maxmem);
            }
            if let Some(minmem) = req.beparams.minmem {
                instance.beparams.minmem = Some(minmem);
            }
            for (op, index, params) in req.nics {
                match op {
                    ModOp::Add => {
                        let index = index.min(instance.nics.len());
                        let params = as_reported(name, index, params);
                        instance.nics.insert(index, params);
                    }
                    ModOp::Modify => instance.nics[index].extend(params),
                    ModOp::Remove => {
                        instance.nics.remove(index);
                    }
                }
            }
            for (op, _, params) in req.disks {
                if op == ModOp::Add {
                    instance.disk_sizes.push(params.size);
                }
            }
        })
    }

    async fn delete_instance(&self, name: &str) -> Result<JobId, ClientError> {
        self.submit(Call::Delete(name.to_string()), |instances| {
            instances.remove(name);
        })
    }

    async fn startup_instance(&self, name: &str) -> Result<JobId, ClientError> {
        self.submit(Call::Startup(name.to_string()), |instances| {
            set_status(instances, name, InstanceStatus::Running)
        })
    }

    async fn shutdown_instance(&self, name: &str) -> Result<JobId, ClientError> {
        self.submit(Call::Shutdown(name.to_string()), |instances| {
            set_status(instances, name, InstanceStatus::Stopped(StopReason::Admin))
        })
    }

    async fn reboot_instance(&self, name: &str) -> Result<JobId, ClientError> {
        self.submit(Call::Reboot(name.to_string()), |instances| {
            set_status(instances, name, InstanceStatus::Running)
        })
    }

    async fn migrate_instance(&self, name: &str) -> Result<JobId, ClientError> {
        self.submit(Call::Migrate(name.to_string()), |instances| {
            if let Some(instance) = instances.get_mut(name) {
                if let Some(secondary) = instance.snodes.first_mut() {
                    std::mem::swap(&mut instance.pnode, secondary);
                }
            }
        })
    }

    async fn rename_instance(
        &self,
        name: &str,
        request: &RenameInstanceRequest,
    ) -> Result<JobId, ClientError> {
        let new_name = request.new_name.clone();
        self.submit(Call::Rename(name.to_string(), request.clone()), |instances| {
            if let Some(mut instance) = instances.remove(name) {
                instance.name = new_name.clone();
                instances.insert(new_name, instance);
            }
        })
    }

    async fn add_instance_tags(&self, name: &str, tags: &[String]) -> Result<JobId, ClientError> {
        let tags = tags.to_vec();
        self.submit(Call::AddTags(name.to_string(), tags.clone()), |instances| {
            if let Some(instance) = instances.get_mut(name) {
                instance.tags.extend(tags);
            }
        })
    }

    async fn delete_instance_tags(
        &self,
        name: &str,
        tags: &[String],
    ) -> Result<JobId, ClientError> {
        let tags = tags.to_vec();
        self.submit(Call::DeleteTags(name.to_string(), tags.clone()), |instances| {
            if let Some(instance) = instances.get_mut(name) {
                instance.tags.retain(|t| !tags.contains(t));
            }
        })
    }

    async fn grow_instance_disk(
        &self,
        name: &str,
        request: &GrowDiskRequest,
    ) -> Result<JobId, ClientError> {
        let (index, amount) = (request.index, request.amount);
        self.submit(Call::GrowDisk(name.to_string(), request.clone()), |instances| {
            if let Some(size) = instances
                .get_mut(name)
                .and_then(|i| i.disk_sizes.get_mut(index))
            {
                *size += amount;
            }
        })
    }

    async fn get_groups(&self) -> Result<Vec<String>, ClientError> {
        self.record(Call::GetGroups)?;
        Ok(self.state.lock().unwrap().groups.keys().cloned().collect())
    }

    async fn get_group(&self, name: &str) -> Result<GroupInfo, ClientError> {
        self.record(Call::GetGroup(name.to_string()))?;
        let state = self.state.lock().unwrap();
        let nodes = state
            .groups
            .get(name)
            .ok_or_else(|| ClientError::NotFound(format!("group {}", name)))?;
        Ok(GroupInfo {
            name: name.to_string(),
            node_list: nodes.clone(),
        })
    }

    async fn job_status(&self, job: &JobId) -> Result<JobStatus, ClientError> {
        self.record(Call::JobStatus(job.clone()))?;
        let state = self.state.lock().unwrap();
        if state.job_status_fails {
            return Err(ClientError::Request("connection reset".to_string()));
        }
        state
            .jobs
            .get(job)
            .copied()
            .ok_or_else(|| ClientError::NotFound(format!("job {}", job)))
    }
}

pub fn nic_params(pairs: &[(&str, &str)]) -> NicParams {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Running instance: 1 vCPU, 512 MB, one 10 GB disk, one bridged NIC on br0
/// with a cluster-assigned MAC.
pub fn running_instance(name: &str) -> ObservedInstance {
    ObservedInstance {
        name: name.to_string(),
        status: InstanceStatus::Running,
        beparams: ObservedBeParams {
            vcpus: Some(1),
            minmem: Some(512),
            maxmem: Some(512),
        },
        disk_sizes: vec![10240],
        nics: vec![nic_params(&[
            ("mode", "bridged"),
            ("link", "br0"),
            ("mac", "aa:00:00:00:00:01"),
        ])],
        tags: vec![],
        pnode: "node1".to_string(),
        snodes: vec!["node2".to_string()],
    }
}

pub fn stopped_instance(name: &str) -> ObservedInstance {
    ObservedInstance {
        status: InstanceStatus::Stopped(StopReason::Admin),
        ..running_instance(name)
    }
}

/// Fast polling so timeouts resolve in milliseconds.
pub fn test_config() -> ReconcileConfig {
    ReconcileConfig {
        wait: true,
        poll_period: Duration::from_millis(1),
        job_retries: 5,
        tag_job_retries: 5,
    }
}

pub fn reconciler(fake: &Arc<FakeControlPlane>) -> InstanceReconciler {
    InstanceReconciler::new(fake.clone(), test_config())
}
