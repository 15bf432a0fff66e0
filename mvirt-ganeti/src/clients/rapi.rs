//! Client for the Ganeti remote API (RAPI v2).

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::types::{
    CreateInstanceRequest, GroupInfo, GrowDiskRequest, InstanceStatus, ModifyInstanceRequest,
    NicParams, ObservedBeParams, ObservedInstance, RenameInstanceRequest,
};
use super::{ClientError, ControlPlane, JobId, JobStatus};
use crate::config::RapiConfig;

/// Instance as returned by `GET /2/instances/{name}`.
#[derive(Debug, Deserialize)]
struct RapiInstance {
    name: String,
    status: String,
    #[serde(default)]
    beparams: RapiBeParams,
    #[serde(rename = "disk.sizes", default)]
    disk_sizes: Vec<u64>,
    #[serde(default)]
    custom_nicparams: Vec<BTreeMap<String, Value>>,
    #[serde(rename = "nic.macs", default)]
    nic_macs: Vec<Value>,
    #[serde(rename = "nic.ips", default)]
    nic_ips: Vec<Value>,
    #[serde(rename = "nic.names", default)]
    nic_names: Vec<Value>,
    #[serde(rename = "nic.networks.names", default)]
    nic_networks: Vec<Value>,
    #[serde(rename = "nic.modes", default)]
    nic_modes: Vec<Value>,
    #[serde(rename = "nic.links", default)]
    nic_links: Vec<Value>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    pnode: String,
    #[serde(default)]
    snodes: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RapiBeParams {
    vcpus: Option<u32>,
    minmem: Option<u64>,
    maxmem: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RapiGroupRef {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RapiJob {
    status: JobStatus,
}

/// Render a RAPI parameter value the way the desired-state document spells it.
fn param_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

impl RapiInstance {
    /// Per-NIC snapshot keyed like the desired-state document.
    ///
    /// `custom_nicparams` only carries values overridden on the instance;
    /// MAC, IP, name and network live in the `nic.*` lists. Entry `i` of every
    /// list belongs to NIC `i`. Custom values win over the effective ones.
    fn nic_snapshots(&self) -> Vec<NicParams> {
        let columns = [
            ("mac", &self.nic_macs),
            ("ip", &self.nic_ips),
            ("name", &self.nic_names),
            ("network", &self.nic_networks),
            ("mode", &self.nic_modes),
            ("link", &self.nic_links),
        ];
        let count = columns
            .iter()
            .map(|(_, values)| values.len())
            .chain(std::iter::once(self.custom_nicparams.len()))
            .max()
            .unwrap_or(0);

        (0..count)
            .map(|index| {
                let mut params = NicParams::new();
                for (key, values) in &columns {
                    if let Some(value) = values.get(index).and_then(param_to_string) {
                        params.insert(key.to_string(), value);
                    }
                }
                if let Some(custom) = self.custom_nicparams.get(index) {
                    params.extend(
                        custom
                            .iter()
                            .filter_map(|(k, v)| param_to_string(v).map(|v| (k.clone(), v))),
                    );
                }
                params
            })
            .collect()
    }
}

impl From<RapiInstance> for ObservedInstance {
    fn from(raw: RapiInstance) -> Self {
        let nics = raw.nic_snapshots();

        ObservedInstance {
            name: raw.name,
            status: InstanceStatus::from(raw.status.as_str()),
            beparams: ObservedBeParams {
                vcpus: raw.beparams.vcpus,
                minmem: raw.beparams.minmem,
                maxmem: raw.beparams.maxmem,
            },
            disk_sizes: raw.disk_sizes,
            nics,
            tags: raw.tags,
            pnode: raw.pnode,
            snodes: raw.snodes,
        }
    }
}

/// Mutations answer with a job id, either as a JSON string or a number.
fn decode_job_id(body: Value) -> Result<JobId, ClientError> {
    match body {
        Value::String(s) => Ok(JobId(s)),
        Value::Number(n) => Ok(JobId(n.to_string())),
        other => Err(ClientError::Decode(format!("expected job id, got {}", other))),
    }
}

/// HTTP client for one Ganeti cluster.
pub struct RapiClient {
    http: reqwest::Client,
    base_url: Url,
    address: String,
    user: Option<String>,
    password: Option<String>,
}

impl RapiClient {
    pub fn new(config: &RapiConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.insecure)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ClientError::Request(e.to_string()))?;
        let base_url = Url::parse(&config.base_url())
            .map_err(|e| ClientError::Request(format!("invalid RAPI address: {}", e)))?;
        if base_url.cannot_be_a_base() {
            return Err(ClientError::Request(format!(
                "invalid RAPI address: {}",
                base_url
            )));
        }

        Ok(Self {
            http,
            base_url,
            address: config.address.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
        })
    }

    /// Resource URL below `/2`. Each segment is percent-encoded on its own,
    /// so names containing `/` or spaces stay a single path segment.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, segments: &[&str]) -> RequestBuilder {
        let url = self.url(segments);
        debug!("RAPI {} {}", method, url);
        let builder = self.http.request(method, url);
        match &self.user {
            Some(user) => builder.basic_auth(user, self.password.as_ref()),
            None => builder,
        }
    }

    fn map_send_error(&self, e: reqwest::Error) -> ClientError {
        if e.is_connect() {
            ClientError::Unreachable {
                address: self.address.clone(),
                message: e.to_string(),
            }
        } else {
            ClientError::Request(e.to_string())
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, ClientError> {
        let response = builder.send().await.map_err(|e| self.map_send_error(e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND {
            Err(ClientError::NotFound(message))
        } else {
            Err(ClientError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &[&str]) -> Result<T, ClientError> {
        let response = self.send(self.request(Method::GET, path)).await?;
        response
            .json()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))
    }

    async fn submit(
        &self,
        method: Method,
        path: &[&str],
        body: Option<&(impl Serialize + Sync)>,
    ) -> Result<JobId, ClientError> {
        let mut builder = self.request(method, path);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let response = self.send(builder).await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))?;
        decode_job_id(body)
    }

    async fn submit_tags(
        &self,
        method: Method,
        name: &str,
        tags: &[String],
    ) -> Result<JobId, ClientError> {
        let query: Vec<(&str, &str)> = tags.iter().map(|t| ("tag", t.as_str())).collect();
        let builder = self
            .request(method, &["instances", name, "tags"])
            .query(&query);
        let response = self.send(builder).await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))?;
        decode_job_id(body)
    }
}

const NO_BODY: Option<&Value> = None;

#[async_trait]
impl ControlPlane for RapiClient {
    async fn get_instance(&self, name: &str) -> Result<ObservedInstance, ClientError> {
        let raw: RapiInstance = self.get_json(&["instances", name]).await?;
        Ok(raw.into())
    }

    async fn create_instance(&self, request: &CreateInstanceRequest) -> Result<JobId, ClientError> {
        self.submit(Method::POST, &["instances"], Some(request)).await
    }

    async fn modify_instance(
        &self,
        name: &str,
        request: &ModifyInstanceRequest,
    ) -> Result<JobId, ClientError> {
        self.submit(Method::PUT, &["instances", name, "modify"], Some(request))
            .await
    }

    async fn delete_instance(&self, name: &str) -> Result<JobId, ClientError> {
        self.submit(Method::DELETE, &["instances", name], NO_BODY)
            .await
    }

    async fn startup_instance(&self, name: &str) -> Result<JobId, ClientError> {
        self.submit(Method::PUT, &["instances", name, "startup"], NO_BODY)
            .await
    }

    async fn shutdown_instance(&self, name: &str) -> Result<JobId, ClientError> {
        self.submit(Method::PUT, &["instances", name, "shutdown"], NO_BODY)
            .await
    }

    async fn reboot_instance(&self, name: &str) -> Result<JobId, ClientError> {
        self.submit(Method::POST, &["instances", name, "reboot"], NO_BODY)
            .await
    }

    async fn migrate_instance(&self, name: &str) -> Result<JobId, ClientError> {
        self.submit(Method::PUT, &["instances", name, "migrate"], NO_BODY)
            .await
    }

    async fn rename_instance(
        &self,
        name: &str,
        request: &RenameInstanceRequest,
    ) -> Result<JobId, ClientError> {
        self.submit(Method::PUT, &["instances", name, "rename"], Some(request))
            .await
    }

    async fn add_instance_tags(&self, name: &str, tags: &[String]) -> Result<JobId, ClientError> {
        self.submit_tags(Method::PUT, name, tags).await
    }

    async fn delete_instance_tags(
        &self,
        name: &str,
        tags: &[String],
    ) -> Result<JobId, ClientError> {
        self.submit_tags(Method::DELETE, name, tags).await
    }

    async fn grow_instance_disk(
        &self,
        name: &str,
        request: &GrowDiskRequest,
    ) -> Result<JobId, ClientError> {
        let index = request.index.to_string();
        let path = ["instances", name, "disk", index.as_str(), "grow"];
        self.submit(Method::POST, &path, Some(request)).await
    }

    async fn get_groups(&self) -> Result<Vec<String>, ClientError> {
        let groups: Vec<RapiGroupRef> = self.get_json(&["groups"]).await?;
        Ok(groups.into_iter().map(|g| g.name).collect())
    }

    async fn get_group(&self, name: &str) -> Result<GroupInfo, ClientError> {
        self.get_json(&["groups", name]).await
    }

    async fn job_status(&self, job: &JobId) -> Result<JobStatus, ClientError> {
        let raw: RapiJob = self.get_json(&["jobs", job.0.as_str()]).await?;
        Ok(raw.status)
    }
}
