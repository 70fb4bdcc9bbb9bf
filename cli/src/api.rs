//! Blocking client for the qarax control API.
//!
//! Everything here is pass-through: one request per operation, plus optional
//! polling until the API reports a terminal state.

use std::fmt;
use std::thread::sleep;
use std::time::{Duration, Instant};

use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::vm::VmId;

pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(300);
const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("not found")]
    NotFound,

    #[error("API returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("job {id} failed: {error}")]
    JobFailed { id: Uuid, error: String },

    #[error("timed out after {0:?} waiting for {1}")]
    WaitTimeout(Duration, String),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VmStatus {
    Unknown,
    Created,
    Running,
    Paused,
    Shutdown,
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VmStatus::Unknown => "unknown",
            VmStatus::Created => "created",
            VmStatus::Running => "running",
            VmStatus::Paused => "paused",
            VmStatus::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Vm {
    pub vmid: u32,
    pub name: String,
    pub status: VmStatus,
    #[serde(default)]
    pub boot_vcpus: Option<i32>,
    #[serde(default)]
    pub memory_size: Option<i64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    #[serde(default)]
    pub progress: Option<i32>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct ActionResponse {
    #[serde(default)]
    job_id: Option<Uuid>,
}

/// VM state transitions exposed as `POST /vms/{vmid}/{action}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmAction {
    Start,
    Stop,
    Pause,
    Resume,
}

impl VmAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmAction::Start => "start",
            VmAction::Stop => "stop",
            VmAction::Pause => "pause",
            VmAction::Resume => "resume",
        }
    }

    /// Status the VM reports once the action has taken effect.
    pub fn target_status(&self) -> VmStatus {
        match self {
            VmAction::Start | VmAction::Resume => VmStatus::Running,
            VmAction::Stop => VmStatus::Shutdown,
            VmAction::Pause => VmStatus::Paused,
        }
    }
}

/// How an action was acknowledged: as a background job or synchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accepted {
    Job(Uuid),
    Done,
}

pub struct ApiClient {
    base_url: String,
    http: Client,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        let http = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    #[instrument(skip(self))]
    pub fn list_vms(&self) -> Result<Vec<Vm>, ApiError> {
        let response = check(self.http.get(self.url("/vms")).send()?)?;
        Ok(response.json()?)
    }

    #[instrument(skip(self))]
    pub fn get_vm(&self, vmid: VmId) -> Result<Vm, ApiError> {
        let response = check(self.http.get(self.url(&format!("/vms/{vmid}"))).send()?)?;
        Ok(response.json()?)
    }

    #[instrument(skip(self))]
    pub fn delete_vm(&self, vmid: VmId) -> Result<(), ApiError> {
        check(self.http.delete(self.url(&format!("/vms/{vmid}"))).send()?)?;
        info!("VM {} deleted", vmid);
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn vm_action(&self, vmid: VmId, action: VmAction) -> Result<Accepted, ApiError> {
        let url = self.url(&format!("/vms/{vmid}/{}", action.as_str()));
        let response = check(self.http.post(url).send()?)?;
        let body = response.text()?;
        Ok(parse_accepted(&body))
    }

    pub fn get_job(&self, id: Uuid) -> Result<Job, ApiError> {
        let response = check(self.http.get(self.url(&format!("/jobs/{id}"))).send()?)?;
        Ok(response.json()?)
    }

    /// Poll a job until it completes or fails.
    pub fn wait_for_job(&self, id: Uuid, timeout: Duration) -> Result<Job, ApiError> {
        let deadline = Instant::now() + timeout;
        loop {
            let job = self.get_job(id)?;
            debug!(job_id = %id, status = ?job.status, progress = ?job.progress, "polled job");
            match job.status {
                JobStatus::Completed => return Ok(job),
                JobStatus::Failed => {
                    return Err(ApiError::JobFailed {
                        id,
                        error: job.error.unwrap_or_else(|| "unknown error".to_string()),
                    });
                }
                JobStatus::Pending | JobStatus::Running => {}
            }
            if Instant::now() >= deadline {
                return Err(ApiError::WaitTimeout(timeout, format!("job {id}")));
            }
            sleep(POLL_INTERVAL);
        }
    }

    /// Poll a VM until it reports `status`.
    pub fn wait_for_status(
        &self,
        vmid: VmId,
        status: VmStatus,
        timeout: Duration,
    ) -> Result<Vm, ApiError> {
        let deadline = Instant::now() + timeout;
        loop {
            let vm = self.get_vm(vmid)?;
            if vm.status == status {
                return Ok(vm);
            }
            if Instant::now() >= deadline {
                return Err(ApiError::WaitTimeout(
                    timeout,
                    format!("VM {vmid} to become {status}"),
                ));
            }
            sleep(POLL_INTERVAL);
        }
    }
}

fn check(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(ApiError::NotFound);
    }
    let body = response.text().unwrap_or_default();
    Err(ApiError::Status { status, body })
}

fn parse_accepted(body: &str) -> Accepted {
    serde_json::from_str::<ActionResponse>(body)
        .ok()
        .and_then(|r| r.job_id)
        .map_or(Accepted::Done, Accepted::Job)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_targets() {
        assert_eq!(VmAction::Start.target_status(), VmStatus::Running);
        assert_eq!(VmAction::Resume.target_status(), VmStatus::Running);
        assert_eq!(VmAction::Stop.target_status(), VmStatus::Shutdown);
        assert_eq!(VmAction::Pause.target_status(), VmStatus::Paused);
    }

    #[test]
    fn accepted_job_is_detected() {
        let id = Uuid::new_v4();
        let body = format!("{{\"job_id\": \"{id}\"}}");
        assert_eq!(parse_accepted(&body), Accepted::Job(id));
        assert_eq!(parse_accepted(""), Accepted::Done);
        assert_eq!(parse_accepted("{}"), Accepted::Done);
        assert_eq!(parse_accepted("\"ok\""), Accepted::Done);
    }

    #[test]
    fn base_url_is_normalized() {
        let client = ApiClient::new("http://localhost:8000/").unwrap();
        assert_eq!(client.url("/vms"), "http://localhost:8000/vms");
    }

    #[test]
    fn vm_deserializes_from_api_shape() {
        let vm: Vm = serde_json::from_str(
            r#"{"vmid": 100, "name": "web01", "status": "running", "boot_vcpus": 2}"#,
        )
        .unwrap();
        assert_eq!(vm.vmid, 100);
        assert_eq!(vm.status, VmStatus::Running);
        assert_eq!(vm.memory_size, None);
    }
}
