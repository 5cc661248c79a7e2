pub mod command;
pub mod extract;
pub mod memory;

use std::fmt::{Display, Formatter};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::ExternalResult;
use crate::adbus::Constraint;
use crate::classad::ClassAd;
use crate::common::error::CoreError;

pub use command::CommandBatchSystem;
pub use memory::MemoryBatchSystem;

pub const ATTR_CLUSTER_ID: &str = "ClusterId";
pub const ATTR_PROC_ID: &str = "ProcId";
pub const ATTR_JOB_STATUS: &str = "JobStatus";
pub const ATTR_GRID_JOB_STATUS: &str = "GridJobStatus";
pub const ATTR_ENTERED_STATUS: &str = "EnteredCurrentStatus";
pub const ATTR_HOLD_CODE: &str = "HoldReasonCode";
pub const ATTR_HOLD_SUBCODE: &str = "HoldReasonSubCode";
pub const ATTR_SYSTEM_HOLDS: &str = "NumSystemHolds";

pub const ATTR_GLIDEIN_FACTORY: &str = "GlideinFactory";
pub const ATTR_GLIDEIN_NAME: &str = "GlideinName";
pub const ATTR_GLIDEIN_ENTRY: &str = "GlideinEntryName";
pub const ATTR_GLIDEIN_CLIENT: &str = "GlideinClient";
pub const ATTR_GLIDEIN_FRONTEND: &str = "GlideinFrontendName";
pub const ATTR_GLIDEIN_CREDENTIAL: &str = "GlideinCredentialIdentifier";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId {
    pub cluster: u64,
    pub proc: u64,
}

impl JobId {
    pub fn new(cluster: u64, proc: u64) -> Self {
        JobId { cluster, proc }
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.cluster, self.proc)
    }
}

/// Selects exactly the given jobs.
pub fn jobs_constraint(ids: &[JobId]) -> Constraint {
    Constraint::Or(
        ids.iter()
            .map(|id| {
                Constraint::eq(ATTR_CLUSTER_ID, id.cluster).and(Constraint::eq(ATTR_PROC_ID, id.proc))
            })
            .collect(),
    )
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Idle,
    Running,
    Removed,
    Completed,
    Held,
    TransferringOutput,
    Suspended,
}

impl JobStatus {
    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            1 => JobStatus::Idle,
            2 => JobStatus::Running,
            3 => JobStatus::Removed,
            4 => JobStatus::Completed,
            5 => JobStatus::Held,
            6 => JobStatus::TransferringOutput,
            7 => JobStatus::Suspended,
            _ => return None,
        })
    }

    pub fn code(&self) -> i64 {
        match self {
            JobStatus::Idle => 1,
            JobStatus::Running => 2,
            JobStatus::Removed => 3,
            JobStatus::Completed => 4,
            JobStatus::Held => 5,
            JobStatus::TransferringOutput => 6,
            JobStatus::Suspended => 7,
        }
    }
}

/// A glidein as seen in the factory's batch queue.
#[derive(Debug, Clone, PartialEq)]
pub struct GlideinJob {
    pub id: JobId,
    pub status: JobStatus,
    /// Status reported by the remote resource; `None` while not yet submitted there.
    pub grid_status: Option<String>,
    pub entry: String,
    pub client: String,
    /// `<frontend security name>:<security class>`
    pub frontend: String,
    pub credential_id: String,
    pub entered_status: i64,
    pub hold_code: Option<i64>,
    pub hold_subcode: Option<i64>,
    pub system_holds: u32,
}

impl GlideinJob {
    pub fn from_ad(ad: &ClassAd) -> crate::Result<Self> {
        let int = |name: &str| {
            ad.get_int(name)
                .ok_or_else(|| CoreError::invalid_input(format!("Job ad is missing {name}")))
        };
        let string = |name: &str| ad.get_str(name).unwrap_or_default().to_string();

        let code = int(ATTR_JOB_STATUS)?;
        let status = JobStatus::from_code(code)
            .ok_or_else(|| CoreError::invalid_input(format!("Unknown job status {code}")))?;
        let grid_status = ad
            .get_str(ATTR_GRID_JOB_STATUS)
            .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("UNSUBMITTED"))
            .map(|s| s.to_string());

        Ok(GlideinJob {
            id: JobId::new(int(ATTR_CLUSTER_ID)? as u64, int(ATTR_PROC_ID)? as u64),
            status,
            grid_status,
            entry: string(ATTR_GLIDEIN_ENTRY),
            client: string(ATTR_GLIDEIN_CLIENT),
            frontend: string(ATTR_GLIDEIN_FRONTEND),
            credential_id: string(ATTR_GLIDEIN_CREDENTIAL),
            entered_status: ad.get_int(ATTR_ENTERED_STATUS).unwrap_or(0),
            hold_code: ad.get_int(ATTR_HOLD_CODE),
            hold_subcode: ad.get_int(ATTR_HOLD_SUBCODE),
            system_holds: ad.get_int(ATTR_SYSTEM_HOLDS).unwrap_or(0).max(0) as u32,
        })
    }

    /// Converts job records, skipping (and logging) the malformed ones.
    pub fn from_ads(ads: &[ClassAd]) -> Vec<GlideinJob> {
        ads.iter()
            .filter_map(|ad| match GlideinJob::from_ad(ad) {
                Ok(job) => Some(job),
                Err(error) => {
                    log::warn!("Ignoring malformed job record: {error}");
                    None
                }
            })
            .collect()
    }
}

/// Request to put `count` glideins into the queue.
#[derive(Debug, Clone, Default)]
pub struct JobSpec {
    pub entry: String,
    pub client: String,
    pub count: u32,
    pub submit_username: String,
    /// Job description of the entry.
    pub submit_file: Option<PathBuf>,
    pub credential_files: Vec<PathBuf>,
    pub environment: Vec<(String, String)>,
    /// Attributes added to every submitted job.
    pub attrs: ClassAd,
}

pub type BatchFuture<T> = Pin<Box<dyn Future<Output = ExternalResult<T>>>>;

/// Client of a local batch submission daemon.
pub trait BatchSystem {
    fn submit(&self, spec: JobSpec) -> BatchFuture<Vec<JobId>>;

    fn remove(&self, constraint: Constraint, force: bool) -> BatchFuture<()>;

    fn release(&self, constraint: Constraint) -> BatchFuture<()>;

    fn query(&self, constraint: Constraint) -> BatchFuture<Vec<ClassAd>>;
}
