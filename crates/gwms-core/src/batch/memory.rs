use std::cell::RefCell;
use std::rc::Rc;

use chrono::Utc;

use crate::adbus::Constraint;
use crate::batch::{
    ATTR_CLUSTER_ID, ATTR_ENTERED_STATUS, ATTR_GLIDEIN_CLIENT, ATTR_GLIDEIN_ENTRY,
    ATTR_JOB_STATUS, ATTR_PROC_ID, BatchFuture, BatchSystem, JobId, JobSpec, JobStatus,
};
use crate::classad::ClassAd;

#[derive(Default)]
struct QueueState {
    jobs: Vec<ClassAd>,
    next_cluster: u64,
    submissions: Vec<JobSpec>,
    removed: Vec<JobId>,
    offline: bool,
}

/// In-process batch queue.
#[derive(Clone, Default)]
pub struct MemoryBatchSystem {
    state: Rc<RefCell<QueueState>>,
}

fn job_id(ad: &ClassAd) -> JobId {
    JobId::new(
        ad.get_int(ATTR_CLUSTER_ID).unwrap_or(0) as u64,
        ad.get_int(ATTR_PROC_ID).unwrap_or(0) as u64,
    )
}

impl MemoryBatchSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.borrow_mut().offline = offline;
    }

    /// Adds a job record as-is; a missing `ClusterId` gets a fresh one.
    pub fn add_job(&self, mut ad: ClassAd) -> JobId {
        let mut state = self.state.borrow_mut();
        if !ad.contains(ATTR_CLUSTER_ID) {
            state.next_cluster += 1;
            ad.insert(ATTR_CLUSTER_ID, state.next_cluster);
            ad.insert(ATTR_PROC_ID, 0);
        }
        let id = job_id(&ad);
        state.jobs.push(ad);
        id
    }

    pub fn set_status(&self, id: JobId, status: JobStatus, entered: i64) {
        let mut state = self.state.borrow_mut();
        for ad in state.jobs.iter_mut().filter(|ad| job_id(ad) == id) {
            ad.insert(ATTR_JOB_STATUS, status.code());
            ad.insert(ATTR_ENTERED_STATUS, entered);
        }
    }

    pub fn jobs(&self) -> Vec<ClassAd> {
        self.state.borrow().jobs.clone()
    }

    pub fn submissions(&self) -> Vec<JobSpec> {
        self.state.borrow().submissions.clone()
    }

    pub fn submitted_count(&self) -> u32 {
        self.state.borrow().submissions.iter().map(|s| s.count).sum()
    }

    pub fn removed(&self) -> Vec<JobId> {
        self.state.borrow().removed.clone()
    }

    fn check_online(&self) -> anyhow::Result<()> {
        if self.state.borrow().offline {
            anyhow::bail!("Schedd is not reachable");
        }
        Ok(())
    }

    fn do_submit(&self, spec: JobSpec) -> anyhow::Result<Vec<JobId>> {
        self.check_online()?;
        let mut state = self.state.borrow_mut();
        state.next_cluster += 1;
        let cluster = state.next_cluster;
        let now = Utc::now().timestamp();
        let mut ids = Vec::with_capacity(spec.count as usize);
        for proc in 0..spec.count as u64 {
            let mut ad = spec.attrs.clone();
            ad.insert(ATTR_CLUSTER_ID, cluster);
            ad.insert(ATTR_PROC_ID, proc);
            ad.insert(ATTR_JOB_STATUS, JobStatus::Idle.code());
            ad.insert(ATTR_ENTERED_STATUS, now);
            ad.insert(ATTR_GLIDEIN_ENTRY, spec.entry.as_str());
            ad.insert(ATTR_GLIDEIN_CLIENT, spec.client.as_str());
            ad.insert("Owner", spec.submit_username.as_str());
            state.jobs.push(ad);
            ids.push(JobId::new(cluster, proc));
        }
        state.submissions.push(spec);
        Ok(ids)
    }

    fn do_remove(&self, constraint: &Constraint) -> anyhow::Result<()> {
        self.check_online()?;
        let mut state = self.state.borrow_mut();
        let (removed, kept): (Vec<ClassAd>, Vec<ClassAd>) = std::mem::take(&mut state.jobs)
            .into_iter()
            .partition(|ad| constraint.matches(ad));
        state.jobs = kept;
        state.removed.extend(removed.iter().map(job_id));
        Ok(())
    }

    fn do_release(&self, constraint: &Constraint) -> anyhow::Result<()> {
        self.check_online()?;
        let mut state = self.state.borrow_mut();
        let now = Utc::now().timestamp();
        for ad in state.jobs.iter_mut() {
            if constraint.matches(ad) && ad.get_int(ATTR_JOB_STATUS) == Some(JobStatus::Held.code()) {
                ad.insert(ATTR_JOB_STATUS, JobStatus::Idle.code());
                ad.insert(ATTR_ENTERED_STATUS, now);
            }
        }
        Ok(())
    }
}

impl BatchSystem for MemoryBatchSystem {
    fn submit(&self, spec: JobSpec) -> BatchFuture<Vec<JobId>> {
        let result = self.do_submit(spec);
        Box::pin(async move { result })
    }

    fn remove(&self, constraint: Constraint, _force: bool) -> BatchFuture<()> {
        let result = self.do_remove(&constraint);
        Box::pin(async move { result })
    }

    fn release(&self, constraint: Constraint) -> BatchFuture<()> {
        let result = self.do_release(&constraint);
        Box::pin(async move { result })
    }

    fn query(&self, constraint: Constraint) -> BatchFuture<Vec<ClassAd>> {
        let result = self.check_online().map(|_| {
            self.state
                .borrow()
                .jobs
                .iter()
                .filter(|ad| constraint.matches(ad))
                .cloned()
                .collect()
        });
        Box::pin(async move { result })
    }
}
