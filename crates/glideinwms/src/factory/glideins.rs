//! Keeps the glidein queue of one entry in line with the frontend requests.

use std::collections::BTreeMap;
use std::time::Duration;

use gwms_core::batch::extract::{
    ExtractLimits, held_recoverable, held_recoverable_within_limits, held_unrecoverable,
    idle_queued, idle_unsubmitted, running, stale_idle, stale_running,
};
use gwms_core::batch::{
    ATTR_GLIDEIN_CREDENTIAL, ATTR_GLIDEIN_FRONTEND, BatchSystem, GlideinJob, JobId, JobSpec,
    JobStatus, jobs_constraint,
};
use gwms_core::classad::{AdValue, ClassAd, PARAM_PREFIX};
use gwms_core::credentials::SubmitBundle;

use crate::common::removal::RemovalMode;
use crate::factory::config::EntryConfig;
use crate::factory::totals::{Counts, GlideinTotals};

const ATTR_IDLE_LIFETIME: &str = "GlideinIdleLifetime";

/// A decrypted and validated request of one client made with one credential.
#[derive(Debug, Clone, Default)]
pub struct ClientRequest {
    /// Client name of the frontend group
    pub client: String,
    /// `<security name>:<security class>`
    pub frontend: String,
    pub idle: i64,
    pub max_run: i64,
    pub idle_lifetime: Duration,
    pub removal: RemovalMode,
    pub margin: i64,
    pub params: BTreeMap<String, AdValue>,
}

pub struct GlideinDriver<'a> {
    entry: &'a EntryConfig,
    batch: &'a dyn BatchSystem,
    limits: ExtractLimits,
    now: i64,
}

impl<'a> GlideinDriver<'a> {
    pub fn new(entry: &'a EntryConfig, batch: &'a dyn BatchSystem, now: i64) -> Self {
        GlideinDriver {
            entry,
            batch,
            limits: entry.extract_limits(),
            now,
        }
    }

    async fn remove(&self, jobs: &[&GlideinJob], what: &str) -> bool {
        if jobs.is_empty() {
            return false;
        }
        let ids: Vec<JobId> = jobs.iter().map(|job| job.id).collect();
        match self.batch.remove(jobs_constraint(&ids), false).await {
            Ok(()) => {
                log::info!("entry {}: removed {} {what} glidein(s)", self.entry.name, ids.len());
                true
            }
            Err(error) => {
                log::warn!("entry {}: removing {what} glideins failed: {error:?}", self.entry.name);
                false
            }
        }
    }

    async fn release(&self, jobs: &[&GlideinJob]) -> bool {
        if jobs.is_empty() {
            return false;
        }
        let ids: Vec<JobId> = jobs.iter().map(|job| job.id).collect();
        match self.batch.release(jobs_constraint(&ids)).await {
            Ok(()) => {
                log::info!("entry {}: released {} held glidein(s)", self.entry.name, ids.len());
                true
            }
            Err(error) => {
                log::warn!("entry {}: releasing glideins failed: {error:?}", self.entry.name);
                false
            }
        }
    }

    /// Submits or removes glideins of one request; returns the number submitted.
    pub async fn keep_idle_glideins(
        &self,
        client_queue: &[GlideinJob],
        request: &ClientRequest,
        bundle: &SubmitBundle,
        totals: &mut GlideinTotals,
    ) -> u64 {
        let queue: Vec<GlideinJob> = client_queue
            .iter()
            .filter(|job| job.credential_id == bundle.id)
            .cloned()
            .collect();
        let frontend = request.frontend.as_str();

        if totals.has_sec_class_exceeded_max_held(frontend) {
            let fe = totals.frontend(frontend);
            log::info!(
                "entry {}: too many held glideins for {frontend}: held={}, max_held={}",
                self.entry.name,
                fe.counts.held,
                fe.max_held
            );
            self.sanitize_glideins(client_queue).await;
            return 0;
        }

        let counts = queue_counts(&queue);
        let mut add = request.idle - counts.idle;
        if add <= 0 {
            log::debug!(
                "entry {}: have enough glideins for {}: idle={}, req_idle={}",
                self.entry.name,
                request.client,
                counts.idle,
                request.idle
            );
            self.clean_glidein_queue(&queue, request, totals).await;
            return 0;
        }
        if counts.total() + add >= request.max_run {
            add = request.max_run - counts.total();
            if add <= 0 {
                log::debug!(
                    "entry {}: request max glideins {} reached for {}",
                    self.entry.name,
                    request.max_run,
                    request.client
                );
                self.clean_glidein_queue(&queue, request, totals).await;
                return 0;
            }
        }
        add = totals.can_add_idle_glideins(add, frontend);
        if add <= 0 {
            log::info!(
                "entry {}: {} idle glideins requested by {frontend} exceed the entry limits, not submitting",
                self.entry.name,
                request.idle
            );
            self.clean_glidein_queue(&queue, request, totals).await;
            return 0;
        }
        let add = add.min(self.entry.limits.max_submits as i64);

        match self.batch.submit(self.job_spec(request, bundle, add as u32)).await {
            Ok(ids) => {
                log::info!(
                    "entry {}: submitted {} glidein(s) for {}",
                    self.entry.name,
                    ids.len(),
                    request.client
                );
                totals.add_idle_glideins(ids.len() as i64, frontend);
                ids.len() as u64
            }
            Err(error) => {
                log::warn!("entry {}: submission for {} failed: {error:?}", self.entry.name, request.client);
                0
            }
        }
    }

    fn job_spec(&self, request: &ClientRequest, bundle: &SubmitBundle, count: u32) -> JobSpec {
        let mut attrs = ClassAd::default();
        attrs.insert(ATTR_GLIDEIN_FRONTEND, request.frontend.as_str());
        attrs.insert(ATTR_GLIDEIN_CREDENTIAL, bundle.id.as_str());
        attrs.insert(ATTR_IDLE_LIFETIME, request.idle_lifetime.as_secs());
        let mut params = self.entry.params.clone();
        params.extend(request.params.iter().map(|(k, v)| (k.clone(), v.clone())));
        attrs.set_typed(PARAM_PREFIX, &params);

        let mut environment = bundle.environment();
        environment.push(("GLIDEIN_COUNT".to_string(), count.to_string()));
        environment.push(("GLIDEIN_FRONTEND_NAME".to_string(), request.frontend.clone()));
        for (name, value) in &bundle.parameters {
            environment.push((format!("GLIDEIN_PARAM_{name}"), value.clone()));
        }
        JobSpec {
            entry: self.entry.name.clone(),
            client: request.client.clone(),
            count,
            submit_username: bundle.username.clone(),
            submit_file: self.entry.submit_file.clone(),
            credential_files: bundle.credential_files(),
            environment,
            attrs,
        }
    }

    /// Removes excess glideins according to the requested mode; returns whether anything was removed.
    pub async fn clean_glidein_queue(
        &self,
        queue: &[GlideinJob],
        request: &ClientRequest,
        totals: &GlideinTotals,
    ) -> bool {
        let fe = totals.frontend(&request.frontend).counts;
        let mode = request.removal;
        let remove_wait = mode >= RemovalMode::Wait;
        let remove_idle = mode >= RemovalMode::Idle;
        let remove_running = mode >= RemovalMode::All;

        let target_idle = request.idle + request.margin;
        let target_total = request.max_run + request.margin;
        let too_many_idle = remove_wait && fe.idle > target_idle;
        let too_many_total = remove_running && fe.running + fe.idle > target_total;

        if too_many_idle || too_many_total {
            let mut remove_nr = fe.idle - target_idle;
            if too_many_total {
                remove_nr = remove_nr.max(fe.running + fe.idle - target_total);
            }
            let remove_nr = remove_nr.max(0) as usize;

            let unsubmitted = idle_unsubmitted(queue);
            if remove_wait && !unsubmitted.is_empty() {
                log::info!(
                    "entry {}: too many glideins for {}: req_idle={}, idle={}, unsubmitted={}",
                    self.entry.name,
                    request.client,
                    request.idle,
                    fe.idle,
                    unsubmitted.len()
                );
                let take = remove_nr.min(unsubmitted.len());
                if take > 0 {
                    return self.remove(&unsubmitted[..take], "unsubmitted idle").await;
                }
            }
            let queued = idle_queued(queue);
            if remove_idle && !queued.is_empty() {
                let take = remove_nr.min(queued.len());
                if take > 0 {
                    return self.remove(&queued[..take], "idle").await;
                }
            }
            if remove_running {
                log::info!(
                    "entry {}: too many glideins for {}: idle={}, running={}, max_run={}",
                    self.entry.name,
                    request.client,
                    fe.idle,
                    fe.running,
                    request.max_run
                );
                let running = running(queue);
                let mut victims: Vec<&GlideinJob> =
                    running[..remove_nr.min(running.len())].to_vec();
                victims.extend(held_unrecoverable(queue, &self.limits));
                victims.extend(held_recoverable(queue, &self.limits));
                return self.remove(&victims, "running and held").await;
            }
        } else if remove_running && request.max_run == 0 && fe.held > 0 {
            let mut held = held_unrecoverable(queue, &self.limits);
            held.extend(held_recoverable(queue, &self.limits));
            return self.remove(&held, "held").await;
        }
        false
    }

    /// Cleans stale and broken glideins and releases the recoverable ones.
    pub async fn sanitize_glideins(&self, queue: &[GlideinJob]) -> bool {
        let mut sanitized = false;
        let stale = stale_idle(queue, &self.limits, self.now);
        if !stale.is_empty() {
            log::warn!("entry {}: found {} stale idle glideins", self.entry.name, stale.len());
            self.remove(&stale, "stale idle").await;
            sanitized = true;
        }
        let stale = stale_running(queue, &self.limits, self.now);
        if !stale.is_empty() {
            log::warn!(
                "entry {}: found {} glideins running longer than {}",
                self.entry.name,
                stale.len(),
                humantime::format_duration(self.limits.stale_running_age)
            );
            self.remove(&stale, "stale running").await;
            sanitized = true;
        }
        let unrecoverable = held_unrecoverable(queue, &self.limits);
        if !unrecoverable.is_empty() {
            log::warn!(
                "entry {}: found {} unrecoverable held glideins",
                self.entry.name,
                unrecoverable.len()
            );
            self.remove(&unrecoverable, "unrecoverable held").await;
            sanitized = true;
        }
        let recoverable = held_recoverable(queue, &self.limits);
        if !recoverable.is_empty() {
            let within = held_recoverable_within_limits(queue, &self.limits, self.now);
            log::warn!(
                "entry {}: found {} held glideins, {} within limits",
                self.entry.name,
                recoverable.len(),
                within.len()
            );
            self.release(&within).await;
            sanitized = true;
        }
        sanitized
    }
}

fn queue_counts(queue: &[GlideinJob]) -> Counts {
    let mut counts = Counts::default();
    for job in queue {
        match job.status {
            JobStatus::Idle => counts.idle += 1,
            JobStatus::Running => counts.running += 1,
            JobStatus::Held => counts.held += 1,
            _ => {}
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::config::SubmitLimits;
    use crate::factory::totals::tests::job;
    use gwms_core::batch::MemoryBatchSystem;
    use std::path::PathBuf;

    const NOW: i64 = 1_700_000_000;

    fn entry() -> EntryConfig {
        let mut entry: EntryConfig = toml::from_str(
            r#"
name = "CE_a"
gridtype = "condor"
gatekeeper = "ce.example.org"
"#,
        )
        .unwrap();
        entry.limits = SubmitLimits {
            max_submits: 5,
            ..Default::default()
        };
        entry
    }

    fn request(idle: i64, max_run: i64, removal: RemovalMode) -> ClientRequest {
        ClientRequest {
            client: "fe.main".to_string(),
            frontend: "fe:main".to_string(),
            idle,
            max_run,
            idle_lifetime: Duration::from_secs(3600),
            removal,
            margin: 0,
            params: Default::default(),
        }
    }

    fn bundle() -> SubmitBundle {
        SubmitBundle::new("pilot", "main", "cred", PathBuf::from("/creds/pilot"))
    }

    fn populated(jobs: &[GlideinJob]) -> MemoryBatchSystem {
        let batch = MemoryBatchSystem::new();
        for job in jobs {
            let mut ad = ClassAd::default();
            ad.insert("ClusterId", job.id.cluster);
            ad.insert("ProcId", job.id.proc);
            ad.insert("JobStatus", job.status.code());
            batch.add_job(ad);
        }
        batch
    }

    fn queue(statuses: &[JobStatus]) -> Vec<GlideinJob> {
        statuses
            .iter()
            .enumerate()
            .map(|(index, status)| {
                let mut job = job(index as u64 + 1, *status, "fe:main");
                job.entered_status = NOW - 60;
                job
            })
            .collect()
    }

    #[tokio::test]
    async fn submits_missing_idle_capped_by_max_submits() {
        let entry = entry();
        let batch = MemoryBatchSystem::new();
        let queue = queue(&[JobStatus::Idle, JobStatus::Running]);
        let mut totals = GlideinTotals::new(&entry.limits, vec![], &queue);
        let driver = GlideinDriver::new(&entry, &batch, NOW);

        let submitted = driver
            .keep_idle_glideins(&queue, &request(20, 100, RemovalMode::No), &bundle(), &mut totals)
            .await;
        assert_eq!(submitted, 5);
        let spec = &batch.submissions()[0];
        assert_eq!(spec.submit_username, "pilot");
        assert_eq!(spec.attrs.get_str(ATTR_GLIDEIN_FRONTEND), Some("fe:main"));
        assert_eq!(spec.attrs.get_str(ATTR_GLIDEIN_CREDENTIAL), Some("cred"));
        assert!(spec.environment.contains(&("GLIDEIN_COUNT".to_string(), "5".to_string())));
        assert_eq!(totals.frontend("fe:main").counts.idle, 6);
    }

    #[tokio::test]
    async fn never_exceeds_max_run() {
        let entry = entry();
        let batch = MemoryBatchSystem::new();
        let queue = queue(&[JobStatus::Running, JobStatus::Running, JobStatus::Held]);
        let mut totals = GlideinTotals::new(&entry.limits, vec![], &queue);
        let driver = GlideinDriver::new(&entry, &batch, NOW);

        let submitted = driver
            .keep_idle_glideins(&queue, &request(4, 4, RemovalMode::No), &bundle(), &mut totals)
            .await;
        assert_eq!(submitted, 1);

        let submitted = driver
            .keep_idle_glideins(&queue, &request(4, 3, RemovalMode::No), &bundle(), &mut totals)
            .await;
        assert_eq!(submitted, 0);
        assert_eq!(batch.submitted_count(), 1);
    }

    #[tokio::test]
    async fn other_credentials_are_not_counted() {
        let entry = entry();
        let batch = MemoryBatchSystem::new();
        let mut queue = queue(&[JobStatus::Idle, JobStatus::Idle]);
        queue[1].credential_id = "other".to_string();
        let mut totals = GlideinTotals::new(&entry.limits, vec![], &queue);
        let driver = GlideinDriver::new(&entry, &batch, NOW);
        let submitted = driver
            .keep_idle_glideins(&queue, &request(2, 10, RemovalMode::No), &bundle(), &mut totals)
            .await;
        assert_eq!(submitted, 1);
    }

    #[tokio::test]
    async fn removal_modes() {
        let entry = entry();
        let mut jobs = queue(&[JobStatus::Idle, JobStatus::Idle, JobStatus::Idle, JobStatus::Running]);
        jobs[2].grid_status = Some("IDLE".to_string());
        let totals = GlideinTotals::new(&entry.limits, vec![], &jobs);

        let batch = populated(&jobs);
        let driver = GlideinDriver::new(&entry, &batch, NOW);
        assert!(!driver.clean_glidein_queue(&jobs, &request(0, 10, RemovalMode::No), &totals).await);
        assert!(driver.clean_glidein_queue(&jobs, &request(1, 10, RemovalMode::Wait), &totals).await);
        assert_eq!(batch.removed(), vec![JobId::new(1, 0), JobId::new(2, 0)]);

        let batch = populated(&jobs);
        let driver = GlideinDriver::new(&entry, &batch, NOW);
        let mut margin = request(1, 10, RemovalMode::Wait);
        margin.margin = 2;
        assert!(!driver.clean_glidein_queue(&jobs, &margin, &totals).await);

        let only_queued = vec![jobs[2].clone(), jobs[3].clone()];
        let batch = populated(&only_queued);
        let driver = GlideinDriver::new(&entry, &batch, NOW);
        let queued_totals = GlideinTotals::new(&entry.limits, vec![], &only_queued);
        assert!(
            driver
                .clean_glidein_queue(&only_queued, &request(0, 10, RemovalMode::Idle), &queued_totals)
                .await
        );
        assert_eq!(batch.removed(), vec![JobId::new(3, 0)]);

        let running = vec![jobs[3].clone()];
        let batch = populated(&running);
        let driver = GlideinDriver::new(&entry, &batch, NOW);
        let running_totals = GlideinTotals::new(&entry.limits, vec![], &running);
        assert!(
            driver
                .clean_glidein_queue(&running, &request(0, 0, RemovalMode::All), &running_totals)
                .await
        );
        assert_eq!(batch.removed(), vec![JobId::new(4, 0)]);
    }

    #[tokio::test]
    async fn sanitize_removes_and_releases() {
        let entry = entry();
        let mut jobs = queue(&[JobStatus::Idle, JobStatus::Held, JobStatus::Held, JobStatus::Running]);
        jobs[0].entered_status = NOW - 8 * 24 * 3600;
        jobs[1].hold_code = Some(2);
        jobs[1].hold_subcode = Some(22);
        jobs[2].system_holds = 1;
        jobs[2].entered_status = NOW - 3600;
        let batch = populated(&jobs);
        let driver = GlideinDriver::new(&entry, &batch, NOW);
        assert!(driver.sanitize_glideins(&jobs).await);
        assert_eq!(batch.removed(), vec![JobId::new(1, 0), JobId::new(2, 0)]);
        assert_eq!(
            batch.jobs().iter().filter(|ad| ad.get_int("JobStatus") == Some(1)).count(),
            1
        );
        assert!(!driver.sanitize_glideins(&[jobs[3].clone()]).await);
    }
}
