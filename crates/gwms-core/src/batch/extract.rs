//! Views over a queue snapshot used by the glidein driver.

use std::time::Duration;

use crate::batch::{GlideinJob, JobStatus};

/// Hold subcodes (with hold code 2) after which a release cannot help.
const UNRECOVERABLE_SUBCODES: [i64; 24] = [
    0, 2, 4, 5, 7, 8, 9, 10, 14, 17, 22, 27, 28, 31, 37, 47, 48, 72, 76, 81, 86, 87, 121, 122,
];

#[derive(Debug, Clone)]
pub struct ExtractLimits {
    pub max_releases: u32,
    pub min_release_time: Duration,
    pub stale_idle_age: Duration,
    pub stale_running_age: Duration,
}

impl Default for ExtractLimits {
    fn default() -> Self {
        ExtractLimits {
            max_releases: 3,
            min_release_time: Duration::from_secs(20 * 60),
            stale_idle_age: Duration::from_secs(7 * 24 * 3600),
            stale_running_age: Duration::from_secs(31 * 24 * 3600),
        }
    }
}

pub fn idle(jobs: &[GlideinJob]) -> Vec<&GlideinJob> {
    jobs.iter().filter(|j| j.status == JobStatus::Idle).collect()
}

/// Idle glideins that never reached the remote resource.
pub fn idle_unsubmitted(jobs: &[GlideinJob]) -> Vec<&GlideinJob> {
    jobs.iter()
        .filter(|j| j.status == JobStatus::Idle && j.grid_status.is_none())
        .collect()
}

/// Idle glideins waiting in the remote queue.
pub fn idle_queued(jobs: &[GlideinJob]) -> Vec<&GlideinJob> {
    jobs.iter()
        .filter(|j| j.status == JobStatus::Idle && j.grid_status.is_some())
        .collect()
}

pub fn running(jobs: &[GlideinJob]) -> Vec<&GlideinJob> {
    jobs.iter()
        .filter(|j| j.status == JobStatus::Running)
        .collect()
}

pub fn held(jobs: &[GlideinJob]) -> Vec<&GlideinJob> {
    jobs.iter().filter(|j| j.status == JobStatus::Held).collect()
}

pub fn is_unrecoverable_held(job: &GlideinJob, limits: &ExtractLimits) -> bool {
    if job.status != JobStatus::Held {
        return false;
    }
    let bad_code = job.hold_code == Some(2)
        && job
            .hold_subcode
            .is_some_and(|code| UNRECOVERABLE_SUBCODES.contains(&code));
    bad_code || job.system_holds > limits.max_releases
}

pub fn held_unrecoverable<'a>(
    jobs: &'a [GlideinJob],
    limits: &ExtractLimits,
) -> Vec<&'a GlideinJob> {
    jobs.iter()
        .filter(|j| is_unrecoverable_held(j, limits))
        .collect()
}

pub fn held_recoverable<'a>(jobs: &'a [GlideinJob], limits: &ExtractLimits) -> Vec<&'a GlideinJob> {
    jobs.iter()
        .filter(|j| j.status == JobStatus::Held && !is_unrecoverable_held(j, limits))
        .collect()
}

/// Recoverable held glideins that have waited long enough for another release; the wait
/// grows with the number of previous holds.
pub fn held_recoverable_within_limits<'a>(
    jobs: &'a [GlideinJob],
    limits: &ExtractLimits,
    now: i64,
) -> Vec<&'a GlideinJob> {
    held_recoverable(jobs, limits)
        .into_iter()
        .filter(|j| {
            let wait = limits.min_release_time.as_secs() as i64 * j.system_holds as i64;
            now - j.entered_status >= wait
        })
        .collect()
}

pub fn stale_idle<'a>(jobs: &'a [GlideinJob], limits: &ExtractLimits, now: i64) -> Vec<&'a GlideinJob> {
    let age = limits.stale_idle_age.as_secs() as i64;
    jobs.iter()
        .filter(|j| j.status == JobStatus::Idle && now - j.entered_status > age)
        .collect()
}

pub fn stale_running<'a>(
    jobs: &'a [GlideinJob],
    limits: &ExtractLimits,
    now: i64,
) -> Vec<&'a GlideinJob> {
    let age = limits.stale_running_age.as_secs() as i64;
    jobs.iter()
        .filter(|j| j.status == JobStatus::Running && now - j.entered_status > age)
        .collect()
}
