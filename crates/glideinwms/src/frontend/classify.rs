use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use gwms_core::batch::{ATTR_ENTERED_STATUS, ATTR_JOB_STATUS, JobStatus};
use gwms_core::classad::{AdValue, ClassAd};

use crate::matching::{Expr, GlideinView, Scope};

pub const ATTR_GLIDECLIENT_NAME: &str = "GLIDECLIENT_Name";
pub const ATTR_CREDENTIAL_IDENTIFIER: &str = "GLIDEIN_CredentialIdentifier";
pub const ATTR_VOMS_FQAN: &str = "x509UserProxyFirstFQAN";

const OLD_IDLE_AGE: i64 = 600;
const IDLE_3600_AGE: i64 = 3600;

/// Schedulers whose idle jobs must not drive requests in this iteration.
pub fn blacklisted_schedds(
    schedd_ads: &[ClassAd],
    group_schedds: &[String],
    threshold: f64,
) -> BTreeSet<String> {
    let mut result = BTreeSet::new();
    for ad in schedd_ads {
        let Some(name) = ad.name() else {
            continue;
        };
        if !group_schedds.iter().any(|schedd| schedd == name) {
            continue;
        }
        if let Some(reason) = backpressure_reason(ad, threshold) {
            log::info!("Schedd {name} is blacklisted: {reason}");
            result.insert(name.to_string());
        }
    }
    result
}

fn backpressure_reason(ad: &ClassAd, threshold: f64) -> Option<String> {
    let limit = |max: i64| (max as f64 * threshold + 0.5) as i64;
    if let Some(max_running) = ad.get_int("MaxJobsRunning") {
        let current = ad.get_int("TotalRunningJobs").unwrap_or(0)
            + ad.get_int("TotalSchedulerJobsRunning").unwrap_or(0);
        let running_max = limit(max_running);
        if current >= running_max {
            return Some(format!("{current} running jobs, limit {running_max}"));
        }
    }
    let max_uploading = ad.get_int("TransferQueueMaxUploading").unwrap_or(0);
    if max_uploading > 0 {
        let uploading = ad.get_int("TransferQueueNumUploading").unwrap_or(0);
        let uploading_max = limit(max_uploading);
        if uploading >= uploading_max {
            return Some(format!("{uploading} uploads, limit {uploading_max}"));
        }
    }
    let curbed = match ad.get("CurbMatchmaking") {
        Some(AdValue::Bool(value)) => *value,
        Some(AdValue::String(value)) => value.trim().eq_ignore_ascii_case("true"),
        _ => false,
    };
    curbed.then(|| "CurbMatchmaking".to_string())
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JobClass {
    /// Idle at any scheduler
    IdleAll,
    /// Idle at an admitted scheduler
    Idle,
    OldIdle,
    Idle3600,
    VomsIdle,
    Running,
}

impl JobClass {
    pub const ALL: [JobClass; 6] = [
        JobClass::IdleAll,
        JobClass::Idle,
        JobClass::OldIdle,
        JobClass::Idle3600,
        JobClass::VomsIdle,
        JobClass::Running,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobClass::IdleAll => "IdleAll",
            JobClass::Idle => "Idle",
            JobClass::OldIdle => "OldIdle",
            JobClass::Idle3600 => "Idle_3600",
            JobClass::VomsIdle => "VomsIdle",
            JobClass::Running => "Running",
        }
    }
}

impl Display for JobClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type JobClasses = BTreeMap<JobClass, Vec<ClassAd>>;

fn job_status(job: &ClassAd) -> Option<JobStatus> {
    job.get_int(ATTR_JOB_STATUS).and_then(JobStatus::from_code)
}

/// Splits the jobs of every scheduler into the classes used by matching.
pub fn classify_jobs(
    jobs: &BTreeMap<String, Vec<ClassAd>>,
    blacklisted: &BTreeSet<String>,
    now: i64,
) -> JobClasses {
    let mut classes: JobClasses = JobClass::ALL.iter().map(|c| (*c, Vec::new())).collect();
    let mut push = |class: JobClass, job: &ClassAd| {
        if let Some(list) = classes.get_mut(&class) {
            list.push(job.clone());
        }
    };
    for (schedd, schedd_jobs) in jobs {
        let admitted = !blacklisted.contains(schedd);
        for job in schedd_jobs {
            match job_status(job) {
                Some(JobStatus::Idle) => {
                    push(JobClass::IdleAll, job);
                    if !admitted {
                        continue;
                    }
                    push(JobClass::Idle, job);
                    let age = job
                        .get_int(ATTR_ENTERED_STATUS)
                        .map(|entered| now - entered)
                        .unwrap_or(0);
                    if age >= OLD_IDLE_AGE {
                        push(JobClass::OldIdle, job);
                    }
                    if age >= IDLE_3600_AGE {
                        push(JobClass::Idle3600, job);
                    }
                    if job.contains(ATTR_VOMS_FQAN) {
                        push(JobClass::VomsIdle, job);
                    }
                }
                Some(JobStatus::Running) => push(JobClass::Running, job),
                _ => {}
            }
        }
    }
    classes
}

/// Keeps the jobs selected by a group's job query expression.
pub fn filter_jobs(jobs: Vec<ClassAd>, expr: &Expr) -> Vec<ClassAd> {
    let empty = GlideinView::default();
    jobs.into_iter()
        .filter(|job| {
            expr.matches(&Scope { job, glidein: &empty })
                .unwrap_or_else(|error| {
                    log::debug!("Job query expression failed: {error}");
                    false
                })
        })
        .collect()
}

fn is_partitionable(slot: &ClassAd) -> bool {
    slot.get_bool("PartitionableSlot").unwrap_or(false)
        || slot.get_str("SlotType") == Some("Partitionable")
}

fn is_dynamic(slot: &ClassAd) -> bool {
    slot.get_str("SlotType") == Some("Dynamic")
}

fn state_is(slot: &ClassAd, state: &str, activities: &[&str]) -> bool {
    slot.get_str("State") == Some(state)
        && slot
            .get_str("Activity")
            .is_some_and(|activity| activities.contains(&activity))
}

pub fn is_idle_slot(slot: &ClassAd, min_pslot_memory: i64) -> bool {
    if !state_is(slot, "Unclaimed", &["Idle"]) {
        return false;
    }
    !is_partitionable(slot)
        || slot.get_int("TotalSlots") == Some(1)
        || (slot.get_int("Cpus").unwrap_or(0) > 0
            && slot
                .get_int("Memory")
                .is_none_or(|memory| memory > min_pslot_memory))
}

pub fn is_running_slot(slot: &ClassAd) -> bool {
    (state_is(slot, "Claimed", &["Busy", "Retiring"]) && !is_dynamic(slot))
        || (is_partitionable(slot) && slot.get_int("TotalSlots").unwrap_or(0) > 1)
}

pub fn is_failed_slot(slot: &ClassAd) -> bool {
    state_is(slot, "Drained", &["Retiring"])
}

fn cpus(slot: &ClassAd) -> u64 {
    slot.get_int("Cpus").unwrap_or(0).max(0) as u64
}

fn total_cpus(slot: &ClassAd) -> u64 {
    slot.get_int("TotalCpus").map(|c| c.max(0) as u64).unwrap_or_else(|| cpus(slot))
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct SlotCounts {
    pub total: u64,
    pub idle: u64,
    pub running: u64,
    pub failed: u64,
    pub total_cores: u64,
    pub idle_cores: u64,
    pub running_cores: u64,
}

/// Counts glidein slots; dynamic slots are covered by their partitionable parent.
pub fn count_slots<'a, I: IntoIterator<Item = &'a ClassAd>>(
    slots: I,
    min_pslot_memory: i64,
) -> SlotCounts {
    let mut counts = SlotCounts::default();
    for slot in slots {
        if is_dynamic(slot) {
            continue;
        }
        let partitionable = is_partitionable(slot);
        counts.total += 1;
        counts.total_cores += if partitionable { total_cpus(slot) } else { cpus(slot) };
        if is_idle_slot(slot, min_pslot_memory) {
            counts.idle += 1;
            counts.idle_cores += cpus(slot);
        }
        if is_running_slot(slot) {
            counts.running += 1;
            counts.running_cores += if partitionable {
                total_cpus(slot).saturating_sub(cpus(slot))
            } else {
                cpus(slot)
            };
        }
        if is_failed_slot(slot) {
            counts.failed += 1;
        }
    }
    counts
}

/// `<entry>@<glidein>@<factory>` of the entry a slot was started from.
pub fn slot_request_name(slot: &ClassAd) -> Option<String> {
    Some(format!(
        "{}@{}@{}",
        slot.get_str("GLIDEIN_Entry_Name")?,
        slot.get_str("GLIDEIN_Name")?,
        slot.get_str("GLIDEIN_Factory")?
    ))
}

pub fn slot_client(slot: &ClassAd) -> Option<&str> {
    slot.get_str(ATTR_GLIDECLIENT_NAME)
}

pub fn slot_credential(slot: &ClassAd) -> Option<&str> {
    slot.get_str(ATTR_CREDENTIAL_IDENTIFIER)
}

/// Slots started for a frontend, any group.
pub fn frontend_slots<'a>(slots: &'a [ClassAd], frontend: &str) -> Vec<&'a ClassAd> {
    let prefix = format!("{frontend}.");
    slots
        .iter()
        .filter(|slot| slot_client(slot).is_some_and(|client| client.starts_with(&prefix)))
        .collect()
}

/// Slots started for one client (`<frontend>.<group>`), grouped by entry request name.
pub fn slots_by_entry<'a>(
    slots: &'a [ClassAd],
    client_name: &str,
) -> BTreeMap<String, Vec<&'a ClassAd>> {
    let mut result: BTreeMap<String, Vec<&ClassAd>> = BTreeMap::new();
    for slot in slots {
        if slot_client(slot) != Some(client_name) {
            continue;
        }
        if let Some(request_name) = slot_request_name(slot) {
            result.entry(request_name).or_default().push(slot);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use gwms_core::classad::AdType;

    fn schedd(name: &str, attrs: &[(&str, AdValue)]) -> ClassAd {
        let mut ad = ClassAd::new(AdType::Schedd, name);
        for (key, value) in attrs {
            ad.insert(*key, value.clone());
        }
        ad
    }

    #[test]
    fn schedd_backpressure() {
        let names: Vec<String> = ["a", "b", "c", "d", "e"].iter().map(|s| s.to_string()).collect();
        let ads = vec![
            schedd(
                "a",
                &[
                    ("MaxJobsRunning", 100.into()),
                    ("TotalRunningJobs", 90.into()),
                    ("TotalSchedulerJobsRunning", 5.into()),
                ],
            ),
            schedd(
                "b",
                &[
                    ("MaxJobsRunning", 100.into()),
                    ("TotalRunningJobs", 94.into()),
                ],
            ),
            schedd(
                "c",
                &[
                    ("TransferQueueMaxUploading", 10.into()),
                    ("TransferQueueNumUploading", 10.into()),
                ],
            ),
            schedd(
                "d",
                &[
                    ("TransferQueueMaxUploading", 0.into()),
                    ("TransferQueueNumUploading", 10.into()),
                    ("CurbMatchmaking", "TRUE".into()),
                ],
            ),
            schedd("e", &[("CurbMatchmaking", false.into())]),
            schedd("other", &[("CurbMatchmaking", true.into())]),
        ];
        let blacklisted = blacklisted_schedds(&ads, &names, 0.95);
        assert_eq!(
            blacklisted.into_iter().collect::<Vec<_>>(),
            vec!["a".to_string(), "c".to_string(), "d".to_string()]
        );
        assert_eq!(blacklisted_schedds(&ads, &names, 0.9).len(), 4);
    }

    fn job(status: i64, entered: i64) -> ClassAd {
        let mut ad = ClassAd::default();
        ad.insert(ATTR_JOB_STATUS, status);
        ad.insert(ATTR_ENTERED_STATUS, entered);
        ad
    }

    #[test]
    fn job_classes() {
        let now = 10_000;
        let mut voms = job(1, now - 4000);
        voms.insert(ATTR_VOMS_FQAN, "/cms/Role=NULL");
        let jobs = BTreeMap::from([
            (
                "good".to_string(),
                vec![job(1, now - 10), job(1, now - 700), voms, job(2, now), job(5, now)],
            ),
            ("bad".to_string(), vec![job(1, now - 5000), job(2, now)]),
        ]);
        let classes = classify_jobs(&jobs, &BTreeSet::from(["bad".to_string()]), now);
        let count = |class| classes[&class].len();
        assert_eq!(count(JobClass::IdleAll), 4);
        assert_eq!(count(JobClass::Idle), 3);
        assert_eq!(count(JobClass::OldIdle), 2);
        assert_eq!(count(JobClass::Idle3600), 1);
        assert_eq!(count(JobClass::VomsIdle), 1);
        assert_eq!(count(JobClass::Running), 2);
    }

    #[test]
    fn job_query_filter() {
        let mut cms = job(1, 0);
        cms.insert("VO", "cms");
        let jobs = vec![cms, job(1, 0)];
        let expr = Expr::parse("job['VO'] == 'cms'").unwrap();
        assert_eq!(filter_jobs(jobs, &expr).len(), 1);
    }

    fn slot(state: &str, activity: &str, attrs: &[(&str, AdValue)]) -> ClassAd {
        let mut ad = ClassAd::default();
        ad.insert("State", state);
        ad.insert("Activity", activity);
        for (key, value) in attrs {
            ad.insert(*key, value.clone());
        }
        ad
    }

    #[test]
    fn slot_counts() {
        let slots = vec![
            slot("Unclaimed", "Idle", &[("Cpus", 1.into())]),
            slot("Claimed", "Busy", &[("Cpus", 2.into())]),
            slot("Claimed", "Retiring", &[("Cpus", 1.into())]),
            slot("Drained", "Retiring", &[("Cpus", 1.into())]),
            // partitionable with free resources and two dynamic children
            slot(
                "Unclaimed",
                "Idle",
                &[
                    ("SlotType", "Partitionable".into()),
                    ("PartitionableSlot", true.into()),
                    ("TotalSlots", 3.into()),
                    ("Cpus", 4.into()),
                    ("TotalCpus", 8.into()),
                    ("Memory", 4000.into()),
                ],
            ),
            slot("Claimed", "Busy", &[("SlotType", "Dynamic".into()), ("Cpus", 2.into())]),
            slot("Claimed", "Busy", &[("SlotType", "Dynamic".into()), ("Cpus", 2.into())]),
            // partitionable without enough memory left
            slot(
                "Unclaimed",
                "Idle",
                &[
                    ("PartitionableSlot", true.into()),
                    ("TotalSlots", 2.into()),
                    ("Cpus", 1.into()),
                    ("TotalCpus", 4.into()),
                    ("Memory", 1000.into()),
                ],
            ),
        ];
        let counts = count_slots(&slots, 2500);
        assert_eq!(
            counts,
            SlotCounts {
                total: 6,
                idle: 2,
                running: 4,
                failed: 1,
                total_cores: 1 + 2 + 1 + 1 + 8 + 4,
                idle_cores: 1 + 4,
                running_cores: 2 + 1 + 4 + 3,
            }
        );
    }

    #[test]
    fn slot_scoping() {
        let mut slots = Vec::new();
        for (client, entry) in [("fe.main", "a"), ("fe.main", "b"), ("fe.other", "a"), ("fe2.main", "a")] {
            let mut ad = slot("Claimed", "Busy", &[]);
            ad.insert(ATTR_GLIDECLIENT_NAME, client);
            ad.insert("GLIDEIN_Entry_Name", entry);
            ad.insert("GLIDEIN_Name", "gfactory");
            ad.insert("GLIDEIN_Factory", "main");
            slots.push(ad);
        }
        assert_eq!(frontend_slots(&slots, "fe").len(), 3);
        let by_entry = slots_by_entry(&slots, "fe.main");
        assert_eq!(by_entry.len(), 2);
        assert_eq!(by_entry["a@gfactory@main"].len(), 1);
    }
}
