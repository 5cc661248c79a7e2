use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::aggregator::ranges::{JOB_RANGES, MILL_RANGES, TIME_RANGES, job_range, mill_range, time_range};

pub const ATTR_INFO_AGE: &str = "InfoAge";

/// Attributes every entry reports, per client and in total.
pub const STATUS_ATTRS: [&str; 7] = [
    "StatusIdle",
    "StatusRunning",
    "StatusHeld",
    "StatusSubmitted",
    "RequestedIdle",
    "RequestedMaxGlideins",
    ATTR_INFO_AGE,
];

/// Glideins running for less than this never ran a job.
const MIN_CONDOR_DURATION: u64 = 5;

const WASTE_KINDS: [&str; 4] = ["validation", "idle", "nosuccess", "badput"];

pub type StatusAttrs = BTreeMap<String, i64>;

/// What one entry worker saw during its last iteration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryStatus {
    pub entry: String,
    /// Epoch seconds of the iteration
    pub updated: i64,
    pub in_downtime: bool,
    pub totals: StatusAttrs,
    /// Client name -> its attributes
    pub clients: BTreeMap<String, StatusAttrs>,
}

/// Status of every entry of the factory, summed per factory and per frontend client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FactoryStatus {
    pub updated: i64,
    pub entries: BTreeMap<String, StatusAttrs>,
    pub downtime_entries: Vec<String>,
    pub totals: StatusAttrs,
    pub frontends: BTreeMap<String, StatusAttrs>,
}

/// Sums attribute maps; `InfoAge` is averaged over the contributors instead.
#[derive(Default)]
struct Accumulator {
    sums: StatusAttrs,
    age_sum: i64,
    contributors: i64,
}

impl Accumulator {
    fn add(&mut self, attrs: &StatusAttrs, age: i64) {
        for (name, value) in attrs {
            if name != ATTR_INFO_AGE {
                *self.sums.entry(name.clone()).or_default() += value;
            }
        }
        self.age_sum += age;
        self.contributors += 1;
    }

    fn finish(mut self) -> StatusAttrs {
        if self.contributors > 0 {
            self.sums
                .insert(ATTR_INFO_AGE.to_string(), self.age_sum / self.contributors);
        }
        self.sums
    }
}

pub fn aggregate_status(entries: &[EntryStatus], now: i64) -> FactoryStatus {
    let mut status = FactoryStatus {
        updated: now,
        ..Default::default()
    };
    let mut totals = Accumulator::default();
    let mut frontends: BTreeMap<String, Accumulator> = BTreeMap::new();
    for entry in entries {
        let age = (now - entry.updated).max(0);
        let mut attrs = entry.totals.clone();
        attrs.insert(ATTR_INFO_AGE.to_string(), age);
        status.entries.insert(entry.entry.clone(), attrs);
        if entry.in_downtime {
            status.downtime_entries.push(entry.entry.clone());
        }
        totals.add(&entry.totals, age);
        for (client, attrs) in &entry.clients {
            frontends.entry(client.clone()).or_default().add(attrs, age);
        }
    }
    status.totals = totals.finish();
    status.frontends = frontends
        .into_iter()
        .map(|(client, acc)| (client, acc.finish()))
        .collect();
    status
}

/// Exit summary of one glidein that left the queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletedGlidein {
    pub client: String,
    /// Wall time in seconds
    pub duration: u64,
    pub condor_started: bool,
    pub condor_duration: u64,
    #[serde(default)]
    pub validation_duration: Option<u64>,
    pub jobs_nr: u64,
    /// Wall time of all jobs
    pub jobs_duration: u64,
    /// Wall time of jobs that exited with 0
    pub goodput: u64,
    /// Wall time of jobs that exited with anything else
    pub nonzero_exit: u64,
}

/// Per-glidein values the rollup is made of.
#[derive(Debug, Clone, Copy, PartialEq)]
struct GlideinUsage {
    duration: u64,
    condor_duration: u64,
    jobs_nr: u64,
    jobs_duration: u64,
    goodput: u64,
    terminated: u64,
    /// validation, idle, nosuccess, badput
    waste: [f64; 4],
}

impl CompletedGlidein {
    fn usage(&self) -> GlideinUsage {
        let failed = GlideinUsage {
            duration: self.duration,
            condor_duration: 0,
            jobs_nr: 0,
            jobs_duration: 0,
            goodput: 0,
            terminated: 0,
            waste: [1000.0, 0.0, 0.0, 1000.0],
        };
        if !self.condor_started {
            return failed;
        }
        let duration = self.duration.max(self.condor_duration);
        if self.condor_duration < MIN_CONDOR_DURATION {
            return GlideinUsage {
                duration,
                condor_duration: self.condor_duration,
                ..failed
            };
        }
        let validation = self
            .validation_duration
            .unwrap_or_else(|| self.duration.saturating_sub(self.condor_duration));
        let goodput = self.goodput.min(self.jobs_duration);
        let terminated = (goodput + self.nonzero_exit).min(self.jobs_duration);
        let permille = |part: f64, whole: u64| {
            if whole == 0 { 0.0 } else { 1000.0 * part / whole as f64 }
        };
        GlideinUsage {
            duration,
            condor_duration: self.condor_duration,
            jobs_nr: self.jobs_nr,
            jobs_duration: self.jobs_duration,
            goodput,
            terminated,
            waste: [
                permille(validation as f64, duration),
                permille(
                    self.condor_duration as f64 - self.jobs_duration as f64,
                    self.condor_duration,
                ),
                permille((self.jobs_duration - goodput) as f64, self.jobs_duration),
                permille(duration as f64 - terminated as f64, duration),
            ],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CompletedTotals {
    pub glideins: u64,
    pub lasted: u64,
    pub failed_nr: u64,
    pub jobs_nr: u64,
    pub jobs_lasted: u64,
    pub jobs_terminated: u64,
    pub jobs_goodput: u64,
    pub condor_lasted: u64,
}

impl CompletedTotals {
    fn merge(&mut self, other: &CompletedTotals) {
        self.glideins += other.glideins;
        self.lasted += other.lasted;
        self.failed_nr += other.failed_nr;
        self.jobs_nr += other.jobs_nr;
        self.jobs_lasted += other.jobs_lasted;
        self.jobs_terminated += other.jobs_terminated;
        self.jobs_goodput += other.jobs_goodput;
        self.condor_lasted += other.condor_lasted;
    }
}

pub type RangeCounts = BTreeMap<String, u64>;

fn zeroed(ranges: &[&str]) -> RangeCounts {
    ranges.iter().map(|range| (range.to_string(), 0)).collect()
}

fn merge_counts(into: &mut RangeCounts, from: &RangeCounts) {
    for (range, count) in from {
        *into.entry(range.clone()).or_default() += count;
    }
}

/// Completed glideins counted per duration, job number and waste range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CompletedStats {
    pub lasted: RangeCounts,
    pub jobs_nr: RangeCounts,
    pub jobs_duration: RangeCounts,
    pub sum: CompletedTotals,
    /// Waste kind -> glideins per permille range
    pub waste: BTreeMap<String, RangeCounts>,
    /// Waste kind -> glidein seconds per permille range
    pub waste_time: BTreeMap<String, RangeCounts>,
}

impl Default for CompletedStats {
    fn default() -> Self {
        let waste: BTreeMap<String, RangeCounts> = WASTE_KINDS
            .iter()
            .map(|kind| (kind.to_string(), zeroed(&MILL_RANGES)))
            .collect();
        CompletedStats {
            lasted: zeroed(&TIME_RANGES),
            jobs_nr: zeroed(&JOB_RANGES),
            jobs_duration: zeroed(&TIME_RANGES),
            sum: CompletedTotals::default(),
            waste_time: waste.clone(),
            waste,
        }
    }
}

impl CompletedStats {
    pub fn summarize(glideins: &[CompletedGlidein]) -> Self {
        let mut stats = CompletedStats::default();
        for glidein in glideins {
            stats.add(glidein);
        }
        stats
    }

    fn add(&mut self, glidein: &CompletedGlidein) {
        let usage = glidein.usage();
        let sum = &mut self.sum;
        sum.glideins += 1;
        if !glidein.condor_started {
            sum.failed_nr += 1;
        }
        sum.lasted += usage.duration;
        sum.condor_lasted += usage.condor_duration;
        sum.jobs_nr += usage.jobs_nr;
        sum.jobs_lasted += usage.jobs_duration;
        sum.jobs_terminated += usage.terminated;
        sum.jobs_goodput += usage.goodput;

        *self.lasted.entry(time_range(usage.duration as f64)).or_default() += 1;
        *self.jobs_nr.entry(job_range(usage.jobs_nr).to_string()).or_default() += 1;
        let per_job = if usage.jobs_nr > 0 {
            (usage.jobs_duration / usage.jobs_nr) as f64
        } else {
            -1.0
        };
        *self.jobs_duration.entry(time_range(per_job)).or_default() += 1;

        for (kind, permille) in WASTE_KINDS.iter().zip(usage.waste) {
            let range = mill_range(permille).to_string();
            *self
                .waste
                .entry(kind.to_string())
                .or_default()
                .entry(range.clone())
                .or_default() += 1;
            *self
                .waste_time
                .entry(kind.to_string())
                .or_default()
                .entry(range)
                .or_default() += usage.duration;
        }
    }

    pub fn merge(&mut self, other: &CompletedStats) {
        merge_counts(&mut self.lasted, &other.lasted);
        merge_counts(&mut self.jobs_nr, &other.jobs_nr);
        merge_counts(&mut self.jobs_duration, &other.jobs_duration);
        self.sum.merge(&other.sum);
        for (kind, counts) in &other.waste {
            merge_counts(self.waste.entry(kind.clone()).or_default(), counts);
        }
        for (kind, counts) in &other.waste_time {
            merge_counts(self.waste_time.entry(kind.clone()).or_default(), counts);
        }
    }

    /// Flat `name -> value` view used by monitor sinks.
    pub fn flatten(&self) -> BTreeMap<String, f64> {
        let mut values = BTreeMap::new();
        let sum = &self.sum;
        for (name, value) in [
            ("Glideins", sum.glideins),
            ("Lasted", sum.lasted),
            ("FailedNr", sum.failed_nr),
            ("JobsNr", sum.jobs_nr),
            ("JobsLasted", sum.jobs_lasted),
            ("JobsTerminated", sum.jobs_terminated),
            ("JobsGoodput", sum.jobs_goodput),
            ("CondorLasted", sum.condor_lasted),
        ] {
            values.insert(name.to_string(), value as f64);
        }
        for (range, count) in &self.lasted {
            values.insert(format!("Lasted_{range}"), *count as f64);
        }
        for (range, count) in &self.jobs_nr {
            values.insert(format!("JobsNr_{range}"), *count as f64);
        }
        for (kind, counts) in &self.waste {
            for (range, count) in counts {
                values.insert(format!("Waste_{kind}_{range}"), *count as f64);
            }
        }
        values
    }
}

/// Completed rollup of every entry and of the whole factory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletedSummary {
    pub updated: i64,
    pub entries: BTreeMap<String, CompletedStats>,
    pub total: CompletedStats,
}

impl CompletedSummary {
    pub fn new(entries: BTreeMap<String, CompletedStats>, now: i64) -> Self {
        let mut total = CompletedStats::default();
        for stats in entries.values() {
            total.merge(stats);
        }
        CompletedSummary {
            updated: now,
            entries,
            total,
        }
    }
}
