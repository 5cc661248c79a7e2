use std::collections::BTreeMap;

use gwms_core::batch::{GlideinJob, JobStatus};
use serde::{Deserialize, Serialize};

use crate::factory::config::{FactoryConfig, SubmitLimits};

pub const LIMIT_ENTRY_IDLE: &str = "IdleGlideinsPerEntry";
pub const LIMIT_ENTRY_HELD: &str = "HeldGlideinsPerEntry";
pub const LIMIT_ENTRY_TOTAL: &str = "TotalGlideinsPerEntry";

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub idle: i64,
    pub running: i64,
    pub held: i64,
}

impl Counts {
    pub fn of<'a>(jobs: impl Iterator<Item = &'a GlideinJob>) -> Self {
        let mut counts = Counts::default();
        for job in jobs {
            match job.status {
                JobStatus::Idle => counts.idle += 1,
                JobStatus::Running => counts.running += 1,
                JobStatus::Held => counts.held += 1,
                _ => {}
            }
        }
        counts
    }

    pub fn total(&self) -> i64 {
        self.idle + self.running + self.held
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrontendLimits {
    pub max_glideins: i64,
    pub max_idle: i64,
    pub max_held: i64,
    pub counts: Counts,
}

/// Parses `"fe:sc;N,fe2:sc;M"`; malformed parts are skipped.
pub fn parse_overrides(value: &str) -> BTreeMap<String, i64> {
    let mut overrides = BTreeMap::new();
    if !value.contains(';') {
        return overrides;
    }
    for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let parsed = part
            .split_once(';')
            .and_then(|(key, limit)| Some((key.trim(), limit.trim().parse::<i64>().ok()?)));
        match parsed {
            Some((key, limit)) if key.contains(':') => {
                overrides.insert(key.to_string(), limit);
            }
            _ => log::warn!("Invalid frontend:security_class limit `{part}` ignored"),
        }
    }
    overrides
}

/// Glidein counts of one entry against its limits, overall and per `frontend:security_class`.
#[derive(Debug, Clone)]
pub struct GlideinTotals {
    entry: Counts,
    entry_max_glideins: i64,
    entry_max_idle: i64,
    entry_max_held: i64,
    default_frontend: FrontendLimits,
    frontends: BTreeMap<String, FrontendLimits>,
}

impl GlideinTotals {
    pub fn new(limits: &SubmitLimits, frontend_keys: impl IntoIterator<Item = String>, queue: &[GlideinJob]) -> Self {
        let default_frontend = FrontendLimits {
            max_glideins: limits.frontend_max_glideins as i64,
            max_idle: limits.frontend_max_idle as i64,
            max_held: limits.frontend_max_held as i64,
            counts: Counts::default(),
        };
        let mut frontends: BTreeMap<String, FrontendLimits> = frontend_keys
            .into_iter()
            .chain(queue.iter().map(|job| job.frontend.clone()))
            .map(|key| (key, default_frontend))
            .collect();

        let overrides = [
            &limits.frontend_max_glideins_overrides,
            &limits.frontend_max_idle_overrides,
            &limits.frontend_max_held_overrides,
        ];
        for (index, value) in overrides.into_iter().enumerate() {
            for (key, limit) in parse_overrides(value) {
                let fe = frontends.entry(key).or_insert(default_frontend);
                match index {
                    0 => fe.max_glideins = limit,
                    1 => fe.max_idle = limit,
                    _ => fe.max_held = limit,
                }
            }
        }
        for (key, fe) in frontends.iter_mut() {
            fe.counts = Counts::of(queue.iter().filter(|job| &job.frontend == key));
        }

        GlideinTotals {
            entry: Counts::of(queue.iter()),
            entry_max_glideins: limits.max_glideins as i64,
            entry_max_idle: limits.max_idle as i64,
            entry_max_held: limits.max_held as i64,
            default_frontend,
            frontends,
        }
    }

    /// Every `frontend:security_class` the factory knows, from its frontend descript.
    pub fn frontend_keys(config: &FactoryConfig) -> Vec<String> {
        config
            .frontends
            .iter()
            .flat_map(|(name, descript)| {
                descript
                    .usernames
                    .keys()
                    .map(move |security_class| format!("{name}:{security_class}"))
            })
            .collect()
    }

    pub fn entry(&self) -> Counts {
        self.entry
    }

    pub fn frontend(&self, key: &str) -> FrontendLimits {
        self.frontends.get(key).copied().unwrap_or(self.default_frontend)
    }

    /// How many of `count` new idle glideins fit; may be zero or negative.
    pub fn can_add_idle_glideins(&self, count: i64, frontend: &str) -> i64 {
        let mut allowed = count;
        let entry = &self.entry;
        if entry.idle + allowed > self.entry_max_idle {
            allowed = self.entry_max_idle - entry.idle;
        }
        if entry.total() + allowed > self.entry_max_glideins {
            allowed = self.entry_max_glideins - entry.total();
        }
        let fe = self.frontend(frontend);
        if fe.counts.idle + allowed > fe.max_idle {
            allowed = fe.max_idle - fe.counts.idle;
        }
        if fe.counts.total() + allowed > fe.max_glideins {
            allowed = fe.max_glideins - fe.counts.total();
        }
        allowed
    }

    pub fn add_idle_glideins(&mut self, count: i64, frontend: &str) {
        self.entry.idle += count;
        let default = self.default_frontend;
        self.frontends
            .entry(frontend.to_string())
            .or_insert(default)
            .counts
            .idle += count;
    }

    pub fn has_sec_class_exceeded_max_held(&self, frontend: &str) -> bool {
        let fe = self.frontend(frontend);
        fe.counts.held >= fe.max_held
    }

    pub fn has_entry_exceeded_max_held(&self) -> bool {
        self.entry.held >= self.entry_max_held
    }

    pub fn has_entry_exceeded_max_idle(&self) -> bool {
        self.entry.idle >= self.entry_max_idle
    }

    pub fn has_entry_exceeded_max_glideins(&self) -> bool {
        self.entry.total() >= self.entry_max_glideins
    }

    /// Entry limits currently hit, as `"count=<c>, limit=<l>"`.
    pub fn entry_limits_triggered(&self) -> BTreeMap<String, String> {
        let mut triggered = BTreeMap::new();
        let mut record = |name: &str, count: i64, limit: i64| {
            triggered.insert(name.to_string(), format!("count={count}, limit={limit}"));
        };
        if self.has_entry_exceeded_max_idle() {
            record(LIMIT_ENTRY_IDLE, self.entry.idle, self.entry_max_idle);
        }
        if self.has_entry_exceeded_max_held() {
            record(LIMIT_ENTRY_HELD, self.entry.held, self.entry_max_held);
        }
        if self.has_entry_exceeded_max_glideins() {
            record(LIMIT_ENTRY_TOTAL, self.entry.total(), self.entry_max_glideins);
        }
        triggered
    }

    /// Frontend limits currently hit, keyed `IdlePerClass_<fe>` and `TotalPerClass_<fe>`.
    pub fn frontend_limits_triggered(&self, frontend: &str) -> BTreeMap<String, String> {
        let fe = self.frontend(frontend);
        let mut triggered = BTreeMap::new();
        if fe.counts.idle >= fe.max_idle {
            triggered.insert(
                format!("IdlePerClass_{frontend}"),
                format!("count={}, limit={}", fe.counts.idle, fe.max_idle),
            );
        }
        if fe.counts.total() >= fe.max_glideins {
            triggered.insert(
                format!("TotalPerClass_{frontend}"),
                format!("count={}, limit={}", fe.counts.total(), fe.max_glideins),
            );
        }
        triggered
    }
}
