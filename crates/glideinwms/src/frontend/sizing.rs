use std::collections::BTreeMap;

use crate::frontend::classify::SlotCounts;
use crate::frontend::config::{EntryLimits, GroupConfig, TotalLimits};

/// Limits and curbs that shaped a request, as published in `GlideClientLimit*`.
pub type LimitsTriggered = BTreeMap<String, String>;

/// Glidein populations the limits are checked against.
#[derive(Debug, Copy, Clone, Default)]
pub struct Populations {
    pub entry: SlotCounts,
    pub group: SlotCounts,
    pub frontend: SlotCounts,
    pub global: SlotCounts,
}

/// Demand matched to one entry.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Demand {
    /// Idle jobs assigned to the entry
    pub prop_idle: u64,
    /// Idle jobs assigned to the entry, in glideins
    pub prop_mc_idle: u64,
    pub prop_mc_old_idle: u64,
    /// Running jobs found in glideins of the entry
    pub real_running: u64,
}

#[derive(Debug, Clone)]
pub struct SizingPolicy {
    pub entry: EntryLimits,
    pub group: TotalLimits,
    pub frontend: TotalLimits,
    pub global: TotalLimits,
    pub fraction_running: f64,
    pub ramp_up_attenuation: u64,
    pub reserve_idle: u64,
    pub min_running: u64,
}

impl SizingPolicy {
    pub fn new(group: &GroupConfig, frontend: &TotalLimits, global: &TotalLimits) -> Self {
        SizingPolicy {
            entry: group.entry_limits,
            group: group.group_limits,
            frontend: *frontend,
            global: *global,
            fraction_running: group.fraction_running,
            ramp_up_attenuation: group.ramp_up_attenuation.max(1),
            reserve_idle: group.reserve_idle,
            min_running: group.min_running,
        }
    }

    fn caps(&self, pops: &Populations) -> [(&'static str, u64, u64); 8] {
        [
            ("TotalGlideinsPerEntry", pops.entry.total, self.entry.max_running),
            ("IdleGlideinsPerEntry", pops.entry.idle, self.entry.max_vms_idle),
            ("TotalGlideinsPerGroup", pops.group.total, self.group.max_glideins),
            ("IdleGlideinsPerGroup", pops.group.idle, self.group.max_vms_idle),
            ("TotalGlideinsPerFrontend", pops.frontend.total, self.frontend.max_glideins),
            ("IdleGlideinsPerFrontend", pops.frontend.idle, self.frontend.max_vms_idle),
            ("TotalGlideinsGlobal", pops.global.total, self.global.max_glideins),
            ("IdleGlideinsGlobal", pops.global.idle, self.global.max_vms_idle),
        ]
    }

    fn curbs(&self, pops: &Populations) -> [(&'static str, u64, u64); 7] {
        [
            ("CurbIdleGlideinsPerEntry", pops.entry.idle, self.entry.curb_vms_idle),
            ("CurbTotalGlideinsPerGroup", pops.group.total, self.group.curb_glideins),
            ("CurbIdleGlideinsPerGroup", pops.group.idle, self.group.curb_vms_idle),
            ("CurbTotalGlideinsPerFrontend", pops.frontend.total, self.frontend.curb_glideins),
            ("CurbIdleGlideinsPerFrontend", pops.frontend.idle, self.frontend.curb_vms_idle),
            ("CurbTotalGlideinsGlobal", pops.global.total, self.global.curb_glideins),
            ("CurbIdleGlideinsGlobal", pops.global.idle, self.global.curb_vms_idle),
        ]
    }

    /// Idle demand left once the idle glideins of the entry are taken into account.
    pub fn effective_idle(&self, demand: &Demand, slots: &SlotCounts) -> (u64, u64, u64) {
        let effective = demand.prop_idle.saturating_sub(slots.idle);
        let mut effective_mc = demand.prop_mc_idle.saturating_sub(slots.idle);
        if self.min_running > 0 {
            effective_mc = effective_mc.max(self.min_running.saturating_sub(slots.total));
        }
        let effective_old_mc = demand.prop_mc_old_idle.saturating_sub(slots.idle);
        (effective, effective_mc, effective_old_mc)
    }

    /// `ReqIdleGlideins` of an entry.
    pub fn min_idle(
        &self,
        demand: &Demand,
        pops: &Populations,
        removal_requested: bool,
        limits: &mut LimitsTriggered,
    ) -> u64 {
        if removal_requested {
            return 0;
        }
        let mut curbs_reached = 0;
        for (name, count, limit) in self.curbs(pops) {
            if count >= limit {
                log::debug!("Curb {name} reached: {count} >= {limit}");
                limits.insert(
                    name.to_string(),
                    format!("count={count}, limit={limit}, curbbed"),
                );
                curbs_reached += 1;
            }
        }
        let mut capped = false;
        for (name, count, limit) in self.caps(pops) {
            if count >= limit {
                log::debug!("Limit {name} reached: {count} >= {limit}");
                limits.insert(name.to_string(), format!("count={count}, limit={limit}"));
                capped = true;
            }
        }
        if capped {
            return 0;
        }

        let (effective, effective_mc, effective_old_mc) = self.effective_idle(demand, &pops.entry);
        if effective == 0 && effective_mc == 0 {
            return 0;
        }
        let headroom = self
            .caps(pops)
            .iter()
            .map(|(_, count, limit)| limit - count)
            .min()
            .unwrap_or(u64::MAX);
        let mut idle = effective_mc.min(headroom);
        idle /= self.ramp_up_attenuation;
        idle += (effective_old_mc / 3).min(self.reserve_idle);
        idle = idle.min(self.entry.max_idle).min(headroom);
        for _ in 0..curbs_reached {
            idle /= 2;
        }
        idle.max(1)
    }

    /// `ReqMaxGlideins` of an entry.
    pub fn max_run(&self, demand: &Demand, slots: &SlotCounts, remove_all: bool) -> u64 {
        if remove_all || demand.prop_idle + demand.real_running == 0 {
            return 0;
        }
        if demand.prop_idle > 0 {
            let wanted = demand.prop_idle.saturating_sub(slots.idle) + demand.real_running;
            (wanted as f64 * self.fraction_running + 1.0) as u64
        } else {
            demand.real_running
        }
    }
}
