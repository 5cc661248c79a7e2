use std::collections::{BTreeMap, BTreeSet};

use gwms_core::classad::ClassAd;

use crate::Map;
use crate::matching::{GlideinId, MatchCandidate, Matcher, strip_port};

pub const ATTR_RUNNING_ON: &str = "RunningOn";
pub const ATTR_REMOTE_HOST: &str = "RemoteHost";
pub const RUNNING_ON_UNKNOWN: &str = "UNKNOWN";

/// Running jobs found in glideins of one entry.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct RealRunning {
    pub jobs: u64,
    /// Distinct glideins (remote hosts) running them
    pub glideins: u64,
}

/// Sets `RunningOn` on every job from the slot it runs in.
pub fn annotate_running_on(jobs: &mut [ClassAd], slots: &[ClassAd]) {
    let by_name: Map<&str, &ClassAd> = slots
        .iter()
        .filter_map(|slot| slot.name().map(|name| (name, slot)))
        .collect();
    for job in jobs.iter_mut() {
        let running_on = job
            .get_str(ATTR_REMOTE_HOST)
            .and_then(|host| by_name.get(host))
            .and_then(|slot| {
                let schedd = slot.get_str("GLIDEIN_Schedd")?;
                let factory_pool = strip_port(schedd.rsplit('@').next().unwrap_or(schedd));
                Some(format!(
                    "{}@{}@{}@{factory_pool}",
                    slot.get_str("GLIDEIN_Entry_Name")?,
                    slot.get_str("GLIDEIN_Name")?,
                    slot.get_str("GLIDEIN_Factory")?,
                ))
            })
            .unwrap_or_else(|| RUNNING_ON_UNKNOWN.to_string());
        job.insert(ATTR_RUNNING_ON, running_on);
    }
}

/// Attributes running jobs to the entries whose glideins they run in.
pub fn count_real_running(
    matcher: &Matcher,
    running_jobs: &[ClassAd],
    candidates: &[MatchCandidate],
) -> BTreeMap<GlideinId, RealRunning> {
    let clusters = matcher.cluster(running_jobs, &[ATTR_RUNNING_ON]);
    let mut result = BTreeMap::new();
    for candidate in candidates {
        let running_on = candidate.id.running_on();
        let mut jobs = 0;
        let mut hosts = BTreeSet::new();
        for (index, cluster) in clusters.iter().enumerate() {
            let first = cluster.first();
            if first.get_str(ATTR_RUNNING_ON) != Some(running_on.as_str()) {
                continue;
            }
            match matcher.matches(first, &candidate.view) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(error) => {
                    log::debug!("Running job match failed at {}: {error}", candidate.id);
                    continue;
                }
            }
            jobs += cluster.size();
            for (position, job) in cluster.members.iter().enumerate() {
                hosts.insert(
                    job.get_str(ATTR_REMOTE_HOST)
                        .map(|host| host.to_string())
                        .unwrap_or_else(|| format!("{index}.{position}")),
                );
            }
        }
        result.insert(
            candidate.id.clone(),
            RealRunning {
                jobs,
                glideins: hosts.len() as u64,
            },
        );
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use gwms_core::classad::AdType;

    fn slot(name: &str, entry: &str) -> ClassAd {
        let mut ad = ClassAd::new(AdType::Slot, name);
        ad.insert("GLIDEIN_Entry_Name", entry);
        ad.insert("GLIDEIN_Name", "gfactory");
        ad.insert("GLIDEIN_Factory", "main");
        ad.insert("GLIDEIN_Schedd", "schedd_glideins2@factory.example.org:9618");
        ad
    }

    fn running(host: Option<&str>) -> ClassAd {
        let mut ad = ClassAd::default();
        ad.insert("JobStatus", 2);
        if let Some(host) = host {
            ad.insert(ATTR_REMOTE_HOST, host);
        }
        ad
    }

    #[test]
    fn running_jobs_are_attributed_to_entries() {
        let slots = vec![
            slot("slot1@wn1", "a"),
            slot("slot2@wn1", "a"),
            slot("slot1@wn2", "b"),
        ];
        let mut jobs = vec![
            running(Some("slot1@wn1")),
            running(Some("slot2@wn1")),
            running(Some("slot1@wn2")),
            running(Some("slot9@gone")),
            running(None),
        ];
        annotate_running_on(&mut jobs, &slots);
        assert_eq!(
            jobs[0].get_str(ATTR_RUNNING_ON),
            Some("a@gfactory@main@factory.example.org")
        );
        assert_eq!(jobs[3].get_str(ATTR_RUNNING_ON), Some(RUNNING_ON_UNKNOWN));
        assert_eq!(jobs[4].get_str(ATTR_RUNNING_ON), Some(RUNNING_ON_UNKNOWN));

        let candidates: Vec<MatchCandidate> = ["a", "b", "c"]
            .iter()
            .map(|entry| {
                let ad = ClassAd::new(AdType::Factory, &format!("{entry}@gfactory@main"));
                MatchCandidate::from_ad("factory.example.org:9618", &ad).unwrap()
            })
            .collect();
        let matcher = Matcher::new("True", vec![]).unwrap();
        let counts = count_real_running(&matcher, &jobs, &candidates);
        assert_eq!(
            counts[&candidates[0].id],
            RealRunning {
                jobs: 2,
                glideins: 2
            }
        );
        assert_eq!(counts[&candidates[1].id].jobs, 1);
        assert_eq!(counts[&candidates[2].id], RealRunning::default());
    }
}
