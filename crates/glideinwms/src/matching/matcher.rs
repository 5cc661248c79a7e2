use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use rand::Rng;
use rand::seq::SliceRandom;
use rayon::prelude::*;

use gwms_core::classad::ClassAd;

use crate::matching::expr::{EvalError, Expr, GlideinView, Scope};
use crate::matching::{GlideinId, MatchCandidate, MatchPolicy, job_cpus};

#[derive(Debug, Clone)]
pub struct MatchOptions {
    /// Drop entries advertising `GLIDEIN_In_Downtime` before matching.
    pub ignore_down_entries: bool,
    /// Entries evaluated by one matchmaker task.
    pub shard_size: usize,
    pub max_matchmakers: usize,
}

impl Default for MatchOptions {
    fn default() -> Self {
        MatchOptions {
            ignore_down_entries: false,
            shard_size: 100,
            max_matchmakers: 3,
        }
    }
}

/// Per-entry job counts of one job class.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchCounts {
    /// Jobs matching the entry, a job matching several entries is counted at each.
    pub count: BTreeMap<GlideinId, u64>,
    /// Jobs split among the entries they match; sums to `total`.
    pub prop: BTreeMap<GlideinId, u64>,
    /// Jobs matching only this entry.
    pub hereonly: BTreeMap<GlideinId, u64>,
    /// `prop` converted to glideins using the requested and offered cores.
    pub prop_mc: BTreeMap<GlideinId, u64>,
    /// Jobs matching at least one entry.
    pub total: u64,
    pub unmatched: u64,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct EntryCounts {
    pub count: u64,
    pub prop: u64,
    pub hereonly: u64,
    pub prop_mc: u64,
}

impl MatchCounts {
    pub fn entry(&self, id: &GlideinId) -> EntryCounts {
        let get = |map: &BTreeMap<GlideinId, u64>| map.get(id).copied().unwrap_or(0);
        EntryCounts {
            count: get(&self.count),
            prop: get(&self.prop),
            hereonly: get(&self.hereonly),
            prop_mc: get(&self.prop_mc),
        }
    }
}

/// Jobs that look the same to the match expression.
pub(crate) struct JobCluster<'a> {
    pub members: Vec<&'a ClassAd>,
    pub cpus: u64,
}

impl<'a> JobCluster<'a> {
    fn new(job: &'a ClassAd) -> Self {
        JobCluster {
            members: vec![job],
            cpus: job_cpus(job) as u64,
        }
    }

    pub fn first(&self) -> &'a ClassAd {
        self.members[0]
    }

    pub fn size(&self) -> u64 {
        self.members.len() as u64
    }
}

#[derive(Default)]
struct EntryMatch {
    clusters: Vec<usize>,
    count: u64,
}

pub struct Matcher {
    expr: Expr,
    policies: Vec<Box<dyn MatchPolicy>>,
    /// `None` when jobs cannot be clustered
    cluster_attrs: Option<Vec<String>>,
}

impl Matcher {
    pub fn new(match_expr: &str, policies: Vec<Box<dyn MatchPolicy>>) -> crate::Result<Self> {
        let expr = Expr::parse(match_expr)?;
        let mut attrs: Option<BTreeSet<String>> = expr.job_attributes();
        for policy in &policies {
            attrs = match (attrs, policy.job_attributes()) {
                (Some(mut attrs), Some(other)) => {
                    attrs.extend(other);
                    Some(attrs)
                }
                _ => None,
            };
        }
        Ok(Matcher {
            expr,
            policies,
            cluster_attrs: attrs.map(|attrs| attrs.into_iter().collect()),
        })
    }

    pub fn matches(&self, job: &ClassAd, glidein: &GlideinView) -> Result<bool, EvalError> {
        let scope = Scope { job, glidein };
        if !self.expr.matches(&scope)? {
            return Ok(false);
        }
        for policy in &self.policies {
            if !policy.matches(&scope)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub(crate) fn cluster<'a>(
        &self,
        jobs: &'a [ClassAd],
        extra_attrs: &[&str],
    ) -> Vec<JobCluster<'a>> {
        let Some(attrs) = &self.cluster_attrs else {
            return jobs.iter().map(JobCluster::new).collect();
        };
        let mut clusters: BTreeMap<Vec<Option<String>>, JobCluster<'a>> = BTreeMap::new();
        for job in jobs {
            let key = attrs
                .iter()
                .map(String::as_str)
                .chain(extra_attrs.iter().copied())
                .map(|attr| job.get(attr).map(|value| format!("{value:?}")))
                .collect();
            match clusters.entry(key) {
                Entry::Vacant(entry) => {
                    entry.insert(JobCluster::new(job));
                }
                Entry::Occupied(mut entry) => {
                    let cluster = entry.get_mut();
                    cluster.members.push(job);
                    cluster.cpus += job_cpus(job) as u64;
                }
            }
        }
        clusters.into_values().collect()
    }

    fn match_entry(&self, clusters: &[JobCluster], candidate: &MatchCandidate) -> EntryMatch {
        let mut result = EntryMatch::default();
        let mut failures = 0;
        let mut last_error = None;
        for (index, cluster) in clusters.iter().enumerate() {
            match self.matches(cluster.first(), &candidate.view) {
                Ok(true) => {
                    result.clusters.push(index);
                    result.count += cluster.size();
                }
                Ok(false) => {}
                Err(error) => {
                    failures += 1;
                    last_error = Some(error);
                }
            }
        }
        if let Some(error) = last_error {
            log::debug!(
                "Match expression failed on {failures} job classes at {}, last error: {error}",
                candidate.id
            );
        }
        result
    }

    fn match_candidates(
        &self,
        clusters: &[JobCluster],
        candidates: &[&MatchCandidate],
        options: &MatchOptions,
    ) -> Vec<EntryMatch> {
        let shard_size = options.shard_size.max(1);
        let sequential = || {
            candidates
                .iter()
                .map(|candidate| self.match_entry(clusters, candidate))
                .collect()
        };
        if candidates.len() <= shard_size || options.max_matchmakers <= 1 {
            return sequential();
        }
        match rayon::ThreadPoolBuilder::new()
            .num_threads(options.max_matchmakers)
            .build()
        {
            Ok(pool) => pool.install(|| {
                candidates
                    .par_chunks(shard_size)
                    .map(|shard| {
                        shard
                            .iter()
                            .map(|candidate| self.match_entry(clusters, candidate))
                            .collect::<Vec<_>>()
                    })
                    .collect::<Vec<_>>()
                    .into_iter()
                    .flatten()
                    .collect()
            }),
            Err(error) => {
                log::warn!("Cannot start matchmakers, matching sequentially: {error}");
                sequential()
            }
        }
    }

    /// Counts the jobs of one class against every candidate entry.
    pub fn count_match<R: Rng>(
        &self,
        jobs: &[ClassAd],
        candidates: &[MatchCandidate],
        options: &MatchOptions,
        rng: &mut R,
    ) -> MatchCounts {
        let clusters = self.cluster(jobs, &[]);
        let active: Vec<&MatchCandidate> = candidates
            .iter()
            .filter(|candidate| !(options.ignore_down_entries && candidate.in_downtime()))
            .collect();
        let matched = self.match_candidates(&clusters, &active, options);

        let mut entries_of_cluster: Vec<Vec<usize>> = vec![Vec::new(); clusters.len()];
        for (entry, entry_match) in matched.iter().enumerate() {
            for cluster in &entry_match.clusters {
                entries_of_cluster[*cluster].push(entry);
            }
        }

        let mut shares = vec![0.0; active.len()];
        // Shares in glideins: each cluster weighted by its cores per job over the entry cores
        let mut core_shares = vec![0.0; active.len()];
        let mut hereonly = vec![0; active.len()];
        let mut total = 0;
        for (cluster, entries) in clusters.iter().zip(&entries_of_cluster) {
            if entries.is_empty() {
                continue;
            }
            total += cluster.size();
            let share = cluster.size() as f64 / entries.len() as f64;
            let cores_per_job = cluster.cpus as f64 / cluster.size() as f64;
            for entry in entries {
                shares[*entry] += share;
                core_shares[*entry] +=
                    share * cores_per_job / active[*entry].glidein_cpus() as f64;
            }
            if let [only] = entries.as_slice() {
                hereonly[*only] += cluster.size();
            }
        }
        let prop = apportion(&shares, total, rng);

        let mut counts = MatchCounts {
            total,
            unmatched: (jobs.len() as u64).saturating_sub(total),
            ..Default::default()
        };
        for candidate in candidates {
            for map in [
                &mut counts.count,
                &mut counts.prop,
                &mut counts.hereonly,
                &mut counts.prop_mc,
            ] {
                map.insert(candidate.id.clone(), 0);
            }
        }
        for (index, (candidate, entry_match)) in active.iter().zip(&matched).enumerate() {
            let prop_mc = if shares[index] > 0.0 {
                (prop[index] as f64 * core_shares[index] / shares[index]).ceil() as u64
            } else {
                0
            };
            counts.count.insert(candidate.id.clone(), entry_match.count);
            counts.prop.insert(candidate.id.clone(), prop[index]);
            counts.hereonly.insert(candidate.id.clone(), hereonly[index]);
            counts.prop_mc.insert(candidate.id.clone(), prop_mc);
        }
        counts
    }
}

/// Largest remainder rounding of `shares` to integers summing to `total`; equal remainders
/// are ordered randomly.
fn apportion<R: Rng>(shares: &[f64], total: u64, rng: &mut R) -> Vec<u64> {
    let mut result: Vec<u64> = shares.iter().map(|share| share.floor() as u64).collect();
    let mut remainder = total.saturating_sub(result.iter().sum());
    let mut order: Vec<usize> = (0..shares.len()).filter(|i| shares[*i] > 0.0).collect();
    order.shuffle(rng);
    order.sort_by(|a, b| {
        let fraction = |i: usize| shares[i] - shares[i].floor();
        fraction(*b).total_cmp(&fraction(*a))
    });
    for index in order {
        if remainder == 0 {
            break;
        }
        result[index] += 1;
        remainder -= 1;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use gwms_core::classad::AdType;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use crate::matching::ExprPolicy;

    const SITE_MATCH: &str =
        r#"glidein["attrs"]["GLIDEIN_Site"] in job.get("DESIRED_Sites", "").split(",")"#;

    fn job(sites: &str, cpus: i64) -> ClassAd {
        let mut ad = ClassAd::default();
        ad.insert("DESIRED_Sites", sites);
        ad.insert("RequestCpus", cpus);
        ad
    }

    fn entry(name: &str, site: &str, cpus: i64) -> MatchCandidate {
        let mut ad = ClassAd::new(AdType::Factory, &format!("{name}@gfactory@main"));
        ad.insert("GLIDEIN_Site", site);
        ad.insert("GLIDEIN_CPUS", cpus);
        MatchCandidate::from_ad("factory.example.org", &ad).unwrap()
    }

    fn count(matcher: &Matcher, jobs: &[ClassAd], entries: &[MatchCandidate]) -> MatchCounts {
        matcher.count_match(
            jobs,
            entries,
            &MatchOptions::default(),
            &mut StdRng::seed_from_u64(1),
        )
    }

    #[test]
    fn proportional_counts_sum_to_total() {
        let matcher = Matcher::new(SITE_MATCH, vec![]).unwrap();
        let entries = vec![entry("a", "A", 1), entry("b", "B", 1), entry("c", "C", 1)];
        let mut jobs = vec![];
        jobs.extend((0..7).map(|_| job("A,B", 1)));
        jobs.extend((0..5).map(|_| job("A,B,C", 1)));
        jobs.extend((0..4).map(|_| job("C", 1)));
        jobs.extend((0..2).map(|_| job("D", 1)));

        let counts = count(&matcher, &jobs, &entries);
        assert_eq!(counts.total, 16);
        assert_eq!(counts.unmatched, 2);
        assert_eq!(counts.prop.values().sum::<u64>(), 16);
        assert_eq!(counts.entry(&entries[0].id).count, 12);
        assert_eq!(counts.entry(&entries[2].id).count, 9);
        assert_eq!(counts.entry(&entries[2].id).hereonly, 4);
        assert_eq!(counts.entry(&entries[0].id).hereonly, 0);
        assert!(counts.prop_mc.values().sum::<u64>() <= counts.total);
        assert_eq!(counts.prop_mc, counts.prop);
    }

    #[test]
    fn single_job_on_two_entries_is_split_randomly() {
        let matcher = Matcher::new(SITE_MATCH, vec![]).unwrap();
        let entries = vec![entry("a", "A", 1), entry("b", "B", 1)];
        let jobs = vec![job("A,B", 1)];
        let mut rng = StdRng::seed_from_u64(42);
        let mut wins = 0;
        for _ in 0..1000 {
            let counts = matcher.count_match(&jobs, &entries, &MatchOptions::default(), &mut rng);
            let a = counts.entry(&entries[0].id).prop;
            let b = counts.entry(&entries[1].id).prop;
            assert_eq!(a + b, 1);
            wins += a;
        }
        assert!((400..=600).contains(&wins), "{wins}");
    }

    #[test]
    fn multicore_scaling() {
        let matcher = Matcher::new(SITE_MATCH, vec![]).unwrap();
        let entries = vec![entry("a", "A", 4), entry("b", "B", 8)];
        let mut jobs: Vec<ClassAd> = (0..8).map(|_| job("A", 1)).collect();
        jobs.extend((0..3).map(|_| job("B", 2)));
        let counts = count(&matcher, &jobs, &entries);
        assert_eq!(counts.entry(&entries[0].id).prop, 8);
        assert_eq!(counts.entry(&entries[0].id).prop_mc, 2);
        assert_eq!(counts.entry(&entries[1].id).prop_mc, 1);
    }

    #[test]
    fn multicore_scaling_weights_each_cluster() {
        let matcher = Matcher::new(SITE_MATCH, vec![]).unwrap();
        let entries = vec![entry("a", "A", 8), entry("b", "B", 8)];
        let mut jobs: Vec<ClassAd> = (0..8).map(|_| job("A", 1)).collect();
        jobs.extend((0..2).map(|_| job("A,B", 8)));
        let counts = count(&matcher, &jobs, &entries);
        let a = counts.entry(&entries[0].id);
        assert_eq!(a.prop, 9);
        // 8 single core jobs fill one glidein, the shared 8 core job needs another
        assert_eq!(a.prop_mc, 2);
        assert_eq!(counts.entry(&entries[1].id).prop_mc, 1);
    }

    #[test]
    fn failing_expression_counts_as_no_match() {
        let matcher = Matcher::new(r#"job["Owner"] == "alice""#, vec![]).unwrap();
        let entries = vec![entry("a", "A", 1)];
        let mut owned = job("A", 1);
        owned.insert("Owner", "alice");
        let jobs = vec![owned, job("A", 1)];
        let counts = count(&matcher, &jobs, &entries);
        assert_eq!(counts.total, 1);
        assert_eq!(counts.unmatched, 1);
    }

    #[test]
    fn down_entries_are_skipped_on_request() {
        let matcher = Matcher::new("True", vec![]).unwrap();
        let mut down = entry("down", "A", 1);
        down.view
            .attrs
            .insert("GLIDEIN_In_Downtime".to_string(), "True".into());
        let entries = vec![down, entry("up", "B", 1)];
        let jobs = vec![job("A", 1), job("B", 1)];
        let options = MatchOptions {
            ignore_down_entries: true,
            ..Default::default()
        };
        let counts =
            matcher.count_match(&jobs, &entries, &options, &mut StdRng::seed_from_u64(3));
        assert_eq!(counts.entry(&entries[0].id), EntryCounts::default());
        assert_eq!(counts.entry(&entries[1].id).prop, 2);
    }

    struct CountingPolicy(Arc<AtomicUsize>);

    impl MatchPolicy for CountingPolicy {
        fn name(&self) -> &str {
            "counting"
        }

        fn job_attributes(&self) -> Option<BTreeSet<String>> {
            Some(BTreeSet::new())
        }

        fn matches(&self, _scope: &Scope) -> Result<bool, EvalError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    #[test]
    fn equal_jobs_are_evaluated_once_per_entry() {
        let evaluations = Arc::new(AtomicUsize::new(0));
        let matcher = Matcher::new(
            SITE_MATCH,
            vec![Box::new(CountingPolicy(evaluations.clone()))],
        )
        .unwrap();
        let entries = vec![entry("a", "A", 1), entry("b", "B", 1)];
        let jobs: Vec<ClassAd> = (0..50).map(|_| job("A,B", 1)).collect();
        let counts = count(&matcher, &jobs, &entries);
        assert_eq!(counts.total, 50);
        assert_eq!(evaluations.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn policies_are_anded() {
        let policy = ExprPolicy::new("cpus", r#"job["RequestCpus"] <= 2"#).unwrap();
        let matcher = Matcher::new(SITE_MATCH, vec![Box::new(policy)]).unwrap();
        let entries = vec![entry("a", "A", 8)];
        let jobs = vec![job("A", 1), job("A", 4)];
        assert_eq!(count(&matcher, &jobs, &entries).total, 1);
    }

    #[test]
    fn sharded_matching_agrees_with_sequential() {
        let matcher = Matcher::new(SITE_MATCH, vec![]).unwrap();
        let entries: Vec<MatchCandidate> = (0..250)
            .map(|i| entry(&format!("e{i}"), &format!("S{}", i % 7), 1))
            .collect();
        let jobs: Vec<ClassAd> = (0..40)
            .map(|i| job(&format!("S{},S{}", i % 7, (i + 3) % 7), 1))
            .collect();
        let sequential = MatchOptions {
            max_matchmakers: 1,
            ..Default::default()
        };
        let sharded = MatchOptions {
            shard_size: 30,
            max_matchmakers: 4,
            ..Default::default()
        };
        let a = matcher.count_match(&jobs, &entries, &sequential, &mut StdRng::seed_from_u64(9));
        let b = matcher.count_match(&jobs, &entries, &sharded, &mut StdRng::seed_from_u64(9));
        assert_eq!(a, b);
    }
}
