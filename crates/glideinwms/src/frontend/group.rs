use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use gwms_core::adbus::Constraint;
use gwms_core::classad::{ATTR_NAME, AdType, AdValue, ClassAd, MONITOR_PREFIX, SequenceCounter};
use gwms_core::common::fsutils::{read_json_or_default, write_json_atomic};
use gwms_core::credentials::{
    AuthenticationMethod, Credential, CredentialPurpose, CredentialType, GeneratorRegistry,
    ParameterName, Purpose, payload_slots,
};

use crate::common::error::configuration_error;
use crate::common::process::WorkerAction;
use crate::common::removal::RemovalMode;
use crate::frontend::ads::{
    ATTR_HA_MODE, ENC_SECURITY_CLASS, ENC_SECURITY_NAME, GlideinRequest, GroupIdentity,
    MatchExprs, ResourceInfo, ResourceMonitor, glideclient_ad, glideclientglobal_ad,
    glideresource_ad,
};
use crate::frontend::broker::TokenBroker;
use crate::frontend::classify::{
    JobClass, SlotCounts, blacklisted_schedds, classify_jobs, count_slots, filter_jobs,
    frontend_slots, slot_credential, slots_by_entry,
};
use crate::frontend::config::{FrontendConfig, GroupConfig, HaMode};
use crate::frontend::keys::{RequestEncryption, SessionKeys};
use crate::frontend::policies::{GroupCredential, RequestParams, SelectedCredential, create_policy};
use crate::frontend::removal::{RemovalCounters, RemovalRequest, decide_removal};
use crate::frontend::sizing::{Demand, LimitsTriggered, Populations, SizingPolicy};
use crate::frontend::sources::{FactoryGlobal, Services, Snapshot, bounded, poll};
use crate::matching::matcher::EntryCounts;
use crate::matching::{
    ExprPolicy, Expr, GlideinId, GlideinView, MatchCandidate, MatchCounts, MatchOptions,
    MatchPolicy, Matcher, RealRunning, Scope, annotate_running_on, count_real_running,
};

pub const HISTORY_FILE: &str = "history.json";

const ATTR_TRUST_DOMAIN: &str = "GLIDEIN_TrustDomain";
const ATTR_AUTH_METHOD: &str = "GLIDEIN_SupportedAuthenticationMethod";
const ATTR_REQUIRE_VOMS: &str = "GLIDEIN_REQUIRE_VOMS";
const ATTR_SITE: &str = "GLIDEIN_Site";
const ATTR_REQ_NODE: &str = "GLIDECLIENT_ReqNode";
const ATTR_CONDOR_TOKEN: &str = "frontend_condortoken";

const DEFAULT_TRUST_DOMAIN: &str = "Grid";
const DEFAULT_AUTH_METHOD: &str = "grid_proxy";

/// State a group carries from one iteration to the next.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct GroupHistory {
    /// Removal counters per entry request name
    #[serde(default)]
    pub counters: BTreeMap<String, RemovalCounters>,
    #[serde(default)]
    pub session_keys: BTreeMap<String, String>,
}

impl GroupHistory {
    pub fn load(work_dir: &Path) -> Self {
        read_json_or_default(&work_dir.join(HISTORY_FILE)).unwrap_or_else(|error| {
            log::warn!("Cannot read group history, starting from scratch: {error}");
            GroupHistory::default()
        })
    }

    pub fn save(&self, work_dir: &Path) -> crate::Result<()> {
        std::fs::create_dir_all(work_dir)?;
        write_json_atomic(&work_dir.join(HISTORY_FILE), self)?;
        Ok(())
    }
}

/// Everything decided for one entry in one iteration.
#[derive(Debug, Clone)]
pub struct EntryPlan {
    pub id: GlideinId,
    pub counts: BTreeMap<JobClass, EntryCounts>,
    pub real_running: RealRunning,
    pub slots: SlotCounts,
    pub effective_idle: u64,
    pub min_idle: u64,
    pub max_run: u64,
    pub removal: RemovalRequest,
    pub limits: LimitsTriggered,
    pub in_downtime: bool,
}

impl EntryPlan {
    pub fn count(&self, class: JobClass) -> EntryCounts {
        self.counts.get(&class).copied().unwrap_or_default()
    }

    fn resource_monitor(&self, max_running: u64) -> ResourceMonitor {
        let idle = self.count(JobClass::Idle);
        ResourceMonitor {
            jobs_idle: idle.prop,
            jobs_idle_matching: idle.count,
            jobs_idle_effective: self.effective_idle,
            jobs_idle_old: self.count(JobClass::OldIdle).prop,
            jobs_idle_unique: idle.hereonly,
            jobs_running: self.count(JobClass::Running).count,
            jobs_running_here: self.real_running.jobs,
            jobs_running_max: max_running,
            glideins_total: self.slots.total,
            glideins_idle: self.slots.idle,
            glideins_running: self.slots.running,
            glideins_failed: self.slots.failed,
            glideins_total_cores: self.slots.total_cores,
            glideins_idle_cores: self.slots.idle_cores,
            glideins_running_cores: self.slots.running_cores,
            glideins_request_idle: self.min_idle,
            glideins_request_max_run: self.max_run,
        }
    }
}

/// Sizes the request of one entry and picks its removal mode.
pub fn plan_entry(
    sizing: &SizingPolicy,
    group: &GroupConfig,
    candidate: &MatchCandidate,
    matches: &BTreeMap<JobClass, MatchCounts>,
    real_running: RealRunning,
    populations: &Populations,
    counters: &mut RemovalCounters,
    action: WorkerAction,
) -> EntryPlan {
    let counts: BTreeMap<JobClass, EntryCounts> = matches
        .iter()
        .map(|(class, counts)| (*class, counts.entry(&candidate.id)))
        .collect();
    let get = |class: JobClass| counts.get(&class).copied().unwrap_or_default();
    let require_voms = group.require_voms
        || candidate
            .view
            .attrs
            .get(ATTR_REQUIRE_VOMS)
            .is_some_and(AdValue::is_true);
    let idle = if require_voms {
        get(JobClass::VomsIdle)
    } else {
        get(JobClass::Idle)
    };
    let demand = Demand {
        prop_idle: idle.prop,
        prop_mc_idle: idle.prop_mc,
        prop_mc_old_idle: get(JobClass::OldIdle).prop_mc,
        real_running: real_running.jobs,
    };
    let slots = populations.entry;
    counters.update(get(JobClass::Idle).count, slots.idle, slots.total);

    let (removal, clear_requests) = match action {
        WorkerAction::Remove { kind, excess_only } => (
            RemovalRequest {
                mode: kind.into(),
                margin: 0,
            },
            !excess_only,
        ),
        _ => (decide_removal(counters, &group.removal), false),
    };
    let remove_all = clear_requests && removal.mode == RemovalMode::All;

    let mut limits = LimitsTriggered::new();
    let in_downtime = candidate.in_downtime();
    let (min_idle, max_run) = if in_downtime {
        (0, 0)
    } else {
        (
            sizing.min_idle(&demand, populations, clear_requests, &mut limits),
            sizing.max_run(&demand, &slots, remove_all),
        )
    };
    let (effective_idle, _, _) = sizing.effective_idle(&demand, &slots);
    log::debug!(
        "Entry {}: idle {min_idle}, max run {max_run}, removal {}",
        candidate.id,
        removal.mode
    );
    EntryPlan {
        id: candidate.id.clone(),
        counts,
        real_running,
        slots,
        effective_idle,
        min_idle,
        max_run,
        removal,
        limits,
        in_downtime,
    }
}

fn slot_monitors(slots: &SlotCounts) -> [(&'static str, u64); 7] {
    [
        ("GlideinsTotal", slots.total),
        ("GlideinsIdle", slots.idle),
        ("GlideinsRunning", slots.running),
        ("GlideinsFailed", slots.failed),
        ("GlideinsTotalCores", slots.total_cores),
        ("GlideinsIdleCores", slots.idle_cores),
        ("GlideinsRunningCores", slots.running_cores),
    ]
}

/// Splits the running jobs of an entry among the credentials that have running glideins.
pub fn scaled_running(total: u64, running_per_credential: &[u64]) -> Vec<u64> {
    let with_running = running_per_credential.iter().filter(|r| **r > 0).count() as u64;
    let mut result = vec![0; running_per_credential.len()];
    if with_running == 0 {
        return result;
    }
    let share = total / with_running;
    let mut assigned = 0;
    for (index, running) in running_per_credential.iter().enumerate() {
        if *running == 0 {
            continue;
        }
        assigned += 1;
        result[index] = if assigned == with_running {
            total - share * (with_running - 1)
        } else {
            share
        };
    }
    result
}

fn request_monitors(
    plan: &EntryPlan,
    credential_slots: &SlotCounts,
    scaled_running: u64,
) -> BTreeMap<String, AdValue> {
    let mut monitors: BTreeMap<String, AdValue> = JobClass::ALL
        .iter()
        .map(|class| (class.as_str().to_string(), plan.count(*class).count.into()))
        .collect();
    for (name, value) in slot_monitors(credential_slots) {
        monitors.insert(name.to_string(), value.into());
    }
    monitors.insert("RunningHere".to_string(), credential_slots.running.into());
    monitors.insert("Running".to_string(), scaled_running.into());
    monitors
}

fn config_limits(group: &GroupConfig) -> BTreeMap<String, AdValue> {
    let entry = &group.entry_limits;
    let total = &group.group_limits;
    [
        ("MaxRunningPerEntry", entry.max_running),
        ("MaxIdlePerEntry", entry.max_idle),
        ("MaxIdleVMsPerEntry", entry.max_vms_idle),
        ("CurbIdleVMsPerEntry", entry.curb_vms_idle),
        ("MaxRunningTotal", total.max_glideins),
        ("CurbRunningTotal", total.curb_glideins),
        ("MaxIdleVMsTotal", total.max_vms_idle),
        ("CurbIdleVMsTotal", total.curb_vms_idle),
    ]
    .into_iter()
    .map(|(name, value)| (name.to_string(), value.into()))
    .collect()
}

/// Requests of one group to one factory, published together.
struct FactoryBatch {
    pool: usize,
    global: FactoryGlobal,
    credentials: BTreeMap<String, Credential>,
    requests: Vec<GlideinRequest>,
}

impl FactoryBatch {
    fn add_credential(&mut self, id: &str, credential: &Credential) {
        if credential.data().is_some() {
            self.credentials
                .entry(id.to_string())
                .or_insert_with(|| credential.clone());
        }
    }
}

/// Outcome of one group iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupReport {
    /// A master was active, nothing was published
    pub skipped: bool,
    pub entries: usize,
    pub requests: usize,
    pub resources: usize,
}

pub struct GroupWorker<'a> {
    config: &'a FrontendConfig,
    group: &'a GroupConfig,
    services: Services,
    identity: GroupIdentity,
    work_dir: PathBuf,
    registry: GeneratorRegistry,
    broker: Option<TokenBroker>,
    rng: StdRng,
    sequence: SequenceCounter,
}

impl<'a> GroupWorker<'a> {
    pub fn new(config: &'a FrontendConfig, group_name: &str, services: Services) -> crate::Result<Self> {
        let Some(group) = config.group(group_name) else {
            return configuration_error(format!("Unknown group {group_name}"));
        };
        let work_dir = config.group_work_dir(group_name);
        std::fs::create_dir_all(&work_dir)?;
        let identity = GroupIdentity {
            frontend_name: config.frontend_name.clone(),
            group_name: group.name.clone(),
            client_name: config.client_name(&group.name),
            ha_mode: config.ha_mode,
            web_url: config.web_url.clone(),
            monitoring_web_url: config.monitoring_web_url.clone(),
        };
        let registry = GeneratorRegistry::with_builtins(services.timeout);
        let broker = config
            .token_broker
            .as_ref()
            .map(|broker| TokenBroker::new(&work_dir, broker));
        Ok(GroupWorker {
            config,
            group,
            services,
            identity,
            work_dir,
            registry,
            broker,
            rng: StdRng::from_os_rng(),
            sequence: SequenceCounter::default(),
        })
    }

    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn identity(&self) -> &GroupIdentity {
        &self.identity
    }

    pub async fn run(&mut self, action: WorkerAction) -> crate::Result<GroupReport> {
        if action == WorkerAction::Deadvertise {
            self.deadvertise().await;
            return Ok(GroupReport::default());
        }
        if self.config.ha_mode == HaMode::Slave && self.master_active().await {
            log::info!(
                "group {}: master is active, skipping iteration",
                self.group.name
            );
            return Ok(GroupReport {
                skipped: true,
                ..Default::default()
            });
        }

        let credentials = self.load_credentials().await;
        let schedds = self.config.group_schedds(self.group);
        let snapshot = poll(&self.services, &self.identity.client_name, schedds).await?;
        let mut history = GroupHistory::load(&self.work_dir);
        let mut keys = SessionKeys::restore(&history.session_keys);

        let report = self
            .iterate(&snapshot, &credentials, &mut history, &mut keys, action)
            .await?;

        history.session_keys = keys.save();
        history.save(&self.work_dir)?;
        log::info!(
            "group {}: {} entries, {} requests, {} resource ads",
            self.group.name,
            report.entries,
            report.requests,
            report.resources
        );
        Ok(report)
    }

    async fn load_credentials(&self) -> Vec<GroupCredential> {
        let mut credentials = Vec::with_capacity(self.group.credentials.len());
        for config in &self.group.credentials {
            match GroupCredential::load(config, &self.registry, self.services.timeout).await {
                Ok(credential) => credentials.push(credential),
                Err(error) => log::warn!(
                    "group {}: credential {} is not usable: {error}",
                    self.group.name,
                    config.path.display()
                ),
            }
        }
        credentials
    }

    fn candidates(&self, snapshot: &Snapshot) -> crate::Result<Vec<(usize, MatchCandidate)>> {
        let factory_expr = self
            .group
            .factory_query_expr
            .as_deref()
            .map(Expr::parse)
            .transpose()?;
        let nobody = ClassAd::default();
        let mut candidates = Vec::new();
        for (index, view) in snapshot.factories.iter().enumerate() {
            for ad in &view.entries {
                let Some(candidate) = MatchCandidate::from_ad(&view.pool, ad) else {
                    continue;
                };
                if let Some(expr) = &factory_expr {
                    let scope = Scope {
                        job: &nobody,
                        glidein: &candidate.view,
                    };
                    match expr.matches(&scope) {
                        Ok(true) => {}
                        Ok(false) => continue,
                        Err(error) => {
                            log::debug!("Factory query failed on {}: {error}", candidate.id);
                            continue;
                        }
                    }
                }
                candidates.push((index, candidate));
            }
        }
        Ok(candidates)
    }

    fn matcher(&self) -> crate::Result<Matcher> {
        let mut policies: Vec<Box<dyn MatchPolicy>> = Vec::new();
        for (name, text) in &self.group.match_policies {
            policies.push(Box::new(ExprPolicy::new(name, text)?));
        }
        Matcher::new(&self.group.match_expr, policies)
    }

    async fn iterate(
        &mut self,
        snapshot: &Snapshot,
        credentials: &[GroupCredential],
        history: &mut GroupHistory,
        keys: &mut SessionKeys,
        action: WorkerAction,
    ) -> crate::Result<GroupReport> {
        let now = Utc::now().timestamp();
        let group = self.group;
        let schedds = self.config.group_schedds(group);
        let blacklisted =
            blacklisted_schedds(&snapshot.schedd_ads, schedds, self.config.schedd_backpressure);
        let jobs = match &group.job_query_expr {
            Some(text) => {
                let expr = Expr::parse(text)?;
                snapshot
                    .jobs
                    .iter()
                    .map(|(schedd, jobs)| (schedd.clone(), filter_jobs(jobs.clone(), &expr)))
                    .collect()
            }
            None => snapshot.jobs.clone(),
        };
        let mut classes = classify_jobs(&jobs, &blacklisted, now);

        let mut policy = create_policy(group.credential_policy, &self.work_dir)?;
        if let Some(idle) = classes.get(&JobClass::Idle) {
            if let Err(error) = policy.update_usermap(idle, credentials) {
                log::warn!("group {}: cannot update user map: {error}", group.name);
            }
        }

        let candidates = self.candidates(snapshot)?;
        let entry_candidates: Vec<MatchCandidate> =
            candidates.iter().map(|(_, c)| c.clone()).collect();
        let matcher = self.matcher()?;
        let options = MatchOptions {
            ignore_down_entries: group.ignore_down_entries,
            max_matchmakers: self.config.max_matchmakers,
            ..Default::default()
        };
        let mut matches = BTreeMap::new();
        for class in JobClass::ALL {
            let class_jobs = classes.get(&class).map(Vec::as_slice).unwrap_or_default();
            let counts = matcher.count_match(class_jobs, &entry_candidates, &options, &mut self.rng);
            log::debug!(
                "group {}: {class} jobs {} matching {}",
                group.name,
                class_jobs.len(),
                counts.total
            );
            matches.insert(class, counts);
        }
        let running = classes.entry(JobClass::Running).or_default();
        annotate_running_on(running.as_mut_slice(), &snapshot.slots);
        let real = count_real_running(&matcher, running.as_slice(), &entry_candidates);

        let min_memory = self.config.min_pslot_idle_memory;
        let by_entry = slots_by_entry(&snapshot.slots, &self.identity.client_name);
        let base = Populations {
            entry: SlotCounts::default(),
            group: count_slots(by_entry.values().flatten().copied(), min_memory),
            frontend: count_slots(
                frontend_slots(&snapshot.slots, &self.config.frontend_name),
                min_memory,
            ),
            global: count_slots(&snapshot.slots, min_memory),
        };
        let sizing = SizingPolicy::new(group, &self.config.frontend_limits, &self.config.global_limits);
        let exprs = MatchExprs {
            match_expr: group.match_expr.clone(),
            job_query_expr: group.job_query_expr.clone(),
            factory_query_expr: group.factory_query_expr.clone(),
        };

        let mut batches: BTreeMap<(usize, String), FactoryBatch> = BTreeMap::new();
        let mut resources = Vec::with_capacity(candidates.len());
        for (pool, candidate) in &candidates {
            let request_name = candidate.id.request_name.as_str();
            let entry_slots = by_entry.get(request_name).cloned().unwrap_or_default();
            let populations = Populations {
                entry: count_slots(entry_slots.iter().copied(), min_memory),
                ..base
            };
            let counters = history.counters.entry(request_name.to_string()).or_default();
            let plan = plan_entry(
                &sizing,
                group,
                candidate,
                &matches,
                real.get(&candidate.id).copied().unwrap_or_default(),
                &populations,
                counters,
                action,
            );

            let view = &snapshot.factories[*pool];
            match view.global_for(request_name) {
                Some(global) => {
                    let batch = batches
                        .entry((*pool, global.name.clone()))
                        .or_insert_with(|| FactoryBatch {
                            pool: *pool,
                            global: global.clone(),
                            credentials: BTreeMap::new(),
                            requests: Vec::new(),
                        });
                    let trust_domain = candidate
                        .view
                        .attrs
                        .get(ATTR_TRUST_DOMAIN)
                        .and_then(AdValue::as_str)
                        .unwrap_or(DEFAULT_TRUST_DOMAIN);
                    let selected = match auth_method(&candidate.view) {
                        Some(method) => policy.get_credentials(
                            credentials,
                            RequestParams {
                                min_nr_glideins: plan.min_idle,
                                max_run_glideins: plan.max_run,
                            },
                            trust_domain,
                            &method,
                            &mut self.rng,
                        ),
                        None => Vec::new(),
                    };
                    if selected.is_empty() {
                        log::warn!("group {}: no credential fits entry {}", group.name, candidate.id);
                    }
                    let token = self.entry_token(candidate);
                    let requests = self.entry_requests(
                        &plan,
                        candidate,
                        &entry_slots,
                        credentials,
                        &selected,
                        token.as_deref(),
                        batch,
                    )?;
                    batch.requests.extend(requests);
                }
                None => log::warn!(
                    "group {}: no key of the factory of {}, not requesting glideins",
                    group.name,
                    candidate.id
                ),
            }

            let info = ResourceInfo {
                request_name,
                in_downtime: plan.in_downtime,
                monitor: plan.resource_monitor(group.entry_limits.max_running),
                entry: &candidate.view.attrs,
                factory_monitors: view
                    .client_for(request_name)
                    .map(|ad| ad.typed_attrs(MONITOR_PREFIX)),
                match_exprs: &exprs,
                limits: &plan.limits,
            };
            resources.push(glideresource_ad(&self.identity, &info));
        }

        let requests = self.publish_requests(batches, keys).await?;
        let resource_count = resources.len();
        self.sequence.stamp_all(&mut resources);
        if let Err(error) = self.services.user_pool.publish(resources).await {
            log::warn!("group {}: cannot publish resource ads: {error:?}", group.name);
        }
        Ok(GroupReport {
            skipped: false,
            entries: candidates.len(),
            requests,
            resources: resource_count,
        })
    }

    fn entry_token(&self, candidate: &MatchCandidate) -> Option<String> {
        let broker = self.broker.as_ref()?;
        let site = candidate.view.attrs.get(ATTR_SITE)?.as_str()?;
        let entry = candidate.id.request_name.split('@').next()?;
        let trust_domain = candidate
            .view
            .attrs
            .get(ATTR_TRUST_DOMAIN)
            .and_then(AdValue::as_str)
            .unwrap_or(DEFAULT_TRUST_DOMAIN);
        match broker.entry_token(entry, site, trust_domain, Utc::now()) {
            Ok(token) => token,
            Err(error) => {
                log::warn!("Cannot issue token for entry {entry}: {error}");
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn entry_requests(
        &self,
        plan: &EntryPlan,
        candidate: &MatchCandidate,
        entry_slots: &[&ClassAd],
        credentials: &[GroupCredential],
        selected: &[SelectedCredential],
        token: Option<&str>,
        batch: &mut FactoryBatch,
    ) -> crate::Result<Vec<GlideinRequest>> {
        let min_memory = self.config.min_pslot_idle_memory;
        let mut ids = Vec::with_capacity(selected.len());
        let mut slots = Vec::with_capacity(selected.len());
        for credential in selected {
            let id = credential.id()?;
            slots.push(count_slots(
                entry_slots
                    .iter()
                    .copied()
                    .filter(|slot| slot_credential(slot) == Some(id.as_str())),
                min_memory,
            ));
            ids.push(id);
        }
        let running: Vec<u64> = slots.iter().map(|s| s.running).collect();
        let scaled = scaled_running(plan.count(JobClass::Running).count, &running);

        let mut params: BTreeMap<String, AdValue> = self
            .group
            .glidein_params
            .iter()
            .map(|(name, value)| (name.clone(), value.into()))
            .collect();
        params.insert(ATTR_REQ_NODE.to_string(), candidate.id.factory_pool.as_str().into());

        let mut requests = Vec::with_capacity(selected.len());
        for (index, credential) in selected.iter().enumerate() {
            let id = &ids[index];
            let source = &credentials[credential.source];
            let request_credential = &credential.request.credential;
            let (idle, max_run) = credential.request.usage_details();
            let credential_slots = slots[index];
            let live = credential_slots.total > 0;
            if idle == 0 && max_run == 0 && !live && plan.removal.mode == RemovalMode::No {
                continue;
            }

            let mut secrets = BTreeMap::new();
            secrets.insert(ENC_SECURITY_NAME.to_string(), self.config.security_name.clone());
            secrets.insert(
                ENC_SECURITY_CLASS.to_string(),
                request_credential.security_class().to_string(),
            );
            let (slot, private_slot) = payload_slots(request_credential);
            secrets.insert(slot.to_string(), id.clone());
            batch.add_credential(id, request_credential);
            if let (Some(private_slot), Some(private)) = (private_slot, request_credential.private()) {
                let private_id = private.id()?;
                secrets.insert(private_slot.to_string(), private_id.clone());
                batch.add_credential(&private_id, private);
            }
            if let Some(pilot) = &source.pilot {
                let pilot_id = pilot.id()?;
                secrets.insert(ParameterName::GlideinProxy.as_str().to_string(), pilot_id.clone());
                batch.add_credential(&pilot_id, pilot);
            }
            for parameter in source.parameters.iter() {
                secrets.insert(parameter.name().as_str().to_string(), parameter.value().to_string());
            }
            if let Some(project) = &credential.project_id {
                secrets.insert(ParameterName::ProjectId.as_str().to_string(), project.clone());
            }
            if let Some(token) = token {
                let token = Credential::from_bytes(
                    CredentialType::IdToken,
                    token.as_bytes(),
                    Purpose::new(CredentialPurpose::Payload),
                    request_credential.trust_domain(),
                    request_credential.security_class(),
                )?;
                let token_id = token.id()?;
                secrets.insert(ATTR_CONDOR_TOKEN.to_string(), token_id.clone());
                batch.add_credential(&token_id, &token);
            }

            requests.push(GlideinRequest {
                request_name: candidate.id.request_name.clone(),
                credential_id: id.clone(),
                idle: idle as u64,
                max_run: max_run as u64,
                removal: plan.removal,
                idle_lifetime: self.group.idle_lifetime,
                params: params.clone(),
                secrets,
                monitors: request_monitors(plan, &credential_slots, scaled[index]),
                config: config_limits(self.group),
            });
        }
        Ok(requests)
    }

    /// Publishes the global and request ads of every factory, one call per factory pool.
    async fn publish_requests(
        &mut self,
        batches: BTreeMap<(usize, String), FactoryBatch>,
        keys: &mut SessionKeys,
    ) -> crate::Result<usize> {
        let mut per_pool: BTreeMap<usize, Vec<ClassAd>> = BTreeMap::new();
        let mut published = 0;
        for batch in batches.into_values() {
            let my_identity = &self.services.factory_pools[batch.pool].config.my_identity;
            let session = keys.get_or_create(&batch.global.key)?.clone();
            let encryption = RequestEncryption::new(&batch.global.key, &session);
            let credentials: Vec<(String, &Credential)> = batch
                .credentials
                .iter()
                .map(|(id, credential)| (id.clone(), credential))
                .collect();
            let ads = per_pool.entry(batch.pool).or_default();
            ads.push(glideclientglobal_ad(
                &self.identity,
                &batch.global.name,
                &self.config.security_name,
                &credentials,
                &encryption,
                my_identity,
            )?);
            for request in &batch.requests {
                ads.push(glideclient_ad(&self.identity, request, &encryption, my_identity)?);
            }
            published += batch.requests.len();
        }

        // Pools without a batch still lose the requests of earlier iterations
        for (pool, factory_pool) in self.services.factory_pools.iter().enumerate() {
            let mut ads = per_pool.remove(&pool).unwrap_or_default();
            let names: Vec<String> = ads
                .iter()
                .filter(|ad| ad.ad_type() == Some(AdType::Client))
                .filter_map(|ad| ad.name().map(|n| n.to_string()))
                .collect();
            if !ads.is_empty() {
                self.sequence.stamp_all(&mut ads);
                if let Err(error) = factory_pool.bus.publish(ads).await {
                    log::warn!(
                        "group {}: cannot publish requests to {}: {error:?}",
                        self.group.name,
                        factory_pool.config.pool
                    );
                    continue;
                }
            }
            let stale = stale_requests(&self.identity, &names);
            if let Err(error) = factory_pool.bus.invalidate(AdType::Client, stale).await {
                log::warn!("Cannot withdraw old requests at {}: {error:?}", factory_pool.config.pool);
            }
        }
        Ok(published)
    }

    async fn master_active(&self) -> bool {
        let constraint = self
            .identity
            .constraint()
            .and(Constraint::eq(ATTR_HA_MODE, HaMode::Master.as_str()));
        for pool in &self.services.factory_pools {
            let query = pool.bus.query(AdType::ClientGlobal, constraint.clone());
            match bounded(self.services.timeout, &pool.config.pool, query).await {
                Ok(ads) if !ads.is_empty() => return true,
                Ok(_) => {}
                Err(error) => log::warn!("Cannot look for the master at {}: {error:?}", pool.config.pool),
            }
        }
        false
    }

    /// Withdraws every ad this group published.
    async fn deadvertise(&self) {
        for pool in &self.services.factory_pools {
            for ad_type in [AdType::Client, AdType::ClientGlobal] {
                if let Err(error) = pool.bus.invalidate(ad_type, self.identity.constraint()).await {
                    log::warn!("Cannot withdraw {ad_type} ads at {}: {error:?}", pool.config.pool);
                }
            }
        }
        let resources = Constraint::eq("GlideClientName", self.identity.client_name.as_str());
        if let Err(error) = self
            .services
            .user_pool
            .invalidate(AdType::Resource, resources)
            .await
        {
            log::warn!("Cannot withdraw resource ads: {error:?}");
        }
        log::info!("group {}: deadvertised", self.group.name);
    }
}

fn auth_method(view: &GlideinView) -> Option<AuthenticationMethod> {
    let text = view
        .attrs
        .get(ATTR_AUTH_METHOD)
        .and_then(AdValue::as_str)
        .unwrap_or(DEFAULT_AUTH_METHOD);
    match AuthenticationMethod::parse(text) {
        Ok(method) => Some(method),
        Err(error) => {
            log::warn!("Invalid authentication method `{text}`: {error}");
            None
        }
    }
}

/// Requests of the group that were not renewed in this iteration.
fn stale_requests(identity: &GroupIdentity, current: &[String]) -> Constraint {
    current.iter().fold(identity.constraint(), |constraint, name| {
        constraint.and(Constraint::ne(ATTR_NAME, name.as_str()))
    })
}
