//! One iteration of an entry: validate the requests addressed to it, keep its glidein queue
//! in line with them and publish what it did.

use std::collections::{BTreeMap, BTreeSet};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use gwms_core::adbus::{AdBus, Constraint};
use gwms_core::batch::{
    ATTR_GLIDEIN_CLIENT, ATTR_GLIDEIN_ENTRY, ATTR_JOB_STATUS, BatchSystem, GlideinJob, JobId,
    JobStatus, jobs_constraint,
};
use gwms_core::classad::{ATTR_NAME, AdType, AdValue, ClassAd, PARAM_PREFIX, SequenceCounter};
use gwms_core::common::error::CoreError;
use gwms_core::common::fsutils::{PRIVATE_FILE_MODE, atomic_write, write_json_atomic};
use gwms_core::credentials::{ParameterName, SubmitBundle, compress_credential};
use gwms_core::crypto::RsaKey;

use crate::aggregator::rollup::{CompletedGlidein, EntryStatus, StatusAttrs};
use crate::aggregator::sink::{JsonSink, MonitorSink, update_logged};
use crate::aggregator::{COMPLETED_FILE, STATUS_FILE, monitor_dir};
use crate::common::error::configuration_error;
use crate::common::process::WorkerAction;
use crate::common::removal::RemovalMode;
use crate::factory::ads::{ClientState, EntryState, glidefactory_ad, glidefactoryclient_ad};
use crate::factory::config::{EntryConfig, FactoryConfig};
use crate::factory::downtime::Downtimes;
use crate::factory::global::{ClientGlobal, ClientRequestAd, FactoryWork, find_work};
use crate::factory::glideins::{ClientRequest, GlideinDriver};
use crate::factory::security::{check_security_credentials, is_safe_name};
use crate::factory::totals::{Counts, GlideinTotals};
use crate::frontend::ads::{
    ATTR_REQ_GLIDEIN, ATTR_REQ_IDLE, ATTR_REQ_IDLE_LIFETIME, ATTR_REQ_MAX_RUN,
    ATTR_REQ_REMOVE_EXCESS, ATTR_REQ_REMOVE_MARGIN, ENC_SECURITY_CLASS, ENC_SECURITY_NAME,
};
use crate::frontend::sources::bounded;

const ATTR_REQ_MAX_RUNNING: &str = "ReqMaxRunningGlideins";
/// Marker of the old request protocol
const V2_PROXY_SLOT: &str = "x509_proxy_0";
const PASSTHRU_PARAM: &str = "CONTINUE_IF_NO_PROXY";

/// Payload slots whose value is the id of a credential received in the client global ad.
const CREDENTIAL_SLOTS: [(&str, &str); 11] = [
    ("SubmitProxy", "pem"),
    ("GlideinProxy", "pem"),
    ("PublicCert", "pem"),
    ("PrivateCert", "pem"),
    ("PublicKey", "rsa"),
    ("PrivateKey", "rsa"),
    ("Username", "txt"),
    ("Password", "txt"),
    ("AuthFile", "txt"),
    ("frontend_scitoken", "scitoken"),
    ("frontend_condortoken", "idtoken"),
];

const IDENTITY_PARAMS: [ParameterName; 4] = [
    ParameterName::VmId,
    ParameterName::VmType,
    ParameterName::RemoteUsername,
    ParameterName::ProjectId,
];

/// Attributes of a finished glidein job, as reported by the glidein at exit.
const ATTR_DURATION: &str = "GlideinDuration";
const ATTR_CONDOR_STARTED: &str = "GlideinCondorStarted";
const ATTR_CONDOR_DURATION: &str = "GlideinCondorDuration";
const ATTR_VALIDATION_DURATION: &str = "GlideinValidationDuration";
const ATTR_JOBS_NR: &str = "GlideinJobsNr";
const ATTR_JOBS_SECS: &str = "GlideinJobsSecs";
const ATTR_GOODPUT: &str = "GlideinGoodZSecs";
const ATTR_NONZERO_EXIT: &str = "GlideinGoodNZSecs";

pub struct EntryServices {
    /// Collector of the factory
    pub bus: Rc<dyn AdBus>,
    pub batch: Rc<dyn BatchSystem>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryReport {
    pub in_downtime: bool,
    /// The queue could not be read, no request was served
    pub queue_unavailable: bool,
    pub requests: usize,
    pub rejected: usize,
    pub submitted: u64,
    pub completed: usize,
}

/// A request that passed every check, ready for the glidein driver.
struct AcceptedRequest {
    request: ClientRequest,
    bundle: SubmitBundle,
    security_name: String,
    security_class: String,
    in_downtime: bool,
}

pub struct EntryWorker<'a> {
    config: &'a FactoryConfig,
    entry: &'a EntryConfig,
    key: &'a RsaKey,
    services: EntryServices,
    work_dir: PathBuf,
    downtimes: Downtimes,
    sink: Box<dyn MonitorSink>,
    sequence: SequenceCounter,
}

impl<'a> EntryWorker<'a> {
    pub fn new(
        config: &'a FactoryConfig,
        entry_name: &str,
        key: &'a RsaKey,
        services: EntryServices,
    ) -> crate::Result<Self> {
        let Some(entry) = config.entry(entry_name) else {
            return configuration_error(format!("Unknown entry {entry_name}"));
        };
        let work_dir = config.entry_work_dir(entry);
        std::fs::create_dir_all(monitor_dir(&work_dir))?;
        let downtimes = Downtimes::new(&config.downtime_path(), entry.downtime_file.as_deref());
        let sink = Box::new(JsonSink::new(&monitor_dir(&work_dir).join("series")));
        Ok(EntryWorker {
            config,
            entry,
            key,
            services,
            work_dir,
            downtimes,
            sink,
            sequence: SequenceCounter::default(),
        })
    }

    pub fn with_sink(mut self, sink: Box<dyn MonitorSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn name(&self) -> &str {
        &self.entry.name
    }

    pub async fn run(&mut self, action: WorkerAction) -> crate::Result<EntryReport> {
        match action {
            WorkerAction::Run => {}
            WorkerAction::Deadvertise => {
                self.deadvertise().await;
                return Ok(EntryReport::default());
            }
            WorkerAction::Remove { .. } => {
                return configuration_error(format!(
                    "entry {}: removals are requested by the frontends",
                    self.entry.name
                ));
            }
        }
        let work = find_work(
            self.services.bus.as_ref(),
            self.config,
            self.key,
            self.services.timeout,
        )
        .await?;
        Ok(self.iterate(&work, Utc::now()).await)
    }

    /// Serves the requests of `work` addressed to this entry and publishes the entry ads.
    pub async fn iterate(&mut self, work: &FactoryWork, now: DateTime<Utc>) -> EntryReport {
        let entry = self.entry;
        let epoch = now.timestamp();
        let mut report = EntryReport {
            in_downtime: self.downtimes.entry_down(&entry.name, now),
            ..Default::default()
        };
        if report.in_downtime {
            log::info!("entry {}: in downtime", entry.name);
        }

        let batch = self.services.batch.clone();
        let query = batch.query(Constraint::eq(ATTR_GLIDEIN_ENTRY, entry.name.as_str()));
        let queue = match bounded(self.services.timeout, "Glidein queue query", query).await {
            Ok(ads) => Some(self.collect_completed(ads, epoch, &mut report).await),
            Err(error) => {
                log::warn!("entry {}: cannot read the glidein queue, skipping work: {error:?}", entry.name);
                report.queue_unavailable = true;
                None
            }
        };
        let active = queue.unwrap_or_default();

        let mut totals = GlideinTotals::new(
            &entry.limits,
            GlideinTotals::frontend_keys(self.config),
            &active,
        );
        let limits_triggered = totals.entry_limits_triggered();
        for (name, value) in &limits_triggered {
            log::debug!("entry {}: limit {name} triggered, {value}", entry.name);
        }

        let mut clients: BTreeMap<String, ClientState> = BTreeMap::new();
        let mut touched = BTreeSet::new();
        let mut work_done = false;
        if !report.queue_unavailable {
            let driver = GlideinDriver::new(entry, batch.as_ref(), epoch);
            for request in work.for_entry(&entry.name) {
                report.requests += 1;
                let accepted = self.accept(
                    request,
                    work.globals.get(&request.client),
                    report.in_downtime || !limits_triggered.is_empty(),
                    now,
                );
                let accepted = match accepted {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        log::warn!(
                            "entry {}: dropping request {} of {}: {error}",
                            entry.name,
                            request.request_name,
                            request.client
                        );
                        report.rejected += 1;
                        continue;
                    }
                };
                let client_queue: Vec<GlideinJob> = active
                    .iter()
                    .filter(|job| job.client == request.client)
                    .cloned()
                    .collect();
                let submitted = driver
                    .keep_idle_glideins(&client_queue, &accepted.request, &accepted.bundle, &mut totals)
                    .await;
                work_done = true;
                report.submitted += submitted;

                let frontend = accepted.request.frontend.as_str();
                let state = clients.entry(request.client.clone()).or_default();
                state.client = request.client.clone();
                state.request_name = request.request_name.clone();
                state.requested_idle += accepted.request.idle;
                state.requested_max_run += accepted.request.max_run;
                state.submitted += submitted;
                state.in_downtime |= accepted.in_downtime;
                state.limits_triggered.extend(totals.frontend_limits_triggered(frontend));
                touched.insert((accepted.security_name, accepted.security_class));
            }
            if !work_done {
                driver.sanitize_glideins(&active).await;
            }
        }

        for job in &active {
            let state = clients.entry(job.client.clone()).or_default();
            state.client = job.client.clone();
        }
        // Reported status is the queue as read at the start of the iteration
        for state in clients.values_mut() {
            state.status = Counts::of(active.iter().filter(|job| job.client == state.client));
            state.in_downtime |= report.in_downtime;
        }

        for (security_name, security_class) in &touched {
            let counts = totals.frontend(&format!("{security_name}:{security_class}")).counts;
            let values: BTreeMap<String, f64> = [
                ("StatusIdle", counts.idle),
                ("StatusRunning", counts.running),
                ("StatusHeld", counts.held),
            ]
            .into_iter()
            .map(|(name, value)| (name.to_string(), value as f64))
            .collect();
            let series = format!("frontend_{security_name}_{security_class}");
            update_logged(self.sink.as_mut(), &series, epoch, &values);
        }

        let state = EntryState {
            in_downtime: report.in_downtime,
            totals: totals.entry(),
            requested_idle: clients.values().map(|c| c.requested_idle).sum(),
            requested_max_run: clients.values().map(|c| c.requested_max_run).sum(),
            limits_triggered,
        };
        self.write_status(&state, &clients, epoch);
        self.publish(&state, &clients).await;
        log::info!(
            "entry {}: {} requests, {} rejected, {} glideins submitted",
            entry.name,
            report.requests,
            report.rejected,
            report.submitted
        );
        report
    }

    /// Splits finished glideins off the queue, records and removes them.
    async fn collect_completed(
        &self,
        ads: Vec<ClassAd>,
        now: i64,
        report: &mut EntryReport,
    ) -> Vec<GlideinJob> {
        let (done, active): (Vec<ClassAd>, Vec<ClassAd>) = ads
            .into_iter()
            .partition(|ad| ad.get_int(ATTR_JOB_STATUS) == Some(JobStatus::Completed.code()));
        let completed: Vec<CompletedGlidein> = done.iter().map(|ad| completed_glidein(ad, now)).collect();
        report.completed = completed.len();
        let path = monitor_dir(&self.work_dir).join(COMPLETED_FILE);
        if let Err(error) = write_json_atomic(&path, &completed) {
            log::warn!("entry {}: cannot write {}: {error}", self.entry.name, path.display());
        }
        let done: Vec<JobId> = GlideinJob::from_ads(&done).iter().map(|job| job.id).collect();
        if !done.is_empty() {
            let removal = self.services.batch.remove(jobs_constraint(&done), false);
            match bounded(self.services.timeout, "Completed glidein removal", removal).await {
                Ok(()) => log::debug!("entry {}: {} glideins completed", self.entry.name, done.len()),
                Err(error) => log::warn!(
                    "entry {}: cannot remove completed glideins: {error:?}",
                    self.entry.name
                ),
            }
        }
        GlideinJob::from_ads(&active)
    }

    fn accept(
        &self,
        request: &ClientRequestAd,
        global: Option<&ClientGlobal>,
        hold_idle: bool,
        now: DateTime<Utc>,
    ) -> Result<AcceptedRequest, CoreError> {
        let entry = self.entry;
        let client = request.client.as_str();
        if !is_safe_name(client) || !is_safe_name(&request.request_name) {
            return Err(CoreError::invalid_input("Unsafe client or request name"));
        }
        let secrets = &request.secrets;
        if secrets.contains_key(V2_PROXY_SLOT) {
            return Err(CoreError::invalid_input("Protocol v2 requests are not supported"));
        }
        let secret = |name: &str| {
            secrets
                .get(name)
                .map(String::as_str)
                .ok_or_else(|| CoreError::invalid_input(format!("Missing {name}")))
        };
        let security_name = secret(ENC_SECURITY_NAME)?;
        let security_class = secret(ENC_SECURITY_CLASS)?;

        let Some(descript) = self.config.frontends.get(security_name) else {
            return Err(CoreError::credential(format!("Unknown security name {security_name}")));
        };
        if descript.identity != request.identity {
            return Err(CoreError::credential(format!(
                "Identity {} is not the one of {security_name}",
                request.identity
            )));
        }
        let params = request.ad.typed_attrs(PARAM_PREFIX);
        let passthru = params.get(PASSTHRU_PARAM).is_some_and(is_true);
        check_security_credentials(
            &entry.auth_method,
            secrets.keys().map(String::as_str),
            client,
            &entry.name,
            passthru,
        )?;
        if !entry.allows_frontend(security_name) {
            return Err(CoreError::invalid_input(format!(
                "Frontend {security_name} is not allowed on this entry"
            )));
        }
        if !entry.allows_security_class(security_class) {
            return Err(CoreError::invalid_input(format!(
                "Security class {security_class} is not allowed on this entry"
            )));
        }
        let in_downtime = self
            .downtimes
            .check(&entry.name, security_name, security_class, now)
            .is_some();
        let Some(username) = self.config.username(security_name, security_class) else {
            return Err(CoreError::invalid_input(format!(
                "No local user for {security_name}:{security_class}"
            )));
        };

        let idle = int_attr(&request.ad, ATTR_REQ_IDLE)?
            .ok_or_else(|| CoreError::invalid_input(format!("Missing {ATTR_REQ_IDLE}")))?;
        let max_run = match int_attr(&request.ad, ATTR_REQ_MAX_RUN)? {
            Some(max_run) => max_run,
            None => int_attr(&request.ad, ATTR_REQ_MAX_RUNNING)?
                .ok_or_else(|| CoreError::invalid_input(format!("Missing {ATTR_REQ_MAX_RUN}")))?,
        };
        let removal = request
            .ad
            .get_str(ATTR_REQ_REMOVE_EXCESS)
            .map(RemovalMode::parse_lenient)
            .unwrap_or_default();
        let margin = int_attr(&request.ad, ATTR_REQ_REMOVE_MARGIN)?.unwrap_or(0).max(0);
        let idle_lifetime = int_attr(&request.ad, ATTR_REQ_IDLE_LIFETIME)?.unwrap_or(0).max(0);

        let Some(global) = global else {
            return Err(CoreError::credential("No credentials received from this client"));
        };
        if global.security_name != security_name {
            return Err(CoreError::credential(format!(
                "Credentials were sent by {}, not {security_name}",
                global.security_name
            )));
        }
        let credential_id = credential_id(request).unwrap_or_default();
        let cred_dir = self.config.client_proxy_dir.join(username);
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&cred_dir)?;
        let mut bundle = SubmitBundle::new(username, security_class, &credential_id, cred_dir);
        for (slot, extension) in CREDENTIAL_SLOTS {
            let Some(id) = secrets.get(slot) else {
                continue;
            };
            let Some(credential) = global.credentials.get(id) else {
                return Err(CoreError::credential(format!("Credential {id} for {slot} was not received")));
            };
            let path = self.write_credential(&bundle.cred_dir, client, slot, id, extension, &credential.data)?;
            bundle.add_security_credential(slot, path);
            if slot == ParameterName::GlideinProxy.as_str() && entry.is_cloud() {
                let path = bundle
                    .cred_dir
                    .join(format!("credential_{client}_{}_{id}_compressed", entry.name));
                let data = format!("glidein_credentials={}", compress_credential(&credential.data)?);
                atomic_write(&path, data.as_bytes(), PRIVATE_FILE_MODE, false)?;
            }
        }
        for parameter in IDENTITY_PARAMS {
            if let Some(value) = secrets.get(parameter.as_str()) {
                bundle.add_identity_credential(parameter.as_str(), value);
            }
        }

        if hold_idle || in_downtime {
            log::debug!("entry {}: not adding idle glideins for {client}", entry.name);
        }
        let request = ClientRequest {
            client: client.to_string(),
            frontend: format!("{security_name}:{security_class}"),
            idle: if hold_idle || in_downtime { 0 } else { idle.max(0) },
            max_run: max_run.max(0),
            idle_lifetime: Duration::from_secs(idle_lifetime as u64),
            removal,
            margin,
            params,
        };
        Ok(AcceptedRequest {
            request,
            bundle,
            security_name: security_name.to_string(),
            security_class: security_class.to_string(),
            in_downtime,
        })
    }

    /// Token files are one per client and entry, every other credential is kept per id.
    fn write_credential(
        &self,
        dir: &Path,
        client: &str,
        slot: &str,
        id: &str,
        extension: &str,
        data: &[u8],
    ) -> Result<PathBuf, CoreError> {
        let entry = &self.entry.name;
        let name = match slot {
            "frontend_scitoken" | "frontend_condortoken" => {
                format!("credential_{client}_{entry}.{extension}")
            }
            _ => format!("credential_{client}_{entry}_{id}.{extension}"),
        };
        let path = dir.join(name);
        atomic_write(&path, data, PRIVATE_FILE_MODE, false)?;
        Ok(path)
    }

    fn write_status(&self, state: &EntryState, clients: &BTreeMap<String, ClientState>, now: i64) {
        let status = EntryStatus {
            entry: self.entry.name.clone(),
            updated: now,
            in_downtime: state.in_downtime,
            totals: status_attrs(
                &state.totals,
                clients.values().map(|c| c.submitted).sum(),
                state.requested_idle,
                state.requested_max_run,
            ),
            clients: clients
                .values()
                .map(|c| {
                    let attrs = status_attrs(&c.status, c.submitted, c.requested_idle, c.requested_max_run);
                    (c.client.clone(), attrs)
                })
                .collect(),
        };
        let path = monitor_dir(&self.work_dir).join(STATUS_FILE);
        if let Err(error) = write_json_atomic(&path, &status) {
            log::warn!("entry {}: cannot write {}: {error}", self.entry.name, path.display());
        }
    }

    async fn publish(&mut self, state: &EntryState, clients: &BTreeMap<String, ClientState>) {
        let mut ads = vec![glidefactory_ad(self.config, self.entry, self.key.public_key(), state)];
        ads.extend(
            clients
                .values()
                .map(|client| glidefactoryclient_ad(self.config, self.entry, &state.totals, client)),
        );
        self.sequence.stamp_all(&mut ads);
        let published = self.services.bus.publish(ads);
        if let Err(error) = bounded(self.services.timeout, "Entry advertisement", published).await {
            log::warn!("entry {}: cannot publish its ads: {error:?}", self.entry.name);
        }
    }

    async fn deadvertise(&self) {
        let request_name = self.config.request_name(&self.entry.name);
        let withdrawals = [
            (AdType::Factory, Constraint::eq(ATTR_NAME, request_name.as_str())),
            (AdType::FactoryClient, Constraint::eq(ATTR_REQ_GLIDEIN, request_name.as_str())),
        ];
        for (ad_type, constraint) in withdrawals {
            if let Err(error) = self.services.bus.invalidate(ad_type, constraint).await {
                log::warn!("Cannot withdraw {ad_type} ads of entry {}: {error:?}", self.entry.name);
            }
        }
        log::info!("entry {}: deadvertised", self.entry.name);
    }
}

fn is_true(value: &AdValue) -> bool {
    match value {
        AdValue::Bool(value) => *value,
        AdValue::String(value) => value.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// Integer request attribute; frontends may send it as a quoted number.
fn int_attr(ad: &ClassAd, name: &str) -> Result<Option<i64>, CoreError> {
    match ad.get(name) {
        None => Ok(None),
        Some(AdValue::String(value)) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| CoreError::invalid_input(format!("{name} is not an integer: `{value}`"))),
        Some(value) => value
            .as_int()
            .map(Some)
            .ok_or_else(|| CoreError::invalid_input(format!("{name} is not an integer: {value:?}"))),
    }
}

/// The `<credential id>_` prefix of the request ad name.
fn credential_id(request: &ClientRequestAd) -> Option<String> {
    let suffix = format!("_{}@{}", request.request_name, request.client);
    request
        .ad
        .name()
        .and_then(|name| name.strip_suffix(&suffix))
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

fn completed_glidein(ad: &ClassAd, now: i64) -> CompletedGlidein {
    let secs = |name: &str| ad.get_int(name).unwrap_or(0).max(0) as u64;
    let duration = ad.get_int(ATTR_DURATION).unwrap_or_else(|| {
        let start = ad.get_int("JobStartDate").unwrap_or(now);
        ad.get_int("CompletionDate").unwrap_or(now) - start
    });
    let condor_duration = secs(ATTR_CONDOR_DURATION);
    CompletedGlidein {
        client: ad.get_str(ATTR_GLIDEIN_CLIENT).unwrap_or_default().to_string(),
        duration: duration.max(0) as u64,
        condor_started: ad.get_bool(ATTR_CONDOR_STARTED).unwrap_or(condor_duration > 0),
        condor_duration,
        validation_duration: ad.get_int(ATTR_VALIDATION_DURATION).map(|v| v.max(0) as u64),
        jobs_nr: secs(ATTR_JOBS_NR),
        jobs_duration: secs(ATTR_JOBS_SECS),
        goodput: secs(ATTR_GOODPUT),
        nonzero_exit: secs(ATTR_NONZERO_EXIT),
    }
}

fn status_attrs(counts: &Counts, submitted: u64, requested_idle: i64, requested_max_run: i64) -> StatusAttrs {
    [
        ("StatusIdle", counts.idle),
        ("StatusRunning", counts.running),
        ("StatusHeld", counts.held),
        ("StatusSubmitted", submitted as i64),
        ("RequestedIdle", requested_idle),
        ("RequestedMaxGlideins", requested_max_run),
    ]
    .into_iter()
    .map(|(name, value)| (name.to_string(), value))
    .collect()
}
