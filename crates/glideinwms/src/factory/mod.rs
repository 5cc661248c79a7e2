pub mod ads;
pub mod config;
pub mod downtime;
pub mod entry;
pub mod global;
pub mod glideins;
pub mod security;
pub mod totals;

use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use gwms_core::adbus::command::CommandAdBus;
use gwms_core::adbus::{AdBus, Constraint};
use gwms_core::batch::command::CommandBatchSystem;
use gwms_core::classad::{ATTR_NAME, AdType, SequenceCounter};
use gwms_core::crypto::RsaKey;

use crate::aggregator::sink::{JsonSink, MonitorSink};
use crate::aggregator::{aggregate, expected_attrs, monitor_dir};
use crate::common::config::{get_loop_delay, get_query_timeout, get_worker_timeout};
use crate::common::error::error;
use crate::common::process::WorkerAction;
use crate::common::signal::Interruption;
use crate::common::supervisor::{Supervisor, WorkerLauncher};
use crate::factory::config::FactoryConfig;
use crate::factory::entry::{EntryReport, EntryServices, EntryWorker};
use crate::factory::global::{FactoryWork, advertise_global, find_work, load_or_create_key};
use crate::frontend::sources::bounded;

/// Services of the factory backed by the HTCondor command line tools.
pub fn command_services(config: &FactoryConfig, timeout: Duration) -> EntryServices {
    EntryServices {
        bus: Rc::new(CommandAdBus::new(
            config.factory_collector.clone(),
            config.work_dir.clone(),
            timeout,
        )),
        batch: Rc::new(CommandBatchSystem::new(
            config.schedd.clone(),
            config.work_dir.clone(),
            timeout,
        )),
        timeout,
    }
}

/// The key written by the parent; entry workers never create one.
fn read_key(config: &FactoryConfig) -> crate::Result<RsaKey> {
    let pem = std::fs::read(config.rsa_key_path())?;
    Ok(RsaKey::from_pem(&pem)?)
}

/// One run of an entry worker process.
pub async fn run_entry(
    config: &FactoryConfig,
    entry: &str,
    action: WorkerAction,
    interruption: &Interruption,
) -> crate::Result<()> {
    let key = read_key(config)?;
    let services = command_services(config, get_query_timeout());
    let mut worker = EntryWorker::new(config, entry, &key, services)?;
    let report = interruption.guard(worker.run(action)).await??;
    if report.queue_unavailable {
        log::info!("entry {entry}: queue was unavailable, only advertised");
    }
    Ok(())
}

/// Serves every entry from one decoded view of the requests.
///
/// Entries are independent: the outcome of one never changes what another does.
pub async fn iterate_entries(
    workers: &mut [EntryWorker<'_>],
    work: &FactoryWork,
    now: DateTime<Utc>,
) -> BTreeMap<String, EntryReport> {
    let mut reports = BTreeMap::new();
    for worker in workers.iter_mut() {
        let report = worker.iterate(work, now).await;
        reports.insert(worker.name().to_string(), report);
    }
    reports
}

/// Runs every entry once inside this process, without workers.
pub async fn run_factory_once(config: &FactoryConfig, interruption: &Interruption) -> crate::Result<()> {
    let key = load_or_create_key(&config.rsa_key_path(), config.key_bits)?;
    let timeout = get_query_timeout();
    let services = command_services(config, timeout);
    let bus = services.bus.clone();
    let mut sequence = SequenceCounter::default();
    advertise_global(bus.as_ref(), config, &key, &mut sequence, timeout).await?;
    let work = interruption
        .guard(find_work(bus.as_ref(), config, &key, timeout))
        .await??;

    let mut workers = Vec::with_capacity(config.entries.len());
    for entry in &config.entries {
        let services = EntryServices {
            bus: services.bus.clone(),
            batch: services.batch.clone(),
            timeout,
        };
        workers.push(EntryWorker::new(config, &entry.name, &key, services)?);
    }
    let reports = interruption
        .guard(iterate_entries(&mut workers, &work, Utc::now()))
        .await?;
    for (entry, report) in &reports {
        log::info!("entry {entry}: {report:?}");
    }
    let mut sink = JsonSink::new(&monitor_dir(&config.work_dir).join("series"));
    aggregate(config, &mut sink, Utc::now().timestamp())?;
    Ok(())
}

async fn deadvertise_global(bus: &dyn AdBus, config: &FactoryConfig, timeout: Duration) {
    let constraint = Constraint::eq(ATTR_NAME, config.glidein_factory());
    let withdrawal = bus.invalidate(AdType::FactoryGlobal, constraint);
    if let Err(error) = bounded(timeout, "Factory global withdrawal", withdrawal).await {
        log::warn!("Cannot withdraw the factory global ad: {error:?}");
    }
}

/// Parent loop: advertises the factory key, runs every entry once per iteration and
/// aggregates their monitoring until interrupted, then deadvertises.
pub async fn run_factory<L: WorkerLauncher>(
    config: &FactoryConfig,
    launcher: L,
    interruption: &Interruption,
) -> crate::Result<()> {
    let key = load_or_create_key(&config.rsa_key_path(), config.key_bits)?;
    let timeout = get_query_timeout();
    let bus = command_services(config, timeout).bus;
    let mut sink = JsonSink::new(&monitor_dir(&config.work_dir).join("series"));
    sink.verify(&expected_attrs(), true)?;
    run_factory_with(config, &key, bus.as_ref(), &mut sink, launcher, interruption).await
}

pub async fn run_factory_with<L: WorkerLauncher>(
    config: &FactoryConfig,
    key: &RsaKey,
    bus: &dyn AdBus,
    sink: &mut dyn MonitorSink,
    launcher: L,
    interruption: &Interruption,
) -> crate::Result<()> {
    let loop_delay = get_loop_delay(config.loop_delay);
    let timeout = get_query_timeout();
    let mut sequence = SequenceCounter::default();
    let mut supervisor = Supervisor::new(
        launcher,
        config.entries.iter().map(|entry| entry.name.clone()),
        config.restart_policy(),
        get_worker_timeout(loop_delay),
    );
    log::info!(
        "Factory {} started with entries {:?}",
        config.glidein_factory(),
        supervisor.active_workers()
    );

    let result = loop {
        if supervisor.active_workers().is_empty() {
            break error("Every entry worker has been disabled".to_string());
        }
        let advertised = advertise_global(bus, config, key, &mut sequence, timeout);
        match interruption.guard(advertised).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => log::warn!("Cannot advertise the factory key: {error}"),
            Err(error) => break Err(error),
        }
        match interruption.guard(supervisor.run_iteration(WorkerAction::Run)).await {
            Ok(outcomes) => {
                let failed = outcomes.values().filter(|o| !o.is_success()).count();
                log::info!("Iteration done, {failed} of {} entries failed", outcomes.len());
            }
            Err(error) => break Err(error),
        }
        if let Err(error) = aggregate(config, sink, Utc::now().timestamp()) {
            log::warn!("Cannot aggregate the entry monitoring: {error}");
        }
        if let Err(error) = interruption.guard(tokio::time::sleep(loop_delay)).await {
            break Err(error);
        }
    };

    log::info!("Factory {} stopping, deadvertising", config.glidein_factory());
    supervisor.run_iteration(WorkerAction::Deadvertise).await;
    deadvertise_global(bus, config, timeout).await;
    match result {
        Err(error) if error.is_interrupted() => Ok(()),
        other => other,
    }
}
