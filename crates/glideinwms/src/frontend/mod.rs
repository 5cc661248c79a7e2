pub mod ads;
pub mod broker;
pub mod classify;
pub mod config;
pub mod group;
pub mod keys;
pub mod policies;
pub mod removal;
pub mod sizing;
pub mod sources;

use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use gwms_core::adbus::AdBus;
use gwms_core::adbus::command::CommandAdBus;
use gwms_core::batch::BatchSystem;
use gwms_core::batch::command::CommandBatchSystem;

use crate::common::config::{get_loop_delay, get_query_timeout, get_worker_timeout};
use crate::common::error::{configuration_error, error};
use crate::common::process::WorkerAction;
use crate::common::signal::Interruption;
use crate::common::supervisor::{Supervisor, WorkerLauncher};
use crate::frontend::config::FrontendConfig;
use crate::frontend::group::GroupWorker;
use crate::frontend::sources::{FactoryPool, Services};

/// Services of one group backed by the HTCondor command line tools.
pub fn command_services(config: &FrontendConfig, group: &str, timeout: Duration) -> crate::Result<Services> {
    let Some(group) = config.group(group) else {
        return configuration_error(format!("Unknown group {group}"));
    };
    let work_dir = config.group_work_dir(&group.name);
    let factory_pools = config
        .factory_pools
        .iter()
        .map(|pool| FactoryPool {
            config: pool.clone(),
            bus: Rc::new(CommandAdBus::new(Some(pool.pool.clone()), work_dir.clone(), timeout))
                as Rc<dyn AdBus>,
        })
        .collect();
    let schedds: BTreeMap<String, Rc<dyn BatchSystem>> = config
        .group_schedds(group)
        .iter()
        .map(|schedd| {
            let batch: Rc<dyn BatchSystem> = Rc::new(CommandBatchSystem::new(
                Some(schedd.clone()),
                work_dir.clone(),
                timeout,
            ));
            (schedd.clone(), batch)
        })
        .collect();
    Ok(Services {
        factory_pools,
        user_pool: Rc::new(CommandAdBus::new(config.agent_pool.clone(), work_dir, timeout)),
        schedds,
        timeout,
    })
}

/// One run of a group worker process.
pub async fn run_group(
    config: &FrontendConfig,
    group: &str,
    action: WorkerAction,
    interruption: &Interruption,
) -> crate::Result<()> {
    let services = command_services(config, group, get_query_timeout())?;
    let mut worker = GroupWorker::new(config, group, services)?;
    let report = interruption.guard(worker.run(action)).await??;
    if report.skipped {
        log::info!("group {group}: standing by for the master");
    }
    Ok(())
}

/// Parent loop: runs every group once per iteration until interrupted, then deadvertises.
pub async fn run_frontend<L: WorkerLauncher>(
    config: &FrontendConfig,
    launcher: L,
    interruption: &Interruption,
) -> crate::Result<()> {
    let loop_delay = get_loop_delay(config.loop_delay);
    let mut supervisor = Supervisor::new(
        launcher,
        config.groups().map(|group| group.name.clone()),
        config.restart_policy(),
        get_worker_timeout(loop_delay),
    );
    log::info!(
        "Frontend {} started with groups {:?}",
        config.frontend_name,
        supervisor.active_workers()
    );

    let result = loop {
        if supervisor.active_workers().is_empty() {
            break error("Every group worker has been disabled".to_string());
        }
        match interruption.guard(supervisor.run_iteration(WorkerAction::Run)).await {
            Ok(outcomes) => {
                let failed = outcomes.values().filter(|o| !o.is_success()).count();
                log::info!("Iteration done, {failed} of {} groups failed", outcomes.len());
            }
            Err(error) => break Err(error),
        }
        if let Err(error) = interruption.guard(tokio::time::sleep(loop_delay)).await {
            break Err(error);
        }
    };

    log::info!("Frontend {} stopping, deadvertising", config.frontend_name);
    supervisor.run_iteration(WorkerAction::Deadvertise).await;
    match result {
        Err(error) if error.is_interrupted() => Ok(()),
        other => other,
    }
}
