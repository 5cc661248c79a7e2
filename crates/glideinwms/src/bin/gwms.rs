use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use itertools::Itertools;

use glideinwms::aggregator::sink::JsonSink;
use glideinwms::aggregator::{aggregate, monitor_dir};
use glideinwms::common::cli::{
    DowntimeAddOpts, DowntimeCommand, DowntimeOpts, DowntimeScopeOpts, FactoryCommand, FactoryOpts,
    FrontendCommand, FrontendOpts, RootOptions, SubCommand,
};
use glideinwms::common::process::{EXIT_FAILURE, WorkerArgs, exit_code, parent_alive};
use glideinwms::common::setup::{log_component, setup_logging};
use glideinwms::common::signal::{Interruption, SignalThread};
use glideinwms::common::supervisor::ProcessLauncher;
use glideinwms::factory::config::FactoryConfig;
use glideinwms::factory::downtime::{DowntimeFile, DowntimePeriod};
use glideinwms::factory::{run_entry, run_factory, run_factory_once};
use glideinwms::frontend::config::FrontendConfig;
use glideinwms::frontend::{run_frontend, run_group};

/// HTCondor tools the command backed services call.
const CONDOR_TOOLS: [&str; 6] = [
    "condor_status",
    "condor_advertise",
    "condor_q",
    "condor_submit",
    "condor_rm",
    "condor_release",
];

const PARENT_CHECK_INTERVAL: Duration = Duration::from_secs(5);

fn check_tools() {
    let missing = CONDOR_TOOLS
        .iter()
        .filter(|tool| which::which(tool).is_err())
        .join(", ");
    if !missing.is_empty() {
        log::warn!("Missing from PATH: {missing}; collector and queue calls will fail");
    }
}

/// Arguments that start a worker of the same service with the same descriptor.
fn worker_prefix(service: &str, config: &Path, verbose: bool) -> Vec<String> {
    let mut args = vec![
        service.to_string(),
        "--config".to_string(),
        config.display().to_string(),
        "worker".to_string(),
    ];
    if verbose {
        args.push("--verbose".to_string());
    }
    args
}

/// Interrupts the worker once its parent is gone.
fn watch_parent(args: &WorkerArgs, interruption: &Interruption) -> glideinwms::Result<()> {
    let pid = args.parent_pid;
    if !parent_alive(pid) {
        log::warn!("Parent {pid} is gone, not starting {}", args.name);
        return Err(glideinwms::Error::Interrupted);
    }
    let interruption = interruption.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(PARENT_CHECK_INTERVAL).await;
            if !parent_alive(pid) {
                log::warn!("Parent {pid} is gone, stopping");
                interruption.interrupt();
                break;
            }
        }
    });
    Ok(())
}

async fn command_frontend(opts: FrontendOpts, verbose: bool, interruption: &Interruption) -> glideinwms::Result<()> {
    let config = FrontendConfig::load(&opts.config)?;
    match opts.subcmd {
        FrontendCommand::Start => {
            check_tools();
            let launcher = ProcessLauncher {
                prefix_args: worker_prefix("frontend", &opts.config, verbose),
                work_dir: config.work_dir.clone(),
            };
            run_frontend(&config, launcher, interruption).await
        }
        FrontendCommand::Worker(args) => {
            watch_parent(&args, interruption)?;
            run_group(&config, &args.name, args.action, interruption).await
        }
    }
}

async fn command_factory(opts: FactoryOpts, verbose: bool, interruption: &Interruption) -> glideinwms::Result<()> {
    let config = FactoryConfig::load(&opts.config)?;
    match opts.subcmd {
        FactoryCommand::Start => {
            check_tools();
            let launcher = ProcessLauncher {
                prefix_args: worker_prefix("factory", &opts.config, verbose),
                work_dir: config.work_dir.clone(),
            };
            run_factory(&config, launcher, interruption).await
        }
        FactoryCommand::Worker(args) => {
            watch_parent(&args, interruption)?;
            run_entry(&config, &args.name, args.action, interruption).await
        }
        FactoryCommand::Once => {
            check_tools();
            run_factory_once(&config, interruption).await
        }
        FactoryCommand::Aggregate => {
            let mut sink = JsonSink::new(&monitor_dir(&config.work_dir).join("series"));
            let report = aggregate(&config, &mut sink, Utc::now().timestamp())?;
            if !report.missing.is_empty() {
                log::warn!("No status for entries {}", report.missing.iter().join(", "));
            }
            Ok(())
        }
    }
}

fn downtime_add(file: &DowntimeFile, opts: DowntimeAddOpts) -> glideinwms::Result<()> {
    let DowntimeScopeOpts {
        entry,
        frontend,
        security_class,
    } = opts.scope;
    let mut period = DowntimePeriod::new(opts.start, opts.end);
    period.entry = entry;
    period.frontend = frontend;
    period.security_class = security_class;
    period.comment = opts.comment;
    file.add_period(period)?;
    log::info!("Downtime added to {}", file.path().display());
    Ok(())
}

fn command_downtime(opts: DowntimeOpts) -> glideinwms::Result<()> {
    let config = FactoryConfig::load(&opts.config)?;
    let file = DowntimeFile::new(&config.downtime_path());
    match opts.subcmd {
        DowntimeCommand::Add(add) => downtime_add(&file, add),
        DowntimeCommand::End(scope) => {
            let closed = file.end_downtime(Utc::now(), &scope.entry, &scope.frontend, &scope.security_class)?;
            log::info!("Ended {closed} downtime periods");
            Ok(())
        }
        DowntimeCommand::List => {
            let periods = file.read();
            if !periods.is_empty() {
                println!("{}", periods.iter().map(DowntimePeriod::render).join("\n"));
            }
            Ok(())
        }
        DowntimeCommand::Check(scope) => {
            match file.check(&scope.entry, &scope.frontend, &scope.security_class, Utc::now()) {
                Some(period) => println!("Down: {}", period.render()),
                None => println!("Up"),
            }
            Ok(())
        }
    }
}

fn component(subcmd: &SubCommand) -> String {
    match subcmd {
        SubCommand::Frontend(FrontendOpts {
            subcmd: FrontendCommand::Worker(args),
            ..
        }) => log_component("frontend", Some(&args.name)),
        SubCommand::Frontend(_) => log_component("frontend", None),
        SubCommand::Factory(FactoryOpts {
            subcmd: FactoryCommand::Worker(args),
            ..
        }) => log_component("factory", Some(&args.name)),
        SubCommand::Factory(_) => log_component("factory", None),
        SubCommand::Downtime(_) => log_component("downtime", None),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let opts = RootOptions::parse();
    let verbose = opts.common.verbose;
    setup_logging(verbose, &component(&opts.subcmd));

    let interruption = Interruption::default();
    let _signals = match SignalThread::new(interruption.clone()) {
        Ok(signals) => signals,
        Err(error) => {
            log::error!("Cannot install signal handlers: {error}");
            std::process::exit(EXIT_FAILURE);
        }
    };

    let result = match opts.subcmd {
        SubCommand::Frontend(opts) => command_frontend(opts, verbose, &interruption).await,
        SubCommand::Factory(opts) => command_factory(opts, verbose, &interruption).await,
        SubCommand::Downtime(opts) => command_downtime(opts),
    };

    match &result {
        Ok(()) => {}
        Err(error) if error.is_interrupted() => log::info!("Interrupted"),
        Err(error) => log::error!("{error}"),
    }
    std::process::exit(exit_code(&result));
}
