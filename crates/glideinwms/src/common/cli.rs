use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::Parser;

use crate::common::process::WorkerArgs;
use crate::factory::downtime::{ALL, parse_time};

#[derive(Parser)]
#[command(author, about, version(crate::GWMS_VERSION))]
pub struct RootOptions {
    #[clap(flatten)]
    pub common: CommonOpts,

    #[clap(subcommand)]
    pub subcmd: SubCommand,
}

#[derive(Parser)]
pub struct CommonOpts {
    /// Enables more verbose logging
    #[arg(long, global = true, env = "GWMS_VERBOSE")]
    pub verbose: bool,
}

#[derive(Parser)]
pub enum SubCommand {
    /// Commands of the frontend service
    Frontend(FrontendOpts),
    /// Commands of the factory service
    Factory(FactoryOpts),
    /// Manages the downtime file of a factory
    Downtime(DowntimeOpts),
}

#[derive(Parser)]
pub struct FrontendOpts {
    /// Frontend descriptor
    #[arg(long, value_hint = clap::ValueHint::FilePath)]
    pub config: PathBuf,

    #[clap(subcommand)]
    pub subcmd: FrontendCommand,
}

#[derive(Parser)]
pub struct FactoryOpts {
    /// Factory descriptor
    #[arg(long, value_hint = clap::ValueHint::FilePath)]
    pub config: PathBuf,

    #[clap(subcommand)]
    pub subcmd: FactoryCommand,
}

#[derive(Parser)]
pub enum FrontendCommand {
    /// Runs the parent loop supervising one worker per group
    Start,
    /// Runs one iteration of a group (started by the parent)
    Worker(WorkerArgs),
}

#[derive(Parser)]
pub enum FactoryCommand {
    /// Runs the parent loop supervising one worker per entry
    Start,
    /// Runs one iteration of an entry (started by the parent)
    Worker(WorkerArgs),
    /// Serves every entry once in this process and aggregates
    Once,
    /// Rebuilds the factory wide monitoring from the entry snapshots
    Aggregate,
}

#[derive(Parser)]
pub struct DowntimeOpts {
    /// Factory descriptor
    #[arg(long, value_hint = clap::ValueHint::FilePath)]
    pub config: PathBuf,

    #[clap(subcommand)]
    pub subcmd: DowntimeCommand,
}

#[derive(Parser)]
pub enum DowntimeCommand {
    /// Adds a downtime period
    Add(DowntimeAddOpts),
    /// Ends the matching downtime periods now
    End(DowntimeScopeOpts),
    /// Prints the downtime periods
    List,
    /// Tells whether an entry is in downtime now
    Check(DowntimeScopeOpts),
}

fn parse_cli_time(value: &str) -> anyhow::Result<DateTime<Utc>> {
    if value == "now" {
        return Ok(Utc::now());
    }
    parse_time(value).ok_or_else(|| anyhow::anyhow!("Invalid time `{value}`"))
}

#[derive(Parser)]
pub struct DowntimeScopeOpts {
    /// Entry name, `All` for every entry, `factory` for the factory itself
    #[arg(long, default_value = ALL)]
    pub entry: String,
    #[arg(long, default_value = ALL)]
    pub frontend: String,
    #[arg(long, default_value = ALL)]
    pub security_class: String,
}

#[derive(Parser)]
pub struct DowntimeAddOpts {
    #[clap(flatten)]
    pub scope: DowntimeScopeOpts,

    /// ISO-8601 time, seconds since the epoch or `now`
    #[arg(long, default_value = "now", value_parser = parse_cli_time)]
    pub start: DateTime<Utc>,

    /// Open ended when missing
    #[arg(long, value_parser = parse_cli_time)]
    pub end: Option<DateTime<Utc>>,

    #[arg(long, default_value = "")]
    pub comment: String,
}
