use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_INTERRUPTED: i32 = 1;
pub const EXIT_FAILURE: i32 = 2;

/// Strength of a one-shot or configured glidein removal.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RemovalKind {
    Wait,
    Idle,
    All,
}

impl RemovalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemovalKind::Wait => "Wait",
            RemovalKind::Idle => "Idle",
            RemovalKind::All => "All",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WorkerAction {
    Run,
    /// Invalidate every ad this worker ever published.
    Deadvertise,
    /// Ask the factories once to remove glideins; `excess_only` keeps the ones still needed.
    Remove {
        kind: RemovalKind,
        excess_only: bool,
    },
}

impl FromStr for WorkerAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "run" => return Ok(WorkerAction::Run),
            "deadvertise" => return Ok(WorkerAction::Deadvertise),
            _ => {}
        }
        let Some(rest) = s.strip_prefix("remove") else {
            return Err(format!("Unknown worker action `{s}`"));
        };
        let (kind, excess_only) = match rest.strip_suffix("Excess") {
            Some(kind) => (kind, true),
            None => (rest, false),
        };
        let kind = match kind {
            "Wait" => RemovalKind::Wait,
            "Idle" => RemovalKind::Idle,
            "All" => RemovalKind::All,
            _ => return Err(format!("Unknown removal action `{s}`")),
        };
        Ok(WorkerAction::Remove { kind, excess_only })
    }
}

impl Display for WorkerAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerAction::Run => f.write_str("run"),
            WorkerAction::Deadvertise => f.write_str("deadvertise"),
            WorkerAction::Remove { kind, excess_only } => write!(
                f,
                "remove{}{}",
                kind.as_str(),
                if *excess_only { "Excess" } else { "" }
            ),
        }
    }
}

/// Positional interface of a worker process.
#[derive(Parser, Debug, Clone)]
pub struct WorkerArgs {
    /// Pid of the supervising parent; the worker exits once it is gone
    pub parent_pid: u32,
    pub work_dir: PathBuf,
    /// Group (frontend) or entry (factory) served by the worker
    pub name: String,
    #[arg(default_value = "run")]
    pub action: WorkerAction,
}

impl WorkerArgs {
    pub fn to_args(&self) -> Vec<String> {
        vec![
            self.parent_pid.to_string(),
            self.work_dir.display().to_string(),
            self.name.clone(),
            self.action.to_string(),
        ]
    }
}

pub fn parent_alive(pid: u32) -> bool {
    // EPERM still means the process exists
    !matches!(kill(Pid::from_raw(pid as i32), None), Err(Errno::ESRCH))
}

/// Exit code of a worker whose run ended with `result`.
pub fn exit_code(result: &crate::Result<()>) -> i32 {
    match result {
        Ok(()) => EXIT_SUCCESS,
        Err(error) if error.is_interrupted() => EXIT_INTERRUPTED,
        Err(_) => EXIT_FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::error::GwmsError;

    #[test]
    fn parse_actions() {
        assert_eq!("run".parse::<WorkerAction>().unwrap(), WorkerAction::Run);
        assert_eq!(
            "removeIdleExcess".parse::<WorkerAction>().unwrap(),
            WorkerAction::Remove {
                kind: RemovalKind::Idle,
                excess_only: true
            }
        );
        assert_eq!(
            "removeAll".parse::<WorkerAction>().unwrap(),
            WorkerAction::Remove {
                kind: RemovalKind::All,
                excess_only: false
            }
        );
        assert!("removeSome".parse::<WorkerAction>().is_err());
        assert!("stop".parse::<WorkerAction>().is_err());
        assert_eq!(
            "removeWaitExcess"
                .parse::<WorkerAction>()
                .unwrap()
                .to_string(),
            "removeWaitExcess"
        );
    }

    #[test]
    fn worker_args_round_trip() {
        let args = WorkerArgs::try_parse_from(["worker", "42", "/var/lib/fe", "main"]).unwrap();
        assert_eq!(args.action, WorkerAction::Run);
        assert_eq!(args.to_args(), vec!["42", "/var/lib/fe", "main", "run"]);
        let args =
            WorkerArgs::try_parse_from(["worker", "42", "/w", "main", "deadvertise"]).unwrap();
        assert_eq!(args.action, WorkerAction::Deadvertise);
    }

    #[test]
    fn exit_codes() {
        assert_eq!(exit_code(&Ok(())), EXIT_SUCCESS);
        assert_eq!(exit_code(&Err(GwmsError::Interrupted)), EXIT_INTERRUPTED);
        assert_eq!(
            exit_code(&Err(GwmsError::GenericError("boom".into()))),
            EXIT_FAILURE
        );
    }

    #[test]
    fn current_process_is_alive() {
        assert!(parent_alive(std::process::id()));
    }
}
