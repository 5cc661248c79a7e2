use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::{Duration, Instant};

use anyhow::Context;
use futures::future::join_all;

use crate::common::process::{EXIT_SUCCESS, WorkerAction, WorkerArgs};

/// How a worker run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    Exited(i32),
    TimedOut,
    LaunchFailed(String),
}

impl WorkerOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, WorkerOutcome::Exited(EXIT_SUCCESS))
    }
}

pub type LaunchFuture = Pin<Box<dyn Future<Output = WorkerOutcome>>>;

/// Starts one worker run and waits for it for at most `timeout`.
pub trait WorkerLauncher {
    fn launch(&self, name: &str, action: WorkerAction, timeout: Duration) -> LaunchFuture;
}

/// Runs workers as child processes of the current executable.
pub struct ProcessLauncher {
    /// Arguments placed before the worker positional arguments
    pub prefix_args: Vec<String>,
    pub work_dir: PathBuf,
}

async fn run_worker_process(
    prefix_args: Vec<String>,
    args: WorkerArgs,
    timeout: Duration,
) -> anyhow::Result<WorkerOutcome> {
    let program = std::env::current_exe().context("Cannot find the current executable")?;
    let mut command = tokio::process::Command::new(program);
    command.args(prefix_args).args(args.to_args());
    command.kill_on_drop(true);
    let mut child = command.spawn().context("Cannot spawn worker")?;
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => Ok(WorkerOutcome::Exited(status?.code().unwrap_or(-1))),
        Err(_) => {
            // Output of a killed worker is never used
            if let Err(error) = child.kill().await {
                log::warn!("Cannot kill timed out worker {}: {error}", args.name);
            }
            Ok(WorkerOutcome::TimedOut)
        }
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, name: &str, action: WorkerAction, timeout: Duration) -> LaunchFuture {
        let args = WorkerArgs {
            parent_pid: std::process::id(),
            work_dir: self.work_dir.clone(),
            name: name.to_string(),
            action,
        };
        let prefix_args = self.prefix_args.clone();
        Box::pin(async move {
            run_worker_process(prefix_args, args, timeout)
                .await
                .unwrap_or_else(|error| WorkerOutcome::LaunchFailed(format!("{error:?}")))
        })
    }
}

#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub restart_attempts: u32,
    pub restart_interval: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy {
            restart_attempts: 3,
            restart_interval: Duration::from_secs(1800),
        }
    }
}

#[derive(Default)]
struct WorkerState {
    failures: VecDeque<Instant>,
    disabled: bool,
}

impl WorkerState {
    fn record_failure(&mut self, now: Instant, policy: &RestartPolicy) {
        self.failures.push_back(now);
        while let Some(first) = self.failures.front() {
            if now.duration_since(*first) > policy.restart_interval {
                self.failures.pop_front();
            } else {
                break;
            }
        }
        if self.failures.len() > policy.restart_attempts as usize {
            self.disabled = true;
        }
    }
}

/// Keeps one worker per group or entry running every iteration.
pub struct Supervisor<L> {
    launcher: L,
    policy: RestartPolicy,
    timeout: Duration,
    workers: BTreeMap<String, WorkerState>,
}

impl<L: WorkerLauncher> Supervisor<L> {
    pub fn new<I: IntoIterator<Item = String>>(
        launcher: L,
        names: I,
        policy: RestartPolicy,
        timeout: Duration,
    ) -> Self {
        Supervisor {
            launcher,
            policy,
            timeout,
            workers: names
                .into_iter()
                .map(|name| (name, WorkerState::default()))
                .collect(),
        }
    }

    pub fn active_workers(&self) -> Vec<&str> {
        self.workers
            .iter()
            .filter(|(_, state)| !state.disabled)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Runs `action` in every enabled worker concurrently and returns the outcomes.
    pub async fn run_iteration(&mut self, action: WorkerAction) -> BTreeMap<String, WorkerOutcome> {
        let names: Vec<String> = self
            .active_workers()
            .into_iter()
            .map(|name| name.to_string())
            .collect();
        let outcomes = join_all(
            names
                .iter()
                .map(|name| self.launcher.launch(name, action, self.timeout)),
        )
        .await;

        let now = Instant::now();
        let mut result = BTreeMap::new();
        for (name, outcome) in names.into_iter().zip(outcomes) {
            if !outcome.is_success() {
                log::warn!("Worker {name} failed: {outcome:?}");
                if let Some(state) = self.workers.get_mut(&name) {
                    state.record_failure(now, &self.policy);
                    if state.disabled {
                        log::error!(
                            "Worker {name} failed more than {} times within {:?}, disabling it",
                            self.policy.restart_attempts,
                            self.policy.restart_interval
                        );
                    }
                }
            }
            result.insert(name, outcome);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct FakeLauncher {
        outcomes: Rc<RefCell<BTreeMap<String, WorkerOutcome>>>,
        launched: Rc<RefCell<Vec<String>>>,
    }

    impl WorkerLauncher for FakeLauncher {
        fn launch(&self, name: &str, _action: WorkerAction, _timeout: Duration) -> LaunchFuture {
            self.launched.borrow_mut().push(name.to_string());
            let outcome = self
                .outcomes
                .borrow()
                .get(name)
                .cloned()
                .unwrap_or(WorkerOutcome::Exited(0));
            Box::pin(async move { outcome })
        }
    }

    #[tokio::test]
    async fn failing_worker_is_disabled_after_restart_attempts() {
        let launcher = FakeLauncher::default();
        launcher
            .outcomes
            .borrow_mut()
            .insert("bad".to_string(), WorkerOutcome::Exited(2));
        let policy = RestartPolicy {
            restart_attempts: 2,
            restart_interval: Duration::from_secs(3600),
        };
        let mut supervisor = Supervisor::new(
            launcher.clone(),
            ["good".to_string(), "bad".to_string()],
            policy,
            Duration::from_secs(10),
        );

        for _ in 0..3 {
            let outcomes = supervisor.run_iteration(WorkerAction::Run).await;
            assert_eq!(outcomes["good"], WorkerOutcome::Exited(0));
        }
        assert_eq!(supervisor.active_workers(), vec!["good"]);

        launcher.launched.borrow_mut().clear();
        supervisor.run_iteration(WorkerAction::Run).await;
        assert_eq!(*launcher.launched.borrow(), vec!["good".to_string()]);
    }

    #[tokio::test]
    async fn timeouts_count_as_failures() {
        let launcher = FakeLauncher::default();
        launcher
            .outcomes
            .borrow_mut()
            .insert("slow".to_string(), WorkerOutcome::TimedOut);
        let policy = RestartPolicy {
            restart_attempts: 0,
            restart_interval: Duration::from_secs(3600),
        };
        let mut supervisor = Supervisor::new(
            launcher,
            ["slow".to_string()],
            policy,
            Duration::from_secs(1),
        );
        supervisor.run_iteration(WorkerAction::Run).await;
        assert!(supervisor.active_workers().is_empty());
    }
}
