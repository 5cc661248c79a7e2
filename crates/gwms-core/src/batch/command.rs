use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

use crate::adbus::Constraint;
use crate::batch::{BatchFuture, BatchSystem, JobId, JobSpec};
use crate::classad::wire::escape;
use crate::classad::{AdValue, ClassAd, parse_records};
use crate::common::command::run_command;

/// Batch queue driven through the `condor_*` command line tools.
pub struct CommandBatchSystem {
    schedd: Option<String>,
    work_dir: PathBuf,
    timeout: Duration,
}

impl CommandBatchSystem {
    pub fn new(schedd: Option<String>, work_dir: PathBuf, timeout: Duration) -> Self {
        Self {
            schedd,
            work_dir,
            timeout,
        }
    }

    fn base_args(&self, program: &str) -> Vec<String> {
        let mut args = vec![program.to_string()];
        if let Some(schedd) = &self.schedd {
            args.push("-name".to_string());
            args.push(schedd.clone());
        }
        args
    }

    fn run(&self, arguments: Vec<String>) -> BatchFuture<String> {
        let work_dir = self.work_dir.clone();
        let timeout = self.timeout;
        Box::pin(async move {
            let args: Vec<&str> = arguments.iter().map(|s| s.as_str()).collect();
            run_command(&args, Some(&work_dir), timeout).await
        })
    }
}

fn append_value(value: &AdValue) -> String {
    match value {
        AdValue::String(s) => format!("\"{}\"", escape(s)),
        v => v.to_string(),
    }
}

/// Parses `condor_submit -terse` output, e.g. `12.0 - 12.4`.
pub fn parse_terse_submit(output: &str) -> anyhow::Result<Vec<JobId>> {
    let parse_id = |text: &str| -> anyhow::Result<JobId> {
        let (cluster, proc) = text
            .trim()
            .split_once('.')
            .ok_or_else(|| anyhow::anyhow!("Invalid job id `{text}`"))?;
        Ok(JobId::new(cluster.parse()?, proc.parse()?))
    };
    let mut ids = Vec::new();
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let (first, last) = line.split_once('-').unwrap_or((line, line));
        let first = parse_id(first)?;
        let last = parse_id(last)?;
        ids.extend((first.proc..=last.proc).map(|proc| JobId::new(first.cluster, proc)));
    }
    Ok(ids)
}

impl BatchSystem for CommandBatchSystem {
    fn submit(&self, spec: JobSpec) -> BatchFuture<Vec<JobId>> {
        let mut arguments = Vec::new();
        let current_user = std::env::var("USER").unwrap_or_default();
        if !spec.submit_username.is_empty() && spec.submit_username != current_user {
            arguments.extend(["sudo", "-n", "-u", spec.submit_username.as_str()].map(String::from));
        }
        arguments.extend(self.base_args("condor_submit"));
        arguments.push("-terse".to_string());
        if let Some(file) = &spec.submit_file {
            arguments.push(file.display().to_string());
        }
        let default_attrs = [
            ("GlideinEntryName", AdValue::from(&spec.entry)),
            ("GlideinClient", AdValue::from(&spec.client)),
        ];
        for (name, value) in spec
            .attrs
            .iter()
            .map(|(n, v)| (n.as_str(), v.clone()))
            .chain(default_attrs)
        {
            arguments.push("-append".to_string());
            arguments.push(format!("+{name} = {}", append_value(&value)));
        }
        if !spec.environment.is_empty() {
            let environment = spec
                .environment
                .iter()
                .map(|(k, v)| format!("{k}='{v}'"))
                .collect::<Vec<_>>()
                .join(" ");
            arguments.push("-append".to_string());
            arguments.push(format!("environment = \"{environment}\""));
        }
        if !spec.credential_files.is_empty() {
            let files = spec
                .credential_files
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(",");
            arguments.push("-append".to_string());
            arguments.push(format!("transfer_input_files = {files}"));
        }
        arguments.push("-queue".to_string());
        arguments.push(spec.count.to_string());

        let run = self.run(arguments);
        Box::pin(async move {
            let output = run.await.context("Glidein submission failed")?;
            parse_terse_submit(&output)
        })
    }

    fn remove(&self, constraint: Constraint, force: bool) -> BatchFuture<()> {
        let mut arguments = self.base_args("condor_rm");
        if force {
            arguments.push("-forcex".to_string());
        }
        arguments.push("-constraint".to_string());
        arguments.push(constraint.to_expression());
        let run = self.run(arguments);
        Box::pin(async move {
            run.await.context("condor_rm failed")?;
            Ok(())
        })
    }

    fn release(&self, constraint: Constraint) -> BatchFuture<()> {
        let mut arguments = self.base_args("condor_release");
        arguments.push("-constraint".to_string());
        arguments.push(constraint.to_expression());
        let run = self.run(arguments);
        Box::pin(async move {
            run.await.context("condor_release failed")?;
            Ok(())
        })
    }

    fn query(&self, constraint: Constraint) -> BatchFuture<Vec<ClassAd>> {
        let mut arguments = self.base_args("condor_q");
        arguments.extend(["-allusers", "-long", "-constraint"].map(String::from));
        arguments.push(constraint.to_expression());
        let run = self.run(arguments);
        Box::pin(async move {
            let output = run.await.context("condor_q failed")?;
            let jobs = parse_records(&output).context("Cannot parse condor_q output")?;
            Ok(jobs)
        })
    }
}
