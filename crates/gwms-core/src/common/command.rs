use std::path::Path;
use std::process::Output;
use std::time::Duration;

use anyhow::Context;
use bstr::ByteSlice;
use tokio::process::Command;

use crate::ExternalResult;

/// Builds the invocation of an external tool; `arguments[0]` is the program.
fn tool_command(arguments: &[&str], workdir: Option<&Path>) -> ExternalResult<Command> {
    let (program, args) = arguments
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("Empty command line"))?;
    let mut command = Command::new(program);
    command.args(args).kill_on_drop(true);
    if let Some(workdir) = workdir {
        command.current_dir(workdir);
    }
    Ok(command)
}

/// Fails with both output streams when the tool exited unsuccessfully.
fn successful(program: &str, output: Output) -> ExternalResult<Output> {
    if output.status.success() {
        return Ok(output);
    }
    anyhow::bail!(
        "{program} failed\nExit code: {}\nStderr: {}\nStdout: {}",
        output.status.code().unwrap_or(-1),
        output.stderr.to_str_lossy().trim(),
        output.stdout.to_str_lossy().trim()
    )
}

/// Runs a command to completion within `timeout` and returns its trimmed stdout.
pub async fn run_command(
    arguments: &[&str],
    workdir: Option<&Path>,
    timeout: Duration,
) -> ExternalResult<String> {
    let mut command = tool_command(arguments, workdir)?;
    let program = arguments[0];
    log::debug!("Running `{}`", arguments.join(" "));
    let output = match tokio::time::timeout(timeout, command.output()).await {
        Ok(output) => output.with_context(|| format!("Cannot start {program}"))?,
        Err(_) => anyhow::bail!("{program} did not finish within {timeout:?}"),
    };
    let output = successful(program, output)?;
    let stdout = output
        .stdout
        .to_str()
        .with_context(|| format!("{program} printed invalid UTF-8"))?;
    Ok(stdout.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failing_command_reports_exit_code() {
        let error = run_command(&["false"], None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(format!("{error:?}").contains("Exit code: 1"));
    }

    #[tokio::test]
    async fn command_stdout_is_trimmed() {
        let out = run_command(&["echo", "  hello "], None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn empty_command_line() {
        assert!(run_command(&[], None, Duration::from_secs(1)).await.is_err());
    }
}
