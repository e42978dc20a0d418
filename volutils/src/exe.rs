use std::{
    os::unix::process::ExitStatusExt,
    process::{Command, ExitStatus, Output},
};

use anyhow::{anyhow, Context, Error};
use log::trace;

use crate::crate_private::Sealed;

/// Turns the exit state of a finished process into a `Result`, with the
/// captured output folded into the error report when there is any.
pub trait CheckedOutput: Sealed {
    fn succeeded(&self) -> bool;
    fn exit_code(&self) -> Option<i32>;
    fn end_signal(&self) -> Option<i32>;

    fn stdout_text(&self) -> String {
        String::new()
    }

    fn stderr_text(&self) -> String {
        String::new()
    }

    /// One string with whatever output streams were captured.
    fn output_report(&self) -> String {
        let mut report = String::new();
        let stdout = self.stdout_text();
        if !stdout.is_empty() {
            report.push_str(&format!("stdout:\n{}\n", stdout));
        }
        let stderr = self.stderr_text();
        if !stderr.is_empty() {
            if !report.is_empty() {
                report.push('\n');
            }
            report.push_str(&format!("stderr:\n{}\n", stderr));
        }
        report
    }

    fn explain_exit(&self) -> String {
        if let Some(code) = self.exit_code() {
            format!("process exited with status: {code}")
        } else if let Some(signal) = self.end_signal() {
            format!("process was terminated by signal: {signal}")
        } else {
            "process exited with unknown status".into()
        }
    }

    fn check(&self) -> Result<(), Error> {
        if self.succeeded() {
            return Ok(());
        }
        let report = self.output_report();
        Err(if report.is_empty() {
            anyhow!("(no output was captured)").context(self.explain_exit())
        } else {
            anyhow!("Process output:\n{report}").context(self.explain_exit())
        })
    }

    fn check_output(&self) -> Result<String, Error> {
        self.check()?;
        Ok(self.stdout_text())
    }
}

impl Sealed for Output {}

impl CheckedOutput for Output {
    fn succeeded(&self) -> bool {
        self.status.success()
    }

    fn exit_code(&self) -> Option<i32> {
        self.status.code()
    }

    fn end_signal(&self) -> Option<i32> {
        self.status.end_signal()
    }

    fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into()
    }

    fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into()
    }
}

impl Sealed for ExitStatus {}

impl CheckedOutput for ExitStatus {
    fn succeeded(&self) -> bool {
        self.success()
    }

    fn exit_code(&self) -> Option<i32> {
        self.code()
    }

    fn end_signal(&self) -> Option<i32> {
        self.signal()
    }
}

/// Runs a `Command`, captures its output, and checks the exit status.
pub trait RunAndCheck: Sealed {
    /// Run to completion, failing on non-zero exit.
    fn run_and_check(&mut self) -> Result<(), Error>;

    /// Run to completion, failing on non-zero exit, returning stdout.
    fn output_and_check(&mut self) -> Result<String, Error>;
}

impl Sealed for Command {}

impl RunAndCheck for Command {
    fn run_and_check(&mut self) -> Result<(), Error> {
        trace!("running: {:?}", self);
        self.output()
            .context("Failed to start process")?
            .check()
            .context(format!("Command failed: {:?}", self))
    }

    fn output_and_check(&mut self) -> Result<String, Error> {
        trace!("running: {:?}", self);
        self.output()
            .context("Failed to start process")?
            .check_output()
            .context(format!("Command failed: {:?}", self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_passes() {
        Command::new("true").run_and_check().unwrap();
    }

    #[test]
    fn test_failure_reports_status() {
        let err = Command::new("false").run_and_check().unwrap_err();
        assert!(err.to_string().contains("Command failed"));
    }

    #[test]
    fn test_stdout_captured() {
        let out = Command::new("echo")
            .arg("one fish")
            .output_and_check()
            .unwrap();
        assert_eq!(out.trim(), "one fish");
    }

    #[test]
    fn test_stderr_in_error_report() {
        let err = Command::new("sh")
            .args(["-c", "echo bad >&2; exit 3"])
            .run_and_check()
            .unwrap_err();
        let chain = format!("{:?}", err);
        assert!(chain.contains("bad"), "missing stderr in: {chain}");
        assert!(chain.contains("status: 3"), "missing status in: {chain}");
    }
}
