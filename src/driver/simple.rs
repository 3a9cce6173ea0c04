//! Driver that runs the program as a child process.

use super::helper::{find_executable, ExitOutcome};
use super::{Driver, DriverCommon};
use crate::error::{Result, ToolError};
use log::debug;
use std::io::Write;
use std::process::{Child, Command, Stdio};

pub struct SimpleDriver {
    common: DriverCommon,
    child: Option<Child>,
}

impl SimpleDriver {
    /// Fails with `NotAvailable` when the program cannot be found.
    pub fn new(executable: &str) -> Result<Self> {
        let resolved = find_executable(executable)?;
        Ok(Self {
            common: DriverCommon::new(executable, resolved),
            child: None,
        })
    }

    fn write_stdin(child: &mut Child, record: &str) -> Result<()> {
        let stdin = child
            .stdin
            .as_mut()
            .ok_or_else(|| ToolError::Protocol("standard input already closed".into()))?;
        stdin.write_all(record.as_bytes())?;
        if !record.ends_with('\n') {
            stdin.write_all(b"\n")?;
        }
        Ok(())
    }
}

impl Driver for SimpleDriver {
    fn common(&self) -> &DriverCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut DriverCommon {
        &mut self.common
    }

    fn start(&mut self) -> Result<()> {
        if self.child.is_some() {
            return Err(ToolError::Protocol(format!("{} already started", self.common.executable)).into());
        }
        std::fs::create_dir_all(&self.common.working_directory)?;
        debug!(
            "running {} in {}",
            self.common.command_string(),
            self.common.working_directory.display()
        );

        let mut command = Command::new(&self.common.resolved);
        command
            .args(&self.common.command_line)
            .current_dir(&self.common.working_directory)
            .envs(self.common.child_environment(|name| std::env::var(name).ok()))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn()?;
        self.common.mark_started();
        for record in &self.common.input {
            Self::write_stdin(&mut child, record)?;
        }
        self.child = Some(child);
        Ok(())
    }

    fn input(&mut self, record: &str) -> Result<()> {
        if let Some(child) = self.child.as_mut() {
            Self::write_stdin(child, record)?;
        }
        self.common.input.push(record.to_string());
        Ok(())
    }

    fn close_wait(&mut self) -> Result<()> {
        let mut child = self
            .child
            .take()
            .ok_or_else(|| ToolError::Protocol(format!("{} was never started", self.common.executable)))?;
        // Closing stdin lets the program see end of input.
        drop(child.stdin.take());
        let output = child.wait_with_output()?;

        let mut lines: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect();
        lines.extend(
            String::from_utf8_lossy(&output.stderr)
                .lines()
                .map(str::to_string),
        );
        self.common
            .mark_finished(lines, ExitOutcome::from_status(output.status))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_missing_executable() {
        let err = SimpleDriver::new("surely-not-a-real-program").err().unwrap();
        assert_eq!(err.to_string(), "executable surely-not-a-real-program does not exist in PATH");
    }

    #[test]
    fn test_runs_with_stdin_and_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = SimpleDriver::new("cat").unwrap();
        driver.set_working_directory(dir.path());
        driver.input("first").unwrap();
        driver.start().unwrap();
        driver.input("second").unwrap();

        assert!(driver.get_all_output().is_err());
        driver.close_wait().unwrap();

        assert_eq!(driver.get_all_output().unwrap(), ["first", "second"]);
        assert!(driver.check_for_errors().is_ok());
        assert!(driver.log_file().unwrap().exists());
    }

    #[test]
    fn test_nonzero_exit_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = SimpleDriver::new("sh").unwrap();
        driver.set_working_directory(dir.path());
        driver.add_command_line("-c");
        driver.add_command_line("echo working; exit 3");
        driver.start().unwrap();
        driver.close_wait().unwrap();

        let err = driver.check_for_errors().unwrap_err();
        assert_eq!(err.to_string(), "subprocess failed with exitcode 3");
    }

    #[test]
    fn test_environment_reaches_child() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = SimpleDriver::new("sh").unwrap();
        driver.set_working_directory(dir.path());
        driver.set_environment("XIA2RS_TEST_VALUE", "shown");
        driver.add_command_line("-c");
        driver.add_command_line("echo $XIA2RS_TEST_VALUE");
        driver.start().unwrap();
        driver.close_wait().unwrap();
        assert_eq!(driver.get_all_output().unwrap(), ["shown"]);
    }
}
