//! Driver that submits the program to Grid Engine.
//!
//! Nothing is submitted until `close_wait`: the command line and input are
//! written into a bash script, the script is submitted with
//! `qsub -V -cwd [-pe smp N]`, and `qstat -j <id>` is polled until the job
//! has left the queue. The job's redirected output is then read back as if
//! the program had run locally.

use super::helper::{find_executable, script_writer, ExitOutcome};
use super::{Driver, DriverCommon};
use crate::error::{Result, ToolError};
use log::{debug, warn};
use regex::Regex;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

/// Captured streams of a scheduler command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// The scheduler commands the driver needs.
pub trait GridEngine: Send + Sync {
    /// Run the submission command with `args` appended.
    fn submit(&self, args: &[String], cwd: &Path) -> Result<CommandOutput>;

    /// Query the status of `job_id`.
    fn status(&self, job_id: &str, cwd: &Path) -> Result<CommandOutput>;

    /// Wait between status queries.
    fn pause(&self, interval: Duration) {
        std::thread::sleep(interval);
    }
}

/// Real `qsub`/`qstat` invocations.
pub struct SgeCommands {
    qsub: Vec<String>,
}

impl SgeCommands {
    pub fn new(qsub: Vec<String>) -> Self {
        Self { qsub }
    }

    fn run(program: &str, args: &[String], cwd: &Path) -> Result<CommandOutput> {
        let output = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .output()
            .map_err(|e| ToolError::Scheduler(format!("cannot run {program}: {e}")))?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

impl GridEngine for SgeCommands {
    fn submit(&self, args: &[String], cwd: &Path) -> Result<CommandOutput> {
        let (program, leading) = self
            .qsub
            .split_first()
            .ok_or_else(|| ToolError::Scheduler("empty qsub command".into()))?;
        let mut all = leading.to_vec();
        all.extend_from_slice(args);
        Self::run(program, &all, cwd)
    }

    fn status(&self, job_id: &str, cwd: &Path) -> Result<CommandOutput> {
        Self::run("qstat", &["-j".to_string(), job_id.to_string()], cwd)
    }
}

pub struct QsubDriver {
    common: DriverCommon,
    engine: Arc<dyn GridEngine>,
    poll_interval: Duration,
    started: bool,
    job_id: Option<String>,
    polls: usize,
}

impl QsubDriver {
    pub fn new(executable: &str, engine: Arc<dyn GridEngine>, poll_interval: Duration) -> Result<Self> {
        let resolved = find_executable(executable)?;
        Ok(Self::with_resolved(executable, resolved, engine, poll_interval))
    }

    /// Build without a PATH lookup on the submitting host.
    pub fn with_resolved(
        executable: &str,
        resolved: std::path::PathBuf,
        engine: Arc<dyn GridEngine>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            common: DriverCommon::new(executable, resolved),
            engine,
            poll_interval,
            started: false,
            job_id: None,
            polls: 0,
        }
    }

    pub fn script_name(&self) -> String {
        format!("J{}", self.common.name)
    }

    pub fn job_id(&self) -> Option<&str> {
        self.job_id.as_deref()
    }

    /// Number of `qstat` queries made while waiting for the last job.
    pub fn polls(&self) -> usize {
        self.polls
    }

    fn submit(&mut self, script: &str) -> Result<String> {
        let mut args = vec!["-V".to_string(), "-cwd".to_string()];
        if self.common.cpu_threads > 1 {
            args.extend([
                "-pe".to_string(),
                "smp".to_string(),
                self.common.cpu_threads.to_string(),
            ]);
        }
        args.push(format!("{script}.sh"));

        let reply = self.engine.submit(&args, &self.common.working_directory)?;
        if reply.stderr.contains("error opening") {
            let program = reply
                .stderr
                .lines()
                .find(|l| l.contains("error opening"))
                .and_then(|l| l.split(':').next())
                .map(|s| s.replace("error opening ", ""))
                .unwrap_or_else(|| self.common.executable.clone());
            return Err(ToolError::NotAvailable(program).into());
        }
        let pattern = Regex::new(r"Your job(?:-array)? (\d+)")
            .map_err(|e| ToolError::Scheduler(format!("bad job id pattern: {e}")))?;
        pattern
            .captures(&reply.stdout)
            .map(|c| c[1].to_string())
            .ok_or_else(|| {
                ToolError::Scheduler(format!(
                    "no job id in submission reply: {}",
                    reply.stdout.trim()
                ))
                .into()
            })
    }

    fn wait_for(&mut self, job_id: &str) -> Result<()> {
        self.polls = 0;
        loop {
            let reply = self.engine.status(job_id, &self.common.working_directory)?;
            self.polls += 1;
            if reply.stderr.contains("Following jobs do not exist") {
                return Ok(());
            }
            self.engine.pause(self.poll_interval);
        }
    }

    /// Grid Engine's own stderr file must not report a missing program.
    fn check_sge_errors(&self, stderr_file: &Path) -> Result<()> {
        let text = std::fs::read_to_string(stderr_file).unwrap_or_default();
        for line in text.lines() {
            if line.contains("command not found") {
                let program = line.split(':').nth(2).unwrap_or(line).trim().to_string();
                return Err(ToolError::NotAvailable(program).into());
            }
        }
        Ok(())
    }

    fn tidy(&self, script: &str, job_id: &str) {
        for suffix in ["o", "e", "po", "pe"] {
            let path = self
                .common
                .working_directory
                .join(format!("{script}.sh.{suffix}{job_id}"));
            if path.exists() {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!("could not remove {}: {e}", path.display());
                }
            }
        }
    }
}

impl Driver for QsubDriver {
    fn common(&self) -> &DriverCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut DriverCommon {
        &mut self.common
    }

    fn start(&mut self) -> Result<()> {
        self.started = true;
        self.common.mark_started();
        Ok(())
    }

    fn close_wait(&mut self) -> Result<()> {
        if !self.started {
            return Err(ToolError::Protocol(format!("{} was never started", self.common.executable)).into());
        }
        let working = self.common.working_directory.clone();
        std::fs::create_dir_all(working.join("jobs"))?;

        // Grid Engine drops the library path even with -V.
        if !self.common.environment.contains_key("LD_LIBRARY_PATH") {
            if let Ok(value) = std::env::var("LD_LIBRARY_PATH") {
                self.common.environment.insert(
                    "LD_LIBRARY_PATH".to_string(),
                    std::env::split_paths(&value)
                        .map(|p| p.display().to_string())
                        .collect(),
                );
            }
        }

        let script_name = self.script_name();
        let relative = format!("jobs/{script_name}");
        script_writer(
            &working,
            &relative,
            &self.common.resolved.display().to_string(),
            &self.common.command_line,
            &self.common.environment,
            &self.common.input,
        )?;

        let job_id = self.submit(&relative)?;
        debug!("submitted {} as job {job_id}", self.common.command_string());
        self.job_id = Some(job_id.clone());
        self.wait_for(&job_id)?;

        self.check_sge_errors(&working.join(format!("{script_name}.sh.e{job_id}")))?;

        let output = std::fs::read_to_string(working.join(format!("{relative}.xout")))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect();
        let status = std::fs::read_to_string(working.join(format!("{relative}.xstatus")))
            .ok()
            .and_then(|s| s.trim().parse::<i32>().ok())
            .map(ExitOutcome::code)
            .unwrap_or_else(ExitOutcome::success);

        self.common.mark_finished(output, status)?;
        self.tidy(&script_name, &job_id);
        Ok(())
    }
}
