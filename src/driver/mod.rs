//! Running external programs.
//!
//! A [`Driver`] wraps one invocation of one program: the command line, the
//! records fed to standard input, the environment, and after
//! [`Driver::close_wait`] the captured output and exit status. Two
//! backends exist: [`SimpleDriver`] runs a child process directly and
//! [`QsubDriver`] submits a script to Grid Engine and polls for completion.

pub mod ccp4;
pub mod helper;
pub mod qsub;
pub mod simple;

pub use ccp4::{parse_loggraph, Ccp4Capability, LogGraph};
pub use helper::ExitOutcome;
pub use qsub::{CommandOutput, GridEngine, QsubDriver, SgeCommands};
pub use simple::SimpleDriver;

use crate::config::{Config, DriverKind};
use crate::error::{Result, ToolError};
use indexmap::IndexMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// Number of trailing output lines scanned for failure signatures.
const ERROR_SCAN_LINES: usize = 30;

/// Start and end of one program run, for the timing report.
#[derive(Debug, Clone, PartialEq)]
pub struct TimingRecord {
    pub command: String,
    pub working_directory: PathBuf,
    pub started: SystemTime,
    pub elapsed: Duration,
}

/// State shared by every driver backend.
#[derive(Debug, Clone)]
pub struct DriverCommon {
    /// Program name as requested.
    pub executable: String,
    /// Full path after lookup.
    pub resolved: PathBuf,
    pub command_line: Vec<String>,
    pub working_directory: PathBuf,
    /// Tokens prepended to an inherited variable.
    pub environment: IndexMap<String, Vec<String>>,
    /// Variables replaced outright.
    pub environment_set: IndexMap<String, String>,
    pub input: Vec<String>,
    pub output: Vec<String>,
    pub cpu_threads: usize,
    pub xpid: Option<usize>,
    pub name: String,
    pub status: Option<ExitOutcome>,
    pub log_file: Option<PathBuf>,
    started_at: Option<(Instant, SystemTime)>,
    elapsed: Option<Duration>,
    finished: bool,
}

impl DriverCommon {
    pub fn new(executable: &str, resolved: PathBuf) -> Self {
        Self {
            executable: executable.to_string(),
            resolved,
            command_line: Vec::new(),
            working_directory: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            environment: IndexMap::new(),
            environment_set: IndexMap::new(),
            input: Vec::new(),
            output: Vec::new(),
            cpu_threads: 1,
            xpid: None,
            name: helper::random_name(),
            status: None,
            log_file: None,
            started_at: None,
            elapsed: None,
            finished: false,
        }
    }

    /// Base name of the executable, used for log file names.
    pub fn task_name(&self) -> String {
        Path::new(&self.executable)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.executable.clone())
    }

    /// Command line as a single string, with the working directory elided.
    pub fn command_string(&self) -> String {
        let prefix = format!("{}/", self.working_directory.display());
        let mut command = self.task_name();
        for token in &self.command_line {
            command.push_str(&format!(" '{}'", token.replace(&prefix, "")));
        }
        command
    }

    /// Environment for the child: `set` values win, `add` tokens are
    /// prepended to whatever `lookup` reports for the variable.
    pub fn child_environment<F>(&self, lookup: F) -> Vec<(String, String)>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut resolved: Vec<(String, String)> = self
            .environment_set
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (name, tokens) in &self.environment {
            if self.environment_set.contains_key(name) {
                continue;
            }
            let mut value = tokens.join(":");
            if let Some(existing) = lookup(name).filter(|v| !v.is_empty()) {
                value.push(':');
                value.push_str(&existing);
            }
            resolved.push((name.clone(), value));
        }
        resolved
    }

    pub fn mark_started(&mut self) {
        self.started_at = Some((Instant::now(), SystemTime::now()));
        self.finished = false;
    }

    /// Record completion: output, status, elapsed time, and the log file.
    pub fn mark_finished(&mut self, output: Vec<String>, status: ExitOutcome) -> Result<()> {
        self.output = output;
        self.status = Some(status);
        self.elapsed = self.started_at.map(|(start, _)| start.elapsed());
        self.finished = true;
        self.write_log()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn timing(&self) -> Option<TimingRecord> {
        let (_, started) = self.started_at?;
        Some(TimingRecord {
            command: self.command_string(),
            working_directory: self.working_directory.clone(),
            started,
            elapsed: self.elapsed?,
        })
    }

    fn write_log(&mut self) -> Result<()> {
        let name = match self.xpid {
            Some(xpid) => format!("{xpid}_{}.log", self.task_name()),
            None => format!("{}.log", self.task_name()),
        };
        let path = self.working_directory.join(name);
        let mut log = std::io::BufWriter::new(std::fs::File::create(&path)?);
        for line in &self.output {
            writeln!(log, "{line}")?;
        }
        writeln!(log, "# command line:")?;
        writeln!(log, "# {}", self.command_string())?;
        if let Some(elapsed) = self.elapsed {
            writeln!(log, "# time: {:.1} seconds", elapsed.as_secs_f64())?;
        }
        log.flush()?;
        self.log_file = Some(path);
        Ok(())
    }
}

/// One invocation of an external program.
pub trait Driver: Send {
    fn common(&self) -> &DriverCommon;

    fn common_mut(&mut self) -> &mut DriverCommon;

    /// Begin execution.
    fn start(&mut self) -> Result<()>;

    /// Block until the program has terminated and its output is captured.
    fn close_wait(&mut self) -> Result<()>;

    /// Queue or send one record of standard input.
    fn input(&mut self, record: &str) -> Result<()> {
        self.common_mut().input.push(record.to_string());
        Ok(())
    }

    fn executable(&self) -> &str {
        &self.common().executable
    }

    fn add_command_line(&mut self, token: &str) {
        self.common_mut().command_line.push(token.to_string());
    }

    fn set_working_directory(&mut self, dir: &Path) {
        self.common_mut().working_directory = dir.to_path_buf();
    }

    fn working_directory(&self) -> &Path {
        &self.common().working_directory
    }

    fn set_cpu_threads(&mut self, threads: usize) {
        self.common_mut().cpu_threads = threads.max(1);
    }

    fn set_xpid(&mut self, xpid: usize) {
        self.common_mut().xpid = Some(xpid);
    }

    /// Prepend `value` to the inherited variable `name`.
    fn add_environment(&mut self, name: &str, value: &str) {
        self.common_mut()
            .environment
            .entry(name.to_string())
            .or_default()
            .push(value.to_string());
    }

    /// Replace the variable `name` outright.
    fn set_environment(&mut self, name: &str, value: &str) {
        self.common_mut()
            .environment_set
            .insert(name.to_string(), value.to_string());
    }

    /// All captured output lines; only available after `close_wait`.
    fn get_all_output(&self) -> Result<&[String]> {
        if !self.common().is_finished() {
            return Err(ToolError::Protocol(format!(
                "output of {} requested before close_wait",
                self.executable()
            ))
            .into());
        }
        Ok(&self.common().output)
    }

    fn exit_outcome(&self) -> Option<ExitOutcome> {
        self.common().status
    }

    fn log_file(&self) -> Option<&Path> {
        self.common().log_file.as_deref()
    }

    /// Raise the first failure visible in the tail of the output or in the
    /// exit status.
    fn check_for_errors(&self) -> Result<()> {
        let output = self.get_all_output()?;
        let tail = &output[output.len().saturating_sub(ERROR_SCAN_LINES)..];
        helper::scan_for_errors(tail)?;
        if let Some(status) = self.exit_outcome() {
            helper::check_exit(status)?;
        }
        Ok(())
    }
}

/// Creates drivers for programs by name.
pub trait DriverFactory: Send + Sync {
    fn create(&self, executable: &str) -> Result<Box<dyn Driver>>;
}

/// Factory selected by the run configuration.
pub struct DefaultDriverFactory {
    kind: DriverKind,
    qsub_command: Vec<String>,
    poll_interval: Duration,
    engine: Arc<dyn GridEngine>,
}

impl DefaultDriverFactory {
    pub fn from_config(config: &Config) -> Self {
        let qsub_command: Vec<String> = config
            .qsub_command
            .split_whitespace()
            .map(str::to_string)
            .collect();
        Self {
            kind: config.driver,
            engine: Arc::new(SgeCommands::new(qsub_command.clone())),
            qsub_command,
            poll_interval: config.poll_interval(),
        }
    }

    pub fn kind(&self) -> DriverKind {
        self.kind
    }

    pub fn qsub_command(&self) -> &[String] {
        &self.qsub_command
    }
}

impl DriverFactory for DefaultDriverFactory {
    fn create(&self, executable: &str) -> Result<Box<dyn Driver>> {
        Ok(match self.kind {
            DriverKind::Simple => Box::new(SimpleDriver::new(executable)?),
            DriverKind::Qsub => Box::new(QsubDriver::new(
                executable,
                self.engine.clone(),
                self.poll_interval,
            )?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_environment() {
        let mut common = DriverCommon::new("aimless", PathBuf::from("/opt/ccp4/bin/aimless"));
        common
            .environment
            .insert("LD_LIBRARY_PATH".into(), vec!["/opt/ccp4/lib".into()]);
        common.environment.insert("EXTRA".into(), vec!["a".into(), "b".into()]);
        common.environment_set.insert("CCP4_SCR".into(), "/tmp".into());

        let env = common.child_environment(|name| {
            (name == "LD_LIBRARY_PATH").then(|| "/usr/lib".to_string())
        });
        assert_eq!(
            env,
            vec![
                ("CCP4_SCR".to_string(), "/tmp".to_string()),
                ("LD_LIBRARY_PATH".to_string(), "/opt/ccp4/lib:/usr/lib".to_string()),
                ("EXTRA".to_string(), "a:b".to_string()),
            ]
        );
    }

    #[test]
    fn test_command_string_elides_working_directory() {
        let mut common = DriverCommon::new("xds_par", PathBuf::from("/usr/bin/xds_par"));
        common.working_directory = PathBuf::from("/work/index");
        common.command_line = vec!["/work/index/XDS.INP".into(), "-v".into()];
        assert_eq!(common.command_string(), "xds_par 'XDS.INP' '-v'");
    }

    #[test]
    fn test_log_written_on_finish() {
        let dir = tempfile::tempdir().unwrap();
        let mut common = DriverCommon::new("pointless", PathBuf::from("/usr/bin/pointless"));
        common.working_directory = dir.path().to_path_buf();
        common.xpid = Some(7);
        common.mark_started();
        common
            .mark_finished(vec!["Best Solution: point group P 4 2 2".into()], ExitOutcome::success())
            .unwrap();

        let log = common.log_file.clone().unwrap();
        assert_eq!(log, dir.path().join("7_pointless.log"));
        let text = std::fs::read_to_string(log).unwrap();
        assert!(text.starts_with("Best Solution"));
        assert!(text.contains("# pointless"));
        assert!(common.timing().is_some());
    }
}
