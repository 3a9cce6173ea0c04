//! Run configuration.
//!
//! `Config` is plain data with defaults for every field, so a project can be
//! driven without any configuration file at all. A TOML document may override
//! any subset of the fields.

use crate::error::{Error, Result};
use crate::stage::StageKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Which family of backends processes each sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineKind {
    /// XDS indexing, refinement and integration from spot wedges.
    #[serde(rename = "3d")]
    ThreeD,
    /// As `3d`, but indexing from the whole image range.
    #[serde(rename = "3dii")]
    ThreeDii,
    /// DIALS indexing, refinement and integration.
    #[serde(rename = "dials")]
    Dials,
}

impl PipelineKind {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineKind::ThreeD => "3d",
            PipelineKind::ThreeDii => "3dii",
            PipelineKind::Dials => "dials",
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PipelineKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "3d" => Ok(PipelineKind::ThreeD),
            "3dii" => Ok(PipelineKind::ThreeDii),
            "dials" => Ok(PipelineKind::Dials),
            other => Err(Error::Config(format!("unknown pipeline {other}"))),
        }
    }
}

/// Where external programs run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Child processes of this one.
    Simple,
    /// Grid Engine jobs submitted through `qsub`.
    Qsub,
}

/// Explicit backend choice per stage kind, overriding the pipeline default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendOverrides {
    pub indexer: Option<String>,
    pub refiner: Option<String>,
    pub integrater: Option<String>,
    pub scaler: Option<String>,
}

/// Configuration for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Threads handed to each external program, and the width of the
    /// per-sweep fan-out.
    pub nproc: usize,
    pub pipeline: PipelineKind,
    pub backends: BackendOverrides,
    pub driver: DriverKind,
    /// Submission command for the qsub driver; extra words become arguments.
    pub qsub_command: String,
    /// Seconds between `qstat` polls.
    pub qsub_poll_interval: f64,
    /// Substitute the alternative indexing engine when indexing fails.
    pub indexer_fallback: bool,
    /// Cap on indexer substitutions over the whole run; unlimited when
    /// unset.
    pub max_fallbacks: Option<usize>,
    /// Upper bound on phase executions while pulling one stage to FINISHED.
    pub max_stage_cycles: usize,
    /// Largest tolerated fractional cell volume change across integration.
    pub max_cell_volume_change: f64,
    /// Absolute tolerance (Angstrom / degrees) for lattice constraint checks.
    pub cell_tolerance: f64,
    pub fast_mode: bool,
    pub scan_varying: bool,
    pub xds_executable: String,
    pub anomalous: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nproc: num_cpus::get(),
            pipeline: PipelineKind::ThreeD,
            backends: BackendOverrides::default(),
            driver: DriverKind::Simple,
            qsub_command: "qsub".to_string(),
            qsub_poll_interval: 10.0,
            indexer_fallback: true,
            max_fallbacks: None,
            max_stage_cycles: 32,
            max_cell_volume_change: 0.1,
            cell_tolerance: 0.5,
            fast_mode: false,
            scan_varying: true,
            xds_executable: "xds_par".to_string(),
            anomalous: false,
        }
    }
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Reject values no run could use.
    pub fn validate(&self) -> Result<()> {
        if self.nproc == 0 {
            return Err(Error::Config("nproc must be at least 1".into()));
        }
        if self.max_stage_cycles == 0 {
            return Err(Error::Config("max_stage_cycles must be at least 1".into()));
        }
        if !(self.qsub_poll_interval >= 0.0 && self.qsub_poll_interval.is_finite()) {
            return Err(Error::Config(format!(
                "qsub_poll_interval {} is not a valid duration",
                self.qsub_poll_interval
            )));
        }
        if !(self.max_cell_volume_change > 0.0) {
            return Err(Error::Config(
                "max_cell_volume_change must be positive".into(),
            ));
        }
        if self.qsub_command.split_whitespace().next().is_none() {
            return Err(Error::Config("qsub_command is empty".into()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.qsub_poll_interval)
    }

    /// Backend name for new stages of `kind`: the override if set, else
    /// the pipeline default.
    pub fn backend(&self, kind: StageKind) -> &str {
        let chosen = match kind {
            StageKind::Indexer => &self.backends.indexer,
            StageKind::Refiner => &self.backends.refiner,
            StageKind::Integrater => &self.backends.integrater,
            StageKind::Scaler => &self.backends.scaler,
        };
        chosen.as_deref().unwrap_or(match (kind, self.pipeline) {
            (StageKind::Scaler, PipelineKind::Dials) => "dials",
            (StageKind::Scaler, _) => "xdsa",
            (_, PipelineKind::Dials) => "dials",
            _ => "xds",
        })
    }

    /// Settings for a new backend of `kind`; `null` means the backend's
    /// defaults.
    pub fn backend_settings(&self, kind: StageKind) -> serde_json::Value {
        match (kind, self.pipeline, self.backend(kind)) {
            (StageKind::Indexer, PipelineKind::ThreeDii, "xds") => serde_json::json!({ "all_images": true }),
            _ => serde_json::Value::Null,
        }
    }

    pub fn scaler_backend(&self) -> &str {
        self.backend(StageKind::Scaler)
    }

    /// Startup checks on the environment the run will execute in.
    ///
    /// `lookup` abstracts `std::env::var` so the checks can be exercised
    /// without touching the process environment.
    pub fn check_environment<F>(&self, working_dir: &Path, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let shown = working_dir.display().to_string();
        if shown.contains(' ') {
            return Err(Error::Config(format!(
                "space in working directory path {shown}"
            )));
        }
        if working_dir.exists() && !working_dir.is_dir() {
            return Err(Error::Config(format!("{shown} is not a directory")));
        }
        // Every scaler finishes with the CCP4 programs.
        if lookup("CCP4").is_none() {
            return Err(Error::MissingEnvironment("CCP4".into()));
        }
        for name in ["CCP4", "CLIBD", "CCP4_SCR"] {
            if let Some(value) = lookup(name) {
                if value.contains(' ') {
                    return Err(Error::Config(format!("space in {name} path {value}")));
                }
            }
        }
        Ok(())
    }
}

/// Install a terse `[LEVEL] message` logger on stderr.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_logging(verbose: bool) {
    let mut builder = env_logger::Builder::from_default_env();
    builder.filter_level(if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    });
    builder.format(|buf, record| {
        use std::io::Write;
        writeln!(buf, "[{}] {}", record.level(), record.args())
    });
    let _ = builder.try_init();
}
