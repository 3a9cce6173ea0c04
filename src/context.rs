//! Per-run context threaded through every component.
//!
//! One `RunContext` is built at the start of a run and handed down by
//! reference. It owns what would otherwise be process-wide state: the
//! configuration, the driver factory, the fallback policy, the backend
//! registry, the job counter and the timing log.

use crate::config::Config;
use crate::driver::{DefaultDriverFactory, Driver, DriverFactory, TimingRecord};
use crate::error::Result;
use crate::runtime::policy::{AlternateEngine, FallbackPolicy, NeverFallback, OncePerBackend, SaturationPolicy};
use crate::stage::BackendRegistry;
use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Environment variables captured once at startup and passed to jobs
/// explicitly.
const CAPTURED_ENVIRONMENT: [&str; 4] = ["CCP4", "CLIBD", "CCP4_SCR", "XIA2_ROOT"];

/// Number of entries shown by [`RunContext::timing_report`].
const TIMING_REPORT_LENGTH: usize = 10;

pub struct RunContext {
    pub config: Config,
    pub base_dir: PathBuf,
    drivers: Arc<dyn DriverFactory>,
    fallback: Arc<dyn FallbackPolicy>,
    registry: Arc<BackendRegistry>,
    environment: IndexMap<String, String>,
    xpid: AtomicUsize,
    timings: Mutex<Vec<TimingRecord>>,
}

impl RunContext {
    /// Context with the default driver factory and registry, without
    /// reading the process environment.
    pub fn new(config: Config) -> Self {
        let drivers: Arc<dyn DriverFactory> = Arc::new(DefaultDriverFactory::from_config(&config));
        let fallback: Arc<dyn FallbackPolicy> = match (config.indexer_fallback, config.max_fallbacks) {
            (false, _) => Arc::new(NeverFallback),
            (true, None) => Arc::new(OncePerBackend::new(Box::new(AlternateEngine))),
            (true, Some(limit)) => Arc::new(SaturationPolicy::new(
                Box::new(OncePerBackend::new(Box::new(AlternateEngine))),
                limit,
            )),
        };
        Self {
            base_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            config,
            drivers,
            fallback,
            registry: Arc::new(BackendRegistry::new_with_defaults()),
            environment: IndexMap::new(),
            xpid: AtomicUsize::new(0),
            timings: Mutex::new(Vec::new()),
        }
    }

    /// Validate `config` against the process environment and build the
    /// context for a run rooted at `base_dir`.
    pub fn from_env(config: Config, base_dir: &Path) -> Result<Self> {
        config.validate()?;
        config.check_environment(base_dir, |name| std::env::var(name).ok())?;
        std::fs::create_dir_all(base_dir)?;

        let mut context = Self::new(config);
        context.base_dir = base_dir.to_path_buf();
        for name in CAPTURED_ENVIRONMENT {
            if let Ok(value) = std::env::var(name) {
                context.environment.insert(name.to_string(), value);
            }
        }
        Ok(context)
    }

    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    pub fn with_drivers(mut self, drivers: Arc<dyn DriverFactory>) -> Self {
        self.drivers = drivers;
        self
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn FallbackPolicy>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_registry(mut self, registry: Arc<BackendRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_environment(mut self, name: &str, value: &str) -> Self {
        self.environment.insert(name.to_string(), value.to_string());
        self
    }

    pub fn fallback(&self) -> &dyn FallbackPolicy {
        self.fallback.as_ref()
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Captured value of an external tool variable.
    pub fn env(&self, name: &str) -> Option<&str> {
        self.environment.get(name).map(String::as_str)
    }

    /// A driver for `executable`, numbered and set to use `nproc` threads.
    pub fn create_driver(&self, executable: &str) -> Result<Box<dyn Driver>> {
        let mut driver = self.drivers.create(executable)?;
        let xpid = self.xpid.fetch_add(1, Ordering::SeqCst) + 1;
        driver.set_xpid(xpid);
        driver.set_cpu_threads(self.config.nproc);
        Ok(driver)
    }

    /// Number of jobs created so far.
    pub fn jobs_started(&self) -> usize {
        self.xpid.load(Ordering::SeqCst)
    }

    pub fn record_timing(&self, record: TimingRecord) {
        self.timings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
    }

    pub fn timings(&self) -> Vec<TimingRecord> {
        self.timings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The longest running jobs, slowest first.
    pub fn timing_report(&self) -> Vec<String> {
        let mut timings = self.timings();
        timings.sort_by(|a, b| b.elapsed.cmp(&a.elapsed));
        let mut lines = vec!["Longest times:".to_string()];
        for record in timings.iter().take(TIMING_REPORT_LENGTH) {
            lines.push(format!(
                "{:.1}s: {} ({})",
                record.elapsed.as_secs_f64(),
                record.command,
                record.working_directory.display()
            ));
        }
        lines
    }
}
