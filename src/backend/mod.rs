//! Concrete stage backends wrapping XDS, DIALS and CCP4 programs.

pub mod ccp4;
pub mod dials;
pub mod dials_scale;
pub mod xds;
pub mod xscale;

use crate::data::UnitCell;
use crate::driver::{Ccp4Capability, Driver};
use crate::error::{Error, Result};
use crate::stage::PhaseContext;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Backend settings from their persisted form; `null` means defaults.
pub(crate) fn parse_settings<T>(settings: &Value) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    if settings.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(settings.clone())
        .map_err(|e| Error::Config(format!("invalid backend settings {settings}: {e}")))
}

pub(crate) fn to_settings<T: serde::Serialize>(settings: &T) -> Value {
    serde_json::to_value(settings).unwrap_or(Value::Null)
}

/// Copy `source` into `dir` as `name`, returning the new path.
pub(crate) fn copy_into(source: &Path, dir: &Path, name: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let target = dir.join(name);
    if source != target {
        std::fs::copy(source, &target)?;
    }
    Ok(target)
}

/// A file this stage published in an earlier phase.
pub(crate) fn own_file(ctx: &PhaseContext<'_>, key: &str) -> Result<PathBuf> {
    ctx.core
        .payload
        .file(key)
        .map(Path::to_path_buf)
        .ok_or_else(|| Error::PayloadMissing {
            stage: ctx.core.label.clone(),
            key: key.to_string(),
        })
}

pub(crate) fn read_lines(path: &Path) -> Result<Vec<String>> {
    Ok(std::fs::read_to_string(path)?
        .lines()
        .map(str::to_string)
        .collect())
}

/// Six cell constants from the last six whitespace separated tokens.
pub(crate) fn trailing_cell(line: &str) -> Option<UnitCell> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let start = tokens.len().checked_sub(6)?;
    let mut constants = [0.0; 6];
    for (slot, token) in constants.iter_mut().zip(&tokens[start..]) {
        *slot = token.parse().ok()?;
    }
    UnitCell::new(constants).ok()
}

pub(crate) fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::InvalidArgument(format!("bad pattern {pattern}: {e}")))
}

/// The last `Unit cell: (a, b, c, alpha, beta, gamma)` printed by DIALS.
pub(crate) fn parse_dials_cell(output: &[String]) -> Result<Option<UnitCell>> {
    let pattern = compile(r"Unit cell:\s*\(([^)]*)\)")?;
    Ok(output.iter().rev().find_map(|line| {
        let caps = pattern.captures(line)?;
        let values: Vec<f64> = caps[1]
            .split(',')
            .map(|v| v.trim().parse::<f64>())
            .collect::<std::result::Result<_, _>>()
            .ok()?;
        let constants: [f64; 6] = values.try_into().ok()?;
        UnitCell::new(constants).ok()
    }))
}

/// A driver for a CCP4 program with the captured CCP4 environment.
pub(crate) fn ccp4_driver(ctx: &PhaseContext<'_>, executable: &str) -> Result<Ccp4Capability> {
    let driver = ctx.driver(executable)?;
    let clib = ctx.run.env("CCP4").map(|root| format!("{root}/lib"));
    let scratch = ctx.run.env("CCP4_SCR").map(PathBuf::from);
    let mut ccp4 = Ccp4Capability::new(driver, clib.as_deref(), scratch.as_deref());
    if let Some(clibd) = ctx.run.env("CLIBD") {
        ccp4.driver_mut().set_environment("CLIBD", clibd);
    }
    Ok(ccp4)
}

/// Run a CCP4 program to completion and check its output.
pub(crate) fn run_ccp4(ctx: &PhaseContext<'_>, ccp4: &mut Ccp4Capability) -> Result<()> {
    ccp4.start()?;
    ccp4.close_wait()?;
    ctx.record_job(ccp4.driver());
    ccp4.check_for_errors()
}

/// Prefix `name` with the driver's job number, so reruns do not
/// overwrite the files of earlier jobs.
pub(crate) fn numbered(driver: &dyn Driver, name: &str) -> String {
    match driver.common().xpid {
        Some(xpid) => format!("{xpid}_{name}"),
        None => name.to_string(),
    }
}
