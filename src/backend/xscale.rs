//! The `xdsa` scaler: POINTLESS on the XDS reflection files for symmetry,
//! XSCALE for scaling, then AIMLESS to merge what XSCALE scaled.
//!
//! XSCALE writes one output file per dataset, so statistics are read per
//! file from `XSCALE.LP` and mapped back to datasets by file name.

use super::ccp4::{choose_symmetry, finish_reflections, run_aimless, run_pointless, AimlessMode, PointlessInput};
use super::xds::{check_xds_errors, XdsInput};
use super::{compile, parse_settings, read_lines, to_settings, trailing_cell};
use crate::data::{DatasetKey, Lattice, UnitCell};
use crate::error::{Error, Result, ToolError};
use crate::stage::registry::Backend;
use crate::stage::scaler::DatasetStatistics;
use crate::stage::{PhaseContext, PhaseOutcome, ScalerBackend, ScalerState};
use indexmap::IndexMap;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Marks the completeness table the statistics are read from.
const STATISTICS_TABLE: &str = "SUBSET OF INTENSITY DATA WITH SIGNAL/NOISE >= -3.0";

/// What XSCALE reported.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct XscaleSummary {
    /// Statistics per output file name.
    pub statistics: IndexMap<String, DatasetStatistics>,
    pub cell: Option<UnitCell>,
}

/// One row of the completeness table. `limit` is `None` for the `total`
/// row; `values` are the numbers after it, percent signs dropped.
#[derive(Debug)]
struct ShellRow {
    limit: Option<f64>,
    values: Vec<f64>,
}

fn shell_row(line: &str) -> Option<ShellRow> {
    let mut tokens = line.split_whitespace();
    let first = tokens.next()?;
    let limit = match first {
        "total" => None,
        _ => Some(first.parse().ok()?),
    };
    let values = tokens
        .map(|t| t.trim_end_matches(|c| c == '%' || c == '*').parse::<f64>().ok())
        .collect::<Option<Vec<f64>>>()?;
    (values.len() >= 10).then_some(ShellRow { limit, values })
}

/// Overall, inner and outer shell statistics from the table rows.
fn shell_statistics(first: &ShellRow, last: &ShellRow, total: &ShellRow) -> DatasetStatistics {
    let rows = [total, first, last];
    let column = |index: usize, scale: f64| -> Vec<f64> { rows.iter().map(|r| r.values[index] * scale).collect() };

    let mut statistics = DatasetStatistics::new();
    statistics.insert(
        "High resolution limit".to_string(),
        [last.limit, first.limit, last.limit].into_iter().flatten().collect(),
    );
    statistics.insert("Completeness".to_string(), column(3, 1.0));
    statistics.insert(
        "Multiplicity".to_string(),
        rows.iter()
            .map(|r| if r.values[1] > 0.0 { r.values[0] / r.values[1] } else { 0.0 })
            .collect(),
    );
    statistics.insert("I/sigma".to_string(), column(7, 1.0));
    statistics.insert("Rmerge(I+/-)".to_string(), column(4, 0.01));
    statistics.insert("CC half".to_string(), column(9, 0.01));
    statistics.insert("Total observations".to_string(), column(0, 1.0));
    statistics.insert("Total unique".to_string(), column(1, 1.0));
    statistics
}

pub fn parse_xscale_lp(lines: &[String]) -> Result<XscaleSummary> {
    let header = compile(r"STATISTICS OF SCALED OUTPUT DATA SET\s*:\s*(\S+)")?;
    let mut summary = XscaleSummary::default();
    let mut current: Option<String> = None;
    let mut in_table = false;
    let mut shells: Vec<ShellRow> = Vec::new();

    for line in lines {
        if let Some(caps) = header.captures(line) {
            let name = Path::new(&caps[1])
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            current = Some(name);
            in_table = false;
            continue;
        }
        if line.contains("UNIT CELL PARAMETERS") || line.contains("UNIT_CELL_CONSTANTS=") {
            summary.cell = trailing_cell(line).or(summary.cell);
            continue;
        }
        if line.contains(STATISTICS_TABLE) {
            in_table = current.is_some();
            shells.clear();
            continue;
        }
        if !in_table {
            continue;
        }
        let Some(row) = shell_row(line) else {
            continue;
        };
        if row.limit.is_some() {
            shells.push(row);
            continue;
        }
        in_table = false;
        let name = current.take();
        if let (Some(name), Some(first), Some(last)) = (name, shells.first(), shells.last()) {
            summary.statistics.insert(name, shell_statistics(first, last, &row));
        }
    }
    Ok(summary)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct XdsScaler {
    pub executable: String,
    /// Resolution bins for the AIMLESS merging statistics.
    pub bins: u32,
    /// Fraction of reflections flagged free when no FreeR file is given.
    pub free_fraction: f64,
}

impl Default for XdsScaler {
    fn default() -> Self {
        Self {
            executable: "xscale_par".to_string(),
            bins: 20,
            free_fraction: 0.05,
        }
    }
}

impl XdsScaler {
    /// Run XSCALE, returning its summary and the scaled file of each
    /// dataset.
    fn run_xscale(
        &self,
        state: &ScalerState,
        ctx: &PhaseContext<'_>,
        lattice: Lattice,
    ) -> Result<(XscaleSummary, Vec<(DatasetKey, PathBuf)>)> {
        let sweeps = state.sweeps(ctx)?;
        let mut input = XdsInput::default();
        input.push(format!("MAXIMUM_NUMBER_OF_PROCESSORS={}", ctx.run.config.nproc));
        if let Some(cell) = sweeps.iter().find_map(|(_, sweep)| sweep.cell) {
            input.symmetry(lattice.spacegroup_number(), &cell);
        }

        let dir = ctx.ensure_working_dir()?.to_path_buf();
        let mut outputs = Vec::new();
        for dataset in state.datasets(ctx)? {
            let name = format!("{}.HKL", dataset.dname);
            input.push(format!("OUTPUT_FILE={name}"));
            input.friedel(state.anomalous);
            for (upstream, sweep) in &sweeps {
                if sweep.project_info.as_ref() != Some(&dataset) {
                    continue;
                }
                input.push(format!("INPUT_FILE={}", upstream.require_file("intensities")?.display()));
                if let Some(dmin) = state.resolution_limits.get(&dataset) {
                    input.push(format!("INCLUDE_RESOLUTION_RANGE=100.0 {dmin:.2}"));
                }
            }
            outputs.push((dataset, dir.join(name)));
        }
        input.write_as(&dir, "XSCALE.INP")?;

        let mut driver = ctx.driver(&self.executable)?;
        driver.start()?;
        driver.close_wait()?;
        ctx.record_job(driver.as_ref());
        check_xds_errors(driver.get_all_output()?)?;
        driver.check_for_errors()?;

        for (_, path) in &outputs {
            if !path.exists() {
                return Err(ToolError::MissingOutput {
                    program: "xscale".to_string(),
                    path: path.clone(),
                }
                .into());
            }
        }
        let summary = parse_xscale_lp(&read_lines(&dir.join("XSCALE.LP"))?)?;
        Ok((summary, outputs))
    }
}

impl ScalerBackend for XdsScaler {
    fn name(&self) -> &'static str {
        "xdsa"
    }

    fn settings(&self) -> Value {
        to_settings(self)
    }

    fn prepare(&self, state: &mut ScalerState, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome> {
        let files = state
            .sweeps(ctx)?
            .into_iter()
            .map(|(upstream, _)| upstream.require_file("intensities").map(Path::to_path_buf))
            .collect::<Result<Vec<_>>>()?;
        let (symmetry, sorted) = run_pointless(state, ctx, PointlessInput::Xds(files), "sorted.mtz")?;
        let outcome = choose_symmetry(state, ctx, symmetry)?;
        ctx.publish_file("pointless", "sorted", sorted)?;
        Ok(outcome)
    }

    fn scale(&self, state: &mut ScalerState, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome> {
        let spacegroup = state
            .spacegroup
            .as_deref()
            .ok_or_else(|| Error::BadSpacegroup("no spacegroup chosen before scaling".into()))?;
        let lattice = Lattice::from_spacegroup_symbol(spacegroup)?;
        let (summary, outputs) = self.run_xscale(state, ctx, lattice)?;

        let mut statistics = BTreeMap::new();
        let mut scaled = Vec::with_capacity(outputs.len());
        for (dataset, path) in outputs {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            match summary.statistics.get(&name) {
                Some(found) => {
                    statistics.insert(dataset, found.clone());
                }
                None => debug!("{}: no XSCALE statistics for {name}", ctx.core.label),
            }
            scaled.push(path);
        }

        let (_, combined) = run_pointless(state, ctx, PointlessInput::Xds(scaled), "combined.mtz")?;
        let (merged, cell) = run_aimless(state, ctx, &combined, self.bins, AimlessMode::MergeOnly)?;
        if statistics.is_empty() {
            warn!("{}: XSCALE reported no statistics, using the merging statistics", ctx.core.label);
            statistics = merged;
        }
        state.statistics = statistics;
        state.cell = summary.cell.or(cell);
        Ok(PhaseOutcome::done())
    }

    fn finish(&self, state: &mut ScalerState, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome> {
        finish_reflections(state, ctx, self.free_fraction)
    }
}

pub fn scaler_from_settings(settings: &Value) -> Result<Backend> {
    let scaler: XdsScaler = parse_settings(settings)?;
    Ok(Backend::Scaler(Arc::new(scaler)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::stage::{Engine, ScalerHandle};
    use crate::testing::{self, ScriptedDrivers};
    use pretty_assertions::assert_eq;

    fn lines(text: &str) -> Vec<String> {
        text.lines().map(str::to_string).collect()
    }

    const XSCALE_LP: &str = "\
 UNIT CELL PARAMETERS     78.010    78.010    37.120  90.000  90.000  90.000

 STATISTICS OF SCALED OUTPUT DATA SET : NATIVE.HKL

 SUBSET OF INTENSITY DATA WITH SIGNAL/NOISE >= -3.0 AS FUNCTION OF RESOLUTION
 RESOLUTION     NUMBER OF REFLECTIONS    COMPLETENESS R-FACTOR  R-FACTOR COMPARED I/SIGMA   R-meas  CC(1/2)  Anomal  SigAno   Nano
   LIMIT     OBSERVED  UNIQUE  POSSIBLE     OF DATA   observed  expected                                      Corr

     4.83       10000    1250      1262       99.1%       2.9%      3.1%    10000   51.20     3.1%    99.9*    12    1.123    1100
     1.78        9000    1200      1201       99.9%      52.7%     55.0%     9000    3.10    56.0%    84.3*    -2    0.789    1000
    total      192000   24000     24050       99.8%       5.8%      6.1%   192000   20.10     6.2%    99.9*     5    0.901   21000

 SUBSET OF INTENSITY DATA WITH SIGNAL/NOISE >=  0.0 AS FUNCTION OF RESOLUTION
     4.83        9000    1200      1262       95.1%       2.9%      3.1%     9000   51.20     3.1%    99.9*    12    1.123    1100
    total      100000   20000     24050       80.0%       5.8%      6.1%   100000   20.10     6.2%    99.9*     5    0.901   21000
";

    #[test]
    fn test_parse_xscale_lp() {
        let summary = parse_xscale_lp(&lines(XSCALE_LP)).unwrap();
        assert_eq!(summary.cell.unwrap().constants()[2], 37.12);

        let native = &summary.statistics["NATIVE.HKL"];
        assert_eq!(native["High resolution limit"], vec![1.78, 4.83, 1.78]);
        assert_eq!(native["Completeness"], vec![99.8, 99.1, 99.9]);
        assert_eq!(native["Multiplicity"], vec![8.0, 8.0, 7.5]);
        assert_eq!(native["Total observations"][0], 192000.0);
        assert!((native["Rmerge(I+/-)"][0] - 0.058).abs() < 1e-9);
        assert!((native["CC half"][2] - 0.843).abs() < 1e-9);
    }

    #[test]
    fn test_table_rows_need_a_data_set() {
        let text = XSCALE_LP.replace(" STATISTICS OF SCALED OUTPUT DATA SET : NATIVE.HKL", "");
        let summary = parse_xscale_lp(&lines(&text)).unwrap();
        assert!(summary.statistics.is_empty());
        assert!(summary.cell.is_some());
    }

    #[test]
    fn test_xscale_scaler_publishes_every_format() {
        let dir = tempfile::tempdir().unwrap();
        let drivers = std::sync::Arc::new(ScriptedDrivers::standard());
        let mut run = testing::run_context_with(dir.path(), drivers.clone());
        run.config = Config {
            nproc: 1,
            ..Config::default()
        };
        assert_eq!(run.config.scaler_backend(), "xdsa");
        let (mut graph, chain) = testing::xds_chain(dir.path());
        let scaler = testing::attach_scaler(&mut graph, &run, dir.path(), &[chain.integrater]);

        let mut scaler = ScalerHandle::new(Engine::new(&mut graph, &run), scaler).unwrap();
        for format in crate::stage::scaler::SCALED_FORMATS {
            assert!(scaler.scaled_reflections(format).unwrap().exists(), "{format}");
        }
        assert_eq!(scaler.spacegroup().unwrap(), "P 41 21 2");
        assert_eq!(scaler.highest_resolution().unwrap(), 1.78);
        let statistics = scaler.statistics().unwrap();
        let dataset = DatasetKey::new("AUTOMATIC", "DEFAULT", "NATIVE");
        assert_eq!(statistics[&dataset]["Completeness"], vec![99.8, 99.1, 99.9]);

        assert_eq!(drivers.count("xscale_par"), 1);
        assert_eq!(drivers.count("pointless"), 2);
        assert_eq!(drivers.count("aimless"), 1);
        let input = std::fs::read_to_string(dir.path().join("scale").join("XSCALE.INP")).unwrap();
        assert!(input.contains("OUTPUT_FILE=NATIVE.HKL"));
        assert!(input.contains("SPACE_GROUP_NUMBER=75"));
        assert!(input.contains("XDS_ASCII.HKL"));
    }

    #[test]
    fn test_resolution_limit_reaches_xscale() {
        let dir = tempfile::tempdir().unwrap();
        let drivers = std::sync::Arc::new(ScriptedDrivers::standard());
        let mut run = testing::run_context_with(dir.path(), drivers.clone());
        run.config.backends.scaler = Some("xdsa".into());
        let (mut graph, chain) = testing::xds_chain(dir.path());
        let scaler = testing::attach_scaler(&mut graph, &run, dir.path(), &[chain.integrater]);

        let mut scaler = ScalerHandle::new(Engine::new(&mut graph, &run), scaler).unwrap();
        scaler.run().unwrap();
        scaler
            .set_resolution_limit(DatasetKey::new("AUTOMATIC", "DEFAULT", "NATIVE"), 2.0)
            .unwrap();
        scaler.run().unwrap();

        let input = std::fs::read_to_string(dir.path().join("scale").join("XSCALE.INP")).unwrap();
        assert!(input.contains("INCLUDE_RESOLUTION_RANGE=100.0 2.00"));
        assert_eq!(drivers.count("xscale_par"), 2);
        assert_eq!(drivers.count_in("xds_par", "integrate"), 1);
    }
}
