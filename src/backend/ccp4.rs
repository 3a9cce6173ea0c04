//! The `ccp4a` scaler: POINTLESS for symmetry, AIMLESS for scaling and
//! merging, CTRUNCATE and FREERFLAG (or CAD with a supplied FreeR set)
//! for the final reflection file.
//!
//! The symmetry, merging and final steps are shared with the `xdsa` and
//! `dials` scalers.

use super::{ccp4_driver, compile, numbered, own_file, parse_settings, run_ccp4, to_settings, trailing_cell};
use crate::data::{DatasetKey, Lattice, UnitCell};
use crate::error::{Error, Result};
use crate::stage::registry::Backend;
use crate::stage::scaler::DatasetStatistics;
use crate::stage::{PhaseContext, PhaseOutcome, ScalerBackend, ScalerState, UpstreamRequest};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// AIMLESS summary labels and the statistic each one reports.
const AIMLESS_LABELS: [(&str, &str); 11] = [
    ("Low resolution limit", "Low resolution limit"),
    ("High resolution limit", "High resolution limit"),
    ("Rmerge (all I+ and I-)", "Rmerge(I+/-)"),
    ("Total number of observations", "Total observations"),
    ("Total number unique", "Total unique"),
    ("Mean((I)/sd(I))", "I/sigma"),
    ("Mn(I) half-set correlation CC(1/2)", "CC half"),
    ("Completeness", "Completeness"),
    ("Multiplicity", "Multiplicity"),
    ("Anomalous completeness", "Anomalous completeness"),
    ("Anomalous multiplicity", "Anomalous multiplicity"),
];

/// What POINTLESS decided.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SymmetryResult {
    pub best: Option<String>,
    /// Candidate spacegroups, most likely first.
    pub likely: Vec<String>,
}

pub fn parse_pointless(output: &[String]) -> Result<SymmetryResult> {
    let best = compile(r"Best Solution:\s+(?:space|point) group\s+(.+)")?;
    let candidate = compile(r"^\s*<(.+?)>\s+\((\d+)\)\s+([\d.]+)")?;
    let mut result = SymmetryResult::default();
    for line in output {
        if let Some(caps) = best.captures(line) {
            result.best = Some(caps[1].trim().to_string());
        } else if let Some(caps) = candidate.captures(line) {
            let spacegroup = caps[1].trim().to_string();
            if !result.likely.contains(&spacegroup) {
                result.likely.push(spacegroup);
            }
        }
    }
    Ok(result)
}

/// Trailing numbers of a summary record and the label before them.
pub(super) fn split_record(line: &str) -> (String, Vec<f64>) {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let numeric = tokens
        .iter()
        .rev()
        .take_while(|t| t.parse::<f64>().is_ok())
        .count();
    let split = tokens.len() - numeric;
    let values = tokens[split..].iter().filter_map(|t| t.parse().ok()).collect();
    (tokens[..split].join(" "), values)
}

/// Per-dataset summary statistics and the average cell from AIMLESS.
pub fn parse_aimless(output: &[String]) -> Result<(BTreeMap<DatasetKey, DatasetStatistics>, Option<UnitCell>)> {
    let header = compile(r"Summary data for\s+Project:\s*(\S+)\s+Crystal:\s*(\S+)\s+Dataset:\s*(\S+)")?;
    let mut statistics: BTreeMap<DatasetKey, DatasetStatistics> = BTreeMap::new();
    let mut current: Option<DatasetKey> = None;
    let mut cell = None;
    for line in output {
        if let Some(caps) = header.captures(line) {
            let key = DatasetKey::new(&caps[1], &caps[2], &caps[3]);
            statistics.entry(key.clone()).or_default();
            current = Some(key);
            continue;
        }
        if line.contains("Average unit cell:") {
            cell = trailing_cell(line).or(cell);
            continue;
        }
        let Some(key) = &current else {
            continue;
        };
        let (label, values) = split_record(line);
        if values.is_empty() {
            continue;
        }
        let Some((_, name)) = AIMLESS_LABELS.iter().find(|(l, _)| *l == label) else {
            continue;
        };
        if let Some(dataset) = statistics.get_mut(key) {
            dataset.entry(name.to_string()).or_insert(values);
        }
    }
    Ok((statistics, cell))
}

fn project_records(state: &ScalerState, ctx: &PhaseContext<'_>) -> Result<Vec<String>> {
    let mut records = Vec::new();
    for (upstream, sweep) in state.sweeps(ctx)? {
        let key = sweep.project_info.as_ref().ok_or_else(|| Error::PayloadMissing {
            stage: upstream.label.clone(),
            key: "project_info".to_string(),
        })?;
        records.push(format!(
            "name project {} crystal {} dataset {}",
            key.pname, key.xname, key.dname
        ));
    }
    Ok(records)
}

/// Sibling of `mtz` with `suffix` replacing its `.mtz` extension.
fn derived(mtz: &Path, suffix: &str) -> PathBuf {
    let stem = mtz
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    mtz.with_file_name(format!("{stem}{suffix}"))
}

/// Reflection files handed to POINTLESS.
pub(crate) enum PointlessInput {
    Mtz(Vec<PathBuf>),
    /// `XDS_ASCII.HKL` or XSCALE output, read through `xdsin`.
    Xds(Vec<PathBuf>),
}

/// Run POINTLESS over `input`, writing `name` (an MTZ file) in the
/// stage's working directory. Returns the symmetry analysis and the file.
pub(crate) fn run_pointless(
    state: &ScalerState,
    ctx: &PhaseContext<'_>,
    input: PointlessInput,
    name: &str,
) -> Result<(SymmetryResult, PathBuf)> {
    let records = project_records(state, ctx)?;
    let mut pointless = ccp4_driver(ctx, "pointless")?;
    let hklout = ctx.working_dir().join(numbered(pointless.driver(), name));
    match input {
        PointlessInput::Mtz(files) => pointless.set_hklin_files(files),
        PointlessInput::Xds(files) => {
            for file in files {
                let driver = pointless.driver_mut();
                driver.add_command_line("xdsin");
                driver.add_command_line(&file.display().to_string());
            }
        }
    }
    pointless.set_hklout(&hklout);
    if let Some(reference) = &state.reference_reflection_file {
        let driver = pointless.driver_mut();
        driver.add_command_line("hklref");
        driver.add_command_line(&reference.display().to_string());
    }
    for record in &records {
        pointless.input(record)?;
    }
    if let Some(spacegroup) = &state.input_spacegroup {
        pointless.input(&format!("choose spacegroup {spacegroup}"))?;
    }
    run_ccp4(ctx, &mut pointless)?;
    Ok((parse_pointless(pointless.get_all_output()?)?, hklout))
}

/// Settle the spacegroup from a symmetry analysis, a user choice taking
/// precedence, and ask the indexers to check the matching lattice.
pub(crate) fn choose_symmetry(
    state: &mut ScalerState,
    ctx: &PhaseContext<'_>,
    symmetry: SymmetryResult,
) -> Result<PhaseOutcome> {
    let best = state
        .input_spacegroup
        .clone()
        .or(symmetry.best)
        .ok_or_else(|| Error::BadSpacegroup("no spacegroup solution".into()))?;
    let mut likely = symmetry.likely;
    if let Some(position) = likely.iter().position(|s| *s == best) {
        likely.remove(position);
    }
    likely.insert(0, best.clone());
    info!("{}: spacegroup {best}", ctx.core.label);

    let lattice = Lattice::from_spacegroup_symbol(&best)?;
    state.spacegroup = Some(best);
    state.likely_spacegroups = likely;
    Ok(PhaseOutcome::with_requests(vec![UpstreamRequest::AssertLattice(lattice)]))
}

/// How AIMLESS treats its input.
pub(crate) enum AimlessMode {
    /// Scale and merge, one run per sweep with its batch range.
    Scale,
    /// Merge intensities that were scaled already.
    MergeOnly,
}

/// Run AIMLESS on `hklin` and publish the merged and unmerged MTZ and
/// scalepack files it writes. Returns the per-dataset statistics and the
/// average cell it reports.
pub(crate) fn run_aimless(
    state: &ScalerState,
    ctx: &mut PhaseContext<'_>,
    hklin: &Path,
    bins: u32,
    mode: AimlessMode,
) -> Result<(BTreeMap<DatasetKey, DatasetStatistics>, Option<UnitCell>)> {
    let mut aimless = ccp4_driver(ctx, "aimless")?;
    let scaled = ctx.working_dir().join(numbered(aimless.driver(), "scaled.mtz"));
    aimless.set_hklin(hklin);
    aimless.set_hklout(&scaled);
    aimless.input(&format!("bins {bins}"))?;
    match mode {
        AimlessMode::MergeOnly => aimless.input("onlymerge")?,
        AimlessMode::Scale => {
            for (run, (upstream, sweep)) in state.sweeps(ctx)?.into_iter().enumerate() {
                let (start, end) = sweep.batches.ok_or_else(|| Error::PayloadMissing {
                    stage: upstream.label.clone(),
                    key: "batches".to_string(),
                })?;
                let run = run + 1;
                aimless.input(&format!("run {run} batch {start} to {end}"))?;
                let limit = sweep
                    .project_info
                    .as_ref()
                    .and_then(|key| state.resolution_limits.get(key));
                if let Some(dmin) = limit {
                    aimless.input(&format!("resolution run {run} high {dmin}"))?;
                }
            }
        }
    }
    aimless.input(if state.anomalous { "anomalous on" } else { "anomalous off" })?;
    aimless.input("output mtz scalepack unmerged")?;
    run_ccp4(ctx, &mut aimless)?;

    let (statistics, cell) = parse_aimless(aimless.get_all_output()?)?;
    ctx.publish_file("aimless", "mtz_unmerged", derived(&scaled, "_unmerged.mtz"))?;
    ctx.publish_file("aimless", "sca", derived(&scaled, ".sca"))?;
    ctx.publish_file("aimless", "sca_unmerged", derived(&scaled, "_unmerged.sca"))?;
    ctx.publish_file("aimless", "scaled", scaled)?;
    Ok((statistics, cell))
}

/// Convert the merged reflections published as `scaled` to amplitudes
/// with CTRUNCATE and attach a FreeR set, publishing the result as `mtz`.
///
/// A FreeR column from the user's file is copied in with CAD; otherwise
/// FREERFLAG flags `free_fraction` of the reflections.
pub(crate) fn finish_reflections(
    state: &ScalerState,
    ctx: &mut PhaseContext<'_>,
    free_fraction: f64,
) -> Result<PhaseOutcome> {
    let scaled = own_file(ctx, "scaled")?;
    let dir = ctx.working_dir().to_path_buf();

    let mut ctruncate = ccp4_driver(ctx, "ctruncate")?;
    let truncated = dir.join(numbered(ctruncate.driver(), "truncated.mtz"));
    {
        let driver = ctruncate.driver_mut();
        driver.add_command_line("-hklin");
        driver.add_command_line(&scaled.display().to_string());
        driver.add_command_line("-hklout");
        driver.add_command_line(&truncated.display().to_string());
        driver.add_command_line("-colin");
        driver.add_command_line("/*/*/[IMEAN,SIGIMEAN]");
        if state.anomalous {
            driver.add_command_line("-colano");
            driver.add_command_line("/*/*/[I(+),SIGI(+),I(-),SIGI(-)]");
        }
    }
    run_ccp4(ctx, &mut ctruncate)?;

    let free = match &state.freer_file {
        Some(freer) => {
            let mut cad = ccp4_driver(ctx, "cad")?;
            let free = dir.join(numbered(cad.driver(), "free.mtz"));
            {
                let driver = cad.driver_mut();
                driver.add_command_line("hklin1");
                driver.add_command_line(&truncated.display().to_string());
                driver.add_command_line("hklin2");
                driver.add_command_line(&freer.display().to_string());
            }
            cad.set_hklout(&free);
            cad.input("labin file 1 all")?;
            cad.input("labin file 2 E1=FreeR_flag")?;
            run_ccp4(ctx, &mut cad)?;
            free
        }
        None => {
            let mut freerflag = ccp4_driver(ctx, "freerflag")?;
            let free = dir.join(numbered(freerflag.driver(), "free.mtz"));
            freerflag.set_hklin(&truncated);
            freerflag.set_hklout(&free);
            freerflag.input(&format!("freerfrac {free_fraction}"))?;
            run_ccp4(ctx, &mut freerflag)?;
            free
        }
    };
    ctx.publish_file("freerflag", "mtz", free)?;
    Ok(PhaseOutcome::done())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ccp4Scaler {
    /// Resolution bins for the AIMLESS statistics.
    pub bins: u32,
    /// Fraction of reflections flagged free when no FreeR file is given.
    pub free_fraction: f64,
}

impl Default for Ccp4Scaler {
    fn default() -> Self {
        Self {
            bins: 20,
            free_fraction: 0.05,
        }
    }
}

impl ScalerBackend for Ccp4Scaler {
    fn name(&self) -> &'static str {
        "ccp4a"
    }

    fn settings(&self) -> Value {
        to_settings(self)
    }

    fn prepare(&self, state: &mut ScalerState, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome> {
        let hklin = state
            .sweeps(ctx)?
            .into_iter()
            .map(|(upstream, _)| upstream.require_file("intensities").map(Path::to_path_buf))
            .collect::<Result<Vec<_>>>()?;
        let (symmetry, sorted) = run_pointless(state, ctx, PointlessInput::Mtz(hklin), "sorted.mtz")?;
        let outcome = choose_symmetry(state, ctx, symmetry)?;
        ctx.publish_file("pointless", "sorted", sorted)?;
        Ok(outcome)
    }

    fn scale(&self, state: &mut ScalerState, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome> {
        let sorted = own_file(ctx, "sorted")?;
        let (statistics, cell) = run_aimless(state, ctx, &sorted, self.bins, AimlessMode::Scale)?;
        if statistics.is_empty() {
            warn!("{}: aimless reported no dataset statistics", ctx.core.label);
        }
        state.statistics = statistics;
        state.cell = cell;
        Ok(PhaseOutcome::done())
    }

    fn finish(&self, state: &mut ScalerState, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome> {
        finish_reflections(state, ctx, self.free_fraction)
    }
}

pub fn scaler_from_settings(settings: &Value) -> Result<Backend> {
    let scaler: Ccp4Scaler = parse_settings(settings)?;
    Ok(Backend::Scaler(Arc::new(scaler)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{Engine, ScalerHandle};
    use crate::testing;
    use pretty_assertions::assert_eq;

    fn lines(text: &str) -> Vec<String> {
        text.lines().map(str::to_string).collect()
    }

    #[test]
    fn test_parse_pointless() {
        let output = lines(
            "\
   Spacegroup         TotProb SysAbsProb     Reindex         Conditions
   <P 41 21 2>  (92)    0.950  0.961      h,k,l
   <P 43 21 2>  (96)    0.950  0.961      h,k,l
   <P 41 21 2>  (92)    0.950  0.961      h,k,l
Best Solution:    space group P 41 21 2
",
        );
        let result = parse_pointless(&output).unwrap();
        assert_eq!(result.best.as_deref(), Some("P 41 21 2"));
        assert_eq!(result.likely, ["P 41 21 2", "P 43 21 2"]);
    }

    #[test]
    fn test_parse_aimless() {
        let output = lines(
            "\
 Average unit cell:    78.01   78.01   37.12    90.00   90.00   90.00
 Summary data for        Project: AUTOMATIC Crystal: DEFAULT Dataset: NATIVE

                                           Overall  InnerShell  OuterShell
Low resolution limit                       39.02     39.02      1.81
High resolution limit                       1.78      4.83      1.78

Rmerge  (all I+ and I-)                    0.058     0.029     0.527
Total number of observations              192343     10002      9034
Completeness                                99.8      99.1      99.9
Completeness                                 1.0       1.0       1.0
",
        );
        let (statistics, cell) = parse_aimless(&output).unwrap();
        let dataset = &statistics[&DatasetKey::new("AUTOMATIC", "DEFAULT", "NATIVE")];
        assert_eq!(dataset["High resolution limit"], vec![1.78, 4.83, 1.78]);
        assert_eq!(dataset["Rmerge(I+/-)"], vec![0.058, 0.029, 0.527]);
        assert_eq!(dataset["Completeness"], vec![99.8, 99.1, 99.9]);
        assert_eq!(dataset["Total observations"][0], 192343.0);
        assert_eq!(cell.unwrap().constants()[2], 37.12);
    }

    #[test]
    fn test_derived_names() {
        let scaled = Path::new("/work/scale/5_scaled.mtz");
        assert_eq!(derived(scaled, "_unmerged.sca"), Path::new("/work/scale/5_scaled_unmerged.sca"));
    }

    #[test]
    fn test_freer_file_used_at_finish() {
        let dir = tempfile::tempdir().unwrap();
        let (run, drivers) = testing::run_context(dir.path());
        let (mut graph, chain) = testing::xds_chain(dir.path());
        let scaler = testing::attach_scaler(&mut graph, &run, dir.path(), &[chain.integrater]);

        let mut scaler = ScalerHandle::new(Engine::new(&mut graph, &run), scaler).unwrap();
        assert!(scaler.scaled_reflections("mtz").unwrap().exists());
        assert_eq!(drivers.count("freerflag"), 1);

        let freer = dir.path().join("free_reference.mtz");
        std::fs::write(&freer, b"").unwrap();
        scaler.set_freer_file(&freer).unwrap();
        assert!(scaler.scaled_reflections("mtz").unwrap().exists());
        assert_eq!(drivers.count("cad"), 1);
        assert_eq!(drivers.count("aimless"), 1);
        assert_eq!(drivers.count("ctruncate"), 2);
    }
}
