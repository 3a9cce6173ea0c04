//! DIALS backends.
//!
//! Every DIALS program reads and writes experiment (`.expt`) and
//! reflection (`.refl`) files named on its command line; outputs are
//! prefixed with the job number so reruns never clobber earlier results.

use super::{numbered, own_file, parse_dials_cell, parse_settings, to_settings};
use crate::data::{FrameProcessor, Lattice, LatticeSolution, LatticeSolutions, UnitCell};
use crate::driver::Driver;
use crate::error::{Error, Result, ToolError};
use crate::stage::integrater::{ImageStats, MosaicRange};
use crate::stage::refiner::epoch_key;
use crate::stage::registry::Backend;
use crate::stage::{
    IndexerBackend, IndexerState, IntegraterBackend, IntegraterState, PhaseContext, PhaseOutcome,
    RefinerBackend, RefinerState, Upstream,
};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Scan-varying refinement needs at least this much rotation, in degrees.
const SCAN_VARYING_MIN_ROTATION: f64 = 5.0;

pub(super) fn arg(path: &Path) -> String {
    path.display().to_string()
}

/// Run a driver to completion without judging its output.
fn wait(ctx: &PhaseContext<'_>, driver: &mut dyn Driver) -> Result<Vec<String>> {
    driver.start()?;
    driver.close_wait()?;
    ctx.record_job(driver);
    Ok(driver.get_all_output()?.to_vec())
}

/// Run `program` with `args`, returning its output once it has been
/// checked for failures.
pub(super) fn run_dials(ctx: &PhaseContext<'_>, mut driver: Box<dyn Driver>, args: &[String]) -> Result<Vec<String>> {
    for token in args {
        driver.add_command_line(token);
    }
    let output = wait(ctx, driver.as_mut())?;
    driver.check_for_errors()?;
    Ok(output)
}


fn cell_arg(cell: &UnitCell) -> String {
    let c = cell.constants();
    format!("{},{},{},{},{},{}", c[0], c[1], c[2], c[3], c[4], c[5])
}

/// One entry of `bravais_summary.json`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BravaisSetting {
    pub bravais: String,
    pub unit_cell: [f64; 6],
    pub max_angular_difference: f64,
    #[serde(default)]
    pub recommended: bool,
    #[serde(default = "identity_basis")]
    pub cb_op: String,
}

fn identity_basis() -> String {
    "a,b,c".to_string()
}

/// Settings in solution number order.
pub fn parse_bravais_summary(text: &str) -> Result<Vec<(u32, BravaisSetting)>> {
    let summary: BTreeMap<String, BravaisSetting> = serde_json::from_str(text)?;
    let mut settings = summary
        .into_iter()
        .map(|(id, setting)| {
            id.parse::<u32>()
                .map(|id| (id, setting))
                .map_err(|_| Error::InvalidArgument(format!("bad Bravais setting id {id}")))
        })
        .collect::<Result<Vec<_>>>()?;
    settings.sort_by_key(|(id, _)| *id);
    Ok(settings)
}

/// Rows of the `Summary vs image number` table printed by dials.integrate.
pub fn parse_integration_table(output: &[String]) -> BTreeMap<u32, ImageStats> {
    let mut images = BTreeMap::new();
    let mut in_table = false;
    for line in output {
        let trimmed = line.trim();
        if trimmed.contains("| Image") && trimmed.contains("# full") {
            in_table = true;
            continue;
        }
        if !in_table {
            continue;
        }
        if trimmed.is_empty() {
            break;
        }
        if !trimmed.starts_with('|') {
            continue;
        }
        let fields: Vec<&str> = trimmed
            .trim_matches('|')
            .split('|')
            .map(str::trim)
            .collect();
        let counts: Option<Vec<u64>> = fields.iter().take(7).map(|f| f.parse().ok()).collect();
        let Some(counts) = counts.filter(|c| c.len() == 7) else {
            continue;
        };
        let stats = ImageStats {
            image: counts[0] as u32,
            error: 0,
            scale: 1.0,
            overloads: counts[3],
            all: counts[1] + counts[2],
            strong: counts[6],
            rejected: 0,
            mosaic: None,
            rmsd_pixel: None,
        };
        images.insert(stats.image, stats);
    }
    images
}

/// Number of reflections in the last `Saving N reflections` record.
fn saved_reflections(output: &[String]) -> Option<u64> {
    output.iter().rev().find_map(|line| {
        let rest = line.trim().strip_prefix("Saving ")?;
        rest.split_whitespace().next()?.parse().ok()
    })
}

/// Scan-varying refinement only makes sense on a long enough sweep.
pub fn use_scan_varying(requested: bool, fast_mode: bool, frame: &FrameProcessor) -> bool {
    requested && !fast_mode && frame.oscillation_range() > SCAN_VARYING_MIN_ROTATION
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DialsIndexer {
    /// Extra `dials.index` parameters, e.g. `indexing.method=fft1d`.
    pub parameters: Vec<String>,
}

impl IndexerBackend for DialsIndexer {
    fn name(&self) -> &'static str {
        "dials"
    }

    fn settings(&self) -> Value {
        to_settings(self)
    }

    fn prepare(&self, state: &mut IndexerState, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome> {
        let dir = ctx.ensure_working_dir()?.to_path_buf();
        if state.wedges.is_empty() {
            state.wedges = vec![state.frame.image_range];
        }
        let frame = &state.frame;

        let driver = ctx.driver("dials.import")?;
        let imported = dir.join(numbered(driver.as_ref(), "imported.expt"));
        let mut args = vec![
            format!("template={}", arg(&frame.directory.join(&frame.template))),
            format!("image_range={},{}", frame.image_range.0, frame.image_range.1),
            format!("output.experiments={}", arg(&imported)),
        ];
        if let Some((fast, slow)) = state.beam_centre {
            args.push(format!("slow_fast_beam_centre={slow},{fast}"));
        }
        if let Some(distance) = state.distance {
            args.push(format!("distance={distance}"));
        }
        run_dials(ctx, driver, &args)?;

        let driver = ctx.driver("dials.find_spots")?;
        let strong = dir.join(numbered(driver.as_ref(), "strong.refl"));
        let mut args = vec![arg(&imported)];
        for (start, end) in &state.wedges {
            args.push(format!("scan_range={start},{end}"));
        }
        args.push(format!("nproc={}", ctx.run.config.nproc));
        args.push(format!("output.reflections={}", arg(&strong)));
        run_dials(ctx, driver, &args)?;

        ctx.publish_file("dials.import", "imported.expt", imported)?;
        ctx.publish_file("dials.find_spots", "strong.refl", strong)?;
        Ok(PhaseOutcome::done())
    }

    fn index(&self, state: &mut IndexerState, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome> {
        let dir = ctx.ensure_working_dir()?.to_path_buf();
        let imported = own_file(ctx, "imported.expt")?;
        let strong = own_file(ctx, "strong.refl")?;

        let mut driver = ctx.driver("dials.index")?;
        let indexed_expt = dir.join(numbered(driver.as_ref(), "indexed.expt"));
        let indexed_refl = dir.join(numbered(driver.as_ref(), "indexed.refl"));
        driver.add_command_line(&arg(&imported));
        driver.add_command_line(&arg(&strong));
        if let Some(lattice) = state.input_lattice {
            driver.add_command_line(&format!("known_symmetry.space_group={}", lattice.spacegroup_number()));
        }
        if let Some(cell) = state.input_cell {
            driver.add_command_line(&format!("known_symmetry.unit_cell={}", cell_arg(&cell)));
        }
        for parameter in &self.parameters {
            driver.add_command_line(parameter);
        }
        driver.add_command_line(&format!("output.experiments={}", arg(&indexed_expt)));
        driver.add_command_line(&format!("output.reflections={}", arg(&indexed_refl)));
        let output = wait(ctx, driver.as_mut())?;
        if output.iter().any(|l| l.contains("No suitable lattice could be found")) {
            return Err(ToolError::Failed {
                program: "dials.index".to_string(),
                message: "No suitable indexing solution could be found.".to_string(),
                hint: Some(format!(
                    "You can view the reciprocal space with:\ndials.reciprocal_lattice_viewer {} {}",
                    imported.display(),
                    strong.display()
                )),
            }
            .into());
        }
        driver.check_for_errors()?;

        let driver = ctx.driver("dials.refine_bravais_settings")?;
        let prefix = numbered(driver.as_ref(), "");
        run_dials(
            ctx,
            driver,
            &[
                arg(&indexed_expt),
                arg(&indexed_refl),
                format!("output.prefix={prefix}"),
            ],
        )?;
        let summary_path = dir.join(format!("{prefix}bravais_summary.json"));
        let summary = parse_bravais_summary(&std::fs::read_to_string(&summary_path)?)?;

        let mut solutions = Vec::new();
        for (id, setting) in summary.into_iter().filter(|(_, s)| s.recommended) {
            let Ok(lattice) = setting.bravais.parse::<Lattice>() else {
                debug!("skipping Bravais setting {} ({})", id, setting.bravais);
                continue;
            };
            let expt = dir.join(format!("{prefix}bravais_setting_{id}.expt"));
            ctx.publish_file("dials.refine_bravais_settings", &format!("setting/{lattice}.expt"), expt)?;
            ctx.staged.insert_text(format!("setting/{lattice}.cb_op"), setting.cb_op);
            solutions.push(LatticeSolution {
                lattice,
                cell: UnitCell::new(setting.unit_cell)?,
                penalty: setting.max_angular_difference,
            });
        }
        if solutions.is_empty() {
            return Err(ToolError::Failed {
                program: "dials.refine_bravais_settings".to_string(),
                message: "no recommended Bravais setting".to_string(),
                hint: None,
            }
            .into());
        }
        state.solutions = Some(LatticeSolutions::new(solutions)?);

        ctx.publish_file("dials.index", "indexed.expt", indexed_expt)?;
        ctx.publish_file("dials.index", "indexed.refl", indexed_refl)?;
        Ok(PhaseOutcome::done())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DialsRefiner;

impl DialsRefiner {
    /// Experiments and reflections in the lattice the indexer settled on.
    fn from_dials(
        &self,
        ctx: &PhaseContext<'_>,
        upstream: &Upstream,
        lattice: Lattice,
        dir: &Path,
    ) -> Result<(PathBuf, PathBuf)> {
        let expt = match upstream.payload.file(&format!("setting/{lattice}.expt")) {
            Some(setting) => setting.to_path_buf(),
            None => upstream.require_file("indexed.expt")?.to_path_buf(),
        };
        let mut refl = upstream.require_file("indexed.refl")?.to_path_buf();
        let cb_op = upstream
            .payload
            .get(&format!("setting/{lattice}.cb_op"))
            .and_then(|a| a.as_text())
            .unwrap_or("a,b,c");
        if cb_op != "a,b,c" {
            let driver = ctx.driver("dials.reindex")?;
            let reindexed = dir.join(numbered(driver.as_ref(), "reindexed.refl"));
            run_dials(
                ctx,
                driver,
                &[
                    arg(&refl),
                    format!("change_of_basis_op={cb_op}"),
                    format!("output.reflections={}", arg(&reindexed)),
                ],
            )?;
            refl = reindexed;
        }
        Ok((expt, refl))
    }

    /// Convert XDS indexing results.
    fn from_xds(&self, ctx: &PhaseContext<'_>, upstream: &Upstream, dir: &Path) -> Result<(PathBuf, PathBuf)> {
        let xparm = upstream.require_file("XPARM.XDS")?;
        let spots = upstream.require_file("SPOT.XDS")?;

        let driver = ctx.driver("dials.import_xds")?;
        let expt = dir.join(numbered(driver.as_ref(), "xds.expt"));
        let xds_dir = xparm.parent().unwrap_or(dir);
        run_dials(
            ctx,
            driver,
            &[
                arg(xds_dir),
                "input.xds_file=XPARM.XDS".to_string(),
                format!("output.xds_experiments={}", arg(&expt)),
            ],
        )?;

        let driver = ctx.driver("dials.import_xds")?;
        let refl = dir.join(numbered(driver.as_ref(), "spot_xds.refl"));
        run_dials(
            ctx,
            driver,
            &[
                arg(spots),
                "input.method=reflections".to_string(),
                format!("output.reflections={}", arg(&refl)),
            ],
        )?;
        Ok((expt, refl))
    }
}

impl RefinerBackend for DialsRefiner {
    fn name(&self) -> &'static str {
        "dials"
    }

    fn prepare(&self, state: &mut RefinerState, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome> {
        let mut inputs = Vec::new();
        for &epoch in state.indexers.keys() {
            let (upstream, indexer) = state.indexer(ctx, epoch)?;
            let dir = ctx.ensure_working_dir()?.join(epoch.to_string());
            std::fs::create_dir_all(&dir)?;
            let files = if upstream.payload.contains("indexed.expt") {
                let lattice = indexer.lattice.ok_or_else(|| Error::PayloadMissing {
                    stage: upstream.label.clone(),
                    key: "lattice".to_string(),
                })?;
                self.from_dials(ctx, upstream, lattice, &dir)?
            } else {
                self.from_xds(ctx, upstream, &dir)?
            };
            inputs.push((epoch, files));
        }
        for (epoch, (expt, refl)) in inputs {
            ctx.staged.insert_file(epoch_key(epoch, "input.expt"), expt);
            ctx.staged.insert_file(epoch_key(epoch, "input.refl"), refl);
        }
        Ok(PhaseOutcome::done())
    }

    fn refine(&self, state: &mut RefinerState, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome> {
        let config = &ctx.run.config;
        let requested = state.scan_varying.unwrap_or(config.scan_varying);
        let mut refined_cell = None;
        let mut published = Vec::new();
        for &epoch in state.indexers.keys() {
            let (_, indexer) = state.indexer(ctx, epoch)?;
            let scan_varying = use_scan_varying(requested, config.fast_mode, &indexer.frame);
            let dir = ctx.working_dir().join(epoch.to_string());
            let expt = own_file(ctx, &epoch_key(epoch, "input.expt"))?;
            let refl = own_file(ctx, &epoch_key(epoch, "input.refl"))?;

            let driver = ctx.driver("dials.refine")?;
            let refined_expt = dir.join(numbered(driver.as_ref(), "refined.expt"));
            let refined_refl = dir.join(numbered(driver.as_ref(), "refined.refl"));
            let output = run_dials(
                ctx,
                driver,
                &[
                    arg(&expt),
                    arg(&refl),
                    format!("scan_varying={scan_varying}"),
                    format!("output.experiments={}", arg(&refined_expt)),
                    format!("output.reflections={}", arg(&refined_refl)),
                ],
            )?;
            if refined_cell.is_none() {
                refined_cell = parse_dials_cell(&output)?;
            }
            published.push((epoch_key(epoch, "refined.expt"), refined_expt));
            published.push((epoch_key(epoch, "refined.refl"), refined_refl));
        }
        for (key, path) in published {
            ctx.publish_file("dials.refine", &key, path)?;
        }
        state.adopt_indexer_result(ctx)?;
        if let Some(cell) = refined_cell {
            state.cell = Some(cell);
        }
        Ok(PhaseOutcome::done())
    }

    /// Export XDS geometry so XDS integration can follow DIALS refinement.
    fn finish(&self, state: &mut RefinerState, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome> {
        for &epoch in state.indexers.keys() {
            let refined = own_file(ctx, &epoch_key(epoch, "refined.expt"))?;
            let xds_dir = ctx.working_dir().join(epoch.to_string()).join("xds");
            let driver = ctx.driver("dials.export")?;
            run_dials(
                ctx,
                driver,
                &[
                    arg(&refined),
                    "format=xds".to_string(),
                    format!("xds.directory={}", arg(&xds_dir)),
                ],
            )?;
            ctx.publish_file("dials.export", &epoch_key(epoch, "XPARM.XDS"), xds_dir.join("XPARM.XDS"))?;
        }
        Ok(PhaseOutcome::done())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DialsIntegrater;

impl DialsIntegrater {
    fn export_mtz(&self, ctx: &PhaseContext<'_>, expt: &Path, refl: &Path, name: &str) -> Result<PathBuf> {
        let driver = ctx.driver("dials.export")?;
        let mtz = ctx.working_dir().join(numbered(driver.as_ref(), name));
        run_dials(
            ctx,
            driver,
            &[
                arg(expt),
                arg(refl),
                "format=mtz".to_string(),
                format!("mtz.hklout={}", arg(&mtz)),
            ],
        )?;
        Ok(mtz)
    }
}

impl IntegraterBackend for DialsIntegrater {
    fn name(&self) -> &'static str {
        "dials"
    }

    fn prepare(&self, state: &mut IntegraterState, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome> {
        let upstream = ctx.upstream(state.refiner)?;
        upstream.require_file(&state.refined("refined.expt"))?;
        upstream.require_file(&state.refined("refined.refl"))?;
        ctx.ensure_working_dir()?;
        Ok(PhaseOutcome::done())
    }

    fn integrate(&self, state: &mut IntegraterState, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome> {
        let upstream = ctx.upstream(state.refiner)?;
        let mut expt = upstream.require_file(&state.refined("refined.expt"))?.to_path_buf();
        let mut refl = upstream.require_file(&state.refined("refined.refl"))?.to_path_buf();
        let refiner_cell = upstream.state.as_refiner().and_then(|r| r.cell);
        let dir = ctx.working_dir().to_path_buf();

        if let Some((start, end)) = state.wedge {
            let driver = ctx.driver("dials.slice_sequence")?;
            let sliced_expt = dir.join(numbered(driver.as_ref(), "sliced.expt"));
            let sliced_refl = dir.join(numbered(driver.as_ref(), "sliced.refl"));
            run_dials(
                ctx,
                driver,
                &[
                    arg(&expt),
                    arg(&refl),
                    format!("image_range={start},{end}"),
                    format!("output.experiments={}", arg(&sliced_expt)),
                    format!("output.reflections={}", arg(&sliced_refl)),
                ],
            )?;
            expt = sliced_expt;
            refl = sliced_refl;
        }

        let driver = ctx.driver("dials.integrate")?;
        let integrated_expt = dir.join(numbered(driver.as_ref(), "integrated.expt"));
        let integrated_refl = dir.join(numbered(driver.as_ref(), "integrated.refl"));
        let mut args = vec![arg(&expt), arg(&refl), format!("nproc={}", ctx.run.config.nproc)];
        if let Some(high) = state.resolution.high {
            args.push(format!("prediction.d_min={high}"));
        }
        if let Some(low) = state.resolution.low {
            args.push(format!("prediction.d_max={low}"));
        }
        if state.ice {
            args.push("integration.filter.ice_rings=True".to_string());
        }
        if !state.excluded_regions.is_empty() {
            debug!("{}: excluded regions are not applied by dials.integrate", state.sweep_name);
        }
        if let Some(parameters) = state.program_parameters.get("dials") {
            args.extend(parameters.iter().map(|(name, value)| format!("{name}={value}")));
        }
        args.push(format!("output.experiments={}", arg(&integrated_expt)));
        args.push(format!("output.reflections={}", arg(&integrated_refl)));
        let output = run_dials(ctx, driver, &args)?;

        let images = parse_integration_table(&output);
        state.per_image_status = images.values().map(ImageStats::status_char).collect();
        state.mosaic = MosaicRange::from_values(&images.values().filter_map(|s| s.mosaic).collect::<Vec<_>>());
        state.reflections = saved_reflections(&output);
        state.cell = parse_dials_cell(&output)?.or(refiner_cell);
        state.batches = Some(state.images());
        info!("{}: integrated {} images with DIALS", state.sweep_name, images.len());

        let mtz = self.export_mtz(ctx, &integrated_expt, &integrated_refl, "integrated.mtz")?;
        ctx.publish_file("dials.integrate", "integrated.expt", integrated_expt)?;
        ctx.publish_file("dials.integrate", "integrated.refl", integrated_refl)?;
        ctx.publish_file("dials.export", "raw_intensities", mtz)?;
        Ok(PhaseOutcome::done())
    }

    fn finish(&self, state: &mut IntegraterState, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome> {
        if state.spacegroup_number.is_none() && state.reindex_operator.is_none() {
            let raw = own_file(ctx, "raw_intensities")?;
            ctx.publish_file("dials.export", "intensities", raw)?;
            return Ok(PhaseOutcome::done());
        }

        let expt = own_file(ctx, "integrated.expt")?;
        let refl = own_file(ctx, "integrated.refl")?;
        let dir = ctx.working_dir().to_path_buf();
        let driver = ctx.driver("dials.reindex")?;
        let reindexed_expt = dir.join(numbered(driver.as_ref(), "reindexed.expt"));
        let reindexed_refl = dir.join(numbered(driver.as_ref(), "reindexed.refl"));
        let mut args = vec![arg(&expt), arg(&refl)];
        if let Some(operator) = &state.reindex_operator {
            args.push(format!("change_of_basis_op={operator}"));
        }
        if let Some(number) = state.spacegroup_number {
            args.push(format!("space_group={number}"));
        }
        args.push(format!("output.experiments={}", arg(&reindexed_expt)));
        args.push(format!("output.reflections={}", arg(&reindexed_refl)));
        let output = run_dials(ctx, driver, &args)?;
        if let Some(cell) = parse_dials_cell(&output)? {
            state.cell = Some(cell);
        }

        let mtz = self.export_mtz(ctx, &reindexed_expt, &reindexed_refl, "reindexed.mtz")?;
        ctx.publish_file("dials.export", "intensities", mtz)?;
        Ok(PhaseOutcome::done())
    }
}

pub fn indexer_from_settings(settings: &Value) -> Result<Backend> {
    let indexer: DialsIndexer = parse_settings(settings)?;
    Ok(Backend::Indexer(Arc::new(indexer)))
}

pub fn refiner_from_settings(_settings: &Value) -> Result<Backend> {
    Ok(Backend::Refiner(Arc::new(DialsRefiner)))
}

pub fn integrater_from_settings(_settings: &Value) -> Result<Backend> {
    Ok(Backend::Integrater(Arc::new(DialsIntegrater)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{Engine, IntegraterHandle};
    use crate::testing::{self, ScriptedDrivers};

    #[test]
    fn test_parse_bravais_summary() {
        let text = r#"{
            "2": {"bravais": "mP", "unit_cell": [78.0, 37.1, 78.1, 90.0, 90.1, 90.0],
                  "max_angular_difference": 0.1, "recommended": true, "cb_op": "-a,-c,-b"},
            "1": {"bravais": "aP", "unit_cell": [37.1, 78.0, 78.1, 90.0, 90.0, 89.9],
                  "max_angular_difference": 0.0, "recommended": true, "rmsd": 0.05}
        }"#;
        let settings = parse_bravais_summary(text).unwrap();
        assert_eq!(settings.len(), 2);
        assert_eq!(settings[0].0, 1);
        assert_eq!(settings[0].1.cb_op, "a,b,c");
        assert_eq!(settings[1].1.bravais, "mP");
        assert!(parse_bravais_summary(r#"{"x": {}}"#).is_err());
    }

    #[test]
    fn test_parse_integration_table() {
        let output: Vec<String> = [
            " Summary vs image number",
            " | Image | # full | # part | # over | # ice | # sum | # prf | <Ibg> |",
            " |-------+--------+--------+--------+-------+-------+-------+-------|",
            " |     1 |   1200 |     50 |      0 |     0 |  1250 |  1200 |  0.51 |",
            " |     2 |   1180 |     40 |     30 |     0 |  1220 |  1100 |  0.50 |",
            " |     3 |      0 |      0 |      0 |     0 |     0 |     0 |  0.00 |",
            "",
            " |     4 |   1180 |     40 |     30 |     0 |  1220 |  1100 |  0.50 |",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let images = parse_integration_table(&output);
        assert_eq!(images.len(), 3);
        let status: String = images.values().map(ImageStats::status_char).collect();
        assert_eq!(status, "oO.");
        assert_eq!(images[&1].all, 1250);
    }

    #[test]
    fn test_scan_varying_needs_rotation() {
        let frame = FrameProcessor::new("x_####.cbf", "/data")
            .with_image_range(1, 90)
            .with_oscillation(0.0, 0.1);
        assert!(frame.oscillation_range() > SCAN_VARYING_MIN_ROTATION);
        assert!(use_scan_varying(true, false, &frame));
        assert!(!use_scan_varying(true, true, &frame));
        assert!(!use_scan_varying(false, false, &frame));

        let short = frame.with_image_range(1, 10);
        assert!(!use_scan_varying(true, false, &short));
    }

    #[test]
    fn test_no_lattice_message_carries_viewer_hint() {
        let dir = tempfile::tempdir().unwrap();
        let drivers = std::sync::Arc::new(ScriptedDrivers::standard());
        drivers.fail("dials.index", &["No suitable lattice could be found."], 0);
        let run = testing::run_context_with(dir.path(), drivers.clone())
            .with_fallback(std::sync::Arc::new(crate::runtime::policy::NeverFallback));
        let (mut graph, chain) = testing::chain(dir.path(), "dials", "dials", "dials");

        let err = Engine::new(&mut graph, &run).ensure_finished(chain.indexer).unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("No suitable indexing solution could be found."), "{message}");
        assert!(message.contains("\n\nYou can view the reciprocal space with:\ndials.reciprocal_lattice_viewer "));
        assert_eq!(drivers.count("dials.refine_bravais_settings"), 0);
    }

    #[test]
    fn test_dials_chain_integrates() {
        let dir = tempfile::tempdir().unwrap();
        let (run, drivers) = testing::run_context(dir.path());
        let (mut graph, chain) = testing::chain(dir.path(), "dials", "dials", "dials");

        let mut integrater = IntegraterHandle::new(Engine::new(&mut graph, &run), chain.integrater).unwrap();
        let intensities = integrater.intensities().unwrap();
        assert!(intensities.exists());
        assert_eq!(integrater.lattice().unwrap(), Lattice::TetragonalP);
        assert_eq!(drivers.count("dials.index"), 1);
        assert_eq!(drivers.count("dials.refine"), 1);
        assert_eq!(drivers.count("dials.integrate"), 1);
        assert_eq!(drivers.count("xds_par"), 0);
    }

    #[test]
    fn test_dials_refiner_after_xds_indexer() {
        let dir = tempfile::tempdir().unwrap();
        let (run, drivers) = testing::run_context(dir.path());
        let (mut graph, chain) = testing::chain(dir.path(), "xds", "dials", "xds");

        let mut integrater = IntegraterHandle::new(Engine::new(&mut graph, &run), chain.integrater).unwrap();
        integrater.intensities().unwrap();
        assert_eq!(drivers.count("dials.import_xds"), 2);
        assert_eq!(drivers.count("dials.export"), 1);
        assert_eq!(drivers.count_in("xds_par", "integrate"), 1);
    }
}
