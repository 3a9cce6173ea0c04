//! The `dials` scaler: dials.cosym for symmetry, dials.scale for scaling,
//! dials.export and dials.merge for the reflection files. Amplitudes and
//! the FreeR set come from the CCP4 programs as for the other scalers.

use super::ccp4::{choose_symmetry, finish_reflections, split_record, SymmetryResult};
use super::dials::{arg, run_dials};
use super::{ccp4_driver, compile, numbered, own_file, parse_dials_cell, parse_settings, run_ccp4, to_settings};
use crate::error::Result;
use crate::stage::registry::Backend;
use crate::stage::scaler::{DatasetStatistics, STATISTIC_NAMES};
use crate::stage::{PhaseContext, PhaseOutcome, ScalerBackend, ScalerState};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// The spacegroup dials.cosym settled on.
pub fn parse_cosym(output: &[String]) -> Result<SymmetryResult> {
    let best = compile(r"Best solution:\s+(.+)")?;
    let mut result = SymmetryResult::default();
    for line in output {
        if let Some(caps) = best.captures(line) {
            result.best = Some(caps[1].trim().to_string());
        }
    }
    Ok(result)
}

/// Overall, low and high resolution shell statistics from the merging
/// summary dials.scale prints last.
pub fn parse_merging_summary(output: &[String]) -> DatasetStatistics {
    let mut statistics = DatasetStatistics::new();
    // Positions of the Overall, Low and High columns, and the header width.
    let mut columns: Option<([usize; 3], usize)> = None;
    for line in output {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let position = |name: &str| tokens.iter().position(|t| *t == name);
        if let (Some(overall), Some(low), Some(high)) = (position("Overall"), position("Low"), position("High")) {
            columns = Some(([overall, low, high], tokens.len()));
            statistics.clear();
            continue;
        }
        let Some((positions, width)) = columns else {
            continue;
        };
        let (label, values) = split_record(line);
        if values.is_empty() || values.len() > width {
            continue;
        }
        if !STATISTIC_NAMES.contains(&label.as_str()) {
            continue;
        }
        let offset = width - values.len();
        let picked: Option<Vec<f64>> = positions
            .iter()
            .map(|p| p.checked_sub(offset).and_then(|i| values.get(i).copied()))
            .collect();
        if let Some(picked) = picked {
            statistics.entry(label).or_insert(picked);
        }
    }
    statistics
}

fn bool_arg(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DialsScaler {
    /// Fraction of reflections flagged free when no FreeR file is given.
    pub free_fraction: f64,
}

impl Default for DialsScaler {
    fn default() -> Self {
        Self { free_fraction: 0.05 }
    }
}

impl ScalerBackend for DialsScaler {
    fn name(&self) -> &'static str {
        "dials"
    }

    fn settings(&self) -> Value {
        to_settings(self)
    }

    fn prepare(&self, state: &mut ScalerState, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome> {
        let mut args = Vec::new();
        for (upstream, _) in state.sweeps(ctx)? {
            args.push(arg(upstream.require_file("integrated.expt")?));
            args.push(arg(upstream.require_file("integrated.refl")?));
        }
        if let Some(spacegroup) = &state.input_spacegroup {
            args.push(format!("space_group={}", spacegroup.replace(' ', "")));
        }

        let driver = ctx.driver("dials.cosym")?;
        let dir = ctx.working_dir().to_path_buf();
        let expt = dir.join(numbered(driver.as_ref(), "symmetrized.expt"));
        let refl = dir.join(numbered(driver.as_ref(), "symmetrized.refl"));
        args.push(format!("output.experiments={}", arg(&expt)));
        args.push(format!("output.reflections={}", arg(&refl)));
        let output = run_dials(ctx, driver, &args)?;

        let outcome = choose_symmetry(state, ctx, parse_cosym(&output)?)?;
        state.cell = parse_dials_cell(&output)?;
        ctx.publish_file("dials.cosym", "symmetrized.expt", expt)?;
        ctx.publish_file("dials.cosym", "symmetrized.refl", refl)?;
        Ok(outcome)
    }

    fn scale(&self, state: &mut ScalerState, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome> {
        let symmetrized = [own_file(ctx, "symmetrized.expt")?, own_file(ctx, "symmetrized.refl")?];
        let dir = ctx.working_dir().to_path_buf();

        let driver = ctx.driver("dials.scale")?;
        let scaled_expt = dir.join(numbered(driver.as_ref(), "scaled.expt"));
        let scaled_refl = dir.join(numbered(driver.as_ref(), "scaled.refl"));
        let mut args: Vec<String> = symmetrized.iter().map(|p| arg(p)).collect();
        args.push(format!("anomalous={}", bool_arg(state.anomalous)));
        // One cutoff for the whole scaling job: the most generous limit.
        let limits: Vec<f64> = state.resolution_limits.values().copied().collect();
        if let Some(dmin) = limits.iter().copied().reduce(f64::min) {
            if limits.iter().any(|l| *l != dmin) {
                warn!("{}: dials.scale applies one resolution limit, using {dmin}", ctx.core.label);
            }
            args.push(format!("cut_data.d_min={dmin}"));
        }
        args.push(format!("output.experiments={}", arg(&scaled_expt)));
        args.push(format!("output.reflections={}", arg(&scaled_refl)));
        let output = run_dials(ctx, driver, &args)?;

        let summary = parse_merging_summary(&output);
        state.statistics.clear();
        if summary.is_empty() {
            warn!("{}: no merging statistics from dials.scale", ctx.core.label);
        } else {
            for dataset in state.datasets(ctx)? {
                state.statistics.insert(dataset, summary.clone());
            }
        }
        state.cell = parse_dials_cell(&output)?.or(state.cell);

        let scaled = [arg(&scaled_expt), arg(&scaled_refl)];
        let driver = ctx.driver("dials.export")?;
        let unmerged = dir.join(numbered(driver.as_ref(), "scaled_unmerged.mtz"));
        let mut args = scaled.to_vec();
        args.push("format=mtz".to_string());
        args.push(format!("mtz.hklout={}", arg(&unmerged)));
        run_dials(ctx, driver, &args)?;

        let driver = ctx.driver("dials.export")?;
        let unmerged_sca = dir.join(numbered(driver.as_ref(), "scaled_unmerged.sca"));
        let mut args = scaled.to_vec();
        args.push("format=sca".to_string());
        args.push(format!("sca.hklout={}", arg(&unmerged_sca)));
        run_dials(ctx, driver, &args)?;

        let driver = ctx.driver("dials.merge")?;
        let merged = dir.join(numbered(driver.as_ref(), "merged.mtz"));
        let mut args = scaled.to_vec();
        args.push(format!("anomalous={}", bool_arg(state.anomalous)));
        args.push(format!("output.mtz={}", arg(&merged)));
        run_dials(ctx, driver, &args)?;

        let merged_sca = merged.with_extension("sca");
        let mut mtz2sca = ccp4_driver(ctx, "mtz2sca")?;
        {
            let driver = mtz2sca.driver_mut();
            driver.add_command_line(&arg(&merged));
            driver.add_command_line(&arg(&merged_sca));
        }
        run_ccp4(ctx, &mut mtz2sca)?;
        debug!("{}: merged reflections in {}", ctx.core.label, merged.display());

        ctx.publish_file("dials.scale", "scaled.expt", scaled_expt)?;
        ctx.publish_file("dials.scale", "scaled.refl", scaled_refl)?;
        ctx.publish_file("dials.export", "mtz_unmerged", unmerged)?;
        ctx.publish_file("dials.export", "sca_unmerged", unmerged_sca)?;
        ctx.publish_file("mtz2sca", "sca", merged_sca)?;
        ctx.publish_file("dials.merge", "scaled", merged)?;
        Ok(PhaseOutcome::done())
    }

    fn finish(&self, state: &mut ScalerState, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome> {
        finish_reflections(state, ctx, self.free_fraction)
    }
}

pub fn scaler_from_settings(settings: &Value) -> Result<Backend> {
    let scaler: DialsScaler = parse_settings(settings)?;
    Ok(Backend::Scaler(Arc::new(scaler)))
}
