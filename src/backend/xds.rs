//! XDS backends: IDXREF indexing, geometry hand-through refinement and
//! DEFPIX/INTEGRATE/CORRECT integration.
//!
//! XDS reads its instructions from `XDS.INP` in the working directory and
//! writes fixed-name output files next to it, so every job rewrites
//! `XDS.INP` and parses the `.LP` files it leaves behind.

use super::{copy_into, parse_settings, read_lines, to_settings, trailing_cell};
use crate::data::{FrameProcessor, Lattice, LatticeSolution, LatticeSolutions, UnitCell};
use crate::error::{Error, Result, ToolError};
use crate::stage::integrater::{ImageStats, MosaicRange};
use crate::stage::registry::Backend;
use crate::stage::{
    IndexerBackend, IndexerState, IntegraterBackend, IntegraterState, PhaseContext, PhaseOutcome,
    RefinerBackend, RefinerState, UpstreamRequest,
};
use crate::stage::refiner::epoch_key;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Resolution ranges (Angstrom) of hexagonal ice rings.
const ICE_RINGS: [(f64, f64); 10] = [
    (3.93, 3.87),
    (3.70, 3.64),
    (3.47, 3.41),
    (2.70, 2.64),
    (2.28, 2.22),
    (2.102, 2.042),
    (1.951, 1.891),
    (1.929, 1.869),
    (1.916, 1.856),
    (1.730, 1.670),
];

/// Rotation covered by each spot finding wedge, in degrees.
const WEDGE_WIDTH: f64 = 5.0;

/// Records of one `XDS.INP`.
#[derive(Debug, Clone, Default)]
pub struct XdsInput {
    records: Vec<String>,
}

impl XdsInput {
    pub fn new(jobs: &str, nproc: usize) -> Self {
        Self {
            records: vec![
                format!("JOB={jobs}"),
                format!("MAXIMUM_NUMBER_OF_PROCESSORS={nproc}"),
            ],
        }
    }

    pub fn push(&mut self, record: impl Into<String>) {
        self.records.push(record.into());
    }

    pub fn records(&self) -> &[String] {
        &self.records
    }

    /// Detector, beam and rotation records for `frame`.
    pub fn geometry(&mut self, frame: &FrameProcessor, beam: (f64, f64), distance: f64) -> Result<()> {
        let detector = &frame.detector;
        let (qx, qy) = detector.pixel_size;
        self.push(format!("DETECTOR={}", detector.name));
        self.push(format!("NX={} NY={}", detector.image_size.0, detector.image_size.1));
        self.push(format!("QX={qx:.6} QY={qy:.6}"));
        self.push(format!("ORGX={:.2} ORGY={:.2}", beam.0 / qx, beam.1 / qy));
        self.push(format!("DETECTOR_DISTANCE={distance:.3}"));
        self.push(format!("X-RAY_WAVELENGTH={:.6}", frame.wavelength));
        self.push(format!("OSCILLATION_RANGE={:.4}", frame.oscillation.1));
        self.push(format!("STARTING_ANGLE={:.3}", frame.oscillation.0));
        self.push(format!("STARTING_FRAME={}", frame.image_range.0));
        let [x, y, z] = frame.rotation_axis;
        let sign = if frame.reversephi { -1.0 } else { 1.0 };
        self.push(format!(
            "ROTATION_AXIS={:.4} {:.4} {:.4}",
            sign * x,
            sign * y,
            sign * z
        ));
        self.push(format!(
            "NAME_TEMPLATE_OF_DATA_FRAMES={}",
            frame.xds_template()?.display()
        ));
        Ok(())
    }

    pub fn data_range(&mut self, (start, end): (u32, u32)) {
        self.push(format!("DATA_RANGE={start} {end}"));
        self.push(format!("BACKGROUND_RANGE={start} {}", end.min(start + 4)));
    }

    pub fn symmetry(&mut self, spacegroup: u32, cell: &UnitCell) {
        let c = cell.constants();
        self.push(format!("SPACE_GROUP_NUMBER={spacegroup}"));
        self.push(format!(
            "UNIT_CELL_CONSTANTS={:.2} {:.2} {:.2} {:.2} {:.2} {:.2}",
            c[0], c[1], c[2], c[3], c[4], c[5]
        ));
    }

    /// Resolution limits and the ranges to leave out.
    pub fn resolution(&mut self, state: &IntegraterState) {
        if let Some(high) = state.resolution.high {
            let low = state.resolution.low.unwrap_or(50.0);
            self.push(format!("INCLUDE_RESOLUTION_RANGE={low:.2} {high:.2}"));
        }
        if state.ice {
            for (upper, lower) in ICE_RINGS {
                self.push(format!("EXCLUDE_RESOLUTION_RANGE= {upper:.2} {lower:.2}"));
            }
        }
        for (upper, lower) in &state.excluded_regions {
            self.push(format!("EXCLUDE_RESOLUTION_RANGE= {upper:.2} {lower:.2}"));
        }
    }

    pub fn friedel(&mut self, anomalous: bool) {
        if anomalous {
            self.push("FRIEDEL'S_LAW=FALSE");
            self.push("STRICT_ABSORPTION_CORRECTION=TRUE");
        } else {
            self.push("FRIEDEL'S_LAW=TRUE");
        }
    }

    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        self.write_as(dir, "XDS.INP")
    }

    /// Write the records to `name` in `dir`, for the XDS programs that
    /// read another file, such as XSCALE.
    pub fn write_as(&self, dir: &Path, name: &str) -> Result<PathBuf> {
        let path = dir.join(name);
        let mut file = std::io::BufWriter::new(std::fs::File::create(&path)?);
        for record in &self.records {
            writeln!(file, "{record}")?;
        }
        file.flush()?;
        Ok(path)
    }
}

/// Run XDS on `input` in the stage's working directory, returning its
/// standard output.
fn run_xds(ctx: &PhaseContext<'_>, input: &XdsInput) -> Result<Vec<String>> {
    let dir = ctx.ensure_working_dir()?;
    input.write(dir)?;
    let mut driver = ctx.driver(&ctx.run.config.xds_executable)?;
    driver.start()?;
    driver.close_wait()?;
    ctx.record_job(driver.as_ref());
    let output = driver.get_all_output()?.to_vec();
    check_xds_errors(&output)?;
    driver.check_for_errors()?;
    Ok(output)
}

/// XDS reports its own failures as `!!! ERROR !!!` records.
pub(super) fn check_xds_errors(output: &[String]) -> Result<()> {
    match output.iter().find(|line| line.contains("!!! ERROR !!!")) {
        Some(line) => Err(ToolError::Failed {
            program: "xds".to_string(),
            message: line.trim().to_string(),
            hint: None,
        }
        .into()),
        None => Ok(()),
    }
}

/// Integer coefficients of one component of a reindex operator, e.g.
/// `-h+k` or `2*l`.
fn operator_row(component: &str) -> Option<[i32; 3]> {
    let mut row = [0; 3];
    let mut rest = component;
    while !rest.is_empty() {
        let (sign, body) = match rest.as_bytes()[0] {
            b'-' => (-1, &rest[1..]),
            b'+' => (1, &rest[1..]),
            _ => (1, rest),
        };
        let axis_at = body.find(|c| matches!(c, 'h' | 'k' | 'l'))?;
        let factor = body[..axis_at].trim_end_matches('*');
        let factor: i32 = if factor.is_empty() { 1 } else { factor.parse().ok()? };
        let axis = match &body[axis_at..axis_at + 1] {
            "h" => 0,
            "k" => 1,
            _ => 2,
        };
        row[axis] += sign * factor;
        rest = &body[axis_at + 1..];
    }
    Some(row)
}

/// The twelve integers of `REIDX=` for an operator such as `k,h,-l`.
pub fn reindex_matrix(operator: &str) -> Result<[i32; 12]> {
    let rejected = || Error::ReindexRejected(operator.to_string());
    let rows: Vec<[i32; 3]> = operator
        .split(',')
        .map(|c| operator_row(c.trim()))
        .collect::<Option<_>>()
        .ok_or_else(rejected)?;
    if rows.len() != 3 {
        return Err(rejected());
    }
    let mut matrix = [0; 12];
    for (i, row) in rows.iter().enumerate() {
        matrix[i * 4..i * 4 + 3].copy_from_slice(row);
    }
    Ok(matrix)
}

/// What IDXREF found.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdxrefResult {
    pub solutions: Vec<LatticeSolution>,
    /// Direct beam in pixels.
    pub beam: Option<(f64, f64)>,
    pub distance: Option<f64>,
    pub mosaic: Option<f64>,
}

pub fn parse_idxref_lp(lines: &[String]) -> Result<IdxrefResult> {
    let character = super::compile(
        r"^\s*\*\s+(\d+)\s+([a-z][A-Z])\s+([\d.]+)\s+([\d.]+)\s+([\d.]+)\s+([\d.]+)\s+([\d.]+)\s+([\d.]+)\s+([\d.]+)",
    )?;
    let mut result = IdxrefResult::default();
    for line in lines {
        if let Some(caps) = character.captures(line) {
            let Ok(lattice) = caps[2].parse::<Lattice>() else {
                continue;
            };
            let mut constants = [0.0; 6];
            for (i, slot) in constants.iter_mut().enumerate() {
                *slot = caps[4 + i].parse().unwrap_or_default();
            }
            result.solutions.push(LatticeSolution {
                lattice,
                cell: UnitCell::new(constants)?,
                penalty: caps[3].parse().unwrap_or_default(),
            });
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if line.contains("DETECTOR COORDINATES (PIXELS) OF DIRECT BEAM") && tokens.len() >= 2 {
            let x = tokens[tokens.len() - 2].parse().ok();
            let y = tokens[tokens.len() - 1].parse().ok();
            result.beam = x.zip(y);
        } else if line.contains("CRYSTAL TO DETECTOR DISTANCE (mm)") {
            result.distance = tokens.last().and_then(|t| t.parse().ok());
        } else if line.contains("STANDARD DEVIATION OF SPINDLE POSITION") {
            result.mosaic = tokens.last().and_then(|t| t.parse().ok());
        }
    }
    Ok(result)
}

/// Per-image statistics and suggested parameters from INTEGRATE.LP.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntegrateSummary {
    pub images: BTreeMap<u32, ImageStats>,
    /// Values XDS suggests for the next run, by keyword.
    pub suggested: Vec<(String, String)>,
}

impl IntegrateSummary {
    pub fn status(&self) -> String {
        self.images.values().map(ImageStats::status_char).collect()
    }

    pub fn mosaic(&self) -> Option<MosaicRange> {
        let values: Vec<f64> = self.images.values().filter_map(|s| s.mosaic).collect();
        MosaicRange::from_values(&values)
    }
}

pub fn parse_integrate_lp(lines: &[String]) -> IntegrateSummary {
    let mut summary = IntegrateSummary::default();
    let mut block: Option<(u32, u32)> = None;
    let mut in_table = false;

    let apply = |summary: &mut IntegrateSummary, block: Option<(u32, u32)>, f: &dyn Fn(&mut ImageStats)| {
        if let Some((start, end)) = block {
            for stats in summary.images.range_mut(start..=end).map(|(_, s)| s) {
                f(stats);
            }
        }
    };

    for line in lines {
        if in_table {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.is_empty() {
                in_table = false;
                continue;
            }
            if tokens.len() < 8 {
                continue;
            }
            let parsed = (|| {
                Some(ImageStats {
                    image: tokens[0].parse().ok()?,
                    error: tokens[1].parse().ok()?,
                    scale: tokens[2].parse().ok()?,
                    overloads: tokens[4].parse().ok()?,
                    all: tokens[5].parse().ok()?,
                    strong: tokens[6].parse().ok()?,
                    rejected: tokens[7].parse().ok()?,
                    mosaic: None,
                    rmsd_pixel: None,
                })
            })();
            if let Some(stats) = parsed {
                summary.images.insert(stats.image, stats);
            }
            continue;
        }

        let tokens: Vec<&str> = line.split_whitespace().collect();
        if line.contains("IMAGE IER  SCALE") {
            in_table = true;
        } else if line.contains("PROCESSING OF IMAGES") {
            let numbers: Vec<u32> = tokens.iter().filter_map(|t| t.parse().ok()).collect();
            if let [start, end] = numbers[..] {
                block = Some((start, end));
            }
        } else if line.contains("CRYSTAL MOSAICITY (DEGREES)") {
            if let Some(mosaic) = tokens.get(3).and_then(|t| t.parse::<f64>().ok()) {
                apply(&mut summary, block, &|s| s.mosaic = Some(mosaic));
            }
        } else if line.contains("OF SPOT    POSITION (PIXELS)") {
            if let Some(rmsd) = tokens.last().and_then(|t| t.parse::<f64>().ok()) {
                apply(&mut summary, block, &|s| s.rmsd_pixel = Some(rmsd));
            }
        } else if line.trim_start().starts_with("BEAM_DIVERGENCE=")
            || line.trim_start().starts_with("REFLECTING_RANGE=")
        {
            if let (Some(key), Some(value)) = (tokens.first(), tokens.get(1)) {
                let key = key.trim_end_matches('=').to_string();
                summary.suggested.retain(|(k, _)| *k != key);
                summary.suggested.push((key, value.to_string()));
            }
        }
    }
    summary
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CorrectSummary {
    pub cell: Option<UnitCell>,
    pub reflections: Option<u64>,
    pub rmsd_pixel: Option<f64>,
}

pub fn parse_correct_lp(lines: &[String]) -> CorrectSummary {
    let mut summary = CorrectSummary::default();
    for line in lines {
        if line.contains("UNIT CELL PARAMETERS") {
            summary.cell = trailing_cell(line).or(summary.cell);
        } else if line.contains("REFLECTIONS ACCEPTED") {
            summary.reflections = line.split_whitespace().next().and_then(|t| t.parse().ok());
        } else if line.contains("OF SPOT    POSITION (PIXELS)") && summary.rmsd_pixel.is_none() {
            summary.rmsd_pixel = line.split_whitespace().last().and_then(|t| t.parse().ok());
        }
    }
    summary
}

/// Spot finding wedges: start, +45 and +90 degrees when the sweep is
/// long enough, otherwise the whole sweep.
fn choose_wedges(frame: &FrameProcessor, all_images: bool) -> Vec<(u32, u32)> {
    let (first, last) = frame.image_range;
    let width = frame.oscillation.1.abs().max(f64::EPSILON);
    let images = ((WEDGE_WIDTH / width).ceil() as u32).max(1);
    if all_images || frame.num_images() < 3 * images {
        return vec![(first, last)];
    }
    let mut wedges = Vec::new();
    for angle in [0.0, 45.0, 90.0] {
        let start = first + (angle / width).round() as u32;
        let end = start + images - 1;
        if end <= last && !wedges.iter().any(|&(s, _)| s == start) {
            wedges.push((start, end));
        }
    }
    wedges
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct XdsIndexer {
    /// Find spots on every image rather than on three wedges.
    pub all_images: bool,
}

impl IndexerBackend for XdsIndexer {
    fn name(&self) -> &'static str {
        "xds"
    }

    fn settings(&self) -> Value {
        to_settings(self)
    }

    fn prepare(&self, state: &mut IndexerState, _ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome> {
        state.frame.xds_template()?;
        if state.wedges.is_empty() {
            state.wedges = choose_wedges(&state.frame, self.all_images);
            debug!("{}: spot finding on {:?}", state.sweep_name, state.wedges);
        }
        Ok(PhaseOutcome::done())
    }

    fn index(&self, state: &mut IndexerState, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome> {
        let mut input = XdsInput::new("XYCORR INIT COLSPOT IDXREF", ctx.run.config.nproc);
        input.geometry(&state.frame, state.beam(), state.detector_distance())?;
        input.data_range(state.frame.image_range);
        for (start, end) in &state.wedges {
            input.push(format!("SPOT_RANGE={start} {end}"));
        }
        match (state.input_lattice, state.input_cell) {
            (Some(lattice), Some(cell)) => input.symmetry(lattice.spacegroup_number(), &cell),
            (None, Some(cell)) => input.symmetry(1, &cell),
            _ => {}
        }
        run_xds(ctx, &input)?;

        let dir = ctx.working_dir().to_path_buf();
        let idxref = parse_idxref_lp(&read_lines(&dir.join("IDXREF.LP"))?)?;
        if idxref.solutions.is_empty() {
            return Err(ToolError::Failed {
                program: "xds".to_string(),
                message: "IDXREF found no acceptable lattice".to_string(),
                hint: None,
            }
            .into());
        }
        state.solutions = Some(LatticeSolutions::new(idxref.solutions)?);
        let (qx, qy) = state.frame.detector.pixel_size;
        state.refined_beam_centre = idxref.beam.map(|(x, y)| (x * qx, y * qy));
        state.refined_distance = idxref.distance;
        state.mosaic = idxref.mosaic;

        ctx.publish_file("xds", "XPARM.XDS", dir.join("XPARM.XDS"))?;
        ctx.publish_file("xds", "SPOT.XDS", dir.join("SPOT.XDS"))?;
        Ok(PhaseOutcome::done())
    }
}

/// Hands the IDXREF geometry through unchanged; XDS refines it again
/// during integration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct XdsRefiner;

impl RefinerBackend for XdsRefiner {
    fn name(&self) -> &'static str {
        "xds"
    }

    fn prepare(&self, state: &mut RefinerState, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome> {
        let mut requests = Vec::new();
        for (&epoch, &key) in &state.indexers {
            let (upstream, _) = state.indexer(ctx, epoch)?;
            if !upstream.payload.contains("XPARM.XDS") {
                warn!(
                    "{}: {} indexer gave no XPARM.XDS, re-indexing with XDS",
                    ctx.core.label, upstream.backend
                );
                requests.push(UpstreamRequest::ReplaceIndexer {
                    key,
                    backend: "xds".to_string(),
                });
            }
        }
        Ok(PhaseOutcome::with_requests(requests))
    }

    fn refine(&self, state: &mut RefinerState, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome> {
        for &epoch in state.indexers.keys() {
            let (upstream, _) = state.indexer(ctx, epoch)?;
            let dir = ctx.working_dir().join(epoch.to_string());
            let mut copies = Vec::new();
            for name in ["XPARM.XDS", "SPOT.XDS"] {
                if let Some(source) = upstream.payload.file(name) {
                    copies.push((epoch_key(epoch, name), copy_into(source, &dir, name)?));
                }
            }
            for (key, copy) in copies {
                ctx.staged.insert_file(key, copy);
            }
        }
        state.adopt_indexer_result(ctx)?;
        Ok(PhaseOutcome::done())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct XdsIntegrater;

impl XdsIntegrater {
    fn refiner<'u>(&self, state: &IntegraterState, ctx: &'u PhaseContext<'_>) -> Result<&'u RefinerState> {
        let upstream = ctx.upstream(state.refiner)?;
        upstream
            .state
            .as_refiner()
            .ok_or_else(|| Error::InvalidArgument(format!("{} is not a refiner", upstream.label)))
    }

    fn base_input(&self, jobs: &str, state: &IntegraterState, ctx: &PhaseContext<'_>) -> Result<XdsInput> {
        let mut input = XdsInput::new(jobs, ctx.run.config.nproc);
        input.geometry(&state.frame, state.frame.beam_centre, state.frame.distance)?;
        input.data_range(state.images());
        input.resolution(state);
        Ok(input)
    }
}

impl IntegraterBackend for XdsIntegrater {
    fn name(&self) -> &'static str {
        "xds"
    }

    fn prepare(&self, state: &mut IntegraterState, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome> {
        let upstream = ctx.upstream(state.refiner)?;
        let xparm = upstream.require_file(&state.refined("XPARM.XDS"))?.to_path_buf();
        let dir = ctx.ensure_working_dir()?.to_path_buf();
        let copy = copy_into(&xparm, &dir, "XPARM.XDS")?;
        ctx.staged.insert_file("XPARM.XDS", copy);
        Ok(PhaseOutcome::done())
    }

    fn integrate(&self, state: &mut IntegraterState, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome> {
        let refiner = self.refiner(state, ctx)?;
        let mut input = self.base_input("DEFPIX INTEGRATE CORRECT", state, ctx)?;
        input.friedel(state.anomalous);
        if let (Some(lattice), Some(cell)) = (refiner.lattice, refiner.cell) {
            input.symmetry(lattice.spacegroup_number(), &cell);
        }
        if let Some(parameters) = state.program_parameters.get("xds") {
            for (name, value) in parameters {
                input.push(format!("{}={value}", name.to_uppercase()));
            }
        }
        run_xds(ctx, &input)?;

        let dir = ctx.working_dir().to_path_buf();
        let integrate = parse_integrate_lp(&read_lines(&dir.join("INTEGRATE.LP"))?);
        state.per_image_status = integrate.status();
        state.mosaic = integrate.mosaic();
        let learnt = state.program_parameters.entry("xds".to_string()).or_default();
        for (name, value) in integrate.suggested {
            learnt.entry(name.to_lowercase()).or_insert(value);
        }

        let correct = parse_correct_lp(&read_lines(&dir.join("CORRECT.LP"))?);
        state.cell = correct.cell;
        state.reflections = correct.reflections;
        state.batches = Some(state.images());
        if let Some(mosaic) = state.mosaic {
            info!(
                "{}: mosaic spread {:.3} < {:.3} < {:.3}",
                state.sweep_name, mosaic.min, mosaic.mean, mosaic.max
            );
        }

        ctx.publish_file("xds", "INTEGRATE.HKL", dir.join("INTEGRATE.HKL"))?;
        let raw = copy_into(&dir.join("XDS_ASCII.HKL"), &dir, "INTEGRATE_ASCII.HKL")?;
        ctx.publish_file("xds", "raw_intensities", raw)?;
        ctx.staged.insert_text("anomalous", state.anomalous.to_string());
        Ok(PhaseOutcome::done())
    }

    fn finish(&self, state: &mut IntegraterState, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome> {
        let dir = ctx.working_dir().to_path_buf();
        let integrated_anomalous = ctx
            .core
            .payload
            .get("anomalous")
            .and_then(|a| a.as_text())
            .map(|t| t == "true");
        let rerun = state.spacegroup_number.is_some()
            || state.reindex_operator.is_some()
            || integrated_anomalous != Some(state.anomalous);

        if rerun {
            let refiner = self.refiner(state, ctx)?;
            let spacegroup = state
                .spacegroup_number
                .or_else(|| refiner.lattice.map(|l| l.spacegroup_number()))
                .ok_or_else(|| Error::BadSpacegroup("no spacegroup for CORRECT".to_string()))?;
            let cell = state.cell.or(refiner.cell).ok_or_else(|| Error::PayloadMissing {
                stage: ctx.core.label.clone(),
                key: "cell".to_string(),
            })?;
            let mut input = self.base_input("CORRECT", state, ctx)?;
            input.friedel(state.anomalous);
            input.symmetry(spacegroup, &cell);
            if let Some(operator) = state.reindex_operator.as_deref().filter(|op| *op != "h,k,l") {
                let matrix = reindex_matrix(operator)?;
                let matrix: Vec<String> = matrix.iter().map(i32::to_string).collect();
                input.push(format!("REIDX={}", matrix.join(" ")));
            }
            run_xds(ctx, &input)?;

            let correct = parse_correct_lp(&read_lines(&dir.join("CORRECT.LP"))?);
            state.cell = correct.cell.or(state.cell);
            state.reflections = correct.reflections.or(state.reflections);
        }

        ctx.publish_file("xds", "intensities", dir.join("XDS_ASCII.HKL"))?;
        Ok(PhaseOutcome::done())
    }
}

pub fn indexer_from_settings(settings: &Value) -> Result<Backend> {
    let indexer: XdsIndexer = parse_settings(settings)?;
    Ok(Backend::Indexer(Arc::new(indexer)))
}

pub fn refiner_from_settings(_settings: &Value) -> Result<Backend> {
    Ok(Backend::Refiner(Arc::new(XdsRefiner)))
}

pub fn integrater_from_settings(_settings: &Value) -> Result<Backend> {
    Ok(Backend::Integrater(Arc::new(XdsIntegrater)))
}
