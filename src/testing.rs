//! Scripted drivers and fixtures for exercising stages without the
//! crystallography programs installed.
//!
//! [`ScriptedDrivers`] records every job and fabricates the output files
//! and log records a real program would leave behind, closely enough for
//! the parsers to run on them.

use crate::config::Config;
use crate::context::RunContext;
use crate::data::{DatasetKey, FrameProcessor};
use crate::driver::{Driver, DriverCommon, DriverFactory, ExitOutcome};
use crate::error::Result;
use crate::schema::{XCrystal, XProject, XSample, XSweep, XWavelength};
use crate::stage::indexer::indexer_body;
use crate::stage::integrater::{integrater_body, IntegraterState};
use crate::stage::refiner::refiner_body;
use crate::stage::scaler::scaler_body;
use crate::stage::{BackendRegistry, StageBody, StageGraph, StageKey};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const DEFAULT_CELL: [f64; 6] = [78.0, 78.0, 37.1, 90.0, 90.0, 90.0];

/// Lattice characters IDXREF reports, lowest symmetry first.
const IDXREF_SOLUTIONS: [(&str, f64, [f64; 6]); 4] = [
    ("aP", 0.0, [78.1, 78.0, 37.1, 90.0, 90.1, 89.9]),
    ("mP", 0.4, [78.0, 37.1, 78.1, 90.0, 90.1, 90.0]),
    ("oP", 0.8, [78.0, 78.1, 37.1, 90.0, 90.0, 90.0]),
    ("tP", 1.2, [78.0, 78.0, 37.1, 90.0, 90.0, 90.0]),
];

/// One job as the program would have seen it.
#[derive(Debug, Clone)]
pub struct Call {
    pub program: String,
    pub command_line: Vec<String>,
    pub working_directory: PathBuf,
    pub input: Vec<String>,
}

#[derive(Default)]
struct Script {
    calls: Vec<Call>,
    failures: HashMap<String, (Vec<String>, i32)>,
    integrated_cells: VecDeque<[f64; 6]>,
}

/// Driver factory whose programs are simulated in-process.
#[derive(Clone, Default)]
pub struct ScriptedDrivers {
    script: Arc<Mutex<Script>>,
}

impl ScriptedDrivers {
    /// Every program succeeds with plausible output for a tetragonal
    /// crystal.
    pub fn standard() -> Self {
        Self::default()
    }

    /// Make every later run of `program` print `lines` and exit with
    /// `exit`, writing no files.
    pub fn fail(&self, program: &str, lines: &[&str], exit: i32) {
        let lines = lines.iter().map(|l| l.to_string()).collect();
        self.lock().failures.insert(program.to_string(), (lines, exit));
    }

    /// Cells CORRECT reports on its next runs, in order.
    pub fn set_integrated_cells(&self, cells: &[[f64; 6]]) {
        self.lock().integrated_cells = cells.iter().copied().collect();
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn count(&self, program: &str) -> usize {
        self.lock().calls.iter().filter(|c| c.program == program).count()
    }

    /// Runs of `program` in a working directory with a component named
    /// `component`.
    pub fn count_in(&self, program: &str, component: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.program == program)
            .filter(|c| c.working_directory.components().any(|p| p.as_os_str() == component))
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn respond(&self, call: &Call) -> Result<(Vec<String>, ExitOutcome)> {
        let failure = self.lock().failures.get(&call.program).cloned();
        if let Some((lines, exit)) = failure {
            return Ok((lines, ExitOutcome::code(exit)));
        }
        create_named_outputs(call)?;
        let output = match call.program.as_str() {
            "xds_par" | "xds" => self.xds(call)?,
            "dials.refine_bravais_settings" => bravais_settings(call)?,
            "dials.refine" => vec!["    Unit cell: (78.02, 78.02, 37.11, 90.00, 90.00, 90.00)".to_string()],
            "dials.integrate" => dials_integrate(),
            "dials.export" => dials_export(call)?,
            "pointless" => pointless(),
            "aimless" => self.aimless(call)?,
            "xscale_par" | "xscale" => xscale(call)?,
            "dials.cosym" => dials_cosym(),
            "dials.scale" => dials_scale(),
            "mtz2sca" => mtz2sca(call)?,
            _ => Vec::new(),
        };
        Ok((output, ExitOutcome::success()))
    }

    fn xds(&self, call: &Call) -> Result<Vec<String>> {
        let dir = &call.working_directory;
        let input = std::fs::read_to_string(dir.join("XDS.INP"))?;
        let record = |name: &str| {
            input
                .lines()
                .find_map(|l| l.strip_prefix(name))
                .unwrap_or_default()
                .to_string()
        };
        let jobs = record("JOB=");
        let range: Vec<u32> = record("DATA_RANGE=")
            .split_whitespace()
            .filter_map(|t| t.parse().ok())
            .collect();
        let (first, last) = match range[..] {
            [first, last] => (first, last),
            _ => (1, 1),
        };

        if jobs.contains("IDXREF") {
            write(dir.join("IDXREF.LP"), &idxref_lp())?;
            write(dir.join("XPARM.XDS"), "XPARM\n")?;
            write(dir.join("SPOT.XDS"), "SPOT\n")?;
        }
        if jobs.contains("INTEGRATE") {
            write(dir.join("INTEGRATE.LP"), &integrate_lp(first, last))?;
            write(dir.join("INTEGRATE.HKL"), "INTEGRATE\n")?;
        }
        if jobs.contains("CORRECT") {
            let cell = self.lock().integrated_cells.pop_front().unwrap_or(DEFAULT_CELL);
            let cell: Vec<String> = cell.iter().map(|c| format!("{c:.3}")).collect();
            let text = format!(
                "    52341 REFLECTIONS ACCEPTED\n UNIT CELL PARAMETERS  {}\n",
                cell.join("  ")
            );
            write(dir.join("CORRECT.LP"), &text)?;
            write(dir.join("XDS_ASCII.HKL"), "XDS_ASCII\n")?;
        }
        Ok(vec![format!(" ***** {jobs} *****")])
    }

    fn aimless(&self, call: &Call) -> Result<Vec<String>> {
        if let Some(hklout) = argument_after(&call.command_line, "hklout") {
            let mtz = Path::new(hklout);
            let stem = mtz.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
            for suffix in ["_unmerged.mtz", ".sca", "_unmerged.sca"] {
                write(mtz.with_file_name(format!("{stem}{suffix}")), "scaled\n")?;
            }
        }

        // Dataset names come from the sorting job in the same directory.
        let mut datasets: Vec<(String, String, String)> = Vec::new();
        let sorting = self
            .lock()
            .calls
            .iter()
            .rev()
            .find(|c| c.program == "pointless" && c.working_directory == call.working_directory)
            .map(|c| c.input.clone())
            .unwrap_or_default();
        for record in sorting {
            let tokens: Vec<&str> = record.split_whitespace().collect();
            if let ["name", "project", p, "crystal", x, "dataset", d] = tokens[..] {
                let dataset = (p.to_string(), x.to_string(), d.to_string());
                if !datasets.contains(&dataset) {
                    datasets.push(dataset);
                }
            }
        }
        if datasets.is_empty() {
            datasets.push(("AUTOMATIC".into(), "DEFAULT".into(), "NATIVE".into()));
        }

        let mut output = vec![" Average unit cell:    78.01   78.01   37.12    90.00   90.00   90.00".to_string()];
        for (p, x, d) in datasets {
            output.push(format!(" Summary data for        Project: {p} Crystal: {x} Dataset: {d}"));
            output.push(String::new());
            output.push("                                           Overall  InnerShell  OuterShell".to_string());
            for record in [
                "Low resolution limit                       39.02     39.02      1.81",
                "High resolution limit                       1.78      4.83      1.78",
                "Rmerge  (all I+ and I-)                    0.058     0.029     0.527",
                "Total number of observations              192343     10002      9034",
                "Total number unique                        24932      1300      1210",
                "Mean((I)/sd(I))                             20.1      51.2       3.1",
                "Mn(I) half-set correlation CC(1/2)         0.999     0.999     0.843",
                "Completeness                                99.8      99.1      99.9",
                "Multiplicity                                 7.7       7.7       7.5",
                "Anomalous completeness                      99.6      99.9      99.3",
                "Anomalous multiplicity                       4.1       4.3       3.9",
            ] {
                output.push(record.to_string());
            }
        }
        Ok(output)
    }
}

impl DriverFactory for ScriptedDrivers {
    fn create(&self, executable: &str) -> Result<Box<dyn Driver>> {
        Ok(Box::new(ScriptedDriver {
            common: DriverCommon::new(executable, PathBuf::from(format!("/scripted/{executable}"))),
            drivers: self.clone(),
            started: false,
        }))
    }
}

struct ScriptedDriver {
    common: DriverCommon,
    drivers: ScriptedDrivers,
    started: bool,
}

impl Driver for ScriptedDriver {
    fn common(&self) -> &DriverCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut DriverCommon {
        &mut self.common
    }

    fn start(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.common.working_directory)?;
        self.common.mark_started();
        self.started = true;
        Ok(())
    }

    fn close_wait(&mut self) -> Result<()> {
        if !self.started {
            return Err(crate::error::ToolError::Protocol(format!("{} was never started", self.common.executable)).into());
        }
        let call = Call {
            program: self.common.task_name(),
            command_line: self.common.command_line.clone(),
            working_directory: self.common.working_directory.clone(),
            input: self.common.input.clone(),
        };
        let (output, status) = self.drivers.respond(&call)?;
        self.drivers.lock().calls.push(call);
        self.common.mark_finished(output, status)
    }
}

fn write(path: impl AsRef<Path>, text: &str) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, text)?;
    Ok(())
}

fn argument_after<'c>(command_line: &'c [String], keyword: &str) -> Option<&'c str> {
    let position = command_line.iter().position(|t| t == keyword)?;
    command_line.get(position + 1).map(String::as_str)
}

/// Create every file named by an output keyword on the command line.
fn create_named_outputs(call: &Call) -> Result<()> {
    let tokens = &call.command_line;
    for (i, token) in tokens.iter().enumerate() {
        let named = match token.split_once('=') {
            Some((key, value)) if key.starts_with("output.") && key != "output.prefix" => Some(value),
            Some((key, value)) if key.ends_with(".hklout") => Some(value),
            _ => None,
        };
        let following = matches!(token.as_str(), "hklout" | "-hklout")
            .then(|| tokens.get(i + 1).map(String::as_str))
            .flatten();
        if let Some(path) = named.or(following) {
            write(path, &format!("{}\n", call.program))?;
        }
    }
    Ok(())
}

fn idxref_lp() -> String {
    let mut text = String::from(
        " DETECTOR COORDINATES (PIXELS) OF DIRECT BEAM    1231.50   1263.20\n \
         CRYSTAL TO DETECTOR DISTANCE (mm)       200.15\n \
         STANDARD DEVIATION OF SPINDLE POSITION (DEGREES)    0.11\n\n",
    );
    for (i, (lattice, penalty, cell)) in IDXREF_SOLUTIONS.iter().enumerate() {
        let cell: Vec<String> = cell.iter().map(|c| format!("{c:.1}")).collect();
        text.push_str(&format!(
            " *  {:>2}        {lattice}        {penalty:>5.1}      {}    1  0  0  0\n",
            44 - i * 10,
            cell.join("  ")
        ));
    }
    text
}

fn integrate_lp(first: u32, last: u32) -> String {
    let mut text = format!(" PROCESSING OF IMAGES {first:>8} ... {last:>7}\n");
    text.push_str(" IMAGE IER  SCALE     NBKG NOVL NEWALD NSTRONG  NREJ   SIGMAB   SIGMAR\n");
    for image in first..=last {
        text.push_str(&format!(
            "{image:>6}   0  1.000   1000000    0   2000     800     0  0.01973  0.10035\n"
        ));
    }
    text.push_str("\n CRYSTAL MOSAICITY (DEGREES)     0.123\n");
    text.push_str(" STANDARD DEVIATION OF SPOT    POSITION (PIXELS)     0.45\n");
    text.push_str(" BEAM_DIVERGENCE=   0.354  BEAM_DIVERGENCE_E.S.D.=   0.035\n");
    text.push_str(" REFLECTING_RANGE=   0.214  REFLECTING_RANGE_E.S.D.=   0.030\n");
    text
}

fn bravais_settings(call: &Call) -> Result<Vec<String>> {
    let prefix = call
        .command_line
        .iter()
        .find_map(|t| t.strip_prefix("output.prefix="))
        .unwrap_or_default();
    let dir = &call.working_directory;
    let mut summary = serde_json::Map::new();
    for (i, (lattice, penalty, cell)) in IDXREF_SOLUTIONS.iter().enumerate() {
        let id = i + 1;
        summary.insert(
            id.to_string(),
            serde_json::json!({
                "bravais": lattice,
                "unit_cell": cell,
                "max_angular_difference": penalty,
                "recommended": true,
                "cb_op": "a,b,c",
            }),
        );
        write(dir.join(format!("{prefix}bravais_setting_{id}.expt")), "setting\n")?;
    }
    write(
        dir.join(format!("{prefix}bravais_summary.json")),
        &Value::Object(summary).to_string(),
    )?;
    Ok(Vec::new())
}

fn dials_integrate() -> Vec<String> {
    let mut output = vec![
        " Summary vs image number".to_string(),
        " | Image | # full | # part | # over | # ice | # sum | # prf | <Ibg> |".to_string(),
    ];
    for image in 1..=3 {
        output.push(format!(" | {image:>5} |   1200 |     50 |      0 |     0 |  1250 |  1200 |  0.51 |"));
    }
    output.push(String::new());
    output.push("Saving 48213 reflections to integrated.refl".to_string());
    output
}

fn dials_export(call: &Call) -> Result<Vec<String>> {
    if let Some(dir) = call.command_line.iter().find_map(|t| t.strip_prefix("xds.directory=")) {
        write(Path::new(dir).join("XPARM.XDS"), "XPARM\n")?;
        write(Path::new(dir).join("XDS.INP"), "JOB=XYCORR INIT COLSPOT IDXREF DEFPIX INTEGRATE CORRECT\n")?;
    }
    Ok(Vec::new())
}

fn pointless() -> Vec<String> {
    [
        "   Spacegroup         TotProb SysAbsProb     Reindex         Conditions",
        "   <P 41 21 2>  (92)    0.950  0.961      h,k,l",
        "   <P 43 21 2>  (96)    0.950  0.961      h,k,l",
        "Best Solution:    space group P 41 21 2",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// XSCALE writes every `OUTPUT_FILE` of `XSCALE.INP` and reports the
/// same statistics for each.
fn xscale(call: &Call) -> Result<Vec<String>> {
    let dir = &call.working_directory;
    let input = std::fs::read_to_string(dir.join("XSCALE.INP"))?;
    let mut text = String::from(" UNIT CELL PARAMETERS     78.010    78.010    37.120  90.000  90.000  90.000\n");
    for name in input.lines().filter_map(|l| l.strip_prefix("OUTPUT_FILE=")) {
        write(dir.join(name), "XSCALE\n")?;
        text.push_str(&format!("\n STATISTICS OF SCALED OUTPUT DATA SET : {name}\n\n"));
        text.push_str(" SUBSET OF INTENSITY DATA WITH SIGNAL/NOISE >= -3.0 AS FUNCTION OF RESOLUTION\n");
        for row in [
            "     4.83       10000    1250      1262       99.1%       2.9%      3.1%    10000   51.20     3.1%    99.9*    12    1.123    1100",
            "     1.78        9000    1200      1201       99.9%      52.7%     55.0%     9000    3.10    56.0%    84.3*    -2    0.789    1000",
            "    total      192000   24000     24050       99.8%       5.8%      6.1%   192000   20.10     6.2%    99.9*     5    0.901   21000",
        ] {
            text.push_str(row);
            text.push('\n');
        }
    }
    write(dir.join("XSCALE.LP"), &text)?;
    Ok(vec![" ***** XSCALE *****".to_string()])
}

fn dials_cosym() -> Vec<String> {
    vec![
        "Best solution: P 41 21 2".to_string(),
        "Unit cell: (78.02, 78.02, 37.11, 90.00, 90.00, 90.00)".to_string(),
    ]
}

fn dials_scale() -> Vec<String> {
    [
        "            -------------Summary of merging statistics--------------",
        "",
        "                                            Suggested   Overall    Low     High",
        "High resolution limit                           1.78       1.78    4.83    1.78",
        "Low resolution limit                           39.02      39.02   39.02    1.81",
        "Completeness                                   99.8       99.8    99.1    99.9",
        "Multiplicity                                    7.7        7.7     7.7     7.5",
        "I/sigma                                        20.1       20.1    51.2     3.1",
        "CC half                                        0.999     0.999   0.999   0.843",
        "Total observations                            192343    192343   10002    9034",
        "Total unique                                   24932     24932    1300    1210",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// `mtz2sca in.mtz out.sca`
fn mtz2sca(call: &Call) -> Result<Vec<String>> {
    if let Some(out) = call.command_line.last() {
        write(out, "mtz2sca\n")?;
    }
    Ok(Vec::new())
}

/// A test context whose programs are scripted.
pub fn run_context(dir: &Path) -> (RunContext, Arc<ScriptedDrivers>) {
    let drivers = Arc::new(ScriptedDrivers::standard());
    (run_context_with(dir, drivers.clone()), drivers)
}

pub fn run_context_with(dir: &Path, drivers: Arc<ScriptedDrivers>) -> RunContext {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut config = Config {
        nproc: 1,
        ..Config::default()
    };
    config.backends.scaler = Some("ccp4a".into());
    RunContext::new(config)
        .with_base_dir(dir)
        .with_drivers(drivers)
        .with_environment("CCP4", "/opt/ccp4")
}

/// A 90 image sweep of 1 degree images.
pub fn frame(dir: &Path) -> FrameProcessor {
    FrameProcessor::new("insulin_1_####.cbf", dir.join("images"))
        .with_image_range(1, 90)
        .with_oscillation(0.0, 1.0)
        .with_beam_centre(211.8, 217.3)
        .with_distance(200.0)
        .with_wavelength(0.9795)
}

/// Stages of one sweep.
#[derive(Debug, Clone, Copy)]
pub struct Chain {
    pub indexer: StageKey,
    pub refiner: StageKey,
    pub integrater: StageKey,
}

/// Indexer, refiner and integrater for one sweep on the named backends,
/// working in `index`, `refine` and `integrate` under `dir`.
pub fn chain(dir: &Path, indexer: &str, refiner: &str, integrater: &str) -> (StageGraph, Chain) {
    let registry = BackendRegistry::new_with_defaults();
    let mut graph = StageGraph::new();
    let frame = frame(dir);
    let epoch = frame.start_epoch() as u64;

    let backend = registry.indexer(indexer, &Value::Null).unwrap();
    let indexer = graph.insert(
        "SWEEP1 indexer",
        dir.join("index"),
        indexer_body(backend, "SWEEP1", frame.clone()),
    );
    let backend = registry.refiner(refiner, &Value::Null).unwrap();
    let refiner = graph.insert(
        "SWEEP1 refiner",
        dir.join("refine"),
        refiner_body(backend, &[(epoch, indexer)]).unwrap(),
    );
    let backend = registry.integrater(integrater, &Value::Null).unwrap();
    let mut state = IntegraterState::new("SWEEP1", frame, refiner, epoch);
    state.set_project_info(DatasetKey::new("AUTOMATIC", "DEFAULT", "NATIVE"));
    let integrater = graph.insert("SWEEP1 integrater", dir.join("integrate"), integrater_body(backend, state));

    (
        graph,
        Chain {
            indexer,
            refiner,
            integrater,
        },
    )
}

pub fn xds_chain(dir: &Path) -> (StageGraph, Chain) {
    chain(dir, "xds", "xds", "xds")
}

/// A scaler over `integraters`, working in `scale` under `dir`.
pub fn attach_scaler(graph: &mut StageGraph, run: &RunContext, dir: &Path, integraters: &[StageKey]) -> StageKey {
    let backend = run.registry().scaler(run.config.scaler_backend(), &Value::Null).unwrap();
    let mut body = scaler_body(backend);
    if let StageBody::Scaler(stage) = &mut body {
        for key in integraters {
            let epoch = graph.node(*key).unwrap().body.as_integrater().unwrap().state.epoch;
            stage.state.add_integrater(epoch, *key).unwrap();
        }
    }
    graph.insert("DEFAULT scaler", dir.join("scale"), body)
}

/// Project AUTOMATIC with crystal XTAL, one NATIVE wavelength and a sweep
/// of 90 images per name in `sweeps`, recorded from sample X1.
pub fn project(dir: &Path, sweeps: &[&str]) -> XProject {
    let mut crystal = XCrystal::new("XTAL");
    crystal.add_wavelength(XWavelength::new("NATIVE", 0.9795)).unwrap();
    crystal.add_sample(XSample::new("X1")).unwrap();
    for (i, name) in sweeps.iter().enumerate() {
        let first = 1 + 90 * i as u32;
        let frame = frame(dir).with_image_range(first, first + 89);
        let mut sweep = XSweep::new(*name, frame).unwrap();
        sweep.sample = Some("X1".into());
        crystal.add_sweep("NATIVE", sweep).unwrap();
    }
    let mut project = XProject::new("AUTOMATIC", dir);
    project.add_crystal(crystal).unwrap();
    project
}
