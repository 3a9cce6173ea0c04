//! A crystal: its wavelengths, samples, symmetry and shared scaler.

use super::sample::XSample;
use super::sweep::XSweep;
use super::wavelength::XWavelength;
use crate::data::{Lattice, UnitCell};
use crate::error::{Error, Result};
use crate::stage::StageKey;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// User cells must satisfy their lattice's constraints to this precision.
const USER_CELL_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "__id__", rename = "XCrystal")]
pub struct XCrystal {
    pub name: String,
    /// User assigned lattice, passed to every indexer as a target.
    pub lattice: Option<Lattice>,
    pub cell: Option<UnitCell>,
    /// User assigned spacegroup, passed to the scaler.
    pub spacegroup: Option<String>,
    pub freer_file: Option<PathBuf>,
    pub reference_reflection_file: Option<PathBuf>,
    #[serde(default)]
    wavelengths: IndexMap<String, XWavelength>,
    #[serde(default)]
    samples: IndexMap<String, XSample>,
    pub(crate) scaler: Option<StageKey>,
    #[serde(skip)]
    pub(crate) project: String,
}

impl XCrystal {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lattice: None,
            cell: None,
            spacegroup: None,
            freer_file: None,
            reference_reflection_file: None,
            wavelengths: IndexMap::new(),
            samples: IndexMap::new(),
            scaler: None,
            project: String::new(),
        }
    }

    pub fn project_name(&self) -> &str {
        &self.project
    }

    pub fn scaler_key(&self) -> Option<StageKey> {
        self.scaler
    }

    /// Assign the lattice, and optionally the cell, every sweep of this
    /// crystal is indexed in.
    pub fn set_user_lattice(&mut self, lattice: Lattice, cell: Option<UnitCell>) -> Result<()> {
        if let Some(cell) = cell {
            if !cell.consistent_with(lattice, USER_CELL_TOLERANCE) {
                return Err(Error::CellInconsistent {
                    lattice: lattice.to_string(),
                    cell: cell.to_string(),
                });
            }
        }
        self.lattice = Some(lattice);
        self.cell = cell;
        Ok(())
    }

    pub fn set_user_cell(&mut self, cell: UnitCell) -> Result<()> {
        let Some(lattice) = self.lattice else {
            return Err(Error::Schema("cannot assign cell without lattice".into()));
        };
        self.set_user_lattice(lattice, Some(cell))
    }

    pub fn add_wavelength(&mut self, mut wavelength: XWavelength) -> Result<()> {
        if self.wavelengths.contains_key(&wavelength.name) {
            return Err(Error::Schema(format!(
                "XWavelength with name {} already exists",
                wavelength.name
            )));
        }
        wavelength.relink(&self.name);
        self.wavelengths.insert(wavelength.name.clone(), wavelength);
        Ok(())
    }

    pub fn add_sample(&mut self, mut sample: XSample) -> Result<()> {
        if self.samples.contains_key(&sample.name) {
            return Err(Error::Schema(format!("XSample with name {} already exists", sample.name)));
        }
        sample.crystal = self.name.clone();
        self.samples.insert(sample.name.clone(), sample);
        Ok(())
    }

    /// Add a sweep to `wavelength`, recording it against its sample if it
    /// names one. Sweep names are unique within the crystal.
    pub fn add_sweep(&mut self, wavelength: &str, sweep: XSweep) -> Result<()> {
        if self.sweeps().any(|s| s.name == sweep.name) {
            return Err(Error::Schema(format!("XSweep with name {} already exists", sweep.name)));
        }
        self.wavelength(wavelength)?;
        if let Some(sample) = &sweep.sample {
            self.samples
                .get_mut(sample)
                .ok_or_else(|| Error::Schema(format!("no XSample {sample} in crystal {}", self.name)))?
                .add_sweep(&sweep.name)?;
        }
        self.wavelength_mut(wavelength)?.add_sweep(sweep)
    }

    pub fn wavelength(&self, name: &str) -> Result<&XWavelength> {
        self.wavelengths
            .get(name)
            .ok_or_else(|| Error::Schema(format!("no XWavelength {name} in crystal {}", self.name)))
    }

    pub fn wavelength_mut(&mut self, name: &str) -> Result<&mut XWavelength> {
        let crystal = &self.name;
        self.wavelengths
            .get_mut(name)
            .ok_or_else(|| Error::Schema(format!("no XWavelength {name} in crystal {crystal}")))
    }

    pub fn wavelengths(&self) -> impl Iterator<Item = &XWavelength> {
        self.wavelengths.values()
    }

    pub fn sample(&self, name: &str) -> Result<&XSample> {
        self.samples
            .get(name)
            .ok_or_else(|| Error::Schema(format!("no XSample {name} in crystal {}", self.name)))
    }

    pub fn samples(&self) -> impl Iterator<Item = &XSample> {
        self.samples.values()
    }

    /// Every sweep, wavelength by wavelength.
    pub fn sweeps(&self) -> impl Iterator<Item = &XSweep> {
        self.wavelengths.values().flat_map(|w| w.sweeps().iter())
    }

    pub(crate) fn sweeps_mut(&mut self) -> impl Iterator<Item = &mut XSweep> {
        self.wavelengths.values_mut().flat_map(|w| w.sweeps_mut())
    }

    /// Anomalous signal is expected from an edge wavelength or from more
    /// than one wavelength.
    pub fn is_anomalous(&self) -> bool {
        self.wavelengths.len() > 1 || self.wavelengths.values().any(XWavelength::is_anomalous)
    }

    /// `<base>/<crystal>/scale`
    pub fn scale_dir(&self, base: &Path) -> PathBuf {
        base.join(&self.name).join("scale")
    }

    /// Restore every back-reference below this crystal.
    pub(crate) fn relink(&mut self, project: &str) -> Result<()> {
        self.project = project.to_string();
        for wavelength in self.wavelengths.values_mut() {
            wavelength.relink(&self.name);
        }
        for sample in self.samples.values_mut() {
            sample.crystal = self.name.clone();
        }
        for sweep in self.wavelengths.values().flat_map(|w| w.sweeps()) {
            if let Some(sample) = &sweep.sample {
                let listed = self.samples.get(sample).is_some_and(|s| s.sweeps().contains(&sweep.name));
                if !listed {
                    return Err(Error::Schema(format!(
                        "XSweep {} names sample {sample} which does not list it",
                        sweep.name
                    )));
                }
            }
        }
        Ok(())
    }
}
