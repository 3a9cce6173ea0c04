//! Wavelengths of a crystal and the sweeps measured at each.

use super::sweep::XSweep;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "__id__", rename = "XWavelength")]
pub struct XWavelength {
    pub name: String,
    /// Nominal wavelength in Angstrom.
    pub wavelength: f64,
    pub f_prime: f64,
    pub f_double_prime: f64,
    /// User high resolution limit for the whole dataset.
    pub dmin: Option<f64>,
    #[serde(default)]
    sweeps: Vec<XSweep>,
    #[serde(skip)]
    pub(crate) crystal: String,
}

impl XWavelength {
    pub fn new(name: impl Into<String>, wavelength: f64) -> Self {
        Self {
            name: name.into(),
            wavelength,
            f_prime: 0.0,
            f_double_prime: 0.0,
            dmin: None,
            sweeps: Vec::new(),
            crystal: String::new(),
        }
    }

    pub fn with_scattering_factors(mut self, f_prime: f64, f_double_prime: f64) -> Self {
        self.f_prime = f_prime;
        self.f_double_prime = f_double_prime;
        self
    }

    pub fn crystal_name(&self) -> &str {
        &self.crystal
    }

    /// Measured at an absorption edge.
    pub fn is_anomalous(&self) -> bool {
        self.f_double_prime != 0.0
    }

    pub fn sweeps(&self) -> &[XSweep] {
        &self.sweeps
    }

    pub fn sweep(&self, name: &str) -> Result<&XSweep> {
        self.sweeps
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| Error::Schema(format!("no XSweep {name} in wavelength {}", self.name)))
    }

    pub fn sweep_mut(&mut self, name: &str) -> Result<&mut XSweep> {
        let wavelength = self.name.clone();
        self.sweeps
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| Error::Schema(format!("no XSweep {name} in wavelength {wavelength}")))
    }

    pub(crate) fn sweeps_mut(&mut self) -> impl Iterator<Item = &mut XSweep> {
        self.sweeps.iter_mut()
    }

    pub fn add_sweep(&mut self, mut sweep: XSweep) -> Result<()> {
        if self.sweeps.iter().any(|s| s.name == sweep.name) {
            return Err(Error::Schema(format!("XSweep with name {} already exists", sweep.name)));
        }
        sweep.wavelength = self.name.clone();
        sweep.crystal = self.crystal.clone();
        self.sweeps.push(sweep);
        Ok(())
    }

    /// Point every sweep back at this wavelength and `crystal`.
    pub(crate) fn relink(&mut self, crystal: &str) {
        self.crystal = crystal.to_string();
        for sweep in &mut self.sweeps {
            sweep.wavelength = self.name.clone();
            sweep.crystal = crystal.to_string();
        }
    }
}
