//! Physical samples: sweeps taken from the same crystal mount.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "__id__", rename = "XSample")]
pub struct XSample {
    pub name: String,
    /// Names of the sweeps recorded from this sample.
    #[serde(default)]
    sweeps: Vec<String>,
    #[serde(skip)]
    pub(crate) crystal: String,
}

impl XSample {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sweeps: Vec::new(),
            crystal: String::new(),
        }
    }

    pub fn crystal_name(&self) -> &str {
        &self.crystal
    }

    pub fn sweeps(&self) -> &[String] {
        &self.sweeps
    }

    pub(crate) fn add_sweep(&mut self, sweep: &str) -> Result<()> {
        if self.sweeps.iter().any(|s| s == sweep) {
            return Err(Error::Schema(format!(
                "XSweep {sweep} already belongs to sample {}",
                self.name
            )));
        }
        self.sweeps.push(sweep.to_string());
        Ok(())
    }
}
