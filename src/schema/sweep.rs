//! One contiguous sweep of images.

use crate::data::FrameProcessor;
use crate::error::{Error, Result};
use crate::stage::StageKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Names locating a sweep inside a project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SweepPath {
    pub crystal: String,
    pub wavelength: String,
    pub sweep: String,
}

impl SweepPath {
    pub fn new(crystal: impl Into<String>, wavelength: impl Into<String>, sweep: impl Into<String>) -> Self {
        Self {
            crystal: crystal.into(),
            wavelength: wavelength.into(),
            sweep: sweep.into(),
        }
    }
}

impl fmt::Display for SweepPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.crystal, self.wavelength, self.sweep)
    }
}

/// Stages created for a sweep so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepStages {
    pub indexer: Option<StageKey>,
    pub refiner: Option<StageKey>,
    pub integrater: Option<StageKey>,
}

impl SweepStages {
    pub fn keys(&self) -> Vec<StageKey> {
        [self.indexer, self.refiner, self.integrater]
            .into_iter()
            .flatten()
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "__id__", rename = "XSweep")]
pub struct XSweep {
    pub name: String,
    pub frame: FrameProcessor,
    pub sample: Option<String>,
    /// User high resolution limit, applied to the integrater.
    pub resolution_high: Option<f64>,
    #[serde(default)]
    pub stages: SweepStages,
    #[serde(skip)]
    pub(crate) wavelength: String,
    #[serde(skip)]
    pub(crate) crystal: String,
}

impl XSweep {
    pub fn new(name: impl Into<String>, frame: FrameProcessor) -> Result<Self> {
        let name = name.into();
        check_image_range(&name, frame.image_range)?;
        if !frame.template.contains('#') {
            return Err(Error::InvalidArgument(format!(
                "sweep {name}: template {} has no image number field",
                frame.template
            )));
        }
        Ok(Self {
            name,
            frame,
            sample: None,
            resolution_high: None,
            stages: SweepStages::default(),
            wavelength: String::new(),
            crystal: String::new(),
        })
    }

    pub fn with_resolution_high(mut self, dmin: f64) -> Self {
        self.resolution_high = Some(dmin);
        self
    }

    pub fn wavelength_name(&self) -> &str {
        &self.wavelength
    }

    pub fn crystal_name(&self) -> &str {
        &self.crystal
    }

    pub fn path(&self) -> SweepPath {
        SweepPath::new(&self.crystal, &self.wavelength, &self.name)
    }

    pub fn image_range(&self) -> (u32, u32) {
        self.frame.image_range
    }

    /// Epoch keying this sweep in its refiner and scaler.
    pub fn epoch(&self) -> u64 {
        self.frame.start_epoch() as u64
    }

    /// `<base>/<crystal>/<wavelength>/<sweep>`
    pub fn working_dir(&self, base: &Path) -> PathBuf {
        base.join(&self.crystal).join(&self.wavelength).join(&self.name)
    }
}

pub(crate) fn check_image_range(name: &str, (first, last): (u32, u32)) -> Result<()> {
    if first == 0 || first > last {
        return Err(Error::InvalidArgument(format!(
            "sweep {name}: invalid image range {first}-{last}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> FrameProcessor {
        FrameProcessor::new("lyso_1_####.cbf", "/data").with_image_range(1, 90)
    }

    #[test]
    fn test_new_sweep_checks_images() {
        assert!(XSweep::new("SWEEP1", frame()).is_ok());
        assert!(XSweep::new("SWEEP1", frame().with_image_range(10, 5)).is_err());
        let err = XSweep::new("SWEEP1", FrameProcessor::new("lyso.cbf", "/data")).unwrap_err();
        assert!(err.to_string().contains("no image number field"));
    }

    #[test]
    fn test_working_dir() {
        let mut sweep = XSweep::new("SWEEP1", frame()).unwrap();
        sweep.crystal = "XTAL".into();
        sweep.wavelength = "NATIVE".into();
        assert_eq!(
            sweep.working_dir(Path::new("/work")),
            PathBuf::from("/work/XTAL/NATIVE/SWEEP1")
        );
        assert_eq!(sweep.path().to_string(), "XTAL/NATIVE/SWEEP1");
    }
}
