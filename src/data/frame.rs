//! Imageset description for one sweep.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

/// Detector description as far as the pipeline needs it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectorModel {
    pub name: String,
    /// Pixel size in mm (fast, slow).
    pub pixel_size: (f64, f64),
    /// Image size in pixels (fast, slow).
    pub image_size: (u32, u32),
}

impl Default for DetectorModel {
    fn default() -> Self {
        Self {
            name: "PILATUS".to_string(),
            pixel_size: (0.172, 0.172),
            image_size: (2463, 2527),
        }
    }
}

/// A single imageset: where the images live and the experimental geometry
/// they were recorded with.
///
/// Pure data. Nothing here knows about pipeline state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameProcessor {
    /// Image name template with a run of `#` standing for the image number.
    pub template: String,
    pub directory: PathBuf,
    /// First and last image, inclusive.
    pub image_range: (u32, u32),
    /// Wavelength in Angstrom.
    pub wavelength: f64,
    /// Crystal to detector distance in mm.
    pub distance: f64,
    /// Beam centre in mm (fast, slow).
    pub beam_centre: (f64, f64),
    /// Rotation start and width per image, in degrees.
    pub oscillation: (f64, f64),
    pub rotation_axis: [f64; 3],
    pub detector: DetectorModel,
    pub reversephi: bool,
    /// Exposure epoch per image number.
    #[serde(default, deserialize_with = "super::numeric_keys::deserialize")]
    pub epochs: BTreeMap<u32, f64>,
}

impl FrameProcessor {
    pub fn new(template: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        Self {
            template: template.into(),
            directory: directory.into(),
            image_range: (1, 1),
            wavelength: 1.0,
            distance: 200.0,
            beam_centre: (0.0, 0.0),
            oscillation: (0.0, 1.0),
            rotation_axis: [1.0, 0.0, 0.0],
            detector: DetectorModel::default(),
            reversephi: false,
            epochs: BTreeMap::new(),
        }
    }

    pub fn with_image_range(mut self, first: u32, last: u32) -> Self {
        self.image_range = (first, last);
        self
    }

    pub fn with_wavelength(mut self, wavelength: f64) -> Self {
        self.wavelength = wavelength;
        self
    }

    pub fn with_distance(mut self, distance: f64) -> Self {
        self.distance = distance;
        self
    }

    pub fn with_beam_centre(mut self, fast: f64, slow: f64) -> Self {
        self.beam_centre = (fast, slow);
        self
    }

    pub fn with_oscillation(mut self, start: f64, width: f64) -> Self {
        self.oscillation = (start, width);
        self
    }

    #[inline]
    pub fn images(&self) -> RangeInclusive<u32> {
        self.image_range.0..=self.image_range.1
    }

    #[inline]
    pub fn num_images(&self) -> u32 {
        if self.image_range.1 < self.image_range.0 {
            0
        } else {
            self.image_range.1 - self.image_range.0 + 1
        }
    }

    /// Total rotation covered by the image range, in degrees.
    pub fn oscillation_range(&self) -> f64 {
        self.oscillation.1 * f64::from(self.num_images())
    }

    /// Rotation angle at the start of `image`.
    pub fn phi_at(&self, image: u32) -> f64 {
        let offset = f64::from(image.saturating_sub(self.image_range.0));
        self.oscillation.0 + offset * self.oscillation.1
    }

    /// Epoch of `image`, falling back to the image number when no header
    /// timestamps were recorded.
    pub fn epoch_of(&self, image: u32) -> f64 {
        self.epochs
            .get(&image)
            .copied()
            .unwrap_or_else(|| f64::from(image))
    }

    /// Epoch of the first image, used to order sweeps.
    pub fn start_epoch(&self) -> f64 {
        self.epoch_of(self.image_range.0)
    }

    /// Expand the template for image number `image`.
    pub fn image_name(&self, image: u32) -> Result<String> {
        let (prefix, width, suffix) = split_template(&self.template)?;
        let number = format!("{image:0width$}");
        if number.len() > width {
            return Err(Error::InvalidArgument(format!(
                "image {image} does not fit template {}",
                self.template
            )));
        }
        Ok(format!("{prefix}{number}{suffix}"))
    }

    pub fn image_path(&self, image: u32) -> Result<PathBuf> {
        Ok(self.directory.join(self.image_name(image)?))
    }

    /// The template with its `#` run replaced by `?`, as XDS expects.
    pub fn xds_template(&self) -> Result<PathBuf> {
        let (prefix, width, suffix) = split_template(&self.template)?;
        let name = format!("{prefix}{}{suffix}", "?".repeat(width));
        Ok(self.directory.join(name))
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

/// Split a template into prefix, digit count and suffix around its last
/// run of `#` characters.
fn split_template(template: &str) -> Result<(&str, usize, &str)> {
    let end = template.rfind('#').ok_or_else(|| {
        Error::InvalidArgument(format!("template {template} has no # placeholder"))
    })?;
    let start = template[..=end]
        .rfind(|c| c != '#')
        .map(|i| i + 1)
        .unwrap_or(0);
    Ok((&template[..start], end + 1 - start, &template[end + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> FrameProcessor {
        FrameProcessor::new("insulin_1_####.cbf", "/data/insulin")
            .with_image_range(1, 90)
            .with_oscillation(10.0, 0.5)
    }

    #[test]
    fn test_image_name() {
        let frame = frame();
        assert_eq!(frame.image_name(7).unwrap(), "insulin_1_0007.cbf");
        assert_eq!(
            frame.image_path(90).unwrap(),
            PathBuf::from("/data/insulin/insulin_1_0090.cbf")
        );
        assert!(frame.image_name(10000).is_err());
    }

    #[test]
    fn test_template_without_placeholder() {
        let frame = FrameProcessor::new("image.cbf", "/data");
        assert!(frame.image_name(1).is_err());
    }

    #[test]
    fn test_xds_template() {
        assert_eq!(
            frame().xds_template().unwrap(),
            PathBuf::from("/data/insulin/insulin_1_????.cbf")
        );
    }

    #[test]
    fn test_range_geometry() {
        let frame = frame();
        assert_eq!(frame.num_images(), 90);
        assert_eq!(frame.oscillation_range(), 45.0);
        assert_eq!(frame.phi_at(1), 10.0);
        assert_eq!(frame.phi_at(3), 11.0);
    }

    #[test]
    fn test_epoch_fallback() {
        let mut frame = frame();
        assert_eq!(frame.epoch_of(5), 5.0);
        frame.epochs.insert(1, 1_600_000_000.5);
        assert_eq!(frame.start_epoch(), 1_600_000_000.5);
    }
}
