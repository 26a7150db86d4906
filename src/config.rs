//! Runtime settings.
//!
//! Deserialized from YAML with serde; every recognized option maps onto one
//! of the knobs the tracker or mapper actually reads. Unknown keys are
//! rejected so a typo in a calibration file fails loudly at startup.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid settings: {0}")]
    Validation(String),
}

/// Input sensor kind. Stereo and RGB-D share the same core behavior: both
/// populate per-keypoint depth and virtual right-eye disparity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Monocular,
    Stereo,
    Rgbd,
}

impl SensorKind {
    pub fn is_monocular(&self) -> bool {
        matches!(self, SensorKind::Monocular)
    }

    /// True when per-keypoint depth is available at ingest.
    pub fn has_depth(&self) -> bool {
        !self.is_monocular()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CameraSettings {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    #[serde(default)]
    pub k1: f64,
    #[serde(default)]
    pub k2: f64,
    #[serde(default)]
    pub p1: f64,
    #[serde(default)]
    pub p2: f64,
    #[serde(default)]
    pub k3: f64,
    /// Baseline × fx. Zero for monocular.
    #[serde(default)]
    pub bf: f64,
    /// Close/far separation in scene units (depths beyond this need two
    /// keyframes to be trusted).
    #[serde(default = "default_depth_threshold")]
    pub depth_threshold: f64,
    /// Raw-to-metric divisor for depth maps (e.g. 5000 for TUM PNGs).
    #[serde(default = "default_depth_map_factor")]
    pub depth_map_factor: f64,
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_fps")]
    pub fps: f64,
}

fn default_depth_threshold() -> f64 {
    40.0
}

fn default_depth_map_factor() -> f64 {
    1.0
}

fn default_fps() -> f64 {
    30.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub sensor: SensorKind,
    pub camera: CameraSettings,
    #[serde(default)]
    pub features: crate::features::ExtractorSettings,
    /// Use a planar fiducial for monocular initialization when a detector is
    /// registered.
    #[serde(default)]
    pub use_pattern: bool,
    /// Parsed for compatibility with existing configuration files; the
    /// tracker does not read it.
    #[serde(default)]
    pub align_image: bool,
}

impl Settings {
    pub fn from_yaml_str(text: &str) -> Result<Self, SettingsError> {
        let settings: Settings = serde_yaml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let c = &self.camera;
        if c.fx <= 0.0 || c.fy <= 0.0 {
            return Err(SettingsError::Validation(
                "focal lengths must be positive".into(),
            ));
        }
        if c.width == 0 || c.height == 0 {
            return Err(SettingsError::Validation(
                "image dimensions must be non-zero".into(),
            ));
        }
        if self.sensor.has_depth() && c.bf <= 0.0 {
            return Err(SettingsError::Validation(
                "stereo/RGB-D input requires a positive bf".into(),
            ));
        }
        if self.features.pyramid_levels == 0 || self.features.scale_factor <= 1.0 {
            return Err(SettingsError::Validation(
                "pyramid needs at least one level and a scale factor > 1".into(),
            ));
        }
        Ok(())
    }

    /// Keyframe cadence bounds derived from the frame rate: a keyframe may
    /// be inserted every frame, and must be considered after one second.
    pub fn min_frames(&self) -> u64 {
        0
    }

    pub fn max_frames(&self) -> u64 {
        self.camera.fps.round().max(1.0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RGBD_YAML: &str = r#"
sensor: rgbd
camera:
  fx: 517.3
  fy: 516.5
  cx: 318.6
  cy: 255.3
  k1: 0.2624
  k2: -0.9531
  p1: -0.0054
  p2: 0.0026
  k3: 1.1633
  bf: 40.0
  depth_threshold: 3.0
  depth_map_factor: 5000.0
  width: 640
  height: 480
  fps: 30.0
features:
  n_features: 1000
  pyramid_levels: 8
  scale_factor: 1.2
  fast_threshold: 20
  fast_min_threshold: 7
"#;

    #[test]
    fn parses_rgbd_settings() {
        let s = Settings::from_yaml_str(RGBD_YAML).unwrap();
        assert_eq!(s.sensor, SensorKind::Rgbd);
        assert!(s.sensor.has_depth());
        assert_eq!(s.camera.width, 640);
        assert_eq!(s.features.n_features, 1000);
        assert_eq!(s.max_frames(), 30);
        assert_eq!(s.min_frames(), 0);
        assert!(!s.use_pattern);
    }

    #[test]
    fn rejects_depth_sensor_without_baseline() {
        let text = RGBD_YAML.replace("bf: 40.0", "bf: 0.0");
        assert!(matches!(
            Settings::from_yaml_str(&text),
            Err(SettingsError::Validation(_))
        ));
    }

    #[test]
    fn monocular_does_not_need_bf() {
        let text = RGBD_YAML
            .replace("sensor: rgbd", "sensor: monocular")
            .replace("bf: 40.0", "bf: 0.0");
        let s = Settings::from_yaml_str(&text).unwrap();
        assert!(s.sensor.is_monocular());
    }

    #[test]
    fn unknown_keys_fail() {
        let text = format!("{}\nextra_option: 1\n", RGBD_YAML.trim_end());
        assert!(Settings::from_yaml_str(&text).is_err());
    }
}
