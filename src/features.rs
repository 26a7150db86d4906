//! Feature types and the extractor boundary.
//!
//! ORB extraction itself lives outside this crate: anything that can turn a
//! grayscale image into keypoints + 256-bit binary descriptors plugs in via
//! [`FeatureExtractor`]. Everything downstream (matching, triangulation,
//! optimization) works on the plain types defined here and never touches
//! pixels.

use serde::{Deserialize, Serialize};

/// Descriptor width in bytes (256 bits).
pub const DESCRIPTOR_BYTES: usize = 32;

/// A 256-bit binary feature descriptor. Distance is Hamming.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Descriptor(pub [u8; DESCRIPTOR_BYTES]);

impl Descriptor {
    pub fn zeros() -> Self {
        Self([0u8; DESCRIPTOR_BYTES])
    }

    /// Hamming distance: number of differing bits.
    #[inline]
    pub fn distance(&self, other: &Descriptor) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

impl std::fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Descriptor({:02x}{:02x}{:02x}…)", self.0[0], self.0[1], self.0[2])
    }
}

/// A salient 2D image location with pyramid scale and orientation.
#[derive(Debug, Clone, Copy)]
pub struct Keypoint {
    pub x: f64,
    pub y: f64,
    /// Pyramid octave the point was detected at.
    pub octave: usize,
    /// Orientation angle in degrees, [0, 360).
    pub angle: f64,
}

/// A grayscale intensity image. Only the extractor reads the pixels.
#[derive(Clone)]
pub struct GrayImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl GrayImage {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        assert_eq!(pixels.len(), (width * height) as usize);
        Self {
            width,
            height,
            pixels,
        }
    }
}

/// A registered depth image, in the depth sensor's raw units. The camera's
/// depth-map scale factor converts raw values to metric depth.
#[derive(Clone)]
pub struct DepthImage {
    pub width: u32,
    pub height: u32,
    pub depths: Vec<f32>,
}

impl DepthImage {
    pub fn new(width: u32, height: u32, depths: Vec<f32>) -> Self {
        assert_eq!(depths.len(), (width * height) as usize);
        Self {
            width,
            height,
            depths,
        }
    }

    /// Raw depth at a (rounded) pixel position, or `None` outside the image.
    pub fn at(&self, x: f64, y: f64) -> Option<f32> {
        let (xi, yi) = (x.round() as i64, y.round() as i64);
        if xi < 0 || yi < 0 || xi >= self.width as i64 || yi >= self.height as i64 {
            return None;
        }
        Some(self.depths[(yi as u32 * self.width + xi as u32) as usize])
    }
}

/// Per-level scale tables of the extraction pyramid.
///
/// Level 0 is the native resolution; level i is scaled by `scale_factor^i`.
/// σ² at a level is the squared scale, used to weight reprojection errors.
#[derive(Debug, Clone)]
pub struct ScalePyramid {
    pub levels: usize,
    pub scale_factor: f64,
    scale_factors: Vec<f64>,
    level_sigma2: Vec<f64>,
    inv_level_sigma2: Vec<f64>,
}

impl ScalePyramid {
    pub fn new(levels: usize, scale_factor: f64) -> Self {
        assert!(levels >= 1 && scale_factor > 1.0);
        let mut scale_factors = Vec::with_capacity(levels);
        let mut level_sigma2 = Vec::with_capacity(levels);
        let mut inv_level_sigma2 = Vec::with_capacity(levels);
        for i in 0..levels {
            let s = scale_factor.powi(i as i32);
            scale_factors.push(s);
            level_sigma2.push(s * s);
            inv_level_sigma2.push(1.0 / (s * s));
        }
        Self {
            levels,
            scale_factor,
            scale_factors,
            level_sigma2,
            inv_level_sigma2,
        }
    }

    #[inline]
    pub fn scale(&self, level: usize) -> f64 {
        self.scale_factors[level.min(self.levels - 1)]
    }

    #[inline]
    pub fn sigma2(&self, level: usize) -> f64 {
        self.level_sigma2[level.min(self.levels - 1)]
    }

    #[inline]
    pub fn inv_sigma2(&self, level: usize) -> f64 {
        self.inv_level_sigma2[level.min(self.levels - 1)]
    }

    pub fn max_scale(&self) -> f64 {
        self.scale_factors[self.levels - 1]
    }

    /// Scale-invariance distance bounds for a point observed at `level` from
    /// distance `dist`.
    pub fn distance_bounds(&self, dist: f64, level: usize) -> (f64, f64) {
        let level_scale = self.scale(level);
        let max_distance = dist * level_scale;
        let min_distance = max_distance / self.max_scale();
        (min_distance, max_distance)
    }

    /// Predict the pyramid level a point at distance `dist` would appear at,
    /// given its maximum scale-invariant distance.
    pub fn predict_level(&self, dist: f64, max_distance: f64) -> usize {
        if dist <= 0.0 || max_distance <= 0.0 {
            return 0;
        }
        let ratio = max_distance / dist;
        let level = (ratio.ln() / self.scale_factor.ln()).ceil();
        (level.max(0.0) as usize).min(self.levels - 1)
    }
}

/// Extractor configuration handed to implementations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractorSettings {
    pub n_features: usize,
    pub pyramid_levels: usize,
    pub scale_factor: f64,
    /// Initial FAST threshold.
    pub fast_threshold: u8,
    /// Rescue threshold used when a cell yields no corners.
    pub fast_min_threshold: u8,
}

impl Default for ExtractorSettings {
    fn default() -> Self {
        Self {
            n_features: 1000,
            pyramid_levels: 8,
            scale_factor: 1.2,
            fast_threshold: 20,
            fast_min_threshold: 7,
        }
    }
}

/// The external ORB boundary: keypoints and descriptors for one image.
pub trait FeatureExtractor: Send {
    /// The pyramid configuration the extractor was built with.
    fn pyramid(&self) -> &ScalePyramid;

    fn extract(&mut self, image: &GrayImage) -> Vec<(Keypoint, Descriptor)>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hamming_distance_counts_bits() {
        let a = Descriptor::zeros();
        let mut b = Descriptor::zeros();
        b.0[0] = 0b1010_1010;
        b.0[31] = 0xff;
        assert_eq!(a.distance(&b), 12);
        assert_eq!(b.distance(&b), 0);
    }

    #[test]
    fn pyramid_tables() {
        let pyr = ScalePyramid::new(8, 1.2);
        assert_eq!(pyr.scale(0), 1.0);
        assert!((pyr.scale(1) - 1.2).abs() < 1e-12);
        assert!((pyr.sigma2(2) - 1.2f64.powi(4)).abs() < 1e-9);
        assert!((pyr.inv_sigma2(2) * pyr.sigma2(2) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn level_prediction_is_monotone_in_distance() {
        let pyr = ScalePyramid::new(8, 1.2);
        let max_dist = 10.0;
        let near = pyr.predict_level(9.9, max_dist);
        let far = pyr.predict_level(2.0, max_dist);
        assert!(far >= near);
        assert!(far < pyr.levels);
    }
}
