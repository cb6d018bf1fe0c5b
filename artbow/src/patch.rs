//! Patch extraction.
//!
//! An image is cut into square patches of `patch_size` pixels per side and every
//! patch is flattened row by row (row, column, channel) into one vector of
//! `patch_size * patch_size * 3` components.

use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rng::DeterministicRng;

pub const DEFAULT_PATCH_SIZE: usize = 16;
pub const CHANNELS: usize = 3;

#[derive(Debug, Error, PartialEq)]
pub enum PatchError {
    #[error("image of {width}x{height} is smaller than a {patch_size}x{patch_size} patch")]
    ImageTooSmall {
        width: u32,
        height: u32,
        patch_size: usize,
    },

    #[error("coverage must be in (0, 1], got {0}")]
    InvalidCoverage(f64),

    #[error("patch size must be positive")]
    ZeroPatchSize,
}

/// How patches are taken from an image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PatchConfig {
    pub patch_size: usize,
    /// Fraction of all possible patch positions to visit.
    pub coverage: f64,
    /// Sample positions at random instead of sliding a strided window.
    pub random: bool,
    pub seed: u64,
}

impl PatchConfig {
    pub fn new(patch_size: usize, coverage: f64) -> Self {
        Self {
            patch_size,
            coverage,
            random: false,
            seed: 0,
        }
    }

    pub fn with_random(mut self, random: bool) -> Self {
        self.random = random;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Length of a flattened patch.
    pub fn dim(&self) -> usize {
        self.patch_size * self.patch_size * CHANNELS
    }

    pub fn validate(&self) -> Result<(), PatchError> {
        if self.patch_size == 0 {
            return Err(PatchError::ZeroPatchSize);
        }
        if !(self.coverage > 0.0 && self.coverage <= 1.0) {
            return Err(PatchError::InvalidCoverage(self.coverage));
        }
        Ok(())
    }
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self::new(DEFAULT_PATCH_SIZE, 1.0)
    }
}

/// A set of equally sized vectors stored back to back.
#[derive(Debug, Clone, PartialEq)]
pub struct Patches {
    dim: usize,
    data: Vec<f32>,
}

impl Patches {
    pub fn new(dim: usize) -> Self {
        Self::with_capacity(dim, 0)
    }

    pub fn with_capacity(dim: usize, capacity: usize) -> Self {
        assert!(dim > 0, "patch dimension must be positive");
        Self {
            dim,
            data: Vec::with_capacity(dim * capacity),
        }
    }

    pub(crate) fn from_raw(dim: usize, data: Vec<f32>) -> Self {
        assert!(dim > 0, "patch dimension must be positive");
        assert_eq!(data.len() % dim, 0);
        Self { dim, data }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.data.len() / self.dim
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get(&self, index: usize) -> &[f32] {
        &self.data[index * self.dim..][..self.dim]
    }

    pub fn iter(&self) -> std::slice::ChunksExact<'_, f32> {
        self.data.chunks_exact(self.dim)
    }

    pub fn push(&mut self, patch: &[f32]) {
        assert_eq!(patch.len(), self.dim);
        self.data.extend_from_slice(patch);
    }

    /// Moves all patches of `other` to the end of this set.
    pub fn append(&mut self, other: &mut Patches) {
        assert_eq!(self.dim, other.dim);
        self.data.append(&mut other.data);
    }
}

/// Extracts patches from `image` in row-major order of their upper left corners.
pub fn extract(image: &RgbImage, config: &PatchConfig) -> Result<Patches, PatchError> {
    config.validate()?;

    let size = config.patch_size;
    let (width, height) = image.dimensions();
    if (height as usize) < size || (width as usize) < size {
        return Err(PatchError::ImageTooSmall {
            width,
            height,
            patch_size: size,
        });
    }

    let rows = height as usize - size + 1;
    let columns = width as usize - size + 1;

    let positions = if config.random {
        random_positions(rows, columns, config.coverage, config.seed)
    } else {
        grid_positions(rows, columns, strides(config.coverage))
    };

    let mut patches = Patches::with_capacity(config.dim(), positions.len());
    for (y, x) in positions {
        copy_patch(image, y, x, size, &mut patches.data);
    }
    Ok(patches)
}

/// Integer strides `(stride_y, stride_x)` with `1 / (stride_y * stride_x) <= coverage`.
///
/// Equivalent to growing the vertical and horizontal stride alternately, starting
/// with the vertical one, until the visited fraction drops to the target, but
/// computed directly. The bound holds exactly in `f64`, also for coverages a
/// hair below a reciprocal such as `0.4999999999`.
pub fn strides(coverage: f64) -> (usize, usize) {
    // Slack absorbs representation error, e.g. 1.0 / (1.0 / 3.0).
    let needed = (1.0 / coverage - 1e-9).ceil().max(1.0);
    if !needed.is_finite() || needed > (usize::MAX / 2) as f64 {
        return (usize::MAX / 2, usize::MAX / 2);
    }
    let mut needed = needed as usize;
    if 1.0 / needed as f64 > coverage {
        needed += 1;
    }

    let mut side = (needed as f64).sqrt() as usize;
    // Fix up float rounding of the square root.
    while side * side > needed {
        side -= 1;
    }
    while (side + 1) * (side + 1) <= needed {
        side += 1;
    }

    if side * side >= needed {
        (side, side)
    } else if (side + 1) * side >= needed {
        (side + 1, side)
    } else {
        (side + 1, side + 1)
    }
}

fn grid_positions(rows: usize, columns: usize, (stride_y, stride_x): (usize, usize)) -> Vec<(usize, usize)> {
    let mut positions = Vec::with_capacity(rows.div_ceil(stride_y) * columns.div_ceil(stride_x));
    for y in (0..rows).step_by(stride_y) {
        for x in (0..columns).step_by(stride_x) {
            positions.push((y, x));
        }
    }
    positions
}

fn random_positions(rows: usize, columns: usize, coverage: f64, seed: u64) -> Vec<(usize, usize)> {
    let count = ((coverage * rows as f64 * columns as f64) as usize).max(1);
    let mut rng = DeterministicRng::new(seed);
    let mut positions: Vec<_> = (0..count)
        .map(|_| (rng.gen_index(rows), rng.gen_index(columns)))
        .collect();
    positions.sort_unstable();
    positions
}

fn copy_patch(image: &RgbImage, y: usize, x: usize, size: usize, out: &mut Vec<f32>) {
    let raw = image.as_raw();
    let row_len = image.width() as usize * CHANNELS;
    for row in y..y + size {
        let start = row * row_len + x * CHANNELS;
        out.extend(raw[start..start + size * CHANNELS].iter().map(|&v| f32::from(v)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{gradient_image, solid_image};

    #[test]
    fn patch_vectors_have_expected_length() {
        let image = gradient_image(40, 33);
        for random in [false, true] {
            let config = PatchConfig::new(16, 0.3).with_random(random);
            let patches = extract(&image, &config).unwrap();
            assert!(!patches.is_empty());
            assert!(patches.iter().all(|p| p.len() == 16 * 16 * 3));
        }
    }

    #[test]
    fn rejects_small_images() {
        let image = solid_image(15, 40, [1, 2, 3]);
        let result = extract(&image, &PatchConfig::new(16, 1.0));
        assert_eq!(
            result,
            Err(PatchError::ImageTooSmall {
                width: 15,
                height: 40,
                patch_size: 16
            })
        );
    }

    #[test]
    fn rejects_invalid_coverage() {
        let image = solid_image(16, 16, [0, 0, 0]);
        for coverage in [0.0, -0.5, 1.5, f64::NAN] {
            assert!(matches!(
                extract(&image, &PatchConfig::new(16, coverage)),
                Err(PatchError::InvalidCoverage(_))
            ));
        }
    }

    #[test]
    fn exact_size_image_yields_one_patch() {
        let image = gradient_image(16, 16);
        for coverage in [1.0, 0.5, 0.01, 1e-6] {
            for random in [false, true] {
                let config = PatchConfig::new(16, coverage).with_random(random);
                assert_eq!(extract(&image, &config).unwrap().len(), 1);
            }
        }
    }

    #[test]
    fn full_coverage_visits_every_position() {
        let image = gradient_image(20, 18);
        let patches = extract(&image, &PatchConfig::new(16, 1.0)).unwrap();
        assert_eq!(patches.len(), 3 * 5);
    }

    #[test]
    fn patches_are_flattened_row_major() {
        let image = gradient_image(4, 3);
        let patches = extract(&image, &PatchConfig::new(2, 1.0)).unwrap();
        // Positions: (0,0) (0,1) (0,2) (1,0) (1,1) (1,2).
        assert_eq!(patches.len(), 6);
        let second = patches.get(1);
        // Pixel (x=1, y=0) then (x=2, y=0), then the next row.
        assert_eq!(&second[..6], &[1.0, 0.0, 1.0, 2.0, 0.0, 2.0]);
        assert_eq!(&second[6..], &[1.0, 1.0, 2.0, 2.0, 1.0, 3.0]);
        let fourth = patches.get(3);
        assert_eq!(&fourth[..3], &[0.0, 1.0, 1.0]);
    }

    #[test]
    fn stride_sequence() {
        assert_eq!(strides(1.0), (1, 1));
        assert_eq!(strides(0.5), (2, 1));
        assert_eq!(strides(0.4), (2, 2));
        assert_eq!(strides(0.25), (2, 2));
        assert_eq!(strides(0.2), (3, 2));
        assert_eq!(strides(1.0 / 3.0), (2, 2));
        assert_eq!(strides(1.0 / 6.0), (3, 2));
        assert_eq!(strides(0.1), (4, 3));
        assert_eq!(strides(0.01), (10, 10));
    }

    #[test]
    fn strides_never_exceed_coverage_just_below_a_reciprocal() {
        assert_eq!(strides(0.4999999999), (2, 2));
        assert_eq!(strides(0.2499999999), (3, 2));
        for coverage in [0.4999999999, 0.2499999999, 1.0 / 3.0 - 1e-12, 0.1 - 1e-11] {
            let (sy, sx) = strides(coverage);
            assert!(1.0 / (sy * sx) as f64 <= coverage, "{coverage}: {sy}x{sx}");
        }
        assert_eq!(strides(0.5), (2, 1));
        assert_eq!(strides(1.0 / 3.0), (2, 2));
    }

    #[test]
    fn strides_stay_within_one_step_of_target() {
        let mut coverage = 1.0;
        while coverage > 1e-7 {
            let (sy, sx) = strides(coverage);
            let achieved = 1.0 / (sy * sx) as f64;
            assert!(achieved <= coverage, "{coverage}: {sy}x{sx}");
            assert!(sy == sx || sy == sx + 1);
            // One step back in the alternating sequence would exceed the target.
            let previous = if sy == sx { (sy, sx - 1) } else { (sy - 1, sx) };
            if previous.0 * previous.1 > 0 {
                assert!(1.0 / (previous.0 * previous.1) as f64 > coverage - 1e-9);
            }
            coverage *= 0.83;
        }
    }

    #[test]
    fn strided_window_matches_coverage() {
        let image = gradient_image(16 + 99, 16 + 99);
        let all = extract(&image, &PatchConfig::new(16, 1.0)).unwrap().len();
        let quarter = extract(&image, &PatchConfig::new(16, 0.25)).unwrap().len();
        assert_eq!(all, 100 * 100);
        assert_eq!(quarter, 50 * 50);
    }

    #[test]
    fn random_extraction_is_reproducible() {
        let image = gradient_image(64, 48);
        let config = PatchConfig::new(8, 0.05).with_random(true).with_seed(7);
        let first = extract(&image, &config).unwrap();
        let second = extract(&image, &config).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), (0.05 * 57.0 * 41.0) as usize);

        let other = extract(&image, &config.with_seed(8)).unwrap();
        assert_ne!(first, other);
    }

    #[test]
    fn random_patches_are_sorted_row_major() {
        let image = gradient_image(64, 48);
        let config = PatchConfig::new(4, 0.1).with_random(true).with_seed(3);
        let patches = extract(&image, &config).unwrap();
        // Upper left pixel encodes the position: red is x, green is y.
        let corners: Vec<(f32, f32)> = patches.iter().map(|p| (p[1], p[0])).collect();
        let mut sorted = corners.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(corners, sorted);
    }
}
