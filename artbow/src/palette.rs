//! Palette (codebook) construction.
//!
//! Palettes are built with k-means: k-means++ seeding followed by Lloyd
//! iterations. Every random choice comes from a generator seeded by the
//! builder, so the same inputs always give the same palette.

use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::patch::{extract, PatchConfig, PatchError, Patches};
use crate::progress::Progress;
use crate::quantize::{nearest, squared_distance};
use crate::rng::DeterministicRng;

pub const DEFAULT_KMEANS_ITERATIONS: usize = 20;

#[derive(Debug, Error, PartialEq)]
pub enum PaletteError {
    #[error("cannot build a palette from an empty input")]
    EmptyInput,

    #[error("palette #{index} has dimension {found}, expected {expected}")]
    DimensionMismatch {
        index: usize,
        expected: usize,
        found: usize,
    },

    #[error("palette data of length {len} is not a multiple of dimension {dim}")]
    InvalidLayout { dim: usize, len: usize },

    #[error("palette size must be positive")]
    ZeroSize,

    #[error(transparent)]
    Patch(#[from] PatchError),
}

/// An ordered, immutable set of patch vectors addressed by index.
///
/// A palette always holds at least one entry of a positive dimension; this
/// also holds for deserialized palettes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawPalette")]
pub struct Palette {
    dim: usize,
    entries: Vec<f32>,
}

#[derive(Deserialize)]
struct RawPalette {
    dim: usize,
    entries: Vec<f32>,
}

impl TryFrom<RawPalette> for Palette {
    type Error = PaletteError;

    fn try_from(raw: RawPalette) -> Result<Self, Self::Error> {
        Palette::from_entries(raw.dim, raw.entries)
    }
}

impl Palette {
    /// Wraps `entries`, a row-major matrix with `dim` columns.
    pub fn from_entries(dim: usize, entries: Vec<f32>) -> Result<Self, PaletteError> {
        if dim == 0 || entries.len() % dim != 0 {
            return Err(PaletteError::InvalidLayout {
                dim,
                len: entries.len(),
            });
        }
        if entries.is_empty() {
            return Err(PaletteError::EmptyInput);
        }
        Ok(Self { dim, entries })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.entries.len() / self.dim
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, index: usize) -> &[f32] {
        &self.entries[index * self.dim..][..self.dim]
    }

    pub fn iter(&self) -> std::slice::ChunksExact<'_, f32> {
        self.entries.chunks_exact(self.dim)
    }

    pub(crate) fn as_slice(&self) -> &[f32] {
        &self.entries
    }
}

/// Builds palettes of a fixed size.
#[derive(Debug, Clone)]
pub struct PaletteBuilder {
    size: usize,
    iterations: usize,
    seed: u64,
}

impl PaletteBuilder {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            iterations: DEFAULT_KMEANS_ITERATIONS,
            seed: 0,
        }
    }

    /// Upper bound on Lloyd iterations.
    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Derives `size` representative vectors from `patches`.
    pub fn generate(&self, patches: &Patches, progress: &mut dyn Progress) -> Result<Palette, PaletteError> {
        if self.size == 0 {
            return Err(PaletteError::ZeroSize);
        }
        if patches.is_empty() {
            return Err(PaletteError::EmptyInput);
        }
        debug!(patches = patches.len(), size = self.size, "generating palette");
        let entries = self.kmeans(patches, progress);
        Palette::from_entries(patches.dim(), entries)
    }

    /// Extracts patches from every image of a batch and generates a palette from all of them.
    pub fn generate_from_images(
        &self,
        images: &[RgbImage],
        patch_config: &PatchConfig,
        progress: &mut dyn Progress,
    ) -> Result<Palette, PaletteError> {
        let mut patches = Patches::new(patch_config.dim());
        for image in images {
            let mut image_patches = extract(image, patch_config)?;
            patches.append(&mut image_patches);
        }
        self.generate(&patches, progress)
    }

    /// Combines several palettes into a single one of this builder's size.
    ///
    /// Entries of all inputs are pooled and clustered again, so the result
    /// keeps representatives of every input instead of growing without bound.
    pub fn merge(&self, palettes: &[Palette], progress: &mut dyn Progress) -> Result<Palette, PaletteError> {
        let first = palettes.first().ok_or(PaletteError::EmptyInput)?;
        let dim = first.dim();
        for (index, palette) in palettes.iter().enumerate() {
            if palette.dim() != dim {
                return Err(PaletteError::DimensionMismatch {
                    index,
                    expected: dim,
                    found: palette.dim(),
                });
            }
        }

        let pooled = palettes
            .iter()
            .flat_map(|palette| palette.as_slice().iter().copied())
            .collect();
        let pooled = Patches::from_raw(dim, pooled);
        debug!(inputs = palettes.len(), entries = pooled.len(), size = self.size, "merging palettes");
        self.generate(&pooled, progress)
    }

    fn kmeans(&self, points: &Patches, progress: &mut dyn Progress) -> Vec<f32> {
        let dim = points.dim();
        let mut rng = DeterministicRng::new(self.seed);
        let mut centroids = plus_plus_init(points, self.size, &mut rng);

        let mut assignments = vec![usize::MAX; points.len()];
        for iteration in 0..self.iterations {
            let mut changed = false;
            for (assignment, point) in assignments.iter_mut().zip(points.iter()) {
                let (index, _) = nearest(&centroids, dim, point);
                if *assignment != index {
                    *assignment = index;
                    changed = true;
                }
            }

            progress.step("kmeans", iteration + 1, Some(self.iterations));
            if !changed {
                debug!(iteration, "kmeans converged");
                break;
            }

            let mut sums = vec![0.0f64; centroids.len()];
            let mut counts = vec![0usize; self.size];
            for (&assignment, point) in assignments.iter().zip(points.iter()) {
                counts[assignment] += 1;
                let sum = &mut sums[assignment * dim..][..dim];
                for (s, &v) in sum.iter_mut().zip(point) {
                    *s += f64::from(v);
                }
            }

            // Empty clusters keep their previous centroid.
            for (cluster, &count) in counts.iter().enumerate() {
                if count == 0 {
                    continue;
                }
                let sum = &sums[cluster * dim..][..dim];
                let centroid = &mut centroids[cluster * dim..][..dim];
                for (c, &s) in centroid.iter_mut().zip(sum) {
                    *c = (s / count as f64) as f32;
                }
            }
        }

        centroids
    }
}

/// k-means++ seeding: each next centroid is drawn with probability
/// proportional to its squared distance from the closest chosen one.
///
/// Once every distinct point is chosen the remaining centroids are drawn
/// uniformly, so exactly `k` centroids are always returned.
fn plus_plus_init(points: &Patches, k: usize, rng: &mut DeterministicRng) -> Vec<f32> {
    let mut centroids = Vec::with_capacity(k * points.dim());
    let first = rng.gen_index(points.len());
    centroids.extend_from_slice(points.get(first));

    let mut closest: Vec<f64> = points
        .iter()
        .map(|point| f64::from(squared_distance(point, points.get(first))))
        .collect();

    for _ in 1..k {
        let total: f64 = closest.iter().sum();
        let chosen = if total > 0.0 {
            pick_weighted(&closest, rng.gen_f64() * total)
        } else {
            rng.gen_index(points.len())
        };

        let centroid = points.get(chosen);
        centroids.extend_from_slice(centroid);
        for (distance, point) in closest.iter_mut().zip(points.iter()) {
            *distance = distance.min(f64::from(squared_distance(point, centroid)));
        }
    }

    centroids
}

fn pick_weighted(weights: &[f64], target: f64) -> usize {
    let mut cumulative = 0.0;
    let mut last_positive = 0;
    for (index, &weight) in weights.iter().enumerate() {
        if weight <= 0.0 {
            continue;
        }
        cumulative += weight;
        last_positive = index;
        if target < cumulative {
            return index;
        }
    }
    last_positive
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::PatchConfig;
    use crate::progress::RecordingProgress;
    use crate::utils::solid_image;

    fn entries_sorted(palette: &Palette) -> Vec<Vec<f32>> {
        let mut entries: Vec<Vec<f32>> = palette.iter().map(<[f32]>::to_vec).collect();
        entries.sort_by(|a, b| a.partial_cmp(b).unwrap());
        entries
    }

    fn points(dim: usize, values: &[f32]) -> Patches {
        Patches::from_raw(dim, values.to_vec())
    }

    #[test]
    fn deserialization_validates_layout() {
        let palette: Palette = serde_json::from_str(r#"{"dim":2,"entries":[1.0,2.0,3.0,4.0]}"#).unwrap();
        assert_eq!(palette.len(), 2);
        assert_eq!(serde_json::from_str::<Palette>(&serde_json::to_string(&palette).unwrap()).unwrap(), palette);

        for invalid in [
            r#"{"dim":768,"entries":[]}"#,
            r#"{"dim":0,"entries":[]}"#,
            r#"{"dim":0,"entries":[1.0]}"#,
            r#"{"dim":2,"entries":[1.0,2.0,3.0]}"#,
        ] {
            assert!(serde_json::from_str::<Palette>(invalid).is_err(), "{invalid}");
        }
    }

    #[test]
    fn generate_rejects_empty_input() {
        let builder = PaletteBuilder::new(4);
        assert_eq!(builder.generate(&Patches::new(3), &mut ()), Err(PaletteError::EmptyInput));
    }

    #[test]
    fn generate_finds_clusters() {
        let data = points(1, &[0.0, 0.5, 1.0, 100.0, 100.5, 101.0]);
        let palette = PaletteBuilder::new(2).with_seed(5).generate(&data, &mut ()).unwrap();
        assert_eq!(palette.len(), 2);
        assert_eq!(entries_sorted(&palette), vec![vec![0.5], vec![100.5]]);
    }

    #[test]
    fn generate_is_deterministic() {
        let data = points(2, &[1.0, 2.0, 3.0, 4.0, 9.0, 9.0, 0.0, 7.0, 5.0, 5.0, 8.0, 1.0]);
        let builder = PaletteBuilder::new(3).with_seed(11);
        let first = builder.generate(&data, &mut ()).unwrap();
        let second = builder.generate(&data, &mut ()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn generate_keeps_size_with_few_points() {
        let data = points(1, &[3.0, 3.0]);
        let palette = PaletteBuilder::new(4).generate(&data, &mut ()).unwrap();
        assert_eq!(palette.len(), 4);
        assert!(palette.iter().all(|e| e == [3.0]));
    }

    #[test]
    fn generate_from_solid_images_separates_colors() {
        let images = vec![solid_image(32, 32, [255, 0, 0]), solid_image(32, 32, [0, 0, 255])];
        let config = PatchConfig::new(16, 1.0);
        let palette = PaletteBuilder::new(2)
            .generate_from_images(&images, &config, &mut ())
            .unwrap();
        let reds: Vec<f32> = palette.iter().map(|e| e[0]).collect();
        assert!(reds.contains(&255.0));
        assert!(reds.contains(&0.0));
    }

    #[test]
    fn merge_single_palette_is_identity() {
        let palette = Palette::from_entries(2, vec![0.0, 1.0, 5.0, 5.0, -3.0, 2.0, 8.0, 8.0]).unwrap();
        let merged = PaletteBuilder::new(4).merge(&[palette.clone()], &mut ()).unwrap();
        assert_eq!(entries_sorted(&merged), entries_sorted(&palette));
    }

    #[test]
    fn merge_disjoint_single_entries() {
        let a = Palette::from_entries(3, vec![1.0, 2.0, 3.0]).unwrap();
        let b = Palette::from_entries(3, vec![200.0, 100.0, 0.0]).unwrap();
        let merged = PaletteBuilder::new(2).merge(&[a, b], &mut ()).unwrap();
        assert_eq!(
            entries_sorted(&merged),
            vec![vec![1.0, 2.0, 3.0], vec![200.0, 100.0, 0.0]]
        );
    }

    #[test]
    fn merge_reduces_to_target_size() {
        let a = Palette::from_entries(1, vec![0.0, 1.0, 50.0]).unwrap();
        let b = Palette::from_entries(1, vec![2.0, 51.0, 52.0]).unwrap();
        let merged = PaletteBuilder::new(2).with_seed(3).merge(&[a, b], &mut ()).unwrap();
        assert_eq!(entries_sorted(&merged), vec![vec![1.0], vec![51.0]]);
    }

    #[test]
    fn merge_rejects_mixed_dimensions() {
        let a = Palette::from_entries(2, vec![0.0, 0.0]).unwrap();
        let b = Palette::from_entries(3, vec![0.0, 0.0, 0.0]).unwrap();
        assert_eq!(
            PaletteBuilder::new(2).merge(&[a, b], &mut ()),
            Err(PaletteError::DimensionMismatch {
                index: 1,
                expected: 2,
                found: 3
            })
        );
    }

    #[test]
    fn merge_rejects_no_palettes() {
        assert_eq!(PaletteBuilder::new(2).merge(&[], &mut ()), Err(PaletteError::EmptyInput));
    }

    #[test]
    fn reports_iterations() {
        let data = points(1, &[0.0, 10.0, 20.0]);
        let mut progress = RecordingProgress::default();
        PaletteBuilder::new(2).with_iterations(5).generate(&data, &mut progress).unwrap();
        assert!(!progress.steps.is_empty());
        assert!(progress.steps.iter().all(|(stage, _, total)| stage == "kmeans" && *total == Some(5)));
    }

    #[test]
    fn palette_layout_is_checked() {
        assert!(matches!(
            Palette::from_entries(3, vec![1.0; 4]),
            Err(PaletteError::InvalidLayout { dim: 3, len: 4 })
        ));
    }
}
