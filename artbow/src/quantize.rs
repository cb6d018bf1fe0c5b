use crate::palette::Palette;
use crate::patch::Patches;

/// Nearest palette entry of a patch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Assignment {
    pub index: usize,
    /// Euclidean distance to the entry.
    pub distance: f32,
}

/// Exact 1-nearest-neighbour index over the entries of a [Palette].
#[derive(Debug, Clone)]
pub struct Quantizer {
    dim: usize,
    entries: Vec<f32>,
}

impl Quantizer {
    pub fn new(palette: &Palette) -> Self {
        Self {
            dim: palette.dim(),
            entries: palette.as_slice().to_vec(),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of palette entries (histogram bins).
    pub fn len(&self) -> usize {
        self.entries.len() / self.dim
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Finds the closest entry; ties go to the lowest index.
    pub fn quantize(&self, patch: &[f32]) -> Assignment {
        assert_eq!(patch.len(), self.dim);
        let (index, squared) = nearest(&self.entries, self.dim, patch);
        Assignment {
            index,
            distance: squared.sqrt(),
        }
    }

    pub fn query(&self, patches: &Patches) -> Vec<Assignment> {
        assert_eq!(patches.dim(), self.dim);
        patches.iter().map(|patch| self.quantize(patch)).collect()
    }
}

pub(crate) fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(&a, &b)| {
            let d = a - b;
            d * d
        })
        .sum()
}

/// Index and squared distance of the row of `entries` closest to `point`.
pub(crate) fn nearest(entries: &[f32], dim: usize, point: &[f32]) -> (usize, f32) {
    let mut best = (0, f32::INFINITY);
    for (index, entry) in entries.chunks_exact(dim).enumerate() {
        let distance = squared_distance(entry, point);
        if distance < best.1 {
            best = (index, distance);
        }
    }
    best
}
