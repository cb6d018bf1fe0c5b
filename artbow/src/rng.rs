//! Seeded PCG32 generator shared by every randomized step.

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;

#[derive(Clone)]
pub(crate) struct DeterministicRng {
    inner: Pcg32,
}

impl DeterministicRng {
    pub(crate) fn new(seed: u64) -> Self {
        Self {
            inner: Pcg32::seed_from_u64(seed),
        }
    }

    /// Random f64 in `[0.0, 1.0)`.
    #[inline]
    pub(crate) fn gen_f64(&mut self) -> f64 {
        self.inner.gen::<f64>()
    }

    #[inline]
    pub(crate) fn gen_index(&mut self, len: usize) -> usize {
        self.inner.gen_range(0..len)
    }

    pub(crate) fn inner_mut(&mut self) -> &mut Pcg32 {
        &mut self.inner
    }
}
