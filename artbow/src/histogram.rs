//! Bag-of-visual-words histograms.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::patch::{extract, PatchConfig, PatchError};
use crate::quantize::{Assignment, Quantizer};

#[derive(Debug, Error, PartialEq)]
pub enum HistogramError {
    #[error("cannot aggregate a class profile without images")]
    EmptyClass,

    #[error("histogram has {found} bins, expected {expected}")]
    BinMismatch { expected: usize, found: usize },
}

/// Frequencies of palette entries; bins are indexed like the palette.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Histogram(Vec<f64>);

impl Histogram {
    pub fn zeros(bins: usize) -> Self {
        Self(vec![0.0; bins])
    }

    pub fn from_bins(bins: Vec<f64>) -> Self {
        Self(bins)
    }

    /// Normalizes `counts` by `total`; a zero total gives the zero histogram.
    pub fn from_counts(counts: &[usize], total: usize) -> Self {
        if total == 0 {
            return Self::zeros(counts.len());
        }
        Self(counts.iter().map(|&c| c as f64 / total as f64).collect())
    }

    pub fn bins(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn sum(&self) -> f64 {
        self.0.iter().sum()
    }

    /// Sum of absolute differences.
    pub fn l1_distance(&self, other: &Histogram) -> f64 {
        assert_eq!(self.len(), other.len());
        self.0.iter().zip(&other.0).map(|(a, b)| (a - b).abs()).sum()
    }
}

/// Quantization result for one image.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageMatch {
    /// Normalized frequencies (sum to 1 unless `patch_count` is 0).
    pub histogram: Histogram,
    /// Raw number of patches per bin.
    pub counts: Vec<usize>,
    pub patch_count: usize,
}

impl ImageMatch {
    pub fn from_assignments(assignments: &[Assignment], bins: usize) -> Self {
        let mut counts = vec![0; bins];
        for assignment in assignments {
            counts[assignment.index] += 1;
        }
        Self {
            histogram: Histogram::from_counts(&counts, assignments.len()),
            counts,
            patch_count: assignments.len(),
        }
    }
}

/// Extracts the patches of `image`, quantizes them and counts them per palette entry.
pub fn match_image(image: &RgbImage, quantizer: &Quantizer, config: &PatchConfig) -> Result<ImageMatch, PatchError> {
    let patches = extract(image, config)?;
    let assignments = quantizer.query(&patches);
    Ok(ImageMatch::from_assignments(&assignments, quantizer.len()))
}

/// Rule for combining the histograms of a class's images into one profile.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationPolicy {
    /// Sums the per-image normalized histograms and divides by the total
    /// number of patches of all images.
    ///
    /// This reproduces the historical behaviour. It mixes units: the sum of
    /// probabilities is divided by a patch count, so profiles sum to
    /// `images / patches` rather than 1 and shrink with image size. Whether this
    /// is intended is unresolved; the other policies are the consistent options.
    #[default]
    ReferencePatchCount,
    /// Plain average of the per-image normalized histograms.
    MeanOfHistograms,
    /// Sums raw counts of all images and normalizes by the total patch count.
    PooledCounts,
}

impl AggregationPolicy {
    pub const ALL: [AggregationPolicy; 3] = [
        AggregationPolicy::ReferencePatchCount,
        AggregationPolicy::MeanOfHistograms,
        AggregationPolicy::PooledCounts,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            AggregationPolicy::ReferencePatchCount => "reference_patch_count",
            AggregationPolicy::MeanOfHistograms => "mean_of_histograms",
            AggregationPolicy::PooledCounts => "pooled_counts",
        }
    }
}

impl Display for AggregationPolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AggregationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|policy| policy.name() == s)
            .ok_or_else(|| format!("unknown aggregation policy `{s}`"))
    }
}

/// Streams image matches of one class into a profile histogram.
#[derive(Debug, Clone)]
pub struct ProfileAccumulator {
    policy: AggregationPolicy,
    sum: Vec<f64>,
    images: usize,
    patches: usize,
}

impl ProfileAccumulator {
    pub fn new(policy: AggregationPolicy, bins: usize) -> Self {
        Self {
            policy,
            sum: vec![0.0; bins],
            images: 0,
            patches: 0,
        }
    }

    pub fn add(&mut self, image: &ImageMatch) -> Result<(), HistogramError> {
        if image.counts.len() != self.sum.len() {
            return Err(HistogramError::BinMismatch {
                expected: self.sum.len(),
                found: image.counts.len(),
            });
        }

        match self.policy {
            AggregationPolicy::ReferencePatchCount | AggregationPolicy::MeanOfHistograms => {
                for (s, &h) in self.sum.iter_mut().zip(image.histogram.bins()) {
                    *s += h;
                }
            }
            AggregationPolicy::PooledCounts => {
                for (s, &c) in self.sum.iter_mut().zip(&image.counts) {
                    *s += c as f64;
                }
            }
        }
        self.images += 1;
        self.patches += image.patch_count;
        Ok(())
    }

    pub fn images(&self) -> usize {
        self.images
    }

    pub fn finish(self) -> Result<Histogram, HistogramError> {
        if self.images == 0 {
            return Err(HistogramError::EmptyClass);
        }

        let divisor = match self.policy {
            AggregationPolicy::ReferencePatchCount | AggregationPolicy::PooledCounts => self.patches,
            AggregationPolicy::MeanOfHistograms => self.images,
        };
        if divisor == 0 {
            return Ok(Histogram::zeros(self.sum.len()));
        }
        let divisor = divisor as f64;
        Ok(Histogram(self.sum.into_iter().map(|s| s / divisor).collect()))
    }
}

/// Combines per-image matches of one class according to `policy`.
pub fn aggregate_class_profile(images: &[ImageMatch], policy: AggregationPolicy) -> Result<Histogram, HistogramError> {
    let bins = images.first().ok_or(HistogramError::EmptyClass)?.counts.len();
    let mut accumulator = ProfileAccumulator::new(policy, bins);
    for image in images {
        accumulator.add(image)?;
    }
    accumulator.finish()
}
