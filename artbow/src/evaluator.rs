//! Accuracy of a classifier on a labeled validation table.

use std::fmt::{Display, Formatter};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::classifier::{ClassifyError, Classify};
use crate::dataset::{ClassEncoding, DatasetError, ImageSource, LabeledEntry};
use crate::progress::Progress;
use crate::rng::DeterministicRng;

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("no validation image could be evaluated ({skipped} skipped)")]
    NoEvaluatedEntries { skipped: usize },

    #[error("evaluation fraction must be in (0, 1], got {0}")]
    InvalidFraction(f64),

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Classify(#[from] ClassifyError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Evaluation {
    pub correct: usize,
    /// Entries that were classified.
    pub total: usize,
    /// Entries whose image could not be loaded.
    pub skipped: usize,
}

impl Evaluation {
    /// Fraction of correct predictions; `None` when nothing was classified.
    pub fn accuracy(&self) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        Some(self.correct as f64 / self.total as f64)
    }
}

impl Display for Evaluation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.accuracy() {
            Some(accuracy) => write!(f, "{accuracy:.4}")?,
            None => f.write_str("n/a")?,
        }
        write!(
            f,
            " ({}/{} correct, {} skipped)",
            self.correct,
            self.total,
            self.skipped
        )
    }
}

/// Predicts every entry and counts the correct ones.
///
/// Images that fail to load are skipped and left out of the total, whatever
/// their label. Label codes of loaded images missing from `encoding` and
/// classification failures abort the run.
pub fn evaluate<C, S>(
    entries: &[LabeledEntry],
    classifier: &C,
    encoding: &ClassEncoding,
    images: &S,
    progress: &mut dyn Progress,
) -> Result<Evaluation, EvalError>
where
    C: Classify + ?Sized,
    S: ImageSource + ?Sized,
{
    let mut evaluation = Evaluation {
        correct: 0,
        total: 0,
        skipped: 0,
    };

    for (i, entry) in entries.iter().enumerate() {
        let image = match images.load(&entry.path) {
            Ok(image) => image,
            Err(err) => {
                warn!(path = %entry.path.display(), %err, "skipping validation image");
                evaluation.skipped += 1;
                continue;
            }
        };
        let expected = encoding.decode(entry.code)?;

        let predicted = classifier.predict(&image)?;
        debug!(path = %entry.path.display(), expected, predicted, "prediction");
        evaluation.total += 1;
        if predicted == expected {
            evaluation.correct += 1;
        }
        progress.step("evaluate", i + 1, Some(entries.len()));
    }

    if evaluation.total == 0 {
        return Err(EvalError::NoEvaluatedEntries {
            skipped: evaluation.skipped,
        });
    }
    Ok(evaluation)
}

/// Randomly keeps `fraction` of the entries (at least one), in table order.
pub fn sample_fraction(entries: &[LabeledEntry], fraction: f64, seed: u64) -> Result<Vec<LabeledEntry>, EvalError> {
    if !(fraction > 0.0 && fraction <= 1.0) {
        return Err(EvalError::InvalidFraction(fraction));
    }
    if entries.is_empty() {
        return Ok(Vec::new());
    }

    let amount = ((entries.len() as f64 * fraction).round() as usize).clamp(1, entries.len());
    let mut rng = DeterministicRng::new(seed);
    let mut chosen = rand::seq::index::sample(rng.inner_mut(), entries.len(), amount).into_vec();
    chosen.sort_unstable();
    Ok(chosen.into_iter().map(|i| entries[i].clone()).collect())
}
