//! Nearest-class decisions.
//!
//! Classes are always visited in ascending lexicographic order of their
//! labels and a class only wins with a strictly smaller score, so on ties the
//! first class in that order is predicted.

use std::collections::BTreeMap;

use image::RgbImage;
use thiserror::Error;
use tracing::trace;

use crate::histogram::{match_image, Histogram};
use crate::palette::Palette;
use crate::patch::{extract, PatchConfig, PatchError};
use crate::quantize::Quantizer;

#[derive(Debug, Error, PartialEq)]
pub enum ClassifyError {
    #[error("classifier has no classes")]
    NoClasses,

    #[error("class `{class}` has an empty palette")]
    EmptyPalette { class: String },

    #[error("class `{class}` has dimension {found}, expected {expected}")]
    DimensionMismatch {
        class: String,
        expected: usize,
        found: usize,
    },

    #[error(transparent)]
    Patch(#[from] PatchError),
}

/// Maps an image to one of a fixed set of class labels.
pub trait Classify {
    /// Class labels in decision order.
    fn classes(&self) -> Vec<&str>;

    fn predict(&self, image: &RgbImage) -> Result<&str, ClassifyError>;
}

impl<C: Classify + ?Sized> Classify for &C {
    fn classes(&self) -> Vec<&str> {
        (**self).classes()
    }

    fn predict(&self, image: &RgbImage) -> Result<&str, ClassifyError> {
        (**self).predict(image)
    }
}

impl<C: Classify + ?Sized> Classify for Box<C> {
    fn classes(&self) -> Vec<&str> {
        (**self).classes()
    }

    fn predict(&self, image: &RgbImage) -> Result<&str, ClassifyError> {
        (**self).predict(image)
    }
}

/// Per-class histogram over a shared palette.
pub type ClassProfiles = BTreeMap<String, Histogram>;

/// Compares the histogram of a query image with a profile of every class.
#[derive(Debug, Clone)]
pub struct GlobalPaletteClassifier {
    palette: Palette,
    quantizer: Quantizer,
    profiles: ClassProfiles,
    patches: PatchConfig,
}

impl GlobalPaletteClassifier {
    pub fn new(palette: Palette, profiles: ClassProfiles, patches: PatchConfig) -> Result<Self, ClassifyError> {
        if profiles.is_empty() {
            return Err(ClassifyError::NoClasses);
        }
        if palette.is_empty() {
            return Err(ClassifyError::EmptyPalette {
                class: String::from("*"),
            });
        }
        if palette.dim() != patches.dim() {
            return Err(ClassifyError::DimensionMismatch {
                class: String::from("*"),
                expected: patches.dim(),
                found: palette.dim(),
            });
        }
        for (class, profile) in &profiles {
            if profile.len() != palette.len() {
                return Err(ClassifyError::DimensionMismatch {
                    class: class.clone(),
                    expected: palette.len(),
                    found: profile.len(),
                });
            }
        }

        let quantizer = Quantizer::new(&palette);
        Ok(Self {
            palette,
            quantizer,
            profiles,
            patches,
        })
    }

    pub fn palette(&self) -> &Palette {
        &self.palette
    }

    pub fn profiles(&self) -> &ClassProfiles {
        &self.profiles
    }

    /// L1 distance between the image histogram and every class profile, in class order.
    pub fn distances(&self, image: &RgbImage) -> Result<Vec<(&str, f64)>, ClassifyError> {
        let query = match_image(image, &self.quantizer, &self.patches)?;
        Ok(self
            .profiles
            .iter()
            .map(|(class, profile)| (class.as_str(), profile.l1_distance(&query.histogram)))
            .collect())
    }
}

impl Classify for GlobalPaletteClassifier {
    fn classes(&self) -> Vec<&str> {
        self.profiles.keys().map(String::as_str).collect()
    }

    fn predict(&self, image: &RgbImage) -> Result<&str, ClassifyError> {
        let distances = self.distances(image)?;
        arg_min(distances).ok_or(ClassifyError::NoClasses)
    }
}

/// A class's own palette with its nearest-neighbour index.
#[derive(Debug, Clone)]
pub struct LocalClassModel {
    palette: Palette,
    quantizer: Quantizer,
}

impl LocalClassModel {
    pub fn new(palette: Palette) -> Self {
        let quantizer = Quantizer::new(&palette);
        Self { palette, quantizer }
    }

    pub fn palette(&self) -> &Palette {
        &self.palette
    }

    pub fn quantizer(&self) -> &Quantizer {
        &self.quantizer
    }
}

/// Scores every class by how well its own palette reproduces the query's patches.
#[derive(Debug, Clone)]
pub struct LocalPaletteClassifier {
    models: BTreeMap<String, LocalClassModel>,
    patches: PatchConfig,
}

impl LocalPaletteClassifier {
    pub fn new(palettes: BTreeMap<String, Palette>, patches: PatchConfig) -> Result<Self, ClassifyError> {
        if palettes.is_empty() {
            return Err(ClassifyError::NoClasses);
        }
        for (class, palette) in &palettes {
            if palette.is_empty() {
                return Err(ClassifyError::EmptyPalette { class: class.clone() });
            }
            if palette.dim() != patches.dim() {
                return Err(ClassifyError::DimensionMismatch {
                    class: class.clone(),
                    expected: patches.dim(),
                    found: palette.dim(),
                });
            }
        }

        let models = palettes
            .into_iter()
            .map(|(class, palette)| (class, LocalClassModel::new(palette)))
            .collect();
        Ok(Self { models, patches })
    }

    pub fn models(&self) -> &BTreeMap<String, LocalClassModel> {
        &self.models
    }

    /// Sum of nearest-entry distances of all patches, per class in class order.
    pub fn scores(&self, image: &RgbImage) -> Result<Vec<(&str, f64)>, ClassifyError> {
        let patches = extract(image, &self.patches)?;
        Ok(self
            .models
            .iter()
            .map(|(class, model)| {
                let total = model
                    .quantizer
                    .query(&patches)
                    .iter()
                    .map(|a| f64::from(a.distance))
                    .sum();
                (class.as_str(), total)
            })
            .collect())
    }
}

impl Classify for LocalPaletteClassifier {
    fn classes(&self) -> Vec<&str> {
        self.models.keys().map(String::as_str).collect()
    }

    fn predict(&self, image: &RgbImage) -> Result<&str, ClassifyError> {
        let scores = self.scores(image)?;
        arg_min(scores).ok_or(ClassifyError::NoClasses)
    }
}

/// First class with the smallest score.
fn arg_min<'a>(scores: impl IntoIterator<Item = (&'a str, f64)>) -> Option<&'a str> {
    let mut best: Option<(&str, f64)> = None;
    for (class, score) in scores {
        trace!(class, score, "class score");
        match best {
            Some((_, best_score)) if !(score < best_score) => {}
            _ => best = Some((class, score)),
        }
    }
    best.map(|(class, _)| class)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::histogram::{AggregationPolicy, ProfileAccumulator};
    use crate::palette::PaletteBuilder;
    use crate::utils::solid_image;

    const RED: [u8; 3] = [255, 0, 0];
    const BLUE: [u8; 3] = [0, 0, 255];

    fn training_set() -> Vec<(&'static str, Vec<RgbImage>)> {
        vec![
            ("red", (0..4).map(|_| solid_image(32, 32, RED)).collect()),
            ("blue", (0..4).map(|_| solid_image(32, 32, BLUE)).collect()),
        ]
    }

    fn config() -> PatchConfig {
        PatchConfig::new(16, 1.0)
    }

    fn global_classifier(policy: AggregationPolicy) -> GlobalPaletteClassifier {
        let all: Vec<RgbImage> = training_set().into_iter().flat_map(|(_, images)| images).collect();
        let palette = PaletteBuilder::new(2)
            .with_seed(1)
            .generate_from_images(&all, &config(), &mut ())
            .unwrap();
        let quantizer = Quantizer::new(&palette);

        let mut profiles = ClassProfiles::new();
        for (class, images) in training_set() {
            let mut accumulator = ProfileAccumulator::new(policy, palette.len());
            for image in &images {
                accumulator.add(&match_image(image, &quantizer, &config()).unwrap()).unwrap();
            }
            profiles.insert(class.to_owned(), accumulator.finish().unwrap());
        }
        GlobalPaletteClassifier::new(palette, profiles, config()).unwrap()
    }

    fn local_classifier() -> LocalPaletteClassifier {
        let palettes = training_set()
            .into_iter()
            .map(|(class, images)| {
                let palette = PaletteBuilder::new(2)
                    .generate_from_images(&images, &config(), &mut ())
                    .unwrap();
                (class.to_owned(), palette)
            })
            .collect();
        LocalPaletteClassifier::new(palettes, config()).unwrap()
    }

    #[test]
    fn global_palette_separates_colors() {
        let classifier = global_classifier(AggregationPolicy::MeanOfHistograms);
        let reds: Vec<f32> = classifier.palette().iter().map(|e| e[0]).collect();
        assert!(reds.contains(&255.0) && reds.contains(&0.0));
    }

    #[test]
    fn global_predicts_trained_class() {
        for policy in AggregationPolicy::ALL {
            let classifier = global_classifier(policy);
            assert_eq!(classifier.predict(&solid_image(32, 32, RED)).unwrap(), "red");
            assert_eq!(classifier.predict(&solid_image(32, 32, BLUE)).unwrap(), "blue");
        }
    }

    #[test]
    fn local_predicts_trained_class() {
        let classifier = local_classifier();
        assert_eq!(classifier.predict(&solid_image(32, 32, RED)).unwrap(), "red");
        assert_eq!(classifier.predict(&solid_image(48, 40, BLUE)).unwrap(), "blue");

        let scores = classifier.scores(&solid_image(32, 32, RED)).unwrap();
        assert_eq!(scores[1].0, "red");
        assert_eq!(scores[1].1, 0.0);
        assert!(scores[0].1 > 0.0);
    }

    #[test]
    fn prediction_is_a_known_class() {
        let global = global_classifier(AggregationPolicy::ReferencePatchCount);
        let local = local_classifier();
        let query = solid_image(20, 30, [120, 30, 200]);
        assert!(global.classes().contains(&global.predict(&query).unwrap()));
        assert!(local.classes().contains(&local.predict(&query).unwrap()));
    }

    #[test]
    fn ties_go_to_first_class_in_order() {
        let palette = Palette::from_entries(16 * 16 * 3, vec![0.0; 16 * 16 * 3]).unwrap();
        let palettes: BTreeMap<_, _> = ["zeta", "alpha", "mid"]
            .into_iter()
            .map(|class| (class.to_owned(), palette.clone()))
            .collect();
        let classifier = LocalPaletteClassifier::new(palettes, config()).unwrap();
        assert_eq!(classifier.classes(), vec!["alpha", "mid", "zeta"]);
        assert_eq!(classifier.predict(&solid_image(16, 16, RED)).unwrap(), "alpha");

        let profiles: ClassProfiles = ["b", "a"]
            .into_iter()
            .map(|class| (class.to_owned(), Histogram::from_bins(vec![1.0])))
            .collect();
        let classifier = GlobalPaletteClassifier::new(palette, profiles, config()).unwrap();
        assert_eq!(classifier.predict(&solid_image(16, 16, BLUE)).unwrap(), "a");
    }

    #[test]
    fn arg_min_is_strict() {
        assert_eq!(arg_min([("a", 2.0), ("b", 1.0), ("c", 1.0)]), Some("b"));
        assert_eq!(arg_min([("a", 0.0), ("b", 0.0)]), Some("a"));
        assert_eq!(arg_min(Vec::new()), None);
    }

    #[test]
    fn rejects_empty_class_sets() {
        let palette = Palette::from_entries(3, vec![0.0; 3]).unwrap();
        assert_eq!(
            GlobalPaletteClassifier::new(palette, ClassProfiles::new(), PatchConfig::new(1, 1.0)).unwrap_err(),
            ClassifyError::NoClasses
        );
        assert_eq!(
            LocalPaletteClassifier::new(BTreeMap::new(), config()).unwrap_err(),
            ClassifyError::NoClasses
        );
    }

    #[test]
    fn rejects_mismatched_palettes() {
        let palette = Palette::from_entries(3, vec![0.0; 3]).unwrap();
        let palettes = BTreeMap::from([("x".to_owned(), palette)]);
        assert_eq!(
            LocalPaletteClassifier::new(palettes, config()).unwrap_err(),
            ClassifyError::DimensionMismatch {
                class: "x".to_owned(),
                expected: 768,
                found: 3
            }
        );
    }

    #[test]
    fn small_query_is_an_error() {
        let classifier = local_classifier();
        assert!(matches!(
            classifier.predict(&solid_image(8, 8, RED)),
            Err(ClassifyError::Patch(PatchError::ImageTooSmall { .. }))
        ));
    }
}
