//! Training and reloading of both classifier kinds.

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::artifacts::{ArtifactError, ArtifactStore, ArtifactStoreExt};
use crate::classifier::{ClassProfiles, ClassifyError, GlobalPaletteClassifier, LocalPaletteClassifier};
use crate::config::Config;
use crate::dataset::{BatchLoader, ImageSource};
use crate::histogram::{match_image, HistogramError, ProfileAccumulator};
use crate::palette::{Palette, PaletteError};
use crate::patch::PatchError;
use crate::progress::Progress;
use crate::quantize::Quantizer;
use crate::visualize::{NoVisualizer, VisualizeError, Visualizer};

pub const GLOBAL_PALETTE: &str = "global_palette";
pub const CLASS_HISTOGRAMS: &str = "class_histograms";
pub const LOCAL_PALETTES: &str = "local_palettes";

pub fn partial_palette_key(round: usize) -> String {
    format!("palettes/{round}")
}

pub fn class_histogram_key(class: &str) -> String {
    format!("histograms/{class}")
}

pub fn local_palette_key(class: &str) -> String {
    format!("loc_palettes/{class}")
}

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("no training image could be loaded")]
    NoImages,

    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error(transparent)]
    Palette(#[from] PaletteError),

    #[error(transparent)]
    Histogram(#[from] HistogramError),

    #[error(transparent)]
    Classify(#[from] ClassifyError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Visualize(#[from] VisualizeError),
}

/// Builds classifiers from a [BatchLoader], optionally persisting every
/// intermediate artifact and rendering the palettes.
pub struct Trainer<'a> {
    config: &'a Config,
    store: Option<&'a mut dyn ArtifactStore>,
    visualizer: Box<dyn Visualizer + 'a>,
    progress: Box<dyn Progress + 'a>,
}

impl<'a> Trainer<'a> {
    /// A trainer that persists nothing, draws nothing and reports nothing.
    pub fn new(config: &'a Config) -> Self {
        Self {
            config,
            store: None,
            visualizer: Box::new(NoVisualizer),
            progress: Box::new(()),
        }
    }

    pub fn with_store(mut self, store: &'a mut dyn ArtifactStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_visualizer(mut self, visualizer: impl Visualizer + 'a) -> Self {
        self.visualizer = Box::new(visualizer);
        self
    }

    pub fn with_progress(mut self, progress: impl Progress + 'a) -> Self {
        self.progress = Box::new(progress);
        self
    }

    fn persist<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<(), ArtifactError> {
        match self.store.as_deref_mut() {
            Some(store) => store.put_json(key, value),
            None => Ok(()),
        }
    }

    /// Learns one palette shared by all classes and a profile histogram per class.
    pub fn train_global<S: ImageSource>(&mut self, loader: &BatchLoader<S>) -> Result<GlobalPaletteClassifier, TrainError> {
        let config = self.config;
        let patches = config.patches(&config.global_palette);
        let builder = config.palette_builder(&config.global_palette);

        let mut partial = Vec::new();
        for (round, images) in loader.interleaved_batches().enumerate() {
            let palette = builder.generate_from_images(&images, &patches, &mut *self.progress)?;
            self.persist(&partial_palette_key(round), &palette)?;
            partial.push(palette);
            self.progress.step("global palette rounds", round + 1, None);
        }
        if partial.is_empty() {
            return Err(TrainError::NoImages);
        }

        let palette = builder.merge(&partial, &mut *self.progress)?;
        info!(rounds = partial.len(), entries = palette.len(), "global palette ready");
        self.persist(GLOBAL_PALETTE, &palette)?;
        self.visualizer.palette(GLOBAL_PALETTE, &palette, config.patch_size)?;

        let quantizer = Quantizer::new(&palette);
        let total = loader.index().len();
        let mut profiles = ClassProfiles::new();
        for (n, batches) in loader.classes().enumerate() {
            let class = batches.class();
            let mut accumulator = ProfileAccumulator::new(config.aggregation, palette.len());
            for batch in batches {
                for image in &batch {
                    accumulator.add(&match_image(image, &quantizer, &patches)?)?;
                }
            }
            if accumulator.images() == 0 {
                warn!(class, "no readable images, class left out");
                continue;
            }

            let profile = accumulator.finish()?;
            self.persist(&class_histogram_key(class), &profile)?;
            profiles.insert(class.to_owned(), profile);
            self.progress.step("class histograms", n + 1, Some(total));
        }
        self.persist(CLASS_HISTOGRAMS, &profiles)?;

        Ok(GlobalPaletteClassifier::new(palette, profiles, patches)?)
    }

    /// Learns a separate palette for every class.
    pub fn train_local<S: ImageSource>(&mut self, loader: &BatchLoader<S>) -> Result<LocalPaletteClassifier, TrainError> {
        let config = self.config;
        let patches = config.patches(&config.local_palette);
        let builder = config.palette_builder(&config.local_palette);

        let total = loader.index().len();
        let mut palettes = BTreeMap::new();
        for (n, batches) in loader.classes().enumerate() {
            let class = batches.class();
            let mut partial = Vec::new();
            for batch in batches {
                partial.push(builder.generate_from_images(&batch, &patches, &mut *self.progress)?);
            }
            if partial.is_empty() {
                warn!(class, "no readable images, class left out");
                continue;
            }

            let palette = builder.merge(&partial, &mut *self.progress)?;
            self.visualizer
                .palette(&format!("loc_palette_images/{class}"), &palette, config.patch_size)?;
            self.persist(&local_palette_key(class), &palette)?;
            palettes.insert(class.to_owned(), palette);
            self.progress.step("local palettes", n + 1, Some(total));
        }
        self.persist(LOCAL_PALETTES, &palettes)?;

        Ok(LocalPaletteClassifier::new(palettes, patches)?)
    }
}

/// Rebuilds the global classifier from persisted artifacts.
pub fn load_global(store: &dyn ArtifactStore, config: &Config) -> Result<GlobalPaletteClassifier, TrainError> {
    let palette: Palette = store.get_json(GLOBAL_PALETTE)?;
    let profiles: ClassProfiles = store.get_json(CLASS_HISTOGRAMS)?;
    Ok(GlobalPaletteClassifier::new(
        palette,
        profiles,
        config.patches(&config.global_palette),
    )?)
}

/// Rebuilds the local classifier from persisted artifacts.
pub fn load_local(store: &dyn ArtifactStore, config: &Config) -> Result<LocalPaletteClassifier, TrainError> {
    let palettes: BTreeMap<String, Palette> = store.get_json(LOCAL_PALETTES)?;
    Ok(LocalPaletteClassifier::new(
        palettes,
        config.patches(&config.local_palette),
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::MemoryStore;
    use crate::classifier::Classify;
    use crate::config::PaletteConfig;
    use crate::dataset::{ClassEncoding, ClassIndex, ClassificationTarget, LabeledEntry, MemoryImages};
    use crate::progress::RecordingProgress;
    use crate::utils::solid_image;
    use crate::visualize::PngVisualizer;

    const RED: [u8; 3] = [255, 0, 0];
    const BLUE: [u8; 3] = [0, 0, 255];

    fn config() -> Config {
        Config {
            global_palette: PaletteConfig::new(2, 1.0),
            local_palette: PaletteConfig::new(2, 1.0),
            ..Config::default()
        }
    }

    fn loader(budget: u64) -> BatchLoader<MemoryImages> {
        let encoding: ClassEncoding = [(0, "blue".to_owned()), (1, "red".to_owned())].into_iter().collect();
        let mut images = MemoryImages::new();
        let mut entries = Vec::new();
        for i in 0..4 {
            for (code, color) in [(0, BLUE), (1, RED)] {
                let path = format!("{code}/{i}.png");
                images.insert(&path, solid_image(32, 32, color));
                entries.push(LabeledEntry::new(path, code));
            }
        }
        let index = ClassIndex::from_entries(&entries, &encoding).unwrap();
        BatchLoader::new(ClassificationTarget::Style, encoding, index, images, budget)
    }

    #[test]
    fn global_training_persists_and_reloads() {
        let config = config();
        let mut store = MemoryStore::new();
        // Two 3 KiB images per batch gives two rounds.
        let loader = loader(2 * 32 * 32 * 3);

        let classifier = Trainer::new(&config)
            .with_store(&mut store)
            .train_global(&loader)
            .unwrap();
        assert_eq!(classifier.predict(&solid_image(32, 32, RED)).unwrap(), "red");
        assert_eq!(classifier.predict(&solid_image(32, 32, BLUE)).unwrap(), "blue");

        for key in ["palettes/0", "palettes/1", GLOBAL_PALETTE, CLASS_HISTOGRAMS, "histograms/red", "histograms/blue"] {
            assert!(store.contains(key), "{key} missing");
        }
        assert!(!store.contains("palettes/2"));

        let reloaded = load_global(&store, &config).unwrap();
        assert_eq!(reloaded.palette(), classifier.palette());
        assert_eq!(reloaded.profiles(), classifier.profiles());
    }

    #[test]
    fn local_training_persists_and_reloads() {
        let config = config();
        let mut store = MemoryStore::new();
        let mut progress = RecordingProgress::default();
        let loader = loader(u64::MAX);

        let classifier = Trainer::new(&config)
            .with_store(&mut store)
            .with_progress(&mut progress)
            .train_local(&loader)
            .unwrap();
        assert_eq!(classifier.predict(&solid_image(40, 32, RED)).unwrap(), "red");
        assert!(store.contains("loc_palettes/red"));
        assert!(store.contains(LOCAL_PALETTES));
        assert!(progress
            .steps
            .contains(&("local palettes".to_owned(), 2, Some(2))));

        let reloaded = load_local(&store, &config).unwrap();
        assert_eq!(reloaded.classes(), vec!["blue", "red"]);
        assert_eq!(
            reloaded.models()["blue"].palette(),
            classifier.models()["blue"].palette()
        );
    }

    #[test]
    fn dry_run_persists_nothing() {
        let config = config();
        let classifier = Trainer::new(&config).train_local(&loader(u64::MAX)).unwrap();
        assert_eq!(classifier.classes().len(), 2);

        let store = MemoryStore::new();
        assert!(matches!(
            load_local(&store, &config),
            Err(TrainError::Artifact(ArtifactError::Missing(key))) if key == LOCAL_PALETTES
        ));
        assert!(matches!(
            load_global(&store, &config),
            Err(TrainError::Artifact(ArtifactError::Missing(_)))
        ));
    }

    #[test]
    fn renders_palettes() {
        let dir = tempfile::tempdir().unwrap();
        let config = config();
        let loader = loader(u64::MAX);

        Trainer::new(&config)
            .with_visualizer(PngVisualizer::new(dir.path()))
            .train_global(&loader)
            .unwrap();
        Trainer::new(&config)
            .with_visualizer(PngVisualizer::new(dir.path()))
            .train_local(&loader)
            .unwrap();

        assert!(dir.path().join("global_palette.png").is_file());
        assert!(dir.path().join("loc_palette_images/red.png").is_file());
        assert!(dir.path().join("loc_palette_images/blue.png").is_file());
    }

    #[test]
    fn empty_dataset_cannot_be_trained() {
        let config = config();
        let loader = BatchLoader::new(
            ClassificationTarget::Genre,
            ClassEncoding::default(),
            ClassIndex::default(),
            MemoryImages::new(),
            1024,
        );
        assert!(matches!(
            Trainer::new(&config).train_global(&loader),
            Err(TrainError::NoImages)
        ));
        assert!(matches!(
            Trainer::new(&config).train_local(&loader),
            Err(TrainError::Classify(ClassifyError::NoClasses))
        ));
    }

    #[test]
    fn empty_persisted_palettes_are_rejected() {
        let config = config();
        let mut store = MemoryStore::new();
        store.put(GLOBAL_PALETTE, br#"{"dim":768,"entries":[]}"#).unwrap();
        store.put(CLASS_HISTOGRAMS, br#"{"a":[]}"#).unwrap();
        store
            .put(LOCAL_PALETTES, br#"{"a":{"dim":768,"entries":[]}}"#)
            .unwrap();

        assert!(matches!(
            load_global(&store, &config),
            Err(TrainError::Artifact(ArtifactError::Json { key, .. })) if key == GLOBAL_PALETTE
        ));
        assert!(matches!(
            load_local(&store, &config),
            Err(TrainError::Artifact(ArtifactError::Json { key, .. })) if key == LOCAL_PALETTES
        ));
    }
}
