//! Painting classification with bags of visual words.
//!
//! Images are cut into square patches, patches are quantized against learned
//! palettes and the resulting histograms decide the class, either against one
//! palette shared by all classes ([GlobalPaletteClassifier]) or against a
//! palette per class ([LocalPaletteClassifier]).

pub use artifacts::{ArtifactError, ArtifactStore, ArtifactStoreExt, FsArtifactStore, MemoryStore};
pub use classifier::{
    ClassProfiles, Classify, ClassifyError, GlobalPaletteClassifier, LocalClassModel, LocalPaletteClassifier,
};
pub use config::{BatchSize, ByteUnit, Config, ConfigError, PaletteConfig};
pub use dataset::{
    label_distribution, load_label_table, load_rgb, BalancedSubindex, BatchLoader, ClassBatches, ClassEncoding, ClassIndex,
    ClassificationTarget, DatasetError, DatasetImages, ImageSource, LabeledEntry, MemoryImages,
};
pub use evaluator::{evaluate, sample_fraction, EvalError, Evaluation};
pub use histogram::{
    aggregate_class_profile, match_image, AggregationPolicy, Histogram, HistogramError, ImageMatch,
    ProfileAccumulator,
};
pub use palette::{Palette, PaletteBuilder, PaletteError};
pub use patch::{extract, strides, PatchConfig, PatchError, Patches};
pub use progress::{Progress, TracingProgress};
pub use quantize::{Assignment, Quantizer};
pub use training::{
    class_histogram_key, load_global, load_local, local_palette_key, partial_palette_key, TrainError, Trainer,
    CLASS_HISTOGRAMS, GLOBAL_PALETTE, LOCAL_PALETTES,
};
pub use visualize::{NoVisualizer, PngVisualizer, Scale, VisualizeError, Visualizer};

mod artifacts;
mod classifier;
mod config;
mod dataset;
mod evaluator;
mod histogram;
mod palette;
mod patch;
mod progress;
mod quantize;
mod rng;
mod training;
mod utils;
mod visualize;
