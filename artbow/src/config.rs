//! Run configuration.
//!
//! Loaded from a JSON file; every field has a default so partial files are
//! accepted.

use std::fmt::{Display, Formatter};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::histogram::AggregationPolicy;
use crate::palette::{PaletteBuilder, DEFAULT_KMEANS_ITERATIONS};
use crate::patch::{PatchConfig, DEFAULT_PATCH_SIZE};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Settings of one palette kind (global or local).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PaletteConfig {
    /// Number of palette entries.
    pub size: usize,
    /// Fraction of patch positions sampled from every image.
    pub coverage: f64,
    /// Sample patch positions at random instead of on a strided grid.
    pub random: bool,
}

impl PaletteConfig {
    pub fn new(size: usize, coverage: f64) -> Self {
        Self {
            size,
            coverage,
            random: false,
        }
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn with_coverage(mut self, coverage: f64) -> Self {
        self.coverage = coverage;
        self
    }

    pub fn with_random(mut self, random: bool) -> Self {
        self.random = random;
        self
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.size == 0 {
            return Err(ConfigError::Invalid(format!("{name}.size must be positive")));
        }
        if !(self.coverage > 0.0 && self.coverage <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "{name}.coverage must be in (0, 1], got {}",
                self.coverage
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ByteUnit {
    B,
    KB,
    MB,
    GB,
    KiB,
    MiB,
    GiB,
}

impl ByteUnit {
    const ALL: [ByteUnit; 7] = [
        ByteUnit::B,
        ByteUnit::KB,
        ByteUnit::MB,
        ByteUnit::GB,
        ByteUnit::KiB,
        ByteUnit::MiB,
        ByteUnit::GiB,
    ];

    pub fn bytes(&self) -> u64 {
        match self {
            ByteUnit::B => 1,
            ByteUnit::KB => 1_000,
            ByteUnit::MB => 1_000_000,
            ByteUnit::GB => 1_000_000_000,
            ByteUnit::KiB => 1 << 10,
            ByteUnit::MiB => 1 << 20,
            ByteUnit::GiB => 1 << 30,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            ByteUnit::B => "B",
            ByteUnit::KB => "KB",
            ByteUnit::MB => "MB",
            ByteUnit::GB => "GB",
            ByteUnit::KiB => "KiB",
            ByteUnit::MiB => "MiB",
            ByteUnit::GiB => "GiB",
        }
    }
}

impl FromStr for ByteUnit {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|unit| unit.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| ConfigError::Invalid(format!("unknown byte unit `{s}`")))
    }
}

impl Display for ByteUnit {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Memory budget of one image batch, measured in decoded pixel bytes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchSize {
    pub value: f64,
    pub unit: ByteUnit,
}

impl BatchSize {
    pub fn new(value: f64, unit: ByteUnit) -> Self {
        Self { value, unit }
    }

    /// Parses a value and a unit, e.g. `("256", "MiB")`.
    pub fn parse(value: &str, unit: &str) -> Result<Self, ConfigError> {
        let value = value
            .parse::<f64>()
            .map_err(|_| ConfigError::Invalid(format!("invalid batch size `{value}`")))?;
        Ok(Self::new(value, unit.parse()?))
    }

    pub fn bytes(&self) -> u64 {
        (self.value * self.unit.bytes() as f64) as u64
    }
}

impl Display for BatchSize {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.value, self.unit)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory of the images.
    pub dataset_path: PathBuf,
    /// Directory with the `<target>_{train,val}.csv` and `<target>_class.txt` tables.
    pub dataset_labels_path: PathBuf,
    pub random_seed: u64,
    pub patch_size: usize,
    pub global_palette: PaletteConfig,
    pub local_palette: PaletteConfig,
    pub kmeans_iterations: usize,
    pub batch_size: BatchSize,
    pub aggregation: AggregationPolicy,
    /// Evaluate only a random fraction of the validation table.
    pub validation_fraction: Option<f64>,
    /// Balanced sub-index replacing the full training index when present.
    pub index_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dataset_path: PathBuf::from("./wikiart"),
            dataset_labels_path: PathBuf::from("./wikiart_csv"),
            random_seed: 42,
            patch_size: DEFAULT_PATCH_SIZE,
            global_palette: PaletteConfig::new(128, 0.05),
            local_palette: PaletteConfig::new(32, 0.1),
            kmeans_iterations: DEFAULT_KMEANS_ITERATIONS,
            batch_size: BatchSize::new(256.0, ByteUnit::MiB),
            aggregation: AggregationPolicy::default(),
            validation_fraction: None,
            index_path: None,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        let config: Config = serde_json::from_reader(BufReader::new(file)).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.patch_size == 0 {
            return Err(ConfigError::Invalid("patch_size must be positive".into()));
        }
        self.global_palette.validate("global_palette")?;
        self.local_palette.validate("local_palette")?;
        if self.batch_size.bytes() == 0 {
            return Err(ConfigError::Invalid(format!("batch size {} is empty", self.batch_size)));
        }
        if let Some(fraction) = self.validation_fraction {
            if !(fraction > 0.0 && fraction <= 1.0) {
                return Err(ConfigError::Invalid(format!(
                    "validation_fraction must be in (0, 1], got {fraction}"
                )));
            }
        }
        Ok(())
    }

    /// Patch sampling for images quantized against a palette of this kind.
    pub fn patches(&self, palette: &PaletteConfig) -> PatchConfig {
        PatchConfig::new(self.patch_size, palette.coverage)
            .with_random(palette.random)
            .with_seed(self.random_seed)
    }

    pub fn palette_builder(&self, palette: &PaletteConfig) -> PaletteBuilder {
        PaletteBuilder::new(palette.size)
            .with_iterations(self.kmeans_iterations)
            .with_seed(self.random_seed)
    }
}
