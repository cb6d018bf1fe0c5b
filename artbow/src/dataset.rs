//! Labeled painting datasets.
//!
//! A dataset is a directory of images plus, per [ClassificationTarget], three
//! label tables in a separate directory:
//!
//! - `<target>_class.txt`: `<code> <class name>` per line,
//! - `<target>_train.csv` and `<target>_val.csv`: `<relative image path>,<code>` per line.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::iter::Peekable;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use image::{ImageError, RgbImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;
use crate::rng::DeterministicRng;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("failed to access {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}:{line}: {message}")]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("unknown class code {0}")]
    UnknownClassCode(u32),

    #[error("unknown classification target `{0}`")]
    UnknownTarget(String),

    #[error("index {path} is invalid")]
    Index {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("index {path} has no entry for {target}")]
    MissingTarget { path: PathBuf, target: ClassificationTarget },
}

/// Label space of a classification run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ClassificationTarget {
    Artist,
    Genre,
    Style,
}

impl ClassificationTarget {
    pub const ALL: [ClassificationTarget; 3] = [
        ClassificationTarget::Artist,
        ClassificationTarget::Genre,
        ClassificationTarget::Style,
    ];

    /// Lowercase name used in label file names.
    pub fn stem(&self) -> &'static str {
        match self {
            ClassificationTarget::Artist => "artist",
            ClassificationTarget::Genre => "genre",
            ClassificationTarget::Style => "style",
        }
    }

    /// Images per class kept by a balanced sub-index.
    pub fn default_subindex_size(&self) -> usize {
        match self {
            ClassificationTarget::Artist => 330,
            ClassificationTarget::Genre => 760,
            ClassificationTarget::Style => 280,
        }
    }

    pub fn class_file(&self, labels_dir: &Path) -> PathBuf {
        labels_dir.join(format!("{}_class.txt", self.stem()))
    }

    pub fn train_table(&self, labels_dir: &Path) -> PathBuf {
        labels_dir.join(format!("{}_train.csv", self.stem()))
    }

    pub fn validation_table(&self, labels_dir: &Path) -> PathBuf {
        labels_dir.join(format!("{}_val.csv", self.stem()))
    }
}

impl Display for ClassificationTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.stem())
    }
}

impl FromStr for ClassificationTarget {
    type Err = DatasetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|target| target.stem().eq_ignore_ascii_case(s))
            .ok_or_else(|| DatasetError::UnknownTarget(s.to_owned()))
    }
}

fn read_to_string(path: &Path) -> Result<String, DatasetError> {
    std::fs::read_to_string(path).map_err(|source| DatasetError::Io {
        path: path.to_owned(),
        source,
    })
}

/// Integer code to class name lookup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassEncoding {
    names: BTreeMap<u32, String>,
}

impl ClassEncoding {
    pub fn load(labels_dir: &Path, target: ClassificationTarget) -> Result<Self, DatasetError> {
        let path = target.class_file(labels_dir);
        Self::parse(&read_to_string(&path)?, &path)
    }

    pub fn parse(text: &str, path: &Path) -> Result<Self, DatasetError> {
        let mut names = BTreeMap::new();
        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let parse_error = |message: &str| DatasetError::Parse {
                path: path.to_owned(),
                line: number + 1,
                message: message.to_owned(),
            };
            let (code, name) = line
                .split_once(char::is_whitespace)
                .ok_or_else(|| parse_error("expected `<code> <class name>`"))?;
            let code = code.parse::<u32>().map_err(|_| parse_error("invalid class code"))?;
            names.insert(code, name.trim().to_owned());
        }
        Ok(Self { names })
    }

    pub fn decode(&self, code: u32) -> Result<&str, DatasetError> {
        self.names
            .get(&code)
            .map(String::as_str)
            .ok_or(DatasetError::UnknownClassCode(code))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl FromIterator<(u32, String)> for ClassEncoding {
    fn from_iter<I: IntoIterator<Item = (u32, String)>>(iter: I) -> Self {
        Self {
            names: iter.into_iter().collect(),
        }
    }
}

/// One row of a label table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledEntry {
    /// Image path relative to the dataset root.
    pub path: PathBuf,
    pub code: u32,
}

impl LabeledEntry {
    pub fn new(path: impl Into<PathBuf>, code: u32) -> Self {
        Self {
            path: path.into(),
            code,
        }
    }
}

pub fn load_label_table(path: &Path) -> Result<Vec<LabeledEntry>, DatasetError> {
    parse_label_table(&read_to_string(path)?, path)
}

pub fn parse_label_table(text: &str, path: &Path) -> Result<Vec<LabeledEntry>, DatasetError> {
    let mut entries = Vec::new();
    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parse_error = |message: &str| DatasetError::Parse {
            path: path.to_owned(),
            line: number + 1,
            message: message.to_owned(),
        };
        let (image, code) = line
            .rsplit_once(',')
            .ok_or_else(|| parse_error("expected `<path>,<code>`"))?;
        let code = code.trim().parse::<u32>().map_err(|_| parse_error("invalid class code"))?;
        entries.push(LabeledEntry::new(image.trim(), code));
    }
    Ok(entries)
}

/// Training image paths of every class.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassIndex {
    classes: BTreeMap<String, Vec<PathBuf>>,
}

impl ClassIndex {
    pub fn from_entries(entries: &[LabeledEntry], encoding: &ClassEncoding) -> Result<Self, DatasetError> {
        let mut classes: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
        for entry in entries {
            let class = encoding.decode(entry.code)?;
            classes.entry(class.to_owned()).or_default().push(entry.path.clone());
        }
        Ok(Self { classes })
    }

    pub fn load(labels_dir: &Path, target: ClassificationTarget, encoding: &ClassEncoding) -> Result<Self, DatasetError> {
        let entries = load_label_table(&target.train_table(labels_dir))?;
        Self::from_entries(&entries, encoding)
    }

    /// Classes in ascending order.
    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.classes.keys().map(String::as_str)
    }

    pub fn paths(&self, class: &str) -> &[PathBuf] {
        self.classes.get(class).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Number of images per class.
    pub fn distribution(&self) -> Vec<(String, usize)> {
        self.classes
            .iter()
            .map(|(class, paths)| (class.clone(), paths.len()))
            .collect()
    }

    /// Keeps `per_class` randomly chosen images of every class that has at
    /// least that many and drops the other classes.
    pub fn balanced(&self, per_class: usize, seed: u64) -> ClassIndex {
        let mut rng = DeterministicRng::new(seed);
        let classes = self
            .classes
            .iter()
            .filter(|(_, paths)| paths.len() >= per_class)
            .map(|(class, paths)| {
                let mut chosen = rand::seq::index::sample(rng.inner_mut(), paths.len(), per_class).into_vec();
                chosen.sort_unstable();
                (class.clone(), chosen.into_iter().map(|i| paths[i].clone()).collect())
            })
            .collect();
        ClassIndex { classes }
    }
}

/// Per-class image counts of a target's label tables, in class order.
///
/// Counts the training table, plus the validation table when
/// `include_validation` is set. A balanced sub-index is never consulted.
pub fn label_distribution(
    labels_dir: &Path,
    target: ClassificationTarget,
    include_validation: bool,
) -> Result<Vec<(String, usize)>, DatasetError> {
    let encoding = ClassEncoding::load(labels_dir, target)?;
    let mut entries = load_label_table(&target.train_table(labels_dir))?;
    if include_validation {
        entries.extend(load_label_table(&target.validation_table(labels_dir))?);
    }
    Ok(ClassIndex::from_entries(&entries, &encoding)?.distribution())
}

/// Balanced class indices of every target, stored as one JSON document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BalancedSubindex {
    targets: BTreeMap<ClassificationTarget, ClassIndex>,
}

impl BalancedSubindex {
    /// Samples every target's training index with its default class size.
    pub fn build(labels_dir: &Path, seed: u64) -> Result<Self, DatasetError> {
        let mut targets = BTreeMap::new();
        for target in ClassificationTarget::ALL {
            let encoding = ClassEncoding::load(labels_dir, target)?;
            let index = ClassIndex::load(labels_dir, target, &encoding)?;
            let balanced = index.balanced(target.default_subindex_size(), seed);
            debug!(classes = balanced.len(), of = index.len(), "balanced {target} index");
            targets.insert(target, balanced);
        }
        Ok(Self { targets })
    }

    pub fn insert(&mut self, target: ClassificationTarget, index: ClassIndex) {
        self.targets.insert(target, index);
    }

    pub fn get(&self, target: ClassificationTarget) -> Option<&ClassIndex> {
        self.targets.get(&target)
    }

    pub fn load(path: &Path) -> Result<Self, DatasetError> {
        let file = File::open(path).map_err(|source| DatasetError::Io {
            path: path.to_owned(),
            source,
        })?;
        serde_json::from_reader(BufReader::new(file)).map_err(|source| DatasetError::Index {
            path: path.to_owned(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), DatasetError> {
        let io_error = |source| DatasetError::Io {
            path: path.to_owned(),
            source,
        };
        let file = File::create(path).map_err(io_error)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, self).map_err(|source| DatasetError::Index {
            path: path.to_owned(),
            source,
        })?;
        writer.flush().map_err(io_error)
    }
}

/// Where images come from.
pub trait ImageSource {
    /// Decodes the image at `path` into RGB.
    fn load(&self, path: &Path) -> Result<RgbImage, ImageError>;

    /// Decoded size in bytes, ideally without decoding the pixels.
    fn estimated_size(&self, path: &Path) -> Result<u64, ImageError>;
}

impl<S: ImageSource + ?Sized> ImageSource for &S {
    fn load(&self, path: &Path) -> Result<RgbImage, ImageError> {
        (**self).load(path)
    }

    fn estimated_size(&self, path: &Path) -> Result<u64, ImageError> {
        (**self).estimated_size(path)
    }
}

/// Opens any supported image file as RGB.
pub fn load_rgb(path: &Path) -> Result<RgbImage, ImageError> {
    Ok(image::open(path)?.to_rgb8())
}

/// Images stored below a root directory.
#[derive(Debug, Clone)]
pub struct DatasetImages {
    root: PathBuf,
}

impl DatasetImages {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ImageSource for DatasetImages {
    fn load(&self, path: &Path) -> Result<RgbImage, ImageError> {
        load_rgb(&self.root.join(path))
    }

    fn estimated_size(&self, path: &Path) -> Result<u64, ImageError> {
        let (width, height) = image::image_dimensions(self.root.join(path))?;
        Ok(u64::from(width) * u64::from(height) * 3)
    }
}

/// In-memory images keyed by path.
#[derive(Debug, Clone, Default)]
pub struct MemoryImages {
    images: HashMap<PathBuf, RgbImage>,
}

impl MemoryImages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>, image: RgbImage) {
        self.images.insert(path.into(), image);
    }

    fn get(&self, path: &Path) -> Result<&RgbImage, ImageError> {
        self.images.get(path).ok_or_else(|| {
            ImageError::IoError(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} not found", path.display()),
            ))
        })
    }
}

impl ImageSource for MemoryImages {
    fn load(&self, path: &Path) -> Result<RgbImage, ImageError> {
        self.get(path).cloned()
    }

    fn estimated_size(&self, path: &Path) -> Result<u64, ImageError> {
        let (width, height) = self.get(path)?.dimensions();
        Ok(u64::from(width) * u64::from(height) * 3)
    }
}

/// Lazily loads the training images of one target, class by class, in batches.
///
/// The loader owns the class index and encoding of its target. Every call to
/// [BatchLoader::classes] starts a new, independent traversal.
#[derive(Debug, Clone)]
pub struct BatchLoader<S = DatasetImages> {
    target: ClassificationTarget,
    encoding: ClassEncoding,
    index: ClassIndex,
    images: S,
    budget: u64,
}

impl BatchLoader<DatasetImages> {
    /// Reads the label tables of `target`, preferring the configured balanced sub-index.
    pub fn open(config: &Config, target: ClassificationTarget) -> Result<Self, DatasetError> {
        let labels = &config.dataset_labels_path;
        let encoding = ClassEncoding::load(labels, target)?;
        let index = match &config.index_path {
            Some(path) if path.exists() => {
                debug!(path = %path.display(), "using balanced index");
                BalancedSubindex::load(path)?
                    .get(target)
                    .cloned()
                    .ok_or_else(|| DatasetError::MissingTarget {
                        path: path.clone(),
                        target,
                    })?
            }
            _ => ClassIndex::load(labels, target, &encoding)?,
        };
        Ok(Self::new(
            target,
            encoding,
            index,
            DatasetImages::new(&config.dataset_path),
            config.batch_size.bytes(),
        ))
    }
}

impl<S: ImageSource> BatchLoader<S> {
    pub fn new(target: ClassificationTarget, encoding: ClassEncoding, index: ClassIndex, images: S, budget: u64) -> Self {
        Self {
            target,
            encoding,
            index,
            images,
            budget,
        }
    }

    pub fn target(&self) -> ClassificationTarget {
        self.target
    }

    pub fn encoding(&self) -> &ClassEncoding {
        &self.encoding
    }

    pub fn index(&self) -> &ClassIndex {
        &self.index
    }

    pub fn images(&self) -> &S {
        &self.images
    }

    /// One batch sequence per class, in class order.
    pub fn classes(&self) -> impl Iterator<Item = ClassBatches<'_, S>> + '_ {
        self.index.classes.iter().map(move |(class, paths)| ClassBatches {
            class,
            paths: paths.iter().peekable(),
            images: &self.images,
            budget: self.budget,
        })
    }

    /// Rounds made of the i-th batch of every class.
    pub fn interleaved_batches(&self) -> Interleaved<'_, S> {
        Interleaved {
            classes: self.classes().collect(),
        }
    }
}

/// Batches of one class's images.
pub struct ClassBatches<'a, S> {
    class: &'a str,
    paths: Peekable<std::slice::Iter<'a, PathBuf>>,
    images: &'a S,
    budget: u64,
}

impl<'a, S> ClassBatches<'a, S> {
    pub fn class(&self) -> &'a str {
        self.class
    }
}

impl<'a, S: ImageSource> Iterator for ClassBatches<'a, S> {
    type Item = Vec<RgbImage>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut batch = Vec::new();
        let mut used = 0u64;

        loop {
            let path: &'a PathBuf = match self.paths.peek() {
                Some(&path) => path,
                None => break,
            };

            let estimate = match self.images.estimated_size(path) {
                Ok(estimate) => estimate,
                Err(err) => {
                    warn!(class = self.class, path = %path.display(), %err, "skipping unreadable image");
                    self.paths.next();
                    continue;
                }
            };
            // A batch always takes at least one image, however large.
            if !batch.is_empty() && used + estimate > self.budget {
                break;
            }
            self.paths.next();

            match self.images.load(path) {
                Ok(image) => {
                    used += estimate;
                    batch.push(image);
                }
                Err(err) => {
                    warn!(class = self.class, path = %path.display(), %err, "skipping unreadable image");
                }
            }
        }

        if batch.is_empty() {
            None
        } else {
            debug!(class = self.class, images = batch.len(), bytes = used, "loaded batch");
            Some(batch)
        }
    }
}

/// Joins the next batch of every class into one round.
pub struct Interleaved<'a, S> {
    classes: Vec<ClassBatches<'a, S>>,
}

impl<'a, S: ImageSource> Iterator for Interleaved<'a, S> {
    type Item = Vec<RgbImage>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut round = Vec::new();
        self.classes.retain_mut(|class| match class.next() {
            Some(batch) => {
                round.extend(batch);
                true
            }
            None => false,
        });

        if round.is_empty() {
            None
        } else {
            Some(round)
        }
    }
}
