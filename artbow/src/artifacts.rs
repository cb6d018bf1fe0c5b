//! Persistence of trained palettes and profiles.
//!
//! Artifacts are opaque byte blobs addressed by `/`-separated keys such as
//! `palettes/0` or `loc_palettes/Cubism`. Typed values go through
//! [ArtifactStoreExt], which stores them as JSON.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact `{0}` was never stored")]
    Missing(String),

    #[error("invalid artifact key `{0}`")]
    InvalidKey(String),

    #[error("failed to access artifact `{key}`")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("artifact `{key}` is not valid JSON")]
    Json {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

pub trait ArtifactStore {
    fn put(&mut self, key: &str, bytes: &[u8]) -> Result<(), ArtifactError>;

    /// Fails with [ArtifactError::Missing] when nothing was stored under `key`.
    fn get(&self, key: &str) -> Result<Vec<u8>, ArtifactError>;
}

impl<A: ArtifactStore + ?Sized> ArtifactStore for &mut A {
    fn put(&mut self, key: &str, bytes: &[u8]) -> Result<(), ArtifactError> {
        (**self).put(key, bytes)
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, ArtifactError> {
        (**self).get(key)
    }
}

/// JSON helpers available on every store.
pub trait ArtifactStoreExt: ArtifactStore {
    fn put_json<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<(), ArtifactError> {
        let bytes = serde_json::to_vec(value).map_err(|source| ArtifactError::Json {
            key: key.to_owned(),
            source,
        })?;
        self.put(key, &bytes)
    }

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<T, ArtifactError> {
        let bytes = self.get(key)?;
        serde_json::from_slice(&bytes).map_err(|source| ArtifactError::Json {
            key: key.to_owned(),
            source,
        })
    }
}

impl<A: ArtifactStore + ?Sized> ArtifactStoreExt for A {}

fn validate_key(key: &str) -> Result<(), ArtifactError> {
    let valid = !key.is_empty()
        && key
            .split('/')
            .all(|part| !part.is_empty() && part != "." && part != ".." && !part.contains('\\'));
    if valid {
        Ok(())
    } else {
        Err(ArtifactError::InvalidKey(key.to_owned()))
    }
}

/// One file per key below a root directory.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &str) -> Result<PathBuf, ArtifactError> {
        validate_key(key)?;
        Ok(self.root.join(format!("{key}.json")))
    }
}

impl ArtifactStore for FsArtifactStore {
    fn put(&mut self, key: &str, bytes: &[u8]) -> Result<(), ArtifactError> {
        let path = self.path(key)?;
        let io_error = |source| ArtifactError::Io {
            key: key.to_owned(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }

        let file = File::create(&path).map_err(io_error)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(bytes).map_err(io_error)?;
        writer.flush().map_err(io_error)?;
        debug!(key, path = %path.display(), bytes = bytes.len(), "stored artifact");
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, ArtifactError> {
        let path = self.path(key)?;
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Err(ArtifactError::Missing(key.to_owned())),
            Err(source) => {
                return Err(ArtifactError::Io {
                    key: key.to_owned(),
                    source,
                })
            }
        };
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).map_err(|source| ArtifactError::Io {
            key: key.to_owned(),
            source,
        })?;
        Ok(bytes)
    }
}

/// Keeps artifacts in memory only.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    artifacts: HashMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.artifacts.contains_key(key)
    }
}

impl ArtifactStore for MemoryStore {
    fn put(&mut self, key: &str, bytes: &[u8]) -> Result<(), ArtifactError> {
        validate_key(key)?;
        self.artifacts.insert(key.to_owned(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, ArtifactError> {
        self.artifacts
            .get(key)
            .cloned()
            .ok_or_else(|| ArtifactError::Missing(key.to_owned()))
    }
}
