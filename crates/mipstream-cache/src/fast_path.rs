//! Fast-Path Loader
//!
//! Small pre-decoded snapshots kept on disk so a texture can show a coarse
//! first appearance before the transport has delivered anything.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use mipstream_core::TextureKey;
use serde::{Deserialize, Serialize};

use crate::backend::RawImage;
use crate::config::FastPathConfig;
use crate::{CacheError, CacheResult};

/// Snapshot file format version
pub const SNAPSHOT_VERSION: u32 = 1;

/// On-disk snapshot record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub key: TextureKey,
    pub image: RawImage,
}

/// Reads and writes texture snapshots in a directory
#[derive(Debug, Clone)]
pub struct FastPathLoader {
    dir: PathBuf,
    max_snapshot_edge: u32,
}

impl FastPathLoader {
    /// Create a new loader rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>, max_snapshot_edge: u32) -> Self {
        Self {
            dir: dir.into(),
            max_snapshot_edge,
        }
    }

    /// Loader from configuration
    pub fn from_config(config: &FastPathConfig) -> Self {
        Self::new(config.dir.clone(), config.max_snapshot_edge)
    }

    /// Snapshot directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the snapshot for a key
    pub fn path_for(&self, key: TextureKey) -> PathBuf {
        self.dir.join(format!("{}.snap", key))
    }

    /// Whether an image is small enough to snapshot
    pub fn fits(&self, image: &RawImage) -> bool {
        image.width <= self.max_snapshot_edge && image.height <= self.max_snapshot_edge
    }

    /// Load the snapshot for `key`, if one exists
    pub fn load(&self, key: TextureKey) -> CacheResult<Option<RawImage>> {
        let bytes = match fs::read(self.path_for(key)) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let snapshot: Snapshot = bincode::deserialize(&bytes)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(CacheError::Corrupt(format!(
                "snapshot version {} for {}",
                snapshot.version, key
            )));
        }
        if snapshot.key != key {
            return Err(CacheError::Corrupt(format!(
                "snapshot for {} holds {}",
                key, snapshot.key
            )));
        }
        if snapshot.image.data.len() != snapshot.image.expected_len() {
            return Err(CacheError::Corrupt(format!("truncated snapshot for {}", key)));
        }
        Ok(Some(snapshot.image))
    }

    /// Write a snapshot; returns false when the image is too large
    pub fn store(&self, key: TextureKey, image: &RawImage) -> CacheResult<bool> {
        if !self.fits(image) {
            return Ok(false);
        }
        fs::create_dir_all(&self.dir)?;

        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            key,
            image: image.clone(),
        };
        let bytes = bincode::serialize(&snapshot)?;

        // Write then rename so readers never see a partial file
        let path = self.path_for(key);
        let partial = path.with_extension("snap.partial");
        fs::write(&partial, bytes)?;
        fs::rename(&partial, &path)?;

        log::trace!("Stored snapshot {}", path.display());
        Ok(true)
    }
}
