//! Residency Manifest
//!
//! Keys that were resident at shutdown with their last virtual size. Read at
//! startup purely as a fetch-order hint; nothing depends on it for correctness.

use std::fs;
use std::path::Path;

use mipstream_core::TextureKey;
use serde::{Deserialize, Serialize};

use crate::resource::BoostClass;
use crate::{CacheError, CacheResult};

/// Manifest format version
pub const MANIFEST_VERSION: u32 = 1;

/// One previously resident texture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub key: TextureKey,
    pub virtual_size: f32,
    #[serde(default)]
    pub boost: BoostClass,
}

/// Previously resident textures, largest first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Create a new manifest, sorted by descending virtual size
    pub fn new(mut entries: Vec<ManifestEntry>) -> Self {
        entries.sort_by(|a, b| b.virtual_size.total_cmp(&a.virtual_size));
        Self {
            version: MANIFEST_VERSION,
            entries,
        }
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the manifest lists nothing
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse a manifest from JSON
    pub fn from_json_str(json: &str) -> CacheResult<Self> {
        let manifest: Self = serde_json::from_str(json)?;
        if manifest.version != MANIFEST_VERSION {
            return Err(CacheError::Serialization(format!(
                "unsupported manifest version {}",
                manifest.version
            )));
        }
        Ok(manifest)
    }

    /// Serialize to pretty JSON
    pub fn to_json_string(&self) -> CacheResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the manifest to a file
    pub fn save(&self, path: &Path) -> CacheResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_json_string()?)?;
        log::debug!("Saved manifest with {} entries to {}", self.len(), path.display());
        Ok(())
    }

    /// Read a manifest file
    pub fn load(path: &Path) -> CacheResult<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Read a manifest file, logging and discarding any failure
    pub fn load_or_empty(path: &Path) -> Self {
        match Self::load(path) {
            Ok(manifest) => manifest,
            Err(err) => {
                log::warn!("Ignoring manifest {}: {}", path.display(), err);
                Self::new(Vec::new())
            }
        }
    }

    /// Total pixel area the manifest would request
    pub fn total_virtual_size(&self) -> f64 {
        self.entries.iter().map(|e| e.virtual_size as f64).sum()
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: u128, virtual_size: f32) -> ManifestEntry {
        ManifestEntry {
            key: TextureKey::from_u128(key),
            virtual_size,
            boost: BoostClass::Scene,
        }
    }

    #[test]
    fn test_sorted_largest_first() {
        let manifest = Manifest::new(vec![entry(1, 64.0), entry(2, 4096.0), entry(3, 256.0)]);
        let sizes: Vec<f32> = manifest.entries.iter().map(|e| e.virtual_size).collect();
        assert_eq!(sizes, vec![4096.0, 256.0, 64.0]);
        assert_eq!(manifest.total_virtual_size(), 4416.0);
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("mipstream-manifest-{}.json", std::process::id()));
        let manifest = Manifest::new(vec![entry(0xfeed, 1024.0)]);
        manifest.save(&path).unwrap();

        let loaded = Manifest::load(&path).unwrap();
        assert_eq!(loaded, manifest);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_keys_are_hex_strings() {
        let json = Manifest::new(vec![entry(0xab, 16.0)]).to_json_string().unwrap();
        assert!(json.contains("000000000000000000000000000000ab"));
    }

    #[test]
    fn test_bad_manifests() {
        assert!(Manifest::from_json_str("[]").is_err());
        assert!(Manifest::from_json_str(r#"{ "version": 99, "entries": [] }"#).is_err());

        let missing = std::env::temp_dir().join("mipstream-manifest-does-not-exist.json");
        assert!(Manifest::load_or_empty(&missing).is_empty());
    }
}
