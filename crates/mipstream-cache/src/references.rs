//! Reference Table
//!
//! Relation from texture keys to the surfaces and volumes currently drawing
//! them. Lookup only: an entry never keeps a surface or a texture alive.

use ahash::AHashMap;
use mipstream_core::TextureKey;
use smallvec::SmallVec;

/// A consumer of a texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConsumerId {
    /// Renderable face of a scene surface
    Face(u64),
    /// Volumetric or displacement consumer
    Volume(u64),
}

impl ConsumerId {
    /// Whether this consumer is a volume
    pub fn is_volume(&self) -> bool {
        matches!(self, Self::Volume(_))
    }
}

/// Most textures are drawn by only a handful of faces
type ConsumerSet = SmallVec<[ConsumerId; 4]>;

/// Key to consumer-set relation
#[derive(Debug, Default)]
pub struct ReferenceTable {
    entries: AHashMap<TextureKey, ConsumerSet>,
}

impl ReferenceTable {
    /// Create a new empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a consumer; returns true if the set was previously empty
    pub fn add(&mut self, key: TextureKey, consumer: ConsumerId) -> bool {
        let set = self.entries.entry(key).or_default();
        let was_empty = set.is_empty();
        if !set.contains(&consumer) {
            set.push(consumer);
        }
        was_empty
    }

    /// Remove a consumer; returns true if the set just became empty
    pub fn remove(&mut self, key: TextureKey, consumer: ConsumerId) -> bool {
        let Some(set) = self.entries.get_mut(&key) else {
            return false;
        };
        let Some(index) = set.iter().position(|c| *c == consumer) else {
            return false;
        };
        set.swap_remove(index);
        if set.is_empty() {
            self.entries.remove(&key);
            true
        } else {
            false
        }
    }

    /// Number of consumers of a key
    pub fn count(&self, key: TextureKey) -> usize {
        self.entries.get(&key).map(|s| s.len()).unwrap_or(0)
    }

    /// Whether anything references the key
    pub fn is_referenced(&self, key: TextureKey) -> bool {
        self.count(key) > 0
    }

    /// Consumers of a key
    pub fn consumers(&self, key: TextureKey) -> &[ConsumerId] {
        self.entries.get(&key).map(|s| s.as_slice()).unwrap_or(&[])
    }

    /// Faces referencing a key
    pub fn faces(&self, key: TextureKey) -> impl Iterator<Item = u64> + '_ {
        self.consumers(key).iter().filter_map(|c| match c {
            ConsumerId::Face(id) => Some(*id),
            ConsumerId::Volume(_) => None,
        })
    }

    /// Volumes referencing a key
    pub fn volumes(&self, key: TextureKey) -> impl Iterator<Item = u64> + '_ {
        self.consumers(key).iter().filter_map(|c| match c {
            ConsumerId::Volume(id) => Some(*id),
            ConsumerId::Face(_) => None,
        })
    }

    /// Number of referenced keys
    pub fn referenced_keys(&self) -> usize {
        self.entries.len()
    }
}
