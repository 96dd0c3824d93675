//! Simulated Collaborators
//!
//! In-memory transport, codec and GPU used by tests, benchmarks and the
//! command line simulator.
//!
//! The synthetic wire format is a 16-byte header followed by tightly packed
//! pixels at the requested level:
//!
//! | offset | size | field |
//! |---|---|---|
//! | 0 | 4 | magic `SYNT` |
//! | 4 | 4 | full width, little endian |
//! | 8 | 4 | full height, little endian |
//! | 12 | 1 | components |
//! | 13 | 1 | discard level |
//! | 14 | 1 | source (0 network, 1 local) |
//! | 15 | 1 | reserved |

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use ahash::AHashMap;
use mipstream_core::TextureKey;
use mipstream_core::math::{discard_dimension, max_discard_for};
use parking_lot::Mutex;

use crate::backend::{Codec, GpuDevice, GpuHandle, ImageSource, RawImage, Transport, UploadImage};
use crate::{CacheError, CacheResult};

const MAGIC: &[u8; 4] = b"SYNT";
const HEADER_LEN: usize = 16;

/// Failure a transport script injects into the next fetch of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedFailure {
    NotFound,
    Transient,
    /// Deliver bytes the codec rejects
    CorruptBytes,
}

#[derive(Debug, Clone, Copy)]
struct CatalogEntry {
    full_width: u32,
    full_height: u32,
    components: u8,
    source: ImageSource,
}

#[derive(Debug, Default)]
struct TransportState {
    catalog: AHashMap<TextureKey, CatalogEntry>,
    scripts: AHashMap<TextureKey, VecDeque<ScriptedFailure>>,
    always_corrupt: Vec<TextureKey>,
    latency: Duration,
    requests: Vec<(TextureKey, u8)>,
    cancelled: Vec<TextureKey>,
}

/// Transport serving generated textures from an in-memory catalog
///
/// Clones share the catalog, so a test can keep a handle for scripting while
/// the cache owns another.
#[derive(Debug, Clone, Default)]
pub struct SyntheticTransport {
    state: Arc<Mutex<TransportState>>,
}

impl SyntheticTransport {
    /// Create a new empty transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a network texture
    pub fn insert(&self, key: TextureKey, full_width: u32, full_height: u32, components: u8) {
        self.insert_with_source(key, full_width, full_height, components, ImageSource::Network);
    }

    /// Add a locally produced texture, which may have any dimensions
    pub fn insert_local(&self, key: TextureKey, full_width: u32, full_height: u32, components: u8) {
        self.insert_with_source(key, full_width, full_height, components, ImageSource::Local);
    }

    fn insert_with_source(
        &self,
        key: TextureKey,
        full_width: u32,
        full_height: u32,
        components: u8,
        source: ImageSource,
    ) {
        self.state.lock().catalog.insert(
            key,
            CatalogEntry {
                full_width,
                full_height,
                components,
                source,
            },
        );
    }

    /// Queue failures for the next fetches of `key`
    pub fn script(&self, key: TextureKey, failures: impl IntoIterator<Item = ScriptedFailure>) {
        self.state
            .lock()
            .scripts
            .entry(key)
            .or_default()
            .extend(failures);
    }

    /// Deliver undecodable bytes for every fetch of `key`
    pub fn corrupt_forever(&self, key: TextureKey) {
        self.state.lock().always_corrupt.push(key);
    }

    /// Sleep this long inside every fetch
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Every request so far, in order
    pub fn requests(&self) -> Vec<(TextureKey, u8)> {
        self.state.lock().requests.clone()
    }

    /// Number of requests for one key
    pub fn request_count(&self, key: TextureKey) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|(k, _)| *k == key)
            .count()
    }

    /// Keys that received an advisory cancel
    pub fn cancelled(&self) -> Vec<TextureKey> {
        self.state.lock().cancelled.clone()
    }
}

impl Transport for SyntheticTransport {
    fn fetch(&self, key: TextureKey, level: u8) -> CacheResult<Vec<u8>> {
        let (entry, scripted, corrupt, latency) = {
            let mut state = self.state.lock();
            state.requests.push((key, level));
            let scripted = state.scripts.get_mut(&key).and_then(|s| s.pop_front());
            let corrupt = state.always_corrupt.contains(&key);
            (state.catalog.get(&key).copied(), scripted, corrupt, state.latency)
        };

        if !latency.is_zero() {
            thread::sleep(latency);
        }

        match scripted {
            Some(ScriptedFailure::NotFound) => return Err(CacheError::NotFound(key)),
            Some(ScriptedFailure::Transient) => {
                return Err(CacheError::Transient("connection reset".to_string()));
            }
            Some(ScriptedFailure::CorruptBytes) => return Ok(b"garbage".to_vec()),
            None => {}
        }
        if corrupt {
            return Ok(b"garbage".to_vec());
        }

        let entry = entry.ok_or(CacheError::NotFound(key))?;
        Ok(SyntheticCodec::encode(
            entry.full_width,
            entry.full_height,
            entry.components,
            level,
            entry.source,
            key.value() as u8,
        ))
    }

    fn cancel(&self, key: TextureKey) {
        self.state.lock().cancelled.push(key);
    }
}

/// Codec for the synthetic wire format
#[derive(Debug, Clone, Copy, Default)]
pub struct SyntheticCodec;

impl SyntheticCodec {
    /// Encode a generated texture at `level`
    ///
    /// The level is clamped to the deepest one the dimensions allow.
    pub fn encode(
        full_width: u32,
        full_height: u32,
        components: u8,
        level: u8,
        source: ImageSource,
        seed: u8,
    ) -> Vec<u8> {
        let level = level.min(max_discard_for(full_width, full_height));
        let width = discard_dimension(full_width, level);
        let height = discard_dimension(full_height, level);

        let mut bytes = Vec::with_capacity(HEADER_LEN + (width * height * components as u32) as usize);
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&full_width.to_le_bytes());
        bytes.extend_from_slice(&full_height.to_le_bytes());
        bytes.push(components);
        bytes.push(level);
        bytes.push(match source {
            ImageSource::Network => 0,
            ImageSource::Local => 1,
        });
        bytes.push(0);

        for y in 0..height {
            for x in 0..width {
                let value = (x ^ y) as u8 ^ seed;
                for _ in 0..components {
                    bytes.push(value);
                }
            }
        }
        bytes
    }

    /// Generated network image at `level`
    pub fn image(full_width: u32, full_height: u32, components: u8, level: u8) -> RawImage {
        let level = level.min(max_discard_for(full_width, full_height));
        let bytes = Self::encode(full_width, full_height, components, level, ImageSource::Network, 0);
        RawImage {
            width: discard_dimension(full_width, level),
            height: discard_dimension(full_height, level),
            components,
            discard_level: level,
            full_width,
            full_height,
            source: ImageSource::Network,
            data: bytes[HEADER_LEN..].to_vec(),
        }
    }
}

impl Codec for SyntheticCodec {
    fn decode(&self, bytes: &[u8], _level: u8) -> CacheResult<RawImage> {
        if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
            return Err(CacheError::Corrupt("missing synthetic header".to_string()));
        }
        let word = |offset: usize| {
            u32::from_le_bytes([
                bytes[offset],
                bytes[offset + 1],
                bytes[offset + 2],
                bytes[offset + 3],
            ])
        };
        let full_width = word(4);
        let full_height = word(8);
        let components = bytes[12];
        let level = bytes[13];
        let source = match bytes[14] {
            0 => ImageSource::Network,
            1 => ImageSource::Local,
            other => {
                return Err(CacheError::Corrupt(format!("unknown source tag {}", other)));
            }
        };

        let width = discard_dimension(full_width, level);
        let height = discard_dimension(full_height, level);
        let image = RawImage {
            width,
            height,
            components,
            discard_level: level,
            full_width,
            full_height,
            source,
            data: bytes[HEADER_LEN..].to_vec(),
        };
        if image.data.len() != image.expected_len() {
            return Err(CacheError::Corrupt(format!(
                "expected {} pixel bytes, got {}",
                image.expected_len(),
                image.data.len()
            )));
        }
        Ok(image)
    }
}

#[derive(Debug)]
struct GpuState {
    owner: ThreadId,
    next_handle: u64,
    live: AHashMap<GpuHandle, u64>,
    uploads: u64,
    frees: u64,
    unknown_frees: u64,
    off_thread_calls: u64,
    ceiling: Option<u64>,
    fail_uploads: bool,
}

/// GPU that records allocations instead of talking to a driver
///
/// Calls from any thread other than the one that created it are rejected
/// and counted.
#[derive(Debug, Clone)]
pub struct RecordingGpu {
    state: Arc<Mutex<GpuState>>,
}

impl RecordingGpu {
    /// Create a new device owned by the calling thread
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(GpuState {
                owner: thread::current().id(),
                next_handle: 1,
                live: AHashMap::new(),
                uploads: 0,
                frees: 0,
                unknown_frees: 0,
                off_thread_calls: 0,
                ceiling: None,
                fail_uploads: false,
            })),
        }
    }

    /// Device that reports a memory ceiling
    pub fn with_ceiling(ceiling: u64) -> Self {
        let gpu = Self::new();
        gpu.state.lock().ceiling = Some(ceiling);
        gpu
    }

    /// Make every upload fail
    pub fn set_fail_uploads(&self, fail: bool) {
        self.state.lock().fail_uploads = fail;
    }

    /// Bytes held by live textures
    pub fn live_bytes(&self) -> u64 {
        self.state.lock().live.values().sum()
    }

    /// Number of live textures
    pub fn live_handles(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Whether a handle refers to a live texture
    pub fn is_live(&self, handle: GpuHandle) -> bool {
        self.state.lock().live.contains_key(&handle)
    }

    /// Successful uploads
    pub fn uploads(&self) -> u64 {
        self.state.lock().uploads
    }

    /// Successful frees
    pub fn frees(&self) -> u64 {
        self.state.lock().frees
    }

    /// Frees of handles that were not live
    pub fn unknown_frees(&self) -> u64 {
        self.state.lock().unknown_frees
    }

    /// Calls rejected for coming from the wrong thread
    pub fn off_thread_calls(&self) -> u64 {
        self.state.lock().off_thread_calls
    }
}

impl Default for RecordingGpu {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDevice for RecordingGpu {
    fn upload(&mut self, image: &UploadImage) -> CacheResult<GpuHandle> {
        let mut state = self.state.lock();
        if thread::current().id() != state.owner {
            state.off_thread_calls += 1;
            return Err(CacheError::Unsupported("upload off the render thread".to_string()));
        }
        if state.fail_uploads {
            return Err(CacheError::Transient("device lost".to_string()));
        }
        let handle = GpuHandle(state.next_handle);
        state.next_handle += 1;
        state.live.insert(handle, image.byte_len());
        state.uploads += 1;
        Ok(handle)
    }

    fn free(&mut self, handle: GpuHandle) {
        let mut state = self.state.lock();
        if thread::current().id() != state.owner {
            state.off_thread_calls += 1;
            return;
        }
        if state.live.remove(&handle).is_some() {
            state.frees += 1;
        } else {
            state.unknown_frees += 1;
            log::warn!("free of unknown texture {:?}", handle);
        }
    }

    fn memory_ceiling(&self) -> Option<u64> {
        self.state.lock().ceiling
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PixelFormat;

    #[test]
    fn test_encode_decode() {
        let bytes = SyntheticCodec::encode(256, 128, 3, 2, ImageSource::Network, 5);
        let image = SyntheticCodec.decode(&bytes, 2).unwrap();
        assert_eq!((image.width, image.height), (64, 32));
        assert_eq!((image.full_width, image.full_height), (256, 128));
        assert_eq!(image.discard_level, 2);
        assert_eq!(image.data.len(), 64 * 32 * 3);
    }

    #[test]
    fn test_level_is_clamped() {
        let image = SyntheticCodec::image(4, 4, 1, 9);
        assert_eq!(image.discard_level, 2);
        assert_eq!((image.width, image.height), (1, 1));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(SyntheticCodec.decode(b"garbage", 0), Err(CacheError::Corrupt(_))));

        let mut bytes = SyntheticCodec::encode(8, 8, 4, 0, ImageSource::Network, 0);
        bytes.truncate(bytes.len() - 1);
        assert!(matches!(SyntheticCodec.decode(&bytes, 0), Err(CacheError::Corrupt(_))));
    }

    #[test]
    fn test_transport_scripts() {
        let transport = SyntheticTransport::new();
        let key = TextureKey::from_u128(1);
        transport.insert(key, 16, 16, 4);
        transport.script(key, [ScriptedFailure::Transient, ScriptedFailure::NotFound]);

        assert!(matches!(transport.fetch(key, 0), Err(CacheError::Transient(_))));
        assert!(matches!(transport.fetch(key, 0), Err(CacheError::NotFound(_))));
        assert!(transport.fetch(key, 0).is_ok());
        assert_eq!(transport.request_count(key), 3);

        assert!(matches!(
            transport.fetch(TextureKey::from_u128(2), 0),
            Err(CacheError::NotFound(_))
        ));
    }

    #[test]
    fn test_recording_gpu() {
        let mut gpu = RecordingGpu::with_ceiling(1024);
        let image = UploadImage {
            key: TextureKey::from_u128(1),
            width: 4,
            height: 4,
            format: PixelFormat::Rgba8,
            discard_level: 0,
            padded: false,
            data: vec![0; 64],
        };

        let handle = gpu.upload(&image).unwrap();
        assert!(gpu.is_live(handle));
        assert_eq!(gpu.live_bytes(), 64);
        assert_eq!(gpu.memory_ceiling(), Some(1024));

        gpu.free(handle);
        gpu.free(handle);
        assert_eq!(gpu.frees(), 1);
        assert_eq!(gpu.unknown_frees(), 1);
        assert_eq!(gpu.live_bytes(), 0);
    }

    #[test]
    fn test_recording_gpu_rejects_other_threads() {
        let gpu = RecordingGpu::new();
        let mut remote = gpu.clone();
        let image = UploadImage {
            key: TextureKey::from_u128(1),
            width: 1,
            height: 1,
            format: PixelFormat::R8,
            discard_level: 0,
            padded: false,
            data: vec![0],
        };
        let result = thread::spawn(move || remote.upload(&image).is_err()).join().unwrap();
        assert!(result);
        assert_eq!(gpu.off_thread_calls(), 1);
    }
}
