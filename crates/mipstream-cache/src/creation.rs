//! Creation Pipeline
//!
//! Decoded pixels become GPU textures in two phases. Assembly (validation,
//! layout, power-of-two padding) is pure CPU work and may run on a dedicated
//! worker. Finalization calls the [`GpuDevice`] and only ever happens on the
//! thread that owns the scheduler.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender, bounded};
use mipstream_core::math::is_power_of_two;
use mipstream_core::time::RollingAverage;
use mipstream_core::{MemoryStats, TextureKey};

use crate::backend::{AccountingEvent, GpuDevice, ImageSource, PixelFormat, RawImage, UploadImage};
use crate::resource::GpuPayload;
use crate::{CacheError, CacheResult};

/// Depth of the assembly handoff queues
const HANDOFF_CAPACITY: usize = 64;
/// Uploads averaged for the per-upload cost estimate
const UPLOAD_COST_WINDOW: usize = 32;

/// Identifies one creation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CreationTicket(pub u64);

/// Validation limits for assembly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreationLimits {
    pub max_texture_size: u32,
}

/// Assembly output waiting for finalization
#[derive(Debug)]
pub struct Assembled {
    pub key: TextureKey,
    pub ticket: CreationTicket,
    pub result: CacheResult<UploadImage>,
}

/// Callback invoked on every GPU allocation and free
pub type AccountingCallback = Box<dyn Fn(AccountingEvent)>;

/// Validate a decoded image and lay it out for upload
///
/// Locally produced images with non-power-of-two dimensions are padded by
/// replicating their last row and column. Network images must already be
/// powers of two.
pub fn assemble(key: TextureKey, image: RawImage, limits: CreationLimits) -> CacheResult<UploadImage> {
    let format = PixelFormat::from_components(image.components)?;

    if image.width == 0 || image.height == 0 {
        return Err(CacheError::Corrupt(format!("{} has an empty image", key)));
    }
    if image.data.len() != image.expected_len() {
        return Err(CacheError::Corrupt(format!(
            "{} carries {} bytes for a {}x{}x{} image",
            key,
            image.data.len(),
            image.width,
            image.height,
            image.components
        )));
    }
    if image.width > limits.max_texture_size || image.height > limits.max_texture_size {
        return Err(CacheError::Unsupported(format!(
            "{} is {}x{}, larger than {}",
            key, image.width, image.height, limits.max_texture_size
        )));
    }

    let power_of_two = is_power_of_two(image.width) && is_power_of_two(image.height);
    if power_of_two {
        return Ok(UploadImage {
            key,
            width: image.width,
            height: image.height,
            format,
            discard_level: image.discard_level,
            padded: false,
            data: image.data,
        });
    }

    if image.source != ImageSource::Local {
        return Err(CacheError::Unsupported(format!(
            "{} is {}x{}, not a power of two",
            key, image.width, image.height
        )));
    }

    let width = image.width.next_power_of_two();
    let height = image.height.next_power_of_two();
    if width > limits.max_texture_size || height > limits.max_texture_size {
        return Err(CacheError::Unsupported(format!(
            "{} pads to {}x{}, larger than {}",
            key, width, height, limits.max_texture_size
        )));
    }

    Ok(UploadImage {
        key,
        width,
        height,
        format,
        discard_level: image.discard_level,
        padded: true,
        data: pad_edges(&image, width, height),
    })
}

/// Expand to `width` x `height` by repeating the last column and row
fn pad_edges(image: &RawImage, width: u32, height: u32) -> Vec<u8> {
    let bpp = image.components as usize;
    let src_row = image.width as usize * bpp;
    let dst_row = width as usize * bpp;
    let mut data = Vec::with_capacity(dst_row * height as usize);

    for y in 0..height as usize {
        let sy = y.min(image.height as usize - 1);
        let row = &image.data[sy * src_row..(sy + 1) * src_row];
        data.extend_from_slice(row);
        let last = &row[src_row - bpp..];
        for _ in image.width as usize..width as usize {
            data.extend_from_slice(last);
        }
    }
    data
}

struct AssemblyJob {
    key: TextureKey,
    ticket: CreationTicket,
    image: RawImage,
}

/// Dedicated assembly thread with a single-producer handoff each way
struct AssemblyWorker {
    jobs: Option<Sender<AssemblyJob>>,
    ready: Receiver<Assembled>,
    thread: Option<JoinHandle<()>>,
}

impl AssemblyWorker {
    fn spawn(limits: CreationLimits) -> std::io::Result<Self> {
        let (job_tx, job_rx) = bounded::<AssemblyJob>(HANDOFF_CAPACITY);
        let (ready_tx, ready_rx) = bounded::<Assembled>(HANDOFF_CAPACITY);

        let thread = thread::Builder::new()
            .name("mipstream-assembly".to_string())
            .spawn(move || {
                for job in job_rx.iter() {
                    let result = assemble(job.key, job.image, limits);
                    let assembled = Assembled {
                        key: job.key,
                        ticket: job.ticket,
                        result,
                    };
                    if ready_tx.send(assembled).is_err() {
                        break;
                    }
                }
            })?;

        Ok(Self {
            jobs: Some(job_tx),
            ready: ready_rx,
            thread: Some(thread),
        })
    }
}

impl Drop for AssemblyWorker {
    fn drop(&mut self) {
        drop(self.jobs.take());
        if let Some(thread) = self.thread.take() {
            // Keep the ready queue moving so the worker can drain its jobs
            while !thread.is_finished() {
                while self.ready.try_recv().is_ok() {}
                thread::yield_now();
            }
            let _ = thread.join();
        }
    }
}

/// Assembly handoff plus render-thread finalization
pub struct CreationPipeline {
    limits: CreationLimits,
    worker: Option<AssemblyWorker>,
    local_ready: VecDeque<Assembled>,
    outstanding: usize,
    next_ticket: u64,
    memory: Arc<MemoryStats>,
    upload_cost: RollingAverage,
    accounting: Option<AccountingCallback>,
    created: u64,
    released: u64,
}

impl CreationPipeline {
    /// Create a new pipeline
    ///
    /// With `threaded` set, assembly runs on its own thread. If that thread
    /// cannot be spawned the pipeline assembles inline.
    pub fn new(limits: CreationLimits, memory: Arc<MemoryStats>, threaded: bool) -> Self {
        let worker = if threaded {
            match AssemblyWorker::spawn(limits) {
                Ok(worker) => Some(worker),
                Err(err) => {
                    log::error!("failed to spawn assembly worker: {}", err);
                    None
                }
            }
        } else {
            None
        };

        Self {
            limits,
            worker,
            local_ready: VecDeque::new(),
            outstanding: 0,
            next_ticket: 1,
            memory,
            upload_cost: RollingAverage::new(UPLOAD_COST_WINDOW),
            accounting: None,
            created: 0,
            released: 0,
        }
    }

    /// Whether assembly runs on a worker thread
    pub fn is_threaded(&self) -> bool {
        self.worker.is_some()
    }

    /// Whether another job can be handed off without blocking
    pub fn has_capacity(&self) -> bool {
        match &self.worker {
            Some(worker) => worker.jobs.as_ref().is_some_and(|jobs| !jobs.is_full()),
            None => true,
        }
    }

    /// Install the allocation/free callback
    pub fn set_accounting_callback(&mut self, callback: AccountingCallback) {
        self.accounting = Some(callback);
    }

    /// Hand a decoded image to assembly
    pub fn submit(&mut self, key: TextureKey, image: RawImage) -> CreationTicket {
        let ticket = CreationTicket(self.next_ticket);
        self.next_ticket += 1;
        self.outstanding += 1;

        let job = AssemblyJob { key, ticket, image };
        let job = match self.worker.as_ref().and_then(|w| w.jobs.as_ref()) {
            Some(jobs) => match jobs.send(job) {
                Ok(()) => return ticket,
                Err(err) => {
                    log::warn!("assembly worker gone, assembling inline");
                    err.into_inner()
                }
            },
            None => job,
        };

        let result = assemble(job.key, job.image, self.limits);
        self.local_ready.push_back(Assembled {
            key: job.key,
            ticket: job.ticket,
            result,
        });
        ticket
    }

    /// Take every assembled payload that is ready
    pub fn drain_ready(&mut self) -> Vec<Assembled> {
        let mut ready: Vec<Assembled> = self.local_ready.drain(..).collect();
        if let Some(worker) = &self.worker {
            ready.extend(worker.ready.try_iter());
        }
        self.outstanding = self.outstanding.saturating_sub(ready.len());
        ready
    }

    /// Jobs submitted but not yet drained
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Upload an assembled payload; exactly one GPU allocation on success
    pub fn finalize(&mut self, gpu: &mut dyn GpuDevice, upload: &UploadImage) -> CacheResult<GpuPayload> {
        let started = Instant::now();
        let handle = gpu.upload(upload)?;
        self.upload_cost.record(started.elapsed());

        let bytes = gpu.allocation_size(upload);
        self.memory.record_alloc(bytes);
        self.created += 1;
        if let Some(callback) = &self.accounting {
            callback(AccountingEvent::Allocated {
                key: upload.key,
                handle,
                bytes,
            });
        }
        log::trace!(
            "Created {} at level {} ({}x{}, {} bytes)",
            upload.key,
            upload.discard_level,
            upload.width,
            upload.height,
            bytes
        );

        Ok(GpuPayload {
            handle,
            level: upload.discard_level,
            bytes,
            width: upload.width,
            height: upload.height,
        })
    }

    /// Assemble and finalize synchronously
    pub fn create_now(
        &mut self,
        gpu: &mut dyn GpuDevice,
        key: TextureKey,
        image: RawImage,
    ) -> CacheResult<GpuPayload> {
        let upload = assemble(key, image, self.limits)?;
        self.finalize(gpu, &upload)
    }

    /// Free a payload and record the deallocation
    pub fn release(&mut self, gpu: &mut dyn GpuDevice, key: TextureKey, payload: GpuPayload) {
        gpu.free(payload.handle);
        self.memory.record_dealloc(payload.bytes);
        self.released += 1;
        if let Some(callback) = &self.accounting {
            callback(AccountingEvent::Freed {
                key,
                handle: payload.handle,
                bytes: payload.bytes,
            });
        }
    }

    /// Average wall time of recent uploads
    pub fn estimated_upload_cost(&self) -> Duration {
        self.upload_cost.average()
    }

    /// Shared byte counters
    pub fn memory(&self) -> &Arc<MemoryStats> {
        &self.memory
    }

    /// Successful uploads so far
    pub fn created(&self) -> u64 {
        self.created
    }

    /// Payloads freed so far
    pub fn released(&self) -> u64 {
        self.released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::RecordingGpu;
    use parking_lot::Mutex;

    const LIMITS: CreationLimits = CreationLimits {
        max_texture_size: 1024,
    };

    fn image(width: u32, height: u32, source: ImageSource) -> RawImage {
        RawImage {
            width,
            height,
            components: 1,
            discard_level: 0,
            full_width: width,
            full_height: height,
            source,
            data: (0..width * height).map(|i| i as u8).collect(),
        }
    }

    #[test]
    fn test_assemble_power_of_two() {
        let key = TextureKey::from_u128(1);
        let upload = assemble(key, image(4, 2, ImageSource::Network), LIMITS).unwrap();
        assert_eq!((upload.width, upload.height), (4, 2));
        assert_eq!(upload.format, PixelFormat::R8);
        assert!(!upload.padded);
    }

    #[test]
    fn test_assemble_rejections() {
        let key = TextureKey::from_u128(1);

        let err = assemble(key, image(3, 4, ImageSource::Network), LIMITS).unwrap_err();
        assert!(matches!(err, CacheError::Unsupported(_)));

        let err = assemble(key, image(2048, 1, ImageSource::Network), LIMITS).unwrap_err();
        assert!(matches!(err, CacheError::Unsupported(_)));

        let mut truncated = image(4, 4, ImageSource::Network);
        truncated.data.pop();
        assert!(matches!(assemble(key, truncated, LIMITS), Err(CacheError::Corrupt(_))));

        let mut odd = image(4, 4, ImageSource::Network);
        odd.components = 5;
        assert!(matches!(assemble(key, odd, LIMITS), Err(CacheError::Unsupported(_))));
    }

    #[test]
    fn test_local_images_are_padded() {
        let key = TextureKey::from_u128(1);
        // 3x2 single-channel image: rows [0 1 2] [3 4 5]
        let upload = assemble(key, image(3, 2, ImageSource::Local), LIMITS).unwrap();
        assert!(upload.padded);
        assert_eq!((upload.width, upload.height), (4, 2));
        assert_eq!(upload.data, vec![0, 1, 2, 2, 3, 4, 5, 5]);

        let upload = assemble(key, image(1, 3, ImageSource::Local), LIMITS).unwrap();
        assert_eq!((upload.width, upload.height), (1, 4));
        assert_eq!(upload.data, vec![0, 1, 2, 2]);
    }

    #[test]
    fn test_inline_submit_and_finalize() {
        let memory = Arc::new(MemoryStats::new());
        let mut pipeline = CreationPipeline::new(LIMITS, memory.clone(), false);
        let mut gpu = RecordingGpu::new();
        let key = TextureKey::from_u128(3);

        let ticket = pipeline.submit(key, image(8, 8, ImageSource::Network));
        assert_eq!(pipeline.outstanding(), 1);
        let ready = pipeline.drain_ready();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].ticket, ticket);
        assert_eq!(pipeline.outstanding(), 0);

        let upload = ready[0].result.as_ref().unwrap();
        let payload = pipeline.finalize(&mut gpu, upload).unwrap();
        assert_eq!(payload.bytes, 64);
        assert_eq!(memory.current(), 64);
        assert_eq!(gpu.uploads(), 1);
        assert!(gpu.is_live(payload.handle));

        pipeline.release(&mut gpu, key, payload);
        assert_eq!(memory.current(), 0);
        assert!(!gpu.is_live(payload.handle));
        assert_eq!(pipeline.released(), 1);
    }

    #[test]
    fn test_threaded_assembly() {
        let memory = Arc::new(MemoryStats::new());
        let mut pipeline = CreationPipeline::new(LIMITS, memory, true);
        assert!(pipeline.is_threaded());

        for i in 0..10u128 {
            pipeline.submit(TextureKey::from_u128(i), image(16, 16, ImageSource::Network));
        }

        let mut ready = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while ready.len() < 10 && Instant::now() < deadline {
            ready.extend(pipeline.drain_ready());
            thread::yield_now();
        }
        assert_eq!(ready.len(), 10);
        // Single worker preserves submission order
        let tickets: Vec<u64> = ready.iter().map(|a| a.ticket.0).collect();
        assert!(tickets.windows(2).all(|w| w[0] < w[1]));
        assert!(ready.iter().all(|a| a.result.is_ok()));
    }

    #[test]
    fn test_accounting_callback() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let mut pipeline = CreationPipeline::new(LIMITS, Arc::new(MemoryStats::new()), false);
        pipeline.set_accounting_callback(Box::new(move |event| sink.lock().push(event)));

        let mut gpu = RecordingGpu::new();
        let key = TextureKey::from_u128(4);
        let payload = pipeline
            .create_now(&mut gpu, key, image(4, 4, ImageSource::Network))
            .unwrap();
        pipeline.release(&mut gpu, key, payload);

        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], AccountingEvent::Allocated { bytes: 16, .. }));
        assert!(matches!(events[1], AccountingEvent::Freed { bytes: 16, .. }));
    }
}
