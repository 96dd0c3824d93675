//! # Mipstream CLI
//!
//! Command-line driver for the mipstream texture streaming cache.
//!
//! ## Commands
//! - `simulate` - Run a synthetic scene through the cache
//! - `config` - Print a configuration preset as JSON
//! - `manifest` - Summarise a residency manifest

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use mipstream_cache::sim::{RecordingGpu, SyntheticCodec, SyntheticTransport};
use mipstream_cache::{
    BoostClass, ConsumerId, FetchHint, Footprint, Manifest, Scheduler, StreamingConfig, TextureKey,
};
use mipstream_core::ManualClock;

/// Mipstream texture streaming CLI
#[derive(Parser)]
#[command(name = "mipstream")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Hardware tier of a configuration preset
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Tier {
    Mobile,
    Desktop,
}

impl Tier {
    /// Preset for this tier
    pub fn preset(self) -> StreamingConfig {
        match self {
            Self::Mobile => StreamingConfig::mobile(),
            Self::Desktop => StreamingConfig::desktop(),
        }
    }
}

/// CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run a synthetic scene through the cache
    Simulate {
        /// Distinct textures in the scene
        #[arg(short, long, default_value = "500")]
        textures: usize,

        /// Frames to simulate
        #[arg(short, long, default_value = "600")]
        frames: u32,

        /// Creation time budget per frame in milliseconds
        #[arg(short = 'b', long, default_value = "4")]
        frame_budget_ms: u64,

        /// GPU memory ceiling in MiB
        #[arg(long)]
        ceiling_mib: Option<u64>,

        /// Configuration file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Preset used when no configuration file is given
        #[arg(long, value_enum, default_value = "desktop")]
        tier: Tier,

        /// Run fetches and assembly inline
        #[arg(long)]
        single_threaded: bool,

        /// Write the final residency manifest here
        #[arg(short, long)]
        manifest: Option<PathBuf>,
    },

    /// Print a configuration preset as JSON
    Config {
        #[arg(short, long, value_enum, default_value = "desktop")]
        tier: Tier,
    },

    /// Summarise a residency manifest
    Manifest {
        /// Manifest file
        path: PathBuf,

        /// Entries to list
        #[arg(short, long, default_value = "10")]
        top: usize,
    },
}

/// Settings for one simulation run
#[derive(Debug, Clone)]
pub struct Simulation {
    pub config: StreamingConfig,
    pub textures: usize,
    pub frames: u32,
    pub frame_budget: Duration,
}

/// Outcome of a simulation run
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationSummary {
    pub resident: usize,
    pub missing: usize,
    pub evictions: u64,
    pub peak_gpu_bytes: u64,
    pub final_bias: f32,
    pub manifest: Manifest,
}

/// Scene frames per simulated second
const FRAME_RATE: f64 = 60.0;

impl Simulation {
    fn key(index: usize) -> TextureKey {
        TextureKey::from_content(format!("texture-{}", index).as_bytes())
    }

    /// Level-0 edge of texture `index`, 64 through 1024
    fn edge(index: usize) -> u32 {
        64 << (index % 5)
    }

    /// Whether texture `index` is on screen during `frame`
    ///
    /// The camera pans across the scene, keeping a third of it in view.
    fn visible(&self, index: usize, frame: u32) -> bool {
        let offset = (frame as usize / 4) % self.textures.max(1);
        (index + self.textures - offset) % self.textures < self.textures.div_ceil(3)
    }

    /// Run the scene and return the final cache state
    pub fn run(&self) -> Result<SimulationSummary> {
        let transport = SyntheticTransport::new();
        let gpu = RecordingGpu::new();
        let clock = ManualClock::new();
        let mut scheduler = Scheduler::with_clock(
            self.config.clone(),
            Arc::new(transport.clone()),
            Arc::new(SyntheticCodec),
            Box::new(gpu.clone()),
            Arc::new(clock.clone()),
        )
        .context("Failed to build the scheduler")?;

        for index in 0..self.textures {
            let key = Self::key(index);
            let edge = Self::edge(index);
            // Every 50th texture does not exist
            if index % 50 != 49 {
                transport.insert(key, edge, edge, 4);
            }
            let boost = if index % 97 == 0 {
                BoostClass::Ui
            } else if index % 7 == 0 {
                BoostClass::Terrain
            } else {
                BoostClass::Scene
            };
            scheduler.get_or_create(
                key,
                FetchHint {
                    full_size: Some((edge, edge)),
                    boost: Some(boost),
                    ..FetchHint::default()
                },
            );
        }

        let mut shown = vec![false; self.textures];
        for frame in 0..self.frames {
            for (index, was_shown) in shown.iter_mut().enumerate() {
                let key = Self::key(index);
                let consumer = ConsumerId::Face(index as u64);
                let visible = self.visible(index, frame);
                if visible && !*was_shown {
                    scheduler.reference(key, consumer);
                } else if !visible && *was_shown {
                    scheduler.unreference(key, consumer);
                }
                *was_shown = visible;

                if visible {
                    let distance = ((index * 31 + frame as usize) % 400) as f32;
                    let edge = 2048.0 / (1.0 + distance / 16.0);
                    scheduler.report_footprint(key, &Footprint::new(edge * edge, distance));
                }
            }

            let report = scheduler.tick(self.frame_budget);
            if frame % FRAME_RATE as u32 == 0 {
                log::debug!(
                    "Frame {}: {} fetches, {} creations, {} evicted, bias {:.2}",
                    frame,
                    report.fetches_dispatched,
                    report.creations_finalized,
                    report.evicted,
                    report.discard_bias
                );
            }
            clock.advance_secs(1.0 / FRAME_RATE);
        }

        let stats = scheduler.stats();
        stats.log_summary();
        log::info!(
            "GPU device: {} live textures, {} bytes",
            gpu.live_handles(),
            gpu.live_bytes()
        );

        Ok(SimulationSummary {
            resident: stats.resident,
            missing: stats.missing,
            evictions: stats.evictions,
            peak_gpu_bytes: stats.peak_gpu_bytes,
            final_bias: stats.discard_bias,
            manifest: scheduler.manifest(),
        })
    }
}

/// Execute the CLI command
pub fn execute(cli: Cli) -> Result<()> {
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    match cli.command {
        Commands::Simulate {
            textures,
            frames,
            frame_budget_ms,
            ceiling_mib,
            config,
            tier,
            single_threaded,
            manifest,
        } => {
            let mut config = match config {
                Some(path) => StreamingConfig::load(&path)
                    .with_context(|| format!("Failed to load config {}", path.display()))?,
                None => tier.preset(),
            };
            if let Some(mib) = ceiling_mib {
                config.budget.gpu_memory_ceiling_bytes = Some(mib * 1024 * 1024);
            }
            if single_threaded {
                config.fetch_workers = 0;
                config.threaded_creation = false;
            }

            log::info!("Simulating {} textures for {} frames...", textures, frames);
            let summary = Simulation {
                config,
                textures,
                frames,
                frame_budget: Duration::from_millis(frame_budget_ms),
            }
            .run()?;
            log::info!(
                "Done: {} resident, {} missing, {} evictions, final bias {:.2}",
                summary.resident,
                summary.missing,
                summary.evictions,
                summary.final_bias
            );

            if let Some(path) = manifest {
                summary
                    .manifest
                    .save(&path)
                    .with_context(|| format!("Failed to write manifest {}", path.display()))?;
                log::info!("Manifest written to {}", path.display());
            }
        }

        Commands::Config { tier } => {
            let json = serde_json::to_string_pretty(&tier.preset())
                .context("Failed to serialize configuration")?;
            println!("{}", json);
        }

        Commands::Manifest { path, top } => {
            let manifest = Manifest::load(&path)
                .with_context(|| format!("Failed to read manifest {}", path.display()))?;
            println!(
                "{}: {} entries, {:.0} total pixels",
                path.display(),
                manifest.len(),
                manifest.total_virtual_size()
            );
            for entry in manifest.entries.iter().take(top) {
                println!("  {}  {:>10.0}  {:?}", entry.key, entry.virtual_size, entry.boost);
            }
        }
    }

    Ok(())
}
