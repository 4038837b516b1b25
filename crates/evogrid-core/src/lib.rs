//! Core types for the EvoGrid workspace.
//!
//! The crate simulates a grid of cells, each holding a fixed number of
//! critter slots. Critters metabolise against a colour-field environment,
//! breed, and disperse offspring into nearby cells; a species identifier
//! periodically groups genomes by Hamming-distance connectivity and feeds
//! a phylogeny log. The GUI, image decoding, and downstream analysis
//! tooling live elsewhere; this crate exposes the tick loop, the grid
//! state, and the species log.

mod critter;
mod engine;
mod environment;
mod grid;
mod lookups;
mod phylogeny;
mod simulation;
mod species;

pub use critter::{BreedError, Critter, CritterTick, NurseryEntry};
pub use environment::{EnvFrame, Environment};
pub use grid::{Cell, Grid};
pub use lookups::{ByteCursor, Lookups};
pub use phylogeny::{LogSpecies, LogSpeciesDataItem, LogSpeciesKey, Phylogeny};
pub use simulation::{CellSnapshot, SimSnapshot, Simulation, TickEvents};
pub use species::{
    GenealogicalIdentifier, IdentifyContext, ModalIdentifier, Species, SpeciesIdentifier,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Compile-time upper bound on grid width (cells).
pub const MAX_GRID_X: usize = 256;
/// Compile-time upper bound on grid height (cells).
pub const MAX_GRID_Y: usize = 256;
/// Compile-time upper bound on critter slots per cell.
pub const MAX_SLOTS_PER_SQUARE: usize = 256;
/// Upper bound on distinct genomes a single species may hold during
/// identification. Exceeding it is a fatal capacity error.
pub const MAX_GENOME_COUNT: usize = 65_536;
/// Upper bound on worker threads.
pub const MAX_WORKERS: usize = 256;

/// High level simulation clock (iterations processed since setup).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the next sequential tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Resets the tick counter back to zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// Keyframe progression mode for the environment colour field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentMode {
    /// Single keyframe, never advances.
    Static,
    /// Play keyframes once; the run halts when the last one is exhausted.
    Once,
    /// Wrap back to the first keyframe.
    #[default]
    Loop,
    /// Reverse direction at the endpoints.
    Bounce,
}

/// How much species machinery runs each check interval.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "snake_case")]
pub enum SpeciesMode {
    /// No species identification at all.
    Off,
    /// Identification only; no lineage tree.
    #[default]
    Basic,
    /// Identification plus phylogeny tree maintenance.
    Phylogeny,
    /// Phylogeny plus per-snapshot metrics on every log node.
    PhylogenyMetrics,
}

/// Which identifier algorithm groups genomes into species.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SpeciesAlgorithm {
    /// Union-find over each species' genome set, splitting along
    /// genealogical lines. The primary algorithm.
    #[default]
    Genealogical,
    /// Legacy modal-genome grouper with history matching.
    Modal,
}

/// Errors raised when validating configuration or seeding a run.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Random seeding failed to find a viable genome at the seed cell.
    #[error("no viable genome found for the seed cell after {attempts} attempts")]
    NoViableSeed { attempts: u32 },
}

/// Errors raised by the species identification subsystem.
#[derive(Debug, Error)]
pub enum SpeciesError {
    /// A species holds more distinct genomes than the compile-time cap.
    #[error("species {species_id} exceeds the genome capacity of {limit}")]
    GenomeCapacity { species_id: u64, limit: usize },
    /// A live species id has no node in the phylogeny lookup table.
    #[error("species {species_id} missing from the phylogeny log")]
    UnknownLogSpecies { species_id: u64 },
}

/// Static configuration for an EvoGrid simulation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimConfig {
    /// Grid width in cells (at most [`MAX_GRID_X`]).
    pub grid_x: usize,
    /// Grid height in cells (at most [`MAX_GRID_Y`]).
    pub grid_y: usize,
    /// Critter slots per cell (at most [`MAX_SLOTS_PER_SQUARE`]).
    pub slots_per_square: usize,
    /// Age assigned to a freshly settled critter.
    pub start_age: u8,
    /// Age beyond which a critter dies in place. Ages saturate at 255,
    /// so a lifespan of 255 or more disables age death.
    pub lifespan: u32,
    /// Age at which a critter may start breeding.
    pub breed_threshold: u32,
    /// Energy deducted when a critter is marked as a breeder.
    pub breed_cost: i32,
    /// Energy budget shared among a cell's critters each tick.
    pub food: i32,
    /// Divisor applied to dispersal vectors; 1 is maximum spread.
    pub dispersal: i32,
    /// Chance in 256 that a child genome flips one random bit.
    pub mutate: u8,
    /// Hamming threshold for species connectivity and breeding distance.
    pub max_difference: u32,
    /// Fitness tolerance; popcount distances at or beyond it are lethal.
    pub settle_tolerance: u8,
    /// Target summed popcount for a perfectly fit genome.
    pub target: u8,
    /// Multiplier turning fitness into a settled critter's initial energy.
    pub energy_scale: i32,
    /// Ticks between environment keyframes; 0 pins the first keyframe.
    pub environment_change_rate: u32,
    /// Keyframe progression mode.
    pub environment_mode: EnvironmentMode,
    /// Blend linearly between keyframes.
    pub environment_interpolate: bool,
    /// Species machinery level.
    pub species_mode: SpeciesMode,
    /// Identifier algorithm.
    pub species_algorithm: SpeciesAlgorithm,
    /// Ticks between identifier passes.
    pub species_check_interval: u64,
    /// Live critters sampled per cell by the modal census; 0 samples all.
    pub species_samples: u32,
    /// Percentage of cross links (relative to the smaller population)
    /// required before the modal identifier merges two groups.
    pub species_sensitivity: u32,
    /// How many past species lists the modal identifier matches against.
    pub time_slice_connect: usize,
    /// Recompute fitness for every critter at the start of each tick.
    pub recalculate_fitness: bool,
    /// Breeders clone themselves rather than picking a partner.
    pub asexual: bool,
    /// Breeders pick a random partner from the cell's breeder list.
    pub sexual: bool,
    /// Offspring settle into uniformly random cells instead of dispersing.
    pub non_spatial: bool,
    /// Wrap dispersal at the grid edges instead of dropping offspring.
    pub toroidal: bool,
    /// Seed the run with [`SimConfig::reseed_genome`] rather than searching.
    pub reseed_known: bool,
    /// Genome used when `reseed_known` is set.
    pub reseed_genome: u64,
    /// Refuse breeding across species boundaries.
    pub breed_species: bool,
    /// Refuse breeding between genomes at or beyond `max_difference`.
    pub breed_differ: bool,
    /// Emit per-generation species log records after identifier passes.
    pub logging: bool,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
    /// Worker thread count; `None` uses detected parallelism. Determinism
    /// is only guaranteed for a fixed worker count and fixed seed.
    pub worker_threads: Option<usize>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            grid_x: 100,
            grid_y: 100,
            slots_per_square: 100,
            start_age: 15,
            lifespan: 120,
            breed_threshold: 20,
            breed_cost: 500,
            food: 3000,
            dispersal: 15,
            mutate: 10,
            max_difference: 2,
            settle_tolerance: 15,
            target: 66,
            energy_scale: 10,
            environment_change_rate: 100,
            environment_mode: EnvironmentMode::Loop,
            environment_interpolate: true,
            species_mode: SpeciesMode::Basic,
            species_algorithm: SpeciesAlgorithm::Genealogical,
            species_check_interval: 100,
            species_samples: 1,
            species_sensitivity: 2,
            time_slice_connect: 5,
            recalculate_fitness: false,
            asexual: false,
            sexual: true,
            non_spatial: false,
            toroidal: false,
            reseed_known: false,
            reseed_genome: 0,
            breed_species: false,
            breed_differ: true,
            logging: false,
            rng_seed: None,
            worker_threads: None,
        }
    }
}

impl SimConfig {
    /// Validates the configuration against the compile-time caps.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.grid_x == 0 || self.grid_x > MAX_GRID_X {
            return Err(ConfigError::InvalidConfig(
                "grid_x must be between 1 and 256",
            ));
        }
        if self.grid_y == 0 || self.grid_y > MAX_GRID_Y {
            return Err(ConfigError::InvalidConfig(
                "grid_y must be between 1 and 256",
            ));
        }
        if self.slots_per_square == 0 || self.slots_per_square > MAX_SLOTS_PER_SQUARE {
            return Err(ConfigError::InvalidConfig(
                "slots_per_square must be between 1 and 256",
            ));
        }
        if self.settle_tolerance == 0 {
            return Err(ConfigError::InvalidConfig(
                "settle_tolerance must be non-zero",
            ));
        }
        if self.dispersal < 1 {
            return Err(ConfigError::InvalidConfig("dispersal must be at least 1"));
        }
        if self.food < 0 || self.breed_cost < 0 || self.energy_scale < 0 {
            return Err(ConfigError::InvalidConfig(
                "food, breed_cost, and energy_scale must be non-negative",
            ));
        }
        if self.target > 96 {
            return Err(ConfigError::InvalidConfig(
                "target cannot exceed the 96 scorable bits",
            ));
        }
        if self.max_difference > 64 {
            return Err(ConfigError::InvalidConfig(
                "max_difference cannot exceed the 64 genome bits",
            ));
        }
        if !self.asexual && !self.sexual {
            return Err(ConfigError::InvalidConfig(
                "either sexual or asexual breeding must be enabled",
            ));
        }
        if self.species_mode != SpeciesMode::Off && self.species_check_interval == 0 {
            return Err(ConfigError::InvalidConfig(
                "species_check_interval must be non-zero when species mode is on",
            ));
        }
        if self.time_slice_connect == 0 {
            return Err(ConfigError::InvalidConfig(
                "time_slice_connect must be at least 1",
            ));
        }
        if let Some(workers) = self.worker_threads {
            if workers == 0 || workers > MAX_WORKERS {
                return Err(ConfigError::InvalidConfig(
                    "worker_threads must be between 1 and 256",
                ));
            }
        }
        Ok(())
    }

    /// Resolved worker count: configured value, or detected parallelism
    /// clamped to `[1, 256]`.
    #[must_use]
    pub fn resolved_workers(&self) -> usize {
        self.worker_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1)
                .clamp(1, MAX_WORKERS)
        })
    }
}

/// One per-generation row of the species log, emitted after an
/// identifier pass when logging is enabled.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpeciesLogRecord {
    pub time: u64,
    pub species_id: u64,
    pub origin_time: u64,
    pub parent_id: u64,
    pub current_size: i32,
    pub current_genome: u64,
}

/// Sink receiving per-generation species log records.
pub trait SpeciesLogSink: Send {
    fn on_records(&mut self, records: &[SpeciesLogRecord]);
}

/// No-op species log sink.
#[derive(Debug, Default)]
pub struct NullSpeciesLog;

impl SpeciesLogSink for NullSpeciesLog {
    fn on_records(&mut self, _records: &[SpeciesLogRecord]) {}
}

/// Sink for user-visible status messages and identifier progress.
pub trait StatusSink: Send {
    /// A status-bar style message.
    fn status(&mut self, message: &str);

    /// Identifier progress, `done` species out of `total`.
    fn progress(&mut self, done: usize, total: usize) {
        let _ = (done, total);
    }
}

/// No-op status sink.
#[derive(Debug, Default)]
pub struct NullStatus;

impl StatusSink for NullStatus {
    fn status(&mut self, _message: &str) {}
}

/// Renders a genome as a 64-character binary string, high bit first.
#[must_use]
pub fn genome_binary(genome: u64) -> String {
    let mut out = String::with_capacity(64);
    for bit in (0..64).rev() {
        out.push(if genome & (1u64 << bit) != 0 { '1' } else { '0' });
    }
    out
}
