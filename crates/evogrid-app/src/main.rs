//! Headless EvoGrid shell: compose a configuration, build environment
//! keyframes, drive the tick loop, and write the species log artefacts.

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use evogrid_core::{
    EnvFrame, EnvironmentMode, SimConfig, Simulation, SpeciesAlgorithm, SpeciesLogRecord,
    SpeciesLogSink, SpeciesMode, StatusSink, genome_binary,
};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

fn main() -> Result<()> {
    let cli = AppCli::parse();
    init_tracing();

    let config = compose_config(&cli)?;
    let frames = build_frames(&cli, &config)?;
    fs::create_dir_all(&cli.out_dir)
        .with_context(|| format!("creating output directory {}", cli.out_dir.display()))?;

    let log_path = cli.out_dir.join("species_log.csv");
    let log_sink = CsvSpeciesLog::create(&log_path)
        .with_context(|| format!("opening species log {}", log_path.display()))?;
    let mut sim = Simulation::with_sinks(
        config,
        &frames,
        Box::new(TracingStatus),
        Box::new(log_sink),
    )
    .context("building simulation")?;

    info!(
        grid_x = sim.config().grid_x,
        grid_y = sim.config().grid_y,
        slots = sim.config().slots_per_square,
        workers = sim.workers(),
        alive = sim.alive_count(),
        "simulation seeded"
    );

    let mut halted_at = None;
    for _ in 0..cli.ticks {
        let events = sim.step().context("simulation tick failed")?;
        if events.halted {
            halted_at = Some(events.tick.0);
            break;
        }
        if events.tick.0.is_multiple_of(cli.report_every) {
            info!(
                tick = events.tick.0,
                alive = sim.alive_count(),
                species = sim.species().len(),
                births = events.births,
                kills = events.kills,
                "progress"
            );
        }
    }

    match halted_at {
        Some(tick) => info!(tick, "environment exhausted; run halted"),
        None => info!(tick = sim.tick().0, "run complete"),
    }

    write_artefacts(&cli, &mut sim)?;
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(name = "evogrid", version, about = "EvoGrid evolutionary simulator")]
struct AppCli {
    /// JSON config layers applied over the defaults, in order.
    #[arg(long = "config", value_name = "FILE")]
    config_layers: Vec<PathBuf>,

    /// Ticks to run (a once-mode environment may halt earlier).
    #[arg(long, default_value_t = 1_000)]
    ticks: u64,

    /// Progress report cadence in ticks.
    #[arg(long, default_value_t = 100)]
    report_every: u64,

    /// RNG seed override.
    #[arg(long)]
    seed: Option<u64>,

    /// Grid width override.
    #[arg(long)]
    grid_x: Option<usize>,

    /// Grid height override.
    #[arg(long)]
    grid_y: Option<usize>,

    /// Slots per cell override.
    #[arg(long)]
    slots: Option<usize>,

    /// Worker thread override (fixes determinism alongside --seed).
    #[arg(long)]
    workers: Option<usize>,

    /// Environment keyframe colours as `r,g,b` triples, one per frame.
    #[arg(long = "env-colour", value_name = "R,G,B")]
    env_colours: Vec<String>,

    /// Render each keyframe as a horizontal gradient from black.
    #[arg(long)]
    env_gradient: bool,

    /// Environment progression mode override.
    #[arg(long, value_enum)]
    env_mode: Option<EnvModeArg>,

    /// Ticks per environment keyframe override.
    #[arg(long)]
    change_rate: Option<u32>,

    /// Species machinery override.
    #[arg(long, value_enum)]
    species_mode: Option<SpeciesModeArg>,

    /// Use the legacy modal-genome identifier.
    #[arg(long)]
    modal_species: bool,

    /// Wrap dispersal at the grid edges.
    #[arg(long)]
    toroidal: bool,

    /// Clone-only breeding.
    #[arg(long)]
    asexual: bool,

    /// Minimum lifetime peak size for a species to appear in the tree.
    #[arg(long, default_value_t = 0)]
    min_species_size: u32,

    /// Allow culling small species even when they have descendants.
    #[arg(long)]
    allow_exclude: bool,

    /// Output directory for the species log, tree, and dump.
    #[arg(long, default_value = "evogrid-out")]
    out_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EnvModeArg {
    Static,
    Once,
    Loop,
    Bounce,
}

impl From<EnvModeArg> for EnvironmentMode {
    fn from(value: EnvModeArg) -> Self {
        match value {
            EnvModeArg::Static => Self::Static,
            EnvModeArg::Once => Self::Once,
            EnvModeArg::Loop => Self::Loop,
            EnvModeArg::Bounce => Self::Bounce,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SpeciesModeArg {
    Off,
    Basic,
    Phylogeny,
    PhylogenyMetrics,
}

impl From<SpeciesModeArg> for SpeciesMode {
    fn from(value: SpeciesModeArg) -> Self {
        match value {
            SpeciesModeArg::Off => Self::Off,
            SpeciesModeArg::Basic => Self::Basic,
            SpeciesModeArg::Phylogeny => Self::Phylogeny,
            SpeciesModeArg::PhylogenyMetrics => Self::PhylogenyMetrics,
        }
    }
}

/// Defaults, then JSON layers, then CLI flags.
fn compose_config(cli: &AppCli) -> Result<SimConfig> {
    let mut config = SimConfig {
        logging: true,
        species_mode: SpeciesMode::Phylogeny,
        ..SimConfig::default()
    };
    for layer in &cli.config_layers {
        config = apply_config_layer(config, layer)
            .with_context(|| format!("applying config layer {}", layer.display()))?;
    }

    if let Some(seed) = cli.seed {
        config.rng_seed = Some(seed);
    }
    if let Some(grid_x) = cli.grid_x {
        config.grid_x = grid_x;
    }
    if let Some(grid_y) = cli.grid_y {
        config.grid_y = grid_y;
    }
    if let Some(slots) = cli.slots {
        config.slots_per_square = slots;
    }
    if let Some(workers) = cli.workers {
        config.worker_threads = Some(workers);
    }
    if let Some(mode) = cli.env_mode {
        config.environment_mode = mode.into();
    }
    if let Some(rate) = cli.change_rate {
        config.environment_change_rate = rate;
    }
    if let Some(mode) = cli.species_mode {
        config.species_mode = mode.into();
    }
    if cli.modal_species {
        config.species_algorithm = SpeciesAlgorithm::Modal;
    }
    if cli.toroidal {
        config.toroidal = true;
    }
    if cli.asexual {
        config.asexual = true;
        config.sexual = false;
    }

    config.validate().context("configuration rejected")?;
    Ok(config)
}

/// Merge one JSON object file onto the current configuration. Unknown
/// keys are reported and skipped; known keys replace the current value.
fn apply_config_layer(config: SimConfig, path: &Path) -> Result<SimConfig> {
    let raw = fs::read_to_string(path)?;
    let layer: serde_json::Value = serde_json::from_str(&raw)?;
    let serde_json::Value::Object(entries) = layer else {
        bail!("config layer must be a JSON object");
    };
    let mut base = serde_json::to_value(&config)?;
    let serde_json::Value::Object(base_entries) = &mut base else {
        unreachable!("SimConfig always serializes to an object");
    };
    for (key, value) in entries {
        if base_entries.contains_key(&key) {
            base_entries.insert(key, value);
        } else {
            warn!(key = %key, "ignoring unknown configuration key");
        }
    }
    Ok(serde_json::from_value(base)?)
}

/// Build the environment keyframes from the CLI colour list. Image files
/// are decoded by external tooling; the shell only synthesises fields.
fn build_frames(cli: &AppCli, config: &SimConfig) -> Result<Vec<EnvFrame>> {
    if cli.env_colours.is_empty() {
        return Ok(vec![EnvFrame::filled(
            config.grid_x,
            config.grid_y,
            [128, 128, 128],
        )]);
    }
    let mut frames = Vec::with_capacity(cli.env_colours.len());
    for spec in &cli.env_colours {
        let colour = parse_colour(spec)?;
        let frame = if cli.env_gradient {
            gradient_frame(config.grid_x, config.grid_y, colour)?
        } else {
            EnvFrame::filled(config.grid_x, config.grid_y, colour)
        };
        frames.push(frame);
    }
    Ok(frames)
}

fn parse_colour(spec: &str) -> Result<[u8; 3]> {
    let parts: Vec<&str> = spec.split(',').collect();
    if parts.len() != 3 {
        bail!("colour {spec:?} must be three comma-separated channels");
    }
    let mut colour = [0u8; 3];
    for (slot, part) in colour.iter_mut().zip(parts) {
        *slot = part
            .trim()
            .parse::<u8>()
            .with_context(|| format!("bad channel value {part:?}"))?;
    }
    Ok(colour)
}

/// A left-to-right ramp from black up to the full colour.
fn gradient_frame(width: usize, height: usize, colour: [u8; 3]) -> Result<EnvFrame> {
    let mut pixels = vec![[0u8; 3]; width * height];
    for y in 0..height {
        for x in 0..width {
            let scale = if width > 1 { x * 255 / (width - 1) } else { 255 };
            pixels[y * width + x] = [
                (u32::from(colour[0]) * scale as u32 / 255) as u8,
                (u32::from(colour[1]) * scale as u32 / 255) as u8,
                (u32::from(colour[2]) * scale as u32 / 255) as u8,
            ];
        }
    }
    Ok(EnvFrame::new(width, height, pixels)?)
}

/// Write the Newick tree and phylogeny dump next to the species log.
fn write_artefacts(cli: &AppCli, sim: &mut Simulation) -> Result<()> {
    if let Some(newick) = sim
        .phylogeny()
        .newick(cli.min_species_size, cli.allow_exclude)
    {
        let path = cli.out_dir.join("phylogeny.nwk");
        fs::write(&path, newick).with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), "wrote Newick tree");
    }
    if let Some(dump) = sim
        .phylogeny()
        .dump_csv(cli.min_species_size, cli.allow_exclude)
    {
        let path = cli.out_dir.join("phylogeny_data.csv");
        fs::write(&path, dump).with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), "wrote phylogeny data dump");
    }

    let snapshot = sim.snapshot();
    let path = cli.out_dir.join("snapshot.json");
    let json = serde_json::to_string(&snapshot).context("serializing snapshot")?;
    fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), "wrote final snapshot");

    if let Some(species) = sim.species().first() {
        info!(
            species = sim.species().len(),
            sample = %genome_binary(species.type_genome),
            "final species sample"
        );
    }
    Ok(())
}

/// Status sink that forwards messages to the log.
struct TracingStatus;

impl StatusSink for TracingStatus {
    fn status(&mut self, message: &str) {
        info!(target: "evogrid::status", "{message}");
    }
}

/// Streams per-generation species records to a CSV file.
struct CsvSpeciesLog {
    writer: BufWriter<File>,
}

impl CsvSpeciesLog {
    fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        writeln!(
            writer,
            "time,species_id,origin_time,parent_id,current_size,current_genome"
        )?;
        Ok(Self { writer })
    }
}

impl SpeciesLogSink for CsvSpeciesLog {
    fn on_records(&mut self, records: &[SpeciesLogRecord]) {
        for record in records {
            let line = format!(
                "{},{},{},{},{},{}",
                record.time,
                record.species_id,
                record.origin_time,
                record.parent_id,
                record.current_size,
                record.current_genome
            );
            if let Err(error) = writeln!(self.writer, "{line}") {
                warn!(%error, "species log write failed");
                return;
            }
        }
        if let Err(error) = self.writer.flush() {
            warn!(%error, "species log flush failed");
        }
    }
}
