use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use crossbeam_channel::Receiver;
use glam::Vec3;
use tracing_subscriber::EnvFilter;
use worldspace_common::{EntityKind, Transform, WorldCell};
use worldspace_kernel::World;
use worldspace_stream::{
    FlatWorldStore, JsonCodec, MessageKind, Observer, ObserverId, ObserverTable,
    SimulationTickDriver, StreamConfig, UpdateMessage,
};

#[derive(Parser)]
#[command(name = "worldspace-server", about = "Headless world streaming runner")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Streaming config file (JSON). Missing fields take defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print version and the effective streaming config
    Info,
    /// Simulate observers walking through a generated world
    Simulate {
        /// Number of ticks to simulate
        #[arg(short, long, default_value = "100")]
        ticks: u64,
        /// Number of simulated observers
        #[arg(short, long, default_value = "2")]
        observers: u32,
        /// Number of wandering entities
        #[arg(short, long, default_value = "50")]
        entities: usize,
        /// RNG seed for the world and terrain
        #[arg(short, long, default_value = "42")]
        seed: u64,
        /// Generate regions on the worker pool
        #[arg(long)]
        async_generation: bool,
    },
}

fn load_config(path: Option<&Path>) -> anyhow::Result<StreamConfig> {
    let Some(path) = path else {
        return Ok(StreamConfig::default().validated());
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    StreamConfig::from_json(&json).with_context(|| format!("parsing config {}", path.display()))
}

/// Per-kind message counts across all simulated observers.
#[derive(Debug, Default)]
struct Traffic {
    messages: BTreeMap<String, usize>,
    bytes: usize,
}

impl Traffic {
    fn drain(&mut self, rx: &Receiver<UpdateMessage>) {
        for msg in rx.try_iter() {
            *self.messages.entry(format!("{:?}", msg.kind)).or_default() += 1;
            self.bytes += msg.payload.len();
        }
    }

    fn count(&self, kind: MessageKind) -> usize {
        self.messages.get(&format!("{kind:?}")).copied().unwrap_or(0)
    }
}

const WANDERING_KINDS: [EntityKind; 4] = [
    EntityKind::Creature,
    EntityKind::Animal,
    EntityKind::Item,
    EntityKind::Projectile,
];

fn simulate(
    config: StreamConfig,
    ticks: u64,
    observer_count: u32,
    entity_count: usize,
    seed: u64,
) -> anyhow::Result<Traffic> {
    let store = Arc::new(FlatWorldStore::with_seed(seed));
    let codec = Arc::new(JsonCodec);
    let mut driver = SimulationTickDriver::new(config.clone(), store, codec.clone(), codec)
        .context("starting streaming engine")?;

    let mut world = World::with_seed(seed);
    for i in 0..entity_count {
        let pos = Vec3::new(world.random_signed() * 200.0, 64.0, world.random_signed() * 200.0);
        world.spawn(WANDERING_KINDS[i % WANDERING_KINDS.len()], Transform::at(pos));
    }

    let mut observers = ObserverTable::new();
    let mut receivers = Vec::new();
    for i in 0..observer_count {
        let start = Vec3::new(i as f32 * 24.0, 64.0, 0.0);
        let avatar = world.spawn(EntityKind::Avatar, Transform::at(start));
        let (observer, rx) = Observer::with_channel(ObserverId(i), start, config.view_radius);
        observers.insert(observer.with_avatar(avatar));
        receivers.push((avatar, rx));
    }

    let mut traffic = Traffic::default();
    for _ in 0..ticks {
        // Observers walk east; their avatars follow.
        for (i, (avatar, _)) in receivers.iter().enumerate() {
            if let Some(observer) = observers.get_mut(ObserverId(i as u32)) {
                observer.position.x += 1.5;
                world.move_to(*avatar, observer.position);
            }
        }

        let ids: Vec<_> = world
            .entities()
            .iter()
            .filter(|(_, e)| e.kind != EntityKind::Avatar)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            let step = Vec3::new(world.random_signed(), 0.0, world.random_signed()) * 0.5;
            world.set_velocity(id, step);
            if let Some(pos) = world.get(id).map(|e| e.position()) {
                world.move_to(id, pos + step);
            }
        }

        // Someone digs near the first observer now and then.
        if world.tick() % 10 == 0 {
            if let Some(first) = observers.get(ObserverId(0)) {
                let cell = WorldCell::containing(first.position + Vec3::new(3.0, -10.0, 3.0));
                world.set_cell(cell, 0);
            }
        }

        world.step();
        let report = driver.tick(&mut world, &observers);
        for id in &report.disconnected {
            observers.remove(*id);
        }
        if report.tick % 20 == 0 {
            tracing::info!(
                tick = report.tick,
                entries = report.regions.total_entries,
                pending_loads = report.regions.pending_loads,
                tracked = report.entities.tracked_entities,
                radius_cap = report.radius_cap,
                duration = ?report.duration,
                "tick"
            );
        }
        for (_, rx) in &receivers {
            traffic.drain(rx);
        }
    }
    Ok(traffic)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Info => {
            println!("worldspace-server v{}", env!("CARGO_PKG_VERSION"));
            println!("kernel: tick={}", World::new().tick());
            println!("stream: {}", worldspace_stream::crate_info());
            println!("config: {}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Simulate {
            ticks,
            observers,
            entities,
            seed,
            async_generation,
        } => {
            let config = StreamConfig {
                async_generation_enabled: config.async_generation_enabled || async_generation,
                ..config
            };
            println!(
                "Simulating: ticks={ticks}, observers={observers}, entities={entities}, seed={seed}, view_radius={}",
                config.view_radius
            );
            let traffic = simulate(config, ticks, observers, entities, seed)?;
            for (kind, count) in &traffic.messages {
                println!("  {kind}: {count}");
            }
            println!("  total payload: {} bytes", traffic.bytes);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_config_path_uses_defaults() {
        let config = load_config(None).unwrap();
        assert_eq!(config, StreamConfig::default());
    }

    #[test]
    fn config_file_is_parsed_and_clamped() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "view_radius": 64, "max_region_loads_per_tick": 8 }}"#).unwrap();
        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.view_radius, 32);
        assert_eq!(config.max_region_loads_per_tick, 8);
    }

    #[test]
    fn bad_config_file_names_the_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let err = load_config(Some(file.path())).unwrap_err();
        assert!(format!("{err:#}").contains(&file.path().display().to_string()));
    }

    #[test]
    fn short_simulation_streams_regions_and_entities() {
        let config = StreamConfig {
            view_radius: 3,
            per_tick_time_budget_ms: 10_000,
            ..StreamConfig::default()
        };
        let traffic = simulate(config, 5, 2, 20, 7).unwrap();
        // Two observers with 7x7 footprints, close enough to see each other.
        assert!(traffic.count(MessageKind::RegionFull) >= 49);
        assert!(traffic.count(MessageKind::EntitySpawn) > 0);
    }
}
