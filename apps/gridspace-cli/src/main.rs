use std::path::PathBuf;

use clap::{Parser, Subcommand};
use glam::Vec3;
use gridspace_common::{Aabb, BoundingBoxSphere, EntityId, Frustum, Sphere, TagRegistry, TagSet};
use gridspace_spatial::{
    CategoryFlags, QueryParams, RegularGridSpatialSystem, SpatialConfig, SpatialSystem, VisibilityState,
    VisitorExecution,
};
use gridspace_tools::SpatialInspector;
use tracing_subscriber::EnvFilter;

/// Side length of the square area the synthetic scatter covers.
const WORLD_EXTENT: f32 = 4096.0;

#[derive(Parser)]
#[command(name = "gridspace-cli", about = "CLI tool for gridspace spatial queries")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// YAML file with a SpatialConfig
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured cell size
    #[arg(long, global = true)]
    cell_size: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print crate versions
    Info,
    /// Scatter objects and run sphere, box and frustum queries
    Query {
        #[arg(short, long, default_value = "10000")]
        objects: usize,
        /// Seed for the deterministic scatter
        #[arg(short, long, default_value = "42")]
        seed: u64,
    },
    /// Repeat a tag-filtered query and watch cache grids appear
    Cache {
        #[arg(short, long, default_value = "10000")]
        objects: usize,
        #[arg(short, long, default_value = "300")]
        frames: u64,
        /// Share of objects carrying the queried tag
        #[arg(short, long, default_value = "30")]
        tagged_percent: u64,
        #[arg(short, long, default_value = "42")]
        seed: u64,
    },
    /// Print internal statistics
    Stats {
        #[arg(short, long, default_value = "1000")]
        objects: usize,
        #[arg(short, long, default_value = "42")]
        seed: u64,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    let mut config = match &cli.config {
        Some(path) => SpatialConfig::load(path)?,
        None => SpatialConfig::default(),
    };
    if let Some(cell_size) = cli.cell_size {
        config.cell_size = cell_size;
    }

    match cli.command {
        Commands::Info => {
            println!("gridspace-cli v{}", env!("CARGO_PKG_VERSION"));
            println!("common: {}", gridspace_common::crate_info());
            println!("spatial: {}", gridspace_spatial::crate_info());
            println!("tools: {}", gridspace_tools::crate_info());
            println!("cell size: {}", config.cell_size);
        }
        Commands::Query { objects, seed } => {
            let mut scene = Scene::new(config, objects, seed, 50)?;
            scene.system.start_new_frame();
            run_queries(&scene)?;
        }
        Commands::Cache {
            objects,
            frames,
            tagged_percent,
            seed,
        } => {
            let mut scene = Scene::new(config, objects, seed, tagged_percent.min(100))?;
            watch_cache(&mut scene, frames);
        }
        Commands::Stats { objects, seed, json } => {
            let mut scene = Scene::new(config, objects, seed, 50)?;
            scene.system.start_new_frame();
            let stats = scene.system.internal_stats();
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("{}", SpatialInspector::summary(&scene.system));
                print!("{stats}");
            }
        }
    }

    Ok(())
}

/// A spatial system filled with a deterministic scatter of objects.
struct Scene {
    system: RegularGridSpatialSystem,
    tags: TagRegistry,
    foliage: TagSet,
}

impl Scene {
    fn new(config: SpatialConfig, objects: usize, seed: u64, tagged_percent: u64) -> anyhow::Result<Self> {
        let mut system = RegularGridSpatialSystem::try_new(config)?;
        let static_category = system.register_category("Static", CategoryFlags::NONE)?;
        let mut tags = TagRegistry::new();
        let foliage: TagSet = [tags.register("Foliage")].into_iter().collect();

        let mut rng = Scatter::new(seed);
        for i in 0..objects {
            let center = Vec3::new(
                rng.unit() * WORLD_EXTENT,
                rng.unit() * 64.0,
                rng.unit() * WORLD_EXTENT,
            );
            let radius = 0.5 + rng.unit() * 4.0;
            let bounds = BoundingBoxSphere::from_sphere(&Sphere::new(center, radius));
            let object_tags = if rng.next_u64() % 100 < tagged_percent {
                foliage.clone()
            } else {
                TagSet::new()
            };
            system.create_spatial_data(
                &bounds,
                EntityId::from_u128(i as u128),
                static_category.bitmask(),
                &object_tags,
            );
        }
        tracing::info!(objects, seed, "scene populated");

        Ok(Self {
            system,
            tags,
            foliage,
        })
    }

    fn everything(&self) -> Aabb {
        Aabb::new(Vec3::splat(-100.0), Vec3::new(WORLD_EXTENT + 100.0, 200.0, WORLD_EXTENT + 100.0))
    }
}

fn run_queries(scene: &Scene) -> anyhow::Result<()> {
    let system = &scene.system;
    let all = QueryParams::new(u32::MAX);
    let center = Vec3::new(WORLD_EXTENT * 0.5, 32.0, WORLD_EXTENT * 0.5);

    let mut hits = 0usize;
    let stats = system.find_objects_in_sphere(&Sphere::new(center, 200.0), &all, &mut |_: EntityId| {
        hits += 1;
        VisitorExecution::Continue
    });
    println!(
        "Sphere r=200: {hits} hits, tested={} in {:?}",
        stats.num_objects_tested, stats.time_taken
    );

    let mut hits = 0usize;
    let query_box = Aabb::from_center_half_extents(center, Vec3::new(256.0, 64.0, 256.0));
    let foliage_only = QueryParams::new(u32::MAX).with_include_tags(&scene.foliage);
    let stats = system.find_objects_in_box(&query_box, &foliage_only, &mut |_: EntityId| {
        hits += 1;
        VisitorExecution::Continue
    });
    println!(
        "Box 512x128x512 with {}: {hits} hits, filtered={} in {:?}",
        scene.tags.describe(&scene.foliage),
        stats.num_objects_filtered,
        stats.time_taken
    );

    let frustum = Frustum::perspective(
        Vec3::new(0.0, 100.0, 0.0),
        center,
        std::f32::consts::FRAC_PI_3,
        16.0 / 9.0,
        0.1,
        1500.0,
    );
    let mut visible = Vec::new();
    let stats = system.find_visible_objects(&frustum, &all, &mut visible, None, VisibilityState::Direct)?;
    println!(
        "Frustum: {} visible of {}, tested={} in {:?}",
        visible.len(),
        stats.total_num_objects,
        stats.num_objects_tested,
        stats.time_taken
    );
    Ok(())
}

fn watch_cache(scene: &mut Scene, frames: u64) {
    let everything = scene.everything();
    let mut cached = 0;
    let mut ready = 0;

    for frame in 0..frames {
        let params = QueryParams::new(u32::MAX).with_include_tags(&scene.foliage);
        let stats = scene
            .system
            .find_objects_in_box(&everything, &params, &mut |_: EntityId| VisitorExecution::Continue);
        scene.system.start_new_frame();

        let lines = SpatialInspector::grid_lines(&scene.system, &scene.tags);
        let now_cached = lines.iter().filter(|l| l.cached).count();
        let now_ready = lines.iter().filter(|l| l.cached && l.ready).count();
        if now_cached != cached || now_ready != ready {
            println!(
                "frame {frame:>4}: cache grids={now_cached} ready={now_ready} (last query filtered={} in {:?})",
                stats.num_objects_filtered, stats.time_taken
            );
            cached = now_cached;
            ready = now_ready;
        }
    }

    println!("{}", SpatialInspector::summary(&scene.system));
    for line in SpatialInspector::grid_lines(&scene.system, &scene.tags) {
        println!("  {line}");
    }
}

/// Deterministic scatter source.
struct Scatter {
    state: u64,
}

impl Scatter {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = splitmix64(self.state);
        self.state
    }

    /// Uniform in `[0, 1)`.
    fn unit(&mut self) -> f32 {
        (self.next_u64() >> 40) as f32 / (1u64 << 24) as f32
    }
}

fn splitmix64(mut state: u64) -> u64 {
    state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}
