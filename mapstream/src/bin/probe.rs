//! Load georeferences, fit a viewport around them and stream the tiles it needs

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use web_time::Instant;

use mapstream::geo::Projection;
use mapstream::iiif::IiifImageProvider;
use mapstream::map::loader::HttpFetcher;
use mapstream::{Collaborators, Event, GeoreferencedMap, MapSystem, MapSystemConfig, Selection, Viewport};

#[derive(Debug, Parser)]
#[clap(name = "mapstream-probe", version)]
struct Cli {
    /// Georeferenced map JSON files
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Optional engine config JSON
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = 1024)]
    width: u32,

    #[arg(long, default_value_t = 768)]
    height: u32,

    /// Zoom in by this factor after fitting all maps
    #[arg(long, default_value_t = 1.0)]
    zoom: f64,

    /// Also fetch overview tiles for nearby maps
    #[arg(long)]
    anticipate: bool,

    /// Give up after this many seconds
    #[arg(long, default_value_t = 60)]
    timeout: u64,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            let json = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            MapSystemConfig::from_json(&json)?
        }
        None => MapSystemConfig::default(),
    };

    let user_agent = concat!("mapstream-probe/", env!("CARGO_PKG_VERSION"));
    let collaborators = Collaborators::new(
        std::sync::Arc::new(HttpFetcher::new(user_agent)?),
        std::sync::Arc::new(IiifImageProvider::new(user_agent)?),
    );
    let mut system = MapSystem::new(config, collaborators);

    let loaded = Rc::new(RefCell::new(0usize));
    let failed = Rc::new(RefCell::new(0usize));
    {
        let loaded = loaded.clone();
        let failed = failed.clone();
        system.subscribe(move |event| match event {
            Event::TileLoaded(_) => *loaded.borrow_mut() += 1,
            Event::TileError { key, message } => {
                *failed.borrow_mut() += 1;
                log::warn!("Tile {:?} failed: {}", key, message);
            }
            Event::AllRequestedTilesLoadedForMap(id) => log::info!("All requested tiles loaded for {}", id),
            other => log::debug!("{:?}", other),
        });
    }

    for path in &cli.files {
        let json = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let georeference = GeoreferencedMap::from_json(&json)?;
        match system.add_map(georeference) {
            Ok(id) => log::info!("Added map {} from {}", id, path.display()),
            Err(e) => log::error!("Skipping {}: {}", path.display(), e),
        }
    }

    let Some(bbox) = system.get_maps_bbox(&Selection::all(), Some(Projection::WebMercator)) else {
        anyhow::bail!("no maps were added");
    };
    let mut viewport = Viewport::fit_bbox(&bbox, cli.width, cli.height, Projection::WebMercator);
    viewport.zoom_by(cli.zoom);

    system.set_anticipate_interaction(cli.anticipate);
    system.set_viewport(viewport);

    let deadline = Instant::now() + Duration::from_secs(cli.timeout);
    loop {
        system.poll_timeout(Duration::from_millis(250));
        let stats = system.cache_stats();
        if stats.pending_count == 0 && system.pending_image_info() == 0 {
            break;
        }
        if Instant::now() >= deadline {
            log::warn!("Timed out with {} tiles pending", stats.pending_count);
            break;
        }
    }

    let stats = system.cache_stats();
    println!(
        "{} maps, {} tiles loaded ({} failed), {} KiB decoded",
        system.list().len(),
        loaded.borrow(),
        failed.borrow(),
        stats.memory_used / 1024
    );
    Ok(())
}
