use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::warn;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use geoalbum::cache::{CycleOutcome, EnsureOutcome, FetchHandle, PhotoCollectionCache, RefreshOutcome};
use geoalbum::config::Config;
use geoalbum::geo::Coordinate;
use geoalbum::materializer::HttpDownloader;
use geoalbum::model::{PhotoId, PinId};
use geoalbum::notifier::{ChangeNotifier, CollectionEventKind, EventStream};
use geoalbum::persistence::PersistenceCoordinator;
use geoalbum::reachability::HostReachability;
use geoalbum::search::FlickrClient;
use geoalbum::store::YamlBackend;

#[derive(Parser)]
#[command(author, version, about = "Drop pins on a map and collect nearby photos for each one")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize with a default config file
    Init {
        /// Force overwrite existing config
        #[arg(short, long)]
        force: bool,

        /// Path to config file
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Drop a pin and fetch its photo collection
    Drop {
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,

        #[arg(long, allow_hyphen_values = true)]
        lon: f64,

        /// Path to config file
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// List pins
    Pins {
        /// Path to config file
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Show a pin's photos, fetching them if there are none yet
    Photos {
        pin: PinId,

        /// Path to config file
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Replace a pin's photos with a new random collection
    Refresh {
        pin: PinId,

        /// Path to config file
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Delete one photo from a pin
    DeletePhoto {
        pin: PinId,
        photo: PhotoId,

        /// Path to config file
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Delete a pin and all its photos
    RemovePin {
        pin: PinId,

        /// Path to config file
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Show configuration and store contents
    Status {
        /// Path to config file
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Init { force, config } => init_config(config, *force),
        Commands::Drop { lat, lon, config } => {
            let coordinate = Coordinate::try_new(*lat, *lon)?;
            let cache = open_cache(&load_config(config)?)?;
            let pin = cache
                .drop_pin(coordinate)
                .with_context(|| format!("Failed to drop pin at {coordinate}"))?;
            println!("Pin {} at {}", pin.id, pin.coordinate);
            ensure_and_watch(&cache, pin.id).await
        }
        Commands::Pins { config } => {
            let cache = open_cache(&load_config(config)?)?;
            let pins = cache.pins();
            if pins.is_empty() {
                println!("No pins yet. Use 'geoalbum drop --lat <LAT> --lon <LON>' to add one.");
            }
            for pin in pins {
                println!(
                    "{}  {}  {} photos",
                    pin.id,
                    pin.coordinate,
                    cache.photos(&pin.id).len()
                );
            }
            Ok(())
        }
        Commands::Photos { pin, config } => {
            let cache = open_cache(&load_config(config)?)?;
            ensure_and_watch(&cache, *pin).await?;
            for photo in cache.photos(pin) {
                println!(
                    "{}  {:>8} bytes  {}  {}",
                    photo.id,
                    photo.image.len(),
                    photo.title,
                    photo.source_url
                );
            }
            Ok(())
        }
        Commands::Refresh { pin, config } => {
            let cache = open_cache(&load_config(config)?)?;
            let mut events = cache.notifier().events();
            match cache.refresh(pin).with_context(|| format!("Failed to refresh pin {pin}"))? {
                RefreshOutcome::Started(handle) => watch(&mut events, handle).await,
                RefreshOutcome::InFlight => {
                    println!("Pin {pin} is already fetching");
                    Ok(())
                }
            }
        }
        Commands::DeletePhoto { pin, photo, config } => {
            let cache = open_cache(&load_config(config)?)?;
            cache
                .delete(pin, photo)
                .with_context(|| format!("Failed to delete photo {photo} from pin {pin}"))?;
            println!("Deleted photo {photo}");
            Ok(())
        }
        Commands::RemovePin { pin, config } => {
            let cache = open_cache(&load_config(config)?)?;
            cache
                .delete_pin(pin)
                .with_context(|| format!("Failed to remove pin {pin}"))?;
            println!("Removed pin {pin}");
            Ok(())
        }
        Commands::Status { config } => {
            let config_data = load_config(config)?;
            println!("geoalbum Status");
            println!("===============");
            println!("Configuration:");
            println!("  Endpoint: {}", config_data.endpoint);
            println!("  Data directory: {}", config_data.data_dir);
            println!("  Photos per collection: {}", config_data.per_page);
            println!(
                "  Search box: +/-{} lon, +/-{} lat",
                config_data.bbox_half_width, config_data.bbox_half_height
            );
            if config_data.has_placeholder_key() {
                println!("  API key: not set");
            }

            let cache = open_cache(&config_data)?;
            let pins = cache.pins();
            let photo_total: usize = pins.iter().map(|p| cache.photos(&p.id).len()).sum();
            println!("Store:");
            println!("  Pins: {}", pins.len());
            println!("  Photos: {}", photo_total);
            Ok(())
        }
    }
}

/// Wires the cache to the on-disk store and the remote service
fn open_cache(config: &Config) -> Result<PhotoCollectionCache> {
    if config.has_placeholder_key() {
        warn!(
            "No API key configured; set api_key or {}",
            geoalbum::config::API_KEY_ENV
        );
    }

    let notifier = ChangeNotifier::spawn();
    let backend = YamlBackend::new(&config.data_dir);
    let coordinator = PersistenceCoordinator::open(Box::new(backend), notifier)
        .with_context(|| format!("Failed to open store in {}", config.data_dir))?;

    let search = FlickrClient::new(config.search_options()).context("Failed to build HTTP client")?;
    let downloader = HttpDownloader::new(search.http_client());

    Ok(PhotoCollectionCache::new(
        Arc::new(coordinator),
        Arc::new(search),
        Arc::new(downloader),
        Arc::new(HostReachability),
        config.cache_settings(),
    ))
}

async fn ensure_and_watch(cache: &PhotoCollectionCache, pin: PinId) -> Result<()> {
    let mut events = cache.notifier().events();
    match cache.ensure(&pin).with_context(|| format!("Failed to load pin {pin}"))? {
        EnsureOutcome::Started(handle) => watch(&mut events, handle).await,
        EnsureOutcome::InFlight => {
            println!("Pin {pin} is already fetching");
            Ok(())
        }
        EnsureOutcome::Ready { count } => {
            println!("Pin {pin} has {count} photos");
            Ok(())
        }
    }
}

/// Prints the cycle's events as they arrive, then waits for it to finish
async fn watch(events: &mut EventStream, handle: FetchHandle) -> Result<()> {
    let pin = handle.pin();
    while let Some(kind) = events.next_for_pin(pin).await {
        print_event(&kind);
        if kind.is_terminal() {
            break;
        }
    }
    match handle.wait().await {
        CycleOutcome::Failed(reason) => Err(anyhow::anyhow!(reason))
            .with_context(|| format!("Fetch for pin {pin} did not complete")),
        CycleOutcome::Aborted => anyhow::bail!("Fetch for pin {pin} was aborted"),
        CycleOutcome::Ready { .. } | CycleOutcome::Empty => Ok(()),
    }
}

fn print_event(kind: &CollectionEventKind) {
    match kind {
        CollectionEventKind::CountAnnounced { expected } => {
            println!("Found {expected} photos, downloading...")
        }
        CollectionEventKind::ItemSaved { index, photo } => {
            println!("  [{}] saved {}", index + 1, photo)
        }
        CollectionEventKind::CollectionReady { actual } => {
            println!("Collection ready with {actual} photos")
        }
        CollectionEventKind::CollectionEmpty => println!("No photos found near this pin"),
        CollectionEventKind::CollectionFailed { reason } => {
            println!("Fetch failed: {reason}");
            if reason.is_retryable() {
                println!("Run the command again to retry");
            }
        }
    }
}

fn init_config(config_path_opt: &Option<PathBuf>, force: bool) -> Result<()> {
    let config_path = Config::get_config_path(config_path_opt);

    if config_path.exists() && !force {
        println!("Config file already exists at {}", config_path.display());
        println!("Use --force to overwrite");
        return Ok(());
    }

    let config = Config::default();
    config
        .save_to_file(&config_path)
        .with_context(|| format!("Failed to write config to {}", config_path.display()))?;

    println!("Created config file at {}", config_path.display());
    Ok(())
}

fn load_config(config_path_opt: &Option<PathBuf>) -> Result<Config> {
    let config_path = Config::get_config_path(config_path_opt);

    if !config_path.exists() {
        anyhow::bail!(
            "Config file not found at {}. Run 'geoalbum init' to create one.",
            config_path.display()
        );
    }

    let config = Config::load_from_file(&config_path)?;
    Ok(resolve_data_dir(config, &config_path))
}

/// A relative `data_dir` is taken relative to the config file
fn resolve_data_dir(mut config: Config, config_path: &Path) -> Config {
    let data_dir = Path::new(&config.data_dir);
    if data_dir.is_relative() {
        if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            config.data_dir = parent.join(data_dir).to_string_lossy().into_owned();
        }
    }
    config
}
