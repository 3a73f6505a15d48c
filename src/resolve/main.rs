//! Place resolution pipeline.
//!
//! Collects populated places for a mountain region, deduplicates them,
//! measures their distance to the region perimeter and matches each one to
//! its nearest airport and hospital.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use ridgeline::boundary::CountryLookup;
use ridgeline::config::Config;
use ridgeline::facility::{
    load_airports, FacilityMatcher, MatchMode, MatcherConfig, OpenAiLookup, OsrmClient, RoutingService,
};
use ridgeline::models::FacilityKind;
use ridgeline::pipeline::{
    collect_places, expand_envelope, load_region_perimeter, match_facilities, overpass_client, region_envelope, resolve_places,
    write_csv, MatchOptions, ResolveSettings, Snapshot,
};
use ridgeline::sources::build_client;

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Parser, Debug)]
#[command(name = "resolve")]
#[command(about = "Resolve places in a mountain region and match them to airports and hospitals")]
struct Args {
    /// TOML configuration file; built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for places.json and places.csv
    #[arg(long, default_value = "outputs")]
    out_dir: PathBuf,

    /// Continue from an existing places.json, skipping completed matches
    #[arg(long)]
    resume: bool,

    #[arg(long)]
    skip_hospitals: bool,

    /// Match at most this many pending places per facility kind
    #[arg(long)]
    limit: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_from_file(path)?,
        None => Config::default(),
    };
    if args.limit.is_some() {
        config.batch.limit = args.limit;
    }
    config.validate().context("Invalid configuration")?;

    info!("Ridgeline resolve: {}", config.region.name());

    let client = build_client(Duration::from_secs(120))?;
    let perimeter = load_region_perimeter(&config).context("Failed to load the region perimeter")?;
    let envelope = region_envelope(&perimeter, &config);

    std::fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("Failed to create {}", args.out_dir.display()))?;
    let snapshot_path = args.out_dir.join("places.json");

    let mut snapshot = if args.resume && snapshot_path.exists() {
        let snapshot = Snapshot::load(&snapshot_path)?;
        info!(
            "Resuming {} places from {} (written {})",
            snapshot.places.len(),
            snapshot_path.display(),
            snapshot.generated_at
        );
        snapshot
    } else {
        let lookup = CountryLookup::load(&client, &config.boundaries, &config.retry).await;
        let combined = collect_places(&client, &config, envelope).await?;
        let (places, _) = resolve_places(
            combined,
            &lookup,
            &perimeter,
            &ResolveSettings::from_config(&config),
        );
        Snapshot::new(config.region.slug(), places)
    };
    snapshot.save(&snapshot_path)?;

    let router: Arc<dyn RoutingService> = Arc::new(OsrmClient::new(
        client.clone(),
        &config.routing.base_url,
        Duration::from_secs(config.routing.timeout_secs),
    ));
    let pacing = Duration::from_millis(config.routing.pacing_ms);
    let options = |mode| MatchOptions {
        mode,
        concurrency: config.batch.concurrency,
        pacing,
        limit: config.batch.limit,
        show_progress: true,
    };

    // Airports
    let airport_config = MatcherConfig {
        k: config.airports.k,
        max_radius_km: config.airports.max_radius_km,
        pacing,
        retry: config.retry.clone(),
    };
    let (airports, mode) = if config.airports.live_lookup {
        (Vec::new(), MatchMode::Live)
    } else {
        let airports = load_airports(
            &client,
            &config.airports.cache_path,
            &config.airports.dataset_url,
            &config.retry,
            Duration::from_secs(120),
        )
        .await
        .unwrap_or_else(|e| {
            warn!("Airport dataset unavailable: {}", e);
            Vec::new()
        });
        (airports, MatchMode::Offline)
    };
    let mut airport_matcher = FacilityMatcher::new(FacilityKind::Airport, airports, router.clone(), airport_config);
    if mode == MatchMode::Live {
        let api_key = std::env::var(&config.live_lookup.api_key_env)
            .with_context(|| format!("{} is not set", config.live_lookup.api_key_env))?;
        airport_matcher = airport_matcher.with_live_lookup(Arc::new(OpenAiLookup::new(
            client.clone(),
            &config.live_lookup.base_url,
            &config.live_lookup.model,
            api_key,
            Duration::from_secs(config.live_lookup.timeout_secs),
        )));
    }
    match_facilities(&mut snapshot.places, &airport_matcher, &options(mode)).await;
    snapshot.save(&snapshot_path)?;

    // Hospitals
    if args.skip_hospitals || !config.hospitals.enabled {
        info!("Skipping hospital matching");
    } else {
        let search_area = expand_envelope(envelope, config.hospitals.max_radius_km);
        let hospitals = overpass_client(&client, &config).fetch_hospitals(search_area).await;
        let hospital_matcher = FacilityMatcher::new(
            FacilityKind::Hospital,
            hospitals,
            router.clone(),
            MatcherConfig {
                k: config.hospitals.k,
                max_radius_km: config.hospitals.max_radius_km,
                pacing,
                retry: config.retry.clone(),
            },
        );
        match_facilities(&mut snapshot.places, &hospital_matcher, &options(MatchMode::Offline)).await;
        snapshot.save(&snapshot_path)?;
    }

    let csv_path = args.out_dir.join("places.csv");
    write_csv(&csv_path, &snapshot.places)?;
    info!(
        "Wrote {} places to {} and {}",
        snapshot.places.len(),
        snapshot_path.display(),
        csv_path.display()
    );

    Ok(())
}
