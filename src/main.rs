use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use rgeocoder::generator::{Generator, GeneratorConfig, ProgressSink};
use rgeocoder::geocoder::RGeocoder;
use rgeocoder::{create_router, AppState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "rgeocoder", about = "Reverse geocoder with a pregenerated points cache")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a points file from one or more OSM PBF extracts.
    Generate {
        /// Input .osm.pbf files; several inputs are merged.
        #[arg(short, long = "input", required = true)]
        inputs: Vec<PathBuf>,
        /// Output points file; the .rgc suffix is enforced.
        #[arg(short, long = "points")]
        points: PathBuf,
        /// Worker threads, defaults to the number of logical CPUs.
        #[arg(short, long)]
        threads: Option<usize>,
        /// Preferred name localization, e.g. "en".
        #[arg(short, long)]
        locale: Option<String>,
    },
    /// Serve the reverse-geocoding API from a points file.
    Serve {
        /// Points file produced by `generate` (optionally .zst compressed).
        #[arg(short, long = "points")]
        points: PathBuf,
        #[arg(long, default_value = "0.0.0.0:8080")]
        listen: SocketAddr,
    },
}

/// Progress bar wiring for the generator stages.
struct BarProgress {
    bar: Mutex<Option<ProgressBar>>,
}

impl BarProgress {
    fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }
}

impl ProgressSink for BarProgress {
    fn begin(&self, stage: &str, total: u64) {
        let bar = ProgressBar::new(total);
        bar.set_style(
            ProgressStyle::with_template(
                "{prefix} {bar:40} {human_pos}/{human_len} [{elapsed_precise}]",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar.set_prefix(stage.to_owned());
        *self.bar.lock().unwrap() = Some(bar);
    }

    fn inc(&self, delta: u64) {
        if let Some(bar) = self.bar.lock().unwrap().as_ref() {
            bar.inc(delta);
        }
    }

    fn finish(&self) {
        if let Some(bar) = self.bar.lock().unwrap().take() {
            bar.finish();
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rgeocoder=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Generate {
            inputs,
            points,
            threads,
            locale,
        } => generate(inputs, points, threads, locale),
        Command::Serve { points, listen } => serve(points, listen).await,
    };

    if let Err(err) = result {
        tracing::error!("{err}");
        std::process::exit(1);
    }
}

fn generate(
    inputs: Vec<PathBuf>,
    points: PathBuf,
    threads: Option<usize>,
    locale: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = GeneratorConfig::default();
    if let Some(threads) = threads {
        config.threads = threads.max(1);
    }
    if let Some(locale) = locale {
        config.preferred_localization = locale;
    }

    tracing::info!(?inputs, threads = config.threads, "indexing input maps");
    let db = rgeocoder::database::Database::open_many(&inputs)?;

    let mut generator =
        Generator::new(db, config)?.with_progress(Arc::new(BarProgress::new()));
    generator.parse()?;
    generator.reset_caches();

    let output = normalize_points_path(points);
    tracing::info!(points = generator.point_count(), output = %output.display(), "saving");
    generator.save(&output)?;
    Ok(())
}

async fn serve(
    points: PathBuf,
    listen: SocketAddr,
) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(points = %points.display(), "loading points file");
    let geocoder = RGeocoder::load_from_file(&points)?;

    let state = AppState {
        geocoder: Arc::new(geocoder),
    };
    let app = create_router(state);

    tracing::info!("serving on http://{listen}");
    let listener = tokio::net::TcpListener::bind(listen).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Output files always carry the `.rgc` suffix.
fn normalize_points_path(mut path: PathBuf) -> PathBuf {
    if !path.extension().is_some_and(|ext| ext == "rgc") {
        path.set_extension("rgc");
    }
    path
}
