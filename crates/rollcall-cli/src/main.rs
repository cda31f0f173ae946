mod config;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use rollcall_core::ingest;
use rollcall_core::ledger::{LedgerError, TIME_FORMAT};
use rollcall_core::onnx::OnnxProvider;
use rollcall_core::{
    AttendanceRecord, AttendanceSession, Gallery, GalleryStore, IdentityMatch, RecordOutcome,
};
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-recognition attendance register", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a face from one or more photos
    Register {
        /// Name to register the face under
        #[arg(short, long)]
        name: String,
        /// Photos of the person
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Identify everyone in a photo and mark them present
    Mark { image: PathBuf },
    /// Identify everyone in a photo without recording attendance
    Identify { image: PathBuf },
    /// Show the attendance ledger
    Attendance {
        #[arg(long)]
        json: bool,
    },
    /// List registered identities
    List {
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load().context("failed to load configuration")?;

    match cli.command {
        Commands::Register { name, images } => register(&config, &name, &images),
        Commands::Mark { image } => mark(&config, &image),
        Commands::Identify { image } => identify(&config, &image),
        Commands::Attendance { json } => attendance(&config, json),
        Commands::List { json } => list(&config, json),
    }
}

fn open_session(config: &Config) -> Result<AttendanceSession<OnnxProvider>> {
    let model_dir = config.model_dir();
    let provider = OnnxProvider::load(&model_dir, config.verify_threshold)
        .with_context(|| format!("failed to load face models from {}", model_dir.display()))?;
    Ok(AttendanceSession::new(
        provider,
        GalleryStore::open(config.gallery_dir()),
        config.ledger(),
        config.session_config(),
    ))
}

fn load_gallery(store: &GalleryStore) -> Result<Gallery> {
    let gallery = store.load_all().context("failed to load face gallery")?;
    tracing::debug!(identities = gallery.len(), "gallery loaded");
    Ok(gallery)
}

fn register(config: &Config, name: &str, paths: &[PathBuf]) -> Result<()> {
    let mut images = Vec::with_capacity(paths.len());
    for path in paths {
        match ingest::open_image(path) {
            Ok(image) => images.push(image),
            Err(e) => eprintln!("Skipping {}: {e}", path.display()),
        }
    }

    let session = open_session(config)?;
    let mut gallery = load_gallery(session.store())?;
    let outcome = session
        .register(&mut gallery, name, &images)
        .with_context(|| format!("failed to register {name:?}"))?;

    println!(
        "Registered {name}: {} new reference(s), {} already present, {} photo(s) without a face",
        outcome.added,
        outcome.already_present,
        outcome.skipped + paths.len() - images.len()
    );
    Ok(())
}

fn mark(config: &Config, path: &Path) -> Result<()> {
    let image = ingest::open_image(path).context("failed to read photo")?;
    let session = open_session(config)?;
    let gallery = load_gallery(session.store())?;

    let now = chrono::Local::now().naive_local();
    let outcomes = session.mark_attendance(&gallery, &image, now);

    let mut failed = 0;
    for outcome in &outcomes {
        if matches!(outcome.recorded, Some(Err(_))) {
            failed += 1;
        }
        println!(
            "{}: {}",
            describe_match(&outcome.identity),
            describe_record(outcome.recorded.as_ref())
        );
    }

    if failed > 0 {
        bail!("{failed} attendance record(s) could not be written");
    }
    Ok(())
}

fn identify(config: &Config, path: &Path) -> Result<()> {
    let image = ingest::open_image(path).context("failed to read photo")?;
    let session = open_session(config)?;
    let gallery = load_gallery(session.store())?;

    for identity in session.identify(&gallery, &image) {
        println!("{}", describe_match(&identity));
    }
    Ok(())
}

fn attendance(config: &Config, json: bool) -> Result<()> {
    let ledger = config.ledger();
    let records = ledger.read_all().context("failed to read attendance")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else {
        print!("{}", render_attendance(&records));
    }
    Ok(())
}

#[derive(Serialize)]
struct IdentitySummary<'a> {
    name: &'a str,
    references: usize,
}

fn list(config: &Config, json: bool) -> Result<()> {
    let gallery = load_gallery(&GalleryStore::open(config.gallery_dir()))?;
    let summaries: Vec<IdentitySummary<'_>> = gallery
        .identities()
        .iter()
        .map(|identity| IdentitySummary {
            name: &identity.name,
            references: identity.references.len(),
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
    } else if summaries.is_empty() {
        println!("No faces registered");
    } else {
        for summary in &summaries {
            println!("{:<24} {} reference(s)", summary.name, summary.references);
        }
    }
    Ok(())
}

fn describe_match(identity: &IdentityMatch) -> String {
    let mut text = identity.name.clone();
    if let Some(distance) = identity.confidence {
        text.push_str(&format!(" (distance {distance:.3})"));
    }
    if let Some(bbox) = identity.bbox {
        text.push_str(&format!(
            " at [{:.0}, {:.0}, {:.0}x{:.0}]",
            bbox.x, bbox.y, bbox.width, bbox.height
        ));
    }
    text
}

fn describe_record(recorded: Option<&Result<RecordOutcome, LedgerError>>) -> String {
    match recorded {
        None => "not recorded".to_string(),
        Some(Ok(RecordOutcome::Appended)) => "attendance recorded".to_string(),
        Some(Ok(RecordOutcome::Suppressed { previous })) => {
            format!("already recorded at {}", previous.format(TIME_FORMAT))
        }
        Some(Err(e)) => format!("identified, but attendance NOT recorded ({e})"),
    }
}

fn render_attendance(records: &[AttendanceRecord]) -> String {
    if records.is_empty() {
        return "No attendance recorded yet.\n".to_string();
    }
    let mut out = format!("{:<24} {}\n", "Name", "Time");
    for record in records {
        out.push_str(&format!(
            "{:<24} {}\n",
            record.name,
            record.time.format(TIME_FORMAT)
        ));
    }
    out
}
