use cccd_verify::{config::Config, server::CccdServer, store::{ScanStore, ScanWatcher}, verify::FaceVerifier};

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "cccd-verify")]
#[command(about = "CCCD-based exam attendance verification core")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true, default_value = "configs/cccd-verify.toml")]
    config: PathBuf,

    /// Verbose logging with file, line, and thread information
    #[arg(long, global = true)]
    dev: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the CCCD scan listener and log received scans
    Serve,
    /// Compare two face images and print the verdict
    Compare {
        /// Reference image (the CCCD card photo)
        #[arg(short, long)]
        reference: PathBuf,
        /// Candidate image (the live capture)
        #[arg(short, long)]
        candidate: PathBuf,
        /// Distance tolerance override (lower is stricter)
        #[arg(short, long)]
        tolerance: Option<f32>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.dev);

    let config = Config::load_from_path(&cli.config)?;

    match cli.command {
        Commands::Serve => {
            let store = Arc::new(ScanStore::new());
            let server = CccdServer::new(&config, Arc::clone(&store));
            server.start()?;

            // Drain scan notifications on this thread; handler threads only
            // push into the store and the channel.
            let watcher = ScanWatcher::new(store);
            while let Some(event) = watcher.recv() {
                tracing::info!(
                    "Scan received: citizen id {} -> {}",
                    event.citizen_id,
                    event.image_path.display()
                );
            }

            server.stop();
        }
        Commands::Compare {
            reference,
            candidate,
            tolerance,
        } => {
            let verifier = FaceVerifier::new(&config)?;
            let result = match tolerance {
                Some(tolerance) => {
                    verifier.compare_with_tolerance(&reference, &candidate, tolerance)?
                }
                None => verifier.compare(&reference, &candidate)?,
            };

            println!(
                "{} (match: {}, confidence: {:.1}%)",
                result.message(),
                result.is_match,
                result.confidence * 100.0
            );
        }
    }

    Ok(())
}

fn setup_logging(dev_mode: bool) {
    if dev_mode {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt::init();
    }
}
