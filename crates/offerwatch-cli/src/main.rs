use anyhow::Result;
use clap::{Parser, Subcommand};
use offerwatch_sync::{RunError, SyncConfig};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "offerwatch")]
#[command(about = "Collect new job offers into a dated CSV store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every configured source and persist unseen offers.
    Sync,
    /// Summarize the newest store files.
    Report {
        #[arg(long, default_value_t = 7)]
        days: usize,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => match offerwatch_sync::run_sync_once_from_env().await {
            Ok(summary) => {
                println!(
                    "sync complete: run_id={} sources={} failed={} candidates={} new={} store={}",
                    summary.run_id,
                    summary.sources.len(),
                    summary.failed_sources(),
                    summary.candidates,
                    summary.new_offers,
                    summary.store_path.display()
                );
            }
            Err(err) => {
                if let Some(run_err) = err.downcast_ref::<RunError>() {
                    eprintln!("sync failed at {} stage: {err:#}", run_err.stage());
                    if let RunError::Write { new_offers, .. } = run_err {
                        eprintln!("unsaved new offers:");
                        for offer in new_offers {
                            eprintln!("  {} | {} | {}", offer.title, offer.company, offer.url);
                        }
                    }
                }
                return Err(err);
            }
        },
        Commands::Report { days } => {
            let config = SyncConfig::from_env();
            let report = offerwatch_sync::report_store_markdown(days, Some(config.offers_dir))?;
            println!("{report}");
        }
    }

    Ok(())
}
