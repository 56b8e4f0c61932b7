mod logging;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dcs_pipeline::{CatalogPipeline, PipelineConfig};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "dcs-cli")]
#[command(about = "Daily catalog snapshot command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the ingestion pipeline once.
    Run {
        /// Emit the full result record as JSON instead of a summary.
        #[arg(long)]
        json: bool,
    },
    /// Print the read-only snapshot store summary.
    Report,
    /// Keep running the pipeline on the configured cron schedule.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init("info");
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run { json: false }) {
        Commands::Run { json } => {
            let pipeline = CatalogPipeline::new(PipelineConfig::from_env())?;
            match pipeline.run().await {
                Ok(result) => {
                    if json {
                        println!("{}", serde_json::to_string_pretty(&result)?);
                    } else {
                        println!("pipeline result: {}", result.status);
                        println!(
                            "records: {} stored / {} fetched",
                            result.records_stored, result.records_fetched
                        );
                    }
                }
                Err(failure) => {
                    // The finalized FAILED result is still emitted before the
                    // process fails its own run.
                    if json {
                        println!("{}", serde_json::to_string_pretty(&failure.result)?);
                    }
                    eprintln!("pipeline error: {}", failure.source);
                    std::process::exit(1);
                }
            }
        }
        Commands::Report => {
            let pipeline = CatalogPipeline::new(PipelineConfig::from_env())?;
            let report = pipeline.report()?;
            println!("{}", report.to_markdown(chrono::Local::now().date_naive()));
        }
        Commands::Schedule => {
            let mut config = PipelineConfig::from_env();
            config.scheduler_enabled = true;
            let cron = config.ingest_cron.clone();
            let pipeline = Arc::new(CatalogPipeline::new(config)?);
            if let Some(mut sched) = pipeline.maybe_build_scheduler().await? {
                sched.start().await.context("starting scheduler")?;
                info!(%cron, "scheduler running, press ctrl-c to stop");
                tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
                sched.shutdown().await.context("stopping scheduler")?;
            }
        }
    }

    Ok(())
}
