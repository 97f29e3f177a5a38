use std::collections::BTreeMap;
use std::io;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use serde_json::Value as JsonValue;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};
use trips_core::RunRequest;
use trips_pipeline::{
    new_correlation_id, PipelineRunner, RunSummary, Settings, Stage, BOUNDING_BOX_REPORT_KEY,
    REGION_REPORT_KEY,
};

#[derive(Debug, Parser)]
#[command(name = "trips-cli")]
#[command(about = "Trips ETL and reporting runner")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the HTTP API
    Serve,
    /// Create the database schema from the DDL script
    InitDb,
    Ingest(RunArgs),
    Transform(RunArgs),
    /// Schema bootstrap (with --init-db), ingestion, then every transform
    RunAll(RunArgs),
    /// Weekly average trips, filtered by region or bounding box
    WeeklyAverage {
        #[arg(long, conflicts_with = "bbox")]
        region: Option<String>,
        /// min_lon,min_lat,max_lon,max_lat
        #[arg(long, value_delimiter = ',', num_args = 4, allow_hyphen_values = true)]
        bbox: Option<Vec<f64>>,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Run clean_action before the main action
    #[arg(long)]
    full_load: bool,
    #[arg(long)]
    init_db: bool,
}

impl From<&RunArgs> for RunRequest {
    fn from(args: &RunArgs) -> Self {
        RunRequest {
            full_load: args.full_load,
            init_db: args.init_db,
        }
    }
}

/// Everything to stdout, errors additionally to stderr. `RUST_LOG` overrides the default `info`.
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = tracing_subscriber::fmt::layer().with_writer(io::stdout);
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_filter(LevelFilter::ERROR);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(stderr_layer)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let settings = Settings::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => trips_web::serve(&settings).await?,
        Commands::InitDb => {
            PipelineRunner::from_settings(&settings)?.init_db().await?;
            println!("database tables created");
        }
        Commands::Ingest(args) => run_stage(&settings, Stage::Ingest, &args).await?,
        Commands::Transform(args) => run_stage(&settings, Stage::Transform, &args).await?,
        Commands::RunAll(args) => run_stage(&settings, Stage::RunAll, &args).await?,
        Commands::WeeklyAverage { region, bbox } => {
            let (report_key, params) = match (region, bbox) {
                (Some(region), _) => (
                    REGION_REPORT_KEY,
                    BTreeMap::from([("region".to_string(), JsonValue::from(region))]),
                ),
                (None, Some(bbox)) => {
                    let names = ["min_lon", "min_lat", "max_lon", "max_lat"];
                    let params: BTreeMap<String, JsonValue> = names
                        .iter()
                        .zip(bbox)
                        .map(|(name, value)| (name.to_string(), JsonValue::from(value)))
                        .collect();
                    (BOUNDING_BOX_REPORT_KEY, params)
                }
                (None, None) => anyhow::bail!("pass --region or --bbox"),
            };
            let rows = PipelineRunner::from_settings(&settings)?
                .weekly_average(report_key, params)
                .await?;
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "data": rows }))?);
        }
    }

    Ok(())
}

async fn run_stage(settings: &Settings, stage: Stage, args: &RunArgs) -> Result<()> {
    let runner = PipelineRunner::from_settings(settings)?;
    let correlation_id = new_correlation_id();
    let summary: RunSummary = runner.run_stage(stage, args.into(), &correlation_id).await?;
    println!(
        "{} complete: process_id={} jobs={} rows_affected={}",
        stage.label(),
        summary.correlation_id,
        summary.jobs.len(),
        summary.total_affected_rows()
    );
    Ok(())
}
