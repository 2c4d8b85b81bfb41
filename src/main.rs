use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tabsync::Pipeline;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tabsync")]
#[command(about = "Retrieve data from a source and write it to a destination according to a config file")]
struct Args {
    /// Path to JSON configuration file
    config_file: PathBuf,

    /// Log filter, e.g. "debug" or "tabsync=debug" (overrides RUST_LOG)
    #[arg(long)]
    log_level: Option<String>,
}

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(args: &Args) -> Result<()> {
    let mut pipeline = Pipeline::from_config_file(&args.config_file)?;
    let report = pipeline.run()?;
    info!(
        "Run {} finished: {} rows extracted{}",
        report.run_id,
        report.rows_extracted,
        if report.schema_inferred { ", schema inferred" } else { "" }
    );
    Ok(())
}

fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init_logging(args.log_level.as_deref());

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Pipeline failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
