/*
 * Command-line front end of the data manager. `run` drives every configured instrument
 * through read, transform and write and leaves a report directory behind; `inspect` stops
 * after the read phase and lists the packages that a run would archive.
 */
mod core;
mod instruments;

use crate::core::path_utils::{self, APP_NAME};
use crate::core::{
    ManagerError, ReportCollector, RunContext, SveaConfig, SveaDataManager, TempDirectory,
    TransformOptions, parse_key_value,
};
use clap::{Args, Parser, Subcommand};
use log::LevelFilter;
use simplelog::{
    ColorChoice, CombinedLogger, Config, ConfigBuilder, SharedLogger, TermLogger, TerminalMode,
    WriteLogger,
};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

const LOG_FILE_NAME: &str = "svea_data_manager.log";
const TEMP_EVICTION_DAYS: u64 = 7;

#[derive(Debug, Parser)]
#[command(name = "svea_data_manager", version, about = "Archives instrument files from R/V Svea")]
struct Cli {
    /// Level of terminal output (off, error, warn, info, debug, trace).
    #[arg(long, global = true, default_value = "info", env = "SVEA_LOG_LEVEL", value_parser = parse_level)]
    log_level: LevelFilter,

    /// Log file; defaults to the per-user log directory.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Read, transform and write every configured instrument.
    Run(RunArgs),
    /// Read phase only: list packages and resources.
    Inspect(InspectArgs),
}

#[derive(Debug, Args)]
struct ConfigArgs {
    /// YAML configuration with one section per instrument.
    #[arg(short, long, env = "SVEA_CONFIG")]
    config: PathBuf,

    /// Template variable substituted into the configuration (KEY=VALUE).
    #[arg(long = "var", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    vars: Vec<(String, String)>,

    /// Staging directory for synthesized files; defaults to ~/sdm_temp.
    #[arg(long)]
    temp_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[command(flatten)]
    config: ConfigArgs,

    /// Run-time metadata such as ship, cruise, comment or quality_flag (KEY=VALUE).
    #[arg(long = "meta", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    meta: Vec<(String, String)>,

    /// Where run reports are written; defaults to the per-user report directory.
    #[arg(long)]
    report_dir: Option<PathBuf>,

    /// Leave staged files in the temp directory after writing.
    #[arg(long)]
    keep_temp: bool,
}

#[derive(Debug, Args)]
struct InspectArgs {
    #[command(flatten)]
    config: ConfigArgs,

    /// Print the packages as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug)]
enum CliError {
    Config(crate::core::config::ConfigError),
    Manager(ManagerError),
    Setup(String),
}

impl From<crate::core::config::ConfigError> for CliError {
    fn from(err: crate::core::config::ConfigError) -> Self {
        CliError::Config(err)
    }
}

impl From<ManagerError> for CliError {
    fn from(err: ManagerError) -> Self {
        CliError::Manager(err)
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Config(e) => write!(f, "Configuration error: {e}"),
            CliError::Manager(e) => write!(f, "{e}"),
            CliError::Setup(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for CliError {}

fn log_config() -> Config {
    ConfigBuilder::new()
        .set_thread_level(LevelFilter::Off)
        .set_target_level(LevelFilter::Off)
        .build()
}

fn parse_level(text: &str) -> Result<LevelFilter, String> {
    text.parse::<LevelFilter>()
        .map_err(|_| format!("unknown log level '{text}'"))
}

/*
 * Terminal output at `level`, plus a debug-level log file. A log file that cannot be
 * opened is reported on the terminal and otherwise ignored.
 */
fn init_logging(level: LevelFilter, log_file: Option<PathBuf>) {
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        level,
        log_config(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];
    let log_path =
        log_file.or_else(|| path_utils::get_log_dir(APP_NAME).map(|dir| dir.join(LOG_FILE_NAME)));
    let mut file_error = None;
    if let Some(path) = &log_path {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => loggers.push(WriteLogger::new(LevelFilter::Debug, log_config(), file)),
            Err(e) => file_error = Some(format!("Could not open log file {path:?}: {e}")),
        }
    }
    if CombinedLogger::init(loggers).is_err() {
        return;
    }
    if let Some(msg) = file_error {
        log::warn!("Main: {msg}");
    }
    log::debug!("Main: Logging initialized, log file {log_path:?}");
}

/// Idempotent logger setup for tests.
#[cfg(test)]
pub fn initialize_logging() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = simplelog::TestLogger::init(LevelFilter::Debug, log_config());
    });
}

fn load_config(args: &ConfigArgs) -> Result<SveaConfig, CliError> {
    let variables: BTreeMap<String, String> = args.vars.iter().cloned().collect();
    Ok(SveaConfig::load(&args.config, &variables)?)
}

fn run_context(args: &ConfigArgs) -> Result<RunContext, CliError> {
    let temp_dir = match &args.temp_dir {
        Some(path) => TempDirectory::new(path),
        None => {
            let temp_dir = TempDirectory::default_location()
                .map_err(|e| CliError::Setup(format!("No temp directory: {e}")))?;
            // Only the dedicated default location is evicted by age.
            match temp_dir.clear(TEMP_EVICTION_DAYS) {
                Ok(removed) => log::debug!("Main: Evicted {removed} stale temp entries."),
                Err(e) => log::warn!("Main: Could not evict stale temp entries: {e}"),
            }
            temp_dir
        }
    };
    Ok(RunContext::new(
        Arc::new(crate::core::EventBus::new()),
        Arc::new(temp_dir),
    ))
}

fn build_manager(args: &ConfigArgs) -> Result<SveaDataManager, CliError> {
    let config = load_config(args)?;
    let manager =
        SveaDataManager::from_config(&config, run_context(args)?, instruments::build_pipeline)?;
    log::info!(
        "Main: Registered instruments: {}",
        manager.instrument_names().join(", ")
    );
    Ok(manager)
}

fn write_reports(collector: &ReportCollector, report_dir: Option<&Path>) {
    let directory = match report_dir {
        Some(dir) => Some(dir.to_path_buf()),
        None => path_utils::get_report_dir(APP_NAME),
    };
    let Some(directory) = directory else {
        log::warn!("Main: No report directory available, reports not written.");
        return;
    };
    match collector.write_reports(&directory) {
        Ok(run_dir) => log::info!("Main: Reports written to {run_dir:?}"),
        Err(e) => log::error!("Main: Could not write reports to {directory:?}: {e}"),
    }
}

fn run(args: &RunArgs) -> Result<(), CliError> {
    let mut manager = build_manager(&args.config)?;
    manager.set_clear_temp_after_write(!args.keep_temp);
    let collector = ReportCollector::new();
    collector.attach(manager.events());

    let options = TransformOptions::new(args.meta.iter().cloned().collect());
    let result = manager.run(&options);
    // Written for failed runs too.
    write_reports(&collector, args.report_dir.as_deref());
    let reports = result?;

    for (instrument, packages) in &reports {
        let written: usize = packages.iter().map(|r| r.written.len()).sum();
        let existing: usize = packages.iter().map(|r| r.skipped_existing.len()).sum();
        log::info!(
            "Main: {instrument}: {written} file(s) written, {existing} already archived, {} package(s).",
            packages.len()
        );
    }
    Ok(())
}

fn inspect(args: &InspectArgs) -> Result<(), CliError> {
    let mut manager = build_manager(&args.config)?;
    manager.read_packages()?;

    let mut listing = Vec::new();
    for pipeline in manager.instruments() {
        let packages = pipeline.packages().map_err(|e| ManagerError::Instrument {
            instrument: pipeline.name().to_string(),
            source: e,
        })?;
        for package in packages.iter() {
            let resources: Vec<serde_json::Value> = package
                .resources()
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "source_path": r.source_path(),
                        "kind": r.kind().as_str(),
                        "target_path": r.target_path(),
                        "attributes": r.attributes.to_map(),
                    })
                })
                .collect();
            listing.push(serde_json::json!({
                "instrument": pipeline.name(),
                "package": package.key(),
                "resources": resources,
            }));
        }
    }

    if args.json {
        let text = serde_json::to_string_pretty(&listing)
            .map_err(|e| CliError::Setup(format!("Could not serialize listing: {e}")))?;
        println!("{text}");
        return Ok(());
    }
    for entry in &listing {
        println!(
            "{} {}",
            entry["instrument"].as_str().unwrap_or(""),
            entry["package"].as_str().unwrap_or("")
        );
        for resource in entry["resources"].as_array().into_iter().flatten() {
            let target = resource["target_path"].as_str().unwrap_or("-");
            println!(
                "    {} [{}] -> {target}",
                resource["source_path"].as_str().unwrap_or(""),
                resource["kind"].as_str().unwrap_or("")
            );
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_level, cli.log_file.clone());

    let result = match &cli.command {
        Command::Run(args) => run(args),
        Command::Inspect(args) => inspect(args),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(CliError::Manager(e)) if e.is_cruise_error() => {
            log::error!("Main: {e}");
            log::error!("Main: Supply the cruise number with --meta cruise=NN and run again.");
            ExitCode::from(3)
        }
        Err(e) => {
            log::error!("Main: {e}");
            ExitCode::FAILURE
        }
    }
}
