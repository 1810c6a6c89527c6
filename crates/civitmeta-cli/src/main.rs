use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use civitmeta_engine::{BatchReport, ConverterConfig};
use clap::{CommandFactory, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const AFTER_HELP: &str = "\
Converts SwarmUI metadata embedded in JPEG UserComment fields to the
CivitAI-compatible parameters format.

If a folder is given, every JPEG directly inside it is converted and written
to a 'civitmeta' subfolder. A single file is written beside the input with a
'-civitmeta' suffix. Inputs are never modified.";

#[derive(Debug, Parser)]
#[command(
    name = "civitmeta",
    version,
    about = "SwarmUI to CivitAI metadata converter",
    after_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Convert a JPEG image or a folder of JPEG images.
    Convert(ConvertArgs),
}

#[derive(Debug, Parser)]
struct ConvertArgs {
    /// Path to a JPEG image or a folder containing JPEG images.
    path: Option<PathBuf>,
    /// Hash cache file.
    #[arg(long)]
    cache: Option<PathBuf>,
    /// Diagnostic log file, truncated on start.
    #[arg(long)]
    log: Option<PathBuf>,
    /// Base URL of the hash lookup API.
    #[arg(long)]
    api_base: Option<String>,
    /// Lookup timeout in seconds.
    #[arg(long)]
    timeout: Option<u64>,
    /// Skip remote lookups and use local short hashes.
    #[arg(long)]
    offline: bool,
}

impl ConvertArgs {
    fn apply(&self, mut config: ConverterConfig) -> ConverterConfig {
        if let Some(cache) = &self.cache {
            config.cache_path = cache.clone();
        }
        if let Some(log) = &self.log {
            config.log_path = log.clone();
        }
        if let Some(base) = &self.api_base {
            config.api_base = base.trim_end_matches('/').to_string();
        }
        if let Some(secs) = self.timeout.filter(|secs| *secs > 0) {
            config.lookup_timeout = Duration::from_secs(secs);
        }
        if self.offline {
            config.offline = true;
        }
        config
    }
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("civitmeta error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Some(Command::Convert(args)) => match args.path.clone() {
            Some(path) => run_convert(&args, &path),
            None => print_usage(),
        },
        None => print_usage(),
    }
}

fn print_usage() -> Result<i32> {
    Cli::command().print_long_help()?;
    println!();
    Ok(0)
}

fn run_convert(args: &ConvertArgs, path: &Path) -> Result<i32> {
    let config = args.apply(ConverterConfig::from_env());
    init_logging(&config.log_path);
    info!(
        started_at = %now_utc_iso(),
        path = %path.display(),
        cache = %config.cache_path.display(),
        offline = config.offline,
        "civitmeta run started"
    );

    let mut converter = config.build_converter()?;
    let result = converter.run(path);
    match converter.flush_cache() {
        Ok(()) => info!("Cache saved."),
        Err(err) => warn!("Error saving cache: {err:#}"),
    }
    let report = result?;
    summarize(&report);
    Ok(if report.is_success() { 0 } else { 2 })
}

fn summarize(report: &BatchReport) {
    info!(
        converted = report.processed(),
        total = report.total,
        failed = report.failures.len(),
        "civitmeta run finished"
    );
}

/// Console plus a truncated log file. If the file cannot be created the run
/// continues with console output only.
fn init_logging(log_path: &Path) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = fmt::layer()
        .with_target(false)
        .with_timer(ChronoUtc::rfc_3339());

    let (file_layer, file_error) = match File::create(log_path) {
        Ok(file) => (
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_writer(Mutex::new(file)),
            ),
            None,
        ),
        Err(err) => (None, Some(err)),
    };

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(file_layer)
        .try_init();

    if let Some(err) = file_error {
        warn!(path = %log_path.display(), "diagnostic log unavailable: {err}");
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use civitmeta_engine::ConverterConfig;
    use clap::{CommandFactory, Parser};

    use super::{Cli, Command};

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn bare_invocation_has_no_command() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from(["civitmeta"])?;
        assert!(cli.command.is_none());
        Ok(())
    }

    #[test]
    fn help_flags_do_not_parse_into_a_run() {
        for flag in ["--help", "-h"] {
            let err = Cli::try_parse_from(["civitmeta", flag]).expect_err("help exits");
            assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
        }
    }

    #[test]
    fn convert_flags_override_config() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "civitmeta",
            "convert",
            "pics",
            "--cache",
            "state/cache.json",
            "--api-base",
            "http://127.0.0.1:9/api/",
            "--timeout",
            "4",
            "--offline",
        ])?;
        let Some(Command::Convert(args)) = cli.command else {
            anyhow::bail!("expected convert command");
        };
        assert_eq!(args.path, Some(PathBuf::from("pics")));

        let config = args.apply(ConverterConfig::default());
        assert_eq!(config.cache_path, PathBuf::from("state/cache.json"));
        assert_eq!(config.api_base, "http://127.0.0.1:9/api");
        assert_eq!(config.lookup_timeout, Duration::from_secs(4));
        assert!(config.offline);
        assert_eq!(config.log_path, ConverterConfig::default().log_path);
        Ok(())
    }

    #[test]
    fn convert_without_path_parses() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from(["civitmeta", "convert"])?;
        assert!(matches!(
            cli.command,
            Some(Command::Convert(ref args)) if args.path.is_none()
        ));
        Ok(())
    }
}
