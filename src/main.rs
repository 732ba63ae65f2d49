use clap::{Parser, Subcommand, ValueEnum};
use log::{LevelFilter, Log, Metadata, Record};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use kiln::batch::{self, Batch, BatchReport};
use kiln::config::{EmitterConfig, ReportFormat};
use kiln::jit::hex_dump;

// Wrapper type for clap ValueEnum support
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum ReportFormatArg {
    #[default]
    Human,
    Json,
}

impl From<ReportFormatArg> for ReportFormat {
    fn from(arg: ReportFormatArg) -> Self {
        match arg {
            ReportFormatArg::Human => ReportFormat::Human,
            ReportFormatArg::Json => ReportFormat::Json,
        }
    }
}

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Streaming JIT emitter with deferred relocation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a sample batch and config
    Init {
        /// Target directory (defaults to the current directory)
        dir: Option<PathBuf>,
    },
    /// Emit a batch, resolve its relocations and print the result
    Emit {
        /// Batch file (.toml or .json)
        batch: PathBuf,

        /// Config file (defaults to kiln.toml next to the batch, if present)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Trace emission events to stderr
        #[arg(long)]
        trace: bool,

        /// Initial buffer size in bytes
        #[arg(long)]
        initial_size: Option<usize>,

        /// Output format (human, json)
        #[arg(long, value_enum)]
        format: Option<ReportFormatArg>,

        /// Panic on invariant violations
        #[arg(long)]
        abort_on_invariant: bool,
    },
}

/// Minimal stderr logger, enabled by --trace.
struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { dir } => {
            let dir = dir.unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
            if let Err(e) = batch::init_batch(&dir) {
                eprintln!("{}", e);
                return ExitCode::FAILURE;
            }
        }
        Commands::Emit {
            batch,
            config,
            trace,
            initial_size,
            format,
            abort_on_invariant,
        } => {
            let mut config = match load_config(&batch, config.as_deref()) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("{}", e);
                    return ExitCode::FAILURE;
                }
            };
            config.trace |= trace;
            config.abort_on_invariant_violation |= abort_on_invariant;
            if let Some(size) = initial_size {
                config.initial_buffer_size = size;
            }
            if let Some(format) = format {
                config.format = format.into();
            }

            if config.trace && log::set_logger(&LOGGER).is_ok() {
                log::set_max_level(LevelFilter::Trace);
            }

            let format = config.format;
            let result = Batch::load(&batch).and_then(|b| batch::emit_batch(&b, config));
            match result {
                Ok(report) => print_report(&report, format),
                Err(e) => {
                    eprintln!("error: {}", e);
                    return ExitCode::FAILURE;
                }
            }
        }
    }

    ExitCode::SUCCESS
}

fn load_config(batch: &Path, explicit: Option<&Path>) -> Result<EmitterConfig, String> {
    if let Some(path) = explicit {
        return EmitterConfig::load(path);
    }
    let beside = batch
        .parent()
        .unwrap_or(Path::new("."))
        .join(EmitterConfig::FILE_NAME);
    if beside.exists() {
        EmitterConfig::load(&beside)
    } else {
        Ok(EmitterConfig::default())
    }
}

fn print_report(report: &BatchReport, format: ReportFormat) {
    match format {
        ReportFormat::Json => match serde_json::to_string_pretty(report) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("failed to serialize report: {}", e),
        },
        ReportFormat::Human => {
            for func in &report.functions {
                println!(
                    "{} ({}) @ {:#x}: {} bytes, {} relocations",
                    func.name, func.id, func.address, func.size, func.relocations
                );
                print!("{}", hex_dump(func.address, &func.code));
            }
            println!();
            println!(
                "{} functions, {} retries, {} relocations, {} code bytes, {} arena bytes",
                report.stats.functions,
                report.stats.retries,
                report.stats.relocations,
                report.stats.code_bytes,
                report.arena_bytes
            );
        }
    }
}
