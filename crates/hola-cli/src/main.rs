use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use hola::drivers::DriverContext;
use hola::engine;
use hola::lock::{DEFAULT_LOCK_PATH, RunLock};

mod progress;
mod recipe;

use progress::ProgressReporter;

#[derive(Parser, Debug)]
#[command(name = "hola", version)]
#[command(about = "Declarative host configuration: converge a machine against a recipe")]
struct Cli {
    /// Tracing filter (overrides HOLA_LOG), e.g. "hola=debug"
    #[arg(long)]
    log_filter: Option<String>,

    /// Disable colored output.
    #[arg(long)]
    no_color: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Converge the host against a recipe manifest.
    Apply {
        /// Path to the recipe manifest (JSON).
        recipe: PathBuf,

        /// Write the run report as JSON to this path.
        #[arg(long)]
        report: Option<PathBuf>,

        /// Location of the run lock.
        #[arg(long, default_value = DEFAULT_LOCK_PATH)]
        lock_path: PathBuf,

        /// Skip run-lock acquisition.
        #[arg(long)]
        no_lock: bool,
    },
    /// Load and validate a recipe manifest without applying it.
    Validate {
        /// Path to the recipe manifest (JSON).
        recipe: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_filter.as_deref());

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(filter: Option<&str>) {
    use tracing_subscriber::EnvFilter;

    let filter = match filter {
        Some(spec) => EnvFilter::new(spec),
        None => EnvFilter::try_from_env("HOLA_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    match cli.cmd {
        Commands::Apply {
            recipe,
            report,
            lock_path,
            no_lock,
        } => {
            let resources = recipe::load_recipe(&recipe)?;

            let _lock = if no_lock {
                None
            } else {
                Some(RunLock::acquire(&lock_path).context("failed to acquire run lock")?)
            };

            let mut reporter = ProgressReporter::new(cli.no_color);
            let ctx = DriverContext::default();
            let outcome = engine::run(&resources, &ctx, &mut reporter);

            match outcome {
                Ok(run_report) => {
                    reporter.finish(&run_report);
                    if let Some(path) = report {
                        let body = serde_json::to_vec_pretty(&run_report)
                            .context("failed to serialize run report")?;
                        std::fs::write(&path, body).with_context(|| {
                            format!("failed to write report {}", path.display())
                        })?;
                    }
                    Ok(())
                }
                Err(err) => Err(err),
            }
        }
        Commands::Validate { recipe } => {
            let resources = recipe::load_recipe(&recipe)?;
            eprintln!(
                "recipe ok: {} resource{}",
                resources.len(),
                if resources.len() == 1 { "" } else { "s" }
            );
            Ok(())
        }
    }
}
