mod config;
mod engine;
mod language;
mod mapping;
mod mutation;
mod project;
mod report;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::engine::{Engine, EngineHandle};
use crate::mapping::Mapping;
use crate::mutation::applier::recover_backups;
use crate::mutation::cache::ResultCache;
use crate::mutation::patterns::PatternTable;
use crate::mutation::MutationKind;
use crate::report::OutputFormat;

/// Exit code for a run that could not complete.
const EXIT_RUN_ERROR: i32 = 2;

#[derive(Parser)]
#[command(name = "killrate")]
#[command(version)]
#[command(about = "Measures whether your tests catch injected bugs")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Mutate source files and score the tests that cover them
    Run(RunArgs),
    /// Show which source file a test maps to
    Map {
        /// Project root
        root: PathBuf,
        /// Test file (path, file name, or stem)
        test: String,
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Restore files left mutated by a crashed run
    Recover {
        /// Project root
        root: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Project root
    root: Option<PathBuf>,

    /// Only run this test, or every test mapped to this source file
    #[arg(long)]
    filter: Option<String>,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Report format
    #[arg(long, value_enum, default_value = "text")]
    format: OutputFormat,

    /// Write the report here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Mutation kinds to apply, comma separated
    #[arg(long, value_delimiter = ',')]
    kinds: Vec<MutationKind>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match cli.command.unwrap_or(Commands::Run(cli.run)) {
        Commands::Run(args) => run(args).await,
        Commands::Map { root, test, config } => map(&root, &test, config.as_deref()),
        Commands::Recover { root } => recover(&root),
    };

    let code = code.unwrap_or_else(|e| {
        tracing::error!("{:#}", e);
        eprintln!("error: {:#}", e);
        EXIT_RUN_ERROR
    });
    std::process::exit(code);
}

/// Initialize logging: `RUST_LOG` wins, else the configured level.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>, root: &Path) -> anyhow::Result<Config> {
    match Config::load(path, root) {
        Ok(config) => {
            init_logging(&config.general.log_level);
            Ok(config)
        }
        Err(e) => {
            init_logging("info");
            Err(e).context("Failed to load configuration")
        }
    }
}

async fn run(args: RunArgs) -> anyhow::Result<i32> {
    let Some(root) = args.root else {
        anyhow::bail!("No project root given (usage: killrate run <ROOT>)");
    };

    let mut config = load_config(args.config.as_deref(), &root)?;
    if !args.kinds.is_empty() {
        config.mutation.kinds = args.kinds;
    }
    config.validate()?;

    let cache = match &config.cache.path {
        Some(path) => {
            let path = if path.is_absolute() {
                path.clone()
            } else {
                root.join(path)
            };
            ResultCache::load(&path, config.cache.capacity)?
        }
        None => ResultCache::new(config.cache.capacity),
    };
    let table = PatternTable::compile().context("Failed to compile mutation patterns")?;

    let engine = Engine::new(Arc::new(config), Arc::new(table), Arc::new(cache));

    let handle = engine.handle();
    let watched_root = root.clone();
    tokio::spawn(async move {
        if let Some(code) = watch_interrupts(tokio::signal::ctrl_c, handle, watched_root).await {
            std::process::exit(code);
        }
    });

    let summary = engine.run(&root, args.filter.as_deref()).await?;

    let rendered = report::render(&summary, args.format)?;
    report::emit(&rendered, args.output.as_deref())?;

    if summary.interrupted {
        tracing::warn!("Run was interrupted; results are partial");
        return Ok(EXIT_RUN_ERROR);
    }
    Ok(summary.exit_code())
}

/// First interrupt drains the run; a second one asks to quit at once.
///
/// Returns the exit code to quit with, after putting back any file a trial
/// still has mutated. `None` means the signal stream failed.
async fn watch_interrupts<F, Fut>(mut next: F, handle: EngineHandle, root: PathBuf) -> Option<i32>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    next().await.ok()?;
    handle.stop();

    next().await.ok()?;
    tracing::warn!("Interrupted again, exiting without waiting for in-flight trials");
    // Exiting skips the appliers' restore guards
    match recover_backups(&root) {
        Ok(restored) => {
            for path in &restored {
                tracing::warn!("Restored {}", path.display());
            }
        }
        Err(e) => tracing::error!("Failed to restore mutated files: {:#}", e),
    }
    Some(EXIT_RUN_ERROR)
}

fn map(root: &Path, test: &str, config_path: Option<&Path>) -> anyhow::Result<i32> {
    let config = load_config(config_path, root)?;
    let (layout, mapping) = engine::map_test(Arc::new(config), root, test)?;

    match &mapping {
        Mapping::Mapped(ranked) => {
            println!("{} maps to:", test);
            for candidate in ranked {
                println!(
                    "  {:.2}  {:<16} {}",
                    candidate.confidence,
                    candidate.strategy.to_string(),
                    layout.relative(&candidate.source_file).display()
                );
            }
            for alternative in mapping.close_alternatives() {
                println!(
                    "warning: {} is nearly as likely",
                    layout.relative(&alternative.source_file).display()
                );
            }
            Ok(0)
        }
        Mapping::Unmapped { best_rejected } => {
            println!("{} is unmapped", test);
            if let Some(candidate) = best_rejected {
                println!(
                    "  best rejected: {} via {} at {:.2}",
                    layout.relative(&candidate.source_file).display(),
                    candidate.strategy,
                    candidate.confidence
                );
            }
            Ok(1)
        }
    }
}

fn recover(root: &Path) -> anyhow::Result<i32> {
    init_logging("info");
    let restored = recover_backups(root)?;
    if restored.is_empty() {
        println!("Nothing to recover under {}", root.display());
    } else {
        for path in &restored {
            println!("restored {}", path.display());
        }
    }
    Ok(0)
}
