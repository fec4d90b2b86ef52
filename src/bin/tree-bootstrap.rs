//! tree-bootstrap CLI
//!
//! Prepares a workspace for the build driver.
//!
//! Usage:
//!   tree-bootstrap [-C <workspace>] bootstrap [--manifest <path>] [--force]
//!   tree-bootstrap [-C <workspace>] configure [--compiler=<c>] [--target=<t>] [--flag=<f>]...
//!   tree-bootstrap [-C <workspace>] status
//!   tree-bootstrap [-C <workspace>] gc

use clap::{Parser, Subcommand};
use env_logger::Env;
use log::LevelFilter;
use std::path::PathBuf;
use std::process::ExitCode;

use tree_bootstrap::configure::{self, ConfigOptions};
use tree_bootstrap::orchestrator::{self, BootstrapOptions, Orchestrator};
use tree_bootstrap::{CancelToken, Error, Result, WorkspaceLayout};

#[derive(Parser)]
#[command(name = "tree-bootstrap")]
#[command(about = "Fetch, install and configure an OS build workspace", version)]
struct Cli {
    /// Workspace root
    #[arg(short = 'C', long = "workspace", global = true, default_value = ".")]
    workspace: PathBuf,

    /// Debug logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve, fetch and install every artifact in the manifest
    Bootstrap {
        /// Manifest path (default: <workspace>/bootstrap.toml)
        #[arg(long)]
        manifest: Option<PathBuf>,

        /// Ignore the cache and installed records, repairing divergent state
        #[arg(long)]
        force: bool,

        /// Do not write the default configuration
        #[arg(long)]
        no_configure: bool,

        /// Skip the host tool check
        #[arg(long)]
        skip_preflight: bool,

        /// Parallel fetch/install workers
        #[arg(long, value_parser = clap::value_parser!(usize))]
        workers: Option<usize>,
    },

    /// Validate options and persist the build configuration
    Configure {
        #[arg(long, conflicts_with = "defaults")]
        compiler: Option<String>,

        #[arg(long, conflicts_with = "defaults")]
        target: Option<String>,

        /// Feature flag; repeatable
        #[arg(long = "flag", conflicts_with = "defaults")]
        flags: Vec<String>,

        /// Replace an existing configuration
        #[arg(long)]
        overwrite: bool,

        /// Use the default compiler and target
        #[arg(long)]
        defaults: bool,
    },

    /// Show installed artifacts and the current configuration
    Status,

    /// Remove cache entries no installed artifact references
    Gc,
}

fn init_logging(verbose: bool, quiet: bool) {
    let default_level = if verbose {
        LevelFilter::Debug
    } else if quiet {
        LevelFilter::Warn
    } else {
        LevelFilter::Info
    };
    let mut builder =
        env_logger::Builder::from_env(Env::default().default_filter_or(default_level.as_str()));
    builder.format_timestamp(None).format_target(false);
    let _ = builder.try_init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let layout = WorkspaceLayout::new(cli.workspace);

    match cli.command {
        Commands::Bootstrap {
            manifest,
            force,
            no_configure,
            skip_preflight,
            workers,
        } => {
            let cancel = CancelToken::new();
            if let Err(e) = cancel.install_handler() {
                log::warn!("interrupt handler not installed: {e}");
            }
            let opts = BootstrapOptions {
                manifest,
                force,
                configure: !no_configure,
                skip_preflight,
                workers,
            };
            let mut orch = Orchestrator::new(layout).with_cancel(cancel);
            let report = orch.run(&opts).inspect_err(|_| {
                log::error!("bootstrap halted at stage: {}", orch.stage());
            })?;

            println!(
                "{} artifact(s): {} installed, {} already present ({} downloaded, {} from cache)",
                report.plan.len(),
                report.install.installed.len(),
                report.install.skipped.len(),
                report.downloaded,
                report.cache_hits
            );
            if let Some(path) = &report.configured {
                println!("Wrote default configuration: {}", path.display());
            }
            println!("Workspace {}", report.stage);
        }

        Commands::Configure {
            compiler,
            target,
            flags,
            overwrite,
            defaults,
        } => {
            let options = if defaults {
                ConfigOptions::default()
            } else {
                ConfigOptions {
                    compiler,
                    target,
                    flags,
                }
            };
            let config = configure::generate(&options)?;
            layout.ensure()?;
            let path = configure::persist(&config, &layout, overwrite)?;
            println!(
                "Configured {} for {} -> {}",
                config.compiler,
                config.target,
                path.display()
            );
        }

        Commands::Status => print_status(&layout)?,

        Commands::Gc => {
            let report = orchestrator::collect_garbage(&layout)?;
            println!(
                "Removed {} cache file(s), {} bytes",
                report.removed_files, report.removed_bytes
            );
        }
    }

    Ok(())
}

fn print_status(layout: &WorkspaceLayout) -> Result<()> {
    let status = orchestrator::status(layout)?;

    if status.state.artifacts.is_empty() {
        println!("No artifacts installed");
    } else {
        println!("Installed artifacts:");
        for (name, rec) in &status.state.artifacts {
            let installed_at = rec
                .installed_at
                .format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_else(|_| rec.installed_at.to_string());
            let targets: Vec<String> =
                rec.targets.iter().map(|t| t.display().to_string()).collect();
            println!(
                "  {:<20} {:<12} {}  {}",
                name,
                rec.version,
                installed_at,
                targets.join(", ")
            );
        }
    }

    for target in &status.missing_targets {
        println!("  MISSING: {} (re-run `bootstrap --force`)", target.display());
    }

    match &status.config {
        Some(cfg) => {
            let flags: Vec<&str> = cfg.flags.iter().map(String::as_str).collect();
            println!();
            println!("Configuration:");
            println!("  compiler: {} (linker {})", cfg.compiler, cfg.linker);
            println!("  target:   {}", cfg.target);
            println!(
                "  flags:    {}",
                if flags.is_empty() { "-".to_string() } else { flags.join(", ") }
            );
        }
        None => println!("\nNot configured (run `configure`)"),
    }

    if !status.missing_targets.is_empty() {
        return Err(Error::StateInconsistency {
            divergences: status
                .missing_targets
                .iter()
                .map(|t| format!("{} is recorded but missing", t.display()))
                .collect(),
        });
    }
    Ok(())
}
