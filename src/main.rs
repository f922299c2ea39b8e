//! Keel - a manifest-driven deployment orchestrator
//!
//! This is the main CLI entry point for Keel.

use clap::{Parser, Subcommand, ValueEnum};
use keel::deploy::{Collaborators, DeploymentExecutor};
use keel::error::{KeelError, Result};
use keel::graph::DependencyGraph;
use keel::health::{HealthCheckEngine, SystemProbe};
use keel::manifest::{ManifestParser, ValidatedManifest, DEFAULT_MANIFEST_FILES};
use keel::plan::{self, ExecutionPlan};
use keel::rollback::{targets_from_state, RollbackManager};
use keel::settings::{DeploymentConfig, Overrides, Settings};
use keel::state::{StateStore, StateTracker, StatusReport};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Keel - manifest-driven deployment orchestrator
#[derive(Parser)]
#[command(name = "keel")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Deploy services from a manifest in dependency-ordered, health-gated phases", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Settings file
    #[arg(long, global = true, env = "KEEL_CONFIG")]
    config: Option<PathBuf>,

    /// Manifest file
    #[arg(short, long, global = true, env = "KEEL_MANIFEST")]
    file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Clone, Copy, ValueEnum)]
enum GraphFormat {
    Dot,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the manifest
    Validate,

    /// Print the execution plan
    Plan {
        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Show what a deploy would change against the recorded state
    Diff,

    /// Print the dependency graph
    Graph {
        #[arg(long, value_enum, default_value_t = GraphFormat::Dot)]
        format: GraphFormat,
    },

    /// Deploy the manifest
    Deploy {
        /// Log collaborator calls instead of making them
        #[arg(long)]
        dry_run: bool,
        /// Leave applied services in place on failure
        #[arg(long)]
        no_rollback: bool,
        /// Concurrent services per phase
        #[arg(long, env = "KEEL_MAX_PARALLEL")]
        max_parallel: Option<usize>,
        /// Overall health budget per service (seconds)
        #[arg(long, env = "KEEL_HEALTH_TIMEOUT")]
        health_timeout: Option<u64>,
        /// Attempts per collaborator call
        #[arg(long, env = "KEEL_RETRY_ATTEMPTS")]
        retry_attempts: Option<u32>,
        /// Base delay between collaborator retries (seconds)
        #[arg(long, env = "KEEL_RETRY_DELAY")]
        retry_delay: Option<u64>,
        /// Limit for a single hook call (seconds)
        #[arg(long, env = "KEEL_HOOK_TIMEOUT")]
        hook_timeout: Option<u64>,
    },

    /// Show per-service deployment status
    Status {
        /// Run health checks against deployed services
        #[arg(long)]
        probe: bool,
        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Tear down deployed services (all, or the named ones)
    Rollback {
        services: Vec<String>,
    },
}

/// Everything a command needs besides its own arguments
struct Context {
    manifest_path: PathBuf,
    settings: Settings,
    store: StateStore,
}

impl Context {
    fn load(cli: &Cli) -> Result<Self> {
        let settings = Settings::load(cli.config.as_deref())?;

        let manifest_path = match cli.file {
            Some(ref path) => path.clone(),
            None => {
                let cwd = std::env::current_dir()?;
                ManifestParser::find_manifest_file(&cwd).ok_or_else(|| {
                    KeelError::ManifestParse(format!(
                        "no manifest found in {} (looked for {})",
                        cwd.display(),
                        DEFAULT_MANIFEST_FILES.join(", ")
                    ))
                })?
            }
        };

        let manifest_dir = manifest_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let store = StateStore::new(settings.state_dir_for(manifest_dir));

        Ok(Self {
            manifest_path,
            settings,
            store,
        })
    }

    fn validate(&self, overrides: &Overrides) -> Result<ValidatedManifest> {
        let manifest = ManifestParser::parse_file(&self.manifest_path)?;
        let overrides = self.settings.overrides.clone().merged_with(overrides);
        let config = DeploymentConfig::resolve(&manifest, &overrides);
        keel::manifest::validate(manifest, config)
    }

    fn plan(&self, overrides: &Overrides) -> Result<(ValidatedManifest, ExecutionPlan)> {
        let validated = self.validate(overrides)?;
        let plan = plan::plan(&validated)?;
        Ok((validated, plan))
    }

    fn engine(&self) -> HealthCheckEngine {
        let probe = SystemProbe::new(self.settings.probe_timeout())
            .with_remote_shell(self.settings.remote_shell.clone());
        HealthCheckEngine::new(Arc::new(probe))
    }
}

async fn run(cli: Cli) -> Result<()> {
    let ctx = Context::load(&cli)?;
    tracing::debug!("Using manifest {}", ctx.manifest_path.display());

    match cli.command {
        Commands::Validate => {
            let validated = ctx.validate(&Overrides::default())?;
            for warning in validated.warnings() {
                println!("warning: {}", warning);
            }
            println!(
                "{}: manifest is valid ({} service(s), {} enabled)",
                ctx.manifest_path.display(),
                validated.services().len(),
                validated.enabled_services().count()
            );
        }

        Commands::Plan { format } => {
            let (_, plan) = ctx.plan(&Overrides::default())?;
            match format {
                Format::Text => print!("{}", plan.to_text()),
                Format::Json => println!("{}", plan.to_json()?),
            }
        }

        Commands::Diff => {
            let validated = ctx.validate(&Overrides::default())?;
            let state = ctx.store.load().await?;
            print!("{}", StateTracker::diff(&validated, &state).to_text());
        }

        Commands::Graph { format } => {
            let (validated, plan) = ctx.plan(&Overrides::default())?;
            let graph = DependencyGraph::build(&validated, Some(&plan));
            match format {
                GraphFormat::Dot => print!("{}", graph.to_dot()),
                GraphFormat::Json => println!("{}", graph.to_json()?),
            }
        }

        Commands::Deploy {
            dry_run,
            no_rollback,
            max_parallel,
            health_timeout,
            retry_attempts,
            retry_delay,
            hook_timeout,
        } => {
            let overrides = Overrides {
                health_check_timeout: health_timeout,
                retry_attempts,
                retry_delay,
                hook_timeout,
                ..Default::default()
            };
            let (validated, plan) = ctx.plan(&overrides)?;
            let prior = ctx.store.load().await?;

            let executor = DeploymentExecutor::new(
                Collaborators::from_hooks(&ctx.settings.hooks),
                ctx.engine(),
            )
            .with_store(ctx.store.clone())
            .with_max_parallel(max_parallel.unwrap_or_else(|| ctx.settings.max_parallel()))
            .with_rollback(!no_rollback)
            .dry_run(dry_run);

            let report = executor.execute(&validated, &plan, &prior).await?;
            print!("{}", report.to_text());
            if let Some(err) = report.failure_error() {
                return Err(err);
            }
        }

        Commands::Status { probe, format } => {
            let validated = ctx.validate(&Overrides::default())?;
            let state = ctx.store.load().await?;
            let mut report = StatusReport::build(&validated, &state);
            if probe {
                report = report.probe(&validated, &ctx.engine()).await;
            }
            match format {
                Format::Text => print!("{}", report.to_text()),
                Format::Json => println!("{}", report.to_json()?),
            }
        }

        Commands::Rollback { services } => {
            let (validated, plan) = ctx.plan(&Overrides::default())?;
            let mut state = ctx.store.load().await?;

            if let Some(unknown) = services.iter().find(|s| !state.is_recorded(s)) {
                return Err(KeelError::ServiceNotFound(unknown.clone()));
            }

            let targets = targets_from_state(&validated, &plan, &state, &services);
            if targets.is_empty() {
                println!("Nothing to roll back");
                return Ok(());
            }

            let manager =
                RollbackManager::from_collaborators(&Collaborators::from_hooks(&ctx.settings.hooks))
                    .with_hook_timeout(validated.config().hook_timeout);
            let report = manager.rollback(&targets).await;

            for name in report.torn_down() {
                state = StateTracker::forget(&state, name);
            }
            ctx.store.save(&state).await?;

            for entry in &report.entries {
                let outcome = if entry.succeeded() { "rolled back" } else { "failed" };
                println!("{:<20} {}", entry.service, outcome);
            }
            if let Some(err) = report.into_error() {
                return Err(err);
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.debug {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}
