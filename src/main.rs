use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{error, info};
use uuid::Uuid;

use workflow_core::adapters::Registry;
use workflow_core::executor::Executor;
use workflow_core::local;
use workflow_core::model::SYSTEM_TENANT_ID;
use workflow_core::queue::JobQueue;
use workflow_core::seed::{self, SeedOptions};
use workflow_core::store::DefinitionStore;
use workflow_core::worker::Worker;

#[derive(Parser)]
#[command(name = "workflow-core", version, about = "Multi-tenant DAG workflow execution core")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs the worker loop: dequeues jobs from Redis and executes them
    /// against Postgres-backed project definitions.
    Worker,
    /// Upserts the built-in block catalog (and the system demo project)
    /// into the database.
    Seed {
        /// Only report what would change; writes nothing.
        #[arg(long)]
        dry_run: bool,
        /// Only validate the built-in catalog; writes nothing, ignores
        /// `--dry-run`'s classification output.
        #[arg(long)]
        validate: bool,
        /// Print every classified entry, not just changed ones.
        #[arg(long)]
        verbose: bool,
        /// Seed only blocks, skipping the system project.
        #[arg(long, conflicts_with = "projects_only")]
        blocks_only: bool,
        /// Seed only the system project, skipping blocks.
        #[arg(long)]
        projects_only: bool,
        /// Tenant to seed the system project under (defaults to the system tenant).
        #[arg(long)]
        tenant_id: Option<Uuid>,
    },
    /// Loads a project definition from a local YAML/JSON file and executes
    /// it in-process, with no database or queue involved.
    RunFlow {
        /// Path to the project definition file.
        path: PathBuf,
        /// JSON input document to pass to entry steps.
        #[arg(long)]
        input: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "workflow_core=info".to_string()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Worker => run_worker().await,
        Commands::Seed {
            dry_run,
            validate,
            verbose,
            blocks_only,
            projects_only,
            tenant_id,
        } => {
            run_seed(SeedOptions {
                validate_only: validate,
                dry_run,
                verbose,
                blocks_only,
                projects_only,
                tenant_id: tenant_id.unwrap_or(SYSTEM_TENANT_ID),
            })
            .await
        }
        Commands::RunFlow { path, input } => run_flow_local(path, input).await,
    }
}

async fn run_worker() -> anyhow::Result<()> {
    let database_url = std::env::var("DATABASE_URL").map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let redis_url = std::env::var("REDIS_URL").map_err(|_| anyhow::anyhow!("REDIS_URL must be set"))?;

    let pool = sqlx::postgres::PgPoolOptions::new().connect(&database_url).await?;
    let store = DefinitionStore::new(pool);
    store.migrate().await?;

    let queue = JobQueue::connect(&redis_url).await?;
    let worker = Worker::new(store, queue, Registry::with_builtins());

    let shutdown = worker.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    info!("worker starting");
    worker.run().await?;
    info!("worker stopped");
    Ok(())
}

async fn run_seed(options: SeedOptions) -> anyhow::Result<()> {
    if options.validate_only {
        return match seed::validate_catalog(&workflow_core::catalog::builtin_blocks()) {
            Ok(()) => {
                println!("catalog is valid");
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "catalog validation failed");
                std::process::exit(1);
            }
        };
    }

    let database_url = std::env::var("DATABASE_URL").map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = sqlx::postgres::PgPoolOptions::new().connect(&database_url).await?;
    let store = DefinitionStore::new(pool);
    store.migrate().await?;

    let verbose = options.verbose;
    let dry_run = options.dry_run;
    match seed::run_seed(&store, &options).await {
        Ok(report) => {
            for entry in &report.blocks {
                if verbose || entry.classification != seed::Classification::Unchanged {
                    println!("{:<24} {:<12} in_code={} stored={:?}", entry.slug, entry.classification.label(), entry.in_code_version, entry.stored_version);
                }
            }
            if dry_run {
                println!("dry run: no changes written");
            } else {
                println!("seed complete");
            }
            Ok(())
        }
        Err(err) => {
            error!(error = %err, "seed failed");
            std::process::exit(1);
        }
    }
}

async fn run_flow_local(path: PathBuf, input: Option<String>) -> anyhow::Result<()> {
    let definition = local::load_project_file(&path)?;
    let input_value: Option<Value> = input.map(|raw| serde_json::from_str(&raw)).transpose()?;

    let executor = Executor::new(Registry::with_builtins());
    match local::run_local(definition, input_value, &executor).await {
        Ok(result) => {
            println!("output: {}", serde_json::to_string_pretty(&result.output)?);
            for step_run in &result.step_runs {
                println!("  {} [{:?}] attempt={} seq={}", step_run.step_name, step_run.status, step_run.attempt, step_run.sequence_number);
            }
            Ok(())
        }
        Err(err) => {
            error!(error = %err, "run failed");
            std::process::exit(1);
        }
    }
}
