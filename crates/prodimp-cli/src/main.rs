use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use prodimp_core::JobState;
use prodimp_jobs::{ImportConfig, ImportRuntime};
use prodimp_storage::{MemoryCatalog, PgCatalog};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "prodimp")]
#[command(about = "Bulk CSV product importer")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API and the job reaper.
    Serve,
    /// Import one CSV file and print the final job state.
    Import {
        path: PathBuf,
        /// Write to an in-memory catalog instead of Postgres.
        #[arg(long)]
        dry_run: bool,
    },
    /// Create the products and webhooks tables if missing.
    Migrate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()) {
            Some(v) if v == "json" => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let format = LogFormat::parse(std::env::var("PRODIMP_LOG_FORMAT").ok().as_deref());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer().with_target(false)).try_init()?,
        LogFormat::Json => registry.with(fmt::layer().json()).try_init()?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => prodimp_web::serve_from_env().await?,
        Commands::Import { path, dry_run } => {
            import_file(ImportConfig::from_env(), &path, dry_run).await?
        }
        Commands::Migrate => {
            let config = ImportConfig::from_env();
            let catalog = PgCatalog::connect(&config.database_url, 1).await?;
            catalog.ensure_schema().await.context("ensuring schema")?;
            println!("schema ready");
        }
    }

    Ok(())
}

async fn import_file(config: ImportConfig, path: &Path, dry_run: bool) -> Result<()> {
    let runtime = if dry_run {
        info!("dry run: writing to an in-memory catalog");
        let catalog = Arc::new(MemoryCatalog::new());
        ImportRuntime::build(config, catalog.clone(), catalog)?
    } else {
        ImportRuntime::connect(config).await?
    };

    let staged = runtime
        .uploads
        .stage_copy(path)
        .await
        .with_context(|| format!("staging {}", path.display()))?;
    let (job_id, state) = runtime.service.run_now(&staged.path).await?;
    runtime.shutdown(Duration::from_secs(30)).await;

    println!("job {job_id}");
    println!("{}", serde_json::to_string_pretty(&state)?);
    if let JobState::Failed { error } = state {
        bail!(error);
    }
    Ok(())
}
