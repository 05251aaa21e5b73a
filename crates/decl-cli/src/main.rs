use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use decl_core::{Filter, JobId, JobStatus, MAX_PAGE_SIZE};
use decl_storage::records_to_csv;
use decl_sync::{CollectionEngine, EngineConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const STATUS_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Parser)]
#[command(name = "decl-cli")]
#[command(about = "Collect nested tables from the public declarations API")]
struct Cli {
    /// Fallback log filter when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the JSON API
    Serve {
        #[arg(long, env = "DECL_WEB_PORT", default_value_t = 8000)]
        port: u16,
    },
    /// Run one collection job in the foreground; Ctrl-C stops it early
    Collect(CollectArgs),
    /// List stored datasets, newest first
    History,
    /// List the section catalog
    Sections,
    /// Write a stored dataset as CSV
    Export {
        task_id: JobId,
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

#[derive(Debug, clap::Args)]
struct CollectArgs {
    /// Catalog name or inline path such as "['data']['rows']"
    #[arg(long)]
    section: String,
    #[arg(long)]
    year: i32,
    #[arg(long)]
    declarant_type: Option<i64>,
    #[arg(long = "type")]
    declaration_type: Option<i64>,
    #[arg(long)]
    institution_group: Option<i64>,
    #[arg(long)]
    institution: Option<i64>,
    #[arg(long, default_value_t = 0)]
    offset: u32,
    #[arg(long, default_value_t = MAX_PAGE_SIZE)]
    limit: u32,
    /// Restrict the job to these declaration ids (repeatable)
    #[arg(long = "retry-id")]
    retry_ids: Vec<i64>,
}

impl CollectArgs {
    fn into_filter(self) -> Filter {
        let mut filter = Filter::new(self.section, self.year);
        filter.declarant_type = self.declarant_type;
        filter.declaration_type = self.declaration_type;
        filter.institution_group = self.institution_group;
        filter.institution = self.institution;
        filter.offset = self.offset;
        filter.limit = self.limit;
        filter.retry_ids = self.retry_ids.into_iter().collect();
        filter
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = EngineConfig::from_env();
    match cli.command {
        Commands::Serve { port } => {
            let engine = CollectionEngine::from_config(config)?;
            decl_web::serve(engine, port).await?;
        }
        Commands::Collect(args) => {
            let engine = CollectionEngine::from_config(config)?;
            collect(&engine, args.into_filter()).await?;
        }
        Commands::History => {
            let engine = CollectionEngine::from_config(config)?;
            let items = engine.store().history().await?;
            if items.is_empty() {
                println!("no stored datasets in {}", engine.config().data_dir.display());
            }
            for meta in items {
                println!(
                    "{} {} section={} year={} status={} declarations={} rows={} failed={}",
                    meta.saved_at.format("%Y-%m-%d %H:%M:%S"),
                    meta.task_id,
                    meta.filters.section,
                    meta.filters.year,
                    meta.status,
                    meta.total_declarations,
                    meta.total_rows,
                    meta.failed_ids.len()
                );
            }
        }
        Commands::Sections => {
            let catalog = config.load_catalog()?;
            for entry in catalog.entries() {
                println!("{:<16} {}", entry.name, entry.path);
            }
        }
        Commands::Export { task_id, output } => {
            let engine = CollectionEngine::from_config(config)?;
            let Some(dataset) = engine.store().load(task_id).await? else {
                bail!("no stored dataset for {task_id}");
            };
            let csv = records_to_csv(&dataset.records);
            match output {
                Some(path) => {
                    std::fs::write(&path, csv).with_context(|| format!("writing {}", path.display()))?;
                    println!("wrote {} rows to {}", dataset.records.len(), path.display());
                }
                None => print!("{csv}"),
            }
        }
    }

    Ok(())
}

async fn collect(engine: &CollectionEngine, filter: Filter) -> Result<()> {
    let task_id = engine.start_job(filter)?;
    info!(%task_id, "collection started");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut stop_sent = false;
    let mut last_message = String::new();

    let state = loop {
        let state = engine.query_status(task_id)?;
        if state.message != last_message {
            println!("[{}] {}", state.status, state.message);
            last_message = state.message.clone();
        }
        if state.status.is_terminal() {
            break state;
        }
        tokio::select! {
            _ = &mut ctrl_c, if !stop_sent => {
                stop_sent = true;
                if engine.request_stop(task_id) {
                    warn!(%task_id, "stop requested; waiting for in-flight requests");
                }
            }
            _ = tokio::time::sleep(STATUS_POLL) => {}
        }
    };

    if state.status == JobStatus::Error {
        bail!("job {task_id} failed: {}", state.message);
    }

    if let Some(meta) = engine.store().load_metadata(task_id).await? {
        println!(
            "job {} {}: declarations={} rows={} failed={} stopped_early={}",
            task_id,
            meta.status,
            meta.total_declarations,
            meta.total_rows,
            meta.failed_ids.len(),
            meta.stopped_early
        );
        for failed in &meta.failed_ids {
            println!("  failed {}: {}", failed.id, failed.reason);
        }
        println!("dataset stored under {}", engine.config().data_dir.display());
    }
    Ok(())
}
