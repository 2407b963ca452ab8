use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use quizkeep::{Document, OperationReport, QuizStoreError, StorageConfig, SyncLayer};
use tracing::info;

#[derive(Parser)]
#[command(name = "quizkeep")]
#[command(about = "Inspect and maintain a local quiz store")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON config file; QUIZKEEP_* environment variables still apply on top
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show which backend is active and how much space is used
    Status,
    /// List finished quizzes
    List,
    /// List drafts
    Drafts,
    /// Save a finished quiz from a JSON file
    Import {
        /// Path to a document JSON file
        file: PathBuf,
    },
    /// Turn a draft into a finished quiz
    Promote {
        /// Draft ID
        id: String,
    },
    /// Delete a finished quiz and its draft
    Delete {
        /// Document ID
        id: String,
    },
    /// Remove drafts that have not been saved for a while
    Cleanup {
        /// Age in days; defaults to the configured draft max age
        #[arg(long)]
        max_age_days: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<(), QuizStoreError> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let max_age_default = config.draft_max_age_days;

    info!("Opening store at {}", config.data_dir.display());
    let layer = SyncLayer::open(config)?;
    let primary_active = layer.initialize_storage().await;

    match cli.command {
        Commands::Status => show_status(&layer, primary_active).await?,
        Commands::List => list_documents(&layer).await,
        Commands::Drafts => list_drafts(&layer).await,
        Commands::Import { file } => import_document(&layer, &file).await?,
        Commands::Promote { id } => promote_draft(&layer, &id).await?,
        Commands::Delete { id } => {
            let report = layer.delete_document(&id).await;
            finish("Deleted", &id, report)?;
        }
        Commands::Cleanup { max_age_days } => {
            let days = max_age_days.unwrap_or(max_age_default);
            let removed = layer.cleanup_aged_drafts(days).await;
            println!("Removed {} drafts older than {} days", removed, days);
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<StorageConfig, QuizStoreError> {
    match path {
        Some(path) => StorageConfig::from_file(path)?.with_overrides(|key| std::env::var(key).ok()),
        None => StorageConfig::from_env(),
    }
}

async fn show_status(layer: &SyncLayer, primary_active: bool) -> Result<(), QuizStoreError> {
    let usage = layer.get_usage().await?;
    let backend = if primary_active { "primary" } else { "fallback" };

    println!("Backend:     {}", backend);
    println!(
        "Used:        {} of {} bytes ({:.1}%)",
        usage.total_bytes,
        usage.ceiling_bytes,
        usage.percentage_used * 100.0
    );
    println!("  documents  {}", usage.collections.documents);
    println!("  drafts     {}", usage.collections.drafts);
    println!("  media      {}", usage.collections.attachments);
    if usage.is_near_limit {
        println!("Storage is nearly full; delete old quizzes or media to free space.");
    }
    Ok(())
}

async fn list_documents(layer: &SyncLayer) {
    let documents = layer.load_documents().await;
    println!("{} finished quizzes", documents.len());
    println!("{}", "-".repeat(50));
    for doc in documents {
        println!(
            "{} - {} ({})",
            doc.id,
            doc.title,
            doc.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
}

async fn list_drafts(layer: &SyncLayer) {
    let drafts = layer.load_drafts().await;
    println!("{} drafts", drafts.len());
    println!("{}", "-".repeat(50));
    for draft in drafts {
        println!(
            "{} - {} (saved {})",
            draft.id,
            draft.title,
            draft.last_saved.format("%Y-%m-%d %H:%M:%S")
        );
    }
}

async fn import_document(layer: &SyncLayer, file: &Path) -> Result<(), QuizStoreError> {
    let data = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let doc: Document = serde_json::from_str(&data)
        .with_context(|| format!("parsing {}", file.display()))?;

    let report = layer.save_document(&doc).await;
    finish("Imported", &doc.id, report)
}

async fn promote_draft(layer: &SyncLayer, id: &str) -> Result<(), QuizStoreError> {
    let draft = layer
        .load_drafts()
        .await
        .into_iter()
        .find(|d| d.id == id)
        .ok_or_else(|| QuizStoreError::NotFound(format!("draft {}", id)))?;

    let report = layer.promote_draft(id, &draft.to_document()).await;
    finish("Promoted", id, report)
}

fn finish(action: &str, id: &str, report: OperationReport) -> Result<(), QuizStoreError> {
    if let Some(failure) = report.error {
        return Err(QuizStoreError::Storage(failure.message));
    }
    if report.used_fallback {
        println!("{} {} (saved to the fallback store)", action, id);
    } else {
        println!("{} {}", action, id);
    }
    Ok(())
}
