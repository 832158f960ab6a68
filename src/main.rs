//! # ragloop CLI
//!
//! ```bash
//! ragloop --config ./config/ragloop.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ragloop init` | Create the storage directories |
//! | `ragloop ingest <path>` | Chunk and index `.md` / `.txt` files |
//! | `ragloop ask "<question>"` | Answer a question and learn from it |
//! | `ragloop feedback <id> <rating>` | Rate an answer (-1, 0 or 1) |
//! | `ragloop indexes` | List registered indexes |
//! | `ragloop state [kind]` | Print learned weights |
//! | `ragloop cache <action>` | Cleanup, clear or forget cached answers |
//! | `ragloop analyze` | Offline report and policy proposals |
//!
//! Logs go to stderr (`RUST_LOG` overrides the default `info` level) so
//! stdout stays machine-readable with `--json`.

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use ragloop::blob_fs::FileBlobStore;
use ragloop::config::{self, DEFAULT_CONFIG_PATH};
use ragloop::ingest;
use ragloop::service::RagService;
use ragloop_core::feedback::FeedbackOutcome;
use ragloop_core::router::GENERAL_ROLE;
use ragloop_core::state::EntityKind;

/// ragloop: retrieval-augmented answers that learn from their own evaluations
/// and from user feedback.
#[derive(Parser)]
#[command(name = "ragloop", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the storage directories. Safe to run repeatedly.
    Init,

    /// Ingest a text file or a directory of `.md` / `.txt` files.
    ///
    /// All new or changed documents go into one new index.
    Ingest {
        path: PathBuf,

        /// Index role used by the pattern router (`definition`, `procedure`, `general`, ...).
        #[arg(long, default_value = GENERAL_ROLE)]
        role: String,

        /// Short description of the index, used by the embedding router.
        #[arg(long)]
        summary: Option<String>,
    },

    /// Answer a question.
    Ask {
        question: String,

        /// Print the full response as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Rate an answer: -1 (bad), 0 (neutral) or 1 (good).
    Feedback {
        feedback_id: String,

        #[arg(allow_hyphen_values = true, value_parser = clap::value_parser!(i8).range(-1..=1))]
        rating: i8,

        #[arg(long, default_value = "")]
        comment: String,
    },

    /// List registered indexes.
    Indexes,

    /// Print learned state for documents, chunks or indexes.
    State {
        #[arg(default_value = "indexes")]
        kind: String,
    },

    /// Cache lifecycle operations.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Aggregate stored evaluations and feedback, and propose policy changes.
    Analyze,

    /// Print shell completions.
    Completions { shell: Shell },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Drop invalid and expired entries.
    Cleanup,
    /// Drop every entry.
    Clear,
    /// Invalidate entries stored for exactly this question.
    Forget { query: String },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "ragloop", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let store = FileBlobStore::open(&cfg.storage.root)?;
            println!("Storage initialized at {}", store.root().display());
        }
        Commands::Ingest {
            path,
            role,
            summary,
        } => {
            let service = RagService::open(cfg)?;
            let report = ingest::ingest_path(&service, &path, &role, summary).await?;
            println!("ingest {}", path.display());
            println!("  files scanned: {}", report.files_scanned);
            println!("  documents added: {}", report.documents_added);
            println!("  documents updated: {}", report.documents_updated);
            println!("  documents unchanged: {}", report.documents_unchanged);
            println!("  chunks written: {}", report.chunks_written);
            if let Some(index_id) = &report.index_id {
                println!("  index: {} ({})", index_id, role);
            }
            if report.cache_entries_invalidated > 0 {
                println!("  cache entries invalidated: {}", report.cache_entries_invalidated);
            }
        }
        Commands::Ask { question, json } => {
            let service = RagService::open(cfg)?;
            let response = service.ask(&question).await?;
            if json {
                print_json(&response)?;
            } else {
                println!("{}", response.answer);
                if !response.sources.is_empty() {
                    println!();
                    for (i, source) in response.sources.iter().enumerate() {
                        println!(
                            "[{}] doc {} chunk {} (score {:.3})",
                            i + 1,
                            source.document_id,
                            source.chunk_id,
                            source.score
                        );
                    }
                }
                if let Some(metrics) = &response.metrics {
                    println!(
                        "\nrelevance {:.3}  groundedness {:.3}  answerability {:.3}{}",
                        metrics.relevance,
                        metrics.groundedness,
                        metrics.answerability,
                        if response.cached { "  (cached)" } else { "" }
                    );
                }
                if let Some(id) = &response.feedback_id {
                    println!("feedback id: {}", id);
                }
            }
        }
        Commands::Feedback {
            feedback_id,
            rating,
            comment,
        } => {
            let service = RagService::open(cfg)?;
            match service.submit_feedback(&feedback_id, rating, &comment)? {
                FeedbackOutcome::Applied => println!("Feedback applied."),
                FeedbackOutcome::AlreadyApplied => {
                    println!("Feedback for {} was already applied; nothing changed.", feedback_id)
                }
            }
        }
        Commands::Indexes => {
            let service = RagService::open(cfg)?;
            let indexes = service.registry().list()?;
            if indexes.is_empty() {
                println!("No indexes. Run `ragloop ingest <path>` first.");
            }
            for meta in indexes {
                println!(
                    "{}  role={}  chunks={}  model={}  created={}",
                    meta.index_id,
                    meta.index_role,
                    meta.chunk_ids.len(),
                    meta.embedding_model,
                    meta.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Commands::State { kind } => {
            let kind: EntityKind = kind.parse()?;
            let service = RagService::open(cfg)?;
            let tables = service.state().snapshot()?;
            match kind {
                EntityKind::Document => print_json(&tables.document_state)?,
                EntityKind::Chunk => print_json(&tables.chunk_state)?,
                EntityKind::Index => print_json(&tables.index_state)?,
            }
        }
        Commands::Cache { action } => {
            let service = RagService::open(cfg)?;
            let Some(manager) = service.cache_manager() else {
                anyhow::bail!("Cache is disabled (cache.enabled = false)");
            };
            match action {
                CacheAction::Cleanup => {
                    let report = manager.cleanup()?;
                    println!(
                        "Removed {} invalid and {} expired entries; {} remaining.",
                        report.removed_invalid, report.removed_expired, report.remaining
                    );
                }
                CacheAction::Clear => {
                    let removed = manager.invalidate_all()?;
                    println!("Removed {} entries.", removed);
                }
                CacheAction::Forget { query } => {
                    let n = manager.invalidate_by_query(&query)?;
                    println!("Invalidated {} entries.", n);
                }
            }
        }
        Commands::Analyze => {
            let service = RagService::open(cfg)?;
            let (report, proposals) = service.analyze()?;
            print_json(&serde_json::json!({
                "report": report,
                "proposals": proposals,
            }))?;
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}
