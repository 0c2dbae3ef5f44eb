//! Memvault CLI
//!
//! Command-line interface for versioned memory management. Results are
//! printed as JSON on stdout; logs go to stderr.

use std::io::Read;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use memvault::error::Result;
use memvault::requests::*;
use memvault::types::*;
use memvault::MemoryService;

#[derive(Parser)]
#[command(name = "memvault")]
#[command(about = "Versioned memory store CLI")]
#[command(version)]
struct Cli {
    /// Database path
    #[arg(long, env = "MEMVAULT_DB_PATH", default_value_t = default_db_path())]
    db_path: String,

    /// Storage mode (local or cloud-safe)
    #[arg(long, env = "MEMVAULT_STORAGE_MODE", default_value = "local")]
    storage_mode: StorageMode,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Append a version to a memory (creates it if new)
    Add {
        /// Memory ID
        id: String,
        /// Content of the new version
        content: String,
        /// Writer of the version
        #[arg(short, long, env = "MEMVAULT_CLIENT_ID", default_value = "cli")]
        author: String,
        /// Change note
        #[arg(short, long, default_value = "")]
        note: String,
        /// Context (defaults to the author's current context)
        #[arg(short, long)]
        context: Option<String>,
        /// Tags (comma-separated), replacing the current set
        #[arg(short = 'T', long)]
        tags: Option<String>,
    },
    /// Show the full version history of a memory
    History {
        id: String,
    },
    /// Show one version of a memory
    Version {
        id: String,
        number: u32,
    },
    /// Append a copy of an earlier version
    Restore {
        id: String,
        number: u32,
        #[arg(short, long, env = "MEMVAULT_CLIENT_ID", default_value = "cli")]
        author: String,
        #[arg(short, long)]
        reason: Option<String>,
    },
    /// Delete a memory and its history
    Delete {
        id: String,
    },
    /// Filter memories by context, tags, dates and author
    Filter {
        #[arg(short, long)]
        context: Option<String>,
        /// Tags (comma-separated)
        #[arg(short = 'T', long)]
        tags: Option<String>,
        /// Tag mode: all or any
        #[arg(short, long)]
        mode: Option<String>,
        /// Inclusive lower bound on creation time (RFC 3339)
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        /// Inclusive upper bound on last update (RFC 3339)
        #[arg(long)]
        until: Option<DateTime<Utc>>,
        /// Original author
        #[arg(long)]
        author: Option<String>,
        /// Maximum results (0 = unlimited); a cutoff, not a ranking
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Statistics for one context
    Stats {
        #[arg(default_value = DEFAULT_CONTEXT_ID)]
        context: String,
    },
    /// Export memories as JSON
    Export {
        /// Memory IDs to export (all when omitted)
        ids: Vec<String>,
        /// Keep full version histories
        #[arg(long)]
        versions: bool,
        /// Output file (- for stdout)
        #[arg(short, long, default_value = "-")]
        output: String,
    },
    /// Import an export file (- for stdin)
    Import {
        input: String,
    },
    /// List contexts
    Contexts,
    /// List tags
    Tags,
    /// Create a context
    CreateContext {
        id: String,
        #[arg(short, long, default_value = "")]
        name: String,
        #[arg(short, long, default_value = "")]
        description: String,
    },
    /// Create a tag
    CreateTag {
        name: String,
        #[arg(short, long, default_value = "")]
        description: String,
        #[arg(short, long, default_value = "")]
        color: String,
    },
}

fn split_tags(tags: Option<String>) -> Vec<String> {
    tags.map(|t| t.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_default()
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .init();
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let config = VaultConfig {
        storage: StorageConfig {
            db_path: cli.db_path,
            storage_mode: cli.storage_mode,
        },
        registry: RegistryConfig::default(),
    };
    let service = MemoryService::open(config)?;

    match cli.command {
        Commands::Add {
            id,
            content,
            author,
            note,
            context,
            tags,
        } => {
            let write = service.add_version(&AddVersionRequest {
                memory_id: id.clone(),
                content,
                author,
                change_note: note,
                context_id: context,
                tags: split_tags(tags),
            })?;
            print_json(&serde_json::json!({
                "id": id,
                "version_number": write.version_number,
                "created": write.created(),
            }))?;
        }

        Commands::History { id } => {
            print_json(&service.store().get_history(&id)?)?;
        }

        Commands::Version { id, number } => {
            print_json(&service.store().get_version(&id, number)?)?;
        }

        Commands::Restore {
            id,
            number,
            author,
            reason,
        } => {
            let write = service.restore_version(&RestoreVersionRequest {
                memory_id: id.clone(),
                version_number: number,
                author,
                restore_reason: reason,
            })?;
            print_json(&serde_json::json!({
                "id": id,
                "restored_from": number,
                "version_number": write.version_number,
            }))?;
        }

        Commands::Delete { id } => {
            let removed = service.delete_memory(&id)?;
            print_json(&serde_json::json!({
                "id": removed.id,
                "deleted_versions": removed.versions.len(),
            }))?;
        }

        Commands::Filter {
            context,
            tags,
            mode,
            since,
            until,
            author,
            limit,
        } => {
            let results = service.search(&SearchAdvancedRequest {
                context_id: context,
                tags: split_tags(tags),
                tag_filter_mode: mode,
                start_date: since,
                end_date: until,
                created_by: author,
                max_results: limit,
            })?;
            print_json(&results)?;
        }

        Commands::Stats { context } => {
            print_json(&service.context_stats(&ContextStatsRequest {
                context_id: context,
            })?)?;
        }

        Commands::Export {
            ids,
            versions,
            output,
        } => {
            let data = service.export(&ExportRequest {
                memory_ids: ids,
                include_versions: versions,
                exported_by: Some("cli".to_string()),
            })?;
            let content = serde_json::to_string_pretty(&data)?;
            if output == "-" {
                println!("{}", content);
            } else {
                std::fs::write(&output, content)?;
                print_json(&serde_json::json!({
                    "output": output,
                    "memories": data.memories.len(),
                }))?;
            }
        }

        Commands::Import { input } => {
            let json_data = if input == "-" {
                let mut buffer = String::new();
                std::io::stdin().read_to_string(&mut buffer)?;
                buffer
            } else {
                std::fs::read_to_string(&input)?
            };
            print_json(&service.import(&ImportRequest { json_data })?)?;
        }

        Commands::Contexts => {
            print_json(&service.registry().list_contexts())?;
        }

        Commands::Tags => {
            print_json(&service.registry().list_tags())?;
        }

        Commands::CreateContext {
            id,
            name,
            description,
        } => {
            print_json(&service.registry().create_context(&id, &name, &description)?)?;
        }

        Commands::CreateTag {
            name,
            description,
            color,
        } => {
            print_json(&service.registry().create_tag(&name, &description, &color)?)?;
        }
    }

    service.storage().checkpoint()?;
    Ok(())
}
