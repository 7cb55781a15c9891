use anyhow::Context;
use clap::{Parser, Subcommand};
use immitracker_lib::dedup::run_normalization;
use immitracker_lib::errors::{TemplateError, TemplateResult};
use immitracker_lib::lifecycle::{
    create_or_reuse, flag, list_templates, list_templates_by_category, suggest_similar, unflag,
};
use immitracker_lib::models::core::{ProgramScope, TemplateId, UserId};
use immitracker_lib::storage::memory::MemoryStore;
use immitracker_lib::storage::postgres::PgStore;
use immitracker_lib::storage::MilestoneTemplateRepository;
use immitracker_lib::utils::config::{
    DatabaseConfig, LifecycleConfig, ProgressConfig, StorageBackend, StorageConfig,
};
use immitracker_lib::utils::constants::{DEFAULT_SUGGESTION_LIMIT, DEFAULT_SUGGESTION_SIMILARITY};
use immitracker_lib::utils::db_connect::{connect, get_pool_status};
use immitracker_lib::utils::env::load_env;
use log::{error, info};
use serde::Serialize;
use serde_json::Value;
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(name = "immitracker", version, about = "Milestone template maintenance for ImmiTracker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Refresh derived fields and report duplicate templates
    Normalize {
        /// Merge each duplicate group into its canonical template
        #[arg(long)]
        merge: bool,
    },
    /// Create any missing tables and indexes (PostgreSQL only)
    InitSchema,
    /// Create a template or count one more use of an existing one
    CreateTemplate {
        #[arg(long)]
        name: String,
        #[arg(long)]
        program_type: String,
        #[arg(long)]
        program_sub_type: Option<String>,
        #[arg(long)]
        user: Option<String>,
    },
    FlagTemplate {
        #[arg(long)]
        id: String,
        #[arg(long)]
        user: String,
    },
    UnflagTemplate {
        #[arg(long)]
        id: String,
        #[arg(long)]
        user: String,
    },
    ListTemplates {
        #[arg(long)]
        program_type: String,
        #[arg(long)]
        program_sub_type: Option<String>,
        #[arg(long)]
        include_unapproved: bool,
    },
    /// Approved templates grouped by category
    ListByCategory {
        #[arg(long)]
        program_type: Option<String>,
        #[arg(long)]
        program_sub_type: Option<String>,
    },
    /// Templates with names similar to the given one
    Suggest {
        #[arg(long)]
        name: String,
        #[arg(long)]
        program_type: String,
        #[arg(long)]
        program_sub_type: Option<String>,
        #[arg(long, default_value_t = DEFAULT_SUGGESTION_SIMILARITY)]
        min_similarity: f64,
        #[arg(long, default_value_t = DEFAULT_SUGGESTION_LIMIT)]
        limit: usize,
    },
}

enum Backend {
    Memory(MemoryStore),
    Postgres(PgStore),
}

impl Backend {
    async fn open(config: &StorageConfig) -> anyhow::Result<Self> {
        match config.backend {
            StorageBackend::Memory => Ok(Backend::Memory(MemoryStore::new())),
            StorageBackend::Postgres => {
                let db_config = DatabaseConfig::from_env();
                db_config.log_config();
                let pool = connect(&db_config)
                    .await
                    .context("Failed to connect to database")?;
                let (connections, idle) = get_pool_status(&pool);
                info!("DB pool ready: {} connections ({} idle)", connections, idle);
                let store = PgStore::new(pool);
                if config.ensure_schema {
                    store.ensure_schema().await?;
                }
                Ok(Backend::Postgres(store))
            }
        }
    }

    fn templates(&self) -> &dyn MilestoneTemplateRepository {
        match self {
            Backend::Memory(store) => store,
            Backend::Postgres(store) => store,
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> TemplateResult<Value> {
    serde_json::to_value(value)
        .context("Failed to serialize command output")
        .map_err(TemplateError::from)
}

async fn execute(
    command: Command,
    backend: &Backend,
    lifecycle: &LifecycleConfig,
) -> TemplateResult<Value> {
    let repo = backend.templates();
    match command {
        Command::Normalize { merge } => {
            let progress = ProgressConfig::from_env();
            let multi_progress = progress.create_multi_progress();
            let report = run_normalization(repo, merge, multi_progress.as_ref()).await?;
            to_json(&report)
        }
        Command::InitSchema => match backend {
            Backend::Postgres(store) => {
                store.ensure_schema().await?;
                Ok(serde_json::json!({ "schema": "ok" }))
            }
            Backend::Memory(_) => Err(TemplateError::Validation(
                "init-schema needs the postgres storage backend".to_string(),
            )),
        },
        Command::CreateTemplate {
            name,
            program_type,
            program_sub_type,
            user,
        } => {
            let scope = ProgramScope::new(&program_type, program_sub_type.as_deref());
            let actor = user.as_deref().map(UserId::from);
            let template = create_or_reuse(repo, lifecycle, &name, &scope, actor.as_ref()).await?;
            to_json(&template)
        }
        Command::FlagTemplate { id, user } => {
            let template = flag(
                repo,
                lifecycle,
                &TemplateId::from(id.as_str()),
                &UserId::from(user.as_str()),
            )
            .await?;
            to_json(&template)
        }
        Command::UnflagTemplate { id, user } => {
            let template = unflag(
                repo,
                &TemplateId::from(id.as_str()),
                &UserId::from(user.as_str()),
            )
            .await?;
            to_json(&template)
        }
        Command::ListTemplates {
            program_type,
            program_sub_type,
            include_unapproved,
        } => {
            let scope = ProgramScope::new(&program_type, program_sub_type.as_deref());
            let templates = list_templates(repo, &scope, include_unapproved).await?;
            to_json(&templates)
        }
        Command::ListByCategory {
            program_type,
            program_sub_type,
        } => {
            let grouped = list_templates_by_category(
                repo,
                program_type.as_deref(),
                program_sub_type.as_deref(),
            )
            .await?;
            to_json(&grouped)
        }
        Command::Suggest {
            name,
            program_type,
            program_sub_type,
            min_similarity,
            limit,
        } => {
            let scope = ProgramScope::new(&program_type, program_sub_type.as_deref());
            let suggestions = suggest_similar(repo, &name, &scope, min_similarity, limit).await?;
            to_json(&suggestions)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    load_env();
    let cli = Cli::parse();
    let start_time = Instant::now();

    let storage_config = StorageConfig::from_env();
    storage_config.log_config();
    let lifecycle_config = LifecycleConfig::from_env();
    lifecycle_config.log_config();

    let backend = Backend::open(&storage_config).await?;

    match execute(cli.command, &backend, &lifecycle_config).await {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            info!("Command finished in {:.2?}", start_time.elapsed());
            Ok(())
        }
        Err(e) => {
            error!("Command failed: {}", e);
            eprintln!("{}", serde_json::to_string_pretty(&e.to_body())?);
            std::process::exit(match e {
                TemplateError::Storage(_) => 2,
                _ => 1,
            });
        }
    }
}
