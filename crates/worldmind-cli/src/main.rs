mod config;
mod run_cmd;
mod status_cmd;

use anyhow::Context;
use clap::{Parser, Subcommand};

use worldmind_db::pool;

use config::ResolvedConfig;

#[derive(Parser)]
#[command(name = "worldmind", about = "Mission orchestrator for autonomous coding agents")]
struct Cli {
    /// Database URL (overrides WORLDMIND_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a worldmind config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/worldmind")]
        db_url: String,
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Create the worldmind database and run migrations
    DbInit,
    /// Submit and execute a mission
    Run {
        /// The natural-language change request
        request: String,
        /// Clone URL of the repository to operate on
        #[arg(long)]
        repo_url: String,
        /// Interaction mode: full_auto, approve_plan, step_by_step
        #[arg(long, default_value = "full_auto")]
        mode: String,
        /// Execution strategy: sequential or parallel
        #[arg(long, default_value = "parallel")]
        strategy: String,
        /// Path to recorded language-model responses (JSON array); the
        /// mission replays them in order
        #[arg(long)]
        responses: std::path::PathBuf,
        /// Use the in-memory checkpoint store instead of PostgreSQL
        #[arg(long)]
        ephemeral: bool,
    },
    /// Resume a paused mission from its latest checkpoint
    Resume {
        /// Mission id to resume
        mission_id: String,
        /// Path to recorded language-model responses (JSON array)
        #[arg(long)]
        responses: std::path::PathBuf,
    },
    /// Show mission status (omit mission_id to list all missions)
    Status {
        mission_id: Option<String>,
    },
    /// List the checkpoint chain of a mission
    Checkpoints {
        mission_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            let path = config::config_path();
            if path.exists() && !force {
                anyhow::bail!(
                    "config file already exists at {} (use --force to overwrite)",
                    path.display()
                );
            }
            let file = config::ConfigFile {
                database: config::DatabaseSection { url: db_url },
                auth: config::AuthSection {
                    token_secret: config::generate_token_secret(),
                },
                pipeline: config::PipelineSection::default(),
            };
            config::save_config(&file)?;
            println!("wrote {}", path.display());
            Ok(())
        }
        Commands::DbInit => {
            let resolved = ResolvedConfig::resolve(cli.database_url.as_deref())?;
            pool::ensure_database_exists(&resolved.db_config).await?;
            let db = pool::create_pool(&resolved.db_config).await?;
            pool::run_migrations(&db).await?;
            println!("database initialized");
            Ok(())
        }
        Commands::Run {
            request,
            repo_url,
            mode,
            strategy,
            responses,
            ephemeral,
        } => {
            let resolved = ResolvedConfig::resolve(cli.database_url.as_deref())?;
            run_cmd::run_mission(
                &resolved,
                run_cmd::RunArgs {
                    request,
                    repo_url,
                    mode,
                    strategy,
                    responses,
                    ephemeral,
                },
            )
            .await
        }
        Commands::Resume {
            mission_id,
            responses,
        } => {
            let resolved = ResolvedConfig::resolve(cli.database_url.as_deref())?;
            run_cmd::resume_mission(&resolved, &mission_id, &responses).await
        }
        Commands::Status { mission_id } => {
            let resolved = ResolvedConfig::resolve(cli.database_url.as_deref())?;
            let db = pool::create_pool(&resolved.db_config)
                .await
                .context("failed to connect to database")?;
            status_cmd::show_status(&db, mission_id.as_deref()).await
        }
        Commands::Checkpoints { mission_id } => {
            let resolved = ResolvedConfig::resolve(cli.database_url.as_deref())?;
            let db = pool::create_pool(&resolved.db_config)
                .await
                .context("failed to connect to database")?;
            status_cmd::show_checkpoints(&db, &mission_id).await
        }
    }
}
