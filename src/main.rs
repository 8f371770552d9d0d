use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use foreman::gitops::GitService;
use foreman::http::{ServerConfig, start_server};
use foreman::process::{DEFAULT_POOL_SIZE, ProcessRunner};
use foreman::sandbox::SandboxManager;

#[derive(Parser)]
#[command(name = "foreman")]
#[command(version, about = "Local-first agent orchestration service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestration service (the default).
    Serve {
        /// Listen port; falls back to $PORT, then 3002.
        #[arg(long)]
        port: Option<u16>,
        /// Project repository root; falls back to $PROJECT_PATH, then cwd.
        #[arg(long)]
        project_path: Option<PathBuf>,
        /// SQLite path for threads and transcripts.
        #[arg(long, default_value = ".foreman/threads.db")]
        db_path: PathBuf,
        /// Bind on all interfaces and allow any CORS origin.
        #[arg(long)]
        dev: bool,
    },
    /// Remove orphaned pipeline sandbox containers and exit.
    Orphans,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve {
        port: None,
        project_path: None,
        db_path: PathBuf::from(".foreman/threads.db"),
        dev: false,
    }) {
        Commands::Serve {
            port,
            project_path,
            db_path,
            dev,
        } => {
            let port = port
                .or_else(|| std::env::var("PORT").ok().and_then(|p| p.parse().ok()))
                .unwrap_or(3002);
            let project_path = project_path
                .or_else(|| std::env::var("PROJECT_PATH").ok().map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from("."));
            start_server(ServerConfig {
                port,
                project_path,
                db_path,
                dev_mode: dev,
            })
            .await
        }
        Commands::Orphans => {
            let runner = Arc::new(ProcessRunner::new(DEFAULT_POOL_SIZE));
            let git = Arc::new(GitService::new(Arc::clone(&runner)));
            let sandbox = SandboxManager::new(
                runner,
                git,
                "foreman-sandbox:latest",
                PathBuf::from("/opt/claude-sdk"),
            );
            let removed = sandbox.kill_orphans().await?;
            println!("removed {} orphaned sandbox container(s)", removed);
            Ok(())
        }
    }
}
