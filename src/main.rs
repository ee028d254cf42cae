use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use claudehub::container::{BollardEngine, EngineClient, Supervisor, SupervisorConfig};
use claudehub::server::{self, AppState, TokenIssuer, auth};
use claudehub::session::SessionManager;
use claudehub::store::Store;
use claudehub::workspace::{ExtensionBundle, ExtensionSynchroniser, WorkspaceLayout};
use claudehub::Config;

#[derive(Parser, Debug)]
#[command(name = "claudehub")]
#[command(about = "Multi-tenant Claude Code execution platform")]
struct Args {
    /// Configuration file (defaults to ./claudehub.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the platform server
    Serve,
    /// Administrative helpers
    Admin {
        #[command(subcommand)]
        command: AdminCommand,
    },
}

#[derive(Subcommand, Debug)]
enum AdminCommand {
    /// Create a user account
    CreateUser {
        username: String,
        password: String,
        #[arg(long, default_value = "free")]
        tier: String,
        #[arg(long)]
        admin: bool,
    },
    /// Push the managed extension bundle to every user
    SyncExtensions {
        #[arg(long)]
        overwrite_user_files: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "claudehub=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;

    match args.command {
        Command::Serve => serve(config).await,
        Command::Admin { command } => admin(config, command).await,
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    info!("Starting claudehub");

    let store = Store::open(&config.database_path())?;
    let layout = WorkspaceLayout::new(config.workspace_dir.clone());
    let synchroniser = ExtensionSynchroniser::new(
        ExtensionBundle::new(config.extensions_dir.clone()),
        layout.clone(),
    );

    let client = EngineClient::connect(config.engine_socket_path.as_deref()).await?;
    let engine = Arc::new(BollardEngine::new(client));

    let supervisor = Arc::new(Supervisor::new(
        engine,
        layout.clone(),
        synchroniser,
        store.clone(),
        SupervisorConfig::from_config(&config),
    ));
    let sessions = Arc::new(SessionManager::new(layout, store.clone()));

    // Adopt surviving sandboxes and drop orphans before taking traffic.
    supervisor.reconcile().await?;

    let probe_sessions = sessions.clone();
    supervisor.clone().spawn_sweeper(Arc::new(move |user_id| {
        probe_sessions.user_has_active_session(user_id)
    }));

    let state = AppState {
        tokens: Arc::new(TokenIssuer::new(&config.token_signing_key)),
        config: Arc::new(config),
        store,
        supervisor,
        sessions,
        probe: reqwest::Client::new(),
    };

    server::serve(state).await
}

async fn admin(config: Config, command: AdminCommand) -> anyhow::Result<()> {
    let store = Store::open(&config.database_path())?;
    let layout = WorkspaceLayout::new(config.workspace_dir.clone());
    let synchroniser = ExtensionSynchroniser::new(
        ExtensionBundle::new(config.extensions_dir.clone()),
        layout.clone(),
    );

    match command {
        AdminCommand::CreateUser {
            username,
            password,
            tier,
            admin,
        } => {
            claudehub::container::Tier::parse(&tier)?;
            let hash = auth::hash_password(&password)
                .map_err(|e| anyhow::anyhow!("password hashing failed: {}", e))?;
            let user = store.create_user(&username, &hash, &tier)?;
            if admin {
                store.set_admin(user.id, true)?;
            }
            layout.ensure_layout(user.id)?;
            synchroniser.sync_one(user.id, false)?;
            store.mark_extensions_synced(user.id, chrono::Utc::now())?;
            println!("Created user {} (id {}, tier {})", username, user.id, tier);
        }
        AdminCommand::SyncExtensions {
            overwrite_user_files,
        } => {
            let user_ids = store.list_user_ids()?;
            let report = synchroniser.sync_all(&user_ids, overwrite_user_files);
            println!(
                "Synced {}/{} users ({} failed)",
                report.synced, report.total, report.failed
            );
            for error in &report.errors {
                eprintln!("  {}", error);
            }
        }
    }
    Ok(())
}
