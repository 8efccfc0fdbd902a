use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{debug, info};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tabled::{Table, Tabled};

use opendoors::config::{self, Config};
use opendoors::{LockActionType, LockMap, ReqwestTransport, SessionManager};

#[derive(Parser)]
#[command(name = "opendoors")]
#[command(about = "A CLI for watching and controlling Opendoors smart locks")]
#[command(version)]
struct Cli {
    /// Path to the configuration file (defaults to ~/.opendoors.yml)
    #[arg(long, env = "OPENDOORS_CONFIG")]
    config: Option<PathBuf>,

    /// Username for the Opendoors account, overrides the config file
    #[arg(long, env = "OPENDOORS_USERNAME")]
    username: Option<String>,

    /// Password for the Opendoors account, overrides the config file
    #[arg(long, env = "OPENDOORS_PASSWORD")]
    password: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List all locks and their current state
    Locks,
    /// Lock a door
    Lock {
        /// Unique id of the lock
        uid: String,
    },
    /// Unlock a door
    Unlock {
        /// Unique id of the lock
        uid: String,
    },
    /// Print lock states every time they change
    Watch {
        /// Stop after this many seconds (runs until Ctrl-C if omitted)
        #[arg(long)]
        seconds: Option<u64>,
    },
}

#[derive(Tabled)]
struct LockRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "UID")]
    uid: String,
    #[tabled(rename = "State")]
    state: String,
}

fn render_locks(locks: &LockMap) -> String {
    let mut rows: Vec<LockRow> = locks
        .values()
        .map(|lock| LockRow {
            name: if lock.name.is_empty() {
                "Unnamed".to_string()
            } else {
                lock.name.clone()
            },
            uid: lock.uid.clone(),
            state: lock.state_string(),
        })
        .collect();
    rows.sort_by(|a, b| a.uid.cmp(&b.uid));
    Table::new(&rows).to_string()
}

fn resolve_config(cli: &Cli) -> Result<Config> {
    let path = match &cli.config {
        Some(path) => path.clone(),
        None => config::get_config_path()?,
    };
    let mut config = config::load_config_from(&path)?;

    if let Some(username) = &cli.username {
        config.username = username.clone();
    }
    if let Some(password) = &cli.password {
        config.password = password.clone();
    }
    if config.password.is_empty() {
        config.password = rpassword::prompt_password(format!("Password for {}: ", config.username))
            .context("Failed to read password")?;
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config = resolve_config(&cli)?;

    let transport = Arc::new(ReqwestTransport::new(config.request_timeout())?);
    let session = SessionManager::from_config(transport, &config);

    match cli.command {
        Commands::Locks => {
            info!("Fetching lock states...");
            let count = session.refresh_locks().await?;
            if count == 0 {
                println!("No locks found for this account.");
                return Ok(());
            }
            println!("{}", render_locks(&session.locks()));
        }
        Commands::Lock { uid } => {
            send_action(&session, &uid, LockActionType::Lock).await?;
            println!("Lock {} requested.", uid);
        }
        Commands::Unlock { uid } => {
            send_action(&session, &uid, LockActionType::Unlock).await?;
            println!("Unlock {} requested.", uid);
        }
        Commands::Watch { seconds } => watch(&session, seconds).await?,
    }

    Ok(())
}

async fn send_action(session: &SessionManager, uid: &str, action: LockActionType) -> Result<()> {
    // The session only accepts actions for locks it has seen
    session.refresh_locks().await?;
    info!("Sending {} to {}", action, uid);
    session.lock_action(uid, action).await?;
    Ok(())
}

async fn watch(session: &SessionManager, seconds: Option<u64>) -> Result<()> {
    if !session.options().poll {
        return Err(anyhow::anyhow!(
            "Polling is disabled in the configuration, nothing to watch."
        ));
    }

    session.register_locks_callback(|locks| {
        println!("{}", render_locks(locks));
    });
    session.connect().await?;

    let stopped = wait_for_stop(seconds, tokio::signal::ctrl_c()).await;
    session.close().await;
    stopped
}

/// Wait `seconds`, or forever when unset, returning early once `interrupt` fires
async fn wait_for_stop<F>(seconds: Option<u64>, interrupt: F) -> Result<()>
where
    F: Future<Output = std::io::Result<()>>,
{
    let deadline = async {
        match seconds {
            Some(seconds) => tokio::time::sleep(Duration::from_secs(seconds)).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = deadline => debug!("Watch finished"),
        result = interrupt => {
            result.context("Failed to listen for Ctrl-C")?;
            debug!("Interrupted");
        }
    }
    Ok(())
}
