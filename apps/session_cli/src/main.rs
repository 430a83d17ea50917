use anyhow::{Context, Result};
use clap::Parser;
use session_core::{load_settings, ConnectionStatus, Credentials, SessionClient};
use shared::domain::Role;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Overrides `server_url` from client.toml / APP__SERVER_URL.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    password: Option<String>,
    #[arg(long)]
    role: Option<Role>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let args = Args::parse();

    let mut settings = load_settings()?;
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    if let Some(role) = args.role {
        settings.role = role;
    }

    let client = SessionClient::new(settings)?;
    let mut status = client.watch_status();
    let status_task = tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            match current {
                ConnectionStatus::Error => warn!(?current, "realtime status"),
                _ => info!(?current, "realtime status"),
            }
        }
    });
    let mut frames = client.subscribe_frames();
    let frames_task = tokio::spawn(async move {
        while let Ok(frame) = frames.recv().await {
            info!(?frame, "realtime frame");
        }
    });

    let restored = client.start().await;
    let identity = match (restored, args.email) {
        (_, Some(email)) => {
            let password = args
                .password
                .context("--password is required with --email")?;
            client
                .login(&Credentials::new(email, password))
                .await
                .context("login failed")?
        }
        (Some(identity), None) => identity,
        (None, None) => anyhow::bail!("no stored session; pass --email and --password"),
    };
    info!(user_id = %identity.id, name = %identity.display_name, "signed in");

    match client.current_user().await {
        Ok(me) => info!(user_id = %me.id, "GET /me succeeded"),
        Err(err) => warn!("GET /me failed: {err}"),
    }

    info!("holding realtime session; press Ctrl-C to sign out");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    client.logout().await;
    client.shutdown().await;
    status_task.abort();
    frames_task.abort();
    Ok(())
}
