use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use csftp::auth::{load_users, SessionStore};
use csftp::cli::DaemonOpts;
use csftp::monitor::SystemProbe;
use csftp::net_async;

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init()?;

    let opts = DaemonOpts::parse();

    // Validate root directory exists and is a directory
    if !opts.root.exists() {
        anyhow::bail!("Error: Root directory does not exist: {}", opts.root.display());
    }
    if !opts.root.is_dir() {
        anyhow::bail!("Error: Root path is not a directory: {}", opts.root.display());
    }
    let canonical_root = std::fs::canonicalize(&opts.root)
        .with_context(|| format!("Failed to canonicalize root path: {}", opts.root.display()))?;

    let mut config = opts.server_config(canonical_root)?;

    if let Some(path) = &opts.users {
        let users = load_users(path)?;
        let store = SessionStore::new();
        for (name, token) in store.register_all(&users)? {
            info!(user = %name, %token, "issued session token");
        }
        config.identity = Some(Arc::new(store));
    } else {
        warn!("no --users file: GET/DELETE are unauthenticated");
    }

    if opts.bind.starts_with("0.0.0.0") {
        warn!("binding to 0.0.0.0 exposes the daemon on every interface; the protocol is unencrypted");
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(net_async::server::serve(&opts.bind, config, SystemProbe))
}
