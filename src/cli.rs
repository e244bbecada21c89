//! Shared CLI option structs for csftpd and csftp

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::metrics::{JsonlSink, MetricsSink, NoopSink};
use crate::monitor::SettlePolicy;
use crate::protocol::DEFAULT_PORT;
use crate::net_async::server::{GetMode, ServerConfig};

/// csftpd: serve PUT/GET/DELETE against a directory
#[derive(Clone, Debug, Parser)]
#[command(author, version, about)]
pub struct DaemonOpts {
    /// Bind address (host:port)
    #[arg(long, default_value_t = format!("0.0.0.0:{}", DEFAULT_PORT))]
    pub bind: String,

    /// Root directory to serve
    #[arg(long, default_value = ".")]
    pub root: PathBuf,

    /// How GET is served
    #[arg(long, value_enum, default_value_t = GetMode::Adaptive)]
    pub mode: GetMode,

    /// Close a connection after this many idle seconds between requests
    #[arg(long, default_value_t = crate::protocol::timeouts::IDLE_SECS)]
    pub idle_timeout_secs: u64,

    /// Give up on a silent client after this many seconds in one ACK wait (0 = wait forever)
    #[arg(long, default_value_t = crate::protocol::timeouts::ACK_SECS)]
    pub ack_timeout_secs: u64,

    /// Abandon a GET if the system does not settle within this many seconds (0 = wait forever)
    #[arg(long, default_value_t = crate::protocol::timeouts::SETTLE_SECS)]
    pub settle_timeout_secs: u64,

    /// Append one JSON line of tier metrics per adaptive GET to this file
    #[arg(long)]
    pub metrics_log: Option<PathBuf>,

    /// TOML users file; enables session tokens for GET/DELETE
    #[arg(long)]
    pub users: Option<PathBuf>,
}

fn nonzero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl DaemonOpts {
    /// Server configuration without the identity layer (the daemon wires that in)
    pub fn server_config(&self, root: PathBuf) -> anyhow::Result<ServerConfig> {
        let sink: Arc<dyn MetricsSink> = match &self.metrics_log {
            Some(path) => Arc::new(JsonlSink::new(path)?),
            None => Arc::new(NoopSink),
        };
        let mut config = ServerConfig::new(root);
        config.mode = self.mode;
        config.idle_timeout = Duration::from_secs(self.idle_timeout_secs.max(1));
        config.ack_timeout = nonzero_secs(self.ack_timeout_secs);
        config.settle = SettlePolicy {
            deadline: nonzero_secs(self.settle_timeout_secs),
            ..SettlePolicy::default()
        };
        config.sink = sink;
        Ok(config)
    }
}

/// csftp: interactive client. Reads `METHOD NAME` lines from stdin.
#[derive(Clone, Debug, Parser)]
#[command(author, version, about)]
pub struct ClientOpts {
    /// Server address (host:port)
    #[arg(long, default_value_t = format!("127.0.0.1:{}", DEFAULT_PORT))]
    pub server: String,

    /// Must match the server's GET mode
    #[arg(long, value_enum, default_value_t = GetMode::Adaptive)]
    pub mode: GetMode,

    /// Session token for GET/DELETE on servers started with --users
    #[arg(long)]
    pub token: Option<String>,

    /// Where GET writes downloaded files
    #[arg(long, default_value = ".")]
    pub out_dir: PathBuf,
}
