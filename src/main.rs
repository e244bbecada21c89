//! csftp - interactive client
//!
//! Reads `METHOD NAME` lines from stdin (GET, PUT, DELETE) and runs each
//! against one persistent connection, printing the server's responses and
//! per-tier transfer metrics.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use csftp::cli::ClientOpts;
use csftp::net_async::client::{parse_command, Client, SimpleGet};
use csftp::net_async::server::GetMode;
use csftp::protocol::status;
use csftp::protocol_core::{Opcode, Response};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init()?;

    let opts = ClientOpts::parse();
    let mut client = Client::connect(&opts.server)
        .await?
        .with_token(opts.token.clone());
    info!("Connected to server: {}", opts.server);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let Some((op, name)) = parse_command(&line) else {
            println!("error: expected `GET|PUT|DELETE <name>`");
            continue;
        };
        match op {
            Opcode::Put => put(&mut client, &name).await?,
            Opcode::Delete => {
                let resp = client.delete(&name).await?;
                print_response(&resp);
            }
            Opcode::Get => match opts.mode {
                GetMode::Simple => get_simple(&mut client, &name, &opts.out_dir).await?,
                GetMode::Adaptive => get_adaptive(&mut client, &name, &opts.out_dir).await?,
            },
        }
    }
    Ok(())
}

/// Prints the frame as received; failures also get a named status on stderr
fn print_response(resp: &Response) {
    println!("Server response: {}", resp);
    if !resp.is_ok() {
        warn!(status = resp.status, "{}", status::describe(resp.status));
    }
}

async fn put(client: &mut Client, name: &str) -> Result<()> {
    let local = Path::new(name);
    if !local.is_file() {
        // Nothing is sent, so the connection stays in sync
        println!("error: no local file {}", local.display());
        return Ok(());
    }
    let (resp, sent) = client.put_file(name, local).await?;
    println!("File size: {}", sent);
    print_response(&resp);
    Ok(())
}

fn local_target(out_dir: &Path, name: &str) -> PathBuf {
    let file_name = Path::new(name)
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("download"));
    out_dir.join(file_name)
}

async fn save(out_dir: &Path, name: &str, data: &[u8]) -> Result<()> {
    let target = local_target(out_dir, name);
    tokio::fs::write(&target, data)
        .await
        .with_context(|| format!("Failed to write {}", target.display()))?;
    info!("Saved {} ({} bytes)", target.display(), data.len());
    Ok(())
}

async fn get_simple(client: &mut Client, name: &str, out_dir: &Path) -> Result<()> {
    match client.get_simple(name).await? {
        SimpleGet::Data(data) => {
            println!("File size: {}", data.len());
            save(out_dir, name, &data).await
        }
        SimpleGet::Refused(resp) => {
            print_response(&resp);
            Ok(())
        }
    }
}

async fn get_adaptive(client: &mut Client, name: &str, out_dir: &Path) -> Result<()> {
    let outcome = client.get_adaptive(name).await?;
    if !outcome.tiers.is_empty() {
        println!("=== Transfer Time Measurements ===");
    }
    for t in &outcome.tiers {
        println!("Level_{}_Compressed_Size: {} bytes", t.tier.index(), t.payload.len());
        println!("Level_{}_Transfer_Time: {:?}", t.tier.index(), t.transfer_time);
    }
    print_response(&outcome.response);
    if outcome.response.is_ok() {
        match outcome.contents()? {
            Some(data) => save(out_dir, name, &data).await?,
            None => warn!("server reported OK without sending any tier"),
        }
    }
    Ok(())
}
