//! PUT / DELETE / simple GET
//!
//! Each handler writes exactly one logical response and leaves the stream at
//! the start of the next request frame. `Err` means the connection itself is
//! unusable; every recoverable failure is reported to the peer as a status.

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::engine::EngineError;
use crate::protocol::status;
use crate::protocol_core::{encode_size_header, read_size_header, write_response, DecodeError, Response};
use crate::store::{FileStore, StoreError};

/// PUT copy buffer
const COPY_CHUNK: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("framing error: {0}")]
    Decode(#[from] DecodeError),
    #[error("no ACK within {0:?}")]
    AckTimeout(Duration),
    #[error("file changed during send: declared {declared} bytes, sent {sent}")]
    ShortPayload { declared: u64, sent: u64 },
    #[error(transparent)]
    Engine(#[from] EngineError),
}

pub(crate) fn bad_request(message: &str) -> Response {
    Response::new(status::BAD_REQUEST, message)
}

/// Map a store failure on GET/DELETE to the response the client sees
pub(crate) fn lookup_failure(e: &StoreError, io_message: &str) -> Response {
    match e {
        StoreError::NotFound(_) => Response::new(status::NOT_FOUND, "file not found"),
        StoreError::InvalidName { .. } => bad_request("invalid filename"),
        StoreError::Io { .. } => Response::new(status::STAT_FAILED, io_message),
    }
}

/// Receive `u64 size | size bytes` into `name`.
///
/// The declared payload is always drained, even when the file cannot be
/// created or a disk write fails, so the next request frame parses cleanly.
pub async fn handle_put<S>(stream: &mut S, store: &FileStore, name: &str) -> Result<(), TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut file, mut failure) = if name.is_empty() {
        (None, Some(bad_request("empty filename")))
    } else {
        match store.create(name).await {
            Ok(f) => (Some(f), None),
            Err(e) => {
                warn!(file = name, "PUT create failed: {}", e);
                let resp = match e {
                    StoreError::InvalidName { .. } => bad_request("invalid filename"),
                    _ => Response::new(status::CREATE_FAILED, "Unable to create file"),
                };
                (None, Some(resp))
            }
        }
    };

    let size = match read_size_header(stream).await {
        Ok(n) => n,
        Err(e) => {
            warn!(file = name, "PUT size header unreadable: {}", e);
            // The peer is gone or mid-frame; the next decode will end the session
            let _ = write_response(
                stream,
                &Response::new(status::SIZE_HEADER_UNREADABLE, "Unable to read size header"),
            )
            .await;
            return Ok(());
        }
    };

    let mut buf = vec![0u8; COPY_CHUNK.min(size as usize).max(1)];
    let mut remaining = size;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = stream.read(&mut buf[..want]).await?;
        if n == 0 {
            warn!(file = name, declared = size, missing = remaining, "PUT stream ended early");
            let _ = write_response(stream, &Response::new(status::PUT_IO, "PUT error")).await;
            return Ok(());
        }
        let write_err = match file.as_mut() {
            Some(f) => f.write_all(&buf[..n]).await.err(),
            None => None,
        };
        if let Some(e) = write_err {
            warn!(file = name, "PUT disk write failed, draining payload: {}", e);
            failure = Some(Response::new(status::PUT_IO, "PUT error"));
            file = None;
        }
        remaining -= n as u64;
    }

    if let Some(mut f) = file {
        if let Err(e) = f.flush().await {
            warn!(file = name, "PUT flush failed: {}", e);
            failure = Some(Response::new(status::PUT_IO, "PUT error"));
        }
    }

    match failure {
        Some(resp) => write_response(stream, &resp).await?,
        None => {
            write_response(stream, &Response::ok()).await?;
            info!("Received file '{}' ({} bytes)", name, size);
        }
    }
    Ok(())
}

/// Send `u64 size | raw bytes` with no compression and no ACKs
pub async fn handle_get_simple<S>(stream: &mut S, store: &FileStore, name: &str) -> Result<(), TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if name.is_empty() {
        write_response(stream, &bad_request("empty filename")).await?;
        return Ok(());
    }
    let opened = match store.stat(name).await {
        Ok(size) => store.open(name).await.map(|f| (f, size)),
        Err(e) => Err(e),
    };
    let (file, size) = match opened {
        Ok(found) => found,
        Err(e) => {
            debug!(file = name, "GET lookup failed: {}", e);
            write_response(stream, &lookup_failure(&e, "Unable to stat file")).await?;
            return Ok(());
        }
    };

    stream.write_all(&encode_size_header(size)).await?;
    let sent = tokio::io::copy(&mut file.take(size), stream).await?;
    stream.flush().await?;
    if sent != size {
        // The header promised more than the file now holds; the stream cannot be resynchronized
        return Err(TransferError::ShortPayload { declared: size, sent });
    }
    info!("Sent file '{}' ({} bytes)", name, size);
    Ok(())
}

pub async fn handle_delete<S>(stream: &mut S, store: &FileStore, name: &str) -> Result<(), TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if name.is_empty() {
        write_response(stream, &bad_request("empty filename")).await?;
        return Ok(());
    }
    match store.remove(name).await {
        Ok(()) => {
            write_response(stream, &Response::ok()).await?;
            info!("Deleted file '{}'", name);
        }
        Err(e) => {
            if e.is_not_found() {
                debug!(file = name, "DELETE of missing file");
            } else {
                warn!(file = name, "DELETE failed: {}", e);
            }
            write_response(stream, &lookup_failure(&e, "Unable to remove file")).await?;
        }
    }
    Ok(())
}
