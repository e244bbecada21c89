//! Tokio transport for the CSFTP daemon and client.
//!
//! The server runs one task per accepted connection. Each task owns its
//! `Session` and processes requests strictly in arrival order until the peer
//! closes, a frame fails to decode, or the idle deadline passes.

use anyhow::{Context, Result};
use std::time::{Duration, Instant};

pub mod server {
    use super::*;
    use std::net::SocketAddr;
    use std::path::PathBuf;
    use std::sync::Arc;

    use tokio::io::{AsyncRead, AsyncWrite};
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tracing::{debug, info, warn};

    use crate::auth::{split_token, IdentityService};
    use crate::engine::adaptive_get;
    use crate::handlers::{handle_delete, handle_get_simple, handle_put, TransferError};
    use crate::metrics::{MetricsSink, NoopSink};
    use crate::monitor::{ResourceMonitor, ResourceProbe, SettlePolicy};
    use crate::protocol::{status, timeouts};
    use crate::protocol_core::{decode_request, write_response, DecodeError, Opcode, Request, Response};
    use crate::store::FileStore;

    /// How GET is served
    #[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
    pub enum GetMode {
        /// Three ACK-paced gzip tiers with settle waits
        Adaptive,
        /// Size header plus raw bytes
        Simple,
    }

    #[derive(Clone)]
    pub struct ServerConfig {
        pub root: PathBuf,
        pub mode: GetMode,
        pub idle_timeout: Duration,
        /// `None` waits for ACKs forever
        pub ack_timeout: Option<Duration>,
        pub settle: SettlePolicy,
        /// When set, GET/DELETE targets must carry a valid session token
        pub identity: Option<Arc<dyn IdentityService>>,
        pub sink: Arc<dyn MetricsSink>,
    }

    impl ServerConfig {
        pub fn new(root: impl Into<PathBuf>) -> Self {
            Self {
                root: root.into(),
                mode: GetMode::Adaptive,
                idle_timeout: Duration::from_secs(timeouts::IDLE_SECS),
                ack_timeout: Some(Duration::from_secs(timeouts::ACK_SECS)),
                settle: SettlePolicy::default(),
                identity: None,
                sink: Arc::new(NoopSink),
            }
        }
    }

    /// Read-mostly state shared by every session
    pub struct ServerState<P> {
        store: FileStore,
        monitor: ResourceMonitor<P>,
        config: ServerConfig,
    }

    impl<P: ResourceProbe> ServerState<P> {
        pub fn new(config: ServerConfig, probe: P) -> Self {
            Self {
                store: FileStore::new(config.root.clone()),
                monitor: ResourceMonitor::new(probe, config.settle.clone()),
                config,
            }
        }

        pub fn store(&self) -> &FileStore {
            &self.store
        }
    }

    pub async fn serve<P: ResourceProbe>(bind: &str, config: ServerConfig, probe: P) -> Result<()> {
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("bind {}", bind))?;
        serve_listener(listener, config, probe).await
    }

    pub async fn serve_listener<P: ResourceProbe>(
        listener: TcpListener,
        config: ServerConfig,
        probe: P,
    ) -> Result<()> {
        let addr = listener.local_addr().context("listener address")?;
        let state = Arc::new(ServerState::new(config, probe));
        info!(
            %addr,
            root = %state.store().root().display(),
            mode = ?state.config.mode,
            auth = state.config.identity.is_some(),
            "CSFTP server started"
        );
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    // Transient failures (EMFILE, aborted handshakes) must not stop the daemon
                    warn!("accept failed: {}", e);
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);
            debug!(%peer, "connection accepted");
            let state = state.clone();
            tokio::spawn(async move {
                Session::new(stream, peer, state).run().await;
            });
        }
    }

    /// One accepted connection. Owned exclusively by its task.
    pub struct Session<S, P> {
        stream: S,
        peer: SocketAddr,
        state: Arc<ServerState<P>>,
        requests: u64,
    }

    impl<S, P> Session<S, P>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
        P: ResourceProbe,
    {
        pub fn new(stream: S, peer: SocketAddr, state: Arc<ServerState<P>>) -> Self {
            Self {
                stream,
                peer,
                state,
                requests: 0,
            }
        }

        pub async fn run(mut self) {
            let started = Instant::now();
            loop {
                let idle = self.state.config.idle_timeout;
                let req = match timeout(idle, decode_request(&mut self.stream)).await {
                    Err(_) => {
                        info!(peer = %self.peer, "idle for {:?}, closing", idle);
                        break;
                    }
                    Ok(Err(DecodeError::Eof)) => break,
                    Ok(Err(e)) => {
                        // No resynchronization past a bad frame
                        warn!(peer = %self.peer, "parse error: {}", e);
                        break;
                    }
                    Ok(Ok(req)) => req,
                };
                self.requests += 1;
                debug!(peer = %self.peer, op = %req.opcode, file = %req.target.escape_debug(), "request");
                if let Err(e) = self.dispatch(&req).await {
                    warn!(peer = %self.peer, op = %req.opcode, "closing connection: {}", e);
                    break;
                }
            }
            debug!(
                peer = %self.peer,
                requests = self.requests,
                secs = started.elapsed().as_secs_f64(),
                "connection closed"
            );
        }

        /// Resolve the filename, checking the session token where required
        fn authorize<'r>(&self, req: &'r Request) -> Result<&'r str, Response> {
            let Some(identity) = &self.state.config.identity else {
                return Ok(req.target.as_str());
            };
            if req.opcode == Opcode::Put {
                return Ok(req.target.as_str());
            }
            match split_token(&req.target) {
                Some((token, name)) if identity.is_valid_token(token) => Ok(name),
                _ => Err(Response::new(status::UNAUTHORIZED, "unauthorized")),
            }
        }

        async fn dispatch(&mut self, req: &Request) -> Result<(), TransferError> {
            let name = match self.authorize(req) {
                Ok(name) => name,
                Err(resp) => {
                    warn!(peer = %self.peer, op = %req.opcode, "rejected: missing or unknown token");
                    write_response(&mut self.stream, &resp).await?;
                    return Ok(());
                }
            };
            let state = &self.state;
            match req.opcode {
                Opcode::Put => handle_put(&mut self.stream, &state.store, name).await,
                Opcode::Delete => handle_delete(&mut self.stream, &state.store, name).await,
                Opcode::Get => match state.config.mode {
                    GetMode::Simple => handle_get_simple(&mut self.stream, &state.store, name).await,
                    GetMode::Adaptive => {
                        adaptive_get(
                            &mut self.stream,
                            &state.store,
                            name,
                            &state.monitor,
                            state.config.ack_timeout,
                            state.config.sink.as_ref(),
                        )
                        .await
                    }
                },
            }
        }
    }
}

pub mod client {
    use super::*;
    use std::path::Path;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::timeout;
    use tracing::debug;

    use crate::auth::join_token;
    use crate::compress::{decompress, Tier};
    use crate::protocol::ACK;
    use crate::protocol_core::{
        decode_response, encode_request, encode_size_header, read_reply, Opcode, Reply, Response,
    };

    const CONNECT_SECS: u64 = 5;
    /// Upfront buffer reservation for an incoming payload
    const PREALLOC_LIMIT: u64 = 1024 * 1024;

    /// Split a prompt line into `(method, name)`. Exactly two fields, else `None`.
    pub fn parse_command(line: &str) -> Option<(Opcode, String)> {
        let mut parts = line.split_whitespace();
        let (method, arg) = (parts.next()?, parts.next()?);
        if parts.next().is_some() {
            return None;
        }
        Some((Opcode::from_method(method)?, arg.to_string()))
    }

    #[derive(Debug)]
    pub enum SimpleGet {
        Data(Vec<u8>),
        Refused(Response),
    }

    #[derive(Debug)]
    pub struct TierReceipt {
        pub tier: Tier,
        pub payload: Vec<u8>,
        /// Time from the size header to the last payload byte
        pub transfer_time: Duration,
    }

    #[derive(Debug)]
    pub struct AdaptiveGet {
        /// Tiers received before the final frame (all three on success)
        pub tiers: Vec<TierReceipt>,
        pub response: Response,
    }

    impl AdaptiveGet {
        /// Decompressed contents of the last received tier
        pub fn contents(&self) -> Result<Option<Vec<u8>>> {
            match self.tiers.last() {
                Some(t) => Ok(Some(decompress(&t.payload).context("Failed to decompress tier")?)),
                None => Ok(None),
            }
        }
    }

    pub struct Client {
        stream: TcpStream,
        token: Option<String>,
    }

    impl Client {
        pub async fn connect(addr: &str) -> Result<Self> {
            let stream = timeout(Duration::from_secs(CONNECT_SECS), TcpStream::connect(addr))
                .await
                .with_context(|| format!("connect timeout ({}s): {}", CONNECT_SECS, addr))?
                .with_context(|| format!("connect {}", addr))?;
            let _ = stream.set_nodelay(true);
            debug!(local = ?stream.local_addr().ok(), remote = addr, "connected");
            Ok(Self { stream, token: None })
        }

        /// Prefix GET/DELETE targets with a session token
        pub fn with_token(mut self, token: Option<String>) -> Self {
            self.token = token;
            self
        }

        async fn send_request(&mut self, op: Opcode, name: &str) -> Result<()> {
            let target = match (&self.token, op) {
                (Some(token), Opcode::Get | Opcode::Delete) => join_token(token, name),
                _ => name.to_string(),
            };
            let frame = encode_request(op, &target)?;
            self.stream.write_all(&frame).await?;
            Ok(())
        }

        async fn response(&mut self) -> Result<Response> {
            decode_response(&mut self.stream)
                .await
                .context("Failed to read server response")
        }

        pub async fn put(&mut self, remote: &str, data: &[u8]) -> Result<Response> {
            self.send_request(Opcode::Put, remote).await?;
            self.stream.write_all(&encode_size_header(data.len() as u64)).await?;
            self.stream.write_all(data).await?;
            self.stream.flush().await?;
            self.response().await
        }

        /// Stream a local file; returns the response and the byte count sent
        pub async fn put_file(&mut self, remote: &str, local: &Path) -> Result<(Response, u64)> {
            let file = tokio::fs::File::open(local)
                .await
                .with_context(|| format!("open {}", local.display()))?;
            let size = file.metadata().await?.len();
            self.send_request(Opcode::Put, remote).await?;
            self.stream.write_all(&encode_size_header(size)).await?;
            let sent = tokio::io::copy(&mut file.take(size), &mut self.stream).await?;
            if sent != size {
                anyhow::bail!("{} shrank while sending ({} of {} bytes)", local.display(), sent, size);
            }
            self.stream.flush().await?;
            Ok((self.response().await?, sent))
        }

        /// Read exactly `size` payload bytes. The buffer grows with what
        /// actually arrives, so a bogus header cannot force a huge allocation.
        async fn read_payload(&mut self, size: u64) -> Result<Vec<u8>> {
            let mut data = Vec::with_capacity(size.min(PREALLOC_LIMIT) as usize);
            (&mut self.stream).take(size).read_to_end(&mut data).await?;
            if data.len() as u64 != size {
                anyhow::bail!("server closed after {} of {} bytes", data.len(), size);
            }
            Ok(data)
        }

        pub async fn get_simple(&mut self, remote: &str) -> Result<SimpleGet> {
            self.send_request(Opcode::Get, remote).await?;
            match read_reply(&mut self.stream).await? {
                Reply::Status(resp) => Ok(SimpleGet::Refused(resp)),
                Reply::Payload(size) => Ok(SimpleGet::Data(self.read_payload(size).await?)),
            }
        }

        /// Receive up to three tiers, ACKing each, then the final status frame
        pub async fn get_adaptive(&mut self, remote: &str) -> Result<AdaptiveGet> {
            self.send_request(Opcode::Get, remote).await?;
            let mut tiers = Vec::with_capacity(Tier::ALL.len());
            for tier in Tier::ALL {
                let size = match read_reply(&mut self.stream).await? {
                    Reply::Status(response) => return Ok(AdaptiveGet { tiers, response }),
                    Reply::Payload(size) => size,
                };
                let started = Instant::now();
                let payload = self
                    .read_payload(size)
                    .await
                    .with_context(|| format!("reading {} payload", tier))?;
                let transfer_time = started.elapsed();
                tiers.push(TierReceipt {
                    tier,
                    payload,
                    transfer_time,
                });
                self.stream.write_all(&ACK).await?;
                self.stream.flush().await?;
            }
            let response = self.response().await?;
            Ok(AdaptiveGet { tiers, response })
        }

        pub async fn delete(&mut self, remote: &str) -> Result<Response> {
            self.send_request(Opcode::Delete, remote).await?;
            self.stream.flush().await?;
            self.response().await
        }
    }

}
