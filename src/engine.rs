//! Adaptive GET: three gzip tiers, each ACKed by the client, with a settle
//! wait between tiers so one tier's load does not leak into the next.
//!
//! The protocol state lives in a plain enum advanced by [`step`], a pure
//! function of `(state, event)`. [`adaptive_get`] is the only code that touches
//! the socket: it performs the effects `step` asks for and feeds back events.
//!
//! ```text
//! SendTier(L1) -Sent-> WaitAck(L1) -Ack/settle-> SendTier(L2) -Sent-> WaitAck(L2)
//!     -Ack/settle-> SendTier(L3) -Sent-> WaitAck(L3) -Ack-> SendFinalStatus -Sent-> Done
//! ```
//!
//! A non-ACK frame leaves the machine in `WaitAck` and the driver reads again.
//! The whole `WaitAck` stay is bounded by the ACK deadline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout_at;
use tracing::{debug, error, info, warn};

use crate::compress::{compress, Tier};
use crate::handlers::{bad_request, lookup_failure, TransferError};
use crate::metrics::{GetReport, MetricsSink, TierReport};
use crate::monitor::{ResourceMonitor, ResourceProbe};
use crate::protocol::status;
use crate::protocol_core::{encode_size_header, read_ack, write_response, Response};
use crate::store::FileStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TierState {
    SendTier(Tier),
    WaitAck(Tier),
    SendFinalStatus,
    Done,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// The frame owed by the current state has been written
    Sent,
    Ack,
    NonAck,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Effect {
    SendTier(Tier),
    ReadAck,
    /// Block until the resource monitor reports baseline again
    Settle,
    SendStatus,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("event {event:?} is not valid in state {state:?}")]
    UnexpectedEvent { state: TierState, event: Event },
    #[error("no event produced in state {0:?}")]
    Stalled(TierState),
}

/// Initial state and the effects it owes
pub fn start() -> (TierState, Vec<Effect>) {
    (TierState::SendTier(Tier::Fast), vec![Effect::SendTier(Tier::Fast)])
}

pub fn step(state: TierState, event: Event) -> Result<(TierState, Vec<Effect>), EngineError> {
    use TierState::*;
    let next = match (state, event) {
        (SendTier(t), Event::Sent) => (WaitAck(t), vec![Effect::ReadAck]),
        (WaitAck(t), Event::Ack) => match t.next() {
            Some(n) => (SendTier(n), vec![Effect::Settle, Effect::SendTier(n)]),
            None => (SendFinalStatus, vec![Effect::SendStatus]),
        },
        (WaitAck(t), Event::NonAck) => (WaitAck(t), vec![Effect::ReadAck]),
        (SendFinalStatus, Event::Sent) => (Done, Vec::new()),
        (state, event) => return Err(EngineError::UnexpectedEvent { state, event }),
    };
    Ok(next)
}

async fn compress_tier(tier: Tier, data: Arc<[u8]>) -> std::io::Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || compress(tier, &data))
        .await
        .map_err(std::io::Error::other)?
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Serve one adaptive GET of `name`.
///
/// Lookup, compression and settle failures are answered with a status frame
/// and leave the connection open. Socket failures, a closed peer and an
/// elapsed ACK deadline return `Err` and end the session.
pub async fn adaptive_get<S, P>(
    stream: &mut S,
    store: &FileStore,
    name: &str,
    monitor: &ResourceMonitor<P>,
    ack_timeout: Option<Duration>,
    sink: &dyn MetricsSink,
) -> Result<(), TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    P: ResourceProbe,
{
    if name.is_empty() {
        write_response(stream, &bad_request("empty filename")).await?;
        return Ok(());
    }
    let data: Arc<[u8]> = match store.read_all(name).await {
        Ok(d) => d.into(),
        Err(e) => {
            debug!(file = name, "GET lookup failed: {}", e);
            write_response(stream, &lookup_failure(&e, "Unable to stat file")).await?;
            return Ok(());
        }
    };

    let baseline = monitor.capture_baseline().await;
    info!(
        file = name,
        size = data.len(),
        cpu_percent = baseline.cpu_percent,
        available_mem_mb = baseline.available_memory_mb,
        settle_deadline = ?monitor.policy().deadline,
        "pre-compression baseline"
    );
    let mut report = GetReport::new(name, data.len() as u64, baseline);
    let mut ack_deadline: Option<tokio::time::Instant> = None;

    let (mut state, mut effects) = start();
    while state != TierState::Done {
        let mut event = None;
        for effect in effects {
            match effect {
                Effect::SendTier(tier) => {
                    let started = Instant::now();
                    let packed = match compress_tier(tier, data.clone()).await {
                        Ok(p) => p,
                        Err(e) => {
                            error!(file = name, %tier, "compression failed: {}", e);
                            write_response(
                                stream,
                                &Response::new(status::GET_IO, "Transfer error: compression failed"),
                            )
                            .await?;
                            return Ok(());
                        }
                    };
                    let compression = started.elapsed();
                    stream.write_all(&encode_size_header(packed.len() as u64)).await?;
                    stream.write_all(&packed).await?;
                    stream.flush().await?;
                    info!(
                        file = name,
                        %tier,
                        compressed_bytes = packed.len(),
                        compression_ms = millis(compression),
                        "tier sent"
                    );
                    report.tiers.push(TierReport {
                        tier,
                        level: tier.level(),
                        compressed_bytes: packed.len() as u64,
                        compression_ms: millis(compression),
                        settle_ms: None,
                    });
                    event = Some(Event::Sent);
                }
                Effect::ReadAck => {
                    let read = read_ack(stream);
                    let acked = match ack_timeout {
                        Some(limit) => {
                            let deadline = *ack_deadline
                                .get_or_insert_with(|| tokio::time::Instant::now() + limit);
                            timeout_at(deadline, read)
                                .await
                                .map_err(|_| TransferError::AckTimeout(limit))??
                        }
                        None => read.await?,
                    };
                    if acked {
                        ack_deadline = None;
                        event = Some(Event::Ack);
                    } else {
                        debug!(file = name, ?state, "ignoring non-ACK frame");
                        event = Some(Event::NonAck);
                    }
                }
                Effect::Settle => match monitor.wait_settled(&baseline).await {
                    Ok(waited) => {
                        if let Some(last) = report.tiers.last_mut() {
                            last.settle_ms = Some(millis(waited));
                        }
                    }
                    Err(e) => {
                        warn!(file = name, "abandoning GET: {}", e);
                        write_response(
                            stream,
                            &Response::new(status::GET_IO, "Transfer error: system did not settle"),
                        )
                        .await?;
                        return Ok(());
                    }
                },
                Effect::SendStatus => {
                    write_response(stream, &Response::ok()).await?;
                    event = Some(Event::Sent);
                }
            }
        }
        let event = event.ok_or(EngineError::Stalled(state))?;
        (state, effects) = step(state, event)?;
    }

    sink.record(&report);
    info!("GET complete for '{}'", name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::decompress;
    use crate::metrics::tests::CollectSink;
    use crate::metrics::NoopSink;
    use crate::monitor::tests::{fast_policy, sample, ScriptedProbe};
    use crate::protocol::ACK;
    use crate::protocol_core::{decode_response, read_reply, Reply};
    use tempfile::TempDir;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    #[test]
    fn happy_path_walks_every_tier_in_order() {
        let (mut state, mut effects) = start();
        let mut trace = vec![(state, effects.clone())];
        for event in [
            Event::Sent,
            Event::Ack,
            Event::Sent,
            Event::Ack,
            Event::Sent,
            Event::Ack,
            Event::Sent,
        ] {
            (state, effects) = step(state, event).unwrap();
            trace.push((state, effects.clone()));
        }
        use TierState::*;
        assert_eq!(
            trace,
            vec![
                (SendTier(Tier::Fast), vec![Effect::SendTier(Tier::Fast)]),
                (WaitAck(Tier::Fast), vec![Effect::ReadAck]),
                (SendTier(Tier::Balanced), vec![Effect::Settle, Effect::SendTier(Tier::Balanced)]),
                (WaitAck(Tier::Balanced), vec![Effect::ReadAck]),
                (SendTier(Tier::Max), vec![Effect::Settle, Effect::SendTier(Tier::Max)]),
                (WaitAck(Tier::Max), vec![Effect::ReadAck]),
                (SendFinalStatus, vec![Effect::SendStatus]),
                (Done, vec![]),
            ]
        );
    }

    #[test]
    fn no_settle_after_last_tier() {
        let (state, effects) = step(TierState::WaitAck(Tier::Max), Event::Ack).unwrap();
        assert_eq!(state, TierState::SendFinalStatus);
        assert!(!effects.contains(&Effect::Settle));
    }

    #[test]
    fn non_ack_keeps_waiting() {
        for tier in Tier::ALL {
            let (state, effects) = step(TierState::WaitAck(tier), Event::NonAck).unwrap();
            assert_eq!(state, TierState::WaitAck(tier));
            assert_eq!(effects, vec![Effect::ReadAck]);
        }
    }

    #[test]
    fn invalid_events_are_rejected() {
        assert!(step(TierState::SendTier(Tier::Fast), Event::Ack).is_err());
        assert!(step(TierState::SendFinalStatus, Event::Ack).is_err());
        assert_eq!(
            step(TierState::Done, Event::Sent),
            Err(EngineError::UnexpectedEvent {
                state: TierState::Done,
                event: Event::Sent
            })
        );
    }

    fn fixture(contents: &[u8]) -> (TempDir, FileStore) {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("data.txt"), contents).unwrap();
        let store = FileStore::new(dir.path());
        (dir, store)
    }

    fn corpus() -> Vec<u8> {
        (0..4000)
            .map(|i| format!("record {i} status=ok shard={}\n", i % 7))
            .collect::<String>()
            .into_bytes()
    }

    async fn read_tier(client: &mut DuplexStream) -> Vec<u8> {
        let size = match read_reply(client).await.unwrap() {
            Reply::Payload(n) => n,
            Reply::Status(r) => panic!("expected payload, got {}", r),
        };
        let mut buf = vec![0u8; size as usize];
        client.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn full_exchange_over_duplex() {
        let original = corpus();
        let (_dir, store) = fixture(&original);
        let monitor = ResourceMonitor::new(ScriptedProbe::steady(), fast_policy(None));
        let sink = CollectSink::default();
        let (mut client, mut server) = duplex(1 << 20);

        let server_side = adaptive_get(&mut server, &store, "data.txt", &monitor, None, &sink);
        let client_side = async {
            let mut tiers = Vec::new();
            for _ in 0..3 {
                tiers.push(read_tier(&mut client).await);
                client.write_all(&ACK).await.unwrap();
            }
            let last = decode_response(&mut client).await.unwrap();
            (tiers, last)
        };
        let (served, (tiers, last)) = tokio::join!(server_side, client_side);
        served.unwrap();

        assert!(last.is_ok());
        assert_eq!(last.message_lossy(), "OK");
        for t in &tiers {
            assert_eq!(decompress(t).unwrap(), original);
        }
        assert!(tiers[2].len() <= tiers[1].len());
        assert!(tiers[1].len() <= tiers[0].len());

        let reports = sink.reports.lock();
        assert_eq!(reports.len(), 1);
        let r = &reports[0];
        assert_eq!(r.file_size, original.len() as u64);
        assert_eq!(r.file_type, ".txt");
        assert_eq!(r.tiers.iter().map(|t| t.level).collect::<Vec<_>>(), vec![1, 3, 9]);
        assert!(r.tiers[0].settle_ms.is_some());
        assert!(r.tiers[1].settle_ms.is_some());
        assert!(r.tiers[2].settle_ms.is_none());
    }

    #[tokio::test]
    async fn stray_frames_do_not_advance() {
        let (_dir, store) = fixture(b"small file");
        let monitor = ResourceMonitor::new(ScriptedProbe::steady(), fast_policy(None));
        let (mut client, mut server) = duplex(1 << 16);

        let server_side = adaptive_get(&mut server, &store, "data.txt", &monitor, None, &NoopSink);
        let client_side = async {
            let first = read_tier(&mut client).await;
            // Two junk frames before the real ACK
            client.write_all(&[0x01, 0x00, 0x00, 0x07]).await.unwrap();
            client.write_all(&ACK).await.unwrap();
            let second = read_tier(&mut client).await;
            client.write_all(&ACK).await.unwrap();
            let third = read_tier(&mut client).await;
            client.write_all(&ACK).await.unwrap();
            let last = decode_response(&mut client).await.unwrap();
            (first, second, third, last)
        };
        let (served, (a, b, c, last)) = tokio::join!(server_side, client_side);
        served.unwrap();
        for t in [a, b, c] {
            assert_eq!(decompress(&t).unwrap(), b"small file");
        }
        assert!(last.is_ok());
    }

    #[tokio::test]
    async fn missing_file_answers_not_found() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        let monitor = ResourceMonitor::new(ScriptedProbe::steady(), fast_policy(None));
        let (mut client, mut server) = duplex(1024);

        adaptive_get(&mut server, &store, "a.txt", &monitor, None, &NoopSink)
            .await
            .unwrap();
        let mut raw = vec![0u8; 17];
        client.read_exact(&mut raw).await.unwrap();
        let mut expected = vec![0x00, 0x0F, 0x41];
        expected.extend_from_slice(b"file not found");
        assert_eq!(raw, expected);
    }

    #[tokio::test]
    async fn directory_target_answers_stat_failed() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("folder")).unwrap();
        let store = FileStore::new(dir.path());
        let monitor = ResourceMonitor::new(ScriptedProbe::steady(), fast_policy(None));
        let sink = CollectSink::default();
        let (mut client, mut server) = duplex(1024);

        adaptive_get(&mut server, &store, "folder", &monitor, None, &sink)
            .await
            .unwrap();
        match read_reply(&mut client).await.unwrap() {
            Reply::Status(r) => assert_eq!(r.status, status::STAT_FAILED),
            other => panic!("expected status frame, got {:?}", other),
        }
        assert!(sink.reports.lock().is_empty());
    }

    #[tokio::test]
    async fn silent_client_hits_ack_deadline() {
        let (_dir, store) = fixture(b"payload");
        let monitor = ResourceMonitor::new(ScriptedProbe::steady(), fast_policy(None));
        let (mut client, mut server) = duplex(1 << 16);
        let limit = Duration::from_millis(50);

        let server_side = adaptive_get(&mut server, &store, "data.txt", &monitor, Some(limit), &NoopSink);
        let client_side = async {
            read_tier(&mut client).await;
            // never ACK
        };
        let (served, ()) = tokio::join!(server_side, client_side);
        assert!(matches!(served, Err(TransferError::AckTimeout(d)) if d == limit));
    }

    #[tokio::test]
    async fn unsettled_system_abandons_get_with_status() {
        let (_dir, store) = fixture(b"payload");
        // Baseline reads 10% CPU, every later poll reads 90%
        let probe = ScriptedProbe::new(&[sample(10.0, 4096), sample(90.0, 4096)]);
        let monitor = ResourceMonitor::new(probe, fast_policy(Some(Duration::from_millis(30))));
        let (mut client, mut server) = duplex(1 << 16);

        let server_side = adaptive_get(&mut server, &store, "data.txt", &monitor, None, &NoopSink);
        let client_side = async {
            read_tier(&mut client).await;
            client.write_all(&ACK).await.unwrap();
            read_reply(&mut client).await.unwrap()
        };
        let (served, reply) = tokio::join!(server_side, client_side);
        served.unwrap();
        match reply {
            Reply::Status(r) => assert_eq!(r.status, status::GET_IO),
            other => panic!("expected status frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn peer_closing_mid_get_is_fatal() {
        let (_dir, store) = fixture(b"payload");
        let monitor = ResourceMonitor::new(ScriptedProbe::steady(), fast_policy(None));
        let (mut client, mut server) = duplex(1 << 16);

        let server_side = adaptive_get(&mut server, &store, "data.txt", &monitor, None, &NoopSink);
        let client_side = async move {
            read_tier(&mut client).await;
            drop(client);
        };
        let (served, ()) = tokio::join!(server_side, client_side);
        assert!(served.is_err());
    }
}
