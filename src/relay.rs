//! Duplex Byte Relay
//!
//! Pairs one inbound and one outbound TCP stream and pumps bytes between
//! them in both directions. The two pump tasks share a single close
//! transition, so the close callback fires exactly once no matter which
//! direction fails first or whether both fail at the same time.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::hooks::{CloseHook, DataHook, Direction, Status};

/// Buffer size for each pump read.
pub const CHUNK_SIZE: usize = 64 * 1024;

static NEXT_RELAY_ID: AtomicU64 = AtomicU64::new(1);

/// A single client-to-target relay.
///
/// Created from two already-connected streams; started explicitly with
/// [`Relay::run`]. Hooks may only be installed before start; setter calls
/// on a running relay are silently ignored.
pub struct Relay {
    id: u64,
    inbound_addr: Option<SocketAddr>,
    outbound_addr: Option<SocketAddr>,
    state: AtomicU8,
    endpoints: Mutex<Option<(TcpStream, TcpStream)>>,
    data_hook: Mutex<Option<DataHook>>,
    close_hook: Mutex<Option<CloseHook>>,
    close_tx: broadcast::Sender<()>,
    bytes_inbound: AtomicU64,
    bytes_outbound: AtomicU64,
}

impl Relay {
    /// Create a relay over an inbound and an outbound stream.
    ///
    /// Stores the pair without touching it; nothing moves until
    /// [`Relay::run`].
    pub fn new(inbound: TcpStream, outbound: TcpStream) -> Self {
        let (close_tx, _) = broadcast::channel(1);

        Self {
            id: NEXT_RELAY_ID.fetch_add(1, Ordering::Relaxed),
            inbound_addr: inbound.peer_addr().ok(),
            outbound_addr: outbound.peer_addr().ok(),
            state: AtomicU8::new(Status::Closed.raw()),
            endpoints: Mutex::new(Some((inbound, outbound))),
            data_hook: Mutex::new(None),
            close_hook: Mutex::new(None),
            close_tx,
            bytes_inbound: AtomicU64::new(0),
            bytes_outbound: AtomicU64::new(0),
        }
    }

    /// Identifier used as the relay's registry key.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Peer address of the inbound (client) endpoint.
    pub fn inbound_addr(&self) -> Option<SocketAddr> {
        self.inbound_addr
    }

    /// Peer address of the outbound (target) endpoint.
    pub fn outbound_addr(&self) -> Option<SocketAddr> {
        self.outbound_addr
    }

    /// Instantaneous lifecycle state.
    pub fn status(&self) -> Status {
        Status::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Bytes forwarded out of the given source endpoint, counted after
    /// transformation.
    pub fn bytes_forwarded(&self, from: Direction) -> u64 {
        match from {
            Direction::Inbound => self.bytes_inbound.load(Ordering::Relaxed),
            Direction::Outbound => self.bytes_outbound.load(Ordering::Relaxed),
        }
    }

    /// Total bytes forwarded in both directions.
    pub fn total_bytes(&self) -> u64 {
        self.bytes_forwarded(Direction::Inbound) + self.bytes_forwarded(Direction::Outbound)
    }

    /// Install the data-transform hook. Ignored unless the relay has not
    /// been started yet.
    pub fn set_data_hook(&self, hook: DataHook) {
        if self.status() == Status::Closed {
            *self.data_hook.lock().unwrap() = Some(hook);
        }
    }

    /// Install the close callback. Ignored unless the relay has not been
    /// started yet.
    pub fn set_close_hook(&self, hook: CloseHook) {
        if self.status() == Status::Closed {
            *self.close_hook.lock().unwrap() = Some(hook);
        }
    }

    /// Start the two pump tasks, one per direction.
    ///
    /// Only the first call has any effect; the endpoint pair is consumed
    /// here, so a relay can never be restarted after it closes.
    pub fn run(self: Arc<Self>) {
        let endpoints = self.endpoints.lock().unwrap().take();
        let Some((inbound, outbound)) = endpoints else {
            return;
        };

        // Subscribe before the state flips; a close() racing with startup
        // must still reach both pumps.
        let close_rx_in = self.close_tx.subscribe();
        let close_rx_out = self.close_tx.subscribe();

        if self
            .state
            .compare_exchange(
                Status::Closed.raw(),
                Status::Running.raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        let hook = self.data_hook.lock().unwrap().clone();
        let (in_read, in_write) = inbound.into_split();
        let (out_read, out_write) = outbound.into_split();

        debug!(
            relay_id = self.id,
            inbound = ?self.inbound_addr,
            outbound = ?self.outbound_addr,
            "relay started"
        );

        tokio::spawn(Self::pump(
            Arc::clone(&self),
            in_read,
            out_write,
            Direction::Inbound,
            hook.clone(),
            close_rx_in,
        ));
        tokio::spawn(Self::pump(
            self,
            out_read,
            in_write,
            Direction::Outbound,
            hook,
            close_rx_out,
        ));
    }

    /// Close the relay.
    ///
    /// Only the winner of the Running -> Closed transition does anything:
    /// it wakes both pump tasks, which release their endpoint halves, and
    /// invokes the close callback. Every other caller returns immediately.
    pub fn close(&self) {
        if self
            .state
            .compare_exchange(
                Status::Running.raw(),
                Status::Closed.raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        debug!(relay_id = self.id, "closing relay");
        let _ = self.close_tx.send(());

        let hook = self.close_hook.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook(self);
        }
    }

    fn record_forwarded(&self, from: Direction, len: u64) {
        match from {
            Direction::Inbound => self.bytes_inbound.fetch_add(len, Ordering::Relaxed),
            Direction::Outbound => self.bytes_outbound.fetch_add(len, Ordering::Relaxed),
        };
    }

    /// Pump chunks from `src` to `dst` until the relay closes or the
    /// source fails.
    async fn pump(
        relay: Arc<Relay>,
        mut src: OwnedReadHalf,
        mut dst: OwnedWriteHalf,
        from: Direction,
        hook: Option<DataHook>,
        mut close_rx: broadcast::Receiver<()>,
    ) {
        let mut buf = vec![0u8; CHUNK_SIZE];

        loop {
            let n = tokio::select! {
                read = src.read(&mut buf) => match read {
                    Ok(0) => {
                        debug!(relay_id = relay.id, %from, "peer closed connection");
                        relay.close();
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        debug!(relay_id = relay.id, %from, error = %e, "read failed");
                        relay.close();
                        break;
                    }
                },
                _ = close_rx.recv() => break,
            };

            // The opposite pump may have closed the relay while this read
            // was in flight; the chunk is discarded in that case.
            if relay.status() != Status::Running {
                break;
            }

            let chunk = match &hook {
                Some(hook) => hook(&relay, from, &buf[..n]),
                None => Bytes::copy_from_slice(&buf[..n]),
            };
            if chunk.is_empty() {
                trace!(relay_id = relay.id, %from, "chunk suppressed by data hook");
                continue;
            }

            relay.record_forwarded(from, chunk.len() as u64);

            let written = tokio::select! {
                written = dst.write_all(&chunk) => written,
                _ = close_rx.recv() => break,
            };
            if let Err(e) = written {
                // Not acted on here; a broken destination shows up as a
                // read failure on the opposite pump.
                trace!(relay_id = relay.id, %from, error = %e, "write failed");
            }
        }

        let _ = dst.shutdown().await;
    }
}
