//! Transfer Device
//!
//! Owns the listening socket and the fixed target address. The accept
//! loop hands every inbound connection to a setup task that runs the
//! admission hook, dials the target, and registers a relay. Shutdown
//! swaps the registry out wholesale and drains the captured relays
//! concurrently.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::admission::AdmissionPolicy;
use crate::config::Config;
use crate::hooks::{AdmissionHook, CloseHook, DataHook, Status};
use crate::metrics::Metrics;
use crate::relay::Relay;
use crate::Result;

/// Backoff bounds for accept errors when not configured otherwise.
const DEFAULT_ACCEPT_BACKOFF_INITIAL: Duration = Duration::from_millis(10);
const DEFAULT_ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Accepts client connections and relays each one to the target address.
pub struct Device {
    bind_addr: SocketAddr,
    target_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    state: AtomicU8,
    relays: Mutex<HashMap<u64, Arc<Relay>>>,
    admission_hook: Mutex<Option<AdmissionHook>>,
    data_hook: Mutex<Option<DataHook>>,
    close_hook: Mutex<Option<CloseHook>>,
    shutdown_tx: broadcast::Sender<()>,
    metrics: Arc<Metrics>,
    accept_backoff_initial: Duration,
    accept_backoff_max: Duration,
}

impl Device {
    /// Bind the listening socket.
    ///
    /// This is the only operation whose failure a caller ever sees; every
    /// later per-connection failure is handled internally.
    pub async fn bind(bind_addr: SocketAddr, target_addr: SocketAddr) -> Result<Self> {
        Self::bind_with_backoff(
            bind_addr,
            target_addr,
            DEFAULT_ACCEPT_BACKOFF_INITIAL,
            DEFAULT_ACCEPT_BACKOFF_MAX,
        )
        .await
    }

    /// Bind with explicit accept-error backoff bounds.
    pub async fn bind_with_backoff(
        bind_addr: SocketAddr,
        target_addr: SocketAddr,
        accept_backoff_initial: Duration,
        accept_backoff_max: Duration,
    ) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind listener on {}", bind_addr))?;
        let bind_addr = listener
            .local_addr()
            .context("failed to read listener local address")?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            bind_addr,
            target_addr,
            listener: Mutex::new(Some(listener)),
            state: AtomicU8::new(Status::Closed.raw()),
            relays: Mutex::new(HashMap::new()),
            admission_hook: Mutex::new(None),
            data_hook: Mutex::new(None),
            close_hook: Mutex::new(None),
            shutdown_tx,
            metrics: Arc::new(Metrics::new()),
            accept_backoff_initial,
            accept_backoff_max,
        })
    }

    /// Build a device from configuration, installing the configured
    /// admission policy.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let device = Self::bind_with_backoff(
            config.server.bind_addr,
            config.server.target_addr,
            config.server.accept_backoff_initial,
            config.server.accept_backoff_max,
        )
        .await?;

        if config.admission.enabled {
            let policy = AdmissionPolicy::from_config(&config.admission)
                .context("invalid admission configuration")?;
            device.set_admission_hook(policy.into_hook());
        }

        Ok(device)
    }

    /// Actual bound address of the listener.
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    /// Target address every admitted connection is relayed to.
    pub fn target_addr(&self) -> SocketAddr {
        self.target_addr
    }

    /// Instantaneous lifecycle state.
    pub fn status(&self) -> Status {
        Status::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Number of live relays in the registry.
    pub fn channel_count(&self) -> usize {
        self.relays.lock().unwrap().len()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Install the admission hook. Ignored once the device is running.
    pub fn set_admission_hook(&self, hook: AdmissionHook) {
        if self.status() == Status::Closed {
            *self.admission_hook.lock().unwrap() = Some(hook);
        }
    }

    /// Install the data-transform hook shared by every relay the device
    /// creates. Ignored once the device is running.
    pub fn set_data_hook(&self, hook: DataHook) {
        if self.status() == Status::Closed {
            *self.data_hook.lock().unwrap() = Some(hook);
        }
    }

    /// Install the close callback shared by every relay the device
    /// creates. Ignored once the device is running.
    pub fn set_close_hook(&self, hook: CloseHook) {
        if self.status() == Status::Closed {
            *self.close_hook.lock().unwrap() = Some(hook);
        }
    }

    /// Run the accept loop until the device is closed.
    ///
    /// Only the first call does anything; the listener is consumed here.
    /// Accept errors never stop the loop, they are retried after an
    /// exponential backoff that resets on the next successful accept.
    pub async fn run(self: Arc<Self>) {
        let listener = self.listener.lock().unwrap().take();
        let Some(listener) = listener else {
            return;
        };

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

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut backoff = self.accept_backoff_initial;

        info!(
            bind_addr = %self.bind_addr,
            target_addr = %self.target_addr,
            "device accepting connections"
        );

        while self.status() == Status::Running {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        backoff = self.accept_backoff_initial;
                        debug!(%peer, "accepted connection");
                        let device = Arc::clone(&self);
                        tokio::spawn(device.establish(stream, peer));
                    }
                    Err(e) => {
                        warn!(error = %e, backoff = ?backoff, "accept failed, backing off");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(self.accept_backoff_max);
                    }
                },
                _ = shutdown_rx.recv() => break,
            }
        }

        info!(bind_addr = %self.bind_addr, "accept loop stopped");
    }

    /// Close the device and drain all live relays.
    ///
    /// Only the winner of the Running -> Closing transition does the
    /// drain; everyone else returns immediately. The registry is swapped
    /// for an empty one under the lock, then the captured relays are
    /// closed concurrently outside it. Does not return until every close
    /// callback has completed.
    pub async fn close(&self) {
        if self
            .state
            .compare_exchange(
                Status::Running.raw(),
                Status::Closing.raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        let _ = self.shutdown_tx.send(());

        let drained: Vec<Arc<Relay>> = {
            let mut relays = self.relays.lock().unwrap();
            std::mem::take(&mut *relays).into_values().collect()
        };

        info!(relay_count = drained.len(), "closing device, draining relays");

        let mut closers = Vec::with_capacity(drained.len());
        for relay in drained {
            closers.push(tokio::spawn(async move {
                relay.close();
            }));
        }
        for closer in closers {
            let _ = closer.await;
        }

        self.state.store(Status::Closed.raw(), Ordering::Release);
        info!(bind_addr = %self.bind_addr, "device closed");
    }

    /// Per-connection setup: admission, dial, relay registration, start.
    async fn establish(self: Arc<Self>, inbound: TcpStream, peer: SocketAddr) {
        self.metrics.record_accepted();

        if !self.admit(&inbound) {
            debug!(%peer, "connection denied by admission policy");
            self.metrics.record_denied();
            return;
        }

        let outbound = match TcpStream::connect(self.target_addr).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    %peer,
                    target_addr = %self.target_addr,
                    error = %e,
                    "dial failed, dropping connection"
                );
                self.metrics.record_dial_failure();
                return;
            }
        };

        let relay = Arc::new(Relay::new(inbound, outbound));
        {
            let mut relays = self.relays.lock().unwrap();
            relay.set_data_hook(Self::wrapped_data_hook(&self));
            relay.set_close_hook(Self::wrapped_close_hook(&self));
            relays.insert(relay.id(), Arc::clone(&relay));
        }

        self.metrics.record_relay_opened(self.channel_count());
        debug!(relay_id = relay.id(), %peer, "relay registered");
        relay.run();
    }

    fn admit(&self, inbound: &TcpStream) -> bool {
        if self.status() != Status::Running {
            return false;
        }
        let hook = self.admission_hook.lock().unwrap().clone();
        match hook {
            Some(hook) => hook(inbound),
            None => true,
        }
    }

    /// Data hook installed into every relay: forwards only while the
    /// device is running, delegating to the user hook when one is set.
    fn wrapped_data_hook(device: &Arc<Device>) -> DataHook {
        let weak = Arc::downgrade(device);
        let user_hook = device.data_hook.lock().unwrap().clone();

        Arc::new(move |relay, from, data| {
            let Some(device) = weak.upgrade() else {
                return Bytes::new();
            };
            if device.status() != Status::Running {
                return Bytes::new();
            }
            match &user_hook {
                Some(hook) => hook(relay, from, data),
                None => Bytes::copy_from_slice(data),
            }
        })
    }

    /// Close hook installed into every relay. The back-reference is weak;
    /// the registry entry, not the hook, keeps the device and relay tied
    /// together.
    fn wrapped_close_hook(device: &Arc<Device>) -> CloseHook {
        let weak = Arc::downgrade(device);

        Arc::new(move |relay| {
            if let Some(device) = weak.upgrade() {
                device.relay_closed(relay);
            }
        })
    }

    /// Bookkeeping for a relay that finished closing.
    ///
    /// While the device runs (or after it has fully closed) the relay is
    /// removed from the registry here; during the Closing drain the batch
    /// swap has already emptied it. The user close hook fires in normal
    /// operation and during the drain, not after the device is gone.
    fn relay_closed(&self, relay: &Relay) {
        let status = self.status();

        if matches!(status, Status::Running | Status::Closed) {
            let mut relays = self.relays.lock().unwrap();
            relays.remove(&relay.id());
        }

        self.metrics
            .record_relay_closed(self.channel_count(), relay.total_bytes());
        debug!(relay_id = relay.id(), "relay closed");

        if matches!(status, Status::Running | Status::Closing) {
            let hook = self.close_hook.lock().unwrap().clone();
            if let Some(hook) = hook {
                hook(relay);
            }
        }
    }
}
