//! Real-time side cache of the gain map.
//!
//! A worker thread owns the connection to the restricted interface, refreshes
//! a snapshot out of band and publishes it through a [`SharedCell`]. Lookups
//! from the audio thread only clone a [`Shared`] handle out of the cell, which
//! is an atomic increment; when that clone turns out to be the last reference
//! its deallocation is queued for the worker's [`Collector`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use basedrop::{Collector, Handle, Shared, SharedCell};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use tracing::{debug, info, warn};

use crate::client::ReadOnlyClient;
use crate::config::BridgeConfig;
use crate::engine::GainLookup;
use crate::store::DEFAULT_GAIN;

/// Lifecycle of the bridge's connection to the service.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and none wanted.
    Disconnected = 0,
    /// A connect attempt is in progress.
    Connecting = 1,
    /// Connected; refreshes are scheduled.
    Connected = 2,
    /// The connection failed; a reconnect is pending.
    Interrupted = 3,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Interrupted,
            _ => Self::Disconnected,
        }
    }
}

#[derive(Default)]
struct GainSnapshot {
    gains: HashMap<String, f32>,
    generation: u64,
}

enum Command {
    Connect,
    Refresh,
    Disconnect,
    Clear,
    Shutdown,
}

/// Non-blocking gain lookups backed by a periodically refreshed snapshot.
pub struct CacheBridge {
    commands: Sender<Command>,
    state: Arc<AtomicU8>,
    snapshot: Option<Arc<SharedCell<GainSnapshot>>>,
    worker: Option<JoinHandle<()>>,
}

impl CacheBridge {
    /// Spawn the bridge worker. No connection is attempted until [`connect`](Self::connect).
    pub fn new(config: BridgeConfig) -> std::io::Result<Self> {
        let (commands, inbox) = unbounded();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let state = Arc::new(AtomicU8::new(ConnectionState::Disconnected as u8));

        let worker_state = Arc::clone(&state);
        let loopback = commands.clone();
        let worker = thread::Builder::new()
            .name("gain-cache-bridge".into())
            .spawn(move || {
                // The collector is !Sync, so it lives and dies on this thread.
                let mut collector = Collector::new();
                let handle = collector.handle();
                let cell = Arc::new(SharedCell::new(Shared::new(
                    &handle,
                    GainSnapshot::default(),
                )));
                if ready_tx.send(Arc::clone(&cell)).is_err() {
                    return;
                }
                let mut worker = Worker {
                    config,
                    handle,
                    cell,
                    state: worker_state,
                    loopback,
                    client: None,
                    next_refresh: None,
                    reconnect_at: None,
                    generation: 0,
                };
                worker.run(&inbox, &mut collector);
                drop(worker);
                collector.collect();
            })?;

        let snapshot = ready_rx
            .recv()
            .map_err(|_| std::io::Error::other("cache bridge worker exited"))?;

        Ok(Self {
            commands,
            state,
            snapshot: Some(snapshot),
            worker: Some(worker),
        })
    }

    /// Ask the worker to connect; the first refresh is deferred, never inline.
    pub fn connect(&self) {
        self.send(Command::Connect);
    }

    /// Request an out-of-band refresh. Failures keep the current snapshot.
    pub fn refresh_cache(&self) {
        self.send(Command::Refresh);
    }

    /// Drop the connection and stop reconnecting. The snapshot is kept.
    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    /// Replace the snapshot with an empty one so lookups return the default.
    pub fn clear_cache(&self) {
        self.send(Command::Clear);
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Number of snapshots published by successful refreshes.
    pub fn snapshot_generation(&self) -> u64 {
        self.snapshot
            .as_ref()
            .map(|cell| cell.get().generation)
            .unwrap_or(0)
    }

    /// Cached gain for `app_id`, or 1.0. Lock free and allocation free.
    pub fn get_gain(&self, app_id: &str) -> f32 {
        match &self.snapshot {
            Some(cell) => cell
                .get()
                .gains
                .get(app_id)
                .copied()
                .unwrap_or(DEFAULT_GAIN),
            None => DEFAULT_GAIN,
        }
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("cache bridge worker is gone");
        }
    }
}

impl GainLookup for CacheBridge {
    fn gain_for(&self, app_id: &str) -> f32 {
        self.get_gain(app_id)
    }
}

impl Drop for CacheBridge {
    fn drop(&mut self) {
        self.snapshot = None;
        let _ = self.commands.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

struct Worker {
    config: BridgeConfig,
    handle: Handle,
    cell: Arc<SharedCell<GainSnapshot>>,
    state: Arc<AtomicU8>,
    loopback: Sender<Command>,
    client: Option<ReadOnlyClient>,
    next_refresh: Option<Instant>,
    reconnect_at: Option<Instant>,
    generation: u64,
}

impl Worker {
    fn run(&mut self, inbox: &Receiver<Command>, collector: &mut Collector) {
        loop {
            collector.collect();
            let command = match self.next_deadline() {
                Some(deadline) => {
                    let wait = deadline.saturating_duration_since(Instant::now());
                    match inbox.recv_timeout(wait) {
                        Ok(command) => Some(command),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => return,
                    }
                }
                None => match inbox.recv() {
                    Ok(command) => Some(command),
                    Err(_) => return,
                },
            };

            match command {
                Some(Command::Connect) => self.connect(),
                Some(Command::Refresh) => self.refresh(),
                Some(Command::Disconnect) => self.teardown(),
                Some(Command::Clear) => self.publish(HashMap::new(), false),
                Some(Command::Shutdown) => {
                    self.teardown();
                    return;
                }
                None => self.on_timer(),
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        match (self.reconnect_at, self.next_refresh) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn on_timer(&mut self) {
        let now = Instant::now();
        if self.reconnect_at.is_some_and(|at| at <= now) {
            self.reconnect_at = None;
            self.connect();
        }
        if self.next_refresh.is_some_and(|at| at <= now) {
            self.refresh();
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.swap(state as u8, Ordering::AcqRel);
        if previous != state as u8 {
            debug!(from = ?ConnectionState::from_u8(previous), to = ?state, "cache bridge state");
        }
    }

    fn connect(&mut self) {
        if self.client.is_some() {
            return;
        }
        self.reconnect_at = None;
        self.set_state(ConnectionState::Connecting);
        match ReadOnlyClient::connect(&self.config.socket, self.config.request_timeout) {
            Ok(client) => {
                self.client = Some(client);
                self.set_state(ConnectionState::Connected);
                info!(socket = %self.config.socket.display(), "cache bridge connected");
                // Deferred: queued behind whatever else is pending.
                let _ = self.loopback.send(Command::Refresh);
            }
            Err(err) => {
                warn!(%err, "cache bridge connect failed");
                self.interrupt();
            }
        }
    }

    fn refresh(&mut self) {
        let Some(client) = &self.client else {
            self.next_refresh = None;
            return;
        };
        match client.all_gains() {
            Ok(gains) => {
                let count = gains.len();
                self.publish(gains, true);
                debug!(entries = count, generation = self.generation, "gain snapshot refreshed");
                self.next_refresh = Some(Instant::now() + self.config.refresh_interval);
            }
            Err(err) => {
                warn!(%err, "gain refresh failed, keeping previous snapshot");
                self.interrupt();
            }
        }
    }

    fn publish(&mut self, gains: HashMap<String, f32>, refreshed: bool) {
        if refreshed {
            self.generation += 1;
        }
        let snapshot = GainSnapshot {
            gains,
            generation: self.generation,
        };
        self.cell.set(Shared::new(&self.handle, snapshot));
    }

    fn interrupt(&mut self) {
        self.client = None;
        self.next_refresh = None;
        self.set_state(ConnectionState::Interrupted);
        self.reconnect_at = Some(Instant::now() + self.config.reconnect_backoff);
        debug!(backoff = ?self.config.reconnect_backoff, "cache bridge reconnect scheduled");
    }

    fn teardown(&mut self) {
        self.client = None;
        self.next_refresh = None;
        self.reconnect_at = None;
        self.set_state(ConnectionState::Disconnected);
    }
}
