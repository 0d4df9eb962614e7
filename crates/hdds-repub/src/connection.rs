// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection supervision.
//!
//! [`ConnectionSupervisor`] owns the broker connection handle. It runs at
//! most one connection attempt at a time, in a background task, and is the
//! only place that knows whether the broker is reachable. Everything else
//! asks it via [`ConnectionSupervisor::is_connected`] or watches the state
//! channel.

use crate::transport::{BrokerClient, TransportError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;

/// Connectivity state of a supervised connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        };
        f.write_str(s)
    }
}

struct Slot<H> {
    state: ConnectionState,
    handle: Option<Arc<H>>,
    /// Bumped by every attempt and every reset; a finishing attempt whose
    /// epoch is stale must not install its handle.
    epoch: u64,
}

struct Shared<B: BrokerClient> {
    name: String,
    client: Arc<B>,
    endpoints: Vec<String>,
    connect_timeout: Duration,
    slot: Mutex<Slot<B::Handle>>,
    attempts: AtomicU64,
    state_tx: watch::Sender<ConnectionState>,
}

impl<B: BrokerClient> Shared<B> {
    fn lock(&self) -> MutexGuard<'_, Slot<B::Handle>> {
        match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn finish_attempt(&self, epoch: u64, result: Result<B::Handle, TransportError>) {
        let mut slot = self.lock();

        if slot.epoch != epoch {
            tracing::debug!(
                "[{}] discarding result of superseded connection attempt",
                self.name
            );
            return;
        }

        match result {
            Ok(handle) => {
                slot.handle = Some(Arc::new(handle));
                slot.state = ConnectionState::Connected;
                self.state_tx.send_replace(ConnectionState::Connected);
                tracing::info!("[{}] connected to {:?}", self.name, self.endpoints);
            }
            Err(err) => {
                slot.handle = None;
                slot.state = ConnectionState::Disconnected;
                self.state_tx.send_replace(ConnectionState::Disconnected);
                tracing::warn!("[{}] connection failed: {}", self.name, err);
            }
        }
    }
}

/// Lazily (re)established connection to a single broker endpoint set.
///
/// Cloning is cheap; clones share the same connection.
pub struct ConnectionSupervisor<B: BrokerClient> {
    shared: Arc<Shared<B>>,
}

impl<B: BrokerClient> Clone for ConnectionSupervisor<B> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<B: BrokerClient> ConnectionSupervisor<B> {
    /// Create a disconnected supervisor.
    ///
    /// `name` only labels log lines.
    pub fn new(
        name: impl Into<String>,
        client: Arc<B>,
        endpoints: Vec<String>,
        connect_timeout: Duration,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                client,
                endpoints,
                connect_timeout,
                slot: Mutex::new(Slot {
                    state: ConnectionState::Disconnected,
                    handle: None,
                    epoch: 0,
                }),
                attempts: AtomicU64::new(0),
                state_tx,
            }),
        }
    }

    /// Start a connection attempt unless one is in flight or already done.
    ///
    /// Never blocks: the attempt runs on a spawned task, so this must be
    /// called from within a tokio runtime. Returns true if a new attempt was
    /// launched.
    pub fn connect(&self) -> bool {
        let epoch = {
            let mut slot = self.shared.lock();
            if slot.state != ConnectionState::Disconnected {
                return false;
            }
            slot.state = ConnectionState::Connecting;
            slot.epoch += 1;
            self.shared
                .state_tx
                .send_replace(ConnectionState::Connecting);
            slot.epoch
        };

        self.shared.attempts.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            "[{}] connecting to {:?}",
            self.shared.name,
            self.shared.endpoints
        );

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let timeout = shared.connect_timeout;
            let result =
                match tokio::time::timeout(timeout, shared.client.connect(&shared.endpoints)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Timeout(timeout)),
                };
            shared.finish_attempt(epoch, result);
        });

        true
    }

    /// Drop the connection handle and return to Disconnected.
    ///
    /// Called after a publish failed because the broker went away. An
    /// attempt still in flight is invalidated.
    pub fn reset(&self) {
        let previous = {
            let mut slot = self.shared.lock();
            let previous = slot.state;
            slot.handle = None;
            slot.epoch += 1;
            slot.state = ConnectionState::Disconnected;
            self.shared
                .state_tx
                .send_replace(ConnectionState::Disconnected);
            previous
        };

        if previous != ConnectionState::Disconnected {
            tracing::warn!(
                "[{}] connection reset ({} -> disconnected)",
                self.shared.name,
                previous
            );
        }
    }

    /// Non-blocking connectivity check.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// Connection handle, if connected.
    pub fn handle(&self) -> Option<Arc<B::Handle>> {
        let slot = self.shared.lock();
        match slot.state {
            ConnectionState::Connected => slot.handle.clone(),
            _ => None,
        }
    }

    /// Subscribe to state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Wait until connected, giving up after `timeout`.
    ///
    /// Does not start an attempt on its own.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.watch_state();
        let wait = async {
            loop {
                if *rx.borrow_and_update() == ConnectionState::Connected {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }

    /// Number of underlying connection attempts launched so far.
    pub fn connect_attempts(&self) -> u64 {
        self.shared.attempts.load(Ordering::Relaxed)
    }

    /// The broker client.
    pub fn client(&self) -> &Arc<B> {
        &self.shared.client
    }
}
