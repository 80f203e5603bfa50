//! Reconnect supervisor for the upstream connection.
//!
//! A dedicated thread sleeps on a [`ReconnectSignal`]. Client accepts (or an
//! upstream loss, when the relay does not wait for clients) bump the signal;
//! once it reaches the configured threshold the thread wakes, waits for the
//! upstream socket file to exist, connects with a fixed retry delay and hands
//! the stream to [`Relay::attach_upstream`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::relay::Relay;
use crate::socket;

/// Coalescing wakeup for the supervisor.
///
/// Notifications increment a counter and drop a token into a channel of
/// depth one, so any number of notifications between two waits cost one
/// wakeup.
#[derive(Debug)]
pub struct ReconnectSignal {
    pending: AtomicU32,
    threshold: u32,
    tx: SyncSender<()>,
    rx: Mutex<Receiver<()>>,
}

impl ReconnectSignal {
    /// Create a signal that releases a waiter after `threshold` notifications.
    #[must_use]
    pub fn new(threshold: u32) -> Self {
        let (tx, rx) = mpsc::sync_channel(1);
        Self {
            pending: AtomicU32::new(0),
            threshold: threshold.max(1),
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Count one event (a client accept).
    pub fn notify(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        let _ = self.tx.try_send(());
    }

    /// Release the waiter regardless of how many events were counted.
    pub fn trigger(&self) {
        self.pending.fetch_max(self.threshold, Ordering::SeqCst);
        let _ = self.tx.try_send(());
    }

    /// Events counted since the last release.
    #[must_use]
    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::SeqCst)
    }

    /// Block until the threshold is reached, then reset the counter.
    pub fn wait(&self) {
        let rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if self.try_release() {
                return;
            }
            // We own the sender, so the channel never disconnects.
            let _ = rx.recv();
        }
    }

    fn try_release(&self) -> bool {
        self.pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n >= self.threshold).then_some(0)
            })
            .is_ok()
    }
}

/// Spawn the supervisor thread for `relay`'s upstream at `path`.
///
/// The loop never returns on its own; it stops once the relay's reactor has
/// been shut down and the signal fires again.
pub fn spawn(relay: Arc<Relay>, path: PathBuf, retry: Duration) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("rilproxy-supervisor".to_owned())
        .spawn(move || run(&relay, &path, retry))
}

fn run(relay: &Relay, path: &std::path::Path, retry: Duration) {
    let signal = relay.reconnect_signal();
    log::info!("[supervisor] watching upstream {}", path.display());

    loop {
        signal.wait();
        if relay.is_shut_down() {
            log::info!("[supervisor] relay shut down, exiting");
            return;
        }
        if relay.upstream_connected() {
            log::debug!("[supervisor] woken but upstream already connected");
            continue;
        }

        log::info!("[supervisor] connecting to {}", path.display());
        let mut attempts: u64 = 0;
        loop {
            socket::wait_for_path(path, retry);
            attempts += 1;
            match socket::connect(path) {
                Ok(stream) => match relay.attach_upstream(stream) {
                    Ok(true) => {
                        log::info!("[supervisor] upstream connected after {attempts} attempt(s)");
                        break;
                    }
                    Ok(false) => {
                        log::debug!("[supervisor] upstream was attached concurrently");
                        break;
                    }
                    Err(e) => {
                        log::warn!("[supervisor] handoff failed: {e}");
                    }
                },
                Err(e) => {
                    if attempts == 1 || attempts % 30 == 0 {
                        log::warn!("[supervisor] attempt {attempts}: {e}");
                    }
                }
            }
            if relay.is_shut_down() {
                return;
            }
            thread::sleep(retry);
        }
    }
}
