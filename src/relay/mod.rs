//! Relay engine: one upstream endpoint fanned out to one or two clients.
//!
//! # Architecture
//!
//! ```text
//! primary client ─┐                         ┌─► primary client
//!                 ├─► Relay ──► upstream ──►├
//! secondary client┘   (outbound cache)      └─► secondary client
//!                                             (inbound caches)
//! ```
//!
//! All traffic is driven by [`Reactor`] callbacks on the reactor thread.
//! The [`supervisor`] thread only touches relay state through
//! [`Relay::attach_upstream`], which takes the same lock.
//!
//! # Caches
//!
//! - *outbound*: a client's records received while upstream is absent.
//!   Allocated when that client first connects, replayed (in client-index
//!   order) when upstream attaches. It outlives the client that filled it
//!   and is only dropped when upstream disconnects.
//! - *inbound*: upstream records for a client that is not connected yet.
//!   Allocated when upstream attaches, replayed when the client connects,
//!   dropped (and re-created empty while upstream is up) when the client
//!   disconnects.
//!
//! # Locking
//!
//! Relay state sits behind one mutex. Dedup state has its own lock and is
//! only taken while the relay lock is held, never the other way round. The
//! reactor's lock is never held while a relay callback runs.

pub mod dedup;
pub mod endpoint;
pub mod supervisor;
pub mod telemetry;

use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;

use crate::cache::RecordCache;
use crate::config::{Config, UpstreamMode};
use crate::error::{RelayError, Result};
use crate::framing::{self, StreamCursor, HEADER_LEN};
use crate::reactor::{Callback, Reactor};
use crate::socket;

use self::dedup::{DedupPolicy, RequestAction};
use self::endpoint::{ClientEndpoint, ClientSlot, ConnStatus, Counters, Endpoint, Side};
use self::supervisor::ReconnectSignal;
use self::telemetry::{DebugPeer, DebugRequest, EndpointStats, TelemetrySnapshot};

/// Accept-time authorization check. Return `false` to refuse the peer.
pub type AcceptFilter = Arc<dyn Fn(&UnixStream, Side) -> bool + Send + Sync>;

/// Which cache of a client to inspect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheDirection {
    /// Upstream records waiting for the client.
    Inbound,
    /// Client records waiting for upstream.
    Outbound,
}

/// Relay state guarded by one mutex.
#[derive(Debug)]
struct Pair {
    upstream: Endpoint,
    clients: [ClientEndpoint; 2],
    debug: Option<UnixListener>,
    /// Accepted debug connections waiting for their request, by fd.
    debug_peers: HashMap<RawFd, DebugPeer>,
}

/// The relay engine for one socket family.
pub struct Relay {
    this: Weak<Relay>,
    config: Config,
    reactor: Arc<Reactor>,
    dedup: Arc<DedupPolicy>,
    signal: Arc<ReconnectSignal>,
    accept_filter: Mutex<Option<AcceptFilter>>,
    inner: Mutex<Pair>,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("selector", &self.config.selector)
            .field("fission", &self.config.fission)
            .field("upstream_mode", &self.config.upstream_mode)
            .finish_non_exhaustive()
    }
}

impl Relay {
    /// Build a relay for `config`'s socket family.
    ///
    /// Nothing is bound until [`Relay::start`].
    #[must_use]
    pub fn new(config: Config, reactor: Arc<Reactor>, dedup: Arc<DedupPolicy>) -> Arc<Self> {
        let family = config.family();
        let upstream = Endpoint::new(config.socket_path(&family.upstream));
        let clients = [
            ClientEndpoint::new(
                ClientSlot::Primary,
                config.socket_path(&family.primary),
                config.fission,
            ),
            ClientEndpoint::new(
                ClientSlot::Secondary,
                config.socket_path(&family.secondary),
                true,
            ),
        ];
        let signal = Arc::new(ReconnectSignal::new(config.reconnect_threshold));

        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            config,
            reactor,
            dedup,
            signal,
            accept_filter: Mutex::new(None),
            inner: Mutex::new(Pair {
                upstream,
                clients,
                debug: None,
                debug_peers: HashMap::new(),
            }),
        })
    }

    /// Bind every listening socket and arm the accept watches.
    ///
    /// In connect mode with `wait_for_client` off, the supervisor is woken
    /// immediately.
    pub fn start(&self) -> Result<()> {
        let perms = self.config.socket_perms();
        let mut pair = self.lock();

        for client in pair.clients.iter_mut().filter(|c| c.active) {
            let listener = socket::bind_listener(&client.endpoint.path, &perms)?;
            let fd = listener.as_raw_fd();
            client.endpoint.listener = Some(listener);
            client.endpoint.counters.status = ConnStatus::Listening;
            self.arm_client_accept(client.slot, fd)?;
            log::info!(
                "[relay] {} client (sim slot {}) on {}",
                client.slot,
                client.sim_slot,
                client.endpoint.path.display()
            );
        }

        if self.config.upstream_mode == UpstreamMode::Listen {
            let listener = socket::bind_listener(&pair.upstream.path, &perms)?;
            let fd = listener.as_raw_fd();
            pair.upstream.listener = Some(listener);
            pair.upstream.counters.status = ConnStatus::Listening;
            self.arm_upstream_accept(fd)?;
        }

        if self.config.debug_socket {
            let path = self.config.socket_path(&self.config.family().debug);
            let listener = socket::bind_listener(&path, &perms)?;
            let cb = self.callback(Self::on_debug_accept);
            self.reactor.add(listener.as_raw_fd(), true, cb)?;
            pair.debug = Some(listener);
        }
        drop(pair);

        if self.config.upstream_mode == UpstreamMode::Connect && !self.config.wait_for_client {
            self.signal.trigger();
        }
        Ok(())
    }

    /// Install the accept-time authorization check.
    pub fn set_accept_filter<F>(&self, filter: F)
    where
        F: Fn(&UnixStream, Side) -> bool + Send + Sync + 'static,
    {
        *self
            .accept_filter
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(filter));
    }

    /// Signal the supervisor waits on.
    #[must_use]
    pub fn reconnect_signal(&self) -> Arc<ReconnectSignal> {
        Arc::clone(&self.signal)
    }

    /// Whether an upstream connection is live.
    #[must_use]
    pub fn upstream_connected(&self) -> bool {
        self.lock().upstream.stream.is_some()
    }

    /// Whether the client in `slot` is connected.
    #[must_use]
    pub fn client_connected(&self, slot: ClientSlot) -> bool {
        self.lock().clients[slot.index()].endpoint.accepted
    }

    /// Stop the reactor and release the supervisor.
    pub fn shutdown(&self) {
        self.reactor.shutdown();
        self.signal.trigger();
    }

    /// Whether [`Relay::shutdown`] (or a reactor shutdown) happened.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.reactor.is_shutdown()
    }

    /// Hand a freshly connected upstream stream to the relay.
    ///
    /// Replays each client's outbound cache onto it in client-index order,
    /// gives every active client a fresh inbound cache and arms the
    /// upstream read watch. Returns `Ok(false)` if upstream was already
    /// connected; `stream` is dropped in that case.
    pub fn attach_upstream(&self, stream: UnixStream) -> Result<bool> {
        let mut pair = self.lock();
        self.attach_upstream_locked(&mut pair, stream)
    }

    fn attach_upstream_locked(&self, pair: &mut Pair, mut stream: UnixStream) -> Result<bool> {
        if pair.upstream.stream.is_some() {
            return Ok(false);
        }
        stream.set_nonblocking(true)?;

        let Pair {
            upstream, clients, ..
        } = pair;

        for client in clients.iter() {
            let Some(cache) = client.outbound.as_ref().filter(|c| !c.is_empty()) else {
                continue;
            };
            let sent = cache.replay(&mut stream)?;
            upstream.counters.record_replay(sent, cache.len());
            log::info!("[relay] replayed {sent} cached record(s) from {} client", client.slot);
        }

        let fd = stream.as_raw_fd();
        upstream.attach(stream, StreamCursor::new(self.config.max_record_size)?);
        for client in clients.iter_mut().filter(|c| c.active) {
            client.inbound = self.fresh_cache();
        }

        let cb = self.callback(Self::on_upstream_readable);
        if let Err(e) = self.reactor.add(fd, true, cb) {
            upstream.detach();
            return Err(e);
        }
        log::info!("[relay] upstream connected (fd={fd})");
        Ok(true)
    }

    /// Tear down one client. Safe to call repeatedly.
    ///
    /// Closes its connection, zeroes its traffic counters and re-arms its
    /// listen watch. The inbound cache is dropped; the outbound cache is
    /// kept for upstream.
    pub fn disconnect_client(&self, slot: ClientSlot) {
        let mut pair = self.lock();
        let upstream_connected = pair.upstream.stream.is_some();
        let client = &mut pair.clients[slot.index()];

        if let Some(fd) = client.endpoint.stream_fd() {
            self.reactor.remove(fd);
        }
        let was_open = client.endpoint.detach().is_some();
        client.inbound = if upstream_connected && client.active {
            self.fresh_cache()
        } else {
            None
        };
        client.endpoint.counters.reset();
        self.dedup.forget(slot);

        if let Some(fd) = client.endpoint.listener_fd() {
            if !self.reactor.is_watched(fd) {
                if let Err(e) = self.arm_client_accept(slot, fd) {
                    log::error!("[relay] cannot re-arm {slot} listener: {e}");
                }
            }
        }
        if was_open {
            log::info!("[relay] {slot} client disconnected");
        }
    }

    /// Tear down upstream. Safe to call repeatedly.
    ///
    /// When a live connection was closed, waits the settling delay, then
    /// disconnects both clients, drops their outbound caches, zeroes all
    /// counters, clears dedup state and (unless waiting for clients) wakes
    /// the supervisor.
    pub fn disconnect_upstream(&self) {
        let was_open = {
            let mut pair = self.lock();
            if let Some(fd) = pair.upstream.stream_fd() {
                self.reactor.remove(fd);
            }
            let was_open = pair.upstream.detach().is_some();
            if let Some(fd) = pair.upstream.listener_fd() {
                if !self.reactor.is_watched(fd) {
                    if let Err(e) = self.arm_upstream_accept(fd) {
                        log::error!("[relay] cannot re-arm upstream listener: {e}");
                    }
                }
            }
            was_open
        };
        if !was_open {
            return;
        }

        let settle = self.config.settle_delay();
        log::info!("[relay] upstream lost, dropping clients in {}ms", settle.as_millis());
        thread::sleep(settle);

        for slot in ClientSlot::ALL {
            self.disconnect_client(slot);
        }
        {
            let mut pair = self.lock();
            pair.upstream.counters.reset();
            for client in &mut pair.clients {
                client.endpoint.counters.reset();
                client.outbound = None;
            }
        }
        self.dedup.reset();

        if self.config.upstream_mode == UpstreamMode::Connect && !self.config.wait_for_client {
            self.signal.trigger();
        }
    }

    /// Current counters for every endpoint.
    #[must_use]
    pub fn snapshot(&self) -> TelemetrySnapshot {
        let pair = self.lock();
        let stats = |ep: &Endpoint| EndpointStats {
            fd: ep.stream_fd(),
            counters: ep.counters.clone(),
        };
        TelemetrySnapshot {
            upstream: stats(&pair.upstream),
            primary: stats(&pair.clients[ClientSlot::Primary.index()].endpoint),
            secondary: stats(&pair.clients[ClientSlot::Secondary.index()].endpoint),
        }
    }

    /// Counters of one side.
    #[must_use]
    pub fn counters(&self, side: Side) -> Counters {
        let pair = self.lock();
        match side {
            Side::Upstream => pair.upstream.counters.clone(),
            Side::Client(slot) => pair.clients[slot.index()].endpoint.counters.clone(),
        }
    }

    /// Framed contents of one client cache, `None` if it is not allocated.
    #[must_use]
    pub fn cache_bytes(&self, slot: ClientSlot, direction: CacheDirection) -> Option<Vec<u8>> {
        let pair = self.lock();
        let client = &pair.clients[slot.index()];
        let cache = match direction {
            CacheDirection::Inbound => client.inbound.as_ref(),
            CacheDirection::Outbound => client.outbound.as_ref(),
        };
        cache.map(|c| c.as_bytes().to_vec())
    }

    /// Record count of one client cache (0 if not allocated).
    #[must_use]
    pub fn cache_count(&self, slot: ClientSlot, direction: CacheDirection) -> usize {
        let pair = self.lock();
        let client = &pair.clients[slot.index()];
        let cache = match direction {
            CacheDirection::Inbound => client.inbound.as_ref(),
            CacheDirection::Outbound => client.outbound.as_ref(),
        };
        cache.map_or(0, RecordCache::count)
    }

    // === Reactor callbacks ===

    fn on_client_accept(&self, slot: ClientSlot, _fd: RawFd) -> Result<()> {
        let mut pair = self.lock();
        let upstream_connected = pair.upstream.stream.is_some();
        let client = &mut pair.clients[slot.index()];
        let Some(listener) = client.endpoint.listener.as_ref() else {
            return Ok(());
        };
        let listen_fd = listener.as_raw_fd();

        let mut stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) => {
                self.arm_client_accept(slot, listen_fd)?;
                if crate::error::is_transient(&e) {
                    return Ok(());
                }
                return Err(RelayError::Io(e));
            }
        };

        if !self.accept_allowed(&stream, Side::Client(slot)) {
            log::warn!("[relay] {slot} client refused by accept filter");
            drop(stream);
            return self.arm_client_accept(slot, listen_fd);
        }

        stream.set_nonblocking(true)?;
        let cursor = StreamCursor::new(self.config.max_record_size)?;
        let fd = stream.as_raw_fd();

        if let Some(inbound) = client.inbound.as_ref().filter(|c| !c.is_empty()) {
            match inbound.replay(&mut stream) {
                Ok(sent) => {
                    client.endpoint.counters.record_replay(sent, inbound.len());
                    log::info!("[relay] replayed {sent} cached record(s) to {slot} client");
                }
                Err(e) => {
                    log::warn!("[relay] replay to {slot} client failed: {e}");
                    drop(stream);
                    return self.arm_client_accept(slot, listen_fd);
                }
            }
        }

        if client.outbound.is_none() {
            client.outbound = self.fresh_cache();
        }
        client.endpoint.attach(stream, cursor);
        let cb = self.callback(move |relay, fd| relay.on_client_readable(slot, fd));
        if let Err(e) = self.reactor.add(fd, true, cb) {
            client.endpoint.detach();
            self.arm_client_accept(slot, listen_fd)?;
            return Err(e);
        }
        log::info!("[relay] {slot} client connected (fd={fd})");
        drop(pair);

        if self.config.upstream_mode == UpstreamMode::Connect && !upstream_connected {
            self.signal.notify();
        }
        Ok(())
    }

    fn on_client_readable(&self, slot: ClientSlot, fd: RawFd) -> Result<()> {
        let mut upstream_failed = false;
        let end = {
            let mut pair = self.lock();
            let Pair {
                upstream, clients, ..
            } = &mut *pair;
            let client = &mut clients[slot.index()];
            if client.endpoint.stream_fd() != Some(fd) {
                return Ok(());
            }

            let (records, mut end) = client.endpoint.read_records();
            for payload in records {
                client.endpoint.counters.record_in(payload.len());
                log::trace!("[relay] {slot} -> upstream: {} bytes", payload.len());

                match self.dedup.on_client_request(slot, &payload) {
                    RequestAction::Reply(record) => {
                        let Some(stream) = client.endpoint.stream.as_mut() else {
                            break;
                        };
                        let reply = &record[HEADER_LEN..];
                        if let Err(e) = framing::write_record(stream, reply) {
                            end = Some(e);
                            break;
                        }
                        client.endpoint.counters.record_out(reply.len());
                    }
                    RequestAction::Forward => {
                        if upstream_failed {
                            continue;
                        }
                        if let Some(up) = upstream.stream.as_mut() {
                            match framing::write_record(up, &payload) {
                                Ok(()) => upstream.counters.record_out(payload.len()),
                                Err(e) => {
                                    log::warn!("[relay] write to upstream failed: {e}");
                                    upstream_failed = true;
                                }
                            }
                        } else if let Some(cache) = client.outbound.as_mut() {
                            if let Err(e) = cache.store_payload(&payload) {
                                log::warn!("[cache] dropped {slot} record: {e}");
                            }
                        } else {
                            log::debug!("[relay] no upstream, dropped {slot} record");
                        }
                    }
                }
            }
            end
        };

        if upstream_failed {
            self.disconnect_upstream();
        }
        match end {
            None => Ok(()),
            Some(RelayError::PeerClosed) => {
                self.disconnect_client(slot);
                Ok(())
            }
            Some(e) => {
                log::warn!("[relay] {slot} client read failed: {e}");
                self.disconnect_client(slot);
                if e.is_fatal() {
                    Err(e)
                } else {
                    Ok(())
                }
            }
        }
    }

    fn on_upstream_readable(&self, fd: RawFd) -> Result<()> {
        let mut failed: Vec<ClientSlot> = Vec::new();
        let end = {
            let mut pair = self.lock();
            let Pair {
                upstream, clients, ..
            } = &mut *pair;
            if upstream.stream_fd() != Some(fd) {
                return Ok(());
            }

            let (records, end) = upstream.read_records();
            for payload in records {
                upstream.counters.record_in(payload.len());
                log::trace!("[relay] upstream -> clients: {} bytes", payload.len());

                if let Some(slot) = self.dedup.on_upstream_record(&payload) {
                    self.deliver(&mut clients[slot.index()], &payload, &mut failed);
                    continue;
                }
                for client in clients.iter_mut().filter(|c| c.active) {
                    self.deliver(client, &payload, &mut failed);
                }
            }
            end
        };

        for slot in failed {
            self.disconnect_client(slot);
        }
        match end {
            None => Ok(()),
            Some(RelayError::PeerClosed) => {
                self.disconnect_upstream();
                Ok(())
            }
            Some(e) => {
                log::warn!("[relay] upstream read failed: {e}");
                if e.is_fatal() {
                    return Err(e);
                }
                self.disconnect_upstream();
                Ok(())
            }
        }
    }

    fn on_upstream_accept(&self, _fd: RawFd) -> Result<()> {
        let mut pair = self.lock();
        let Some(listener) = pair.upstream.listener.as_ref() else {
            return Ok(());
        };
        let listen_fd = listener.as_raw_fd();

        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) => {
                self.arm_upstream_accept(listen_fd)?;
                if crate::error::is_transient(&e) {
                    return Ok(());
                }
                return Err(RelayError::Io(e));
            }
        };
        if !self.accept_allowed(&stream, Side::Upstream) {
            log::warn!("[relay] upstream peer refused by accept filter");
            drop(stream);
            return self.arm_upstream_accept(listen_fd);
        }

        match self.attach_upstream_locked(&mut pair, stream) {
            Ok(_) => Ok(()),
            Err(e) => {
                log::warn!("[relay] upstream handoff failed: {e}");
                pair.upstream.detach();
                self.arm_upstream_accept(listen_fd)
            }
        }
    }

    fn on_debug_accept(&self, _fd: RawFd) -> Result<()> {
        let mut pair = self.lock();
        let stream = match pair.debug.as_ref().map(UnixListener::accept) {
            Some(Ok((stream, _))) => stream,
            Some(Err(e)) if crate::error::is_transient(&e) => return Ok(()),
            Some(Err(e)) => return Err(RelayError::Io(e)),
            None => return Ok(()),
        };
        if pair.debug_peers.len() >= telemetry::MAX_DEBUG_PEERS {
            log::debug!("[relay] too many debug peers, refusing one");
            return Ok(());
        }
        let peer = match DebugPeer::new(stream) {
            Ok(peer) => peer,
            Err(e) => {
                log::debug!("[relay] debug peer setup failed: {e}");
                return Ok(());
            }
        };
        let fd = peer.fd();
        pair.debug_peers.insert(fd, peer);
        self.arm_debug_read(&mut pair, fd);
        Ok(())
    }

    fn on_debug_readable(&self, fd: RawFd) -> Result<()> {
        let Some(mut peer) = self.lock().debug_peers.remove(&fd) else {
            return Ok(());
        };
        match peer.poll_request() {
            Ok(DebugRequest::Pending) => {
                let mut pair = self.lock();
                pair.debug_peers.insert(fd, peer);
                self.arm_debug_read(&mut pair, fd);
            }
            Ok(DebugRequest::Snapshot) => match peer.reply(&self.snapshot()) {
                Ok(()) => log::debug!("[relay] served debug snapshot"),
                Err(e) => log::debug!("[relay] debug reply failed: {e}"),
            },
            Ok(DebugRequest::Ignored) => {}
            Err(e) => log::debug!("[relay] debug request failed: {e}"),
        }
        Ok(())
    }

    // === Helpers ===

    /// Write or cache one upstream record for `client`.
    fn deliver(&self, client: &mut ClientEndpoint, payload: &[u8], failed: &mut Vec<ClientSlot>) {
        let slot = client.slot;
        if failed.contains(&slot) {
            return;
        }
        if client.endpoint.accepted {
            let Some(stream) = client.endpoint.stream.as_mut() else {
                return;
            };
            match framing::write_record(stream, payload) {
                Ok(()) => client.endpoint.counters.record_out(payload.len()),
                Err(e) => {
                    log::warn!("[relay] write to {slot} client failed: {e}");
                    failed.push(slot);
                }
            }
        } else if let Some(cache) = client.inbound.as_mut() {
            if let Err(e) = cache.store_payload(payload) {
                log::warn!("[cache] dropped record for {slot}: {e}");
            }
        }
    }

    fn accept_allowed(&self, stream: &UnixStream, side: Side) -> bool {
        let filter = self
            .accept_filter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        filter.map_or(true, |f| f(stream, side))
    }

    fn fresh_cache(&self) -> Option<RecordCache> {
        self.config
            .cache_enabled
            .then(|| RecordCache::new(self.config.cache_capacity))
    }

    fn arm_client_accept(&self, slot: ClientSlot, listen_fd: RawFd) -> Result<()> {
        let cb = self.callback(move |relay, fd| relay.on_client_accept(slot, fd));
        self.reactor.add(listen_fd, false, cb)
    }

    fn arm_upstream_accept(&self, listen_fd: RawFd) -> Result<()> {
        let cb = self.callback(Self::on_upstream_accept);
        self.reactor.add(listen_fd, false, cb)
    }

    /// One-shot read watch for a parked debug peer; the peer is dropped if
    /// it cannot be armed.
    fn arm_debug_read(&self, pair: &mut Pair, fd: RawFd) {
        let cb = self.callback(Self::on_debug_readable);
        if let Err(e) = self.reactor.add(fd, false, cb) {
            log::debug!("[relay] cannot watch debug peer: {e}");
            pair.debug_peers.remove(&fd);
        }
    }

    /// Wrap a relay method as a reactor callback holding only a weak reference.
    fn callback<F>(&self, f: F) -> Callback
    where
        F: Fn(&Relay, RawFd) -> Result<()> + Send + Sync + 'static,
    {
        let this = self.this.clone();
        Arc::new(move |fd| match this.upgrade() {
            Some(relay) => f(&relay, fd),
            None => Ok(()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Pair> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::path::Path;
    use std::time::{Duration, Instant};

    fn test_config(dir: &Path) -> Config {
        Config {
            socket_dir: dir.to_path_buf(),
            settle_delay_ms: 10,
            retry_delay_ms: 10,
            debug_socket: false,
            ..Config::default()
        }
    }

    fn relay_for(config: Config) -> Arc<Relay> {
        let reactor = Reactor::new(config.max_watches).unwrap();
        let dedup = Arc::new(DedupPolicy::disabled());
        Relay::new(config, reactor, dedup)
    }

    /// Run reactor passes until `cond` holds or two seconds pass.
    fn turn_until(relay: &Relay, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "condition never became true");
            relay.reactor.wake();
            relay.reactor.turn().unwrap();
        }
    }

    #[test]
    fn test_start_binds_only_default_client_without_fission() {
        let tmp = tempfile::TempDir::new().unwrap();
        let relay = relay_for(test_config(tmp.path()));
        relay.start().unwrap();

        assert!(tmp.path().join("rilproxy").exists());
        assert!(!tmp.path().join("rilproxy-fission").exists());
        assert_eq!(relay.reactor.watch_count(), 1);
        assert_eq!(
            relay.counters(Side::Client(ClientSlot::Secondary)).status,
            ConnStatus::Listening
        );
    }

    #[test]
    fn test_client_record_cached_while_upstream_absent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let relay = relay_for(test_config(tmp.path()));
        relay.start().unwrap();

        let mut client = UnixStream::connect(tmp.path().join("rilproxy")).unwrap();
        turn_until(&relay, || relay.client_connected(ClientSlot::Secondary));
        assert_eq!(relay.reconnect_signal().pending(), 1);

        client.write_all(&framing::encode_record(b"ABCDEFGH")).unwrap();
        turn_until(&relay, || {
            relay.cache_count(ClientSlot::Secondary, CacheDirection::Outbound) == 1
        });
        assert_eq!(
            relay.cache_bytes(ClientSlot::Secondary, CacheDirection::Outbound).unwrap(),
            framing::encode_record(b"ABCDEFGH")
        );
    }

    #[test]
    fn test_attach_replays_outbound_then_relays() {
        let tmp = tempfile::TempDir::new().unwrap();
        let relay = relay_for(test_config(tmp.path()));
        relay.start().unwrap();

        let mut client = UnixStream::connect(tmp.path().join("rilproxy")).unwrap();
        turn_until(&relay, || relay.client_connected(ClientSlot::Secondary));
        client.write_all(&framing::encode_record(b"queued")).unwrap();
        turn_until(&relay, || {
            relay.cache_count(ClientSlot::Secondary, CacheDirection::Outbound) == 1
        });

        let (ours, mut theirs) = UnixStream::pair().unwrap();
        assert!(relay.attach_upstream(ours).unwrap());
        let mut buf = vec![0u8; 10];
        theirs.read_exact(&mut buf).unwrap();
        assert_eq!(buf, framing::encode_record(b"queued"));

        theirs.write_all(&framing::encode_record(b"reply")).unwrap();
        let mut got = vec![0u8; 9];
        turn_until(&relay, || relay.counters(Side::Upstream).packets_in == 1);
        client.read_exact(&mut got).unwrap();
        assert_eq!(got, framing::encode_record(b"reply"));
    }

    #[test]
    fn test_outbound_cache_outlives_its_client_until_upstream_drops() {
        let tmp = tempfile::TempDir::new().unwrap();
        let relay = relay_for(test_config(tmp.path()));
        relay.start().unwrap();

        let mut client = UnixStream::connect(tmp.path().join("rilproxy")).unwrap();
        turn_until(&relay, || relay.client_connected(ClientSlot::Secondary));
        client.write_all(&framing::encode_record(b"ABCDEFGH")).unwrap();
        turn_until(&relay, || {
            relay.cache_count(ClientSlot::Secondary, CacheDirection::Outbound) == 1
        });
        drop(client);
        turn_until(&relay, || !relay.client_connected(ClientSlot::Secondary));
        assert_eq!(
            relay.cache_count(ClientSlot::Secondary, CacheDirection::Outbound),
            1
        );

        let (ours, mut theirs) = UnixStream::pair().unwrap();
        assert!(relay.attach_upstream(ours).unwrap());
        let mut buf = [0u8; 12];
        theirs.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[..], &framing::encode_record(b"ABCDEFGH")[..]);

        // Upstream is the consumer; its loss frees the cache.
        drop(theirs);
        turn_until(&relay, || !relay.upstream_connected());
        assert_eq!(
            relay.cache_bytes(ClientSlot::Secondary, CacheDirection::Outbound),
            None
        );
    }

    #[test]
    fn test_second_attach_is_refused() {
        let tmp = tempfile::TempDir::new().unwrap();
        let relay = relay_for(test_config(tmp.path()));
        relay.start().unwrap();
        let (a, _a_peer) = UnixStream::pair().unwrap();
        let (b, _b_peer) = UnixStream::pair().unwrap();
        assert!(relay.attach_upstream(a).unwrap());
        assert!(!relay.attach_upstream(b).unwrap());
    }

    #[test]
    fn test_disconnect_client_twice_is_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let relay = relay_for(test_config(tmp.path()));
        relay.start().unwrap();

        let _client = UnixStream::connect(tmp.path().join("rilproxy")).unwrap();
        turn_until(&relay, || relay.client_connected(ClientSlot::Secondary));

        relay.disconnect_client(ClientSlot::Secondary);
        let once = relay.counters(Side::Client(ClientSlot::Secondary));
        let watches = relay.reactor.watch_count();
        relay.disconnect_client(ClientSlot::Secondary);

        assert_eq!(relay.counters(Side::Client(ClientSlot::Secondary)), once);
        assert_eq!(relay.reactor.watch_count(), watches);
        assert!(!relay.client_connected(ClientSlot::Secondary));
        assert!(once.is_zero());
        assert_eq!(once.disconnects, 1);
        // Listen watch re-armed, read watch gone.
        assert_eq!(watches, 1);
    }

    #[test]
    fn test_accept_filter_refuses_peer() {
        let tmp = tempfile::TempDir::new().unwrap();
        let relay = relay_for(test_config(tmp.path()));
        relay.set_accept_filter(|_, _| false);
        relay.start().unwrap();

        let mut client = UnixStream::connect(tmp.path().join("rilproxy")).unwrap();
        relay.reactor.turn().unwrap();
        assert!(!relay.client_connected(ClientSlot::Secondary));

        client.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let mut byte = [0u8; 1];
        assert_eq!(client.read(&mut byte).unwrap(), 0);
        // Listener armed again for the next peer.
        assert_eq!(relay.reactor.watch_count(), 1);
    }
}
