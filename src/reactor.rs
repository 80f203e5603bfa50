//! Single-threaded readiness reactor over `libc::poll`.
//!
//! ```text
//! Unregistered ──add()──► Armed ──fd ready──► Pending ──dispatch──► Armed (persistent)
//!                                                                └─► Unregistered (one-shot)
//! ```
//!
//! One thread calls [`Reactor::run`]. Each pass copies the armed set, blocks
//! in `poll()` with no timeout, moves every ready watch into a FIFO pending
//! queue (dropping one-shot watches from the armed set as they move), then
//! invokes each pending callback once, in scan order.
//!
//! The armed set and pending queue share one mutex. Callbacks run with the
//! mutex released, so they may add or remove watches themselves. Other
//! threads that change the watch set write a byte to the wake pipe so a
//! blocked `poll()` returns and picks up the new set.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{RelayError, Result};

/// Default upper bound on registered watches.
pub const DEFAULT_MAX_WATCHES: usize = 64;

/// Readiness callback. Receives the descriptor that became ready.
///
/// A fatal error (see [`RelayError::is_fatal`]) stops the reactor; any
/// other error is logged and dispatch continues.
pub type Callback = Arc<dyn Fn(RawFd) -> Result<()> + Send + Sync>;

struct Watch {
    id: u64,
    persistent: bool,
    callback: Callback,
}

struct Pending {
    fd: RawFd,
    callback: Callback,
}

#[derive(Default)]
struct State {
    watches: HashMap<RawFd, Watch>,
    pending: VecDeque<Pending>,
    next_id: u64,
}

/// Readiness dispatcher shared between the reactor thread and its clients.
pub struct Reactor {
    state: Mutex<State>,
    max_watches: usize,
    wake_read: OwnedFd,
    wake_write: OwnedFd,
    shutdown: AtomicBool,
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("watches", &self.watch_count())
            .field("max_watches", &self.max_watches)
            .finish_non_exhaustive()
    }
}

impl Reactor {
    /// Create a reactor accepting at most `max_watches` registrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the wake pipe cannot be created.
    pub fn new(max_watches: usize) -> Result<Arc<Self>> {
        let (wake_read, wake_write) = make_wake_pipe()?;
        Ok(Arc::new(Self {
            state: Mutex::new(State::default()),
            max_watches,
            wake_read,
            wake_write,
            shutdown: AtomicBool::new(false),
        }))
    }

    /// Register `callback` for readability on `fd`.
    ///
    /// A `persistent` watch stays armed after firing; otherwise it is
    /// removed the moment it is found ready.
    ///
    /// # Errors
    ///
    /// - [`RelayError::WatchExists`] if `fd` is already watched.
    /// - [`RelayError::WatchLimit`] if the table is full.
    pub fn add(&self, fd: RawFd, persistent: bool, callback: Callback) -> Result<()> {
        {
            let mut state = self.lock();
            if state.watches.contains_key(&fd) {
                return Err(RelayError::WatchExists(fd));
            }
            if state.watches.len() >= self.max_watches {
                return Err(RelayError::WatchLimit(self.max_watches));
            }
            state.next_id += 1;
            let id = state.next_id;
            state.watches.insert(fd, Watch { id, persistent, callback });
        }
        log::trace!("[reactor] watch added fd={fd} persistent={persistent}");
        self.wake();
        Ok(())
    }

    /// Remove the watch on `fd`, including any not-yet-dispatched firing.
    ///
    /// Returns `true` if a watch was registered.
    pub fn remove(&self, fd: RawFd) -> bool {
        let removed = {
            let mut state = self.lock();
            state.pending.retain(|p| p.fd != fd);
            state.watches.remove(&fd).is_some()
        };
        if removed {
            log::trace!("[reactor] watch removed fd={fd}");
            self.wake();
        }
        removed
    }

    /// Whether `fd` currently has an armed watch.
    #[must_use]
    pub fn is_watched(&self, fd: RawFd) -> bool {
        self.lock().watches.contains_key(&fd)
    }

    /// Number of armed watches.
    #[must_use]
    pub fn watch_count(&self) -> usize {
        self.lock().watches.len()
    }

    /// Force a blocked `poll()` to return.
    pub fn wake(&self) {
        let byte = [1u8];
        // SAFETY: writing one byte from a valid stack buffer to an fd we own.
        // A full pipe (EAGAIN) already guarantees a pending wakeup.
        unsafe {
            libc::write(
                self.wake_write.as_raw_fd(),
                byte.as_ptr().cast::<libc::c_void>(),
                1,
            );
        }
    }

    /// Write end of the wake pipe, for signal handlers that must wake the loop.
    #[must_use]
    pub fn wake_fd(&self) -> RawFd {
        self.wake_write.as_raw_fd()
    }

    /// Ask [`Reactor::run`] to return after the current pass.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake();
    }

    /// Whether shutdown was requested.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Run dispatch passes until shutdown or a fatal error.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Poll`] if `poll()` fails with anything but
    /// `EINTR`, or the first fatal error returned by a callback. The
    /// reactor cannot be restarted in place after either.
    pub fn run(&self) -> Result<()> {
        log::info!("[reactor] running");
        while !self.is_shutdown() {
            self.turn()?;
        }
        log::info!("[reactor] shut down");
        Ok(())
    }

    /// Perform one poll + dispatch pass.
    pub fn turn(&self) -> Result<()> {
        let mut pollfds = vec![libc::pollfd {
            fd: self.wake_read.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];
        let mut armed: Vec<u64> = vec![0];
        {
            let state = self.lock();
            for (&fd, watch) in &state.watches {
                pollfds.push(libc::pollfd { fd, events: libc::POLLIN, revents: 0 });
                armed.push(watch.id);
            }
        }

        // SAFETY: `pollfds` is a live, correctly sized array of pollfd structs.
        let ready = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, -1) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            log::error!("[reactor] poll failed: {err}");
            return Err(RelayError::Poll(err));
        }

        if pollfds[0].revents & libc::POLLIN != 0 {
            self.drain_wake_pipe();
        }

        {
            let mut state = self.lock();
            for (pfd, &id) in pollfds.iter().zip(&armed).skip(1) {
                if pfd.revents == 0 {
                    continue;
                }
                let Some(watch) = state.watches.get(&pfd.fd) else {
                    continue;
                };
                // Descriptor number reused by a newer registration since the snapshot.
                if watch.id != id {
                    continue;
                }
                let callback = Arc::clone(&watch.callback);
                if !watch.persistent {
                    state.watches.remove(&pfd.fd);
                }
                state.pending.push_back(Pending { fd: pfd.fd, callback });
            }
        }

        self.dispatch()
    }

    fn dispatch(&self) -> Result<()> {
        loop {
            let next = self.lock().pending.pop_front();
            let Some(pending) = next else {
                return Ok(());
            };
            if let Err(e) = (pending.callback)(pending.fd) {
                if e.is_fatal() {
                    log::error!("[reactor] fatal error on fd={}: {e}", pending.fd);
                    self.lock().pending.clear();
                    return Err(e);
                }
                log::warn!("[reactor] callback for fd={} failed: {e}", pending.fd);
            }
        }
    }

    fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 64];
        loop {
            // SAFETY: reading into a valid stack buffer from an fd we own.
            let n = unsafe {
                libc::read(
                    self.wake_read.as_raw_fd(),
                    buf.as_mut_ptr().cast::<libc::c_void>(),
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn make_wake_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: `pipe` writes exactly two valid FDs into `fds` on success.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(RelayError::Io(io::Error::last_os_error()));
    }
    // SAFETY: both descriptors were just returned by pipe() and are owned here.
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    for fd in [read.as_raw_fd(), write.as_raw_fd()] {
        set_flags(fd)?;
    }
    Ok((read, write))
}

/// Mark `fd` non-blocking and close-on-exec.
fn set_flags(fd: RawFd) -> Result<()> {
    // SAFETY: fcntl on a valid descriptor with integer arguments.
    unsafe {
        let fl = libc::fcntl(fd, libc::F_GETFL);
        if fl < 0 || libc::fcntl(fd, libc::F_SETFL, fl | libc::O_NONBLOCK) < 0 {
            return Err(RelayError::Io(io::Error::last_os_error()));
        }
        let fd_flags = libc::fcntl(fd, libc::F_GETFD);
        if fd_flags < 0 || libc::fcntl(fd, libc::F_SETFD, fd_flags | libc::FD_CLOEXEC) < 0 {
            return Err(RelayError::Io(io::Error::last_os_error()));
        }
    }
    Ok(())
}
