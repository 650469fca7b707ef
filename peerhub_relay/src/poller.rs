// Level-triggered readiness wait over a set of sockets.
//
// The relay's event loop asks one question per iteration: "which of these
// sockets have something to read (or have hung up)?". On Unix that is a
// single `poll(2)` call with `POLLIN` interest on the listener and every
// client socket, bounded by the caller's timeout.
//
// Elsewhere there is no portable readiness call in std, so the fallback
// sleeps briefly and reports every socket as ready. All sockets are
// non-blocking, so a spurious report only costs one `WouldBlock` read.

use std::io;
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

#[cfg(unix)]
use std::os::fd::AsRawFd;

/// OS handle the poller waits on.
#[cfg(unix)]
pub type RawHandle = std::os::fd::RawFd;
/// OS handle the poller waits on.
#[cfg(not(unix))]
pub type RawHandle = ();

/// Sockets the relay polls.
pub trait Pollable {
    fn raw_handle(&self) -> RawHandle;
}

impl Pollable for TcpListener {
    #[cfg(unix)]
    fn raw_handle(&self) -> RawHandle {
        self.as_raw_fd()
    }

    #[cfg(not(unix))]
    fn raw_handle(&self) -> RawHandle {}
}

impl Pollable for TcpStream {
    #[cfg(unix)]
    fn raw_handle(&self) -> RawHandle {
        self.as_raw_fd()
    }

    #[cfg(not(unix))]
    fn raw_handle(&self) -> RawHandle {}
}

/// Something that can be polled: the listener or a client socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Source<T> {
    Listener,
    Client(T),
}

/// Reusable poll state. Keeps its descriptor array between calls so the
/// steady state does not allocate.
#[derive(Default)]
pub struct Poller {
    #[cfg(unix)]
    fds: Vec<libc::pollfd>,
}

impl Poller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait up to `timeout` and return the sources that are readable,
    /// closed, or in error. An interrupted wait returns no sources.
    #[cfg(unix)]
    pub fn wait<T: Copy>(
        &mut self,
        sources: &[(Source<T>, RawHandle)],
        timeout: Duration,
    ) -> io::Result<Vec<Source<T>>> {
        self.fds.clear();
        self.fds.extend(sources.iter().map(|(_, fd)| libc::pollfd {
            fd: *fd,
            events: libc::POLLIN,
            revents: 0,
        }));

        let timeout_ms = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);
        // SAFETY: `fds` is a live, correctly sized array of `pollfd` for the
        // whole call. A stale descriptor is reported as POLLNVAL, not UB.
        let ready = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }

        let interest = libc::POLLIN | libc::POLLHUP | libc::POLLERR | libc::POLLNVAL;
        Ok(self
            .fds
            .iter()
            .zip(sources)
            .filter(|(fd, _)| fd.revents & interest != 0)
            .map(|(_, (source, _))| *source)
            .collect())
    }

    /// Portable fallback: short sleep, then everything counts as ready.
    #[cfg(not(unix))]
    pub fn wait<T: Copy>(
        &mut self,
        sources: &[(Source<T>, RawHandle)],
        timeout: Duration,
    ) -> io::Result<Vec<Source<T>>> {
        std::thread::sleep(timeout.min(Duration::from_millis(5)));
        Ok(sources.iter().map(|(source, _)| *source).collect())
    }
}
