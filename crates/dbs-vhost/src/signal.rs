// Copyright (C) 2023 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Kick and call notification objects.
//!
//! An `EventSignal` pairs a non-blocking eventfd with a wait list. Raising the signal bumps the
//! eventfd counter and then runs every registered wake function with `SIGNAL_IN`.
//!
//! Wake functions run on the thread raising the signal, which may be holding arbitrary locks of
//! its own. They must not block, sleep or take any lock that is also taken by code waiting on
//! the signal owner. The usual wake function only hands the event off to a deferred worker.

use std::fmt;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::trace;
use vmm_sys_util::eventfd::{EventFd, EFD_NONBLOCK};

use crate::Result;

/// Event flag passed to wake functions when the counter became readable.
pub const SIGNAL_IN: u32 = libc::POLLIN as u32;

/// Function invoked when an `EventSignal` is raised.
pub type WakeFn = Box<dyn Fn(u32) + Send + Sync>;

/// Token identifying an entry on the wait list of an `EventSignal`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WaitToken(u64);

struct WaitEntry {
    token: WaitToken,
    func: WakeFn,
}

/// Eventfd backed signal with a wait list.
pub struct EventSignal {
    evt: EventFd,
    waiters: Mutex<Vec<WaitEntry>>,
    next_token: AtomicU64,
}

impl EventSignal {
    /// Creates a new signal with a zero counter.
    pub fn new() -> Result<Arc<Self>> {
        let evt = EventFd::new(EFD_NONBLOCK)?;

        Ok(Arc::new(EventSignal {
            evt,
            waiters: Mutex::new(Vec::new()),
            next_token: AtomicU64::new(0),
        }))
    }

    fn waiters(&self) -> MutexGuard<Vec<WaitEntry>> {
        // Safe to unwrap() because we don't expect poisoned lock here.
        self.waiters.lock().unwrap()
    }

    /// Raises the signal.
    ///
    /// Never blocks. A saturated counter already reads as pending, so the extra count is
    /// coalesced into it.
    pub fn signal(&self, count: u64) -> Result<()> {
        match self.evt.write(count) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                trace!("eventfd {} saturated, coalescing signal", self.evt.as_raw_fd());
            }
            Err(e) => return Err(e.into()),
        }
        self.wake_up(SIGNAL_IN);

        Ok(())
    }

    /// Returns whether the counter is non-zero, without consuming it.
    pub fn poll(&self) -> bool {
        let mut pollfd = libc::pollfd {
            fd: self.evt.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // Safe because we pass exactly one valid pollfd and a zero timeout.
        let ret = unsafe { libc::poll(&mut pollfd, 1, 0) };

        ret > 0 && (pollfd.revents & libc::POLLIN) != 0
    }

    /// Reads and resets the counter, returning 0 if nothing was pending.
    pub fn consume(&self) -> Result<u64> {
        match self.evt.read() {
            Ok(v) => Ok(v),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Puts `func` on the wait list.
    pub fn add_waiter(&self, func: WakeFn) -> WaitToken {
        let token = WaitToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.waiters().push(WaitEntry { token, func });
        token
    }

    /// Removes an entry from the wait list.
    ///
    /// Once this returns, the removed wake function is not running and will never run again.
    pub fn remove_waiter(&self, token: WaitToken) -> bool {
        let mut waiters = self.waiters();
        let len = waiters.len();
        waiters.retain(|w| w.token != token);
        waiters.len() != len
    }

    /// Number of entries on the wait list.
    pub fn waiter_count(&self) -> usize {
        self.waiters().len()
    }

    /// Duplicates the underlying eventfd, e.g. to hand it to another process.
    pub fn try_clone_eventfd(&self) -> Result<EventFd> {
        Ok(self.evt.try_clone()?)
    }

    fn wake_up(&self, flags: u32) {
        for w in self.waiters().iter() {
            (w.func)(flags);
        }
    }
}

impl fmt::Debug for EventSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSignal")
            .field("fd", &self.evt.as_raw_fd())
            .field("waiters", &self.waiter_count())
            .finish()
    }
}

impl AsRawFd for EventSignal {
    fn as_raw_fd(&self) -> RawFd {
        self.evt.as_raw_fd()
    }
}
