// Copyright (C) 2023 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Deferred execution of notification callbacks.
//!
//! Wake functions of an `EventSignal` run on whatever thread raised the signal and must not
//! block or take locks. They hand the event off by queueing a `DeferredWork`, which only flips
//! an atomic flag and bumps the executor's eventfd. The executor thread then runs the work
//! function in normal context.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use log::{debug, error, info};
use vmm_sys_util::eventfd::EventFd;

use crate::{Error, Result};

struct ExecShared {
    name: String,
    wake: EventFd,
    stop: AtomicBool,
    works: Mutex<Vec<Arc<DeferredWork>>>,
    thread_id: Mutex<Option<ThreadId>>,
}

impl ExecShared {
    fn works(&self) -> MutexGuard<Vec<Arc<DeferredWork>>> {
        // Safe to unwrap() because we don't expect poisoned lock here.
        self.works.lock().unwrap()
    }

    fn on_executor_thread(&self) -> bool {
        // Safe to unwrap() because we don't expect poisoned lock here.
        *self.thread_id.lock().unwrap() == Some(thread::current().id())
    }

    fn run(&self) {
        loop {
            if let Err(e) = self.wake.read() {
                error!("{}: failed to read wake event, {}", self.name, e);
                break;
            }
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            let works: Vec<Arc<DeferredWork>> = self.works().clone();
            for w in works.iter() {
                w.run();
            }
        }

        // Work queued after the stop request is dropped.
        let works: Vec<Arc<DeferredWork>> = self.works().drain(..).collect();
        for w in works.iter() {
            w.cancel();
        }
        debug!("{}: executor exited", self.name);
    }
}

/// A function run on the executor thread each time it is queued.
///
/// Queueing is idempotent while the work is pending: however many times it is queued before
/// the executor gets to it, the function runs once.
pub struct DeferredWork {
    pending: AtomicBool,
    busy: Mutex<bool>,
    idle: Condvar,
    func: Box<dyn Fn() + Send + Sync>,
    exec: Weak<ExecShared>,
}

impl DeferredWork {
    /// Queues the work. Lock free and never blocks, so it may be called from wake functions.
    ///
    /// Returns false if the work was already pending or the executor is gone.
    pub fn queue(&self) -> bool {
        let exec = match self.exec.upgrade() {
            Some(exec) => exec,
            None => return false,
        };
        if exec.stop.load(Ordering::Acquire) || self.pending.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Err(e) = exec.wake.write(1) {
            error!("{}: failed to wake executor, {}", exec.name, e);
            self.pending.store(false, Ordering::Release);
            return false;
        }

        true
    }

    /// Whether the work is queued and has not started running yet.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Removes the work from the executor it was registered on, if that executor still exists.
    /// Callers should `sync()` it first if they need it quiesced.
    pub fn detach(self: &Arc<Self>) {
        if let Some(exec) = self.exec.upgrade() {
            exec.works().retain(|w| !Arc::ptr_eq(w, self));
        }
    }

    /// Waits until the work is neither pending nor running.
    ///
    /// Returns immediately when called from the executor thread itself, since a work function
    /// cannot wait for its own completion.
    pub fn sync(&self) {
        let exec = match self.exec.upgrade() {
            Some(exec) => exec,
            None => return,
        };
        if exec.on_executor_thread() {
            return;
        }
        // Safe to unwrap() because we don't expect poisoned lock here.
        let mut busy = self.busy.lock().unwrap();
        while *busy || self.pending.load(Ordering::Acquire) {
            if exec.stop.load(Ordering::Acquire) && !*busy {
                self.pending.store(false, Ordering::Release);
                break;
            }
            // Safe to unwrap() because we don't expect poisoned lock here.
            busy = self.idle.wait(busy).unwrap();
        }
    }

    fn run(&self) {
        {
            // Safe to unwrap() because we don't expect poisoned lock here.
            let mut busy = self.busy.lock().unwrap();
            if !self.pending.swap(false, Ordering::AcqRel) {
                return;
            }
            *busy = true;
        }
        (self.func)();
        // Safe to unwrap() because we don't expect poisoned lock here.
        *self.busy.lock().unwrap() = false;
        self.idle.notify_all();
    }

    fn cancel(&self) {
        // Safe to unwrap() because we don't expect poisoned lock here.
        let _busy = self.busy.lock().unwrap();
        self.pending.store(false, Ordering::Release);
        self.idle.notify_all();
    }
}

/// Thread running queued `DeferredWork`.
pub struct DeferredExecutor {
    shared: Arc<ExecShared>,
    handle: Option<JoinHandle<()>>,
}

impl DeferredExecutor {
    /// Spawns the executor thread.
    pub fn new(name: &str) -> Result<Self> {
        let wake = EventFd::new(0).map_err(|e| {
            error!("{}: failed to create wake event, {}", name, e);
            Error::InvalidState
        })?;
        let shared = Arc::new(ExecShared {
            name: name.to_string(),
            wake,
            stop: AtomicBool::new(false),
            works: Mutex::new(Vec::new()),
            thread_id: Mutex::new(None),
        });

        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(format!("{}_deferred", name))
            .spawn(move || thread_shared.run())
            .map_err(|e| {
                error!("{}: failed to spawn executor thread, {}", name, e);
                Error::InvalidState
            })?;
        // Safe to unwrap() because we don't expect poisoned lock here.
        *shared.thread_id.lock().unwrap() = Some(handle.thread().id());
        info!("{}: deferred executor started", name);

        Ok(DeferredExecutor {
            shared,
            handle: Some(handle),
        })
    }

    /// Creates a work item executed on this executor.
    pub fn register(&self, func: Box<dyn Fn() + Send + Sync>) -> Arc<DeferredWork> {
        let work = Arc::new(DeferredWork {
            pending: AtomicBool::new(false),
            busy: Mutex::new(false),
            idle: Condvar::new(),
            func,
            exec: Arc::downgrade(&self.shared),
        });
        self.shared.works().push(work.clone());
        work
    }

    /// Forgets a work item. Callers should `sync()` it first if they need it quiesced.
    pub fn unregister(&self, work: &Arc<DeferredWork>) {
        self.shared.works().retain(|w| !Arc::ptr_eq(w, work));
    }

    /// Number of registered work items.
    pub fn work_count(&self) -> usize {
        self.shared.works().len()
    }

    /// Stops the executor thread and waits for it to exit.
    ///
    /// A work function already running completes, queued work which has not started is dropped.
    pub fn shutdown(&mut self) {
        let handle = match self.handle.take() {
            Some(h) => h,
            None => return,
        };
        self.shared.stop.store(true, Ordering::Release);
        if let Err(e) = self.shared.wake.write(1) {
            error!("{}: failed to stop executor, {}", self.shared.name, e);
        }
        if self.shared.on_executor_thread() {
            // Cannot join ourselves, the thread exits on its own once the work returns.
            return;
        }
        if let Err(e) = handle.join() {
            error!("{}: failed to reap executor thread: {:?}", self.shared.name, e);
        } else {
            debug!("{}: executor thread reaped", self.shared.name);
        }
    }
}

impl Drop for DeferredExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
