// Copyright (C) 2023 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Call delivery from a backend to the consumer of a vDPA device.

use std::sync::{Arc, Weak};

use dbs_vhost::{EventSignal, WaitToken, SIGNAL_IN};
use log::{debug, warn};

use crate::{DeferredExecutor, DeferredWork, VqShared};

/// Call sink of a queue, armed on the executor of its device.
///
/// The wake function put on the call signal only queues the deferred work. The deferred work
/// drains the signal counter and runs the consumer callback of the queue.
pub struct CallEndpoint {
    signal: Arc<EventSignal>,
    token: WaitToken,
    work: Arc<DeferredWork>,
}

impl CallEndpoint {
    /// Starts listening on `signal` for calls of the queue sharing `shared`.
    ///
    /// If the signal is already raised, a callback is queued right away.
    pub fn arm(exec: &DeferredExecutor, signal: Arc<EventSignal>, shared: Arc<VqShared>) -> Self {
        let weak_signal: Weak<EventSignal> = Arc::downgrade(&signal);
        let work = exec.register(Box::new(move || {
            if let Some(signal) = weak_signal.upgrade() {
                if let Err(e) = signal.consume() {
                    warn!("vdpa: failed to consume call, {}", e);
                }
            }
            shared.notify();
        }));

        let weak_work: Weak<DeferredWork> = Arc::downgrade(&work);
        let token = signal.add_waiter(Box::new(move |flags| {
            if flags & SIGNAL_IN != 0 {
                if let Some(work) = weak_work.upgrade() {
                    work.queue();
                }
            }
        }));

        if signal.poll() {
            debug!("vdpa: call already pending when armed");
            work.queue();
        }

        CallEndpoint {
            signal,
            token,
            work,
        }
    }

    /// The call signal.
    pub fn signal(&self) -> &Arc<EventSignal> {
        &self.signal
    }

    /// Stops listening for new calls. Never blocks.
    ///
    /// A callback already queued may still run until `disarm()` is called.
    pub fn stop(&self) {
        self.signal.remove_waiter(self.token);
    }

    /// Stops listening and waits for an outstanding callback to finish.
    ///
    /// No callback for this endpoint runs once this returns. Must not be called with a lock
    /// held that the callback may take.
    pub fn disarm(self) {
        self.stop();
        self.work.sync();
        self.work.detach();
    }
}
