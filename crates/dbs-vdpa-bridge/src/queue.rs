// Copyright (C) 2023 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Arc, Mutex, MutexGuard};

use dbs_vhost::EventSignal;
use log::warn;

use crate::{CallEndpoint, Error, Result, VdpaCallback, VdpaVqState};

/// Part of a virtqueue reachable without the device lock.
///
/// Both locks are leaves: nothing else is ever acquired while holding them, so kicking a queue
/// or delivering a callback is safe from any context that does not itself hold them.
#[derive(Default)]
pub struct VqShared {
    kick: Mutex<Option<Arc<EventSignal>>>,
    cb: Mutex<Option<VdpaCallback>>,
}

impl VqShared {
    fn kick_slot(&self) -> MutexGuard<Option<Arc<EventSignal>>> {
        // Safe to unwrap() because we don't expect poisoned lock here.
        self.kick.lock().unwrap()
    }

    fn cb_slot(&self) -> MutexGuard<Option<VdpaCallback>> {
        // Safe to unwrap() because we don't expect poisoned lock here.
        self.cb.lock().unwrap()
    }

    /// Kick source of the queue.
    pub fn kick_signal(&self) -> Option<Arc<EventSignal>> {
        self.kick_slot().clone()
    }

    pub(crate) fn set_kick_signal(&self, signal: Option<Arc<EventSignal>>) {
        *self.kick_slot() = signal;
    }

    /// Raises the kick source. Returns false if the queue has none.
    pub fn kick(&self) -> bool {
        let kick = self.kick_signal();
        match kick {
            Some(signal) => {
                if let Err(e) = signal.signal(1) {
                    warn!("vdpa: failed to kick queue, {}", e);
                }
                true
            }
            None => false,
        }
    }

    pub(crate) fn set_callback(&self, cb: Option<VdpaCallback>) {
        *self.cb_slot() = cb;
    }

    /// Whether the consumer installed a callback.
    pub fn has_callback(&self) -> bool {
        self.cb_slot().is_some()
    }

    /// Runs the consumer callback, if any. The callback runs without any lock held.
    pub(crate) fn notify(&self) {
        let cb = self.cb_slot().clone();
        if let Some(cb) = cb {
            cb();
        }
    }
}

/// Front-end state of one virtqueue, guarded by the device lock.
pub struct VdpaVirtqueue {
    /// Queue index.
    pub index: u16,
    /// Descriptor table address.
    pub desc_addr: u64,
    /// Driver area, the available ring.
    pub driver_addr: u64,
    /// Device area, the used ring.
    pub device_addr: u64,
    /// Queue size.
    pub num: u32,
    /// Queue is ready.
    pub ready: bool,
    /// Saved available index.
    pub state: VdpaVqState,
    /// Armed call endpoint.
    pub(crate) call: Option<CallEndpoint>,
    /// Lock free part of the queue.
    pub shared: Arc<VqShared>,
}

impl VdpaVirtqueue {
    /// Creates a queue with nothing configured.
    pub fn new(index: u16) -> Self {
        VdpaVirtqueue {
            index,
            desc_addr: 0,
            driver_addr: 0,
            device_addr: 0,
            num: 0,
            ready: false,
            state: VdpaVqState::default(),
            call: None,
            shared: Arc::new(VqShared::default()),
        }
    }

    /// Whether both notification endpoints are set.
    pub fn is_configured(&self) -> bool {
        self.call.is_some() && self.shared.kick_signal().is_some()
    }

    /// Fails with `InvalidConfig` if the queue is ready.
    pub fn check_not_ready(&self) -> Result<()> {
        if self.ready {
            return Err(Error::InvalidConfig);
        }
        Ok(())
    }

    /// Checks the queue layout before it is made ready.
    pub fn validate(&self, num_max: u16) -> Result<()> {
        if self.desc_addr == 0 || self.driver_addr == 0 || self.device_addr == 0 {
            return Err(Error::InvalidConfig);
        }
        if self.num == 0 || self.num > num_max as u32 || !self.num.is_power_of_two() {
            return Err(Error::InvalidConfig);
        }
        Ok(())
    }

    /// Returns the layout to its initial state. Notification endpoints and the consumer
    /// callback are kept.
    pub fn reset(&mut self) {
        self.desc_addr = 0;
        self.driver_addr = 0;
        self.device_addr = 0;
        self.num = 0;
        self.ready = false;
        self.state = VdpaVqState::default();
    }
}
