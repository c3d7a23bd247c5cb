// Copyright (C) 2023 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Backend instance shared by every vhost backend type.
//!
//! A `VhostDev` is created each time a published node is opened. Its configuration lives in
//! `VhostDevState` behind the device lock and each virtqueue has a lock of its own. The device
//! lock is always taken first. Queue locks are only ever taken through `VhostDev::lock_vqs()`,
//! which locks all of them in ascending index order.

use std::any::Any;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};

use crate::{
    Error, EventSignal, Iotlb, OwnerId, Result, VhostOps, VHOST_ACCESS_RW,
    VIRTIO_F_ACCESS_PLATFORM,
};

/// Alignment of the descriptor table.
pub const VRING_DESC_ALIGN: u64 = 16;
/// Alignment of the available ring.
pub const VRING_AVAIL_ALIGN: u64 = 2;
/// Alignment of the used ring.
pub const VRING_USED_ALIGN: u64 = 4;

/// Guest memory region described by `VhostRequest::SetMemTable`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VhostMemoryRegion {
    /// Guest physical address of the region.
    pub guest_phys_addr: u64,
    /// Size of the region in bytes.
    pub memory_size: u64,
    /// Address of the region in the backend's address space.
    pub userspace_addr: u64,
}

impl VhostMemoryRegion {
    fn last(&self) -> Option<u64> {
        self.guest_phys_addr.checked_add(self.memory_size.checked_sub(1)?)
    }
}

/// Per-queue state of a backend instance.
pub struct VhostVirtqueue {
    /// Queue size.
    pub num: u32,
    /// Largest queue size accepted for the queue.
    pub num_max: u32,
    /// Address of the descriptor table.
    pub desc: u64,
    /// Address of the available ring.
    pub avail: u64,
    /// Address of the used ring.
    pub used: u64,
    /// Next available ring index the backend will process.
    pub last_avail_idx: u16,
    /// Ring is in big endian format.
    pub big_endian: bool,
    /// Kick source, raised by the driver when buffers are available.
    pub kick: Option<Arc<EventSignal>>,
    /// Call sink, raised by the backend when buffers are used.
    pub call: Option<Arc<EventSignal>>,
    /// Active transfer binding installed by the backend type.
    pub private_data: Option<Box<dyn Any + Send>>,
    /// Queue processing has been started.
    pub started: bool,
}

impl VhostVirtqueue {
    fn new(num_max: u32) -> Self {
        VhostVirtqueue {
            num: 0,
            num_max,
            desc: 0,
            avail: 0,
            used: 0,
            last_avail_idx: 0,
            big_endian: false,
            kick: None,
            call: None,
            private_data: None,
            started: false,
        }
    }

    /// Whether the queue is started or has a transfer binding.
    pub fn is_busy(&self) -> bool {
        self.started || self.private_data.is_some()
    }

    fn reset(&mut self, num_max: u32) {
        *self = VhostVirtqueue::new(num_max);
    }
}

/// Configuration of a backend instance, guarded by the device lock.
pub struct VhostDevState {
    /// Identity of the party which claimed ownership.
    pub owner: Option<OwnerId>,
    /// Features acknowledged through `VhostRequest::SetFeatures`.
    pub acked_features: u64,
    /// Translation table, present when `VIRTIO_F_ACCESS_PLATFORM` is acknowledged.
    pub iotlb: Option<Iotlb>,
    /// An in-process front-end holds the exclusive claim on the instance.
    pub kernel_attached: bool,
    /// Guest memory layout.
    pub mem_table: Vec<VhostMemoryRegion>,
    /// Base address of the dirty log.
    pub log_base: u64,
    /// Signal raised after dirty log updates.
    pub log: Option<Arc<EventSignal>>,
    /// State owned by the backend type.
    pub private: Box<dyn Any + Send>,
}

impl VhostDevState {
    fn check_owner(&self, caller: OwnerId) -> Result<()> {
        match self.owner {
            Some(owner) if owner == caller => Ok(()),
            _ => Err(Error::PermissionDenied),
        }
    }
}

/// Control requests accepted by every backend instance.
#[derive(Debug)]
pub enum VhostRequest {
    /// Make the caller the owner of the instance.
    SetOwner,
    /// Drop ownership and return the instance to its initial state.
    ResetOwner,
    /// Query the features offered by the backend type.
    GetFeatures,
    /// Acknowledge features.
    SetFeatures(u64),
    /// Set the size of a queue.
    SetVringNum {
        /// Queue index.
        index: u32,
        /// Queue size.
        num: u32,
    },
    /// Lower the largest queue size accepted for a queue.
    SetVringNumMax {
        /// Queue index.
        index: u32,
        /// Largest queue size.
        num: u32,
    },
    /// Set the ring addresses of a queue.
    SetVringAddr {
        /// Queue index.
        index: u32,
        /// Descriptor table address.
        desc: u64,
        /// Available ring address.
        avail: u64,
        /// Used ring address.
        used: u64,
    },
    /// Set the next available index of a queue.
    SetVringBase {
        /// Queue index.
        index: u32,
        /// Available ring index.
        base: u16,
    },
    /// Query the next available index of a queue.
    GetVringBase {
        /// Queue index.
        index: u32,
    },
    /// Set or clear the kick source of a queue.
    SetVringKick {
        /// Queue index.
        index: u32,
        /// Kick source.
        signal: Option<Arc<EventSignal>>,
    },
    /// Set or clear the call sink of a queue.
    SetVringCall {
        /// Queue index.
        index: u32,
        /// Call sink.
        signal: Option<Arc<EventSignal>>,
    },
    /// Select the ring endianness of a queue.
    SetVringEndian {
        /// Queue index.
        index: u32,
        /// Ring is big endian.
        big_endian: bool,
    },
    /// Describe the guest memory layout.
    SetMemTable(Vec<VhostMemoryRegion>),
    /// Set the base address of the dirty log.
    SetLogBase(u64),
    /// Set or clear the dirty log signal.
    SetLogFd(Option<Arc<EventSignal>>),
    /// Insert a translation.
    IotlbUpdate {
        /// IO virtual address.
        iova: u64,
        /// Size of the range.
        size: u64,
        /// Target address.
        uaddr: u64,
        /// Access permission.
        perm: u8,
    },
    /// Remove translations.
    IotlbInvalidate {
        /// IO virtual address.
        iova: u64,
        /// Size of the range.
        size: u64,
    },
    /// Request specific to the backend type.
    Device {
        /// Request code.
        code: u32,
        /// Queue index, if the request targets a queue.
        index: u32,
        /// Request argument.
        value: u64,
    },
}

impl VhostRequest {
    /// Requests the privileged surface refuses to forward to the instance.
    pub fn is_queue_shaping(&self) -> bool {
        matches!(
            self,
            VhostRequest::SetVringNum { .. }
                | VhostRequest::SetVringAddr { .. }
                | VhostRequest::SetVringBase { .. }
                | VhostRequest::SetVringEndian { .. }
                | VhostRequest::SetMemTable(_)
                | VhostRequest::SetLogBase(_)
                | VhostRequest::SetLogFd(_)
        )
    }
}

/// Guard holding every queue lock of a `VhostDev`.
///
/// Locks are released in reverse acquisition order when the guard is dropped.
pub struct VqsGuard<'a> {
    guards: Vec<MutexGuard<'a, VhostVirtqueue>>,
}

impl<'a> VqsGuard<'a> {
    /// Number of queues.
    pub fn len(&self) -> usize {
        self.guards.len()
    }

    /// Whether the device has no queue.
    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    /// Gets a queue by index.
    pub fn get_mut(&mut self, index: u32) -> Result<&mut VhostVirtqueue> {
        self.guards
            .get_mut(index as usize)
            .map(|g| g.deref_mut())
            .ok_or(Error::InvalidIndex(index))
    }

    /// Iterates over the queues in index order.
    pub fn iter(&self) -> impl Iterator<Item = &VhostVirtqueue> {
        self.guards.iter().map(|g| g.deref())
    }
}

impl<'a> Drop for VqsGuard<'a> {
    fn drop(&mut self) {
        while let Some(g) = self.guards.pop() {
            drop(g);
        }
    }
}

/// A backend instance.
pub struct VhostDev {
    id: String,
    ops: Arc<dyn VhostOps>,
    state: Mutex<VhostDevState>,
    vqs: Vec<Mutex<VhostVirtqueue>>,
}

impl VhostDev {
    /// Creates an instance of the backend type described by `ops`.
    pub fn new(id: String, ops: Arc<dyn VhostOps>) -> Result<Self> {
        let num_queues = ops.num_queues();
        if num_queues == 0 {
            return Err(Error::InvalidConfig);
        }
        let private = ops.open()?;
        let num_max = ops.max_queue_size();
        let vqs = (0..num_queues)
            .map(|_| Mutex::new(VhostVirtqueue::new(num_max)))
            .collect();

        debug!("{}: created with {} queues", id, num_queues);

        Ok(VhostDev {
            id,
            ops,
            state: Mutex::new(VhostDevState {
                owner: None,
                acked_features: 0,
                iotlb: None,
                kernel_attached: false,
                mem_table: Vec::new(),
                log_base: 0,
                log: None,
                private,
            }),
            vqs,
        })
    }

    /// Identifier of the instance, used to prefix log messages.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Operations of the backend type.
    pub fn ops(&self) -> &Arc<dyn VhostOps> {
        &self.ops
    }

    /// Number of queues.
    pub fn num_queues(&self) -> usize {
        self.vqs.len()
    }

    /// Takes the device lock.
    pub fn state(&self) -> MutexGuard<VhostDevState> {
        // Safe to unwrap() because we don't expect poisoned lock here.
        self.state.lock().unwrap()
    }

    /// Takes every queue lock in ascending index order.
    ///
    /// Callers must hold the device lock.
    pub fn lock_vqs(&self) -> VqsGuard {
        let guards = self
            .vqs
            .iter()
            // Safe to unwrap() because we don't expect poisoned lock here.
            .map(|vq| vq.lock().unwrap())
            .collect();

        VqsGuard { guards }
    }

    /// Whether an in-process front-end holds the exclusive claim.
    pub fn is_kernel_attached(&self) -> bool {
        self.state().kernel_attached
    }

    /// Handles a control request, serialized under the device lock.
    pub fn ioctl(&self, caller: OwnerId, req: VhostRequest) -> Result<u64> {
        let mut state = self.state();
        self.handle_request(&mut state, caller, req)
    }

    pub(crate) fn handle_request(
        &self,
        state: &mut VhostDevState,
        caller: OwnerId,
        req: VhostRequest,
    ) -> Result<u64> {
        match req {
            VhostRequest::SetOwner => {
                if state.owner.is_some() {
                    return Err(Error::Busy);
                }
                state.owner = Some(caller);
                debug!("{}: owner set to {:?}", self.id, caller);
                return Ok(0);
            }
            VhostRequest::GetFeatures => return Ok(self.ops.features()),
            _ => state.check_owner(caller)?,
        }

        match req {
            VhostRequest::ResetOwner => self.reset_owner(state).map(|_| 0),
            VhostRequest::SetFeatures(features) => {
                self.set_features(state, features).map(|_| 0)
            }
            VhostRequest::SetMemTable(regions) => {
                Self::set_mem_table(state, regions).map(|_| 0)
            }
            VhostRequest::SetLogBase(base) => {
                state.log_base = base;
                Ok(0)
            }
            VhostRequest::SetLogFd(signal) => {
                state.log = signal;
                Ok(0)
            }
            VhostRequest::IotlbUpdate {
                iova,
                size,
                uaddr,
                perm,
            } => {
                let iotlb = state.iotlb.as_mut().ok_or(Error::InvalidState)?;
                iotlb.update(iova, size, uaddr, perm).map(|_| 0)
            }
            VhostRequest::IotlbInvalidate { iova, size } => {
                let iotlb = state.iotlb.as_mut().ok_or(Error::InvalidState)?;
                if size == 0 {
                    return Err(Error::InvalidConfig);
                }
                iotlb.del_range(iova, iova.checked_add(size - 1).unwrap_or(u64::MAX));
                Ok(0)
            }
            VhostRequest::Device { code, index, value } => {
                let mut vqs = self.lock_vqs();
                self.ops.ioctl(state, &mut vqs, code, index, value)
            }
            req => {
                let mut vqs = self.lock_vqs();
                self.vring_ioctl(&mut vqs, req)
            }
        }
    }

    fn vring_ioctl(&self, vqs: &mut VqsGuard, req: VhostRequest) -> Result<u64> {
        match req {
            VhostRequest::SetVringNum { index, num } => {
                let vq = Self::idle_vq(vqs, index)?;
                if num == 0 || num > vq.num_max || !num.is_power_of_two() {
                    return Err(Error::InvalidConfig);
                }
                vq.num = num;
            }
            VhostRequest::SetVringNumMax { index, num } => {
                let max = self.ops.max_queue_size();
                let vq = Self::idle_vq(vqs, index)?;
                if num == 0 || num > max || !num.is_power_of_two() || vq.num > num {
                    return Err(Error::InvalidConfig);
                }
                vq.num_max = num;
            }
            VhostRequest::SetVringAddr {
                index,
                desc,
                avail,
                used,
            } => {
                let vq = Self::idle_vq(vqs, index)?;
                if desc % VRING_DESC_ALIGN != 0
                    || avail % VRING_AVAIL_ALIGN != 0
                    || used % VRING_USED_ALIGN != 0
                {
                    return Err(Error::InvalidConfig);
                }
                vq.desc = desc;
                vq.avail = avail;
                vq.used = used;
            }
            VhostRequest::SetVringBase { index, base } => {
                Self::idle_vq(vqs, index)?.last_avail_idx = base;
            }
            VhostRequest::GetVringBase { index } => {
                return Ok(vqs.get_mut(index)?.last_avail_idx as u64);
            }
            VhostRequest::SetVringKick { index, signal } => {
                Self::idle_vq(vqs, index)?.kick = signal;
            }
            VhostRequest::SetVringCall { index, signal } => {
                Self::idle_vq(vqs, index)?.call = signal;
            }
            VhostRequest::SetVringEndian { index, big_endian } => {
                Self::idle_vq(vqs, index)?.big_endian = big_endian;
            }
            req => {
                warn!("{}: unexpected vring request {:?}", self.id, req);
                return Err(Error::Unsupported);
            }
        }

        Ok(0)
    }

    fn idle_vq<'b>(vqs: &'b mut VqsGuard, index: u32) -> Result<&'b mut VhostVirtqueue> {
        let vq = vqs.get_mut(index)?;
        if vq.is_busy() {
            return Err(Error::Busy);
        }
        Ok(vq)
    }

    fn set_features(&self, state: &mut VhostDevState, features: u64) -> Result<()> {
        if features & !self.ops.features() != 0 {
            return Err(Error::Unsupported);
        }
        if self.lock_vqs().iter().any(|vq| vq.started) {
            return Err(Error::Busy);
        }

        state.acked_features = features;
        if features & (1u64 << VIRTIO_F_ACCESS_PLATFORM) != 0 {
            if state.iotlb.is_none() {
                state.iotlb = Some(Iotlb::new());
            }
        } else {
            state.iotlb = None;
        }
        debug!("{}: acked features {:#x}", self.id, features);

        Ok(())
    }

    fn set_mem_table(state: &mut VhostDevState, mut regions: Vec<VhostMemoryRegion>) -> Result<()> {
        regions.sort_by_key(|r| r.guest_phys_addr);
        let mut prev_last: Option<u64> = None;
        for r in regions.iter() {
            let last = r.last().ok_or(Error::InvalidConfig)?;
            if let Some(p) = prev_last {
                if r.guest_phys_addr <= p {
                    return Err(Error::InvalidConfig);
                }
            }
            prev_last = Some(last);
        }
        state.mem_table = regions;

        Ok(())
    }

    fn reset_owner(&self, state: &mut VhostDevState) -> Result<()> {
        if state.kernel_attached {
            return Err(Error::Busy);
        }
        let mut vqs = self.lock_vqs();
        if vqs.iter().any(|vq| vq.is_busy()) {
            return Err(Error::Busy);
        }
        for i in 0..vqs.len() {
            vqs.get_mut(i as u32)?.reset(self.ops.max_queue_size());
        }
        drop(vqs);

        state.owner = None;
        state.acked_features = 0;
        state.iotlb = None;
        state.mem_table.clear();
        state.log_base = 0;
        state.log = None;
        info!("{}: owner reset", self.id);

        Ok(())
    }

    /// Installs the identity translation of the whole address space.
    pub(crate) fn install_identity_iotlb(state: &mut VhostDevState) -> Result<()> {
        let iotlb = state.iotlb.as_mut().ok_or(Error::InvalidState)?;
        iotlb.add_range(0, u64::MAX, 0, VHOST_ACCESS_RW)
    }
}

impl Drop for VhostDev {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        for (idx, vq) in self.vqs.iter_mut().enumerate() {
            let vq = match vq.get_mut() {
                Ok(vq) => vq,
                Err(poisoned) => poisoned.into_inner(),
            };
            if vq.started {
                warn!("{}: queue {} still started on release", self.id, idx);
                self.ops.stop_vq(state, vq, idx as u32);
            }
        }
        self.ops.release(state);
        debug!("{}: released", self.id);
    }
}
