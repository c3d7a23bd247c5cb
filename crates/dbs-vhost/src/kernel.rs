// Copyright (C) 2023 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Exclusive claim of a backend instance by an in-process front-end.

use log::{debug, info};

use crate::{Error, OwnerId, Result, SurfaceKind, VhostDev, VhostFile};

/// A backend instance claimed by an in-process front-end.
///
/// Once claimed, queue configuration and queue start/stop are driven only through this object.
/// Dropping it releases the reference it holds on the instance, the claim itself stays set for
/// the lifetime of the instance.
pub struct VhostKernelDev {
    file: VhostFile,
}

impl VhostKernelDev {
    /// Claims the instance behind `file` on behalf of `caller`.
    ///
    /// `file` must have been opened on the privileged surface and `caller` must own the
    /// instance. The instance must have a translation table and no queue may have an active
    /// transfer binding. On success the whole address space is identity mapped. On failure the
    /// instance is left untouched.
    pub fn get(file: &VhostFile, caller: OwnerId) -> Result<Self> {
        if file.kind() != SurfaceKind::Privileged {
            return Err(Error::PermissionDenied);
        }
        let dev = file.dev();

        let mut state = dev.state();
        let vqs = dev.lock_vqs();

        if state.owner != Some(caller) {
            return Err(Error::PermissionDenied);
        }
        if state.kernel_attached {
            return Err(Error::Busy);
        }
        if state.iotlb.is_none() {
            return Err(Error::InvalidState);
        }
        if vqs.iter().any(|vq| vq.private_data.is_some()) {
            return Err(Error::Busy);
        }

        VhostDev::install_identity_iotlb(&mut state)?;
        state.kernel_attached = true;
        drop(vqs);
        drop(state);
        info!("{}: claimed by in-process front-end", dev.id());

        Ok(VhostKernelDev { file: file.clone() })
    }

    fn dev(&self) -> &VhostDev {
        self.file.dev()
    }

    /// Number of queues of the instance.
    pub fn num_queues(&self) -> usize {
        self.dev().num_queues()
    }

    /// Sets the ring addresses of a queue.
    pub fn set_num_addr(&self, index: u32, desc: u64, avail: u64, used: u64) -> Result<()> {
        let dev = self.dev();
        let _state = dev.state();
        let mut vqs = dev.lock_vqs();
        let vq = vqs.get_mut(index)?;
        vq.desc = desc;
        vq.avail = avail;
        vq.used = used;

        Ok(())
    }

    /// Sets the size of a queue.
    pub fn set_vring_num(&self, index: u32, num: u32) -> Result<()> {
        let dev = self.dev();
        let _state = dev.state();
        let mut vqs = dev.lock_vqs();
        let vq = vqs.get_mut(index)?;
        if num == 0 || num > vq.num_max {
            return Err(Error::InvalidConfig);
        }
        vq.num = num;

        Ok(())
    }

    /// Sets the next available index of a queue.
    pub fn set_vring_base(&self, index: u32, base: u16) -> Result<()> {
        let dev = self.dev();
        let _state = dev.state();
        let mut vqs = dev.lock_vqs();
        vqs.get_mut(index)?.last_avail_idx = base;

        Ok(())
    }

    /// Starts processing a queue. Starting a started queue does nothing.
    pub fn start_vq(&self, index: u32) -> Result<()> {
        let dev = self.dev();
        let mut state = dev.state();
        let mut vqs = dev.lock_vqs();
        let vq = vqs.get_mut(index)?;
        if vq.started {
            return Ok(());
        }
        dev.ops().start_vq(&mut state, vq, index)?;
        vq.started = true;
        debug!("{}: queue {} started", dev.id(), index);

        Ok(())
    }

    /// Stops processing a queue. Stopping a stopped queue does nothing.
    pub fn stop_vq(&self, index: u32) -> Result<()> {
        let dev = self.dev();
        let mut state = dev.state();
        let mut vqs = dev.lock_vqs();
        let vq = vqs.get_mut(index)?;
        if !vq.started {
            return Ok(());
        }
        dev.ops().stop_vq(&mut state, vq, index);
        vq.started = false;
        debug!("{}: queue {} stopped", dev.id(), index);

        Ok(())
    }

    /// Next available index of a queue.
    pub fn vring_base(&self, index: u32) -> Result<u16> {
        let dev = self.dev();
        let _state = dev.state();
        let mut vqs = dev.lock_vqs();
        Ok(vqs.get_mut(index)?.last_avail_idx)
    }

    /// The handle the claim was taken through.
    pub fn file(&self) -> &VhostFile {
        &self.file
    }
}
