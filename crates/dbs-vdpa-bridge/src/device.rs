// Copyright (C) 2023 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Loopback vDPA device.
//!
//! A `VdpaBridge` is created unattached and unpublished. Its creator configures a kick source
//! and a call sink for every queue, then attaches it to a backend instance opened through the
//! privileged vhost surface. Only then is the device published on the vDPA bus, where its
//! consumer drives it through `VdpaConfigOps`. From that point queue start and stop are
//! forwarded to the backend.
//!
//! Locking: the device lock guards `BridgeState` and is held for the whole of every control
//! request. Backend locks are only taken with the device lock held. The kick and callback
//! slots of each queue are leaf locks, so kicks and callbacks never wait for the device lock.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use dbs_vhost::{EventSignal, OwnerId, VhostFile, VhostKernelDev};
use log::{debug, info, warn};

use crate::{
    warn_or_panic, CallEndpoint, DeferredExecutor, DeferredWork, DmaOps, Error, LoopbackDma,
    Result, VdpaBridgeConfig, VdpaBus, VdpaCallback, VdpaConfigOps, VdpaVirtqueue, VdpaVqState,
    VqShared, DEVICE_ACKNOWLEDGE, DEVICE_DRIVER, DEVICE_DRIVER_OK, DEVICE_FAILED,
    DEVICE_FEATURES_OK, DEVICE_INIT,
};

const DEVICE_STATUS_ACKNOWLEDGE: u8 = DEVICE_ACKNOWLEDGE;
const DEVICE_STATUS_DRIVER: u8 = DEVICE_STATUS_ACKNOWLEDGE | DEVICE_DRIVER;
const DEVICE_STATUS_FEATURES_OK: u8 = DEVICE_STATUS_DRIVER | DEVICE_FEATURES_OK;
const DEVICE_STATUS_DRIVER_OK: u8 = DEVICE_STATUS_FEATURES_OK | DEVICE_DRIVER_OK;

static NEXT_INSTANCE: AtomicU32 = AtomicU32::new(0);

/// Control requests accepted by a `VdpaBridge`.
#[derive(Debug)]
pub enum VdpaRequest {
    /// Set the areas of a queue.
    SetQueueAddress {
        /// Queue index.
        index: u16,
        /// Descriptor table.
        desc: u64,
        /// Driver area.
        driver: u64,
        /// Device area.
        device: u64,
    },
    /// Set the size of a queue.
    SetQueueSize {
        /// Queue index.
        index: u16,
        /// Queue size.
        num: u32,
    },
    /// Enable or disable a queue.
    SetQueueReady {
        /// Queue index.
        index: u16,
        /// Enable.
        ready: bool,
    },
    /// Query whether a queue is enabled.
    GetQueueReady {
        /// Queue index.
        index: u16,
    },
    /// Set the state a queue resumes from.
    SetQueueState {
        /// Queue index.
        index: u16,
        /// Queue state.
        state: VdpaVqState,
    },
    /// Query the state of a queue.
    GetQueueState {
        /// Queue index.
        index: u16,
    },
    /// Accept features.
    SetFeatures(u64),
    /// Query offered features.
    GetFeatures,
    /// Write the status byte.
    SetStatus(u8),
    /// Read the status byte.
    GetStatus,
    /// Reset the device.
    Reset,
    /// Read the config space.
    GetConfig {
        /// Byte offset.
        offset: usize,
        /// Number of bytes.
        len: usize,
    },
    /// Write the config space.
    SetConfig {
        /// Byte offset.
        offset: usize,
        /// Bytes to write.
        data: Vec<u8>,
    },
    /// Set the kick source of a queue.
    SetQueueKick {
        /// Queue index.
        index: u16,
        /// Kick source.
        signal: Arc<EventSignal>,
    },
    /// Set the call sink of a queue.
    SetQueueCall {
        /// Queue index.
        index: u16,
        /// Call sink.
        signal: Arc<EventSignal>,
    },
    /// Claim a backend instance and publish the device.
    AttachBackend(VhostFile),
    /// Query the virtio device id.
    GetDeviceId,
    /// Query the virtio vendor id.
    GetVendorId,
    /// Query the largest queue size.
    GetQueueNumMax,
    /// Query the queue alignment.
    GetQueueAlign,
    /// Query the config space generation.
    GetConfigGeneration,
}

/// Result of a successful `VdpaRequest`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VdpaResponse {
    /// Request carried out, nothing to return.
    Done,
    /// Numeric value.
    Value(u64),
    /// Queue enable state.
    Ready(bool),
    /// Queue state.
    State(VdpaVqState),
    /// Config space bytes.
    Config(Vec<u8>),
}

struct BridgeState {
    status: u8,
    driver_features: u64,
    vqs: Vec<VdpaVirtqueue>,
    vhost: Option<VhostKernelDev>,
    bus_id: Option<u32>,
    config: Vec<u8>,
    executor: Option<DeferredExecutor>,
    config_work: Option<Arc<DeferredWork>>,
    // Replaced call endpoints, quiesced once the device lock is dropped.
    retired: Vec<CallEndpoint>,
    released: bool,
}

struct VdpaBridgeInner {
    id: String,
    cfg: VdpaBridgeConfig,
    bus: Arc<VdpaBus>,
    dma: Arc<LoopbackDma>,
    state: Mutex<BridgeState>,
    config_cb: Arc<Mutex<Option<VdpaCallback>>>,
    generation: AtomicU32,
}

impl VdpaBridgeInner {
    fn state(&self) -> MutexGuard<BridgeState> {
        // Safe to unwrap() because we don't expect poisoned lock here.
        self.state.lock().unwrap()
    }

    fn config_cb(&self) -> MutexGuard<Option<VdpaCallback>> {
        // Safe to unwrap() because we don't expect poisoned lock here.
        self.config_cb.lock().unwrap()
    }

    fn check_alive(st: &BridgeState) -> Result<()> {
        if st.released {
            return Err(Error::InvalidState);
        }
        Ok(())
    }

    fn vq_mut(st: &mut BridgeState, idx: u16) -> Result<&mut VdpaVirtqueue> {
        Self::check_alive(st)?;
        st.vqs.get_mut(idx as usize).ok_or(Error::InvalidIndex)
    }

    fn handle_request(
        self: &Arc<Self>,
        st: &mut BridgeState,
        caller: OwnerId,
        req: VdpaRequest,
    ) -> Result<VdpaResponse> {
        Self::check_alive(st)?;

        match req {
            VdpaRequest::SetQueueAddress {
                index,
                desc,
                driver,
                device,
            } => self
                .set_vq_address_locked(st, index, desc, driver, device)
                .map(|_| VdpaResponse::Done),
            VdpaRequest::SetQueueSize { index, num } => {
                let vq = Self::vq_mut(st, index)?;
                vq.check_not_ready()?;
                vq.num = num;
                Ok(VdpaResponse::Done)
            }
            VdpaRequest::SetQueueReady { index, ready } => self
                .set_vq_ready_locked(st, index, ready)
                .map(|_| VdpaResponse::Done),
            VdpaRequest::GetQueueReady { index } => {
                Ok(VdpaResponse::Ready(Self::vq_mut(st, index)?.ready))
            }
            VdpaRequest::SetQueueState { index, state } => {
                let vq = Self::vq_mut(st, index)?;
                vq.check_not_ready()?;
                vq.state = state;
                Ok(VdpaResponse::Done)
            }
            VdpaRequest::GetQueueState { index } => {
                Ok(VdpaResponse::State(Self::vq_mut(st, index)?.state))
            }
            VdpaRequest::SetFeatures(features) => self
                .set_features_locked(st, features)
                .map(|_| VdpaResponse::Done),
            VdpaRequest::GetFeatures => Ok(VdpaResponse::Value(self.cfg.features)),
            VdpaRequest::SetStatus(status) => {
                self.set_status_locked(st, status);
                Ok(VdpaResponse::Done)
            }
            VdpaRequest::GetStatus => Ok(VdpaResponse::Value(st.status as u64)),
            VdpaRequest::Reset => {
                self.reset_locked(st);
                Ok(VdpaResponse::Done)
            }
            VdpaRequest::GetConfig { offset, len } => {
                let mut buf = vec![0u8; len];
                Self::get_config_locked(st, offset, &mut buf)?;
                Ok(VdpaResponse::Config(buf))
            }
            VdpaRequest::SetConfig { offset, data } => self
                .set_config_locked(st, offset, &data)
                .map(|_| VdpaResponse::Done),
            VdpaRequest::SetQueueKick { index, signal } => self
                .set_vring_kick_locked(st, index, signal)
                .map(|_| VdpaResponse::Done),
            VdpaRequest::SetQueueCall { index, signal } => self
                .set_vring_call_locked(st, index, signal)
                .map(|_| VdpaResponse::Done),
            VdpaRequest::AttachBackend(file) => self
                .attach_locked(st, caller, &file)
                .map(|_| VdpaResponse::Done),
            VdpaRequest::GetDeviceId => Ok(VdpaResponse::Value(self.cfg.device_id as u64)),
            VdpaRequest::GetVendorId => Ok(VdpaResponse::Value(self.cfg.vendor_id as u64)),
            VdpaRequest::GetQueueNumMax => Ok(VdpaResponse::Value(self.cfg.vq_num_max as u64)),
            VdpaRequest::GetQueueAlign => Ok(VdpaResponse::Value(self.cfg.vq_align as u64)),
            VdpaRequest::GetConfigGeneration => Ok(VdpaResponse::Value(
                self.generation.load(Ordering::Acquire) as u64,
            )),
        }
    }

    fn set_vq_address_locked(
        &self,
        st: &mut BridgeState,
        idx: u16,
        desc: u64,
        driver: u64,
        device: u64,
    ) -> Result<()> {
        let vq = Self::vq_mut(st, idx)?;
        vq.check_not_ready()?;
        vq.desc_addr = desc;
        vq.driver_addr = driver;
        vq.device_addr = device;

        Ok(())
    }

    fn set_vq_ready_locked(&self, st: &mut BridgeState, idx: u16, ready: bool) -> Result<()> {
        Self::vq_mut(st, idx)?;
        let BridgeState { vqs, vhost, .. } = st;
        let vq = &mut vqs[idx as usize];

        if !ready {
            if !vq.ready {
                return Ok(());
            }
            if let Some(vhost) = vhost.as_ref() {
                if let Err(e) = vhost.stop_vq(idx as u32) {
                    warn!("{}: failed to stop queue {} on backend, {}", self.id, idx, e);
                }
                match vhost.vring_base(idx as u32) {
                    Ok(base) => vq.state.avail_index = base,
                    Err(e) => warn!("{}: failed to get base of queue {}, {}", self.id, idx, e),
                }
            }
            vq.ready = false;
            debug!("{}: queue {} disabled", self.id, idx);
            return Ok(());
        }

        if vq.ready {
            return Ok(());
        }
        vq.validate(self.cfg.vq_num_max)?;
        let vhost = vhost.as_ref().ok_or(Error::InvalidState)?;

        vq.ready = true;
        let index = idx as u32;
        let started = vhost
            .set_num_addr(index, vq.desc_addr, vq.driver_addr, vq.device_addr)
            .and_then(|_| vhost.set_vring_num(index, vq.num))
            .and_then(|_| vhost.set_vring_base(index, vq.state.avail_index))
            .and_then(|_| vhost.start_vq(index));
        if let Err(e) = started {
            warn!("{}: backend refused to start queue {}, {}", self.id, idx, e);
            vq.ready = false;
            return Err(e.into());
        }
        debug!(
            "{}: queue {} enabled, num {} desc {:#x}",
            self.id, idx, vq.num, vq.desc_addr
        );

        Ok(())
    }

    fn set_features_locked(&self, st: &mut BridgeState, features: u64) -> Result<()> {
        if features & !self.cfg.features != 0 {
            warn!(
                "{}: driver accepted unoffered features {:#x}",
                self.id,
                features & !self.cfg.features
            );
            return Err(Error::Unsupported);
        }
        st.driver_features = features;

        Ok(())
    }

    fn set_status_locked(&self, st: &mut BridgeState, status: u8) {
        let cur = st.status;
        let mut result = Err(DEVICE_FAILED);

        if status == DEVICE_INIT {
            self.reset_locked(st);
            result = Ok(());
        } else if status == cur {
            // No real state change, nothing to do.
            result = Ok(());
        } else if status & DEVICE_FAILED != 0 {
            // Driver marks device as failed.
            result = Ok(());
        } else if status == DEVICE_STATUS_ACKNOWLEDGE {
            if cur == DEVICE_INIT {
                result = Ok(());
            }
        } else if status == DEVICE_STATUS_DRIVER {
            if cur == DEVICE_STATUS_ACKNOWLEDGE {
                result = Ok(());
            }
        } else if status == DEVICE_STATUS_FEATURES_OK {
            if cur == DEVICE_STATUS_DRIVER {
                result = Ok(());
            }
        } else if status == DEVICE_STATUS_DRIVER_OK && cur == DEVICE_STATUS_FEATURES_OK {
            result = Ok(());
        }

        match result {
            Ok(()) if status == DEVICE_INIT => {}
            Ok(()) if status & DEVICE_FAILED != 0 => st.status |= DEVICE_FAILED,
            Ok(()) => st.status = status,
            Err(failed) => {
                warn!(
                    "{}: invalid virtio driver status transition: 0x{:x} -> 0x{:x}",
                    self.id, cur, status
                );
                st.status |= failed;
            }
        }
    }

    fn reset_locked(&self, st: &mut BridgeState) {
        if st.vhost.is_some() {
            for idx in 0..st.vqs.len() {
                if let Err(e) = self.set_vq_ready_locked(st, idx as u16, false) {
                    warn!("{}: failed to disable queue {}, {}", self.id, idx, e);
                }
            }
        }
        for vq in st.vqs.iter_mut() {
            vq.reset();
        }
        st.status = DEVICE_INIT;
        st.driver_features = 0;
        debug!("{}: reset", self.id);
    }

    fn get_config_locked(st: &BridgeState, offset: usize, buf: &mut [u8]) -> Result<()> {
        let end = offset.checked_add(buf.len()).ok_or(Error::OutOfRange)?;
        if end > st.config.len() {
            return Err(Error::OutOfRange);
        }
        buf.copy_from_slice(&st.config[offset..end]);

        Ok(())
    }

    fn set_config_locked(&self, st: &mut BridgeState, offset: usize, data: &[u8]) -> Result<()> {
        let end = offset.checked_add(data.len()).ok_or(Error::OutOfRange)?;
        if end > st.config.len() {
            return Err(Error::OutOfRange);
        }
        // Every field of the net config space is read only for the driver.
        debug!(
            "{}: ignoring driver write of {} bytes at config offset {}",
            self.id,
            data.len(),
            offset
        );

        Ok(())
    }

    fn set_vring_kick_locked(
        &self,
        st: &mut BridgeState,
        idx: u16,
        signal: Arc<EventSignal>,
    ) -> Result<()> {
        if st.vhost.is_some() {
            return Err(Error::Busy);
        }
        let vq = Self::vq_mut(st, idx)?;
        vq.shared.set_kick_signal(Some(signal));

        Ok(())
    }

    fn set_vring_call_locked(
        &self,
        st: &mut BridgeState,
        idx: u16,
        signal: Arc<EventSignal>,
    ) -> Result<()> {
        if st.vhost.is_some() {
            return Err(Error::Busy);
        }
        Self::vq_mut(st, idx)?;
        let BridgeState {
            vqs,
            executor,
            retired,
            ..
        } = st;
        let exec = executor.as_ref().ok_or(Error::InvalidState)?;
        let vq = &mut vqs[idx as usize];

        if let Some(old) = vq.call.take() {
            old.stop();
            retired.push(old);
        }
        vq.call = Some(CallEndpoint::arm(exec, signal, vq.shared.clone()));
        debug!("{}: call endpoint of queue {} armed", self.id, idx);

        Ok(())
    }

    fn attach_locked(
        self: &Arc<Self>,
        st: &mut BridgeState,
        caller: OwnerId,
        file: &VhostFile,
    ) -> Result<()> {
        if st.vhost.is_some() {
            return Err(Error::AlreadyAttached);
        }
        if !st.vqs.iter().all(|vq| vq.is_configured()) {
            return Err(Error::NotConfigured);
        }
        if file.dev().num_queues() < st.vqs.len() {
            warn!(
                "{}: backend {} has {} queues, {} needed",
                self.id,
                file.dev().id(),
                file.dev().num_queues(),
                st.vqs.len()
            );
            return Err(Error::InvalidConfig);
        }

        let vhost = VhostKernelDev::get(file, caller)?;
        let ops: Arc<dyn VdpaConfigOps> = self.clone();
        let dma: Arc<dyn DmaOps> = self.dma.clone();
        let bus_id = self.bus.register_device(ops, dma, st.vqs.len())?;
        st.vhost = Some(vhost);
        st.bus_id = Some(bus_id);
        info!(
            "{}: attached to {}, published as vdpa{}",
            self.id,
            file.dev().id(),
            bus_id
        );

        Ok(())
    }

    fn release(&self) {
        let (executor, vhost, endpoints, config_work, shared) = {
            let mut st = self.state();
            if st.released {
                return;
            }

            if let Some(bus_id) = st.bus_id.take() {
                if let Err(e) = self.bus.unregister_device(bus_id) {
                    warn_or_panic!("{}: vdpa{} missing from bus, {}", self.id, bus_id, e);
                }
            }
            if st.vhost.is_some() {
                for idx in 0..st.vqs.len() {
                    if let Err(e) = self.set_vq_ready_locked(&mut st, idx as u16, false) {
                        warn!("{}: failed to disable queue {}, {}", self.id, idx, e);
                    }
                }
            }
            st.released = true;

            let mut endpoints: Vec<CallEndpoint> = st.retired.drain(..).collect();
            endpoints.extend(st.vqs.iter_mut().filter_map(|vq| vq.call.take()));
            let shared: Vec<Arc<VqShared>> = st.vqs.iter().map(|vq| vq.shared.clone()).collect();
            (
                st.executor.take(),
                st.vhost.take(),
                endpoints,
                st.config_work.take(),
                shared,
            )
        };

        // Callbacks may call back into the device, so they are quiesced without the device
        // lock held.
        for ep in endpoints {
            ep.disarm();
        }
        if let Some(exec) = executor.as_ref() {
            if let Some(work) = config_work {
                work.sync();
                exec.unregister(&work);
            }
        }
        for s in shared.iter() {
            s.set_kick_signal(None);
            s.set_callback(None);
        }
        *self.config_cb() = None;

        // Drops the backend reference held by the claim.
        drop(vhost);
        if let Some(mut exec) = executor {
            exec.shutdown();
        }
        info!("{}: released", self.id);
    }
}

impl VdpaConfigOps for VdpaBridgeInner {
    fn set_vq_address(
        &self,
        idx: u16,
        desc_area: u64,
        driver_area: u64,
        device_area: u64,
    ) -> Result<()> {
        let mut st = self.state();
        self.set_vq_address_locked(&mut st, idx, desc_area, driver_area, device_area)
    }

    fn set_vq_num(&self, idx: u16, num: u32) -> Result<()> {
        let mut st = self.state();
        let vq = Self::vq_mut(&mut st, idx)?;
        vq.check_not_ready()?;
        vq.num = num;

        Ok(())
    }

    fn kick_vq(&self, idx: u16) -> Result<()> {
        let shared = {
            let st = self.state();
            Self::check_alive(&st)?;
            st.vqs
                .get(idx as usize)
                .map(|vq| vq.shared.clone())
                .ok_or(Error::InvalidIndex)?
        };
        shared.kick();

        Ok(())
    }

    fn set_vq_cb(&self, idx: u16, cb: Option<VdpaCallback>) -> Result<()> {
        let shared = {
            let st = self.state();
            Self::check_alive(&st)?;
            st.vqs
                .get(idx as usize)
                .map(|vq| vq.shared.clone())
                .ok_or(Error::InvalidIndex)?
        };
        shared.set_callback(cb);

        Ok(())
    }

    fn set_vq_ready(&self, idx: u16, ready: bool) -> Result<()> {
        let mut st = self.state();
        self.set_vq_ready_locked(&mut st, idx, ready)
    }

    fn get_vq_ready(&self, idx: u16) -> Result<bool> {
        let mut st = self.state();
        Ok(Self::vq_mut(&mut st, idx)?.ready)
    }

    fn set_vq_state(&self, idx: u16, state: &VdpaVqState) -> Result<()> {
        let mut st = self.state();
        let vq = Self::vq_mut(&mut st, idx)?;
        vq.check_not_ready()?;
        vq.state = *state;

        Ok(())
    }

    fn get_vq_state(&self, idx: u16) -> Result<VdpaVqState> {
        let mut st = self.state();
        Ok(Self::vq_mut(&mut st, idx)?.state)
    }

    fn get_vq_align(&self) -> u32 {
        self.cfg.vq_align
    }

    fn get_features(&self) -> u64 {
        self.cfg.features
    }

    fn set_features(&self, features: u64) -> Result<()> {
        let mut st = self.state();
        Self::check_alive(&st)?;
        self.set_features_locked(&mut st, features)
    }

    fn set_config_cb(&self, cb: Option<VdpaCallback>) {
        *self.config_cb() = cb;
    }

    fn get_vq_num_max(&self) -> u16 {
        self.cfg.vq_num_max
    }

    fn get_device_id(&self) -> u32 {
        self.cfg.device_id
    }

    fn get_vendor_id(&self) -> u32 {
        self.cfg.vendor_id
    }

    fn get_status(&self) -> u8 {
        self.state().status
    }

    fn set_status(&self, status: u8) {
        let mut st = self.state();
        if st.released {
            return;
        }
        self.set_status_locked(&mut st, status);
    }

    fn reset(&self) -> Result<()> {
        let mut st = self.state();
        Self::check_alive(&st)?;
        self.reset_locked(&mut st);

        Ok(())
    }

    fn get_config_size(&self) -> usize {
        self.state().config.len()
    }

    fn get_config(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let st = self.state();
        Self::get_config_locked(&st, offset, buf)
    }

    fn set_config(&self, offset: usize, buf: &[u8]) -> Result<()> {
        let mut st = self.state();
        self.set_config_locked(&mut st, offset, buf)
    }

    fn get_generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }
}

/// Loopback vDPA device.
///
/// Dropping the device releases it: it is withdrawn from the bus, its queues are stopped on
/// the backend, its call endpoints are quiesced and the backend reference is dropped, in that
/// order.
pub struct VdpaBridge {
    inner: Arc<VdpaBridgeInner>,
}

impl VdpaBridge {
    /// Creates an unattached device which will publish itself on `bus` once attached.
    pub fn open(cfg: VdpaBridgeConfig, bus: Arc<VdpaBus>) -> Result<Self> {
        cfg.validate()?;
        let id = format!("vdpa-bridge.{}", NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed));
        let executor = DeferredExecutor::new(&id)?;

        let config_cb: Arc<Mutex<Option<VdpaCallback>>> = Arc::new(Mutex::new(None));
        let cb_slot = config_cb.clone();
        let config_work = executor.register(Box::new(move || {
            // Safe to unwrap() because we don't expect poisoned lock here.
            let cb = cb_slot.lock().unwrap().clone();
            if let Some(cb) = cb {
                cb();
            }
        }));

        let vqs = (0..cfg.num_queues)
            .map(|i| VdpaVirtqueue::new(i as u16))
            .collect();
        let config = cfg.config_space();
        info!(
            "{}: created, device id {}, {} queues",
            id, cfg.device_id, cfg.num_queues
        );

        Ok(VdpaBridge {
            inner: Arc::new(VdpaBridgeInner {
                id,
                cfg,
                bus,
                dma: Arc::new(LoopbackDma::new()),
                state: Mutex::new(BridgeState {
                    status: DEVICE_INIT,
                    driver_features: 0,
                    vqs,
                    vhost: None,
                    bus_id: None,
                    config,
                    executor: Some(executor),
                    config_work: Some(config_work),
                    retired: Vec::new(),
                    released: false,
                }),
                config_cb,
                generation: AtomicU32::new(0),
            }),
        })
    }

    /// Identifier of the device, used to prefix log messages.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Handles a control request. The device lock is held for the whole request.
    ///
    /// Call endpoints replaced by the request are quiesced after the lock is dropped, since
    /// their callbacks may query the device.
    pub fn ioctl(&self, caller: OwnerId, req: VdpaRequest) -> Result<VdpaResponse> {
        let (res, retired) = {
            let mut st = self.inner.state();
            let res = self.inner.handle_request(&mut st, caller, req);
            (res, std::mem::take(&mut st.retired))
        };
        for ep in retired {
            ep.disarm();
        }

        res
    }

    /// Control plane of the device, as published on the bus.
    pub fn config_ops(&self) -> Arc<dyn VdpaConfigOps> {
        self.inner.clone()
    }

    /// DMA operations of the device.
    pub fn dma(&self) -> Arc<LoopbackDma> {
        self.inner.dma.clone()
    }

    /// Bus identifier, once attached.
    pub fn bus_id(&self) -> Option<u32> {
        self.inner.state().bus_id
    }

    /// Whether the device holds a backend claim.
    pub fn is_attached(&self) -> bool {
        self.inner.state().vhost.is_some()
    }

    /// Features accepted by the driver.
    pub fn driver_features(&self) -> u64 {
        self.inner.state().driver_features
    }

    /// Updates the config space from the device side and notifies the driver.
    pub fn update_config(&self, offset: usize, data: &[u8]) -> Result<()> {
        let mut st = self.inner.state();
        VdpaBridgeInner::check_alive(&st)?;
        let end = offset.checked_add(data.len()).ok_or(Error::OutOfRange)?;
        if end > st.config.len() {
            return Err(Error::OutOfRange);
        }
        st.config[offset..end].copy_from_slice(data);
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        if let Some(work) = st.config_work.as_ref() {
            work.queue();
        }

        Ok(())
    }

    /// Releases the device. Same as dropping it.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for VdpaBridge {
    fn drop(&mut self) {
        self.inner.release();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    use dbs_vhost::loopback::{LoopbackState, VhostLoopback};
    use dbs_vhost::{VhostRegistry, VhostRequest, VIRTIO_F_ACCESS_PLATFORM};

    use super::*;

    struct Env {
        registry: VhostRegistry,
        bus: Arc<VdpaBus>,
        me: OwnerId,
    }

    impl Env {
        fn new() -> Self {
            let registry = VhostRegistry::new();
            registry
                .register_backend(Arc::new(VhostLoopback::default()))
                .unwrap();
            Env {
                registry,
                bus: Arc::new(VdpaBus::new()),
                me: OwnerId::current(),
            }
        }

        fn backend(&self) -> VhostFile {
            let file = self.registry.open("vhost-loopback-kernel").unwrap();
            file.ioctl(self.me, VhostRequest::SetOwner).unwrap();
            file.ioctl(
                self.me,
                VhostRequest::SetFeatures(1u64 << VIRTIO_F_ACCESS_PLATFORM),
            )
            .unwrap();
            file
        }

        fn bridge(&self) -> VdpaBridge {
            VdpaBridge::open(VdpaBridgeConfig::default(), self.bus.clone()).unwrap()
        }

        fn endpoints(&self, bridge: &VdpaBridge, file: &VhostFile) -> Vec<Arc<EventSignal>> {
            let mut calls = Vec::new();
            for index in 0..2u16 {
                let kick = EventSignal::new().unwrap();
                let call = EventSignal::new().unwrap();
                file.ioctl(
                    self.me,
                    VhostRequest::SetVringKick {
                        index: index as u32,
                        signal: Some(kick.clone()),
                    },
                )
                .unwrap();
                file.ioctl(
                    self.me,
                    VhostRequest::SetVringCall {
                        index: index as u32,
                        signal: Some(call.clone()),
                    },
                )
                .unwrap();
                bridge
                    .ioctl(
                        self.me,
                        VdpaRequest::SetQueueKick {
                            index,
                            signal: kick,
                        },
                    )
                    .unwrap();
                bridge
                    .ioctl(
                        self.me,
                        VdpaRequest::SetQueueCall {
                            index,
                            signal: call.clone(),
                        },
                    )
                    .unwrap();
                calls.push(call);
            }
            calls
        }
    }

    #[test]
    fn test_identity() {
        let env = Env::new();
        let bridge = env.bridge();
        let ops = bridge.config_ops();
        assert_eq!(ops.get_device_id(), 1);
        assert_eq!(ops.get_vendor_id(), 0);
        assert_eq!(ops.get_vq_num_max(), 256);
        assert_eq!(ops.get_vq_align(), 4096);
        assert_eq!(
            ops.get_features(),
            (1u64 << VIRTIO_F_ACCESS_PLATFORM) | (1u64 << 32)
        );
        assert_eq!(ops.get_config_size(), 24);
        assert_eq!(
            bridge.ioctl(env.me, VdpaRequest::GetQueueNumMax).unwrap(),
            VdpaResponse::Value(256)
        );
        assert!(bridge.bus_id().is_none());
        assert!(env.bus.is_empty());
    }

    #[test]
    fn test_status_machine() {
        let env = Env::new();
        let bridge = env.bridge();
        let ops = bridge.config_ops();

        ops.set_status(DEVICE_STATUS_ACKNOWLEDGE);
        ops.set_status(DEVICE_STATUS_DRIVER);
        ops.set_status(DEVICE_STATUS_DRIVER);
        ops.set_status(DEVICE_STATUS_FEATURES_OK);
        ops.set_status(DEVICE_STATUS_DRIVER_OK);
        assert_eq!(ops.get_status(), DEVICE_STATUS_DRIVER_OK);

        ops.set_status(0);
        assert_eq!(ops.get_status(), DEVICE_INIT);

        // Skipping a step fails the device.
        ops.set_status(DEVICE_STATUS_ACKNOWLEDGE);
        ops.set_status(DEVICE_STATUS_FEATURES_OK);
        assert_eq!(ops.get_status(), DEVICE_STATUS_ACKNOWLEDGE | DEVICE_FAILED);

        ops.reset().unwrap();
        ops.set_status(DEVICE_STATUS_ACKNOWLEDGE);
        ops.set_status(DEVICE_STATUS_ACKNOWLEDGE | DEVICE_FAILED);
        assert_eq!(ops.get_status(), DEVICE_STATUS_ACKNOWLEDGE | DEVICE_FAILED);
    }

    #[test]
    fn test_features() {
        let env = Env::new();
        let bridge = env.bridge();
        let ops = bridge.config_ops();

        assert_eq!(ops.set_features(1 << 5), Err(Error::Unsupported));
        ops.set_features(1u64 << 32).unwrap();
        assert_eq!(bridge.driver_features(), 1u64 << 32);
        ops.reset().unwrap();
        assert_eq!(bridge.driver_features(), 0);
    }

    #[test]
    fn test_config_space() {
        let env = Env::new();
        let bridge = env.bridge();
        let ops = bridge.config_ops();

        let mut buf = [0u8; 2];
        ops.get_config(10, &mut buf).unwrap();
        assert_eq!(buf, 1500u16.to_le_bytes());
        let mut big = [0u8; 4];
        assert_eq!(ops.get_config(22, &mut big), Err(Error::OutOfRange));
        assert_eq!(ops.set_config(23, &[0, 0]), Err(Error::OutOfRange));
        assert_eq!(
            bridge.ioctl(env.me, VdpaRequest::GetConfig { offset: usize::MAX, len: 2 }),
            Err(Error::OutOfRange)
        );
        ops.set_config(0, &[1, 2]).unwrap();
        assert_eq!(
            bridge
                .ioctl(env.me, VdpaRequest::GetConfig { offset: 0, len: 2 })
                .unwrap(),
            VdpaResponse::Config(vec![0, 0])
        );

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        ops.set_config_cb(Some(Arc::new(move || {
            tx.lock().unwrap().send(()).unwrap();
        })));
        bridge.update_config(0, &[2, 0, 0, 0, 0, 9]).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(ops.get_generation(), 1);
        let mut mac = [0u8; 6];
        ops.get_config(0, &mut mac).unwrap();
        assert_eq!(mac, [2, 0, 0, 0, 0, 9]);
        assert_eq!(bridge.update_config(20, &[0; 8]), Err(Error::OutOfRange));
    }

    #[test]
    fn test_queue_config_rules() {
        let env = Env::new();
        let bridge = env.bridge();
        let ops = bridge.config_ops();

        assert_eq!(ops.set_vq_num(2, 256), Err(Error::InvalidIndex));
        assert_eq!(ops.get_vq_ready(2), Err(Error::InvalidIndex));
        assert_eq!(ops.kick_vq(2), Err(Error::InvalidIndex));
        let sig = EventSignal::new().unwrap();
        assert_eq!(
            bridge.ioctl(
                env.me,
                VdpaRequest::SetQueueKick {
                    index: 2,
                    signal: sig.clone()
                }
            ),
            Err(Error::InvalidIndex)
        );
        assert_eq!(
            bridge.ioctl(env.me, VdpaRequest::SetQueueCall { index: 9, signal: sig }),
            Err(Error::InvalidIndex)
        );

        ops.set_vq_address(0, 0x1000, 0x2000, 0x3000).unwrap();
        ops.set_vq_num(0, 256).unwrap();
        ops.set_vq_state(0, &VdpaVqState { avail_index: 4 }).unwrap();
        assert_eq!(ops.get_vq_state(0).unwrap().avail_index, 4);
        // Not attached.
        assert_eq!(ops.set_vq_ready(0, true), Err(Error::InvalidState));
        assert!(!ops.get_vq_ready(0).unwrap());

        ops.set_vq_num(1, 300).unwrap();
        ops.set_vq_address(1, 0x1000, 0x2000, 0x3000).unwrap();
        assert_eq!(ops.set_vq_ready(1, true), Err(Error::InvalidConfig));
    }

    #[test]
    fn test_attach_preconditions() {
        let env = Env::new();
        let bridge = env.bridge();
        let file = env.backend();

        assert_eq!(
            bridge.ioctl(env.me, VdpaRequest::AttachBackend(file.clone())),
            Err(Error::NotConfigured)
        );
        assert!(!file.dev().is_kernel_attached());

        env.endpoints(&bridge, &file);
        let general = env.registry.open("vhost-loopback").unwrap();
        assert_eq!(
            bridge.ioctl(env.me, VdpaRequest::AttachBackend(general)),
            Err(Error::PermissionDenied)
        );
        assert_eq!(
            bridge.ioctl(OwnerId(env.me.0 + 1), VdpaRequest::AttachBackend(file.clone())),
            Err(Error::PermissionDenied)
        );
        assert!(!bridge.is_attached());
        assert!(env.bus.is_empty());

        bridge
            .ioctl(env.me, VdpaRequest::AttachBackend(file.clone()))
            .unwrap();
        assert!(bridge.is_attached());
        assert_eq!(env.bus.len(), 1);
        assert_eq!(
            bridge.ioctl(env.me, VdpaRequest::AttachBackend(file.clone())),
            Err(Error::AlreadyAttached)
        );
        let sig = EventSignal::new().unwrap();
        assert_eq!(
            bridge.ioctl(env.me, VdpaRequest::SetQueueKick { index: 0, signal: sig }),
            Err(Error::Busy)
        );
    }

    #[test]
    fn test_ready_cycle_and_rollback() {
        let env = Env::new();
        let bridge = env.bridge();
        let file = env.backend();
        env.endpoints(&bridge, &file);
        bridge
            .ioctl(env.me, VdpaRequest::AttachBackend(file.clone()))
            .unwrap();
        let ops = bridge.config_ops();

        ops.set_vq_address(0, 0x1000, 0x2000, 0x3000).unwrap();
        ops.set_vq_num(0, 256).unwrap();
        ops.set_vq_ready(0, true).unwrap();
        assert!(ops.get_vq_ready(0).unwrap());
        assert_eq!(
            ops.set_vq_address(0, 0x4000, 0x5000, 0x6000),
            Err(Error::InvalidConfig)
        );
        ops.set_vq_ready(0, false).unwrap();
        assert!(!ops.get_vq_ready(0).unwrap());
        ops.set_vq_ready(0, true).unwrap();

        {
            let state = file.dev().state();
            let st = LoopbackState::from_dev_state(&state).unwrap();
            assert_eq!(st.starts().len(), 2);
            assert_eq!(st.stops(), &[0]);
        }

        // Backend needs a kick source on the queue, which was cleared behind our back.
        file.dev().lock_vqs().get_mut(1).unwrap().kick = None;
        ops.set_vq_address(1, 0x1000, 0x2000, 0x3000).unwrap();
        ops.set_vq_num(1, 64).unwrap();
        assert_eq!(ops.set_vq_ready(1, true), Err(Error::InvalidState));
        assert!(!ops.get_vq_ready(1).unwrap());

        ops.reset().unwrap();
        assert!(!ops.get_vq_ready(0).unwrap());
        assert_eq!(ops.get_status(), DEVICE_INIT);
        {
            let state = file.dev().state();
            let st = LoopbackState::from_dev_state(&state).unwrap();
            assert_eq!(st.stops(), &[0, 0]);
        }

        // A second reset has nothing left to stop.
        ops.reset().unwrap();
        assert!(!ops.get_vq_ready(0).unwrap());
        assert!(!ops.get_vq_ready(1).unwrap());
        assert_eq!(ops.get_status(), DEVICE_INIT);
        let state = file.dev().state();
        let st = LoopbackState::from_dev_state(&state).unwrap();
        assert_eq!(st.stops(), &[0, 0]);
    }

    #[test]
    fn test_call_rearm_while_callback_queries_device() {
        let env = Env::new();
        let bridge = Arc::new(env.bridge());
        let ops = bridge.config_ops();

        let (started_tx, started_rx) = mpsc::channel();
        let started_tx = Mutex::new(started_tx);
        let weak_ops = Arc::downgrade(&ops);
        ops.set_vq_cb(
            0,
            Some(Arc::new(move || {
                let _ = started_tx.lock().unwrap().send(());
                std::thread::sleep(Duration::from_millis(100));
                if let Some(ops) = weak_ops.upgrade() {
                    let _ = ops.get_vq_ready(0);
                }
            })),
        )
        .unwrap();

        let first = EventSignal::new().unwrap();
        bridge
            .ioctl(
                env.me,
                VdpaRequest::SetQueueCall {
                    index: 0,
                    signal: first.clone(),
                },
            )
            .unwrap();
        first.signal(1).unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // Replace the endpoint while its callback is still running.
        let second = EventSignal::new().unwrap();
        let (done_tx, done_rx) = mpsc::channel();
        let b = bridge.clone();
        let me = env.me;
        let signal = second.clone();
        let handle = std::thread::spawn(move || {
            let res = b.ioctl(me, VdpaRequest::SetQueueCall { index: 0, signal });
            done_tx.send(res).unwrap();
        });
        let res = done_rx.recv_timeout(Duration::from_secs(3)).unwrap();
        assert_eq!(res, Ok(VdpaResponse::Done));
        handle.join().unwrap();
        assert_eq!(first.waiter_count(), 0);
        assert_eq!(second.waiter_count(), 1);

        // The new endpoint delivers calls.
        second.signal(1).unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_release_order() {
        let env = Env::new();
        let bridge = env.bridge();
        let file = env.backend();
        let calls = env.endpoints(&bridge, &file);
        bridge
            .ioctl(env.me, VdpaRequest::AttachBackend(file.clone()))
            .unwrap();
        let bus_id = bridge.bus_id().unwrap();
        let ops = bridge.config_ops();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        ops.set_vq_cb(
            0,
            Some(Arc::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
        ops.set_vq_address(0, 0x1000, 0x2000, 0x3000).unwrap();
        ops.set_vq_num(0, 128).unwrap();
        ops.set_vq_ready(0, true).unwrap();
        assert_eq!(file.ref_count(), 2);
        assert_eq!(calls[0].waiter_count(), 1);

        bridge.release();
        assert!(env.bus.find(bus_id).is_none());
        assert_eq!(file.ref_count(), 1);
        assert_eq!(calls[0].waiter_count(), 0);
        assert!(file.dev().is_kernel_attached());
        {
            let state = file.dev().state();
            let st = LoopbackState::from_dev_state(&state).unwrap();
            assert_eq!(st.stops(), &[0]);
        }

        let seen = hits.load(Ordering::SeqCst);
        calls[0].signal(1).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(hits.load(Ordering::SeqCst), seen);
        assert_eq!(ops.set_vq_ready(0, true), Err(Error::InvalidState));
    }
}
