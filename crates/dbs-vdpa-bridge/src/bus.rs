// Copyright (C) 2023 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Publication of vDPA devices to their consumers.

use std::collections::btree_map::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::info;

use crate::{DmaOps, Error, Result, VdpaConfigOps};

/// A device published on the bus.
pub struct VdpaBusDevice {
    id: u32,
    name: String,
    nvqs: usize,
    ops: Arc<dyn VdpaConfigOps>,
    dma: Arc<dyn DmaOps>,
}

impl VdpaBusDevice {
    /// Bus wide identifier.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Device name, `vdpa<id>`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of virtqueues.
    pub fn nvqs(&self) -> usize {
        self.nvqs
    }

    /// Control plane of the device.
    pub fn ops(&self) -> &Arc<dyn VdpaConfigOps> {
        &self.ops
    }

    /// DMA operations of the device.
    pub fn dma(&self) -> &Arc<dyn DmaOps> {
        &self.dma
    }
}

/// Registry of published vDPA devices.
#[derive(Default)]
pub struct VdpaBus {
    devices: Mutex<BTreeMap<u32, Arc<VdpaBusDevice>>>,
    next_id: AtomicU32,
}

impl VdpaBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        VdpaBus::default()
    }

    fn devices(&self) -> MutexGuard<BTreeMap<u32, Arc<VdpaBusDevice>>> {
        // Safe to unwrap() because we don't expect poisoned lock here.
        self.devices.lock().unwrap()
    }

    /// Publishes a device with `nvqs` virtqueues.
    pub fn register_device(
        &self,
        ops: Arc<dyn VdpaConfigOps>,
        dma: Arc<dyn DmaOps>,
        nvqs: usize,
    ) -> Result<u32> {
        if nvqs == 0 {
            return Err(Error::InvalidConfig);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let dev = Arc::new(VdpaBusDevice {
            id,
            name: format!("vdpa{}", id),
            nvqs,
            ops,
            dma,
        });
        info!("vdpa: registered {}", dev.name);
        self.devices().insert(id, dev);

        Ok(id)
    }

    /// Withdraws a device.
    pub fn unregister_device(&self, id: u32) -> Result<()> {
        match self.devices().remove(&id) {
            Some(dev) => {
                info!("vdpa: unregistered {}", dev.name);
                Ok(())
            }
            None => Err(Error::InvalidState),
        }
    }

    /// Finds a published device.
    pub fn find(&self, id: u32) -> Option<Arc<VdpaBusDevice>> {
        self.devices().get(&id).cloned()
    }

    /// Finds a published device by name.
    pub fn find_by_name(&self, name: &str) -> Option<Arc<VdpaBusDevice>> {
        self.devices().values().find(|d| d.name == name).cloned()
    }

    /// Identifiers of the published devices, in order.
    pub fn device_ids(&self) -> Vec<u32> {
        self.devices().keys().cloned().collect()
    }

    /// Number of published devices.
    pub fn len(&self) -> usize {
        self.devices().len()
    }

    /// Whether no device is published.
    pub fn is_empty(&self) -> bool {
        self.devices().is_empty()
    }
}
