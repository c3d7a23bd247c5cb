// Copyright (C) 2023 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use crate::Result;

/// Callback installed by the consumer of a vDPA device.
pub type VdpaCallback = Arc<dyn Fn() + Send + Sync>;

/// Virtqueue state carried across a stop/start cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VdpaVqState {
    /// Next available ring index the device will process.
    pub avail_index: u16,
}

/// Control plane of a vDPA device, as seen by the virtio driver consuming it.
///
/// Queue indexes out of range fail with `Error::InvalidIndex`.
pub trait VdpaConfigOps: Send + Sync {
    /// Sets the descriptor table, driver area and device area of a queue.
    fn set_vq_address(&self, idx: u16, desc_area: u64, driver_area: u64, device_area: u64)
        -> Result<()>;

    /// Sets the size of a queue.
    fn set_vq_num(&self, idx: u16, num: u32) -> Result<()>;

    /// Notifies the device that buffers are available on a queue.
    ///
    /// Never takes the device lock, so it may be called from a queue callback.
    fn kick_vq(&self, idx: u16) -> Result<()>;

    /// Installs or removes the used-buffer callback of a queue.
    fn set_vq_cb(&self, idx: u16, cb: Option<VdpaCallback>) -> Result<()>;

    /// Enables or disables a queue.
    fn set_vq_ready(&self, idx: u16, ready: bool) -> Result<()>;

    /// Whether a queue is enabled.
    fn get_vq_ready(&self, idx: u16) -> Result<bool>;

    /// Sets the state a queue resumes from.
    fn set_vq_state(&self, idx: u16, state: &VdpaVqState) -> Result<()>;

    /// Gets the state of a queue.
    fn get_vq_state(&self, idx: u16) -> Result<VdpaVqState>;

    /// Alignment required for queue areas.
    fn get_vq_align(&self) -> u32;

    /// Features offered by the device.
    fn get_features(&self) -> u64;

    /// Features accepted by the driver.
    fn set_features(&self, features: u64) -> Result<()>;

    /// Installs or removes the config change callback.
    fn set_config_cb(&self, cb: Option<VdpaCallback>);

    /// Largest queue size supported.
    fn get_vq_num_max(&self) -> u16;

    /// Virtio device id.
    fn get_device_id(&self) -> u32;

    /// Virtio vendor id.
    fn get_vendor_id(&self) -> u32;

    /// Device status byte.
    fn get_status(&self) -> u8;

    /// Writes the device status byte.
    fn set_status(&self, status: u8);

    /// Resets the device.
    fn reset(&self) -> Result<()>;

    /// Size of the config space.
    fn get_config_size(&self) -> usize;

    /// Reads the config space at `offset`.
    fn get_config(&self, offset: usize, buf: &mut [u8]) -> Result<()>;

    /// Writes the config space at `offset`.
    fn set_config(&self, offset: usize, buf: &[u8]) -> Result<()>;

    /// Config space generation, bumped on every device-side update.
    fn get_generation(&self) -> u32 {
        0
    }
}
