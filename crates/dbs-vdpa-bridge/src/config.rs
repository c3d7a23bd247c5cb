// Copyright (C) 2023 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use byteorder::{LittleEndian, WriteBytesExt};
use dbs_vhost::VIRTIO_F_ACCESS_PLATFORM;
use log::error;
use serde::Deserialize;
use virtio_bindings::bindings::virtio_net::{VIRTIO_F_VERSION_1, VIRTIO_NET_S_LINK_UP};

use crate::{Error, Result, TYPE_NET};

/// Size of the virtio-net config space.
pub const NET_CONFIG_SPACE_SIZE: usize = 24;

/// Largest queue size allowed for split virtqueues.
pub const MAX_QUEUE_SIZE: u16 = 32768;

const SPEED_UNKNOWN: u32 = 0xffff_ffff;
const DUPLEX_UNKNOWN: u8 = 0xff;

/// Configuration of a loopback vDPA device.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VdpaBridgeConfig {
    /// Virtio device id.
    pub device_id: u32,
    /// Virtio vendor id.
    pub vendor_id: u32,
    /// Number of virtqueues.
    pub num_queues: usize,
    /// Largest queue size.
    pub vq_num_max: u16,
    /// Required alignment of queue areas.
    pub vq_align: u32,
    /// MAC address reported in the config space.
    pub mac: [u8; 6],
    /// MTU reported in the config space.
    pub mtu: u16,
    /// Number of queue pairs reported in the config space.
    pub max_vq_pairs: u16,
    /// Features offered to the driver.
    pub features: u64,
}

impl Default for VdpaBridgeConfig {
    fn default() -> Self {
        VdpaBridgeConfig {
            device_id: TYPE_NET,
            vendor_id: 0,
            num_queues: 2,
            vq_num_max: 256,
            vq_align: 4096,
            mac: [0; 6],
            mtu: 1500,
            max_vq_pairs: 1,
            features: (1u64 << VIRTIO_F_ACCESS_PLATFORM) | (1u64 << VIRTIO_F_VERSION_1),
        }
    }
}

impl VdpaBridgeConfig {
    /// Checks the configuration is usable.
    ///
    /// Buffers are handed to the backend by host address, so `VIRTIO_F_ACCESS_PLATFORM` must
    /// be offered.
    pub fn validate(&self) -> Result<()> {
        if self.num_queues == 0 || self.num_queues > u16::MAX as usize {
            error!("vdpa: invalid number of queues {}", self.num_queues);
            return Err(Error::InvalidConfig);
        }
        if self.vq_num_max == 0
            || self.vq_num_max > MAX_QUEUE_SIZE
            || !self.vq_num_max.is_power_of_two()
        {
            error!("vdpa: invalid max queue size {}", self.vq_num_max);
            return Err(Error::InvalidConfig);
        }
        if self.vq_align == 0 || !self.vq_align.is_power_of_two() {
            error!("vdpa: invalid queue alignment {}", self.vq_align);
            return Err(Error::InvalidConfig);
        }
        if self.features & (1u64 << VIRTIO_F_ACCESS_PLATFORM) == 0 {
            error!("vdpa: VIRTIO_F_ACCESS_PLATFORM must be offered");
            return Err(Error::InvalidConfig);
        }

        Ok(())
    }

    /// Initial contents of the config space.
    pub fn config_space(&self) -> Vec<u8> {
        if self.device_id != TYPE_NET {
            return Vec::new();
        }

        let mut space = Vec::with_capacity(NET_CONFIG_SPACE_SIZE);
        space.extend_from_slice(&self.mac);
        // Writing to a Vec never fails.
        let _ = space.write_u16::<LittleEndian>(VIRTIO_NET_S_LINK_UP as u16);
        let _ = space.write_u16::<LittleEndian>(self.max_vq_pairs);
        let _ = space.write_u16::<LittleEndian>(self.mtu);
        let _ = space.write_u32::<LittleEndian>(SPEED_UNKNOWN);
        space.push(DUPLEX_UNKNOWN);
        // rss_max_key_size, rss_max_indirection_table_length and supported_hash_types.
        space.push(0);
        let _ = space.write_u16::<LittleEndian>(0);
        let _ = space.write_u32::<LittleEndian>(0);

        space
    }
}
