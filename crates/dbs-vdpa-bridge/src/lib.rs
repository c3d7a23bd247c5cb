// Copyright (C) 2023 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Loopback vDPA device attached to an in-process vhost backend.
//!
//! A [VdpaBridge](struct.VdpaBridge.html) exposes the virtio device control plane (feature
//! bits, status byte, config space and virtqueue negotiation) to a single consumer. Once
//! attached to a backend instance opened through the privileged vhost surface, virtqueue
//! start/stop is forwarded to the backend, kicks reach the backend directly and calls are
//! delivered to the consumer from a deferred executor thread. Buffers are handed to the backend
//! through [LoopbackDma](struct.LoopbackDma.html), which identity maps process memory.

#![deny(missing_docs)]

mod bus;
pub use self::bus::*;

mod config;
pub use self::config::*;

mod config_ops;
pub use self::config_ops::*;

mod deferred;
pub use self::deferred::*;

mod device;
pub use self::device::*;

mod dma;
pub use self::dma::*;

mod notify;
pub use self::notify::*;

mod queue;
pub use self::queue::*;

/// Initial state after device initialization/reset.
pub const DEVICE_INIT: u8 = 0x0;
/// Indicates that the driver has found the device and recognized it as a valid virtio device.
pub const DEVICE_ACKNOWLEDGE: u8 = 0x01;
/// Indicates that the driver knows how to drive the device.
pub const DEVICE_DRIVER: u8 = 0x02;
/// Indicates that the driver is set up and ready to drive the device.
pub const DEVICE_DRIVER_OK: u8 = 0x04;
/// Indicates that the driver has acknowledged all the features it understands, and feature
/// negotiation is complete.
pub const DEVICE_FEATURES_OK: u8 = 0x08;
/// Indicates that something went wrong in the driver, and it has given up on the device.
pub const DEVICE_FAILED: u8 = 0x80;

/// Virtio network card device.
pub const TYPE_NET: u32 = 1;

/// Error for front-end control requests.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Invalid parameter, or the queue is ready.
    #[error("invalid vdpa configuration.")]
    InvalidConfig,
    /// Virtqueue index out of range.
    #[error("invalid virtqueue index.")]
    InvalidIndex,
    /// The device is already attached to a backend.
    #[error("vdpa device already attached.")]
    AlreadyAttached,
    /// The backend is claimed or in use.
    #[error("vhost backend busy.")]
    Busy,
    /// The caller or the backend handle is not allowed to perform the request.
    #[error("operation not permitted.")]
    PermissionDenied,
    /// Kick or call endpoints are missing on some queue.
    #[error("virtqueue notification endpoints not configured.")]
    NotConfigured,
    /// The device or the backend is not in a state that allows the request.
    #[error("vdpa device in invalid state.")]
    InvalidState,
    /// Config space access out of range.
    #[error("config space access out of range.")]
    OutOfRange,
    /// Request or feature not supported.
    #[error("unsupported vdpa request.")]
    Unsupported,
}

/// Specialized std::result::Result for front-end control requests.
pub type Result<T> = std::result::Result<T, Error>;

impl From<dbs_vhost::Error> for Error {
    fn from(e: dbs_vhost::Error) -> Self {
        match e {
            dbs_vhost::Error::InvalidConfig => Error::InvalidConfig,
            dbs_vhost::Error::InvalidIndex(_) => Error::InvalidIndex,
            dbs_vhost::Error::Busy => Error::Busy,
            dbs_vhost::Error::PermissionDenied => Error::PermissionDenied,
            dbs_vhost::Error::InvalidState => Error::InvalidState,
            dbs_vhost::Error::Unsupported => Error::Unsupported,
            dbs_vhost::Error::NoDevice(_) => Error::InvalidConfig,
            dbs_vhost::Error::IOError(_) => Error::InvalidState,
        }
    }
}

macro_rules! warn_or_panic {
    ($($arg:tt)*) => {
        if cfg!(test) {
            panic!($($arg)*)
        } else {
            log::warn!($($arg)*)
        }
    }
}
pub(crate) use warn_or_panic;
