// Copyright (C) 2023 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process vhost backends.
//!
//! This crate manages vhost backend types and the backend instances created from them:
//! - [VhostRegistry](struct.VhostRegistry.html) publishes every registered backend type through
//!   a general control surface and, when the type supports queue start/stop driven by an
//!   in-process front-end, through a privileged `<name>-kernel` surface.
//! - [VhostDev](struct.VhostDev.html) is one backend instance, with a device lock and one lock
//!   per virtqueue.
//! - [VhostKernelDev](struct.VhostKernelDev.html) is the exclusive claim an in-process front-end
//!   holds on a backend instance opened through the privileged surface.
//! - [EventSignal](struct.EventSignal.html) carries kick and call notifications across the
//!   attachment boundary.

#![deny(missing_docs)]

mod device;
pub use self::device::*;

mod iotlb;
pub use self::iotlb::*;

mod kernel;
pub use self::kernel::*;

pub mod loopback;

mod registry;
pub use self::registry::*;

mod signal;
pub use self::signal::*;

use std::io::Error as IOError;

pub use virtio_bindings::bindings::virtio_net::VIRTIO_F_VERSION_1;

/// Device can be used on a platform where device access to memory is limited and/or translated.
///
/// Not all versions of the virtio bindings carry it under this name.
pub const VIRTIO_F_ACCESS_PLATFORM: u32 = 33;

/// Read-only access to an IOTLB range.
pub const VHOST_ACCESS_RO: u8 = 0x1;
/// Write-only access to an IOTLB range.
pub const VHOST_ACCESS_WO: u8 = 0x2;
/// Read-write access to an IOTLB range.
pub const VHOST_ACCESS_RW: u8 = 0x3;

/// Error for vhost backend operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid parameter for the request.
    #[error("invalid vhost configuration.")]
    InvalidConfig,
    /// Virtqueue index out of range.
    #[error("invalid virtqueue index {0}.")]
    InvalidIndex(u32),
    /// The backend or one of its queues is in use.
    #[error("vhost device or resource busy.")]
    Busy,
    /// The caller is not allowed to issue the request.
    #[error("operation not permitted on vhost device.")]
    PermissionDenied,
    /// The backend is not in a state that allows the request.
    #[error("vhost device in invalid state.")]
    InvalidState,
    /// The request is not supported by the backend.
    #[error("unsupported vhost request.")]
    Unsupported,
    /// No backend published under the node name.
    #[error("no vhost node named {0}.")]
    NoDevice(String),
    /// Generic IO error.
    #[error("IO: {0}.")]
    IOError(#[from] IOError),
}

/// Specialized std::result::Result for vhost operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Identity of the party issuing control requests.
///
/// Owner checks compare the identity recorded by `VhostRequest::SetOwner` with the identity of
/// later callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OwnerId(pub u64);

impl OwnerId {
    /// Identity of the current process.
    pub fn current() -> Self {
        OwnerId(std::process::id() as u64)
    }
}
