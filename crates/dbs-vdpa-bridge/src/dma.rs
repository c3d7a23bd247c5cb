// Copyright (C) 2023 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! DMA operations of the loopback device.
//!
//! There is no IOMMU between the loopback device and its backend. The backend translates every
//! address through an identity mapping of the whole address space, so the DMA address of a
//! buffer is simply its host address and nothing needs to be tracked between map and unmap.

use log::{debug, error};
use vm_memory::{MmapRegion, VolatileMemory, VolatileSlice};

/// Bus address handed to the device.
pub type DmaAddr = u64;

/// Direction of a DMA transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DmaDirection {
    /// Device may read and write the buffer.
    Bidirectional,
    /// Device reads the buffer.
    ToDevice,
    /// Device writes the buffer.
    FromDevice,
}

/// Error for DMA operations.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum DmaError {
    /// The requested range is outside the buffer.
    #[error("DMA range out of buffer bounds.")]
    OutOfRange,
    /// Failed to allocate memory.
    #[error("failed to allocate DMA memory.")]
    NoMemory,
}

/// Specialized std::result::Result for DMA operations.
pub type DmaResult<T> = std::result::Result<T, DmaError>;

/// Coherent memory shared between the driver and the device.
///
/// Fresh buffers are always zero filled.
pub struct CoherentBuffer {
    region: MmapRegion,
}

impl CoherentBuffer {
    /// DMA address of the first byte.
    pub fn dma_addr(&self) -> DmaAddr {
        self.region.as_ptr() as DmaAddr
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.region.size()
    }

    /// Whether the buffer is empty. Never true for an allocated buffer.
    pub fn is_empty(&self) -> bool {
        self.region.size() == 0
    }

    /// Driver side view of the buffer.
    pub fn as_volatile_slice(&self) -> VolatileSlice {
        self.region.as_volatile_slice()
    }
}

/// DMA operations of a vDPA device.
pub trait DmaOps: Send + Sync {
    /// Maps `len` bytes at `offset` within `region` for the device.
    fn map(
        &self,
        region: &VolatileSlice,
        offset: usize,
        len: usize,
        dir: DmaDirection,
    ) -> DmaResult<DmaAddr>;

    /// Unmaps a range returned by `map()`.
    fn unmap(&self, addr: DmaAddr, len: usize, dir: DmaDirection);

    /// Allocates coherent memory.
    fn alloc_coherent(&self, size: usize) -> DmaResult<CoherentBuffer>;

    /// Frees coherent memory.
    fn free_coherent(&self, buf: CoherentBuffer);

    /// Addressing capability of the device.
    fn dma_mask(&self) -> u64;
}

/// Identity DMA operations.
#[derive(Clone, Debug, Default)]
pub struct LoopbackDma;

impl LoopbackDma {
    /// Creates the DMA operations.
    pub fn new() -> Self {
        LoopbackDma
    }

    /// Device side view of `len` bytes at `addr`.
    ///
    /// # Safety
    ///
    /// `addr` must come from `map()` or `alloc_coherent()` on this object, the range must lie
    /// within the mapped buffer and the buffer must outlive the returned slice.
    pub unsafe fn device_slice<'a>(&self, addr: DmaAddr, len: usize) -> VolatileSlice<'a> {
        VolatileSlice::new(addr as *mut u8, len)
    }
}

impl DmaOps for LoopbackDma {
    fn map(
        &self,
        region: &VolatileSlice,
        offset: usize,
        len: usize,
        _dir: DmaDirection,
    ) -> DmaResult<DmaAddr> {
        let end = offset.checked_add(len).ok_or(DmaError::OutOfRange)?;
        if end > region.len() {
            return Err(DmaError::OutOfRange);
        }

        Ok(region.as_ptr() as DmaAddr + offset as DmaAddr)
    }

    fn unmap(&self, _addr: DmaAddr, _len: usize, _dir: DmaDirection) {}

    fn alloc_coherent(&self, size: usize) -> DmaResult<CoherentBuffer> {
        if size == 0 {
            return Err(DmaError::NoMemory);
        }
        // Anonymous mappings are zero filled by the kernel.
        let region = MmapRegion::new(size).map_err(|e| {
            error!("vdpa: failed to allocate {} bytes of coherent memory, {}", size, e);
            DmaError::NoMemory
        })?;
        debug!(
            "vdpa: coherent buffer {:#x}, {} bytes",
            region.as_ptr() as u64,
            size
        );

        Ok(CoherentBuffer { region })
    }

    fn free_coherent(&self, buf: CoherentBuffer) {
        // Unmapped by MmapRegion's Drop.
        drop(buf);
    }

    fn dma_mask(&self) -> u64 {
        u64::MAX
    }
}

#[cfg(test)]
mod tests {
    use vm_memory::Bytes;

    use super::*;

    #[test]
    fn test_map_is_identity() {
        let dma = LoopbackDma::new();
        let mut backing = vec![0u8; 4096];
        let slice = unsafe { VolatileSlice::new(backing.as_mut_ptr(), backing.len()) };

        let addr = dma.map(&slice, 0x100, 0x10, DmaDirection::ToDevice).unwrap();
        assert_eq!(addr, backing.as_ptr() as u64 + 0x100);
        dma.unmap(addr, 0x10, DmaDirection::ToDevice);
        // Mapping the same range again gives the same address.
        assert_eq!(
            dma.map(&slice, 0x100, 0x10, DmaDirection::ToDevice).unwrap(),
            addr
        );
        assert_eq!(
            dma.map(&slice, 0, 4096, DmaDirection::Bidirectional)
                .unwrap(),
            backing.as_ptr() as u64
        );

        assert_eq!(
            dma.map(&slice, 4000, 97, DmaDirection::FromDevice),
            Err(DmaError::OutOfRange)
        );
        assert_eq!(
            dma.map(&slice, usize::MAX, 2, DmaDirection::FromDevice),
            Err(DmaError::OutOfRange)
        );

        // Both sides see the same bytes.
        let dev = unsafe { dma.device_slice(addr, 0x10) };
        dev.write_slice(&[0xab; 4], 0).unwrap();
        drop(slice);
        assert_eq!(&backing[0x100..0x104], &[0xab; 4]);
        assert_eq!(backing[0x104], 0);
    }

    #[test]
    fn test_contents_survive_unmap() {
        let dma = LoopbackDma::new();
        let mut backing = vec![0u8; 4096];
        let slice = unsafe { VolatileSlice::new(backing.as_mut_ptr(), backing.len()) };

        let first = dma.map(&slice, 0x200, 0x20, DmaDirection::FromDevice).unwrap();
        let dev = unsafe { dma.device_slice(first, 0x20) };
        dev.write_slice(&[0x11, 0x22, 0x33, 0x44], 0x8).unwrap();
        dma.unmap(first, 0x20, DmaDirection::FromDevice);

        let second = dma.map(&slice, 0x200, 0x20, DmaDirection::ToDevice).unwrap();
        let dev = unsafe { dma.device_slice(second, 0x20) };
        let mut got = [0u8; 4];
        dev.read_slice(&mut got, 0x8).unwrap();
        assert_eq!(got, [0x11, 0x22, 0x33, 0x44]);
        dma.unmap(second, 0x20, DmaDirection::ToDevice);

        // The driver reads the same bytes through its own view.
        let mut host = [0u8; 4];
        slice.read_slice(&mut host, 0x208).unwrap();
        assert_eq!(host, [0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn test_alloc_coherent() {
        let dma = LoopbackDma::new();
        assert!(matches!(dma.alloc_coherent(0), Err(DmaError::NoMemory)));
        assert_eq!(dma.dma_mask(), u64::MAX);

        let buf = dma.alloc_coherent(8192).unwrap();
        assert_eq!(buf.len(), 8192);
        assert!(!buf.is_empty());
        let mut out = vec![0xffu8; 8192];
        buf.as_volatile_slice().read_slice(&mut out, 0).unwrap();
        assert!(out.iter().all(|b| *b == 0));

        let dev = unsafe { dma.device_slice(buf.dma_addr(), 8192) };
        dev.write_slice(&[1, 2, 3, 4], 4096).unwrap();
        let mut got = [0u8; 4];
        buf.as_volatile_slice().read_slice(&mut got, 4096).unwrap();
        assert_eq!(got, [1, 2, 3, 4]);
        dma.free_coherent(buf);

        // A fresh allocation never exposes old contents.
        for _ in 0..4 {
            let buf = dma.alloc_coherent(8192).unwrap();
            let mut out = vec![0xffu8; 8192];
            buf.as_volatile_slice().read_slice(&mut out, 0).unwrap();
            assert!(out.iter().all(|b| *b == 0));
            buf.as_volatile_slice().write_slice(&[0x5a; 64], 0).unwrap();
            dma.free_coherent(buf);
        }
    }
}
