// Copyright (C) 2023 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::btree_map::BTreeMap;

use crate::{Error, Result, VHOST_ACCESS_RW};

/// One translation entry covering `[start, last]`, both inclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IotlbMap {
    /// First IO virtual address covered.
    pub start: u64,
    /// Last IO virtual address covered.
    pub last: u64,
    /// Address `start` translates to.
    pub addr: u64,
    /// Access permission, a combination of `VHOST_ACCESS_RO` and `VHOST_ACCESS_WO`.
    pub perm: u8,
}

impl IotlbMap {
    fn contains(&self, iova: u64) -> bool {
        iova >= self.start && iova <= self.last
    }
}

/// IO virtual address translation table of a backend instance.
///
/// Entries never overlap. Inserting a range removes every entry it overlaps.
#[derive(Clone, Debug, Default)]
pub struct Iotlb {
    maps: BTreeMap<u64, IotlbMap>,
}

impl Iotlb {
    /// Creates an empty table.
    pub fn new() -> Self {
        Iotlb::default()
    }

    /// Maps `size` bytes starting at `iova` onto `uaddr`.
    ///
    /// The range is clamped to the end of the address space, so a size reaching past `u64::MAX`
    /// maps everything from `iova` upwards.
    pub fn update(&mut self, iova: u64, size: u64, uaddr: u64, perm: u8) -> Result<()> {
        if size == 0 {
            return Err(Error::InvalidConfig);
        }
        let last = iova.checked_add(size - 1).unwrap_or(u64::MAX);

        self.add_range(iova, last, uaddr, perm)
    }

    /// Maps the inclusive range `[start, last]` onto `addr`.
    pub fn add_range(&mut self, start: u64, last: u64, addr: u64, perm: u8) -> Result<()> {
        if last < start || perm == 0 || perm & !VHOST_ACCESS_RW != 0 {
            return Err(Error::InvalidConfig);
        }

        self.del_range(start, last);
        self.maps.insert(
            start,
            IotlbMap {
                start,
                last,
                addr,
                perm,
            },
        );

        Ok(())
    }

    /// Removes every entry overlapping `[start, last]`.
    pub fn del_range(&mut self, start: u64, last: u64) {
        let overlapped: Vec<u64> = self
            .maps
            .range(..=last)
            .filter(|(_, m)| m.last >= start)
            .map(|(k, _)| *k)
            .collect();
        for k in overlapped {
            self.maps.remove(&k);
        }
    }

    /// Finds the entry covering `iova`.
    pub fn lookup(&self, iova: u64) -> Option<&IotlbMap> {
        self.maps
            .range(..=iova)
            .next_back()
            .map(|(_, m)| m)
            .filter(|m| m.contains(iova))
    }

    /// Translates `len` bytes at `iova` with access `perm`.
    ///
    /// The whole range must be covered by a single entry granting `perm`.
    pub fn translate(&self, iova: u64, len: u64, perm: u8) -> Option<u64> {
        let map = self.lookup(iova)?;
        if map.perm & perm != perm {
            return None;
        }
        if len > 0 {
            let end = iova.checked_add(len - 1)?;
            if end > map.last {
                return None;
            }
        }

        Some(map.addr.wrapping_add(iova - map.start))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.maps.len()
    }

    /// Whether the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// Removes every entry.
    pub fn reset(&mut self) {
        self.maps.clear();
    }

    /// Iterates entries in address order.
    pub fn iter(&self) -> impl Iterator<Item = &IotlbMap> {
        self.maps.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{VHOST_ACCESS_RO, VHOST_ACCESS_WO};

    #[test]
    fn test_identity_full_range() {
        let mut tlb = Iotlb::new();
        tlb.add_range(0, u64::MAX, 0, VHOST_ACCESS_RW).unwrap();
        assert_eq!(tlb.len(), 1);
        let m = tlb.lookup(u64::MAX).unwrap();
        assert_eq!(m.start, 0);
        assert_eq!(m.last, u64::MAX);

        assert_eq!(tlb.translate(0x1000, 0x100, VHOST_ACCESS_RW), Some(0x1000));
        assert_eq!(tlb.translate(u64::MAX, 1, VHOST_ACCESS_RO), Some(u64::MAX));
    }

    #[test]
    fn test_update_invalid() {
        let mut tlb = Iotlb::new();
        assert!(matches!(
            tlb.update(0, 0, 0, VHOST_ACCESS_RW),
            Err(Error::InvalidConfig)
        ));
        assert!(matches!(tlb.update(0, 1, 0, 0), Err(Error::InvalidConfig)));
        assert!(matches!(tlb.update(0, 1, 0, 0x4), Err(Error::InvalidConfig)));
        assert!(matches!(
            tlb.add_range(2, 1, 0, VHOST_ACCESS_RW),
            Err(Error::InvalidConfig)
        ));
        // Clamped at the end of the address space.
        tlb.update(u64::MAX - 1, 16, 0, VHOST_ACCESS_RW).unwrap();
        assert_eq!(tlb.lookup(u64::MAX).unwrap().last, u64::MAX);
        tlb.reset();
        assert!(tlb.is_empty());
    }

    #[test]
    fn test_translate_and_permissions() {
        let mut tlb = Iotlb::new();
        tlb.update(0x1000, 0x1000, 0x8000, VHOST_ACCESS_RO).unwrap();
        tlb.update(0x3000, 0x1000, 0x9000, VHOST_ACCESS_WO).unwrap();

        assert_eq!(tlb.translate(0x1800, 0x10, VHOST_ACCESS_RO), Some(0x8800));
        assert_eq!(tlb.translate(0x1800, 0x10, VHOST_ACCESS_WO), None);
        assert_eq!(tlb.translate(0x3000, 0x1000, VHOST_ACCESS_WO), Some(0x9000));
        // Crosses the end of the entry.
        assert_eq!(tlb.translate(0x1ff0, 0x20, VHOST_ACCESS_RO), None);
        // Hole between entries.
        assert_eq!(tlb.translate(0x2000, 1, VHOST_ACCESS_RO), None);
        assert!(tlb.lookup(0xfff).is_none());
    }

    #[test]
    fn test_overlap_replaces() {
        let mut tlb = Iotlb::new();
        tlb.update(0x1000, 0x1000, 0x8000, VHOST_ACCESS_RW).unwrap();
        tlb.update(0x3000, 0x1000, 0x9000, VHOST_ACCESS_RW).unwrap();
        tlb.update(0x5000, 0x1000, 0xa000, VHOST_ACCESS_RW).unwrap();
        assert_eq!(tlb.len(), 3);

        tlb.update(0x1800, 0x2000, 0x0, VHOST_ACCESS_RW).unwrap();
        assert_eq!(tlb.len(), 2);
        assert_eq!(tlb.translate(0x1800, 1, VHOST_ACCESS_RW), Some(0));
        assert_eq!(tlb.translate(0x1000, 1, VHOST_ACCESS_RW), None);

        tlb.del_range(0x5fff, 0x5fff);
        assert_eq!(tlb.len(), 1);
        tlb.reset();
        assert!(tlb.is_empty());
    }
}
