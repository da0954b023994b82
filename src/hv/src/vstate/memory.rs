// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::error::{HvError, Result};
use crate::utils::util::is_aligned;
use std::collections::BTreeMap;
use std::sync::Arc;
use vm_memory::MmapRegion;

bitflags::bitflags! {
    /// Guest access permissions of a mapping, using the platform's bit values.
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
    pub struct MemoryFlags: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

/// Snapshot of one live host-virtual to guest-physical mapping.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MemoryMapping {
    pub guest_addr: u64,
    pub host_addr: usize,
    pub size: u64,
    pub flags: MemoryFlags,
}

impl MemoryMapping {
    pub fn guest_end(&self) -> u64 {
        self.guest_addr + self.size
    }
}

#[derive(Debug, Clone)]
struct Record {
    host_addr: usize,
    size: u64,
    flags: MemoryFlags,
    /// Keeps host memory handed over through `Vm::map_region` alive while mapped.
    backing: Option<Arc<MmapRegion>>,
}

impl Record {
    /// Part of this record starting `offset` bytes in, `size` bytes long.
    fn slice(&self, offset: u64, size: u64) -> Record {
        Record {
            host_addr: self.host_addr + offset as usize,
            size,
            flags: self.flags,
            backing: self.backing.clone(),
        }
    }
}

/// Registry of live guest-physical mappings.
///
/// Records never overlap. Unmap and protect may address any range covered
/// by live records without gaps; partially affected records are split.
#[derive(Debug)]
pub(crate) struct GuestMemoryMap {
    records: BTreeMap<u64, Record>,
    page_size: u64,
}

impl GuestMemoryMap {
    pub(crate) fn new(page_size: usize) -> Self {
        GuestMemoryMap {
            records: BTreeMap::new(),
            page_size: page_size as u64,
        }
    }

    /// Validates a guest range and returns its exclusive end.
    pub(crate) fn check_range(&self, guest_addr: u64, size: u64) -> Result<u64> {
        if size == 0 {
            return Err(HvError::bad_argument("mapping size must be non-zero"));
        }
        if !is_aligned(guest_addr, self.page_size) || !is_aligned(size, self.page_size) {
            return Err(HvError::bad_argument(format!(
                "guest range {:#x}+{:#x} is not aligned to the {:#x} byte page size",
                guest_addr, size, self.page_size
            )));
        }
        guest_addr.checked_add(size).ok_or_else(|| {
            HvError::bad_argument(format!(
                "guest range {:#x}+{:#x} overflows the address space",
                guest_addr, size
            ))
        })
    }

    /// Validates a new mapping against the registry without changing it.
    pub(crate) fn check_map(&self, host_addr: usize, guest_addr: u64, size: u64) -> Result<()> {
        let end = self.check_range(guest_addr, size)?;
        if host_addr == 0 || !is_aligned(host_addr as u64, self.page_size) {
            return Err(HvError::bad_argument(format!(
                "host address {:#x} is null or not page aligned",
                host_addr
            )));
        }
        if let Some((&start, record)) = self.records.range(..end).next_back() {
            if start + record.size > guest_addr {
                return Err(HvError::bad_argument(format!(
                    "guest range {:#x}..{:#x} overlaps the mapping at {:#x}..{:#x}",
                    guest_addr,
                    end,
                    start,
                    start + record.size
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn insert(
        &mut self,
        host_addr: usize,
        guest_addr: u64,
        size: u64,
        flags: MemoryFlags,
        backing: Option<Arc<MmapRegion>>,
    ) {
        self.records.insert(
            guest_addr,
            Record {
                host_addr,
                size,
                flags,
                backing,
            },
        );
    }

    /// Checks that `guest_addr..guest_addr + size` is covered by live mappings.
    pub(crate) fn check_covered(&self, guest_addr: u64, size: u64) -> Result<()> {
        let end = self.check_range(guest_addr, size)?;
        let not_mapped = || {
            HvError::bad_argument(format!(
                "guest range {:#x}..{:#x} is not backed by a live mapping",
                guest_addr, end
            ))
        };
        let (&first, record) = self
            .records
            .range(..=guest_addr)
            .next_back()
            .ok_or_else(not_mapped)?;
        let mut cursor = first + record.size;
        if cursor <= guest_addr {
            return Err(not_mapped());
        }
        while cursor < end {
            let record = self.records.get(&cursor).ok_or_else(not_mapped)?;
            cursor += record.size;
        }
        Ok(())
    }

    /// Removes `guest_addr..end` from the registry, keeping the parts of
    /// partially covered records that lie outside of it. Returns the removed
    /// pieces keyed by guest address.
    fn carve(&mut self, guest_addr: u64, end: u64) -> Vec<(u64, Record)> {
        let starts: Vec<u64> = self
            .records
            .range(..end)
            .filter(|(start, record)| **start + record.size > guest_addr)
            .map(|(start, _)| *start)
            .collect();

        let mut removed = Vec::with_capacity(starts.len());
        for start in starts {
            let record = match self.records.remove(&start) {
                Some(record) => record,
                None => continue,
            };
            let record_end = start + record.size;
            let lo = start.max(guest_addr);
            let hi = record_end.min(end);
            if start < lo {
                self.records.insert(start, record.slice(0, lo - start));
            }
            if hi < record_end {
                self.records
                    .insert(hi, record.slice(hi - start, record_end - hi));
            }
            removed.push((lo, record.slice(lo - start, hi - lo)));
        }
        removed
    }

    /// Drops `guest_addr..guest_addr + size`. The range must be covered.
    pub(crate) fn remove(&mut self, guest_addr: u64, size: u64) -> Result<()> {
        self.check_covered(guest_addr, size)?;
        self.carve(guest_addr, guest_addr + size);
        Ok(())
    }

    /// Changes the permissions of `guest_addr..guest_addr + size` in place.
    pub(crate) fn protect(&mut self, guest_addr: u64, size: u64, flags: MemoryFlags) -> Result<()> {
        self.check_covered(guest_addr, size)?;
        for (start, mut record) in self.carve(guest_addr, guest_addr + size) {
            record.flags = flags;
            self.records.insert(start, record);
        }
        Ok(())
    }

    /// Resolves a guest-physical address to its host address and permissions.
    pub(crate) fn translate(&self, guest_addr: u64) -> Option<(usize, MemoryFlags)> {
        let (&start, record) = self.records.range(..=guest_addr).next_back()?;
        let offset = guest_addr - start;
        if offset >= record.size {
            return None;
        }
        Some((record.host_addr + offset as usize, record.flags))
    }

    pub(crate) fn clear(&mut self) {
        self.records.clear();
    }

    pub(crate) fn mappings(&self) -> Vec<MemoryMapping> {
        self.records
            .iter()
            .map(|(&guest_addr, record)| MemoryMapping {
                guest_addr,
                host_addr: record.host_addr,
                size: record.size,
                flags: record.flags,
            })
            .collect()
    }
}
