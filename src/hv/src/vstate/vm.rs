// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::lock;
use super::memory::{GuestMemoryMap, MemoryFlags, MemoryMapping};
use super::vcpu::Vcpu;
use crate::backend::{Hypervisor, VcpuId};
use crate::error::{HvError, Result};
use crate::platform::Platform;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use vm_memory::MmapRegion;

/// Lifecycle of a virtual machine.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum VmState {
    /// Not yet known to the platform.
    Uncreated,
    Active,
    Destroyed,
}

/// Platform flags passed when creating a VM.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct VmOptions {
    pub flags: u64,
}

/// Platform flags passed when creating a VCPU.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct VcpuOptions {
    pub flags: u64,
}

/// State shared between a `Vm` and the VCPUs and interrupt handles created from it.
///
/// Lock order: `state`, then `vcpus`, then `memory`.
#[derive(Debug)]
pub(crate) struct VmInner {
    platform: Arc<Platform>,
    state: Mutex<VmState>,
    /// Live VCPUs and the generation each was created in. Platform ids are
    /// reused after a VCPU is destroyed, generations are not.
    vcpus: Mutex<HashMap<VcpuId, u64>>,
    next_generation: AtomicU64,
    memory: Mutex<GuestMemoryMap>,
}

impl VmInner {
    pub(crate) fn hv(&self) -> &dyn Hypervisor {
        self.platform.hv()
    }

    pub(crate) fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Returns the locked state if the VM is active.
    fn active(&self) -> Result<MutexGuard<'_, VmState>> {
        let state = lock(&self.state);
        let current = *state;
        if current == VmState::Active {
            Ok(state)
        } else {
            Err(HvError::invalid_state(format!(
                "virtual machine is {:?}, not active",
                current
            )))
        }
    }

    pub(crate) fn check_active(&self) -> Result<()> {
        self.active().map(|_| ())
    }

    pub(crate) fn is_live(&self, vcpu: VcpuId, generation: u64) -> bool {
        lock(&self.vcpus).get(&vcpu) == Some(&generation)
    }

    pub(crate) fn forget_vcpu(&self, vcpu: VcpuId) {
        lock(&self.vcpus).remove(&vcpu);
    }
}

impl Drop for VmInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if *state != VmState::Active {
            return;
        }
        match self.platform.hv().vm_destroy() {
            Ok(()) => {
                *state = VmState::Destroyed;
                self.platform.release_vm_slot();
                debug!("Released virtual machine on drop");
            }
            Err(e) => warn!("Failed to release virtual machine: {}", e),
        }
    }
}

/// The virtual machine of a platform.
///
/// At most one VM is active per platform at a time. `Vm` is `Send + Sync`;
/// map, unmap, protect and destroy may be called from any thread and are
/// serialized internally.
#[derive(Debug)]
pub struct Vm {
    inner: Arc<VmInner>,
}

impl Vm {
    pub fn create(platform: &Arc<Platform>) -> Result<Vm> {
        Vm::create_with(platform, VmOptions::default())
    }

    /// Creates the VM. Fails with a resource error, without reaching the
    /// platform, while another VM of `platform` is active.
    pub fn create_with(platform: &Arc<Platform>, options: VmOptions) -> Result<Vm> {
        platform.claim_vm_slot()?;
        let inner = VmInner {
            platform: platform.clone(),
            state: Mutex::new(VmState::Uncreated),
            vcpus: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            memory: Mutex::new(GuestMemoryMap::new(platform.page_size())),
        };
        if let Err(e) = platform.hv().vm_create(options.flags) {
            platform.release_vm_slot();
            return Err(e);
        }
        *lock(&inner.state) = VmState::Active;
        debug!("Created virtual machine on the {} platform", platform.name());
        Ok(Vm {
            inner: Arc::new(inner),
        })
    }

    pub fn platform(&self) -> &Arc<Platform> {
        &self.inner.platform
    }

    pub fn state(&self) -> VmState {
        *lock(&self.inner.state)
    }

    /// Destroys the VM. Every VCPU must have been destroyed first.
    pub fn destroy(&self) -> Result<()> {
        let mut state = self.inner.active()?;
        let live = lock(&self.inner.vcpus).len();
        if live > 0 {
            return Err(HvError::invalid_state(format!(
                "cannot destroy the virtual machine while {} vcpu(s) are live",
                live
            )));
        }
        self.inner.hv().vm_destroy()?;
        lock(&self.inner.memory).clear();
        *state = VmState::Destroyed;
        self.inner.platform.release_vm_slot();
        debug!("Destroyed virtual machine");
        Ok(())
    }

    /// Sets the guest time-stamp counter baseline of every VCPU.
    pub fn sync_tsc(&self, tsc: u64) -> Result<()> {
        let _state = self.inner.active()?;
        self.inner.hv().vm_sync_tsc(tsc)
    }

    /// Maps `size` bytes of host memory at `host_addr` into the guest at `guest_addr`.
    ///
    /// # Safety
    ///
    /// The host range must stay valid and resident until it is unmapped or
    /// the VM is destroyed. Use [`Vm::map_region`] to have the VM keep the
    /// memory alive instead.
    pub unsafe fn map(
        &self,
        host_addr: *mut u8,
        guest_addr: u64,
        size: u64,
        flags: MemoryFlags,
    ) -> Result<()> {
        self.map_record(host_addr, guest_addr, size, flags, None)
    }

    /// Maps the whole of `region` into the guest at `guest_addr`. The VM holds
    /// on to `region` for as long as any part of it stays mapped.
    pub fn map_region(
        &self,
        region: Arc<MmapRegion>,
        guest_addr: u64,
        flags: MemoryFlags,
    ) -> Result<()> {
        let host_addr = region.as_ptr();
        let size = region.size() as u64;
        // Safety: the mapping record owns a reference to `region`.
        unsafe { self.map_record(host_addr, guest_addr, size, flags, Some(region)) }
    }

    unsafe fn map_record(
        &self,
        host_addr: *mut u8,
        guest_addr: u64,
        size: u64,
        flags: MemoryFlags,
        backing: Option<Arc<MmapRegion>>,
    ) -> Result<()> {
        let _state = self.inner.active()?;
        let mut memory = lock(&self.inner.memory);
        memory.check_map(host_addr as usize, guest_addr, size)?;
        self.inner.hv().vm_map(host_addr, guest_addr, size, flags)?;
        memory.insert(host_addr as usize, guest_addr, size, flags, backing);
        debug!(
            "Mapped host {:p} at guest {:#x}, {:#x} bytes, {:?}",
            host_addr, guest_addr, size, flags
        );
        Ok(())
    }

    /// Unmaps a guest range. The range must be fully covered by live mappings.
    pub fn unmap(&self, guest_addr: u64, size: u64) -> Result<()> {
        let _state = self.inner.active()?;
        let mut memory = lock(&self.inner.memory);
        memory.check_covered(guest_addr, size)?;
        self.inner.hv().vm_unmap(guest_addr, size)?;
        memory.remove(guest_addr, size)?;
        debug!("Unmapped guest {:#x}, {:#x} bytes", guest_addr, size);
        Ok(())
    }

    /// Changes the permissions of a guest range in place.
    pub fn protect(&self, guest_addr: u64, size: u64, flags: MemoryFlags) -> Result<()> {
        let _state = self.inner.active()?;
        let mut memory = lock(&self.inner.memory);
        memory.check_covered(guest_addr, size)?;
        self.inner.hv().vm_protect(guest_addr, size, flags)?;
        memory.protect(guest_addr, size, flags)?;
        debug!(
            "Protected guest {:#x}, {:#x} bytes as {:?}",
            guest_addr, size, flags
        );
        Ok(())
    }

    /// Live mappings ordered by guest address.
    pub fn mappings(&self) -> Vec<MemoryMapping> {
        lock(&self.inner.memory).mappings()
    }

    /// Number of VCPUs not yet destroyed.
    pub fn vcpu_count(&self) -> usize {
        lock(&self.inner.vcpus).len()
    }

    /// Creates a VCPU bound to the calling thread.
    pub fn create_vcpu(&self) -> Result<Vcpu> {
        self.create_vcpu_with(VcpuOptions::default())
    }

    pub fn create_vcpu_with(&self, options: VcpuOptions) -> Result<Vcpu> {
        let _state = self.inner.active()?;
        let id = self.inner.hv().vcpu_create(options.flags)?;
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.vcpus).insert(id, generation);
        debug!("Created vcpu {} (generation {})", id, generation);
        Ok(Vcpu::new(self.inner.clone(), id, generation))
    }

    pub(crate) fn inner(&self) -> &Arc<VmInner> {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x86_64::msr::MSR_IA32_TSC;
    use crate::backend::mock::MockConfig;
    use crate::error::ErrorKind;

    fn region(size: usize) -> Arc<MmapRegion> {
        Arc::new(MmapRegion::new(size).unwrap())
    }

    #[test]
    fn test_single_active_vm() {
        let platform = Platform::mock(MockConfig::default());
        let vm = Vm::create(&platform).unwrap();
        assert_eq!(vm.state(), VmState::Active);

        let err = Vm::create(&platform).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resource);

        vm.destroy().unwrap();
        assert_eq!(vm.state(), VmState::Destroyed);
        assert_eq!(vm.destroy().unwrap_err().kind(), ErrorKind::InvalidState);

        let again = Vm::create(&platform).unwrap();
        assert_eq!(again.state(), VmState::Active);
    }

    #[test]
    fn test_drop_releases_vm() {
        let platform = Platform::mock(MockConfig::default());
        drop(Vm::create(&platform).unwrap());
        Vm::create(&platform).unwrap();
    }

    #[test]
    fn test_operations_after_destroy() {
        let platform = Platform::mock(MockConfig::default());
        let vm = Vm::create(&platform).unwrap();
        vm.destroy().unwrap();

        let page = platform.page_size();
        assert_eq!(
            vm.map_region(region(page), 0, MemoryFlags::all())
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidState
        );
        assert_eq!(vm.create_vcpu().unwrap_err().kind(), ErrorKind::InvalidState);
        assert_eq!(vm.sync_tsc(0).unwrap_err().kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_map_region_keeps_memory() {
        let platform = Platform::mock(MockConfig::default());
        let vm = Vm::create(&platform).unwrap();
        let page = platform.page_size();
        let mem = region(2 * page);

        vm.map_region(mem.clone(), 0x10_0000, MemoryFlags::READ | MemoryFlags::WRITE)
            .unwrap();
        assert_eq!(Arc::strong_count(&mem), 2);

        let mappings = vm.mappings();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].guest_addr, 0x10_0000);
        assert_eq!(mappings[0].host_addr, mem.as_ptr() as usize);

        // the reference is held until the last piece goes away
        vm.unmap(0x10_0000, page as u64).unwrap();
        assert_eq!(Arc::strong_count(&mem), 2);
        vm.unmap(0x10_0000 + page as u64, page as u64).unwrap();
        assert_eq!(Arc::strong_count(&mem), 1);
    }

    #[test]
    fn test_rejected_map_leaves_state() {
        let platform = Platform::mock(MockConfig::default());
        let vm = Vm::create(&platform).unwrap();
        let page = platform.page_size();

        // size that is not a page multiple
        assert_eq!(
            vm.map_region(region(page + 1), 0, MemoryFlags::all())
                .unwrap_err()
                .kind(),
            ErrorKind::BadArgument
        );
        assert!(vm.mappings().is_empty());
        assert!(vm.unmap(0, page as u64).is_err());
        assert!(vm.protect(0, page as u64, MemoryFlags::READ).is_err());
    }

    #[test]
    fn test_protect() {
        let platform = Platform::mock(MockConfig::default());
        let vm = Vm::create(&platform).unwrap();
        let page = platform.page_size() as u64;
        vm.map_region(region(4 * page as usize), 0, MemoryFlags::all())
            .unwrap();

        vm.protect(page, 2 * page, MemoryFlags::READ).unwrap();
        let flags: Vec<MemoryFlags> = vm.mappings().iter().map(|m| m.flags).collect();
        assert_eq!(
            flags,
            vec![MemoryFlags::all(), MemoryFlags::READ, MemoryFlags::all()]
        );
        assert_eq!(vm.mappings()[1].size, 2 * page);
    }

    #[test]
    fn test_sync_tsc() {
        let platform = Platform::mock(MockConfig::default());
        let vm = Vm::create(&platform).unwrap();
        let early = vm.create_vcpu().unwrap();
        early.enable_native_msr(MSR_IA32_TSC, true).unwrap();
        early.write_msr(MSR_IA32_TSC, 0x5000).unwrap();
        assert_eq!(early.read_msr(MSR_IA32_TSC).unwrap(), 0x5000);

        vm.sync_tsc(0x1000).unwrap();
        assert_eq!(early.read_msr(MSR_IA32_TSC).unwrap(), 0x1000);
        vm.sync_tsc(0x1000).unwrap();
        assert_eq!(early.read_msr(MSR_IA32_TSC).unwrap(), 0x1000);

        // vcpus created later start from the same baseline
        let late = vm.create_vcpu().unwrap();
        late.enable_native_msr(MSR_IA32_TSC, true).unwrap();
        assert_eq!(late.read_msr(MSR_IA32_TSC).unwrap(), 0x1000);
    }
}
