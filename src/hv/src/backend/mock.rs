// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process stand-in for the host virtualization facility.
//!
//! `MockHypervisor` enforces the same contract as the native platform (one
//! VM, bounded VCPU count, page-aligned non-overlapping mappings, fixed FP
//! state size, per-thread VCPU ownership) so the layers above it can be
//! exercised on any host. Its `vcpu_run` models a guest that:
//!
//! * exits with `IRQ` when an interrupt is pending,
//! * exits with `EPT_VIOLATION` when RIP is not in executable guest memory,
//! * exits with `HLT` when the byte at RIP is `0xf4`,
//! * otherwise spins until some other thread interrupts it.
//!
//! The exit reason is left in `VmcsField::RO_EXIT_REASON`, and the APIC
//! address set through the VMX interface in `VmcsField::CTRL_APIC_ACCESS`.
//! VCPU ids are reused lowest first once destroyed, like the native platform.

use super::{Hypervisor, VcpuId};
use crate::arch::x86_64::msr::{
    MSR_EFER, MSR_IA32_APIC_BASE, MSR_IA32_CR_PAT, MSR_IA32_MISC_ENABLE, MSR_IA32_TSC,
    MSR_MTRR_DEF_TYPE,
};
use crate::arch::x86_64::regs::REGISTERS_MAX;
use crate::arch::x86_64::vmcs::exit_reason;
use crate::arch::x86_64::{Register, VmcsField, VmxCapability};
use crate::error::{
    check, ErrorKind, HvError, Result, HV_BAD_ARGUMENT, HV_BUSY, HV_NO_RESOURCES, HV_UNSUPPORTED,
};
use crate::vstate::memory::{GuestMemoryMap, MemoryFlags};
use crate::vstate::vcpu::fpstate::{self, FpState};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Instant;

const HLT_OPCODE: u8 = 0xf4;
const RFLAGS_RESERVED: u64 = 0x2;

/// MSRs the platform emulates itself; always accessible.
const BUILTIN_MSRS: [u32; 5] = [
    MSR_IA32_APIC_BASE,
    MSR_IA32_MISC_ENABLE,
    MSR_IA32_CR_PAT,
    MSR_MTRR_DEF_TYPE,
    MSR_EFER,
];

/// Behavior knobs of the mock platform.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MockConfig {
    /// VCPUs the platform hands out before reporting `No resources`.
    pub max_vcpus: u32,
    /// Whether the VMX-specific interface is present.
    pub vmx: bool,
}

impl Default for MockConfig {
    fn default() -> Self {
        MockConfig {
            max_vcpus: 8,
            vmx: true,
        }
    }
}

#[derive(Debug)]
struct MockVcpu {
    owner: ThreadId,
    regs: [u64; REGISTERS_MAX],
    msrs: HashMap<u32, u64>,
    native_msrs: HashSet<u32>,
    fpstate: FpState,
    vmcs: HashMap<u32, u64>,
    interrupt_pending: bool,
    exec_time: u64,
}

impl MockVcpu {
    fn new(tsc: u64) -> Self {
        let mut regs = [0u64; REGISTERS_MAX];
        regs[Register::Rflags as usize] = RFLAGS_RESERVED;
        let mut msrs = HashMap::new();
        msrs.insert(MSR_IA32_TSC, tsc);
        MockVcpu {
            owner: thread::current().id(),
            regs,
            msrs,
            native_msrs: HashSet::new(),
            fpstate: FpState::default(),
            vmcs: HashMap::new(),
            interrupt_pending: false,
            exec_time: 0,
        }
    }

    fn set_exit(&mut self, reason: u64) {
        self.vmcs.insert(VmcsField::RO_EXIT_REASON.encoding(), reason);
    }
}

#[derive(Debug)]
struct MockState {
    vm_active: bool,
    memory: GuestMemoryMap,
    tsc: u64,
    vcpus: HashMap<VcpuId, MockVcpu>,
}

/// Test double of the platform. See the module documentation.
#[derive(Debug)]
pub struct MockHypervisor {
    config: MockConfig,
    state: Mutex<MockState>,
    kick: Condvar,
}

impl MockHypervisor {
    pub fn new(config: MockConfig, page_size: usize) -> Self {
        MockHypervisor {
            config,
            state: Mutex::new(MockState {
                vm_active: false,
                memory: GuestMemoryMap::new(page_size),
                tsc: 0,
                vcpus: HashMap::new(),
            }),
            kick: Condvar::new(),
        }
    }

    /// Number of VCPUs the platform currently holds.
    pub fn vcpu_count(&self) -> usize {
        self.lock().vcpus.len()
    }

    /// Whether the platform currently holds a VM.
    pub fn vm_active(&self) -> bool {
        self.lock().vm_active
    }

    /// APIC page address last set for `vcpu`.
    pub fn apic_address(&self, vcpu: VcpuId) -> Option<u64> {
        self.lock()
            .vcpus
            .get(&vcpu)
            .and_then(|v| v.vmcs.get(&VmcsField::CTRL_APIC_ACCESS.encoding()).copied())
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn require_vm(state: &MockState) -> Result<()> {
        if state.vm_active {
            Ok(())
        } else {
            Err(HvError::bad_argument("no virtual machine exists"))
        }
    }

    fn require_vmx(&self) -> Result<()> {
        if self.config.vmx {
            Ok(())
        } else {
            check(HV_UNSUPPORTED)
        }
    }

    /// Looks up `vcpu` and verifies it is used from the thread that created it.
    fn vcpu_mut(state: &mut MockState, vcpu: VcpuId) -> Result<&mut MockVcpu> {
        let entry = state
            .vcpus
            .get_mut(&vcpu)
            .ok_or_else(|| HvError::bad_argument(format!("vcpu {} does not exist", vcpu)))?;
        if entry.owner != thread::current().id() {
            return Err(HvError::new(
                ErrorKind::BadArgument,
                HV_BAD_ARGUMENT,
                format!("vcpu {} used from a thread other than its creator", vcpu),
            ));
        }
        Ok(entry)
    }

    fn with_vcpu<T>(&self, vcpu: VcpuId, f: impl FnOnce(&mut MockVcpu) -> Result<T>) -> Result<T> {
        let mut state = self.lock();
        f(Self::vcpu_mut(&mut state, vcpu)?)
    }

    fn check_msr(vcpu: &MockVcpu, msr: u32) -> Result<()> {
        if BUILTIN_MSRS.contains(&msr) || vcpu.native_msrs.contains(&msr) {
            Ok(())
        } else {
            Err(HvError::bad_argument(format!(
                "msr {:#x} is not enabled for native access",
                msr
            )))
        }
    }

    /// Decides the exit for a guest about to execute at RIP, or `None` if
    /// the guest keeps running until interrupted.
    fn immediate_exit(memory: &GuestMemoryMap, vcpu: &MockVcpu) -> Option<u64> {
        let rip = vcpu.regs[Register::Rip as usize];
        match memory.translate(rip) {
            Some((host_addr, flags)) if flags.contains(MemoryFlags::EXEC) => {
                // Safety: the mapping contract keeps host memory valid while mapped.
                let opcode = unsafe { std::ptr::read_volatile(host_addr as *const u8) };
                if opcode == HLT_OPCODE {
                    Some(exit_reason::HLT)
                } else {
                    None
                }
            }
            _ => Some(exit_reason::EPT_VIOLATION),
        }
    }
}

impl Hypervisor for MockHypervisor {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn vm_create(&self, _flags: u64) -> Result<()> {
        let mut state = self.lock();
        if state.vm_active {
            return check(HV_BUSY);
        }
        state.vm_active = true;
        Ok(())
    }

    fn vm_destroy(&self) -> Result<()> {
        let mut state = self.lock();
        Self::require_vm(&state)?;
        if !state.vcpus.is_empty() {
            return check(HV_BUSY);
        }
        state.vm_active = false;
        state.memory.clear();
        state.tsc = 0;
        Ok(())
    }

    unsafe fn vm_map(&self, uva: *mut u8, gpa: u64, size: u64, flags: MemoryFlags) -> Result<()> {
        let mut state = self.lock();
        Self::require_vm(&state)?;
        state.memory.check_map(uva as usize, gpa, size)?;
        state.memory.insert(uva as usize, gpa, size, flags, None);
        Ok(())
    }

    fn vm_unmap(&self, gpa: u64, size: u64) -> Result<()> {
        let mut state = self.lock();
        Self::require_vm(&state)?;
        state.memory.remove(gpa, size)
    }

    fn vm_protect(&self, gpa: u64, size: u64, flags: MemoryFlags) -> Result<()> {
        let mut state = self.lock();
        Self::require_vm(&state)?;
        state.memory.protect(gpa, size, flags)
    }

    fn vm_sync_tsc(&self, tsc: u64) -> Result<()> {
        let mut state = self.lock();
        Self::require_vm(&state)?;
        state.tsc = tsc;
        for vcpu in state.vcpus.values_mut() {
            vcpu.msrs.insert(MSR_IA32_TSC, tsc);
        }
        Ok(())
    }

    fn vcpu_create(&self, _flags: u64) -> Result<VcpuId> {
        let mut state = self.lock();
        Self::require_vm(&state)?;
        // ids of destroyed vcpus are handed out again, lowest first
        let id = (0..self.config.max_vcpus)
            .find(|id| !state.vcpus.contains_key(id))
            .ok_or_else(|| HvError::from_code(HV_NO_RESOURCES))?;
        let tsc = state.tsc;
        state.vcpus.insert(id, MockVcpu::new(tsc));
        Ok(id)
    }

    fn vcpu_destroy(&self, vcpu: VcpuId) -> Result<()> {
        let mut state = self.lock();
        Self::vcpu_mut(&mut state, vcpu)?;
        state.vcpus.remove(&vcpu);
        Ok(())
    }

    fn vcpu_read_register(&self, vcpu: VcpuId, reg: Register) -> Result<u64> {
        self.with_vcpu(vcpu, |v| {
            if reg == Register::Cr1 {
                return Err(HvError::from_code(HV_BAD_ARGUMENT));
            }
            Ok(v.regs[reg as usize])
        })
    }

    fn vcpu_write_register(&self, vcpu: VcpuId, reg: Register, value: u64) -> Result<()> {
        self.with_vcpu(vcpu, |v| {
            if reg == Register::Cr1 {
                return check(HV_BAD_ARGUMENT);
            }
            v.regs[reg as usize] = value;
            Ok(())
        })
    }

    fn vcpu_read_fpstate(&self, vcpu: VcpuId, buffer: &mut [u8]) -> Result<()> {
        self.with_vcpu(vcpu, |v| {
            fpstate::check_len(buffer.len())?;
            buffer.copy_from_slice(v.fpstate.as_bytes());
            Ok(())
        })
    }

    fn vcpu_write_fpstate(&self, vcpu: VcpuId, buffer: &[u8]) -> Result<()> {
        self.with_vcpu(vcpu, |v| {
            fpstate::check_len(buffer.len())?;
            v.fpstate.as_bytes_mut().copy_from_slice(buffer);
            Ok(())
        })
    }

    fn vcpu_enable_native_msr(&self, vcpu: VcpuId, msr: u32, enable: bool) -> Result<()> {
        self.with_vcpu(vcpu, |v| {
            if enable {
                v.native_msrs.insert(msr);
            } else {
                v.native_msrs.remove(&msr);
            }
            Ok(())
        })
    }

    fn vcpu_read_msr(&self, vcpu: VcpuId, msr: u32) -> Result<u64> {
        self.with_vcpu(vcpu, |v| {
            Self::check_msr(v, msr)?;
            Ok(v.msrs.get(&msr).copied().unwrap_or(0))
        })
    }

    fn vcpu_write_msr(&self, vcpu: VcpuId, msr: u32, value: u64) -> Result<()> {
        self.with_vcpu(vcpu, |v| {
            Self::check_msr(v, msr)?;
            v.msrs.insert(msr, value);
            Ok(())
        })
    }

    fn vcpu_flush(&self, vcpu: VcpuId) -> Result<()> {
        self.with_vcpu(vcpu, |_| Ok(()))
    }

    fn vcpu_invalidate_tlb(&self, vcpu: VcpuId) -> Result<()> {
        self.with_vcpu(vcpu, |_| Ok(()))
    }

    fn vcpu_run(&self, vcpu: VcpuId) -> Result<()> {
        let start = Instant::now();
        let mut state = self.lock();
        Self::vcpu_mut(&mut state, vcpu)?;

        let reason = loop {
            let st = &mut *state;
            let current = st
                .vcpus
                .get_mut(&vcpu)
                .ok_or_else(|| HvError::bad_argument(format!("vcpu {} vanished", vcpu)))?;
            if current.interrupt_pending {
                current.interrupt_pending = false;
                break exit_reason::IRQ;
            }
            if let Some(reason) = Self::immediate_exit(&st.memory, current) {
                break reason;
            }
            state = self
                .kick
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        };

        let elapsed = start.elapsed().as_nanos().max(1) as u64;
        let current = Self::vcpu_mut(&mut state, vcpu)?;
        current.set_exit(reason);
        current.exec_time += elapsed;
        Ok(())
    }

    fn vcpu_interrupt(&self, vcpus: &[VcpuId]) -> Result<()> {
        let mut state = self.lock();
        if vcpus.is_empty() || vcpus.iter().any(|id| !state.vcpus.contains_key(id)) {
            return check(HV_BAD_ARGUMENT);
        }
        for id in vcpus {
            if let Some(vcpu) = state.vcpus.get_mut(id) {
                vcpu.interrupt_pending = true;
            }
        }
        self.kick.notify_all();
        Ok(())
    }

    fn vcpu_get_exec_time(&self, vcpu: VcpuId) -> Result<u64> {
        self.with_vcpu(vcpu, |v| Ok(v.exec_time))
    }

    fn vmx_supported(&self) -> bool {
        self.config.vmx
    }

    fn vmx_read_capability(&self, cap: VmxCapability) -> Result<u64> {
        self.require_vmx()?;
        Ok(match cap {
            VmxCapability::PinBased => 0x0000_007f_0000_0016,
            VmxCapability::ProcBased => 0xfff9_fffe_0401_e172,
            VmxCapability::ProcBased2 => 0x0000_00ff_0000_0000,
            VmxCapability::Entry => 0x0000_f3ff_0000_11ff,
            VmxCapability::Exit => 0x007f_ffff_0003_6dff,
            VmxCapability::PreemptionTimer => 0x0000_0000_0000_0005,
        })
    }

    fn vmx_vcpu_read_vmcs(&self, vcpu: VcpuId, field: VmcsField) -> Result<u64> {
        self.require_vmx()?;
        self.with_vcpu(vcpu, |v| Ok(v.vmcs.get(&field.encoding()).copied().unwrap_or(0)))
    }

    fn vmx_vcpu_write_vmcs(&self, vcpu: VcpuId, field: VmcsField, value: u64) -> Result<()> {
        self.require_vmx()?;
        self.with_vcpu(vcpu, |v| {
            if field.is_read_only() {
                return Err(HvError::bad_argument(format!(
                    "{:?} is a read-only field",
                    field
                )));
            }
            v.vmcs.insert(field.encoding(), value);
            Ok(())
        })
    }

    fn vmx_vcpu_set_apic_address(&self, vcpu: VcpuId, gpa: u64) -> Result<()> {
        self.require_vmx()?;
        self.with_vcpu(vcpu, |v| {
            v.vmcs.insert(VmcsField::CTRL_APIC_ACCESS.encoding(), gpa);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    const PAGE: usize = 0x1000;

    fn mock_with_vm(config: MockConfig) -> MockHypervisor {
        let hv = MockHypervisor::new(config, PAGE);
        hv.vm_create(0).unwrap();
        hv
    }

    #[test]
    fn test_vm_lifecycle() {
        let hv = MockHypervisor::new(MockConfig::default(), PAGE);
        assert!(!hv.vm_active());
        assert!(hv.vcpu_create(0).is_err());

        hv.vm_create(0).unwrap();
        assert_eq!(hv.vm_create(0).unwrap_err().kind(), ErrorKind::Busy);

        let vcpu = hv.vcpu_create(0).unwrap();
        assert_eq!(hv.vcpu_count(), 1);
        assert_eq!(hv.vm_destroy().unwrap_err().kind(), ErrorKind::Busy);
        hv.vcpu_destroy(vcpu).unwrap();
        assert_eq!(hv.vcpu_count(), 0);
        hv.vm_destroy().unwrap();
        assert!(!hv.vm_active());
    }

    #[test]
    fn test_vcpu_ids_reused() {
        let hv = mock_with_vm(MockConfig::default());
        let first = hv.vcpu_create(0).unwrap();
        let second = hv.vcpu_create(0).unwrap();
        assert_eq!((first, second), (0, 1));

        hv.vcpu_destroy(first).unwrap();
        assert_eq!(hv.vcpu_create(0).unwrap(), first);
        assert_eq!(hv.vcpu_create(0).unwrap(), 2);
    }

    #[test]
    fn test_apic_address() {
        let hv = mock_with_vm(MockConfig::default());
        let vcpu = hv.vcpu_create(0).unwrap();
        assert_eq!(hv.apic_address(vcpu), None);
        hv.vmx_vcpu_set_apic_address(vcpu, 0xfee0_0000).unwrap();
        assert_eq!(hv.apic_address(vcpu), Some(0xfee0_0000));
        assert_eq!(
            hv.vmx_vcpu_read_vmcs(vcpu, VmcsField::CTRL_APIC_ACCESS).unwrap(),
            0xfee0_0000
        );
    }

    #[test]
    fn test_vcpu_limit() {
        let hv = mock_with_vm(MockConfig {
            max_vcpus: 1,
            vmx: true,
        });
        hv.vcpu_create(0).unwrap();
        assert_eq!(hv.vcpu_create(0).unwrap_err().kind(), ErrorKind::Resource);
    }

    #[test]
    fn test_foreign_thread_rejected() {
        let hv = Arc::new(mock_with_vm(MockConfig::default()));
        let vcpu = hv.vcpu_create(0).unwrap();

        let remote = hv.clone();
        let err = thread::spawn(move || remote.vcpu_read_register(vcpu, Register::Rax))
            .join()
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadArgument);
        assert!(err.message().contains("thread"));

        assert!(hv.vcpu_read_register(vcpu, Register::Rax).is_ok());
    }

    #[test]
    fn test_reserved_register() {
        let hv = mock_with_vm(MockConfig::default());
        let vcpu = hv.vcpu_create(0).unwrap();
        assert_eq!(
            hv.vcpu_read_register(vcpu, Register::Cr1).unwrap_err().kind(),
            ErrorKind::BadArgument
        );
        assert_eq!(hv.vcpu_read_register(vcpu, Register::Rflags).unwrap(), 0x2);
    }

    #[test]
    fn test_msr_requires_native() {
        let hv = mock_with_vm(MockConfig::default());
        let vcpu = hv.vcpu_create(0).unwrap();
        assert!(hv.vcpu_read_msr(vcpu, MSR_IA32_TSC).is_err());
        hv.vcpu_enable_native_msr(vcpu, MSR_IA32_TSC, true).unwrap();
        hv.vcpu_write_msr(vcpu, MSR_IA32_TSC, 42).unwrap();
        assert_eq!(hv.vcpu_read_msr(vcpu, MSR_IA32_TSC).unwrap(), 42);
        hv.vcpu_enable_native_msr(vcpu, MSR_IA32_TSC, false).unwrap();
        assert!(hv.vcpu_write_msr(vcpu, MSR_IA32_TSC, 1).is_err());

        hv.vcpu_write_msr(vcpu, MSR_EFER, 0x500).unwrap();
        assert_eq!(hv.vcpu_read_msr(vcpu, MSR_EFER).unwrap(), 0x500);
    }

    #[test]
    fn test_run_exits_on_unmapped_rip() {
        let hv = mock_with_vm(MockConfig::default());
        let vcpu = hv.vcpu_create(0).unwrap();
        hv.vcpu_run(vcpu).unwrap();
        assert_eq!(
            hv.vmx_vcpu_read_vmcs(vcpu, VmcsField::RO_EXIT_REASON).unwrap(),
            exit_reason::EPT_VIOLATION
        );
        assert!(hv.vcpu_get_exec_time(vcpu).unwrap() > 0);
    }

    #[test]
    fn test_run_blocks_until_interrupted() {
        let hv = Arc::new(mock_with_vm(MockConfig::default()));
        let page = vm_memory::MmapRegion::<()>::new(PAGE).unwrap();
        unsafe {
            hv.vm_map(page.as_ptr(), 0, PAGE as u64, MemoryFlags::all())
                .unwrap();
        }
        let vcpu = hv.vcpu_create(0).unwrap();

        let kicker = hv.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            kicker.vcpu_interrupt(&[vcpu]).unwrap();
        });
        hv.vcpu_run(vcpu).unwrap();
        handle.join().unwrap();
        assert_eq!(
            hv.vmx_vcpu_read_vmcs(vcpu, VmcsField::RO_EXIT_REASON).unwrap(),
            exit_reason::IRQ
        );
    }

    #[test]
    fn test_interrupt_validates_ids() {
        let hv = mock_with_vm(MockConfig::default());
        assert!(hv.vcpu_interrupt(&[]).is_err());
        assert!(hv.vcpu_interrupt(&[7]).is_err());
    }

    #[test]
    fn test_vmx_absent() {
        let hv = mock_with_vm(MockConfig {
            max_vcpus: 1,
            vmx: false,
        });
        assert_eq!(
            hv.vmx_read_capability(VmxCapability::PinBased)
                .unwrap_err()
                .kind(),
            ErrorKind::Unsupported
        );
    }

    #[test]
    fn test_read_only_vmcs_field() {
        let hv = mock_with_vm(MockConfig::default());
        let vcpu = hv.vcpu_create(0).unwrap();
        assert!(hv
            .vmx_vcpu_write_vmcs(vcpu, VmcsField::RO_EXIT_REASON, 1)
            .is_err());
        hv.vmx_vcpu_write_vmcs(vcpu, VmcsField::CTRL_PIN_BASED, 0x16)
            .unwrap();
        assert_eq!(
            hv.vmx_vcpu_read_vmcs(vcpu, VmcsField::CTRL_PIN_BASED).unwrap(),
            0x16
        );
    }
}
