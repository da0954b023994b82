// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

pub mod fpstate;
pub mod thread;

use self::fpstate::FpState;
use crate::arch::x86_64::msr::{boot_msr_entries, NATIVE_MSRS};
use crate::arch::x86_64::{Register, VmcsField};
use crate::backend::{Hypervisor, VcpuId};
use crate::error::{HvError, Result};
use crate::vstate::interrupt::InterruptHandle;
use crate::vstate::vm::VmInner;
use log::{debug, trace, warn};
use std::marker::PhantomData;
use std::sync::Arc;

/// Mask of the basic exit reason in `VmcsField::RO_EXIT_REASON`.
const EXIT_REASON_BASIC_MASK: u64 = 0xffff;

/// A virtual CPU, bound to the thread that created it.
///
/// `Vcpu` is neither `Send` nor `Sync`: the platform requires every call on
/// a VCPU, `run` included, to come from its creating thread. To drive a VCPU
/// on a dedicated thread, create it there, e.g. with
/// [`VcpuThread`](thread::VcpuThread). To stop a running VCPU from elsewhere,
/// use its [`InterruptHandle`].
///
/// ```compile_fail
/// use hv::{MockConfig, Platform, Vm};
///
/// let platform = Platform::mock(MockConfig::default());
/// let vm = Vm::create(&platform).unwrap();
/// let vcpu = vm.create_vcpu().unwrap();
/// std::thread::spawn(move || vcpu.run());
/// ```
///
/// Dropping a `Vcpu` destroys it.
#[derive(Debug)]
pub struct Vcpu {
    vm: Arc<VmInner>,
    id: VcpuId,
    generation: u64,
    destroyed: bool,
    _not_send: PhantomData<*const ()>,
}

impl Vcpu {
    pub(crate) fn new(vm: Arc<VmInner>, id: VcpuId, generation: u64) -> Self {
        Vcpu {
            vm,
            id,
            generation,
            destroyed: false,
            _not_send: PhantomData,
        }
    }

    /// The platform identifier of this VCPU.
    pub fn id(&self) -> VcpuId {
        self.id
    }

    /// A handle other threads can use to interrupt this VCPU.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle::new(&self.vm, self.id, self.generation)
    }

    fn hv(&self) -> Result<&dyn Hypervisor> {
        self.vm.check_active()?;
        Ok(self.vm.hv())
    }

    fn vmx(&self) -> Result<&dyn Hypervisor> {
        let hv = self.hv()?;
        if !hv.vmx_supported() {
            return Err(HvError::unsupported(
                "the VMX interface is not available on this host",
            ));
        }
        Ok(hv)
    }

    pub fn read_register(&self, reg: Register) -> Result<u64> {
        self.hv()?.vcpu_read_register(self.id, reg)
    }

    pub fn write_register(&self, reg: Register, value: u64) -> Result<()> {
        trace!("vcpu {}: {} <- {:#x}", self.id, reg, value);
        self.hv()?.vcpu_write_register(self.id, reg, value)
    }

    pub fn read_fpstate(&self) -> Result<FpState> {
        let mut state = FpState::zeroed();
        self.read_fpstate_into(state.as_bytes_mut())?;
        Ok(state)
    }

    pub fn write_fpstate(&self, state: &FpState) -> Result<()> {
        self.write_fpstate_from(state.as_bytes())
    }

    /// Reads the FP state into `buffer`, which must be `FP_STATE_SIZE` bytes.
    pub fn read_fpstate_into(&self, buffer: &mut [u8]) -> Result<()> {
        fpstate::check_len(buffer.len())?;
        self.hv()?.vcpu_read_fpstate(self.id, buffer)
    }

    /// Loads the FP state from `buffer`, which must be `FP_STATE_SIZE` bytes.
    /// A buffer of any other size is rejected and the state left untouched.
    pub fn write_fpstate_from(&self, buffer: &[u8]) -> Result<()> {
        fpstate::check_len(buffer.len())?;
        self.hv()?.vcpu_write_fpstate(self.id, buffer)
    }

    /// Lets the guest access `msr` directly instead of trapping.
    pub fn enable_native_msr(&self, msr: u32, enable: bool) -> Result<()> {
        self.hv()?.vcpu_enable_native_msr(self.id, msr, enable)
    }

    pub fn read_msr(&self, msr: u32) -> Result<u64> {
        self.hv()?.vcpu_read_msr(self.id, msr)
    }

    pub fn write_msr(&self, msr: u32, value: u64) -> Result<()> {
        trace!("vcpu {}: msr {:#x} <- {:#x}", self.id, msr, value);
        self.hv()?.vcpu_write_msr(self.id, msr, value)
    }

    /// Passes the syscall and TSC MSRs through natively and seeds the MSRs a
    /// 64-bit kernel expects at entry.
    pub fn setup_msrs(&self) -> Result<()> {
        for msr in NATIVE_MSRS {
            self.enable_native_msr(msr, true)?;
        }
        for (msr, value) in boot_msr_entries() {
            self.write_msr(msr, value)?;
        }
        Ok(())
    }

    /// Applies pending state writes before the next `run`.
    pub fn flush(&self) -> Result<()> {
        self.hv()?.vcpu_flush(self.id)
    }

    pub fn invalidate_tlb(&self) -> Result<()> {
        self.hv()?.vcpu_invalidate_tlb(self.id)
    }

    /// Runs the guest until an exit occurs.
    ///
    /// Blocks for as long as the guest keeps running. Another thread can
    /// force a return through [`InterruptHandle::interrupt`]. The reason of
    /// the exit is read back with [`Vcpu::exit_reason`].
    pub fn run(&self) -> Result<()> {
        let hv = self.hv()?;
        trace!("vcpu {}: entering guest", self.id);
        defer! {{
            trace!("vcpu {}: left guest", self.id);
        }}
        hv.vcpu_run(self.id)
    }

    /// Cumulative guest execution time, in platform clock units.
    pub fn exec_time(&self) -> Result<u64> {
        self.hv()?.vcpu_get_exec_time(self.id)
    }

    /// Tells the platform where the virtual APIC page lives in the guest.
    pub fn set_apic_address(&self, guest_addr: u64) -> Result<()> {
        self.vmx()?.vmx_vcpu_set_apic_address(self.id, guest_addr)
    }

    pub fn read_vmcs(&self, field: VmcsField) -> Result<u64> {
        self.vmx()?.vmx_vcpu_read_vmcs(self.id, field)
    }

    pub fn write_vmcs(&self, field: VmcsField, value: u64) -> Result<()> {
        trace!("vcpu {}: {:?} <- {:#x}", self.id, field, value);
        self.vmx()?.vmx_vcpu_write_vmcs(self.id, field, value)
    }

    /// Basic reason of the last exit, see [`crate::arch::x86_64::vmcs::exit_reason`].
    pub fn exit_reason(&self) -> Result<u64> {
        Ok(self.read_vmcs(VmcsField::RO_EXIT_REASON)? & EXIT_REASON_BASIC_MASK)
    }

    /// Destroys the VCPU.
    pub fn destroy(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        self.hv()?.vcpu_destroy(self.id)?;
        self.destroyed = true;
        self.vm.forget_vcpu(self.id);
        debug!("Destroyed vcpu {}", self.id);
        Ok(())
    }
}

impl Drop for Vcpu {
    fn drop(&mut self) {
        if self.destroyed {
            return;
        }
        if let Err(e) = self.release() {
            warn!("Failed to destroy vcpu {}: {}", self.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fpstate::FP_STATE_SIZE;
    use super::*;
    use crate::arch::x86_64::msr::{
        MSR_IA32_MISC_ENABLE, MSR_IA32_MISC_ENABLE_FAST_STRING, MSR_LSTAR,
    };
    use crate::arch::x86_64::vmcs::exit_reason;
    use crate::backend::mock::MockConfig;
    use crate::error::ErrorKind;
    use crate::platform::Platform;
    use crate::vstate::memory::MemoryFlags;
    use crate::vstate::vm::Vm;
    use vm_memory::MmapRegion;

    fn setup_vm(config: MockConfig) -> Vm {
        Vm::create(&Platform::mock(config)).unwrap()
    }

    #[test]
    fn test_general_purpose_registers() {
        let vm = setup_vm(MockConfig::default());
        let vcpu = vm.create_vcpu().unwrap();
        for (i, reg) in Register::GENERAL_PURPOSE.iter().enumerate() {
            vcpu.write_register(*reg, 0x1000 + i as u64).unwrap();
        }
        for (i, reg) in Register::GENERAL_PURPOSE.iter().enumerate() {
            assert_eq!(vcpu.read_register(*reg).unwrap(), 0x1000 + i as u64);
        }
    }

    #[test]
    fn test_fpstate_size_checked() {
        let vm = setup_vm(MockConfig::default());
        let vcpu = vm.create_vcpu().unwrap();

        let mut state = vcpu.read_fpstate().unwrap();
        state.set_mxcsr(0x1fbf);
        vcpu.write_fpstate(&state).unwrap();

        let err = vcpu.write_fpstate_from(&[0xff; FP_STATE_SIZE - 16]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadArgument);
        let mut short = [0u8; 512];
        assert!(vcpu.read_fpstate_into(&mut short).is_err());

        assert_eq!(vcpu.read_fpstate().unwrap(), state);
    }

    #[test]
    fn test_setup_msrs() {
        let vm = setup_vm(MockConfig::default());
        let vcpu = vm.create_vcpu().unwrap();
        vcpu.setup_msrs().unwrap();
        assert_eq!(
            vcpu.read_msr(MSR_IA32_MISC_ENABLE).unwrap(),
            MSR_IA32_MISC_ENABLE_FAST_STRING
        );
        vcpu.write_msr(MSR_LSTAR, 0xffff_ffff_8100_0000).unwrap();
        assert_eq!(vcpu.read_msr(MSR_LSTAR).unwrap(), 0xffff_ffff_8100_0000);
    }

    #[test]
    fn test_vmx_gated_calls() {
        let vm = setup_vm(MockConfig {
            max_vcpus: 1,
            vmx: false,
        });
        let vcpu = vm.create_vcpu().unwrap();
        for err in [
            vcpu.read_vmcs(VmcsField::GUEST_RIP).unwrap_err(),
            vcpu.write_vmcs(VmcsField::GUEST_RIP, 0).unwrap_err(),
            vcpu.set_apic_address(0xfee0_0000).unwrap_err(),
        ] {
            assert_eq!(err.kind(), ErrorKind::Unsupported);
        }
        // everything else keeps working
        vcpu.write_register(Register::Rip, 0x1000).unwrap();
    }

    #[test]
    fn test_destroy_and_drop() {
        let vm = setup_vm(MockConfig::default());
        let first = vm.create_vcpu().unwrap();
        let second = vm.create_vcpu().unwrap();
        assert_eq!(vm.vcpu_count(), 2);

        assert_eq!(vm.destroy().unwrap_err().kind(), ErrorKind::InvalidState);
        first.destroy().unwrap();
        drop(second);
        assert_eq!(vm.vcpu_count(), 0);
        vm.destroy().unwrap();
    }

    #[test]
    fn test_run_until_hlt() {
        let vm = setup_vm(MockConfig::default());
        let page = vm.platform().page_size();
        let mem = Arc::new(MmapRegion::<()>::new(page).unwrap());
        // hlt
        unsafe { *mem.as_ptr().add(0x10) = 0xf4 };
        vm.map_region(mem, 0, MemoryFlags::all()).unwrap();

        let vcpu = vm.create_vcpu().unwrap();
        vcpu.write_register(Register::Rip, 0x10).unwrap();
        vcpu.flush().unwrap();
        vcpu.run().unwrap();
        assert_eq!(vcpu.exit_reason().unwrap(), exit_reason::HLT);
        assert!(vcpu.exec_time().unwrap() > 0);

        // not executable any more
        vm.protect(0, page as u64, MemoryFlags::READ | MemoryFlags::WRITE)
            .unwrap();
        vcpu.invalidate_tlb().unwrap();
        vcpu.run().unwrap();
        assert_eq!(vcpu.exit_reason().unwrap(), exit_reason::EPT_VIOLATION);
    }

    #[test]
    fn test_set_apic_address() {
        let platform = Platform::mock(MockConfig::default());
        let vm = Vm::create(&platform).unwrap();
        let vcpu = vm.create_vcpu().unwrap();
        assert_eq!(vcpu.read_vmcs(VmcsField::CTRL_APIC_ACCESS).unwrap(), 0);
        vcpu.set_apic_address(0xfee0_0000).unwrap();
        assert_eq!(
            vcpu.read_vmcs(VmcsField::CTRL_APIC_ACCESS).unwrap(),
            0xfee0_0000
        );
        vcpu.write_vmcs(VmcsField::CTRL_TPR_THRESHOLD, 0x10).unwrap();
        assert_eq!(vcpu.read_vmcs(VmcsField::CTRL_TPR_THRESHOLD).unwrap(), 0x10);
    }
}
