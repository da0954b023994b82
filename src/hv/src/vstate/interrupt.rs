// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::backend::VcpuId;
use crate::error::{HvError, Result};
use crate::vstate::vm::VmInner;
use log::trace;
use std::fmt;
use std::sync::{Arc, Weak};

/// Thread-safe reference to one VCPU, used to force it out of `run`.
///
/// A handle does not keep the VM alive. It goes stale once its VCPU is
/// destroyed, even if the platform later hands the same id to a new VCPU.
#[derive(Clone)]
pub struct InterruptHandle {
    vm: Weak<VmInner>,
    vcpu: VcpuId,
    generation: u64,
}

impl InterruptHandle {
    pub(crate) fn new(vm: &Arc<VmInner>, vcpu: VcpuId, generation: u64) -> Self {
        InterruptHandle {
            vm: Arc::downgrade(vm),
            vcpu,
            generation,
        }
    }

    pub fn vcpu_id(&self) -> VcpuId {
        self.vcpu
    }

    /// Interrupts this VCPU alone.
    pub fn interrupt(&self) -> Result<()> {
        interrupt(std::slice::from_ref(self))
    }
}

impl fmt::Debug for InterruptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptHandle")
            .field("vcpu", &self.vcpu)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Forces every VCPU in `handles` out of guest execution.
///
/// A blocked `run` on any of them returns promptly. A VCPU that is not
/// running takes the exit on its next `run`. The handles must be non-empty,
/// belong to the same VM and name VCPUs that are still live.
pub fn interrupt(handles: &[InterruptHandle]) -> Result<()> {
    let first = handles
        .first()
        .ok_or_else(|| HvError::bad_argument("no vcpu to interrupt"))?;
    let vm = first.vm.upgrade().ok_or_else(|| {
        HvError::invalid_state("the virtual machine of the vcpus has been dropped")
    })?;

    let mut ids = Vec::with_capacity(handles.len());
    for handle in handles {
        if !Weak::ptr_eq(&handle.vm, &first.vm) {
            return Err(HvError::bad_argument(
                "vcpus to interrupt belong to different virtual machines",
            ));
        }
        if !vm.is_live(handle.vcpu, handle.generation) {
            return Err(HvError::bad_argument(format!(
                "vcpu {} has been destroyed",
                handle.vcpu
            )));
        }
        ids.push(handle.vcpu);
    }
    vm.check_active()?;
    trace!("Interrupting vcpus {:?}", ids);
    vm.hv().vcpu_interrupt(&ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockConfig;
    use crate::error::ErrorKind;
    use crate::platform::Platform;
    use crate::vstate::vm::Vm;

    #[test]
    fn test_empty_set() {
        assert_eq!(interrupt(&[]).unwrap_err().kind(), ErrorKind::BadArgument);
    }

    #[test]
    fn test_destroyed_vcpu() {
        let vm = Vm::create(&Platform::mock(MockConfig::default())).unwrap();
        let live = vm.create_vcpu().unwrap();
        let gone = vm.create_vcpu().unwrap();
        let handles = vec![live.interrupt_handle(), gone.interrupt_handle()];
        interrupt(&handles).unwrap();

        gone.destroy().unwrap();
        assert_eq!(
            interrupt(&handles).unwrap_err().kind(),
            ErrorKind::BadArgument
        );
        handles[0].interrupt().unwrap();
    }

    #[test]
    fn test_reused_vcpu_id() {
        let vm = Vm::create(&Platform::mock(MockConfig::default())).unwrap();
        let old = vm.create_vcpu().unwrap();
        let stale = old.interrupt_handle();
        let id = old.id();
        old.destroy().unwrap();

        let new = vm.create_vcpu().unwrap();
        assert_eq!(new.id(), id);
        assert_eq!(stale.interrupt().unwrap_err().kind(), ErrorKind::BadArgument);
        new.interrupt_handle().interrupt().unwrap();
    }

    #[test]
    fn test_handle_does_not_keep_vm() {
        let platform = Platform::mock(MockConfig::default());
        let vm = Vm::create(&platform).unwrap();
        let vcpu = vm.create_vcpu().unwrap();
        let handle = vcpu.interrupt_handle();
        drop(vcpu);
        drop(vm);

        let vm = Vm::create(&platform).unwrap();
        let _vcpu = vm.create_vcpu().unwrap();
        assert_eq!(handle.interrupt().unwrap_err().kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_mixed_vms() {
        let a = Vm::create(&Platform::mock(MockConfig::default())).unwrap();
        let b = Vm::create(&Platform::mock(MockConfig::default())).unwrap();
        let va = a.create_vcpu().unwrap();
        let vb = b.create_vcpu().unwrap();
        let err = interrupt(&[va.interrupt_handle(), vb.interrupt_handle()]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadArgument);
    }

    #[test]
    fn test_pending_interrupt_exits_next_run() {
        let vm = Vm::create(&Platform::mock(MockConfig::default())).unwrap();
        let vcpu = vm.create_vcpu().unwrap();
        vcpu.interrupt_handle().interrupt().unwrap();
        vcpu.run().unwrap();
        assert_eq!(
            vcpu.exit_reason().unwrap(),
            crate::arch::x86_64::vmcs::exit_reason::IRQ
        );
    }
}
