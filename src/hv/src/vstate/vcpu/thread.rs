// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::Vcpu;
use crate::error::{ErrorKind, HvError, Result, HV_ERROR, HV_NO_RESOURCES};
use crate::vstate::interrupt::InterruptHandle;
use crate::vstate::vm::Vm;
use log::debug;
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

/// An OS thread that owns one VCPU for the VCPU's whole life.
///
/// The VCPU is created on the new thread and handed to the thread body, so
/// it never leaves it. The spawner keeps an [`InterruptHandle`] to kick the
/// VCPU out of `run`.
#[derive(Debug)]
pub struct VcpuThread<T> {
    handle: InterruptHandle,
    thread: JoinHandle<Result<T>>,
}

impl<T: Send + 'static> VcpuThread<T> {
    /// Starts thread `hv_vcpu{index}`, creates a VCPU on it and runs `body`.
    ///
    /// Returns once the VCPU exists, or with the error that prevented its
    /// creation.
    pub fn spawn<F>(vm: Arc<Vm>, index: usize, body: F) -> Result<VcpuThread<T>>
    where
        F: FnOnce(Vcpu) -> Result<T> + Send + 'static,
    {
        let (handle_tx, handle_rx) = mpsc::channel();
        let thread = thread::Builder::new()
            .name(format!("hv_vcpu{}", index))
            .spawn(move || {
                defer! {{
                    debug!("vcpu thread {} exiting", index);
                }}
                let vcpu = match vm.create_vcpu() {
                    Ok(vcpu) => vcpu,
                    Err(e) => {
                        // The spawner is waiting for either outcome.
                        let _ = handle_tx.send(Err(e.clone()));
                        return Err(e);
                    }
                };
                let _ = handle_tx.send(Ok(vcpu.interrupt_handle()));
                body(vcpu)
            })
            .map_err(|e| {
                HvError::new(
                    ErrorKind::Resource,
                    HV_NO_RESOURCES,
                    format!("cannot spawn vcpu thread {}: {}", index, e),
                )
            })?;

        let handle = handle_rx.recv().map_err(|_| {
            HvError::new(
                ErrorKind::Platform,
                HV_ERROR,
                format!("vcpu thread {} died before creating its vcpu", index),
            )
        })??;
        Ok(VcpuThread { handle, thread })
    }

    pub fn interrupt_handle(&self) -> &InterruptHandle {
        &self.handle
    }

    /// Waits for the thread body to finish and returns its result.
    pub fn join(self) -> Result<T> {
        self.thread.join().map_err(|_| {
            HvError::new(
                ErrorKind::Platform,
                HV_ERROR,
                format!("vcpu {} thread panicked", self.handle.vcpu_id()),
            )
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x86_64::vmcs::exit_reason;
    use crate::arch::x86_64::Register;
    use crate::backend::mock::MockConfig;
    use crate::platform::Platform;

    #[test]
    fn test_thread_owns_vcpu() {
        let vm = Arc::new(Vm::create(&Platform::mock(MockConfig::default())).unwrap());
        let worker = VcpuThread::spawn(vm.clone(), 0, |vcpu| {
            assert_eq!(thread::current().name(), Some("hv_vcpu0"));
            vcpu.write_register(Register::Rbx, 7)?;
            vcpu.read_register(Register::Rbx)
        })
        .unwrap();
        assert_eq!(worker.join().unwrap(), 7);

        // the vcpu went away with its thread
        assert_eq!(vm.vcpu_count(), 0);
        vm.destroy().unwrap();
    }

    #[test]
    fn test_kick_running_thread() {
        let vm = Arc::new(Vm::create(&Platform::mock(MockConfig::default())).unwrap());
        let page = vm_memory::MmapRegion::<()>::new(vm.platform().page_size()).unwrap();
        vm.map_region(Arc::new(page), 0, crate::vstate::memory::MemoryFlags::all())
            .unwrap();

        let worker = VcpuThread::spawn(vm, 1, |vcpu| {
            vcpu.run()?;
            vcpu.exit_reason()
        })
        .unwrap();
        worker.interrupt_handle().interrupt().unwrap();
        assert_eq!(worker.join().unwrap(), exit_reason::IRQ);
    }

    #[test]
    fn test_creation_failure_reported() {
        let vm = Arc::new(
            Vm::create(&Platform::mock(MockConfig {
                max_vcpus: 1,
                vmx: true,
            }))
            .unwrap(),
        );
        let _vcpu = vm.create_vcpu().unwrap();
        let err = VcpuThread::spawn(vm.clone(), 1, |_| Ok(())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resource);
    }
}
