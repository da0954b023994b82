// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Entry point: one host virtualization facility and its VM slot.

use crate::arch::x86_64::VmxCapability;
use crate::backend::mock::{MockConfig, MockHypervisor};
use crate::backend::Hypervisor;
use crate::config::{BackendKind, PlatformConfig};
use crate::error::{ErrorKind, HvError, Result, HV_NO_RESOURCES};
use crate::utils::util::get_page_size;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[cfg(all(target_os = "macos", target_arch = "x86_64"))]
use std::sync::OnceLock;

const DEFAULT_PAGE_SIZE: usize = 0x1000;

fn host_page_size() -> usize {
    get_page_size().unwrap_or_else(|e| {
        log::warn!("Failed to query the host page size, assuming 4KiB: {}", e);
        DEFAULT_PAGE_SIZE
    })
}

/// A host virtualization facility.
///
/// The platform allows at most one active VM per process; `Platform`
/// enforces that rule for the VMs created through it. The native platform
/// is a process-wide singleton, each mock platform stands for a process of
/// its own.
#[derive(Debug)]
pub struct Platform {
    hv: Box<dyn Hypervisor>,
    page_size: usize,
    vm_slot: AtomicBool,
}

impl Platform {
    fn new(hv: Box<dyn Hypervisor>, page_size: usize) -> Self {
        Platform {
            hv,
            page_size,
            vm_slot: AtomicBool::new(false),
        }
    }

    /// The host's own virtualization framework.
    #[cfg(all(target_os = "macos", target_arch = "x86_64"))]
    pub fn native() -> Result<Arc<Platform>> {
        static NATIVE: OnceLock<Arc<Platform>> = OnceLock::new();
        let platform = NATIVE.get_or_init(|| {
            Arc::new(Platform::new(
                Box::new(crate::backend::hvf::Hvf),
                host_page_size(),
            ))
        });
        Ok(platform.clone())
    }

    /// The host's own virtualization framework.
    #[cfg(not(all(target_os = "macos", target_arch = "x86_64")))]
    pub fn native() -> Result<Arc<Platform>> {
        Err(HvError::new(
            ErrorKind::NoDevice,
            crate::error::HV_NO_DEVICE,
            "the hypervisor framework is not available on this host",
        ))
    }

    /// A fresh in-process test double.
    pub fn mock(config: MockConfig) -> Arc<Platform> {
        let page_size = host_page_size();
        Arc::new(Platform::new(
            Box::new(MockHypervisor::new(config, page_size)),
            page_size,
        ))
    }

    pub fn from_config(config: &PlatformConfig) -> Result<Arc<Platform>> {
        match config.backend {
            BackendKind::Native => Platform::native(),
            BackendKind::Mock => Ok(Platform::mock(config.mock)),
        }
    }

    /// Name of the backend, for diagnostics.
    pub fn name(&self) -> &'static str {
        self.hv.name()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Whether the VMX-specific interface is present on this host.
    pub fn vmx_supported(&self) -> bool {
        self.hv.vmx_supported()
    }

    /// Reads the allowed 0/1 settings of a VMX control class.
    ///
    /// Does not require a VM. Repeated reads return the same value.
    pub fn read_capability(&self, cap: VmxCapability) -> Result<u64> {
        if !self.vmx_supported() {
            return Err(HvError::unsupported(format!(
                "{} capabilities are not available without VMX",
                cap.name()
            )));
        }
        let value = self.hv.vmx_read_capability(cap)?;
        log::trace!("{} capability: {:#018x}", cap.name(), value);
        Ok(value)
    }

    pub(crate) fn hv(&self) -> &dyn Hypervisor {
        self.hv.as_ref()
    }

    /// Reserves the platform's single VM slot.
    pub(crate) fn claim_vm_slot(&self) -> Result<()> {
        self.vm_slot
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| {
                HvError::new(
                    ErrorKind::Resource,
                    HV_NO_RESOURCES,
                    "a virtual machine already exists in this process",
                )
            })
    }

    pub(crate) fn release_vm_slot(&self) {
        self.vm_slot.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_slot() {
        let platform = Platform::mock(MockConfig::default());
        platform.claim_vm_slot().unwrap();
        assert_eq!(
            platform.claim_vm_slot().unwrap_err().kind(),
            ErrorKind::Resource
        );
        platform.release_vm_slot();
        platform.claim_vm_slot().unwrap();

        // every mock platform has a slot of its own
        Platform::mock(MockConfig::default()).claim_vm_slot().unwrap();
    }

    #[test]
    fn test_read_capability_stable() {
        let platform = Platform::mock(MockConfig::default());
        for cap in VmxCapability::ALL {
            let first = platform.read_capability(cap).unwrap();
            assert_eq!(platform.read_capability(cap).unwrap(), first);
        }
    }

    #[test]
    fn test_read_capability_without_vmx() {
        let platform = Platform::mock(MockConfig {
            max_vcpus: 1,
            vmx: false,
        });
        assert!(!platform.vmx_supported());
        let err = platform.read_capability(VmxCapability::Entry).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn test_from_config() {
        let config = PlatformConfig::mock(MockConfig::default());
        let platform = Platform::from_config(&config).unwrap();
        assert_eq!(platform.name(), "mock");
        assert!(platform.page_size().is_power_of_two());
    }

    #[cfg(not(all(target_os = "macos", target_arch = "x86_64")))]
    #[test]
    fn test_native_unavailable() {
        let err = Platform::native().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoDevice);
        assert!(Platform::from_config(&PlatformConfig::default()).is_err());
    }
}
