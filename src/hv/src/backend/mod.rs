// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The seam between this crate and the host virtualization facility.
//!
//! A [`Hypervisor`] exposes the platform calls one-to-one. Implementations do
//! not track lifecycle state on behalf of callers; that is the job of
//! [`crate::vstate`]. Every method maps the platform status into
//! [`crate::error::HvError`] through [`crate::error::check`].

#[cfg(all(target_os = "macos", target_arch = "x86_64"))]
pub mod hvf;
pub mod mock;

use crate::arch::x86_64::{Register, VmcsField, VmxCapability};
use crate::error::Result;
use crate::vstate::memory::MemoryFlags;
use std::fmt;

/// Platform identifier of a virtual CPU.
pub type VcpuId = u32;

/// Raw control interface of a host virtualization facility.
///
/// VCPU-scoped methods other than [`Hypervisor::vcpu_interrupt`] must be
/// invoked from the thread that created the VCPU.
pub trait Hypervisor: Send + Sync + fmt::Debug {
    /// Short name used in log messages.
    fn name(&self) -> &'static str;

    fn vm_create(&self, flags: u64) -> Result<()>;
    fn vm_destroy(&self) -> Result<()>;

    /// Maps `size` bytes of host memory at `uva` into the guest at `gpa`.
    ///
    /// # Safety
    ///
    /// `uva..uva + size` must stay valid and resident until it is unmapped.
    unsafe fn vm_map(&self, uva: *mut u8, gpa: u64, size: u64, flags: MemoryFlags) -> Result<()>;
    fn vm_unmap(&self, gpa: u64, size: u64) -> Result<()>;
    fn vm_protect(&self, gpa: u64, size: u64, flags: MemoryFlags) -> Result<()>;
    fn vm_sync_tsc(&self, tsc: u64) -> Result<()>;

    fn vcpu_create(&self, flags: u64) -> Result<VcpuId>;
    fn vcpu_destroy(&self, vcpu: VcpuId) -> Result<()>;
    fn vcpu_read_register(&self, vcpu: VcpuId, reg: Register) -> Result<u64>;
    fn vcpu_write_register(&self, vcpu: VcpuId, reg: Register, value: u64) -> Result<()>;
    fn vcpu_read_fpstate(&self, vcpu: VcpuId, buffer: &mut [u8]) -> Result<()>;
    fn vcpu_write_fpstate(&self, vcpu: VcpuId, buffer: &[u8]) -> Result<()>;
    fn vcpu_enable_native_msr(&self, vcpu: VcpuId, msr: u32, enable: bool) -> Result<()>;
    fn vcpu_read_msr(&self, vcpu: VcpuId, msr: u32) -> Result<u64>;
    fn vcpu_write_msr(&self, vcpu: VcpuId, msr: u32, value: u64) -> Result<()>;
    fn vcpu_flush(&self, vcpu: VcpuId) -> Result<()>;
    fn vcpu_invalidate_tlb(&self, vcpu: VcpuId) -> Result<()>;
    /// Runs the guest until an exit occurs. Blocks for a guest-controlled time.
    fn vcpu_run(&self, vcpu: VcpuId) -> Result<()>;
    /// Forces the listed VCPUs out of guest execution. Callable from any thread.
    fn vcpu_interrupt(&self, vcpus: &[VcpuId]) -> Result<()>;
    fn vcpu_get_exec_time(&self, vcpu: VcpuId) -> Result<u64>;

    /// Whether the VMX-specific extended interface is present.
    fn vmx_supported(&self) -> bool;
    fn vmx_read_capability(&self, cap: VmxCapability) -> Result<u64>;
    fn vmx_vcpu_read_vmcs(&self, vcpu: VcpuId, field: VmcsField) -> Result<u64>;
    fn vmx_vcpu_write_vmcs(&self, vcpu: VcpuId, field: VmcsField, value: u64) -> Result<()>;
    fn vmx_vcpu_set_apic_address(&self, vcpu: VcpuId, gpa: u64) -> Result<()>;
}
