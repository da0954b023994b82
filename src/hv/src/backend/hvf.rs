// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Native backend: the host's Hypervisor framework.

#![allow(non_camel_case_types)]

use super::{Hypervisor, VcpuId};
use crate::arch::x86_64::{Register, VmcsField, VmxCapability};
use crate::error::{check, HvReturn, Result};
use crate::vstate::memory::MemoryFlags;
use libc::{c_uint, c_void, size_t};

type hv_return_t = HvReturn;
type hv_vcpuid_t = c_uint;
type hv_uvaddr_t = *const c_void;
type hv_gpaddr_t = u64;
type hv_memory_flags_t = u64;
type hv_vm_options_t = u64;
type hv_vcpu_options_t = u64;
type hv_x86_reg_t = u32;
type hv_vmx_capability_t = u32;

#[link(name = "Hypervisor", kind = "framework")]
extern "C" {
    fn hv_vm_create(flags: hv_vm_options_t) -> hv_return_t;
    fn hv_vm_destroy() -> hv_return_t;
    fn hv_vm_map(
        uva: hv_uvaddr_t,
        gpa: hv_gpaddr_t,
        size: size_t,
        flags: hv_memory_flags_t,
    ) -> hv_return_t;
    fn hv_vm_unmap(gpa: hv_gpaddr_t, size: size_t) -> hv_return_t;
    fn hv_vm_protect(gpa: hv_gpaddr_t, size: size_t, flags: hv_memory_flags_t) -> hv_return_t;
    fn hv_vm_sync_tsc(tsc: u64) -> hv_return_t;

    fn hv_vcpu_create(vcpu: *mut hv_vcpuid_t, flags: hv_vcpu_options_t) -> hv_return_t;
    fn hv_vcpu_destroy(vcpu: hv_vcpuid_t) -> hv_return_t;
    fn hv_vcpu_read_register(vcpu: hv_vcpuid_t, reg: hv_x86_reg_t, value: *mut u64)
        -> hv_return_t;
    fn hv_vcpu_write_register(vcpu: hv_vcpuid_t, reg: hv_x86_reg_t, value: u64) -> hv_return_t;
    fn hv_vcpu_read_fpstate(vcpu: hv_vcpuid_t, buffer: *mut c_void, size: size_t)
        -> hv_return_t;
    fn hv_vcpu_write_fpstate(vcpu: hv_vcpuid_t, buffer: *mut c_void, size: size_t)
        -> hv_return_t;
    fn hv_vcpu_enable_native_msr(vcpu: hv_vcpuid_t, msr: u32, enable: bool) -> hv_return_t;
    fn hv_vcpu_read_msr(vcpu: hv_vcpuid_t, msr: u32, value: *mut u64) -> hv_return_t;
    fn hv_vcpu_write_msr(vcpu: hv_vcpuid_t, msr: u32, value: u64) -> hv_return_t;
    fn hv_vcpu_flush(vcpu: hv_vcpuid_t) -> hv_return_t;
    fn hv_vcpu_invalidate_tlb(vcpu: hv_vcpuid_t) -> hv_return_t;
    fn hv_vcpu_run(vcpu: hv_vcpuid_t) -> hv_return_t;
    fn hv_vcpu_interrupt(vcpus: *mut hv_vcpuid_t, vcpu_count: c_uint) -> hv_return_t;
    fn hv_vcpu_get_exec_time(vcpu: hv_vcpuid_t, time: *mut u64) -> hv_return_t;

    fn hv_vmx_vcpu_read_vmcs(vcpu: hv_vcpuid_t, field: u32, value: *mut u64) -> hv_return_t;
    fn hv_vmx_vcpu_write_vmcs(vcpu: hv_vcpuid_t, field: u32, value: u64) -> hv_return_t;
    fn hv_vmx_read_capability(field: hv_vmx_capability_t, value: *mut u64) -> hv_return_t;
    fn hv_vmx_vcpu_set_apic_address(vcpu: hv_vcpuid_t, gpa: hv_gpaddr_t) -> hv_return_t;
}

/// Calls a framework function and translates its status code.
macro_rules! hv_call {
    ($x:expr) => {
        check(unsafe { $x })
    };
}

/// Stateless handle on the framework; the platform itself holds all state.
#[derive(Debug, Default)]
pub struct Hvf;

impl Hypervisor for Hvf {
    fn name(&self) -> &'static str {
        "hvf"
    }

    fn vm_create(&self, flags: u64) -> Result<()> {
        hv_call!(hv_vm_create(flags))
    }

    fn vm_destroy(&self) -> Result<()> {
        hv_call!(hv_vm_destroy())
    }

    unsafe fn vm_map(&self, uva: *mut u8, gpa: u64, size: u64, flags: MemoryFlags) -> Result<()> {
        hv_call!(hv_vm_map(
            uva as hv_uvaddr_t,
            gpa,
            size as size_t,
            flags.bits()
        ))
    }

    fn vm_unmap(&self, gpa: u64, size: u64) -> Result<()> {
        hv_call!(hv_vm_unmap(gpa, size as size_t))
    }

    fn vm_protect(&self, gpa: u64, size: u64, flags: MemoryFlags) -> Result<()> {
        hv_call!(hv_vm_protect(gpa, size as size_t, flags.bits()))
    }

    fn vm_sync_tsc(&self, tsc: u64) -> Result<()> {
        hv_call!(hv_vm_sync_tsc(tsc))
    }

    fn vcpu_create(&self, flags: u64) -> Result<VcpuId> {
        let mut vcpu: hv_vcpuid_t = 0;
        hv_call!(hv_vcpu_create(&mut vcpu, flags))?;
        Ok(vcpu)
    }

    fn vcpu_destroy(&self, vcpu: VcpuId) -> Result<()> {
        hv_call!(hv_vcpu_destroy(vcpu))
    }

    fn vcpu_read_register(&self, vcpu: VcpuId, reg: Register) -> Result<u64> {
        let mut value = 0u64;
        hv_call!(hv_vcpu_read_register(vcpu, reg.index(), &mut value))?;
        Ok(value)
    }

    fn vcpu_write_register(&self, vcpu: VcpuId, reg: Register, value: u64) -> Result<()> {
        hv_call!(hv_vcpu_write_register(vcpu, reg.index(), value))
    }

    fn vcpu_read_fpstate(&self, vcpu: VcpuId, buffer: &mut [u8]) -> Result<()> {
        hv_call!(hv_vcpu_read_fpstate(
            vcpu,
            buffer.as_mut_ptr() as *mut c_void,
            buffer.len()
        ))
    }

    fn vcpu_write_fpstate(&self, vcpu: VcpuId, buffer: &[u8]) -> Result<()> {
        // The framework only reads from the buffer despite the mutable signature.
        hv_call!(hv_vcpu_write_fpstate(
            vcpu,
            buffer.as_ptr() as *mut c_void,
            buffer.len()
        ))
    }

    fn vcpu_enable_native_msr(&self, vcpu: VcpuId, msr: u32, enable: bool) -> Result<()> {
        hv_call!(hv_vcpu_enable_native_msr(vcpu, msr, enable))
    }

    fn vcpu_read_msr(&self, vcpu: VcpuId, msr: u32) -> Result<u64> {
        let mut value = 0u64;
        hv_call!(hv_vcpu_read_msr(vcpu, msr, &mut value))?;
        Ok(value)
    }

    fn vcpu_write_msr(&self, vcpu: VcpuId, msr: u32, value: u64) -> Result<()> {
        hv_call!(hv_vcpu_write_msr(vcpu, msr, value))
    }

    fn vcpu_flush(&self, vcpu: VcpuId) -> Result<()> {
        hv_call!(hv_vcpu_flush(vcpu))
    }

    fn vcpu_invalidate_tlb(&self, vcpu: VcpuId) -> Result<()> {
        hv_call!(hv_vcpu_invalidate_tlb(vcpu))
    }

    fn vcpu_run(&self, vcpu: VcpuId) -> Result<()> {
        hv_call!(hv_vcpu_run(vcpu))
    }

    fn vcpu_interrupt(&self, vcpus: &[VcpuId]) -> Result<()> {
        let mut ids = vcpus.to_vec();
        hv_call!(hv_vcpu_interrupt(ids.as_mut_ptr(), ids.len() as c_uint))
    }

    fn vcpu_get_exec_time(&self, vcpu: VcpuId) -> Result<u64> {
        let mut time = 0u64;
        hv_call!(hv_vcpu_get_exec_time(vcpu, &mut time))?;
        Ok(time)
    }

    fn vmx_supported(&self) -> bool {
        true
    }

    fn vmx_read_capability(&self, cap: VmxCapability) -> Result<u64> {
        let mut value = 0u64;
        hv_call!(hv_vmx_read_capability(cap as hv_vmx_capability_t, &mut value))?;
        Ok(value)
    }

    fn vmx_vcpu_read_vmcs(&self, vcpu: VcpuId, field: VmcsField) -> Result<u64> {
        let mut value = 0u64;
        hv_call!(hv_vmx_vcpu_read_vmcs(vcpu, field.encoding(), &mut value))?;
        Ok(value)
    }

    fn vmx_vcpu_write_vmcs(&self, vcpu: VcpuId, field: VmcsField, value: u64) -> Result<()> {
        hv_call!(hv_vmx_vcpu_write_vmcs(vcpu, field.encoding(), value))
    }

    fn vmx_vcpu_set_apic_address(&self, vcpu: VcpuId, gpa: u64) -> Result<()> {
        hv_call!(hv_vmx_vcpu_set_apic_address(vcpu, gpa))
    }
}
