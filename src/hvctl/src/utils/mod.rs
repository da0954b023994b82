// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use hv::{
    HvError, MemoryFlags, Platform, PlatformConfig, Register, VcpuId, Vm, VmxCapability,
};
use log::info;
use std::sync::Arc;
use vm_memory::mmap::MmapRegionError;
use vm_memory::MmapRegion;

const MIB: usize = 1 << 20;

/// Guest address the probe seeds into RIP.
const PROBE_ENTRY: u64 = 0x1000;

#[derive(Debug, thiserror::Error)]
pub enum UtilsError {
    /// The configuration could not be parsed.
    #[error("Invalid platform configuration: {0}")]
    Config(#[from] hv::ConfigError),
    /// A platform call failed.
    #[error("{} error: {0}", .0.kind())]
    Platform(#[from] HvError),
    /// Guest memory could not be allocated.
    #[error("Cannot allocate guest memory: {0}")]
    GuestMemory(#[from] MmapRegionError),
    /// The probe needs at least one MiB of guest memory, and no more than
    /// the host address space holds.
    #[error("Invalid guest memory size")]
    InvalidMemorySize,
}

/// What a successful probe observed.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ProbeReport {
    pub platform: &'static str,
    pub mem_size: u64,
    pub vcpu: VcpuId,
    pub rip: u64,
    pub exec_time: u64,
}

/// Builds the platform named by `config`, or the native one without a config.
pub fn platform_from_config(config: Option<&str>) -> Result<Arc<Platform>, UtilsError> {
    let config = match config {
        Some(json) => PlatformConfig::from_json(json)?,
        None => PlatformConfig::default(),
    };
    Ok(Platform::from_config(&config)?)
}

pub fn read_capabilities(platform: &Platform) -> Result<Vec<(VmxCapability, u64)>, UtilsError> {
    VmxCapability::ALL
        .iter()
        .map(|&cap| Ok((cap, platform.read_capability(cap)?)))
        .collect()
}

/// Walks the whole VM lifecycle once without running the guest.
pub fn probe(platform: &Arc<Platform>, mem_size_mib: usize) -> Result<ProbeReport, UtilsError> {
    if mem_size_mib == 0 {
        return Err(UtilsError::InvalidMemorySize);
    }
    let mem_size = mem_size_mib
        .checked_mul(MIB)
        .ok_or(UtilsError::InvalidMemorySize)?;

    let vm = Vm::create(platform)?;
    let mem = Arc::new(MmapRegion::new(mem_size)?);
    vm.map_region(mem, 0, MemoryFlags::all())?;
    info!("Mapped {} MiB of guest memory at 0", mem_size_mib);

    let vcpu = vm.create_vcpu()?;
    vcpu.write_register(Register::Rip, PROBE_ENTRY)?;
    vcpu.flush()?;
    let report = ProbeReport {
        platform: platform.name(),
        mem_size: mem_size as u64,
        vcpu: vcpu.id(),
        rip: vcpu.read_register(Register::Rip)?,
        exec_time: vcpu.exec_time()?,
    };

    vcpu.destroy()?;
    vm.unmap(0, mem_size as u64)?;
    vm.destroy()?;
    Ok(report)
}
