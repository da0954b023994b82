// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Control of hardware-accelerated virtual machines through the host's
//! virtualization facility.
//!
//! A [`Platform`] hands out at most one active [`Vm`]. The VM maps host memory
//! into its guest-physical address space and creates [`Vcpu`]s, each bound to
//! the thread that created it. A blocked [`Vcpu::run`] is cut short from other
//! threads with [`interrupt`].
//!
//! ```
//! use hv::{MemoryFlags, MockConfig, Platform, Register, Vm};
//! use std::sync::Arc;
//! use vm_memory::MmapRegion;
//!
//! let platform = Platform::mock(MockConfig::default());
//! let vm = Vm::create(&platform)?;
//!
//! let mem = Arc::new(MmapRegion::<()>::new(1 << 20).unwrap());
//! vm.map_region(mem, 0, MemoryFlags::all())?;
//!
//! let vcpu = vm.create_vcpu()?;
//! vcpu.write_register(Register::Rip, 0x1000)?;
//! assert_eq!(vcpu.read_register(Register::Rip)?, 0x1000);
//!
//! vcpu.destroy()?;
//! vm.destroy()?;
//! # Ok::<(), hv::HvError>(())
//! ```

#[macro_use]
extern crate scopeguard;

pub mod arch;
pub mod backend;
pub mod config;
pub mod error;
pub mod platform;
pub mod utils;
pub mod vstate;

pub use crate::arch::x86_64::{Register, VmcsField, VmxCapability};
pub use crate::backend::mock::MockConfig;
pub use crate::backend::VcpuId;
pub use crate::config::{BackendKind, ConfigError, PlatformConfig};
pub use crate::error::{ErrorKind, HvError, HvReturn, Result};
pub use crate::platform::Platform;
pub use crate::vstate::interrupt::{interrupt, InterruptHandle};
pub use crate::vstate::memory::{MemoryFlags, MemoryMapping};
pub use crate::vstate::vcpu::fpstate::{FpState, FP_STATE_SIZE};
pub use crate::vstate::vcpu::thread::VcpuThread;
pub use crate::vstate::vcpu::Vcpu;
pub use crate::vstate::vm::{Vm, VmOptions, VmState, VcpuOptions};
