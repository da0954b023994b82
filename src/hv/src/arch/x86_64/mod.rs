// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

pub mod msr;
pub mod regs;
pub mod vmcs;

pub use regs::Register;
pub use vmcs::{VmcsField, VmxCapability};
