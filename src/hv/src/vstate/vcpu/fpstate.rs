// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::error::{HvError, Result};
use std::fmt;

/// Size in bytes of the floating-point and vector state the platform
/// transfers (an XSAVE area).
pub const FP_STATE_SIZE: usize = 4096;

// Offsets into the legacy FXSAVE region at the start of the area.
const FCW_OFFSET: usize = 0;
const MXCSR_OFFSET: usize = 24;

const FCW_RESET: u16 = 0x37f;
const MXCSR_RESET: u32 = 0x1f80;

/// Opaque floating-point state of one VCPU. Always exactly `FP_STATE_SIZE` bytes.
#[derive(Clone, Eq, PartialEq)]
pub struct FpState(Box<[u8; FP_STATE_SIZE]>);

impl FpState {
    /// An all-zero buffer, suitable as a destination for reads.
    pub fn zeroed() -> Self {
        FpState(Box::new([0u8; FP_STATE_SIZE]))
    }

    /// Copies `bytes` into a new state. `bytes` must be exactly `FP_STATE_SIZE` long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        check_len(bytes.len())?;
        let mut state = FpState::zeroed();
        state.0.copy_from_slice(bytes);
        Ok(state)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0[..]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.0[..]
    }

    /// x87 FPU control word.
    pub fn fcw(&self) -> u16 {
        u16::from_le_bytes([self.0[FCW_OFFSET], self.0[FCW_OFFSET + 1]])
    }

    /// SSE control and status register.
    pub fn mxcsr(&self) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.0[MXCSR_OFFSET..MXCSR_OFFSET + 4]);
        u32::from_le_bytes(raw)
    }

    pub fn set_fcw(&mut self, fcw: u16) {
        self.0[FCW_OFFSET..FCW_OFFSET + 2].copy_from_slice(&fcw.to_le_bytes());
    }

    pub fn set_mxcsr(&mut self, mxcsr: u32) {
        self.0[MXCSR_OFFSET..MXCSR_OFFSET + 4].copy_from_slice(&mxcsr.to_le_bytes());
    }
}

/// The processor's state after reset: x87 and SSE exceptions masked.
impl Default for FpState {
    fn default() -> Self {
        let mut state = FpState::zeroed();
        state.set_fcw(FCW_RESET);
        state.set_mxcsr(MXCSR_RESET);
        state
    }
}

impl fmt::Debug for FpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FpState")
            .field("fcw", &format_args!("{:#x}", self.fcw()))
            .field("mxcsr", &format_args!("{:#x}", self.mxcsr()))
            .finish_non_exhaustive()
    }
}

pub(crate) fn check_len(len: usize) -> Result<()> {
    if len == FP_STATE_SIZE {
        Ok(())
    } else {
        Err(HvError::bad_argument(format!(
            "fp state buffer is {} bytes, expected {}",
            len, FP_STATE_SIZE
        )))
    }
}
