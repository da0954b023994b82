// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

/// Architectural registers accessible through `read_register`/`write_register`.
///
/// The discriminants are the platform's register numbering and are passed to
/// it unchanged.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum Register {
    Rip = 0,
    Rflags,
    Rax,
    Rcx,
    Rdx,
    Rbx,
    Rsi,
    Rdi,
    Rsp,
    Rbp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Cs,
    Ss,
    Ds,
    Es,
    Fs,
    Gs,
    IdtBase,
    IdtLimit,
    GdtBase,
    GdtLimit,
    Ldtr,
    LdtBase,
    LdtLimit,
    LdtAr,
    Tr,
    TssBase,
    TssLimit,
    TssAr,
    Cr0,
    Cr1,
    Cr2,
    Cr3,
    Cr4,
    Dr0,
    Dr1,
    Dr2,
    Dr3,
    Dr4,
    Dr5,
    Dr6,
    Dr7,
    Tpr,
    Xcr0,
}

/// Number of register identifiers the platform defines.
pub const REGISTERS_MAX: usize = Register::Xcr0 as usize + 1;

impl Register {
    /// Every register, in platform order.
    pub const ALL: [Register; REGISTERS_MAX] = [
        Register::Rip,
        Register::Rflags,
        Register::Rax,
        Register::Rcx,
        Register::Rdx,
        Register::Rbx,
        Register::Rsi,
        Register::Rdi,
        Register::Rsp,
        Register::Rbp,
        Register::R8,
        Register::R9,
        Register::R10,
        Register::R11,
        Register::R12,
        Register::R13,
        Register::R14,
        Register::R15,
        Register::Cs,
        Register::Ss,
        Register::Ds,
        Register::Es,
        Register::Fs,
        Register::Gs,
        Register::IdtBase,
        Register::IdtLimit,
        Register::GdtBase,
        Register::GdtLimit,
        Register::Ldtr,
        Register::LdtBase,
        Register::LdtLimit,
        Register::LdtAr,
        Register::Tr,
        Register::TssBase,
        Register::TssLimit,
        Register::TssAr,
        Register::Cr0,
        Register::Cr1,
        Register::Cr2,
        Register::Cr3,
        Register::Cr4,
        Register::Dr0,
        Register::Dr1,
        Register::Dr2,
        Register::Dr3,
        Register::Dr4,
        Register::Dr5,
        Register::Dr6,
        Register::Dr7,
        Register::Tpr,
        Register::Xcr0,
    ];

    /// The sixteen general-purpose registers.
    pub const GENERAL_PURPOSE: [Register; 16] = [
        Register::Rax,
        Register::Rcx,
        Register::Rdx,
        Register::Rbx,
        Register::Rsi,
        Register::Rdi,
        Register::Rsp,
        Register::Rbp,
        Register::R8,
        Register::R9,
        Register::R10,
        Register::R11,
        Register::R12,
        Register::R13,
        Register::R14,
        Register::R15,
    ];

    /// Segment selectors.
    pub const SEGMENTS: [Register; 6] = [
        Register::Cs,
        Register::Ss,
        Register::Ds,
        Register::Es,
        Register::Fs,
        Register::Gs,
    ];

    pub fn index(self) -> u32 {
        self as u32
    }

    pub fn from_index(index: u32) -> Option<Register> {
        Register::ALL.get(index as usize).copied()
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", format!("{:?}", self).to_uppercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_numbering() {
        assert_eq!(Register::Rip.index(), 0);
        assert_eq!(Register::Rax.index(), 2);
        assert_eq!(Register::R15.index(), 17);
        assert_eq!(Register::Cs.index(), 18);
        assert_eq!(Register::Cr0.index(), 36);
        assert_eq!(Register::Dr7.index(), 48);
        assert_eq!(Register::Xcr0.index(), 50);
        assert_eq!(REGISTERS_MAX, 51);
    }

    #[test]
    fn test_all_is_ordered() {
        for (i, reg) in Register::ALL.iter().enumerate() {
            assert_eq!(reg.index() as usize, i);
            assert_eq!(Register::from_index(i as u32), Some(*reg));
        }
        assert_eq!(Register::from_index(REGISTERS_MAX as u32), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(Register::GdtBase.to_string(), "GDTBASE");
        assert_eq!(Register::Rip.to_string(), "RIP");
    }
}
