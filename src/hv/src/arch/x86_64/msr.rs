// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Model specific register indices.

pub const MSR_IA32_TSC: u32 = 0x0000_0010;
pub const MSR_IA32_APIC_BASE: u32 = 0x0000_001b;
pub const MSR_IA32_SYSENTER_CS: u32 = 0x0000_0174;
pub const MSR_IA32_SYSENTER_ESP: u32 = 0x0000_0175;
pub const MSR_IA32_SYSENTER_EIP: u32 = 0x0000_0176;
pub const MSR_IA32_MISC_ENABLE: u32 = 0x0000_01a0;
pub const MSR_IA32_CR_PAT: u32 = 0x0000_0277;
pub const MSR_MTRR_DEF_TYPE: u32 = 0x0000_02ff;
pub const MSR_EFER: u32 = 0xc000_0080;
pub const MSR_STAR: u32 = 0xc000_0081;
pub const MSR_LSTAR: u32 = 0xc000_0082;
pub const MSR_CSTAR: u32 = 0xc000_0083;
pub const MSR_SYSCALL_MASK: u32 = 0xc000_0084;
pub const MSR_FS_BASE: u32 = 0xc000_0100;
pub const MSR_GS_BASE: u32 = 0xc000_0101;
pub const MSR_KERNEL_GS_BASE: u32 = 0xc000_0102;
pub const MSR_TSC_AUX: u32 = 0xc000_0103;

pub const MSR_IA32_MISC_ENABLE_FAST_STRING: u64 = 0x1;

/// MSRs the guest commonly touches on every kernel entry and that are best
/// left to the platform instead of trapping.
pub const NATIVE_MSRS: [u32; 10] = [
    MSR_IA32_TSC,
    MSR_IA32_SYSENTER_CS,
    MSR_IA32_SYSENTER_ESP,
    MSR_IA32_SYSENTER_EIP,
    MSR_STAR,
    MSR_LSTAR,
    MSR_CSTAR,
    MSR_SYSCALL_MASK,
    MSR_KERNEL_GS_BASE,
    MSR_TSC_AUX,
];

/// Initial values for the MSRs a 64-bit kernel expects at entry.
pub fn boot_msr_entries() -> Vec<(u32, u64)> {
    vec![
        (MSR_IA32_SYSENTER_CS, 0x0),
        (MSR_IA32_SYSENTER_ESP, 0x0),
        (MSR_IA32_SYSENTER_EIP, 0x0),
        // x86_64 specific msrs
        (MSR_STAR, 0x0),
        (MSR_CSTAR, 0x0),
        (MSR_KERNEL_GS_BASE, 0x0),
        (MSR_SYSCALL_MASK, 0x0),
        (MSR_LSTAR, 0x0),
        // end of x86_64 specific code
        (MSR_IA32_TSC, 0x0),
        (MSR_IA32_MISC_ENABLE, MSR_IA32_MISC_ENABLE_FAST_STRING),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boot_msr_entries() {
        let entries = boot_msr_entries();
        assert_eq!(entries.len(), 10);
        assert!(entries
            .iter()
            .any(|&(msr, value)| msr == MSR_IA32_MISC_ENABLE
                && value == MSR_IA32_MISC_ENABLE_FAST_STRING));
        // every native msr is seeded at boot
        for msr in NATIVE_MSRS.iter().filter(|&&m| m != MSR_TSC_AUX) {
            assert!(entries.iter().any(|(index, _)| index == msr));
        }
    }
}
