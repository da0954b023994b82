// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! VMX processor-control-structure field encodings and capability classes.

use std::fmt;

/// Encoding of a VMCS field as defined by the Intel SDM (Vol. 3, App. B).
#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct VmcsField(pub u32);

impl VmcsField {
    // 16-bit control fields
    pub const VPID: VmcsField = VmcsField(0x0000);
    pub const CTRL_POSTED_INT_N_VECTOR: VmcsField = VmcsField(0x0002);
    pub const CTRL_EPTP_INDEX: VmcsField = VmcsField(0x0004);

    // 16-bit guest-state fields
    pub const GUEST_ES: VmcsField = VmcsField(0x0800);
    pub const GUEST_CS: VmcsField = VmcsField(0x0802);
    pub const GUEST_SS: VmcsField = VmcsField(0x0804);
    pub const GUEST_DS: VmcsField = VmcsField(0x0806);
    pub const GUEST_FS: VmcsField = VmcsField(0x0808);
    pub const GUEST_GS: VmcsField = VmcsField(0x080a);
    pub const GUEST_LDTR: VmcsField = VmcsField(0x080c);
    pub const GUEST_TR: VmcsField = VmcsField(0x080e);
    pub const GUEST_INT_STATUS: VmcsField = VmcsField(0x0810);

    // 16-bit host-state fields
    pub const HOST_ES: VmcsField = VmcsField(0x0c00);
    pub const HOST_CS: VmcsField = VmcsField(0x0c02);
    pub const HOST_SS: VmcsField = VmcsField(0x0c04);
    pub const HOST_DS: VmcsField = VmcsField(0x0c06);
    pub const HOST_FS: VmcsField = VmcsField(0x0c08);
    pub const HOST_GS: VmcsField = VmcsField(0x0c0a);
    pub const HOST_TR: VmcsField = VmcsField(0x0c0c);

    // 64-bit control fields
    pub const CTRL_IO_BITMAP_A: VmcsField = VmcsField(0x2000);
    pub const CTRL_IO_BITMAP_B: VmcsField = VmcsField(0x2002);
    pub const CTRL_MSR_BITMAPS: VmcsField = VmcsField(0x2004);
    pub const CTRL_VMEXIT_MSR_STORE_ADDR: VmcsField = VmcsField(0x2006);
    pub const CTRL_VMEXIT_MSR_LOAD_ADDR: VmcsField = VmcsField(0x2008);
    pub const CTRL_VMENTRY_MSR_LOAD_ADDR: VmcsField = VmcsField(0x200a);
    pub const CTRL_EXECUTIVE_VMCS_PTR: VmcsField = VmcsField(0x200c);
    pub const CTRL_TSC_OFFSET: VmcsField = VmcsField(0x2010);
    pub const CTRL_VIRTUAL_APIC: VmcsField = VmcsField(0x2012);
    pub const CTRL_APIC_ACCESS: VmcsField = VmcsField(0x2014);
    pub const CTRL_POSTED_INT_DESC_ADDR: VmcsField = VmcsField(0x2016);
    pub const CTRL_VMFUNC_CTRL: VmcsField = VmcsField(0x2018);
    pub const CTRL_EPTP: VmcsField = VmcsField(0x201a);
    pub const CTRL_EOI_EXIT_BITMAP_0: VmcsField = VmcsField(0x201c);
    pub const CTRL_EOI_EXIT_BITMAP_1: VmcsField = VmcsField(0x201e);
    pub const CTRL_EOI_EXIT_BITMAP_2: VmcsField = VmcsField(0x2020);
    pub const CTRL_EOI_EXIT_BITMAP_3: VmcsField = VmcsField(0x2022);

    // 64-bit read-only data field
    pub const GUEST_PHYSICAL_ADDRESS: VmcsField = VmcsField(0x2400);

    // 64-bit guest-state fields
    pub const GUEST_LINK_POINTER: VmcsField = VmcsField(0x2800);
    pub const GUEST_IA32_DEBUGCTL: VmcsField = VmcsField(0x2802);
    pub const GUEST_IA32_PAT: VmcsField = VmcsField(0x2804);
    pub const GUEST_IA32_EFER: VmcsField = VmcsField(0x2806);
    pub const GUEST_IA32_PERF_GLOBAL_CTRL: VmcsField = VmcsField(0x2808);
    pub const GUEST_PDPTE0: VmcsField = VmcsField(0x280a);
    pub const GUEST_PDPTE1: VmcsField = VmcsField(0x280c);
    pub const GUEST_PDPTE2: VmcsField = VmcsField(0x280e);
    pub const GUEST_PDPTE3: VmcsField = VmcsField(0x2810);

    // 64-bit host-state fields
    pub const HOST_IA32_PAT: VmcsField = VmcsField(0x2c00);
    pub const HOST_IA32_EFER: VmcsField = VmcsField(0x2c02);
    pub const HOST_IA32_PERF_GLOBAL_CTRL: VmcsField = VmcsField(0x2c04);

    // 32-bit control fields
    pub const CTRL_PIN_BASED: VmcsField = VmcsField(0x4000);
    pub const CTRL_CPU_BASED: VmcsField = VmcsField(0x4002);
    pub const CTRL_EXC_BITMAP: VmcsField = VmcsField(0x4004);
    pub const CTRL_PF_ERROR_MASK: VmcsField = VmcsField(0x4006);
    pub const CTRL_PF_ERROR_MATCH: VmcsField = VmcsField(0x4008);
    pub const CTRL_CR3_COUNT: VmcsField = VmcsField(0x400a);
    pub const CTRL_VMEXIT_CONTROLS: VmcsField = VmcsField(0x400c);
    pub const CTRL_VMEXIT_MSR_STORE_COUNT: VmcsField = VmcsField(0x400e);
    pub const CTRL_VMEXIT_MSR_LOAD_COUNT: VmcsField = VmcsField(0x4010);
    pub const CTRL_VMENTRY_CONTROLS: VmcsField = VmcsField(0x4012);
    pub const CTRL_VMENTRY_MSR_LOAD_COUNT: VmcsField = VmcsField(0x4014);
    pub const CTRL_VMENTRY_IRQ_INFO: VmcsField = VmcsField(0x4016);
    pub const CTRL_VMENTRY_EXC_ERROR: VmcsField = VmcsField(0x4018);
    pub const CTRL_VMENTRY_INSTR_LEN: VmcsField = VmcsField(0x401a);
    pub const CTRL_TPR_THRESHOLD: VmcsField = VmcsField(0x401c);
    pub const CTRL_CPU_BASED2: VmcsField = VmcsField(0x401e);
    pub const CTRL_PLE_GAP: VmcsField = VmcsField(0x4020);
    pub const CTRL_PLE_WINDOW: VmcsField = VmcsField(0x4022);

    // 32-bit read-only data fields
    pub const RO_INSTR_ERROR: VmcsField = VmcsField(0x4400);
    pub const RO_EXIT_REASON: VmcsField = VmcsField(0x4402);
    pub const RO_VMEXIT_IRQ_INFO: VmcsField = VmcsField(0x4404);
    pub const RO_VMEXIT_IRQ_ERROR: VmcsField = VmcsField(0x4406);
    pub const RO_IDT_VECTOR_INFO: VmcsField = VmcsField(0x4408);
    pub const RO_IDT_VECTOR_ERROR: VmcsField = VmcsField(0x440a);
    pub const RO_VMEXIT_INSTR_LEN: VmcsField = VmcsField(0x440c);
    pub const RO_VMX_INSTR_INFO: VmcsField = VmcsField(0x440e);

    // 32-bit guest-state fields
    pub const GUEST_ES_LIMIT: VmcsField = VmcsField(0x4800);
    pub const GUEST_CS_LIMIT: VmcsField = VmcsField(0x4802);
    pub const GUEST_SS_LIMIT: VmcsField = VmcsField(0x4804);
    pub const GUEST_DS_LIMIT: VmcsField = VmcsField(0x4806);
    pub const GUEST_FS_LIMIT: VmcsField = VmcsField(0x4808);
    pub const GUEST_GS_LIMIT: VmcsField = VmcsField(0x480a);
    pub const GUEST_LDTR_LIMIT: VmcsField = VmcsField(0x480c);
    pub const GUEST_TR_LIMIT: VmcsField = VmcsField(0x480e);
    pub const GUEST_GDTR_LIMIT: VmcsField = VmcsField(0x4810);
    pub const GUEST_IDTR_LIMIT: VmcsField = VmcsField(0x4812);
    pub const GUEST_ES_AR: VmcsField = VmcsField(0x4814);
    pub const GUEST_CS_AR: VmcsField = VmcsField(0x4816);
    pub const GUEST_SS_AR: VmcsField = VmcsField(0x4818);
    pub const GUEST_DS_AR: VmcsField = VmcsField(0x481a);
    pub const GUEST_FS_AR: VmcsField = VmcsField(0x481c);
    pub const GUEST_GS_AR: VmcsField = VmcsField(0x481e);
    pub const GUEST_LDTR_AR: VmcsField = VmcsField(0x4820);
    pub const GUEST_TR_AR: VmcsField = VmcsField(0x4822);
    pub const GUEST_INTERRUPTIBILITY: VmcsField = VmcsField(0x4824);
    pub const GUEST_ACTIVITY_STATE: VmcsField = VmcsField(0x4826);
    pub const GUEST_SMBASE: VmcsField = VmcsField(0x4828);
    pub const GUEST_IA32_SYSENTER_CS: VmcsField = VmcsField(0x482a);
    pub const GUEST_VMX_TIMER_VALUE: VmcsField = VmcsField(0x482e);

    // 32-bit host-state field
    pub const HOST_IA32_SYSENTER_CS: VmcsField = VmcsField(0x4c00);

    // natural-width control fields
    pub const CTRL_CR0_MASK: VmcsField = VmcsField(0x6000);
    pub const CTRL_CR4_MASK: VmcsField = VmcsField(0x6002);
    pub const CTRL_CR0_SHADOW: VmcsField = VmcsField(0x6004);
    pub const CTRL_CR4_SHADOW: VmcsField = VmcsField(0x6006);
    pub const CTRL_CR3_VALUE0: VmcsField = VmcsField(0x6008);
    pub const CTRL_CR3_VALUE1: VmcsField = VmcsField(0x600a);
    pub const CTRL_CR3_VALUE2: VmcsField = VmcsField(0x600c);
    pub const CTRL_CR3_VALUE3: VmcsField = VmcsField(0x600e);

    // natural-width read-only data fields
    pub const RO_EXIT_QUALIFIC: VmcsField = VmcsField(0x6400);
    pub const RO_IO_RCX: VmcsField = VmcsField(0x6402);
    pub const RO_IO_RSI: VmcsField = VmcsField(0x6404);
    pub const RO_IO_RDI: VmcsField = VmcsField(0x6406);
    pub const RO_IO_RIP: VmcsField = VmcsField(0x6408);
    pub const RO_GUEST_LIN_ADDR: VmcsField = VmcsField(0x640a);

    // natural-width guest-state fields
    pub const GUEST_CR0: VmcsField = VmcsField(0x6800);
    pub const GUEST_CR3: VmcsField = VmcsField(0x6802);
    pub const GUEST_CR4: VmcsField = VmcsField(0x6804);
    pub const GUEST_ES_BASE: VmcsField = VmcsField(0x6806);
    pub const GUEST_CS_BASE: VmcsField = VmcsField(0x6808);
    pub const GUEST_SS_BASE: VmcsField = VmcsField(0x680a);
    pub const GUEST_DS_BASE: VmcsField = VmcsField(0x680c);
    pub const GUEST_FS_BASE: VmcsField = VmcsField(0x680e);
    pub const GUEST_GS_BASE: VmcsField = VmcsField(0x6810);
    pub const GUEST_LDTR_BASE: VmcsField = VmcsField(0x6812);
    pub const GUEST_TR_BASE: VmcsField = VmcsField(0x6814);
    pub const GUEST_GDTR_BASE: VmcsField = VmcsField(0x6816);
    pub const GUEST_IDTR_BASE: VmcsField = VmcsField(0x6818);
    pub const GUEST_DR7: VmcsField = VmcsField(0x681a);
    pub const GUEST_RSP: VmcsField = VmcsField(0x681c);
    pub const GUEST_RIP: VmcsField = VmcsField(0x681e);
    pub const GUEST_RFLAGS: VmcsField = VmcsField(0x6820);
    pub const GUEST_DEBUG_EXC: VmcsField = VmcsField(0x6822);
    pub const GUEST_SYSENTER_ESP: VmcsField = VmcsField(0x6824);
    pub const GUEST_SYSENTER_EIP: VmcsField = VmcsField(0x6826);

    // natural-width host-state fields
    pub const HOST_CR0: VmcsField = VmcsField(0x6c00);
    pub const HOST_CR3: VmcsField = VmcsField(0x6c02);
    pub const HOST_CR4: VmcsField = VmcsField(0x6c04);
    pub const HOST_FS_BASE: VmcsField = VmcsField(0x6c06);
    pub const HOST_GS_BASE: VmcsField = VmcsField(0x6c08);
    pub const HOST_TR_BASE: VmcsField = VmcsField(0x6c0a);
    pub const HOST_GDTR_BASE: VmcsField = VmcsField(0x6c0c);
    pub const HOST_IDTR_BASE: VmcsField = VmcsField(0x6c0e);
    pub const HOST_IA32_SYSENTER_ESP: VmcsField = VmcsField(0x6c10);
    pub const HOST_IA32_SYSENTER_EIP: VmcsField = VmcsField(0x6c12);
    pub const HOST_RSP: VmcsField = VmcsField(0x6c14);
    pub const HOST_RIP: VmcsField = VmcsField(0x6c16);

    pub fn encoding(self) -> u32 {
        self.0
    }

    /// Read-only fields live in the "VM-exit information" group (type bits 11:10 == 1).
    pub fn is_read_only(self) -> bool {
        (self.0 >> 10) & 0x3 == 1
    }
}

impl fmt::Debug for VmcsField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VmcsField({:#06x})", self.0)
    }
}

/// Basic exit reasons reported in `VmcsField::RO_EXIT_REASON`.
pub mod exit_reason {
    pub const EXC_NMI: u64 = 0;
    pub const IRQ: u64 = 1;
    pub const TRIPLE_FAULT: u64 = 2;
    pub const INIT: u64 = 3;
    pub const SIPI: u64 = 4;
    pub const IRQ_WND: u64 = 7;
    pub const VIRTUAL_NMI_WND: u64 = 8;
    pub const TASK: u64 = 9;
    pub const CPUID: u64 = 10;
    pub const HLT: u64 = 12;
    pub const INVLPG: u64 = 14;
    pub const RDTSC: u64 = 16;
    pub const VMCALL: u64 = 18;
    pub const MOV_CR: u64 = 28;
    pub const MOV_DR: u64 = 29;
    pub const IO: u64 = 30;
    pub const RDMSR: u64 = 31;
    pub const WRMSR: u64 = 32;
    pub const VMENTRY_GUEST: u64 = 33;
    pub const MTF: u64 = 37;
    pub const PAUSE: u64 = 40;
    pub const TPR_THRESHOLD: u64 = 43;
    pub const APIC_ACCESS: u64 = 44;
    pub const EPT_VIOLATION: u64 = 48;
    pub const EPT_MISCONFIG: u64 = 49;
    pub const RDTSCP: u64 = 51;
    pub const VMX_TIMER_EXPIRED: u64 = 52;
    pub const XSETBV: u64 = 55;
}

/// Classes of VMX capability the platform reports as 64-bit masks.
///
/// The low 32 bits hold the allowed 0-settings of the matching control
/// field, the high 32 bits the allowed 1-settings.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u32)]
pub enum VmxCapability {
    PinBased = 0,
    ProcBased = 1,
    ProcBased2 = 2,
    Entry = 3,
    Exit = 4,
    PreemptionTimer = 32,
}

impl VmxCapability {
    pub const ALL: [VmxCapability; 6] = [
        VmxCapability::PinBased,
        VmxCapability::ProcBased,
        VmxCapability::ProcBased2,
        VmxCapability::Entry,
        VmxCapability::Exit,
        VmxCapability::PreemptionTimer,
    ];

    pub fn name(self) -> &'static str {
        match self {
            VmxCapability::PinBased => "pin-based",
            VmxCapability::ProcBased => "processor-based",
            VmxCapability::ProcBased2 => "secondary processor-based",
            VmxCapability::Entry => "vm-entry",
            VmxCapability::Exit => "vm-exit",
            VmxCapability::PreemptionTimer => "preemption timer",
        }
    }
}

/// Computes a control value honoring the allowed 0/1 settings of `cap`.
pub fn cap2ctrl(cap: u64, ctrl: u64) -> u64 {
    (ctrl | (cap & 0xffff_ffff)) & (cap >> 32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_only_group() {
        assert!(VmcsField::RO_EXIT_REASON.is_read_only());
        assert!(VmcsField::RO_EXIT_QUALIFIC.is_read_only());
        assert!(VmcsField::GUEST_PHYSICAL_ADDRESS.is_read_only());
        assert!(!VmcsField::GUEST_RIP.is_read_only());
        assert!(!VmcsField::CTRL_PIN_BASED.is_read_only());
        assert!(!VmcsField::HOST_RIP.is_read_only());
    }

    #[test]
    fn test_cap2ctrl() {
        // bits 1,2,4 must be one, only bits 0..8 may be one
        let cap = (0xffu64 << 32) | 0x16;
        assert_eq!(cap2ctrl(cap, 0), 0x16);
        assert_eq!(cap2ctrl(cap, 0x101), 0x17);
    }

    #[test]
    fn test_debug_format() {
        assert_eq!(format!("{:?}", VmcsField::GUEST_RIP), "VmcsField(0x681e)");
    }
}
