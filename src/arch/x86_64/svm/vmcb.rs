//! Virtual Machine Control Block layout.
//!
//! Unlike the VMCS, every VMCB field sits at an architectural offset
//! inside one 4 KiB page: a 1 KiB control area followed by the state
//! save area. Plain loads and stores are the access primitive, so the
//! layout is a `repr(C)` struct checked against the offsets in the
//! AMD64 APM Volume 2, Appendix B.

#![allow(dead_code)]

use bitflags::bitflags;
use core::mem::{offset_of, size_of};

use crate::memory::PAGE_SIZE;

bitflags! {
    /// Intercept vector 3 (offset 0x00C).
    #[derive(Debug, Clone, Copy)]
    pub struct InterceptMisc1: u32 {
        const INTR          = 1 << 0;
        const NMI           = 1 << 1;
        const SMI           = 1 << 2;
        const RDTSC         = 1 << 14;
        const CPUID         = 1 << 18;
        const HLT           = 1 << 24;
        const INVLPG        = 1 << 25;
        /// Port I/O through the I/O permission map.
        const IOIO_PROT     = 1 << 27;
        /// MSR accesses through the MSR permission map.
        const MSR_PROT      = 1 << 28;
        const SHUTDOWN      = 1 << 31;
    }
}

bitflags! {
    /// Intercept vector 4 (offset 0x010).
    #[derive(Debug, Clone, Copy)]
    pub struct InterceptMisc2: u32 {
        /// Required set on every VMCB.
        const VMRUN         = 1 << 0;
        const VMMCALL       = 1 << 1;
        const VMLOAD        = 1 << 2;
        const VMSAVE        = 1 << 3;
        const STGI          = 1 << 4;
        const CLGI          = 1 << 5;
        const SKINIT        = 1 << 6;
    }
}

/// Intercept vector 3 covering descriptor-table accesses.
pub const INTERCEPT_IDTR_READ: u32 = 1 << 6;
pub const INTERCEPT_GDTR_READ: u32 = 1 << 7;
pub const INTERCEPT_LDTR_READ: u32 = 1 << 8;
pub const INTERCEPT_TR_READ: u32 = 1 << 9;
pub const INTERCEPT_IDTR_WRITE: u32 = 1 << 10;
pub const INTERCEPT_GDTR_WRITE: u32 = 1 << 11;
pub const INTERCEPT_LDTR_WRITE: u32 = 1 << 12;
pub const INTERCEPT_TR_WRITE: u32 = 1 << 13;
pub const INTERCEPT_DESCRIPTOR_ALL: u32 = INTERCEPT_IDTR_READ
    | INTERCEPT_GDTR_READ
    | INTERCEPT_LDTR_READ
    | INTERCEPT_TR_READ
    | INTERCEPT_IDTR_WRITE
    | INTERCEPT_GDTR_WRITE
    | INTERCEPT_LDTR_WRITE
    | INTERCEPT_TR_WRITE;

/// #VMEXIT codes this backend classifies.
pub mod exit_code {
    pub const INTR: u64 = 0x60;
    pub const NMI: u64 = 0x61;
    pub const CPUID: u64 = 0x72;
    pub const IDTR_READ: u64 = 0x66;
    pub const TR_WRITE: u64 = 0x6D;
    pub const HLT: u64 = 0x78;
    pub const IOIO: u64 = 0x7B;
    pub const MSR: u64 = 0x7C;
    pub const VMMCALL: u64 = 0x81;
    pub const NPF: u64 = 0x400;
    pub const INVALID: u64 = u64::MAX;
}

/// EVENTINJ field encoding (offset 0x0A8).
pub mod event_inj {
    pub const TYPE_EXTERNAL: u64 = 0 << 8;
    pub const TYPE_NMI: u64 = 2 << 8;
    pub const TYPE_EXCEPTION: u64 = 3 << 8;
    pub const TYPE_SOFT_INTR: u64 = 4 << 8;
    pub const ERROR_CODE_VALID: u64 = 1 << 11;
    pub const VALID: u64 = 1 << 31;
}

/// Segment register image: selector, 12-bit attributes, limit, base.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct VmcbSegment {
    pub selector: u16,
    pub attrib: u16,
    pub limit: u32,
    pub base: u64,
}

#[repr(C)]
pub struct VmcbControlArea {
    pub intercept_cr: u32,
    pub intercept_dr: u32,
    pub intercept_exceptions: u32,
    pub intercept_misc1: u32,
    pub intercept_misc2: u32,
    pub intercept_misc3: u32,
    _reserved_1: [u8; 0x24],
    pub pause_filter_threshold: u16,
    pub pause_filter_count: u16,
    pub iopm_base_pa: u64,
    pub msrpm_base_pa: u64,
    pub tsc_offset: u64,
    pub guest_asid: u32,
    pub tlb_control: u32,
    pub vintr: u64,
    pub interrupt_shadow: u64,
    pub exitcode: u64,
    pub exitinfo1: u64,
    pub exitinfo2: u64,
    pub exitintinfo: u64,
    pub np_enable: u64,
    pub avic_apic_bar: u64,
    pub ghcb_pa: u64,
    pub eventinj: u64,
    pub n_cr3: u64,
    pub lbr_virt_enable: u64,
    pub vmcb_clean: u64,
    pub next_rip: u64,
    pub insn_len: u8,
    pub insn_bytes: [u8; 15],
    _reserved_2: [u8; 0x320],
}

#[repr(C)]
pub struct VmcbSaveArea {
    pub es: VmcbSegment,
    pub cs: VmcbSegment,
    pub ss: VmcbSegment,
    pub ds: VmcbSegment,
    pub fs: VmcbSegment,
    pub gs: VmcbSegment,
    pub gdtr: VmcbSegment,
    pub ldtr: VmcbSegment,
    pub idtr: VmcbSegment,
    pub tr: VmcbSegment,
    _reserved_1: [u8; 0x2B],
    pub cpl: u8,
    _reserved_2: [u8; 4],
    pub efer: u64,
    _reserved_3: [u8; 0x70],
    pub cr4: u64,
    pub cr3: u64,
    pub cr0: u64,
    pub dr7: u64,
    pub dr6: u64,
    pub rflags: u64,
    pub rip: u64,
    _reserved_4: [u8; 0x58],
    pub rsp: u64,
    _reserved_5: [u8; 0x18],
    pub rax: u64,
    pub star: u64,
    pub lstar: u64,
    pub cstar: u64,
    pub sfmask: u64,
    pub kernel_gs_base: u64,
    pub sysenter_cs: u64,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
    pub cr2: u64,
    _reserved_6: [u8; 0x20],
    pub g_pat: u64,
    _reserved_7: [u8; 0x990],
}

#[repr(C)]
pub struct Vmcb {
    pub control: VmcbControlArea,
    pub save: VmcbSaveArea,
}

const _: () = {
    assert!(size_of::<VmcbControlArea>() == 0x400);
    assert!(size_of::<Vmcb>() == PAGE_SIZE);
    assert!(offset_of!(VmcbControlArea, iopm_base_pa) == 0x40);
    assert!(offset_of!(VmcbControlArea, guest_asid) == 0x58);
    assert!(offset_of!(VmcbControlArea, exitcode) == 0x70);
    assert!(offset_of!(VmcbControlArea, np_enable) == 0x90);
    assert!(offset_of!(VmcbControlArea, eventinj) == 0xA8);
    assert!(offset_of!(VmcbControlArea, n_cr3) == 0xB0);
    assert!(offset_of!(VmcbControlArea, next_rip) == 0xC8);
    assert!(offset_of!(VmcbControlArea, insn_len) == 0xD0);
    assert!(offset_of!(Vmcb, save) == 0x400);
    assert!(offset_of!(VmcbSaveArea, cpl) == 0xCB);
    assert!(offset_of!(VmcbSaveArea, efer) == 0xD0);
    assert!(offset_of!(VmcbSaveArea, cr4) == 0x148);
    assert!(offset_of!(VmcbSaveArea, rip) == 0x178);
    assert!(offset_of!(VmcbSaveArea, rsp) == 0x1D8);
    assert!(offset_of!(VmcbSaveArea, rax) == 0x1F8);
    assert!(offset_of!(VmcbSaveArea, cr2) == 0x240);
    assert!(offset_of!(VmcbSaveArea, g_pat) == 0x268);
};
