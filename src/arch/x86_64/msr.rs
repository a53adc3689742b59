//! Model-specific registers used by the vendor backends.
//!
//! See Volume 3, Appendix A: VMX Capability Reporting Facility, and the
//! AMD64 APM Volume 2, Section 15.30 for the SVM side.

#![allow(dead_code)]

use bit_field::BitField;
use bitflags::bitflags;

pub use x86_64::registers::model_specific::Msr;

/// Architectural MSR indices handled by the virtualization policy.
pub const IA32_TSC: u32 = 0x10;
pub const IA32_APIC_BASE: u32 = 0x1B;
pub const IA32_MTRR_CAP: u32 = 0xFE;
pub const IA32_PAT: u32 = 0x277;
pub const IA32_EFER: u32 = 0xC000_0080;
pub const IA32_FS_BASE: u32 = 0xC000_0100;
pub const IA32_GS_BASE: u32 = 0xC000_0101;

/// VMX capability MSRs.
pub const IA32_VMX_PINBASED_CTLS: u32 = 0x481;
pub const IA32_VMX_PROCBASED_CTLS: u32 = 0x482;
pub const IA32_VMX_EXIT_CTLS: u32 = 0x483;
pub const IA32_VMX_ENTRY_CTLS: u32 = 0x484;
pub const IA32_VMX_CR0_FIXED0: u32 = 0x486;
pub const IA32_VMX_CR0_FIXED1: u32 = 0x487;
pub const IA32_VMX_CR4_FIXED0: u32 = 0x488;
pub const IA32_VMX_CR4_FIXED1: u32 = 0x489;
pub const IA32_VMX_PROCBASED_CTLS2: u32 = 0x48B;
pub const IA32_VMX_TRUE_PINBASED_CTLS: u32 = 0x48D;
pub const IA32_VMX_TRUE_PROCBASED_CTLS: u32 = 0x48E;
pub const IA32_VMX_TRUE_EXIT_CTLS: u32 = 0x48F;
pub const IA32_VMX_TRUE_ENTRY_CTLS: u32 = 0x490;

/// SVM host-save-area pointer, written once per logical CPU.
pub const VM_HSAVE_PA: u32 = 0xC001_0117;

/// EFER.SVME, required set while SVM is in use.
pub const EFER_SVME: u64 = 1 << 12;

pub(crate) trait MsrReadWrite {
    const MSR: Msr;

    #[inline]
    fn read_raw() -> u64 {
        unsafe { Self::MSR.read() }
    }

    /// Write the MSR, not preserving any bits.
    #[inline]
    unsafe fn write_raw(flags: u64) {
        let mut msr = Self::MSR;
        msr.write(flags);
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy)]
    pub struct VmxBasicFlags: u64 {
        /// VM exits on INS/OUTS report instruction information.
        const IO_EXIT_INFO = 1 << 54;
        /// The TRUE_*_CTLS capability MSRs exist and default-1 controls
        /// may be cleared.
        const VMX_FLEX_CONTROLS = 1 << 55;
    }
}

/// Decoded view of IA32_VMX_BASIC.
#[derive(Debug)]
pub struct VmxBasic {
    pub revision_id: u32,
    pub region_size: u16,
    pub write_back: bool,
    pub io_exit_info: bool,
    pub vmx_flex_controls: bool,
}

impl MsrReadWrite for VmxBasic {
    const MSR: Msr = Msr::new(x86::msr::IA32_VMX_BASIC);
}

impl VmxBasic {
    pub fn read() -> Self {
        const VMX_MEMORY_TYPE_WRITE_BACK: u64 = 6;
        let msr = Self::read_raw();
        let flags = VmxBasicFlags::from_bits_truncate(msr);
        Self {
            revision_id: msr.get_bits(0..31) as u32,
            region_size: msr.get_bits(32..45) as u16,
            write_back: msr.get_bits(50..54) == VMX_MEMORY_TYPE_WRITE_BACK,
            io_exit_info: flags.contains(VmxBasicFlags::IO_EXIT_INFO),
            vmx_flex_controls: flags.contains(VmxBasicFlags::VMX_FLEX_CONTROLS),
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FeatureControlFlags: u64 {
        /// When set this MSR is locked against further writes.
        const LOCKED = 1 << 0;
        const VMXON_ENABLED_INSIDE_SMX = 1 << 1;
        const VMXON_ENABLED_OUTSIDE_SMX = 1 << 2;
    }
}

/// IA32_FEATURE_CONTROL.
#[derive(Debug)]
pub struct FeatureControl;

impl MsrReadWrite for FeatureControl {
    const MSR: Msr = Msr::new(x86::msr::IA32_FEATURE_CONTROL);
}

impl FeatureControl {
    pub fn read() -> FeatureControlFlags {
        FeatureControlFlags::from_bits_truncate(Self::read_raw())
    }

    /// Write the flag bits, preserving reserved fields.
    pub unsafe fn write(flags: FeatureControlFlags) {
        let old_value = Self::read_raw();
        let reserved = old_value & !FeatureControlFlags::all().bits();
        Self::write_raw(reserved | flags.bits());
    }
}
