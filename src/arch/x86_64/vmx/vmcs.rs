//! Virtual Machine Control Structure access.
//!
//! Fields are addressed by their 16-bit encodings through VMREAD/VMWRITE
//! against the VMCS currently loaded on the logical CPU. The host is
//! 64-bit only, so every field is moved through a full register and the
//! width split of the encoding space matters only for documentation.

use bitflags::bitflags;
use x86::bits64::vmx;

use crate::{VmmError, VmmResult};

/// VMCS field encodings, grouped the way Volume 3, Appendix B lays them
/// out: control, read-only data, guest state, host state.
#[repr(u32)]
#[allow(dead_code)]
#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug)]
pub enum VmcsField {
    // 16-bit guest state
    GUEST_ES_SELECTOR = 0x800,
    GUEST_CS_SELECTOR = 0x802,
    GUEST_SS_SELECTOR = 0x804,
    GUEST_DS_SELECTOR = 0x806,
    GUEST_FS_SELECTOR = 0x808,
    GUEST_GS_SELECTOR = 0x80A,
    GUEST_LDTR_SELECTOR = 0x80C,
    GUEST_TR_SELECTOR = 0x80E,

    // 16-bit host state
    HOST_ES_SELECTOR = 0xC00,
    HOST_CS_SELECTOR = 0xC02,
    HOST_SS_SELECTOR = 0xC04,
    HOST_DS_SELECTOR = 0xC06,
    HOST_FS_SELECTOR = 0xC08,
    HOST_GS_SELECTOR = 0xC0A,
    HOST_TR_SELECTOR = 0xC0C,

    // 64-bit control
    EPT_POINTER = 0x201A,
    VMCS_LINK_POINTER = 0x2800,

    // 64-bit read-only data
    GUEST_PHYSICAL_ADDRESS = 0x2400,

    // 64-bit guest state
    GUEST_IA32_PAT = 0x2804,
    GUEST_IA32_EFER = 0x2806,

    // 64-bit host state
    HOST_IA32_PAT = 0x2C00,
    HOST_IA32_EFER = 0x2C02,

    // 32-bit control
    PIN_BASED_VM_EXEC_CONTROL = 0x4000,
    CPU_BASED_VM_EXEC_CONTROL = 0x4002,
    EXCEPTION_BITMAP = 0x4004,
    PAGE_FAULT_ERROR_CODE_MASK = 0x4006,
    PAGE_FAULT_ERROR_CODE_MATCH = 0x4008,
    VM_EXIT_CONTROLS = 0x400C,
    VM_ENTRY_CONTROLS = 0x4012,
    VM_ENTRY_INTR_INFO = 0x4016,
    VM_ENTRY_EXCEPTION_ERROR_CODE = 0x4018,
    SECONDARY_VM_EXEC_CONTROL = 0x401E,

    // 32-bit read-only data
    VM_INSTRUCTION_ERROR = 0x4400,
    VM_EXIT_REASON = 0x4402,
    VM_EXIT_INSTRUCTION_LEN = 0x440C,

    // 32-bit guest state
    GUEST_ES_LIMIT = 0x4800,
    GUEST_CS_LIMIT = 0x4802,
    GUEST_SS_LIMIT = 0x4804,
    GUEST_DS_LIMIT = 0x4806,
    GUEST_FS_LIMIT = 0x4808,
    GUEST_GS_LIMIT = 0x480A,
    GUEST_LDTR_LIMIT = 0x480C,
    GUEST_TR_LIMIT = 0x480E,
    GUEST_GDTR_LIMIT = 0x4810,
    GUEST_IDTR_LIMIT = 0x4812,
    GUEST_ES_AR_BYTES = 0x4814,
    GUEST_CS_AR_BYTES = 0x4816,
    GUEST_SS_AR_BYTES = 0x4818,
    GUEST_DS_AR_BYTES = 0x481A,
    GUEST_FS_AR_BYTES = 0x481C,
    GUEST_GS_AR_BYTES = 0x481E,
    GUEST_LDTR_AR_BYTES = 0x4820,
    GUEST_TR_AR_BYTES = 0x4822,
    GUEST_INTERRUPTIBILITY_STATE = 0x4824,
    GUEST_ACTIVITY_STATE = 0x4826,
    GUEST_IA32_SYSENTER_CS = 0x482A,

    // 32-bit host state
    HOST_IA32_SYSENTER_CS = 0x4C00,

    // Natural-width read-only data
    EXIT_QUALIFICATION = 0x6400,

    // Natural-width guest state
    GUEST_CR0 = 0x6800,
    GUEST_CR3 = 0x6802,
    GUEST_CR4 = 0x6804,
    GUEST_ES_BASE = 0x6806,
    GUEST_CS_BASE = 0x6808,
    GUEST_SS_BASE = 0x680A,
    GUEST_DS_BASE = 0x680C,
    GUEST_FS_BASE = 0x680E,
    GUEST_GS_BASE = 0x6810,
    GUEST_LDTR_BASE = 0x6812,
    GUEST_TR_BASE = 0x6814,
    GUEST_GDTR_BASE = 0x6816,
    GUEST_IDTR_BASE = 0x6818,
    GUEST_DR7 = 0x681A,
    GUEST_RSP = 0x681C,
    GUEST_RIP = 0x681E,
    GUEST_RFLAGS = 0x6820,
    GUEST_PENDING_DBG_EXCEPTIONS = 0x6822,
    GUEST_IA32_SYSENTER_ESP = 0x6824,
    GUEST_IA32_SYSENTER_EIP = 0x6826,

    // Natural-width control
    CR0_GUEST_HOST_MASK = 0x6000,
    CR4_GUEST_HOST_MASK = 0x6002,
    CR0_READ_SHADOW = 0x6004,
    CR4_READ_SHADOW = 0x6006,

    // Natural-width host state
    HOST_CR0 = 0x6C00,
    HOST_CR3 = 0x6C02,
    HOST_CR4 = 0x6C04,
    HOST_FS_BASE = 0x6C06,
    HOST_GS_BASE = 0x6C08,
    HOST_TR_BASE = 0x6C0A,
    HOST_GDTR_BASE = 0x6C0C,
    HOST_IDTR_BASE = 0x6C0E,
    HOST_IA32_SYSENTER_ESP = 0x6C10,
    HOST_IA32_SYSENTER_EIP = 0x6C12,
    HOST_RSP = 0x6C14,
    HOST_RIP = 0x6C16,
}

bitflags! {
    /// Pin-based VM-execution controls.
    #[derive(Debug, Clone, Copy)]
    pub struct PinBasedControls: u32 {
        /// VM exit on vectored external interrupts.
        const INTR_EXITING      = 1 << 0;
        /// VM exit on NMIs.
        const NMI_EXITING       = 1 << 3;
    }
}

bitflags! {
    /// Primary processor-based VM-execution controls.
    #[derive(Debug, Clone, Copy)]
    pub struct CpuBasedControls: u32 {
        /// VM exit when interrupts become deliverable in the guest.
        const INTR_WINDOW_EXITING   = 1 << 2;
        /// VM exit on HLT.
        const HLT_EXITING           = 1 << 7;
        /// VM exit on writes to CR3.
        const CR3_LOAD_EXITING      = 1 << 15;
        /// VM exit on reads of CR3.
        const CR3_STORE_EXITING     = 1 << 16;
        /// VM exit on all IN/OUT variants.
        const UNCOND_IO_EXITING     = 1 << 24;
        /// Consult the MSR bitmaps instead of exiting on every RDMSR and
        /// WRMSR. Left clear here so all MSR accesses reach the policy.
        const USE_MSR_BITMAPS       = 1 << 28;
        /// Enable the secondary controls word.
        const SEC_CONTROLS          = 1 << 31;
    }
}

bitflags! {
    /// Secondary processor-based VM-execution controls.
    #[derive(Debug, Clone, Copy)]
    pub struct SecondaryControls: u32 {
        /// Extended page tables.
        const EPT                   = 1 << 1;
        /// VM exit on descriptor-table loads and stores.
        const DESC_EXITING          = 1 << 2;
        /// Allow real mode and other states long-mode VMX normally
        /// forbids.
        const UNRESTRICTED_GUEST    = 1 << 7;
    }
}

bitflags! {
    /// VM-exit controls.
    #[derive(Debug, Clone, Copy)]
    pub struct VmExitControls: u32 {
        /// Host is 64-bit.
        const HOST_ADDR_SPACE_SIZE  = 1 << 9;
        const SAVE_IA32_PAT         = 1 << 18;
        const LOAD_IA32_PAT         = 1 << 19;
        const SAVE_IA32_EFER        = 1 << 20;
        const LOAD_IA32_EFER        = 1 << 21;
    }
}

bitflags! {
    /// VM-entry controls.
    #[derive(Debug, Clone, Copy)]
    pub struct VmEntryControls: u32 {
        /// Guest is in IA-32e mode after entry; must mirror EFER.LMA.
        const IA32E_MODE            = 1 << 9;
        const LOAD_IA32_PAT         = 1 << 14;
        const LOAD_IA32_EFER        = 1 << 15;
    }
}

bitflags! {
    /// Guest segment access rights, Volume 3, Section 24.4.1.
    #[derive(Debug, Clone, Copy)]
    pub struct AccessRights: u32 {
        const ACCESSED      = 1 << 0;
        const WRITABLE      = 1 << 1;
        const EXECUTABLE    = 1 << 3;
        const CODE_DATA     = 1 << 4;
        const PRESENT       = 1 << 7;
        const AVL           = 1 << 12;
        const LONG_MODE     = 1 << 13;
        const DB            = 1 << 14;
        const GRANULARITY   = 1 << 15;
        /// Segment unusable; set for a non-present segment.
        const UNUSABLE      = 1 << 16;
    }
}

/// VM-entry interruption information, Volume 3, Section 24.8.3.
pub mod intr_info {
    pub const TYPE_EXTERNAL: u32 = 0 << 8;
    pub const TYPE_NMI: u32 = 2 << 8;
    pub const TYPE_HARD_EXCEPTION: u32 = 3 << 8;
    pub const TYPE_SOFT_INTR: u32 = 4 << 8;
    pub const DELIVER_ERROR_CODE: u32 = 1 << 11;
    pub const VALID: u32 = 1 << 31;
}

/// Accessor for the VMCS loaded on this logical CPU. Constructing it
/// performs the VMPTRLD; the vCPU thread owns the CPU for the duration.
#[derive(Debug)]
pub struct Vmcs {
    vmcs_paddr: u64,
}

impl Vmcs {
    pub fn load(vmcs_paddr: u64) -> VmmResult<Self> {
        unsafe { vmx::vmptrld(vmcs_paddr).map_err(|_| VmmError::DeviceError)? };
        Ok(Self { vmcs_paddr })
    }

    pub fn read(&self, field: VmcsField) -> u64 {
        debug_assert!(self.vmcs_paddr != 0);
        unsafe {
            vmx::vmread(field as u32).unwrap_or_else(|_| {
                panic!("[VMM] vmread failed, field {:#x}", field as u32);
            })
        }
    }

    pub fn write(&mut self, field: VmcsField, value: u64) {
        debug_assert!(self.vmcs_paddr != 0);
        unsafe {
            if vmx::vmwrite(field as u32, value).is_err() {
                warn!(
                    "[VMM] vmwrite failed, field {:#x} value {:#x}",
                    field as u32, value
                );
            }
        }
    }

    /// Program a control word under the capability MSR's constraints.
    ///
    /// `set` must be within allowed-1 and `clear` within allowed-0 or the
    /// feature is simply not available on this CPU. Flexible bits not
    /// named by either take their default from `old_msr`. See Volume 3,
    /// Section 31.5.1, Algorithm 3.
    pub fn set_control(
        &mut self,
        field: VmcsField,
        true_msr: u64,
        old_msr: u64,
        set: u32,
        clear: u32,
    ) -> VmmResult {
        let allowed_0 = true_msr as u32;
        let allowed_1 = (true_msr >> 32) as u32;
        if (allowed_1 & set) != set {
            warn!("[VMM] vmcs: cannot set bits {:#x} of {:?}", set, field);
            return Err(VmmError::NotSupported);
        }
        if (!allowed_0 & clear) != clear {
            warn!("[VMM] vmcs: cannot clear bits {:#x} of {:?}", clear, field);
            return Err(VmmError::NotSupported);
        }
        if (set & clear) != 0 {
            return Err(VmmError::InvalidParam);
        }

        let flexible = allowed_0 ^ allowed_1;
        let unknown = flexible & !(set | clear);
        let defaults = unknown & old_msr as u32;
        self.write(field, (allowed_0 | defaults | set) as u64);
        Ok(())
    }
}

/// Decoded VM-instruction error, Volume 3, Section 30.4.
pub struct VmInstructionError(pub u64);

impl VmInstructionError {
    pub fn explain(&self) -> &'static str {
        match self.0 {
            1 => "VMCALL executed in VMX root operation",
            2 => "VMCLEAR with invalid physical address",
            4 => "VMLAUNCH with non-clear VMCS",
            5 => "VMRESUME with non-launched VMCS",
            7 => "VM entry with invalid control field(s)",
            8 => "VM entry with invalid host-state field(s)",
            9 => "VMPTRLD with invalid physical address",
            11 => "VMPTRLD with incorrect VMCS revision identifier",
            12 => "VMREAD/VMWRITE from/to unsupported VMCS component",
            13 => "VMWRITE to read-only VMCS component",
            26 => "VM entry with events blocked by MOV SS",
            _ => "unknown VM-instruction error",
        }
    }
}

impl core::fmt::Debug for VmInstructionError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "VmInstructionError({}, {:?})", self.0, self.explain())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The control-mask algorithm is pure; feed it synthetic capability
    // MSRs instead of hardware ones.
    fn resolve(true_msr: u64, old_msr: u64, set: u32, clear: u32) -> Result<u32, VmmError> {
        let allowed_0 = true_msr as u32;
        let allowed_1 = (true_msr >> 32) as u32;
        if (allowed_1 & set) != set {
            return Err(VmmError::NotSupported);
        }
        if (!allowed_0 & clear) != clear {
            return Err(VmmError::NotSupported);
        }
        if (set & clear) != 0 {
            return Err(VmmError::InvalidParam);
        }
        let flexible = allowed_0 ^ allowed_1;
        let unknown = flexible & !(set | clear);
        let defaults = unknown & old_msr as u32;
        Ok(allowed_0 | defaults | set)
    }

    #[test]
    fn required_bits_always_land() {
        // allowed-0 = 0b0011 (must be 1), allowed-1 = 0b1111.
        let true_msr = 0b1111u64 << 32 | 0b0011;
        let result = resolve(true_msr, 0, 0b0100, 0).unwrap();
        assert_eq!(result, 0b0111);
    }

    #[test]
    fn unavailable_set_bit_is_refused() {
        let true_msr = 0b0011u64 << 32 | 0b0011;
        assert_eq!(resolve(true_msr, 0, 0b0100, 0), Err(VmmError::NotSupported));
    }

    #[test]
    fn forced_bit_cannot_be_cleared() {
        let true_msr = 0b1111u64 << 32 | 0b0001;
        assert_eq!(resolve(true_msr, 0, 0, 0b0001), Err(VmmError::NotSupported));
    }

    #[test]
    fn flexible_bits_default_from_old_msr() {
        let true_msr = 0b1111u64 << 32; // everything flexible
        let old_msr = 0b1010u64 << 32 | 0b1010; // defaults in low half
        let result = resolve(true_msr, old_msr, 0b0001, 0b0100).unwrap();
        assert_eq!(result, 0b1011);
    }
}
