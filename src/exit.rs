//! The normalized VM-exit record returned by the vendor backends.

use crate::memory::GuestPhysAddr;

pub const MAX_INSTRUCTION_LEN: usize = 15;

/// Attempted access that caused a nested-paging fault.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MmuAccess {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub user: bool,
}

/// Permissions observed on the faulting translation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MmuPage {
    pub present: bool,
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub user: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Voluntary guest hypercall (VMCALL/VMMCALL).
    Vmcall,
    /// Nested-paging fault (EPT violation / nested page fault).
    MmuViolation {
        gpa: GuestPhysAddr,
        access: MmuAccess,
        page: MmuPage,
        reserved_bits_set: bool,
    },
    /// Port I/O intercept.
    Pio {
        port: u16,
        size: u8,
        write: bool,
        string: bool,
        rep: bool,
    },
    Cpuid,
    Msr {
        write: bool,
    },
    Hlt,
    /// A host interrupt arrived while the guest was running; the host
    /// IDT services it once the backend returns with interrupts on.
    ExternalInterrupt,
    /// Exit the backend could not classify; carries the raw exit code.
    Unknown(u64),
}

/// One VM exit, normalized across vendors.
#[derive(Debug, Clone, Copy)]
pub struct VmExit {
    pub reason: ExitReason,
    /// Hardware-reported length of the exiting instruction, 0 if the
    /// hardware does not provide one for this exit class.
    pub instruction_len: u8,
    /// Guest opcode bytes when the hardware captured them (AMD decode
    /// assist); `opcode_len == 0` otherwise.
    pub opcode: [u8; MAX_INSTRUCTION_LEN],
    pub opcode_len: u8,
}

impl Default for VmExit {
    fn default() -> Self {
        Self {
            reason: ExitReason::Unknown(0),
            instruction_len: 0,
            opcode: [0; MAX_INSTRUCTION_LEN],
            opcode_len: 0,
        }
    }
}
