//! Intel VT-x backend.
//!
//! One `VmxVcpu` owns one VMCS region. Entry runs through a pair of
//! naked functions: `vmx_entry` saves the host's callee-saved state into
//! the `VmxState` block, loads the guest GPRs and executes
//! VMLAUNCH/VMRESUME; the hardware returns through `vmx_exit` (installed
//! as HOST_RIP) with RSP pointing back at the same block.

mod vmcs;

use alloc::boxed::Box;
use core::arch::{asm, naked_asm};
use core::mem::offset_of;
use numeric_enum_macro::numeric_enum;
use x86::bits64::vmx;
use x86_64::instructions::tables::{sgdt, sidt};
use x86_64::registers::control::{Cr0, Cr3, Cr4};
use x86_64::registers::segmentation::{Segment as SegmentReg, CS, DS, ES, FS, GS, SS};

use self::vmcs::{
    intr_info, AccessRights, CpuBasedControls, PinBasedControls, SecondaryControls, VmEntryControls,
    VmExitControls, VmInstructionError, Vmcs, VmcsField,
};
use super::msr::{self, Msr, VmxBasic};
use super::simd::SimdContext;
use crate::exit::{ExitReason, MmuAccess, MmuPage, VmExit};
use crate::memory::{Frame, HostPhysAddr};
use crate::regs::{apply_cr_constraints, RegisterState, Segment, SegmentAttributes};
use crate::vcpu::{Backend, InjectKind, VmCap};
use crate::{VmmError, VmmResult};

numeric_enum! {
    #[repr(u64)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[allow(non_camel_case_types)]
    enum VmxExitReason {
        EXCEPTION_OR_NMI = 0,
        EXTERNAL_INTERRUPT = 1,
        TRIPLE_FAULT = 2,
        INTERRUPT_WINDOW = 7,
        CPUID = 10,
        HLT = 12,
        VMCALL = 18,
        CONTROL_REGISTER_ACCESS = 28,
        IO_INSTRUCTION = 30,
        RDMSR = 31,
        WRMSR = 32,
        ACCESS_GDTR_OR_IDTR = 46,
        ACCESS_LDTR_OR_TR = 47,
        EPT_VIOLATION = 48,
        EPT_MISCONFIGURATION = 49,
    }
}

/// Host registers restored after a VM exit.
#[repr(C)]
#[derive(Debug, Default)]
struct HostState {
    rip: u64,
    rbx: u64,
    rsp: u64,
    rbp: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
    rflags: u64,
}

/// Guest registers the VMCS does not hold.
#[repr(C)]
#[derive(Debug, Default)]
struct GuestGprs {
    rax: u64,
    rcx: u64,
    rdx: u64,
    rbx: u64,
    rbp: u64,
    rsi: u64,
    rdi: u64,
    r8: u64,
    r9: u64,
    r10: u64,
    r11: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
    cr2: u64,
}

/// Register block shared with the entry/exit assembly.
#[repr(C)]
#[derive(Debug, Default)]
struct VmxState {
    launched: bool,
    host: HostState,
    guest: GuestGprs,
}

const LAUNCHED: usize = offset_of!(VmxState, launched);
const H: usize = offset_of!(VmxState, host);
const H_RIP: usize = H + offset_of!(HostState, rip);
const H_RBX: usize = H + offset_of!(HostState, rbx);
const H_RSP: usize = H + offset_of!(HostState, rsp);
const H_RBP: usize = H + offset_of!(HostState, rbp);
const H_R12: usize = H + offset_of!(HostState, r12);
const H_R13: usize = H + offset_of!(HostState, r13);
const H_R14: usize = H + offset_of!(HostState, r14);
const H_R15: usize = H + offset_of!(HostState, r15);
const H_RFLAGS: usize = H + offset_of!(HostState, rflags);
const G: usize = offset_of!(VmxState, guest);
const G_RAX: usize = G + offset_of!(GuestGprs, rax);
const G_RCX: usize = G + offset_of!(GuestGprs, rcx);
const G_RDX: usize = G + offset_of!(GuestGprs, rdx);
const G_RBX: usize = G + offset_of!(GuestGprs, rbx);
const G_RBP: usize = G + offset_of!(GuestGprs, rbp);
const G_RSI: usize = G + offset_of!(GuestGprs, rsi);
const G_RDI: usize = G + offset_of!(GuestGprs, rdi);
const G_R8: usize = G + offset_of!(GuestGprs, r8);
const G_R9: usize = G + offset_of!(GuestGprs, r9);
const G_R10: usize = G + offset_of!(GuestGprs, r10);
const G_R11: usize = G + offset_of!(GuestGprs, r11);
const G_R12: usize = G + offset_of!(GuestGprs, r12);
const G_R13: usize = G + offset_of!(GuestGprs, r13);
const G_R14: usize = G + offset_of!(GuestGprs, r14);
const G_R15: usize = G + offset_of!(GuestGprs, r15);
const G_CR2: usize = G + offset_of!(GuestGprs, cr2);

/// Enter the guest. Returns 0 after a VM exit came back through
/// `vmx_exit`, 1 if VMLAUNCH/VMRESUME itself failed.
#[unsafe(naked)]
unsafe extern "C" fn vmx_entry(_state: *mut VmxState) -> u8 {
    naked_asm!(
        // Save host return address, callee-saved registers and flags.
        "pop qword ptr [rdi + {h_rip}]",
        "mov [rdi + {h_rbx}], rbx",
        "mov [rdi + {h_rsp}], rsp",
        "mov [rdi + {h_rbp}], rbp",
        "mov [rdi + {h_r12}], r12",
        "mov [rdi + {h_r13}], r13",
        "mov [rdi + {h_r14}], r14",
        "mov [rdi + {h_r15}], r15",
        "pushfq",
        "pop qword ptr [rdi + {h_rflags}]",
        // RSP doubles as the state pointer from here to the entry; an
        // interrupt would be fatal, and HOST_RSP brings the same value
        // back on exit.
        "cli",
        "mov rsp, rdi",
        // Guest CR2 and GPRs.
        "mov rax, [rsp + {g_cr2}]",
        "mov cr2, rax",
        "mov rax, [rsp + {g_rax}]",
        "mov rcx, [rsp + {g_rcx}]",
        "mov rdx, [rsp + {g_rdx}]",
        "mov rbx, [rsp + {g_rbx}]",
        "mov rbp, [rsp + {g_rbp}]",
        "mov rsi, [rsp + {g_rsi}]",
        "mov rdi, [rsp + {g_rdi}]",
        "mov r8, [rsp + {g_r8}]",
        "mov r9, [rsp + {g_r9}]",
        "mov r10, [rsp + {g_r10}]",
        "mov r11, [rsp + {g_r11}]",
        "mov r12, [rsp + {g_r12}]",
        "mov r13, [rsp + {g_r13}]",
        "mov r14, [rsp + {g_r14}]",
        "mov r15, [rsp + {g_r15}]",
        "cmp byte ptr [rsp + {launched}], 0",
        "jne 2f",
        "vmlaunch",
        "jmp 3f",
        "2: vmresume",
        "3:",
        // Only reached when the entry itself failed.
        "mov rdi, rsp",
        "mov rbx, [rdi + {h_rbx}]",
        "mov rsp, [rdi + {h_rsp}]",
        "mov rbp, [rdi + {h_rbp}]",
        "mov r12, [rdi + {h_r12}]",
        "mov r13, [rdi + {h_r13}]",
        "mov r14, [rdi + {h_r14}]",
        "mov r15, [rdi + {h_r15}]",
        "push qword ptr [rdi + {h_rflags}]",
        "popfq",
        "mov al, 1",
        "push qword ptr [rdi + {h_rip}]",
        "ret",
        h_rip = const H_RIP,
        h_rbx = const H_RBX,
        h_rsp = const H_RSP,
        h_rbp = const H_RBP,
        h_r12 = const H_R12,
        h_r13 = const H_R13,
        h_r14 = const H_R14,
        h_r15 = const H_R15,
        h_rflags = const H_RFLAGS,
        g_cr2 = const G_CR2,
        g_rax = const G_RAX,
        g_rcx = const G_RCX,
        g_rdx = const G_RDX,
        g_rbx = const G_RBX,
        g_rbp = const G_RBP,
        g_rsi = const G_RSI,
        g_rdi = const G_RDI,
        g_r8 = const G_R8,
        g_r9 = const G_R9,
        g_r10 = const G_R10,
        g_r11 = const G_R11,
        g_r12 = const G_R12,
        g_r13 = const G_R13,
        g_r14 = const G_R14,
        g_r15 = const G_R15,
        launched = const LAUNCHED,
    )
}

/// VM-exit landing pad: HOST_RIP points here and HOST_RSP restores the
/// state pointer into RSP. Stores the guest registers and returns to
/// `vmx_entry`'s caller with AL = 0.
#[unsafe(naked)]
unsafe extern "C" fn vmx_exit() -> u8 {
    naked_asm!(
        "mov [rsp + {g_rax}], rax",
        "mov [rsp + {g_rcx}], rcx",
        "mov [rsp + {g_rdx}], rdx",
        "mov [rsp + {g_rbx}], rbx",
        "mov [rsp + {g_rbp}], rbp",
        "mov [rsp + {g_rsi}], rsi",
        "mov [rsp + {g_rdi}], rdi",
        "mov [rsp + {g_r8}], r8",
        "mov [rsp + {g_r9}], r9",
        "mov [rsp + {g_r10}], r10",
        "mov [rsp + {g_r11}], r11",
        "mov [rsp + {g_r12}], r12",
        "mov [rsp + {g_r13}], r13",
        "mov [rsp + {g_r14}], r14",
        "mov [rsp + {g_r15}], r15",
        "mov rax, cr2",
        "mov [rsp + {g_cr2}], rax",
        "mov rdi, rsp",
        "mov rbx, [rdi + {h_rbx}]",
        "mov rsp, [rdi + {h_rsp}]",
        "mov rbp, [rdi + {h_rbp}]",
        "mov r12, [rdi + {h_r12}]",
        "mov r13, [rdi + {h_r13}]",
        "mov r14, [rdi + {h_r14}]",
        "mov r15, [rdi + {h_r15}]",
        "push qword ptr [rdi + {h_rflags}]",
        "popfq",
        "xor eax, eax",
        "push qword ptr [rdi + {h_rip}]",
        "ret",
        h_rip = const H_RIP,
        h_rbx = const H_RBX,
        h_rsp = const H_RSP,
        h_rbp = const H_RBP,
        h_r12 = const H_R12,
        h_r13 = const H_R13,
        h_r14 = const H_R14,
        h_r15 = const H_R15,
        h_rflags = const H_RFLAGS,
        g_cr2 = const G_CR2,
        g_rax = const G_RAX,
        g_rcx = const G_RCX,
        g_rdx = const G_RDX,
        g_rbx = const G_RBX,
        g_rbp = const G_RBP,
        g_rsi = const G_RSI,
        g_rdi = const G_RDI,
        g_r8 = const G_R8,
        g_r9 = const G_R9,
        g_r10 = const G_R10,
        g_r11 = const G_R11,
        g_r12 = const G_R12,
        g_r13 = const G_R13,
        g_r14 = const G_R14,
        g_r15 = const G_R15,
    )
}

/// Guest CR0 bits that must be 1 under VT-x. Unrestricted Guest lifts
/// the PE and PG requirements.
pub fn get_cr0_constraint() -> u64 {
    let fixed0 = unsafe { Msr::new(msr::IA32_VMX_CR0_FIXED0).read() };
    fixed0 & !((1 << 0) | (1 << 31))
}

pub fn get_cr4_constraint() -> u64 {
    unsafe { Msr::new(msr::IA32_VMX_CR4_FIXED0).read() }
}

fn cr0_allowed1() -> u64 {
    unsafe { Msr::new(msr::IA32_VMX_CR0_FIXED1).read() }
}

fn cr4_allowed1() -> u64 {
    unsafe { Msr::new(msr::IA32_VMX_CR4_FIXED1).read() }
}

fn attrib_to_access_rights(attrib: &SegmentAttributes) -> u64 {
    if !attrib.present {
        return AccessRights::UNUSABLE.bits() as u64;
    }
    let packed = attrib.bits() as u32;
    // The VMCS layout is the 12-bit descriptor attribute form with the
    // AVL/L/DB/G nibble shifted from bits 11:8 up to 15:12.
    ((packed & 0xFF) | ((packed & 0xF00) << 4)) as u64
}

fn access_rights_to_attrib(ar: u64) -> SegmentAttributes {
    let ar = ar as u32;
    if ar & AccessRights::UNUSABLE.bits() != 0 {
        return SegmentAttributes::default();
    }
    SegmentAttributes::from_bits(((ar & 0xFF) | ((ar >> 4) & 0xF00)) as u16)
}

/// Base address of the TSS descriptor the host TR selects.
unsafe fn host_tss_base(tr: u16) -> u64 {
    let gdt = sgdt();
    let entry = *(gdt.base.as_ptr::<u64>().add((tr >> 3) as usize));
    let high = *(gdt.base.as_ptr::<u64>().add((tr >> 3) as usize + 1));
    let low = (entry >> 16) & 0xFF_FFFF | (entry >> 32) & 0xFF00_0000;
    low | (high & 0xFFFF_FFFF) << 32
}

/// Per-vCPU VT-x hardware context.
pub struct VmxVcpu {
    vmcs_frame: Frame,
    vmx_state: VmxState,
    host_simd: SimdContext,
    guest_simd: SimdContext,
    /// DR6 has no VMCS slot; shadowed for the register record.
    dr6: u64,
}

impl VmxVcpu {
    pub fn new(npt_root: HostPhysAddr, npt_levels: u8) -> VmmResult<Box<Self>> {
        let vmx_basic = VmxBasic::read();
        let vmcs_frame = Frame::alloc()?;
        unsafe {
            *vmcs_frame.as_mut_ptr::<u32>() = vmx_basic.revision_id & 0x7FFF_FFFF;
            vmx::vmclear(vmcs_frame.phys_addr() as u64).map_err(|_| VmmError::DeviceError)?;
        }

        let vcpu = Box::new(Self {
            vmcs_frame,
            vmx_state: VmxState::default(),
            host_simd: SimdContext::new()?,
            guest_simd: SimdContext::new()?,
            dr6: 0,
        });

        let mut vmcs = Vmcs::load(vcpu.vmcs_frame.phys_addr() as u64)?;
        vcpu.init_controls(&mut vmcs, npt_root, npt_levels)?;
        vcpu.init_host_state(&mut vmcs);
        Ok(vcpu)
    }

    fn init_controls(
        &self,
        vmcs: &mut Vmcs,
        npt_root: HostPhysAddr,
        npt_levels: u8,
    ) -> VmmResult {
        let read = |index: u32| unsafe { Msr::new(index).read() };

        vmcs.set_control(
            VmcsField::PIN_BASED_VM_EXEC_CONTROL,
            read(msr::IA32_VMX_TRUE_PINBASED_CTLS),
            read(msr::IA32_VMX_PINBASED_CTLS),
            (PinBasedControls::INTR_EXITING | PinBasedControls::NMI_EXITING).bits(),
            0,
        )?;

        vmcs.set_control(
            VmcsField::CPU_BASED_VM_EXEC_CONTROL,
            read(msr::IA32_VMX_TRUE_PROCBASED_CTLS),
            read(msr::IA32_VMX_PROCBASED_CTLS),
            (CpuBasedControls::HLT_EXITING
                | CpuBasedControls::UNCOND_IO_EXITING
                | CpuBasedControls::SEC_CONTROLS)
                .bits(),
            // CR3 accesses stay in the guest; every MSR access exits.
            (CpuBasedControls::CR3_LOAD_EXITING
                | CpuBasedControls::CR3_STORE_EXITING
                | CpuBasedControls::USE_MSR_BITMAPS)
                .bits(),
        )?;

        // EPT, Unrestricted Guest and descriptor exiting are not
        // optional for this design; construction fails without them.
        vmcs.set_control(
            VmcsField::SECONDARY_VM_EXEC_CONTROL,
            read(msr::IA32_VMX_PROCBASED_CTLS2),
            0,
            (SecondaryControls::EPT
                | SecondaryControls::UNRESTRICTED_GUEST
                | SecondaryControls::DESC_EXITING)
                .bits(),
            0,
        )?;

        vmcs.set_control(
            VmcsField::VM_EXIT_CONTROLS,
            read(msr::IA32_VMX_TRUE_EXIT_CTLS),
            read(msr::IA32_VMX_EXIT_CTLS),
            (VmExitControls::HOST_ADDR_SPACE_SIZE
                | VmExitControls::SAVE_IA32_PAT
                | VmExitControls::LOAD_IA32_PAT
                | VmExitControls::SAVE_IA32_EFER
                | VmExitControls::LOAD_IA32_EFER)
                .bits(),
            0,
        )?;

        vmcs.set_control(
            VmcsField::VM_ENTRY_CONTROLS,
            read(msr::IA32_VMX_TRUE_ENTRY_CTLS),
            read(msr::IA32_VMX_ENTRY_CTLS),
            (VmEntryControls::LOAD_IA32_PAT | VmEntryControls::LOAD_IA32_EFER).bits(),
            0,
        )?;

        vmcs.write(VmcsField::EXCEPTION_BITMAP, 0);
        vmcs.write(VmcsField::PAGE_FAULT_ERROR_CODE_MASK, 0);
        vmcs.write(VmcsField::PAGE_FAULT_ERROR_CODE_MATCH, 0);

        // Keep NE observable-set and VMXE hidden; everything else is
        // guest-owned.
        let cr0_ne = 1 << 5;
        vmcs.write(VmcsField::CR0_GUEST_HOST_MASK, cr0_ne);
        vmcs.write(VmcsField::CR0_READ_SHADOW, cr0_ne);
        let cr4_vmxe = 1 << 13;
        vmcs.write(VmcsField::CR4_GUEST_HOST_MASK, cr4_vmxe);
        vmcs.write(VmcsField::CR4_READ_SHADOW, 0);

        // Write-back paging structures, walk length per the table depth.
        let eptp = npt_root as u64 | ((npt_levels as u64 - 1) << 3) | 6;
        vmcs.write(VmcsField::EPT_POINTER, eptp);
        unsafe { invept_single_context(eptp) };

        vmcs.write(VmcsField::VMCS_LINK_POINTER, u64::MAX);
        vmcs.write(VmcsField::GUEST_INTERRUPTIBILITY_STATE, 0);
        vmcs.write(VmcsField::GUEST_ACTIVITY_STATE, 0);
        vmcs.write(VmcsField::GUEST_PENDING_DBG_EXCEPTIONS, 0);
        vmcs.write(VmcsField::GUEST_IA32_SYSENTER_CS, 0);
        vmcs.write(VmcsField::GUEST_IA32_SYSENTER_ESP, 0);
        vmcs.write(VmcsField::GUEST_IA32_SYSENTER_EIP, 0);
        vmcs.write(VmcsField::GUEST_IA32_PAT, read(msr::IA32_PAT));

        Ok(())
    }

    /// Snapshot the running host context into the host-state area. These
    /// fields are loaded by hardware on every VM exit.
    fn init_host_state(&self, vmcs: &mut Vmcs) {
        let read = |index: u32| unsafe { Msr::new(index).read() };

        vmcs.write(VmcsField::HOST_IA32_PAT, read(msr::IA32_PAT));
        vmcs.write(VmcsField::HOST_IA32_EFER, read(msr::IA32_EFER));

        vmcs.write(VmcsField::HOST_CR0, Cr0::read_raw());
        let (frame, flags) = Cr3::read_raw();
        vmcs.write(
            VmcsField::HOST_CR3,
            frame.start_address().as_u64() | flags as u64,
        );
        vmcs.write(VmcsField::HOST_CR4, Cr4::read_raw());

        let tr = unsafe { x86::task::tr() };
        vmcs.write(VmcsField::HOST_ES_SELECTOR, ES::get_reg().0 as u64);
        vmcs.write(VmcsField::HOST_CS_SELECTOR, CS::get_reg().0 as u64);
        vmcs.write(VmcsField::HOST_SS_SELECTOR, SS::get_reg().0 as u64);
        vmcs.write(VmcsField::HOST_DS_SELECTOR, DS::get_reg().0 as u64);
        vmcs.write(VmcsField::HOST_FS_SELECTOR, FS::get_reg().0 as u64);
        vmcs.write(VmcsField::HOST_GS_SELECTOR, GS::get_reg().0 as u64);
        vmcs.write(VmcsField::HOST_TR_SELECTOR, tr.bits() as u64);

        vmcs.write(VmcsField::HOST_FS_BASE, read(msr::IA32_FS_BASE));
        vmcs.write(VmcsField::HOST_GS_BASE, read(msr::IA32_GS_BASE));
        vmcs.write(VmcsField::HOST_TR_BASE, unsafe { host_tss_base(tr.bits()) });
        vmcs.write(VmcsField::HOST_GDTR_BASE, sgdt().base.as_u64());
        vmcs.write(VmcsField::HOST_IDTR_BASE, sidt().base.as_u64());

        vmcs.write(VmcsField::HOST_IA32_SYSENTER_CS, 0);
        vmcs.write(VmcsField::HOST_IA32_SYSENTER_ESP, 0);
        vmcs.write(VmcsField::HOST_IA32_SYSENTER_EIP, 0);

        vmcs.write(VmcsField::HOST_RIP, vmx_exit as usize as u64);
    }

    fn write_segment(
        vmcs: &mut Vmcs,
        seg: &Segment,
        sel: VmcsField,
        base: VmcsField,
        limit: VmcsField,
        ar: VmcsField,
    ) {
        vmcs.write(sel, seg.selector as u64);
        vmcs.write(base, seg.base);
        vmcs.write(limit, seg.limit as u64);
        vmcs.write(ar, attrib_to_access_rights(&seg.attrib));
    }

    fn read_segment(
        vmcs: &Vmcs,
        sel: VmcsField,
        base: VmcsField,
        limit: VmcsField,
        ar: VmcsField,
    ) -> Segment {
        Segment {
            selector: vmcs.read(sel) as u16,
            base: vmcs.read(base),
            limit: vmcs.read(limit) as u32,
            attrib: access_rights_to_attrib(vmcs.read(ar)),
        }
    }

    fn decode_exit(&self, vmcs: &Vmcs) -> VmExit {
        use VmcsField::*;

        let full_reason = vmcs.read(VM_EXIT_REASON);
        let mut exit = VmExit {
            instruction_len: vmcs.read(VM_EXIT_INSTRUCTION_LEN) as u8,
            ..VmExit::default()
        };
        if full_reason & (1 << 31) != 0 {
            warn!("[VMM] vmx: VM-entry failure, reason {:#x}", full_reason);
            exit.reason = ExitReason::Unknown(full_reason);
            return exit;
        }

        let qualification = vmcs.read(EXIT_QUALIFICATION);
        exit.reason = match VmxExitReason::try_from(full_reason & 0xFFFF) {
            Ok(VmxExitReason::VMCALL) => ExitReason::Vmcall,
            Ok(VmxExitReason::CPUID) => ExitReason::Cpuid,
            Ok(VmxExitReason::HLT) => ExitReason::Hlt,
            Ok(VmxExitReason::RDMSR) => ExitReason::Msr { write: false },
            Ok(VmxExitReason::WRMSR) => ExitReason::Msr { write: true },
            Ok(VmxExitReason::EXTERNAL_INTERRUPT) => ExitReason::ExternalInterrupt,
            Ok(VmxExitReason::IO_INSTRUCTION) => ExitReason::Pio {
                // Volume 3, Section 27.2.1, Table 27-5.
                port: (qualification >> 16) as u16,
                size: (qualification & 0x7) as u8 + 1,
                write: qualification & (1 << 3) == 0,
                string: qualification & (1 << 4) != 0,
                rep: qualification & (1 << 5) != 0,
            },
            Ok(VmxExitReason::EPT_VIOLATION) => ExitReason::MmuViolation {
                gpa: vmcs.read(GUEST_PHYSICAL_ADDRESS) as usize,
                access: MmuAccess {
                    read: qualification & (1 << 0) != 0,
                    write: qualification & (1 << 1) != 0,
                    execute: qualification & (1 << 2) != 0,
                    user: false,
                },
                page: MmuPage {
                    present: qualification & (0b111 << 3) != 0,
                    read: qualification & (1 << 3) != 0,
                    write: qualification & (1 << 4) != 0,
                    execute: qualification & (1 << 5) != 0,
                    user: false,
                },
                reserved_bits_set: false,
            },
            Ok(VmxExitReason::EPT_MISCONFIGURATION) => ExitReason::MmuViolation {
                gpa: vmcs.read(GUEST_PHYSICAL_ADDRESS) as usize,
                access: MmuAccess::default(),
                page: MmuPage::default(),
                reserved_bits_set: true,
            },
            _ => ExitReason::Unknown(full_reason),
        };
        exit
    }

    fn vmcs(&self) -> VmmResult<Vmcs> {
        Vmcs::load(self.vmcs_frame.phys_addr() as u64)
    }
}

impl Backend for VmxVcpu {
    fn get_regs(&self, regs: &mut RegisterState) {
        use VmcsField::*;

        let vmcs = match self.vmcs() {
            Ok(vmcs) => vmcs,
            Err(_) => return,
        };
        let gprs = &self.vmx_state.guest;
        regs.rax = gprs.rax;
        regs.rcx = gprs.rcx;
        regs.rdx = gprs.rdx;
        regs.rbx = gprs.rbx;
        regs.rbp = gprs.rbp;
        regs.rsi = gprs.rsi;
        regs.rdi = gprs.rdi;
        regs.r8 = gprs.r8;
        regs.r9 = gprs.r9;
        regs.r10 = gprs.r10;
        regs.r11 = gprs.r11;
        regs.r12 = gprs.r12;
        regs.r13 = gprs.r13;
        regs.r14 = gprs.r14;
        regs.r15 = gprs.r15;
        regs.cr2 = gprs.cr2;

        regs.rsp = vmcs.read(GUEST_RSP);
        regs.rip = vmcs.read(GUEST_RIP);
        regs.rflags = vmcs.read(GUEST_RFLAGS);

        regs.cs = Self::read_segment(
            &vmcs,
            GUEST_CS_SELECTOR,
            GUEST_CS_BASE,
            GUEST_CS_LIMIT,
            GUEST_CS_AR_BYTES,
        );
        regs.ds = Self::read_segment(
            &vmcs,
            GUEST_DS_SELECTOR,
            GUEST_DS_BASE,
            GUEST_DS_LIMIT,
            GUEST_DS_AR_BYTES,
        );
        regs.es = Self::read_segment(
            &vmcs,
            GUEST_ES_SELECTOR,
            GUEST_ES_BASE,
            GUEST_ES_LIMIT,
            GUEST_ES_AR_BYTES,
        );
        regs.ss = Self::read_segment(
            &vmcs,
            GUEST_SS_SELECTOR,
            GUEST_SS_BASE,
            GUEST_SS_LIMIT,
            GUEST_SS_AR_BYTES,
        );
        regs.fs = Self::read_segment(
            &vmcs,
            GUEST_FS_SELECTOR,
            GUEST_FS_BASE,
            GUEST_FS_LIMIT,
            GUEST_FS_AR_BYTES,
        );
        regs.gs = Self::read_segment(
            &vmcs,
            GUEST_GS_SELECTOR,
            GUEST_GS_BASE,
            GUEST_GS_LIMIT,
            GUEST_GS_AR_BYTES,
        );
        regs.ldtr = Self::read_segment(
            &vmcs,
            GUEST_LDTR_SELECTOR,
            GUEST_LDTR_BASE,
            GUEST_LDTR_LIMIT,
            GUEST_LDTR_AR_BYTES,
        );
        regs.tr = Self::read_segment(
            &vmcs,
            GUEST_TR_SELECTOR,
            GUEST_TR_BASE,
            GUEST_TR_LIMIT,
            GUEST_TR_AR_BYTES,
        );

        regs.gdtr.base = vmcs.read(GUEST_GDTR_BASE);
        regs.gdtr.limit = vmcs.read(GUEST_GDTR_LIMIT) as u16;
        regs.idtr.base = vmcs.read(GUEST_IDTR_BASE);
        regs.idtr.limit = vmcs.read(GUEST_IDTR_LIMIT) as u16;

        regs.cr0 = vmcs.read(GUEST_CR0);
        regs.cr3 = vmcs.read(GUEST_CR3);
        regs.cr4 = vmcs.read(GUEST_CR4);
        regs.dr6 = self.dr6;
        regs.dr7 = vmcs.read(GUEST_DR7);
        regs.efer = vmcs.read(GUEST_IA32_EFER);
    }

    fn set_regs(&mut self, regs: &RegisterState) {
        use VmcsField::*;

        let mut vmcs = match self.vmcs() {
            Ok(vmcs) => vmcs,
            Err(_) => return,
        };
        let gprs = &mut self.vmx_state.guest;
        gprs.rax = regs.rax;
        gprs.rcx = regs.rcx;
        gprs.rdx = regs.rdx;
        gprs.rbx = regs.rbx;
        gprs.rbp = regs.rbp;
        gprs.rsi = regs.rsi;
        gprs.rdi = regs.rdi;
        gprs.r8 = regs.r8;
        gprs.r9 = regs.r9;
        gprs.r10 = regs.r10;
        gprs.r11 = regs.r11;
        gprs.r12 = regs.r12;
        gprs.r13 = regs.r13;
        gprs.r14 = regs.r14;
        gprs.r15 = regs.r15;
        gprs.cr2 = regs.cr2;

        vmcs.write(GUEST_RSP, regs.rsp);
        vmcs.write(GUEST_RIP, regs.rip);
        vmcs.write(GUEST_RFLAGS, regs.rflags);

        Self::write_segment(
            &mut vmcs,
            &regs.cs,
            GUEST_CS_SELECTOR,
            GUEST_CS_BASE,
            GUEST_CS_LIMIT,
            GUEST_CS_AR_BYTES,
        );
        Self::write_segment(
            &mut vmcs,
            &regs.ds,
            GUEST_DS_SELECTOR,
            GUEST_DS_BASE,
            GUEST_DS_LIMIT,
            GUEST_DS_AR_BYTES,
        );
        Self::write_segment(
            &mut vmcs,
            &regs.es,
            GUEST_ES_SELECTOR,
            GUEST_ES_BASE,
            GUEST_ES_LIMIT,
            GUEST_ES_AR_BYTES,
        );
        Self::write_segment(
            &mut vmcs,
            &regs.ss,
            GUEST_SS_SELECTOR,
            GUEST_SS_BASE,
            GUEST_SS_LIMIT,
            GUEST_SS_AR_BYTES,
        );
        Self::write_segment(
            &mut vmcs,
            &regs.fs,
            GUEST_FS_SELECTOR,
            GUEST_FS_BASE,
            GUEST_FS_LIMIT,
            GUEST_FS_AR_BYTES,
        );
        Self::write_segment(
            &mut vmcs,
            &regs.gs,
            GUEST_GS_SELECTOR,
            GUEST_GS_BASE,
            GUEST_GS_LIMIT,
            GUEST_GS_AR_BYTES,
        );
        Self::write_segment(
            &mut vmcs,
            &regs.ldtr,
            GUEST_LDTR_SELECTOR,
            GUEST_LDTR_BASE,
            GUEST_LDTR_LIMIT,
            GUEST_LDTR_AR_BYTES,
        );
        Self::write_segment(
            &mut vmcs,
            &regs.tr,
            GUEST_TR_SELECTOR,
            GUEST_TR_BASE,
            GUEST_TR_LIMIT,
            GUEST_TR_AR_BYTES,
        );

        vmcs.write(GUEST_GDTR_BASE, regs.gdtr.base);
        vmcs.write(GUEST_GDTR_LIMIT, regs.gdtr.limit as u64);
        vmcs.write(GUEST_IDTR_BASE, regs.idtr.base);
        vmcs.write(GUEST_IDTR_LIMIT, regs.idtr.limit as u64);

        // Hardware sees the constrained values; the guest reads its own
        // through the CR shadows.
        let cr0 = apply_cr_constraints(regs.cr0, get_cr0_constraint(), cr0_allowed1());
        vmcs.write(GUEST_CR0, cr0);
        vmcs.write(GUEST_CR3, regs.cr3);
        let cr4 = apply_cr_constraints(regs.cr4, get_cr4_constraint(), cr4_allowed1());
        vmcs.write(GUEST_CR4, cr4);

        vmcs.write(GUEST_IA32_EFER, regs.efer);
        let mut entry_controls = vmcs.read(VM_ENTRY_CONTROLS) as u32;
        if regs.efer & (1 << 10) != 0 {
            entry_controls |= VmEntryControls::IA32E_MODE.bits();
        } else {
            entry_controls &= !VmEntryControls::IA32E_MODE.bits();
        }
        vmcs.write(VM_ENTRY_CONTROLS, entry_controls as u64);

        vmcs.write(GUEST_DR7, regs.dr7);
        self.dr6 = regs.dr6;
    }

    fn run(&mut self) -> VmmResult<VmExit> {
        let mut vmcs = self.vmcs()?;
        vmcs.write(
            VmcsField::HOST_RSP,
            &mut self.vmx_state as *mut VmxState as u64,
        );

        self.host_simd.store();
        self.guest_simd.load();
        let entry_failed = unsafe { vmx_entry(&mut self.vmx_state) };
        self.guest_simd.store();
        self.host_simd.load();

        if entry_failed != 0 {
            let error = VmInstructionError(vmcs.read(VmcsField::VM_INSTRUCTION_ERROR));
            warn!("[VMM] vmx: entry failed: {:?}", error);
            return Err(VmmError::DeviceError);
        }
        self.vmx_state.launched = true;
        Ok(self.decode_exit(&vmcs))
    }

    fn set(&mut self, cap: VmCap, value: bool) -> VmmResult {
        let mut vmcs = self.vmcs()?;
        match cap {
            VmCap::HltExit => {
                let mut ctrl = vmcs.read(VmcsField::CPU_BASED_VM_EXEC_CONTROL) as u32;
                if value {
                    ctrl |= CpuBasedControls::HLT_EXITING.bits();
                } else {
                    ctrl &= !CpuBasedControls::HLT_EXITING.bits();
                }
                vmcs.write(VmcsField::CPU_BASED_VM_EXEC_CONTROL, ctrl as u64);
            }
            VmCap::DescriptorExit => {
                let mut ctrl = vmcs.read(VmcsField::SECONDARY_VM_EXEC_CONTROL) as u32;
                if value {
                    ctrl |= SecondaryControls::DESC_EXITING.bits();
                } else {
                    ctrl &= !SecondaryControls::DESC_EXITING.bits();
                }
                vmcs.write(VmcsField::SECONDARY_VM_EXEC_CONTROL, ctrl as u64);
            }
        }
        Ok(())
    }

    fn inject_int(&mut self, kind: InjectKind, vector: u8, has_error: bool, error_code: u32) {
        let mut vmcs = match self.vmcs() {
            Ok(vmcs) => vmcs,
            Err(_) => return,
        };
        let type_bits = match kind {
            InjectKind::Exception => intr_info::TYPE_HARD_EXCEPTION,
            InjectKind::ExtInt => intr_info::TYPE_EXTERNAL,
            InjectKind::Nmi => intr_info::TYPE_NMI,
            InjectKind::SwInt => intr_info::TYPE_SOFT_INTR,
        };
        let mut info = intr_info::VALID | type_bits | vector as u32;
        if has_error {
            info |= intr_info::DELIVER_ERROR_CODE;
            vmcs.write(VmcsField::VM_ENTRY_EXCEPTION_ERROR_CODE, error_code as u64);
        }
        vmcs.write(VmcsField::VM_ENTRY_INTR_INFO, info as u64);
    }

    fn guest_simd(&mut self) -> &mut SimdContext {
        &mut self.guest_simd
    }
}

impl Drop for VmxVcpu {
    fn drop(&mut self) {
        unsafe {
            let _ = vmx::vmclear(self.vmcs_frame.phys_addr() as u64);
        }
    }
}

#[repr(C, packed)]
#[allow(dead_code)]
struct InvEptDescriptor {
    eptp: u64,
    reserved: u64,
}

/// Invalidate cached translations for one EPT root.
unsafe fn invept_single_context(eptp: u64) {
    const SINGLE_CONTEXT: u64 = 1;
    let descriptor = InvEptDescriptor { eptp, reserved: 0 };
    asm!(
        "invept {0}, [{1}]",
        in(reg) SINGLE_CONTEXT,
        in(reg) &descriptor,
        options(nostack),
    );
}
