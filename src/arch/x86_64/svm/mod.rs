//! AMD-V (SVM) backend.
//!
//! One `SvmVcpu` owns one VMCB plus the I/O and MSR permission maps
//! (both all-ones, so every port and MSR access exits). Entry is the
//! CLGI / VMLOAD / VMRUN / VMSAVE / STGI sequence; unlike VT-x the
//! hardware returns straight-line to the instruction after VMRUN, so no
//! landing trampoline is needed.

mod vmcb;

use alloc::boxed::Box;
use core::arch::asm;
use core::mem::offset_of;

use self::vmcb::{
    event_inj, exit_code, InterceptMisc1, InterceptMisc2, Vmcb, VmcbSegment,
    INTERCEPT_DESCRIPTOR_ALL,
};
use super::msr::{self, Msr};
use super::simd::SimdContext;
use crate::exit::{ExitReason, MmuAccess, MmuPage, VmExit, MAX_INSTRUCTION_LEN};
use crate::memory::{Frame, FrameRange, HostPhysAddr};
use crate::regs::{RegisterState, Segment, SegmentAttributes};
use crate::vcpu::{Backend, InjectKind, VmCap};
use crate::{VmmError, VmmResult};

/// I/O permission map: 64K ports, one bit each, rounded to 3 pages.
const IOPM_PAGES: usize = 3;
/// MSR permission map: 2 pages.
const MSRPM_PAGES: usize = 2;

/// Guest registers the VMCB does not hold (RAX and RSP live in the
/// state save area).
#[repr(C)]
#[derive(Debug, Default)]
struct SvmGprs {
    rbx: u64,
    rcx: u64,
    rdx: u64,
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
}

const S_RBX: usize = offset_of!(SvmGprs, rbx);
const S_RCX: usize = offset_of!(SvmGprs, rcx);
const S_RDX: usize = offset_of!(SvmGprs, rdx);
const S_RBP: usize = offset_of!(SvmGprs, rbp);
const S_RSI: usize = offset_of!(SvmGprs, rsi);
const S_RDI: usize = offset_of!(SvmGprs, rdi);
const S_R8: usize = offset_of!(SvmGprs, r8);
const S_R9: usize = offset_of!(SvmGprs, r9);
const S_R10: usize = offset_of!(SvmGprs, r10);
const S_R11: usize = offset_of!(SvmGprs, r11);
const S_R12: usize = offset_of!(SvmGprs, r12);
const S_R13: usize = offset_of!(SvmGprs, r13);
const S_R14: usize = offset_of!(SvmGprs, r14);
const S_R15: usize = offset_of!(SvmGprs, r15);

/// Run the guest once. Interrupts are gated by GIF across the swap so
/// the half-loaded register file is never observable.
unsafe fn svm_run(gprs: *mut SvmGprs, vmcb_pa: u64) {
    asm!(
        "push rbp",
        "push rbx",
        "push rdi",
        "mov rbx, [rdi + {rbx}]",
        "mov rcx, [rdi + {rcx}]",
        "mov rdx, [rdi + {rdx}]",
        "mov rbp, [rdi + {rbp}]",
        "mov rsi, [rdi + {rsi}]",
        "mov r8, [rdi + {r8}]",
        "mov r9, [rdi + {r9}]",
        "mov r10, [rdi + {r10}]",
        "mov r11, [rdi + {r11}]",
        "mov r12, [rdi + {r12}]",
        "mov r13, [rdi + {r13}]",
        "mov r14, [rdi + {r14}]",
        "mov r15, [rdi + {r15}]",
        "mov rdi, [rdi + {rdi_off}]",
        "clgi",
        "vmload rax",
        "vmrun rax",
        "vmsave rax",
        "stgi",
        "push rdi",
        "mov rdi, [rsp + 8]",
        "mov [rdi + {rbx}], rbx",
        "mov [rdi + {rcx}], rcx",
        "mov [rdi + {rdx}], rdx",
        "mov [rdi + {rbp}], rbp",
        "mov [rdi + {rsi}], rsi",
        "mov [rdi + {r8}], r8",
        "mov [rdi + {r9}], r9",
        "mov [rdi + {r10}], r10",
        "mov [rdi + {r11}], r11",
        "mov [rdi + {r12}], r12",
        "mov [rdi + {r13}], r13",
        "mov [rdi + {r14}], r14",
        "mov [rdi + {r15}], r15",
        "pop rcx",
        "mov [rdi + {rdi_off}], rcx",
        "add rsp, 8",
        "pop rbx",
        "pop rbp",
        rbx = const S_RBX,
        rcx = const S_RCX,
        rdx = const S_RDX,
        rbp = const S_RBP,
        rsi = const S_RSI,
        rdi_off = const S_RDI,
        r8 = const S_R8,
        r9 = const S_R9,
        r10 = const S_R10,
        r11 = const S_R11,
        r12 = const S_R12,
        r13 = const S_R13,
        r14 = const S_R14,
        r15 = const S_R15,
        inout("rax") vmcb_pa => _,
        inout("rdi") gprs => _,
        lateout("rcx") _,
        lateout("rdx") _,
        lateout("rsi") _,
        lateout("r8") _,
        lateout("r9") _,
        lateout("r10") _,
        lateout("r11") _,
        lateout("r12") _,
        lateout("r13") _,
        lateout("r14") _,
        lateout("r15") _,
        clobber_abi("C"),
    );
}

/// Guest EFER bits that must stay set while SVM runs the guest.
pub fn get_efer_constraint() -> u64 {
    msr::EFER_SVME
}

/// SVM places no fixed-1 constraints on guest CR0 beyond the
/// architectural reserved handling.
pub fn get_cr0_constraint() -> u64 {
    0
}

fn to_vmcb_segment(seg: &Segment) -> VmcbSegment {
    VmcbSegment {
        selector: seg.selector,
        attrib: seg.attrib.bits(),
        limit: seg.limit,
        base: seg.base,
    }
}

fn from_vmcb_segment(seg: &VmcbSegment) -> Segment {
    Segment {
        selector: seg.selector,
        base: seg.base,
        limit: seg.limit,
        attrib: SegmentAttributes::from_bits(seg.attrib),
    }
}

/// Per-vCPU SVM hardware context.
pub struct SvmVcpu {
    vmcb_frame: Frame,
    gprs: SvmGprs,
    iopm: FrameRange,
    msrpm: FrameRange,
    host_simd: SimdContext,
    guest_simd: SimdContext,
}

impl SvmVcpu {
    pub fn new(npt_root: HostPhysAddr) -> VmmResult<Box<Self>> {
        let vmcb_frame = Frame::alloc()?;
        // All-ones permission maps: every port and MSR access exits.
        let iopm = FrameRange::alloc_filled(IOPM_PAGES, 0xFF)?;
        let msrpm = FrameRange::alloc_filled(MSRPM_PAGES, 0xFF)?;

        let vcpu = Box::new(Self {
            vmcb_frame,
            gprs: SvmGprs::default(),
            iopm,
            msrpm,
            host_simd: SimdContext::new()?,
            guest_simd: SimdContext::new()?,
        });

        let vmcb = vcpu.vmcb_mut();
        vmcb.control.intercept_misc1 = (InterceptMisc1::INTR
            | InterceptMisc1::NMI
            | InterceptMisc1::CPUID
            | InterceptMisc1::HLT
            | InterceptMisc1::IOIO_PROT
            | InterceptMisc1::MSR_PROT
            | InterceptMisc1::SHUTDOWN)
            .bits()
            | INTERCEPT_DESCRIPTOR_ALL;
        vmcb.control.intercept_misc2 =
            (InterceptMisc2::VMRUN | InterceptMisc2::VMMCALL).bits();
        // CR3 reads and writes stay in the guest; nested paging covers
        // the translation.
        vmcb.control.intercept_cr = 0;
        vmcb.control.iopm_base_pa = vcpu.iopm.phys_addr() as u64;
        vmcb.control.msrpm_base_pa = vcpu.msrpm.phys_addr() as u64;
        vmcb.control.guest_asid = 1;
        // One ASID is shared by every guest, so flush on each entry.
        vmcb.control.tlb_control = 1;
        vmcb.control.np_enable = 1;
        vmcb.control.n_cr3 = npt_root as u64;
        vmcb.save.g_pat = unsafe { Msr::new(msr::IA32_PAT).read() };

        Ok(vcpu)
    }

    fn vmcb(&self) -> &Vmcb {
        unsafe { &*self.vmcb_frame.as_ptr::<Vmcb>() }
    }

    #[allow(clippy::mut_from_ref)]
    fn vmcb_mut(&self) -> &mut Vmcb {
        unsafe { &mut *self.vmcb_frame.as_mut_ptr::<Vmcb>() }
    }

    fn decode_exit(&self) -> VmmResult<VmExit> {
        let vmcb = self.vmcb();
        let control = &vmcb.control;
        let rip = vmcb.save.rip;

        let mut exit = VmExit::default();
        // Decode assist captures the faulting instruction bytes.
        let insn_len = (control.insn_len as usize).min(MAX_INSTRUCTION_LEN);
        exit.opcode[..insn_len].copy_from_slice(&control.insn_bytes[..insn_len]);
        exit.opcode_len = insn_len as u8;
        if control.next_rip != 0 {
            exit.instruction_len = control.next_rip.wrapping_sub(rip) as u8;
        }

        exit.reason = match control.exitcode {
            exit_code::INTR | exit_code::NMI => ExitReason::ExternalInterrupt,
            exit_code::CPUID => ExitReason::Cpuid,
            exit_code::HLT => ExitReason::Hlt,
            exit_code::VMMCALL => ExitReason::Vmcall,
            exit_code::MSR => ExitReason::Msr {
                write: control.exitinfo1 != 0,
            },
            exit_code::IOIO => {
                // APM Volume 2, Section 15.10.2: IN/OUT decode in
                // EXITINFO1, completing RIP in EXITINFO2.
                let info = control.exitinfo1;
                exit.instruction_len = control.exitinfo2.wrapping_sub(rip) as u8;
                ExitReason::Pio {
                    port: (info >> 16) as u16,
                    size: if info & (1 << 4) != 0 {
                        1
                    } else if info & (1 << 5) != 0 {
                        2
                    } else {
                        4
                    },
                    write: info & (1 << 0) == 0,
                    string: info & (1 << 2) != 0,
                    rep: info & (1 << 3) != 0,
                }
            }
            exit_code::NPF => {
                // EXITINFO1 carries a page-fault style error code.
                let error = control.exitinfo1;
                ExitReason::MmuViolation {
                    gpa: control.exitinfo2 as usize,
                    access: MmuAccess {
                        read: error & ((1 << 1) | (1 << 4)) == 0,
                        write: error & (1 << 1) != 0,
                        execute: error & (1 << 4) != 0,
                        user: error & (1 << 2) != 0,
                    },
                    page: MmuPage {
                        present: error & (1 << 0) != 0,
                        ..MmuPage::default()
                    },
                    reserved_bits_set: error & (1 << 3) != 0,
                }
            }
            exit_code::INVALID => {
                warn!("[VMM] svm: VMRUN failed, invalid guest state");
                return Err(VmmError::DeviceError);
            }
            other => ExitReason::Unknown(other),
        };
        Ok(exit)
    }
}

impl Backend for SvmVcpu {
    fn get_regs(&self, regs: &mut RegisterState) {
        let vmcb = self.vmcb();
        let save = &vmcb.save;

        regs.rax = save.rax;
        regs.rsp = save.rsp;
        regs.rbx = self.gprs.rbx;
        regs.rcx = self.gprs.rcx;
        regs.rdx = self.gprs.rdx;
        regs.rbp = self.gprs.rbp;
        regs.rsi = self.gprs.rsi;
        regs.rdi = self.gprs.rdi;
        regs.r8 = self.gprs.r8;
        regs.r9 = self.gprs.r9;
        regs.r10 = self.gprs.r10;
        regs.r11 = self.gprs.r11;
        regs.r12 = self.gprs.r12;
        regs.r13 = self.gprs.r13;
        regs.r14 = self.gprs.r14;
        regs.r15 = self.gprs.r15;

        regs.rip = save.rip;
        regs.rflags = save.rflags;

        regs.es = from_vmcb_segment(&save.es);
        regs.cs = from_vmcb_segment(&save.cs);
        regs.ss = from_vmcb_segment(&save.ss);
        regs.ds = from_vmcb_segment(&save.ds);
        regs.fs = from_vmcb_segment(&save.fs);
        regs.gs = from_vmcb_segment(&save.gs);
        regs.ldtr = from_vmcb_segment(&save.ldtr);
        regs.tr = from_vmcb_segment(&save.tr);
        regs.gdtr.base = save.gdtr.base;
        regs.gdtr.limit = save.gdtr.limit as u16;
        regs.idtr.base = save.idtr.base;
        regs.idtr.limit = save.idtr.limit as u16;

        regs.cr0 = save.cr0;
        regs.cr2 = save.cr2;
        regs.cr3 = save.cr3;
        regs.cr4 = save.cr4;
        regs.dr6 = save.dr6;
        regs.dr7 = save.dr7;
        regs.efer = save.efer;
    }

    fn set_regs(&mut self, regs: &RegisterState) {
        self.gprs.rbx = regs.rbx;
        self.gprs.rcx = regs.rcx;
        self.gprs.rdx = regs.rdx;
        self.gprs.rbp = regs.rbp;
        self.gprs.rsi = regs.rsi;
        self.gprs.rdi = regs.rdi;
        self.gprs.r8 = regs.r8;
        self.gprs.r9 = regs.r9;
        self.gprs.r10 = regs.r10;
        self.gprs.r11 = regs.r11;
        self.gprs.r12 = regs.r12;
        self.gprs.r13 = regs.r13;
        self.gprs.r14 = regs.r14;
        self.gprs.r15 = regs.r15;

        let save = &mut self.vmcb_mut().save;
        save.rax = regs.rax;
        save.rsp = regs.rsp;
        save.rip = regs.rip;
        save.rflags = regs.rflags;

        save.es = to_vmcb_segment(&regs.es);
        save.cs = to_vmcb_segment(&regs.cs);
        save.ss = to_vmcb_segment(&regs.ss);
        save.ds = to_vmcb_segment(&regs.ds);
        save.fs = to_vmcb_segment(&regs.fs);
        save.gs = to_vmcb_segment(&regs.gs);
        save.ldtr = to_vmcb_segment(&regs.ldtr);
        save.tr = to_vmcb_segment(&regs.tr);
        save.gdtr = VmcbSegment {
            base: regs.gdtr.base,
            limit: regs.gdtr.limit as u32,
            ..VmcbSegment::default()
        };
        save.idtr = VmcbSegment {
            base: regs.idtr.base,
            limit: regs.idtr.limit as u32,
            ..VmcbSegment::default()
        };
        save.cpl = regs.ss.attrib.dpl;

        save.cr0 = regs.cr0;
        save.cr2 = regs.cr2;
        save.cr3 = regs.cr3;
        save.cr4 = regs.cr4;
        save.dr6 = regs.dr6;
        save.dr7 = regs.dr7;
        // VMRUN refuses a guest without SVME.
        save.efer = regs.efer | msr::EFER_SVME;
    }

    fn run(&mut self) -> VmmResult<VmExit> {
        self.host_simd.store();
        self.guest_simd.load();
        unsafe {
            svm_run(&mut self.gprs, self.vmcb_frame.phys_addr() as u64);
        }
        self.guest_simd.store();
        self.host_simd.load();

        // Events are single-shot: hardware delivered or dropped it.
        self.vmcb_mut().control.eventinj = 0;
        self.decode_exit()
    }

    fn set(&mut self, cap: VmCap, value: bool) -> VmmResult {
        let vmcb = self.vmcb_mut();
        match cap {
            VmCap::HltExit => {
                if value {
                    vmcb.control.intercept_misc1 |= InterceptMisc1::HLT.bits();
                } else {
                    vmcb.control.intercept_misc1 &= !InterceptMisc1::HLT.bits();
                }
            }
            VmCap::DescriptorExit => {
                if value {
                    vmcb.control.intercept_misc1 |= INTERCEPT_DESCRIPTOR_ALL;
                } else {
                    vmcb.control.intercept_misc1 &= !INTERCEPT_DESCRIPTOR_ALL;
                }
            }
        }
        Ok(())
    }

    fn inject_int(&mut self, kind: InjectKind, vector: u8, has_error: bool, error_code: u32) {
        let type_bits = match kind {
            InjectKind::Exception => event_inj::TYPE_EXCEPTION,
            InjectKind::ExtInt => event_inj::TYPE_EXTERNAL,
            InjectKind::Nmi => event_inj::TYPE_NMI,
            InjectKind::SwInt => event_inj::TYPE_SOFT_INTR,
        };
        let mut event = event_inj::VALID | type_bits | vector as u64;
        if has_error {
            event |= event_inj::ERROR_CODE_VALID | (error_code as u64) << 32;
        }
        self.vmcb_mut().control.eventinj = event;
    }

    fn guest_simd(&mut self) -> &mut SimdContext {
        &mut self.guest_simd
    }
}
