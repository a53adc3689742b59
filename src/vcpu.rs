//! The vendor-neutral virtual CPU and its run loop.
//!
//! A host thread owns a vCPU for the duration of [`Vcpu::run`]: the
//! backend enters the guest, the loop classifies the returned exit and
//! dispatches it to the emulator, the device bus, or the feature
//! policy, then re-enters. The loop returns `Ok` on a guest hypercall
//! or a host-requested stop and `Err` on a fatal fault.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::{self, msr as msr_index, CpuVendor, NestedPageTable, SimdContext};
use crate::device::{DeviceBus, MmioDevice, PortDevice};
use crate::emulate;
use crate::exit::{ExitReason, VmExit, MAX_INSTRUCTION_LEN};
use crate::ffi::phys_to_virt;
use crate::lapic::{IpiRequest, LocalApic, APIC_DEFAULT_BASE};
use crate::memory::{GuestPhysAddr, PAGE_SIZE};
use crate::mtrr::{MtrrState, MTRR_CAP_VALUE};
use crate::regs::RegisterState;
use crate::{VmmError, VmmResult};
use spin::Mutex;

/// Backend capability toggles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmCap {
    HltExit,
    DescriptorExit,
}

/// Event classes the backends can queue for the next entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectKind {
    Exception,
    ExtInt,
    Nmi,
    SwInt,
}

/// The capability surface of a vendor hardware context.
pub trait Backend: Send {
    fn get_regs(&self, regs: &mut RegisterState);
    fn set_regs(&mut self, regs: &RegisterState);
    /// Enter the guest and block until the next VM exit.
    fn run(&mut self) -> VmmResult<VmExit>;
    fn set(&mut self, cap: VmCap, value: bool) -> VmmResult;
    /// Queue an event for delivery on the next entry.
    fn inject_int(&mut self, kind: InjectKind, vector: u8, has_error: bool, error_code: u32);
    fn guest_simd(&mut self) -> &mut SimdContext;
}

/// Virtual-time step credited to the TSC shadow per exit, keeping the
/// LAPIC timer moving without tying the guest to host time.
const TSC_STEP: u64 = 50_000;

pub struct Vcpu {
    id: u8,
    backend: Box<dyn Backend>,
    lapic: Arc<LocalApic>,
    /// Sibling LAPICs, indexed by vCPU id, for IPI routing.
    peers: Arc<[Arc<LocalApic>]>,
    npt: Arc<Mutex<NestedPageTable>>,
    bus: Arc<DeviceBus>,
    mtrr: MtrrState,
    apicbase: u64,
    tsc: u64,
    stop: AtomicBool,
}

impl Vcpu {
    pub(crate) fn new(
        id: u8,
        vendor: CpuVendor,
        npt: Arc<Mutex<NestedPageTable>>,
        bus: Arc<DeviceBus>,
        lapic: Arc<LocalApic>,
        peers: Arc<[Arc<LocalApic>]>,
    ) -> VmmResult<Self> {
        let (backend, cr0_constraint, cr4_constraint, efer_constraint): (Box<dyn Backend>, _, _, _) =
            match vendor {
                CpuVendor::Intel => {
                    let table = npt.lock();
                    let backend = arch::vmx::VmxVcpu::new(table.root_phys(), table.levels())?;
                    (
                        backend,
                        arch::vmx::get_cr0_constraint(),
                        arch::vmx::get_cr4_constraint(),
                        0,
                    )
                }
                CpuVendor::Amd => {
                    let backend = arch::svm::SvmVcpu::new(npt.lock().root_phys())?;
                    (
                        backend,
                        arch::svm::get_cr0_constraint(),
                        0,
                        arch::svm::get_efer_constraint(),
                    )
                }
            };

        let mut vcpu = Self {
            id,
            backend,
            lapic,
            peers,
            npt,
            bus,
            mtrr: MtrrState::default(),
            apicbase: 0,
            tsc: 0,
            stop: AtomicBool::new(false),
        };

        let regs = RegisterState::at_reset(cr0_constraint, cr4_constraint, efer_constraint);
        vcpu.backend.set_regs(&regs);

        let simd = vcpu.backend.guest_simd();
        simd.set_fcw(0x40);
        simd.set_mxcsr(0x1F80);

        // xAPIC enabled at the power-on base; the BSP carries bit 8.
        vcpu.apicbase = APIC_DEFAULT_BASE | (1 << 11) | (((id == 0) as u64) << 8);
        vcpu.lapic.update_apicbase(vcpu.apicbase);

        Ok(vcpu)
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn get_regs(&self, regs: &mut RegisterState) {
        self.backend.get_regs(regs);
    }

    pub fn set_regs(&mut self, regs: &RegisterState) {
        self.backend.set_regs(regs);
    }

    pub fn set(&mut self, cap: VmCap, value: bool) -> VmmResult {
        self.backend.set(cap, value)
    }

    pub fn lapic(&self) -> &Arc<LocalApic> {
        &self.lapic
    }

    /// Ask the loop to return at the next exit boundary. Callable from
    /// any thread.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Drive the guest until it performs a hypercall, the host requests
    /// a stop, or a fatal fault occurs.
    pub fn run(&mut self) -> VmmResult {
        while !self.stop.load(Ordering::Relaxed) {
            self.tsc = self.tsc.wrapping_add(TSC_STEP);
            self.lapic.tick(self.tsc);
            self.route_ipis();
            self.try_inject_interrupt();

            let exit = self.backend.run()?;
            match exit.reason {
                ExitReason::Vmcall => {
                    let mut regs = RegisterState::default();
                    self.backend.get_regs(&mut regs);
                    regs.rip += exit.instruction_len as u64;
                    self.backend.set_regs(&regs);
                    return Ok(());
                }

                ExitReason::MmuViolation {
                    gpa,
                    access,
                    page,
                    reserved_bits_set,
                } => {
                    let mut regs = RegisterState::default();
                    self.backend.get_regs(&mut regs);

                    let device: Option<Arc<dyn MmioDevice>> =
                        if gpa & !(PAGE_SIZE - 1) == self.lapic.mmio_base() {
                            Some(self.lapic.clone())
                        } else {
                            self.bus.find_mmio(gpa)
                        };

                    match device {
                        Some(device) => {
                            let window = self.fetch_instruction(&regs, &exit)?;
                            emulate::emulate(&window, &mut regs, device.as_ref())?;
                            self.backend.set_regs(&regs);
                        }
                        None => {
                            let grip = regs.cs.base + regs.rip;
                            error!(
                                "[VMM] MMU violation: gRIP {:#x} GPA {:#x} \
                                 access {}{}{} {} page {} reserved bits {}",
                                grip,
                                gpa,
                                if access.read { "R" } else { "" },
                                if access.write { "W" } else { "" },
                                if access.execute { "X" } else { "" },
                                if access.user { "user" } else { "supervisor" },
                                if page.present {
                                    if page.write { "present RW" } else { "present RO" }
                                } else {
                                    "not present"
                                },
                                reserved_bits_set,
                            );
                            return Err(VmmError::BadState);
                        }
                    }
                }

                ExitReason::Pio {
                    port,
                    size,
                    write,
                    string,
                    rep,
                } => {
                    if string || rep {
                        error!(
                            "[VMM] string/REP port I/O at port {:#x} is not handled",
                            port
                        );
                        return Err(VmmError::NotSupported);
                    }
                    let mut regs = RegisterState::default();
                    self.backend.get_regs(&mut regs);
                    handle_pio(&mut regs, port, size, write, self.bus.find_pio(port).as_deref());
                    regs.rip += exit.instruction_len as u64;
                    self.backend.set_regs(&regs);
                }

                ExitReason::Cpuid => {
                    let mut regs = RegisterState::default();
                    self.backend.get_regs(&mut regs);
                    handle_cpuid(&mut regs);
                    regs.rip += exit.instruction_len as u64;
                    self.backend.set_regs(&regs);
                }

                ExitReason::Msr { write } => {
                    let mut regs = RegisterState::default();
                    self.backend.get_regs(&mut regs);
                    let outcome = handle_msr(
                        write,
                        &mut regs,
                        &mut self.tsc,
                        &mut self.apicbase,
                        &self.lapic,
                        &mut self.mtrr,
                    );
                    match outcome {
                        MsrOutcome::Advance => {
                            regs.rip += exit.instruction_len as u64;
                            self.backend.set_regs(&regs);
                        }
                        // The faulting instruction re-executes after the
                        // injected exception.
                        MsrOutcome::InjectGp => {
                            self.backend.set_regs(&regs);
                            self.backend
                                .inject_int(InjectKind::Exception, 13, true, 0);
                        }
                    }
                }

                ExitReason::ExternalInterrupt => {
                    // Serviced by the host IDT once interrupts reopen.
                }

                other => {
                    let mut regs = RegisterState::default();
                    self.backend.get_regs(&mut regs);
                    warn!(
                        "[VMM] vcpu {}: unhandled exit {:?} at RIP {:#x}",
                        self.id, other, regs.rip
                    );
                    if exit.opcode_len != 0 {
                        warn!(
                            "[VMM]   opcode: {:02x?}",
                            &exit.opcode[..exit.opcode_len as usize]
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Best-effort virtual interrupt delivery at the entry boundary.
    /// Without interrupt-window exiting the check simply repeats on the
    /// next exit when the guest has interrupts masked.
    fn try_inject_interrupt(&mut self) {
        if self.lapic.pending_vector().is_none() {
            return;
        }
        let mut regs = RegisterState::default();
        self.backend.get_regs(&mut regs);
        if regs.rflags & (1 << 9) == 0 {
            return;
        }
        if let Some(vector) = self.lapic.acknowledge() {
            self.backend.inject_int(InjectKind::ExtInt, vector, false, 0);
        }
    }

    /// Deliver IPIs this vCPU queued through its ICR to the sibling
    /// LAPICs. Receivers pick them up at their own entry boundary.
    fn route_ipis(&mut self) {
        while let Some(ipi) = self.lapic.take_ipi() {
            if ipi.delivery_mode != 0 {
                warn!("[VMM] vcpu {}: IPI delivery mode {} dropped", self.id, ipi.delivery_mode);
                continue;
            }
            for (peer_id, peer) in self.peers.iter().enumerate() {
                if self.ipi_targets(&ipi, peer_id as u8) {
                    peer.set_irq(ipi.vector);
                }
            }
        }
    }

    fn ipi_targets(&self, ipi: &IpiRequest, peer_id: u8) -> bool {
        match ipi.dest_shorthand {
            0 => ipi.dest == peer_id,
            1 => peer_id == self.id,
            2 => true,
            _ => peer_id != self.id,
        }
    }

    /// Fetch the opcode window at CS:RIP for the emulator. Prefers bytes
    /// the hardware already captured; otherwise walks the nested table.
    fn fetch_instruction(
        &self,
        regs: &RegisterState,
        exit: &VmExit,
    ) -> VmmResult<[u8; MAX_INSTRUCTION_LEN]> {
        let mut window = [0u8; MAX_INSTRUCTION_LEN];
        if exit.opcode_len != 0 {
            window[..exit.opcode_len as usize]
                .copy_from_slice(&exit.opcode[..exit.opcode_len as usize]);
            return Ok(window);
        }

        let grip = (regs.cs.base + regs.rip) as GuestPhysAddr;
        let offset = grip & (PAGE_SIZE - 1);
        if offset > PAGE_SIZE - MAX_INSTRUCTION_LEN {
            error!(
                "[VMM] instruction window at gRIP {:#x} crosses a page boundary",
                grip
            );
            return Err(VmmError::NotSupported);
        }
        let (hpa, _) = self.npt.lock().query(grip)?;
        let src = phys_to_virt(hpa + offset) as *const u8;
        unsafe {
            core::ptr::copy_nonoverlapping(src, window.as_mut_ptr(), MAX_INSTRUCTION_LEN);
        }
        Ok(window)
    }
}

fn write_low32(reg: &mut u64, value: u32) {
    *reg = (*reg & !0xFFFF_FFFF) | value as u64;
}

fn size_mask(size: u8) -> u64 {
    match size {
        1 => 0xFF,
        2 => 0xFFFF,
        _ => 0xFFFF_FFFF,
    }
}

/// Port I/O service: writes hand the low bytes of RAX to the device,
/// reads merge the returned value into RAX. A read from an unclaimed
/// port clears the accessed bytes.
fn handle_pio(
    regs: &mut RegisterState,
    port: u16,
    size: u8,
    write: bool,
    device: Option<&dyn PortDevice>,
) {
    let mask = size_mask(size);
    match device {
        Some(device) => {
            if write {
                device.pio_write(port, (regs.rax & mask) as u32, size);
            } else {
                let value = device.pio_read(port, size) as u64 & mask;
                regs.rax = (regs.rax & !mask) | value;
            }
        }
        None => {
            warn!("[VMM] unhandled port I/O at {:#x}", port);
            if !write {
                regs.rax &= !mask;
            }
        }
    }
}

/// CPUID virtualization policy. Most leaves pass through; leaf 1 gains
/// the hypervisor-present bit and OS-dependent feature gating, and the
/// hypervisor range returns the "Luna" signature.
fn handle_cpuid(regs: &mut RegisterState) {
    const HYPERVISOR_SIGNATURE: u32 = 0x616E_754C; // "Luna"

    let leaf = regs.rax as u32;
    let subleaf = regs.rcx as u32;

    let passthrough = |regs: &mut RegisterState| {
        let result = raw_cpuid::cpuid!(leaf, subleaf);
        write_low32(&mut regs.rax, result.eax);
        write_low32(&mut regs.rbx, result.ebx);
        write_low32(&mut regs.rcx, result.ecx);
        write_low32(&mut regs.rdx, result.edx);
    };

    // Report a feature only when the guest's CR4 shows its OS enabled
    // the matching state-management bit.
    let os_support_bit = |reg: &mut u64, cr4: u64, cr4_bit: u8, bit: u8| {
        let enabled = (cr4 >> cr4_bit) & 1;
        *reg = (*reg & !(1u64 << bit)) | (enabled << bit);
    };

    let cr4 = regs.cr4;
    match leaf {
        0 | 0x8000_0000 => passthrough(regs),
        1 => {
            passthrough(regs);
            regs.rcx |= 1 << 31; // hypervisor present
            os_support_bit(&mut regs.rdx, cr4, 9, 24); // FXSR needs OSFXSR
            os_support_bit(&mut regs.rcx, cr4, 18, 27); // OSXSAVE
        }
        0x4000_0000 => {
            write_low32(&mut regs.rax, 0);
            write_low32(&mut regs.rbx, HYPERVISOR_SIGNATURE);
            write_low32(&mut regs.rcx, HYPERVISOR_SIGNATURE);
            write_low32(&mut regs.rdx, HYPERVISOR_SIGNATURE);
        }
        0x8000_0001 => {
            passthrough(regs);
            os_support_bit(&mut regs.rdx, cr4, 9, 24);
        }
        0x8000_0008 => {
            passthrough(regs);
            write_low32(&mut regs.rcx, 0); // hide core topology
        }
        _ => {
            debug!("[VMM] unhandled CPUID {:#x}:{}", leaf, subleaf);
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum MsrOutcome {
    Advance,
    InjectGp,
}

/// MSR virtualization policy. Reads of unknown registers return zero;
/// writes to read-only virtual registers raise #GP(0) in the guest.
fn handle_msr(
    write: bool,
    regs: &mut RegisterState,
    tsc: &mut u64,
    apicbase: &mut u64,
    lapic: &LocalApic,
    mtrr: &mut MtrrState,
) -> MsrOutcome {
    let index = regs.rcx as u32;
    let mut value = (regs.rax & 0xFFFF_FFFF) | (regs.rdx << 32);

    match index {
        msr_index::IA32_TSC => {
            if write {
                *tsc = value;
            } else {
                value = *tsc;
            }
        }
        msr_index::IA32_APIC_BASE => {
            if write {
                *apicbase = value;
                lapic.update_apicbase(value);
            } else {
                value = *apicbase;
            }
        }
        msr_index::IA32_MTRR_CAP => {
            if write {
                return MsrOutcome::InjectGp;
            }
            value = MTRR_CAP_VALUE;
        }
        index if MtrrState::handles(index) => {
            if write {
                mtrr.write(index, value);
            } else {
                value = mtrr.read(index);
            }
        }
        _ => {
            if write {
                warn!("[VMM] unhandled wrmsr({:#x}, {:#x})", index, value);
            } else {
                warn!("[VMM] unhandled rdmsr({:#x})", index);
                value = 0;
            }
        }
    }

    if !write {
        write_low32(&mut regs.rax, value as u32);
        write_low32(&mut regs.rdx, (value >> 32) as u32);
    }
    MsrOutcome::Advance
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::PortDevice;
    use spin::Mutex as SpinMutex;

    #[test]
    fn cpuid_hypervisor_signature() {
        let mut regs = RegisterState {
            rax: 0x4000_0000,
            ..Default::default()
        };
        handle_cpuid(&mut regs);
        assert_eq!(regs.rax & 0xFFFF_FFFF, 0);
        assert_eq!(regs.rbx & 0xFFFF_FFFF, 0x616E_754C);
        assert_eq!(regs.rcx & 0xFFFF_FFFF, 0x616E_754C);
        assert_eq!(regs.rdx & 0xFFFF_FFFF, 0x616E_754C);
    }

    #[test]
    fn cpuid_leaf1_gates_on_cr4() {
        let mut regs = RegisterState {
            rax: 1,
            cr4: 0,
            ..Default::default()
        };
        handle_cpuid(&mut regs);
        assert_ne!(regs.rcx & (1 << 31), 0, "hypervisor bit must be set");
        assert_eq!(regs.rdx & (1 << 24), 0, "FXSR gated off without CR4.9");
        assert_eq!(regs.rcx & (1 << 27), 0, "OSXSAVE gated off without CR4.18");

        let mut regs = RegisterState {
            rax: 1,
            cr4: (1 << 9) | (1 << 18),
            ..Default::default()
        };
        handle_cpuid(&mut regs);
        assert_ne!(regs.rdx & (1 << 24), 0);
        assert_ne!(regs.rcx & (1 << 27), 0);
    }

    #[test]
    fn cpuid_hides_core_count() {
        let mut regs = RegisterState {
            rax: 0x8000_0008,
            ..Default::default()
        };
        handle_cpuid(&mut regs);
        assert_eq!(regs.rcx & 0xFFFF_FFFF, 0);
    }

    #[test]
    fn cpuid_unknown_leaf_is_untouched() {
        let mut regs = RegisterState {
            rax: 0x4000_1234,
            rbx: 0x1111,
            rcx: 0x2222,
            rdx: 0x3333,
            ..Default::default()
        };
        handle_cpuid(&mut regs);
        assert_eq!(regs.rbx, 0x1111);
        assert_eq!(regs.rcx, 0x2222);
        assert_eq!(regs.rdx, 0x3333);
    }

    #[test]
    fn msr_tsc_shadow_round_trips() {
        let lapic = LocalApic::new(0);
        let mut mtrr = MtrrState::default();
        let mut tsc = 0u64;
        let mut apicbase = 0u64;

        let mut regs = RegisterState {
            rcx: msr_index::IA32_TSC as u64,
            rax: 0x89AB_CDEF,
            rdx: 0x0123_4567,
            ..Default::default()
        };
        let outcome = handle_msr(true, &mut regs, &mut tsc, &mut apicbase, &lapic, &mut mtrr);
        assert_eq!(outcome, MsrOutcome::Advance);
        assert_eq!(tsc, 0x0123_4567_89AB_CDEF);

        let mut regs = RegisterState {
            rcx: msr_index::IA32_TSC as u64,
            ..Default::default()
        };
        handle_msr(false, &mut regs, &mut tsc, &mut apicbase, &lapic, &mut mtrr);
        assert_eq!(regs.rax, 0x89AB_CDEF);
        assert_eq!(regs.rdx, 0x0123_4567);
    }

    #[test]
    fn msr_mtrr_cap_write_faults() {
        let lapic = LocalApic::new(0);
        let mut mtrr = MtrrState::default();
        let (mut tsc, mut apicbase) = (0u64, 0u64);

        let mut regs = RegisterState {
            rcx: msr_index::IA32_MTRR_CAP as u64,
            ..Default::default()
        };
        let outcome = handle_msr(true, &mut regs, &mut tsc, &mut apicbase, &lapic, &mut mtrr);
        assert_eq!(outcome, MsrOutcome::InjectGp);

        let outcome = handle_msr(false, &mut regs, &mut tsc, &mut apicbase, &lapic, &mut mtrr);
        assert_eq!(outcome, MsrOutcome::Advance);
        assert_eq!(regs.rax, MTRR_CAP_VALUE & 0xFFFF_FFFF);
    }

    #[test]
    fn msr_apicbase_relocates_the_lapic() {
        let lapic = LocalApic::new(0);
        let mut mtrr = MtrrState::default();
        let (mut tsc, mut apicbase) = (0u64, 0u64);

        let mut regs = RegisterState {
            rcx: msr_index::IA32_APIC_BASE as u64,
            rax: 0xFEC8_0000 | (1 << 11),
            rdx: 0,
            ..Default::default()
        };
        handle_msr(true, &mut regs, &mut tsc, &mut apicbase, &lapic, &mut mtrr);
        assert_eq!(lapic.mmio_base(), 0xFEC8_0000);
        assert_eq!(apicbase, 0xFEC8_0000 | (1 << 11));
    }

    #[test]
    fn msr_mtrr_variable_pair_round_trips() {
        let lapic = LocalApic::new(0);
        let mut mtrr = MtrrState::default();
        let (mut tsc, mut apicbase) = (0u64, 0u64);

        for pair in 0..8u64 {
            let base = 0x200 + pair * 2;
            let mut regs = RegisterState {
                rcx: base,
                rax: 0x8000_0006,
                rdx: pair,
                ..Default::default()
            };
            handle_msr(true, &mut regs, &mut tsc, &mut apicbase, &lapic, &mut mtrr);

            let mut regs = RegisterState {
                rcx: base,
                ..Default::default()
            };
            handle_msr(false, &mut regs, &mut tsc, &mut apicbase, &lapic, &mut mtrr);
            assert_eq!(regs.rax, 0x8000_0006);
            assert_eq!(regs.rdx, pair);
        }
    }

    #[test]
    fn msr_unknown_reads_zero() {
        let lapic = LocalApic::new(0);
        let mut mtrr = MtrrState::default();
        let (mut tsc, mut apicbase) = (0u64, 0u64);

        let mut regs = RegisterState {
            rcx: 0xC001_0000,
            rax: 0xFFFF_FFFF,
            rdx: 0xFFFF_FFFF,
            ..Default::default()
        };
        handle_msr(false, &mut regs, &mut tsc, &mut apicbase, &lapic, &mut mtrr);
        assert_eq!(regs.rax, 0);
        assert_eq!(regs.rdx, 0);
    }

    struct KeyboardPort {
        writes: SpinMutex<Vec<(u16, u32, u8)>>,
    }

    impl PortDevice for KeyboardPort {
        fn pio_read(&self, _port: u16, _size: u8) -> u32 {
            0xA5
        }
        fn pio_write(&self, port: u16, value: u32, size: u8) {
            self.writes.lock().push((port, value, size));
        }
    }

    #[test]
    fn pio_write_hands_low_bytes_to_the_device() {
        let dev = KeyboardPort {
            writes: SpinMutex::new(Vec::new()),
        };
        let mut regs = RegisterState {
            rax: 0x1122_3344_5566_5A5A,
            ..Default::default()
        };
        handle_pio(&mut regs, 0x61, 1, true, Some(&dev));
        assert_eq!(*dev.writes.lock(), vec![(0x61, 0x5A, 1)]);
        // RAX itself is untouched by an OUT.
        assert_eq!(regs.rax, 0x1122_3344_5566_5A5A);
    }

    #[test]
    fn pio_read_merges_into_rax() {
        let dev = KeyboardPort {
            writes: SpinMutex::new(Vec::new()),
        };
        let mut regs = RegisterState {
            rax: 0xFFFF_FFFF_FFFF_FFFF,
            ..Default::default()
        };
        handle_pio(&mut regs, 0x60, 1, false, Some(&dev));
        assert_eq!(regs.rax, 0xFFFF_FFFF_FFFF_FFA5);
    }

    #[test]
    fn unclaimed_port_reads_clear_the_low_bytes() {
        for (size, expect) in [
            (1u8, 0xFFFF_FFFF_FFFF_FF00u64),
            (2, 0xFFFF_FFFF_FFFF_0000),
            (4, 0xFFFF_FFFF_0000_0000),
        ] {
            let mut regs = RegisterState {
                rax: 0xFFFF_FFFF_FFFF_FFFF,
                ..Default::default()
            };
            handle_pio(&mut regs, 0x99, size, false, None);
            assert_eq!(regs.rax, expect);
        }
    }
}
