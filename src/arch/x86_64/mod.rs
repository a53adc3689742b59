//! x86-64 vendor support: CPU probing, per-host virtualization enable
//! and the two hardware backends.

use lazy_static::lazy_static;
use raw_cpuid::CpuId;
use spin::Mutex;
use x86::bits64::vmx as vmx_insn;
use x86_64::registers::control::{Cr0, Cr4, Cr4Flags};
use x86_64::registers::model_specific::{Efer, EferFlags};

pub(crate) mod msr;
mod npt;
mod simd;
pub(crate) mod svm;
pub(crate) mod vmx;

pub use npt::{MapFlags, MemoryType, NestedPageTable};
pub use simd::SimdContext;

use self::msr::{FeatureControl, FeatureControlFlags, Msr, VmxBasic};
use crate::memory::{Frame, PAGE_SIZE};
use crate::{VmmError, VmmResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuVendor {
    Intel,
    Amd,
}

/// Pick the vendor backend from the CPU's feature bits.
pub fn probe() -> Option<CpuVendor> {
    let cpuid = CpuId::new();
    if cpuid
        .get_feature_info()
        .map_or(false, |features| features.has_vmx())
    {
        return Some(CpuVendor::Intel);
    }
    if cpuid
        .get_extended_processor_and_feature_identifiers()
        .map_or(false, |features| features.has_svm())
    {
        return Some(CpuVendor::Amd);
    }
    None
}

/// Per-host virtualization state shared by all VMs.
#[derive(Default)]
struct VmmState {
    active_vms: usize,
    vendor: Option<CpuVendor>,
    vmxon_page: Option<Frame>,
    host_save_page: Option<Frame>,
}

lazy_static! {
    static ref VMM_STATE: Mutex<VmmState> = Mutex::new(VmmState::default());
}

pub(crate) fn enable_virtualization() -> VmmResult<CpuVendor> {
    VMM_STATE.lock().acquire()
}

pub(crate) fn disable_virtualization() {
    VMM_STATE.lock().release();
}

impl VmmState {
    fn acquire(&mut self) -> VmmResult<CpuVendor> {
        if self.active_vms == 0 {
            let vendor = probe().ok_or(VmmError::NotSupported)?;
            match vendor {
                CpuVendor::Intel => self.vmxon()?,
                CpuVendor::Amd => self.svm_enable()?,
            }
            self.vendor = Some(vendor);
        }
        self.active_vms += 1;
        Ok(self.vendor.expect("vendor set while VMs are active"))
    }

    fn release(&mut self) {
        self.active_vms -= 1;
        if self.active_vms > 0 {
            return;
        }
        match self.vendor {
            Some(CpuVendor::Intel) => unsafe {
                if vmx_insn::vmxoff().is_err() {
                    warn!("[VMM] failed to leave VMX operation");
                    return;
                }
                Cr4::update(|cr4| cr4.remove(Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS));
                self.vmxon_page = None;
            },
            Some(CpuVendor::Amd) => unsafe {
                Efer::update(|efer| efer.remove(EferFlags::SECURE_VIRTUAL_MACHINE_ENABLE));
                self.host_save_page = None;
            },
            None => {}
        }
    }

    fn vmxon(&mut self) -> VmmResult {
        let mut cr4 = Cr4::read();
        if cr4.contains(Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS) {
            warn!("[VMM] VMX is already on");
            return Err(VmmError::BadState);
        }

        let vmx_basic = VmxBasic::read();
        if vmx_basic.region_size as usize > PAGE_SIZE {
            return Err(VmmError::NotSupported);
        }
        if !vmx_basic.write_back {
            return Err(VmmError::NotSupported);
        }
        // Port exits must carry decoded instruction information.
        if !vmx_basic.io_exit_info {
            return Err(VmmError::NotSupported);
        }
        if !vmx_basic.vmx_flex_controls {
            return Err(VmmError::NotSupported);
        }

        // Firmware may lock VMX off; claim it when the lock is open.
        let ctrl = FeatureControl::read();
        let locked = ctrl.contains(FeatureControlFlags::LOCKED);
        let enabled = ctrl.contains(FeatureControlFlags::VMXON_ENABLED_OUTSIDE_SMX);
        if !locked {
            unsafe {
                FeatureControl::write(
                    ctrl | FeatureControlFlags::LOCKED
                        | FeatureControlFlags::VMXON_ENABLED_OUTSIDE_SMX,
                )
            };
        } else if !enabled {
            warn!("[VMM] VMX disabled by firmware");
            return Err(VmmError::NotSupported);
        }

        cr4 |= Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS;
        if !cr0_is_valid(Cr0::read_raw()) || !cr4_is_valid(cr4.bits()) {
            return Err(VmmError::BadState);
        }

        let page = Frame::alloc()?;
        unsafe {
            *page.as_mut_ptr::<u32>() = vmx_basic.revision_id & 0x7FFF_FFFF;
            Cr4::write(cr4);
            if vmx_insn::vmxon(page.phys_addr() as u64).is_err() {
                Cr4::update(|cr4| cr4.remove(Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS));
                warn!("[VMM] VMXON failed");
                return Err(VmmError::Internal);
            }
        }
        info!("[VMM] VMX operation entered");
        self.vmxon_page = Some(page);
        Ok(())
    }

    fn svm_enable(&mut self) -> VmmResult {
        // CPUID Fn8000_000A EDX: SVM feature identification.
        let features = raw_cpuid::cpuid!(0x8000_000A).edx;
        if features & (1 << 0) == 0 {
            warn!("[VMM] SVM without nested paging");
            return Err(VmmError::NotSupported);
        }
        // Exit decoding relies on the next-RIP field.
        if features & (1 << 3) == 0 {
            warn!("[VMM] SVM without next-RIP save");
            return Err(VmmError::NotSupported);
        }

        let page = Frame::alloc()?;
        unsafe {
            Efer::update(|efer| efer.insert(EferFlags::SECURE_VIRTUAL_MACHINE_ENABLE));
            Msr::new(msr::VM_HSAVE_PA).write(page.phys_addr() as u64);
        }
        info!("[VMM] SVM enabled");
        self.host_save_page = Some(page);
        Ok(())
    }
}

/// CR0/CR4 must satisfy the VMX fixed-bit MSRs before VMXON.
fn cr_is_valid(value: u64, fixed0_msr: u32, fixed1_msr: u32) -> bool {
    let fixed0 = unsafe { Msr::new(fixed0_msr).read() };
    let fixed1 = unsafe { Msr::new(fixed1_msr).read() };
    ((value & fixed1) | fixed0) == value
}

fn cr0_is_valid(value: u64) -> bool {
    cr_is_valid(value, msr::IA32_VMX_CR0_FIXED0, msr::IA32_VMX_CR0_FIXED1)
}

fn cr4_is_valid(value: u64) -> bool {
    cr_is_valid(value, msr::IA32_VMX_CR4_FIXED0, msr::IA32_VMX_CR4_FIXED1)
}
