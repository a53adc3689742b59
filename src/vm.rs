//! A virtual machine: guest-physical address space, platform dispatch
//! and vCPUs.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::arch::{self, CpuVendor, MapFlags, MemoryType, NestedPageTable};
use crate::device::DeviceBus;
use crate::lapic::LocalApic;
use crate::memory::{GuestPhysAddr, HostPhysAddr, PAGE_SIZE};
use crate::vcpu::Vcpu;
use crate::{VmmError, VmmResult};

pub struct Vm {
    vendor: CpuVendor,
    npt: Arc<Mutex<NestedPageTable>>,
    bus: Arc<DeviceBus>,
    lapics: Arc<[Arc<LocalApic>]>,
    vcpus: Vec<Mutex<Vcpu>>,
}

impl Vm {
    /// Create a VM with `n_cpus` vCPUs at their reset vectors. Device
    /// models must be registered on [`Vm::bus`] before the first
    /// [`Vcpu::run`].
    pub fn new(n_cpus: u8) -> VmmResult<Arc<Self>> {
        if n_cpus == 0 {
            return Err(VmmError::InvalidParam);
        }
        let vendor = arch::enable_virtualization()?;
        let npt = Arc::new(Mutex::new(NestedPageTable::new(vendor)?));
        let bus = Arc::new(DeviceBus::new());
        let lapics: Arc<[Arc<LocalApic>]> = (0..n_cpus)
            .map(|id| Arc::new(LocalApic::new(id)))
            .collect::<Vec<_>>()
            .into();

        let mut vcpus = Vec::with_capacity(n_cpus as usize);
        for id in 0..n_cpus {
            vcpus.push(Mutex::new(Vcpu::new(
                id,
                vendor,
                npt.clone(),
                bus.clone(),
                lapics[id as usize].clone(),
                lapics.clone(),
            )?));
        }

        Ok(Arc::new(Self {
            vendor,
            npt,
            bus,
            lapics,
            vcpus,
        }))
    }

    pub fn vendor(&self) -> CpuVendor {
        self.vendor
    }

    pub fn bus(&self) -> &Arc<DeviceBus> {
        &self.bus
    }

    pub fn num_vcpus(&self) -> usize {
        self.vcpus.len()
    }

    pub fn vcpu(&self, id: usize) -> Option<&Mutex<Vcpu>> {
        self.vcpus.get(id)
    }

    pub fn lapic(&self, id: usize) -> Option<&Arc<LocalApic>> {
        self.lapics.get(id)
    }

    /// Map a page-aligned run of guest RAM onto host frames, Write-Back
    /// with full permissions.
    pub fn map_memory(
        &self,
        gpa: GuestPhysAddr,
        hpa: HostPhysAddr,
        size: usize,
    ) -> VmmResult {
        if gpa & (PAGE_SIZE - 1) != 0 || hpa & (PAGE_SIZE - 1) != 0 || size & (PAGE_SIZE - 1) != 0 {
            return Err(VmmError::InvalidParam);
        }
        let mut npt = self.npt.lock();
        for offset in (0..size).step_by(PAGE_SIZE) {
            npt.map(
                gpa + offset,
                hpa + offset,
                MapFlags::default(),
                MemoryType::WriteBack,
            )?;
        }
        Ok(())
    }

    /// Resolve a guest-physical address through the nested table.
    pub fn translate(&self, gpa: GuestPhysAddr) -> VmmResult<HostPhysAddr> {
        let (frame, _) = self.npt.lock().query(gpa)?;
        Ok(frame + (gpa & (PAGE_SIZE - 1)))
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        arch::disable_virtualization();
    }
}
