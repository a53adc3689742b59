//! Hardware-assisted virtual machine monitor for the Luna kernel.
//!
//! The crate drives the CPU's virtualization extensions (Intel VT-x or
//! AMD-V) to run unmodified x86 guests. A [`Vm`] owns the guest-physical
//! address space and the platform device dispatch; each [`Vcpu`] owns one
//! vendor backend and is driven by a host thread through [`Vcpu::run`].
//!
//! The host kernel supplies physical frames through the hooks in `ffi`.

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate alloc;
#[macro_use]
extern crate log;

#[cfg(target_arch = "x86_64")]
#[path = "arch/x86_64/mod.rs"]
mod arch;

mod device;
mod devices;
mod emulate;
mod exit;
mod ffi;
mod lapic;
mod memory;
mod mtrr;
mod regs;
mod vcpu;
mod vm;

#[cfg(test)]
mod test_support;

pub use arch::{CpuVendor, MapFlags, MemoryType, NestedPageTable};
pub use device::{DeviceBus, MmioDevice, PortDevice};
pub use devices::acpi::AcpiPm;
pub use devices::lpc::LpcBridge;
pub use devices::pci::{
    ConfigSpace, DeviceId, HostBridge, PciDevice, MMCONFIG_BASE, MMCONFIG_SIZE,
    PCI_CONFIG_ADDRESS, PCI_CONFIG_DATA,
};
pub use exit::{ExitReason, VmExit};
pub use lapic::{IpiRequest, LocalApic};
pub use memory::{GuestPhysAddr, HostPhysAddr, PAGE_SIZE};
pub use regs::{DescriptorTable, RegisterState, Segment, SegmentAttributes};
pub use vcpu::{Backend, InjectKind, Vcpu, VmCap};
pub use vm::Vm;

pub type VmmResult<T = ()> = Result<T, VmmError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmmError {
    NotSupported,
    NoMemory,
    InvalidParam,
    BadState,
    DeviceError,
    Internal,
}
