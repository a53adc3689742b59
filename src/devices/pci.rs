//! PCI configuration-cycle dispatch.
//!
//! The host bridge intercepts both configuration mechanisms, the legacy
//! 0xCF8/0xCFC port pair and the MMCONFIG window, and routes each cycle
//! to the model registered at (bus, slot, func). Absent devices read as
//! all-ones and swallow writes, which is what probing BIOSes expect.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use bit_field::BitField;
use spin::{Mutex, RwLock};

use crate::device::{MmioDevice, PortDevice};
use crate::memory::GuestPhysAddr;
use crate::{VmmError, VmmResult};

/// Legacy configuration address/data ports.
pub const PCI_CONFIG_ADDRESS: u16 = 0xCF8;
pub const PCI_CONFIG_DATA: u16 = 0xCFC;

/// Enhanced configuration (MMCONFIG) window: 1 MiB per bus, 4 KiB per
/// function.
pub const MMCONFIG_BASE: GuestPhysAddr = 0xB000_0000;
pub const MMCONFIG_SIZE: usize = 0x1000_0000;

/// Configuration-space header offsets used by the bridge models.
pub const CFG_VENDOR_ID: u16 = 0x00;
pub const CFG_DEVICE_ID: u16 = 0x02;
pub const CFG_COMMAND: u16 = 0x04;
pub const CFG_STATUS: u16 = 0x06;
pub const CFG_REVISION: u16 = 0x08;
pub const CFG_PROG_IF: u16 = 0x09;
pub const CFG_SUBCLASS: u16 = 0x0A;
pub const CFG_CLASS: u16 = 0x0B;
pub const CFG_HEADER_TYPE: u16 = 0x0E;
pub const CFG_CAPABILITIES: u16 = 0x34;
/// Bytes covered by the type-0 predefined header.
pub const CFG_HEADER_LEN: u16 = 0x40;

/// A PCI function address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceId {
    pub bus: u8,
    pub slot: u8,
    pub func: u8,
}

impl DeviceId {
    pub const fn new(bus: u8, slot: u8, func: u8) -> Self {
        Self { bus, slot, func }
    }

    fn key(self) -> u16 {
        (self.bus as u16) << 8 | (self.slot as u16 & 0x1F) << 3 | self.func as u16 & 0x7
    }
}

/// A model decoding configuration cycles for one PCI function.
pub trait PciDevice: Send + Sync {
    fn pci_read(&self, id: DeviceId, reg: u16, size: u8) -> u32;
    fn pci_write(&self, id: DeviceId, reg: u16, value: u32, size: u8);
}

/// 256 bytes of configuration space with aligned little-endian access.
///
/// PCI is little-endian on the wire; so is the host, so loads and stores
/// are direct byte copies. Sub-dword accesses are aligned down the way
/// the overlapping register views on real chipsets behave.
pub struct ConfigSpace {
    bytes: [u8; 256],
}

impl ConfigSpace {
    pub const fn new() -> Self {
        Self { bytes: [0; 256] }
    }

    pub fn read8(&self, reg: u16) -> u8 {
        self.bytes[reg as usize & 0xFF]
    }

    pub fn read16(&self, reg: u16) -> u16 {
        let reg = (reg & !1) as usize & 0xFF;
        u16::from_le_bytes([self.bytes[reg], self.bytes[reg + 1]])
    }

    pub fn read32(&self, reg: u16) -> u32 {
        let reg = (reg & !3) as usize & 0xFF;
        u32::from_le_bytes([
            self.bytes[reg],
            self.bytes[reg + 1],
            self.bytes[reg + 2],
            self.bytes[reg + 3],
        ])
    }

    pub fn write8(&mut self, reg: u16, value: u8) {
        self.bytes[reg as usize & 0xFF] = value;
    }

    pub fn write16(&mut self, reg: u16, value: u16) {
        let reg = (reg & !1) as usize & 0xFF;
        self.bytes[reg..reg + 2].copy_from_slice(&value.to_le_bytes());
    }

    pub fn write32(&mut self, reg: u16, value: u32) {
        let reg = (reg & !3) as usize & 0xFF;
        self.bytes[reg..reg + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn read(&self, reg: u16, size: u8) -> u32 {
        match size {
            1 => self.read8(reg) as u32,
            2 => self.read16(reg) as u32,
            4 => self.read32(reg),
            _ => {
                warn!("[VMM] pci: bad config access size {}", size);
                0
            }
        }
    }

    pub fn write(&mut self, reg: u16, value: u32, size: u8) {
        match size {
            1 => self.write8(reg, value as u8),
            2 => self.write16(reg, value as u16),
            4 => self.write32(reg, value),
            _ => warn!("[VMM] pci: bad config access size {}", size),
        }
    }
}

impl Default for ConfigSpace {
    fn default() -> Self {
        Self::new()
    }
}

/// The PCI host bridge: owns the function map and serves both
/// configuration mechanisms.
pub struct HostBridge {
    devices: RwLock<BTreeMap<u16, Arc<dyn PciDevice>>>,
    /// Latched CF8 address dword.
    address: Mutex<u32>,
}

impl HostBridge {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(BTreeMap::new()),
            address: Mutex::new(0),
        }
    }

    /// Bind a model to a function address. Functions have exactly one
    /// owner.
    pub fn register_device(&self, id: DeviceId, dev: Arc<dyn PciDevice>) -> VmmResult {
        let mut devices = self.devices.write();
        if devices.contains_key(&id.key()) {
            return Err(VmmError::InvalidParam);
        }
        devices.insert(id.key(), dev);
        Ok(())
    }

    fn config_read(&self, id: DeviceId, reg: u16, size: u8) -> u32 {
        let dev = self.devices.read().get(&id.key()).cloned();
        match dev {
            Some(dev) => dev.pci_read(id, reg, size),
            None => !0,
        }
    }

    fn config_write(&self, id: DeviceId, reg: u16, value: u32, size: u8) {
        let dev = self.devices.read().get(&id.key()).cloned();
        if let Some(dev) = dev {
            dev.pci_write(id, reg, value, size);
        }
    }

    /// Split the latched CF8 dword plus a data-port offset into a cycle.
    fn decode_legacy(address: u32, port: u16) -> Option<(DeviceId, u16)> {
        if !address.get_bit(31) {
            return None;
        }
        let id = DeviceId {
            bus: address.get_bits(16..24) as u8,
            slot: address.get_bits(11..16) as u8,
            func: address.get_bits(8..11) as u8,
        };
        let reg = (address.get_bits(2..8) as u16) << 2 | (port - PCI_CONFIG_DATA) & 3;
        Some((id, reg))
    }

    fn decode_mmconfig(gpa: GuestPhysAddr) -> (DeviceId, u16) {
        let offset = gpa - MMCONFIG_BASE;
        let id = DeviceId {
            bus: (offset >> 20) as u8,
            slot: (offset >> 15) as u8 & 0x1F,
            func: (offset >> 12) as u8 & 0x7,
        };
        (id, offset as u16 & 0xFFF)
    }
}

impl Default for HostBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl PortDevice for HostBridge {
    fn pio_read(&self, port: u16, size: u8) -> u32 {
        match port {
            PCI_CONFIG_ADDRESS => *self.address.lock(),
            p if (PCI_CONFIG_DATA..PCI_CONFIG_DATA + 4).contains(&p) => {
                let address = *self.address.lock();
                match Self::decode_legacy(address, p) {
                    Some((id, reg)) => self.config_read(id, reg, size),
                    None => !0,
                }
            }
            _ => !0,
        }
    }

    fn pio_write(&self, port: u16, value: u32, size: u8) {
        match port {
            PCI_CONFIG_ADDRESS if size == 4 => *self.address.lock() = value,
            PCI_CONFIG_ADDRESS => {
                warn!("[VMM] pci: ignoring partial CONFIG_ADDRESS write");
            }
            p if (PCI_CONFIG_DATA..PCI_CONFIG_DATA + 4).contains(&p) => {
                let address = *self.address.lock();
                if let Some((id, reg)) = Self::decode_legacy(address, p) {
                    self.config_write(id, reg, value, size);
                }
            }
            _ => {}
        }
    }
}

impl MmioDevice for HostBridge {
    fn mmio_read(&self, gpa: GuestPhysAddr, size: u8) -> u64 {
        let (id, reg) = Self::decode_mmconfig(gpa);
        self.config_read(id, reg, size) as u64
    }

    fn mmio_write(&self, gpa: GuestPhysAddr, value: u64, size: u8) {
        let (id, reg) = Self::decode_mmconfig(gpa);
        self.config_write(id, reg, value as u32, size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spin::Mutex as SpinMutex;

    struct ScratchDevice {
        space: SpinMutex<ConfigSpace>,
    }

    impl ScratchDevice {
        fn new() -> Arc<Self> {
            let mut space = ConfigSpace::new();
            space.write16(CFG_VENDOR_ID, 0x8086);
            space.write16(CFG_DEVICE_ID, 0x1234);
            Arc::new(Self {
                space: SpinMutex::new(space),
            })
        }
    }

    impl PciDevice for ScratchDevice {
        fn pci_read(&self, _id: DeviceId, reg: u16, size: u8) -> u32 {
            self.space.lock().read(reg, size)
        }
        fn pci_write(&self, _id: DeviceId, reg: u16, value: u32, size: u8) {
            self.space.lock().write(reg, value, size);
        }
    }

    fn cf8(bus: u8, slot: u8, func: u8, reg: u16) -> u32 {
        (1 << 31)
            | (bus as u32) << 16
            | (slot as u32) << 11
            | (func as u32) << 8
            | (reg as u32 & 0xFC)
    }

    #[test]
    fn config_space_is_little_endian_and_aligned() {
        let mut space = ConfigSpace::new();
        space.write32(0x40, 0xDEAD_B001);
        assert_eq!(space.read8(0x40), 0x01);
        assert_eq!(space.read8(0x43), 0xDE);
        assert_eq!(space.read16(0x42), 0xDEAD);
        // Misaligned requests snap down.
        assert_eq!(space.read32(0x43), 0xDEAD_B001);
        assert_eq!(space.read16(0x41), 0xB001);
    }

    #[test]
    fn legacy_cycle_reaches_the_device() {
        let bridge = HostBridge::new();
        bridge
            .register_device(DeviceId::new(0, 3, 0), ScratchDevice::new())
            .unwrap();

        bridge.pio_write(PCI_CONFIG_ADDRESS, cf8(0, 3, 0, 0), 4);
        assert_eq!(bridge.pio_read(PCI_CONFIG_DATA, 4), 0x1234_8086);
        assert_eq!(bridge.pio_read(PCI_CONFIG_DATA, 2), 0x8086);
        assert_eq!(bridge.pio_read(PCI_CONFIG_DATA + 2, 2), 0x1234);
        assert_eq!(bridge.pio_read(PCI_CONFIG_DATA + 3, 1), 0x12);
    }

    #[test]
    fn absent_devices_read_all_ones() {
        let bridge = HostBridge::new();
        bridge.pio_write(PCI_CONFIG_ADDRESS, cf8(0, 9, 0, 0), 4);
        assert_eq!(bridge.pio_read(PCI_CONFIG_DATA, 4), 0xFFFF_FFFF);
        // Disabled address latch also floats high.
        bridge.pio_write(PCI_CONFIG_ADDRESS, cf8(0, 9, 0, 0) & !(1 << 31), 4);
        assert_eq!(bridge.pio_read(PCI_CONFIG_DATA, 4), 0xFFFF_FFFF);
        // Writes to nowhere are swallowed.
        bridge.pio_write(PCI_CONFIG_DATA, 0x5A5A_5A5A, 4);
    }

    #[test]
    fn mmconfig_cycle_decodes_bus_slot_func() {
        let bridge = HostBridge::new();
        let id = DeviceId::new(2, 31, 1);
        bridge.register_device(id, ScratchDevice::new()).unwrap();

        let gpa = MMCONFIG_BASE + (2 << 20) + (31 << 15) + (1 << 12);
        assert_eq!(bridge.mmio_read(gpa, 4), 0x1234_8086);
        bridge.mmio_write(gpa + 0x40, 0xABCD, 2);
        assert_eq!(bridge.mmio_read(gpa + 0x40, 2), 0xABCD);
    }

    #[test]
    fn functions_have_one_owner() {
        let bridge = HostBridge::new();
        let id = DeviceId::new(0, 31, 0);
        bridge.register_device(id, ScratchDevice::new()).unwrap();
        assert_eq!(
            bridge.register_device(id, ScratchDevice::new()),
            Err(VmmError::InvalidParam)
        );
    }
}
