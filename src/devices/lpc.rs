//! LPC (PCI-to-ISA) bridge at 00:1f.0.
//!
//! The canonical config-space device model: a 256-byte register file
//! whose recognized windows trigger side effects on downstream devices.
//! PMBASE/ACPI_CNTL relocate the ACPI PM block, the PIRQ routers latch
//! legacy IRQ routing, and RCBA latches the root-complex window.

use alloc::sync::Arc;
use spin::Mutex;

use super::acpi::AcpiPm;
use super::pci::{
    ConfigSpace, DeviceId, HostBridge, PciDevice, CFG_CAPABILITIES, CFG_CLASS, CFG_COMMAND,
    CFG_DEVICE_ID, CFG_HEADER_LEN, CFG_HEADER_TYPE, CFG_PROG_IF, CFG_REVISION, CFG_STATUS,
    CFG_SUBCLASS, CFG_VENDOR_ID,
};
use crate::VmmResult;

const CAP_BASE: u16 = 0xE0;

const PMBASE: u16 = 0x40;
const ACPI_CNTL: u16 = 0x44;

const PIRQ_A_BASE: u16 = 0x60;
const PIRQ_A_LEN: u16 = 4;
const PIRQ_B_BASE: u16 = 0x68;
const PIRQ_B_LEN: u16 = 4;

const ROOT_COMPLEX_BASE: u16 = 0xF0;

/// ACPI_CNTL SCI routing select to IRQ line.
const SCI_MAP: [u8; 8] = [9, 10, 11, 0xFF, 20, 21, 0xFF, 0xFF];

fn ranges_overlap(start_a: u16, len_a: u16, start_b: u16, len_b: u16) -> bool {
    start_a < start_b + len_b && start_b < start_a + len_a
}

struct LpcState {
    space: ConfigSpace,
    acpi_enable: bool,
    acpi_pmbase: u16,
    sci: u8,
    rcba_enable: bool,
    rcba: u32,
}

pub struct LpcBridge {
    state: Mutex<LpcState>,
    acpi: Arc<AcpiPm>,
}

impl LpcBridge {
    pub const ID: DeviceId = DeviceId::new(0, 31, 0);

    pub fn new(acpi: Arc<AcpiPm>) -> Arc<Self> {
        let mut space = ConfigSpace::new();
        space.write16(CFG_VENDOR_ID, 0x8086);
        space.write16(CFG_DEVICE_ID, 0x2918);
        // IO space, memory space and bus mastering on.
        space.write16(CFG_COMMAND, (1 << 2) | (1 << 1) | (1 << 0));
        space.write16(CFG_STATUS, 0x210);
        space.write8(CFG_REVISION, 2);
        space.write8(CFG_CLASS, 6);
        space.write8(CFG_SUBCLASS, 1); // PCI-to-ISA bridge
        space.write8(CFG_PROG_IF, 0);
        space.write8(CFG_HEADER_TYPE, 1 << 7); // multifunction
        space.write8(CFG_CAPABILITIES, CAP_BASE as u8);

        space.write8(CAP_BASE, 9); // vendor specific
        space.write8(CAP_BASE + 1, 0); // no other caps
        space.write8(CAP_BASE + 2, 0xC);
        space.write8(CAP_BASE + 3, 0x10); // feature detection cap
        space.write32(CAP_BASE + 4, 0); // no fancy features
        space.write32(CAP_BASE + 8, 0);

        // Bit 0 is hardwired to 1 to indicate PIO space.
        space.write32(PMBASE, 1);
        space.write8(ACPI_CNTL, 0);

        for i in 0..PIRQ_A_LEN {
            space.write8(PIRQ_A_BASE + i, 0x80);
        }
        for i in 0..PIRQ_B_LEN {
            space.write8(PIRQ_B_BASE + i, 0x80);
        }

        space.write32(ROOT_COMPLEX_BASE, 0);

        Arc::new(Self {
            state: Mutex::new(LpcState {
                space,
                acpi_enable: false,
                acpi_pmbase: 0,
                sci: SCI_MAP[0],
                rcba_enable: false,
                rcba: 0,
            }),
            acpi,
        })
    }

    pub fn register(self: &Arc<Self>, bridge: &HostBridge) -> VmmResult {
        bridge.register_device(Self::ID, self.clone())
    }

    pub fn sci(&self) -> u8 {
        self.state.lock().sci
    }

    pub fn rcba(&self) -> Option<u32> {
        let state = self.state.lock();
        state.rcba_enable.then_some(state.rcba)
    }

    /// Header writes: BARs answer size probes with no decoded bits, the
    /// rest of the predefined header is plain storage.
    fn header_write(state: &mut LpcState, reg: u16, value: u32, size: u8) {
        const BARS: [u16; 7] = [0x10, 0x14, 0x18, 0x1C, 0x20, 0x24, 0x30];
        if BARS.contains(&reg) {
            if size != 4 {
                warn!("[VMM] lpc: unaligned BAR write, reg {:#x}", reg);
            }
            state.space.write32(reg, value);
            return;
        }
        state.space.write(reg, value, size);
    }

    fn pmbase_update(&self, state: &mut LpcState) {
        let value = state.space.read32(PMBASE) | 1;
        state.space.write32(PMBASE, value);
        state.acpi_pmbase = value as u16 & !1;
    }

    fn acpi_cntl_update(&self, state: &mut LpcState) {
        let cntl = state.space.read8(ACPI_CNTL);
        state.acpi_enable = cntl & (1 << 7) != 0;
        state.sci = SCI_MAP[cntl as usize & 0x7];

        info!(
            "[VMM] lpc: SCI {} ACPI decode {} at IO {:#x}",
            state.sci, state.acpi_enable, state.acpi_pmbase
        );
        self.acpi.update(state.acpi_enable, state.acpi_pmbase);
    }

    fn pirq_update(&self, state: &mut LpcState) {
        // Routing is latched in the register file; nothing consumes it
        // until an interrupt-delivery model is wired up.
        debug!(
            "[VMM] lpc: PIRQA..D {:02x?} PIRQE..H {:02x?}",
            [
                state.space.read8(PIRQ_A_BASE),
                state.space.read8(PIRQ_A_BASE + 1),
                state.space.read8(PIRQ_A_BASE + 2),
                state.space.read8(PIRQ_A_BASE + 3),
            ],
            [
                state.space.read8(PIRQ_B_BASE),
                state.space.read8(PIRQ_B_BASE + 1),
                state.space.read8(PIRQ_B_BASE + 2),
                state.space.read8(PIRQ_B_BASE + 3),
            ],
        );
    }

    fn root_complex_update(&self, state: &mut LpcState) {
        let value = state.space.read32(ROOT_COMPLEX_BASE);
        state.rcba_enable = value & 1 != 0;
        state.rcba = (value >> 13) << 13;
        debug!(
            "[VMM] lpc: root complex {} base {:#x}",
            state.rcba_enable, state.rcba
        );
    }
}

impl PciDevice for LpcBridge {
    fn pci_read(&self, _id: DeviceId, reg: u16, size: u8) -> u32 {
        let state = self.state.lock();
        let value = state.space.read(reg, size);
        if !ranges_overlap(reg, size as u16, 0, CFG_HEADER_LEN) {
            debug!("[VMM] lpc: config read, reg {:#x} size {}", reg, size);
        }
        value
    }

    fn pci_write(&self, _id: DeviceId, reg: u16, value: u32, size: u8) {
        let mut state = self.state.lock();
        if ranges_overlap(reg, size as u16, 0, CFG_HEADER_LEN) {
            Self::header_write(&mut state, reg, value, size);
        } else if ranges_overlap(reg, size as u16, PIRQ_A_BASE, PIRQ_A_LEN)
            || ranges_overlap(reg, size as u16, PIRQ_B_BASE, PIRQ_B_LEN)
        {
            state.space.write(reg, value, size);
            self.pirq_update(&mut state);
        } else if ranges_overlap(reg, size as u16, PMBASE, 4) {
            state.space.write(reg, value, size);
            self.pmbase_update(&mut state);
        } else if ranges_overlap(reg, size as u16, ACPI_CNTL, 1) {
            state.space.write(reg, value, size);
            self.acpi_cntl_update(&mut state);
        } else if ranges_overlap(reg, size as u16, ROOT_COMPLEX_BASE, 4) {
            state.space.write(reg, value, size);
            self.root_complex_update(&mut state);
        } else {
            warn!(
                "[VMM] lpc: unhandled config write, reg {:#x} value {:#x}",
                reg, value
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceBus;

    fn fixture() -> (Arc<DeviceBus>, Arc<AcpiPm>, Arc<LpcBridge>) {
        let bus = Arc::new(DeviceBus::new());
        let acpi = AcpiPm::new(&bus);
        let lpc = LpcBridge::new(acpi.clone());
        (bus, acpi, lpc)
    }

    #[test]
    fn identity_registers() {
        let (_bus, _acpi, lpc) = fixture();
        assert_eq!(lpc.pci_read(LpcBridge::ID, CFG_VENDOR_ID, 2), 0x8086);
        assert_eq!(lpc.pci_read(LpcBridge::ID, CFG_DEVICE_ID, 2), 0x2918);
        assert_eq!(lpc.pci_read(LpcBridge::ID, CFG_CLASS, 1), 6);
        assert_eq!(lpc.pci_read(LpcBridge::ID, CFG_SUBCLASS, 1), 1);
        assert_eq!(lpc.pci_read(LpcBridge::ID, CFG_HEADER_TYPE, 1), 0x80);
        // Capability chain: one vendor-specific entry at 0xE0.
        assert_eq!(lpc.pci_read(LpcBridge::ID, CFG_CAPABILITIES, 1), 0xE0);
        assert_eq!(lpc.pci_read(LpcBridge::ID, 0xE0, 1), 9);
        assert_eq!(lpc.pci_read(LpcBridge::ID, 0xE1, 1), 0);
    }

    #[test]
    fn pmbase_bit0_is_hardwired() {
        let (_bus, _acpi, lpc) = fixture();
        assert_eq!(lpc.pci_read(LpcBridge::ID, PMBASE, 4), 1);
        lpc.pci_write(LpcBridge::ID, PMBASE, 0x0000_B000, 4);
        assert_eq!(lpc.pci_read(LpcBridge::ID, PMBASE, 4), 0x0000_B001);
    }

    #[test]
    fn acpi_retargeting_reaches_the_pm_block() {
        let (bus, acpi, lpc) = fixture();

        lpc.pci_write(LpcBridge::ID, PMBASE, 0x0000_B001, 4);
        assert!(!acpi.enabled());

        // Enable decode with SCI select 0 (IRQ 9).
        lpc.pci_write(LpcBridge::ID, ACPI_CNTL, 0x80, 1);
        assert!(acpi.enabled());
        assert_eq!(acpi.base(), 0xB000);
        assert_eq!(lpc.sci(), 9);
        assert!(bus.find_pio(0xB000).is_some());
        assert!(bus.find_pio(0xB07F).is_some());
        assert!(bus.find_pio(0xB080).is_none());
    }

    #[test]
    fn bar_size_probe_decodes_no_bits() {
        let (_bus, _acpi, lpc) = fixture();
        lpc.pci_write(LpcBridge::ID, 0x10, 0xFFFF_FFFF, 4);
        assert_eq!(lpc.pci_read(LpcBridge::ID, 0x10, 4), 0xFFFF_FFFF);
        lpc.pci_write(LpcBridge::ID, 0x10, 0x1234_0000, 4);
        assert_eq!(lpc.pci_read(LpcBridge::ID, 0x10, 4), 0x1234_0000);
    }

    #[test]
    fn root_complex_base_latches() {
        let (_bus, _acpi, lpc) = fixture();
        lpc.pci_write(LpcBridge::ID, ROOT_COMPLEX_BASE, 0xFED1_C001, 4);
        assert_eq!(lpc.rcba(), Some(0xFED1_C000));
    }
}
