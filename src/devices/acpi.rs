//! ACPI PM block device.
//!
//! The fixed-feature register block (PM1a status/enable/control and the
//! PM timer) lives at a port base the LPC bridge owns: firmware programs
//! PMBASE and flips the decode on through ACPI_CNTL, and the bridge calls
//! [`AcpiPm::update`] to move this block. The SCI itself is not delivered
//! anywhere; routing is recorded by the bridge.

use alloc::sync::{Arc, Weak};
use spin::Mutex;

use crate::device::{DeviceBus, PortDevice};

/// PM1a event/control register offsets inside the block.
const PM1_STS: u16 = 0x00;
const PM1_EN: u16 = 0x02;
const PM1_CNT: u16 = 0x04;
const PM_TMR: u16 = 0x08;

/// The timer rolls over at 24 bits.
const PM_TMR_MASK: u32 = 0x00FF_FFFF;

#[derive(Default)]
struct PmState {
    enabled: bool,
    base: u16,
    pm1_status: u16,
    pm1_enable: u16,
    pm1_control: u16,
    /// Coarse free-running counter standing in for the 3.579545 MHz
    /// timer; advanced on every read, decoupled from host time.
    timer: u32,
}

pub struct AcpiPm {
    this: Weak<AcpiPm>,
    bus: Weak<DeviceBus>,
    state: Mutex<PmState>,
}

impl AcpiPm {
    pub const BLOCK_LEN: u16 = 0x80;

    pub fn new(bus: &Arc<DeviceBus>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            bus: Arc::downgrade(bus),
            state: Mutex::new(PmState::default()),
        })
    }

    /// Retarget the register block. Deregisters the old port range and,
    /// when decode is enabled, claims the new one.
    pub fn update(&self, enabled: bool, base: u16) {
        let bus = match self.bus.upgrade() {
            Some(bus) => bus,
            None => return,
        };
        let mut state = self.state.lock();
        if state.enabled {
            let _ = bus.unregister_pio(state.base);
        }
        state.enabled = enabled;
        state.base = base;
        if enabled {
            let this = self.this.upgrade().expect("self is alive");
            if bus.register_pio(base, Self::BLOCK_LEN, this).is_err() {
                warn!("[VMM] acpi: PM block at {:#x} collides, decode off", base);
                state.enabled = false;
                return;
            }
        }
        info!("[VMM] acpi: PM block decode {} at {:#x}", enabled, base);
    }

    pub fn enabled(&self) -> bool {
        self.state.lock().enabled
    }

    pub fn base(&self) -> u16 {
        self.state.lock().base
    }
}

impl PortDevice for AcpiPm {
    fn pio_read(&self, port: u16, size: u8) -> u32 {
        let mut state = self.state.lock();
        let offset = port - state.base;
        match offset {
            PM1_STS => state.pm1_status as u32,
            PM1_EN => state.pm1_enable as u32,
            PM1_CNT => state.pm1_control as u32,
            PM_TMR => {
                state.timer = (state.timer + 0x100) & PM_TMR_MASK;
                state.timer
            }
            _ => {
                trace!("[VMM] acpi: read of PM +{:#x} size {}", offset, size);
                0
            }
        }
    }

    fn pio_write(&self, port: u16, value: u32, size: u8) {
        let mut state = self.state.lock();
        let offset = port - state.base;
        match offset {
            // Status bits are write-one-to-clear.
            PM1_STS => state.pm1_status &= !(value as u16),
            PM1_EN => state.pm1_enable = value as u16,
            PM1_CNT => state.pm1_control = value as u16,
            _ => {
                trace!(
                    "[VMM] acpi: write of {:#x} to PM +{:#x} size {}",
                    value,
                    offset,
                    size
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_claims_and_moves_the_block() {
        let bus = Arc::new(DeviceBus::new());
        let pm = AcpiPm::new(&bus);

        pm.update(true, 0xB000);
        assert!(pm.enabled());
        assert_eq!(pm.base(), 0xB000);
        assert!(bus.find_pio(0xB000).is_some());
        assert!(bus.find_pio(0xB07F).is_some());

        pm.update(true, 0x600);
        assert!(bus.find_pio(0xB000).is_none());
        assert!(bus.find_pio(0x600).is_some());

        pm.update(false, 0x600);
        assert!(bus.find_pio(0x600).is_none());
    }

    #[test]
    fn pm1_status_is_write_one_to_clear() {
        let bus = Arc::new(DeviceBus::new());
        let pm = AcpiPm::new(&bus);
        pm.update(true, 0xB000);

        pm.state.lock().pm1_status = 0x8021;
        pm.pio_write(0xB000, 0x0021, 2);
        assert_eq!(pm.pio_read(0xB000, 2), 0x8000);
    }

    #[test]
    fn pm_timer_counts_and_wraps() {
        let bus = Arc::new(DeviceBus::new());
        let pm = AcpiPm::new(&bus);
        pm.update(true, 0xB000);

        let first = pm.pio_read(0xB008, 4);
        let second = pm.pio_read(0xB008, 4);
        assert!(second > first);
        assert_eq!(second & !PM_TMR_MASK, 0);
    }
}
