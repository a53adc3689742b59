//! Device-model traits and the platform dispatch maps.
//!
//! A `DeviceBus` routes guest I/O to registered device models: a port map
//! for PIO and a range map for MMIO. Both maps are keyed by range base
//! and searched by lower bound; overlapping registrations are rejected.
//! Registration normally completes before the first VM entry; the one
//! runtime mutation (ACPI PM block retargeting) re-registers from the
//! vCPU thread after the dispatch lock has been dropped.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use spin::RwLock;

use crate::memory::{GuestPhysAddr, PAGE_SIZE};
use crate::{VmmError, VmmResult};

/// A model serving programmed I/O. Calls run synchronously on the vCPU
/// thread; implementations use interior locking and must not block on
/// another vCPU.
pub trait PortDevice: Send + Sync {
    fn pio_read(&self, port: u16, size: u8) -> u32;
    fn pio_write(&self, port: u16, value: u32, size: u8);
}

/// A model serving memory-mapped I/O.
pub trait MmioDevice: Send + Sync {
    fn mmio_read(&self, gpa: GuestPhysAddr, size: u8) -> u64;
    fn mmio_write(&self, gpa: GuestPhysAddr, value: u64, size: u8);
}

/// Ordered base -> (length, handler) map with overlap-free insertion.
struct RangeMap<T> {
    ranges: BTreeMap<u64, (u64, T)>,
}

impl<T: Clone> RangeMap<T> {
    const fn new() -> Self {
        Self {
            ranges: BTreeMap::new(),
        }
    }

    fn insert(&mut self, base: u64, len: u64, handler: T) -> VmmResult {
        if len == 0 || base.checked_add(len).is_none() {
            return Err(VmmError::InvalidParam);
        }
        if let Some((&prev_base, &(prev_len, _))) = self.ranges.range(..=base).last() {
            if prev_base + prev_len > base {
                return Err(VmmError::InvalidParam);
            }
        }
        if let Some((&next_base, _)) = self.ranges.range(base..).next() {
            if next_base < base + len {
                return Err(VmmError::InvalidParam);
            }
        }
        self.ranges.insert(base, (len, handler));
        Ok(())
    }

    fn remove(&mut self, base: u64) -> VmmResult {
        self.ranges
            .remove(&base)
            .map(|_| ())
            .ok_or(VmmError::InvalidParam)
    }

    fn find(&self, addr: u64) -> Option<(u64, T)> {
        let (&base, &(len, ref handler)) = self.ranges.range(..=addr).last()?;
        if addr < base + len {
            Some((base, handler.clone()))
        } else {
            None
        }
    }
}

/// The VM's platform dispatch: guest I/O space to device models.
pub struct DeviceBus {
    pio: RwLock<RangeMap<Arc<dyn PortDevice>>>,
    mmio: RwLock<RangeMap<Arc<dyn MmioDevice>>>,
}

impl DeviceBus {
    pub fn new() -> Self {
        Self {
            pio: RwLock::new(RangeMap::new()),
            mmio: RwLock::new(RangeMap::new()),
        }
    }

    /// Claim the port range `base..base + len`. Ports have exactly one
    /// owner; an overlapping claim is refused.
    pub fn register_pio(&self, base: u16, len: u16, dev: Arc<dyn PortDevice>) -> VmmResult {
        if len == 0 || base as u32 + len as u32 > 0x1_0000 {
            return Err(VmmError::InvalidParam);
        }
        self.pio.write().insert(base as u64, len as u64, dev)
    }

    /// Release a port range previously claimed at `base`.
    pub fn unregister_pio(&self, base: u16) -> VmmResult {
        self.pio.write().remove(base as u64)
    }

    /// Claim a page-aligned guest-physical MMIO range.
    pub fn register_mmio(
        &self,
        base: GuestPhysAddr,
        len: usize,
        dev: Arc<dyn MmioDevice>,
    ) -> VmmResult {
        if base & (PAGE_SIZE - 1) != 0 || len & (PAGE_SIZE - 1) != 0 {
            return Err(VmmError::InvalidParam);
        }
        self.mmio.write().insert(base as u64, len as u64, dev)
    }

    /// Resolve a port to its owner. The returned handle is cloned out so
    /// no map lock is held while the device runs.
    pub fn find_pio(&self, port: u16) -> Option<Arc<dyn PortDevice>> {
        self.pio.read().find(port as u64).map(|(_, dev)| dev)
    }

    /// Resolve a guest-physical address to the owning MMIO model.
    pub fn find_mmio(&self, gpa: GuestPhysAddr) -> Option<Arc<dyn MmioDevice>> {
        self.mmio.read().find(gpa as u64).map(|(_, dev)| dev)
    }
}

impl Default for DeviceBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct NullDevice {
        reads: AtomicU32,
    }

    impl PortDevice for NullDevice {
        fn pio_read(&self, _port: u16, _size: u8) -> u32 {
            self.reads.fetch_add(1, Ordering::Relaxed);
            0
        }
        fn pio_write(&self, _port: u16, _value: u32, _size: u8) {}
    }

    impl MmioDevice for NullDevice {
        fn mmio_read(&self, _gpa: GuestPhysAddr, _size: u8) -> u64 {
            0
        }
        fn mmio_write(&self, _gpa: GuestPhysAddr, _value: u64, _size: u8) {}
    }

    #[test]
    fn pio_ranges_are_exclusive() {
        let bus = DeviceBus::new();
        let dev = Arc::new(NullDevice::default());

        bus.register_pio(0x60, 4, dev.clone()).unwrap();
        assert_eq!(
            bus.register_pio(0x62, 4, dev.clone()),
            Err(VmmError::InvalidParam)
        );
        assert_eq!(
            bus.register_pio(0x5E, 4, dev.clone()),
            Err(VmmError::InvalidParam)
        );
        bus.register_pio(0x64, 1, dev).unwrap();
    }

    #[test]
    fn pio_lookup_hits_range_edges() {
        let bus = DeviceBus::new();
        let dev = Arc::new(NullDevice::default());
        bus.register_pio(0x60, 4, dev).unwrap();

        assert!(bus.find_pio(0x5F).is_none());
        assert!(bus.find_pio(0x60).is_some());
        assert!(bus.find_pio(0x63).is_some());
        assert!(bus.find_pio(0x64).is_none());
    }

    #[test]
    fn pio_unregister_frees_the_range() {
        let bus = DeviceBus::new();
        let dev = Arc::new(NullDevice::default());
        bus.register_pio(0xB000, 0x80, dev.clone()).unwrap();
        bus.unregister_pio(0xB000).unwrap();
        assert!(bus.find_pio(0xB000).is_none());
        bus.register_pio(0xB040, 0x80, dev).unwrap();
    }

    #[test]
    fn mmio_requires_page_alignment() {
        let bus = DeviceBus::new();
        let dev = Arc::new(NullDevice::default());
        assert_eq!(
            bus.register_mmio(0xFEC0_0800, 0x1000, dev.clone()),
            Err(VmmError::InvalidParam)
        );
        assert_eq!(
            bus.register_mmio(0xFEC0_0000, 0x800, dev.clone()),
            Err(VmmError::InvalidParam)
        );
        bus.register_mmio(0xFEC0_0000, 0x1000, dev).unwrap();
        assert!(bus.find_mmio(0xFEC0_0FFF).is_some());
        assert!(bus.find_mmio(0xFEC0_1000).is_none());
    }

    #[test]
    fn mmio_ranges_do_not_overlap() {
        let bus = DeviceBus::new();
        let dev = Arc::new(NullDevice::default());
        bus.register_mmio(0xE000_0000, 0x10_0000, dev.clone()).unwrap();
        assert_eq!(
            bus.register_mmio(0xE00F_F000, 0x1000, dev),
            Err(VmmError::InvalidParam)
        );
    }
}
