//! Second-level page tables (Intel EPT / AMD nested paging).
//!
//! One manager serves both vendors: the walk is identical (9 bits per
//! level, 512 entries per 4 KiB table), only the entry encoding differs.
//! Intel EPT entries carry independent R/W/X bits and a 3-bit memory
//! type at bits 5:3; AMD nested entries are ordinary long-mode PTEs with
//! present/writable/NX semantics and PAT-index cache bits. The user bit
//! is always set on AMD entries since nested walks are user accesses.

use bit_field::BitField;
use bitflags::bitflags;
use numeric_enum_macro::numeric_enum;

use super::CpuVendor;
use crate::ffi::{alloc_frame, dealloc_frame, phys_to_virt};
use crate::memory::{GuestPhysAddr, HostPhysAddr, PAGE_SIZE};
use crate::{VmmError, VmmResult};

const ENTRY_COUNT: usize = 512;
const FRAME_MASK: u64 = 0x0000_FFFF_FFFF_F000;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u64 {
        const READ      = 1 << 0;
        const WRITE     = 1 << 1;
        const EXECUTE   = 1 << 2;
    }
}

impl Default for MapFlags {
    fn default() -> Self {
        Self::READ | Self::WRITE | Self::EXECUTE
    }
}

numeric_enum! {
    #[repr(u8)]
    #[derive(Debug, PartialEq, Eq, Clone, Copy)]
    pub enum MemoryType {
        Uncached = 0,
        WriteCombining = 1,
        WriteThrough = 4,
        WriteProtected = 5,
        WriteBack = 6,
    }
}

/// A single 64-bit entry, interpreted per vendor.
#[repr(transparent)]
struct PageEntry {
    raw: u64,
}

impl PageEntry {
    fn from(hpaddr: HostPhysAddr) -> &'static mut Self {
        unsafe { &mut *(phys_to_virt(hpaddr) as *mut Self) }
    }

    #[inline]
    const fn is_unused(&self) -> bool {
        self.raw == 0
    }

    #[inline]
    fn set_unused(&mut self) {
        self.raw = 0;
    }

    #[inline]
    const fn frame(&self) -> HostPhysAddr {
        (self.raw & FRAME_MASK) as HostPhysAddr
    }

    /// Non-leaf entry pointing at the next-level table, fully permissive
    /// so leaf bits stay authoritative.
    fn set_intermediate(&mut self, vendor: CpuVendor, next: HostPhysAddr) {
        let base = next as u64 & FRAME_MASK;
        self.raw = match vendor {
            CpuVendor::Intel => base | 0b111,
            // Present | writable | user.
            CpuVendor::Amd => base | 0b111,
        };
    }

    fn set_leaf(&mut self, vendor: CpuVendor, hpa: HostPhysAddr, flags: MapFlags, mem_type: MemoryType) {
        let base = hpa as u64 & FRAME_MASK;
        self.raw = match vendor {
            CpuVendor::Intel => {
                let mut v = base;
                v.set_bit(0, flags.contains(MapFlags::READ));
                v.set_bit(1, flags.contains(MapFlags::WRITE));
                v.set_bit(2, flags.contains(MapFlags::EXECUTE));
                v.set_bits(3..6, mem_type as u64);
                v
            }
            CpuVendor::Amd => {
                let pat_index = match mem_type {
                    MemoryType::WriteBack => 0u64,
                    MemoryType::WriteThrough => 1,
                    MemoryType::WriteCombining => 2,
                    MemoryType::Uncached | MemoryType::WriteProtected => 3,
                };
                let mut v = base;
                v.set_bit(0, flags.contains(MapFlags::READ));
                v.set_bit(1, flags.contains(MapFlags::WRITE));
                v.set_bit(2, true);
                v.set_bit(3, pat_index.get_bit(0)); // PWT
                v.set_bit(4, pat_index.get_bit(1)); // PCD
                v.set_bit(7, pat_index.get_bit(2)); // PAT
                v.set_bit(63, !flags.contains(MapFlags::EXECUTE));
                v
            }
        };
    }

    fn flags(&self, vendor: CpuVendor) -> MapFlags {
        let mut flags = MapFlags::empty();
        match vendor {
            CpuVendor::Intel => {
                flags.set(MapFlags::READ, self.raw.get_bit(0));
                flags.set(MapFlags::WRITE, self.raw.get_bit(1));
                flags.set(MapFlags::EXECUTE, self.raw.get_bit(2));
            }
            CpuVendor::Amd => {
                flags.set(MapFlags::READ, self.raw.get_bit(0));
                flags.set(MapFlags::WRITE, self.raw.get_bit(1));
                flags.set(MapFlags::EXECUTE, !self.raw.get_bit(63));
            }
        }
        flags
    }
}

/// A guest-physical address space: root table plus level count.
///
/// Mappings are 4 KiB leaves only; callers own TLB shootdown when
/// replacing a live translation.
#[derive(Debug)]
pub struct NestedPageTable {
    vendor: CpuVendor,
    levels: u8,
    root: HostPhysAddr,
}

impl NestedPageTable {
    pub fn new(vendor: CpuVendor) -> VmmResult<Self> {
        Self::with_levels(vendor, 4)
    }

    pub fn with_levels(vendor: CpuVendor, levels: u8) -> VmmResult<Self> {
        if !(3..=4).contains(&levels) {
            return Err(VmmError::InvalidParam);
        }
        let root = alloc_frame().ok_or(VmmError::NoMemory)?;
        Self::clear_table(root);
        trace!("[VMM] new {:?} nested table root @ {:#x}", vendor, root);
        Ok(Self { vendor, levels, root })
    }

    pub fn root_phys(&self) -> HostPhysAddr {
        self.root
    }

    pub fn levels(&self) -> u8 {
        self.levels
    }

    /// Install a leaf translation for one 4 KiB page. An existing leaf is
    /// overwritten.
    pub fn map(
        &mut self,
        gpa: GuestPhysAddr,
        hpa: HostPhysAddr,
        flags: MapFlags,
        mem_type: MemoryType,
    ) -> VmmResult {
        trace!("[VMM] map {:#x} -> {:#x} {:?} {:?}", gpa, hpa, flags, mem_type);
        self.get_entry(gpa, true)?
            .set_leaf(self.vendor, hpa, flags, mem_type);
        Ok(())
    }

    pub fn unmap(&mut self, gpa: GuestPhysAddr) -> VmmResult {
        self.get_entry(gpa, false)?.set_unused();
        Ok(())
    }

    /// Change the permissions of an existing leaf, keeping its frame and
    /// memory type.
    pub fn protect(&mut self, gpa: GuestPhysAddr, flags: MapFlags) -> VmmResult {
        let vendor = self.vendor;
        let entry = self.get_entry(gpa, false)?;
        if entry.is_unused() {
            return Err(VmmError::InvalidParam);
        }
        let mem_type = if vendor == CpuVendor::Intel {
            MemoryType::try_from(entry.raw.get_bits(3..6) as u8).map_err(|_| VmmError::BadState)?
        } else {
            MemoryType::WriteBack
        };
        let frame = entry.frame();
        entry.set_leaf(vendor, frame, flags, mem_type);
        Ok(())
    }

    /// Resolve a guest-physical page to its host frame and permissions.
    pub fn query(&self, gpa: GuestPhysAddr) -> VmmResult<(HostPhysAddr, MapFlags)> {
        let entry = self.get_entry(gpa, false)?;
        if entry.is_unused() {
            return Err(VmmError::InvalidParam);
        }
        Ok((entry.frame(), entry.flags(self.vendor)))
    }

    /// Returns the leaf entry for `gpa`, allocating intermediate tables
    /// on the way down when `create` is set.
    fn get_entry(&self, gpa: GuestPhysAddr, create: bool) -> VmmResult<&'static mut PageEntry> {
        let mut table = self.root;
        let gpa = gpa & !(PAGE_SIZE - 1);
        let levels = self.levels as usize;
        for level in 0..levels {
            let shift = 12 + 9 * (levels - 1 - level);
            let index = (gpa >> shift) & (ENTRY_COUNT - 1);
            let entry = PageEntry::from(table + index * 8);
            if level == levels - 1 {
                return Ok(entry);
            }
            if entry.is_unused() {
                if !create {
                    return Err(VmmError::InvalidParam);
                }
                let next = alloc_frame().ok_or(VmmError::NoMemory)?;
                Self::clear_table(next);
                entry.set_intermediate(self.vendor, next);
            }
            table = entry.frame();
        }
        unreachable!()
    }

    fn clear_table(table: HostPhysAddr) {
        for index in 0..ENTRY_COUNT {
            PageEntry::from(table + index * 8).set_unused();
        }
    }

    fn destroy_level(&self, table: HostPhysAddr, level: usize) {
        if level < self.levels as usize - 1 {
            for index in 0..ENTRY_COUNT {
                let entry = PageEntry::from(table + index * 8);
                if !entry.is_unused() {
                    self.destroy_level(entry.frame(), level + 1);
                }
            }
        }
        dealloc_frame(table);
    }
}

impl Drop for NestedPageTable {
    fn drop(&mut self) {
        trace!("[VMM] destroy nested table root @ {:#x}", self.root);
        // Leaf frames belong to the VM's memory regions, not the table.
        self.destroy_level(self.root, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::alloc_frame;

    #[test]
    fn map_then_query_round_trips() {
        let mut npt = NestedPageTable::new(CpuVendor::Intel).unwrap();
        let frame_a = alloc_frame().unwrap();
        let frame_b = alloc_frame().unwrap();

        npt.map(0x0, frame_a, MapFlags::default(), MemoryType::WriteBack)
            .unwrap();
        npt.map(
            0x7FFF_F000,
            frame_b,
            MapFlags::READ | MapFlags::WRITE,
            MemoryType::WriteBack,
        )
        .unwrap();

        assert_eq!(npt.query(0x0).unwrap(), (frame_a, MapFlags::default()));
        assert_eq!(
            npt.query(0x7FFF_F123).unwrap(),
            (frame_b, MapFlags::READ | MapFlags::WRITE)
        );
        assert!(npt.query(0x1000).is_err());

        crate::ffi::dealloc_frame(frame_a);
        crate::ffi::dealloc_frame(frame_b);
    }

    #[test]
    fn remap_overwrites_leaf() {
        let mut npt = NestedPageTable::new(CpuVendor::Intel).unwrap();
        let frame_a = alloc_frame().unwrap();
        let frame_b = alloc_frame().unwrap();

        npt.map(0x2000, frame_a, MapFlags::default(), MemoryType::WriteBack)
            .unwrap();
        npt.map(0x2000, frame_b, MapFlags::READ, MemoryType::WriteBack)
            .unwrap();
        assert_eq!(npt.query(0x2000).unwrap(), (frame_b, MapFlags::READ));

        crate::ffi::dealloc_frame(frame_a);
        crate::ffi::dealloc_frame(frame_b);
    }

    #[test]
    fn intel_leaf_encoding() {
        let mut npt = NestedPageTable::new(CpuVendor::Intel).unwrap();
        let frame = alloc_frame().unwrap();
        npt.map(
            0x5000,
            frame,
            MapFlags::READ | MapFlags::WRITE,
            MemoryType::WriteBack,
        )
        .unwrap();

        let entry = npt.get_entry(0x5000, false).unwrap();
        assert_eq!(entry.raw & 0b111, 0b011);
        assert_eq!(entry.raw.get_bits(3..6), MemoryType::WriteBack as u64);
        assert_eq!(entry.frame(), frame);

        crate::ffi::dealloc_frame(frame);
    }

    #[test]
    fn amd_leaf_encoding() {
        let mut npt = NestedPageTable::new(CpuVendor::Amd).unwrap();
        let frame = alloc_frame().unwrap();
        npt.map(
            0x5000,
            frame,
            MapFlags::READ | MapFlags::WRITE,
            MemoryType::WriteBack,
        )
        .unwrap();

        let entry = npt.get_entry(0x5000, false).unwrap();
        // Present | writable | user, write-back cache bits, NX for a
        // non-executable page.
        assert_eq!(entry.raw & 0b1111_1111, 0b0000_0111);
        assert!(entry.raw.get_bit(63));
        assert_eq!(
            npt.query(0x5000).unwrap().1,
            MapFlags::READ | MapFlags::WRITE
        );

        npt.map(0x5000, frame, MapFlags::default(), MemoryType::WriteBack)
            .unwrap();
        let entry = npt.get_entry(0x5000, false).unwrap();
        assert!(!entry.raw.get_bit(63));

        crate::ffi::dealloc_frame(frame);
    }

    #[test]
    fn intermediates_are_fully_permissive() {
        let npt = {
            let mut npt = NestedPageTable::new(CpuVendor::Intel).unwrap();
            let frame = alloc_frame().unwrap();
            npt.map(0x4030_0000, frame, MapFlags::default(), MemoryType::WriteBack)
                .unwrap();
            crate::ffi::dealloc_frame(frame);
            npt
        };
        // Walk the top level by hand: the entry covering the mapping must
        // carry RWX so the leaf stays authoritative.
        let entry = PageEntry::from(npt.root);
        assert_eq!(entry.raw & 0b111, 0b111);
    }

    #[test]
    fn protect_changes_flags_only() {
        let mut npt = NestedPageTable::new(CpuVendor::Intel).unwrap();
        let frame = alloc_frame().unwrap();
        npt.map(0x9000, frame, MapFlags::default(), MemoryType::WriteBack)
            .unwrap();
        npt.protect(0x9000, MapFlags::READ).unwrap();
        assert_eq!(npt.query(0x9000).unwrap(), (frame, MapFlags::READ));
        crate::ffi::dealloc_frame(frame);
    }
}
