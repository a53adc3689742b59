//! Hooks into the host kernel.

use crate::memory::{HostPhysAddr, HostVirtAddr};

/// Allocate a zero-filled physical frame.
pub fn alloc_frame() -> Option<HostPhysAddr> {
    unsafe { luna_alloc_frame() }
}

/// Allocate `count` physically contiguous frames (SVM permission maps
/// span multiple pages).
pub fn alloc_frames(count: usize) -> Option<HostPhysAddr> {
    unsafe { luna_alloc_frames(count) }
}

/// Return a contiguous frame run to the host allocator.
pub fn dealloc_frames(paddr: HostPhysAddr, count: usize) {
    unsafe { luna_dealloc_frames(paddr, count) }
}

/// Return a physical frame to the host allocator.
pub fn dealloc_frame(paddr: HostPhysAddr) {
    unsafe { luna_dealloc_frame(paddr) }
}

/// Address of a physical frame inside the host's linear memory window.
pub fn phys_to_virt(paddr: HostPhysAddr) -> HostVirtAddr {
    unsafe { luna_phys_to_virt(paddr) }
}

extern "Rust" {
    fn luna_alloc_frame() -> Option<HostPhysAddr>;
    fn luna_alloc_frames(_count: usize) -> Option<HostPhysAddr>;
    fn luna_dealloc_frame(_paddr: HostPhysAddr);
    fn luna_dealloc_frames(_paddr: HostPhysAddr, _count: usize);
    fn luna_phys_to_virt(_paddr: HostPhysAddr) -> HostVirtAddr;
}
