//! Host-side implementations of the kernel hooks for unit tests.
//!
//! Frames come from the process allocator with an identity physical to
//! virtual mapping, which is enough to exercise the page-table manager
//! and everything layered above it.

use std::alloc::{alloc_zeroed, dealloc, Layout};

use crate::memory::{HostPhysAddr, HostVirtAddr, PAGE_SIZE};

fn frame_layout() -> Layout {
    Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap()
}

#[no_mangle]
fn luna_alloc_frame() -> Option<HostPhysAddr> {
    let ptr = unsafe { alloc_zeroed(frame_layout()) };
    if ptr.is_null() {
        None
    } else {
        Some(ptr as HostPhysAddr)
    }
}

#[no_mangle]
fn luna_alloc_frames(count: usize) -> Option<HostPhysAddr> {
    let layout = Layout::from_size_align(count * PAGE_SIZE, PAGE_SIZE).unwrap();
    let ptr = unsafe { alloc_zeroed(layout) };
    if ptr.is_null() {
        None
    } else {
        Some(ptr as HostPhysAddr)
    }
}

#[no_mangle]
fn luna_dealloc_frame(paddr: HostPhysAddr) {
    unsafe { dealloc(paddr as *mut u8, frame_layout()) };
}

#[no_mangle]
fn luna_dealloc_frames(paddr: HostPhysAddr, count: usize) {
    let layout = Layout::from_size_align(count * PAGE_SIZE, PAGE_SIZE).unwrap();
    unsafe { dealloc(paddr as *mut u8, layout) };
}

#[no_mangle]
fn luna_phys_to_virt(paddr: HostPhysAddr) -> HostVirtAddr {
    paddr
}
