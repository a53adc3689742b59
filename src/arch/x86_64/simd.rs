//! Extended-state (x87/SSE) context areas.
//!
//! Host and guest extended state are swapped around every VM entry: the
//! backend stores the host image and loads the guest image before
//! entering, and reverses the pair on exit. One 4 KiB frame per context
//! holds the 512-byte FXSAVE image; FCW and MXCSR sit at their
//! architectural offsets so reset defaults can be installed directly.

use core::arch::asm;

use crate::memory::Frame;
use crate::VmmResult;

const FCW_OFFSET: usize = 0;
const MXCSR_OFFSET: usize = 24;

#[derive(Debug)]
pub struct SimdContext {
    frame: Frame,
}

impl SimdContext {
    pub fn new() -> VmmResult<Self> {
        Ok(Self {
            frame: Frame::alloc()?,
        })
    }

    /// Capture the running CPU's extended state into this context.
    pub fn store(&mut self) {
        unsafe {
            asm!("fxsave64 [{}]", in(reg) self.frame.as_mut_ptr::<u8>(), options(nostack));
        }
    }

    /// Install this context's extended state on the running CPU.
    pub fn load(&self) {
        unsafe {
            asm!("fxrstor64 [{}]", in(reg) self.frame.as_ptr::<u8>(), options(nostack));
        }
    }

    pub fn fcw(&self) -> u16 {
        unsafe { *(self.frame.as_ptr::<u8>().add(FCW_OFFSET) as *const u16) }
    }

    pub fn set_fcw(&mut self, fcw: u16) {
        unsafe { *(self.frame.as_mut_ptr::<u8>().add(FCW_OFFSET) as *mut u16) = fcw };
    }

    pub fn mxcsr(&self) -> u32 {
        unsafe { *(self.frame.as_ptr::<u8>().add(MXCSR_OFFSET) as *const u32) }
    }

    pub fn set_mxcsr(&mut self, mxcsr: u32) {
        unsafe { *(self.frame.as_mut_ptr::<u8>().add(MXCSR_OFFSET) as *mut u32) = mxcsr };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_defaults_land_at_architectural_offsets() {
        let mut simd = SimdContext::new().unwrap();
        simd.set_fcw(0x40);
        simd.set_mxcsr(0x1F80);
        assert_eq!(simd.fcw(), 0x40);
        assert_eq!(simd.mxcsr(), 0x1F80);
        let raw = simd.frame.as_ptr::<u8>();
        unsafe {
            assert_eq!(*raw, 0x40);
            assert_eq!(*raw.add(24), 0x80);
            assert_eq!(*raw.add(25), 0x1F);
        }
    }
}
