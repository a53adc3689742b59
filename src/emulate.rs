//! Instruction emulation for MMIO service.
//!
//! When hardware cannot decode a faulting access itself, the run loop
//! fetches the opcode window at the guest RIP and hands it here. Only the
//! MOV forms that show up on device pages are decoded: opcodes
//! 0x88/0x89/0x8A/0x8B with legacy segment and size prefixes, ModR/M
//! mod=00 register-indirect addressing. Anything else fails loudly with
//! `NotSupported` so new forms are caught during bring-up instead of
//! being mis-decoded.

use numeric_enum_macro::numeric_enum;

use crate::device::MmioDevice;
use crate::exit::MAX_INSTRUCTION_LEN;
use crate::memory::GuestPhysAddr;
use crate::regs::RegisterState;
use crate::{VmmError, VmmResult};

numeric_enum! {
    #[repr(u8)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Gpr {
        Rax = 0,
        Rcx = 1,
        Rdx = 2,
        Rbx = 3,
        Rsp = 4,
        Rbp = 5,
        Rsi = 6,
        Rdi = 7,
    }
}

fn size_mask(size: u8) -> u64 {
    match size {
        1 => 0xFF,
        2 => 0xFFFF,
        4 => 0xFFFF_FFFF,
        _ => u64::MAX,
    }
}

fn gpr(regs: &mut RegisterState, r: Gpr) -> &mut u64 {
    match r {
        Gpr::Rax => &mut regs.rax,
        Gpr::Rcx => &mut regs.rcx,
        Gpr::Rdx => &mut regs.rdx,
        Gpr::Rbx => &mut regs.rbx,
        Gpr::Rsp => &mut regs.rsp,
        Gpr::Rbp => &mut regs.rbp,
        Gpr::Rsi => &mut regs.rsi,
        Gpr::Rdi => &mut regs.rdi,
    }
}

fn read_gpr(regs: &mut RegisterState, r: Gpr, size: u8) -> u64 {
    *gpr(regs, r) & size_mask(size)
}

/// Masked register writeback: byte and word stores merge, dword stores
/// zero-extend per the architectural rule for 32-bit destinations.
fn write_gpr(regs: &mut RegisterState, r: Gpr, value: u64, size: u8) {
    let reg = gpr(regs, r);
    match size {
        1 => *reg = (*reg & !0xFF) | (value & 0xFF),
        2 => *reg = (*reg & !0xFFFF) | (value & 0xFFFF),
        4 => *reg = value & 0xFFFF_FFFF,
        _ => *reg = value,
    }
}

struct ModRm {
    mode: u8,
    reg: u8,
    rm: u8,
}

impl ModRm {
    fn parse(byte: u8) -> Self {
        Self {
            mode: (byte >> 6) & 0b11,
            reg: (byte >> 3) & 0b111,
            rm: byte & 0b111,
        }
    }
}

fn dump_window(instruction: &[u8; MAX_INSTRUCTION_LEN], at: usize) {
    warn!(
        "[VMM] emulate: unsupported opcode at byte {}: {:02x?}",
        at, instruction
    );
}

/// Resolve the register-indirect effective address for mod=00 forms.
/// rm 4 selects a SIB byte and rm 5 a displacement; neither is decoded.
fn indirect_address(
    regs: &mut RegisterState,
    modrm: &ModRm,
    segment_base: u64,
    address_size: u8,
) -> VmmResult<GuestPhysAddr> {
    if modrm.mode != 0 || modrm.rm == 0b100 || modrm.rm == 0b101 {
        return Err(VmmError::NotSupported);
    }
    let rm = Gpr::try_from(modrm.rm).map_err(|_| VmmError::NotSupported)?;
    let offset = read_gpr(regs, rm, address_size);
    Ok((segment_base + offset) as GuestPhysAddr)
}

/// Decode and execute one MOV, issuing the access on `dev` and advancing
/// RIP by the number of bytes consumed.
pub fn emulate(
    instruction: &[u8; MAX_INSTRUCTION_LEN],
    regs: &mut RegisterState,
    dev: &dyn MmioDevice,
) -> VmmResult {
    let default_size: u8 = if regs.cs.attrib.db { 4 } else { 2 };
    let other_size: u8 = if regs.cs.attrib.db { 2 } else { 4 };
    let mut operand_size = default_size;
    let mut address_size = default_size;
    let mut segment_base = regs.ds.base;

    let mut i = 0;
    // The last byte cannot start a MOV: there would be no room for ModR/M.
    while i < MAX_INSTRUCTION_LEN - 1 {
        let op = instruction[i];
        match op {
            0x26 => segment_base = regs.es.base,
            0x2E => segment_base = regs.cs.base,
            0x36 => segment_base = regs.ss.base,
            0x3E => segment_base = regs.ds.base,
            0x64 => segment_base = regs.fs.base,
            0x65 => segment_base = regs.gs.base,

            0x66 => operand_size = other_size,
            0x67 => address_size = other_size,

            // MOV r/m8, r8
            0x88 => {
                let modrm = ModRm::parse(instruction[i + 1]);
                let gpa = indirect_address(regs, &modrm, segment_base, address_size)
                    .map_err(|e| {
                        dump_window(instruction, i);
                        e
                    })?;
                let reg = Gpr::try_from(modrm.reg).map_err(|_| VmmError::NotSupported)?;
                let value = read_gpr(regs, reg, 1);
                dev.mmio_write(gpa, value, 1);
                regs.rip += i as u64 + 2;
                return Ok(());
            }

            // MOV r/m{16,32}, r{16,32}
            0x89 => {
                let modrm = ModRm::parse(instruction[i + 1]);
                let gpa = indirect_address(regs, &modrm, segment_base, address_size)
                    .map_err(|e| {
                        dump_window(instruction, i);
                        e
                    })?;
                let reg = Gpr::try_from(modrm.reg).map_err(|_| VmmError::NotSupported)?;
                let value = read_gpr(regs, reg, operand_size);
                dev.mmio_write(gpa, value, operand_size);
                regs.rip += i as u64 + 2;
                return Ok(());
            }

            // MOV r8, r/m8
            0x8A => {
                let modrm = ModRm::parse(instruction[i + 1]);
                let gpa = indirect_address(regs, &modrm, segment_base, address_size)
                    .map_err(|e| {
                        dump_window(instruction, i);
                        e
                    })?;
                let reg = Gpr::try_from(modrm.reg).map_err(|_| VmmError::NotSupported)?;
                let value = dev.mmio_read(gpa, 1);
                write_gpr(regs, reg, value, 1);
                regs.rip += i as u64 + 2;
                return Ok(());
            }

            // MOV r{16,32}, r/m{16,32}
            0x8B => {
                let modrm = ModRm::parse(instruction[i + 1]);
                let gpa = indirect_address(regs, &modrm, segment_base, address_size)
                    .map_err(|e| {
                        dump_window(instruction, i);
                        e
                    })?;
                let reg = Gpr::try_from(modrm.reg).map_err(|_| VmmError::NotSupported)?;
                let value = dev.mmio_read(gpa, operand_size);
                write_gpr(regs, reg, value, operand_size);
                regs.rip += i as u64 + 2;
                return Ok(());
            }

            _ => {
                dump_window(instruction, i);
                return Err(VmmError::NotSupported);
            }
        }
        i += 1;
    }

    dump_window(instruction, MAX_INSTRUCTION_LEN - 1);
    Err(VmmError::NotSupported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::SegmentAttributes;
    use spin::Mutex;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Access {
        Read(GuestPhysAddr, u8),
        Write(GuestPhysAddr, u64, u8),
    }

    #[derive(Default)]
    struct RecordingDevice {
        accesses: Mutex<Vec<Access>>,
        read_value: Mutex<u64>,
    }

    impl RecordingDevice {
        fn returning(value: u64) -> Self {
            let dev = Self::default();
            *dev.read_value.lock() = value;
            dev
        }
    }

    impl MmioDevice for RecordingDevice {
        fn mmio_read(&self, gpa: GuestPhysAddr, size: u8) -> u64 {
            self.accesses.lock().push(Access::Read(gpa, size));
            *self.read_value.lock()
        }
        fn mmio_write(&self, gpa: GuestPhysAddr, value: u64, size: u8) {
            self.accesses.lock().push(Access::Write(gpa, value, size));
        }
    }

    fn regs32() -> RegisterState {
        let mut regs = RegisterState::default();
        regs.cs.attrib = SegmentAttributes {
            db: true,
            ..Default::default()
        };
        regs
    }

    fn window(bytes: &[u8]) -> [u8; MAX_INSTRUCTION_LEN] {
        let mut buf = [0x90; MAX_INSTRUCTION_LEN];
        buf[..bytes.len()].copy_from_slice(bytes);
        buf
    }

    #[test]
    fn store_dword_through_register_indirect() {
        // mov dword ptr [ebx], eax
        let mut regs = regs32();
        regs.rbx = 0xFEC0_0000;
        regs.rax = 0xDEAD_BEEF;
        let dev = RecordingDevice::default();

        emulate(&window(&[0x89, 0x03]), &mut regs, &dev).unwrap();
        assert_eq!(
            *dev.accesses.lock(),
            vec![Access::Write(0xFEC0_0000, 0xDEAD_BEEF, 4)]
        );
        assert_eq!(regs.rip, 2);
    }

    #[test]
    fn load_dword_zero_extends() {
        // mov eax, dword ptr [ebx]
        let mut regs = regs32();
        regs.rbx = 0xFEC0_0000;
        regs.rax = 0xFFFF_FFFF_FFFF_FFFF;
        let dev = RecordingDevice::returning(0x1234_5678);

        emulate(&window(&[0x8B, 0x03]), &mut regs, &dev).unwrap();
        assert_eq!(*dev.accesses.lock(), vec![Access::Read(0xFEC0_0000, 4)]);
        assert_eq!(regs.rax, 0x1234_5678);
        assert_eq!(regs.rip, 2);
    }

    #[test]
    fn byte_forms_touch_only_the_low_byte() {
        // mov cl, byte ptr [rax] then mov byte ptr [rax], dl
        let mut regs = regs32();
        regs.rax = 0xFED0_0000;
        regs.rcx = 0xAAAA_AAAA_AAAA_AAAA;
        regs.rdx = 0x5A;
        let dev = RecordingDevice::returning(0xEF);

        emulate(&window(&[0x8A, 0x08]), &mut regs, &dev).unwrap();
        assert_eq!(regs.rcx, 0xAAAA_AAAA_AAAA_AAEF);

        regs.rip = 0;
        emulate(&window(&[0x88, 0x10]), &mut regs, &dev).unwrap();
        assert_eq!(
            dev.accesses.lock().last().copied(),
            Some(Access::Write(0xFED0_0000, 0x5A, 1))
        );
    }

    #[test]
    fn operand_size_prefix_flips_width() {
        // 32-bit code: 66 89 03 is mov word ptr [ebx], ax
        let mut regs = regs32();
        regs.rbx = 0xFEC0_0010;
        regs.rax = 0xDEAD_BEEF;
        let dev = RecordingDevice::default();

        emulate(&window(&[0x66, 0x89, 0x03]), &mut regs, &dev).unwrap();
        assert_eq!(
            *dev.accesses.lock(),
            vec![Access::Write(0xFEC0_0010, 0xBEEF, 2)]
        );
        assert_eq!(regs.rip, 3);
    }

    #[test]
    fn sixteen_bit_code_defaults_to_word() {
        let mut regs = RegisterState::default(); // CS.DB clear
        regs.rbx = 0x0000_8000;
        regs.rax = 0xDEAD_BEEF;
        let dev = RecordingDevice::default();

        emulate(&window(&[0x89, 0x03]), &mut regs, &dev).unwrap();
        assert_eq!(
            *dev.accesses.lock(),
            vec![Access::Write(0x8000, 0xBEEF, 2)]
        );
    }

    #[test]
    fn address_size_prefix_widens_sixteen_bit_addressing() {
        let mut regs = RegisterState::default(); // CS.DB clear
        regs.rbx = 0xFEC1_2340;
        regs.rax = 0x77;
        let dev = RecordingDevice::default();

        // Without the prefix only BX contributes.
        emulate(&window(&[0x89, 0x03]), &mut regs, &dev).unwrap();
        assert_eq!(
            dev.accesses.lock().last().copied(),
            Some(Access::Write(0x2340, 0x0077, 2))
        );

        regs.rip = 0;
        emulate(&window(&[0x67, 0x89, 0x03]), &mut regs, &dev).unwrap();
        assert_eq!(
            dev.accesses.lock().last().copied(),
            Some(Access::Write(0xFEC1_2340, 0x0077, 2))
        );
    }

    #[test]
    fn segment_override_changes_the_base() {
        let mut regs = regs32();
        regs.fs.base = 0x1_0000;
        regs.rbx = 0x20;
        regs.rax = 1;
        let dev = RecordingDevice::default();

        emulate(&window(&[0x64, 0x89, 0x03]), &mut regs, &dev).unwrap();
        assert_eq!(
            *dev.accesses.lock(),
            vec![Access::Write(0x1_0020, 1, 4)]
        );
        assert_eq!(regs.rip, 3);
    }

    #[test]
    fn unsupported_addressing_is_rejected() {
        let mut regs = regs32();
        let dev = RecordingDevice::default();

        // mod=01 (displacement)
        assert_eq!(
            emulate(&window(&[0x89, 0x43]), &mut regs, &dev),
            Err(VmmError::NotSupported)
        );
        // rm=100 (SIB)
        assert_eq!(
            emulate(&window(&[0x8B, 0x04]), &mut regs, &dev),
            Err(VmmError::NotSupported)
        );
        // rm=101 (disp32)
        assert_eq!(
            emulate(&window(&[0x8B, 0x05]), &mut regs, &dev),
            Err(VmmError::NotSupported)
        );
        // Unknown opcode
        assert_eq!(
            emulate(&window(&[0x0F, 0x20]), &mut regs, &dev),
            Err(VmmError::NotSupported)
        );
        assert!(dev.accesses.lock().is_empty());
        assert_eq!(regs.rip, 0);
    }
}
