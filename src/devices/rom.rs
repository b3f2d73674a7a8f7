//! Boot ROM.
//!
//! A small read-only region at the reset vector. It holds a five-instruction
//! stub that loads the hart id into `a0`, the DTB address into `a1`, and
//! jumps to the loaded kernel, followed by the 64-bit jump target and the
//! device-tree blob itself.

use crate::dram::MemoryError;

pub const ROM_BASE: u64 = 0x1000;
pub const ROM_SIZE: u64 = 0xf000;

/// Offset of the 64-bit jump-target word within the ROM.
const TARGET_OFFSET: usize = 24;
/// Offset of the DTB within the ROM.
const DTB_OFFSET: usize = 32;

pub struct BootRom {
    data: Vec<u8>,
}

impl BootRom {
    /// Build the ROM image: reset stub, jump target, DTB.
    pub fn new(jump_target: u64, dtb: Vec<u8>) -> Self {
        // auipc t0, 0x0          ; t0 = ROM_BASE
        // addi  a1, t0, 32       ; a1 = &dtb
        // csrr  a0, mhartid
        // ld    t0, 24(t0)       ; t0 = jump target
        // jr    t0
        let stub: [u32; 5] = [
            0x0000_0297,
            0x0202_8593,
            0xf140_2573,
            0x0182_b283,
            0x0002_8067,
        ];

        let mut data = Vec::with_capacity(DTB_OFFSET + dtb.len());
        for word in stub {
            data.extend_from_slice(&word.to_le_bytes());
        }
        data.resize(TARGET_OFFSET, 0);
        data.extend_from_slice(&jump_target.to_le_bytes());
        debug_assert_eq!(data.len(), DTB_OFFSET);
        data.extend_from_slice(&dtb);
        assert!(data.len() as u64 <= ROM_SIZE, "DTB does not fit in the ROM");
        Self { data }
    }

    /// Load `size` bits little-endian from the ROM. Reads past the image but
    /// inside the aperture return zero.
    pub fn load(&self, offset: u64, size: u8) -> Result<u64, MemoryError> {
        if offset >= ROM_SIZE {
            return Err(MemoryError::OutOfBounds(offset));
        }
        let off = offset as usize;
        let mut value = 0u64;
        for i in 0..(size as usize / 8) {
            let byte = self.data.get(off + i).copied().unwrap_or(0);
            value |= (byte as u64) << (i * 8);
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dram::DRAM_BASE;

    #[test]
    fn reset_stub_layout() {
        let rom = BootRom::new(DRAM_BASE, vec![0xd0, 0x0d, 0xfe, 0xed]);
        // First instruction is `auipc t0, 0`.
        assert_eq!(rom.load(0, 32).unwrap(), 0x0000_0297);
        // Jump target word.
        assert_eq!(rom.load(24, 64).unwrap(), DRAM_BASE);
        // DTB begins right after.
        assert_eq!(rom.load(32, 32).unwrap(), 0xedfe_0dd0);
    }

    #[test]
    fn reads_past_image_return_zero() {
        let rom = BootRom::new(DRAM_BASE, Vec::new());
        assert_eq!(rom.load(0x8000, 64).unwrap(), 0);
        assert!(rom.load(ROM_SIZE, 8).is_err());
    }
}
