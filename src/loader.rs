//! Guest image loading: ELF64 executables (detected by magic) or raw
//! binaries dropped at the DRAM base.

use goblin::elf::{program_header::PT_LOAD, Elf};
use thiserror::Error;

use crate::dram::{Dram, MemoryError, DRAM_BASE};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to parse ELF image: {0}")]
    Elf(#[from] goblin::error::Error),

    #[error("ELF segment exceeds file bounds (offset {0:#x})")]
    SegmentOutOfFile(u64),

    #[error("segment start {0:#x} lies below the DRAM base {1:#x}")]
    BelowDram(u64, u64),

    #[error("segment {0:#x}..{1:#x} exceeds DRAM")]
    ExceedsDram(u64, u64),

    #[error("image does not fit in DRAM")]
    Memory(#[from] MemoryError),
}

/// Load a guest image into DRAM and return its entry point.
pub fn load_image(buffer: &[u8], dram: &mut Dram) -> Result<u64, LoadError> {
    if buffer.starts_with(b"\x7fELF") {
        load_elf(buffer, dram)
    } else {
        dram.write_bytes(0, buffer)?;
        Ok(DRAM_BASE)
    }
}

fn load_elf(buffer: &[u8], dram: &mut Dram) -> Result<u64, LoadError> {
    let elf = Elf::parse(buffer)?;
    let base = dram.base;
    let dram_end = base + dram.size() as u64;

    for ph in &elf.program_headers {
        if ph.p_type != PT_LOAD || ph.p_memsz == 0 {
            continue;
        }

        let file_size = ph.p_filesz as usize;
        let mem_size = ph.p_memsz as usize;
        let file_offset = ph.p_offset as usize;
        if file_offset + file_size > buffer.len() {
            return Err(LoadError::SegmentOutOfFile(ph.p_offset));
        }

        // Prefer the physical address; linker scripts for machine-mode
        // kernels sometimes leave p_vaddr in a virtual window.
        let target = if ph.p_paddr != 0 { ph.p_paddr } else { ph.p_vaddr };
        if target < base {
            return Err(LoadError::BelowDram(target, base));
        }
        let seg_end = target
            .checked_add(mem_size as u64)
            .ok_or(LoadError::ExceedsDram(target, u64::MAX))?;
        if seg_end > dram_end {
            return Err(LoadError::ExceedsDram(target, seg_end));
        }

        let dram_offset = target - base;
        if file_size > 0 {
            dram.write_bytes(dram_offset, &buffer[file_offset..file_offset + file_size])?;
        }
        if mem_size > file_size {
            dram.zero_range(dram_offset as usize + file_size, mem_size - file_size)?;
        }
        log::debug!(
            "loaded segment: addr={:#x} filesz={:#x} memsz={:#x}",
            target,
            file_size,
            mem_size
        );
    }

    Ok(elf.entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_image_lands_at_dram_base() {
        let mut dram = Dram::new(DRAM_BASE, 4096);
        let entry = load_image(&[0x13, 0x00, 0x00, 0x00], &mut dram).unwrap();
        assert_eq!(entry, DRAM_BASE);
        assert_eq!(dram.load(0, 32).unwrap(), 0x13);
    }

    #[test]
    fn oversized_raw_image_is_rejected() {
        let mut dram = Dram::new(DRAM_BASE, 16);
        assert!(load_image(&[0u8; 32], &mut dram).is_err());
    }

    #[test]
    fn truncated_elf_is_rejected() {
        let mut dram = Dram::new(DRAM_BASE, 4096);
        assert!(load_image(b"\x7fELF\x02\x01\x01\x00", &mut dram).is_err());
    }
}
