//! VirtIO block device over the legacy MMIO transport.
//!
//! Queue memory lives in guest DRAM (descriptor table, avail ring, used
//! ring, laid out from the guest-programmed page frame number). The device
//! drains new avail entries on each bus tick: a three-descriptor chain
//! (request header, data buffer, status byte) per request, DMA between the
//! backing image and DRAM, used-ring update, then an interrupt.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};

use crate::dram::{Dram, MemoryError, DRAM_BASE};

pub const VIRTIO_BASE: u64 = 0x1000_1000;
pub const VIRTIO_SIZE: u64 = 0x1000;

// MMIO register offsets (legacy transport).
const MAGIC_VALUE: u64 = 0x000;
const VERSION: u64 = 0x004;
const DEVICE_ID: u64 = 0x008;
const VENDOR_ID: u64 = 0x00c;
const DEVICE_FEATURES: u64 = 0x010;
const DEVICE_FEATURES_SEL: u64 = 0x014;
const DRIVER_FEATURES: u64 = 0x020;
const DRIVER_FEATURES_SEL: u64 = 0x024;
const GUEST_PAGE_SIZE: u64 = 0x028;
const QUEUE_SEL: u64 = 0x030;
const QUEUE_NUM_MAX: u64 = 0x034;
const QUEUE_NUM: u64 = 0x038;
const QUEUE_ALIGN: u64 = 0x03c;
const QUEUE_PFN: u64 = 0x040;
const QUEUE_NOTIFY: u64 = 0x050;
const INTERRUPT_STATUS: u64 = 0x060;
const INTERRUPT_ACK: u64 = 0x064;
const STATUS: u64 = 0x070;
const CONFIG: u64 = 0x100;

const MAGIC: u32 = 0x7472_6976; // "virt"
const BLK_DEVICE_ID: u32 = 2;
const VENDOR: u32 = 0x554d_4551; // "QEMU"
const MAX_QUEUE_SIZE: u32 = 8;

const SECTOR_SIZE: u64 = 512;
const DESC_SIZE: u64 = 16;
const VRING_DESC_F_NEXT: u64 = 1;

// Request types from the header.
const BLK_T_IN: u32 = 0;
const BLK_T_OUT: u32 = 1;

pub struct VirtioBlock {
    device_features_sel: u32,
    driver_features: u32,
    driver_features_sel: u32,
    page_size: u32,
    queue_sel: u32,
    queue_num: u32,
    queue_align: u32,
    queue_pfn: u32,
    interrupt_status: u32,
    status: u32,
    last_avail_idx: u16,
    disk: Vec<u8>,
    backing: Option<File>,
}

impl VirtioBlock {
    pub fn new(disk: Vec<u8>, backing: Option<File>) -> Self {
        Self {
            device_features_sel: 0,
            driver_features: 0,
            driver_features_sel: 0,
            page_size: 4096,
            queue_sel: 0,
            queue_num: 0,
            queue_align: 4096,
            queue_pfn: 0,
            interrupt_status: 0,
            status: 0,
            last_avail_idx: 0,
            disk,
            backing,
        }
    }

    pub fn is_interrupting(&self) -> bool {
        self.interrupt_status != 0
    }

    pub fn load(&self, offset: u64, size: u8) -> u64 {
        if size != 32 {
            return 0;
        }
        let value = match offset {
            MAGIC_VALUE => MAGIC,
            VERSION => 1,
            DEVICE_ID => BLK_DEVICE_ID,
            VENDOR_ID => VENDOR,
            DEVICE_FEATURES => 0,
            DEVICE_FEATURES_SEL => self.device_features_sel,
            DRIVER_FEATURES => self.driver_features,
            DRIVER_FEATURES_SEL => self.driver_features_sel,
            GUEST_PAGE_SIZE => self.page_size,
            QUEUE_SEL => self.queue_sel,
            QUEUE_NUM_MAX => MAX_QUEUE_SIZE,
            QUEUE_NUM => self.queue_num,
            QUEUE_ALIGN => self.queue_align,
            QUEUE_PFN => self.queue_pfn,
            QUEUE_NOTIFY => 0,
            INTERRUPT_STATUS => self.interrupt_status,
            STATUS => self.status,
            // Config space: capacity in 512-byte sectors.
            CONFIG => (self.disk.len() as u64 / SECTOR_SIZE) as u32,
            o if o == CONFIG + 4 => ((self.disk.len() as u64 / SECTOR_SIZE) >> 32) as u32,
            _ => 0,
        };
        value as u64
    }

    pub fn store(&mut self, offset: u64, size: u8, value: u64, dram: &mut Dram) {
        if size != 32 {
            return;
        }
        let value = value as u32;
        match offset {
            DEVICE_FEATURES_SEL => self.device_features_sel = value,
            DRIVER_FEATURES => self.driver_features = value,
            DRIVER_FEATURES_SEL => self.driver_features_sel = value,
            GUEST_PAGE_SIZE => {
                if value.is_power_of_two() {
                    self.page_size = value;
                }
            }
            QUEUE_SEL => self.queue_sel = value,
            QUEUE_NUM => self.queue_num = value.min(MAX_QUEUE_SIZE),
            QUEUE_ALIGN => {
                if value.is_power_of_two() {
                    self.queue_align = value;
                }
            }
            QUEUE_PFN => {
                self.queue_pfn = value;
                self.last_avail_idx = 0;
            }
            QUEUE_NOTIFY => {
                if let Err(e) = self.process_queue(dram) {
                    log::warn!("virtio: queue processing failed: {e}");
                }
            }
            INTERRUPT_ACK => self.interrupt_status &= !value,
            STATUS => {
                if value == 0 {
                    // Device reset.
                    self.status = 0;
                    self.queue_pfn = 0;
                    self.interrupt_status = 0;
                    self.last_avail_idx = 0;
                } else {
                    self.status = value;
                }
            }
            _ => {}
        }
    }

    /// Per-step tick: drain any avail entries the driver published without a
    /// notify (or that arrived while one was being served).
    pub fn tick(&mut self, dram: &mut Dram) {
        if self.queue_pfn != 0 {
            if let Err(e) = self.process_queue(dram) {
                log::warn!("virtio: queue processing failed: {e}");
            }
        }
    }

    fn dram_offset(addr: u64) -> Result<u64, MemoryError> {
        if addr < DRAM_BASE {
            return Err(MemoryError::OutOfBounds(addr));
        }
        Ok(addr - DRAM_BASE)
    }

    fn queue_size(&self) -> u64 {
        if self.queue_num > 0 {
            self.queue_num as u64
        } else {
            MAX_QUEUE_SIZE as u64
        }
    }

    /// Legacy layout: descriptors at pfn * page_size, avail ring right after,
    /// used ring on the next queue-align boundary.
    fn ring_addresses(&self) -> (u64, u64, u64) {
        let desc = self.queue_pfn as u64 * self.page_size as u64;
        let avail = desc + DESC_SIZE * self.queue_size();
        let avail_size = 6 + 2 * self.queue_size();
        let align = self.queue_align as u64;
        let used = (avail + avail_size + align - 1) & !(align - 1);
        (desc, avail, used)
    }

    fn read_desc(dram: &Dram, desc_base: u64, idx: u64) -> Result<(u64, u32, u64, u16), MemoryError> {
        let off = Self::dram_offset(desc_base + idx * DESC_SIZE)?;
        let addr = dram.load(off, 64)?;
        let len = dram.load(off + 8, 32)? as u32;
        let flags = dram.load(off + 12, 16)?;
        let next = dram.load(off + 14, 16)? as u16;
        Ok((addr, len, flags, next))
    }

    fn process_queue(&mut self, dram: &mut Dram) -> Result<(), MemoryError> {
        if self.queue_pfn == 0 {
            return Ok(());
        }
        let (desc_base, avail_base, used_base) = self.ring_addresses();
        let qsz = self.queue_size();

        let avail_idx = dram.load(Self::dram_offset(avail_base + 2)?, 16)? as u16;
        let mut processed = false;

        while self.last_avail_idx != avail_idx {
            let slot = (self.last_avail_idx as u64) % qsz;
            let head =
                dram.load(Self::dram_offset(avail_base + 4 + slot * 2)?, 16)? as u16;

            let written = self.service_request(dram, desc_base, head)?;

            // Push the used-ring element and publish it.
            let used_idx_off = Self::dram_offset(used_base + 2)?;
            let used_idx = dram.load(used_idx_off, 16)? as u16;
            let elem_off =
                Self::dram_offset(used_base + 4 + (used_idx as u64 % qsz) * 8)?;
            dram.store(elem_off, 32, head as u64)?;
            dram.store(elem_off + 4, 32, written as u64)?;
            dram.store(used_idx_off, 16, used_idx.wrapping_add(1) as u64)?;

            self.last_avail_idx = self.last_avail_idx.wrapping_add(1);
            processed = true;
        }

        if processed {
            self.interrupt_status |= 1;
        }
        Ok(())
    }

    /// Walk one descriptor chain: header, data, status. Returns the number
    /// of bytes the device wrote into guest memory.
    fn service_request(
        &mut self,
        dram: &mut Dram,
        desc_base: u64,
        head: u16,
    ) -> Result<u32, MemoryError> {
        let (hdr_addr, hdr_len, hdr_flags, mut next) =
            Self::read_desc(dram, desc_base, head as u64)?;
        if hdr_len < 16 || hdr_flags & VRING_DESC_F_NEXT == 0 {
            // Malformed chain; consume it so the ring keeps moving.
            return Ok(0);
        }

        let hdr_off = Self::dram_offset(hdr_addr)?;
        let req_type = dram.load(hdr_off, 32)? as u32;
        let sector = dram.load(hdr_off + 8, 64)?;

        let (data_addr, data_len, data_flags, data_next) =
            Self::read_desc(dram, desc_base, next as u64)?;
        next = data_next;

        let mut written = 0u32;
        let disk_off = sector * SECTOR_SIZE;
        let in_range = disk_off + data_len as u64 <= self.disk.len() as u64;

        match req_type {
            BLK_T_IN if in_range => {
                let src = disk_off as usize;
                let bytes = self.disk[src..src + data_len as usize].to_vec();
                dram.write_bytes(Self::dram_offset(data_addr)?, &bytes)?;
                written = data_len;
            }
            BLK_T_OUT if in_range => {
                let src = dram.read_bytes(Self::dram_offset(data_addr)?, data_len as usize)?;
                let dst = disk_off as usize;
                self.disk[dst..dst + data_len as usize].copy_from_slice(src);
                self.flush_to_backing(disk_off, data_len as usize);
            }
            _ => {
                log::warn!(
                    "virtio: rejected request type={} sector={} len={}",
                    req_type,
                    sector,
                    data_len
                );
            }
        }

        // Status descriptor closes the chain.
        if data_flags & VRING_DESC_F_NEXT != 0 {
            let (status_addr, _, _, _) = Self::read_desc(dram, desc_base, next as u64)?;
            dram.store(Self::dram_offset(status_addr)?, 8, 0)?; // OK
            written += 1;
        }
        Ok(written)
    }

    /// Propagate a completed write into the backing file, in place.
    fn flush_to_backing(&mut self, offset: u64, len: usize) {
        if let Some(file) = self.backing.as_mut() {
            let end = offset as usize + len;
            let result = file
                .seek(SeekFrom::Start(offset))
                .and_then(|_| file.write_all(&self.disk[offset as usize..end]));
            if let Err(e) = result {
                log::warn!("virtio: backing file update failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUEUE_PAGE: u64 = DRAM_BASE + 0x4000;
    const HDR_ADDR: u64 = DRAM_BASE + 0x6000;
    const DATA_ADDR: u64 = DRAM_BASE + 0x6100;
    const STATUS_ADDR: u64 = DRAM_BASE + 0x6400;

    fn make_device(sectors: usize) -> (VirtioBlock, Dram) {
        let mut disk = vec![0u8; sectors * SECTOR_SIZE as usize];
        for (i, b) in disk.iter_mut().enumerate() {
            *b = i as u8;
        }
        (
            VirtioBlock::new(disk, None),
            Dram::new(DRAM_BASE, 1024 * 1024),
        )
    }

    fn write_desc(dram: &mut Dram, desc_base: u64, idx: u64, addr: u64, len: u32, flags: u16, next: u16) {
        let off = desc_base - DRAM_BASE + idx * DESC_SIZE;
        dram.store(off, 64, addr).unwrap();
        dram.store(off + 8, 32, len as u64).unwrap();
        dram.store(off + 12, 16, flags as u64).unwrap();
        dram.store(off + 14, 16, next as u64).unwrap();
    }

    /// Configure the queue registers and publish one 3-descriptor request.
    fn push_request(dev: &mut VirtioBlock, dram: &mut Dram, req_type: u32, sector: u64, len: u32) {
        dev.store(QUEUE_SEL, 32, 0, dram);
        dev.store(QUEUE_NUM, 32, 8, dram);
        dev.store(GUEST_PAGE_SIZE, 32, 4096, dram);
        dev.store(QUEUE_ALIGN, 32, 4096, dram);
        dev.store(QUEUE_PFN, 32, QUEUE_PAGE / 4096, dram);

        let (desc, avail, _) = dev.ring_addresses();

        // Request header in guest memory.
        let hdr = HDR_ADDR - DRAM_BASE;
        dram.store(hdr, 32, req_type as u64).unwrap();
        dram.store(hdr + 8, 64, sector).unwrap();

        write_desc(dram, desc, 0, HDR_ADDR, 16, VRING_DESC_F_NEXT as u16, 1);
        write_desc(dram, desc, 1, DATA_ADDR, len, VRING_DESC_F_NEXT as u16, 2);
        write_desc(dram, desc, 2, STATUS_ADDR, 1, 0, 0);

        // avail.ring[0] = 0; avail.idx = 1
        dram.store(avail - DRAM_BASE + 4, 16, 0).unwrap();
        dram.store(avail - DRAM_BASE + 2, 16, 1).unwrap();
    }

    #[test]
    fn identity_registers() {
        let (dev, _) = make_device(4);
        assert_eq!(dev.load(MAGIC_VALUE, 32), MAGIC as u64);
        assert_eq!(dev.load(VERSION, 32), 1);
        assert_eq!(dev.load(DEVICE_ID, 32), 2);
        assert_eq!(dev.load(QUEUE_NUM_MAX, 32), MAX_QUEUE_SIZE as u64);
        assert_eq!(dev.load(CONFIG, 32), 4);
    }

    #[test]
    fn read_request_moves_disk_to_dram() {
        let (mut dev, mut dram) = make_device(8);
        push_request(&mut dev, &mut dram, BLK_T_IN, 1, 512);
        dev.store(QUEUE_NOTIFY, 32, 0, &mut dram);

        // Sector 1 starts at byte 512 of the patterned image.
        for i in [1u64, 5, 511] {
            let got = dram.load(DATA_ADDR - DRAM_BASE + i, 8).unwrap();
            assert_eq!(got, (512 + i) & 0xff);
        }
        // Status byte written, used ring advanced, interrupt raised.
        assert_eq!(dram.load(STATUS_ADDR - DRAM_BASE, 8).unwrap(), 0);
        let (_, _, used) = dev.ring_addresses();
        assert_eq!(dram.load(used - DRAM_BASE + 2, 16).unwrap(), 1);
        assert!(dev.is_interrupting());

        dev.store(INTERRUPT_ACK, 32, 1, &mut dram);
        assert!(!dev.is_interrupting());
    }

    #[test]
    fn write_request_moves_dram_to_disk() {
        let (mut dev, mut dram) = make_device(8);
        for i in 0..512u64 {
            dram.store(DATA_ADDR - DRAM_BASE + i, 8, 0xa5).unwrap();
        }
        push_request(&mut dev, &mut dram, BLK_T_OUT, 2, 512);
        // Tick-driven drain, without an explicit notify.
        dev.tick(&mut dram);

        assert!(dev.disk[2 * 512..3 * 512].iter().all(|&b| b == 0xa5));
        assert!(dev.is_interrupting());
    }

    #[test]
    fn out_of_range_sector_is_rejected() {
        let (mut dev, mut dram) = make_device(2);
        push_request(&mut dev, &mut dram, BLK_T_IN, 100, 512);
        dev.store(QUEUE_NOTIFY, 32, 0, &mut dram);
        // Chain is consumed (used.idx advanced) but no data moved.
        let (_, _, used) = dev.ring_addresses();
        assert_eq!(dram.load(used - DRAM_BASE + 2, 16).unwrap(), 1);
        assert_eq!(dram.load(DATA_ADDR - DRAM_BASE, 8).unwrap(), 0);
    }

    #[test]
    fn device_reset_clears_queue_state() {
        let (mut dev, mut dram) = make_device(4);
        push_request(&mut dev, &mut dram, BLK_T_IN, 0, 512);
        dev.store(QUEUE_NOTIFY, 32, 0, &mut dram);
        dev.store(STATUS, 32, 0, &mut dram);
        assert_eq!(dev.load(QUEUE_PFN, 32), 0);
        assert_eq!(dev.load(STATUS, 32), 0);
        assert!(!dev.is_interrupting());
    }
}
