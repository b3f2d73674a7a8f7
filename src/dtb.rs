//! Flattened device tree generation.
//!
//! Builds the minimal FDT the boot ROM hands to the kernel in `a1`: memory,
//! one rv64 hart with its interrupt controller, and the soc nodes for the
//! UART, PLIC, CLINT and VirtIO-MMIO apertures.

use crate::devices::clint::{CLINT_BASE, CLINT_SIZE};
use crate::devices::plic::{PLIC_BASE, PLIC_SIZE, UART0_IRQ, VIRTIO_IRQ};
use crate::devices::uart::{UART_BASE, UART_SIZE};
use crate::devices::virtio::{VIRTIO_BASE, VIRTIO_SIZE};
use crate::dram::DRAM_BASE;

const FDT_MAGIC: u32 = 0xd00d_feed;
const FDT_VERSION: u32 = 17;
const FDT_LAST_COMP_VERSION: u32 = 16;

const FDT_BEGIN_NODE: u32 = 0x1;
const FDT_END_NODE: u32 = 0x2;
const FDT_PROP: u32 = 0x3;
const FDT_END: u32 = 0x9;

const CPU_INTC_PHANDLE: u32 = 1;
const PLIC_PHANDLE: u32 = 2;

// RISC-V local interrupt numbers used in interrupts-extended.
const IRQ_S_SOFT: u32 = 1;
const IRQ_M_SOFT: u32 = 3;
const IRQ_S_TIMER: u32 = 5;
const IRQ_M_TIMER: u32 = 7;
const IRQ_S_EXT: u32 = 9;
const IRQ_M_EXT: u32 = 11;

/// Generate the DTB for the machine with the given DRAM size.
pub fn generate(dram_size: u64) -> Vec<u8> {
    let mut fdt = DtbBuilder::new();

    fdt.begin_node("");
    fdt.prop_u32("#address-cells", 2);
    fdt.prop_u32("#size-cells", 2);
    fdt.prop_string("compatible", "riscv-virtio");
    fdt.prop_string("model", "riscv-virtio,rv64emu");

    fdt.begin_node("chosen");
    fdt.prop_string("bootargs", "console=ttyS0");
    fdt.prop_string("stdout-path", "/soc/uart@10000000");
    fdt.end_node();

    fdt.begin_node(&format!("memory@{:x}", DRAM_BASE));
    fdt.prop_string("device_type", "memory");
    fdt.prop_reg64("reg", DRAM_BASE, dram_size);
    fdt.end_node();

    fdt.begin_node("cpus");
    fdt.prop_u32("#address-cells", 1);
    fdt.prop_u32("#size-cells", 0);
    fdt.prop_u32("timebase-frequency", 10_000_000);
    fdt.begin_node("cpu@0");
    fdt.prop_string("device_type", "cpu");
    fdt.prop_u32("reg", 0);
    fdt.prop_string("status", "okay");
    fdt.prop_string("compatible", "riscv");
    fdt.prop_string("riscv,isa", "rv64imacsu");
    fdt.prop_string("mmu-type", "riscv,sv39");
    fdt.begin_node("interrupt-controller");
    fdt.prop_u32("#interrupt-cells", 1);
    fdt.prop_empty("interrupt-controller");
    fdt.prop_string("compatible", "riscv,cpu-intc");
    fdt.prop_u32("phandle", CPU_INTC_PHANDLE);
    fdt.end_node();
    fdt.end_node();
    fdt.end_node();

    fdt.begin_node("soc");
    fdt.prop_u32("#address-cells", 2);
    fdt.prop_u32("#size-cells", 2);
    fdt.prop_string("compatible", "simple-bus");
    fdt.prop_empty("ranges");

    fdt.begin_node(&format!("uart@{:x}", UART_BASE));
    fdt.prop_string("compatible", "ns16550a");
    fdt.prop_reg64("reg", UART_BASE, UART_SIZE);
    fdt.prop_u32("clock-frequency", 3_686_400);
    fdt.prop_u32("interrupt-parent", PLIC_PHANDLE);
    fdt.prop_u32("interrupts", UART0_IRQ);
    fdt.end_node();

    fdt.begin_node(&format!("plic@{:x}", PLIC_BASE));
    fdt.prop_string("compatible", "riscv,plic0");
    fdt.prop_reg64("reg", PLIC_BASE, PLIC_SIZE);
    fdt.prop_u32("#interrupt-cells", 1);
    fdt.prop_empty("interrupt-controller");
    fdt.prop_u32_list(
        "interrupts-extended",
        &[CPU_INTC_PHANDLE, IRQ_M_EXT, CPU_INTC_PHANDLE, IRQ_S_EXT],
    );
    fdt.prop_u32("riscv,ndev", 31);
    fdt.prop_u32("phandle", PLIC_PHANDLE);
    fdt.end_node();

    fdt.begin_node(&format!("clint@{:x}", CLINT_BASE));
    fdt.prop_string("compatible", "riscv,clint0");
    fdt.prop_reg64("reg", CLINT_BASE, CLINT_SIZE);
    fdt.prop_u32_list(
        "interrupts-extended",
        &[
            CPU_INTC_PHANDLE,
            IRQ_M_SOFT,
            CPU_INTC_PHANDLE,
            IRQ_M_TIMER,
            CPU_INTC_PHANDLE,
            IRQ_S_SOFT,
            CPU_INTC_PHANDLE,
            IRQ_S_TIMER,
        ],
    );
    fdt.end_node();

    fdt.begin_node(&format!("virtio_mmio@{:x}", VIRTIO_BASE));
    fdt.prop_string("compatible", "virtio,mmio");
    fdt.prop_reg64("reg", VIRTIO_BASE, VIRTIO_SIZE);
    fdt.prop_u32("interrupt-parent", PLIC_PHANDLE);
    fdt.prop_u32("interrupts", VIRTIO_IRQ);
    fdt.end_node();

    fdt.end_node(); // /soc
    fdt.end_node(); // /

    fdt.finish()
}

struct DtbBuilder {
    structure: Vec<u8>,
    strings: Vec<u8>,
}

impl DtbBuilder {
    fn new() -> Self {
        Self {
            structure: Vec::new(),
            strings: Vec::new(),
        }
    }

    fn push_u32(&mut self, value: u32) {
        self.structure.extend_from_slice(&value.to_be_bytes());
    }

    fn pad(&mut self) {
        while self.structure.len() % 4 != 0 {
            self.structure.push(0);
        }
    }

    fn string_offset(&mut self, name: &str) -> u32 {
        let bytes = name.as_bytes();
        // Reuse an existing entry when the name already appears.
        let mut start = 0;
        for chunk in self.strings.split(|&b| b == 0) {
            if chunk == bytes && !chunk.is_empty() {
                return start as u32;
            }
            start += chunk.len() + 1;
        }
        let offset = self.strings.len() as u32;
        self.strings.extend_from_slice(bytes);
        self.strings.push(0);
        offset
    }

    fn begin_node(&mut self, name: &str) {
        self.push_u32(FDT_BEGIN_NODE);
        self.structure.extend_from_slice(name.as_bytes());
        self.structure.push(0);
        self.pad();
    }

    fn end_node(&mut self) {
        self.push_u32(FDT_END_NODE);
    }

    fn prop(&mut self, name: &str, value: &[u8]) {
        let nameoff = self.string_offset(name);
        self.push_u32(FDT_PROP);
        self.push_u32(value.len() as u32);
        self.push_u32(nameoff);
        self.structure.extend_from_slice(value);
        self.pad();
    }

    fn prop_empty(&mut self, name: &str) {
        self.prop(name, &[]);
    }

    fn prop_u32(&mut self, name: &str, value: u32) {
        self.prop(name, &value.to_be_bytes());
    }

    fn prop_u32_list(&mut self, name: &str, values: &[u32]) {
        let mut bytes = Vec::with_capacity(values.len() * 4);
        for v in values {
            bytes.extend_from_slice(&v.to_be_bytes());
        }
        self.prop(name, &bytes);
    }

    fn prop_string(&mut self, name: &str, value: &str) {
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        self.prop(name, &bytes);
    }

    fn prop_reg64(&mut self, name: &str, base: u64, size: u64) {
        let mut bytes = Vec::with_capacity(16);
        bytes.extend_from_slice(&base.to_be_bytes());
        bytes.extend_from_slice(&size.to_be_bytes());
        self.prop(name, &bytes);
    }

    fn finish(mut self) -> Vec<u8> {
        self.push_u32(FDT_END);

        const HEADER_SIZE: u32 = 40;
        const RSVMAP_SIZE: u32 = 16;
        let off_mem_rsvmap = HEADER_SIZE;
        let off_dt_struct = off_mem_rsvmap + RSVMAP_SIZE;
        let off_dt_strings = off_dt_struct + self.structure.len() as u32;
        let totalsize = off_dt_strings + self.strings.len() as u32;

        let header: [u32; 10] = [
            FDT_MAGIC,
            totalsize,
            off_dt_struct,
            off_dt_strings,
            off_mem_rsvmap,
            FDT_VERSION,
            FDT_LAST_COMP_VERSION,
            0, // boot_cpuid_phys
            self.strings.len() as u32,
            self.structure.len() as u32,
        ];

        let mut blob = Vec::with_capacity(totalsize as usize);
        for word in header {
            blob.extend_from_slice(&word.to_be_bytes());
        }
        // Empty memory reservation block (terminator entry).
        blob.extend_from_slice(&[0u8; RSVMAP_SIZE as usize]);
        blob.extend_from_slice(&self.structure);
        blob.extend_from_slice(&self.strings);
        blob
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_well_formed() {
        let blob = generate(128 * 1024 * 1024);
        assert_eq!(
            u32::from_be_bytes(blob[0..4].try_into().unwrap()),
            FDT_MAGIC
        );
        let totalsize = u32::from_be_bytes(blob[4..8].try_into().unwrap());
        assert_eq!(totalsize as usize, blob.len());
        let version = u32::from_be_bytes(blob[20..24].try_into().unwrap());
        assert_eq!(version, FDT_VERSION);
    }

    #[test]
    fn describes_the_devices() {
        let blob = generate(64 * 1024 * 1024);
        let hay = String::from_utf8_lossy(&blob);
        for needle in [
            "memory@80000000",
            "uart@10000000",
            "plic@c000000",
            "clint@2000000",
            "virtio_mmio@10001000",
            "rv64imacsu",
            "riscv,sv39",
        ] {
            assert!(hay.contains(needle), "missing {needle}");
        }
    }

    #[test]
    fn string_table_deduplicates_names() {
        let blob = generate(64 * 1024 * 1024);
        let off_strings =
            u32::from_be_bytes(blob[12..16].try_into().unwrap()) as usize;
        let strings = &blob[off_strings..];
        let count = strings
            .split(|&b| b == 0)
            .filter(|chunk| chunk == b"compatible")
            .count();
        assert_eq!(count, 1);
    }
}
