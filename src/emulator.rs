//! The driver loop binding the hart to the system bus.

use std::fs::File;

use crate::bus::SystemBus;
use crate::cpu::csr::{
    Mode, CSR_MCAUSE, CSR_MEPC, CSR_MSTATUS, CSR_MTVEC, CSR_SCAUSE, CSR_SEPC, CSR_SSTATUS,
    CSR_STVEC,
};
use crate::cpu::trap::Trap;
use crate::cpu::Cpu;
use crate::devices::rom::{BootRom, ROM_BASE};
use crate::devices::virtio::VirtioBlock;
use crate::dram::DRAM_BASE;
use crate::dtb;
use crate::loader::{self, LoadError};

const ABI_NAMES: [&str; 32] = [
    "z", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2", "a3", "a4", "a5",
    "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4", "t5",
    "t6",
];

pub struct Emulator {
    pub cpu: Cpu,
    pub bus: SystemBus,
    dram_size: usize,
    riscv_test: bool,
}

impl Emulator {
    /// Build the machine in its reset state: pc at the boot ROM, stack
    /// pointer at the top of DRAM, machine mode.
    pub fn new(dram_size: usize, disk: Option<(Vec<u8>, Option<File>)>) -> Self {
        let rom = BootRom::new(DRAM_BASE, dtb::generate(dram_size as u64));
        let virtio = disk.map(|(image, backing)| VirtioBlock::new(image, backing));
        let bus = SystemBus::new(dram_size, rom, virtio);

        let mut cpu = Cpu::new(ROM_BASE);
        cpu.xreg[2] = DRAM_BASE + dram_size as u64;

        Self {
            cpu,
            bus,
            dram_size,
            riscv_test: false,
        }
    }

    /// Enable the riscv-tests termination convention.
    pub fn enable_riscv_test(&mut self) {
        self.riscv_test = true;
        self.bus.watch_tohost();
    }

    /// Load a guest image (ELF or raw) into DRAM and point the boot ROM's
    /// jump target at its entry.
    pub fn load_image(&mut self, bytes: &[u8]) -> Result<(), LoadError> {
        let entry = loader::load_image(bytes, &mut self.bus.dram)?;
        self.bus.rom = BootRom::new(entry, dtb::generate(self.dram_size as u64));
        log::info!("guest entry point {entry:#x}");
        Ok(())
    }

    /// Run until the guest terminates. Returns the process exit code.
    pub fn run(&mut self) -> i32 {
        loop {
            if let Some(value) = self.bus.take_finished() {
                // riscv-tests report (test_num << 1) | 1; a bare 1 is a pass.
                let code = if value == 1 { 0 } else { (value >> 1) as i32 };
                log::info!("tohost reported {value:#x}, exiting with {code}");
                return code;
            }

            match self.cpu.step(&mut self.bus) {
                Ok(()) | Err(Trap::Requested(_)) | Err(Trap::Invisible(_)) => {}
                Err(Trap::Fatal(exc)) => {
                    eprintln!("fatal trap: {exc:?}");
                    self.dump_state();
                    return 1;
                }
            }

            // A zero pc outside user mode means a trap went through an
            // unprogrammed vector; there is nothing sensible to execute.
            if self.cpu.pc == 0 && self.cpu.mode != Mode::User {
                eprintln!("pc reached 0 in {:?} mode, stopping", self.cpu.mode);
                self.dump_state();
                return 1;
            }
        }
    }

    /// Dump registers and the primary trap CSRs to stderr.
    pub fn dump_state(&self) {
        eprintln!("pc = {:#018x} mode = {:?}", self.cpu.pc, self.cpu.mode);
        for (i, value) in self.cpu.xreg.iter().enumerate() {
            eprint!("x{:<2}({:<3}) = {:#018x} ", i, ABI_NAMES[i], value);
            if i % 4 == 3 {
                eprintln!();
            }
        }
        for (i, value) in self.cpu.freg.iter().enumerate() {
            eprint!("f{:<2}      = {:#018x} ", i, value);
            if i % 4 == 3 {
                eprintln!();
            }
        }
        let csr = &self.cpu.csr;
        eprintln!(
            "mstatus = {:#018x} mtvec = {:#018x} mepc = {:#018x} mcause = {:#018x}",
            csr.read_raw(CSR_MSTATUS),
            csr.read_raw(CSR_MTVEC),
            csr.read_raw(CSR_MEPC),
            csr.read_raw(CSR_MCAUSE),
        );
        eprintln!(
            "sstatus = {:#018x} stvec = {:#018x} sepc = {:#018x} scause = {:#018x}",
            csr.read_raw(CSR_SSTATUS),
            csr.read_raw(CSR_STVEC),
            csr.read_raw(CSR_SEPC),
            csr.read_raw(CSR_SCAUSE),
        );
    }
}
