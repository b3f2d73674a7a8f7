//! Physical address router.
//!
//! The bus owns every component reachable by a physical address and
//! dispatches each access to the owner of its range. It also carries the
//! per-step `tick` that advances the devices which keep time and folds
//! their interrupt lines into `mip`.

use crate::cpu::csr::CsrFile;
use crate::cpu::trap::Exception;
use crate::devices::clint::{Clint, CLINT_BASE, CLINT_SIZE};
use crate::devices::plic::{Plic, PLIC_BASE, PLIC_SIZE, UART0_IRQ, VIRTIO_IRQ};
use crate::devices::rom::{BootRom, ROM_BASE, ROM_SIZE};
use crate::devices::uart::{Uart, UART_BASE, UART_SIZE};
use crate::devices::virtio::{VirtioBlock, VIRTIO_BASE, VIRTIO_SIZE};
use crate::dram::{Dram, DRAM_BASE};

/// riscv-tests finisher word, relative to the DRAM base.
pub const TOHOST_OFFSET: u64 = 0x1000;

pub struct SystemBus {
    pub rom: BootRom,
    pub clint: Clint,
    pub plic: Plic,
    pub uart: Uart,
    pub virtio: Option<VirtioBlock>,
    pub dram: Dram,
    /// Physical address watched for the compliance-test exit convention,
    /// when enabled.
    tohost: Option<u64>,
    finished: Option<u64>,
}

impl SystemBus {
    pub fn new(dram_size: usize, rom: BootRom, virtio: Option<VirtioBlock>) -> Self {
        Self {
            rom,
            clint: Clint::new(),
            plic: Plic::new(),
            uart: Uart::new(),
            virtio,
            dram: Dram::new(DRAM_BASE, dram_size),
            tohost: None,
            finished: None,
        }
    }

    /// Enable the riscv-tests termination convention.
    pub fn watch_tohost(&mut self) {
        self.tohost = Some(DRAM_BASE + TOHOST_OFFSET);
    }

    /// Value stored to the tohost word, if the guest has finished.
    pub fn take_finished(&mut self) -> Option<u64> {
        self.finished.take()
    }

    /// Advance the devices that keep time, one hart step.
    pub fn tick(&mut self, csr: &mut CsrFile) {
        self.clint.tick(csr);
        if let Some(virtio) = self.virtio.as_mut() {
            virtio.tick(&mut self.dram);
            self.plic
                .set_level(VIRTIO_IRQ, virtio.is_interrupting());
        }
        // The UART raise is an edge: the PLIC pending bit latches it until
        // the guest claims.
        if self.uart.take_interrupt() {
            self.plic.raise(UART0_IRQ);
        }
        self.plic.tick(csr);
    }

    /// Load `size` bits from a physical address.
    pub fn load(&mut self, addr: u64, size: u8) -> Result<u64, Exception> {
        if let Some(off) = self.dram.offset(addr) {
            return self
                .dram
                .load(off, size)
                .map_err(|_| Exception::LoadAccessFault(addr));
        }
        match addr {
            _ if in_range(addr, ROM_BASE, ROM_SIZE) => self
                .rom
                .load(addr - ROM_BASE, size)
                .map_err(|_| Exception::LoadAccessFault(addr)),
            _ if in_range(addr, CLINT_BASE, CLINT_SIZE) => {
                Ok(self.clint.load(addr - CLINT_BASE, size))
            }
            _ if in_range(addr, PLIC_BASE, PLIC_SIZE) => {
                Ok(self.plic.load(addr - PLIC_BASE, size))
            }
            _ if in_range(addr, UART_BASE, UART_SIZE) => {
                Ok(self.uart.load(addr - UART_BASE, size))
            }
            _ if in_range(addr, VIRTIO_BASE, VIRTIO_SIZE) => Ok(self
                .virtio
                .as_ref()
                .map(|v| v.load(addr - VIRTIO_BASE, size))
                .unwrap_or(0)),
            _ => Err(Exception::LoadAccessFault(addr)),
        }
    }

    /// Store the low `size` bits of `value` to a physical address.
    pub fn store(&mut self, addr: u64, size: u8, value: u64) -> Result<(), Exception> {
        if self.tohost == Some(addr) {
            self.finished = Some(value);
            return Ok(());
        }
        if let Some(off) = self.dram.offset(addr) {
            return self
                .dram
                .store(off, size, value)
                .map_err(|_| Exception::StoreAmoAccessFault(addr));
        }
        match addr {
            // The boot ROM is read-only.
            _ if in_range(addr, ROM_BASE, ROM_SIZE) => {
                Err(Exception::StoreAmoAccessFault(addr))
            }
            _ if in_range(addr, CLINT_BASE, CLINT_SIZE) => {
                self.clint.store(addr - CLINT_BASE, size, value);
                Ok(())
            }
            _ if in_range(addr, PLIC_BASE, PLIC_SIZE) => {
                self.plic.store(addr - PLIC_BASE, size, value);
                Ok(())
            }
            _ if in_range(addr, UART_BASE, UART_SIZE) => {
                self.uart.store(addr - UART_BASE, size, value);
                Ok(())
            }
            _ if in_range(addr, VIRTIO_BASE, VIRTIO_SIZE) => {
                if let Some(virtio) = self.virtio.as_mut() {
                    virtio.store(addr - VIRTIO_BASE, size, value, &mut self.dram);
                }
                Ok(())
            }
            _ => Err(Exception::StoreAmoAccessFault(addr)),
        }
    }
}

#[inline]
fn in_range(addr: u64, base: u64, size: u64) -> bool {
    addr >= base && addr < base + size
}
