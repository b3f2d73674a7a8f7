//! Platform-level interrupt controller.
//!
//! 32 sources and two contexts for the single hart: context 0 is machine
//! mode, context 1 is supervisor mode. There is no priority stack; completes
//! are acknowledged and dropped.

use crate::cpu::csr::{CsrFile, CSR_MIP, MIP_MEIP, MIP_SEIP};

pub const PLIC_BASE: u64 = 0x0c00_0000;
pub const PLIC_SIZE: u64 = 0x40_0000;

pub const UART0_IRQ: u32 = 10;
pub const VIRTIO_IRQ: u32 = 1;

const NUM_SOURCES: usize = 32;
const NUM_CONTEXTS: usize = 2;

const PRIORITY_END: u64 = 0x1000;
const PENDING_OFFSET: u64 = 0x1000;
const ENABLE_OFFSET: u64 = 0x2000;
const ENABLE_STRIDE: u64 = 0x80;
const CONTEXT_OFFSET: u64 = 0x20_0000;
const CONTEXT_STRIDE: u64 = 0x1000;

pub const M_CONTEXT: usize = 0;
pub const S_CONTEXT: usize = 1;

pub struct Plic {
    priority: [u32; NUM_SOURCES],
    pending: u32,
    enable: [u32; NUM_CONTEXTS],
    threshold: [u32; NUM_CONTEXTS],
}

impl Plic {
    pub fn new() -> Self {
        Self {
            priority: [0; NUM_SOURCES],
            pending: 0,
            enable: [0; NUM_CONTEXTS],
            threshold: [0; NUM_CONTEXTS],
        }
    }

    /// Raise an interrupt source (OR into the pending word).
    pub fn raise(&mut self, source: u32) {
        if (source as usize) < NUM_SOURCES {
            self.pending |= 1 << source;
        }
    }

    /// Mirror a level-triggered device line into the pending word: raise
    /// while the device holds its line high, clear once it drops.
    pub fn set_level(&mut self, source: u32, level: bool) {
        if (source as usize) >= NUM_SOURCES {
            return;
        }
        if level {
            self.pending |= 1 << source;
        } else {
            self.pending &= !(1 << source);
        }
    }

    /// True when some pending source passes the enable/threshold gate for
    /// the context.
    pub fn gate_open(&self, ctx: usize) -> bool {
        self.best_candidate(ctx) != 0
    }

    /// Reflect the gate state into the external-interrupt bits of mip.
    pub fn tick(&self, csr: &mut CsrFile) {
        if self.gate_open(S_CONTEXT) {
            csr.set_bits(CSR_MIP, MIP_SEIP);
        } else {
            csr.clear_bits(CSR_MIP, MIP_SEIP);
        }
        if self.gate_open(M_CONTEXT) {
            csr.set_bits(CSR_MIP, MIP_MEIP);
        } else {
            csr.clear_bits(CSR_MIP, MIP_MEIP);
        }
    }

    fn best_candidate(&self, ctx: usize) -> u32 {
        let mut best_id = 0u32;
        let mut best_prio = 0u32;
        for source in 1..NUM_SOURCES {
            let pending = (self.pending >> source) & 1 == 1;
            let enabled = (self.enable[ctx] >> source) & 1 == 1;
            let prio = self.priority[source];
            if pending && enabled && prio > self.threshold[ctx] && prio >= best_prio {
                // `>=` keeps the highest source id on priority ties, matching
                // the scan order kernels expect from qemu's PLIC.
                best_prio = prio;
                best_id = source as u32;
            }
        }
        best_id
    }

    /// Claim: return the winning source and clear it from pending.
    fn claim(&mut self, ctx: usize) -> u32 {
        let id = self.best_candidate(ctx);
        if id != 0 {
            self.pending &= !(1 << id);
        }
        id
    }

    pub fn load(&mut self, offset: u64, size: u8) -> u64 {
        if size != 32 {
            return 0;
        }
        if offset < PRIORITY_END {
            let idx = (offset >> 2) as usize;
            if idx < NUM_SOURCES {
                return self.priority[idx] as u64;
            }
        } else if offset == PENDING_OFFSET {
            return self.pending as u64;
        } else if offset >= ENABLE_OFFSET && offset < CONTEXT_OFFSET {
            let ctx = ((offset - ENABLE_OFFSET) / ENABLE_STRIDE) as usize;
            if ctx < NUM_CONTEXTS && (offset - ENABLE_OFFSET) % ENABLE_STRIDE == 0 {
                return self.enable[ctx] as u64;
            }
        } else if offset >= CONTEXT_OFFSET {
            let ctx = ((offset - CONTEXT_OFFSET) / CONTEXT_STRIDE) as usize;
            let reg = (offset - CONTEXT_OFFSET) % CONTEXT_STRIDE;
            if ctx < NUM_CONTEXTS {
                match reg {
                    0 => return self.threshold[ctx] as u64,
                    4 => return self.claim(ctx) as u64,
                    _ => {}
                }
            }
        }
        0
    }

    pub fn store(&mut self, offset: u64, size: u8, value: u64) {
        if size != 32 {
            return;
        }
        let value = value as u32;
        if offset < PRIORITY_END {
            let idx = (offset >> 2) as usize;
            if idx < NUM_SOURCES {
                self.priority[idx] = value;
            }
        } else if offset == PENDING_OFFSET {
            // Pending is read-only to software.
        } else if offset >= ENABLE_OFFSET && offset < CONTEXT_OFFSET {
            let ctx = ((offset - ENABLE_OFFSET) / ENABLE_STRIDE) as usize;
            if ctx < NUM_CONTEXTS && (offset - ENABLE_OFFSET) % ENABLE_STRIDE == 0 {
                self.enable[ctx] = value;
            }
        } else if offset >= CONTEXT_OFFSET {
            let ctx = ((offset - CONTEXT_OFFSET) / CONTEXT_STRIDE) as usize;
            let reg = (offset - CONTEXT_OFFSET) % CONTEXT_STRIDE;
            if ctx < NUM_CONTEXTS {
                match reg {
                    0 => self.threshold[ctx] = value,
                    // Complete: acknowledged, no priority stack to unwind.
                    4 => {}
                    _ => {}
                }
            }
        }
    }
}

impl Default for Plic {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s_enable(plic: &mut Plic, mask: u32) {
        plic.store(ENABLE_OFFSET + ENABLE_STRIDE * S_CONTEXT as u64, 32, mask as u64);
    }

    #[test]
    fn claim_returns_highest_priority_and_clears_pending() {
        let mut plic = Plic::new();
        plic.store(4 * UART0_IRQ as u64, 32, 1);
        plic.store(4 * VIRTIO_IRQ as u64, 32, 7);
        s_enable(&mut plic, (1 << UART0_IRQ) | (1 << VIRTIO_IRQ));
        plic.raise(UART0_IRQ);
        plic.raise(VIRTIO_IRQ);

        let claim_addr = CONTEXT_OFFSET + CONTEXT_STRIDE * S_CONTEXT as u64 + 4;
        assert_eq!(plic.load(claim_addr, 32), VIRTIO_IRQ as u64);
        assert_eq!(plic.load(claim_addr, 32), UART0_IRQ as u64);
        // Nothing left pending.
        assert_eq!(plic.load(claim_addr, 32), 0);
        // Complete is accepted silently.
        plic.store(claim_addr, 32, VIRTIO_IRQ as u64);
    }

    #[test]
    fn threshold_gates_delivery() {
        let mut plic = Plic::new();
        plic.store(4 * UART0_IRQ as u64, 32, 1);
        s_enable(&mut plic, 1 << UART0_IRQ);
        plic.store(CONTEXT_OFFSET + CONTEXT_STRIDE * S_CONTEXT as u64, 32, 1);
        plic.raise(UART0_IRQ);
        assert!(!plic.gate_open(S_CONTEXT));

        plic.store(CONTEXT_OFFSET + CONTEXT_STRIDE * S_CONTEXT as u64, 32, 0);
        assert!(plic.gate_open(S_CONTEXT));
    }

    #[test]
    fn gate_feeds_seip() {
        let mut plic = Plic::new();
        let mut csr = CsrFile::new();
        plic.store(4 * UART0_IRQ as u64, 32, 1);
        s_enable(&mut plic, 1 << UART0_IRQ);
        plic.raise(UART0_IRQ);
        plic.tick(&mut csr);
        assert!(csr.check_bits(CSR_MIP, MIP_SEIP));
        assert!(!csr.check_bits(CSR_MIP, MIP_MEIP));

        let claim_addr = CONTEXT_OFFSET + CONTEXT_STRIDE * S_CONTEXT as u64 + 4;
        assert_eq!(plic.load(claim_addr, 32), UART0_IRQ as u64);
        plic.tick(&mut csr);
        assert!(!csr.check_bits(CSR_MIP, MIP_SEIP));
    }

    #[test]
    fn disabled_sources_never_pass_the_gate() {
        let mut plic = Plic::new();
        plic.store(4 * UART0_IRQ as u64, 32, 5);
        plic.raise(UART0_IRQ);
        assert!(!plic.gate_open(S_CONTEXT));
        assert_eq!(plic.load(PENDING_OFFSET, 32), 1 << UART0_IRQ);
    }
}
