//! The hart: fetch → decode → execute, interrupt polling and trap entry.

pub mod csr;
pub mod decode;
mod execute;
pub mod icache;
pub mod mmu;
pub mod trap;

use crate::bus::SystemBus;

use csr::{
    CsrFile, Mode, CSR_MCAUSE, CSR_MEDELEG, CSR_MEPC, CSR_MIDELEG, CSR_MIE, CSR_MIP, CSR_MSTATUS,
    CSR_MTVAL, CSR_MTVEC, CSR_SCAUSE, CSR_SEDELEG, CSR_SEPC, CSR_SIDELEG, CSR_SIE, CSR_SIP,
    CSR_SSTATUS, CSR_STVAL, CSR_STVEC, MIP_MEIP, MIP_MSIP, MIP_MTIP, MIP_SEIP, MIP_SSIP, MIP_STIP,
    MSTATUS_MIE, MSTATUS_MPIE, MSTATUS_MPP, MSTATUS_SIE, MSTATUS_SPIE, MSTATUS_SPP,
};
use decode::Instr;
use icache::ICache;
use mmu::Access;
use trap::{Exception, Interrupt, Trap};

pub struct Cpu {
    pub pc: u64,
    /// Integer registers; x0 is forced back to zero after every executor.
    pub xreg: [u64; 32],
    /// Floating-point registers, carried as opaque bit patterns.
    pub freg: [u64; 32],
    pub mode: Mode,
    pub csr: CsrFile,
    /// Decoded form of the instruction currently executing.
    pub instr: Instr,
    /// Address held by an outstanding load-reserved, if any.
    reservation: Option<u64>,
    icache: ICache,
}

impl Cpu {
    pub fn new(pc: u64) -> Self {
        Self {
            pc,
            xreg: [0; 32],
            freg: [0; 32],
            mode: Mode::Machine,
            csr: CsrFile::new(),
            instr: Instr::new(0, 4),
            reservation: None,
            icache: ICache::new(),
        }
    }

    /// One hart step: advance the clocks, deliver at most one pending
    /// interrupt, then fetch, decode and execute a single instruction.
    ///
    /// Architectural traps are fully handled (CSRs updated, pc redirected)
    /// before this returns; the `Err` carries the classification the driver
    /// loop acts on.
    pub fn step(&mut self, bus: &mut SystemBus) -> Result<(), Trap> {
        self.csr.tick();
        bus.tick(&mut self.csr);
        self.handle_interrupt()?;

        let instr_pc = self.pc;
        if let Err(exc) = self.fetch(bus).and_then(|_| self.execute(bus)) {
            let trap = self.handle_exception(exc, instr_pc);
            if !matches!(trap, Trap::Invisible(_)) {
                log::debug!("trap {:?} at pc {:#x}", exc, instr_pc);
            }
            return Err(trap);
        }
        Ok(())
    }

    /// Fetch and decode the instruction at pc, consulting the decoded-
    /// instruction cache first, and advance pc past it.
    fn fetch(&mut self, bus: &mut SystemBus) -> Result<(), Exception> {
        let pc = self.pc;
        if pc & 1 != 0 {
            return Err(Exception::InstructionAddressMisaligned(pc));
        }

        if let Some(instr) = self.icache.get(pc) {
            self.instr = instr;
            self.pc = pc.wrapping_add(instr.len as u64);
            return Ok(());
        }

        let paddr = self.translate(bus, pc, Access::Instr)?;
        let word = bus.load(paddr, 32).map_err(|e| match e {
            Exception::LoadAccessFault(_) => Exception::InstructionAccessFault(pc),
            other => other,
        })? as u32;

        let mut instr = if word & 0x3 != 0x3 {
            let half = word & 0xffff;
            // The all-zero halfword is defined illegal; catching it here
            // traps runaway execution through cleared memory early.
            if half == 0 {
                return Err(Exception::IllegalInstruction(0));
            }
            Instr::new(half, 2)
        } else {
            Instr::new(word, 4)
        };
        decode::decode(&mut instr)?;

        self.instr = instr;
        self.pc = pc.wrapping_add(instr.len as u64);
        self.icache.insert(pc, instr);
        Ok(())
    }

    pub(crate) fn translate(
        &mut self,
        bus: &mut SystemBus,
        addr: u64,
        access: Access,
    ) -> Result<u64, Exception> {
        mmu::translate(bus, &self.csr, self.mode, addr, access)
    }

    /// Translated load used by the executors.
    pub(crate) fn read(
        &mut self,
        bus: &mut SystemBus,
        addr: u64,
        size: u8,
    ) -> Result<u64, Exception> {
        let paddr = self.translate(bus, addr, Access::Load)?;
        bus.load(paddr, size)
    }

    /// Translated store used by the executors. Any store to the reserved
    /// address invalidates an outstanding LR reservation.
    pub(crate) fn write(
        &mut self,
        bus: &mut SystemBus,
        addr: u64,
        size: u8,
        value: u64,
    ) -> Result<(), Exception> {
        let paddr = self.translate(bus, addr, Access::Store)?;
        if self.reservation == Some(addr) {
            self.reservation = None;
        }
        bus.store(paddr, size, value)
    }

    /// Poll pending enabled interrupts and deliver at most one, in the
    /// order machine-external, machine-software, machine-timer, then the
    /// supervisor counterparts.
    fn handle_interrupt(&mut self) -> Result<(), Trap> {
        const MACHINE: [(u64, Interrupt); 3] = [
            (MIP_MEIP, Interrupt::MachineExternal),
            (MIP_MSIP, Interrupt::MachineSoftware),
            (MIP_MTIP, Interrupt::MachineTimer),
        ];
        const SUPERVISOR: [(u64, Interrupt); 3] = [
            (MIP_SEIP, Interrupt::SupervisorExternal),
            (MIP_SSIP, Interrupt::SupervisorSoftware),
            (MIP_STIP, Interrupt::SupervisorTimer),
        ];

        let pending = self.csr.read_raw(CSR_MIE) & self.csr.read_raw(CSR_MIP);
        for (bit, irq) in MACHINE {
            if pending & bit != 0 && self.try_take_interrupt(irq)? {
                self.csr.clear_bits(CSR_MIP, bit);
                return Ok(());
            }
        }

        let pending = self.csr.read_raw(CSR_SIE) & self.csr.read_raw(CSR_SIP);
        for (bit, irq) in SUPERVISOR {
            if pending & bit != 0 && self.try_take_interrupt(irq)? {
                self.csr.clear_bits(CSR_MIP, bit);
                return Ok(());
            }
        }
        Ok(())
    }

    /// Gate one interrupt: pick its target mode from the delegation
    /// registers, refuse delivery into a lower mode than the current one,
    /// and require the global enable for same-mode delivery.
    fn try_take_interrupt(&mut self, irq: Interrupt) -> Result<bool, Trap> {
        let cause = irq.cause();

        let target = if (self.csr.read_raw(CSR_MIDELEG) >> cause) & 1 == 0 {
            Mode::Machine
        } else if (self.csr.read_raw(CSR_SIDELEG) >> cause) & 1 == 0 {
            Mode::Supervisor
        } else {
            Mode::User
        };

        if target == Mode::User {
            log::error!("interrupt {irq:?} delegated to user mode; unsupported");
            return Err(Trap::Fatal(Exception::IllegalInstruction(cause)));
        }
        if target < self.mode {
            return Ok(false);
        }
        if target == self.mode {
            let enabled = match self.mode {
                Mode::Machine => self.csr.check_bits(CSR_MSTATUS, MSTATUS_MIE),
                Mode::Supervisor => self.csr.check_bits(CSR_SSTATUS, MSTATUS_SIE),
                Mode::User => false,
            };
            if !enabled {
                return Ok(false);
            }
        }

        log::trace!("taking interrupt {irq:?} at pc {:#x}", self.pc);
        self.trap_entry(target, cause, true, self.pc, self.pc);
        self.icache.invalidate_all();
        Ok(true)
    }

    /// Deliver an exception: select the target mode via medeleg/sedeleg,
    /// enter the handler, and classify the trap for the driver loop.
    fn handle_exception(&mut self, exc: Exception, pc: u64) -> Trap {
        let cause = exc.cause();

        let target = if (self.csr.read_raw(CSR_MEDELEG) >> cause) & 1 == 0 {
            Mode::Machine
        } else if (self.csr.read_raw(CSR_SEDELEG) >> cause) & 1 == 0 {
            Mode::Supervisor
        } else {
            Mode::User
        };

        if target == Mode::User {
            log::error!("trap into user mode is unsupported: {exc:?}");
            return Trap::Fatal(exc);
        }

        self.trap_entry(target, cause, false, exc.value(), pc);
        self.icache.invalidate_all();
        Trap::classify(exc)
    }

    /// Common trap entry: save pc/cause/value, stack the interrupt-enable
    /// and privilege bits, and redirect to the trap vector. Vectored
    /// dispatch applies to interrupts only.
    fn trap_entry(&mut self, target: Mode, cause: u64, is_interrupt: bool, value: u64, pc: u64) {
        let prev = self.mode;
        self.mode = target;

        let (tvec, epc, cause_reg, tval, status, ie_bit, pie_bit) = match target {
            Mode::Supervisor => (
                CSR_STVEC, CSR_SEPC, CSR_SCAUSE, CSR_STVAL, CSR_SSTATUS, MSTATUS_SIE,
                MSTATUS_SPIE,
            ),
            _ => (
                CSR_MTVEC, CSR_MEPC, CSR_MCAUSE, CSR_MTVAL, CSR_MSTATUS, MSTATUS_MIE,
                MSTATUS_MPIE,
            ),
        };

        let tvec_val = self.csr.read_raw(tvec);
        let base = tvec_val & !0b11;
        self.pc = if is_interrupt && tvec_val & 0b11 == 1 {
            base.wrapping_add(4 * cause)
        } else {
            base
        };

        self.csr.write_raw(epc, pc & !1);
        self.csr
            .write_raw(cause_reg, ((is_interrupt as u64) << 63) | cause);
        self.csr.write_raw(tval, value);

        // xPIE <= xIE, xIE <= 0, xPP <= previous mode. Both PIE bits sit
        // four above their IE bits.
        let status_val = self.csr.read_raw(status);
        let ie = status_val & ie_bit;
        self.csr
            .write_raw(status, (status_val & !pie_bit) | (ie << 4));
        self.csr.clear_bits(status, ie_bit);
        match target {
            Mode::Supervisor => {
                if prev == Mode::User {
                    self.csr.clear_bits(CSR_SSTATUS, MSTATUS_SPP);
                } else {
                    self.csr.set_bits(CSR_SSTATUS, MSTATUS_SPP);
                }
            }
            _ => {
                let mstatus = self.csr.read_raw(CSR_MSTATUS);
                self.csr.write_raw(
                    CSR_MSTATUS,
                    (mstatus & !MSTATUS_MPP) | (prev.to_bits() << 11),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::clint::{CLINT_BASE, MTIMECMP_OFFSET};
    use crate::devices::rom::BootRom;
    use crate::dram::DRAM_BASE;

    // --- Encoding helpers ---------------------------------------------------

    fn encode_i(imm: i32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
        (((imm as u32) & 0xfff) << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
    }

    fn encode_r(funct7: u32, rs2: u32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
        (funct7 << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
    }

    fn encode_u(imm20: u32, rd: u32, opcode: u32) -> u32 {
        (imm20 << 12) | (rd << 7) | opcode
    }

    fn encode_s(imm: i32, rs2: u32, rs1: u32, funct3: u32, opcode: u32) -> u32 {
        let imm = imm as u32;
        ((imm >> 5) & 0x7f) << 25 | (rs2 << 20) | (rs1 << 15) | (funct3 << 12)
            | (imm & 0x1f) << 7
            | opcode
    }

    fn encode_amo(funct5: u32, rs2: u32, rs1: u32, funct3: u32, rd: u32) -> u32 {
        encode_r(funct5 << 2, rs2, rs1, funct3, rd, 0x2f)
    }

    // --- Harness ------------------------------------------------------------

    fn make_bus() -> SystemBus {
        let rom = BootRom::new(DRAM_BASE, Vec::new());
        SystemBus::new(1024 * 1024, rom, None)
    }

    fn load_program(bus: &mut SystemBus, insns: &[u32]) {
        for (i, insn) in insns.iter().enumerate() {
            bus.store(DRAM_BASE + (i as u64) * 4, 32, *insn as u64).unwrap();
        }
    }

    fn run(cpu: &mut Cpu, bus: &mut SystemBus, steps: usize) {
        for _ in 0..steps {
            cpu.step(bus).unwrap();
        }
    }

    // --- Scenarios ----------------------------------------------------------

    #[test]
    fn add_chain() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(DRAM_BASE);
        load_program(
            &mut bus,
            &[
                encode_i(5, 0, 0, 1, 0x13),          // addi x1, x0, 5
                encode_i(7, 0, 0, 2, 0x13),          // addi x2, x0, 7
                encode_r(0, 2, 1, 0, 3, 0x33),       // add x3, x1, x2
            ],
        );
        run(&mut cpu, &mut bus, 3);
        assert_eq!(cpu.xreg[3], 12);
        assert_eq!(cpu.pc, DRAM_BASE + 0xc);
    }

    #[test]
    fn lui_then_logical_shift() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(DRAM_BASE);
        load_program(
            &mut bus,
            &[
                encode_u(0xfffff, 1, 0x37),          // lui x1, 0xfffff
                encode_i(4, 1, 5, 2, 0x13),          // srli x2, x1, 4
            ],
        );
        run(&mut cpu, &mut bus, 2);
        assert_eq!(cpu.xreg[1], 0xffff_ffff_ffff_f000);
        assert_eq!(cpu.xreg[2], 0x0fff_ffff_ffff_ff00);
    }

    #[test]
    fn divide_by_zero_returns_all_ones_without_trap() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(DRAM_BASE);
        cpu.xreg[2] = 42;
        load_program(&mut bus, &[encode_r(1, 0, 2, 4, 1, 0x33)]); // div x1, x2, x0
        run(&mut cpu, &mut bus, 1);
        assert_eq!(cpu.xreg[1], u64::MAX);
        assert_eq!(cpu.mode, Mode::Machine);
    }

    #[test]
    fn signed_division_overflow() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(DRAM_BASE);
        cpu.xreg[2] = i64::MIN as u64;
        cpu.xreg[3] = -1i64 as u64;
        load_program(
            &mut bus,
            &[
                encode_r(1, 3, 2, 4, 1, 0x33), // div x1, x2, x3
                encode_r(1, 3, 2, 6, 4, 0x33), // rem x4, x2, x3
            ],
        );
        run(&mut cpu, &mut bus, 2);
        assert_eq!(cpu.xreg[1], i64::MIN as u64);
        assert_eq!(cpu.xreg[4], 0);
    }

    #[test]
    fn mulh_variants() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(DRAM_BASE);
        cpu.xreg[2] = -1i64 as u64;
        cpu.xreg[3] = 2;
        load_program(
            &mut bus,
            &[
                encode_r(1, 3, 2, 1, 1, 0x33), // mulh x1, x2, x3
                encode_r(1, 3, 2, 3, 4, 0x33), // mulhu x4, x2, x3
            ],
        );
        run(&mut cpu, &mut bus, 2);
        assert_eq!(cpu.xreg[1], u64::MAX); // high bits of -2
        assert_eq!(cpu.xreg[4], 1); // high bits of (2^64-1)*2
    }

    #[test]
    fn x0_stays_zero() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(DRAM_BASE);
        load_program(&mut bus, &[encode_i(123, 0, 0, 0, 0x13)]); // addi x0, x0, 123
        run(&mut cpu, &mut bus, 1);
        assert_eq!(cpu.xreg[0], 0);
    }

    #[test]
    fn load_store_sign_extension() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(DRAM_BASE);
        cpu.xreg[1] = DRAM_BASE + 0x100;
        cpu.xreg[2] = 0xff80;
        load_program(
            &mut bus,
            &[
                encode_s(0, 2, 1, 1, 0x23),    // sh x2, 0(x1)
                encode_i(0, 1, 1, 3, 0x03),    // lh x3, 0(x1)
                encode_i(0, 1, 5, 4, 0x03),    // lhu x4, 0(x1)
                encode_i(0, 1, 0, 5, 0x03),    // lb x5, 0(x1)
            ],
        );
        run(&mut cpu, &mut bus, 4);
        assert_eq!(cpu.xreg[3], 0xffff_ffff_ffff_ff80);
        assert_eq!(cpu.xreg[4], 0xff80);
        assert_eq!(cpu.xreg[5], 0xffff_ffff_ffff_ff80);
    }

    #[test]
    fn jal_links_and_jumps() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(DRAM_BASE);
        // jal x1, 16
        let imm = 16u32;
        let insn = ((imm >> 1) & 0x3ff) << 21 | (1 << 7) | 0x6f;
        load_program(&mut bus, &[insn]);
        run(&mut cpu, &mut bus, 1);
        assert_eq!(cpu.xreg[1], DRAM_BASE + 4);
        assert_eq!(cpu.pc, DRAM_BASE + 16);
    }

    #[test]
    fn lr_sc_pairs() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(DRAM_BASE);
        cpu.xreg[3] = DRAM_BASE + 0x200;
        cpu.xreg[5] = 77;
        bus.store(DRAM_BASE + 0x200, 32, 11).unwrap();
        load_program(
            &mut bus,
            &[
                encode_amo(0x02, 0, 3, 2, 2),  // lr.w x2, (x3)
                encode_amo(0x03, 5, 3, 2, 4),  // sc.w x4, x5, (x3)
                encode_amo(0x03, 5, 3, 2, 6),  // sc.w x6, x5, (x3) - stale
            ],
        );
        run(&mut cpu, &mut bus, 3);
        assert_eq!(cpu.xreg[2], 11);
        assert_eq!(cpu.xreg[4], 0); // success
        assert_eq!(bus.load(DRAM_BASE + 0x200, 32).unwrap(), 77);
        assert_eq!(cpu.xreg[6], 1); // reservation was consumed
    }

    #[test]
    fn store_invalidates_reservation() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(DRAM_BASE);
        cpu.xreg[3] = DRAM_BASE + 0x200;
        cpu.xreg[7] = DRAM_BASE + 0x200;
        load_program(
            &mut bus,
            &[
                encode_amo(0x02, 0, 3, 2, 2),  // lr.w x2, (x3)
                encode_s(0, 5, 7, 2, 0x23),    // sw x5, 0(x7)
                encode_amo(0x03, 5, 3, 2, 4),  // sc.w x4, x5, (x3)
            ],
        );
        run(&mut cpu, &mut bus, 3);
        assert_eq!(cpu.xreg[4], 1); // SC fails after intervening store
    }

    #[test]
    fn unrelated_lr_replaces_reservation() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(DRAM_BASE);
        cpu.xreg[3] = DRAM_BASE + 0x200;
        cpu.xreg[7] = DRAM_BASE + 0x300;
        load_program(
            &mut bus,
            &[
                encode_amo(0x02, 0, 3, 2, 2),  // lr.w x2, (x3)
                encode_amo(0x02, 0, 7, 2, 5),  // lr.w x5, (x7)
                encode_amo(0x03, 6, 3, 2, 4),  // sc.w x4, x6, (x3)
            ],
        );
        run(&mut cpu, &mut bus, 3);
        assert_eq!(cpu.xreg[4], 1);
    }

    #[test]
    fn amoadd_returns_old_value() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(DRAM_BASE);
        cpu.xreg[3] = DRAM_BASE + 0x400;
        cpu.xreg[5] = 3;
        bus.store(DRAM_BASE + 0x400, 32, 0xffff_fffe).unwrap();
        load_program(&mut bus, &[encode_amo(0x00, 5, 3, 2, 2)]); // amoadd.w
        run(&mut cpu, &mut bus, 1);
        // Old value is sign-extended for the word form.
        assert_eq!(cpu.xreg[2], 0xffff_ffff_ffff_fffe);
        assert_eq!(bus.load(DRAM_BASE + 0x400, 32).unwrap(), 1);
    }

    #[test]
    fn trap_cycle_illegal_instruction() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(DRAM_BASE);
        cpu.csr.write_raw(CSR_MTVEC, DRAM_BASE + 0x100);
        cpu.csr.set_bits(CSR_MSTATUS, MSTATUS_MIE);
        bus.store(DRAM_BASE, 32, 0xffff_ffff).unwrap();

        let trap = cpu.step(&mut bus).unwrap_err();
        assert!(matches!(trap, Trap::Fatal(Exception::IllegalInstruction(_))));
        assert_eq!(cpu.csr.read_raw(CSR_MCAUSE), 2);
        assert_eq!(cpu.csr.read_raw(CSR_MEPC), DRAM_BASE);
        assert_eq!(cpu.csr.read_raw(CSR_MTVAL), 0xffff_ffff);
        assert_eq!(cpu.mode, Mode::Machine);
        assert_eq!(cpu.pc, DRAM_BASE + 0x100);
        // MIE stacked into MPIE and cleared.
        assert!(!cpu.csr.check_bits(CSR_MSTATUS, MSTATUS_MIE));
        assert!(cpu.csr.check_bits(CSR_MSTATUS, MSTATUS_MPIE));
        // MPP records the machine origin.
        assert_eq!(
            cpu.csr.read_raw(CSR_MSTATUS) & MSTATUS_MPP,
            Mode::Machine.to_bits() << 11
        );
    }

    #[test]
    fn user_ecall_delegated_to_supervisor() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(DRAM_BASE);
        cpu.mode = Mode::User;
        cpu.csr.write_raw(CSR_MEDELEG, 1 << 8);
        cpu.csr.write_raw(CSR_STVEC, DRAM_BASE + 0x80);
        load_program(&mut bus, &[0x0000_0073]); // ecall

        let trap = cpu.step(&mut bus).unwrap_err();
        assert!(matches!(
            trap,
            Trap::Requested(Exception::EnvironmentCallFromU(_))
        ));
        assert_eq!(cpu.mode, Mode::Supervisor);
        assert_eq!(cpu.csr.read_raw(CSR_SCAUSE), 8);
        assert_eq!(cpu.csr.read_raw(CSR_SEPC), DRAM_BASE);
        assert_eq!(cpu.pc, DRAM_BASE + 0x80);
        // SPP = 0: the trap came from user mode.
        assert!(!cpu.csr.check_bits(CSR_SSTATUS, MSTATUS_SPP));
    }

    #[test]
    fn machine_ecall_stays_in_machine() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(DRAM_BASE);
        cpu.csr.write_raw(CSR_MTVEC, DRAM_BASE + 0x40);
        load_program(&mut bus, &[0x0000_0073]);

        let trap = cpu.step(&mut bus).unwrap_err();
        assert!(matches!(
            trap,
            Trap::Requested(Exception::EnvironmentCallFromM(_))
        ));
        assert_eq!(cpu.csr.read_raw(CSR_MCAUSE), 11);
        assert_eq!(cpu.pc, DRAM_BASE + 0x40);
    }

    #[test]
    fn mret_restores_stacked_state() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(DRAM_BASE);
        cpu.csr.write_raw(CSR_MEPC, DRAM_BASE + 0x40);
        cpu.csr.write_raw(
            CSR_MSTATUS,
            (Mode::Supervisor.to_bits() << 11) | MSTATUS_MPIE,
        );
        load_program(&mut bus, &[0x3020_0073]); // mret

        run(&mut cpu, &mut bus, 1);
        assert_eq!(cpu.pc, DRAM_BASE + 0x40);
        assert_eq!(cpu.mode, Mode::Supervisor);
        assert!(cpu.csr.check_bits(CSR_MSTATUS, MSTATUS_MIE));
        assert!(cpu.csr.check_bits(CSR_MSTATUS, MSTATUS_MPIE));
        assert_eq!(cpu.csr.read_raw(CSR_MSTATUS) & MSTATUS_MPP, 0);
    }

    #[test]
    fn timer_interrupt_delivery() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(DRAM_BASE);
        cpu.csr.write_raw(CSR_MTVEC, DRAM_BASE + 0x200);
        cpu.csr.write_raw(CSR_MIE, MIP_MTIP);
        cpu.csr.set_bits(CSR_MSTATUS, MSTATUS_MIE);
        bus.store(CLINT_BASE + MTIMECMP_OFFSET, 64, 10).unwrap();

        // nops everywhere the pc will walk.
        for i in 0..0x100 {
            bus.store(DRAM_BASE + i * 4, 32, encode_i(0, 0, 0, 0, 0x13) as u64)
                .unwrap();
        }

        let mut delivered = false;
        for _ in 0..32 {
            cpu.step(&mut bus).unwrap();
            if cpu.csr.read_raw(CSR_MCAUSE) == (1 << 63) | 7 {
                delivered = true;
                break;
            }
        }
        assert!(delivered, "machine timer interrupt was not delivered");
        // Pending bit was consumed at delivery, then the handler runs with
        // interrupts globally disabled.
        assert!(!cpu.csr.check_bits(CSR_MSTATUS, MSTATUS_MIE));
        assert!(cpu.csr.check_bits(CSR_MSTATUS, MSTATUS_MPIE));
    }

    #[test]
    fn vectored_interrupt_dispatch() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(DRAM_BASE);
        // mtvec with vectored mode.
        cpu.csr.write_raw(CSR_MTVEC, (DRAM_BASE + 0x200) | 1);
        cpu.csr.write_raw(CSR_MIE, MIP_MTIP);
        cpu.csr.set_bits(CSR_MSTATUS, MSTATUS_MIE);
        bus.store(CLINT_BASE + MTIMECMP_OFFSET, 64, 1).unwrap();
        for i in 0..0x100 {
            bus.store(DRAM_BASE + i * 4, 32, encode_i(0, 0, 0, 0, 0x13) as u64)
                .unwrap();
        }

        cpu.step(&mut bus).unwrap();
        // Cause 7, vectored: base + 4 * 7, plus the instruction executed
        // after delivery.
        assert_eq!(cpu.csr.read_raw(CSR_MEPC), DRAM_BASE);
        assert_eq!(cpu.pc, DRAM_BASE + 0x200 + 28 + 4);
    }

    #[test]
    fn interrupt_disabled_by_global_enable_in_same_mode() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(DRAM_BASE);
        cpu.csr.write_raw(CSR_MIE, MIP_MTIP);
        // MSTATUS.MIE stays clear; machine-mode delivery must be refused.
        bus.store(CLINT_BASE + MTIMECMP_OFFSET, 64, 1).unwrap();
        load_program(&mut bus, &[encode_i(0, 0, 0, 0, 0x13); 8]);
        for _ in 0..4 {
            cpu.step(&mut bus).unwrap();
        }
        assert_eq!(cpu.csr.read_raw(CSR_MCAUSE), 0);
    }

    #[test]
    fn compressed_execution() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(DRAM_BASE);
        // c.addi x10, 1 ; c.addi x10, 1 packed into one word.
        bus.store(DRAM_BASE, 32, 0x0505_0505).unwrap();
        run(&mut cpu, &mut bus, 2);
        assert_eq!(cpu.xreg[10], 2);
        assert_eq!(cpu.pc, DRAM_BASE + 4);
    }

    #[test]
    fn csr_read_modify_write() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(DRAM_BASE);
        cpu.xreg[2] = 0xa5;
        load_program(
            &mut bus,
            &[
                encode_i(0x340, 2, 1, 1, 0x73), // csrrw x1, mscratch, x2
                encode_i(0x340, 0, 2, 3, 0x73), // csrrs x3, mscratch, x0
            ],
        );
        run(&mut cpu, &mut bus, 2);
        assert_eq!(cpu.xreg[1], 0);
        assert_eq!(cpu.xreg[3], 0xa5);
    }

    #[test]
    fn csr_access_needs_privilege() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(DRAM_BASE);
        cpu.mode = Mode::User;
        cpu.csr.write_raw(CSR_MTVEC, DRAM_BASE + 0x100);
        load_program(&mut bus, &[encode_i(0x300, 0, 2, 1, 0x73)]); // csrrs x1, mstatus, x0

        let trap = cpu.step(&mut bus).unwrap_err();
        assert!(matches!(
            trap,
            Trap::Fatal(Exception::IllegalInstruction(_))
        ));
    }

    #[test]
    fn fence_i_invalidates_decoded_cache() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(DRAM_BASE);
        load_program(
            &mut bus,
            &[
                encode_i(5, 0, 0, 1, 0x13),     // addi x1, x0, 5
                0x0000_100f,                    // fence.i
            ],
        );
        run(&mut cpu, &mut bus, 2);
        // Rewrite the first instruction and jump back; the new encoding
        // must be fetched, not the cached decode.
        bus.store(DRAM_BASE, 32, encode_i(9, 0, 0, 1, 0x13) as u64).unwrap();
        cpu.pc = DRAM_BASE;
        run(&mut cpu, &mut bus, 1);
        assert_eq!(cpu.xreg[1], 9);
    }
}
