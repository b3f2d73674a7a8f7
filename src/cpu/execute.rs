//! Instruction executors.
//!
//! One handler per operation, dispatched on the selector produced by
//! decode. The pc has already been advanced past the instruction when a
//! handler runs, so pc-relative targets are computed as
//! `pc + imm - insn_len` and the link value for JAL/JALR is simply the
//! current pc.

use crate::bus::SystemBus;

use super::csr::{
    Mode, CSR_MEPC, CSR_MSTATUS, CSR_SEPC, CSR_SSTATUS, MSTATUS_MIE, MSTATUS_MPIE, MSTATUS_MPP,
    MSTATUS_SIE, MSTATUS_SPIE, MSTATUS_SPP,
};
use super::decode::Operation;
use super::trap::Exception;
use super::Cpu;

impl Cpu {
    /// Run the executor for the decoded instruction. `xreg[0]` is pinned
    /// back to zero after every handler, whatever it did.
    pub(super) fn execute(&mut self, bus: &mut SystemBus) -> Result<(), Exception> {
        use Operation::*;
        let result = match self.instr.op {
            Illegal => Err(Exception::IllegalInstruction(self.instr.raw as u64)),

            Lb => lb(self, bus),
            Lh => lh(self, bus),
            Lw => lw(self, bus),
            Ld => ld(self, bus),
            Lbu => lbu(self, bus),
            Lhu => lhu(self, bus),
            Lwu => lwu(self, bus),
            Sb => sb(self, bus),
            Sh => sh(self, bus),
            Sw => sw(self, bus),
            Sd => sd(self, bus),
            Fsw => fsw(self, bus),
            Fsd => fsd(self, bus),
            Fence => Ok(()),
            FenceI => fence_i(self),

            Addi => addi(self),
            Slli => slli(self),
            Slti => slti(self),
            Sltiu => sltiu(self),
            Xori => xori(self),
            Srli => srli(self),
            Srai => srai(self),
            Ori => ori(self),
            Andi => andi(self),

            Add => add(self),
            Sub => sub(self),
            Sll => sll(self),
            Slt => slt(self),
            Sltu => sltu(self),
            Xor => xor(self),
            Srl => srl(self),
            Sra => sra(self),
            Or => or(self),
            And => and(self),
            Mul => mul(self),
            Mulh => mulh(self),
            Mulhsu => mulhsu(self),
            Mulhu => mulhu(self),
            Div => div(self),
            Divu => divu(self),
            Rem => rem(self),
            Remu => remu(self),

            Lui => lui(self),
            Auipc => auipc(self),
            Jal => jal(self),
            Jalr => jalr(self),

            Addiw => addiw(self),
            Slliw => slliw(self),
            Srliw => srliw(self),
            Sraiw => sraiw(self),
            Addw => addw(self),
            Subw => subw(self),
            Sllw => sllw(self),
            Srlw => srlw(self),
            Sraw => sraw(self),
            Mulw => mulw(self),
            Divw => divw(self),
            Divuw => divuw(self),
            Remw => remw(self),
            Remuw => remuw(self),

            Beq => branch(self, |a, b| a == b),
            Bne => branch(self, |a, b| a != b),
            Blt => branch(self, |a, b| (a as i64) < (b as i64)),
            Bge => branch(self, |a, b| (a as i64) >= (b as i64)),
            Bltu => branch(self, |a, b| a < b),
            Bgeu => branch(self, |a, b| a >= b),

            Ecall => ecall(self),
            Ebreak => ebreak(self),
            Sret => sret(self),
            Mret => mret(self),
            Wfi => Ok(()),
            SfenceVma => sfence_vma(self),
            HfenceBvma | HfenceGvma => Ok(()),

            Csrrw => csrrw(self),
            Csrrs => csrrs(self),
            Csrrc => csrrc(self),
            Csrrwi => csrrwi(self),
            Csrrsi => csrrsi(self),
            Csrrci => csrrci(self),

            LrW => lr(self, bus, 32),
            LrD => lr(self, bus, 64),
            ScW => sc(self, bus, 32),
            ScD => sc(self, bus, 64),
            AmoswapW => amo(self, bus, 32, |_, rs2| rs2),
            AmoswapD => amo(self, bus, 64, |_, rs2| rs2),
            AmoaddW => amo(self, bus, 32, |old, rs2| old.wrapping_add(rs2)),
            AmoaddD => amo(self, bus, 64, |old, rs2| old.wrapping_add(rs2)),
            AmoxorW => amo(self, bus, 32, |old, rs2| old ^ rs2),
            AmoxorD => amo(self, bus, 64, |old, rs2| old ^ rs2),
            AmoorW => amo(self, bus, 32, |old, rs2| old | rs2),
            AmoorD => amo(self, bus, 64, |old, rs2| old | rs2),
            AmoandW => amo(self, bus, 32, |old, rs2| old & rs2),
            AmoandD => amo(self, bus, 64, |old, rs2| old & rs2),
            AmominW => amo(self, bus, 32, |old, rs2| {
                if (old as i32) < (rs2 as i32) { old } else { rs2 }
            }),
            AmominD => amo(self, bus, 64, |old, rs2| {
                if (old as i64) < (rs2 as i64) { old } else { rs2 }
            }),
            AmomaxW => amo(self, bus, 32, |old, rs2| {
                if (old as i32) > (rs2 as i32) { old } else { rs2 }
            }),
            AmomaxD => amo(self, bus, 64, |old, rs2| {
                if (old as i64) > (rs2 as i64) { old } else { rs2 }
            }),
            AmominuW => amo(self, bus, 32, |old, rs2| {
                if (old as u32) < (rs2 as u32) { old } else { rs2 }
            }),
            AmominuD => amo(self, bus, 64, |old, rs2| if old < rs2 { old } else { rs2 }),
            AmomaxuW => amo(self, bus, 32, |old, rs2| {
                if (old as u32) > (rs2 as u32) { old } else { rs2 }
            }),
            AmomaxuD => amo(self, bus, 64, |old, rs2| if old > rs2 { old } else { rs2 }),

            Caddi4spn => c_addi4spn(self),
            Clw => c_lw(self, bus),
            Cld => c_ld(self, bus),
            Cfsd => c_fsd(self, bus),
            Csw => c_sw(self, bus),
            Csd => c_sd(self, bus),
            Caddi => c_addi(self),
            Caddiw => c_addiw(self),
            Cli => c_li(self),
            CluiAddi16sp => c_lui_addi16sp(self),
            Csrli => c_srli(self),
            Csrai => c_srai(self),
            Candi => c_andi(self),
            Csub => c_sub(self),
            Cxor => c_xor(self),
            Cor => c_or(self),
            Cand => c_and(self),
            Csubw => c_subw(self),
            Caddw => c_addw(self),
            Cj => c_j(self),
            Cbeqz => c_branch(self, true),
            Cbnez => c_branch(self, false),
            Cslli => c_slli(self),
            Clwsp => c_lwsp(self, bus),
            Cldsp => c_ldsp(self, bus),
            CjrMv => c_jr_mv(self),
            CebreakJalrAdd => c_ebreak_jalr_add(self),
            Cswsp => c_swsp(self, bus),
            Csdsp => c_sdsp(self, bus),
        };
        self.xreg[0] = 0;
        result
    }
}

#[inline]
fn rd(cpu: &Cpu) -> usize {
    cpu.instr.rd as usize
}

#[inline]
fn rs1(cpu: &Cpu) -> u64 {
    cpu.xreg[cpu.instr.rs1 as usize]
}

#[inline]
fn rs2(cpu: &Cpu) -> u64 {
    cpu.xreg[cpu.instr.rs2 as usize]
}

/// Effective address of a load/store: rs1 + sign-extended immediate.
#[inline]
fn mem_addr(cpu: &Cpu) -> u64 {
    rs1(cpu).wrapping_add(cpu.instr.imm)
}

/// pc-relative target, compensating for the fetch advance.
#[inline]
fn rel_target(cpu: &Cpu, imm: u64) -> u64 {
    cpu.pc.wrapping_add(imm).wrapping_sub(cpu.instr.len as u64)
}

// --- Loads and stores ------------------------------------------------------

fn lb(cpu: &mut Cpu, bus: &mut SystemBus) -> Result<(), Exception> {
    let value = cpu.read(bus, mem_addr(cpu), 8)?;
    cpu.xreg[rd(cpu)] = value as i8 as i64 as u64;
    Ok(())
}

fn lh(cpu: &mut Cpu, bus: &mut SystemBus) -> Result<(), Exception> {
    let value = cpu.read(bus, mem_addr(cpu), 16)?;
    cpu.xreg[rd(cpu)] = value as i16 as i64 as u64;
    Ok(())
}

fn lw(cpu: &mut Cpu, bus: &mut SystemBus) -> Result<(), Exception> {
    let value = cpu.read(bus, mem_addr(cpu), 32)?;
    cpu.xreg[rd(cpu)] = value as i32 as i64 as u64;
    Ok(())
}

fn ld(cpu: &mut Cpu, bus: &mut SystemBus) -> Result<(), Exception> {
    let value = cpu.read(bus, mem_addr(cpu), 64)?;
    cpu.xreg[rd(cpu)] = value;
    Ok(())
}

fn lbu(cpu: &mut Cpu, bus: &mut SystemBus) -> Result<(), Exception> {
    let value = cpu.read(bus, mem_addr(cpu), 8)?;
    cpu.xreg[rd(cpu)] = value;
    Ok(())
}

fn lhu(cpu: &mut Cpu, bus: &mut SystemBus) -> Result<(), Exception> {
    let value = cpu.read(bus, mem_addr(cpu), 16)?;
    cpu.xreg[rd(cpu)] = value;
    Ok(())
}

fn lwu(cpu: &mut Cpu, bus: &mut SystemBus) -> Result<(), Exception> {
    let value = cpu.read(bus, mem_addr(cpu), 32)?;
    cpu.xreg[rd(cpu)] = value;
    Ok(())
}

fn sb(cpu: &mut Cpu, bus: &mut SystemBus) -> Result<(), Exception> {
    cpu.write(bus, mem_addr(cpu), 8, rs2(cpu))
}

fn sh(cpu: &mut Cpu, bus: &mut SystemBus) -> Result<(), Exception> {
    cpu.write(bus, mem_addr(cpu), 16, rs2(cpu))
}

fn sw(cpu: &mut Cpu, bus: &mut SystemBus) -> Result<(), Exception> {
    cpu.write(bus, mem_addr(cpu), 32, rs2(cpu))
}

fn sd(cpu: &mut Cpu, bus: &mut SystemBus) -> Result<(), Exception> {
    cpu.write(bus, mem_addr(cpu), 64, rs2(cpu))
}

fn fsw(cpu: &mut Cpu, bus: &mut SystemBus) -> Result<(), Exception> {
    let value = cpu.freg[cpu.instr.rs2 as usize];
    cpu.write(bus, mem_addr(cpu), 32, value)
}

fn fsd(cpu: &mut Cpu, bus: &mut SystemBus) -> Result<(), Exception> {
    let value = cpu.freg[cpu.instr.rs2 as usize];
    cpu.write(bus, mem_addr(cpu), 64, value)
}

fn fence_i(cpu: &mut Cpu) -> Result<(), Exception> {
    cpu.icache.invalidate_all();
    Ok(())
}

// --- OP-IMM ----------------------------------------------------------------

fn addi(cpu: &mut Cpu) -> Result<(), Exception> {
    cpu.xreg[rd(cpu)] = rs1(cpu).wrapping_add(cpu.instr.imm);
    Ok(())
}

fn slli(cpu: &mut Cpu) -> Result<(), Exception> {
    let shamt = cpu.instr.imm & 0x3f;
    cpu.xreg[rd(cpu)] = rs1(cpu) << shamt;
    Ok(())
}

fn slti(cpu: &mut Cpu) -> Result<(), Exception> {
    cpu.xreg[rd(cpu)] = ((rs1(cpu) as i64) < (cpu.instr.imm as i64)) as u64;
    Ok(())
}

fn sltiu(cpu: &mut Cpu) -> Result<(), Exception> {
    cpu.xreg[rd(cpu)] = (rs1(cpu) < cpu.instr.imm) as u64;
    Ok(())
}

fn xori(cpu: &mut Cpu) -> Result<(), Exception> {
    cpu.xreg[rd(cpu)] = rs1(cpu) ^ cpu.instr.imm;
    Ok(())
}

fn srli(cpu: &mut Cpu) -> Result<(), Exception> {
    let shamt = cpu.instr.imm & 0x3f;
    cpu.xreg[rd(cpu)] = rs1(cpu) >> shamt;
    Ok(())
}

fn srai(cpu: &mut Cpu) -> Result<(), Exception> {
    let shamt = cpu.instr.imm & 0x3f;
    cpu.xreg[rd(cpu)] = ((rs1(cpu) as i64) >> shamt) as u64;
    Ok(())
}

fn ori(cpu: &mut Cpu) -> Result<(), Exception> {
    cpu.xreg[rd(cpu)] = rs1(cpu) | cpu.instr.imm;
    Ok(())
}

fn andi(cpu: &mut Cpu) -> Result<(), Exception> {
    cpu.xreg[rd(cpu)] = rs1(cpu) & cpu.instr.imm;
    Ok(())
}

// --- OP --------------------------------------------------------------------

fn add(cpu: &mut Cpu) -> Result<(), Exception> {
    cpu.xreg[rd(cpu)] = rs1(cpu).wrapping_add(rs2(cpu));
    Ok(())
}

fn sub(cpu: &mut Cpu) -> Result<(), Exception> {
    cpu.xreg[rd(cpu)] = rs1(cpu).wrapping_sub(rs2(cpu));
    Ok(())
}

fn sll(cpu: &mut Cpu) -> Result<(), Exception> {
    cpu.xreg[rd(cpu)] = rs1(cpu) << (rs2(cpu) & 0x3f);
    Ok(())
}

fn slt(cpu: &mut Cpu) -> Result<(), Exception> {
    cpu.xreg[rd(cpu)] = ((rs1(cpu) as i64) < (rs2(cpu) as i64)) as u64;
    Ok(())
}

fn sltu(cpu: &mut Cpu) -> Result<(), Exception> {
    cpu.xreg[rd(cpu)] = (rs1(cpu) < rs2(cpu)) as u64;
    Ok(())
}

fn xor(cpu: &mut Cpu) -> Result<(), Exception> {
    cpu.xreg[rd(cpu)] = rs1(cpu) ^ rs2(cpu);
    Ok(())
}

fn srl(cpu: &mut Cpu) -> Result<(), Exception> {
    cpu.xreg[rd(cpu)] = rs1(cpu) >> (rs2(cpu) & 0x3f);
    Ok(())
}

fn sra(cpu: &mut Cpu) -> Result<(), Exception> {
    cpu.xreg[rd(cpu)] = ((rs1(cpu) as i64) >> (rs2(cpu) & 0x3f)) as u64;
    Ok(())
}

fn or(cpu: &mut Cpu) -> Result<(), Exception> {
    cpu.xreg[rd(cpu)] = rs1(cpu) | rs2(cpu);
    Ok(())
}

fn and(cpu: &mut Cpu) -> Result<(), Exception> {
    cpu.xreg[rd(cpu)] = rs1(cpu) & rs2(cpu);
    Ok(())
}

fn mul(cpu: &mut Cpu) -> Result<(), Exception> {
    cpu.xreg[rd(cpu)] = (rs1(cpu) as i64).wrapping_mul(rs2(cpu) as i64) as u64;
    Ok(())
}

fn mulh(cpu: &mut Cpu) -> Result<(), Exception> {
    let a = rs1(cpu) as i64 as i128;
    let b = rs2(cpu) as i64 as i128;
    cpu.xreg[rd(cpu)] = ((a * b) >> 64) as u64;
    Ok(())
}

fn mulhsu(cpu: &mut Cpu) -> Result<(), Exception> {
    let a = rs1(cpu) as i64 as i128;
    let b = rs2(cpu) as i128;
    cpu.xreg[rd(cpu)] = ((a * b) >> 64) as u64;
    Ok(())
}

fn mulhu(cpu: &mut Cpu) -> Result<(), Exception> {
    let a = rs1(cpu) as u128;
    let b = rs2(cpu) as u128;
    cpu.xreg[rd(cpu)] = ((a * b) >> 64) as u64;
    Ok(())
}

fn div(cpu: &mut Cpu) -> Result<(), Exception> {
    let dividend = rs1(cpu) as i64;
    let divisor = rs2(cpu) as i64;
    cpu.xreg[rd(cpu)] = if divisor == 0 {
        u64::MAX
    } else if dividend == i64::MIN && divisor == -1 {
        dividend as u64
    } else {
        (dividend / divisor) as u64
    };
    Ok(())
}

fn divu(cpu: &mut Cpu) -> Result<(), Exception> {
    let dividend = rs1(cpu);
    let divisor = rs2(cpu);
    cpu.xreg[rd(cpu)] = if divisor == 0 {
        u64::MAX
    } else {
        dividend / divisor
    };
    Ok(())
}

fn rem(cpu: &mut Cpu) -> Result<(), Exception> {
    let dividend = rs1(cpu) as i64;
    let divisor = rs2(cpu) as i64;
    cpu.xreg[rd(cpu)] = if divisor == 0 {
        dividend as u64
    } else if dividend == i64::MIN && divisor == -1 {
        0
    } else {
        (dividend % divisor) as u64
    };
    Ok(())
}

fn remu(cpu: &mut Cpu) -> Result<(), Exception> {
    let dividend = rs1(cpu);
    let divisor = rs2(cpu);
    cpu.xreg[rd(cpu)] = if divisor == 0 {
        dividend
    } else {
        dividend % divisor
    };
    Ok(())
}

// --- U-type and jumps ------------------------------------------------------

fn lui(cpu: &mut Cpu) -> Result<(), Exception> {
    cpu.xreg[rd(cpu)] = cpu.instr.imm;
    Ok(())
}

fn auipc(cpu: &mut Cpu) -> Result<(), Exception> {
    cpu.xreg[rd(cpu)] = rel_target(cpu, cpu.instr.imm);
    Ok(())
}

fn jal(cpu: &mut Cpu) -> Result<(), Exception> {
    cpu.xreg[rd(cpu)] = cpu.pc;
    cpu.pc = rel_target(cpu, cpu.instr.imm);
    Ok(())
}

fn jalr(cpu: &mut Cpu) -> Result<(), Exception> {
    let link = cpu.pc;
    cpu.pc = rs1(cpu).wrapping_add(cpu.instr.imm) & !1;
    cpu.xreg[rd(cpu)] = link;
    Ok(())
}

fn branch(cpu: &mut Cpu, taken: fn(u64, u64) -> bool) -> Result<(), Exception> {
    if taken(rs1(cpu), rs2(cpu)) {
        cpu.pc = rel_target(cpu, cpu.instr.imm);
    }
    Ok(())
}

// --- OP-IMM-32 / OP-32 -----------------------------------------------------

fn addiw(cpu: &mut Cpu) -> Result<(), Exception> {
    let value = (rs1(cpu) as u32).wrapping_add(cpu.instr.imm as u32);
    cpu.xreg[rd(cpu)] = value as i32 as i64 as u64;
    Ok(())
}

fn slliw(cpu: &mut Cpu) -> Result<(), Exception> {
    let shamt = cpu.instr.imm & 0x1f;
    cpu.xreg[rd(cpu)] = (((rs1(cpu) as u32) << shamt) as i32) as i64 as u64;
    Ok(())
}

fn srliw(cpu: &mut Cpu) -> Result<(), Exception> {
    let shamt = cpu.instr.imm & 0x1f;
    cpu.xreg[rd(cpu)] = (((rs1(cpu) as u32) >> shamt) as i32) as i64 as u64;
    Ok(())
}

fn sraiw(cpu: &mut Cpu) -> Result<(), Exception> {
    let shamt = cpu.instr.imm & 0x1f;
    cpu.xreg[rd(cpu)] = ((rs1(cpu) as i32) >> shamt) as i64 as u64;
    Ok(())
}

fn addw(cpu: &mut Cpu) -> Result<(), Exception> {
    let value = (rs1(cpu) as u32).wrapping_add(rs2(cpu) as u32);
    cpu.xreg[rd(cpu)] = value as i32 as i64 as u64;
    Ok(())
}

fn subw(cpu: &mut Cpu) -> Result<(), Exception> {
    let value = (rs1(cpu) as u32).wrapping_sub(rs2(cpu) as u32);
    cpu.xreg[rd(cpu)] = value as i32 as i64 as u64;
    Ok(())
}

fn sllw(cpu: &mut Cpu) -> Result<(), Exception> {
    let shamt = rs2(cpu) & 0x1f;
    cpu.xreg[rd(cpu)] = (((rs1(cpu) as u32) << shamt) as i32) as i64 as u64;
    Ok(())
}

fn srlw(cpu: &mut Cpu) -> Result<(), Exception> {
    let shamt = rs2(cpu) & 0x1f;
    cpu.xreg[rd(cpu)] = (((rs1(cpu) as u32) >> shamt) as i32) as i64 as u64;
    Ok(())
}

fn sraw(cpu: &mut Cpu) -> Result<(), Exception> {
    let shamt = rs2(cpu) & 0x1f;
    cpu.xreg[rd(cpu)] = ((rs1(cpu) as i32) >> shamt) as i64 as u64;
    Ok(())
}

fn mulw(cpu: &mut Cpu) -> Result<(), Exception> {
    let value = (rs1(cpu) as i32).wrapping_mul(rs2(cpu) as i32);
    cpu.xreg[rd(cpu)] = value as i64 as u64;
    Ok(())
}

fn divw(cpu: &mut Cpu) -> Result<(), Exception> {
    let dividend = rs1(cpu) as i32;
    let divisor = rs2(cpu) as i32;
    cpu.xreg[rd(cpu)] = if divisor == 0 {
        u64::MAX
    } else if dividend == i32::MIN && divisor == -1 {
        dividend as i64 as u64
    } else {
        (dividend / divisor) as i64 as u64
    };
    Ok(())
}

fn divuw(cpu: &mut Cpu) -> Result<(), Exception> {
    let dividend = rs1(cpu) as u32;
    let divisor = rs2(cpu) as u32;
    cpu.xreg[rd(cpu)] = if divisor == 0 {
        u64::MAX
    } else {
        (dividend / divisor) as i32 as i64 as u64
    };
    Ok(())
}

fn remw(cpu: &mut Cpu) -> Result<(), Exception> {
    let dividend = rs1(cpu) as i32;
    let divisor = rs2(cpu) as i32;
    cpu.xreg[rd(cpu)] = if divisor == 0 {
        dividend as i64 as u64
    } else if dividend == i32::MIN && divisor == -1 {
        0
    } else {
        (dividend % divisor) as i64 as u64
    };
    Ok(())
}

fn remuw(cpu: &mut Cpu) -> Result<(), Exception> {
    let dividend = rs1(cpu) as u32;
    let divisor = rs2(cpu) as u32;
    cpu.xreg[rd(cpu)] = if divisor == 0 {
        dividend as i32 as i64 as u64
    } else {
        (dividend % divisor) as i32 as i64 as u64
    };
    Ok(())
}

// --- SYSTEM ----------------------------------------------------------------

fn ecall(cpu: &mut Cpu) -> Result<(), Exception> {
    let pc = cpu.pc.wrapping_sub(cpu.instr.len as u64);
    Err(match cpu.mode {
        Mode::User => Exception::EnvironmentCallFromU(pc),
        Mode::Supervisor => Exception::EnvironmentCallFromS(pc),
        Mode::Machine => Exception::EnvironmentCallFromM(pc),
    })
}

fn ebreak(cpu: &mut Cpu) -> Result<(), Exception> {
    Err(Exception::Breakpoint(cpu.pc.wrapping_sub(cpu.instr.len as u64)))
}

fn sret(cpu: &mut Cpu) -> Result<(), Exception> {
    if cpu.mode == Mode::User {
        return Err(Exception::IllegalInstruction(cpu.instr.raw as u64));
    }
    cpu.pc = cpu.csr.read_raw(CSR_SEPC);

    let sstatus = cpu.csr.read_raw(CSR_SSTATUS);
    cpu.mode = Mode::from_bits((sstatus & MSTATUS_SPP) >> 8);
    // SIE <= SPIE, SPIE <= 1, SPP <= U.
    let spie = (sstatus & MSTATUS_SPIE) >> 4;
    cpu.csr
        .write_raw(CSR_SSTATUS, (sstatus & !MSTATUS_SIE) | spie);
    cpu.csr.set_bits(CSR_SSTATUS, MSTATUS_SPIE);
    cpu.csr.clear_bits(CSR_SSTATUS, MSTATUS_SPP);

    cpu.icache.invalidate_all();
    Ok(())
}

fn mret(cpu: &mut Cpu) -> Result<(), Exception> {
    if cpu.mode != Mode::Machine {
        return Err(Exception::IllegalInstruction(cpu.instr.raw as u64));
    }
    cpu.pc = cpu.csr.read_raw(CSR_MEPC);

    let mstatus = cpu.csr.read_raw(CSR_MSTATUS);
    cpu.mode = Mode::from_bits((mstatus & MSTATUS_MPP) >> 11);
    // MIE <= MPIE, MPIE <= 1, MPP <= U.
    let mpie = (mstatus & MSTATUS_MPIE) >> 4;
    cpu.csr
        .write_raw(CSR_MSTATUS, (mstatus & !MSTATUS_MIE) | mpie);
    cpu.csr.set_bits(CSR_MSTATUS, MSTATUS_MPIE);
    cpu.csr.clear_bits(CSR_MSTATUS, MSTATUS_MPP);

    cpu.icache.invalidate_all();
    Ok(())
}

fn sfence_vma(cpu: &mut Cpu) -> Result<(), Exception> {
    if cpu.mode == Mode::User {
        return Err(Exception::IllegalInstruction(cpu.instr.raw as u64));
    }
    if cpu.instr.rs1 == 0 {
        cpu.icache.invalidate_all();
    } else {
        let vaddr = rs1(cpu);
        cpu.icache.invalidate_addr(vaddr);
    }
    Ok(())
}

// --- Zicsr -----------------------------------------------------------------

#[inline]
fn csr_addr(cpu: &Cpu) -> u16 {
    (cpu.instr.imm & 0xfff) as u16
}

fn csrrw(cpu: &mut Cpu) -> Result<(), Exception> {
    let addr = csr_addr(cpu);
    let old = cpu.csr.read(addr, cpu.mode)?;
    cpu.csr.write(addr, rs1(cpu), cpu.mode)?;
    cpu.xreg[rd(cpu)] = old;
    Ok(())
}

fn csrrs(cpu: &mut Cpu) -> Result<(), Exception> {
    let addr = csr_addr(cpu);
    let old = cpu.csr.read(addr, cpu.mode)?;
    if cpu.instr.rs1 != 0 {
        cpu.csr.write(addr, old | rs1(cpu), cpu.mode)?;
    }
    cpu.xreg[rd(cpu)] = old;
    Ok(())
}

fn csrrc(cpu: &mut Cpu) -> Result<(), Exception> {
    let addr = csr_addr(cpu);
    let old = cpu.csr.read(addr, cpu.mode)?;
    if cpu.instr.rs1 != 0 {
        cpu.csr.write(addr, old & !rs1(cpu), cpu.mode)?;
    }
    cpu.xreg[rd(cpu)] = old;
    Ok(())
}

fn csrrwi(cpu: &mut Cpu) -> Result<(), Exception> {
    let addr = csr_addr(cpu);
    let zimm = cpu.instr.rs1 as u64;
    let old = cpu.csr.read(addr, cpu.mode)?;
    cpu.csr.write(addr, zimm, cpu.mode)?;
    cpu.xreg[rd(cpu)] = old;
    Ok(())
}

fn csrrsi(cpu: &mut Cpu) -> Result<(), Exception> {
    let addr = csr_addr(cpu);
    let zimm = cpu.instr.rs1 as u64;
    let old = cpu.csr.read(addr, cpu.mode)?;
    if zimm != 0 {
        cpu.csr.write(addr, old | zimm, cpu.mode)?;
    }
    cpu.xreg[rd(cpu)] = old;
    Ok(())
}

fn csrrci(cpu: &mut Cpu) -> Result<(), Exception> {
    let addr = csr_addr(cpu);
    let zimm = cpu.instr.rs1 as u64;
    let old = cpu.csr.read(addr, cpu.mode)?;
    if zimm != 0 {
        cpu.csr.write(addr, old & !zimm, cpu.mode)?;
    }
    cpu.xreg[rd(cpu)] = old;
    Ok(())
}

// --- A extension -----------------------------------------------------------

fn lr(cpu: &mut Cpu, bus: &mut SystemBus, size: u8) -> Result<(), Exception> {
    let addr = rs1(cpu);
    let value = cpu.read(bus, addr, size)?;
    cpu.xreg[rd(cpu)] = if size == 32 {
        value as i32 as i64 as u64
    } else {
        value
    };
    cpu.reservation = Some(addr);
    Ok(())
}

fn sc(cpu: &mut Cpu, bus: &mut SystemBus, size: u8) -> Result<(), Exception> {
    let addr = rs1(cpu);
    if cpu.reservation == Some(addr) {
        cpu.write(bus, addr, size, rs2(cpu))?;
        cpu.xreg[rd(cpu)] = 0;
    } else {
        cpu.xreg[rd(cpu)] = 1;
    }
    // The reservation dies with the SC, successful or not.
    cpu.reservation = None;
    Ok(())
}

fn amo(
    cpu: &mut Cpu,
    bus: &mut SystemBus,
    size: u8,
    op: fn(u64, u64) -> u64,
) -> Result<(), Exception> {
    let addr = rs1(cpu);
    let old = cpu.read(bus, addr, size)?;
    let old = if size == 32 {
        old as i32 as i64 as u64
    } else {
        old
    };
    cpu.write(bus, addr, size, op(old, rs2(cpu)))?;
    cpu.xreg[rd(cpu)] = old;
    Ok(())
}

// --- C extension, quadrant 0 ----------------------------------------------

fn c_addi4spn(cpu: &mut Cpu) -> Result<(), Exception> {
    let raw = cpu.instr.raw as u64;
    // nzuimm[5:4|9:6|2|3] = inst[12:11|10:7|6|5]
    let nzuimm =
        ((raw >> 1) & 0x3c0) | ((raw >> 7) & 0x30) | ((raw >> 2) & 0x8) | ((raw >> 4) & 0x4);
    if nzuimm != 0 {
        cpu.xreg[rd(cpu)] = cpu.xreg[2].wrapping_add(nzuimm);
    }
    Ok(())
}

/// offset[5:3|2|6] = inst[12:10|6|5], for C.LW/C.SW.
fn c_word_offset(raw: u64) -> u64 {
    ((raw >> 7) & 0x38) | ((raw << 1) & 0x40) | ((raw >> 4) & 0x4)
}

/// offset[5:3|7:6] = inst[12:10|6:5], for C.LD/C.SD/C.FSD.
fn c_double_offset(raw: u64) -> u64 {
    ((raw >> 7) & 0x38) | ((raw << 1) & 0xc0)
}

fn c_lw(cpu: &mut Cpu, bus: &mut SystemBus) -> Result<(), Exception> {
    let addr = rs1(cpu).wrapping_add(c_word_offset(cpu.instr.raw as u64));
    let value = cpu.read(bus, addr, 32)?;
    cpu.xreg[rd(cpu)] = value as i32 as i64 as u64;
    Ok(())
}

fn c_ld(cpu: &mut Cpu, bus: &mut SystemBus) -> Result<(), Exception> {
    let addr = rs1(cpu).wrapping_add(c_double_offset(cpu.instr.raw as u64));
    let value = cpu.read(bus, addr, 64)?;
    cpu.xreg[rd(cpu)] = value;
    Ok(())
}

fn c_fsd(cpu: &mut Cpu, bus: &mut SystemBus) -> Result<(), Exception> {
    let addr = rs1(cpu).wrapping_add(c_double_offset(cpu.instr.raw as u64));
    let value = cpu.freg[cpu.instr.rs2 as usize];
    cpu.write(bus, addr, 64, value)
}

fn c_sw(cpu: &mut Cpu, bus: &mut SystemBus) -> Result<(), Exception> {
    let addr = rs1(cpu).wrapping_add(c_word_offset(cpu.instr.raw as u64));
    cpu.write(bus, addr, 32, rs2(cpu))
}

fn c_sd(cpu: &mut Cpu, bus: &mut SystemBus) -> Result<(), Exception> {
    let addr = rs1(cpu).wrapping_add(c_double_offset(cpu.instr.raw as u64));
    cpu.write(bus, addr, 64, rs2(cpu))
}

// --- C extension, quadrant 1 ----------------------------------------------

/// imm[5|4:0] = inst[12|6:2], sign-extended.
fn c_imm6(raw: u64) -> u64 {
    let imm = ((raw >> 7) & 0x20) | ((raw >> 2) & 0x1f);
    if imm & 0x20 != 0 {
        imm | !0x3f
    } else {
        imm
    }
}

/// shamt[5|4:0] = inst[12|6:2], unsigned.
fn c_shamt(raw: u64) -> u64 {
    ((raw >> 7) & 0x20) | ((raw >> 2) & 0x1f)
}

fn c_addi(cpu: &mut Cpu) -> Result<(), Exception> {
    let nzimm = c_imm6(cpu.instr.raw as u64);
    if cpu.instr.rd != 0 && nzimm != 0 {
        cpu.xreg[rd(cpu)] = cpu.xreg[rd(cpu)].wrapping_add(nzimm);
    }
    Ok(())
}

fn c_addiw(cpu: &mut Cpu) -> Result<(), Exception> {
    let imm = c_imm6(cpu.instr.raw as u64);
    if cpu.instr.rd != 0 {
        let value = (cpu.xreg[rd(cpu)] as u32).wrapping_add(imm as u32);
        cpu.xreg[rd(cpu)] = value as i32 as i64 as u64;
    }
    Ok(())
}

fn c_li(cpu: &mut Cpu) -> Result<(), Exception> {
    if cpu.instr.rd != 0 {
        cpu.xreg[rd(cpu)] = c_imm6(cpu.instr.raw as u64);
    }
    Ok(())
}

fn c_lui_addi16sp(cpu: &mut Cpu) -> Result<(), Exception> {
    let raw = cpu.instr.raw as u64;
    let rd = cpu.instr.rd;
    if rd != 0 && rd != 2 {
        // C.LUI: nzimm[17|16:12] = inst[12|6:2]
        let mut nzimm = ((raw << 5) & 0x2_0000) | ((raw << 10) & 0x1_f000);
        if nzimm & 0x2_0000 != 0 {
            nzimm |= !0x3_ffff;
        }
        if nzimm != 0 {
            cpu.xreg[rd as usize] = nzimm;
        }
    } else if rd == 2 {
        // C.ADDI16SP: nzimm[9|4|6|8:7|5] = inst[12|6|5|4:3|2]
        let mut nzimm = ((raw >> 3) & 0x200)
            | ((raw >> 2) & 0x10)
            | ((raw << 1) & 0x40)
            | ((raw << 4) & 0x180)
            | ((raw << 3) & 0x20);
        if nzimm & 0x200 != 0 {
            nzimm |= !0x3ff;
        }
        if nzimm != 0 {
            cpu.xreg[2] = cpu.xreg[2].wrapping_add(nzimm);
        }
    }
    Ok(())
}

fn c_srli(cpu: &mut Cpu) -> Result<(), Exception> {
    let shamt = c_shamt(cpu.instr.raw as u64);
    if shamt != 0 {
        cpu.xreg[rd(cpu)] >>= shamt;
    }
    Ok(())
}

fn c_srai(cpu: &mut Cpu) -> Result<(), Exception> {
    let shamt = c_shamt(cpu.instr.raw as u64);
    if shamt != 0 {
        cpu.xreg[rd(cpu)] = ((cpu.xreg[rd(cpu)] as i64) >> shamt) as u64;
    }
    Ok(())
}

fn c_andi(cpu: &mut Cpu) -> Result<(), Exception> {
    cpu.xreg[rd(cpu)] &= c_imm6(cpu.instr.raw as u64);
    Ok(())
}

fn c_sub(cpu: &mut Cpu) -> Result<(), Exception> {
    cpu.xreg[rd(cpu)] = cpu.xreg[rd(cpu)].wrapping_sub(rs2(cpu));
    Ok(())
}

fn c_xor(cpu: &mut Cpu) -> Result<(), Exception> {
    cpu.xreg[rd(cpu)] ^= rs2(cpu);
    Ok(())
}

fn c_or(cpu: &mut Cpu) -> Result<(), Exception> {
    cpu.xreg[rd(cpu)] |= rs2(cpu);
    Ok(())
}

fn c_and(cpu: &mut Cpu) -> Result<(), Exception> {
    cpu.xreg[rd(cpu)] &= rs2(cpu);
    Ok(())
}

fn c_subw(cpu: &mut Cpu) -> Result<(), Exception> {
    let value = (cpu.xreg[rd(cpu)] as u32).wrapping_sub(rs2(cpu) as u32);
    cpu.xreg[rd(cpu)] = value as i32 as i64 as u64;
    Ok(())
}

fn c_addw(cpu: &mut Cpu) -> Result<(), Exception> {
    let value = (cpu.xreg[rd(cpu)] as u32).wrapping_add(rs2(cpu) as u32);
    cpu.xreg[rd(cpu)] = value as i32 as i64 as u64;
    Ok(())
}

fn c_j(cpu: &mut Cpu) -> Result<(), Exception> {
    let mut imm = cpu.instr.imm;
    if imm & 0x800 != 0 {
        imm |= !0xfff;
    }
    cpu.pc = rel_target(cpu, imm);
    Ok(())
}

fn c_branch(cpu: &mut Cpu, on_zero: bool) -> Result<(), Exception> {
    let raw = cpu.instr.raw as u64;
    // imm[8|4:3|7:6|2:1|5] = inst[12|11:10|6:5|4:3|2]
    let mut imm = ((raw >> 4) & 0x100)
        | ((raw << 1) & 0xc0)
        | ((raw << 3) & 0x20)
        | ((raw >> 7) & 0x18)
        | ((raw >> 2) & 0x6);
    if imm & 0x100 != 0 {
        imm |= !0x1ff;
    }
    let taken = (rs1(cpu) == 0) == on_zero;
    if taken {
        cpu.pc = rel_target(cpu, imm);
    }
    Ok(())
}

// --- C extension, quadrant 2 ----------------------------------------------

fn c_slli(cpu: &mut Cpu) -> Result<(), Exception> {
    let shamt = c_shamt(cpu.instr.raw as u64);
    if shamt != 0 {
        cpu.xreg[rd(cpu)] <<= shamt;
    }
    Ok(())
}

fn c_lwsp(cpu: &mut Cpu, bus: &mut SystemBus) -> Result<(), Exception> {
    let raw = cpu.instr.raw as u64;
    // offset[5|4:2|7:6] = inst[12|6:4|3:2]
    let offset = ((raw << 4) & 0xc0) | ((raw >> 7) & 0x20) | ((raw >> 2) & 0x1c);
    let value = cpu.read(bus, cpu.xreg[2].wrapping_add(offset), 32)?;
    if cpu.instr.rd != 0 {
        cpu.xreg[rd(cpu)] = value as i32 as i64 as u64;
    }
    Ok(())
}

fn c_ldsp(cpu: &mut Cpu, bus: &mut SystemBus) -> Result<(), Exception> {
    let raw = cpu.instr.raw as u64;
    // offset[5|4:3|8:6] = inst[12|6:5|4:2]
    let offset = ((raw << 4) & 0x1c0) | ((raw >> 7) & 0x20) | ((raw >> 2) & 0x18);
    let value = cpu.read(bus, cpu.xreg[2].wrapping_add(offset), 64)?;
    if cpu.instr.rd != 0 {
        cpu.xreg[rd(cpu)] = value;
    }
    Ok(())
}

fn c_jr_mv(cpu: &mut Cpu) -> Result<(), Exception> {
    if cpu.instr.rs2 == 0 {
        // C.JR is only valid when rs1 != x0.
        if cpu.instr.rs1 == 0 {
            return Err(Exception::IllegalInstruction(cpu.instr.raw as u64));
        }
        cpu.pc = rs1(cpu);
    } else {
        cpu.xreg[rd(cpu)] = rs2(cpu);
    }
    Ok(())
}

fn c_ebreak_jalr_add(cpu: &mut Cpu) -> Result<(), Exception> {
    if cpu.instr.rs2 == 0 {
        if cpu.instr.rs1 == 0 {
            return Err(Exception::Breakpoint(
                cpu.pc.wrapping_sub(cpu.instr.len as u64),
            ));
        }
        // C.JALR
        let link = cpu.pc;
        cpu.pc = rs1(cpu);
        cpu.xreg[1] = link;
    } else {
        cpu.xreg[rd(cpu)] = cpu.xreg[rd(cpu)].wrapping_add(rs2(cpu));
    }
    Ok(())
}

fn c_swsp(cpu: &mut Cpu, bus: &mut SystemBus) -> Result<(), Exception> {
    let raw = cpu.instr.raw as u64;
    // offset[5:2|7:6] = inst[12:9|8:7]
    let offset = ((raw >> 1) & 0xc0) | ((raw >> 7) & 0x3c);
    cpu.write(bus, cpu.xreg[2].wrapping_add(offset), 32, rs2(cpu))
}

fn c_sdsp(cpu: &mut Cpu, bus: &mut SystemBus) -> Result<(), Exception> {
    let raw = cpu.instr.raw as u64;
    // offset[5:3|8:6] = inst[12:10|9:7]
    let offset = ((raw >> 1) & 0x1c0) | ((raw >> 7) & 0x38);
    cpu.write(bus, cpu.xreg[2].wrapping_add(offset), 64, rs2(cpu))
}
