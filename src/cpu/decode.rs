//! Instruction decode.
//!
//! Dispatch is hierarchical: the opcode selects an entry in the primary
//! table; an entry either terminates in an [`Operation`] or forwards to a
//! child table keyed by funct3, funct7, funct5, rs2, the FP width field, or
//! one of the compressed funct groups. Entries carry an optional format
//! helper that unpacks register numbers and immediates into the canonical
//! decoded form on the way down. A miss at any level is an illegal
//! instruction.

use super::trap::Exception;

/// Executor selector produced by decode. A plain value, so the decoded form
/// stays `Copy` and cacheable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Illegal,
    // RV64I loads/stores
    Lb, Lh, Lw, Ld, Lbu, Lhu, Lwu,
    Sb, Sh, Sw, Sd,
    // FP store placeholders
    Fsw, Fsd,
    // Fences
    Fence, FenceI,
    // OP-IMM
    Addi, Slli, Slti, Sltiu, Xori, Srli, Srai, Ori, Andi,
    // OP
    Add, Sub, Sll, Slt, Sltu, Xor, Srl, Sra, Or, And,
    Mul, Mulh, Mulhsu, Mulhu, Div, Divu, Rem, Remu,
    // U/J
    Lui, Auipc, Jal, Jalr,
    // OP-IMM-32 / OP-32
    Addiw, Slliw, Srliw, Sraiw,
    Addw, Subw, Sllw, Srlw, Sraw,
    Mulw, Divw, Divuw, Remw, Remuw,
    // Branches
    Beq, Bne, Blt, Bge, Bltu, Bgeu,
    // SYSTEM
    Ecall, Ebreak, Sret, Mret, Wfi, SfenceVma, HfenceBvma, HfenceGvma,
    Csrrw, Csrrs, Csrrc, Csrrwi, Csrrsi, Csrrci,
    // A extension, word
    LrW, ScW, AmoswapW, AmoaddW, AmoxorW, AmoorW, AmoandW,
    AmominW, AmomaxW, AmominuW, AmomaxuW,
    // A extension, doubleword
    LrD, ScD, AmoswapD, AmoaddD, AmoxorD, AmoorD, AmoandD,
    AmominD, AmomaxD, AmominuD, AmomaxuD,
    // C extension, quadrant 0
    Caddi4spn, Clw, Cld, Cfsd, Csw, Csd,
    // C extension, quadrant 1
    Caddi, Caddiw, Cli, CluiAddi16sp,
    Csrli, Csrai, Candi, Csub, Cxor, Cor, Cand, Csubw, Caddw,
    Cj, Cbeqz, Cbnez,
    // C extension, quadrant 2
    Cslli, Clwsp, Cldsp, CjrMv, CebreakJalrAdd, Cswsp, Csdsp,
}

/// Canonical decoded form of the instruction currently executing.
#[derive(Debug, Clone, Copy)]
pub struct Instr {
    pub raw: u32,
    pub opcode: u8,
    pub rd: u8,
    pub rs1: u8,
    pub rs2: u8,
    pub funct2: u8,
    pub funct3: u8,
    pub funct4: u8,
    pub funct6: u8,
    pub funct7: u8,
    /// FP width field for the STORE-FP opcode.
    pub width: u8,
    /// Sign-extended immediate (CSR ops keep the zero-extended CSR address).
    pub imm: u64,
    /// Instruction length in bytes: 2 or 4.
    pub len: u8,
    pub op: Operation,
}

impl Instr {
    pub fn new(raw: u32, len: u8) -> Self {
        let opcode = if len == 2 {
            (raw & 0x3) as u8
        } else {
            (raw & 0x7f) as u8
        };
        Self {
            raw,
            opcode,
            rd: 0,
            rs1: 0,
            rs2: 0,
            funct2: 0,
            funct3: 0,
            funct4: 0,
            funct6: 0,
            funct7: 0,
            width: 0,
            imm: 0,
            len,
            op: Operation::Illegal,
        }
    }
}

/// How a table derives its index from the decoded fields.
#[derive(Debug, Clone, Copy)]
enum IndexBy {
    Opcode,
    Funct3,
    Funct7,
    /// funct7 >> 1: splits SRLI/SRAI without consuming the shamt bit.
    Funct7Shift,
    /// funct7 >> 2: the A-extension funct5.
    Funct5,
    /// funct6 & 0b11: quadrant-1 CB/CA group.
    Funct6Low,
    /// funct4 & 0b1: quadrant-2 CR group.
    Funct4Low,
    /// (funct6 & 0b100) | funct2: quadrant-1 CA arithmetic selector.
    Funct2Group,
    Rs2,
    Width,
}

impl IndexBy {
    fn index(self, i: &Instr) -> u8 {
        match self {
            IndexBy::Opcode => i.opcode,
            IndexBy::Funct3 => i.funct3,
            IndexBy::Funct7 => i.funct7,
            IndexBy::Funct7Shift => i.funct7 >> 1,
            IndexBy::Funct5 => i.funct7 >> 2,
            IndexBy::Funct6Low => i.funct6 & 0x3,
            IndexBy::Funct4Low => i.funct4 & 0x1,
            IndexBy::Funct2Group => (i.funct6 & 0x4) | i.funct2,
            IndexBy::Rs2 => i.rs2,
            IndexBy::Width => i.width,
        }
    }
}

type FormatFn = fn(&mut Instr);

#[derive(Clone, Copy)]
struct Entry {
    format: Option<FormatFn>,
    op: Option<Operation>,
    next: Option<&'static Table>,
}

impl Entry {
    const fn op(op: Operation) -> Self {
        Entry { format: None, op: Some(op), next: None }
    }
    const fn fop(format: FormatFn, op: Operation) -> Self {
        Entry { format: Some(format), op: Some(op), next: None }
    }
    const fn table(next: &'static Table) -> Self {
        Entry { format: None, op: None, next: Some(next) }
    }
    const fn ftable(format: FormatFn, next: &'static Table) -> Self {
        Entry { format: Some(format), op: None, next: Some(next) }
    }
}

struct Table {
    index_by: IndexBy,
    entries: &'static [(u8, Entry)],
}

impl Table {
    fn lookup(&self, i: &Instr) -> Option<&Entry> {
        let idx = self.index_by.index(i);
        self.entries
            .iter()
            .find(|(key, _)| *key == idx)
            .map(|(_, e)| e)
    }
}

/// Decode the raw word in `instr` into register fields, immediate and an
/// operation selector.
pub fn decode(instr: &mut Instr) -> Result<(), Exception> {
    let mut table = &OPCODE_TABLE;
    loop {
        let entry = table
            .lookup(instr)
            .ok_or(Exception::IllegalInstruction(instr.raw as u64))?;
        if let Some(format) = entry.format {
            format(instr);
        }
        match (entry.next, entry.op) {
            (Some(next), _) => table = next,
            (None, Some(op)) => {
                instr.op = op;
                return Ok(());
            }
            (None, None) => {
                return Err(Exception::IllegalInstruction(instr.raw as u64))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Format helpers (32-bit encodings)
// ---------------------------------------------------------------------------

fn r_format(i: &mut Instr) {
    let raw = i.raw;
    i.rd = ((raw >> 7) & 0x1f) as u8;
    i.funct3 = ((raw >> 12) & 0x7) as u8;
    i.rs1 = ((raw >> 15) & 0x1f) as u8;
    i.rs2 = ((raw >> 20) & 0x1f) as u8;
    i.funct7 = ((raw >> 25) & 0x7f) as u8;
}

fn i_format(i: &mut Instr) {
    let raw = i.raw;
    i.rd = ((raw >> 7) & 0x1f) as u8;
    i.funct3 = ((raw >> 12) & 0x7) as u8;
    i.rs1 = ((raw >> 15) & 0x1f) as u8;
    // Kept for the SRLI/SRAI and ECALL-group splits.
    i.rs2 = ((raw >> 20) & 0x1f) as u8;
    i.funct7 = ((raw >> 25) & 0x7f) as u8;
    i.imm = ((raw as i32) >> 20) as i64 as u64;
}

fn s_format(i: &mut Instr) {
    let raw = i.raw;
    i.funct3 = ((raw >> 12) & 0x7) as u8;
    i.rs1 = ((raw >> 15) & 0x1f) as u8;
    i.rs2 = ((raw >> 20) & 0x1f) as u8;
    let imm = (((raw as i32) >> 25) as i64) << 5 | (((raw >> 7) & 0x1f) as i64);
    i.imm = imm as u64;
}

fn b_format(i: &mut Instr) {
    let raw = i.raw;
    i.funct3 = ((raw >> 12) & 0x7) as u8;
    i.rs1 = ((raw >> 15) & 0x1f) as u8;
    i.rs2 = ((raw >> 20) & 0x1f) as u8;
    let imm = (((raw as i32) >> 31) as i64) << 12
        | (((raw >> 25) & 0x3f) as i64) << 5
        | (((raw >> 8) & 0xf) as i64) << 1
        | (((raw >> 7) & 0x1) as i64) << 11;
    i.imm = imm as u64;
}

fn u_format(i: &mut Instr) {
    i.rd = ((i.raw >> 7) & 0x1f) as u8;
    i.imm = (i.raw & 0xffff_f000) as i32 as i64 as u64;
}

fn j_format(i: &mut Instr) {
    let raw = i.raw;
    i.rd = ((raw >> 7) & 0x1f) as u8;
    let imm = (((raw as i32) >> 31) as i64) << 20
        | (((raw >> 21) & 0x3ff) as i64) << 1
        | (((raw >> 20) & 0x1) as i64) << 11
        | (((raw >> 12) & 0xff) as i64) << 12;
    i.imm = imm as u64;
}

/// STORE-FP: S-type immediate plus the width field selecting FSW/FSD.
fn fs_format(i: &mut Instr) {
    s_format(i);
    i.width = ((i.raw >> 12) & 0x7) as u8;
}

/// SYSTEM: I-type registers with a zero-extended CSR address.
fn csr_format(i: &mut Instr) {
    let raw = i.raw;
    i.rd = ((raw >> 7) & 0x1f) as u8;
    i.funct3 = ((raw >> 12) & 0x7) as u8;
    i.rs1 = ((raw >> 15) & 0x1f) as u8;
    i.rs2 = ((raw >> 20) & 0x1f) as u8;
    i.funct7 = ((raw >> 25) & 0x7f) as u8;
    i.imm = ((raw >> 20) & 0xfff) as u64;
}

// ---------------------------------------------------------------------------
// Format helpers (compressed encodings)
// ---------------------------------------------------------------------------

/// Shared pre-decode for all three compressed quadrants.
fn cx_format(i: &mut Instr) {
    let raw = i.raw;
    i.funct3 = ((raw >> 13) & 0x7) as u8;
    i.funct4 = ((raw >> 12) & 0xf) as u8;
    i.funct6 = ((raw >> 10) & 0x3f) as u8;
    i.funct2 = ((raw >> 5) & 0x3) as u8;
}

fn ciw_format(i: &mut Instr) {
    i.rd = (((i.raw >> 2) & 0x7) + 8) as u8;
}

fn cl_format(i: &mut Instr) {
    i.rd = (((i.raw >> 2) & 0x7) + 8) as u8;
    i.rs1 = (((i.raw >> 7) & 0x7) + 8) as u8;
}

fn cs_format(i: &mut Instr) {
    i.rs2 = (((i.raw >> 2) & 0x7) + 8) as u8;
    i.rs1 = (((i.raw >> 7) & 0x7) + 8) as u8;
}

fn ci_format(i: &mut Instr) {
    i.rd = ((i.raw >> 7) & 0x1f) as u8;
    i.rs1 = i.rd;
}

fn css_format(i: &mut Instr) {
    i.rs2 = ((i.raw >> 2) & 0x1f) as u8;
}

/// C.J keeps its unpacked (not yet sign-extended) displacement in `imm`.
fn cj_format(i: &mut Instr) {
    let raw = i.raw as u64;
    i.imm = ((raw >> 1) & 0x800)
        | ((raw << 2) & 0x400)
        | ((raw >> 1) & 0x300)
        | ((raw << 1) & 0x80)
        | ((raw >> 1) & 0x40)
        | ((raw << 3) & 0x20)
        | ((raw >> 7) & 0x10)
        | ((raw >> 2) & 0xe);
}

fn cb_format(i: &mut Instr) {
    i.rs1 = (((i.raw >> 7) & 0x7) + 8) as u8;
    i.rd = i.rs1;
}

fn cr_format(i: &mut Instr) {
    i.rd = ((i.raw >> 7) & 0x1f) as u8;
    i.rs1 = i.rd;
    i.rs2 = ((i.raw >> 2) & 0x1f) as u8;
}

fn ca_format(i: &mut Instr) {
    i.rd = (((i.raw >> 7) & 0x7) + 8) as u8;
    i.rs1 = i.rd;
    i.rs2 = (((i.raw >> 2) & 0x7) + 8) as u8;
}

// ---------------------------------------------------------------------------
// Dispatch tables
// ---------------------------------------------------------------------------

use Operation::*;

static LOAD_TABLE: Table = Table {
    index_by: IndexBy::Funct3,
    entries: &[
        (0x0, Entry::op(Lb)),
        (0x1, Entry::op(Lh)),
        (0x2, Entry::op(Lw)),
        (0x3, Entry::op(Ld)),
        (0x4, Entry::op(Lbu)),
        (0x5, Entry::op(Lhu)),
        (0x6, Entry::op(Lwu)),
    ],
};

static FENCE_TABLE: Table = Table {
    index_by: IndexBy::Funct3,
    entries: &[(0x0, Entry::op(Fence)), (0x1, Entry::op(FenceI))],
};

static SRLI_SRAI_TABLE: Table = Table {
    index_by: IndexBy::Funct7Shift,
    entries: &[(0x00, Entry::op(Srli)), (0x10, Entry::op(Srai))],
};

static OP_IMM_TABLE: Table = Table {
    index_by: IndexBy::Funct3,
    entries: &[
        (0x0, Entry::op(Addi)),
        (0x1, Entry::op(Slli)),
        (0x2, Entry::op(Slti)),
        (0x3, Entry::op(Sltiu)),
        (0x4, Entry::op(Xori)),
        (0x5, Entry::table(&SRLI_SRAI_TABLE)),
        (0x6, Entry::op(Ori)),
        (0x7, Entry::op(Andi)),
    ],
};

static ADD_MUL_SUB_TABLE: Table = Table {
    index_by: IndexBy::Funct7,
    entries: &[
        (0x00, Entry::op(Add)),
        (0x01, Entry::op(Mul)),
        (0x20, Entry::op(Sub)),
    ],
};

static SLL_MULH_TABLE: Table = Table {
    index_by: IndexBy::Funct7,
    entries: &[(0x00, Entry::op(Sll)), (0x01, Entry::op(Mulh))],
};

static SLT_MULHSU_TABLE: Table = Table {
    index_by: IndexBy::Funct7,
    entries: &[(0x00, Entry::op(Slt)), (0x01, Entry::op(Mulhsu))],
};

static SLTU_MULHU_TABLE: Table = Table {
    index_by: IndexBy::Funct7,
    entries: &[(0x00, Entry::op(Sltu)), (0x01, Entry::op(Mulhu))],
};

static XOR_DIV_TABLE: Table = Table {
    index_by: IndexBy::Funct7,
    entries: &[(0x00, Entry::op(Xor)), (0x01, Entry::op(Div))],
};

static SRL_DIVU_SRA_TABLE: Table = Table {
    index_by: IndexBy::Funct7,
    entries: &[
        (0x00, Entry::op(Srl)),
        (0x01, Entry::op(Divu)),
        (0x20, Entry::op(Sra)),
    ],
};

static OR_REM_TABLE: Table = Table {
    index_by: IndexBy::Funct7,
    entries: &[(0x00, Entry::op(Or)), (0x01, Entry::op(Rem))],
};

static AND_REMU_TABLE: Table = Table {
    index_by: IndexBy::Funct7,
    entries: &[(0x00, Entry::op(And)), (0x01, Entry::op(Remu))],
};

static OP_TABLE: Table = Table {
    index_by: IndexBy::Funct3,
    entries: &[
        (0x0, Entry::table(&ADD_MUL_SUB_TABLE)),
        (0x1, Entry::table(&SLL_MULH_TABLE)),
        (0x2, Entry::table(&SLT_MULHSU_TABLE)),
        (0x3, Entry::table(&SLTU_MULHU_TABLE)),
        (0x4, Entry::table(&XOR_DIV_TABLE)),
        (0x5, Entry::table(&SRL_DIVU_SRA_TABLE)),
        (0x6, Entry::table(&OR_REM_TABLE)),
        (0x7, Entry::table(&AND_REMU_TABLE)),
    ],
};

static SRLIW_SRAIW_TABLE: Table = Table {
    index_by: IndexBy::Funct7,
    entries: &[(0x00, Entry::op(Srliw)), (0x20, Entry::op(Sraiw))],
};

static OP_IMM32_TABLE: Table = Table {
    index_by: IndexBy::Funct3,
    entries: &[
        (0x0, Entry::op(Addiw)),
        (0x1, Entry::op(Slliw)),
        (0x5, Entry::table(&SRLIW_SRAIW_TABLE)),
    ],
};

static ADDW_MULW_SUBW_TABLE: Table = Table {
    index_by: IndexBy::Funct7,
    entries: &[
        (0x00, Entry::op(Addw)),
        (0x01, Entry::op(Mulw)),
        (0x20, Entry::op(Subw)),
    ],
};

static SLLW_TABLE: Table = Table {
    index_by: IndexBy::Funct7,
    entries: &[(0x00, Entry::op(Sllw))],
};

static DIVW_TABLE: Table = Table {
    index_by: IndexBy::Funct7,
    entries: &[(0x01, Entry::op(Divw))],
};

static SRLW_DIVUW_SRAW_TABLE: Table = Table {
    index_by: IndexBy::Funct7,
    entries: &[
        (0x00, Entry::op(Srlw)),
        (0x01, Entry::op(Divuw)),
        (0x20, Entry::op(Sraw)),
    ],
};

static REMW_TABLE: Table = Table {
    index_by: IndexBy::Funct7,
    entries: &[(0x01, Entry::op(Remw))],
};

static REMUW_TABLE: Table = Table {
    index_by: IndexBy::Funct7,
    entries: &[(0x01, Entry::op(Remuw))],
};

static OP32_TABLE: Table = Table {
    index_by: IndexBy::Funct3,
    entries: &[
        (0x0, Entry::table(&ADDW_MULW_SUBW_TABLE)),
        (0x1, Entry::table(&SLLW_TABLE)),
        (0x4, Entry::table(&DIVW_TABLE)),
        (0x5, Entry::table(&SRLW_DIVUW_SRAW_TABLE)),
        (0x6, Entry::table(&REMW_TABLE)),
        (0x7, Entry::table(&REMUW_TABLE)),
    ],
};

static STORE_TABLE: Table = Table {
    index_by: IndexBy::Funct3,
    entries: &[
        (0x0, Entry::op(Sb)),
        (0x1, Entry::op(Sh)),
        (0x2, Entry::op(Sw)),
        (0x3, Entry::op(Sd)),
    ],
};

static STORE_FP_TABLE: Table = Table {
    index_by: IndexBy::Width,
    entries: &[(0x2, Entry::op(Fsw)), (0x3, Entry::op(Fsd))],
};

static BRANCH_TABLE: Table = Table {
    index_by: IndexBy::Funct3,
    entries: &[
        (0x0, Entry::op(Beq)),
        (0x1, Entry::op(Bne)),
        (0x4, Entry::op(Blt)),
        (0x5, Entry::op(Bge)),
        (0x6, Entry::op(Bltu)),
        (0x7, Entry::op(Bgeu)),
    ],
};

static ECALL_EBREAK_TABLE: Table = Table {
    index_by: IndexBy::Rs2,
    entries: &[(0x0, Entry::op(Ecall)), (0x1, Entry::op(Ebreak))],
};

static SRET_WFI_TABLE: Table = Table {
    index_by: IndexBy::Rs2,
    entries: &[(0x2, Entry::op(Sret)), (0x5, Entry::op(Wfi))],
};

static RET_TABLE: Table = Table {
    index_by: IndexBy::Funct7,
    entries: &[
        (0x00, Entry::table(&ECALL_EBREAK_TABLE)),
        (0x08, Entry::table(&SRET_WFI_TABLE)),
        (0x09, Entry::op(SfenceVma)),
        (0x11, Entry::op(HfenceBvma)),
        (0x18, Entry::op(Mret)),
        (0x51, Entry::op(HfenceGvma)),
    ],
};

static SYSTEM_TABLE: Table = Table {
    index_by: IndexBy::Funct3,
    entries: &[
        (0x0, Entry::table(&RET_TABLE)),
        (0x1, Entry::op(Csrrw)),
        (0x2, Entry::op(Csrrs)),
        (0x3, Entry::op(Csrrc)),
        (0x5, Entry::op(Csrrwi)),
        (0x6, Entry::op(Csrrsi)),
        (0x7, Entry::op(Csrrci)),
    ],
};

static AMO_W_TABLE: Table = Table {
    index_by: IndexBy::Funct5,
    entries: &[
        (0x00, Entry::op(AmoaddW)),
        (0x01, Entry::op(AmoswapW)),
        (0x02, Entry::op(LrW)),
        (0x03, Entry::op(ScW)),
        (0x04, Entry::op(AmoxorW)),
        (0x08, Entry::op(AmoorW)),
        (0x0c, Entry::op(AmoandW)),
        (0x10, Entry::op(AmominW)),
        (0x14, Entry::op(AmomaxW)),
        (0x18, Entry::op(AmominuW)),
        (0x1c, Entry::op(AmomaxuW)),
    ],
};

static AMO_D_TABLE: Table = Table {
    index_by: IndexBy::Funct5,
    entries: &[
        (0x00, Entry::op(AmoaddD)),
        (0x01, Entry::op(AmoswapD)),
        (0x02, Entry::op(LrD)),
        (0x03, Entry::op(ScD)),
        (0x04, Entry::op(AmoxorD)),
        (0x08, Entry::op(AmoorD)),
        (0x0c, Entry::op(AmoandD)),
        (0x10, Entry::op(AmominD)),
        (0x14, Entry::op(AmomaxD)),
        (0x18, Entry::op(AmominuD)),
        (0x1c, Entry::op(AmomaxuD)),
    ],
};

static ATOMIC_TABLE: Table = Table {
    index_by: IndexBy::Funct3,
    entries: &[
        (0x2, Entry::table(&AMO_W_TABLE)),
        (0x3, Entry::table(&AMO_D_TABLE)),
    ],
};

static C0_TABLE: Table = Table {
    index_by: IndexBy::Funct3,
    entries: &[
        (0x0, Entry::fop(ciw_format, Caddi4spn)),
        (0x2, Entry::fop(cl_format, Clw)),
        (0x3, Entry::fop(cl_format, Cld)),
        (0x5, Entry::fop(cs_format, Cfsd)),
        (0x6, Entry::fop(cs_format, Csw)),
        (0x7, Entry::fop(cs_format, Csd)),
    ],
};

static CA_TABLE: Table = Table {
    index_by: IndexBy::Funct2Group,
    entries: &[
        (0x0, Entry::op(Csub)),
        (0x1, Entry::op(Cxor)),
        (0x2, Entry::op(Cor)),
        (0x3, Entry::op(Cand)),
        (0x4, Entry::op(Csubw)),
        (0x5, Entry::op(Caddw)),
    ],
};

static CB_CA_TABLE: Table = Table {
    index_by: IndexBy::Funct6Low,
    entries: &[
        (0x0, Entry::fop(cb_format, Csrli)),
        (0x1, Entry::fop(cb_format, Csrai)),
        (0x2, Entry::fop(cb_format, Candi)),
        (0x3, Entry::ftable(ca_format, &CA_TABLE)),
    ],
};

static C1_TABLE: Table = Table {
    index_by: IndexBy::Funct3,
    entries: &[
        (0x0, Entry::fop(ci_format, Caddi)),
        (0x1, Entry::fop(ci_format, Caddiw)),
        (0x2, Entry::fop(ci_format, Cli)),
        (0x3, Entry::fop(ci_format, CluiAddi16sp)),
        (0x4, Entry::table(&CB_CA_TABLE)),
        (0x5, Entry::fop(cj_format, Cj)),
        (0x6, Entry::fop(cb_format, Cbeqz)),
        (0x7, Entry::fop(cb_format, Cbnez)),
    ],
};

static CR_TABLE: Table = Table {
    index_by: IndexBy::Funct4Low,
    entries: &[
        (0x0, Entry::op(CjrMv)),
        (0x1, Entry::op(CebreakJalrAdd)),
    ],
};

static C2_TABLE: Table = Table {
    index_by: IndexBy::Funct3,
    entries: &[
        (0x0, Entry::fop(ci_format, Cslli)),
        (0x2, Entry::fop(ci_format, Clwsp)),
        (0x3, Entry::fop(ci_format, Cldsp)),
        (0x4, Entry::ftable(cr_format, &CR_TABLE)),
        (0x6, Entry::fop(css_format, Cswsp)),
        (0x7, Entry::fop(css_format, Csdsp)),
    ],
};

static OPCODE_TABLE: Table = Table {
    index_by: IndexBy::Opcode,
    entries: &[
        (0x00, Entry::ftable(cx_format, &C0_TABLE)),
        (0x01, Entry::ftable(cx_format, &C1_TABLE)),
        (0x02, Entry::ftable(cx_format, &C2_TABLE)),
        (0x03, Entry::ftable(i_format, &LOAD_TABLE)),
        (0x0f, Entry::ftable(i_format, &FENCE_TABLE)),
        (0x13, Entry::ftable(i_format, &OP_IMM_TABLE)),
        (0x17, Entry::fop(u_format, Auipc)),
        (0x1b, Entry::ftable(i_format, &OP_IMM32_TABLE)),
        (0x23, Entry::ftable(s_format, &STORE_TABLE)),
        (0x27, Entry::ftable(fs_format, &STORE_FP_TABLE)),
        (0x2f, Entry::ftable(r_format, &ATOMIC_TABLE)),
        (0x33, Entry::ftable(r_format, &OP_TABLE)),
        (0x37, Entry::fop(u_format, Lui)),
        (0x3b, Entry::ftable(r_format, &OP32_TABLE)),
        (0x63, Entry::ftable(b_format, &BRANCH_TABLE)),
        (0x67, Entry::fop(i_format, Jalr)),
        (0x6f, Entry::fop(j_format, Jal)),
        (0x73, Entry::ftable(csr_format, &SYSTEM_TABLE)),
    ],
};
