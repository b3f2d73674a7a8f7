//! Architectural trap causes and the host-side classification of a taken
//! trap.

/// Synchronous exceptions, with the value that lands in `mtval`/`stval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    InstructionAddressMisaligned(u64),
    InstructionAccessFault(u64),
    IllegalInstruction(u64),
    Breakpoint(u64),
    LoadAddressMisaligned(u64),
    LoadAccessFault(u64),
    StoreAmoAddressMisaligned(u64),
    StoreAmoAccessFault(u64),
    EnvironmentCallFromU(u64),
    EnvironmentCallFromS(u64),
    EnvironmentCallFromM(u64),
    InstructionPageFault(u64),
    LoadPageFault(u64),
    StoreAmoPageFault(u64),
}

impl Exception {
    /// Cause code as written to `mcause`/`scause`.
    pub fn cause(&self) -> u64 {
        match self {
            Exception::InstructionAddressMisaligned(_) => 0,
            Exception::InstructionAccessFault(_) => 1,
            Exception::IllegalInstruction(_) => 2,
            Exception::Breakpoint(_) => 3,
            Exception::LoadAddressMisaligned(_) => 4,
            Exception::LoadAccessFault(_) => 5,
            Exception::StoreAmoAddressMisaligned(_) => 6,
            Exception::StoreAmoAccessFault(_) => 7,
            Exception::EnvironmentCallFromU(_) => 8,
            Exception::EnvironmentCallFromS(_) => 9,
            Exception::EnvironmentCallFromM(_) => 11,
            Exception::InstructionPageFault(_) => 12,
            Exception::LoadPageFault(_) => 13,
            Exception::StoreAmoPageFault(_) => 15,
        }
    }

    /// Trap value (faulting address, offending instruction word, …).
    pub fn value(&self) -> u64 {
        match *self {
            Exception::InstructionAddressMisaligned(v)
            | Exception::InstructionAccessFault(v)
            | Exception::IllegalInstruction(v)
            | Exception::Breakpoint(v)
            | Exception::LoadAddressMisaligned(v)
            | Exception::LoadAccessFault(v)
            | Exception::StoreAmoAddressMisaligned(v)
            | Exception::StoreAmoAccessFault(v)
            | Exception::EnvironmentCallFromU(v)
            | Exception::EnvironmentCallFromS(v)
            | Exception::EnvironmentCallFromM(v)
            | Exception::InstructionPageFault(v)
            | Exception::LoadPageFault(v)
            | Exception::StoreAmoPageFault(v) => v,
        }
    }
}

impl std::fmt::Display for Exception {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Exception {}

/// Asynchronous interrupt causes. The discriminants are the architectural
/// cause codes (the interrupt bit is added at delivery time).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    SupervisorSoftware = 1,
    MachineSoftware = 3,
    SupervisorTimer = 5,
    MachineTimer = 7,
    SupervisorExternal = 9,
    MachineExternal = 11,
}

impl Interrupt {
    pub fn cause(&self) -> u64 {
        *self as u64
    }
}

/// Host-side classification of a taken trap, decided after the architectural
/// trap entry has already updated the CSRs and redirected the pc.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trap {
    /// The emulator cannot meaningfully continue; dump state and exit.
    Fatal(Exception),
    /// The guest asked for the trap (breakpoint, environment call); the
    /// handler runs and the loop continues.
    Requested(Exception),
    /// Routine paging traffic; the handler runs and nothing is logged.
    Invisible(Exception),
}

impl Trap {
    /// Classify an exception after its handler has been entered.
    pub fn classify(exc: Exception) -> Trap {
        match exc {
            Exception::InstructionAddressMisaligned(_)
            | Exception::InstructionAccessFault(_)
            | Exception::IllegalInstruction(_)
            | Exception::LoadAddressMisaligned(_)
            | Exception::LoadAccessFault(_)
            | Exception::StoreAmoAddressMisaligned(_)
            | Exception::StoreAmoAccessFault(_) => Trap::Fatal(exc),
            Exception::Breakpoint(_)
            | Exception::EnvironmentCallFromU(_)
            | Exception::EnvironmentCallFromS(_)
            | Exception::EnvironmentCallFromM(_) => Trap::Requested(exc),
            Exception::InstructionPageFault(_)
            | Exception::LoadPageFault(_)
            | Exception::StoreAmoPageFault(_) => Trap::Invisible(exc),
        }
    }
}
