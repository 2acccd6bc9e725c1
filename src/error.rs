// Error taxonomy for the core. Guest-visible exceptions are NOT modeled as
// Rust errors (see cpu::Cpu::exception) -- they are raised by helpers that set
// the CPU's abort flag and return normally. This enum only covers host-side
// failures: recoverable translation failure, resource exhaustion, and fatal
// initialization failure.

use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("failed to compile block at {pc:#010x}: {reason}")]
    TranslationFailed { pc: u32, reason: String },

    #[error("code arena exhausted after {blocks_compiled} blocks")]
    ArenaExhausted { blocks_compiled: usize },

    #[error("failed to map executable code arena: {0}")]
    ArenaAllocation(String),

    #[error("fatal initialization failure: {0}")]
    Fatal(String),

    #[error("BIOS image at {path} could not be read: {source}")]
    BiosLoad { path: String, #[source] source: std::io::Error },

    #[error("PSX-EXE header at {path} is malformed: {reason}")]
    MalformedExecutable { path: String, reason: String },
}

pub type CoreResult<T> = Result<T, CoreError>;

/// The guest exception codes surfaced by helper calls. These are not host
/// errors -- they are staged into COP0 CAUSE by `Cpu::exception` and
/// consumed entirely inside the guest machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ExceptionCause {
    Interrupt = 0,
    AddressErrorLoad = 4,
    AddressErrorStore = 5,
    BusErrorInstruction = 6,
    Syscall = 8,
    Break = 9,
    CoprocessorUnusable = 11,
    Overflow = 12,
}

impl fmt::Display for ExceptionCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Interrupt => "Interrupt",
            Self::AddressErrorLoad => "AddressErrorLoad",
            Self::AddressErrorStore => "AddressErrorStore",
            Self::BusErrorInstruction => "BusErrorInstruction",
            Self::Syscall => "Syscall",
            Self::Break => "Break",
            Self::CoprocessorUnusable => "CoprocessorUnusable",
            Self::Overflow => "Overflow",
        };
        write!(f, "{}", name)
    }
}
