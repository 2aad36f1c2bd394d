//! Machine-code value layer: relocatable code packages and the aggregate
//! assembler buffer they are linked into.
//!
//! A function-body compiler (or the stub generator) produces a
//! [`CompiledCode`]: raw bytes plus parallel record vectors whose offsets
//! are relative to the package's own byte 0. The generator appends packages
//! into one [`MasmBuffer`] and shifts every record by the placement offset.
//! Offsets are stable once written; the buffer never relocates code it has
//! already emitted.
//!
//! Real instruction encodings are a function-compiler concern. The buffer
//! only commits to the few byte sequences link editing itself must patch:
//! near-call displacements, far-jump slots, and the TLS reload emitted in
//! trap and debug islands.

mod buffer;
mod compiled;
mod records;

pub use buffer::MasmBuffer;
pub use compiled::CompiledCode;
pub use records::{
    CallFarJump, CallSite, CallSiteKind, CallSiteTarget, CodeLabel, CodeRange, CodeRangeKind,
    FuncOffsets, MemoryAccess, MemoryAccessKind, Offsets, PatchHandle, SymbolicAccess,
    SymbolicAddress, Trap, TrapFarJump,
};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MasmError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MasmError {
    #[error("out of memory while growing the code buffer")]
    OutOfMemory,

    #[error("code buffer exceeds the maximum module code size")]
    CodeTooLarge,
}

/// Required alignment for the start of every appended code package.
pub const CODE_ALIGNMENT: u32 = 16;

/// Fill byte for alignment padding: a halt instruction, so control flow
/// falling into padding faults instead of sliding.
pub const HALT_FILL: u8 = 0xCC;

/// Conservative reach of a direct-call displacement, sized for the
/// shortest-range supported ISA class (±128 MiB).
pub const JUMP_IMMEDIATE_RANGE: u32 = 1 << 27;

/// Marker bytes opening a far-jump sequence; the 4 bytes that follow are the
/// patchable little-endian target slot.
pub const FAR_JUMP_MARKER: [u8; 4] = [0xFF, 0x25, 0x00, 0x00];

/// Byte length of a far-jump sequence (marker + target slot).
pub const FAR_JUMP_LEN: u32 = FAR_JUMP_MARKER.len() as u32 + 4;

/// Canned sequence reloading the TLS base pointer from its frame slot.
/// Trap-exit and debug islands must emit this before far-jumping.
pub const TLS_RELOAD_SEQ: [u8; 4] = [0x48, 0x8B, 0x6D, 0x10];
