//! Table-driven x86 instruction decoder used by the IEM recompiler.
//!
//! The decoder recognises the full legacy/REX prefix grammar and the one-,
//! two- and three-byte opcode maps well enough to compute instruction length
//! and operand shape for any encoding. Only a subset of opcodes is assigned a
//! semantic [`InstClass`]; the rest decode as [`InstClass::Unsupported`] so the
//! caller can hand them to a slower path with a correct length.

mod decoder;
mod inst;
pub mod opcode_tables;

pub use decoder::decode;
pub use inst::*;

/// Architectural upper bound on x86 instruction length.
pub const MAX_INST_LEN: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The byte stream ended before the instruction could be fully decoded.
    #[error("unexpected end of instruction bytes")]
    UnexpectedEof,
    /// The encoding would exceed the 15-byte length limit.
    #[error("instruction exceeds 15-byte length limit")]
    TooLong,
    /// The encoding is undefined for the requested mode.
    #[error("invalid instruction")]
    Invalid,
}
