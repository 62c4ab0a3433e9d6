//! Instruction classification.
//!
//! The translator only needs to know where an instruction ends, whether it
//! transfers control, and where its ModR/M byte and trailing immediate live.
//! [`Decoder`] is the seam; [`I386Decoder`] is the table-driven classifier
//! used by default.

mod i386;

use serde::Serialize;
use thiserror::Error;

pub use i386::I386Decoder;

/// Architectural upper bound on the length of one instruction.
pub const MAX_INSTRUCTION_LEN: usize = 15;

/// Control-flow classification of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    /// Falls through to the next instruction.
    None,
    /// `Jcc rel8` / `Jcc rel32`
    JumpConditional,
    /// `LOOPNZ`, `LOOPZ`, `LOOP`, `JECXZ`
    Loop,
    /// `JMP rel8` / `JMP rel32`
    JumpRelative,
    /// `CALL rel32`
    CallRelative,
    /// `JMP r/m32`
    JumpIndirect,
    /// `CALL r/m32`
    CallIndirect,
    /// Far jumps and far calls.
    JumpFar,
    /// `RET`, `RETF`, `IRET`
    Return,
    /// `RET imm16`, `RETF imm16`
    ReturnCleanup,
    /// Instructions that must re-join the dispatcher (interrupts, `SYSENTER`, `UD2`).
    Join,
}

impl ControlAction {
    pub fn is_control(self) -> bool {
        self != ControlAction::None
    }
}

/// Descriptor of one decoded instruction. All offsets are relative to the
/// first byte of the instruction (including prefixes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Instruction {
    /// Total length in bytes.
    pub len: usize,
    pub action: ControlAction,
    /// Offset just past the opcode bytes; the ModR/M byte when present.
    pub mrm: usize,
    /// Offset of the trailing immediate or branch displacement (`len` when absent).
    pub imm: usize,
    /// Last segment-override prefix, if any.
    pub segment: Option<u8>,
    /// Operand-size override (`66`) present.
    pub opsize16: bool,
    /// Address-size override (`67`) present.
    pub addr16: bool,
    pub has_modrm: bool,
}

impl Instruction {
    /// Whether the field offsets are consistent with `len`: an opcode byte
    /// before `mrm`, `mrm <= imm <= len`, and room for the ModR/M byte when
    /// there is one.
    pub fn is_well_formed(&self) -> bool {
        self.mrm >= 1
            && self.mrm <= self.imm
            && self.imm <= self.len
            && (!self.has_modrm || self.mrm < self.imm)
    }

    /// Length of the trailing immediate field.
    pub fn imm_len(&self) -> usize {
        self.len - self.imm
    }

    /// The last opcode byte (the one carrying the condition code for `Jcc`).
    pub fn opcode(&self, bytes: &[u8]) -> u8 {
        bytes[self.mrm - 1]
    }

    /// Sign-extended value of the trailing immediate.
    pub fn imm_value(&self, bytes: &[u8]) -> i32 {
        let field = &bytes[self.imm..self.len];
        match field.len() {
            1 => field[0] as i8 as i32,
            2 => i16::from_le_bytes([field[0], field[1]]) as i32,
            4 => i32::from_le_bytes([field[0], field[1], field[2], field[3]]),
            _ => 0,
        }
    }

    /// Target of a relative branch located at guest address `addr`.
    pub fn relative_target(&self, bytes: &[u8], addr: u32) -> u32 {
        addr.wrapping_add(self.len as u32)
            .wrapping_add(self.imm_value(bytes) as u32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("instruction needs {needed} bytes but only {max} are available")]
    Overrun { needed: usize, max: usize },
    #[error("instruction longer than {MAX_INSTRUCTION_LEN} bytes")]
    Cutoff,
    #[error("unclassified opcode {opcode:#x}")]
    Invalid { opcode: u16 },
}

/// Classifies raw guest bytes into instruction descriptors.
pub trait Decoder {
    /// Decode the instruction starting at `bytes[0]`, reading at most `max_len` bytes.
    fn decode(&self, bytes: &[u8], max_len: usize) -> Result<Instruction, DecodeError>;
}

impl<D: Decoder + ?Sized> Decoder for &D {
    fn decode(&self, bytes: &[u8], max_len: usize) -> Result<Instruction, DecodeError> {
        (**self).decode(bytes, max_len)
    }
}

/// Decode a whole region front to back. Stops at the first error.
pub fn decode_all<D: Decoder>(
    decoder: &D,
    bytes: &[u8],
) -> Result<Vec<(usize, Instruction)>, (usize, DecodeError)> {
    let mut out = Vec::new();
    let mut off = 0;
    while off < bytes.len() {
        let instr = decoder
            .decode(&bytes[off..], bytes.len() - off)
            .map_err(|e| (off, e))?;
        out.push((off, instr));
        off += instr.len;
    }
    Ok(out)
}
