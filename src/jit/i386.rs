//! i386 instruction encoding for fragment code.
//!
//! Only the handful of encodings the fragment translator needs. Branch
//! helpers take absolute run-time targets and compute the relative
//! displacement from the buffer's current address.

use super::codebuf::CodeBuffer;

/// Length of an exit stub: `movl $imm32, cell` + `jmp *cell`.
pub const EXIT_STUB_LEN: usize = 16;

/// i386 condition codes (for Jcc).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    O = 0x0,  // Overflow
    No = 0x1, // Not overflow
    B = 0x2,  // Below (unsigned <)
    Ae = 0x3, // Above or equal (unsigned >=)
    E = 0x4,  // Equal
    Ne = 0x5, // Not equal
    Be = 0x6, // Below or equal (unsigned <=)
    A = 0x7,  // Above (unsigned >)
    S = 0x8,  // Sign (negative)
    Ns = 0x9, // Not sign (non-negative)
    P = 0xA,  // Parity even
    Np = 0xB, // Parity odd
    L = 0xC,  // Less (signed <)
    Ge = 0xD, // Greater or equal (signed >=)
    Le = 0xE, // Less or equal (signed <=)
    G = 0xF,  // Greater (signed >)
}

impl Cond {
    /// Condition encoded in the low nibble of a Jcc opcode byte.
    pub fn from_opcode(opcode: u8) -> Self {
        match opcode & 0x0f {
            0x0 => Cond::O,
            0x1 => Cond::No,
            0x2 => Cond::B,
            0x3 => Cond::Ae,
            0x4 => Cond::E,
            0x5 => Cond::Ne,
            0x6 => Cond::Be,
            0x7 => Cond::A,
            0x8 => Cond::S,
            0x9 => Cond::Ns,
            0xA => Cond::P,
            0xB => Cond::Np,
            0xC => Cond::L,
            0xD => Cond::Ge,
            0xE => Cond::Le,
            _ => Cond::G,
        }
    }

    /// Invert the condition.
    pub fn invert(self) -> Self {
        Cond::from_opcode(self as u8 ^ 1)
    }
}

/// i386 assembler over a [`CodeBuffer`].
pub struct I386Assembler<'a, 'b> {
    buf: &'a mut CodeBuffer<'b>,
}

impl<'a, 'b> I386Assembler<'a, 'b> {
    pub fn new(buf: &'a mut CodeBuffer<'b>) -> Self {
        Self { buf }
    }

    /// Current emission offset.
    pub fn offset(&self) -> usize {
        self.buf.offset()
    }

    /// Run-time address of the next emitted byte.
    pub fn here(&self) -> u32 {
        self.buf.here()
    }

    /// Copy bytes verbatim.
    pub fn raw(&mut self, bytes: &[u8]) {
        self.buf.emit_bytes(bytes);
    }

    pub fn patch_u8(&mut self, offset: usize, byte: u8) {
        self.buf.patch_u8(offset, byte);
    }

    fn rel32_to(&self, insn_len: u32, target: u32) -> u32 {
        target.wrapping_sub(self.buf.here().wrapping_add(insn_len))
    }

    // ==================== Control Flow ====================

    /// JMP rel32 to an absolute target.
    pub fn jmp_rel32_to(&mut self, target: u32) {
        let rel = self.rel32_to(5, target);
        self.buf.emit_u8(0xE9);
        self.buf.emit_u32(rel);
    }

    /// JMP rel8
    pub fn jmp_rel8(&mut self, disp: u8) {
        self.buf.emit_u8(0xEB);
        self.buf.emit_u8(disp);
    }

    /// Jcc rel32 to an absolute target.
    pub fn jcc_rel32_to(&mut self, cond: Cond, target: u32) {
        let rel = self.rel32_to(6, target);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x80 + cond as u8);
        self.buf.emit_u32(rel);
    }

    /// Jcc rel8
    pub fn jcc_rel8(&mut self, cond: Cond, disp: u8) {
        self.buf.emit_u8(0x70 + cond as u8);
        self.buf.emit_u8(disp);
    }

    /// JMP *moffs32 (`FF 25`)
    pub fn jmp_m32(&mut self, cell: u32) {
        self.buf.emit_u8(0xFF);
        self.buf.emit_u8(0x25);
        self.buf.emit_u32(cell);
    }

    // ==================== Data Movement ====================

    /// MOVL $imm32, moffs32 (`C7 05`)
    pub fn mov_m32_imm32(&mut self, cell: u32, imm: u32) {
        self.buf.emit_u8(0xC7);
        self.buf.emit_u8(0x05);
        self.buf.emit_u32(cell);
        self.buf.emit_u32(imm);
    }

    /// MOVL %eax, moffs32 (`A3`)
    pub fn mov_moffs32_eax(&mut self, cell: u32) {
        self.buf.emit_u8(0xA3);
        self.buf.emit_u32(cell);
    }

    /// MOVL moffs32, %eax (`A1`)
    pub fn mov_eax_moffs32(&mut self, cell: u32) {
        self.buf.emit_u8(0xA1);
        self.buf.emit_u32(cell);
    }

    // ==================== Sequences ====================

    /// Store `guest_addr` into the next-address cell and leave through the exit hook.
    pub fn exit_stub(&mut self, next_eip: u32, exit_hook: u32, guest_addr: u32) {
        self.mov_m32_imm32(next_eip, guest_addr);
        self.jmp_m32(exit_hook);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assemble(base: u32, f: impl FnOnce(&mut I386Assembler<'_, '_>)) -> Vec<u8> {
        let mut page = [0u8; 64];
        let mut buf = CodeBuffer::new(&mut page, base);
        let mut asm = I386Assembler::new(&mut buf);
        f(&mut asm);
        buf.code().to_vec()
    }

    #[test]
    fn test_cond_invert() {
        assert_eq!(Cond::E.invert(), Cond::Ne);
        assert_eq!(Cond::Ne.invert(), Cond::E);
        assert_eq!(Cond::O.invert(), Cond::No);
        assert_eq!(Cond::Le.invert(), Cond::G);
        assert_eq!(Cond::from_opcode(0x74), Cond::E);
        assert_eq!(Cond::from_opcode(0x8F), Cond::G);
    }

    #[test]
    fn test_jmp_rel32_to() {
        // JMP to 0x1015 from 0x1000: rel = 0x1015 - 0x1005
        let code = assemble(0x1000, |asm| asm.jmp_rel32_to(0x1015));
        assert_eq!(code, vec![0xE9, 0x10, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_jmp_rel32_backward() {
        let code = assemble(0x1000, |asm| asm.jmp_rel32_to(0x1000));
        assert_eq!(code, vec![0xE9, 0xFB, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_jcc_rel32_to() {
        // JE +16
        let code = assemble(0x1000, |asm| asm.jcc_rel32_to(Cond::E, 0x1016));
        assert_eq!(code, vec![0x0F, 0x84, 0x10, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_jcc_rel8() {
        let code = assemble(0, |asm| asm.jcc_rel8(Cond::Ne, 0x10));
        assert_eq!(code, vec![0x75, 0x10]);
    }

    #[test]
    fn test_jmp_rel8() {
        let code = assemble(0, |asm| asm.jmp_rel8(0x10));
        assert_eq!(code, vec![0xEB, 0x10]);
    }

    #[test]
    fn test_moves() {
        let code = assemble(0, |asm| {
            asm.mov_moffs32_eax(0x11223344);
            asm.mov_eax_moffs32(0x55667788);
        });
        assert_eq!(
            code,
            vec![0xA3, 0x44, 0x33, 0x22, 0x11, 0xA1, 0x88, 0x77, 0x66, 0x55]
        );
    }

    #[test]
    fn test_exit_stub() {
        let code = assemble(0, |asm| asm.exit_stub(0x1000, 0x2000, 0xCAFEBABE));
        assert_eq!(code.len(), EXIT_STUB_LEN);
        assert_eq!(
            code,
            vec![
                0xC7, 0x05, 0x00, 0x10, 0x00, 0x00, 0xBE, 0xBA, 0xFE, 0xCA, // movl
                0xFF, 0x25, 0x00, 0x20, 0x00, 0x00, // jmp *
            ]
        );
    }
}
