//! Table-driven i386 instruction classifier.
//!
//! Covers the one-byte opcode map, the commonly used part of the two-byte
//! (`0F xx`) map and the legacy prefixes. Only lengths and control-flow
//! classes are computed; operands are never interpreted.

use super::{ControlAction, DecodeError, Decoder, Instruction, MAX_INSTRUCTION_LEN};

/// Immediate operand kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Imm {
    None,
    /// 8-bit
    Ib,
    /// 16-bit
    Iw,
    /// 16 or 32-bit depending on the operand-size prefix
    Iz,
    /// far pointer: offset (Iz) + 16-bit selector
    Ap,
    /// ENTER: imm16 + imm8
    Enter,
    /// absolute memory offset, sized by the address-size prefix
    Moffs,
}

#[derive(Debug, Clone, Copy)]
struct OpInfo {
    modrm: bool,
    imm: Imm,
    action: ControlAction,
}

impl OpInfo {
    const fn plain() -> Self {
        Self { modrm: false, imm: Imm::None, action: ControlAction::None }
    }

    const fn modrm() -> Self {
        Self { modrm: true, imm: Imm::None, action: ControlAction::None }
    }

    const fn imm(imm: Imm) -> Self {
        Self { modrm: false, imm, action: ControlAction::None }
    }

    const fn modrm_imm(imm: Imm) -> Self {
        Self { modrm: true, imm, action: ControlAction::None }
    }

    const fn control(imm: Imm, action: ControlAction) -> Self {
        Self { modrm: false, imm, action }
    }
}

fn one_byte(op: u8) -> Option<OpInfo> {
    use ControlAction as A;

    let info = match op {
        0x0F => return None,
        // ALU block: Eb,Gb / Ev,Gv / Gb,Eb / Gv,Ev / AL,Ib / eAX,Iz / push-pop seg, BCD adjust
        0x00..=0x3F => match op & 0x07 {
            0..=3 => OpInfo::modrm(),
            4 => OpInfo::imm(Imm::Ib),
            5 => OpInfo::imm(Imm::Iz),
            _ => OpInfo::plain(),
        },
        0x40..=0x61 => OpInfo::plain(),
        0x62 | 0x63 => OpInfo::modrm(),
        0x68 => OpInfo::imm(Imm::Iz),
        0x69 => OpInfo::modrm_imm(Imm::Iz),
        0x6A => OpInfo::imm(Imm::Ib),
        0x6B => OpInfo::modrm_imm(Imm::Ib),
        0x6C..=0x6F => OpInfo::plain(),
        0x70..=0x7F => OpInfo::control(Imm::Ib, A::JumpConditional),
        0x80 | 0x82 | 0x83 => OpInfo::modrm_imm(Imm::Ib),
        0x81 => OpInfo::modrm_imm(Imm::Iz),
        0x84..=0x8F => OpInfo::modrm(),
        0x90..=0x99 => OpInfo::plain(),
        0x9A => OpInfo::control(Imm::Ap, A::JumpFar),
        0x9B..=0x9F => OpInfo::plain(),
        0xA0..=0xA3 => OpInfo::imm(Imm::Moffs),
        0xA4..=0xA7 => OpInfo::plain(),
        0xA8 => OpInfo::imm(Imm::Ib),
        0xA9 => OpInfo::imm(Imm::Iz),
        0xAA..=0xAF => OpInfo::plain(),
        0xB0..=0xB7 => OpInfo::imm(Imm::Ib),
        0xB8..=0xBF => OpInfo::imm(Imm::Iz),
        0xC0 | 0xC1 => OpInfo::modrm_imm(Imm::Ib),
        0xC2 => OpInfo::control(Imm::Iw, A::ReturnCleanup),
        0xC3 => OpInfo::control(Imm::None, A::Return),
        0xC4 | 0xC5 => OpInfo::modrm(),
        0xC6 => OpInfo::modrm_imm(Imm::Ib),
        0xC7 => OpInfo::modrm_imm(Imm::Iz),
        0xC8 => OpInfo::imm(Imm::Enter),
        0xC9 => OpInfo::plain(),
        0xCA => OpInfo::control(Imm::Iw, A::ReturnCleanup),
        0xCB => OpInfo::control(Imm::None, A::Return),
        0xCC => OpInfo::control(Imm::None, A::Join),
        0xCD => OpInfo::control(Imm::Ib, A::Join),
        0xCE => OpInfo::control(Imm::None, A::Join),
        0xCF => OpInfo::control(Imm::None, A::Return),
        0xD0..=0xD3 => OpInfo::modrm(),
        0xD4 | 0xD5 => OpInfo::imm(Imm::Ib),
        0xD6 | 0xD7 => OpInfo::plain(),
        0xD8..=0xDF => OpInfo::modrm(),
        0xE0..=0xE3 => OpInfo::control(Imm::Ib, A::Loop),
        0xE4..=0xE7 => OpInfo::imm(Imm::Ib),
        0xE8 => OpInfo::control(Imm::Iz, A::CallRelative),
        0xE9 => OpInfo::control(Imm::Iz, A::JumpRelative),
        0xEA => OpInfo::control(Imm::Ap, A::JumpFar),
        0xEB => OpInfo::control(Imm::Ib, A::JumpRelative),
        0xEC..=0xEF => OpInfo::plain(),
        0xF1 => OpInfo::control(Imm::None, A::Join),
        0xF4 | 0xF5 => OpInfo::plain(),
        // TEST has an immediate only for /0 and /1, fixed up after ModR/M
        0xF6 | 0xF7 => OpInfo::modrm(),
        0xF8..=0xFD => OpInfo::plain(),
        0xFE | 0xFF => OpInfo::modrm(),
        // prefixes are consumed before the opcode lookup
        _ => return None,
    };
    Some(info)
}

fn two_byte(op: u8) -> Option<OpInfo> {
    use ControlAction as A;

    let info = match op {
        0x0B => OpInfo::control(Imm::None, A::Join), // UD2
        0x34 => OpInfo::control(Imm::None, A::Join), // SYSENTER
        0x80..=0x8F => OpInfo::control(Imm::Iz, A::JumpConditional),
        0x70..=0x73 | 0xA4 | 0xAC | 0xBA | 0xC2 | 0xC4..=0xC6 => OpInfo::modrm_imm(Imm::Ib),
        0x10..=0x1F
        | 0x28..=0x2F
        | 0x40..=0x6F
        | 0x74..=0x76
        | 0x7E
        | 0x7F
        | 0x90..=0x9F
        | 0xA3
        | 0xA5
        | 0xAB
        | 0xAD
        | 0xAE
        | 0xAF
        | 0xB0
        | 0xB1
        | 0xB3
        | 0xB6
        | 0xB7
        | 0xBB..=0xBF
        | 0xC0
        | 0xC1
        | 0xC7
        | 0xD0..=0xFE => OpInfo::modrm(),
        0x31 | 0x77 | 0xA0..=0xA2 | 0xA8 | 0xA9 | 0xC8..=0xCF => OpInfo::plain(),
        _ => return None,
    };
    Some(info)
}

/// Bounded reader over the instruction bytes.
struct Cursor<'a> {
    bytes: &'a [u8],
    limit: usize,
    max: usize,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8], max_len: usize) -> Self {
        Self {
            bytes,
            limit: max_len.min(bytes.len()),
            max: max_len,
            pos: 0,
        }
    }

    fn next(&mut self) -> Result<u8, DecodeError> {
        if self.pos >= MAX_INSTRUCTION_LEN {
            return Err(DecodeError::Cutoff);
        }
        if self.pos >= self.limit {
            return Err(DecodeError::Overrun {
                needed: self.pos + 1,
                max: self.max,
            });
        }
        let b = self.bytes[self.pos];
        self.pos += 1;
        Ok(b)
    }
}

/// Extra bytes following a ModR/M byte (SIB and displacement).
fn modrm_tail(cur: &mut Cursor<'_>, modrm: u8, addr16: bool) -> Result<usize, DecodeError> {
    let mode = modrm >> 6;
    let rm = modrm & 0x07;

    if mode == 0b11 {
        return Ok(0);
    }

    if addr16 {
        return Ok(match mode {
            0b00 if rm == 0b110 => 2,
            0b00 => 0,
            0b01 => 1,
            _ => 2,
        });
    }

    let mut base_is_disp32 = rm == 0b101;
    if rm == 0b100 {
        let sib = cur.next()?;
        base_is_disp32 = sib & 0x07 == 0b101;
    }

    Ok(match mode {
        0b00 if base_is_disp32 => 4,
        0b00 => 0,
        0b01 => 1,
        _ => 4,
    })
}

/// Default classifier for 32-bit protected-mode code.
#[derive(Debug, Clone, Copy, Default)]
pub struct I386Decoder;

impl Decoder for I386Decoder {
    fn decode(&self, bytes: &[u8], max_len: usize) -> Result<Instruction, DecodeError> {
        let mut cur = Cursor::new(bytes, max_len);
        let mut segment = None;
        let mut opsize16 = false;
        let mut addr16 = false;

        let op = loop {
            match cur.next()? {
                b @ (0x26 | 0x2E | 0x36 | 0x3E | 0x64 | 0x65) => segment = Some(b),
                0x66 => opsize16 = true,
                0x67 => addr16 = true,
                0xF0 | 0xF2 | 0xF3 => {}
                b => break b,
            }
        };

        let (info, opcode) = if op == 0x0F {
            let op2 = cur.next()?;
            let info = two_byte(op2).ok_or(DecodeError::Invalid {
                opcode: 0x0F00 | u16::from(op2),
            })?;
            (info, 0x0F00 | u16::from(op2))
        } else {
            let info = one_byte(op).ok_or(DecodeError::Invalid {
                opcode: u16::from(op),
            })?;
            (info, u16::from(op))
        };

        let mrm = cur.pos;
        let mut action = info.action;
        let mut imm_kind = info.imm;
        let mut tail = 0;

        if info.modrm {
            let modrm = cur.next()?;
            let reg = (modrm >> 3) & 0x07;
            match opcode {
                0xF6 if reg < 2 => imm_kind = Imm::Ib,
                0xF7 if reg < 2 => imm_kind = Imm::Iz,
                0xFE if reg > 1 => return Err(DecodeError::Invalid { opcode }),
                0xFF => {
                    action = match reg {
                        2 => ControlAction::CallIndirect,
                        3 | 5 => ControlAction::JumpFar,
                        4 => ControlAction::JumpIndirect,
                        7 => return Err(DecodeError::Invalid { opcode }),
                        _ => ControlAction::None,
                    }
                }
                _ => {}
            }
            tail = modrm_tail(&mut cur, modrm, addr16)?;
        }

        let iz = if opsize16 { 2 } else { 4 };
        let imm_len = match imm_kind {
            Imm::None => 0,
            Imm::Ib => 1,
            Imm::Iw => 2,
            Imm::Iz => iz,
            Imm::Ap => iz + 2,
            Imm::Enter => 3,
            Imm::Moffs => {
                if addr16 {
                    2
                } else {
                    4
                }
            }
        };

        let imm = cur.pos + tail;
        let len = imm + imm_len;
        if len > MAX_INSTRUCTION_LEN {
            return Err(DecodeError::Cutoff);
        }
        if len > cur.limit {
            return Err(DecodeError::Overrun { needed: len, max: max_len });
        }

        Ok(Instruction {
            len,
            action,
            mrm,
            imm,
            segment,
            opsize16,
            addr16,
            has_modrm: info.modrm,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(bytes: &[u8]) -> Instruction {
        I386Decoder.decode(bytes, bytes.len()).unwrap()
    }

    #[test]
    fn test_nop() {
        let i = decode(&[0x90]);
        assert_eq!(i.len, 1);
        assert_eq!(i.action, ControlAction::None);
        assert!(!i.action.is_control());
    }

    #[test]
    fn test_relative_jumps() {
        let i = decode(&[0xE9, 0, 0, 0, 0]);
        assert_eq!((i.len, i.mrm, i.imm), (5, 1, 1));
        assert_eq!(i.action, ControlAction::JumpRelative);

        let i = decode(&[0xEB, 0xFE]);
        assert_eq!((i.len, i.imm_len()), (2, 1));
        assert_eq!(i.action, ControlAction::JumpRelative);

        let i = decode(&[0xE8, 0, 0, 0, 0]);
        assert_eq!(i.action, ControlAction::CallRelative);
    }

    #[test]
    fn test_conditional_jumps() {
        let i = decode(&[0x74, 0x10]);
        assert_eq!(i.action, ControlAction::JumpConditional);
        assert_eq!(i.opcode(&[0x74, 0x10]) & 0x0f, 0x4);

        let bytes = [0x0F, 0x85, 0x10, 0, 0, 0];
        let i = decode(&bytes);
        assert_eq!((i.len, i.mrm, i.imm), (6, 2, 2));
        assert_eq!(i.opcode(&bytes) & 0x0f, 0x5);
        assert_eq!(i.action, ControlAction::JumpConditional);
    }

    #[test]
    fn test_loops() {
        for op in 0xE0..=0xE3 {
            let i = decode(&[op, 0xFE]);
            assert_eq!(i.action, ControlAction::Loop);
            assert_eq!(i.len, 2);
        }
        // address-size prefix selects CX
        let i = decode(&[0x67, 0xE2, 0x00]);
        assert_eq!((i.len, i.mrm, i.imm), (3, 2, 2));
    }

    #[test]
    fn test_indirect_forms() {
        // jmp *0x44332211
        let i = decode(&[0xFF, 0x25, 0x11, 0x22, 0x33, 0x44]);
        assert_eq!(i.action, ControlAction::JumpIndirect);
        assert_eq!((i.len, i.mrm), (6, 1));

        // call *0x44332211
        let i = decode(&[0xFF, 0x15, 0x11, 0x22, 0x33, 0x44]);
        assert_eq!(i.action, ControlAction::CallIndirect);

        // jmp *0x11223344(%eax,%ebx,8)
        let i = decode(&[0xFF, 0xA4, 0xD8, 0x44, 0x33, 0x22, 0x11]);
        assert_eq!(i.action, ControlAction::JumpIndirect);
        assert_eq!(i.len, 7);

        // jmp *%ecx
        let i = decode(&[0xFF, 0xE1]);
        assert_eq!((i.len, i.action), (2, ControlAction::JumpIndirect));

        // jmp *%gs:0x10
        let i = decode(&[0x65, 0xFF, 0x25, 0x10, 0, 0, 0]);
        assert_eq!(i.segment, Some(0x65));
        assert_eq!((i.len, i.mrm), (7, 2));
        assert!(!i.addr16 && !i.opsize16);

        // jmp *0x1234(%bx)
        let i = decode(&[0x67, 0xFF, 0xA7, 0x34, 0x12]);
        assert_eq!(i.action, ControlAction::JumpIndirect);
        assert!(i.addr16);
        assert_eq!((i.len, i.mrm), (5, 2));

        // jmpw *(%eax)
        let i = decode(&[0x66, 0xFF, 0x20]);
        assert!(i.opsize16 && !i.addr16);
        assert_eq!(i.len, 3);

        // ljmp *(%eax)
        let i = decode(&[0xFF, 0x28]);
        assert_eq!(i.action, ControlAction::JumpFar);
    }

    #[test]
    fn test_modrm_sizes() {
        // mov %eax,(%ebx)
        assert_eq!(decode(&[0x89, 0x03]).len, 2);
        // mov %eax,0x10(%ebp)
        assert_eq!(decode(&[0x89, 0x45, 0x10]).len, 3);
        // mov %eax,0x1000(%ebp)
        assert_eq!(decode(&[0x89, 0x85, 0, 0x10, 0, 0]).len, 6);
        // mov %eax,(%esp)
        assert_eq!(decode(&[0x89, 0x04, 0x24]).len, 3);
        // mov %eax,0x0(,%ecx,4)  (SIB with no base)
        assert_eq!(decode(&[0x89, 0x04, 0x8D, 0, 0, 0, 0]).len, 7);
        // 16-bit addressing: mov %ax,0x1234
        assert_eq!(decode(&[0x67, 0x89, 0x06, 0x34, 0x12]).len, 5);
    }

    #[test]
    fn test_immediates() {
        // add $0x12345678,%eax
        assert_eq!(decode(&[0x05, 0x78, 0x56, 0x34, 0x12]).len, 5);
        // add $0x1234,%ax
        assert_eq!(decode(&[0x66, 0x05, 0x34, 0x12]).len, 4);
        // movl $imm32,0x10(%ebx)
        let i = decode(&[0xC7, 0x43, 0x10, 1, 2, 3, 4]);
        assert_eq!((i.len, i.imm), (7, 3));
        // test $1,%al via F6 /0 and neg via F6 /3
        assert_eq!(decode(&[0xF6, 0xC0, 0x01]).len, 3);
        assert_eq!(decode(&[0xF6, 0xD8]).len, 2);
        // enter $0x10,$0
        assert_eq!(decode(&[0xC8, 0x10, 0x00, 0x00]).len, 4);
        // mov 0x11223344,%eax
        assert_eq!(decode(&[0xA1, 0x44, 0x33, 0x22, 0x11]).len, 5);
        // ljmp $0x23,$0x11223344
        let i = decode(&[0xEA, 0x44, 0x33, 0x22, 0x11, 0x23, 0x00]);
        assert_eq!((i.len, i.action), (7, ControlAction::JumpFar));
    }

    #[test]
    fn test_returns_and_joins() {
        assert_eq!(decode(&[0xC3]).action, ControlAction::Return);
        assert_eq!(decode(&[0xC2, 0x08, 0x00]).action, ControlAction::ReturnCleanup);
        assert_eq!(decode(&[0xCD, 0x80]).action, ControlAction::Join);
        assert_eq!(decode(&[0x0F, 0x34]).action, ControlAction::Join);
    }

    #[test]
    fn test_two_byte_plain() {
        // movzbl (%eax),%ecx
        assert_eq!(decode(&[0x0F, 0xB6, 0x08]).len, 3);
        // cpuid
        assert_eq!(decode(&[0x0F, 0xA2]).len, 2);
        // pshufd $0x1b,%xmm1,%xmm0 (with 66 prefix)
        assert_eq!(decode(&[0x66, 0x0F, 0x70, 0xC1, 0x1B]).len, 5);
    }

    #[test]
    fn test_overrun() {
        let err = I386Decoder.decode(&[0xE9, 0, 0, 0, 0], 3).unwrap_err();
        assert_eq!(err, DecodeError::Overrun { needed: 5, max: 3 });

        // shorter slice than the declared maximum
        let err = I386Decoder.decode(&[0x0F], 4).unwrap_err();
        assert!(matches!(err, DecodeError::Overrun { .. }));
    }

    #[test]
    fn test_cutoff() {
        let bytes = [0x66; 20];
        assert_eq!(I386Decoder.decode(&bytes, 20), Err(DecodeError::Cutoff));
    }

    #[test]
    fn test_invalid() {
        assert_eq!(
            I386Decoder.decode(&[0x0F, 0x04], 2),
            Err(DecodeError::Invalid { opcode: 0x0F04 })
        );
        assert_eq!(
            I386Decoder.decode(&[0xFF, 0xF8], 2),
            Err(DecodeError::Invalid { opcode: 0xFF })
        );
    }
}
