//! Fragment translator.
//!
//! Turns a straight-line region of guest code into code that can run
//! directly from a thread's fragment page. Non-control instructions are
//! copied verbatim. Control transfers either become a branch to the
//! translation of the target instruction (when the target lies inside the
//! region) or an exit stub that stores the guest resume address in the
//! thread's next-address cell and jumps through the fragment-exit hook.
//!
//! Translation is done in two passes over the same output page. The first
//! pass records where each guest instruction lands; forward branches are
//! emitted with provisional displacements. The second pass repeats the walk
//! and resolves every internal branch against that mapping. Emitted sizes
//! do not depend on the mapping, so both passes produce the same layout.

use log::{debug, trace};
use serde::Serialize;
use thiserror::Error;

use super::codebuf::CodeBuffer;
use super::i386::{Cond, EXIT_STUB_LEN, I386Assembler};
use super::listing;
use crate::config::TranslatorConfig;
use crate::decode::{ControlAction, DecodeError, Decoder, I386Decoder, Instruction};

/// Errors that make a region untranslatable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranslateError {
    #[error(
        "instruction at offset {offset} sticks out of fragment (needs {needed} bytes, {available} left)"
    )]
    InstructionOverrun {
        offset: usize,
        needed: usize,
        available: usize,
    },
    #[error("fragment too large: instruction at offset {offset} cut off")]
    Cutoff { offset: usize },
    #[error("undecodable opcode {opcode:#x} at offset {offset}")]
    Undecodable { offset: usize, opcode: u16 },
    #[error("fragment entry point {entry} not in translated code")]
    MissingEntry { entry: usize },
    #[error("unexpected control transfer {action:?} at offset {offset}")]
    UnsupportedControl { offset: usize, action: ControlAction },
    #[error("branch at offset {offset} targets offset {target}, which is not an instruction start")]
    MisalignedTarget { offset: usize, target: usize },
    #[error("generated code needs {needed} bytes, page holds {capacity}")]
    OutputOverflow { needed: usize, capacity: usize },
}

impl TranslateError {
    fn from_decode(offset: usize, err: DecodeError) -> Self {
        match err {
            DecodeError::Overrun { needed, max } => TranslateError::InstructionOverrun {
                offset,
                needed,
                available: max,
            },
            DecodeError::Cutoff => TranslateError::Cutoff { offset },
            DecodeError::Invalid { opcode } => TranslateError::Undecodable { offset, opcode },
        }
    }
}

/// Guest code to translate, together with its guest address.
#[derive(Debug, Clone, Copy)]
pub struct GuestRegion<'a> {
    pub bytes: &'a [u8],
    pub base: u32,
}

impl<'a> GuestRegion<'a> {
    pub fn new(bytes: &'a [u8], base: u32) -> Self {
        Self { bytes, base }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Guest address just past the region.
    pub fn end(&self) -> u32 {
        self.base.wrapping_add(self.bytes.len() as u32)
    }

    /// Offset of `addr` within the region if it lies in `[base, base + len]`.
    ///
    /// The end address counts as inside: it maps to the fallthrough stub.
    pub fn offset_of(&self, addr: u32) -> Option<usize> {
        let off = addr.wrapping_sub(self.base) as usize;
        (off <= self.bytes.len()).then_some(off)
    }
}

/// Per-thread cells referenced by generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FragmentCells {
    /// Receives the guest address to resume at.
    pub next_eip: u32,
    /// Spill slot for `%eax` around indirect-jump loads.
    pub scratch: u32,
    /// Holds the address of the fragment-exit routine.
    pub exit_hook: u32,
}

/// Destination of a translation.
pub struct OutputPage<'a> {
    pub bytes: &'a mut [u8],
    /// Run-time address of `bytes[0]`.
    pub base: u32,
    pub cells: FragmentCells,
}

impl<'a> OutputPage<'a> {
    pub fn new(bytes: &'a mut [u8], base: u32, cells: FragmentCells) -> Self {
        Self { bytes, base, cells }
    }
}

/// Result of translating one region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fragment {
    /// Run-time address of the translated entry instruction.
    pub entry: u32,
    /// Bytes written to the output page.
    pub code_len: usize,
    /// Generated address for each guest offset that starts an instruction.
    /// Has `len + 1` entries; the last one is the fallthrough stub.
    pub mapping: Vec<Option<u32>>,
}

impl Fragment {
    /// Generated address of the instruction starting at guest `offset`.
    pub fn generated_addr(&self, offset: usize) -> Option<u32> {
        self.mapping.get(offset).copied().flatten()
    }

    /// Length of the translated guest region.
    pub fn guest_len(&self) -> usize {
        self.mapping.len() - 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    /// Record the mapping; forward branches are provisional.
    Layout,
    /// Resolve every internal branch against the recorded mapping.
    Resolve,
}

/// Two-pass fragment translator.
#[derive(Debug, Clone)]
pub struct Translator<D = I386Decoder> {
    decoder: D,
    config: TranslatorConfig,
    trace: bool,
}

impl Translator {
    pub fn new(config: &TranslatorConfig) -> Self {
        Self::with_decoder(I386Decoder, config)
    }
}

impl<D: Decoder> Translator<D> {
    pub fn with_decoder(decoder: D, config: &TranslatorConfig) -> Self {
        Self {
            decoder,
            config: *config,
            trace: false,
        }
    }

    /// Log guest and generated listings of every fragment at debug level.
    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    pub fn config(&self) -> &TranslatorConfig {
        &self.config
    }

    /// Translate `region` into `out`, entering at `entry` (an offset into the region).
    ///
    /// Any failure is fatal: the output page may hold half-written code.
    pub fn translate(&self, region: &GuestRegion<'_>, entry: usize, out: &mut OutputPage<'_>) -> Fragment {
        self.try_translate(region, entry, out)
            .unwrap_or_else(|err| super::fatal(err))
    }

    /// Like [`Translator::translate`] but reports failures to the caller.
    ///
    /// Meant for inspection tools. On error the output page contents are unspecified.
    pub fn try_translate(
        &self,
        region: &GuestRegion<'_>,
        entry: usize,
        out: &mut OutputPage<'_>,
    ) -> Result<Fragment, TranslateError> {
        let cells = out.cells;
        let mut buf = CodeBuffer::new(&mut *out.bytes, out.base);
        let mut mapping = vec![None; region.len() + 1];

        self.walk(region, entry, &mut buf, &cells, &mut mapping, Pass::Layout)?;
        let entry_addr = self
            .walk(region, entry, &mut buf, &cells, &mut mapping, Pass::Resolve)?
            .ok_or(TranslateError::MissingEntry { entry })?;
        let code_len = buf.len();

        debug!(
            "fragment {:#x}+{} entry {} -> {:#x} ({} bytes)",
            region.base,
            region.len(),
            entry,
            entry_addr,
            code_len
        );
        if self.trace {
            debug!("guest:\n{}", listing::hexdump(region.bytes, region.base));
            debug!("generated:\n{}", listing::hexdump(buf.code(), out.base));
        }

        Ok(Fragment {
            entry: entry_addr,
            code_len,
            mapping,
        })
    }

    /// One decode/emit walk over the region. Returns the entry address if
    /// an instruction starts at `entry`.
    fn walk(
        &self,
        region: &GuestRegion<'_>,
        entry: usize,
        buf: &mut CodeBuffer<'_>,
        cells: &FragmentCells,
        mapping: &mut [Option<u32>],
        pass: Pass,
    ) -> Result<Option<u32>, TranslateError> {
        buf.rewind();
        let len = region.len();
        let mut asm = I386Assembler::new(buf);
        let mut s_off = 0;
        let mut jit_entry = None;

        while s_off < len {
            mapping[s_off] = Some(asm.here());
            if s_off == entry {
                jit_entry = Some(asm.here());
            }

            let bytes = &region.bytes[s_off..];
            let instr = self
                .decoder
                .decode(bytes, len - s_off)
                .map_err(|e| TranslateError::from_decode(s_off, e))?;
            if instr.len == 0 {
                return Err(TranslateError::Undecodable {
                    offset: s_off,
                    opcode: u16::from(bytes[0]),
                });
            }
            if instr.len > len - s_off {
                return Err(TranslateError::InstructionOverrun {
                    offset: s_off,
                    needed: instr.len,
                    available: len - s_off,
                });
            }
            if instr.action.is_control() && !instr.is_well_formed() {
                return Err(TranslateError::Undecodable {
                    offset: s_off,
                    opcode: u16::from(bytes[0]),
                });
            }

            let bytes = &bytes[..instr.len];
            if instr.action.is_control() {
                self.emit_control(&mut asm, region, s_off, bytes, &instr, cells, mapping, pass)?;
            } else {
                asm.raw(bytes);
            }
            s_off += instr.len;
        }

        mapping[len] = Some(asm.here());
        asm.exit_stub(cells.next_eip, cells.exit_hook, region.end());

        if buf.overflowed() {
            return Err(TranslateError::OutputOverflow {
                needed: buf.len(),
                capacity: buf.capacity(),
            });
        }
        Ok(jit_entry)
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_control(
        &self,
        asm: &mut I386Assembler<'_, '_>,
        region: &GuestRegion<'_>,
        s_off: usize,
        bytes: &[u8],
        instr: &Instruction,
        cells: &FragmentCells,
        mapping: &[Option<u32>],
        pass: Pass,
    ) -> Result<(), TranslateError> {
        let guest_addr = region.base.wrapping_add(s_off as u32);
        let target = instr.relative_target(bytes, guest_addr);
        let internal = region.offset_of(target);

        // Generated address of an internal target. During layout a forward
        // target is not known yet; any address of the same encoding size will do.
        let resolve = |here: u32, target_off: usize| match (mapping[target_off], pass) {
            (Some(addr), _) => Ok(addr),
            (None, Pass::Layout) => Ok(here),
            (None, Pass::Resolve) => Err(TranslateError::MisalignedTarget {
                offset: s_off,
                target: target_off,
            }),
        };

        match instr.action {
            ControlAction::JumpConditional => {
                let cond = Cond::from_opcode(instr.opcode(bytes));
                match internal {
                    Some(off) => {
                        let dest = resolve(asm.here(), off)?;
                        trace_rewrite(pass, guest_addr, "jcc", dest);
                        asm.jcc_rel32_to(cond, dest);
                    }
                    None => {
                        trace_rewrite(pass, guest_addr, "jcc exit", target);
                        asm.jcc_rel8(cond.invert(), EXIT_STUB_LEN as u8);
                        asm.exit_stub(cells.next_eip, cells.exit_hook, target);
                    }
                }
            }
            ControlAction::Loop => {
                // loop +2 over a short jump that skips the follow-up
                asm.raw(&bytes[..instr.len - 1]);
                asm.raw(&[0x02]);
                asm.jmp_rel8(0xFF);
                let skip_at = asm.offset() - 1;
                let start = asm.offset();
                match internal {
                    Some(off) => {
                        let dest = resolve(asm.here(), off)?;
                        trace_rewrite(pass, guest_addr, "loop", dest);
                        asm.jmp_rel32_to(dest);
                    }
                    None => {
                        trace_rewrite(pass, guest_addr, "loop exit", target);
                        asm.exit_stub(cells.next_eip, cells.exit_hook, target);
                    }
                }
                let follow_up = asm.offset() - start;
                asm.patch_u8(skip_at, follow_up as u8);
            }
            ControlAction::JumpRelative => match internal {
                Some(off) => {
                    let dest = resolve(asm.here(), off)?;
                    trace_rewrite(pass, guest_addr, "jmp", dest);
                    asm.jmp_rel32_to(dest);
                }
                // runtime code is outside the translation domain
                None if self.config.in_runtime_code(target) => {
                    trace_rewrite(pass, guest_addr, "jmp runtime", target);
                    asm.jmp_rel32_to(target);
                }
                None => {
                    trace_rewrite(pass, guest_addr, "jmp exit", target);
                    asm.exit_stub(cells.next_eip, cells.exit_hook, target);
                }
            },
            ControlAction::JumpIndirect if instr.has_modrm => {
                if pass == Pass::Resolve {
                    trace!("{:#010x}: ijmp -> load and exit", guest_addr);
                }
                asm.mov_moffs32_eax(cells.scratch);
                if let Some(seg) = instr.segment {
                    asm.raw(&[seg]);
                }
                // the addressing bytes are copied as-is, so they keep their address size
                if instr.addr16 {
                    asm.raw(&[0x67]);
                }
                if instr.opsize16 {
                    // jmp r/m16 zero-extends its target
                    asm.raw(&[0x0F, 0xB7]);
                } else {
                    asm.raw(&[0x8B]);
                }
                let modrm_at = asm.offset();
                asm.raw(&bytes[instr.mrm..]);
                // reg field 0 selects %eax as the load destination
                asm.patch_u8(modrm_at, bytes[instr.mrm] & 0xC7);
                asm.mov_moffs32_eax(cells.next_eip);
                asm.mov_eax_moffs32(cells.scratch);
                asm.jmp_m32(cells.exit_hook);
            }
            action => {
                return Err(TranslateError::UnsupportedControl {
                    offset: s_off,
                    action,
                });
            }
        }
        Ok(())
    }
}

fn trace_rewrite(pass: Pass, guest_addr: u32, what: &str, dest: u32) {
    if pass == Pass::Resolve {
        trace!("{:#010x}: {} -> {:#010x}", guest_addr, what, dest);
    }
}
