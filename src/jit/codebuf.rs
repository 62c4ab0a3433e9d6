//! Code buffer for building fragment code.
//!
//! The buffer writes straight into the page the code will run from, so it
//! knows the run-time address of every byte it emits. Writes past the end of
//! the page are dropped and remembered; the translator checks
//! [`CodeBuffer::overflowed`] once a pass is complete.

/// A fixed-capacity buffer for building machine code at a known address.
pub struct CodeBuffer<'a> {
    /// Backing storage (usually the scratch page)
    code: &'a mut [u8],
    /// Run-time address of `code[0]`
    base: u32,
    /// Bytes emitted so far (may exceed the capacity after an overflow)
    len: usize,
}

impl<'a> CodeBuffer<'a> {
    /// Create an empty buffer over `code`, to be executed at `base`.
    pub fn new(code: &'a mut [u8], base: u32) -> Self {
        Self { code, base, len: 0 }
    }

    /// Get the current size of the code.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.code.len()
    }

    /// Get the current offset (for placeholders).
    pub fn offset(&self) -> usize {
        self.len
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    /// Run-time address of the next byte to be emitted.
    pub fn here(&self) -> u32 {
        self.addr_of(self.len)
    }

    /// Run-time address of `offset`.
    pub fn addr_of(&self, offset: usize) -> u32 {
        self.base.wrapping_add(offset as u32)
    }

    /// Whether more bytes were emitted than the backing storage holds.
    pub fn overflowed(&self) -> bool {
        self.len > self.code.len()
    }

    /// Start over at offset 0, keeping the previous contents until overwritten.
    pub fn rewind(&mut self) {
        self.len = 0;
    }

    /// Emit a single byte.
    pub fn emit_u8(&mut self, byte: u8) {
        if let Some(slot) = self.code.get_mut(self.len) {
            *slot = byte;
        }
        self.len += 1;
    }

    /// Emit a 16-bit value (little-endian).
    pub fn emit_u16(&mut self, value: u16) {
        self.emit_bytes(&value.to_le_bytes());
    }

    /// Emit a 32-bit value (little-endian).
    pub fn emit_u32(&mut self, value: u32) {
        self.emit_bytes(&value.to_le_bytes());
    }

    /// Emit multiple bytes.
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.emit_u8(b);
        }
    }

    /// Overwrite a byte emitted earlier.
    pub fn patch_u8(&mut self, offset: usize, byte: u8) {
        if let Some(slot) = self.code.get_mut(offset) {
            *slot = byte;
        }
    }

    /// Get the code bytes emitted so far (for inspection).
    pub fn code(&self) -> &[u8] {
        &self.code[..self.len.min(self.code.len())]
    }
}
