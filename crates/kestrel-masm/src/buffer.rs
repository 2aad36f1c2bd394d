//! The aggregate assembler buffer.

use crate::records::PatchHandle;
use crate::{MasmError, Result, FAR_JUMP_MARKER, HALT_FILL, TLS_RELOAD_SEQ};

/// Maximum total code size. Offsets are `u32`; keep the top bit clear so
/// signed displacement arithmetic can never overflow.
const MAX_CODE_BYTES: usize = i32::MAX as usize;

/// A single growing byte buffer into which relocatable code packages are
/// appended at aligned offsets.
///
/// Offsets handed out by this buffer are stable: code is never moved after
/// it is written. Growth is checked (`try_reserve`), so allocation failure
/// surfaces as [`MasmError::OutOfMemory`] rather than an abort.
#[derive(Debug, Default)]
pub struct MasmBuffer {
    bytes: Vec<u8>,
}

impl MasmBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve capacity up front. Purely a pacing decision; appends still
    /// grow the buffer on demand.
    pub fn reserve(&mut self, additional: usize) -> Result<()> {
        self.bytes
            .try_reserve(additional)
            .map_err(|_| MasmError::OutOfMemory)
    }

    /// Current buffer length, i.e. the placement offset of the next
    /// aligned append.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.bytes.len() as u32
    }

    /// Pad with halt bytes up to `align` (a power of two).
    pub fn halting_align(&mut self, align: u32) -> Result<()> {
        debug_assert!(align.is_power_of_two());
        let misalign = self.bytes.len() % align as usize;
        if misalign != 0 {
            let pad = align as usize - misalign;
            self.grow(pad)?;
            self.bytes.resize(self.bytes.len() + pad, HALT_FILL);
        }
        Ok(())
    }

    /// Append raw code bytes at the current offset.
    pub fn append_raw_code(&mut self, code: &[u8]) -> Result<()> {
        self.grow(code.len())?;
        self.bytes.extend_from_slice(code);
        Ok(())
    }

    /// Emit a far-jump sequence with an unresolved target, returning the
    /// handle used to patch it later.
    pub fn far_jump_with_patch(&mut self) -> Result<PatchHandle> {
        self.grow(FAR_JUMP_MARKER.len() + 4)?;
        self.bytes.extend_from_slice(&FAR_JUMP_MARKER);
        let slot = self.bytes.len() as u32;
        self.bytes.extend_from_slice(&0u32.to_le_bytes());
        Ok(PatchHandle(slot))
    }

    /// Emit the canned TLS-base reload sequence.
    pub fn emit_tls_reload(&mut self) -> Result<()> {
        self.append_raw_code(&TLS_RELOAD_SEQ)
    }

    /// Patch a direct call: write the displacement `target − return_address`
    /// into the 4 bytes ending at `return_address_offset`.
    pub fn patch_call(&mut self, return_address_offset: u32, target: u32) {
        let disp = i64::from(target) - i64::from(return_address_offset);
        let disp = i32::try_from(disp).expect("call displacement exceeds i32 range");
        let at = return_address_offset as usize - 4;
        self.bytes[at..at + 4].copy_from_slice(&disp.to_le_bytes());
    }

    /// Patch a far-jump slot with an absolute code offset.
    pub fn patch_far_jump(&mut self, jump: PatchHandle, target: u32) {
        let at = jump.slot_offset() as usize;
        self.bytes[at..at + 4].copy_from_slice(&target.to_le_bytes());
    }

    /// Write an absolute code offset at `patch_at` (internal-link patching,
    /// applied by the publisher).
    pub fn patch_code_offset(&mut self, patch_at: u32, target: u32) {
        let at = patch_at as usize;
        self.bytes[at..at + 4].copy_from_slice(&target.to_le_bytes());
    }

    /// Read back a patched call displacement (test and verification aid).
    #[must_use]
    pub fn call_displacement_at(&self, return_address_offset: u32) -> i32 {
        let at = return_address_offset as usize - 4;
        i32::from_le_bytes(self.bytes[at..at + 4].try_into().unwrap())
    }

    /// Read back a far-jump slot's target offset.
    #[must_use]
    pub fn far_jump_target(&self, jump: PatchHandle) -> u32 {
        let at = jump.slot_offset() as usize;
        u32::from_le_bytes(self.bytes[at..at + 4].try_into().unwrap())
    }

    /// Freeze the buffer and take the final code bytes.
    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }

    fn grow(&mut self, additional: usize) -> Result<()> {
        if self.bytes.len() + additional > MAX_CODE_BYTES {
            return Err(MasmError::CodeTooLarge);
        }
        self.bytes
            .try_reserve(additional)
            .map_err(|_| MasmError::OutOfMemory)
    }
}
