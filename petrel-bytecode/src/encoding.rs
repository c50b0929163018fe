//! Unsigned variable-length immediate encoding.
//!
//! Immediates are LEB128: seven payload bits per byte, little-endian, high
//! bit set on every byte except the last. All well-formed immediates fit
//! `u32`; the compiler never emits wider operands.

use alloc::vec::Vec;

/// Append the LEB128 encoding of `v` to `buf`.
pub fn encode_uvarint(buf: &mut Vec<u8>, mut v: u32) {
    loop {
        #[allow(clippy::cast_possible_truncation)]
        let b = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf.push(b);
            return;
        }
        buf.push(b | 0x80);
    }
}

/// Decode one LEB128 immediate starting at `code[pc]`.
///
/// Returns the value and the offset of the byte after it, or `None` on a
/// truncated or over-long (more than five byte) encoding.
pub fn decode_uvarint(code: &[u8], pc: usize) -> Option<(u32, usize)> {
    let mut v: u32 = 0;
    let mut shift = 0u32;
    let mut at = pc;
    loop {
        let b = *code.get(at)?;
        at = at.checked_add(1)?;
        v |= u32::from(b & 0x7f).checked_shl(shift)?;
        if b & 0x80 == 0 {
            return Some((v, at));
        }
        shift = shift.checked_add(7)?;
        if shift > 28 {
            return None;
        }
    }
}
