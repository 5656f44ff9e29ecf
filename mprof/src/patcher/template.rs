//! Placeholder slots in machine code templates.
//!
//! Code templates are plain byte arrays. Every value that is only known at
//! patch time is written into the template as a recognizable marker, and
//! [`replace_absolute`] / [`replace_relative`] overwrite every occurrence of
//! the marker once the value is known.
//!
//! ```text
//!   absolute slot  (u64):  31 41 59 26 00 00 00 <index>   (big-endian view)
//!   relative slot  (i32):  31 41 59 <index>               (index >= 0x80)
//! ```

use crate::domain::PatchError;

// =============================================================================
// CONSTANTS
// =============================================================================

/// High bits shared by every marker
pub const MARKER_SIGNATURE: u32 = 0x3141_5926;

/// Marker for an absolute 64-bit slot.
#[must_use]
pub const fn absolute_marker(index: u8) -> u64 {
    ((MARKER_SIGNATURE as u64) << 32) | index as u64
}

/// Marker for a relative 32-bit slot.
#[must_use]
pub const fn relative_marker(index: u8) -> u32 {
    (MARKER_SIGNATURE & !0xFF) | index as u32
}

/// Little-endian encoding of [`absolute_marker`], for embedding in templates.
#[must_use]
pub const fn absolute_slot(index: u8) -> [u8; 8] {
    absolute_marker(index).to_le_bytes()
}

/// Little-endian encoding of [`relative_marker`], for embedding in templates.
#[must_use]
pub const fn relative_slot(index: u8) -> [u8; 4] {
    relative_marker(index).to_le_bytes()
}

fn occurrences(code: &[u8], pattern: &[u8]) -> Vec<usize> {
    let mut found = Vec::new();
    let mut offset = 0;

    while offset + pattern.len() <= code.len() {
        if &code[offset..offset + pattern.len()] == pattern {
            found.push(offset);
            offset += pattern.len();
        } else {
            offset += 1;
        }
    }
    found
}

/// Overwrite every absolute slot `index` in `code` with `value`.
///
/// Returns the number of slots replaced.
pub fn replace_absolute(code: &mut [u8], index: u8, value: u64) -> usize {
    let slots = occurrences(code, &absolute_slot(index));

    for &offset in &slots {
        code[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }
    slots.len()
}

/// Overwrite every relative slot `index` in `code` with the displacement from
/// the end of the slot to `target`, `code` being located at `base`.
///
/// Returns the number of slots replaced.
///
/// # Errors
/// Returns [`PatchError::OutOfRange`] if a displacement does not fit in 32
/// bits; `code` is left untouched in that case.
pub fn replace_relative(code: &mut [u8], base: usize, index: u8, target: usize) -> Result<usize, PatchError> {
    let slots = occurrences(code, &relative_slot(index));
    let displacements = slots
        .iter()
        .map(|&offset| {
            let from = base + offset + 4;
            i32::try_from(target as i64 - from as i64).map_err(|_| PatchError::OutOfRange { from, to: target })
        })
        .collect::<Result<Vec<_>, _>>()?;

    for (&offset, displacement) in slots.iter().zip(displacements) {
        code[offset..offset + 4].copy_from_slice(&displacement.to_le_bytes());
    }
    Ok(slots.len())
}
