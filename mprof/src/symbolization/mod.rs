//! # Callee Names
//!
//! Call records identify functions by their runtime address. Reports turn
//! those back into names through a [`NameResolver`]:
//!
//! ```text
//!   runtime address ── - load base ──► file offset ── DWARF ──► function
//!        0x55f3a2b4c780   0x55f3a2b4c000      0x780          parse::next
//! ```
//!
//! - [`BinarySymbols`]: DWARF of a binary loaded at a known base
//!   (`addr2line` over `gimli`, sections read with `object`)
//! - `HashMap<usize, String>`: fixed names, e.g. for generated code
//!
//! Unresolvable addresses are reported as hex by the callers.

pub mod symbolizer;

pub use symbolizer::{ResolvedFrame, Symbolizer};

use std::collections::HashMap;

/// Source of function names for runtime addresses.
pub trait NameResolver {
    fn name_of(&self, address: usize) -> Option<String>;
}

impl NameResolver for HashMap<usize, String> {
    fn name_of(&self, address: usize) -> Option<String> {
        self.get(&address).cloned()
    }
}

/// Symbols of one binary mapped at `load_base`.
pub struct BinarySymbols {
    symbolizer: Symbolizer,
    load_base: usize,
}

impl BinarySymbols {
    /// `load_base` is subtracted from runtime addresses before lookup; pass 0
    /// for non-PIE binaries.
    #[must_use]
    pub fn new(symbolizer: Symbolizer, load_base: usize) -> Self {
        Self { symbolizer, load_base }
    }

    #[must_use]
    pub fn symbolizer(&self) -> &Symbolizer {
        &self.symbolizer
    }
}

impl NameResolver for BinarySymbols {
    fn name_of(&self, address: usize) -> Option<String> {
        let offset = address.checked_sub(self.load_base)?;
        self.symbolizer.function_name(offset as u64)
    }
}
