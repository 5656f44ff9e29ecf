//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers keep module ids, mapping ids and thread ids from
//! being mixed up at the seams between the patch manager, the module tracker
//! and the collector.

use std::fmt;

/// Identifier of a loadable module (image), stable across unload/reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub u32);

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Module#{}", self.0)
    }
}

/// Identifier of one particular mapping of a module.
///
/// A module gets a fresh mapping id every time it is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MappingId(pub u32);

impl fmt::Display for MappingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mapping#{}", self.0)
    }
}

/// OS thread id of a traced thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct ThreadId(pub u64);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TID:{}", self.0)
    }
}

/// A function inside a module, addressed relative to the module's load base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionTarget {
    pub rva: u32,
    /// Extent of the function in bytes (0 when unknown)
    pub size: u32,
}

impl FunctionTarget {
    #[must_use]
    pub const fn new(rva: u32, size: u32) -> Self {
        Self { rva, size }
    }
}

/// Calibrated self-cost of one enter/exit pair, in ticks.
///
/// `inner` is the part that lands between the two recorded timestamps;
/// `outer` is the remainder that the caller observes on top of it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct Overhead {
    pub inner: i64,
    pub outer: i64,
}

impl Overhead {
    #[must_use]
    pub const fn new(inner: i64, outer: i64) -> Self {
        Self { inner, outer }
    }

    #[must_use]
    pub const fn total(&self) -> i64 {
        self.inner + self.outer
    }
}

impl fmt::Display for Overhead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "inner={} outer={}", self.inner, self.outer)
    }
}
