//! Address space enumeration via `/proc/self/maps`
//!
//! The executable allocator needs the list of occupied ranges around a module
//! to find a free gap that `rel32` displacements can reach.

use super::{AddressRange, Protection};
use anyhow::{Context, Result};
use std::fs;

/// One line of a maps file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntry {
    pub range: AddressRange,
    pub protection: Protection,
    pub path: Option<String>,
}

/// Parse the contents of a `/proc/<pid>/maps` file.
///
/// Lines look like `start-end perms offset dev inode [pathname]`. Malformed
/// lines are skipped.
#[must_use]
pub fn parse_maps(content: &str) -> Vec<MapEntry> {
    content.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<MapEntry> {
    let mut parts = line.split_whitespace();
    let (start, end) = parts.next()?.split_once('-')?;
    let perms = parts.next()?.as_bytes();
    // offset, dev, inode
    let path = parts.nth(3).map(str::to_string);

    let start = usize::from_str_radix(start, 16).ok()?;
    let end = usize::from_str_radix(end, 16).ok()?;
    let mut protection = Protection::empty();

    if perms.first() == Some(&b'r') {
        protection |= Protection::READ;
    }
    if perms.get(1) == Some(&b'w') {
        protection |= Protection::WRITE;
    }
    if perms.get(2) == Some(&b'x') {
        protection |= Protection::EXECUTE;
    }
    Some(MapEntry { range: AddressRange::new(start, end), protection, path })
}

/// Read and parse the current process's memory maps.
///
/// # Errors
/// Returns an error if `/proc/self/maps` cannot be read
pub fn read_self_maps() -> Result<Vec<MapEntry>> {
    let maps = fs::read_to_string("/proc/self/maps").context("Failed to read /proc/self/maps")?;
    Ok(parse_maps(&maps))
}

/// Occupied ranges of the current process, sorted by start address.
///
/// # Errors
/// Returns an error if `/proc/self/maps` cannot be read
pub fn enumerate_allocations() -> Result<Vec<AddressRange>> {
    let mut ranges: Vec<AddressRange> = read_self_maps()?.into_iter().map(|e| e.range).collect();
    ranges.sort_unstable_by_key(|r| r.start);
    Ok(ranges)
}
