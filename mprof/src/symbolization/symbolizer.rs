// Frame descriptions are assembled with format!
#![allow(clippy::format_push_string)]

use addr2line::Context;
use anyhow::{Context as _, Result};
use gimli::{EndianRcSlice, RunTimeEndian};
use object::{Object, ObjectSection};
use rustc_demangle::demangle;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::rc::Rc;

/// DWARF lookup of file-relative addresses in one binary.
///
/// Reports name the same few hundred functions over and over, so resolved
/// addresses are cached.
pub struct Symbolizer {
    ctx: Context<EndianRcSlice<RunTimeEndian>>,
    cache: RefCell<HashMap<u64, ResolvedFrame>>,
}

impl Symbolizer {
    /// Load the debug information of `binary_path`.
    ///
    /// # Errors
    /// Returns an error if the binary cannot be read or parsed, or carries no
    /// usable DWARF
    pub fn new<P: AsRef<Path>>(binary_path: P) -> Result<Self> {
        let binary_path = binary_path.as_ref();
        let binary_data =
            fs::read(binary_path).with_context(|| format!("Failed to read {}", binary_path.display()))?;
        let obj_file = object::File::parse(&*binary_data).context("Failed to parse object file")?;

        let endian = if obj_file.is_little_endian() { RunTimeEndian::Little } else { RunTimeEndian::Big };
        let load_section = |id: gimli::SectionId| -> Result<EndianRcSlice<RunTimeEndian>, gimli::Error> {
            let data = obj_file
                .section_by_name(id.name())
                .and_then(|section| section.uncompressed_data().ok())
                .unwrap_or(std::borrow::Cow::Borrowed(&[][..]));
            Ok(EndianRcSlice::new(Rc::from(&*data), endian))
        };

        let dwarf = gimli::Dwarf::load(&load_section)?;
        let ctx = Context::from_dwarf(dwarf).context("Failed to load DWARF debug information")?;

        Ok(Self { ctx, cache: RefCell::new(HashMap::new()) })
    }

    /// Function (and inlining chain) at file-relative `addr`.
    pub fn resolve(&self, addr: u64) -> ResolvedFrame {
        if let Some(cached) = self.cache.borrow().get(&addr) {
            return cached.clone();
        }

        let mut frames = Vec::new();
        if let Ok(mut frame_iter) = self.ctx.find_frames(addr).skip_all_loads() {
            while let Ok(Some(frame)) = frame_iter.next() {
                let Some(function) = frame.function.and_then(|f| f.demangle().ok().map(|s| s.to_string()))
                else {
                    continue;
                };
                let location = frame.location.map(|loc| SourceLocation {
                    file: loc.file.map(std::string::ToString::to_string),
                    line: loc.line,
                });
                frames.push(InlinedFrame { function, location });
            }
        }

        let resolved = ResolvedFrame { addr, frames };
        self.cache.borrow_mut().insert(addr, resolved.clone());
        resolved
    }

    /// Name of the outermost function at `addr`, if known
    #[must_use]
    pub fn function_name(&self, addr: u64) -> Option<String> {
        self.resolve(addr).frames.last().map(|f| f.function.clone())
    }

    #[must_use]
    pub fn demangle_symbol(symbol: &str) -> String {
        format!("{:#}", demangle(symbol))
    }
}

/// Functions found at one address, innermost inlined frame first
#[derive(Debug, Clone, Default)]
pub struct ResolvedFrame {
    pub addr: u64,
    pub frames: Vec<InlinedFrame>,
}

#[derive(Debug, Clone)]
pub struct InlinedFrame {
    pub function: String,
    pub location: Option<SourceLocation>,
}

#[derive(Debug, Clone)]
pub struct SourceLocation {
    pub file: Option<String>,
    pub line: Option<u32>,
}

impl ResolvedFrame {
    #[must_use]
    pub fn is_known(&self) -> bool {
        !self.frames.is_empty()
    }

    /// One line per inlined frame: `0x... function (file:line)`
    #[must_use]
    pub fn describe(&self) -> String {
        if self.frames.is_empty() {
            return format!("{:#x} <unknown>", self.addr);
        }

        let mut output = String::new();
        for (idx, inlined) in self.frames.iter().enumerate() {
            if idx > 0 {
                output.push_str("\n  inlined into ");
            } else {
                output.push_str(&format!("{:#x} ", self.addr));
            }
            output.push_str(&inlined.function);
            if let Some(SourceLocation { file: Some(file), line }) = &inlined.location {
                match line {
                    Some(line) => output.push_str(&format!(" ({file}:{line})")),
                    None => output.push_str(&format!(" ({file})")),
                }
            }
        }
        output
    }
}
