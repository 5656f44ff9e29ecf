//! Command-line surface of the `mprof` binary.

pub mod args;

pub use args::{Args, Command};

use crate::analysis::FunctionHotspot;
use crate::symbolization::NameResolver;
use std::fmt::Write as _;

/// Parse a hex (`0x`-prefixed or bare) address, allowing `_` separators.
///
/// # Errors
/// Returns a message if the value is not a valid address
pub fn parse_address(value: &str) -> Result<usize, String> {
    let digits = value.trim();
    let digits = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")).unwrap_or(digits);
    let digits: String = digits.chars().filter(|&c| c != '_').collect();
    if digits.is_empty() {
        return Err(format!("invalid address: {value:?}"));
    }
    usize::from_str_radix(&digits, 16).map_err(|e| format!("invalid address {value:?}: {e}"))
}

/// Fill in names for `hotspots` that `names` knows.
pub fn resolve_names(hotspots: &mut [FunctionHotspot], names: &dyn NameResolver) {
    for hotspot in hotspots {
        if hotspot.name.is_none() {
            hotspot.name = names.name_of(hotspot.address);
        }
    }
}

/// Text table of the first `top` hotspots.
#[must_use]
pub fn format_hotspots(hotspots: &[FunctionHotspot], top: usize) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<32} {:>10} {:>7} {:>14} {:>14} {:>12}",
        "FUNCTION", "CALLS", "EXCL%", "EXCLUSIVE", "INCLUSIVE", "MAX"
    );
    let _ = writeln!(out, "{}", "─".repeat(94));

    for hotspot in hotspots.iter().take(top) {
        let s = &hotspot.statistics;
        let mut name = hotspot.display_name();
        if name.chars().count() > 32 {
            name = name.chars().take(31).collect::<String>() + "…";
        }
        let _ = writeln!(
            out,
            "{:<32} {:>10} {:>6.1}% {:>14} {:>14} {:>12}",
            name, s.times_called, hotspot.percentage, s.exclusive_time, s.inclusive_time, s.max_call_time
        );
    }
    if hotspots.len() > top {
        let _ = writeln!(out, "... {} more", hotspots.len() - top);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use mprof_common::FunctionStatistics;
    use std::collections::HashMap;

    fn hotspot(address: usize, exclusive_time: i64, percentage: f64) -> FunctionHotspot {
        FunctionHotspot {
            address,
            name: None,
            statistics: FunctionStatistics {
                times_called: 3,
                exclusive_time,
                inclusive_time: exclusive_time,
                ..FunctionStatistics::default()
            },
            percentage,
        }
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("0x7f00_1000"), Ok(0x7f00_1000));
        assert_eq!(parse_address("DEAD"), Ok(0xdead));
        assert!(parse_address("0x").is_err());
        assert!(parse_address("xyz").is_err());
    }

    #[test]
    fn test_resolve_names_keeps_unknown_as_hex() {
        let names: HashMap<usize, String> = [(0x10, "main".to_string())].into_iter().collect();
        let mut hotspots = vec![hotspot(0x10, 5, 50.0), hotspot(0x20, 5, 50.0)];

        resolve_names(&mut hotspots, &names);

        assert_eq!(hotspots[0].display_name(), "main");
        assert_eq!(hotspots[1].display_name(), "0x20");
    }

    #[test]
    fn test_format_hotspots_truncates_list() {
        let hotspots = vec![hotspot(0x10, 75, 75.0), hotspot(0x20, 25, 25.0)];

        let table = format_hotspots(&hotspots, 1);

        assert!(table.starts_with("FUNCTION"));
        assert!(table.contains("0x10"));
        assert!(table.contains("75.0%"));
        assert!(!table.contains("0x20"));
        assert!(table.contains("... 1 more"));
    }
}
