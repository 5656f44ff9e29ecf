//! Free-gap lookup over a sorted list of allocations.
//!
//! Both searches expect `allocations` sorted by start address and
//! non-overlapping, which is how `/proc/self/maps` lists them.

use super::AddressRange;

/// Lowest address `>= location` where `size` free bytes fit.
#[must_use]
pub fn gap_search_up(location: usize, allocations: &[AddressRange], size: usize) -> Option<usize> {
    let mut candidate = location;

    for allocation in allocations {
        if allocation.end <= candidate {
            continue;
        }
        if allocation.start >= candidate.checked_add(size)? {
            break;
        }
        candidate = allocation.end;
    }
    candidate.checked_add(size).map(|_| candidate)
}

/// Highest address whose `size`-byte gap ends at or below `location`.
#[must_use]
pub fn gap_search_down(location: usize, allocations: &[AddressRange], size: usize) -> Option<usize> {
    let mut candidate = location.checked_sub(size)?;

    for allocation in allocations.iter().rev() {
        if allocation.start >= candidate + size {
            continue;
        }
        if allocation.end <= candidate {
            break;
        }
        candidate = allocation.start.checked_sub(size)?;
    }
    Some(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocations() -> Vec<AddressRange> {
        vec![
            AddressRange::new(0x1000, 0x3000),
            AddressRange::new(0x3000, 0x5000),
            AddressRange::new(0x6000, 0x7000),
            AddressRange::new(0x9000, 0xA000),
        ]
    }

    #[test]
    fn test_up_skips_adjacent_allocations() {
        assert_eq!(gap_search_up(0x1000, &allocations(), 0x1000), Some(0x5000));
    }

    #[test]
    fn test_up_skips_gaps_that_are_too_small() {
        assert_eq!(gap_search_up(0x1000, &allocations(), 0x1800), Some(0x7000));
    }

    #[test]
    fn test_up_returns_location_when_free() {
        assert_eq!(gap_search_up(0x7000, &allocations(), 0x2000), Some(0x7000));
        assert_eq!(gap_search_up(0xB000, &allocations(), 0x1000), Some(0xB000));
    }

    #[test]
    fn test_up_fails_on_address_space_overflow() {
        assert_eq!(gap_search_up(usize::MAX - 0x10, &[], 0x1000), None);
    }

    #[test]
    fn test_down_finds_gap_below_location() {
        assert_eq!(gap_search_down(0x9000, &allocations(), 0x1000), Some(0x8000));
        assert_eq!(gap_search_down(0x9000, &allocations(), 0x2000), Some(0x7000));
    }

    #[test]
    fn test_down_skips_gaps_that_are_too_small() {
        let allocations =
            [AddressRange::new(0x10000, 0x11000), AddressRange::new(0x11800, 0x12000)];

        assert_eq!(gap_search_down(0x12000, &allocations, 0x1000), Some(0xF000));
        assert_eq!(gap_search_down(0x9000, &self::allocations(), 0x2800), None);
    }

    #[test]
    fn test_down_fails_below_zero() {
        assert_eq!(gap_search_down(0x3000, &allocations(), 0x1000), Some(0x0));
        assert_eq!(gap_search_down(0x3000, &allocations(), 0x1800), None);
    }
}
