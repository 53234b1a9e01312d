//! Range math over logical collection positions.
//!
//! These helpers are pure: they align requests to page boundaries, find the
//! overlap between a request and a page, and estimate how many bytes a page
//! will cost against the cache budget.

use serde_json::Value;

/// A contiguous span `[index, index + count)` of collection positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Range {
    pub index: u64,
    pub count: u64,
}

impl Range {
    pub const fn new(index: u64, count: u64) -> Self {
        Self { index, count }
    }

    /// One past the last position covered by the range, saturating at
    /// `u64::MAX`.
    pub const fn end(&self) -> u64 {
        self.index.saturating_add(self.count)
    }
}

/// Overlap of two ranges.
///
/// Returns `None` when the ranges do not touch. Ranges that merely abut yield
/// a zero-count range at the shared boundary, which callers must read as
/// "no data" rather than as an error.
pub fn intersect(x: Range, y: Range) -> Option<Range> {
    let start = x.index.max(y.index);
    let end = x.end().min(y.end());
    (end >= start).then(|| Range::new(start, end - start))
}

/// Widen `[low_index, high_index]` outwards to whole pages.
///
/// The last page is cut short at `u64::MAX`.
pub fn snap_to_page_boundaries(low_index: u64, high_index: u64, page_size: u64) -> Range {
    debug_assert!(page_size > 0, "page size must be positive");
    let index = (low_index / page_size) * page_size;
    let end = (high_index / page_size)
        .saturating_add(1)
        .saturating_mul(page_size);
    Range::new(index, end - index)
}

/// Rough in-memory size of a value tree.
///
/// Keys and strings count two bytes per UTF-16 unit, every other scalar a
/// flat eight bytes. Array slots are keyed by their decimal position.
pub fn estimate_size(value: &Value) -> u64 {
    match value {
        Value::Object(map) => map
            .iter()
            .map(|(key, value)| utf16_bytes(key) + estimate_size(value))
            .sum(),
        Value::Array(items) => estimate_sequence(items),
        Value::String(s) => utf16_bytes(s),
        Value::Null | Value::Bool(_) | Value::Number(_) => 8,
    }
}

/// [estimate_size] of a sequence, as if it were a JSON array.
pub fn estimate_sequence(items: &[Value]) -> u64 {
    items
        .iter()
        .enumerate()
        .map(|(i, value)| decimal_digits(i as u64) * 2 + estimate_size(value))
        .sum()
}

fn utf16_bytes(s: &str) -> u64 {
    s.encode_utf16().count() as u64 * 2
}

fn decimal_digits(n: u64) -> u64 {
    n.checked_ilog10().map_or(1, |d| u64::from(d) + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_intersect_overlap_and_gap() {
        let x = Range::new(5, 12);
        let y = Range::new(10, 10);
        assert_eq!(intersect(x, y), Some(Range::new(10, 7)));
        assert_eq!(intersect(y, x), Some(Range::new(10, 7)));

        assert_eq!(intersect(Range::new(0, 3), Range::new(5, 2)), None);
        assert_eq!(intersect(Range::new(5, 2), Range::new(0, 3)), None);
    }

    #[test]
    fn test_intersect_adjacent_is_empty_not_none() {
        let touching = intersect(Range::new(0, 10), Range::new(10, 10));
        assert_eq!(touching, Some(Range::new(10, 0)));
    }

    #[test]
    fn test_intersect_none_iff_strictly_apart() {
        for xi in 0..6 {
            for xc in 0..4 {
                for yi in 0..6 {
                    for yc in 0..4 {
                        let (x, y) = (Range::new(xi, xc), Range::new(yi, yc));
                        let apart = x.end() < y.index || y.end() < x.index;
                        assert_eq!(intersect(x, y).is_none(), apart, "{x:?} {y:?}");
                        assert_eq!(intersect(x, y), intersect(y, x));
                    }
                }
            }
        }
    }

    #[test]
    fn test_snap_to_page_boundaries() {
        assert_eq!(snap_to_page_boundaries(5, 16, 10), Range::new(0, 20));
        assert_eq!(snap_to_page_boundaries(0, 0, 10), Range::new(0, 10));
        assert_eq!(snap_to_page_boundaries(19, 19, 10), Range::new(10, 10));
        assert_eq!(snap_to_page_boundaries(20, 20, 10), Range::new(20, 10));
        assert_eq!(
            snap_to_page_boundaries(u64::MAX, u64::MAX, 10),
            Range::new(u64::MAX - 5, 5)
        );
        assert_eq!(
            snap_to_page_boundaries(u64::MAX, u64::MAX, 1),
            Range::new(u64::MAX, 0)
        );
    }

    #[test]
    fn test_snap_is_idempotent() {
        for low in 0..40 {
            for high in low..40 {
                for page_size in 1..7 {
                    let r = snap_to_page_boundaries(low, high, page_size);
                    let again = snap_to_page_boundaries(r.index, r.end() - 1, page_size);
                    assert_eq!(r, again);
                }
            }
        }
    }

    #[test]
    fn test_estimate_size() {
        assert_eq!(estimate_size(&json!(42)), 8);
        assert_eq!(estimate_size(&json!(null)), 8);
        assert_eq!(estimate_size(&json!("abc")), 6);
        assert_eq!(estimate_size(&json!({"id": 1, "name": "ab"})), 4 + 8 + 8 + 4);
        // two one-digit slots, then an eleventh slot keyed "10"
        assert_eq!(estimate_size(&json!([true, false])), 2 + 8 + 2 + 8);
        let eleven = Value::Array(vec![json!(0); 11]);
        assert_eq!(estimate_size(&eleven), 10 * (2 + 8) + (4 + 8));
    }

    #[test]
    fn test_decimal_digits() {
        assert_eq!(decimal_digits(0), 1);
        assert_eq!(decimal_digits(9), 1);
        assert_eq!(decimal_digits(10), 2);
        assert_eq!(decimal_digits(999), 3);
        assert_eq!(decimal_digits(u64::MAX), 20);
    }
}
