//! Left-exclusive, right-inclusive arcs on the token ring. A range whose
//! bounds coincide covers the full ring. The arithmetic is implemented on
//! clockwise distances from the left bound, which makes wrap-around a
//! non-case.

use crate::ring::token::Token;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ring circumference in offset space. Offsets are carried as `u128` so the
/// full ring has an exact span.
const RING_SPAN: u128 = 1 << 64;

/// The arc `(left, right]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Range {
    pub left: Token,
    pub right: Token,
}

impl Range {
    pub fn new(left: Token, right: Token) -> Self {
        Self { left, right }
    }

    /// A range with equal bounds is the entire ring.
    pub fn is_full_ring(&self) -> bool {
        self.left == self.right
    }

    pub fn is_wrap_around(&self) -> bool {
        self.left >= self.right
    }

    /// Clockwise length of the arc measured from `left`.
    fn span(&self) -> u128 {
        if self.is_full_ring() {
            RING_SPAN
        } else {
            self.right.distance_from(self.left) as u128
        }
    }

    fn token_at(&self, offset: u128) -> Token {
        // Truncation is modular, which is exactly the ring wrap.
        self.left.offset(offset as u64)
    }

    pub fn contains_token(&self, token: Token) -> bool {
        if self.is_full_ring() {
            return true;
        }
        let d = token.distance_from(self.left) as u128;
        d > 0 && d <= self.span()
    }

    pub fn contains_range(&self, that: &Range) -> bool {
        if self.is_full_ring() {
            return true;
        }
        if that.is_full_ring() {
            return false;
        }
        let start = that.left.distance_from(self.left) as u128;
        let end = that.right.distance_from(self.left) as u128;
        // `that` must begin at or after our left bound and close no later
        // than our right bound, without wrapping past our origin.
        start <= end && end <= self.span()
    }

    /// The (at most two) arcs covered by both ranges.
    pub fn intersection(&self, that: &Range) -> Vec<Range> {
        if self.is_full_ring() {
            return vec![*that];
        }
        if that.is_full_ring() {
            return vec![*self];
        }
        self.overlap_offsets(that)
            .into_iter()
            .map(|(start, end)| Range::new(self.token_at(start), self.token_at(end)))
            .collect()
    }

    /// The parts of `self` not covered by `that`.
    pub fn subtract(&self, that: &Range) -> Vec<Range> {
        self.subtract_all(std::slice::from_ref(that))
    }

    /// The parts of `self` not covered by any of `ranges`.
    pub fn subtract_all(&self, ranges: &[Range]) -> Vec<Range> {
        if ranges.iter().any(Range::is_full_ring) {
            return Vec::new();
        }
        // Collect covered offset intervals within (0, span], then emit the
        // gaps between them.
        let span = self.span();
        let mut covered: Vec<(u128, u128)> = Vec::new();
        for that in ranges {
            covered.extend(self.overlap_offsets(that));
        }
        covered.sort_unstable();

        let mut gaps = Vec::new();
        let mut cursor = 0u128;
        for (start, end) in covered {
            if start > cursor {
                gaps.push((cursor, start));
            }
            cursor = cursor.max(end);
        }
        if cursor < span {
            gaps.push((cursor, span));
        }

        gaps.into_iter()
            .map(|(start, end)| Range::new(self.token_at(start), self.token_at(end)))
            .collect()
    }

    /// Offset intervals `(start, end]` of `that` clipped to `(0, span]` of
    /// `self`, in self-relative clockwise coordinates.
    fn overlap_offsets(&self, that: &Range) -> Vec<(u128, u128)> {
        let span = self.span();
        let mut segments: Vec<(u128, u128)> = Vec::new();
        if that.is_full_ring() {
            segments.push((0, span));
        } else {
            let start = that.left.distance_from(self.left) as u128;
            let end = that.right.distance_from(self.left) as u128;
            if start < end {
                segments.push((start, end));
            } else {
                // `that` crosses our origin: split at offset zero.
                if end > 0 {
                    segments.push((0, end));
                }
                segments.push((start, RING_SPAN));
            }
        }
        segments
            .into_iter()
            .filter_map(|(start, end)| {
                let end = end.min(span);
                (start < end).then_some((start, end))
            })
            .collect()
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}]", self.left, self.right)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(left: i64, right: i64) -> Range {
        Range::new(Token(left), Token(right))
    }

    #[test]
    fn contains_is_left_exclusive_right_inclusive() {
        let range = r(10, 20);
        assert!(!range.contains_token(Token(10)));
        assert!(range.contains_token(Token(11)));
        assert!(range.contains_token(Token(20)));
        assert!(!range.contains_token(Token(21)));
    }

    #[test]
    fn wrap_around_contains_both_arms() {
        let range = r(100, -100);
        assert!(range.contains_token(Token(101)));
        assert!(range.contains_token(Token(i64::MAX)));
        assert!(range.contains_token(Token(i64::MIN)));
        assert!(range.contains_token(Token(-100)));
        assert!(!range.contains_token(Token(0)));
        assert!(!range.contains_token(Token(100)));
    }

    #[test]
    fn full_ring_contains_everything() {
        let full = r(7, 7);
        assert!(full.contains_token(Token(7)));
        assert!(full.contains_token(Token(i64::MIN)));
        assert!(full.contains_range(&r(100, -100)));
        assert!(!r(100, -100).contains_range(&full));
    }

    #[test]
    fn range_containment_handles_wrap() {
        assert!(r(10, 100).contains_range(&r(10, 50)));
        assert!(r(10, 100).contains_range(&r(40, 100)));
        assert!(!r(10, 100).contains_range(&r(5, 50)));
        assert!(r(100, 10).contains_range(&r(200, 300)));
        assert!(r(100, 10).contains_range(&r(200, 5)));
        assert!(!r(100, 10).contains_range(&r(50, 60)));
        assert!(!r(100, 10).contains_range(&r(200, 50)));
    }

    #[test]
    fn intersection_of_overlapping_arcs() {
        assert_eq!(r(10, 100).intersection(&r(50, 200)), vec![r(50, 100)]);
        assert_eq!(r(10, 100).intersection(&r(100, 200)), Vec::<Range>::new());
        assert_eq!(r(10, 100).intersection(&r(0, 10)), Vec::<Range>::new());
    }

    #[test]
    fn intersection_with_wrap_can_split_in_two() {
        // (-50, 50] meets the wrapping (30, -30] on both of its arms.
        let pieces = r(-50, 50).intersection(&r(30, -30));
        assert_eq!(pieces, vec![r(-50, -30), r(30, 50)]);
    }

    #[test]
    fn subtract_removes_the_covered_middle() {
        assert_eq!(r(0, 100).subtract(&r(20, 40)), vec![r(0, 20), r(40, 100)]);
        assert_eq!(r(0, 100).subtract(&r(0, 100)), Vec::<Range>::new());
        assert_eq!(r(0, 100).subtract(&r(200, 300)), vec![r(0, 100)]);
        assert_eq!(r(0, 100).subtract(&r(50, 300)), vec![r(0, 50)]);
    }

    #[test]
    fn subtract_all_merges_overlapping_cuts() {
        let remaining = r(0, 100).subtract_all(&[r(10, 30), r(20, 50), r(90, 200)]);
        assert_eq!(remaining, vec![r(0, 10), r(50, 90)]);
    }

    #[test]
    fn subtract_from_full_ring_keeps_the_origin_token() {
        let remaining = r(0, 0).subtract(&r(10, 20));
        assert_eq!(remaining, vec![r(0, 10), r(20, 0)]);
        assert!(remaining.iter().any(|piece| piece.contains_token(Token(0))));
        assert!(!remaining.iter().any(|piece| piece.contains_token(Token(15))));
    }

    #[test]
    fn subtracting_nothing_returns_self_intact() {
        assert_eq!(r(5, 5).subtract_all(&[]), vec![r(5, 5)]);
    }

    #[test]
    fn subtracting_full_ring_leaves_nothing() {
        assert_eq!(r(0, 100).subtract(&r(5, 5)), Vec::<Range>::new());
    }
}
