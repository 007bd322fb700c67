use std::{cmp::Ordering, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

pub const INVALID_UID: u32 = u32::MAX;

/// Inclusive `[start, stop]` interval of uids, ordered by `(start, stop)`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UidRange {
    pub start: u32,
    pub stop: u32,
}

impl UidRange {
    pub fn new(start: u32, stop: u32) -> Self {
        Self { start, stop }
    }

    pub fn len(&self) -> u64 {
        if self.start > self.stop {
            0
        } else {
            (self.stop - self.start) as u64 + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, uid: u32) -> bool {
        self.start <= uid && uid <= self.stop
    }
}

// strtoul(3) with base 0: "0x" prefix is hex, a leading zero is octal.
fn parse_uid(s: &str) -> Option<u32> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else if s.len() > 1 && s.starts_with('0') {
        u32::from_str_radix(&s[1..], 8).ok()
    } else {
        s.parse().ok()
    }
}

impl FromStr for UidRange {
    type Err = Error;

    /// Accepts `"uid"` or `"start-stop"` with `start <= stop`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidUidRange(s.to_string());

        let (start, stop) = match s.split_once('-') {
            None => {
                let uid = parse_uid(s).ok_or_else(invalid)?;
                (uid, uid)
            }
            Some((start, stop)) => {
                if !stop.starts_with(|c: char| c.is_ascii_digit()) {
                    return Err(invalid());
                }
                (
                    parse_uid(start).ok_or_else(invalid)?,
                    parse_uid(stop).ok_or_else(invalid)?,
                )
            }
        };

        if start > stop {
            return Err(invalid());
        }

        Ok(Self::new(start, stop))
    }
}

/// A sorted sequence of uid ranges.
///
/// `add` is a sorted merge and `remove` a sorted multiset difference, so
/// `add(x)` followed by `remove(x)` restores the previous contents exactly.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct UidRanges {
    ranges: Vec<UidRange>,
}

impl UidRanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses every token or nothing.
    pub fn parse_from<I, S>(tokens: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ranges = tokens
            .into_iter()
            .map(|token| token.as_ref().parse())
            .collect::<Result<Vec<UidRange>>>()?;
        Ok(Self::from(ranges))
    }

    pub fn ranges(&self) -> &[UidRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn has_uid(&self, uid: u32) -> bool {
        if uid > i32::MAX as u32 {
            warn!("UID larger than 32 bits: {}", uid);
            return false;
        }

        let probe = UidRange::new(uid, uid);
        let idx = self.ranges.partition_point(|r| *r < probe);

        self.ranges.get(idx).is_some_and(|r| r.start == uid)
            || (idx > 0 && self.ranges[idx - 1].stop >= uid)
    }

    pub fn add(&mut self, other: &UidRanges) {
        let mut merged = Vec::with_capacity(self.ranges.len() + other.ranges.len());
        let (mut a, mut b) = (self.ranges.iter().peekable(), other.ranges.iter().peekable());

        loop {
            let next = match (a.peek(), b.peek()) {
                (Some(x), Some(y)) if y < x => b.next(),
                (Some(_), _) => a.next(),
                (None, Some(_)) => b.next(),
                (None, None) => break,
            };
            merged.extend(next.copied());
        }

        self.ranges = merged;
    }

    pub fn remove(&mut self, other: &UidRanges) {
        let mut kept = Vec::with_capacity(self.ranges.len());
        let mut b = other.ranges.iter().peekable();

        for range in &self.ranges {
            while b.next_if(|y| *y < range).is_some() {}
            if b.next_if(|y| *y == range).is_none() {
                kept.push(*range);
            }
        }

        self.ranges = kept;
    }
}

impl From<Vec<UidRange>> for UidRanges {
    fn from(mut ranges: Vec<UidRange>) -> Self {
        ranges.sort();
        Self { ranges }
    }
}

impl fmt::Display for UidRanges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("uids{ ")?;
        for range in &self.ranges {
            match range.len().cmp(&1) {
                Ordering::Less => write!(f, "<BAD: {}-{}> ", range.start, range.stop)?,
                Ordering::Equal => write!(f, "{} ", range.start)?,
                Ordering::Greater => write!(f, "{}-{} ", range.start, range.stop)?,
            }
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sorts_ranges() {
        let ranges = UidRanges::parse_from(["10100-10200", "1000", "0x10-0x20"]).unwrap();
        assert_eq!(
            ranges.ranges(),
            &[
                UidRange::new(16, 32),
                UidRange::new(1000, 1000),
                UidRange::new(10100, 10200)
            ]
        );
    }

    #[test]
    fn test_parse_rejects_malformed_tokens() {
        for bad in ["", "abc", "10-", "10-x", "20-10", "5-6-7", "-5", "1 "] {
            assert!(
                UidRanges::parse_from(["100", bad]).is_err(),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_has_uid() {
        let ranges = UidRanges::parse_from(["100-199", "300", "500-600"]).unwrap();

        for uid in [100, 150, 199, 300, 500, 600] {
            assert!(ranges.has_uid(uid), "missing {}", uid);
        }
        for uid in [0, 99, 200, 299, 301, 499, 601, INVALID_UID] {
            assert!(!ranges.has_uid(uid), "unexpected {}", uid);
        }
        assert!(!UidRanges::new().has_uid(0));
    }

    #[test]
    fn test_has_uid_with_nested_ranges() {
        let ranges = UidRanges::from(vec![UidRange::new(10, 100), UidRange::new(10, 20)]);
        assert!(ranges.has_uid(10));
        assert!(ranges.has_uid(15));
    }

    #[test]
    fn test_add_then_remove_restores() {
        let mut ranges = UidRanges::parse_from(["100-199", "1000"]).unwrap();
        let original = ranges.clone();
        let other = UidRanges::parse_from(["50", "150-160", "2000-3000"]).unwrap();

        ranges.add(&other);
        assert_eq!(ranges.ranges().len(), 5);
        assert!(ranges.has_uid(2500));
        assert_eq!(ranges.ranges()[0], UidRange::new(50, 50));

        ranges.remove(&other);
        assert_eq!(ranges, original);
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let mut ranges = UidRanges::parse_from(["1-5"]).unwrap();
        ranges.remove(&UidRanges::parse_from(["1-4"]).unwrap());
        assert_eq!(ranges.ranges(), &[UidRange::new(1, 5)]);
    }

    #[test]
    fn test_display() {
        let ranges = UidRanges::from(vec![
            UidRange::new(5, 3),
            UidRange::new(10, 10),
            UidRange::new(20, 30),
        ]);
        assert_eq!(ranges.to_string(), "uids{ <BAD: 5-3> 10 20-30 }");
    }
}
