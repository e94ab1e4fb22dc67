//! Inclusive bit spans inside a register value.

use std::fmt;

use thiserror::Error;

/// Bit range parse errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BitRangeError {
    #[error("invalid bit range syntax '{range_text}' (expected \"<n>\" or \"<a>-<b>\")")]
    InvalidSyntax { range_text: String },
    #[error("bit range '{range_text}' exceeds the {bit_width}-bit value")]
    OutOfBounds { range_text: String, bit_width: u32 },
    #[error("bit range '{range_text}' starts after it ends")]
    InvalidOrder { range_text: String },
}

/// An inclusive span `start..=end` of bits, bit 0 being the least significant.
///
/// Ordering is by `(start, end)` so ranges can key a sorted map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BitRange {
    start: u8,
    end: u8,
}

impl BitRange {
    /// Parse `"<n>"` or `"<a>-<b>"` against a value `bit_width` bits wide.
    pub fn parse(range_text: &str, bit_width: u32) -> Result<Self, BitRangeError> {
        let syntax = || BitRangeError::InvalidSyntax {
            range_text: range_text.to_string(),
        };
        let index = |text: &str| -> Result<u32, BitRangeError> {
            let text = text.trim();
            if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
                return Err(syntax());
            }
            text.parse::<u32>().map_err(|_| syntax())
        };

        let (start, end) = match range_text.split_once('-') {
            Some((a, b)) => (index(a)?, index(b)?),
            None => {
                let n = index(range_text)?;
                (n, n)
            }
        };

        if start > end {
            return Err(BitRangeError::InvalidOrder {
                range_text: range_text.to_string(),
            });
        }
        if end >= bit_width {
            return Err(BitRangeError::OutOfBounds {
                range_text: range_text.to_string(),
                bit_width,
            });
        }

        // end < bit_width <= 64 after the check above
        Ok(Self {
            start: start as u8,
            end: end as u8,
        })
    }

    /// Range covering `start..=end`. Panics if `start > end`.
    #[cfg(test)]
    pub(crate) fn new(start: u8, end: u8) -> Self {
        assert!(start <= end, "bit range start {} after end {}", start, end);
        Self { start, end }
    }

    pub fn start(&self) -> u8 {
        self.start
    }

    pub fn end(&self) -> u8 {
        self.end
    }

    /// Number of bits covered.
    pub fn width(&self) -> u32 {
        u32::from(self.end - self.start) + 1
    }

    /// True if both ranges share at least one bit.
    pub fn overlaps(&self, other: &BitRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// True if every bit lies below `bit_width`.
    pub fn fits(&self, bit_width: u32) -> bool {
        u32::from(self.end) < bit_width
    }
}

impl fmt::Display for BitRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Shift `full` right by `range.start` and keep `range.width()` bits.
pub fn extract_bit_field(full: u64, range: BitRange) -> u64 {
    let shifted = full >> range.start;
    match range.width() {
        64 => shifted,
        width => shifted & ((1u64 << width) - 1),
    }
}
