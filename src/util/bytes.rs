//! Human-readable byte counts for cache statistics.

use std::fmt;

const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

/// A byte count that displays in IEC units (KiB, MiB, GiB, TiB) with trimmed precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut value = self.0 as f64;
        let mut unit = 0;

        while value >= 1024.0 && unit < UNITS.len() - 1 {
            value /= 1024.0;
            unit += 1;
        }

        if unit == 0 {
            return write!(f, "{} {}", self.0, UNITS[0]);
        }

        let precision: usize = if value >= 10.0 { 1 } else { 2 };
        let rendered = format!("{value:.precision$}");
        let trimmed = rendered.trim_end_matches('0').trim_end_matches('.');
        write!(f, "{trimmed} {}", UNITS[unit])
    }
}

pub fn format_bytes(bytes: u64) -> String {
    ByteSize(bytes).to_string()
}
