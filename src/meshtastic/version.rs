//! Dotted firmware version parsing and comparison.

use std::cmp::Ordering;
use std::fmt;

/// Numeric `major.minor.patch` firmware version. Missing components compare as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FirmwareVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl FirmwareVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse the leading numeric components of a version string such as `2.3.2.63df972`.
    /// At least `major.minor` is required; anything after the third component is ignored.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = [0u32; 3];
        let mut count = 0;
        for piece in raw.trim().trim_start_matches(['v', 'V']).split('.') {
            if count == parts.len() {
                break;
            }
            match piece.parse::<u32>() {
                Ok(n) => {
                    parts[count] = n;
                    count += 1;
                }
                Err(_) => break,
            }
        }
        if count < 2 {
            return None;
        }
        Some(Self::new(parts[0], parts[1], parts[2]))
    }

    pub fn is_at_least(&self, minimum: &FirmwareVersion) -> bool {
        *self >= *minimum
    }
}

/// Strip the build hash from a version reported by the radio (`2.3.2.63df972` -> `2.3.2`).
/// Strings with three or fewer components are returned unchanged.
pub fn strip_build_suffix(raw: &str) -> &str {
    let raw = raw.trim();
    if raw.split('.').count() > 3 {
        if let Some(idx) = raw.rfind('.') {
            return &raw[..idx];
        }
    }
    raw
}

impl Ord for FirmwareVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl PartialOrd for FirmwareVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
