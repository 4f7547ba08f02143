//! Video quality tiers.

use std::fmt;
use std::str::FromStr;

/// Fixed, ordered set of quality tiers.
///
/// Variant order is the quality order, so the derived `Ord` is the
/// comparison used everywhere (`Quality::P720 < Quality::P1080`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Quality {
    P240,
    P360,
    P480,
    P720,
    P1080,
    P1440,
    P2160,
}

impl Quality {
    /// All tiers, lowest first.
    pub const ALL: [Quality; 7] = [
        Self::P240,
        Self::P360,
        Self::P480,
        Self::P720,
        Self::P1080,
        Self::P1440,
        Self::P2160,
    ];

    /// Returns the label used in filenames (`"720p"`).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::P240 => "240p",
            Self::P360 => "360p",
            Self::P480 => "480p",
            Self::P720 => "720p",
            Self::P1080 => "1080p",
            Self::P1440 => "1440p",
            Self::P2160 => "2160p",
        }
    }

    /// Position of the tier in [`Quality::ALL`].
    #[must_use]
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Highest tier in `offered`.
    #[must_use]
    pub fn best_of(offered: &[Quality]) -> Option<Quality> {
        offered.iter().copied().max()
    }

    /// Picks the tier to download from what the remote offers.
    ///
    /// Returns the best offered tier not above `ceiling`, or the lowest
    /// offered tier when everything is above it.
    #[must_use]
    pub fn select(offered: &[Quality], ceiling: Quality) -> Option<Quality> {
        offered
            .iter()
            .copied()
            .filter(|q| *q <= ceiling)
            .max()
            .or_else(|| offered.iter().copied().min())
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Quality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        let normalized = normalized.strip_suffix('p').unwrap_or(&normalized);
        match normalized {
            "240" => Ok(Self::P240),
            "360" => Ok(Self::P360),
            "480" => Ok(Self::P480),
            "720" => Ok(Self::P720),
            "1080" => Ok(Self::P1080),
            "1440" => Ok(Self::P1440),
            "2160" | "4k" => Ok(Self::P2160),
            _ => Err(format!("invalid quality: {s}")),
        }
    }
}
