use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AspectRatio {
    Square,
    Portrait2x3,
    Landscape3x2,
    Portrait3x4,
    Landscape4x3,
    #[default]
    Portrait9x16,
    Landscape16x9,
    Ultrawide21x9,
}

impl AspectRatio {
    pub const ALL: [AspectRatio; 8] = [
        AspectRatio::Square,
        AspectRatio::Portrait2x3,
        AspectRatio::Landscape3x2,
        AspectRatio::Portrait3x4,
        AspectRatio::Landscape4x3,
        AspectRatio::Portrait9x16,
        AspectRatio::Landscape16x9,
        AspectRatio::Ultrawide21x9,
    ];

    /// Ratio tag understood by the generation service, e.g. `9:16`.
    pub fn tag(self) -> &'static str {
        match self {
            AspectRatio::Square => "1:1",
            AspectRatio::Portrait2x3 => "2:3",
            AspectRatio::Landscape3x2 => "3:2",
            AspectRatio::Portrait3x4 => "3:4",
            AspectRatio::Landscape4x3 => "4:3",
            AspectRatio::Portrait9x16 => "9:16",
            AspectRatio::Landscape16x9 => "16:9",
            AspectRatio::Ultrawide21x9 => "21:9",
        }
    }

    pub fn parts(self) -> (u32, u32) {
        let (left, right) = self.tag().split_once(':').unwrap_or(("1", "1"));
        (left.parse().unwrap_or(1), right.parse().unwrap_or(1))
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for AspectRatio {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "square" => return Ok(AspectRatio::Square),
            "portrait" | "tall" => return Ok(AspectRatio::Portrait9x16),
            "landscape" | "wide" => return Ok(AspectRatio::Landscape16x9),
            _ => {}
        }
        AspectRatio::ALL
            .into_iter()
            .find(|ratio| ratio.tag() == normalized)
            .ok_or_else(|| {
                format!(
                    "Unknown aspect ratio '{}'. Expected one of: {}.",
                    raw.trim(),
                    AspectRatio::ALL.map(AspectRatio::tag).join(", ")
                )
            })
    }
}

impl TryFrom<String> for AspectRatio {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AspectRatio> for String {
    fn from(value: AspectRatio) -> Self {
        value.tag().to_string()
    }
}

/// Output quality tier. Each tier maps onto a resolution size the service accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Quality {
    Draft,
    #[default]
    Standard,
    High,
}

impl Quality {
    pub const ALL: [Quality; 3] = [Quality::Draft, Quality::Standard, Quality::High];

    pub fn name(self) -> &'static str {
        match self {
            Quality::Draft => "Draft",
            Quality::Standard => "Standard",
            Quality::High => "High",
        }
    }

    pub fn image_size(self) -> &'static str {
        match self {
            Quality::Draft => "1K",
            Quality::Standard => "2K",
            Quality::High => "4K",
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Quality {
    type Err = String;

    // Size tags are accepted too; history written before tiers existed stored them.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "draft" | "1k" => Ok(Quality::Draft),
            "standard" | "2k" => Ok(Quality::Standard),
            "high" | "4k" => Ok(Quality::High),
            other => Err(format!(
                "Unknown quality '{other}'. Expected Draft, Standard or High."
            )),
        }
    }
}

impl TryFrom<String> for Quality {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Quality> for String {
    fn from(value: Quality) -> Self {
        value.name().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutputSettings {
    pub aspect_ratio: AspectRatio,
    pub quality: Quality,
}
