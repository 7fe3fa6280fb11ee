use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::WatermarkError;

/// Horizontal alignment keyword.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HAlign {
    Left,
    Center,
    Right,
}

/// Vertical alignment keyword.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VAlign {
    Top,
    Center,
    Bottom,
}

impl HAlign {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::Center => "center",
            Self::Right => "right",
        }
    }
}

impl VAlign {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Top => "top",
            Self::Center => "center",
            Self::Bottom => "bottom",
        }
    }
}

/// One of the nine anchor labels an overlay can be pinned to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Position {
    #[serde(rename = "Top_Left")]
    TopLeft,
    #[serde(rename = "Top")]
    Top,
    #[serde(rename = "Top_Right")]
    TopRight,
    #[serde(rename = "Center_Left")]
    CenterLeft,
    #[default]
    #[serde(rename = "Center")]
    Center,
    #[serde(rename = "Center_Right")]
    CenterRight,
    #[serde(rename = "Bottom_Left")]
    BottomLeft,
    #[serde(rename = "Bottom")]
    Bottom,
    #[serde(rename = "Bottom_Right")]
    BottomRight,
}

impl Position {
    /// Row-major, top-left first.
    pub const ALL: [Position; 9] = [
        Self::TopLeft,
        Self::Top,
        Self::TopRight,
        Self::CenterLeft,
        Self::Center,
        Self::CenterRight,
        Self::BottomLeft,
        Self::Bottom,
        Self::BottomRight,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::TopLeft => "Top_Left",
            Self::Top => "Top",
            Self::TopRight => "Top_Right",
            Self::CenterLeft => "Center_Left",
            Self::Center => "Center",
            Self::CenterRight => "Center_Right",
            Self::BottomLeft => "Bottom_Left",
            Self::Bottom => "Bottom",
            Self::BottomRight => "Bottom_Right",
        }
    }

    pub fn resolve(self) -> (HAlign, VAlign) {
        match self {
            Self::TopLeft => (HAlign::Left, VAlign::Top),
            Self::Top => (HAlign::Center, VAlign::Top),
            Self::TopRight => (HAlign::Right, VAlign::Top),
            Self::CenterLeft => (HAlign::Left, VAlign::Center),
            Self::Center => (HAlign::Center, VAlign::Center),
            Self::CenterRight => (HAlign::Right, VAlign::Center),
            Self::BottomLeft => (HAlign::Left, VAlign::Bottom),
            Self::Bottom => (HAlign::Center, VAlign::Bottom),
            Self::BottomRight => (HAlign::Right, VAlign::Bottom),
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Position {
    type Err = WatermarkError;

    /// Accepts the exact label (`Top_Left`) as well as any ASCII-case and `-`/`_`
    /// spelling of it (`top-left`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = normalize_label(s);
        Self::ALL
            .into_iter()
            .find(|p| normalize_label(p.label()) == wanted)
            .ok_or_else(|| {
                let valid: Vec<&str> = Self::ALL.iter().map(|p| p.label()).collect();
                WatermarkError::validation(format!(
                    "unknown position '{s}' (expected one of: {})",
                    valid.join(", ")
                ))
            })
    }
}

fn normalize_label(s: &str) -> String {
    s.trim()
        .chars()
        .map(|c| if c == '-' { '_' } else { c.to_ascii_lowercase() })
        .collect()
}

/// Top-left pixel origin of an overlay anchored inside a frame.
///
/// Offsets are signed: an overlay larger than the frame on an axis lands at a
/// negative coordinate for right/bottom/center anchors and gets clipped at composite
/// time.
pub fn anchor_origin(
    frame_w: u32,
    frame_h: u32,
    overlay_w: u32,
    overlay_h: u32,
    align: (HAlign, VAlign),
) -> (i64, i64) {
    let free_w = i64::from(frame_w) - i64::from(overlay_w);
    let free_h = i64::from(frame_h) - i64::from(overlay_h);

    let x = match align.0 {
        HAlign::Left => 0,
        HAlign::Center => free_w.div_euclid(2),
        HAlign::Right => free_w,
    };
    let y = match align.1 {
        VAlign::Top => 0,
        VAlign::Center => free_h.div_euclid(2),
        VAlign::Bottom => free_h,
    };
    (x, y)
}
