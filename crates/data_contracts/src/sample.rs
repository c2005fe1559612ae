use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Axis-aligned pixel rectangle. The crop it describes is half-open:
/// columns `top_left.0..bottom_right.0`, rows `top_left.1..bottom_right.1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Rectangle {
    pub top_left: (u32, u32),
    pub bottom_right: (u32, u32),
}

/// The two regions cropped from one source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CropRegions {
    pub input: Rectangle,
    pub target: Rectangle,
}

/// How a sample's (input, target) pair is produced from its source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DerivationStrategy {
    /// Halve a composite image into target and input.
    Split,
    /// Crop two stored regions from the same image.
    Crop(CropRegions),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleDescriptor {
    pub source_path: PathBuf,
    pub strategy: DerivationStrategy,
    pub comment_tag: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("degenerate rectangle {0}")]
    DegenerateRectangle(Rectangle),
    #[error("rectangle {rect} exceeds image bounds {width}x{height}")]
    OutOfBounds {
        rect: Rectangle,
        width: u32,
        height: u32,
    },
    #[error("malformed rectangle literal {0:?}")]
    MalformedRectangle(String),
    #[error("only one of the two crop regions is present")]
    IncompleteCropPair,
    #[error("missing image path")]
    MissingImagePath,
}

impl Rectangle {
    pub fn new(top_left: (u32, u32), bottom_right: (u32, u32)) -> Self {
        Self {
            top_left,
            bottom_right,
        }
    }

    /// Width in pixels; zero for degenerate rectangles.
    pub fn width(&self) -> u32 {
        self.bottom_right.0.saturating_sub(self.top_left.0)
    }

    pub fn height(&self) -> u32 {
        self.bottom_right.1.saturating_sub(self.top_left.1)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.top_left.0 >= self.bottom_right.0 || self.top_left.1 >= self.bottom_right.1 {
            return Err(ValidationError::DegenerateRectangle(*self));
        }
        Ok(())
    }

    /// Reject rectangles reaching past a `width` x `height` image. Nothing is clamped.
    pub fn check_bounds(&self, width: u32, height: u32) -> Result<(), ValidationError> {
        self.validate()?;
        if self.bottom_right.0 > width || self.bottom_right.1 > height {
            return Err(ValidationError::OutOfBounds {
                rect: *self,
                width,
                height,
            });
        }
        Ok(())
    }

    /// Parse the `((x0, y0), (x1, y1))` form stored in manifest rows.
    /// Square brackets are accepted in place of parentheses.
    pub fn parse_literal(raw: &str) -> Result<Self, ValidationError> {
        let malformed = || ValidationError::MalformedRectangle(raw.to_string());
        let compact: String = raw
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| match c {
                '[' => '(',
                ']' => ')',
                other => other,
            })
            .collect();
        let inner = compact
            .strip_prefix("((")
            .and_then(|s| s.strip_suffix("))"))
            .ok_or_else(malformed)?;
        let mut corners = inner.split("),(");
        let (Some(first), Some(second), None) = (corners.next(), corners.next(), corners.next())
        else {
            return Err(malformed());
        };
        let point = |s: &str| -> Result<(u32, u32), ValidationError> {
            let mut parts = s.split(',');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(x), Some(y), None) => Ok((
                    x.parse().map_err(|_| malformed())?,
                    y.parse().map_err(|_| malformed())?,
                )),
                _ => Err(malformed()),
            }
        };
        Ok(Self::new(point(first)?, point(second)?))
    }
}

impl fmt::Display for Rectangle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(({}, {}), ({}, {}))",
            self.top_left.0, self.top_left.1, self.bottom_right.0, self.bottom_right.1
        )
    }
}

impl FromStr for Rectangle {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_literal(s)
    }
}

impl CropRegions {
    pub fn new(input: Rectangle, target: Rectangle) -> Self {
        Self { input, target }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.input.validate()?;
        self.target.validate()
    }
}

impl SampleDescriptor {
    /// Descriptor for a composite image halved into target and input.
    pub fn split(source_path: impl Into<PathBuf>) -> Self {
        Self {
            source_path: source_path.into(),
            strategy: DerivationStrategy::Split,
            comment_tag: None,
        }
    }

    /// Descriptor for two regions cropped from the same image.
    pub fn cropped(source_path: impl Into<PathBuf>, regions: CropRegions) -> Self {
        Self {
            source_path: source_path.into(),
            strategy: DerivationStrategy::Crop(regions),
            comment_tag: None,
        }
    }

    pub fn with_comment_tag(mut self, tag: Option<i64>) -> Self {
        self.comment_tag = tag;
        self
    }

    pub fn path(&self) -> &Path {
        &self.source_path
    }

    pub fn crop_regions(&self) -> Option<&CropRegions> {
        match &self.strategy {
            DerivationStrategy::Crop(regions) => Some(regions),
            DerivationStrategy::Split => None,
        }
    }

    /// Stable identity used for ordering, logging and error reports.
    pub fn identity(&self) -> String {
        match &self.strategy {
            DerivationStrategy::Split => self.source_path.display().to_string(),
            DerivationStrategy::Crop(regions) => format!(
                "{}#{}|{}",
                self.source_path.display(),
                regions.input,
                regions.target
            ),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.source_path.as_os_str().is_empty() {
            return Err(ValidationError::MissingImagePath);
        }
        match &self.strategy {
            DerivationStrategy::Split => Ok(()),
            DerivationStrategy::Crop(regions) => regions.validate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_round_trips_through_display() {
        let rect = Rectangle::new((3, 4), (67, 70));
        let parsed: Rectangle = rect.to_string().parse().unwrap();
        assert_eq!(parsed, rect);
    }

    #[test]
    fn literal_accepts_list_brackets_and_spacing() {
        let rect = Rectangle::parse_literal(" [ [0 ,0], [66, 66] ] ").unwrap();
        assert_eq!(rect, Rectangle::new((0, 0), (66, 66)));
    }

    #[test]
    fn literal_rejects_missing_corner() {
        assert!(matches!(
            Rectangle::parse_literal("((1, 2))"),
            Err(ValidationError::MalformedRectangle(_))
        ));
        assert!(Rectangle::parse_literal("((1, 2), (3, -4))").is_err());
    }

    #[test]
    fn identity_includes_regions() {
        let regions = CropRegions::new(
            Rectangle::new((0, 0), (4, 4)),
            Rectangle::new((4, 0), (8, 4)),
        );
        let split = SampleDescriptor::split("a.png");
        let crop = SampleDescriptor::cropped("a.png", regions);
        assert_eq!(split.identity(), "a.png");
        assert_ne!(split.identity(), crop.identity());
        assert!(crop.identity().starts_with("a.png#"));
    }
}
