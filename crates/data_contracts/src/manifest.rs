use crate::sample::{CropRegions, Rectangle, SampleDescriptor, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const IMAGE_PATH_COLUMN: &str = "image_path";
/// Region the model sees (the speckle pattern in the source datasets).
pub const INPUT_CROP_COLUMN: &str = "speckle_crop_pos";
/// Region the model reconstructs (the original beam image).
pub const TARGET_CROP_COLUMN: &str = "original_crop_pos";
pub const COMMENT_COLUMN: &str = "comments";

/// One record returned by a manifest source. `fields` keeps every raw column
/// (including the well-known ones) so queries can filter on any of them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestRow {
    pub image_path: String,
    pub input_crop: Option<String>,
    pub target_crop: Option<String>,
    pub comment_tag: Option<i64>,
    pub fields: BTreeMap<String, String>,
}

impl ManifestRow {
    /// Build a row from header/value pairs. Empty cells count as absent.
    pub fn from_fields(fields: BTreeMap<String, String>) -> Result<Self, ValidationError> {
        let cell = |name: &str| {
            fields
                .get(name)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let image_path = cell(IMAGE_PATH_COLUMN).ok_or(ValidationError::MissingImagePath)?;
        let comment_tag = cell(COMMENT_COLUMN).and_then(|v| v.parse().ok());
        Ok(Self {
            image_path,
            input_crop: cell(INPUT_CROP_COLUMN),
            target_crop: cell(TARGET_CROP_COLUMN),
            comment_tag,
            fields,
        })
    }

    /// Resolve into a descriptor; relative image paths are joined onto `base`.
    pub fn to_descriptor(&self, base: Option<&Path>) -> Result<SampleDescriptor, ValidationError> {
        if self.image_path.trim().is_empty() {
            return Err(ValidationError::MissingImagePath);
        }
        let raw = PathBuf::from(self.image_path.trim());
        let path = match base {
            Some(base) if raw.is_relative() => base.join(raw),
            _ => raw,
        };
        let descriptor = match (&self.input_crop, &self.target_crop) {
            (None, None) => SampleDescriptor::split(path),
            (Some(input), Some(target)) => {
                let regions = CropRegions::new(
                    Rectangle::parse_literal(input)?,
                    Rectangle::parse_literal(target)?,
                );
                SampleDescriptor::cropped(path, regions)
            }
            _ => return Err(ValidationError::IncompleteCropPair),
        };
        Ok(descriptor.with_comment_tag(self.comment_tag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::DerivationStrategy;

    fn row(pairs: &[(&str, &str)]) -> ManifestRow {
        let fields = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ManifestRow::from_fields(fields).unwrap()
    }

    #[test]
    fn row_without_crops_is_split() {
        let r = row(&[(IMAGE_PATH_COLUMN, "img/a.png"), (COMMENT_COLUMN, "2")]);
        let d = r.to_descriptor(Some(Path::new("/data"))).unwrap();
        assert_eq!(d.strategy, DerivationStrategy::Split);
        assert_eq!(d.source_path, PathBuf::from("/data/img/a.png"));
        assert_eq!(d.comment_tag, Some(2));
    }

    #[test]
    fn row_with_both_crops_is_crop() {
        let r = row(&[
            (IMAGE_PATH_COLUMN, "/abs/a.png"),
            (INPUT_CROP_COLUMN, "((0, 0), (10, 10))"),
            (TARGET_CROP_COLUMN, "((10, 0), (20, 10))"),
        ]);
        let d = r.to_descriptor(Some(Path::new("/ignored"))).unwrap();
        assert_eq!(d.source_path, PathBuf::from("/abs/a.png"));
        let regions = d.crop_regions().unwrap();
        assert_eq!(regions.input.width(), 10);
        assert_eq!(regions.target.top_left, (10, 0));
    }

    #[test]
    fn row_with_one_crop_is_rejected() {
        let r = row(&[
            (IMAGE_PATH_COLUMN, "a.png"),
            (INPUT_CROP_COLUMN, "((0, 0), (10, 10))"),
        ]);
        assert_eq!(r.to_descriptor(None), Err(ValidationError::IncompleteCropPair));
    }

    #[test]
    fn row_without_image_path_is_rejected() {
        let fields = [(COMMENT_COLUMN.to_string(), "1".to_string())]
            .into_iter()
            .collect();
        assert_eq!(
            ManifestRow::from_fields(fields),
            Err(ValidationError::MissingImagePath)
        );
    }
}
