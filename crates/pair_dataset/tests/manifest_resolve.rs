//! Manifest resolution from CSV sources and directory walks.

mod common;

use common::write_rgb;
use pair_dataset::{
    resolve_query, resolve_root, resolve_roots, CsvManifestSource, DerivationStrategy,
    DeriveConfig, ManifestError, ManifestQuery, PairDeriver, Rectangle,
};
use std::fs;

const MANIFEST: &str = "\
image_path,speckle_crop_pos,original_crop_pos,is_calibration,comments
frames/b.png,\"((0, 0), (8, 8))\",\"((8, 0), (16, 8))\",0,2
frames/a.png,,,0,2
frames/c.png,,,1,2
frames/d.png,,,0,5
";

#[test]
fn csv_query_filters_and_sorts() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let manifest = tmp.path().join("manifest.csv");
    fs::write(&manifest, MANIFEST)?;

    let source = CsvManifestSource::new(&manifest);
    let query: ManifestQuery = "is_calibration = 0 and comments = 2".parse()?;
    let descriptors = resolve_query(&source, &query)?;

    let names: Vec<_> = descriptors
        .iter()
        .map(|d| d.path().file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["a.png", "b.png"]);
    assert!(descriptors[0].path().starts_with(tmp.path()));
    assert_eq!(descriptors[0].strategy, DerivationStrategy::Split);
    let regions = descriptors[1].crop_regions().expect("crop metadata");
    assert_eq!(regions.input, Rectangle::new((0, 0), (8, 8)));
    assert_eq!(regions.target, Rectangle::new((8, 0), (16, 8)));
    assert_eq!(descriptors[1].comment_tag, Some(2));

    let everything = resolve_query(&source, &ManifestQuery::all())?;
    assert_eq!(everything.len(), 4);
    Ok(())
}

#[test]
fn resolved_crop_rows_derive() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    fs::create_dir_all(tmp.path().join("frames"))?;
    write_rgb(&tmp.path().join("frames"), "b.png", 16, 8, 3)?;
    let manifest = tmp.path().join("manifest.csv");
    fs::write(&manifest, MANIFEST)?;

    let query = ManifestQuery::all().and_eq("image_path", "frames/b.png");
    let descriptors = resolve_query(&CsvManifestSource::new(&manifest), &query)?;
    assert_eq!(descriptors.len(), 1);
    let pair = PairDeriver::new(DeriveConfig::default()).derive(&descriptors[0])?;
    assert_eq!(pair.input.shape(), [8, 8, 3]);
    // target region starts at column 8
    assert_eq!(pair.target.get(0, 0, 1), 8.0 / 255.0);
    Ok(())
}

#[test]
fn unreachable_and_malformed_sources_fail() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let err = resolve_query(
        &CsvManifestSource::new(tmp.path().join("absent.csv")),
        &ManifestQuery::all(),
    )
    .unwrap_err();
    assert!(matches!(err, ManifestError::Unreachable { .. }));

    let no_path_column = tmp.path().join("bad.csv");
    fs::write(&no_path_column, "file,comments\na.png,1\n")?;
    let err = resolve_query(&CsvManifestSource::new(&no_path_column), &ManifestQuery::all())
        .unwrap_err();
    assert!(matches!(err, ManifestError::Malformed { .. }));

    let half_crop = tmp.path().join("half.csv");
    fs::write(
        &half_crop,
        "image_path,speckle_crop_pos\na.png,\"((0, 0), (2, 2))\"\n",
    )?;
    let err = resolve_query(&CsvManifestSource::new(&half_crop), &ManifestQuery::all())
        .unwrap_err();
    assert!(matches!(err, ManifestError::Malformed { .. }));
    Ok(())
}

#[test]
fn directory_walk_filters_by_substring_and_sorts() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let nested = tmp.path().join("run_2").join("deep");
    fs::create_dir_all(&nested)?;
    fs::create_dir_all(tmp.path().join("run_1"))?;
    write_rgb(&nested, "z.png", 2, 2, 0)?;
    write_rgb(&tmp.path().join("run_1"), "b.png", 2, 2, 0)?;
    write_rgb(tmp.path(), "a.png", 2, 2, 0)?;
    fs::write(tmp.path().join("notes.txt"), "skip me")?;

    let found = resolve_root(tmp.path(), &[".png"])?;
    assert_eq!(found.len(), 3);
    assert!(found.iter().all(|d| d.path().is_absolute()));
    let paths: Vec<_> = found.iter().map(|d| d.path().to_path_buf()).collect();
    let mut sorted = paths.clone();
    sorted.sort();
    assert_eq!(paths, sorted);

    let everything = resolve_root(tmp.path(), &[])?;
    assert_eq!(everything.len(), 4);

    // Overlapping roots collapse to one entry per file.
    let merged = resolve_roots(
        &[tmp.path().to_path_buf(), tmp.path().join("run_1")],
        &["png"],
    )?;
    assert_eq!(merged.len(), 3);
    Ok(())
}
