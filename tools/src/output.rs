use std::collections::{HashMap, HashSet};

use pair_dataset::SampleDescriptor;

/// One unique output stem per descriptor, in input order.
///
/// Stems start from the file stem (plus both crop rectangles for crop
/// samples). Stems shared by several descriptors get the parent directory
/// prepended; anything still colliding gets a numeric suffix.
pub fn output_stems(descriptors: &[SampleDescriptor]) -> Vec<String> {
    let base: Vec<String> = descriptors.iter().map(base_stem).collect();
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for stem in &base {
        *counts.entry(stem.as_str()).or_default() += 1;
    }

    let mut used = HashSet::new();
    base.iter()
        .zip(descriptors)
        .map(|(stem, descriptor)| {
            let candidate = if counts.get(stem.as_str()).copied().unwrap_or(0) > 1 {
                with_parent(stem, descriptor)
            } else {
                stem.clone()
            };
            let mut name = candidate.clone();
            let mut n = 1usize;
            while !used.insert(name.clone()) {
                name = format!("{candidate}_{n}");
                n += 1;
            }
            name
        })
        .collect()
}

fn base_stem(descriptor: &SampleDescriptor) -> String {
    let stem = descriptor
        .path()
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "sample".to_string());
    match descriptor.crop_regions() {
        None => stem,
        Some(regions) => {
            let rect = |r: &pair_dataset::Rectangle| {
                format!(
                    "{}-{}-{}-{}",
                    r.top_left.0, r.top_left.1, r.bottom_right.0, r.bottom_right.1
                )
            };
            format!("{stem}_{}_{}", rect(&regions.input), rect(&regions.target))
        }
    }
}

fn with_parent(stem: &str, descriptor: &SampleDescriptor) -> String {
    match descriptor
        .path()
        .parent()
        .and_then(|p| p.file_name())
        .map(|s| s.to_string_lossy())
    {
        Some(parent) if !parent.is_empty() => format!("{parent}_{stem}"),
        _ => stem.to_string(),
    }
}
