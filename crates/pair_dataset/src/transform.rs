//! Composable preprocessing applied to both halves of a pair.
//!
//! Transforms are pure `&ImageTensor -> ImageTensor` functions shared by
//! `Arc`; a chain entry declares whether it touches the input, the target,
//! or both. Documented order is geometric, then normalization, then
//! thresholding; chains built from named steps warn when that order is
//! broken but keep the order they were given.

use crate::types::{ImagePair, ImageTensor, TransformError};
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma, Rgb};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

pub type TransformParams = BTreeMap<String, f32>;

pub trait Transform: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, image: &ImageTensor) -> Result<ImageTensor, String>;
}

/// Transform that needs both halves at once.
pub trait PairTransform: Send + Sync {
    fn name(&self) -> &str;
    fn apply_pair(
        &self,
        input: &ImageTensor,
        target: &ImageTensor,
    ) -> Result<(ImageTensor, ImageTensor), String>;
}

pub struct FnTransform<F> {
    name: String,
    f: F,
}

impl<F> FnTransform<F>
where
    F: Fn(&ImageTensor) -> Result<ImageTensor, String> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> Transform for FnTransform<F>
where
    F: Fn(&ImageTensor) -> Result<ImageTensor, String> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, image: &ImageTensor) -> Result<ImageTensor, String> {
        (self.f)(image)
    }
}

pub struct FnPairTransform<F> {
    name: String,
    f: F,
}

impl<F> FnPairTransform<F>
where
    F: Fn(&ImageTensor, &ImageTensor) -> Result<(ImageTensor, ImageTensor), String> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> PairTransform for FnPairTransform<F>
where
    F: Fn(&ImageTensor, &ImageTensor) -> Result<(ImageTensor, ImageTensor), String> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn apply_pair(
        &self,
        input: &ImageTensor,
        target: &ImageTensor,
    ) -> Result<(ImageTensor, ImageTensor), String> {
        (self.f)(input, target)
    }
}

/// Left-to-right composition; `compose(vec![])` is the identity.
pub struct Composed {
    steps: Vec<Arc<dyn Transform>>,
}

pub fn compose(steps: Vec<Arc<dyn Transform>>) -> Composed {
    Composed { steps }
}

impl Transform for Composed {
    fn name(&self) -> &str {
        "compose"
    }

    fn apply(&self, image: &ImageTensor) -> Result<ImageTensor, String> {
        let mut current = image.clone();
        for step in &self.steps {
            current = step
                .apply(&current)
                .map_err(|e| format!("{}: {e}", step.name()))?;
        }
        Ok(current)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    #[default]
    Both,
    Input,
    Target,
}

impl Side {
    fn touches_input(self) -> bool {
        matches!(self, Side::Both | Side::Input)
    }

    fn touches_target(self) -> bool {
        matches!(self, Side::Both | Side::Target)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Geometric,
    Normalization,
    Thresholding,
    /// Registered by the caller; not order-checked.
    Custom,
}

impl Stage {
    fn rank(self) -> Option<u8> {
        match self {
            Stage::Geometric => Some(0),
            Stage::Normalization => Some(1),
            Stage::Thresholding => Some(2),
            Stage::Custom => None,
        }
    }
}

/// Named step as written in pipeline config files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformStep {
    pub name: String,
    #[serde(default)]
    pub side: Side,
    #[serde(default)]
    pub params: TransformParams,
}

impl TransformStep {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            side: Side::Both,
            params: TransformParams::new(),
        }
    }

    pub fn side(mut self, side: Side) -> Self {
        self.side = side;
        self
    }

    pub fn param(mut self, key: &str, value: f32) -> Self {
        self.params.insert(key.to_string(), value);
        self
    }
}

#[derive(Clone)]
enum ChainStep {
    Single {
        transform: Arc<dyn Transform>,
        side: Side,
    },
    Pair(Arc<dyn PairTransform>),
}

#[derive(Clone, Default)]
pub struct TransformChain {
    steps: Vec<ChainStep>,
}

impl TransformChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, transform: Arc<dyn Transform>, side: Side) -> Self {
        self.steps.push(ChainStep::Single { transform, side });
        self
    }

    pub fn then_pair(mut self, transform: Arc<dyn PairTransform>) -> Self {
        self.steps.push(ChainStep::Pair(transform));
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn describe(&self) -> String {
        if self.steps.is_empty() {
            return "identity".to_string();
        }
        self.steps
            .iter()
            .map(|step| match step {
                ChainStep::Single { transform, side } => {
                    format!("{}[{side:?}]", transform.name())
                }
                ChainStep::Pair(t) => format!("{}[pair]", t.name()),
            })
            .collect::<Vec<_>>()
            .join(" -> ")
    }

    /// Run every step on its declared side(s), then require equal shapes.
    pub fn apply(&self, pair: ImagePair, sample: &str) -> Result<ImagePair, TransformError> {
        let ImagePair {
            mut input,
            mut target,
        } = pair;
        for step in &self.steps {
            match step {
                ChainStep::Single { transform, side } => {
                    let fail = |msg: String| TransformError::Failed {
                        sample: sample.to_string(),
                        transform: transform.name().to_string(),
                        msg,
                    };
                    if side.touches_input() {
                        input = transform.apply(&input).map_err(fail)?;
                    }
                    if side.touches_target() {
                        target = transform.apply(&target).map_err(fail)?;
                    }
                }
                ChainStep::Pair(transform) => {
                    let (i, t) = transform.apply_pair(&input, &target).map_err(|msg| {
                        TransformError::Failed {
                            sample: sample.to_string(),
                            transform: transform.name().to_string(),
                            msg,
                        }
                    })?;
                    input = i;
                    target = t;
                }
            }
        }
        if input.shape() != target.shape() {
            return Err(TransformError::ShapeMismatch {
                sample: sample.to_string(),
                input: input.shape(),
                target: target.shape(),
            });
        }
        Ok(ImagePair { input, target })
    }
}

/// Reject a pair holding any non-finite value or one outside `[low, high]`.
pub fn check_value_range(
    pair: &ImagePair,
    (low, high): (f32, f32),
    sample: &str,
) -> Result<(), TransformError> {
    for (side, tensor) in [("input", &pair.input), ("target", &pair.target)] {
        if let Some(&value) = tensor
            .data
            .iter()
            .find(|v| !(v.is_finite() && **v >= low && **v <= high))
        {
            return Err(TransformError::OutOfRange {
                sample: sample.to_string(),
                side,
                value,
                low,
                high,
            });
        }
    }
    Ok(())
}

impl fmt::Debug for TransformChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TransformChain").field(&self.describe()).finish()
    }
}

type Factory =
    Arc<dyn Fn(&TransformParams) -> Result<Arc<dyn Transform>, String> + Send + Sync>;
type PairFactory =
    Arc<dyn Fn(&TransformParams) -> Result<Arc<dyn PairTransform>, String> + Send + Sync>;

#[derive(Clone)]
enum Entry {
    Single { factory: Factory, stage: Stage },
    Pair(PairFactory),
}

/// Name → transform lookup used to turn config steps into a chain.
#[derive(Clone)]
pub struct TransformRegistry {
    entries: HashMap<String, Entry>,
}

impl Default for TransformRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl TransformRegistry {
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut reg = Self::empty();
        reg.register_factory("resize", Stage::Geometric, |p| {
            let w = positive(p, "width")?;
            let h = positive(p, "height")?;
            Ok(shared("resize", move |img: &ImageTensor| {
                resize(img, h as usize, w as usize)
            }))
        });
        reg.register_factory("scale", Stage::Geometric, |p| {
            let factor = p.get("factor").copied().unwrap_or(1.0);
            if !(factor.is_finite() && factor > 0.0) {
                return Err(format!("factor must be > 0, got {factor}"));
            }
            Ok(shared("scale", move |img: &ImageTensor| scale(img, factor)))
        });
        reg.register_factory("grayscale", Stage::Geometric, |_| {
            Ok(shared("grayscale", grayscale))
        });
        reg.register_factory("normalize", Stage::Normalization, |p| {
            let low = p.get("low").copied().unwrap_or(0.0);
            let high = p.get("high").copied().unwrap_or(1.0);
            if !(low < high) {
                return Err(format!("low ({low}) must be below high ({high})"));
            }
            Ok(shared("normalize", move |img: &ImageTensor| {
                Ok(normalize_range(img, low, high))
            }))
        });
        reg.register_factory("minmax", Stage::Normalization, |_| {
            Ok(shared("minmax", |img: &ImageTensor| Ok(minmax(img))))
        });
        reg.register_factory("threshold", Stage::Thresholding, |p| {
            let value = p.get("value").copied().unwrap_or(5.0);
            Ok(shared("threshold", move |img: &ImageTensor| {
                Ok(threshold(img, value))
            }))
        });
        reg
    }

    /// Register a parameterless transform under `name`.
    pub fn register<F>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(&ImageTensor) -> Result<ImageTensor, String> + Send + Sync + 'static,
    {
        let transform: Arc<dyn Transform> = Arc::new(FnTransform::new(name, f));
        self.entries.insert(
            name.to_string(),
            Entry::Single {
                factory: Arc::new(move |_| Ok(Arc::clone(&transform))),
                stage: Stage::Custom,
            },
        );
        self
    }

    pub fn register_factory<F>(&mut self, name: &str, stage: Stage, factory: F) -> &mut Self
    where
        F: Fn(&TransformParams) -> Result<Arc<dyn Transform>, String> + Send + Sync + 'static,
    {
        self.entries.insert(
            name.to_string(),
            Entry::Single {
                factory: Arc::new(factory),
                stage,
            },
        );
        self
    }

    pub fn register_pair<F>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(&ImageTensor, &ImageTensor) -> Result<(ImageTensor, ImageTensor), String>
            + Send
            + Sync
            + 'static,
    {
        let transform: Arc<dyn PairTransform> = Arc::new(FnPairTransform::new(name, f));
        self.entries.insert(
            name.to_string(),
            Entry::Pair(Arc::new(move |_| Ok(Arc::clone(&transform)))),
        );
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn build(&self, steps: &[TransformStep]) -> Result<TransformChain, TransformError> {
        let mut chain = TransformChain::new();
        let mut last_ranked: Option<(u8, &str)> = None;
        for step in steps {
            let entry = self
                .entries
                .get(&step.name)
                .ok_or_else(|| TransformError::Unknown(step.name.clone()))?;
            let invalid = |msg: String| TransformError::InvalidParams {
                transform: step.name.clone(),
                msg,
            };
            match entry {
                Entry::Single { factory, stage } => {
                    let transform = factory(&step.params).map_err(invalid)?;
                    if let Some(rank) = stage.rank() {
                        if let Some((prev_rank, prev)) = last_ranked {
                            if rank < prev_rank {
                                tracing::warn!(
                                    step = %step.name,
                                    after = prev,
                                    "transform runs after a later-stage transform; expected geometric -> normalization -> thresholding"
                                );
                            }
                        }
                        last_ranked = Some((rank, step.name.as_str()));
                    }
                    chain = chain.then(transform, step.side);
                }
                Entry::Pair(factory) => {
                    chain = chain.then_pair(factory(&step.params).map_err(invalid)?);
                }
            }
        }
        Ok(chain)
    }
}

fn shared<F>(name: &str, f: F) -> Arc<dyn Transform>
where
    F: Fn(&ImageTensor) -> Result<ImageTensor, String> + Send + Sync + 'static,
{
    Arc::new(FnTransform::new(name, f))
}

fn positive(params: &TransformParams, key: &str) -> Result<u32, String> {
    match params.get(key) {
        Some(v) if v.is_finite() && *v >= 1.0 => Ok(v.round() as u32),
        Some(v) => Err(format!("{key} must be >= 1, got {v}")),
        None => Err(format!("missing {key}")),
    }
}

/// Triangle-filter resize through `image::imageops`, for 1- or 3-channel
/// tensors. Values are clamped to `[0, 1]` by the `f32` pixel range.
pub fn resize(img: &ImageTensor, out_h: usize, out_w: usize) -> Result<ImageTensor, String> {
    if out_h == 0 || out_w == 0 {
        return Err(format!("cannot resize to {out_w}x{out_h}"));
    }
    if out_h == img.height && out_w == img.width {
        return Ok(img.clone());
    }
    let (w, h) = (img.width as u32, img.height as u32);
    let (nw, nh) = (out_w as u32, out_h as u32);
    let bad_len = || format!("tensor data does not match {}x{}", img.width, img.height);
    let data = match img.channels {
        1 => {
            let buf: ImageBuffer<Luma<f32>, Vec<f32>> =
                ImageBuffer::from_raw(w, h, img.data.clone()).ok_or_else(bad_len)?;
            imageops::resize(&buf, nw, nh, FilterType::Triangle).into_raw()
        }
        3 => {
            let buf: ImageBuffer<Rgb<f32>, Vec<f32>> =
                ImageBuffer::from_raw(w, h, img.data.clone()).ok_or_else(bad_len)?;
            imageops::resize(&buf, nw, nh, FilterType::Triangle).into_raw()
        }
        n => return Err(format!("unsupported channel count {n}")),
    };
    ImageTensor::new(data, out_h, out_w, img.channels)
}

/// Resize by a factor; new extents are truncated like an integer cast.
pub fn scale(img: &ImageTensor, factor: f32) -> Result<ImageTensor, String> {
    let h = (img.height as f32 * factor) as usize;
    let w = (img.width as f32 * factor) as usize;
    if h == 0 || w == 0 {
        return Err(format!(
            "scaling {}x{} by {factor} leaves an empty image",
            img.width, img.height
        ));
    }
    resize(img, h, w)
}

/// Channel mean over RGB, alpha dropped. Single-channel input passes through.
pub fn grayscale(img: &ImageTensor) -> Result<ImageTensor, String> {
    let take = match img.channels {
        1 => return Ok(img.clone()),
        2 => 1,
        3 | 4 => 3,
        n => return Err(format!("unsupported channel count {n}")),
    };
    let data = img
        .data
        .chunks_exact(img.channels)
        .map(|px| px[..take].iter().sum::<f32>() / take as f32)
        .collect();
    Ok(ImageTensor {
        data,
        height: img.height,
        width: img.width,
        channels: 1,
    })
}

/// Map `[0, 1]` onto `[low, high]`.
pub fn normalize_range(img: &ImageTensor, low: f32, high: f32) -> ImageTensor {
    let span = high - low;
    img.map(|v| low + v * span)
}

/// Min-max normalization to `[0, 1]`; a constant image becomes all zeros.
pub fn minmax(img: &ImageTensor) -> ImageTensor {
    match img.min_max() {
        Some((lo, hi)) if hi > lo => {
            let span = hi - lo;
            img.map(|v| (v - lo) / span)
        }
        _ => img.map(|_| 0.0),
    }
}

/// Zero every value below `value`. The threshold is in 8-bit units and is
/// rescaled by 1/255 when the image is already in `[0, 1]`.
pub fn threshold(img: &ImageTensor, value: f32) -> ImageTensor {
    let cutoff = match img.min_max() {
        Some((lo, hi)) if lo >= 0.0 && hi <= 1.0 => value / 255.0,
        _ => value,
    };
    img.map(|v| if v >= cutoff { v } else { 0.0 })
}
