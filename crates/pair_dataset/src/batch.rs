//! Stacking of transformed pairs into fixed-size batches.

use crate::config::PartialBatchPolicy;
use crate::types::{Batch, ImagePair, PipelineError, PipelineResult};

/// Accumulates pairs until `batch_size` are buffered. The first pair of an
/// epoch fixes the per-sample shape; later pairs must match it.
#[derive(Debug)]
pub struct BatchAssembler {
    batch_size: usize,
    sample_shape: Option<[usize; 3]>,
    inputs: Vec<f32>,
    targets: Vec<f32>,
    identities: Vec<String>,
}

impl BatchAssembler {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            sample_shape: None,
            inputs: Vec::new(),
            targets: Vec::new(),
            identities: Vec::new(),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn sample_shape(&self) -> Option<[usize; 3]> {
        self.sample_shape
    }

    pub fn pending(&self) -> usize {
        self.identities.len()
    }

    /// Buffer one pair; returns a batch when it completes one.
    pub fn push(&mut self, identity: String, pair: ImagePair) -> PipelineResult<Option<Batch>> {
        let found = pair.input.shape();
        match self.sample_shape {
            Some(expected) if expected != found => {
                return Err(PipelineError::InconsistentShape {
                    sample: identity,
                    expected,
                    found,
                });
            }
            Some(_) => {}
            None => self.sample_shape = Some(found),
        }
        if self.identities.is_empty() {
            let per_batch = self.batch_size * found.iter().product::<usize>();
            self.inputs.reserve(per_batch);
            self.targets.reserve(per_batch);
        }
        self.inputs.extend_from_slice(&pair.input.data);
        self.targets.extend_from_slice(&pair.target.data);
        self.identities.push(identity);
        if self.identities.len() == self.batch_size {
            Ok(self.take())
        } else {
            Ok(None)
        }
    }

    /// Emit the trailing partial batch according to `policy`.
    pub fn finish(&mut self, policy: PartialBatchPolicy) -> Option<Batch> {
        match policy {
            PartialBatchPolicy::Keep => self.take(),
            PartialBatchPolicy::Drop => {
                if !self.identities.is_empty() {
                    tracing::debug!(dropped = self.identities.len(), "dropping partial batch");
                }
                self.inputs.clear();
                self.targets.clear();
                self.identities.clear();
                None
            }
        }
    }

    fn take(&mut self) -> Option<Batch> {
        let [h, w, c] = self.sample_shape?;
        if self.identities.is_empty() {
            return None;
        }
        let n = self.identities.len();
        Some(Batch {
            inputs: std::mem::take(&mut self.inputs),
            targets: std::mem::take(&mut self.targets),
            shape: [n, h, w, c],
            identities: std::mem::take(&mut self.identities),
        })
    }
}

#[cfg(feature = "burn-runtime")]
pub use burn_batch::BurnBatch;

#[cfg(feature = "burn-runtime")]
mod burn_batch {
    use crate::types::Batch;
    use burn::tensor::{backend::Backend, Tensor};

    /// Batch uploaded to a Burn backend, `[N, H, W, C]`.
    #[derive(Debug, Clone)]
    pub struct BurnBatch<B: Backend> {
        pub inputs: Tensor<B, 4>,
        pub targets: Tensor<B, 4>,
    }

    impl Batch {
        pub fn to_burn<B: Backend>(&self, device: &B::Device) -> BurnBatch<B> {
            let inputs =
                Tensor::<B, 1>::from_floats(self.inputs.as_slice(), device).reshape(self.shape);
            let targets =
                Tensor::<B, 1>::from_floats(self.targets.as_slice(), device).reshape(self.shape);
            BurnBatch { inputs, targets }
        }
    }
}
