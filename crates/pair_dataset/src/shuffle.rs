//! Bounded reservoir used for approximate shuffling of a stream.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::mem;

/// Fixed-capacity window. Below capacity an insert only stores; once full,
/// each insert swaps with a uniformly chosen resident and emits it.
#[derive(Debug)]
pub struct ShuffleWindow<T> {
    capacity: usize,
    resident: Vec<T>,
    rng: StdRng,
}

impl<T> ShuffleWindow<T> {
    /// `capacity` of 0 is treated as 1 (pass-through).
    pub fn new(capacity: usize, seed: u64) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            resident: Vec::with_capacity(capacity),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Seed derived from the pipeline seed and the epoch number.
    pub fn for_epoch(capacity: usize, seed: u64, epoch: u64) -> Self {
        Self::new(capacity, seed ^ epoch)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.resident.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resident.is_empty()
    }

    pub fn push(&mut self, item: T) -> Option<T> {
        if self.capacity == 1 {
            return Some(item);
        }
        if self.resident.len() < self.capacity {
            self.resident.push(item);
            return None;
        }
        let slot = self.rng.random_range(0..self.resident.len());
        Some(mem::replace(&mut self.resident[slot], item))
    }

    /// Flush all residents in random order.
    pub fn drain(&mut self) -> Vec<T> {
        let mut rest = mem::take(&mut self.resident);
        rest.shuffle(&mut self.rng);
        rest
    }
}
