//! Bounded replay buffers for persistent short-run MCMC.
//!
//! A [`ReplayBuffer`] keeps the most recent synthesized images at the front
//! and drops the oldest ones once `capacity` is reached. [`ClassBuffers`]
//! holds one buffer per class id in a fixed-size array.

use std::collections::VecDeque;

use rand::Rng;

use super::error::SamplerError;

/// Bounded FIFO of previously synthesized samples, most recent first.
#[derive(Debug, Clone)]
pub struct ReplayBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T: Clone> ReplayBuffer<T> {
    /// Create an empty buffer holding at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Create a buffer from `items` (front first), truncated to `capacity`.
    pub fn from_items(items: Vec<T>, capacity: usize) -> Self {
        let mut items: VecDeque<T> = items.into();
        items.truncate(capacity);
        Self { items, capacity }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterate from the most recent entry to the oldest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    /// The `n` most recent entries (fewer if the buffer is shorter).
    pub fn front(&self, n: usize) -> Vec<T> {
        self.items.iter().take(n).cloned().collect()
    }

    /// Draw `k` entries independently, with replacement.
    pub fn sample(&self, k: usize, rng: &mut impl Rng) -> Result<Vec<T>, SamplerError> {
        if self.items.is_empty() {
            return Err(SamplerError::EmptyBuffer);
        }
        let n = self.items.len();
        Ok((0..k)
            .map(|_| self.items[rng.gen_range(0..n)].clone())
            .collect())
    }

    /// Prepend `items` (item 0 becomes the new front) and drop the tail
    /// beyond `capacity`.
    pub fn insert(&mut self, items: Vec<T>) {
        for item in items.into_iter().rev() {
            self.items.push_front(item);
        }
        self.items.truncate(self.capacity);
    }
}

/// One [`ReplayBuffer`] per class, indexed by class id.
#[derive(Debug, Clone)]
pub struct ClassBuffers<T> {
    buffers: Vec<ReplayBuffer<T>>,
}

impl<T: Clone> ClassBuffers<T> {
    /// Build `num_classes` buffers of `capacity`, each pre-filled by calling
    /// `seed(class)` once per slot.
    pub fn new(num_classes: usize, capacity: usize, mut seed: impl FnMut(usize) -> T) -> Self {
        let buffers = (0..num_classes)
            .map(|class| {
                let items = (0..capacity).map(|_| seed(class)).collect();
                ReplayBuffer::from_items(items, capacity)
            })
            .collect();
        Self { buffers }
    }

    /// Number of classes.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn get(&self, class: usize) -> Result<&ReplayBuffer<T>, SamplerError> {
        let num_classes = self.buffers.len();
        self.buffers
            .get(class)
            .ok_or(SamplerError::ClassOutOfRange { class, num_classes })
    }

    pub fn get_mut(&mut self, class: usize) -> Result<&mut ReplayBuffer<T>, SamplerError> {
        let num_classes = self.buffers.len();
        self.buffers
            .get_mut(class)
            .ok_or(SamplerError::ClassOutOfRange { class, num_classes })
    }
}
