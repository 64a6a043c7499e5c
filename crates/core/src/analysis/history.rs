use std::collections::{vec_deque, VecDeque};

/// Fixed-capacity FIFO window. Pushing into a full window evicts the oldest
/// entry, so the length never exceeds the capacity.
#[derive(Debug, Clone)]
pub struct BoundedHistory<T> {
    values: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedHistory<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, value: T) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn last(&self) -> Option<&T> {
        self.values.back()
    }

    /// Iterates from oldest to newest.
    pub fn iter(&self) -> vec_deque::Iter<'_, T> {
        self.values.iter()
    }
}

impl BoundedHistory<f64> {
    pub fn mean(&self) -> Option<f64> {
        mean(self.values.iter().copied())
    }

    pub fn max(&self) -> Option<f64> {
        self.values.iter().copied().reduce(f64::max)
    }

    /// Mean of the newest `count` entries (fewer if the window is shorter).
    pub fn tail_mean(&self, count: usize) -> Option<f64> {
        let skip = self.values.len().saturating_sub(count);
        mean(self.values.iter().skip(skip).copied())
    }
}

impl<'a, T> IntoIterator for &'a BoundedHistory<T> {
    type Item = &'a T;
    type IntoIter = vec_deque::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub(crate) fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / count as f64)
}
