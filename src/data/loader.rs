//! Batch index iteration.

use rand::seq::SliceRandom;
use rand::Rng;

/// Yields batches of row indices over a data set of fixed length.
#[derive(Debug, Clone)]
pub struct DataLoader {
    order: Vec<usize>,
    batch_size: usize,
    drop_last: bool,
    cursor: usize,
}

impl DataLoader {
    /// Sequential loader over `len` rows.
    pub fn new(len: usize, batch_size: usize) -> Self {
        Self {
            order: (0..len).collect(),
            batch_size: batch_size.max(1),
            drop_last: false,
            cursor: 0,
        }
    }

    /// Shuffle the visiting order with the given RNG.
    pub fn shuffled<R: Rng + ?Sized>(mut self, rng: &mut R) -> Self {
        self.order.shuffle(rng);
        self
    }

    /// Skip a trailing batch smaller than `batch_size`.
    pub fn with_drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    /// Number of batches this loader yields in total.
    pub fn num_batches(&self) -> usize {
        let n = self.order.len();
        if self.drop_last {
            n / self.batch_size
        } else {
            (n + self.batch_size - 1) / self.batch_size
        }
    }
}

impl Iterator for DataLoader {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.order.len() - self.cursor;
        if remaining == 0 || (self.drop_last && remaining < self.batch_size) {
            return None;
        }

        let end = (self.cursor + self.batch_size).min(self.order.len());
        let batch = self.order[self.cursor..end].to_vec();
        self.cursor = end;
        Some(batch)
    }
}
