use crate::drivers::StoreError;

/// Time-ordered copy of a buffer's contents, safe to use outside any lock.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SeriesSnapshot<T = f64> {
    pub times: Vec<f64>,
    pub values: Vec<T>,
}

impl<T> SeriesSnapshot<T> {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Index range of samples with `t_lo <= time <= t_hi`.
    ///
    /// Relies on `times` being ascending; both bounds are binary searches.
    pub fn visible_range(&self, t_lo: f64, t_hi: f64) -> std::ops::Range<usize> {
        let left = self.times.partition_point(|&t| t < t_lo);
        let right = self.times.partition_point(|&t| t <= t_hi);
        left..right.max(left)
    }
}

/// Fixed-capacity sample store that overwrites the oldest entry when full.
///
/// Appends are expected to be time-monotonic; `snapshot` rotates at `head`
/// instead of sorting, so out-of-order input comes back in append order.
pub struct RingBuffer<T = f64> {
    times: Vec<f64>,
    values: Vec<T>,
    capacity: usize,
    head: usize,
}

impl<T: Copy> RingBuffer<T> {
    pub fn with_capacity(capacity: usize) -> Result<Self, StoreError> {
        if capacity == 0 {
            return Err(StoreError::CapacityInvalid);
        }
        Ok(Self {
            times: Vec::with_capacity(capacity),
            values: Vec::with_capacity(capacity),
            capacity,
            head: 0,
        })
    }

    pub fn is_full(&self) -> bool {
        self.times.len() == self.capacity
    }

    pub fn append(&mut self, t: f64, value: T) {
        if self.is_full() {
            self.times[self.head] = t;
            self.values[self.head] = value;
        } else {
            // Not wrapped yet, so head always equals len here.
            self.times.push(t);
            self.values.push(value);
        }
        self.head = (self.head + 1) % self.capacity;
    }

    pub fn snapshot(&self) -> SeriesSnapshot<T> {
        if !self.is_full() {
            return SeriesSnapshot {
                times: self.times.clone(),
                values: self.values.clone(),
            };
        }
        // Wrapped: the oldest sample sits at head.
        let mut times = Vec::with_capacity(self.capacity);
        let mut values = Vec::with_capacity(self.capacity);
        times.extend_from_slice(&self.times[self.head..]);
        times.extend_from_slice(&self.times[..self.head]);
        values.extend_from_slice(&self.values[self.head..]);
        values.extend_from_slice(&self.values[..self.head]);
        SeriesSnapshot { times, values }
    }
}
