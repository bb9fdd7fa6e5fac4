use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::drivers::{RingBuffer, SeriesSnapshot, StoreError};

struct StoreInner {
    buffers: BTreeMap<String, RingBuffer<f64>>,
    /// Absolute timestamp of the first sample of the session.
    t0: Option<f64>,
    /// Running maximum of relative timestamps across every channel.
    latest_t: Option<f64>,
}

/// Per-channel ring buffers shared between one producer and one consumer.
///
/// One coarse lock covers lookup-or-create, the `t0`/`latest_t` bookkeeping
/// and the append, so cross-channel state never tears. Readers only ever get
/// copies, so the lock is not held while rendering.
pub struct ChannelStore {
    inner: Mutex<StoreInner>,
    capacity: usize,
}

impl ChannelStore {
    pub fn new(capacity: usize) -> Result<Self, StoreError> {
        if capacity == 0 {
            return Err(StoreError::CapacityInvalid);
        }
        Ok(Self {
            inner: Mutex::new(StoreInner {
                buffers: BTreeMap::new(),
                t0: None,
                latest_t: None,
            }),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // Every critical section leaves the state consistent, so a panic on the
    // other side must not take the data down with it.
    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append(&self, channel: &str, absolute_t: f64, value: f64) {
        let mut inner = self.lock();
        let t0 = *inner.t0.get_or_insert(absolute_t);
        let relative_t = absolute_t - t0;
        inner.latest_t = Some(match inner.latest_t {
            Some(latest) => latest.max(relative_t),
            None => relative_t,
        });
        if let Some(buffer) = inner.buffers.get_mut(channel) {
            buffer.append(relative_t, value);
            return;
        }
        // Capacity was validated in `new`, so creation cannot fail.
        if let Ok(mut buffer) = RingBuffer::with_capacity(self.capacity) {
            buffer.append(relative_t, value);
            inner.buffers.insert(channel.to_owned(), buffer);
        }
    }

    /// Self-consistent copy of one channel, or `None` if it was never written.
    pub fn snapshot(&self, channel: &str) -> Option<SeriesSnapshot> {
        self.lock().buffers.get(channel).map(RingBuffer::snapshot)
    }

    /// Sorted channel names.
    pub fn channel_names(&self) -> Vec<String> {
        self.lock().buffers.keys().cloned().collect()
    }

    pub fn channel_count(&self) -> usize {
        self.lock().buffers.len()
    }

    pub fn latest_timestamp(&self) -> Option<f64> {
        self.lock().latest_t
    }

    /// Drops every channel and resets the session clock.
    ///
    /// Only call this while the producer is quiesced.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.buffers.clear();
        inner.t0 = None;
        inner.latest_t = None;
        log::info!("channel store cleared");
    }
}
