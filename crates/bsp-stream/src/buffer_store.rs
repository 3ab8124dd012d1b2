//! Fixed-capacity per-channel history

use bsp_core::{ChannelSet, SampleBatch};
use std::collections::BTreeMap;
use tracing::debug;

/// Ring buffer of one channel's most recent values.
///
/// Storage is allocated once; writes overwrite in place at the sweep index.
#[derive(Debug, Clone)]
pub struct CircularBuffer {
    data: Vec<f64>,
    sweep: usize,
    len: usize,
}

impl CircularBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0.0; capacity.max(1)],
            sweep: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Slot the next value will be written to
    pub fn sweep_index(&self) -> usize {
        self.sweep
    }

    #[inline]
    pub fn push(&mut self, value: f64) {
        self.data[self.sweep] = value;
        self.sweep = (self.sweep + 1) % self.data.len();
        self.len = (self.len + 1).min(self.data.len());
    }

    pub fn extend<I: IntoIterator<Item = f64>>(&mut self, values: I) {
        for value in values {
            self.push(value);
        }
    }

    /// Contents oldest first
    pub fn to_vec(&self) -> Vec<f64> {
        if self.len < self.data.len() {
            self.data[..self.len].to_vec()
        } else {
            let mut out = Vec::with_capacity(self.len);
            out.extend_from_slice(&self.data[self.sweep..]);
            out.extend_from_slice(&self.data[..self.sweep]);
            out
        }
    }

    /// Last `n` values, oldest first
    pub fn latest(&self, n: usize) -> Vec<f64> {
        let n = n.min(self.len);
        let cap = self.data.len();
        let start = (self.sweep + cap - n) % cap;
        (0..n).map(|i| self.data[(start + i) % cap]).collect()
    }

    /// Most recent value
    pub fn last(&self) -> Option<f64> {
        if self.len == 0 {
            return None;
        }
        let cap = self.data.len();
        Some(self.data[(self.sweep + cap - 1) % cap])
    }

    pub fn reset(&mut self) {
        self.data.iter_mut().for_each(|v| *v = 0.0);
        self.sweep = 0;
        self.len = 0;
    }
}

/// One circular buffer per registered channel
#[derive(Debug, Clone)]
pub struct BufferStore {
    capacity: usize,
    channels: BTreeMap<usize, CircularBuffer>,
}

impl BufferStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: BTreeMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Create buffers for newly registered channels and drop the rest
    pub fn sync_channels(&mut self, registered: &ChannelSet) {
        let before = self.channels.len();
        let capacity = self.capacity;
        self.channels.retain(|ch, _| registered.contains(*ch));
        for ch in registered.iter() {
            self.channels
                .entry(ch)
                .or_insert_with(|| CircularBuffer::new(capacity));
        }
        debug!(before, after = self.channels.len(), "buffer channels synced");
    }

    pub fn append_batch(&mut self, batch: &SampleBatch) {
        for (&ch, buffer) in self.channels.iter_mut() {
            buffer.extend(batch.iter().map(|s| s.value(ch)));
        }
    }

    /// Clear one channel's history; `false` when the channel has no buffer
    pub fn reset_channel(&mut self, channel: usize) -> bool {
        match self.channels.get_mut(&channel) {
            Some(buffer) => {
                buffer.reset();
                true
            }
            None => false,
        }
    }

    pub fn channel(&self, channel: usize) -> Option<&CircularBuffer> {
        self.channels.get(&channel)
    }

    pub fn channels(&self) -> impl Iterator<Item = usize> + '_ {
        self.channels.keys().copied()
    }

    /// Chronological copy of every channel
    pub fn snapshot(&self) -> BTreeMap<usize, Vec<f64>> {
        self.channels
            .iter()
            .map(|(&ch, buffer)| (ch, buffer.to_vec()))
            .collect()
    }
}
