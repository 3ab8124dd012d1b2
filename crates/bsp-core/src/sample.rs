//! Sample records flowing through the streaming pipeline

use crate::error::{BspError, BspResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use uuid::Uuid;

/// Sequence ids wrap at this modulus.
pub const SEQUENCE_MODULUS: u32 = 1_000_000;

/// One multi-channel sample as produced by a connection adapter.
///
/// `channels` is the fixed-width value array `ch0..chN`. Raw device counts on
/// the way in, normalized values once the pipeline has processed the sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSample {
    /// Channel values indexed by zero-based channel number
    pub channels: Vec<f64>,
    /// Device or host timestamp in milliseconds
    pub timestamp: Option<f64>,
    /// Wrapping 8-bit device packet counter
    pub counter: Option<u8>,
    /// Copy of the raw values before normalization
    pub raw: Option<Vec<f64>>,
    /// Pipeline-assigned sequence id, monotonic modulo [`SEQUENCE_MODULUS`]
    pub sequence_id: Option<u32>,
}

impl ChannelSample {
    /// Create a sample from channel values
    pub fn new(channels: Vec<f64>) -> Self {
        Self {
            channels,
            timestamp: None,
            counter: None,
            raw: None,
            sequence_id: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_counter(mut self, counter: u8) -> Self {
        self.counter = Some(counter);
        self
    }

    /// Value of a channel slot; slots beyond the record width read as zero
    pub fn value(&self, channel: usize) -> f64 {
        self.channels.get(channel).copied().unwrap_or(0.0)
    }

    /// Number of channel slots carried by this record
    pub fn width(&self) -> usize {
        self.channels.len()
    }

    /// Parse a loosely-typed record `{ "ch0": n, ..., "timestamp"?: n, "counter"?: n }`.
    ///
    /// Channel keys must be exactly `ch{N}` with `N < channel_count`. Fields that
    /// fail validation are zeroed and tallied in the returned [`RecordIssues`];
    /// only a record that is not an object at all is rejected.
    pub fn from_record(record: &Value, channel_count: usize) -> BspResult<(Self, RecordIssues)> {
        let map = record.as_object().ok_or_else(|| BspError::MalformedRecord {
            reason: format!("expected an object, got {}", json_kind(record)),
        })?;

        let mut channels = vec![0.0; channel_count];
        let mut seen = vec![false; channel_count];
        let mut issues = RecordIssues::default();
        let mut sample_timestamp = None;
        let mut sample_counter = None;

        for (key, value) in map {
            match key.as_str() {
                "timestamp" => match value.as_f64().filter(|t| t.is_finite()) {
                    Some(t) => sample_timestamp = Some(t),
                    None => issues.non_numeric += 1,
                },
                "counter" => match value.as_u64() {
                    Some(c) => sample_counter = Some((c % 256) as u8),
                    None => issues.non_numeric += 1,
                },
                _ => match parse_channel_key(key) {
                    Some(index) if index < channel_count => {
                        seen[index] = true;
                        match value.as_f64().filter(|v| v.is_finite()) {
                            Some(v) => channels[index] = v,
                            None => issues.non_numeric += 1,
                        }
                    }
                    Some(_) => issues.out_of_range += 1,
                    None => issues.unknown_fields += 1,
                },
            }
        }

        issues.missing_channels = seen.iter().filter(|s| !**s).count();

        let sample = ChannelSample {
            channels,
            timestamp: sample_timestamp,
            counter: sample_counter,
            raw: None,
            sequence_id: None,
        };
        Ok((sample, issues))
    }
}

/// `ch{N}` with a canonical decimal index; `ch01`, `ch-1` and `ch` are rejected.
fn parse_channel_key(key: &str) -> Option<usize> {
    let digits = key.strip_prefix("ch")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    digits.parse().ok()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Tally of fields that were recovered while parsing a record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordIssues {
    /// Declared channels absent from the record (read as zero)
    pub missing_channels: usize,
    /// `ch{N}` keys with `N` beyond the declared width (ignored)
    pub out_of_range: usize,
    /// Present fields whose value was not a usable number (zeroed)
    pub non_numeric: usize,
    /// Keys that are neither channels nor known metadata (ignored)
    pub unknown_fields: usize,
}

impl RecordIssues {
    /// True when the record matched the declared shape exactly
    pub fn is_clean(&self) -> bool {
        *self == RecordIssues::default()
    }
}

/// Set of registered (active) zero-based channel indices
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSet(BTreeSet<usize>);

impl ChannelSet {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    /// All channels `0..count`
    pub fn all(count: usize) -> Self {
        Self((0..count).collect())
    }

    pub fn contains(&self, channel: usize) -> bool {
        self.0.contains(&channel)
    }

    pub fn insert(&mut self, channel: usize) -> bool {
        self.0.insert(channel)
    }

    pub fn remove(&mut self, channel: usize) -> bool {
        self.0.remove(&channel)
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Highest registered index, if any
    pub fn max(&self) -> Option<usize> {
        self.0.iter().next_back().copied()
    }
}

impl FromIterator<usize> for ChannelSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Ordered samples delivered together by one flush
#[derive(Debug, Clone)]
pub struct SampleBatch {
    /// Unique identifier for this batch
    pub id: Uuid,
    /// Processed samples in ingestion order
    pub samples: Vec<ChannelSample>,
    /// Creation timestamp (ms since the Unix epoch)
    pub created_at: u64,
}

impl SampleBatch {
    pub fn new(samples: Vec<ChannelSample>) -> Self {
        SampleBatch {
            id: Uuid::new_v4(),
            samples,
            created_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChannelSample> {
        self.samples.iter()
    }

    /// Values of one channel across the batch
    pub fn channel_values(&self, channel: usize) -> Vec<f64> {
        self.samples.iter().map(|s| s.value(channel)).collect()
    }

    /// Device counters present in the batch, in order
    pub fn counters(&self) -> impl Iterator<Item = u8> + '_ {
        self.samples.iter().filter_map(|s| s.counter)
    }
}
