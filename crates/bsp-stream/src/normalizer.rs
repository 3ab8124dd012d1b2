//! Raw device counts to centred, filtered, unit-scaled values

use bsp_core::{ChannelSample, ChannelSet};
use bsp_processing::FilterBank;

/// How a channel's full-scale range is determined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullScale {
    /// `2^bits` from a configured ADC resolution
    Explicit(u32),
    /// Smallest power of two covering the largest value seen so far
    Inferred,
}

/// Per-pipeline sample normalizer; owns the filter bank
#[derive(Debug)]
pub struct Normalizer {
    channel_count: usize,
    registered: ChannelSet,
    full_scale: FullScale,
    observed_max: Vec<f64>,
    filters: FilterBank,
    keep_raw: bool,
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

/// Smallest power of two `>= value`, at least 2
fn power_of_two_ceiling(value: f64) -> f64 {
    let value = value.max(2.0);
    2f64.powi(value.log2().ceil() as i32)
}

impl Normalizer {
    pub fn new(channel_count: usize, registered: ChannelSet, filters: FilterBank) -> Self {
        Self {
            channel_count,
            registered,
            full_scale: FullScale::Inferred,
            observed_max: vec![0.0; channel_count],
            filters,
            keep_raw: false,
        }
    }

    pub fn with_bit_depth(mut self, bit_depth: Option<u32>) -> Self {
        self.set_bit_depth(bit_depth);
        self
    }

    pub fn with_raw_snapshot(mut self, keep_raw: bool) -> Self {
        self.keep_raw = keep_raw;
        self
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    pub fn registered(&self) -> &ChannelSet {
        &self.registered
    }

    pub fn set_registered(&mut self, registered: ChannelSet) {
        self.registered = registered;
    }

    pub fn full_scale_mode(&self) -> FullScale {
        self.full_scale
    }

    /// Explicit resolution, or `None` to fall back to inference
    pub fn set_bit_depth(&mut self, bit_depth: Option<u32>) {
        self.full_scale = match bit_depth {
            Some(bits) => FullScale::Explicit(bits),
            None => FullScale::Inferred,
        };
    }

    pub fn filters(&self) -> &FilterBank {
        &self.filters
    }

    pub fn filters_mut(&mut self) -> &mut FilterBank {
        &mut self.filters
    }

    /// Full-scale range in effect for a channel given the current raw value
    fn full_scale(&mut self, channel: usize, raw: f64) -> f64 {
        match self.full_scale {
            FullScale::Explicit(bits) => 2f64.powi(bits as i32),
            FullScale::Inferred => {
                let observed = &mut self.observed_max[channel];
                if raw > *observed {
                    *observed = raw;
                }
                power_of_two_ceiling(*observed)
            }
        }
    }

    /// Normalize one raw sample.
    ///
    /// Unregistered channels come out as exactly zero and do not advance
    /// their filters. Missing slots and non-finite values read as zero.
    pub fn normalize(&mut self, sample: &ChannelSample) -> ChannelSample {
        let mut channels = vec![0.0; self.channel_count];

        for (channel, slot) in channels.iter_mut().enumerate() {
            if !self.registered.contains(channel) {
                continue;
            }
            let raw = finite_or_zero(sample.value(channel));
            let half_scale = self.full_scale(channel, raw) / 2.0;
            let centered = raw - half_scale;
            let filtered = self.filters.process(channel, centered);
            *slot = finite_or_zero(filtered / half_scale);
        }

        ChannelSample {
            channels,
            timestamp: sample.timestamp,
            counter: sample.counter,
            raw: self.keep_raw.then(|| sample.channels.clone()),
            sequence_id: sample.sequence_id,
        }
    }

    /// Forget inferred ranges and zero every filter
    pub fn reset(&mut self) {
        self.observed_max.iter_mut().for_each(|m| *m = 0.0);
        self.filters.reset();
    }
}
