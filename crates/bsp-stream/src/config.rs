//! Pipeline configuration

use bsp_core::{config_error, BspError, BspResult, ChannelSet};
use bsp_processing::{FilterConfig, FilterKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Upper bound on declared channel slots
pub const MAX_CHANNELS: usize = 1024;

/// Configuration of one streaming pipeline.
///
/// Imports may omit any field. A missing `registeredChannels` registers
/// every declared channel; other missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "PipelineConfigImport")]
pub struct PipelineConfig {
    /// Configuration name/profile
    pub name: String,
    /// Declared channel slots `ch0..ch{n-1}`
    pub channel_count: usize,
    /// Active channels; the rest are forced to zero
    pub registered_channels: ChannelSet,
    /// Global sampling rate, if known up front
    pub sampling_rate: Option<f64>,
    /// ADC resolution; inferred from observed values when absent
    pub bit_depth: Option<u32>,
    /// Samples kept per channel in the circular buffers
    pub buffer_capacity: usize,
    /// Pending samples held before the oldest are dropped
    pub queue_capacity: usize,
    /// Fraction of `queue_capacity` dropped on overflow
    pub drop_fraction: f64,
    /// Minimum spacing between snapshot refreshes
    pub snapshot_interval_ms: u64,
    /// Frames kept per widget-output stream
    pub output_capacity: usize,
    /// Keep a copy of the raw values on each processed sample
    pub keep_raw_snapshot: bool,
    /// Minimum spacing between missing-sample reports
    pub counter_report_interval_ms: u64,
    /// FFT engines kept in the analysis cache
    pub fft_cache_capacity: usize,
    /// Per-channel filter chains
    pub filters: BTreeMap<usize, FilterConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            channel_count: 8,
            registered_channels: ChannelSet::all(8),
            sampling_rate: None,
            bit_depth: None,
            buffer_capacity: 2048,
            queue_capacity: 5000,
            drop_fraction: 0.2,
            snapshot_interval_ms: 200,
            output_capacity: 256,
            keep_raw_snapshot: false,
            counter_report_interval_ms: 1000,
            fft_cache_capacity: 8,
            filters: BTreeMap::new(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PipelineConfigImport {
    name: Option<String>,
    channel_count: Option<usize>,
    registered_channels: Option<ChannelSet>,
    sampling_rate: Option<f64>,
    bit_depth: Option<u32>,
    buffer_capacity: Option<usize>,
    queue_capacity: Option<usize>,
    drop_fraction: Option<f64>,
    snapshot_interval_ms: Option<u64>,
    output_capacity: Option<usize>,
    keep_raw_snapshot: Option<bool>,
    counter_report_interval_ms: Option<u64>,
    fft_cache_capacity: Option<usize>,
    filters: Option<BTreeMap<usize, FilterConfig>>,
}

impl From<PipelineConfigImport> for PipelineConfig {
    fn from(import: PipelineConfigImport) -> Self {
        let defaults = PipelineConfig::default();
        let channel_count = import.channel_count.unwrap_or(defaults.channel_count);
        Self {
            name: import.name.unwrap_or(defaults.name),
            channel_count,
            registered_channels: import
                .registered_channels
                .unwrap_or_else(|| ChannelSet::all(channel_count)),
            sampling_rate: import.sampling_rate.or(defaults.sampling_rate),
            bit_depth: import.bit_depth.or(defaults.bit_depth),
            buffer_capacity: import.buffer_capacity.unwrap_or(defaults.buffer_capacity),
            queue_capacity: import.queue_capacity.unwrap_or(defaults.queue_capacity),
            drop_fraction: import.drop_fraction.unwrap_or(defaults.drop_fraction),
            snapshot_interval_ms: import.snapshot_interval_ms.unwrap_or(defaults.snapshot_interval_ms),
            output_capacity: import.output_capacity.unwrap_or(defaults.output_capacity),
            keep_raw_snapshot: import.keep_raw_snapshot.unwrap_or(defaults.keep_raw_snapshot),
            counter_report_interval_ms: import
                .counter_report_interval_ms
                .unwrap_or(defaults.counter_report_interval_ms),
            fft_cache_capacity: import.fft_cache_capacity.unwrap_or(defaults.fft_cache_capacity),
            filters: import.filters.unwrap_or(defaults.filters),
        }
    }
}

/// Processing profiles for different use cases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingProfile {
    /// Short chains and buffers for live display
    RealTime,
    /// Wider passband, both mains notches, long history
    Research,
}

impl ProcessingProfile {
    /// Filter chain applied to every channel
    pub fn filter_chain(self, mains: f64) -> FilterConfig {
        match self {
            ProcessingProfile::RealTime => FilterConfig::new([
                FilterKind::Highpass(1.0).key(),
                FilterKind::Notch(mains).key(),
            ]),
            ProcessingProfile::Research => FilterConfig::new([
                FilterKind::Highpass(0.5).key(),
                FilterKind::Lowpass(70.0).key(),
                FilterKind::Notch(50.0).key(),
                FilterKind::Notch(60.0).key(),
            ]),
        }
    }

    fn buffer_seconds(self) -> f64 {
        match self {
            ProcessingProfile::RealTime => 4.0,
            ProcessingProfile::Research => 30.0,
        }
    }
}

impl PipelineConfig {
    /// EEG preset: every channel registered with the default EEG chain
    pub fn eeg(channel_count: usize, sampling_rate: f64) -> Self {
        let filters = (0..channel_count)
            .map(|ch| (ch, FilterConfig::eeg_default(50.0)))
            .collect();
        Self {
            name: "EEG".to_string(),
            channel_count,
            registered_channels: ChannelSet::all(channel_count),
            sampling_rate: Some(sampling_rate),
            buffer_capacity: (sampling_rate * 8.0).round().max(1.0) as usize,
            filters,
            ..Self::default()
        }
    }

    /// Apply a profile's filter chain and history length
    pub fn with_profile(mut self, profile: ProcessingProfile, mains: f64) -> Self {
        let chain = profile.filter_chain(mains);
        self.filters = (0..self.channel_count).map(|ch| (ch, chain.clone())).collect();
        if let Some(rate) = self.sampling_rate {
            self.buffer_capacity = (rate * profile.buffer_seconds()).round().max(1.0) as usize;
        }
        if profile == ProcessingProfile::RealTime {
            self.snapshot_interval_ms = 100;
        }
        self.name = format!("{} ({:?})", self.name, profile);
        self
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }

    pub fn counter_report_interval(&self) -> Duration {
        Duration::from_millis(self.counter_report_interval_ms)
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> BspResult<()> {
        if self.channel_count == 0 || self.channel_count > MAX_CHANNELS {
            return Err(config_error!(
                "channel count {} outside 1..={}",
                self.channel_count,
                MAX_CHANNELS
            ));
        }
        if let Some(index) = self.registered_channels.max() {
            if index >= self.channel_count {
                return Err(BspError::ChannelOutOfRange {
                    index,
                    channel_count: self.channel_count,
                });
            }
        }
        if let Some(rate) = self.sampling_rate {
            if !(rate.is_finite() && rate > 0.0) {
                return Err(BspError::InvalidSamplingRate { rate });
            }
        }
        if let Some(bits) = self.bit_depth {
            if bits == 0 || bits > 32 {
                return Err(config_error!("bit depth {} outside 1..=32", bits));
            }
        }
        if self.buffer_capacity == 0 {
            return Err(config_error!("buffer capacity must be positive"));
        }
        if self.queue_capacity == 0 {
            return Err(config_error!("queue capacity must be positive"));
        }
        if !(self.drop_fraction > 0.0 && self.drop_fraction <= 1.0) {
            return Err(config_error!("drop fraction {} outside (0, 1]", self.drop_fraction));
        }
        if self.output_capacity == 0 {
            return Err(config_error!("output capacity must be positive"));
        }
        if self.fft_cache_capacity == 0 {
            return Err(config_error!("FFT cache capacity must be positive"));
        }
        for (&channel, filter) in &self.filters {
            if channel >= self.channel_count {
                return Err(BspError::ChannelOutOfRange {
                    index: channel,
                    channel_count: self.channel_count,
                });
            }
            if let Some(rate) = filter.sampling_rate {
                if !(rate.is_finite() && rate > 0.0) {
                    return Err(BspError::InvalidSamplingRate { rate });
                }
            }
        }
        Ok(())
    }

    /// Export configuration as pretty JSON
    pub fn to_json(&self) -> BspResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Import and validate a JSON configuration
    pub fn from_json(json: &str) -> BspResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}
