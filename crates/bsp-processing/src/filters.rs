//! Digital filters for biosignal streaming
//!
//! Coefficients live in a [`CoefficientTable`] indexed by `(sampling rate, key)`.
//! Stateful [`FilterCascade`]s are created from it per channel and owned by a
//! [`FilterBank`], which tracks each channel's chain, sampling rate and
//! pending (rate not yet known) filters.

use bsp_core::{BspError, BspResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::f64::consts::PI;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Sampling rates the built-in table is designed for
pub const BUILTIN_RATES: [f64; 9] = [125.0, 200.0, 250.0, 256.0, 500.0, 512.0, 1000.0, 1600.0, 2000.0];

/// Mains notch centres
pub const NOTCH_FREQUENCIES: [f64; 2] = [50.0, 60.0];

/// Highpass cutoffs available as `highpass-{cutoff}`
pub const HIGHPASS_CUTOFFS: [f64; 12] = [0.01, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 30.0, 40.0, 50.0, 70.0];

/// Lowpass cutoffs available as `lowpass-{cutoff}`
pub const LOWPASS_CUTOFFS: [f64; 6] = [10.0, 20.0, 30.0, 40.0, 50.0, 70.0];

const NOTCH_Q: f64 = 30.0;

/// Butterworth order used for the highpass/lowpass entries
const BUTTERWORTH_ORDER: usize = 4;

/// Filter families addressable by key
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FilterKind {
    /// Mains notch at the given centre frequency
    Notch(f64),
    /// Butterworth highpass at the given cutoff
    Highpass(f64),
    /// Butterworth lowpass at the given cutoff
    Lowpass(f64),
}

impl FilterKind {
    /// Parse a key such as `notch-50`, `highpass-0.5` or `lowpass-40`
    pub fn parse(key: &str) -> Option<Self> {
        let (family, freq) = key.split_once('-')?;
        let freq: f64 = freq.parse().ok().filter(|f: &f64| f.is_finite() && *f > 0.0)?;
        match family {
            "notch" => Some(FilterKind::Notch(freq)),
            "highpass" => Some(FilterKind::Highpass(freq)),
            "lowpass" => Some(FilterKind::Lowpass(freq)),
            _ => None,
        }
    }

    /// Canonical table key
    pub fn key(&self) -> String {
        match self {
            FilterKind::Notch(f) => format!("notch-{}", f),
            FilterKind::Highpass(f) => format!("highpass-{}", f),
            FilterKind::Lowpass(f) => format!("lowpass-{}", f),
        }
    }

    fn frequency(&self) -> f64 {
        match *self {
            FilterKind::Notch(f) | FilterKind::Highpass(f) | FilterKind::Lowpass(f) => f,
        }
    }

    /// Design the second-order sections for this filter at `fs`.
    ///
    /// Returns `None` when the frequency is not strictly below Nyquist.
    pub fn design(&self, fs: f64) -> Option<Vec<Sos>> {
        if !(fs.is_finite() && fs > 0.0) || self.frequency() >= fs / 2.0 {
            return None;
        }
        let sections = match *self {
            FilterKind::Notch(f) => vec![Sos::notch(f, fs, NOTCH_Q)],
            FilterKind::Highpass(f) => butterworth_qs(BUTTERWORTH_ORDER)
                .map(|q| Sos::highpass(f, fs, q))
                .collect(),
            FilterKind::Lowpass(f) => butterworth_qs(BUTTERWORTH_ORDER)
                .map(|q| Sos::lowpass(f, fs, q))
                .collect(),
        };
        Some(sections)
    }
}

impl fmt::Display for FilterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Section Qs of an even-order Butterworth prototype
fn butterworth_qs(order: usize) -> impl Iterator<Item = f64> {
    (0..order / 2).map(move |k| {
        let theta = PI * (2 * k + 1) as f64 / (2 * order) as f64;
        1.0 / (2.0 * theta.cos())
    })
}

/// Second-order section coefficients, normalized so that `a0 == 1`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sos {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

impl Sos {
    pub fn new(b0: f64, b1: f64, b2: f64, a1: f64, a2: f64) -> Self {
        Self { b0, b1, b2, a1, a2 }
    }

    fn normalized(b0: f64, b1: f64, b2: f64, a0: f64, a1: f64, a2: f64) -> Self {
        let a0_inv = 1.0 / a0;
        Self {
            b0: b0 * a0_inv,
            b1: b1 * a0_inv,
            b2: b2 * a0_inv,
            a1: a1 * a0_inv,
            a2: a2 * a0_inv,
        }
    }

    /// Bilinear-transform lowpass section (frequency pre-warped at the cutoff)
    pub fn lowpass(cutoff: f64, fs: f64, q: f64) -> Self {
        let w0 = 2.0 * PI * cutoff / fs;
        let cos_w0 = w0.cos();
        let alpha = w0.sin() / (2.0 * q);
        let b1 = 1.0 - cos_w0;
        Self::normalized(b1 / 2.0, b1, b1 / 2.0, 1.0 + alpha, -2.0 * cos_w0, 1.0 - alpha)
    }

    /// Bilinear-transform highpass section
    pub fn highpass(cutoff: f64, fs: f64, q: f64) -> Self {
        let w0 = 2.0 * PI * cutoff / fs;
        let cos_w0 = w0.cos();
        let alpha = w0.sin() / (2.0 * q);
        let b0 = (1.0 + cos_w0) / 2.0;
        Self::normalized(b0, -(1.0 + cos_w0), b0, 1.0 + alpha, -2.0 * cos_w0, 1.0 - alpha)
    }

    /// Notch section with zeros on the unit circle at `center`
    pub fn notch(center: f64, fs: f64, q: f64) -> Self {
        let w0 = 2.0 * PI * center / fs;
        let cos_w0 = w0.cos();
        let alpha = w0.sin() / (2.0 * q);
        Self::normalized(1.0, -2.0 * cos_w0, 1.0, 1.0 + alpha, -2.0 * cos_w0, 1.0 - alpha)
    }
}

/// Single biquad: coefficients plus Direct Form II state
#[derive(Debug, Clone)]
struct Biquad {
    sos: Sos,
    z1: f64,
    z2: f64,
}

impl Biquad {
    fn new(sos: Sos) -> Self {
        Self { sos, z1: 0.0, z2: 0.0 }
    }

    #[inline]
    fn process(&mut self, input: f64) -> f64 {
        let x = input - self.sos.a1 * self.z1 - self.sos.a2 * self.z2;
        let output = self.sos.b0 * x + self.sos.b1 * self.z1 + self.sos.b2 * self.z2;
        self.z2 = self.z1;
        self.z1 = x;
        output
    }

    fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }
}

/// Stateful cascade of biquad sections for one `(channel, key)`
#[derive(Debug, Clone)]
pub struct FilterCascade {
    key: String,
    sampling_rate: f64,
    sections: Vec<Biquad>,
}

impl FilterCascade {
    fn new(key: &str, sampling_rate: f64, sections: &[Sos]) -> Self {
        Self {
            key: key.to_string(),
            sampling_rate,
            sections: sections.iter().copied().map(Biquad::new).collect(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn sampling_rate(&self) -> f64 {
        self.sampling_rate
    }

    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    /// Run one sample through every section in series
    #[inline]
    pub fn process(&mut self, input: f64) -> f64 {
        self.sections.iter_mut().fold(input, |value, section| section.process(value))
    }

    /// Filter a block in place
    pub fn process_block(&mut self, samples: &mut [f64]) {
        for sample in samples.iter_mut() {
            *sample = self.process(*sample);
        }
    }

    /// Zero all section state
    pub fn reset(&mut self) {
        for section in &mut self.sections {
            section.reset();
        }
    }

    /// Swap in coefficients for a new rate; state always restarts from zero
    fn retune(&mut self, sampling_rate: f64, sections: &[Sos]) {
        self.sampling_rate = sampling_rate;
        if self.sections.len() == sections.len() {
            for (section, sos) in self.sections.iter_mut().zip(sections) {
                section.sos = *sos;
                section.reset();
            }
        } else {
            self.sections = sections.iter().copied().map(Biquad::new).collect();
        }
    }
}

/// Rates are keyed in millihertz so fractional rates still hash exactly
fn rate_key(rate: f64) -> Option<u64> {
    if rate.is_finite() && rate > 0.0 {
        Some((rate * 1000.0).round() as u64)
    } else {
        None
    }
}

/// Coefficient table indexed by `(sampling rate, filter key)`
#[derive(Debug, Clone, Default)]
pub struct CoefficientTable {
    entries: HashMap<(u64, String), Vec<Sos>>,
}

impl CoefficientTable {
    /// Empty table, for fully custom coefficient sets
    pub fn empty() -> Self {
        Self::default()
    }

    /// Table holding every built-in key at every built-in rate
    pub fn builtin() -> Self {
        let mut table = Self::empty();
        let kinds = NOTCH_FREQUENCIES.iter().map(|&f| FilterKind::Notch(f))
            .chain(HIGHPASS_CUTOFFS.iter().map(|&f| FilterKind::Highpass(f)))
            .chain(LOWPASS_CUTOFFS.iter().map(|&f| FilterKind::Lowpass(f)));

        for kind in kinds {
            for &rate in &BUILTIN_RATES {
                if let Some(sections) = kind.design(rate) {
                    table.insert(rate, &kind.key(), sections);
                }
            }
        }
        table
    }

    /// Add or replace an entry. Invalid rates are ignored.
    pub fn insert(&mut self, sampling_rate: f64, key: &str, sections: Vec<Sos>) {
        if let Some(rate) = rate_key(sampling_rate) {
            self.entries.insert((rate, key.to_string()), sections);
        }
    }

    pub fn get(&self, key: &str, sampling_rate: f64) -> Option<&[Sos]> {
        let rate = rate_key(sampling_rate)?;
        self.entries.get(&(rate, key.to_string())).map(Vec::as_slice)
    }

    pub fn contains(&self, key: &str, sampling_rate: f64) -> bool {
        self.get(key, sampling_rate).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Create a zero-state cascade, or `None` when the pair is not in the table
    pub fn create_filter_instance(&self, key: &str, sampling_rate: f64) -> Option<FilterCascade> {
        self.get(key, sampling_rate)
            .map(|sections| FilterCascade::new(key, sampling_rate, sections))
    }
}

/// Per-channel filter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterConfig {
    /// Filtering on/off for the channel
    pub enabled: bool,
    /// Keys applied in order, e.g. `["highpass-1", "notch-50"]`
    pub filter_keys: Vec<String>,
    /// Sampling rate, when the configuration already knows it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling_rate: Option<f64>,
}

impl FilterConfig {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            enabled: true,
            filter_keys: keys.into_iter().map(Into::into).collect(),
            sampling_rate: None,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            filter_keys: Vec::new(),
            sampling_rate: None,
        }
    }

    pub fn with_sampling_rate(mut self, rate: f64) -> Self {
        self.sampling_rate = Some(rate);
        self
    }

    /// Typical EEG chain: 1 Hz highpass, 50 Hz lowpass, mains notch
    pub fn eeg_default(mains: f64) -> Self {
        Self::new([
            FilterKind::Highpass(1.0).key(),
            FilterKind::Lowpass(50.0).key(),
            FilterKind::Notch(mains).key(),
        ])
    }
}

/// State of one configured key on a channel
#[derive(Debug, Clone)]
struct KeySlot {
    key: String,
    instance: Option<FilterCascade>,
}

#[derive(Debug, Clone)]
struct ChannelFilters {
    config: FilterConfig,
    /// Rate set for this channel specifically (config or setter)
    rate: Option<f64>,
    slots: Vec<KeySlot>,
}

/// Status of a configured key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    /// Instance exists and filters samples
    Active,
    /// Waiting for the channel's sampling rate
    Pending,
    /// `(key, rate)` not in the table; bypassed
    Unavailable,
}

/// Pipeline-owned registry of per-channel filter cascades
#[derive(Debug)]
pub struct FilterBank {
    table: Arc<CoefficientTable>,
    channels: BTreeMap<usize, ChannelFilters>,
    global_rate: Option<f64>,
}

impl FilterBank {
    pub fn new(table: Arc<CoefficientTable>) -> Self {
        Self {
            table,
            channels: BTreeMap::new(),
            global_rate: None,
        }
    }

    pub fn table(&self) -> &Arc<CoefficientTable> {
        &self.table
    }

    /// Rate in effect for a channel (its own, else the global one)
    pub fn sampling_rate(&self, channel: usize) -> Option<f64> {
        self.channels
            .get(&channel)
            .and_then(|c| c.rate)
            .or(self.global_rate)
    }

    /// Replace a channel's configuration.
    ///
    /// All of the channel's cascades restart from zero state. Returns `true`
    /// when the effective chain (enabled flag, keys or rate) changed.
    pub fn configure_channel(&mut self, channel: usize, config: FilterConfig) -> BspResult<bool> {
        if let Some(rate) = config.sampling_rate {
            validate_rate(rate)?;
        }

        let previous_rate = self.sampling_rate(channel);
        let previous = self.channels.remove(&channel);
        let rate = config
            .sampling_rate
            .or_else(|| previous.as_ref().and_then(|p| p.rate));
        let effective_rate = rate.or(self.global_rate);

        let slots = config
            .filter_keys
            .iter()
            .map(|key| KeySlot {
                key: key.clone(),
                instance: effective_rate.and_then(|r| self.table.create_filter_instance(key, r)),
            })
            .collect::<Vec<_>>();

        if let Some(r) = effective_rate {
            for slot in slots.iter().filter(|s| s.instance.is_none()) {
                warn!(channel, key = %slot.key, rate = r, "no coefficients for filter; bypassing");
            }
        }

        let changed = match &previous {
            Some(prev) => prev.config.enabled != config.enabled
                || prev.config.filter_keys != config.filter_keys
                || previous_rate != effective_rate,
            None => config.enabled && !config.filter_keys.is_empty(),
        };

        debug!(channel, keys = ?config.filter_keys, enabled = config.enabled, "filter chain configured");
        self.channels.insert(channel, ChannelFilters { config, rate, slots });
        Ok(changed)
    }

    /// Set one channel's sampling rate.
    ///
    /// Returns `true` when the rate actually changed; in that case every cascade
    /// on the channel is retuned from zero state and pending keys activate.
    pub fn set_sampling_rate(&mut self, channel: usize, rate: f64) -> BspResult<bool> {
        validate_rate(rate)?;
        let previous = self.sampling_rate(channel);
        let table = Arc::clone(&self.table);

        let entry = self.channels.entry(channel).or_insert_with(|| ChannelFilters {
            config: FilterConfig::disabled(),
            rate: None,
            slots: Vec::new(),
        });
        entry.rate = Some(rate);

        if previous == Some(rate) {
            return Ok(false);
        }
        retune_slots(&table, channel, &mut entry.slots, rate);
        Ok(true)
    }

    /// Set the rate used by channels that have none of their own.
    ///
    /// Returns the configured channels whose effective rate changed.
    pub fn set_global_sampling_rate(&mut self, rate: f64) -> BspResult<Vec<usize>> {
        validate_rate(rate)?;
        let previous = self.global_rate.replace(rate);
        if previous == Some(rate) {
            return Ok(Vec::new());
        }

        let table = Arc::clone(&self.table);
        let mut changed = Vec::new();
        for (&channel, filters) in self.channels.iter_mut() {
            if filters.rate.is_some() {
                continue;
            }
            retune_slots(&table, channel, &mut filters.slots, rate);
            if filters.config.enabled && !filters.slots.is_empty() {
                changed.push(channel);
            }
        }
        Ok(changed)
    }

    /// Filter one value on a channel; unconfigured or disabled channels pass through
    #[inline]
    pub fn process(&mut self, channel: usize, value: f64) -> f64 {
        match self.channels.get_mut(&channel) {
            Some(filters) if filters.config.enabled => filters
                .slots
                .iter_mut()
                .filter_map(|slot| slot.instance.as_mut())
                .fold(value, |v, cascade| cascade.process(v)),
            _ => value,
        }
    }

    /// Zero every cascade on a channel without touching its configuration
    pub fn reset_channel(&mut self, channel: usize) {
        if let Some(filters) = self.channels.get_mut(&channel) {
            for cascade in filters.slots.iter_mut().filter_map(|s| s.instance.as_mut()) {
                cascade.reset();
            }
        }
    }

    /// Zero every cascade on every channel
    pub fn reset(&mut self) {
        let channels: Vec<usize> = self.channels.keys().copied().collect();
        for channel in channels {
            self.reset_channel(channel);
        }
    }

    /// Current configuration of a channel
    pub fn config(&self, channel: usize) -> Option<&FilterConfig> {
        self.channels.get(&channel).map(|c| &c.config)
    }

    /// Every configured channel with its configuration
    pub fn configs(&self) -> BTreeMap<usize, FilterConfig> {
        self.channels
            .iter()
            .map(|(&ch, filters)| (ch, filters.config.clone()))
            .collect()
    }

    /// Keys on a channel and whether each is active, pending or unavailable
    pub fn key_status(&self, channel: usize) -> Vec<(String, KeyStatus)> {
        let rate_known = self.sampling_rate(channel).is_some();
        self.channels
            .get(&channel)
            .map(|filters| {
                filters
                    .slots
                    .iter()
                    .map(|slot| {
                        let status = match (&slot.instance, rate_known) {
                            (Some(_), _) => KeyStatus::Active,
                            (None, false) => KeyStatus::Pending,
                            (None, true) => KeyStatus::Unavailable,
                        };
                        (slot.key.clone(), status)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Keys on a channel that currently have an instance
    pub fn active_keys(&self, channel: usize) -> Vec<String> {
        self.key_status(channel)
            .into_iter()
            .filter(|(_, status)| *status == KeyStatus::Active)
            .map(|(key, _)| key)
            .collect()
    }
}

fn retune_slots(table: &CoefficientTable, channel: usize, slots: &mut [KeySlot], rate: f64) {
    for slot in slots.iter_mut() {
        match (table.get(&slot.key, rate), slot.instance.as_mut()) {
            (Some(sections), Some(cascade)) => cascade.retune(rate, sections),
            (Some(sections), None) => {
                slot.instance = Some(FilterCascade::new(&slot.key, rate, sections));
            }
            (None, _) => {
                warn!(channel, key = %slot.key, rate, "no coefficients for filter; bypassing");
                slot.instance = None;
            }
        }
    }
}

fn validate_rate(rate: f64) -> BspResult<()> {
    if rate.is_finite() && rate > 0.0 {
        Ok(())
    } else {
        Err(BspError::InvalidSamplingRate { rate })
    }
}
