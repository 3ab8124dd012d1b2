//! Physiological band-power estimation
//!
//! Two reducers share the same five bands: a direct estimator over a single
//! magnitude spectrum and a Welch PSD estimator over overlapping Hann
//! segments. [`BandSmoother`] layers a moving average over either one.

use crate::fft::{FftCache, FftEngine, MAX_FFT_SIZE};
use bsp_core::{BspError, BspResult};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

pub const BAND_COUNT: usize = 5;

/// Lower bound for decibel output
pub const DB_FLOOR: f64 = -120.0;

/// One value per band, ordered delta, theta, alpha, beta, gamma
pub type BandValues = [f64; BAND_COUNT];

/// EEG frequency bands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Band {
    Delta,
    Theta,
    Alpha,
    Beta,
    Gamma,
}

impl Band {
    pub const ALL: [Band; BAND_COUNT] = [Band::Delta, Band::Theta, Band::Alpha, Band::Beta, Band::Gamma];

    /// Half-open range `[low, high)` in Hz
    pub fn range(self) -> (f64, f64) {
        match self {
            Band::Delta => (0.5, 4.0),
            Band::Theta => (4.0, 8.0),
            Band::Alpha => (8.0, 12.0),
            Band::Beta => (12.0, 30.0),
            Band::Gamma => (30.0, 45.0),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Band::Delta => "delta",
            Band::Theta => "theta",
            Band::Alpha => "alpha",
            Band::Beta => "beta",
            Band::Gamma => "gamma",
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn contains(self, frequency: f64) -> bool {
        let (low, high) = self.range();
        frequency >= low && frequency < high
    }

    /// Band that a frequency falls in, if any
    pub fn of(frequency: f64) -> Option<Band> {
        Band::ALL.into_iter().find(|b| b.contains(frequency))
    }
}

/// Band powers from one analysis pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandPowerResult {
    pub raw: BandValues,
    pub relative: BandValues,
    /// Per-band decibels, floored at [`DB_FLOOR`]
    pub db: Option<BandValues>,
}

impl BandPowerResult {
    fn zeroed(with_db: bool) -> Self {
        Self {
            raw: [0.0; BAND_COUNT],
            relative: [0.0; BAND_COUNT],
            db: with_db.then_some([DB_FLOOR; BAND_COUNT]),
        }
    }

    pub fn get(&self, band: Band) -> f64 {
        self.raw[band.index()]
    }

    pub fn relative(&self, band: Band) -> f64 {
        self.relative[band.index()]
    }

    /// Band with the largest raw power; `None` when every band is empty
    pub fn dominant(&self) -> Option<Band> {
        Band::ALL
            .into_iter()
            .filter(|b| self.raw[b.index()] > 0.0)
            .max_by(|a, b| self.raw[a.index()].total_cmp(&self.raw[b.index()]))
    }
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

/// Share of each band in `total`; zeros unless `total` is positive and finite
fn relative_of(raw: &BandValues, total: f64) -> BandValues {
    let mut relative = [0.0; BAND_COUNT];
    if total > 0.0 && total.is_finite() {
        for (r, &p) in relative.iter_mut().zip(raw) {
            *r = finite_or_zero(p / total);
        }
    }
    relative
}

/// `10·log10(power)` floored at [`DB_FLOOR`]
pub fn to_db(power: f64) -> f64 {
    if power > 0.0 && power.is_finite() {
        (10.0 * power.log10()).max(DB_FLOOR)
    } else {
        DB_FLOOR
    }
}

/// Sum squared magnitudes per band.
///
/// `magnitudes` is the `N/2` half spectrum produced by
/// [`FftEngine::compute_magnitudes`]; bin `k` sits at `k·fs/N`. The DC bin is
/// never counted. Relative powers are each band's share of the band sum.
pub fn direct_band_powers(magnitudes: &[f64], sample_rate: f64, fft_size: usize) -> BandPowerResult {
    if fft_size == 0 || !(sample_rate > 0.0 && sample_rate.is_finite()) {
        return BandPowerResult::zeroed(false);
    }

    let resolution = sample_rate / fft_size as f64;
    let mut raw = [0.0; BAND_COUNT];
    for (k, &m) in magnitudes.iter().enumerate().skip(1) {
        if let Some(band) = Band::of(k as f64 * resolution) {
            let m = finite_or_zero(m);
            raw[band.index()] += m * m;
        }
    }

    let total: f64 = raw.iter().sum();
    BandPowerResult {
        relative: relative_of(&raw, total),
        raw,
        db: None,
    }
}

/// Welch estimator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WelchConfig {
    /// Samples per segment, at most `MAX_FFT_SIZE`; shorter signals use a
    /// single segment
    pub segment_length: usize,
    /// Fractional overlap between consecutive segments, `[0, 0.95]`
    pub overlap: f64,
    /// Mains frequency excluded from the total power
    pub mains_frequency: f64,
    /// Half-width of the mains exclusion in Hz
    pub notch_radius: f64,
    /// Remove each segment's mean before windowing
    pub detrend: bool,
}

impl Default for WelchConfig {
    fn default() -> Self {
        Self {
            segment_length: 256,
            overlap: 0.5,
            mains_frequency: 50.0,
            notch_radius: 2.0,
            detrend: true,
        }
    }
}

impl WelchConfig {
    pub fn with_segment_length(mut self, segment_length: usize) -> Self {
        self.segment_length = segment_length;
        self
    }

    pub fn with_mains(mut self, mains_frequency: f64) -> Self {
        self.mains_frequency = mains_frequency;
        self
    }

    fn hop(&self, segment_length: usize) -> usize {
        let overlap = if self.overlap.is_finite() {
            self.overlap.clamp(0.0, 0.95)
        } else {
            0.0
        };
        ((segment_length as f64 * (1.0 - overlap)).round() as usize).max(1)
    }
}

/// One-sided power spectral density
#[derive(Debug, Clone, PartialEq)]
pub struct Psd {
    /// Density per bin, `nfft/2 + 1` entries
    pub density: Vec<f64>,
    /// Bin spacing in Hz
    pub resolution: f64,
    /// Number of averaged segments
    pub segments: usize,
}

impl Psd {
    pub fn frequency(&self, bin: usize) -> f64 {
        bin as f64 * self.resolution
    }
}

fn hann(length: usize) -> Vec<f64> {
    (0..length)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f64 / length as f64).cos())
        .collect()
}

/// Averaged Welch PSD; `None` for signals too short to analyse
pub fn welch_psd(
    signal: &[f64],
    sample_rate: f64,
    config: &WelchConfig,
    cache: &FftCache,
) -> BspResult<Option<Psd>> {
    if config.segment_length > MAX_FFT_SIZE {
        return Err(BspError::InvalidFftSize {
            size: config.segment_length,
        });
    }
    if signal.len() < 2 || !(sample_rate > 0.0 && sample_rate.is_finite()) {
        return Ok(None);
    }

    let segment_length = config.segment_length.max(2).min(signal.len());
    let hop = config.hop(segment_length);
    let nfft = segment_length.next_power_of_two();
    let engine = cache.get(nfft)?;

    let window = hann(segment_length);
    let window_energy: f64 = window.iter().map(|w| w * w).sum();
    let half = nfft / 2;

    let mut accumulated = vec![0.0; half + 1];
    let mut segments = 0;
    let mut frame = vec![0.0; nfft];
    let mut start = 0;
    while start + segment_length <= signal.len() {
        let segment = &signal[start..start + segment_length];
        accumulate_segment(segment, &window, config.detrend, &engine, &mut frame, &mut accumulated)?;
        segments += 1;
        start += hop;
    }

    let scale = sample_rate * window_energy * segments as f64;
    let density = accumulated
        .iter()
        .enumerate()
        .map(|(k, &p)| {
            let one_sided = if k == 0 || k == half { 1.0 } else { 2.0 };
            finite_or_zero(one_sided * p / scale)
        })
        .collect();

    Ok(Some(Psd {
        density,
        resolution: sample_rate / nfft as f64,
        segments,
    }))
}

fn accumulate_segment(
    segment: &[f64],
    window: &[f64],
    detrend: bool,
    engine: &FftEngine,
    frame: &mut [f64],
    accumulated: &mut [f64],
) -> BspResult<()> {
    let mean = if detrend {
        segment.iter().copied().map(finite_or_zero).sum::<f64>() / segment.len() as f64
    } else {
        0.0
    };

    frame.iter_mut().for_each(|v| *v = 0.0);
    for ((slot, &x), &w) in frame.iter_mut().zip(segment).zip(window) {
        *slot = (finite_or_zero(x) - mean) * w;
    }

    let spectrum = engine.spectrum(frame)?;
    for (acc, c) in accumulated.iter_mut().zip(&spectrum) {
        *acc += c.norm_sqr();
    }
    Ok(())
}

/// Band powers from a Welch PSD using a caller-owned engine cache.
///
/// Relative powers are shares of the total PSD power excluding DC and the
/// mains exclusion zone, so they may sum to less than 1.
pub fn welch_band_powers(
    signal: &[f64],
    sample_rate: f64,
    config: &WelchConfig,
    cache: &FftCache,
) -> BspResult<BandPowerResult> {
    let psd = match welch_psd(signal, sample_rate, config, cache)? {
        Some(psd) => psd,
        None => return Ok(BandPowerResult::zeroed(true)),
    };

    let df = psd.resolution;
    let mut raw = [0.0; BAND_COUNT];
    let mut total = 0.0;
    for (k, &density) in psd.density.iter().enumerate().skip(1) {
        let frequency = psd.frequency(k);
        let power = density * df;
        if let Some(band) = Band::of(frequency) {
            raw[band.index()] += power;
        }
        if (frequency - config.mains_frequency).abs() > config.notch_radius {
            total += power;
        }
    }

    Ok(BandPowerResult {
        relative: relative_of(&raw, total),
        db: Some(raw.map(to_db)),
        raw,
    })
}

/// Per-band circular moving average.
///
/// `update` and `prefill` are both O(1). A prefill behaves as if the whole
/// window had been written with one value; the ring slots are only consulted
/// again once `window` real updates have replaced it.
#[derive(Debug, Clone)]
pub struct BandSmoother {
    window: usize,
    ring: Vec<BandValues>,
    head: usize,
    count: usize,
    sums: BandValues,
    prefill: Option<BandValues>,
    writes_since_prefill: usize,
}

impl BandSmoother {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            ring: vec![[0.0; BAND_COUNT]; window],
            head: 0,
            count: 0,
            sums: [0.0; BAND_COUNT],
            prefill: None,
            writes_since_prefill: 0,
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn is_warm(&self) -> bool {
        self.count == self.window
    }

    /// Push one observation and return the current average
    pub fn update(&mut self, values: &BandValues) -> BandValues {
        let incoming = values.map(finite_or_zero);

        let evicted = if self.count == self.window {
            match self.prefill {
                Some(fill) if self.writes_since_prefill < self.window => Some(fill),
                _ => Some(self.ring[self.head]),
            }
        } else {
            self.count += 1;
            None
        };

        for (i, sum) in self.sums.iter_mut().enumerate() {
            *sum += incoming[i] - evicted.map_or(0.0, |e| e[i]);
        }
        self.ring[self.head] = incoming;
        self.head = (self.head + 1) % self.window;

        if self.prefill.is_some() {
            self.writes_since_prefill += 1;
            if self.writes_since_prefill >= self.window {
                self.prefill = None;
            }
        }

        // Resync once per lap to bound accumulated rounding error
        if self.head == 0 && self.prefill.is_none() && self.is_warm() {
            self.sums = [0.0; BAND_COUNT];
            for slot in &self.ring {
                for (sum, v) in self.sums.iter_mut().zip(slot) {
                    *sum += v;
                }
            }
        }

        self.average()
    }

    /// Fill the whole window with `values` without touching each slot
    pub fn prefill(&mut self, values: &BandValues) {
        let fill = values.map(finite_or_zero);
        self.prefill = Some(fill);
        self.writes_since_prefill = 0;
        self.count = self.window;
        self.sums = fill.map(|v| v * self.window as f64);
    }

    pub fn average(&self) -> BandValues {
        if self.count == 0 {
            return [0.0; BAND_COUNT];
        }
        let n = self.count as f64;
        self.sums.map(|s| finite_or_zero(s / n))
    }

    pub fn reset(&mut self) {
        self.head = 0;
        self.count = 0;
        self.sums = [0.0; BAND_COUNT];
        self.prefill = None;
        self.writes_since_prefill = 0;
    }
}
