//! Synthetic ADC source producing raw EEG-like counts

use bsp_core::{config_error, BspResult, ChannelSample};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::f64::consts::PI;

/// Configuration for the simulated device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimulatorConfig {
    pub channel_count: usize,
    pub sampling_rate: f64,
    /// ADC resolution; values span `0..2^bit_depth`
    pub bit_depth: u32,
    /// Rhythm frequency per channel is `rhythm_frequency + channel`
    pub rhythm_frequency: f64,
    /// Rhythm amplitude as a fraction of half scale
    pub rhythm_amplitude: f64,
    /// Gaussian noise standard deviation, fraction of half scale
    pub noise_std: f64,
    /// Power line interference (50/60Hz)
    pub powerline_freq: Option<f64>,
    pub powerline_amplitude: f64,
    /// Chance that a packet is lost, leaving a counter gap
    pub drop_probability: f64,
    /// Random seed for reproducibility
    pub seed: Option<u64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            channel_count: 4,
            sampling_rate: 250.0,
            bit_depth: 14,
            rhythm_frequency: 10.0,
            rhythm_amplitude: 0.2,
            noise_std: 0.02,
            powerline_freq: Some(50.0),
            powerline_amplitude: 0.1,
            drop_probability: 0.0,
            seed: None,
        }
    }
}

/// Deterministic (when seeded) multi-channel ADC simulator
pub struct AdcSimulator {
    config: SimulatorConfig,
    rng: StdRng,
    noise: Normal<f64>,
    sample_index: u64,
    counter: u8,
}

impl AdcSimulator {
    pub fn new(config: SimulatorConfig) -> BspResult<Self> {
        if config.channel_count == 0 {
            return Err(config_error!("simulator needs at least one channel"));
        }
        if !(config.sampling_rate.is_finite() && config.sampling_rate > 0.0) {
            return Err(bsp_core::BspError::InvalidSamplingRate {
                rate: config.sampling_rate,
            });
        }
        if config.bit_depth == 0 || config.bit_depth > 32 {
            return Err(config_error!("bit depth {} outside 1..=32", config.bit_depth));
        }

        let noise = Normal::new(0.0, config.noise_std.max(0.0))
            .map_err(|e| config_error!("Failed to create normal distribution: {}", e))?;
        let seed = config.seed.unwrap_or_else(|| {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0)
        });

        Ok(Self {
            config,
            rng: StdRng::seed_from_u64(seed),
            noise,
            sample_index: 0,
            counter: 0,
        })
    }

    fn half_scale(&self) -> f64 {
        2f64.powi(self.config.bit_depth as i32) / 2.0
    }

    /// Next sample as raw counts, with counter and timestamp
    pub fn next_sample(&mut self) -> ChannelSample {
        if self.config.drop_probability > 0.0 && self.rng.gen::<f64>() < self.config.drop_probability {
            // Lost packet: the counter advances without a sample
            self.counter = self.counter.wrapping_add(1);
            self.sample_index += 1;
        }

        let t = self.sample_index as f64 / self.config.sampling_rate;
        let half = self.half_scale();
        let max = 2.0 * half - 1.0;

        let channels = (0..self.config.channel_count)
            .map(|ch| {
                let rhythm = (self.config.rhythm_frequency + ch as f64).max(0.0);
                let mut value = self.config.rhythm_amplitude * (2.0 * PI * rhythm * t).sin();
                if let Some(mains) = self.config.powerline_freq {
                    value += self.config.powerline_amplitude * (2.0 * PI * mains * t).sin();
                }
                value += self.noise.sample(&mut self.rng);
                (half + value * half).round().clamp(0.0, max)
            })
            .collect();

        let sample = ChannelSample::new(channels)
            .with_counter(self.counter)
            .with_timestamp(t * 1000.0);
        self.counter = self.counter.wrapping_add(1);
        self.sample_index += 1;
        sample
    }

    /// Next sample encoded as a loosely-typed device record
    pub fn next_record(&mut self) -> Value {
        let sample = self.next_sample();
        let mut record = Map::new();
        for (ch, value) in sample.channels.iter().enumerate() {
            record.insert(format!("ch{}", ch), json!(value));
        }
        if let Some(timestamp) = sample.timestamp {
            record.insert("timestamp".to_string(), json!(timestamp));
        }
        if let Some(counter) = sample.counter {
            record.insert("counter".to_string(), json!(counter));
        }
        Value::Object(record)
    }

    /// Generate `count` consecutive samples
    pub fn generate(&mut self, count: usize) -> Vec<ChannelSample> {
        (0..count).map(|_| self.next_sample()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bsp_stream::diagnostics::CounterTracker;
    use std::time::Duration;

    fn seeded(config: SimulatorConfig) -> AdcSimulator {
        AdcSimulator::new(SimulatorConfig {
            seed: Some(42),
            ..config
        })
        .unwrap()
    }

    #[test]
    fn test_values_within_adc_range() {
        let mut sim = seeded(SimulatorConfig::default());
        for sample in sim.generate(1000) {
            assert_eq!(sample.width(), 4);
            assert!(sample.channels.iter().all(|v| (0.0..16384.0).contains(v)));
        }
    }

    #[test]
    fn test_counters_wrap_without_gaps() {
        let mut sim = seeded(SimulatorConfig::default());
        let mut tracker = CounterTracker::new(Duration::ZERO);
        let samples = sim.generate(600);
        assert_eq!(tracker.observe(samples.iter().filter_map(|s| s.counter)), 0);
        assert_eq!(samples[256].counter, Some(0));
    }

    #[test]
    fn test_dropped_packets_leave_counter_gaps() {
        let mut sim = seeded(SimulatorConfig {
            drop_probability: 0.1,
            ..SimulatorConfig::default()
        });
        let mut tracker = CounterTracker::new(Duration::ZERO);
        let samples = sim.generate(1000);
        assert!(tracker.observe(samples.iter().filter_map(|s| s.counter)) > 0);
    }

    #[test]
    fn test_seeded_runs_are_reproducible() {
        let a = seeded(SimulatorConfig::default()).generate(32);
        let b = seeded(SimulatorConfig::default()).generate(32);
        assert_eq!(a, b);
    }

    #[test]
    fn test_record_shape() {
        let mut sim = seeded(SimulatorConfig {
            channel_count: 2,
            ..SimulatorConfig::default()
        });
        let record = sim.next_record();
        let (sample, issues) = ChannelSample::from_record(&record, 2).unwrap();
        assert!(issues.is_clean());
        assert_eq!(sample.counter, Some(0));
        assert_eq!(sample.timestamp, Some(0.0));
    }

    #[test]
    fn test_invalid_config() {
        assert!(AdcSimulator::new(SimulatorConfig {
            channel_count: 0,
            ..SimulatorConfig::default()
        })
        .is_err());
        assert!(AdcSimulator::new(SimulatorConfig {
            sampling_rate: 0.0,
            ..SimulatorConfig::default()
        })
        .is_err());
    }
}
