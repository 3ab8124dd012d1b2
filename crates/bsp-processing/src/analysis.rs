//! Band-power analysis boundary and the shared analysis resources

use crate::bandpower::{
    direct_band_powers, welch_band_powers, BandPowerResult, BandSmoother, BandValues, WelchConfig,
};
use crate::fft::{is_valid_fft_size, FftCache, FftEngine};
use crate::filters::CoefficientTable;
use bsp_core::{BspError, BspResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Coefficient table and FFT engine cache shared by one pipeline
#[derive(Debug)]
pub struct AnalysisRegistry {
    coefficients: Arc<CoefficientTable>,
    fft_cache: FftCache,
}

impl AnalysisRegistry {
    /// Registry with the built-in coefficient table
    pub fn new(fft_cache_capacity: usize) -> Self {
        Self::with_coefficients(Arc::new(CoefficientTable::builtin()), fft_cache_capacity)
    }

    pub fn with_coefficients(coefficients: Arc<CoefficientTable>, fft_cache_capacity: usize) -> Self {
        Self {
            coefficients,
            fft_cache: FftCache::new(fft_cache_capacity),
        }
    }

    pub fn coefficients(&self) -> &Arc<CoefficientTable> {
        &self.coefficients
    }

    pub fn fft_cache(&self) -> &FftCache {
        &self.fft_cache
    }

    pub fn fft(&self, size: usize) -> BspResult<Arc<FftEngine>> {
        self.fft_cache.get(size)
    }
}

impl Default for AnalysisRegistry {
    fn default() -> Self {
        Self::new(8)
    }
}

/// Which estimator serves a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum BandPowerMethod {
    #[default]
    Direct,
    Welch(WelchConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BandPowerRequest {
    pub signal: Vec<f64>,
    pub sample_rate: f64,
    pub fft_size: usize,
    pub smoother_window: usize,
    #[serde(default)]
    pub method: BandPowerMethod,
}

impl BandPowerRequest {
    pub fn direct(signal: Vec<f64>, sample_rate: f64, fft_size: usize, smoother_window: usize) -> Self {
        Self {
            signal,
            sample_rate,
            fft_size,
            smoother_window,
            method: BandPowerMethod::Direct,
        }
    }

    pub fn welch(signal: Vec<f64>, sample_rate: f64, config: WelchConfig, smoother_window: usize) -> Self {
        Self {
            signal,
            sample_rate,
            fft_size: config.segment_length.max(2).next_power_of_two(),
            smoother_window,
            method: BandPowerMethod::Welch(config),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BandPowerResponse {
    pub raw: BandValues,
    pub relative: BandValues,
    pub smooth: BandValues,
    #[serde(rename = "dB", skip_serializing_if = "Option::is_none", default)]
    pub db: Option<BandValues>,
}

/// Stateful analyser; keeps the smoother across consecutive requests
#[derive(Debug)]
pub struct BandPowerAnalyzer {
    registry: Arc<AnalysisRegistry>,
    smoother: Option<BandSmoother>,
    analyses: u64,
}

impl BandPowerAnalyzer {
    pub fn new(registry: Arc<AnalysisRegistry>) -> Self {
        Self {
            registry,
            smoother: None,
            analyses: 0,
        }
    }

    pub fn registry(&self) -> &Arc<AnalysisRegistry> {
        &self.registry
    }

    pub fn analyses(&self) -> u64 {
        self.analyses
    }

    /// Run one request.
    ///
    /// The direct method reads the last `fft_size` samples, zero-padding
    /// shorter signals. A cold smoother is prefilled with the first result.
    pub fn analyze(&mut self, request: &BandPowerRequest) -> BspResult<BandPowerResponse> {
        let result = match &request.method {
            BandPowerMethod::Direct => self.direct(request)?,
            BandPowerMethod::Welch(config) => welch_band_powers(
                &request.signal,
                request.sample_rate,
                config,
                self.registry.fft_cache(),
            )?,
        };

        let smooth = self.smooth(request.smoother_window, &result.relative);
        self.analyses += 1;
        Ok(BandPowerResponse {
            raw: result.raw,
            relative: result.relative,
            smooth,
            db: result.db,
        })
    }

    fn direct(&self, request: &BandPowerRequest) -> BspResult<BandPowerResult> {
        let fft_size = request.fft_size;
        if !is_valid_fft_size(fft_size) {
            return Err(BspError::InvalidFftSize { size: fft_size });
        }
        let engine = self.registry.fft(fft_size)?;

        let tail = &request.signal[request.signal.len().saturating_sub(fft_size)..];
        let mut frame = vec![0.0; fft_size];
        frame[..tail.len()].copy_from_slice(tail);

        let magnitudes = engine.compute_magnitudes(&frame)?;
        Ok(direct_band_powers(&magnitudes, request.sample_rate, fft_size))
    }

    fn smooth(&mut self, window: usize, relative: &BandValues) -> BandValues {
        let window = window.max(1);
        match &mut self.smoother {
            Some(smoother) if smoother.window() == window => smoother.update(relative),
            slot => {
                debug!(window, "starting band smoother");
                let mut smoother = BandSmoother::new(window);
                smoother.prefill(relative);
                let smooth = smoother.average();
                *slot = Some(smoother);
                smooth
            }
        }
    }

    pub fn reset(&mut self) {
        self.smoother = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bandpower::{Band, BAND_COUNT};
    use std::f64::consts::PI;

    fn tone(freq: f64, fs: f64, n: usize) -> Vec<f64> {
        (0..n).map(|i| (2.0 * PI * freq * i as f64 / fs).sin()).collect()
    }

    #[test]
    fn test_direct_request() {
        let registry = Arc::new(AnalysisRegistry::default());
        let mut analyzer = BandPowerAnalyzer::new(Arc::clone(&registry));
        let request = BandPowerRequest::direct(tone(6.0, 256.0, 512), 256.0, 256, 4);

        let response = analyzer.analyze(&request).unwrap();
        let theta = Band::Theta.index();
        assert!(response.relative[theta] > 0.9);
        assert_eq!(response.smooth, response.relative);
        assert!(response.db.is_none());
        assert_eq!(registry.fft_cache().len(), 1);
    }

    #[test]
    fn test_short_signal_is_zero_padded() {
        let mut analyzer = BandPowerAnalyzer::new(Arc::new(AnalysisRegistry::default()));
        let request = BandPowerRequest::direct(tone(20.0, 256.0, 100), 256.0, 256, 1);
        let response = analyzer.analyze(&request).unwrap();
        assert_eq!(response.relative.iter().cloned().fold(0.0, f64::max), response.relative[Band::Beta.index()]);

        let empty = BandPowerRequest::direct(Vec::new(), 256.0, 256, 1);
        let response = analyzer.analyze(&empty).unwrap();
        assert_eq!(response.raw, [0.0; BAND_COUNT]);
    }

    #[test]
    fn test_invalid_fft_size() {
        let mut analyzer = BandPowerAnalyzer::new(Arc::new(AnalysisRegistry::default()));
        let request = BandPowerRequest::direct(vec![0.0; 100], 256.0, 100, 1);
        assert_eq!(analyzer.analyze(&request), Err(BspError::InvalidFftSize { size: 100 }));
    }

    #[test]
    fn test_oversized_requests_are_rejected() {
        let mut analyzer = BandPowerAnalyzer::new(Arc::new(AnalysisRegistry::default()));
        let huge = 1usize << 62;
        let direct = BandPowerRequest::direct(vec![0.0; 4], 256.0, huge, 1);
        assert_eq!(analyzer.analyze(&direct), Err(BspError::InvalidFftSize { size: huge }));

        let config = WelchConfig::default().with_segment_length(huge);
        let welch = BandPowerRequest::welch(vec![0.0; 4], 256.0, config, 1);
        assert_eq!(analyzer.analyze(&welch), Err(BspError::InvalidFftSize { size: huge }));

        // The analyzer keeps serving afterwards
        let ok = BandPowerRequest::direct(tone(10.0, 256.0, 256), 256.0, 256, 1);
        assert!(analyzer.analyze(&ok).is_ok());
        assert_eq!(analyzer.analyses(), 1);
    }

    #[test]
    fn test_smoother_persists_between_requests() {
        let mut analyzer = BandPowerAnalyzer::new(Arc::new(AnalysisRegistry::default()));
        let alpha = BandPowerRequest::direct(tone(10.0, 256.0, 256), 256.0, 256, 4);
        let gamma = BandPowerRequest::direct(tone(40.0, 256.0, 256), 256.0, 256, 4);

        analyzer.analyze(&alpha).unwrap();
        let response = analyzer.analyze(&gamma).unwrap();
        let a = Band::Alpha.index();
        let g = Band::Gamma.index();
        // Three prefilled alpha frames remain in the window
        assert!(response.smooth[a] > 0.7);
        assert!(response.smooth[g] > 0.2 && response.smooth[g] < 0.3);
        assert_eq!(analyzer.analyses(), 2);
    }

    #[test]
    fn test_welch_request_carries_db() {
        let mut analyzer = BandPowerAnalyzer::new(Arc::new(AnalysisRegistry::default()));
        let request = BandPowerRequest::welch(tone(10.0, 256.0, 1024), 256.0, WelchConfig::default(), 2);
        let response = analyzer.analyze(&request).unwrap();
        assert!(response.db.is_some());
        assert!(response.relative[Band::Alpha.index()] > 0.9);
    }

    #[test]
    fn test_request_wire_shape() {
        let json = r#"{"signal":[0,1],"sampleRate":256,"fftSize":2,"smootherWindow":1}"#;
        let request: BandPowerRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.method, BandPowerMethod::Direct);

        let response = BandPowerResponse {
            raw: [0.0; BAND_COUNT],
            relative: [0.0; BAND_COUNT],
            smooth: [0.0; BAND_COUNT],
            db: Some([-120.0; BAND_COUNT]),
        };
        let value = serde_json::to_value(&response).unwrap();
        assert!(value.get("dB").is_some());
    }
}
