//! Fixed-size radix-2 FFT with a bounded per-size engine cache

use bsp_core::{BspError, BspResult};
use num_complex::Complex;
use parking_lot::Mutex;
use std::f64::consts::PI;
use std::sync::Arc;
use tracing::debug;

/// Largest transform size an engine accepts (2^20 points)
pub const MAX_FFT_SIZE: usize = 1 << 20;

/// `true` for powers of two in `2..=MAX_FFT_SIZE`
pub fn is_valid_fft_size(size: usize) -> bool {
    (2..=MAX_FFT_SIZE).contains(&size) && size.is_power_of_two()
}

/// In-place iterative radix-2 Cooley–Tukey transform of one fixed size.
///
/// Twiddle tables and the bit-reversal permutation are computed once at
/// construction, so engines are meant to be reused through an [`FftCache`].
#[derive(Debug)]
pub struct FftEngine {
    size: usize,
    cos_table: Vec<f64>,
    sin_table: Vec<f64>,
    bit_reverse: Vec<usize>,
}

impl FftEngine {
    /// Create an engine; `size` must be a power of two in `2..=MAX_FFT_SIZE`
    pub fn new(size: usize) -> BspResult<Self> {
        if !is_valid_fft_size(size) {
            return Err(BspError::InvalidFftSize { size });
        }

        let half = size / 2;
        let (cos_table, sin_table) = (0..half)
            .map(|k| {
                let angle = 2.0 * PI * k as f64 / size as f64;
                (angle.cos(), angle.sin())
            })
            .unzip();

        let bits = size.trailing_zeros();
        let bit_reverse = (0..size)
            .map(|i| i.reverse_bits() >> (usize::BITS - bits))
            .collect();

        Ok(Self {
            size,
            cos_table,
            sin_table,
            bit_reverse,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn check_len(&self, len: usize) -> BspResult<()> {
        if len != self.size {
            return Err(BspError::FftSizeMismatch {
                expected: self.size,
                actual: len,
            });
        }
        Ok(())
    }

    /// Forward transform in place
    pub fn transform(&self, buffer: &mut [Complex<f64>]) -> BspResult<()> {
        self.check_len(buffer.len())?;
        let n = self.size;

        for i in 0..n {
            let j = self.bit_reverse[i];
            if i < j {
                buffer.swap(i, j);
            }
        }

        let mut len = 2;
        while len <= n {
            let half = len / 2;
            let stride = n / len;
            for start in (0..n).step_by(len) {
                for k in 0..half {
                    let t = k * stride;
                    let twiddle = Complex::new(self.cos_table[t], -self.sin_table[t]);
                    let a = buffer[start + k];
                    let b = buffer[start + k + half] * twiddle;
                    buffer[start + k] = a + b;
                    buffer[start + k + half] = a - b;
                }
            }
            len <<= 1;
        }
        Ok(())
    }

    /// Full complex spectrum of a real input
    pub fn spectrum(&self, input: &[f64]) -> BspResult<Vec<Complex<f64>>> {
        self.check_len(input.len())?;
        let mut buffer: Vec<Complex<f64>> = input.iter().map(|&x| Complex::new(x, 0.0)).collect();
        self.transform(&mut buffer)?;
        Ok(buffer)
    }

    /// `N/2` magnitudes, each divided by `N/2`
    pub fn compute_magnitudes(&self, input: &[f64]) -> BspResult<Vec<f64>> {
        let spectrum = self.spectrum(input)?;
        let half = self.size / 2;
        let scale = half as f64;
        Ok(spectrum[..half].iter().map(|c| c.norm() / scale).collect())
    }
}

/// Bounded cache of FFT engines keyed by transform size.
///
/// Least recently used engines are evicted once `capacity` is exceeded.
#[derive(Debug)]
pub struct FftCache {
    capacity: usize,
    engines: Mutex<Vec<Arc<FftEngine>>>,
}

impl FftCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            engines: Mutex::new(Vec::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.engines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.lock().is_empty()
    }

    /// Cached engine for `size`, building it on first use
    pub fn get(&self, size: usize) -> BspResult<Arc<FftEngine>> {
        let mut engines = self.engines.lock();
        if let Some(pos) = engines.iter().position(|e| e.size() == size) {
            let engine = engines.remove(pos);
            engines.push(Arc::clone(&engine));
            return Ok(engine);
        }

        let engine = Arc::new(FftEngine::new(size)?);
        engines.push(Arc::clone(&engine));
        if engines.len() > self.capacity {
            let evicted = engines.remove(0);
            debug!(size = evicted.size(), "evicted FFT engine");
        }
        Ok(engine)
    }

    pub fn clear(&self) {
        self.engines.lock().clear();
    }
}

impl Default for FftCache {
    fn default() -> Self {
        Self::new(8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand::rngs::StdRng;

    fn argmax(values: &[f64]) -> usize {
        values
            .iter()
            .enumerate()
            .fold((0, f64::MIN), |(bi, bv), (i, &v)| if v > bv { (i, v) } else { (bi, bv) })
            .0
    }

    #[test]
    fn test_rejects_invalid_sizes() {
        assert!(matches!(FftEngine::new(0), Err(BspError::InvalidFftSize { size: 0 })));
        assert!(FftEngine::new(1).is_err());
        assert!(FftEngine::new(100).is_err());
        assert!(FftEngine::new(2).is_ok());
    }

    #[test]
    fn test_rejects_oversized_transforms() {
        assert!(FftEngine::new(MAX_FFT_SIZE).is_ok());
        assert_eq!(
            FftEngine::new(MAX_FFT_SIZE * 2).err(),
            Some(BspError::InvalidFftSize { size: MAX_FFT_SIZE * 2 })
        );
        assert!(FftEngine::new(1 << 62).is_err());

        let cache = FftCache::new(2);
        assert!(cache.get(1 << 62).is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_length_mismatch_is_error() {
        let engine = FftEngine::new(64).unwrap();
        let result = engine.compute_magnitudes(&[0.0; 63]);
        assert_eq!(
            result,
            Err(BspError::FftSizeMismatch {
                expected: 64,
                actual: 63
            })
        );
    }

    #[test]
    fn test_single_bin_sinusoid() {
        let n = 256;
        let engine = FftEngine::new(n).unwrap();
        for k in [1usize, 10, 37, 100] {
            let signal: Vec<f64> = (0..n)
                .map(|i| (2.0 * PI * k as f64 * i as f64 / n as f64).sin())
                .collect();
            let mags = engine.compute_magnitudes(&signal).unwrap();
            assert_eq!(mags.len(), n / 2);
            let peak = argmax(&mags);
            assert!(peak.abs_diff(k) <= 1, "k={} peak={}", k, peak);
            // Unit amplitude sinusoid maps to magnitude ~1 after the N/2 scale
            assert!((mags[k] - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_matches_rustfft_reference() {
        use rustfft::FftPlanner;

        let n = 512;
        let mut rng = StdRng::seed_from_u64(7);
        let signal: Vec<f64> = (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect();

        let engine = FftEngine::new(n).unwrap();
        let ours = engine.spectrum(&signal).unwrap();

        let mut planner = FftPlanner::<f64>::new();
        let fft = planner.plan_fft_forward(n);
        let mut reference: Vec<Complex<f64>> = signal.iter().map(|&x| Complex::new(x, 0.0)).collect();
        fft.process(&mut reference);

        for (a, b) in ours.iter().zip(&reference) {
            assert!((a - b).norm() < 1e-9);
        }
    }

    #[test]
    fn test_dc_input() {
        let engine = FftEngine::new(8).unwrap();
        let mags = engine.compute_magnitudes(&[1.0; 8]).unwrap();
        // DC bin carries N/(N/2) = 2
        assert!((mags[0] - 2.0).abs() < 1e-12);
        assert!(mags[1..].iter().all(|m| m.abs() < 1e-12));
    }

    #[test]
    fn test_cache_reuses_and_evicts() {
        let cache = FftCache::new(2);
        let a = cache.get(64).unwrap();
        let again = cache.get(64).unwrap();
        assert!(Arc::ptr_eq(&a, &again));

        cache.get(128).unwrap();
        // 64 is now the least recently used
        cache.get(256).unwrap();
        assert_eq!(cache.len(), 2);
        let rebuilt = cache.get(64).unwrap();
        assert!(!Arc::ptr_eq(&a, &rebuilt));
    }

    #[test]
    fn test_cache_propagates_invalid_size() {
        let cache = FftCache::default();
        assert!(cache.get(12).is_err());
        assert!(cache.is_empty());
    }
}
