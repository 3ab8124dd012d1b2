//! BSP-Processing: DSP engines for biosignal streams
//!
//! Per-channel biquad filter banks, a radix-2 FFT with an engine cache,
//! and direct/Welch band-power estimation with smoothing.

pub mod filters;
pub mod fft;
pub mod bandpower;
pub mod analysis;

pub use filters::{
    CoefficientTable, FilterBank, FilterCascade, FilterConfig, FilterKind, KeyStatus, Sos,
};
pub use fft::{is_valid_fft_size, FftCache, FftEngine, MAX_FFT_SIZE};
pub use bandpower::{
    direct_band_powers, welch_band_powers, welch_psd, Band,
    BandPowerResult, BandSmoother, BandValues, Psd, WelchConfig, BAND_COUNT, DB_FLOOR,
};
pub use analysis::{
    AnalysisRegistry, BandPowerAnalyzer, BandPowerMethod, BandPowerRequest, BandPowerResponse,
};
