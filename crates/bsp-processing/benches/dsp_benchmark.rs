//! Hot-path benchmarks: FFT magnitudes, filter cascades, band powers

use bsp_processing::{
    direct_band_powers, welch_band_powers, CoefficientTable, FftCache, FftEngine, FilterBank,
    FilterConfig, WelchConfig,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::sync::Arc;

fn noise(len: usize) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(1);
    let normal = Normal::new(0.0, 1.0).unwrap();
    (0..len).map(|_| normal.sample(&mut rng)).collect()
}

fn bench_fft(c: &mut Criterion) {
    let mut group = c.benchmark_group("fft_magnitudes");

    for &size in &[64usize, 256, 1024, 4096] {
        let engine = FftEngine::new(size).unwrap();
        let input = noise(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &input, |b, input| {
            b.iter(|| black_box(engine.compute_magnitudes(black_box(input)).unwrap()));
        });
    }

    group.finish();
}

fn bench_filter_bank(c: &mut Criterion) {
    let mut group = c.benchmark_group("filter_bank");
    let input = noise(1000);

    for &channels in &[1usize, 8, 16] {
        let mut bank = FilterBank::new(Arc::new(CoefficientTable::builtin()));
        for ch in 0..channels {
            bank.configure_channel(ch, FilterConfig::eeg_default(50.0).with_sampling_rate(250.0))
                .unwrap();
        }
        group.bench_with_input(
            BenchmarkId::new("eeg_chain", format!("{}ch", channels)),
            &input,
            |b, input| {
                b.iter(|| {
                    for &v in input {
                        for ch in 0..channels {
                            black_box(bank.process(ch, v));
                        }
                    }
                });
            },
        );
    }

    group.finish();
}

fn bench_band_powers(c: &mut Criterion) {
    let mut group = c.benchmark_group("band_powers");
    let signal = noise(4096);
    let engine = FftEngine::new(256).unwrap();
    let cache = FftCache::new(2);
    let config = WelchConfig::default();

    group.bench_function("direct_256", |b| {
        b.iter(|| {
            let mags = engine.compute_magnitudes(&signal[..256]).unwrap();
            black_box(direct_band_powers(&mags, 256.0, 256))
        });
    });

    group.bench_function("welch_4096", |b| {
        b.iter(|| black_box(welch_band_powers(&signal, 256.0, &config, &cache).unwrap()));
    });

    group.finish();
}

criterion_group!(benches, bench_fft, bench_filter_bank, bench_band_powers);
criterion_main!(benches);
