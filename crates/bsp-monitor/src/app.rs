//! Headless monitor wiring a simulated device into the streaming pipeline

use crate::simulator::{AdcSimulator, SimulatorConfig};
use anyhow::{bail, Context, Result};
use bsp_core::{ControlEvent, WidgetFrame};
use bsp_processing::{AnalysisRegistry, Band, BandPowerRequest, WelchConfig};
use bsp_stream::{
    spawn_flush_loop, AnalysisWorker, BandPowerStage, BandPowerStageConfig, DataContext, IntervalTicks,
    PipelineConfig, PipelineStats, ProcessingProfile, Subscription,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Monitor settings, loadable from JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitorConfig {
    pub simulator: SimulatorConfig,
    /// Pipeline settings; derived from the simulator when absent
    pub pipeline: Option<PipelineConfig>,
    pub profile: ProcessingProfile,
    pub mains_frequency: f64,
    /// Flush ticks per second
    pub tick_hz: f64,
    /// Device packet period
    pub chunk_ms: u64,
    /// Feed loosely-typed records instead of typed samples
    pub use_records: bool,
    /// Period of the Welch summary over the buffered history
    pub welch_interval_ms: u64,
    pub welch: WelchConfig,
    /// Stop after this many seconds; run until interrupted when absent
    pub duration_secs: Option<f64>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            simulator: SimulatorConfig::default(),
            pipeline: None,
            profile: ProcessingProfile::RealTime,
            mains_frequency: 50.0,
            tick_hz: 60.0,
            chunk_ms: 20,
            use_records: false,
            welch_interval_ms: 1000,
            welch: WelchConfig::default(),
            duration_secs: None,
        }
    }
}

impl MonitorConfig {
    pub fn pipeline_config(&self) -> PipelineConfig {
        match &self.pipeline {
            Some(pipeline) => pipeline.clone(),
            None => {
                let mut pipeline = PipelineConfig::eeg(self.simulator.channel_count, self.simulator.sampling_rate)
                    .with_profile(self.profile, self.mains_frequency);
                pipeline.bit_depth = Some(self.simulator.bit_depth);
                pipeline
            }
        }
    }

    fn samples_per_chunk(&self) -> usize {
        (self.simulator.sampling_rate * self.chunk_ms as f64 / 1000.0).round().max(1.0) as usize
    }
}

fn dominant(relative: &[f64]) -> Option<Band> {
    Band::ALL
        .iter()
        .copied()
        .zip(relative.iter().copied())
        .filter(|(_, power)| power.is_finite())
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(band, _)| band)
}

/// Simulator, pipeline, band-power stages and the analysis worker
pub struct MonitorApp {
    config: MonitorConfig,
    context: Arc<DataContext>,
    stages: Vec<BandPowerStage>,
    subscriptions: Vec<Subscription>,
    worker: AnalysisWorker,
}

impl MonitorApp {
    /// Build the pipeline; must be called inside a tokio runtime
    pub fn new(config: MonitorConfig) -> Result<Self> {
        let pipeline = config.pipeline_config();
        if pipeline.channel_count != config.simulator.channel_count {
            bail!(
                "pipeline expects {} channels but the simulator produces {}",
                pipeline.channel_count,
                config.simulator.channel_count
            );
        }

        let registry = Arc::new(AnalysisRegistry::new(pipeline.fft_cache_capacity));
        let context = Arc::new(
            DataContext::with_registry(pipeline, Arc::clone(&registry)).context("Failed to create pipeline")?,
        );

        let mut stages = Vec::new();
        let mut subscriptions = Vec::new();
        for channel in context.registered_channels().iter() {
            let stage_config = BandPowerStageConfig::new(channel, config.simulator.sampling_rate);
            let stage = BandPowerStage::attach(&context, stage_config)
                .with_context(|| format!("Failed to attach band-power stage to channel {}", channel))?;

            subscriptions.push(context.subscribe_output(stage.output(), move |history| {
                if let Some(WidgetFrame::Vector(relative)) = history.last() {
                    if let Some(band) = dominant(relative) {
                        debug!(channel, band = band.name(), frames = history.len(), "band powers");
                    }
                }
            }));
            stages.push(stage);
        }

        subscriptions.push(context.subscribe_events(|event| match event {
            ControlEvent::SamplesMissing { count } => warn!(count, "device counter gap"),
            ControlEvent::QueueOverflow { dropped } => warn!(dropped, "ingestion queue overflow"),
            other => info!(?other, "pipeline event"),
        }));

        let worker = AnalysisWorker::spawn(registry, 16);
        info!(
            pipeline = %context.name(),
            channels = context.channel_count(),
            stages = stages.len(),
            "monitor ready"
        );

        Ok(Self {
            config,
            context,
            stages,
            subscriptions,
            worker,
        })
    }

    pub fn context(&self) -> &Arc<DataContext> {
        &self.context
    }

    /// Stream until `cancel` fires or the configured duration elapses
    pub async fn run(self, cancel: CancellationToken) -> Result<PipelineStats> {
        let mut simulator = AdcSimulator::new(self.config.simulator.clone()).context("Failed to create simulator")?;

        let flush_cancel = cancel.child_token();
        let flush_loop = spawn_flush_loop(
            Arc::clone(&self.context),
            IntervalTicks::from_hz(self.config.tick_hz),
            flush_cancel.clone(),
        );

        let mut packets = interval(Duration::from_millis(self.config.chunk_ms.max(1)));
        packets.set_missed_tick_behavior(MissedTickBehavior::Burst);
        let mut summaries = interval(Duration::from_millis(self.config.welch_interval_ms.max(1)));
        summaries.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let deadline = self.config.duration_secs.map(Duration::from_secs_f64);
        let stop = async {
            match deadline {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(stop);

        let chunk = self.config.samples_per_chunk();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = &mut stop => {
                    info!("run duration elapsed");
                    break;
                }
                _ = packets.tick() => {
                    if self.config.use_records {
                        for _ in 0..chunk {
                            self.context.ingest_record(&simulator.next_record());
                        }
                    } else {
                        for sample in simulator.generate(chunk) {
                            self.context.ingest(sample);
                        }
                    }
                }
                _ = summaries.tick() => self.summarize().await,
            }
        }

        flush_cancel.cancel();
        let flushes = flush_loop.await.context("Flush loop panicked")?;
        let stats = self.context.stats();
        info!(flushes, samples = stats.samples_flushed, dropped = stats.dropped, "monitor stopped");

        drop(self.subscriptions);
        drop(self.stages);
        let served = self.worker.shutdown().await.context("Analysis worker failed")?;
        debug!(served, "analysis worker drained");
        Ok(stats)
    }

    /// Welch band powers over each channel's buffered history
    async fn summarize(&self) {
        let Some(rate) = self.context.sampling_rate(0) else {
            return;
        };
        for (channel, history) in self.context.buffers_snapshot() {
            let request = BandPowerRequest::welch(history, rate, self.config.welch.clone(), 4);
            match self.worker.analyze(&format!("welch/ch{}", channel), request).await {
                Ok(response) => {
                    if let Some(band) = dominant(&response.smooth) {
                        info!(channel, band = band.name(), share = response.smooth[band.index()], "welch summary");
                    }
                }
                Err(err) => warn!(channel, error = %err, "welch summary failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config() -> MonitorConfig {
        MonitorConfig {
            simulator: SimulatorConfig {
                channel_count: 2,
                seed: Some(7),
                ..SimulatorConfig::default()
            },
            chunk_ms: 10,
            welch_interval_ms: 100,
            duration_secs: Some(0.3),
            ..MonitorConfig::default()
        }
    }

    #[test]
    fn test_dominant_band() {
        assert_eq!(dominant(&[0.1, 0.1, 0.6, 0.1, 0.1]), Some(Band::Alpha));
        assert_eq!(dominant(&[f64::NAN, 0.2, 0.1, 0.0, 0.0]), Some(Band::Theta));
    }

    #[test]
    fn test_pipeline_derived_from_simulator() {
        let config = quick_config();
        let pipeline = config.pipeline_config();
        assert_eq!(pipeline.channel_count, 2);
        assert_eq!(pipeline.sampling_rate, Some(250.0));
        assert_eq!(pipeline.bit_depth, Some(14));
        assert_eq!(config.samples_per_chunk(), 3);
    }

    #[tokio::test]
    async fn test_partial_pipeline_section_matches_simulator() {
        let config: MonitorConfig = serde_json::from_str(
            r#"{"simulator":{"channelCount":4,"seed":3},"pipeline":{"channelCount":4,"samplingRate":250.0}}"#,
        )
        .unwrap();
        assert_eq!(config.pipeline_config().registered_channels.len(), 4);
        let app = MonitorApp::new(config).unwrap();
        assert_eq!(app.context().registered_channels().len(), 4);
    }

    #[tokio::test]
    async fn test_mismatched_channel_counts_rejected() {
        let config = MonitorConfig {
            pipeline: Some(PipelineConfig::eeg(4, 250.0)),
            ..quick_config()
        };
        assert!(MonitorApp::new(config).is_err());
    }

    #[tokio::test]
    async fn test_run_streams_until_duration() {
        let app = MonitorApp::new(quick_config()).unwrap();
        let context = Arc::clone(app.context());
        let stats = app.run(CancellationToken::new()).await.unwrap();
        assert!(stats.ingested > 0);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.samples_flushed, stats.ingested);
        assert!(context.buffer(0).is_some_and(|b| !b.is_empty()));
    }

    #[tokio::test]
    async fn test_run_with_records_stops_on_cancel() {
        let config = MonitorConfig {
            use_records: true,
            duration_secs: None,
            ..quick_config()
        };
        let app = MonitorApp::new(config).unwrap();
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stopper.cancel();
        });
        let stats = app.run(cancel).await.unwrap();
        assert!(stats.ingested > 0);
        assert_eq!(stats.malformed_records, 0);
    }
}
