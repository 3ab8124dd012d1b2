//! Analysis stages chained onto a pipeline's fan-out

use crate::buffer_store::CircularBuffer;
use crate::context::DataContext;
use crate::fanout::Subscription;
use bsp_core::{BspError, BspResult, ControlEvent, WidgetFrame};
use bsp_processing::{is_valid_fft_size, BandPowerAnalyzer, BandPowerMethod, BandPowerRequest, MAX_FFT_SIZE};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Settings of a [`BandPowerStage`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BandPowerStageConfig {
    /// Channel whose processed values are analysed
    pub channel: usize,
    pub sample_rate: f64,
    /// Analysis window in samples; the FFT size for the direct method
    pub fft_size: usize,
    /// New samples between analyses
    pub hop: usize,
    pub smoother_window: usize,
    pub method: BandPowerMethod,
    /// Output stream receiving the smoothed relative powers
    pub output: String,
}

impl BandPowerStageConfig {
    pub fn new(channel: usize, sample_rate: f64) -> Self {
        Self {
            channel,
            sample_rate,
            fft_size: 256,
            hop: 64,
            smoother_window: 8,
            method: BandPowerMethod::Direct,
            output: format!("bandpower/ch{}", channel),
        }
    }

    pub fn validate(&self, channel_count: usize) -> BspResult<()> {
        if self.channel >= channel_count {
            return Err(BspError::ChannelOutOfRange {
                index: self.channel,
                channel_count,
            });
        }
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return Err(BspError::InvalidSamplingRate { rate: self.sample_rate });
        }
        let size_ok = match self.method {
            BandPowerMethod::Direct => is_valid_fft_size(self.fft_size),
            BandPowerMethod::Welch(_) => (2..=MAX_FFT_SIZE).contains(&self.fft_size),
        };
        if !size_ok {
            return Err(BspError::InvalidFftSize { size: self.fft_size });
        }
        if self.hop == 0 {
            return Err(bsp_core::config_error!("band-power hop must be positive"));
        }
        Ok(())
    }
}

struct StageState {
    window: CircularBuffer,
    since_last: usize,
    analyzer: BandPowerAnalyzer,
}

impl StageState {
    fn clear(&mut self) {
        self.window.reset();
        self.since_last = 0;
        self.analyzer.reset();
    }
}

/// Batch consumer that republishes band powers as a vector stream.
///
/// Every `hop` new samples, the latest `fft_size` values of one channel are
/// analysed and the smoothed relative powers published on `output`; a batch
/// spanning several hops publishes one frame per hop. Buffer
/// resets and filter changes on the channel restart the window.
pub struct BandPowerStage {
    config: BandPowerStageConfig,
    _batches: Subscription,
    _events: Subscription,
}

impl BandPowerStage {
    pub fn attach(context: &Arc<DataContext>, config: BandPowerStageConfig) -> BspResult<Self> {
        config.validate(context.channel_count())?;

        let state = Arc::new(Mutex::new(StageState {
            window: CircularBuffer::new(config.fft_size),
            since_last: 0,
            analyzer: BandPowerAnalyzer::new(Arc::clone(context.registry())),
        }));

        let weak: Weak<DataContext> = Arc::downgrade(context);
        let batch_state = Arc::clone(&state);
        let batch_config = config.clone();
        let batches = context.subscribe_batches(move |batch| {
            let frames: Vec<WidgetFrame> = {
                let mut state = batch_state.lock();
                let mut frames = Vec::new();
                for sample in batch.iter() {
                    state.window.push(sample.value(batch_config.channel));
                    state.since_last += 1;
                    if state.window.len() == batch_config.fft_size && state.since_last >= batch_config.hop {
                        state.since_last = 0;
                        frames.extend(analyse(&mut state, &batch_config));
                    }
                }
                frames
            };
            if frames.is_empty() {
                return;
            }
            if let Some(context) = weak.upgrade() {
                // One frame per completed hop, in order
                for frame in frames {
                    context.publish_output(&batch_config.output, frame);
                }
            }
        });

        let event_state = Arc::clone(&state);
        let channel = config.channel;
        let events = context.subscribe_events(move |event| match event {
            ControlEvent::FilterChanged { channel_index } | ControlEvent::BuffersReset { channel_index }
                if *channel_index == channel =>
            {
                debug!(channel, "band-power window restarted");
                event_state.lock().clear();
            }
            _ => {}
        });

        Ok(Self {
            config,
            _batches: batches,
            _events: events,
        })
    }

    pub fn config(&self) -> &BandPowerStageConfig {
        &self.config
    }

    pub fn output(&self) -> &str {
        &self.config.output
    }
}

fn analyse(state: &mut StageState, config: &BandPowerStageConfig) -> Option<WidgetFrame> {
    let request = BandPowerRequest {
        signal: state.window.to_vec(),
        sample_rate: config.sample_rate,
        fft_size: config.fft_size,
        smoother_window: config.smoother_window,
        method: config.method.clone(),
    };
    match state.analyzer.analyze(&request) {
        Ok(response) => Some(WidgetFrame::Vector(response.smooth.to_vec())),
        Err(err) => {
            warn!(channel = config.channel, error = %err, "band-power stage analysis failed");
            None
        }
    }
}
