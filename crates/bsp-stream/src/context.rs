//! `DataContext`: the streaming pipeline facade
//!
//! Producers call [`DataContext::ingest`] from any thread. A tick source
//! drives [`DataContext::on_tick`], which flushes the pending queue as one
//! batch into the buffer store and out to subscribers.

use crate::buffer_store::BufferStore;
use crate::config::PipelineConfig;
use crate::diagnostics::CounterTracker;
use crate::fanout::{Fanout, Subscription};
use crate::normalizer::Normalizer;
use crate::scheduler::Scheduler;
use bsp_core::{
    BspError, BspResult, ChannelSample, ChannelSet, ControlEvent, RecordIssues, SampleBatch, WidgetFrame,
};
use bsp_processing::{AnalysisRegistry, FilterBank, FilterConfig};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Pipeline counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStats {
    pub ingested: u64,
    pub dropped: u64,
    pub flushes: u64,
    pub samples_flushed: u64,
    pub missing_samples: u64,
    pub malformed_records: u64,
    pub last_batch_size: usize,
    pub pending: usize,
    pub subscriber_panics: u64,
}

/// Throttled summary of the buffer store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Most recent value per buffered channel
    pub latest: BTreeMap<usize, f64>,
    /// Values currently held per channel
    pub buffered: BTreeMap<usize, usize>,
    pub last_sequence_id: Option<u32>,
    pub samples_flushed: u64,
    /// Wall-clock time of the refresh (ms since the Unix epoch)
    pub taken_at: u64,
}

#[derive(Debug)]
struct SnapshotState {
    interval: Duration,
    last_refresh: Option<Instant>,
    current: Option<Snapshot>,
}

#[derive(Debug, Default)]
struct Counters {
    ingested: AtomicU64,
    flushes: AtomicU64,
    samples_flushed: AtomicU64,
    malformed: AtomicU64,
    last_batch_size: AtomicUsize,
}

/// One streaming pipeline
pub struct DataContext {
    name: String,
    channel_count: usize,
    registry: Arc<AnalysisRegistry>,
    normalizer: Mutex<Normalizer>,
    scheduler: Scheduler,
    buffers: RwLock<BufferStore>,
    // Held across a flush and across filter changes so a batch filtered by
    // an old chain never lands in a buffer after its reset
    flush_gate: ReentrantMutex<()>,
    fanout: Fanout,
    counters_tracker: Mutex<CounterTracker>,
    snapshot: Mutex<SnapshotState>,
    counters: Counters,
}

fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl DataContext {
    /// Build a pipeline with its own analysis registry
    pub fn new(config: PipelineConfig) -> BspResult<Self> {
        let registry = Arc::new(AnalysisRegistry::new(config.fft_cache_capacity));
        Self::with_registry(config, registry)
    }

    /// Build a pipeline sharing an existing analysis registry
    pub fn with_registry(config: PipelineConfig, registry: Arc<AnalysisRegistry>) -> BspResult<Self> {
        config.validate()?;

        let mut filters = FilterBank::new(Arc::clone(registry.coefficients()));
        if let Some(rate) = config.sampling_rate {
            filters.set_global_sampling_rate(rate)?;
        }
        for (&channel, filter) in &config.filters {
            filters.configure_channel(channel, filter.clone())?;
        }

        let normalizer = Normalizer::new(config.channel_count, config.registered_channels.clone(), filters)
            .with_bit_depth(config.bit_depth)
            .with_raw_snapshot(config.keep_raw_snapshot);

        let mut buffers = BufferStore::new(config.buffer_capacity);
        buffers.sync_channels(&config.registered_channels);

        info!(
            pipeline = %config.name,
            channels = config.channel_count,
            registered = config.registered_channels.len(),
            rate = ?config.sampling_rate,
            "pipeline created"
        );

        Ok(Self {
            name: config.name.clone(),
            channel_count: config.channel_count,
            registry,
            normalizer: Mutex::new(normalizer),
            scheduler: Scheduler::new(config.queue_capacity, config.drop_fraction),
            buffers: RwLock::new(buffers),
            flush_gate: ReentrantMutex::new(()),
            fanout: Fanout::new(config.output_capacity),
            counters_tracker: Mutex::new(CounterTracker::new(config.counter_report_interval())),
            snapshot: Mutex::new(SnapshotState {
                interval: config.snapshot_interval(),
                last_refresh: None,
                current: None,
            }),
            counters: Counters::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    pub fn registry(&self) -> &Arc<AnalysisRegistry> {
        &self.registry
    }

    fn check_channel(&self, channel: usize) -> BspResult<()> {
        if channel < self.channel_count {
            Ok(())
        } else {
            Err(BspError::ChannelOutOfRange {
                index: channel,
                channel_count: self.channel_count,
            })
        }
    }

    // ---- ingestion ----

    /// Normalize and enqueue one raw sample; never fails
    pub fn ingest(&self, sample: ChannelSample) {
        let outcome = {
            let mut normalizer = self.normalizer.lock();
            let processed = normalizer.normalize(&sample);
            // Enqueue under the normalizer lock so queue order matches filter order
            self.scheduler.enqueue(processed)
        };
        self.counters.ingested.fetch_add(1, Ordering::Relaxed);

        if outcome.dropped > 0 {
            self.fanout.events.deliver(&ControlEvent::QueueOverflow {
                dropped: outcome.dropped,
            });
        }
    }

    /// Parse and ingest a loosely-typed record.
    ///
    /// Returns the recovered-field tally, or `None` when the record was not
    /// an object and was skipped.
    pub fn ingest_record(&self, record: &Value) -> Option<RecordIssues> {
        match ChannelSample::from_record(record, self.channel_count) {
            Ok((sample, issues)) => {
                if !issues.is_clean() {
                    debug!(?issues, "record fields recovered");
                }
                self.ingest(sample);
                Some(issues)
            }
            Err(err) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %err, "skipping malformed record");
                None
            }
        }
    }

    // ---- flushing ----

    /// Flush if a flush is pending; meant to be called once per tick
    pub fn on_tick(&self) -> Option<Arc<SampleBatch>> {
        if !self.scheduler.is_flush_scheduled() {
            return None;
        }
        self.flush_at(Instant::now())
    }

    /// Deliver every pending sample as one batch.
    ///
    /// Returns `None` when the queue was empty or another flush or filter
    /// change is running. Subscribers are called synchronously with no
    /// pipeline lock held; they must not call back into ingestion.
    pub fn flush_at(&self, now: Instant) -> Option<Arc<SampleBatch>> {
        let _gate = self.flush_gate.try_lock()?;
        let _flight = self.scheduler.begin_flush()?;

        let samples = self.scheduler.take_pending();
        if samples.is_empty() {
            return None;
        }
        Some(self.deliver_batch(samples, now))
    }

    fn deliver_batch(&self, samples: Vec<ChannelSample>, now: Instant) -> Arc<SampleBatch> {
        let batch = Arc::new(SampleBatch::new(samples));

        self.buffers.write().append_batch(&batch);
        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        self.counters
            .samples_flushed
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        self.counters.last_batch_size.store(batch.len(), Ordering::Relaxed);

        self.refresh_snapshot(&batch, now);

        let report = {
            let mut tracker = self.counters_tracker.lock();
            tracker.observe(batch.counters());
            tracker.take_report(now)
        };

        debug!(batch = %batch.id, size = batch.len(), "flushing batch");
        if let Some(count) = report {
            self.fanout.events.deliver(&ControlEvent::SamplesMissing { count });
        }
        self.fanout.batches.deliver(&batch);
        batch
    }

    fn refresh_snapshot(&self, batch: &SampleBatch, now: Instant) {
        let mut state = self.snapshot.lock();
        let due = state
            .last_refresh
            .map_or(true, |last| now.saturating_duration_since(last) >= state.interval);
        if !due {
            return;
        }

        let buffers = self.buffers.read();
        let mut latest = BTreeMap::new();
        let mut buffered = BTreeMap::new();
        for channel in buffers.channels() {
            if let Some(buffer) = buffers.channel(channel) {
                if let Some(value) = buffer.last() {
                    latest.insert(channel, value);
                }
                buffered.insert(channel, buffer.len());
            }
        }

        state.current = Some(Snapshot {
            latest,
            buffered,
            last_sequence_id: batch.samples.last().and_then(|s| s.sequence_id),
            samples_flushed: self.counters.samples_flushed.load(Ordering::Relaxed),
            taken_at: epoch_millis(),
        });
        state.last_refresh = Some(now);
    }

    // ---- configuration ----

    /// Replace the registered-channel set; buffers are created and torn down
    /// to match
    pub fn set_registered_channels(&self, channels: ChannelSet) -> BspResult<()> {
        if let Some(max) = channels.max() {
            self.check_channel(max)?;
        }
        self.buffers.write().sync_channels(&channels);
        info!(pipeline = %self.name, registered = channels.len(), "registered channels updated");
        self.normalizer.lock().set_registered(channels);
        Ok(())
    }

    /// Apply filter configurations; returns the channels whose chain changed.
    ///
    /// Every changed channel has its buffer cleared and emits
    /// `FilterChanged` followed by `BuffersReset`.
    pub fn configure_filters(&self, filters: BTreeMap<usize, FilterConfig>) -> BspResult<Vec<usize>> {
        for (&channel, filter) in &filters {
            self.check_channel(channel)?;
            if let Some(rate) = filter.sampling_rate {
                if !(rate.is_finite() && rate > 0.0) {
                    return Err(BspError::InvalidSamplingRate { rate });
                }
            }
        }

        let changed = self.reconfigure(|bank| {
            let mut changed = Vec::new();
            for (channel, filter) in filters {
                if bank.configure_channel(channel, filter)? {
                    changed.push(channel);
                }
            }
            Ok(changed)
        })?;
        if !changed.is_empty() {
            info!(pipeline = %self.name, channels = ?changed, "filter chains changed");
        }
        Ok(changed)
    }

    /// Set one channel's sampling rate; `true` when it changed
    pub fn set_sampling_rate(&self, channel: usize, rate: f64) -> BspResult<bool> {
        self.check_channel(channel)?;
        let changed = self.reconfigure(|bank| {
            Ok(if bank.set_sampling_rate(channel, rate)? {
                vec![channel]
            } else {
                Vec::new()
            })
        })?;
        if !changed.is_empty() {
            info!(pipeline = %self.name, channel, rate, "channel sampling rate changed");
        }
        Ok(!changed.is_empty())
    }

    /// Set the rate for every channel without its own; returns affected channels
    pub fn set_global_sampling_rate(&self, rate: f64) -> BspResult<Vec<usize>> {
        let changed = self.reconfigure(|bank| bank.set_global_sampling_rate(rate))?;
        info!(pipeline = %self.name, rate, affected = changed.len(), "global sampling rate set");
        Ok(changed)
    }

    /// Explicit ADC resolution; `None` returns to inference
    pub fn set_bit_depth(&self, bit_depth: Option<u32>) -> BspResult<()> {
        if let Some(bits) = bit_depth {
            if bits == 0 || bits > 32 {
                return Err(bsp_core::config_error!("bit depth {} outside 1..=32", bits));
            }
        }
        self.normalizer.lock().set_bit_depth(bit_depth);
        info!(pipeline = %self.name, ?bit_depth, "bit depth set");
        Ok(())
    }

    /// Apply a filter-bank change, then reset the buffers of the channels
    /// it reports.
    ///
    /// Samples queued before the change were filtered by the old chains.
    /// They are flushed as their own batch ahead of the reset, so the reset
    /// buffers and the events that follow only ever see new-chain data.
    fn reconfigure<F>(&self, apply: F) -> BspResult<Vec<usize>>
    where
        F: FnOnce(&mut FilterBank) -> BspResult<Vec<usize>>,
    {
        let _gate = self.flush_gate.lock();
        // `None` only inside a batch callback, whose flush already took the queue
        let flight = self.scheduler.begin_flush();
        let (changed, stale) = {
            let mut normalizer = self.normalizer.lock();
            let changed = apply(normalizer.filters_mut())?;
            let stale = match &flight {
                Some(_) if !changed.is_empty() => self.scheduler.take_pending(),
                _ => Vec::new(),
            };
            (changed, stale)
        };

        if !stale.is_empty() {
            debug!(pipeline = %self.name, samples = stale.len(), "flushing samples queued before filter change");
            self.deliver_batch(stale, Instant::now());
        }
        drop(flight);
        self.announce_filter_changes(&changed);
        Ok(changed)
    }

    fn announce_filter_changes(&self, channels: &[usize]) {
        for &channel in channels {
            let reset = self.buffers.write().reset_channel(channel);
            self.fanout
                .events
                .deliver(&ControlEvent::FilterChanged { channel_index: channel });
            if reset {
                self.fanout
                    .events
                    .deliver(&ControlEvent::BuffersReset { channel_index: channel });
            }
        }
    }

    /// Clear one channel's history and filter state
    pub fn reset_channel(&self, channel: usize) -> BspResult<()> {
        self.check_channel(channel)?;
        self.normalizer.lock().filters_mut().reset_channel(channel);
        if self.buffers.write().reset_channel(channel) {
            self.fanout
                .events
                .deliver(&ControlEvent::BuffersReset { channel_index: channel });
        }
        Ok(())
    }

    pub fn filter_configs(&self) -> BTreeMap<usize, FilterConfig> {
        self.normalizer.lock().filters().configs()
    }

    pub fn active_filter_keys(&self, channel: usize) -> Vec<String> {
        self.normalizer.lock().filters().active_keys(channel)
    }

    pub fn sampling_rate(&self, channel: usize) -> Option<f64> {
        self.normalizer.lock().filters().sampling_rate(channel)
    }

    pub fn registered_channels(&self) -> ChannelSet {
        self.normalizer.lock().registered().clone()
    }

    // ---- fan-out ----

    pub fn subscribe_batches<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Arc<SampleBatch>) + Send + Sync + 'static,
    {
        self.fanout.batches.subscribe(Arc::new(callback))
    }

    /// Subscribe to a named output stream with replay of its current history
    pub fn subscribe_output<F>(&self, name: &str, callback: F) -> Subscription
    where
        F: Fn(&[WidgetFrame]) + Send + Sync + 'static,
    {
        self.fanout.outputs.subscribe(name, Arc::new(callback))
    }

    pub fn subscribe_events<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ControlEvent) + Send + Sync + 'static,
    {
        self.fanout.events.subscribe(Arc::new(callback))
    }

    pub fn publish_output(&self, name: &str, frame: impl Into<WidgetFrame>) {
        self.fanout.outputs.publish(name, frame.into());
    }

    pub fn output_history(&self, name: &str) -> Vec<WidgetFrame> {
        self.fanout.outputs.history(name)
    }

    pub fn output_names(&self) -> Vec<String> {
        self.fanout.outputs.names()
    }

    // ---- inspection ----

    /// Chronological copy of one channel's buffer
    pub fn buffer(&self, channel: usize) -> Option<Vec<f64>> {
        self.buffers.read().channel(channel).map(|b| b.to_vec())
    }

    /// Last `n` buffered values of a channel
    pub fn latest(&self, channel: usize, n: usize) -> Option<Vec<f64>> {
        self.buffers.read().channel(channel).map(|b| b.latest(n))
    }

    pub fn buffers_snapshot(&self) -> BTreeMap<usize, Vec<f64>> {
        self.buffers.read().snapshot()
    }

    /// Throttled snapshot from the most recent refresh
    pub fn snapshot(&self) -> Option<Snapshot> {
        self.snapshot.lock().current.clone()
    }

    pub fn pending(&self) -> usize {
        self.scheduler.pending()
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            ingested: self.counters.ingested.load(Ordering::Relaxed),
            dropped: self.scheduler.dropped_total(),
            flushes: self.counters.flushes.load(Ordering::Relaxed),
            samples_flushed: self.counters.samples_flushed.load(Ordering::Relaxed),
            missing_samples: self.counters_tracker.lock().total_missing(),
            malformed_records: self.counters.malformed.load(Ordering::Relaxed),
            last_batch_size: self.counters.last_batch_size.load(Ordering::Relaxed),
            pending: self.scheduler.pending(),
            subscriber_panics: self.fanout.panic_count(),
        }
    }

    /// Drop pending samples and clear every buffer, filter and counter track
    pub fn reset(&self) {
        let _gate = self.flush_gate.lock();
        let discarded = self.scheduler.clear();
        self.normalizer.lock().reset();
        let channels: Vec<usize> = {
            let mut buffers = self.buffers.write();
            let channels: Vec<usize> = buffers.channels().collect();
            for &channel in &channels {
                buffers.reset_channel(channel);
            }
            channels
        };
        self.counters_tracker.lock().reset();
        info!(pipeline = %self.name, discarded, "pipeline reset");
        for channel in channels {
            self.fanout
                .events
                .deliver(&ControlEvent::BuffersReset { channel_index: channel });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use serde_json::json;
    use std::f64::consts::PI;

    fn context(channels: usize) -> DataContext {
        let config = PipelineConfig {
            channel_count: channels,
            registered_channels: ChannelSet::all(channels),
            bit_depth: Some(12),
            buffer_capacity: 8,
            ..PipelineConfig::default()
        };
        DataContext::new(config).unwrap()
    }

    fn events_of(ctx: &DataContext) -> (Arc<PlMutex<Vec<ControlEvent>>>, Subscription) {
        let events = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let sub = ctx.subscribe_events(move |e| sink.lock().push(e.clone()));
        (events, sub)
    }

    #[test]
    fn test_ingest_flush_deliver() {
        let ctx = context(2);
        let received = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let _sub = ctx.subscribe_batches(move |batch| sink.lock().push(batch.len()));

        for v in [2048.0, 4095.0, 0.0] {
            ctx.ingest(ChannelSample::new(vec![v, v]));
        }
        assert_eq!(ctx.pending(), 3);

        let batch = ctx.flush_at(Instant::now()).unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.samples[0].channels, vec![0.0, 0.0]);
        assert_eq!(batch.samples[2].channels, vec![-1.0, -1.0]);
        assert_eq!(*received.lock(), vec![3]);
        assert_eq!(ctx.buffer(0).unwrap().len(), 3);

        // Nothing pending: no batch, no delivery
        assert!(ctx.flush_at(Instant::now()).is_none());
        assert!(ctx.on_tick().is_none());
        assert_eq!(received.lock().len(), 1);
    }

    #[test]
    fn test_batches_preserve_ingestion_order() {
        let ctx = context(1);
        for i in 0..5 {
            ctx.ingest(ChannelSample::new(vec![i as f64 * 100.0]));
        }
        let batch = ctx.flush_at(Instant::now()).unwrap();
        let ids: Vec<_> = batch.iter().map(|s| s.sequence_id.unwrap()).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_buffer_keeps_last_capacity_samples() {
        let ctx = context(1);
        for i in 0..20 {
            ctx.ingest(ChannelSample::new(vec![2048.0 + i as f64 * 2.0]));
            if i % 3 == 0 {
                ctx.flush_at(Instant::now());
            }
        }
        ctx.flush_at(Instant::now());
        let expected: Vec<f64> = (12..20).map(|i| i as f64 * 2.0 / 2048.0).collect();
        assert_eq!(ctx.buffer(0).unwrap(), expected);
    }

    #[test]
    fn test_unregistered_channels_are_zero() {
        let ctx = context(3);
        ctx.set_registered_channels([0, 2].into_iter().collect()).unwrap();
        ctx.ingest(ChannelSample::new(vec![4000.0, 4000.0, 4000.0]));
        let batch = ctx.flush_at(Instant::now()).unwrap();
        assert_eq!(batch.samples[0].channels[1], 0.0);
        assert!(ctx.buffer(1).is_none());
        assert!(ctx.set_registered_channels([5].into_iter().collect()).is_err());
    }

    #[test]
    fn test_counter_gap_reports_missing_samples() {
        let ctx = context(1);
        let (events, _sub) = events_of(&ctx);
        for counter in [10u8, 11, 13, 14] {
            ctx.ingest(ChannelSample::new(vec![0.0]).with_counter(counter));
        }
        ctx.flush_at(Instant::now());
        assert_eq!(*events.lock(), vec![ControlEvent::SamplesMissing { count: 1 }]);
        assert_eq!(ctx.stats().missing_samples, 1);
    }

    #[test]
    fn test_overflow_emits_event_and_counts() {
        let config = PipelineConfig {
            channel_count: 1,
            registered_channels: ChannelSet::all(1),
            queue_capacity: 10,
            ..PipelineConfig::default()
        };
        let ctx = DataContext::new(config).unwrap();
        let (events, _sub) = events_of(&ctx);
        for _ in 0..11 {
            ctx.ingest(ChannelSample::new(vec![1.0]));
        }
        assert_eq!(*events.lock(), vec![ControlEvent::QueueOverflow { dropped: 2 }]);
        let stats = ctx.stats();
        assert_eq!(stats.ingested, 11);
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.pending, 9);
    }

    #[test]
    fn test_filter_change_resets_buffer_and_notifies() {
        let ctx = context(2);
        ctx.set_global_sampling_rate(500.0).unwrap();
        ctx.ingest(ChannelSample::new(vec![100.0, 100.0]));
        ctx.flush_at(Instant::now());
        let (events, _sub) = events_of(&ctx);

        let mut filters = BTreeMap::new();
        filters.insert(1, FilterConfig::new(["notch-50"]));
        assert_eq!(ctx.configure_filters(filters.clone()).unwrap(), vec![1]);

        assert_eq!(
            *events.lock(),
            vec![
                ControlEvent::FilterChanged { channel_index: 1 },
                ControlEvent::BuffersReset { channel_index: 1 },
            ]
        );
        assert!(ctx.buffer(1).unwrap().is_empty());
        assert_eq!(ctx.buffer(0).unwrap().len(), 1);
        assert_eq!(ctx.active_filter_keys(1), vec!["notch-50".to_string()]);

        // Same configuration again changes nothing
        assert!(ctx.configure_filters(filters).unwrap().is_empty());
        assert_eq!(events.lock().len(), 2);
    }

    #[test]
    fn test_pending_filter_activates_with_rate() {
        let ctx = context(1);
        let mut filters = BTreeMap::new();
        filters.insert(0, FilterConfig::new(["notch-50"]));
        ctx.configure_filters(filters).unwrap();
        assert!(ctx.active_filter_keys(0).is_empty());

        let (events, _sub) = events_of(&ctx);
        assert!(ctx.set_sampling_rate(0, 500.0).unwrap());
        assert_eq!(ctx.active_filter_keys(0), vec!["notch-50".to_string()]);
        assert!(events.lock().contains(&ControlEvent::FilterChanged { channel_index: 0 }));
        assert!(!ctx.set_sampling_rate(0, 500.0).unwrap());
        assert!(ctx.set_sampling_rate(3, 500.0).is_err());
    }

    #[test]
    fn test_notch_through_pipeline() {
        let config = PipelineConfig {
            channel_count: 1,
            registered_channels: ChannelSet::all(1),
            sampling_rate: Some(500.0),
            bit_depth: Some(16),
            buffer_capacity: 500,
            ..PipelineConfig::default()
        };
        let ctx = DataContext::new(config).unwrap();
        let mut filters = BTreeMap::new();
        filters.insert(0, FilterConfig::new(["notch-50"]));
        ctx.configure_filters(filters).unwrap();

        for i in 0..2000 {
            let raw = 32768.0 + 20000.0 * (2.0 * PI * 50.0 * i as f64 / 500.0).sin();
            ctx.ingest(ChannelSample::new(vec![raw]));
            if i % 50 == 49 {
                ctx.flush_at(Instant::now());
            }
        }
        let peak = ctx.buffer(0).unwrap().iter().fold(0.0f64, |m, v| m.max(v.abs()));
        assert!(peak < 0.05, "peak = {}", peak);
    }

    #[test]
    fn test_ingest_record_boundary() {
        let ctx = context(2);
        let issues = ctx
            .ingest_record(&json!({"ch0": 2048, "ch1": "x", "ch7": 1, "counter": 3}))
            .unwrap();
        assert_eq!(issues.non_numeric, 1);
        assert_eq!(issues.out_of_range, 1);
        assert!(ctx.ingest_record(&json!([1, 2, 3])).is_none());

        let stats = ctx.stats();
        assert_eq!(stats.ingested, 1);
        assert_eq!(stats.malformed_records, 1);

        let batch = ctx.flush_at(Instant::now()).unwrap();
        assert_eq!(batch.samples[0].counter, Some(3));
        assert_eq!(batch.samples[0].channels[0], 0.0);
    }

    #[test]
    fn test_output_streams_through_context() {
        let ctx = context(1);
        ctx.publish_output("bands", vec![1.0, 2.0, 3.0]);
        ctx.publish_output("bands", vec![4.0, 5.0, 6.0]);

        let replayed = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&replayed);
        let _sub = ctx.subscribe_output("bands", move |history| sink.lock().push(history.to_vec()));
        assert_eq!(
            replayed.lock()[0],
            vec![WidgetFrame::from(vec![1.0, 2.0, 3.0]), WidgetFrame::from(vec![4.0, 5.0, 6.0])]
        );
        assert_eq!(ctx.output_history("bands").len(), 2);
        assert_eq!(ctx.output_names(), vec!["bands".to_string()]);
    }

    #[test]
    fn test_panicking_batch_subscriber_does_not_block_others() {
        let ctx = context(1);
        let _bad = ctx.subscribe_batches(|_| panic!("consumer bug"));
        let hits = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&hits);
        let _good = ctx.subscribe_batches(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        ctx.ingest(ChannelSample::new(vec![1.0]));
        ctx.flush_at(Instant::now());
        ctx.ingest(ChannelSample::new(vec![1.0]));
        ctx.flush_at(Instant::now());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(ctx.stats().subscriber_panics, 2);
    }

    #[test]
    fn test_snapshot_is_throttled() {
        let ctx = context(1);
        let start = Instant::now();
        ctx.ingest(ChannelSample::new(vec![4095.0]));
        ctx.flush_at(start);
        let first = ctx.snapshot().unwrap();
        assert_eq!(first.buffered[&0], 1);

        ctx.ingest(ChannelSample::new(vec![0.0]));
        ctx.flush_at(start + Duration::from_millis(50));
        assert_eq!(ctx.snapshot().unwrap().buffered[&0], 1);

        ctx.ingest(ChannelSample::new(vec![0.0]));
        ctx.flush_at(start + Duration::from_millis(250));
        let refreshed = ctx.snapshot().unwrap();
        assert_eq!(refreshed.buffered[&0], 3);
        assert_eq!(refreshed.latest[&0], -1.0);
        assert_eq!(refreshed.last_sequence_id, Some(2));
    }

    #[test]
    fn test_concurrent_ingest_single_flush() {
        let ctx = Arc::new(context(1));
        let producers: Vec<_> = (0..4)
            .map(|_| {
                let ctx = Arc::clone(&ctx);
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        ctx.ingest(ChannelSample::new(vec![1.0]));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        let batch = ctx.flush_at(Instant::now()).unwrap();
        assert_eq!(batch.len(), 1000);
        assert!(batch
            .samples
            .windows(2)
            .all(|w| w[1].sequence_id.unwrap() == w[0].sequence_id.unwrap() + 1));
    }

    #[test]
    fn test_reentrant_flush_is_noop() {
        let ctx = Arc::new(context(1));
        let inner = Arc::downgrade(&ctx);
        let nested = Arc::new(PlMutex::new(None));
        let seen = Arc::clone(&nested);
        ctx.subscribe_batches(move |_| {
            if let Some(ctx) = inner.upgrade() {
                *seen.lock() = Some(ctx.flush_at(Instant::now()).is_none());
            }
        })
        .detach();

        ctx.ingest(ChannelSample::new(vec![1.0]));
        ctx.flush_at(Instant::now());
        assert_eq!(*nested.lock(), Some(true));
    }

    #[test]
    fn test_queued_samples_settle_before_filter_change() {
        let ctx = context(1);
        ctx.set_global_sampling_rate(500.0).unwrap();
        let batches = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&batches);
        let _batches = ctx.subscribe_batches(move |batch| sink.lock().push(batch.len()));
        let (events, _sub) = events_of(&ctx);

        for _ in 0..10 {
            ctx.ingest(ChannelSample::new(vec![4000.0]));
        }
        let mut filters = BTreeMap::new();
        filters.insert(0, FilterConfig::new(["highpass-1"]));
        assert_eq!(ctx.configure_filters(filters).unwrap(), vec![0]);

        // Old-chain samples went out as their own batch, ahead of the reset
        assert_eq!(*batches.lock(), vec![10]);
        assert_eq!(
            *events.lock(),
            vec![
                ControlEvent::FilterChanged { channel_index: 0 },
                ControlEvent::BuffersReset { channel_index: 0 },
            ]
        );
        assert_eq!(ctx.pending(), 0);
        assert!(ctx.flush_at(Instant::now()).is_none());
        assert!(ctx.buffer(0).unwrap().is_empty());

        ctx.ingest(ChannelSample::new(vec![2048.0]));
        ctx.flush_at(Instant::now());
        assert_eq!(ctx.buffer(0).unwrap().len(), 1);
    }

    #[test]
    fn test_queued_samples_settle_before_rate_change() {
        let ctx = context(1);
        ctx.set_global_sampling_rate(500.0).unwrap();
        let mut filters = BTreeMap::new();
        filters.insert(0, FilterConfig::new(["notch-50"]));
        ctx.configure_filters(filters).unwrap();

        for _ in 0..3 {
            ctx.ingest(ChannelSample::new(vec![3000.0]));
        }
        assert!(ctx.set_sampling_rate(0, 250.0).unwrap());
        assert!(ctx.flush_at(Instant::now()).is_none());
        assert!(ctx.buffer(0).unwrap().is_empty());
        assert_eq!(ctx.stats().samples_flushed, 3);
    }

    #[test]
    fn test_unchanged_configuration_leaves_queue_alone() {
        let ctx = context(1);
        ctx.ingest(ChannelSample::new(vec![1.0]));
        assert!(ctx.configure_filters(BTreeMap::new()).unwrap().is_empty());
        assert_eq!(ctx.pending(), 1);
    }

    fn fourteen_bit_run(bit_depth: Option<u32>) -> Vec<f64> {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let config = PipelineConfig {
            channel_count: 1,
            registered_channels: ChannelSet::all(1),
            bit_depth,
            buffer_capacity: 2048,
            ..PipelineConfig::default()
        };
        let ctx = DataContext::new(config).unwrap();
        let mut rng = StdRng::seed_from_u64(14);
        for _ in 0..1000 {
            ctx.ingest(ChannelSample::new(vec![rng.gen_range(0..16384) as f64]));
        }
        assert_eq!(ctx.flush_at(Instant::now()).unwrap().len(), 1000);
        assert!(ctx.flush_at(Instant::now()).is_none());
        ctx.buffer(0).unwrap()
    }

    #[test]
    fn test_fourteen_bit_stream_with_explicit_depth() {
        let buffer = fourteen_bit_run(Some(14));
        assert_eq!(buffer.len(), 1000);
        assert!(buffer.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn test_fourteen_bit_stream_with_inferred_depth() {
        let buffer = fourteen_bit_run(None);
        assert_eq!(buffer.len(), 1000);
        assert!(buffer.iter().all(|v| (-1.0..=1.0).contains(v)));
    }
}
