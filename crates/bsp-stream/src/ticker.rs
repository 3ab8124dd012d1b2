//! Tick sources driving the flush loop

use crate::context::DataContext;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Source of render-aligned ticks
pub trait TickSource: Send + 'static {
    /// Resolve at the next tick
    fn tick(&mut self) -> impl Future<Output = ()> + Send;
}

/// Fixed-period ticks from a tokio interval; late ticks are skipped
#[derive(Debug)]
pub struct IntervalTicks {
    interval: Interval,
}

impl IntervalTicks {
    /// Must be called inside a tokio runtime
    pub fn new(period: Duration) -> Self {
        let mut interval = interval(period.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval }
    }

    /// Ticks at a display refresh rate
    pub fn from_hz(hz: f64) -> Self {
        let hz = if hz.is_finite() && hz > 0.0 { hz } else { 60.0 };
        Self::new(Duration::from_secs_f64(1.0 / hz))
    }
}

impl TickSource for IntervalTicks {
    async fn tick(&mut self) {
        self.interval.tick().await;
    }
}

/// Flush `context` on every tick until `cancel` fires.
///
/// Pending samples are flushed once more on shutdown. The task resolves to
/// the number of non-empty flushes it performed.
pub fn spawn_flush_loop<T: TickSource>(
    context: Arc<DataContext>,
    mut ticks: T,
    cancel: CancellationToken,
) -> JoinHandle<u64> {
    tokio::spawn(async move {
        info!(pipeline = %context.name(), "flush loop started");
        let mut flushes = 0u64;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticks.tick() => {
                    if let Some(batch) = context.on_tick() {
                        flushes += 1;
                        debug!(size = batch.len(), "tick flush");
                    }
                }
            }
        }

        if context.flush_at(Instant::now()).is_some() {
            flushes += 1;
        }
        info!(pipeline = %context.name(), flushes, "flush loop stopped");
        flushes
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use bsp_core::{ChannelSample, ChannelSet};
    use tokio::sync::mpsc;

    /// Ticks on demand from a channel
    struct ManualTicks(mpsc::UnboundedReceiver<()>);

    impl TickSource for ManualTicks {
        async fn tick(&mut self) {
            if self.0.recv().await.is_none() {
                std::future::pending::<()>().await;
            }
        }
    }

    fn context() -> Arc<DataContext> {
        let config = PipelineConfig {
            channel_count: 1,
            registered_channels: ChannelSet::all(1),
            ..PipelineConfig::default()
        };
        Arc::new(DataContext::new(config).unwrap())
    }

    #[tokio::test]
    async fn test_manual_ticks_flush() {
        let ctx = context();
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let (batch_tx, mut batch_rx) = mpsc::unbounded_channel();
        ctx.subscribe_batches(move |batch| {
            let _ = batch_tx.send(batch.len());
        })
        .detach();

        let handle = spawn_flush_loop(Arc::clone(&ctx), ManualTicks(rx), cancel.clone());

        ctx.ingest(ChannelSample::new(vec![1.0]));
        ctx.ingest(ChannelSample::new(vec![2.0]));
        tx.send(()).unwrap();
        assert_eq!(batch_rx.recv().await, Some(2));

        ctx.ingest(ChannelSample::new(vec![3.0]));
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), 2);
        assert_eq!(ctx.pending(), 0);
    }

    #[tokio::test]
    async fn test_interval_ticks_flush() {
        let ctx = context();
        let cancel = CancellationToken::new();
        let handle = spawn_flush_loop(Arc::clone(&ctx), IntervalTicks::new(Duration::from_millis(5)), cancel.clone());

        ctx.ingest(ChannelSample::new(vec![1.0]));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ctx.stats().flushes, 1);

        cancel.cancel();
        assert_eq!(handle.await.unwrap(), 1);
    }
}
