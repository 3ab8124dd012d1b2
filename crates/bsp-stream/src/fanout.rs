//! Publish/subscribe fan-out
//!
//! Three subscriber registries hang off a pipeline: sample batches, named
//! widget-output streams and control events. Every subscribe call returns a
//! [`Subscription`] handle that unsubscribes when dropped.

use bsp_core::{ControlEvent, SampleBatch, WidgetFrame};
use parking_lot::{Mutex, ReentrantMutex};
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

pub type BatchCallback = Arc<dyn Fn(&Arc<SampleBatch>) + Send + Sync>;
pub type OutputCallback = Arc<dyn Fn(&[WidgetFrame]) + Send + Sync>;
pub type EventCallback = Arc<dyn Fn(&ControlEvent) + Send + Sync>;

/// Subscriber list for one kind of delivery
pub struct Registry<T: ?Sized> {
    name: &'static str,
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(u64, Arc<dyn Fn(&T) + Send + Sync>)>>,
    panics: AtomicU64,
}

impl<T: ?Sized + 'static> Registry<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
            panics: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.lock().is_empty()
    }

    /// Subscriber callbacks that panicked so far
    pub fn panic_count(&self) -> u64 {
        self.panics.load(Ordering::Relaxed)
    }

    fn insert(&self, callback: Arc<dyn Fn(&T) + Send + Sync>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push((id, callback));
        id
    }

    fn remove(&self, id: u64) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    /// Register a callback and return a handle that removes it again
    pub fn subscribe(self: &Arc<Self>, callback: Arc<dyn Fn(&T) + Send + Sync>) -> Subscription {
        let id = self.insert(callback);
        debug!(registry = self.name, id, "subscriber added");
        Subscription::new(Arc::downgrade(self), id)
    }

    fn snapshot(&self) -> Vec<Arc<dyn Fn(&T) + Send + Sync>> {
        self.subscribers.lock().iter().map(|(_, cb)| Arc::clone(cb)).collect()
    }

    /// Call every subscriber registered at the time of the call.
    ///
    /// No lock is held while callbacks run. A panicking callback is logged
    /// and the remaining subscribers are still called.
    pub fn deliver(&self, value: &T) -> usize {
        let subscribers = self.snapshot();
        for callback in &subscribers {
            self.call_isolated(callback.as_ref(), value);
        }
        subscribers.len()
    }

    fn call_isolated(&self, callback: &(dyn Fn(&T) + Send + Sync), value: &T) {
        if catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
            self.panics.fetch_add(1, Ordering::Relaxed);
            warn!(registry = self.name, "subscriber panicked; continuing delivery");
        }
    }
}

/// Removal hook a handle calls at most once
trait Detachable: Send + Sync {
    fn detach_subscriber(&self, id: u64) -> bool;
}

impl<T: ?Sized + 'static> Detachable for Registry<T> {
    fn detach_subscriber(&self, id: u64) -> bool {
        let removed = self.remove(id);
        if removed {
            debug!(registry = self.name, id, "subscriber removed");
        }
        removed
    }
}

/// Handle for one subscription.
///
/// `unsubscribe` is idempotent. Dropping the handle unsubscribes; call
/// [`Subscription::detach`] to keep the subscription for the pipeline's life.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    registry: Option<Weak<dyn Detachable>>,
    id: u64,
}

impl Subscription {
    fn new<R: Detachable + 'static>(registry: Weak<R>, id: u64) -> Self {
        let registry: Weak<dyn Detachable> = registry;
        Self {
            registry: Some(registry),
            id,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// `false` once unsubscribed or detached
    pub fn is_active(&self) -> bool {
        self.registry.is_some()
    }

    /// Remove the subscriber; returns `true` only on the call that removed it
    pub fn unsubscribe(&mut self) -> bool {
        match self.registry.take().and_then(|weak| weak.upgrade()) {
            Some(registry) => registry.detach_subscriber(self.id),
            None => false,
        }
    }

    /// Keep the subscription alive without holding the handle
    pub fn detach(mut self) {
        self.registry = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

struct OutputStream {
    history: VecDeque<WidgetFrame>,
    subscribers: Arc<Registry<[WidgetFrame]>>,
    // Serializes deliveries so replay and appends reach a subscriber in order
    delivery: Arc<ReentrantMutex<()>>,
    published: u64,
}

impl OutputStream {
    fn new() -> Self {
        Self {
            history: VecDeque::new(),
            subscribers: Arc::new(Registry::new("output")),
            delivery: Arc::new(ReentrantMutex::new(())),
            published: 0,
        }
    }
}

/// Named, bounded widget-output streams with replay-on-subscribe
pub struct OutputStreams {
    capacity: usize,
    streams: Mutex<HashMap<String, OutputStream>>,
}

impl OutputStreams {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            streams: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Delivery lock of a stream, creating the stream on first use
    fn delivery_lock(&self, name: &str) -> Arc<ReentrantMutex<()>> {
        let mut streams = self.streams.lock();
        let stream = streams.entry(name.to_string()).or_insert_with(|| {
            debug!(stream = name, "output stream created");
            OutputStream::new()
        });
        Arc::clone(&stream.delivery)
    }

    /// Append a frame, truncating from the front, then notify subscribers with
    /// the full current history
    pub fn publish(&self, name: &str, frame: WidgetFrame) {
        // Delivery lock before the map lock: appends and replays on one stream
        // reach each subscriber in history order
        let delivery = self.delivery_lock(name);
        let _ordered = delivery.lock();

        let (history, subscribers) = {
            let mut streams = self.streams.lock();
            let stream = streams.entry(name.to_string()).or_insert_with(OutputStream::new);
            stream.history.push_back(frame);
            while stream.history.len() > self.capacity {
                stream.history.pop_front();
            }
            stream.published += 1;
            (Vec::from(stream.history.clone()), Arc::clone(&stream.subscribers))
        };
        subscribers.deliver(&history);
    }

    /// Subscribe to a stream; the callback is first called with the history
    /// so far when there is any
    pub fn subscribe(&self, name: &str, callback: OutputCallback) -> Subscription {
        let delivery = self.delivery_lock(name);
        let _ordered = delivery.lock();

        let (replay, subscription, subscribers) = {
            let mut streams = self.streams.lock();
            let stream = streams.entry(name.to_string()).or_insert_with(OutputStream::new);
            let replay = Vec::from(stream.history.clone());
            let subscription = stream.subscribers.subscribe(Arc::clone(&callback));
            (replay, subscription, Arc::clone(&stream.subscribers))
        };

        if !replay.is_empty() {
            subscribers.call_isolated(callback.as_ref(), &replay);
        }
        subscription
    }

    /// Copy of a stream's history, oldest first
    pub fn history(&self, name: &str) -> Vec<WidgetFrame> {
        self.streams
            .lock()
            .get(name)
            .map(|s| Vec::from(s.history.clone()))
            .unwrap_or_default()
    }

    /// Total frames ever published on a stream
    pub fn published(&self, name: &str) -> u64 {
        self.streams.lock().get(name).map_or(0, |s| s.published)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.streams.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn subscriber_count(&self, name: &str) -> usize {
        self.streams.lock().get(name).map_or(0, |s| s.subscribers.len())
    }
}

/// All fan-out registries of one pipeline
pub struct Fanout {
    pub batches: Arc<Registry<Arc<SampleBatch>>>,
    pub events: Arc<Registry<ControlEvent>>,
    pub outputs: OutputStreams,
}

impl Fanout {
    pub fn new(output_capacity: usize) -> Self {
        Self {
            batches: Arc::new(Registry::new("batch")),
            events: Arc::new(Registry::new("event")),
            outputs: OutputStreams::new(output_capacity),
        }
    }

    /// Panics caught across the batch and event registries
    pub fn panic_count(&self) -> u64 {
        self.batches.panic_count() + self.events.panic_count()
    }
}
