//! Sample environment signals.
//!
//! A signal source supplies a live scalar value (temperature, pressure, load...)
//! identified by a name unique within a plan. Segments and abort conditions
//! watch signal sources; the engine only ever consumes their values.
//!
//! # Push and pull
//!
//! Every source can be read on demand ([`SignalSource::read`]). Sources that can
//! notify changes additionally expose a `tokio::sync::watch` receiver through
//! [`SignalSource::subscribe`]. [`SignalWatcher`] hides the difference: it yields
//! the next observed value either when a notification arrives or after one poll
//! interval.
//!
//! ```rust,ignore
//! let temperature = ObservableSignal::new("T", 20.0);
//! let mut registry = SignalRegistry::new();
//! registry.register(Arc::new(temperature.clone()));
//!
//! let mut watcher = SignalWatcher::new(registry.resolve("T")?, Duration::from_millis(50));
//! assert_eq!(watcher.next().await?, 20.0);
//! temperature.set(25.0);
//! assert_eq!(watcher.next().await?, 25.0);
//! ```

pub mod sims;

use crate::error::{DriverError, DriverResult};
use anyhow::anyhow;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::warn;

pub use sims::{FunctionSignal, LinearSignal, SequenceSignal};

/// Name reserved for the pause-aware per-segment clock used by timed segments.
pub const SEGMENT_TIME_SIGNAL: &str = "segment_time";

/// A named scalar input observed by the engine.
#[async_trait]
pub trait SignalSource: Send + Sync {
    /// Name of the signal, unique within a plan.
    fn name(&self) -> &str;

    /// Read the current value.
    async fn read(&self) -> anyhow::Result<f64>;

    /// Subscribe to value changes, if the source can push them.
    ///
    /// A `None` sample means the source is currently unavailable.
    fn subscribe(&self) -> Option<watch::Receiver<Option<f64>>> {
        None
    }
}

/// Lookup table from signal name to source.
#[derive(Clone, Default)]
pub struct SignalRegistry {
    sources: HashMap<String, Arc<dyn SignalSource>>,
}

impl SignalRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source under its own name, replacing any previous one.
    pub fn register(&mut self, source: Arc<dyn SignalSource>) -> &mut Self {
        self.sources.insert(source.name().to_string(), source);
        self
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, source: Arc<dyn SignalSource>) -> Self {
        self.register(source);
        self
    }

    /// Whether a source with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }

    /// Look up a source by name.
    pub fn resolve(&self, name: &str) -> DriverResult<Arc<dyn SignalSource>> {
        self.sources
            .get(name)
            .cloned()
            .ok_or_else(|| DriverError::signal_unavailable(name, "no such signal source"))
    }

    /// Names of all registered sources, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sources.keys().cloned().collect();
        names.sort();
        names
    }

    /// Read a signal once by name.
    pub async fn read(&self, name: &str) -> DriverResult<f64> {
        let source = self.resolve(name)?;
        source
            .read()
            .await
            .map_err(|e| DriverError::signal_unavailable(name, e))
    }
}

impl std::fmt::Debug for SignalRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalRegistry")
            .field("sources", &self.names())
            .finish()
    }
}

enum WatchMode {
    Push(watch::Receiver<Option<f64>>),
    Poll,
}

/// Yields successive observations of one signal source.
///
/// The first observation is immediate. After that, push-based sources wait for
/// the next change notification and pull-based sources wait one poll interval.
/// Notifications that arrive while nobody is waiting are not lost: the watch
/// channel keeps the latest value and marks it unseen.
pub struct SignalWatcher {
    source: Arc<dyn SignalSource>,
    mode: WatchMode,
    poll_interval: Duration,
    immediate: bool,
}

impl SignalWatcher {
    /// Watch `source`, polling every `poll_interval` if it cannot push.
    pub fn new(source: Arc<dyn SignalSource>, poll_interval: Duration) -> Self {
        let mode = match source.subscribe() {
            Some(rx) => WatchMode::Push(rx),
            None => WatchMode::Poll,
        };
        Self {
            source,
            mode,
            poll_interval,
            immediate: true,
        }
    }

    /// Name of the watched signal.
    pub fn name(&self) -> &str {
        self.source.name()
    }

    /// Make the next observation immediate (used after a resume).
    pub fn rewind(&mut self) {
        self.immediate = true;
    }

    /// Wait for and return the next observed value.
    ///
    /// Returns `SignalUnavailable` when the source cannot supply a value this
    /// cycle; callers decide whether to retry.
    pub async fn next(&mut self) -> DriverResult<f64> {
        let immediate = std::mem::take(&mut self.immediate);
        let mut closed = false;

        if let WatchMode::Push(rx) = &mut self.mode {
            if immediate || rx.changed().await.is_ok() {
                let sample = *rx.borrow_and_update();
                return sample.ok_or_else(|| {
                    DriverError::signal_unavailable(self.source.name(), "source reported no value")
                });
            }
            closed = true;
        }

        if closed {
            warn!(
                signal = %self.source.name(),
                "Signal notification channel closed, falling back to polling"
            );
            self.mode = WatchMode::Poll;
        } else if !immediate {
            tokio::time::sleep(self.poll_interval).await;
        }

        self.source
            .read()
            .await
            .map_err(|e| DriverError::signal_unavailable(self.source.name(), e))
    }
}

/// A settable, push-based signal backed by a `watch` channel.
///
/// Clones share the same underlying value, so a test or a device binding can
/// keep one handle and register another with the [`SignalRegistry`].
#[derive(Clone)]
pub struct ObservableSignal {
    name: Arc<str>,
    tx: Arc<watch::Sender<Option<f64>>>,
}

impl ObservableSignal {
    /// Create a signal holding `initial`.
    pub fn new(name: impl Into<String>, initial: f64) -> Self {
        Self::with_sample(name, Some(initial))
    }

    /// Create a signal that has no value yet.
    pub fn unavailable(name: impl Into<String>) -> Self {
        Self::with_sample(name, None)
    }

    fn with_sample(name: impl Into<String>, sample: Option<f64>) -> Self {
        let (tx, _rx) = watch::channel(sample);
        Self {
            name: Arc::from(name.into()),
            tx: Arc::new(tx),
        }
    }

    /// Publish a new value to all watchers.
    pub fn set(&self, value: f64) {
        self.tx.send_replace(Some(value));
    }

    /// Mark the signal as unavailable.
    pub fn set_unavailable(&self) {
        self.tx.send_replace(None);
    }

    /// Current value, if any.
    pub fn value(&self) -> Option<f64> {
        *self.tx.borrow()
    }

    /// Number of live watchers subscribed to this signal.
    pub fn watcher_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[async_trait]
impl SignalSource for ObservableSignal {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self) -> anyhow::Result<f64> {
        self.value()
            .ok_or_else(|| anyhow!("signal '{}' has no value", self.name))
    }

    fn subscribe(&self) -> Option<watch::Receiver<Option<f64>>> {
        Some(self.tx.subscribe())
    }
}

impl std::fmt::Debug for ObservableSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservableSignal")
            .field("name", &self.name)
            .field("value", &self.value())
            .finish()
    }
}
