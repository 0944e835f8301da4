//! Run log and lifecycle events for a stacking run.
//!
//! Logging is synchronous. Events go through an async [`EventPublisher`]:
//! inside a tokio runtime they are spawned onto it, otherwise they are
//! driven to completion on a private current-thread runtime created on
//! first use.

use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use parking_lot::Mutex;
use serde_json::Value;
use shared_event_bus::{EventPublisher, LifecycleEvent};
use shared_logging::{JsonLinesSink, LogLevel, LogRecord, LogSink};
use tokio::runtime::{Builder, Handle, Runtime};

/// Builder for [`StackingTelemetry`].
pub struct StackingTelemetryBuilder {
    target: String,
    log_file: Option<PathBuf>,
    sink: Option<Arc<dyn LogSink>>,
    publisher: Option<Arc<dyn EventPublisher>>,
    verbosity: u8,
}

impl StackingTelemetryBuilder {
    /// Starts at verbosity 2 (info and above) with nothing attached.
    #[must_use]
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            log_file: None,
            sink: None,
            publisher: None,
            verbosity: 2,
        }
    }

    /// Appends JSON lines to `path`.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    /// Uses an existing sink. Wins over [`Self::log_path`].
    #[must_use]
    pub fn log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Where lifecycle events go.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// `0` none, `1` warnings, `2` info, `3` debug.
    #[must_use]
    pub fn verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Opens the log file if one was requested.
    pub fn build(self) -> Result<StackingTelemetry> {
        let sink = match (self.sink, self.log_file) {
            (Some(sink), _) => Some(sink),
            (None, Some(path)) => Some(Arc::new(JsonLinesSink::open(path)?) as Arc<dyn LogSink>),
            (None, None) => None,
        };
        let events = self.publisher.map(Dispatcher::new);
        Ok(StackingTelemetry {
            shared: Arc::new(Shared {
                target: self.target,
                threshold: LogLevel::from_verbosity(self.verbosity),
                sink,
                events,
            }),
        })
    }
}

/// Cheap-to-clone handle over a run log and an event publisher.
#[derive(Clone)]
pub struct StackingTelemetry {
    shared: Arc<Shared>,
}

struct Shared {
    target: String,
    threshold: Option<LogLevel>,
    sink: Option<Arc<dyn LogSink>>,
    events: Option<Dispatcher>,
}

struct Dispatcher {
    publisher: Arc<dyn EventPublisher>,
    fallback: Mutex<Option<Runtime>>,
}

impl Dispatcher {
    fn new(publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            publisher,
            fallback: Mutex::new(None),
        }
    }

    fn dispatch(&self, event: LifecycleEvent) -> Result<()> {
        if let Ok(ambient) = Handle::try_current() {
            let publisher = Arc::clone(&self.publisher);
            ambient.spawn(async move {
                if let Err(err) = publisher.publish(event).await {
                    eprintln!("stacking: dropped lifecycle event: {err:#}");
                }
            });
            return Ok(());
        }
        let mut fallback = self.fallback.lock();
        let runtime = match fallback.take() {
            Some(runtime) => runtime,
            None => Builder::new_current_thread().enable_all().build()?,
        };
        let outcome = runtime.block_on(self.publisher.publish(event));
        *fallback = Some(runtime);
        outcome
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // a blocking runtime drop panics inside async code
        if let Some(runtime) = self.fallback.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}

impl fmt::Debug for StackingTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackingTelemetry")
            .field("target", &self.shared.target)
            .field("threshold", &self.shared.threshold)
            .field("events", &self.shared.events.is_some())
            .finish_non_exhaustive()
    }
}

impl StackingTelemetry {
    /// Shorthand for [`StackingTelemetryBuilder::new`].
    #[must_use]
    pub fn builder(target: impl Into<String>) -> StackingTelemetryBuilder {
        StackingTelemetryBuilder::new(target)
    }

    /// Whether `level` passes the verbosity threshold.
    #[must_use]
    pub fn enabled(&self, level: LogLevel) -> bool {
        matches!(self.shared.threshold, Some(min) if level >= min)
    }

    /// Writes a record under `key` with the entries of `fields`.
    pub fn log(&self, level: LogLevel, key: &str, fields: Value) -> Result<()> {
        match &self.shared.sink {
            Some(sink) if self.enabled(level) => {
                sink.write(&LogRecord::new(&self.shared.target, level, key).with_fields(fields))
            }
            _ => Ok(()),
        }
    }

    /// Publishes a lifecycle event. Verbosity does not apply.
    pub fn event(&self, kind: &str, payload: Value) -> Result<()> {
        self.shared.events.as_ref().map_or(Ok(()), |events| {
            events.dispatch(LifecycleEvent::new(&self.shared.target, kind, payload))
        })
    }
}
