#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Lifecycle events for Strata training runs (`stacking.fit.started`,
//! `stacking.level.completed`, `stacking.time_limit`, ...).
//!
//! Producers talk to an [`EventPublisher`]. [`RecordingBus`] fans events out
//! to live listeners and keeps a bounded history. [`JsonLinesPublisher`]
//! appends them to a file.

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{fs, io::AsyncWriteExt, sync::broadcast};
use uuid::Uuid;

/// A single lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// Unique per event.
    pub id: Uuid,
    /// Producer, e.g. `stacking`.
    pub source: String,
    /// Dotted event kind.
    pub kind: String,
    /// When the event was built.
    pub emitted_at: DateTime<Utc>,
    /// Kind-specific body.
    #[serde(default)]
    pub payload: Value,
}

impl LifecycleEvent {
    /// Builds an event with a fresh id, stamped now.
    #[must_use]
    pub fn new(source: impl Into<String>, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            kind: kind.into(),
            emitted_at: Utc::now(),
            payload,
        }
    }
}

/// Accepts lifecycle events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Delivers one event.
    async fn publish(&self, event: LifecycleEvent) -> Result<()>;
}

/// In-process bus: live broadcast plus a bounded history.
#[derive(Debug, Clone)]
pub struct RecordingBus {
    live: broadcast::Sender<LifecycleEvent>,
    history: Arc<Mutex<VecDeque<LifecycleEvent>>>,
    limit: usize,
}

impl RecordingBus {
    /// Keeps at most `limit` events of history (at least one).
    #[must_use]
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            live: broadcast::channel(limit).0,
            history: Arc::new(Mutex::new(VecDeque::with_capacity(limit))),
            limit,
        }
    }

    /// Receiver for events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.live.subscribe()
    }

    /// Retained history, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<LifecycleEvent> {
        self.history.lock().iter().cloned().collect()
    }

    /// Retained events of one kind, oldest first.
    #[must_use]
    pub fn of_kind(&self, kind: &str) -> Vec<LifecycleEvent> {
        self.history
            .lock()
            .iter()
            .filter(|event| event.kind == kind)
            .cloned()
            .collect()
    }

    fn remember(&self, event: LifecycleEvent) {
        let mut history = self.history.lock();
        while history.len() >= self.limit {
            history.pop_front();
        }
        history.push_back(event);
    }
}

#[async_trait]
impl EventPublisher for RecordingBus {
    async fn publish(&self, event: LifecycleEvent) -> Result<()> {
        self.remember(event.clone());
        // send only fails when nobody listens
        let _ = self.live.send(event);
        Ok(())
    }
}

/// Appends events to a JSON-lines file.
#[derive(Debug, Clone)]
pub struct JsonLinesPublisher {
    path: PathBuf,
}

impl JsonLinesPublisher {
    /// Targets `path`, creating missing parent directories now.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating event directory {}", dir.display()))?;
        }
        Ok(Self { path })
    }

    /// File events are appended to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl EventPublisher for JsonLinesPublisher {
    async fn publish(&self, event: LifecycleEvent) -> Result<()> {
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening event log {}", self.path.display()))?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}
