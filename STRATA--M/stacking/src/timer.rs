//! Time budget tracking for a training run.

use std::fmt;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

/// Budget tracker consulted by the orchestrator between pipeline fits.
pub trait Timer: Send + fmt::Debug {
    /// Starts (or restarts) the clock.
    fn start(&mut self);
    /// Remaining budget; `None` when unlimited.
    fn time_left(&self) -> Option<Duration>;
    /// Whether the global budget is spent.
    fn time_limit_exceeded(&self) -> bool;
    /// Whether some child task ran out of its own budget.
    fn child_out_of_time(&self) -> bool;
}

/// Wall-clock timer with an optional global timeout.
#[derive(Debug, Clone)]
pub struct PipelineTimer {
    timeout: Option<Duration>,
    started: Option<Instant>,
    child_exceeded: Arc<AtomicBool>,
}

impl PipelineTimer {
    /// Creates a timer; `None` means unlimited.
    #[must_use]
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            started: None,
            child_exceeded: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Timer that never runs out.
    #[must_use]
    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// Configured timeout.
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Time since `start`, zero before it.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.map_or(Duration::ZERO, |started| started.elapsed())
    }

    /// Creates a child timer whose exhaustion is reported back through
    /// [`Timer::child_out_of_time`].
    #[must_use]
    pub fn task_timer(&self, budget: Option<Duration>) -> TaskTimer {
        TaskTimer {
            budget,
            started: None,
            flag: Arc::clone(&self.child_exceeded),
        }
    }
}

impl Default for PipelineTimer {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl Timer for PipelineTimer {
    fn start(&mut self) {
        self.started = Some(Instant::now());
        self.child_exceeded.store(false, Ordering::SeqCst);
    }

    fn time_left(&self) -> Option<Duration> {
        self.timeout
            .map(|timeout| timeout.saturating_sub(self.elapsed()))
    }

    fn time_limit_exceeded(&self) -> bool {
        match (self.timeout, self.started) {
            (Some(timeout), Some(started)) => started.elapsed() >= timeout,
            _ => false,
        }
    }

    fn child_out_of_time(&self) -> bool {
        self.child_exceeded.load(Ordering::SeqCst)
    }
}

/// Budget for a single task (e.g. one pipeline's fit).
#[derive(Debug, Clone)]
pub struct TaskTimer {
    budget: Option<Duration>,
    started: Option<Instant>,
    flag: Arc<AtomicBool>,
}

impl TaskTimer {
    /// Starts the task clock.
    pub fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    /// Remaining task budget; `None` when unlimited.
    #[must_use]
    pub fn time_left(&self) -> Option<Duration> {
        let elapsed = self.started.map_or(Duration::ZERO, |s| s.elapsed());
        self.budget.map(|budget| budget.saturating_sub(elapsed))
    }

    /// Whether the task budget is spent. A spent budget raises the parent's
    /// child flag.
    pub fn time_limit_exceeded(&self) -> bool {
        let exceeded = match (self.budget, self.started) {
            (Some(budget), Some(started)) => started.elapsed() >= budget,
            (Some(budget), None) => budget.is_zero(),
            _ => false,
        };
        if exceeded {
            self.flag.store(true, Ordering::SeqCst);
        }
        exceeded
    }
}
