use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use ts_rs::TS;

#[derive(Debug, Clone, PartialEq, Serialize, TS)]
#[ts(export)]
pub struct ProgressEvent {
    pub operation: String,
    pub phase: String,
    pub progress: f64,
    pub detail: Option<String>,
}

/// Receives progress of long-running executor calls (the host's process
/// manager, a UI channel, or just the log).
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: &ProgressEvent);
}

/// Default sink: writes progress to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn emit(&self, event: &ProgressEvent) {
        tracing::info!(
            operation = %event.operation,
            phase = %event.phase,
            progress = event.progress,
            detail = event.detail.as_deref().unwrap_or(""),
            "progress"
        );
    }
}

/// Keeps every event in memory. Useful for hosts that poll and for tests.
#[derive(Debug, Default)]
pub struct CollectingProgress {
    events: Mutex<Vec<ProgressEvent>>,
}

impl CollectingProgress {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().clone()
    }
}

impl ProgressSink for CollectingProgress {
    fn emit(&self, event: &ProgressEvent) {
        self.events.lock().push(event.clone());
    }
}

pub fn emit_progress(
    sink: &dyn ProgressSink,
    op: &str,
    phase: &str,
    progress: f64,
    detail: Option<&str>,
) {
    let event = ProgressEvent {
        operation: op.to_string(),
        phase: phase.to_string(),
        progress,
        detail: detail.map(ToString::to_string),
    };
    sink.emit(&event);
}
