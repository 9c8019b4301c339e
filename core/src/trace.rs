//! Injected shape tracing.
//!
//! Components receive an `Arc<dyn ShapeTracer>` at construction and report
//! tensor shapes at explicit trace points. Nothing here is global: a model
//! built with [`NoopTracer`] emits nothing regardless of the subscriber.

use std::fmt::Debug;
use std::sync::{Arc, Mutex};

pub trait ShapeTracer: Debug + Send + Sync {
    /// A tensor produced by `stage` has `shape`.
    fn record(&self, stage: &'static str, shape: &[usize]);

    /// Free-form diagnostic attached to `stage`.
    fn note(&self, _stage: &'static str, _message: &str) {}
}

pub fn noop() -> Arc<dyn ShapeTracer> {
    Arc::new(NoopTracer)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl ShapeTracer for NoopTracer {
    fn record(&self, _stage: &'static str, _shape: &[usize]) {}
}

/// Forwards trace points to `tracing` at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTracer;

impl ShapeTracer for TracingTracer {
    fn record(&self, stage: &'static str, shape: &[usize]) {
        tracing::debug!(target: "hegn", stage, ?shape, "tensor");
    }

    fn note(&self, stage: &'static str, message: &str) {
        tracing::debug!(target: "hegn", stage, message);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    Shape {
        stage: &'static str,
        shape: Vec<usize>,
    },
    Note {
        stage: &'static str,
        message: String,
    },
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    events: Mutex<Vec<TraceEvent>>,
}

impl RecordingTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Shapes recorded for `stage`, in order.
    pub fn shapes(&self, stage: &str) -> Vec<Vec<usize>> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                TraceEvent::Shape { stage: s, shape } if s == stage => Some(shape),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: TraceEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl ShapeTracer for RecordingTracer {
    fn record(&self, stage: &'static str, shape: &[usize]) {
        self.push(TraceEvent::Shape {
            stage,
            shape: shape.to_vec(),
        });
    }

    fn note(&self, stage: &'static str, message: &str) {
        self.push(TraceEvent::Note {
            stage,
            message: message.to_string(),
        });
    }
}
