//! Scoped steps reported to whoever drives the run.
//!
//! Leveled logging goes through `tracing`; the engine nests every action in
//! a span under [`RunArgs::span`](crate::exec::RunArgs::span). Steps are a
//! separate, coarser channel: one per executed action, ended with its outcome.

use crate::error::RecoveryError;
use std::sync::Mutex;

pub trait StepHandler: Send + Sync {
    fn start_step(&self, name: &str) -> Box<dyn Step>;
}

pub trait Step: Send {
    fn end(self: Box<Self>, error: Option<&RecoveryError>);
}

// ---------------------------------------------------------------------------
// TracingSteps
// ---------------------------------------------------------------------------

/// Emits step boundaries as `info` events.
pub struct TracingSteps;

struct TracingStep {
    name: String,
    started: std::time::Instant,
}

impl StepHandler for TracingSteps {
    fn start_step(&self, name: &str) -> Box<dyn Step> {
        tracing::info!(step = %name, "step started");
        Box::new(TracingStep {
            name: name.to_string(),
            started: std::time::Instant::now(),
        })
    }
}

impl Step for TracingStep {
    fn end(self: Box<Self>, error: Option<&RecoveryError>) {
        let elapsed = self.started.elapsed();
        match error {
            None => tracing::info!(step = %self.name, ?elapsed, "step passed"),
            Some(e) => tracing::info!(step = %self.name, ?elapsed, error = %e, "step failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// RecordingSteps
// ---------------------------------------------------------------------------

/// Keeps `name(pass)` / `name(fail)` entries in completion order.
#[derive(Default)]
pub struct RecordingSteps {
    entries: std::sync::Arc<Mutex<Vec<String>>>,
}

impl RecordingSteps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

struct RecordingStep {
    name: String,
    entries: std::sync::Arc<Mutex<Vec<String>>>,
}

impl StepHandler for RecordingSteps {
    fn start_step(&self, name: &str) -> Box<dyn Step> {
        Box::new(RecordingStep {
            name: name.to_string(),
            entries: self.entries.clone(),
        })
    }
}

impl Step for RecordingStep {
    fn end(self: Box<Self>, error: Option<&RecoveryError>) {
        let outcome = if error.is_some() { "fail" } else { "pass" };
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(format!("{}({outcome})", self.name));
        }
    }
}
