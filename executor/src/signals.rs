use drover_lib::{CancelSignal, TaskAddress};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

/// Live per-task cancellation handles, keyed by task address. Rollback,
/// speculation cancel and `stop` abort through here.
#[derive(Debug, Default)]
pub struct SignalRegistry {
    signals: Mutex<HashMap<TaskAddress, CancelSignal>>,
}

impl SignalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, task_address: TaskAddress, signal: CancelSignal) {
        self.signals.lock().unwrap().insert(task_address, signal);
    }

    pub fn remove(&self, task_address: &TaskAddress) {
        self.signals.lock().unwrap().remove(task_address);
    }

    pub fn get(&self, task_address: &TaskAddress) -> Option<CancelSignal> {
        self.signals.lock().unwrap().get(task_address).cloned()
    }

    /// Abort one task's signal. Returns whether a live handle existed.
    pub fn abort(&self, task_address: &TaskAddress) -> bool {
        let signal = self.signals.lock().unwrap().get(task_address).cloned();
        match signal {
            Some(signal) => {
                signal.abort();
                true
            }
            None => false,
        }
    }

    /// Abort every live handle synchronously. Used by `stop`.
    pub fn abort_all(&self) {
        let snapshot: Vec<CancelSignal> =
            self.signals.lock().unwrap().values().cloned().collect();
        for signal in snapshot {
            signal.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.signals.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.lock().unwrap().is_empty()
    }
}

/// Start instants of in-flight speculative executions. Confirmation
/// takes the elapsed time as saved; rollback takes it as wasted.
#[derive(Debug, Default)]
pub struct SpeculationTimers {
    started: Mutex<HashMap<TaskAddress, Instant>>,
}

impl SpeculationTimers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, task_address: TaskAddress) {
        self.started
            .lock()
            .unwrap()
            .insert(task_address, Instant::now());
    }

    pub fn contains(&self, task_address: &TaskAddress) -> bool {
        self.started.lock().unwrap().contains_key(task_address)
    }

    /// Remove the timer and return the elapsed milliseconds.
    pub fn take_elapsed_ms(&self, task_address: &TaskAddress) -> Option<u64> {
        self.started
            .lock()
            .unwrap()
            .remove(task_address)
            .map(|started| started.elapsed().as_millis() as u64)
    }
}
