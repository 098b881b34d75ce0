//! Bounded permits around backends that cannot take unlimited callers.

use std::sync::{Condvar, Mutex};

use super::{RecognitionBackend, RecognitionError, RecognitionOutput};
use crate::pipeline::collaborators::PageImage;

/// Counting permit pool. `None` capacity never blocks.
pub struct PermitGate {
    capacity: Option<usize>,
    in_use: Mutex<usize>,
    released: Condvar,
}

impl PermitGate {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            capacity: capacity.map(|c| c.max(1)),
            in_use: Mutex::new(0),
            released: Condvar::new(),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None)
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Block until a permit is free. Dropping the permit returns it.
    pub fn acquire(&self) -> Permit<'_> {
        // A poisoned count is still a valid count; keep going with it.
        let mut in_use = self.in_use.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(capacity) = self.capacity {
            while *in_use >= capacity {
                in_use = self
                    .released
                    .wait(in_use)
                    .unwrap_or_else(|p| p.into_inner());
            }
        }
        *in_use += 1;
        Permit { gate: self }
    }

    pub fn in_use(&self) -> usize {
        *self.in_use.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// RAII permit from a [`PermitGate`].
pub struct Permit<'a> {
    gate: &'a PermitGate,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let mut in_use = self.gate.in_use.lock().unwrap_or_else(|p| p.into_inner());
        *in_use = in_use.saturating_sub(1);
        self.gate.released.notify_one();
    }
}

/// A backend whose calls pass through its own permit gate.
pub struct GatedBackend {
    backend: Box<dyn RecognitionBackend>,
    gate: PermitGate,
}

impl GatedBackend {
    pub fn new(backend: Box<dyn RecognitionBackend>, max_concurrency: Option<usize>) -> Self {
        Self {
            backend,
            gate: PermitGate::new(max_concurrency),
        }
    }

    pub fn name(&self) -> &str {
        self.backend.name()
    }

    pub fn run(&self, page: &PageImage) -> Result<RecognitionOutput, RecognitionError> {
        let _permit = self.gate.acquire();
        self.backend.run(page)
    }
}
