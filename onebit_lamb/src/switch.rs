use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// The training loop's switch for its own uncompressed gradient all-reduce.
///
/// The optimizer turns it off when compression starts and back on when a warm-up
/// checkpoint is loaded. Clones share the same switch.
#[derive(Debug, Clone)]
pub struct BackwardAllreduce(Arc<AtomicBool>);

impl BackwardAllreduce {
    /// Creates a new, enabled `BackwardAllreduce`.
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    /// Returns whether the training loop should all-reduce raw gradients.
    pub fn enabled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.0.store(enabled, Ordering::Release);
    }
}

impl Default for BackwardAllreduce {
    fn default() -> Self {
        Self::new()
    }
}
