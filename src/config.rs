//! Runtime configuration.

/// Tunables of the operation-graph runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Worker threads started by [`crate::runtime::Runtime::spawn_workers`]
    /// when the caller does not pass a count.
    pub worker_threads: usize,
    /// Frames a context may keep in flight before submission waits.
    pub max_in_flight_frames: usize,
    /// Whether predicated operations may map before their predicate
    /// resolves. When disabled the mapper is never asked to speculate.
    pub allow_speculation: bool,
}

impl RuntimeConfig {
    /// Configuration with conservative defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            worker_threads: 2,
            max_in_flight_frames: 4,
            allow_speculation: true,
        }
    }

    /// Sets the default worker-thread count.
    #[must_use]
    pub fn with_worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = count.max(1);
        self
    }

    /// Sets the frame window.
    #[must_use]
    pub fn with_max_in_flight_frames(mut self, frames: usize) -> Self {
        self.max_in_flight_frames = frames.max(1);
        self
    }

    /// Enables or disables speculation.
    #[must_use]
    pub fn with_speculation(mut self, allow: bool) -> Self {
        self.allow_speculation = allow;
        self
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}
