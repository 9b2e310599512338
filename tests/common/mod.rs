//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use opgraph::error::Result;
use opgraph::forest::{RegionForest, SimpleForest};
use opgraph::mapper::{
    DefaultMapper, EpochTaskView, Mapper, MappingConstraint, Placement, Speculation,
};
use opgraph::types::{FieldMask, LogicalRegion, PrivilegeMode, RegionRequirement};
use opgraph::{OpKind, Runtime, RuntimeConfig, TaskContext};

/// Installs a test subscriber once; later calls are no-ops.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// A mapper whose speculation answer is programmable; placements delegate
/// to the default mapper.
pub struct SpeculatingMapper {
    inner: DefaultMapper,
    guess: Mutex<Option<bool>>,
    speculate_calls: AtomicUsize,
}

impl SpeculatingMapper {
    pub fn new(guess: Option<bool>) -> Self {
        Self {
            inner: DefaultMapper::new(),
            guess: Mutex::new(guess),
            speculate_calls: AtomicUsize::new(0),
        }
    }

    pub fn speculate_calls(&self) -> usize {
        self.speculate_calls.load(Ordering::SeqCst)
    }
}

impl Mapper for SpeculatingMapper {
    fn map_inline(&self, req: &RegionRequirement) -> Placement {
        self.inner.map_inline(req)
    }

    fn map_copy(&self, srcs: &[RegionRequirement], dsts: &[RegionRequirement]) -> Vec<Placement> {
        self.inner.map_copy(srcs, dsts)
    }

    fn map_task(&self, reqs: &[RegionRequirement]) -> Placement {
        self.inner.map_task(reqs)
    }

    fn map_must_epoch(
        &self,
        tasks: &[EpochTaskView],
        constraints: &[MappingConstraint],
    ) -> Result<Vec<Placement>> {
        self.inner.map_must_epoch(tasks, constraints)
    }

    fn speculate(&self, _kind: OpKind) -> Speculation {
        self.speculate_calls.fetch_add(1, Ordering::SeqCst);
        match *self.guess.lock().unwrap() {
            Some(value) => Speculation::Value(value),
            None => Speculation::Refuse,
        }
    }
}

/// A runtime wired with a concrete forest handle and a programmable
/// mapper, plus a root context.
pub struct Harness {
    pub runtime: Runtime,
    pub forest: Arc<SimpleForest>,
    pub mapper: Arc<SpeculatingMapper>,
    pub ctx: TaskContext,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_guess(None)
    }

    pub fn with_guess(guess: Option<bool>) -> Self {
        init_test_logging();
        let forest = Arc::new(SimpleForest::new());
        let mapper = Arc::new(SpeculatingMapper::new(guess));
        let runtime = Runtime::with_collaborators(
            RuntimeConfig::default(),
            mapper.clone(),
            forest.clone(),
        );
        let ctx = runtime.create_context(Vec::new());
        Self {
            runtime,
            forest,
            mapper,
            ctx,
        }
    }

    /// A fresh region in its own tree.
    pub fn region(&self) -> LogicalRegion {
        self.forest.create_region()
    }

    /// A read-write requirement over field 0.
    pub fn write_req(&self, region: LogicalRegion) -> RegionRequirement {
        RegionRequirement::new(region, FieldMask::single(0), PrivilegeMode::ReadWrite)
    }

    /// A read-only requirement over field 0.
    pub fn read_req(&self, region: LogicalRegion) -> RegionRequirement {
        RegionRequirement::new(region, FieldMask::single(0), PrivilegeMode::ReadOnly)
    }

    /// Drains the pipeline, tears the context down, and drains again.
    pub fn finish(&self) {
        self.runtime.process_all();
        self.ctx.end_context();
        self.runtime.process_all();
    }
}
