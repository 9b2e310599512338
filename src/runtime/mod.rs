//! The operation-graph runtime: slot table, work queue, and the pumps
//! that drive operations through their lifecycle.
//!
//! Submission builds the graph synchronously (dependence analysis runs on
//! the submitting thread, in program order per context); everything after
//! that is event-driven. Stage transitions are enqueued as deferred calls
//! and drained either cooperatively ([`Runtime::process_all`]) or by
//! worker threads ([`Runtime::spawn_workers`]).

pub(crate) mod dispatch;
pub(crate) mod lifecycle;
pub(crate) mod queue;
pub(crate) mod table;

pub(crate) use lifecycle::OpInit;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::context::TaskContext;
use crate::event::Event;
use crate::forest::{RegionForest, SimpleForest};
use crate::mapper::{DefaultMapper, Mapper};
use crate::op::OpKind;
use crate::tracing_compat::debug;
use crate::types::{OpKey, RegionRequirement, UniqueOpId};

use queue::{RuntimeCall, WorkQueue};
use table::{OpTable, UniqueIdAllocator};

struct RuntimeInner {
    config: RuntimeConfig,
    table: OpTable,
    queue: WorkQueue,
    ids: UniqueIdAllocator,
    mapper: Arc<dyn Mapper>,
    forest: Arc<dyn RegionForest>,
}

/// Handle to the operation-graph runtime. Cheap to clone; all clones
/// share one slot table and queue.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Creates a runtime with the default mapper and forest.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_collaborators(
            config,
            Arc::new(DefaultMapper::new()),
            Arc::new(SimpleForest::new()),
        )
    }

    /// Creates a runtime with explicit collaborators.
    #[must_use]
    pub fn with_collaborators(
        config: RuntimeConfig,
        mapper: Arc<dyn Mapper>,
        forest: Arc<dyn RegionForest>,
    ) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                config,
                table: OpTable::new(),
                queue: WorkQueue::new(),
                ids: UniqueIdAllocator::new(),
                mapper,
                forest,
            }),
        }
    }

    /// The runtime configuration.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// The mapper collaborator.
    #[must_use]
    pub fn mapper(&self) -> &dyn Mapper {
        self.inner.mapper.as_ref()
    }

    /// The region-forest collaborator.
    #[must_use]
    pub fn forest(&self) -> &Arc<dyn RegionForest> {
        &self.inner.forest
    }

    /// Creates a parent context holding the given region privileges.
    #[must_use]
    pub fn create_context(&self, privileges: Vec<RegionRequirement>) -> TaskContext {
        TaskContext::new(self.clone(), privileges)
    }

    pub(crate) fn table(&self) -> &OpTable {
        &self.inner.table
    }

    pub(crate) fn enqueue(&self, call: RuntimeCall) {
        self.inner.queue.push(call);
    }

    pub(crate) fn next_unique_id(&self, shard_hint: usize) -> UniqueOpId {
        self.inner.ids.next(shard_hint)
    }

    pub(crate) fn enqueue_predicate_notice(&self, waiter: crate::types::OpKey, input: u32, value: bool) {
        self.enqueue(RuntimeCall::NotifyPredicate {
            waiter,
            input,
            value,
        });
    }

    /// Deferred calls currently queued.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.inner.queue.len()
    }

    /// Snapshots the observable state of an operation generation. Returns
    /// `None` once the generation has been recycled.
    #[must_use]
    pub fn probe(&self, key: OpKey) -> Option<OpProbe> {
        let slot = self.inner.table.slot_for(key)?;
        let state = slot.state.lock();
        if state.gen != key.gen() {
            return None;
        }
        Some(OpProbe {
            unique_op_id: state.unique_op_id,
            kind: slot.kind,
            mapped: state.mapped,
            executed: state.executed,
            resolved: state.resolved,
            completed: state.completed,
            committed: state.committed,
            poisoned: state.poisoned,
            incoming: state
                .incoming
                .iter()
                .map(|(s, g)| OpKey::new(*s, *g))
                .collect(),
            outgoing: state
                .outgoing
                .iter()
                .map(|(s, g)| OpKey::new(*s, *g))
                .collect(),
            outstanding_mapping_deps: state.outstanding_mapping_deps,
            outstanding_commit_deps: state.outstanding_commit_deps,
            outstanding_mapping_references: state.outstanding_mapping_references,
            unverified_regions: state.unverified_regions.len(),
            logical_records: state.logical_records.len(),
            completion: state.completion_event.event(),
        })
    }

    /// True once the generation named by `key` has committed (its slot has
    /// moved past it).
    #[must_use]
    pub fn has_committed(&self, key: OpKey) -> bool {
        let Some(slot) = self.inner.table.slot_for(key) else {
            return false;
        };
        let state = slot.state.lock();
        state.gen != key.gen() || state.committed
    }

    /// Drains one deferred call; returns false when the queue was empty.
    pub fn process_one(&self) -> bool {
        let Some(call) = self.inner.queue.pop() else {
            return false;
        };
        self.dispatch_call(call);
        true
    }

    /// Drains the queue to quiescence; returns the number of calls run.
    pub fn process_all(&self) -> usize {
        let mut processed = 0;
        while self.process_one() {
            processed += 1;
        }
        processed
    }

    /// Spawns worker threads that drain the queue until the pool is shut
    /// down. `count` of zero uses the configured default.
    #[must_use]
    pub fn spawn_workers(&self, count: usize) -> WorkerPool {
        let count = if count == 0 {
            self.inner.config.worker_threads
        } else {
            count
        };
        let stop = Arc::new(AtomicBool::new(false));
        let handles = (0..count)
            .map(|worker| {
                let rt = self.clone();
                let stop = Arc::clone(&stop);
                std::thread::Builder::new()
                    .name(format!("opgraph-worker-{worker}"))
                    .spawn(move || {
                        while !stop.load(Ordering::Acquire) {
                            if !rt.process_one() {
                                std::thread::yield_now();
                            }
                        }
                    })
                    .expect("spawn worker thread")
            })
            .collect();
        debug!(count, "workers started");
        WorkerPool { stop, handles }
    }

    fn dispatch_call(&self, call: RuntimeCall) {
        match call {
            RuntimeCall::TriggerMapping(key) => {
                let _ = self.handle_trigger_mapping(key);
            }
            RuntimeCall::ContinueMapping(key) => {
                let _ = self.perform_mapping(key);
            }
            RuntimeCall::TriggerExecution(key) => {
                let _ = self.handle_trigger_execution(key);
            }
            RuntimeCall::DeferredComplete { op, poison } => {
                self.handle_deferred_complete(op, poison);
            }
            RuntimeCall::TriggerCommit(key) => self.handle_trigger_commit(key),
            RuntimeCall::NotifyMapped(key) => self.handle_notify_mapped(key),
            RuntimeCall::NotifySpeculated(key) => self.handle_notify_speculated(key),
            RuntimeCall::NotifyCommit(key) => self.handle_notify_commit(key),
            RuntimeCall::NotifyVerified(key, regions) => {
                self.handle_notify_verified(key, &regions);
            }
            RuntimeCall::NotifyPredicate {
                waiter,
                input,
                value,
            } => self.handle_notify_predicate(waiter, input, value),
            RuntimeCall::PredicateRefsReleased(key) => self.handle_trigger_commit(key),
            RuntimeCall::Quash { op, restart } => self.handle_quash(op, restart),
            RuntimeCall::EpochChildReady(key) => self.handle_epoch_child_ready(key),
            RuntimeCall::EpochTrigger(key) => self.handle_epoch_trigger(key),
            RuntimeCall::EpochSubopComplete(key) => self.handle_epoch_subop_complete(key),
            RuntimeCall::EpochSubopCommit(key) => self.handle_epoch_subop_commit(key),
        }
    }
}

impl core::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "Runtime(slots={}, pending={})",
            self.inner.table.len(),
            self.inner.queue.len()
        )
    }
}

/// Observable lifecycle snapshot of one operation generation.
#[derive(Debug, Clone)]
pub struct OpProbe {
    /// Globally unique id of the generation.
    pub unique_op_id: UniqueOpId,
    /// The operation kind.
    pub kind: OpKind,
    /// Mapping finished.
    pub mapped: bool,
    /// Execution finished.
    pub executed: bool,
    /// Speculation resolved.
    pub resolved: bool,
    /// Completion happened.
    pub completed: bool,
    /// Commit trigger ran (transient: the slot recycles immediately).
    pub committed: bool,
    /// The completion carries the poison marker.
    pub poisoned: bool,
    /// Producer references.
    pub incoming: Vec<OpKey>,
    /// Consumer references.
    pub outgoing: Vec<OpKey>,
    /// Unresolved producers gating mapping.
    pub outstanding_mapping_deps: u32,
    /// Unfinished consumers gating commit.
    pub outstanding_commit_deps: u32,
    /// Holders that may still add edges.
    pub outstanding_mapping_references: u32,
    /// Own requirements not yet verified by a consumer.
    pub unverified_regions: usize,
    /// Dependences recorded during the logical traversal.
    pub logical_records: usize,
    /// The generation's completion event.
    pub completion: Event,
}

/// Worker threads draining the runtime queue.
pub struct WorkerPool {
    stop: Arc<AtomicBool>,
    handles: Vec<std::thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Stops the workers and joins them.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Release);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
