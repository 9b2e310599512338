//! The parent-task context: submission surface, program-order dependence
//! analysis, fences, frames, traces, and teardown.
//!
//! Operations are submitted through a context and analyzed inline on the
//! submitting thread, in program order; that makes edge registration
//! deterministic within a context. The context also owns:
//!
//! - the *window* of operations since the last fence (what the next fence
//!   must order against), each holding a mapping reference;
//! - the *current fence*, which every later operation registers on;
//! - frame accounting bounding in-flight work;
//! - traces (capture and replay) keyed by trace id;
//! - the privilege set submissions are checked against.

use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::event::{DynamicCollective, Event, Future, FutureMap, UserEvent};
use crate::forest::LogicalUser;
use crate::launcher::{
    AttachLauncher, CoherenceLauncher, CopyLauncher, FillLauncher, InlineLauncher,
    MustEpochLauncher, PhysicalRegion,
};
use crate::must_epoch::{MustEpochPayload, Slice};
use crate::op::{
    AttachPayload, ClosePayload, CoherencePayload, CollectivePayload, CopyPayload, DeletionKind,
    DeletionPayload, DependentPartitionKind, DependentPartitionPayload, DetachPayload, FenceKind,
    FencePayload, FillPayload, FillSource, FuturePredPayload, MapPayload, OpKind, OpPayload,
    PartitionThunk, PendingPartitionPayload, PredComboPayload, PredInput, TaskPayload,
    TraceCapturePayload, TraceCompletePayload,
};
use crate::predicate::{Predicate, PredicateCell, PredicateWaiter};
use crate::runtime::{OpInit, Runtime};
use crate::trace::Trace;
use crate::tracing_compat::{debug, trace, warn};
use crate::types::{
    CoherenceMode, DomainPoint, FieldMask, IndexPartition, OpKey, PrivilegeMode,
    RegionRequirement, TraceId,
};

struct WindowEntry {
    key: OpKey,
    completion: Event,
}

#[derive(Default)]
struct CtxState {
    window_ops: Vec<WindowEntry>,
    current_fence: Option<OpKey>,
    outstanding: usize,
    traces: HashMap<TraceId, Arc<Trace>>,
    current_trace: Option<Arc<Trace>>,
    replaying: bool,
    frames_outstanding: usize,
    restart_requested: bool,
    last_op: Option<OpKey>,
}

/// Shared interior of a [`TaskContext`]; operations hold weak
/// back-references to it.
pub struct ContextInner {
    runtime: Runtime,
    privileges: Vec<RegionRequirement>,
    state: Mutex<CtxState>,
}

impl ContextInner {
    /// Records a restart request raised by a quash.
    pub(crate) fn request_restart(&self) {
        self.state.lock().restart_requested = true;
    }

    /// Bookkeeping callback at operation commit.
    pub(crate) fn operation_committed(&self, key: OpKey) {
        let mut state = self.state.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
        trace!(?key, outstanding = state.outstanding, "operation left context");
    }

    fn frame_completed(&self) {
        let mut state = self.state.lock();
        state.frames_outstanding = state.frames_outstanding.saturating_sub(1);
    }
}

/// A parent-task view of the operation graph.
#[derive(Clone)]
pub struct TaskContext {
    inner: Arc<ContextInner>,
}

impl TaskContext {
    pub(crate) fn new(runtime: Runtime, privileges: Vec<RegionRequirement>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                runtime,
                privileges,
                state: Mutex::new(CtxState::default()),
            }),
        }
    }

    /// The runtime this context submits into.
    #[must_use]
    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    /// Number of tracked operations submitted and not yet committed.
    #[must_use]
    pub fn outstanding_operations(&self) -> usize {
        self.inner.state.lock().outstanding
    }

    /// The current fence, if one is in effect.
    #[must_use]
    pub fn current_fence(&self) -> Option<OpKey> {
        self.inner.state.lock().current_fence
    }

    /// True if a quash requested a restart of this context.
    #[must_use]
    pub fn restart_requested(&self) -> bool {
        self.inner.state.lock().restart_requested
    }

    /// Key of the most recently submitted operation.
    #[must_use]
    pub fn last_op(&self) -> Option<OpKey> {
        self.inner.state.lock().last_op
    }

    /// Consumes a pending restart request.
    pub fn take_restart_request(&self) -> bool {
        std::mem::take(&mut self.inner.state.lock().restart_requested)
    }

    // ------------------------------------------------------------------
    // Submission checks
    // ------------------------------------------------------------------

    fn check_privileges(&self, reqs: &[&RegionRequirement]) -> Result<()> {
        // A context created without privileges is a root context and may
        // touch anything.
        if self.inner.privileges.is_empty() {
            return Ok(());
        }
        for (idx, req) in reqs.iter().enumerate() {
            let subsumed = self.inner.privileges.iter().any(|p| {
                p.region.tree == req.region.tree
                    && p.privilege.subsumes(req.privilege)
                    && p.fields.dominates(req.fields)
            });
            if !subsumed {
                return Err(Error::privilege_check(
                    idx,
                    format!("parent does not hold {:?} on {:?}", req.privilege, req.region),
                ));
            }
        }
        Ok(())
    }

    fn check_aliased(&self, reqs: &[&RegionRequirement]) -> Result<()> {
        for i in 0..reqs.len() {
            for j in (i + 1)..reqs.len() {
                if reqs[j].dependence_type(reqs[i]).forces_ordering() {
                    return Err(self.report_aliased_requirements(i, j));
                }
            }
        }
        Ok(())
    }

    /// Logs and builds the aliased-requirements error.
    fn report_aliased_requirements(&self, idx1: usize, idx2: usize) -> Error {
        warn!(idx1, idx2, "aliased region requirements");
        Error::aliased_requirements(idx1, idx2)
    }

    // ------------------------------------------------------------------
    // Registration and analysis plumbing
    // ------------------------------------------------------------------

    /// Registers a freshly initialized op in program order: window
    /// membership, the window's mapping reference, outstanding accounting,
    /// and trace capture/replay attachment.
    fn register_operation(&self, key: OpKey, tracked: bool) -> Option<usize> {
        let rt = self.runtime();
        let completion = rt
            .with_state(key, |state| state.completion_event.event())
            .unwrap_or_else(Event::completed);
        let mut state = self.inner.state.lock();
        state.last_op = Some(key);
        if tracked {
            state.outstanding += 1;
            rt.add_mapping_reference(key);
            state.window_ops.push(WindowEntry { key, completion });
        }
        match (&state.current_trace, state.replaying) {
            (Some(tr), false) => {
                rt.set_trace(key, Arc::clone(tr), true);
                tr.record_operation(key);
                None
            }
            (Some(tr), true) => {
                rt.set_trace(key, Arc::clone(tr), false);
                tr.replay_operation(key)
            }
            (None, _) => None,
        }
    }

    /// Registers the current fence on `key` if one is in effect.
    fn register_fence_dependence(&self, key: OpKey) {
        let fence = self.inner.state.lock().current_fence;
        if let Some(fence) = fence {
            let _ = self.runtime().register_dependence(key, fence);
        }
    }

    /// Full phase-B walk for one op.
    fn analyze_requirements(&self, key: OpKey, reqs: &[&RegionRequirement]) {
        self.register_fence_dependence(key);
        for (idx, req) in reqs.iter().enumerate() {
            self.runtime()
                .forest()
                .clone()
                .analyze(self, key, idx as u32, req);
        }
    }

    /// Replays memoized edges; falls back to full analysis when the trace
    /// no longer matches the issued sequence.
    fn replay_dependences(
        &self,
        key: OpKey,
        trace_obj: &Arc<Trace>,
        index: usize,
        reqs: &[&RegionRequirement],
    ) {
        for entry in trace_obj.dependences_for(index) {
            let Some(target) = trace_obj.op_at(entry.producer) else {
                // The captured producer was not re-issued this round:
                // stale replay, re-derive the edges from scratch.
                debug!(?key, index, "trace replay fell back to analysis");
                self.analyze_requirements(key, reqs);
                return;
            };
            let _ = if entry.target_req >= 0 {
                self.runtime().register_region_dependence(
                    key,
                    entry.source_req.max(0) as u32,
                    target,
                    entry.target_req as u32,
                    entry.dtype,
                    entry.validates,
                    FieldMask::EMPTY,
                )
            } else {
                self.runtime().register_dependence(key, target)
            };
        }
        self.register_fence_dependence(key);
    }

    /// The common submission path: initialize is done by the caller; this
    /// runs registration plus phase B and returns the op's completion.
    fn submit(&self, key: OpKey, reqs: &[&RegionRequirement], tracked: bool) -> Event {
        let rt = self.runtime();
        let replay_index = self.register_operation(key, tracked);
        rt.begin_dependence_analysis(key);
        let replay_trace = {
            let state = self.inner.state.lock();
            if state.replaying {
                state.current_trace.clone()
            } else {
                None
            }
        };
        match (replay_index, replay_trace) {
            (Some(index), Some(trace_obj)) => {
                self.replay_dependences(key, &trace_obj, index, reqs);
            }
            _ => self.analyze_requirements(key, reqs),
        }
        rt.end_dependence_analysis(key);
        rt.with_state(key, |state| state.completion_event.event())
            .unwrap_or_else(Event::completed)
    }

    fn predicate_cell(&self, predicate: &Predicate) -> Option<Arc<PredicateCell>> {
        match predicate {
            Predicate::AlwaysTrue => None,
            Predicate::AlwaysFalse => {
                let cell = PredicateCell::new(None);
                let _ = cell.set_resolved(false);
                Some(cell)
            }
            Predicate::Cell(cell) => Some(Arc::clone(cell)),
        }
    }

    // ------------------------------------------------------------------
    // Issue surface
    // ------------------------------------------------------------------

    /// Issues an inline mapping; the returned region becomes valid when
    /// the operation completes.
    pub fn issue_inline_mapping(&self, launcher: InlineLauncher) -> Result<PhysicalRegion> {
        self.check_privileges(&[&launcher.requirement])?;
        let ready = UserEvent::new();
        let region = PhysicalRegion::new(launcher.requirement.region, ready.event());
        let key = self.runtime().initialize_operation(
            OpKind::Map,
            OpPayload::Map(MapPayload {
                requirement: launcher.requirement.clone(),
                region: region.clone(),
                placement: None,
            }),
            OpInit::new(&self.inner).regions(1),
        );
        let completion = self.submit(key, &[&launcher.requirement], true);
        completion.subscribe(move |poison| {
            if poison {
                ready.trigger_poisoned();
            } else {
                ready.trigger();
            }
        });
        Ok(region)
    }

    /// Issues a copy between region pairs.
    pub fn issue_copy(&self, launcher: CopyLauncher) -> Result<Event> {
        if launcher.src_requirements.len() != launcher.dst_requirements.len() {
            return Err(Error::internal("copy launcher with unpaired requirements"));
        }
        let reqs: Vec<&RegionRequirement> = launcher
            .src_requirements
            .iter()
            .chain(launcher.dst_requirements.iter())
            .collect();
        self.check_privileges(&reqs)?;
        self.check_aliased(&reqs)?;
        let cell = self.predicate_cell(&launcher.predicate);
        let num_regions = reqs.len() as u32;
        let key = self.runtime().initialize_operation(
            OpKind::Copy,
            OpPayload::Copy(CopyPayload {
                src_requirements: launcher.src_requirements.clone(),
                dst_requirements: launcher.dst_requirements.clone(),
                placements: Vec::new(),
            }),
            OpInit::new(&self.inner).regions(num_regions).predicated(cell),
        );
        Ok(self.submit(key, &reqs, true))
    }

    /// Issues a fill of the named fields.
    pub fn issue_fill(&self, launcher: FillLauncher) -> Result<Event> {
        let mut requirement = launcher.requirement.clone();
        requirement.privilege = PrivilegeMode::WriteDiscard;
        self.check_privileges(&[&requirement])?;
        let source = match (&launcher.value, &launcher.future) {
            (Some(bytes), None) => FillSource::Bytes(Arc::clone(bytes)),
            (None, Some(future)) => FillSource::Future(future.clone()),
            _ => return Err(Error::internal("fill launcher needs bytes or a future")),
        };
        let cell = self.predicate_cell(&launcher.predicate);
        let key = self.runtime().initialize_operation(
            OpKind::Fill,
            OpPayload::Fill(FillPayload {
                requirement: requirement.clone(),
                source,
            }),
            OpInit::new(&self.inner).regions(1).predicated(cell),
        );
        Ok(self.submit(key, &[&requirement], true))
    }

    /// Issues a user-level coherence acquire.
    pub fn issue_acquire(&self, launcher: CoherenceLauncher) -> Result<Event> {
        self.issue_coherence(OpKind::Acquire, launcher)
    }

    /// Issues a user-level coherence release.
    pub fn issue_release(&self, launcher: CoherenceLauncher) -> Result<Event> {
        self.issue_coherence(OpKind::Release, launcher)
    }

    fn issue_coherence(&self, kind: OpKind, launcher: CoherenceLauncher) -> Result<Event> {
        self.check_privileges(&[&launcher.requirement])?;
        let cell = self.predicate_cell(&launcher.predicate);
        let key = self.runtime().initialize_operation(
            kind,
            OpPayload::Coherence(CoherencePayload {
                requirement: launcher.requirement.clone(),
            }),
            OpInit::new(&self.inner).regions(1).predicated(cell),
        );
        Ok(self.submit(key, &[&launcher.requirement], true))
    }

    /// Issues a fence; later submissions order behind it.
    pub fn issue_fence(&self, kind: FenceKind) -> Event {
        let (window, previous) = self.snapshot_window(kind != FenceKind::Mapping);
        let key = self.runtime().initialize_operation(
            OpKind::Fence,
            OpPayload::Fence(FencePayload { kind, previous }),
            OpInit::new(&self.inner),
        );
        self.issue_fence_like(key, &window)
    }

    /// Issues a frame marker; submission waits while the configured
    /// number of frames is already in flight.
    pub fn issue_frame(&self) -> Event {
        let max_frames = self.runtime().config().max_in_flight_frames;
        loop {
            if self.inner.state.lock().frames_outstanding < max_frames {
                break;
            }
            // Cooperatively drain the pipeline until a frame retires.
            if self.runtime().process_all() == 0 {
                break;
            }
        }
        self.inner.state.lock().frames_outstanding += 1;
        let (window, previous) = self.snapshot_window(true);
        let key = self.runtime().initialize_operation(
            OpKind::Frame,
            OpPayload::Fence(FencePayload {
                kind: FenceKind::Execution,
                previous,
            }),
            OpInit::new(&self.inner),
        );
        let completion = self.issue_fence_like(key, &window);
        let inner = Arc::clone(&self.inner);
        completion.subscribe(move |_| inner.frame_completed());
        completion
    }

    fn snapshot_window(&self, with_completions: bool) -> (Vec<OpKey>, Vec<Event>) {
        let state = self.inner.state.lock();
        let keys = state.window_ops.iter().map(|entry| entry.key).collect();
        let completions = if with_completions {
            state
                .window_ops
                .iter()
                .map(|entry| entry.completion.clone())
                .collect()
        } else {
            Vec::new()
        };
        (keys, completions)
    }

    /// Shared path of fence, frame and trace-complete: register on every
    /// window op, then become the current fence.
    fn issue_fence_like(&self, key: OpKey, window: &[OpKey]) -> Event {
        let rt = self.runtime();
        let completion = rt
            .with_state(key, |state| state.completion_event.event())
            .unwrap_or_else(Event::completed);
        {
            let mut state = self.inner.state.lock();
            state.outstanding += 1;
            state.last_op = Some(key);
            rt.add_mapping_reference(key);
            if let Some(tr) = &state.current_trace {
                if state.replaying {
                    rt.set_trace(key, Arc::clone(tr), false);
                    let _ = tr.replay_operation(key);
                } else {
                    rt.set_trace(key, Arc::clone(tr), true);
                    tr.record_operation(key);
                }
            }
        }
        rt.begin_dependence_analysis(key);
        for target in window {
            let _ = rt.register_dependence(key, *target);
        }
        self.advance_fence(key, completion.clone());
        rt.end_dependence_analysis(key);
        completion
    }

    /// Installs `key` as the context's current fence, pruning the window
    /// and releasing its mapping references.
    fn advance_fence(&self, key: OpKey, completion: Event) {
        let released: Vec<OpKey> = {
            let mut state = self.inner.state.lock();
            let released = state.window_ops.drain(..).map(|entry| entry.key).collect();
            state.window_ops.push(WindowEntry { key, completion });
            state.current_fence = Some(key);
            released
        };
        for op in released {
            self.runtime().remove_mapping_reference(op);
        }
        debug!(?key, "fence advanced");
    }

    /// Issues a deferred deletion; the resource disappears when the
    /// operation commits.
    pub fn issue_deletion(&self, kind: DeletionKind) -> Event {
        let key = self.runtime().initialize_operation(
            OpKind::Deletion,
            OpPayload::Deletion(DeletionPayload { kind: kind.clone() }),
            OpInit::new(&self.inner),
        );
        let rt = self.runtime();
        let replay = self.register_operation(key, true);
        rt.begin_dependence_analysis(key);
        let _ = replay;
        self.register_fence_dependence(key);
        rt.forest().clone().analyze_deletion(self, key, &kind);
        rt.end_dependence_analysis(key);
        rt.with_state(key, |state| state.completion_event.event())
            .unwrap_or_else(Event::completed)
    }

    /// Issues an attach of an external file; the requirement is forced to
    /// exclusive coherence so no consumer observes the instance before the
    /// attach completes.
    pub fn issue_attach(&self, launcher: AttachLauncher) -> Result<PhysicalRegion> {
        let mut requirement = launcher.requirement.clone();
        requirement.coherence = CoherenceMode::Exclusive;
        self.check_privileges(&[&requirement])?;
        let ready = UserEvent::new();
        let region = PhysicalRegion::new(requirement.region, ready.event());
        let key = self.runtime().initialize_operation(
            OpKind::Attach,
            OpPayload::Attach(AttachPayload {
                requirement: requirement.clone(),
                file_name: launcher.file_name,
                field_map: launcher.field_map,
                mode: launcher.mode,
                region: region.clone(),
            }),
            OpInit::new(&self.inner).regions(1),
        );
        let completion = self.submit(key, &[&requirement], true);
        completion.subscribe(move |poison| {
            if poison {
                ready.trigger_poisoned();
            } else {
                ready.trigger();
            }
        });
        Ok(region)
    }

    /// Issues a detach of a previously attached region; it runs only after
    /// every consumer of the attached data has completed.
    pub fn issue_detach(&self, region: &PhysicalRegion, fields: FieldMask) -> Result<Event> {
        let requirement = RegionRequirement::new(region.region(), fields, PrivilegeMode::ReadWrite);
        self.check_privileges(&[&requirement])?;
        let key = self.runtime().initialize_operation(
            OpKind::Detach,
            OpPayload::Detach(DetachPayload {
                requirement: requirement.clone(),
                region: region.clone(),
            }),
            OpInit::new(&self.inner).regions(1),
        );
        Ok(self.submit(key, &[&requirement], true))
    }

    /// Issues a deferred partition computation; the returned event fires
    /// when the computed handle is usable (poisoned on failure).
    pub fn issue_pending_partition(&self, thunk: PartitionThunk) -> Event {
        let handle_ready = UserEvent::new();
        let ready = handle_ready.event();
        let key = self.runtime().initialize_operation(
            OpKind::PendingPartition,
            OpPayload::PendingPartition(PendingPartitionPayload {
                thunk,
                handle_ready,
            }),
            OpInit::new(&self.inner),
        );
        let _ = self.submit(key, &[], true);
        ready
    }

    /// Issues a data-dependent partition computation.
    pub fn issue_dependent_partition(
        &self,
        kind: DependentPartitionKind,
        requirement: RegionRequirement,
        partition: IndexPartition,
        projection: Option<IndexPartition>,
    ) -> Result<Event> {
        self.check_privileges(&[&requirement])?;
        let handle_ready = UserEvent::new();
        let ready = handle_ready.event();
        let key = self.runtime().initialize_operation(
            OpKind::DependentPartition,
            OpPayload::DependentPartition(DependentPartitionPayload {
                kind,
                requirement: requirement.clone(),
                partition,
                projection,
                handle_ready,
            }),
            OpInit::new(&self.inner).regions(1),
        );
        let _ = self.submit(key, &[&requirement], true);
        Ok(ready)
    }

    /// Reads a dynamic collective's value into a future.
    pub fn issue_dynamic_collective(&self, collective: DynamicCollective) -> Future {
        let future = Future::new();
        let key = self.runtime().initialize_operation(
            OpKind::DynamicCollective,
            OpPayload::Collective(CollectivePayload {
                collective,
                future: future.clone(),
            }),
            OpInit::new(&self.inner),
        );
        let _ = self.submit(key, &[], true);
        future
    }

    // ------------------------------------------------------------------
    // Predicates
    // ------------------------------------------------------------------

    /// Creates a predicate from a future's boolean payload.
    pub fn create_predicate(&self, future: Future) -> Predicate {
        let key = self.runtime().initialize_operation(
            OpKind::FuturePred,
            OpPayload::Inactive,
            OpInit::new(&self.inner).untracked(),
        );
        let cell = PredicateCell::new(Some(key));
        self.runtime().with_state(key, |state| {
            state.payload = OpPayload::FuturePred(FuturePredPayload {
                future: future.clone(),
                cell: Arc::clone(&cell),
            });
        });
        let rt = self.runtime();
        rt.begin_dependence_analysis(key);
        rt.end_dependence_analysis(key);
        Predicate::Cell(cell)
    }

    /// Negates a predicate.
    pub fn predicate_not(&self, p: &Predicate) -> Predicate {
        match p {
            Predicate::AlwaysTrue => Predicate::AlwaysFalse,
            Predicate::AlwaysFalse => Predicate::AlwaysTrue,
            Predicate::Cell(cell) => {
                self.issue_combinator(OpKind::NotPred, &[Arc::clone(cell)])
            }
        }
    }

    /// Conjunction of two predicates; short-circuits on a false input.
    pub fn predicate_and(&self, p1: &Predicate, p2: &Predicate) -> Predicate {
        match (p1, p2) {
            (Predicate::AlwaysFalse, _) | (_, Predicate::AlwaysFalse) => Predicate::AlwaysFalse,
            (Predicate::AlwaysTrue, other) | (other, Predicate::AlwaysTrue) => other.clone(),
            (Predicate::Cell(c1), Predicate::Cell(c2)) => {
                self.issue_combinator(OpKind::AndPred, &[Arc::clone(c1), Arc::clone(c2)])
            }
        }
    }

    /// Disjunction of two predicates; short-circuits on a true input.
    pub fn predicate_or(&self, p1: &Predicate, p2: &Predicate) -> Predicate {
        match (p1, p2) {
            (Predicate::AlwaysTrue, _) | (_, Predicate::AlwaysTrue) => Predicate::AlwaysTrue,
            (Predicate::AlwaysFalse, other) | (other, Predicate::AlwaysFalse) => other.clone(),
            (Predicate::Cell(c1), Predicate::Cell(c2)) => {
                self.issue_combinator(OpKind::OrPred, &[Arc::clone(c1), Arc::clone(c2)])
            }
        }
    }

    /// Builds a combinator op over dynamic inputs: it waits on each input
    /// cell, registers a graph edge on each input's owning op, and owns
    /// the output cell.
    fn issue_combinator(&self, kind: OpKind, inputs: &[Arc<PredicateCell>]) -> Predicate {
        let rt = self.runtime();
        let key = rt.initialize_operation(
            kind,
            OpPayload::Inactive,
            OpInit::new(&self.inner).untracked(),
        );
        let cell = PredicateCell::new(Some(key));
        let payload_inputs: SmallVec<[PredInput; 2]> = inputs
            .iter()
            .map(|input| {
                input.add_reference();
                PredInput {
                    cell: Arc::clone(input),
                    value: None,
                }
            })
            .collect();
        rt.with_state(key, |state| {
            state.payload = OpPayload::PredCombo(PredComboPayload {
                cell: Arc::clone(&cell),
                inputs: payload_inputs,
            });
        });
        rt.begin_dependence_analysis(key);
        for (index, input) in inputs.iter().enumerate() {
            if let Some(owner) = input.owner() {
                let _ = rt.register_dependence(key, owner);
            }
            match input.register_waiter(PredicateWaiter {
                op: key,
                input: index as u32,
            }) {
                Some(value) => rt.enqueue_predicate_notice(key, index as u32, value),
                None => {}
            }
        }
        rt.end_dependence_analysis(key);
        Predicate::Cell(cell)
    }

    // ------------------------------------------------------------------
    // Traces
    // ------------------------------------------------------------------

    /// Begins capturing (first use of `tid`) or replaying (later uses) a
    /// trace.
    pub fn begin_trace(&self, tid: TraceId) {
        let mut state = self.inner.state.lock();
        debug_assert!(state.current_trace.is_none(), "nested traces");
        match state.traces.get(&tid) {
            Some(existing) => {
                debug_assert!(existing.is_fixed(), "re-entering an unfixed trace");
                existing.start_replay_round();
                state.current_trace = Some(Arc::clone(existing));
                state.replaying = true;
            }
            None => {
                let fresh = Arc::new(Trace::new(tid));
                state.traces.insert(tid, Arc::clone(&fresh));
                state.current_trace = Some(fresh);
                state.replaying = false;
            }
        }
        debug!(?tid, replay = state.replaying, "trace begun");
    }

    /// Ends the current trace: a capture round issues the capture sentinel
    /// and fixes the trace; a replay round issues the trace-complete
    /// fence.
    pub fn end_trace(&self, tid: TraceId) {
        let (trace_obj, replaying) = {
            let mut state = self.inner.state.lock();
            let trace_obj = state
                .current_trace
                .take()
                .expect("end_trace without begin_trace");
            debug_assert_eq!(trace_obj.tid(), tid);
            let replaying = state.replaying;
            state.replaying = false;
            (trace_obj, replaying)
        };
        if replaying {
            self.issue_trace_complete(&trace_obj);
        } else {
            self.issue_trace_capture(&trace_obj);
        }
    }

    /// The sentinel ending a capture: freezes the trace's dependence sets.
    fn issue_trace_capture(&self, trace_obj: &Arc<Trace>) {
        let rt = self.runtime();
        let key = rt.initialize_operation(
            OpKind::TraceCapture,
            OpPayload::TraceCapture(TraceCapturePayload {
                trace: Arc::clone(trace_obj),
            }),
            OpInit::new(&self.inner),
        );
        self.register_operation(key, true);
        rt.begin_dependence_analysis(key);
        trace_obj.fix();
        self.register_fence_dependence(key);
        rt.end_dependence_analysis(key);
    }

    /// The fence ending a replay round: orders against every trace member
    /// and becomes the current fence.
    fn issue_trace_complete(&self, trace_obj: &Arc<Trace>) {
        let rt = self.runtime();
        let members = trace_obj.current_operations();
        let previous: Vec<Event> = members
            .iter()
            .filter_map(|member| {
                rt.with_state(*member, |state| state.completion_event.event())
            })
            .collect();
        let key = rt.initialize_operation(
            OpKind::TraceComplete,
            OpPayload::TraceComplete(TraceCompletePayload {
                trace: Arc::clone(trace_obj),
                previous,
            }),
            OpInit::new(&self.inner),
        );
        let completion = rt
            .with_state(key, |state| state.completion_event.event())
            .unwrap_or_else(Event::completed);
        {
            let mut state = self.inner.state.lock();
            state.outstanding += 1;
            state.last_op = Some(key);
            rt.add_mapping_reference(key);
        }
        rt.begin_dependence_analysis(key);
        for member in &members {
            let _ = rt.register_dependence(key, *member);
        }
        self.advance_fence(key, completion);
        rt.end_dependence_analysis(key);
    }

    // ------------------------------------------------------------------
    // Must-epochs
    // ------------------------------------------------------------------

    /// Issues a must-parallel epoch; the future map resolves per point,
    /// with error payloads if the epoch is unschedulable.
    pub fn issue_must_epoch(&self, launcher: MustEpochLauncher) -> Result<FutureMap> {
        let rt = self.runtime();
        // Expand leaves: individual tasks, then index points.
        struct Leaf {
            requirements: SmallVec<[RegionRequirement; 2]>,
            point: DomainPoint,
        }
        let mut leaves = Vec::new();
        for task in &launcher.single_tasks {
            leaves.push(Leaf {
                requirements: task.requirements.clone(),
                point: task.point,
            });
        }
        let mut slices = Vec::new();
        for (index, _) in launcher.single_tasks.iter().enumerate() {
            slices.push(Slice {
                leaves: vec![index as u32],
            });
        }
        for index_task in &launcher.index_tasks {
            let mut slice = Slice { leaves: Vec::new() };
            for point in index_task.domain.points() {
                slice.leaves.push(leaves.len() as u32);
                leaves.push(Leaf {
                    requirements: index_task.requirements.clone(),
                    point,
                });
            }
            slices.push(slice);
        }
        if leaves.is_empty() {
            return Err(Error::must_epoch_infeasible("epoch with no tasks"));
        }
        // Distinct launch points keep the future map one-to-one.
        let mut used = std::collections::BTreeSet::new();
        for (index, leaf) in leaves.iter_mut().enumerate() {
            if !used.insert(leaf.point) {
                leaf.point = DomainPoint::one_dim(i64::try_from(index).unwrap_or(i64::MAX));
                used.insert(leaf.point);
            }
        }
        for leaf in &leaves {
            let reqs: Vec<&RegionRequirement> = leaf.requirements.iter().collect();
            self.check_privileges(&reqs)?;
            self.check_aliased(&reqs)?;
        }

        // The epoch op itself.
        let epoch = rt.initialize_operation(
            OpKind::MustEpoch,
            OpPayload::Inactive,
            OpInit::new(&self.inner),
        );
        let completion = rt
            .with_state(epoch, |state| state.completion_event.event())
            .unwrap_or_else(Event::completed);
        let result_map = FutureMap::new(completion);

        // Children, linked to the epoch by index.
        let mut child_keys = Vec::with_capacity(leaves.len());
        let mut points = Vec::with_capacity(leaves.len());
        for (index, leaf) in leaves.iter().enumerate() {
            let child = rt.initialize_operation(
                OpKind::Task,
                OpPayload::Task(TaskPayload {
                    requirements: leaf.requirements.clone(),
                    point: leaf.point,
                    future: result_map.get_future(leaf.point),
                    placement: None,
                }),
                OpInit::new(&self.inner)
                    .regions(leaf.requirements.len() as u32)
                    .in_epoch(epoch, index as u32),
            );
            child_keys.push(child);
            points.push(leaf.point);
        }
        let child_count = child_keys.len() as u32;
        rt.with_state(epoch, |state| {
            state.payload = OpPayload::MustEpoch(Box::new(MustEpochPayload::new(
                child_keys.clone(),
                points,
                slices,
                result_map.clone(),
            )));
            // Children gate the epoch's commit; one artificial commit
            // dependence per child, drained as they commit.
            state.outstanding_commit_deps += child_count;
        });

        // Phase B: the epoch registers in program order, then each child
        // analyzes its requirements; sibling edges land on the epoch.
        self.register_operation(epoch, true);
        rt.begin_dependence_analysis(epoch);
        self.register_fence_dependence(epoch);
        for (index, leaf) in leaves.iter().enumerate() {
            let child = child_keys[index];
            self.register_operation(child, true);
            rt.begin_dependence_analysis(child);
            self.register_fence_dependence(child);
            for (req_index, req) in leaf.requirements.iter().enumerate() {
                rt.forest().clone().analyze(self, child, req_index as u32, req);
            }
            rt.end_dependence_analysis(child);
        }
        rt.end_dependence_analysis(epoch);

        // The child-child record set is complete; an ordering dependence
        // among members makes the epoch unschedulable.
        rt.check_epoch_feasibility(epoch);
        Ok(result_map)
    }

    // ------------------------------------------------------------------
    // Close operations (runtime-internal)
    // ------------------------------------------------------------------

    /// Issues an inter-close on behalf of `create_op`, registering
    /// dependences on the closed users. `create_op` itself is excluded to
    /// avoid a self-dependence. Returns the close op's key.
    pub fn issue_inter_close(
        &self,
        requirement: RegionRequirement,
        create_op: OpKey,
        victims: &[LogicalUser],
    ) -> Option<OpKey> {
        let rt = self.runtime();
        let key = rt.initialize_operation(
            OpKind::InterClose,
            OpPayload::Close(ClosePayload {
                requirement: requirement.clone(),
                create_op: Some(create_op),
            }),
            OpInit::new(&self.inner).untracked().regions(1),
        );
        // The close becomes a logical user; its reference is installed
        // before analysis ends so it cannot commit out from under the
        // forest.
        rt.add_mapping_reference(key);
        rt.begin_dependence_analysis(key);
        for victim in victims {
            if victim.op == create_op {
                continue;
            }
            let dtype = requirement.dependence_type(&victim.requirement);
            if dtype == crate::types::DependenceType::None {
                continue;
            }
            let _ = rt.register_region_dependence(
                key,
                0,
                victim.op,
                victim.req_index,
                dtype,
                false,
                requirement.fields & victim.requirement.fields,
            );
        }
        rt.end_dependence_analysis(key);
        debug!(?key, ?create_op, "inter-close issued");
        Some(key)
    }

    /// Tears the context down: every region tree with live users gets a
    /// post-close ordering after them, window references are released, and
    /// the fence is cleared. The caller pumps the runtime afterwards.
    pub fn end_context(&self) {
        let rt = self.runtime();
        for (_tree, users) in rt.forest().take_tree_users() {
            let Some(first) = users.first() else {
                continue;
            };
            let fields = users
                .iter()
                .fold(FieldMask::EMPTY, |mask, user| mask | user.requirement.fields);
            let requirement = RegionRequirement::new(
                first.requirement.region,
                fields,
                PrivilegeMode::ReadWrite,
            );
            let key = rt.initialize_operation(
                OpKind::PostClose,
                OpPayload::Close(ClosePayload {
                    requirement: requirement.clone(),
                    create_op: None,
                }),
                OpInit::new(&self.inner).untracked().regions(1),
            );
            rt.begin_dependence_analysis(key);
            for user in &users {
                let dtype = requirement.dependence_type(&user.requirement);
                if dtype == crate::types::DependenceType::None {
                    continue;
                }
                let _ = rt.register_region_dependence(
                    key,
                    0,
                    user.op,
                    user.req_index,
                    dtype,
                    false,
                    requirement.fields & user.requirement.fields,
                );
            }
            rt.end_dependence_analysis(key);
            for user in &users {
                rt.remove_mapping_reference(user.op);
            }
        }
        let released: Vec<OpKey> = {
            let mut state = self.inner.state.lock();
            state.current_fence = None;
            state.window_ops.drain(..).map(|entry| entry.key).collect()
        };
        for op in released {
            rt.remove_mapping_reference(op);
        }
        debug!("context ended");
    }
}

impl core::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.inner.state.lock();
        write!(
            f,
            "TaskContext(outstanding={}, window={}, fence={:?})",
            state.outstanding,
            state.window_ops.len(),
            state.current_fence
        )
    }
}
