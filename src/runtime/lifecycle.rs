//! The generic operation lifecycle engine: phases A–F.
//!
//! Everything here is kind-agnostic; per-kind behavior lives in the
//! dispatch tables (`runtime::dispatch`). The rules enforced:
//!
//! - every stage trigger runs at most once per generation;
//! - edge insertion takes both endpoints' locks in ascending
//!   `unique_op_id` order;
//! - no cross-op notification runs under a held lock — all of them go
//!   through the work queue;
//! - commit bumps the slot generation and recycles the slot, making every
//!   outstanding reference to the generation stale.

use smallvec::SmallVec;
use std::sync::Arc;

use crate::context::ContextInner;
use crate::event::UserEvent;
use crate::op::{
    LogicalRecord, MustEpochLink, OpKind, OpPayload, OpState, RegistrationOutcome, SpecInfo,
    SpecState,
};
use crate::predicate::{PredicateCell, PredicateWaiter};
use crate::runtime::queue::RuntimeCall;
use crate::runtime::Runtime;
use crate::tracing_compat::{debug, trace, warn};
use crate::types::{DependenceType, FieldMask, OpKey};

/// Arguments of operation initialization (phase A).
pub(crate) struct OpInit {
    /// The parent context.
    pub parent: Arc<ContextInner>,
    /// Whether the parent tracks this op.
    pub track: bool,
    /// Children-mapped event the op provides, if it tracks children.
    pub children_mapped: Option<UserEvent>,
    /// Number of region requirements (sizes `unverified_regions`).
    pub num_regions: u32,
    /// Predicate for speculative ops.
    pub predicate: Option<Arc<PredicateCell>>,
    /// Must-epoch membership.
    pub must_epoch: Option<(OpKey, u32)>,
}

impl OpInit {
    pub fn new(parent: &Arc<ContextInner>) -> Self {
        Self {
            parent: Arc::clone(parent),
            track: true,
            children_mapped: None,
            num_regions: 0,
            predicate: None,
            must_epoch: None,
        }
    }

    pub fn regions(mut self, num: u32) -> Self {
        self.num_regions = num;
        self
    }

    pub fn predicated(mut self, cell: Option<Arc<PredicateCell>>) -> Self {
        self.predicate = cell;
        self
    }

    pub fn in_epoch(mut self, epoch: OpKey, index: u32) -> Self {
        self.must_epoch = Some((epoch, index));
        self
    }

    pub fn untracked(mut self) -> Self {
        self.track = false;
        self
    }
}

struct RegionEdgeInfo {
    source_req: u32,
    target_req: u32,
    dtype: DependenceType,
    validates: bool,
    mask: FieldMask,
}

impl Runtime {
    /// Phase A: checks a slot out of the freelist and initializes the new
    /// generation.
    pub(crate) fn initialize_operation(
        &self,
        kind: OpKind,
        payload: OpPayload,
        init: OpInit,
    ) -> OpKey {
        let slot = self.table().checkout(kind);
        let uid = self.next_unique_id(slot.slot as usize);
        let key;
        {
            let mut state = slot.state.lock();
            debug_assert!(
                matches!(state.payload, OpPayload::Inactive),
                "checkout of an active slot"
            );
            state.unique_op_id = uid;
            state.parent = Arc::downgrade(&init.parent);
            state.track_parent = init.track;
            state.children_mapped = init.children_mapped;
            state.need_completion_trigger = true;
            state.unverified_regions = (0..init.num_regions).collect();
            state.payload = payload;
            if let Some((epoch, index)) = init.must_epoch {
                state.must_epoch = Some(MustEpochLink { epoch, index });
            }
            if let Some(cell) = &init.predicate {
                cell.add_reference();
                state.speculation = Some(SpecInfo {
                    state: SpecState::PendingMap,
                    predicate: Arc::clone(cell),
                });
            }
            key = OpKey::new(slot.slot, state.gen);
        }
        slot.unique_id
            .store(uid, std::sync::atomic::Ordering::Release);
        // Waiter registration happens outside the op lock; if the cell is
        // already resolved the mapping trigger reads the value itself.
        if let Some(cell) = &init.predicate {
            let _ = cell.register_waiter(PredicateWaiter { op: key, input: 0 });
        }
        trace!(?key, kind = kind.name(), uid, "operation initialized");
        key
    }

    /// Attaches a trace to an op before its dependence analysis.
    pub(crate) fn set_trace(&self, key: OpKey, trace: Arc<crate::trace::Trace>, capturing: bool) {
        self.with_state(key, |state| {
            state.trace = Some(trace);
            state.tracing = capturing;
        });
    }

    /// Runs `f` on the op's state if the generation still matches.
    pub(crate) fn with_state<R>(&self, key: OpKey, f: impl FnOnce(&mut OpState) -> R) -> Option<R> {
        let slot = self.table().slot_for(key)?;
        let mut state = slot.state.lock();
        if state.gen != key.gen() {
            return None;
        }
        Some(f(&mut state))
    }

    /// Phase B entry: adds the analysis placeholder so the op cannot map
    /// before its analysis finishes.
    pub(crate) fn begin_dependence_analysis(&self, key: OpKey) {
        self.with_state(key, |state| {
            debug_assert!(!state.analysis_begun, "dependence analysis entered twice");
            state.analysis_begun = true;
            state.outstanding_mapping_deps += 1;
        });
    }

    /// Phase B exit: drops the placeholder and enqueues the op on the
    /// ready queue if every dependence is already satisfied.
    pub(crate) fn end_dependence_analysis(&self, key: OpKey) {
        let enqueue = self.with_state(key, |state| {
            debug_assert!(state.analysis_begun);
            debug_assert!(state.outstanding_mapping_deps > 0);
            state.outstanding_mapping_deps -= 1;
            if state.mapping_ready() && !state.mapping_enqueued {
                state.mapping_enqueued = true;
                true
            } else {
                false
            }
        });
        if enqueue == Some(true) {
            self.enqueue(RuntimeCall::TriggerMapping(key));
        }
    }

    /// Registers a plain dependence of `source` on `target`.
    pub fn register_dependence(&self, source: OpKey, target: OpKey) -> RegistrationOutcome {
        self.register_internal(source, target, None)
    }

    /// Registers a region dependence of `source` requirement `idx` on
    /// `target` requirement `target_idx`.
    #[allow(clippy::too_many_arguments)]
    pub fn register_region_dependence(
        &self,
        source: OpKey,
        idx: u32,
        target: OpKey,
        target_idx: u32,
        dtype: DependenceType,
        validates: bool,
        mask: FieldMask,
    ) -> RegistrationOutcome {
        self.register_internal(
            source,
            target,
            Some(RegionEdgeInfo {
                source_req: idx,
                target_req: target_idx,
                dtype,
                validates,
                mask,
            }),
        )
    }

    fn register_internal(
        &self,
        source: OpKey,
        target: OpKey,
        region: Option<RegionEdgeInfo>,
    ) -> RegistrationOutcome {
        // Self-dependences are pruned: a slot never waits on itself.
        if source.slot() == target.slot() {
            return RegistrationOutcome::Stale;
        }
        let (Some(source_slot), Some(target_slot)) = (
            self.table().slot_for(source),
            self.table().slot_for(target),
        ) else {
            return RegistrationOutcome::Stale;
        };

        // Must-epoch interposition: sibling edges are recorded on the
        // epoch instead of the graph so the siblings stay mutually
        // schedulable. Membership is fixed at initialize, so short
        // independent reads are race-free.
        let source_epoch = {
            let state = source_slot.state.lock();
            if state.gen != source.gen() {
                return RegistrationOutcome::Stale;
            }
            state.must_epoch
        };
        let target_epoch = {
            let state = target_slot.state.lock();
            if state.gen != target.gen() {
                return RegistrationOutcome::Stale;
            }
            if state.committed {
                return RegistrationOutcome::AlreadyCommitted;
            }
            state.must_epoch
        };
        if let (Some(src_link), Some(tgt_link)) = (source_epoch, target_epoch) {
            if src_link.epoch == tgt_link.epoch {
                if let Some(info) = &region {
                    self.record_epoch_dependence(
                        src_link.epoch,
                        src_link.index,
                        tgt_link.index,
                        info.source_req,
                        info.target_req,
                        info.dtype,
                    );
                }
                return RegistrationOutcome::EpochInterposed;
            }
        }

        // Two-lock edge insertion, ordered by unique op id.
        let source_uid = source_slot.current_unique_id();
        let target_uid = target_slot.current_unique_id();
        let source_first = source_uid < target_uid;
        let (mut first_guard, mut second_guard) = if source_first {
            (source_slot.state.lock(), target_slot.state.lock())
        } else {
            (target_slot.state.lock(), source_slot.state.lock())
        };
        let (src_state, tgt_state): (&mut OpState, &mut OpState) = if source_first {
            (&mut *first_guard, &mut *second_guard)
        } else {
            (&mut *second_guard, &mut *first_guard)
        };

        if tgt_state.gen != target.gen() {
            return RegistrationOutcome::Stale;
        }
        if tgt_state.committed {
            return RegistrationOutcome::AlreadyCommitted;
        }
        if src_state.gen != source.gen() {
            return RegistrationOutcome::Stale;
        }
        debug_assert!(!src_state.mapped, "incoming edges are frozen after mapping");

        tgt_state.outgoing.insert(source.slot(), source.gen());
        tgt_state.outstanding_commit_deps += 1;
        if let Some(children) = &tgt_state.children_mapped {
            src_state.dependent_children_mapped.push(children.event());
        }
        src_state.incoming.insert(target.slot(), target.gen());
        if !tgt_state.mapped {
            src_state.outstanding_mapping_deps += 1;
        }
        if src_state.speculation.is_some() && !tgt_state.resolved {
            src_state.outstanding_speculation_deps += 1;
        }

        let mut capture = None;
        let (source_req, target_req) = match &region {
            Some(info) => {
                if info.validates {
                    src_state
                        .verify_regions
                        .entry(target.slot())
                        .or_default()
                        .insert(info.target_req);
                    src_state.unverified_regions.remove(&info.source_req);
                }
                (info.source_req as i32, info.target_req as i32)
            }
            None => (-1, -1),
        };
        let dtype = region.as_ref().map_or(DependenceType::True, |i| i.dtype);
        let validates = region.as_ref().is_some_and(|i| i.validates);
        let mask = region.as_ref().map_or(FieldMask::EMPTY, |i| i.mask);
        if src_state.tracing {
            src_state.logical_records.push(LogicalRecord {
                target,
                source_req,
                target_req,
                dtype,
                validates,
                mask,
            });
            capture = src_state.trace.clone();
        }
        let target_poisoned = tgt_state.poisoned;
        drop(second_guard);
        drop(first_guard);

        if let Some(trace) = capture {
            trace.record_dependence(source, target, source_req, target_req, dtype, validates);
        }
        // Registering on an already-quashed producer picks up its poison.
        if target_poisoned {
            self.enqueue(RuntimeCall::Quash {
                op: source,
                restart: false,
            });
        }
        RegistrationOutcome::Registered
    }

    /// Tells an operation that one more holder may register edges on it.
    pub fn add_mapping_reference(&self, key: OpKey) {
        self.with_state(key, |state| {
            state.outstanding_mapping_references += 1;
        });
    }

    /// Drops one mapping-reference holder; commit may become possible.
    pub fn remove_mapping_reference(&self, key: OpKey) {
        let enqueue = self
            .with_state(key, |state| {
                debug_assert!(
                    state.outstanding_mapping_references > 0,
                    "mapping reference underflow"
                );
                state.outstanding_mapping_references =
                    state.outstanding_mapping_references.saturating_sub(1);
                Self::commit_became_ready(state)
            })
            .unwrap_or(false);
        if enqueue {
            self.enqueue(RuntimeCall::TriggerCommit(key));
        }
    }

    /// Phase D: freezes `incoming`, notifies consumers, fires the
    /// children-mapped event, and advances toward completion.
    pub(crate) fn complete_mapping(&self, key: OpKey) {
        let Some((consumers, children)) = self.with_state(key, |state| {
            if state.mapped {
                return None;
            }
            state.mapped = true;
            let consumers: Vec<OpKey> = state
                .outgoing
                .iter()
                .map(|(slot, gen)| OpKey::new(*slot, *gen))
                .collect();
            Some((consumers, state.children_mapped.clone()))
        })
        .flatten() else {
            return;
        };
        for consumer in consumers {
            self.enqueue(RuntimeCall::NotifyMapped(consumer));
        }
        if let Some(children) = children {
            if !children.has_triggered() {
                children.trigger();
            }
        }
        self.try_complete(key);
    }

    /// Marks speculation resolved and notifies consumers.
    pub(crate) fn resolve_speculation(&self, key: OpKey) {
        let Some(consumers) = self.with_state(key, |state| {
            if state.resolved {
                return None;
            }
            state.resolved = true;
            state.resolution_invoked = true;
            Some(
                state
                    .outgoing
                    .iter()
                    .map(|(slot, gen)| OpKey::new(*slot, *gen))
                    .collect::<Vec<_>>(),
            )
        })
        .flatten() else {
            return;
        };
        for consumer in consumers {
            self.enqueue(RuntimeCall::NotifySpeculated(consumer));
        }
        self.try_complete(key);
    }

    /// Phase E entry: execution finished.
    pub(crate) fn complete_execution(&self, key: OpKey) {
        let changed = self.with_state(key, |state| {
            if state.executed {
                return false;
            }
            state.executed = true;
            true
        });
        if changed == Some(true) {
            self.try_complete(key);
        }
    }

    /// Phase E: once mapped, executed and resolved, completes the op —
    /// fires the completion event, verifies producer regions, and releases
    /// commit dependences up the graph.
    pub(crate) fn try_complete(&self, key: OpKey) {
        struct CompletionActions {
            completion: Option<(UserEvent, bool)>,
            verified: Vec<(OpKey, SmallVec<[u32; 4]>)>,
            producers: Vec<OpKey>,
            epoch: Option<OpKey>,
            commit: bool,
        }
        let Some(actions) = self.with_state(key, |state| {
            if !state.completion_ready() {
                return None;
            }
            state.complete_invoked = true;
            state.completed = true;
            let completion = if state.need_completion_trigger {
                state.need_completion_trigger = false;
                Some((state.completion_event.clone(), state.poisoned))
            } else {
                None
            };
            let verified = state
                .verify_regions
                .iter()
                .filter_map(|(slot, regions)| {
                    let gen = state.incoming.get(slot)?;
                    Some((
                        OpKey::new(*slot, *gen),
                        regions.iter().copied().collect::<SmallVec<[u32; 4]>>(),
                    ))
                })
                .collect();
            let producers = state
                .incoming
                .iter()
                .map(|(slot, gen)| OpKey::new(*slot, *gen))
                .collect();
            let epoch = state.must_epoch.map(|link| link.epoch);
            let commit = Self::commit_became_ready(state);
            Some(CompletionActions {
                completion,
                verified,
                producers,
                epoch,
                commit,
            })
        })
        .flatten() else {
            return;
        };

        if let Some((event, poison)) = actions.completion {
            if poison {
                event.trigger_poisoned();
            } else {
                event.trigger();
            }
        }
        for (producer, regions) in actions.verified {
            self.enqueue(RuntimeCall::NotifyVerified(producer, regions));
        }
        for producer in actions.producers {
            self.enqueue(RuntimeCall::NotifyCommit(producer));
        }
        if let Some(epoch) = actions.epoch {
            self.enqueue(RuntimeCall::EpochSubopComplete(epoch));
        }
        if actions.commit {
            self.enqueue(RuntimeCall::TriggerCommit(key));
        }
        debug!(?key, "operation completed");
    }

    /// A producer finished mapping; flows down one edge.
    pub(crate) fn handle_notify_mapped(&self, key: OpKey) {
        let enqueue = self
            .with_state(key, |state| {
                debug_assert!(state.outstanding_mapping_deps > 0);
                state.outstanding_mapping_deps = state.outstanding_mapping_deps.saturating_sub(1);
                if state.mapping_ready() && !state.mapping_enqueued {
                    state.mapping_enqueued = true;
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);
        if enqueue {
            self.enqueue(RuntimeCall::TriggerMapping(key));
        }
    }

    /// A producer resolved speculation; flows down one edge. Producers
    /// broadcast to every consumer, but only speculative consumers carry a
    /// speculation count; for the rest this is a no-op.
    pub(crate) fn handle_notify_speculated(&self, key: OpKey) {
        let enqueue = self
            .with_state(key, |state| {
                if state.outstanding_speculation_deps == 0 {
                    return false;
                }
                state.outstanding_speculation_deps -= 1;
                if state.mapping_ready() && !state.mapping_enqueued {
                    state.mapping_enqueued = true;
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);
        if enqueue {
            self.enqueue(RuntimeCall::TriggerMapping(key));
        }
    }

    /// A consumer completed; flows up one edge.
    pub(crate) fn handle_notify_commit(&self, key: OpKey) {
        let enqueue = self
            .with_state(key, |state| {
                debug_assert!(state.outstanding_commit_deps > 0);
                state.outstanding_commit_deps = state.outstanding_commit_deps.saturating_sub(1);
                Self::commit_became_ready(state)
            })
            .unwrap_or(false);
        if enqueue {
            self.enqueue(RuntimeCall::TriggerCommit(key));
        }
    }

    /// A consumer verified some of this op's regions.
    pub(crate) fn handle_notify_verified(&self, key: OpKey, regions: &[u32]) {
        let enqueue = self
            .with_state(key, |state| {
                for region in regions {
                    state.unverified_regions.remove(region);
                }
                Self::commit_became_ready(state)
            })
            .unwrap_or(false);
        if enqueue {
            self.enqueue(RuntimeCall::TriggerCommit(key));
        }
    }

    /// Allows commit as soon as completion happens, without waiting for
    /// consumer verification. Used by operations whose output escapes
    /// application control once mapped.
    pub fn request_early_commit(&self, key: OpKey) {
        let enqueue = self
            .with_state(key, |state| {
                state.early_commit_request = true;
                Self::commit_became_ready(state)
            })
            .unwrap_or(false);
        if enqueue {
            self.enqueue(RuntimeCall::TriggerCommit(key));
        }
    }

    /// Marks the op's outputs hardened; with every region verified this
    /// allows commit before the commit-dependence count drains.
    pub fn harden_operation(&self, key: OpKey) {
        let enqueue = self
            .with_state(key, |state| {
                state.hardened = true;
                Self::commit_became_ready(state)
            })
            .unwrap_or(false);
        if enqueue {
            self.enqueue(RuntimeCall::TriggerCommit(key));
        }
    }

    /// The abort entry: quashes the generation named by `key` and, with
    /// `restart`, asks the parent context to re-raise. Idempotent per
    /// generation; quash of a completed generation is a no-op.
    pub fn quash_operation(&self, key: OpKey, restart: bool) {
        self.handle_quash(key, restart);
    }

    /// The abort path: idempotent per generation. Poisons the completion
    /// event, releases producers, propagates quash along out-edges, and
    /// optionally re-raises the parent context.
    pub(crate) fn handle_quash(&self, key: OpKey, restart: bool) {
        struct QuashActions {
            completion: Option<(UserEvent, bool)>,
            children: Option<UserEvent>,
            consumers: Vec<OpKey>,
            producers: Vec<OpKey>,
            epoch: Option<OpKey>,
            parent: std::sync::Weak<ContextInner>,
            commit: bool,
        }
        let Some(actions) = self.with_state(key, |state| {
            if state.quashed || state.complete_invoked {
                return None;
            }
            state.quashed = true;
            state.poisoned = true;
            state.mapped = true;
            state.executed = true;
            state.resolved = true;
            state.complete_invoked = true;
            state.completed = true;
            let completion = if state.need_completion_trigger {
                state.need_completion_trigger = false;
                Some((state.completion_event.clone(), true))
            } else {
                None
            };
            Some(QuashActions {
                completion,
                children: state.children_mapped.clone(),
                consumers: state
                    .outgoing
                    .iter()
                    .map(|(slot, gen)| OpKey::new(*slot, *gen))
                    .collect(),
                producers: state
                    .incoming
                    .iter()
                    .map(|(slot, gen)| OpKey::new(*slot, *gen))
                    .collect(),
                epoch: state.must_epoch.map(|link| link.epoch),
                parent: state.parent.clone(),
                commit: Self::commit_became_ready(state),
            })
        })
        .flatten() else {
            return;
        };

        warn!(?key, restart, "operation quashed");
        if let Some((event, _)) = actions.completion {
            event.trigger_poisoned();
        }
        if let Some(children) = actions.children {
            if !children.has_triggered() {
                children.trigger_poisoned();
            }
        }
        for consumer in actions.consumers {
            self.enqueue(RuntimeCall::Quash {
                op: consumer,
                restart: false,
            });
        }
        for producer in actions.producers {
            self.enqueue(RuntimeCall::NotifyCommit(producer));
        }
        if let Some(epoch) = actions.epoch {
            self.enqueue(RuntimeCall::EpochSubopComplete(epoch));
        }
        if restart {
            if let Some(ctx) = actions.parent.upgrade() {
                ctx.request_restart();
            }
        }
        if actions.commit {
            self.enqueue(RuntimeCall::TriggerCommit(key));
        }
    }

    /// Phase F: commits the operation, bumps the slot generation, and
    /// returns the slot to its freelist.
    pub(crate) fn handle_trigger_commit(&self, key: OpKey) {
        let Some(slot) = self.table().slot_for(key) else {
            return;
        };
        struct CommitActions {
            payload: OpPayload,
            speculation: Option<SpecInfo>,
            parent: std::sync::Weak<ContextInner>,
            track_parent: bool,
            epoch: Option<OpKey>,
        }
        let actions = {
            let mut state = slot.state.lock();
            if state.gen != key.gen() {
                return;
            }
            state.commit_enqueued = false;
            if !state.commit_ready() {
                return;
            }
            // Predicate ops additionally wait for their cell references to
            // drain before the slot can be recycled.
            let cell_refs = match &state.payload {
                OpPayload::FuturePred(p) => p.cell.references(),
                OpPayload::PredCombo(p) => p.cell.references(),
                _ => 0,
            };
            if cell_refs > 0 {
                return;
            }
            state.commit_invoked = true;
            state.committed = true;
            let actions = CommitActions {
                payload: std::mem::replace(&mut state.payload, OpPayload::Inactive),
                speculation: state.speculation.take(),
                parent: state.parent.clone(),
                track_parent: state.track_parent,
                epoch: state.must_epoch.map(|link| link.epoch),
            };
            let next_gen = state.gen.wrapping_add(1);
            state.reset_for_reuse(next_gen);
            slot.gen
                .store(next_gen, std::sync::atomic::Ordering::Release);
            slot.unique_id.store(0, std::sync::atomic::Ordering::Release);
            actions
        };

        self.commit_payload_cleanup(&actions.payload);
        if let Some(spec) = actions.speculation {
            if let Some(owner) = spec.predicate.remove_reference() {
                self.enqueue(RuntimeCall::PredicateRefsReleased(owner));
            }
        }
        if let Some(epoch) = actions.epoch {
            self.enqueue(RuntimeCall::EpochSubopCommit(epoch));
        }
        if actions.track_parent {
            if let Some(ctx) = actions.parent.upgrade() {
                ctx.operation_committed(key);
            }
        }
        self.table().checkin(&slot);
        debug!(?key, "operation committed");
    }

    /// Post-commit payload teardown: deferred deletions run here, and
    /// combinators release their input predicates.
    fn commit_payload_cleanup(&self, payload: &OpPayload) {
        match payload {
            OpPayload::Deletion(deletion) => {
                self.forest().destroy(&deletion.kind);
            }
            OpPayload::PredCombo(combo) => {
                for input in &combo.inputs {
                    if let Some(owner) = input.cell.remove_reference() {
                        self.enqueue(RuntimeCall::PredicateRefsReleased(owner));
                    }
                }
            }
            _ => {}
        }
    }

    /// Records a sibling dependence on a must-epoch.
    fn record_epoch_dependence(
        &self,
        epoch: OpKey,
        source_index: u32,
        target_index: u32,
        source_req: u32,
        target_req: u32,
        dtype: DependenceType,
    ) {
        self.with_state(epoch, |state| {
            if let OpPayload::MustEpoch(payload) = &mut state.payload {
                payload.record_dependence(target_index, source_index, target_req, source_req, dtype);
            }
        });
    }

    /// Evaluates commit readiness under the lock and flips the dedup flag.
    fn commit_became_ready(state: &mut OpState) -> bool {
        if state.commit_ready() && !state.commit_enqueued {
            state.commit_enqueued = true;
            true
        } else {
            false
        }
    }
}
