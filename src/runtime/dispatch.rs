//! Per-kind stage behavior: the dispatch tables over [`OpKind`].
//!
//! The lifecycle engine is kind-agnostic; this module specializes the
//! mapping and execution stages per variant and implements the
//! speculation protocol for predicated operations.

use std::sync::Arc;

use crate::event::Event;
use crate::op::{FenceKind, FillSource, OpKind, OpPayload, SpecState, TriggerOutcome};
use crate::mapper::Speculation;
use crate::predicate::PredicateCell;
use crate::runtime::queue::RuntimeCall;
use crate::runtime::Runtime;
use crate::tracing_compat::{debug, trace, warn};
use crate::types::OpKey;

impl Runtime {
    /// Phase C entry: runs at most once per generation.
    pub(crate) fn handle_trigger_mapping(&self, key: OpKey) -> TriggerOutcome {
        let Some(slot) = self.table().slot_for(key) else {
            return TriggerOutcome::Stale;
        };
        let kind = slot.kind;
        let entry = {
            let mut state = slot.state.lock();
            if state.gen != key.gen() || state.mapping_invoked {
                return TriggerOutcome::Stale;
            }
            if state.quashed {
                return TriggerOutcome::Poisoned;
            }
            debug_assert_eq!(state.outstanding_mapping_deps, 0);
            debug_assert_eq!(state.outstanding_speculation_deps, 0);
            state.mapping_invoked = true;
            let epoch = state.must_epoch.map(|link| link.epoch);
            let predicate = state
                .speculation
                .as_ref()
                .map(|spec| Arc::clone(&spec.predicate));
            (epoch, predicate)
        };
        trace!(?key, kind = kind.name(), "mapping triggered");

        match kind {
            OpKind::Task => {
                if let Some(epoch) = entry.0 {
                    self.enqueue(RuntimeCall::EpochChildReady(epoch));
                    TriggerOutcome::Deferred
                } else {
                    // A task outside an epoch is a collaborator boundary;
                    // treat it as an immediately schedulable leaf.
                    self.perform_mapping(key)
                }
            }
            OpKind::MustEpoch => {
                self.complete_mapping(key);
                self.resolve_speculation(key);
                TriggerOutcome::Proceed
            }
            OpKind::FuturePred => {
                self.complete_trivially(key);
                self.watch_future_pred(key);
                TriggerOutcome::Proceed
            }
            OpKind::NotPred | OpKind::AndPred | OpKind::OrPred => {
                self.complete_trivially(key);
                TriggerOutcome::Proceed
            }
            _ => match entry.1 {
                Some(cell) => self.trigger_speculative_mapping(key, &cell),
                None => self.perform_mapping(key),
            },
        }
    }

    /// The speculation decision point: resolve if the predicate already
    /// fired, otherwise ask the mapper whether to guess.
    fn trigger_speculative_mapping(
        &self,
        key: OpKey,
        cell: &Arc<PredicateCell>,
    ) -> TriggerOutcome {
        if let Some(value) = cell.value() {
            self.resolve_predicated_op(key, value);
            return TriggerOutcome::Proceed;
        }
        let kind = self
            .table()
            .slot_for(key)
            .map_or(OpKind::Copy, |slot| slot.kind);
        let decision = if self.config().allow_speculation {
            self.mapper().speculate(kind)
        } else {
            Speculation::Refuse
        };
        match decision {
            Speculation::Refuse => {
                // Stay pending; the predicate notification resumes us.
                trace!(?key, "speculation refused, waiting for predicate");
                TriggerOutcome::Deferred
            }
            Speculation::Value(true) => {
                self.set_spec_state(key, SpecState::SpeculateTrue);
                debug!(?key, "speculating true");
                self.perform_mapping(key)
            }
            Speculation::Value(false) => {
                self.set_spec_state(key, SpecState::SpeculateFalse);
                debug!(?key, "speculating false");
                // Map trivially but hold execution until resolution.
                self.complete_mapping(key);
                TriggerOutcome::Deferred
            }
        }
    }

    /// Transition into a resolve state and run the matching behavior.
    fn resolve_predicated_op(&self, key: OpKey, value: bool) {
        if value {
            self.set_spec_state(key, SpecState::ResolveTrue);
            self.release_predicate(key);
            let _ = self.perform_mapping(key);
        } else {
            self.set_spec_state(key, SpecState::ResolveFalse);
            self.release_predicate(key);
            // resolve_false: skip execution and complete with the sentinel
            // (an untriggered side effect, a normal completion event).
            self.complete_mapping(key);
            self.resolve_speculation(key);
            self.complete_execution(key);
        }
    }

    fn set_spec_state(&self, key: OpKey, next: SpecState) {
        self.with_state(key, |state| {
            if let Some(spec) = &mut state.speculation {
                spec.state = next;
            }
        });
    }

    fn spec_state(&self, key: OpKey) -> Option<SpecState> {
        self.with_state(key, |state| state.speculation.as_ref().map(|s| s.state))
            .flatten()
    }

    /// Drops the op's reference on its predicate once resolution reached
    /// it.
    fn release_predicate(&self, key: OpKey) {
        let cell = self
            .with_state(key, |state| {
                state
                    .speculation
                    .as_ref()
                    .map(|spec| Arc::clone(&spec.predicate))
            })
            .flatten();
        if let Some(cell) = cell {
            if let Some(owner) = cell.remove_reference() {
                self.enqueue(RuntimeCall::PredicateRefsReleased(owner));
            }
        }
    }

    /// The mapping stage proper: wait for producers' children, consult the
    /// mapper where the kind needs placements, then complete mapping and
    /// queue execution.
    pub(crate) fn perform_mapping(&self, key: OpKey) -> TriggerOutcome {
        // Producers that track children gate our mapping on their
        // children-mapped events.
        let pending = self
            .with_state(key, |state| {
                std::mem::take(&mut state.dependent_children_mapped)
            })
            .unwrap_or_default();
        let waiting: Vec<Event> = pending.into_iter().filter(|e| !e.has_triggered()).collect();
        if !waiting.is_empty() {
            let rt = self.clone();
            Event::merge(waiting).subscribe(move |poison| {
                if poison {
                    rt.enqueue(RuntimeCall::Quash {
                        op: key,
                        restart: false,
                    });
                } else {
                    rt.enqueue(RuntimeCall::ContinueMapping(key));
                }
            });
            return TriggerOutcome::Deferred;
        }

        self.perform_payload_mapping(key);
        self.complete_mapping(key);
        let resolve = match self.spec_state(key) {
            None | Some(SpecState::ResolveTrue) => true,
            Some(_) => false,
        };
        if resolve {
            self.resolve_speculation(key);
        }
        self.enqueue(RuntimeCall::TriggerExecution(key));
        TriggerOutcome::Proceed
    }

    /// Mapper consultation for the kinds that bind placements.
    fn perform_payload_mapping(&self, key: OpKey) {
        let Some(slot) = self.table().slot_for(key) else {
            return;
        };
        match slot.kind {
            OpKind::Map => {
                let req = self.with_state(key, |state| {
                    if let OpPayload::Map(map) = &state.payload {
                        Some(map.requirement.clone())
                    } else {
                        None
                    }
                });
                if let Some(Some(req)) = req {
                    let placement = self.mapper().map_inline(&req);
                    self.with_state(key, |state| {
                        if let OpPayload::Map(map) = &mut state.payload {
                            map.placement = Some(placement);
                            map.region.bind_instance(placement);
                        }
                    });
                }
            }
            OpKind::Copy => {
                let reqs = self.with_state(key, |state| {
                    if let OpPayload::Copy(copy) = &state.payload {
                        Some((
                            copy.src_requirements.to_vec(),
                            copy.dst_requirements.to_vec(),
                        ))
                    } else {
                        None
                    }
                });
                if let Some(Some((srcs, dsts))) = reqs {
                    let placements = self.mapper().map_copy(&srcs, &dsts);
                    self.with_state(key, |state| {
                        if let OpPayload::Copy(copy) = &mut state.payload {
                            copy.placements = placements;
                        }
                    });
                }
            }
            _ => {}
        }
    }

    /// Completes mapping, resolution and execution in one step; used by
    /// metadata-only operations.
    fn complete_trivially(&self, key: OpKey) {
        self.complete_mapping(key);
        self.resolve_speculation(key);
        self.complete_execution(key);
    }

    /// Phase E dispatch: launch the kind's external effect and defer
    /// completion onto its event.
    pub(crate) fn handle_trigger_execution(&self, key: OpKey) -> TriggerOutcome {
        let Some(slot) = self.table().slot_for(key) else {
            return TriggerOutcome::Stale;
        };
        // A mispredicted true-speculation resolved false while execution
        // was still queued: skip the side effect entirely.
        if self.spec_state(key) == Some(SpecState::ResolveFalse) {
            self.complete_execution(key);
            return TriggerOutcome::Proceed;
        }
        match slot.kind {
            OpKind::Map => {
                self.with_state(key, |state| {
                    if let OpPayload::Map(map) = &state.payload {
                        trace!(?key, placement = ?map.placement, "inline mapping executing");
                    }
                });
                // Inline mappings escape to the application once mapped;
                // they commit early rather than wait for verification.
                self.request_early_commit(key);
                self.defer_completion(key, Event::completed())
            }
            OpKind::Copy => {
                let event = self
                    .with_state(key, |state| {
                        if let OpPayload::Copy(copy) = &state.payload {
                            trace!(?key, placements = copy.placements.len(), "copy executing");
                            Some(self.forest().issue_copy(
                                &copy.src_requirements,
                                &copy.dst_requirements,
                            ))
                        } else {
                            None
                        }
                    })
                    .flatten();
                self.defer_completion(key, event.unwrap_or_else(Event::completed))
            }
            OpKind::Fence | OpKind::Frame => {
                let previous = self
                    .with_state(key, |state| {
                        if let OpPayload::Fence(fence) = &mut state.payload {
                            match fence.kind {
                                FenceKind::Mapping => None,
                                FenceKind::Execution | FenceKind::Mixed => {
                                    Some(std::mem::take(&mut fence.previous))
                                }
                            }
                        } else {
                            None
                        }
                    })
                    .flatten();
                match previous {
                    Some(events) => self.defer_completion(key, Event::merge(events)),
                    None => self.defer_completion(key, Event::completed()),
                }
            }
            OpKind::Deletion => {
                // The deletion itself is deferred to commit.
                self.defer_completion(key, Event::completed())
            }
            OpKind::InterClose | OpKind::PostClose => {
                let event = self
                    .with_state(key, |state| {
                        if let OpPayload::Close(close) = &state.payload {
                            trace!(?key, create_op = ?close.create_op, "close executing");
                            Some(self.forest().close_region(&close.requirement))
                        } else {
                            None
                        }
                    })
                    .flatten();
                self.defer_completion(key, event.unwrap_or_else(Event::completed))
            }
            OpKind::Acquire | OpKind::Release => {
                self.with_state(key, |state| {
                    if let OpPayload::Coherence(coherence) = &state.payload {
                        trace!(?key, region = ?coherence.requirement.region, "coherence change");
                    }
                });
                self.defer_completion(key, Event::completed())
            }
            OpKind::DynamicCollective => {
                let parts = self.with_state(key, |state| {
                    if let OpPayload::Collective(c) = &state.payload {
                        Some((c.collective.clone(), c.future.clone()))
                    } else {
                        None
                    }
                });
                if let Some(Some((collective, future))) = parts {
                    let rt = self.clone();
                    let ready = collective.ready_event();
                    ready.subscribe(move |poison| {
                        if !poison {
                            future.set_result(&collective.value().to_le_bytes());
                        } else {
                            future.set_failed();
                        }
                        rt.enqueue(RuntimeCall::DeferredComplete { op: key, poison });
                    });
                    TriggerOutcome::Deferred
                } else {
                    self.complete_execution(key);
                    TriggerOutcome::Proceed
                }
            }
            OpKind::PendingPartition => {
                let event = self
                    .with_state(key, |state| {
                        if let OpPayload::PendingPartition(p) = &state.payload {
                            Some((self.forest().perform_partition(&p.thunk), p.handle_ready.clone()))
                        } else {
                            None
                        }
                    })
                    .flatten();
                if let Some((event, handle_ready)) = event {
                    self.defer_partition_completion(key, event, handle_ready);
                    TriggerOutcome::Deferred
                } else {
                    self.complete_execution(key);
                    TriggerOutcome::Proceed
                }
            }
            OpKind::DependentPartition => {
                let event = self
                    .with_state(key, |state| {
                        if let OpPayload::DependentPartition(p) = &state.payload {
                            Some((
                                self.forest().compute_dependent_partition(
                                    p.kind,
                                    &p.requirement,
                                    p.partition,
                                    p.projection,
                                ),
                                p.handle_ready.clone(),
                            ))
                        } else {
                            None
                        }
                    })
                    .flatten();
                if let Some((event, handle_ready)) = event {
                    self.defer_partition_completion(key, event, handle_ready);
                    TriggerOutcome::Deferred
                } else {
                    self.complete_execution(key);
                    TriggerOutcome::Proceed
                }
            }
            OpKind::Fill => self.execute_fill(key),
            OpKind::Attach => {
                let event = self
                    .with_state(key, |state| {
                        if let OpPayload::Attach(attach) = &state.payload {
                            Some(self.forest().attach_file(attach))
                        } else {
                            None
                        }
                    })
                    .flatten();
                self.defer_completion(key, event.unwrap_or_else(Event::completed))
            }
            OpKind::Detach => {
                let event = self
                    .with_state(key, |state| {
                        if let OpPayload::Detach(detach) = &state.payload {
                            Some(self.forest().detach_file(detach))
                        } else {
                            None
                        }
                    })
                    .flatten();
                self.defer_completion(key, event.unwrap_or_else(Event::completed))
            }
            OpKind::TraceCapture => {
                self.with_state(key, |state| {
                    if let OpPayload::TraceCapture(tc) = &state.payload {
                        debug_assert!(tc.trace.is_fixed(), "capture sentinel before fix");
                    }
                });
                self.defer_completion(key, Event::completed())
            }
            OpKind::TraceComplete => {
                let previous = self.with_state(key, |state| {
                    if let OpPayload::TraceComplete(tc) = &mut state.payload {
                        debug_assert!(tc.trace.is_fixed(), "trace-complete on unfixed trace");
                        std::mem::take(&mut tc.previous)
                    } else {
                        Vec::new()
                    }
                });
                self.defer_completion(key, Event::merge(previous.unwrap_or_default()))
            }
            OpKind::Task => {
                // Epoch leaves are launched by the distributor; a stray
                // execution trigger completes the leaf directly.
                let future = self.with_state(key, |state| {
                    if let OpPayload::Task(task) = &state.payload {
                        Some(task.future.clone())
                    } else {
                        None
                    }
                });
                if let Some(Some(future)) = future {
                    if !future.is_ready() {
                        future.set_result(&[]);
                    }
                }
                self.defer_completion(key, Event::completed())
            }
            OpKind::MustEpoch
            | OpKind::FuturePred
            | OpKind::NotPred
            | OpKind::AndPred
            | OpKind::OrPred => {
                // Never queued for execution; their stages run elsewhere.
                self.complete_execution(key);
                TriggerOutcome::Proceed
            }
        }
    }

    /// Fill execution: immediate bytes go straight to the forest; a future
    /// value defers the fill onto the future's ready event.
    fn execute_fill(&self, key: OpKey) -> TriggerOutcome {
        let parts = self.with_state(key, |state| {
            if let OpPayload::Fill(fill) = &state.payload {
                Some((fill.requirement.clone(), fill.source.clone()))
            } else {
                None
            }
        });
        let Some(Some((req, source))) = parts else {
            self.complete_execution(key);
            return TriggerOutcome::Proceed;
        };
        match source {
            FillSource::Bytes(bytes) => {
                let event = self.forest().issue_fill(&req, &bytes);
                self.defer_completion(key, event)
            }
            FillSource::Future(future) => {
                let rt = self.clone();
                future.ready_event().subscribe(move |poison| {
                    if poison {
                        rt.enqueue(RuntimeCall::DeferredComplete { op: key, poison: true });
                        return;
                    }
                    let value = future.get();
                    let bytes: &[u8] = value.as_deref().unwrap_or(&[]);
                    let event = rt.forest().issue_fill(&req, bytes);
                    let _ = rt.defer_completion(key, event);
                });
                TriggerOutcome::Deferred
            }
        }
    }

    /// Completion events of this op's producers; execution completion
    /// chains behind them so results (and poison) flow in graph order.
    fn execution_preconditions(&self, key: OpKey) -> Vec<Event> {
        let producers: Vec<OpKey> = self
            .with_state(key, |state| {
                state
                    .incoming
                    .iter()
                    .map(|(slot, gen)| OpKey::new(*slot, *gen))
                    .collect()
            })
            .unwrap_or_default();
        producers
            .into_iter()
            .filter_map(|producer| {
                self.with_state(producer, |state| state.completion_event.event())
            })
            .filter(|event| !event.has_triggered() || event.is_poisoned())
            .collect()
    }

    /// Routes an execution event into the deferred-complete path, chained
    /// behind the producers' completions.
    pub(crate) fn defer_completion(&self, key: OpKey, event: Event) -> TriggerOutcome {
        let mut preconditions = self.execution_preconditions(key);
        let event = if preconditions.is_empty() {
            event
        } else {
            preconditions.push(event);
            Event::merge(preconditions)
        };
        if event.has_triggered() {
            if event.is_poisoned() {
                self.handle_quash(key, false);
                return TriggerOutcome::Poisoned;
            }
            self.complete_execution(key);
            return TriggerOutcome::Proceed;
        }
        let rt = self.clone();
        event.subscribe(move |poison| {
            rt.enqueue(RuntimeCall::DeferredComplete { op: key, poison });
        });
        TriggerOutcome::Deferred
    }

    /// Partition variant of deferred completion: the computed handle's
    /// ready event mirrors the thunk event, poison included.
    fn defer_partition_completion(
        &self,
        key: OpKey,
        event: Event,
        handle_ready: crate::event::UserEvent,
    ) {
        let rt = self.clone();
        event.subscribe(move |poison| {
            if poison {
                warn!(?key, "partition computation failed");
                handle_ready.trigger_poisoned();
            } else {
                handle_ready.trigger();
            }
            rt.enqueue(RuntimeCall::DeferredComplete { op: key, poison });
        });
    }

    /// Completion of an external execution event.
    pub(crate) fn handle_deferred_complete(&self, key: OpKey, poison: bool) {
        if poison {
            self.handle_quash(key, false);
        } else {
            self.complete_execution(key);
        }
    }

    /// A predicate input resolved for `waiter`.
    pub(crate) fn handle_notify_predicate(&self, waiter: OpKey, input: u32, value: bool) {
        let Some(slot) = self.table().slot_for(waiter) else {
            return;
        };
        match slot.kind {
            OpKind::NotPred | OpKind::AndPred | OpKind::OrPred => {
                self.combine_predicate_input(waiter, slot.kind, input, value);
            }
            _ => self.notify_speculative(waiter, value),
        }
    }

    /// Delivery of a predicate value to a speculative operation.
    fn notify_speculative(&self, key: OpKey, value: bool) {
        enum Action {
            Ignore,
            Resolve,
            ResolveMatched,
            UpgradeToTrue,
            UpgradeToFalse,
            Mispredict,
        }
        let action = self
            .with_state(key, |state| {
                let mapping_invoked = state.mapping_invoked;
                let executed = state.executed;
                let Some(spec) = &mut state.speculation else {
                    return Action::Ignore;
                };
                match spec.state {
                    SpecState::PendingMap if !mapping_invoked => Action::Ignore,
                    SpecState::PendingMap => {
                        spec.state = if value {
                            SpecState::ResolveTrue
                        } else {
                            SpecState::ResolveFalse
                        };
                        Action::Resolve
                    }
                    SpecState::SpeculateTrue if value => {
                        spec.state = SpecState::ResolveTrue;
                        Action::ResolveMatched
                    }
                    SpecState::SpeculateTrue => {
                        if executed {
                            Action::Mispredict
                        } else {
                            spec.state = SpecState::ResolveFalse;
                            Action::UpgradeToFalse
                        }
                    }
                    SpecState::SpeculateFalse if !value => {
                        spec.state = SpecState::ResolveFalse;
                        Action::UpgradeToFalse
                    }
                    SpecState::SpeculateFalse => {
                        spec.state = SpecState::ResolveTrue;
                        Action::UpgradeToTrue
                    }
                    SpecState::ResolveTrue | SpecState::ResolveFalse => Action::Ignore,
                }
            })
            .unwrap_or(Action::Ignore);

        match action {
            Action::Ignore => {}
            Action::Resolve => {
                // Mapping was refused earlier; run the resolve behavior
                // from the decision point.
                self.release_predicate(key);
                if value {
                    let _ = self.perform_mapping(key);
                } else {
                    self.complete_mapping(key);
                    self.resolve_speculation(key);
                    self.complete_execution(key);
                }
            }
            Action::ResolveMatched => {
                self.release_predicate(key);
                self.resolve_speculation(key);
            }
            Action::UpgradeToFalse => {
                debug!(?key, "speculation upgraded to false before execution");
                self.release_predicate(key);
                self.resolve_speculation(key);
                self.complete_execution(key);
            }
            Action::UpgradeToTrue => {
                debug!(?key, "speculation upgraded to true");
                self.release_predicate(key);
                self.perform_payload_mapping(key);
                self.resolve_speculation(key);
                self.enqueue(RuntimeCall::TriggerExecution(key));
            }
            Action::Mispredict => {
                warn!(?key, "speculation mispredicted after execution");
                self.release_predicate(key);
                self.enqueue(RuntimeCall::Quash {
                    op: key,
                    restart: true,
                });
            }
        }
    }

    /// Combinator truth tables with short-circuit resolution.
    fn combine_predicate_input(&self, key: OpKey, kind: OpKind, input: u32, value: bool) {
        let resolved = self
            .with_state(key, |state| {
                let OpPayload::PredCombo(combo) = &mut state.payload else {
                    return None;
                };
                if combo.cell.value().is_some() {
                    return None;
                }
                if let Some(slot) = combo.inputs.get_mut(input as usize) {
                    slot.value = Some(value);
                }
                match kind {
                    OpKind::NotPred => Some(!value),
                    OpKind::AndPred => {
                        if !value {
                            Some(false)
                        } else if combo.inputs.iter().all(|i| i.value == Some(true)) {
                            Some(true)
                        } else {
                            None
                        }
                    }
                    OpKind::OrPred => {
                        if value {
                            Some(true)
                        } else if combo.inputs.iter().all(|i| i.value == Some(false)) {
                            Some(false)
                        } else {
                            None
                        }
                    }
                    _ => None,
                }
            })
            .flatten();
        if let Some(result) = resolved {
            let cell = self
                .with_state(key, |state| {
                    if let OpPayload::PredCombo(combo) = &state.payload {
                        Some(Arc::clone(&combo.cell))
                    } else {
                        None
                    }
                })
                .flatten();
            if let Some(cell) = cell {
                debug!(?key, result, "combinator resolved");
                self.resolve_predicate_cell(&cell, result);
            }
        }
    }

    /// Watches the future behind a future-predicate.
    ///
    /// The subscription captures the cell and future directly: the
    /// predicate op may commit (and its slot recycle) long before the
    /// future fires, but the cell outlives it through its waiters.
    fn watch_future_pred(&self, key: OpKey) {
        let parts = self
            .with_state(key, |state| {
                if let OpPayload::FuturePred(pred) = &state.payload {
                    Some((Arc::clone(&pred.cell), pred.future.clone()))
                } else {
                    None
                }
            })
            .flatten();
        let Some((cell, future)) = parts else {
            return;
        };
        if future.is_ready() {
            self.handle_resolve_future_pred(key);
        } else {
            let rt = self.clone();
            future.ready_event().subscribe(move |_| {
                if cell.value().is_none() {
                    let value = future.get_bool();
                    debug!(?key, value, "future predicate resolved");
                    rt.resolve_predicate_cell(&cell, value);
                }
            });
        }
    }

    /// Resolves a future predicate from its future's payload.
    pub(crate) fn handle_resolve_future_pred(&self, key: OpKey) {
        let parts = self
            .with_state(key, |state| {
                if let OpPayload::FuturePred(pred) = &state.payload {
                    Some((Arc::clone(&pred.cell), pred.future.clone()))
                } else {
                    None
                }
            })
            .flatten();
        let Some((cell, future)) = parts else {
            return;
        };
        if cell.value().is_some() {
            return;
        }
        let value = future.get_bool();
        debug!(?key, value, "future predicate resolved");
        self.resolve_predicate_cell(&cell, value);
    }

    /// Broadcasts a cell resolution to its waiters through the queue.
    pub(crate) fn resolve_predicate_cell(&self, cell: &Arc<PredicateCell>, value: bool) {
        for waiter in cell.set_resolved(value) {
            self.enqueue(RuntimeCall::NotifyPredicate {
                waiter: waiter.op,
                input: waiter.input,
                value,
            });
        }
    }
}
