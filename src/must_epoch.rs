//! The must-parallel epoch sub-scheduler.
//!
//! A must-epoch owns a set of tasks the application requires to run
//! concurrently. Sibling dependences discovered during dependence analysis
//! are interposed here instead of entering the graph: ordering dependences
//! make the epoch infeasible, placement-resolvable ones become mapping
//! constraints. Triggering, mapping and distribution run as a pipeline
//! once every child is ready:
//!
//! 1. `MustEpochTriggerer` confirms all children reached the mapping
//!    stage and snapshots their requirement views;
//! 2. `MustEpochMapper` maps the whole group with one mapper call and
//!    verifies the placement against the recorded constraints;
//! 3. `MustEpochDistributor` walks the slices and launches the leaves.
//!
//! Completion and commit aggregate over the children through the
//! `remaining_subop_*` counters; the epoch's future map materializes when
//! the last child completes.

use crate::error::Error;
use crate::event::FutureMap;
use crate::mapper::{EpochTaskView, MappingConstraint, Placement};
use crate::op::OpPayload;
use crate::runtime::queue::RuntimeCall;
use crate::runtime::Runtime;
use crate::tracing_compat::{debug, error};
use crate::types::{DependenceType, DomainPoint, OpKey};

/// A dependence recorded between two members of one epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependenceRecord {
    /// Epoch index of the earlier member.
    pub op1_idx: u32,
    /// Epoch index of the later member.
    pub op2_idx: u32,
    /// Requirement index on the earlier member.
    pub reg1_idx: u32,
    /// Requirement index on the later member.
    pub reg2_idx: u32,
    /// The dependence kind.
    pub dtype: DependenceType,
}

/// A slice of an index launch: the leaf tasks dispatched together.
#[derive(Debug, Clone)]
pub struct Slice {
    /// Indices of the leaves (into the epoch's single-task list).
    pub leaves: Vec<u32>,
}

/// Payload of a must-epoch meta-operation.
#[derive(Debug)]
pub struct MustEpochPayload {
    /// All leaf tasks of the epoch, individual and expanded index points.
    pub single_tasks: Vec<OpKey>,
    /// Launch point of each leaf, parallel to `single_tasks`.
    pub task_points: Vec<DomainPoint>,
    /// Distribution slices over the leaves.
    pub slices: Vec<Slice>,
    /// Sibling dependences recorded during analysis.
    pub dependences: Vec<DependenceRecord>,
    /// Aggregated per-point results.
    pub result_map: FutureMap,
    /// Children that have not yet completed.
    pub remaining_subop_completes: usize,
    /// Children that have not yet committed.
    pub remaining_subop_commits: usize,
    /// Children that have reached the mapping stage.
    pub ready_children: usize,
    /// Set once the trigger pipeline has run.
    pub triggering_complete: bool,
    /// Set when the epoch failed (infeasible or mapper rejection).
    pub failed: bool,
}

impl MustEpochPayload {
    /// Creates the payload for an epoch over the given leaves.
    #[must_use]
    pub fn new(
        single_tasks: Vec<OpKey>,
        task_points: Vec<DomainPoint>,
        slices: Vec<Slice>,
        result_map: FutureMap,
    ) -> Self {
        let count = single_tasks.len();
        Self {
            single_tasks,
            task_points,
            slices,
            dependences: Vec::new(),
            result_map,
            remaining_subop_completes: count,
            remaining_subop_commits: count,
            ready_children: 0,
            triggering_complete: false,
            failed: false,
        }
    }

    /// Records a sibling dependence (earlier member first).
    pub fn record_dependence(
        &mut self,
        op1_idx: u32,
        op2_idx: u32,
        reg1_idx: u32,
        reg2_idx: u32,
        dtype: DependenceType,
    ) {
        self.dependences.push(DependenceRecord {
            op1_idx,
            op2_idx,
            reg1_idx,
            reg2_idx,
            dtype,
        });
    }

    /// The first recorded dependence that forces ordering, if any; such a
    /// record makes the epoch unschedulable.
    #[must_use]
    pub fn first_infeasible(&self) -> Option<DependenceRecord> {
        self.dependences
            .iter()
            .copied()
            .find(|record| record.dtype.forces_ordering())
    }

    /// Mapping constraints derived from the placement-resolvable records.
    #[must_use]
    pub fn constraints(&self) -> Vec<MappingConstraint> {
        self.dependences
            .iter()
            .filter(|record| record.dtype.placement_resolvable())
            .map(|record| MappingConstraint {
                op1: record.op1_idx,
                reg1: record.reg1_idx,
                op2: record.op2_idx,
                reg2: record.reg2_idx,
                dtype: record.dtype,
            })
            .collect()
    }
}

/// Confirms readiness and snapshots the children for mapping.
struct MustEpochTriggerer<'a> {
    rt: &'a Runtime,
}

impl MustEpochTriggerer<'_> {
    /// Snapshots requirement views of every leaf; returns `None` if any
    /// leaf is gone (already failed and recycled).
    fn trigger_tasks(&self, leaves: &[OpKey], points: &[DomainPoint]) -> Option<Vec<EpochTaskView>> {
        let mut views = Vec::with_capacity(leaves.len());
        for (index, leaf) in leaves.iter().enumerate() {
            let view = self.rt.with_state(*leaf, |state| {
                if let OpPayload::Task(task) = &state.payload {
                    Some(EpochTaskView {
                        index: index as u32,
                        point: points.get(index).copied().unwrap_or(DomainPoint::ZERO_DIM),
                        requirements: task.requirements.to_vec(),
                    })
                } else {
                    None
                }
            })??;
            views.push(view);
        }
        Some(views)
    }
}

/// Maps the whole epoch with one mapper call and verifies constraints.
struct MustEpochMapper<'a> {
    rt: &'a Runtime,
}

impl MustEpochMapper<'_> {
    fn map_tasks(
        &self,
        views: &[EpochTaskView],
        constraints: &[MappingConstraint],
    ) -> Result<Vec<Placement>, Error> {
        let placements = self.rt.mapper().map_must_epoch(views, constraints)?;
        if placements.len() != views.len() {
            return Err(Error::must_epoch_infeasible(
                "mapper returned a short placement vector",
            ));
        }
        for constraint in constraints {
            let a = placements
                .get(constraint.op1 as usize)
                .ok_or_else(|| Error::must_epoch_infeasible("constraint names no placement"))?;
            let b = placements
                .get(constraint.op2 as usize)
                .ok_or_else(|| Error::must_epoch_infeasible("constraint names no placement"))?;
            let satisfied = match constraint.dtype {
                DependenceType::Simultaneous => a.instance == b.instance,
                DependenceType::Atomic => a.memory == b.memory,
                _ => true,
            };
            if !satisfied {
                return Err(Error::must_epoch_infeasible(format!(
                    "placement violates constraint between members {} and {}",
                    constraint.op1, constraint.op2
                )));
            }
        }
        Ok(placements)
    }
}

/// Dispatches slices and launches their leaves.
struct MustEpochDistributor<'a> {
    rt: &'a Runtime,
}

impl MustEpochDistributor<'_> {
    fn distribute_tasks(&self, leaves: &[OpKey], slices: &[Slice], placements: &[Placement]) {
        for slice in slices {
            for leaf_index in &slice.leaves {
                let Some(leaf) = leaves.get(*leaf_index as usize) else {
                    continue;
                };
                let future = self.rt.with_state(*leaf, |state| {
                    if let OpPayload::Task(task) = &mut state.payload {
                        task.placement = placements.get(*leaf_index as usize).copied();
                        debug!(?leaf, placement = ?task.placement, "epoch leaf launched");
                        Some(task.future.clone())
                    } else {
                        None
                    }
                });
                self.rt.complete_mapping(*leaf);
                self.rt.resolve_speculation(*leaf);
                if let Some(Some(future)) = future {
                    if !future.is_ready() {
                        future.set_result(&[]);
                    }
                }
                self.rt.complete_execution(*leaf);
            }
        }
    }
}

impl Runtime {
    /// A child reached its mapping stage; once all have, the epoch
    /// pipeline runs.
    pub(crate) fn handle_epoch_child_ready(&self, epoch: OpKey) {
        let trigger = self
            .with_state(epoch, |state| {
                if let OpPayload::MustEpoch(payload) = &mut state.payload {
                    payload.ready_children += 1;
                    if payload.ready_children == payload.single_tasks.len()
                        && !payload.triggering_complete
                    {
                        payload.triggering_complete = true;
                        return true;
                    }
                }
                false
            })
            .unwrap_or(false);
        if trigger {
            self.enqueue(RuntimeCall::EpochTrigger(epoch));
        }
    }

    /// Runs the epoch pipeline: feasibility, group mapping, distribution.
    pub(crate) fn handle_epoch_trigger(&self, epoch: OpKey) {
        let Some((leaves, points, slices, constraints, infeasible, result_map)) = self
            .with_state(epoch, |state| {
                if let OpPayload::MustEpoch(payload) = &state.payload {
                    Some((
                        payload.single_tasks.clone(),
                        payload.task_points.clone(),
                        payload.slices.clone(),
                        payload.constraints(),
                        payload.first_infeasible(),
                        payload.result_map.clone(),
                    ))
                } else {
                    None
                }
            })
            .flatten()
        else {
            return;
        };

        if let Some(record) = infeasible {
            self.fail_epoch(
                epoch,
                &leaves,
                &result_map,
                &Error::must_epoch_infeasible(format!(
                    "true dependence between members {} and {} (requirements {} and {})",
                    record.op1_idx, record.op2_idx, record.reg1_idx, record.reg2_idx
                )),
            );
            return;
        }

        let triggerer = MustEpochTriggerer { rt: self };
        let Some(views) = triggerer.trigger_tasks(&leaves, &points) else {
            self.fail_epoch(
                epoch,
                &leaves,
                &result_map,
                &Error::must_epoch_infeasible("an epoch member failed to trigger"),
            );
            return;
        };

        let mapper = MustEpochMapper { rt: self };
        let placements = match mapper.map_tasks(&views, &constraints) {
            Ok(placements) => placements,
            Err(err) => {
                self.fail_epoch(epoch, &leaves, &result_map, &err);
                return;
            }
        };

        debug!(?epoch, leaves = leaves.len(), "must-epoch mapped");
        let distributor = MustEpochDistributor { rt: self };
        distributor.distribute_tasks(&leaves, &slices, &placements);
    }

    /// Marks the epoch failed: every member future resolves with an error
    /// payload, the children are quashed, and the epoch's completion event
    /// fires poisoned.
    fn fail_epoch(&self, epoch: OpKey, leaves: &[OpKey], result_map: &FutureMap, err: &Error) {
        let already_failed = self
            .with_state(epoch, |state| {
                if let OpPayload::MustEpoch(payload) = &mut state.payload {
                    if payload.failed {
                        true
                    } else {
                        payload.failed = true;
                        state.poisoned = true;
                        false
                    }
                } else {
                    true
                }
            })
            .unwrap_or(true);
        if already_failed {
            return;
        }
        error!(?epoch, %err, "must-epoch failed");
        for (index, leaf) in leaves.iter().enumerate() {
            let point = self
                .with_state(*leaf, |state| {
                    if let OpPayload::Task(task) = &state.payload {
                        Some(task.point)
                    } else {
                        None
                    }
                })
                .flatten()
                .unwrap_or(DomainPoint::one_dim(index as i64));
            result_map.get_future(point).set_failed();
            self.enqueue(RuntimeCall::Quash {
                op: *leaf,
                restart: false,
            });
        }
    }

    /// Evaluates the child-child record set at the end of the epoch's
    /// dependence analysis; an ordering dependence among members fails the
    /// epoch immediately.
    pub(crate) fn check_epoch_feasibility(&self, epoch: OpKey) {
        let Some((record, leaves, result_map)) = self
            .with_state(epoch, |state| {
                if let OpPayload::MustEpoch(payload) = &state.payload {
                    payload.first_infeasible().map(|record| {
                        (
                            record,
                            payload.single_tasks.clone(),
                            payload.result_map.clone(),
                        )
                    })
                } else {
                    None
                }
            })
            .flatten()
        else {
            return;
        };
        self.fail_epoch(
            epoch,
            &leaves,
            &result_map,
            &Error::must_epoch_infeasible(format!(
                "true dependence between members {} and {} (requirements {} and {})",
                record.op1_idx, record.op2_idx, record.reg1_idx, record.reg2_idx
            )),
        );
    }

    /// A child completed; the epoch completes with the last one.
    pub(crate) fn handle_epoch_subop_complete(&self, epoch: OpKey) {
        let done = self
            .with_state(epoch, |state| {
                if let OpPayload::MustEpoch(payload) = &mut state.payload {
                    debug_assert!(payload.remaining_subop_completes > 0);
                    payload.remaining_subop_completes =
                        payload.remaining_subop_completes.saturating_sub(1);
                    payload.remaining_subop_completes == 0
                } else {
                    false
                }
            })
            .unwrap_or(false);
        if done {
            self.complete_mapping(epoch);
            self.resolve_speculation(epoch);
            self.complete_execution(epoch);
        }
    }

    /// A child committed; the artificial commit dependence installed at
    /// issue time drains here.
    pub(crate) fn handle_epoch_subop_commit(&self, epoch: OpKey) {
        self.with_state(epoch, |state| {
            if let OpPayload::MustEpoch(payload) = &mut state.payload {
                debug_assert!(payload.remaining_subop_commits > 0);
                payload.remaining_subop_commits = payload.remaining_subop_commits.saturating_sub(1);
            }
        });
        self.handle_notify_commit(epoch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(dtype: DependenceType) -> DependenceRecord {
        DependenceRecord {
            op1_idx: 0,
            op2_idx: 1,
            reg1_idx: 0,
            reg2_idx: 0,
            dtype,
        }
    }

    fn payload_with(records: &[DependenceRecord]) -> MustEpochPayload {
        let mut payload = MustEpochPayload::new(
            vec![OpKey::new(0, 0), OpKey::new(1, 0)],
            vec![DomainPoint::one_dim(0), DomainPoint::one_dim(1)],
            vec![Slice { leaves: vec![0, 1] }],
            FutureMap::new(crate::event::Event::completed()),
        );
        for r in records {
            payload.record_dependence(r.op1_idx, r.op2_idx, r.reg1_idx, r.reg2_idx, r.dtype);
        }
        payload
    }

    #[test]
    fn true_dependences_are_infeasible() {
        for dtype in [
            DependenceType::True,
            DependenceType::Anti,
            DependenceType::Output,
        ] {
            let payload = payload_with(&[record(dtype)]);
            assert!(payload.first_infeasible().is_some(), "{dtype:?}");
            assert!(payload.constraints().is_empty());
        }
    }

    #[test]
    fn relaxed_dependences_become_constraints() {
        for dtype in [DependenceType::Atomic, DependenceType::Simultaneous] {
            let payload = payload_with(&[record(dtype)]);
            assert!(payload.first_infeasible().is_none(), "{dtype:?}");
            let constraints = payload.constraints();
            assert_eq!(constraints.len(), 1);
            assert_eq!(constraints[0].dtype, dtype);
        }
    }

    #[test]
    fn counters_start_at_member_count() {
        let payload = payload_with(&[]);
        assert_eq!(payload.remaining_subop_completes, 2);
        assert_eq!(payload.remaining_subop_commits, 2);
        assert_eq!(payload.ready_children, 0);
        assert!(!payload.triggering_complete);
    }
}
