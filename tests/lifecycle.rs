//! Lifecycle end-to-end tests: edge construction, completion ordering,
//! verification, commit, quash, fences and frames.

mod common;

use std::sync::{Arc, Mutex};

use common::Harness;
use opgraph::launcher::{CopyLauncher, FillLauncher, InlineLauncher};
use opgraph::op::DeletionKind;
use opgraph::{FenceKind, RegistrationOutcome};

#[test]
fn sequential_writes_order_and_commit() {
    let h = Harness::new();
    let region = h.region();
    let req = h.write_req(region);

    let e1 = h
        .ctx
        .issue_fill(FillLauncher::from_bytes(req.clone(), &[1]))
        .unwrap();
    let o1 = h.ctx.last_op().unwrap();
    let e2 = h
        .ctx
        .issue_fill(FillLauncher::from_bytes(req, &[2]))
        .unwrap();
    let o2 = h.ctx.last_op().unwrap();

    // The write-after-write edge exists before anything runs.
    let p1 = h.runtime.probe(o1).unwrap();
    let p2 = h.runtime.probe(o2).unwrap();
    assert!(p1.outgoing.contains(&o2), "O1 -> O2 missing");
    assert!(p2.incoming.contains(&o1), "O2 <- O1 missing");
    assert_eq!(p2.outstanding_mapping_deps, 1);
    assert!(!p1.mapped && !p2.mapped);

    // Completion order follows the edge.
    let order = Arc::new(Mutex::new(Vec::new()));
    let record = |label: &'static str| {
        let order = Arc::clone(&order);
        move |_poison: bool| order.lock().unwrap().push(label)
    };
    e1.subscribe(record("first"));
    e2.subscribe(record("second"));

    h.runtime.process_all();
    assert!(e1.has_triggered() && e2.has_triggered());
    assert!(!e1.is_poisoned() && !e2.is_poisoned());
    assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);

    // Commit needs the context to release its references.
    assert!(!h.runtime.has_committed(o1));
    h.ctx.end_context();
    h.runtime.process_all();
    assert!(h.runtime.has_committed(o1));
    assert!(h.runtime.has_committed(o2));
    assert_eq!(h.ctx.outstanding_operations(), 0);
}

#[test]
fn read_after_write_verifies_producer_regions() {
    let h = Harness::new();
    let ra = h.region();
    let rb = h.region();

    h.ctx
        .issue_fill(FillLauncher::from_bytes(h.write_req(ra), &[1]))
        .unwrap();
    let o1 = h.ctx.last_op().unwrap();
    assert_eq!(h.runtime.probe(o1).unwrap().unverified_regions, 1);

    // A copy that reads Ra validates O1's output.
    h.ctx
        .issue_copy(CopyLauncher::new().add_copy(h.read_req(ra), h.write_req(rb)))
        .unwrap();
    let o2 = h.ctx.last_op().unwrap();
    assert!(h.runtime.probe(o2).unwrap().incoming.contains(&o1));

    h.runtime.process_all();
    let p1 = h.runtime.probe(o1).unwrap();
    assert!(p1.completed);
    assert_eq!(p1.unverified_regions, 0, "verification did not arrive");
    assert_eq!(p1.outstanding_commit_deps, 0);

    h.ctx.end_context();
    h.runtime.process_all();
    assert!(h.runtime.has_committed(o1));
}

#[test]
fn generation_bumps_by_one_at_commit() {
    let h = Harness::new();
    let region = h.region();

    h.ctx
        .issue_fill(FillLauncher::from_bytes(h.write_req(region), &[1]))
        .unwrap();
    let first = h.ctx.last_op().unwrap();
    h.finish();
    assert!(h.runtime.has_committed(first));
    assert!(h.runtime.probe(first).is_none(), "slot recycled");

    // The freed slot hosts the next fill at the next generation.
    let ctx2 = h.runtime.create_context(Vec::new());
    ctx2.issue_fill(FillLauncher::from_bytes(h.write_req(region), &[2]))
        .unwrap();
    let second = ctx2.last_op().unwrap();
    assert_eq!(second.slot(), first.slot());
    assert_eq!(second.gen(), first.gen() + 1);
}

#[test]
fn self_dependence_is_stale() {
    let h = Harness::new();
    let region = h.region();
    h.ctx
        .issue_fill(FillLauncher::from_bytes(h.write_req(region), &[1]))
        .unwrap();
    let key = h.ctx.last_op().unwrap();
    assert_eq!(
        h.runtime.register_dependence(key, key),
        RegistrationOutcome::Stale
    );
    assert!(h.runtime.probe(key).unwrap().incoming.is_empty());
}

#[test]
fn stale_registration_after_commit_is_pruned() {
    let h = Harness::new();
    let region = h.region();
    h.ctx
        .issue_fill(FillLauncher::from_bytes(h.write_req(region), &[1]))
        .unwrap();
    let old = h.ctx.last_op().unwrap();
    h.finish();
    assert!(h.runtime.has_committed(old));

    let ctx2 = h.runtime.create_context(Vec::new());
    ctx2.issue_fill(FillLauncher::from_bytes(h.write_req(region), &[2]))
        .unwrap();
    let fresh = ctx2.last_op().unwrap();
    // The old generation is gone; registering on it adds nothing.
    let outcome = h.runtime.register_dependence(fresh, old);
    assert!(matches!(
        outcome,
        RegistrationOutcome::Stale | RegistrationOutcome::AlreadyCommitted
    ));
    assert!(h.runtime.probe(fresh).unwrap().incoming.is_empty());
}

#[test]
fn inline_mapping_returns_a_deferred_region() {
    let h = Harness::new();
    let region = h.region();

    h.ctx
        .issue_fill(FillLauncher::from_bytes(h.write_req(region), &[7]))
        .unwrap();
    let physical = h
        .ctx
        .issue_inline_mapping(InlineLauncher::new(h.read_req(region)))
        .unwrap();
    assert!(physical.instance().is_none());
    assert!(!physical.ready_event().has_triggered());

    h.runtime.process_all();
    assert!(physical.ready_event().has_triggered());
    assert!(!physical.ready_event().is_poisoned());
    assert!(physical.instance().is_some(), "mapper placement not bound");
}

#[test]
fn quash_is_idempotent_and_poisons_consumers() {
    let h = Harness::new();
    let ra = h.region();
    let rb = h.region();

    let e1 = h
        .ctx
        .issue_fill(FillLauncher::from_bytes(h.write_req(ra), &[1]))
        .unwrap();
    let o1 = h.ctx.last_op().unwrap();
    let e2 = h
        .ctx
        .issue_copy(CopyLauncher::new().add_copy(h.read_req(ra), h.write_req(rb)))
        .unwrap();
    let o2 = h.ctx.last_op().unwrap();

    // Quash twice with the same generation; the second is a no-op.
    h.runtime.quash_operation(o1, false);
    h.runtime.quash_operation(o1, false);
    h.runtime.process_all();

    assert!(e1.is_poisoned(), "quashed op must poison completion");
    assert!(e2.is_poisoned(), "poison must travel the edge");
    assert!(h.runtime.probe(o2).unwrap().poisoned);
    assert!(!h.ctx.restart_requested());
}

#[test]
fn quash_with_restart_raises_the_context() {
    let h = Harness::new();
    let region = h.region();
    h.ctx
        .issue_fill(FillLauncher::from_bytes(h.write_req(region), &[1]))
        .unwrap();
    let key = h.ctx.last_op().unwrap();
    h.runtime.quash_operation(key, true);
    h.runtime.process_all();
    assert!(h.ctx.restart_requested());
    assert!(h.ctx.take_restart_request());
    assert!(!h.ctx.restart_requested());
}

#[test]
fn mapping_fence_orders_later_work() {
    let h = Harness::new();
    let ra = h.region();
    let rb = h.region();

    h.ctx
        .issue_fill(FillLauncher::from_bytes(h.write_req(ra), &[1]))
        .unwrap();
    let o1 = h.ctx.last_op().unwrap();
    let fence_event = h.ctx.issue_fence(FenceKind::Mapping);
    let fence = h.ctx.last_op().unwrap();
    assert_eq!(h.ctx.current_fence(), Some(fence));

    // The fence depends on the prior op; a later independent op depends
    // on the fence.
    assert!(h.runtime.probe(fence).unwrap().incoming.contains(&o1));
    h.ctx
        .issue_fill(FillLauncher::from_bytes(h.write_req(rb), &[2]))
        .unwrap();
    let o2 = h.ctx.last_op().unwrap();
    assert!(h.runtime.probe(o2).unwrap().incoming.contains(&fence));

    h.runtime.process_all();
    assert!(fence_event.has_triggered());
}

#[test]
fn execution_fence_completes_after_prior_ops() {
    let h = Harness::new();
    let region = h.region();
    let fill_event = h
        .ctx
        .issue_fill(FillLauncher::from_bytes(h.write_req(region), &[1]))
        .unwrap();
    let fence_event = h.ctx.issue_fence(FenceKind::Execution);

    let order = Arc::new(Mutex::new(Vec::new()));
    let record = |label: &'static str| {
        let order = Arc::clone(&order);
        move |_poison: bool| order.lock().unwrap().push(label)
    };
    fill_event.subscribe(record("fill"));
    fence_event.subscribe(record("fence"));

    h.runtime.process_all();
    assert_eq!(*order.lock().unwrap(), vec!["fill", "fence"]);
}

#[test]
fn zero_region_op_maps_immediately() {
    let h = Harness::new();
    // An empty context: the fence has no one to wait for.
    let event = h.ctx.issue_fence(FenceKind::Execution);
    let key = h.ctx.last_op().unwrap();
    assert_eq!(h.runtime.probe(key).unwrap().outstanding_mapping_deps, 0);
    h.runtime.process_all();
    assert!(event.has_triggered());
}

#[test]
fn frames_bound_in_flight_work() {
    let h = Harness::new();
    let region = h.region();
    for round in 0..6u8 {
        h.ctx
            .issue_fill(FillLauncher::from_bytes(h.write_req(region), &[round]))
            .unwrap();
        let frame_event = h.ctx.issue_frame();
        h.runtime.process_all();
        assert!(frame_event.has_triggered());
    }
    h.finish();
}

#[test]
fn deletion_defers_to_commit() {
    let h = Harness::new();
    let region = h.region();
    h.ctx
        .issue_fill(FillLauncher::from_bytes(h.write_req(region), &[1]))
        .unwrap();
    let fill = h.ctx.last_op().unwrap();
    let deletion_event = h.ctx.issue_deletion(DeletionKind::LogicalRegion(region));
    let deletion = h.ctx.last_op().unwrap();
    assert!(h.runtime.probe(deletion).unwrap().incoming.contains(&fill));

    h.runtime.process_all();
    assert!(deletion_event.has_triggered());
    // Completed but not yet committed: the tree still exists.
    assert!(!h.forest.tree_destroyed(region.tree));

    h.ctx.end_context();
    h.runtime.process_all();
    assert!(h.runtime.has_committed(deletion));
    assert!(h.forest.tree_destroyed(region.tree));
}

#[test]
fn privilege_check_rejects_unheld_requirements() {
    let h = Harness::new();
    let region = h.region();
    // A context granted read-only access must not launch a write.
    let restricted = h.runtime.create_context(vec![h.read_req(region)]);
    let err = restricted
        .issue_fill(FillLauncher::from_bytes(h.write_req(region), &[1]))
        .unwrap_err();
    assert_eq!(err.kind(), opgraph::ErrorKind::PrivilegeCheck);

    // Reading through an inline mapping is allowed.
    assert!(restricted
        .issue_inline_mapping(InlineLauncher::new(h.read_req(region)))
        .is_ok());
    restricted.end_context();
    h.runtime.process_all();
}

#[test]
fn aliased_requirements_are_rejected() {
    let h = Harness::new();
    let region = h.region();
    let err = h
        .ctx
        .issue_copy(CopyLauncher::new().add_copy(h.read_req(region), h.write_req(region)))
        .unwrap_err();
    assert_eq!(err.kind(), opgraph::ErrorKind::AliasedRequirements);
}
