//! Trace capture and replay tests.

mod common;

use common::Harness;
use opgraph::forest::RegionForest;
use opgraph::launcher::{CopyLauncher, FillLauncher, InlineLauncher};
use opgraph::types::TraceId;
use opgraph::OpKey;

/// Issues the traced sequence {O1 writes Ra, O2 reads Ra, O3 writes Rb}
/// and returns the three keys.
fn issue_sequence(
    h: &Harness,
    ra: opgraph::LogicalRegion,
    rb: opgraph::LogicalRegion,
) -> (OpKey, OpKey, OpKey) {
    h.ctx
        .issue_fill(FillLauncher::from_bytes(h.write_req(ra), &[1]))
        .unwrap();
    let o1 = h.ctx.last_op().unwrap();
    h.ctx
        .issue_inline_mapping(InlineLauncher::new(h.read_req(ra)))
        .unwrap();
    let o2 = h.ctx.last_op().unwrap();
    h.ctx
        .issue_fill(FillLauncher::from_bytes(h.write_req(rb), &[2]))
        .unwrap();
    let o3 = h.ctx.last_op().unwrap();
    (o1, o2, o3)
}

#[test]
fn replay_reproduces_edges_and_bypasses_the_analyzer() {
    let h = Harness::new();
    let ra = h.region();
    let rb = h.region();
    let tid = TraceId(1);

    // Capture round.
    h.ctx.begin_trace(tid);
    let (c1, c2, c3) = issue_sequence(&h, ra, rb);
    h.ctx.end_trace(tid);

    assert!(h.runtime.probe(c2).unwrap().incoming.contains(&c1));
    assert!(h.runtime.probe(c3).unwrap().incoming.is_empty());
    h.runtime.process_all();

    // Replay round: identical launchers, no analyzer walks.
    let analyzed_during_capture = h.forest.analysis_count();
    h.ctx.begin_trace(tid);
    let (r1, r2, r3) = issue_sequence(&h, ra, rb);
    h.ctx.end_trace(tid);

    assert_eq!(
        h.forest.analysis_count(),
        analyzed_during_capture,
        "replay must not re-run dependence analysis"
    );
    let p2 = h.runtime.probe(r2).unwrap();
    assert!(p2.incoming.contains(&r1), "memoized edge must rebind");
    // The replay round's edges reference the new generation, not the
    // captured one.
    assert!(!p2.incoming.contains(&c1));
    let p3 = h.runtime.probe(r3).unwrap();
    // O3 carries no data edge; only the trace-complete fence orders it.
    assert!(!p3.incoming.contains(&r1));
    assert!(!p3.incoming.contains(&r2));

    h.runtime.process_all();
    h.finish();
}

#[test]
fn trace_complete_becomes_the_current_fence() {
    let h = Harness::new();
    let ra = h.region();
    let rb = h.region();
    let tid = TraceId(2);

    h.ctx.begin_trace(tid);
    issue_sequence(&h, ra, rb);
    h.ctx.end_trace(tid);
    h.runtime.process_all();

    h.ctx.begin_trace(tid);
    issue_sequence(&h, ra, rb);
    h.ctx.end_trace(tid);
    let fence = h.ctx.last_op().unwrap();
    assert_eq!(h.ctx.current_fence(), Some(fence));

    // An op after the replay orders behind the trace-complete fence.
    h.ctx
        .issue_fill(FillLauncher::from_bytes(h.write_req(ra), &[9]))
        .unwrap();
    let after = h.ctx.last_op().unwrap();
    assert!(h.runtime.probe(after).unwrap().incoming.contains(&fence));
    h.runtime.process_all();
    h.finish();
}

#[test]
fn diverging_replay_falls_back_to_analysis() {
    let h = Harness::new();
    let ra = h.region();
    let rb = h.region();
    let tid = TraceId(3);

    h.ctx.begin_trace(tid);
    issue_sequence(&h, ra, rb);
    h.ctx.end_trace(tid);
    h.runtime.process_all();

    // Replay issues one extra op beyond the capture: the overflow op
    // cannot rebind a trace position and re-derives its edges.
    let before = h.forest.analysis_count();
    h.ctx.begin_trace(tid);
    issue_sequence(&h, ra, rb);
    h.ctx
        .issue_copy(CopyLauncher::new().add_copy(h.read_req(ra), h.write_req(rb)))
        .unwrap();
    let extra = h.ctx.last_op().unwrap();
    h.ctx.end_trace(tid);

    assert!(
        h.forest.analysis_count() > before,
        "overflow op must re-run analysis"
    );
    // The re-derived edges are real graph edges.
    assert!(!h.runtime.probe(extra).unwrap().incoming.is_empty());
    h.runtime.process_all();
    h.finish();
}

#[test]
fn capture_matches_untraced_edges() {
    // The same sequence issued without tracing produces the same edge
    // shape the capture recorded.
    let traced = Harness::new();
    let t_ra = traced.region();
    let t_rb = traced.region();
    traced.ctx.begin_trace(TraceId(4));
    let (t1, t2, t3) = issue_sequence(&traced, t_ra, t_rb);
    traced.ctx.end_trace(TraceId(4));

    let plain = Harness::new();
    let p_ra = plain.region();
    let p_rb = plain.region();
    let (p1, p2, p3) = issue_sequence(&plain, p_ra, p_rb);

    let t_edges = traced.runtime.probe(t2).unwrap().incoming;
    let p_edges = plain.runtime.probe(p2).unwrap().incoming;
    assert_eq!(t_edges, vec![t1]);
    assert_eq!(p_edges, vec![p1]);
    assert!(traced.runtime.probe(t3).unwrap().incoming.is_empty());
    assert!(plain.runtime.probe(p3).unwrap().incoming.is_empty());

    traced.runtime.process_all();
    plain.runtime.process_all();
}
