//! Worker-thread smoke test: the queue drains concurrently and the graph
//! still quiesces correctly.

mod common;

use common::Harness;
use opgraph::launcher::FillLauncher;

#[test]
fn workers_drain_chained_submissions() {
    let h = Harness::new();
    let pool = h.runtime.spawn_workers(3);

    let mut completions = Vec::new();
    for _ in 0..8 {
        let region = h.region();
        let req = h.write_req(region);
        for value in 0..16u8 {
            completions.push(
                h.ctx
                    .issue_fill(FillLauncher::from_bytes(req.clone(), &[value]))
                    .unwrap(),
            );
        }
    }
    for completion in &completions {
        assert!(!completion.wait(), "no fill may be poisoned");
    }
    pool.shutdown();

    h.ctx.end_context();
    h.runtime.process_all();
    assert_eq!(h.ctx.outstanding_operations(), 0);
}
