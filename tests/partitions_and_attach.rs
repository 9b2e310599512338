//! Partition, attach/detach, collective, and close-operation tests.

mod common;

use common::Harness;
use opgraph::forest::RegionForest;
use opgraph::launcher::{AttachLauncher, FillLauncher};
use opgraph::op::{DependentPartitionKind, PartitionThunk};
use opgraph::types::DomainPoint;
use opgraph::{DynamicCollective, FileMode, OpKind};

#[test]
fn pending_partition_exposes_a_ready_handle() {
    let h = Harness::new();
    let region = h.region();
    let partition = h.forest.create_partition(region, true);
    let ready = h.ctx.issue_pending_partition(PartitionThunk::Equal {
        partition,
        granularity: 16,
    });
    assert!(!ready.has_triggered());
    h.runtime.process_all();
    assert!(ready.has_triggered());
    assert!(!ready.is_poisoned());
    h.finish();
}

#[test]
fn weighted_and_set_thunks_complete() {
    let h = Harness::new();
    let region = h.region();
    let p1 = h.forest.create_partition(region, true);
    let p2 = h.forest.create_partition(region, false);
    let thunks = vec![
        PartitionThunk::Weighted {
            partition: p1,
            granularity: 1,
            weights: [(DomainPoint::one_dim(0), 3), (DomainPoint::one_dim(1), 1)]
                .into_iter()
                .collect(),
        },
        PartitionThunk::Union {
            partition: p1,
            handle1: p1,
            handle2: p2,
        },
        PartitionThunk::Intersection {
            partition: p1,
            handle1: p1,
            handle2: p2,
        },
        PartitionThunk::Difference {
            partition: p1,
            handle1: p1,
            handle2: p2,
        },
        PartitionThunk::CrossProduct {
            base: p1,
            source: p2,
        },
        PartitionThunk::ComputePendingSpace {
            target: region.index_space,
            is_union: true,
            spaces: vec![region.index_space],
            handle: None,
        },
        PartitionThunk::ComputePendingDifference {
            target: region.index_space,
            initial: region.index_space,
            spaces: vec![region.index_space],
        },
    ];
    let events: Vec<_> = thunks
        .into_iter()
        .map(|thunk| h.ctx.issue_pending_partition(thunk))
        .collect();
    h.runtime.process_all();
    for event in events {
        assert!(event.has_triggered());
        assert!(!event.is_poisoned());
    }
    h.finish();
}

#[test]
fn failed_partition_computation_poisons_the_handle() {
    let h = Harness::new();
    let region = h.region();
    let partition = h.forest.create_partition(region, true);
    h.forest.fail_partition_computations(true);

    let ready = h.ctx.issue_pending_partition(PartitionThunk::Equal {
        partition,
        granularity: 4,
    });
    let key = h.ctx.last_op().unwrap();
    h.runtime.process_all();

    assert!(ready.is_poisoned(), "handle ready must carry the failure");
    assert!(h.runtime.probe(key).unwrap().poisoned);
    h.forest.fail_partition_computations(false);
}

#[test]
fn dependent_partition_runs_like_a_mapped_op() {
    let h = Harness::new();
    let region = h.region();
    let partition = h.forest.create_partition(region, true);

    h.ctx
        .issue_fill(FillLauncher::from_bytes(h.write_req(region), &[1]))
        .unwrap();
    let writer = h.ctx.last_op().unwrap();

    let ready = h
        .ctx
        .issue_dependent_partition(
            DependentPartitionKind::ByField,
            h.read_req(region),
            partition,
            None,
        )
        .unwrap();
    let key = h.ctx.last_op().unwrap();
    // Reading the color field orders the computation behind the writer.
    assert!(h.runtime.probe(key).unwrap().incoming.contains(&writer));

    h.runtime.process_all();
    assert!(ready.has_triggered());
    assert!(!ready.is_poisoned());
    h.finish();
}

#[test]
fn attach_then_detach_order_through_the_graph() {
    let h = Harness::new();
    let region = h.region();
    let fields = opgraph::FieldMask::single(0);

    let physical = h
        .ctx
        .issue_attach(
            AttachLauncher::new(h.write_req(region), "/data/checkpoint.h5", FileMode::ReadWrite)
                .with_field(0, "temperature"),
        )
        .unwrap();
    let attach = h.ctx.last_op().unwrap();

    // A consumer of the attached data.
    h.ctx
        .issue_inline_mapping(opgraph::launcher::InlineLauncher::new(h.read_req(region)))
        .unwrap();
    let reader = h.ctx.last_op().unwrap();
    assert!(h.runtime.probe(reader).unwrap().incoming.contains(&attach));

    // Detach orders behind both the attach and its consumer.
    let detach_event = h.ctx.issue_detach(&physical, fields).unwrap();
    let detach = h.ctx.last_op().unwrap();
    let detach_probe = h.runtime.probe(detach).unwrap();
    assert!(detach_probe.incoming.contains(&attach));
    assert!(detach_probe.incoming.contains(&reader));

    h.runtime.process_all();
    assert!(physical.ready_event().has_triggered());
    assert!(physical.instance().is_some(), "file instance bound");
    assert!(detach_event.has_triggered());
    h.finish();
}

#[test]
fn attach_offsets_come_from_the_file_memory() {
    let h = Harness::new();
    let before = {
        let (_, offset) = h.forest.file_memory().create_instance(64);
        offset
    };
    let region = h.region();
    h.ctx
        .issue_attach(
            AttachLauncher::new(h.write_req(region), "/data/a.h5", FileMode::Create)
                .with_field(0, "a"),
        )
        .unwrap();
    h.runtime.process_all();
    // The attach allocated past the earlier instance; offsets never
    // recycle.
    let (instance, relative) = h.forest.file_memory().instance_at(before).unwrap();
    assert_eq!(relative, 0);
    let _ = instance;
    h.finish();
}

#[test]
fn dynamic_collective_reads_into_a_future() {
    let h = Harness::new();
    let collective = DynamicCollective::new(3);
    let future = h.ctx.issue_dynamic_collective(collective.clone());
    h.runtime.process_all();
    assert!(!future.is_ready());

    collective.arrive(10);
    collective.arrive(-3);
    collective.arrive(5);
    h.runtime.process_all();

    assert!(future.is_ready());
    let bytes = future.get().unwrap();
    assert_eq!(i64::from_le_bytes(bytes.as_ref().try_into().unwrap()), 12);
    h.finish();
}

#[test]
fn direct_access_after_partition_access_issues_an_inter_close() {
    let h = Harness::new();
    let region = h.region();
    let partition = h.forest.create_partition(region, true);

    // Write through the partition, then touch the region directly.
    h.ctx
        .issue_fill(FillLauncher::from_bytes(
            h.write_req(region).through_partition(partition),
            &[1],
        ))
        .unwrap();
    let through = h.ctx.last_op().unwrap();
    h.ctx
        .issue_fill(FillLauncher::from_bytes(h.write_req(region), &[2]))
        .unwrap();
    let direct = h.ctx.last_op().unwrap();

    // The close interposed between them: the partition user feeds the
    // close, and the direct access feeds off the close.
    let direct_probe = h.runtime.probe(direct).unwrap();
    assert!(
        !direct_probe.incoming.contains(&through),
        "direct access orders through the close, not the raw user"
    );
    let close = direct_probe
        .incoming
        .iter()
        .copied()
        .find(|key| {
            h.runtime
                .probe(*key)
                .is_some_and(|p| p.kind == OpKind::InterClose)
        })
        .expect("an inter-close must be interposed");
    let close_probe = h.runtime.probe(close).unwrap();
    assert!(close_probe.incoming.contains(&through));

    h.runtime.process_all();
    h.finish();
}

#[test]
fn context_teardown_issues_post_closes() {
    let h = Harness::new();
    let region = h.region();
    h.ctx
        .issue_fill(FillLauncher::from_bytes(h.write_req(region), &[1]))
        .unwrap();
    let writer = h.ctx.last_op().unwrap();
    h.runtime.process_all();
    assert_eq!(h.forest.user_count(region.tree), 1);

    h.ctx.end_context();
    // The post close drained the logical state and ordered behind the
    // writer; committing everything empties the context.
    assert_eq!(h.forest.user_count(region.tree), 0);
    h.runtime.process_all();
    assert!(h.runtime.has_committed(writer));
    assert_eq!(h.ctx.outstanding_operations(), 0);
}
