mod support;

use kiln_buildlog::BuildLog;
use kiln_builder::{BuildConfig, BuildStatus, Builder};
use kiln_depslog::DepsLog;
use kiln_events::NullSink;
use kiln_fs::FakeDisk;
use kiln_graph::{NodeId, State};
use kiln_manifest::{materialize, ManifestData, PoolDecl};
use std::path::Path;

use support::{edge_in_pool, never_interrupted, rule, FakeRunner};

// Three independent edges bound to a depth-1 pool never run concurrently
// even though the runner itself has plenty of spare capacity.
#[test]
fn pool_depth_one_serializes_independent_edges_even_under_runner_capacity() {
    let disk = FakeDisk::new();
    disk.seed_file(Path::new("a_in"), &b"x"[..], 1);
    disk.seed_file(Path::new("b_in"), &b"x"[..], 1);
    disk.seed_file(Path::new("c_in"), &b"x"[..], 1);

    let mut state = State::new();
    let data = ManifestData {
        rules: vec![rule("cp", "cp $in $out")],
        pools: vec![PoolDecl { name: "p".into(), depth: 1 }],
        edges: vec![
            edge_in_pool("cp", &["a_out"], &["a_in"], "p"),
            edge_in_pool("cp", &["b_out"], &["b_in"], "p"),
            edge_in_pool("cp", &["c_out"], &["c_in"], "p"),
        ],
        defaults: vec![],
    };
    materialize(&data, &mut state).unwrap();
    let phony = state.lookup_rule("phony").unwrap();
    let targets: Vec<NodeId> = ["a_out", "b_out", "c_out"]
        .iter()
        .map(|n| state.lookup_node(n).unwrap())
        .collect();

    let mut build_log = BuildLog::new();
    let mut deps_log = DepsLog::new();
    let mut builder = Builder::new(phony, BuildConfig { parallelism: 3, failures_allowed: 1, dry_run: false });
    // Runner capacity of 3 ensures the pool, not the runner, is what
    // serializes these edges.
    let mut runner = FakeRunner::new(&disk, 3);
    let summary = builder
        .build(&mut state, &disk, &mut runner, &mut build_log, &mut deps_log, &NullSink, &targets, &never_interrupted)
        .unwrap();

    assert_eq!(summary.status, BuildStatus::Success);
    assert_eq!(runner.commands_started, 3);
    assert_eq!(runner.max_active, 1);
}
