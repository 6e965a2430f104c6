mod support;

use kiln_buildlog::BuildLog;
use kiln_builder::{BuildConfig, BuildStatus, Builder};
use kiln_depslog::DepsLog;
use kiln_events::NullSink;
use kiln_fs::FakeDisk;
use kiln_graph::{NodeId, State};
use kiln_manifest::{materialize, ManifestData};
use std::path::Path;

use support::{edge, never_interrupted, rule, FakeRunner};

// Independent failures don't stop sibling work, and the run reports every
// failure without claiming the whole build succeeded.
#[test]
fn independent_failures_all_run_and_are_all_reported() {
    let disk = FakeDisk::new();
    disk.seed_file(Path::new("a_in"), &b"x"[..], 1);
    disk.seed_file(Path::new("b_in"), &b"x"[..], 1);
    disk.seed_file(Path::new("c_in"), &b"x"[..], 1);
    disk.seed_file(Path::new("d_in"), &b"x"[..], 1);
    let mut state = State::new();
    let data = ManifestData {
        rules: vec![rule("fail", "false"), rule("ok", "cat $in > $out")],
        pools: vec![],
        edges: vec![
            edge("fail", &["a_out"], &["a_in"]),
            edge("fail", &["b_out"], &["b_in"]),
            edge("fail", &["c_out"], &["c_in"]),
            edge("ok", &["d_out"], &["d_in"]),
        ],
        defaults: vec![],
    };
    materialize(&data, &mut state).unwrap();
    let phony = state.lookup_rule("phony").unwrap();
    let targets: Vec<NodeId> = ["a_out", "b_out", "c_out", "d_out"]
        .iter()
        .map(|n| state.lookup_node(n).unwrap())
        .collect();

    let mut build_log = BuildLog::new();
    let mut deps_log = DepsLog::new();
    let mut builder = Builder::new(phony, BuildConfig { parallelism: 4, failures_allowed: 3, dry_run: false });
    let mut runner = FakeRunner::new(&disk, 4);
    let summary = builder
        .build(&mut state, &disk, &mut runner, &mut build_log, &mut deps_log, &NullSink, &targets, &never_interrupted)
        .unwrap();

    assert_eq!(summary.status, BuildStatus::Failure);
    assert_eq!(summary.failures, 3);
    assert_eq!(runner.commands_started, 4);
}
