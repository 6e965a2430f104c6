mod support;

use kiln_buildlog::BuildLog;
use kiln_builder::{BuildConfig, BuildStatus, Builder};
use kiln_depslog::DepsLog;
use kiln_events::NullSink;
use kiln_fs::FakeDisk;
use kiln_graph::State;
use kiln_manifest::{materialize, ManifestData};
use std::path::Path;

use support::{edge, never_interrupted, rule, FakeRunner};

// A dyndep file discovered mid-build adds a new implicit output to its
// producing edge before that edge's own command_line is computed.
#[test]
fn dyndep_file_adds_implicit_output_before_the_edge_that_declared_it_runs() {
    let disk = FakeDisk::new();
    disk.seed_file(
        Path::new("dd-in"),
        &br#"{"version":1,"entries":[{"output":"tmp","implicit_outputs":["tmp.imp"]}]}"#[..],
        1,
    );

    let mut state = State::new();
    let mut tmp_edge = edge("touch", &["tmp"], &[]);
    tmp_edge.order_only_inputs = vec!["dd".to_string()];
    tmp_edge.bindings.insert("dyndep".to_string(), "dd".to_string());
    let data = ManifestData {
        rules: vec![rule("cp", "cp dd-in dd"), rule("touch", "touch $out")],
        pools: vec![],
        edges: vec![edge("cp", &["dd"], &["dd-in"]), tmp_edge],
        defaults: vec![],
    };
    materialize(&data, &mut state).unwrap();
    let phony = state.lookup_rule("phony").unwrap();
    let target = state.lookup_node("tmp").unwrap();
    let dd = state.lookup_node("dd").unwrap();
    assert!(state.node(dd).dyndep_pending);

    let mut build_log = BuildLog::new();
    let mut deps_log = DepsLog::new();
    let mut builder = Builder::new(phony, BuildConfig { parallelism: 1, failures_allowed: 1, dry_run: false });
    let mut runner = FakeRunner::new(&disk, 1);
    let summary = builder
        .build(&mut state, &disk, &mut runner, &mut build_log, &mut deps_log, &NullSink, &[target], &never_interrupted)
        .unwrap();

    assert_eq!(summary.status, BuildStatus::Success);
    assert_eq!(runner.commands_started, 2);
    assert!(!state.node(dd).dyndep_pending);

    let tmp_imp = state.lookup_node("tmp.imp").expect("dyndep should have registered tmp.imp");
    let producing_edge = state.node(target).in_edge.unwrap();
    assert!(state.edge(producing_edge).outputs.paths.contains(&tmp_imp));
}
