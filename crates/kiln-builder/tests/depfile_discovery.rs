mod support;

use kiln_buildlog::BuildLog;
use kiln_builder::{BuildConfig, Builder};
use kiln_depslog::DepsLog;
use kiln_events::NullSink;
use kiln_fs::{DiskInterface, FakeDisk};
use kiln_graph::State;
use kiln_manifest::materialize;
use std::path::Path;

use support::{edge, never_interrupted, rule, FakeRunner};

// A gcc-style depfile discovers a new implicit input, and touching it
// afterwards triggers exactly one further rebuild.
#[test]
fn depfile_discovers_implicit_input_and_it_participates_in_dirtiness() {
    let disk = FakeDisk::new();
    disk.seed_file(Path::new("foo.c"), &b"x"[..], 1);
    disk.seed_file(Path::new("bar.h"), &b"y"[..], 1);
    disk.seed_file(Path::new("foo.o.d"), &b"foo.o: bar.h\n"[..], 1);

    let mut state = State::new();
    let mut decl = rule("cc", "cp foo.c foo.o");
    decl.bindings.insert("deps".into(), "gcc".into());
    decl.bindings.insert("depfile".into(), "foo.o.d".into());
    let data = kiln_manifest::ManifestData {
        rules: vec![decl],
        pools: vec![],
        edges: vec![edge("cc", &["foo.o"], &["foo.c"])],
        defaults: vec![],
    };
    materialize(&data, &mut state).unwrap();
    let phony = state.lookup_rule("phony").unwrap();
    let target = state.lookup_node("foo.o").unwrap();

    let mut build_log = BuildLog::new();
    let mut deps_log = DepsLog::new();
    let mut builder = Builder::new(phony, BuildConfig::default());
    let mut runner = FakeRunner::new(&disk, 1);
    let summary = builder
        .build(&mut state, &disk, &mut runner, &mut build_log, &mut deps_log, &NullSink, &[target], &never_interrupted)
        .unwrap();
    assert_eq!(summary.commands_run, 1);
    assert_eq!(runner.commands_started, 1);
    // the depfile is consumed and removed after ingestion.
    assert_eq!(disk.stat(Path::new("foo.o.d")).unwrap(), kiln_fs::Stat::Missing);
    assert!(!summary.log_appends.deps_log_bytes.is_empty());

    let bar_h = state.lookup_node("bar.h").unwrap();
    assert!(state.edge(state.node(target).in_edge.unwrap()).inputs.implicit().contains(&bar_h));

    // fold both logs forward, as the CLI does between invocations.
    let mut text = BuildLog::header();
    text.push_str(&summary.log_appends.build_log_text);
    let mut build_log2 = BuildLog::from_text(&text);

    let mut deps_bytes = kiln_depslog::MAGIC.to_vec();
    deps_bytes.extend_from_slice(&kiln_depslog::VERSION.to_le_bytes());
    deps_bytes.extend_from_slice(&summary.log_appends.deps_log_bytes);
    let mut deps_log2 = DepsLog::from_bytes(&deps_bytes);

    // bar.h changes; foo.o must be rebuilt even though foo.c did not.
    disk.seed_file(Path::new("bar.h"), &b"z"[..], 500);

    let mut state2 = State::new();
    materialize(&data, &mut state2).unwrap();
    let target2 = state2.lookup_node("foo.o").unwrap();
    let mut builder2 = Builder::new(phony, BuildConfig::default());
    let mut runner2 = FakeRunner::new(&disk, 1);
    let summary2 = builder2
        .build(&mut state2, &disk, &mut runner2, &mut build_log2, &mut deps_log2, &NullSink, &[target2], &never_interrupted)
        .unwrap();
    assert_eq!(runner2.commands_started, 1);
}
