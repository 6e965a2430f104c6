mod support;

use kiln_buildlog::BuildLog;
use kiln_builder::{BuildConfig, BuildStatus, Builder};
use kiln_depslog::DepsLog;
use kiln_events::NullSink;
use kiln_fs::FakeDisk;
use kiln_graph::State;
use kiln_manifest::materialize;
use std::path::Path;

use support::{edge, never_interrupted, rule, FakeRunner};

// A restat rule whose command leaves its output's mtime untouched must not
// wake its dependents: `stamp` is rebuilt (its own input changed) but the
// stamp file itself compares equal before/after, so `combined` is never
// re-run.
#[test]
fn restat_rule_with_unchanged_output_cancels_its_dependent() {
    let disk = FakeDisk::new();
    disk.seed_file(Path::new("in"), &b"v1"[..], 1);
    // Already up to date at mtime 1, so the restat edge has nothing to do
    // on the first build.
    disk.seed_file(Path::new("stamp"), &b"s"[..], 1);
    disk.seed_file(Path::new("other"), &b"o"[..], 1);

    let mut state = State::new();
    let mut restat_decl = rule("restat_noop", "true");
    restat_decl.bindings.insert("restat".into(), "1".into());
    let data = kiln_manifest::ManifestData {
        rules: vec![restat_decl, rule("cat", "cat $in > $out")],
        pools: vec![],
        edges: vec![
            edge("restat_noop", &["stamp"], &["in"]),
            edge("cat", &["combined"], &["stamp", "other"]),
        ],
        defaults: vec!["combined".to_string()],
    };
    materialize(&data, &mut state).unwrap();
    let phony = state.lookup_rule("phony").unwrap();
    let target = state.lookup_node("combined").unwrap();

    let mut build_log = BuildLog::new();
    let mut deps_log = DepsLog::new();
    let mut builder = Builder::new(phony, BuildConfig { parallelism: 1, failures_allowed: 1, dry_run: false });
    let mut runner = FakeRunner::new(&disk, 1);
    let summary = builder
        .build(&mut state, &disk, &mut runner, &mut build_log, &mut deps_log, &NullSink, &[target], &never_interrupted)
        .unwrap();
    assert_eq!(summary.status, BuildStatus::Success);
    // `stamp` is already up to date; only `combined` (missing) needs to run.
    assert_eq!(runner.commands_started, 1);

    let mut text = BuildLog::header();
    text.push_str(&summary.log_appends.build_log_text);
    let mut build_log2 = BuildLog::from_text(&text);
    let mut deps_log2 = DepsLog::new();

    // `in` changes, so `stamp`'s producing edge must run again, but `true`
    // never rewrites the file: its mtime stays exactly where it was.
    disk.seed_file(Path::new("in"), &b"v2"[..], 3);

    let mut state2 = State::new();
    materialize(&data, &mut state2).unwrap();
    let target2 = state2.lookup_node("combined").unwrap();
    let mut builder2 = Builder::new(phony, BuildConfig { parallelism: 1, failures_allowed: 1, dry_run: false });
    let mut runner2 = FakeRunner::new(&disk, 1);
    let summary2 = builder2
        .build(&mut state2, &disk, &mut runner2, &mut build_log2, &mut deps_log2, &NullSink, &[target2], &never_interrupted)
        .unwrap();
    assert_eq!(summary2.status, BuildStatus::Success);
    // only `stamp`'s own edge actually runs; `combined` is cancelled after
    // the recheck finds `stamp` unchanged.
    assert_eq!(runner2.commands_started, 1);
}
