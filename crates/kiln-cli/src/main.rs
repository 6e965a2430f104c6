//! Command-line front end: wires manifest loading, log persistence, and the
//! orchestrator into a runnable binary. The split mirrors the teacher's own
//! `ox-bin` — a thin `Args`/startup shell around core crates that do the
//! actual work, logging configured once up front and never touched again.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use kiln_builder::{BuildConfig, BuildStatus, Builder};
use kiln_buildlog::BuildLog;
use kiln_depslog::DepsLog;
use kiln_events::LineSink;
use kiln_fs::RealDisk;
use kiln_graph::{NodeId, Pool, State};
use kiln_manifest::{JsonManifestSource, ManifestData, ManifestSource};
use kiln_path::CanonicalPath;
use kiln_runner::SubprocessRunner;
use serde::Deserialize;

#[derive(Parser, Debug)]
#[command(name = "kiln", version, about = "Rebuilds exactly what changed.")]
struct Args {
    /// Targets to build. Defaults to the manifest's declared defaults.
    targets: Vec<String>,

    /// Path to the build manifest.
    #[arg(short = 'f', long, default_value = "build.json")]
    manifest: PathBuf,

    /// Explicit config file, bypassing discovery.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Maximum number of commands to run in parallel.
    #[arg(short = 'j', long)]
    jobs: Option<usize>,

    /// Keep going until N command failures (0 means unlimited).
    #[arg(short = 'k', long)]
    keep_going: Option<usize>,

    /// Dry run: report what would build without running anything.
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Raise logging verbosity when RUST_LOG isn't set.
    #[arg(short = 'v', long)]
    verbose: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BuildSection {
    parallelism: Option<usize>,
    failures_allowed: Option<usize>,
    verbose: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PoolSection {
    depth: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    build: BuildSection,
    pools: HashMap<String, PoolSection>,
}

#[derive(Debug, Default)]
struct Config {
    jobs: Option<usize>,
    failures_allowed: Option<usize>,
    verbose: bool,
    pools: HashMap<String, u32>,
}

fn discover_config() -> PathBuf {
    let local = PathBuf::from("kiln.toml");
    if local.is_file() {
        return local;
    }
    if let Some(dir) = dirs::config_dir() {
        let candidate = dir.join("kiln").join("kiln.toml");
        if candidate.is_file() {
            return candidate;
        }
    }
    local
}

fn load_config(path: Option<PathBuf>) -> Config {
    let path = path.unwrap_or_else(discover_config);
    let text = match std::fs::read_to_string(&path) {
        Ok(t) => t,
        Err(_) => return Config::default(),
    };
    match toml::from_str::<ConfigFile>(&text) {
        Ok(parsed) => Config {
            jobs: parsed.build.parallelism,
            failures_allowed: parsed.build.failures_allowed,
            verbose: parsed.build.verbose.unwrap_or(false),
            pools: parsed
                .pools
                .into_iter()
                .map(|(name, section)| (name, section.depth))
                .collect(),
        },
        Err(e) => {
            tracing::warn!(target: "config", path = %path.display(), error = %e, "ignoring unparseable config");
            Config::default()
        }
    }
}

fn configure_logging(verbose: bool) -> tracing_appender::non_blocking::WorkerGuard {
    let _ = std::fs::remove_file("kiln.log");
    let file_appender = tracing_appender::rolling::never(".", "kiln.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let filter = if verbose && std::env::var_os("RUST_LOG").is_none() {
        tracing_subscriber::EnvFilter::new("kiln=debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env()
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_ansi(false)
        .try_init();
    guard
}

/// Registers `kiln.toml`'s `[pools.<name>]` table into `state`, skipping any
/// name the manifest itself declares — manifest pools always win, this table
/// only fills in defaults for pools the manifest never mentions.
fn register_config_pools(state: &mut State, manifest: &ManifestData, config: &Config) {
    for (name, depth) in &config.pools {
        if manifest.pools.iter().any(|p| &p.name == name) {
            continue;
        }
        if state.lookup_pool(name).is_some() {
            continue;
        }
        state.add_pool(Pool::new(name.clone(), *depth));
    }
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigint(_signum: i32) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

#[cfg(unix)]
fn install_sigint_handler() {
    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as usize);
    }
}

#[cfg(not(unix))]
fn install_sigint_handler() {}

fn load_build_log(path: &Path) -> BuildLog {
    match std::fs::read_to_string(path) {
        Ok(text) => BuildLog::from_text(&text),
        Err(_) => BuildLog::new(),
    }
}

fn persist_build_log(path: &Path, log: &BuildLog, appended: &str) -> Result<()> {
    if log.needs_compaction() {
        std::fs::write(path, log.compact()).context("writing compacted build log")
    } else {
        let mut text = std::fs::read_to_string(path).unwrap_or_else(|_| BuildLog::header());
        text.push_str(appended);
        std::fs::write(path, text).context("appending to build log")
    }
}

fn load_deps_log(path: &Path) -> DepsLog {
    match std::fs::read(path) {
        Ok(bytes) => DepsLog::from_bytes(&bytes),
        Err(_) => DepsLog::new(),
    }
}

fn persist_deps_log(path: &Path, log: &DepsLog, appended: &[u8]) -> Result<()> {
    if log.needs_compaction() {
        std::fs::write(path, log.compact()).context("writing compacted deps log")
    } else {
        let mut bytes = std::fs::read(path).unwrap_or_else(|_| {
            let mut header = kiln_depslog::MAGIC.to_vec();
            header.write_all(&kiln_depslog::VERSION.to_le_bytes()).ok();
            header
        });
        bytes.extend_from_slice(appended);
        std::fs::write(path, bytes).context("appending to deps log")
    }
}

fn resolve_targets(state: &mut State, raw: &[String], defaults: &[NodeId]) -> Result<Vec<NodeId>> {
    if raw.is_empty() {
        return Ok(defaults.to_vec());
    }
    raw.iter()
        .map(|t| {
            let path = CanonicalPath::canonicalize(t)
                .with_context(|| format!("target path '{t}' is not valid"))?;
            Ok(state.get_or_add_node(path))
        })
        .collect()
}

fn run(args: Args, config: Config) -> Result<BuildStatus> {
    install_sigint_handler();

    let manifest = JsonManifestSource::new(&args.manifest)
        .load()
        .with_context(|| format!("loading manifest {}", args.manifest.display()))?;

    let mut state = State::new();
    register_config_pools(&mut state, &manifest, &config);
    let defaults = kiln_manifest::materialize(&manifest, &mut state)
        .context("materializing manifest into the build graph")?;
    let phony_rule = state
        .lookup_rule(kiln_manifest::PHONY_RULE_NAME)
        .expect("materialize always registers the phony rule");

    let targets = resolve_targets(&mut state, &args.targets, &defaults)?;
    if targets.is_empty() {
        anyhow::bail!("no targets given and the manifest declares no defaults");
    }

    let build_log_path = Path::new(".kiln_log");
    let deps_log_path = Path::new(".kiln_deps");
    let mut build_log = load_build_log(build_log_path);
    let mut deps_log = load_deps_log(deps_log_path);

    let jobs = args.jobs.or(config.jobs).unwrap_or(1);
    let keep_going = args.keep_going.or(config.failures_allowed).unwrap_or(1);
    let failures_allowed = if keep_going == 0 { usize::MAX } else { keep_going };
    let build_config = BuildConfig {
        parallelism: jobs.max(1),
        failures_allowed,
        dry_run: args.dry_run,
    };

    let disk = RealDisk::new();
    let mut runner = SubprocessRunner::new(build_config.parallelism);
    let sink = LineSink;
    let mut builder = Builder::new(phony_rule, build_config);

    let summary = builder.build(
        &mut state,
        &disk,
        &mut runner,
        &mut build_log,
        &mut deps_log,
        &sink,
        &targets,
        &|| INTERRUPTED.load(Ordering::SeqCst),
    )?;

    persist_build_log(
        build_log_path,
        &build_log,
        &summary.log_appends.build_log_text,
    )?;
    persist_deps_log(deps_log_path, &deps_log, &summary.log_appends.deps_log_bytes)?;

    tracing::info!(
        target: "cli",
        commands_run = summary.commands_run,
        failures = summary.failures,
        "build {:?}",
        summary.status
    );

    Ok(summary.status)
}

fn main() -> ExitCode {
    let args = Args::parse();
    let config = load_config(args.config.clone());
    let verbose = args.verbose || config.verbose;
    let _guard = configure_logging(verbose);
    match run(args, config) {
        Ok(BuildStatus::Success) => ExitCode::SUCCESS,
        Ok(BuildStatus::Failure) => {
            eprintln!("kiln: build failed");
            ExitCode::FAILURE
        }
        Ok(BuildStatus::Interrupted) => {
            eprintln!("kiln: interrupted");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("kiln: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discover_config_falls_back_to_local_filename_when_nothing_exists() {
        let dir = tempfile::tempdir().unwrap();
        let prev = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();
        let found = discover_config();
        std::env::set_current_dir(prev).unwrap();
        assert_eq!(found, PathBuf::from("kiln.toml"));
    }

    #[test]
    fn load_config_ignores_missing_file() {
        let config = load_config(Some(PathBuf::from("/nonexistent/kiln.toml")));
        assert_eq!(config.jobs, None);
    }

    #[test]
    fn load_config_reads_parallelism_from_build_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiln.toml");
        std::fs::write(&path, "[build]\nparallelism = 8\n").unwrap();
        let config = load_config(Some(path));
        assert_eq!(config.jobs, Some(8));
    }

    #[test]
    fn load_config_reads_failures_allowed_and_verbose() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiln.toml");
        std::fs::write(&path, "[build]\nfailures_allowed = 4\nverbose = true\n").unwrap();
        let config = load_config(Some(path));
        assert_eq!(config.failures_allowed, Some(4));
        assert!(config.verbose);
    }

    #[test]
    fn load_config_reads_pool_depths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiln.toml");
        std::fs::write(&path, "[pools.link]\ndepth = 2\n").unwrap();
        let config = load_config(Some(path));
        assert_eq!(config.pools.get("link"), Some(&2));
    }

    #[test]
    fn register_config_pools_skips_names_the_manifest_already_declares() {
        let mut state = State::new();
        let manifest = ManifestData {
            rules: vec![],
            pools: vec![kiln_manifest::PoolDecl { name: "link".into(), depth: 1 }],
            edges: vec![],
            defaults: vec![],
        };
        let mut config = Config::default();
        config.pools.insert("link".into(), 9);
        config.pools.insert("cc".into(), 3);
        register_config_pools(&mut state, &manifest, &config);
        assert!(state.lookup_pool("link").is_none());
        assert_eq!(state.pool(state.lookup_pool("cc").unwrap()).depth, 3);
    }

    #[test]
    fn resolve_targets_falls_back_to_defaults_when_none_given() {
        let mut state = State::new();
        let path = CanonicalPath::canonicalize("out/all").unwrap();
        let node = state.get_or_add_node(path);
        let resolved = resolve_targets(&mut state, &[], &[node]).unwrap();
        assert_eq!(resolved, vec![node]);
    }

    #[test]
    fn persist_build_log_writes_header_on_first_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".kiln_log");
        let log = BuildLog::new();
        persist_build_log(&path, &log, "1\t2\t3\tout\tabc\n").unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("# ninja log v"));
        assert!(text.ends_with("1\t2\t3\tout\tabc\n"));
    }

    #[test]
    fn persist_deps_log_writes_header_on_first_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".kiln_deps");
        let log = DepsLog::new();
        persist_deps_log(&path, &log, b"hello").unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert!(bytes.starts_with(kiln_depslog::MAGIC));
        assert!(bytes.ends_with(b"hello"));
    }
}
