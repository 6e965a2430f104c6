//! Text build log: read, append, and compact.
//!
//! Same split as the deps log — this crate folds and formats lines, a
//! caller owns the actual file. Unlike the deps log, malformed lines here
//! are simply skipped rather than truncating the whole read: a build log is
//! advisory (losing an entry just forces one extra rebuild), not load-bearing
//! for correctness the way the deps log's node-id table is.

use std::collections::HashMap;

pub const CURRENT_VERSION: u32 = 5;
const HEADER_PREFIX: &str = "# ninja log v";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BuildLogEntry {
    pub start_ms: i64,
    pub end_ms: i64,
    pub mtime: i64,
    pub command_hash: u64,
}

#[derive(Debug, Default)]
pub struct BuildLog {
    entries: HashMap<String, BuildLogEntry>,
    total_records: u64,
    needs_recompaction: bool,
}

impl BuildLog {
    pub fn new() -> Self {
        BuildLog::default()
    }

    /// Parse a build log's text. A missing or unparseable header is treated
    /// as "no log yet"; a present header whose version is older than
    /// [`CURRENT_VERSION`] is accepted but flags [`BuildLog::needs_compaction`].
    pub fn from_text(text: &str) -> Self {
        let mut log = BuildLog::new();
        let mut lines = text.lines();
        let Some(header) = lines.next() else {
            return log;
        };
        let Some(version_str) = header.strip_prefix(HEADER_PREFIX) else {
            return log;
        };
        let Ok(version) = version_str.trim().parse::<u32>() else {
            return log;
        };
        if version < CURRENT_VERSION {
            log.needs_recompaction = true;
        }
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let mut fields = line.splitn(5, '\t');
            let (Some(start), Some(end), Some(mtime), Some(path), Some(hash_hex)) = (
                fields.next(),
                fields.next(),
                fields.next(),
                fields.next(),
                fields.next(),
            ) else {
                continue;
            };
            let (Ok(start_ms), Ok(end_ms), Ok(mtime), Ok(command_hash)) = (
                start.parse::<i64>(),
                end.parse::<i64>(),
                mtime.parse::<i64>(),
                u64::from_str_radix(hash_hex, 16),
            ) else {
                continue;
            };
            log.total_records += 1;
            log.entries.insert(
                path.to_string(),
                BuildLogEntry {
                    start_ms,
                    end_ms,
                    mtime,
                    command_hash,
                },
            );
        }
        log
    }

    pub fn get(&self, output: &str) -> Option<&BuildLogEntry> {
        self.entries.get(output)
    }

    /// Record an entry and return the text line to append (including the
    /// trailing newline).
    pub fn record(&mut self, output: &str, start_ms: i64, end_ms: i64, mtime: i64, command_hash: u64) -> String {
        let entry = BuildLogEntry {
            start_ms,
            end_ms,
            mtime,
            command_hash,
        };
        self.entries.insert(output.to_string(), entry);
        self.total_records += 1;
        format_line(output, &entry)
    }

    pub fn needs_compaction(&self) -> bool {
        self.needs_recompaction || {
            let unique = self.entries.len() as u64;
            unique > 0 && self.total_records > unique * 3
        }
    }

    /// Full, from-scratch text containing exactly the current entries.
    pub fn compact(&self) -> String {
        tracing::debug!(
            target: "buildlog",
            records = self.total_records,
            outputs = self.entries.len(),
            "compacting build log"
        );
        let mut out = format!("{HEADER_PREFIX}{CURRENT_VERSION}\n");
        let mut outputs: Vec<&String> = self.entries.keys().collect();
        outputs.sort();
        for path in outputs {
            out.push_str(&format_line(path, &self.entries[path]));
        }
        out
    }

    pub fn header() -> String {
        format!("{HEADER_PREFIX}{CURRENT_VERSION}\n")
    }
}

fn format_line(output: &str, entry: &BuildLogEntry) -> String {
    format!(
        "{}\t{}\t{}\t{}\t{:x}\n",
        entry.start_ms, entry.end_ms, entry.mtime, output, entry.command_hash
    )
}

/// FNV-1a 64-bit hash, used to fingerprint a fully evaluated command (plus
/// rspfile content, concatenated) for the build log's change-detection
/// column. Only ever compared against itself across runs of this tool, so
/// no particular algorithm is a format commitment.
pub fn hash_command(s: &str) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET;
    for byte in s.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}
