//! Binary deps log: read, append, and compact.
//!
//! This crate owns the record format and in-memory fold but not file I/O —
//! [`DepsLog::from_bytes`] takes whatever bytes a caller already read (or an
//! empty slice for "no log yet"), and [`DepsLog::record`]/[`DepsLog::compact`]
//! return bytes for the caller to append or rewrite. That split keeps the
//! format logic testable without a filesystem and lets the orchestrator
//! decide how paranoid to be about fsync and partial writes.

use std::collections::HashMap;

pub const MAGIC: &[u8] = b"# ninjadeps\n";
pub const VERSION: u32 = 4;

const NODE_KIND: u32 = 0;
const DEPS_KIND: u32 = 1;
const KIND_BIT: u32 = 0x8000_0000;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DepsRecord {
    pub mtime: i64,
    pub inputs: Vec<String>,
}

/// Holds the folded current view of a deps log plus enough bookkeeping to
/// append new records or decide a rewrite is due.
#[derive(Debug, Default)]
pub struct DepsLog {
    id_by_path: HashMap<String, u32>,
    path_by_id: Vec<String>,
    current: HashMap<String, DepsRecord>,
    total_records: u64,
}

impl DepsLog {
    pub fn new() -> Self {
        DepsLog::default()
    }

    /// Parse a deps log. Magic mismatch, an unsupported version, or a
    /// truncated tail are all non-fatal: the reader returns whatever
    /// complete records it found, which may be none.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut log = DepsLog::new();
        let body = match strip_header(bytes) {
            Some(b) => b,
            None => return log,
        };
        let mut cursor = body;
        while let Some((record, rest)) = read_record(cursor) {
            cursor = rest;
            log.total_records += 1;
            match record {
                Record::Node { id, path } => {
                    // Real writers assign node ids densely and monotonically
                    // in the order they first appear; an id that isn't
                    // exactly the next one means the log was either
                    // corrupted or the write that produced it was
                    // interrupted partway through, and everything from here
                    // on is untrustworthy — stop exactly as for a truncated
                    // tail rather than trust an out-of-sequence id.
                    if id as usize != log.path_by_id.len() {
                        break;
                    }
                    log.path_by_id.push(path.clone());
                    log.id_by_path.insert(path, id);
                }
                Record::Deps {
                    out_id,
                    mtime,
                    input_ids,
                } => {
                    let Some(out_path) = log.path_by_id.get(out_id as usize) else {
                        break;
                    };
                    let inputs: Option<Vec<String>> = input_ids
                        .iter()
                        .map(|id| log.path_by_id.get(*id as usize).cloned())
                        .collect();
                    let Some(inputs) = inputs else { break };
                    log.current
                        .insert(out_path.clone(), DepsRecord { mtime, inputs });
                }
            }
        }
        log
    }

    pub fn get(&self, output: &str) -> Option<&DepsRecord> {
        self.current.get(output)
    }

    fn intern(&mut self, path: &str, out: &mut Vec<u8>) -> u32 {
        if let Some(id) = self.id_by_path.get(path) {
            return *id;
        }
        let id = self.path_by_id.len() as u32;
        self.path_by_id.push(path.to_string());
        self.id_by_path.insert(path.to_string(), id);
        encode_node_record(id, path, out);
        self.total_records += 1;
        id
    }

    /// Record (or overwrite) the dependency set for `output`, returning the
    /// bytes that must be appended to the on-disk log.
    pub fn record(&mut self, output: &str, mtime: i64, inputs: &[String]) -> Vec<u8> {
        let mut out = Vec::new();
        let out_id = self.intern(output, &mut out);
        let input_ids: Vec<u32> = inputs
            .iter()
            .map(|p| self.intern(p, &mut out))
            .collect();
        encode_deps_record(out_id, mtime, &input_ids, &mut out);
        self.total_records += 1;
        self.current.insert(
            output.to_string(),
            DepsRecord {
                mtime,
                inputs: inputs.to_vec(),
            },
        );
        out
    }

    /// Ninja-style compaction threshold: once total records outnumber live
    /// outputs by more than 3x, a rewrite pays for itself.
    pub fn needs_compaction(&self) -> bool {
        let unique = self.current.len() as u64;
        unique > 0 && self.total_records > unique * 3
    }

    /// Produce a full, from-scratch log containing exactly the current
    /// entries: one node record per distinct path referenced, one deps
    /// record per output, in a stable order.
    pub fn compact(&self) -> Vec<u8> {
        tracing::debug!(
            target: "depslog",
            records = self.total_records,
            outputs = self.current.len(),
            "compacting deps log"
        );
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());

        let mut outputs: Vec<&String> = self.current.keys().collect();
        outputs.sort();

        let mut fresh = DepsLog::new();
        for output in outputs {
            let record = &self.current[output];
            let bytes = fresh.record(output, record.mtime, &record.inputs);
            out.extend_from_slice(&bytes);
        }
        out
    }
}

enum Record {
    Node { id: u32, path: String },
    Deps { out_id: u32, mtime: i64, input_ids: Vec<u32> },
}

fn strip_header(bytes: &[u8]) -> Option<&[u8]> {
    if bytes.len() < MAGIC.len() + 4 {
        return None;
    }
    if &bytes[..MAGIC.len()] != MAGIC {
        return None;
    }
    let version = u32::from_le_bytes(bytes[MAGIC.len()..MAGIC.len() + 4].try_into().ok()?);
    if version != VERSION {
        return None;
    }
    Some(&bytes[MAGIC.len() + 4..])
}

fn read_record(cursor: &[u8]) -> Option<(Record, &[u8])> {
    if cursor.len() < 4 {
        return None;
    }
    let size_word = u32::from_le_bytes(cursor[..4].try_into().ok()?);
    let kind = (size_word & KIND_BIT != 0) as u32;
    let size = (size_word & !KIND_BIT) as usize;
    let body_start = 4;
    if cursor.len() < body_start + size {
        return None; // partial tail: stop reading.
    }
    let body = &cursor[body_start..body_start + size];
    let rest = &cursor[body_start + size..];
    let record = match kind {
        k if k == NODE_KIND => decode_node_record(body)?,
        k if k == DEPS_KIND => decode_deps_record(body)?,
        _ => return None,
    };
    Some((record, rest))
}

fn decode_node_record(body: &[u8]) -> Option<Record> {
    if body.len() < 2 {
        return None;
    }
    let path_len = u16::from_le_bytes(body[..2].try_into().ok()?) as usize;
    if body.len() < 2 + path_len {
        return None;
    }
    let path_bytes = &body[2..2 + path_len];
    let padded_len = align4(2 + path_len) - 2;
    if body.len() < 2 + padded_len + 4 {
        return None;
    }
    let id_field = u32::from_le_bytes(body[2 + padded_len..2 + padded_len + 4].try_into().ok()?);
    let id = !id_field;
    let path = String::from_utf8_lossy(path_bytes).into_owned();
    Some(Record::Node { id, path })
}

fn decode_deps_record(body: &[u8]) -> Option<Record> {
    if body.len() < 12 || (body.len() - 12) % 4 != 0 {
        return None;
    }
    let out_id = u32::from_le_bytes(body[0..4].try_into().ok()?);
    let mtime = i64::from_le_bytes(body[4..12].try_into().ok()?);
    let input_ids = body[12..]
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect();
    Some(Record::Deps {
        out_id,
        mtime,
        input_ids,
    })
}

fn encode_node_record(id: u32, path: &str, out: &mut Vec<u8>) {
    let path_bytes = path.as_bytes();
    let padded_len = align4(2 + path_bytes.len()) - 2;
    let size = 2 + padded_len + 4;
    out.extend_from_slice(&(size as u32).to_le_bytes());
    out.extend_from_slice(&(path_bytes.len() as u16).to_le_bytes());
    out.extend_from_slice(path_bytes);
    out.resize(out.len() + (padded_len - path_bytes.len()), 0);
    out.extend_from_slice(&(!id).to_le_bytes());
}

fn encode_deps_record(out_id: u32, mtime: i64, input_ids: &[u32], out: &mut Vec<u8>) {
    let size = 4 + 8 + 4 * input_ids.len();
    out.extend_from_slice(&((size as u32) | KIND_BIT).to_le_bytes());
    out.extend_from_slice(&out_id.to_le_bytes());
    out.extend_from_slice(&mtime.to_le_bytes());
    for id in input_ids {
        out.extend_from_slice(&id.to_le_bytes());
    }
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> Vec<u8> {
        let mut h = MAGIC.to_vec();
        h.extend_from_slice(&VERSION.to_le_bytes());
        h
    }

    #[test]
    fn round_trips_a_single_record() {
        let mut log = DepsLog::new();
        let bytes = log.record("out.o", 100, &["a.h".into(), "b.h".into()]);
        let mut full = header();
        full.extend_from_slice(&bytes);

        let reloaded = DepsLog::from_bytes(&full);
        let rec = reloaded.get("out.o").unwrap();
        assert_eq!(rec.mtime, 100);
        assert_eq!(rec.inputs, vec!["a.h".to_string(), "b.h".to_string()]);
    }

    #[test]
    fn last_record_for_an_output_wins() {
        let mut log = DepsLog::new();
        let mut full = header();
        full.extend_from_slice(&log.record("out.o", 1, &["a.h".into()]));
        full.extend_from_slice(&log.record("out.o", 2, &["a.h".into(), "c.h".into()]));

        let reloaded = DepsLog::from_bytes(&full);
        let rec = reloaded.get("out.o").unwrap();
        assert_eq!(rec.mtime, 2);
        assert_eq!(rec.inputs, vec!["a.h".to_string(), "c.h".to_string()]);
    }

    #[test]
    fn truncated_tail_is_dropped_not_fatal() {
        let mut log = DepsLog::new();
        let mut full = header();
        full.extend_from_slice(&log.record("out.o", 1, &["a.h".into()]));
        full.truncate(full.len() - 2); // chop the last record mid-way
        let reloaded = DepsLog::from_bytes(&full);
        assert!(reloaded.get("out.o").is_none());
    }

    #[test]
    fn bad_magic_is_treated_as_empty_log() {
        let reloaded = DepsLog::from_bytes(b"not a deps log");
        assert_eq!(reloaded.total_records, 0);
    }

    #[test]
    fn unsupported_version_is_treated_as_empty_log() {
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&99u32.to_le_bytes());
        let reloaded = DepsLog::from_bytes(&bytes);
        assert_eq!(reloaded.total_records, 0);
    }

    #[test]
    fn compaction_threshold_trips_after_repeated_rewrites() {
        let mut log = DepsLog::new();
        for mtime in 0..5 {
            log.record("out.o", mtime, &["a.h".into()]);
        }
        assert!(log.needs_compaction());
    }

    #[test]
    fn compacted_log_round_trips_current_view() {
        let mut log = DepsLog::new();
        for mtime in 0..5 {
            log.record("out.o", mtime, &["a.h".into()]);
        }
        let compacted = log.compact();
        let reloaded = DepsLog::from_bytes(&compacted);
        assert_eq!(reloaded.get("out.o").unwrap().mtime, 4);
        assert!(!reloaded.needs_compaction());
    }

    #[test]
    fn out_of_sequence_node_id_is_treated_as_a_truncation_point() {
        let mut log = DepsLog::new();
        let mut node_bytes = Vec::new();
        // Hand-encode a node record that claims id 5 as the very first
        // record, as if a prior write had been interrupted after updating
        // the id counter but before actually appending the node records
        // that should have come first.
        encode_node_record(5, "surprise.h", &mut node_bytes);
        let mut full = header();
        full.extend_from_slice(&node_bytes);
        full.extend_from_slice(&log.record("out.o", 1, &["a.h".into()]));

        let reloaded = DepsLog::from_bytes(&full);
        assert!(reloaded.get("surprise.h").is_none());
        assert!(reloaded.get("out.o").is_none());
    }

    #[test]
    fn path_with_length_forcing_padding_round_trips() {
        // 3-byte path: 2 (len) + 3 = 5, padded to 8, +4 id = 12 bytes.
        let mut log = DepsLog::new();
        let bytes = log.record("a.h", 7, &[]);
        let mut full = header();
        full.extend_from_slice(&bytes);
        let reloaded = DepsLog::from_bytes(&full);
        assert_eq!(reloaded.get("a.h").unwrap().mtime, 7);
    }
}
