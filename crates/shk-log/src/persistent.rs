//! The disk-backed invocation log.
//!
//! A single binary file: a header (8 byte magic + format version), then a
//! sequence of length-framed records. Each record starts with a `u32`
//! whose two least significant bits carry the record type and whose
//! remaining bits carry the payload length (always 4-byte aligned).
//! Records are implicitly numbered from zero; any reference from one
//! record to another is by that number and must point backwards.
//!
//! Record types:
//!
//! - `0` Path: NUL-terminated UTF-8 path, zero-padded to alignment.
//! - `1` CreatedDirectory: `u32` path record number.
//! - `2` Invocation: command hash, `u32` output count, then
//!   `(u32 path record, Fingerprint)` pairs, outputs first, inputs after.
//! - `3` Deleted: a 4-byte payload tombstones a created directory (by path
//!   record number); a hash-sized payload tombstones an invocation.
//!
//! Integer fields are written in host byte order. The log is a cache that
//! never travels between machines, and skipping byte swaps keeps the
//! no-op-build parse cheap; a foreign-endian file fails the version check.
//!
//! The file supports two access patterns: streamed appends while commands
//! run (so an interrupted build keeps its completed work), and a full
//! parse at startup. Appends happen one complete record batch at a time;
//! a torn tail from a crash is detected at parse time and truncated away,
//! never treated as fatal. Only [`recompact_invocation_log`] ever rewrites
//! the file, atomically, via temp-file-and-rename.
//!
//! The log is designed for a single process at a time; acquiring exclusive
//! access is the caller's responsibility.

use std::collections::{HashMap, HashSet};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use shk_fingerprint::{FINGERPRINT_BYTES, Fingerprint};
use shk_fs::{FileSystem, HASH_BYTES, Hash, PathId, Paths};

use crate::{InvocationEntry, InvocationLog, Invocations, LogError};

const MAGIC: [u8; 8] = *b"shk.ilog";
/// Bump on any change to the record layout or to the fingerprint encoding.
pub const LOG_FORMAT_VERSION: u32 = 1;
const HEADER_BYTES: usize = MAGIC.len() + 4;

const TYPE_PATH: u32 = 0;
const TYPE_CREATED_DIR: u32 = 1;
const TYPE_INVOCATION: u32 = 2;
const TYPE_DELETED: u32 = 3;

/// Bytes of one `(path record, fingerprint)` pair inside an Invocation
/// record.
const PAIR_BYTES: usize = 4 + FINGERPRINT_BYTES;

/// Recompact once at least this many dead bytes have accumulated...
const RECOMPACT_MIN_DEAD_BYTES: usize = 1024;
// ...and the dead bytes are at least half of all record bytes.

/// Maps interned paths to their Path record number, so appends never emit
/// the same path twice.
pub type PathIds = HashMap<PathId, u32>;

/// Result of parsing an invocation log file.
#[derive(Debug)]
pub struct InvocationLogParseResult {
    pub invocations: Invocations,
    /// Set when the parser recovered from a corrupt tail by truncating.
    pub warning: Option<String>,
    /// True when enough of the file is superseded or tombstoned records
    /// that rewriting it is worth the cost.
    pub needs_recompaction: bool,
    pub path_ids: PathIds,
    /// Number of records in the (possibly truncated) file; the appender
    /// continues numbering from here.
    pub entry_count: u32,
}

/// Conventional location of the log within a build directory.
pub fn invocation_log_path(build_dir: &Utf8Path) -> Utf8PathBuf {
    build_dir.join(".shk_log")
}

fn header_bytes() -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_BYTES);
    buf.extend_from_slice(&MAGIC);
    buf.extend_from_slice(&LOG_FORMAT_VERSION.to_ne_bytes());
    buf
}

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

fn push_record_header(buf: &mut Vec<u8>, record_type: u32, payload_len: usize) {
    debug_assert_eq!(payload_len % 4, 0);
    buf.extend_from_slice(&((payload_len as u32) | record_type).to_ne_bytes());
}

fn u32_at(bytes: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

struct Parser<'a> {
    paths: &'a Paths,
    /// One element per record seen so far; `Some` for Path records.
    records: Vec<Option<PathId>>,
    invocations: Invocations,
    path_ids: PathIds,
    /// Size of the live Invocation record per command hash, for dead-byte
    /// accounting when it is superseded or tombstoned.
    entry_bytes: HashMap<Hash, usize>,
    dead_bytes: usize,
}

enum RecordOutcome {
    Ok,
    Corrupt(&'static str),
}

impl<'a> Parser<'a> {
    fn new(paths: &'a Paths) -> Self {
        Self {
            paths,
            records: Vec::new(),
            invocations: Invocations::default(),
            path_ids: PathIds::new(),
            entry_bytes: HashMap::new(),
            dead_bytes: 0,
        }
    }

    fn resolve_path_record(&self, reference: u32) -> Option<PathId> {
        self.records.get(reference as usize).copied().flatten()
    }

    fn parse_record(&mut self, record_type: u32, payload: &[u8]) -> RecordOutcome {
        let record_size = 4 + payload.len();
        match record_type {
            TYPE_PATH => {
                let Some(nul) = payload.iter().position(|&b| b == 0) else {
                    return RecordOutcome::Corrupt("path record is not NUL-terminated");
                };
                let Ok(path) = std::str::from_utf8(&payload[..nul]) else {
                    return RecordOutcome::Corrupt("path record is not UTF-8");
                };
                if path.is_empty() {
                    return RecordOutcome::Corrupt("path record is empty");
                }
                let id = self.paths.get(path);
                self.records.push(Some(id));
                let record_number = (self.records.len() - 1) as u32;
                self.path_ids.entry(id).or_insert(record_number);
            }
            TYPE_CREATED_DIR => {
                if payload.len() != 4 {
                    return RecordOutcome::Corrupt("created-directory record has wrong size");
                }
                let Some(id) = self.resolve_path_record(u32_at(payload, 0)) else {
                    return RecordOutcome::Corrupt(
                        "created-directory record references a non-path record",
                    );
                };
                self.invocations.created_directories.insert(id);
                self.records.push(None);
            }
            TYPE_INVOCATION => {
                if payload.len() < HASH_BYTES + 4 {
                    return RecordOutcome::Corrupt("invocation record too short");
                }
                let mut hash = [0u8; HASH_BYTES];
                hash.copy_from_slice(&payload[..HASH_BYTES]);
                let hash = Hash(hash);
                let output_count = u32_at(payload, HASH_BYTES) as usize;
                let pairs = &payload[HASH_BYTES + 4..];
                if pairs.len() % PAIR_BYTES != 0 {
                    return RecordOutcome::Corrupt("invocation record has a partial file pair");
                }
                let pair_count = pairs.len() / PAIR_BYTES;
                if output_count > pair_count {
                    return RecordOutcome::Corrupt(
                        "invocation record output count exceeds file pairs",
                    );
                }
                let mut entry = InvocationEntry::default();
                for index in 0..pair_count {
                    let pair = &pairs[index * PAIR_BYTES..(index + 1) * PAIR_BYTES];
                    let Some(id) = self.resolve_path_record(u32_at(pair, 0)) else {
                        return RecordOutcome::Corrupt(
                            "invocation record references a non-path record",
                        );
                    };
                    let Some(fingerprint) = Fingerprint::decode(&pair[4..]) else {
                        return RecordOutcome::Corrupt("invocation record fingerprint malformed");
                    };
                    if index < output_count {
                        entry.output_files.push((id, fingerprint));
                    } else {
                        entry.input_files.push((id, fingerprint));
                    }
                }
                // A rerun of the same step rewrites its entry; the earlier
                // record is dead weight from now on.
                if let Some(old_size) = self.entry_bytes.insert(hash, record_size) {
                    self.dead_bytes += old_size;
                }
                self.invocations.entries.insert(hash, entry);
                self.records.push(None);
            }
            TYPE_DELETED => {
                if payload.len() == 4 {
                    if let Some(id) = self.resolve_path_record(u32_at(payload, 0))
                        && self.invocations.created_directories.remove(&id)
                    {
                        // Header + u32 payload of the directory record.
                        self.dead_bytes += 8;
                    }
                } else if payload.len() == HASH_BYTES {
                    let mut hash = [0u8; HASH_BYTES];
                    hash.copy_from_slice(payload);
                    let hash = Hash(hash);
                    if self.invocations.entries.remove(&hash).is_some()
                        && let Some(size) = self.entry_bytes.remove(&hash)
                    {
                        self.dead_bytes += size;
                    }
                } else {
                    return RecordOutcome::Corrupt("deleted record has unrecognised size");
                }
                self.dead_bytes += record_size;
                self.records.push(None);
            }
            _ => unreachable!("record type is two bits"),
        }
        RecordOutcome::Ok
    }
}

/// Parse the invocation log at `log_path`.
///
/// A missing file is an empty log, not an error. A corrupt or torn record
/// truncates the file to the last valid prefix and reports a warning; the
/// prefix is still used.
pub fn parse_invocation_log(
    fs: &impl FileSystem,
    paths: &Paths,
    log_path: &Utf8Path,
) -> Result<InvocationLogParseResult, LogError> {
    let stat = fs.stat(log_path)?;
    if !stat.could_access || stat.size == 0 {
        return Ok(InvocationLogParseResult {
            invocations: Invocations::default(),
            warning: None,
            needs_recompaction: false,
            path_ids: PathIds::new(),
            entry_count: 0,
        });
    }

    let buf = fs.read_file(log_path)?;
    if buf.len() < HEADER_BYTES {
        return Err(LogError::Parse {
            path: log_path.to_owned(),
            message: "truncated header".to_string(),
        });
    }
    if buf[..MAGIC.len()] != MAGIC {
        return Err(LogError::Parse {
            path: log_path.to_owned(),
            message: "bad magic; not an invocation log".to_string(),
        });
    }
    let version = u32_at(&buf, MAGIC.len());
    if version != LOG_FORMAT_VERSION {
        return Err(LogError::Version {
            path: log_path.to_owned(),
            found: version,
            expected: LOG_FORMAT_VERSION,
        });
    }

    let mut parser = Parser::new(paths);
    let mut offset = HEADER_BYTES;
    let mut corrupt: Option<&'static str> = None;

    while offset < buf.len() {
        if buf.len() - offset < 4 {
            corrupt = Some("torn record header");
            break;
        }
        let length_and_type = u32_at(&buf, offset);
        let record_type = length_and_type & 0b11;
        let payload_len = (length_and_type & !0b11) as usize;
        if buf.len() - offset - 4 < payload_len {
            corrupt = Some("torn record payload");
            break;
        }
        let payload = &buf[offset + 4..offset + 4 + payload_len];
        match parser.parse_record(record_type, payload) {
            RecordOutcome::Ok => offset += 4 + payload_len,
            RecordOutcome::Corrupt(reason) => {
                corrupt = Some(reason);
                break;
            }
        }
    }

    let warning = if let Some(reason) = corrupt {
        debug!(
            log = %log_path,
            offset,
            reason,
            "invocation log corrupt; truncating to last valid prefix"
        );
        fs.truncate(log_path, offset as u64)?;
        Some(format!(
            "invocation log contained a corrupt tail ({reason}); truncated"
        ))
    } else {
        None
    };

    let record_bytes = offset - HEADER_BYTES;
    let needs_recompaction = parser.dead_bytes >= RECOMPACT_MIN_DEAD_BYTES
        && parser.dead_bytes * 2 >= record_bytes;

    Ok(InvocationLogParseResult {
        invocations: parser.invocations,
        warning,
        needs_recompaction,
        path_ids: parser.path_ids,
        entry_count: parser.records.len() as u32,
    })
}

// ---------------------------------------------------------------------------
// Appending
// ---------------------------------------------------------------------------

/// The disk-backed [`InvocationLog`].
///
/// Each logical operation is encoded as one batch of complete records and
/// appended with a single write, so the log is parseable after a crash at
/// any point. Invalidated by [`recompact_invocation_log`]; reopen after
/// recompacting.
pub struct PersistentInvocationLog<F> {
    fs: F,
    paths: Paths,
    log_path: Utf8PathBuf,
    path_ids: PathIds,
    record_count: u32,
    live_entries: HashSet<Hash>,
    live_dirs: HashSet<PathId>,
}

/// Open the log for appending. `parse` must come from
/// [`parse_invocation_log`] of the same file (it seeds path dedup, record
/// numbering, and the live sets). Creates the file with a fresh header if
/// it does not exist.
pub fn open_invocation_log<F: FileSystem>(
    fs: F,
    paths: Paths,
    log_path: &Utf8Path,
    parse: &InvocationLogParseResult,
) -> Result<PersistentInvocationLog<F>, LogError> {
    let stat = fs.stat(log_path)?;
    if !stat.could_access || stat.size == 0 {
        fs.write_file(log_path, &header_bytes())?;
    }
    Ok(PersistentInvocationLog {
        fs,
        paths,
        log_path: log_path.to_owned(),
        path_ids: parse.path_ids.clone(),
        record_count: parse.entry_count,
        live_entries: parse.invocations.entries.keys().copied().collect(),
        live_dirs: parse.invocations.created_directories.clone(),
    })
}

impl<F: FileSystem> PersistentInvocationLog<F> {
    /// Ensure a Path record exists for `id`, emitting one into `buf` if
    /// needed, and return its record number.
    fn ensure_path_record(&mut self, buf: &mut Vec<u8>, id: PathId) -> u32 {
        if let Some(&record) = self.path_ids.get(&id) {
            return record;
        }
        let path = self.paths.resolve(id);
        let bytes = path.as_str().as_bytes();
        // At least one NUL terminator, zero-padded to alignment.
        let payload_len = align4(bytes.len() + 1);
        push_record_header(buf, TYPE_PATH, payload_len);
        buf.extend_from_slice(bytes);
        buf.extend(std::iter::repeat_n(0u8, payload_len - bytes.len()));
        let record = self.record_count;
        self.record_count += 1;
        self.path_ids.insert(id, record);
        record
    }

    fn push_deleted_hash(&mut self, buf: &mut Vec<u8>, hash: &Hash) {
        push_record_header(buf, TYPE_DELETED, HASH_BYTES);
        buf.extend_from_slice(&hash.0);
        self.record_count += 1;
    }

    fn append(&self, buf: &[u8]) -> Result<(), LogError> {
        self.fs.append_file(&self.log_path, buf)?;
        Ok(())
    }
}

impl<F: FileSystem> InvocationLog for PersistentInvocationLog<F> {
    fn created_directory(&mut self, path: PathId) -> Result<(), LogError> {
        if self.live_dirs.contains(&path) {
            return Ok(());
        }
        let mut buf = Vec::new();
        let path_record = self.ensure_path_record(&mut buf, path);
        push_record_header(&mut buf, TYPE_CREATED_DIR, 4);
        buf.extend_from_slice(&path_record.to_ne_bytes());
        self.record_count += 1;
        self.append(&buf)?;
        self.live_dirs.insert(path);
        Ok(())
    }

    fn removed_directory(&mut self, path: PathId) -> Result<(), LogError> {
        if !self.live_dirs.remove(&path) {
            return Ok(());
        }
        // The directory is live, so its path has a record.
        let path_record = self.path_ids[&path];
        let mut buf = Vec::new();
        push_record_header(&mut buf, TYPE_DELETED, 4);
        buf.extend_from_slice(&path_record.to_ne_bytes());
        self.record_count += 1;
        self.append(&buf)
    }

    fn ran_command(&mut self, command_hash: Hash, entry: InvocationEntry) -> Result<(), LogError> {
        let mut buf = Vec::new();
        let file_records: Vec<(u32, Fingerprint)> = entry
            .all_files()
            .map(|&(id, fingerprint)| (self.ensure_path_record(&mut buf, id), fingerprint))
            .collect();

        // Supersede an earlier entry explicitly, so that a crash-recovery
        // parse reconstructs the same state this process has in memory.
        if self.live_entries.contains(&command_hash) {
            self.push_deleted_hash(&mut buf, &command_hash);
        }

        let payload_len = HASH_BYTES + 4 + file_records.len() * PAIR_BYTES;
        push_record_header(&mut buf, TYPE_INVOCATION, payload_len);
        buf.extend_from_slice(&command_hash.0);
        buf.extend_from_slice(&(entry.output_files.len() as u32).to_ne_bytes());
        for (record, fingerprint) in &file_records {
            buf.extend_from_slice(&record.to_ne_bytes());
            fingerprint.encode(&mut buf);
        }
        self.record_count += 1;
        self.append(&buf)?;
        self.live_entries.insert(command_hash);
        Ok(())
    }

    fn cleaned_command(&mut self, command_hash: Hash) -> Result<(), LogError> {
        if !self.live_entries.remove(&command_hash) {
            return Ok(());
        }
        let mut buf = Vec::new();
        self.push_deleted_hash(&mut buf, &command_hash);
        self.append(&buf)
    }
}

// ---------------------------------------------------------------------------
// Recompaction
// ---------------------------------------------------------------------------

/// Rewrite the log to contain only the live records of `invocations`.
///
/// The new file is written next to the old one and renamed into place, so
/// a crash leaves either the old or the new log, never a mix. Record
/// numbering restarts from zero; any open [`PersistentInvocationLog`] for
/// this path is invalidated and must be reopened with the returned path
/// map and record count.
pub fn recompact_invocation_log(
    fs: &impl FileSystem,
    paths: &Paths,
    invocations: &Invocations,
    log_path: &Utf8Path,
) -> Result<(PathIds, u32), LogError> {
    let mut buf = header_bytes();
    let mut path_ids = PathIds::new();
    let mut record_count: u32 = 0;

    let ensure_path = |buf: &mut Vec<u8>, path_ids: &mut PathIds, count: &mut u32, id: PathId| {
        if let Some(&record) = path_ids.get(&id) {
            return record;
        }
        let path = paths.resolve(id);
        let bytes = path.as_str().as_bytes();
        let payload_len = align4(bytes.len() + 1);
        push_record_header(buf, TYPE_PATH, payload_len);
        buf.extend_from_slice(bytes);
        buf.extend(std::iter::repeat_n(0u8, payload_len - bytes.len()));
        let record = *count;
        *count += 1;
        path_ids.insert(id, record);
        record
    };

    // Sort for a deterministic file; the on-disk order is not semantic.
    let mut dirs: Vec<PathId> = invocations.created_directories.iter().copied().collect();
    dirs.sort_by_key(|&id| paths.resolve(id));
    for dir in dirs {
        let path_record = ensure_path(&mut buf, &mut path_ids, &mut record_count, dir);
        push_record_header(&mut buf, TYPE_CREATED_DIR, 4);
        buf.extend_from_slice(&path_record.to_ne_bytes());
        record_count += 1;
    }

    let mut hashes: Vec<&Hash> = invocations.entries.keys().collect();
    hashes.sort();
    for hash in hashes {
        let entry = &invocations.entries[hash];
        let file_records: Vec<(u32, Fingerprint)> = entry
            .all_files()
            .map(|&(id, fingerprint)| {
                (
                    ensure_path(&mut buf, &mut path_ids, &mut record_count, id),
                    fingerprint,
                )
            })
            .collect();
        let payload_len = HASH_BYTES + 4 + file_records.len() * PAIR_BYTES;
        push_record_header(&mut buf, TYPE_INVOCATION, payload_len);
        buf.extend_from_slice(&hash.0);
        buf.extend_from_slice(&(entry.output_files.len() as u32).to_ne_bytes());
        for (record, fingerprint) in &file_records {
            buf.extend_from_slice(&record.to_ne_bytes());
            fingerprint.encode(&mut buf);
        }
        record_count += 1;
    }

    fs.write_atomic(log_path, &buf)?;
    debug!(log = %log_path, records = record_count, "recompacted invocation log");
    Ok((path_ids, record_count))
}
