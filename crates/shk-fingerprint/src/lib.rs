//! File fingerprints and the matching protocol behind dirty detection.
//!
//! A [`Fingerprint`] is what the invocation log stores about a file: a
//! subset of its stat information, the time the fingerprint was taken, and
//! a content hash. Timestamps alone cannot be trusted: a file modified
//! within the same clock second that a build step finished looks untouched
//! to a pure mtime comparison. The matching protocol here is the one git
//! uses for its racy index: trust the stat data only when the file's
//! mtime/ctime are strictly older than the capture time, and fall back to
//! hashing the contents in the ambiguous window.
//!
//! On a no-op build this means almost every file is judged clean with a
//! single stat call.
//!
//! Fingerprints are plain old data with a fixed on-disk encoding; the
//! invocation log stores them as-is. Changing [`FINGERPRINT_BYTES`] or the
//! field layout is a log format break.

use camino::Utf8Path;

use shk_fs::{FileSystem, FsError, Hash, HASH_BYTES, Stat};

/// The stat subset stored in a fingerprint.
///
/// The device id is excluded because it is not stable over time on network
/// file systems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FingerprintStat {
    pub size: u64,
    pub ino: u64,
    /// Full `st_mode` bits; enough to probe for the directory bit.
    pub mode: u32,
    pub mtime: i64,
    pub ctime: i64,
}

impl FingerprintStat {
    fn from_stat(stat: &Stat) -> Self {
        Self {
            size: stat.size,
            ino: stat.ino,
            mode: stat.mode,
            mtime: stat.mtime,
            ctime: stat.ctime,
        }
    }

    /// True if the file could be stat-ed when the fingerprint was taken.
    /// Any stat-able file has type bits set in `mode`.
    pub fn could_access(&self) -> bool {
        self.mode != 0
    }

    pub fn is_dir(&self) -> bool {
        (self.mode & 0o170000) == 0o040000
    }
}

/// Size of an encoded [`Fingerprint`] in bytes.
pub const FINGERPRINT_BYTES: usize = 8 + 8 + 4 + 8 + 8 + 8 + HASH_BYTES;

/// Everything the engine remembers about one file's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Fingerprint {
    pub stat: FingerprintStat,
    /// Wall-clock second at which the fingerprint was taken. The basis of
    /// the racy-match window.
    pub timestamp: i64,
    pub hash: Hash,
}

impl Fingerprint {
    /// Fingerprint of a file that did not exist.
    pub fn absent(timestamp: i64) -> Self {
        Self {
            stat: FingerprintStat::default(),
            timestamp,
            hash: Hash::ZERO,
        }
    }

    /// Append the fixed-width encoding to `out`.
    ///
    /// Integer fields use host byte order: the log is endianness-sensitive
    /// on purpose, see the invocation log docs.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.stat.size.to_ne_bytes());
        out.extend_from_slice(&self.stat.ino.to_ne_bytes());
        out.extend_from_slice(&self.stat.mode.to_ne_bytes());
        out.extend_from_slice(&self.stat.mtime.to_ne_bytes());
        out.extend_from_slice(&self.stat.ctime.to_ne_bytes());
        out.extend_from_slice(&self.timestamp.to_ne_bytes());
        out.extend_from_slice(&self.hash.0);
    }

    /// Decode a fingerprint from exactly [`FINGERPRINT_BYTES`] bytes.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != FINGERPRINT_BYTES {
            return None;
        }
        let u64_at = |off: usize| u64::from_ne_bytes(bytes[off..off + 8].try_into().unwrap());
        let i64_at = |off: usize| i64::from_ne_bytes(bytes[off..off + 8].try_into().unwrap());
        let mut hash = [0u8; HASH_BYTES];
        hash.copy_from_slice(&bytes[44..44 + HASH_BYTES]);
        Some(Self {
            stat: FingerprintStat {
                size: u64_at(0),
                ino: u64_at(8),
                mode: u32::from_ne_bytes(bytes[16..20].try_into().unwrap()),
                mtime: i64_at(20),
                ctime: i64_at(28),
            },
            timestamp: i64_at(36),
            hash: Hash(hash),
        })
    }
}

/// Outcome of matching a file against a stored fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MatchesResult {
    pub clean: bool,
    /// True if deciding cleanliness required hashing the file contents.
    /// The caller should then store a freshly taken fingerprint so the
    /// stat-only fast path applies next time.
    pub should_update: bool,
}

fn hash_of(fs: &impl FileSystem, stat: &Stat, path: &Utf8Path) -> Result<Hash, FsError> {
    if stat.is_dir() {
        fs.hash_dir(path)
    } else {
        fs.hash_file(path)
    }
}

/// Take the fingerprint of a file as it is right now.
pub fn take_fingerprint(
    fs: &impl FileSystem,
    timestamp: i64,
    path: &Utf8Path,
) -> Result<Fingerprint, FsError> {
    let stat = fs.stat(path)?;
    if !stat.could_access {
        return Ok(Fingerprint::absent(timestamp));
    }
    Ok(Fingerprint {
        stat: FingerprintStat::from_stat(&stat),
        timestamp,
        hash: hash_of(fs, &stat, path)?,
    })
}

/// Like [`take_fingerprint`], but reuses `old` when it still matches
/// cleanly without hashing. Significantly cheaper on no-op paths: a clean
/// non-racy match costs one stat, no content hash.
pub fn retake_fingerprint(
    fs: &impl FileSystem,
    timestamp: i64,
    path: &Utf8Path,
    old: &Fingerprint,
) -> Result<Fingerprint, FsError> {
    let result = fingerprint_matches(fs, path, old)?;
    if result.clean && !result.should_update {
        return Ok(*old);
    }
    take_fingerprint(fs, timestamp, path)
}

/// Check whether a file still matches a fingerprint.
pub fn fingerprint_matches(
    fs: &impl FileSystem,
    path: &Utf8Path,
    fingerprint: &Fingerprint,
) -> Result<MatchesResult, FsError> {
    let cur = fs.stat(path)?;

    if cur.could_access != fingerprint.stat.could_access() {
        return Ok(MatchesResult::default());
    }
    if !cur.could_access {
        // Both absent: still clean.
        return Ok(MatchesResult {
            clean: true,
            should_update: false,
        });
    }
    if cur.size != fingerprint.stat.size || cur.mode != fingerprint.stat.mode {
        return Ok(MatchesResult::default());
    }
    if cur.mtime < fingerprint.timestamp && cur.ctime < fingerprint.timestamp {
        // Untouched since the fingerprint was taken; stat data is enough.
        return Ok(MatchesResult {
            clean: true,
            should_update: false,
        });
    }

    // The file may have been modified within the same clock second the
    // fingerprint was taken. The hash is the tiebreaker.
    let hash = hash_of(fs, &cur, path)?;
    if hash == fingerprint.hash {
        Ok(MatchesResult {
            clean: true,
            should_update: true,
        })
    } else {
        Ok(MatchesResult::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shk_fs::InMemoryFileSystem;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicI64, Ordering};

    fn ticking() -> (Arc<AtomicI64>, InMemoryFileSystem) {
        let time = Arc::new(AtomicI64::new(100));
        let t = time.clone();
        let fs = InMemoryFileSystem::new(Arc::new(move || t.load(Ordering::SeqCst)));
        (time, fs)
    }

    #[test]
    fn unmodified_file_matches_without_hashing() {
        let (time, fs) = ticking();
        fs.write_file("f".into(), b"contents").unwrap();
        time.store(101, Ordering::SeqCst);
        let fp = take_fingerprint(&fs, 101, "f".into()).unwrap();
        let result = fingerprint_matches(&fs, "f".into(), &fp).unwrap();
        assert!(result.clean);
        assert!(!result.should_update);
    }

    #[test]
    fn modified_file_is_dirty() {
        let (time, fs) = ticking();
        fs.write_file("f".into(), b"contents").unwrap();
        time.store(101, Ordering::SeqCst);
        let fp = take_fingerprint(&fs, 101, "f".into()).unwrap();
        time.store(102, Ordering::SeqCst);
        fs.write_file("f".into(), b"altered!").unwrap();
        let result = fingerprint_matches(&fs, "f".into(), &fp).unwrap();
        assert!(!result.clean);
    }

    #[test]
    fn same_second_unchanged_is_racily_clean() {
        let (_, fs) = ticking();
        fs.write_file("f".into(), b"contents").unwrap();
        // Fingerprint taken in the same second as the write: the stat is
        // ambiguous and the hash must confirm cleanliness.
        let fp = take_fingerprint(&fs, 100, "f".into()).unwrap();
        let result = fingerprint_matches(&fs, "f".into(), &fp).unwrap();
        assert!(result.clean);
        assert!(result.should_update);
    }

    #[test]
    fn same_second_edit_is_detected() {
        let (_, fs) = ticking();
        fs.write_file("f".into(), b"contents").unwrap();
        let fp = take_fingerprint(&fs, 100, "f".into()).unwrap();
        // Same-length edit within the same clock second: stat cannot tell,
        // the hash must.
        fs.write_file("f".into(), b"CONTENTS").unwrap();
        let result = fingerprint_matches(&fs, "f".into(), &fp).unwrap();
        assert!(!result.clean);
    }

    #[test]
    fn absent_file_round_trips() {
        let (_, fs) = ticking();
        let fp = take_fingerprint(&fs, 100, "missing".into()).unwrap();
        assert!(!fp.stat.could_access());
        assert_eq!(fp.hash, Hash::ZERO);
        let result = fingerprint_matches(&fs, "missing".into(), &fp).unwrap();
        assert!(result.clean);
        assert!(!result.should_update);
    }

    #[test]
    fn file_appearing_makes_absent_fingerprint_dirty() {
        let (_, fs) = ticking();
        let fp = take_fingerprint(&fs, 100, "f".into()).unwrap();
        fs.write_file("f".into(), b"now exists").unwrap();
        assert!(!fingerprint_matches(&fs, "f".into(), &fp).unwrap().clean);
    }

    #[test]
    fn file_disappearing_is_dirty() {
        let (time, fs) = ticking();
        fs.write_file("f".into(), b"x").unwrap();
        time.store(101, Ordering::SeqCst);
        let fp = take_fingerprint(&fs, 101, "f".into()).unwrap();
        fs.unlink("f".into()).unwrap();
        assert!(!fingerprint_matches(&fs, "f".into(), &fp).unwrap().clean);
    }

    #[test]
    fn retake_returns_exact_copy_when_clean() {
        let (time, fs) = ticking();
        fs.write_file("f".into(), b"contents").unwrap();
        time.store(101, Ordering::SeqCst);
        let fp = take_fingerprint(&fs, 101, "f".into()).unwrap();
        time.store(105, Ordering::SeqCst);
        let retaken = retake_fingerprint(&fs, 105, "f".into(), &fp).unwrap();
        assert_eq!(retaken, fp);
    }

    #[test]
    fn retake_refreshes_racy_fingerprint() {
        let (time, fs) = ticking();
        fs.write_file("f".into(), b"contents").unwrap();
        let racy = take_fingerprint(&fs, 100, "f".into()).unwrap();
        time.store(105, Ordering::SeqCst);
        let retaken = retake_fingerprint(&fs, 105, "f".into(), &racy).unwrap();
        assert_eq!(retaken.timestamp, 105);
        assert_eq!(retaken.hash, racy.hash);
        // The refreshed fingerprint no longer needs hashing to match.
        let result = fingerprint_matches(&fs, "f".into(), &retaken).unwrap();
        assert!(result.clean);
        assert!(!result.should_update);
    }

    #[test]
    fn directory_fingerprints_track_the_listing() {
        let (time, fs) = ticking();
        fs.mkdir("d".into()).unwrap();
        fs.write_file("d/a".into(), b"1").unwrap();
        time.store(101, Ordering::SeqCst);
        let fp = take_fingerprint(&fs, 101, "d".into()).unwrap();
        assert!(fp.stat.is_dir());
        time.store(102, Ordering::SeqCst);
        fs.write_file("d/b".into(), b"2").unwrap();
        // Adding an entry changes the directory listing hash; the dir
        // mtime moved too, so the hash path decides.
        assert!(!fingerprint_matches(&fs, "d".into(), &fp).unwrap().clean);
    }

    #[test]
    fn encode_decode_round_trip() {
        let fp = Fingerprint {
            stat: FingerprintStat {
                size: 1234,
                ino: 99,
                mode: 0o100644,
                mtime: 1_700_000_000,
                ctime: 1_700_000_001,
            },
            timestamp: 1_700_000_002,
            hash: Hash::from_bytes(b"payload"),
        };
        let mut buf = Vec::new();
        fp.encode(&mut buf);
        assert_eq!(buf.len(), FINGERPRINT_BYTES);
        assert_eq!(Fingerprint::decode(&buf), Some(fp));
        assert_eq!(Fingerprint::decode(&buf[1..]), None);
    }
}
