//! Startup directory scan
//!
//! Recovers the store's tables from disk. Checkpoints are named
//! `chkpt.<hexseq>` next to a `latest` marker hard-linked to the newest
//! one; log segments are named `log.<hexseq>` next to a `last` marker.
//! The marker's link target is skipped: it is the file still being
//! written. A log segment's covered range comes from its first and last
//! commit records, not from its name.
//!
//! A commit record is a line
//! `c/<committed>/<errors>/<status>/<seq-hex>/<crc>/...` with the hex
//! sequence in the fifth field.

use crate::store::MetaDataStore;
use driftfs_common::{Error, LogSeq, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// Head and tail window scanned for commit records.
const SCAN_BUF_SIZE: usize = 4 << 10;

impl MetaDataStore {
    /// Scan `checkpoint_dir` and `log_dir` and register everything
    /// servable. Files carrying a `.tmp.` infix in place of a sequence
    /// are leftovers from interrupted writes; they are removed when
    /// `remove_tmp` is set and ignored otherwise. Any other file whose
    /// name does not decode is an error: the directory holds state this
    /// server must account for.
    pub fn load(&self, checkpoint_dir: &Path, log_dir: &Path, remove_tmp: bool) -> Result<()> {
        load_dir(
            checkpoint_dir,
            "chkpt.",
            "latest",
            Some(".tmp."),
            remove_tmp,
            &mut |seq, path| {
                if self.contains_checkpoint(seq) {
                    error!("duplicate checkpoint log sequence number: {}", path.display());
                    return Err(Error::invalid_argument(format!(
                        "duplicate checkpoint sequence: {}",
                        path.display()
                    )));
                }
                self.register_checkpoint(path, seq);
                Ok(())
            },
        )?;
        load_dir(log_dir, "log.", "last", None, false, &mut |_seq, path| {
            let (start, end) = log_segment_seq_range(&path)?;
            if start < 0 {
                // Empty segment: no committed records to serve.
                info!("no initial log commit record found: {}", path.display());
                return Ok(());
            }
            if self.contains_log_segment(start) {
                error!(
                    "duplicate log segment sequence number: {}",
                    path.display()
                );
                return Err(Error::invalid_argument(format!(
                    "duplicate log segment sequence: {}",
                    path.display()
                )));
            }
            self.register_log_segment(path, start, end);
            Ok(())
        })
    }
}

fn load_dir(
    dir: &Path,
    prefix: &str,
    marker_name: &str,
    tmp_infix: Option<&str>,
    remove_tmp: bool,
    register: &mut dyn FnMut(LogSeq, PathBuf) -> Result<()>,
) -> Result<()> {
    let marker = dir.join(marker_name);
    let marker_ino = std::fs::metadata(&marker)
        .map_err(|err| {
            error!("stat: {}: {err}", marker.display());
            Error::invalid_argument(format!("missing {marker_name} marker in {}", dir.display()))
        })?
        .ino();
    for dirent in std::fs::read_dir(dir)? {
        let dirent = dirent?;
        let name = dirent.file_name();
        let name = name.to_string_lossy();
        let Some(suffix) = name.strip_prefix(prefix) else {
            continue;
        };
        // Skip the marker's hard-link target: the newest file, still
        // being appended to.
        if dirent.metadata()?.ino() == marker_ino {
            continue;
        }
        match LogSeq::from_str_radix(suffix, 16) {
            Ok(seq) if seq >= 0 => register(seq, dirent.path())?,
            _ => {
                if let Some(infix) = tmp_infix {
                    if suffix.contains(infix) {
                        debug!(
                            "{}: {name}",
                            if remove_tmp { "removing" } else { "ignoring" }
                        );
                        if remove_tmp {
                            std::fs::remove_file(dirent.path()).map_err(|err| {
                                error!("remove: {name}: {err}");
                                Error::Io(err)
                            })?;
                        }
                        continue;
                    }
                }
                error!("malformed file name: {name}");
                return Err(Error::invalid_argument(format!(
                    "malformed file name: {name}"
                )));
            }
        }
    }
    Ok(())
}

/// Extract the `[start, end]` sequence range of a log segment from its
/// first and last commit records. `(-1, -1)` means the segment holds no
/// commit records.
fn log_segment_seq_range(path: &Path) -> Result<(LogSeq, LogSeq)> {
    let mut file = File::open(path).map_err(|err| {
        error!("open: {}: {err}", path.display());
        Error::Io(err)
    })?;
    let mut head = vec![0u8; SCAN_BUF_SIZE];
    let head_len = read_full(&mut file, &mut head).map_err(|err| {
        error!("read: {}: {err}", path.display());
        Error::Io(err)
    })?;
    head.truncate(head_len);
    let start = match first_commit_record(&head).and_then(parse_commit_seq) {
        Some(seq) => seq,
        None => return Ok((-1, -1)),
    };
    let file_len = file.metadata()?.len() as usize;
    let tail = if file_len <= head_len {
        head
    } else {
        let window = SCAN_BUF_SIZE.min(file_len);
        file.seek(SeekFrom::End(-(window as i64)))?;
        let mut tail = vec![0u8; window];
        let n = read_full(&mut file, &mut tail).map_err(|err| {
            error!("read: {}: {err}", path.display());
            Error::Io(err)
        })?;
        tail.truncate(n);
        tail
    };
    match last_commit_seq(&tail) {
        Some(end) if end >= start => Ok((start, end)),
        _ => {
            info!("no terminating log commit record found: {}", path.display());
            Err(Error::invalid_argument(format!(
                "no terminating log commit record found: {}",
                path.display()
            )))
        }
    }
}

/// First commit record line in the buffer, without its newlines.
fn first_commit_record(buf: &[u8]) -> Option<&[u8]> {
    let idx = find(buf, b"\nc/")?;
    let start = idx + 1;
    let end = buf[start..].iter().position(|&b| b == b'\n')? + start;
    Some(&buf[start..end])
}

/// Sequence of the last complete commit record in the buffer.
fn last_commit_seq(buf: &[u8]) -> Option<LogSeq> {
    let mut limit = buf.len();
    while let Some(idx) = rfind(&buf[..limit], b"\nc/") {
        let start = idx + 1;
        if let Some(end) = buf[start..].iter().position(|&b| b == b'\n') {
            if let Some(seq) = parse_commit_seq(&buf[start..start + end]) {
                return Some(seq);
            }
        }
        limit = idx;
    }
    None
}

fn parse_commit_seq(line: &[u8]) -> Option<LogSeq> {
    let text = std::str::from_utf8(line).ok()?;
    let fields: Vec<&str> = text.split('/').collect();
    if fields.len() < 7 || fields[0] != "c" {
        return None;
    }
    match LogSeq::from_str_radix(fields[4], 16) {
        Ok(seq) if seq >= 0 => Some(seq),
        _ => None,
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .rposition(|window| window == needle)
}

fn read_full(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ReadMetaData;
    use driftfs_common::Properties;
    use driftfs_netio::NetManager;
    use std::cell::Cell;
    use std::rc::Rc;

    struct TestClock(Cell<i64>);

    impl NetManager for TestClock {
        fn now(&self) -> i64 {
            self.0.get()
        }
        fn is_running(&self) -> bool {
            true
        }
        fn shutdown(&self) {}
        fn wakeup(&self) {}
    }

    fn new_store() -> MetaDataStore {
        MetaDataStore::new(
            Rc::new(TestClock(Cell::new(100))),
            Box::new(|_op: ReadMetaData| {}),
        )
    }

    fn commit_line(seq: LogSeq) -> String {
        format!("c/{seq:x}/0/0/{seq:x}/abcd12/\n")
    }

    fn write_log_file(dir: &Path, name: &str, seqs: &[LogSeq]) -> PathBuf {
        let path = dir.join(name);
        let mut content = String::from("version/1\n");
        for &seq in seqs {
            content.push_str(&format!("entry {seq}\n"));
            content.push_str(&commit_line(seq));
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_parse_commit_seq() {
        assert_eq!(parse_commit_seq(b"c/1/0/0/a/12345/"), Some(10));
        assert_eq!(parse_commit_seq(b"c/1/0/0/ff/12345/extra"), Some(255));
        // Too few fields.
        assert_eq!(parse_commit_seq(b"c/1/0/a/12345/"), None);
        // Wrong tag.
        assert_eq!(parse_commit_seq(b"x/1/0/0/a/12345/"), None);
        // Not hex.
        assert_eq!(parse_commit_seq(b"c/1/0/0/zz/12345/"), None);
    }

    #[test]
    fn test_log_segment_seq_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log_file(dir.path(), "log.a", &[0x0a, 0x10, 0x14]);
        assert_eq!(log_segment_seq_range(&path).unwrap(), (0x0a, 0x14));
    }

    #[test]
    fn test_log_segment_without_commit_records_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.b");
        std::fs::write(&path, "version/1\nnothing committed\n").unwrap();
        assert_eq!(log_segment_seq_range(&path).unwrap(), (-1, -1));
    }

    #[test]
    fn test_log_segment_larger_than_scan_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.c");
        let mut content = String::from("version/1\n");
        content.push_str(&commit_line(0x100));
        // Push the terminating record past the head window.
        for i in 0..SCAN_BUF_SIZE {
            content.push_str(&format!("filler {i}\n"));
        }
        content.push_str(&commit_line(0x1ff));
        std::fs::write(&path, content).unwrap();
        assert_eq!(log_segment_seq_range(&path).unwrap(), (0x100, 0x1ff));
    }

    #[test]
    fn test_load_registers_and_skips_marker_target() {
        let cp_dir = tempfile::tempdir().unwrap();
        let log_dir = tempfile::tempdir().unwrap();

        std::fs::write(cp_dir.path().join("chkpt.a"), "cp 10").unwrap();
        std::fs::write(cp_dir.path().join("chkpt.14"), "cp 20").unwrap();
        std::fs::write(cp_dir.path().join("chkpt.1e"), "cp 30").unwrap();
        // The marker hard-links the newest checkpoint, which is skipped.
        std::fs::hard_link(
            cp_dir.path().join("chkpt.1e"),
            cp_dir.path().join("latest"),
        )
        .unwrap();

        write_log_file(log_dir.path(), "log.a", &[0x0a, 0x13]);
        let newest = write_log_file(log_dir.path(), "log.14", &[0x14, 0x1d]);
        std::fs::hard_link(&newest, log_dir.path().join("last")).unwrap();

        let store = new_store();
        store.load(cp_dir.path(), log_dir.path(), false).unwrap();

        assert_eq!(store.checkpoint_seqs(), vec![0x0a, 0x14]);
        assert_eq!(store.log_segment_ranges(), vec![(0x0a, 0x13)]);
    }

    #[test]
    fn test_load_sweeps_tmp_checkpoints() {
        let cp_dir = tempfile::tempdir().unwrap();
        let log_dir = tempfile::tempdir().unwrap();

        std::fs::write(cp_dir.path().join("chkpt.a"), "cp").unwrap();
        std::fs::hard_link(cp_dir.path().join("chkpt.a"), cp_dir.path().join("latest")).unwrap();
        let tmp = cp_dir.path().join("chkpt..tmp.42");
        std::fs::write(&tmp, "partial").unwrap();
        std::fs::write(log_dir.path().join("last"), "").unwrap();

        let store = new_store();
        store.load(cp_dir.path(), log_dir.path(), true).unwrap();
        assert!(!tmp.exists());

        // With remove_tmp unset the file is left alone.
        let store = new_store();
        std::fs::write(&tmp, "partial").unwrap();
        store.load(cp_dir.path(), log_dir.path(), false).unwrap();
        assert!(tmp.exists());
    }

    #[test]
    fn test_load_rejects_malformed_names() {
        let cp_dir = tempfile::tempdir().unwrap();
        let log_dir = tempfile::tempdir().unwrap();

        std::fs::write(cp_dir.path().join("chkpt.a"), "cp").unwrap();
        std::fs::hard_link(cp_dir.path().join("chkpt.a"), cp_dir.path().join("latest")).unwrap();
        std::fs::write(cp_dir.path().join("chkpt.notaseq"), "junk").unwrap();
        std::fs::write(log_dir.path().join("last"), "").unwrap();

        let store = new_store();
        assert!(store.load(cp_dir.path(), log_dir.path(), false).is_err());
    }

    #[test]
    fn test_load_requires_marker() {
        let cp_dir = tempfile::tempdir().unwrap();
        let log_dir = tempfile::tempdir().unwrap();
        std::fs::write(cp_dir.path().join("chkpt.a"), "cp").unwrap();

        let store = new_store();
        assert!(store.load(cp_dir.path(), log_dir.path(), false).is_err());
    }

    #[test]
    fn test_loaded_segments_are_servable() {
        let cp_dir = tempfile::tempdir().unwrap();
        let log_dir = tempfile::tempdir().unwrap();

        std::fs::write(cp_dir.path().join("chkpt.a"), "cp 10").unwrap();
        std::fs::write(cp_dir.path().join("chkpt.14"), "cp 20").unwrap();
        std::fs::hard_link(
            cp_dir.path().join("chkpt.14"),
            cp_dir.path().join("latest"),
        )
        .unwrap();
        write_log_file(log_dir.path(), "log.a", &[0x0a, 0x63]);
        let newest = write_log_file(log_dir.path(), "log.c8", &[0xc8]);
        std::fs::hard_link(&newest, log_dir.path().join("last")).unwrap();

        let mut store = new_store();
        store.set_parameters("meta.dataStore.", &Properties::new());
        store.load(cp_dir.path(), log_dir.path(), false).unwrap();
        store.start().unwrap();

        // A sequence inside the loaded range resolves to the segment.
        assert!(store
            .handle(ReadMetaData::log_segment(0x20, 0, 1 << 10))
            .is_none());
        // A sequence past the loaded range is a hole.
        let rejected = store
            .handle(ReadMetaData::log_segment(0x90, 0, 1 << 10))
            .expect("rejected");
        assert_eq!(rejected.status, -driftfs_common::status::EFAULT);
        store.shutdown();
    }
}
