//! Checkpoint and transaction log reader
//!
//! `MetaDataStore` serves checkpoint and log-segment content to
//! replicas and recovery clients. Files are registered by log sequence
//! and partitioned round-robin across a pool of worker threads; each
//! entry's descriptor is opened lazily, cached, and reclaimed by a
//! recency list with age- and count-based pruning.
//!
//! One mutex guards all tables; every read, open, close and unlink
//! happens with the mutex released, with the entry pinned by its use
//! count. Completions flow back to the event loop, which hands them out
//! on its once-a-second tick.

use crate::lru::LruList;
use driftfs_common::{status, Error, LogSeq, Properties, Result};
use driftfs_netio::{NetManager, TimeoutHandler};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{BTreeMap, VecDeque};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::ops::Bound;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error};

/// An asynchronous metadata read. Built by the replication RPC layer,
/// resolved and filled by the store, delivered through the completion
/// callback.
#[derive(Debug, Default)]
pub struct ReadMetaData {
    /// Checkpoint read when set; log-segment read otherwise.
    pub checkpoint: bool,
    /// Requested log sequence; rewritten to the resolved entry's start
    /// sequence on admission.
    pub start_log_seq: LogSeq,
    pub read_pos: i64,
    pub read_size: usize,
    pub data: Vec<u8>,
    pub status: i32,
    pub status_msg: String,
}

impl ReadMetaData {
    pub fn checkpoint(start_log_seq: LogSeq, read_pos: i64, read_size: usize) -> Self {
        Self {
            checkpoint: true,
            start_log_seq,
            read_pos,
            read_size,
            ..Self::default()
        }
    }

    pub fn log_segment(start_log_seq: LogSeq, read_pos: i64, read_size: usize) -> Self {
        Self {
            checkpoint: false,
            start_log_seq,
            read_pos,
            read_size,
            ..Self::default()
        }
    }
}

/// A registered checkpoint or log segment file. Checkpoints have
/// `log_end_seq == log_seq`.
#[derive(Debug)]
struct Entry {
    log_seq: LogSeq,
    log_end_seq: LogSeq,
    file_name: PathBuf,
    thread_idx: usize,
    file: Option<File>,
    use_count: u32,
    access_time: i64,
    pending_delete: bool,
}

impl Entry {
    fn new(log_seq: LogSeq, log_end_seq: LogSeq, file_name: PathBuf, thread_idx: usize) -> Self {
        Self {
            log_seq,
            log_end_seq,
            file_name,
            thread_idx,
            file: None,
            use_count: 0,
            access_time: 0,
            pending_delete: false,
        }
    }

    fn is_in_use(&self) -> bool {
        self.use_count > 0
    }

    /// Reclaimable once idle and either aged out or without an open
    /// descriptor.
    fn can_expire(&self, expire_time: i64) -> bool {
        self.use_count == 0 && (self.access_time < expire_time || self.file.is_none())
    }
}

struct State {
    stop: bool,
    queues: Vec<VecDeque<ReadMetaData>>,
    done_queue: Vec<ReadMetaData>,
    checkpoints: BTreeMap<LogSeq, Entry>,
    log_segments: BTreeMap<LogSeq, Entry>,
    checkpoint_lru: LruList,
    log_segment_lru: LruList,
    min_log_seq: LogSeq,
    prune_logs: bool,
    pending_delete_count: usize,
    max_read_size: usize,
    max_inactive_time: i64,
    max_checkpoints_to_keep: usize,
    cur_thread_idx: usize,
    worker_count: usize,
    pending_count: usize,
    now: i64,
}

impl State {
    /// Reclaim idle descriptors from the cold end of both recency
    /// lists; entries already condemned are erased and their files
    /// queued for deletion.
    fn expire(&mut self, delete_list: &mut Vec<PathBuf>, close_list: &mut Vec<File>) {
        let expire_time = self.now - self.max_inactive_time;
        let before = delete_list.len();
        expire_table(
            &mut self.checkpoints,
            &mut self.checkpoint_lru,
            expire_time,
            delete_list,
            close_list,
        );
        let delta = delete_list.len() - before;
        debug_assert!(delta <= self.pending_delete_count);
        self.pending_delete_count -= delta.min(self.pending_delete_count);
        expire_table(
            &mut self.log_segments,
            &mut self.log_segment_lru,
            expire_time,
            delete_list,
            close_list,
        );
    }

    /// Enforce the checkpoint retention cap, then drop log segments no
    /// recovery can need anymore.
    fn prune(&mut self, delete_list: &mut Vec<PathBuf>, close_list: &mut Vec<File>) {
        let mut prune_count = self.checkpoints.len() as i64
            - self.max_checkpoints_to_keep as i64
            - self.pending_delete_count as i64;
        let pruned_any = prune_count > 0;
        let prev_min = self.min_log_seq;
        let mut cursor = self.checkpoints.keys().next().copied();
        while prune_count > 0 {
            let Some(seq) = cursor else {
                break;
            };
            cursor = self
                .checkpoints
                .range((Bound::Excluded(seq), Bound::Unbounded))
                .next()
                .map(|(&k, _)| k);
            let entry = self.checkpoints.get_mut(&seq).expect("cursor entry");
            if self.min_log_seq < entry.log_seq {
                self.min_log_seq = entry.log_seq;
            }
            if entry.is_in_use() {
                if !entry.pending_delete {
                    entry.pending_delete = true;
                    self.pending_delete_count += 1;
                }
            } else {
                if let Some(f) = entry.file.take() {
                    close_list.push(f);
                }
                delete_list.push(entry.file_name.clone());
                self.checkpoint_lru.remove(seq);
                self.checkpoints.remove(&seq);
            }
            prune_count -= 1;
        }
        if pruned_any {
            // Recovery starts from the oldest checkpoint still
            // serveable; logs before it are dead weight.
            let oldest_kept = self
                .checkpoints
                .iter()
                .find(|(_, e)| !e.pending_delete)
                .map(|(&seq, _)| seq);
            if let Some(seq) = oldest_kept {
                if self.min_log_seq < seq {
                    self.min_log_seq = seq;
                }
            }
        }
        if self.prune_logs || prev_min < self.min_log_seq {
            self.prune_logs = false;
            let min = self.min_log_seq;
            let mut cursor = self.log_segments.keys().next().copied();
            while let Some(seq) = cursor {
                cursor = self
                    .log_segments
                    .range((Bound::Excluded(seq), Bound::Unbounded))
                    .next()
                    .map(|(&k, _)| k);
                let entry = self.log_segments.get_mut(&seq).expect("cursor entry");
                if entry.log_end_seq >= min {
                    break;
                }
                if entry.is_in_use() {
                    entry.pending_delete = true;
                } else {
                    if let Some(f) = entry.file.take() {
                        close_list.push(f);
                    }
                    delete_list.push(entry.file_name.clone());
                    self.log_segment_lru.remove(seq);
                    self.log_segments.remove(&seq);
                }
            }
        }
    }
}

fn expire_table(
    table: &mut BTreeMap<LogSeq, Entry>,
    lru: &mut LruList,
    expire_time: i64,
    delete_list: &mut Vec<PathBuf>,
    close_list: &mut Vec<File>,
) {
    while let Some(seq) = lru.front() {
        let entry = table.get_mut(&seq).expect("lru entry in table");
        if !entry.can_expire(expire_time) {
            break;
        }
        lru.remove(seq);
        if let Some(f) = entry.file.take() {
            close_list.push(f);
        }
        if entry.pending_delete {
            delete_list.push(entry.file_name.clone());
            table.remove(&seq);
        }
    }
}

fn update_lru(entry: &mut Entry, lru: &mut LruList, now: i64) {
    if entry.use_count == 0 && entry.file.is_none() {
        if entry.pending_delete {
            // Nothing left to reclaim but the table slot; make it the
            // first expire candidate.
            lru.push_front(entry.log_seq);
        } else {
            lru.remove(entry.log_seq);
        }
    } else {
        lru.push_back(entry.log_seq);
    }
    entry.access_time = now;
}

struct Shared {
    mutex: Mutex<State>,
    done_count: AtomicI64,
}

struct CondSet(Vec<Condvar>);

/// Event-loop-side handle to the store.
pub struct MetaDataStore {
    shared: Arc<Shared>,
    conds: Option<Arc<CondSet>>,
    threads: Vec<JoinHandle<()>>,
    net: Rc<dyn NetManager>,
    on_done: Box<dyn FnMut(ReadMetaData)>,
    now_cache: i64,
}

impl MetaDataStore {
    /// `on_done` receives every completed read on the event loop
    /// thread, from [`Self::timeout`].
    pub fn new(net: Rc<dyn NetManager>, on_done: Box<dyn FnMut(ReadMetaData)>) -> Self {
        let now = net.now();
        Self {
            shared: Arc::new(Shared {
                mutex: Mutex::new(State {
                    stop: false,
                    queues: Vec::new(),
                    done_queue: Vec::new(),
                    checkpoints: BTreeMap::new(),
                    log_segments: BTreeMap::new(),
                    checkpoint_lru: LruList::new(),
                    log_segment_lru: LruList::new(),
                    min_log_seq: -1,
                    prune_logs: false,
                    pending_delete_count: 0,
                    max_read_size: 2 << 20,
                    max_inactive_time: 60,
                    max_checkpoints_to_keep: 16,
                    cur_thread_idx: 0,
                    worker_count: 1,
                    pending_count: 0,
                    now,
                }),
                done_count: AtomicI64::new(0),
            }),
            conds: None,
            threads: Vec::new(),
            net,
            on_done,
            now_cache: now,
        }
    }

    /// Tune the store. `prefix` scopes the recognized keys
    /// (`<prefix>maxReadSize`, `<prefix>maxInactiveTime`,
    /// `<prefix>maxCheckpointsToKeepCount`, `<prefix>threadCount`).
    /// The thread count only takes effect before [`Self::start`].
    pub fn set_parameters(&self, prefix: &str, props: &Properties) {
        let mut guard = self.shared.mutex.lock();
        let state = &mut *guard;
        state.max_read_size = props
            .get_usize(&format!("{prefix}maxReadSize"), state.max_read_size)
            .max(64 << 10);
        state.max_inactive_time = props
            .get_i64(&format!("{prefix}maxInactiveTime"), state.max_inactive_time)
            .max(10);
        state.max_checkpoints_to_keep = props
            .get_usize(
                &format!("{prefix}maxCheckpointsToKeepCount"),
                state.max_checkpoints_to_keep,
            )
            .max(1);
        if self.conds.is_none() {
            state.worker_count = props
                .get_usize(&format!("{prefix}threadCount"), state.worker_count)
                .max(1);
        }
        if state.pending_count == 0 && !state.stop {
            if let Some(conds) = self.conds.as_ref() {
                conds.0[0].notify_one();
            }
        }
    }

    /// Register a checkpoint file at `log_seq`. Duplicate sequences and
    /// invalid arguments are bugs in the caller.
    pub fn register_checkpoint(&self, file_name: impl Into<PathBuf>, log_seq: LogSeq) {
        let file_name = file_name.into();
        let mut guard = self.shared.mutex.lock();
        let state = &mut *guard;
        if file_name.as_os_str().is_empty()
            || log_seq < 0
            || state.checkpoints.contains_key(&log_seq)
        {
            error!(
                "invalid checkpoint: sequence: {log_seq} file: {}",
                file_name.display()
            );
            panic!("invalid checkpoint registration attempt");
        }
        let thread_idx = state.cur_thread_idx;
        state
            .checkpoints
            .insert(log_seq, Entry::new(log_seq, log_seq, file_name, thread_idx));
        state.cur_thread_idx = (state.cur_thread_idx + 1) % state.worker_count;
        if state.pending_count == 0 && !state.stop {
            if let Some(conds) = self.conds.as_ref() {
                conds.0[0].notify_one();
            }
        }
    }

    /// Register a log segment covering `[start_seq, end_seq]`.
    pub fn register_log_segment(
        &self,
        file_name: impl Into<PathBuf>,
        start_seq: LogSeq,
        end_seq: LogSeq,
    ) {
        let file_name = file_name.into();
        let mut guard = self.shared.mutex.lock();
        let state = &mut *guard;
        if file_name.as_os_str().is_empty()
            || start_seq < 0
            || end_seq < start_seq
            || state.log_segments.contains_key(&start_seq)
        {
            error!(
                "invalid log segment: sequence: {start_seq} end seq: {end_seq} file: {}",
                file_name.display()
            );
            panic!("invalid log segment registration attempt");
        }
        let stale = end_seq < state.min_log_seq;
        let wake = stale && !state.prune_logs && state.pending_count == 0 && !state.stop;
        if stale {
            state.prune_logs = true;
        }
        let thread_idx = state.cur_thread_idx;
        state.log_segments.insert(
            start_seq,
            Entry::new(start_seq, end_seq, file_name, thread_idx),
        );
        state.cur_thread_idx = (state.cur_thread_idx + 1) % state.worker_count;
        if wake {
            if let Some(conds) = self.conds.as_ref() {
                conds.0[0].notify_one();
            }
        }
    }

    /// Admit an asynchronous read. Validation failures complete
    /// immediately and hand the op back with its status set; admitted
    /// ops complete through the done callback.
    pub fn handle(&self, mut op: ReadMetaData) -> Option<ReadMetaData> {
        let Some(conds) = self.conds.as_ref() else {
            op.status = -status::ENOENT;
            op.status_msg = "shutdown".to_string();
            return Some(op);
        };
        let mut guard = self.shared.mutex.lock();
        let state = &mut *guard;
        if state.stop {
            op.status = -status::ENOENT;
            op.status_msg = "shutdown".to_string();
            return Some(op);
        }
        if op.checkpoint {
            if state.checkpoints.is_empty() {
                op.status = -status::ENOENT;
                op.status_msg = "no checkpoint exists".to_string();
                return Some(op);
            }
            let seq = if op.start_log_seq < 0 {
                // Serve the newest checkpoint from its beginning.
                let (&seq, _) = state.checkpoints.iter().next_back().expect("non empty");
                op.start_log_seq = seq;
                op.read_pos = 0;
                seq
            } else {
                if !state.checkpoints.contains_key(&op.start_log_seq) {
                    op.status = -status::ENOENT;
                    op.status_msg = "no such checkpoint".to_string();
                    return Some(op);
                }
                op.start_log_seq
            };
            admit(state, conds, seq, op, true);
            return None;
        }
        if op.start_log_seq < 0 {
            op.status = -status::EINVAL;
            op.status_msg = "invalid log sequence".to_string();
            return Some(op);
        }
        let seq = if op.read_pos > 0 {
            // Continuation reads must name the segment they started on.
            if !state.log_segments.contains_key(&op.start_log_seq) {
                op.status = -status::EINVAL;
                op.status_msg = "no such log sequence".to_string();
                return Some(op);
            }
            op.start_log_seq
        } else {
            let found = state
                .log_segments
                .range(..=op.start_log_seq)
                .next_back()
                .map(|(&seq, entry)| (seq, entry.log_end_seq));
            match found {
                None => {
                    op.status = -status::ENOENT;
                    op.status_msg = "no such log segment".to_string();
                    return Some(op);
                }
                Some((_, end)) if end < op.start_log_seq => {
                    // The sequence falls between known segments.
                    op.status = -status::EFAULT;
                    op.status_msg = "missing log segment".to_string();
                    return Some(op);
                }
                Some((seq, _)) => {
                    op.start_log_seq = seq;
                    seq
                }
            }
        };
        admit(state, conds, seq, op, false);
        None
    }

    /// Start the worker pool.
    pub fn start(&mut self) -> Result<()> {
        if self.conds.is_some() {
            return Err(Error::AlreadyRunning);
        }
        let worker_count = {
            let mut guard = self.shared.mutex.lock();
            guard.stop = false;
            let n = guard.worker_count;
            guard.queues = (0..n).map(|_| VecDeque::new()).collect();
            n
        };
        let conds = Arc::new(CondSet((0..worker_count).map(|_| Condvar::new()).collect()));
        for idx in 0..worker_count {
            let shared = self.shared.clone();
            let conds = conds.clone();
            let handle = std::thread::Builder::new()
                .name(format!("meta-data-store-{idx}"))
                .spawn(move || worker_main(&shared, &conds, idx))
                .map_err(Error::Io)?;
            self.threads.push(handle);
        }
        self.conds = Some(conds);
        Ok(())
    }

    /// Stop the workers and join them. Queued reads complete with
    /// canceled status and are delivered on the next tick.
    pub fn shutdown(&mut self) {
        let Some(conds) = self.conds.take() else {
            return;
        };
        {
            let mut guard = self.shared.mutex.lock();
            guard.stop = true;
            for cond in &conds.0 {
                cond.notify_one();
            }
        }
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }

    pub(crate) fn contains_checkpoint(&self, seq: LogSeq) -> bool {
        self.shared.mutex.lock().checkpoints.contains_key(&seq)
    }

    pub(crate) fn contains_log_segment(&self, seq: LogSeq) -> bool {
        self.shared.mutex.lock().log_segments.contains_key(&seq)
    }

    #[cfg(test)]
    pub(crate) fn checkpoint_seqs(&self) -> Vec<LogSeq> {
        self.shared.mutex.lock().checkpoints.keys().copied().collect()
    }

    #[cfg(test)]
    pub(crate) fn log_segment_ranges(&self) -> Vec<(LogSeq, LogSeq)> {
        self.shared
            .mutex
            .lock()
            .log_segments
            .values()
            .map(|e| (e.log_seq, e.log_end_seq))
            .collect()
    }

    /// Event loop tick: deliver completed reads and nudge the reclaim
    /// pass when idle descriptors have aged out.
    pub fn timeout(&mut self) {
        let now = self.net.now();
        if self.shared.done_count.load(Ordering::Relaxed) <= 0 && now == self.now_cache {
            return;
        }
        self.now_cache = now;
        let done = {
            let mut guard = self.shared.mutex.lock();
            let state = &mut *guard;
            state.now = now;
            self.shared.done_count.store(0, Ordering::Relaxed);
            let done = std::mem::take(&mut state.done_queue);
            if state.pending_count == 0 && !state.stop {
                let expire_time = now - state.max_inactive_time;
                let aged = lru_head_older(&state.checkpoints, &state.checkpoint_lru, expire_time)
                    || lru_head_older(&state.log_segments, &state.log_segment_lru, expire_time);
                if aged {
                    if let Some(conds) = self.conds.as_ref() {
                        conds.0[0].notify_one();
                    }
                }
            }
            done
        };
        for op in done {
            (self.on_done)(op);
        }
    }
}

impl TimeoutHandler for MetaDataStore {
    fn timeout(&mut self) {
        MetaDataStore::timeout(self);
    }
}

impl Drop for MetaDataStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lru_head_older(table: &BTreeMap<LogSeq, Entry>, lru: &LruList, expire_time: i64) -> bool {
    lru.front()
        .and_then(|seq| table.get(&seq))
        .map(|entry| entry.access_time < expire_time)
        .unwrap_or(false)
}

fn admit(state: &mut State, conds: &CondSet, seq: LogSeq, op: ReadMetaData, checkpoint: bool) {
    let now = state.now;
    let (table, lru) = if checkpoint {
        (&mut state.checkpoints, &mut state.checkpoint_lru)
    } else {
        (&mut state.log_segments, &mut state.log_segment_lru)
    };
    let entry = table.get_mut(&seq).expect("validated entry");
    entry.use_count += 1;
    update_lru(entry, lru, now);
    let idx = entry.thread_idx;
    assert!(idx < state.queues.len(), "thread index out of range");
    state.queues[idx].push_back(op);
    state.pending_count += 1;
    conds.0[idx].notify_one();
}

fn worker_main(shared: &Shared, conds: &CondSet, idx: usize) {
    let mut delete_list: Vec<PathBuf> = Vec::with_capacity(16);
    let mut close_list: Vec<File> = Vec::with_capacity(32);
    let mut guard = shared.mutex.lock();
    while !guard.stop {
        if guard.queues[idx].is_empty() {
            conds.0[idx].wait(&mut guard);
        }
        while let Some(mut op) = guard.queues[idx].pop_front() {
            if guard.stop {
                op.status = -status::ECANCELED;
                op.status_msg = "canceled by shutdown".to_string();
            } else {
                process(&mut guard, &mut op);
            }
            debug_assert!(guard.pending_count > 0);
            guard.pending_count -= 1;
            guard.done_queue.push(op);
            shared.done_count.fetch_add(1, Ordering::Relaxed);
        }
        delete_list.clear();
        close_list.clear();
        guard.expire(&mut delete_list, &mut close_list);
        guard.prune(&mut delete_list, &mut close_list);
        if !delete_list.is_empty() || !close_list.is_empty() {
            MutexGuard::unlocked(&mut guard, || {
                close_list.clear();
                for name in delete_list.drain(..) {
                    if let Err(err) = std::fs::remove_file(&name) {
                        error!("delete {}: {err}", name.display());
                    }
                }
            });
        }
    }
}

/// Perform one read with the mutex released. The entry cannot be erased
/// underneath us: its use count was bumped at admission.
fn process(guard: &mut MutexGuard<'_, State>, op: &mut ReadMetaData) {
    let mut file;
    let file_name;
    let read_pos;
    let read_size;
    {
        let state = &mut **guard;
        let now = state.now;
        let max_read = state.max_read_size;
        let (table, lru) = if op.checkpoint {
            (&mut state.checkpoints, &mut state.checkpoint_lru)
        } else {
            (&mut state.log_segments, &mut state.log_segment_lru)
        };
        let Some(entry) = table.get_mut(&op.start_log_seq) else {
            op.status = -status::EFAULT;
            op.status_msg = "internal error -- no such entry".to_string();
            return;
        };
        assert!(entry.use_count > 0);
        update_lru(entry, lru, now);
        file = entry.file.take();
        file_name = entry.file_name.clone();
        read_pos = op.read_pos.max(0) as u64;
        read_size = op.read_size.min(max_read);
    }
    MutexGuard::unlocked(guard, || {
        if file.is_none() {
            match File::open(&file_name) {
                Ok(f) => file = Some(f),
                Err(err) => {
                    error!("open: {}: {err}", file_name.display());
                    op.status = -status::EIO;
                    op.status_msg = "failed to open file".to_string();
                }
            }
        }
        if let Some(f) = file.as_mut() {
            match read_at(f, read_pos, read_size) {
                Ok(data) => {
                    debug!(
                        "read: {} pos: {read_pos} {} bytes",
                        file_name.display(),
                        data.len()
                    );
                    op.data = data;
                }
                Err(err) => {
                    error!("read: {}: {err}", file_name.display());
                    op.status = -status::EIO;
                    op.status_msg = err.to_string();
                }
            }
        }
    });
    let state = &mut **guard;
    let now = state.now;
    let (table, lru) = if op.checkpoint {
        (&mut state.checkpoints, &mut state.checkpoint_lru)
    } else {
        (&mut state.log_segments, &mut state.log_segment_lru)
    };
    let entry = table
        .get_mut(&op.start_log_seq)
        .expect("entry pinned by use count");
    entry.file = file;
    entry.use_count -= 1;
    update_lru(entry, lru, now);
}

fn read_at(file: &mut File, pos: u64, size: usize) -> std::io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(pos))?;
    let mut buf = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}
