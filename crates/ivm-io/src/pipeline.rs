//! Parallel output pipeline.
//!
//! A classic producer/consumer pair of queues: finished frame records
//! wait on one, idle buffer sets come back on the other, and N-1
//! detached workers drain the first into the filesystem. Counters are
//! plain atomics; `requested` is bumped strictly after the enqueue and
//! `processed` strictly after the write, so `processed == requested`
//! means every submitted frame is durably on disk.

use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crate::frame::{FrameBuffers, FrameRecord};
use crate::output;

/// Default worker-pool size (emulator thread included).
pub const DEFAULT_THREADS: usize = 8;

/// Thread count: the build default, overridden by the `NUM_THREADS`
/// environment variable, clamped to at least one worker plus the
/// emulator.
pub fn thread_count() -> usize {
    let n = std::env::var("NUM_THREADS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(DEFAULT_THREADS);
    n.max(2)
}

struct BlockingQueue<T> {
    items: Mutex<VecDeque<T>>,
    not_empty: Condvar,
}

impl<T> BlockingQueue<T> {
    fn new() -> Self {
        BlockingQueue {
            items: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
        }
    }

    fn push(&self, item: T) {
        let mut items = self.items.lock().unwrap();
        items.push_back(item);
        self.not_empty.notify_one();
    }

    fn pop_wait(&self) -> T {
        let mut items = self.items.lock().unwrap();
        loop {
            if let Some(item) = items.pop_front() {
                return item;
            }
            items = self.not_empty.wait(items).unwrap();
        }
    }

    fn try_pop(&self) -> Option<T> {
        self.items.lock().unwrap().pop_front()
    }
}

struct Shared {
    wait_queue: BlockingQueue<FrameRecord>,
    free_queue: BlockingQueue<FrameBuffers>,
    requested: AtomicU64,
    processed: AtomicU64,
    failure: Mutex<Option<io::Error>>,
    out_dir: Option<PathBuf>,
}

/// Hands finished frames to the worker pool and recycles their buffers.
pub struct QueueHandler {
    shared: Arc<Shared>,
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let record = shared.wait_queue.pop_wait();
        if let Some(dir) = &shared.out_dir {
            if let Err(e) = output::write_frame(dir, &record) {
                error!("frame {:08} write failed: {}", record.seq, e);
                let mut failure = shared.failure.lock().unwrap();
                failure.get_or_insert(e);
            }
        }
        shared.processed.fetch_add(1, Ordering::SeqCst);
        shared.free_queue.push(record.into_buffers());
    }
}

impl QueueHandler {
    /// Spawn `workers` detached worker threads writing under `out_dir`.
    pub fn start(out_dir: Option<PathBuf>, workers: usize) -> Self {
        let shared = Arc::new(Shared {
            wait_queue: BlockingQueue::new(),
            free_queue: BlockingQueue::new(),
            requested: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            failure: Mutex::new(None),
            out_dir,
        });
        debug!("output pipeline: {} workers", workers);
        for _ in 0..workers.max(1) {
            let shared = Arc::clone(&shared);
            thread::spawn(move || worker_loop(shared));
        }
        QueueHandler { shared }
    }

    /// A recycled buffer set if one is idle, else a fresh one. Never
    /// blocks.
    pub fn recycle(&self) -> FrameBuffers {
        self.shared
            .free_queue
            .try_pop()
            .unwrap_or_else(FrameBuffers::new)
    }

    /// Enqueue a finished frame for the workers.
    pub fn submit(&self, record: FrameRecord) {
        self.shared.wait_queue.push(record);
        self.shared.requested.fetch_add(1, Ordering::SeqCst);
    }

    /// Frames submitted so far.
    pub fn requested(&self) -> u64 {
        self.shared.requested.load(Ordering::SeqCst)
    }

    /// Frames written so far.
    pub fn processed(&self) -> u64 {
        self.shared.processed.load(Ordering::SeqCst)
    }

    /// Block until every submitted frame has been written, then release
    /// the idle buffer sets.
    pub fn wait_until_processed(&self) {
        while self.processed() < self.requested() {
            if self.shared.free_queue.try_pop().is_none() {
                thread::sleep(Duration::from_millis(1));
            }
        }
        while self.shared.free_queue.try_pop().is_some() {}
    }

    /// The first worker write failure, if any occurred.
    pub fn failure(&self) -> Option<String> {
        self.shared
            .failure
            .lock()
            .unwrap()
            .as_ref()
            .map(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::*;

    fn record(seq: u32, body: &[u8]) -> FrameRecord {
        let mut buffers = FrameBuffers::new();
        buffers.bytes.extend_from_slice(body);
        FrameRecord {
            seq,
            buffers,
            width: 0,
            height: 0,
            sample_rate: 0,
            append_text: false,
            append_bytes: false,
        }
    }

    #[test]
    fn test_all_submitted_frames_are_written() {
        let dir = TempDir::new("ivm-pipeline").unwrap();
        let handler = QueueHandler::start(Some(dir.path().to_path_buf()), 3);
        for seq in 0..20 {
            let _ = handler.recycle();
            handler.submit(record(seq, b"payload"));
        }
        handler.wait_until_processed();
        assert_eq!(handler.processed(), handler.requested());
        assert_eq!(handler.processed(), 20);
        for seq in 0..20 {
            assert!(dir.path().join(format!("{:08}.bytes", seq)).exists());
        }
    }

    #[test]
    fn test_buffer_sets_are_recycled() {
        let handler = QueueHandler::start(None, 1);
        handler.submit(record(0, b"x"));
        // Wait for the worker to hand the set back.
        while handler.processed() < 1 {
            thread::sleep(Duration::from_millis(1));
        }
        let buffers = handler.recycle();
        assert_eq!(buffers.bytes, b"x".to_vec());
    }

    #[test]
    fn test_write_failure_is_surfaced() {
        let dir = TempDir::new("ivm-pipeline").unwrap();
        let missing = dir.path().join("nope");
        let handler = QueueHandler::start(Some(missing), 1);
        handler.submit(record(0, b"x"));
        handler.wait_until_processed();
        assert!(handler.failure().is_some());
    }

    #[test]
    fn test_thread_count_floor() {
        assert!(thread_count() >= 2);
    }
}
