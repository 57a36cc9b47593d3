//! Shared memtable flush pool and per-writer flush tokens.
//!
//! The executor owns a fixed set of OS worker threads draining one flume
//! channel. A [`FlushToken`] serializes the submissions of a single delta
//! writer: tasks enter the token's FIFO queue and at most one drain job per
//! token runs on the pool at a time, so segments appear in submission order.
//! The first flush failure poisons the token; later submissions are drained
//! without flushing and `wait()` keeps returning that first error.

use std::{collections::VecDeque, sync::Arc, thread};

use parking_lot::{Condvar, Mutex};

use crate::{
    error::{LakeError, Result},
    logging::lake_log,
    memtable::MemTable,
    tabletwriter::SegmentInfo,
};

type Job = Box<dyn FnOnce() + Send>;

/// Callback invoked after each successful flush with the emitted segment,
/// if any, and the end-of-stream flag of the submission.
pub(crate) type OnFlush = Box<dyn Fn(Option<&SegmentInfo>, bool) + Send + Sync>;

/// Process-wide flush thread pool.
pub(crate) struct FlushExecutor {
    tx: flume::Sender<Job>,
}

impl FlushExecutor {
    pub(crate) fn new(threads: usize) -> Self {
        let (tx, rx) = flume::unbounded::<Job>();
        for i in 0..threads.max(1) {
            let rx = rx.clone();
            thread::Builder::new()
                .name(format!("memtable-flush-{i}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
                .expect("flush worker thread should spawn");
        }
        Self { tx }
    }

    /// Create an exclusive submission token bound to this pool.
    pub(crate) fn create_flush_token(self: &Arc<Self>) -> FlushToken {
        FlushToken {
            executor: Arc::clone(self),
            inner: Arc::new(TokenInner {
                state: Mutex::new(TokenState::default()),
                cond: Condvar::new(),
            }),
        }
    }

    fn execute(&self, job: Job) {
        // workers never exit while the engine lives, so the channel stays open
        let _ = self.tx.send(job);
    }
}

struct FlushTask {
    mem_table: MemTable,
    eos: bool,
    on_flush: OnFlush,
}

#[derive(Default)]
struct TokenState {
    queue: VecDeque<FlushTask>,
    active: bool,
    inflight: usize,
    status: Option<LakeError>,
    flushed: usize,
}

struct TokenInner {
    state: Mutex<TokenState>,
    cond: Condvar,
}

/// Counters exposed by a flush token.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlushTokenStats {
    /// Memtables submitted but not yet flushed (queued plus in-flight).
    pub queueing_memtable_num: usize,
    /// Memtables flushed successfully since the token was created.
    pub flushed_memtable_num: usize,
}

/// FIFO submission channel into the shared flush pool, owned by one writer.
pub struct FlushToken {
    executor: Arc<FlushExecutor>,
    inner: Arc<TokenInner>,
}

impl FlushToken {
    /// Queue a finalized memtable for flushing.
    pub(crate) fn submit(&self, mem_table: MemTable, eos: bool, on_flush: OnFlush) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.queue.push_back(FlushTask {
            mem_table,
            eos,
            on_flush,
        });
        if !state.active {
            state.active = true;
            let inner = Arc::clone(&self.inner);
            self.executor.execute(Box::new(move || drain(inner)));
        }
        Ok(())
    }

    /// Block until every prior submission has been processed, returning the
    /// token's sticky status.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        while state.active || !state.queue.is_empty() {
            self.inner.cond.wait(&mut state);
        }
        match &state.status {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Current counters.
    pub fn stats(&self) -> FlushTokenStats {
        let state = self.inner.state.lock();
        FlushTokenStats {
            queueing_memtable_num: state.queue.len() + state.inflight,
            flushed_memtable_num: state.flushed,
        }
    }
}

fn drain(inner: Arc<TokenInner>) {
    loop {
        let (task, poisoned) = {
            let mut state = inner.state.lock();
            match state.queue.pop_front() {
                Some(task) => {
                    state.inflight = 1;
                    (task, state.status.is_some())
                }
                None => {
                    state.active = false;
                    inner.cond.notify_all();
                    return;
                }
            }
        };

        let FlushTask {
            mut mem_table,
            eos,
            on_flush,
        } = task;

        let result = if poisoned { Ok(None) } else { mem_table.flush() };
        // drop buffers before anyone waiting on the token wakes up
        drop(mem_table);

        let flushed_ok = match result {
            Ok(segment) => {
                if !poisoned {
                    on_flush(segment.as_ref(), eos);
                }
                !poisoned
            }
            Err(err) => {
                lake_log!(log::Level::Warn, "memtable_flush_failed", "error={}", err);
                let mut state = inner.state.lock();
                if state.status.is_none() {
                    state.status = Some(err);
                }
                false
            }
        };

        let mut state = inner.state.lock();
        state.inflight = 0;
        if flushed_ok {
            state.flushed += 1;
        }
        if state.queue.is_empty() {
            state.active = false;
            inner.cond.notify_all();
            return;
        }
    }
}
