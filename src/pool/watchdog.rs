//! Deadline watchdog for advisory job timeouts
//!
//! Job timeouts are cooperative: the watchdog trips the job's cancellation
//! token when the deadline passes, and the running work must notice. One
//! thread serves all deadlines through a min-heap; entries completed before
//! their deadline are discarded when they surface.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::job::CancellationToken;

struct Entry {
    deadline: Instant,
    seq: u64,
    token: CancellationToken,
    done: Arc<AtomicBool>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; invert so the earliest deadline wins.
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.seq.cmp(&self.seq))
    }
}

struct WatchdogInner {
    entries: Mutex<BinaryHeap<Entry>>,
    wakeup: Condvar,
    shutdown: AtomicBool,
    next_seq: AtomicU64,
}

/// Handle for a registered deadline
///
/// Mark it complete when the job finishes in time; the watchdog then skips
/// the entry instead of tripping the token.
pub struct DeadlineHandle {
    done: Arc<AtomicBool>,
}

impl DeadlineHandle {
    /// The job finished; the deadline no longer applies
    pub fn complete(&self) {
        self.done.store(true, Ordering::Release);
    }
}

/// Pool-owned deadline thread
pub struct TimeoutWatchdog {
    inner: Arc<WatchdogInner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimeoutWatchdog {
    /// Create a watchdog; no thread runs until [`start`](Self::start)
    pub fn new() -> Self {
        Self {
            inner: Arc::new(WatchdogInner {
                entries: Mutex::new(BinaryHeap::new()),
                wakeup: Condvar::new(),
                shutdown: AtomicBool::new(false),
                next_seq: AtomicU64::new(0),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Start the deadline thread (idempotent)
    pub fn start(&self, pool_name: &str) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }
        self.inner.shutdown.store(false, Ordering::Release);

        let inner = self.inner.clone();
        let thread = std::thread::Builder::new()
            .name(format!("{pool_name}-watchdog"))
            .spawn(move || run(inner));
        match thread {
            Ok(thread) => *handle = Some(thread),
            Err(err) => debug!(error = %err, "watchdog thread failed to start"),
        }
    }

    /// Stop the deadline thread and drop pending entries
    pub fn stop(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        {
            let mut entries = self.inner.entries.lock();
            entries.clear();
            self.inner.wakeup.notify_all();
        }
        if let Some(thread) = self.handle.lock().take() {
            let _ = thread.join();
        }
    }

    /// Register a deadline for a job's cancellation token
    pub fn register(&self, deadline: Instant, token: CancellationToken) -> DeadlineHandle {
        let done = Arc::new(AtomicBool::new(false));
        let entry = Entry {
            deadline,
            seq: self.inner.next_seq.fetch_add(1, Ordering::Relaxed),
            token,
            done: done.clone(),
        };
        {
            let mut entries = self.inner.entries.lock();
            entries.push(entry);
            self.inner.wakeup.notify_one();
        }
        DeadlineHandle { done }
    }
}

impl Default for TimeoutWatchdog {
    fn default() -> Self {
        Self::new()
    }
}

fn run(inner: Arc<WatchdogInner>) {
    let mut entries = inner.entries.lock();
    loop {
        if inner.shutdown.load(Ordering::Acquire) {
            return;
        }

        let now = Instant::now();
        while let Some(next) = entries.peek() {
            if next.deadline > now {
                break;
            }
            let entry = match entries.pop() {
                Some(entry) => entry,
                None => break,
            };
            if !entry.done.load(Ordering::Acquire) {
                trace!(seq = entry.seq, "deadline elapsed, tripping token");
                entry.token.cancel();
            }
        }

        match entries.peek().map(|e| e.deadline) {
            Some(deadline) => {
                inner.wakeup.wait_until(&mut entries, deadline);
            }
            None => {
                inner.wakeup.wait(&mut entries);
            }
        }
    }
}
