//! One thread that runs closures at their deadlines.
//!
//! Jobs are kept in a deadline heap; equal deadlines run in submission order. Dropping the
//! [`TimerWorker`] (or calling [`TimerWorker::cancel`]) discards every job that has not
//! started yet and joins the thread.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};

use crate::panic_message;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Entry {
    deadline: Instant,
    seq: u64,
    job: Job,
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

// Reversed so the max-heap pops the earliest deadline first.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Scheduled {
    deadline: Instant,
    job: Job,
}

pub struct TimerWorker {
    name: String,
    tx: Mutex<Option<Sender<Scheduled>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl TimerWorker {
    pub fn start(name: impl Into<String>) -> io::Result<Self> {
        let name = name.into();
        let (tx, rx) = unbounded::<Scheduled>();
        let handle = thread::Builder::new().name(name.clone()).spawn({
            let name = name.clone();
            move || run_timer(&name, rx)
        })?;
        let worker_id = handle.thread().id();
        Ok(Self {
            name,
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
            worker_id,
        })
    }

    /// Run `job` on the timer thread once `delay` has elapsed. Ignored after [`cancel`].
    ///
    /// [`cancel`]: TimerWorker::cancel
    pub fn schedule(&self, delay: Duration, job: impl FnOnce() + Send + 'static) {
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = guard.as_ref() else {
            tracing::debug!(timer = %self.name, "timer cancelled; job dropped");
            return;
        };
        let scheduled = Scheduled {
            deadline: Instant::now() + delay,
            job: Box::new(job),
        };
        if tx.send(scheduled).is_err() {
            tracing::warn!(timer = %self.name, "timer thread gone; job dropped");
        }
    }

    /// Drop every pending job and stop the thread. Idempotent.
    pub fn cancel(&self) {
        // Closing the channel wakes the thread out of `recv_timeout`.
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(handle) = handle else {
            return;
        };
        if thread::current().id() == self.worker_id {
            return;
        }
        if handle.join().is_err() {
            tracing::error!(timer = %self.name, "timer thread panicked");
        }
    }
}

impl Drop for TimerWorker {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn run_timer(name: &str, rx: Receiver<Scheduled>) {
    tracing::debug!(timer = %name, "timer started");
    let mut heap = BinaryHeap::new();
    let mut seq = 0u64;
    loop {
        let received = match heap.peek() {
            Some(Entry { deadline, .. }) => {
                rx.recv_timeout(deadline.saturating_duration_since(Instant::now()))
            }
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(Scheduled { deadline, job }) => {
                seq += 1;
                heap.push(Entry { deadline, seq, job });
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let now = Instant::now();
        while heap.peek().is_some_and(|e| e.deadline <= now) {
            let Some(entry) = heap.pop() else {
                break;
            };
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(entry.job)) {
                tracing::error!(
                    timer = %name,
                    panic = %panic_message(payload.as_ref()),
                    "timer job panicked"
                );
            }
        }
    }
    if !heap.is_empty() {
        tracing::debug!(timer = %name, discarded = heap.len(), "timer stopped with pending jobs");
    }
}
