//! Asynchronous notification dispatcher.
//!
//! Producers on any thread call [`EventQueueWorker::add`]; one named worker thread runs the
//! closures strictly in submission order. [`EventQueueWorker::flush`] blocks until everything
//! queued before it has run.
//!
//! Shutdown is deterministic: dropping the worker lets the in-flight closure finish, discards
//! everything still queued and joins the thread.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};

use crate::panic_message;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct EventQueueWorker {
    name: String,
    tx: Option<Sender<Job>>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    worker_id: ThreadId,
}

impl EventQueueWorker {
    /// Spawn the worker thread.
    pub fn start(name: impl Into<String>) -> io::Result<Self> {
        let name = name.into();
        let (tx, rx) = unbounded::<Job>();
        let shutdown = Arc::new(AtomicBool::new(false));

        let handle = thread::Builder::new().name(name.clone()).spawn({
            let shutdown = shutdown.clone();
            let name = name.clone();
            move || run_worker(&name, rx, &shutdown)
        })?;
        let worker_id = handle.thread().id();

        Ok(Self {
            name,
            tx: Some(tx),
            shutdown,
            handle: Some(handle),
            worker_id,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue `job` behind everything already added.
    pub fn add(&self, job: impl FnOnce() + Send + 'static) {
        let Some(tx) = self.tx.as_ref() else {
            return;
        };
        if tx.send(Box::new(job)).is_err() {
            tracing::warn!(worker = %self.name, "event worker gone; dropping closure");
        }
    }

    /// Block until every closure added before this call has run.
    ///
    /// Calling it from inside a queued closure returns immediately, since waiting on our own
    /// thread could never complete.
    pub fn flush(&self) {
        if thread::current().id() == self.worker_id {
            tracing::warn!(worker = %self.name, "flush called from the worker thread; skipping");
            return;
        }
        let (done_tx, done_rx) = bounded::<()>(1);
        self.add(move || {
            let _ = done_tx.send(());
        });
        // An error means the worker stopped and dropped the marker.
        let _ = done_rx.recv();
    }
}

impl Drop for EventQueueWorker {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Closing the channel wakes a worker blocked in `recv`.
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if thread::current().id() == self.worker_id {
                // Dropped by one of our own closures; the loop exits on its own.
                return;
            }
            if handle.join().is_err() {
                tracing::error!(worker = %self.name, "event worker thread panicked");
            }
        }
    }
}

fn run_worker(name: &str, rx: Receiver<Job>, shutdown: &AtomicBool) {
    tracing::debug!(worker = %name, "event worker started");
    while let Ok(job) = rx.recv() {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            tracing::error!(
                worker = %name,
                panic = %panic_message(payload.as_ref()),
                "event closure panicked"
            );
        }
    }
    let discarded = rx.try_iter().count();
    if discarded > 0 {
        tracing::debug!(worker = %name, discarded, "event worker stopped with queued closures");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn runs_closures_in_fifo_order() {
        let worker = EventQueueWorker::start("test-fifo").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100 {
            let seen = seen.clone();
            worker.add(move || seen.lock().unwrap().push(i));
        }
        worker.flush();
        assert_eq!(*seen.lock().unwrap(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn flush_waits_for_earlier_closures() {
        let worker = EventQueueWorker::start("test-flush").unwrap();
        let done = Arc::new(AtomicBool::new(false));
        {
            let done = done.clone();
            worker.add(move || {
                thread::sleep(Duration::from_millis(50));
                done.store(true, Ordering::SeqCst);
            });
        }
        worker.flush();
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn closures_run_on_the_named_thread() {
        let worker = EventQueueWorker::start("test-named").unwrap();
        let (tx, rx) = bounded(1);
        worker.add(move || {
            let _ = tx.send(thread::current().name().map(str::to_string));
        });
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("test-named"));
    }

    #[test]
    fn panicking_closure_does_not_stop_the_worker() {
        let worker = EventQueueWorker::start("test-panic").unwrap();
        let after = Arc::new(AtomicBool::new(false));
        worker.add(|| panic!("boom"));
        {
            let after = after.clone();
            worker.add(move || after.store(true, Ordering::SeqCst));
        }
        worker.flush();
        assert!(after.load(Ordering::SeqCst));
    }

    #[test]
    fn drop_discards_queued_closures() {
        let worker = EventQueueWorker::start("test-drop").unwrap();
        let (started_tx, started_rx) = bounded::<()>(1);
        let (release_tx, release_rx) = bounded::<()>(1);
        let ran_later = Arc::new(AtomicBool::new(false));

        worker.add(move || {
            let _ = started_tx.send(());
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
        });
        {
            let ran_later = ran_later.clone();
            worker.add(move || ran_later.store(true, Ordering::SeqCst));
        }
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let _ = release_tx.send(());
        });
        drop(worker);
        releaser.join().unwrap();

        assert!(!ran_later.load(Ordering::SeqCst));
    }

    #[test]
    fn flush_inside_a_closure_returns() {
        let worker = Arc::new(EventQueueWorker::start("test-reentrant").unwrap());
        let (tx, rx) = bounded(1);
        {
            let inner = worker.clone();
            worker.add(move || {
                inner.flush();
                let _ = tx.send(());
            });
        }
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }
}
