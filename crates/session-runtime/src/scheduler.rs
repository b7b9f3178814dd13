//! Single-worker task scheduler for session state.
//!
//! Every mutation of a session runs as a task on the one scheduler thread, whatever thread
//! submitted it. Tasks are tagged with the submitting client; a task whose client has been
//! unregistered by the time it is dequeued is dropped (and logged) instead of run.
//!
//! ## Ordering
//! One FIFO for all clients. Tasks from one producer run in submission order; there is no
//! ordering across producers beyond arrival order on the channel.
//!
//! ## Waiting
//! [`SessionScheduler::enqueue_task_and_wait`] blocks on a one-shot reply that the worker
//! always sends, even when the task was dropped, so a waiter can never hang on an
//! unregistered client. Called from the worker thread itself, the task runs inline; a client
//! registered moments earlier whose registration task is still queued counts as registered.

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use thiserror::Error;

use crate::panic_message;

/// Opaque id of a scheduler client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u32);

impl ClientId {
    /// Registered at construction, never removed.
    pub const BOOTSTRAP: ClientId = ClientId(0);
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// The task was dropped because its client was not registered when it was dequeued.
    #[error("client {0} is not registered; task dropped")]
    ClientNotRegistered(ClientId),
    #[error("task for client {0} panicked")]
    TaskPanicked(ClientId),
    #[error("scheduler is shut down")]
    ShutDown,
}

/// What the worker did with one entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TaskOutcome {
    Executed,
    Panicked,
    Dropped,
}

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Entry {
    client: ClientId,
    task: Task,
    done: Option<Sender<TaskOutcome>>,
}

enum Message {
    Run(Entry),
    Shutdown,
}

#[derive(Default)]
struct Registry {
    active: HashSet<ClientId>,
    /// Registered but whose registration task has not run yet.
    pending: HashSet<ClientId>,
}

pub struct SessionScheduler {
    tx: Sender<Message>,
    registry: Arc<Mutex<Registry>>,
    next_client: AtomicU32,
    handle: Option<JoinHandle<()>>,
    worker_id: ThreadId,
}

impl SessionScheduler {
    /// Spawn the worker thread with the bootstrap client registered.
    pub fn start(name: impl Into<String>) -> io::Result<Self> {
        let name = name.into();
        let (tx, rx) = unbounded::<Message>();
        let mut registry = Registry::default();
        registry.active.insert(ClientId::BOOTSTRAP);
        let registry = Arc::new(Mutex::new(registry));

        let handle = thread::Builder::new().name(name).spawn({
            let registry = registry.clone();
            move || run_worker(rx, &registry)
        })?;
        let worker_id = handle.thread().id();

        Ok(Self {
            tx,
            registry,
            next_client: AtomicU32::new(1),
            handle: Some(handle),
            worker_id,
        })
    }

    /// Allocate a fresh non-zero client id.
    ///
    /// The id becomes active when its registration task runs, so tasks enqueued for it
    /// afterwards always find it registered.
    pub fn register_client(&self) -> ClientId {
        let id = ClientId(self.next_client.fetch_add(1, Ordering::Relaxed));
        lock(&self.registry).pending.insert(id);

        let registry = self.registry.clone();
        self.enqueue_task(ClientId::BOOTSTRAP, move || {
            let mut reg = lock(&registry);
            // Unregistered before this ran: stay unregistered.
            if reg.pending.remove(&id) {
                reg.active.insert(id);
            }
        });
        tracing::debug!(client_id = %id, "client registered");
        id
    }

    /// Remove `id` immediately. Its queued tasks are dropped when dequeued.
    pub fn unregister_client(&self, id: ClientId) {
        if id == ClientId::BOOTSTRAP {
            tracing::warn!("refusing to unregister the bootstrap client");
            return;
        }
        let mut reg = lock(&self.registry);
        let was_known = reg.active.remove(&id) | reg.pending.remove(&id);
        if !was_known {
            tracing::debug!(client_id = %id, "unregister of unknown client");
        }
    }

    pub fn is_registered(&self, id: ClientId) -> bool {
        let reg = lock(&self.registry);
        reg.active.contains(&id) || reg.pending.contains(&id)
    }

    /// Fire-and-forget submission.
    pub fn enqueue_task(&self, client: ClientId, task: impl FnOnce() + Send + 'static) {
        let entry = Entry {
            client,
            task: Box::new(task),
            done: None,
        };
        if self.tx.send(Message::Run(entry)).is_err() {
            tracing::error!(client_id = %client, "scheduler worker gone; task lost");
        }
    }

    /// Submit and block until the worker has handled the task.
    pub fn enqueue_task_and_wait(
        &self,
        client: ClientId,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<(), ScheduleError> {
        if self.on_worker_thread() {
            // Nothing queued can run before an inline task, so a client whose registration
            // task is still queued is activated here instead of being refused.
            {
                let mut reg = lock(&self.registry);
                if reg.pending.remove(&client) {
                    reg.active.insert(client);
                }
            }
            return match run_entry(&self.registry, client, Box::new(task)) {
                TaskOutcome::Executed => Ok(()),
                TaskOutcome::Panicked => Err(ScheduleError::TaskPanicked(client)),
                TaskOutcome::Dropped => Err(ScheduleError::ClientNotRegistered(client)),
            };
        }

        let (done_tx, done_rx) = bounded(1);
        let entry = Entry {
            client,
            task: Box::new(task),
            done: Some(done_tx),
        };
        self.tx
            .send(Message::Run(entry))
            .map_err(|_| ScheduleError::ShutDown)?;

        match done_rx.recv() {
            Ok(TaskOutcome::Executed) => Ok(()),
            Ok(TaskOutcome::Panicked) => Err(ScheduleError::TaskPanicked(client)),
            Ok(TaskOutcome::Dropped) => Err(ScheduleError::ClientNotRegistered(client)),
            Err(_) => Err(ScheduleError::ShutDown),
        }
    }

    /// Run `f` on the worker and hand back its result.
    pub fn call<R: Send + 'static>(
        &self,
        client: ClientId,
        f: impl FnOnce() -> R + Send + 'static,
    ) -> Result<R, ScheduleError> {
        let (result_tx, result_rx) = bounded(1);
        self.enqueue_task_and_wait(client, move || {
            let _ = result_tx.send(f());
        })?;
        result_rx.try_recv().map_err(|_| ScheduleError::ShutDown)
    }

    pub fn on_worker_thread(&self) -> bool {
        thread::current().id() == self.worker_id
    }
}

impl Drop for SessionScheduler {
    fn drop(&mut self) {
        // Queued behind everything already submitted.
        let _ = self.tx.send(Message::Shutdown);
        if let Some(handle) = self.handle.take() {
            if self.on_worker_thread() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!("scheduler worker thread panicked");
            }
        }
    }
}

fn lock(registry: &Mutex<Registry>) -> std::sync::MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(|e| e.into_inner())
}

fn run_worker(rx: Receiver<Message>, registry: &Mutex<Registry>) {
    tracing::debug!("scheduler worker started");
    while let Ok(msg) = rx.recv() {
        match msg {
            Message::Shutdown => break,
            Message::Run(Entry { client, task, done }) => {
                let outcome = run_entry(registry, client, task);
                if let Some(done) = done {
                    let _ = done.send(outcome);
                }
            }
        }
    }
    tracing::debug!("scheduler worker stopped");
}

fn run_entry(registry: &Mutex<Registry>, client: ClientId, task: Task) -> TaskOutcome {
    let registered = lock(registry).active.contains(&client);
    if !registered {
        tracing::warn!(client_id = %client, "client not registered; dropping task");
        return TaskOutcome::Dropped;
    }
    match panic::catch_unwind(AssertUnwindSafe(task)) {
        Ok(()) => TaskOutcome::Executed,
        Err(payload) => {
            tracing::error!(
                client_id = %client,
                panic = %panic_message(payload.as_ref()),
                "scheduled task panicked"
            );
            TaskOutcome::Panicked
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[test]
    fn register_client_returns_fresh_non_zero_ids() {
        let sched = SessionScheduler::start("test-sched").unwrap();
        let a = sched.register_client();
        let b = sched.register_client();
        assert_ne!(a, ClientId::BOOTSTRAP);
        assert_ne!(b, ClientId::BOOTSTRAP);
        assert_ne!(a, b);
        assert!(sched.is_registered(ClientId::BOOTSTRAP));
    }

    #[test]
    fn bootstrap_client_cannot_be_unregistered() {
        let sched = SessionScheduler::start("test-sched").unwrap();
        sched.unregister_client(ClientId::BOOTSTRAP);
        assert_eq!(sched.enqueue_task_and_wait(ClientId::BOOTSTRAP, || {}), Ok(()));
    }

    #[test]
    fn wait_makes_effects_visible_on_return() {
        let sched = SessionScheduler::start("test-sched").unwrap();
        let mut client = ClientId::BOOTSTRAP;
        while client != ClientId(7) {
            client = sched.register_client();
        }

        let sync = Arc::new(AtomicBool::new(false));
        let flag = sync.clone();
        sched
            .enqueue_task_and_wait(client, move || flag.store(true, Ordering::SeqCst))
            .unwrap();
        assert!(sync.load(Ordering::SeqCst));
    }

    #[test]
    fn tasks_run_in_fifo_order_on_one_thread() {
        let sched = SessionScheduler::start("test-sched").unwrap();
        let client = sched.register_client();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..50 {
            let seen = seen.clone();
            sched.enqueue_task(client, move || {
                seen.lock().unwrap().push((i, thread::current().id()));
            });
        }
        sched.enqueue_task_and_wait(client, || {}).unwrap();

        let seen = seen.lock().unwrap();
        let order: Vec<_> = seen.iter().map(|(i, _)| *i).collect();
        assert_eq!(order, (0..50).collect::<Vec<_>>());
        assert!(seen.iter().all(|(_, t)| *t == sched.worker_id));
    }

    #[test]
    fn inline_wait_accepts_client_registered_on_the_worker() {
        let sched = Arc::new(SessionScheduler::start("test-sched").unwrap());
        let ran = Arc::new(AtomicBool::new(false));
        let outcome = {
            let inner = sched.clone();
            let ran = ran.clone();
            sched
                .call(ClientId::BOOTSTRAP, move || {
                    let client = inner.register_client();
                    inner.enqueue_task_and_wait(client, move || ran.store(true, Ordering::SeqCst))
                })
                .unwrap()
        };
        assert_eq!(outcome, Ok(()));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn inline_wait_still_drops_unregistered_client() {
        let sched = Arc::new(SessionScheduler::start("test-sched").unwrap());
        let client = sched.register_client();
        sched.unregister_client(client);
        let inner = sched.clone();
        let outcome = sched
            .call(ClientId::BOOTSTRAP, move || inner.enqueue_task_and_wait(client, || {}))
            .unwrap();
        assert_eq!(outcome, Err(ScheduleError::ClientNotRegistered(client)));
    }

    #[test]
    fn task_after_unregister_is_dropped_and_waiter_released() {
        let sched = SessionScheduler::start("test-sched").unwrap();
        let client = sched.register_client();
        sched.unregister_client(client);

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let res = sched.enqueue_task_and_wait(client, move || flag.store(true, Ordering::SeqCst));

        assert_eq!(res, Err(ScheduleError::ClientNotRegistered(client)));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn unregister_before_registration_runs_wins() {
        let sched = SessionScheduler::start("test-sched").unwrap();
        let (release_tx, release_rx) = bounded::<()>(1);
        sched.enqueue_task(ClientId::BOOTSTRAP, move || {
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
        });

        let client = sched.register_client();
        sched.unregister_client(client);
        release_tx.send(()).unwrap();

        assert_eq!(
            sched.enqueue_task_and_wait(client, || {}),
            Err(ScheduleError::ClientNotRegistered(client))
        );
    }

    #[test]
    fn panicking_task_is_reported_and_worker_survives() {
        let sched = SessionScheduler::start("test-sched").unwrap();
        let client = sched.register_client();
        assert_eq!(
            sched.enqueue_task_and_wait(client, || panic!("boom")),
            Err(ScheduleError::TaskPanicked(client))
        );
        assert_eq!(sched.call(client, || 5), Ok(5));
    }

    #[test]
    fn wait_from_worker_thread_runs_inline() {
        let sched = Arc::new(SessionScheduler::start("test-sched").unwrap());
        let client = sched.register_client();
        let inner = sched.clone();
        let nested = sched
            .call(client, move || inner.call(client, || 11))
            .unwrap();
        assert_eq!(nested, Ok(11));
    }

    #[test]
    fn drop_runs_tasks_queued_before_shutdown() {
        let sched = SessionScheduler::start("test-sched").unwrap();
        let client = sched.register_client();
        let count = Arc::new(AtomicU32::new(0));
        for _ in 0..3 {
            let count = count.clone();
            sched.enqueue_task(client, move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        drop(sched);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
