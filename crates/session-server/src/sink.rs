//! Paths by which work re-enters the scheduler from outside a task.
//!
//! [`TaskSink`] queues a [`PlayerTask`] for one session, now or after a delay. Delayed tasks
//! wait on the session's [`TimerWorker`] and die with it.
//! [`EngineEventSink`] is the engine-facing wrapper that turns engine callbacks into tasks.
//! [`WebAudioEventSink`] does the same for web audio engines, which only report state.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use media_bridge_types::{MediaSourceType, QosInfo, WebAudioPlayerState};
use session_runtime::{ClientId, SessionScheduler, TimerWorker};

use crate::context::{SessionContext, lock_context};
use crate::engine::EngineState;
use crate::notifier::WebAudioNotifier;
use crate::tasks::{
    EngineEos, EngineFailure, EnoughData, NeedData, PlayerTask, Qos, StateChanged, Underflow,
};

#[derive(Clone)]
pub struct TaskSink {
    scheduler: Weak<SessionScheduler>,
    timer: Weak<TimerWorker>,
    client: ClientId,
    context: Weak<Mutex<SessionContext>>,
}

impl TaskSink {
    pub fn new(
        scheduler: &Arc<SessionScheduler>,
        timer: &Arc<TimerWorker>,
        client: ClientId,
        context: Weak<Mutex<SessionContext>>,
    ) -> Self {
        Self {
            scheduler: Arc::downgrade(scheduler),
            timer: Arc::downgrade(timer),
            client,
            context,
        }
    }

    /// A sink that discards everything, for contexts driven directly in tests.
    pub fn detached() -> Self {
        Self {
            scheduler: Weak::new(),
            timer: Weak::new(),
            client: ClientId::BOOTSTRAP,
            context: Weak::new(),
        }
    }

    pub fn submit(&self, task: PlayerTask) {
        let Some(scheduler) = self.scheduler.upgrade() else {
            tracing::debug!(task = task.name(), "scheduler gone; task discarded");
            return;
        };
        let context = self.context.clone();
        scheduler.enqueue_task(self.client, move || {
            let Some(context) = context.upgrade() else {
                return;
            };
            let name = task.name();
            let mut ctx = lock_context(&context);
            if let Err(e) = task.execute(&mut ctx) {
                tracing::warn!(session_id = %ctx.session_id, task = name, "task failed: {e}");
            }
        });
    }

    /// Submit `task` once `delay` has elapsed, unless the session's timer is cancelled first.
    pub fn submit_after(&self, delay: Duration, task: PlayerTask) {
        let Some(timer) = self.timer.upgrade() else {
            tracing::debug!(task = task.name(), "timer gone; delayed task discarded");
            return;
        };
        let sink = self.clone();
        timer.schedule(delay, move || sink.submit(task));
    }
}

/// Handed to the engine at creation; safe to call from any engine thread.
#[derive(Clone)]
pub struct EngineEventSink {
    tasks: TaskSink,
}

impl EngineEventSink {
    pub fn new(tasks: TaskSink) -> Self {
        Self { tasks }
    }

    pub fn state_changed(&self, state: EngineState) {
        self.tasks.submit(PlayerTask::StateChanged(StateChanged { state }));
    }

    pub fn need_data(&self, source_type: MediaSourceType) {
        self.tasks.submit(PlayerTask::NeedData(NeedData { source_type }));
    }

    pub fn enough_data(&self, source_type: MediaSourceType) {
        self.tasks.submit(PlayerTask::EnoughData(EnoughData { source_type }));
    }

    pub fn underflow(&self, source_type: MediaSourceType) {
        self.tasks.submit(PlayerTask::Underflow(Underflow { source_type }));
    }

    pub fn end_of_stream(&self) {
        self.tasks.submit(PlayerTask::EngineEos(EngineEos));
    }

    pub fn qos(&self, source_type: MediaSourceType, info: QosInfo) {
        self.tasks.submit(PlayerTask::Qos(Qos { source_type, info }));
    }

    pub fn error(&self, source_type: Option<MediaSourceType>, message: impl Into<String>) {
        self.tasks.submit(PlayerTask::EngineFailure(EngineFailure {
            source_type,
            message: message.into(),
        }));
    }
}

/// Handed to a web audio engine at creation. State changes are published from the scheduler
/// worker, after every command queued before them.
#[derive(Clone)]
pub struct WebAudioEventSink {
    scheduler: Weak<SessionScheduler>,
    client: ClientId,
    notifier: Weak<WebAudioNotifier>,
}

impl WebAudioEventSink {
    pub fn new(
        scheduler: &Arc<SessionScheduler>,
        client: ClientId,
        notifier: &Arc<WebAudioNotifier>,
    ) -> Self {
        Self {
            scheduler: Arc::downgrade(scheduler),
            client,
            notifier: Arc::downgrade(notifier),
        }
    }

    pub fn detached() -> Self {
        Self {
            scheduler: Weak::new(),
            client: ClientId::BOOTSTRAP,
            notifier: Weak::new(),
        }
    }

    pub fn state_changed(&self, state: WebAudioPlayerState) {
        let Some(scheduler) = self.scheduler.upgrade() else {
            tracing::debug!(?state, "scheduler gone; web audio state discarded");
            return;
        };
        let notifier = self.notifier.clone();
        scheduler.enqueue_task(self.client, move || {
            if let Some(notifier) = notifier.upgrade() {
                notifier.state(state);
            }
        });
    }
}
