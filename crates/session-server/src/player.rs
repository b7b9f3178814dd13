//! Server-side facade for one playback session.
//!
//! Every public operation wraps a command and runs it on the shared scheduler with
//! [`SessionScheduler::call`], so the caller observes its effect (or its error) on return and
//! the session context only ever changes on the worker thread.
//!
//! Each session owns a [`TimerWorker`] for its delayed tasks (need-data resends, position
//! reports). Dropping the session cancels it before the engine is torn down.

use std::sync::{Arc, Mutex};

use media_bridge_types::{
    MediaSegment, MediaSource, MediaSourceStatus, MediaType, Rectangle, SessionId, SourceId,
    VideoRequirements,
};
use session_runtime::{ClientId, SessionScheduler, TimerWorker};

use crate::context::{SessionContext, SessionTimings, lock_context};
use crate::engine::{EngineError, EngineFactory, EngineState};
use crate::error::SessionError;
use crate::notifier::{EventSink, Notifier};
use crate::sink::TaskSink;
use crate::tasks::{
    AllSourcesAttached, AttachSource, Flush, HaveData, Load, Pause, Play, RemoveSource, RenderFrame,
    SetBufferingLimit, SetMute, SetPlaybackRate, SetPosition, SetSync, SetVideoGeometry, SetVolume,
    Stop,
};

pub struct PlaybackSession {
    session_id: SessionId,
    client: ClientId,
    scheduler: Arc<SessionScheduler>,
    timer: Arc<TimerWorker>,
    /// Shared with the context so events can be flushed without taking the context lock.
    notifier: Arc<Notifier>,
    context: Arc<Mutex<SessionContext>>,
}

impl PlaybackSession {
    pub fn create(
        session_id: SessionId,
        requirements: VideoRequirements,
        scheduler: Arc<SessionScheduler>,
        factory: Arc<dyn EngineFactory>,
        events: EventSink,
        timings: SessionTimings,
    ) -> Result<Self, SessionError> {
        let notifier = Arc::new(Notifier::new(session_id, events)?);
        let timer = Arc::new(TimerWorker::start(format!("session-{session_id}-timer"))?);
        let client = scheduler.register_client();
        let context = Arc::new_cyclic(|weak| {
            let tasks = TaskSink::new(&scheduler, &timer, client, weak.clone());
            Mutex::new(SessionContext::new(
                session_id,
                factory,
                notifier.clone(),
                tasks,
                timings,
            ))
        });
        tracing::info!(
            session_id = %session_id,
            client_id = %client,
            max_width = requirements.max_width,
            max_height = requirements.max_height,
            "session created"
        );
        Ok(Self {
            session_id,
            client,
            scheduler,
            timer,
            notifier,
            context,
        })
    }

    pub fn id(&self) -> SessionId {
        self.session_id
    }

    fn run<T: Send + 'static>(
        &self,
        op: impl FnOnce(&mut SessionContext) -> Result<T, SessionError> + Send + 'static,
    ) -> Result<T, SessionError> {
        let context = self.context.clone();
        self.scheduler
            .call(self.client, move || op(&mut lock_context(&context)))?
    }

    pub fn load(&self, media_type: MediaType, mime_type: &str, url: &str) -> Result<(), SessionError> {
        let task = Load {
            media_type,
            mime_type: mime_type.to_string(),
            url: url.to_string(),
        };
        self.run(move |ctx| task.execute(ctx))
    }

    pub fn attach_source(&self, source: MediaSource) -> Result<SourceId, SessionError> {
        self.run(move |ctx| AttachSource { source }.execute(ctx))
    }

    pub fn remove_source(&self, source_id: SourceId) -> Result<(), SessionError> {
        self.run(move |ctx| RemoveSource { source_id }.execute(ctx))
    }

    pub fn all_sources_attached(&self) -> Result<(), SessionError> {
        self.run(|ctx| AllSourcesAttached.execute(ctx))
    }

    pub fn play(&self) -> Result<(), SessionError> {
        self.run(|ctx| Play.execute(ctx))
    }

    pub fn pause(&self) -> Result<(), SessionError> {
        self.run(|ctx| Pause.execute(ctx))
    }

    pub fn stop(&self) -> Result<(), SessionError> {
        self.run(|ctx| Stop.execute(ctx))
    }

    pub fn set_playback_rate(&self, rate: f64) -> Result<(), SessionError> {
        if rate == 0.0 {
            return Err(SessionError::InvalidRate(rate));
        }
        self.run(move |ctx| SetPlaybackRate { rate }.execute(ctx))
    }

    pub fn set_position(&self, position_ns: i64) -> Result<(), SessionError> {
        self.run(move |ctx| SetPosition { position_ns }.execute(ctx))
    }

    pub fn get_position(&self) -> Result<i64, SessionError> {
        self.run(|ctx| {
            let engine = ctx.engine.as_ref().ok_or(SessionError::NotLoaded)?;
            Ok(engine.position().unwrap_or(ctx.last_position_ns))
        })
    }

    pub fn set_video_window(&self, window: Rectangle) -> Result<(), SessionError> {
        self.run(move |ctx| SetVideoGeometry { window }.execute(ctx))
    }

    pub fn have_data(
        &self,
        status: MediaSourceStatus,
        request_id: u32,
        segments: Vec<MediaSegment>,
    ) -> Result<(), SessionError> {
        self.run(move |ctx| {
            HaveData {
                status,
                request_id,
                segments,
            }
            .execute(ctx)
        })
    }

    pub fn set_volume(&self, volume: f64) -> Result<(), SessionError> {
        self.run(move |ctx| SetVolume { volume }.execute(ctx))
    }

    pub fn get_volume(&self) -> Result<f64, SessionError> {
        self.run(|ctx| match ctx.engine.as_ref().map(|e| e.volume()) {
            Some(Ok(volume)) => Ok(volume),
            Some(Err(EngineError::NotReady)) | None => {
                Ok(ctx.pending.volume.unwrap_or(1.0))
            }
            Some(Err(e)) => Err(e.into()),
        })
    }

    pub fn set_mute(&self, mute: bool) -> Result<(), SessionError> {
        self.run(move |ctx| SetMute { mute }.execute(ctx))
    }

    pub fn set_sync(&self, sync: bool) -> Result<(), SessionError> {
        self.run(move |ctx| SetSync { sync }.execute(ctx))
    }

    pub fn set_buffering_limit(&self, limit_ms: u32) -> Result<(), SessionError> {
        self.run(move |ctx| SetBufferingLimit { limit_ms }.execute(ctx))
    }

    pub fn render_frame(&self) -> Result<(), SessionError> {
        self.run(|ctx| RenderFrame.execute(ctx))
    }

    pub fn flush(&self, source_id: SourceId, reset_time: bool) -> Result<(), SessionError> {
        self.run(move |ctx| {
            Flush {
                source_id,
                reset_time,
            }
            .execute(ctx)
        })
    }

    /// Wait until every event raised so far has reached the event sink.
    pub fn flush_events(&self) {
        self.notifier.flush();
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        self.timer.cancel();
        let context = self.context.clone();
        let session_id = self.session_id;
        let teardown = self.scheduler.enqueue_task_and_wait(self.client, move || {
            let mut ctx = lock_context(&context);
            if let Some(mut engine) = ctx.engine.take()
                && let Err(e) = engine.set_state(EngineState::Null)
            {
                tracing::warn!(session_id = %session_id, "failed to stop engine on teardown: {e}");
            }
        });
        if let Err(e) = teardown {
            tracing::warn!(session_id = %self.session_id, "session teardown task not run: {e}");
        }
        self.scheduler.unregister_client(self.client);
        tracing::info!(session_id = %self.session_id, "session destroyed");
    }
}
