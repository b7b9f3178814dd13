//! Pipeline lifecycle: load, transport control, seek, flush and engine-originated events.

use media_bridge_types::{MediaSourceType, MediaType, NetworkState, PlaybackState, QosInfo, SourceId};

use super::{PlayerTask, apply_pending, engine_of};
use crate::context::{EosState, SessionContext};
use crate::engine::EngineState;
use crate::error::SessionError;
use crate::sink::EngineEventSink;

/// Create the engine for a new media item.
pub struct Load {
    pub media_type: MediaType,
    pub mime_type: String,
    pub url: String,
}

impl Load {
    pub fn execute(self, ctx: &mut SessionContext) -> Result<(), SessionError> {
        if ctx.engine.is_some() {
            tracing::info!(session_id = %ctx.session_id, "reloading; previous engine released");
        }
        let events = EngineEventSink::new(ctx.tasks.clone());
        let engine = ctx
            .factory
            .create(self.media_type, &self.mime_type, &self.url, events)?;
        ctx.engine = Some(engine);

        ctx.streams.clear();
        ctx.active_requests.clear();
        ctx.all_sources_attached = false;
        ctx.buffered_notified = false;
        ctx.eos_notified = false;
        ctx.underflow_enabled = false;

        apply_pending(ctx);
        tracing::info!(
            session_id = %ctx.session_id,
            mime_type = %self.mime_type,
            url = %self.url,
            "media loaded"
        );
        ctx.notifier.network_state(NetworkState::Buffering);
        Ok(())
    }
}

fn change_state(ctx: &mut SessionContext, state: EngineState) -> Result<(), SessionError> {
    let result = engine_of(&mut ctx.engine).and_then(|e| e.set_state(state).map_err(Into::into));
    if let Err(e) = &result {
        tracing::error!(session_id = %ctx.session_id, ?state, "failed to change pipeline state: {e}");
        ctx.playback_state = PlaybackState::Failure;
        ctx.notifier.playback_state(PlaybackState::Failure);
    }
    result
}

pub struct Play;

impl Play {
    pub fn execute(self, ctx: &mut SessionContext) -> Result<(), SessionError> {
        change_state(ctx, EngineState::Playing)
    }
}

pub struct Pause;

impl Pause {
    pub fn execute(self, ctx: &mut SessionContext) -> Result<(), SessionError> {
        change_state(ctx, EngineState::Paused)
    }
}

pub struct Stop;

impl Stop {
    pub fn execute(self, ctx: &mut SessionContext) -> Result<(), SessionError> {
        ctx.underflow_enabled = false;
        change_state(ctx, EngineState::Null)
    }
}

/// Rate changes only reach the engine while playing; otherwise they wait for the next
/// transition to playing.
pub struct SetPlaybackRate {
    pub rate: f64,
}

impl SetPlaybackRate {
    pub fn execute(self, ctx: &mut SessionContext) -> Result<(), SessionError> {
        if self.rate == 0.0 || !self.rate.is_finite() {
            return Err(SessionError::InvalidRate(self.rate));
        }
        if ctx.engine.is_none() || ctx.playback_state != PlaybackState::Playing {
            ctx.pending.playback_rate = Some(self.rate);
            return Ok(());
        }
        engine_of(&mut ctx.engine)?.set_playback_rate(self.rate)?;
        ctx.playback_rate = self.rate;
        ctx.pending.playback_rate = None;
        Ok(())
    }
}

/// Seek. Buffers queued for the old position are dropped before the engine is asked, and
/// are not restored if the engine refuses.
pub struct SetPosition {
    pub position_ns: i64,
}

impl SetPosition {
    pub fn execute(self, ctx: &mut SessionContext) -> Result<(), SessionError> {
        if ctx.engine.is_none() {
            return Err(SessionError::NotLoaded);
        }
        ctx.notifier.playback_state(PlaybackState::Seeking);

        for stream in ctx.streams.values_mut() {
            stream.pending.clear();
            stream.needs_data = false;
            stream.need_data_outstanding = false;
        }
        ctx.active_requests.clear();

        let rate = ctx.playback_rate;
        if let Err(e) = engine_of(&mut ctx.engine)?.seek(self.position_ns, rate) {
            tracing::error!(session_id = %ctx.session_id, position_ns = self.position_ns, "seek failed: {e}");
            ctx.playback_state = PlaybackState::Failure;
            ctx.notifier.playback_state(PlaybackState::Failure);
            return Err(e.into());
        }

        for stream in ctx.streams.values_mut() {
            stream.eos = EosState::None;
            stream.underflow = false;
        }
        ctx.eos_notified = false;
        ctx.last_position_ns = self.position_ns;
        ctx.notifier.playback_state(PlaybackState::Flushed);

        let attached: Vec<MediaSourceType> = ctx.streams.keys().copied().collect();
        for source_type in attached {
            super::NeedData { source_type }.execute(ctx)?;
        }
        Ok(())
    }
}

/// Flush one source, discarding everything queued for it.
pub struct Flush {
    pub source_id: SourceId,
    pub reset_time: bool,
}

impl Flush {
    pub fn execute(self, ctx: &mut SessionContext) -> Result<(), SessionError> {
        let (source_type, _) = ctx
            .stream_by_id(self.source_id)
            .ok_or(SessionError::UnknownSource(self.source_id))?;
        engine_of(&mut ctx.engine)?.flush(source_type, self.reset_time)?;

        if let Some(stream) = ctx.streams.get_mut(&source_type) {
            stream.pending.clear();
            stream.eos = EosState::None;
            stream.underflow = false;
            stream.need_data_outstanding = false;
        }
        ctx.retire_requests(source_type);
        ctx.eos_notified = false;
        ctx.notifier.source_flushed(self.source_id);
        Ok(())
    }
}

/// Engine reached a new pipeline state.
pub struct StateChanged {
    pub state: EngineState,
}

impl StateChanged {
    pub fn execute(self, ctx: &mut SessionContext) -> Result<(), SessionError> {
        let reported = match self.state {
            EngineState::Ready => return Ok(()),
            EngineState::Null => {
                ctx.underflow_enabled = false;
                PlaybackState::Stopped
            }
            EngineState::Paused => {
                ctx.underflow_enabled = false;
                apply_pending(ctx);
                PlaybackState::Paused
            }
            EngineState::Playing => {
                ctx.underflow_enabled = true;
                apply_pending(ctx);
                if let Some(rate) = ctx.pending.playback_rate.take() {
                    match engine_of(&mut ctx.engine)?.set_playback_rate(rate) {
                        Ok(()) => ctx.playback_rate = rate,
                        Err(e) => tracing::warn!(rate, "deferred playback rate failed: {e}"),
                    }
                }
                if !ctx.position_reporting {
                    ctx.position_reporting = true;
                    ctx.tasks.submit_after(
                        ctx.timings.position_report,
                        PlayerTask::ReportPosition(ReportPosition),
                    );
                }
                PlaybackState::Playing
            }
        };

        if ctx.playback_state != reported {
            ctx.playback_state = reported;
            ctx.notifier.playback_state(reported);
        }
        Ok(())
    }
}

/// Periodic position update while playing; re-arms itself.
pub struct ReportPosition;

impl ReportPosition {
    pub fn execute(self, ctx: &mut SessionContext) -> Result<(), SessionError> {
        if ctx.playback_state != PlaybackState::Playing {
            ctx.position_reporting = false;
            return Ok(());
        }
        if let Some(position) = ctx.engine.as_ref().and_then(|e| e.position()) {
            ctx.last_position_ns = position;
            ctx.notifier.position(position);
        }
        ctx.tasks.submit_after(
            ctx.timings.position_report,
            PlayerTask::ReportPosition(ReportPosition),
        );
        Ok(())
    }
}

/// Engine finished rendering every stream.
pub struct EngineEos;

impl EngineEos {
    pub fn execute(self, ctx: &mut SessionContext) -> Result<(), SessionError> {
        if !ctx.eos_notified {
            ctx.eos_notified = true;
            ctx.playback_state = PlaybackState::EndOfStream;
            ctx.notifier.playback_state(PlaybackState::EndOfStream);
        }
        Ok(())
    }
}

/// Engine reported an error, optionally tied to one stream.
pub struct EngineFailure {
    pub source_type: Option<MediaSourceType>,
    pub message: String,
}

impl EngineFailure {
    pub fn execute(self, ctx: &mut SessionContext) -> Result<(), SessionError> {
        tracing::error!(session_id = %ctx.session_id, source_type = ?self.source_type, "engine error: {}", self.message);
        let stream = self.source_type.and_then(|t| ctx.streams.get(&t));
        match stream {
            Some(stream) => ctx.notifier.playback_error(stream.source_id, self.message),
            None => {
                ctx.playback_state = PlaybackState::Failure;
                ctx.notifier.playback_state(PlaybackState::Failure);
            }
        }
        Ok(())
    }
}

pub struct Qos {
    pub source_type: MediaSourceType,
    pub info: QosInfo,
}

impl Qos {
    pub fn execute(self, ctx: &mut SessionContext) -> Result<(), SessionError> {
        match ctx.streams.get(&self.source_type) {
            Some(stream) => ctx.notifier.qos(stream.source_id, self.info),
            None => tracing::debug!(source_type = %self.source_type, "qos for unattached stream"),
        }
        Ok(())
    }
}
