//! Commands executed on the scheduler worker against a [`SessionContext`].
//!
//! Each verb is a plain struct holding its inputs. `execute` takes the struct by value, so a
//! command runs at most once; it mutates the context and drives the engine, never its own
//! inputs. [`PlayerTask`] is the closed set used wherever a command has to be queued for
//! later (engine callbacks, timers).

mod data;
mod playback;
mod settings;
mod source;

pub use data::{
    AttachData, AttachSamples, DataReader, EnoughData, Eos, HaveData, NeedData, ReadAndAttachSamples,
    ResendNeedData, Underflow,
};
pub use playback::{
    EngineEos, EngineFailure, Flush, Load, Pause, Play, Qos, ReportPosition, SetPlaybackRate,
    SetPosition, StateChanged, Stop,
};
pub use settings::{
    RenderFrame, SetBufferingLimit, SetMute, SetSync, SetVideoGeometry, SetVolume, apply_pending,
};
pub use source::{AllSourcesAttached, AttachSource, RemoveSource};

use media_bridge_types::{MediaSourceType, NetworkState};

use crate::context::{EosState, NEED_DATA_FRAME_COUNT, SessionContext};
use crate::engine::MediaEngine;
use crate::error::SessionError;

pub enum PlayerTask {
    Load(Load),
    AttachSource(AttachSource),
    RemoveSource(RemoveSource),
    AllSourcesAttached(AllSourcesAttached),

    Play(Play),
    Pause(Pause),
    Stop(Stop),
    SetPlaybackRate(SetPlaybackRate),
    SetPosition(SetPosition),
    Flush(Flush),

    NeedData(NeedData),
    EnoughData(EnoughData),
    HaveData(HaveData),
    AttachSamples(AttachSamples),
    ReadAndAttachSamples(ReadAndAttachSamples),
    AttachData(AttachData),
    Eos(Eos),
    Underflow(Underflow),
    ResendNeedData(ResendNeedData),

    SetVideoGeometry(SetVideoGeometry),
    SetVolume(SetVolume),
    SetMute(SetMute),
    SetSync(SetSync),
    SetBufferingLimit(SetBufferingLimit),
    RenderFrame(RenderFrame),

    StateChanged(StateChanged),
    EngineEos(EngineEos),
    EngineFailure(EngineFailure),
    Qos(Qos),
    ReportPosition(ReportPosition),
}

impl PlayerTask {
    pub fn name(&self) -> &'static str {
        match self {
            PlayerTask::Load(_) => "load",
            PlayerTask::AttachSource(_) => "attach_source",
            PlayerTask::RemoveSource(_) => "remove_source",
            PlayerTask::AllSourcesAttached(_) => "all_sources_attached",
            PlayerTask::Play(_) => "play",
            PlayerTask::Pause(_) => "pause",
            PlayerTask::Stop(_) => "stop",
            PlayerTask::SetPlaybackRate(_) => "set_playback_rate",
            PlayerTask::SetPosition(_) => "set_position",
            PlayerTask::Flush(_) => "flush",
            PlayerTask::NeedData(_) => "need_data",
            PlayerTask::EnoughData(_) => "enough_data",
            PlayerTask::HaveData(_) => "have_data",
            PlayerTask::AttachSamples(_) => "attach_samples",
            PlayerTask::ReadAndAttachSamples(_) => "read_and_attach_samples",
            PlayerTask::AttachData(_) => "attach_data",
            PlayerTask::Eos(_) => "eos",
            PlayerTask::Underflow(_) => "underflow",
            PlayerTask::ResendNeedData(_) => "resend_need_data",
            PlayerTask::SetVideoGeometry(_) => "set_video_geometry",
            PlayerTask::SetVolume(_) => "set_volume",
            PlayerTask::SetMute(_) => "set_mute",
            PlayerTask::SetSync(_) => "set_sync",
            PlayerTask::SetBufferingLimit(_) => "set_buffering_limit",
            PlayerTask::RenderFrame(_) => "render_frame",
            PlayerTask::StateChanged(_) => "state_changed",
            PlayerTask::EngineEos(_) => "engine_eos",
            PlayerTask::EngineFailure(_) => "engine_failure",
            PlayerTask::Qos(_) => "qos",
            PlayerTask::ReportPosition(_) => "report_position",
        }
    }

    pub fn execute(self, ctx: &mut SessionContext) -> Result<(), SessionError> {
        match self {
            PlayerTask::Load(t) => t.execute(ctx),
            PlayerTask::AttachSource(t) => t.execute(ctx).map(|_| ()),
            PlayerTask::RemoveSource(t) => t.execute(ctx),
            PlayerTask::AllSourcesAttached(t) => t.execute(ctx),
            PlayerTask::Play(t) => t.execute(ctx),
            PlayerTask::Pause(t) => t.execute(ctx),
            PlayerTask::Stop(t) => t.execute(ctx),
            PlayerTask::SetPlaybackRate(t) => t.execute(ctx),
            PlayerTask::SetPosition(t) => t.execute(ctx),
            PlayerTask::Flush(t) => t.execute(ctx),
            PlayerTask::NeedData(t) => t.execute(ctx),
            PlayerTask::EnoughData(t) => t.execute(ctx),
            PlayerTask::HaveData(t) => t.execute(ctx),
            PlayerTask::AttachSamples(t) => t.execute(ctx),
            PlayerTask::ReadAndAttachSamples(t) => t.execute(ctx),
            PlayerTask::AttachData(t) => t.execute(ctx),
            PlayerTask::Eos(t) => t.execute(ctx),
            PlayerTask::Underflow(t) => t.execute(ctx),
            PlayerTask::ResendNeedData(t) => t.execute(ctx),
            PlayerTask::SetVideoGeometry(t) => t.execute(ctx),
            PlayerTask::SetVolume(t) => t.execute(ctx),
            PlayerTask::SetMute(t) => t.execute(ctx),
            PlayerTask::SetSync(t) => t.execute(ctx),
            PlayerTask::SetBufferingLimit(t) => t.execute(ctx),
            PlayerTask::RenderFrame(t) => t.execute(ctx),
            PlayerTask::StateChanged(t) => t.execute(ctx),
            PlayerTask::EngineEos(t) => t.execute(ctx),
            PlayerTask::EngineFailure(t) => t.execute(ctx),
            PlayerTask::Qos(t) => t.execute(ctx),
            PlayerTask::ReportPosition(t) => t.execute(ctx),
        }
    }
}

pub(crate) fn engine_of(
    engine: &mut Option<Box<dyn MediaEngine>>,
) -> Result<&mut Box<dyn MediaEngine>, SessionError> {
    engine.as_mut().ok_or(SessionError::NotLoaded)
}

/// Ask the client for data unless a request is already in flight or the stream has ended.
pub(crate) fn request_need_data(ctx: &mut SessionContext, source_type: MediaSourceType) {
    let Some(stream) = ctx.streams.get(&source_type) else {
        return;
    };
    if stream.need_data_outstanding || stream.eos != EosState::None {
        return;
    }
    let source_id = stream.source_id;
    let request_id = ctx.next_request_id();
    ctx.active_requests.insert(request_id, source_type);
    if let Some(stream) = ctx.streams.get_mut(&source_type) {
        stream.need_data_outstanding = true;
    }
    tracing::debug!(
        session_id = %ctx.session_id,
        source_id = %source_id,
        request_id,
        "need media data"
    );
    ctx.notifier.need_media_data(source_id, NEED_DATA_FRAME_COUNT, request_id);
}

/// The client answered: clear the in-flight flag and ask again if the engine is still hungry.
pub(crate) fn renew_need_data(ctx: &mut SessionContext, source_type: MediaSourceType) {
    let Some(stream) = ctx.streams.get_mut(&source_type) else {
        return;
    };
    stream.need_data_outstanding = false;
    if stream.needs_data {
        request_need_data(ctx, source_type);
    }
}

/// Hand pending buffers to the engine if it wants them, then send a deferred EOS once the
/// queue is empty.
pub(crate) fn attach_data(ctx: &mut SessionContext, source_type: MediaSourceType) -> Result<(), SessionError> {
    let SessionContext {
        engine,
        streams,
        notifier,
        ..
    } = &mut *ctx;
    let stream = streams
        .get_mut(&source_type)
        .ok_or(SessionError::NoStream(source_type))?;
    let engine = engine_of(engine)?;
    tracing::trace!(source_type = %source_type, phase = ?stream.phase(), "attach data");

    let mut underflow_cleared = false;
    if stream.needs_data && !stream.pending.is_empty() {
        // Nothing leaves the queue until the engine has accepted the batch.
        engine.push_buffers(source_type, stream.pending.make_contiguous())?;
        stream.pending.clear();
        stream.data_pushed = true;
        if stream.underflow {
            stream.underflow = false;
            underflow_cleared = true;
        }
    }

    if stream.pending.is_empty() && stream.eos == EosState::Pending {
        engine.end_of_stream(source_type)?;
        stream.eos = EosState::Sent;
        tracing::debug!(source_type = %source_type, "deferred end of stream sent");
    }

    if underflow_cleared {
        notifier.network_state(NetworkState::Buffered);
    }
    notify_buffered_once(ctx);
    Ok(())
}

fn notify_buffered_once(ctx: &mut SessionContext) {
    if ctx.buffered_notified || ctx.streams.is_empty() {
        return;
    }
    if ctx.streams.values().all(|s| s.data_pushed) {
        ctx.buffered_notified = true;
        ctx.notifier.network_state(NetworkState::Buffered);
    }
}
