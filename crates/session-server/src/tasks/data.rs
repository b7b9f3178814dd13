//! Data delivery: need-data requests, sample attachment, end of stream and underflow.

use media_bridge_types::{MediaSegment, MediaSourceStatus, MediaSourceType, PlaybackState};

use super::{attach_data, engine_of, renew_need_data, request_need_data};
use crate::context::{EosState, SessionContext};
use crate::engine::{Buffer, StreamCaps};
use crate::error::SessionError;
use crate::tasks::PlayerTask;

/// Source of segments for [`ReadAndAttachSamples`].
pub trait DataReader: Send {
    fn read_segments(&mut self) -> Result<Vec<MediaSegment>, String>;
}

/// Segments that arrived inline with the `have_data` call.
impl DataReader for Vec<MediaSegment> {
    fn read_segments(&mut self) -> Result<Vec<MediaSegment>, String> {
        Ok(std::mem::take(self))
    }
}

/// Engine wants data for a stream.
pub struct NeedData {
    pub source_type: MediaSourceType,
}

impl NeedData {
    pub fn execute(self, ctx: &mut SessionContext) -> Result<(), SessionError> {
        let Some(stream) = ctx.streams.get_mut(&self.source_type) else {
            tracing::debug!(source_type = %self.source_type, "need data for unattached stream");
            return Ok(());
        };
        stream.needs_data = true;
        if !stream.pending.is_empty() {
            attach_data(ctx, self.source_type)?;
        }
        request_need_data(ctx, self.source_type);
        Ok(())
    }
}

/// Engine has enough data for a stream.
pub struct EnoughData {
    pub source_type: MediaSourceType,
}

impl EnoughData {
    pub fn execute(self, ctx: &mut SessionContext) -> Result<(), SessionError> {
        if let Some(stream) = ctx.streams.get_mut(&self.source_type) {
            stream.needs_data = false;
        }
        Ok(())
    }
}

/// The client's answer to a need-data request.
pub struct HaveData {
    pub status: MediaSourceStatus,
    pub request_id: u32,
    pub segments: Vec<MediaSegment>,
}

impl HaveData {
    pub fn execute(self, ctx: &mut SessionContext) -> Result<(), SessionError> {
        let Some(source_type) = ctx.active_requests.remove(&self.request_id) else {
            tracing::warn!(
                session_id = %ctx.session_id,
                request_id = self.request_id,
                "have_data for unknown request; ignoring"
            );
            return Ok(());
        };

        match self.status {
            MediaSourceStatus::Ok | MediaSourceStatus::Eos => ReadAndAttachSamples {
                source_type,
                reader: Box::new(self.segments),
                end_of_stream: self.status == MediaSourceStatus::Eos,
            }
            .execute(ctx),
            status => {
                tracing::warn!(
                    session_id = %ctx.session_id,
                    source_type = %source_type,
                    ?status,
                    "client could not provide data; resending need data later"
                );
                schedule_need_data_resend(ctx, source_type);
                Ok(())
            }
        }
    }
}

fn schedule_need_data_resend(ctx: &mut SessionContext, source_type: MediaSourceType) {
    let Some(stream) = ctx.streams.get_mut(&source_type) else {
        return;
    };
    if stream.resend_armed {
        return;
    }
    stream.resend_armed = true;
    ctx.tasks.submit_after(
        ctx.timings.need_data_resend,
        PlayerTask::ResendNeedData(ResendNeedData { source_type }),
    );
}

/// Timer fired after a failed `have_data`.
pub struct ResendNeedData {
    pub source_type: MediaSourceType,
}

impl ResendNeedData {
    pub fn execute(self, ctx: &mut SessionContext) -> Result<(), SessionError> {
        let Some(stream) = ctx.streams.get_mut(&self.source_type) else {
            return Ok(());
        };
        stream.resend_armed = false;
        renew_need_data(ctx, self.source_type);
        Ok(())
    }
}

/// Queue segments and hand them to the engine.
pub struct AttachSamples {
    pub source_type: MediaSourceType,
    pub segments: Vec<MediaSegment>,
}

impl AttachSamples {
    pub fn execute(self, ctx: &mut SessionContext) -> Result<(), SessionError> {
        enqueue_segments(ctx, self.source_type, self.segments)?;
        attach_data(ctx, self.source_type)
    }
}

/// Read a batch from the data channel, attach it, then renew the need-data request.
pub struct ReadAndAttachSamples {
    pub source_type: MediaSourceType,
    pub reader: Box<dyn DataReader>,
    /// The batch is the last one for the stream.
    pub end_of_stream: bool,
}

impl ReadAndAttachSamples {
    /// A failed read or push still ends the in-flight request and arms a resend, so the
    /// stream is never left waiting on an answer that already arrived.
    pub fn execute(mut self, ctx: &mut SessionContext) -> Result<(), SessionError> {
        let source_type = self.source_type;
        if let Err(err) = self.read_and_attach(ctx) {
            tracing::warn!(
                session_id = %ctx.session_id,
                source_type = %source_type,
                error = %err,
                "could not attach client data; resending need data later"
            );
            if let Some(stream) = ctx.streams.get_mut(&source_type) {
                stream.need_data_outstanding = false;
            }
            schedule_need_data_resend(ctx, source_type);
            return Err(err);
        }
        renew_need_data(ctx, source_type);
        Ok(())
    }

    fn read_and_attach(&mut self, ctx: &mut SessionContext) -> Result<(), SessionError> {
        let segments = self.reader.read_segments().map_err(SessionError::DataRead)?;
        enqueue_segments(ctx, self.source_type, segments)?;
        attach_data(ctx, self.source_type)?;
        if self.end_of_stream {
            Eos {
                source_type: self.source_type,
            }
            .execute(ctx)?;
        }
        Ok(())
    }
}

/// Push whatever is pending for a stream.
pub struct AttachData {
    pub source_type: MediaSourceType,
}

impl AttachData {
    pub fn execute(self, ctx: &mut SessionContext) -> Result<(), SessionError> {
        attach_data(ctx, self.source_type)
    }
}

fn enqueue_segments(
    ctx: &mut SessionContext,
    source_type: MediaSourceType,
    segments: Vec<MediaSegment>,
) -> Result<(), SessionError> {
    let SessionContext { engine, streams, .. } = &mut *ctx;
    let stream = streams
        .get_mut(&source_type)
        .ok_or(SessionError::NoStream(source_type))?;
    let engine = engine_of(engine)?;

    for segment in segments {
        if segment.source_type() != source_type {
            tracing::warn!(
                expected = %source_type,
                got = %segment.source_type(),
                "segment for wrong stream; skipped"
            );
            continue;
        }
        let caps = StreamCaps::of(&segment);
        if stream.caps != Some(caps) {
            engine.update_caps(source_type, caps)?;
            stream.caps = Some(caps);
        }
        stream.pending.push_back(Buffer::from(segment));
    }
    Ok(())
}

/// End of stream from the client; deferred while buffers are pending.
pub struct Eos {
    pub source_type: MediaSourceType,
}

impl Eos {
    pub fn execute(self, ctx: &mut SessionContext) -> Result<(), SessionError> {
        let SessionContext { engine, streams, .. } = &mut *ctx;
        let stream = streams
            .get_mut(&self.source_type)
            .ok_or(SessionError::NoStream(self.source_type))?;

        match stream.eos {
            EosState::Sent => {
                tracing::debug!(source_type = %self.source_type, "end of stream already sent");
            }
            EosState::Pending => {
                tracing::debug!(source_type = %self.source_type, "end of stream already pending");
            }
            EosState::None if !stream.pending.is_empty() => {
                tracing::debug!(
                    source_type = %self.source_type,
                    pending = stream.pending.len(),
                    "deferring end of stream"
                );
                stream.eos = EosState::Pending;
            }
            EosState::None => {
                engine_of(engine)?.end_of_stream(self.source_type)?;
                stream.eos = EosState::Sent;
            }
        }
        ctx.retire_requests(self.source_type);
        Ok(())
    }
}

/// Engine ran dry on a stream.
pub struct Underflow {
    pub source_type: MediaSourceType,
}

impl Underflow {
    pub fn execute(self, ctx: &mut SessionContext) -> Result<(), SessionError> {
        if !ctx.underflow_enabled {
            return Ok(());
        }
        let Some(stream) = ctx.streams.get(&self.source_type) else {
            return Ok(());
        };
        if stream.underflow {
            return Ok(());
        }
        let source_id = stream.source_id;

        if ctx.all_streams_eos_sent() {
            if !ctx.eos_notified {
                tracing::info!(session_id = %ctx.session_id, "underflow after end of stream; reporting end of stream");
                ctx.eos_notified = true;
                ctx.playback_state = PlaybackState::EndOfStream;
                ctx.notifier.playback_state(PlaybackState::EndOfStream);
            }
            return Ok(());
        }

        if let Some(stream) = ctx.streams.get_mut(&self.source_type) {
            stream.underflow = true;
        }
        tracing::warn!(session_id = %ctx.session_id, source_id = %source_id, "buffer underflow");
        ctx.notifier.buffer_underflow(source_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::testing::{EngineCall, Harness, audio_segments};
    use std::sync::atomic::Ordering;

    use media_bridge_proto::Event;
    use media_bridge_types::NetworkState;

    fn need_data_events(events: &[Event]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, Event::NeedMediaData { .. }))
            .count()
    }

    #[test]
    fn need_data_notifies_once_while_outstanding() {
        let mut h = Harness::loaded();
        for _ in 0..3 {
            NeedData {
                source_type: MediaSourceType::Audio,
            }
            .execute(&mut h.ctx)
            .unwrap();
        }
        assert_eq!(need_data_events(&h.drain_events()), 1);
        assert_eq!(h.ctx.active_requests.len(), 1);
    }

    #[test]
    fn need_data_then_attach_three_samples() {
        let mut h = Harness::loaded();
        let audio = h.source_id(MediaSourceType::Audio);
        NeedData {
            source_type: MediaSourceType::Audio,
        }
        .execute(&mut h.ctx)
        .unwrap();

        AttachSamples {
            source_type: MediaSourceType::Audio,
            segments: audio_segments(audio, 3),
        }
        .execute(&mut h.ctx)
        .unwrap();

        let events = h.drain_events();
        assert_eq!(need_data_events(&events), 1);
        // All three queued buffers went to the engine in one batch.
        assert_eq!(
            h.recorder
                .count(|c| *c == EngineCall::Push(MediaSourceType::Audio, 3)),
            1
        );
        assert!(h.ctx.streams[&MediaSourceType::Audio].pending.is_empty());
    }

    #[test]
    fn samples_stay_pending_until_engine_wants_data() {
        let mut h = Harness::loaded();
        let audio = h.source_id(MediaSourceType::Audio);
        AttachSamples {
            source_type: MediaSourceType::Audio,
            segments: audio_segments(audio, 3),
        }
        .execute(&mut h.ctx)
        .unwrap();
        assert_eq!(h.ctx.streams[&MediaSourceType::Audio].pending.len(), 3);
        assert_eq!(h.recorder.count(|c| matches!(c, EngineCall::Push(..))), 0);

        NeedData {
            source_type: MediaSourceType::Audio,
        }
        .execute(&mut h.ctx)
        .unwrap();
        assert!(h.ctx.streams[&MediaSourceType::Audio].pending.is_empty());
        assert_eq!(
            h.recorder
                .count(|c| *c == EngineCall::Push(MediaSourceType::Audio, 3)),
            1
        );
    }

    #[test]
    fn caps_are_updated_only_on_change() {
        let mut h = Harness::loaded();
        let audio = h.source_id(MediaSourceType::Audio);
        AttachSamples {
            source_type: MediaSourceType::Audio,
            segments: audio_segments(audio, 4),
        }
        .execute(&mut h.ctx)
        .unwrap();
        assert_eq!(h.recorder.count(|c| matches!(c, EngineCall::UpdateCaps(..))), 1);
    }

    #[test]
    fn eos_is_deferred_until_pending_buffers_drain() {
        let mut h = Harness::loaded();
        let audio = h.source_id(MediaSourceType::Audio);
        AttachSamples {
            source_type: MediaSourceType::Audio,
            segments: audio_segments(audio, 2),
        }
        .execute(&mut h.ctx)
        .unwrap();

        Eos {
            source_type: MediaSourceType::Audio,
        }
        .execute(&mut h.ctx)
        .unwrap();
        assert_eq!(h.ctx.streams[&MediaSourceType::Audio].eos, EosState::Pending);
        assert_eq!(h.recorder.count(|c| matches!(c, EngineCall::Eos(_))), 0);

        NeedData {
            source_type: MediaSourceType::Audio,
        }
        .execute(&mut h.ctx)
        .unwrap();

        let calls = h.recorder.calls();
        let push = calls
            .iter()
            .position(|c| *c == EngineCall::Push(MediaSourceType::Audio, 2))
            .unwrap();
        let eos = calls
            .iter()
            .position(|c| *c == EngineCall::Eos(MediaSourceType::Audio))
            .unwrap();
        assert!(push < eos);
        assert_eq!(h.recorder.count(|c| matches!(c, EngineCall::Eos(_))), 1);
        assert_eq!(h.ctx.streams[&MediaSourceType::Audio].eos, EosState::Sent);
    }

    #[test]
    fn second_eos_is_a_no_op() {
        let mut h = Harness::loaded();
        for _ in 0..2 {
            Eos {
                source_type: MediaSourceType::Video,
            }
            .execute(&mut h.ctx)
            .unwrap();
        }
        assert_eq!(
            h.recorder
                .count(|c| *c == EngineCall::Eos(MediaSourceType::Video)),
            1
        );
    }

    #[test]
    fn eos_status_from_client_ends_stream_without_new_request() {
        let mut h = Harness::loaded();
        let audio = h.source_id(MediaSourceType::Audio);
        NeedData {
            source_type: MediaSourceType::Audio,
        }
        .execute(&mut h.ctx)
        .unwrap();
        let request_id = *h.ctx.active_requests.keys().next().unwrap();
        h.drain_events();

        HaveData {
            status: MediaSourceStatus::Eos,
            request_id,
            segments: audio_segments(audio, 1),
        }
        .execute(&mut h.ctx)
        .unwrap();

        assert_eq!(need_data_events(&h.drain_events()), 0);
        assert_eq!(h.ctx.streams[&MediaSourceType::Audio].eos, EosState::Sent);
        assert!(h.ctx.active_requests.is_empty());
    }

    #[test]
    fn have_data_ok_renews_request_while_engine_is_hungry() {
        let mut h = Harness::loaded();
        let audio = h.source_id(MediaSourceType::Audio);
        NeedData {
            source_type: MediaSourceType::Audio,
        }
        .execute(&mut h.ctx)
        .unwrap();
        let first = *h.ctx.active_requests.keys().next().unwrap();
        h.drain_events();

        HaveData {
            status: MediaSourceStatus::Ok,
            request_id: first,
            segments: audio_segments(audio, 2),
        }
        .execute(&mut h.ctx)
        .unwrap();

        let events = h.drain_events();
        assert_eq!(need_data_events(&events), 1);
        assert!(!h.ctx.active_requests.contains_key(&first));
        assert_eq!(h.ctx.active_requests.len(), 1);
    }

    #[test]
    fn have_data_with_unknown_request_is_ignored() {
        let mut h = Harness::loaded();
        let audio = h.source_id(MediaSourceType::Audio);
        HaveData {
            status: MediaSourceStatus::Ok,
            request_id: 999,
            segments: audio_segments(audio, 2),
        }
        .execute(&mut h.ctx)
        .unwrap();
        assert!(h.ctx.streams[&MediaSourceType::Audio].pending.is_empty());
    }

    #[test]
    fn failed_have_data_keeps_request_outstanding() {
        let mut h = Harness::loaded();
        NeedData {
            source_type: MediaSourceType::Audio,
        }
        .execute(&mut h.ctx)
        .unwrap();
        let request_id = *h.ctx.active_requests.keys().next().unwrap();

        HaveData {
            status: MediaSourceStatus::Error,
            request_id,
            segments: Vec::new(),
        }
        .execute(&mut h.ctx)
        .unwrap();

        let stream = &h.ctx.streams[&MediaSourceType::Audio];
        assert!(stream.resend_armed);
        assert!(stream.need_data_outstanding);

        ResendNeedData {
            source_type: MediaSourceType::Audio,
        }
        .execute(&mut h.ctx)
        .unwrap();
        let events = h.drain_events();
        assert_eq!(need_data_events(&events), 2);
        assert!(!h.ctx.streams[&MediaSourceType::Audio].resend_armed);
    }

    #[test]
    fn failed_push_keeps_buffers_and_defers_eos() {
        let mut h = Harness::loaded();
        let audio = h.source_id(MediaSourceType::Audio);
        AttachSamples {
            source_type: MediaSourceType::Audio,
            segments: audio_segments(audio, 2),
        }
        .execute(&mut h.ctx)
        .unwrap();
        Eos {
            source_type: MediaSourceType::Audio,
        }
        .execute(&mut h.ctx)
        .unwrap();

        h.recorder.fail_push.store(true, Ordering::SeqCst);
        let refused = NeedData {
            source_type: MediaSourceType::Audio,
        }
        .execute(&mut h.ctx);
        assert!(matches!(refused, Err(SessionError::Engine(_))));
        let stream = &h.ctx.streams[&MediaSourceType::Audio];
        assert_eq!(stream.pending.len(), 2);
        assert_eq!(stream.eos, EosState::Pending);
        assert_eq!(h.recorder.count(|c| matches!(c, EngineCall::Eos(_))), 0);

        AttachData {
            source_type: MediaSourceType::Audio,
        }
        .execute(&mut h.ctx)
        .unwrap();
        assert_eq!(
            h.recorder
                .count(|c| *c == EngineCall::Push(MediaSourceType::Audio, 2)),
            1
        );
        assert_eq!(h.ctx.streams[&MediaSourceType::Audio].eos, EosState::Sent);
    }

    #[test]
    fn failed_attach_rearms_need_data() {
        let mut h = Harness::loaded();
        let audio = h.source_id(MediaSourceType::Audio);
        NeedData {
            source_type: MediaSourceType::Audio,
        }
        .execute(&mut h.ctx)
        .unwrap();
        let request_id = *h.ctx.active_requests.keys().next().unwrap();
        h.drain_events();

        h.recorder.fail_push.store(true, Ordering::SeqCst);
        let result = HaveData {
            status: MediaSourceStatus::Ok,
            request_id,
            segments: audio_segments(audio, 2),
        }
        .execute(&mut h.ctx);
        assert!(result.is_err());

        let stream = &h.ctx.streams[&MediaSourceType::Audio];
        assert!(!stream.need_data_outstanding);
        assert!(stream.resend_armed);
        assert_eq!(stream.pending.len(), 2);

        ResendNeedData {
            source_type: MediaSourceType::Audio,
        }
        .execute(&mut h.ctx)
        .unwrap();
        assert_eq!(need_data_events(&h.drain_events()), 1);
        assert_eq!(
            h.recorder
                .count(|c| *c == EngineCall::Push(MediaSourceType::Audio, 2)),
            0
        );
        AttachData {
            source_type: MediaSourceType::Audio,
        }
        .execute(&mut h.ctx)
        .unwrap();
        assert!(h.ctx.streams[&MediaSourceType::Audio].pending.is_empty());
    }

    #[test]
    fn underflow_ignored_when_disabled() {
        let mut h = Harness::loaded();
        Underflow {
            source_type: MediaSourceType::Audio,
        }
        .execute(&mut h.ctx)
        .unwrap();
        assert!(h.drain_events().is_empty());
    }

    #[test]
    fn underflow_is_latched() {
        let mut h = Harness::loaded();
        h.ctx.underflow_enabled = true;
        for _ in 0..2 {
            Underflow {
                source_type: MediaSourceType::Audio,
            }
            .execute(&mut h.ctx)
            .unwrap();
        }
        let events = h.drain_events();
        let underflows = events
            .iter()
            .filter(|e| matches!(e, Event::BufferUnderflow { .. }))
            .count();
        assert_eq!(underflows, 1);
    }

    #[test]
    fn underflow_after_all_eos_reports_end_of_stream() {
        let mut h = Harness::loaded();
        h.ctx.underflow_enabled = true;
        for source_type in [MediaSourceType::Audio, MediaSourceType::Video] {
            Eos { source_type }.execute(&mut h.ctx).unwrap();
        }
        h.drain_events();

        Underflow {
            source_type: MediaSourceType::Audio,
        }
        .execute(&mut h.ctx)
        .unwrap();

        let events = h.drain_events();
        assert_eq!(
            events,
            vec![Event::PlaybackStateChanged {
                session_id: h.ctx.session_id,
                state: PlaybackState::EndOfStream
            }]
        );
    }

    #[test]
    fn data_after_underflow_reports_buffered_again() {
        let mut h = Harness::loaded();
        let audio = h.source_id(MediaSourceType::Audio);
        h.ctx.underflow_enabled = true;
        Underflow {
            source_type: MediaSourceType::Audio,
        }
        .execute(&mut h.ctx)
        .unwrap();
        h.drain_events();

        NeedData {
            source_type: MediaSourceType::Audio,
        }
        .execute(&mut h.ctx)
        .unwrap();
        AttachSamples {
            source_type: MediaSourceType::Audio,
            segments: audio_segments(audio, 1),
        }
        .execute(&mut h.ctx)
        .unwrap();

        assert!(!h.ctx.streams[&MediaSourceType::Audio].underflow);
        assert!(h.drain_events().contains(&Event::NetworkStateChanged {
            session_id: h.ctx.session_id,
            state: NetworkState::Buffered
        }));
    }

    #[test]
    fn buffered_is_sent_once_every_stream_pushed() {
        let mut h = Harness::loaded();
        let buffered = |events: &[Event]| {
            events
                .iter()
                .filter(|e| {
                    matches!(
                        e,
                        Event::NetworkStateChanged {
                            state: NetworkState::Buffered,
                            ..
                        }
                    )
                })
                .count()
        };
        let audio = h.source_id(MediaSourceType::Audio);
        NeedData {
            source_type: MediaSourceType::Audio,
        }
        .execute(&mut h.ctx)
        .unwrap();
        AttachSamples {
            source_type: MediaSourceType::Audio,
            segments: audio_segments(audio, 1),
        }
        .execute(&mut h.ctx)
        .unwrap();
        assert_eq!(buffered(&h.drain_events()), 0);

        let video = h.source_id(MediaSourceType::Video);
        NeedData {
            source_type: MediaSourceType::Video,
        }
        .execute(&mut h.ctx)
        .unwrap();
        AttachSamples {
            source_type: MediaSourceType::Video,
            segments: vec![MediaSegment::Video {
                header: media_bridge_types::SegmentHeader {
                    source_id: video,
                    timestamp_ns: 0,
                    duration_ns: 33_000_000,
                    data: vec![1],
                },
                width: 1280,
                height: 720,
            }],
        }
        .execute(&mut h.ctx)
        .unwrap();
        assert_eq!(buffered(&h.drain_events()), 1);
    }
}
