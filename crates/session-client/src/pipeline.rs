//! Application-facing playback pipeline.
//!
//! A [`MediaPipeline`] owns one server session for its whole life: the session is created in
//! [`MediaPipeline::new`] and destroyed on drop. Events arrive on the transport's reader
//! thread, are re-posted to the pipeline's own [`EventQueueWorker`] and reach the
//! [`MediaPipelineClient`] from there, so application callbacks never run on the reader.
//!
//! ## Connection loss
//! A server session belongs to the connection that created it, and the server destroys it
//! when that connection closes. The channel's automatic reconnect restores the event
//! subscriptions but not the session: later calls fail with the server's unknown-session
//! error, and the application has to build a new pipeline.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use media_bridge_proto::{CallError, Event, EventHandler, Request, Response, TransportClient};
use media_bridge_types::{
    MediaSegment, MediaSource, MediaSourceStatus, MediaSourceType, MediaType, NetworkState,
    PlaybackState, QosInfo, Rectangle, SessionId, SourceId, VideoRequirements,
};
use session_runtime::EventQueueWorker;
use thiserror::Error;

use crate::channel::RemoteSessionChannel;

/// Callbacks delivered on the pipeline's event thread.
#[allow(unused_variables)]
pub trait MediaPipelineClient: Send + Sync {
    fn notify_playback_state(&self, state: PlaybackState);

    fn notify_need_media_data(&self, source_id: SourceId, frame_count: u32, request_id: u32);

    fn notify_position(&self, position_ns: i64) {}

    fn notify_network_state(&self, state: NetworkState) {}

    fn notify_qos(&self, source_id: SourceId, info: QosInfo) {}

    fn notify_buffer_underflow(&self, source_id: SourceId) {}

    fn notify_playback_error(&self, source_id: SourceId, message: &str) {}

    fn notify_source_flushed(&self, source_id: SourceId) {}
}

/// Playback state as seen by the client; decides which operations are meaningful.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Buffering,
    Playing,
    Seeking,
    EndOfStream,
    Failure,
}

impl ClientState {
    fn after_playback(self, state: PlaybackState) -> Self {
        match state {
            PlaybackState::Playing | PlaybackState::Paused => ClientState::Playing,
            PlaybackState::Seeking => ClientState::Seeking,
            PlaybackState::Stopped => ClientState::Idle,
            PlaybackState::Flushed => ClientState::Buffering,
            PlaybackState::EndOfStream => ClientState::EndOfStream,
            PlaybackState::Failure => ClientState::Failure,
            PlaybackState::Unknown | PlaybackState::Idle => self,
        }
    }

    fn after_network(self, state: NetworkState) -> Self {
        match state {
            NetworkState::Buffering | NetworkState::BufferingProgress | NetworkState::Stalled => {
                ClientState::Buffering
            }
            NetworkState::FormatError | NetworkState::NetworkError | NetworkState::DecodeError => {
                ClientState::Failure
            }
            NetworkState::Unknown | NetworkState::Idle | NetworkState::Buffered => self,
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Call(#[from] CallError),
    #[error("{op} not allowed while {state:?}")]
    InvalidState {
        op: &'static str,
        state: ClientState,
    },
    #[error("failed to start event worker: {0}")]
    Spawn(#[from] io::Error),
}

/// State touched from both the caller and the event thread.
struct Shared {
    session_id: OnceLock<SessionId>,
    state: Mutex<ClientState>,
    /// Need-data request id → source it was raised for.
    need_data: Mutex<HashMap<u32, SourceId>>,
    sources: Mutex<BTreeMap<SourceId, MediaSourceType>>,
    client: Weak<dyn MediaPipelineClient>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Shared {
    fn state(&self) -> ClientState {
        *lock(&self.state)
    }

    fn set_state(&self, new: ClientState, cause: &str) {
        let mut state = lock(&self.state);
        if *state != new {
            tracing::debug!(old = ?*state, ?new, cause, "client state changed");
        }
        *state = new;
    }

    fn discard_need_data(&self, request_id: u32) {
        if lock(&self.need_data).remove(&request_id).is_some() {
            tracing::info!(request_id, "need data request discarded");
        } else {
            tracing::info!(request_id, "need data request not found");
        }
    }

    fn forget_need_data(&self, request_ids: &[u32]) {
        let mut need_data = lock(&self.need_data);
        for id in request_ids {
            need_data.remove(id);
        }
    }

    /// Runs on the event worker.
    fn dispatch(&self, event: Event) {
        match (event.session_id(), self.session_id.get()) {
            (Some(event_session), Some(own)) if event_session == *own => {}
            _ => return,
        }
        let client = self.client.upgrade();
        match event {
            Event::PlaybackStateChanged { state, .. } => {
                self.set_state(self.state().after_playback(state), "playback state");
                if let Some(c) = client {
                    c.notify_playback_state(state);
                }
            }
            Event::NetworkStateChanged { state, .. } => {
                self.set_state(self.state().after_network(state), "network state");
                if let Some(c) = client {
                    c.notify_network_state(state);
                }
            }
            Event::NeedMediaData {
                source_id,
                frame_count,
                request_id,
                ..
            } => self.on_need_media_data(client, source_id, frame_count, request_id),
            Event::PositionChanged { position_ns, .. } => {
                if let Some(c) = client {
                    c.notify_position(position_ns);
                }
            }
            Event::Qos { source_id, info, .. } => {
                if let Some(c) = client {
                    c.notify_qos(source_id, info);
                }
            }
            Event::BufferUnderflow { source_id, .. } => {
                if let Some(c) = client {
                    c.notify_buffer_underflow(source_id);
                }
            }
            Event::PlaybackError {
                source_id, message, ..
            } => {
                if let Some(c) = client {
                    c.notify_playback_error(source_id, &message);
                }
            }
            Event::SourceFlushed { source_id, .. } => {
                if let Some(c) = client {
                    c.notify_source_flushed(source_id);
                }
            }
            // Web audio events never carry a session id.
            Event::WebAudioStateChanged { .. } => {}
        }
    }

    fn on_need_media_data(
        &self,
        client: Option<Arc<dyn MediaPipelineClient>>,
        source_id: SourceId,
        frame_count: u32,
        request_id: u32,
    ) {
        if !lock(&self.sources).contains_key(&source_id) {
            tracing::warn!(source_id = %source_id, request_id, "need data for unknown source; ignoring");
            return;
        }
        match self.state() {
            ClientState::Buffering | ClientState::Playing => {
                lock(&self.need_data).insert(request_id, source_id);
                if let Some(c) = client {
                    c.notify_need_media_data(source_id, frame_count, request_id);
                }
            }
            ClientState::Seeking => {
                tracing::info!(request_id, "need data while seeking; ignoring");
            }
            state => {
                tracing::warn!(?state, request_id, "need data in unexpected state; ignoring");
            }
        }
    }
}

pub struct MediaPipeline {
    session_id: SessionId,
    channel: RemoteSessionChannel,
    shared: Arc<Shared>,
    events: Arc<EventQueueWorker>,
}

impl MediaPipeline {
    /// Attach to the server and create a session.
    pub fn new(
        transport: Arc<dyn TransportClient>,
        client: &Arc<dyn MediaPipelineClient>,
        requirements: VideoRequirements,
    ) -> Result<Self, PipelineError> {
        let events = Arc::new(EventQueueWorker::start("media-pipeline-events")?);
        let shared = Arc::new(Shared {
            session_id: OnceLock::new(),
            state: Mutex::new(ClientState::Idle),
            need_data: Mutex::new(HashMap::new()),
            sources: Mutex::new(BTreeMap::new()),
            client: Arc::downgrade(client),
        });

        let handler: EventHandler = {
            let shared = Arc::downgrade(&shared);
            let events = Arc::downgrade(&events);
            Arc::new(move |event| {
                let (Some(shared), Some(events)) = (shared.upgrade(), events.upgrade()) else {
                    return;
                };
                events.add(move || shared.dispatch(event));
            })
        };
        let channel = RemoteSessionChannel::new(transport, handler);
        channel.attach_channel()?;

        let session_id = match channel.call(Request::CreateSession { requirements })? {
            Response::SessionCreated { session_id } => session_id,
            response => {
                return Err(CallError::UnexpectedResponse {
                    op: "create_session",
                    response,
                }
                .into());
            }
        };
        let _ = shared.session_id.set(session_id);
        tracing::info!(session_id = %session_id, "pipeline created");

        Ok(Self {
            session_id,
            channel,
            shared,
            events,
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn state(&self) -> ClientState {
        self.shared.state()
    }

    /// Wait until every event received so far has been handed to the client.
    pub fn flush_events(&self) {
        self.events.flush();
    }

    pub fn load(&self, media_type: MediaType, mime_type: &str, url: &str) -> Result<(), PipelineError> {
        self.channel.call_ack(Request::Load {
            session_id: self.session_id,
            media_type,
            mime_type: mime_type.to_string(),
            url: url.to_string(),
        })?;
        Ok(())
    }

    pub fn attach_source(&self, source: MediaSource) -> Result<SourceId, PipelineError> {
        let source_type = source.source_type();
        let response = self.channel.call(Request::AttachSource {
            session_id: self.session_id,
            source,
        })?;
        let Response::SourceAttached { source_id } = response else {
            return Err(CallError::UnexpectedResponse {
                op: "attach_source",
                response,
            }
            .into());
        };
        lock(&self.shared.sources).insert(source_id, source_type);
        Ok(source_id)
    }

    pub fn remove_source(&self, source_id: SourceId) -> Result<(), PipelineError> {
        self.channel.call_ack(Request::RemoveSource {
            session_id: self.session_id,
            source_id,
        })?;
        lock(&self.shared.sources).remove(&source_id);
        Ok(())
    }

    pub fn all_sources_attached(&self) -> Result<(), PipelineError> {
        self.channel.call_ack(Request::AllSourcesAttached {
            session_id: self.session_id,
        })?;
        Ok(())
    }

    pub fn play(&self) -> Result<(), PipelineError> {
        self.channel.call_ack(Request::Play {
            session_id: self.session_id,
        })?;
        Ok(())
    }

    pub fn pause(&self) -> Result<(), PipelineError> {
        self.channel.call_ack(Request::Pause {
            session_id: self.session_id,
        })?;
        Ok(())
    }

    pub fn stop(&self) -> Result<(), PipelineError> {
        self.channel.call_ack(Request::Stop {
            session_id: self.session_id,
        })?;
        self.shared.set_state(ClientState::Idle, "stop");
        Ok(())
    }

    pub fn set_playback_rate(&self, rate: f64) -> Result<(), PipelineError> {
        self.channel.call_ack(Request::SetPlaybackRate {
            session_id: self.session_id,
            rate,
        })?;
        Ok(())
    }

    pub fn set_position(&self, position_ns: i64) -> Result<(), PipelineError> {
        match self.state() {
            ClientState::Playing
            | ClientState::Buffering
            | ClientState::Seeking
            | ClientState::EndOfStream => {}
            state => {
                tracing::warn!(?state, "set_position in unexpected state");
                return Err(PipelineError::InvalidState {
                    op: "set_position",
                    state,
                });
            }
        }
        // Requests issued before the seek refer to data before the seek point. Ones raised
        // while the call is in flight are already for the new position.
        let stale: Vec<u32> = lock(&self.shared.need_data).keys().copied().collect();
        self.channel.call_ack(Request::SetPosition {
            session_id: self.session_id,
            position_ns,
        })?;
        self.shared.forget_need_data(&stale);
        Ok(())
    }

    pub fn get_position(&self) -> Result<i64, PipelineError> {
        match self.channel.call(Request::GetPosition {
            session_id: self.session_id,
        })? {
            Response::Position { position_ns } => Ok(position_ns),
            response => Err(CallError::UnexpectedResponse {
                op: "get_position",
                response,
            }
            .into()),
        }
    }

    pub fn set_video_window(&self, window: Rectangle) -> Result<(), PipelineError> {
        self.channel.call_ack(Request::SetVideoWindow {
            session_id: self.session_id,
            window,
        })?;
        Ok(())
    }

    /// Answer need-data request `request_id`.
    ///
    /// While seeking the request is discarded and the call succeeds; an unknown request id is
    /// also accepted and dropped.
    pub fn have_data(
        &self,
        status: MediaSourceStatus,
        request_id: u32,
        segments: Vec<MediaSegment>,
    ) -> Result<(), PipelineError> {
        match self.state() {
            ClientState::Buffering | ClientState::Playing => {}
            ClientState::Seeking => {
                tracing::info!(request_id, "have_data while seeking; discarding");
                self.shared.discard_need_data(request_id);
                return Ok(());
            }
            state => {
                tracing::warn!(?state, request_id, "have_data in unexpected state; discarding");
                self.shared.discard_need_data(request_id);
                return Err(PipelineError::InvalidState {
                    op: "have_data",
                    state,
                });
            }
        }
        if lock(&self.shared.need_data).remove(&request_id).is_none() {
            tracing::warn!(request_id, "have_data for unknown request; ignoring");
            return Ok(());
        }
        self.channel.call_ack(Request::HaveData {
            session_id: self.session_id,
            status,
            request_id,
            segments,
        })?;
        Ok(())
    }

    pub fn set_volume(&self, volume: f64) -> Result<(), PipelineError> {
        self.channel.call_ack(Request::SetVolume {
            session_id: self.session_id,
            volume,
        })?;
        Ok(())
    }

    pub fn get_volume(&self) -> Result<f64, PipelineError> {
        match self.channel.call(Request::GetVolume {
            session_id: self.session_id,
        })? {
            Response::Volume { volume } => Ok(volume),
            response => Err(CallError::UnexpectedResponse {
                op: "get_volume",
                response,
            }
            .into()),
        }
    }

    pub fn set_mute(&self, mute: bool) -> Result<(), PipelineError> {
        self.channel.call_ack(Request::SetMute {
            session_id: self.session_id,
            mute,
        })?;
        Ok(())
    }

    pub fn set_sync(&self, sync: bool) -> Result<(), PipelineError> {
        self.channel.call_ack(Request::SetSync {
            session_id: self.session_id,
            sync,
        })?;
        Ok(())
    }

    pub fn set_buffering_limit(&self, limit_ms: u32) -> Result<(), PipelineError> {
        self.channel.call_ack(Request::SetBufferingLimit {
            session_id: self.session_id,
            limit_ms,
        })?;
        Ok(())
    }

    pub fn render_frame(&self) -> Result<(), PipelineError> {
        self.channel.call_ack(Request::RenderFrame {
            session_id: self.session_id,
        })?;
        Ok(())
    }

    pub fn flush(&self, source_id: SourceId, reset_time: bool) -> Result<(), PipelineError> {
        let stale: Vec<u32> = lock(&self.shared.need_data)
            .iter()
            .filter(|(_, s)| **s == source_id)
            .map(|(id, _)| *id)
            .collect();
        self.channel.call_ack(Request::Flush {
            session_id: self.session_id,
            source_id,
            reset_time,
        })?;
        self.shared.forget_need_data(&stale);
        Ok(())
    }
}

impl Drop for MediaPipeline {
    fn drop(&mut self) {
        match self.channel.call_ack(Request::DestroySession {
            session_id: self.session_id,
        }) {
            Ok(()) => tracing::info!(session_id = %self.session_id, "pipeline destroyed"),
            Err(e) => tracing::warn!(session_id = %self.session_id, "session not destroyed: {e}"),
        }
        self.channel.detach_channel();
    }
}
