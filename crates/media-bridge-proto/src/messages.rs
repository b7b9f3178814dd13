//! Calls, replies and events carried in JSON frames.

use media_bridge_types::{
    MediaSegment, MediaSource, MediaSourceStatus, MediaType, NetworkState, PlaybackState, QosInfo,
    Rectangle, SessionId, SourceId, VideoRequirements, WebAudioDeviceInfo, WebAudioHandle,
    WebAudioPcmConfig, WebAudioPlayerState,
};
use serde::{Deserialize, Serialize};

/// One remote operation. Playback variants other than `CreateSession` target an existing
/// session; `WebAudio*` variants other than `CreateWebAudioPlayer` target a web audio player.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    CreateSession {
        requirements: VideoRequirements,
    },
    DestroySession {
        session_id: SessionId,
    },
    Load {
        session_id: SessionId,
        media_type: MediaType,
        mime_type: String,
        url: String,
    },
    AttachSource {
        session_id: SessionId,
        source: MediaSource,
    },
    RemoveSource {
        session_id: SessionId,
        source_id: SourceId,
    },
    AllSourcesAttached {
        session_id: SessionId,
    },
    Play {
        session_id: SessionId,
    },
    Pause {
        session_id: SessionId,
    },
    Stop {
        session_id: SessionId,
    },
    SetPlaybackRate {
        session_id: SessionId,
        rate: f64,
    },
    SetPosition {
        session_id: SessionId,
        position_ns: i64,
    },
    GetPosition {
        session_id: SessionId,
    },
    SetVideoWindow {
        session_id: SessionId,
        window: Rectangle,
    },
    HaveData {
        session_id: SessionId,
        status: MediaSourceStatus,
        request_id: u32,
        segments: Vec<MediaSegment>,
    },
    SetVolume {
        session_id: SessionId,
        volume: f64,
    },
    GetVolume {
        session_id: SessionId,
    },
    SetMute {
        session_id: SessionId,
        mute: bool,
    },
    SetSync {
        session_id: SessionId,
        sync: bool,
    },
    SetBufferingLimit {
        session_id: SessionId,
        limit_ms: u32,
    },
    RenderFrame {
        session_id: SessionId,
    },
    Flush {
        session_id: SessionId,
        source_id: SourceId,
        reset_time: bool,
    },

    CreateWebAudioPlayer {
        mime_type: String,
        priority: u32,
        config: Option<WebAudioPcmConfig>,
    },
    DestroyWebAudioPlayer {
        handle: WebAudioHandle,
    },
    WebAudioPlay {
        handle: WebAudioHandle,
    },
    WebAudioPause {
        handle: WebAudioHandle,
    },
    WebAudioSetEos {
        handle: WebAudioHandle,
    },
    WebAudioGetBufferAvailable {
        handle: WebAudioHandle,
    },
    WebAudioGetBufferDelay {
        handle: WebAudioHandle,
    },
    /// `data` holds exactly `frames` frames and must follow a `WebAudioGetBufferAvailable`.
    WebAudioWriteBuffer {
        handle: WebAudioHandle,
        frames: u32,
        data: Vec<u8>,
    },
    WebAudioGetDeviceInfo {
        handle: WebAudioHandle,
    },
    WebAudioSetVolume {
        handle: WebAudioHandle,
        volume: f64,
    },
    WebAudioGetVolume {
        handle: WebAudioHandle,
    },
}

impl Request {
    /// Target session, `None` for `CreateSession` and web audio requests.
    pub fn session_id(&self) -> Option<SessionId> {
        use Request::*;
        match self {
            CreateSession { .. } => None,
            CreateWebAudioPlayer { .. }
            | DestroyWebAudioPlayer { .. }
            | WebAudioPlay { .. }
            | WebAudioPause { .. }
            | WebAudioSetEos { .. }
            | WebAudioGetBufferAvailable { .. }
            | WebAudioGetBufferDelay { .. }
            | WebAudioWriteBuffer { .. }
            | WebAudioGetDeviceInfo { .. }
            | WebAudioSetVolume { .. }
            | WebAudioGetVolume { .. } => None,
            DestroySession { session_id }
            | Load { session_id, .. }
            | AttachSource { session_id, .. }
            | RemoveSource { session_id, .. }
            | AllSourcesAttached { session_id }
            | Play { session_id }
            | Pause { session_id }
            | Stop { session_id }
            | SetPlaybackRate { session_id, .. }
            | SetPosition { session_id, .. }
            | GetPosition { session_id }
            | SetVideoWindow { session_id, .. }
            | HaveData { session_id, .. }
            | SetVolume { session_id, .. }
            | GetVolume { session_id }
            | SetMute { session_id, .. }
            | SetSync { session_id, .. }
            | SetBufferingLimit { session_id, .. }
            | RenderFrame { session_id }
            | Flush { session_id, .. } => Some(*session_id),
        }
    }

    /// Short operation name used in logs.
    pub fn name(&self) -> &'static str {
        use Request::*;
        match self {
            CreateSession { .. } => "create_session",
            DestroySession { .. } => "destroy_session",
            Load { .. } => "load",
            AttachSource { .. } => "attach_source",
            RemoveSource { .. } => "remove_source",
            AllSourcesAttached { .. } => "all_sources_attached",
            Play { .. } => "play",
            Pause { .. } => "pause",
            Stop { .. } => "stop",
            SetPlaybackRate { .. } => "set_playback_rate",
            SetPosition { .. } => "set_position",
            GetPosition { .. } => "get_position",
            SetVideoWindow { .. } => "set_video_window",
            HaveData { .. } => "have_data",
            SetVolume { .. } => "set_volume",
            GetVolume { .. } => "get_volume",
            SetMute { .. } => "set_mute",
            SetSync { .. } => "set_sync",
            SetBufferingLimit { .. } => "set_buffering_limit",
            RenderFrame { .. } => "render_frame",
            Flush { .. } => "flush",
            CreateWebAudioPlayer { .. } => "create_web_audio_player",
            DestroyWebAudioPlayer { .. } => "destroy_web_audio_player",
            WebAudioPlay { .. } => "web_audio_play",
            WebAudioPause { .. } => "web_audio_pause",
            WebAudioSetEos { .. } => "web_audio_set_eos",
            WebAudioGetBufferAvailable { .. } => "web_audio_get_buffer_available",
            WebAudioGetBufferDelay { .. } => "web_audio_get_buffer_delay",
            WebAudioWriteBuffer { .. } => "web_audio_write_buffer",
            WebAudioGetDeviceInfo { .. } => "web_audio_get_device_info",
            WebAudioSetVolume { .. } => "web_audio_set_volume",
            WebAudioGetVolume { .. } => "web_audio_get_volume",
        }
    }

    /// Target web audio player, `None` for everything else.
    pub fn web_audio_handle(&self) -> Option<WebAudioHandle> {
        use Request::*;
        match self {
            DestroyWebAudioPlayer { handle }
            | WebAudioPlay { handle }
            | WebAudioPause { handle }
            | WebAudioSetEos { handle }
            | WebAudioGetBufferAvailable { handle }
            | WebAudioGetBufferDelay { handle }
            | WebAudioWriteBuffer { handle, .. }
            | WebAudioGetDeviceInfo { handle }
            | WebAudioSetVolume { handle, .. }
            | WebAudioGetVolume { handle } => Some(*handle),
            _ => None,
        }
    }
}

/// Successful result of a [`Request`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Response {
    Ack,
    SessionCreated { session_id: SessionId },
    SourceAttached { source_id: SourceId },
    Position { position_ns: i64 },
    Volume { volume: f64 },
    WebAudioPlayerCreated { handle: WebAudioHandle },
    BufferAvailable { available_frames: u32 },
    BufferDelay { delay_frames: u32 },
    DeviceInfo { info: WebAudioDeviceInfo },
}

/// Client → server call frame.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CallEnvelope {
    pub call_id: u64,
    pub request: Request,
}

/// Server → client reply frame. `Err` carries the server's failure text.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ReplyEnvelope {
    pub call_id: u64,
    pub result: Result<Response, String>,
}

/// Discriminant of [`Event`], used as the subscription key.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PlaybackState,
    Position,
    NetworkState,
    NeedMediaData,
    Qos,
    BufferUnderflow,
    PlaybackError,
    SourceFlushed,
    WebAudioState,
}

impl EventKind {
    /// Every kind, in subscription order.
    pub const ALL: [EventKind; 9] = [
        EventKind::PlaybackState,
        EventKind::Position,
        EventKind::NetworkState,
        EventKind::NeedMediaData,
        EventKind::Qos,
        EventKind::BufferUnderflow,
        EventKind::PlaybackError,
        EventKind::SourceFlushed,
        EventKind::WebAudioState,
    ];
}

/// Asynchronous server notification.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    PlaybackStateChanged {
        session_id: SessionId,
        state: PlaybackState,
    },
    PositionChanged {
        session_id: SessionId,
        position_ns: i64,
    },
    NetworkStateChanged {
        session_id: SessionId,
        state: NetworkState,
    },
    NeedMediaData {
        session_id: SessionId,
        source_id: SourceId,
        frame_count: u32,
        request_id: u32,
    },
    Qos {
        session_id: SessionId,
        source_id: SourceId,
        info: QosInfo,
    },
    BufferUnderflow {
        session_id: SessionId,
        source_id: SourceId,
    },
    PlaybackError {
        session_id: SessionId,
        source_id: SourceId,
        message: String,
    },
    SourceFlushed {
        session_id: SessionId,
        source_id: SourceId,
    },
    WebAudioStateChanged {
        handle: WebAudioHandle,
        state: WebAudioPlayerState,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::PlaybackStateChanged { .. } => EventKind::PlaybackState,
            Event::PositionChanged { .. } => EventKind::Position,
            Event::NetworkStateChanged { .. } => EventKind::NetworkState,
            Event::NeedMediaData { .. } => EventKind::NeedMediaData,
            Event::Qos { .. } => EventKind::Qos,
            Event::BufferUnderflow { .. } => EventKind::BufferUnderflow,
            Event::PlaybackError { .. } => EventKind::PlaybackError,
            Event::SourceFlushed { .. } => EventKind::SourceFlushed,
            Event::WebAudioStateChanged { .. } => EventKind::WebAudioState,
        }
    }

    /// Session the event belongs to, `None` for web audio events.
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            Event::PlaybackStateChanged { session_id, .. }
            | Event::PositionChanged { session_id, .. }
            | Event::NetworkStateChanged { session_id, .. }
            | Event::NeedMediaData { session_id, .. }
            | Event::Qos { session_id, .. }
            | Event::BufferUnderflow { session_id, .. }
            | Event::PlaybackError { session_id, .. }
            | Event::SourceFlushed { session_id, .. } => Some(*session_id),
            Event::WebAudioStateChanged { .. } => None,
        }
    }

    pub fn web_audio_handle(&self) -> Option<WebAudioHandle> {
        match self {
            Event::WebAudioStateChanged { handle, .. } => Some(*handle),
            _ => None,
        }
    }
}
