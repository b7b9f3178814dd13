//! Contract of the media engine that owns the decode/render pipeline.
//!
//! The engine is created per session by an [`EngineFactory`] and lives inside the session
//! context, so only the scheduler worker ever calls it. Engine callbacks go the other way
//! through the [`EngineEventSink`] it was created with.

use media_bridge_types::{
    MediaSegment, MediaSource, MediaSourceType, MediaType, Rectangle, WebAudioPcmConfig,
};
use thiserror::Error;

use crate::sink::{EngineEventSink, WebAudioEventSink};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    /// The element the operation needs does not exist yet; the caller may retry later.
    #[error("engine not ready")]
    NotReady,
    #[error("{0}")]
    Rejected(String),
}

/// Pipeline states the engine can be driven to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    Null,
    Ready,
    Paused,
    Playing,
}

/// Stream format derived from segments, pushed to the engine when it changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamCaps {
    Audio { sample_rate: u32, channels: u32 },
    Video { width: u32, height: u32 },
}

impl StreamCaps {
    pub fn of(segment: &MediaSegment) -> Self {
        match segment {
            MediaSegment::Audio {
                sample_rate,
                channels,
                ..
            } => StreamCaps::Audio {
                sample_rate: *sample_rate,
                channels: *channels,
            },
            MediaSegment::Video { width, height, .. } => StreamCaps::Video {
                width: *width,
                height: *height,
            },
        }
    }
}

/// A segment converted into the engine's buffer representation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Buffer {
    pub timestamp_ns: i64,
    pub duration_ns: i64,
    pub data: Vec<u8>,
}

impl From<MediaSegment> for Buffer {
    fn from(segment: MediaSegment) -> Self {
        let header = match segment {
            MediaSegment::Audio { header, .. } | MediaSegment::Video { header, .. } => header,
        };
        Buffer {
            timestamp_ns: header.timestamp_ns,
            duration_ns: header.duration_ns,
            data: header.data,
        }
    }
}

pub trait MediaEngine: Send {
    fn attach_source(&mut self, source: &MediaSource) -> Result<(), EngineError>;
    fn remove_source(&mut self, source_type: MediaSourceType) -> Result<(), EngineError>;
    fn all_sources_attached(&mut self) -> Result<(), EngineError>;

    fn set_state(&mut self, state: EngineState) -> Result<(), EngineError>;
    fn seek(&mut self, position_ns: i64, rate: f64) -> Result<(), EngineError>;
    fn set_playback_rate(&mut self, rate: f64) -> Result<(), EngineError>;
    fn position(&self) -> Option<i64>;

    fn update_caps(&mut self, source_type: MediaSourceType, caps: StreamCaps) -> Result<(), EngineError>;
    /// The caller keeps `buffers` and may retry them if the push fails.
    fn push_buffers(&mut self, source_type: MediaSourceType, buffers: &[Buffer]) -> Result<(), EngineError>;
    fn end_of_stream(&mut self, source_type: MediaSourceType) -> Result<(), EngineError>;
    fn flush(&mut self, source_type: MediaSourceType, reset_time: bool) -> Result<(), EngineError>;

    fn set_video_geometry(&mut self, window: Rectangle) -> Result<(), EngineError>;
    fn set_volume(&mut self, volume: f64) -> Result<(), EngineError>;
    fn volume(&self) -> Result<f64, EngineError>;
    fn set_mute(&mut self, mute: bool) -> Result<(), EngineError>;
    fn set_sync(&mut self, sync: bool) -> Result<(), EngineError>;
    fn set_buffering_limit(&mut self, limit_ms: u32) -> Result<(), EngineError>;
    fn render_frame(&mut self) -> Result<(), EngineError>;
}

/// Creates one engine per `load`.
pub trait EngineFactory: Send + Sync {
    fn create(
        &self,
        media_type: MediaType,
        mime_type: &str,
        url: &str,
        events: EngineEventSink,
    ) -> Result<Box<dyn MediaEngine>, EngineError>;
}

/// Raw PCM output behind a web audio player. Called only from the scheduler worker.
pub trait WebAudioEngine: Send {
    fn play(&mut self) -> Result<(), EngineError>;
    fn pause(&mut self) -> Result<(), EngineError>;
    /// No more data follows; the engine reports end of stream once its queue drains.
    fn set_eos(&mut self) -> Result<(), EngineError>;
    /// Returns the number of bytes taken from `data`.
    fn write_buffer(&mut self, data: &[u8]) -> Result<usize, EngineError>;
    /// Bytes written but not yet rendered.
    fn queued_bytes(&self) -> usize;
    fn set_volume(&mut self, volume: f64) -> Result<(), EngineError>;
    fn volume(&self) -> Result<f64, EngineError>;
}

pub trait WebAudioEngineFactory: Send + Sync {
    fn create(
        &self,
        config: &WebAudioPcmConfig,
        events: WebAudioEventSink,
    ) -> Result<Box<dyn WebAudioEngine>, EngineError>;
}
