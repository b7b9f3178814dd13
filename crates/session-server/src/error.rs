//! Errors surfaced by session operations.

use std::io;

use media_bridge_types::{MediaSourceType, SessionId, SourceId, WebAudioHandle};
use session_runtime::ScheduleError;
use thiserror::Error;

use crate::engine::EngineError;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("media engine has not been loaded")]
    NotLoaded,
    #[error("{0} source already attached")]
    SourceAlreadyAttached(MediaSourceType),
    #[error("no source with id {0}")]
    UnknownSource(SourceId),
    #[error("no {0} stream attached")]
    NoStream(MediaSourceType),
    #[error("all sources were already attached")]
    AllSourcesAlreadyAttached,
    #[error("invalid playback rate {0}")]
    InvalidRate(f64),
    #[error("session {0} not found")]
    UnknownSession(SessionId),
    #[error("session limit of {0} reached")]
    TooManySessions(usize),
    #[error("web audio player {0} not found")]
    UnknownWebAudioPlayer(WebAudioHandle),
    #[error("web audio player limit of {0} reached")]
    TooManyWebAudioPlayers(usize),
    #[error("unsupported web audio mime type {0:?}")]
    UnsupportedMimeType(String),
    #[error("web audio player needs a PCM config")]
    MissingPcmConfig,
    #[error("write_buffer must follow get_buffer_available")]
    WriteWithoutAvailability,
    #[error("{bytes} bytes is not {frames} frames")]
    FrameCountMismatch { frames: u32, bytes: usize },
    #[error("{requested} frames do not fit, {available} available")]
    WebAudioBufferFull { requested: u32, available: u32 },
    #[error("engine took {written} of {expected} bytes")]
    IncompleteWrite { written: usize, expected: usize },
    #[error("failed to read media data: {0}")]
    DataRead(String),
    #[error("engine: {0}")]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error("failed to start worker: {0}")]
    Spawn(#[from] io::Error),
}
