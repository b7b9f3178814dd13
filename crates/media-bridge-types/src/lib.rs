//! Shared domain types for `session-server` and `session-client`.
//!
//! Everything here crosses the socket as JSON, so all types derive `serde`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Handle of a playback session, allocated by the server on creation.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct SessionId(pub i32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an attached media source within one session.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct SourceId(pub i32);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of elementary stream a source carries.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum MediaSourceType {
    Audio,
    Video,
    Subtitle,
}

impl MediaSourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaSourceType::Audio => "audio",
            MediaSourceType::Video => "video",
            MediaSourceType::Subtitle => "subtitle",
        }
    }
}

impl fmt::Display for MediaSourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the media is delivered to the session.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    #[default]
    Unknown,
    /// Media source extensions: the client pushes segments on request.
    Mse,
}

/// Playback state reported by the server.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    #[default]
    Unknown,
    Idle,
    Playing,
    Paused,
    /// A seek was accepted and buffers are being discarded.
    Seeking,
    /// The seek completed; the pipeline is flushed and waits for new data.
    Flushed,
    Stopped,
    EndOfStream,
    Failure,
}

/// Network/buffering state reported by the server.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NetworkState {
    #[default]
    Unknown,
    Idle,
    Buffering,
    BufferingProgress,
    /// Every attached stream has received data.
    Buffered,
    /// Playback stalled on an underflow.
    Stalled,
    FormatError,
    NetworkError,
    DecodeError,
}

/// Status accompanying a `have_data` answer from the client.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MediaSourceStatus {
    Ok,
    /// The segments are the last ones for this stream.
    Eos,
    Error,
    CodecChanged,
    NoAvailableSamples,
}

/// Audio stream description.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AudioConfig {
    pub mime_type: String,
    pub sample_rate: u32,
    pub channels: u32,
    pub codec_data: Option<Vec<u8>>,
}

/// Video stream description.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VideoConfig {
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
    pub codec_data: Option<Vec<u8>>,
}

/// A media source the client wants to attach.
///
/// The set of kinds is closed; callers match instead of downcasting.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MediaSource {
    Audio(AudioConfig),
    Video(VideoConfig),
    VideoDolbyVision {
        video: VideoConfig,
        /// Dolby Vision profile number.
        profile: u32,
    },
    Subtitle {
        mime_type: String,
        text_track_identifier: String,
    },
}

impl MediaSource {
    pub fn source_type(&self) -> MediaSourceType {
        match self {
            MediaSource::Audio(_) => MediaSourceType::Audio,
            MediaSource::Video(_) | MediaSource::VideoDolbyVision { .. } => MediaSourceType::Video,
            MediaSource::Subtitle { .. } => MediaSourceType::Subtitle,
        }
    }

    pub fn mime_type(&self) -> &str {
        match self {
            MediaSource::Audio(cfg) => &cfg.mime_type,
            MediaSource::Video(cfg) => &cfg.mime_type,
            MediaSource::VideoDolbyVision { video, .. } => &video.mime_type,
            MediaSource::Subtitle { mime_type, .. } => mime_type,
        }
    }
}

/// Fields shared by every segment kind.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SegmentHeader {
    pub source_id: SourceId,
    pub timestamp_ns: i64,
    pub duration_ns: i64,
    pub data: Vec<u8>,
}

impl Default for SourceId {
    fn default() -> Self {
        SourceId(-1)
    }
}

/// One encoded access unit handed to the server.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MediaSegment {
    Audio {
        #[serde(flatten)]
        header: SegmentHeader,
        sample_rate: u32,
        channels: u32,
    },
    Video {
        #[serde(flatten)]
        header: SegmentHeader,
        width: u32,
        height: u32,
    },
}

impl MediaSegment {
    pub fn header(&self) -> &SegmentHeader {
        match self {
            MediaSegment::Audio { header, .. } | MediaSegment::Video { header, .. } => header,
        }
    }

    pub fn source_type(&self) -> MediaSourceType {
        match self {
            MediaSegment::Audio { .. } => MediaSourceType::Audio,
            MediaSegment::Video { .. } => MediaSourceType::Video,
        }
    }

    pub fn source_id(&self) -> SourceId {
        self.header().source_id
    }

    /// End timestamp of the segment.
    pub fn end_ns(&self) -> i64 {
        let h = self.header();
        h.timestamp_ns.saturating_add(h.duration_ns)
    }
}

/// Quality-of-service counters for one stream.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QosInfo {
    pub processed: u64,
    pub dropped: u64,
}

/// Constraints the client places on the video output at session creation.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VideoRequirements {
    pub max_width: u32,
    pub max_height: u32,
}

impl Default for VideoRequirements {
    /// Full HD.
    fn default() -> Self {
        Self {
            max_width: 1920,
            max_height: 1080,
        }
    }
}

/// Video window geometry in screen coordinates.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rectangle {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// The only MIME type a web audio player accepts.
pub const WEB_AUDIO_MIME_TYPE: &str = "audio/x-raw";

/// Handle of a web audio player, allocated by the server on creation.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct WebAudioHandle(pub i32);

impl fmt::Display for WebAudioHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State reported by a web audio player.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WebAudioPlayerState {
    #[default]
    Unknown,
    Idle,
    Playing,
    Paused,
    EndOfStream,
    Failure,
}

/// Layout of the raw PCM written to a web audio player.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebAudioPcmConfig {
    pub rate: u32,
    pub channels: u32,
    /// Bits per sample.
    pub sample_size: u32,
    pub is_big_endian: bool,
    pub is_signed: bool,
    pub is_float: bool,
}

impl WebAudioPcmConfig {
    /// Size of one frame (one sample on every channel), never zero.
    pub fn bytes_per_frame(&self) -> u32 {
        (self.channels.saturating_mul(self.sample_size) / 8).max(1)
    }
}

impl Default for WebAudioPcmConfig {
    /// 48 kHz, stereo, signed 16-bit little endian.
    fn default() -> Self {
        Self {
            rate: 48_000,
            channels: 2,
            sample_size: 16,
            is_big_endian: false,
            is_signed: true,
            is_float: false,
        }
    }
}

/// Buffer sizing advertised by a web audio player.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebAudioDeviceInfo {
    pub preferred_frames: u32,
    pub maximum_frames: u32,
    pub support_deferred_play: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dolby_vision_is_a_video_source() {
        let source = MediaSource::VideoDolbyVision {
            video: VideoConfig {
                mime_type: "video/h265".to_string(),
                ..VideoConfig::default()
            },
            profile: 5,
        };
        assert_eq!(source.source_type(), MediaSourceType::Video);
        assert_eq!(source.mime_type(), "video/h265");
    }

    #[test]
    fn segment_json_is_tagged_and_flat() {
        let seg = MediaSegment::Audio {
            header: SegmentHeader {
                source_id: SourceId(1),
                timestamp_ns: 10,
                duration_ns: 5,
                data: vec![1, 2],
            },
            sample_rate: 48_000,
            channels: 2,
        };
        let json = serde_json::to_string(&seg).unwrap();
        assert!(json.contains("\"kind\":\"audio\""));
        assert!(json.contains("\"source_id\":1"));
        assert_eq!(seg.end_ns(), 15);
    }

    #[test]
    fn end_ns_saturates() {
        let seg = MediaSegment::Video {
            header: SegmentHeader {
                source_id: SourceId(2),
                timestamp_ns: i64::MAX,
                duration_ns: 1,
                data: Vec::new(),
            },
            width: 1,
            height: 1,
        };
        assert_eq!(seg.end_ns(), i64::MAX);
        assert_eq!(seg.source_type(), MediaSourceType::Video);
    }

    #[test]
    fn pcm_frame_size_follows_layout() {
        assert_eq!(WebAudioPcmConfig::default().bytes_per_frame(), 4);
        let mono_float = WebAudioPcmConfig {
            channels: 1,
            sample_size: 32,
            is_float: true,
            ..WebAudioPcmConfig::default()
        };
        assert_eq!(mono_float.bytes_per_frame(), 4);
        let broken = WebAudioPcmConfig {
            channels: 0,
            ..WebAudioPcmConfig::default()
        };
        assert_eq!(broken.bytes_per_frame(), 1);
    }
}
