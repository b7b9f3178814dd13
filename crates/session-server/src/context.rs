//! Mutable state of one playback session.
//!
//! The context sits behind a mutex but is only ever locked from the scheduler worker, so
//! the lock is never contended; it exists to share ownership with timer and engine paths
//! that re-enter through the scheduler.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use media_bridge_types::{MediaSource, MediaSourceType, PlaybackState, Rectangle, SessionId, SourceId};

use crate::engine::{Buffer, EngineFactory, MediaEngine, StreamCaps};
use crate::notifier::Notifier;
use crate::sink::TaskSink;

/// Frames requested from the client per need-data notification.
pub const NEED_DATA_FRAME_COUNT: u32 = 24;

/// End-of-stream bookkeeping for one stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EosState {
    #[default]
    None,
    /// Requested while buffers were still pending; sent once the queue drains.
    Pending,
    Sent,
}

/// Delivery phase of a stream, derived from its flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    DataRequested,
    BuffersPending,
    AwaitingMoreData,
    EndOfStreamPending,
    EndOfStreamSent,
}

/// Per-stream bookkeeping, one entry per attached source type.
#[derive(Debug)]
pub struct StreamState {
    pub source_id: SourceId,
    pub source: MediaSource,
    /// Buffers delivered by the client but not yet handed to the engine.
    pub pending: VecDeque<Buffer>,
    /// The engine wants more data.
    pub needs_data: bool,
    /// A need-data notification is in flight and unanswered.
    pub need_data_outstanding: bool,
    pub eos: EosState,
    /// Underflow already reported; cleared when data flows again.
    pub underflow: bool,
    pub data_pushed: bool,
    pub resend_armed: bool,
    pub caps: Option<StreamCaps>,
}

impl StreamState {
    pub fn new(source_id: SourceId, source: MediaSource) -> Self {
        Self {
            source_id,
            source,
            pending: VecDeque::new(),
            needs_data: false,
            need_data_outstanding: false,
            eos: EosState::None,
            underflow: false,
            data_pushed: false,
            resend_armed: false,
            caps: None,
        }
    }

    pub fn phase(&self) -> StreamPhase {
        match self.eos {
            EosState::Sent => StreamPhase::EndOfStreamSent,
            EosState::Pending => StreamPhase::EndOfStreamPending,
            EosState::None if !self.pending.is_empty() => StreamPhase::BuffersPending,
            EosState::None if self.need_data_outstanding => StreamPhase::AwaitingMoreData,
            EosState::None if self.needs_data => StreamPhase::DataRequested,
            EosState::None => StreamPhase::Idle,
        }
    }
}

/// Settings requested before the engine could take them.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PendingConfig {
    pub geometry: Option<Rectangle>,
    pub volume: Option<f64>,
    pub mute: Option<bool>,
    pub sync: Option<bool>,
    pub buffering_limit: Option<u32>,
    /// Applied on the next transition to playing.
    pub playback_rate: Option<f64>,
}

impl PendingConfig {
    pub fn is_empty(&self) -> bool {
        *self == PendingConfig::default()
    }
}

/// Timing knobs a session is created with.
#[derive(Clone, Copy, Debug)]
pub struct SessionTimings {
    pub need_data_resend: Duration,
    pub position_report: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            need_data_resend: Duration::from_millis(100),
            position_report: Duration::from_millis(250),
        }
    }
}

pub struct SessionContext {
    pub session_id: SessionId,
    pub factory: Arc<dyn EngineFactory>,
    pub engine: Option<Box<dyn MediaEngine>>,
    pub notifier: Arc<Notifier>,
    pub tasks: TaskSink,
    pub timings: SessionTimings,

    pub streams: BTreeMap<MediaSourceType, StreamState>,
    next_source_id: i32,
    /// Need-data request id → stream it was issued for.
    pub active_requests: HashMap<u32, MediaSourceType>,
    next_request_id: u32,

    pub playback_state: PlaybackState,
    pub playback_rate: f64,
    pub last_position_ns: i64,
    pub pending: PendingConfig,

    pub all_sources_attached: bool,
    pub underflow_enabled: bool,
    pub buffered_notified: bool,
    pub eos_notified: bool,
    pub position_reporting: bool,
}

impl SessionContext {
    pub fn new(
        session_id: SessionId,
        factory: Arc<dyn EngineFactory>,
        notifier: Arc<Notifier>,
        tasks: TaskSink,
        timings: SessionTimings,
    ) -> Self {
        Self {
            session_id,
            factory,
            engine: None,
            notifier,
            tasks,
            timings,
            streams: BTreeMap::new(),
            next_source_id: 1,
            active_requests: HashMap::new(),
            next_request_id: 1,
            playback_state: PlaybackState::Idle,
            playback_rate: 1.0,
            last_position_ns: 0,
            pending: PendingConfig::default(),
            all_sources_attached: false,
            underflow_enabled: false,
            buffered_notified: false,
            eos_notified: false,
            position_reporting: false,
        }
    }

    pub fn generate_source_id(&mut self) -> SourceId {
        let id = SourceId(self.next_source_id);
        self.next_source_id += 1;
        id
    }

    pub fn next_request_id(&mut self) -> u32 {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1).max(1);
        id
    }

    pub fn stream_by_id(&self, source_id: SourceId) -> Option<(MediaSourceType, &StreamState)> {
        self.streams
            .iter()
            .find(|(_, s)| s.source_id == source_id)
            .map(|(t, s)| (*t, s))
    }

    pub fn all_streams_eos_sent(&self) -> bool {
        !self.streams.is_empty() && self.streams.values().all(|s| s.eos == EosState::Sent)
    }

    /// Forget outstanding need-data requests for `source_type`.
    pub fn retire_requests(&mut self, source_type: MediaSourceType) {
        self.active_requests.retain(|_, t| *t != source_type);
    }
}

pub fn lock_context(context: &Mutex<SessionContext>) -> MutexGuard<'_, SessionContext> {
    context.lock().unwrap_or_else(|e| e.into_inner())
}
