//! Per-session event publisher.
//!
//! Notifications are built on the scheduler worker and handed to an [`EventQueueWorker`], so
//! the worker never blocks on a slow client connection and events leave in the order they
//! were raised.

use std::sync::Arc;

use media_bridge_proto::Event;
use media_bridge_types::{
    NetworkState, PlaybackState, QosInfo, SessionId, SourceId, WebAudioHandle, WebAudioPlayerState,
};
use session_runtime::EventQueueWorker;

/// Destination of a session's events, usually the owning connection's writer.
pub type EventSink = Arc<dyn Fn(Event) + Send + Sync>;

pub struct Notifier {
    session_id: SessionId,
    worker: EventQueueWorker,
    sink: EventSink,
}

impl Notifier {
    pub fn new(session_id: SessionId, sink: EventSink) -> std::io::Result<Self> {
        let worker = EventQueueWorker::start(format!("session-{session_id}-events"))?;
        Ok(Self {
            session_id,
            worker,
            sink,
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn playback_state(&self, state: PlaybackState) {
        self.publish(Event::PlaybackStateChanged {
            session_id: self.session_id,
            state,
        });
    }

    pub fn network_state(&self, state: NetworkState) {
        self.publish(Event::NetworkStateChanged {
            session_id: self.session_id,
            state,
        });
    }

    pub fn position(&self, position_ns: i64) {
        self.publish(Event::PositionChanged {
            session_id: self.session_id,
            position_ns,
        });
    }

    pub fn need_media_data(&self, source_id: SourceId, frame_count: u32, request_id: u32) {
        self.publish(Event::NeedMediaData {
            session_id: self.session_id,
            source_id,
            frame_count,
            request_id,
        });
    }

    pub fn qos(&self, source_id: SourceId, info: QosInfo) {
        self.publish(Event::Qos {
            session_id: self.session_id,
            source_id,
            info,
        });
    }

    pub fn buffer_underflow(&self, source_id: SourceId) {
        self.publish(Event::BufferUnderflow {
            session_id: self.session_id,
            source_id,
        });
    }

    pub fn playback_error(&self, source_id: SourceId, message: impl Into<String>) {
        self.publish(Event::PlaybackError {
            session_id: self.session_id,
            source_id,
            message: message.into(),
        });
    }

    pub fn source_flushed(&self, source_id: SourceId) {
        self.publish(Event::SourceFlushed {
            session_id: self.session_id,
            source_id,
        });
    }

    /// Wait until every event raised so far has reached the sink.
    pub fn flush(&self) {
        self.worker.flush();
    }

    fn publish(&self, event: Event) {
        tracing::trace!(session_id = %self.session_id, kind = ?event.kind(), "queue event");
        let sink = self.sink.clone();
        self.worker.add(move || sink(event));
    }
}

/// Event publisher of one web audio player.
pub struct WebAudioNotifier {
    handle: WebAudioHandle,
    worker: EventQueueWorker,
    sink: EventSink,
}

impl WebAudioNotifier {
    pub fn new(handle: WebAudioHandle, sink: EventSink) -> std::io::Result<Self> {
        let worker = EventQueueWorker::start(format!("web-audio-{handle}-events"))?;
        Ok(Self {
            handle,
            worker,
            sink,
        })
    }

    pub fn state(&self, state: WebAudioPlayerState) {
        tracing::trace!(handle = %self.handle, ?state, "queue web audio state");
        let event = Event::WebAudioStateChanged {
            handle: self.handle,
            state,
        };
        let sink = self.sink.clone();
        self.worker.add(move || sink(event));
    }

    pub fn flush(&self) {
        self.worker.flush();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Sink that records events for assertions.
    pub(crate) fn recording_sink() -> (EventSink, Arc<Mutex<Vec<Event>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink: EventSink = {
            let events = events.clone();
            Arc::new(move |ev| events.lock().unwrap().push(ev))
        };
        (sink, events)
    }

    #[test]
    fn events_reach_sink_in_order() {
        let (sink, events) = recording_sink();
        let notifier = Notifier::new(SessionId(4), sink).unwrap();
        notifier.playback_state(PlaybackState::Seeking);
        notifier.network_state(NetworkState::Buffered);
        notifier.buffer_underflow(SourceId(1));
        notifier.flush();

        let events = events.lock().unwrap();
        assert_eq!(
            *events,
            vec![
                Event::PlaybackStateChanged {
                    session_id: SessionId(4),
                    state: PlaybackState::Seeking
                },
                Event::NetworkStateChanged {
                    session_id: SessionId(4),
                    state: NetworkState::Buffered
                },
                Event::BufferUnderflow {
                    session_id: SessionId(4),
                    source_id: SourceId(1)
                },
            ]
        );
    }

    #[test]
    fn web_audio_states_carry_the_handle() {
        let (sink, events) = recording_sink();
        let notifier = WebAudioNotifier::new(WebAudioHandle(7), sink).unwrap();
        notifier.state(WebAudioPlayerState::Playing);
        notifier.state(WebAudioPlayerState::EndOfStream);
        notifier.flush();

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                Event::WebAudioStateChanged {
                    handle: WebAudioHandle(7),
                    state: WebAudioPlayerState::Playing
                },
                Event::WebAudioStateChanged {
                    handle: WebAudioHandle(7),
                    state: WebAudioPlayerState::EndOfStream
                },
            ]
        );
    }
}
