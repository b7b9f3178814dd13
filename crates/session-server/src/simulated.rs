//! In-process engine used by the server binary and end-to-end tests.
//!
//! It has no decoder or renderer. It accepts buffers, tracks the position they reach, and
//! raises the callbacks a real pipeline would, from its own callback thread.
//!
//! [`SimulatedWebAudioEngine`] renders queued PCM instantly while playing, so a paused player
//! is the only one whose buffer fills up.

use std::collections::BTreeSet;

use media_bridge_types::{
    MediaSource, MediaSourceType, MediaType, Rectangle, WebAudioPcmConfig, WebAudioPlayerState,
};
use session_runtime::EventQueueWorker;

use crate::engine::{
    Buffer, EngineError, EngineFactory, EngineState, MediaEngine, StreamCaps, WebAudioEngine,
    WebAudioEngineFactory,
};
use crate::sink::{EngineEventSink, WebAudioEventSink};

pub struct SimulatedEngineFactory;

impl EngineFactory for SimulatedEngineFactory {
    fn create(
        &self,
        media_type: MediaType,
        mime_type: &str,
        url: &str,
        events: EngineEventSink,
    ) -> Result<Box<dyn MediaEngine>, EngineError> {
        if media_type != MediaType::Mse {
            return Err(EngineError::Rejected(format!(
                "unsupported media type {media_type:?}"
            )));
        }
        tracing::debug!(mime_type, url, "creating simulated engine");
        let engine = SimulatedEngine::new(events)
            .map_err(|e| EngineError::Rejected(format!("callback thread: {e}")))?;
        Ok(Box::new(engine))
    }
}

pub struct SimulatedEngine {
    events: EngineEventSink,
    callbacks: EventQueueWorker,
    state: EngineState,
    sources: BTreeSet<MediaSourceType>,
    ended: BTreeSet<MediaSourceType>,
    eos_reported: bool,
    position_ns: i64,
    volume: f64,
}

impl SimulatedEngine {
    pub fn new(events: EngineEventSink) -> std::io::Result<Self> {
        Ok(Self {
            events,
            callbacks: EventQueueWorker::start("simulated-engine")?,
            state: EngineState::Null,
            sources: BTreeSet::new(),
            ended: BTreeSet::new(),
            eos_reported: false,
            position_ns: 0,
            volume: 1.0,
        })
    }

    fn emit(&self, f: impl FnOnce(&EngineEventSink) + Send + 'static) {
        let sink = self.events.clone();
        self.callbacks.add(move || f(&sink));
    }

    fn check_all_ended(&mut self) {
        if !self.eos_reported && !self.sources.is_empty() && self.ended == self.sources {
            self.eos_reported = true;
            self.emit(|s| s.end_of_stream());
        }
    }
}

impl MediaEngine for SimulatedEngine {
    fn attach_source(&mut self, source: &MediaSource) -> Result<(), EngineError> {
        self.sources.insert(source.source_type());
        Ok(())
    }

    fn remove_source(&mut self, source_type: MediaSourceType) -> Result<(), EngineError> {
        self.sources.remove(&source_type);
        self.ended.remove(&source_type);
        Ok(())
    }

    fn all_sources_attached(&mut self) -> Result<(), EngineError> {
        for source_type in self.sources.iter().copied() {
            self.emit(move |s| s.need_data(source_type));
        }
        Ok(())
    }

    fn set_state(&mut self, state: EngineState) -> Result<(), EngineError> {
        self.state = state;
        self.emit(move |s| s.state_changed(state));
        Ok(())
    }

    fn seek(&mut self, position_ns: i64, rate: f64) -> Result<(), EngineError> {
        if position_ns < 0 {
            return Err(EngineError::Rejected(format!(
                "negative seek position {position_ns}"
            )));
        }
        tracing::debug!(position_ns, rate, "seek");
        self.position_ns = position_ns;
        self.ended.clear();
        self.eos_reported = false;
        for source_type in self.sources.iter().copied() {
            self.emit(move |s| s.need_data(source_type));
        }
        Ok(())
    }

    fn set_playback_rate(&mut self, rate: f64) -> Result<(), EngineError> {
        tracing::debug!(rate, "playback rate");
        Ok(())
    }

    fn position(&self) -> Option<i64> {
        (self.state != EngineState::Null).then_some(self.position_ns)
    }

    fn update_caps(&mut self, source_type: MediaSourceType, caps: StreamCaps) -> Result<(), EngineError> {
        tracing::debug!(source_type = %source_type, ?caps, "caps updated");
        Ok(())
    }

    fn push_buffers(&mut self, source_type: MediaSourceType, buffers: &[Buffer]) -> Result<(), EngineError> {
        if !self.sources.contains(&source_type) {
            return Err(EngineError::Rejected(format!("no {source_type} source")));
        }
        if let Some(end) = buffers
            .iter()
            .map(|b| b.timestamp_ns.saturating_add(b.duration_ns))
            .max()
        {
            self.position_ns = self.position_ns.max(end);
        }
        Ok(())
    }

    fn end_of_stream(&mut self, source_type: MediaSourceType) -> Result<(), EngineError> {
        self.ended.insert(source_type);
        self.check_all_ended();
        Ok(())
    }

    fn flush(&mut self, source_type: MediaSourceType, reset_time: bool) -> Result<(), EngineError> {
        self.ended.remove(&source_type);
        self.eos_reported = false;
        if reset_time {
            self.position_ns = 0;
        }
        Ok(())
    }

    fn set_video_geometry(&mut self, window: Rectangle) -> Result<(), EngineError> {
        tracing::debug!(?window, "video geometry");
        Ok(())
    }

    fn set_volume(&mut self, volume: f64) -> Result<(), EngineError> {
        self.volume = volume;
        Ok(())
    }

    fn volume(&self) -> Result<f64, EngineError> {
        Ok(self.volume)
    }

    fn set_mute(&mut self, mute: bool) -> Result<(), EngineError> {
        tracing::debug!(mute, "mute");
        Ok(())
    }

    fn set_sync(&mut self, sync: bool) -> Result<(), EngineError> {
        tracing::debug!(sync, "sync");
        Ok(())
    }

    fn set_buffering_limit(&mut self, limit_ms: u32) -> Result<(), EngineError> {
        tracing::debug!(limit_ms, "buffering limit");
        Ok(())
    }

    fn render_frame(&mut self) -> Result<(), EngineError> {
        if self.state != EngineState::Paused {
            return Err(EngineError::Rejected(
                "render_frame needs a paused pipeline".to_string(),
            ));
        }
        Ok(())
    }
}

pub struct SimulatedWebAudioFactory;

impl WebAudioEngineFactory for SimulatedWebAudioFactory {
    fn create(
        &self,
        config: &WebAudioPcmConfig,
        events: WebAudioEventSink,
    ) -> Result<Box<dyn WebAudioEngine>, EngineError> {
        tracing::debug!(
            rate = config.rate,
            channels = config.channels,
            sample_size = config.sample_size,
            "creating simulated web audio engine"
        );
        let engine = SimulatedWebAudioEngine::new(events)
            .map_err(|e| EngineError::Rejected(format!("callback thread: {e}")))?;
        Ok(Box::new(engine))
    }
}

pub struct SimulatedWebAudioEngine {
    events: WebAudioEventSink,
    callbacks: EventQueueWorker,
    playing: bool,
    eos_pending: bool,
    queued: usize,
    rendered: usize,
    volume: f64,
}

impl SimulatedWebAudioEngine {
    pub fn new(events: WebAudioEventSink) -> std::io::Result<Self> {
        let engine = Self {
            events,
            callbacks: EventQueueWorker::start("simulated-web-audio")?,
            playing: false,
            eos_pending: false,
            queued: 0,
            rendered: 0,
            volume: 1.0,
        };
        engine.emit(WebAudioPlayerState::Idle);
        Ok(engine)
    }

    fn emit(&self, state: WebAudioPlayerState) {
        let sink = self.events.clone();
        self.callbacks.add(move || sink.state_changed(state));
    }

    fn render(&mut self) {
        if !self.playing {
            return;
        }
        self.rendered += std::mem::take(&mut self.queued);
        if std::mem::take(&mut self.eos_pending) {
            self.emit(WebAudioPlayerState::EndOfStream);
        }
    }
}

impl WebAudioEngine for SimulatedWebAudioEngine {
    fn play(&mut self) -> Result<(), EngineError> {
        if !self.playing {
            self.playing = true;
            self.emit(WebAudioPlayerState::Playing);
        }
        self.render();
        Ok(())
    }

    fn pause(&mut self) -> Result<(), EngineError> {
        if self.playing {
            self.playing = false;
            self.emit(WebAudioPlayerState::Paused);
        }
        Ok(())
    }

    fn set_eos(&mut self) -> Result<(), EngineError> {
        self.eos_pending = true;
        self.render();
        Ok(())
    }

    fn write_buffer(&mut self, data: &[u8]) -> Result<usize, EngineError> {
        self.eos_pending = false;
        self.queued += data.len();
        self.render();
        Ok(data.len())
    }

    fn queued_bytes(&self) -> usize {
        self.queued
    }

    fn set_volume(&mut self, volume: f64) -> Result<(), EngineError> {
        if !(0.0..=1.0).contains(&volume) {
            return Err(EngineError::Rejected(format!("volume {volume} out of range")));
        }
        self.volume = volume;
        Ok(())
    }

    fn volume(&self) -> Result<f64, EngineError> {
        Ok(self.volume)
    }
}
