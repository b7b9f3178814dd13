//! Registry of live playback sessions and web audio players, and request dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use media_bridge_proto::{Request, Response};
use media_bridge_types::{SessionId, VideoRequirements, WebAudioHandle, WebAudioPcmConfig};
use session_runtime::SessionScheduler;

use crate::context::SessionTimings;
use crate::engine::{EngineFactory, WebAudioEngineFactory};
use crate::error::SessionError;
use crate::notifier::EventSink;
use crate::player::PlaybackSession;
use crate::simulated::SimulatedWebAudioFactory;
use crate::web_audio::WebAudioSession;

#[derive(Clone, Copy, Debug)]
pub struct ServiceSettings {
    pub max_sessions: usize,
    pub timings: SessionTimings,
    pub max_web_audio_players: usize,
    /// PCM a web audio player may hold before writes are refused.
    pub web_audio_buffer_bytes: usize,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            max_sessions: 8,
            timings: SessionTimings::default(),
            max_web_audio_players: 4,
            web_audio_buffer_bytes: 64 * 1024,
        }
    }
}

pub struct SessionService {
    scheduler: Arc<SessionScheduler>,
    factory: Arc<dyn EngineFactory>,
    web_audio_factory: Arc<dyn WebAudioEngineFactory>,
    settings: ServiceSettings,
    sessions: Mutex<HashMap<SessionId, Arc<PlaybackSession>>>,
    next_session_id: AtomicI32,
    web_audio_players: Mutex<HashMap<WebAudioHandle, Arc<WebAudioSession>>>,
    next_web_audio_handle: AtomicI32,
}

impl SessionService {
    pub fn new(
        scheduler: Arc<SessionScheduler>,
        factory: Arc<dyn EngineFactory>,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            scheduler,
            factory,
            web_audio_factory: Arc::new(SimulatedWebAudioFactory),
            settings,
            sessions: Mutex::new(HashMap::new()),
            next_session_id: AtomicI32::new(1),
            web_audio_players: Mutex::new(HashMap::new()),
            next_web_audio_handle: AtomicI32::new(1),
        }
    }

    /// Replace the engine factory used for web audio players.
    pub fn with_web_audio(mut self, factory: Arc<dyn WebAudioEngineFactory>) -> Self {
        self.web_audio_factory = factory;
        self
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, Arc<PlaybackSession>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn session_count(&self) -> usize {
        self.sessions().len()
    }

    pub fn create_session(
        &self,
        requirements: VideoRequirements,
        events: EventSink,
    ) -> Result<SessionId, SessionError> {
        if self.session_count() >= self.settings.max_sessions {
            return Err(SessionError::TooManySessions(self.settings.max_sessions));
        }
        let session_id = SessionId(self.next_session_id.fetch_add(1, Ordering::Relaxed));
        let session = PlaybackSession::create(
            session_id,
            requirements,
            self.scheduler.clone(),
            self.factory.clone(),
            events,
            self.settings.timings,
        )?;
        let mut sessions = self.sessions();
        if sessions.len() >= self.settings.max_sessions {
            drop(sessions);
            return Err(SessionError::TooManySessions(self.settings.max_sessions));
        }
        sessions.insert(session_id, Arc::new(session));
        Ok(session_id)
    }

    pub fn destroy_session(&self, session_id: SessionId) -> Result<(), SessionError> {
        let session = self
            .sessions()
            .remove(&session_id)
            .ok_or(SessionError::UnknownSession(session_id))?;
        // Teardown waits on the scheduler; keep it outside the registry lock.
        drop(session);
        Ok(())
    }

    pub fn session(&self, session_id: SessionId) -> Result<Arc<PlaybackSession>, SessionError> {
        self.sessions()
            .get(&session_id)
            .cloned()
            .ok_or(SessionError::UnknownSession(session_id))
    }

    fn web_audio_players(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<WebAudioHandle, Arc<WebAudioSession>>> {
        self.web_audio_players
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn web_audio_player_count(&self) -> usize {
        self.web_audio_players().len()
    }

    pub fn create_web_audio_player(
        &self,
        mime_type: &str,
        priority: u32,
        config: Option<WebAudioPcmConfig>,
        events: EventSink,
    ) -> Result<WebAudioHandle, SessionError> {
        let max = self.settings.max_web_audio_players;
        if self.web_audio_player_count() >= max {
            return Err(SessionError::TooManyWebAudioPlayers(max));
        }
        let handle = WebAudioHandle(self.next_web_audio_handle.fetch_add(1, Ordering::Relaxed));
        let player = WebAudioSession::create(
            handle,
            mime_type,
            priority,
            config,
            self.scheduler.clone(),
            self.web_audio_factory.clone(),
            events,
            self.settings.web_audio_buffer_bytes,
        )?;
        let mut players = self.web_audio_players();
        if players.len() >= max {
            drop(players);
            return Err(SessionError::TooManyWebAudioPlayers(max));
        }
        players.insert(handle, Arc::new(player));
        Ok(handle)
    }

    pub fn destroy_web_audio_player(&self, handle: WebAudioHandle) -> Result<(), SessionError> {
        let player = self
            .web_audio_players()
            .remove(&handle)
            .ok_or(SessionError::UnknownWebAudioPlayer(handle))?;
        drop(player);
        Ok(())
    }

    pub fn web_audio_player(
        &self,
        handle: WebAudioHandle,
    ) -> Result<Arc<WebAudioSession>, SessionError> {
        self.web_audio_players()
            .get(&handle)
            .cloned()
            .ok_or(SessionError::UnknownWebAudioPlayer(handle))
    }

    /// Run one request. `events` receives the events of any session or player it creates.
    pub fn handle(&self, request: Request, events: &EventSink) -> Result<Response, SessionError> {
        let ack = |r: Result<(), SessionError>| r.map(|()| Response::Ack);
        match request {
            Request::CreateSession { requirements } => self
                .create_session(requirements, events.clone())
                .map(|session_id| Response::SessionCreated { session_id }),
            Request::DestroySession { session_id } => ack(self.destroy_session(session_id)),
            Request::Load {
                session_id,
                media_type,
                mime_type,
                url,
            } => ack(self.session(session_id)?.load(media_type, &mime_type, &url)),
            Request::AttachSource { session_id, source } => self
                .session(session_id)?
                .attach_source(source)
                .map(|source_id| Response::SourceAttached { source_id }),
            Request::RemoveSource {
                session_id,
                source_id,
            } => ack(self.session(session_id)?.remove_source(source_id)),
            Request::AllSourcesAttached { session_id } => {
                ack(self.session(session_id)?.all_sources_attached())
            }
            Request::Play { session_id } => ack(self.session(session_id)?.play()),
            Request::Pause { session_id } => ack(self.session(session_id)?.pause()),
            Request::Stop { session_id } => ack(self.session(session_id)?.stop()),
            Request::SetPlaybackRate { session_id, rate } => {
                ack(self.session(session_id)?.set_playback_rate(rate))
            }
            Request::SetPosition {
                session_id,
                position_ns,
            } => ack(self.session(session_id)?.set_position(position_ns)),
            Request::GetPosition { session_id } => self
                .session(session_id)?
                .get_position()
                .map(|position_ns| Response::Position { position_ns }),
            Request::SetVideoWindow { session_id, window } => {
                ack(self.session(session_id)?.set_video_window(window))
            }
            Request::HaveData {
                session_id,
                status,
                request_id,
                segments,
            } => ack(self.session(session_id)?.have_data(status, request_id, segments)),
            Request::SetVolume { session_id, volume } => {
                ack(self.session(session_id)?.set_volume(volume))
            }
            Request::GetVolume { session_id } => self
                .session(session_id)?
                .get_volume()
                .map(|volume| Response::Volume { volume }),
            Request::SetMute { session_id, mute } => ack(self.session(session_id)?.set_mute(mute)),
            Request::SetSync { session_id, sync } => ack(self.session(session_id)?.set_sync(sync)),
            Request::SetBufferingLimit {
                session_id,
                limit_ms,
            } => ack(self.session(session_id)?.set_buffering_limit(limit_ms)),
            Request::RenderFrame { session_id } => ack(self.session(session_id)?.render_frame()),
            Request::Flush {
                session_id,
                source_id,
                reset_time,
            } => ack(self.session(session_id)?.flush(source_id, reset_time)),

            Request::CreateWebAudioPlayer {
                mime_type,
                priority,
                config,
            } => self
                .create_web_audio_player(&mime_type, priority, config, events.clone())
                .map(|handle| Response::WebAudioPlayerCreated { handle }),
            Request::DestroyWebAudioPlayer { handle } => {
                ack(self.destroy_web_audio_player(handle))
            }
            Request::WebAudioPlay { handle } => {
                self.web_audio_player(handle)?.play();
                Ok(Response::Ack)
            }
            Request::WebAudioPause { handle } => {
                self.web_audio_player(handle)?.pause();
                Ok(Response::Ack)
            }
            Request::WebAudioSetEos { handle } => {
                self.web_audio_player(handle)?.set_eos();
                Ok(Response::Ack)
            }
            Request::WebAudioGetBufferAvailable { handle } => self
                .web_audio_player(handle)?
                .get_buffer_available()
                .map(|available_frames| Response::BufferAvailable { available_frames }),
            Request::WebAudioGetBufferDelay { handle } => self
                .web_audio_player(handle)?
                .get_buffer_delay()
                .map(|delay_frames| Response::BufferDelay { delay_frames }),
            Request::WebAudioWriteBuffer {
                handle,
                frames,
                data,
            } => ack(self.web_audio_player(handle)?.write_buffer(frames, data)),
            Request::WebAudioGetDeviceInfo { handle } => Ok(Response::DeviceInfo {
                info: self.web_audio_player(handle)?.get_device_info(),
            }),
            Request::WebAudioSetVolume { handle, volume } => {
                self.web_audio_player(handle)?.set_volume(volume);
                Ok(Response::Ack)
            }
            Request::WebAudioGetVolume { handle } => self
                .web_audio_player(handle)?
                .get_volume()
                .map(|volume| Response::Volume { volume }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::tests::recording_sink;
    use crate::tasks::testing::{EngineCall, EngineRecorder, FakeFactory};
    use media_bridge_types::{AudioConfig, MediaSource, MediaType, WEB_AUDIO_MIME_TYPE};

    fn service(max_sessions: usize) -> (SessionService, EngineRecorder) {
        let recorder = EngineRecorder::default();
        let scheduler = Arc::new(SessionScheduler::start("test-scheduler").unwrap());
        let service = SessionService::new(
            scheduler,
            Arc::new(FakeFactory {
                recorder: recorder.clone(),
            }),
            ServiceSettings {
                max_sessions,
                ..ServiceSettings::default()
            },
        );
        (service, recorder)
    }

    #[test]
    fn session_limit_is_enforced() {
        let (service, _) = service(2);
        let (sink, _) = recording_sink();
        let a = service.create_session(VideoRequirements::default(), sink.clone()).unwrap();
        service.create_session(VideoRequirements::default(), sink.clone()).unwrap();
        assert!(matches!(
            service.create_session(VideoRequirements::default(), sink.clone()),
            Err(SessionError::TooManySessions(2))
        ));

        service.destroy_session(a).unwrap();
        assert_eq!(service.session_count(), 1);
        service.create_session(VideoRequirements::default(), sink).unwrap();
    }

    #[test]
    fn unknown_session_is_reported() {
        let (service, _) = service(4);
        let (sink, _) = recording_sink();
        let err = service
            .handle(
                Request::Play {
                    session_id: SessionId(42),
                },
                &sink,
            )
            .unwrap_err();
        assert!(matches!(err, SessionError::UnknownSession(SessionId(42))));
        assert!(matches!(
            service.destroy_session(SessionId(42)),
            Err(SessionError::UnknownSession(_))
        ));
    }

    #[test]
    fn requests_are_dispatched_to_the_session() {
        let (service, recorder) = service(4);
        let (sink, _) = recording_sink();
        let Response::SessionCreated { session_id } = service
            .handle(
                Request::CreateSession {
                    requirements: VideoRequirements::default(),
                },
                &sink,
            )
            .unwrap()
        else {
            panic!("expected session id");
        };

        service
            .handle(
                Request::Load {
                    session_id,
                    media_type: MediaType::Mse,
                    mime_type: "video/mp4".to_string(),
                    url: "mse://a".to_string(),
                },
                &sink,
            )
            .unwrap();
        let attached = service
            .handle(
                Request::AttachSource {
                    session_id,
                    source: MediaSource::Audio(AudioConfig {
                        mime_type: "audio/mp4".to_string(),
                        sample_rate: 48_000,
                        channels: 2,
                        codec_data: None,
                    }),
                },
                &sink,
            )
            .unwrap();
        assert!(matches!(attached, Response::SourceAttached { .. }));

        assert_eq!(
            service
                .handle(Request::GetPosition { session_id }, &sink)
                .unwrap(),
            Response::Position { position_ns: 1_000 }
        );
        service
            .handle(Request::SetMute { session_id, mute: true }, &sink)
            .unwrap();
        assert!(recorder.calls().contains(&EngineCall::Mute(true)));

        service
            .handle(Request::DestroySession { session_id }, &sink)
            .unwrap();
        assert_eq!(service.session_count(), 0);
    }

    fn create_web_audio(
        service: &SessionService,
        sink: &EventSink,
    ) -> Result<WebAudioHandle, SessionError> {
        match service.handle(
            Request::CreateWebAudioPlayer {
                mime_type: WEB_AUDIO_MIME_TYPE.to_string(),
                priority: 1,
                config: Some(WebAudioPcmConfig::default()),
            },
            sink,
        )? {
            Response::WebAudioPlayerCreated { handle } => Ok(handle),
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn web_audio_players_have_their_own_registry() {
        let (service, _) = service(1);
        let (sink, _) = recording_sink();
        service.create_session(VideoRequirements::default(), sink.clone()).unwrap();

        let first = create_web_audio(&service, &sink).unwrap();
        let second = create_web_audio(&service, &sink).unwrap();
        assert_ne!(first, second);
        assert_eq!(service.session_count(), 1);
        assert_eq!(service.web_audio_player_count(), 2);

        service
            .handle(Request::DestroyWebAudioPlayer { handle: first }, &sink)
            .unwrap();
        assert!(matches!(
            service.handle(Request::WebAudioPlay { handle: first }, &sink),
            Err(SessionError::UnknownWebAudioPlayer(h)) if h == first
        ));
        assert_eq!(service.web_audio_player_count(), 1);
    }

    #[test]
    fn web_audio_player_limit_is_enforced() {
        let scheduler = Arc::new(SessionScheduler::start("test-scheduler").unwrap());
        let service = SessionService::new(
            scheduler,
            Arc::new(FakeFactory {
                recorder: EngineRecorder::default(),
            }),
            ServiceSettings {
                max_web_audio_players: 1,
                ..ServiceSettings::default()
            },
        );
        let (sink, _) = recording_sink();
        create_web_audio(&service, &sink).unwrap();
        assert!(matches!(
            create_web_audio(&service, &sink),
            Err(SessionError::TooManyWebAudioPlayers(1))
        ));
    }

    #[test]
    fn web_audio_write_round_trip_through_dispatch() {
        let (service, _) = service(1);
        let (sink, _) = recording_sink();
        let handle = create_web_audio(&service, &sink).unwrap();

        let Response::BufferAvailable { available_frames } = service
            .handle(Request::WebAudioGetBufferAvailable { handle }, &sink)
            .unwrap()
        else {
            panic!("expected available frames");
        };
        assert_eq!(available_frames, 16 * 1024);

        service
            .handle(
                Request::WebAudioWriteBuffer {
                    handle,
                    frames: 4,
                    data: vec![0; 16],
                },
                &sink,
            )
            .unwrap();
        assert_eq!(
            service
                .handle(Request::WebAudioGetBufferDelay { handle }, &sink)
                .unwrap(),
            Response::BufferDelay { delay_frames: 4 }
        );
        let Response::DeviceInfo { info } = service
            .handle(Request::WebAudioGetDeviceInfo { handle }, &sink)
            .unwrap()
        else {
            panic!("expected device info");
        };
        assert_eq!(info.maximum_frames, 16 * 1024);
    }
}
