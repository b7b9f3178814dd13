use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Sender, unbounded};
use media_bridge_types::{
    AudioConfig, MediaSource, MediaSourceStatus, MediaType, PlaybackState, SourceId,
    VideoRequirements, WEB_AUDIO_MIME_TYPE, WebAudioPcmConfig, WebAudioPlayerState,
};
use session_client::{
    ClientState, MediaPipeline, MediaPipelineClient, SocketTransport, WebAudioPlayer,
    WebAudioPlayerClient,
};
use session_runtime::SessionScheduler;
use session_server::simulated::SimulatedEngineFactory;
use session_server::{ServiceSettings, SessionService, ipc, runtime};

struct Recorder {
    states: Mutex<Vec<PlaybackState>>,
    need_data: Sender<u32>,
}

impl MediaPipelineClient for Recorder {
    fn notify_playback_state(&self, state: PlaybackState) {
        self.states.lock().unwrap().push(state);
    }

    fn notify_need_media_data(&self, _source_id: SourceId, _frame_count: u32, request_id: u32) {
        let _ = self.need_data.send(request_id);
    }
}

fn start_server(dir: &tempfile::TempDir) -> (Arc<SessionService>, std::path::PathBuf) {
    let path = dir.path().join("server.sock");
    let listener = runtime::bind(&path).unwrap();
    let scheduler = Arc::new(SessionScheduler::start("test-scheduler").unwrap());
    let service = Arc::new(SessionService::new(
        scheduler,
        Arc::new(SimulatedEngineFactory),
        ServiceSettings::default(),
    ));
    let serving = service.clone();
    thread::spawn(move || ipc::serve(listener, serving));
    (service, path)
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn plays_to_end_of_stream_over_the_socket() {
    let dir = tempfile::tempdir().unwrap();
    let (service, path) = start_server(&dir);

    let (tx, rx) = unbounded();
    let recorder = Arc::new(Recorder {
        states: Mutex::new(Vec::new()),
        need_data: tx,
    });
    let client: Arc<dyn MediaPipelineClient> = recorder.clone();
    let transport = Arc::new(SocketTransport::connect(&path).unwrap());
    let pipeline = MediaPipeline::new(transport, &client, VideoRequirements::default()).unwrap();
    assert_eq!(service.session_count(), 1);

    pipeline.load(MediaType::Mse, "audio/mp4", "mse://test").unwrap();
    pipeline
        .attach_source(MediaSource::Audio(AudioConfig {
            mime_type: "audio/mp4".to_string(),
            sample_rate: 48_000,
            channels: 2,
            codec_data: None,
        }))
        .unwrap();
    pipeline.all_sources_attached().unwrap();
    pipeline.play().unwrap();

    let request_id = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    pipeline
        .have_data(MediaSourceStatus::Eos, request_id, Vec::new())
        .unwrap();

    assert!(wait_until(|| pipeline.state() == ClientState::EndOfStream));
    pipeline.flush_events();
    let states = recorder.states.lock().unwrap().clone();
    assert!(states.contains(&PlaybackState::Playing));
    assert_eq!(states.last(), Some(&PlaybackState::EndOfStream));

    drop(pipeline);
    assert!(wait_until(|| service.session_count() == 0));
}

#[test]
fn load_with_unsupported_media_type_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let (_service, path) = start_server(&dir);

    let (tx, _rx) = unbounded();
    let client: Arc<dyn MediaPipelineClient> = Arc::new(Recorder {
        states: Mutex::new(Vec::new()),
        need_data: tx,
    });
    let transport = Arc::new(SocketTransport::connect(&path).unwrap());
    let pipeline = MediaPipeline::new(transport, &client, VideoRequirements::default()).unwrap();

    assert!(
        pipeline
            .load(MediaType::Unknown, "audio/mp4", "file:///a")
            .is_err()
    );
    assert_eq!(pipeline.state(), ClientState::Idle);
}

#[derive(Default)]
struct StateLog(Mutex<Vec<WebAudioPlayerState>>);

impl WebAudioPlayerClient for StateLog {
    fn notify_state(&self, state: WebAudioPlayerState) {
        self.0.lock().unwrap().push(state);
    }
}

#[test]
fn web_audio_plays_written_pcm_to_end_of_stream() {
    let dir = tempfile::tempdir().unwrap();
    let (service, path) = start_server(&dir);

    let log = Arc::new(StateLog::default());
    let client: Arc<dyn WebAudioPlayerClient> = log.clone();
    let transport = Arc::new(SocketTransport::connect(&path).unwrap());
    let player = WebAudioPlayer::new(
        transport,
        &client,
        WEB_AUDIO_MIME_TYPE,
        0,
        Some(WebAudioPcmConfig::default()),
    )
    .unwrap();
    assert_eq!(service.web_audio_player_count(), 1);

    // Paused: written frames stay queued.
    let available = player.get_buffer_available().unwrap();
    assert!(available >= 640);
    player.write_buffer(640, vec![0; 640 * 4]).unwrap();
    assert_eq!(player.get_buffer_delay().unwrap(), 640);
    assert!(player.write_buffer(1, vec![0; 4]).is_err());

    player.play().unwrap();
    player.set_eos().unwrap();
    assert!(wait_until(|| {
        player.flush_events();
        log.0
            .lock()
            .unwrap()
            .contains(&WebAudioPlayerState::EndOfStream)
    }));
    assert_eq!(player.get_buffer_delay().unwrap(), 0);

    drop(player);
    assert!(wait_until(|| service.web_audio_player_count() == 0));
}
