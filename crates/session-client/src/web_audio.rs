//! Application-facing web audio player: raw PCM pushed to the server with no demuxing.
//!
//! Like [`MediaPipeline`](crate::MediaPipeline), a [`WebAudioPlayer`] owns its server-side
//! player for its whole life and receives events through its own [`EventQueueWorker`]. Only
//! state changes for its own handle reach the [`WebAudioPlayerClient`].
//!
//! Writes follow the server's protocol: ask [`WebAudioPlayer::get_buffer_available`] first and
//! write at most that many frames.

use std::sync::{Arc, OnceLock, Weak};

use media_bridge_proto::{CallError, Event, EventHandler, Request, Response, TransportClient};
use media_bridge_types::{
    WebAudioDeviceInfo, WebAudioHandle, WebAudioPcmConfig, WebAudioPlayerState,
};
use session_runtime::EventQueueWorker;

use crate::channel::RemoteSessionChannel;
use crate::pipeline::PipelineError;

/// Callbacks delivered on the player's event thread.
pub trait WebAudioPlayerClient: Send + Sync {
    fn notify_state(&self, state: WebAudioPlayerState);
}

struct Shared {
    handle: OnceLock<WebAudioHandle>,
    client: Weak<dyn WebAudioPlayerClient>,
}

impl Shared {
    fn dispatch(&self, event: Event) {
        let Event::WebAudioStateChanged { handle, state } = event else {
            return;
        };
        if self.handle.get() != Some(&handle) {
            return;
        }
        if let Some(client) = self.client.upgrade() {
            client.notify_state(state);
        }
    }
}

pub struct WebAudioPlayer {
    handle: WebAudioHandle,
    channel: RemoteSessionChannel,
    events: Arc<EventQueueWorker>,
    // Keeps the dispatch target alive; the event handler only holds a weak reference.
    _shared: Arc<Shared>,
}

impl WebAudioPlayer {
    pub fn new(
        transport: Arc<dyn TransportClient>,
        client: &Arc<dyn WebAudioPlayerClient>,
        mime_type: &str,
        priority: u32,
        config: Option<WebAudioPcmConfig>,
    ) -> Result<Self, PipelineError> {
        let events = Arc::new(EventQueueWorker::start("web-audio-events")?);
        let shared = Arc::new(Shared {
            handle: OnceLock::new(),
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

        let handle = match channel.call(Request::CreateWebAudioPlayer {
            mime_type: mime_type.to_string(),
            priority,
            config,
        })? {
            Response::WebAudioPlayerCreated { handle } => handle,
            response => {
                return Err(CallError::UnexpectedResponse {
                    op: "create_web_audio_player",
                    response,
                }
                .into());
            }
        };
        let _ = shared.handle.set(handle);
        tracing::info!(handle = %handle, mime_type, "web audio player created");

        Ok(Self {
            handle,
            channel,
            events,
            _shared: shared,
        })
    }

    pub fn handle(&self) -> WebAudioHandle {
        self.handle
    }

    /// Wait until every event received so far has been handed to the client.
    pub fn flush_events(&self) {
        self.events.flush();
    }

    pub fn play(&self) -> Result<(), PipelineError> {
        self.channel.call_ack(Request::WebAudioPlay {
            handle: self.handle,
        })?;
        Ok(())
    }

    pub fn pause(&self) -> Result<(), PipelineError> {
        self.channel.call_ack(Request::WebAudioPause {
            handle: self.handle,
        })?;
        Ok(())
    }

    pub fn set_eos(&self) -> Result<(), PipelineError> {
        self.channel.call_ack(Request::WebAudioSetEos {
            handle: self.handle,
        })?;
        Ok(())
    }

    pub fn get_buffer_available(&self) -> Result<u32, PipelineError> {
        match self.channel.call(Request::WebAudioGetBufferAvailable {
            handle: self.handle,
        })? {
            Response::BufferAvailable { available_frames } => Ok(available_frames),
            response => Err(CallError::UnexpectedResponse {
                op: "web_audio_get_buffer_available",
                response,
            }
            .into()),
        }
    }

    pub fn get_buffer_delay(&self) -> Result<u32, PipelineError> {
        match self.channel.call(Request::WebAudioGetBufferDelay {
            handle: self.handle,
        })? {
            Response::BufferDelay { delay_frames } => Ok(delay_frames),
            response => Err(CallError::UnexpectedResponse {
                op: "web_audio_get_buffer_delay",
                response,
            }
            .into()),
        }
    }

    pub fn write_buffer(&self, frames: u32, data: Vec<u8>) -> Result<(), PipelineError> {
        self.channel.call_ack(Request::WebAudioWriteBuffer {
            handle: self.handle,
            frames,
            data,
        })?;
        Ok(())
    }

    pub fn get_device_info(&self) -> Result<WebAudioDeviceInfo, PipelineError> {
        match self.channel.call(Request::WebAudioGetDeviceInfo {
            handle: self.handle,
        })? {
            Response::DeviceInfo { info } => Ok(info),
            response => Err(CallError::UnexpectedResponse {
                op: "web_audio_get_device_info",
                response,
            }
            .into()),
        }
    }

    pub fn set_volume(&self, volume: f64) -> Result<(), PipelineError> {
        self.channel.call_ack(Request::WebAudioSetVolume {
            handle: self.handle,
            volume,
        })?;
        Ok(())
    }

    pub fn get_volume(&self) -> Result<f64, PipelineError> {
        match self.channel.call(Request::WebAudioGetVolume {
            handle: self.handle,
        })? {
            Response::Volume { volume } => Ok(volume),
            response => Err(CallError::UnexpectedResponse {
                op: "web_audio_get_volume",
                response,
            }
            .into()),
        }
    }
}

impl Drop for WebAudioPlayer {
    fn drop(&mut self) {
        match self.channel.call_ack(Request::DestroyWebAudioPlayer {
            handle: self.handle,
        }) {
            Ok(()) => tracing::info!(handle = %self.handle, "web audio player destroyed"),
            Err(e) => tracing::warn!(handle = %self.handle, "web audio player not destroyed: {e}"),
        }
        self.channel.detach_channel();
    }
}
