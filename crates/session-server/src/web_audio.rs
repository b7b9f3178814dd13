//! Server-side facade for one web audio player: raw PCM written by the client straight into
//! a [`WebAudioEngine`].
//!
//! The player shares the scheduler with playback sessions. Commands that only start something
//! (play, pause, end of stream, volume) are queued without waiting. Queries and writes wait
//! for the worker, so their answer reflects every command queued before them.
//!
//! A write must be preceded by [`WebAudioSession::get_buffer_available`]; the free space it
//! reports is what the write is checked against.

use std::sync::{Arc, Mutex, MutexGuard};

use media_bridge_types::{
    WEB_AUDIO_MIME_TYPE, WebAudioDeviceInfo, WebAudioHandle, WebAudioPcmConfig,
};
use session_runtime::{ClientId, SessionScheduler};

use crate::engine::{EngineError, WebAudioEngine, WebAudioEngineFactory};
use crate::error::SessionError;
use crate::notifier::{EventSink, WebAudioNotifier};
use crate::sink::WebAudioEventSink;

/// Frames per write a client should aim for.
pub const PREFERRED_FRAMES: u32 = 640;

struct WebAudioContext {
    /// `None` once the player is torn down.
    engine: Option<Box<dyn WebAudioEngine>>,
    bytes_per_frame: usize,
    capacity_bytes: usize,
    expect_write_buffer: bool,
}

impl WebAudioContext {
    fn engine(&mut self) -> Result<&mut (dyn WebAudioEngine + 'static), SessionError> {
        self.engine.as_deref_mut().ok_or(SessionError::NotLoaded)
    }

    fn free_bytes(&mut self) -> Result<usize, SessionError> {
        let capacity = self.capacity_bytes;
        Ok(capacity.saturating_sub(self.engine()?.queued_bytes()))
    }
}

fn lock(context: &Mutex<WebAudioContext>) -> MutexGuard<'_, WebAudioContext> {
    context.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct WebAudioSession {
    handle: WebAudioHandle,
    client: ClientId,
    scheduler: Arc<SessionScheduler>,
    notifier: Arc<WebAudioNotifier>,
    device_info: WebAudioDeviceInfo,
    context: Arc<Mutex<WebAudioContext>>,
}

impl WebAudioSession {
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        handle: WebAudioHandle,
        mime_type: &str,
        priority: u32,
        config: Option<WebAudioPcmConfig>,
        scheduler: Arc<SessionScheduler>,
        factory: Arc<dyn WebAudioEngineFactory>,
        events: EventSink,
        capacity_bytes: usize,
    ) -> Result<Self, SessionError> {
        if mime_type != WEB_AUDIO_MIME_TYPE {
            return Err(SessionError::UnsupportedMimeType(mime_type.to_string()));
        }
        let config = config.ok_or(SessionError::MissingPcmConfig)?;
        let bytes_per_frame = config.bytes_per_frame() as usize;

        let notifier = Arc::new(WebAudioNotifier::new(handle, events)?);
        let client = scheduler.register_client();
        let sink = WebAudioEventSink::new(&scheduler, client, &notifier);
        let created = scheduler
            .call(client, move || factory.create(&config, sink))
            .map_err(SessionError::from)
            .and_then(|r| r.map_err(SessionError::from));
        let engine = match created {
            Ok(engine) => engine,
            Err(e) => {
                scheduler.unregister_client(client);
                return Err(e);
            }
        };

        let device_info = WebAudioDeviceInfo {
            preferred_frames: PREFERRED_FRAMES,
            maximum_frames: u32::try_from(capacity_bytes / bytes_per_frame).unwrap_or(u32::MAX),
            support_deferred_play: true,
        };
        tracing::info!(
            handle = %handle,
            client_id = %client,
            priority,
            rate = config.rate,
            channels = config.channels,
            "web audio player created"
        );
        Ok(Self {
            handle,
            client,
            scheduler,
            notifier,
            device_info,
            context: Arc::new(Mutex::new(WebAudioContext {
                engine: Some(engine),
                bytes_per_frame,
                capacity_bytes,
                expect_write_buffer: false,
            })),
        })
    }

    pub fn handle(&self) -> WebAudioHandle {
        self.handle
    }

    fn enqueue(
        &self,
        op: &'static str,
        f: impl FnOnce(&mut dyn WebAudioEngine) -> Result<(), EngineError> + Send + 'static,
    ) {
        let context = self.context.clone();
        let handle = self.handle;
        self.scheduler.enqueue_task(self.client, move || {
            let mut ctx = lock(&context);
            let Some(engine) = ctx.engine.as_deref_mut() else {
                return;
            };
            if let Err(e) = f(engine) {
                tracing::warn!(handle = %handle, op, "web audio command failed: {e}");
            }
        });
    }

    fn run<T: Send + 'static>(
        &self,
        op: impl FnOnce(&mut WebAudioContext) -> Result<T, SessionError> + Send + 'static,
    ) -> Result<T, SessionError> {
        let context = self.context.clone();
        self.scheduler.call(self.client, move || op(&mut lock(&context)))?
    }

    pub fn play(&self) {
        self.enqueue("play", |engine| engine.play());
    }

    pub fn pause(&self) {
        self.enqueue("pause", |engine| engine.pause());
    }

    pub fn set_eos(&self) {
        self.enqueue("set_eos", |engine| engine.set_eos());
    }

    pub fn set_volume(&self, volume: f64) {
        self.enqueue("set_volume", move |engine| engine.set_volume(volume));
    }

    pub fn get_volume(&self) -> Result<f64, SessionError> {
        self.run(|ctx| Ok(ctx.engine()?.volume()?))
    }

    /// Frames that fit right now. Allows exactly one following `write_buffer`.
    pub fn get_buffer_available(&self) -> Result<u32, SessionError> {
        self.run(|ctx| {
            let free = ctx.free_bytes()?;
            ctx.expect_write_buffer = true;
            Ok(u32::try_from(free / ctx.bytes_per_frame).unwrap_or(u32::MAX))
        })
    }

    /// Frames written but not yet rendered.
    pub fn get_buffer_delay(&self) -> Result<u32, SessionError> {
        self.run(|ctx| {
            let queued = ctx.engine()?.queued_bytes();
            Ok(u32::try_from(queued / ctx.bytes_per_frame).unwrap_or(u32::MAX))
        })
    }

    pub fn write_buffer(&self, frames: u32, data: Vec<u8>) -> Result<(), SessionError> {
        self.run(move |ctx| {
            if !std::mem::take(&mut ctx.expect_write_buffer) {
                return Err(SessionError::WriteWithoutAvailability);
            }
            if frames == 0 {
                return Ok(());
            }
            let bytes_per_frame = ctx.bytes_per_frame;
            let expected = frames as usize * bytes_per_frame;
            if data.len() != expected {
                return Err(SessionError::FrameCountMismatch {
                    frames,
                    bytes: data.len(),
                });
            }
            let free = ctx.free_bytes()?;
            if expected > free {
                return Err(SessionError::WebAudioBufferFull {
                    requested: frames,
                    available: u32::try_from(free / bytes_per_frame).unwrap_or(u32::MAX),
                });
            }
            let written = ctx.engine()?.write_buffer(&data)?;
            if written != expected {
                return Err(SessionError::IncompleteWrite { written, expected });
            }
            Ok(())
        })
    }

    pub fn get_device_info(&self) -> WebAudioDeviceInfo {
        self.device_info
    }

    /// Wait until every state change published so far has reached the sink.
    pub fn flush_events(&self) {
        self.notifier.flush();
    }
}

impl Drop for WebAudioSession {
    fn drop(&mut self) {
        let context = self.context.clone();
        let teardown = self.scheduler.enqueue_task_and_wait(self.client, move || {
            lock(&context).engine.take();
        });
        if let Err(e) = teardown {
            tracing::warn!(handle = %self.handle, "web audio teardown failed: {e}");
        }
        self.scheduler.unregister_client(self.client);
        tracing::info!(handle = %self.handle, "web audio player destroyed");
    }
}
