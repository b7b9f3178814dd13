//! Unix socket front end for [`SessionService`].
//!
//! One thread per connection reads `Call` frames and answers each with a `Reply` carrying the
//! same call id. Events of the sessions and web audio players a connection created are
//! written to the same socket as `Event` frames; a shared writer lock keeps frames whole.
//! Whatever a connection created is destroyed when it closes.

use std::collections::HashSet;
use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{Context, Result};
use media_bridge_proto::{
    CallEnvelope, FrameKind, ReplyEnvelope, Request, Response, decode_json, read_frame,
    read_prelude, write_json_frame, write_prelude,
};
use media_bridge_types::{SessionId, WebAudioHandle};

use crate::error::SessionError;
use crate::notifier::EventSink;
use crate::service::SessionService;

/// Accept connections until the listener fails.
pub fn serve(listener: UnixListener, service: Arc<SessionService>) -> Result<()> {
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("accept failed: {e}");
                continue;
            }
        };
        spawn_connection(stream, service.clone())?;
    }
    Ok(())
}

/// Handle one client connection on its own thread.
pub fn spawn_connection(stream: UnixStream, service: Arc<SessionService>) -> Result<()> {
    thread::Builder::new()
        .name("session-conn".to_string())
        .spawn(move || {
            if let Err(e) = run_connection(stream, &service) {
                tracing::warn!("connection ended: {e:#}");
            }
        })
        .context("spawn connection thread")?;
    Ok(())
}

fn run_connection(mut stream: UnixStream, service: &SessionService) -> Result<()> {
    write_prelude(&mut stream).context("write prelude")?;
    read_prelude(&mut stream).context("read prelude")?;
    tracing::info!("client connected");

    let writer = Arc::new(Mutex::new(
        stream.try_clone().context("try_clone stream for writer")?,
    ));
    let events: EventSink = {
        let writer = writer.clone();
        Arc::new(move |event| {
            let mut w = writer.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = write_json_frame(&mut *w, FrameKind::Event, &event) {
                tracing::debug!(kind = ?event.kind(), "event dropped: {e}");
            }
        })
    };

    let mut owned = Owned::default();
    let result = serve_calls(&mut stream, service, &writer, &events, &mut owned);

    for session_id in owned.sessions {
        if service.destroy_session(session_id).is_ok() {
            tracing::info!(session_id = %session_id, "session released on disconnect");
        }
    }
    for handle in owned.web_audio_players {
        if service.destroy_web_audio_player(handle).is_ok() {
            tracing::info!(handle = %handle, "web audio player released on disconnect");
        }
    }
    tracing::info!("client disconnected");
    result
}

/// What one connection has created and not yet destroyed.
#[derive(Default)]
struct Owned {
    sessions: HashSet<SessionId>,
    web_audio_players: HashSet<WebAudioHandle>,
}

impl Owned {
    /// `released` is what the request destroys on success.
    fn track(&mut self, released: Released, result: &Result<Response, SessionError>) {
        let Ok(response) = result else {
            return;
        };
        match (response, released) {
            (Response::SessionCreated { session_id }, _) => {
                self.sessions.insert(*session_id);
            }
            (Response::WebAudioPlayerCreated { handle }, _) => {
                self.web_audio_players.insert(*handle);
            }
            (_, Released::Session(session_id)) => {
                self.sessions.remove(&session_id);
            }
            (_, Released::WebAudioPlayer(handle)) => {
                self.web_audio_players.remove(&handle);
            }
            (_, Released::Nothing) => {}
        }
    }
}

enum Released {
    Nothing,
    Session(SessionId),
    WebAudioPlayer(WebAudioHandle),
}

impl Released {
    fn by(request: &Request) -> Self {
        match request {
            Request::DestroySession { session_id } => Released::Session(*session_id),
            Request::DestroyWebAudioPlayer { handle } => Released::WebAudioPlayer(*handle),
            _ => Released::Nothing,
        }
    }
}

fn serve_calls(
    stream: &mut UnixStream,
    service: &SessionService,
    writer: &Mutex<UnixStream>,
    events: &EventSink,
    owned: &mut Owned,
) -> Result<()> {
    loop {
        let (kind, payload) = match read_frame(&mut *stream) {
            Ok(frame) => frame,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e).context("read frame"),
        };
        if kind != FrameKind::Call {
            tracing::warn!(?kind, "unexpected frame from client; ignoring");
            continue;
        }
        let call: CallEnvelope = decode_json(&payload).context("decode call")?;
        let op = call.request.name();
        let released = Released::by(&call.request);

        let result = service.handle(call.request, events);
        owned.track(released, &result);

        let reply = ReplyEnvelope {
            call_id: call.call_id,
            result: result.map_err(|e| {
                tracing::warn!(op, "failed to {op} due to '{e}'");
                e.to_string()
            }),
        };
        let mut w = writer.lock().unwrap_or_else(|e| e.into_inner());
        write_json_frame(&mut *w, FrameKind::Reply, &reply).context("write reply")?;
    }
}
