//! Unix socket implementation of the channel contracts.
//!
//! A [`SocketChannel`] owns one connection. Calls are written under a writer lock and wait on
//! a one-shot reply channel keyed by call id; a reader thread routes `Reply` frames to those
//! waiters and `Event` frames to the local subscription handlers.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Sender, bounded};
use media_bridge_proto::{
    CallEnvelope, CallError, Event, EventHandler, EventKind, FrameKind, RemoteChannel,
    ReplyEnvelope, Request, Response, SubscriptionTag, TransportClient, decode_json, read_frame,
    read_prelude, write_json_frame, write_prelude,
};

type ReplyTx = Sender<Result<Response, String>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// State shared between callers and the reader thread.
struct Shared {
    connected: AtomicBool,
    pending: Mutex<HashMap<u64, ReplyTx>>,
    handlers: Mutex<BTreeMap<SubscriptionTag, (EventKind, EventHandler)>>,
}

impl Shared {
    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
        // Dropping the senders fails every waiting call.
        lock(&self.pending).clear();
    }
}

pub struct SocketChannel {
    stream: UnixStream,
    writer: Mutex<UnixStream>,
    shared: Arc<Shared>,
    next_call_id: AtomicU64,
    next_tag: AtomicU64,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SocketChannel {
    pub fn connect(path: &Path) -> io::Result<Arc<Self>> {
        let mut stream = UnixStream::connect(path)?;
        write_prelude(&mut stream)?;
        read_prelude(&mut stream)?;

        let shared = Arc::new(Shared {
            connected: AtomicBool::new(true),
            pending: Mutex::new(HashMap::new()),
            handlers: Mutex::new(BTreeMap::new()),
        });
        let reader_stream = stream.try_clone()?;
        let reader = thread::Builder::new()
            .name("session-client-reader".to_string())
            .spawn({
                let shared = shared.clone();
                move || {
                    if let Err(e) = reader_thread_main(reader_stream, &shared) {
                        tracing::warn!("connection reader ended: {e}");
                    }
                    shared.mark_disconnected();
                }
            })?;

        Ok(Arc::new(Self {
            writer: Mutex::new(stream.try_clone()?),
            stream,
            shared,
            next_call_id: AtomicU64::new(1),
            next_tag: AtomicU64::new(1),
            reader: Mutex::new(Some(reader)),
        }))
    }

    fn await_reply(
        &self,
        call_id: u64,
        op: &'static str,
        send: impl FnOnce() -> io::Result<()>,
    ) -> Result<Response, CallError> {
        let (tx, rx) = bounded(1);
        lock(&self.shared.pending).insert(call_id, tx);
        // The reader flips the flag before clearing the table, so a call registered after
        // the clear is caught here.
        if !self.is_connected() {
            lock(&self.shared.pending).remove(&call_id);
            return Err(CallError::Disconnected);
        }
        if let Err(e) = send() {
            lock(&self.shared.pending).remove(&call_id);
            tracing::debug!(op, "write failed: {e}");
            return Err(CallError::Io(e));
        }
        match rx.recv() {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(text)) => Err(CallError::Remote(text)),
            Err(_) => Err(CallError::Disconnected),
        }
    }
}

impl RemoteChannel for SocketChannel {
    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn call(&self, request: Request) -> Result<Response, CallError> {
        if !self.is_connected() {
            return Err(CallError::Disconnected);
        }
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let op = request.name();
        let envelope = CallEnvelope { call_id, request };
        self.await_reply(call_id, op, || {
            let mut w = lock(&self.writer);
            write_json_frame(&mut *w, FrameKind::Call, &envelope)
        })
    }

    fn subscribe(&self, kind: EventKind, handler: EventHandler) -> Result<SubscriptionTag, CallError> {
        if !self.is_connected() {
            return Err(CallError::Disconnected);
        }
        let tag = SubscriptionTag(self.next_tag.fetch_add(1, Ordering::Relaxed));
        lock(&self.shared.handlers).insert(tag, (kind, handler));
        Ok(tag)
    }

    fn unsubscribe(&self, tag: SubscriptionTag) -> bool {
        lock(&self.shared.handlers).remove(&tag).is_some()
    }
}

impl Drop for SocketChannel {
    fn drop(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(handle) = lock(&self.reader).take()
            && handle.thread().id() != thread::current().id()
        {
            let _ = handle.join();
        }
    }
}

fn reader_thread_main(mut stream: UnixStream, shared: &Shared) -> io::Result<()> {
    loop {
        let (kind, payload) = match read_frame(&mut stream) {
            Ok(frame) => frame,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        match kind {
            FrameKind::Reply => {
                let reply: ReplyEnvelope = decode_json(&payload)?;
                match lock(&shared.pending).remove(&reply.call_id) {
                    Some(tx) => {
                        let _ = tx.send(reply.result);
                    }
                    None => tracing::debug!(call_id = reply.call_id, "reply for unknown call"),
                }
            }
            FrameKind::Event => {
                let event: Event = decode_json(&payload)?;
                let kind = event.kind();
                let handlers: Vec<EventHandler> = lock(&shared.handlers)
                    .values()
                    .filter(|(k, _)| *k == kind)
                    .map(|(_, h)| h.clone())
                    .collect();
                for handler in handlers {
                    handler(event.clone());
                }
            }
            other => tracing::warn!(kind = ?other, "unexpected frame from server; ignoring"),
        }
    }
}

/// Owns the current [`SocketChannel`] and replaces it on demand.
pub struct SocketTransport {
    path: PathBuf,
    current: Mutex<Option<Arc<SocketChannel>>>,
}

impl SocketTransport {
    /// Connect to the server listening on `path`.
    pub fn connect(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let channel = SocketChannel::connect(&path)?;
        tracing::info!(socket = ?path, "connected");
        Ok(Self {
            path,
            current: Mutex::new(Some(channel)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TransportClient for SocketTransport {
    fn channel(&self) -> Option<Arc<dyn RemoteChannel>> {
        lock(&self.current)
            .clone()
            .map(|c| c as Arc<dyn RemoteChannel>)
    }

    fn reconnect(&self) -> bool {
        let old = lock(&self.current).take();
        drop(old);
        match SocketChannel::connect(&self.path) {
            Ok(channel) => {
                *lock(&self.current) = Some(channel);
                tracing::info!(socket = ?self.path, "reconnected");
                true
            }
            Err(e) => {
                tracing::warn!(socket = ?self.path, "reconnect failed: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use media_bridge_types::{SessionId, VideoRequirements};
    use std::os::unix::net::UnixListener;
    use std::time::Duration;

    /// Minimal peer: answers every call with `Ack` after pushing one event.
    fn spawn_peer(listener: UnixListener) -> JoinHandle<()> {
        thread::spawn(move || {
            let (mut s, _) = listener.accept().unwrap();
            write_prelude(&mut s).unwrap();
            read_prelude(&mut s).unwrap();
            while let Ok((kind, payload)) = read_frame(&mut s) {
                assert_eq!(kind, FrameKind::Call);
                let call: CallEnvelope = decode_json(&payload).unwrap();
                let event = Event::PositionChanged {
                    session_id: SessionId(1),
                    position_ns: call.call_id as i64,
                };
                write_json_frame(&mut s, FrameKind::Event, &event).unwrap();
                let reply = ReplyEnvelope {
                    call_id: call.call_id,
                    result: match call.request {
                        Request::GetVolume { .. } => Err("volume unavailable".to_string()),
                        _ => Ok(Response::Ack),
                    },
                };
                write_json_frame(&mut s, FrameKind::Reply, &reply).unwrap();
            }
        })
    }

    #[test]
    fn calls_get_replies_and_events_reach_handlers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peer.sock");
        let peer = spawn_peer(UnixListener::bind(&path).unwrap());

        let channel = SocketChannel::connect(&path).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        let tag = channel
            .subscribe(
                EventKind::Position,
                Arc::new(move |e| {
                    let _ = tx.send(e);
                }),
            )
            .unwrap();

        let reply = channel
            .call(Request::CreateSession {
                requirements: VideoRequirements::default(),
            })
            .unwrap();
        assert_eq!(reply, Response::Ack);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            Event::PositionChanged {
                session_id: SessionId(1),
                position_ns: 1
            }
        );

        let err = channel
            .call(Request::GetVolume {
                session_id: SessionId(1),
            })
            .unwrap_err();
        assert!(matches!(err, CallError::Remote(ref t) if t == "volume unavailable"));

        assert!(channel.unsubscribe(tag));
        assert!(!channel.unsubscribe(tag));

        drop(channel);
        peer.join().unwrap();
    }

    #[test]
    fn peer_hangup_disconnects_channel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peer.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let peer = thread::spawn(move || {
            let (mut s, _) = listener.accept().unwrap();
            write_prelude(&mut s).unwrap();
            read_prelude(&mut s).unwrap();
        });

        let channel = SocketChannel::connect(&path).unwrap();
        peer.join().unwrap();
        for _ in 0..100 {
            if !channel.is_connected() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!channel.is_connected());
        assert!(matches!(
            channel.call(Request::Play {
                session_id: SessionId(1)
            }),
            Err(CallError::Disconnected)
        ));
    }

    #[test]
    fn reconnect_replaces_channel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peer.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let peer = thread::spawn(move || {
            for _ in 0..2 {
                let (mut s, _) = listener.accept().unwrap();
                write_prelude(&mut s).unwrap();
                read_prelude(&mut s).unwrap();
            }
        });

        let transport = SocketTransport::connect(&path).unwrap();
        assert_eq!(transport.path(), path.as_path());
        let first = transport.channel().unwrap();
        assert!(transport.reconnect());
        let second = transport.channel().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        peer.join().unwrap();
    }
}
