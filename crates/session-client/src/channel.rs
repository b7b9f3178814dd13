//! Client end of a session's remote channel.
//!
//! [`RemoteSessionChannel`] holds at most one channel (weakly; the transport owns it) plus the
//! tags of the subscriptions made on it. Before every call it checks that the channel is still
//! alive and, if not, detaches, reconnects once and subscribes again, so a stale connection
//! costs the caller one reconnect and nothing else.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use media_bridge_proto::{
    CallError, EventHandler, EventKind, RemoteChannel, Request, Response, SubscriptionTag,
    TransportClient,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Detached,
    Attaching,
    Attached,
}

struct Attachment {
    channel: Option<Weak<dyn RemoteChannel>>,
    tags: Vec<SubscriptionTag>,
    state: ChannelState,
}

impl Attachment {
    fn live_channel(&self) -> Option<Arc<dyn RemoteChannel>> {
        self.channel
            .as_ref()
            .and_then(Weak::upgrade)
            .filter(|c| c.is_connected())
    }
}

pub struct RemoteSessionChannel {
    transport: Arc<dyn TransportClient>,
    handler: EventHandler,
    attachment: Mutex<Attachment>,
}

impl RemoteSessionChannel {
    /// `handler` receives every event of every kind once attached.
    pub fn new(transport: Arc<dyn TransportClient>, handler: EventHandler) -> Self {
        Self {
            transport,
            handler,
            attachment: Mutex::new(Attachment {
                channel: None,
                tags: Vec::new(),
                state: ChannelState::Detached,
            }),
        }
    }

    fn attachment(&self) -> MutexGuard<'_, Attachment> {
        self.attachment.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> ChannelState {
        self.attachment().state
    }

    pub fn subscription_count(&self) -> usize {
        self.attachment().tags.len()
    }

    pub fn attach_channel(&self) -> Result<(), CallError> {
        let mut a = self.attachment();
        if a.state == ChannelState::Attached && a.live_channel().is_some() {
            return Ok(());
        }
        detach_locked(&mut a);
        self.attach_locked(&mut a)
    }

    pub fn detach_channel(&self) {
        detach_locked(&mut self.attachment());
    }

    pub fn reattach_channel_if_required(&self) -> Result<(), CallError> {
        let mut a = self.attachment();
        if a.live_channel().is_some() {
            return Ok(());
        }
        if a.state == ChannelState::Attached {
            tracing::info!("channel went stale; reattaching");
        }
        detach_locked(&mut a);
        self.attach_locked(&mut a)
    }

    fn connected_channel(&self) -> Result<Arc<dyn RemoteChannel>, CallError> {
        if let Some(channel) = self.transport.channel().filter(|c| c.is_connected()) {
            return Ok(channel);
        }
        if !self.transport.reconnect() {
            return Err(CallError::Disconnected);
        }
        self.transport
            .channel()
            .filter(|c| c.is_connected())
            .ok_or(CallError::Disconnected)
    }

    fn attach_locked(&self, a: &mut Attachment) -> Result<(), CallError> {
        a.state = ChannelState::Attaching;
        let channel = match self.connected_channel() {
            Ok(channel) => channel,
            Err(e) => {
                tracing::error!("failed to attach channel: {e}");
                a.state = ChannelState::Detached;
                return Err(e);
            }
        };

        let mut tags = Vec::with_capacity(EventKind::ALL.len());
        for kind in EventKind::ALL {
            match channel.subscribe(kind, self.handler.clone()) {
                Ok(tag) => tags.push(tag),
                Err(e) => {
                    tracing::error!(?kind, "failed to subscribe: {e}");
                    for tag in tags {
                        channel.unsubscribe(tag);
                    }
                    a.state = ChannelState::Detached;
                    return Err(e);
                }
            }
        }

        a.channel = Some(Arc::downgrade(&channel));
        a.tags = tags;
        a.state = ChannelState::Attached;
        tracing::debug!(subscriptions = a.tags.len(), "channel attached");
        Ok(())
    }

    /// Blocking call on the current channel, reattaching first if it went stale.
    ///
    /// Failures are logged here; callers only decide what the failure means locally.
    pub fn call(&self, request: Request) -> Result<Response, CallError> {
        let op = request.name();
        if let Err(e) = self.reattach_channel_if_required() {
            tracing::error!("failed to {op} due to '{e}'");
            return Err(e);
        }
        let channel = self
            .attachment()
            .channel
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or(CallError::Disconnected)?;
        channel.call(request).inspect_err(|e| {
            tracing::error!("failed to {op} due to '{e}'");
        })
    }

    /// Like [`call`](Self::call) but only an `Ack` counts as success.
    pub fn call_ack(&self, request: Request) -> Result<(), CallError> {
        let op = request.name();
        match self.call(request)? {
            Response::Ack => Ok(()),
            response => Err(CallError::UnexpectedResponse { op, response }),
        }
    }
}

fn detach_locked(a: &mut Attachment) {
    let channel = a.channel.take().and_then(|w| w.upgrade());
    for tag in a.tags.drain(..) {
        let removed = channel.as_ref().is_some_and(|c| c.unsubscribe(tag));
        if !removed {
            tracing::debug!(tag = tag.0, "subscription already gone");
        }
    }
    a.state = ChannelState::Detached;
}

impl Drop for RemoteSessionChannel {
    fn drop(&mut self) {
        self.detach_channel();
    }
}
