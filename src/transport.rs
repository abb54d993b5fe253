//! # Link Transport
//!
//! The path plane does not own sockets. It assumes a datagram transport
//! with authenticated framing and per-peer ordering, reached through the
//! [`LinkTransport`] trait: fire-and-forget frames for path traffic, plus
//! a request/response primitive the NodeDB fetch machinery uses against
//! its RC and router-ID sources.
//!
//! [`MemoryHub`] is the in-process implementation used by tests and local
//! simulation: every attached node gets an ordered inbox, and responders
//! can be registered per node to answer fetch requests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::identity::RouterId;
use crate::messages::LinkFrame;

/// A frame as delivered: who sent it, and what.
pub type InboundFrame = (RouterId, LinkFrame);

/// Answer fetch-style requests addressed to a node.
pub type Responder = Arc<dyn Fn(&str, &[u8]) -> Result<Vec<u8>> + Send + Sync>;

/// Datagram transport with authenticated framing, ordered per peer.
#[async_trait]
pub trait LinkTransport: Send + Sync {
    /// Our identity on the wire.
    fn local_id(&self) -> RouterId;

    /// Enqueue a frame to a peer. Returns false when the peer is
    /// unreachable or the queue is gone.
    async fn send_frame(&self, to: RouterId, frame: LinkFrame) -> bool;

    /// Request/response against a peer (RC set fetches, RID list fetches).
    async fn request(&self, to: RouterId, method: &str, body: Vec<u8>) -> Result<Vec<u8>>;
}

#[derive(Default)]
struct HubInner {
    inboxes: HashMap<RouterId, mpsc::UnboundedSender<InboundFrame>>,
    responders: HashMap<RouterId, Responder>,
}

/// An in-process mesh connecting [`MemoryLink`] endpoints.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubInner>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node, returning its transport handle and ordered inbox.
    pub fn attach(&self, id: RouterId) -> (MemoryLink, mpsc::UnboundedReceiver<InboundFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .expect("hub lock poisoned")
            .inboxes
            .insert(id, tx);
        (
            MemoryLink {
                id,
                hub: self.clone(),
            },
            rx,
        )
    }

    /// Detach a node; frames to it start failing.
    pub fn detach(&self, id: &RouterId) {
        let mut inner = self.inner.lock().expect("hub lock poisoned");
        inner.inboxes.remove(id);
        inner.responders.remove(id);
    }

    /// Install the responder answering `request` calls addressed to `id`.
    pub fn set_responder(&self, id: RouterId, responder: Responder) {
        self.inner
            .lock()
            .expect("hub lock poisoned")
            .responders
            .insert(id, responder);
    }

    fn deliver(&self, from: RouterId, to: RouterId, frame: LinkFrame) -> bool {
        let inner = self.inner.lock().expect("hub lock poisoned");
        match inner.inboxes.get(&to) {
            Some(tx) => tx.send((from, frame)).is_ok(),
            None => false,
        }
    }

    fn ask(&self, to: RouterId, method: &str, body: &[u8]) -> Result<Vec<u8>> {
        let responder = {
            let inner = self.inner.lock().expect("hub lock poisoned");
            inner.responders.get(&to).cloned()
        };
        match responder {
            Some(responder) => responder(method, body),
            None => Err(anyhow!("no responder for {}", to.short())),
        }
    }
}

/// One node's handle onto a [`MemoryHub`].
#[derive(Clone)]
pub struct MemoryLink {
    id: RouterId,
    hub: MemoryHub,
}

#[async_trait]
impl LinkTransport for MemoryLink {
    fn local_id(&self) -> RouterId {
        self.id
    }

    async fn send_frame(&self, to: RouterId, frame: LinkFrame) -> bool {
        self.hub.deliver(self.id, to, frame)
    }

    async fn request(&self, to: RouterId, method: &str, body: Vec<u8>) -> Result<Vec<u8>> {
        self.hub.ask(to, method, &body)
    }
}
