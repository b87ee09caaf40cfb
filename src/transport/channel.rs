//! In-process loopback mesh for standalone mode.
//!
//! A [`ChannelNetwork`] plays the role of the external mesh inside a single
//! process: endpoints bind to addresses, a routing table maps message types
//! to endpoints, and return-to-sender delivers to the buffer's source
//! endpoint. Ideal for local development and tests without a real mesh.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{MsgBuf, Transport, TransportError, TransportStatus};

/// Terminal code reported when no route exists for a message type.
pub const ERR_NO_ENDPOINT: i32 = 2;
/// Terminal code reported for operations on a closed endpoint.
pub const ERR_CLOSED: i32 = 7;

struct Registry {
    endpoints: Mutex<HashMap<String, mpsc::UnboundedSender<MsgBuf>>>,
    routes: Mutex<HashMap<i32, String>>,
}

/// Shared in-process mesh. Clone handles freely; all clones see the same
/// endpoints and routing table. Passed explicitly to whoever needs it, never
/// held in process-wide state.
#[derive(Clone)]
pub struct ChannelNetwork {
    registry: Arc<Registry>,
}

impl ChannelNetwork {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                endpoints: Mutex::new(HashMap::new()),
                routes: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Install a route: messages of `mtype` are delivered to `addr`.
    /// The last route installed for a type wins.
    pub fn route(&self, mtype: i32, addr: &str) {
        self.registry
            .routes
            .lock()
            .expect("route table poisoned")
            .insert(mtype, addr.to_string());
    }

    /// Bind a new endpoint to `addr`.
    ///
    /// Fails with [`TransportError::InitFailed`] when the address is already
    /// bound, mirroring a null context from the real mesh.
    pub fn endpoint(&self, addr: &str) -> Result<ChannelTransport, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut endpoints = self
                .registry
                .endpoints
                .lock()
                .expect("endpoint table poisoned");
            if endpoints.contains_key(addr) {
                return Err(TransportError::InitFailed);
            }
            endpoints.insert(addr.to_string(), tx);
        }

        info!(addr = %addr, "channel endpoint bound");

        Ok(ChannelTransport {
            addr: addr.to_string(),
            inbox: tokio::sync::Mutex::new(rx),
            registry: Arc::clone(&self.registry),
            closed: AtomicBool::new(false),
        })
    }
}

impl Default for ChannelNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// One bound endpoint on a [`ChannelNetwork`].
pub struct ChannelTransport {
    addr: String,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<MsgBuf>>,
    registry: Arc<Registry>,
    closed: AtomicBool,
}

impl ChannelTransport {
    /// Address this endpoint is bound to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn deliver(&self, target: &str, buf: &MsgBuf) -> TransportStatus {
        let sender = {
            let endpoints = self
                .registry
                .endpoints
                .lock()
                .expect("endpoint table poisoned");
            endpoints.get(target).cloned()
        };

        let Some(sender) = sender else {
            return TransportStatus::Err(ERR_NO_ENDPOINT);
        };

        let mut delivered = buf.clone();
        delivered.set_src(&self.addr);
        delivered.state = TransportStatus::Ok;
        delivered.errno = 0;

        match sender.send(delivered) {
            Ok(()) => TransportStatus::Ok,
            // receiver side is gone but the endpoint was not unbound
            Err(_) => TransportStatus::Err(ERR_NO_ENDPOINT),
        }
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn ready(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    fn alloc(&self, size: usize) -> Result<MsgBuf, TransportError> {
        Ok(MsgBuf::new(size))
    }

    async fn send(&self, buf: &mut MsgBuf) -> TransportStatus {
        if self.closed.load(Ordering::Acquire) {
            buf.state = TransportStatus::Err(ERR_CLOSED);
            return buf.state;
        }

        let target = {
            let routes = self.registry.routes.lock().expect("route table poisoned");
            routes.get(&buf.mtype()).cloned()
        };

        let status = match target {
            Some(target) => self.deliver(&target, buf),
            None => {
                warn!(mtype = buf.mtype(), "no route for message type");
                TransportStatus::Err(ERR_NO_ENDPOINT)
            }
        };

        buf.state = status;
        status
    }

    async fn receive(&self, timeout_ms: u64) -> MsgBuf {
        let mut timed_out = MsgBuf::new(0);
        timed_out.state = TransportStatus::Timeout;

        if self.closed.load(Ordering::Acquire) {
            return timed_out;
        }

        let mut inbox = self.inbox.lock().await;
        if timeout_ms == 0 {
            match inbox.try_recv() {
                Ok(buf) => buf,
                Err(_) => timed_out,
            }
        } else {
            match tokio::time::timeout(Duration::from_millis(timeout_ms), inbox.recv()).await {
                Ok(Some(buf)) => buf,
                _ => timed_out,
            }
        }
    }

    async fn return_to_sender(&self, buf: &mut MsgBuf) -> TransportStatus {
        if self.closed.load(Ordering::Acquire) {
            buf.state = TransportStatus::Err(ERR_CLOSED);
            return buf.state;
        }

        let target = buf.src().to_string();
        let status = if target.is_empty() {
            warn!("return-to-sender on a buffer with no source");
            TransportStatus::Err(ERR_NO_ENDPOINT)
        } else {
            self.deliver(&target, buf)
        };

        buf.state = status;
        status
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.registry
            .endpoints
            .lock()
            .expect("endpoint table poisoned")
            .remove(&self.addr);
        debug!(addr = %self.addr, "channel endpoint closed");
    }
}
