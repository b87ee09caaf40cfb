//! Message-type-keyed handler dispatch.
//!
//! Handlers receive the owning reactive app, the message summary, and the
//! envelope; the envelope's buffer is theirs to release, and the app context
//! lets a handler send, reply, register further handlers, or stop dispatch
//! from inside the loop. Registration is expected to complete before the
//! engine runs, but registering during a run is allowed: the next pop for
//! that type sees the new handler, and the last registration for a type wins.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::RwLock;
use tracing::debug;

use crate::app::ReactiveApp;
use crate::transport::{Envelope, MessageSummary};

/// Handler for one message type.
pub trait Handler: Send + Sync {
    fn handle(
        &self,
        app: Arc<ReactiveApp>,
        summary: MessageSummary,
        envelope: Envelope,
    ) -> BoxFuture<'static, ()>;
}

/// Adapter so plain async functions and closures register as handlers.
pub struct FnHandler<F>(F);

impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Arc<ReactiveApp>, MessageSummary, Envelope) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    fn handle(
        &self,
        app: Arc<ReactiveApp>,
        summary: MessageSummary,
        envelope: Envelope,
    ) -> BoxFuture<'static, ()> {
        Box::pin((self.0)(app, summary, envelope))
    }
}

/// Wrap an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Arc<ReactiveApp>, MessageSummary, Envelope) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Handler invoked with the freshly parsed content of the watched config
/// file, once at startup and on each detected change.
pub trait ConfigHandler: Send + Sync {
    fn handle(&self, app: Arc<ReactiveApp>, config: serde_json::Value) -> BoxFuture<'static, ()>;
}

struct FnConfigHandler<F>(F);

impl<F, Fut> ConfigHandler for FnConfigHandler<F>
where
    F: Fn(Arc<ReactiveApp>, serde_json::Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    fn handle(&self, app: Arc<ReactiveApp>, config: serde_json::Value) -> BoxFuture<'static, ()> {
        Box::pin((self.0)(app, config))
    }
}

/// Wrap an async closure as a [`ConfigHandler`].
pub fn config_handler_fn<F, Fut>(f: F) -> Arc<dyn ConfigHandler>
where
    F: Fn(Arc<ReactiveApp>, serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(FnConfigHandler(f))
}

/// Lifecycle of the dispatch engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    Idle = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl EngineState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => EngineState::Idle,
            1 => EngineState::Running,
            2 => EngineState::Stopping,
            _ => EngineState::Stopped,
        }
    }
}

/// Lock-free cell holding the engine state.
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(EngineState::Idle as u8))
    }

    pub(crate) fn get(&self) -> EngineState {
        EngineState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: EngineState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Transition only when currently in `from`; reports whether it happened.
    pub(crate) fn transition(&self, from: EngineState, to: EngineState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Mapping from message type to handler.
#[derive(Default)]
pub struct DispatchTable {
    handlers: RwLock<HashMap<i32, Arc<dyn Handler>>>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `mtype`; the last registration wins.
    pub async fn register(&self, mtype: i32, handler: Arc<dyn Handler>) {
        let replaced = self
            .handlers
            .write()
            .await
            .insert(mtype, handler)
            .is_some();
        debug!(mtype, replaced, "handler registered");
    }

    pub async fn lookup(&self, mtype: i32) -> Option<Arc<dyn Handler>> {
        self.handlers.read().await.get(&mtype).cloned()
    }
}
