//! Application surfaces.
//!
//! [`MessageApp`] is the base: it owns the transport endpoint, the ingestion
//! loop, and the storage client, and provides the reliable-send and
//! return-to-sender primitives. [`ReactiveApp`] layers the dispatch engine on
//! top for apps that are purely driven by incoming messages.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigWatcher, FrameConfig};
use crate::dispatch::{ConfigHandler, DispatchTable, EngineState, Handler, StateCell};
use crate::health::{HealthHandler, HEALTH_CHECK_REQ};
use crate::ingest::{IngestLoop, QueueReceiver};
use crate::storage::Storage;
use crate::transport::{Envelope, MessageSummary, Transport, TransportError, TransportStatus};

/// Base message app.
///
/// Holds the single transport context; every component that needs the
/// transport reaches it through this one owned field.
pub struct MessageApp {
    cfg: FrameConfig,
    transport: Arc<dyn Transport>,
    ingest: IngestLoop,
    storage: Arc<dyn Storage>,
    queue: Mutex<QueueReceiver>,
}

impl MessageApp {
    /// Start the ingestion loop and wrap the pieces into an app.
    pub async fn start(
        cfg: FrameConfig,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn Storage>,
    ) -> Arc<Self> {
        let (ingest, queue) = IngestLoop::start(Arc::clone(&transport), &cfg).await;
        info!(listen_addr = %cfg.listen_addr, "message app started");
        Arc::new(Self {
            cfg,
            transport,
            ingest,
            storage,
            queue: Mutex::new(queue),
        })
    }

    pub fn config(&self) -> &FrameConfig {
        &self.cfg
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Reliable send with the configured default retry bound.
    pub async fn send_message(&self, payload: &[u8], mtype: i32) -> Result<bool, TransportError> {
        self.send_with_retries(payload, mtype, self.cfg.default_retries)
            .await
    }

    /// Allocate a buffer, set payload, type and a fresh transaction id, then
    /// attempt the send up to `retries` times.
    ///
    /// Only the transport's RETRY outcome is retried; any other non-OK status
    /// is final and reported as `Ok(false)`. The buffer is released before
    /// returning regardless of outcome. Allocation failures are raised, per
    /// the resource-error taxonomy.
    pub async fn send_with_retries(
        &self,
        payload: &[u8],
        mtype: i32,
        retries: u32,
    ) -> Result<bool, TransportError> {
        let mut buf = self.transport.alloc(payload.len())?;
        buf.set_payload(payload);
        buf.set_mtype(mtype);
        buf.generate_xaction();

        for _ in 0..retries {
            match self.transport.send(&mut buf).await {
                TransportStatus::Ok => return Ok(true),
                TransportStatus::Retry => continue,
                status => {
                    warn!(status = %status, state = status.code(), mtype, "send failed");
                    return Ok(false);
                }
            }
        }

        warn!(mtype, retries, "send exhausted its retry bound");
        Ok(false)
    }

    /// Reply to the originator of `envelope` with the default retry bound.
    pub async fn return_to_sender(
        &self,
        envelope: &mut Envelope,
        new_payload: Option<&[u8]>,
        new_mtype: Option<i32>,
    ) -> bool {
        self.return_to_sender_with_retries(envelope, new_payload, new_mtype, self.cfg.default_retries)
            .await
    }

    /// Reply to the originator, reusing the caller-owned buffer inside
    /// `envelope`, optionally overwriting payload and type first.
    ///
    /// The envelope is not consumed: callers may reuse the buffer for
    /// multiple successive replies and remain responsible for releasing it.
    /// A payload larger than the buffer's capacity grows it transparently.
    pub async fn return_to_sender_with_retries(
        &self,
        envelope: &mut Envelope,
        new_payload: Option<&[u8]>,
        new_mtype: Option<i32>,
        retries: u32,
    ) -> bool {
        let buf = envelope.buf_mut();
        if let Some(payload) = new_payload {
            buf.set_payload(payload);
        }
        if let Some(mtype) = new_mtype {
            buf.set_mtype(mtype);
        }

        for _ in 0..retries {
            match self.transport.return_to_sender(buf).await {
                TransportStatus::Ok => return true,
                TransportStatus::Retry => continue,
                status => {
                    warn!(status = %status, mtype = buf.mtype(), "return-to-sender failed");
                    return false;
                }
            }
        }

        warn!(mtype = buf.mtype(), retries, "return-to-sender exhausted its retry bound");
        false
    }

    /// Pop the next ingested message, waiting up to `timeout`. `None` means
    /// nothing arrived in time; it is the dispatch loop's cancellation
    /// checkpoint, not an error.
    pub async fn next_message(&self, timeout: Duration) -> Option<(MessageSummary, Envelope)> {
        let mut queue = self.queue.lock().await;
        match tokio::time::timeout(timeout, queue.recv()).await {
            Ok(Some(msg)) => Some(msg),
            _ => None,
        }
    }

    /// Drain every message already ingested, without waiting.
    pub async fn messages(&self) -> Vec<(MessageSummary, Envelope)> {
        let mut queue = self.queue.lock().await;
        let mut out = Vec::new();
        while let Ok(msg) = queue.try_recv() {
            out.push(msg);
        }
        out
    }

    // Storage passthroughs, so handlers reach shared state through the app
    // context they are handed.

    pub async fn storage_set(&self, ns: &str, key: &str, value: Vec<u8>) {
        self.storage.set(ns, key, value).await
    }

    pub async fn storage_get(&self, ns: &str, key: &str) -> Option<Vec<u8>> {
        self.storage.get(ns, key).await
    }

    pub async fn storage_find_by_prefix(
        &self,
        ns: &str,
        prefix: &str,
    ) -> std::collections::BTreeMap<String, Vec<u8>> {
        self.storage.find_by_prefix(ns, prefix).await
    }

    pub async fn storage_delete(&self, ns: &str, key: &str) {
        self.storage.delete(ns, key).await
    }

    /// Liveness of the whole app: ingestion loop fresh within the configured
    /// window and storage backend reachable.
    pub async fn healthcheck(&self) -> bool {
        self.ingest.healthcheck(self.cfg.health_window()) && self.storage.healthcheck().await
    }

    /// Ingestion-loop liveness only, with an explicit window.
    pub fn ingest_healthcheck(&self, window: Duration) -> bool {
        self.ingest.healthcheck(window)
    }

    /// Stop the ingestion loop and close the transport. Idempotent.
    pub async fn stop(&self) {
        self.ingest.stop().await;
    }
}

/// An app purely driven by incoming messages.
///
/// Construction pre-registers the built-in health handler and arms the
/// config watcher; `run` (or `spawn`) then dispatches each ingested message
/// to the handler registered for its type, falling back to the default
/// handler supplied at construction. Handlers receive this context, so they
/// can send, reply, register further handlers, or stop dispatch from inside
/// the loop.
pub struct ReactiveApp {
    app: Arc<MessageApp>,
    table: DispatchTable,
    default_handler: Arc<dyn Handler>,
    config_handler: Option<Arc<dyn ConfigHandler>>,
    watcher: Mutex<ConfigWatcher>,
    state: StateCell,
}

impl ReactiveApp {
    pub async fn start(
        cfg: FrameConfig,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn Storage>,
        default_handler: Arc<dyn Handler>,
        config_handler: Option<Arc<dyn ConfigHandler>>,
    ) -> Arc<Self> {
        let watcher = ConfigWatcher::new(cfg.config_file.as_deref());
        let app = MessageApp::start(cfg, transport, storage).await;

        let this = Arc::new(Self {
            app,
            table: DispatchTable::new(),
            default_handler,
            config_handler,
            watcher: Mutex::new(watcher),
            state: StateCell::new(),
        });

        this.table.register(HEALTH_CHECK_REQ, Arc::new(HealthHandler)).await;

        // startup configuration and later changes share one code path
        Self::invoke_config_handler(&this).await;

        this
    }

    pub fn app(&self) -> &Arc<MessageApp> {
        &self.app
    }

    pub fn state(&self) -> EngineState {
        self.state.get()
    }

    /// Register `handler` for `mtype`. Takes effect on the next pop for that
    /// type; the last registration wins.
    pub async fn register_handler(&self, mtype: i32, handler: Arc<dyn Handler>) {
        self.table.register(mtype, handler).await;
    }

    pub async fn send_message(&self, payload: &[u8], mtype: i32) -> Result<bool, TransportError> {
        self.app.send_message(payload, mtype).await
    }

    pub async fn return_to_sender(
        &self,
        envelope: &mut Envelope,
        new_payload: Option<&[u8]>,
        new_mtype: Option<i32>,
    ) -> bool {
        self.app.return_to_sender(envelope, new_payload, new_mtype).await
    }

    pub async fn healthcheck(&self) -> bool {
        self.app.healthcheck().await
    }

    async fn invoke_config_handler(this: &Arc<Self>) {
        let Some(handler) = this.config_handler.as_ref() else {
            return;
        };
        let watcher = this.watcher.lock().await;
        if !watcher.armed() {
            return;
        }
        match watcher.read() {
            Ok(value) => handler.handle(Arc::clone(this), value).await,
            // a misbehaving file must not take the loop down
            Err(e) => error!(error = %e, "config read failed"),
        }
    }

    async fn check_config(this: &Arc<Self>) {
        if this.config_handler.is_none() {
            return;
        }
        let events = this.watcher.lock().await.config_check();
        for _event in events {
            Self::invoke_config_handler(this).await;
        }
    }

    /// Run the dispatch loop on the caller's task until [`ReactiveApp::stop`]
    /// is called, from another task or from inside a handler.
    ///
    /// Handlers are invoked synchronously on this task; a handler that never
    /// returns stalls dispatch (messages keep queuing, nothing is lost).
    pub async fn run(self: Arc<Self>) {
        if !self.state.transition(EngineState::Idle, EngineState::Running) {
            warn!(state = ?self.state.get(), "dispatch engine cannot start");
            return;
        }
        info!("dispatch engine running");

        let timeout = self.app.config().dispatch_timeout();
        while self.state.get() == EngineState::Running {
            Self::check_config(&self).await;

            let Some((summary, envelope)) = self.app.next_message(timeout).await else {
                continue;
            };

            let handler = match self.table.lookup(summary.mtype).await {
                Some(handler) => handler,
                None => Arc::clone(&self.default_handler),
            };
            handler.handle(Arc::clone(&self), summary, envelope).await;
        }

        self.state.set(EngineState::Stopped);
        info!("dispatch engine stopped");
    }

    /// Threaded mode: run the dispatch loop on a spawned task and return
    /// immediately. [`ReactiveApp::stop`] is required to terminate it.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Stop dispatching and propagate to the ingestion loop. The dispatch
    /// loop exits after its current iteration. Idempotent.
    pub async fn stop(&self) {
        if self.state.transition(EngineState::Running, EngineState::Stopping) {
            debug!("dispatch engine stopping");
        } else {
            // never ran, or already on its way down
            self.state.transition(EngineState::Idle, EngineState::Stopped);
        }
        self.app.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::handler_fn;
    use crate::storage::MemoryStorage;
    use crate::transport::{MockTransport, MsgBuf};

    fn quiet_cfg() -> FrameConfig {
        FrameConfig {
            wait_for_ready: false,
            dispatch_timeout_ms: 20,
            ..FrameConfig::default()
        }
    }

    async fn mock_app(mock: &Arc<MockTransport>) -> Arc<MessageApp> {
        MessageApp::start(
            quiet_cfg(),
            mock.clone() as Arc<dyn Transport>,
            Arc::new(MemoryStorage::new()),
        )
        .await
    }

    fn incoming(payload: &[u8], mtype: i32) -> MsgBuf {
        let mut buf = MsgBuf::new(payload.len());
        buf.set_payload(payload);
        buf.set_mtype(mtype);
        buf.set_src("peer:4562");
        buf
    }

    #[tokio::test]
    async fn send_retry_bound_is_exact() {
        let mock = Arc::new(MockTransport::new());
        mock.script_send(vec![TransportStatus::Retry; 8]);
        let app = mock_app(&mock).await;

        let sent = app.send_with_retries(b"x", 1, 5).await.unwrap();
        assert!(!sent);
        assert_eq!(mock.send_attempts(), 5);

        app.stop().await;
    }

    #[tokio::test]
    async fn send_short_circuits_on_ok() {
        let mock = Arc::new(MockTransport::new());
        mock.script_send([TransportStatus::Retry, TransportStatus::Retry]);
        let app = mock_app(&mock).await;

        // attempt 3 falls off the script and reports OK
        let sent = app.send_with_retries(b"x", 1, 100).await.unwrap();
        assert!(sent);
        assert_eq!(mock.send_attempts(), 3);

        app.stop().await;
    }

    #[tokio::test]
    async fn terminal_send_status_is_not_retried() {
        let mock = Arc::new(MockTransport::new());
        mock.script_send([TransportStatus::Retry, TransportStatus::Err(2)]);
        let app = mock_app(&mock).await;

        let sent = app.send_with_retries(b"x", 1, 100).await.unwrap();
        assert!(!sent);
        assert_eq!(mock.send_attempts(), 2);

        app.stop().await;
    }

    #[tokio::test]
    async fn alloc_failure_is_raised_not_swallowed() {
        let mock = Arc::new(MockTransport::new());
        mock.set_fail_alloc(true);
        let app = mock_app(&mock).await;

        let err = app.send_message(b"x", 1).await.unwrap_err();
        assert!(matches!(err, TransportError::BadBufferAllocation));

        app.stop().await;
    }

    #[tokio::test]
    async fn rts_keeps_the_caller_owned_buffer() {
        let mock = Arc::new(MockTransport::new());
        let app = mock_app(&mock).await;

        let mut envelope = Envelope::new(incoming(b"tiny", 60000));
        let bigger = vec![b'a'; 256];
        assert!(app
            .return_to_sender_with_retries(&mut envelope, Some(&bigger), Some(60001), 3)
            .await);
        assert_eq!(mock.rts_attempts(), 1);

        // buffer grew, carries the new type, and is still reusable
        assert_eq!(envelope.buf().payload(), &bigger[..]);
        assert_eq!(envelope.buf().mtype(), 60001);
        assert!(app.return_to_sender(&mut envelope, None, None).await);

        envelope.release();
        app.stop().await;
    }

    #[tokio::test]
    async fn rts_reports_exhaustion_as_false() {
        let mock = Arc::new(MockTransport::new());
        mock.script_rts(vec![TransportStatus::Retry; 10]);
        let app = mock_app(&mock).await;

        let mut envelope = Envelope::new(incoming(b"m", 1));
        assert!(!app.return_to_sender_with_retries(&mut envelope, None, None, 4).await);
        assert_eq!(mock.rts_attempts(), 4);

        app.stop().await;
    }

    #[tokio::test]
    async fn unregistered_types_fall_back_to_the_default_handler() {
        let mock = Arc::new(MockTransport::new());
        mock.push_incoming(incoming(b"payload-1", 4242));

        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
        let default = handler_fn(move |_app, summary: MessageSummary, envelope: Envelope| {
            let seen_tx = seen_tx.clone();
            async move {
                let _ = seen_tx.send(summary);
                envelope.release();
            }
        });

        let reactive = ReactiveApp::start(
            quiet_cfg(),
            mock.clone() as Arc<dyn Transport>,
            Arc::new(MemoryStorage::new()),
            default,
            None,
        )
        .await;
        let worker = Arc::clone(&reactive).spawn();

        let summary = tokio::time::timeout(Duration::from_secs(2), seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.mtype, 4242);
        assert_eq!(summary.payload.as_deref(), Some(&b"payload-1"[..]));

        reactive.stop().await;
        worker.await.unwrap();
        assert_eq!(reactive.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn last_registration_for_a_type_wins() {
        let mock = Arc::new(MockTransport::new());

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let first_tx = tx.clone();
        let second_tx = tx.clone();

        let reactive = ReactiveApp::start(
            quiet_cfg(),
            mock.clone() as Arc<dyn Transport>,
            Arc::new(MemoryStorage::new()),
            handler_fn(|_, _, envelope: Envelope| async move { envelope.release() }),
            None,
        )
        .await;

        reactive
            .register_handler(
                7,
                handler_fn(move |_, _, envelope: Envelope| {
                    let tx = first_tx.clone();
                    async move {
                        let _ = tx.send("first");
                        envelope.release();
                    }
                }),
            )
            .await;
        reactive
            .register_handler(
                7,
                handler_fn(move |_, _, envelope: Envelope| {
                    let tx = second_tx.clone();
                    async move {
                        let _ = tx.send("second");
                        envelope.release();
                    }
                }),
            )
            .await;

        mock.push_incoming(incoming(b"m", 7));
        let worker = Arc::clone(&reactive).spawn();

        let who = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(who, "second");

        reactive.stop().await;
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn dispatch_preserves_ingestion_order() {
        let mock = Arc::new(MockTransport::new());
        for i in 0..10u8 {
            mock.push_incoming(incoming(&[i], 9000));
        }

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let default = handler_fn(move |_app, summary: MessageSummary, envelope: Envelope| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(summary.payload.unwrap()[0]);
                envelope.release();
            }
        });

        let reactive = ReactiveApp::start(
            quiet_cfg(),
            mock.clone() as Arc<dyn Transport>,
            Arc::new(MemoryStorage::new()),
            default,
            None,
        )
        .await;
        let worker = Arc::clone(&reactive).spawn();

        for expected in 0..10u8 {
            let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(got, expected);
        }

        reactive.stop().await;
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn handlers_drive_the_engine_through_their_context() {
        let mock = Arc::new(MockTransport::new());
        mock.push_incoming(incoming(b"first", 8));
        mock.push_incoming(incoming(b"second", 9));

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let reactive = ReactiveApp::start(
            quiet_cfg(),
            mock.clone() as Arc<dyn Transport>,
            Arc::new(MemoryStorage::new()),
            handler_fn(move |ctx: Arc<ReactiveApp>, _summary, envelope: Envelope| {
                let tx = tx.clone();
                async move {
                    envelope.release();
                    // register for the next type and wind down after it
                    ctx.register_handler(
                        9,
                        handler_fn(move |ctx: Arc<ReactiveApp>, summary, envelope: Envelope| {
                            let tx = tx.clone();
                            async move {
                                let _ = tx.send(summary.mtype);
                                envelope.release();
                                ctx.stop().await;
                            }
                        }),
                    )
                    .await;
                }
            }),
            None,
        )
        .await;
        let worker = Arc::clone(&reactive).spawn();

        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, 9);

        // the engine stopped itself from inside the handler
        tokio::time::timeout(Duration::from_secs(2), worker)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reactive.state(), EngineState::Stopped);
        let closes = mock.events().iter().filter(|e| *e == "close").count();
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_propagates() {
        let mock = Arc::new(MockTransport::new());
        let reactive = ReactiveApp::start(
            quiet_cfg(),
            mock.clone() as Arc<dyn Transport>,
            Arc::new(MemoryStorage::new()),
            handler_fn(|_, _, envelope: Envelope| async move { envelope.release() }),
            None,
        )
        .await;

        let worker = Arc::clone(&reactive).spawn();
        // let the loop actually enter Running before stopping it
        tokio::time::sleep(Duration::from_millis(50)).await;

        reactive.stop().await;
        reactive.stop().await;
        worker.await.unwrap();

        let closes = mock.events().iter().filter(|e| *e == "close").count();
        assert_eq!(closes, 1);
        assert_eq!(reactive.state(), EngineState::Stopped);
    }
}
