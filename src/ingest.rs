//! Background ingestion loop.
//!
//! Owns the transport endpoint and continuously drains every message
//! currently queued into an unbounded FIFO. Intake and dispatch are decoupled
//! by that FIFO: a slow handler can delay processing but can never block the
//! reading of new messages.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::FrameConfig;
use crate::transport::{Envelope, MessageSummary, Transport, TransportStatus};

/// Consumer end of the ingestion FIFO.
pub type QueueReceiver = mpsc::UnboundedReceiver<(MessageSummary, Envelope)>;

/// Handle to the running ingestion task.
///
/// `last_active` is written only by the ingestion task and read lock-free by
/// [`IngestLoop::healthcheck`] from any task; benign staleness is expected.
pub struct IngestLoop {
    transport: Arc<dyn Transport>,
    last_active_ms: Arc<AtomicU64>,
    epoch: Instant,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
    join_timeout: Duration,
}

impl IngestLoop {
    /// Spawn the drain task and hand back the FIFO consumer end.
    ///
    /// When `wait_for_ready` is configured, construction blocks until the
    /// mesh reports a routing table; receive-only apps can skip the wait.
    pub async fn start(transport: Arc<dyn Transport>, cfg: &FrameConfig) -> (Self, QueueReceiver) {
        if cfg.wait_for_ready {
            debug!("waiting for transport to become ready");
            while !transport.ready() {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let epoch = Instant::now();
        let last_active_ms = Arc::new(AtomicU64::new(0));

        let worker_transport = Arc::clone(&transport);
        let worker_last = Arc::clone(&last_active_ms);
        let idle = cfg.drain_idle();

        let task = tokio::spawn(async move {
            debug!("ingestion loop starting");
            loop {
                if *stop_rx.borrow() {
                    break;
                }

                // drain everything currently queued without blocking
                loop {
                    let buf = worker_transport.receive(0).await;
                    match buf.state {
                        TransportStatus::Ok => {
                            let summary = MessageSummary::of(&buf);
                            if tx.send((summary, Envelope::new(buf))).is_err() {
                                // consumer side is gone; nothing left to feed
                                break;
                            }
                        }
                        TransportStatus::Timeout => break,
                        status => {
                            // terminal for this pass only; try again next pass
                            warn!(status = %status, "receive failed, ending drain pass");
                            break;
                        }
                    }
                }

                worker_last.store(epoch.elapsed().as_millis() as u64, Ordering::Relaxed);

                // bounded idle wait so the stop flag is re-checked promptly
                tokio::select! {
                    _ = stop_rx.changed() => {}
                    _ = tokio::time::sleep(idle) => {}
                }
            }
            debug!("ingestion loop exited");
        });

        (
            Self {
                transport,
                last_active_ms,
                epoch,
                stop_tx,
                task: Mutex::new(Some(task)),
                stopped: AtomicBool::new(false),
                join_timeout: cfg.join_timeout(),
            },
            rx,
        )
    }

    /// True iff the drain task is alive and completed a pass within `window`.
    ///
    /// Catches both a crashed task and one stuck inside a pathologically long
    /// drain.
    pub fn healthcheck(&self, window: Duration) -> bool {
        let alive = self
            .task
            .lock()
            .expect("ingest task slot poisoned")
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false);
        let last = Duration::from_millis(self.last_active_ms.load(Ordering::Relaxed));
        alive && self.epoch.elapsed().saturating_sub(last) < window
    }

    /// Cooperatively stop the loop, then close the transport.
    ///
    /// The transport context is closed only after the task has verifiably
    /// exited its current drain pass; closing the endpoint while a receive is
    /// in flight is undefined behavior in the mesh. When the task does not
    /// join within the bounded wait, the context is leaked rather than
    /// closed out from under it. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        debug!("stopping ingestion loop, waiting for the current drain pass");
        let _ = self.stop_tx.send(true);

        let task = self.task.lock().expect("ingest task slot poisoned").take();
        if let Some(task) = task {
            if tokio::time::timeout(self.join_timeout, task).await.is_err() {
                warn!("ingestion loop did not exit within the join timeout, leaking the transport context");
                return;
            }
        }

        self.transport.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockTransport, MsgBuf};

    fn incoming(payload: &[u8], mtype: i32) -> MsgBuf {
        let mut buf = MsgBuf::new(payload.len());
        buf.set_payload(payload);
        buf.set_mtype(mtype);
        buf
    }

    fn quiet_cfg() -> FrameConfig {
        FrameConfig {
            wait_for_ready: false,
            ..FrameConfig::default()
        }
    }

    #[tokio::test]
    async fn drains_messages_in_arrival_order() {
        let mock = Arc::new(MockTransport::new());
        for i in 0..5u8 {
            mock.push_incoming(incoming(&[i], 100 + i32::from(i)));
        }

        let (ingest, mut rx) = IngestLoop::start(mock.clone(), &quiet_cfg()).await;

        for i in 0..5u8 {
            let (summary, envelope) = rx.recv().await.unwrap();
            assert_eq!(summary.payload.as_deref(), Some(&[i][..]));
            assert_eq!(summary.mtype, 100 + i32::from(i));
            envelope.release();
        }

        ingest.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn healthcheck_reflects_a_stalled_drain() {
        let mock = Arc::new(MockTransport::new());
        mock.set_receive_delay(Duration::from_millis(1500));

        let (ingest, _rx) = IngestLoop::start(mock.clone(), &quiet_cfg()).await;

        // mid-drain, no pass has completed within the window
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(!ingest.healthcheck(Duration::from_secs(1)));

        // the pass completes and the timestamp is fresh again
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(ingest.healthcheck(Duration::from_secs(1)));

        ingest.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_closes_the_transport_only_after_the_drain() {
        let mock = Arc::new(MockTransport::new());
        mock.set_receive_delay(Duration::from_millis(200));

        let (ingest, _rx) = IngestLoop::start(mock.clone(), &quiet_cfg()).await;

        // stop while a receive is in flight
        tokio::time::sleep(Duration::from_millis(50)).await;
        ingest.stop().await;

        let events = mock.events();
        let close_at = events.iter().position(|e| e == "close").unwrap();
        let last_receive_end = events.iter().rposition(|e| e == "receive_end").unwrap();
        assert!(close_at > last_receive_end, "close must follow the drain: {events:?}");
        assert!(!ingest.healthcheck(Duration::from_secs(30)));
    }

    #[tokio::test(start_paused = true)]
    async fn join_timeout_leaves_the_transport_open() {
        let mock = Arc::new(MockTransport::new());
        mock.set_receive_delay(Duration::from_secs(60));

        let cfg = FrameConfig {
            wait_for_ready: false,
            join_timeout_ms: 100,
            ..FrameConfig::default()
        };
        let (ingest, _rx) = IngestLoop::start(mock.clone(), &cfg).await;

        // stop while the drain is stuck inside a receive far beyond the join
        // timeout
        tokio::time::sleep(Duration::from_millis(10)).await;
        ingest.stop().await;
        ingest.stop().await;

        let events = mock.events();
        assert!(events.iter().any(|e| e == "receive_start"));
        assert!(
            !events.iter().any(|e| e == "close"),
            "closed with a receive in flight: {events:?}"
        );
        assert!(!ingest.healthcheck(Duration::from_secs(120)));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let mock = Arc::new(MockTransport::new());
        let (ingest, _rx) = IngestLoop::start(mock.clone(), &quiet_cfg()).await;

        ingest.stop().await;
        ingest.stop().await;

        let closes = mock.events().iter().filter(|e| *e == "close").count();
        assert_eq!(closes, 1);
    }
}
