//! Scripted mock transport for unit tests.
//!
//! Send and return-to-sender outcomes are scripted per attempt, incoming
//! messages are queued by the test, and every call is recorded so tests can
//! assert attempt counts and call ordering (notably close-after-drain).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{MsgBuf, Transport, TransportError, TransportStatus};

#[derive(Default)]
pub struct MockTransport {
    not_ready: AtomicBool,
    fail_alloc: AtomicBool,
    send_script: Mutex<VecDeque<TransportStatus>>,
    rts_script: Mutex<VecDeque<TransportStatus>>,
    send_attempts: AtomicUsize,
    rts_attempts: AtomicUsize,
    incoming: Mutex<VecDeque<MsgBuf>>,
    receive_delay: Mutex<Duration>,
    events: Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes for successive `send` calls. Once the script runs out,
    /// further sends report `Ok`.
    pub fn script_send(&self, statuses: impl IntoIterator<Item = TransportStatus>) {
        self.send_script
            .lock()
            .expect("send script poisoned")
            .extend(statuses);
    }

    /// Queue outcomes for successive `return_to_sender` calls.
    pub fn script_rts(&self, statuses: impl IntoIterator<Item = TransportStatus>) {
        self.rts_script
            .lock()
            .expect("rts script poisoned")
            .extend(statuses);
    }

    /// Queue a message for the next `receive` call.
    pub fn push_incoming(&self, buf: MsgBuf) {
        self.incoming
            .lock()
            .expect("incoming queue poisoned")
            .push_back(buf);
    }

    /// Make every `receive` call take this long before answering, simulating
    /// a pathologically slow drain.
    pub fn set_receive_delay(&self, delay: Duration) {
        *self.receive_delay.lock().expect("delay poisoned") = delay;
    }

    pub fn set_ready(&self, ready: bool) {
        self.not_ready.store(!ready, Ordering::Release);
    }

    pub fn set_fail_alloc(&self, fail: bool) {
        self.fail_alloc.store(fail, Ordering::Release);
    }

    pub fn send_attempts(&self) -> usize {
        self.send_attempts.load(Ordering::Acquire)
    }

    pub fn rts_attempts(&self) -> usize {
        self.rts_attempts.load(Ordering::Acquire)
    }

    /// Ordered record of `receive_start`/`receive_end`/`send`/`rts`/`close`.
    pub fn events(&self) -> Vec<String> {
        self.events.lock().expect("event log poisoned").clone()
    }

    fn record(&self, event: &str) {
        self.events
            .lock()
            .expect("event log poisoned")
            .push(event.to_string());
    }

    fn next_scripted(&self, script: &Mutex<VecDeque<TransportStatus>>) -> TransportStatus {
        script
            .lock()
            .expect("script poisoned")
            .pop_front()
            .unwrap_or(TransportStatus::Ok)
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn ready(&self) -> bool {
        !self.not_ready.load(Ordering::Acquire)
    }

    fn alloc(&self, size: usize) -> Result<MsgBuf, TransportError> {
        if self.fail_alloc.load(Ordering::Acquire) {
            return Err(TransportError::BadBufferAllocation);
        }
        Ok(MsgBuf::new(size))
    }

    async fn send(&self, buf: &mut MsgBuf) -> TransportStatus {
        self.send_attempts.fetch_add(1, Ordering::AcqRel);
        self.record("send");
        let status = self.next_scripted(&self.send_script);
        buf.state = status;
        status
    }

    async fn receive(&self, _timeout_ms: u64) -> MsgBuf {
        self.record("receive_start");
        let delay = *self.receive_delay.lock().expect("delay poisoned");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let buf = self
            .incoming
            .lock()
            .expect("incoming queue poisoned")
            .pop_front();
        self.record("receive_end");
        match buf {
            Some(buf) => buf,
            None => {
                let mut empty = MsgBuf::new(0);
                empty.state = TransportStatus::Timeout;
                empty
            }
        }
    }

    async fn return_to_sender(&self, buf: &mut MsgBuf) -> TransportStatus {
        self.rts_attempts.fetch_add(1, Ordering::AcqRel);
        self.record("rts");
        let status = self.next_scripted(&self.rts_script);
        buf.state = status;
        status
    }

    async fn close(&self) {
        self.record("close");
    }
}
