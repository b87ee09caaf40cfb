//! Built-in liveness protocol.
//!
//! A reserved message-type pair carries "are you alive" probes. The handler
//! is pre-registered at construction; because the last registration for a
//! type wins, an app may override it by registering its own handler for
//! [`HEALTH_CHECK_REQ`] afterwards.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use crate::app::ReactiveApp;
use crate::dispatch::Handler;
use crate::transport::{Envelope, MessageSummary};

/// Reserved message type of a liveness probe.
pub const HEALTH_CHECK_REQ: i32 = 100;
/// Reserved message type of the liveness reply.
pub const HEALTH_CHECK_RESP: i32 = 101;

/// Replies `"OK\n"` when both the ingestion loop and the storage backend are
/// healthy, an error string otherwise, then releases the probe's buffer.
pub(crate) struct HealthHandler;

impl Handler for HealthHandler {
    fn handle(
        &self,
        app: Arc<ReactiveApp>,
        _summary: MessageSummary,
        mut envelope: Envelope,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let healthy = app.healthcheck().await;
            let payload: &[u8] = if healthy {
                b"OK\n"
            } else {
                b"ERROR [transport or storage is unhealthy]\n"
            };

            let delivered = app
                .return_to_sender(&mut envelope, Some(payload), Some(HEALTH_CHECK_RESP))
                .await;
            if !delivered {
                debug!("health reply could not be delivered");
            }

            envelope.release();
        })
    }
}
