//! Meshapp - message-reactive application framework
//!
//! A framework for building applications that react to messages delivered by
//! a routing-mesh transport. A background ingestion loop drains the transport
//! into an internal queue so that slow application handlers can never block
//! message intake; a dispatch engine routes each message to a handler keyed
//! by message type.

pub mod app;
pub mod config;
pub mod dispatch;
pub mod health;
pub mod ingest;
pub mod logging;
pub mod metrics;
pub mod storage;
pub mod transport;

pub use app::{MessageApp, ReactiveApp};
pub use config::{ConfigError, ConfigEvent, ConfigWatcher, FrameConfig, CONFIG_FILE_ENV};
pub use dispatch::{config_handler_fn, handler_fn, ConfigHandler, EngineState, Handler};
pub use health::{HEALTH_CHECK_REQ, HEALTH_CHECK_RESP};
pub use logging::init_tracing;
pub use metrics::{MetricData, MetricsError, MetricsReporter, METRICS_MSG_TYPE};
pub use storage::{MemoryStorage, Storage};
pub use transport::{
    Envelope, MessageSummary, MsgBuf, Transport, TransportError, TransportStatus,
};
