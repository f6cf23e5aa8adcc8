//! Orchestrator event connection.

pub mod heartbeat;
pub mod manager;
pub mod protocol;
pub mod transport;

pub use manager::{ConnectionState, SessionConfig, SessionEnd, WorkerSession};
pub use protocol::{InboundEvent, OutboundEvent};
pub use transport::{EventSink, EventStream};
