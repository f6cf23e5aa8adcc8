//! Periodic keepalive carrying the running task ids.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use crate::connection::protocol::OutboundEvent;
use crate::connection::transport::EventSink;
use crate::worker::registry::TaskRegistry;

/// Emit a keepalive every `interval` until the sink closes. The first one
/// goes out immediately.
pub fn spawn_heartbeat(
    name: String,
    registry: Arc<TaskRegistry>,
    sink: EventSink,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let event = OutboundEvent::Keepalive {
                name: name.clone(),
                running_tasks: registry.snapshot(),
            };
            if sink.send(event).await.is_err() {
                tracing::debug!("Event sink closed, stopping heartbeat");
                break;
            }
        }
    })
}
