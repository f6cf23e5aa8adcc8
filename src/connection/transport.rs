//! WebSocket transport for orchestrator events.

use std::pin::Pin;

use futures::{SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::connection::protocol::{InboundEvent, OutboundEvent};
use crate::error::ConnectionError;

/// Outbound queue depth. The writer drains it as fast as the socket allows.
const OUTBOUND_BUFFER: usize = 64;

/// Inbound events. Yields an error once the socket is lost, then ends.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<InboundEvent, ConnectionError>> + Send>>;

/// Cloneable handle that queues outbound events.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<OutboundEvent>,
}

impl EventSink {
    /// Sink backed by a plain channel; the receiver sees every event sent.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<OutboundEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub async fn send(&self, event: OutboundEvent) -> Result<(), ConnectionError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| ConnectionError::Send("event socket writer stopped".to_string()))
    }
}

/// Event stream fed from a channel, for in-process event sources.
pub fn channel_stream(rx: mpsc::Receiver<Result<InboundEvent, ConnectionError>>) -> EventStream {
    Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx))
}

/// Connected event socket.
pub struct EventSocket {
    pub sink: EventSink,
    pub inbound: EventStream,
    /// Writer task; ends when every sink is dropped or the socket fails.
    pub writer: JoinHandle<()>,
}

/// Open the event socket at `url`.
pub async fn connect(url: &str) -> Result<EventSocket, ConnectionError> {
    let (ws, _) = connect_async(url)
        .await
        .map_err(|e| ConnectionError::Connect {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
    tracing::info!(url, "Event socket connected");

    let (mut write, read) = ws.split();
    let (sink, mut outbound) = EventSink::channel(OUTBOUND_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to encode outbound event");
                    continue;
                }
            };
            if let Err(e) = write.send(Message::Text(json.into())).await {
                tracing::warn!(error = %e, "Event socket write failed");
                return;
            }
        }
        let _ = write.close().await;
    });

    let inbound = read.filter_map(|frame| async move {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<InboundEvent>(text.as_str()) {
                Ok(event) => Some(Ok(event)),
                Err(e) => {
                    tracing::warn!(error = %e, "Ignoring unrecognized event");
                    None
                }
            },
            Ok(Message::Close(frame)) => Some(Err(ConnectionError::Disconnected {
                reason: frame
                    .map(|f| f.reason.as_str().to_string())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "closed by orchestrator".to_string()),
            })),
            Ok(_) => None,
            Err(e) => Some(Err(ConnectionError::Disconnected {
                reason: e.to_string(),
            })),
        }
    });

    Ok(EventSocket {
        sink,
        inbound: Box::pin(inbound),
        writer,
    })
}
