//! The two halves of a connection.
//!
//! [`read_pump`] moves frames from the socket into the hub, [`write_pump`]
//! moves a participant's outbound queue onto the socket. Both are generic
//! over `futures` streams and sinks of WebSocket messages so the same code
//! drives an axum `WebSocket` and the in-memory channels used in tests.

use std::{fmt::Display, time::Duration};

use axum::extract::ws::Message as Frame;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::time::timeout;
use tracing::debug;

use crate::{hub::HubHandle, participant::Outbox};

/// Forwards every text frame to the hub until the connection closes, a read
/// fails, or the hub goes away. Any of those ends the pump the same way.
pub async fn read_pump<S, E>(mut stream: S, hub: &HubHandle)
where
    S: Stream<Item = Result<Frame, E>> + Unpin,
    E: Display,
{
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Frame::Text(text)) => {
                if let Err(error) = hub.forward(text.into()) {
                    debug!(%error, "dropping inbound message");
                    break;
                }
            }
            Ok(Frame::Binary(payload)) => {
                debug!(len = payload.len(), "ignoring binary frame");
            }
            Ok(Frame::Close(_)) => break,
            // Pings are answered by the websocket layer.
            Ok(Frame::Ping(_) | Frame::Pong(_)) => {}
            Err(error) => {
                debug!(%error, "read failed");
                break;
            }
        }
    }
}

/// Writes queued messages as text frames until the queue is closed and
/// drained, or a write fails or takes longer than `write_timeout`. The sink
/// is closed on the way out.
pub async fn write_pump<S>(mut sink: S, mut outbox: Outbox, write_timeout: Duration)
where
    S: Sink<Frame> + Unpin,
    S::Error: Display,
{
    while let Some(message) = outbox.recv().await {
        match timeout(write_timeout, sink.send(Frame::Text(message.to_string()))).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                debug!(%error, "write failed");
                break;
            }
            Err(_) => {
                debug!(?write_timeout, "write timed out");
                break;
            }
        }
    }

    // The peer may already be gone; closing twice is harmless. A stalled
    // peer gets the same deadline as a write.
    match timeout(write_timeout, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => debug!(%error, "close after write pump failed"),
        Err(_) => debug!(?write_timeout, "close timed out"),
    }
}
