//! Dedicated writer task: every outbound JSON-RPC frame is serialized
//! through one mpsc channel so only one task ever owns the WebSocket
//! sink.

use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::warn;

pub type TextSender = mpsc::UnboundedSender<String>;

/// Spawns the writer task and returns a sender for outbound text frames
/// plus the task's join handle (used by the caller to detect the sink
/// dying without the reader noticing).
pub fn spawn_writer<S>(mut sink: S) -> (TextSender, JoinHandle<()>)
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: std::fmt::Display,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let handle = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if let Err(e) = sink.send(Message::Text(text)).await {
                warn!(error = %e, "tunnel writer failed to send frame, exiting");
                break;
            }
        }
        let _ = sink.close().await;
    });

    (tx, handle)
}
