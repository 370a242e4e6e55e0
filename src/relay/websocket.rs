use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use warp::ws::{Message, WebSocket};

use super::hub::RelayHub;
use super::message::SignalMessage;

pub async fn handle_signal_socket(websocket: WebSocket, id: String, hub: Arc<RelayHub>) {
    let (mut ws_sender, mut ws_receiver) = websocket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let sender_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = ws_sender.send(message).await {
                tracing::error!(error = %e, "Failed to send WebSocket message");
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    if let Err(e) = hub.register(&id, tx.clone()).await {
        tracing::warn!(identity = %id, error = %e, "Rejecting signaling connection");
        if let Ok(text) = serde_json::to_string(&SignalMessage::IdTaken { id: id.clone() }) {
            let _ = tx.send(Message::text(text));
        }
        drop(tx);
        let _ = sender_task.await;
        return;
    }

    if let Ok(text) = serde_json::to_string(&SignalMessage::Open { id: id.clone() }) {
        let _ = tx.send(Message::text(text));
    }
    tracing::info!(identity = %id, "Signaling connection established");

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(message) => handle_socket_message(&hub, &id, &tx, message).await,
            Err(e) => {
                tracing::error!(identity = %id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    hub.unregister(&id, &tx).await;
    sender_task.abort();
    tracing::info!(identity = %id, "Signaling connection closed");
}

async fn handle_socket_message(
    hub: &RelayHub,
    id: &str,
    tx: &mpsc::UnboundedSender<Message>,
    message: Message,
) {
    let Ok(text) = message.to_str() else {
        return;
    };

    let parsed = match serde_json::from_str::<SignalMessage>(text) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::error!(identity = %id, error = %e, raw_message = %text, "Failed to parse signaling message");
            reply_error(tx, format!("Invalid message: {}", e));
            return;
        }
    };

    if let Err(e) = hub.route(id, parsed).await {
        tracing::warn!(identity = %id, error = %e, "Failed to route signaling message");
        reply_error(tx, e.to_string());
    }
}

fn reply_error(tx: &mpsc::UnboundedSender<Message>, message: String) {
    if let Ok(text) = serde_json::to_string(&SignalMessage::Error { message }) {
        let _ = tx.send(Message::text(text));
    }
}
