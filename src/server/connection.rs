use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use uuid::Uuid;

use super::AppState;
use crate::protocol::ClientMessage;
use crate::scheduler::{ConnectionId, ConsumerHandle, Scheduler};

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path((api_version, client_id)): Path<(String, String)>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, api_version, client_id, state))
}

/// Drive one worker connection: a writer task drains the outbound channel
/// while this task reads frames in order and feeds them to the scheduler.
async fn handle_socket(socket: WebSocket, api_version: String, client_id: String, state: AppState) {
    let connection_id = Uuid::new_v4();
    let (handle, mut outbound) = ConsumerHandle::channel(connection_id, state.outbound_capacity);
    let handle = handle.with_send_timeout(state.send_timeout);
    state
        .scheduler
        .register_connection(connection_id, client_id.clone(), handle)
        .await;
    tracing::info!(
        connection_id = %connection_id,
        client_id = %client_id,
        api_version = %api_version,
        "Worker connected"
    );

    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let text = match message.encode() {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(connection_id = %connection_id, error = %e, "Failed to encode message");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                tracing::debug!(connection_id = %connection_id, error = %e, "Socket write failed");
                break;
            }
        }
        if let Err(e) = sink.close().await {
            tracing::debug!(connection_id = %connection_id, error = %e, "Closing socket failed");
        }
    });

    loop {
        let frame = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                process_frame(&state.scheduler, connection_id, text.as_str()).await;
            }
            Some(Ok(Message::Binary(_))) => {
                tracing::warn!(connection_id = %connection_id, "Ignoring binary frame");
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::warn!(connection_id = %connection_id, error = %e, "Socket read failed");
                break;
            }
        }
    }

    state.scheduler.handle_disconnect(connection_id).await;
    writer.abort();
    tracing::info!(connection_id = %connection_id, client_id = %client_id, "Worker disconnected");
}

async fn process_frame(scheduler: &Scheduler, connection_id: ConnectionId, text: &str) {
    let result = match ClientMessage::decode(text) {
        Ok(message) => {
            tracing::debug!(
                connection_id = %connection_id,
                message_type = %message.message_type(),
                "Received message"
            );
            scheduler.handle_message(connection_id, message).await
        }
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        if e.is_protocol_error() {
            tracing::warn!(connection_id = %connection_id, error = %e, "Rejected message");
        } else {
            tracing::error!(connection_id = %connection_id, error = %e, "Failed to handle message");
        }
    }
}
