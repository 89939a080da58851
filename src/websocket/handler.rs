use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, Utf8Bytes, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::hub::ChannelMessage;
use crate::metrics::ProtocolMetrics;
use crate::server::AppState;

use super::message::{ClientMessage, CloseReason, ServerMessage};
use super::session::{ConnectionState, Session};

/// Buffer for protocol replies and the final close frame
const CONTROL_BUFFER_SIZE: usize = 8;

/// Time allowed for the writer to flush the close frame
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Frames queued for the socket writer
enum Outbound {
    Reply(ServerMessage),
    Close(CloseReason),
}

/// WebSocket upgrade handler
#[tracing::instrument(name = "ws.upgrade", skip(ws, state))]
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle an established WebSocket connection
#[tracing::instrument(name = "ws.connection", skip(socket, state))]
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (control_tx, control_rx) = mpsc::channel::<Outbound>(CONTROL_BUFFER_SIZE);
    let (delivery_tx, delivery_rx) =
        mpsc::channel::<ChannelMessage>(state.settings.websocket.send_buffer.max(1));

    let (ws_sender, mut ws_receiver) = socket.split();
    let writer = tokio::spawn(write_loop(ws_sender, control_rx, delivery_rx));

    let mut session = Session::new(state.hub.clone(), state.gate.clone(), delivery_tx);
    let auth_timeout = Duration::from_secs(state.settings.websocket.auth_timeout);

    let outcome = read_loop(&mut session, &mut ws_receiver, &control_tx, auth_timeout).await;

    // Deregistration must complete before the client can observe the close
    session.close().await;
    drop(session);

    if let Err(reason) = outcome {
        ProtocolMetrics::record_refused(reason.code());
        let queued =
            tokio::time::timeout(WRITER_DRAIN_TIMEOUT, control_tx.send(Outbound::Close(reason)))
                .await;
        if !matches!(queued, Ok(Ok(()))) {
            tracing::debug!(code = reason.code(), "Close frame not queued");
        }
    }
    drop(control_tx);

    drain_writer(writer, WRITER_DRAIN_TIMEOUT).await;

    tracing::debug!("WebSocket connection closed");
}

/// Wait for the writer to flush, aborting it when the peer stops reading
async fn drain_writer(writer: JoinHandle<()>, limit: Duration) {
    let abort = writer.abort_handle();
    if tokio::time::timeout(limit, writer).await.is_err() {
        tracing::warn!("WebSocket writer did not finish in time, aborting");
        abort.abort();
    }
}

/// Feed incoming frames to the session until the connection ends.
///
/// Returns the close reason when the server terminates the connection.
async fn read_loop(
    session: &mut Session,
    receiver: &mut SplitStream<WebSocket>,
    control: &mpsc::Sender<Outbound>,
    auth_timeout: Duration,
) -> Result<(), CloseReason> {
    let auth_deadline = Instant::now() + auth_timeout;

    loop {
        let next = if session.state() == ConnectionState::Unauthenticated {
            match tokio::time::timeout_at(auth_deadline, receiver.next()).await {
                Ok(next) => next,
                Err(_) => {
                    tracing::warn!("No authentication before timeout");
                    return Err(CloseReason::AuthExpected);
                }
            }
        } else {
            receiver.next().await
        };

        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                tracing::debug!(error = %e, "WebSocket receive error");
                return Ok(());
            }
            None => return Ok(()),
        };

        let command = match frame {
            Message::Text(text) => ClientMessage::parse(text.as_str()),
            Message::Binary(_) => ClientMessage::Unknown,
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => {
                tracing::debug!(client_id = ?session.client_id(), "Received close frame");
                return Ok(());
            }
        };

        let reply = session.handle(command).await?;
        if control.send(Outbound::Reply(reply)).await.is_err() {
            return Ok(());
        }
    }
}

/// Write replies and channel messages to the socket.
///
/// Replies take priority over channel messages. Stops after a close frame or
/// once both queues are closed.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut control: mpsc::Receiver<Outbound>,
    mut deliveries: mpsc::Receiver<ChannelMessage>,
) {
    loop {
        let outbound = tokio::select! {
            biased;
            Some(outbound) = control.recv() => outbound,
            Some(message) = deliveries.recv() => Outbound::Reply(message.into()),
            else => break,
        };

        match outbound {
            Outbound::Reply(message) => {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to serialize message");
                        continue;
                    }
                };

                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            Outbound::Close(reason) => {
                let frame = CloseFrame {
                    code: reason.code(),
                    reason: Utf8Bytes::from_static(reason.reason()),
                };
                if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                    tracing::debug!(error = %e, "Failed to send close frame");
                }
                break;
            }
        }
    }
}
