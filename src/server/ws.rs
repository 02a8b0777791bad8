//! Websocket transport adapter
//!
//! Splits the socket: a writer task drains the session's outbound frames
//! while this task reads client frames and feeds the [`SessionController`].

use super::AppState;
use crate::session::{Outbound, OutboundFrame, SessionController};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};

/// Frames still queued when the client leaves are dropped after this long
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let _guard = state.session_opened();
    let (outbound, out_rx) = Outbound::channel();
    let mut session = SessionController::new(
        state.engines.clone(),
        state.config.clone(),
        outbound,
        state.latency.clone(),
    );

    let span = info_span!("session", id = %session.id());
    async move {
        let (ws_tx, mut ws_rx) = socket.split();
        let (pong_tx, pong_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let writer = tokio::spawn(write_frames(ws_tx, out_rx, pong_rx).in_current_span());

        if let Err(e) = session.start() {
            warn!("Could not greet client: {}", e);
        }
        info!("Client connected ({} active)", state.active_sessions());

        while let Some(result) = ws_rx.next().await {
            let message = match result {
                Ok(message) => message,
                Err(e) => {
                    warn!("Websocket receive error: {}", e);
                    break;
                }
            };

            match message {
                Message::Text(text) => session.handle_text(&text).await,
                Message::Binary(data) => session.handle_binary(&data).await,
                Message::Ping(payload) => {
                    let _ = pong_tx.send(payload);
                }
                Message::Pong(_) => {}
                Message::Close(_) => break,
            }
        }

        // Cancels any in-flight turn and waits for its engines to be released
        session.shutdown().await;
        drop(pong_tx);
        let mut writer = writer;
        match tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Websocket writer ended abnormally: {}", e),
            Err(_) => {
                debug!("Websocket writer still draining, aborting");
                writer.abort();
            }
        }
        info!("Client disconnected");
    }
    .instrument(span)
    .await;
}

async fn write_frames(
    mut ws_tx: futures::stream::SplitSink<WebSocket, Message>,
    mut frames: mpsc::UnboundedReceiver<OutboundFrame>,
    mut pongs: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    loop {
        let message = tokio::select! {
            frame = frames.recv() => match frame {
                Some(OutboundFrame::Text(text)) => Message::Text(text),
                Some(OutboundFrame::Binary(bytes)) => Message::Binary(bytes),
                None => break,
            },
            Some(payload) = pongs.recv() => Message::Pong(payload),
        };
        if ws_tx.send(message).await.is_err() {
            debug!("Websocket closed while sending");
            break;
        }
    }
    let _ = ws_tx.close().await;
}
