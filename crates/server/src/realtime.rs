//! WebSocket endpoint: one hub connection per socket, rooms joined by frame.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use server_api::{join_board, leave_board, ConnectionId};
use shared::{
    domain::UserId,
    error::{ApiError, ErrorCode},
    protocol::{ClientRequest, ServerMessage},
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use crate::{app_state::AppState, reject, ActorQuery, HttpError};

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<ActorQuery>,
) -> Result<impl IntoResponse, HttpError> {
    let actor = q.actor()?;
    server_api::authenticate(&state.api, actor)
        .await
        .map_err(reject)?;
    Ok(ws.on_upgrade(move |socket| ws_connection(state, socket, actor)))
}

async fn ws_connection(state: Arc<AppState>, socket: WebSocket, actor: UserId) {
    let (mut sender, mut receiver) = socket.split();
    let (connection, outbound) = state.api.hub.connect();
    info!(%connection, user_id = actor.0, "realtime connection opened");

    let mut outbound = UnboundedReceiverStream::new(outbound);
    let send_task = tokio::spawn(async move {
        while let Some(message) = outbound.next().await {
            let text = match serde_json::to_string(&message) {
                Ok(v) => v,
                Err(error) => {
                    warn!(%error, "dropping unserializable server message");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(frame)) = receiver.next().await {
        match frame {
            Message::Text(text) => handle_frame(&state, actor, connection, &text).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.api.hub.disconnect(connection);
    send_task.abort();
    info!(%connection, user_id = actor.0, "realtime connection closed");
}

async fn handle_frame(state: &AppState, actor: UserId, connection: ConnectionId, text: &str) {
    let reply = match serde_json::from_str::<ClientRequest>(text) {
        Ok(ClientRequest::JoinBoard { board_id }) => {
            match join_board(&state.api, actor, connection, board_id).await {
                Ok(()) => {
                    debug!(%connection, board_id = board_id.0, "joined board room");
                    ServerMessage::Joined { board_id }
                }
                Err(err) => ServerMessage::Error(err),
            }
        }
        Ok(ClientRequest::LeaveBoard { board_id }) => {
            leave_board(&state.api, connection, board_id);
            ServerMessage::Left { board_id }
        }
        Err(error) => ServerMessage::Error(ApiError::new(
            ErrorCode::Validation,
            format!("unreadable frame: {error}"),
        )),
    };
    state.api.hub.send_to(connection, reply);
}
