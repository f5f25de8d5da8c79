use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{BoardId, CardId, ListId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        BoardEnvelope, BoardEvent, BoardSnapshot, BoardSummary, ClientRequest, CreateBoardRequest,
        LoginRequest, LoginResponse, MutationAck, ServerMessage,
    },
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
    time::Duration,
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

pub mod reconciler;

use reconciler::{Action, BoardModel, BoardState, Intent, MutationRequest, ReconcileError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not logged in")]
    NotLoggedIn,
    #[error("no board is open")]
    NoOpenBoard,
    #[error("server rejected request ({:?}): {}", .0.code, .0.message)]
    Api(ApiError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

#[derive(Debug, Clone)]
pub struct Session {
    pub server_url: String,
    pub user_id: UserId,
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    BoardOpened(BoardState),
    /// The rendered board changed, either optimistically or from the server.
    BoardChanged(BoardState),
    BoardClosed(BoardId),
    Joined(BoardId),
    Left(BoardId),
    Disconnected,
    /// Something the user should see as a notification.
    Error(String),
}

/// Sends confirmed-order mutations to the server.
#[async_trait]
pub trait MutationTransport: Send + Sync {
    async fn send(
        &self,
        session: &Session,
        request: &MutationRequest,
    ) -> std::result::Result<MutationAck, ApiError>;
}

pub struct HttpMutationTransport {
    http: Client,
}

impl HttpMutationTransport {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl MutationTransport for HttpMutationTransport {
    async fn send(
        &self,
        session: &Session,
        request: &MutationRequest,
    ) -> std::result::Result<MutationAck, ApiError> {
        let base = &session.server_url;
        let builder = match request {
            MutationRequest::ReorderLists { board_id, body } => self
                .http
                .put(format!("{base}/boards/{board_id}/reorder-lists"))
                .json(body),
            MutationRequest::ReorderCards { list_id, body } => self
                .http
                .put(format!("{base}/lists/{list_id}/reorder-cards"))
                .json(body),
            MutationRequest::MoveCard { card_id, body } => self
                .http
                .put(format!("{base}/cards/{card_id}/move"))
                .json(body),
        };
        send_json(builder.query(&[("user_id", session.user_id.0)])).await
    }
}

async fn send_json<T: DeserializeOwned>(builder: RequestBuilder) -> std::result::Result<T, ApiError> {
    let response = builder
        .send()
        .await
        .map_err(|e| ApiError::new(ErrorCode::Internal, format!("request failed: {e}")))?;
    decode(response).await
}

async fn decode<T: DeserializeOwned>(response: Response) -> std::result::Result<T, ApiError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|e| ApiError::new(ErrorCode::Internal, format!("unreadable response: {e}")));
    }
    match response.json::<ApiError>().await {
        Ok(err) => Err(err),
        Err(_) => Err(ApiError::new(
            ErrorCode::Internal,
            format!("server returned {status}"),
        )),
    }
}

const SYNC_ATTEMPTS: u32 = 3;
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

struct OpenBoard {
    board_id: BoardId,
    /// `None` until the first snapshot arrives.
    model: Option<BoardModel>,
    /// Set while a snapshot is being fetched; events are kept in `buffered`.
    syncing: bool,
    buffered: Vec<BoardEnvelope>,
    last_seq: u64,
}

struct Socket {
    outbound: mpsc::UnboundedSender<ClientRequest>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

#[derive(Default)]
struct BoardClientState {
    session: Option<Session>,
    socket: Option<Socket>,
    open: Option<OpenBoard>,
}

pub struct BoardClient {
    http: Client,
    transport: Arc<dyn MutationTransport>,
    inner: Mutex<BoardClientState>,
    events: broadcast::Sender<ClientEvent>,
}

impl BoardClient {
    pub fn new() -> Arc<Self> {
        let http = Client::new();
        let transport = Arc::new(HttpMutationTransport::new(http.clone()));
        Self::with_transport(http, transport)
    }

    pub fn with_transport(http: Client, transport: Arc<dyn MutationTransport>) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            http,
            transport,
            inner: Mutex::new(BoardClientState::default()),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Logs in and opens the realtime connection. A previous session and its
    /// socket are dropped first.
    pub async fn login(self: &Arc<Self>, server_url: &str, username: &str) -> Result<UserId> {
        let server_url = server_url.trim_end_matches('/').to_string();
        let body: LoginResponse = send_json(self.http.post(format!("{server_url}/login")).json(
            &LoginRequest {
                username: username.to_string(),
            },
        ))
        .await
        .map_err(ClientError::Api)?;

        let session = Session {
            server_url,
            user_id: body.user_id,
        };
        {
            let mut guard = self.inner.lock().await;
            if let Some(socket) = guard.socket.take() {
                socket.reader.abort();
                socket.writer.abort();
            }
            guard.open = None;
            guard.session = Some(session.clone());
        }

        let socket = self.spawn_ws_events(&session).await?;
        self.inner.lock().await.socket = Some(socket);
        info!(user_id = body.user_id.0, "logged in");
        Ok(body.user_id)
    }

    pub async fn list_boards(&self) -> Result<Vec<BoardSummary>> {
        let session = self.session().await?;
        let boards = send_json(
            self.http
                .get(format!("{}/boards", session.server_url))
                .query(&[("user_id", session.user_id.0)]),
        )
        .await
        .map_err(ClientError::Api)?;
        Ok(boards)
    }

    pub async fn create_board(&self, title: &str) -> Result<BoardSummary> {
        let session = self.session().await?;
        let board = send_json(
            self.http
                .post(format!("{}/boards", session.server_url))
                .query(&[("user_id", session.user_id.0)])
                .json(&CreateBoardRequest {
                    title: title.to_string(),
                }),
        )
        .await
        .map_err(ClientError::Api)?;
        Ok(board)
    }

    /// Joins the board's room, waits for the server to confirm, then loads the
    /// snapshot. Events that arrive while the snapshot is in flight are
    /// replayed on top of it.
    pub async fn open_board(&self, board_id: BoardId) -> Result<BoardState> {
        let session = self.session().await?;
        let mut acks = self.events.subscribe();
        let has_socket = {
            let mut guard = self.inner.lock().await;
            if let Some(previous) = guard.open.take() {
                send_request(&guard, ClientRequest::LeaveBoard {
                    board_id: previous.board_id,
                });
            }
            guard.open = Some(OpenBoard {
                board_id,
                model: None,
                syncing: true,
                buffered: Vec::new(),
                last_seq: 0,
            });
            send_request(&guard, ClientRequest::JoinBoard { board_id });
            guard.socket.is_some()
        };
        if has_socket {
            wait_for_join(&mut acks, board_id).await;
        }

        match self.sync_board(&session, board_id).await {
            Ok(view) => {
                let _ = self.events.send(ClientEvent::BoardOpened(view.clone()));
                Ok(view)
            }
            Err(err) => {
                let mut guard = self.inner.lock().await;
                if guard.open.as_ref().map(|open| open.board_id) == Some(board_id) {
                    guard.open = None;
                    send_request(&guard, ClientRequest::LeaveBoard { board_id });
                }
                Err(err)
            }
        }
    }

    /// Fetches the snapshot and replays buffered events newer than it. A hole
    /// in the buffered sequence means the snapshot is already stale, so it is
    /// fetched again.
    async fn sync_board(&self, session: &Session, board_id: BoardId) -> Result<BoardState> {
        for attempt in 1..=SYNC_ATTEMPTS {
            let snapshot: BoardSnapshot = send_json(
                self.http
                    .get(format!("{}/boards/{board_id}", session.server_url))
                    .query(&[("user_id", session.user_id.0)]),
            )
            .await
            .map_err(ClientError::Api)?;

            let mut guard = self.inner.lock().await;
            let open = guard
                .open
                .as_mut()
                .filter(|open| open.board_id == board_id)
                .ok_or(ClientError::NoOpenBoard)?;

            let mut model = BoardModel::new(&snapshot);
            let mut last_seq = snapshot.seq;
            let mut buffered = std::mem::take(&mut open.buffered);
            buffered.sort_by_key(|envelope| envelope.seq);
            buffered.retain(|envelope| envelope.seq > last_seq);
            let mut pending = buffered.into_iter().peekable();
            while let Some(envelope) = pending.next_if(|envelope| envelope.seq == last_seq + 1) {
                last_seq = envelope.seq;
                let _ = model.apply(Action::Authoritative(envelope.event));
            }
            let rest: Vec<BoardEnvelope> = pending.collect();
            if !rest.is_empty() {
                debug!(
                    board_id = board_id.0,
                    attempt,
                    snapshot_seq = snapshot.seq,
                    "snapshot is behind buffered events; fetching again"
                );
                open.buffered = rest;
                continue;
            }

            let view = model.view().clone();
            open.model = Some(model);
            open.last_seq = last_seq;
            open.syncing = false;
            return Ok(view);
        }
        Err(anyhow!(
            "board {board_id} kept changing while its snapshot was loading"
        ))
    }

    /// Reloads the open board after a missed event.
    async fn resync(&self, board_id: BoardId) {
        let result = match self.session().await {
            Ok(session) => self.sync_board(&session, board_id).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(view) => {
                let _ = self.events.send(ClientEvent::BoardChanged(view));
            }
            Err(error) => {
                warn!(board_id = board_id.0, %error, "board reload failed");
                let mut guard = self.inner.lock().await;
                if let Some(open) = guard.open.as_mut().filter(|open| open.board_id == board_id) {
                    open.syncing = false;
                }
                let _ = self
                    .events
                    .send(ClientEvent::Error(format!("board reload failed: {error}")));
            }
        }
    }

    pub async fn close_board(&self) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let open = guard.open.take().ok_or(ClientError::NoOpenBoard)?;
        send_request(&guard, ClientRequest::LeaveBoard {
            board_id: open.board_id,
        });
        let _ = self.events.send(ClientEvent::BoardClosed(open.board_id));
        Ok(())
    }

    /// Current rendered state of the open board.
    pub async fn view(&self) -> Option<BoardState> {
        let guard = self.inner.lock().await;
        guard
            .open
            .as_ref()
            .and_then(|open| open.model.as_ref())
            .map(|model| model.view().clone())
    }

    pub async fn move_list(&self, list_id: ListId, to_index: usize) -> Result<MutationAck> {
        self.dispatch(Intent::MoveList { list_id, to_index }).await
    }

    pub async fn reorder_card(
        &self,
        list_id: ListId,
        card_id: CardId,
        to_index: usize,
    ) -> Result<MutationAck> {
        self.dispatch(Intent::ReorderCard {
            list_id,
            card_id,
            to_index,
        })
        .await
    }

    pub async fn move_card(
        &self,
        card_id: CardId,
        source_list_id: ListId,
        dest_list_id: ListId,
        dest_index: usize,
    ) -> Result<MutationAck> {
        self.dispatch(Intent::MoveCard {
            card_id,
            source_list_id,
            dest_list_id,
            dest_index,
        })
        .await
    }

    /// Applies the intent locally, sends it, and reverts every optimistic
    /// change if the server refuses.
    async fn dispatch(&self, intent: Intent) -> Result<MutationAck> {
        let (session, request) = {
            let mut guard = self.inner.lock().await;
            let session = guard.session.clone().ok_or(ClientError::NotLoggedIn)?;
            let model = guard
                .open
                .as_mut()
                .and_then(|open| open.model.as_mut())
                .ok_or(ClientError::NoOpenBoard)?;
            let request = model
                .apply(Action::Optimistic(intent))
                .map_err(ClientError::from)?
                .ok_or_else(|| anyhow!("intent produced no request"))?;
            let _ = self
                .events
                .send(ClientEvent::BoardChanged(model.view().clone()));
            (session, request)
        };

        match self.transport.send(&session, &request).await {
            Ok(ack) => Ok(ack),
            Err(err) => {
                warn!(code = ?err.code, message = %err.message, "mutation failed; reverting");
                let mut guard = self.inner.lock().await;
                if let Some(model) = guard.open.as_mut().and_then(|open| open.model.as_mut()) {
                    let _ = model.apply(Action::Revert);
                    let _ = self
                        .events
                        .send(ClientEvent::BoardChanged(model.view().clone()));
                }
                let _ = self.events.send(ClientEvent::Error(err.message.clone()));
                Err(ClientError::Api(err).into())
            }
        }
    }

    async fn handle_server_message(&self, message: ServerMessage) {
        match message {
            ServerMessage::BoardEvent(envelope) => self.handle_envelope(envelope).await,
            ServerMessage::Joined { board_id } => {
                let _ = self.events.send(ClientEvent::Joined(board_id));
            }
            ServerMessage::Left { board_id } => {
                let _ = self.events.send(ClientEvent::Left(board_id));
            }
            ServerMessage::Error(err) => {
                let _ = self.events.send(ClientEvent::Error(err.message));
            }
        }
    }

    /// Drops events for boards that are not open and anything at or below
    /// the last applied sequence number. A skipped number triggers a reload.
    async fn handle_envelope(&self, envelope: BoardEnvelope) {
        let missed = {
            let mut guard = self.inner.lock().await;
            let Some(open) = guard.open.as_mut() else {
                debug!(board_id = envelope.board_id.0, "ignoring event: no board open");
                return;
            };
            if open.board_id != envelope.board_id {
                debug!(board_id = envelope.board_id.0, "ignoring event for another board");
                return;
            }
            if open.syncing {
                open.buffered.push(envelope);
                return;
            }
            let Some(model) = open.model.as_mut() else {
                open.buffered.push(envelope);
                return;
            };
            if envelope.seq <= open.last_seq {
                debug!(seq = envelope.seq, "ignoring duplicate event");
                return;
            }
            if envelope.seq != open.last_seq + 1 {
                warn!(
                    board_id = open.board_id.0,
                    expected = open.last_seq + 1,
                    got = envelope.seq,
                    "missed board events; reloading"
                );
                open.syncing = true;
                open.buffered.push(envelope);
                Some(open.board_id)
            } else {
                open.last_seq = envelope.seq;
                let deleted = matches!(envelope.event, BoardEvent::BoardDeleted { .. });
                let _ = model.apply(Action::Authoritative(envelope.event));
                let _ = self
                    .events
                    .send(ClientEvent::BoardChanged(model.view().clone()));
                if deleted {
                    let board_id = open.board_id;
                    guard.open = None;
                    let _ = self.events.send(ClientEvent::BoardClosed(board_id));
                }
                None
            }
        };

        if let Some(board_id) = missed {
            self.resync(board_id).await;
        }
    }

    async fn session(&self) -> Result<Session> {
        let guard = self.inner.lock().await;
        Ok(guard.session.clone().ok_or(ClientError::NotLoggedIn)?)
    }

    async fn spawn_ws_events(self: &Arc<Self>, session: &Session) -> Result<Socket> {
        let ws_url = ws_url(session)?;
        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {ws_url}"))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outbound, outbound_rx) = mpsc::unbounded_channel::<ClientRequest>();
        let writer = tokio::spawn(async move {
            let mut outbound_rx = UnboundedReceiverStream::new(outbound_rx);
            while let Some(request) = outbound_rx.next().await {
                let text = match serde_json::to_string(&request) {
                    Ok(v) => v,
                    Err(error) => {
                        warn!(%error, "dropping unserializable client request");
                        continue;
                    }
                };
                if ws_writer.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        let client = Arc::clone(self);
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(message) => client.handle_server_message(message).await,
                        Err(error) => warn!(%error, "unreadable server frame"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            let _ = client.events.send(ClientEvent::Disconnected);
        });

        Ok(Socket {
            outbound,
            reader,
            writer,
        })
    }
}

/// Waits for the server to confirm the join. A refused join or a timeout
/// falls through to the snapshot request, which reports the real error.
async fn wait_for_join(acks: &mut broadcast::Receiver<ClientEvent>, board_id: BoardId) {
    let confirmed = tokio::time::timeout(JOIN_TIMEOUT, async {
        loop {
            match acks.recv().await {
                Ok(ClientEvent::Joined(joined)) if joined == board_id => return true,
                Ok(ClientEvent::Error(_)) | Err(broadcast::error::RecvError::Closed) => {
                    return false
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            }
        }
    })
    .await;
    if !matches!(confirmed, Ok(true)) {
        warn!(board_id = board_id.0, "join was not confirmed");
    }
}

fn send_request(state: &BoardClientState, request: ClientRequest) {
    let Some(socket) = state.socket.as_ref() else {
        return;
    };
    if socket.outbound.send(request).is_err() {
        warn!("realtime connection is gone; request not sent");
    }
}

fn ws_url(session: &Session) -> Result<Url> {
    let mut url = Url::parse(&session.server_url)
        .with_context(|| format!("invalid server url: {}", session.server_url))?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => return Err(anyhow!("server_url must be http or https, got {other}")),
    };
    url.set_scheme(scheme)
        .map_err(|()| anyhow!("cannot switch {} to {scheme}", session.server_url))?;
    url.set_path("/ws");
    url.query_pairs_mut()
        .clear()
        .append_pair("user_id", &session.user_id.0.to_string());
    Ok(url)
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
