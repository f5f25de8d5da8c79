use std::{net::SocketAddr, sync::Arc};

use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequest, Path, Query, Request, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use serde::{de::DeserializeOwned, Deserialize};
use server_api::{ApiContext, BoardHub};
use shared::{
    domain::{BoardId, CardId, ListId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        BoardSnapshot, BoardSummary, CardPayload, CreateBoardRequest, CreateCardRequest,
        CreateListRequest, ListPayload, LoginRequest, LoginResponse, MoveCardRequest,
        MutationAck, ReorderCardsRequest, ReorderListsRequest, UpdateBoardRequest,
        UpdateCardRequest, UpdateListRequest,
    },
};
use storage::Storage;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

mod app_state;
mod config;
mod realtime;

use app_state::AppState;
use config::{load_settings, prepare_database_url};

type HttpError = (StatusCode, Json<ApiError>);

/// Actor of the request. Stands in for a session cookie.
#[derive(Debug, Deserialize)]
struct ActorQuery {
    user_id: Option<i64>,
}

impl ActorQuery {
    fn actor(&self) -> Result<UserId, HttpError> {
        self.user_id.map(UserId).ok_or_else(|| {
            reject(ApiError::new(
                ErrorCode::NotAuthorized,
                "user_id query parameter is required",
            ))
        })
    }
}

#[derive(Debug, Deserialize)]
struct BoardScopedQuery {
    user_id: Option<i64>,
    #[serde(rename = "boardId", alias = "board_id")]
    board_id: Option<i64>,
}

impl BoardScopedQuery {
    fn actor_and_board(&self) -> Result<(UserId, BoardId), HttpError> {
        let actor = ActorQuery {
            user_id: self.user_id,
        }
        .actor()?;
        let board_id = self.board_id.map(BoardId).ok_or_else(|| {
            reject(ApiError::new(
                ErrorCode::Validation,
                "boardId query parameter is required",
            ))
        })?;
        Ok((actor, board_id))
    }
}

/// JSON body whose rejections use the `{code, message}` error shape.
struct JsonBody<T>(T);

#[async_trait]
impl<S, T> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = HttpError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(body_rejection(rejection)),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let api = ApiContext::new(storage, Arc::new(BoardHub::new()))
        .with_persistence_timeout(settings.persistence_timeout());

    let state = AppState {
        api,
        max_body_bytes: settings.max_body_bytes,
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.bind_addr.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    let max_body_bytes = state.max_body_bytes;
    Router::new()
        .route("/healthz", get(healthz))
        .route("/login", post(login))
        .route("/boards", get(http_list_boards).post(http_create_board))
        .route(
            "/boards/:board_id",
            get(http_get_board)
                .put(http_update_board)
                .delete(http_delete_board),
        )
        .route("/boards/:board_id/reorder-lists", put(http_reorder_lists))
        .route("/lists", post(http_create_list))
        .route(
            "/lists/:list_id",
            put(http_update_list).delete(http_delete_list),
        )
        .route("/lists/:list_id/reorder-cards", put(http_reorder_cards))
        .route("/cards", post(http_create_card))
        .route(
            "/cards/:card_id",
            put(http_update_card).delete(http_delete_card),
        )
        .route("/cards/:card_id/move", put(http_move_card))
        .route("/ws", get(realtime::ws_handler))
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, HttpError> {
    state.api.storage.health_check().await.map_err(|e| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiError::new(ErrorCode::Persistence, e.to_string())),
        )
    })?;
    Ok("ok")
}

async fn login(
    State(state): State<Arc<AppState>>,
    JsonBody(req): JsonBody<LoginRequest>,
) -> Result<Json<LoginResponse>, HttpError> {
    let user_id = server_api::login(&state.api, &req.username)
        .await
        .map_err(reject)?;
    Ok(Json(LoginResponse { user_id }))
}

async fn http_list_boards(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ActorQuery>,
) -> Result<Json<Vec<BoardSummary>>, HttpError> {
    let boards = server_api::list_boards(&state.api, q.actor()?)
        .await
        .map_err(reject)?;
    Ok(Json(boards))
}

async fn http_create_board(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ActorQuery>,
    JsonBody(req): JsonBody<CreateBoardRequest>,
) -> Result<(StatusCode, Json<BoardSummary>), HttpError> {
    let board = server_api::create_board(&state.api, q.actor()?, &req.title)
        .await
        .map_err(reject)?;
    Ok((StatusCode::CREATED, Json(board)))
}

async fn http_get_board(
    State(state): State<Arc<AppState>>,
    Path(board_id): Path<i64>,
    Query(q): Query<ActorQuery>,
) -> Result<Json<BoardSnapshot>, HttpError> {
    let snapshot = server_api::get_board(&state.api, q.actor()?, BoardId(board_id))
        .await
        .map_err(reject)?;
    Ok(Json(snapshot))
}

async fn http_update_board(
    State(state): State<Arc<AppState>>,
    Path(board_id): Path<i64>,
    Query(q): Query<ActorQuery>,
    JsonBody(req): JsonBody<UpdateBoardRequest>,
) -> Result<Json<BoardSummary>, HttpError> {
    let board = server_api::update_board(&state.api, q.actor()?, BoardId(board_id), &req.title)
        .await
        .map_err(reject)?;
    Ok(Json(board))
}

async fn http_delete_board(
    State(state): State<Arc<AppState>>,
    Path(board_id): Path<i64>,
    Query(q): Query<ActorQuery>,
) -> Result<Json<MutationAck>, HttpError> {
    let event = server_api::delete_board(&state.api, q.actor()?, BoardId(board_id))
        .await
        .map_err(reject)?;
    Ok(ack("board deleted", vec![event]))
}

async fn http_reorder_lists(
    State(state): State<Arc<AppState>>,
    Path(board_id): Path<i64>,
    Query(q): Query<ActorQuery>,
    JsonBody(req): JsonBody<ReorderListsRequest>,
) -> Result<Json<MutationAck>, HttpError> {
    let event = server_api::reorder_lists(
        &state.api,
        q.actor()?,
        BoardId(board_id),
        &req.ordered_list_ids,
    )
    .await
    .map_err(reject)?;
    Ok(ack("lists reordered", vec![event]))
}

async fn http_create_list(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ActorQuery>,
    JsonBody(req): JsonBody<CreateListRequest>,
) -> Result<(StatusCode, Json<ListPayload>), HttpError> {
    let list = server_api::create_list(&state.api, q.actor()?, &req)
        .await
        .map_err(reject)?;
    Ok((StatusCode::CREATED, Json(list)))
}

async fn http_update_list(
    State(state): State<Arc<AppState>>,
    Path(list_id): Path<i64>,
    Query(q): Query<ActorQuery>,
    JsonBody(req): JsonBody<UpdateListRequest>,
) -> Result<Json<ListPayload>, HttpError> {
    let list = server_api::update_list(&state.api, q.actor()?, ListId(list_id), &req)
        .await
        .map_err(reject)?;
    Ok(Json(list))
}

async fn http_delete_list(
    State(state): State<Arc<AppState>>,
    Path(list_id): Path<i64>,
    Query(q): Query<BoardScopedQuery>,
) -> Result<Json<MutationAck>, HttpError> {
    let (actor, board_id) = q.actor_and_board()?;
    let event = server_api::delete_list(&state.api, actor, ListId(list_id), board_id)
        .await
        .map_err(reject)?;
    Ok(ack("list deleted", vec![event]))
}

async fn http_reorder_cards(
    State(state): State<Arc<AppState>>,
    Path(list_id): Path<i64>,
    Query(q): Query<ActorQuery>,
    JsonBody(req): JsonBody<ReorderCardsRequest>,
) -> Result<Json<MutationAck>, HttpError> {
    let event = server_api::reorder_cards(&state.api, q.actor()?, ListId(list_id), &req)
        .await
        .map_err(reject)?;
    Ok(ack("cards reordered", vec![event]))
}

async fn http_create_card(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ActorQuery>,
    JsonBody(req): JsonBody<CreateCardRequest>,
) -> Result<(StatusCode, Json<CardPayload>), HttpError> {
    let card = server_api::create_card(&state.api, q.actor()?, &req)
        .await
        .map_err(reject)?;
    Ok((StatusCode::CREATED, Json(card)))
}

async fn http_update_card(
    State(state): State<Arc<AppState>>,
    Path(card_id): Path<i64>,
    Query(q): Query<ActorQuery>,
    JsonBody(req): JsonBody<UpdateCardRequest>,
) -> Result<Json<CardPayload>, HttpError> {
    let card = server_api::update_card(&state.api, q.actor()?, CardId(card_id), &req)
        .await
        .map_err(reject)?;
    Ok(Json(card))
}

async fn http_delete_card(
    State(state): State<Arc<AppState>>,
    Path(card_id): Path<i64>,
    Query(q): Query<BoardScopedQuery>,
) -> Result<Json<MutationAck>, HttpError> {
    let (actor, board_id) = q.actor_and_board()?;
    let event = server_api::delete_card(&state.api, actor, CardId(card_id), board_id)
        .await
        .map_err(reject)?;
    Ok(ack("card deleted", vec![event]))
}

async fn http_move_card(
    State(state): State<Arc<AppState>>,
    Path(card_id): Path<i64>,
    Query(q): Query<ActorQuery>,
    JsonBody(req): JsonBody<MoveCardRequest>,
) -> Result<Json<MutationAck>, HttpError> {
    let events = server_api::move_card(&state.api, q.actor()?, CardId(card_id), &req)
        .await
        .map_err(reject)?;
    Ok(ack("card moved", events))
}

fn ack(message: &str, events: Vec<shared::protocol::BoardEvent>) -> Json<MutationAck> {
    Json(MutationAck {
        message: message.to_string(),
        events,
    })
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::NotAuthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Integrity => StatusCode::CONFLICT,
        ErrorCode::Persistence | ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(err: ApiError) -> HttpError {
    let status = status_for(err.code);
    if status.is_server_error() {
        error!(code = ?err.code, message = %err.message, "request failed");
    } else {
        debug!(code = ?err.code, message = %err.message, "request rejected");
    }
    (status, Json(err))
}

fn body_rejection(rejection: JsonRejection) -> HttpError {
    let status = match rejection.status() {
        StatusCode::PAYLOAD_TOO_LARGE => StatusCode::PAYLOAD_TOO_LARGE,
        _ => StatusCode::BAD_REQUEST,
    };
    (
        status,
        Json(ApiError::new(ErrorCode::Validation, rejection.body_text())),
    )
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
