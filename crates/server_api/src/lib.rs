pub mod broadcast;
pub mod locks;

use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use shared::{
    domain::{BoardId, CardId, EntityId, ListId, UserId},
    error::{ApiError, ErrorCode},
    ordering::{reorder_sequence, transfer_item, validate_permutation},
    protocol::{
        BoardEvent, BoardSnapshot, BoardSummary, CardPayload, CreateCardRequest,
        CreateListRequest, ListPayload, ListSnapshot, MoveCardRequest, ReorderCardsRequest,
        UpdateCardRequest, UpdateListRequest,
    },
};
use storage::{CardMove, Storage, StoredBoard, StoredCard, StoredList};
use tracing::{info, warn};

pub use broadcast::{BoardHub, ConnectionId};
pub use locks::BoardLocks;

pub const DEFAULT_PERSISTENCE_TIMEOUT: Duration = Duration::from_secs(5);
pub const MAX_TITLE_BYTES: usize = 256;
pub const MAX_DESCRIPTION_BYTES: usize = 16 * 1024;
const MAX_USERNAME_BYTES: usize = 64;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub hub: Arc<BoardHub>,
    pub locks: BoardLocks,
    pub persistence_timeout: Duration,
}

impl ApiContext {
    pub fn new(storage: Storage, hub: Arc<BoardHub>) -> Self {
        Self {
            storage,
            hub,
            locks: BoardLocks::new(),
            persistence_timeout: DEFAULT_PERSISTENCE_TIMEOUT,
        }
    }

    pub fn with_persistence_timeout(mut self, timeout: Duration) -> Self {
        self.persistence_timeout = timeout;
        self
    }
}

pub async fn login(ctx: &ApiContext, username: &str) -> Result<UserId, ApiError> {
    let username = username.trim();
    if username.is_empty() {
        return Err(ApiError::new(ErrorCode::Validation, "username is required"));
    }
    if username.len() > MAX_USERNAME_BYTES {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("username exceeds {MAX_USERNAME_BYTES} bytes"),
        ));
    }
    store(ctx, ctx.storage.create_user(username)).await
}

pub async fn create_board(
    ctx: &ApiContext,
    actor: UserId,
    title: &str,
) -> Result<BoardSummary, ApiError> {
    let title = clean_title(title, "board")?;
    authenticate(ctx, actor).await?;
    let board = store(ctx, ctx.storage.create_board(&title, actor)).await?;
    info!(board_id = board.board_id.0, owner = actor.0, "board created");
    Ok(board_summary(board, Vec::new()))
}

pub async fn list_boards(ctx: &ApiContext, actor: UserId) -> Result<Vec<BoardSummary>, ApiError> {
    authenticate(ctx, actor).await?;
    let boards = store(ctx, ctx.storage.list_boards_for_user(actor)).await?;
    let mut summaries = Vec::with_capacity(boards.len());
    for board in boards {
        let lists = store(ctx, ctx.storage.list_ids_for_board(board.board_id)).await?;
        summaries.push(board_summary(board, lists));
    }
    Ok(summaries)
}

/// Loads the board with its lists and cards in display order. Orderings that
/// are not dense are renumbered before the snapshot is read.
pub async fn get_board(
    ctx: &ApiContext,
    actor: UserId,
    board_id: BoardId,
) -> Result<BoardSnapshot, ApiError> {
    require_id(board_id, "boardId")?;
    let _guard = ctx.locks.acquire(board_id).await;
    ensure_board_owner(ctx, board_id, actor).await?;

    if !store(ctx, ctx.storage.orderings_are_dense(board_id)).await? {
        let changed = store(ctx, ctx.storage.repair_board_orderings(board_id)).await?;
        warn!(board_id = board_id.0, changed, "repaired non-dense board orderings");
    }

    let board = store(ctx, ctx.storage.load_board(board_id))
        .await?
        .ok_or_else(|| not_found("board"))?;
    let lists = store(ctx, ctx.storage.load_board_lists(board_id)).await?;
    let cards = store(ctx, ctx.storage.load_board_cards(board_id)).await?;

    let mut cards_by_list: HashMap<ListId, Vec<CardPayload>> = HashMap::new();
    for card in cards {
        cards_by_list
            .entry(card.list_id)
            .or_default()
            .push(card_payload(card));
    }

    Ok(BoardSnapshot {
        id: board.board_id,
        title: board.title,
        owner: board.owner,
        seq: ctx.hub.current_seq(board_id),
        lists: lists
            .into_iter()
            .map(|list| ListSnapshot {
                cards: cards_by_list.remove(&list.list_id).unwrap_or_default(),
                id: list.list_id,
                title: list.title,
                board: list.board_id,
            })
            .collect(),
    })
}

pub async fn update_board(
    ctx: &ApiContext,
    actor: UserId,
    board_id: BoardId,
    title: &str,
) -> Result<BoardSummary, ApiError> {
    require_id(board_id, "boardId")?;
    let title = clean_title(title, "board")?;
    let _guard = ctx.locks.acquire(board_id).await;
    ensure_board_owner(ctx, board_id, actor).await?;

    if !store(ctx, ctx.storage.rename_board(board_id, &title)).await? {
        return Err(not_found("board"));
    }
    let board = store(ctx, ctx.storage.load_board(board_id))
        .await?
        .ok_or_else(|| not_found("board"))?;
    let lists = store(ctx, ctx.storage.list_ids_for_board(board_id)).await?;

    ctx.hub.publish(
        board_id,
        BoardEvent::BoardUpdated {
            board_id,
            new_title: title,
        },
    );
    Ok(board_summary(board, lists))
}

/// Deletes the board with all of its lists and cards. Subscribers get one
/// `boardDeleted` and the room is closed.
pub async fn delete_board(
    ctx: &ApiContext,
    actor: UserId,
    board_id: BoardId,
) -> Result<BoardEvent, ApiError> {
    require_id(board_id, "boardId")?;
    let guard = ctx.locks.acquire(board_id).await;
    ensure_board_owner(ctx, board_id, actor).await?;

    if !store(ctx, ctx.storage.delete_board(board_id)).await? {
        return Err(not_found("board"));
    }
    let event = BoardEvent::BoardDeleted { board_id };
    ctx.hub.publish(board_id, event.clone());
    ctx.hub.close_room(board_id);
    drop(guard);
    ctx.locks.forget(board_id);
    info!(board_id = board_id.0, "board deleted");
    Ok(event)
}

pub async fn create_list(
    ctx: &ApiContext,
    actor: UserId,
    request: &CreateListRequest,
) -> Result<ListPayload, ApiError> {
    let board_id = request.board_id;
    require_id(board_id, "boardId")?;
    let title = clean_title(&request.title, "list")?;
    let _guard = ctx.locks.acquire(board_id).await;
    ensure_board_owner(ctx, board_id, actor).await?;

    let list = store(ctx, ctx.storage.create_list(board_id, &title)).await?;
    let payload = ListPayload {
        id: list.list_id,
        title: list.title,
        board: list.board_id,
        cards: Vec::new(),
    };
    ctx.hub
        .publish(board_id, BoardEvent::ListCreated(payload.clone()));
    Ok(payload)
}

pub async fn update_list(
    ctx: &ApiContext,
    actor: UserId,
    list_id: ListId,
    request: &UpdateListRequest,
) -> Result<ListPayload, ApiError> {
    let board_id = request.board_id;
    require_id(list_id, "listId")?;
    require_id(board_id, "boardId")?;
    let title = clean_title(&request.title, "list")?;
    let _guard = ctx.locks.acquire(board_id).await;
    ensure_board_owner(ctx, board_id, actor).await?;
    list_on_board(ctx, list_id, board_id).await?;

    if !store(ctx, ctx.storage.rename_list(list_id, &title)).await? {
        return Err(not_found("list"));
    }
    let cards = store(ctx, ctx.storage.card_ids_for_list(list_id)).await?;
    ctx.hub.publish(
        board_id,
        BoardEvent::ListUpdated {
            list_id,
            new_title: title.clone(),
        },
    );
    Ok(ListPayload {
        id: list_id,
        title,
        board: board_id,
        cards,
    })
}

/// Deletes the list and every card in it. One `listDeleted` covers the
/// cascade.
pub async fn delete_list(
    ctx: &ApiContext,
    actor: UserId,
    list_id: ListId,
    board_id: BoardId,
) -> Result<BoardEvent, ApiError> {
    require_id(list_id, "listId")?;
    require_id(board_id, "boardId")?;
    let _guard = ctx.locks.acquire(board_id).await;
    ensure_board_owner(ctx, board_id, actor).await?;
    list_on_board(ctx, list_id, board_id).await?;

    let cascaded = store(ctx, ctx.storage.delete_list(list_id))
        .await?
        .ok_or_else(|| not_found("list"))?;
    info!(
        board_id = board_id.0,
        list_id = list_id.0,
        cards = cascaded.len(),
        "list deleted"
    );
    let event = BoardEvent::ListDeleted { list_id, board_id };
    ctx.hub.publish(board_id, event.clone());
    Ok(event)
}

/// Replaces the board's list order. `ordered_list_ids` must be a permutation
/// of the board's current lists.
pub async fn reorder_lists(
    ctx: &ApiContext,
    actor: UserId,
    board_id: BoardId,
    ordered_list_ids: &[ListId],
) -> Result<BoardEvent, ApiError> {
    require_id(board_id, "boardId")?;
    let _guard = ctx.locks.acquire(board_id).await;
    ensure_board_owner(ctx, board_id, actor).await?;

    let current = store(ctx, ctx.storage.list_ids_for_board(board_id)).await?;
    validate_permutation(ordered_list_ids, &current)?;
    store(
        ctx,
        ctx.storage.set_board_list_order(board_id, ordered_list_ids),
    )
    .await?;

    let event = BoardEvent::ListsReordered {
        ordered_list_ids: ordered_list_ids.to_vec(),
    };
    ctx.hub.publish(board_id, event.clone());
    Ok(event)
}

pub async fn create_card(
    ctx: &ApiContext,
    actor: UserId,
    request: &CreateCardRequest,
) -> Result<CardPayload, ApiError> {
    let board_id = request.board_id;
    let list_id = request.list_id;
    require_id(list_id, "listId")?;
    require_id(board_id, "boardId")?;
    let title = clean_title(&request.title, "card")?;
    let description = clean_description(request.description.as_deref().unwrap_or_default())?;
    let _guard = ctx.locks.acquire(board_id).await;
    ensure_board_owner(ctx, board_id, actor).await?;
    list_on_board(ctx, list_id, board_id).await?;

    let card = store(ctx, ctx.storage.create_card(list_id, &title, description)).await?;
    let payload = card_payload(card);
    ctx.hub.publish(
        board_id,
        BoardEvent::CardCreated {
            new_card: payload.clone(),
            list_id,
        },
    );
    Ok(payload)
}

pub async fn update_card(
    ctx: &ApiContext,
    actor: UserId,
    card_id: CardId,
    request: &UpdateCardRequest,
) -> Result<CardPayload, ApiError> {
    let board_id = request.board_id;
    require_id(card_id, "cardId")?;
    require_id(board_id, "boardId")?;
    if request.title.is_none() && request.description.is_none() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "nothing to update: provide title or description",
        ));
    }
    let title = request
        .title
        .as_deref()
        .map(|title| clean_title(title, "card"))
        .transpose()?;
    let description = request
        .description
        .as_deref()
        .map(clean_description)
        .transpose()?;
    let _guard = ctx.locks.acquire(board_id).await;
    ensure_board_owner(ctx, board_id, actor).await?;
    card_on_board(ctx, card_id, board_id).await?;

    let card = store(
        ctx,
        ctx.storage
            .update_card(card_id, title.as_deref(), description),
    )
    .await?
    .ok_or_else(|| not_found("card"))?;
    let payload = card_payload(card);
    ctx.hub.publish(
        board_id,
        BoardEvent::CardUpdated {
            updated_card: payload.clone(),
        },
    );
    Ok(payload)
}

pub async fn delete_card(
    ctx: &ApiContext,
    actor: UserId,
    card_id: CardId,
    board_id: BoardId,
) -> Result<BoardEvent, ApiError> {
    require_id(card_id, "cardId")?;
    require_id(board_id, "boardId")?;
    let _guard = ctx.locks.acquire(board_id).await;
    ensure_board_owner(ctx, board_id, actor).await?;
    card_on_board(ctx, card_id, board_id).await?;

    let list_id = store(ctx, ctx.storage.delete_card(card_id))
        .await?
        .ok_or_else(|| not_found("card"))?;
    let event = BoardEvent::CardDeleted { card_id, list_id };
    ctx.hub.publish(board_id, event.clone());
    Ok(event)
}

/// Replaces one list's card order. `ordered_card_ids` must be a permutation
/// of the cards currently in the list.
pub async fn reorder_cards(
    ctx: &ApiContext,
    actor: UserId,
    list_id: ListId,
    request: &ReorderCardsRequest,
) -> Result<BoardEvent, ApiError> {
    let board_id = request.board_id;
    require_id(list_id, "listId")?;
    require_id(board_id, "boardId")?;
    let _guard = ctx.locks.acquire(board_id).await;
    ensure_board_owner(ctx, board_id, actor).await?;
    list_on_board(ctx, list_id, board_id).await?;

    let current = store(ctx, ctx.storage.card_ids_for_list(list_id)).await?;
    validate_permutation(&request.ordered_card_ids, &current)?;
    store(
        ctx,
        ctx.storage
            .set_list_card_order(list_id, &request.ordered_card_ids),
    )
    .await?;

    let event = BoardEvent::CardsReordered {
        list_id,
        ordered_card_ids: request.ordered_card_ids.clone(),
    };
    ctx.hub.publish(board_id, event.clone());
    Ok(event)
}

/// Moves a card within a list or across two lists of the same board.
///
/// Without `dest_index` the card is appended to the destination, unless it
/// is already there, in which case it keeps its slot. A retried cross-list
/// move therefore converges on the state of the first attempt. The new list
/// and both orderings are written in one transaction and one
/// `cardsReordered` is published per touched list, source first.
pub async fn move_card(
    ctx: &ApiContext,
    actor: UserId,
    card_id: CardId,
    request: &MoveCardRequest,
) -> Result<Vec<BoardEvent>, ApiError> {
    let board_id = request.board_id;
    let source_list_id = request.source_list_id;
    let dest_list_id = request.dest_list_id;
    require_id(card_id, "cardId")?;
    require_id(board_id, "boardId")?;
    require_id(source_list_id, "sourceListId")?;
    require_id(dest_list_id, "destListId")?;
    let _guard = ctx.locks.acquire(board_id).await;
    ensure_board_owner(ctx, board_id, actor).await?;
    list_on_board(ctx, source_list_id, board_id).await?;
    if dest_list_id != source_list_id {
        list_on_board(ctx, dest_list_id, board_id).await?;
    }

    let card = card_on_board(ctx, card_id, board_id).await?;
    if card.list_id != source_list_id && card.list_id != dest_list_id {
        return Err(ApiError::new(
            ErrorCode::Integrity,
            format!(
                "card {card_id} is in list {}, not in {source_list_id} or {dest_list_id}",
                card.list_id
            ),
        ));
    }

    let source_order = store(ctx, ctx.storage.card_ids_for_list(source_list_id)).await?;
    let dest_order = if dest_list_id == source_list_id {
        source_order.clone()
    } else {
        store(ctx, ctx.storage.card_ids_for_list(dest_list_id)).await?
    };
    let dest_index = request.dest_index.unwrap_or_else(|| {
        dest_order
            .iter()
            .position(|id| *id == card_id)
            .unwrap_or(dest_order.len())
    });

    let (new_source, new_dest) = if dest_list_id == source_list_id {
        let order = reorder_sequence(&source_order, card_id, dest_index)?;
        (order.clone(), order)
    } else {
        transfer_item(&source_order, &dest_order, card_id, dest_index)?
    };

    store(
        ctx,
        ctx.storage.apply_card_move(CardMove {
            card_id,
            source_list_id,
            dest_list_id,
            source_order: &new_source,
            dest_order: &new_dest,
        }),
    )
    .await?;

    let mut events = Vec::with_capacity(2);
    if dest_list_id != source_list_id {
        events.push(BoardEvent::CardsReordered {
            list_id: source_list_id,
            ordered_card_ids: new_source,
        });
    }
    events.push(BoardEvent::CardsReordered {
        list_id: dest_list_id,
        ordered_card_ids: new_dest,
    });
    for event in &events {
        ctx.hub.publish(board_id, event.clone());
    }
    Ok(events)
}

/// Adds a realtime connection to the board's room. Only the owner may join.
pub async fn join_board(
    ctx: &ApiContext,
    actor: UserId,
    connection: ConnectionId,
    board_id: BoardId,
) -> Result<(), ApiError> {
    require_id(board_id, "boardId")?;
    ensure_board_owner(ctx, board_id, actor).await?;
    if !ctx.hub.join(connection, board_id) {
        return Err(ApiError::new(ErrorCode::NotFound, "connection is closed"));
    }
    Ok(())
}

pub fn leave_board(ctx: &ApiContext, connection: ConnectionId, board_id: BoardId) -> bool {
    ctx.hub.leave(connection, board_id)
}

async fn store<T, F>(ctx: &ApiContext, operation: F) -> Result<T, ApiError>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(ctx.persistence_timeout, operation).await {
        Ok(result) => result.map_err(persistence),
        Err(_) => Err(ApiError::new(
            ErrorCode::Persistence,
            format!(
                "store did not answer within {} ms",
                ctx.persistence_timeout.as_millis()
            ),
        )),
    }
}

/// Rejects actors that never logged in.
pub async fn authenticate(ctx: &ApiContext, actor: UserId) -> Result<(), ApiError> {
    match store(ctx, ctx.storage.username_for_user(actor)).await? {
        Some(_) => Ok(()),
        None => Err(ApiError::new(ErrorCode::NotAuthorized, "unknown user")),
    }
}

async fn ensure_board_owner(
    ctx: &ApiContext,
    board_id: BoardId,
    actor: UserId,
) -> Result<(), ApiError> {
    let owner = store(ctx, ctx.storage.board_owner(board_id))
        .await?
        .ok_or_else(|| not_found("board"))?;
    if owner != actor {
        return Err(ApiError::new(
            ErrorCode::NotAuthorized,
            "user does not own this board",
        ));
    }
    Ok(())
}

/// A list on some other board is reported exactly like a missing one.
async fn list_on_board(
    ctx: &ApiContext,
    list_id: ListId,
    board_id: BoardId,
) -> Result<StoredList, ApiError> {
    store(ctx, ctx.storage.load_list(list_id))
        .await?
        .filter(|list| list.board_id == board_id)
        .ok_or_else(|| not_found("list"))
}

async fn card_on_board(
    ctx: &ApiContext,
    card_id: CardId,
    board_id: BoardId,
) -> Result<StoredCard, ApiError> {
    let card = store(ctx, ctx.storage.load_card(card_id))
        .await?
        .ok_or_else(|| not_found("card"))?;
    list_on_board(ctx, card.list_id, board_id)
        .await
        .map_err(|_| not_found("card"))?;
    Ok(card)
}

fn require_id<T: EntityId>(id: T, field: &str) -> Result<(), ApiError> {
    if id.raw() <= 0 {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("{field} is required"),
        ));
    }
    Ok(())
}

fn clean_title(raw: &str, entity: &str) -> Result<String, ApiError> {
    let title = raw.trim();
    if title.is_empty() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("{entity} title is required"),
        ));
    }
    if title.len() > MAX_TITLE_BYTES {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("{entity} title exceeds {MAX_TITLE_BYTES} bytes"),
        ));
    }
    Ok(title.to_string())
}

fn clean_description(raw: &str) -> Result<&str, ApiError> {
    if raw.len() > MAX_DESCRIPTION_BYTES {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("description exceeds {MAX_DESCRIPTION_BYTES} bytes"),
        ));
    }
    Ok(raw)
}

fn board_summary(board: StoredBoard, lists: Vec<ListId>) -> BoardSummary {
    BoardSummary {
        id: board.board_id,
        title: board.title,
        owner: board.owner,
        lists,
        created_at: board.created_at,
        updated_at: board.updated_at,
    }
}

fn card_payload(card: StoredCard) -> CardPayload {
    CardPayload {
        id: card.card_id,
        title: card.title,
        description: card.description,
        list: card.list_id,
    }
}

fn not_found(entity: &str) -> ApiError {
    ApiError::new(ErrorCode::NotFound, format!("{entity} not found"))
}

fn persistence(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Persistence, format!("{err:#}"))
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
