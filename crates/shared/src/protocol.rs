use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{BoardId, CardId, ListId, UserId},
    error::ApiError,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardSummary {
    pub id: BoardId,
    pub title: String,
    pub owner: UserId,
    pub lists: Vec<ListId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListPayload {
    pub id: ListId,
    pub title: String,
    pub board: BoardId,
    pub cards: Vec<CardId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardPayload {
    pub id: CardId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub list: ListId,
}

/// A board with its lists and their cards, each in display order. `seq` is
/// the sequence number of the last event published for the board before the
/// snapshot was read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardSnapshot {
    pub id: BoardId,
    pub title: String,
    pub owner: UserId,
    pub lists: Vec<ListSnapshot>,
    #[serde(default)]
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListSnapshot {
    pub id: ListId,
    pub title: String,
    pub board: BoardId,
    pub cards: Vec<CardPayload>,
}

/// Mutation events fanned out to a board's room. Receivers replace state with
/// the payload; they never have to diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum BoardEvent {
    BoardUpdated {
        board_id: BoardId,
        new_title: String,
    },
    BoardDeleted {
        board_id: BoardId,
    },
    ListCreated(ListPayload),
    ListUpdated {
        list_id: ListId,
        new_title: String,
    },
    ListDeleted {
        list_id: ListId,
        board_id: BoardId,
    },
    ListsReordered {
        ordered_list_ids: Vec<ListId>,
    },
    CardCreated {
        new_card: CardPayload,
        list_id: ListId,
    },
    CardUpdated {
        updated_card: CardPayload,
    },
    CardDeleted {
        card_id: CardId,
        list_id: ListId,
    },
    CardsReordered {
        list_id: ListId,
        ordered_card_ids: Vec<CardId>,
    },
    CardMoved {
        card_id: CardId,
        source_list_id: ListId,
        dest_list_id: ListId,
    },
}

/// One delivered board event. `seq` increases by one per event published to
/// the board, in the order the server applied the mutations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardEnvelope {
    pub board_id: BoardId,
    pub seq: u64,
    pub event: BoardEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    BoardEvent(BoardEnvelope),
    Joined { board_id: BoardId },
    Left { board_id: BoardId },
    Error(ApiError),
}

/// Control messages a client sends over the realtime socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientRequest {
    JoinBoard { board_id: BoardId },
    LeaveBoard { board_id: BoardId },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateBoardRequest {
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateBoardRequest {
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReorderListsRequest {
    pub ordered_list_ids: Vec<ListId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateListRequest {
    pub title: String,
    pub board_id: BoardId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateListRequest {
    pub title: String,
    pub board_id: BoardId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReorderCardsRequest {
    pub ordered_card_ids: Vec<CardId>,
    pub board_id: BoardId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCardRequest {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub list_id: ListId,
    pub board_id: BoardId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCardRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub board_id: BoardId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveCardRequest {
    pub source_list_id: ListId,
    pub dest_list_id: ListId,
    pub board_id: BoardId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_index: Option<usize>,
}

/// Confirmation body for ordering mutations, echoing the events that were
/// published for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationAck {
    pub message: String,
    pub events: Vec<BoardEvent>,
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
