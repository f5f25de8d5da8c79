//! Client-side board model with optimistic updates.
//!
//! The model keeps two copies of the board: `confirmed`, built only from the
//! snapshot and authoritative server events, and `view`, which is `confirmed`
//! plus whatever the user has dragged but the server has not yet answered.
//! Everything goes through [`BoardModel::apply`].

use std::collections::{HashMap, HashSet};

use shared::{
    domain::{BoardId, CardId, CardPlacement, ListId},
    ordering::{append_item, remove_item, reorder_sequence, transfer_item, OrderingError},
    protocol::{
        BoardEvent, BoardSnapshot, CardPayload, MoveCardRequest, ReorderCardsRequest,
        ReorderListsRequest,
    },
};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconcileError {
    #[error(transparent)]
    Ordering(#[from] OrderingError),
    #[error("list {0} is not on this board")]
    UnknownList(ListId),
    #[error("card {card_id} is not in list {list_id}")]
    CardNotInList { card_id: CardId, list_id: ListId },
    #[error("board has been deleted")]
    BoardDeleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardState {
    pub id: CardId,
    pub title: String,
    pub description: String,
    pub placement: CardPlacement,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListState {
    pub id: ListId,
    pub title: String,
    pub cards: Vec<CardId>,
}

/// One copy of a board as the client renders it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardState {
    pub id: BoardId,
    pub title: String,
    pub deleted: bool,
    pub list_order: Vec<ListId>,
    pub lists: HashMap<ListId, ListState>,
    pub cards: HashMap<CardId, CardState>,
}

impl BoardState {
    pub fn from_snapshot(snapshot: &BoardSnapshot) -> Self {
        let mut lists = HashMap::with_capacity(snapshot.lists.len());
        let mut cards = HashMap::new();
        for list in &snapshot.lists {
            for card in &list.cards {
                cards.insert(card.id, card_state(card, list.id));
            }
            lists.insert(
                list.id,
                ListState {
                    id: list.id,
                    title: list.title.clone(),
                    cards: list.cards.iter().map(|card| card.id).collect(),
                },
            );
        }
        Self {
            id: snapshot.id,
            title: snapshot.title.clone(),
            deleted: false,
            list_order: snapshot.lists.iter().map(|list| list.id).collect(),
            lists,
            cards,
        }
    }

    pub fn card_ids(&self, list_id: ListId) -> Option<&[CardId]> {
        self.lists.get(&list_id).map(|list| list.cards.as_slice())
    }

    /// The list a live card is in. `None` for deleted or unknown cards.
    pub fn list_of(&self, card_id: CardId) -> Option<ListId> {
        self.cards
            .get(&card_id)
            .and_then(|card| card.placement.list_id())
    }

    /// Lists in display order, each with its cards in order.
    pub fn ordered(&self) -> impl Iterator<Item = (&ListState, Vec<&CardState>)> + '_ {
        self.list_order.iter().filter_map(move |list_id| {
            let list = self.lists.get(list_id)?;
            let cards = list
                .cards
                .iter()
                .filter_map(|card_id| self.cards.get(card_id))
                .collect();
            Some((list, cards))
        })
    }

    /// Applies an authoritative event. Arrays are replaced, never merged.
    fn apply_event(&mut self, event: &BoardEvent) {
        match event {
            BoardEvent::BoardUpdated { new_title, .. } => self.title = new_title.clone(),
            BoardEvent::BoardDeleted { .. } => {
                self.deleted = true;
                self.list_order.clear();
                self.lists.clear();
                for card in self.cards.values_mut() {
                    card.placement = CardPlacement::Deleted;
                }
            }
            BoardEvent::ListCreated(list) => {
                self.lists.insert(
                    list.id,
                    ListState {
                        id: list.id,
                        title: list.title.clone(),
                        cards: list.cards.clone(),
                    },
                );
                self.list_order = append_item(&self.list_order, list.id);
            }
            BoardEvent::ListUpdated { list_id, new_title } => {
                if let Some(list) = self.lists.get_mut(list_id) {
                    list.title = new_title.clone();
                }
            }
            BoardEvent::ListDeleted { list_id, .. } => {
                self.list_order = remove_item(&self.list_order, *list_id);
                if let Some(list) = self.lists.remove(list_id) {
                    for card_id in list.cards {
                        self.mark_deleted(card_id);
                    }
                }
                for card in self.cards.values_mut() {
                    if card.placement == CardPlacement::InList(*list_id) {
                        card.placement = CardPlacement::Deleted;
                    }
                }
            }
            BoardEvent::ListsReordered { ordered_list_ids } => {
                self.list_order = ordered_list_ids.clone();
            }
            BoardEvent::CardCreated { new_card, list_id } => {
                self.cards.insert(new_card.id, card_state(new_card, *list_id));
                if let Some(list) = self.lists.get_mut(list_id) {
                    list.cards = append_item(&list.cards, new_card.id);
                }
            }
            BoardEvent::CardUpdated { updated_card } => {
                if let Some(card) = self.cards.get_mut(&updated_card.id) {
                    if card.placement != CardPlacement::Deleted {
                        card.title = updated_card.title.clone();
                        card.description = updated_card.description.clone();
                    }
                }
            }
            BoardEvent::CardDeleted { card_id, list_id } => {
                if let Some(list) = self.lists.get_mut(list_id) {
                    list.cards = remove_item(&list.cards, *card_id);
                }
                self.mark_deleted(*card_id);
            }
            BoardEvent::CardsReordered {
                list_id,
                ordered_card_ids,
            } => self.replace_cards(*list_id, ordered_card_ids.clone()),
            BoardEvent::CardMoved {
                card_id,
                source_list_id,
                dest_list_id,
            } => {
                if let Some(source) = self.lists.get_mut(source_list_id) {
                    source.cards = remove_item(&source.cards, *card_id);
                }
                if let Some(dest) = self.lists.get_mut(dest_list_id) {
                    dest.cards = append_item(&dest.cards, *card_id);
                }
                if let Some(card) = self.cards.get_mut(card_id) {
                    card.placement = CardPlacement::InList(*dest_list_id);
                }
            }
        }
    }

    /// Sets `list_id`'s cards to exactly `order`. Any of those cards still
    /// listed elsewhere is taken out there, so a card is never in two lists.
    fn replace_cards(&mut self, list_id: ListId, order: Vec<CardId>) {
        let moved: HashSet<CardId> = order.iter().copied().collect();
        for (id, list) in self.lists.iter_mut() {
            if *id != list_id {
                list.cards.retain(|card_id| !moved.contains(card_id));
            }
        }
        for card_id in &order {
            if let Some(card) = self.cards.get_mut(card_id) {
                card.placement = CardPlacement::InList(list_id);
            }
        }
        if let Some(list) = self.lists.get_mut(&list_id) {
            list.cards = order;
        }
    }

    fn mark_deleted(&mut self, card_id: CardId) {
        if let Some(card) = self.cards.get_mut(&card_id) {
            card.placement = CardPlacement::Deleted;
        }
    }
}

fn card_state(card: &CardPayload, list_id: ListId) -> CardState {
    CardState {
        id: card.id,
        title: card.title.clone(),
        description: card.description.clone(),
        placement: CardPlacement::InList(list_id),
    }
}

/// A drag the user performed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    MoveList {
        list_id: ListId,
        to_index: usize,
    },
    ReorderCard {
        list_id: ListId,
        card_id: CardId,
        to_index: usize,
    },
    MoveCard {
        card_id: CardId,
        source_list_id: ListId,
        dest_list_id: ListId,
        dest_index: usize,
    },
}

/// The server call that confirms an intent.
#[derive(Debug, Clone)]
pub enum MutationRequest {
    ReorderLists {
        board_id: BoardId,
        body: ReorderListsRequest,
    },
    ReorderCards {
        list_id: ListId,
        body: ReorderCardsRequest,
    },
    MoveCard {
        card_id: CardId,
        body: MoveCardRequest,
    },
}

#[derive(Debug, Clone)]
pub enum Action {
    Optimistic(Intent),
    Authoritative(BoardEvent),
    /// The last mutation failed: drop every optimistic change.
    Revert,
}

#[derive(Debug, Clone)]
pub struct BoardModel {
    confirmed: BoardState,
    view: BoardState,
}

impl BoardModel {
    pub fn new(snapshot: &BoardSnapshot) -> Self {
        let confirmed = BoardState::from_snapshot(snapshot);
        Self {
            view: confirmed.clone(),
            confirmed,
        }
    }

    pub fn board_id(&self) -> BoardId {
        self.confirmed.id
    }

    pub fn confirmed(&self) -> &BoardState {
        &self.confirmed
    }

    pub fn view(&self) -> &BoardState {
        &self.view
    }

    pub fn has_pending_changes(&self) -> bool {
        self.view != self.confirmed
    }

    /// Optimistic intents update `view` and return the request to send. A
    /// rejected intent leaves the model untouched.
    pub fn apply(&mut self, action: Action) -> Result<Option<MutationRequest>, ReconcileError> {
        match action {
            Action::Optimistic(intent) => self.apply_intent(intent).map(Some),
            Action::Authoritative(event) => {
                self.confirmed.apply_event(&event);
                self.view.apply_event(&event);
                Ok(None)
            }
            Action::Revert => {
                self.view = self.confirmed.clone();
                Ok(None)
            }
        }
    }

    fn apply_intent(&mut self, intent: Intent) -> Result<MutationRequest, ReconcileError> {
        if self.view.deleted {
            return Err(ReconcileError::BoardDeleted);
        }
        let board_id = self.view.id;
        match intent {
            Intent::MoveList { list_id, to_index } => {
                let order = reorder_sequence(&self.view.list_order, list_id, to_index)?;
                self.view.list_order = order.clone();
                Ok(MutationRequest::ReorderLists {
                    board_id,
                    body: ReorderListsRequest {
                        ordered_list_ids: order,
                    },
                })
            }
            Intent::ReorderCard {
                list_id,
                card_id,
                to_index,
            } => {
                let current = self.cards_of(list_id)?;
                let order = reorder_sequence(current, card_id, to_index)?;
                self.view.replace_cards(list_id, order.clone());
                Ok(MutationRequest::ReorderCards {
                    list_id,
                    body: ReorderCardsRequest {
                        ordered_card_ids: order,
                        board_id,
                    },
                })
            }
            Intent::MoveCard {
                card_id,
                source_list_id,
                dest_list_id,
                dest_index,
            } => {
                if self.view.list_of(card_id) != Some(source_list_id) {
                    return Err(ReconcileError::CardNotInList {
                        card_id,
                        list_id: source_list_id,
                    });
                }
                if source_list_id == dest_list_id {
                    let order = reorder_sequence(self.cards_of(source_list_id)?, card_id, dest_index)?;
                    self.view.replace_cards(source_list_id, order);
                } else {
                    let (source, dest) = transfer_item(
                        self.cards_of(source_list_id)?,
                        self.cards_of(dest_list_id)?,
                        card_id,
                        dest_index,
                    )?;
                    self.view.replace_cards(source_list_id, source);
                    self.view.replace_cards(dest_list_id, dest);
                }
                Ok(MutationRequest::MoveCard {
                    card_id,
                    body: MoveCardRequest {
                        source_list_id,
                        dest_list_id,
                        board_id,
                        dest_index: Some(dest_index),
                    },
                })
            }
        }
    }

    fn cards_of(&self, list_id: ListId) -> Result<&[CardId], ReconcileError> {
        self.view
            .card_ids(list_id)
            .ok_or(ReconcileError::UnknownList(list_id))
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
