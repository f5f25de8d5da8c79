use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite, SqliteConnection,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{BoardId, CardId, ListId, UserId};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredBoard {
    pub board_id: BoardId,
    pub title: String,
    pub owner: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredList {
    pub list_id: ListId,
    pub board_id: BoardId,
    pub title: String,
    pub position: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCard {
    pub card_id: CardId,
    pub list_id: ListId,
    pub title: String,
    pub description: String,
    pub position: i64,
}

/// A card relocation: the card's new list plus the complete final ordering of
/// both lists it touches.
#[derive(Debug, Clone)]
pub struct CardMove<'a> {
    pub card_id: CardId,
    pub source_list_id: ListId,
    pub dest_list_id: ListId,
    pub source_order: &'a [CardId],
    pub dest_order: &'a [CardId],
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        // An in-memory database lives inside its connection; more than one
        // connection would race on table locks under concurrent writers.
        let max_connections = if is_memory_url(database_url) { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_user(&self, username: &str) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (username) VALUES (?)
             ON CONFLICT(username) DO UPDATE SET username=excluded.username
             RETURNING id",
        )
        .bind(username)
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn username_for_user(&self, user_id: UserId) -> Result<Option<String>> {
        let row = sqlx::query("SELECT username FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    pub async fn create_board(&self, title: &str, owner: UserId) -> Result<StoredBoard> {
        let row = sqlx::query(
            "INSERT INTO boards (title, owner_user_id) VALUES (?, ?)
             RETURNING id, title, owner_user_id, created_at, updated_at",
        )
        .bind(title)
        .bind(owner.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(board_from_row(&row))
    }

    pub async fn board_owner(&self, board_id: BoardId) -> Result<Option<UserId>> {
        let row = sqlx::query("SELECT owner_user_id FROM boards WHERE id = ?")
            .bind(board_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| UserId(r.get::<i64, _>(0))))
    }

    pub async fn load_board(&self, board_id: BoardId) -> Result<Option<StoredBoard>> {
        let row = sqlx::query(
            "SELECT id, title, owner_user_id, created_at, updated_at FROM boards WHERE id = ?",
        )
        .bind(board_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(board_from_row))
    }

    pub async fn list_boards_for_user(&self, owner: UserId) -> Result<Vec<StoredBoard>> {
        let rows = sqlx::query(
            "SELECT id, title, owner_user_id, created_at, updated_at
             FROM boards
             WHERE owner_user_id = ?
             ORDER BY id ASC",
        )
        .bind(owner.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(board_from_row).collect())
    }

    pub async fn all_board_ids(&self) -> Result<Vec<BoardId>> {
        let rows = sqlx::query("SELECT id FROM boards ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| BoardId(row.get::<i64, _>(0)))
            .collect())
    }

    pub async fn rename_board(&self, board_id: BoardId, title: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE boards SET title = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(title)
        .bind(board_id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Deletes the board, its lists and their cards in one transaction.
    pub async fn delete_board(&self, board_id: BoardId) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM cards WHERE list_id IN (SELECT id FROM lists WHERE board_id = ?)")
            .bind(board_id.0)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM lists WHERE board_id = ?")
            .bind(board_id.0)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM boards WHERE id = ?")
            .bind(board_id.0)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(deleted == 1)
    }

    pub async fn list_ids_for_board(&self, board_id: BoardId) -> Result<Vec<ListId>> {
        let rows = sqlx::query("SELECT id FROM lists WHERE board_id = ? ORDER BY position, id")
            .bind(board_id.0)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| ListId(r.get::<i64, _>(0))).collect())
    }

    /// Appends a new list to the end of the board's ordering.
    pub async fn create_list(&self, board_id: BoardId, title: &str) -> Result<StoredList> {
        let mut tx = self.pool.begin().await?;
        let position: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(position) + 1, 0) FROM lists WHERE board_id = ?",
        )
        .bind(board_id.0)
        .fetch_one(&mut *tx)
        .await?;
        let rec = sqlx::query(
            "INSERT INTO lists (board_id, title, position) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(board_id.0)
        .bind(title)
        .bind(position)
        .fetch_one(&mut *tx)
        .await?;
        touch_board(&mut tx, board_id).await?;
        tx.commit().await?;
        Ok(StoredList {
            list_id: ListId(rec.get::<i64, _>(0)),
            board_id,
            title: title.to_string(),
            position,
        })
    }

    pub async fn load_list(&self, list_id: ListId) -> Result<Option<StoredList>> {
        let row = sqlx::query("SELECT id, board_id, title, position FROM lists WHERE id = ?")
            .bind(list_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(list_from_row))
    }

    pub async fn rename_list(&self, list_id: ListId, title: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE lists SET title = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(title)
        .bind(list_id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Deletes a list with its cards and closes the gap in the board ordering.
    /// Returns the ids of the cascaded cards, or `None` if the list is gone.
    pub async fn delete_list(&self, list_id: ListId) -> Result<Option<Vec<CardId>>> {
        let mut tx = self.pool.begin().await?;
        let Some(board_id) = sqlx::query("SELECT board_id FROM lists WHERE id = ?")
            .bind(list_id.0)
            .fetch_optional(&mut *tx)
            .await?
            .map(|r| BoardId(r.get::<i64, _>(0)))
        else {
            return Ok(None);
        };

        let cards = sqlx::query("DELETE FROM cards WHERE list_id = ? RETURNING id")
            .bind(list_id.0)
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .map(|r| CardId(r.get::<i64, _>(0)))
            .collect();
        sqlx::query("DELETE FROM lists WHERE id = ?")
            .bind(list_id.0)
            .execute(&mut *tx)
            .await?;

        let remaining = ordered_list_ids(&mut tx, board_id).await?;
        write_list_positions(&mut tx, board_id, &remaining).await?;
        touch_board(&mut tx, board_id).await?;
        tx.commit().await?;
        Ok(Some(cards))
    }

    /// Replaces the board's list ordering with exactly `order`. Fails and
    /// rolls back if `order` is not the board's full set of lists.
    pub async fn set_board_list_order(&self, board_id: BoardId, order: &[ListId]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        write_list_positions(&mut tx, board_id, order).await?;
        touch_board(&mut tx, board_id).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn card_ids_for_list(&self, list_id: ListId) -> Result<Vec<CardId>> {
        let rows = sqlx::query("SELECT id FROM cards WHERE list_id = ? ORDER BY position, id")
            .bind(list_id.0)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| CardId(r.get::<i64, _>(0))).collect())
    }

    /// Appends a new card to the end of the list's ordering.
    pub async fn create_card(
        &self,
        list_id: ListId,
        title: &str,
        description: &str,
    ) -> Result<StoredCard> {
        let mut tx = self.pool.begin().await?;
        let position: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(position) + 1, 0) FROM cards WHERE list_id = ?",
        )
        .bind(list_id.0)
        .fetch_one(&mut *tx)
        .await?;
        let rec = sqlx::query(
            "INSERT INTO cards (list_id, title, description, position) VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(list_id.0)
        .bind(title)
        .bind(description)
        .bind(position)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(StoredCard {
            card_id: CardId(rec.get::<i64, _>(0)),
            list_id,
            title: title.to_string(),
            description: description.to_string(),
            position,
        })
    }

    pub async fn load_card(&self, card_id: CardId) -> Result<Option<StoredCard>> {
        let row = sqlx::query(
            "SELECT id, list_id, title, description, position FROM cards WHERE id = ?",
        )
        .bind(card_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(card_from_row))
    }

    /// Updates title and/or description; `None` leaves a field untouched.
    pub async fn update_card(
        &self,
        card_id: CardId,
        title: Option<&str>,
        description: Option<&str>,
    ) -> Result<Option<StoredCard>> {
        let row = sqlx::query(
            "UPDATE cards
             SET title = COALESCE(?, title),
                 description = COALESCE(?, description),
                 updated_at = CURRENT_TIMESTAMP
             WHERE id = ?
             RETURNING id, list_id, title, description, position",
        )
        .bind(title)
        .bind(description)
        .bind(card_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(card_from_row))
    }

    /// Deletes a card and closes the gap in its list. Returns the list it was
    /// removed from.
    pub async fn delete_card(&self, card_id: CardId) -> Result<Option<ListId>> {
        let mut tx = self.pool.begin().await?;
        let Some(list_id) = sqlx::query("DELETE FROM cards WHERE id = ? RETURNING list_id")
            .bind(card_id.0)
            .fetch_optional(&mut *tx)
            .await?
            .map(|r| ListId(r.get::<i64, _>(0)))
        else {
            return Ok(None);
        };
        let remaining = ordered_card_ids(&mut tx, list_id).await?;
        write_card_positions(&mut tx, list_id, &remaining).await?;
        tx.commit().await?;
        Ok(Some(list_id))
    }

    /// Replaces the list's card ordering with exactly `order`.
    pub async fn set_list_card_order(&self, list_id: ListId, order: &[CardId]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        write_card_positions(&mut tx, list_id, order).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Reassigns the card's list and rewrites both orderings in a single
    /// transaction, so no reader ever sees the card in zero or two lists.
    pub async fn apply_card_move(&self, change: CardMove<'_>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let moved = sqlx::query(
            "UPDATE cards SET list_id = ?, updated_at = CURRENT_TIMESTAMP
             WHERE id = ? AND list_id IN (?, ?)",
        )
        .bind(change.dest_list_id.0)
        .bind(change.card_id.0)
        .bind(change.source_list_id.0)
        .bind(change.dest_list_id.0)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if moved != 1 {
            bail!(
                "card {} is not in list {} or {}",
                change.card_id,
                change.source_list_id,
                change.dest_list_id
            );
        }
        if change.source_list_id != change.dest_list_id {
            write_card_positions(&mut tx, change.source_list_id, change.source_order).await?;
        }
        write_card_positions(&mut tx, change.dest_list_id, change.dest_order).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn load_board_lists(&self, board_id: BoardId) -> Result<Vec<StoredList>> {
        let rows = sqlx::query(
            "SELECT id, board_id, title, position FROM lists WHERE board_id = ? ORDER BY position, id",
        )
        .bind(board_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(list_from_row).collect())
    }

    /// Every card on the board, grouped by list in board order and sorted by
    /// position within each list.
    pub async fn load_board_cards(&self, board_id: BoardId) -> Result<Vec<StoredCard>> {
        let rows = sqlx::query(
            "SELECT c.id, c.list_id, c.title, c.description, c.position
             FROM cards c
             INNER JOIN lists l ON l.id = c.list_id
             WHERE l.board_id = ?
             ORDER BY l.position, l.id, c.position, c.id",
        )
        .bind(board_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(card_from_row).collect())
    }

    /// True when list positions on the board and card positions in each of its
    /// lists are exactly `0..n`.
    pub async fn orderings_are_dense(&self, board_id: BoardId) -> Result<bool> {
        let lists = self.load_board_lists(board_id).await?;
        if lists
            .iter()
            .enumerate()
            .any(|(index, list)| list.position != index as i64)
        {
            return Ok(false);
        }

        let cards = self.load_board_cards(board_id).await?;
        let mut current: Option<ListId> = None;
        let mut expected = 0_i64;
        for card in cards {
            if current != Some(card.list_id) {
                current = Some(card.list_id);
                expected = 0;
            }
            if card.position != expected {
                return Ok(false);
            }
            expected += 1;
        }
        Ok(true)
    }

    /// Renumbers the board's list positions and every list's card positions
    /// to `0..n`, keeping the current relative order (ties broken by id).
    /// Cards stay in the list their `list_id` names. Returns the number of
    /// rows whose position changed.
    pub async fn repair_board_orderings(&self, board_id: BoardId) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut changed = 0;

        let list_ids = ordered_list_ids(&mut tx, board_id).await?;
        for (position, list_id) in list_ids.iter().enumerate() {
            changed += sqlx::query(
                "UPDATE lists SET position = ? WHERE id = ? AND position != ?",
            )
            .bind(position as i64)
            .bind(list_id.0)
            .bind(position as i64)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        for list_id in &list_ids {
            let card_ids = ordered_card_ids(&mut tx, *list_id).await?;
            for (position, card_id) in card_ids.iter().enumerate() {
                changed += sqlx::query(
                    "UPDATE cards SET position = ? WHERE id = ? AND position != ?",
                )
                .bind(position as i64)
                .bind(card_id.0)
                .bind(position as i64)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            }
        }

        tx.commit().await?;
        Ok(changed)
    }
}

async fn touch_board(conn: &mut SqliteConnection, board_id: BoardId) -> Result<()> {
    sqlx::query("UPDATE boards SET updated_at = CURRENT_TIMESTAMP WHERE id = ?")
        .bind(board_id.0)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn ordered_list_ids(conn: &mut SqliteConnection, board_id: BoardId) -> Result<Vec<ListId>> {
    let rows = sqlx::query("SELECT id FROM lists WHERE board_id = ? ORDER BY position, id")
        .bind(board_id.0)
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows.into_iter().map(|r| ListId(r.get::<i64, _>(0))).collect())
}

async fn ordered_card_ids(conn: &mut SqliteConnection, list_id: ListId) -> Result<Vec<CardId>> {
    let rows = sqlx::query("SELECT id FROM cards WHERE list_id = ? ORDER BY position, id")
        .bind(list_id.0)
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows.into_iter().map(|r| CardId(r.get::<i64, _>(0))).collect())
}

async fn write_list_positions(
    conn: &mut SqliteConnection,
    board_id: BoardId,
    order: &[ListId],
) -> Result<()> {
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM lists WHERE board_id = ?")
        .bind(board_id.0)
        .fetch_one(&mut *conn)
        .await?;
    if total != order.len() as i64 {
        bail!(
            "board {board_id} has {total} lists but the ordering names {}",
            order.len()
        );
    }
    for (position, list_id) in order.iter().enumerate() {
        let updated = sqlx::query("UPDATE lists SET position = ? WHERE id = ? AND board_id = ?")
            .bind(position as i64)
            .bind(list_id.0)
            .bind(board_id.0)
            .execute(&mut *conn)
            .await?
            .rows_affected();
        if updated != 1 {
            bail!("list {list_id} is not on board {board_id}");
        }
    }
    Ok(())
}

async fn write_card_positions(
    conn: &mut SqliteConnection,
    list_id: ListId,
    order: &[CardId],
) -> Result<()> {
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cards WHERE list_id = ?")
        .bind(list_id.0)
        .fetch_one(&mut *conn)
        .await?;
    if total != order.len() as i64 {
        bail!(
            "list {list_id} has {total} cards but the ordering names {}",
            order.len()
        );
    }
    for (position, card_id) in order.iter().enumerate() {
        let updated = sqlx::query("UPDATE cards SET position = ? WHERE id = ? AND list_id = ?")
            .bind(position as i64)
            .bind(card_id.0)
            .bind(list_id.0)
            .execute(&mut *conn)
            .await?
            .rows_affected();
        if updated != 1 {
            bail!("card {card_id} is not in list {list_id}");
        }
    }
    Ok(())
}

fn board_from_row(row: &sqlx::sqlite::SqliteRow) -> StoredBoard {
    StoredBoard {
        board_id: BoardId(row.get::<i64, _>("id")),
        title: row.get::<String, _>("title"),
        owner: UserId(row.get::<i64, _>("owner_user_id")),
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
    }
}

fn list_from_row(row: &sqlx::sqlite::SqliteRow) -> StoredList {
    StoredList {
        list_id: ListId(row.get::<i64, _>("id")),
        board_id: BoardId(row.get::<i64, _>("board_id")),
        title: row.get::<String, _>("title"),
        position: row.get::<i64, _>("position"),
    }
}

fn card_from_row(row: &sqlx::sqlite::SqliteRow) -> StoredCard {
    StoredCard {
        card_id: CardId(row.get::<i64, _>("id")),
        list_id: ListId(row.get::<i64, _>("list_id")),
        title: row.get::<String, _>("title"),
        description: row.get::<String, _>("description"),
        position: row.get::<i64, _>("position"),
    }
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_memory_url(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
