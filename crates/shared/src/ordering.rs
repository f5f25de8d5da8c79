//! Sequence math for ordering arrays (lists on a board, cards in a list).
//!
//! Everything here is pure so the client can compute an optimistic order with
//! exactly the same rules the server uses for the authoritative one.

use std::collections::HashSet;

use thiserror::Error;

use crate::domain::EntityId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderingError {
    #[error("id {id} is not present in the sequence")]
    NotFound { id: i64 },
    #[error("sequence references unknown id {id}")]
    UnknownId { id: i64 },
    #[error("sequence repeats id {id}")]
    DuplicateId { id: i64 },
    #[error("sequence is missing id {id}")]
    MissingId { id: i64 },
}

/// Moves `moved_id` to `target_index`. The index is clamped to the last slot.
pub fn reorder_sequence<T: EntityId>(
    sequence: &[T],
    moved_id: T,
    target_index: usize,
) -> Result<Vec<T>, OrderingError> {
    let current = position_of(sequence, moved_id)?;
    let target = target_index.min(sequence.len() - 1);
    let mut next = sequence.to_vec();
    if current == target {
        return Ok(next);
    }
    let item = next.remove(current);
    next.insert(target, item);
    Ok(next)
}

/// Moves `moved_id` out of `source` and into `dest` at `dest_index` (clamped to
/// the end of `dest`).
///
/// When `dest` already holds the id (a retried request that was applied once
/// already) the id is reordered in place inside `dest` instead of duplicated.
pub fn transfer_item<T: EntityId>(
    source: &[T],
    dest: &[T],
    moved_id: T,
    dest_index: usize,
) -> Result<(Vec<T>, Vec<T>), OrderingError> {
    if dest.contains(&moved_id) {
        let new_dest = reorder_sequence(dest, moved_id, dest_index)?;
        return Ok((remove_item(source, moved_id), new_dest));
    }
    position_of(source, moved_id)?;
    let new_source = remove_item(source, moved_id);
    let mut new_dest = dest.to_vec();
    new_dest.insert(dest_index.min(dest.len()), moved_id);
    Ok((new_source, new_dest))
}

/// Rejects sequences that repeat an id or reference one outside `valid_ids`.
pub fn validate_sequence<T: EntityId>(sequence: &[T], valid_ids: &[T]) -> Result<(), OrderingError> {
    let valid: HashSet<T> = valid_ids.iter().copied().collect();
    let mut seen = HashSet::with_capacity(sequence.len());
    for id in sequence {
        if !valid.contains(id) {
            return Err(OrderingError::UnknownId { id: id.raw() });
        }
        if !seen.insert(*id) {
            return Err(OrderingError::DuplicateId { id: id.raw() });
        }
    }
    Ok(())
}

/// [`validate_sequence`] plus: every id of `current` must appear. A client
/// replacing a whole ordering array has to send exactly a permutation of it.
pub fn validate_permutation<T: EntityId>(sequence: &[T], current: &[T]) -> Result<(), OrderingError> {
    validate_sequence(sequence, current)?;
    if let Some(missing) = current.iter().find(|id| !sequence.contains(id)) {
        return Err(OrderingError::MissingId { id: missing.raw() });
    }
    Ok(())
}

/// Appends unless already present.
pub fn append_item<T: EntityId>(sequence: &[T], id: T) -> Vec<T> {
    let mut next = sequence.to_vec();
    if !next.contains(&id) {
        next.push(id);
    }
    next
}

/// Removes every occurrence.
pub fn remove_item<T: EntityId>(sequence: &[T], id: T) -> Vec<T> {
    sequence.iter().copied().filter(|item| *item != id).collect()
}

fn position_of<T: EntityId>(sequence: &[T], id: T) -> Result<usize, OrderingError> {
    sequence
        .iter()
        .position(|item| *item == id)
        .ok_or(OrderingError::NotFound { id: id.raw() })
}

#[cfg(test)]
#[path = "tests/ordering_tests.rs"]
mod tests;
