use std::{fmt, hash::Hash};

use serde::{Deserialize, Serialize};

/// Identifier of a persisted entity. Ordering arrays are sequences of these.
pub trait EntityId: Copy + Eq + Hash + fmt::Debug {
    fn raw(self) -> i64;
}

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl EntityId for $name {
            fn raw(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(BoardId);
id_newtype!(ListId);
id_newtype!(CardId);

/// Where a card currently lives. `Unplaced` only exists between allocation and
/// the first insert; a persisted card is always `InList`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "list_id", rename_all = "snake_case")]
pub enum CardPlacement {
    Unplaced,
    InList(ListId),
    Deleted,
}

impl CardPlacement {
    pub fn list_id(self) -> Option<ListId> {
        match self {
            Self::InList(list_id) => Some(list_id),
            Self::Unplaced | Self::Deleted => None,
        }
    }
}
