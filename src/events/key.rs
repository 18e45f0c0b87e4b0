//! Composite keys for the event log.
//!
//! Layout: `<20-digit zero-padded id>/<kind>/<alias>/<action>`. The padded id
//! makes byte order equal numeric order, so a cursor is a plain prefix seek.

use crate::error::{RelayError, Result};
use crate::types::{Action, EventId};

/// Width of the zero-padded id prefix (fits any u64).
pub const ID_WIDTH: usize = 20;

const EVENT_TAG: &str = "event";
const POSITION_TAG: &str = "position";

/// What an entry in the log holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    /// A serialized `RowEvent`.
    Event,
    /// An ingestion-position marker.
    Position,
}

/// Decoded form of an event log key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryKey {
    pub id: EventId,
    pub kind: EntryKind,
    /// Table alias; empty for markers.
    pub alias: String,
    /// Row action; `None` for markers.
    pub action: Option<Action>,
}

impl EntryKey {
    pub fn event(id: EventId, alias: impl Into<String>, action: Action) -> Self {
        Self {
            id,
            kind: EntryKind::Event,
            alias: alias.into(),
            action: Some(action),
        }
    }

    pub fn position(id: EventId) -> Self {
        Self {
            id,
            kind: EntryKind::Position,
            alias: String::new(),
            action: None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let tag = match self.kind {
            EntryKind::Event => EVENT_TAG,
            EntryKind::Position => POSITION_TAG,
        };
        let action = self.action.map(|a| a.as_str()).unwrap_or("");
        format!(
            "{:0width$}/{}/{}/{}",
            self.id.0,
            tag,
            self.alias,
            action,
            width = ID_WIDTH
        )
        .into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| RelayError::InvalidKey(String::from_utf8_lossy(bytes).into_owned()))?;
        let invalid = || RelayError::InvalidKey(text.to_string());

        if text.len() < ID_WIDTH + 1 || !text.is_char_boundary(ID_WIDTH) {
            return Err(invalid());
        }
        let (id_part, rest) = text.split_at(ID_WIDTH);
        let id = id_part.parse::<u64>().map_err(|_| invalid())?;
        let rest = rest.strip_prefix('/').ok_or_else(invalid)?;

        let (tag, rest) = rest.split_once('/').ok_or_else(invalid)?;
        // The alias may itself contain separators; the action is always last.
        let (alias, action) = rest.rsplit_once('/').ok_or_else(invalid)?;

        match tag {
            EVENT_TAG => {
                let action = match action {
                    "insert" => Action::Insert,
                    "update" => Action::Update,
                    "delete" => Action::Delete,
                    _ => return Err(invalid()),
                };
                Ok(Self::event(EventId(id), alias, action))
            }
            POSITION_TAG => Ok(Self::position(EventId(id))),
            _ => Err(invalid()),
        }
    }
}

/// Seek prefix for "the first entry with id >= `id`".
pub fn cursor_prefix(id: EventId) -> Vec<u8> {
    format!("{:0width$}", id.0, width = ID_WIDTH).into_bytes()
}

/// Cheap id extraction without decoding the rest of the key.
pub fn key_id(bytes: &[u8]) -> Option<EventId> {
    let head = bytes.get(..ID_WIDTH)?;
    std::str::from_utf8(head).ok()?.parse().ok().map(EventId)
}
