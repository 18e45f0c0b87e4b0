//! Core types for the relay.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Sequence id of an entry in the event log.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct EventId(pub u64);

impl EventId {
    pub fn next(self) -> Self {
        EventId(self.0 + 1)
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({})", self.0)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Offset in the replication stream (binlog file + byte offset).
///
/// Ordered by file first, then offset. Binlog files are compared by base
/// name and then by their numeric suffix, so `mysql-bin.999999` sorts before
/// `mysql-bin.1000000` once the suffix outgrows its zero padding.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Position {
    pub file: String,
    pub offset: u64,
}

impl Position {
    pub fn new(file: impl Into<String>, offset: u64) -> Self {
        Self {
            file: file.into(),
            offset,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.file.is_empty() && self.offset == 0
    }
}

/// Split `mysql-bin.000042` into `("mysql-bin", 42)`.
fn binlog_sequence(file: &str) -> Option<(&str, u64)> {
    let (base, suffix) = file.rsplit_once('.')?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((base, suffix.parse().ok()?))
}

fn cmp_binlog_files(a: &str, b: &str) -> Ordering {
    match (binlog_sequence(a), binlog_sequence(b)) {
        (Some((base_a, seq_a)), Some((base_b, seq_b))) => base_a
            .cmp(base_b)
            .then(seq_a.cmp(&seq_b))
            // Same number, different padding.
            .then_with(|| a.cmp(b)),
        _ => a.cmp(b),
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        cmp_binlog_files(&self.file, &other.file).then(self.offset.cmp(&other.offset))
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Position({}:{})", self.file, self.offset)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.offset)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Kind of row mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Insert,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Insert => "insert",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Column name to value.
pub type Row = BTreeMap<String, serde_json::Value>;

/// One column of a table layout.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    /// Raw column type as reported by the source (e.g. `varchar(64)`).
    pub raw_type: String,
}

impl ColumnMeta {
    pub fn new(name: impl Into<String>, raw_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            raw_type: raw_type.into(),
        }
    }
}

/// Table identity and column layout as decoded by the replication client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMeta {
    pub schema: String,
    pub name: String,
    pub columns: Vec<ColumnMeta>,
}

impl TableMeta {
    pub fn new(schema: impl Into<String>, name: impl Into<String>, columns: Vec<ColumnMeta>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
            columns,
        }
    }

    /// `schema.table`.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    /// Fingerprint of the current column layout: `schema.table.<hex>`.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for column in &self.columns {
            hasher.update(column.name.as_bytes());
            hasher.update(b",");
            hasher.update(column.raw_type.as_bytes());
            hasher.update(b"|");
        }
        let digest = hasher.finalize();
        format!(
            "{}.{}.{}",
            self.schema,
            self.name,
            hex::encode(&digest[..8])
        )
    }
}

/// A single decoded row mutation delivered by the replication client.
#[derive(Clone, Debug, PartialEq)]
pub struct RowChange {
    pub action: Action,
    pub before: Option<Row>,
    pub after: Option<Row>,
}

impl RowChange {
    pub fn insert(row: Row) -> Self {
        Self {
            action: Action::Insert,
            before: None,
            after: Some(row),
        }
    }

    pub fn update(before: Row, after: Row) -> Self {
        Self {
            action: Action::Update,
            before: Some(before),
            after: Some(after),
        }
    }

    pub fn delete(row: Row) -> Self {
        Self {
            action: Action::Delete,
            before: Some(row),
            after: None,
        }
    }
}

/// One captured mutation, as stored in the event log and handed to processors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RowEvent {
    /// Assigned by the event log at append time.
    pub id: EventId,

    pub schema: String,

    pub table: String,

    /// Column layout fingerprint at capture time.
    pub alias: String,

    pub action: Action,

    /// Empty for insert and delete.
    pub previous_row: Row,

    /// New image for insert and update; the deleted image for delete.
    pub row: Row,

    /// Changed columns (update only).
    pub diff_cols: BTreeSet<String>,
}

impl RowEvent {
    /// Build an event from a decoded change. The id is assigned on append.
    pub fn from_change(table: &TableMeta, alias: &str, change: RowChange) -> Self {
        let (previous_row, row) = match change.action {
            Action::Insert => (Row::new(), change.after.unwrap_or_default()),
            Action::Update => (
                change.before.unwrap_or_default(),
                change.after.unwrap_or_default(),
            ),
            Action::Delete => (
                Row::new(),
                change.before.or(change.after).unwrap_or_default(),
            ),
        };

        let diff_cols = match change.action {
            Action::Update => diff_columns(&previous_row, &row),
            _ => BTreeSet::new(),
        };

        Self {
            id: EventId(0),
            schema: table.schema.clone(),
            table: table.name.clone(),
            alias: alias.to_string(),
            action: change.action,
            previous_row,
            row,
            diff_cols,
        }
    }
}

/// Names of columns whose value differs between two images, including
/// columns present in only one of them.
pub fn diff_columns(before: &Row, after: &Row) -> BTreeSet<String> {
    let mut changed = BTreeSet::new();
    for (name, value) in before {
        if after.get(name) != Some(value) {
            changed.insert(name.clone());
        }
    }
    for name in after.keys() {
        if !before.contains_key(name) {
            changed.insert(name.clone());
        }
    }
    changed
}
