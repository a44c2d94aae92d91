//! Grid data model shared by the cache, the sync engine and the wire protocol.
//!
//! ```text
//! TableSnapshot
//!   ├── cells            BTreeMap<"row-col", Cell>      (confirmed by the authority)
//!   ├── pending_changes  IndexMap<"row-col", Cell>      (local, insertion ordered)
//!   └── rows × cols      grow-only except explicit shrink
//! ```
//!
//! The grid a user sees is [`TableSnapshot::view`]: pending changes overlaid
//! on confirmed cells. There is never a second mutable copy of that overlay.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

/// Identifier of a table (one shared grid).
pub type TableId = Uuid;

/// Identifier of a collaborator.
pub type ActorId = Uuid;

/// A local edit not yet confirmed by the authority.
///
/// It is a full cell snapshot; at most one exists per [`CellKey`].
pub type PendingChange = Cell;

/// Version of a cell that has never been written.
pub const IMPLICIT_VERSION: u64 = 1;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ───────────────────────────────────────────────────────────────────
// Cell addressing
// ───────────────────────────────────────────────────────────────────

/// `(row, col)` address of a cell. Serialized as `"row-col"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct CellKey {
    pub row: u32,
    pub col: u32,
}

impl CellKey {
    pub fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }
}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.row, self.col)
    }
}

/// Error parsing a `"row-col"` key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidCellKey(pub String);

impl fmt::Display for InvalidCellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid cell key: {:?}", self.0)
    }
}

impl std::error::Error for InvalidCellKey {}

impl FromStr for CellKey {
    type Err = InvalidCellKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (row, col) = s
            .split_once('-')
            .ok_or_else(|| InvalidCellKey(s.to_string()))?;
        let row = row.parse().map_err(|_| InvalidCellKey(s.to_string()))?;
        let col = col.parse().map_err(|_| InvalidCellKey(s.to_string()))?;
        Ok(Self { row, col })
    }
}

impl From<CellKey> for String {
    fn from(key: CellKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for CellKey {
    type Error = InvalidCellKey;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Grid axis, used by explicit resize operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Axis {
    Row,
    Column,
}

// ───────────────────────────────────────────────────────────────────
// Records
// ───────────────────────────────────────────────────────────────────

/// One cell of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub row: u32,
    pub col: u32,
    pub value: String,
    /// Monotonic per `(row, col)`; starts at 1.
    pub version: u64,
    pub last_modified_by: Option<ActorId>,
    /// Milliseconds since the Unix epoch.
    pub last_modified_at: u64,
}

impl Cell {
    pub fn new(
        key: CellKey,
        value: impl Into<String>,
        version: u64,
        last_modified_by: Option<ActorId>,
        last_modified_at: u64,
    ) -> Self {
        Self {
            row: key.row,
            col: key.col,
            value: value.into(),
            version,
            last_modified_by,
            last_modified_at,
        }
    }

    pub fn key(&self) -> CellKey {
        CellKey::new(self.row, self.col)
    }
}

/// Grid dimensions. Both are always ≥ 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridSize {
    pub rows: u32,
    pub cols: u32,
}

impl GridSize {
    pub fn new(rows: u32, cols: u32) -> Self {
        Self {
            rows: rows.max(1),
            cols: cols.max(1),
        }
    }

    pub fn contains(&self, key: CellKey) -> bool {
        key.row < self.rows && key.col < self.cols
    }
}

impl Default for GridSize {
    fn default() -> Self {
        Self { rows: 10, cols: 10 }
    }
}

/// A collaborator's presence row as stored by the authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveActor {
    pub actor_id: ActorId,
    pub username: String,
    pub last_seen_at: u64,
    pub selected_cell: Option<CellKey>,
    pub has_pending_changes: bool,
}

impl ActiveActor {
    /// Whether the actor was seen within `window` of `now` (milliseconds).
    pub fn is_live(&self, now: u64, window: Duration) -> bool {
        now.saturating_sub(self.last_seen_at) <= window.as_millis() as u64
    }
}

/// Append-only audit entry, one per confirmed mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub row: u32,
    pub col: u32,
    /// `None` when the cell did not exist before.
    pub old_value: Option<String>,
    pub new_value: String,
    pub actor_id: Option<ActorId>,
    pub timestamp: u64,
}

/// Push notification of a remote cell mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellMutationEvent {
    pub table_id: TableId,
    pub row: u32,
    pub col: u32,
    pub value: String,
    pub version: u64,
    pub last_modified_by: Option<ActorId>,
    pub last_modified_at: u64,
}

impl CellMutationEvent {
    pub fn from_cell(table_id: TableId, cell: &Cell) -> Self {
        Self {
            table_id,
            row: cell.row,
            col: cell.col,
            value: cell.value.clone(),
            version: cell.version,
            last_modified_by: cell.last_modified_by,
            last_modified_at: cell.last_modified_at,
        }
    }

    pub fn key(&self) -> CellKey {
        CellKey::new(self.row, self.col)
    }

    pub fn to_cell(&self) -> Cell {
        Cell {
            row: self.row,
            col: self.col,
            value: self.value.clone(),
            version: self.version,
            last_modified_by: self.last_modified_by,
            last_modified_at: self.last_modified_at,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Table snapshot
// ───────────────────────────────────────────────────────────────────

/// Everything the local cache knows about one table.
///
/// Every writer (local edit, sync engine, change feed, resize) mutates a
/// snapshot as a whole under the cache lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub cells: BTreeMap<CellKey, Cell>,
    pub pending_changes: IndexMap<CellKey, PendingChange>,
    pub rows: u32,
    pub cols: u32,
}

impl Default for TableSnapshot {
    fn default() -> Self {
        Self::new(GridSize::default())
    }
}

impl TableSnapshot {
    pub fn new(size: GridSize) -> Self {
        Self {
            cells: BTreeMap::new(),
            pending_changes: IndexMap::new(),
            rows: size.rows.max(1),
            cols: size.cols.max(1),
        }
    }

    pub fn size(&self) -> GridSize {
        GridSize::new(self.rows, self.cols)
    }

    /// Grow dimensions so that `key` is addressable. Returns `true` if grown.
    ///
    /// Dimensions saturate at `u32::MAX`; a key on the very last index is
    /// stored but stays outside the grid.
    pub fn grow_to_fit(&mut self, key: CellKey) -> bool {
        let mut grew = false;
        if key.row >= self.rows {
            self.rows = key.row.saturating_add(1);
            grew = true;
        }
        if key.col >= self.cols {
            self.cols = key.col.saturating_add(1);
            grew = true;
        }
        grew
    }

    /// Authority-confirmed cell, ignoring local pending edits.
    pub fn confirmed(&self, key: CellKey) -> Option<&Cell> {
        self.cells.get(&key)
    }

    /// What the local actor currently believes: pending over confirmed.
    pub fn effective(&self, key: CellKey) -> Option<&Cell> {
        self.pending_changes.get(&key).or_else(|| self.cells.get(&key))
    }

    /// Stage a local edit as a pending change and return it.
    ///
    /// The version is bumped from whatever the actor currently believes, so
    /// the first write of an empty cell carries version 2.
    pub fn stage_local_edit(
        &mut self,
        key: CellKey,
        value: impl Into<String>,
        actor_id: ActorId,
        timestamp: u64,
    ) -> PendingChange {
        let base = self
            .effective(key)
            .map(|c| c.version)
            .unwrap_or(IMPLICIT_VERSION);
        let change = Cell::new(key, value, base.saturating_add(1), Some(actor_id), timestamp);
        self.grow_to_fit(key);
        // IndexMap::insert keeps the original queue position for an existing key.
        self.pending_changes.insert(key, change.clone());
        change
    }

    /// Store an authority-confirmed cell unless it is older than what we hold.
    ///
    /// Returns `false` for a stale (lower version) record.
    pub fn upsert_confirmed(&mut self, cell: Cell) -> bool {
        let key = cell.key();
        if let Some(current) = self.cells.get(&key) {
            if cell.version < current.version {
                return false;
            }
        }
        self.grow_to_fit(key);
        self.cells.insert(key, cell);
        true
    }

    /// Store a cell pushed by the change feed, whatever version we held.
    ///
    /// The authority already decided; versions restart after a line is
    /// deleted there, so a lower version is not necessarily older.
    pub fn overwrite_confirmed(&mut self, cell: Cell) {
        let key = cell.key();
        self.grow_to_fit(key);
        self.cells.insert(key, cell);
    }

    /// Drop `change` from the pending set if it has not been overwritten by
    /// a newer local edit in the meantime. Returns `true` if removed.
    pub fn settle_pending(&mut self, change: &PendingChange) -> bool {
        let key = change.key();
        match self.pending_changes.get(&key) {
            Some(current) if current == change => {
                self.pending_changes.shift_remove(&key);
                true
            }
            _ => false,
        }
    }

    /// Replace confirmed cells with a full authority listing. Pending
    /// changes are kept and stay overlaid.
    pub fn replace_confirmed(&mut self, cells: Vec<Cell>) {
        self.cells.clear();
        for cell in cells {
            let key = cell.key();
            self.grow_to_fit(key);
            self.cells.insert(key, cell);
        }
        let pending: Vec<CellKey> = self.pending_changes.keys().copied().collect();
        for key in pending {
            self.grow_to_fit(key);
        }
    }

    /// Owner-initiated growth by one line.
    pub fn add_line(&mut self, axis: Axis) -> GridSize {
        match axis {
            Axis::Row => self.rows = self.rows.saturating_add(1),
            Axis::Column => self.cols = self.cols.saturating_add(1),
        }
        self.size()
    }

    /// Remove the last row or column, evicting its cells and pending
    /// changes. Dimensions never drop below 1.
    ///
    /// Returns the removed index, or `None` if the axis is already at 1.
    pub fn remove_last_line(&mut self, axis: Axis) -> Option<u32> {
        let removed = match axis {
            Axis::Row if self.rows > 1 => {
                self.rows -= 1;
                self.rows
            }
            Axis::Column if self.cols > 1 => {
                self.cols -= 1;
                self.cols
            }
            _ => return None,
        };
        let on_line = |key: &CellKey| match axis {
            Axis::Row => key.row == removed,
            Axis::Column => key.col == removed,
        };
        self.cells.retain(|key, _| !on_line(key));
        self.pending_changes.retain(|key, _| !on_line(key));
        Some(removed)
    }

    /// Read-through overlay of pending changes on confirmed cells.
    pub fn view(&self) -> GridView {
        let mut cells: BTreeMap<CellKey, Cell> = self.cells.clone();
        for (key, change) in &self.pending_changes {
            cells.insert(*key, change.clone());
        }
        GridView {
            size: self.size(),
            cells,
            pending: self.pending_changes.keys().copied().collect(),
        }
    }
}

/// Immutable, display-ready copy of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridView {
    pub size: GridSize,
    cells: BTreeMap<CellKey, Cell>,
    pending: Vec<CellKey>,
}

impl GridView {
    pub fn cell(&self, row: u32, col: u32) -> Option<&Cell> {
        self.cells.get(&CellKey::new(row, col))
    }

    /// Display value, empty for cells never written.
    pub fn value(&self, row: u32, col: u32) -> &str {
        self.cell(row, col).map(|c| c.value.as_str()).unwrap_or("")
    }

    /// Whether the displayed value is a local edit the authority has not confirmed.
    pub fn is_pending(&self, row: u32, col: u32) -> bool {
        self.pending.contains(&CellKey::new(row, col))
    }

    pub fn cells(&self) -> impl Iterator<Item = &Cell> {
        self.cells.values()
    }
}
