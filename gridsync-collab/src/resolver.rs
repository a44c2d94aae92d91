//! Whole-cell last-writer-wins adjudication.
//!
//! | authority record                        | decision                                   |
//! |-----------------------------------------|--------------------------------------------|
//! | absent                                  | `Apply` with the local version             |
//! | `remote.at <  local.at`                 | `Apply` with `max(local.v, remote.v + 1)`  |
//! | `remote.at >= local.at` (ties included) | `Supersede`                                |
//!
//! Ties go to the authority so that a retried sync pass reaches the same
//! decision every time.

use crate::model::{Cell, HistoryRecord, PendingChange};

/// Outcome of comparing a pending local edit with the authority's copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Write the local value through with this version.
    Apply { version: u64 },
    /// Drop the local edit; the authority's value stands.
    Supersede,
}

pub fn resolve(local: &PendingChange, remote: Option<&Cell>) -> Resolution {
    match remote {
        None => Resolution::Apply {
            version: local.version,
        },
        Some(remote) if remote.last_modified_at < local.last_modified_at => Resolution::Apply {
            version: local.version.max(remote.version.saturating_add(1)),
        },
        Some(_) => Resolution::Supersede,
    }
}

/// History entry for a superseded edit: the authority's value is the new
/// value, the rejected local value is kept as context.
///
/// Returns `None` when the authority already holds what the actor believed.
pub fn superseded_history(local: &PendingChange, remote: &Cell) -> Option<HistoryRecord> {
    if remote.value == local.value {
        return None;
    }
    Some(HistoryRecord {
        row: remote.row,
        col: remote.col,
        old_value: Some(local.value.clone()),
        new_value: remote.value.clone(),
        actor_id: remote.last_modified_by,
        timestamp: remote.last_modified_at,
    })
}
