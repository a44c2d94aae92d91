//! Cell edit session state machine.
//!
//! ```text
//!          open              begin_commit          finish
//! Idle ──────────► Editing ──────────────► Committing ──────► Idle
//!                     │
//!                     │ begin_cancel                 finish
//!                     └──────────────────► Cancelling ──────► Idle
//! ```
//!
//! While a session is anywhere but `Idle`, the change feed leaves that cell
//! alone so remote updates never overwrite the draft.

use crate::model::CellKey;

/// Where the local edit session currently is.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EditState {
    #[default]
    Idle,
    Editing {
        key: CellKey,
        /// Value displayed when the session was opened.
        original: String,
        draft: String,
    },
    Committing {
        key: CellKey,
        original: String,
        value: String,
    },
    Cancelling {
        key: CellKey,
    },
}

/// Invalid transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditError {
    /// Another cell is already open.
    AlreadyEditing(CellKey),
    /// No cell is open for editing.
    NotEditing,
    /// The session is committing or cancelling.
    Busy(CellKey),
}

impl std::fmt::Display for EditError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EditError::AlreadyEditing(key) => write!(f, "Cell {key} is already being edited"),
            EditError::NotEditing => write!(f, "No cell is being edited"),
            EditError::Busy(key) => write!(f, "Edit of cell {key} is being finished"),
        }
    }
}

impl std::error::Error for EditError {}

/// What a commit has to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitIntent {
    pub key: CellKey,
    pub original: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The draft equals the pre-edit value: nothing to write.
    Unchanged(CellKey),
    Write(CommitIntent),
}

/// Edit session of the local actor. One cell at a time.
#[derive(Debug, Default)]
pub struct EditSession {
    state: EditState,
}

impl EditSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &EditState {
        &self.state
    }

    /// Cell currently protected from remote overwrites, if any.
    pub fn editing_key(&self) -> Option<CellKey> {
        match &self.state {
            EditState::Idle => None,
            EditState::Editing { key, .. }
            | EditState::Committing { key, .. }
            | EditState::Cancelling { key } => Some(*key),
        }
    }

    pub fn is_editing(&self, key: CellKey) -> bool {
        self.editing_key() == Some(key)
    }

    /// `Idle -> Editing`, capturing the displayed value.
    pub fn open(&mut self, key: CellKey, current: impl Into<String>) -> Result<(), EditError> {
        match &self.state {
            EditState::Idle => {
                let original = current.into();
                self.state = EditState::Editing {
                    key,
                    draft: original.clone(),
                    original,
                };
                Ok(())
            }
            EditState::Editing { key: open, .. } => Err(EditError::AlreadyEditing(*open)),
            EditState::Committing { key: open, .. } | EditState::Cancelling { key: open } => {
                Err(EditError::Busy(*open))
            }
        }
    }

    pub fn update_draft(&mut self, value: impl Into<String>) -> Result<(), EditError> {
        match &mut self.state {
            EditState::Editing { draft, .. } => {
                *draft = value.into();
                Ok(())
            }
            EditState::Idle => Err(EditError::NotEditing),
            EditState::Committing { key, .. } | EditState::Cancelling { key } => {
                Err(EditError::Busy(*key))
            }
        }
    }

    /// `Editing -> Committing`.
    pub fn begin_commit(&mut self) -> Result<CommitOutcome, EditError> {
        let (key, original, draft) = match &self.state {
            EditState::Editing {
                key,
                original,
                draft,
            } => (*key, original.clone(), draft.clone()),
            EditState::Idle => return Err(EditError::NotEditing),
            EditState::Committing { key, .. } | EditState::Cancelling { key } => {
                return Err(EditError::Busy(*key))
            }
        };

        let outcome = if draft == original {
            CommitOutcome::Unchanged(key)
        } else {
            CommitOutcome::Write(CommitIntent {
                key,
                original: original.clone(),
                value: draft.clone(),
            })
        };
        self.state = EditState::Committing {
            key,
            original,
            value: draft,
        };
        Ok(outcome)
    }

    /// `Editing -> Cancelling`. Returns the cell whose draft is dropped.
    pub fn begin_cancel(&mut self) -> Result<CellKey, EditError> {
        match &self.state {
            EditState::Editing { key, .. } => {
                let key = *key;
                self.state = EditState::Cancelling { key };
                Ok(key)
            }
            EditState::Idle => Err(EditError::NotEditing),
            EditState::Committing { key, .. } | EditState::Cancelling { key } => {
                Err(EditError::Busy(*key))
            }
        }
    }

    /// `Committing | Cancelling -> Idle`.
    pub fn finish(&mut self) {
        if !matches!(self.state, EditState::Editing { .. }) {
            self.state = EditState::Idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_cycle() {
        let mut session = EditSession::new();
        let key = CellKey::new(1, 2);
        session.open(key, "old").unwrap();
        session.update_draft("new").unwrap();

        let outcome = session.begin_commit().unwrap();
        assert_eq!(
            outcome,
            CommitOutcome::Write(CommitIntent {
                key,
                original: "old".into(),
                value: "new".into(),
            })
        );
        // Still protected while the write is in flight.
        assert!(session.is_editing(key));

        session.finish();
        assert_eq!(session.state(), &EditState::Idle);
        assert_eq!(session.editing_key(), None);
    }

    #[test]
    fn test_unchanged_commit_writes_nothing() {
        let mut session = EditSession::new();
        let key = CellKey::new(0, 0);
        session.open(key, "same").unwrap();
        session.update_draft("other").unwrap();
        session.update_draft("same").unwrap();
        assert_eq!(session.begin_commit().unwrap(), CommitOutcome::Unchanged(key));
    }

    #[test]
    fn test_cancel_cycle() {
        let mut session = EditSession::new();
        let key = CellKey::new(3, 3);
        session.open(key, "").unwrap();
        assert_eq!(session.begin_cancel().unwrap(), key);
        assert_eq!(session.state(), &EditState::Cancelling { key });
        session.finish();
        assert_eq!(session.state(), &EditState::Idle);
    }

    #[test]
    fn test_invalid_transitions() {
        let mut session = EditSession::new();
        assert_eq!(session.begin_commit(), Err(EditError::NotEditing));
        assert_eq!(session.begin_cancel(), Err(EditError::NotEditing));
        assert_eq!(session.update_draft("x"), Err(EditError::NotEditing));

        let key = CellKey::new(0, 1);
        session.open(key, "a").unwrap();
        assert_eq!(
            session.open(CellKey::new(5, 5), "b"),
            Err(EditError::AlreadyEditing(key))
        );

        session.begin_commit().unwrap();
        assert_eq!(session.begin_commit(), Err(EditError::Busy(key)));
        assert_eq!(session.update_draft("z"), Err(EditError::Busy(key)));

        // finish never leaves an open editor.
        session.finish();
        session.open(key, "a").unwrap();
        session.finish();
        assert!(session.is_editing(key));
    }
}
