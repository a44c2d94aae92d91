//! Online/offline state, fed by the runtime network stack.
//!
//! Pure state: no retries and no I/O. Repeated reports of the same state are
//! swallowed so subscribers see each physical transition exactly once.

use tokio::sync::watch;

/// Connection state as seen by a table session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

impl From<bool> for Connectivity {
    fn from(online: bool) -> Self {
        if online {
            Connectivity::Online
        } else {
            Connectivity::Offline
        }
    }
}

/// Shared online flag with transition notifications.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    tx: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _) = watch::channel(initially_online);
        Self { tx }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn state(&self) -> Connectivity {
        self.is_online().into()
    }

    /// Report the current network state.
    ///
    /// Returns `true` if this was a transition.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
        if changed {
            log::info!("Connectivity changed: {:?}", Connectivity::from(online));
        }
        changed
    }

    /// Receiver that wakes on every transition.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
