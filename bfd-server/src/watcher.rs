//! Lossless fan-out of session state transitions
//!
//! Each watcher pairs an unbounded intermediate queue with a bounded
//! consumer channel. `notify` never blocks the session (the producer side
//! is unbounded); a drain task forwards events into the bounded channel so
//! a slow consumer exerts back-pressure only on its own queue, never on
//! the session. Events arrive in commit order.

use std::sync::Weak;

use tokio::sync::mpsc;

use crate::peer_state::PeerState;
use crate::session::Session;

/// Consumer-side channel depth; overflow accumulates in the unbounded queue
const WATCHER_DEPTH: usize = 8;

/// A session state transition, published once per change of
/// `local.session_state`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub local: PeerState,
    pub remote: PeerState,
}

/// Producer half held in the session's watcher list
pub(crate) struct WatcherHandle {
    pub(crate) id: u64,
    tx: mpsc::UnboundedSender<StateChange>,
}

impl WatcherHandle {
    /// Returns false once the drain task is gone and the handle can be pruned
    pub(crate) fn notify(&self, event: StateChange) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Consumer half returned by [`Session::watch`]
pub struct Watcher {
    id: u64,
    session: Weak<Session>,
    rx: mpsc::Receiver<StateChange>,
}

pub(crate) fn new_watcher(id: u64, session: Weak<Session>) -> (WatcherHandle, Watcher) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::channel(WATCHER_DEPTH);

    tokio::spawn(drain_loop(event_rx, out_tx));

    (
        WatcherHandle { id, tx: event_tx },
        Watcher {
            id,
            session,
            rx: out_rx,
        },
    )
}

/// Forwards buffered events to the consumer until either side closes
async fn drain_loop(
    mut event_rx: mpsc::UnboundedReceiver<StateChange>,
    out_tx: mpsc::Sender<StateChange>,
) {
    while let Some(event) = event_rx.recv().await {
        if out_tx.send(event).await.is_err() {
            // consumer dropped without stop(); discard the rest
            return;
        }
    }
}

impl Watcher {
    /// Receive the next state transition.
    ///
    /// Returns `None` once the watcher is stopped or its session is gone
    /// (clean end-of-stream).
    pub async fn recv(&mut self) -> Option<StateChange> {
        self.rx.recv().await
    }

    /// Deregister from the session and drain any buffered events
    pub async fn stop(mut self) {
        if let Some(session) = self.session.upgrade() {
            session.remove_watcher(self.id);
        }

        // the producer side is closed now; consume until end-of-stream so
        // no event is left dangling in the drain task
        while self.rx.recv().await.is_some() {}
    }
}
