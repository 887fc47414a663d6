//! Container lifecycle event streaming.
//!
//! Every state transition of every handle a [`Harness`](crate::harness::Harness)
//! drives is published on a broadcast channel; an [`EventListener`]
//! receives those published after it subscribed.

use berth_common::types::{ContainerId, ContainerState, StateChange};
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

/// A container lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerEvent {
    /// A container changed state.
    StateChange {
        /// Name of the container that changed.
        container: String,
        /// Runtime id, once assigned.
        container_id: Option<ContainerId>,
        /// Previous state.
        from: ContainerState,
        /// New state.
        to: ContainerState,
        /// When the change happened.
        at: DateTime<Utc>,
    },
    /// The listener fell behind and missed events.
    Lagged {
        /// Number of events skipped.
        skipped: u64,
    },
}

impl From<StateChange> for ContainerEvent {
    fn from(change: StateChange) -> Self {
        Self::StateChange {
            container: change.container,
            container_id: change.id,
            from: change.transition.from,
            to: change.transition.to,
            at: change.transition.at,
        }
    }
}

/// Listens for container lifecycle events.
#[derive(Debug)]
pub struct EventListener {
    receiver: broadcast::Receiver<StateChange>,
}

impl EventListener {
    pub(crate) const fn new(receiver: broadcast::Receiver<StateChange>) -> Self {
        Self { receiver }
    }

    /// Waits for the next event. Returns `None` once the harness is gone.
    pub async fn recv(&mut self) -> Option<ContainerEvent> {
        match self.receiver.recv().await {
            Ok(change) => Some(change.into()),
            Err(RecvError::Lagged(skipped)) => Some(ContainerEvent::Lagged { skipped }),
            Err(RecvError::Closed) => None,
        }
    }

    /// Returns the next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<ContainerEvent> {
        match self.receiver.try_recv() {
            Ok(change) => Some(change.into()),
            Err(TryRecvError::Lagged(skipped)) => Some(ContainerEvent::Lagged { skipped }),
            Err(TryRecvError::Empty | TryRecvError::Closed) => None,
        }
    }

    /// Drains every queued event.
    pub fn drain(&mut self) -> Vec<ContainerEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
