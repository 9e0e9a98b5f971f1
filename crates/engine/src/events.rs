use async_channel::{Receiver, Sender};

use tidepool_core::RowId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
}

/// Emitted after a write to the Local Store commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub table: String,
    pub id: RowId,
    pub change: ChangeKind,
    pub origin: ChangeOrigin,
}

/// Fan-out of change events to explicit subscribers.
#[derive(Default)]
pub struct EventBus {
    subscribers: Vec<Sender<ChangeEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> Receiver<ChangeEvent> {
        let (tx, rx) = async_channel::unbounded();
        self.subscribers.push(tx);
        rx
    }

    pub fn emit(&mut self, events: impl IntoIterator<Item = ChangeEvent>) {
        for event in events {
            // Unbounded channels only fail once the receiver is gone.
            self.subscribers
                .retain(|tx| tx.try_send(event.clone()).is_ok());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
