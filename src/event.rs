use crate::id::Entity;
use crate::index::TableId;
use crossbeam_channel::{Sender, TrySendError};

/// Structural events emitted by a world to subscribers.
/// See [`World::subscribe`](crate::world::World::subscribe).
#[derive(Debug, Clone)]
pub enum WorldEvent {
    /// A new table has been created.
    TableCreated(TableId),
    /// An entity arrived in a table.
    EntityMoved(Entity, TableId),
    /// An entity left the world.
    EntityDestroyed(Entity),
}

#[derive(Clone)]
pub(crate) struct Subscriber {
    sender: Sender<WorldEvent>,
}

/// Best-effort fan-out of [`WorldEvent`]s; disconnected subscribers are
/// pruned on send.
#[derive(Clone, Default)]
pub(crate) struct Subscribers {
    subscribers: Vec<Subscriber>,
}

impl Subscribers {
    pub fn new() -> Self { Self::default() }

    pub fn push(&mut self, sender: Sender<WorldEvent>) {
        self.subscribers.push(Subscriber { sender });
    }

    pub fn send(&mut self, message: WorldEvent) {
        for i in (0..self.subscribers.len()).rev() {
            if let Err(error) = self.subscribers[i].sender.try_send(message.clone()) {
                if let TrySendError::Disconnected(_) = error {
                    self.subscribers.swap_remove(i);
                }
            }
        }
    }
}
