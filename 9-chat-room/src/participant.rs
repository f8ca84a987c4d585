use std::{fmt, sync::Arc};

use tokio::sync::mpsc;

/// A broadcast payload. Immutable and shared between every recipient.
pub type Message = Arc<str>;

/// Consumer half of a participant's outbound queue, drained by the write pump.
pub type Outbox = mpsc::Receiver<Message>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new() -> Self {
        Self(nanoid::nanoid!())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ParticipantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hub-side record of one connection.
///
/// Holds the only producer handle of the participant's outbound queue. Once
/// joined, the hub owns it, and dropping it is what closes the queue.
#[derive(Debug)]
pub struct Participant {
    id: ParticipantId,
    outbound: mpsc::Sender<Message>,
}

impl Participant {
    /// Creates a participant with a fresh bounded queue of `capacity` slots
    /// (at least one) and returns the queue's consumer half alongside it.
    pub fn new(capacity: usize) -> (Self, Outbox) {
        let (outbound, outbox) = mpsc::channel(capacity.max(1));
        let participant = Self {
            id: ParticipantId::new(),
            outbound,
        };
        (participant, outbox)
    }

    pub fn id(&self) -> &ParticipantId {
        &self.id
    }

    pub(crate) fn into_parts(self) -> (ParticipantId, mpsc::Sender<Message>) {
        (self.id, self.outbound)
    }
}
