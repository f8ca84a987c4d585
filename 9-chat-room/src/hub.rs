//! The room's coordination loop.
//!
//! [`Hub`] owns the membership set and every participant's outbound producer.
//! It runs on a single task and is driven entirely by commands arriving on
//! one FIFO mailbox, so membership needs no lock and the hub sees each
//! producer's joins, leaves and messages in the order they were submitted.
//! Everyone else talks to it through a cloneable [`HubHandle`].

use std::{collections::HashMap, future::Future, sync::Arc};

use anyhow::{Result, anyhow};
use tokio::{
    select,
    sync::{mpsc, oneshot},
};
use tracing::{debug, info};

use crate::{
    participant::{Message, Participant, ParticipantId},
    trace::Tracer,
};

#[derive(Debug)]
enum HubCommand {
    Join(Participant),
    Leave(ParticipantId),
    Forward(Message),
    MemberCount(oneshot::Sender<usize>),
}

pub struct Hub {
    mailbox: mpsc::UnboundedReceiver<HubCommand>,
    members: HashMap<ParticipantId, mpsc::Sender<Message>>,
    tracer: Arc<dyn Tracer>,
}

impl Hub {
    pub fn new(tracer: Arc<dyn Tracer>) -> (Self, HubHandle) {
        let (commands, mailbox) = mpsc::unbounded_channel();
        let hub = Self {
            mailbox,
            members: HashMap::new(),
            tracer,
        };
        (hub, HubHandle { commands })
    }

    /// Runs until every [`HubHandle`] has been dropped.
    pub async fn run(self) {
        self.run_until(std::future::pending()).await;
    }

    /// Runs until `shutdown` resolves or every [`HubHandle`] has been dropped.
    /// Remaining members are dropped on exit, closing their outbound queues.
    pub async fn run_until<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!(members = self.members.len(), "hub shutting down");
                    break;
                }
                command = self.mailbox.recv() => match command {
                    Some(command) => self.handle(command),
                    None => {
                        debug!("all hub handles dropped");
                        break;
                    }
                },
            }
        }

        self.close_all();
    }

    fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Join(participant) => self.join(participant),
            HubCommand::Leave(id) => self.leave(&id),
            HubCommand::Forward(message) => self.broadcast(message),
            HubCommand::MemberCount(respond_to) => {
                let _ = respond_to.send(self.members.len());
            }
        }
    }

    fn join(&mut self, participant: Participant) {
        let (id, outbound) = participant.into_parts();
        self.tracer.trace(&[&"participant joined", &id]);
        self.members.insert(id, outbound);
    }

    fn leave(&mut self, id: &ParticipantId) {
        // Removing drops the producer, which is what closes the queue. An id
        // that is already gone (evicted earlier) has nothing left to close.
        match self.members.remove(id) {
            Some(outbound) => {
                drop(outbound);
                self.tracer.trace(&[&"participant left", id]);
            }
            None => self.tracer.trace(&[&"leave ignored for", id]),
        }
    }

    fn broadcast(&mut self, message: Message) {
        let tracer = &self.tracer;
        self.members.retain(|id, outbound| {
            match outbound.try_send(Message::clone(&message)) {
                Ok(()) => {
                    tracer.trace(&[&" -- sent to", id]);
                    true
                }
                // Full: a slow reader is dropped instead of stalling the room.
                // Closed: its write pump has already gone away.
                Err(_) => {
                    tracer.trace(&[&" -- failed to send, cleaned up", id]);
                    false
                }
            }
        });
    }

    fn close_all(&mut self) {
        for (id, outbound) in self.members.drain() {
            drop(outbound);
            self.tracer.trace(&[&"participant closed at shutdown", &id]);
        }
    }
}

/// Producer side of the hub mailbox.
///
/// Every operation is a non-blocking enqueue and only fails once the hub task
/// has stopped.
#[derive(Debug, Clone)]
pub struct HubHandle {
    commands: mpsc::UnboundedSender<HubCommand>,
}

impl HubHandle {
    pub fn join(&self, participant: Participant) -> Result<()> {
        self.send(HubCommand::Join(participant))
    }

    /// Must be called once per joined participant. Delivery to it stops as
    /// soon as the hub processes the request.
    pub fn leave(&self, id: &ParticipantId) -> Result<()> {
        self.send(HubCommand::Leave(id.clone()))
    }

    pub fn forward(&self, message: Message) -> Result<()> {
        self.send(HubCommand::Forward(message))
    }

    /// Current number of members, answered after every command queued before it.
    pub async fn member_count(&self) -> Result<usize> {
        let (respond_to, response) = oneshot::channel();
        self.send(HubCommand::MemberCount(respond_to))?;
        response
            .await
            .map_err(|_| anyhow!("hub stopped before answering member count"))
    }

    fn send(&self, command: HubCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow!("hub is no longer running"))
    }
}
