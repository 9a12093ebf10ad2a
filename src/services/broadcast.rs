use crate::db::{poll::PollId, token::Token};
use crate::websocket::DisplayClient;
use actix::prelude::*;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// Change notifications pushed to the displays watching a poll.
#[derive(Message, Clone, Debug, PartialEq)]
#[rtype(result = "()")]
pub enum PollEvent {
    CredentialScanned { poll_id: PollId, token: Token },
    CredentialConsumed { poll_id: PollId, token: Token },
    ResultsChanged { poll_id: PollId },
    PollDeleted { poll_id: PollId },
}

impl PollEvent {
    pub fn poll_id(&self) -> &PollId {
        match self {
            PollEvent::CredentialScanned { poll_id, .. }
            | PollEvent::CredentialConsumed { poll_id, .. }
            | PollEvent::ResultsChanged { poll_id }
            | PollEvent::PollDeleted { poll_id } => poll_id,
        }
    }
}

#[derive(Message, Clone)]
#[rtype(result = "()")]
pub struct Subscribe {
    pub poll_id: PollId,
    pub addr: Addr<DisplayClient>,
}

#[derive(Message, Clone)]
#[rtype(result = "()")]
pub struct Unsubscribe {
    pub poll_id: PollId,
    pub addr: Addr<DisplayClient>,
}

#[derive(Message)]
#[rtype(result = "usize")]
pub struct SubscriberCount(pub PollId);

// Actor
#[derive(Default)]
pub struct BroadcastActor {
    subscribers: HashMap<PollId, HashSet<Addr<DisplayClient>>>,
}

impl BroadcastActor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Actor for BroadcastActor {
    type Context = Context<Self>;

    fn started(&mut self, _ctx: &mut Self::Context) {
        info!("Broadcast actor started");
    }
}

impl Handler<Subscribe> for BroadcastActor {
    type Result = ();

    fn handle(&mut self, msg: Subscribe, _ctx: &mut Context<Self>) -> Self::Result {
        debug!(poll_id = %msg.poll_id, "Adding display to broadcast");
        self.subscribers
            .entry(msg.poll_id)
            .or_default()
            .insert(msg.addr);
    }
}

impl Handler<Unsubscribe> for BroadcastActor {
    type Result = ();

    fn handle(&mut self, msg: Unsubscribe, _ctx: &mut Context<Self>) -> Self::Result {
        debug!(poll_id = %msg.poll_id, "Removing display from broadcast");
        if let Some(clients) = self.subscribers.get_mut(&msg.poll_id) {
            clients.remove(&msg.addr);
            if clients.is_empty() {
                self.subscribers.remove(&msg.poll_id);
            }
        }
    }
}

impl Handler<SubscriberCount> for BroadcastActor {
    type Result = usize;

    fn handle(&mut self, msg: SubscriberCount, _ctx: &mut Context<Self>) -> Self::Result {
        self.subscribers.get(&msg.0).map_or(0, HashSet::len)
    }
}

impl Handler<PollEvent> for BroadcastActor {
    type Result = ();

    fn handle(&mut self, msg: PollEvent, _ctx: &mut Context<Self>) -> Self::Result {
        let clients = match self.subscribers.get_mut(msg.poll_id()) {
            Some(clients) => clients,
            None => return,
        };
        clients.retain(|client| client.connected());
        debug!(
            "Broadcasting {event:?} to clients. Number of clients: {clients}",
            event = msg,
            clients = clients.len()
        );
        for client in clients.iter() {
            client.do_send(msg.clone());
        }
        if let PollEvent::PollDeleted { poll_id } = &msg {
            self.subscribers.remove(poll_id);
        }
    }
}
