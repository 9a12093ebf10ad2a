use super::broadcast::{BroadcastActor, PollEvent};
use crate::async_message_handler_with_span;
use crate::db::{
    poll::{InternalPoll, PollId},
    vote::InternalVote,
    Store,
};
use crate::error::VoteError;
use actix::prelude::*;
use futures::future::LocalBoxFuture;
use std::sync::Arc;
use tracing::{debug, info};

pub const MIN_OPTIONS: usize = 2;

/// Trims the inputs and rejects an empty title, blank options or fewer than
/// two options.
pub fn validate_poll(
    title: &str,
    option_texts: &[String],
) -> Result<(String, Vec<String>), VoteError> {
    let title = title.trim();
    if title.is_empty() {
        return Err(VoteError::Validation("title must not be empty".to_owned()));
    }
    let options: Vec<String> = option_texts.iter().map(|o| o.trim().to_owned()).collect();
    if options.iter().any(String::is_empty) {
        return Err(VoteError::Validation("options must not be blank".to_owned()));
    }
    if options.len() < MIN_OPTIONS {
        return Err(VoteError::Validation(format!(
            "a poll needs at least {} options",
            MIN_OPTIONS
        )));
    }
    Ok((title.to_owned(), options))
}

pub async fn create_poll(store: &dyn Store, msg: CreatePoll) -> Result<InternalPoll, VoteError> {
    let (title, options) = validate_poll(&msg.title, &msg.options)?;
    let poll = InternalPoll::new(title, options, msg.owner);
    store.insert_poll(&poll).await?;
    info!(poll_id = %poll.id, options = poll.options.len(), "Created poll");
    Ok(poll)
}

pub async fn get_poll(store: &dyn Store, poll_id: &PollId) -> Result<InternalPoll, VoteError> {
    store
        .poll_by_id(poll_id)
        .await?
        .ok_or(VoteError::PollNotFound)
}

pub struct PollService {
    store: Arc<dyn Store>,
    broadcast: Addr<BroadcastActor>,
}

impl PollService {
    pub fn new(store: Arc<dyn Store>, broadcast: Addr<BroadcastActor>) -> Self {
        Self { store, broadcast }
    }
}

impl Actor for PollService {
    type Context = Context<Self>;

    fn started(&mut self, _ctx: &mut Self::Context) {
        info!("Poll service started");
    }
}

#[derive(Message, Clone, Debug)]
#[rtype(result = "Result<InternalPoll, VoteError>")]
pub struct CreatePoll {
    pub title: String,
    pub options: Vec<String>,
    pub owner: Option<String>,
}

async_message_handler_with_span! {
    impl AsyncSpanHandler<CreatePoll> for PollService {
        fn handle(&mut self, msg: CreatePoll, _ctx: &mut Context<Self>) -> LocalBoxFuture<'static, Result<InternalPoll, VoteError>> {
            let store = self.store.clone();
            Box::pin(async move { create_poll(store.as_ref(), msg).await })
        }
    }
}

#[derive(Message, Clone, Debug)]
#[rtype(result = "Result<Vec<InternalPoll>, VoteError>")]
pub struct ListPolls;

async_message_handler_with_span! {
    impl AsyncSpanHandler<ListPolls> for PollService {
        fn handle(&mut self, _msg: ListPolls, _ctx: &mut Context<Self>) -> LocalBoxFuture<'static, Result<Vec<InternalPoll>, VoteError>> {
            let store = self.store.clone();
            Box::pin(async move {
                let polls = store.list_polls().await?;
                debug!("Listing {} polls", polls.len());
                Ok(polls)
            })
        }
    }
}

#[derive(Message, Clone, Debug)]
#[rtype(result = "Result<InternalPoll, VoteError>")]
pub struct GetPoll(pub PollId);

async_message_handler_with_span! {
    impl AsyncSpanHandler<GetPoll> for PollService {
        fn handle(&mut self, msg: GetPoll, _ctx: &mut Context<Self>) -> LocalBoxFuture<'static, Result<InternalPoll, VoteError>> {
            let store = self.store.clone();
            Box::pin(async move { get_poll(store.as_ref(), &msg.0).await })
        }
    }
}

#[derive(Message, Clone, Debug)]
#[rtype(result = "Result<(), VoteError>")]
pub struct DeletePoll(pub PollId);

async_message_handler_with_span! {
    impl AsyncSpanHandler<DeletePoll> for PollService {
        fn handle(&mut self, msg: DeletePoll, _ctx: &mut Context<Self>) -> LocalBoxFuture<'static, Result<(), VoteError>> {
            let store = self.store.clone();
            let broadcast = self.broadcast.clone();
            Box::pin(async move {
                let DeletePoll(poll_id) = msg;
                if !store.delete_poll(&poll_id).await? {
                    return Err(VoteError::PollNotFound);
                }
                info!(poll_id = %poll_id, "Deleted poll with its credentials and votes");
                broadcast.do_send(PollEvent::PollDeleted { poll_id });
                Ok(())
            })
        }
    }
}

/// Closes or reopens a poll. Counts are untouched either way.
#[derive(Message, Clone, Debug)]
#[rtype(result = "Result<InternalPoll, VoteError>")]
pub struct SetPollActive {
    pub poll_id: PollId,
    pub active: bool,
}

async_message_handler_with_span! {
    impl AsyncSpanHandler<SetPollActive> for PollService {
        fn handle(&mut self, msg: SetPollActive, _ctx: &mut Context<Self>) -> LocalBoxFuture<'static, Result<InternalPoll, VoteError>> {
            let store = self.store.clone();
            let broadcast = self.broadcast.clone();
            Box::pin(async move {
                if !store.set_poll_active(&msg.poll_id, msg.active).await? {
                    return Err(VoteError::PollNotFound);
                }
                info!(poll_id = %msg.poll_id, active = msg.active, "Changed poll state");
                broadcast.do_send(PollEvent::ResultsChanged { poll_id: msg.poll_id.clone() });
                get_poll(store.as_ref(), &msg.poll_id).await
            })
        }
    }
}

#[derive(Message, Clone, Debug)]
#[rtype(result = "Result<Vec<InternalVote>, VoteError>")]
pub struct ListVotes(pub PollId);

async_message_handler_with_span! {
    impl AsyncSpanHandler<ListVotes> for PollService {
        fn handle(&mut self, msg: ListVotes, _ctx: &mut Context<Self>) -> LocalBoxFuture<'static, Result<Vec<InternalVote>, VoteError>> {
            let store = self.store.clone();
            Box::pin(async move {
                get_poll(store.as_ref(), &msg.0).await?;
                Ok(store.votes_for_poll(&msg.0).await?)
            })
        }
    }
}
