use super::broadcast::{BroadcastActor, PollEvent};
use super::token::issue_token;
use crate::async_message_handler_with_span;
use crate::db::{
    poll::{InternalPoll, OptionId, PollId},
    token::{Token, TokenStatus},
    vote::{ConsumeOutcome, InternalVote},
    Store,
};
use crate::error::VoteError;
use actix::prelude::*;
use futures::future::LocalBoxFuture;
use rand::seq::SliceRandom;
use serde::Serialize;
use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Consumes `token` and records one vote for `option_id`.
///
/// The credential is read once to reject unknown, foreign or used tokens,
/// then consumed with a compare-and-set against the status that was read.
/// The status change, the option increment and the vote record commit
/// together, so a racing caller holding the same token observes the new
/// status and fails with `CredentialConflict`. Never retried here.
pub async fn cast_vote(store: &dyn Store, msg: CastVote) -> Result<InternalVote, VoteError> {
    let CastVote {
        poll_id,
        option_id,
        token,
    } = msg;
    let credential = store
        .credential(&token)
        .await?
        .ok_or(VoteError::InvalidCredential)?;
    if credential.poll_id != poll_id || credential.status == TokenStatus::Used {
        return Err(VoteError::InvalidCredential);
    }
    let poll = store
        .poll_by_id(&poll_id)
        .await?
        .ok_or(VoteError::InvalidCredential)?;
    if !poll.is_active {
        return Err(VoteError::PollClosed);
    }
    if poll.option(&option_id).is_none() {
        return Err(VoteError::UnknownOption);
    }

    let vote = InternalVote::new(poll_id, option_id, token);
    match store.consume_and_tally(&vote, credential.status).await? {
        ConsumeOutcome::Consumed => {
            info!(poll_id = %vote.poll_id, option_id = %vote.option_id, "Vote recorded");
            Ok(vote)
        }
        ConsumeOutcome::Conflict => Err(VoteError::CredentialConflict),
        ConsumeOutcome::CredentialMissing => Err(VoteError::InvalidCredential),
        ConsumeOutcome::OptionMissing => Err(VoteError::UnknownOption),
    }
}

/// What the voting page needs after a scan: validates the credential, marks
/// it scanned when still active and returns the poll. The flag is true only
/// when this call moved the credential to `Scanned`.
pub async fn prepare_vote(
    store: &dyn Store,
    poll_id: &PollId,
    token: &Token,
) -> Result<(InternalPoll, bool), VoteError> {
    let credential = store
        .credential(token)
        .await?
        .ok_or(VoteError::InvalidCredential)?;
    if &credential.poll_id != poll_id || credential.status == TokenStatus::Used {
        return Err(VoteError::InvalidCredential);
    }
    let poll = store
        .poll_by_id(poll_id)
        .await?
        .ok_or(VoteError::InvalidCredential)?;
    if !poll.is_active {
        return Err(VoteError::PollClosed);
    }
    let scanned = credential.status == TokenStatus::Active
        && store
            .transition(token, TokenStatus::Active, TokenStatus::Scanned)
            .await?;
    Ok((poll, scanned))
}

/// Votes for a random option. Uses `token` when given, otherwise issues one.
/// A rejected credential is replaced once and the vote retried once.
pub async fn simulate_vote(
    store: &dyn Store,
    poll_id: &PollId,
    token: Option<Token>,
) -> Result<InternalVote, VoteError> {
    let poll = store
        .poll_by_id(poll_id)
        .await?
        .ok_or(VoteError::PollNotFound)?;
    let option_id = poll
        .options
        .choose(&mut rand::thread_rng())
        .map(|option| option.id.clone())
        .ok_or_else(|| VoteError::Validation("poll has no options".to_owned()))?;
    let token = match token {
        Some(token) => token,
        None => issue_token(store, poll_id).await?.token,
    };
    let attempt = CastVote {
        poll_id: poll_id.clone(),
        option_id: option_id.clone(),
        token,
    };
    match cast_vote(store, attempt).await {
        Err(err) if err.is_rejected_credential() => {
            debug!("Simulated vote rejected ({}), retrying with a fresh credential", err);
            let token = issue_token(store, poll_id).await?.token;
            cast_vote(
                store,
                CastVote {
                    poll_id: poll_id.clone(),
                    option_id,
                    token,
                },
            )
            .await
        }
        result => result,
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct VoteStats {
    pub accepted: u64,
    pub invalid_credential: u64,
    pub credential_conflict: u64,
}

#[derive(Default)]
struct Counters {
    accepted: Cell<u64>,
    invalid_credential: Cell<u64>,
    credential_conflict: Cell<u64>,
}

impl Counters {
    fn bump(cell: &Cell<u64>) {
        cell.set(cell.get() + 1);
    }

    fn snapshot(&self) -> VoteStats {
        VoteStats {
            accepted: self.accepted.get(),
            invalid_credential: self.invalid_credential.get(),
            credential_conflict: self.credential_conflict.get(),
        }
    }
}

// Actor
pub struct VoteActor {
    store: Arc<dyn Store>,
    broadcast: Addr<BroadcastActor>,
    counters: Rc<Counters>,
}

impl VoteActor {
    pub fn new(store: Arc<dyn Store>, broadcast: Addr<BroadcastActor>) -> Self {
        Self {
            store,
            broadcast,
            counters: Rc::new(Counters::default()),
        }
    }
}

impl Actor for VoteActor {
    type Context = Context<Self>;

    fn started(&mut self, _ctx: &mut Self::Context) {
        info!("Vote actor started");
    }
}

/// Tallies the outcome and tells the displays about a consumed credential.
fn record_outcome(
    counters: &Counters,
    broadcast: &Addr<BroadcastActor>,
    result: &Result<InternalVote, VoteError>,
) {
    match result {
        Ok(vote) => {
            Counters::bump(&counters.accepted);
            broadcast.do_send(PollEvent::CredentialConsumed {
                poll_id: vote.poll_id.clone(),
                token: vote.token.clone(),
            });
            broadcast.do_send(PollEvent::ResultsChanged {
                poll_id: vote.poll_id.clone(),
            });
        }
        Err(VoteError::InvalidCredential) => {
            Counters::bump(&counters.invalid_credential);
            warn!(outcome = "invalid_credential", "Vote rejected");
        }
        Err(VoteError::CredentialConflict) => {
            Counters::bump(&counters.credential_conflict);
            warn!(outcome = "credential_conflict", "Vote rejected");
        }
        Err(err @ VoteError::StoreUnavailable(_)) => {
            error!("Vote could not be confirmed: {}", err);
        }
        Err(err) => debug!("Vote rejected: {}", err),
    }
}

#[derive(Message, Clone, Debug)]
#[rtype(result = "Result<InternalVote, VoteError>")]
pub struct CastVote {
    pub poll_id: PollId,
    pub option_id: OptionId,
    pub token: Token,
}

async_message_handler_with_span! {
    impl AsyncSpanHandler<CastVote> for VoteActor {
        fn handle(&mut self, msg: CastVote, _ctx: &mut Context<Self>) -> LocalBoxFuture<'static, Result<InternalVote, VoteError>> {
            let store = self.store.clone();
            let broadcast = self.broadcast.clone();
            let counters = self.counters.clone();
            Box::pin(async move {
                debug!("VoteActor handling CastVote");
                let result = cast_vote(store.as_ref(), msg).await;
                record_outcome(&counters, &broadcast, &result);
                result
            })
        }
    }
}

#[derive(Message, Clone, Debug)]
#[rtype(result = "Result<InternalPoll, VoteError>")]
pub struct PrepareVote {
    pub poll_id: PollId,
    pub token: Token,
}

async_message_handler_with_span! {
    impl AsyncSpanHandler<PrepareVote> for VoteActor {
        fn handle(&mut self, msg: PrepareVote, _ctx: &mut Context<Self>) -> LocalBoxFuture<'static, Result<InternalPoll, VoteError>> {
            let store = self.store.clone();
            let broadcast = self.broadcast.clone();
            Box::pin(async move {
                let (poll, scanned) = prepare_vote(store.as_ref(), &msg.poll_id, &msg.token).await?;
                if scanned {
                    broadcast.do_send(PollEvent::CredentialScanned {
                        poll_id: msg.poll_id,
                        token: msg.token,
                    });
                }
                Ok(poll)
            })
        }
    }
}

#[derive(Message, Clone, Debug)]
#[rtype(result = "Result<InternalVote, VoteError>")]
pub struct SimulateVote {
    pub poll_id: PollId,
    pub token: Option<Token>,
}

async_message_handler_with_span! {
    impl AsyncSpanHandler<SimulateVote> for VoteActor {
        fn handle(&mut self, msg: SimulateVote, _ctx: &mut Context<Self>) -> LocalBoxFuture<'static, Result<InternalVote, VoteError>> {
            let store = self.store.clone();
            let broadcast = self.broadcast.clone();
            let counters = self.counters.clone();
            Box::pin(async move {
                let result = simulate_vote(store.as_ref(), &msg.poll_id, msg.token).await;
                record_outcome(&counters, &broadcast, &result);
                result
            })
        }
    }
}

#[derive(Message)]
#[rtype(result = "VoteStats")]
pub struct GetVoteStats;

impl Handler<GetVoteStats> for VoteActor {
    type Result = MessageResult<GetVoteStats>;

    fn handle(&mut self, _msg: GetVoteStats, _ctx: &mut Context<Self>) -> Self::Result {
        MessageResult(self.counters.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::services::token::{mark_scanned, token_status};

    async fn best_color(store: &dyn Store) -> InternalPoll {
        let poll = InternalPoll::new(
            "Best Color".to_owned(),
            vec!["Red".to_owned(), "Blue".to_owned()],
            None,
        );
        store.insert_poll(&poll).await.unwrap();
        poll
    }

    fn vote_for(poll: &InternalPoll, option: usize, token: &Token) -> CastVote {
        CastVote {
            poll_id: poll.id.clone(),
            option_id: poll.options[option].id.clone(),
            token: token.clone(),
        }
    }

    async fn counts(store: &dyn Store, poll_id: &PollId) -> Vec<u64> {
        let poll = store.poll_by_id(poll_id).await.unwrap().unwrap();
        poll.options.iter().map(|o| o.count).collect()
    }

    #[actix_rt::test]
    async fn credential_votes_once() {
        let store = MemoryStore::new();
        let poll = best_color(&store).await;
        let token = issue_token(&store, &poll.id).await.unwrap().token;

        cast_vote(&store, vote_for(&poll, 0, &token)).await.unwrap();
        let second = cast_vote(&store, vote_for(&poll, 1, &token)).await;
        assert!(matches!(second, Err(VoteError::InvalidCredential)));
        let third = cast_vote(&store, vote_for(&poll, 0, &token)).await;
        assert!(matches!(third, Err(VoteError::InvalidCredential)));

        assert_eq!(counts(&store, &poll.id).await, vec![1, 0]);
    }

    #[actix_rt::test]
    async fn scanned_credential_can_vote() {
        let store = MemoryStore::new();
        let poll = best_color(&store).await;
        let token = issue_token(&store, &poll.id).await.unwrap().token;

        assert_eq!(
            token_status(&store, &token).await.unwrap().status,
            TokenStatus::Active
        );
        assert!(mark_scanned(&store, &token).await.unwrap());
        assert_eq!(
            token_status(&store, &token).await.unwrap().status,
            TokenStatus::Scanned
        );
        cast_vote(&store, vote_for(&poll, 1, &token)).await.unwrap();
        assert_eq!(
            token_status(&store, &token).await.unwrap().status,
            TokenStatus::Used
        );
    }

    #[actix_rt::test]
    async fn foreign_credential_changes_nothing() {
        let store = MemoryStore::new();
        let poll = best_color(&store).await;
        let other = best_color(&store).await;
        let token = issue_token(&store, &other.id).await.unwrap().token;

        let result = cast_vote(&store, vote_for(&poll, 0, &token)).await;
        assert!(matches!(result, Err(VoteError::InvalidCredential)));
        assert_eq!(counts(&store, &poll.id).await, vec![0, 0]);
        assert_eq!(counts(&store, &other.id).await, vec![0, 0]);
        assert_eq!(
            token_status(&store, &token).await.unwrap().status,
            TokenStatus::Active
        );
    }

    #[actix_rt::test]
    async fn unknown_option_leaves_credential_active() {
        let store = MemoryStore::new();
        let poll = best_color(&store).await;
        let token = issue_token(&store, &poll.id).await.unwrap().token;

        let result = cast_vote(
            &store,
            CastVote {
                poll_id: poll.id.clone(),
                option_id: OptionId::new(),
                token: token.clone(),
            },
        )
        .await;
        assert!(matches!(result, Err(VoteError::UnknownOption)));
        assert_eq!(
            token_status(&store, &token).await.unwrap().status,
            TokenStatus::Active
        );
    }

    #[actix_rt::test]
    async fn unknown_token_is_invalid() {
        let store = MemoryStore::new();
        let poll = best_color(&store).await;
        let result = cast_vote(&store, vote_for(&poll, 0, &Token::generate())).await;
        assert!(matches!(result, Err(VoteError::InvalidCredential)));
    }

    #[actix_rt::test]
    async fn closed_poll_rejects_votes() {
        let store = MemoryStore::new();
        let poll = best_color(&store).await;
        let token = issue_token(&store, &poll.id).await.unwrap().token;
        store.set_poll_active(&poll.id, false).await.unwrap();

        let result = cast_vote(&store, vote_for(&poll, 0, &token)).await;
        assert!(matches!(result, Err(VoteError::PollClosed)));
        assert_eq!(counts(&store, &poll.id).await, vec![0, 0]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_votes_with_one_token_count_once() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let poll = best_color(store.as_ref()).await;

        for _ in 0..20 {
            let token = issue_token(store.as_ref(), &poll.id).await.unwrap().token;
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let store = store.clone();
                    let msg = vote_for(&poll, i % 2, &token);
                    tokio::spawn(async move { cast_vote(store.as_ref(), msg).await })
                })
                .collect();
            let mut successes = 0;
            for handle in handles {
                match handle.await.unwrap() {
                    Ok(_) => successes += 1,
                    Err(err) => assert!(err.is_rejected_credential(), "unexpected {:?}", err),
                }
            }
            assert_eq!(successes, 1);
        }

        let total: u64 = counts(store.as_ref(), &poll.id).await.iter().sum();
        assert_eq!(total, 20);
        assert_eq!(store.votes_for_poll(&poll.id).await.unwrap().len(), 20);
    }

    #[actix_rt::test]
    async fn prepare_marks_scanned_and_rejects_used() {
        let store = MemoryStore::new();
        let poll = best_color(&store).await;
        let token = issue_token(&store, &poll.id).await.unwrap().token;

        let (prepared, scanned) = prepare_vote(&store, &poll.id, &token).await.unwrap();
        assert_eq!(prepared.id, poll.id);
        assert!(scanned);
        assert_eq!(
            token_status(&store, &token).await.unwrap().status,
            TokenStatus::Scanned
        );
        // Reloading the page keeps the credential usable but scans nothing new
        let (_, scanned_again) = prepare_vote(&store, &poll.id, &token).await.unwrap();
        assert!(!scanned_again);
        cast_vote(&store, vote_for(&poll, 0, &token)).await.unwrap();
        assert!(matches!(
            prepare_vote(&store, &poll.id, &token).await,
            Err(VoteError::InvalidCredential)
        ));
    }

    #[actix_rt::test]
    async fn simulate_retries_once_with_fresh_credential() {
        let store = MemoryStore::new();
        let poll = best_color(&store).await;
        let spent = issue_token(&store, &poll.id).await.unwrap().token;
        cast_vote(&store, vote_for(&poll, 0, &spent)).await.unwrap();

        let vote = simulate_vote(&store, &poll.id, Some(spent.clone()))
            .await
            .unwrap();
        assert_ne!(vote.token, spent);
        assert_eq!(counts(&store, &poll.id).await.iter().sum::<u64>(), 2);
    }

    #[actix_rt::test]
    async fn actor_counts_outcomes() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let poll = best_color(store.as_ref()).await;
        let broadcast = BroadcastActor::new().start();
        let actor = VoteActor::new(store.clone(), broadcast).start();
        let token = issue_token(store.as_ref(), &poll.id).await.unwrap().token;

        use crate::span::SpanMessage;
        actor
            .send(SpanMessage::new(vote_for(&poll, 0, &token)))
            .await
            .unwrap()
            .unwrap();
        let rejected = actor
            .send(SpanMessage::new(vote_for(&poll, 1, &token)))
            .await
            .unwrap();
        assert!(rejected.unwrap_err().is_rejected_credential());

        let stats = actor.send(GetVoteStats).await.unwrap();
        assert_eq!(
            stats,
            VoteStats {
                accepted: 1,
                invalid_credential: 1,
                credential_conflict: 0,
            }
        );
    }
}
