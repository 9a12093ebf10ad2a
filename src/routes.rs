use crate::api::{
    CastVoteRequest, CreatePollRequest, Credential, CurrentToken, CurrentTokenRequest, Poll,
    ScanAck, SimulateVoteRequest, Vote,
};
use crate::config::Config;
use crate::db::{poll::PollId, token::Token};
use crate::error::VoteError;
use crate::services::poll::{CreatePoll, DeletePoll, GetPoll, ListPolls, ListVotes, SetPollActive};
use crate::services::token::{EnsureCurrentToken, GetTokenStatus, IssueToken, MarkScanned};
use crate::services::vote::{CastVote, GetVoteStats, PrepareVote, SimulateVote};
use crate::services::Services;
use crate::span::SpanMessage;
use actix_web::{web, HttpResponse};
use sqlx::types::Uuid;
use tracing::instrument;

#[instrument(skip(services, body))]
pub async fn create_poll(
    services: web::Data<Services>,
    body: web::Json<CreatePollRequest>,
) -> Result<HttpResponse, VoteError> {
    let CreatePollRequest {
        title,
        options,
        owner,
    } = body.into_inner();
    let poll = services
        .polls
        .send(SpanMessage::new(CreatePoll {
            title,
            options,
            owner,
        }))
        .await??;
    Ok(HttpResponse::Created().json(Poll::from(poll)))
}

#[instrument(skip(services))]
pub async fn list_polls(services: web::Data<Services>) -> Result<HttpResponse, VoteError> {
    let polls = services.polls.send(SpanMessage::new(ListPolls)).await??;
    let polls: Vec<Poll> = polls.into_iter().map(Poll::from).collect();
    Ok(HttpResponse::Ok().json(polls))
}

#[instrument(skip(services))]
pub async fn get_poll(
    services: web::Data<Services>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, VoteError> {
    let poll = services
        .polls
        .send(SpanMessage::new(GetPoll(PollId(path.into_inner()))))
        .await??;
    Ok(HttpResponse::Ok().json(Poll::from(poll)))
}

#[instrument(skip(services))]
pub async fn delete_poll(
    services: web::Data<Services>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, VoteError> {
    services
        .polls
        .send(SpanMessage::new(DeletePoll(PollId(path.into_inner()))))
        .await??;
    Ok(HttpResponse::NoContent().finish())
}

async fn set_poll_active(
    services: &Services,
    poll_id: PollId,
    active: bool,
) -> Result<HttpResponse, VoteError> {
    let poll = services
        .polls
        .send(SpanMessage::new(SetPollActive { poll_id, active }))
        .await??;
    Ok(HttpResponse::Ok().json(Poll::from(poll)))
}

#[instrument(skip(services))]
pub async fn close_poll(
    services: web::Data<Services>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, VoteError> {
    set_poll_active(&services, PollId(path.into_inner()), false).await
}

#[instrument(skip(services))]
pub async fn reopen_poll(
    services: web::Data<Services>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, VoteError> {
    set_poll_active(&services, PollId(path.into_inner()), true).await
}

#[instrument(skip(services))]
pub async fn list_votes(
    services: web::Data<Services>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, VoteError> {
    let votes = services
        .polls
        .send(SpanMessage::new(ListVotes(PollId(path.into_inner()))))
        .await??;
    let votes: Vec<Vote> = votes.into_iter().map(Vote::from).collect();
    Ok(HttpResponse::Ok().json(votes))
}

#[instrument(skip(services))]
pub async fn issue_token(
    services: web::Data<Services>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, VoteError> {
    let credential = services
        .tokens
        .send(SpanMessage::new(IssueToken(PollId(path.into_inner()))))
        .await??;
    Ok(HttpResponse::Created().json(Credential::from(credential)))
}

#[instrument(skip(services, config, body))]
pub async fn current_token(
    services: web::Data<Services>,
    config: web::Data<Config>,
    path: web::Path<Uuid>,
    body: Option<web::Json<CurrentTokenRequest>>,
) -> Result<HttpResponse, VoteError> {
    let previous = body.and_then(|body| body.into_inner().previous_token);
    let rotation = services
        .tokens
        .send(SpanMessage::new(EnsureCurrentToken {
            poll_id: PollId(path.into_inner()),
            previous,
        }))
        .await??;
    let credential = rotation.credential;
    Ok(HttpResponse::Ok().json(CurrentToken {
        vote_url: config.vote_url(&credential.poll_id, &credential.token),
        token: credential.token,
        poll_id: credential.poll_id,
        status: credential.status,
        rotated: rotation.rotated,
    }))
}

#[instrument(skip(services))]
pub async fn token_status(
    services: web::Data<Services>,
    path: web::Path<String>,
) -> Result<HttpResponse, VoteError> {
    let credential = services
        .tokens
        .send(SpanMessage::new(GetTokenStatus(Token(path.into_inner()))))
        .await??;
    Ok(HttpResponse::Ok().json(Credential::from(credential)))
}

#[instrument(skip(services))]
pub async fn mark_scanned(
    services: web::Data<Services>,
    path: web::Path<String>,
) -> Result<HttpResponse, VoteError> {
    let scanned = services
        .tokens
        .send(SpanMessage::new(MarkScanned(Token(path.into_inner()))))
        .await??;
    Ok(HttpResponse::Ok().json(ScanAck { scanned }))
}

#[instrument(skip(services))]
pub async fn prepare_vote(
    services: web::Data<Services>,
    path: web::Path<(Uuid, String)>,
) -> Result<HttpResponse, VoteError> {
    let (poll_id, token) = path.into_inner();
    let poll = services
        .votes
        .send(SpanMessage::new(PrepareVote {
            poll_id: PollId(poll_id),
            token: Token(token),
        }))
        .await??;
    Ok(HttpResponse::Ok().json(Poll::from(poll)))
}

#[instrument(skip(services, body))]
pub async fn cast_vote(
    services: web::Data<Services>,
    path: web::Path<Uuid>,
    body: web::Json<CastVoteRequest>,
) -> Result<HttpResponse, VoteError> {
    let CastVoteRequest { option_id, token } = body.into_inner();
    let vote = services
        .votes
        .send(SpanMessage::new(CastVote {
            poll_id: PollId(path.into_inner()),
            option_id,
            token,
        }))
        .await??;
    Ok(HttpResponse::Created().json(Vote::from(vote)))
}

#[instrument(skip(services, body))]
pub async fn simulate_vote(
    services: web::Data<Services>,
    path: web::Path<Uuid>,
    body: Option<web::Json<SimulateVoteRequest>>,
) -> Result<HttpResponse, VoteError> {
    let token = body.and_then(|body| body.into_inner().token);
    let vote = services
        .votes
        .send(SpanMessage::new(SimulateVote {
            poll_id: PollId(path.into_inner()),
            token,
        }))
        .await??;
    Ok(HttpResponse::Created().json(Vote::from(vote)))
}

#[instrument(skip(services))]
pub async fn vote_stats(services: web::Data<Services>) -> Result<HttpResponse, VoteError> {
    let stats = services.votes.send(GetVoteStats).await?;
    Ok(HttpResponse::Ok().json(stats))
}
