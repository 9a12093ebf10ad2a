use super::broadcast::{BroadcastActor, PollEvent};
use crate::async_message_handler_with_span;
use crate::db::{
    poll::PollId,
    token::{InternalCredential, Token, TokenStatus},
    Store,
};
use crate::error::VoteError;
use actix::prelude::*;
use chrono::Utc;
use futures::future::LocalBoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Issues a fresh credential for an open poll.
pub async fn issue_token(
    store: &dyn Store,
    poll_id: &PollId,
) -> Result<InternalCredential, VoteError> {
    let poll = store
        .poll_by_id(poll_id)
        .await?
        .ok_or(VoteError::PollNotFound)?;
    if !poll.is_active {
        return Err(VoteError::PollClosed);
    }
    let credential = store
        .issue(poll_id)
        .await?
        .ok_or(VoteError::PollNotFound)?;
    debug!(poll_id = %poll_id, token = %credential.token, "Issued credential");
    Ok(credential)
}

pub async fn token_status(
    store: &dyn Store,
    token: &Token,
) -> Result<InternalCredential, VoteError> {
    store
        .credential(token)
        .await?
        .ok_or(VoteError::CredentialNotFound)
}

/// Best-effort `Active -> Scanned`. False means the credential is unknown or
/// already past `Active`.
pub async fn mark_scanned(store: &dyn Store, token: &Token) -> Result<bool, VoteError> {
    let scanned = store
        .transition(token, TokenStatus::Active, TokenStatus::Scanned)
        .await?;
    if !scanned {
        debug!(token = %token, "Credential already past active, scan ignored");
    }
    Ok(scanned)
}

#[derive(Clone, Debug, PartialEq)]
pub struct Rotation {
    pub credential: InternalCredential,
    /// True when `credential` was issued by this call.
    pub rotated: bool,
}

/// Keeps the display's credential fresh. The previous credential is kept
/// while it is still `Active`; once scanned, used, retired or moved to another
/// poll, a replacement is issued. Never returns a `Used` credential.
pub async fn ensure_current_token(
    store: &dyn Store,
    poll_id: &PollId,
    previous: Option<&Token>,
) -> Result<Rotation, VoteError> {
    let poll = store
        .poll_by_id(poll_id)
        .await?
        .ok_or(VoteError::PollNotFound)?;
    if !poll.is_active {
        return Err(VoteError::PollClosed);
    }
    if let Some(token) = previous {
        match store.credential(token).await? {
            Some(credential)
                if &credential.poll_id == poll_id && !credential.status.is_consumed() =>
            {
                return Ok(Rotation {
                    credential,
                    rotated: false,
                });
            }
            Some(credential) => {
                debug!(token = %token, status = %credential.status, "Rotating consumed credential");
            }
            None => {
                debug!(token = %token, "Previous credential gone, rotating");
            }
        }
    }
    let credential = issue_token(store, poll_id).await?;
    Ok(Rotation {
        credential,
        rotated: true,
    })
}

pub struct TokenService {
    store: Arc<dyn Store>,
    broadcast: Addr<BroadcastActor>,
    token_ttl: Duration,
    sweep_interval: Duration,
}

impl TokenService {
    pub fn new(
        store: Arc<dyn Store>,
        broadcast: Addr<BroadcastActor>,
        token_ttl: Duration,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            store,
            broadcast,
            token_ttl,
            sweep_interval,
        }
    }

    fn sweep(&mut self, ctx: &mut Context<Self>) {
        let store = self.store.clone();
        let ttl = match chrono::Duration::from_std(self.token_ttl) {
            Ok(ttl) => ttl,
            Err(err) => {
                error!("Token ttl out of range, skipping sweep: {}", err);
                return;
            }
        };
        ctx.spawn(
            async move {
                match store.retire_credentials(Utc::now() - ttl).await {
                    Ok(0) => {}
                    Ok(retired) => info!(retired, "Retired expired credentials"),
                    Err(err) => error!("Failed to retire expired credentials: {}", err),
                }
            }
            .into_actor(self),
        );
    }
}

impl Actor for TokenService {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("Token service started");
        ctx.run_interval(self.sweep_interval, |act, ctx| act.sweep(ctx));
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!("Token service stopped");
    }
}

#[derive(Message, Clone, Debug)]
#[rtype(result = "Result<InternalCredential, VoteError>")]
pub struct IssueToken(pub PollId);

async_message_handler_with_span! {
    impl AsyncSpanHandler<IssueToken> for TokenService {
        fn handle(&mut self, msg: IssueToken, _ctx: &mut Context<Self>) -> LocalBoxFuture<'static, Result<InternalCredential, VoteError>> {
            let store = self.store.clone();
            Box::pin(async move { issue_token(store.as_ref(), &msg.0).await })
        }
    }
}

#[derive(Message, Clone, Debug)]
#[rtype(result = "Result<InternalCredential, VoteError>")]
pub struct GetTokenStatus(pub Token);

async_message_handler_with_span! {
    impl AsyncSpanHandler<GetTokenStatus> for TokenService {
        fn handle(&mut self, msg: GetTokenStatus, _ctx: &mut Context<Self>) -> LocalBoxFuture<'static, Result<InternalCredential, VoteError>> {
            let store = self.store.clone();
            Box::pin(async move { token_status(store.as_ref(), &msg.0).await })
        }
    }
}

#[derive(Message, Clone, Debug)]
#[rtype(result = "Result<bool, VoteError>")]
pub struct MarkScanned(pub Token);

async_message_handler_with_span! {
    impl AsyncSpanHandler<MarkScanned> for TokenService {
        fn handle(&mut self, msg: MarkScanned, _ctx: &mut Context<Self>) -> LocalBoxFuture<'static, Result<bool, VoteError>> {
            let store = self.store.clone();
            let broadcast = self.broadcast.clone();
            Box::pin(async move {
                let MarkScanned(token) = msg;
                if !mark_scanned(store.as_ref(), &token).await? {
                    return Ok(false);
                }
                match store.credential(&token).await {
                    Ok(Some(credential)) => broadcast.do_send(PollEvent::CredentialScanned {
                        poll_id: credential.poll_id,
                        token,
                    }),
                    Ok(None) => {}
                    Err(err) => warn!("Scanned credential could not be re-read: {}", err),
                }
                Ok(true)
            })
        }
    }
}

#[derive(Message, Clone, Debug)]
#[rtype(result = "Result<Rotation, VoteError>")]
pub struct EnsureCurrentToken {
    pub poll_id: PollId,
    pub previous: Option<Token>,
}

async_message_handler_with_span! {
    impl AsyncSpanHandler<EnsureCurrentToken> for TokenService {
        fn handle(&mut self, msg: EnsureCurrentToken, _ctx: &mut Context<Self>) -> LocalBoxFuture<'static, Result<Rotation, VoteError>> {
            let store = self.store.clone();
            Box::pin(async move {
                ensure_current_token(store.as_ref(), &msg.poll_id, msg.previous.as_ref()).await
            })
        }
    }
}
