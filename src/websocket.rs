use crate::api::{CurrentToken, Poll, Vote};
use crate::config::Config;
use crate::db::{poll::PollId, token::Token};
use crate::error::VoteError;
use crate::services::broadcast::{PollEvent, Subscribe, Unsubscribe};
use crate::services::poll::GetPoll;
use crate::services::token::{EnsureCurrentToken, Rotation};
use crate::services::vote::SimulateVote;
use crate::services::Services;
use crate::span::SpanMessage;
use actix::prelude::*;
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IncomingMessage {
    /// Resend the poll and the current credential.
    Refresh,
    SimulateVote,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutgoingError {
    pub error: String,
    pub message: String,
}

impl From<&VoteError> for OutgoingError {
    fn from(err: &VoteError) -> Self {
        Self {
            error: err.code().to_owned(),
            message: err.public_message(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutgoingMessage {
    Poll(Poll),
    Token(CurrentToken),
    Simulated(Vote),
    Error(OutgoingError),
    Deleted { poll_id: PollId },
}

/// One connected display. Shows the live results of a poll and keeps a
/// fresh scan-to-vote credential on screen.
pub struct DisplayClient {
    poll_id: PollId,
    services: Services,
    config: Config,
    current: Option<Token>,
    rotating: bool,
}

impl DisplayClient {
    pub fn new(poll_id: PollId, services: Services, config: Config) -> Self {
        Self {
            poll_id,
            services,
            config,
            current: None,
            rotating: false,
        }
    }

    fn send_json<T: Serialize>(&self, ctx: &mut ws::WebsocketContext<Self>, value: &T) {
        match serde_json::to_string(value) {
            Ok(json) => ctx.text(json),
            Err(err) => error!("Failed to convert to JSON {}", err),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, err: &VoteError) {
        self.send_json(ctx, &OutgoingMessage::Error(err.into()));
    }

    fn poll_gone(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        info!(poll_id = %self.poll_id, "Poll deleted, closing display");
        self.send_json(
            ctx,
            &OutgoingMessage::Deleted {
                poll_id: self.poll_id.clone(),
            },
        );
        ctx.close(Some(ws::CloseCode::Normal.into()));
        ctx.stop();
    }

    fn send_poll(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let fut = self
            .services
            .polls
            .send(SpanMessage::new(GetPoll(self.poll_id.clone())))
            .into_actor(self)
            .map(|res, act, ctx| match res {
                Ok(Ok(poll)) => act.send_json(ctx, &OutgoingMessage::Poll(poll.into())),
                Ok(Err(VoteError::PollNotFound)) => act.poll_gone(ctx),
                Ok(Err(err)) => warn!("Failed to refresh results: {}", err),
                Err(err) => error!("Poll service unreachable: {}", err),
            });
        ctx.spawn(fut);
    }

    /// Checks the credential on screen and swaps it once it is scanned, used
    /// or gone. `announce` resends the credential even when it is unchanged.
    fn rotate(&mut self, ctx: &mut ws::WebsocketContext<Self>, announce: bool) {
        if self.rotating {
            return;
        }
        self.rotating = true;
        let fut = self
            .services
            .tokens
            .send(SpanMessage::new(EnsureCurrentToken {
                poll_id: self.poll_id.clone(),
                previous: self.current.clone(),
            }))
            .into_actor(self)
            .map(move |res, act, ctx| {
                act.rotating = false;
                match res {
                    Ok(Ok(rotation)) => act.show_credential(ctx, rotation, announce),
                    Ok(Err(VoteError::PollNotFound)) => act.poll_gone(ctx),
                    Ok(Err(VoteError::PollClosed)) => {
                        if act.current.take().is_some() {
                            debug!(poll_id = %act.poll_id, "Poll closed, credential withdrawn");
                            act.send_poll(ctx);
                        }
                    }
                    Ok(Err(err)) => warn!("Failed to check credential: {}", err),
                    Err(err) => error!("Token service unreachable: {}", err),
                }
            });
        ctx.spawn(fut);
    }

    fn show_credential(
        &mut self,
        ctx: &mut ws::WebsocketContext<Self>,
        rotation: Rotation,
        announce: bool,
    ) {
        let credential = rotation.credential;
        let changed = self.current.as_ref() != Some(&credential.token);
        if !changed && !announce {
            return;
        }
        if changed {
            debug!(poll_id = %self.poll_id, token = %credential.token, "Showing new credential");
        }
        self.current = Some(credential.token.clone());
        let message = OutgoingMessage::Token(CurrentToken {
            vote_url: self.config.vote_url(&credential.poll_id, &credential.token),
            token: credential.token,
            poll_id: credential.poll_id,
            status: credential.status,
            rotated: rotation.rotated,
        });
        self.send_json(ctx, &message);
    }

    fn simulate_vote(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let fut = self
            .services
            .votes
            .send(SpanMessage::new(SimulateVote {
                poll_id: self.poll_id.clone(),
                token: self.current.clone(),
            }))
            .into_actor(self)
            .map(|res, act, ctx| match res {
                Ok(Ok(vote)) => act.send_json(ctx, &OutgoingMessage::Simulated(vote.into())),
                Ok(Err(err)) => act.send_error(ctx, &err),
                Err(err) => error!("Vote service unreachable: {}", err),
            });
        ctx.spawn(fut);
    }
}

impl Actor for DisplayClient {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(poll_id = %self.poll_id, "New display client");
        self.services.broadcast.do_send(Subscribe {
            poll_id: self.poll_id.clone(),
            addr: ctx.address(),
        });
        self.send_poll(ctx);
        self.rotate(ctx, true);
        ctx.run_interval(self.config.token_check_interval, |act, ctx| {
            act.rotate(ctx, false)
        });
        ctx.run_interval(self.config.result_refresh_interval, |act, ctx| {
            act.send_poll(ctx)
        });
    }

    fn stopped(&mut self, ctx: &mut Self::Context) {
        info!(poll_id = %self.poll_id, "Display client left");
        self.services.broadcast.do_send(Unsubscribe {
            poll_id: self.poll_id.clone(),
            addr: ctx.address(),
        });
    }
}

impl Handler<PollEvent> for DisplayClient {
    type Result = ();

    fn handle(&mut self, msg: PollEvent, ctx: &mut Self::Context) {
        debug!("Display handling {:?}", msg);
        match msg {
            PollEvent::CredentialScanned { token, .. }
            | PollEvent::CredentialConsumed { token, .. } => {
                if self.current.as_ref() == Some(&token) {
                    self.rotate(ctx, false);
                }
            }
            PollEvent::ResultsChanged { .. } => self.send_poll(ctx),
            PollEvent::PollDeleted { .. } => self.poll_gone(ctx),
        }
    }
}

// Incoming messages from ws
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for DisplayClient {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<IncomingMessage>(&text) {
                Ok(IncomingMessage::Refresh) => {
                    debug!("Display requested refresh");
                    self.send_poll(ctx);
                    self.rotate(ctx, true);
                }
                Ok(IncomingMessage::SimulateVote) => {
                    debug!("Display requested simulated vote");
                    self.simulate_vote(ctx);
                }
                Err(err) => {
                    warn!("Unreadable display message: {}", err);
                    self.send_json(
                        ctx,
                        &OutgoingMessage::Error(OutgoingError {
                            error: "BAD_MESSAGE".to_owned(),
                            message: err.to_string(),
                        }),
                    );
                }
            },
            Ok(ws::Message::Ping(bytes)) => ctx.pong(&bytes),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                debug!("Got close message from WS. Reason: {:#?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(message) => {
                warn!("Display sent something else than text: {:#?}", message);
            }
            Err(err) => {
                error!("ProtocolError in StreamHandler {:#?}", err);
                ctx.stop();
            }
        }
    }
}
