//! JSON shapes shared by the HTTP routes and the display socket.

use crate::db::{
    poll::{InternalOption, InternalPoll, OptionId, PollId},
    token::{InternalCredential, Token, TokenStatus},
    vote::{InternalVote, VoteId},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PollOption {
    pub id: OptionId,
    pub text: String,
    pub count: u64,
}

impl From<InternalOption> for PollOption {
    fn from(option: InternalOption) -> Self {
        Self {
            id: option.id,
            text: option.text,
            count: option.count,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Poll {
    pub id: PollId,
    pub title: String,
    pub options: Vec<PollOption>,
    pub total_votes: u64,
    pub is_active: bool,
    pub owner: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<InternalPoll> for Poll {
    fn from(poll: InternalPoll) -> Self {
        let total_votes = poll.total_votes();
        Self {
            id: poll.id,
            title: poll.title,
            options: poll.options.into_iter().map(PollOption::from).collect(),
            total_votes,
            is_active: poll.is_active,
            owner: poll.owner,
            created_at: poll.created_at,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub id: VoteId,
    pub poll_id: PollId,
    pub option_id: OptionId,
    pub token: Token,
    pub created_at: DateTime<Utc>,
}

impl From<InternalVote> for Vote {
    fn from(vote: InternalVote) -> Self {
        Self {
            id: vote.id,
            poll_id: vote.poll_id,
            option_id: vote.option_id,
            token: vote.token,
            created_at: vote.created_at,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub token: Token,
    pub poll_id: PollId,
    pub status: TokenStatus,
    pub created_at: DateTime<Utc>,
}

impl From<InternalCredential> for Credential {
    fn from(credential: InternalCredential) -> Self {
        Self {
            token: credential.token,
            poll_id: credential.poll_id,
            status: credential.status,
            created_at: credential.created_at,
        }
    }
}

/// What a display renders as a QR code.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CurrentToken {
    pub token: Token,
    pub poll_id: PollId,
    pub status: TokenStatus,
    pub vote_url: String,
    pub rotated: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanAck {
    pub scanned: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CreatePollRequest {
    pub title: String,
    pub options: Vec<String>,
    #[serde(default)]
    pub owner: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CastVoteRequest {
    pub option_id: OptionId,
    pub token: Token,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct CurrentTokenRequest {
    #[serde(default)]
    pub previous_token: Option<Token>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct SimulateVoteRequest {
    #[serde(default)]
    pub token: Option<Token>,
}
