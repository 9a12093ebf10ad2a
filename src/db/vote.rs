use super::{
    poll::{OptionId, PollId},
    token::Token,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Uuid;

#[derive(Clone, Hash, PartialEq, Eq, Debug, Deserialize, Serialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct VoteId(pub Uuid);

impl VoteId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for VoteId {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable audit entry, one per consumed credential.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct InternalVote {
    pub id: VoteId,
    pub poll_id: PollId,
    pub option_id: OptionId,
    pub token: Token,
    pub created_at: DateTime<Utc>,
}

impl InternalVote {
    pub fn new(poll_id: PollId, option_id: OptionId, token: Token) -> Self {
        Self {
            id: VoteId::new(),
            poll_id,
            option_id,
            token,
            created_at: Utc::now(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Credential is now `Used`, the option counted and the record written.
    Consumed,
    /// Credential status no longer matched the expected one.
    Conflict,
    /// Credential is gone or belongs to another poll.
    CredentialMissing,
    /// Target option (or its poll) is gone. Nothing was written.
    OptionMissing,
}
