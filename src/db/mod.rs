pub mod memory;
pub mod poll;
pub mod postgres;
pub mod token;
pub mod vote;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use poll::{InternalPoll, OptionId, PollId};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    PgPool,
};
use std::sync::PoisonError;
use thiserror::Error;
use token::{InternalCredential, Token, TokenInsert, TokenStatus};
use tracing::debug;
use vote::{ConsumeOutcome, InternalVote};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("in-memory store lock poisoned")]
    Poisoned,
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl<T> From<PoisonError<T>> for StoreError {
    fn from(_: PoisonError<T>) -> Self {
        StoreError::Poisoned
    }
}

/// Durable state for polls, credentials and vote records.
///
/// Every method is a single atomic step against the backing store. The only
/// multi-entity write is [`Store::consume_and_tally`], which must commit the
/// credential's `Used` transition, the option increment and the vote record
/// together or not at all.
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_poll(&self, poll: &InternalPoll) -> Result<(), StoreError>;

    async fn poll_by_id(&self, id: &PollId) -> Result<Option<InternalPoll>, StoreError>;

    /// Newest first.
    async fn list_polls(&self) -> Result<Vec<InternalPoll>, StoreError>;

    /// Removes the poll with its credentials and vote records. Returns false
    /// when the poll did not exist.
    async fn delete_poll(&self, id: &PollId) -> Result<bool, StoreError>;

    async fn set_poll_active(&self, id: &PollId, active: bool) -> Result<bool, StoreError>;

    /// Standalone counter primitive. The voting path never calls it: votes go
    /// through [`Store::consume_and_tally`], which keeps counts equal to the
    /// number of vote records.
    async fn increment_option(
        &self,
        poll_id: &PollId,
        option_id: &OptionId,
    ) -> Result<bool, StoreError>;

    /// Append-only. Returns false when the poll is unknown or the credential
    /// already has a record. Standalone primitive; on its own it leaves the
    /// option counts behind, so votes go through [`Store::consume_and_tally`].
    async fn append_vote(&self, vote: &InternalVote) -> Result<bool, StoreError>;

    async fn votes_for_poll(&self, poll_id: &PollId) -> Result<Vec<InternalVote>, StoreError>;

    async fn insert_credential(
        &self,
        credential: &InternalCredential,
    ) -> Result<TokenInsert, StoreError>;

    async fn credential(&self, token: &Token) -> Result<Option<InternalCredential>, StoreError>;

    /// Compare-and-set on credential status. Moves `token` to `to` only if its
    /// current status is `from`. Transitions into or out of `Used` are refused
    /// here; consumption goes through [`Store::consume_and_tally`].
    async fn transition(
        &self,
        token: &Token,
        from: TokenStatus,
        to: TokenStatus,
    ) -> Result<bool, StoreError>;

    async fn consume_and_tally(
        &self,
        vote: &InternalVote,
        expected: TokenStatus,
    ) -> Result<ConsumeOutcome, StoreError>;

    /// Deletes unconsumed credentials whose last activity is before
    /// `idle_before`. Active credentials age from issuance, scanned ones from
    /// the scan, so a voter who just scanned keeps their credential.
    async fn retire_credentials(&self, idle_before: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Creates a fresh `Active` credential for the poll. `None` if the poll
    /// does not exist.
    async fn issue(&self, poll_id: &PollId) -> Result<Option<InternalCredential>, StoreError> {
        loop {
            let credential = InternalCredential::new(poll_id.clone());
            match self.insert_credential(&credential).await? {
                TokenInsert::Inserted => return Ok(Some(credential)),
                TokenInsert::UnknownPoll => return Ok(None),
                TokenInsert::Duplicate => {
                    debug!("Generated token collided, drawing another");
                }
            }
        }
    }
}

pub async fn new_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    new_pool_with(database_url.parse()?).await
}

pub async fn new_pool_with(connect_options: PgConnectOptions) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect_with(connect_options)
        .await
}
