use super::{
    poll::{InternalOption, InternalPoll, OptionId, PollId},
    token::{InternalCredential, Token, TokenInsert, TokenStatus},
    vote::{ConsumeOutcome, InternalVote, VoteId},
    Store, StoreError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{types::Uuid, PgPool};
use std::collections::HashMap;
use tracing::{debug, instrument};

#[derive(sqlx::FromRow)]
struct PollRow {
    id: Uuid,
    title: String,
    owner: Option<String>,
    created_at: DateTime<Utc>,
    is_active: bool,
}

#[derive(sqlx::FromRow)]
struct OptionRow {
    poll_id: Uuid,
    id: Uuid,
    text: String,
    vote_count: i64,
}

#[derive(sqlx::FromRow)]
struct TokenRow {
    token: String,
    poll_id: Uuid,
    status: String,
    created_at: DateTime<Utc>,
    scanned_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct VoteRow {
    id: Uuid,
    poll_id: Uuid,
    option_id: Uuid,
    token: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<OptionRow> for InternalOption {
    type Error = StoreError;

    fn try_from(row: OptionRow) -> Result<Self, Self::Error> {
        let count = u64::try_from(row.vote_count)
            .map_err(|_| StoreError::Corrupt(format!("negative vote count on {}", row.id)))?;
        Ok(Self {
            id: OptionId(row.id),
            text: row.text,
            count,
        })
    }
}

impl TryFrom<TokenRow> for InternalCredential {
    type Error = StoreError;

    fn try_from(row: TokenRow) -> Result<Self, Self::Error> {
        Ok(Self {
            status: row.status.parse().map_err(StoreError::Corrupt)?,
            token: Token(row.token),
            poll_id: PollId(row.poll_id),
            created_at: row.created_at,
            scanned_at: row.scanned_at,
        })
    }
}

impl From<VoteRow> for InternalVote {
    fn from(row: VoteRow) -> Self {
        Self {
            id: VoteId(row.id),
            poll_id: PollId(row.poll_id),
            option_id: OptionId(row.option_id),
            token: Token(row.token),
            created_at: row.created_at,
        }
    }
}

fn assemble(row: PollRow, options: Vec<OptionRow>) -> Result<InternalPoll, StoreError> {
    Ok(InternalPoll {
        id: PollId(row.id),
        title: row.title,
        options: options
            .into_iter()
            .map(InternalOption::try_from)
            .collect::<Result<_, _>>()?,
        created_at: row.created_at,
        is_active: row.is_active,
        owner: row.owner,
    })
}

/// Postgres-backed store. Credential compare-and-set is a conditional
/// `UPDATE`, so the row lock taken by the first writer serialises racing
/// voters and the loser re-reads the committed status.
#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects and applies pending migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let store = Self::new(super::new_pool(database_url).await?);
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }

    async fn poll_exists(&self, id: &PollId) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM polls WHERE id = $1)")
            .bind(id.0)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }
}

#[async_trait]
impl Store for PgStore {
    #[instrument(skip(self, poll), fields(poll_id = %poll.id))]
    async fn insert_poll(&self, poll: &InternalPoll) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO polls (id, title, owner, created_at, is_active) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(poll.id.0)
        .bind(&poll.title)
        .bind(&poll.owner)
        .bind(poll.created_at)
        .bind(poll.is_active)
        .execute(&mut *tx)
        .await?;
        for (position, option) in poll.options.iter().enumerate() {
            sqlx::query(
                "INSERT INTO poll_options (poll_id, id, position, text, vote_count) VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(poll.id.0)
            .bind(option.id.0)
            .bind(position as i32)
            .bind(&option.text)
            .bind(option.count as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!("Inserted poll with {} options", poll.options.len());
        Ok(())
    }

    async fn poll_by_id(&self, id: &PollId) -> Result<Option<InternalPoll>, StoreError> {
        let row: Option<PollRow> = sqlx::query_as(
            "SELECT id, title, owner, created_at, is_active FROM polls WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };
        let options: Vec<OptionRow> = sqlx::query_as(
            "SELECT poll_id, id, text, vote_count FROM poll_options WHERE poll_id = $1 ORDER BY position",
        )
        .bind(id.0)
        .fetch_all(&self.pool)
        .await?;
        assemble(row, options).map(Some)
    }

    async fn list_polls(&self) -> Result<Vec<InternalPoll>, StoreError> {
        let rows: Vec<PollRow> = sqlx::query_as(
            "SELECT id, title, owner, created_at, is_active FROM polls ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        let ids: Vec<Uuid> = rows.iter().map(|row| row.id).collect();
        let option_rows: Vec<OptionRow> = sqlx::query_as(
            "SELECT poll_id, id, text, vote_count FROM poll_options WHERE poll_id = ANY($1) ORDER BY poll_id, position",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;
        let mut options: HashMap<Uuid, Vec<OptionRow>> = HashMap::new();
        for option in option_rows {
            options.entry(option.poll_id).or_default().push(option);
        }
        rows.into_iter()
            .map(|row| {
                let poll_options = options.remove(&row.id).unwrap_or_default();
                assemble(row, poll_options)
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn delete_poll(&self, id: &PollId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM polls WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_poll_active(&self, id: &PollId, active: bool) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE polls SET is_active = $2 WHERE id = $1")
            .bind(id.0)
            .bind(active)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn increment_option(
        &self,
        poll_id: &PollId,
        option_id: &OptionId,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE poll_options SET vote_count = vote_count + 1 WHERE poll_id = $1 AND id = $2",
        )
        .bind(poll_id.0)
        .bind(option_id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn append_vote(&self, vote: &InternalVote) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO votes (id, poll_id, option_id, token, created_at)
            SELECT $1, $2, $3, $4, $5 WHERE EXISTS (SELECT 1 FROM polls WHERE id = $2)
            ON CONFLICT (token) DO NOTHING
            "#,
        )
        .bind(vote.id.0)
        .bind(vote.poll_id.0)
        .bind(vote.option_id.0)
        .bind(vote.token.as_str())
        .bind(vote.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn votes_for_poll(&self, poll_id: &PollId) -> Result<Vec<InternalVote>, StoreError> {
        let rows: Vec<VoteRow> = sqlx::query_as(
            "SELECT id, poll_id, option_id, token, created_at FROM votes WHERE poll_id = $1 ORDER BY created_at",
        )
        .bind(poll_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(InternalVote::from).collect())
    }

    async fn insert_credential(
        &self,
        credential: &InternalCredential,
    ) -> Result<TokenInsert, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO tokens (token, poll_id, status, created_at, scanned_at)
            SELECT $1, $2, $3, $4, $5 WHERE EXISTS (SELECT 1 FROM polls WHERE id = $2)
            ON CONFLICT (token) DO NOTHING
            "#,
        )
        .bind(credential.token.as_str())
        .bind(credential.poll_id.0)
        .bind(credential.status.as_str())
        .bind(credential.created_at)
        .bind(credential.scanned_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            Ok(TokenInsert::Inserted)
        } else if self.poll_exists(&credential.poll_id).await? {
            Ok(TokenInsert::Duplicate)
        } else {
            Ok(TokenInsert::UnknownPoll)
        }
    }

    async fn credential(&self, token: &Token) -> Result<Option<InternalCredential>, StoreError> {
        let row: Option<TokenRow> = sqlx::query_as(
            "SELECT token, poll_id, status, created_at, scanned_at FROM tokens WHERE token = $1",
        )
        .bind(token.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(InternalCredential::try_from).transpose()
    }

    async fn transition(
        &self,
        token: &Token,
        from: TokenStatus,
        to: TokenStatus,
    ) -> Result<bool, StoreError> {
        if from == TokenStatus::Used || to == TokenStatus::Used {
            return Ok(false);
        }
        let scanned_at = match to {
            TokenStatus::Scanned => Some(Utc::now()),
            _ => None,
        };
        let result = sqlx::query(
            "UPDATE tokens SET status = $3, scanned_at = $4 WHERE token = $1 AND status = $2",
        )
        .bind(token.as_str())
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(scanned_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, vote), fields(poll_id = %vote.poll_id, token = %vote.token))]
    async fn consume_and_tally(
        &self,
        vote: &InternalVote,
        expected: TokenStatus,
    ) -> Result<ConsumeOutcome, StoreError> {
        if expected == TokenStatus::Used {
            return Ok(ConsumeOutcome::Conflict);
        }
        // Dropping `tx` without commit rolls every step back.
        let mut tx = self.pool.begin().await?;
        let consumed = sqlx::query(
            "UPDATE tokens SET status = 'used' WHERE token = $1 AND poll_id = $2 AND status = $3",
        )
        .bind(vote.token.as_str())
        .bind(vote.poll_id.0)
        .bind(expected.as_str())
        .execute(&mut *tx)
        .await?;
        if consumed.rows_affected() != 1 {
            let owner: Option<Uuid> =
                sqlx::query_scalar("SELECT poll_id FROM tokens WHERE token = $1")
                    .bind(vote.token.as_str())
                    .fetch_optional(&mut *tx)
                    .await?;
            return Ok(match owner {
                Some(poll_id) if poll_id == vote.poll_id.0 => ConsumeOutcome::Conflict,
                _ => ConsumeOutcome::CredentialMissing,
            });
        }
        let counted = sqlx::query(
            "UPDATE poll_options SET vote_count = vote_count + 1 WHERE poll_id = $1 AND id = $2",
        )
        .bind(vote.poll_id.0)
        .bind(vote.option_id.0)
        .execute(&mut *tx)
        .await?;
        if counted.rows_affected() != 1 {
            return Ok(ConsumeOutcome::OptionMissing);
        }
        sqlx::query(
            "INSERT INTO votes (id, poll_id, option_id, token, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(vote.id.0)
        .bind(vote.poll_id.0)
        .bind(vote.option_id.0)
        .bind(vote.token.as_str())
        .bind(vote.created_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(ConsumeOutcome::Consumed)
    }

    async fn retire_credentials(&self, idle_before: DateTime<Utc>) -> Result<u64, StoreError> {
        // For unconsumed rows scanned_at is set only once scanned, so this
        // is the scan time or else the issue time
        let result = sqlx::query(
            "DELETE FROM tokens WHERE status <> 'used' AND COALESCE(scanned_at, created_at) < $1",
        )
        .bind(idle_before)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
