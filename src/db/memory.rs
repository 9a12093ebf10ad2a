use super::{
    poll::{InternalPoll, OptionId, PollId},
    token::{InternalCredential, Token, TokenInsert, TokenStatus},
    vote::{ConsumeOutcome, InternalVote},
    Store, StoreError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::debug;

struct PollShard {
    poll: InternalPoll,
    credentials: HashMap<Token, InternalCredential>,
    votes: Vec<InternalVote>,
    deleted: bool,
}

type SharedShard = Arc<Mutex<PollShard>>;

/// Process-local store.
///
/// Each poll owns a shard behind its own mutex, holding the poll, its
/// credentials and its vote records. Writes for one poll never wait on
/// another poll. A separate index maps credential strings to their poll.
/// Lock order is shard before index; no lock is held while acquiring the
/// poll map.
#[derive(Default)]
pub struct MemoryStore {
    polls: RwLock<HashMap<PollId, SharedShard>>,
    tokens: RwLock<HashMap<Token, PollId>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn shard(&self, id: &PollId) -> Result<Option<SharedShard>, StoreError> {
        Ok(self.polls.read()?.get(id).cloned())
    }

    fn shard_for_token(&self, token: &Token) -> Result<Option<SharedShard>, StoreError> {
        let poll_id = self.tokens.read()?.get(token).cloned();
        match poll_id {
            Some(poll_id) => self.shard(&poll_id),
            None => Ok(None),
        }
    }

    fn shards(&self) -> Result<Vec<SharedShard>, StoreError> {
        Ok(self.polls.read()?.values().cloned().collect())
    }
}

fn lock(shard: &Mutex<PollShard>) -> Result<MutexGuard<'_, PollShard>, StoreError> {
    Ok(shard.lock()?)
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_poll(&self, poll: &InternalPoll) -> Result<(), StoreError> {
        let shard = PollShard {
            poll: poll.clone(),
            credentials: HashMap::new(),
            votes: Vec::new(),
            deleted: false,
        };
        self.polls
            .write()?
            .insert(poll.id.clone(), Arc::new(Mutex::new(shard)));
        Ok(())
    }

    async fn poll_by_id(&self, id: &PollId) -> Result<Option<InternalPoll>, StoreError> {
        let shard = match self.shard(id)? {
            Some(shard) => shard,
            None => return Ok(None),
        };
        let shard = lock(&shard)?;
        let poll = (!shard.deleted).then(|| shard.poll.clone());
        Ok(poll)
    }

    async fn list_polls(&self) -> Result<Vec<InternalPoll>, StoreError> {
        let mut polls = Vec::new();
        for shard in self.shards()? {
            let shard = lock(&shard)?;
            if !shard.deleted {
                polls.push(shard.poll.clone());
            }
        }
        polls.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(polls)
    }

    async fn delete_poll(&self, id: &PollId) -> Result<bool, StoreError> {
        let removed = self.polls.write()?.remove(id);
        let shard = match removed {
            Some(shard) => shard,
            None => return Ok(false),
        };
        let tokens: Vec<Token> = {
            let mut shard = lock(&shard)?;
            shard.deleted = true;
            shard.votes.clear();
            shard.credentials.drain().map(|(token, _)| token).collect()
        };
        let mut index = self.tokens.write()?;
        for token in &tokens {
            index.remove(token);
        }
        debug!(poll_id = %id, tokens = tokens.len(), "Removed poll shard");
        Ok(true)
    }

    async fn set_poll_active(&self, id: &PollId, active: bool) -> Result<bool, StoreError> {
        match self.shard(id)? {
            Some(shard) => {
                let mut shard = lock(&shard)?;
                if shard.deleted {
                    return Ok(false);
                }
                shard.poll.is_active = active;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn increment_option(
        &self,
        poll_id: &PollId,
        option_id: &OptionId,
    ) -> Result<bool, StoreError> {
        let shard = match self.shard(poll_id)? {
            Some(shard) => shard,
            None => return Ok(false),
        };
        let mut shard = lock(&shard)?;
        if shard.deleted {
            return Ok(false);
        }
        match shard.poll.options.iter_mut().find(|o| &o.id == option_id) {
            Some(option) => {
                option.count += 1;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn append_vote(&self, vote: &InternalVote) -> Result<bool, StoreError> {
        let shard = match self.shard(&vote.poll_id)? {
            Some(shard) => shard,
            None => return Ok(false),
        };
        let mut shard = lock(&shard)?;
        if shard.deleted || shard.votes.iter().any(|v| v.token == vote.token) {
            return Ok(false);
        }
        shard.votes.push(vote.clone());
        Ok(true)
    }

    async fn votes_for_poll(&self, poll_id: &PollId) -> Result<Vec<InternalVote>, StoreError> {
        let shard = match self.shard(poll_id)? {
            Some(shard) => shard,
            None => return Ok(vec![]),
        };
        let votes = lock(&shard)?.votes.clone();
        Ok(votes)
    }

    async fn insert_credential(
        &self,
        credential: &InternalCredential,
    ) -> Result<TokenInsert, StoreError> {
        let shard = match self.shard(&credential.poll_id)? {
            Some(shard) => shard,
            None => return Ok(TokenInsert::UnknownPoll),
        };
        let mut shard = lock(&shard)?;
        if shard.deleted {
            return Ok(TokenInsert::UnknownPoll);
        }
        let mut index = self.tokens.write()?;
        if index.contains_key(&credential.token) {
            return Ok(TokenInsert::Duplicate);
        }
        index.insert(credential.token.clone(), credential.poll_id.clone());
        shard
            .credentials
            .insert(credential.token.clone(), credential.clone());
        Ok(TokenInsert::Inserted)
    }

    async fn credential(&self, token: &Token) -> Result<Option<InternalCredential>, StoreError> {
        let shard = match self.shard_for_token(token)? {
            Some(shard) => shard,
            None => return Ok(None),
        };
        let credential = lock(&shard)?.credentials.get(token).cloned();
        Ok(credential)
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
        let shard = match self.shard_for_token(token)? {
            Some(shard) => shard,
            None => return Ok(false),
        };
        let mut shard = lock(&shard)?;
        match shard.credentials.get_mut(token) {
            Some(credential) if credential.status == from => {
                credential.status = to;
                credential.scanned_at = match to {
                    TokenStatus::Scanned => Some(Utc::now()),
                    _ => None,
                };
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn consume_and_tally(
        &self,
        vote: &InternalVote,
        expected: TokenStatus,
    ) -> Result<ConsumeOutcome, StoreError> {
        let shard = match self.shard_for_token(&vote.token)? {
            Some(shard) => shard,
            None => return Ok(ConsumeOutcome::CredentialMissing),
        };
        let mut guard = lock(&shard)?;
        let shard = &mut *guard;
        if shard.deleted {
            return Ok(ConsumeOutcome::CredentialMissing);
        }
        let credential = match shard.credentials.get_mut(&vote.token) {
            Some(credential) if credential.poll_id == vote.poll_id => credential,
            _ => return Ok(ConsumeOutcome::CredentialMissing),
        };
        if expected == TokenStatus::Used || credential.status != expected {
            return Ok(ConsumeOutcome::Conflict);
        }
        let option = match shard
            .poll
            .options
            .iter_mut()
            .find(|o| o.id == vote.option_id)
        {
            Some(option) => option,
            None => return Ok(ConsumeOutcome::OptionMissing),
        };
        credential.status = TokenStatus::Used;
        option.count += 1;
        shard.votes.push(vote.clone());
        Ok(ConsumeOutcome::Consumed)
    }

    async fn retire_credentials(&self, idle_before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut retired = Vec::new();
        for shard in self.shards()? {
            let mut shard = lock(&shard)?;
            shard.credentials.retain(|token, credential| {
                let keep = credential.status == TokenStatus::Used
                    || credential.last_activity() >= idle_before;
                if !keep {
                    retired.push(token.clone());
                }
                keep
            });
        }
        if !retired.is_empty() {
            let mut index = self.tokens.write()?;
            for token in &retired {
                index.remove(token);
            }
        }
        Ok(retired.len() as u64)
    }
}
