use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Uuid;
use std::fmt;

#[derive(Clone, Hash, PartialEq, Eq, Debug, Deserialize, Serialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct PollId(pub Uuid);

impl PollId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PollId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PollId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Hash, PartialEq, Eq, Debug, Deserialize, Serialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct OptionId(pub Uuid);

impl OptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct InternalOption {
    pub id: OptionId,
    pub text: String,
    pub count: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct InternalPoll {
    pub id: PollId,
    pub title: String,
    pub options: Vec<InternalOption>,
    pub created_at: DateTime<Utc>,
    pub is_active: bool,
    pub owner: Option<String>,
}

impl InternalPoll {
    /// Builds an open poll with fresh ids and zeroed counts. Callers validate
    /// the title and options first.
    pub fn new(title: String, option_texts: Vec<String>, owner: Option<String>) -> Self {
        Self {
            id: PollId::new(),
            title,
            options: option_texts
                .into_iter()
                .map(|text| InternalOption {
                    id: OptionId::new(),
                    text,
                    count: 0,
                })
                .collect(),
            created_at: Utc::now(),
            is_active: true,
            owner,
        }
    }

    pub fn option(&self, option_id: &OptionId) -> Option<&InternalOption> {
        self.options.iter().find(|option| &option.id == option_id)
    }

    pub fn total_votes(&self) -> u64 {
        self.options.iter().map(|option| option.count).sum()
    }
}
