use super::poll::PollId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Uuid;
use std::{fmt, str::FromStr};

/// Opaque single-use credential string.
#[derive(Clone, Hash, PartialEq, Eq, Debug, Deserialize, Serialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct Token(pub String);

impl Token {
    /// 32 hex characters drawn from a v4 uuid, never derived from a counter
    /// or the clock.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenStatus {
    Active,
    Scanned,
    Used,
}

impl TokenStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenStatus::Active => "active",
            TokenStatus::Scanned => "scanned",
            TokenStatus::Used => "used",
        }
    }

    /// Scanned or used credentials must be replaced on the display.
    pub fn is_consumed(self) -> bool {
        !matches!(self, TokenStatus::Active)
    }
}

impl FromStr for TokenStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(TokenStatus::Active),
            "scanned" => Ok(TokenStatus::Scanned),
            "used" => Ok(TokenStatus::Used),
            other => Err(format!("unknown token status {:?}", other)),
        }
    }
}

impl fmt::Display for TokenStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct InternalCredential {
    pub token: Token,
    pub poll_id: PollId,
    pub status: TokenStatus,
    pub created_at: DateTime<Utc>,
    /// Stamped by the `Active -> Scanned` transition.
    pub scanned_at: Option<DateTime<Utc>>,
}

impl InternalCredential {
    pub fn new(poll_id: PollId) -> Self {
        Self {
            token: Token::generate(),
            poll_id,
            status: TokenStatus::Active,
            created_at: Utc::now(),
            scanned_at: None,
        }
    }

    /// When the credential last changed hands: the scan for a scanned
    /// credential, issuance otherwise. Expiry is measured from here.
    pub fn last_activity(&self) -> DateTime<Utc> {
        match (self.status, self.scanned_at) {
            (TokenStatus::Scanned, Some(scanned_at)) => scanned_at,
            _ => self.created_at,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenInsert {
    Inserted,
    Duplicate,
    UnknownPoll,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generated_tokens_are_distinct_and_hex() {
        let tokens: HashSet<Token> = (0..10_000).map(|_| Token::generate()).collect();
        assert_eq!(tokens.len(), 10_000);
        for token in tokens.iter().take(10) {
            assert_eq!(token.as_str().len(), 32);
            assert!(token.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [TokenStatus::Active, TokenStatus::Scanned, TokenStatus::Used] {
            assert_eq!(status.as_str().parse::<TokenStatus>(), Ok(status));
        }
        assert!("expired".parse::<TokenStatus>().is_err());
    }
}
