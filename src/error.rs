use crate::db::StoreError;
use actix::MailboxError;
use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VoteError {
    #[error("{0}")]
    Validation(String),
    #[error("option does not belong to this poll")]
    UnknownOption,
    #[error("poll not found")]
    PollNotFound,
    #[error("credential not found")]
    CredentialNotFound,
    #[error("poll is closed")]
    PollClosed,
    #[error("credential is not valid for this poll")]
    InvalidCredential,
    #[error("credential was consumed by a concurrent vote")]
    CredentialConflict,
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
    #[error("service unavailable: {0}")]
    Mailbox(#[from] MailboxError),
}

impl VoteError {
    /// Both mean "rescan" to the voter.
    pub fn is_rejected_credential(&self) -> bool {
        matches!(
            self,
            VoteError::InvalidCredential | VoteError::CredentialConflict
        )
    }

    /// Stable code clients switch on.
    pub fn code(&self) -> &'static str {
        match self {
            VoteError::Validation(_) => "VALIDATION_ERROR",
            VoteError::UnknownOption => "UNKNOWN_OPTION",
            VoteError::PollNotFound | VoteError::CredentialNotFound => "NOT_FOUND",
            VoteError::PollClosed => "POLL_CLOSED",
            VoteError::InvalidCredential | VoteError::CredentialConflict => "CREDENTIAL_EXPIRED",
            VoteError::StoreUnavailable(_) | VoteError::Mailbox(_) => "UNAVAILABLE",
        }
    }

    /// Message safe to show to a voter. Store details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            VoteError::InvalidCredential | VoteError::CredentialConflict => {
                "link expired, rescan".to_owned()
            }
            VoteError::StoreUnavailable(_) | VoteError::Mailbox(_) => {
                "temporarily unavailable, retry later".to_owned()
            }
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: &'static str,
    pub message: String,
}

impl ResponseError for VoteError {
    fn status_code(&self) -> StatusCode {
        match self {
            VoteError::Validation(_) | VoteError::UnknownOption => StatusCode::BAD_REQUEST,
            VoteError::PollNotFound | VoteError::CredentialNotFound => StatusCode::NOT_FOUND,
            VoteError::PollClosed => StatusCode::CONFLICT,
            VoteError::InvalidCredential | VoteError::CredentialConflict => StatusCode::GONE,
            VoteError::StoreUnavailable(_) | VoteError::Mailbox(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorResponse {
            error: self.code(),
            message: self.public_message(),
        })
    }
}
