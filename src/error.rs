//! Error types shared by the sync engine components

use thiserror::Error;

/// Failure talking to the calendar provider's REST API
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("provider request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("provider response could not be decoded: {0}")]
    Decode(String),
}

impl ProviderError {
    /// HTTP status code, when the provider answered at all
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Transport(err) => err.status().map(|s| s.as_u16()),
            Self::Decode(_) => None,
        }
    }

    /// True for 404/410, i.e. the resource is gone on the provider side
    pub fn is_gone(&self) -> bool {
        matches!(self.status(), Some(404) | Some(410))
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// A provider call result, classified by what the caller has to do about it.
#[derive(Debug)]
pub enum ProviderOutcome<T> {
    Ok(T),
    /// 410: the sync cursor was invalidated
    Stale,
    /// 403: the account lost access
    Forbidden,
    /// 404: the resource no longer exists
    NotFound,
    /// 401: credentials rejected
    Unauthorized,
    /// Timeouts, 5xx, and anything else worth retrying next tick
    Transient(ProviderError),
}

impl<T> From<ProviderResult<T>> for ProviderOutcome<T> {
    fn from(result: ProviderResult<T>) -> Self {
        match result {
            Ok(value) => Self::Ok(value),
            Err(err) => match err.status() {
                Some(410) => Self::Stale,
                Some(403) => Self::Forbidden,
                Some(404) => Self::NotFound,
                Some(401) => Self::Unauthorized,
                _ => Self::Transient(err),
            },
        }
    }
}

/// Failure from the OAuth token endpoint
#[derive(Debug, Error)]
pub enum OAuthError {
    /// The endpoint answered and refused the grant
    #[error("token endpoint rejected the request (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("token endpoint unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("token response missing {0}")]
    MissingField(&'static str),
}

/// Failure encrypting or decrypting stored credentials
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("failed to derive encryption key: {0}")]
    KeyDerivation(String),

    #[error("encryption failed")]
    Encryption,

    #[error("decryption failed")]
    Decryption,

    #[error("invalid encrypted data: {0}")]
    InvalidFormat(String),
}

/// Errors surfaced by the engine components to their callers
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("calendar connection for user {user_id} requires re-authentication")]
    ReauthRequired { user_id: i64 },

    #[error("user {user_id} has no calendar connection")]
    NotConnected { user_id: i64 },

    /// Refresh failed for a reason worth retrying later
    #[error("no usable access token for user {user_id} at the moment")]
    TokenUnavailable { user_id: i64 },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
