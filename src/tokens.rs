//! Per-user OAuth credential lifecycle

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};

use crate::crypto::TokenCipher;
use crate::db::Database;
use crate::error::{EngineError, EngineResult, OAuthError, ProviderResult};
use crate::models::CalendarConnection;
use crate::oauth::{OAuthClient, TokenResponse};

/// Refresh this many seconds before the provider's stated expiry
const REFRESH_MARGIN_SECS: i64 = 60;

/// True when the stored access token is expired or about to be
pub fn needs_refresh(connection: &CalendarConnection, now: DateTime<Utc>) -> bool {
    connection
        .token_expiry
        .is_some_and(|expiry| expiry <= now + Duration::seconds(REFRESH_MARGIN_SECS))
}

fn expiry_from(tokens: &TokenResponse, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    tokens
        .expires_in
        .filter(|secs| *secs > 0)
        .map(|secs| now + Duration::seconds(secs))
}

pub struct TokenStore {
    db: Arc<Database>,
    oauth: Arc<dyn OAuthClient>,
    cipher: TokenCipher,
}

impl TokenStore {
    pub fn new(db: Arc<Database>, oauth: Arc<dyn OAuthClient>, cipher: TokenCipher) -> Self {
        Self { db, oauth, cipher }
    }

    pub fn oauth(&self) -> &dyn OAuthClient {
        self.oauth.as_ref()
    }

    /// A usable access token, refreshed if it is within a minute of expiring.
    ///
    /// `None` means sync is paused for this user: no connection, a connection
    /// flagged for re-consent, or a refresh that did not go through.
    pub async fn access_token(&self, user_id: i64) -> EngineResult<Option<String>> {
        let Some(connection) = self.db.read(|store| store.get_connection(user_id))? else {
            return Ok(None);
        };
        if connection.requires_reauth {
            return Ok(None);
        }
        if needs_refresh(&connection, Utc::now()) {
            return self.refresh_access_token(&connection).await;
        }
        match self.cipher.decrypt(&connection.encrypted_access_token) {
            Ok(token) => Ok(Some(token)),
            Err(err) => {
                tracing::warn!(user_id, error = %err, "Stored access token is unreadable");
                self.mark_reauth_required(user_id)?;
                Ok(None)
            }
        }
    }

    /// Like [`Self::access_token`], but says why there is no token
    pub async fn require_access_token(&self, user_id: i64) -> EngineResult<String> {
        if let Some(token) = self.access_token(user_id).await? {
            return Ok(token);
        }
        match self.db.read(|store| store.get_connection(user_id))? {
            None => Err(EngineError::NotConnected { user_id }),
            Some(connection) if connection.requires_reauth => {
                Err(EngineError::ReauthRequired { user_id })
            }
            Some(_) => Err(EngineError::TokenUnavailable { user_id }),
        }
    }

    /// Persist a token grant and clear any re-auth flag
    pub async fn store_tokens(
        &self,
        user_id: i64,
        tokens: &TokenResponse,
    ) -> EngineResult<CalendarConnection> {
        let now = Utc::now();
        let access = self
            .cipher
            .encrypt(&tokens.access_token)
            .context("Failed to encrypt access token")?;
        let refresh = tokens
            .refresh_token
            .as_deref()
            .map(|t| self.cipher.encrypt(t))
            .transpose()
            .context("Failed to encrypt refresh token")?;

        self.db.read(|store| {
            store.save_credentials(
                user_id,
                &access,
                refresh.as_deref(),
                expiry_from(tokens, now),
                tokens.scope.as_deref(),
                now,
            )
        })?;

        match self.oauth.fetch_account_email(&tokens.access_token).await {
            Ok(Some(email)) => self
                .db
                .read(|store| store.set_account_email(user_id, &email))?,
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(user_id, error = %err, "Unable to fetch calendar account email")
            }
        }

        self.db
            .read(|store| store.get_connection(user_id))?
            .ok_or(EngineError::NotConnected { user_id })
    }

    /// Exchange the stored refresh token for a new access token.
    ///
    /// A missing or unreadable refresh token, or a grant the endpoint rejects,
    /// flags the connection for re-consent. A transport failure only skips
    /// this attempt.
    pub async fn refresh_access_token(
        &self,
        connection: &CalendarConnection,
    ) -> EngineResult<Option<String>> {
        let user_id = connection.user_id;
        let Some(encrypted) = connection.encrypted_refresh_token.as_deref() else {
            tracing::warn!(user_id, "No refresh token stored; re-authentication required");
            self.mark_reauth_required(user_id)?;
            return Ok(None);
        };
        let refresh_token = match self.cipher.decrypt(encrypted) {
            Ok(token) => token,
            Err(err) => {
                tracing::warn!(user_id, error = %err, "Stored refresh token is unreadable");
                self.mark_reauth_required(user_id)?;
                return Ok(None);
            }
        };

        let tokens = match self.oauth.refresh(&refresh_token).await {
            Ok(tokens) => tokens,
            Err(OAuthError::Transport(err)) => {
                tracing::warn!(user_id, error = %err, "Token refresh failed; will retry next tick");
                return Ok(None);
            }
            Err(err) => {
                tracing::warn!(
                    user_id,
                    error = %err,
                    "Token refresh rejected; re-authentication required"
                );
                self.mark_reauth_required(user_id)?;
                return Ok(None);
            }
        };

        let now = Utc::now();
        let access = self
            .cipher
            .encrypt(&tokens.access_token)
            .context("Failed to encrypt access token")?;
        let rotated = tokens
            .refresh_token
            .as_deref()
            .map(|t| self.cipher.encrypt(t))
            .transpose()
            .context("Failed to encrypt refresh token")?;
        let scopes = tokens.scope.as_deref().or(connection.scopes.as_deref());

        self.db.read(|store| {
            store.save_credentials(
                user_id,
                &access,
                rotated.as_deref(),
                expiry_from(&tokens, now),
                scopes,
                now,
            )
        })?;
        tracing::debug!(user_id, "Access token refreshed");

        Ok(Some(tokens.access_token))
    }

    /// Flag the connection as needing re-consent; safe to call repeatedly
    pub fn mark_reauth_required(&self, user_id: i64) -> EngineResult<()> {
        let flagged = self
            .db
            .read(|store| store.set_requires_reauth(user_id, true))?;
        if flagged {
            tracing::info!(user_id, "Calendar connection marked as requiring re-authentication");
        }
        Ok(())
    }

    /// Convert a provider result, treating 401 as revoked credentials
    pub fn check_provider<T>(&self, user_id: i64, result: ProviderResult<T>) -> EngineResult<T> {
        match result {
            Ok(value) => Ok(value),
            Err(err) if err.status() == Some(401) => {
                self.mark_reauth_required(user_id)?;
                Err(EngineError::ReauthRequired { user_id })
            }
            Err(err) => Err(err.into()),
        }
    }
}
