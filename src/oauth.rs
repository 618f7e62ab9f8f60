//! OAuth 2.0 token endpoint client for the calendar provider

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::Rng;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::GoogleConfig;
use crate::error::OAuthError;

pub const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";

pub const CALENDAR_SCOPES: &[&str] = &[
    "openid",
    "email",
    "profile",
    "https://www.googleapis.com/auth/calendar",
];

/// Successful token grant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    /// Only sent on first consent
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

/// Shape of the endpoint's answer before the access token is known to exist
#[derive(Deserialize)]
struct RawTokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    scope: Option<String>,
    token_type: Option<String>,
}

impl TryFrom<RawTokenResponse> for TokenResponse {
    type Error = OAuthError;

    fn try_from(raw: RawTokenResponse) -> Result<Self, Self::Error> {
        let access_token = raw
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or(OAuthError::MissingField("access_token"))?;
        Ok(Self {
            access_token,
            refresh_token: raw.refresh_token.filter(|t| !t.is_empty()),
            expires_in: raw.expires_in,
            scope: raw.scope,
            token_type: raw.token_type,
        })
    }
}

#[derive(Deserialize)]
struct UserInfo {
    email: Option<String>,
}

/// The provider's OAuth endpoints
#[async_trait]
pub trait OAuthClient: Send + Sync {
    /// Consent screen URL carrying `state`
    fn authorization_url(&self, state: &str) -> String;

    async fn exchange_code(&self, code: &str) -> Result<TokenResponse, OAuthError>;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, OAuthError>;

    async fn fetch_account_email(&self, access_token: &str) -> Result<Option<String>, OAuthError>;
}

/// Random, URL-safe value for the `state` parameter
pub fn generate_state() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}

#[derive(Debug, Clone)]
pub struct GoogleOAuthClient {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    auth_url: String,
    token_url: String,
    userinfo_url: String,
}

impl GoogleOAuthClient {
    pub fn new(config: &GoogleConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri: config.redirect_uri.clone(),
            auth_url: GOOGLE_AUTH_URL.to_string(),
            token_url: config.oauth_token_url.clone(),
            userinfo_url: config.userinfo_url.clone(),
        })
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenResponse, OAuthError> {
        let response = self.http.post(&self.token_url).form(form).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(OAuthError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let raw: RawTokenResponse = serde_json::from_str(&body)
            .map_err(|_| OAuthError::MissingField("access_token"))?;
        raw.try_into()
    }
}

#[async_trait]
impl OAuthClient for GoogleOAuthClient {
    fn authorization_url(&self, state: &str) -> String {
        let scope = CALENDAR_SCOPES.join(" ");
        let params = [
            ("client_id", self.client_id.as_str()),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("response_type", "code"),
            ("scope", scope.as_str()),
            ("access_type", "offline"),
            ("prompt", "consent"),
            ("include_granted_scopes", "true"),
            ("state", state),
        ];
        match Url::parse_with_params(&self.auth_url, &params) {
            Ok(url) => url.to_string(),
            Err(_) => self.auth_url.clone(),
        }
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenResponse, OAuthError> {
        self.token_request(&[
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("code", code),
            ("grant_type", "authorization_code"),
            ("redirect_uri", self.redirect_uri.as_str()),
        ])
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, OAuthError> {
        self.token_request(&[
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ])
        .await
    }

    async fn fetch_account_email(&self, access_token: &str) -> Result<Option<String>, OAuthError> {
        let response = self
            .http
            .get(&self.userinfo_url)
            .bearer_auth(access_token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(OAuthError::Rejected {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        let info: UserInfo = response.json().await?;
        Ok(info.email)
    }
}
