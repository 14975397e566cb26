//! OAuth2 client-credential token lifecycle.
//!
//! State machine: no token → valid → (expired | invalidated) → no token.
//! The token lives only in memory and is revoked once at shutdown.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Tokens are treated as expired this many seconds before the server says so.
pub const EXPIRY_SAFETY_MARGIN_SECS: i64 = 60;

const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

#[derive(Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl ClientCredentials {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    fn is_complete(&self) -> bool {
        !self.client_id.trim().is_empty() && !self.client_secret.trim().is_empty()
    }
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct TokenEndpoints {
    pub token_url: String,
    pub revoke_url: String,
}

#[derive(Clone)]
pub struct AccessToken {
    value: String,
    expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("client credentials are missing")]
    MissingCredentials,
    #[error("token endpoint returned http {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("token request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("malformed token response: {0}")]
    MalformedResponse(String),
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug)]
pub struct TokenManager {
    http: reqwest::Client,
    credentials: ClientCredentials,
    endpoints: TokenEndpoints,
    token: Option<AccessToken>,
    exchanges: usize,
}

impl TokenManager {
    pub fn new(
        http: reqwest::Client,
        credentials: ClientCredentials,
        endpoints: TokenEndpoints,
    ) -> Self {
        Self {
            http,
            credentials,
            endpoints,
            token: None,
            exchanges: 0,
        }
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    /// Number of client-credential exchanges performed so far.
    pub fn exchange_count(&self) -> usize {
        self.exchanges
    }

    /// Returns the held token, exchanging credentials first when none is held or
    /// the held one has passed its (margin-adjusted) expiry.
    pub async fn ensure_valid_token(&mut self) -> Result<String, AuthError> {
        if let Some(token) = &self.token {
            if token.is_valid_at(Utc::now()) {
                return Ok(token.value.clone());
            }
            debug!(expires_at = %token.expires_at, "access token expired");
            self.token = None;
        }

        let token = self.exchange().await?;
        let value = token.value.clone();
        self.token = Some(token);
        Ok(value)
    }

    /// Drops the held token without contacting the server.
    pub fn invalidate(&mut self) {
        if self.token.take().is_some() {
            debug!("access token invalidated");
        }
    }

    /// Best-effort revocation. Local state is cleared whatever the server says.
    pub async fn revoke(&mut self) {
        let Some(token) = self.token.take() else {
            info!("no access token to revoke");
            return;
        };

        let result = self
            .http
            .post(&self.endpoints.revoke_url)
            .basic_auth(
                &self.credentials.client_id,
                Some(&self.credentials.client_secret),
            )
            .form(&[("token", token.value.as_str())])
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => info!("access token revoked"),
            Ok(resp) => {
                let status = resp.status().as_u16();
                let body = resp.text().await.unwrap_or_default();
                warn!(status, %body, "token revocation rejected");
            }
            Err(err) => warn!(error = %err, "token revocation failed"),
        }
    }

    async fn exchange(&mut self) -> Result<AccessToken, AuthError> {
        if !self.credentials.is_complete() {
            return Err(AuthError::MissingCredentials);
        }

        info!(url = %self.endpoints.token_url, "requesting access token");
        let resp = self
            .http
            .post(&self.endpoints.token_url)
            .basic_auth(
                &self.credentials.client_id,
                Some(&self.credentials.client_secret),
            )
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|err| AuthError::MalformedResponse(err.to_string()))?;
        if parsed.access_token.is_empty() {
            return Err(AuthError::MalformedResponse(
                "empty access_token".to_string(),
            ));
        }

        let expires_in = parsed.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        let expires_at = token_expiry(Utc::now(), expires_in)?;
        self.exchanges += 1;
        info!(expires_in, "access token obtained");

        Ok(AccessToken {
            value: parsed.access_token,
            expires_at,
        })
    }
}

/// `now + expires_in - margin`, rejecting lifetimes chrono cannot represent.
fn token_expiry(now: DateTime<Utc>, expires_in: i64) -> Result<DateTime<Utc>, AuthError> {
    if expires_in <= 0 {
        return Err(AuthError::MalformedResponse(format!(
            "non-positive expires_in {expires_in}"
        )));
    }
    expires_in
        .checked_sub(EXPIRY_SAFETY_MARGIN_SECS)
        .and_then(Duration::try_seconds)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .ok_or_else(|| {
            AuthError::MalformedResponse(format!("expires_in {expires_in} is out of range"))
        })
}
