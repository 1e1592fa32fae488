//! Access/refresh token lifecycle for the download endpoint.
//!
//! The `TokenManager` is the only owner of the current `TokenPair`. Callers hold it by
//! `&mut` and tell it when a request was refused through `handle_expiry`, which
//! refreshes the pair or, failing that, logs in again from the credentials file.
use crate::credentials::Credentials;
use crate::error::{AuthError, LoginError, ReauthError};
use crate::selection::Endpoints;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl std::fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenPair { .. }")
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
}

/// The OpenID Connect token endpoint.
pub struct TokenEndpoint {
    client: reqwest::Client,
    url: String,
    client_id: String,
}

impl TokenEndpoint {
    pub fn new(client: reqwest::Client, endpoints: &Endpoints) -> Self {
        Self {
            client,
            url: endpoints.token.clone(),
            client_id: endpoints.client_id.clone(),
        }
    }

    async fn request(&self, form: &[(&str, &str)]) -> Result<TokenResponse, AuthError> {
        let response = self.client.post(&self.url).form(form).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Rejected { status, body });
        }
        Ok(response.json::<TokenResponse>().await?)
    }

    /// Exchanges a username and password for a fresh pair (`password` grant).
    pub async fn authenticate(&self, credentials: &Credentials) -> Result<TokenPair, AuthError> {
        let token = self
            .request(&[
                ("grant_type", "password"),
                ("username", credentials.username.as_str()),
                ("password", credentials.password.as_str()),
                ("client_id", self.client_id.as_str()),
            ])
            .await?;

        Ok(TokenPair {
            access_token: token.access_token.ok_or(AuthError::MissingAccessToken)?,
            refresh_token: token.refresh_token.unwrap_or_default(),
        })
    }

    /// Mints a new access token from `refresh_token`. `None` means the refresh token
    /// itself is no longer accepted.
    pub async fn refresh(&self, refresh_token: &str) -> Option<TokenPair> {
        if refresh_token.is_empty() {
            return None;
        }

        let token = match self
            .request(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.client_id.as_str()),
            ])
            .await
        {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "Token refresh failed");
                return None;
            }
        };

        Some(TokenPair {
            access_token: token.access_token?,
            // Some servers do not rotate the refresh token
            refresh_token: token
                .refresh_token
                .unwrap_or_else(|| refresh_token.to_string()),
        })
    }
}

pub struct TokenManager {
    endpoint: TokenEndpoint,
    credentials_path: PathBuf,
    tokens: TokenPair,
}

impl TokenManager {
    /// Loads the credentials and performs the initial login. Either failure is fatal.
    pub async fn connect<P: AsRef<Path>>(
        endpoint: TokenEndpoint,
        credentials_path: P,
    ) -> Result<Self, LoginError> {
        let credentials_path = credentials_path.as_ref().to_path_buf();
        let credentials = Credentials::load(&credentials_path)?;
        let tokens = endpoint.authenticate(&credentials).await?;
        info!(username = %credentials.username, "Authenticated");

        Ok(Self {
            endpoint,
            credentials_path,
            tokens,
        })
    }

    pub fn with_tokens<P: AsRef<Path>>(
        endpoint: TokenEndpoint,
        credentials_path: P,
        tokens: TokenPair,
    ) -> Self {
        Self {
            endpoint,
            credentials_path: credentials_path.as_ref().to_path_buf(),
            tokens,
        }
    }

    pub fn access_token(&self) -> &str {
        &self.tokens.access_token
    }

    pub fn tokens(&self) -> &TokenPair {
        &self.tokens
    }

    /// Called after a request was refused. Tries a refresh first, then a full login
    /// with freshly reloaded credentials. The pair is only replaced on success.
    pub async fn handle_expiry(&mut self) -> Result<(), ReauthError> {
        let refreshed = self.endpoint.refresh(&self.tokens.refresh_token).await;
        if let Some(tokens) = refreshed {
            debug!("Access token refreshed");
            self.tokens = tokens;
            return Ok(());
        }

        info!("Refresh token rejected, authenticating again");
        let credentials = Credentials::load(&self.credentials_path)?;
        self.tokens = self.endpoint.authenticate(&credentials).await?;
        Ok(())
    }
}
