//! Credential acquisition
//!
//! The real-time layer only needs an opaque bearer token. It either comes
//! straight from configuration or from the platform's login endpoint.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::AuthConfig;

/// Authentication errors
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Login rejected with status {0}")]
    Rejected(u16),

    #[error("No credential configured: set auth.token or auth.login_url")]
    NotConfigured,
}

pub type AuthResult<T> = Result<T, AuthError>;

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
}

/// Source of bearer tokens for virtual clients
#[derive(Debug, Clone)]
pub enum TokenSource {
    /// Every client uses the same token
    Static(String),
    /// Each client logs in; `{index}` in the username is replaced by the
    /// client's index
    Login {
        http: reqwest::Client,
        url: String,
        username: String,
        password: String,
    },
}

impl TokenSource {
    pub fn from_config(config: &AuthConfig) -> AuthResult<Self> {
        if let Some(url) = &config.login_url {
            return Ok(TokenSource::Login {
                http: reqwest::Client::new(),
                url: url.clone(),
                username: config.username.clone().unwrap_or_default(),
                password: config.password.clone().unwrap_or_default(),
            });
        }
        config
            .token
            .clone()
            .map(TokenSource::Static)
            .ok_or(AuthError::NotConfigured)
    }

    /// Token for the virtual client with the given index
    pub async fn token_for(&self, index: usize) -> AuthResult<String> {
        match self {
            TokenSource::Static(token) => Ok(token.clone()),
            TokenSource::Login {
                http,
                url,
                username,
                password,
            } => {
                let username = username.replace("{index}", &index.to_string());
                let response = http
                    .post(url)
                    .json(&LoginRequest {
                        username: username.as_str(),
                        password: password.as_str(),
                    })
                    .send()
                    .await?;

                let status = response.status();
                if !status.is_success() {
                    return Err(AuthError::Rejected(status.as_u16()));
                }

                let body: LoginResponse = response.json().await?;
                tracing::debug!(client = index, "Logged in as {}", username);
                Ok(body.token)
            }
        }
    }
}
