//! OAuth2 Authorization Code flow (with PKCE) for the Google consent step.
//!
//! 1. Opens browser to the authorization URL (CSRF state + S256 challenge)
//! 2. Starts a tiny localhost HTTP server to receive the callback
//! 3. Exchanges the code for an access token (+ refresh token)
//!
//! Tokens are not stored here; the caller turns them into a CalendarLink.

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use reqwest::Client;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use super::keyring_store;
use crate::error::OAuthError;
use crate::storage::GoogleConfig;

const CALLBACK_TIMEOUT: Duration = Duration::from_secs(300);

/// Tokens returned by the authorization-code exchange.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_expires_in")]
    pub expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

/// OAuth client id/secret of the desktop app registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl ClientCredentials {
    /// Read credentials from the OS keyring, falling back to the
    /// `GOOGLE_CLIENT_ID` / `GOOGLE_CLIENT_SECRET` environment variables.
    pub fn load() -> Result<Self, OAuthError> {
        let from_keyring = |key: &str| keyring_store::get(key).ok().flatten();
        let client_id = from_keyring("google_client_id")
            .or_else(|| std::env::var("GOOGLE_CLIENT_ID").ok())
            .filter(|s| !s.is_empty());
        let client_secret = from_keyring("google_client_secret")
            .or_else(|| std::env::var("GOOGLE_CLIENT_SECRET").ok())
            .filter(|s| !s.is_empty());

        match (client_id, client_secret) {
            (Some(client_id), Some(client_secret)) => Ok(Self {
                client_id,
                client_secret,
            }),
            _ => Err(OAuthError::CredentialsNotConfigured {
                service: "google".to_string(),
            }),
        }
    }

    /// Persist Google OAuth client credentials to the OS keyring.
    pub fn store(&self) -> Result<(), OAuthError> {
        keyring_store::set("google_client_id", &self.client_id)?;
        keyring_store::set("google_client_secret", &self.client_secret)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub auth_url: String,
    pub token_url: String,
    pub scopes: Vec<String>,
    pub redirect_port: u16,
}

impl OAuthConfig {
    pub fn new(google: &GoogleConfig, credentials: &ClientCredentials) -> Self {
        Self {
            client_id: credentials.client_id.clone(),
            client_secret: credentials.client_secret.clone(),
            auth_url: google.auth_url.clone(),
            token_url: google.token_url.clone(),
            scopes: google.scopes.clone(),
            redirect_port: google.redirect_port,
        }
    }

    pub fn redirect_uri(&self) -> String {
        format!("http://localhost:{}/callback", self.redirect_port)
    }

    /// Authorization URL for one consent attempt.
    pub fn auth_url_full(&self, request: &AuthRequest) -> String {
        let scopes = self.scopes.join(" ");
        format!(
            "{}?client_id={}&redirect_uri={}&response_type=code&scope={}\
             &access_type=offline&prompt=consent&state={}\
             &code_challenge={}&code_challenge_method=S256",
            self.auth_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(&self.redirect_uri()),
            urlencoding::encode(&scopes),
            urlencoding::encode(&request.state),
            urlencoding::encode(&request.code_challenge()),
        )
    }
}

/// CSRF state and PKCE verifier of one consent attempt.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub state: String,
    pub code_verifier: String,
}

impl AuthRequest {
    pub fn generate() -> Result<Self, OAuthError> {
        let mut bytes = [0u8; 32];
        getrandom::getrandom(&mut bytes)
            .map_err(|e| OAuthError::AuthorizationFailed(e.to_string()))?;
        Ok(Self {
            state: uuid::Uuid::new_v4().simple().to_string(),
            code_verifier: URL_SAFE_NO_PAD.encode(bytes),
        })
    }

    /// S256 challenge for the verifier.
    pub fn code_challenge(&self) -> String {
        URL_SAFE_NO_PAD.encode(Sha256::digest(self.code_verifier.as_bytes()))
    }
}

/// Run the full flow: open browser -> wait for callback -> exchange code.
pub async fn authorize(config: &OAuthConfig) -> Result<OAuthTokens, OAuthError> {
    let request = AuthRequest::generate()?;
    let listener = TcpListener::bind(("127.0.0.1", config.redirect_port))
        .await
        .map_err(|e| OAuthError::AuthorizationFailed(e.to_string()))?;

    let auth_url = config.auth_url_full(&request);
    if let Err(e) = open::that(&auth_url) {
        tracing::warn!(error = %e, "could not open browser");
    }
    tracing::info!(url = %auth_url, "waiting for Google consent");

    let code = tokio::time::timeout(CALLBACK_TIMEOUT, accept_callback(&listener, &request)).await??;
    drop(listener);

    exchange_code(config, &code, &request.code_verifier).await
}

async fn accept_callback(
    listener: &TcpListener,
    request: &AuthRequest,
) -> Result<String, OAuthError> {
    let (mut stream, _) = listener
        .accept()
        .await
        .map_err(|e| OAuthError::InvalidCallback(e.to_string()))?;

    let mut buf = [0u8; 4096];
    let n = stream
        .read(&mut buf)
        .await
        .map_err(|e| OAuthError::InvalidCallback(e.to_string()))?;
    let raw = String::from_utf8_lossy(&buf[..n]);
    let result = parse_callback(&raw, &request.state);

    let page = match &result {
        Ok(_) => "<h2>Calendar connected.</h2><p>You can close this tab.</p>",
        Err(_) => "<h2>Authorization failed.</h2><p>Return to the terminal for details.</p>",
    };
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nConnection: close\r\n\r\n\
         <html><body>{page}</body></html>"
    );
    if let Err(e) = stream.write_all(response.as_bytes()).await {
        tracing::debug!(error = %e, "failed to answer OAuth callback");
    }
    result
}

/// Pull the authorization code out of `GET /callback?code=..&state=..`.
fn parse_callback(request: &str, expected_state: &str) -> Result<String, OAuthError> {
    let first_line = request
        .lines()
        .next()
        .ok_or_else(|| OAuthError::InvalidCallback("empty request".into()))?;
    let path = first_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| OAuthError::InvalidCallback("missing request path".into()))?;
    let url = url::Url::parse(&format!("http://localhost{path}"))
        .map_err(|e| OAuthError::InvalidCallback(e.to_string()))?;

    let param = |name: &str| {
        url.query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.to_string())
    };

    if let Some(error) = param("error") {
        return Err(OAuthError::AuthorizationFailed(error));
    }
    if param("state").as_deref() != Some(expected_state) {
        return Err(OAuthError::StateMismatch);
    }
    param("code").ok_or_else(|| OAuthError::InvalidCallback("no code in callback".into()))
}

/// Exchange an authorization code for tokens.
pub async fn exchange_code(
    config: &OAuthConfig,
    code: &str,
    code_verifier: &str,
) -> Result<OAuthTokens, OAuthError> {
    let redirect_uri = config.redirect_uri();
    let params = [
        ("client_id", config.client_id.as_str()),
        ("client_secret", config.client_secret.as_str()),
        ("code", code),
        ("code_verifier", code_verifier),
        ("grant_type", "authorization_code"),
        ("redirect_uri", redirect_uri.as_str()),
    ];

    let resp = Client::new()
        .post(&config.token_url)
        .form(&params)
        .send()
        .await
        .map_err(|e| OAuthError::TokenExchangeFailed(e.to_string()))?;

    let status = resp.status();
    let body: serde_json::Value = resp
        .json()
        .await
        .map_err(|e| OAuthError::TokenExchangeFailed(e.to_string()))?;

    if let Some(error) = body.get("error") {
        return Err(OAuthError::TokenExchangeFailed(error.to_string()));
    }
    if !status.is_success() {
        return Err(OAuthError::TokenExchangeFailed(format!("HTTP {status}")));
    }

    let tokens: OAuthTokens = serde_json::from_value(body)
        .map_err(|e| OAuthError::TokenExchangeFailed(e.to_string()))?;
    if tokens.refresh_token.is_none() {
        return Err(OAuthError::TokenExchangeFailed(
            "no refresh token granted; revoke the app's access and retry".into(),
        ));
    }
    Ok(tokens)
}
