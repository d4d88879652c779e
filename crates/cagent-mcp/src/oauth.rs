// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! OAuth 2.0 authorization-code + PKCE for remote MCP servers.
//!
//! In *managed* mode the client drives the flow itself: it hands the
//! authorization URL to the elicitation handler, which returns the code the
//! user obtained, and completes the exchange.  In *unmanaged* mode the
//! server's challenge is surfaced unchanged and the embedder deals with it.
//!
//! Tokens live in an injected [`TokenStore`]; the in-memory default is one
//! of the three sanctioned process-wide singletons.  Access tokens are
//! refreshed once less than 30 s of validity remains.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use anyhow::{bail, Context};
use base64::Engine;
use serde::Deserialize;
use sha2::{Digest, Sha256};

/// Refresh when the access token has less than this many seconds left.
const REFRESH_WINDOW_SECS: i64 = 30;

/// Timeout for token-endpoint round trips.
const TOKEN_FETCH_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

const CLIENT_ID: &str = "cagent";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OAuthMode {
    /// The client drives elicitation and completes the flow.
    #[default]
    Managed,
    /// Surface the server's challenge unchanged.
    Unmanaged,
}

/// Stored tokens for one server.  `Debug` redacts secrets.
#[derive(Clone)]
pub struct Tokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Unix timestamp (seconds) when the access token expires.
    pub expires_at: i64,
}

impl Tokens {
    pub fn expiring(&self) -> bool {
        chrono::Utc::now().timestamp() >= self.expires_at - REFRESH_WINDOW_SECS
    }
}

impl std::fmt::Debug for Tokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokens")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Pluggable token persistence keyed by server URL.
pub trait TokenStore: Send + Sync {
    fn get(&self, server: &str) -> Option<Tokens>;
    fn put(&self, server: &str, tokens: Tokens);
}

#[derive(Default)]
pub struct InMemoryTokenStore {
    tokens: Mutex<HashMap<String, Tokens>>,
}

impl TokenStore for InMemoryTokenStore {
    fn get(&self, server: &str) -> Option<Tokens> {
        self.tokens.lock().unwrap().get(server).cloned()
    }

    fn put(&self, server: &str, tokens: Tokens) {
        self.tokens.lock().unwrap().insert(server.to_string(), tokens);
    }
}

static STORE: OnceLock<std::sync::Arc<dyn TokenStore>> = OnceLock::new();

/// Inject a token store.  Must happen before the first OAuth use; later
/// calls are ignored.
pub fn set_token_store(store: std::sync::Arc<dyn TokenStore>) {
    let _ = STORE.set(store);
}

pub fn token_store() -> std::sync::Arc<dyn TokenStore> {
    STORE
        .get_or_init(|| std::sync::Arc::new(InMemoryTokenStore::default()))
        .clone()
}

// ─── PKCE ─────────────────────────────────────────────────────────────────────

/// A fresh `(verifier, challenge)` pair.  The verifier is 64 hex chars
/// (within the RFC 7636 43–128 length window); the challenge is the
/// base64url-encoded SHA-256 of the verifier (S256).
pub fn pkce_pair() -> (String, String) {
    let verifier = format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    );
    let digest = Sha256::digest(verifier.as_bytes());
    let challenge = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest);
    (verifier, challenge)
}

// ─── Endpoint discovery ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct AuthEndpoints {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
}

/// Resolve the server's OAuth endpoints from RFC 8414 metadata, falling back
/// to `/authorize` and `/token` on the server origin.
pub async fn discover_endpoints(
    client: &reqwest::Client,
    server_url: &str,
) -> AuthEndpoints {
    let origin = origin_of(server_url);
    let meta_url = format!("{origin}/.well-known/oauth-authorization-server");
    if let Ok(resp) = client.get(&meta_url).send().await {
        if resp.status().is_success() {
            if let Ok(meta) = resp.json::<AuthEndpoints>().await {
                return meta;
            }
        }
    }
    AuthEndpoints {
        authorization_endpoint: format!("{origin}/authorize"),
        token_endpoint: format!("{origin}/token"),
    }
}

fn origin_of(url: &str) -> String {
    // scheme://host[:port]
    let Some(scheme_end) = url.find("://") else {
        return url.trim_end_matches('/').to_string();
    };
    let rest = &url[scheme_end + 3..];
    let host_end = rest.find('/').unwrap_or(rest.len());
    format!("{}{}", &url[..scheme_end + 3], &rest[..host_end])
}

pub fn authorize_url(
    endpoints: &AuthEndpoints,
    redirect_uri: &str,
    state: &str,
    challenge: &str,
) -> String {
    format!(
        "{}?response_type=code&client_id={CLIENT_ID}&redirect_uri={}&state={}&code_challenge={}&code_challenge_method=S256",
        endpoints.authorization_endpoint,
        urlencode(redirect_uri),
        urlencode(state),
        urlencode(challenge),
    )
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

// ─── Token endpoint ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

fn tokens_from_response(r: TokenResponse, previous_refresh: Option<String>) -> Tokens {
    Tokens {
        access_token: r.access_token,
        refresh_token: r.refresh_token.or(previous_refresh),
        expires_at: chrono::Utc::now().timestamp() + r.expires_in.unwrap_or(3600) as i64,
    }
}

async fn post_token_form(
    client: &reqwest::Client,
    token_endpoint: &str,
    form: &[(&str, &str)],
) -> anyhow::Result<TokenResponse> {
    let resp = tokio::time::timeout(
        TOKEN_FETCH_TIMEOUT,
        client.post(token_endpoint).form(form).send(),
    )
    .await
    .context("token endpoint timed out")?
    .context("token request failed")?;
    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        bail!("token endpoint error {status}: {text}");
    }
    resp.json::<TokenResponse>()
        .await
        .context("decoding token response")
}

pub async fn exchange_code(
    client: &reqwest::Client,
    endpoints: &AuthEndpoints,
    code: &str,
    verifier: &str,
    redirect_uri: &str,
) -> anyhow::Result<Tokens> {
    let r = post_token_form(
        client,
        &endpoints.token_endpoint,
        &[
            ("grant_type", "authorization_code"),
            ("client_id", CLIENT_ID),
            ("code", code),
            ("code_verifier", verifier),
            ("redirect_uri", redirect_uri),
        ],
    )
    .await?;
    Ok(tokens_from_response(r, None))
}

pub async fn refresh(
    client: &reqwest::Client,
    endpoints: &AuthEndpoints,
    refresh_token: &str,
) -> anyhow::Result<Tokens> {
    let r = post_token_form(
        client,
        &endpoints.token_endpoint,
        &[
            ("grant_type", "refresh_token"),
            ("client_id", CLIENT_ID),
            ("refresh_token", refresh_token),
        ],
    )
    .await?;
    Ok(tokens_from_response(r, Some(refresh_token.to_string())))
}

/// A bearer token for `server_url`, refreshed if expiring.  `None` when the
/// store has nothing for this server (the caller decides whether to start
/// the interactive flow).
pub async fn current_token(
    client: &reqwest::Client,
    server_url: &str,
) -> anyhow::Result<Option<String>> {
    let store = token_store();
    let Some(tokens) = store.get(server_url) else {
        return Ok(None);
    };
    if !tokens.expiring() {
        return Ok(Some(tokens.access_token));
    }
    let Some(rt) = tokens.refresh_token.clone() else {
        return Ok(None);
    };
    let endpoints = discover_endpoints(client, server_url).await;
    let fresh = refresh(client, &endpoints, &rt).await?;
    let access = fresh.access_token.clone();
    store.put(server_url, fresh);
    Ok(Some(access))
}

/// Run the managed authorization-code flow: build the URL, elicit the code
/// from the user, exchange it, persist the tokens, return the access token.
pub async fn managed_flow(
    client: &reqwest::Client,
    server_url: &str,
    elicit: &cagent_tools::ElicitationHandler,
) -> anyhow::Result<String> {
    let endpoints = discover_endpoints(client, server_url).await;
    let (verifier, challenge) = pkce_pair();
    let state = uuid::Uuid::new_v4().simple().to_string();
    let redirect_uri = "http://localhost/callback";
    let url = authorize_url(&endpoints, redirect_uri, &state, &challenge);

    let code = elicit(format!(
        "Authorization required. Open this URL, approve access, and paste the code:\n{url}"
    ))
    .await
    .context("user declined authorization")?;
    let code = code.trim();
    if code.is_empty() {
        bail!("empty authorization code");
    }

    let tokens = exchange_code(client, &endpoints, code, &verifier, redirect_uri).await?;
    let access = tokens.access_token.clone();
    token_store().put(server_url, tokens);
    Ok(access)
}

/// Extract the server's challenge text from a 401 for unmanaged mode.
pub fn challenge_from_response(www_authenticate: Option<&str>, body: &str) -> String {
    match www_authenticate {
        Some(h) if !h.is_empty() => h.to_string(),
        _ if !body.is_empty() => body.to_string(),
        _ => "authorization required".to_string(),
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkce_verifier_length_and_charset() {
        let (verifier, challenge) = pkce_pair();
        assert_eq!(verifier.len(), 64);
        assert!(verifier.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(!challenge.contains('='), "challenge must be unpadded");
        assert!(!challenge.contains('+') && !challenge.contains('/'));
    }

    #[test]
    fn pkce_pairs_are_unique() {
        let (a, _) = pkce_pair();
        let (b, _) = pkce_pair();
        assert_ne!(a, b);
    }

    #[test]
    fn pkce_challenge_is_s256_of_verifier() {
        let (verifier, challenge) = pkce_pair();
        let expected = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(Sha256::digest(verifier.as_bytes()));
        assert_eq!(challenge, expected);
    }

    #[test]
    fn origin_strips_path() {
        assert_eq!(origin_of("https://mcp.example.com/v1/sse"), "https://mcp.example.com");
        assert_eq!(origin_of("http://localhost:8080/x"), "http://localhost:8080");
    }

    #[test]
    fn authorize_url_contains_pkce_params() {
        let e = AuthEndpoints {
            authorization_endpoint: "https://as.example.com/authorize".into(),
            token_endpoint: "https://as.example.com/token".into(),
        };
        let url = authorize_url(&e, "http://localhost/callback", "st", "chal");
        assert!(url.starts_with("https://as.example.com/authorize?"));
        assert!(url.contains("code_challenge=chal"));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains("redirect_uri=http%3A%2F%2Flocalhost%2Fcallback"));
    }

    #[test]
    fn tokens_expiring_inside_refresh_window() {
        let soon = Tokens {
            access_token: "a".into(),
            refresh_token: None,
            expires_at: chrono::Utc::now().timestamp() + 10,
        };
        assert!(soon.expiring());
        let later = Tokens {
            access_token: "a".into(),
            refresh_token: None,
            expires_at: chrono::Utc::now().timestamp() + 3600,
        };
        assert!(!later.expiring());
    }

    #[test]
    fn debug_redacts_secrets() {
        let t = Tokens {
            access_token: "very-secret".into(),
            refresh_token: Some("also-secret".into()),
            expires_at: 0,
        };
        let s = format!("{t:?}");
        assert!(!s.contains("very-secret"));
        assert!(!s.contains("also-secret"));
        assert!(s.contains("REDACTED"));
    }

    #[test]
    fn in_memory_store_round_trips() {
        let store = InMemoryTokenStore::default();
        store.put(
            "https://s",
            Tokens { access_token: "t".into(), refresh_token: None, expires_at: 99 },
        );
        assert_eq!(store.get("https://s").unwrap().access_token, "t");
        assert!(store.get("https://other").is_none());
    }

    #[test]
    fn challenge_prefers_www_authenticate() {
        assert_eq!(
            challenge_from_response(Some("Bearer realm=\"mcp\""), "body"),
            "Bearer realm=\"mcp\""
        );
        assert_eq!(challenge_from_response(None, "body text"), "body text");
        assert_eq!(challenge_from_response(None, ""), "authorization required");
    }

    #[test]
    fn refresh_response_keeps_previous_refresh_token() {
        let t = tokens_from_response(
            TokenResponse {
                access_token: "new".into(),
                refresh_token: None,
                expires_in: Some(60),
            },
            Some("old-refresh".into()),
        );
        assert_eq!(t.refresh_token.as_deref(), Some("old-refresh"));
    }
}
