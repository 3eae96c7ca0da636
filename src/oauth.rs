//! OAuth Client (C10).
//!
//! Implements RFC 9728 protected-resource discovery, RFC 8414 authorization
//! server metadata discovery, RFC 7591 dynamic client registration, and the
//! PKCE (S256, with a plain fallback for servers that refuse S256)
//! authorization-code flow an in-container agent needs to reach a
//! third-party provider. Tokens are held at rest in a `chacha20poly1305`
//! encrypted vault, never logged, and injected into exec'd child processes
//! as environment variables only at the moment of use.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use chrono::{DateTime, Utc};
use rand::RngCore;
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use url::Url;

use crate::error::{Error, Result};

/// Refresh proactively this many seconds before expiry rather than waiting
/// for a 401 from the resource server.
pub const REFRESH_SKEW_SECS: i64 = 60;

// ── PKCE ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PkceChallenge {
    pub verifier: String,
    pub challenge: String,
    pub method: &'static str,
}

fn b64url(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Generate an S256 PKCE pair. Callers that discover the authorization
/// server only advertises `plain` should fall back to [`generate_pkce_plain`].
pub fn generate_pkce_s256() -> PkceChallenge {
    let mut verifier_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut verifier_bytes);
    let verifier = b64url(&verifier_bytes);
    let challenge = b64url(&Sha256::digest(verifier.as_bytes()));
    PkceChallenge {
        verifier,
        challenge,
        method: "S256",
    }
}

pub fn generate_pkce_plain() -> PkceChallenge {
    let mut verifier_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut verifier_bytes);
    let verifier = b64url(&verifier_bytes);
    PkceChallenge {
        challenge: verifier.clone(),
        verifier,
        method: "plain",
    }
}

pub fn generate_state() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    b64url(&bytes)
}

// ── Discovery (RFC 9728 / RFC 8414 / RFC 7591) ──────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectedResourceMetadata {
    pub resource: String,
    #[serde(default)]
    pub authorization_servers: Vec<String>,
    #[serde(default)]
    pub scopes_supported: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationServerMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub registration_endpoint: Option<String>,
    #[serde(default)]
    pub scopes_supported: Vec<String>,
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
struct ClientRegistrationRequest {
    redirect_uris: Vec<String>,
    client_name: String,
    grant_types: Vec<String>,
    response_types: Vec<String>,
    token_endpoint_auth_method: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRegistrationResponse {
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
}

fn well_known_url(base: &Url, suffix: &str) -> Result<Url> {
    let mut url = base.clone();
    if !url.path().ends_with('/') {
        url.set_path(&format!("{}/", url.path()));
    }
    url.join(&format!(".well-known/{suffix}"))
        .map_err(|e| Error::Network(format!("invalid discovery base url: {e}")))
}

pub async fn fetch_resource_metadata(client: &Client, resource_url: &Url) -> Result<ProtectedResourceMetadata> {
    let url = well_known_url(resource_url, "oauth-protected-resource")?;
    let resp = client.get(url.as_str()).header("Accept", "application/json").send().await?;
    if !resp.status().is_success() {
        return Err(Error::Network(format!("protected resource metadata returned HTTP {}", resp.status())));
    }
    Ok(resp.json().await?)
}

pub async fn fetch_as_metadata(client: &Client, issuer: &Url) -> Result<AuthorizationServerMetadata> {
    let url = well_known_url(issuer, "oauth-authorization-server")?;
    let resp = client.get(url.as_str()).header("Accept", "application/json").send().await?;
    if !resp.status().is_success() {
        return Err(Error::Network(format!("authorization server metadata returned HTTP {}", resp.status())));
    }
    Ok(resp.json().await?)
}

/// Discover the authorization server for `resource_url`, falling back to
/// treating `resource_url` itself as the issuer when no protected-resource
/// document is published.
pub async fn discover(client: &Client, resource_url: &Url) -> Result<AuthorizationServerMetadata> {
    match fetch_resource_metadata(client, resource_url).await {
        Ok(meta) => {
            let issuer = meta
                .authorization_servers
                .first()
                .ok_or_else(|| Error::Network("protected resource metadata named no authorization server".to_string()))?;
            let issuer_url = Url::parse(issuer).map_err(|e| Error::Network(format!("invalid issuer url: {e}")))?;
            fetch_as_metadata(client, &issuer_url).await
        }
        Err(_) => fetch_as_metadata(client, resource_url).await,
    }
}

pub async fn register_client(
    client: &Client,
    registration_endpoint: &str,
    redirect_uris: Vec<String>,
    client_name: &str,
) -> Result<ClientRegistrationResponse> {
    let req = ClientRegistrationRequest {
        redirect_uris,
        client_name: client_name.to_string(),
        grant_types: vec!["authorization_code".to_string(), "refresh_token".to_string()],
        response_types: vec!["code".to_string()],
        token_endpoint_auth_method: "none".to_string(),
    };
    let resp = client
        .post(registration_endpoint)
        .header("Content-Type", "application/json")
        .json(&req)
        .send()
        .await?;
    if !resp.status().is_success() {
        return Err(Error::Network(format!("dynamic client registration returned HTTP {}", resp.status())));
    }
    Ok(resp.json().await?)
}

/// Extract the `resource_metadata` URL from a `WWW-Authenticate: Bearer ...`
/// header, per RFC 9728 §5.1. Returns `None` for non-Bearer challenges or
/// ones that don't carry the parameter.
pub fn parse_www_authenticate(header: &str) -> Option<String> {
    let stripped = header.strip_prefix("Bearer").or_else(|| header.strip_prefix("bearer"))?.trim_start();
    for part in stripped.split(',') {
        let part = part.trim();
        if let Some(value) = part.strip_prefix("resource_metadata=").or_else(|| part.strip_prefix("resource_metadata =")) {
            let value = value.trim().trim_matches('"');
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

// ── Token types ──────────────────────────────────────────────────────────

#[derive(Clone, Serialize, Deserialize)]
pub struct OAuthTokens {
    #[serde(serialize_with = "serialize_secret")]
    pub access_token: Secret<String>,
    #[serde(default, serialize_with = "serialize_option_secret")]
    pub refresh_token: Option<Secret<String>>,
    #[serde(default)]
    pub account_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// `secrecy`'s `serde` feature derives `Deserialize` but deliberately not
/// `Serialize`, so these two helpers do the exposing explicitly — used
/// only for the encrypted-at-rest vault entry, never for logging.
fn serialize_secret<S: serde::Serializer>(secret: &Secret<String>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

fn serialize_option_secret<S: serde::Serializer>(secret: &Option<Secret<String>>, serializer: S) -> Result<S::Ok, S::Error> {
    match secret {
        Some(s) => serializer.serialize_some(s.expose_secret()),
        None => serializer.serialize_none(),
    }
}

impl std::fmt::Debug for OAuthTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthTokens")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("account_id", &self.account_id)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl OAuthTokens {
    pub fn needs_refresh(&self) -> bool {
        match self.expires_at {
            Some(exp) => Utc::now() + chrono::Duration::seconds(REFRESH_SKEW_SECS) >= exp,
            None => false,
        }
    }
}

fn parse_token_response(resp: &serde_json::Value) -> Result<OAuthTokens> {
    let access_token = resp["access_token"]
        .as_str()
        .ok_or_else(|| Error::Auth("token response missing access_token".to_string()))?
        .to_string();
    let refresh_token = resp["refresh_token"].as_str().map(|s| s.to_string());
    let account_id = resp.get("account_id").and_then(|v| v.as_str()).map(|s| s.to_string());
    let expires_at = resp["expires_in"].as_i64().map(|secs| Utc::now() + chrono::Duration::seconds(secs));
    Ok(OAuthTokens {
        access_token: Secret::new(access_token),
        refresh_token: refresh_token.map(Secret::new),
        account_id,
        expires_at,
    })
}

// ── Authorization-code flow ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OAuthProviderConfig {
    pub client_id: String,
    pub auth_url: String,
    pub token_url: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub resource: Option<String>,
}

pub struct AuthorizationRequest {
    pub url: String,
    pub pkce: PkceChallenge,
    pub state: String,
}

pub struct OAuthFlow {
    config: OAuthProviderConfig,
    client: Client,
    pkce_s256_supported: bool,
}

impl OAuthFlow {
    pub fn new(config: OAuthProviderConfig, pkce_s256_supported: bool) -> Self {
        Self {
            config,
            client: Client::new(),
            pkce_s256_supported,
        }
    }

    pub fn start(&self) -> Result<AuthorizationRequest> {
        let pkce = if self.pkce_s256_supported {
            generate_pkce_s256()
        } else {
            generate_pkce_plain()
        };
        let state = generate_state();

        let mut url = Url::parse(&self.config.auth_url).map_err(|e| Error::Network(format!("invalid auth_url: {e}")))?;
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("response_type", "code")
                .append_pair("client_id", &self.config.client_id)
                .append_pair("redirect_uri", &self.config.redirect_uri)
                .append_pair("code_challenge", &pkce.challenge)
                .append_pair("code_challenge_method", pkce.method)
                .append_pair("state", &state);
            if let Some(resource) = &self.config.resource {
                q.append_pair("resource", resource);
            }
            if !self.config.scopes.is_empty() {
                q.append_pair("scope", &self.config.scopes.join(" "));
            }
        }

        Ok(AuthorizationRequest {
            url: url.to_string(),
            pkce,
            state,
        })
    }

    pub async fn exchange(&self, code: &str, verifier: &str) -> Result<OAuthTokens> {
        let mut form = vec![
            ("grant_type".to_string(), "authorization_code".to_string()),
            ("code".to_string(), code.to_string()),
            ("redirect_uri".to_string(), self.config.redirect_uri.clone()),
            ("client_id".to_string(), self.config.client_id.clone()),
            ("code_verifier".to_string(), verifier.to_string()),
        ];
        if let Some(resource) = &self.config.resource {
            form.push(("resource".to_string(), resource.clone()));
        }
        let resp = self.client.post(&self.config.token_url).form(&form).send().await?;
        if !resp.status().is_success() {
            return Err(Error::Auth(format!("code exchange returned HTTP {}", resp.status())));
        }
        parse_token_response(&resp.json::<serde_json::Value>().await?)
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<OAuthTokens> {
        let mut form = vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("refresh_token".to_string(), refresh_token.to_string()),
            ("client_id".to_string(), self.config.client_id.clone()),
        ];
        if let Some(resource) = &self.config.resource {
            form.push(("resource".to_string(), resource.clone()));
        }
        let resp = self.client.post(&self.config.token_url).form(&form).send().await?;
        if !resp.status().is_success() {
            return Err(Error::Auth(format!("refresh returned HTTP {}", resp.status())));
        }
        parse_token_response(&resp.json::<serde_json::Value>().await?)
    }
}

// ── Encrypted token vault ────────────────────────────────────────────────

/// One persisted, encrypted OAuth grant, keyed by `(sandbox_id, provider)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKey {
    pub sandbox_id: String,
    pub provider: String,
}

impl SessionKey {
    fn storage_key(&self) -> String {
        format!("{}:{}", self.sandbox_id, self.provider)
    }
}

#[derive(Serialize, Deserialize)]
struct EncryptedEntry {
    nonce: String,
    ciphertext: String,
}

/// File-backed, `chacha20poly1305`-encrypted token store. One ciphertext
/// blob per `(sandbox_id, provider)` pair; the cipher key never touches
/// disk in plaintext form alongside the ciphertext.
pub struct TokenVault {
    path: PathBuf,
    cipher: ChaCha20Poly1305,
    lock: Mutex<()>,
}

impl TokenVault {
    pub fn new(path: impl Into<PathBuf>, key: &[u8; 32]) -> Self {
        Self {
            path: path.into(),
            cipher: ChaCha20Poly1305::new(key.into()),
            lock: Mutex::new(()),
        }
    }

    async fn read_map(&self) -> HashMap<String, EncryptedEntry> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => serde_json::from_str(&data).unwrap_or_default(),
            Err(_) => HashMap::new(),
        }
    }

    async fn write_map(&self, map: &HashMap<String, EncryptedEntry>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let data = serde_json::to_string_pretty(map).map_err(|e| Error::runtime(format!("vault serialize failed: {e}")))?;
        tokio::fs::write(&self.path, data).await?;
        set_owner_only_permissions(&self.path).await;
        Ok(())
    }

    pub async fn store(&self, key: &SessionKey, tokens: &OAuthTokens) -> Result<()> {
        let _guard = self.lock.lock().await;
        let plaintext = serde_json::to_vec(tokens).map_err(|e| Error::runtime(format!("token serialize failed: {e}")))?;

        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_ref())
            .map_err(|_| Error::runtime("token encryption failed"))?;

        let mut map = self.read_map().await;
        map.insert(
            key.storage_key(),
            EncryptedEntry {
                nonce: b64url(&nonce_bytes),
                ciphertext: b64url(&ciphertext),
            },
        );
        self.write_map(&map).await
    }

    pub async fn load(&self, key: &SessionKey) -> Result<Option<OAuthTokens>> {
        let _guard = self.lock.lock().await;
        let map = self.read_map().await;
        let Some(entry) = map.get(&key.storage_key()) else {
            return Ok(None);
        };
        let nonce_bytes = decode_b64url(&entry.nonce)?;
        let ciphertext = decode_b64url(&entry.ciphertext)?;
        let nonce = Nonce::from_slice(&nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|_| Error::runtime("token decryption failed"))?;
        let tokens: OAuthTokens =
            serde_json::from_slice(&plaintext).map_err(|e| Error::runtime(format!("token deserialize failed: {e}")))?;
        Ok(Some(tokens))
    }

    /// Evict a session's tokens. Called on a 401/`invalid_token` response
    /// from the resource server, forcing a fresh authorization next time.
    pub async fn evict(&self, key: &SessionKey) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut map = self.read_map().await;
        map.remove(&key.storage_key());
        self.write_map(&map).await
    }
}

fn decode_b64url(value: &str) -> Result<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|e| Error::runtime(format!("corrupt vault entry: {e}")))
}

#[cfg(unix)]
async fn set_owner_only_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await;
}

#[cfg(not(unix))]
async fn set_owner_only_permissions(_path: &Path) {}

// ── High-level session manager ───────────────────────────────────────────

/// Ties discovery, the authorization-code flow, and the token vault
/// together per sandbox/provider. Holds in-flight `OAuthFlow`s (and their
/// PKCE verifiers) keyed by `state` until the callback arrives.
pub struct OAuthManager {
    vault: TokenVault,
    http: Client,
    pending: Mutex<HashMap<String, (SessionKey, OAuthFlow, String)>>,
    flows: Mutex<HashMap<String, OAuthFlow>>,
}

impl OAuthManager {
    pub fn new(vault: TokenVault) -> Self {
        Self {
            vault,
            http: Client::new(),
            pending: Mutex::new(HashMap::new()),
            flows: Mutex::new(HashMap::new()),
        }
    }

    /// Discover the provider (dynamically registering a client if the
    /// caller didn't supply one) and produce the URL to send the user to.
    pub async fn begin_authorization(
        &self,
        key: SessionKey,
        resource_url: &str,
        redirect_uri: &str,
        client_id: Option<String>,
        scopes: Vec<String>,
    ) -> Result<String> {
        let resource = Url::parse(resource_url).map_err(|e| Error::Network(format!("invalid resource url: {e}")))?;
        let as_meta = discover(&self.http, &resource).await?;

        let client_id = match client_id {
            Some(id) => id,
            None => {
                let endpoint = as_meta
                    .registration_endpoint
                    .clone()
                    .ok_or_else(|| Error::Auth("no client_id supplied and server has no registration endpoint".to_string()))?;
                register_client(&self.http, &endpoint, vec![redirect_uri.to_string()], "agentpod")
                    .await?
                    .client_id
            }
        };

        let pkce_s256 = as_meta.code_challenge_methods_supported.iter().any(|m| m == "S256")
            || as_meta.code_challenge_methods_supported.is_empty();

        let flow = OAuthFlow::new(
            OAuthProviderConfig {
                client_id,
                auth_url: as_meta.authorization_endpoint,
                token_url: as_meta.token_endpoint,
                redirect_uri: redirect_uri.to_string(),
                scopes,
                resource: Some(resource_url.to_string()),
            },
            pkce_s256,
        );

        let request = flow.start()?;
        let mut pending = self.pending.lock().await;
        pending.insert(request.state.clone(), (key, flow, request.pkce.verifier.clone()));
        Ok(request.url)
    }

    /// Complete the flow once the redirect callback delivers `code`/`state`.
    /// Stores the resulting tokens in the vault and returns the session key.
    pub async fn complete_authorization(&self, state: &str, code: &str) -> Result<SessionKey> {
        let (key, flow, verifier) = {
            let mut pending = self.pending.lock().await;
            pending.remove(state).ok_or_else(|| Error::not_found(format!("no pending authorization for state '{state}'")))?
        };
        let tokens = flow.exchange(code, &verifier).await?;
        self.vault.store(&key, &tokens).await?;
        self.flows.lock().await.insert(key.storage_key(), flow);
        Ok(key)
    }

    /// Return a currently-valid access token for `key`, refreshing it first
    /// if it is within [`REFRESH_SKEW_SECS`] of expiry. The provider's flow
    /// configuration (endpoints, client id) is the one captured at
    /// [`complete_authorization`] time for this session.
    pub async fn valid_access_token(&self, key: &SessionKey) -> Result<Secret<String>> {
        let tokens = self.vault.load(key).await?.ok_or(Error::AuthRequired)?;
        if !tokens.needs_refresh() {
            return Ok(tokens.access_token);
        }
        let refresh_token = tokens.refresh_token.ok_or(Error::AuthRequired)?;
        let flows = self.flows.lock().await;
        let flow = flows.get(&key.storage_key()).ok_or(Error::AuthRequired)?;
        let refreshed = flow.refresh(refresh_token.expose_secret()).await?;
        self.vault.store(key, &refreshed).await?;
        Ok(refreshed.access_token)
    }

    /// Called when a resource server rejects a token with 401/`invalid_token`.
    pub async fn on_unauthorized(&self, key: &SessionKey) -> Result<()> {
        self.vault.evict(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkce_s256_challenge_matches_verifier() {
        let pair = generate_pkce_s256();
        let expected = b64url(&Sha256::digest(pair.verifier.as_bytes()));
        assert_eq!(pair.challenge, expected);
        assert_eq!(pair.method, "S256");
    }

    #[test]
    fn parses_www_authenticate_resource_metadata() {
        let header = r#"Bearer realm="x", resource_metadata="https://example.com/.well-known/oauth-protected-resource""#;
        assert_eq!(
            parse_www_authenticate(header).as_deref(),
            Some("https://example.com/.well-known/oauth-protected-resource")
        );
    }

    #[test]
    fn non_bearer_challenge_has_no_resource_metadata() {
        assert!(parse_www_authenticate("Basic realm=\"x\"").is_none());
    }

    #[tokio::test]
    async fn vault_round_trips_and_evicts() {
        let dir = tempfile::tempdir().unwrap();
        let key_bytes = [7u8; 32];
        let vault = TokenVault::new(dir.path().join("tokens.json"), &key_bytes);
        let session = SessionKey {
            sandbox_id: "sbx_1".to_string(),
            provider: "github".to_string(),
        };
        let tokens = OAuthTokens {
            access_token: Secret::new("secret-access".to_string()),
            refresh_token: Some(Secret::new("secret-refresh".to_string())),
            account_id: Some("acct_1".to_string()),
            expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
        };

        vault.store(&session, &tokens).await.unwrap();
        let loaded = vault.load(&session).await.unwrap().unwrap();
        assert_eq!(loaded.access_token.expose_secret(), "secret-access");
        assert!(!loaded.needs_refresh());

        vault.evict(&session).await.unwrap();
        assert!(vault.load(&session).await.unwrap().is_none());
    }

    #[test]
    fn tokens_near_expiry_need_refresh() {
        let tokens = OAuthTokens {
            access_token: Secret::new("a".to_string()),
            refresh_token: None,
            account_id: None,
            expires_at: Some(Utc::now() + chrono::Duration::seconds(30)),
        };
        assert!(tokens.needs_refresh());
    }

    #[test]
    fn debug_output_never_exposes_secrets() {
        let tokens = OAuthTokens {
            access_token: Secret::new("super-secret".to_string()),
            refresh_token: Some(Secret::new("also-secret".to_string())),
            account_id: None,
            expires_at: None,
        };
        let rendered = format!("{tokens:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(!rendered.contains("also-secret"));
    }
}
