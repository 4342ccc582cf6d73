//! The OAuth2 credential and its durable storage
//!
//! Exactly one credential is active per running instance. It is created by a
//! successful authorization exchange, replaced wholesale by a refresh, and
//! deleted entirely on logout. Character identity comes from the claims
//! embedded in the JWT access token.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AuthError, ConfigError, Result};

/// Refresh this long before actual expiry so an in-flight request never
/// carries a token that dies mid-call
pub const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Token endpoint response body
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_expires_in")]
    pub expires_in: i64,
}

fn default_expires_in() -> i64 {
    1200
}

/// Claims embedded in the SSO access token
#[derive(Debug, Deserialize)]
struct TokenClaims {
    sub: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    scp: Scopes,
}

/// The `scp` claim is a bare string for a single scope, an array otherwise
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Scopes {
    One(String),
    Many(Vec<String>),
}

impl Default for Scopes {
    fn default() -> Self {
        Scopes::Many(Vec::new())
    }
}

impl From<Scopes> for Vec<String> {
    fn from(scopes: Scopes) -> Self {
        match scopes {
            Scopes::One(s) => vec![s],
            Scopes::Many(v) => v,
        }
    }
}

/// The active OAuth2 token set plus subject identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    pub character_id: i64,
    pub character_name: String,
    pub expires_at: DateTime<Utc>,
    pub scopes: Vec<String>,
}

impl Credential {
    /// Build a credential from a token endpoint response.
    ///
    /// `fallback_refresh` carries the previous refresh token forward when a
    /// refresh response omits one.
    pub fn from_token_response(
        response: TokenResponse,
        fallback_refresh: Option<String>,
    ) -> std::result::Result<Self, AuthError> {
        let claims = decode_claims(&response.access_token)?;

        // Subject is "CHARACTER:EVE:<id>"
        let character_id = claims
            .sub
            .rsplit(':')
            .next()
            .and_then(|id| id.parse::<i64>().ok())
            .ok_or_else(|| AuthError::BadToken(format!("unexpected subject: {}", claims.sub)))?;

        let refresh_token = response
            .refresh_token
            .or(fallback_refresh)
            .ok_or_else(|| AuthError::BadToken("token response without refresh token".into()))?;

        Ok(Self {
            access_token: response.access_token,
            refresh_token,
            character_id,
            character_name: claims.name.unwrap_or_default(),
            expires_at: Utc::now() + ChronoDuration::seconds(response.expires_in),
            scopes: claims.scp.into(),
        })
    }

    /// Whether the access token has expired or is inside the safety margin
    pub fn needs_refresh(&self) -> bool {
        let margin = ChronoDuration::from_std(EXPIRY_MARGIN).unwrap_or(ChronoDuration::zero());
        self.expires_at - margin <= Utc::now()
    }
}

/// Decode the JWT payload segment without signature verification.
///
/// Identity claims only; the token's authority is established by the
/// provider accepting it, not by local verification.
fn decode_claims(access_token: &str) -> std::result::Result<TokenClaims, AuthError> {
    let payload = access_token
        .split('.')
        .nth(1)
        .ok_or_else(|| AuthError::BadToken("access token is not a JWT".into()))?;

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| AuthError::BadToken(format!("payload is not base64url: {}", e)))?;

    serde_json::from_slice(&bytes)
        .map_err(|e| AuthError::BadToken(format!("unparseable claims: {}", e)))
}

/// Durable storage for the single credential record.
///
/// Unreadable or partial records load as "not authenticated" rather than
/// crashing; the user simply logs in again.
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Store at the default platform location
    pub fn default_location() -> Result<Self> {
        let base = dirs::config_dir().ok_or(ConfigError::NoHome)?;
        Ok(Self {
            path: base.join("eva").join("credential.json"),
        })
    }

    /// Store at a specific path (for testing)
    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    /// Load the persisted credential, if any
    pub fn load(&self) -> Option<Credential> {
        let contents = std::fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str(&contents) {
            Ok(credential) => Some(credential),
            Err(e) => {
                log::warn!("Ignoring unreadable credential record: {}", e);
                None
            }
        }
    }

    /// Persist the credential with private permissions
    pub fn save(&self, credential: &Credential) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = serde_json::to_string_pretty(credential)?;
        std::fs::write(&self.path, contents)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&self.path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(&self.path, perms)?;
        }

        Ok(())
    }

    /// Delete the persisted credential; missing file is fine
    pub fn delete(&self) {
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            log::warn!("Failed to delete persisted credential: {}", e);
        }
    }
}
