//! Configuration management for evacore
//!
//! Settings are stored as YAML in the platform config directory. Everything
//! here is loaded once at startup; the only value consulted again at runtime
//! is the cache TTL ceiling, which the policy table reads on every call.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ConfigError, Result};

/// EVE SSO authorization endpoint
pub const DEFAULT_AUTHORIZE_URL: &str = "https://login.eveonline.com/v2/oauth/authorize";

/// EVE SSO token endpoint
pub const DEFAULT_TOKEN_URL: &str = "https://login.eveonline.com/v2/oauth/token";

/// ESI API base URL
pub const DEFAULT_ESI_BASE_URL: &str = "https://esi.evetech.net";

/// Scopes requested by default; covers every panel the companion renders.
pub const DEFAULT_SCOPES: &[&str] = &[
    "esi-skills.read_skills.v1",
    "esi-skills.read_skillqueue.v1",
    "esi-clones.read_clones.v1",
    "esi-clones.read_implants.v1",
    "esi-location.read_location.v1",
    "esi-wallet.read_character_wallet.v1",
    "esi-mail.read_mail.v1",
    "esi-industry.read_character_jobs.v1",
];

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// SSO application client ID
    pub client_id: String,

    /// SSO client secret; omitted for public PKCE clients
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    /// Loopback port the SSO redirect lands on
    #[serde(default = "default_callback_port")]
    pub callback_port: u16,

    /// ESI scopes to request at login
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,

    /// Descriptive client identifier sent with every request,
    /// per ESI guidelines
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// User-configured ceiling clamping every cache policy's TTL downward
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cache_age_secs: Option<u64>,

    /// Remote call tuning
    #[serde(default)]
    pub remote: RemoteConfig,
}

/// Remote call tuning: retry budget, backoff base, and call deadlines.
///
/// These are reasonable defaults carried over from the provider's guidance,
/// not load-tested contracts; treat them as tunable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Base backoff delay in milliseconds; doubles per retry (1s, 2s, 4s)
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Deadline for unauthenticated/public calls
    #[serde(default = "default_public_timeout_secs")]
    pub public_timeout_secs: u64,

    /// Deadline for authenticated calls
    #[serde(default = "default_authed_timeout_secs")]
    pub authed_timeout_secs: u64,

    /// Outbound request pacing, requests per second
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,

    /// Authorization flow timeout in seconds
    #[serde(default = "default_login_timeout_secs")]
    pub login_timeout_secs: u64,
}

fn default_callback_port() -> u16 {
    48629
}

fn default_scopes() -> Vec<String> {
    DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect()
}

fn default_user_agent() -> String {
    format!(
        "evacore/{} (+https://github.com/eva-app/evacore)",
        env!("CARGO_PKG_VERSION")
    )
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_public_timeout_secs() -> u64 {
    10
}

fn default_authed_timeout_secs() -> u64 {
    30
}

fn default_requests_per_second() -> u32 {
    10
}

fn default_login_timeout_secs() -> u64 {
    300
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: default_backoff_base_ms(),
            public_timeout_secs: default_public_timeout_secs(),
            authed_timeout_secs: default_authed_timeout_secs(),
            requests_per_second: default_requests_per_second(),
            login_timeout_secs: default_login_timeout_secs(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: None,
            callback_port: default_callback_port(),
            scopes: default_scopes(),
            user_agent: default_user_agent(),
            max_cache_age_secs: None,
            remote: RemoteConfig::default(),
        }
    }
}

impl Config {
    /// Get the default config file path (~/.config/eva/config.yaml on Linux)
    pub fn default_path() -> Result<PathBuf> {
        let base = dirs::config_dir().ok_or(ConfigError::NoHome)?;
        Ok(base.join("eva").join("config.yaml"))
    }

    /// Load configuration from the default path, falling back to defaults
    /// when no file exists yet
    pub fn load() -> Result<Self> {
        Self::load_from(Self::default_path()?)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: PathBuf) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(&path)?;
        let config: Config = serde_yaml::from_str(&contents).map_err(ConfigError::from)?;
        Ok(config)
    }

    /// Save configuration to the default path
    pub fn save(&self) -> Result<()> {
        self.save_to(Self::default_path()?)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents =
            serde_yaml::to_string(self).map_err(|e| ConfigError::SaveError(e.to_string()))?;
        std::fs::write(&path, contents)?;

        // The file carries a client secret; keep it private on Unix
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(&path, perms)?;
        }

        Ok(())
    }

    /// The loopback redirect URI registered with the SSO application
    pub fn redirect_uri(&self) -> String {
        format!("http://127.0.0.1:{}/callback", self.callback_port)
    }

    /// TTL ceiling as a duration, if configured
    pub fn max_cache_age(&self) -> Option<Duration> {
        self.max_cache_age_secs.map(Duration::from_secs)
    }

    /// Backoff base delay for retries
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.remote.backoff_base_ms)
    }

    /// Call deadline for the given authentication mode
    pub fn call_timeout(&self, authenticated: bool) -> Duration {
        if authenticated {
            Duration::from_secs(self.remote.authed_timeout_secs)
        } else {
            Duration::from_secs(self.remote.public_timeout_secs)
        }
    }

    /// Authorization flow deadline
    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.remote.login_timeout_secs)
    }
}
