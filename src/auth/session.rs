//! OAuth2 session management
//!
//! Owns the single process-wide credential and every mutation of it: the
//! authorization-code login flow, transparent refresh, and logout. All
//! mutation is funneled through this one component; callers only ever see
//! accessor methods.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock, oneshot};
use tokio::task::JoinHandle;
use url::Url;

use super::callback::{self, AuthCallback};
use super::credential::{Credential, CredentialStore, TokenResponse};
use super::pkce::{self, PkcePair};
use crate::config::{Config, DEFAULT_AUTHORIZE_URL, DEFAULT_TOKEN_URL};
use crate::error::{ApiError, AuthError, ConfigError, Error, Result};

/// SSO endpoint URLs; configurable so tests can point at a mock server
#[derive(Debug, Clone)]
pub struct SsoEndpoints {
    pub authorize_url: String,
    pub token_url: String,
}

impl Default for SsoEndpoints {
    fn default() -> Self {
        Self {
            authorize_url: DEFAULT_AUTHORIZE_URL.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
        }
    }
}

/// Observable authentication state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    LoggedOut,
    AuthorizationPending,
    Authenticated,
    Refreshing,
}

/// Receives the authorization URL when a login flow starts.
///
/// The UI layer injects one that opens the user's default browser; the
/// default just logs the URL.
pub type UrlHandler = Box<dyn Fn(&str) + Send + Sync>;

/// Ephemeral single-use state held while an authorization flow is in flight.
///
/// Exactly one slot exists; a newer login aborts the previous listener and
/// invalidates its anti-forgery token.
struct PendingLogin {
    state: String,
    listener_task: JoinHandle<()>,
}

/// Token-endpoint failure split: a definitive rejection destroys the
/// credential, a transient failure must not.
enum RefreshFailure {
    Definitive(String),
    Transient(String),
}

/// Manages the OAuth2 credential lifecycle
pub struct SessionManager {
    http: reqwest::Client,
    config: Config,
    endpoints: SsoEndpoints,
    store: CredentialStore,
    credential: RwLock<Option<Credential>>,
    pending: Mutex<Option<PendingLogin>>,
    refresh_gate: Mutex<()>,
    refreshing: AtomicBool,
    url_handler: UrlHandler,
}

impl SessionManager {
    /// Create a session manager with the default credential location,
    /// loading any persisted credential
    pub fn new(config: Config, http: reqwest::Client) -> Result<Self> {
        let store = CredentialStore::default_location()?;
        Ok(Self::with_parts(config, http, store, SsoEndpoints::default()))
    }

    /// Create a session manager from explicit parts (used by tests)
    pub fn with_parts(
        config: Config,
        http: reqwest::Client,
        store: CredentialStore,
        endpoints: SsoEndpoints,
    ) -> Self {
        let credential = store.load();
        if let Some(ref c) = credential {
            log::info!("Loaded persisted credential for {}", c.character_name);
        }

        Self {
            http,
            config,
            endpoints,
            store,
            credential: RwLock::new(credential),
            pending: Mutex::new(None),
            refresh_gate: Mutex::new(()),
            refreshing: AtomicBool::new(false),
            url_handler: Box::new(|url| {
                log::info!("Open this URL to authorize EVA: {}", url);
            }),
        }
    }

    /// Replace the authorization-URL handler (before sharing the manager)
    pub fn set_url_handler(&mut self, handler: UrlHandler) {
        self.url_handler = handler;
    }

    /// Current authentication state
    pub async fn state(&self) -> SessionState {
        if self.refreshing.load(Ordering::SeqCst) {
            return SessionState::Refreshing;
        }
        if self.pending.lock().await.is_some() {
            return SessionState::AuthorizationPending;
        }
        if self.credential.read().await.is_some() {
            SessionState::Authenticated
        } else {
            SessionState::LoggedOut
        }
    }

    /// Whether a credential is currently held
    pub async fn is_authenticated(&self) -> bool {
        self.credential.read().await.is_some()
    }

    /// The logged-in character, if any
    pub async fn character(&self) -> Option<(i64, String)> {
        self.credential
            .read()
            .await
            .as_ref()
            .map(|c| (c.character_id, c.character_name.clone()))
    }

    /// Run the full authorization-code login flow.
    ///
    /// Generates fresh PKCE material and an anti-forgery state token, starts
    /// a loopback listener, hands the authorization URL to the URL handler,
    /// and waits for exactly one callback. A second concurrent `login` call
    /// supersedes this one: its listener is aborted and this call resolves
    /// with [`AuthError::Superseded`]. The whole flow is bounded by the
    /// configured login timeout.
    pub async fn login(&self) -> Result<Credential> {
        // Supersede any pending flow; awaiting the aborted task guarantees
        // the loopback port is released before we rebind it
        if let Some(old) = self.pending.lock().await.take() {
            log::info!("Superseding pending authorization flow");
            old.listener_task.abort();
            let _ = old.listener_task.await;
        }

        let pkce = PkcePair::generate();
        let state = pkce::state_token();

        let listener = TcpListener::bind(("127.0.0.1", self.config.callback_port))
            .await
            .map_err(|e| AuthError::Listener(e.to_string()))?;
        let (reply_tx, reply_rx) = oneshot::channel();
        let listener_task = tokio::spawn(callback::serve_once(listener, reply_tx));

        *self.pending.lock().await = Some(PendingLogin {
            state: state.clone(),
            listener_task,
        });

        let auth_url = self.authorize_url(&pkce, &state)?;
        (self.url_handler)(&auth_url);

        let outcome = tokio::time::timeout(self.config.login_timeout(), reply_rx).await;

        // Discard the pending slot if it is still ours; a newer login may
        // already have replaced it
        {
            let mut pending = self.pending.lock().await;
            if pending.as_ref().is_some_and(|p| p.state == state)
                && let Some(ours) = pending.take()
            {
                ours.listener_task.abort();
            }
        }

        let callback = match outcome {
            Err(_) => return Err(AuthError::FlowTimeout.into()),
            // Listener dropped without replying: a newer flow took over
            Ok(Err(_)) => return Err(AuthError::Superseded.into()),
            Ok(Ok(Err(e))) => return Err(e.into()),
            Ok(Ok(Ok(callback))) => callback,
        };

        self.complete_login(callback, &state, &pkce).await
    }

    async fn complete_login(
        &self,
        callback: AuthCallback,
        expected_state: &str,
        pkce: &PkcePair,
    ) -> Result<Credential> {
        if callback.state != expected_state {
            log::error!("Authorization callback carried an unexpected state token");
            return Err(AuthError::StateMismatch.into());
        }

        let response = self.exchange_code(&callback.code, &pkce.verifier).await?;
        let credential = Credential::from_token_response(response, None).map_err(Error::from)?;

        if let Err(e) = self.store.save(&credential) {
            log::warn!("Could not persist credential: {}", e);
        }
        *self.credential.write().await = Some(credential.clone());

        log::info!("Logged in as {}", credential.character_name);
        Ok(credential)
    }

    /// Clear the credential and any pending flow; idempotent from any state
    pub async fn logout(&self) {
        if let Some(pending) = self.pending.lock().await.take() {
            pending.listener_task.abort();
        }
        *self.credential.write().await = None;
        self.store.delete();
        log::info!("Logged out");
    }

    /// Return a valid access token, transparently refreshing when the
    /// current one has expired or is inside the safety margin.
    ///
    /// Concurrent callers never trigger more than one refresh: the first
    /// takes the refresh gate, the rest wait on it and re-read the
    /// replacement credential.
    pub async fn valid_access_token(&self) -> std::result::Result<String, ApiError> {
        if let Some(token) = self.token_if_fresh().await? {
            return Ok(token);
        }

        let _gate = self.refresh_gate.lock().await;

        // Another caller may have finished the refresh while we waited
        let refresh_token = match self.token_if_fresh().await? {
            Some(token) => return Ok(token),
            None => {
                let guard = self.credential.read().await;
                match guard.as_ref() {
                    Some(c) => c.refresh_token.clone(),
                    None => return Err(ApiError::NotAuthenticated),
                }
            }
        };

        self.refreshing.store(true, Ordering::SeqCst);
        let result = self.run_refresh(refresh_token).await;
        self.refreshing.store(false, Ordering::SeqCst);
        result
    }

    /// `Ok(Some(token))` while the credential needs no refresh
    async fn token_if_fresh(&self) -> std::result::Result<Option<String>, ApiError> {
        let guard = self.credential.read().await;
        match guard.as_ref() {
            None => Err(ApiError::NotAuthenticated),
            Some(c) if !c.needs_refresh() => Ok(Some(c.access_token.clone())),
            Some(_) => Ok(None),
        }
    }

    async fn run_refresh(&self, refresh_token: String) -> std::result::Result<String, ApiError> {
        match self.refresh_tokens(&refresh_token).await {
            Ok(response) => {
                let credential =
                    Credential::from_token_response(response, Some(refresh_token))
                        .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;
                if let Err(e) = self.store.save(&credential) {
                    log::warn!("Could not persist refreshed credential: {}", e);
                }
                let token = credential.access_token.clone();
                // Replaced wholesale; every caller observes the new instance
                *self.credential.write().await = Some(credential);
                log::debug!("Access token refreshed");
                Ok(token)
            }
            Err(RefreshFailure::Definitive(msg)) => {
                log::warn!("Refresh token rejected, logging out: {}", msg);
                *self.credential.write().await = None;
                self.store.delete();
                Err(ApiError::AuthenticationExpired)
            }
            Err(RefreshFailure::Transient(msg)) => {
                log::warn!("Token refresh failed transiently: {}", msg);
                Err(ApiError::Timeout)
            }
        }
    }

    fn authorize_url(&self, pkce: &PkcePair, state: &str) -> Result<String> {
        let mut url = Url::parse(&self.endpoints.authorize_url)
            .map_err(|e| ConfigError::Invalid(format!("authorize URL: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", &self.config.redirect_uri())
            .append_pair("client_id", &self.config.client_id)
            .append_pair("scope", &self.config.scopes.join(" "))
            .append_pair("state", state)
            .append_pair("code_challenge", &pkce.challenge)
            .append_pair("code_challenge_method", "S256");
        Ok(url.to_string())
    }

    async fn exchange_code(
        &self,
        code: &str,
        verifier: &str,
    ) -> std::result::Result<TokenResponse, AuthError> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", &self.config.client_id),
            ("code_verifier", verifier),
        ];

        let mut request = self.http.post(&self.endpoints.token_url).form(&params);
        if let Some(ref secret) = self.config.client_secret {
            request = request.basic_auth(&self.config.client_id, Some(secret));
        }

        let response = request
            .send()
            .await
            .map_err(|e| AuthError::TokenExchange(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::TokenExchange(format!("{}: {}", status, body)));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| AuthError::TokenExchange(e.to_string()))
    }

    async fn refresh_tokens(
        &self,
        refresh_token: &str,
    ) -> std::result::Result<TokenResponse, RefreshFailure> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", &self.config.client_id),
        ];

        let mut request = self.http.post(&self.endpoints.token_url).form(&params);
        if let Some(ref secret) = self.config.client_secret {
            request = request.basic_auth(&self.config.client_id, Some(secret));
        }

        let response = request
            .send()
            .await
            .map_err(|e| RefreshFailure::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(RefreshFailure::Definitive(format!("{}: {}", status, body)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RefreshFailure::Transient(format!("{}: {}", status, body)));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| RefreshFailure::Transient(e.to_string()))
    }
}
