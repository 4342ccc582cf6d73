//! Resilient ESI API client
//!
//! One shared client issues every remote call: it paces requests, attaches
//! authentication, classifies failures, and retries the transient ones with
//! exponential backoff. Callers receive either a parsed payload or a single
//! classified [`ApiError`]; raw HTTP never leaks past this module.

use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::{Client as HttpClient, StatusCode};
use serde::de::DeserializeOwned;
use tokio::time::Instant;

use crate::auth::SessionManager;
use crate::config::{Config, DEFAULT_ESI_BASE_URL};
use crate::error::ApiError;

/// ESI serves several game shards; the companion only ever talks to the
/// live one
const DATASOURCE: &str = "tranquility";

/// Proactively slow down when the shared error budget drops this low
const LOW_ERROR_BUDGET: u32 = 10;

/// Fallback wait when a rate-limit response omits a usable reset header
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// ESI error-budget window state, read from response headers.
///
/// ESI enforces a rolling budget of failed requests per window; exhausting
/// it gets the whole client banned, so the budget is tracked globally.
#[derive(Debug, Clone, Copy)]
struct ErrorBudget {
    remain: u32,
    reset_at: Instant,
}

/// ESI API client
pub struct EsiClient {
    http: HttpClient,
    base_url: String,
    config: Config,
    session: Arc<SessionManager>,
    rate_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    error_budget: Mutex<Option<ErrorBudget>>,
}

impl EsiClient {
    /// Create a client against the live ESI endpoint
    pub fn new(config: Config, http: HttpClient, session: Arc<SessionManager>) -> Self {
        Self::with_base_url(config, http, session, DEFAULT_ESI_BASE_URL.to_string())
    }

    /// Create a client against a specific base URL (used by tests)
    pub fn with_base_url(
        config: Config,
        http: HttpClient,
        session: Arc<SessionManager>,
        base_url: String,
    ) -> Self {
        let per_second =
            NonZeroU32::new(config.remote.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = RateLimiter::direct(Quota::per_second(per_second));

        Self {
            http,
            base_url,
            config,
            session,
            rate_limiter,
            error_budget: Mutex::new(None),
        }
    }

    /// Fetch and deserialize a JSON resource.
    ///
    /// Transient failures are retried with exponential backoff inside this
    /// call; every other failure kind surfaces on first occurrence. The
    /// error returned is the one from the final attempt.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
        authenticated: bool,
    ) -> Result<T, ApiError> {
        let mut attempt = 1u32;
        loop {
            match self.get_json_once(path, query, authenticated).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt >= err.max_attempts() {
                        return Err(err);
                    }
                    let delay = self.config.backoff_base() * 2u32.pow(attempt - 1);
                    log::debug!(
                        "Retrying GET {} after {:?} (attempt {}): {}",
                        path,
                        delay,
                        attempt,
                        err
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// One attempt: pace, authenticate, call, classify
    async fn get_json_once<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
        authenticated: bool,
    ) -> Result<T, ApiError> {
        self.rate_limiter.until_ready().await;
        self.respect_error_budget().await;

        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .http
            .get(&url)
            .header("User-Agent", &self.config.user_agent)
            .query(&[("datasource", DATASOURCE)])
            .query(query);

        if authenticated {
            let token = self.session.valid_access_token().await?;
            request = request.bearer_auth(token);
        }

        let deadline = self.config.call_timeout(authenticated);
        let response = match tokio::time::timeout(deadline, request.send()).await {
            Err(_) => return Err(ApiError::Timeout),
            Ok(Err(e)) => return Err(ApiError::from(e)),
            Ok(Ok(response)) => response,
        };

        self.record_error_budget(response.headers());

        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| ApiError::InvalidResponse(format!("GET {}: {}", path, e)));
        }

        Err(classify_failure(status, response, path).await)
    }

    /// Sleep out the remainder of the window when the shared error budget
    /// is nearly exhausted; a temporary slowdown beats an outright ban
    async fn respect_error_budget(&self) {
        let depleted = {
            let budget = self.error_budget.lock().unwrap_or_else(|e| e.into_inner());
            budget.filter(|b| b.remain <= LOW_ERROR_BUDGET && b.reset_at > Instant::now())
        };

        if let Some(budget) = depleted {
            let wait = budget.reset_at - Instant::now();
            log::warn!(
                "ESI error budget low ({} left), pausing {:?} until the window resets",
                budget.remain,
                wait
            );
            tokio::time::sleep_until(budget.reset_at).await;
        }
    }

    fn record_error_budget(&self, headers: &reqwest::header::HeaderMap) {
        if let Some((remain, reset_secs)) = parse_error_budget(headers) {
            let mut budget = self.error_budget.lock().unwrap_or_else(|e| e.into_inner());
            *budget = Some(ErrorBudget {
                remain,
                reset_at: Instant::now() + Duration::from_secs(reset_secs),
            });
        }
    }
}

/// Read `X-ESI-Error-Limit-Remain` / `X-ESI-Error-Limit-Reset`, both
/// integers, when present together
fn parse_error_budget(headers: &reqwest::header::HeaderMap) -> Option<(u32, u64)> {
    let header_u64 = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
    };

    let remain = header_u64("x-esi-error-limit-remain")?;
    let reset = header_u64("x-esi-error-limit-reset")?;
    Some((remain.min(u32::MAX as u64) as u32, reset))
}

/// Map a non-success response onto the failure taxonomy
async fn classify_failure(status: StatusCode, response: reqwest::Response, path: &str) -> ApiError {
    match status {
        StatusCode::UNAUTHORIZED => ApiError::AuthenticationExpired,
        StatusCode::FORBIDDEN => ApiError::PermissionDenied,
        StatusCode::NOT_FOUND => ApiError::NotFound(path.to_string()),
        // ESI signals rate limiting with the non-standard 420; honor 429 too
        status if status.as_u16() == 420 || status == StatusCode::TOO_MANY_REQUESTS => {
            let retry_after = response
                .headers()
                .get("x-esi-error-limit-reset")
                .or_else(|| response.headers().get("retry-after"))
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RETRY_AFTER);
            ApiError::RateLimited { retry_after }
        }
        status if status.is_server_error() => {
            let body = response.text().await.unwrap_or_default();
            ApiError::TransientServer(format!("{} on GET {}: {}", status, path, body))
        }
        status => ApiError::InvalidResponse(format!("unexpected {} on GET {}", status, path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::credential::tests::fake_token_response;
    use crate::auth::{Credential, CredentialStore, SsoEndpoints};
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Deserialize)]
    struct Status {
        players: u32,
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        // Keep test retries fast
        config.remote.backoff_base_ms = 1;
        config
    }

    fn client_for(server: &mockito::Server, dir: &TempDir, config: Config) -> EsiClient {
        let store = CredentialStore::at(dir.path().join("credential.json"));
        let session = Arc::new(SessionManager::with_parts(
            config.clone(),
            reqwest::Client::new(),
            store,
            SsoEndpoints::default(),
        ));
        EsiClient::with_base_url(config, reqwest::Client::new(), session, server.url())
    }

    fn authed_client_for(server: &mockito::Server, dir: &TempDir, config: Config) -> EsiClient {
        let store = CredentialStore::at(dir.path().join("credential.json"));
        let credential =
            Credential::from_token_response(fake_token_response(42, 3600), None).unwrap();
        store.save(&credential).unwrap();

        let session = Arc::new(SessionManager::with_parts(
            config.clone(),
            reqwest::Client::new(),
            store,
            SsoEndpoints::default(),
        ));
        EsiClient::with_base_url(config, reqwest::Client::new(), session, server.url())
    }

    #[tokio::test]
    async fn test_successful_fetch_includes_datasource() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/status/")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("datasource".into(), "tranquility".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"players": 24213}"#)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let client = client_for(&server, &dir, test_config());

        let status: Status = client.get_json("/v1/status/", &[], false).await.unwrap();
        assert_eq!(status.players, 24213);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_errors_retried_to_budget() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/status/")
            .match_query(mockito::Matcher::Any)
            .with_status(503)
            .with_body("maintenance")
            .expect(3)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let client = client_for(&server, &dir, test_config());

        let result: Result<Status, _> = client.get_json("/v1/status/", &[], false).await;
        match result {
            Err(ApiError::TransientServer(msg)) => assert!(msg.contains("503")),
            other => panic!("expected TransientServer, got {:?}", other),
        }
        // All three attempts hit the wire
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_not_found_fails_fast() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v4/characters/999/skills/")
            .match_query(mockito::Matcher::Any)
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let client = client_for(&server, &dir, test_config());

        let result: Result<Status, _> = client
            .get_json("/v4/characters/999/skills/", &[], false)
            .await;
        match result {
            Err(ApiError::NotFound(path)) => assert!(path.contains("999")),
            other => panic!("expected NotFound, got {:?}", other),
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rate_limit_never_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/status/")
            .match_query(mockito::Matcher::Any)
            .with_status(420)
            .with_header("x-esi-error-limit-reset", "42")
            .expect(1)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let client = client_for(&server, &dir, test_config());

        let result: Result<Status, _> = client.get_json("/v1/status/", &[], false).await;
        match result {
            Err(ApiError::RateLimited { retry_after }) => {
                assert_eq!(retry_after, Duration::from_secs(42));
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_authenticated_request_carries_bearer_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v4/characters/42/skills/")
            .match_query(mockito::Matcher::Any)
            .match_header(
                "authorization",
                mockito::Matcher::Regex("^Bearer .+".into()),
            )
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"players": 1}"#)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let client = authed_client_for(&server, &dir, test_config());

        let result: Result<Status, _> = client
            .get_json("/v4/characters/42/skills/", &[], true)
            .await;
        assert!(result.is_ok());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_authenticated_request_without_login_fails() {
        let server = mockito::Server::new_async().await;
        let dir = TempDir::new().unwrap();
        let client = client_for(&server, &dir, test_config());

        let result: Result<Status, _> = client
            .get_json("/v4/characters/42/skills/", &[], true)
            .await;
        match result {
            Err(ApiError::NotAuthenticated) => {}
            other => panic!("expected NotAuthenticated, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unauthorized_maps_to_authentication_expired() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v4/characters/42/skills/")
            .match_query(mockito::Matcher::Any)
            .with_status(401)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let client = authed_client_for(&server, &dir, test_config());

        let result: Result<Status, _> = client
            .get_json("/v4/characters/42/skills/", &[], true)
            .await;
        match result {
            Err(ApiError::AuthenticationExpired) => {}
            other => panic!("expected AuthenticationExpired, got {:?}", other),
        }
    }

    #[test]
    fn test_error_budget_header_parsing() {
        let mut headers = reqwest::header::HeaderMap::new();
        assert!(parse_error_budget(&headers).is_none());

        headers.insert("x-esi-error-limit-remain", "55".parse().unwrap());
        // Reset header missing: incomplete budget info is ignored
        assert!(parse_error_budget(&headers).is_none());

        headers.insert("x-esi-error-limit-reset", "30".parse().unwrap());
        assert_eq!(parse_error_budget(&headers), Some((55, 30)));
    }

    #[tokio::test]
    async fn test_malformed_body_is_invalid_response() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/status/")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let client = client_for(&server, &dir, test_config());

        let result: Result<Status, _> = client.get_json("/v1/status/", &[], false).await;
        match result {
            Err(ApiError::InvalidResponse(_)) => {}
            other => panic!("expected InvalidResponse, got {:?}", other),
        }
    }
}
