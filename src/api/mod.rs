//! Typed ESI endpoint wrappers behind the cached-access facade
//!
//! [`Eva`] is the handle a UI holds: one method per ESI resource, each one
//! declaring its cache category and tags and delegating the fetch decision
//! to [`CachedAccess`]. Session operations are forwarded to the session
//! manager so callers never touch token state directly.

pub mod models;

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::auth::{Credential, SessionManager, SessionState};
use crate::cache::{
    CacheStats, CacheStore, PolicyTable, SWEEP_INTERVAL, cache_key, categories,
};
use crate::client::EsiClient;
use crate::config::Config;
use crate::error::{ApiError, CacheError, Result};
use crate::facade::{CachedAccess, Fetched};
use models::*;

/// Tag attached to every cache entry belonging to one character
fn character_tag(character_id: i64) -> String {
    format!("character:{}", character_id)
}

/// The data-access handle for the whole application
pub struct Eva {
    session: Arc<SessionManager>,
    access: CachedAccess,
    cache: Arc<CacheStore>,
    client: Arc<EsiClient>,
}

impl Eva {
    /// Build the full stack: disk-backed cache in the platform cache
    /// directory, persisted session, live ESI endpoints
    pub fn new(config: Config) -> Result<Self> {
        let cache_dir = dirs::cache_dir()
            .ok_or(CacheError::NoHome)?
            .join("eva");
        let cache = Arc::new(CacheStore::open(&cache_dir));

        let http = reqwest::Client::new();
        let session = Arc::new(SessionManager::new(config.clone(), http.clone())?);
        let client = Arc::new(EsiClient::new(config.clone(), http, Arc::clone(&session)));
        let policy = PolicyTable::new(config.max_cache_age());

        Ok(Self {
            session,
            access: CachedAccess::new(Arc::clone(&cache), policy),
            cache,
            client,
        })
    }

    /// Assemble from explicit parts (used by tests)
    pub fn with_parts(
        cache: Arc<CacheStore>,
        policy: PolicyTable,
        session: Arc<SessionManager>,
        client: Arc<EsiClient>,
    ) -> Self {
        Self {
            session,
            access: CachedAccess::new(Arc::clone(&cache), policy),
            cache,
            client,
        }
    }

    /// Start the background sweeper that evicts entries past their grace
    /// window; runs until the returned handle is dropped or aborted
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(&self.cache).run_sweeper(SWEEP_INTERVAL))
    }

    // --- session ---

    /// Run the interactive SSO login flow
    pub async fn login(&self) -> Result<Credential> {
        self.session.login().await
    }

    /// Drop the credential and every cached entry for the character
    pub async fn logout(&self) {
        if let Some((character_id, _)) = self.session.character().await {
            self.invalidate_character(character_id);
        }
        self.session.logout().await;
    }

    pub async fn is_authenticated(&self) -> bool {
        self.session.is_authenticated().await
    }

    pub async fn session_state(&self) -> SessionState {
        self.session.state().await
    }

    /// The logged-in character id and name, if any
    pub async fn character(&self) -> Option<(i64, String)> {
        self.session.character().await
    }

    // --- cache management ---

    /// Drop every cached entry belonging to the character
    pub fn invalidate_character(&self, character_id: i64) {
        self.access.invalidate_by_tag(&character_tag(character_id));
    }

    /// Drop the entire cache, both tiers; returns entries removed
    pub fn clear_cache(&self) -> usize {
        self.access.clear()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.access.cache_stats()
    }

    /// Update the user TTL ceiling; applies from the next fetch
    pub fn set_max_cache_age(&self, ceiling: Option<Duration>) {
        self.access.set_max_cache_age(ceiling);
    }

    // --- public endpoints ---

    pub async fn server_status(&self) -> std::result::Result<Fetched<ServerStatus>, ApiError> {
        self.public_get(categories::SERVER_STATUS, None, "/v1/status/".to_string())
            .await
    }

    pub async fn character_info(
        &self,
        character_id: i64,
    ) -> std::result::Result<Fetched<CharacterInfo>, ApiError> {
        let id = character_id.to_string();
        self.public_get(
            categories::CHARACTER_INFO,
            Some(&id),
            format!("/v5/characters/{}/", character_id),
        )
        .await
    }

    pub async fn universe_type(
        &self,
        type_id: i64,
    ) -> std::result::Result<Fetched<UniverseType>, ApiError> {
        let id = type_id.to_string();
        self.public_get(
            categories::UNIVERSE_TYPE,
            Some(&id),
            format!("/v3/universe/types/{}/", type_id),
        )
        .await
    }

    pub async fn universe_group(
        &self,
        group_id: i64,
    ) -> std::result::Result<Fetched<UniverseGroup>, ApiError> {
        let id = group_id.to_string();
        self.public_get(
            categories::UNIVERSE_GROUP,
            Some(&id),
            format!("/v1/universe/groups/{}/", group_id),
        )
        .await
    }

    pub async fn market_prices(&self) -> std::result::Result<Fetched<Vec<MarketPrice>>, ApiError> {
        self.public_get(categories::MARKET_PRICES, None, "/v1/markets/prices/".to_string())
            .await
    }

    // --- authenticated endpoints ---

    pub async fn skills(
        &self,
        character_id: i64,
    ) -> std::result::Result<Fetched<CharacterSkills>, ApiError> {
        self.character_get(
            categories::CHARACTER_SKILLS,
            character_id,
            format!("/v4/characters/{}/skills/", character_id),
        )
        .await
    }

    pub async fn skill_queue(
        &self,
        character_id: i64,
    ) -> std::result::Result<Fetched<Vec<SkillQueueEntry>>, ApiError> {
        self.character_get(
            categories::CHARACTER_SKILLQUEUE,
            character_id,
            format!("/v2/characters/{}/skillqueue/", character_id),
        )
        .await
    }

    pub async fn attributes(
        &self,
        character_id: i64,
    ) -> std::result::Result<Fetched<CharacterAttributes>, ApiError> {
        self.character_get(
            categories::CHARACTER_ATTRIBUTES,
            character_id,
            format!("/v1/characters/{}/attributes/", character_id),
        )
        .await
    }

    pub async fn implants(
        &self,
        character_id: i64,
    ) -> std::result::Result<Fetched<Vec<i64>>, ApiError> {
        self.character_get(
            categories::CHARACTER_IMPLANTS,
            character_id,
            format!("/v1/characters/{}/implants/", character_id),
        )
        .await
    }

    pub async fn clones(
        &self,
        character_id: i64,
    ) -> std::result::Result<Fetched<CharacterClones>, ApiError> {
        self.character_get(
            categories::CHARACTER_CLONES,
            character_id,
            format!("/v3/characters/{}/clones/", character_id),
        )
        .await
    }

    pub async fn location(
        &self,
        character_id: i64,
    ) -> std::result::Result<Fetched<CharacterLocation>, ApiError> {
        self.character_get(
            categories::CHARACTER_LOCATION,
            character_id,
            format!("/v1/characters/{}/location/", character_id),
        )
        .await
    }

    /// Wallet balance in ISK; ESI returns a bare JSON number
    pub async fn wallet(&self, character_id: i64) -> std::result::Result<Fetched<f64>, ApiError> {
        self.character_get(
            categories::CHARACTER_WALLET,
            character_id,
            format!("/v1/characters/{}/wallet/", character_id),
        )
        .await
    }

    pub async fn mail_headers(
        &self,
        character_id: i64,
    ) -> std::result::Result<Fetched<Vec<MailHeader>>, ApiError> {
        self.character_get(
            categories::CHARACTER_MAIL,
            character_id,
            format!("/v1/characters/{}/mail/", character_id),
        )
        .await
    }

    pub async fn industry_jobs(
        &self,
        character_id: i64,
    ) -> std::result::Result<Fetched<Vec<IndustryJob>>, ApiError> {
        self.character_get(
            categories::CHARACTER_INDUSTRY,
            character_id,
            format!("/v1/characters/{}/industry/jobs/", character_id),
        )
        .await
    }

    // --- plumbing ---

    async fn public_get<T>(
        &self,
        category: &'static str,
        identifier: Option<&str>,
        path: String,
    ) -> std::result::Result<Fetched<T>, ApiError>
    where
        T: Serialize + DeserializeOwned,
    {
        let key = cache_key(category, identifier, &[]);
        let client = Arc::clone(&self.client);
        self.access
            .fetch(category, &key, &[], move || async move {
                client.get_json(&path, &[], false).await
            })
            .await
    }

    async fn character_get<T>(
        &self,
        category: &'static str,
        character_id: i64,
        path: String,
    ) -> std::result::Result<Fetched<T>, ApiError>
    where
        T: Serialize + DeserializeOwned,
    {
        let id = character_id.to_string();
        let key = cache_key(category, Some(&id), &[]);
        let tags = vec![character_tag(character_id)];
        let client = Arc::clone(&self.client);
        self.access
            .fetch(category, &key, &tags, move || async move {
                client.get_json(&path, &[], true).await
            })
            .await
    }
}
