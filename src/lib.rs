//! evacore - resilient data access for the EVA desktop companion
//!
//! The layer between a UI and the EVE Online ESI API: OAuth2 SSO sessions
//! with transparent refresh, a tiered TTL cache with tag invalidation, a
//! rate-limited HTTP client with failure classification and retry, and a
//! cached-access facade that coalesces duplicate fetches and degrades to
//! stale data when the API is unreachable.
//!
//! Typical entry point:
//!
//! ```no_run
//! use evacore::api::Eva;
//! use evacore::config::Config;
//!
//! # async fn run() -> evacore::error::Result<()> {
//! let eva = Eva::new(Config::load()?)?;
//! eva.spawn_sweeper();
//!
//! let credential = eva.login().await?;
//! let skills = eva.skills(credential.character_id).await?;
//! println!("{} skills cached ({:?})", skills.value.skills.len(), skills.origin);
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod auth;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod facade;

pub use api::Eva;
pub use auth::{Credential, SessionManager, SessionState};
pub use cache::{CacheStats, CacheStore, PolicyTable};
pub use client::EsiClient;
pub use config::Config;
pub use error::{ApiError, AuthError, Error, Result};
pub use facade::{CachedAccess, DataOrigin, Fetched};
