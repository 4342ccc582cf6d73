//! EVE SSO authentication: OAuth2 authorization-code flow with PKCE,
//! credential persistence, and transparent refresh.
//!
//! The [`session::SessionManager`] is the single owner of the credential;
//! everything else in the crate asks it for access tokens and never touches
//! token state directly.

pub mod callback;
pub mod credential;
pub mod pkce;
pub mod session;

pub use credential::{Credential, CredentialStore, EXPIRY_MARGIN, TokenResponse};
pub use session::{SessionManager, SessionState, SsoEndpoints, UrlHandler};
