//! Access and refresh tokens, and refresh-token persistence.
//!
//! Tokens are wrapped in `SecretString`, so they never show up in logs or
//! `Debug` output. Refresh tokens can be persisted between runs through a
//! [`TokenStore`]: the system keyring with an environment variable fallback
//! for CI, or plain memory.
//!
//! # Example
//!
//! ```ignore
//! use acc_ratings::session::KeyringTokenStore;
//!
//! let store = KeyringTokenStore::new("acc-ratings").with_env_fallback();
//! store.save(&RefreshToken::new("..."))?;
//! let token = store.load()?;
//! ```

use std::env;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::{Error, Result};

/// Environment variable consulted when the keyring has no refresh token.
pub const REFRESH_TOKEN_ENV: &str = "ACC_REFRESH_TOKEN";

/// Keyring account name the refresh token is stored under.
const KEYRING_ACCOUNT: &str = "refresh-token";

macro_rules! secret_token {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone)]
        pub struct $name(SecretString);

        impl $name {
            pub fn new(token: impl Into<String>) -> Self {
                Self(SecretString::from(token.into()))
            }

            /// Expose the secret value.
            ///
            /// Use sparingly - only when actually sending to the API.
            pub fn expose_secret(&self) -> &str {
                self.0.expose_secret()
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!(stringify!($name), "([REDACTED])"))
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self::new(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::new(s)
            }
        }
    };
}

secret_token!(
    /// Short-lived bearer credential sent with authorized requests.
    AccessToken
);
secret_token!(
    /// Long-lived credential exchanged for new access tokens.
    RefreshToken
);

/// Tokens handed out by the server at login or refresh.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: AccessToken,
    /// Present at login; present on refresh only when the server rotates it.
    pub refresh_token: Option<RefreshToken>,
    pub expires_at: DateTime<Utc>,
}

/// Locally held session credentials.
///
/// The access token is valid on the half-open interval
/// `[issued_at, expires_at)`.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_token: Option<AccessToken>,
    pub refresh_token: RefreshToken,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Credentials {
    /// Build credentials from a grant received at `now`.
    ///
    /// Keeps `previous` as refresh token when the grant does not rotate it.
    pub fn from_grant(
        grant: TokenGrant,
        previous: Option<RefreshToken>,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        let refresh_token = grant.refresh_token.or(previous)?;
        Some(Self {
            access_token: Some(grant.access_token),
            refresh_token,
            issued_at: now,
            expires_at: grant.expires_at,
        })
    }

    /// Credentials holding only a refresh token, e.g. restored from disk.
    pub fn refresh_only(refresh_token: RefreshToken, now: DateTime<Utc>) -> Self {
        Self {
            access_token: None,
            refresh_token,
            issued_at: now,
            expires_at: now,
        }
    }

    /// The access token, if it is valid at `now`.
    pub fn valid_access_token(&self, now: DateTime<Utc>) -> Option<&AccessToken> {
        if self.issued_at <= now && now < self.expires_at {
            self.access_token.as_ref()
        } else {
            None
        }
    }
}

/// Persistence for the refresh token.
pub trait TokenStore: Send + Sync {
    /// Load a previously saved refresh token.
    fn load(&self) -> Result<Option<RefreshToken>>;

    /// Save the refresh token, replacing any previous one.
    fn save(&self, token: &RefreshToken) -> Result<()>;

    /// Remove the saved refresh token. Removing nothing is not an error.
    fn clear(&self) -> Result<()>;
}

/// Refresh-token storage in the system keyring.
///
/// # Storage Priority
///
/// When loading:
/// 1. System keyring (if available)
/// 2. [`REFRESH_TOKEN_ENV`] (if `env_fallback` is enabled)
///
/// Saving always uses the keyring; the environment is read-only.
pub struct KeyringTokenStore {
    service_name: String,
    env_fallback: bool,
}

impl KeyringTokenStore {
    /// Create a new keyring-backed store.
    ///
    /// # Arguments
    ///
    /// * `service_name` - Service identifier for keyring (e.g., "acc-ratings")
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            env_fallback: false,
        }
    }

    /// Enable environment variable fallback.
    pub fn with_env_fallback(mut self) -> Self {
        self.env_fallback = true;
        self
    }

    fn keyring_entry(&self) -> Result<keyring::Entry> {
        keyring::Entry::new(&self.service_name, KEYRING_ACCOUNT)
            .map_err(|e| Error::Keyring(e.to_string()))
    }

    fn load_from_keyring(&self) -> Option<RefreshToken> {
        let entry = self.keyring_entry().ok()?;
        entry.get_password().ok().map(RefreshToken::new)
    }

    fn load_from_env(&self) -> Option<RefreshToken> {
        env::var(REFRESH_TOKEN_ENV)
            .ok()
            .filter(|v| !v.is_empty())
            .map(RefreshToken::new)
    }
}

impl TokenStore for KeyringTokenStore {
    fn load(&self) -> Result<Option<RefreshToken>> {
        if let Some(token) = self.load_from_keyring() {
            debug!(service = %self.service_name, "loaded refresh token from keyring");
            return Ok(Some(token));
        }

        if self.env_fallback
            && let Some(token) = self.load_from_env()
        {
            debug!("loaded refresh token from environment");
            return Ok(Some(token));
        }

        Ok(None)
    }

    fn save(&self, token: &RefreshToken) -> Result<()> {
        let entry = self.keyring_entry()?;
        entry
            .set_password(token.expose_secret())
            .map_err(|e| Error::Keyring(e.to_string()))?;
        debug!(service = %self.service_name, "stored refresh token in keyring");
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let entry = self.keyring_entry()?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => {
                debug!(service = %self.service_name, "cleared refresh token from keyring");
                Ok(())
            }
            Err(e) => Err(Error::Keyring(e.to_string())),
        }
    }
}

/// Refresh-token storage that lives only as long as the process.
#[derive(Default)]
pub struct MemoryTokenStore {
    token: Mutex<Option<RefreshToken>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already holds a token.
    pub fn with_token(token: impl Into<RefreshToken>) -> Self {
        Self {
            token: Mutex::new(Some(token.into())),
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> Result<Option<RefreshToken>> {
        Ok(self
            .token
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone())
    }

    fn save(&self, token: &RefreshToken) -> Result<()> {
        *self
            .token
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(token.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self
            .token
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
        Ok(())
    }
}
