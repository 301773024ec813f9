//! Access-credential lifecycle.
//!
//! [`SessionManager`] hands out a valid access token on demand. A token that
//! is still inside `[issued_at, expires_at)` is returned straight from memory.
//! Once it has expired, the refresh token is exchanged for a new one, and
//! every caller that asks while that exchange is running awaits the same
//! in-flight future instead of starting its own.
//!
//! ```text
//!   caller A ──┐
//!   caller B ──┼──▶ access_token() ──▶ valid? ──yes──▶ cached token
//!   caller C ──┘                          │
//!                                         no
//!                                         ▼
//!                              ┌─────────────────────┐
//!                              │ shared refresh gate │──▶ AuthApi::refresh
//!                              └─────────────────────┘
//!                                 ok: store credentials
//!                                 rejected: clear session, NotAuthenticated
//! ```
//!
//! # Example
//!
//! ```ignore
//! use acc_ratings::session::SessionManager;
//!
//! let session = SessionManager::new(auth.clone());
//! session.login("ana", "secret").await?;
//! let token = session.access_token().await?;
//! ```

mod clock;
mod tokens;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use tracing::{debug, info, warn};

pub use clock::{Clock, ManualClock, SystemClock};
pub use tokens::{
    AccessToken, Credentials, KeyringTokenStore, MemoryTokenStore, REFRESH_TOKEN_ENV,
    RefreshToken, TokenGrant, TokenStore,
};

use crate::config::DEFAULT_AUTH_TIMEOUT;
use crate::store::AuthApi;
use crate::{Error, Result};

type RefreshFuture = Shared<BoxFuture<'static, Result<AccessToken>>>;

#[derive(Default)]
struct SessionState {
    credentials: Option<Credentials>,
    refresh: Option<RefreshFuture>,
    /// Bumped on login, logout and forced logout so a refresh started
    /// against an older session cannot overwrite a newer one.
    epoch: u64,
}

fn lock(state: &Mutex<SessionState>) -> MutexGuard<'_, SessionState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Whether a refresh failure means the refresh token itself is dead.
fn is_rejection(err: &Error) -> bool {
    err.is_auth() || matches!(err, Error::Api { status, .. } if (400..500).contains(status))
}

/// Owns the session credentials and refreshes them on demand.
pub struct SessionManager {
    auth: Arc<dyn AuthApi>,
    token_store: Option<Arc<dyn TokenStore>>,
    clock: Arc<dyn Clock>,
    auth_timeout: Duration,
    state: Arc<Mutex<SessionState>>,
}

impl SessionManager {
    /// Create a manager with no session, on wall-clock time.
    pub fn new(auth: Arc<dyn AuthApi>) -> Self {
        Self {
            auth,
            token_store: None,
            clock: Arc::new(SystemClock),
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            state: Arc::new(Mutex::new(SessionState::default())),
        }
    }

    /// Persist refresh tokens in `store`.
    #[must_use]
    pub fn with_token_store(mut self, store: Arc<dyn TokenStore>) -> Self {
        self.token_store = Some(store);
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Deadline applied to each login and refresh call.
    #[must_use]
    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    /// Whether any credentials are held, valid or not.
    pub fn is_authenticated(&self) -> bool {
        lock(&self.state).credentials.is_some()
    }

    /// Log in with username and password, replacing any current session.
    pub async fn login(&self, username: &str, password: &str) -> Result<()> {
        let grant = tokio::time::timeout(self.auth_timeout, self.auth.login(username, password))
            .await
            .map_err(|_| Error::Timeout(self.auth_timeout))??;

        let now = self.clock.now();
        let credentials = Credentials::from_grant(grant, None, now).ok_or_else(|| {
            Error::Unauthorized("login response did not include a refresh token".to_string())
        })?;
        self.persist(&credentials.refresh_token);

        let mut state = lock(&self.state);
        state.credentials = Some(credentials);
        state.refresh = None;
        state.epoch += 1;
        info!(username, "logged in");
        Ok(())
    }

    /// Resume a session from a persisted refresh token.
    ///
    /// Returns `false` when no token store is configured or it holds nothing.
    /// The next [`access_token`](Self::access_token) call performs the refresh.
    pub fn restore(&self) -> Result<bool> {
        let Some(store) = &self.token_store else {
            return Ok(false);
        };
        let Some(refresh_token) = store.load()? else {
            return Ok(false);
        };

        let mut state = lock(&self.state);
        state.credentials = Some(Credentials::refresh_only(refresh_token, self.clock.now()));
        state.refresh = None;
        state.epoch += 1;
        debug!("restored session from persisted refresh token");
        Ok(true)
    }

    /// Drop all credentials, locally and in the token store.
    pub fn logout(&self) -> Result<()> {
        {
            let mut state = lock(&self.state);
            state.credentials = None;
            state.refresh = None;
            state.epoch += 1;
        }
        if let Some(store) = &self.token_store {
            store.clear()?;
        }
        info!("logged out");
        Ok(())
    }

    /// A currently valid access token.
    ///
    /// Returns immediately when the held token is unexpired. Otherwise joins
    /// or starts the single in-flight refresh.
    ///
    /// # Errors
    ///
    /// [`Error::NotAuthenticated`] when there is no session or the refresh
    /// token was rejected (the session is cleared). Transient failures such
    /// as timeouts are returned as-is and leave the session in place.
    pub async fn access_token(&self) -> Result<AccessToken> {
        let refresh = {
            let mut state = lock(&self.state);
            let now = self.clock.now();
            let refresh_token = match &state.credentials {
                None => return Err(Error::NotAuthenticated),
                Some(credentials) => {
                    if let Some(token) = credentials.valid_access_token(now) {
                        return Ok(token.clone());
                    }
                    credentials.refresh_token.clone()
                }
            };
            if let Some(in_flight) = state.refresh.clone() {
                in_flight
            } else {
                let future = self.start_refresh(refresh_token, state.epoch);
                state.refresh = Some(future.clone());
                future
            }
        };
        refresh.await
    }

    fn start_refresh(&self, refresh_token: RefreshToken, epoch: u64) -> RefreshFuture {
        let auth = Arc::clone(&self.auth);
        let shared = Arc::clone(&self.state);
        let clock = Arc::clone(&self.clock);
        let token_store = self.token_store.clone();
        let timeout = self.auth_timeout;

        async move {
            debug!("refreshing access token");
            let result = tokio::time::timeout(timeout, auth.refresh(&refresh_token))
                .await
                .unwrap_or(Err(Error::Timeout(timeout)));

            let mut state = lock(&shared);
            if state.epoch != epoch {
                debug!("discarding refresh for a replaced session");
                let now = clock.now();
                return state
                    .credentials
                    .as_ref()
                    .and_then(|c| c.valid_access_token(now))
                    .cloned()
                    .ok_or(Error::NotAuthenticated);
            }
            state.refresh = None;

            match result {
                Ok(grant) => {
                    let rotated = grant.refresh_token.clone();
                    let credentials = Credentials::from_grant(grant, Some(refresh_token), clock.now())
                        .ok_or(Error::NotAuthenticated)?;
                    let token = credentials
                        .access_token
                        .clone()
                        .ok_or(Error::NotAuthenticated)?;
                    state.credentials = Some(credentials);
                    drop(state);

                    if let (Some(store), Some(rotated)) = (&token_store, rotated)
                        && let Err(e) = store.save(&rotated)
                    {
                        warn!(error = %e, "failed to persist rotated refresh token");
                    }
                    info!("access token refreshed");
                    Ok(token)
                }
                Err(e) if is_rejection(&e) => {
                    state.credentials = None;
                    state.epoch += 1;
                    drop(state);

                    warn!(error = %e, "refresh token rejected, clearing session");
                    if let Some(store) = &token_store
                        && let Err(e) = store.clear()
                    {
                        warn!(error = %e, "failed to clear persisted refresh token");
                    }
                    Err(Error::NotAuthenticated)
                }
                Err(e) => {
                    warn!(error = %e, "access token refresh failed");
                    Err(e)
                }
            }
        }
        .boxed()
        .shared()
    }

    fn persist(&self, refresh_token: &RefreshToken) {
        if let Some(store) = &self.token_store
            && let Err(e) = store.save(refresh_token)
        {
            warn!(error = %e, "failed to persist refresh token");
        }
    }
}
