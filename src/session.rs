//! Session Module
//!
//! Owns the credential pair and its lifecycle: login, logout, proactive
//! and reactive renewal, and cold-start restoration from durable storage.
//! This is the only module that touches durable storage.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::api::{ApiError, AuthApi};
use crate::config::CoreConfig;
use crate::models::{Role, UserProfile};
use crate::storage::Storage;

pub const KEY_TOKEN: &str = "token";
pub const KEY_REFRESH_TOKEN: &str = "refreshToken";
pub const KEY_ROLE: &str = "role";
pub const KEY_USER_ID: &str = "userId";
pub const KEY_DRIVER_ID: &str = "driverId";

/// Tokens are treated as stale slightly before the estimate runs out so
/// an in-flight request cannot cross the boundary mid-call.
const EXPIRY_MARGIN_SECS: i64 = 30;

/// The active credential pair and identity claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub user_id: String,
    pub role: Role,
    pub expires_at_estimate: chrono::DateTime<chrono::Utc>,
}

impl Session {
    /// Whether the access token is still worth presenting to the backend.
    pub fn believed_valid(&self) -> bool {
        chrono::Utc::now() + chrono::Duration::seconds(EXPIRY_MARGIN_SECS)
            < self.expires_at_estimate
    }
}

/// Authentication lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Uninitialized,
    Initializing,
    Authenticated,
    Anonymous,
}

struct Inner {
    session: Option<Session>,
    profile: Option<UserProfile>,
    driver_id: Option<String>,
}

/// Manages authentication state.
///
/// Exactly one refresh call can be in flight at a time: the gate mutex
/// serializes attempts and the generation counter lets late joiners adopt
/// the outcome of the attempt they waited on instead of issuing another.
pub struct SessionManager {
    auth: Arc<dyn AuthApi>,
    storage: Arc<dyn Storage>,
    token_lifetime: chrono::Duration,
    refresh_interval: std::time::Duration,
    inner: std::sync::Mutex<Inner>,
    state_tx: watch::Sender<AuthState>,
    refresh_gate: tokio::sync::Mutex<()>,
    refresh_generation: AtomicU64,
    scheduler: std::sync::Mutex<Option<JoinHandle<()>>>,
    // handle to ourselves for the scheduler task, set by new_cyclic
    weak_self: Weak<SessionManager>,
}

impl SessionManager {
    pub fn new(auth: Arc<dyn AuthApi>, storage: Arc<dyn Storage>, cfg: &CoreConfig) -> Arc<Self> {
        let (state_tx, _) = watch::channel(AuthState::Uninitialized);
        Arc::new_cyclic(|weak_self| Self {
            auth,
            storage,
            token_lifetime: chrono::Duration::from_std(cfg.token_lifetime)
                .unwrap_or_else(|_| chrono::Duration::minutes(15)),
            refresh_interval: cfg.refresh_interval,
            inner: std::sync::Mutex::new(Inner {
                session: None,
                profile: None,
                driver_id: None,
            }),
            state_tx,
            refresh_gate: tokio::sync::Mutex::new(()),
            refresh_generation: AtomicU64::new(0),
            scheduler: std::sync::Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> AuthState {
        *self.state_tx.borrow()
    }

    /// Watch lifecycle transitions; dependents re-route to login on
    /// `Anonymous`.
    pub fn subscribe_state(&self) -> watch::Receiver<AuthState> {
        self.state_tx.subscribe()
    }

    /// Snapshot of the current session, if any.
    pub fn current_session(&self) -> Option<Session> {
        self.inner.lock().unwrap().session.clone()
    }

    /// Cached profile of the authenticated account.
    pub fn profile(&self) -> Option<UserProfile> {
        self.inner.lock().unwrap().profile.clone()
    }

    /// Driver identifier for driver accounts.
    pub fn driver_id(&self) -> Option<String> {
        self.inner.lock().unwrap().driver_id.clone()
    }

    /// Restore a session from durable storage, if one survives validation.
    ///
    /// Resolves to either `Authenticated` or `Anonymous` before returning;
    /// dependents must not proceed earlier. Every network call involved is
    /// timeout-bounded by the API client.
    pub async fn initialize(&self) -> AuthState {
        self.state_tx.send_replace(AuthState::Initializing);

        let token = self.storage.get(KEY_TOKEN);
        let refresh_token = self.storage.get(KEY_REFRESH_TOKEN);
        let role = self
            .storage
            .get(KEY_ROLE)
            .and_then(|r| r.parse::<Role>().ok());
        let user_id = self.storage.get(KEY_USER_ID);

        let (Some(token), Some(refresh_token), Some(role), Some(user_id)) =
            (token, refresh_token, role, user_id)
        else {
            debug!("No stored session found");
            self.state_tx.send_replace(AuthState::Anonymous);
            return AuthState::Anonymous;
        };

        // Install provisionally with an already-stale estimate; nothing
        // trusts the token until validation below succeeds.
        {
            let mut inner = self.inner.lock().unwrap();
            inner.session = Some(Session {
                access_token: token.clone(),
                refresh_token,
                user_id,
                role,
                expires_at_estimate: chrono::Utc::now(),
            });
            inner.driver_id = self.storage.get(KEY_DRIVER_ID);
        }

        match self.auth.me(&token).await {
            Ok(profile) => {
                let mut inner = self.inner.lock().unwrap();
                if let Some(session) = &mut inner.session {
                    session.expires_at_estimate = chrono::Utc::now() + self.token_lifetime;
                }
                if profile.driver_id.is_some() {
                    inner.driver_id = profile.driver_id.clone();
                }
                inner.profile = Some(profile);
                drop(inner);
                info!("Stored session validated");
                self.state_tx.send_replace(AuthState::Authenticated);
                self.start_scheduler();
            }
            Err(e) => {
                debug!("Stored token rejected ({}), attempting refresh", e);
                match self.refresh().await {
                    Ok(_) => {
                        self.state_tx.send_replace(AuthState::Authenticated);
                        self.start_scheduler();
                    }
                    Err(_) => {
                        // refresh() already destroyed the session
                        warn!("Refresh failed during init");
                    }
                }
            }
        }

        self.state()
    }

    /// Authenticate with the backend and install the resulting session.
    ///
    /// On failure any existing session is left untouched.
    pub async fn login(&self, email: &str, password: &str) -> Result<UserProfile, ApiError> {
        let outcome = self.auth.login(email, password).await?;

        let session = Session {
            access_token: outcome.access_token,
            refresh_token: outcome.refresh_token,
            user_id: outcome.user.id.clone(),
            role: outcome.user.role,
            expires_at_estimate: chrono::Utc::now() + self.token_lifetime,
        };

        self.persist(&session, outcome.user.driver_id.as_deref());
        {
            let mut inner = self.inner.lock().unwrap();
            inner.session = Some(session);
            inner.driver_id = outcome.user.driver_id.clone();
            inner.profile = Some(outcome.user.clone());
        }

        info!("Session set for user: {}", outcome.user.id);
        self.state_tx.send_replace(AuthState::Authenticated);
        self.start_scheduler();
        Ok(outcome.user)
    }

    /// Tear down the session. Always succeeds locally; the server-side
    /// token invalidation is best-effort.
    pub async fn logout(&self) {
        info!("Logging out");

        let refresh_token = self
            .inner
            .lock()
            .unwrap()
            .session
            .as_ref()
            .map(|s| s.refresh_token.clone());

        if let Some(token) = refresh_token {
            let _ = self.auth.logout(&token).await;
        }

        self.destroy();
    }

    /// Return an access token believed valid, refreshing first if needed.
    ///
    /// Safe to call from any number of in-flight requests concurrently;
    /// at most one refresh call reaches the network.
    pub async fn ensure_valid(&self) -> Result<String, ApiError> {
        {
            let inner = self.inner.lock().unwrap();
            match &inner.session {
                Some(s) if s.believed_valid() => return Ok(s.access_token.clone()),
                Some(_) => {}
                None => return Err(ApiError::Unauthorized),
            }
        }
        self.refresh().await
    }

    /// Exchange the refresh token for a new access token.
    ///
    /// Single-flight: concurrent callers wait on the same attempt and
    /// adopt its outcome. Any failure is fatal for the session and is
    /// surfaced as `Unauthorized`; callers must re-authenticate.
    pub async fn refresh(&self) -> Result<String, ApiError> {
        let seen = self.refresh_generation.load(Ordering::Acquire);
        let _gate = self.refresh_gate.lock().await;

        if self.refresh_generation.load(Ordering::Acquire) != seen {
            // A refresh completed while we waited on the gate.
            let inner = self.inner.lock().unwrap();
            return match &inner.session {
                Some(s) => Ok(s.access_token.clone()),
                None => Err(ApiError::Unauthorized),
            };
        }

        let refresh_token = {
            let inner = self.inner.lock().unwrap();
            match &inner.session {
                Some(s) => s.refresh_token.clone(),
                None => return Err(ApiError::Unauthorized),
            }
        };

        match self.auth.refresh(&refresh_token).await {
            Ok(access_token) => {
                {
                    let mut inner = self.inner.lock().unwrap();
                    if let Some(session) = &mut inner.session {
                        session.access_token = access_token.clone();
                        session.expires_at_estimate = chrono::Utc::now() + self.token_lifetime;
                    }
                }
                if let Err(e) = self.storage.set(KEY_TOKEN, &access_token) {
                    error!("Failed to persist refreshed token: {}", e);
                }
                self.refresh_generation.fetch_add(1, Ordering::AcqRel);
                debug!("Access token refreshed");

                self.hydrate_profile().await;
                Ok(access_token)
            }
            Err(e) => {
                warn!("Refresh failed: {}", e);
                self.destroy();
                self.refresh_generation.fetch_add(1, Ordering::AcqRel);
                Err(ApiError::Unauthorized)
            }
        }
    }

    /// Drop the session without contacting the server. Used by the
    /// gateway when the backend rejects a freshly refreshed token.
    pub(crate) fn invalidate(&self) {
        warn!("Session invalidated by repeated authorization failure");
        self.destroy();
    }

    /// Fetch and cache the profile after a cold reload left it empty.
    /// Failure is logged, never fatal; the session keeps working on the
    /// stored identity claims.
    async fn hydrate_profile(&self) {
        let token = {
            let inner = self.inner.lock().unwrap();
            if inner.profile.is_some() {
                return;
            }
            match &inner.session {
                Some(s) => s.access_token.clone(),
                None => return,
            }
        };

        match self.auth.me(&token).await {
            Ok(profile) => {
                let mut inner = self.inner.lock().unwrap();
                if profile.driver_id.is_some() {
                    inner.driver_id = profile.driver_id.clone();
                }
                inner.profile = Some(profile);
            }
            Err(e) => error!("Failed to fetch user after refresh: {}", e),
        }
    }

    /// Renew once per interval while a session exists, independent of
    /// demand-driven refreshes; both funnel through the same gate.
    fn start_scheduler(&self) {
        let weak = self.weak_self.clone();
        let period = self.refresh_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else { break };
                match manager.refresh().await {
                    Ok(_) => debug!("Scheduled token refresh complete"),
                    Err(e) => {
                        // refresh() destroyed the session; nothing left to renew
                        warn!("Scheduled refresh failed: {}", e);
                        break;
                    }
                }
            }
        });

        let mut slot = self.scheduler.lock().unwrap();
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
    }

    fn persist(&self, session: &Session, driver_id: Option<&str>) {
        let entries = [
            (KEY_TOKEN, session.access_token.as_str()),
            (KEY_REFRESH_TOKEN, session.refresh_token.as_str()),
            (KEY_USER_ID, session.user_id.as_str()),
        ];
        for (key, value) in entries {
            if let Err(e) = self.storage.set(key, value) {
                error!("Failed to persist {}: {}", key, e);
            }
        }
        if let Err(e) = self.storage.set(KEY_ROLE, &session.role.to_string()) {
            error!("Failed to persist {}: {}", KEY_ROLE, e);
        }
        if let Some(id) = driver_id {
            if let Err(e) = self.storage.set(KEY_DRIVER_ID, id) {
                error!("Failed to persist {}: {}", KEY_DRIVER_ID, e);
            }
        }
    }

    fn destroy(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.session = None;
            inner.profile = None;
            inner.driver_id = None;
        }
        for key in [
            KEY_TOKEN,
            KEY_REFRESH_TOKEN,
            KEY_ROLE,
            KEY_USER_ID,
            KEY_DRIVER_ID,
        ] {
            let _ = self.storage.remove(key);
        }
        self.state_tx.send_replace(AuthState::Anonymous);
        if let Some(handle) = self.scheduler.lock().unwrap().take() {
            handle.abort();
        }
        info!("Session cleared");
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.scheduler.lock().unwrap().take() {
            handle.abort();
        }
    }
}
