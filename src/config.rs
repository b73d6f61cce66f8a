//! Configuration Module
//!
//! Runtime settings for the client core: backend endpoints, timeouts,
//! and the token renewal / reconnect policies.

use std::time::Duration;

const DEFAULT_API_URL: &str = "https://ecoroute360-backend.onrender.com/api";
const DEFAULT_PUSH_URL: &str = "https://ecoroute360-backend.onrender.com";

/// Client core configuration.
///
/// `Default` gives the production endpoints; `from_env` lets a deployment
/// override them without a rebuild.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Base URL for the REST backend, without a trailing slash.
    pub api_base_url: String,
    /// URL the push transport connects to.
    pub push_url: String,
    /// Upper bound for any single HTTP request.
    pub request_timeout: Duration,
    /// Assumed access-token lifetime used for the expiry estimate.
    pub token_lifetime: Duration,
    /// Background renewal period. Kept comfortably below the token
    /// lifetime (14 min for a 15 min token).
    pub refresh_interval: Duration,
    /// Initial delay before a push-channel reconnect attempt.
    pub reconnect_initial: Duration,
    /// Ceiling for the doubling reconnect delay.
    pub reconnect_max: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.to_string(),
            push_url: DEFAULT_PUSH_URL.to_string(),
            request_timeout: Duration::from_secs(15),
            token_lifetime: Duration::from_secs(15 * 60),
            refresh_interval: Duration::from_secs(14 * 60),
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

impl CoreConfig {
    /// Build a config from the environment, falling back to defaults.
    ///
    /// Recognized variables: `ECOROUTE_API_URL`, `ECOROUTE_PUSH_URL`.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(url) = std::env::var("ECOROUTE_API_URL") {
            cfg.api_base_url = url.trim_end_matches('/').to_string();
        }
        if let Ok(url) = std::env::var("ECOROUTE_PUSH_URL") {
            cfg.push_url = url;
        }
        cfg
    }
}
