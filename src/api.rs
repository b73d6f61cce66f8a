//! Backend API Module
//!
//! HTTP communication with the EcoRoute backend: the error taxonomy,
//! the endpoint traits the core is written against, and the production
//! reqwest client implementing them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::models::{Bin, Driver, Role, Route, SystemSettings, UserProfile};

/// API errors surfaced to the rest of the core.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    /// Login rejected. Only ever surfaced at the login boundary.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// The backend no longer accepts the session's credentials.
    #[error("unauthorized")]
    Unauthorized,

    /// Transport-level failure (timeout, DNS, connection reset).
    #[error("network error: {0}")]
    Network(String),

    /// The backend answered with an unexpected body.
    #[error("parse error: {0}")]
    Parse(String),

    /// Any other backend rejection.
    #[error("server error: {0}")]
    Server(String),
}

/// Result of a successful login.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub access_token: String,
    pub refresh_token: String,
    pub user: UserProfile,
}

/// Authentication endpoints.
#[async_trait]
pub trait AuthApi: Send + Sync {
    async fn login(&self, email: &str, password: &str) -> Result<LoginOutcome, ApiError>;

    /// Exchange the refresh token for a new access token.
    async fn refresh(&self, refresh_token: &str) -> Result<String, ApiError>;

    /// Invalidate the refresh token server-side.
    async fn logout(&self, refresh_token: &str) -> Result<(), ApiError>;

    /// Fetch the profile of the account the access token belongs to.
    async fn me(&self, access_token: &str) -> Result<UserProfile, ApiError>;
}

/// Snapshot (pull) endpoints. Every method takes the caller-supplied
/// access token; token acquisition and retry live in the gateway.
#[async_trait]
pub trait SnapshotApi: Send + Sync {
    async fn list_bins(&self, access_token: &str) -> Result<Vec<Bin>, ApiError>;
    async fn critical_bins(&self, access_token: &str) -> Result<Vec<Bin>, ApiError>;
    async fn list_routes(&self, access_token: &str) -> Result<Vec<Route>, ApiError>;

    /// The driver's currently assigned route, if any.
    async fn driver_active_route(
        &self,
        access_token: &str,
        driver_id: &str,
    ) -> Result<Option<Route>, ApiError>;

    async fn list_drivers(&self, access_token: &str) -> Result<Vec<Driver>, ApiError>;
    async fn get_settings(&self, access_token: &str) -> Result<SystemSettings, ApiError>;
    async fn update_settings(
        &self,
        access_token: &str,
        settings: &SystemSettings,
    ) -> Result<(), ApiError>;
}

/// Production client for the EcoRoute backend.
pub struct HttpClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpClient {
    /// Create a new API client with a bounded per-request timeout.
    pub fn new(base_url: &str, timeout: std::time::Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Classify a non-success response into the error taxonomy.
    async fn error_for(response: reqwest::Response) -> ApiError {
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return ApiError::Unauthorized;
        }
        let body: ErrorBody = response.json().await.unwrap_or_default();
        let detail = body
            .message
            .or(body.error)
            .unwrap_or_else(|| format!("Status: {}", status));
        ApiError::Server(detail)
    }
}

#[async_trait]
impl AuthApi for HttpClient {
    async fn login(&self, email: &str, password: &str) -> Result<LoginOutcome, ApiError> {
        let url = self.url("/auth/login");
        debug!("Logging in at: {}", url);

        let response = self
            .client
            .post(&url)
            .json(&LoginRequest { email, password })
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ApiError::InvalidCredentials);
        }
        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        let data = response
            .json::<LoginWire>()
            .await
            .map_err(|e| ApiError::Parse(e.to_string()))?;

        info!("Login accepted for user: {}", data.user.id);
        Ok(LoginOutcome {
            access_token: data.token,
            refresh_token: data.data.refresh_token,
            user: data.user.into(),
        })
    }

    async fn refresh(&self, refresh_token: &str) -> Result<String, ApiError> {
        let url = self.url("/auth/refresh");
        debug!("Refreshing access token");

        let response = self
            .client
            .post(&url)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        let data = response
            .json::<RefreshWire>()
            .await
            .map_err(|e| ApiError::Parse(e.to_string()))?;

        Ok(data.data.access_token)
    }

    async fn logout(&self, refresh_token: &str) -> Result<(), ApiError> {
        let url = self.url("/auth/logout");

        let response = self
            .client
            .post(&url)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        info!("Refresh token invalidated server-side");
        Ok(())
    }

    async fn me(&self, access_token: &str) -> Result<UserProfile, ApiError> {
        let url = self.url("/auth/me");

        let response = self
            .client
            .get(&url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        let data = response
            .json::<MeWire>()
            .await
            .map_err(|e| ApiError::Parse(e.to_string()))?;

        Ok(data.data.user.into())
    }
}

#[async_trait]
impl SnapshotApi for HttpClient {
    async fn list_bins(&self, access_token: &str) -> Result<Vec<Bin>, ApiError> {
        let response = self
            .client
            .get(self.url("/bins"))
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        let data = response
            .json::<BinsWire>()
            .await
            .map_err(|e| ApiError::Parse(e.to_string()))?;
        Ok(data.bins)
    }

    async fn critical_bins(&self, access_token: &str) -> Result<Vec<Bin>, ApiError> {
        let response = self
            .client
            .get(self.url("/bins/critical"))
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        let data = response
            .json::<BinsWire>()
            .await
            .map_err(|e| ApiError::Parse(e.to_string()))?;
        Ok(data.bins)
    }

    async fn list_routes(&self, access_token: &str) -> Result<Vec<Route>, ApiError> {
        let response = self
            .client
            .get(self.url("/routes/history"))
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        let data = response
            .json::<RoutesWire>()
            .await
            .map_err(|e| ApiError::Parse(e.to_string()))?;
        Ok(data.routes)
    }

    async fn driver_active_route(
        &self,
        access_token: &str,
        driver_id: &str,
    ) -> Result<Option<Route>, ApiError> {
        let url = self.url(&format!("/routes/driver/{}/active", driver_id));

        let response = self
            .client
            .get(&url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        // No assignment is a display state, not a failure.
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        let data = response
            .json::<ActiveRouteWire>()
            .await
            .map_err(|e| ApiError::Parse(e.to_string()))?;
        Ok(data.route)
    }

    async fn list_drivers(&self, access_token: &str) -> Result<Vec<Driver>, ApiError> {
        let response = self
            .client
            .get(self.url("/users/drivers"))
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        let data = response
            .json::<DriversWire>()
            .await
            .map_err(|e| ApiError::Parse(e.to_string()))?;
        Ok(data.drivers)
    }

    async fn get_settings(&self, access_token: &str) -> Result<SystemSettings, ApiError> {
        let response = self
            .client
            .get(self.url("/settings"))
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        response
            .json::<SystemSettings>()
            .await
            .map_err(|e| ApiError::Parse(e.to_string()))
    }

    async fn update_settings(
        &self,
        access_token: &str,
        settings: &SystemSettings,
    ) -> Result<(), ApiError> {
        let response = self
            .client
            .put(self.url("/settings"))
            .bearer_auth(access_token)
            .json(settings)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }
        Ok(())
    }
}

// Request/Response wire types

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// User object as the backend emits it, under either key convention.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireUser {
    #[serde(alias = "_id")]
    id: String,
    name: String,
    email: String,
    role: Role,
    #[serde(default)]
    driver_id: Option<String>,
}

impl From<WireUser> for UserProfile {
    fn from(u: WireUser) -> Self {
        UserProfile {
            id: u.id,
            name: u.name,
            email: u.email,
            role: u.role,
            driver_id: u.driver_id,
        }
    }
}

#[derive(Deserialize)]
struct LoginWire {
    token: String,
    user: WireUser,
    data: LoginWireData,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginWireData {
    refresh_token: String,
}

#[derive(Deserialize)]
struct RefreshWire {
    data: RefreshWireData,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshWireData {
    access_token: String,
}

#[derive(Deserialize)]
struct MeWire {
    data: MeWireData,
}

#[derive(Deserialize)]
struct MeWireData {
    user: WireUser,
}

#[derive(Deserialize)]
struct BinsWire {
    #[serde(default)]
    bins: Vec<Bin>,
}

#[derive(Deserialize)]
struct RoutesWire {
    #[serde(default)]
    routes: Vec<Route>,
}

#[derive(Deserialize)]
struct ActiveRouteWire {
    route: Option<Route>,
}

#[derive(Deserialize)]
struct DriversWire {
    #[serde(default)]
    drivers: Vec<Driver>,
}

#[derive(Default, Deserialize)]
struct ErrorBody {
    message: Option<String>,
    error: Option<String>,
}
