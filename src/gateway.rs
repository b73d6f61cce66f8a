//! API Gateway Module
//!
//! Front door for authorized backend calls. Obtains a token via the
//! session manager before every call; on a rejected token it forces
//! exactly one refresh and retry. A second rejection kills the session
//! and surfaces `Unauthorized`. Network failures are surfaced untouched;
//! retry policy for those belongs to the caller.

use std::future::Future;
use std::sync::Arc;

use tracing::debug;

use crate::api::{ApiError, SnapshotApi};
use crate::models::{Bin, Driver, Route, SystemSettings};
use crate::session::SessionManager;

pub struct ApiGateway {
    session: Arc<SessionManager>,
    api: Arc<dyn SnapshotApi>,
}

impl ApiGateway {
    pub fn new(session: Arc<SessionManager>, api: Arc<dyn SnapshotApi>) -> Self {
        Self { session, api }
    }

    /// Run `call` with a valid token, retrying once after a forced
    /// refresh if the backend rejects it.
    async fn authorized<T, Fut, F>(&self, call: F) -> Result<T, ApiError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let token = self.session.ensure_valid().await?;
        match call(token).await {
            Err(ApiError::Unauthorized) => {
                debug!("Token rejected, forcing refresh and retrying once");
                let token = self.session.refresh().await?;
                match call(token).await {
                    Err(ApiError::Unauthorized) => {
                        self.session.invalidate();
                        Err(ApiError::Unauthorized)
                    }
                    other => other,
                }
            }
            other => other,
        }
    }

    pub async fn list_bins(&self) -> Result<Vec<Bin>, ApiError> {
        self.authorized(|token| async move { self.api.list_bins(&token).await })
            .await
    }

    pub async fn critical_bins(&self) -> Result<Vec<Bin>, ApiError> {
        self.authorized(|token| async move { self.api.critical_bins(&token).await })
            .await
    }

    pub async fn list_routes(&self) -> Result<Vec<Route>, ApiError> {
        self.authorized(|token| async move { self.api.list_routes(&token).await })
            .await
    }

    pub async fn driver_active_route(&self, driver_id: &str) -> Result<Option<Route>, ApiError> {
        self.authorized(|token| async move {
            self.api.driver_active_route(&token, driver_id).await
        })
        .await
    }

    pub async fn list_drivers(&self) -> Result<Vec<Driver>, ApiError> {
        self.authorized(|token| async move { self.api.list_drivers(&token).await })
            .await
    }

    pub async fn get_settings(&self) -> Result<SystemSettings, ApiError> {
        self.authorized(|token| async move { self.api.get_settings(&token).await })
            .await
    }

    pub async fn update_settings(&self, settings: &SystemSettings) -> Result<(), ApiError> {
        self.authorized(|token| async move { self.api.update_settings(&token, settings).await })
            .await
    }
}
