//! EcoRoute Client Core Library
//!
//! Session management and real-time entity synchronization for the
//! EcoRoute fleet console. View layers sit on top of `AppState` and
//! stay free of credential and cache-coherence concerns.

pub mod api;
pub mod channel;
pub mod config;
pub mod entities;
pub mod gateway;
pub mod logging;
pub mod models;
pub mod route;
pub mod session;
pub mod storage;

use std::sync::Arc;

use anyhow::Context;

use api::HttpClient;
use channel::PushTransport;
use config::CoreConfig;
use entities::EntitySynchronizer;
use gateway::ApiGateway;
use session::SessionManager;
use storage::FileStorage;

/// Application state shared across the console.
///
/// Constructed once at context start and passed by reference to
/// dependents. The session manager is the sole writer of durable
/// storage; the synchronizer is the sole writer of the entity cache.
pub struct AppState {
    pub config: CoreConfig,
    pub session: Arc<SessionManager>,
    pub gateway: Arc<ApiGateway>,
    pub entities: Arc<EntitySynchronizer>,
}

impl AppState {
    /// Wire the production stack: reqwest-backed API client, file-backed
    /// storage, and the supplied push transport.
    pub fn new(config: CoreConfig, transport: Arc<dyn PushTransport>) -> anyhow::Result<Self> {
        reqwest::Url::parse(&config.api_base_url)
            .with_context(|| format!("invalid API base URL: {}", config.api_base_url))?;

        let client = Arc::new(HttpClient::new(&config.api_base_url, config.request_timeout));
        let storage = Arc::new(FileStorage::new());
        Ok(Self::with_parts(
            config,
            client.clone(),
            client,
            storage,
            transport,
        ))
    }

    /// Wire an explicit set of collaborators. Used by tests and by
    /// embedders supplying their own transport or storage.
    pub fn with_parts(
        config: CoreConfig,
        auth: Arc<dyn api::AuthApi>,
        snapshots: Arc<dyn api::SnapshotApi>,
        storage: Arc<dyn storage::Storage>,
        transport: Arc<dyn PushTransport>,
    ) -> Self {
        let session = SessionManager::new(auth, storage, &config);
        let gateway = Arc::new(ApiGateway::new(session.clone(), snapshots));
        let entities = EntitySynchronizer::new(gateway.clone(), transport, &config);
        Self {
            config,
            session,
            gateway,
            entities,
        }
    }
}
