//! Shared test doubles: in-memory storage, scriptable backend fakes,
//! and a scripted push transport.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use ecoroute_client::api::{ApiError, AuthApi, LoginOutcome, SnapshotApi};
use ecoroute_client::channel::{PushConnection, PushMessage, PushTransport, TransportError};
use ecoroute_client::config::CoreConfig;
use ecoroute_client::models::{
    Bin, BinStatus, Driver, GeoPoint, Role, Route, RouteStop, SystemSettings, UserProfile,
};
use ecoroute_client::storage::{Storage, StorageError};

/// Config tuned for tests: tight reconnect backoff, normal token policy.
pub fn test_config() -> CoreConfig {
    CoreConfig {
        reconnect_initial: Duration::from_millis(10),
        reconnect_max: Duration::from_millis(50),
        ..CoreConfig::default()
    }
}

pub fn ts(secs: i64) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_timestamp(secs, 0).unwrap()
}

pub fn profile(role: Role, driver_id: Option<&str>) -> UserProfile {
    UserProfile {
        id: "user-1".to_string(),
        name: "Test User".to_string(),
        email: "user@example.com".to_string(),
        role,
        driver_id: driver_id.map(str::to_string),
    }
}

pub fn bin(bin_id: &str, fill: f64, updated_at: Option<chrono::DateTime<chrono::Utc>>) -> Bin {
    Bin {
        id: format!("oid-{}", bin_id),
        bin_id: bin_id.to_string(),
        current_fill: fill,
        gas_level: 0.0,
        status: BinStatus::Normal,
        location: GeoPoint {
            lat: 48.85,
            lng: 2.35,
        },
        last_waste_type: None,
        waste_confidence: None,
        is_active: true,
        updated_at,
        created_at: updated_at,
    }
}

pub fn route_with_stops(id: &str, stops: &[&str]) -> Route {
    Route {
        id: id.to_string(),
        bins: stops
            .iter()
            .map(|bin_id| RouteStop {
                bin_id: bin_id.to_string(),
                location: GeoPoint {
                    lat: 48.85,
                    lng: 2.35,
                },
            })
            .collect(),
        geometry: None,
        distance: 1000.0,
        duration: 600.0,
        driver_id: "DRV-1".to_string(),
        created_at: Some(ts(1)),
    }
}

/// Poll `cond` until it holds or a 2 s deadline expires.
pub async fn wait_until<F: Fn() -> bool>(cond: F, what: &str) {
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        if std::time::Instant::now() > deadline {
            panic!("timeout waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// In-memory durable storage

#[derive(Default)]
pub struct MemoryStorage {
    data: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.data.lock().unwrap().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.data
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.data.lock().unwrap().remove(key);
        Ok(())
    }
}

// Scriptable auth backend

pub struct FakeAuth {
    pub user: UserProfile,
    pub login_ok: AtomicBool,
    pub me_ok: AtomicBool,
    pub refresh_ok: AtomicBool,
    pub logout_ok: AtomicBool,
    pub login_calls: AtomicUsize,
    pub me_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    /// Artificial latency inside `refresh`, for overlap tests.
    pub refresh_delay: Duration,
    /// When `gated` is set, each refresh consumes one semaphore permit;
    /// the test releases callers via `gate.add_permits`.
    pub gated: AtomicBool,
    pub gate: tokio::sync::Semaphore,
}

impl FakeAuth {
    pub fn new(user: UserProfile) -> Arc<Self> {
        Arc::new(Self {
            user,
            login_ok: AtomicBool::new(true),
            me_ok: AtomicBool::new(true),
            refresh_ok: AtomicBool::new(true),
            logout_ok: AtomicBool::new(true),
            login_calls: AtomicUsize::new(0),
            me_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            refresh_delay: Duration::ZERO,
            gated: AtomicBool::new(false),
            gate: tokio::sync::Semaphore::new(0),
        })
    }

    pub fn with_refresh_delay(user: UserProfile, delay: Duration) -> Arc<Self> {
        let mut fake = Self {
            user,
            login_ok: AtomicBool::new(true),
            me_ok: AtomicBool::new(true),
            refresh_ok: AtomicBool::new(true),
            logout_ok: AtomicBool::new(true),
            login_calls: AtomicUsize::new(0),
            me_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            refresh_delay: Duration::ZERO,
            gated: AtomicBool::new(false),
            gate: tokio::sync::Semaphore::new(0),
        };
        fake.refresh_delay = delay;
        Arc::new(fake)
    }
}

#[async_trait]
impl AuthApi for FakeAuth {
    async fn login(&self, _email: &str, _password: &str) -> Result<LoginOutcome, ApiError> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        if !self.login_ok.load(Ordering::SeqCst) {
            return Err(ApiError::InvalidCredentials);
        }
        Ok(LoginOutcome {
            access_token: "access-login".to_string(),
            refresh_token: "refresh-login".to_string(),
            user: self.user.clone(),
        })
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<String, ApiError> {
        let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.refresh_delay > Duration::ZERO {
            tokio::time::sleep(self.refresh_delay).await;
        }
        if self.gated.load(Ordering::SeqCst) {
            match self.gate.acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => {}
            }
        }
        if !self.refresh_ok.load(Ordering::SeqCst) {
            return Err(ApiError::Unauthorized);
        }
        Ok(format!("access-{}", n))
    }

    async fn logout(&self, _refresh_token: &str) -> Result<(), ApiError> {
        if !self.logout_ok.load(Ordering::SeqCst) {
            return Err(ApiError::Network("connection reset".to_string()));
        }
        Ok(())
    }

    async fn me(&self, _access_token: &str) -> Result<UserProfile, ApiError> {
        self.me_calls.fetch_add(1, Ordering::SeqCst);
        if !self.me_ok.load(Ordering::SeqCst) {
            return Err(ApiError::Unauthorized);
        }
        Ok(self.user.clone())
    }
}

// Scriptable snapshot backend

#[derive(Default)]
pub struct FakeSnapshots {
    pub bins: Mutex<Vec<Bin>>,
    pub routes: Mutex<Vec<Route>>,
    pub active_route: Mutex<Option<Route>>,
    pub bin_pulls: AtomicUsize,
    pub route_pulls: AtomicUsize,
    /// Fail this many upcoming calls with `Unauthorized`.
    pub reject_next: AtomicUsize,
    /// Fail this many upcoming calls with `Network`.
    pub fail_network_next: AtomicUsize,
}

impl FakeSnapshots {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn check_failures(&self) -> Result<(), ApiError> {
        if self
            .reject_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ApiError::Unauthorized);
        }
        if self
            .fail_network_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ApiError::Network("timed out".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotApi for FakeSnapshots {
    async fn list_bins(&self, _access_token: &str) -> Result<Vec<Bin>, ApiError> {
        self.bin_pulls.fetch_add(1, Ordering::SeqCst);
        self.check_failures()?;
        Ok(self.bins.lock().unwrap().clone())
    }

    async fn critical_bins(&self, _access_token: &str) -> Result<Vec<Bin>, ApiError> {
        self.check_failures()?;
        Ok(self
            .bins
            .lock()
            .unwrap()
            .iter()
            .filter(|b| b.status == BinStatus::Critical)
            .cloned()
            .collect())
    }

    async fn list_routes(&self, _access_token: &str) -> Result<Vec<Route>, ApiError> {
        self.route_pulls.fetch_add(1, Ordering::SeqCst);
        self.check_failures()?;
        Ok(self.routes.lock().unwrap().clone())
    }

    async fn driver_active_route(
        &self,
        _access_token: &str,
        _driver_id: &str,
    ) -> Result<Option<Route>, ApiError> {
        self.check_failures()?;
        Ok(self.active_route.lock().unwrap().clone())
    }

    async fn list_drivers(&self, _access_token: &str) -> Result<Vec<Driver>, ApiError> {
        self.check_failures()?;
        Ok(Vec::new())
    }

    async fn get_settings(&self, _access_token: &str) -> Result<SystemSettings, ApiError> {
        self.check_failures()?;
        Ok(SystemSettings {
            pre_alert_threshold: 70.0,
            critical_threshold: 85.0,
            auto_route_generation: false,
            max_bins_per_route: 20,
            refresh_interval_minutes: 5,
        })
    }

    async fn update_settings(
        &self,
        _access_token: &str,
        _settings: &SystemSettings,
    ) -> Result<(), ApiError> {
        self.check_failures()?;
        Ok(())
    }
}

// Scripted push transport

pub struct ScriptedTransport {
    queue: tokio::sync::Mutex<mpsc::UnboundedReceiver<ScriptedConnection>>,
    pub connects: AtomicUsize,
}

/// Test-side handle. Each `push_connection` scripts one successful
/// connect and returns the sender feeding that connection's events;
/// dropping the sender closes the connection.
pub struct TransportScript {
    tx: mpsc::UnboundedSender<ScriptedConnection>,
}

impl TransportScript {
    pub fn push_connection(&self) -> mpsc::UnboundedSender<PushMessage> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        self.tx
            .send(ScriptedConnection { events: event_rx })
            .expect("transport dropped");
        event_tx
    }
}

pub fn scripted_transport() -> (TransportScript, Arc<ScriptedTransport>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        TransportScript { tx },
        Arc::new(ScriptedTransport {
            queue: tokio::sync::Mutex::new(rx),
            connects: AtomicUsize::new(0),
        }),
    )
}

pub struct ScriptedConnection {
    events: mpsc::UnboundedReceiver<PushMessage>,
}

#[async_trait]
impl PushTransport for ScriptedTransport {
    async fn connect(&self) -> Result<Box<dyn PushConnection>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        // Parks until the test scripts the next connection.
        match self.queue.lock().await.recv().await {
            Some(conn) => Ok(Box::new(conn)),
            None => Err(TransportError::Connect("script exhausted".to_string())),
        }
    }
}

#[async_trait]
impl PushConnection for ScriptedConnection {
    async fn next_event(&mut self) -> Option<PushMessage> {
        self.events.recv().await
    }
}

pub fn bin_update(bin: &Bin) -> PushMessage {
    PushMessage {
        event: "bin:update".to_string(),
        payload: serde_json::to_value(bin).unwrap(),
    }
}

pub fn route_update(route: &Route) -> PushMessage {
    PushMessage {
        event: "route:update".to_string(),
        payload: serde_json::to_value(route).unwrap(),
    }
}
