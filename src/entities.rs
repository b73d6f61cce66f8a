//! Entity Synchronization Module
//!
//! Keeps the in-memory bin and route collections consistent across two
//! independent update sources: pull snapshots fetched through the API
//! gateway and push events delivered over the push channel. Ordering is
//! decided solely by entity revision, never by which path ran last.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::ApiError;
use crate::channel::{
    ChannelStatus, PushMessage, PushTransport, EVENT_BIN_UPDATE, EVENT_ROUTE_UPDATE,
};
use crate::config::CoreConfig;
use crate::gateway::ApiGateway;
use crate::models::{Bin, Route};

/// Change notification carrying the updated snapshot.
#[derive(Debug, Clone)]
pub enum ChangeNotice {
    Bin(Bin),
    Route(Route),
}

type Subscriber = Arc<dyn Fn(&ChangeNotice) + Send + Sync>;

struct SyncInner {
    bins: HashMap<String, Bin>,
    routes: HashMap<String, Route>,
    subscribers: HashMap<u64, Subscriber>,
    next_subscriber: u64,
    channel_task: Option<JoinHandle<()>>,
}

impl SyncInner {
    fn new() -> Self {
        Self {
            bins: HashMap::new(),
            routes: HashMap::new(),
            subscribers: HashMap::new(),
            next_subscriber: 0,
            channel_task: None,
        }
    }

    /// Apply a bin observation unless it is older than the cached one.
    /// Observations without a revision marker apply unconditionally.
    fn apply_bin(&mut self, incoming: Bin) -> Option<ChangeNotice> {
        if let Some(existing) = self.bins.get(&incoming.bin_id) {
            match (existing.updated_at, incoming.updated_at) {
                (Some(current), Some(new)) if new < current => {
                    debug!("Dropping stale update for bin {}", incoming.bin_id);
                    return None;
                }
                (Some(_), None) => {
                    debug!(
                        "Update for bin {} carries no revision marker, applying unconditionally",
                        incoming.bin_id
                    );
                }
                _ => {}
            }
        }
        let notice = ChangeNotice::Bin(incoming.clone());
        self.bins.insert(incoming.bin_id.clone(), incoming);
        Some(notice)
    }

    /// Same revision rule for routes, keyed on their backend id.
    fn apply_route(&mut self, incoming: Route) -> Option<ChangeNotice> {
        if let Some(existing) = self.routes.get(&incoming.id) {
            match (existing.created_at, incoming.created_at) {
                (Some(current), Some(new)) if new < current => {
                    debug!("Dropping stale update for route {}", incoming.id);
                    return None;
                }
                (Some(_), None) => {
                    debug!(
                        "Update for route {} carries no revision marker, applying unconditionally",
                        incoming.id
                    );
                }
                _ => {}
            }
        }
        let notice = ChangeNotice::Route(incoming.clone());
        self.routes.insert(incoming.id.clone(), incoming);
        Some(notice)
    }
}

/// Maintains the entity cache and the push channel feeding it.
///
/// The channel connects when the first subscriber arrives, reconnects
/// with exponential backoff after drops, and is torn down when the last
/// subscriber leaves. Missed events are never replayed, so every
/// (re)connect triggers a fresh snapshot pull to reconcile the cache.
pub struct EntitySynchronizer {
    gateway: Arc<ApiGateway>,
    transport: Arc<dyn PushTransport>,
    reconnect_initial: Duration,
    reconnect_max: Duration,
    inner: Mutex<SyncInner>,
    status_tx: watch::Sender<ChannelStatus>,
    // handle to ourselves for the channel task, set by new_cyclic
    weak_self: Weak<EntitySynchronizer>,
}

impl EntitySynchronizer {
    pub fn new(
        gateway: Arc<ApiGateway>,
        transport: Arc<dyn PushTransport>,
        cfg: &CoreConfig,
    ) -> Arc<Self> {
        let (status_tx, _) = watch::channel(ChannelStatus::Disconnected);
        Arc::new_cyclic(|weak_self| Self {
            gateway,
            transport,
            reconnect_initial: cfg.reconnect_initial,
            reconnect_max: cfg.reconnect_max,
            inner: Mutex::new(SyncInner::new()),
            status_tx,
            weak_self: weak_self.clone(),
        })
    }

    /// Latest known snapshot of every bin.
    pub fn bins(&self) -> Vec<Bin> {
        self.inner.lock().unwrap().bins.values().cloned().collect()
    }

    /// Latest known snapshot of one bin.
    pub fn bin(&self, bin_id: &str) -> Option<Bin> {
        self.inner.lock().unwrap().bins.get(bin_id).cloned()
    }

    /// Latest known snapshot of every route.
    pub fn routes(&self) -> Vec<Route> {
        self.inner
            .lock()
            .unwrap()
            .routes
            .values()
            .cloned()
            .collect()
    }

    /// Latest known snapshot of one route.
    pub fn route(&self, route_id: &str) -> Option<Route> {
        self.inner.lock().unwrap().routes.get(route_id).cloned()
    }

    /// Current push channel status (best-effort reconnect indicator).
    pub fn status(&self) -> ChannelStatus {
        *self.status_tx.borrow()
    }

    /// Watch push channel status transitions.
    pub fn subscribe_status(&self) -> watch::Receiver<ChannelStatus> {
        self.status_tx.subscribe()
    }

    /// Register for change notifications. The first subscriber brings
    /// the push channel up.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ChangeNotice) + Send + Sync + 'static,
    {
        let id = {
            let mut inner = self.inner.lock().unwrap();
            let id = inner.next_subscriber;
            inner.next_subscriber += 1;
            inner.subscribers.insert(id, Arc::new(callback));
            if inner.channel_task.is_none() {
                inner.channel_task = Some(self.spawn_channel());
            }
            id
        };
        Subscription {
            id,
            sync: self.weak_self.clone(),
        }
    }

    /// Pull fresh snapshots of both collections and merge them under the
    /// revision rule. Push-supplied states newer than the snapshot are
    /// kept.
    pub async fn refresh_snapshots(&self) -> Result<(), ApiError> {
        let bins = self.gateway.list_bins().await?;
        let routes = self.gateway.list_routes().await?;

        let mut notices = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            for bin in bins {
                notices.extend(inner.apply_bin(bin));
            }
            for route in routes {
                notices.extend(inner.apply_route(route));
            }
        }
        debug!("Snapshot pull applied, {} entities changed", notices.len());
        self.dispatch(notices);
        Ok(())
    }

    /// Merge one push event. A malformed or stale event is dropped with
    /// the cache left unchanged; it never fails the synchronizer.
    fn handle_message(&self, msg: PushMessage) {
        let notice = match msg.event.as_str() {
            EVENT_BIN_UPDATE => match serde_json::from_value::<Bin>(msg.payload) {
                Ok(bin) => self.inner.lock().unwrap().apply_bin(bin),
                Err(e) => {
                    warn!("Dropping malformed bin event: {}", e);
                    None
                }
            },
            EVENT_ROUTE_UPDATE => match serde_json::from_value::<Route>(msg.payload) {
                Ok(route) => self.inner.lock().unwrap().apply_route(route),
                Err(e) => {
                    warn!("Dropping malformed route event: {}", e);
                    None
                }
            },
            other => {
                debug!("Ignoring unknown push event: {}", other);
                None
            }
        };
        if let Some(notice) = notice {
            self.dispatch(vec![notice]);
        }
    }

    /// Synchronous fan-out to all current subscribers. Callbacks run
    /// outside the cache lock.
    fn dispatch(&self, notices: Vec<ChangeNotice>) {
        if notices.is_empty() {
            return;
        }
        let subscribers: Vec<Subscriber> = self
            .inner
            .lock()
            .unwrap()
            .subscribers
            .values()
            .cloned()
            .collect();
        for notice in &notices {
            for subscriber in &subscribers {
                subscriber(notice);
            }
        }
    }

    fn remove_subscriber(&self, id: u64) {
        let task = {
            let mut inner = self.inner.lock().unwrap();
            inner.subscribers.remove(&id);
            if inner.subscribers.is_empty() {
                inner.channel_task.take()
            } else {
                None
            }
        };
        if let Some(task) = task {
            debug!("Last subscriber left; stopping push channel");
            task.abort();
            self.status_tx.send_replace(ChannelStatus::Disconnected);
        }
    }

    fn spawn_channel(&self) -> JoinHandle<()> {
        let weak = self.weak_self.clone();
        let initial = self.reconnect_initial;
        let max = self.reconnect_max;

        tokio::spawn(async move {
            let mut backoff = initial;
            loop {
                let Some(sync) = weak.upgrade() else { return };
                let transport = sync.transport.clone();
                drop(sync);

                match transport.connect().await {
                    Ok(mut conn) => {
                        backoff = initial;
                        let Some(sync) = weak.upgrade() else { return };
                        info!("Push channel connected");
                        sync.status_tx.send_replace(ChannelStatus::Connected);
                        // Missed events are not replayed; reconcile with
                        // a fresh snapshot on every (re)connect.
                        if let Err(e) = sync.refresh_snapshots().await {
                            warn!("Post-connect snapshot pull failed: {}", e);
                        }
                        drop(sync);

                        while let Some(msg) = conn.next_event().await {
                            let Some(sync) = weak.upgrade() else { return };
                            sync.handle_message(msg);
                        }

                        if let Some(sync) = weak.upgrade() {
                            warn!("Push channel disconnected");
                            sync.status_tx.send_replace(ChannelStatus::Disconnected);
                        }
                    }
                    Err(e) => {
                        warn!("Push channel connect failed: {}", e);
                    }
                }

                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(max);
            }
        })
    }
}

impl Drop for EntitySynchronizer {
    fn drop(&mut self) {
        if let Some(task) = self.inner.lock().unwrap().channel_task.take() {
            task.abort();
        }
    }
}

/// Handle returned by `subscribe`. Unsubscribing is idempotent and also
/// happens on drop.
pub struct Subscription {
    id: u64,
    sync: Weak<EntitySynchronizer>,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if let Some(sync) = self.sync.upgrade() {
            sync.remove_subscriber(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
