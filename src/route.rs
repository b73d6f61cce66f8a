//! Route Progress Module
//!
//! Tracks a driver's position within their assigned route. The stop
//! sequence is fixed for the tracker's lifetime; per-stop display data
//! is read live from the entity cache so fill levels stay current.

use std::sync::Arc;

use tracing::info;

use crate::api::ApiError;
use crate::entities::EntitySynchronizer;
use crate::gateway::ApiGateway;
use crate::models::{Bin, Route, RouteStop};

/// Result of an `advance` call. Reaching the end of the route is a
/// terminal signal, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    Advanced(usize),
    RouteComplete,
}

/// The current stop plus its live state from the entity cache.
#[derive(Debug, Clone)]
pub struct StopView {
    pub index: usize,
    pub total: usize,
    pub stop: RouteStop,
    /// Latest synchronized snapshot of the stop's bin, when known.
    pub live: Option<Bin>,
}

/// Cursor over an assigned route. The cursor only moves forward, one
/// stop per human action, and never past the last stop.
pub struct RouteProgressTracker {
    assignment: Route,
    cursor: usize,
    entities: Arc<EntitySynchronizer>,
}

impl RouteProgressTracker {
    /// Fetch the driver's active assignment and build a tracker for it.
    ///
    /// `None` means no active route — a display state, not a failure.
    /// Re-fetch policy is the caller's; the tracker never reloads.
    pub async fn load(
        gateway: &ApiGateway,
        entities: Arc<EntitySynchronizer>,
        driver_id: &str,
    ) -> Result<Option<Self>, ApiError> {
        let Some(route) = gateway.driver_active_route(driver_id).await? else {
            info!("No active route assigned for driver {}", driver_id);
            return Ok(None);
        };
        Ok(Self::from_assignment(route, entities))
    }

    /// Build a tracker from an already-fetched assignment. An assignment
    /// with no stops counts as no active route.
    pub fn from_assignment(assignment: Route, entities: Arc<EntitySynchronizer>) -> Option<Self> {
        if assignment.bins.is_empty() {
            info!("Route {} has no stops", assignment.id);
            return None;
        }
        Some(Self {
            assignment,
            cursor: 0,
            entities,
        })
    }

    pub fn assignment(&self) -> &Route {
        &self.assignment
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// The stop the cursor points at, with live bin state.
    pub fn current_stop(&self) -> StopView {
        // from_assignment guarantees at least one stop
        let stop = &self.assignment.bins[self.cursor];
        StopView {
            index: self.cursor,
            total: self.assignment.bins.len(),
            stop: stop.clone(),
            live: self.entities.bin(&stop.bin_id),
        }
    }

    /// Move to the next stop. At the last stop this is a no-op reported
    /// as `RouteComplete`.
    pub fn advance(&mut self) -> AdvanceOutcome {
        let last = self.assignment.bins.len() - 1;
        if self.cursor >= last {
            AdvanceOutcome::RouteComplete
        } else {
            self.cursor += 1;
            AdvanceOutcome::Advanced(self.cursor)
        }
    }
}
