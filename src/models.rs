//! Data Models Module
//!
//! Shared entity types mirroring the backend wire format.

use serde::{Deserialize, Serialize};

/// Account role. The backend emits lowercase variants on login but
/// expects the uppercase form everywhere else, so both deserialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    #[serde(alias = "admin")]
    Admin,
    #[serde(alias = "driver")]
    Driver,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Admin => write!(f, "ADMIN"),
            Role::Driver => write!(f, "DRIVER"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ADMIN" => Ok(Role::Admin),
            "DRIVER" => Ok(Role::Driver),
            _ => Err(()),
        }
    }
}

/// A geographic coordinate pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

/// Fill status reported by the bin's sensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BinStatus {
    Critical,
    Normal,
}

/// A waste collection bin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bin {
    #[serde(rename = "_id")]
    pub id: String,
    pub bin_id: String,
    pub current_fill: f64,
    pub gas_level: f64,
    pub status: BinStatus,
    pub location: GeoPoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_waste_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waste_confidence: Option<f64>,
    pub is_active: bool,
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// One scheduled collection point within a route.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteStop {
    pub bin_id: String,
    pub location: GeoPoint,
}

/// An optimized collection route produced by the backend.
///
/// Routes are regenerated wholesale rather than edited in place, so
/// `created_at` doubles as their revision marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    #[serde(rename = "_id")]
    pub id: String,
    pub bins: Vec<RouteStop>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<Vec<[f64; 2]>>,
    pub distance: f64,
    pub duration: f64,
    pub driver_id: String,
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// A driver account as listed for the admin console.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Driver {
    #[serde(rename = "_id")]
    pub id: String,
    pub driver_id: String,
    pub name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truck_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_location: Option<GeoPoint>,
    pub is_active: bool,
}

/// The authenticated account's profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub name: String,
    pub email: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<String>,
}

/// System-wide thresholds and automation switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSettings {
    pub pre_alert_threshold: f64,
    pub critical_threshold: f64,
    pub auto_route_generation: bool,
    pub max_bins_per_route: u32,
    pub refresh_interval_minutes: u32,
}
