use serde::{Deserialize, Serialize};

use crate::geo::GeoPoint;

/// Row of the drivers table, including the stored password hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverRecord {
    pub id: i64,
    pub username: String,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub active: bool,
    pub company_id: Option<i64>,
    pub password: String,
}

/// Authenticated driver as kept in memory and persisted under `driver`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriverProfile {
    pub id: i64,
    pub username: String,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub company_id: Option<i64>,
}

impl From<DriverRecord> for DriverProfile {
    fn from(record: DriverRecord) -> Self {
        Self {
            id: record.id,
            username: record.username,
            name: record.name,
            phone: record.phone,
            email: record.email,
            company_id: record.company_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DriverSession {
    pub profile: DriverProfile,
    pub online: bool,
    pub location: Option<GeoPoint>,
    /// Fix the current order list was last filtered against.
    pub filtered_at: Option<GeoPoint>,
}

impl DriverSession {
    pub fn new(profile: DriverProfile, online: bool) -> Self {
        Self {
            profile,
            online,
            location: None,
            filtered_at: None,
        }
    }
}
