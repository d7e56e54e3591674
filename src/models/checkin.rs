use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// User actions that mutate a trip from outside the monitor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TripEventKind {
    Checkin,
    Checkout,
    Extend,
}

impl TripEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TripEventKind::Checkin => "checkin",
            TripEventKind::Checkout => "checkout",
            TripEventKind::Extend => "extend",
        }
    }
}

impl fmt::Display for TripEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TripEvent {
    pub id: String,
    pub trip_id: String,
    pub kind: String,
    pub at: DateTime<Utc>,
    pub detail: Option<String>,
}

impl TripEvent {
    pub fn new(trip_id: impl Into<String>, kind: TripEventKind, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            trip_id: trip_id.into(),
            kind: kind.as_str().to_string(),
            at,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}
