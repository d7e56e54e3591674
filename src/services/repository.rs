//! Contracts between the monitor and the stores it reads and writes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    error::AppError,
    models::{
        contact::{DeliveryTarget, TripAudience},
        notification::AuditRecord,
        trip::{Marker, RowGuard, Trip, TripStatus},
    },
};

#[async_trait]
pub trait TripRepository: Send + Sync {
    /// Every non-completed trip with `start_at <= horizon`. Rows are decoded
    /// one by one; a malformed row comes back as its own `Err`.
    async fn list_due_trips(
        &self,
        horizon: DateTime<Utc>,
    ) -> Result<Vec<Result<Trip, AppError>>, AppError>;

    /// The row as stored right now.
    async fn fetch_trip(&self, trip_id: &str) -> Result<Trip, AppError>;

    /// Moves the trip to `new_status` only if it is still exactly at
    /// `expected.status` within the same check-in epoch.
    async fn compare_and_set_status(
        &self,
        trip_id: &str,
        expected: RowGuard,
        new_status: TripStatus,
    ) -> Result<bool, AppError>;

    /// Sets a marker unless a check-in or check-out happened since `expected`
    /// was read.
    async fn set_marker(
        &self,
        trip_id: &str,
        marker: Marker,
        expected: RowGuard,
        at: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    async fn stamp_reminder(
        &self,
        trip_id: &str,
        at: DateTime<Utc>,
        expected: RowGuard,
    ) -> Result<bool, AppError>;
}

#[async_trait]
pub trait AudienceDirectory: Send + Sync {
    async fn load_audience(&self, trip: &Trip) -> Result<TripAudience, AppError>;
}

/// Forgets delivery targets a channel reported as permanently invalid.
#[async_trait]
pub trait TargetRegistry: Send + Sync {
    async fn deregister(&self, target: &DeliveryTarget) -> Result<(), AppError>;
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: &AuditRecord) -> Result<(), AppError>;
}
