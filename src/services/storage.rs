use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{sqlite::SqliteRow, FromRow, Row};
use tracing::{debug, info, warn};

use crate::{
    db::DbPool,
    error::AppError,
    models::{
        checkin::{TripEvent, TripEventKind},
        contact::{Channel, DeliveryTarget, OwnerProfile, SafetyContact, TripAudience},
        notification::{AuditRecord, NotificationLog},
        trip::{Marker, NewTrip, RowGuard, Trip, TripRow, TripStatus},
        user::{EmailContact, User},
    },
    services::repository::{AudienceDirectory, AuditSink, TargetRegistry, TripRepository},
};

/// Legacy per-trip email contacts beyond this are ignored.
pub const MAX_LEGACY_CONTACTS: usize = 3;

const TRIP_COLUMNS: &str = "id, user_id, title, status, start_at, eta_at, grace_minutes, \
     checkin_interval_min, notify_start_hour, notify_end_hour, utc_offset_minutes, \
     contact1, contact2, contact3, last_checkin_at, last_checkin_reminder, last_grace_warning, \
     notified_starting_soon, notified_trip_started, notified_approaching_eta, \
     notified_eta_reached, notified_eta_transition, notified_grace_transition, \
     extended_count, notify_self, checkin_epoch";

#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub async fn load_trip(&self, trip_id: &str) -> Result<Trip, AppError> {
        let sql = format!("SELECT {TRIP_COLUMNS} FROM trips WHERE id = ?");
        let row = sqlx::query_as::<_, TripRow>(&sql)
            .bind(trip_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AppError::NotFound)?;
        Trip::try_from(row)
    }

    /// User pressed "I'm safe". Returns the trip as stored afterwards.
    pub async fn check_in(&self, trip_id: &str, now: DateTime<Utc>) -> Result<Trip, AppError> {
        self.apply_checkin(trip_id, now, None).await
    }

    /// Pushes the ETA out by `minutes` from the later of the current ETA and
    /// `now`; otherwise identical to a check-in.
    pub async fn extend(
        &self,
        trip_id: &str,
        minutes: i64,
        now: DateTime<Utc>,
    ) -> Result<Trip, AppError> {
        if minutes <= 0 {
            return Err(AppError::InvalidAction(format!(
                "extension must be positive, got {minutes}"
            )));
        }
        self.apply_checkin(trip_id, now, Some(minutes)).await
    }

    async fn apply_checkin(
        &self,
        trip_id: &str,
        now: DateTime<Utc>,
        extend_by: Option<i64>,
    ) -> Result<Trip, AppError> {
        let mut tx = self.pool.begin().await?;

        let current: Option<(String, DateTime<Utc>)> =
            sqlx::query_as("SELECT status, eta_at FROM trips WHERE id = ?")
                .bind(trip_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((status, eta_at)) = current else {
            return Err(AppError::NotFound);
        };
        if status == TripStatus::Completed.as_str() {
            return Err(AppError::InvalidAction(format!(
                "trip {trip_id} is already completed"
            )));
        }

        let (new_eta, extended, event) = match extend_by {
            Some(minutes) => {
                let new_eta = eta_at.max(now) + Duration::minutes(minutes);
                let event = TripEvent::new(trip_id, TripEventKind::Extend, now)
                    .with_detail(format!("+{minutes}m, eta {}", new_eta.to_rfc3339()));
                (new_eta, 1, event)
            }
            None => (eta_at, 0, TripEvent::new(trip_id, TripEventKind::Checkin, now)),
        };

        sqlx::query(
            "UPDATE trips SET \
             status = CASE WHEN status = 'scheduled' AND start_at > ? THEN 'scheduled' ELSE 'active' END, \
             eta_at = ?, extended_count = extended_count + ?, \
             last_checkin_at = ?, last_checkin_reminder = ?, last_grace_warning = NULL, \
             notified_eta_transition = 0, notified_grace_transition = 0, \
             checkin_epoch = checkin_epoch + 1 \
             WHERE id = ? AND status <> 'completed'",
        )
        .bind(now)
        .bind(new_eta)
        .bind(extended)
        .bind(now)
        .bind(now)
        .bind(trip_id)
        .execute(&mut *tx)
        .await?;

        insert_event(&mut tx, &event).await?;
        tx.commit().await?;

        info!(trip_id, kind = %event.kind, previous = %status, "trip checked in");
        self.load_trip(trip_id).await
    }

    pub async fn check_out(&self, trip_id: &str, now: DateTime<Utc>) -> Result<Trip, AppError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE trips SET status = 'completed', checkin_epoch = checkin_epoch + 1 \
             WHERE id = ? AND status <> 'completed'",
        )
        .bind(trip_id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return match self.load_trip(trip_id).await {
                Ok(_) => Err(AppError::InvalidAction(format!(
                    "trip {trip_id} is already completed"
                ))),
                Err(err) => Err(err),
            };
        }
        insert_event(
            &mut tx,
            &TripEvent::new(trip_id, TripEventKind::Checkout, now),
        )
        .await?;
        tx.commit().await?;

        info!(trip_id, "trip completed");
        self.load_trip(trip_id).await
    }

    pub async fn trip_events(&self, trip_id: &str) -> Result<Vec<TripEvent>, AppError> {
        let events = sqlx::query_as::<_, TripEvent>(
            "SELECT id, trip_id, kind, at, detail FROM trip_events WHERE trip_id = ? ORDER BY at, id",
        )
        .bind(trip_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    pub async fn notification_logs(
        &self,
        trip_id: &str,
    ) -> Result<Vec<NotificationLog>, AppError> {
        let logs = sqlx::query_as::<_, NotificationLog>(
            "SELECT id, user_id, trip_id, channel, title, body, status, error, created_at \
             FROM notification_logs WHERE trip_id = ? ORDER BY id",
        )
        .bind(trip_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(logs)
    }

    // Seeding helpers. Production rows are written by the CRUD service; these
    // exist for fixtures and local tooling.

    pub async fn insert_user(&self, user: &User) -> Result<(), AppError> {
        sqlx::query("INSERT INTO users (id, display_name, email, created_at) VALUES (?, ?, ?, ?)")
            .bind(&user.id)
            .bind(&user.display_name)
            .bind(&user.email)
            .bind(user.created_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn register_device(
        &self,
        user_id: &str,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO devices (user_id, token, created_at) VALUES (?, ?, ?) \
             ON CONFLICT(token) DO UPDATE SET user_id = excluded.user_id",
        )
        .bind(user_id)
        .bind(token)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn device_tokens(&self, user_id: &str) -> Result<Vec<String>, AppError> {
        let tokens =
            sqlx::query_scalar::<_, String>("SELECT token FROM devices WHERE user_id = ? ORDER BY id")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(tokens)
    }

    pub async fn insert_contact(
        &self,
        user_id: &str,
        name: &str,
        email: &str,
    ) -> Result<i64, AppError> {
        let id = sqlx::query("INSERT INTO contacts (user_id, name, email) VALUES (?, ?, ?)")
            .bind(user_id)
            .bind(name)
            .bind(email)
            .execute(&self.pool)
            .await?
            .last_insert_rowid();
        Ok(id)
    }

    pub async fn insert_trip(&self, new: &NewTrip, now: DateTime<Utc>) -> Result<Trip, AppError> {
        let contact = |index: usize| new.contact_ids.get(index).copied();
        let status = new.initial_status(now);
        sqlx::query(
            "INSERT INTO trips (id, user_id, title, status, start_at, eta_at, grace_minutes, \
             checkin_interval_min, notify_start_hour, notify_end_hour, utc_offset_minutes, \
             contact1, contact2, contact3, notify_self, notified_trip_started, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&new.id)
        .bind(&new.user_id)
        .bind(&new.title)
        .bind(status.as_str())
        .bind(new.start_at)
        .bind(new.eta_at)
        .bind(new.grace_minutes)
        .bind(new.checkin_interval_min)
        .bind(new.notify_start_hour.map(i64::from))
        .bind(new.notify_end_hour.map(i64::from))
        .bind(i64::from(new.utc_offset_minutes))
        .bind(contact(0))
        .bind(contact(1))
        .bind(contact(2))
        .bind(new.notify_self)
        // A trip that is already under way when created is never announced.
        .bind(status == TripStatus::Active)
        .bind(now)
        .execute(&self.pool)
        .await?;
        self.load_trip(&new.id).await
    }

    pub async fn add_friend_contact(
        &self,
        trip_id: &str,
        friend_user_id: &str,
    ) -> Result<(), AppError> {
        sqlx::query("INSERT OR IGNORE INTO friendships (trip_id, friend_user_id) VALUES (?, ?)")
            .bind(trip_id)
            .bind(friend_user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_live_activity_token(
        &self,
        trip_id: &str,
        user_id: &str,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO live_activity_tokens (trip_id, user_id, token, updated_at) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(trip_id) DO UPDATE SET token = excluded.token, updated_at = excluded.updated_at",
        )
        .bind(trip_id)
        .bind(user_id)
        .bind(token)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn live_activity_token(&self, trip_id: &str) -> Result<Option<String>, AppError> {
        let token =
            sqlx::query_scalar::<_, String>("SELECT token FROM live_activity_tokens WHERE trip_id = ?")
                .bind(trip_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(token)
    }

    async fn load_user(&self, user_id: &str) -> Result<User, AppError> {
        sqlx::query_as::<_, User>(
            "SELECT id, display_name, email, created_at FROM users WHERE id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::NotFound)
    }
}

async fn insert_event(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    event: &TripEvent,
) -> Result<(), AppError> {
    sqlx::query("INSERT INTO trip_events (id, trip_id, kind, at, detail) VALUES (?, ?, ?, ?, ?)")
        .bind(&event.id)
        .bind(&event.trip_id)
        .bind(&event.kind)
        .bind(event.at)
        .bind(&event.detail)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

fn decode_trip(row: &SqliteRow) -> Result<Trip, AppError> {
    let id: String = row.try_get("id").unwrap_or_default();
    let raw = TripRow::from_row(row).map_err(|err| AppError::malformed(&id, err.to_string()))?;
    Trip::try_from(raw)
}

#[async_trait]
impl TripRepository for SqliteStore {
    async fn list_due_trips(
        &self,
        horizon: DateTime<Utc>,
    ) -> Result<Vec<Result<Trip, AppError>>, AppError> {
        let sql = format!(
            "SELECT {TRIP_COLUMNS} FROM trips WHERE status <> 'completed' AND start_at <= ? \
             ORDER BY start_at"
        );
        let rows = sqlx::query(&sql)
            .bind(horizon)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(decode_trip).collect())
    }

    async fn fetch_trip(&self, trip_id: &str) -> Result<Trip, AppError> {
        self.load_trip(trip_id).await
    }

    async fn compare_and_set_status(
        &self,
        trip_id: &str,
        expected: RowGuard,
        new_status: TripStatus,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE trips SET status = ? WHERE id = ? AND status = ? AND checkin_epoch = ?",
        )
        .bind(new_status.as_str())
        .bind(trip_id)
        .bind(expected.status.as_str())
        .bind(expected.epoch)
        .execute(&self.pool)
        .await?;
        let applied = result.rows_affected() == 1;
        debug!(trip_id, from = %expected.status, to = %new_status, applied, "status commit");
        Ok(applied)
    }

    async fn set_marker(
        &self,
        trip_id: &str,
        marker: Marker,
        expected: RowGuard,
        at: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        // The owner-facing ETA alert doubles as the grace warning.
        let stamp = if marker == Marker::EtaReached {
            ", last_grace_warning = COALESCE(last_grace_warning, ?)"
        } else {
            ""
        };
        let sql = format!(
            "UPDATE trips SET {column} = 1{stamp} \
             WHERE id = ? AND checkin_epoch = ? AND status <> 'completed'",
            column = marker.column(),
        );
        let mut query = sqlx::query(&sql);
        if marker == Marker::EtaReached {
            query = query.bind(at);
        }
        let result = query
            .bind(trip_id)
            .bind(expected.epoch)
            .execute(&self.pool)
            .await?;
        let applied = result.rows_affected() == 1;
        debug!(trip_id, %marker, applied, "marker commit");
        Ok(applied)
    }

    async fn stamp_reminder(
        &self,
        trip_id: &str,
        at: DateTime<Utc>,
        expected: RowGuard,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE trips SET last_checkin_reminder = ? \
             WHERE id = ? AND checkin_epoch = ? AND status IN ('active', 'overdue')",
        )
        .bind(at)
        .bind(trip_id)
        .bind(expected.epoch)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl AudienceDirectory for SqliteStore {
    async fn load_audience(&self, trip: &Trip) -> Result<TripAudience, AppError> {
        let owner = self.load_user(&trip.user_id).await?;
        let owner = OwnerProfile {
            device_tokens: self.device_tokens(&owner.id).await?,
            live_activity_token: self.live_activity_token(&trip.id).await?,
            user_id: owner.id,
            display_name: owner.display_name,
            email: owner.email,
        };

        let mut contacts = Vec::new();
        for contact_id in trip.contact_ids.iter().take(MAX_LEGACY_CONTACTS) {
            let found = sqlx::query_as::<_, EmailContact>(
                "SELECT id, user_id, name, email FROM contacts WHERE id = ?",
            )
            .bind(contact_id)
            .fetch_optional(&self.pool)
            .await?;
            match found {
                Some(contact) => contacts.push(SafetyContact::Email {
                    id: contact.id,
                    name: contact.name,
                    email: contact.email,
                }),
                None => warn!(trip_id = %trip.id, contact_id, "trip references a missing contact"),
            }
        }

        let friends = sqlx::query_as::<_, User>(
            "SELECT u.id, u.display_name, u.email, u.created_at FROM friendships f \
             JOIN users u ON u.id = f.friend_user_id WHERE f.trip_id = ? ORDER BY u.id",
        )
        .bind(&trip.id)
        .fetch_all(&self.pool)
        .await?;
        for friend in friends {
            contacts.push(SafetyContact::Friend {
                device_tokens: self.device_tokens(&friend.id).await?,
                user_id: friend.id,
                display_name: friend.display_name,
                email: friend.email,
            });
        }

        Ok(TripAudience { owner, contacts })
    }
}

#[async_trait]
impl TargetRegistry for SqliteStore {
    async fn deregister(&self, target: &DeliveryTarget) -> Result<(), AppError> {
        let sql = match target.channel {
            Channel::Push => "DELETE FROM devices WHERE token = ?",
            Channel::LiveActivity => "DELETE FROM live_activity_tokens WHERE token = ?",
            Channel::Email => {
                debug!(label = %target.label, "email contacts are not owned here; nothing to deregister");
                return Ok(());
            }
        };
        let removed = sqlx::query(sql)
            .bind(&target.address)
            .execute(&self.pool)
            .await?
            .rows_affected();
        info!(channel = %target.channel, label = %target.label, removed, "deregistered delivery target");
        Ok(())
    }
}

#[async_trait]
impl AuditSink for SqliteStore {
    async fn record(&self, entry: &AuditRecord) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO notification_logs (user_id, trip_id, channel, title, body, status, error, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.user_id)
        .bind(&entry.trip_id)
        .bind(entry.channel.as_str())
        .bind(&entry.title)
        .bind(&entry.body)
        .bind(entry.status.as_str())
        .bind(&entry.error)
        .bind(entry.at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
