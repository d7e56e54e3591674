use std::{fmt, str::FromStr};

use chrono::{DateTime, Duration, FixedOffset, Offset, Timelike, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum TripStatus {
    #[default]
    Scheduled,
    Active,
    Overdue,
    OverdueNotified,
    Completed,
}

impl TripStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TripStatus::Scheduled => "scheduled",
            TripStatus::Active => "active",
            TripStatus::Overdue => "overdue",
            TripStatus::OverdueNotified => "overdue_notified",
            TripStatus::Completed => "completed",
        }
    }

    /// Position in the forward-only lifecycle.
    pub fn rank(&self) -> u8 {
        match self {
            TripStatus::Scheduled => 0,
            TripStatus::Active => 1,
            TripStatus::Overdue => 2,
            TripStatus::OverdueNotified => 3,
            TripStatus::Completed => 4,
        }
    }

    pub fn is_overdue(&self) -> bool {
        matches!(self, TripStatus::Overdue | TripStatus::OverdueNotified)
    }
}

impl fmt::Display for TripStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TripStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "scheduled" => Ok(TripStatus::Scheduled),
            "active" => Ok(TripStatus::Active),
            "overdue" => Ok(TripStatus::Overdue),
            "overdue_notified" => Ok(TripStatus::OverdueNotified),
            "completed" => Ok(TripStatus::Completed),
            other => Err(format!("unknown trip status '{other}'")),
        }
    }
}

/// Boolean idempotency markers stored on the trip row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Marker {
    StartingSoon,
    TripStarted,
    ApproachingEta,
    EtaReached,
    EtaTransition,
    GraceTransition,
}

impl Marker {
    pub const ALL: [Marker; 6] = [
        Marker::StartingSoon,
        Marker::TripStarted,
        Marker::ApproachingEta,
        Marker::EtaReached,
        Marker::EtaTransition,
        Marker::GraceTransition,
    ];

    /// Column name on `trips`. Only these literals are ever spliced into SQL.
    pub fn column(&self) -> &'static str {
        match self {
            Marker::StartingSoon => "notified_starting_soon",
            Marker::TripStarted => "notified_trip_started",
            Marker::ApproachingEta => "notified_approaching_eta",
            Marker::EtaReached => "notified_eta_reached",
            Marker::EtaTransition => "notified_eta_transition",
            Marker::GraceTransition => "notified_grace_transition",
        }
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.column())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Markers {
    pub starting_soon: bool,
    pub trip_started: bool,
    pub approaching_eta: bool,
    pub eta_reached: bool,
    pub eta_transition: bool,
    pub grace_transition: bool,
}

impl Markers {
    pub fn is_set(&self, marker: Marker) -> bool {
        match marker {
            Marker::StartingSoon => self.starting_soon,
            Marker::TripStarted => self.trip_started,
            Marker::ApproachingEta => self.approaching_eta,
            Marker::EtaReached => self.eta_reached,
            Marker::EtaTransition => self.eta_transition,
            Marker::GraceTransition => self.grace_transition,
        }
    }

    pub fn set(&mut self, marker: Marker) {
        let slot = match marker {
            Marker::StartingSoon => &mut self.starting_soon,
            Marker::TripStarted => &mut self.trip_started,
            Marker::ApproachingEta => &mut self.approaching_eta,
            Marker::EtaReached => &mut self.eta_reached,
            Marker::EtaTransition => &mut self.eta_transition,
            Marker::GraceTransition => &mut self.grace_transition,
        };
        *slot = true;
    }
}

/// Allowed notification window in the owner's local hours, `[start, end)`.
/// Wraps past midnight when `start > end`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuietHours {
    pub start_hour: u32,
    pub end_hour: u32,
    pub utc_offset_minutes: i32,
}

impl QuietHours {
    pub fn allows(&self, now: DateTime<Utc>) -> bool {
        let offset =
            FixedOffset::east_opt(self.utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix());
        let hour = now.with_timezone(&offset).hour();
        if self.start_hour == self.end_hour {
            return true;
        }
        if self.start_hour < self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

/// What a conditional write checks the stored row against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowGuard {
    pub status: TripStatus,
    pub epoch: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trip {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub status: TripStatus,
    pub start_at: DateTime<Utc>,
    pub eta_at: DateTime<Utc>,
    pub grace_minutes: i64,
    pub checkin_interval_min: i64,
    pub quiet_hours: Option<QuietHours>,
    pub utc_offset_minutes: i32,
    pub contact_ids: Vec<i64>,
    pub last_checkin_at: Option<DateTime<Utc>>,
    pub last_checkin_reminder: Option<DateTime<Utc>>,
    pub last_grace_warning: Option<DateTime<Utc>>,
    pub markers: Markers,
    pub extended_count: i64,
    pub notify_self: bool,
    pub checkin_epoch: i64,
}

impl Trip {
    pub fn grace_deadline(&self) -> DateTime<Utc> {
        self.eta_at + Duration::minutes(self.grace_minutes)
    }

    pub fn guard(&self) -> RowGuard {
        RowGuard {
            status: self.status,
            epoch: self.checkin_epoch,
        }
    }
}

/// A trip as the CRUD layer creates it.
#[derive(Debug, Clone)]
pub struct NewTrip {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub start_at: DateTime<Utc>,
    pub eta_at: DateTime<Utc>,
    pub grace_minutes: i64,
    pub checkin_interval_min: i64,
    pub notify_start_hour: Option<u32>,
    pub notify_end_hour: Option<u32>,
    pub utc_offset_minutes: i32,
    pub contact_ids: Vec<i64>,
    pub notify_self: bool,
}

impl NewTrip {
    pub fn new(
        user_id: impl Into<String>,
        title: impl Into<String>,
        start_at: DateTime<Utc>,
        eta_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            title: title.into(),
            start_at,
            eta_at,
            grace_minutes: 30,
            checkin_interval_min: 30,
            notify_start_hour: None,
            notify_end_hour: None,
            utc_offset_minutes: 0,
            contact_ids: Vec::new(),
            notify_self: false,
        }
    }

    /// `active` when the start time has already passed at creation.
    pub fn initial_status(&self, now: DateTime<Utc>) -> TripStatus {
        if self.start_at <= now {
            TripStatus::Active
        } else {
            TripStatus::Scheduled
        }
    }
}

/// Raw `trips` row as stored. Decoded into [`Trip`] one row at a time so a
/// single bad row cannot poison a whole batch.
#[derive(Debug, Clone, FromRow)]
pub struct TripRow {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub status: String,
    pub start_at: DateTime<Utc>,
    pub eta_at: DateTime<Utc>,
    pub grace_minutes: i64,
    pub checkin_interval_min: i64,
    pub notify_start_hour: Option<i64>,
    pub notify_end_hour: Option<i64>,
    pub utc_offset_minutes: i64,
    pub contact1: Option<i64>,
    pub contact2: Option<i64>,
    pub contact3: Option<i64>,
    pub last_checkin_at: Option<DateTime<Utc>>,
    pub last_checkin_reminder: Option<DateTime<Utc>>,
    pub last_grace_warning: Option<DateTime<Utc>>,
    pub notified_starting_soon: bool,
    pub notified_trip_started: bool,
    pub notified_approaching_eta: bool,
    pub notified_eta_reached: bool,
    pub notified_eta_transition: bool,
    pub notified_grace_transition: bool,
    pub extended_count: i64,
    pub notify_self: bool,
    pub checkin_epoch: i64,
}

impl TryFrom<TripRow> for Trip {
    type Error = AppError;

    fn try_from(row: TripRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<TripStatus>()
            .map_err(|reason| AppError::malformed(&row.id, reason))?;
        if row.grace_minutes < 0 {
            return Err(AppError::malformed(&row.id, "negative grace_minutes"));
        }
        if row.checkin_interval_min < 0 {
            return Err(AppError::malformed(&row.id, "negative checkin_interval_min"));
        }
        if row.eta_at < row.start_at {
            return Err(AppError::malformed(&row.id, "eta_at precedes start_at"));
        }
        if row.utc_offset_minutes.abs() >= 24 * 60 {
            return Err(AppError::malformed(&row.id, "utc offset out of range"));
        }

        let quiet_hours = match (row.notify_start_hour, row.notify_end_hour) {
            (Some(start), Some(end)) => {
                let start = hour_of_day(&row.id, start)?;
                let end = hour_of_day(&row.id, end)?;
                Some(QuietHours {
                    start_hour: start,
                    end_hour: end,
                    utc_offset_minutes: row.utc_offset_minutes as i32,
                })
            }
            _ => None,
        };

        let contact_ids = [row.contact1, row.contact2, row.contact3]
            .into_iter()
            .flatten()
            .collect();

        Ok(Trip {
            id: row.id,
            user_id: row.user_id,
            title: row.title,
            status,
            start_at: row.start_at,
            eta_at: row.eta_at,
            grace_minutes: row.grace_minutes,
            checkin_interval_min: row.checkin_interval_min,
            quiet_hours,
            utc_offset_minutes: row.utc_offset_minutes as i32,
            contact_ids,
            last_checkin_at: row.last_checkin_at,
            last_checkin_reminder: row.last_checkin_reminder,
            last_grace_warning: row.last_grace_warning,
            markers: Markers {
                starting_soon: row.notified_starting_soon,
                trip_started: row.notified_trip_started,
                approaching_eta: row.notified_approaching_eta,
                eta_reached: row.notified_eta_reached,
                eta_transition: row.notified_eta_transition,
                grace_transition: row.notified_grace_transition,
            },
            extended_count: row.extended_count,
            notify_self: row.notify_self,
            checkin_epoch: row.checkin_epoch,
        })
    }
}

fn hour_of_day(id: &str, value: i64) -> Result<u32, AppError> {
    if (0..24).contains(&value) {
        Ok(value as u32)
    } else {
        Err(AppError::malformed(id, format!("hour {value} outside 0..24")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row() -> TripRow {
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap();
        TripRow {
            id: "trip-1".into(),
            user_id: "user-1".into(),
            title: "Hike".into(),
            status: "active".into(),
            start_at: start,
            eta_at: start + Duration::hours(2),
            grace_minutes: 30,
            checkin_interval_min: 30,
            notify_start_hour: Some(8),
            notify_end_hour: Some(22),
            utc_offset_minutes: 120,
            contact1: Some(4),
            contact2: None,
            contact3: Some(9),
            last_checkin_at: None,
            last_checkin_reminder: None,
            last_grace_warning: None,
            notified_starting_soon: true,
            notified_trip_started: true,
            notified_approaching_eta: false,
            notified_eta_reached: false,
            notified_eta_transition: false,
            notified_grace_transition: false,
            extended_count: 0,
            notify_self: false,
            checkin_epoch: 0,
        }
    }

    #[test]
    fn decodes_a_well_formed_row() {
        let trip = Trip::try_from(row()).unwrap();
        assert_eq!(trip.status, TripStatus::Active);
        assert_eq!(trip.contact_ids, vec![4, 9]);
        assert!(trip.markers.is_set(Marker::TripStarted));
        assert_eq!(
            trip.quiet_hours,
            Some(QuietHours {
                start_hour: 8,
                end_hour: 22,
                utc_offset_minutes: 120
            })
        );
    }

    #[test]
    fn rejects_unknown_status_and_bad_hours() {
        let mut bad = row();
        bad.status = "lost".into();
        assert!(matches!(
            Trip::try_from(bad),
            Err(AppError::MalformedRow { .. })
        ));

        let mut bad = row();
        bad.notify_end_hour = Some(24);
        assert!(Trip::try_from(bad).is_err());
    }

    #[test]
    fn one_sided_window_means_no_restriction() {
        let mut partial = row();
        partial.notify_end_hour = None;
        assert_eq!(Trip::try_from(partial).unwrap().quiet_hours, None);
    }

    #[test]
    fn quiet_hours_use_local_hour_and_wrap_midnight() {
        let day = QuietHours {
            start_hour: 8,
            end_hour: 22,
            utc_offset_minutes: 120,
        };
        // 05:30 UTC is 07:30 local.
        assert!(!day.allows(Utc.with_ymd_and_hms(2024, 6, 1, 5, 30, 0).unwrap()));
        assert!(day.allows(Utc.with_ymd_and_hms(2024, 6, 1, 6, 0, 0).unwrap()));
        assert!(!day.allows(Utc.with_ymd_and_hms(2024, 6, 1, 20, 0, 0).unwrap()));

        let night_shift = QuietHours {
            start_hour: 22,
            end_hour: 6,
            utc_offset_minutes: 0,
        };
        assert!(night_shift.allows(Utc.with_ymd_and_hms(2024, 6, 1, 23, 0, 0).unwrap()));
        assert!(night_shift.allows(Utc.with_ymd_and_hms(2024, 6, 1, 3, 0, 0).unwrap()));
        assert!(!night_shift.allows(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()));
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            TripStatus::Scheduled,
            TripStatus::Active,
            TripStatus::Overdue,
            TripStatus::OverdueNotified,
            TripStatus::Completed,
        ] {
            assert_eq!(status.as_str().parse::<TripStatus>().unwrap(), status);
        }
    }
}
