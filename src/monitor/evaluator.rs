//! Pure lifecycle evaluation: `(trip, now) -> (transition, intents)`.
//!
//! Nothing in here touches the database or a channel. The scheduler commits
//! the status advance and the dispatcher commits each intent's idempotency
//! key; re-running [`evaluate`] on the committed row at the same instant
//! yields nothing new.

use chrono::{DateTime, Duration, Utc};

use crate::{
    config::MonitorConfig,
    models::{
        intent::{Intent, IntentKind},
        trip::{Marker, Trip, TripStatus},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Windows {
    pub starting_soon: Duration,
    pub approaching_eta: Duration,
}

impl Default for Windows {
    fn default() -> Self {
        Self {
            starting_soon: Duration::minutes(15),
            approaching_eta: Duration::minutes(15),
        }
    }
}

impl From<&MonitorConfig> for Windows {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            starting_soon: config.starting_soon_window,
            approaching_eta: config.approaching_eta_window,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub from: TripStatus,
    /// Status the trip has reached at `now`, including the edge that only
    /// commits once its own notification was attempted.
    pub to: TripStatus,
    pub intents: Vec<Intent>,
    /// Intents that are due but held back by quiet hours.
    pub deferred: Vec<IntentKind>,
}

impl Evaluation {
    fn unchanged(status: TripStatus) -> Self {
        Self {
            from: status,
            to: status,
            intents: Vec::new(),
            deferred: Vec::new(),
        }
    }

    /// Status to commit before dispatching. The overdue -> overdue_notified
    /// edge is excluded: the contact alert commits it.
    pub fn advance_to(&self) -> Option<TripStatus> {
        let target = match self.to {
            TripStatus::OverdueNotified => TripStatus::Overdue,
            other => other,
        };
        (target.rank() > self.from.rank()).then_some(target)
    }

    pub fn is_noop(&self) -> bool {
        self.intents.is_empty() && self.advance_to().is_none()
    }

    pub fn kinds(&self) -> Vec<IntentKind> {
        self.intents.iter().map(|intent| intent.kind).collect()
    }
}

pub fn evaluate(trip: &Trip, now: DateTime<Utc>, windows: &Windows) -> Evaluation {
    if trip.status == TripStatus::Completed {
        return Evaluation::unchanged(trip.status);
    }

    let mut eval = Evaluation::unchanged(trip.status);
    let markers = trip.markers;
    let mut status = trip.status;

    if matches!(status, TripStatus::Scheduled | TripStatus::Active)
        && !markers.starting_soon
        && now < trip.start_at
        && trip.start_at - now <= windows.starting_soon
    {
        eval.intents
            .push(Intent::marker(IntentKind::StartingSoon, Marker::StartingSoon));
    }

    if status == TripStatus::Scheduled && now >= trip.start_at {
        status = TripStatus::Active;
    }

    // Keyed on the marker, not the status edge, so an announcement lost after
    // the status commit is retried.
    if status == TripStatus::Active && !markers.trip_started {
        eval.intents
            .push(Intent::marker(IntentKind::TripStarted, Marker::TripStarted));
    }

    if status == TripStatus::Active
        && !markers.approaching_eta
        && now < trip.eta_at
        && trip.eta_at - now <= windows.approaching_eta
    {
        eval.intents.push(Intent::marker(
            IntentKind::ApproachingEta,
            Marker::ApproachingEta,
        ));
    }

    if status == TripStatus::Active && now >= trip.eta_at {
        status = TripStatus::Overdue;
    }

    // Level-triggered so a crash between the status commit and the marker
    // commit re-fires on the next tick.
    if status.is_overdue() {
        if !markers.eta_reached {
            eval.intents
                .push(Intent::marker(IntentKind::EtaReached, Marker::EtaReached));
        }
        if !markers.eta_transition {
            eval.intents.push(Intent::marker(
                IntentKind::LiveEtaTransition,
                Marker::EtaTransition,
            ));
        }
    }

    if status == TripStatus::Overdue && now >= trip.grace_deadline() {
        eval.intents.push(Intent::status_edge(
            IntentKind::ContactsOverdue,
            TripStatus::Overdue,
            TripStatus::OverdueNotified,
        ));
        status = TripStatus::OverdueNotified;
    }

    if status == TripStatus::OverdueNotified && !markers.grace_transition {
        eval.intents.push(Intent::marker(
            IntentKind::LiveGraceTransition,
            Marker::GraceTransition,
        ));
    }

    if matches!(status, TripStatus::Active | TripStatus::Overdue) && reminder_due(trip, now) {
        eval.intents.push(Intent::reminder(now));
    }

    let allowed = trip
        .quiet_hours
        .map(|window| window.allows(now))
        .unwrap_or(true);
    if !allowed {
        let (held, due): (Vec<Intent>, Vec<Intent>) = eval
            .intents
            .into_iter()
            .partition(|intent| intent.kind.is_deferrable());
        eval.intents = due;
        eval.deferred = held.into_iter().map(|intent| intent.kind).collect();
    }

    eval.to = status;
    eval
}

fn reminder_due(trip: &Trip, now: DateTime<Utc>) -> bool {
    if trip.checkin_interval_min <= 0 {
        return false;
    }
    let since = trip.last_checkin_reminder.unwrap_or(trip.start_at);
    now - since >= Duration::minutes(trip.checkin_interval_min)
}
