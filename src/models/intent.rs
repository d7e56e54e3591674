use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::trip::{Marker, TripStatus};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    StartingSoon,
    TripStarted,
    ApproachingEta,
    EtaReached,
    LiveEtaTransition,
    ContactsOverdue,
    LiveGraceTransition,
    CheckinReminder,
}

/// Who an intent is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// Owner's push devices.
    Owner,
    /// Owner's live-widget token for the trip.
    OwnerLiveActivity,
    /// Owner's push devices plus every safety contact.
    OwnerAndContacts,
    /// Safety contacts, plus the owner when the trip has `notify_self`.
    Contacts,
}

impl IntentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentKind::StartingSoon => "starting_soon",
            IntentKind::TripStarted => "trip_started",
            IntentKind::ApproachingEta => "approaching_eta",
            IntentKind::EtaReached => "eta_reached",
            IntentKind::LiveEtaTransition => "live_eta_transition",
            IntentKind::ContactsOverdue => "contacts_overdue",
            IntentKind::LiveGraceTransition => "live_grace_transition",
            IntentKind::CheckinReminder => "checkin_reminder",
        }
    }

    pub fn audience(&self) -> Audience {
        match self {
            IntentKind::StartingSoon
            | IntentKind::ApproachingEta
            | IntentKind::EtaReached
            | IntentKind::CheckinReminder => Audience::Owner,
            IntentKind::LiveEtaTransition | IntentKind::LiveGraceTransition => {
                Audience::OwnerLiveActivity
            }
            IntentKind::TripStarted => Audience::OwnerAndContacts,
            IntentKind::ContactsOverdue => Audience::Contacts,
        }
    }

    /// Reminder-class intents are the only ones quiet hours may defer.
    pub fn is_deferrable(&self) -> bool {
        matches!(self, IntentKind::CheckinReminder)
    }
}

impl fmt::Display for IntentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The single thing committed once an intent has been attempted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IdempotencyKey {
    Marker { marker: Marker },
    StatusEdge { from: TripStatus, to: TripStatus },
    ReminderStamp { at: DateTime<Utc> },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Intent {
    pub kind: IntentKind,
    pub key: IdempotencyKey,
}

impl Intent {
    pub fn marker(kind: IntentKind, marker: Marker) -> Self {
        Self {
            kind,
            key: IdempotencyKey::Marker { marker },
        }
    }

    pub fn status_edge(kind: IntentKind, from: TripStatus, to: TripStatus) -> Self {
        Self {
            kind,
            key: IdempotencyKey::StatusEdge { from, to },
        }
    }

    pub fn reminder(at: DateTime<Utc>) -> Self {
        Self {
            kind: IntentKind::CheckinReminder,
            key: IdempotencyKey::ReminderStamp { at },
        }
    }
}
