use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

use super::{intent::IntentKind, trip::Trip};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageTemplate {
    pub title: String,
    pub body: String,
}

impl MessageTemplate {
    fn new(title: &str, body: &str) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageTemplates {
    pub starting_soon: MessageTemplate,
    pub trip_started: MessageTemplate,
    pub approaching_eta: MessageTemplate,
    pub eta_reached: MessageTemplate,
    pub live_eta_transition: MessageTemplate,
    pub contacts_overdue: MessageTemplate,
    pub live_grace_transition: MessageTemplate,
    pub checkin_reminder: MessageTemplate,
}

impl Default for MessageTemplates {
    fn default() -> Self {
        Self {
            starting_soon: MessageTemplate::new(
                "Trip starting soon",
                "'{title}' starts at {start}. Have a safe trip!",
            ),
            trip_started: MessageTemplate::new(
                "Trip started",
                "{owner} started '{title}' and expects to be back by {eta}.",
            ),
            approaching_eta: MessageTemplate::new(
                "Almost time to check in",
                "'{title}' is due back at {eta}. Check in or extend if you need more time.",
            ),
            eta_reached: MessageTemplate::new(
                "You're past your return time",
                "'{title}' was due back at {eta}. Check in now; your contacts will be alerted in {grace} minutes.",
            ),
            live_eta_transition: MessageTemplate::new("Overdue", "Check in to stop the alert."),
            contacts_overdue: MessageTemplate::new(
                "{owner} is overdue",
                "{owner} has not checked in from '{title}'. They were expected back at {eta}. Please try to reach them.",
            ),
            live_grace_transition: MessageTemplate::new(
                "Contacts alerted",
                "Your safety contacts have been notified.",
            ),
            checkin_reminder: MessageTemplate::new(
                "Time to check in",
                "Let everyone know you're OK on '{title}'.",
            ),
        }
    }
}

/// A rendered message ready for a channel adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RenderedMessage {
    pub title: String,
    pub body: String,
    pub metadata: serde_json::Value,
}

impl MessageTemplates {
    pub fn for_intent(&self, kind: IntentKind) -> &MessageTemplate {
        match kind {
            IntentKind::StartingSoon => &self.starting_soon,
            IntentKind::TripStarted => &self.trip_started,
            IntentKind::ApproachingEta => &self.approaching_eta,
            IntentKind::EtaReached => &self.eta_reached,
            IntentKind::LiveEtaTransition => &self.live_eta_transition,
            IntentKind::ContactsOverdue => &self.contacts_overdue,
            IntentKind::LiveGraceTransition => &self.live_grace_transition,
            IntentKind::CheckinReminder => &self.checkin_reminder,
        }
    }

    pub fn render(&self, kind: IntentKind, trip: &Trip, owner_name: &str) -> RenderedMessage {
        let template = self.for_intent(kind);
        RenderedMessage {
            title: render_template(&template.title, trip, owner_name),
            body: render_template(&template.body, trip, owner_name),
            metadata: serde_json::json!({
                "trip_id": trip.id,
                "intent": kind.as_str(),
                "status": trip.status.as_str(),
                "eta": trip.eta_at.to_rfc3339(),
            }),
        }
    }
}

fn render_template(template: &str, trip: &Trip, owner_name: &str) -> String {
    let mut message = template.to_string();
    message = message.replace("{title}", &trip.title);
    message = message.replace("{owner}", owner_name);
    message = message.replace("{start}", &local_time(trip, trip.start_at));
    message = message.replace("{eta}", &local_time(trip, trip.eta_at));
    message = message.replace("{grace}", &trip.grace_minutes.to_string());
    message
}

fn local_time(trip: &Trip, at: DateTime<Utc>) -> String {
    match FixedOffset::east_opt(trip.utc_offset_minutes * 60) {
        Some(offset) => at.with_timezone(&offset).format("%H:%M").to_string(),
        None => at.format("%H:%M UTC").to_string(),
    }
}
