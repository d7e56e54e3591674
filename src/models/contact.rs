use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Push,
    Email,
    LiveActivity,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Push => "push",
            Channel::Email => "email",
            Channel::LiveActivity => "live_activity",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The trip owner as seen by the dispatcher.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OwnerProfile {
    pub user_id: String,
    pub display_name: String,
    pub email: Option<String>,
    pub device_tokens: Vec<String>,
    pub live_activity_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SafetyContact {
    Email {
        id: i64,
        name: String,
        email: String,
    },
    Friend {
        user_id: String,
        display_name: String,
        email: Option<String>,
        device_tokens: Vec<String>,
    },
}

/// Everyone a trip's notifications could reach.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TripAudience {
    pub owner: OwnerProfile,
    pub contacts: Vec<SafetyContact>,
}

/// One concrete address on one channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryTarget {
    pub channel: Channel,
    pub address: String,
    /// Recipient user, when the recipient has an account.
    pub user_id: Option<String>,
    pub label: String,
}

impl DeliveryTarget {
    pub fn new(
        channel: Channel,
        address: impl Into<String>,
        user_id: Option<String>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            address: address.into(),
            user_id,
            label: label.into(),
        }
    }
}
