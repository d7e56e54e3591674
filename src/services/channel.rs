use async_trait::async_trait;
use reqwest::StatusCode;

use crate::models::{
    contact::{Channel, DeliveryTarget},
    settings::RenderedMessage,
};

/// Result of one send attempt as reported by a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// Timeout, 5xx, throttling. Worth another attempt.
    Transient(String),
    /// The channel says the target will never work again (revoked token).
    PermanentlyInvalid(String),
    /// Rejected for a reason a retry will not fix.
    Failed(String),
}

impl SendOutcome {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SendOutcome::Transient(_))
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            SendOutcome::Delivered => None,
            SendOutcome::Transient(detail)
            | SendOutcome::PermanentlyInvalid(detail)
            | SendOutcome::Failed(detail) => Some(detail),
        }
    }
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn channel(&self) -> Channel;

    async fn send(&self, target: &DeliveryTarget, message: &RenderedMessage) -> SendOutcome;
}

/// Maps a `reqwest` error to an outcome. Anything that never reached the
/// remote end is treated as transient, as are throttling and server errors
/// surfaced through `error_for_status`.
pub(crate) fn transport_outcome(err: &reqwest::Error) -> SendOutcome {
    if let Some(status) = err.status() {
        return status_outcome(status, err.to_string());
    }
    if err.is_timeout() || err.is_connect() || err.is_request() {
        SendOutcome::Transient(err.to_string())
    } else {
        SendOutcome::Failed(err.to_string())
    }
}

fn status_outcome(status: StatusCode, detail: String) -> SendOutcome {
    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => SendOutcome::Transient(detail),
        s if s.is_server_error() => SendOutcome::Transient(detail),
        _ => SendOutcome::Failed(detail),
    }
}
