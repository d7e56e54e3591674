use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    models::{
        contact::{Channel, DeliveryTarget},
        intent::IntentKind,
        settings::RenderedMessage,
    },
    services::{
        channel::{NotificationChannel, SendOutcome},
        push::{PushGateway, PushRequest, PushType},
    },
};

/// Updates the owner's lock-screen widget for a trip.
///
/// Shares the gateway and its access token with [`super::push::PushChannel`];
/// only the payload differs.
pub struct LiveActivityChannel {
    gateway: Arc<PushGateway>,
}

impl LiveActivityChannel {
    pub fn new(gateway: Arc<PushGateway>) -> Self {
        Self { gateway }
    }
}

/// Widget state for the transition a message announces.
pub fn content_state(message: &RenderedMessage) -> serde_json::Value {
    let intent = message.metadata.get("intent").and_then(|v| v.as_str());
    let status = if intent == Some(IntentKind::LiveGraceTransition.as_str()) {
        "overdue_notified"
    } else if intent == Some(IntentKind::LiveEtaTransition.as_str()) {
        "overdue"
    } else {
        message
            .metadata
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or("active")
    };
    serde_json::json!({
        "status": status,
        "eta": message.metadata.get("eta").cloned().unwrap_or(serde_json::Value::Null),
    })
}

#[async_trait]
impl NotificationChannel for LiveActivityChannel {
    fn channel(&self) -> Channel {
        Channel::LiveActivity
    }

    async fn send(&self, target: &DeliveryTarget, message: &RenderedMessage) -> SendOutcome {
        let request = PushRequest {
            token: &target.address,
            push_type: PushType::LiveActivity,
            title: &message.title,
            body: &message.body,
            data: &message.metadata,
            event: Some("update"),
            content_state: Some(content_state(message)),
        };
        self.gateway.deliver(&request).await
    }
}
