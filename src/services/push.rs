//! Mobile push through the push gateway.
//!
//! The gateway takes a short-lived bearer token minted from the API key, then
//! accepts one JSON payload per device token. Rejections follow APNs reason
//! codes, so a revoked token shows up as `410` or a `400` carrying
//! `BadDeviceToken` / `Unregistered`.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use url::Url;

use crate::{
    clock::Clock,
    config::PushGatewayConfig,
    error::AppError,
    models::{
        contact::{Channel, DeliveryTarget},
        settings::RenderedMessage,
    },
    services::{
        channel::{transport_outcome, NotificationChannel, SendOutcome},
        token_cache::TokenCache,
    },
};

const PERMANENT_REASONS: &[&str] = &[
    "BadDeviceToken",
    "Unregistered",
    "DeviceTokenNotForTopic",
    "DeviceNotRegistered",
    "ExpiredToken",
];

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PushType {
    Alert,
    LiveActivity,
}

#[derive(Debug, Serialize)]
pub struct PushRequest<'a> {
    pub token: &'a str,
    pub push_type: PushType,
    pub title: &'a str,
    pub body: &'a str,
    pub data: &'a serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_state: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    api_key: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct RejectionBody {
    #[serde(default)]
    reason: Option<String>,
}

pub struct PushGateway {
    client: Client,
    base_url: Url,
    api_key: String,
    tokens: TokenCache,
}

impl PushGateway {
    pub fn new(
        config: &PushGatewayConfig,
        timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AppError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            tokens: TokenCache::new(config.token_ttl, clock),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, AppError> {
        self.base_url
            .join(path)
            .map_err(|err| AppError::Config(format!("invalid push gateway url: {err}")))
    }

    async fn access_token(&self) -> Result<String, AppError> {
        self.tokens
            .get_or_fetch(|| async {
                let url = self.endpoint("v1/auth/token")?;
                let response = self
                    .client
                    .post(url)
                    .json(&TokenRequest {
                        api_key: &self.api_key,
                    })
                    .send()
                    .await?
                    .error_for_status()?;
                let body: TokenResponse = response.json().await?;
                debug!("refreshed push gateway access token");
                Ok::<_, AppError>(body.access_token)
            })
            .await
    }

    pub async fn deliver(&self, request: &PushRequest<'_>) -> SendOutcome {
        let token = match self.access_token().await {
            Ok(token) => token,
            Err(AppError::Http(err)) => return transport_outcome(&err),
            Err(err) => return SendOutcome::Failed(err.to_string()),
        };
        let url = match self.endpoint("v1/push") {
            Ok(url) => url,
            Err(err) => return SendOutcome::Failed(err.to_string()),
        };

        let response = match self
            .client
            .post(url)
            .bearer_auth(token)
            .json(request)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => return transport_outcome(&err),
        };

        let status = response.status();
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            self.tokens.invalidate().await;
        }
        let body = response.text().await.unwrap_or_default();
        let outcome = classify_push_response(status, &body);
        if !matches!(outcome, SendOutcome::Delivered) {
            warn!(
                target_token = %fingerprint(request.token),
                status = status.as_u16(),
                ?outcome,
                "push gateway rejected send"
            );
        }
        outcome
    }
}

pub fn classify_push_response(status: StatusCode, body: &str) -> SendOutcome {
    if status.is_success() {
        return SendOutcome::Delivered;
    }
    let reason = serde_json::from_str::<RejectionBody>(body)
        .ok()
        .and_then(|parsed| parsed.reason)
        .unwrap_or_else(|| body.trim().to_string());
    let detail = format!("{}: {}", status.as_u16(), reason);

    if status == StatusCode::GONE || PERMANENT_REASONS.contains(&reason.as_str()) {
        return SendOutcome::PermanentlyInvalid(detail);
    }
    match status {
        StatusCode::UNAUTHORIZED
        | StatusCode::FORBIDDEN
        | StatusCode::REQUEST_TIMEOUT
        | StatusCode::TOO_MANY_REQUESTS => SendOutcome::Transient(detail),
        s if s.is_server_error() => SendOutcome::Transient(detail),
        _ => SendOutcome::Failed(detail),
    }
}

/// Short stable id for a device token, safe to put in logs.
pub fn fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    digest[..6].iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Alert pushes to a user's devices.
pub struct PushChannel {
    gateway: Arc<PushGateway>,
}

impl PushChannel {
    pub fn new(gateway: Arc<PushGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl NotificationChannel for PushChannel {
    fn channel(&self) -> Channel {
        Channel::Push
    }

    async fn send(&self, target: &DeliveryTarget, message: &RenderedMessage) -> SendOutcome {
        let request = PushRequest {
            token: &target.address,
            push_type: PushType::Alert,
            title: &message.title,
            body: &message.body,
            data: &message.metadata,
            event: None,
            content_state: None,
        };
        self.gateway.deliver(&request).await
    }
}
