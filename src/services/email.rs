use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tracing::warn;
use url::Url;

use crate::{
    config::EmailConfig,
    error::AppError,
    models::{
        contact::{Channel, DeliveryTarget},
        settings::RenderedMessage,
    },
    services::channel::{transport_outcome, NotificationChannel, SendOutcome},
};

#[derive(Debug, Serialize)]
struct SendEmailRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    text: &'a str,
}

/// Transactional email through a JSON send API.
pub struct EmailChannel {
    client: Client,
    endpoint: Url,
    api_key: String,
    from: String,
}

impl EmailChannel {
    pub fn new(config: &EmailConfig, timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder().timeout(timeout).build()?;
        let endpoint = config
            .api_url
            .join("emails")
            .map_err(|err| AppError::Config(format!("invalid EMAIL_API_URL: {err}")))?;
        Ok(Self {
            client,
            endpoint,
            api_key: config.api_key.clone(),
            from: config.from.clone(),
        })
    }
}

pub fn classify_email_response(status: StatusCode, body: &str) -> SendOutcome {
    if status.is_success() {
        return SendOutcome::Delivered;
    }
    let detail = format!("{}: {}", status.as_u16(), body.trim());
    match status {
        StatusCode::UNPROCESSABLE_ENTITY => SendOutcome::PermanentlyInvalid(detail),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            SendOutcome::Transient(detail)
        }
        s if s.is_server_error() => SendOutcome::Transient(detail),
        _ => SendOutcome::Failed(detail),
    }
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(&self, target: &DeliveryTarget, message: &RenderedMessage) -> SendOutcome {
        let request = SendEmailRequest {
            from: &self.from,
            to: [target.address.as_str()],
            subject: &message.title,
            text: &message.body,
        };
        let response = match self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => return transport_outcome(&err),
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let outcome = classify_email_response(status, &body);
        if !matches!(outcome, SendOutcome::Delivered) {
            warn!(recipient = %target.label, status = status.as_u16(), ?outcome, "email send rejected");
        }
        outcome
    }
}
