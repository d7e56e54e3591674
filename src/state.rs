use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::{
    clock::Clock,
    config::AppConfig,
    db::DbPool,
    error::AppError,
    models::settings::MessageTemplates,
    monitor::{inflight::InFlight, scheduler::Scheduler},
    services::{
        channel::NotificationChannel,
        dispatcher::{DispatchJob, Dispatcher, RetryPolicy},
        email::EmailChannel,
        live_activity::LiveActivityChannel,
        push::{PushChannel, PushGateway},
        storage::SqliteStore,
    },
};

/// Everything the monitor and its dispatcher share.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub db: DbPool,
    pub store: Arc<SqliteStore>,
    pub clock: Arc<dyn Clock>,
    pub templates: MessageTemplates,
    pub inflight: InFlight,
}

impl AppState {
    pub fn new(config: AppConfig, db: DbPool, clock: Arc<dyn Clock>) -> Self {
        Self {
            store: Arc::new(SqliteStore::new(db.clone())),
            config,
            db,
            clock,
            templates: MessageTemplates::default(),
            inflight: InFlight::new(),
        }
    }

    /// Channel adapters for every channel that has credentials configured.
    pub fn channels(&self) -> Result<Vec<Arc<dyn NotificationChannel>>, AppError> {
        let mut channels: Vec<Arc<dyn NotificationChannel>> = Vec::new();

        match &self.config.push {
            Some(push) => {
                let gateway = Arc::new(PushGateway::new(
                    push,
                    self.config.http_timeout,
                    self.clock.clone(),
                )?);
                info!(gateway = %push.base_url, "push and live-widget delivery enabled");
                channels.push(Arc::new(PushChannel::new(gateway.clone())));
                channels.push(Arc::new(LiveActivityChannel::new(gateway)));
            }
            None => warn!("PUSH_GATEWAY_URL or PUSH_API_KEY not set; push and live-widget delivery disabled"),
        }

        match &self.config.email {
            Some(email) => {
                info!(api = %email.api_url, "email delivery enabled");
                channels.push(Arc::new(EmailChannel::new(email, self.config.http_timeout)?));
            }
            None => warn!("EMAIL_API_URL or EMAIL_API_KEY not set; email delivery disabled"),
        }

        Ok(channels)
    }

    pub fn dispatcher(&self) -> Result<Dispatcher, AppError> {
        let mut dispatcher = Dispatcher::new(
            self.store.clone(),
            self.templates.clone(),
            self.clock.clone(),
            RetryPolicy::from(&self.config.dispatch),
            self.inflight.clone(),
        );
        for channel in self.channels()? {
            dispatcher.register_channel(channel);
        }
        Ok(dispatcher)
    }

    pub fn scheduler(&self, queue: mpsc::Sender<DispatchJob>) -> Scheduler {
        Scheduler::new(
            self.store.clone(),
            self.clock.clone(),
            self.config.monitor.clone(),
            self.inflight.clone(),
            queue,
        )
    }
}
