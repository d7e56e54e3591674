use std::{env, str::FromStr, time::Duration};

use url::Url;

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub monitor: MonitorConfig,
    pub dispatch: DispatchConfig,
    pub push: Option<PushGatewayConfig>,
    pub email: Option<EmailConfig>,
    pub http_timeout: Duration,
}

/// Tick cadence and the windows the lifecycle evaluator works with.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub tick_interval: Duration,
    pub lookahead: chrono::Duration,
    pub starting_soon_window: chrono::Duration,
    pub approaching_eta_window: chrono::Duration,
    pub eval_concurrency: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            lookahead: chrono::Duration::minutes(60),
            starting_soon_window: chrono::Duration::minutes(15),
            approaching_eta_window: chrono::Duration::minutes(15),
            eval_concurrency: 8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub queue_capacity: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub drain_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PushGatewayConfig {
    pub base_url: Url,
    pub api_key: String,
    pub token_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub api_url: Url,
    pub api_key: String,
    pub from: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://tripwatch.db".to_string());

        let defaults = MonitorConfig::default();
        let monitor = MonitorConfig {
            tick_interval: Duration::from_secs(parse_var("MONITOR_TICK_SECS", 60u64)?),
            lookahead: chrono::Duration::minutes(parse_var("MONITOR_LOOKAHEAD_MINUTES", 60i64)?),
            starting_soon_window: chrono::Duration::minutes(parse_var(
                "STARTING_SOON_MINUTES",
                15i64,
            )?),
            approaching_eta_window: chrono::Duration::minutes(parse_var(
                "APPROACHING_ETA_MINUTES",
                15i64,
            )?),
            eval_concurrency: parse_var("MONITOR_EVAL_CONCURRENCY", defaults.eval_concurrency)?,
        };
        if monitor.tick_interval.is_zero() {
            return Err(AppError::Config("MONITOR_TICK_SECS must be positive".into()));
        }
        if monitor.eval_concurrency == 0 {
            return Err(AppError::Config(
                "MONITOR_EVAL_CONCURRENCY must be positive".into(),
            ));
        }

        let dispatch = DispatchConfig {
            queue_capacity: parse_var("DISPATCH_QUEUE_CAPACITY", 1024usize)?.max(1),
            max_retries: parse_var("DISPATCH_MAX_RETRIES", 3u32)?,
            retry_delay: Duration::from_millis(parse_var("DISPATCH_RETRY_DELAY_MS", 500u64)?),
            drain_timeout: Duration::from_secs(parse_var("SHUTDOWN_DRAIN_SECS", 30u64)?),
        };

        let push = match (optional_var("PUSH_GATEWAY_URL"), optional_var("PUSH_API_KEY")) {
            (Some(url), Some(api_key)) => Some(PushGatewayConfig {
                base_url: parse_url("PUSH_GATEWAY_URL", &url)?,
                api_key,
                token_ttl: Duration::from_secs(parse_var("PUSH_TOKEN_TTL_SECS", 3000u64)?),
            }),
            _ => None,
        };

        let email = match (optional_var("EMAIL_API_URL"), optional_var("EMAIL_API_KEY")) {
            (Some(url), Some(api_key)) => Some(EmailConfig {
                api_url: parse_url("EMAIL_API_URL", &url)?,
                api_key,
                from: env::var("EMAIL_FROM")
                    .unwrap_or_else(|_| "Tripwatch <alerts@tripwatch.local>".to_string()),
            }),
            _ => None,
        };

        let http_timeout = Duration::from_secs(parse_var("HTTP_TIMEOUT_SECS", 10u64)?);

        Ok(Self {
            database_url,
            monitor,
            dispatch,
            push,
            email,
            http_timeout,
        })
    }
}

fn optional_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_var<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_var(key) {
        Some(raw) => raw
            .parse()
            .map_err(|err| AppError::Config(format!("invalid {key}: {err}"))),
        None => Ok(default),
    }
}

fn parse_url(key: &str, raw: &str) -> Result<Url, AppError> {
    Url::parse(raw).map_err(|err| AppError::Config(format!("invalid {key}: {err}")))
}
