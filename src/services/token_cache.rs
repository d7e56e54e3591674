use std::{future::Future, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::{clock::Clock, error::AppError};

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    fetched_at: DateTime<Utc>,
}

/// A single bearer credential reused until its TTL runs out.
///
/// The lock is held across the fetch so concurrent senders wait for one
/// refresh instead of each minting their own.
pub struct TokenCache {
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
    slot: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(1));
        Self {
            ttl,
            clock,
            slot: Mutex::new(None),
        }
    }

    pub async fn get_or_fetch<F, Fut>(&self, fetch: F) -> Result<String, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, AppError>>,
    {
        let mut slot = self.slot.lock().await;
        let now = self.clock.now();
        if let Some(cached) = slot.as_ref() {
            if now - cached.fetched_at < self.ttl {
                return Ok(cached.value.clone());
            }
        }
        let value = fetch().await?;
        *slot = Some(CachedToken {
            value: value.clone(),
            fetched_at: now,
        });
        Ok(value)
    }

    pub async fn invalidate(&self) {
        *self.slot.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn reuses_until_ttl_then_refetches() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap());
        let cache = TokenCache::new(Duration::from_secs(600), Arc::new(clock.clone()));
        let counter = AtomicUsize::new(0);
        let fetches = &counter;
        let fetch = move || async move {
            let n = fetches.fetch_add(1, Ordering::SeqCst);
            Ok::<_, AppError>(format!("token-{n}"))
        };

        assert_eq!(cache.get_or_fetch(fetch).await.unwrap(), "token-0");
        clock.advance(chrono::Duration::seconds(599));
        assert_eq!(cache.get_or_fetch(fetch).await.unwrap(), "token-0");
        clock.advance(chrono::Duration::seconds(1));
        assert_eq!(cache.get_or_fetch(fetch).await.unwrap(), "token-1");

        cache.invalidate().await;
        assert_eq!(cache.get_or_fetch(fetch).await.unwrap(), "token-2");
        assert_eq!(fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failed_fetch_leaves_cache_empty() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap());
        let cache = TokenCache::new(Duration::from_secs(600), Arc::new(clock));
        let result = cache
            .get_or_fetch(|| async { Err(AppError::Config("no key".into())) })
            .await;
        assert!(result.is_err());
        let token = cache
            .get_or_fetch(|| async { Ok("fresh".to_string()) })
            .await
            .unwrap();
        assert_eq!(token, "fresh");
    }
}
