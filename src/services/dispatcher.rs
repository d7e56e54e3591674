//! Turns notification intents into channel sends.
//!
//! A job is one intent for one trip. Its targets are sent to in parallel, each
//! with its own retry budget; once every target has been attempted the
//! intent's idempotency key is committed against the row guard the scheduler
//! handed over.

use std::{collections::HashMap, collections::HashSet, sync::Arc, time::Duration};

use tokio::{sync::mpsc, task::JoinSet};
use tracing::{debug, error, info, warn};

use crate::{
    clock::Clock,
    config::DispatchConfig,
    error::AppError,
    models::{
        contact::{Channel, DeliveryTarget, SafetyContact, TripAudience},
        intent::{Audience, IdempotencyKey, Intent},
        notification::{AuditRecord, DeliveryStatus},
        settings::{MessageTemplates, RenderedMessage},
        trip::{RowGuard, Trip, TripStatus},
    },
    monitor::inflight::InFlight,
    services::{
        channel::{NotificationChannel, SendOutcome},
        repository::{AudienceDirectory, AuditSink, TargetRegistry, TripRepository},
    },
};

/// Work handed from the scheduler to the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchJob {
    pub trip: Trip,
    pub intent: Intent,
    /// Row state the intent was computed against, after the scheduler's own
    /// status commit.
    pub guard: RowGuard,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(retry))
    }
}

impl From<&DispatchConfig> for RetryPolicy {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.retry_delay,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub target: DeliveryTarget,
    pub outcome: SendOutcome,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub trip_id: String,
    pub intent: Intent,
    pub deliveries: Vec<Delivery>,
    /// Targets whose channel is not configured.
    pub skipped: usize,
    pub committed: bool,
}

impl DispatchReport {
    pub fn delivered(&self) -> usize {
        self.deliveries
            .iter()
            .filter(|d| d.outcome == SendOutcome::Delivered)
            .count()
    }
}

/// Concrete targets for an intent, deduplicated in resolution order.
pub fn resolve_targets(audience: Audience, trip: &Trip, people: &TripAudience) -> Vec<DeliveryTarget> {
    let owner = &people.owner;
    let owner_push = || {
        owner.device_tokens.iter().map(|token| {
            DeliveryTarget::new(
                Channel::Push,
                token.clone(),
                Some(owner.user_id.clone()),
                owner.display_name.clone(),
            )
        })
    };

    let mut targets: Vec<DeliveryTarget> = Vec::new();
    match audience {
        Audience::Owner => targets.extend(owner_push()),
        Audience::OwnerLiveActivity => {
            if let Some(token) = &owner.live_activity_token {
                targets.push(DeliveryTarget::new(
                    Channel::LiveActivity,
                    token.clone(),
                    Some(owner.user_id.clone()),
                    owner.display_name.clone(),
                ));
            }
        }
        Audience::OwnerAndContacts => {
            targets.extend(owner_push());
            targets.extend(contact_targets(&people.contacts));
        }
        Audience::Contacts => {
            if trip.notify_self {
                targets.extend(owner_push());
            }
            targets.extend(contact_targets(&people.contacts));
        }
    }

    let mut seen = HashSet::new();
    targets.retain(|target| seen.insert((target.channel, target.address.clone())));
    targets
}

fn contact_targets(contacts: &[SafetyContact]) -> Vec<DeliveryTarget> {
    let mut targets = Vec::new();
    for contact in contacts {
        match contact {
            SafetyContact::Email { name, email, .. } => {
                targets.push(DeliveryTarget::new(Channel::Email, email.clone(), None, name.clone()));
            }
            SafetyContact::Friend {
                user_id,
                display_name,
                email,
                device_tokens,
            } => {
                for token in device_tokens {
                    targets.push(DeliveryTarget::new(
                        Channel::Push,
                        token.clone(),
                        Some(user_id.clone()),
                        display_name.clone(),
                    ));
                }
                if let Some(email) = email {
                    targets.push(DeliveryTarget::new(
                        Channel::Email,
                        email.clone(),
                        Some(user_id.clone()),
                        display_name.clone(),
                    ));
                }
            }
        }
    }
    targets
}

pub struct Dispatcher {
    trips: Arc<dyn TripRepository>,
    audience: Arc<dyn AudienceDirectory>,
    registry: Arc<dyn TargetRegistry>,
    audit: Arc<dyn AuditSink>,
    channels: HashMap<Channel, Arc<dyn NotificationChannel>>,
    templates: MessageTemplates,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    inflight: InFlight,
}

impl Dispatcher {
    pub fn new<S>(
        store: Arc<S>,
        templates: MessageTemplates,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        inflight: InFlight,
    ) -> Self
    where
        S: TripRepository + AudienceDirectory + TargetRegistry + AuditSink + 'static,
    {
        Self {
            trips: store.clone(),
            audience: store.clone(),
            registry: store.clone(),
            audit: store,
            channels: HashMap::new(),
            templates,
            clock,
            retry,
            inflight,
        }
    }

    pub fn register_channel(&mut self, channel: Arc<dyn NotificationChannel>) {
        info!(channel = %channel.channel(), "registering notification channel");
        self.channels.insert(channel.channel(), channel);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Runs one job to completion and releases its in-flight claim.
    pub async fn dispatch(&self, job: DispatchJob) -> Result<DispatchReport, AppError> {
        let trip_id = job.trip.id.clone();
        let kind = job.intent.kind;
        let result = self.run(job).await;
        self.inflight.release(&trip_id, kind);
        result
    }

    async fn run(&self, job: DispatchJob) -> Result<DispatchReport, AppError> {
        let DispatchJob { trip, intent, guard } = job;

        // The job may come from a snapshot read before an earlier dispatch of
        // the same intent committed; nothing is sent unless the key is still open.
        let current = self.trips.fetch_trip(&trip.id).await?;
        if !still_pending(&current, &trip, intent, guard) {
            debug!(
                trip_id = %trip.id,
                intent = %intent.kind,
                status = %current.status,
                epoch = current.checkin_epoch,
                "intent already settled; dropping job"
            );
            return Ok(DispatchReport {
                trip_id: trip.id.clone(),
                intent,
                deliveries: Vec::new(),
                skipped: 0,
                committed: false,
            });
        }

        let people = self.audience.load_audience(&trip).await?;
        let targets = resolve_targets(intent.kind.audience(), &trip, &people);
        let message = Arc::new(self.templates.render(
            intent.kind,
            &trip,
            &people.owner.display_name,
        ));

        let mut sends = JoinSet::new();
        let mut skipped = 0;
        for target in targets {
            let Some(channel) = self.channels.get(&target.channel).cloned() else {
                warn!(
                    trip_id = %trip.id,
                    channel = %target.channel,
                    recipient = %target.label,
                    "channel not configured; skipping target"
                );
                skipped += 1;
                continue;
            };
            let registry = self.registry.clone();
            let message = message.clone();
            let retry = self.retry;
            sends.spawn(async move {
                let (outcome, attempts) = send_with_retry(channel.as_ref(), &target, &message, retry).await;
                if let SendOutcome::PermanentlyInvalid(reason) = &outcome {
                    warn!(channel = %target.channel, recipient = %target.label, %reason, "target permanently invalid");
                    if let Err(err) = registry.deregister(&target).await {
                        error!(error = %err, "failed to deregister target");
                    }
                }
                Delivery {
                    target,
                    outcome,
                    attempts,
                }
            });
        }

        let mut deliveries = Vec::new();
        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok(delivery) => {
                    self.audit_delivery(&trip, &message, &delivery).await;
                    deliveries.push(delivery);
                }
                Err(err) => error!(trip_id = %trip.id, error = %err, "send task panicked"),
            }
        }

        let committed = self.commit(&trip, intent, guard).await?;
        let report = DispatchReport {
            trip_id: trip.id.clone(),
            intent,
            deliveries,
            skipped,
            committed,
        };
        info!(
            trip_id = %report.trip_id,
            intent = %intent.kind,
            targets = report.deliveries.len(),
            delivered = report.delivered(),
            skipped,
            committed,
            "intent dispatched"
        );
        Ok(report)
    }

    async fn audit_delivery(&self, trip: &Trip, message: &RenderedMessage, delivery: &Delivery) {
        let status = match delivery.outcome {
            SendOutcome::Delivered => DeliveryStatus::Sent,
            SendOutcome::PermanentlyInvalid(_) => DeliveryStatus::Invalid,
            SendOutcome::Transient(_) | SendOutcome::Failed(_) => DeliveryStatus::Failed,
        };
        let entry = AuditRecord {
            user_id: delivery
                .target
                .user_id
                .clone()
                .unwrap_or_else(|| trip.user_id.clone()),
            trip_id: Some(trip.id.clone()),
            channel: delivery.target.channel,
            title: message.title.clone(),
            body: message.body.clone(),
            status,
            error: delivery.outcome.detail().map(str::to_string),
            at: self.clock.now(),
        };
        if let Err(err) = self.audit.record(&entry).await {
            error!(trip_id = %trip.id, error = %err, "failed to write audit entry");
        }
    }

    async fn commit(&self, trip: &Trip, intent: Intent, guard: RowGuard) -> Result<bool, AppError> {
        let committed = match intent.key {
            IdempotencyKey::Marker { marker } => {
                self.trips
                    .set_marker(&trip.id, marker, guard, self.clock.now())
                    .await?
            }
            IdempotencyKey::StatusEdge { from, to } => {
                let expected = RowGuard {
                    status: from,
                    epoch: guard.epoch,
                };
                self.trips
                    .compare_and_set_status(&trip.id, expected, to)
                    .await?
            }
            IdempotencyKey::ReminderStamp { at } => {
                self.trips.stamp_reminder(&trip.id, at, guard).await?
            }
        };
        if !committed {
            debug!(trip_id = %trip.id, intent = %intent.kind, "row changed since evaluation; key not committed");
        }
        Ok(committed)
    }

    /// Consumes jobs until every sender is dropped, then waits for the jobs
    /// already started.
    pub async fn run_queue(self: Arc<Self>, mut queue: mpsc::Receiver<DispatchJob>) {
        let mut jobs = JoinSet::new();
        while let Some(job) = queue.recv().await {
            let dispatcher = self.clone();
            jobs.spawn(async move {
                let trip_id = job.trip.id.clone();
                let kind = job.intent.kind;
                if let Err(err) = dispatcher.dispatch(job).await {
                    error!(%trip_id, intent = %kind, error = %err, "dispatch failed");
                }
            });
            while let Some(finished) = jobs.try_join_next() {
                if let Err(err) = finished {
                    error!(error = %err, "dispatch task panicked");
                }
            }
        }
        let pending = jobs.len();
        if pending > 0 {
            info!(pending, "dispatch queue closed; draining started jobs");
        }
        while let Some(finished) = jobs.join_next().await {
            if let Err(err) = finished {
                error!(error = %err, "dispatch task panicked");
            }
        }
        debug!("dispatcher stopped");
    }
}

/// Whether `intent`, computed from `snapshot` under `guard`, is still owed
/// according to the `current` row.
fn still_pending(current: &Trip, snapshot: &Trip, intent: Intent, guard: RowGuard) -> bool {
    if current.checkin_epoch != guard.epoch || current.status == TripStatus::Completed {
        return false;
    }
    match intent.key {
        IdempotencyKey::Marker { marker } => !current.markers.is_set(marker),
        IdempotencyKey::StatusEdge { from, .. } => current.status == from,
        IdempotencyKey::ReminderStamp { .. } => {
            current.last_checkin_reminder == snapshot.last_checkin_reminder
        }
    }
}

async fn send_with_retry(
    channel: &dyn NotificationChannel,
    target: &DeliveryTarget,
    message: &RenderedMessage,
    retry: RetryPolicy,
) -> (SendOutcome, u32) {
    let mut attempts = 0;
    loop {
        attempts += 1;
        let outcome = channel.send(target, message).await;
        if !outcome.is_retryable() || attempts > retry.max_retries {
            return (outcome, attempts);
        }
        let delay = retry.delay_for(attempts - 1);
        debug!(
            channel = %target.channel,
            recipient = %target.label,
            attempt = attempts,
            ?delay,
            detail = outcome.detail().unwrap_or_default(),
            "transient send failure; retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        db::{init_pool, run_migrations},
        models::{
            contact::OwnerProfile,
            intent::IntentKind,
            trip::{Marker, NewTrip, TripStatus},
            user::User,
        },
        services::storage::SqliteStore,
    };
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::{collections::VecDeque, sync::Mutex};
    use tempfile::TempDir;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, hour, minute, 0).unwrap()
    }

    /// Replays scripted outcomes per address; anything unscripted is delivered.
    struct ScriptedChannel {
        channel: Channel,
        script: Mutex<HashMap<String, VecDeque<SendOutcome>>>,
        sent: Mutex<Vec<String>>,
    }

    impl ScriptedChannel {
        fn new(channel: Channel) -> Self {
            Self {
                channel,
                script: Mutex::new(HashMap::new()),
                sent: Mutex::new(Vec::new()),
            }
        }

        fn script(&self, address: &str, outcomes: Vec<SendOutcome>) {
            self.script
                .lock()
                .unwrap()
                .insert(address.to_string(), outcomes.into());
        }

        fn sent_to(&self, address: &str) -> usize {
            self.sent.lock().unwrap().iter().filter(|a| *a == address).count()
        }
    }

    #[async_trait]
    impl NotificationChannel for ScriptedChannel {
        fn channel(&self) -> Channel {
            self.channel
        }

        async fn send(&self, target: &DeliveryTarget, _message: &RenderedMessage) -> SendOutcome {
            self.sent.lock().unwrap().push(target.address.clone());
            self.script
                .lock()
                .unwrap()
                .get_mut(&target.address)
                .and_then(|queue| queue.pop_front())
                .unwrap_or(SendOutcome::Delivered)
        }
    }

    struct Fixture {
        store: Arc<SqliteStore>,
        push: Arc<ScriptedChannel>,
        email: Arc<ScriptedChannel>,
        inflight: InFlight,
        dispatcher: Dispatcher,
        _dir: TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dispatch.sqlite");
        std::fs::File::create(&path).unwrap();
        let pool = init_pool(&format!("sqlite://{}", path.to_string_lossy()))
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        let store = Arc::new(SqliteStore::new(pool));
        let clock = ManualClock::new(at(11, 0));
        let inflight = InFlight::new();
        let push = Arc::new(ScriptedChannel::new(Channel::Push));
        let email = Arc::new(ScriptedChannel::new(Channel::Email));
        let mut dispatcher = Dispatcher::new(
            store.clone(),
            MessageTemplates::default(),
            Arc::new(clock),
            RetryPolicy {
                max_retries: 3,
                base_delay: Duration::ZERO,
            },
            inflight.clone(),
        );
        dispatcher.register_channel(push.clone());
        dispatcher.register_channel(email.clone());
        Fixture {
            store,
            push,
            email,
            inflight,
            dispatcher,
            _dir: dir,
        }
    }

    async fn user(store: &SqliteStore, id: &str, name: &str, email: Option<&str>) {
        store
            .insert_user(&User {
                id: id.into(),
                display_name: name.into(),
                email: email.map(str::to_string),
                created_at: at(7, 0),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn revoked_flaky_and_valid_targets() {
        let fx = fixture().await;
        user(&fx.store, "owner", "Sam", None).await;
        user(&fx.store, "friend", "Alex", None).await;
        fx.store.register_device("friend", "revoked-token", at(7, 0)).await.unwrap();
        fx.store.register_device("friend", "flaky-token", at(7, 0)).await.unwrap();
        let contact = fx
            .store
            .insert_contact("owner", "Robin", "robin@example.com")
            .await
            .unwrap();

        let mut new = NewTrip::new("owner", "Ridge loop", at(9, 0), at(11, 0));
        new.contact_ids = vec![contact];
        let trip = fx.store.insert_trip(&new, at(8, 0)).await.unwrap();
        fx.store.add_friend_contact(&trip.id, "friend").await.unwrap();
        fx.store
            .compare_and_set_status(&trip.id, trip.guard(), TripStatus::Overdue)
            .await
            .unwrap();
        let trip = fx.store.load_trip(&trip.id).await.unwrap();

        fx.push.script(
            "revoked-token",
            vec![SendOutcome::PermanentlyInvalid("410: Unregistered".into())],
        );
        fx.push.script(
            "flaky-token",
            vec![SendOutcome::Transient("503".into()), SendOutcome::Transient("503".into())],
        );

        let intent = Intent::status_edge(
            IntentKind::ContactsOverdue,
            TripStatus::Overdue,
            TripStatus::OverdueNotified,
        );
        assert!(fx.inflight.try_claim(&trip.id, intent.kind));
        let report = fx
            .dispatcher
            .dispatch(DispatchJob {
                guard: trip.guard(),
                trip: trip.clone(),
                intent,
            })
            .await
            .unwrap();

        assert!(report.committed);
        assert_eq!(report.deliveries.len(), 3);
        assert_eq!(report.delivered(), 2);
        assert_eq!(fx.push.sent_to("revoked-token"), 1);
        assert_eq!(fx.push.sent_to("flaky-token"), 3);
        assert_eq!(fx.email.sent_to("robin@example.com"), 1);

        let logs = fx.store.notification_logs(&trip.id).await.unwrap();
        assert_eq!(logs.len(), 3);
        assert_eq!(logs.iter().filter(|log| log.status == "sent").count(), 2);
        assert_eq!(logs.iter().filter(|log| log.status == "invalid").count(), 1);

        assert_eq!(fx.store.device_tokens("friend").await.unwrap(), vec!["flaky-token"]);
        let stored = fx.store.load_trip(&trip.id).await.unwrap();
        assert_eq!(stored.status, TripStatus::OverdueNotified);
        assert!(!fx.inflight.is_claimed(&trip.id, intent.kind));
    }

    #[tokio::test]
    async fn exhausted_retries_still_commit() {
        let fx = fixture().await;
        user(&fx.store, "owner", "Sam", None).await;
        fx.store.register_device("owner", "owner-device", at(7, 0)).await.unwrap();
        let trip = fx
            .store
            .insert_trip(&NewTrip::new("owner", "Ridge loop", at(9, 0), at(11, 0)), at(8, 0))
            .await
            .unwrap();
        fx.push.script(
            "owner-device",
            vec![SendOutcome::Transient("timeout".into()); 4],
        );

        let report = fx
            .dispatcher
            .dispatch(DispatchJob {
                guard: trip.guard(),
                trip: trip.clone(),
                intent: Intent::marker(IntentKind::EtaReached, Marker::EtaReached),
            })
            .await
            .unwrap();

        assert!(report.committed);
        assert_eq!(report.deliveries[0].attempts, 4);
        let logs = fx.store.notification_logs(&trip.id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, "failed");
        assert_eq!(logs[0].error.as_deref(), Some("timeout"));
        let stored = fx.store.load_trip(&trip.id).await.unwrap();
        assert!(stored.markers.eta_reached);
        assert_eq!(stored.last_grace_warning, Some(at(11, 0)));
    }

    #[tokio::test]
    async fn commit_is_a_noop_after_checkin() {
        let fx = fixture().await;
        user(&fx.store, "owner", "Sam", None).await;
        let trip = fx
            .store
            .insert_trip(&NewTrip::new("owner", "Ridge loop", at(9, 0), at(11, 0)), at(8, 0))
            .await
            .unwrap();
        let guard = trip.guard();
        fx.store.check_in(&trip.id, at(11, 1)).await.unwrap();

        let report = fx
            .dispatcher
            .dispatch(DispatchJob {
                guard,
                trip: trip.clone(),
                intent: Intent::marker(IntentKind::LiveEtaTransition, Marker::EtaTransition),
            })
            .await
            .unwrap();
        assert!(!report.committed);
        assert!(!fx.store.load_trip(&trip.id).await.unwrap().markers.eta_transition);
    }

    #[tokio::test]
    async fn stale_contact_alert_is_not_sent_twice() {
        let fx = fixture().await;
        user(&fx.store, "owner", "Sam", None).await;
        let contact = fx
            .store
            .insert_contact("owner", "Robin", "robin@example.com")
            .await
            .unwrap();
        let mut new = NewTrip::new("owner", "Ridge loop", at(9, 0), at(11, 0));
        new.contact_ids = vec![contact];
        let trip = fx.store.insert_trip(&new, at(8, 0)).await.unwrap();
        fx.store
            .compare_and_set_status(&trip.id, trip.guard(), TripStatus::Overdue)
            .await
            .unwrap();
        // Read by a tick before the first alert committed.
        let stale = fx.store.load_trip(&trip.id).await.unwrap();
        let job = DispatchJob {
            guard: stale.guard(),
            trip: stale.clone(),
            intent: Intent::status_edge(
                IntentKind::ContactsOverdue,
                TripStatus::Overdue,
                TripStatus::OverdueNotified,
            ),
        };

        let first = fx.dispatcher.dispatch(job.clone()).await.unwrap();
        assert!(first.committed);
        assert!(!fx.inflight.is_claimed(&trip.id, IntentKind::ContactsOverdue));

        // The next tick claims the released intent from the same snapshot.
        assert!(fx.inflight.try_claim(&trip.id, IntentKind::ContactsOverdue));
        let second = fx.dispatcher.dispatch(job).await.unwrap();
        assert!(!second.committed);
        assert!(second.deliveries.is_empty());
        assert_eq!(fx.email.sent_to("robin@example.com"), 1);
        assert_eq!(fx.store.notification_logs(&trip.id).await.unwrap().len(), 1);
        assert!(!fx.inflight.is_claimed(&trip.id, IntentKind::ContactsOverdue));
    }

    #[tokio::test]
    async fn reminder_from_a_stale_row_is_dropped() {
        let fx = fixture().await;
        user(&fx.store, "owner", "Sam", None).await;
        fx.store.register_device("owner", "owner-device", at(7, 0)).await.unwrap();
        let trip = fx
            .store
            .insert_trip(&NewTrip::new("owner", "Ridge loop", at(9, 0), at(11, 0)), at(8, 0))
            .await
            .unwrap();
        fx.store
            .compare_and_set_status(&trip.id, trip.guard(), TripStatus::Active)
            .await
            .unwrap();
        let stale = fx.store.load_trip(&trip.id).await.unwrap();

        let first = DispatchJob {
            guard: stale.guard(),
            trip: stale.clone(),
            intent: Intent::reminder(at(9, 30)),
        };
        assert!(fx.dispatcher.dispatch(first).await.unwrap().committed);

        let late = DispatchJob {
            guard: stale.guard(),
            trip: stale,
            intent: Intent::reminder(at(9, 31)),
        };
        let report = fx.dispatcher.dispatch(late).await.unwrap();
        assert!(!report.committed);
        assert_eq!(fx.push.sent_to("owner-device"), 1);
        assert_eq!(
            fx.store.load_trip(&trip.id).await.unwrap().last_checkin_reminder,
            Some(at(9, 30))
        );
    }

    #[tokio::test]
    async fn closed_queue_drains_started_jobs() {
        let fx = fixture().await;
        user(&fx.store, "owner", "Sam", None).await;
        fx.store.register_device("owner", "owner-device", at(7, 0)).await.unwrap();
        let trip = fx
            .store
            .insert_trip(&NewTrip::new("owner", "Ridge loop", at(9, 0), at(11, 0)), at(8, 0))
            .await
            .unwrap();
        fx.push.script("owner-device", vec![SendOutcome::Transient("503".into())]);

        let mut slow = Dispatcher::new(
            fx.store.clone(),
            MessageTemplates::default(),
            Arc::new(ManualClock::new(at(11, 0))),
            RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(50),
            },
            fx.inflight.clone(),
        );
        slow.register_channel(fx.push.clone());

        let (tx, rx) = mpsc::channel(8);
        let worker = tokio::spawn(Arc::new(slow).run_queue(rx));
        for (kind, marker) in [
            (IntentKind::EtaReached, Marker::EtaReached),
            (IntentKind::ApproachingEta, Marker::ApproachingEta),
        ] {
            assert!(fx.inflight.try_claim(&trip.id, kind));
            tx.send(DispatchJob {
                guard: trip.guard(),
                trip: trip.clone(),
                intent: Intent::marker(kind, marker),
            })
            .await
            .unwrap();
        }
        drop(tx);
        worker.await.unwrap();

        let stored = fx.store.load_trip(&trip.id).await.unwrap();
        assert!(stored.markers.eta_reached);
        assert!(stored.markers.approaching_eta);
        assert_eq!(fx.push.sent_to("owner-device"), 3);
        assert!(!fx.inflight.is_claimed(&trip.id, IntentKind::EtaReached));
        assert!(!fx.inflight.is_claimed(&trip.id, IntentKind::ApproachingEta));
    }

    #[test]
    fn audience_resolution() {
        let mut trip = Trip {
            id: "trip-1".into(),
            user_id: "owner".into(),
            title: "Ridge loop".into(),
            status: TripStatus::Overdue,
            start_at: at(9, 0),
            eta_at: at(11, 0),
            grace_minutes: 30,
            checkin_interval_min: 30,
            quiet_hours: None,
            utc_offset_minutes: 0,
            contact_ids: vec![1],
            last_checkin_at: None,
            last_checkin_reminder: None,
            last_grace_warning: None,
            markers: Default::default(),
            extended_count: 0,
            notify_self: false,
            checkin_epoch: 0,
        };
        let people = TripAudience {
            owner: OwnerProfile {
                user_id: "owner".into(),
                display_name: "Sam".into(),
                email: Some("sam@example.com".into()),
                device_tokens: vec!["owner-device".into()],
                live_activity_token: Some("widget".into()),
            },
            contacts: vec![
                SafetyContact::Email {
                    id: 1,
                    name: "Robin".into(),
                    email: "robin@example.com".into(),
                },
                SafetyContact::Friend {
                    user_id: "friend".into(),
                    display_name: "Alex".into(),
                    email: Some("robin@example.com".into()),
                    device_tokens: vec!["friend-device".into()],
                },
            ],
        };

        let owner = resolve_targets(Audience::Owner, &trip, &people);
        assert_eq!(owner.len(), 1);
        assert_eq!(owner[0].address, "owner-device");

        let widget = resolve_targets(Audience::OwnerLiveActivity, &trip, &people);
        assert_eq!(widget[0].channel, Channel::LiveActivity);

        let contacts = resolve_targets(Audience::Contacts, &trip, &people);
        let addresses: Vec<_> = contacts.iter().map(|t| t.address.as_str()).collect();
        assert_eq!(addresses, vec!["robin@example.com", "friend-device"]);

        trip.notify_self = true;
        let with_owner = resolve_targets(Audience::Contacts, &trip, &people);
        assert_eq!(with_owner[0].address, "owner-device");
        assert_eq!(with_owner.len(), 3);

        let everyone = resolve_targets(Audience::OwnerAndContacts, &trip, &people);
        assert_eq!(everyone.len(), 3);
    }

    #[test]
    fn backoff_doubles() {
        let retry = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
        };
        assert_eq!(retry.delay_for(0), Duration::from_millis(500));
        assert_eq!(retry.delay_for(2), Duration::from_secs(2));
    }
}
