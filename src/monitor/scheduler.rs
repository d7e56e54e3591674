use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use chrono::{DateTime, Utc};
use tokio::{
    sync::{mpsc, watch, Semaphore},
    task::{JoinHandle, JoinSet},
    time::MissedTickBehavior,
};
use tracing::{debug, error, info, warn};

use crate::{
    clock::Clock,
    config::MonitorConfig,
    error::AppError,
    models::trip::Trip,
    monitor::{
        evaluator::{evaluate, Windows},
        inflight::InFlight,
    },
    services::{dispatcher::DispatchJob, repository::TripRepository},
};

/// Counters for one tick, logged when it finishes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub due: usize,
    pub malformed: usize,
    pub advanced: usize,
    pub queued: usize,
    pub already_in_flight: usize,
    pub deferred: usize,
    pub lost_races: usize,
    pub failed: usize,
}

impl TickSummary {
    fn absorb(&mut self, trip: TripOutcome) {
        self.advanced += usize::from(trip.advanced);
        self.queued += trip.queued;
        self.already_in_flight += trip.already_in_flight;
        self.deferred += trip.deferred;
        self.lost_races += usize::from(trip.lost_race);
        self.failed += usize::from(trip.failed);
    }
}

#[derive(Debug, Default)]
struct TripOutcome {
    advanced: bool,
    queued: usize,
    already_in_flight: usize,
    deferred: usize,
    lost_race: bool,
    failed: bool,
}

/// Held while a tick's evaluation runs; dropping it lets the next tick start.
pub struct TickGuard {
    running: Arc<AtomicBool>,
}

impl Drop for TickGuard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

pub struct Scheduler {
    trips: Arc<dyn TripRepository>,
    clock: Arc<dyn Clock>,
    config: MonitorConfig,
    windows: Windows,
    inflight: InFlight,
    queue: mpsc::Sender<DispatchJob>,
    running: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(
        trips: Arc<dyn TripRepository>,
        clock: Arc<dyn Clock>,
        config: MonitorConfig,
        inflight: InFlight,
        queue: mpsc::Sender<DispatchJob>,
    ) -> Self {
        Self {
            windows: Windows::from(&config),
            trips,
            clock,
            config,
            inflight,
            queue,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// `None` while another tick is still evaluating.
    pub fn begin_tick(&self) -> Option<TickGuard> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TickGuard {
                running: self.running.clone(),
            })
    }

    /// Ticks until `shutdown` flips, then waits for the tick in progress so
    /// everything it evaluated reaches the queue.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut current: Option<JoinHandle<()>> = None;

        info!(
            interval = ?self.config.tick_interval,
            lookahead_minutes = self.config.lookahead.num_minutes(),
            concurrency = self.config.eval_concurrency,
            "trip monitor started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(guard) = self.begin_tick() else {
                        warn!("previous tick still evaluating; skipping this one");
                        continue;
                    };
                    let this = self.clone();
                    current = Some(tokio::spawn(async move {
                        let _guard = guard;
                        match this.run_tick().await {
                            Ok(summary) => debug!(?summary, "tick finished"),
                            Err(err) => error!(error = %err, "tick failed"),
                        }
                    }));
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Some(handle) = current {
            if let Err(err) = handle.await {
                error!(error = %err, "tick task panicked");
            }
        }
        info!("trip monitor stopped");
    }

    /// Loads due trips and evaluates them on a bounded pool. Returns once every
    /// trip has been evaluated and its work queued, not delivered.
    pub async fn run_tick(self: &Arc<Self>) -> Result<TickSummary, AppError> {
        let now = self.clock.now();
        let rows = self.trips.list_due_trips(now + self.config.lookahead).await?;
        let mut summary = TickSummary {
            due: rows.len(),
            ..TickSummary::default()
        };

        let permits = Arc::new(Semaphore::new(self.config.eval_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for row in rows {
            let trip = match row {
                Ok(trip) => trip,
                Err(err) => {
                    warn!(error = %err, "skipping malformed trip row");
                    summary.malformed += 1;
                    continue;
                }
            };
            let permit = permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|err| AppError::Other(err.into()))?;
            let this = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                this.process_trip(trip, now).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => summary.absorb(outcome),
                Err(err) => {
                    error!(error = %err, "trip evaluation panicked");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn process_trip(&self, trip: Trip, now: DateTime<Utc>) -> TripOutcome {
        let mut outcome = TripOutcome::default();
        let eval = evaluate(&trip, now, &self.windows);

        for kind in &eval.deferred {
            debug!(trip_id = %trip.id, intent = %kind, "outside allowed hours; deferred");
        }
        outcome.deferred = eval.deferred.len();
        if eval.is_noop() {
            return outcome;
        }

        let mut guard = trip.guard();
        if let Some(next) = eval.advance_to() {
            match self
                .trips
                .compare_and_set_status(&trip.id, guard, next)
                .await
            {
                Ok(true) => {
                    info!(trip_id = %trip.id, from = %trip.status, to = %next, "trip advanced");
                    guard.status = next;
                    outcome.advanced = true;
                }
                Ok(false) => {
                    info!(trip_id = %trip.id, "trip changed since it was read; dropping evaluation");
                    outcome.lost_race = true;
                    return outcome;
                }
                Err(err) => {
                    error!(trip_id = %trip.id, error = %err, "status commit failed");
                    outcome.failed = true;
                    return outcome;
                }
            }
        }

        let mut trip = trip;
        trip.status = guard.status;
        for intent in eval.intents {
            if !self.inflight.try_claim(&trip.id, intent.kind) {
                outcome.already_in_flight += 1;
                continue;
            }
            let job = DispatchJob {
                trip: trip.clone(),
                intent,
                guard,
            };
            if self.queue.send(job).await.is_err() {
                self.inflight.release(&trip.id, intent.kind);
                error!(trip_id = %trip.id, intent = %intent.kind, "dispatch queue closed");
                outcome.failed = true;
                continue;
            }
            outcome.queued += 1;
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        db::{init_pool, run_migrations},
        models::{
            intent::IntentKind,
            trip::{NewTrip, TripStatus},
            user::User,
        },
        services::storage::SqliteStore,
    };
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, hour, minute, 0).unwrap()
    }

    struct Fixture {
        store: Arc<SqliteStore>,
        clock: ManualClock,
        inflight: InFlight,
        scheduler: Arc<Scheduler>,
        jobs: mpsc::Receiver<DispatchJob>,
        _dir: TempDir,
    }

    async fn fixture() -> Fixture {
        fixture_with(MonitorConfig::default()).await
    }

    async fn fixture_with(config: MonitorConfig) -> Fixture {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("monitor.sqlite");
        std::fs::File::create(&path).unwrap();
        let pool = init_pool(&format!("sqlite://{}", path.to_string_lossy()))
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        let store = Arc::new(SqliteStore::new(pool));
        store
            .insert_user(&User {
                id: "owner".into(),
                display_name: "Sam".into(),
                email: None,
                created_at: at(7, 0),
            })
            .await
            .unwrap();

        let clock = ManualClock::new(at(8, 0));
        let inflight = InFlight::new();
        let (tx, jobs) = mpsc::channel(64);
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            Arc::new(clock.clone()),
            config,
            inflight.clone(),
            tx,
        ));
        Fixture {
            store,
            clock,
            inflight,
            scheduler,
            jobs,
            _dir: dir,
        }
    }

    fn drain(jobs: &mut mpsc::Receiver<DispatchJob>) -> Vec<DispatchJob> {
        let mut out = Vec::new();
        while let Ok(job) = jobs.try_recv() {
            out.push(job);
        }
        out
    }

    #[tokio::test]
    async fn start_commits_status_and_queues_once() {
        let mut fx = fixture().await;
        let trip = fx
            .store
            .insert_trip(&NewTrip::new("owner", "Ridge loop", at(9, 0), at(11, 0)), at(8, 0))
            .await
            .unwrap();

        fx.clock.set(at(9, 0));
        let summary = fx.scheduler.run_tick().await.unwrap();
        assert_eq!(summary.due, 1);
        assert_eq!(summary.advanced, 1);
        assert_eq!(summary.queued, 1);

        let jobs = drain(&mut fx.jobs);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].intent.kind, IntentKind::TripStarted);
        assert_eq!(jobs[0].guard.status, TripStatus::Active);
        assert_eq!(jobs[0].trip.status, TripStatus::Active);
        assert_eq!(
            fx.store.load_trip(&trip.id).await.unwrap().status,
            TripStatus::Active
        );
        assert!(fx.inflight.is_claimed(&trip.id, IntentKind::TripStarted));
    }

    #[tokio::test]
    async fn pending_intents_are_not_requeued() {
        let mut fx = fixture().await;
        let mut new = NewTrip::new("owner", "Ridge loop", at(9, 0), at(11, 0));
        new.checkin_interval_min = 0;
        fx.store.insert_trip(&new, at(8, 0)).await.unwrap();

        fx.clock.set(at(11, 0));
        fx.scheduler.run_tick().await.unwrap();
        let first: Vec<_> = drain(&mut fx.jobs).iter().map(|j| j.intent.kind).collect();
        assert!(first.contains(&IntentKind::EtaReached));
        assert!(first.contains(&IntentKind::LiveEtaTransition));

        fx.clock.set(at(11, 1));
        let summary = fx.scheduler.run_tick().await.unwrap();
        assert_eq!(summary.queued, 0);
        assert_eq!(summary.already_in_flight, 2);
        assert!(drain(&mut fx.jobs).is_empty());
    }

    #[tokio::test]
    async fn checkin_between_read_and_commit_wins() {
        let mut fx = fixture().await;
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

        fx.store.check_in(&trip.id, at(11, 0)).await.unwrap();
        let outcome = fx.scheduler.process_trip(stale, at(11, 0)).await;
        assert!(outcome.lost_race);
        assert!(drain(&mut fx.jobs).is_empty());
        assert_eq!(
            fx.store.load_trip(&trip.id).await.unwrap().status,
            TripStatus::Active
        );
    }

    #[tokio::test]
    async fn malformed_row_does_not_abort_tick() {
        let mut fx = fixture().await;
        let good = fx
            .store
            .insert_trip(&NewTrip::new("owner", "Good", at(9, 0), at(11, 0)), at(8, 0))
            .await
            .unwrap();
        let bad = fx
            .store
            .insert_trip(&NewTrip::new("owner", "Bad", at(9, 0), at(11, 0)), at(8, 0))
            .await
            .unwrap();
        sqlx::query("UPDATE trips SET grace_minutes = -5 WHERE id = ?")
            .bind(&bad.id)
            .execute(fx.store.pool())
            .await
            .unwrap();

        fx.clock.set(at(9, 0));
        let summary = fx.scheduler.run_tick().await.unwrap();
        assert_eq!(summary.malformed, 1);
        assert_eq!(summary.advanced, 1);
        let jobs = drain(&mut fx.jobs);
        assert!(jobs.iter().all(|job| job.trip.id == good.id));
    }

    #[tokio::test]
    async fn lost_start_announcement_is_requeued() {
        let mut fx = fixture().await;
        let trip = fx
            .store
            .insert_trip(&NewTrip::new("owner", "Ridge loop", at(9, 0), at(11, 0)), at(8, 0))
            .await
            .unwrap();

        fx.clock.set(at(9, 0));
        fx.scheduler.run_tick().await.unwrap();
        // The job dies with the process: status is committed, the marker is not,
        // and a restarted monitor holds no claims.
        assert_eq!(drain(&mut fx.jobs).len(), 1);
        fx.inflight.release(&trip.id, IntentKind::TripStarted);

        fx.clock.set(at(9, 1));
        let summary = fx.scheduler.run_tick().await.unwrap();
        assert_eq!(summary.advanced, 0);
        assert_eq!(summary.queued, 1);
        let jobs = drain(&mut fx.jobs);
        assert_eq!(jobs[0].intent.kind, IntentKind::TripStarted);
        assert_eq!(jobs[0].guard.status, TripStatus::Active);
    }

    #[tokio::test]
    async fn trip_created_under_way_is_not_announced() {
        let mut fx = fixture().await;
        let mut new = NewTrip::new("owner", "Already out", at(9, 0), at(11, 0));
        new.checkin_interval_min = 0;
        fx.store.insert_trip(&new, at(9, 5)).await.unwrap();

        fx.clock.set(at(9, 6));
        let summary = fx.scheduler.run_tick().await.unwrap();
        assert_eq!(summary.due, 1);
        assert_eq!(summary.queued, 0);
        assert!(drain(&mut fx.jobs).is_empty());
    }

    #[tokio::test]
    async fn run_skips_ticks_while_one_is_in_progress() {
        let config = MonitorConfig {
            tick_interval: std::time::Duration::from_millis(10),
            ..MonitorConfig::default()
        };
        let mut fx = fixture_with(config).await;
        let trip = fx
            .store
            .insert_trip(&NewTrip::new("owner", "Ridge loop", at(9, 0), at(11, 0)), at(8, 0))
            .await
            .unwrap();
        fx.clock.set(at(9, 0));

        let held = fx.scheduler.begin_tick().expect("first tick");
        let (stop, shutdown) = watch::channel(false);
        let loop_task = tokio::spawn(fx.scheduler.clone().run(shutdown));
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        stop.send(true).unwrap();
        loop_task.await.unwrap();

        assert!(drain(&mut fx.jobs).is_empty());
        assert_eq!(
            fx.store.load_trip(&trip.id).await.unwrap().status,
            TripStatus::Scheduled
        );

        drop(held);
        let (stop, shutdown) = watch::channel(false);
        let loop_task = tokio::spawn(fx.scheduler.clone().run(shutdown));
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        stop.send(true).unwrap();
        loop_task.await.unwrap();

        let jobs = drain(&mut fx.jobs);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].intent.kind, IntentKind::TripStarted);
        assert_eq!(
            fx.store.load_trip(&trip.id).await.unwrap().status,
            TripStatus::Active
        );
    }

    #[tokio::test]
    async fn overlapping_tick_is_refused() {
        let fx = fixture().await;
        let first = fx.scheduler.begin_tick();
        assert!(first.is_some());
        assert!(fx.scheduler.begin_tick().is_none());
        drop(first);
        assert!(fx.scheduler.begin_tick().is_some());
    }
}
