//! Scheduler core: the worker loop and its handles.

use std::sync::Arc;
use std::time::Duration;

use fleet_autoscale::{Demand, ModelUpdater, UpdaterSettings};
use fleet_core::{
    Clock, EventSink, FleetBackend, FleetConfig, InstanceProfile, ReserveRequest, SchedulingRequest, system_clock,
};
use fleet_placement::{FitOrder, FleetSnapshot};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::callback::{SchedulingCallback, SchedulingOutcome};
use crate::error::SchedulingError;
use crate::loader::{LoaderSettings, ModelLoader};
use crate::shortfall::{FutureReservations, Shortfall};

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    pub poll_interval: Duration,
    pub reservation_timeout: Duration,
    pub min_container_cpu: u32,
    pub min_container_memory: u32,
    pub spread_on_overflow: bool,
    /// Task definition every agent container is started from.
    pub task_definition: String,
    /// Profile the fleet group launches. Bounds requests while no fresh
    /// host exists.
    pub default_profile: InstanceProfile,
}

impl From<&FleetConfig> for SchedulerSettings {
    fn from(config: &FleetConfig) -> Self {
        Self {
            poll_interval: config.scheduler.poll_interval,
            reservation_timeout: config.scheduler.reservation_timeout,
            min_container_cpu: config.scheduler.min_container_cpu,
            min_container_memory: config.scheduler.min_container_memory,
            spread_on_overflow: config.scheduler.spread_on_overflow,
            task_definition: config.cluster.task_definition.clone(),
            default_profile: config.default_profile(),
        }
    }
}

enum Command {
    Schedule(SchedulingRequest, Box<dyn SchedulingCallback>),
    Reserve(ReserveRequest),
    /// Answered once everything queued before it, including the
    /// post-pass scale decision, is done.
    Sync(oneshot::Sender<()>),
}

/// Cloneable producer side of a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: mpsc::UnboundedSender<Command>,
    closed: watch::Receiver<bool>,
}

impl SchedulerHandle {
    /// Queue a request. The callback fires exactly once, on the worker.
    pub fn schedule(&self, request: SchedulingRequest, callback: impl SchedulingCallback) {
        let callback: Box<dyn SchedulingCallback> = Box::new(callback);
        if *self.closed.borrow() {
            callback.handle(Err(SchedulingError::ShuttingDown));
            return;
        }
        debug!(request = %request.id, group = %request.group, "request queued");
        if let Err(mpsc::error::SendError(Command::Schedule(_, callback))) =
            self.commands.send(Command::Schedule(request, callback))
        {
            callback.handle(Err(SchedulingError::ShuttingDown));
        }
    }

    /// Queue a request and wait for its outcome.
    pub async fn schedule_and_wait(&self, request: SchedulingRequest) -> SchedulingOutcome {
        let (tx, rx) = oneshot::channel();
        self.schedule(request, tx);
        rx.await.unwrap_or(Err(SchedulingError::ShuttingDown))
    }

    /// Promise capacity to work that has not been queued yet.
    pub fn reserve_future_capacity(&self, request: ReserveRequest) -> Result<(), SchedulingError> {
        if *self.closed.borrow() {
            return Err(SchedulingError::ShuttingDown);
        }
        self.commands
            .send(Command::Reserve(request))
            .map_err(|_| SchedulingError::ShuttingDown)
    }

    /// Wait until every command submitted so far has been fully processed.
    pub async fn sync(&self) -> Result<(), SchedulingError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Sync(tx))
            .map_err(|_| SchedulingError::ShuttingDown)?;
        rx.await.map_err(|_| SchedulingError::ShuttingDown)
    }
}

/// A running scheduler. Dropping it stops the worker.
pub struct Scheduler {
    handle: SchedulerHandle,
    shutdown_tx: watch::Sender<bool>,
    worker: JoinHandle<()>,
}

impl Scheduler {
    /// Spawn the worker on the current tokio runtime.
    pub fn spawn(backend: Arc<dyn FleetBackend>, events: Arc<dyn EventSink>, config: &FleetConfig) -> Self {
        Self::spawn_with_clock(backend, events, config, system_clock())
    }

    pub fn spawn_with_clock(
        backend: Arc<dyn FleetBackend>,
        events: Arc<dyn EventSink>,
        config: &FleetConfig,
        clock: Clock,
    ) -> Self {
        let loader = ModelLoader::new(
            backend.clone(),
            events.clone(),
            LoaderSettings::from(config),
            clock.clone(),
        );
        let updater = ModelUpdater::new(backend.clone(), events, UpdaterSettings::from(config));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = Worker {
            commands: commands_rx,
            backend,
            loader,
            updater,
            settings: SchedulerSettings::from(config),
            clock,
            shortfall: Shortfall::new(),
            reservations: FutureReservations::new(),
        };
        let worker = tokio::spawn(worker.run(shutdown_rx.clone()));

        info!(
            cluster = %config.cluster.name,
            fleet_group = %config.cluster.fleet_group,
            poll_interval_secs = config.scheduler.poll_interval.as_secs(),
            "scheduler started"
        );
        Self {
            handle: SchedulerHandle {
                commands: commands_tx,
                closed: shutdown_rx,
            },
            shutdown_tx,
            worker,
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    pub fn schedule(&self, request: SchedulingRequest, callback: impl SchedulingCallback) {
        self.handle.schedule(request, callback);
    }

    pub async fn schedule_and_wait(&self, request: SchedulingRequest) -> SchedulingOutcome {
        self.handle.schedule_and_wait(request).await
    }

    pub fn reserve_future_capacity(&self, request: ReserveRequest) -> Result<(), SchedulingError> {
        self.handle.reserve_future_capacity(request)
    }

    pub async fn sync(&self) -> Result<(), SchedulingError> {
        self.handle.sync().await
    }

    /// Stop accepting work, let the in-flight pass finish, and fail
    /// whatever is still queued with [`SchedulingError::ShuttingDown`].
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.worker.await {
            error!(error = %e, "scheduler worker panicked");
        }
        info!("scheduler stopped");
    }
}

#[derive(Debug, Default)]
struct PassStats {
    placed: usize,
    discarded: usize,
    failed: usize,
}

struct Worker {
    commands: mpsc::UnboundedReceiver<Command>,
    backend: Arc<dyn FleetBackend>,
    loader: ModelLoader,
    updater: ModelUpdater,
    settings: SchedulerSettings,
    clock: Clock,
    shortfall: Shortfall,
    reservations: FutureReservations,
}

impl Worker {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                next = tokio::time::timeout(self.settings.poll_interval, self.commands.recv()) => match next {
                    Ok(Some(Command::Schedule(request, callback))) => self.run_pass(request, callback).await,
                    Ok(Some(Command::Reserve(request))) => self.reserve(request),
                    Ok(Some(Command::Sync(tx))) => {
                        let _ = tx.send(());
                    }
                    Ok(None) => break,
                    Err(_) => self.check_scale_down().await,
                },
            }
        }

        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Schedule(_, callback) => callback.handle(Err(SchedulingError::ShuttingDown)),
                Command::Reserve(_) => {}
                Command::Sync(tx) => {
                    let _ = tx.send(());
                }
            }
        }
        debug!("scheduler worker exited");
    }

    fn reserve(&mut self, mut request: ReserveRequest) {
        if request.created_at == 0 {
            request.created_at = (self.clock)();
        }
        self.reservations.reserve(request);
    }

    // ── Scheduling pass ────────────────────────────────────────────

    async fn run_pass(&mut self, request: SchedulingRequest, callback: Box<dyn SchedulingCallback>) {
        let mut syncs = Vec::new();

        let mut snapshot = match self.loader.load().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(error = %e, "cannot load fleet, failing queued requests");
                let err = SchedulingError::from(e);
                callback.handle(Err(err.clone()));
                while let Ok(command) = self.commands.try_recv() {
                    match command {
                        Command::Schedule(_, callback) => callback.handle(Err(err.clone())),
                        Command::Reserve(request) => self.reserve(request),
                        Command::Sync(tx) => syncs.push(tx),
                    }
                }
                for tx in syncs {
                    let _ = tx.send(());
                }
                return;
            }
        };

        let mut stats = PassStats::default();
        self.place(&mut snapshot, request, callback, &mut stats).await;
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Schedule(request, callback) => {
                    self.place(&mut snapshot, request, callback, &mut stats).await;
                }
                Command::Reserve(request) => self.reserve(request),
                Command::Sync(tx) => syncs.push(tx),
            }
        }

        self.reservations
            .expire((self.clock)(), self.settings.reservation_timeout);
        let (reserved_cpu, reserved_memory) = self.reservations.totals();
        let demand = Demand {
            lacking_cpu: self.shortfall.lacking_cpu(),
            lacking_memory: self.shortfall.lacking_memory(),
            some_discarded: stats.discarded > 0,
            reserved_cpu,
            reserved_memory,
        };
        info!(
            placed = stats.placed,
            discarded = stats.discarded,
            failed = stats.failed,
            lacking_cpu = demand.lacking_cpu,
            lacking_memory = demand.lacking_memory,
            utilization = snapshot.utilization(),
            "scheduling pass complete"
        );
        self.updater.update_model(&snapshot, &demand).await;

        for tx in syncs {
            let _ = tx.send(());
        }
    }

    async fn place(
        &mut self,
        snapshot: &mut FleetSnapshot,
        request: SchedulingRequest,
        callback: Box<dyn SchedulingCallback>,
        stats: &mut PassStats,
    ) {
        if let Some((max_cpu, max_memory)) = self.exceeds_fleet(snapshot, &request) {
            warn!(request = %request.id, cpu = request.cpu, memory = request.memory, "request larger than any instance");
            stats.failed += 1;
            callback.handle(Err(SchedulingError::RequestTooLarge {
                cpu: request.cpu,
                memory: request.memory,
                max_cpu,
                max_memory,
            }));
            return;
        }

        let order = if self.settings.spread_on_overflow && self.shortfall.is_overflowing() {
            FitOrder::Emptiest
        } else {
            FitOrder::Tightest
        };
        let Some(idx) = snapshot.best_fit(request.cpu, request.memory, order) else {
            if self.shortfall.record_unplaced(&request) {
                debug!(request = %request.id, cpu = request.cpu, memory = request.memory, "added to shortfall");
            }
            stats.discarded += 1;
            callback.handle(Err(SchedulingError::CapacityExhausted));
            return;
        };

        snapshot.place(idx, request.cpu, request.memory);
        let host = snapshot.host(idx).host_ref();
        match self
            .backend
            .start_task(snapshot.cluster(), &host, &request, &self.settings.task_definition)
            .await
        {
            Ok(result) => {
                debug!(request = %request.id, instance = %host.instance_id, "request placed");
                self.reservations.release_for(&request);
                self.shortfall.record_placed(
                    &request,
                    self.settings.min_container_cpu,
                    self.settings.min_container_memory,
                );
                stats.placed += 1;
                callback.handle(Ok(result));
            }
            Err(e) => {
                error!(request = %request.id, instance = %host.instance_id, error = %e, "start task failed");
                stats.failed += 1;
                callback.handle(Err(e.into()));
            }
        }
    }

    /// The (cpu, memory) bound a request can never be placed under, when it
    /// exceeds that bound. Fresh hosts decide; an empty fleet falls back to
    /// the profile the group launches.
    fn exceeds_fleet(&self, snapshot: &FleetSnapshot, request: &SchedulingRequest) -> Option<(u32, u32)> {
        let profile = &self.settings.default_profile;
        let fits = snapshot
            .fits_on_any(request.cpu, request.memory)
            .unwrap_or(request.cpu <= profile.cpu && request.memory <= profile.memory);
        if fits {
            return None;
        }
        Some(snapshot.largest_fresh().unwrap_or((profile.cpu, profile.memory)))
    }

    // ── Idle check ─────────────────────────────────────────────────

    async fn check_scale_down(&mut self) {
        let snapshot = match self.loader.load().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(error = %e, "failed to load fleet for scale down");
                return;
            }
        };
        self.reservations
            .expire((self.clock)(), self.settings.reservation_timeout);
        let (reserved_cpu, reserved_memory) = self.reservations.totals();
        let demand = Demand {
            reserved_cpu,
            reserved_memory,
            ..Demand::default()
        };
        let report = self.updater.scale_down(&snapshot, &demand).await;
        debug!(purged = report.purged, terminated = report.terminated, "idle scale-down check");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::memory::{InMemoryBackend, Operation, RecordingEventSink};
    use fleet_core::{InstanceProfile, PlacementOutcome, fixed_clock};

    const NOW: u64 = 1_700_000_000;

    fn small() -> InstanceProfile {
        InstanceProfile::new("small", 100, 100)
    }

    fn config() -> FleetConfig {
        let mut config = FleetConfig::default();
        config.cluster.fleet_group = "agents".to_string();
        config.scheduler.min_container_cpu = 10;
        config.scheduler.min_container_memory = 10;
        config.instances = vec![small()];
        config.scaling.default_instance = "small".to_string();
        config
    }

    fn spawn(backend: &InMemoryBackend) -> Scheduler {
        Scheduler::spawn_with_clock(
            Arc::new(backend.clone()),
            Arc::new(RecordingEventSink::new()),
            &config(),
            fixed_clock(NOW),
        )
    }

    #[tokio::test]
    async fn places_on_tightest_host() {
        let backend = InMemoryBackend::new("agents", 10);
        backend.add_host(&small(), 10, 10, NOW - 3600);
        let tight = backend.add_host(&small(), 60, 60, NOW - 3600);
        let scheduler = spawn(&backend);

        let result = scheduler
            .schedule_and_wait(SchedulingRequest::new("PLAN", "PLAN-1", 20, 20))
            .await
            .unwrap();
        assert_eq!(result.instance_id, tight);
        assert!(matches!(result.outcome(), PlacementOutcome::Started { .. }));
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn request_larger_than_any_instance_is_permanent() {
        let backend = InMemoryBackend::new("agents", 10);
        backend.add_host(&small(), 0, 0, NOW - 3600);
        let scheduler = spawn(&backend);

        let err = scheduler
            .schedule_and_wait(SchedulingRequest::new("PLAN", "PLAN-1", 50, 500))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulingError::RequestTooLarge { max_memory: 100, .. }));
        assert!(!err.is_retryable());
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn empty_fleet_bounds_requests_by_default_profile() {
        let backend = InMemoryBackend::new("agents", 10);
        let scheduler = spawn(&backend);

        let err = scheduler
            .schedule_and_wait(SchedulingRequest::new("PLAN", "PLAN-1", 50, 500))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SchedulingError::RequestTooLarge {
                cpu: 50,
                memory: 500,
                max_cpu: 100,
                max_memory: 100,
            }
        );

        let err = scheduler
            .schedule_and_wait(SchedulingRequest::new("PLAN", "PLAN-2", 50, 50))
            .await
            .unwrap_err();
        assert_eq!(err, SchedulingError::CapacityExhausted);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn load_failure_fails_request_as_retryable() {
        let backend = InMemoryBackend::new("agents", 10);
        backend.fail_on(Operation::ListClusterMembers);
        let scheduler = spawn(&backend);

        let err = scheduler
            .schedule_and_wait(SchedulingRequest::new("PLAN", "PLAN-1", 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulingError::Backend(_)));
        assert!(err.is_retryable());
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn start_task_failure_affects_only_that_request() {
        let backend = InMemoryBackend::new("agents", 10);
        backend.add_host(&small(), 0, 0, NOW - 3600);
        backend.fail_on(Operation::StartTask);
        let scheduler = spawn(&backend);

        let err = scheduler
            .schedule_and_wait(SchedulingRequest::new("PLAN", "PLAN-1", 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulingError::Backend(_)));

        backend.clear_failures();
        assert!(
            scheduler
                .schedule_and_wait(SchedulingRequest::new("PLAN", "PLAN-2", 1, 1))
                .await
                .is_ok()
        );
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn schedule_after_shutdown_fails() {
        let backend = InMemoryBackend::new("agents", 10);
        let scheduler = spawn(&backend);
        let handle = scheduler.handle();
        scheduler.shutdown().await;

        let outcome = handle
            .schedule_and_wait(SchedulingRequest::new("PLAN", "PLAN-1", 1, 1))
            .await;
        assert_eq!(outcome, Err(SchedulingError::ShuttingDown));
        assert_eq!(
            handle.reserve_future_capacity(ReserveRequest::new("PLAN", vec![], 1, 1)),
            Err(SchedulingError::ShuttingDown)
        );
    }

    #[tokio::test]
    async fn idle_worker_runs_scale_down_check() {
        let backend = InMemoryBackend::new("agents", 10);
        backend.add_host(&small(), 50, 50, NOW - 3600);
        let stale = backend.add_host(&small(), 0, 0, NOW - 8 * 86400);
        let mut config = config();
        config.scheduler.poll_interval = Duration::from_millis(20);
        let scheduler = Scheduler::spawn_with_clock(
            Arc::new(backend.clone()),
            Arc::new(RecordingEventSink::new()),
            &config,
            fixed_clock(NOW),
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(backend.detached(), vec![(stale, true)]);
        scheduler.shutdown().await;
    }
}
