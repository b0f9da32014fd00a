//! Ties the scheduler to a pool of workers, drives each port through the
//! fixed phase sequence inside its worker's [`crate::environment::Environment`],
//! and records outcomes in the [`crate::store::BuildStore`].
//!
//! One long-lived [`Environment`] is created per worker slot at pool
//! startup and reused across every port that worker handles during the
//! run; workers pull ready ports off a shared channel rather than being
//! assigned a static partition of the build order, since dependency
//! readiness (not topological position alone) decides when a port can
//! actually start.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use color_eyre::eyre::Context;
use jiff::Timestamp;
use sysinfo::System;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::{
    config::Config,
    environment::{self, Command, ExecContext, ExecOutcome, Environment},
    error::Cancellation,
    fingerprint,
    fs,
    graph::{BuildState, BuildStateRegistry, DepKind, Flag, PackageRegistry, Port},
    path::{AbsDirPath, AbsFilePath},
    resolver::Resolver,
    scheduler,
    store::{BuildRecord, BuildStatus, BuildStore},
};

/// The fixed phase sequence driven against every non-skipped port, in
/// order. `InstallPkgs` is a pseudo-phase handled specially (it installs
/// already-built dependency packages rather than invoking `make`).
const PHASES: [&str; 17] = [
    "install-pkgs",
    "check-sanity",
    "fetch-depends",
    "fetch",
    "checksum",
    "extract-depends",
    "extract",
    "patch-depends",
    "patch",
    "build-depends",
    "lib-depends",
    "configure",
    "build",
    "run-depends",
    "stage",
    "check-plist",
    "package",
];

const DEPENDENCY_POLL_INTERVAL: Duration = Duration::from_millis(100);
const SAMPLER_INTERVAL: Duration = Duration::from_secs(1);

/// What a worker decided about one port's build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    Success,
    Failed,
    Skipped,
}

/// A fire-and-forget event a consumer (UI, stats collector) can subscribe
/// to. The orchestrator never checks whether anyone is listening.
#[derive(Debug, Clone)]
pub enum BuildEvent {
    PhaseStart {
        origin: String,
        phase: String,
    },
    PhaseEnd {
        origin: String,
        phase: String,
        exit_code: i32,
        duration: Duration,
    },
    BuildComplete {
        origin: String,
        outcome: BuildOutcome,
        log_path: AbsFilePath,
    },
}

/// Final run statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    pub ignored: usize,
    pub duration: Duration,
}

#[derive(Debug, Default)]
struct StatsInner {
    total: usize,
    success: usize,
    failed: usize,
    skipped: usize,
    ignored: usize,
}

struct Stats {
    inner: std::sync::Mutex<StatsInner>,
    start: Instant,
}

impl Stats {
    fn new() -> Self {
        Self {
            inner: std::sync::Mutex::new(StatsInner::default()),
            start: Instant::now(),
        }
    }

    fn add_total(&self, n: usize) {
        self.inner.lock().expect("stats lock poisoned").total += n;
    }

    fn record(&self, outcome: BuildOutcome) {
        let mut inner = self.inner.lock().expect("stats lock poisoned");
        match outcome {
            BuildOutcome::Success => inner.success += 1,
            BuildOutcome::Failed => inner.failed += 1,
            BuildOutcome::Skipped => inner.skipped += 1,
        }
    }

    fn record_ignored(&self) {
        self.inner.lock().expect("stats lock poisoned").ignored += 1;
    }

    fn snapshot(&self) -> StatsSnapshot {
        let inner = self.inner.lock().expect("stats lock poisoned");
        StatsSnapshot {
            total: inner.total,
            success: inner.success,
            failed: inner.failed,
            skipped: inner.skipped,
            ignored: inner.ignored,
            duration: self.start.elapsed(),
        }
    }
}

/// Point-in-time snapshot of system pressure and throughput, sampled at
/// 1 Hz and exposed to any attached consumer.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeMetrics {
    pub active_workers: usize,
    pub configured_max: usize,
    pub dynamic_max: usize,
    pub adjusted_load: f64,
    pub swap_pct: f64,
    pub rate_per_hour: f64,
    pub impulse: u32,
    pub elapsed: Duration,
    pub stats: StatsSnapshot,
}

/// 60-bucket ring, one bucket per second of the trailing minute, used to
/// derive a completions/hour rate without retaining unbounded history.
struct CompletionRing {
    buckets: [u32; 60],
    last_second: u64,
}

impl CompletionRing {
    fn new() -> Self {
        Self {
            buckets: [0; 60],
            last_second: 0,
        }
    }

    fn advance_to(&mut self, second: u64) {
        if second <= self.last_second {
            return;
        }
        let elapsed = (second - self.last_second).min(60);
        for step in 1..=elapsed {
            let idx = ((self.last_second + step) % 60) as usize;
            self.buckets[idx] = 0;
        }
        self.last_second = second;
    }

    fn record(&mut self, second: u64) {
        self.advance_to(second);
        self.buckets[(second % 60) as usize] += 1;
    }

    fn rate_per_hour(&self) -> f64 {
        self.buckets.iter().sum::<u32>() as f64 * 60.0
    }

    fn impulse(&self, second: u64) -> u32 {
        if second == self.last_second {
            self.buckets[(second % 60) as usize]
        } else {
            0
        }
    }
}

/// Dynamic worker-count cap, recomputed once per second from load average
/// and swap pressure (§4.7). Workers poll this before starting a build;
/// exceeding it means waiting, not being denied outright.
struct Throttle {
    configured_max: usize,
    dynamic_max: AtomicUsize,
    active: AtomicUsize,
}

impl Throttle {
    fn new(configured_max: usize) -> Self {
        Self {
            configured_max,
            dynamic_max: AtomicUsize::new(configured_max.max(1)),
            active: AtomicUsize::new(0),
        }
    }

    fn resample(&self, adjusted_load: f64, swap_pct: f64, cpu_count: usize) {
        let new_max = if adjusted_load > 2.0 * cpu_count as f64 {
            (self.configured_max * 3 / 4).max(1)
        } else if swap_pct > 10.0 {
            (self.configured_max / 2).max(1)
        } else {
            self.configured_max.max(1)
        };
        self.dynamic_max.store(new_max, Ordering::Relaxed);
    }

    /// Block until there is room under the current dynamic cap, then
    /// reserve a slot. Returns a guard that releases the slot on drop.
    async fn acquire(self: &Arc<Self>) -> ThrottleGuard {
        loop {
            let cap = self.dynamic_max.load(Ordering::Relaxed);
            let current = self.active.load(Ordering::Relaxed);
            if current < cap
                && self
                    .active
                    .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                return ThrottleGuard {
                    throttle: Arc::clone(self),
                };
            }
            tokio::time::sleep(DEPENDENCY_POLL_INTERVAL).await;
        }
    }
}

struct ThrottleGuard {
    throttle: Arc<Throttle>,
}

impl Drop for ThrottleGuard {
    fn drop(&mut self) {
        self.throttle.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Coordinates dependency resolution, scheduling, and the worker pool for
/// one build run.
pub struct Orchestrator {
    config: Arc<Config>,
    packages: PackageRegistry,
    states: BuildStateRegistry,
    store: Arc<BuildStore>,
    events: broadcast::Sender<BuildEvent>,
    metrics: broadcast::Sender<RuntimeMetrics>,
    cancellation: CancellationToken,
}

impl Orchestrator {
    pub fn new(config: Config, store: BuildStore, cancellation: CancellationToken) -> Self {
        let (events, _) = broadcast::channel(1024);
        let (metrics, _) = broadcast::channel(16);
        Self {
            config: Arc::new(config),
            packages: PackageRegistry::new(),
            states: BuildStateRegistry::new(),
            store: Arc::new(store),
            events,
            metrics,
            cancellation,
        }
    }

    /// Subscribe to build events for the life of this orchestrator. Event
    /// delivery is fire-and-forget; a slow or absent consumer never
    /// blocks the build.
    pub fn subscribe(&self) -> broadcast::Receiver<BuildEvent> {
        self.events.subscribe()
    }

    /// Subscribe to the 1 Hz [`RuntimeMetrics`] stream for the life of this
    /// orchestrator. Delivery is fire-and-forget, same as [`Self::subscribe`].
    pub fn subscribe_metrics(&self) -> broadcast::Receiver<RuntimeMetrics> {
        self.metrics.subscribe()
    }

    /// Resolve `specs`, compute the build order, run every buildable port
    /// through the worker pool, and return final statistics. `force`
    /// skips the fingerprint-match short-circuit (every port is rebuilt
    /// regardless of its stored fingerprint).
    #[instrument(skip(self, specs))]
    pub async fn run(&self, specs: &[String], force: bool) -> color_eyre::Result<StatsSnapshot> {
        let resolver = Resolver::new(
            Arc::clone(&self.config),
            self.packages.clone(),
            self.states.clone(),
        );
        resolver.resolve(specs).await.context("resolve ports")?;

        let order = scheduler::build_order(&self.packages.all());
        let stats = Arc::new(Stats::new());
        stats.add_total(order.len());

        let mut ready = VecDeque::with_capacity(order.len());
        for port in &order {
            let state = self.states.enter(&port.key);
            if state.has(Flag::NO_BUILD_IGNORE) {
                stats.record_ignored();
                continue;
            }
            if state.is_terminal() {
                // Already flagged NotFound/Corrupt by the resolver.
                continue;
            }

            if !force {
                match self.should_skip(port, &state).await {
                    Ok(true) => {
                        stats.record(BuildOutcome::Skipped);
                        continue;
                    }
                    Ok(false) => {}
                    Err(err) => {
                        warn!(origin = %port.origin(), error = %err, "fingerprint check failed, rebuilding");
                    }
                }
            }

            ready.push_back(Arc::clone(port));
        }

        let (work_tx, work_rx) = flume::unbounded::<Arc<Port>>();
        for port in ready {
            work_tx.send(port).expect("receiver alive");
        }
        drop(work_tx);

        let throttle = Arc::new(Throttle::new(self.config.max_workers.max(1)));
        let completions = Arc::new(std::sync::Mutex::new(CompletionRing::new()));
        let _sampler = self.spawn_sampler(Arc::clone(&throttle), Arc::clone(&stats), Arc::clone(&completions));

        let mut workers = Vec::with_capacity(self.config.max_workers.max(1));
        for worker_id in 0..self.config.max_workers.max(1) {
            let mut env = environment::resolve(&self.config.backend)?.create();
            env.setup(worker_id, &self.config).await.context("set up worker sandbox")?;

            let worker = Worker {
                id: worker_id,
                env,
                config: Arc::clone(&self.config),
                packages: self.packages.clone(),
                states: self.states.clone(),
                store: Arc::clone(&self.store),
                events: self.events.clone(),
                stats: Arc::clone(&stats),
                throttle: Arc::clone(&throttle),
                completions: Arc::clone(&completions),
                cancellation: self.cancellation.clone(),
                work_rx: work_rx.clone(),
            };
            workers.push(tokio::spawn(worker.run()));
        }
        drop(work_rx);

        for worker in workers {
            if let Err(err) = worker.await {
                warn!(?err, "worker task panicked");
            }
        }

        Ok(stats.snapshot())
    }

    /// Tear down every Environment created by a previous `run` call that
    /// crashed before its own cleanup ran. Exposed for the CLI's
    /// `cleanup` subcommand.
    #[instrument(skip(config))]
    pub async fn cleanup_stale(config: &Config) -> color_eyre::Result<Vec<String>> {
        crate::environment::bsd::cleanup_stale_sandboxes(&config.build_base).await
    }

    async fn should_skip(&self, port: &Arc<Port>, state: &Arc<BuildState>) -> color_eyre::Result<bool> {
        let port_dir = self
            .config
            .ports_tree
            .try_join_dir(format!("{}/{}", port.category, port.name))?;
        let crc = fingerprint::compute(&port_dir).await?;
        let needs_build = self.store.needs_build(&port.origin(), crc).await?;
        if !needs_build {
            state.set(Flag::SUCCESS);
        }
        Ok(!needs_build)
    }

    fn spawn_sampler(
        &self,
        throttle: Arc<Throttle>,
        stats: Arc<Stats>,
        completions: Arc<std::sync::Mutex<CompletionRing>>,
    ) -> tokio::task::JoinHandle<()> {
        let cancellation = self.cancellation.clone();
        let metrics = self.metrics.clone();
        let configured_max = self.config.max_workers.max(1);
        tokio::spawn(async move {
            let mut system = System::new();
            let cpu_count = num_cpus::get().max(1);
            let start = Instant::now();
            loop {
                tokio::select! {
                    _ = cancellation.cancelled() => return,
                    _ = tokio::time::sleep(SAMPLER_INTERVAL) => {}
                }
                let tick = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs();
                system.refresh_memory();
                let load = System::load_average();
                let total_swap = system.total_swap().max(1);
                let swap_pct = system.used_swap() as f64 / total_swap as f64 * 100.0;
                throttle.resample(load.one, swap_pct, cpu_count);
                debug!(load = load.one, swap_pct, "resampled dynamic worker cap");

                let (rate_per_hour, impulse) = {
                    let mut ring = completions.lock().expect("completion ring lock poisoned");
                    ring.advance_to(tick);
                    (ring.rate_per_hour(), ring.impulse(tick))
                };

                let snapshot = RuntimeMetrics {
                    active_workers: throttle.active.load(Ordering::Relaxed),
                    configured_max,
                    dynamic_max: throttle.dynamic_max.load(Ordering::Relaxed),
                    adjusted_load: load.one,
                    swap_pct,
                    rate_per_hour,
                    impulse,
                    elapsed: start.elapsed(),
                    stats: stats.snapshot(),
                };
                let _ = metrics.send(snapshot);
            }
        })
    }
}

/// One long-lived worker: owns a single [`Environment`] for the life of
/// the run and repeatedly pulls ready ports off the shared work channel.
struct Worker {
    id: usize,
    env: Box<dyn Environment>,
    config: Arc<Config>,
    packages: PackageRegistry,
    states: BuildStateRegistry,
    store: Arc<BuildStore>,
    events: broadcast::Sender<BuildEvent>,
    stats: Arc<Stats>,
    throttle: Arc<Throttle>,
    completions: Arc<std::sync::Mutex<CompletionRing>>,
    cancellation: CancellationToken,
    work_rx: flume::Receiver<Arc<Port>>,
}

impl Worker {
    #[instrument(skip(self), fields(worker_id = self.id))]
    async fn run(mut self) {
        while let Ok(port) = self.work_rx.recv_async().await {
            if self.cancellation.is_cancelled() {
                break;
            }

            let state = self.states.enter(&port.key);
            if !self.await_dependencies(&port).await {
                state.set(Flag::SKIPPED);
                self.stats.record(BuildOutcome::Skipped);
                continue;
            }

            let _permit = self.throttle.acquire().await;
            self.build_one(&port, &state).await;
        }

        if let Err(err) = self.env.cleanup().await {
            warn!(worker_id = self.id, %err, "failed to tear down worker sandbox");
        }
    }

    /// Wait for every dependency to reach a terminal state. Returns
    /// `false` (meaning: mark this port skipped) if any dependency ended
    /// up Failed, Skipped, NotFound, or Corrupt — none of those leave a
    /// usable package behind for a dependent to build against.
    async fn await_dependencies(&self, port: &Arc<Port>) -> bool {
        loop {
            let deps = port.depends_on();
            let mut all_terminal = true;
            for (dep, _kind) in &deps {
                let dep_state = self.states.enter(&dep.key);
                if !dep_state.is_terminal() {
                    all_terminal = false;
                    break;
                }
                if dep_state.has(Flag::FAILED)
                    || dep_state.has(Flag::SKIPPED)
                    || dep_state.has(Flag::NOT_FOUND)
                    || dep_state.has(Flag::CORRUPT)
                {
                    return false;
                }
            }
            if all_terminal {
                return true;
            }
            if self.cancellation.is_cancelled() {
                return false;
            }
            tokio::time::sleep(DEPENDENCY_POLL_INTERVAL).await;
        }
    }

    #[instrument(skip(self, state), fields(origin = %port.origin()))]
    async fn build_one(&mut self, port: &Arc<Port>, state: &Arc<BuildState>) {
        state.set(Flag::RUNNING);

        let uuid = Uuid::new_v4();
        let origin = port.origin();
        let version = port.version();
        let start_time = Timestamp::now();

        let record = BuildRecord {
            uuid,
            origin: origin.clone(),
            version: version.clone(),
            status: BuildStatus::Running,
            start_time,
            end_time: start_time,
        };
        if let Err(err) = self.store.save_record(&record).await {
            warn!(%origin, %err, "failed to write running build record");
        }

        let log_path = match self.phase_log_path(&origin).await {
            Ok(path) => path,
            Err(err) => {
                warn!(%origin, %err, "failed to create phase log file");
                state.clear(Flag::RUNNING);
                state.set(Flag::FAILED);
                self.stats.record(BuildOutcome::Failed);
                return;
            }
        };

        let outcome = self.run_phases(port, &log_path).await;

        if self.cancellation.is_cancelled() {
            // Leave the BuildRecord in "running" state: a stale/indeterminate
            // record, never transitioned, per the cancellation contract.
            state.clear(Flag::RUNNING);
            return;
        }

        let end_time = Timestamp::now();
        state.clear(Flag::RUNNING);
        match &outcome {
            Ok(()) => {
                if let Err(err) = self
                    .store
                    .update_record_status(uuid, BuildStatus::Success, end_time)
                    .await
                {
                    warn!(%origin, %err, "failed to record build success");
                }
                match fingerprint::compute(&self.port_dir(port)).await {
                    Ok(crc) => {
                        if let Err(err) = self.store.update_fingerprint(&origin, crc).await {
                            warn!(%origin, %err, "failed to record fingerprint");
                        }
                    }
                    Err(err) => warn!(%origin, %err, "failed to compute fingerprint after build"),
                }
                if let Err(err) = self
                    .store
                    .update_package_index(&origin, &version, uuid)
                    .await
                {
                    warn!(%origin, %err, "failed to update package index");
                }
                state.set(Flag::SUCCESS);
                self.stats.record(BuildOutcome::Success);
                self.record_completion();
                self.dispatch(BuildEvent::BuildComplete {
                    origin,
                    outcome: BuildOutcome::Success,
                    log_path,
                });
            }
            Err(failed_phase) => {
                state.set_last_phase(failed_phase.clone());
                if let Err(err) = self
                    .store
                    .update_record_status(uuid, BuildStatus::Failed, end_time)
                    .await
                {
                    warn!(%origin, %err, "failed to record build failure");
                }
                state.set(Flag::FAILED);
                self.stats.record(BuildOutcome::Failed);
                self.record_completion();
                self.dispatch(BuildEvent::BuildComplete {
                    origin,
                    outcome: BuildOutcome::Failed,
                    log_path,
                });
            }
        }
    }

    /// Mark one build as finished in the trailing-minute completion ring
    /// the sampler reads from to derive `rate_per_hour`/`impulse`.
    fn record_completion(&self) {
        let second = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.completions
            .lock()
            .expect("completion ring lock poisoned")
            .record(second);
    }

    fn port_dir(&self, port: &Arc<Port>) -> AbsDirPath {
        self.config
            .ports_tree
            .try_join_dir(format!("{}/{}", port.category, port.name))
            .expect("ports_tree is a valid absolute directory")
    }

    async fn phase_log_path(&self, origin: &str) -> color_eyre::Result<AbsFilePath> {
        fs::create_dir_all(&self.config.log_dir).await?;
        let filename = format!("{}.log", origin.replace('/', "_"));
        self.config.log_dir.try_join_file(filename)
    }

    /// Run every phase in order, stopping at the first failure. Returns
    /// `Ok(())` on full success, or `Err(phase_name)` naming the phase
    /// that failed.
    async fn run_phases(&self, port: &Arc<Port>, log_path: &AbsFilePath) -> Result<(), String> {
        for phase in PHASES {
            self.dispatch(BuildEvent::PhaseStart {
                origin: port.origin(),
                phase: phase.to_string(),
            });

            let start = Instant::now();
            let result = if phase == "install-pkgs" {
                self.run_install_pkgs(port, log_path).await
            } else {
                self.run_make_phase(port, phase, log_path).await
            };

            let (exit_code, ok) = match result {
                Ok(code) => (code, code == 0),
                Err(err) => {
                    warn!(origin = %port.origin(), phase, %err, "phase execution error");
                    (-1, false)
                }
            };

            self.dispatch(BuildEvent::PhaseEnd {
                origin: port.origin(),
                phase: phase.to_string(),
                exit_code,
                duration: start.elapsed(),
            });

            if !ok {
                return Err(phase.to_string());
            }
        }
        Ok(())
    }

    async fn run_make_phase(
        &self,
        port: &Arc<Port>,
        phase: &str,
        log_path: &AbsFilePath,
    ) -> color_eyre::Result<i32> {
        let xports_path = format!("/xports/{}/{}", port.category, port.name);
        let mut cmd = Command::new(&self.config.make_bin)
            .arg("-C")
            .arg(&xports_path)
            .arg(phase)
            .env("PORTSDIR", "/xports")
            .env("WRKDIRPREFIX", "/construction")
            .env("DISTDIR", "/distfiles")
            .env("PACKAGES", "/packages")
            .env("PREFIX", "/usr/local")
            .env("BATCH", "yes");
        if !port.flavor.is_empty() {
            cmd = cmd.env("FLAVOR", &port.flavor);
        }

        self.execute(cmd, log_path).await
    }

    /// The `install-pkgs` pseudo-phase: installs every already-built
    /// build/lib dependency's package into this worker's sandbox before
    /// the real phases run, mirroring what `pkg install`'s own dependency
    /// resolution would do for a prebuilt package set.
    async fn run_install_pkgs(&self, port: &Arc<Port>, log_path: &AbsFilePath) -> color_eyre::Result<i32> {
        for (dep, kind) in port.depends_on() {
            if !matches!(kind, DepKind::Build | DepKind::Lib) {
                continue;
            }
            let pkg_file = dep.pkg_file_name();
            if pkg_file.is_empty() {
                continue;
            }
            let cmd = Command::new(&self.config.make_bin)
                .arg("-C")
                .arg(format!("/xports/{}/{}", dep.category, dep.name))
                .arg("install-pkgs-dep")
                .env("PKG_PATH", format!("/packages/{pkg_file}"))
                .env("BATCH", "yes");
            let code = self.execute(cmd, log_path).await?;
            if code != 0 {
                return Ok(code);
            }
        }
        Ok(0)
    }

    async fn execute(&self, command: Command, log_path: &AbsFilePath) -> color_eyre::Result<i32> {
        let timeout = (self.config.phase_timeout_secs > 0)
            .then(|| Duration::from_secs(self.config.phase_timeout_secs));
        let ctx = ExecContext {
            cancellation: self.cancellation.clone(),
            timeout,
            log_file: log_path.clone(),
        };

        match self.env.execute(&ctx, &command).await? {
            ExecOutcome::Completed(outcome) => Ok(outcome.exit_code),
            ExecOutcome::Cancelled(Cancellation::Cancelled) => Ok(130),
            ExecOutcome::Cancelled(Cancellation::TimedOut) => Ok(124),
        }
    }

    fn dispatch(&self, event: BuildEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn completion_ring_tracks_a_sliding_minute() {
        let mut ring = CompletionRing::new();
        ring.record(10);
        ring.record(10);
        ring.record(11);
        assert_eq!(ring.rate_per_hour(), 3.0 * 60.0);
        assert_eq!(ring.impulse(11), 1);
    }

    #[test]
    fn completion_ring_clears_stale_buckets_after_a_lap() {
        let mut ring = CompletionRing::new();
        ring.record(5);
        ring.advance_to(65);
        assert_eq!(ring.rate_per_hour(), 0.0);
    }

    #[test]
    fn throttle_drops_to_three_quarters_under_heavy_load() {
        let throttle = Throttle::new(8);
        throttle.resample(20.0, 0.0, 4);
        assert_eq!(throttle.dynamic_max.load(Ordering::Relaxed), 6);
    }

    #[test]
    fn throttle_drops_to_half_under_swap_pressure() {
        let throttle = Throttle::new(8);
        throttle.resample(0.0, 50.0, 4);
        assert_eq!(throttle.dynamic_max.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn throttle_never_drops_below_one() {
        let throttle = Throttle::new(1);
        throttle.resample(999.0, 999.0, 4);
        assert_eq!(throttle.dynamic_max.load(Ordering::Relaxed), 1);
    }
}
