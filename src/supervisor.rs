//! Drop-protect supervisor.
//!
//! Keeps exactly one `tailscale file get --loop` process alive while the
//! drop switch is on. The process is launched in the background through the
//! root shell, so the pid the shell echoes is the wrapper's; the real pid is
//! resolved through the [`ProcessTable`] and persisted in [`DropState`] so a
//! restarted host picks up where the previous one left off.
//!
//! Two tasks run per active session: the health loop, which relaunches the
//! receiver whenever the tracked pid stops answering, and the duplicate
//! guard, which periodically purges leaked instances left behind by earlier
//! crashes. Every relaunch is preceded by a sweep of its own, so a purge
//! never lands on a receiver that was just started.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, sleep};
use tracing::{debug, info, warn};

use crate::config::DEFAULT_WATCH_PATH;
use crate::diag::Diagnostics;
use crate::exec::{CommandExecutor, shell_quote};
use crate::procs::{ProcessId, ProcessTable};
use crate::status::{BackendState, parse_backend_state};
use crate::store::{ConflictBehavior, DropState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub binary: String,
    /// Delay between health checks.
    pub interval: Duration,
    /// Delay between unprompted duplicate sweeps.
    pub guard_interval: Duration,
    /// Instance count at which every instance is killed.
    pub duplicate_threshold: usize,
    /// Instance counts above this (and below the threshold) are warned about.
    pub healthy_ceiling: usize,
    /// How long an external timer should wait before re-enabling after teardown.
    pub restart_delay: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig {
            binary: "tailscale".to_string(),
            interval: Duration::from_secs(3),
            guard_interval: Duration::from_secs(30),
            duplicate_threshold: 5,
            healthy_ceiling: 2,
            restart_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DropPhase {
    Idle,
    Launching,
    /// The backend was not running when the session was requested.
    Blocked,
    Active,
    Stopping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropRequest {
    pub watch_path: String,
    pub conflict: ConflictBehavior,
}

impl DropRequest {
    pub fn new(watch_path: impl Into<String>, conflict: ConflictBehavior) -> Self {
        DropRequest {
            watch_path: watch_path.into(),
            conflict,
        }
    }

    /// Background launch that prints the wrapper pid.
    pub fn file_get_command(&self, binary: &str) -> String {
        format!(
            "nohup {binary} file get --conflict={} --loop {} >/dev/null 2>&1 & echo $!",
            self.conflict,
            shell_quote(&self.watch_path)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    Active,
    Blocked(BackendState),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// The tracked receiver is still alive.
    Healthy(ProcessId),
    /// A new receiver was launched. `pid` is `None` when only the wrapper is known.
    Relaunched {
        wrapper: ProcessId,
        pid: Option<ProcessId>,
    },
    /// The launch command did not yield a wrapper pid.
    LaunchFailed(String),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardReport {
    Healthy(usize),
    Elevated(usize),
    Purged(usize),
    PurgeFailed { count: usize, error: String },
}

/// What an external alarm needs in order to bring the session back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPlan {
    pub request: DropRequest,
    pub delay: Duration,
}

/// Cooperative cancellation point for a loop.
struct Cancel(watch::Receiver<bool>);

impl Cancel {
    fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Runs `fut` unless cancellation is or becomes requested. A dropped
    /// executor future kills its child process.
    async fn run<F: Future>(&mut self, fut: F) -> Option<F::Output> {
        if self.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.0.changed() => None,
            out = fut => Some(out),
        }
    }
}

#[derive(Clone)]
pub struct DuplicateGuard {
    procs: Arc<dyn ProcessTable>,
    diag: Diagnostics,
    binary: String,
    threshold: usize,
    ceiling: usize,
}

impl DuplicateGuard {
    pub fn new(procs: Arc<dyn ProcessTable>, diag: Diagnostics, config: &SupervisorConfig) -> Self {
        DuplicateGuard {
            procs,
            diag,
            binary: config.binary.clone(),
            threshold: config.duplicate_threshold,
            ceiling: config.healthy_ceiling,
        }
    }

    /// Counts running instances and kills all of them at or above the threshold.
    pub async fn sweep(&self) -> GuardReport {
        let count = self.procs.count_instances(&self.binary).await;
        if count >= self.threshold {
            match self.procs.kill_all(&self.binary).await {
                Ok(()) => {
                    self.diag.append(&format!(
                        "{count} {} processes running, killed all",
                        self.binary
                    ));
                    GuardReport::Purged(count)
                }
                Err(e) => {
                    self.diag
                        .error(&format!("killing {count} {} processes failed: {e}", self.binary));
                    GuardReport::PurgeFailed {
                        count,
                        error: e.to_string(),
                    }
                }
            }
        } else if count > self.ceiling {
            warn!(count, binary = %self.binary, "more instances than expected");
            GuardReport::Elevated(count)
        } else {
            debug!(count, binary = %self.binary, "instance count ok");
            GuardReport::Healthy(count)
        }
    }

    async fn run(
        self,
        every: Duration,
        mut cancel: Cancel,
        reports: broadcast::Sender<GuardReport>,
    ) {
        // relaunches sweep for themselves, so the first periodic sweep waits
        let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            if cancel.run(ticker.tick()).await.is_none() {
                break;
            }
            let Some(report) = cancel.run(self.sweep()).await else {
                break;
            };
            // nobody listening is fine
            let _ = reports.send(report);
        }
        debug!("duplicate guard stopped");
    }
}

struct Shared {
    exec: Arc<dyn CommandExecutor>,
    procs: Arc<dyn ProcessTable>,
    state: DropState,
    diag: Diagnostics,
    config: SupervisorConfig,
    guard: DuplicateGuard,
    phase: watch::Sender<DropPhase>,
    reports: broadcast::Sender<GuardReport>,
    // serialises read-modify-write of the tracked pid
    pid_lock: Mutex<()>,
}

struct Session {
    shutdown: watch::Sender<bool>,
    health: JoinHandle<()>,
    guard: JoinHandle<()>,
}

impl Session {
    async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.health.await {
            warn!(error = %e, "health loop ended abnormally");
        }
        if let Err(e) = self.guard.await {
            warn!(error = %e, "duplicate guard ended abnormally");
        }
    }
}

pub struct DropSupervisor {
    shared: Arc<Shared>,
    session: Mutex<Option<Session>>,
}

impl DropSupervisor {
    pub fn new(
        exec: Arc<dyn CommandExecutor>,
        procs: Arc<dyn ProcessTable>,
        state: DropState,
        diag: Diagnostics,
        config: SupervisorConfig,
    ) -> Self {
        let (phase, _) = watch::channel(DropPhase::Idle);
        let (reports, _) = broadcast::channel(16);
        let guard = DuplicateGuard::new(procs.clone(), diag.clone(), &config);
        DropSupervisor {
            shared: Arc::new(Shared {
                exec,
                procs,
                state,
                diag,
                config,
                guard,
                phase,
                reports,
                pid_lock: Mutex::new(()),
            }),
            session: Mutex::new(None),
        }
    }

    pub fn phase(&self) -> DropPhase {
        *self.shared.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<DropPhase> {
        self.shared.phase.subscribe()
    }

    pub fn subscribe_guard(&self) -> broadcast::Receiver<GuardReport> {
        self.shared.reports.subscribe()
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.shared.diag
    }

    pub fn state(&self) -> &DropState {
        &self.shared.state
    }

    /// Turns the switch on and starts a session for `request`, replacing any
    /// session already running.
    pub async fn enable(&self, request: DropRequest) -> LaunchOutcome {
        let shared = &self.shared;
        let mut session = self.session.lock().await;
        if let Some(old) = session.take() {
            debug!("replacing running drop session");
            old.stop().await;
        }

        if let Err(e) = shared.state.set_enabled(true) {
            shared.diag.error(&format!("could not persist drop switch: {e}"));
        }

        let changed = shared.state.current_path().as_deref() != Some(request.watch_path.as_str())
            || shared.state.current_behavior() != request.conflict;
        if changed {
            info!(path = %request.watch_path, conflict = %request.conflict, "drop target changed");
            shared.stop_file_get().await;
            if let Err(e) = shared.state.set_current(&request.watch_path, request.conflict) {
                shared.diag.error(&format!("could not persist drop target: {e}"));
            }
        }

        shared.set_phase(DropPhase::Launching);
        let raw = shared
            .exec
            .execute(&format!("{} status --json", shared.config.binary))
            .await;
        let backend = parse_backend_state(&raw);
        shared.diag.reset(&format!("Tailscale status: {backend}"));

        if backend != BackendState::Running {
            shared
                .diag
                .append("drop protection stopped because tailscale is not running");
            shared.stop_file_get().await;
            shared.set_phase(DropPhase::Blocked);
            return LaunchOutcome::Blocked(backend);
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let guard = tokio::spawn(shared.guard.clone().run(
            shared.config.guard_interval,
            Cancel(shutdown_rx.clone()),
            shared.reports.clone(),
        ));
        let health = tokio::spawn(shared.clone().health_loop(Cancel(shutdown_rx)));

        shared.set_phase(DropPhase::Active);
        *session = Some(Session {
            shutdown,
            health,
            guard,
        });
        LaunchOutcome::Active
    }

    /// Turns the switch off and stops everything.
    pub async fn disable(&self) {
        if let Err(e) = self.shared.state.set_enabled(false) {
            self.shared
                .diag
                .error(&format!("could not persist drop switch: {e}"));
        }
        self.teardown().await;
    }

    /// Stops the session because the host is going away. The switch is left
    /// as it is; when it is on, the returned plan tells the caller how to
    /// bring the session back.
    pub async fn shutdown(&self) -> Option<RestartPlan> {
        self.teardown().await;
        self.restart_plan()
    }

    pub fn restart_plan(&self) -> Option<RestartPlan> {
        let shared = &self.shared;
        shared.state.enabled().then(|| RestartPlan {
            request: shared.current_request(),
            delay: shared.config.restart_delay,
        })
    }

    /// One health check against the persisted target, outside any session.
    pub async fn tick(&self) -> TickOutcome {
        let (_keep, rx) = watch::channel(false);
        self.shared.tick(&mut Cancel(rx)).await
    }

    async fn teardown(&self) {
        let shared = &self.shared;
        let mut session = self.session.lock().await;
        shared.set_phase(DropPhase::Stopping);
        if let Some(old) = session.take() {
            old.stop().await;
        }
        shared.stop_file_get().await;
        shared.set_phase(DropPhase::Idle);
    }
}

impl Shared {
    fn set_phase(&self, phase: DropPhase) {
        debug!(?phase, "drop phase");
        self.phase.send_replace(phase);
    }

    fn current_request(&self) -> DropRequest {
        DropRequest {
            watch_path: self
                .state
                .current_path()
                .unwrap_or_else(|| DEFAULT_WATCH_PATH.to_string()),
            conflict: self.state.current_behavior(),
        }
    }

    async fn health_loop(self: Arc<Self>, mut cancel: Cancel) {
        while !cancel.is_cancelled() {
            match self.tick(&mut cancel).await {
                TickOutcome::Cancelled => break,
                outcome => debug!(?outcome, "drop tick"),
            }
            if cancel.run(sleep(self.config.interval)).await.is_none() {
                break;
            }
        }
        debug!("drop health loop stopped");
    }

    async fn tick(&self, cancel: &mut Cancel) -> TickOutcome {
        let _pid = self.pid_lock.lock().await;
        let request = self.current_request();

        if let Some(pid) = self.state.tracked_pid() {
            match cancel.run(self.procs.is_alive(pid)).await {
                None => return TickOutcome::Cancelled,
                Some(true) => return TickOutcome::Healthy(pid),
                Some(false) => {
                    debug!(pid, "tracked file get is gone");
                    if let Err(e) = self.state.clear_tracked_pid() {
                        self.diag.error(&format!("could not clear stale pid {pid}: {e}"));
                    }
                }
            }
        }

        let Some(report) = cancel.run(self.guard.sweep()).await else {
            return TickOutcome::Cancelled;
        };
        // nobody listening is fine
        let _ = self.reports.send(report);

        let command = request.file_get_command(&self.config.binary);
        self.diag.append(&format!("execute: {command}"));
        // not cancellable: the shell returns as soon as the receiver is
        // backgrounded, and an unread wrapper pid could never be reaped
        let out = self.exec.execute(&command).await;

        let wrapper = match out.trim().parse::<ProcessId>() {
            Ok(pid) if pid > 0 => pid,
            _ => {
                self.diag
                    .error(&format!("failed to start file get, no wrapper pid in {out:?}"));
                return TickOutcome::LaunchFailed(out);
            }
        };

        // finish tracking it even if cancelled
        let pid = self
            .procs
            .resolve_child(wrapper, &self.config.binary)
            .await;
        match pid {
            Some(pid) => {
                if let Err(e) = self.state.set_tracked_pid(pid) {
                    self.diag.error(&format!("could not persist pid {pid}: {e}"));
                }
                self.diag
                    .append(&format!("file get started, wrapper {wrapper}, pid {pid}"));
            }
            None => {
                self.diag.append(&format!(
                    "file get started under wrapper {wrapper} but its pid could not be resolved, liveness tracking is degraded"
                ));
            }
        }
        TickOutcome::Relaunched { wrapper, pid }
    }

    async fn stop_file_get(&self) {
        let _pid = self.pid_lock.lock().await;
        let Some(pid) = self.state.tracked_pid() else {
            return;
        };
        if let Err(e) = self.procs.terminate(pid).await {
            self.diag.error(&format!("could not stop file get {pid}: {e}"));
        }
        if let Err(e) = self.state.clear_tracked_pid() {
            self.diag.error(&format!("could not clear pid {pid}: {e}"));
        }
        self.diag.append(&format!("stopped file get (pid {pid})"));
    }
}
