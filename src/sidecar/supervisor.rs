//! Lifecycle of the media server process.
//!
//! `start` launches the first instance itself. From then on a single
//! supervising task owns the child: it watches for exit, runs the health
//! loop, schedules restarts and performs shutdown when `stop` asks for it.
use super::config::{SidecarConfig, SupervisorSettings};
use super::health::HealthProbe;
use super::port::allocate_port;
use super::runtime::SidecarRuntime;
use super::state::{SidecarEvent, SidecarState, SidecarStatus};
use super::SidecarError;
use crate::config::AppPaths;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 64;

enum Control {
    Stop(oneshot::Sender<()>),
}

/// A launched process that passed its startup health poll
struct Launched {
    child: Child,
    pid: Option<u32>,
    host: String,
    port: u16,
}

struct Instance {
    child: Child,
    started: Instant,
    health: HealthTask,
}

struct HealthTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl HealthTask {
    /// Returns once the loop has exited, so no probe runs afterwards
    async fn stop(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }
}

enum Relaunch {
    Running(Instance),
    Stopped(Option<Control>),
    GaveUp,
}

struct Inner {
    runtime: Arc<dyn SidecarRuntime>,
    probe: Arc<dyn HealthProbe>,
    settings: SupervisorSettings,
    paths: AppPaths,
    state: RwLock<SidecarState>,
    events: broadcast::Sender<SidecarEvent>,
    control: Mutex<Option<mpsc::Sender<Control>>>,
    last_config: Mutex<Option<SidecarConfig>>,
}

pub struct SidecarSupervisor {
    inner: Arc<Inner>,
}

impl SidecarSupervisor {
    pub fn new(
        runtime: Arc<dyn SidecarRuntime>,
        probe: Arc<dyn HealthProbe>,
        settings: SupervisorSettings,
        paths: AppPaths,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                runtime,
                probe,
                settings,
                paths,
                state: RwLock::new(SidecarState::default()),
                events,
                control: Mutex::new(None),
                last_config: Mutex::new(None),
            }),
        }
    }

    pub async fn state(&self) -> SidecarState {
        self.inner.state.read().await.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SidecarEvent> {
        self.inner.events.subscribe()
    }

    /// Launch the sidecar and wait until it answers its health endpoint.
    ///
    /// Returns `Ok(false)` without touching state if an instance is already
    /// starting, running or stopping, or a supervising task is still alive.
    pub async fn start(&self, config: SidecarConfig) -> Result<bool, SidecarError> {
        {
            // A live supervising task owns the process even while it shows `stopped`
            // between a crash and the restart
            let control = self.inner.control.lock().await;
            if control.is_some() {
                info!("Sidecar is supervised, ignoring start");
                return Ok(false);
            }
            let mut state = self.inner.state.write().await;
            if matches!(
                state.status,
                SidecarStatus::Starting | SidecarStatus::Running | SidecarStatus::Stopping
            ) {
                info!("Sidecar is {}, ignoring start", state.status);
                return Ok(false);
            }
            *state = SidecarState {
                status: SidecarStatus::Starting,
                ..Default::default()
            };
        }
        self.inner.emit_status(SidecarStatus::Starting, None);

        let mut config = config.with_defaults(&self.inner.paths);
        *self.inner.last_config.lock().await = Some(config.clone());

        let launched = match self.inner.prepare(&mut config).await {
            Ok(launched) => launched,
            Err(e) => {
                error!("Sidecar failed to start: {}", e);
                self.inner.fail(&e).await;
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel(4);
        *self.inner.control.lock().await = Some(tx.clone());
        let instance = self.inner.go_running(launched).await;
        tokio::spawn(Arc::clone(&self.inner).supervise(instance, config, rx, tx));
        Ok(true)
    }

    /// Terminate gracefully, force-killing after the grace window.
    /// Also cancels a pending automatic restart.
    pub async fn stop(&self) -> Result<(), SidecarError> {
        loop {
            let control = {
                let control = self.inner.control.lock().await;
                let status = self.inner.state.read().await.status;
                match (control.clone(), status) {
                    (_, SidecarStatus::Stopping) => return Err(SidecarError::Busy),
                    (Some(control), _) => control,
                    (None, SidecarStatus::Stopped) => return Ok(()),
                    (None, SidecarStatus::Error) => {
                        self.inner.mark_stopped(None).await;
                        return Ok(());
                    }
                    // No supervising task yet means the initial start is still in flight
                    (None, SidecarStatus::Starting | SidecarStatus::Running) => {
                        return Err(SidecarError::Busy)
                    }
                }
            };

            let (tx, rx) = oneshot::channel();
            if control.send(Control::Stop(tx)).await.is_ok() && rx.await.is_ok() {
                return Ok(());
            }
            // The task finished without reading the request; its final state decides
            debug!("Supervising task ended before handling stop");
        }
    }

    /// Stop, then start again with the last configuration.
    /// This is the way out of `error` after a crash loop.
    pub async fn restart(&self) -> Result<bool, SidecarError> {
        let config = self.inner.last_config.lock().await.clone().unwrap_or_default();
        self.stop().await?;
        self.start(config).await
    }
}

impl Inner {
    fn emit(&self, event: SidecarEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn emit_status(&self, status: SidecarStatus, error: Option<String>) {
        self.emit(SidecarEvent::StatusChanged { status, error });
    }

    async fn update(&self, apply: impl FnOnce(&mut SidecarState)) {
        apply(&mut *self.state.write().await);
    }

    /// Move to `status`, clearing the port for anything but `running`
    async fn transition(&self, status: SidecarStatus, apply: impl FnOnce(&mut SidecarState)) {
        let error = {
            let mut state = self.state.write().await;
            state.status = status;
            if status != SidecarStatus::Running {
                state.port = None;
            }
            apply(&mut state);
            state.last_error.clone()
        };
        debug!("Sidecar status -> {}", status);
        self.emit_status(status, error);
    }

    async fn mark_stopped(&self, error: Option<String>) {
        self.transition(SidecarStatus::Stopped, |s| {
            s.pid = None;
            s.started_at = None;
            if error.is_some() {
                s.last_error = error;
            }
        })
        .await;
        self.emit(SidecarEvent::PortChanged { port: None });
    }

    async fn fail(&self, e: &SidecarError) {
        let (message, code) = (e.to_string(), e.code().to_string());
        self.transition(SidecarStatus::Error, |s| {
            s.pid = None;
            s.started_at = None;
            s.last_error = Some(message);
            s.last_error_code = Some(code);
        })
        .await;
    }

    /// Drop this task's control handle and publish its final status as one step,
    /// so `start` and `stop` never see a finished task that still looks live
    async fn finish(&self, own: &mpsc::Sender<Control>, outcome: Result<(), SidecarError>) {
        let mut control = self.control.lock().await;
        if control.as_ref().is_some_and(|c| c.same_channel(own)) {
            *control = None;
        }
        match outcome {
            Ok(()) => self.mark_stopped(None).await,
            Err(e) => self.fail(&e).await,
        }
    }

    async fn prepare(&self, config: &mut SidecarConfig) -> Result<Launched, SidecarError> {
        self.runtime.resolve_binaries(config).await?;
        self.launch(config).await
    }

    async fn launch(&self, config: &SidecarConfig) -> Result<Launched, SidecarError> {
        self.runtime.check_preconditions().await?;

        let host = config.host().to_string();
        let port = allocate_port(
            &host,
            config.port,
            self.settings.port_range(),
            self.settings.port_candidates,
        )?;

        let mut cmd: Command = self.runtime.command(config)?;
        cmd.envs(config.to_env(port))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| SidecarError::LaunchFailed(e.to_string()))?;
        let pid = child.id();
        forward_output(&mut child);
        self.update(|s| s.pid = pid).await;
        info!("Launched sidecar (pid {:?}) on {}:{}", pid, host, port);

        if let Err(e) = self.wait_for_ready(&mut child, &host, port).await {
            let _ = child.kill().await;
            self.update(|s| s.pid = None).await;
            return Err(e);
        }

        Ok(Launched {
            child,
            pid,
            host,
            port,
        })
    }

    async fn wait_for_ready(
        &self,
        child: &mut Child,
        host: &str,
        port: u16,
    ) -> Result<(), SidecarError> {
        let timeout = self.settings.startup_timeout();
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(status) = child.try_wait()? {
                return Err(SidecarError::LaunchFailed(format!(
                    "exited during startup with {status}"
                )));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let probe_timeout = self.settings.health_timeout().min(remaining);
            match tokio::time::timeout(probe_timeout, self.probe.check(host, port)).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => debug!("Sidecar not ready yet: {}", e),
                Err(_) => debug!("Health probe timed out during startup"),
            }

            if Instant::now() >= deadline {
                warn!("Sidecar did not become ready within {:?}", timeout);
                return Err(SidecarError::StartupTimeout(timeout));
            }
            tokio::time::sleep(self.settings.startup_poll()).await;
        }
    }

    async fn go_running(self: &Arc<Self>, launched: Launched) -> Instance {
        let Launched {
            child,
            pid,
            host,
            port,
        } = launched;

        self.transition(SidecarStatus::Running, |s| {
            s.pid = pid;
            s.port = Some(port);
            s.started_at = Some(now_millis());
            s.consecutive_health_failures = 0;
        })
        .await;
        self.emit(SidecarEvent::PortChanged { port: Some(port) });
        info!("Sidecar running on port {}", port);

        Instance {
            child,
            started: Instant::now(),
            health: self.spawn_health(host, port),
        }
    }

    fn spawn_health(self: &Arc<Self>, host: String, port: u16) -> HealthTask {
        let token = CancellationToken::new();
        let this = Arc::clone(self);
        let cancelled = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.settings.health_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; startup already probed
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let result = tokio::select! {
                    _ = cancelled.cancelled() => break,
                    res = tokio::time::timeout(this.settings.health_timeout(), this.probe.check(&host, port)) => {
                        res.unwrap_or_else(|_| Err("health check timed out".to_string()))
                    }
                };

                match result {
                    Ok(()) => {
                        let mut state = this.state.write().await;
                        if state.consecutive_health_failures > 0 {
                            info!("Sidecar health recovered");
                            state.consecutive_health_failures = 0;
                        }
                    }
                    Err(e) => {
                        let consecutive = {
                            let mut state = this.state.write().await;
                            state.consecutive_health_failures += 1;
                            state.consecutive_health_failures
                        };
                        warn!("Sidecar health check failed ({} in a row): {}", consecutive, e);
                        this.emit(SidecarEvent::HealthCheckFailed {
                            consecutive,
                            error: e,
                        });
                    }
                }
            }
            debug!("Health loop stopped");
        });

        HealthTask { token, handle }
    }

    async fn supervise(
        self: Arc<Self>,
        mut instance: Instance,
        config: SidecarConfig,
        mut control: mpsc::Receiver<Control>,
        own: mpsc::Sender<Control>,
    ) {
        loop {
            let exit = tokio::select! {
                res = instance.child.wait() => res,
                msg = control.recv() => {
                    self.shutdown(instance).await;
                    self.finish(&own, Ok(())).await;
                    reply(msg);
                    return;
                }
            };
            instance.health.stop().await;

            let uptime = instance.started.elapsed();
            let (crashed, description) = match &exit {
                Ok(status) => (!status.success(), status.to_string()),
                Err(e) => (true, e.to_string()),
            };

            if !crashed {
                info!("Sidecar exited cleanly");
                self.finish(&own, Ok(())).await;
                return;
            }

            warn!("Sidecar crashed ({}) after {:?}", description, uptime);
            if uptime >= self.settings.stable_after() {
                self.update(|s| s.restart_attempts = 0).await;
            }
            self.mark_stopped(Some(format!("sidecar exited with {description}")))
                .await;

            match self.relaunch(&config, &mut control).await {
                Relaunch::Running(next) => instance = next,
                Relaunch::Stopped(msg) => {
                    self.finish(&own, Ok(())).await;
                    reply(msg);
                    return;
                }
                Relaunch::GaveUp => {
                    let e = SidecarError::CrashLoop(self.settings.max_restarts);
                    error!("{}", e);
                    self.finish(&own, Err(e)).await;
                    return;
                }
            }
        }
    }

    /// Restart with linear backoff until an instance is running, the cap is
    /// reached, or a stop request arrives.
    ///
    /// A successful automatic restart keeps `restart_attempts`; only a user
    /// `start` or a crash after `stable_after` of uptime resets it. Otherwise a
    /// process that passes its health check and then dies would never reach the cap.
    async fn relaunch(
        self: &Arc<Self>,
        config: &SidecarConfig,
        control: &mut mpsc::Receiver<Control>,
    ) -> Relaunch {
        loop {
            let attempt = self.state.read().await.restart_attempts + 1;
            if attempt > self.settings.max_restarts {
                return Relaunch::GaveUp;
            }

            let delay = self.settings.restart_delay(attempt);
            self.transition(SidecarStatus::Starting, |s| s.restart_attempts = attempt)
                .await;
            self.emit(SidecarEvent::RestartScheduled {
                attempt,
                delay_ms: delay.as_millis() as u64,
            });
            info!("Restarting sidecar in {:?} (attempt {})", delay, attempt);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                msg = control.recv() => return Relaunch::Stopped(msg),
            }

            // Dropping an unfinished launch kills its child
            let launched = tokio::select! {
                res = self.launch(config) => res,
                msg = control.recv() => return Relaunch::Stopped(msg),
            };

            match launched {
                Ok(launched) => return Relaunch::Running(self.go_running(launched).await),
                Err(e) => {
                    warn!("Restart attempt {} failed: {}", attempt, e);
                    let (message, code) = (e.to_string(), e.code().to_string());
                    self.update(|s| {
                        s.last_error = Some(message);
                        s.last_error_code = Some(code);
                    })
                    .await;
                }
            }
        }
    }

    async fn shutdown(&self, mut instance: Instance) {
        info!("Stopping sidecar");
        self.transition(SidecarStatus::Stopping, |_| {}).await;
        instance.health.stop().await;
        self.terminate(&mut instance.child).await;
    }

    async fn terminate(&self, child: &mut Child) {
        let Some(pid) = child.id() else {
            return;
        };

        if let Err(e) = send_terminate(pid).await {
            warn!("Failed to signal sidecar {}: {}", pid, e);
        }

        let grace = self.settings.shutdown_grace();
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => info!("Sidecar exited with {}", status),
            Ok(Err(e)) => warn!("Failed to wait for sidecar: {}", e),
            Err(_) => {
                warn!("Sidecar still alive after {:?}, killing", grace);
                if let Err(e) = child.kill().await {
                    error!("Failed to kill sidecar {}: {}", pid, e);
                }
            }
        }
    }
}

fn reply(msg: Option<Control>) {
    if let Some(Control::Stop(done)) = msg {
        let _ = done.send(());
    }
}

#[cfg(unix)]
async fn send_terminate(pid: u32) -> std::io::Result<()> {
    let status = Command::new("kill")
        .arg("-TERM")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;
    if !status.success() {
        debug!("kill -TERM {} exited with {}", pid, status);
    }
    Ok(())
}

#[cfg(windows)]
async fn send_terminate(pid: u32) -> std::io::Result<()> {
    // Without /F taskkill asks the process to close
    let status = Command::new("taskkill")
        .args(["/T", "/PID", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;
    if !status.success() {
        debug!("taskkill {} exited with {}", pid, status);
    }
    Ok(())
}

/// Drain the child's pipes into the log so they never fill up
fn forward_output(child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "sidecar", "{}", line);
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(target: "sidecar", "{}", line);
            }
        });
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NoRuntime;

    #[async_trait]
    impl SidecarRuntime for NoRuntime {
        async fn resolve_binaries(&self, _: &mut SidecarConfig) -> Result<(), SidecarError> {
            Ok(())
        }

        async fn check_preconditions(&self) -> Result<(), SidecarError> {
            Err(SidecarError::Precondition("python environment missing".into()))
        }

        fn command(&self, _: &SidecarConfig) -> Result<Command, SidecarError> {
            Err(SidecarError::LaunchFailed("unreachable".into()))
        }
    }

    struct Healthy;

    #[async_trait]
    impl HealthProbe for Healthy {
        async fn check(&self, _: &str, _: u16) -> Result<(), String> {
            Ok(())
        }
    }

    fn supervisor(dir: &std::path::Path) -> SidecarSupervisor {
        SidecarSupervisor::new(
            Arc::new(NoRuntime),
            Arc::new(Healthy),
            SupervisorSettings::default(),
            AppPaths::new(dir),
        )
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        sup.stop().await.unwrap();
        assert_eq!(sup.state().await.status, SidecarStatus::Stopped);
    }

    #[tokio::test]
    async fn test_missing_precondition_is_error_state() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        let mut events = sup.subscribe();

        let err = sup.start(SidecarConfig::default()).await.unwrap_err();
        assert_eq!(err.code(), "E_PRECONDITION");

        let state = sup.state().await;
        assert_eq!(state.status, SidecarStatus::Error);
        assert_eq!(state.port, None);
        assert_eq!(state.last_error_code.as_deref(), Some("E_PRECONDITION"));

        assert_eq!(
            events.recv().await.unwrap(),
            SidecarEvent::StatusChanged {
                status: SidecarStatus::Starting,
                error: None
            }
        );
        assert!(matches!(
            events.recv().await.unwrap(),
            SidecarEvent::StatusChanged {
                status: SidecarStatus::Error,
                error: Some(_)
            }
        ));

        // stop() clears the error state
        sup.stop().await.unwrap();
        assert_eq!(sup.state().await.status, SidecarStatus::Stopped);
    }

    #[test]
    fn test_now_millis_is_recent() {
        assert!(now_millis() > 1_600_000_000_000);
    }
}
