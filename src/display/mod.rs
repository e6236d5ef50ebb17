//! Display-service supervisor: a virtual display server paired with a
//! remote-framebuffer server bound to it. Owns both children's lifecycle,
//! crash-loop recovery, and lock-file hygiene behind a single `start`/
//! `stop`/`restart` handle.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};
use tokio::time::sleep;

const LOCK_POLL_DEADLINE: Duration = Duration::from_secs(5);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);
const LOCK_GRACE_PERIOD: Duration = Duration::from_millis(200);
const RESTART_DEBOUNCE: Duration = Duration::from_secs(5);
const FRAMEBUFFER_RESTART_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessKind {
    Display,
    Framebuffer,
}

#[derive(Debug, Clone, Default)]
pub struct DisplayStatus {
    pub running: bool,
    pub display_pid: Option<u32>,
    pub framebuffer_pid: Option<u32>,
    pub display_number: u32,
}

#[derive(Debug, Clone)]
pub struct DisplaySupervisorConfig {
    pub display_number: u32,
    pub xvfb_bin: String,
    pub rfb_bin: String,
}

struct Managed {
    child: Child,
    pid: u32,
}

struct Inner {
    display: Option<Managed>,
    framebuffer: Option<Managed>,
    stopping: bool,
}

/// Single process-wide handle with explicit start/stop lifecycle: owns
/// both children and the restart schedule.
pub struct DisplaySupervisor {
    config: DisplaySupervisorConfig,
    inner: Mutex<Inner>,
    status: RwLock<DisplayStatus>,
    restart_timers: Mutex<HashMap<ProcessKind, tokio::task::JoinHandle<()>>>,
}

impl DisplaySupervisor {
    pub fn new(config: DisplaySupervisorConfig) -> Arc<Self> {
        let display_number = config.display_number;
        Arc::new(Self {
            config,
            inner: Mutex::new(Inner {
                display: None,
                framebuffer: None,
                stopping: false,
            }),
            status: RwLock::new(DisplayStatus {
                display_number,
                ..Default::default()
            }),
            restart_timers: Mutex::new(HashMap::new()),
        })
    }

    /// Read-only snapshot for the status endpoint; never mutated by readers.
    pub async fn status(&self) -> DisplayStatus {
        self.status.read().await.clone()
    }

    /// Report whether both required binaries are on `PATH`. Step 1 of the
    /// startup sequence; callers treat a `false` result as "disabled", not
    /// an error.
    pub fn binaries_discoverable(&self) -> bool {
        which::which(&self.config.xvfb_bin).is_ok() && which::which(&self.config.rfb_bin).is_ok()
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if !self.binaries_discoverable() {
            anyhow::bail!("display supervisor binaries not discoverable on PATH");
        }

        {
            let mut inner = self.inner.lock().await;
            inner.stopping = false;
        }

        self.start_display().await?;
        self.wait_for_lock().await?;
        self.start_framebuffer().await?;
        Ok(())
    }

    async fn start_display(self: &Arc<Self>) -> Result<()> {
        let lock_path = self.lock_path();
        if let Some(pid) = read_live_lock_pid(&lock_path) {
            tracing::info!(pid, "reusing existing live display");
            let mut status = self.status.write().await;
            status.running = true;
            status.display_pid = Some(pid);
            return Ok(());
        }
        if lock_path.exists() {
            tracing::warn!(path = %lock_path.display(), "removing stale display lock");
            let _ = std::fs::remove_file(&lock_path);
        }

        let display_arg = format!(":{}", self.config.display_number);
        let child = Command::new(&self.config.xvfb_bin)
            .arg(&display_arg)
            .arg("-screen")
            .arg("0")
            .arg("1280x720x24")
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.config.xvfb_bin))?;
        let pid = child.id().context("spawned display process has no pid")?;

        {
            let mut inner = self.inner.lock().await;
            inner.display = Some(Managed { child, pid });
        }
        self.spawn_exit_watcher(ProcessKind::Display);
        {
            let mut status = self.status.write().await;
            status.running = true;
            status.display_pid = Some(pid);
        }
        tracing::info!(pid, display = %display_arg, "spawned virtual display");
        Ok(())
    }

    async fn start_framebuffer(self: &Arc<Self>) -> Result<()> {
        let display_arg = format!(":{}", self.config.display_number);
        let child = Command::new(&self.config.rfb_bin)
            .arg("-display")
            .arg(&display_arg)
            .arg("-forever")
            .arg("-shared")
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.config.rfb_bin))?;
        let pid = child.id().context("spawned framebuffer process has no pid")?;

        {
            let mut inner = self.inner.lock().await;
            inner.framebuffer = Some(Managed { child, pid });
        }
        self.spawn_exit_watcher(ProcessKind::Framebuffer);
        {
            let mut status = self.status.write().await;
            status.framebuffer_pid = Some(pid);
        }
        tracing::info!(pid, "spawned framebuffer server");
        Ok(())
    }

    async fn wait_for_lock(&self) -> Result<()> {
        let lock_path = self.lock_path();
        let deadline = tokio::time::Instant::now() + LOCK_POLL_DEADLINE;
        while tokio::time::Instant::now() < deadline {
            if lock_path.exists() {
                sleep(LOCK_GRACE_PERIOD).await;
                return Ok(());
            }
            sleep(LOCK_POLL_INTERVAL).await;
        }
        anyhow::bail!(
            "display lock {} did not appear within {:?}",
            lock_path.display(),
            LOCK_POLL_DEADLINE
        )
    }

    fn lock_path(&self) -> PathBuf {
        PathBuf::from(format!("/tmp/.X{}-lock", self.config.display_number))
    }

    /// Spawns the task that awaits this child's exit and, if it wasn't a
    /// deliberate stop, schedules a restart. Must only be called after the
    /// child has already been stored in `inner` under `kind`.
    fn spawn_exit_watcher(self: &Arc<Self>, kind: ProcessKind) {
        let this = self.clone();
        tokio::spawn(async move {
            this.watch_and_maybe_restart(kind).await;
        });
    }

    async fn watch_and_maybe_restart(self: Arc<Self>, kind: ProcessKind) {
        let exit = {
            let mut inner = self.inner.lock().await;
            let managed = match kind {
                ProcessKind::Display => inner.display.as_mut(),
                ProcessKind::Framebuffer => inner.framebuffer.as_mut(),
            };
            match managed {
                Some(m) => Some(m.child.wait().await),
                None => None,
            }
        };
        let Some(exit) = exit else { return };

        let stopping = self.inner.lock().await.stopping;
        if stopping {
            return;
        }

        log_exit(kind, &exit);
        self.schedule_restart(kind).await;
    }

    async fn schedule_restart(self: &Arc<Self>, kind: ProcessKind) {
        let mut timers = self.restart_timers.lock().await;
        if timers.contains_key(&kind) {
            // At most one pending restart per kind.
            return;
        }
        let this = self.clone();
        let handle = tokio::spawn(async move {
            sleep(RESTART_DEBOUNCE).await;
            if this.inner.lock().await.stopping {
                return;
            }
            match kind {
                ProcessKind::Display => {
                    if this.start_display().await.is_ok() {
                        sleep(FRAMEBUFFER_RESTART_DELAY).await;
                        if !this.inner.lock().await.stopping {
                            let _ = this.start_framebuffer().await;
                        }
                    }
                }
                ProcessKind::Framebuffer => {
                    let _ = this.start_framebuffer().await;
                }
            }
            this.restart_timers.lock().await.remove(&kind);
        });
        timers.insert(kind, handle);
    }

    /// Flips `stopping`, cancels pending restarts, SIGTERMs both children,
    /// and clears state. Idempotent: stopping an already-stopped supervisor
    /// is a no-op.
    pub async fn stop(&self) {
        {
            let mut inner = self.inner.lock().await;
            if inner.stopping {
                return;
            }
            inner.stopping = true;
        }

        for (_, handle) in self.restart_timers.lock().await.drain() {
            handle.abort();
        }

        let mut inner = self.inner.lock().await;
        if let Some(managed) = inner.display.take() {
            send_sigterm(managed.pid);
        }
        if let Some(managed) = inner.framebuffer.take() {
            send_sigterm(managed.pid);
        }

        let mut status = self.status.write().await;
        *status = DisplayStatus {
            display_number: self.config.display_number,
            ..Default::default()
        };
    }

    pub async fn restart(self: &Arc<Self>) -> Result<()> {
        self.stop().await;
        self.start().await
    }
}

fn log_exit(kind: ProcessKind, exit: &std::io::Result<ExitStatus>) {
    match exit {
        Ok(status) => tracing::warn!(?kind, %status, "supervised process exited unexpectedly"),
        Err(err) => tracing::warn!(?kind, %err, "error waiting on supervised process"),
    }
}

fn send_sigterm(pid: u32) {
    // SAFETY: `kill` with a valid pid and a standard signal number is not
    // memory-unsafe; it can only fail (ESRCH/EPERM) if the process is
    // already gone or unreachable, both of which are fine outcomes here.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

/// Parses an X11-style lock file (`/tmp/.X{N}-lock`, whitespace-padded pid
/// text) and returns the pid only if a process with that pid still exists.
fn read_live_lock_pid(path: &std::path::Path) -> Option<u32> {
    let contents = std::fs::read_to_string(path).ok()?;
    let pid: u32 = contents.trim().parse().ok()?;
    let alive = unsafe { libc::kill(pid as libc::pid_t, 0) == 0 };
    alive.then_some(pid)
}
