//! Browser launcher: spawns the controlled browser against a cleaned
//! profile and waits for its debugging endpoint to become reachable.
//!
//! Executable discovery goes through `which`; readiness is an HTTP poll of
//! `/json/version` followed by a WebSocket handshake to the advertised
//! debugger URL, confirming the endpoint is not just listening but actually
//! accepting protocol connections.

use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::sleep;

const READY_DEADLINE: Duration = Duration::from_secs(30);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(200);
const EARLY_CRASH_WINDOW: Duration = Duration::from_secs(5);
const STOP_POLL_DEADLINE: Duration = Duration::from_millis(2500);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Signals that, within the early-crash window, are treated as profile
/// corruption rather than a genuine unrecoverable failure.
const EARLY_CRASH_SIGNALS: [i32; 5] = [
    libc::SIGTRAP,
    libc::SIGABRT,
    libc::SIGSEGV,
    libc::SIGBUS,
    libc::SIGFPE,
];

#[derive(Debug, Clone)]
pub struct BrowserLauncherConfig {
    pub executable: String,
    pub profile_dir: PathBuf,
    pub cdp_port: u16,
    pub headless: bool,
    pub sandboxed: bool,
    pub stealth: bool,
    pub proxy_url: Option<String>,
    pub extension_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct BrowserStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub cdp_port: Option<u16>,
    pub tabs: usize,
    pub stealth: bool,
}

struct Running {
    child: Child,
    pid: u32,
    started_at: Instant,
}

pub struct BrowserLauncher {
    config: BrowserLauncherConfig,
    running: Mutex<Option<Running>>,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct VersionInfo {
    #[serde(rename = "webSocketDebuggerUrl")]
    websocket_debugger_url: String,
}

impl BrowserLauncher {
    pub fn new(config: BrowserLauncherConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            running: Mutex::new(None),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(2))
                .build()
                .expect("reqwest client builds with static config"),
        })
    }

    pub async fn status(&self) -> BrowserStatus {
        let guard = self.running.lock().await;
        let Some(running) = guard.as_ref() else {
            return BrowserStatus {
                stealth: self.config.stealth,
                ..Default::default()
            };
        };
        let tabs = self.list_tabs().await.map(|t| t.len()).unwrap_or(0);
        BrowserStatus {
            running: true,
            pid: Some(running.pid),
            cdp_port: Some(self.config.cdp_port),
            tabs,
            stealth: self.config.stealth,
        }
    }

    /// Starting an already-started launcher returns the same handle
    /// rather than spawning a second process.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.lock().await.is_some() {
            return Ok(());
        }
        self.start_inner(true).await
    }

    async fn start_inner(self: &Arc<Self>, allow_corruption_retry: bool) -> Result<()> {
        self.cleanup_before_spawn().await?;

        let argv = self.compose_argv();
        tracing::info!(executable = %self.config.executable, ?argv, "spawning browser");

        let child = Command::new(&self.config.executable)
            .args(&argv)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.config.executable))?;
        let pid = child.id().context("spawned browser process has no pid")?;
        let started_at = Instant::now();

        {
            let mut guard = self.running.lock().await;
            *guard = Some(Running {
                child,
                pid,
                started_at,
            });
        }

        match self.await_readiness_or_early_exit().await {
            ReadinessOutcome::Ready => {
                self.decorate_profile_if_needed().await?;
                Ok(())
            }
            ReadinessOutcome::EarlyCrash(signal) if allow_corruption_retry => {
                tracing::warn!(
                    signal,
                    "browser crashed within the early-crash window; treating as profile corruption"
                );
                self.running.lock().await.take();
                self.nuke_corrupted_profile_paths()?;
                Box::pin(self.start_inner(false)).await
            }
            ReadinessOutcome::EarlyCrash(signal) => {
                self.running.lock().await.take();
                anyhow::bail!("browser crashed again within the early-crash window (signal {signal}); giving up")
            }
            ReadinessOutcome::TimedOut => {
                self.running.lock().await.take();
                anyhow::bail!(
                    "browser debugging endpoint did not become reachable within {:?}",
                    READY_DEADLINE
                )
            }
        }
    }

    async fn await_readiness_or_early_exit(&self) -> ReadinessOutcome {
        let deadline = Instant::now() + READY_DEADLINE;
        loop {
            if Instant::now() >= deadline {
                return ReadinessOutcome::TimedOut;
            }

            {
                let mut guard = self.running.lock().await;
                if let Some(running) = guard.as_mut() {
                    if let Ok(Some(exit)) = running.child.try_wait() {
                        let elapsed = running.started_at.elapsed();
                        if elapsed < EARLY_CRASH_WINDOW {
                            if let Some(signal) = exit.signal() {
                                if EARLY_CRASH_SIGNALS.contains(&signal) {
                                    return ReadinessOutcome::EarlyCrash(signal);
                                }
                            }
                        }
                    }
                }
            }

            if self.probe_cdp_ready().await {
                return ReadinessOutcome::Ready;
            }

            sleep(READY_POLL_INTERVAL).await;
        }
    }

    async fn probe_cdp_ready(&self) -> bool {
        let Some(ws_url) = self.fetch_websocket_debugger_url().await else {
            return false;
        };
        match tokio_tungstenite::connect_async(&ws_url).await {
            Ok((mut stream, _)) => {
                use futures_util::SinkExt;
                let _ = stream.close(None).await;
                true
            }
            Err(err) => {
                tracing::debug!(%err, "cdp websocket handshake not ready yet");
                false
            }
        }
    }

    async fn fetch_websocket_debugger_url(&self) -> Option<String> {
        let url = format!("http://127.0.0.1:{}/json/version", self.config.cdp_port);
        let resp = self.http.get(&url).send().await.ok()?;
        let info: VersionInfo = resp.json().await.ok()?;
        Some(info.websocket_debugger_url)
    }

    async fn list_tabs(&self) -> Option<Vec<serde_json::Value>> {
        let url = format!("http://127.0.0.1:{}/json/list", self.config.cdp_port);
        let resp = self.http.get(&url).send().await.ok()?;
        resp.json().await.ok()
    }

    fn compose_argv(&self) -> Vec<String> {
        let mut argv = vec![
            format!("--remote-debugging-port={}", self.config.cdp_port),
            format!(
                "--user-data-dir={}",
                self.config.profile_dir.display()
            ),
            "--no-first-run".to_string(),
            "--no-default-browser-check".to_string(),
        ];
        if self.config.headless {
            argv.push("--headless=new".to_string());
        }
        if !self.config.sandboxed {
            argv.push("--no-sandbox".to_string());
        }
        if self.config.stealth {
            argv.push("--disable-blink-features=AutomationControlled".to_string());
        }
        if let Some(proxy) = &self.config.proxy_url {
            argv.push(format!("--proxy-server={proxy}"));
        }
        if let Some(ext) = &self.config.extension_path {
            argv.push(format!("--load-extension={}", ext.display()));
        }
        if cfg!(target_os = "linux") {
            argv.push("--disable-dev-shm-usage".to_string());
        }
        argv
    }

    async fn cleanup_before_spawn(&self) -> Result<()> {
        for lock_name in ["SingletonLock", "SingletonSocket", "SingletonCookie"] {
            let path = self.config.profile_dir.join(lock_name);
            if path.exists() {
                let _ = tokio::fs::remove_file(&path).await;
            }
        }
        self.purge_crash_reports().await
    }

    async fn purge_crash_reports(&self) -> Result<()> {
        let crash_dir = self.config.profile_dir.join("Crash Reports");
        if crash_dir.exists() {
            let _ = tokio::fs::remove_dir_all(&crash_dir).await;
        }
        Ok(())
    }

    fn nuke_corrupted_profile_paths(&self) -> Result<()> {
        const CORRUPTION_SUSPECTS: [&str; 5] = [
            "Default/Preferences",
            "Default/Cache",
            "Default/GPUCache",
            "Default/File System",
            "Default/IndexedDB",
        ];
        for rel in CORRUPTION_SUSPECTS {
            let path = self.config.profile_dir.join(rel);
            if path.is_dir() {
                let _ = std::fs::remove_dir_all(&path);
            } else if path.is_file() {
                let _ = std::fs::remove_file(&path);
            }
        }
        Ok(())
    }

    async fn decorate_profile_if_needed(&self) -> Result<()> {
        let marker = self.config.profile_dir.join(".decorated");
        if marker.exists() {
            return Ok(());
        }
        // Cosmetic profile decoration (name/color) is an external
        // collaborator's concern in the original system; the core's only
        // obligation is not to redo it on every restart.
        tokio::fs::write(&marker, b"1")
            .await
            .context("failed to write profile decoration marker")?;
        Ok(())
    }

    /// SIGTERM, then poll debugging reachability for up to 2.5s, then
    /// SIGKILL if it's still up.
    pub async fn stop(&self) {
        let pid = {
            let guard = self.running.lock().await;
            guard.as_ref().map(|r| r.pid)
        };
        let Some(pid) = pid else { return };

        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }

        let deadline = Instant::now() + STOP_POLL_DEADLINE;
        while Instant::now() < deadline {
            if !self.probe_cdp_ready().await {
                break;
            }
            sleep(STOP_POLL_INTERVAL).await;
        }

        if self.probe_cdp_ready().await {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGKILL);
            }
        }

        self.running.lock().await.take();
    }
}

enum ReadinessOutcome {
    Ready,
    EarlyCrash(i32),
    TimedOut,
}
