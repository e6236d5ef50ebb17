//! Process-wide configuration, loaded once at startup from CLI flags with
//! environment-variable fallbacks.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use ipnet::IpNet;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Multiplexing HTTP/WebSocket gateway")]
pub struct Args {
    /// Address the main listener binds to.
    #[arg(long, env = "GATEWAY_LISTEN", default_value = "127.0.0.1:8787")]
    pub listen: SocketAddr,

    /// Shared secret for bearer/password authorization. Unset disables
    /// credential-based auth entirely (only TLS-mesh/sibling fallback apply).
    #[arg(long, env = "GATEWAY_SECRET")]
    pub secret: Option<String>,

    /// Treat requests arriving over the TLS mesh as pre-authorized.
    #[arg(long, env = "GATEWAY_TLS_MESH_PERMISSIVE", default_value_t = false)]
    pub tls_mesh_permissive: bool,

    /// Trusted reverse-proxy CIDRs, comma-separated (e.g. "10.0.0.0/8,127.0.0.1/32").
    #[arg(long, env = "GATEWAY_TRUSTED_PROXIES", value_delimiter = ',')]
    pub trusted_proxies: Vec<IpNet>,

    /// Disable the machine-scoped sibling-IP fallback. Required when the
    /// gateway sits behind shared-IP NAT.
    #[arg(long, env = "GATEWAY_DISABLE_SIBLING_FALLBACK", default_value_t = false)]
    pub disable_sibling_fallback: bool,

    /// Base path for the webhook receiver, e.g. "/hooks". Unset disables hooks.
    #[arg(long, env = "GATEWAY_HOOKS_BASE")]
    pub hooks_base: Option<String>,

    /// Shared secret hook callers must present.
    #[arg(long, env = "GATEWAY_HOOKS_SECRET")]
    pub hooks_secret: Option<String>,

    /// Maximum hook request body size in bytes.
    #[arg(long, env = "GATEWAY_HOOKS_MAX_BODY", default_value_t = 1_048_576)]
    pub hooks_max_body_bytes: usize,

    /// Comma-separated allowlist of agent ids the `agent` hook may target.
    /// Empty means "allow any".
    #[arg(long, env = "GATEWAY_HOOKS_AGENT_ALLOWLIST", value_delimiter = ',')]
    pub hooks_agent_allowlist: Vec<String>,

    /// Default session key used when a hook request omits one and the
    /// resolution policy requires it.
    #[arg(long, env = "GATEWAY_HOOKS_DEFAULT_SESSION_KEY")]
    pub hooks_default_session_key: Option<String>,

    /// Enable the framebuffer viewer HTTP/WS subtree.
    #[arg(long, env = "GATEWAY_VIEWER_ENABLED", default_value_t = false)]
    pub viewer_enabled: bool,

    /// URL base path the viewer is served under, e.g. "/vnc".
    #[arg(long, env = "GATEWAY_VIEWER_BASE", default_value = "/vnc")]
    pub viewer_base: String,

    /// Directory containing the bundled noVNC static assets.
    #[arg(long, env = "GATEWAY_VIEWER_WEB_ROOT")]
    pub viewer_web_root: Option<PathBuf>,

    /// Host:port of the upstream RFB/VNC server the viewer bridges to.
    #[arg(long, env = "GATEWAY_VIEWER_TARGET_HOST", default_value = "127.0.0.1")]
    pub viewer_target_host: String,

    #[arg(long, env = "GATEWAY_VIEWER_TARGET_PORT", default_value_t = 5901)]
    pub viewer_target_port: u16,

    /// Enable the display supervisor (virtual display + RFB server).
    #[arg(long, env = "GATEWAY_DISPLAY_SUPERVISOR_ENABLED", default_value_t = false)]
    pub display_supervisor_enabled: bool,

    /// Display number to use, e.g. 99 for ":99".
    #[arg(long, env = "GATEWAY_DISPLAY_NUMBER", default_value_t = 99)]
    pub display_number: u32,

    /// Virtual display server binary, looked up on `PATH` via `which`.
    #[arg(long, env = "GATEWAY_DISPLAY_XVFB_BIN", default_value = "Xvfb")]
    pub display_xvfb_bin: String,

    /// Remote-framebuffer server binary, bound to the virtual display.
    #[arg(long, env = "GATEWAY_DISPLAY_RFB_BIN", default_value = "x11vnc")]
    pub display_rfb_bin: String,

    /// Directory the launcher keeps the browser's user-data profile in.
    #[arg(long, env = "GATEWAY_PROFILE_DIR")]
    pub profile_dir: Option<PathBuf>,

    /// Browser executable, looked up on `PATH` via `which` unless it's an
    /// absolute path.
    #[arg(long, env = "GATEWAY_BROWSER_BIN", default_value = "chromium")]
    pub browser_bin: String,

    /// Chrome DevTools Protocol debugging port the launcher spawns with.
    #[arg(long, env = "GATEWAY_BROWSER_CDP_PORT", default_value_t = 9222)]
    pub browser_cdp_port: u16,

    /// Launch the browser headless.
    #[arg(long, env = "GATEWAY_BROWSER_HEADLESS", default_value_t = true)]
    pub browser_headless: bool,

    /// Launch the browser with its OS sandbox enabled.
    #[arg(long, env = "GATEWAY_BROWSER_SANDBOXED", default_value_t = false)]
    pub browser_sandboxed: bool,

    /// Pass the stealth (anti-automation-detection) flag set.
    #[arg(long, env = "GATEWAY_BROWSER_STEALTH", default_value_t = false)]
    pub browser_stealth: bool,

    /// Upstream proxy the browser routes its own traffic through.
    #[arg(long, env = "GATEWAY_BROWSER_PROXY_URL")]
    pub browser_proxy_url: Option<String>,

    /// Extra extension directory loaded alongside the browser's own.
    #[arg(long, env = "GATEWAY_BROWSER_EXTENSION_PATH")]
    pub browser_extension_path: Option<PathBuf>,

    /// Enable the canvas/UI host subtree (external handler, machine-scoped).
    #[arg(long, env = "GATEWAY_CANVAS_ENABLED", default_value_t = false)]
    pub canvas_enabled: bool,

    /// URL base path the canvas host is served under, e.g. "/canvas".
    #[arg(long, env = "GATEWAY_CANVAS_BASE", default_value = "/canvas")]
    pub canvas_base: String,

    /// WebSocket path the canvas host upgrades on.
    #[arg(long, env = "GATEWAY_CANVAS_WS_PATH", default_value = "/canvas/ws")]
    pub canvas_ws_path: String,

    /// URL prefix for plugin-provided channels; requests under this prefix
    /// are authorized via the full authorizer before the plugin handler
    /// sees them.
    #[arg(long, env = "GATEWAY_CHANNELS_PREFIX", default_value = "/channels")]
    pub channels_prefix: String,

    /// Enable the OpenAI-style protocol-translating endpoint.
    #[arg(long, env = "GATEWAY_OPENAI_COMPAT_ENABLED", default_value_t = false)]
    pub openai_compat_enabled: bool,

    /// Enable the Responses-style protocol-translating endpoint.
    #[arg(long, env = "GATEWAY_RESPONSES_COMPAT_ENABLED", default_value_t = false)]
    pub responses_compat_enabled: bool,
}

/// Resolved, immutable configuration handed to every subsystem constructor.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub secret: Option<String>,
    pub tls_mesh_permissive: bool,
    pub trusted_proxies: Vec<IpNet>,
    pub disable_sibling_fallback: bool,

    pub hooks: Option<HooksConfig>,

    pub viewer_enabled: bool,
    pub viewer_base: String,
    pub viewer_web_root: Option<PathBuf>,
    pub viewer_target_host: String,
    pub viewer_target_port: u16,

    pub display_supervisor_enabled: bool,
    pub display_number: u32,
    pub display_xvfb_bin: String,
    pub display_rfb_bin: String,
    pub profile_dir: Option<PathBuf>,
    pub browser_bin: String,
    pub browser_cdp_port: u16,
    pub browser_headless: bool,
    pub browser_sandboxed: bool,
    pub browser_stealth: bool,
    pub browser_proxy_url: Option<String>,
    pub browser_extension_path: Option<PathBuf>,

    pub canvas_enabled: bool,
    pub canvas_base: String,
    pub canvas_ws_path: String,
    pub channels_prefix: String,
    pub openai_compat_enabled: bool,
    pub responses_compat_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct HooksConfig {
    pub base_path: String,
    pub secret: String,
    pub max_body_bytes: usize,
    pub agent_allowlist: Vec<String>,
    pub default_session_key: Option<String>,
}

pub const DEFAULT_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_RATE_LIMIT_MAX_FAILURES: u32 = 20;
pub const DEFAULT_RATE_LIMIT_CAPACITY: usize = 4096;

impl Config {
    pub fn from_args(args: Args) -> Self {
        let hooks = match (args.hooks_base, args.hooks_secret) {
            (Some(base_path), Some(secret)) => Some(HooksConfig {
                base_path,
                secret,
                max_body_bytes: args.hooks_max_body_bytes,
                agent_allowlist: args.hooks_agent_allowlist,
                default_session_key: args.hooks_default_session_key,
            }),
            _ => None,
        };

        Self {
            listen: args.listen,
            secret: args.secret,
            tls_mesh_permissive: args.tls_mesh_permissive,
            trusted_proxies: args.trusted_proxies,
            disable_sibling_fallback: args.disable_sibling_fallback,
            hooks,
            viewer_enabled: args.viewer_enabled,
            viewer_base: args.viewer_base,
            viewer_web_root: args.viewer_web_root,
            viewer_target_host: args.viewer_target_host,
            viewer_target_port: args.viewer_target_port,
            display_supervisor_enabled: args.display_supervisor_enabled,
            display_number: args.display_number,
            display_xvfb_bin: args.display_xvfb_bin,
            display_rfb_bin: args.display_rfb_bin,
            profile_dir: args.profile_dir,
            browser_bin: args.browser_bin,
            browser_cdp_port: args.browser_cdp_port,
            browser_headless: args.browser_headless,
            browser_sandboxed: args.browser_sandboxed,
            browser_stealth: args.browser_stealth,
            browser_proxy_url: args.browser_proxy_url,
            browser_extension_path: args.browser_extension_path,
            canvas_enabled: args.canvas_enabled,
            canvas_base: args.canvas_base,
            canvas_ws_path: args.canvas_ws_path,
            channels_prefix: args.channels_prefix,
            openai_compat_enabled: args.openai_compat_enabled,
            responses_compat_enabled: args.responses_compat_enabled,
        }
    }

    /// Logs a one-time warning if the viewer is reachable beyond loopback
    /// without any credential gate. See DESIGN.md open question 1.
    pub fn warn_if_viewer_exposed(&self) {
        if !self.viewer_enabled {
            return;
        }
        let loopback_only = self.listen.ip().is_loopback();
        if !loopback_only && self.secret.is_none() && !self.tls_mesh_permissive {
            tracing::warn!(
                listen = %self.listen,
                "framebuffer viewer is enabled on a non-loopback listener with no shared secret \
                 or TLS-mesh trust configured; the websocket upgrade path performs no auth of its own"
            );
        }
    }
}
