//! Gateway entry point: parses configuration, wires every optional
//! subsystem the config turns on, and serves the router until shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;

use relaygate::auth::Authorizer;
use relaygate::browser::{BrowserLauncher, BrowserLauncherConfig};
use relaygate::config::{
    Args, Config, DEFAULT_RATE_LIMIT_CAPACITY, DEFAULT_RATE_LIMIT_MAX_FAILURES,
    DEFAULT_RATE_LIMIT_WINDOW,
};
use relaygate::display::{DisplaySupervisor, DisplaySupervisorConfig};
use relaygate::hooks::{AgentDispatch, AgentRequest, BoxFuture, HooksState, WakeRequest, WakeSink};
use relaygate::proxy::FramebufferTarget;
use relaygate::ratelimit::AuthRateLimiter;
use relaygate::registry::ClientRegistry;
use relaygate::router::external::ExternalHandlers;
use relaygate::router::{build_router, AppState};

/// Wake/agent dispatch for a gateway run with hooks enabled but no
/// downstream session manager wired in. Any call fails loudly rather than
/// silently succeeding, since a `{ok: true}` response with nothing behind
/// it would be worse than a 500.
struct UnwiredHooksBackend;

impl WakeSink for UnwiredHooksBackend {
    fn wake(&self, _req: WakeRequest) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            anyhow::bail!("hooks are enabled but no wake sink is wired into this gateway")
        })
    }
}

impl AgentDispatch for UnwiredHooksBackend {
    fn dispatch(&self, _req: AgentRequest) -> BoxFuture<'_, anyhow::Result<String>> {
        Box::pin(async move {
            anyhow::bail!("hooks are enabled but no agent dispatcher is wired into this gateway")
        })
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relaygate=info,hyper=warn".into()),
        )
        .compact()
        .init();

    let config = Arc::new(Config::from_args(args));
    config.warn_if_viewer_exposed();

    let registry = ClientRegistry::new();
    let rate_limiter = Arc::new(AuthRateLimiter::new(
        DEFAULT_RATE_LIMIT_WINDOW,
        DEFAULT_RATE_LIMIT_MAX_FAILURES,
        DEFAULT_RATE_LIMIT_CAPACITY,
    ));
    let authorizer = Arc::new(Authorizer::new(
        config.secret.clone(),
        config.tls_mesh_permissive,
        config.trusted_proxies.clone(),
        config.disable_sibling_fallback,
        rate_limiter,
        registry.clone(),
    ));

    let hooks = config.hooks.clone().map(|hooks_config| {
        let failure_limiter = Arc::new(AuthRateLimiter::new(
            DEFAULT_RATE_LIMIT_WINDOW,
            DEFAULT_RATE_LIMIT_MAX_FAILURES,
            DEFAULT_RATE_LIMIT_CAPACITY,
        ));
        let backend = Arc::new(UnwiredHooksBackend);
        Arc::new(HooksState::new(
            hooks_config,
            failure_limiter,
            Vec::new(),
            backend.clone(),
            backend,
        ))
    });

    let framebuffer_target = config.viewer_enabled.then(|| {
        Arc::new(FramebufferTarget::new(
            config.viewer_target_host.clone(),
            config.viewer_target_port,
        ))
    });

    let display_supervisor = if config.display_supervisor_enabled {
        let supervisor = DisplaySupervisor::new(DisplaySupervisorConfig {
            display_number: config.display_number,
            xvfb_bin: config.display_xvfb_bin.clone(),
            rfb_bin: config.display_rfb_bin.clone(),
        });
        if let Err(err) = supervisor.start().await {
            tracing::error!(%err, "display supervisor failed to start at boot");
        }
        Some(supervisor)
    } else {
        None
    };

    let browser_launcher = config.profile_dir.clone().map(|profile_dir| {
        BrowserLauncher::new(BrowserLauncherConfig {
            executable: config.browser_bin.clone(),
            profile_dir,
            cdp_port: config.browser_cdp_port,
            headless: config.browser_headless,
            sandboxed: config.browser_sandboxed,
            stealth: config.browser_stealth,
            proxy_url: config.browser_proxy_url.clone(),
            extension_path: config.browser_extension_path.clone(),
        })
    });

    let state = Arc::new(AppState {
        config: config.clone(),
        authorizer,
        registry,
        hooks,
        framebuffer_target,
        display_supervisor,
        browser_launcher,
        external: ExternalHandlers::default(),
    });

    let router = build_router(state.clone())
        .into_make_service_with_connect_info::<SocketAddr>();

    let listener = match tokio::net::TcpListener::bind(config.listen).await {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("failed to bind {}: {err}", config.listen);
            std::process::exit(1);
        }
    };
    tracing::info!(listen = %config.listen, "relaygate listening");

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received, draining connections");
    };

    if let Err(err) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
    {
        eprintln!("server task failed: {err}");
        std::process::exit(1);
    }

    if let Some(supervisor) = &state.display_supervisor {
        supervisor.stop().await;
    }
    if let Some(launcher) = &state.browser_launcher {
        launcher.stop().await;
    }
}
