//! Lifecycle supervision: engine-set selection, signal handling, and the
//! shared drain/persistence plumbing.
//!
//! The supervisor owns the admission semaphore, the user store, the
//! bandwidth tracker, and the reloadable certificate pair; each engine
//! receives handles. SIGINT/SIGTERM cancel the root token and begin the
//! drain; SIGHUP re-reads the certificate pair (and, in the forward-proxy
//! modes, the user catalog) from disk.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use passage_auth::UserStore;
use passage_bandwidth::Tracker;
use passage_config::{Config, EnvConfig, ProxyMode};

use crate::engine::{Engine, HttpEngine, SignalEngine, Socks5Engine};
use crate::error::ServerError;
use crate::tls::ReloadableCert;

/// Run the engine set for the configured mode until `shutdown` fires and
/// the drain completes.
pub async fn run(
    config: Config,
    env: EnvConfig,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let admission = Arc::new(Semaphore::new(config.max_conns));
    info!(
        mode = env.proxy_mode.as_str(),
        max_conns = config.max_conns,
        "starting passage"
    );

    if env.proxy_mode.is_forward_proxy() {
        run_forward_proxy(config, env, shutdown, admission).await
    } else {
        run_signal(config, env, shutdown, admission).await
    }
}

async fn run_signal(
    config: Config,
    _env: EnvConfig,
    shutdown: CancellationToken,
    admission: Arc<Semaphore>,
) -> Result<(), ServerError> {
    let tls = ReloadableCert::load(&config.cert_file, &config.key_file)?;

    #[cfg(unix)]
    spawn_reload_handler(shutdown.clone(), tls.clone(), None);

    let engine = SignalEngine::new(Arc::new(config), tls, admission);
    let result = engine.run(shutdown.clone()).await;
    shutdown.cancel();
    result
}

async fn run_forward_proxy(
    config: Config,
    env: EnvConfig,
    shutdown: CancellationToken,
    admission: Arc<Semaphore>,
) -> Result<(), ServerError> {
    let users = Arc::new(UserStore::load(&env.users_file)?);
    info!(
        users = users.user_count(),
        file = %env.users_file,
        "user store ready"
    );

    let tracker = Arc::new(Tracker::new(&env.bandwidth_file));
    let persist = tokio::spawn(tracker.clone().run_persist_loop(shutdown.clone()));

    // TLS is optional here: the plaintext listener always runs, the TLS
    // listener only when enabled and loadable.
    let tls = if env.http_proxy_tls {
        Some(ReloadableCert::load(&config.cert_file, &config.key_file)?)
    } else {
        None
    };

    #[cfg(unix)]
    if let Some(tls) = &tls {
        spawn_reload_handler(shutdown.clone(), tls.clone(), Some(users.clone()));
    }

    let idle_timeout = Duration::from_secs(config.timeout_sec);
    let http = HttpEngine::new(
        env.clone(),
        users.clone(),
        tracker.clone(),
        tls,
        admission.clone(),
        idle_timeout,
    );
    let socks5 = Socks5Engine::new(
        env.socks5_port.clone(),
        users,
        tracker.clone(),
        admission,
        idle_timeout,
    );

    let result = tokio::try_join!(http.run(shutdown.clone()), socks5.run(shutdown.clone()));

    // Whether the engines drained cleanly or one failed to bind, flush the
    // accounting state on the way down.
    shutdown.cancel();
    if let Err(e) = persist.await {
        warn!(error = %e, "bandwidth persistence task panicked");
        tracker.persist();
    }

    result.map(|_| ())
}

/// SIGHUP → reload certificate material (and the user catalog when a
/// store is attached). Failures are logged, never fatal.
#[cfg(unix)]
fn spawn_reload_handler(
    shutdown: CancellationToken,
    tls: Arc<ReloadableCert>,
    users: Option<Arc<UserStore>>,
) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut sighup = match signal(SignalKind::hangup()) {
            Ok(sig) => sig,
            Err(e) => {
                warn!(error = %e, "failed to install SIGHUP handler, hot reload disabled");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                received = sighup.recv() => {
                    if received.is_none() {
                        return;
                    }
                    info!("SIGHUP received, reloading");
                    if let Err(e) = tls.reload() {
                        warn!(error = %e, "certificate reload failed");
                    }
                    if let Some(users) = &users {
                        match users.reload() {
                            Ok(count) => info!(users = count, "user catalog reloaded"),
                            Err(e) => warn!(error = %e, "user catalog reload failed"),
                        }
                    }
                }
            }
        }
    });
}

/// Wait for SIGINT or SIGTERM, then cancel the root token.
pub async fn shutdown_on_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received, draining");
    shutdown.cancel();
}
