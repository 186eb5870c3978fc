use core::time::Duration;
use tokio::signal;

/// Delay between receiving a shutdown signal and tearing resources down.
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(1);

/// Resolves on the first of SIGINT (Ctrl+C), SIGTERM or SIGQUIT, returning
/// the signal's name. Only Ctrl+C is watched on non-unix platforms.
///
/// # Panics
///
/// Panics if a signal handler cannot be installed.
pub async fn wait_for_signal() -> &'static str {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(unix)]
    let quit = async {
        signal::unix::signal(signal::unix::SignalKind::quit())
            .expect("failed to install SIGQUIT handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = core::future::pending::<()>();
    #[cfg(not(unix))]
    let quit = core::future::pending::<()>();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let name = tokio::select! {
        () = ctrl_c => "SIGINT",
        () = terminate => "SIGTERM",
        () = quit => "SIGQUIT",
    };
    tracing::info!(signal = name, "received shutdown signal");
    name
}
