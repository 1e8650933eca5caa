//! Shutdown sequence for a gRPC server.

use std::future::Future;

use crate::error::{Error, ShutdownError, ShutdownStep};
use crate::server::Server;

/// Stop `server` gracefully, then run its cleanup hooks.
///
/// Steps run in order: drain the server, run the graceful shutdown handler,
/// then flush the tracer provider. A failing step is logged and the next
/// one still runs; every failure is returned together.
pub async fn graceful_shutdown(server: &Server) -> Result<(), ShutdownError> {
    server.graceful_stop().await;

    let config = server.config();
    let steps = [
        (
            ShutdownStep::GracefulShutdownHandler,
            config.graceful_shutdown_handler.clone(),
        ),
        (
            ShutdownStep::TracerProviderShutdown,
            config.tracer_shutdown_handler(),
        ),
    ];

    let mut failures = Vec::new();
    for (step, handler) in steps {
        let Some(handler) = handler else { continue };

        if let Err(err) = handler.run().await {
            tracing::error!(%step, error = %err, "shutdown step failed");
            failures.push((step, err));
        }
    }

    if failures.is_empty() {
        tracing::info!("gRPC server shutdown complete");
        Ok(())
    } else {
        Err(ShutdownError { failures })
    }
}

/// Serve until `signal` resolves, then run [`graceful_shutdown`].
///
/// ```ignore
/// run_until(&server, shutdown_signal()).await?;
/// ```
pub async fn run_until<F>(server: &Server, signal: F) -> Result<(), Error>
where
    F: Future<Output = ()>,
{
    let serve = server.serve();
    tokio::pin!(serve);

    tokio::select! {
        result = &mut serve => return result.map_err(Error::from),
        _ = signal => {}
    }

    let (served, shutdown) = tokio::join!(serve, graceful_shutdown(server));
    served?;
    shutdown?;
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
