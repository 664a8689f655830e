//! Server entry point: wires the RPC service, the session binding and the
//! decision loop together.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;

use crate::adapter::TelemetryService;
use crate::config::Config;
use crate::decision::PolicyRunner;
use crate::session::{BindingLauncher, SessionBinding, SessionSupervisor};

/// Extra time granted to the decision loop on top of one state timeout.
const JOIN_GRACE: Duration = Duration::from_secs(1);

/// Serve until ctrl-c or until the decision loop ends.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let addr = config.socket_addr();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    serve_with_shutdown(config, listener, async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        tracing::info!("Received ctrl-c, shutting down");
    })
    .await
}

/// Serve on an already bound listener until `shutdown` resolves or the
/// decision loop ends.
pub async fn serve_with_shutdown<F>(
    config: Config,
    listener: TcpListener,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    let local_addr = listener.local_addr()?;
    let binding = Arc::new(SessionBinding::new());
    let supervisor = SessionSupervisor::new(
        BindingLauncher::new(binding.clone()),
        config.session_settings(),
    );
    let runner = PolicyRunner::spawn(supervisor, config.policy.build())
        .context("failed to start decision loop")?;
    let service = TelemetryService::new(binding, config.adapter_settings());

    tracing::info!(
        addr = %local_addr,
        policy = %config.policy,
        windowed = config.windowed,
        snapshot_mode = ?config.snapshot_mode,
        "Serving congestion control endpoint"
    );

    let signal = async {
        tokio::select! {
            _ = shutdown => {}
            _ = runner.stopped() => tracing::info!("Decision loop ended, shutting down"),
        }
        runner.stop();
    };
    let served = tonic::transport::Server::builder()
        .add_service(service.into_server())
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal)
        .await;

    runner.stop();
    let wait = config.state_timeout() + JOIN_GRACE;
    let joined = tokio::time::timeout(wait, tokio::task::spawn_blocking(move || runner.join())).await;
    match joined {
        Ok(Ok(Ok(counters))) => tracing::info!(
            total_steps = counters.total_steps,
            episodes = counters.num_resets,
            restarts = counters.restarts,
            "Decision loop joined"
        ),
        Ok(Ok(Err(error))) => tracing::warn!(%error, "Decision loop failed"),
        Ok(Err(error)) => tracing::warn!(%error, "Failed to join decision loop"),
        Err(_) => tracing::warn!(?wait, "Decision loop did not stop in time"),
    }

    served.context("telemetry server failed")
}
