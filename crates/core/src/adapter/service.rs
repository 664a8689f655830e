use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use super::codec::{self, TelemetryMessage};
use super::proto;
use super::proto::congestion_control_server::{CongestionControl, CongestionControlServer};
use crate::exchange::{ActionReceiver, ExchangeError, StatePublisher};
use crate::session::SessionBinding;
use crate::stats::{FirstSample, SessionState};

/// Buffered outbound actions per stream.
const ACTION_BUFFER: usize = 16;

type ActionStream = Pin<Box<dyn Stream<Item = Result<proto::Action, Status>> + Send + 'static>>;

#[derive(Debug, Clone)]
pub struct AdapterSettings {
    pub first_sample: FirstSample,
    /// Longest wait for the decision process before a stall is recorded.
    pub action_timeout: Duration,
    /// Longest wait for a session to be bound when a stream opens.
    pub bind_timeout: Duration,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            first_sample: FirstSample::ZeroSentinel,
            action_timeout: Duration::from_secs(30),
            bind_timeout: Duration::from_secs(30),
        }
    }
}

/// The `CongestionControl` RPC service.
#[derive(Clone)]
pub struct TelemetryService {
    binding: Arc<SessionBinding>,
    settings: AdapterSettings,
}

impl TelemetryService {
    pub fn new(binding: Arc<SessionBinding>, settings: AdapterSettings) -> Self {
        Self { binding, settings }
    }

    pub fn into_server(self) -> CongestionControlServer<Self> {
        CongestionControlServer::new(self)
    }

    async fn open_stream<M: TelemetryMessage>(
        &self,
        request: Request<Streaming<M>>,
    ) -> Result<Response<ActionStream>, Status> {
        let peer = request.remote_addr();
        let end = self
            .binding
            .acquire(self.settings.bind_timeout)
            .await
            .ok_or_else(|| {
                tracing::warn!(?peer, shape = M::SHAPE, "No session waiting for telemetry, rejecting stream");
                Status::unavailable("no decision session is waiting for telemetry")
            })?;
        tracing::info!(
            ?peer,
            shape = M::SHAPE,
            generation = self.binding.generation(),
            "Telemetry stream opened"
        );

        let (publisher, actions) = end.split();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (tx, rx) = mpsc::channel(ACTION_BUFFER);

        tokio::spawn(receive_telemetry(
            request.into_inner(),
            publisher,
            self.settings.first_sample,
            shutdown_tx,
            peer,
        ));
        tokio::spawn(send_actions(
            actions,
            tx,
            self.settings.action_timeout,
            shutdown_rx,
        ));

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

#[tonic::async_trait]
impl CongestionControl for TelemetryService {
    type OptimizeCongestionControlStream = ActionStream;

    async fn optimize_congestion_control(
        &self,
        request: Request<Streaming<proto::CommunicationState>>,
    ) -> Result<Response<Self::OptimizeCongestionControlStream>, Status> {
        self.open_stream(request).await
    }

    type StreamParameterUpdatesStream = ActionStream;

    async fn stream_parameter_updates(
        &self,
        request: Request<Streaming<proto::ParameterUpdate>>,
    ) -> Result<Response<Self::StreamParameterUpdatesStream>, Status> {
        self.open_stream(request).await
    }
}

/// Sole owner of the session's statistics for the stream's lifetime.
async fn receive_telemetry<M: TelemetryMessage>(
    mut inbound: Streaming<M>,
    mut publisher: StatePublisher,
    first_sample: FirstSample,
    shutdown: watch::Sender<bool>,
    peer: Option<SocketAddr>,
) {
    let mut state = SessionState::new(first_sample);
    loop {
        let msg = match inbound.message().await {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                tracing::info!(?peer, "Telemetry stream closed by peer");
                break;
            }
            Err(status) => {
                tracing::warn!(?peer, %status, "Telemetry stream failed");
                break;
            }
        };
        for error in msg.apply_to(&mut state) {
            tracing::warn!(?peer, shape = M::SHAPE, %error, "Skipping telemetry field");
        }
        match publisher.publish(state.snapshot()) {
            Ok(seq) => tracing::trace!(seq, "Published snapshot"),
            Err(ExchangeError::Disconnected) | Err(ExchangeError::Timeout) => {
                tracing::info!(?peer, "Decision process detached, closing telemetry stream");
                break;
            }
        }
    }

    if state.mark_finished() && !publisher.is_closed() {
        // surface the lost stream as a finished session
        let _ = publisher.publish(state.snapshot());
    }
    let faults = state.faults().total();
    if faults > 0 {
        tracing::info!(?peer, faults, "Telemetry stream ended with skipped samples");
    }
    let _ = shutdown.send(true);
}

async fn send_actions(
    mut actions: ActionReceiver,
    tx: mpsc::Sender<Result<proto::Action, Status>>,
    timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = tx.closed() => {
                tracing::debug!("Action stream dropped by peer");
                break;
            }
            next = actions.next(timeout) => next,
        };
        match next {
            Ok(action) => {
                tracing::debug!(cwnd = action.cwnd, seq = action.snapshot_seq, "Sending action");
                if tx.send(Ok(codec::action_to_proto(&action))).await.is_err() {
                    break;
                }
            }
            // counted as a stall by the receiver, the supervisor restarts
            Err(ExchangeError::Timeout) => continue,
            Err(ExchangeError::Disconnected) => {
                tracing::debug!("Decision process detached, closing action stream");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{self, SnapshotMode};
    use crate::stats::StatsSnapshot;
    use testresult::TestResult;
    use tokio::task::JoinHandle;

    const ACTION_TIMEOUT: Duration = Duration::from_millis(100);

    struct Forwarder {
        decision: exchange::DecisionEnd,
        publisher: StatePublisher,
        rx: mpsc::Receiver<Result<proto::Action, Status>>,
        shutdown: watch::Sender<bool>,
        handle: JoinHandle<()>,
    }

    fn forwarder() -> Forwarder {
        let (adapter, decision) = exchange::channel(SnapshotMode::Latest);
        let (publisher, actions) = adapter.split();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (tx, rx) = mpsc::channel(ACTION_BUFFER);
        let handle = tokio::spawn(send_actions(actions, tx, ACTION_TIMEOUT, shutdown_rx));
        Forwarder {
            decision,
            publisher,
            rx,
            shutdown,
            handle,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_decision_records_a_single_stall_then_forwards() -> TestResult {
        let mut fwd = forwarder();
        fwd.publisher.publish(StatsSnapshot::default())?;

        tokio::time::sleep(ACTION_TIMEOUT * 4).await;
        assert_eq!(fwd.decision.health().stalls(), 1);
        assert!(fwd.rx.try_recv().is_err());

        fwd.decision.read_state(Duration::from_millis(10))?;
        fwd.decision.submit(3000)?;
        let action = tokio::time::timeout(ACTION_TIMEOUT * 2, fwd.rx.recv())
            .await?
            .ok_or("action stream ended early")??;
        assert_eq!(action.cwnd_update, 3000);
        assert_eq!(fwd.decision.health().stalls(), 1);

        fwd.shutdown.send(true)?;
        tokio::time::timeout(Duration::from_secs(1), fwd.handle).await??;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_without_snapshots_is_not_a_stall() -> TestResult {
        let fwd = forwarder();
        tokio::time::sleep(ACTION_TIMEOUT * 5).await;
        assert_eq!(fwd.decision.health().stalls(), 0);

        fwd.shutdown.send(true)?;
        tokio::time::timeout(Duration::from_secs(1), fwd.handle).await??;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn closed_action_stream_stops_forwarding() -> TestResult {
        let fwd = forwarder();
        drop(fwd.rx);
        tokio::time::timeout(Duration::from_secs(1), fwd.handle).await??;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn detached_decision_stops_forwarding() -> TestResult {
        let fwd = forwarder();
        drop(fwd.decision);
        tokio::time::timeout(Duration::from_secs(1), fwd.handle).await??;
        // the stream ends without an error item
        let mut rx = fwd.rx;
        assert!(rx.recv().await.is_none());
        Ok(())
    }
}
