//! End-to-end checks over a real gRPC connection: a transport streams
//! telemetry in either shape and gets windows back from a fixed policy.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use marlin::adapter::proto::congestion_control_client::CongestionControlClient;
use marlin::adapter::proto::{CommunicationState, ParameterUpdate};
use marlin::config::Config;
use marlin::decision::PolicySpec;
use marlin::parameters::Parameter;
use testresult::TestResult;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

const FIXED_WINDOW: i64 = 8000;
const ANSWER_TIMEOUT: Duration = Duration::from_secs(5);

struct TestServer {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    async fn start(policy: PolicySpec) -> TestResult<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let config = Config {
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: addr.port(),
            action_timeout_ms: 1000,
            state_timeout_ms: 2000,
            bind_timeout_ms: 2000,
            policy,
            ..Default::default()
        };
        let (shutdown, rx) = oneshot::channel();
        let handle = tokio::spawn(marlin::server::serve_with_shutdown(
            config,
            listener,
            async move {
                let _ = rx.await;
            },
        ));
        Ok(Self {
            addr,
            shutdown,
            handle,
        })
    }

    fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    async fn stop(self) -> TestResult {
        let _ = self.shutdown.send(());
        tokio::time::timeout(Duration::from_secs(10), self.handle).await???;
        Ok(())
    }
}

fn tick(step: i64) -> CommunicationState {
    CommunicationState {
        curr_window_size: 4000,
        cumulative_sent_bytes: 1444 * step,
        cumulative_rcv_bytes: 1444 * step,
        cumulative_sent_good_bytes: 1444 * step,
        last_rtt: 20_000,
        timestamp: 1_000_000 * step,
        ..Default::default()
    }
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn tick_stream_receives_fixed_window() -> TestResult {
    let server = TestServer::start(PolicySpec::Fixed(FIXED_WINDOW)).await?;
    let mut client = CongestionControlClient::connect(server.url()).await?;

    let (tx, rx) = mpsc::channel(4);
    tx.send(tick(1)).await?;
    let mut actions = client
        .optimize_congestion_control(ReceiverStream::new(rx))
        .await?
        .into_inner();

    let mut received = Vec::new();
    for step in 2..=4 {
        let action = tokio::time::timeout(ANSWER_TIMEOUT, actions.next())
            .await?
            .ok_or("action stream ended early")??;
        received.push(action.cwnd_update);
        tx.send(tick(step)).await?;
    }
    assert!(received.iter().all(|cwnd| *cwnd == FIXED_WINDOW));

    drop(tx);
    while let Ok(Some(_)) = tokio::time::timeout(ANSWER_TIMEOUT, actions.next()).await {}
    drop(actions);
    drop(client);
    server.stop().await
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn event_stream_window_is_clamped() -> TestResult {
    let server = TestServer::start(PolicySpec::Fixed(1_000_000)).await?;
    let mut client = CongestionControlClient::connect(server.url()).await?;

    let update = |parameter: Parameter, value: f64, step: i64| ParameterUpdate {
        parameter: parameter.id(),
        value,
        timestamp: 1_000_000 * step,
    };

    let (tx, rx) = mpsc::channel(8);
    tx.send(update(Parameter::CurrWindowSize, 4000.0, 1)).await?;
    let mut actions = client
        .stream_parameter_updates(ReceiverStream::new(rx))
        .await?
        .into_inner();

    let action = tokio::time::timeout(ANSWER_TIMEOUT, actions.next())
        .await?
        .ok_or("action stream ended early")??;
    assert_eq!(action.cwnd_update, marlin::decision::MAX_CWND_BYTES);

    // unknown identifiers are skipped without closing the stream
    tx.send(ParameterUpdate {
        parameter: 9999,
        value: 1.0,
        timestamp: 2_000_000,
    })
    .await?;
    tx.send(update(Parameter::SentBytes, 1444.0, 3)).await?;
    let action = tokio::time::timeout(ANSWER_TIMEOUT, actions.next())
        .await?
        .ok_or("action stream ended early")??;
    assert_eq!(action.cwnd_update, marlin::decision::MAX_CWND_BYTES);

    drop(tx);
    while let Ok(Some(_)) = tokio::time::timeout(ANSWER_TIMEOUT, actions.next()).await {}
    drop(actions);
    drop(client);
    server.stop().await
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn server_stops_on_shutdown_without_clients() -> TestResult {
    let server = TestServer::start(PolicySpec::Hold).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    server.stop().await
}
