//! In-process round trip: a host page embedding the relay, the content frame
//! talking to it, and a recording LMS above both. Backs `scorm-relay demo`.

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::info;

use crate::config::RelayConfig;
use crate::content::{AckOutcome, BridgeObserver, ContentBridge, Direction, SendError};
use crate::host::HostBridge;
use crate::locator::{ApiGlobal, WindowChainDiscovery, WindowGraph};
use crate::recording::{RecordedCall, RecordingTrackingApi};
use crate::session::{Session, TerminateOutcome};
use crate::tracking::{TrackingApi, LESSON_STATUS_KEY};
use crate::window::{channel_pair, WindowPair, WindowPort};

#[derive(Debug, Clone)]
pub struct DemoOptions {
    pub host_origin: String,
    pub content_origin: String,
    /// Install the LMS runtime above the host frame.
    pub with_tracking: bool,
    /// `setCompletion` commands to send after the ping.
    pub completions: usize,
}

impl Default for DemoOptions {
    fn default() -> Self {
        Self {
            host_origin: "https://lms.example.org".into(),
            content_origin: "http://localhost:5500".into(),
            with_tracking: true,
            completions: 2,
        }
    }
}

#[derive(Debug)]
pub struct RoundTripReport {
    pub ping: AckOutcome,
    pub completions: Vec<AckOutcome>,
    pub sent: u64,
    pub acked: u64,
    pub terminate: TerminateOutcome,
    pub lesson_status: Option<String>,
    pub lms_calls: Vec<RecordedCall>,
}

/// Logs what a content page would render.
struct TracingObserver;

impl BridgeObserver for TracingObserver {
    fn counters_changed(&self, sent: u64, acked: u64) {
        info!(sent, acked, "counters");
    }

    fn completion_status(&self, success: bool, message: &str) {
        info!(success, message, "completion status");
    }

    fn log_line(&self, direction: Direction, line: &str) {
        info!(?direction, "{line}");
    }
}

pub async fn run_roundtrip(
    config: &RelayConfig,
    options: &DemoOptions,
) -> Result<RoundTripReport, SendError> {
    let lms = Arc::new(RecordingTrackingApi::new());
    let mut graph = WindowGraph::new();
    let lms_window = graph.add_top();
    let package_frame = graph.add_child(lms_window);
    if options.with_tracking {
        let api: Arc<dyn TrackingApi> = lms.clone();
        graph.install(lms_window, ApiGlobal::Scorm12, api);
    }

    let mut host = HostBridge::new(
        config.allowed_origins.clone(),
        Session::new(WindowChainDiscovery::new(graph, package_frame)),
    )
    .with_ack_target(config.ack_target);
    let _ = host.start();

    let WindowPair {
        parent,
        host_events,
        content_events,
        ..
    } = channel_pair(options.host_origin.as_str(), options.content_origin.as_str());
    let parent: Arc<dyn WindowPort> = parent;
    let content = ContentBridge::new(Some(parent))
        .with_target_origin(config.target_origin.clone())
        .with_ack_timeout(config.ack_timeout)
        .with_observer(Arc::new(TracingObserver));

    let (host_stop, host_stopped) = oneshot::channel::<()>();
    let (content_stop, content_stopped) = oneshot::channel::<()>();

    let driver = async {
        let outcome = drive(&content, options.completions).await;
        let _ = content_stop.send(());
        let _ = host_stop.send(());
        outcome
    };
    let host_loop = host.run(host_events, async {
        let _ = host_stopped.await;
    });
    let content_loop = content.run(content_events, async {
        let _ = content_stopped.await;
    });

    let (driven, terminate, ()) = tokio::join!(driver, host_loop, content_loop);
    let (ping, completions) = driven?;

    Ok(RoundTripReport {
        ping,
        completions,
        sent: content.sent(),
        acked: content.acked(),
        terminate,
        lesson_status: lms.committed_value(LESSON_STATUS_KEY),
        lms_calls: lms.calls(),
    })
}

async fn drive(
    content: &ContentBridge,
    completions: usize,
) -> Result<(AckOutcome, Vec<AckOutcome>), SendError> {
    let ping = content.send_ping()?.wait().await;
    let mut outcomes = Vec::with_capacity(completions);
    for _ in 0..completions {
        outcomes.push(content.send_completion()?.wait().await);
    }
    Ok((ping, outcomes))
}
