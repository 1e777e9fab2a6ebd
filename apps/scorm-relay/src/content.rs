//! Sending side of the bridge, running inside the embedded content.
//!
//! Posting is fire-and-forget. Every send registers a pending entry that a
//! later acknowledgment resolves; callers that care await
//! [`PendingAck::wait`], which gives up after the configured timeout.

use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use metrics::counter;
use parking_lot::Mutex;
use relay_proto::{
    classify, AckEnvelope, Classified, Command, CommandEnvelope, CorrelationId, Envelope, ACK_TAG,
};
use thiserror::Error;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::window::{EventReceiver, MessageEvent, PostError, TargetOrigin, WindowPort};

pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SendError {
    #[error("not in an iframe, there is no parent window to send to")]
    NotInIframe,
    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Post(#[from] PostError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

/// Optional UI hooks. Every method defaults to doing nothing.
pub trait BridgeObserver: Send + Sync {
    fn counters_changed(&self, _sent: u64, _acked: u64) {}

    /// Called for each `setCompletion` acknowledgment.
    fn completion_status(&self, _success: bool, _message: &str) {}

    fn log_line(&self, _direction: Direction, _line: &str) {}
}

#[derive(Debug, Clone, PartialEq)]
pub enum AckOutcome {
    Acknowledged(AckEnvelope),
    /// No acknowledgment within the timeout, or the bridge went away.
    Unacknowledged {
        command: Command,
        id: CorrelationId,
    },
}

impl AckOutcome {
    pub fn ack(&self) -> Option<&AckEnvelope> {
        match self {
            AckOutcome::Acknowledged(ack) => Some(ack),
            AckOutcome::Unacknowledged { .. } => None,
        }
    }
}

struct PendingEntry {
    command: Command,
    reply: oneshot::Sender<AckEnvelope>,
}

/// In-flight requests keyed by id, with send order kept for id-less acks.
#[derive(Default)]
struct PendingTable {
    entries: HashMap<CorrelationId, PendingEntry>,
    order: VecDeque<CorrelationId>,
}

impl PendingTable {
    fn insert(&mut self, id: CorrelationId, command: Command) -> oneshot::Receiver<AckEnvelope> {
        let (reply, rx) = oneshot::channel();
        self.order.push_back(id.clone());
        self.entries.insert(id, PendingEntry { command, reply });
        rx
    }

    fn remove(&mut self, id: &CorrelationId) -> Option<PendingEntry> {
        let entry = self.entries.remove(id)?;
        self.order.retain(|queued| queued != id);
        Some(entry)
    }

    /// Echoed id wins. Without one, the oldest request for the same command
    /// takes the ack; two outstanding requests of one command cannot be told
    /// apart in that case.
    fn take_match(&mut self, ack: &AckEnvelope) -> Option<PendingEntry> {
        if let Some(id) = &ack.id {
            return self.remove(id);
        }
        let id = self
            .order
            .iter()
            .find(|id| {
                self.entries
                    .get(*id)
                    .is_some_and(|entry| entry.command == ack.command)
            })
            .cloned()?;
        self.remove(&id)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Handle on one sent command.
pub struct PendingAck {
    id: CorrelationId,
    command: Command,
    rx: oneshot::Receiver<AckEnvelope>,
    timeout: Duration,
    pending: Arc<Mutex<PendingTable>>,
}

impl PendingAck {
    pub fn id(&self) -> &CorrelationId {
        &self.id
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    /// Waits up to the bridge's ack timeout. The pending entry is released
    /// either way.
    pub async fn wait(mut self) -> AckOutcome {
        match tokio::time::timeout(self.timeout, &mut self.rx).await {
            Ok(Ok(ack)) => AckOutcome::Acknowledged(ack),
            Ok(Err(_)) => {
                debug!(id = %self.id, command = %self.command, "bridge dropped before acknowledgment");
                self.unacknowledged()
            }
            Err(_) => {
                warn!(
                    id = %self.id,
                    command = %self.command,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "no acknowledgment before timeout"
                );
                counter!(
                    "scorm_relay_acks_timed_out_total",
                    1,
                    "command" => self.command.to_string()
                );
                self.unacknowledged()
            }
        }
    }

    fn unacknowledged(&self) -> AckOutcome {
        AckOutcome::Unacknowledged {
            command: self.command.clone(),
            id: self.id.clone(),
        }
    }
}

impl Drop for PendingAck {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

pub struct ContentBridge {
    parent: Option<Arc<dyn WindowPort>>,
    target_origin: TargetOrigin,
    ack_timeout: Duration,
    observer: Option<Arc<dyn BridgeObserver>>,
    pending: Arc<Mutex<PendingTable>>,
    sent: AtomicU64,
    acked: AtomicU64,
    sequence: AtomicU64,
}

impl ContentBridge {
    /// `parent` is `None` for a top-level window.
    pub fn new(parent: Option<Arc<dyn WindowPort>>) -> Self {
        Self {
            parent,
            target_origin: TargetOrigin::Any,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            observer: None,
            pending: Arc::new(Mutex::new(PendingTable::default())),
            sent: AtomicU64::new(0),
            acked: AtomicU64::new(0),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn with_target_origin(mut self, target_origin: TargetOrigin) -> Self {
        self.target_origin = target_origin;
        self
    }

    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn BridgeObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn is_embedded(&self) -> bool {
        self.parent.is_some()
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn acked(&self) -> u64 {
        self.acked.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn send_completion(&self) -> Result<PendingAck, SendError> {
        debug!("sending completion signal");
        self.send_command(CommandEnvelope::new(Command::SetCompletion).with_data("status", "completed"))
    }

    pub fn send_ping(&self) -> Result<PendingAck, SendError> {
        debug!("sending ping");
        self.send_command(CommandEnvelope::new(Command::Ping))
    }

    /// Stamps `request` with a timestamp (unless it has one) and a fresh
    /// correlation id, then posts it to the parent.
    pub fn send_command(&self, mut request: CommandEnvelope) -> Result<PendingAck, SendError> {
        let Some(parent) = self.parent.as_ref() else {
            warn!(command = %request.command, "not in an iframe, cannot send to parent");
            return Err(SendError::NotInIframe);
        };

        let now = OffsetDateTime::now_utc();
        if !request.data.contains_key("timestamp") {
            if let Ok(stamp) = now.format(&Rfc3339) {
                request.data.insert("timestamp".into(), stamp.into());
            }
        }
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let unix_ms = (now.unix_timestamp_nanos() / 1_000_000) as i64;
        let id = CorrelationId::compose(unix_ms, sequence);
        request.id = Some(id.clone());
        let payload = request.to_value()?;

        let command = request.command.clone();
        let rx = self.pending.lock().insert(id.clone(), command.clone());
        if let Err(err) = parent.post_message(payload, &self.target_origin) {
            self.pending.lock().remove(&id);
            warn!(command = %command, error = %err, "failed to post to parent");
            return Err(err.into());
        }

        let sent = self.sent.fetch_add(1, Ordering::Relaxed) + 1;
        counter!("scorm_relay_commands_sent_total", 1, "command" => command.to_string());
        debug!(id = %id, command = %command, target_origin = %self.target_origin, "sent to parent");
        if let Some(observer) = &self.observer {
            observer.counters_changed(sent, self.acked());
            let data = serde_json::Value::Object(request.data).to_string();
            observer.log_line(Direction::Sent, &format!("{command}: {data}"));
        }

        Ok(PendingAck {
            id,
            command,
            rx,
            timeout: self.ack_timeout,
            pending: Arc::clone(&self.pending),
        })
    }

    /// Takes any acknowledgment, whatever its origin, and resolves the
    /// matching pending request if there is one.
    ///
    /// Every message tagged `SCORM_ACK` counts as received, even one that
    /// does not decode; such a message resolves nothing.
    pub fn handle_message(&self, event: &MessageEvent) -> Option<AckEnvelope> {
        let ack = match classify(&event.data) {
            Classified::Envelope(Envelope::Ack(ack)) => ack,
            Classified::Malformed {
                tag: ACK_TAG,
                error,
            } => {
                debug!(origin = %event.origin, %error, "malformed acknowledgment, counted but not matched");
                let acked = self.acked.fetch_add(1, Ordering::Relaxed) + 1;
                counter!("scorm_relay_acks_malformed_total", 1);
                if let Some(observer) = &self.observer {
                    observer.counters_changed(self.sent(), acked);
                    observer.log_line(Direction::Received, &format!("Malformed ACK: {error}"));
                }
                return None;
            }
            Classified::Malformed { tag, error } => {
                debug!(origin = %event.origin, tag, %error, "ignoring malformed bridge message");
                return None;
            }
            _ => {
                trace!(origin = %event.origin, "not an acknowledgment, ignoring");
                return None;
            }
        };

        let acked = self.acked.fetch_add(1, Ordering::Relaxed) + 1;
        counter!(
            "scorm_relay_acks_received_total",
            1,
            "command" => ack.command.to_string(),
            "success" => ack.success.to_string()
        );
        if let Some(observer) = &self.observer {
            observer.counters_changed(self.sent(), acked);
            let verdict = if ack.success { "ok" } else { "failed" };
            observer.log_line(
                Direction::Received,
                &format!("ACK for {}: {} {}", ack.command, verdict, ack.message),
            );
        }

        match &ack.command {
            Command::SetCompletion => {
                if let Some(observer) = &self.observer {
                    observer.completion_status(ack.success, &ack.message);
                }
            }
            Command::Ping => {
                debug!(scorm_available = ?ack.scorm_available, "pong received, host is listening");
            }
            Command::Other(name) => debug!(command = %name, "acknowledgment for unknown command"),
        }

        let entry = self.pending.lock().take_match(&ack);
        match entry {
            Some(entry) => {
                if entry.reply.send(ack.clone()).is_err() {
                    trace!(command = %ack.command, "waiter already gone");
                }
            }
            None => debug!(command = %ack.command, id = ?ack.id, "acknowledgment matches no pending request"),
        }
        Some(ack)
    }

    /// Drives inbound events until the inbox closes or `shutdown` resolves.
    pub async fn run<F>(&self, mut events: EventReceiver, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                maybe_event = events.recv() => match maybe_event {
                    Some(event) => {
                        self.handle_message(&event);
                    }
                    None => break,
                },
                _ = &mut shutdown => break,
            }
        }
        debug!(sent = self.sent(), acked = self.acked(), "content bridge stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::{channel_pair, WindowPair};
    use serde_json::json;

    const HOST: &str = "https://lms.example";
    const CONTENT: &str = "https://content.example";

    #[derive(Default)]
    struct Recorder {
        counters: Mutex<Vec<(u64, u64)>>,
        statuses: Mutex<Vec<(bool, String)>>,
        lines: Mutex<Vec<(Direction, String)>>,
    }

    impl BridgeObserver for Recorder {
        fn counters_changed(&self, sent: u64, acked: u64) {
            self.counters.lock().push((sent, acked));
        }

        fn completion_status(&self, success: bool, message: &str) {
            self.statuses.lock().push((success, message.to_owned()));
        }

        fn log_line(&self, direction: Direction, line: &str) {
            self.lines.lock().push((direction, line.to_owned()));
        }
    }

    fn embedded() -> (ContentBridge, WindowPair) {
        let pair = channel_pair(HOST, CONTENT);
        let parent: Arc<dyn WindowPort> = pair.parent.clone();
        (ContentBridge::new(Some(parent)), pair)
    }

    fn ack_event(data: serde_json::Value) -> MessageEvent {
        MessageEvent::new(HOST, data)
    }

    #[test]
    fn top_level_window_cannot_send() {
        let bridge = ContentBridge::new(None);
        assert!(matches!(bridge.send_ping(), Err(SendError::NotInIframe)));
        assert!(matches!(bridge.send_completion(), Err(SendError::NotInIframe)));
        assert_eq!(bridge.sent(), 0);
        assert!(!bridge.is_embedded());
    }

    #[test]
    fn completion_envelope_shape() {
        let (bridge, mut pair) = embedded();
        let pending = bridge.send_completion().expect("send");

        let posted = pair.host_events.try_recv().expect("posted");
        assert_eq!(posted.origin, CONTENT);
        assert_eq!(posted.data["type"], "SCORM_COMMAND");
        assert_eq!(posted.data["command"], "setCompletion");
        assert_eq!(posted.data["data"]["status"], "completed");
        let stamp = posted.data["data"]["timestamp"].as_str().expect("timestamp");
        assert!(OffsetDateTime::parse(stamp, &Rfc3339).is_ok());
        assert_eq!(posted.data["id"], json!(pending.id().as_str()));
        assert!(pending.id().as_str().starts_with("msg_"));
        assert!(pending.id().as_str().ends_with("_1"));
        assert_eq!(bridge.sent(), 1);
        assert_eq!(bridge.pending(), 1);
    }

    #[test]
    fn closed_parent_is_reported_and_not_counted() {
        let WindowPair {
            parent,
            host_events,
            ..
        } = channel_pair(HOST, CONTENT);
        drop(host_events);
        let parent: Arc<dyn WindowPort> = parent;
        let bridge = ContentBridge::new(Some(parent));
        assert!(matches!(bridge.send_ping(), Err(SendError::Post(PostError::Closed))));
        assert_eq!(bridge.sent(), 0);
        assert_eq!(bridge.pending(), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn ack_with_id_resolves_its_request() {
        let (bridge, _pair) = embedded();
        let first = bridge.send_ping().expect("send");
        let second = bridge.send_ping().expect("send");

        let ack = AckEnvelope::new(Command::Ping, true, "pong").with_scorm_available(true);
        let ack = AckEnvelope {
            id: Some(second.id().clone()),
            ..ack
        };
        bridge.handle_message(&ack_event(ack.to_value().expect("encode")));

        assert_eq!(second.wait().await.ack(), Some(&ack));
        assert_eq!(bridge.pending(), 1);
        drop(first);
        assert_eq!(bridge.pending(), 0);
        assert_eq!(bridge.acked(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn legacy_ack_resolves_oldest_request_of_that_command() {
        let (bridge, _pair) = embedded();
        let first = bridge.send_completion().expect("send");
        let ping = bridge.send_ping().expect("send");
        let second = bridge.send_completion().expect("send");

        bridge.handle_message(&ack_event(json!({
            "type": "SCORM_ACK",
            "command": "setCompletion",
            "success": true,
            "message": "Completion recorded"
        })));

        // Both completions look identical without an id; the older one wins.
        assert!(matches!(first.wait().await, AckOutcome::Acknowledged(_)));
        assert_eq!(bridge.pending(), 2);
        drop(ping);
        drop(second);
    }

    #[test_timeout::tokio_timeout_test]
    async fn unknown_id_resolves_nothing() {
        let (bridge, _pair) = embedded();
        let _pending = bridge.send_ping().expect("send");
        let acked = bridge.handle_message(&ack_event(json!({
            "type": "SCORM_ACK",
            "command": "ping",
            "success": true,
            "message": "pong",
            "id": "msg_0_99"
        })));
        assert!(acked.is_some());
        assert_eq!(bridge.acked(), 1);
        assert_eq!(bridge.pending(), 1);
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn missing_ack_times_out_as_unacknowledged() {
        let (bridge, _pair) = embedded();
        let bridge = bridge.with_ack_timeout(Duration::from_secs(5));
        let pending = bridge.send_completion().expect("send");
        let id = pending.id().clone();

        let started = tokio::time::Instant::now();
        let outcome = pending.wait().await;
        assert_eq!(
            outcome,
            AckOutcome::Unacknowledged {
                command: Command::SetCompletion,
                id,
            }
        );
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(bridge.pending(), 0);
    }

    #[test]
    fn non_ack_traffic_is_ignored() {
        let (bridge, _pair) = embedded();
        for data in [
            json!({"type": "SCORM_COMMAND", "command": "ping"}),
            json!({"type": "SCORM_COMMAND"}),
            json!({"hello": "world"}),
        ] {
            assert!(bridge.handle_message(&ack_event(data)).is_none());
        }
        assert_eq!(bridge.acked(), 0);
    }

    #[test]
    fn malformed_ack_is_counted_but_resolves_nothing() {
        let (bridge, _pair) = embedded();
        let recorder = Arc::new(Recorder::default());
        let observer: Arc<dyn BridgeObserver> = recorder.clone();
        let bridge = bridge.with_observer(observer);
        let pending = bridge.send_ping().expect("send");

        let resolved = bridge.handle_message(&ack_event(json!({"type": "SCORM_ACK", "command": "ping"})));

        assert!(resolved.is_none());
        assert_eq!(bridge.acked(), 1);
        assert_eq!(bridge.pending(), 1);
        assert_eq!(*recorder.counters.lock(), vec![(1, 0), (1, 1)]);
        assert!(recorder.lines.lock()[1].1.starts_with("Malformed ACK: "));
        drop(pending);
    }

    #[test]
    fn observer_sees_counters_status_and_log() {
        let (bridge, _pair) = embedded();
        let recorder = Arc::new(Recorder::default());
        let observer: Arc<dyn BridgeObserver> = recorder.clone();
        let bridge = bridge.with_observer(observer);

        let pending = bridge.send_completion().expect("send");
        bridge.handle_message(&ack_event(json!({
            "type": "SCORM_ACK",
            "command": "setCompletion",
            "success": false,
            "message": "Failed to record completion"
        })));
        drop(pending);

        assert_eq!(*recorder.counters.lock(), vec![(1, 0), (1, 1)]);
        assert_eq!(
            *recorder.statuses.lock(),
            vec![(false, "Failed to record completion".to_owned())]
        );
        let lines = recorder.lines.lock();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].0, Direction::Sent);
        assert!(lines[0].1.starts_with("setCompletion: {"));
        assert_eq!(
            lines[1],
            (
                Direction::Received,
                "ACK for setCompletion: failed Failed to record completion".to_owned()
            )
        );
    }
}
