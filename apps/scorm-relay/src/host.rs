//! Receiving side of the bridge. Lives in the host page next to the tracking
//! runtime and relays commands from embedded content into the session.

use std::{fmt, future::Future, str::FromStr};

use metrics::counter;
use relay_proto::{classify, AckEnvelope, Classified, Command, CommandEnvelope, Envelope};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::origin::OriginAllowList;
use crate::session::{InitOutcome, Session, SessionError, TerminateOutcome};
use crate::window::{EventReceiver, MessageEvent, TargetOrigin, WindowPort};

pub const COMPLETION_RECORDED: &str = "Completion recorded";
pub const COMPLETION_FAILED: &str = "Failed to record completion";
pub const PONG: &str = "pong";

/// Where acknowledgments may be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckTarget {
    /// Post with `"*"`; the ack carries nothing the content did not send.
    #[default]
    Any,
    /// Post only to the origin the command came from.
    SenderOrigin,
}

impl AckTarget {
    fn target_for(&self, event: &MessageEvent) -> TargetOrigin {
        match self {
            AckTarget::Any => TargetOrigin::Any,
            AckTarget::SenderOrigin => TargetOrigin::Exact(event.origin.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown ack target {0:?}, expected `any` or `sender`")]
pub struct UnknownAckTarget(pub String);

impl FromStr for AckTarget {
    type Err = UnknownAckTarget;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "any" | "*" => Ok(AckTarget::Any),
            "sender" | "sender-origin" => Ok(AckTarget::SenderOrigin),
            other => Err(UnknownAckTarget(other.to_owned())),
        }
    }
}

impl fmt::Display for AckTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckTarget::Any => f.write_str("any"),
            AckTarget::SenderOrigin => f.write_str("sender"),
        }
    }
}

/// Why an inbound message got no reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    UntrustedOrigin,
    /// Unrelated cross-window traffic, including stray acks.
    NotACommand,
    MalformedEnvelope,
}

impl DropReason {
    pub fn metric_label(&self) -> &'static str {
        match self {
            DropReason::UntrustedOrigin => "untrusted_origin",
            DropReason::NotACommand => "not_a_command",
            DropReason::MalformedEnvelope => "malformed_envelope",
        }
    }
}

/// What `on_message` did with one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Dropped(DropReason),
    Acknowledged(AckEnvelope),
    /// Handled, but the reply could not be delivered.
    Unroutable(AckEnvelope),
}

pub struct HostBridge {
    allow_list: OriginAllowList,
    ack_target: AckTarget,
    session: Session,
}

impl HostBridge {
    pub fn new(allow_list: OriginAllowList, session: Session) -> Self {
        Self {
            allow_list,
            ack_target: AckTarget::default(),
            session,
        }
    }

    pub fn with_ack_target(mut self, ack_target: AckTarget) -> Self {
        self.ack_target = ack_target;
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn allow_list(&self) -> &OriginAllowList {
        &self.allow_list
    }

    /// Opens the tracking session. Failure leaves the bridge running in
    /// untracked mode.
    pub fn start(&mut self) -> Result<InitOutcome, SessionError> {
        let outcome = self.session.initialize();
        match &outcome {
            Ok(outcome) => info!(?outcome, "host bridge started"),
            Err(err) => warn!(error = %err, "host bridge started without tracking"),
        }
        outcome
    }

    /// Page teardown.
    pub fn shutdown(&mut self) -> TerminateOutcome {
        let outcome = self.session.terminate();
        info!(?outcome, "host bridge shut down");
        outcome
    }

    pub fn on_message(&mut self, event: &MessageEvent) -> Dispatch {
        if !self.allow_list.is_allowed(&event.origin) {
            debug!(origin = %event.origin, "blocked message from untrusted origin");
            return dropped(DropReason::UntrustedOrigin);
        }

        let command = match classify(&event.data) {
            Classified::Envelope(Envelope::Command(command)) => command,
            Classified::Envelope(Envelope::Ack(_)) | Classified::Foreign => {
                debug!(origin = %event.origin, "ignoring non-command message");
                return dropped(DropReason::NotACommand);
            }
            Classified::Malformed { tag, error } => {
                debug!(origin = %event.origin, tag, %error, "ignoring malformed bridge message");
                return dropped(DropReason::MalformedEnvelope);
            }
        };

        debug!(
            origin = %event.origin,
            command = %command.command,
            id = ?command.id,
            "received command"
        );
        let ack = self.handle_command(&command);
        self.reply(event, ack)
    }

    /// Drives events until the inbox closes or `shutdown` resolves, then
    /// terminates the session.
    pub async fn run<F>(&mut self, mut events: EventReceiver, shutdown: F) -> TerminateOutcome
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                maybe_event = events.recv() => match maybe_event {
                    Some(event) => {
                        self.on_message(&event);
                    }
                    None => {
                        debug!("host inbox closed");
                        break;
                    }
                },
                _ = &mut shutdown => {
                    debug!("host shutdown requested");
                    break;
                }
            }
        }
        self.shutdown()
    }

    fn handle_command(&mut self, request: &CommandEnvelope) -> AckEnvelope {
        match &request.command {
            Command::SetCompletion => match self.session.mark_complete() {
                Ok(outcome) => {
                    debug!(?outcome, "completion handled");
                    AckEnvelope::reply_to(request, true, COMPLETION_RECORDED)
                }
                Err(err) => {
                    warn!(error = %err, "failed to record completion");
                    AckEnvelope::reply_to(request, false, COMPLETION_FAILED)
                }
            },
            Command::Ping => AckEnvelope::reply_to(request, true, PONG)
                .with_scorm_available(self.session.api_available()),
            Command::Other(name) => {
                debug!(command = %name, "unknown command");
                AckEnvelope::reply_to(request, false, format!("Unknown command: {name}"))
            }
        }
    }

    fn reply(&self, event: &MessageEvent, ack: AckEnvelope) -> Dispatch {
        let command = ack.command.to_string();
        let Some(source) = event.source.as_ref() else {
            warn!(command = %command, "command has no source window to acknowledge");
            return unroutable(ack, &command);
        };
        let payload = match ack.to_value() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(command = %command, error = %err, "failed to encode acknowledgment");
                return unroutable(ack, &command);
            }
        };
        let target = self.ack_target.target_for(event);
        if let Err(err) = source.post_message(payload, &target) {
            warn!(command = %command, error = %err, "failed to post acknowledgment");
            return unroutable(ack, &command);
        }

        debug!(command = %command, success = ack.success, "sent acknowledgment");
        counter!(
            "scorm_relay_acks_sent_total",
            1,
            "command" => command,
            "success" => ack.success.to_string()
        );
        Dispatch::Acknowledged(ack)
    }
}

fn dropped(reason: DropReason) -> Dispatch {
    counter!(
        "scorm_relay_messages_dropped_total",
        1,
        "reason" => reason.metric_label()
    );
    Dispatch::Dropped(reason)
}

fn unroutable(ack: AckEnvelope, command: &str) -> Dispatch {
    counter!(
        "scorm_relay_acks_unroutable_total",
        1,
        "command" => command.to_owned()
    );
    Dispatch::Unroutable(ack)
}
